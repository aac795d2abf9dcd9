//! Discretisation of global points into voxel indices.
//!
//! Each axis of a [`MapDefinition`] is split by `linspace(min, max, div)` bin
//! edges.  A coordinate maps to "number of edges `<= v`, minus one":
//!
//! - values at or below `min` collapse into index `0`;
//! - a value exactly at `max` lands in index `div - 1`;
//! - a value above `max` is a map-bounds violation and fails the batch.
//!
//! Duplicate index triples can then be folded into `(index, count)` pairs by
//! [`compress`].

use std::collections::BTreeMap;

use nalgebra::Point3;
use serde::{Deserialize, Serialize};
use tracing::trace;
use voxmap_types::{Axis, MapDefinition, MapError, VoxelBatch};

// ────────────────────────────────────────────────────────────────────────────
// Bin edges
// ────────────────────────────────────────────────────────────────────────────

/// `n` evenly spaced values from `start` to `stop`, both included.
pub fn linspace(start: f64, stop: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (stop - start) / (n - 1) as f64;
            let mut edges: Vec<f64> = (0..n).map(|i| start + step * i as f64).collect();
            // Pin the last edge so `max` digitizes to `div - 1` exactly.
            edges[n - 1] = stop;
            edges
        }
    }
}

/// Number of elements of the sorted slice `edges` that are `<= value`.
pub fn searchsorted_right(edges: &[f64], value: f64) -> usize {
    edges.partition_point(|&e| e <= value)
}

/// The three bin-edge arrays of a map, fixed at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinEdges {
    edges: [Vec<f64>; 3],
}

impl BinEdges {
    /// # Errors
    ///
    /// Returns [`MapError::InvalidMapDefinition`] when `definition` fails
    /// [`MapDefinition::validate`].
    pub fn from_definition(definition: &MapDefinition) -> Result<Self, MapError> {
        definition.validate()?;
        let mins = definition.mins();
        let maxs = definition.maxs();
        let divs = definition.divisions();
        Ok(Self {
            edges: [0, 1, 2].map(|a| linspace(mins[a], maxs[a], divs[a])),
        })
    }

    pub fn axis(&self, axis: Axis) -> &[f64] {
        &self.edges[axis.index()]
    }

    pub fn divisions(&self) -> [usize; 3] {
        [0, 1, 2].map(|a| self.edges[a].len())
    }

    pub fn min(&self, axis: Axis) -> f64 {
        self.edges[axis.index()][0]
    }

    pub fn max(&self, axis: Axis) -> f64 {
        let e = &self.edges[axis.index()];
        e[e.len() - 1]
    }

    /// `true` when `p` lies inside `[min, max]` on every axis.
    pub fn contains(&self, p: &Point3<f64>) -> bool {
        Axis::ALL
            .iter()
            .all(|&axis| p[axis.index()] >= self.min(axis) && p[axis.index()] <= self.max(axis))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// discretize / compress
// ────────────────────────────────────────────────────────────────────────────

/// Digitize every point against `bins`.
///
/// # Errors
///
/// - [`MapError::NonFinite`] if any coordinate is NaN or infinite.
/// - [`MapError::PointOutOfBounds`] if any coordinate exceeds its axis
///   maximum.
///
/// Either error rejects the whole call; no partial output is returned.
pub fn discretize(points: &[Point3<f64>], bins: &BinEdges) -> Result<Vec<[u16; 3]>, MapError> {
    let mut out = Vec::with_capacity(points.len());
    for p in points {
        let mut index = [0u16; 3];
        for axis in Axis::ALL {
            let a = axis.index();
            let v = p[a];
            if !v.is_finite() {
                return Err(MapError::NonFinite {
                    stage: "voxelize".to_string(),
                });
            }
            let max = bins.max(axis);
            if v > max {
                return Err(MapError::PointOutOfBounds {
                    axis,
                    value: v,
                    max,
                });
            }
            // At least one edge is <= v unless v < min, which clamps to 0.
            let i = searchsorted_right(bins.axis(axis), v).saturating_sub(1);
            index[a] = u16::try_from(i).map_err(|_| MapError::VoxelOutOfBounds {
                axis,
                index: i,
                divisions: bins.divisions()[a],
            })?;
        }
        out.push(index);
    }
    Ok(out)
}

/// Fold identical index triples into `(index, count)` pairs.
///
/// Output is sorted by index.  A group larger than `u16::MAX` reports
/// `u16::MAX`.
pub fn compress(indices: &[[u16; 3]]) -> VoxelBatch {
    let mut groups: BTreeMap<[u16; 3], u32> = BTreeMap::new();
    for &index in indices {
        *groups.entry(index).or_insert(0) += 1;
    }
    let (voxels, counts): (Vec<_>, Vec<_>) = groups
        .into_iter()
        .map(|(index, n)| (index, u16::try_from(n).unwrap_or(u16::MAX)))
        .unzip();
    VoxelBatch { voxels, counts }
}

// ────────────────────────────────────────────────────────────────────────────
// Voxelizer
// ────────────────────────────────────────────────────────────────────────────

/// Digitize and optionally compress point clouds for one map.
#[derive(Debug, Clone)]
pub struct Voxelizer {
    bins: BinEdges,
    enable_compression: bool,
}

impl Voxelizer {
    pub fn new(bins: BinEdges, enable_compression: bool) -> Self {
        Self {
            bins,
            enable_compression,
        }
    }

    pub fn bins(&self) -> &BinEdges {
        &self.bins
    }

    pub fn compression_enabled(&self) -> bool {
        self.enable_compression
    }

    /// Turn global points into a voxel batch.  With compression disabled
    /// every point becomes its own entry with count 1.
    pub fn voxelize(&self, points: &[Point3<f64>]) -> Result<VoxelBatch, MapError> {
        let indices = discretize(points, &self.bins)?;
        let batch = if self.enable_compression {
            compress(&indices)
        } else {
            VoxelBatch {
                counts: vec![1; indices.len()],
                voxels: indices,
            }
        };
        trace!(points = points.len(), voxels = batch.len(), "voxelized");
        Ok(batch)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

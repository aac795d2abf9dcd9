//! Bounded-weight 3-D occupancy grid.
//!
//! The grid stores one `u16` weight per voxel, shape `(x_div, y_div, z_div)`,
//! allocated once and mutated in place.  Every mutation keeps
//! `0 <= weight <= max_weight`.
//!
//! # Access model
//!
//! Weights sit behind a [`parking_lot::RwLock`].  Writers hold the write lock
//! for the duration of one batch add or one decay pass; queries and snapshot
//! exports hold the read lock for one interpolation pass or one copy.
//!
//! Mutation is only reachable through [`MapWriter`], and
//! [`OccupancyGrid::share`] hands out exactly one of those alongside any
//! number of [`MapReader`]s:
//!
//! ```rust
//! use nalgebra::Point3;
//! use voxmap_perception::{GridParams, OccupancyGrid};
//! use voxmap_types::{MapDefinition, VoxelBatch};
//!
//! let definition = MapDefinition {
//!     x_min: 0.0, y_min: 0.0, z_min: 0.0,
//!     x_max: 1.0, y_max: 1.0, z_max: 1.0,
//!     x_div: 2, y_div: 2, z_div: 2,
//! };
//! let grid = OccupancyGrid::new(definition, GridParams::default()).unwrap();
//! let (mut writer, reader) = grid.share();
//!
//! writer
//!     .apply_batch(&VoxelBatch { voxels: vec![[0, 0, 0]], counts: vec![8] })
//!     .unwrap();
//!
//! // Halfway along x between a weight of 8 and a weight of 0.
//! let v = reader.query(&[Point3::new(0.5, 0.0, 0.0)]);
//! assert!((v[0] - 4.0).abs() < 1e-9);
//! ```

use std::ops::Deref;
use std::sync::Arc;

use nalgebra::Point3;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;
use voxmap_types::{Axis, MapDefinition, MapError, VoxelBatch};

use crate::voxelize::{BinEdges, searchsorted_right};

fn default_max_weight() -> u16 {
    2000
}

fn default_hit_gain() -> u16 {
    1
}

/// Weight limits of an [`OccupancyGrid`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridParams {
    /// Upper clip bound of every cell.
    #[serde(default = "default_max_weight")]
    pub max_weight: u16,
    /// Weight added per recorded hit.
    #[serde(default = "default_hit_gain")]
    pub hit_gain: u16,
}

impl Default for GridParams {
    fn default() -> Self {
        Self {
            max_weight: default_max_weight(),
            hit_gain: default_hit_gain(),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// OccupancyGrid
// ────────────────────────────────────────────────────────────────────────────

/// The persistent map.  Read accessors are public; mutation goes through
/// [`MapWriter`].
#[derive(Debug)]
pub struct OccupancyGrid {
    definition: MapDefinition,
    params: GridParams,
    bins: BinEdges,
    shape: [usize; 3],
    cells: RwLock<Vec<u16>>,
}

impl OccupancyGrid {
    /// Allocate a zero-filled grid for `definition`.
    ///
    /// # Errors
    ///
    /// - [`MapError::InvalidMapDefinition`] if the definition is invalid.
    /// - [`MapError::Config`] if `params.max_weight` is zero.
    pub fn new(definition: MapDefinition, params: GridParams) -> Result<Self, MapError> {
        let bins = BinEdges::from_definition(&definition)?;
        if params.max_weight == 0 {
            return Err(MapError::Config("max_weight must be at least 1".to_string()));
        }
        let shape = definition.divisions();
        let len = definition.cell_count();
        debug!(?shape, max_weight = params.max_weight, "allocating occupancy grid");
        let mut cells = Vec::new();
        cells.try_reserve_exact(len).map_err(|e| {
            MapError::InvalidMapDefinition(format!("cannot allocate {len} cells: {e}"))
        })?;
        cells.resize(len, 0);
        Ok(Self {
            definition,
            params,
            bins,
            shape,
            cells: RwLock::new(cells),
        })
    }

    /// Split the grid into its unique writer and a cloneable reader.
    pub fn share(self) -> (MapWriter, MapReader) {
        let grid = Arc::new(self);
        (
            MapWriter {
                grid: Arc::clone(&grid),
            },
            MapReader { grid },
        )
    }

    pub fn definition(&self) -> &MapDefinition {
        &self.definition
    }

    pub fn params(&self) -> GridParams {
        self.params
    }

    pub fn bins(&self) -> &BinEdges {
        &self.bins
    }

    pub fn shape(&self) -> [usize; 3] {
        self.shape
    }

    fn offset(&self, [i, j, k]: [usize; 3]) -> usize {
        (i * self.shape[1] + j) * self.shape[2] + k
    }

    fn check_index(&self, index: [usize; 3]) -> Result<(), MapError> {
        for axis in Axis::ALL {
            let a = axis.index();
            if index[a] >= self.shape[a] {
                return Err(MapError::VoxelOutOfBounds {
                    axis,
                    index: index[a],
                    divisions: self.shape[a],
                });
            }
        }
        Ok(())
    }

    /// Weight of one cell, `None` outside the grid.
    pub fn weight_at(&self, index: [usize; 3]) -> Option<u16> {
        self.check_index(index).ok()?;
        Some(self.cells.read()[self.offset(index)])
    }

    /// Sum of all cell weights.
    pub fn total_weight(&self) -> u64 {
        self.cells.read().iter().map(|&w| u64::from(w)).sum()
    }

    /// Number of cells with non-zero weight.
    pub fn occupied_cells(&self) -> usize {
        self.cells.read().iter().filter(|&&w| w > 0).count()
    }

    // ── Queries ──────────────────────────────────────────────────────────────

    /// Trilinear interpolation of the weights at each point.
    ///
    /// Cell weights are located at the grid points formed by the bin edges.
    /// A point outside `[min, max]` on any axis, or with a non-finite
    /// coordinate, yields `NaN`.
    pub fn query(&self, points: &[Point3<f64>]) -> Vec<f64> {
        let cells = self.cells.read();
        points.iter().map(|p| self.interpolate(&cells, p)).collect()
    }

    fn interpolate(&self, cells: &[u16], p: &Point3<f64>) -> f64 {
        if !self.bins.contains(p) {
            return f64::NAN;
        }
        let mut lower = [0usize; 3];
        let mut frac = [0.0f64; 3];
        for axis in Axis::ALL {
            let a = axis.index();
            let edges = self.bins.axis(axis);
            // Lower grid point of the enclosing interval; `max` itself falls
            // into the last interval with frac 1.
            let i = searchsorted_right(edges, p[a])
                .saturating_sub(1)
                .min(edges.len() - 2);
            lower[a] = i;
            frac[a] = (p[a] - edges[i]) / (edges[i + 1] - edges[i]);
        }

        let mut value = 0.0;
        for corner in 0..8usize {
            let mut weight = 1.0;
            let mut index = lower;
            for a in 0..3 {
                if (corner >> a) & 1 == 1 {
                    index[a] += 1;
                    weight *= frac[a];
                } else {
                    weight *= 1.0 - frac[a];
                }
            }
            if weight != 0.0 {
                value += weight * f64::from(cells[self.offset(index)]);
            }
        }
        value
    }

    /// Copy the current weights out.  The read lock is held only for the copy.
    pub fn export_snapshot(&self) -> GridSnapshot {
        let weights = self.cells.read().clone();
        GridSnapshot {
            definition: self.definition,
            params: self.params,
            shape: self.shape,
            edges: self.bins.clone(),
            weights,
        }
    }

    // ── Mutation (reached through MapWriter) ────────────────────────────────

    fn apply_batch(&self, batch: &VoxelBatch) -> Result<usize, MapError> {
        if batch.voxels.len() != batch.counts.len() {
            return Err(MapError::BatchShape {
                voxels: batch.voxels.len(),
                counts: batch.counts.len(),
            });
        }
        let mut offsets = Vec::with_capacity(batch.len());
        for voxel in &batch.voxels {
            let index = voxel.map(usize::from);
            self.check_index(index)?;
            offsets.push(self.offset(index));
        }

        let gain = u32::from(self.params.hit_gain);
        let max = u32::from(self.params.max_weight);
        let mut cells = self.cells.write();
        for (&offset, &count) in offsets.iter().zip(&batch.counts) {
            let cell = &mut cells[offset];
            let added = u32::from(*cell).saturating_add(u32::from(count).saturating_mul(gain));
            *cell = added.min(max) as u16;
        }
        Ok(offsets.len())
    }

    /// Index range of cells whose edge coordinate lies in `[c - h, c + h]`,
    /// already clamped to the grid.
    fn window(&self, axis: Axis, center: f64, half_extent: f64) -> std::ops::Range<usize> {
        let edges = self.bins.axis(axis);
        let lo = edges.partition_point(|&e| e < center - half_extent);
        let hi = edges.partition_point(|&e| e <= center + half_extent);
        lo..hi.max(lo)
    }

    fn decay_window(
        &self,
        center: [f64; 3],
        half_extent: f64,
        decay_amount: u16,
    ) -> Result<usize, MapError> {
        if center.iter().any(|c| !c.is_finite()) {
            return Err(MapError::NonFinite {
                stage: "decay".to_string(),
            });
        }
        if !half_extent.is_finite() || half_extent < 0.0 {
            return Err(MapError::Config(format!(
                "decay half extent must be finite and non-negative, got {half_extent}"
            )));
        }

        let [wx, wy, wz] =
            Axis::ALL.map(|axis| self.window(axis, center[axis.index()], half_extent));
        if wx.is_empty() || wy.is_empty() || wz.is_empty() {
            return Ok(0);
        }

        let max = self.params.max_weight;
        let mut decayed = 0;
        let mut cells = self.cells.write();
        for i in wx {
            for j in wy.clone() {
                let row = self.offset([i, j, 0]);
                for cell in &mut cells[row + wz.start..row + wz.end] {
                    // Saturated cells near the platform are exempt this cycle.
                    if *cell < max && *cell > 0 {
                        *cell = cell.saturating_sub(decay_amount);
                        decayed += 1;
                    }
                }
            }
        }
        Ok(decayed)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Handles
// ────────────────────────────────────────────────────────────────────────────

/// The single handle allowed to mutate a shared grid.  Not `Clone`.
#[derive(Debug)]
pub struct MapWriter {
    grid: Arc<OccupancyGrid>,
}

impl MapWriter {
    /// Add `count * hit_gain` to every listed voxel, clipping at
    /// `max_weight`.  Returns the number of entries applied.
    ///
    /// # Errors
    ///
    /// The batch is rejected before any cell changes if its lengths disagree
    /// ([`MapError::BatchShape`]) or any index is outside the grid
    /// ([`MapError::VoxelOutOfBounds`]).
    pub fn apply_batch(&mut self, batch: &VoxelBatch) -> Result<usize, MapError> {
        self.grid.apply_batch(batch)
    }

    /// Subtract `decay_amount` from every cell below `max_weight` whose grid
    /// point lies within `half_extent` of `center` on every axis, clipping at
    /// zero.  Cells already at `max_weight` are left untouched.  Returns the
    /// number of non-zero cells that were decayed.
    ///
    /// The window is clamped to the grid: one that lies partly or wholly
    /// outside decays only the overlapping cells.
    ///
    /// # Errors
    ///
    /// - [`MapError::NonFinite`] for a non-finite center.
    /// - [`MapError::Config`] for a negative or non-finite half extent.
    pub fn decay_window(
        &mut self,
        center: [f64; 3],
        half_extent: f64,
        decay_amount: u16,
    ) -> Result<usize, MapError> {
        self.grid.decay_window(center, half_extent, decay_amount)
    }

    /// Another reader for the grid this writer mutates.
    pub fn reader(&self) -> MapReader {
        MapReader {
            grid: Arc::clone(&self.grid),
        }
    }
}

impl Deref for MapWriter {
    type Target = OccupancyGrid;

    fn deref(&self) -> &OccupancyGrid {
        &self.grid
    }
}

/// Read-only, cloneable view of a shared grid.
#[derive(Debug, Clone)]
pub struct MapReader {
    grid: Arc<OccupancyGrid>,
}

impl Deref for MapReader {
    type Target = OccupancyGrid;

    fn deref(&self) -> &OccupancyGrid {
        &self.grid
    }
}

// ────────────────────────────────────────────────────────────────────────────
// GridSnapshot
// ────────────────────────────────────────────────────────────────────────────

/// Immutable copy of a grid, for export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridSnapshot {
    pub definition: MapDefinition,
    pub params: GridParams,
    pub shape: [usize; 3],
    pub edges: BinEdges,
    /// Row-major `(x, y, z)` weights.
    pub weights: Vec<u16>,
}

impl GridSnapshot {
    pub fn weight_at(&self, [i, j, k]: [usize; 3]) -> Option<u16> {
        if i >= self.shape[0] || j >= self.shape[1] || k >= self.shape[2] {
            return None;
        }
        self.weights
            .get((i * self.shape[1] + j) * self.shape[2] + k)
            .copied()
    }

    /// Indices and weights of every non-zero cell.
    pub fn occupied(&self) -> Vec<([usize; 3], u16)> {
        let [_, ny, nz] = self.shape;
        self.weights
            .iter()
            .enumerate()
            .filter(|(_, w)| **w > 0)
            .map(|(n, &w)| ([n / (ny * nz), (n / nz) % ny, n % nz], w))
            .collect()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// Edges at 0, 1, 2, 3 on every axis.
    fn def4() -> MapDefinition {
        MapDefinition {
            x_min: 0.0,
            y_min: 0.0,
            z_min: 0.0,
            x_max: 3.0,
            y_max: 3.0,
            z_max: 3.0,
            x_div: 4,
            y_div: 4,
            z_div: 4,
        }
    }

    fn params(max_weight: u16, hit_gain: u16) -> GridParams {
        GridParams {
            max_weight,
            hit_gain,
        }
    }

    fn shared(max_weight: u16, hit_gain: u16) -> (MapWriter, MapReader) {
        OccupancyGrid::new(def4(), params(max_weight, hit_gain))
            .unwrap()
            .share()
    }

    fn batch(voxels: Vec<[u16; 3]>, counts: Vec<u16>) -> VoxelBatch {
        VoxelBatch { voxels, counts }
    }

    // ── Construction ────────────────────────────────────────────────────────

    #[test]
    fn new_grid_is_zero_filled() {
        let grid = OccupancyGrid::new(def4(), GridParams::default()).unwrap();
        assert_eq!(grid.shape(), [4, 4, 4]);
        assert_eq!(grid.total_weight(), 0);
        assert_eq!(grid.weight_at([3, 3, 3]), Some(0));
        assert_eq!(grid.weight_at([4, 0, 0]), None);
    }

    #[test]
    fn zero_max_weight_is_rejected() {
        assert!(matches!(
            OccupancyGrid::new(def4(), params(0, 1)),
            Err(MapError::Config(_))
        ));
    }

    #[test]
    fn oversized_definition_returns_error_instead_of_allocating() {
        let mut def = def4();
        def.x_div = 65_536;
        def.y_div = 65_536;
        def.z_div = 65_536;
        assert!(matches!(
            OccupancyGrid::new(def, GridParams::default()),
            Err(MapError::InvalidMapDefinition(_))
        ));
    }

    #[test]
    fn default_params_match_deployment_values() {
        let p = GridParams::default();
        assert_eq!(p.max_weight, 2000);
        assert_eq!(p.hit_gain, 1);
    }

    // ── apply_batch ─────────────────────────────────────────────────────────

    #[test]
    fn apply_batch_adds_count_times_gain() {
        let (mut w, r) = shared(100, 3);
        w.apply_batch(&batch(vec![[1, 2, 3]], vec![4])).unwrap();
        assert_eq!(r.weight_at([1, 2, 3]), Some(12));
        w.apply_batch(&batch(vec![[1, 2, 3]], vec![1])).unwrap();
        assert_eq!(r.weight_at([1, 2, 3]), Some(15));
    }

    #[test]
    fn apply_batch_clips_at_max_weight() {
        let (mut w, r) = shared(10, 1);
        w.apply_batch(&batch(vec![[0, 0, 0]], vec![u16::MAX])).unwrap();
        assert_eq!(r.weight_at([0, 0, 0]), Some(10));
    }

    #[test]
    fn apply_batch_rejects_out_of_range_index_without_touching_cells() {
        let (mut w, r) = shared(100, 1);
        let err = w
            .apply_batch(&batch(vec![[0, 0, 0], [0, 4, 0]], vec![5, 5]))
            .unwrap_err();
        assert_eq!(
            err,
            MapError::VoxelOutOfBounds {
                axis: Axis::Y,
                index: 4,
                divisions: 4
            }
        );
        assert_eq!(r.total_weight(), 0);
    }

    #[test]
    fn apply_batch_rejects_mismatched_lengths() {
        let (mut w, _) = shared(100, 1);
        assert!(matches!(
            w.apply_batch(&batch(vec![[0, 0, 0]], vec![1, 2])),
            Err(MapError::BatchShape {
                voxels: 1,
                counts: 2
            })
        ));
    }

    // ── decay_window ────────────────────────────────────────────────────────

    #[test]
    fn decay_reduces_cells_inside_window_only() {
        let (mut w, r) = shared(100, 1);
        w.apply_batch(&batch(vec![[0, 0, 0], [3, 3, 3]], vec![50, 50]))
            .unwrap();
        let decayed = w.decay_window([0.0, 0.0, 0.0], 1.5, 20).unwrap();
        assert_eq!(decayed, 1);
        assert_eq!(r.weight_at([0, 0, 0]), Some(30));
        assert_eq!(r.weight_at([3, 3, 3]), Some(50));
    }

    #[test]
    fn decay_clips_at_zero() {
        let (mut w, r) = shared(100, 1);
        w.apply_batch(&batch(vec![[1, 1, 1]], vec![5])).unwrap();
        w.decay_window([1.0, 1.0, 1.0], 0.0, 40).unwrap();
        assert_eq!(r.weight_at([1, 1, 1]), Some(0));
    }

    #[test]
    fn decay_exempts_saturated_cells() {
        let (mut w, r) = shared(20, 1);
        w.apply_batch(&batch(vec![[1, 1, 1], [1, 1, 2]], vec![20, 19]))
            .unwrap();
        w.decay_window([1.0, 1.0, 1.5], 1.0, 5).unwrap();
        assert_eq!(r.weight_at([1, 1, 1]), Some(20));
        assert_eq!(r.weight_at([1, 1, 2]), Some(14));
    }

    #[test]
    fn decay_window_partly_outside_grid_is_clamped() {
        let (mut w, r) = shared(100, 1);
        w.apply_batch(&batch(vec![[3, 0, 0], [2, 0, 0]], vec![10, 10]))
            .unwrap();
        // Window x ∈ [2.5, 4.5] overlaps only the last grid point.
        w.decay_window([3.5, 0.0, 0.0], 1.0, 4).unwrap();
        assert_eq!(r.weight_at([3, 0, 0]), Some(6));
        assert_eq!(r.weight_at([2, 0, 0]), Some(10));
    }

    #[test]
    fn decay_window_wholly_outside_grid_is_noop() {
        let (mut w, r) = shared(100, 1);
        w.apply_batch(&batch(vec![[0, 0, 0]], vec![10])).unwrap();
        assert_eq!(w.decay_window([-50.0, 0.0, 0.0], 2.0, 4).unwrap(), 0);
        assert_eq!(w.decay_window([0.0, 99.0, 0.0], 2.0, 4).unwrap(), 0);
        assert_eq!(r.weight_at([0, 0, 0]), Some(10));
    }

    #[test]
    fn decay_rejects_bad_arguments() {
        let (mut w, _) = shared(100, 1);
        assert!(matches!(
            w.decay_window([f64::NAN, 0.0, 0.0], 1.0, 1),
            Err(MapError::NonFinite { .. })
        ));
        assert!(matches!(
            w.decay_window([0.0, 0.0, 0.0], -1.0, 1),
            Err(MapError::Config(_))
        ));
    }

    // ── query ───────────────────────────────────────────────────────────────

    #[test]
    fn query_at_grid_point_returns_cell_weight() {
        let (mut w, r) = shared(100, 1);
        w.apply_batch(&batch(vec![[1, 2, 3]], vec![40])).unwrap();
        let v = r.query(&[Point3::new(1.0, 2.0, 3.0), Point3::new(0.0, 0.0, 0.0)]);
        assert!((v[0] - 40.0).abs() < 1e-9);
        assert!(v[1].abs() < 1e-9);
    }

    #[test]
    fn query_interpolates_trilinearly() {
        let (mut w, r) = shared(1000, 1);
        w.apply_batch(&batch(vec![[1, 1, 1], [2, 2, 2]], vec![80, 160]))
            .unwrap();
        // Centre of the unit cube with corners (1,1,1)..(2,2,2): each corner
        // weighs 1/8.
        let v = r.query(&[Point3::new(1.5, 1.5, 1.5)]);
        assert!((v[0] - 30.0).abs() < 1e-9, "got {}", v[0]);
        // Quarter of the way along x from (1,1,1).
        let v = r.query(&[Point3::new(1.25, 1.0, 1.0)]);
        assert!((v[0] - 60.0).abs() < 1e-9, "got {}", v[0]);
    }

    #[test]
    fn query_on_upper_bound_uses_last_grid_point() {
        let (mut w, r) = shared(100, 1);
        w.apply_batch(&batch(vec![[3, 3, 3]], vec![9])).unwrap();
        let v = r.query(&[Point3::new(3.0, 3.0, 3.0)]);
        assert!((v[0] - 9.0).abs() < 1e-9);
    }

    #[test]
    fn query_outside_bounds_is_nan() {
        let (_, r) = shared(100, 1);
        let v = r.query(&[
            Point3::new(-0.001, 1.0, 1.0),
            Point3::new(1.0, 3.001, 1.0),
            Point3::new(1.0, 1.0, 10.0),
            Point3::new(f64::NAN, 1.0, 1.0),
        ]);
        assert!(v.iter().all(|x| x.is_nan()), "{v:?}");
    }

    // ── Snapshot / handles ──────────────────────────────────────────────────

    #[test]
    fn snapshot_is_detached_from_later_writes() {
        let (mut w, r) = shared(100, 1);
        w.apply_batch(&batch(vec![[0, 1, 2]], vec![7])).unwrap();
        let snap = r.export_snapshot();
        w.apply_batch(&batch(vec![[0, 1, 2]], vec![7])).unwrap();
        assert_eq!(snap.weight_at([0, 1, 2]), Some(7));
        assert_eq!(snap.occupied(), vec![([0, 1, 2], 7)]);
        assert_eq!(r.weight_at([0, 1, 2]), Some(14));
    }

    #[test]
    fn snapshot_serialises_to_json() {
        let (mut w, r) = shared(100, 1);
        w.apply_batch(&batch(vec![[2, 0, 1]], vec![3])).unwrap();
        let json = serde_json::to_string(&r.export_snapshot()).unwrap();
        let back: GridSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back.weight_at([2, 0, 1]), Some(3));
        assert_eq!(back.shape, [4, 4, 4]);
    }

    #[test]
    fn readers_observe_writer_updates() {
        let (mut w, r) = shared(100, 1);
        let r2 = w.reader();
        let r3 = r.clone();
        w.apply_batch(&batch(vec![[1, 1, 1]], vec![2])).unwrap();
        assert_eq!(r2.weight_at([1, 1, 1]), Some(2));
        assert_eq!(r3.occupied_cells(), 1);
    }

    #[test]
    fn concurrent_queries_see_bounded_weights() {
        let (mut w, r) = shared(50, 7);
        let reader = std::thread::spawn(move || {
            for _ in 0..500 {
                let v = r.query(&[Point3::new(1.5, 1.5, 1.5)])[0];
                assert!((0.0..=50.0).contains(&v), "out of bounds: {v}");
            }
        });
        for n in 0..500u16 {
            w.apply_batch(&batch(vec![[1, 1, 1], [2, 2, 2]], vec![n % 5, 1]))
                .unwrap();
            w.decay_window([1.5, 1.5, 1.5], 1.0, 3).unwrap();
        }
        reader.join().unwrap();
    }
}

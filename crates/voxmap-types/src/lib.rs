//! `voxmap-types` – shared records for the sensor-to-map pipeline.
//!
//! Everything here is plain data: sensor calibration, timestamped depth and
//! pose samples, the fixed map geometry, voxel batches, the event envelope
//! carried by the bus, and the workspace-wide [`MapError`].

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ────────────────────────────────────────────────────────────────────────────
// Sensor records
// ────────────────────────────────────────────────────────────────────────────

/// Depth-to-meters scale factor and pinhole camera parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Intrinsics {
    /// Multiplier converting native depth units into meters.
    pub scale: f64,
    /// Principal point, column axis (pixels).
    pub ppx: f64,
    /// Principal point, row axis (pixels).
    pub ppy: f64,
    /// Focal length along the column axis (pixels).
    pub fx: f64,
    /// Focal length along the row axis (pixels).
    pub fy: f64,
}

impl Intrinsics {
    pub fn new(scale: f64, ppx: f64, ppy: f64, fx: f64, fy: f64) -> Self {
        Self {
            scale,
            ppx,
            ppy,
            fx,
            fy,
        }
    }
}

/// Raw depth samples, row-major.
#[derive(Debug, Clone, PartialEq)]
pub enum DepthSamples {
    /// Native sensor units (e.g. z16 streams).
    U16(Vec<u16>),
    /// Already floating point, possibly carrying NaN holes.
    F32(Vec<f32>),
}

impl DepthSamples {
    pub fn len(&self) -> usize {
        match self {
            DepthSamples::U16(v) => v.len(),
            DepthSamples::F32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Convert every sample to `f32` in native units.
    pub fn to_f32(&self) -> Vec<f32> {
        match self {
            DepthSamples::U16(v) => v.iter().map(|&s| f32::from(s)).collect(),
            DepthSamples::F32(v) => v.clone(),
        }
    }
}

/// A timestamped depth image as produced by the sensor driver.
#[derive(Debug, Clone, PartialEq)]
pub struct DepthFrame {
    /// Capture time (seconds).
    pub timestamp: f64,
    /// Columns.
    pub width: usize,
    /// Rows.
    pub height: usize,
    pub samples: DepthSamples,
    pub intrinsics: Intrinsics,
}

impl DepthFrame {
    /// Build a frame from native `u16` samples.
    pub fn from_u16(
        timestamp: f64,
        width: usize,
        height: usize,
        samples: Vec<u16>,
        intrinsics: Intrinsics,
    ) -> Self {
        Self {
            timestamp,
            width,
            height,
            samples: DepthSamples::U16(samples),
            intrinsics,
        }
    }

    /// Build a frame from `f32` samples.
    pub fn from_f32(
        timestamp: f64,
        width: usize,
        height: usize,
        samples: Vec<f32>,
        intrinsics: Intrinsics,
    ) -> Self {
        Self {
            timestamp,
            width,
            height,
            samples: DepthSamples::F32(samples),
            intrinsics,
        }
    }
}

/// 6-DOF platform pose supplied by the localization collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    /// Sample time (seconds).
    pub timestamp: f64,
    /// Position in the global frame (meters).
    pub translation: [f64; 3],
    /// Orientation as a unit quaternion, scalar last: `[x, y, z, w]`.
    pub quaternion: [f64; 4],
    /// Tracker confidence as reported by the pose source.
    pub confidence: i32,
}

impl Pose {
    /// A pose at the origin with no rotation.
    pub fn identity(timestamp: f64) -> Self {
        Self {
            timestamp,
            translation: [0.0; 3],
            quaternion: [0.0, 0.0, 0.0, 1.0],
            confidence: 0,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Map geometry
// ────────────────────────────────────────────────────────────────────────────

/// One of the three grid axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];

    pub fn index(self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Axis::X => write!(f, "x"),
            Axis::Y => write!(f, "y"),
            Axis::Z => write!(f, "z"),
        }
    }
}

/// Largest division count an axis may have: voxel indices are `u16`.
pub const MAX_DIVISIONS: u32 = u16::MAX as u32 + 1;

/// Largest total cell count a grid may have (512 MiB of `u16` weights).
pub const MAX_CELLS: usize = 1 << 28;

/// Fixed bounding box and division counts of an occupancy grid.
///
/// The bin edges of each axis are `linspace(min, max, div)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MapDefinition {
    pub x_min: f64,
    pub y_min: f64,
    pub z_min: f64,
    pub x_max: f64,
    pub y_max: f64,
    pub z_max: f64,
    pub x_div: u32,
    pub y_div: u32,
    pub z_div: u32,
}

impl MapDefinition {
    /// Lower bound per axis.
    pub fn mins(&self) -> [f64; 3] {
        [self.x_min, self.y_min, self.z_min]
    }

    /// Upper bound per axis.
    pub fn maxs(&self) -> [f64; 3] {
        [self.x_max, self.y_max, self.z_max]
    }

    /// Division count per axis.
    pub fn divisions(&self) -> [usize; 3] {
        [self.x_div as usize, self.y_div as usize, self.z_div as usize]
    }

    /// Total number of cells, or `None` if the product overflows `usize`.
    pub fn checked_cell_count(&self) -> Option<usize> {
        self.divisions()
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
    }

    /// Total number of cells, saturating at `usize::MAX`.
    pub fn cell_count(&self) -> usize {
        self.checked_cell_count().unwrap_or(usize::MAX)
    }

    /// Check that every axis has finite, increasing bounds and a division
    /// count in `2..=MAX_DIVISIONS`, and that the grid holds at most
    /// [`MAX_CELLS`] cells.
    ///
    /// # Errors
    ///
    /// Returns [`MapError::InvalidMapDefinition`] naming the first offending
    /// axis.
    pub fn validate(&self) -> Result<(), MapError> {
        let mins = self.mins();
        let maxs = self.maxs();
        let divs = [self.x_div, self.y_div, self.z_div];
        for axis in Axis::ALL {
            let a = axis.index();
            if !mins[a].is_finite() || !maxs[a].is_finite() {
                return Err(MapError::InvalidMapDefinition(format!(
                    "{axis} bounds must be finite"
                )));
            }
            if mins[a] >= maxs[a] {
                return Err(MapError::InvalidMapDefinition(format!(
                    "{axis} min ({}) must be below max ({})",
                    mins[a], maxs[a]
                )));
            }
            if !(2..=MAX_DIVISIONS).contains(&divs[a]) {
                return Err(MapError::InvalidMapDefinition(format!(
                    "{axis} divisions must be within 2..={MAX_DIVISIONS}, got {}",
                    divs[a]
                )));
            }
        }
        match self.checked_cell_count() {
            Some(cells) if cells <= MAX_CELLS => Ok(()),
            _ => Err(MapError::InvalidMapDefinition(format!(
                "{} x {} x {} cells exceed the limit of {MAX_CELLS}",
                self.x_div, self.y_div, self.z_div
            ))),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Voxel batches
// ────────────────────────────────────────────────────────────────────────────

/// Voxel indices with their hit counts, as produced by the voxelizer.
///
/// `voxels.len() == counts.len()`; with compression enabled every triple is
/// distinct.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoxelBatch {
    pub voxels: Vec<[u16; 3]>,
    pub counts: Vec<u16>,
}

impl VoxelBatch {
    pub fn len(&self) -> usize {
        self.voxels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voxels.is_empty()
    }

    /// Sum of all counts.
    pub fn total_hits(&self) -> u64 {
        self.counts.iter().map(|&c| u64::from(c)).sum()
    }
}

/// Outbound map synchronisation message, one per processed frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapUpdateBatch {
    /// Timestamp of the depth frame the batch was built from.
    pub timestamp: f64,
    pub voxels: Vec<[u16; 3]>,
    pub counts: Vec<u16>,
}

impl MapUpdateBatch {
    pub fn new(timestamp: f64, batch: VoxelBatch) -> Self {
        Self {
            timestamp,
            voxels: batch.voxels,
            counts: batch.counts,
        }
    }

    /// View the payload as a [`VoxelBatch`] again (used by replicas).
    pub fn to_batch(&self) -> VoxelBatch {
        VoxelBatch {
            voxels: self.voxels.clone(),
            counts: self.counts.clone(),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Bus envelope
// ────────────────────────────────────────────────────────────────────────────

/// Unified event wrapper for the map bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g., "voxmap-runtime::pipeline"
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    /// Wrap `payload` with a fresh id and the current wall-clock time.
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

/// Variants of data that can be routed over the map bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    MapUpdate(MapUpdateBatch),
    /// A frame was rejected by one of the pipeline stages.
    PipelineFault {
        frame_timestamp: f64,
        error: MapError,
    },
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Workspace error type spanning configuration faults and per-frame data
/// rejections.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MapError {
    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Invalid Map Definition: {0}")]
    InvalidMapDefinition(String),

    #[error("Frame Shape Error: {0}")]
    FrameShape(String),

    #[error("Non-unit quaternion: norm {norm}")]
    NonUnitQuaternion { norm: f64 },

    #[error("Non-finite value reached the {stage} stage")]
    NonFinite { stage: String },

    #[error("Point outside mapped volume on {axis}: {value} > {max}")]
    PointOutOfBounds { axis: Axis, value: f64, max: f64 },

    #[error("Voxel index outside grid on {axis}: {index} >= {divisions}")]
    VoxelOutOfBounds {
        axis: Axis,
        index: usize,
        divisions: usize,
    },

    #[error("Batch Shape Error: {voxels} voxels but {counts} counts")]
    BatchShape { voxels: usize, counts: usize },

    #[error("Channel Error: {0}")]
    Channel(String),
}

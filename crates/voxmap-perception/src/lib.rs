//! `voxmap-perception` – the numeric core of the sensor-to-map pipeline.
//!
//! Turns raw depth frames into voxel hit batches and keeps the persistent
//! bounded-weight occupancy grid those batches accumulate into.
//!
//! # Modules
//!
//! - [`preprocess`] – [`DepthPreprocessor`][preprocess::DepthPreprocessor]:
//!   downsampling, scaling to meters and range gating of raw depth samples.
//! - [`deproject`] – [`Deprojector`][deproject::Deprojector]: per-pixel ray
//!   lookup that lifts a depth image into a local `(forward, right, down)`
//!   point cloud.
//! - [`transform`] – [`RigidTransform`][transform::RigidTransform]: moves
//!   local points into the global frame using a supplied pose.
//! - [`voxelize`] – [`Voxelizer`][voxelize::Voxelizer]: digitizes global points
//!   against the map's bin edges and compresses duplicate hits.
//! - [`grid`] – [`OccupancyGrid`][grid::OccupancyGrid]: the bounded-weight 3-D
//!   array with batched add, windowed decay and trilinear queries, split into
//!   a single [`MapWriter`][grid::MapWriter] and cloneable
//!   [`MapReader`][grid::MapReader]s.

pub mod deproject;
pub mod grid;
pub mod preprocess;
pub mod transform;
pub mod voxelize;

pub use deproject::Deprojector;
pub use grid::{GridParams, GridSnapshot, MapReader, MapWriter, OccupancyGrid};
pub use preprocess::{Block, DepthImage, DepthPreprocessor, PreprocessConfig, Reduction};
pub use transform::{RigidTransform, to_global};
pub use voxelize::{BinEdges, Voxelizer};

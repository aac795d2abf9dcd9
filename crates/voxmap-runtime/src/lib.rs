//! `voxmap-runtime` – the execution engine for the sensor-to-map pipeline.
//!
//! # Modules
//!
//! - [`pipeline`] – [`Pipeline`][pipeline::Pipeline]: the per-stream worker
//!   thread that pairs depth frames with the latest pose, runs the
//!   perception stages and updates the grid through its unique
//!   [`MapWriter`][voxmap_perception::MapWriter].  Producers feed it through
//!   [`PipelineInlet`][pipeline::PipelineInlet].
//! - [`replica`] – [`MapReplica`][replica::MapReplica]: rebuilds a remote copy
//!   of the grid from the map-update stream on the event bus.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]:
//!   initialises the global `tracing` subscriber with an optional OTLP span
//!   exporter.  Set `OTEL_EXPORTER_OTLP_ENDPOINT` to enable live trace export.

pub mod pipeline;
pub mod replica;
pub mod telemetry;

pub use pipeline::{
    DecayConfig, FrameProcessor, Pipeline, PipelineConfig, PipelineInlet, StatsSnapshot,
};
pub use replica::{MapReplica, ReplicaStats};
pub use telemetry::{TracerProviderGuard, init_tracing};

//! The depth-to-map pipeline and its worker thread.
//!
//! Each depth stream gets one [`Pipeline`].  Producers (the sensor driver and
//! the localization source) push through a cloneable [`PipelineInlet`]:
//!
//! - [`PipelineInlet::on_pose`] overwrites the pending pose;
//! - [`PipelineInlet::on_depth_frame`] pairs the frame with the newest pose
//!   and overwrites the pending pair.  A frame seen before any pose is
//!   dropped and counted.
//!
//! The worker thread owns the grid's [`MapWriter`] and runs, per frame:
//!
//! ```text
//! preprocess → deproject → to_global → voxelize → apply_batch → decay_window
//! ```
//!
//! then publishes the voxel batch on [`Topic::MapUpdates`].  A rejected frame
//! is logged, counted and published on [`Topic::PipelineFaults`]; the worker
//! carries on with the next one.
//!
//! Shutdown sets a flag and wakes the worker through its mailbox, so a worker
//! waiting without a timeout still exits promptly.  A frame already being
//! processed is always finished first.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, trace, warn};
use voxmap_middleware::{EventBus, Mailbox, Received, Topic};
use voxmap_perception::transform::RigidTransform;
use voxmap_perception::{
    BinEdges, DepthPreprocessor, Deprojector, MapReader, MapWriter, PreprocessConfig, Voxelizer,
};
use voxmap_types::{DepthFrame, Event, EventPayload, MapError, MapUpdateBatch, Pose, VoxelBatch};

const EVENT_SOURCE: &str = "voxmap-runtime::pipeline";

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Decay applied around the platform after every processed frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DecayConfig {
    /// Half edge length of the cubic window (meters).
    pub half_extent: f64,
    /// Weight removed per frame from every unsaturated cell in the window.
    /// Zero disables decay.
    pub amount: u16,
}

impl Default for DecayConfig {
    fn default() -> Self {
        Self {
            half_extent: 10.0,
            amount: 40,
        }
    }
}

/// Values the pipeline is built from.  Loading them is the caller's job.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Sensor resolution, columns.
    pub width: usize,
    /// Sensor resolution, rows.
    pub height: usize,
    pub preprocess: PreprocessConfig,
    pub enable_compression: bool,
    pub decay: DecayConfig,
    /// Longest single mailbox wait; `None` waits until woken.
    pub recv_timeout: Option<Duration>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            preprocess: PreprocessConfig::default(),
            enable_compression: true,
            decay: DecayConfig::default(),
            recv_timeout: Some(Duration::from_millis(100)),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// FrameProcessor
// ─────────────────────────────────────────────────────────────────────────────

/// The pure stage chain from a `(frame, pose)` pair to a voxel batch.
#[derive(Debug, Clone)]
pub struct FrameProcessor {
    preprocessor: DepthPreprocessor,
    deprojector: Deprojector,
    voxelizer: Voxelizer,
}

impl FrameProcessor {
    /// # Errors
    ///
    /// [`MapError::Config`] when the preprocessing configuration does not fit
    /// the sensor resolution.
    pub fn new(config: &PipelineConfig, bins: BinEdges) -> Result<Self, MapError> {
        let preprocessor = DepthPreprocessor::new(config.preprocess, config.width, config.height)?;
        Ok(Self {
            preprocessor,
            // Rays are laid out in downsampled pixels, matching the principal
            // point the preprocessor hands back.
            deprojector: Deprojector::new(),
            voxelizer: Voxelizer::new(bins, config.enable_compression),
        })
    }

    pub fn process(&mut self, frame: &DepthFrame, pose: &Pose) -> Result<VoxelBatch, MapError> {
        let (image, intrinsics) = self.preprocessor.preprocess(frame)?;
        let local = self.deprojector.deproject(&image, &intrinsics);
        let global = RigidTransform::from_pose(pose)?.apply_all(&local);
        let batch = self.voxelizer.voxelize(&global)?;
        debug!(points = local.len(), voxels = batch.len(), "frame voxelized");
        Ok(batch)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Statistics
// ─────────────────────────────────────────────────────────────────────────────

/// Live counters shared between producers and the worker.
#[derive(Debug, Default)]
pub struct PipelineStats {
    processed: AtomicU64,
    rejected: AtomicU64,
    dropped_without_pose: AtomicU64,
}

/// Point-in-time copy of the pipeline counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Frames applied to the grid.
    pub processed: u64,
    /// Frames rejected by a stage.
    pub rejected: u64,
    /// Frames dropped because no pose had been received yet.
    pub dropped_without_pose: u64,
    /// Frames replaced in the mailbox before the worker reached them.
    pub overwritten: u64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Inlet
// ─────────────────────────────────────────────────────────────────────────────

/// Producer-side handle.  Clone it into each collaborator thread.
#[derive(Debug, Clone)]
pub struct PipelineInlet {
    frames: Mailbox<(DepthFrame, Pose)>,
    poses: Mailbox<Pose>,
    latest_pose: Arc<Mutex<Option<Pose>>>,
    stats: Arc<PipelineStats>,
}

impl PipelineInlet {
    /// Store `pose` as the newest pose, replacing any unpaired one.
    pub fn on_pose(&self, pose: Pose) {
        self.poses.post(pose);
    }

    /// Pair `frame` with the newest pose and hand it to the worker.
    ///
    /// Returns `false` when the frame was dropped because no pose has ever
    /// been received.
    pub fn on_depth_frame(&self, frame: DepthFrame) -> bool {
        let pose = {
            let mut latest = self.latest_pose.lock();
            if let Some(pose) = self.poses.try_take() {
                *latest = Some(pose);
            }
            *latest
        };
        match pose {
            Some(pose) => {
                self.frames.post((frame, pose));
                true
            }
            None => {
                let dropped = self.stats.dropped_without_pose.fetch_add(1, Ordering::Relaxed) + 1;
                trace!(frame_ts = frame.timestamp, dropped, "no pose yet, frame dropped");
                false
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Pipeline
// ─────────────────────────────────────────────────────────────────────────────

/// A running depth pipeline: one worker thread plus its inlet.
#[derive(Debug)]
pub struct Pipeline {
    inlet: PipelineInlet,
    reader: MapReader,
    shutdown: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl Pipeline {
    /// Validate `config`, take ownership of the grid's writer and start the
    /// worker thread.
    ///
    /// # Errors
    ///
    /// - [`MapError::Config`] for a preprocessing configuration that does not
    ///   fit the sensor resolution, or a negative decay extent.
    /// - [`MapError::Channel`] if the worker thread cannot be spawned.
    pub fn spawn(
        config: PipelineConfig,
        writer: MapWriter,
        bus: EventBus,
    ) -> Result<Self, MapError> {
        let decay = config.decay;
        if !decay.half_extent.is_finite() || decay.half_extent < 0.0 {
            return Err(MapError::Config(format!(
                "decay half extent must be finite and non-negative, got {}",
                decay.half_extent
            )));
        }
        let processor = FrameProcessor::new(&config, writer.bins().clone())?;

        let inlet = PipelineInlet {
            frames: Mailbox::new(),
            poses: Mailbox::new(),
            latest_pose: Arc::new(Mutex::new(None)),
            stats: Arc::new(PipelineStats::default()),
        };
        let shutdown = Arc::new(AtomicBool::new(false));
        let reader = writer.reader();

        let worker = Worker {
            processor,
            writer,
            decay,
            bus,
            frames: inlet.frames.clone(),
            stats: Arc::clone(&inlet.stats),
            shutdown: Arc::clone(&shutdown),
            recv_timeout: config.recv_timeout,
        };
        let handle = thread::Builder::new()
            .name("voxmap-worker".to_string())
            .spawn(move || worker.run())
            .map_err(|e| MapError::Channel(format!("failed to spawn map worker: {e}")))?;

        Ok(Self {
            inlet,
            reader,
            shutdown,
            worker: Some(handle),
        })
    }

    pub fn inlet(&self) -> PipelineInlet {
        self.inlet.clone()
    }

    pub fn on_pose(&self, pose: Pose) {
        self.inlet.on_pose(pose);
    }

    pub fn on_depth_frame(&self, frame: DepthFrame) -> bool {
        self.inlet.on_depth_frame(frame)
    }

    /// Read handle on the grid this pipeline writes.
    pub fn reader(&self) -> MapReader {
        self.reader.clone()
    }

    pub fn stats(&self) -> StatsSnapshot {
        let stats = &self.inlet.stats;
        StatsSnapshot {
            processed: stats.processed.load(Ordering::Relaxed),
            rejected: stats.rejected.load(Ordering::Relaxed),
            dropped_without_pose: stats.dropped_without_pose.load(Ordering::Relaxed),
            overwritten: self.inlet.frames.overwritten(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the worker and wait for it.  Idempotent.
    pub fn shutdown(&mut self) -> StatsSnapshot {
        if let Some(handle) = self.worker.take() {
            self.shutdown.store(true, Ordering::Release);
            self.inlet.frames.wake();
            if handle.join().is_err() {
                warn!("map worker panicked");
            }
        }
        self.stats()
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Worker
// ─────────────────────────────────────────────────────────────────────────────

struct Worker {
    processor: FrameProcessor,
    writer: MapWriter,
    decay: DecayConfig,
    bus: EventBus,
    frames: Mailbox<(DepthFrame, Pose)>,
    stats: Arc<PipelineStats>,
    shutdown: Arc<AtomicBool>,
    recv_timeout: Option<Duration>,
}

impl Worker {
    fn run(mut self) {
        info!(timeout = ?self.recv_timeout, "map worker started");
        while !self.shutdown.load(Ordering::Acquire) {
            match self.frames.recv(self.recv_timeout) {
                Received::Item((frame, pose)) => self.handle(frame, pose),
                Received::Woken | Received::TimedOut => continue,
            }
        }
        info!(
            processed = self.stats.processed.load(Ordering::Relaxed),
            rejected = self.stats.rejected.load(Ordering::Relaxed),
            "map worker stopped"
        );
    }

    fn handle(&mut self, frame: DepthFrame, pose: Pose) {
        let span = info_span!("process_frame", frame_ts = frame.timestamp);
        let _enter = span.enter();

        match self.update(&frame, &pose) {
            Ok(update) => {
                self.stats.processed.fetch_add(1, Ordering::Relaxed);
                self.publish(Topic::MapUpdates, EventPayload::MapUpdate(update));
            }
            Err(error) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(%error, "frame rejected");
                self.publish(
                    Topic::PipelineFaults,
                    EventPayload::PipelineFault {
                        frame_timestamp: frame.timestamp,
                        error,
                    },
                );
            }
        }
    }

    fn update(&mut self, frame: &DepthFrame, pose: &Pose) -> Result<MapUpdateBatch, MapError> {
        let batch = self.processor.process(frame, pose)?;
        self.writer.apply_batch(&batch)?;
        if self.decay.amount > 0 {
            let DecayConfig {
                half_extent,
                amount,
            } = self.decay;
            let decayed = self.writer.decay_window(pose.translation, half_extent, amount)?;
            trace!(decayed, "decay window applied");
        }
        Ok(MapUpdateBatch::new(frame.timestamp, batch))
    }

    fn publish(&self, topic: Topic, payload: EventPayload) {
        if let Err(e) = self.bus.publish_to(topic, Event::new(EVENT_SOURCE, payload)) {
            trace!(error = %e, "event not delivered");
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

//! Remote map synchronisation.
//!
//! A [`MapReplica`] owns a second grid with the same definition as the
//! mapping process and rebuilds it from the `MapUpdateBatch` stream on
//! [`Topic::MapUpdates`].  Batches are applied add-only: the replica does not
//! run decay, so it converges on the accumulated hit evidence rather than the
//! worker's decayed view.

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use voxmap_middleware::{EventBus, Topic, TopicReceiver};
use voxmap_perception::{MapReader, MapWriter, OccupancyGrid};
use voxmap_types::{Event, EventPayload, MapError};

/// Counters reported when a replica stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplicaStats {
    pub applied: u64,
    pub rejected: u64,
    /// Updates lost because the replica fell behind the bus.
    pub lagged: u64,
}

pub struct MapReplica {
    writer: MapWriter,
    stats: ReplicaStats,
}

impl MapReplica {
    /// Wrap `grid`; the returned reader observes the replica's grid.
    pub fn new(grid: OccupancyGrid) -> (Self, MapReader) {
        let (writer, reader) = grid.share();
        (
            Self {
                writer,
                stats: ReplicaStats::default(),
            },
            reader,
        )
    }

    pub fn stats(&self) -> ReplicaStats {
        self.stats
    }

    /// Apply one bus event.  Returns `Ok(true)` for an applied map update and
    /// `Ok(false)` for payloads the replica ignores.
    ///
    /// # Errors
    ///
    /// Propagates [`MapError::BatchShape`] / [`MapError::VoxelOutOfBounds`]
    /// for a batch that does not fit this replica's grid.
    pub fn apply_event(&mut self, event: &Event) -> Result<bool, MapError> {
        let EventPayload::MapUpdate(update) = &event.payload else {
            return Ok(false);
        };
        match self.writer.apply_batch(&update.to_batch()) {
            Ok(entries) => {
                self.stats.applied += 1;
                debug!(frame_ts = update.timestamp, entries, "replica applied update");
                Ok(true)
            }
            Err(e) => {
                self.stats.rejected += 1;
                Err(e)
            }
        }
    }

    /// Consume `rx` until the bus closes.
    pub async fn run(mut self, mut rx: TopicReceiver) -> ReplicaStats {
        info!(topic = ?rx.topic(), "map replica listening");
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Err(error) = self.apply_event(&event) {
                        warn!(%error, "replica rejected update");
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    warn!(lagged_by = n, "map replica lagged");
                    self.stats.lagged += n;
                }
                Err(RecvError::Closed) => break,
            }
        }
        info!(applied = self.stats.applied, "map replica stopped");
        self.stats
    }

    /// Subscribe to `bus` and drive [`MapReplica::run`] on the current Tokio
    /// runtime.
    pub fn spawn(self, bus: &EventBus) -> JoinHandle<ReplicaStats> {
        let rx = bus.subscribe_to(Topic::MapUpdates);
        tokio::spawn(self.run(rx))
    }
}

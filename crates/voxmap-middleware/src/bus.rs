//! Topic-based publish/subscribe event bus.
//!
//! Uses [`tokio::sync::broadcast`] channels under the hood so that every
//! subscriber receives every message without any single subscriber blocking
//! the others or the map worker.
//!
//! # Topics
//!
//! | Topic | Typical traffic |
//! |---|---|
//! | [`Topic::MapUpdates`] | One `MapUpdateBatch` per processed depth frame |
//! | [`Topic::PipelineFaults`] | Frames rejected by a pipeline stage |

use tokio::sync::broadcast;
use voxmap_types::{Event, MapError};

/// Default channel capacity (number of buffered events before old ones are
/// dropped for slow subscribers).
const DEFAULT_CAPACITY: usize = 256;

/// Routing lanes on the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Voxel hit batches for remote map synchronisation.
    MapUpdates,
    /// Per-frame rejections reported by the map worker.
    PipelineFaults,
}

/// Shared event bus. Clone it cheaply – all clones share the same underlying
/// broadcast channels.
#[derive(Clone, Debug)]
pub struct EventBus {
    map_updates: broadcast::Sender<Event>,
    pipeline_faults: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new bus with the given channel capacity.
    ///
    /// The `capacity` is applied to every topic channel independently.
    pub fn new(capacity: usize) -> Self {
        let (map_updates, _) = broadcast::channel(capacity);
        let (pipeline_faults, _) = broadcast::channel(capacity);
        Self {
            map_updates,
            pipeline_faults,
        }
    }

    /// Publish `event` to the given [`Topic`] channel.
    ///
    /// Returns the number of active receivers that were handed the event, or
    /// [`MapError::Channel`] when nobody is subscribed to the topic.  Callers
    /// that publish speculatively treat that error as a normal condition.
    pub fn publish_to(&self, topic: Topic, event: Event) -> Result<usize, MapError> {
        self.topic_sender(topic)
            .send(event)
            .map_err(|_| MapError::Channel(format!("No subscribers for topic {topic:?}")))
    }

    /// Subscribe to a specific [`Topic`] channel.
    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic,
            receiver: self.topic_sender(topic).subscribe(),
        }
    }

    /// Number of live subscribers on `topic`.
    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.topic_sender(topic).receiver_count()
    }

    fn topic_sender(&self, topic: Topic) -> &broadcast::Sender<Event> {
        match topic {
            Topic::MapUpdates => &self.map_updates,
            Topic::PipelineFaults => &self.pipeline_faults,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Topic-based receiver
// ---------------------------------------------------------------------------

/// A receiver bound to a single [`Topic`] channel.
///
/// Obtained via [`EventBus::subscribe_to`].
#[derive(Debug)]
pub struct TopicReceiver {
    topic: Topic,
    receiver: broadcast::Receiver<Event>,
}

impl TopicReceiver {
    /// Wait for the next event on this topic.
    ///
    /// Returns:
    /// * `Ok(event)` – a successfully received event.
    /// * `Err(broadcast::error::RecvError::Lagged(n))` – the subscriber fell
    ///   behind and `n` messages were dropped.  The caller decides whether to
    ///   continue or abort.
    /// * `Err(broadcast::error::RecvError::Closed)` – the bus has shut down.
    pub async fn recv(&mut self) -> Result<Event, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    /// Take the next event if one is buffered, without waiting.
    pub fn try_recv(&mut self) -> Result<Event, broadcast::error::TryRecvError> {
        self.receiver.try_recv()
    }

    /// The [`Topic`] this receiver is bound to.
    pub fn topic(&self) -> Topic {
        self.topic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voxmap_types::{EventPayload, MapUpdateBatch};

    fn make_event(source: &str) -> Event {
        Event::new(
            source,
            EventPayload::MapUpdate(MapUpdateBatch {
                timestamp: 1.0,
                voxels: vec![[1, 2, 3]],
                counts: vec![4],
            }),
        )
    }

    #[test]
    fn publish_without_subscribers_returns_error() {
        let bus = EventBus::default();
        let result = bus.publish_to(Topic::MapUpdates, make_event("test"));
        assert!(matches!(result, Err(MapError::Channel(_))));
    }

    #[tokio::test]
    async fn topic_multiple_subscribers_receive_same_event()
    -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut subscriber1 = bus.subscribe_to(Topic::MapUpdates);
        let mut subscriber2 = bus.subscribe_to(Topic::MapUpdates);
        assert_eq!(bus.subscriber_count(Topic::MapUpdates), 2);

        let event = make_event("voxmap-runtime::pipeline");
        assert_eq!(bus.publish_to(Topic::MapUpdates, event.clone())?, 2);

        let recv1 = subscriber1.recv().await?;
        let recv2 = subscriber2.recv().await?;
        assert_eq!(recv1.id, event.id, "subscriber 1 got wrong event");
        assert_eq!(recv2.id, event.id, "subscriber 2 got wrong event");
        Ok(())
    }

    /// A subscriber on `PipelineFaults` must not receive events published to
    /// `MapUpdates` because they are routed through separate channels.
    #[tokio::test]
    async fn topic_subscriber_does_not_receive_other_topic_events()
    -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut faults = bus.subscribe_to(Topic::PipelineFaults);
        let _updates = bus.subscribe_to(Topic::MapUpdates);

        bus.publish_to(Topic::MapUpdates, make_event("voxmap-runtime::pipeline"))?;

        let result =
            tokio::time::timeout(std::time::Duration::from_millis(50), faults.recv()).await;
        assert!(
            result.is_err(),
            "PipelineFaults subscriber must not receive a MapUpdates event"
        );
        assert_eq!(faults.topic(), Topic::PipelineFaults);
        Ok(())
    }

    /// Flooding a low-capacity channel while a subscriber sleeps must produce
    /// a `Lagged` error rather than panicking or blocking.
    #[tokio::test]
    async fn topic_channel_lag_on_slow_subscriber() {
        let bus = EventBus::new(16);
        let mut slow_sub = bus.subscribe_to(Topic::MapUpdates);

        for _ in 0..1_000 {
            let _ = bus.publish_to(Topic::MapUpdates, make_event("flood"));
        }

        let result = slow_sub.recv().await;
        assert!(
            matches!(result, Err(broadcast::error::RecvError::Lagged(_))),
            "expected Lagged error, got: {result:?}"
        );
    }

    #[test]
    fn try_recv_reports_empty_then_event() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe_to(Topic::MapUpdates);
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
        let event = make_event("test");
        bus.publish_to(Topic::MapUpdates, event.clone()).unwrap();
        assert_eq!(rx.try_recv().unwrap().id, event.id);
    }
}

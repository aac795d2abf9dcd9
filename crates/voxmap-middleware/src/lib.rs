//! `voxmap-middleware` – plumbing between the sensor collaborators, the map
//! worker and remote map consumers.
//!
//! Moves data without caring about its meaning.
//!
//! # Modules
//!
//! - [`mailbox`] – capacity-1 overwrite mailboxes that hand the newest
//!   frame or pose to a worker thread, dropping stale unconsumed items.
//! - [`bus`] – topic-based publish/subscribe event bus built on Tokio
//!   broadcast channels, carrying map updates and pipeline faults.

pub mod bus;
pub mod mailbox;

pub use bus::{EventBus, Topic, TopicReceiver};
pub use mailbox::{Mailbox, Posted, Received};

//! Single-slot overwrite mailboxes.
//!
//! A [`Mailbox`] is a `crossbeam_channel::bounded(1)` channel with a
//! try-send-replace policy: posting into a full mailbox steals the stale
//! item through the mailbox's own receiver and retries, so producers never
//! block and the consumer always sees the newest item.  Replaced items are
//! counted, not reported as errors.
//!
//! The consumer side can be woken without an item via [`Mailbox::wake`],
//! which is how shutdown unblocks a worker waiting without a timeout.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use voxmap_middleware::mailbox::{Mailbox, Posted, Received};
//!
//! let mailbox = Mailbox::new();
//! assert_eq!(mailbox.post(1), Posted::Fresh);
//! assert_eq!(mailbox.post(2), Posted::Replaced);
//!
//! assert_eq!(mailbox.recv(Some(Duration::from_millis(10))), Received::Item(2));
//! assert_eq!(mailbox.overwritten(), 1);
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use tracing::trace;

enum Slot<T> {
    Item(T),
    Wake,
}

/// Outcome of [`Mailbox::post`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Posted {
    /// The slot was empty (or only held a wake signal).
    Fresh,
    /// An unconsumed older item was discarded to make room.
    Replaced,
}

/// Outcome of [`Mailbox::recv`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received<T> {
    Item(T),
    /// A wake signal arrived with no item.
    Woken,
    /// The timeout elapsed with nothing posted.
    TimedOut,
}

/// Capacity-1 mailbox.  Clones share the same slot and counter.
pub struct Mailbox<T> {
    tx: Sender<Slot<T>>,
    rx: Receiver<Slot<T>>,
    overwritten: Arc<AtomicU64>,
}

impl<T> Clone for Mailbox<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            overwritten: Arc::clone(&self.overwritten),
        }
    }
}

impl<T> std::fmt::Debug for Mailbox<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox")
            .field("pending", &!self.rx.is_empty())
            .field("overwritten", &self.overwritten())
            .finish()
    }
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::bounded(1);
        Self {
            tx,
            rx,
            overwritten: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Place `item` in the slot, replacing any unconsumed item.  Never
    /// blocks.
    pub fn post(&self, item: T) -> Posted {
        let mut slot = Slot::Item(item);
        let mut replaced = false;
        loop {
            match self.tx.try_send(slot) {
                Ok(()) => break,
                Err(TrySendError::Full(back)) => {
                    slot = back;
                    // Another producer or the consumer may have emptied the
                    // slot in between; either way retry.
                    if let Ok(Slot::Item(_)) = self.rx.try_recv() {
                        replaced = true;
                    }
                }
                // Both ends live in `self`, so the channel cannot disconnect.
                Err(TrySendError::Disconnected(_)) => break,
            }
        }
        if replaced {
            let total = self.overwritten.fetch_add(1, Ordering::Relaxed) + 1;
            trace!(overwritten = total, "mailbox item replaced");
            Posted::Replaced
        } else {
            Posted::Fresh
        }
    }

    /// Wake a waiting consumer without posting an item.  A no-op when an item
    /// is already pending, since that wakes the consumer too.
    pub fn wake(&self) {
        let _ = self.tx.try_send(Slot::Wake);
    }

    /// Block until an item or wake signal arrives, or `timeout` elapses.
    /// `None` waits indefinitely.
    pub fn recv(&self, timeout: Option<Duration>) -> Received<T> {
        let slot = match timeout {
            Some(timeout) => match self.rx.recv_timeout(timeout) {
                Ok(slot) => slot,
                Err(RecvTimeoutError::Timeout) => return Received::TimedOut,
                Err(RecvTimeoutError::Disconnected) => return Received::Woken,
            },
            None => match self.rx.recv() {
                Ok(slot) => slot,
                Err(_) => return Received::Woken,
            },
        };
        match slot {
            Slot::Item(item) => Received::Item(item),
            Slot::Wake => Received::Woken,
        }
    }

    /// Take the pending item without blocking.  A pending wake signal is
    /// consumed and ignored.
    pub fn try_take(&self) -> Option<T> {
        match self.rx.try_recv() {
            Ok(Slot::Item(item)) => Some(item),
            Ok(Slot::Wake) | Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Whether nothing (item or wake signal) is pending.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// How many unconsumed items have been replaced so far.
    pub fn overwritten(&self) -> u64 {
        self.overwritten.load(Ordering::Relaxed)
    }
}

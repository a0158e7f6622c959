//! Bounded, lossy fan-out of decoder events.
//!
//! Built on [`tokio::sync::broadcast`]: publishing never waits for
//! subscribers, and a subscriber that falls more than `capacity` messages
//! behind loses its oldest unread messages and resumes at the oldest one
//! still retained.

use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};

use super::BusMessage;

/// Default number of messages retained per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Fan-out channel shared by all sessions.
///
/// Cheap to clone; clones publish to the same subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BusMessage>,
    capacity: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    /// Create a bus retaining up to `capacity` messages per subscriber (min 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Deliver `message` to every current subscriber.
    ///
    /// Returns the number of subscribers it was queued for. Never blocks.
    pub fn publish(&self, message: BusMessage) -> usize {
        self.tx.send(message).unwrap_or(0)
    }

    /// Register a new subscriber; it sees messages published from now on.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            dropped: 0,
        }
    }

    /// Remove a subscriber. Dropping the subscription has the same effect.
    pub fn unsubscribe(&self, subscription: Subscription) {
        tracing::trace!(dropped = subscription.dropped, "Subscriber removed");
        drop(subscription);
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// One consumer's view of the bus.
#[derive(Debug)]
pub struct Subscription {
    rx: broadcast::Receiver<BusMessage>,
    dropped: u64,
}

impl Subscription {
    /// Wait for the next message, skipping over anything lost to lag.
    ///
    /// Returns `None` once every [`EventBus`] clone has been dropped.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        loop {
            match self.rx.recv().await {
                Ok(message) => return Some(message),
                Err(RecvError::Lagged(n)) => self.record_lag(n),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next message if one is ready.
    pub fn try_recv(&mut self) -> Option<BusMessage> {
        loop {
            match self.rx.try_recv() {
                Ok(message) => return Some(message),
                Err(TryRecvError::Lagged(n)) => self.record_lag(n),
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    /// Total messages this subscriber lost because it fell behind.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Turn the subscription into a stream of messages.
    pub fn into_stream(self) -> impl futures_core::Stream<Item = BusMessage> {
        futures_util::stream::unfold(self, |mut sub| async move {
            let message = sub.recv().await?;
            Some((message, sub))
        })
    }

    fn record_lag(&mut self, n: u64) {
        self.dropped = self.dropped.saturating_add(n);
        tracing::debug!(skipped = n, total = self.dropped, "Subscriber lagged, dropped oldest events");
    }
}

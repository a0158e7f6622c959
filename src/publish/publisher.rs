//! Background task forwarding bus traffic into a sink.

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::EventSink;
use crate::bus::EventBus;

/// Counters reported when a publisher finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishStats {
    /// Messages the sink accepted.
    pub published: u64,
    /// Messages the sink rejected.
    pub failed: u64,
    /// Messages lost because the publisher fell behind the bus.
    pub dropped: u64,
}

/// Forwards every bus message to a sink until cancelled.
pub struct Publisher;

impl Publisher {
    /// Subscribe to `bus` and forward into `sink` on a new task.
    ///
    /// The subscription is taken before this returns, so nothing published
    /// afterwards is missed. The task ends when `cancel` fires or the bus
    /// closes; it then flushes the sink and returns its counters.
    pub fn spawn<S>(bus: &EventBus, mut sink: S, cancel: CancellationToken) -> JoinHandle<PublishStats>
    where
        S: EventSink + 'static,
    {
        let mut subscription = bus.subscribe();

        tokio::spawn(async move {
            let mut stats = PublishStats::default();

            loop {
                let message = tokio::select! {
                    biased;

                    () = cancel.cancelled() => break,
                    message = subscription.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                };

                match sink.publish(&message).await {
                    Ok(()) => stats.published += 1,
                    Err(e) => {
                        stats.failed += 1;
                        tracing::warn!(error = %e, decoder = message.decoder_name(), "Failed to publish event");
                    }
                }
            }

            // Deliver what was already queued when cancellation arrived.
            while let Some(message) = subscription.try_recv() {
                match sink.publish(&message).await {
                    Ok(()) => stats.published += 1,
                    Err(_) => stats.failed += 1,
                }
            }

            if let Err(e) = sink.flush().await {
                tracing::warn!(error = %e, "Failed to flush event sink");
            }

            stats.dropped = subscription.dropped();
            tracing::debug!(
                published = stats.published,
                failed = stats.failed,
                dropped = stats.dropped,
                "Publisher stopped"
            );
            stats
        })
    }
}

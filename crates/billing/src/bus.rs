//! Event bus
//!
//! A single outbound stream with any number of independent subscribers,
//! built on `tokio::sync::broadcast`. Publishing never blocks: a slow
//! subscriber falls behind and skips the oldest events it missed, and a bus
//! with no subscribers simply drops the event.

use observability::BillingMetrics;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, warn};

use crate::event::BillingEvent;

/// Default per-subscriber buffer
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Multi-subscriber publisher of [`BillingEvent`]s
#[derive(Debug)]
pub struct EventBus {
    sender: broadcast::Sender<BillingEvent>,
    published: AtomicU64,
    metrics: BillingMetrics,
}

impl EventBus {
    pub fn new(capacity: usize, metrics: BillingMetrics) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            published: AtomicU64::new(0),
            metrics,
        }
    }

    /// Publish an event; returns how many subscribers it reached
    pub fn publish(&self, event: BillingEvent) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_event(event.kind());

        if let BillingEvent::Error { message } = &event {
            warn!(%message, "Billing error event");
        }

        match self.sender.send(event) {
            Ok(receivers) => receivers,
            Err(broadcast::error::SendError(event)) => {
                debug!(kind = event.kind(), "Event dropped (no subscribers)");
                0
            }
        }
    }

    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            receiver: self.sender.subscribe(),
        }
    }

    /// Total events published, whether or not anyone received them
    pub fn events_published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

/// A subscriber's view of the bus
pub struct EventSubscription {
    receiver: broadcast::Receiver<BillingEvent>,
}

impl EventSubscription {
    /// Wait for the next event
    ///
    /// Returns `None` once the bus has been dropped.
    pub async fn recv(&mut self) -> Option<BillingEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Subscriber lagged, oldest events dropped");
                }
            }
        }
    }

    /// Take the next event if one is already buffered
    pub fn try_recv(&mut self) -> Option<BillingEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Subscriber lagged, oldest events dropped");
                }
                Err(_) => return None,
            }
        }
    }

    /// Convert into a `Stream`, skipping over lag gaps
    pub fn into_stream(self) -> impl Stream<Item = BillingEvent> + Send + Unpin {
        BroadcastStream::new(self.receiver).filter_map(|item| match item {
            Ok(event) => Some(event),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, "Subscriber lagged, oldest events dropped");
                None
            }
        })
    }
}

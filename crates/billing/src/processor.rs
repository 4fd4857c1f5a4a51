//! Purchase processor
//!
//! Classifies purchase notifications, drives acknowledgment and emits the
//! outcome events. The processor is a single-owner actor: every record
//! mutation, live or restored, goes through one mailbox, so the
//! acknowledged check-and-set for a token can never race with itself.

use observability::BillingMetrics;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::bus::EventBus;
use crate::error::{BillingError, BillingResult};
use crate::event::BillingEvent;
use crate::gateway::CommerceGateway;
use crate::types::{PurchaseOrigin, PurchaseRecord, PurchaseState, PurchaseToken};

/// Default mailbox size
pub const DEFAULT_MAILBOX_CAPACITY: usize = 256;

/// How a single notification was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurchaseOutcome {
    /// Acknowledged by this call
    Acknowledged,
    /// Already acknowledged; no gateway call made
    AlreadyAcknowledged,
    /// Awaiting payment; nothing acknowledged
    Pending,
    /// Unspecified state; no event, no side effect
    Ignored,
    /// Gateway rejected the acknowledgment; record left unacknowledged
    AcknowledgmentFailed,
    /// Acknowledgment completed after teardown; result discarded
    Discarded,
}

enum Command {
    Handle {
        record: PurchaseRecord,
        origin: PurchaseOrigin,
        done: Option<oneshot::Sender<PurchaseOutcome>>,
    },
    Ledger {
        reply: oneshot::Sender<Vec<PurchaseRecord>>,
    },
}

/// Cheap, cloneable entry point into the processor's mailbox
#[derive(Clone, Debug)]
pub struct ProcessorHandle {
    tx: mpsc::Sender<Command>,
}

impl ProcessorHandle {
    /// Queue a record without waiting for it to be handled
    pub async fn submit(&self, record: PurchaseRecord, origin: PurchaseOrigin) -> BillingResult<()> {
        self.tx
            .send(Command::Handle {
                record,
                origin,
                done: None,
            })
            .await
            .map_err(|_| BillingError::ShutDown)
    }

    /// Queue a record and wait for its outcome
    pub async fn process(
        &self,
        record: PurchaseRecord,
        origin: PurchaseOrigin,
    ) -> BillingResult<PurchaseOutcome> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(Command::Handle {
                record,
                origin,
                done: Some(done),
            })
            .await
            .map_err(|_| BillingError::ShutDown)?;
        rx.await.map_err(|_| BillingError::ShutDown)
    }

    /// Snapshot of every record seen so far, ordered by token
    pub async fn ledger(&self) -> BillingResult<Vec<PurchaseRecord>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Ledger { reply })
            .await
            .map_err(|_| BillingError::ShutDown)?;
        rx.await.map_err(|_| BillingError::ShutDown)
    }
}

/// Owner of the purchase ledger
pub struct PurchaseProcessor {
    gateway: Arc<dyn CommerceGateway>,
    bus: Arc<EventBus>,
    ledger: HashMap<PurchaseToken, PurchaseRecord>,
    metrics: BillingMetrics,
}

impl PurchaseProcessor {
    pub fn new(gateway: Arc<dyn CommerceGateway>, bus: Arc<EventBus>, metrics: BillingMetrics) -> Self {
        Self {
            gateway,
            bus,
            ledger: HashMap::new(),
            metrics,
        }
    }

    /// Start the actor; it stops when `shutdown` is cancelled
    pub fn spawn(self, capacity: usize, shutdown: CancellationToken) -> (ProcessorHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let task = tokio::spawn(self.run(rx, shutdown));
        (ProcessorHandle { tx }, task)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>, shutdown: CancellationToken) {
        debug!("Purchase processor started");
        loop {
            let command = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                command = rx.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };

            match command {
                Command::Handle { record, origin, done } => {
                    let outcome = self.handle(record, origin, &shutdown).await;
                    if let Some(done) = done {
                        let _ = done.send(outcome);
                    }
                }
                Command::Ledger { reply } => {
                    let _ = reply.send(self.snapshot());
                }
            }
        }
        debug!(records = self.ledger.len(), "Purchase processor stopped");
    }

    fn snapshot(&self) -> Vec<PurchaseRecord> {
        let mut records: Vec<_> = self.ledger.values().cloned().collect();
        records.sort_by(|a, b| a.token.cmp(&b.token));
        records
    }

    /// Classify one record and act on it
    #[instrument(skip(self, record, shutdown), fields(token = %record.token, state = %record.state, restored = origin.is_restored()))]
    pub async fn handle(
        &mut self,
        record: PurchaseRecord,
        origin: PurchaseOrigin,
        shutdown: &CancellationToken,
    ) -> PurchaseOutcome {
        match record.state {
            PurchaseState::Unspecified => {
                debug!("Unspecified purchase state, ignoring");
                PurchaseOutcome::Ignored
            }
            PurchaseState::Pending => {
                self.merge(&record);
                info!("Purchase pending");
                for product_id in &record.product_ids {
                    self.bus.publish(BillingEvent::PurchasePending {
                        product_id: product_id.clone(),
                    });
                }
                PurchaseOutcome::Pending
            }
            PurchaseState::Purchased => self.handle_purchased(record, origin, shutdown).await,
        }
    }

    async fn handle_purchased(
        &mut self,
        record: PurchaseRecord,
        origin: PurchaseOrigin,
        shutdown: &CancellationToken,
    ) -> PurchaseOutcome {
        let token = record.token.clone();
        if self.merge(&record) {
            debug!("Purchase already acknowledged");
            self.publish_success(&record, origin);
            return PurchaseOutcome::AlreadyAcknowledged;
        }

        let result = self.gateway.acknowledge(&token).await;

        if shutdown.is_cancelled() {
            debug!(ok = result.is_ok(), "Acknowledgment finished after teardown, discarding");
            return PurchaseOutcome::Discarded;
        }

        self.metrics.record_acknowledgment(result.is_ok());
        match result {
            Ok(()) => {
                if let Some(entry) = self.ledger.get_mut(&token) {
                    entry.acknowledged = true;
                }
                info!("Purchase acknowledged");
                self.publish_success(&record, origin);
                PurchaseOutcome::Acknowledged
            }
            Err(source) => {
                warn!(error = %source, "Acknowledgment failed, will retry on next delivery");
                let error = BillingError::Acknowledgment { token, source };
                self.bus.publish(BillingEvent::error(error.to_string()));
                PurchaseOutcome::AcknowledgmentFailed
            }
        }
    }

    /// Fold an incoming record into the ledger; returns the acknowledged flag
    ///
    /// The flag only ever moves false -> true.
    fn merge(&mut self, record: &PurchaseRecord) -> bool {
        let entry = self
            .ledger
            .entry(record.token.clone())
            .or_insert_with(|| record.clone());
        entry.state = record.state;
        entry.product_ids = record.product_ids.clone();
        entry.acknowledged |= record.acknowledged;
        entry.acknowledged
    }

    fn publish_success(&self, record: &PurchaseRecord, origin: PurchaseOrigin) {
        if record.product_ids.is_empty() {
            warn!("Purchase carries no product ids");
        }
        for product_id in &record.product_ids {
            self.bus.publish(BillingEvent::PurchaseSucceeded {
                product_id: product_id.clone(),
                restored: origin.is_restored(),
            });
        }
    }

    pub fn record(&self, token: &PurchaseToken) -> Option<&PurchaseRecord> {
        self.ledger.get(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventSubscription;
    use crate::error::{GatewayError, ResponseCode};
    use crate::gateway::InMemoryGateway;
    use assert_matches::assert_matches;

    fn setup(gateway: InMemoryGateway) -> (PurchaseProcessor, Arc<InMemoryGateway>, EventSubscription) {
        let gateway = Arc::new(gateway);
        let bus = Arc::new(EventBus::new(32, BillingMetrics::new("test")));
        let sub = bus.subscribe();
        let processor = PurchaseProcessor::new(gateway.clone(), bus, BillingMetrics::new("test"));
        (processor, gateway, sub)
    }

    fn purchased(token: &str, product: &str) -> PurchaseRecord {
        PurchaseRecord::new(token, [product], PurchaseState::Purchased)
    }

    #[tokio::test]
    async fn test_duplicate_delivery_acknowledges_once() {
        let (mut processor, gateway, mut sub) = setup(InMemoryGateway::new());
        let token = CancellationToken::new();

        let first = processor.handle(purchased("t1", "p1"), PurchaseOrigin::Live, &token).await;
        let second = processor.handle(purchased("t1", "p1"), PurchaseOrigin::Live, &token).await;

        assert_eq!(first, PurchaseOutcome::Acknowledged);
        assert_eq!(second, PurchaseOutcome::AlreadyAcknowledged);
        assert_eq!(gateway.ack_calls(), vec![PurchaseToken::new("t1")]);
        assert!(processor.record(&PurchaseToken::new("t1")).unwrap().acknowledged);

        for _ in 0..2 {
            assert_matches!(
                sub.try_recv(),
                Some(BillingEvent::PurchaseSucceeded { ref product_id, restored: false }) if product_id == "p1"
            );
        }
        assert_eq!(sub.try_recv(), None);
    }

    #[tokio::test]
    async fn test_backend_acknowledged_record_skips_gateway() {
        let (mut processor, gateway, mut sub) = setup(InMemoryGateway::new());
        let token = CancellationToken::new();

        let outcome = processor
            .handle(purchased("t1", "p1").acknowledged(), PurchaseOrigin::Restored, &token)
            .await;

        assert_eq!(outcome, PurchaseOutcome::AlreadyAcknowledged);
        assert!(gateway.ack_calls().is_empty());
        assert_matches!(sub.try_recv(), Some(BillingEvent::PurchaseSucceeded { restored: true, .. }));
    }

    #[tokio::test]
    async fn test_pending_then_purchased_acknowledges() {
        let (mut processor, gateway, mut sub) = setup(InMemoryGateway::new());
        let token = CancellationToken::new();

        let pending = PurchaseRecord::new("t1", ["p1"], PurchaseState::Pending);
        assert_eq!(
            processor.handle(pending, PurchaseOrigin::Live, &token).await,
            PurchaseOutcome::Pending
        );
        assert!(gateway.ack_calls().is_empty());
        assert_matches!(sub.try_recv(), Some(BillingEvent::PurchasePending { ref product_id }) if product_id == "p1");

        assert_eq!(
            processor.handle(purchased("t1", "p1"), PurchaseOrigin::Live, &token).await,
            PurchaseOutcome::Acknowledged
        );
        assert_eq!(gateway.ack_calls().len(), 1);
        assert_matches!(sub.try_recv(), Some(BillingEvent::PurchaseSucceeded { .. }));
    }

    #[tokio::test]
    async fn test_unspecified_is_inert() {
        let (mut processor, gateway, mut sub) = setup(InMemoryGateway::new());
        let token = CancellationToken::new();

        let record = PurchaseRecord::new("t1", ["p1"], PurchaseState::Unspecified);
        assert_eq!(
            processor.handle(record, PurchaseOrigin::Live, &token).await,
            PurchaseOutcome::Ignored
        );
        assert!(gateway.ack_calls().is_empty());
        assert!(processor.record(&PurchaseToken::new("t1")).is_none());
        assert_eq!(sub.try_recv(), None);
    }

    #[tokio::test]
    async fn test_failed_acknowledgment_is_retried_on_redelivery() {
        let gateway = InMemoryGateway::new()
            .with_ack_failure("t1", GatewayError::new(ResponseCode::Error, "rejected"));
        let (mut processor, gateway, mut sub) = setup(gateway);
        let token = CancellationToken::new();

        assert_eq!(
            processor.handle(purchased("t1", "p1"), PurchaseOrigin::Live, &token).await,
            PurchaseOutcome::AcknowledgmentFailed
        );
        assert!(!processor.record(&PurchaseToken::new("t1")).unwrap().acknowledged);
        assert_matches!(sub.try_recv(), Some(BillingEvent::Error { ref message }) if message.contains("t1"));

        gateway.clear_ack_failures();
        assert_eq!(
            processor.handle(purchased("t1", "p1"), PurchaseOrigin::Restored, &token).await,
            PurchaseOutcome::Acknowledged
        );
        assert_eq!(gateway.ack_calls().len(), 2);
        assert_matches!(sub.try_recv(), Some(BillingEvent::PurchaseSucceeded { restored: true, .. }));
    }

    #[tokio::test]
    async fn test_result_after_teardown_is_discarded() {
        let (mut processor, gateway, mut sub) = setup(InMemoryGateway::new());
        let token = CancellationToken::new();
        token.cancel();

        let outcome = processor.handle(purchased("t1", "p1"), PurchaseOrigin::Live, &token).await;

        assert_eq!(outcome, PurchaseOutcome::Discarded);
        assert_eq!(gateway.ack_calls().len(), 1);
        assert!(!processor.record(&PurchaseToken::new("t1")).unwrap().acknowledged);
        assert_eq!(sub.try_recv(), None);
    }

    #[tokio::test]
    async fn test_multi_product_purchase_emits_per_product() {
        let (mut processor, _gateway, mut sub) = setup(InMemoryGateway::new());
        let token = CancellationToken::new();

        let record = PurchaseRecord::new("t1", ["b", "a"], PurchaseState::Purchased);
        processor.handle(record, PurchaseOrigin::Live, &token).await;

        assert_eq!(sub.try_recv().and_then(|e| e.product_id().map(String::from)), Some("a".to_string()));
        assert_eq!(sub.try_recv().and_then(|e| e.product_id().map(String::from)), Some("b".to_string()));
    }

    #[tokio::test]
    async fn test_actor_serializes_concurrent_submissions() {
        let (processor, gateway, _sub) = setup(InMemoryGateway::new());
        let shutdown = CancellationToken::new();
        let (handle, task) = processor.spawn(8, shutdown.clone());

        let live = handle.process(purchased("t1", "p1"), PurchaseOrigin::Live);
        let restored = handle.process(purchased("t1", "p1"), PurchaseOrigin::Restored);
        let (live, restored) = tokio::join!(live, restored);

        let mut outcomes = vec![live.unwrap(), restored.unwrap()];
        outcomes.sort_by_key(|o| *o == PurchaseOutcome::AlreadyAcknowledged);
        assert_eq!(
            outcomes,
            vec![PurchaseOutcome::Acknowledged, PurchaseOutcome::AlreadyAcknowledged]
        );
        assert_eq!(gateway.ack_calls().len(), 1);

        let ledger = handle.ledger().await.unwrap();
        assert_eq!(ledger.len(), 1);
        assert!(ledger[0].acknowledged);

        shutdown.cancel();
        task.await.unwrap();
        assert_matches!(
            handle.submit(purchased("t2", "p2"), PurchaseOrigin::Live).await,
            Err(BillingError::ShutDown)
        );
    }
}

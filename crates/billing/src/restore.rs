//! Restoration reconciler
//!
//! Replays every purchase the backend reports as owned through the purchase
//! processor, tagged as restored. Owned purchases of both kinds are queried
//! concurrently and nothing is replayed until both queries have resolved. A
//! failed kind is reported and skipped; the other kind is still replayed.

use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::bus::EventBus;
use crate::error::{BillingError, BillingResult};
use crate::event::BillingEvent;
use crate::gateway::CommerceGateway;
use crate::processor::{ProcessorHandle, PurchaseOutcome};
use crate::types::{ProductKind, PurchaseOrigin};

/// Summary of one restoration pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    /// Records replayed through the processor
    pub replayed: usize,
    /// Records newly acknowledged during this pass
    pub acknowledged: usize,
    /// Kinds whose owned-purchases query failed
    pub failed: Vec<ProductKind>,
}

impl RestoreReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct RestorationReconciler {
    gateway: Arc<dyn CommerceGateway>,
    processor: ProcessorHandle,
    bus: Arc<EventBus>,
}

impl RestorationReconciler {
    pub fn new(gateway: Arc<dyn CommerceGateway>, processor: ProcessorHandle, bus: Arc<EventBus>) -> Self {
        Self {
            gateway,
            processor,
            bus,
        }
    }

    /// Run one restoration pass
    ///
    /// Fails only if the processor has shut down.
    #[instrument(skip(self))]
    pub async fn restore(&self) -> BillingResult<RestoreReport> {
        let (one_time, subscriptions) = tokio::join!(
            self.gateway.query_owned_purchases(ProductKind::OneTime),
            self.gateway.query_owned_purchases(ProductKind::Subscription),
        );

        let mut report = RestoreReport::default();
        let mut records = Vec::new();
        for (kind, result) in [
            (ProductKind::OneTime, one_time),
            (ProductKind::Subscription, subscriptions),
        ] {
            match result {
                Ok(owned) => {
                    debug!(%kind, count = owned.len(), "Owned purchases received");
                    records.extend(owned);
                }
                Err(source) => {
                    warn!(%kind, error = %source, "Owned purchases query failed");
                    let error = BillingError::Query { kind, source };
                    self.bus.publish(BillingEvent::error(error.to_string()));
                    report.failed.push(kind);
                }
            }
        }

        for record in records {
            let outcome = self.processor.process(record, PurchaseOrigin::Restored).await?;
            report.replayed += 1;
            if outcome == PurchaseOutcome::Acknowledged {
                report.acknowledged += 1;
            }
        }

        info!(
            replayed = report.replayed,
            acknowledged = report.acknowledged,
            failed = report.failed.len(),
            "Restoration pass finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventSubscription;
    use crate::error::GatewayError;
    use crate::gateway::InMemoryGateway;
    use crate::processor::PurchaseProcessor;
    use crate::types::{PurchaseRecord, PurchaseState};
    use assert_matches::assert_matches;
    use observability::BillingMetrics;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn setup(gateway: InMemoryGateway) -> (RestorationReconciler, Arc<InMemoryGateway>, EventSubscription, CancellationToken) {
        let gateway = Arc::new(gateway);
        let bus = Arc::new(EventBus::new(32, BillingMetrics::new("test")));
        let sub = bus.subscribe();
        let shutdown = CancellationToken::new();
        let processor = PurchaseProcessor::new(gateway.clone(), bus.clone(), BillingMetrics::new("test"));
        let (handle, _task) = processor.spawn(16, shutdown.clone());
        let reconciler = RestorationReconciler::new(gateway.clone(), handle, bus);
        (reconciler, gateway, sub, shutdown)
    }

    #[tokio::test]
    async fn test_restored_purchases_are_tagged() {
        let gateway = InMemoryGateway::new()
            .with_owned_purchase(
                ProductKind::OneTime,
                PurchaseRecord::new("t1", ["p1"], PurchaseState::Purchased),
            )
            .with_owned_purchase(
                ProductKind::Subscription,
                PurchaseRecord::new("t2", ["s1"], PurchaseState::Purchased).acknowledged(),
            );
        let (reconciler, gateway, mut sub, _shutdown) = setup(gateway);

        let report = reconciler.restore().await.unwrap();
        assert_eq!(
            report,
            RestoreReport {
                replayed: 2,
                acknowledged: 1,
                failed: vec![]
            }
        );
        assert_eq!(gateway.ack_calls().len(), 1);

        let mut restored = Vec::new();
        while let Some(event) = sub.try_recv() {
            let product = assert_matches!(
                event,
                BillingEvent::PurchaseSucceeded { product_id, restored: true } => product_id
            );
            restored.push(product);
        }
        restored.sort();
        assert_eq!(restored, vec!["p1", "s1"]);
    }

    #[tokio::test]
    async fn test_failed_kind_does_not_abort_other() {
        let gateway = InMemoryGateway::new()
            .with_owned_failure(ProductKind::OneTime, GatewayError::unavailable("down"))
            .with_owned_purchase(
                ProductKind::Subscription,
                PurchaseRecord::new("t2", ["s1"], PurchaseState::Purchased),
            );
        let (reconciler, _gateway, mut sub, _shutdown) = setup(gateway);

        let report = reconciler.restore().await.unwrap();
        assert_eq!(report.failed, vec![ProductKind::OneTime]);
        assert_eq!(report.replayed, 1);
        assert!(!report.is_complete());

        let mut errors = 0;
        let mut successes = 0;
        while let Some(event) = sub.try_recv() {
            match event {
                BillingEvent::Error { .. } => errors += 1,
                BillingEvent::PurchaseSucceeded { restored: true, .. } => successes += 1,
                other => panic!("unexpected event: {:?}", other),
            }
        }
        assert_eq!((errors, successes), (1, 1));
    }

    #[tokio::test]
    async fn test_total_failure_emits_no_restored_events() {
        let gateway = InMemoryGateway::new()
            .with_owned_failure(ProductKind::OneTime, GatewayError::unavailable("a"))
            .with_owned_failure(ProductKind::Subscription, GatewayError::unavailable("b"));
        let (reconciler, _gateway, mut sub, _shutdown) = setup(gateway);

        let report = reconciler.restore().await.unwrap();
        assert_eq!(report.replayed, 0);
        assert_eq!(report.failed.len(), 2);
        while let Some(event) = sub.try_recv() {
            assert_matches!(event, BillingEvent::Error { .. });
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_queries_run_concurrently() {
        let gateway = InMemoryGateway::new()
            .with_query_latency(ProductKind::OneTime, Duration::from_secs(1))
            .with_query_latency(ProductKind::Subscription, Duration::from_secs(1));
        let (reconciler, gateway, _sub, _shutdown) = setup(gateway);

        let started = tokio::time::Instant::now();
        reconciler.restore().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(gateway.owned_queries().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nothing_replayed_until_both_queries_resolve() {
        let gateway = InMemoryGateway::new()
            .with_owned_purchase(
                ProductKind::OneTime,
                PurchaseRecord::new("t1", ["p1"], PurchaseState::Purchased),
            )
            .with_query_latency(ProductKind::Subscription, Duration::from_secs(5));
        let (reconciler, gateway, mut sub, _shutdown) = setup(gateway);
        let reconciler = Arc::new(reconciler);

        let pass = tokio::spawn({
            let reconciler = reconciler.clone();
            async move { reconciler.restore().await }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(gateway.owned_queries().len(), 2);
        assert_eq!(sub.try_recv(), None);
        assert!(gateway.ack_calls().is_empty());

        let report = pass.await.unwrap().unwrap();
        assert_eq!(report.replayed, 1);
        assert_matches!(
            sub.try_recv(),
            Some(BillingEvent::PurchaseSucceeded { ref product_id, restored: true }) if product_id == "p1"
        );
    }

    #[tokio::test]
    async fn test_stopped_processor_fails_restore() {
        let gateway = InMemoryGateway::new().with_owned_purchase(
            ProductKind::OneTime,
            PurchaseRecord::new("t1", ["p1"], PurchaseState::Purchased),
        );
        let (reconciler, _gateway, _sub, shutdown) = setup(gateway);
        shutdown.cancel();
        tokio::task::yield_now().await;

        assert_matches!(reconciler.restore().await, Err(BillingError::ShutDown));
    }
}

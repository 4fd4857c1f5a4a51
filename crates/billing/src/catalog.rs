//! Catalog fetcher
//!
//! Splits the configured products by kind, queries both groups
//! concurrently and publishes one merged snapshot once both have resolved.
//! Each sub-query returns its own result; nothing is shared between them
//! until the join point.

use observability::BillingMetrics;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::bus::EventBus;
use crate::error::{BillingError, GatewayResult};
use crate::event::BillingEvent;
use crate::gateway::CommerceGateway;
use crate::types::{Catalog, CatalogEntry, ProductKind, ProductSpec};

/// Result of one fetch cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// A snapshot was published; `failed` lists the groups that errored
    Published {
        cycle: u64,
        entries: usize,
        failed: Vec<ProductKind>,
    },
    /// Every queried group failed; the previous snapshot stays visible
    Failed { cycle: u64 },
    /// A newer cycle published first; this result was dropped
    Superseded { cycle: u64 },
}

pub struct CatalogFetcher {
    gateway: Arc<dyn CommerceGateway>,
    products: Vec<ProductSpec>,
    bus: Arc<EventBus>,
    snapshot: watch::Sender<Option<Arc<Catalog>>>,
    cycles: AtomicU64,
    metrics: BillingMetrics,
}

impl CatalogFetcher {
    pub fn new(
        gateway: Arc<dyn CommerceGateway>,
        products: Vec<ProductSpec>,
        bus: Arc<EventBus>,
        metrics: BillingMetrics,
    ) -> Self {
        let (snapshot, _) = watch::channel(None);
        Self {
            gateway,
            products,
            bus,
            snapshot,
            cycles: AtomicU64::new(0),
            metrics,
        }
    }

    pub fn products(&self) -> &[ProductSpec] {
        &self.products
    }

    pub fn product(&self, product_id: &str) -> Option<&ProductSpec> {
        self.products.iter().find(|p| p.product_id == product_id)
    }

    /// Latest published snapshot
    pub fn current(&self) -> Option<Arc<Catalog>> {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Option<Arc<Catalog>>> {
        self.snapshot.subscribe()
    }

    /// Run one fetch cycle
    #[instrument(skip(self))]
    pub async fn fetch(&self) -> FetchOutcome {
        let cycle = self.cycles.fetch_add(1, Ordering::SeqCst) + 1;
        let (one_time, subscriptions): (Vec<_>, Vec<_>) = self
            .products
            .iter()
            .cloned()
            .partition(|p| p.kind == ProductKind::OneTime);

        debug!(
            cycle,
            one_time = one_time.len(),
            subscriptions = subscriptions.len(),
            "Fetching catalog"
        );

        let queried = [&one_time, &subscriptions]
            .iter()
            .filter(|group| !group.is_empty())
            .count();

        let (one_time_result, subscription_result) = tokio::join!(
            self.query_group(ProductKind::OneTime, &one_time),
            self.query_group(ProductKind::Subscription, &subscriptions),
        );

        let mut entries = Vec::new();
        let mut errors = Vec::new();
        for (kind, result) in [
            (ProductKind::OneTime, one_time_result),
            (ProductKind::Subscription, subscription_result),
        ] {
            match result {
                Ok(group) => entries.extend(group),
                Err(source) => {
                    warn!(cycle, %kind, error = %source, "Catalog query failed");
                    errors.push(BillingError::Query { kind, source });
                }
            }
        }

        if !errors.is_empty() {
            let message = errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            self.bus.publish(BillingEvent::error(message));
        }

        let failed: Vec<ProductKind> = errors
            .iter()
            .filter_map(|e| match e {
                BillingError::Query { kind, .. } => Some(*kind),
                _ => None,
            })
            .collect();

        if !failed.is_empty() && failed.len() == queried {
            self.metrics.record_catalog_cycle(false);
            return FetchOutcome::Failed { cycle };
        }

        let catalog = Arc::new(Catalog::new(cycle, entries));
        let entries = catalog.len();
        if !self.install(catalog.clone()) {
            debug!(cycle, "Catalog cycle superseded by a newer one");
            return FetchOutcome::Superseded { cycle };
        }

        self.metrics.record_catalog_cycle(true);
        self.bus.publish(BillingEvent::ProductsUpdated(catalog));
        info!(cycle, entries, "Catalog published");

        FetchOutcome::Published {
            cycle,
            entries,
            failed,
        }
    }

    async fn query_group(
        &self,
        kind: ProductKind,
        products: &[ProductSpec],
    ) -> GatewayResult<Vec<CatalogEntry>> {
        if products.is_empty() {
            debug!(%kind, "No configured products of this kind");
            return Ok(Vec::new());
        }
        self.gateway.query_catalog(products).await
    }

    /// Replace the snapshot unless a newer cycle already did
    fn install(&self, catalog: Arc<Catalog>) -> bool {
        self.snapshot.send_if_modified(|current| {
            let newer = current.as_ref().map_or(true, |c| c.cycle < catalog.cycle);
            if newer {
                *current = Some(catalog.clone());
            }
            newer
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventSubscription;
    use crate::error::{GatewayError, ResponseCode};
    use crate::gateway::InMemoryGateway;
    use crate::types::Offer;
    use assert_matches::assert_matches;
    use std::time::Duration;

    fn entry(id: &str, kind: ProductKind, offer: &str) -> CatalogEntry {
        CatalogEntry::new(
            id,
            kind,
            vec![Offer::new(offer, format!("{}-token", offer), 1_000_000)],
        )
    }

    fn fetcher(
        gateway: InMemoryGateway,
        products: Vec<ProductSpec>,
    ) -> (CatalogFetcher, Arc<InMemoryGateway>, EventSubscription) {
        let gateway = Arc::new(gateway);
        let bus = Arc::new(EventBus::new(16, BillingMetrics::new("test")));
        let sub = bus.subscribe();
        let fetcher =
            CatalogFetcher::new(gateway.clone(), products, bus, BillingMetrics::new("test"));
        (fetcher, gateway, sub)
    }

    fn both_kinds() -> Vec<ProductSpec> {
        vec![ProductSpec::one_time("p1"), ProductSpec::subscription("s1")]
    }

    #[tokio::test(start_paused = true)]
    async fn test_merges_both_groups_in_one_publish() {
        let gateway = InMemoryGateway::new()
            .with_product(entry("p1", ProductKind::OneTime, "o1"))
            .with_product(entry("s1", ProductKind::Subscription, "o2"))
            .with_query_latency(ProductKind::OneTime, Duration::from_millis(200))
            .with_query_latency(ProductKind::Subscription, Duration::from_millis(200));
        let (fetcher, _gateway, mut sub) = fetcher(gateway, both_kinds());

        let started = tokio::time::Instant::now();
        let outcome = fetcher.fetch().await;

        // Both 200ms queries overlap
        assert!(started.elapsed() < Duration::from_millis(400));
        assert_eq!(
            outcome,
            FetchOutcome::Published {
                cycle: 1,
                entries: 2,
                failed: vec![]
            }
        );

        let catalog = assert_matches!(sub.try_recv(), Some(BillingEvent::ProductsUpdated(c)) => c);
        assert_eq!(catalog.get("p1").unwrap().offers[0].offer_id, "o1");
        assert_eq!(catalog.get("s1").unwrap().offers[0].offer_id, "o2");
        assert_eq!(sub.try_recv(), None);
        assert_eq!(fetcher.current(), Some(catalog));
    }

    #[tokio::test]
    async fn test_one_failed_group_publishes_the_other() {
        let gateway = InMemoryGateway::new()
            .with_product(entry("p1", ProductKind::OneTime, "o1"))
            .with_product(entry("p2", ProductKind::OneTime, "o3"))
            .with_catalog_failure(
                ProductKind::Subscription,
                GatewayError::new(ResponseCode::ServiceUnavailable, "subs down"),
            );
        let products = vec![
            ProductSpec::one_time("p1"),
            ProductSpec::one_time("p2"),
            ProductSpec::subscription("s1"),
        ];
        let (fetcher, _gateway, mut sub) = fetcher(gateway, products);

        let outcome = fetcher.fetch().await;
        assert_eq!(
            outcome,
            FetchOutcome::Published {
                cycle: 1,
                entries: 2,
                failed: vec![ProductKind::Subscription]
            }
        );

        assert_matches!(sub.try_recv(), Some(BillingEvent::Error { ref message }) if message.contains("subs down"));
        let catalog = assert_matches!(sub.try_recv(), Some(BillingEvent::ProductsUpdated(c)) => c);
        assert_eq!(catalog.product_ids().collect::<Vec<_>>(), vec!["p1", "p2"]);
    }

    #[tokio::test]
    async fn test_total_failure_keeps_last_catalog() {
        let gateway = InMemoryGateway::new()
            .with_product(entry("p1", ProductKind::OneTime, "o1"))
            .with_product(entry("s1", ProductKind::Subscription, "o2"));
        let (fetcher, gateway, mut sub) = fetcher(gateway, both_kinds());

        fetcher.fetch().await;
        let first = fetcher.current().unwrap();
        while sub.try_recv().is_some() {}

        gateway.fail_catalog(ProductKind::OneTime, GatewayError::unavailable("a"));
        gateway.fail_catalog(ProductKind::Subscription, GatewayError::unavailable("b"));

        assert_eq!(fetcher.fetch().await, FetchOutcome::Failed { cycle: 2 });
        assert_matches!(sub.try_recv(), Some(BillingEvent::Error { .. }));
        assert_eq!(sub.try_recv(), None);
        assert_eq!(fetcher.current(), Some(first));
        assert_eq!(gateway.catalog_queries().len(), 4);
    }

    #[tokio::test]
    async fn test_single_kind_failure_keeps_last_catalog() {
        let gateway = InMemoryGateway::new().with_product(entry("p1", ProductKind::OneTime, "o1"));
        let (fetcher, gateway, mut sub) = fetcher(gateway, vec![ProductSpec::one_time("p1")]);

        fetcher.fetch().await;
        let first = fetcher.current().unwrap();
        while sub.try_recv().is_some() {}

        gateway.fail_catalog(ProductKind::OneTime, GatewayError::unavailable("down"));
        assert_eq!(fetcher.fetch().await, FetchOutcome::Failed { cycle: 2 });
        assert_matches!(sub.try_recv(), Some(BillingEvent::Error { .. }));
        assert_eq!(sub.try_recv(), None);
        assert_eq!(fetcher.current(), Some(first));

        gateway.clear_catalog_failures();
        assert_matches!(
            fetcher.fetch().await,
            FetchOutcome::Published { cycle: 3, entries: 1, .. }
        );
    }

    #[tokio::test]
    async fn test_empty_group_skips_gateway() {
        let gateway = InMemoryGateway::new().with_product(entry("p1", ProductKind::OneTime, "o1"));
        let (fetcher, gateway, _sub) = fetcher(gateway, vec![ProductSpec::one_time("p1")]);

        assert_matches!(fetcher.fetch().await, FetchOutcome::Published { entries: 1, .. });
        assert_eq!(gateway.catalog_queries(), vec![ProductKind::OneTime]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_older_cycle_never_overwrites_newer() {
        let gateway = InMemoryGateway::new()
            .with_product(entry("p1", ProductKind::OneTime, "o1"))
            .with_query_latency(ProductKind::OneTime, Duration::from_millis(100));
        let (fetcher, _gateway, _sub) = fetcher(gateway, vec![ProductSpec::one_time("p1")]);

        // Cycle 2 is installed before cycle 1 finishes
        let newer = Arc::new(Catalog::new(2, vec![]));
        let slow = fetcher.fetch();
        tokio::pin!(slow);
        tokio::select! {
            biased;
            _ = &mut slow => panic!("fetch finished before latency elapsed"),
            _ = tokio::time::sleep(Duration::from_millis(10)) => {}
        }
        assert!(fetcher.install(newer.clone()));

        assert_eq!(slow.await, FetchOutcome::Superseded { cycle: 1 });
        assert_eq!(fetcher.current(), Some(newer));
    }
}

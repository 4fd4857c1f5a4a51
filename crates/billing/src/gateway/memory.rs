//! In-memory commerce gateway
//!
//! A scripted backend: catalog entries, owned purchases and failures are
//! configured up front, every call is recorded, and notifications or
//! disconnects can be injected at any time.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use uuid::Uuid;

use super::traits::{CommerceGateway, GatewayListener, PurchaseFlowRequest};
use crate::error::{GatewayError, GatewayResult, ResponseCode};
use crate::types::{CatalogEntry, ProductKind, ProductSpec, PurchaseRecord, PurchaseState, PurchaseToken};

#[derive(Default)]
struct Inner {
    catalog: HashMap<String, CatalogEntry>,
    catalog_failures: HashMap<ProductKind, GatewayError>,
    owned: Vec<(ProductKind, PurchaseRecord)>,
    owned_failures: HashMap<ProductKind, GatewayError>,
    connect_script: VecDeque<GatewayResult<()>>,
    ack_failures: HashMap<PurchaseToken, GatewayError>,
    latency: HashMap<ProductKind, Duration>,
    auto_complete: bool,
    listener: Option<GatewayListener>,
    connected: bool,

    connect_attempts: u32,
    catalog_queries: Vec<ProductKind>,
    owned_queries: Vec<ProductKind>,
    ack_calls: Vec<PurchaseToken>,
    launched: Vec<PurchaseFlowRequest>,
    end_calls: u32,
}

/// Scripted in-memory gateway
#[derive(Default)]
pub struct InMemoryGateway {
    inner: Mutex<Inner>,
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a product the backend knows about
    pub fn with_product(self, entry: CatalogEntry) -> Self {
        self.inner.lock().catalog.insert(entry.product_id.clone(), entry);
        self
    }

    /// Fail every catalog query for this kind
    pub fn with_catalog_failure(self, kind: ProductKind, error: GatewayError) -> Self {
        self.fail_catalog(kind, error);
        self
    }

    /// Add a purchase the user already owns
    pub fn with_owned_purchase(self, kind: ProductKind, record: PurchaseRecord) -> Self {
        self.inner.lock().owned.push((kind, record));
        self
    }

    /// Fail every owned-purchases query for this kind
    pub fn with_owned_failure(self, kind: ProductKind, error: GatewayError) -> Self {
        self.inner.lock().owned_failures.insert(kind, error);
        self
    }

    /// Results for successive connect calls; once exhausted, connects succeed
    pub fn with_connect_results(self, results: impl IntoIterator<Item = GatewayResult<()>>) -> Self {
        self.inner.lock().connect_script.extend(results);
        self
    }

    /// Reject acknowledgments of this token until cleared
    pub fn with_ack_failure(self, token: impl Into<PurchaseToken>, error: GatewayError) -> Self {
        self.fail_acknowledgments(token, error);
        self
    }

    /// Delay queries of this kind, to make concurrency observable
    pub fn with_query_latency(self, kind: ProductKind, latency: Duration) -> Self {
        self.inner.lock().latency.insert(kind, latency);
        self
    }

    /// Complete every launched purchase flow with a Purchased notification
    pub fn with_auto_complete(self) -> Self {
        self.inner.lock().auto_complete = true;
        self
    }

    pub fn fail_acknowledgments(&self, token: impl Into<PurchaseToken>, error: GatewayError) {
        self.inner.lock().ack_failures.insert(token.into(), error);
    }

    pub fn clear_ack_failures(&self) {
        self.inner.lock().ack_failures.clear();
    }

    pub fn fail_catalog(&self, kind: ProductKind, error: GatewayError) {
        self.inner.lock().catalog_failures.insert(kind, error);
    }

    pub fn clear_catalog_failures(&self) {
        self.inner.lock().catalog_failures.clear();
    }

    /// Push more connect results onto the script
    pub fn script_connects(&self, results: impl IntoIterator<Item = GatewayResult<()>>) {
        self.inner.lock().connect_script.extend(results);
    }

    /// Deliver a purchase update to the registered listener
    pub fn notify(
        &self,
        code: ResponseCode,
        message: &str,
        purchases: Option<Vec<PurchaseRecord>>,
    ) -> bool {
        match self.listener() {
            Some(listener) => listener.purchases_updated(code, message, purchases),
            None => false,
        }
    }

    /// Deliver a successful purchase to the listener and record it as owned
    pub fn complete_purchase(&self, kind: ProductKind, record: PurchaseRecord) -> bool {
        self.inner.lock().owned.push((kind, record.clone()));
        self.notify(ResponseCode::Ok, "", Some(vec![record]))
    }

    /// Drop the connection as the backend would
    pub fn disconnect(&self) -> bool {
        let listener = {
            let mut inner = self.inner.lock();
            inner.connected = false;
            inner.listener.clone()
        };
        listener.map(|l| l.service_disconnected()).unwrap_or(false)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().connected
    }

    pub fn connect_attempts(&self) -> u32 {
        self.inner.lock().connect_attempts
    }

    pub fn catalog_queries(&self) -> Vec<ProductKind> {
        self.inner.lock().catalog_queries.clone()
    }

    pub fn owned_queries(&self) -> Vec<ProductKind> {
        self.inner.lock().owned_queries.clone()
    }

    pub fn ack_calls(&self) -> Vec<PurchaseToken> {
        self.inner.lock().ack_calls.clone()
    }

    pub fn launched(&self) -> Vec<PurchaseFlowRequest> {
        self.inner.lock().launched.clone()
    }

    pub fn end_calls(&self) -> u32 {
        self.inner.lock().end_calls
    }

    /// The registered listener, unless the engine has dropped its end
    fn listener(&self) -> Option<GatewayListener> {
        self.inner
            .lock()
            .listener
            .clone()
            .filter(|l| !l.is_detached())
    }

    async fn simulate_latency(&self, kind: ProductKind) {
        let latency = self.inner.lock().latency.get(&kind).copied();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn kind_of(&self, product_id: &str) -> ProductKind {
        self.inner
            .lock()
            .catalog
            .get(product_id)
            .map(|e| e.kind)
            .unwrap_or(ProductKind::OneTime)
    }
}

#[async_trait]
impl CommerceGateway for InMemoryGateway {
    async fn connect(&self, listener: GatewayListener) -> GatewayResult<()> {
        let mut inner = self.inner.lock();
        inner.connect_attempts += 1;

        let result = inner.connect_script.pop_front().unwrap_or(Ok(()));
        if result.is_ok() {
            inner.connected = true;
            inner.listener = Some(listener);
        }

        tracing::debug!(attempt = inner.connect_attempts, ok = result.is_ok(), "In-memory gateway: connect");
        result
    }

    async fn query_catalog(&self, products: &[ProductSpec]) -> GatewayResult<Vec<CatalogEntry>> {
        let Some(kind) = products.first().map(|p| p.kind) else {
            return Ok(Vec::new());
        };

        self.inner.lock().catalog_queries.push(kind);
        self.simulate_latency(kind).await;

        let inner = self.inner.lock();
        if let Some(error) = inner.catalog_failures.get(&kind) {
            return Err(error.clone());
        }

        Ok(products
            .iter()
            .filter_map(|p| inner.catalog.get(&p.product_id).cloned())
            .collect())
    }

    async fn query_owned_purchases(&self, kind: ProductKind) -> GatewayResult<Vec<PurchaseRecord>> {
        self.inner.lock().owned_queries.push(kind);
        self.simulate_latency(kind).await;

        let inner = self.inner.lock();
        if let Some(error) = inner.owned_failures.get(&kind) {
            return Err(error.clone());
        }

        Ok(inner
            .owned
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, r)| r.clone())
            .collect())
    }

    async fn acknowledge(&self, token: &PurchaseToken) -> GatewayResult<()> {
        let mut inner = self.inner.lock();
        inner.ack_calls.push(token.clone());

        if let Some(error) = inner.ack_failures.get(token) {
            return Err(error.clone());
        }

        for (_, record) in inner.owned.iter_mut().filter(|(_, r)| &r.token == token) {
            record.acknowledged = true;
        }

        tracing::debug!(%token, "In-memory gateway: acknowledged");
        Ok(())
    }

    async fn launch_purchase_flow(&self, request: &PurchaseFlowRequest) -> GatewayResult<()> {
        let auto_complete = {
            let mut inner = self.inner.lock();
            inner.launched.push(request.clone());
            inner.auto_complete
        };

        if auto_complete {
            let token = format!("tok-{}", Uuid::new_v4());
            let record = PurchaseRecord::new(
                token.as_str(),
                [request.product_id.clone()],
                PurchaseState::Purchased,
            );
            let kind = self.kind_of(&request.product_id);
            self.complete_purchase(kind, record);
        }

        Ok(())
    }

    async fn end_connection(&self) {
        let mut inner = self.inner.lock();
        inner.end_calls += 1;
        inner.connected = false;
        inner.listener = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::GatewayNotification;
    use crate::types::Offer;

    #[tokio::test]
    async fn test_connect_script_then_success() {
        let gateway = InMemoryGateway::new()
            .with_connect_results([Err(GatewayError::unavailable("down"))]);
        let (listener, _rx) = GatewayListener::channel();

        assert!(gateway.connect(listener.clone()).await.is_err());
        assert!(!gateway.is_connected());
        assert!(gateway.connect(listener).await.is_ok());
        assert!(gateway.is_connected());
        assert_eq!(gateway.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn test_catalog_returns_only_requested_products() {
        let gateway = InMemoryGateway::new()
            .with_product(CatalogEntry::new(
                "p1",
                ProductKind::OneTime,
                vec![Offer::new("o1", "t1", 100)],
            ))
            .with_product(CatalogEntry::new("p2", ProductKind::OneTime, vec![]));

        let entries = gateway
            .query_catalog(&[ProductSpec::one_time("p1"), ProductSpec::one_time("missing")])
            .await
            .unwrap();

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].product_id, "p1");
        assert_eq!(gateway.catalog_queries(), vec![ProductKind::OneTime]);
    }

    #[tokio::test]
    async fn test_acknowledge_marks_owned_record() {
        let gateway = InMemoryGateway::new().with_owned_purchase(
            ProductKind::Subscription,
            PurchaseRecord::new("tok", ["s1"], PurchaseState::Purchased),
        );

        gateway.acknowledge(&PurchaseToken::new("tok")).await.unwrap();

        let owned = gateway
            .query_owned_purchases(ProductKind::Subscription)
            .await
            .unwrap();
        assert!(owned[0].acknowledged);
        assert!(gateway
            .query_owned_purchases(ProductKind::OneTime)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_dropped_receiver_stops_delivery() {
        let gateway = InMemoryGateway::new();
        let (listener, rx) = GatewayListener::channel();
        gateway.connect(listener).await.unwrap();
        assert!(gateway.notify(ResponseCode::Ok, "", None));

        drop(rx);
        assert!(!gateway.notify(ResponseCode::Ok, "", None));
        assert!(!gateway.complete_purchase(
            ProductKind::OneTime,
            PurchaseRecord::new("tok", ["p1"], PurchaseState::Purchased),
        ));
    }

    #[tokio::test]
    async fn test_auto_complete_notifies_listener() {
        let gateway = InMemoryGateway::new().with_auto_complete();
        let (listener, mut rx) = GatewayListener::channel();
        gateway.connect(listener).await.unwrap();

        gateway
            .launch_purchase_flow(&PurchaseFlowRequest {
                product_id: "p1".to_string(),
                offer_token: None,
            })
            .await
            .unwrap();

        match rx.recv().await {
            Some(GatewayNotification::PurchasesUpdated {
                code: ResponseCode::Ok,
                purchases: Some(purchases),
                ..
            }) => {
                assert_eq!(purchases.len(), 1);
                assert!(purchases[0].product_ids.contains("p1"));
            }
            other => panic!("unexpected notification: {:?}", other),
        }
    }
}

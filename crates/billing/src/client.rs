//! Billing client
//!
//! The public entry point. Wires the event bus, the purchase processor, the
//! catalog fetcher, the restoration reconciler and the connection manager
//! together, and exposes the caller-initiated operations.

use observability::BillingMetrics;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::bus::{EventBus, EventSubscription, DEFAULT_EVENT_CAPACITY};
use crate::catalog::{CatalogFetcher, FetchOutcome};
use crate::error::{BillingError, BillingResult};
use crate::event::BillingEvent;
use crate::gateway::{CommerceGateway, PurchaseFlowRequest};
use crate::processor::{ProcessorHandle, PurchaseProcessor, DEFAULT_MAILBOX_CAPACITY};
use crate::restore::{RestorationReconciler, RestoreReport};
use crate::session::{ConnectionManager, ReconnectPolicy, SessionHandle};
use crate::shutdown::{run_until_cancelled, ShutdownController};
use crate::types::{Catalog, ProductSpec, PurchaseRecord, SessionState};

/// Everything needed to start a client
#[derive(Debug, Clone)]
pub struct BillingOptions {
    /// Label attached to every metric
    pub client_name: String,
    pub products: Vec<ProductSpec>,
    pub reconnect: ReconnectPolicy,
    pub event_capacity: usize,
    pub mailbox_capacity: usize,
}

impl BillingOptions {
    pub fn new(products: Vec<ProductSpec>) -> Self {
        Self {
            client_name: "storefront".to_string(),
            products,
            reconnect: ReconnectPolicy::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
        }
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }
}

impl From<&config::BillingConfig> for BillingOptions {
    fn from(config: &config::BillingConfig) -> Self {
        Self {
            client_name: config.client.name.clone(),
            products: config.products.iter().map(ProductSpec::from).collect(),
            reconnect: ReconnectPolicy::from(&config.connection),
            event_capacity: config.events.capacity,
            mailbox_capacity: config.processor.mailbox_capacity,
        }
    }
}

/// Handle to a running billing session
pub struct BillingClient {
    gateway: Arc<dyn CommerceGateway>,
    bus: Arc<EventBus>,
    catalog: Arc<CatalogFetcher>,
    restorer: Arc<RestorationReconciler>,
    processor: ProcessorHandle,
    session: SessionHandle,
    shutdown: ShutdownController,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl BillingClient {
    /// Start the engine and begin connecting
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(options: BillingOptions, gateway: Arc<dyn CommerceGateway>) -> Self {
        let metrics = BillingMetrics::new(&options.client_name);
        let shutdown = ShutdownController::new();
        let bus = Arc::new(EventBus::new(options.event_capacity, metrics.clone()));

        let (processor, processor_task) =
            PurchaseProcessor::new(gateway.clone(), bus.clone(), metrics.clone())
                .spawn(options.mailbox_capacity, shutdown.child_token());

        let catalog = Arc::new(CatalogFetcher::new(
            gateway.clone(),
            options.products.clone(),
            bus.clone(),
            metrics.clone(),
        ));
        let restorer = Arc::new(RestorationReconciler::new(
            gateway.clone(),
            processor.clone(),
            bus.clone(),
        ));

        let (session, session_task) = ConnectionManager::new(
            gateway.clone(),
            options.reconnect.clone(),
            bus.clone(),
            catalog.clone(),
            restorer.clone(),
            processor.clone(),
            metrics,
        )
        .spawn(shutdown.child_token());

        info!(
            client = %options.client_name,
            products = options.products.len(),
            max_attempts = options.reconnect.max_attempts,
            "Billing client started"
        );

        Self {
            gateway,
            bus,
            catalog,
            restorer,
            processor,
            session,
            shutdown,
            tasks: Mutex::new(vec![processor_task, session_task]),
            closed: AtomicBool::new(false),
        }
    }

    pub fn from_config(config: &config::BillingConfig, gateway: Arc<dyn CommerceGateway>) -> Self {
        Self::start(BillingOptions::from(config), gateway)
    }

    /// New independent subscription to the event stream
    pub fn subscribe(&self) -> EventSubscription {
        self.bus.subscribe()
    }

    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    pub fn watch_session(&self) -> watch::Receiver<SessionState> {
        self.session.watch()
    }

    /// Latest published catalog, if any cycle has completed
    pub fn catalog(&self) -> Option<Arc<Catalog>> {
        self.catalog.current()
    }

    pub fn watch_catalog(&self) -> watch::Receiver<Option<Arc<Catalog>>> {
        self.catalog.watch()
    }

    /// Every purchase record seen so far
    pub async fn ledger(&self) -> BillingResult<Vec<PurchaseRecord>> {
        self.ensure_open()?;
        self.processor.ledger().await
    }

    /// Show the purchase UI for a product
    ///
    /// Without an `offer_id` the cheapest offer is used. The outcome arrives
    /// later on the event stream; every rejection here is also published as
    /// an `Error` event.
    #[instrument(skip(self))]
    pub async fn launch_purchase(
        &self,
        product_id: &str,
        offer_id: Option<&str>,
    ) -> BillingResult<()> {
        let request = match self.purchase_request(product_id, offer_id) {
            Ok(request) => request,
            Err(e) => {
                self.bus.publish(BillingEvent::error(e.to_string()));
                return Err(e);
            }
        };

        debug!(offer_token = ?request.offer_token, "Launching purchase flow");
        if let Err(source) = self.gateway.launch_purchase_flow(&request).await {
            let e = BillingError::Launch {
                product_id: product_id.to_string(),
                source,
            };
            self.bus.publish(BillingEvent::error(e.to_string()));
            return Err(e);
        }
        Ok(())
    }

    fn purchase_request(
        &self,
        product_id: &str,
        offer_id: Option<&str>,
    ) -> BillingResult<PurchaseFlowRequest> {
        self.ensure_open()?;
        self.session.ensure_ready()?;

        if self.catalog.product(product_id).is_none() {
            return Err(BillingError::invalid_request(format!(
                "unknown product: {}",
                product_id
            )));
        }

        let catalog = self.catalog.current();
        let entry = catalog
            .as_ref()
            .and_then(|c| c.get(product_id))
            .ok_or_else(|| {
                BillingError::invalid_request(format!("product details not loaded: {}", product_id))
            })?;

        let offer = match offer_id {
            Some(id) => Some(entry.offer(id).ok_or_else(|| {
                BillingError::invalid_request(format!(
                    "unknown offer {} for product {}",
                    id, product_id
                ))
            })?),
            None => entry.cheapest_offer(),
        };

        Ok(PurchaseFlowRequest {
            product_id: product_id.to_string(),
            offer_token: offer.map(|o| o.offer_token.clone()),
        })
    }

    /// Run a catalog fetch cycle now
    pub async fn refresh_catalog(&self) -> BillingResult<FetchOutcome> {
        self.ensure_open()?;
        self.session.ensure_ready()?;
        run_until_cancelled(&self.shutdown.token(), self.catalog.fetch())
            .await
            .ok_or(BillingError::ShutDown)
    }

    /// Run a restoration pass now
    pub async fn restore_purchases(&self) -> BillingResult<RestoreReport> {
        self.ensure_open()?;
        self.session.ensure_ready()?;
        run_until_cancelled(&self.shutdown.token(), self.restorer.restore())
            .await
            .ok_or(BillingError::ShutDown)?
    }

    /// Leave the `Failed` state with a fresh retry budget
    pub async fn reinitialize(&self) -> BillingResult<()> {
        self.ensure_open()?;
        self.session.reinitialize().await
    }

    /// Tear the session down
    ///
    /// Cancels outstanding work, stops the background tasks and closes the
    /// gateway connection. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("Shutting down billing client");
        self.shutdown.shutdown();

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Billing task ended abnormally");
            }
        }

        self.gateway.end_connection().await;
        info!(events = self.bus.events_published(), "Billing client stopped");
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> BillingResult<()> {
        if self.is_shut_down() {
            Err(BillingError::ShutDown)
        } else {
            Ok(())
        }
    }
}

impl Drop for BillingClient {
    fn drop(&mut self) {
        self.shutdown.shutdown();
    }
}

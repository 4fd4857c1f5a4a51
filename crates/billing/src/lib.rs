//! Billing engine for Storefront
//!
//! Keeps a session with a commerce backend alive and drives the purchase
//! lifecycle on top of it.
//!
//! # Components
//!
//! - Connection manager: bounded reconnection and the session state machine
//! - Catalog fetcher: concurrent per-kind product queries, one merged publish
//! - Purchase processor: classification and at-most-once acknowledgment
//! - Restoration reconciler: replays owned purchases on every new session
//! - Event bus: multi-subscriber outbound event stream
//!
//! The backend is reached through the [`CommerceGateway`] trait;
//! [`InMemoryGateway`] is a scripted implementation for tests and demos.

pub mod bus;
pub mod catalog;
pub mod client;
pub mod error;
pub mod event;
pub mod gateway;
pub mod processor;
pub mod restore;
pub mod session;
pub mod shutdown;
pub mod types;

// Re-export commonly used types
pub use client::{BillingClient, BillingOptions};
pub use error::{BillingError, BillingResult, GatewayError, GatewayResult, ResponseCode};
pub use event::BillingEvent;
pub use types::{
    Catalog, CatalogEntry, Offer, ProductKind, ProductSpec, PurchaseOrigin, PurchaseRecord,
    PurchaseState, PurchaseToken, SessionState,
};

// Component exports
pub use bus::{EventBus, EventSubscription};
pub use catalog::{CatalogFetcher, FetchOutcome};
pub use processor::{ProcessorHandle, PurchaseOutcome, PurchaseProcessor};
pub use restore::{RestorationReconciler, RestoreReport};
pub use session::{Backoff, ConnectionManager, ReconnectPolicy, SessionHandle};
pub use shutdown::ShutdownController;

// Gateway exports
pub use gateway::{
    CommerceGateway, GatewayListener, GatewayNotification, InMemoryGateway, PurchaseFlowRequest,
};

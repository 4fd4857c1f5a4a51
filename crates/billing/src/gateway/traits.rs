//! CommerceGateway trait definition

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{GatewayResult, ResponseCode};
use crate::types::{CatalogEntry, ProductKind, ProductSpec, PurchaseRecord, PurchaseToken};

/// Asynchronous notification pushed by the gateway
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayNotification {
    /// Outcome of a purchase flow, or any other purchase change
    PurchasesUpdated {
        code: ResponseCode,
        message: String,
        purchases: Option<Vec<PurchaseRecord>>,
    },
    /// The backend dropped the connection
    ServiceDisconnected,
}

/// Callback handle given to the gateway on connect
///
/// The gateway may call it from any task, at any time after `connect`.
/// Once the engine detaches (on shutdown) deliveries are discarded.
#[derive(Debug, Clone)]
pub struct GatewayListener {
    tx: mpsc::UnboundedSender<GatewayNotification>,
}

impl GatewayListener {
    pub fn new(tx: mpsc::UnboundedSender<GatewayNotification>) -> Self {
        Self { tx }
    }

    /// Create a listener together with the receiving end
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<GatewayNotification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// Deliver purchase updates; returns false if the engine has detached
    pub fn purchases_updated(
        &self,
        code: ResponseCode,
        message: impl Into<String>,
        purchases: Option<Vec<PurchaseRecord>>,
    ) -> bool {
        self.deliver(GatewayNotification::PurchasesUpdated {
            code,
            message: message.into(),
            purchases,
        })
    }

    /// Report an involuntary disconnect
    pub fn service_disconnected(&self) -> bool {
        self.deliver(GatewayNotification::ServiceDisconnected)
    }

    pub fn deliver(&self, notification: GatewayNotification) -> bool {
        self.tx.send(notification).is_ok()
    }

    pub fn is_detached(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Parameters of a purchase UI launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchaseFlowRequest {
    pub product_id: String,
    pub offer_token: Option<String>,
}

/// Client for the commerce backend - transport agnostic
///
/// Calls are bounded by the backend's own timeouts; the engine adds none.
#[async_trait]
pub trait CommerceGateway: Send + Sync {
    /// Establish the connection
    ///
    /// The listener stays registered after this returns and receives purchase
    /// updates and disconnects for as long as the connection lives.
    async fn connect(&self, listener: GatewayListener) -> GatewayResult<()>;

    /// Fetch product details for products of a single kind
    async fn query_catalog(&self, products: &[ProductSpec]) -> GatewayResult<Vec<CatalogEntry>>;

    /// Fetch currently owned purchases of one kind
    async fn query_owned_purchases(&self, kind: ProductKind) -> GatewayResult<Vec<PurchaseRecord>>;

    /// Finalize a purchase
    async fn acknowledge(&self, token: &PurchaseToken) -> GatewayResult<()>;

    /// Show the backend's purchase UI
    ///
    /// Fire-and-forget: the outcome arrives later as a notification.
    async fn launch_purchase_flow(&self, request: &PurchaseFlowRequest) -> GatewayResult<()>;

    /// Close the connection and drop the listener
    async fn end_connection(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listener_reports_detach() {
        let (listener, rx) = GatewayListener::channel();
        assert!(listener.service_disconnected());
        drop(rx);
        assert!(listener.is_detached());
        assert!(!listener.purchases_updated(ResponseCode::Ok, "", None));
    }
}

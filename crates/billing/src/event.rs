//! Events published to billing consumers

use std::sync::Arc;

use crate::types::Catalog;

/// Event emitted by the billing engine
///
/// Events for the same product or purchase token are delivered in publish
/// order; there is no ordering guarantee across products.
#[derive(Debug, Clone, PartialEq)]
pub enum BillingEvent {
    /// A fetch cycle produced a new catalog snapshot
    ProductsUpdated(Arc<Catalog>),

    /// A purchase was acknowledged (or found already acknowledged)
    PurchaseSucceeded {
        product_id: String,
        /// True when replayed by the restoration pass
        restored: bool,
    },

    /// A purchase is awaiting payment completion
    PurchasePending { product_id: String },

    /// A non-fatal failure, in human-readable form
    Error { message: String },
}

impl BillingEvent {
    pub fn error(message: impl Into<String>) -> Self {
        BillingEvent::Error {
            message: message.into(),
        }
    }

    /// Short name used as a metrics label
    pub fn kind(&self) -> &'static str {
        match self {
            BillingEvent::ProductsUpdated(_) => "products_updated",
            BillingEvent::PurchaseSucceeded { .. } => "purchase_succeeded",
            BillingEvent::PurchasePending { .. } => "purchase_pending",
            BillingEvent::Error { .. } => "error",
        }
    }

    /// The product this event concerns, if any
    pub fn product_id(&self) -> Option<&str> {
        match self {
            BillingEvent::PurchaseSucceeded { product_id, .. }
            | BillingEvent::PurchasePending { product_id } => Some(product_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_and_product() {
        let ok = BillingEvent::PurchaseSucceeded {
            product_id: "p1".to_string(),
            restored: true,
        };
        assert_eq!(ok.kind(), "purchase_succeeded");
        assert_eq!(ok.product_id(), Some("p1"));

        let err = BillingEvent::error("boom");
        assert_eq!(err.kind(), "error");
        assert_eq!(err.product_id(), None);
    }
}

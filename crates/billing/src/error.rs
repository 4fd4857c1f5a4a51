//! Billing error types

use thiserror::Error;

use crate::types::{ProductKind, PurchaseToken, SessionState};

/// Response codes reported by the commerce backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseCode {
    Ok,
    UserCanceled,
    ServiceUnavailable,
    ServiceDisconnected,
    BillingUnavailable,
    ItemUnavailable,
    ItemAlreadyOwned,
    ItemNotOwned,
    DeveloperError,
    NetworkError,
    Error,
}

impl std::fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ResponseCode::Ok => "ok",
            ResponseCode::UserCanceled => "user_canceled",
            ResponseCode::ServiceUnavailable => "service_unavailable",
            ResponseCode::ServiceDisconnected => "service_disconnected",
            ResponseCode::BillingUnavailable => "billing_unavailable",
            ResponseCode::ItemUnavailable => "item_unavailable",
            ResponseCode::ItemAlreadyOwned => "item_already_owned",
            ResponseCode::ItemNotOwned => "item_not_owned",
            ResponseCode::DeveloperError => "developer_error",
            ResponseCode::NetworkError => "network_error",
            ResponseCode::Error => "error",
        };
        f.write_str(name)
    }
}

/// Error returned by a gateway call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct GatewayError {
    pub code: ResponseCode,
    pub message: String,
}

impl GatewayError {
    pub fn new(code: ResponseCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ResponseCode::ServiceUnavailable, message)
    }

    pub fn disconnected() -> Self {
        Self::new(ResponseCode::ServiceDisconnected, "service disconnected")
    }
}

/// Result type for gateway calls
pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// Errors that can occur in the billing engine
#[derive(Error, Debug, Clone)]
pub enum BillingError {
    /// Connection setup failed
    #[error("Setup failed: {0}")]
    Setup(GatewayError),

    /// The backend dropped the connection
    #[error("Service disconnected")]
    Disconnected,

    /// A catalog or purchase query failed
    #[error("Query for {kind} products failed: {source}")]
    Query {
        kind: ProductKind,
        #[source]
        source: GatewayError,
    },

    /// The backend rejected an acknowledgment
    #[error("Acknowledgment of {token} failed: {source}")]
    Acknowledgment {
        token: PurchaseToken,
        #[source]
        source: GatewayError,
    },

    /// The backend refused to start a purchase flow
    #[error("Purchase flow for {product_id} failed: {source}")]
    Launch {
        product_id: String,
        #[source]
        source: GatewayError,
    },

    /// Rejected locally before reaching the gateway
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The session is not ready for gateway operations
    #[error("Session not ready (state: {0})")]
    NotReady(SessionState),

    /// The client has been shut down
    #[error("Billing client shut down")]
    ShutDown,
}

impl BillingError {
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }
}

/// Result type for billing operations
pub type BillingResult<T> = std::result::Result<T, BillingError>;

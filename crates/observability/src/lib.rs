//! Logging and metrics for the storefront binary and the billing engine
//!
//! The binary calls [`init_logging`] once at startup and, when enabled,
//! [`init_metrics`] to expose a Prometheus endpoint. The engine only ever
//! touches [`BillingMetrics`], which records into whatever recorder is
//! installed and does nothing when there is none.

pub mod logging;
pub mod metrics;

pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{init_metrics, BillingMetrics};

//! Prometheus metrics infrastructure
//!
//! Initializes the Prometheus exporter and provides the metric set recorded
//! by the billing engine. Without an installed recorder every handle is a
//! no-op, so tests and embedded use pay nothing.

use metrics::{counter, gauge, Counter, Gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

/// Initialize the Prometheus metrics exporter
///
/// This starts an HTTP server on the specified port that exposes metrics
/// at the `/metrics` endpoint.
///
/// # Example
///
/// ```ignore
/// observability::metrics::init_metrics(9090)?;
/// // Metrics available at http://localhost:9090/metrics
/// ```
pub fn init_metrics(port: u16) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    tracing::info!(%addr, "Metrics server listening");
    Ok(())
}

/// Billing engine metrics
///
/// # Metrics
///
/// * `billing_connect_attempts_total` - Connection attempts made
/// * `billing_session_state` - Current session state (0 disconnected, 1 connecting, 2 ready, 3 failed)
/// * `billing_catalog_cycles_total` - Catalog fetch cycles, by `outcome`
/// * `billing_acknowledgments_total` - Acknowledgment calls, by `outcome`
/// * `billing_events_total` - Published events, by `kind`
#[derive(Clone)]
pub struct BillingMetrics {
    client: String,
    connect_attempts: Counter,
    session_state: Gauge,
    catalog_published: Counter,
    catalog_failed: Counter,
    acks_ok: Counter,
    acks_failed: Counter,
}

impl BillingMetrics {
    /// Create metrics labelled with the client name
    pub fn new(client: &str) -> Self {
        let name = client.to_string();

        Self {
            connect_attempts: counter!("billing_connect_attempts_total", "client" => name.clone()),
            session_state: gauge!("billing_session_state", "client" => name.clone()),
            catalog_published: counter!(
                "billing_catalog_cycles_total",
                "client" => name.clone(),
                "outcome" => "published"
            ),
            catalog_failed: counter!(
                "billing_catalog_cycles_total",
                "client" => name.clone(),
                "outcome" => "failed"
            ),
            acks_ok: counter!(
                "billing_acknowledgments_total",
                "client" => name.clone(),
                "outcome" => "ok"
            ),
            acks_failed: counter!(
                "billing_acknowledgments_total",
                "client" => name.clone(),
                "outcome" => "failed"
            ),
            client: name,
        }
    }

    pub fn record_connect_attempt(&self) {
        self.connect_attempts.increment(1);
    }

    pub fn set_session_state(&self, state: f64) {
        self.session_state.set(state);
    }

    pub fn record_catalog_cycle(&self, published: bool) {
        if published {
            self.catalog_published.increment(1);
        } else {
            self.catalog_failed.increment(1);
        }
    }

    pub fn record_acknowledgment(&self, ok: bool) {
        if ok {
            self.acks_ok.increment(1);
        } else {
            self.acks_failed.increment(1);
        }
    }

    /// Count a published event by kind
    pub fn record_event(&self, kind: &'static str) {
        counter!("billing_events_total", "client" => self.client.clone(), "kind" => kind)
            .increment(1);
    }

    pub fn client(&self) -> &str {
        &self.client
    }
}

impl std::fmt::Debug for BillingMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BillingMetrics")
            .field("client", &self.client)
            .finish_non_exhaustive()
    }
}

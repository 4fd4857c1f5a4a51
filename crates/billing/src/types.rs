//! Billing domain types
//!
//! Products, catalog snapshots, purchase records and the session state
//! shared by every component of the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Kind of a configured product
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductKind {
    /// Bought once, owned forever (consumable or not)
    OneTime,
    /// Recurring entitlement
    Subscription,
}

impl ProductKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductKind::OneTime => "one_time",
            ProductKind::Subscription => "subscription",
        }
    }
}

impl std::fmt::Display for ProductKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<config::ProductKindConfig> for ProductKind {
    fn from(kind: config::ProductKindConfig) -> Self {
        match kind {
            config::ProductKindConfig::OneTime => ProductKind::OneTime,
            config::ProductKindConfig::Subscription => ProductKind::Subscription,
        }
    }
}

/// A product the client is configured to sell
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProductSpec {
    pub product_id: String,
    pub kind: ProductKind,
}

impl ProductSpec {
    pub fn new(product_id: impl Into<String>, kind: ProductKind) -> Self {
        Self {
            product_id: product_id.into(),
            kind,
        }
    }

    pub fn one_time(product_id: impl Into<String>) -> Self {
        Self::new(product_id, ProductKind::OneTime)
    }

    pub fn subscription(product_id: impl Into<String>) -> Self {
        Self::new(product_id, ProductKind::Subscription)
    }
}

impl From<&config::ProductConfig> for ProductSpec {
    fn from(product: &config::ProductConfig) -> Self {
        Self::new(product.product_id.clone(), product.kind.into())
    }
}

/// A purchasable offer of a product
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offer {
    /// Offer identifier, as chosen by the caller
    pub offer_id: String,
    /// Opaque token handed back to the backend when launching a purchase
    pub offer_token: String,
    /// Price in micro-units of the backend's currency
    pub price_micros: i64,
}

impl Offer {
    pub fn new(offer_id: impl Into<String>, offer_token: impl Into<String>, price_micros: i64) -> Self {
        Self {
            offer_id: offer_id.into(),
            offer_token: offer_token.into(),
            price_micros,
        }
    }
}

/// Product details as known to the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub product_id: String,
    pub kind: ProductKind,
    /// Offers in backend order
    pub offers: Vec<Offer>,
}

impl CatalogEntry {
    pub fn new(product_id: impl Into<String>, kind: ProductKind, offers: Vec<Offer>) -> Self {
        Self {
            product_id: product_id.into(),
            kind,
            offers,
        }
    }

    /// Find an offer by its identifier
    pub fn offer(&self, offer_id: &str) -> Option<&Offer> {
        self.offers.iter().find(|o| o.offer_id == offer_id)
    }

    /// The cheapest offer; ties resolve to the earliest in backend order
    pub fn cheapest_offer(&self) -> Option<&Offer> {
        self.offers
            .iter()
            .enumerate()
            .min_by_key(|(idx, o)| (o.price_micros, *idx))
            .map(|(_, o)| o)
    }
}

/// A complete catalog produced by one fetch cycle
///
/// Snapshots are immutable and replaced wholesale; consumers never observe
/// entries from two different cycles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    /// Monotonic fetch cycle that produced this snapshot
    pub cycle: u64,
    pub entries: BTreeMap<String, CatalogEntry>,
    pub fetched_at: DateTime<Utc>,
}

impl Catalog {
    pub fn new(cycle: u64, entries: impl IntoIterator<Item = CatalogEntry>) -> Self {
        Self {
            cycle,
            entries: entries
                .into_iter()
                .map(|e| (e.product_id.clone(), e))
                .collect(),
            fetched_at: Utc::now(),
        }
    }

    pub fn get(&self, product_id: &str) -> Option<&CatalogEntry> {
        self.entries.get(product_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn product_ids(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

/// Opaque identifier of one purchase transaction
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PurchaseToken(String);

impl PurchaseToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PurchaseToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PurchaseToken {
    fn from(token: &str) -> Self {
        Self::new(token)
    }
}

/// Purchase state as reported by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseState {
    /// Paid for; must be acknowledged
    Purchased,
    /// Awaiting payment completion
    Pending,
    /// Unknown or unrecognised state
    #[default]
    Unspecified,
}

impl std::fmt::Display for PurchaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PurchaseState::Purchased => write!(f, "purchased"),
            PurchaseState::Pending => write!(f, "pending"),
            PurchaseState::Unspecified => write!(f, "unspecified"),
        }
    }
}

/// One purchase transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseRecord {
    pub token: PurchaseToken,
    pub product_ids: BTreeSet<String>,
    pub state: PurchaseState,
    /// Flips false -> true once and never reverts
    pub acknowledged: bool,
}

impl PurchaseRecord {
    pub fn new<I, S>(token: impl Into<PurchaseToken>, product_ids: I, state: PurchaseState) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            token: token.into(),
            product_ids: product_ids.into_iter().map(Into::into).collect(),
            state,
            acknowledged: false,
        }
    }

    /// Mark the record as already acknowledged by the backend
    pub fn acknowledged(mut self) -> Self {
        self.acknowledged = true;
        self
    }
}

impl From<String> for PurchaseToken {
    fn from(token: String) -> Self {
        Self(token)
    }
}

/// Where a purchase notification came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PurchaseOrigin {
    /// Delivered asynchronously by the gateway
    Live,
    /// Replayed by the restoration pass
    Restored,
}

impl PurchaseOrigin {
    pub fn is_restored(&self) -> bool {
        matches!(self, PurchaseOrigin::Restored)
    }
}

/// Connection state of the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Ready,
    /// Retry budget exhausted; only an explicit re-init leaves this state
    Failed,
}

impl SessionState {
    pub fn is_ready(&self) -> bool {
        matches!(self, SessionState::Ready)
    }

    /// Numeric form used for the session gauge
    pub fn as_gauge(&self) -> f64 {
        match self {
            SessionState::Disconnected => 0.0,
            SessionState::Connecting => 1.0,
            SessionState::Ready => 2.0,
            SessionState::Failed => 3.0,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Disconnected => write!(f, "disconnected"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Ready => write!(f, "ready"),
            SessionState::Failed => write!(f, "failed"),
        }
    }
}

/// Identifier of one Ready period of the session, for log correlation
pub type SessionId = Uuid;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cheapest_offer_prefers_first_on_tie() {
        let entry = CatalogEntry::new(
            "p1",
            ProductKind::OneTime,
            vec![
                Offer::new("a", "tok-a", 990_000),
                Offer::new("b", "tok-b", 490_000),
                Offer::new("c", "tok-c", 490_000),
            ],
        );

        assert_eq!(entry.cheapest_offer().map(|o| o.offer_id.as_str()), Some("b"));
        assert_eq!(entry.offer("c").map(|o| o.offer_token.as_str()), Some("tok-c"));
        assert!(entry.offer("missing").is_none());
    }

    #[test]
    fn test_catalog_keys_by_product_id() {
        let catalog = Catalog::new(
            1,
            vec![
                CatalogEntry::new("s1", ProductKind::Subscription, vec![]),
                CatalogEntry::new("p1", ProductKind::OneTime, vec![]),
            ],
        );

        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.product_ids().collect::<Vec<_>>(), vec!["p1", "s1"]);
        assert_eq!(catalog.get("s1").map(|e| e.kind), Some(ProductKind::Subscription));
    }

    #[test]
    fn test_product_kind_from_config() {
        let product = config::ProductConfig {
            product_id: "monthly".to_string(),
            kind: config::ProductKindConfig::Subscription,
        };
        let spec = ProductSpec::from(&product);
        assert_eq!(spec, ProductSpec::subscription("monthly"));
    }
}

//! Commerce gateway: the seam to the remote backend
//!
//! The engine only talks to the backend through [`CommerceGateway`].
//! [`InMemoryGateway`] is a scripted implementation for tests and local runs.

pub mod memory;
pub mod traits;

pub use memory::InMemoryGateway;
pub use traits::{CommerceGateway, GatewayListener, GatewayNotification, PurchaseFlowRequest};

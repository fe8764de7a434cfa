//! The bridge between the sync core and the outside world: the webhook
//! intake endpoint and the trigger-API facade consumed by the admin layer.

pub mod service;
pub mod webhook;

pub use service::SyncService;
pub use webhook::{router, BridgeState};

//! RideSync
//!
//! Link manager for one BLE peripheral (a helmet intercom): connects when
//! the device comes close, reconnects when the link drops, and serializes
//! GATT operations so the transport never sees two at once.

pub mod domain;
pub mod infrastructure;

pub use domain::error::LinkError;
pub use domain::models::{Command, ConnectionState, PeerId, PresenceStatus};
pub use infrastructure::bluetooth::RideSyncService;

//! Error taxonomy for the link core.
//!
//! Transport failures are captured at the boundary and turned into state
//! transitions or queue actions. Nothing here is meant to escape as a panic.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// Adapter disabled or missing.
    #[error("Bluetooth transport unavailable: {0}")]
    TransportUnavailable(String),

    /// The peer dropped the link.
    #[error("Link lost: {0}")]
    LinkLost(String),

    /// The transport rejected a command before any completion could occur.
    #[error("Command dispatch failed: {0}")]
    CommandDispatchFailed(String),

    #[error("automatic reconnection failed")]
    ReconnectionExhausted,

    #[error("Scan failed: {0}")]
    ScanFailed(String),

    /// A dispatch was attempted while no link is open.
    #[error("No link is open")]
    NoLink,

    /// The transport completed an operation with a non-success status.
    #[error("GATT operation failed with status {status}")]
    Gatt { status: u8 },
}

//! Bluetooth Module
//!
//! Manages the link to a single BLE peripheral: proximity detection,
//! connection lifecycle, single-flight GATT commands.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    RideSyncService                       │
//! │  (Main coordinator - public API for the application)     │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼──────────────────┐
//!         │             │                  │
//!         ▼             ▼                  ▼
//! ┌───────────┐  ┌──────────────┐  ┌──────────────┐
//! │ Presence  │─▶│  Connection  │─▶│ CommandQueue │
//! │           │  │              │  │              │
//! │ - Session │  │ - Lifecycle  │  │ - FIFO       │
//! │   timeout │  │ - Reconnect  │  │ - One in     │
//! │           │  │ - Setup      │  │   flight     │
//! └─────┬─────┘  └──────┬───────┘  └──────┬───────┘
//!       │               │                 │
//!       ▼               ▼                 ▼
//! ┌───────────┐  ┌──────────────────────────────────┐
//! │  Scanner  │  │            Transport             │
//! │ - Sampler │  │ (LinkTransport / ScanTransport,  │
//! │ - Devices │  │  driver or simulator)            │
//! └───────────┘  └──────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`transport`] - Driver traits, link handles and link events
//! - [`protocol`] - Attribute UUIDs, descriptor values and payload parsing
//! - [`command_queue`] - Single-flight command dispatch
//! - [`scanner`] - Proximity sessions and device discovery
//! - [`connection`] - Link lifecycle and automatic reconnection
//! - [`presence`] - Scan-while-disconnected orchestration
//! - [`service`] - Main service coordinator
//! - [`simulator`] - In-memory peripheral

pub mod command_queue;
pub mod connection;
pub mod presence;
pub mod protocol;
pub mod scanner;
pub mod service;
pub mod simulator;
pub mod transport;

// Re-export main service for convenience
pub use service::RideSyncService;

//! Bluetooth Module
//!
//! Keeps a UART-style BLE link to a Bangle.js watch alive and moves text
//! across it in both directions.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    BluetoothService                      │
//! │  (single task - LinkClient requests, timers, records)    │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼──────────────┐
//!         │             │              │
//!         ▼             ▼              ▼
//! ┌────────────┐  ┌────────────┐  ┌───────────┐
//! │ Connection │  │   Framer   │  │ Protocol  │
//! │            │  │            │  │           │
//! │ - Discovery│  │ - Chunk    │  │ - UUIDs   │
//! │ - Reconnect│  │   queue    │  │ - Escaping│
//! │ - GATT     │  │ - Pacing   │  │ - Wrapper │
//! └─────┬──────┘  └────────────┘  └───────────┘
//!       │ LinkTransport
//!       ▼
//! ┌────────────┬────────────┐
//! │  Platform  │ Simulator  │
//! └────────────┴────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Wire constants, escaping and chunk wrapping
//! - [`framer`] - Paced outbound chunk queue
//! - [`transport`] - The radio seam and its callback events
//! - [`connection`] - Connection state machine
//! - [`service`] - Task that owns the state machine
//! - [`simulator`] - In-process watch for running without a radio
//! - `platform` - btleplug transport (feature `ble`)

pub mod connection;
pub mod framer;
#[cfg(feature = "ble")]
pub mod platform;
pub mod protocol;
pub mod service;
pub mod simulator;
pub mod transport;

// Re-export main service for convenience
pub use service::{BluetoothService, LinkClient};

//! Companion-side link to a Bangle.js watch over a UART-style BLE service.
//!
//! [`domain`] holds the transport-free pieces (records, commands, settings);
//! [`infrastructure`] holds the radio, persistence and host integrations.

pub mod domain;
pub mod infrastructure;

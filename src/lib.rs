//! BLE client for ELM327-class OBD-II adapters
//!
//! [`ConnectionManager`] owns the link: it scans for adapters, connects with
//! bounded retry, resolves the UART-style characteristics, and correlates
//! each command with the adapter's prompt-terminated response. The BLE stack
//! itself sits behind [`BlePlatform`]; the `bluez` feature provides a BlueZ
//! implementation.

pub mod command;
pub mod connection;
pub mod transport;

pub use connection::{BackoffConfig, ConnectionConfig, ConnectionManager, StateTransition};
pub use obd_ble_shared::{codec, elm, timing, ConnectionState, LinkError};
pub use transport::{BlePlatform, DiscoveredDevice, DuplicatePolicy, HardwareEvent, ScanConfig};

#[cfg(feature = "bluez")]
pub use transport::BluerPlatform;

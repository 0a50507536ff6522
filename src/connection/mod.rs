//! Connection management for the adapter link
//!
//! This module handles:
//! - Discovery passes with automatic stop
//! - Connect attempts with bounded exponential backoff
//! - Characteristic resolution and notification subscription
//! - A single observable link state

mod manager;

pub use manager::{BackoffConfig, ConnectionConfig, ConnectionManager, StateTransition};

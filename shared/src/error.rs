//! Link error taxonomy
//!
//! These errors are surfaced through the connection state (as the message
//! carried by `ConnectionState::Error`) rather than returned to callers.
//! Only `ShutDown` escapes the public operations.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("Bluetooth permission denied")]
    PermissionDenied,

    #[error("Bluetooth adapter unavailable: {0}")]
    AdapterUnavailable(String),

    #[error("Scan failed with error code {code}")]
    ScanFailed { code: i32 },

    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("No compatible UART service found")]
    NoCompatibleService,

    #[error("Connection timeout")]
    ConnectTimeout,

    #[error("Link manager has been shut down")]
    ShutDown,
}

impl LinkError {
    /// Whether a fresh attempt may succeed without outside remediation
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            LinkError::PermissionDenied | LinkError::AdapterUnavailable(_) | LinkError::ShutDown
        )
    }
}

//! OBD BLE Shared Types
//!
//! This crate provides the platform-independent pieces of the BLE ELM327
//! client: the terminal-style framing codec, the connection state machine,
//! the retry schedule and the error taxonomy.

pub mod backoff;
pub mod codec;
pub mod error;
pub mod state_machine;

pub use backoff::BackoffSchedule;
pub use error::LinkError;
pub use state_machine::{ConnectionState, LinkEvent, LinkStateMachine, TransitionResult};

/// Timing parameters for the link
pub mod timing {
    /// How long a discovery pass runs before stopping itself
    pub const SCAN_DURATION_MS: u64 = 10_000;

    /// Upper bound on a single connect attempt (connect + service resolution)
    pub const CONNECT_TIMEOUT_MS: u64 = 15_000;

    /// How long a command waits for its response frame
    pub const COMMAND_TIMEOUT_MS: u64 = 5_000;

    /// First retry delay
    pub const BACKOFF_INITIAL_MS: u64 = 250;

    /// Largest retry delay
    pub const BACKOFF_MAX_MS: u64 = 8_000;

    /// Number of connect attempts per `connect_with_retry` call
    pub const CONNECT_ATTEMPTS: usize = 6;

    /// Response frames buffered before the oldest is dropped
    pub const RESPONSE_CAPACITY: usize = 16;
}

/// ELM327 adapter commands
pub mod elm {
    /// Reset the adapter
    pub const RESET: &str = "ATZ";
    /// Disable command echo
    pub const ECHO_OFF: &str = "ATE0";
    /// Disable line-feeds after carriage returns
    pub const LINEFEEDS_OFF: &str = "ATL0";
    /// Disable spaces between response bytes
    pub const SPACES_OFF: &str = "ATS0";
    /// Select the OBD protocol automatically
    pub const PROTOCOL_AUTO: &str = "ATSP0";

    /// Sequence issued after every successful connection
    pub const INIT_SEQUENCE: [&str; 5] = [RESET, ECHO_OFF, LINEFEEDS_OFF, SPACES_OFF, PROTOCOL_AUTO];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_sequence_order() {
        assert_eq!(elm::INIT_SEQUENCE[0], "ATZ");
        assert_eq!(elm::INIT_SEQUENCE[4], "ATSP0");
    }

    #[test]
    fn test_timing_defaults() {
        assert!(timing::BACKOFF_INITIAL_MS < timing::BACKOFF_MAX_MS);
        assert!(timing::COMMAND_TIMEOUT_MS < timing::CONNECT_TIMEOUT_MS);
    }
}

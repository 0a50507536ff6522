//! Connection State Machine
//!
//! Defines valid link state transitions. The machine is a pure reducer; the
//! connection manager owns one instance behind its lock and publishes every
//! change, so it is the single writer of the observable state.

use crate::error::LinkError;
use std::fmt;

/// Observable link state
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Scanning,
    Connecting,
    Connected,
    Error(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ConnectionState::Error(_))
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Scanning => write!(f, "Scanning"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Error(message) => write!(f, "Error({})", message),
        }
    }
}

/// Events that can trigger state transitions
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// Discovery pass started
    ScanStarted,
    /// Discovery pass stopped (timeout or request)
    ScanStopped,
    /// Hardware reported a scan error
    ScanFailed { code: i32 },
    /// A connect attempt is beginning
    ConnectRequested,
    /// Hardware reported the link is up; characteristics not yet resolved
    HardwareConnected,
    /// Write/notify characteristics resolved
    ServicesResolved,
    /// The attempt in progress failed
    ConnectFailed(LinkError),
    /// Hardware reported the link went down
    HardwareDisconnected { reason: String },
    /// Caller asked to disconnect
    DisconnectRequested,
    /// Session resources released after a failure
    TornDown,
    /// Permission or adapter missing
    Unavailable(LinkError),
}

/// Result of a state transition attempt
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionResult {
    /// State changed
    Changed { from: ConnectionState, to: ConnectionState },
    /// Event accepted, state unchanged
    Unchanged(ConnectionState),
    /// Transition was invalid from current state
    Invalid { from: ConnectionState, event: LinkEvent },
}

/// The link state machine
#[derive(Debug, Default)]
pub struct LinkStateMachine {
    current_state: ConnectionState,
}

impl LinkStateMachine {
    /// Create a new state machine in Disconnected state
    pub fn new() -> Self {
        Self {
            current_state: ConnectionState::Disconnected,
        }
    }

    /// Get current state
    pub fn state(&self) -> &ConnectionState {
        &self.current_state
    }

    /// Process an event and return the transition result
    pub fn process_event(&mut self, event: LinkEvent) -> TransitionResult {
        match self.next_state(&event) {
            Some(next) if next == self.current_state => TransitionResult::Unchanged(next),
            Some(next) => {
                let from = std::mem::replace(&mut self.current_state, next.clone());
                TransitionResult::Changed { from, to: next }
            }
            None => TransitionResult::Invalid {
                from: self.current_state.clone(),
                event,
            },
        }
    }

    /// Get the next state for a given event, if the transition is valid
    fn next_state(&self, event: &LinkEvent) -> Option<ConnectionState> {
        use ConnectionState::*;
        use LinkEvent::*;

        match (&self.current_state, event) {
            // Adapter problems win from anywhere
            (_, Unavailable(err)) => Some(Error(err.to_string())),

            // Explicit disconnect is forced from anywhere
            (_, DisconnectRequested) => Some(Disconnected),

            // Discovery
            (Disconnected | Scanning | Error(_), ScanStarted) => Some(Scanning),
            (Scanning, ScanStopped) => Some(Disconnected),
            (Scanning, ScanFailed { code }) => {
                Some(Error(LinkError::ScanFailed { code: *code }.to_string()))
            }

            // Connect attempt
            (Disconnected | Scanning | Error(_), ConnectRequested) => Some(Connecting),
            (Connecting, HardwareConnected) => Some(Connecting),
            (Connecting, ServicesResolved) => Some(Connected),
            (Connecting, ConnectFailed(err)) => Some(Error(err.to_string())),
            (Connecting, HardwareDisconnected { reason }) => {
                Some(Error(LinkError::ConnectFailed(reason.clone()).to_string()))
            }

            // Live link dropped
            (Connected, HardwareDisconnected { .. }) => Some(Disconnected),

            // Teardown settles failed or live sessions
            (Error(_) | Connecting | Connected, TornDown) => Some(Disconnected),
            (Disconnected, TornDown) => Some(Disconnected),

            // Invalid transition
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn changed_to(result: &TransitionResult) -> Option<&ConnectionState> {
        match result {
            TransitionResult::Changed { to, .. } => Some(to),
            _ => None,
        }
    }

    #[test]
    fn test_initial_state() {
        let fsm = LinkStateMachine::new();
        assert_eq!(fsm.state(), &ConnectionState::Disconnected);
    }

    #[test]
    fn test_scan_cycle() {
        let mut fsm = LinkStateMachine::new();

        let result = fsm.process_event(LinkEvent::ScanStarted);
        assert_eq!(changed_to(&result), Some(&ConnectionState::Scanning));

        let result = fsm.process_event(LinkEvent::ScanStopped);
        assert_eq!(changed_to(&result), Some(&ConnectionState::Disconnected));
    }

    #[test]
    fn test_scan_stop_when_idle_is_invalid() {
        let mut fsm = LinkStateMachine::new();
        let result = fsm.process_event(LinkEvent::ScanStopped);
        assert!(matches!(result, TransitionResult::Invalid { .. }));
        assert_eq!(fsm.state(), &ConnectionState::Disconnected);
    }

    #[test]
    fn test_scan_failure_carries_code() {
        let mut fsm = LinkStateMachine::new();
        fsm.process_event(LinkEvent::ScanStarted);
        fsm.process_event(LinkEvent::ScanFailed { code: 3 });
        assert_eq!(
            fsm.state(),
            &ConnectionState::Error("Scan failed with error code 3".into())
        );
    }

    #[test]
    fn test_normal_connect_flow() {
        let mut fsm = LinkStateMachine::new();

        fsm.process_event(LinkEvent::ScanStarted);
        let result = fsm.process_event(LinkEvent::ConnectRequested);
        assert_eq!(changed_to(&result), Some(&ConnectionState::Connecting));

        let result = fsm.process_event(LinkEvent::HardwareConnected);
        assert_eq!(result, TransitionResult::Unchanged(ConnectionState::Connecting));

        let result = fsm.process_event(LinkEvent::ServicesResolved);
        assert_eq!(changed_to(&result), Some(&ConnectionState::Connected));

        let result = fsm.process_event(LinkEvent::HardwareDisconnected {
            reason: "link lost".into(),
        });
        assert_eq!(changed_to(&result), Some(&ConnectionState::Disconnected));
    }

    #[test]
    fn test_resolution_failure_then_teardown() {
        let mut fsm = LinkStateMachine::new();
        fsm.process_event(LinkEvent::ConnectRequested);
        fsm.process_event(LinkEvent::HardwareConnected);

        fsm.process_event(LinkEvent::ConnectFailed(LinkError::NoCompatibleService));
        assert_eq!(
            fsm.state(),
            &ConnectionState::Error("No compatible UART service found".into())
        );

        fsm.process_event(LinkEvent::TornDown);
        assert_eq!(fsm.state(), &ConnectionState::Disconnected);
    }

    #[test]
    fn test_disconnect_while_connecting_is_error() {
        let mut fsm = LinkStateMachine::new();
        fsm.process_event(LinkEvent::ConnectRequested);
        fsm.process_event(LinkEvent::HardwareDisconnected {
            reason: "status 133".into(),
        });
        assert!(fsm.state().is_error());
    }

    #[test]
    fn test_unavailable_from_any_state() {
        let mut fsm = LinkStateMachine::new();
        fsm.process_event(LinkEvent::ConnectRequested);
        fsm.process_event(LinkEvent::ServicesResolved);
        fsm.process_event(LinkEvent::Unavailable(LinkError::PermissionDenied));
        assert_eq!(
            fsm.state(),
            &ConnectionState::Error("Bluetooth permission denied".into())
        );
    }

    #[test]
    fn test_disconnect_requested_is_forced() {
        for setup in [
            vec![],
            vec![LinkEvent::ScanStarted],
            vec![LinkEvent::ConnectRequested],
            vec![LinkEvent::ConnectRequested, LinkEvent::ServicesResolved],
            vec![LinkEvent::Unavailable(LinkError::PermissionDenied)],
        ] {
            let mut fsm = LinkStateMachine::new();
            for event in setup {
                fsm.process_event(event);
            }
            fsm.process_event(LinkEvent::DisconnectRequested);
            assert_eq!(fsm.state(), &ConnectionState::Disconnected);
        }
    }

    #[test]
    fn test_error_does_not_self_heal() {
        let mut fsm = LinkStateMachine::new();
        fsm.process_event(LinkEvent::Unavailable(LinkError::AdapterUnavailable(
            "powered off".into(),
        )));

        // Hardware events do not clear the error
        let result = fsm.process_event(LinkEvent::ServicesResolved);
        assert!(matches!(result, TransitionResult::Invalid { .. }));
        assert!(fsm.state().is_error());

        // A new scan does
        fsm.process_event(LinkEvent::ScanStarted);
        assert_eq!(fsm.state(), &ConnectionState::Scanning);
    }

    #[test]
    fn test_cannot_scan_while_connected() {
        let mut fsm = LinkStateMachine::new();
        fsm.process_event(LinkEvent::ConnectRequested);
        fsm.process_event(LinkEvent::ServicesResolved);
        let result = fsm.process_event(LinkEvent::ScanStarted);
        assert!(matches!(result, TransitionResult::Invalid { .. }));
        assert_eq!(fsm.state(), &ConnectionState::Connected);
    }
}

//! Pure connection state machine
//!
//! [`determine_transition`] is the single source of truth for how the
//! connection manager reacts to transport outcomes and reconnect requests.
//! It performs no I/O; the manager carries out the returned [`Action`].

use crate::config::RetrySection;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{info, warn};

/// Lifecycle of the broker session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// The last handshake failed; a retry is scheduled
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs to the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Initial start or a scheduled retry firing
    ConnectRequested,
    HandshakeSucceeded,
    HandshakeFailed(String),
    ConnectionLost(String),
    /// Explicit reconnect from a consumer
    ReconnectRequested,
}

/// Why a retry was scheduled; selects the delay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    ConnectFailed,
    ConnectionLost,
    ManualReconnect,
}

/// Side effect the manager must perform after a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    Subscribe,
    ScheduleRetry(RetryReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub next: ConnectionState,
    pub action: Action,
}

/// Fixed, non-escalating retry delays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub connect_failed: Duration,
    pub connection_lost: Duration,
    pub manual_reconnect: Duration,
}

impl RetryPolicy {
    pub fn delay_for(&self, reason: RetryReason) -> Duration {
        match reason {
            RetryReason::ConnectFailed => self.connect_failed,
            RetryReason::ConnectionLost => self.connection_lost,
            RetryReason::ManualReconnect => self.manual_reconnect,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySection::default())
    }
}

impl From<&RetrySection> for RetryPolicy {
    fn from(section: &RetrySection) -> Self {
        Self {
            connect_failed: Duration::from_millis(section.connect_failure_delay_ms),
            connection_lost: Duration::from_millis(section.connection_lost_delay_ms),
            manual_reconnect: Duration::from_millis(section.manual_reconnect_delay_ms),
        }
    }
}

/// Determine the next state and side effect for an event (pure function)
///
/// Returns `None` when the event does not apply in the current state, for
/// example a handshake result arriving after the manager moved on.
pub fn determine_transition(
    current: ConnectionState,
    event: &ConnectionEvent,
) -> Option<Transition> {
    use ConnectionState::*;

    let transition = match (current, event) {
        (_, ConnectionEvent::ConnectRequested) => Transition {
            next: Connecting,
            action: Action::None,
        },
        (Connecting, ConnectionEvent::HandshakeSucceeded) => Transition {
            next: Connected,
            action: Action::Subscribe,
        },
        (Connecting, ConnectionEvent::HandshakeFailed(_)) => Transition {
            next: Error,
            action: Action::ScheduleRetry(RetryReason::ConnectFailed),
        },
        (Connected, ConnectionEvent::ConnectionLost(_)) => Transition {
            next: Disconnected,
            action: Action::ScheduleRetry(RetryReason::ConnectionLost),
        },
        (_, ConnectionEvent::ReconnectRequested) => Transition {
            next: Connecting,
            action: Action::ScheduleRetry(RetryReason::ManualReconnect),
        },
        _ => return None,
    };

    Some(transition)
}

/// Log connection state transition (pure logging function)
pub fn log_state_transition(from: ConnectionState, to: ConnectionState, event: &ConnectionEvent) {
    match (from, to, event) {
        (_, ConnectionState::Connected, _) => {
            info!("Broker connection established");
        }
        (_, ConnectionState::Error, ConnectionEvent::HandshakeFailed(reason)) => {
            warn!(reason = %reason, "Broker connection attempt failed");
        }
        (
            ConnectionState::Connected,
            ConnectionState::Disconnected,
            ConnectionEvent::ConnectionLost(reason),
        ) => {
            warn!(reason = %reason, "Broker connection lost");
        }
        (_, _, ConnectionEvent::ReconnectRequested) => {
            info!(from = %from, "Reconnect requested");
        }
        _ => {
            info!("Connection state: {} -> {}", from, to);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use ConnectionState::*;

    fn all_states() -> [ConnectionState; 4] {
        [Disconnected, Connecting, Connected, Error]
    }

    #[test]
    fn test_connect_requested_from_any_state() {
        for state in all_states() {
            let transition = determine_transition(state, &ConnectionEvent::ConnectRequested);
            assert_eq!(
                transition,
                Some(Transition {
                    next: Connecting,
                    action: Action::None
                })
            );
        }
    }

    #[test]
    fn test_handshake_success_subscribes() {
        let transition = determine_transition(Connecting, &ConnectionEvent::HandshakeSucceeded);
        assert_eq!(
            transition,
            Some(Transition {
                next: Connected,
                action: Action::Subscribe
            })
        );
    }

    #[test]
    fn test_handshake_failure_schedules_connect_retry() {
        let transition = determine_transition(
            Connecting,
            &ConnectionEvent::HandshakeFailed("refused".to_string()),
        )
        .unwrap();
        assert_eq!(transition.next, Error);
        assert_eq!(
            transition.action,
            Action::ScheduleRetry(RetryReason::ConnectFailed)
        );
    }

    #[test]
    fn test_connection_lost_schedules_lost_retry() {
        let transition = determine_transition(
            Connected,
            &ConnectionEvent::ConnectionLost("eof".to_string()),
        )
        .unwrap();
        assert_eq!(transition.next, Disconnected);
        assert_eq!(
            transition.action,
            Action::ScheduleRetry(RetryReason::ConnectionLost)
        );
    }

    #[test]
    fn test_connection_lost_ignored_unless_connected() {
        for state in [Disconnected, Connecting, Error] {
            assert_eq!(
                determine_transition(state, &ConnectionEvent::ConnectionLost("eof".into())),
                None
            );
        }
    }

    #[test]
    fn test_handshake_results_ignored_outside_connecting() {
        for state in [Disconnected, Connected, Error] {
            assert_eq!(
                determine_transition(state, &ConnectionEvent::HandshakeSucceeded),
                None
            );
            assert_eq!(
                determine_transition(state, &ConnectionEvent::HandshakeFailed("x".into())),
                None
            );
        }
    }

    #[test]
    fn test_default_retry_policy_delays() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.delay_for(RetryReason::ConnectFailed),
            Duration::from_secs(10)
        );
        assert_eq!(
            policy.delay_for(RetryReason::ConnectionLost),
            Duration::from_secs(5)
        );
        assert_eq!(
            policy.delay_for(RetryReason::ManualReconnect),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn test_state_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Connected).unwrap(), "\"connected\"");
        assert_eq!(Error.to_string(), "error");
    }

    fn arb_state() -> impl Strategy<Value = ConnectionState> {
        prop_oneof![
            Just(Disconnected),
            Just(Connecting),
            Just(Connected),
            Just(Error)
        ]
    }

    proptest! {
        #[test]
        fn prop_reconnect_always_reaches_connecting_with_manual_retry(state in arb_state()) {
            let transition = determine_transition(state, &ConnectionEvent::ReconnectRequested).unwrap();
            prop_assert_eq!(transition.next, Connecting);
            prop_assert_eq!(transition.action, Action::ScheduleRetry(RetryReason::ManualReconnect));
        }

        #[test]
        fn prop_only_handshake_success_reaches_connected(state in arb_state(), reason in "[a-z]{0,8}") {
            let events = [
                ConnectionEvent::ConnectRequested,
                ConnectionEvent::HandshakeFailed(reason.clone()),
                ConnectionEvent::ConnectionLost(reason),
                ConnectionEvent::ReconnectRequested,
            ];
            for event in &events {
                if let Some(transition) = determine_transition(state, event) {
                    prop_assert_ne!(transition.next, Connected);
                }
            }
        }
    }
}

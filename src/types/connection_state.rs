//! Connection state machine for reconnecting sources

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a reconnecting frame source.
///
/// ```text
/// Connecting ──► Connected ◄──► Reconnecting
///      │             │               │
///      └─────────────┴──► Stopped ◄──┘
/// ```
///
/// `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting,
    Stopped,
}

impl ConnectionState {
    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        match (self, next) {
            (Stopped, _) => false,
            (_, Stopped) => true,
            (Connecting, Connected) => true,
            (Connected, Reconnecting) => true,
            (Reconnecting, Connected) => true,
            _ => false,
        }
    }

    /// Frames may only be read while connected.
    pub fn is_readable(self) -> bool {
        self == ConnectionState::Connected
    }

    pub fn is_terminal(self) -> bool {
        self == ConnectionState::Stopped
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::ConnectionState::*;
    use super::*;

    const ALL: [ConnectionState; 4] = [Connecting, Connected, Reconnecting, Stopped];

    #[test]
    fn legal_transitions() {
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Reconnecting));
        assert!(Reconnecting.can_transition_to(Connected));
        assert!(Reconnecting.can_transition_to(Stopped));
    }

    #[test]
    fn stop_is_reachable_from_every_live_state() {
        for state in [Connecting, Connected, Reconnecting] {
            assert!(state.can_transition_to(Stopped), "{state} -> stopped");
        }
    }

    #[test]
    fn stopped_is_terminal() {
        for next in ALL {
            assert!(!Stopped.can_transition_to(next));
        }
        assert!(Stopped.is_terminal());
    }

    #[test]
    fn shortcuts_are_rejected() {
        assert!(!Connecting.can_transition_to(Reconnecting));
        assert!(!Connected.can_transition_to(Connecting));
        assert!(!Reconnecting.can_transition_to(Connecting));
        assert!(!Connected.can_transition_to(Connected));
    }

    #[test]
    fn only_connected_is_readable() {
        let readable: Vec<_> = ALL.into_iter().filter(|s| s.is_readable()).collect();
        assert_eq!(readable, vec![Connected]);
    }
}

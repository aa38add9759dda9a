use serde::{Deserialize, Serialize};
use std::fmt;

/// Caller-facing lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

impl ConnectionState {
    /// Whether a session may move from `self` to `next`.
    ///
    /// `Connected` is only reachable from `Connecting`; a finished session
    /// (`Disconnected` or `Failed`) may only start over through `Connecting`
    /// or settle into `Disconnected`.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Idle, Disconnected)
                | (Connecting, Connected)
                | (Connecting, Failed)
                | (Connecting, Disconnected)
                | (Connected, Disconnected)
                | (Connected, Failed)
                | (Disconnected, Connecting)
                | (Failed, Connecting)
                | (Failed, Disconnected)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Failed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Lifecycle of a single peer-to-peer connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    #[default]
    New,
    Negotiating,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PeerState::Disconnected | PeerState::Failed | PeerState::Closed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [ConnectionState; 5] = [
        ConnectionState::Idle,
        ConnectionState::Connecting,
        ConnectionState::Connected,
        ConnectionState::Disconnected,
        ConnectionState::Failed,
    ];

    #[test]
    fn test_connected_only_reachable_from_connecting() {
        for from in ALL {
            let allowed = from.can_transition_to(ConnectionState::Connected);
            assert_eq!(allowed, from == ConnectionState::Connecting, "from {from}");
        }
    }

    #[test]
    fn test_idle_cannot_fail_directly() {
        assert!(!ConnectionState::Idle.can_transition_to(ConnectionState::Failed));
        assert!(ConnectionState::Idle.can_transition_to(ConnectionState::Connecting));
    }

    #[test]
    fn test_finished_sessions_can_reconnect() {
        assert!(ConnectionState::Disconnected.can_transition_to(ConnectionState::Connecting));
        assert!(ConnectionState::Failed.can_transition_to(ConnectionState::Connecting));
        assert!(ConnectionState::Failed.is_terminal());
        assert!(!ConnectionState::Connected.is_terminal());
    }

    #[test]
    fn test_peer_terminal_states() {
        assert!(PeerState::Closed.is_terminal());
        assert!(!PeerState::Negotiating.is_terminal());
    }
}

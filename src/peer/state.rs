use serde::Serialize;
use std::fmt;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

/// Роль в паре; назначается relay, локально не выбирается
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Создаёт offer
    Initiator,
    /// Отвечает на offer
    Responder,
}

impl Role {
    pub fn from_flag(is_initiator: bool) -> Self {
        if is_initiator {
            Role::Initiator
        } else {
            Role::Responder
        }
    }
}

/// Состояние согласования одной сессии
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NegotiationState {
    Idle,
    Negotiating,
    Connected,
    Closed,
}

/// Состояние транспорта, как его сообщает peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerConnectionState {
    /// Состояния, после которых сессия считается потерянной
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PeerConnectionState::Disconnected
                | PeerConnectionState::Failed
                | PeerConnectionState::Closed
        )
    }
}

impl From<RTCPeerConnectionState> for PeerConnectionState {
    fn from(st: RTCPeerConnectionState) -> Self {
        match st {
            RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
            RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
            RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
            RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => {
                PeerConnectionState::New
            }
        }
    }
}

impl fmt::Display for PeerConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PeerConnectionState::New => "new",
            PeerConnectionState::Connecting => "connecting",
            PeerConnectionState::Connected => "connected",
            PeerConnectionState::Disconnected => "disconnected",
            PeerConnectionState::Failed => "failed",
            PeerConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(PeerConnectionState::Failed.is_terminal());
        assert!(PeerConnectionState::Disconnected.is_terminal());
        assert!(PeerConnectionState::Closed.is_terminal());
        assert!(!PeerConnectionState::Connecting.is_terminal());
        assert!(!PeerConnectionState::Connected.is_terminal());
    }

    #[test]
    fn test_rtc_state_mapping() {
        assert_eq!(
            PeerConnectionState::from(RTCPeerConnectionState::Unspecified),
            PeerConnectionState::New
        );
        assert_eq!(
            PeerConnectionState::from(RTCPeerConnectionState::Failed).to_string(),
            "failed"
        );
    }
}

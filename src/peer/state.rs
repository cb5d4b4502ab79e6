use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

/// Wait before a dropped connection is declared failed.
pub const GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Connection state of one call, owned by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Checking,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// `failed` and `closed` end the session; a new attempt needs a new controller.
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }

    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match self {
            New => matches!(next, Connecting | Closed),
            Connecting => matches!(next, Checking | Connected | Disconnected | Failed | Closed),
            Checking => matches!(next, Connected | Disconnected | Failed | Closed),
            Connected => matches!(next, Disconnected | Failed | Closed),
            Disconnected => matches!(next, Connecting | Checking | Connected | Failed | Closed),
            Failed | Closed => false,
        }
    }

    /// Maps an ICE connection state; `None` for states the controller ignores.
    pub fn from_ice(state: RTCIceConnectionState) -> Option<Self> {
        match state {
            RTCIceConnectionState::Checking => Some(ConnectionState::Checking),
            RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
                Some(ConnectionState::Connected)
            }
            RTCIceConnectionState::Disconnected => Some(ConnectionState::Disconnected),
            RTCIceConnectionState::Failed => Some(ConnectionState::Failed),
            RTCIceConnectionState::Closed => Some(ConnectionState::Closed),
            _ => None,
        }
    }

    /// DTLS-level failures only show up on the peer connection state.
    pub fn from_peer(state: RTCPeerConnectionState) -> Option<Self> {
        match state {
            RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
            RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::New => "new",
            ConnectionState::Checking => "checking",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::peer::state::ConnectionState;

/// `urls` is either a single string or a list, as in the browser's RTCIceServer.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum IceUrls {
    One(String),
    Many(Vec<String>),
}

impl IceUrls {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            IceUrls::One(url) => vec![url.clone()],
            IceUrls::Many(urls) => urls.clone(),
        }
    }
}

/// ICE server entry
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: IceUrls,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: IceUrls::One(url.into()),
            username: None,
            credential: None,
        }
    }

    pub fn has_credentials(&self) -> bool {
        self.username.is_some() && self.credential.is_some()
    }
}

/// Body of `GET /turn-credentials`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TurnCredentials {
    #[serde(rename = "iceServers", default)]
    pub ice_servers: Vec<IceServer>,
}

/// Events forwarded from peer connection callbacks to the controller.
#[derive(Debug)]
pub enum PeerEvent {
    State(ConnectionState),
    /// A remote audio track arrived; `frames` yields its RTP payloads.
    RemoteAudioTrack {
        track_id: String,
        frames: mpsc::Receiver<Bytes>,
    },
}

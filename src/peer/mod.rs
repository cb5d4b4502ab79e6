pub mod connection;
pub mod data_channel;
pub mod ice;
pub mod state;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::CallResult;
use crate::media::LocalTrack;

pub use connection::{WebRtcConnector, WebRtcPeer};
pub use state::{ConnectionState, GRACE_PERIOD};
pub use types::{IceServer, IceUrls, PeerEvent, TurnCredentials};

/// Everything needed to build one peer connection.
pub struct PeerSetup {
    pub ice_servers: Vec<IceServer>,
    /// Receives state changes and remote tracks; dropped when the peer goes away.
    pub events: mpsc::UnboundedSender<PeerEvent>,
    pub heartbeat_interval: Duration,
    /// Cancelled when the call is torn down.
    pub shutdown: CancellationToken,
}

#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(&self, setup: PeerSetup) -> CallResult<Arc<dyn PeerLink>>;
}

/// One negotiated peer connection, used once and never reused.
#[async_trait]
pub trait PeerLink: Send + Sync {
    async fn add_local_track(&self, track: Arc<LocalTrack>) -> CallResult<()>;

    /// Creates an offer that receives audio and installs it as the local description.
    async fn create_offer(&self) -> CallResult<()>;

    /// Resolves when ICE gathering completes; callers bound it with a timeout.
    async fn gathering_complete(&self);

    async fn local_sdp(&self) -> CallResult<String>;

    async fn apply_answer(&self, sdp: String) -> CallResult<()>;

    /// Closes the connection. Closing twice is a no-op.
    async fn close(&self) -> CallResult<()>;

    fn is_closed(&self) -> bool;
}

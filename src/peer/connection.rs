use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::TrackLocal;

use crate::error::{CallError, CallResult};
use crate::logger::{dump_candidate, dump_selected_pair};
use crate::media::LocalTrack;
use crate::peer::data_channel::open_heartbeat;
use crate::peer::ice::to_rtc_ice_servers;
use crate::peer::state::ConnectionState;
use crate::peer::types::{IceServer, PeerEvent};
use crate::peer::{PeerConnector, PeerLink, PeerSetup};

/// Buffered RTP payloads per remote track before the reader starts dropping.
const REMOTE_FRAME_BUFFER: usize = 64;

/// Builds real `webrtc` peer connections.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebRtcConnector;

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn connect(&self, setup: PeerSetup) -> CallResult<Arc<dyn PeerLink>> {
        let pc = new_peer(&setup).await?;
        Ok(Arc::new(WebRtcPeer::new(pc)))
    }
}

async fn new_peer(setup: &PeerSetup) -> CallResult<Arc<RTCPeerConnection>> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;
    let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let pc = Arc::new(api.new_peer_connection(rtc_config(&setup.ice_servers)).await?);

    pc.on_ice_candidate(Box::new(|cand: Option<RTCIceCandidate>| {
        match cand {
            Some(c) => dump_candidate("LOCAL", &c),
            None => debug!("ICE candidate gathering finished"),
        }
        Box::pin(async {})
    }));

    pc.on_ice_gathering_state_change(Box::new(|state| {
        debug!(?state, "ICE gathering state changed");
        Box::pin(async {})
    }));

    pc.on_ice_connection_state_change(Box::new({
        let events = setup.events.clone();
        move |st: RTCIceConnectionState| {
            debug!(state = ?st, "ICE connection state changed");
            if let Some(state) = ConnectionState::from_ice(st) {
                let _ = events.send(PeerEvent::State(state));
            }
            Box::pin(async {})
        }
    }));

    // Weak so the callback does not keep its own connection alive.
    let pc_weak = Arc::downgrade(&pc);
    pc.on_peer_connection_state_change(Box::new({
        let events = setup.events.clone();
        move |st: RTCPeerConnectionState| {
            debug!(state = ?st, "peer connection state changed");
            if st == RTCPeerConnectionState::Failed {
                if let Some(pc) = pc_weak.upgrade() {
                    tokio::spawn(async move {
                        dump_selected_pair(&pc, "BEFORE-FAIL").await;
                    });
                }
            }
            if let Some(state) = ConnectionState::from_peer(st) {
                let _ = events.send(PeerEvent::State(state));
            }
            Box::pin(async {})
        }
    }));

    pc.on_track(Box::new({
        let events = setup.events.clone();
        move |track, _receiver, _transceiver| {
            if track.kind() != RTPCodecType::Audio {
                debug!(kind = %track.kind(), "ignoring remote track");
                return Box::pin(async {});
            }
            let track_id = format!("remote-audio-{}", track.ssrc());
            info!(%track_id, codec = %track.codec().capability.mime_type, "remote audio track");

            let (tx, rx) = mpsc::channel::<Bytes>(REMOTE_FRAME_BUFFER);
            // The handler must return promptly, so the reader gets its own task.
            tokio::spawn(async move {
                while let Ok((packet, _)) = track.read_rtp().await {
                    if tx.try_send(packet.payload).is_err() && tx.is_closed() {
                        break;
                    }
                }
                debug!(ssrc = track.ssrc(), "remote track reader stopped");
            });

            let _ = events.send(PeerEvent::RemoteAudioTrack { track_id, frames: rx });
            Box::pin(async {})
        }
    }));

    open_heartbeat(&pc, setup.heartbeat_interval, setup.shutdown.clone()).await;

    Ok(pc)
}

fn rtc_config(servers: &[IceServer]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: to_rtc_ice_servers(servers),
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    gathering: tokio::sync::Mutex<Option<mpsc::Receiver<()>>>,
    closed: AtomicBool,
}

impl WebRtcPeer {
    pub fn new(pc: Arc<RTCPeerConnection>) -> Self {
        Self {
            pc,
            gathering: tokio::sync::Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    async fn ensure_audio_receiver(&self) -> CallResult<()> {
        let has_audio = self
            .pc
            .get_transceivers()
            .await
            .iter()
            .any(|t| t.kind() == RTPCodecType::Audio);
        if !has_audio {
            self.pc
                .add_transceiver_from_kind(
                    RTPCodecType::Audio,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await?;
            debug!("added recvonly audio transceiver");
        }
        Ok(())
    }
}

#[async_trait]
impl PeerLink for WebRtcPeer {
    async fn add_local_track(&self, track: Arc<LocalTrack>) -> CallResult<()> {
        let rtc_track: Arc<dyn TrackLocal + Send + Sync> = track.rtc_track();
        let rtp_sender = self.pc.add_track(rtc_track).await?;
        // RTCP has to be read for interceptors to work.
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtp_sender.read(&mut buf).await.is_ok() {}
        });
        debug!(kind = ?track.kind(), "local track added");
        Ok(())
    }

    async fn create_offer(&self) -> CallResult<()> {
        self.ensure_audio_receiver().await?;
        let offer = self.pc.create_offer(None).await?;
        // Promise must exist before gathering starts.
        let done = self.pc.gathering_complete_promise().await;
        self.pc.set_local_description(offer).await?;
        *self.gathering.lock().await = Some(done);
        Ok(())
    }

    async fn gathering_complete(&self) {
        let done = self.gathering.lock().await.take();
        if let Some(mut done) = done {
            let _ = done.recv().await;
        }
    }

    async fn local_sdp(&self) -> CallResult<String> {
        self.pc
            .local_description()
            .await
            .map(|d| d.sdp)
            .ok_or_else(|| CallError::Negotiation("no local description".into()))
    }

    async fn apply_answer(&self, sdp: String) -> CallResult<()> {
        let answer = RTCSessionDescription::answer(sdp)?;
        self.pc.set_remote_description(answer).await?;
        debug!("remote answer applied");
        Ok(())
    }

    async fn close(&self) -> CallResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = self.pc.close().await {
            warn!(error = %e, "peer connection close failed");
            return Err(e.into());
        }
        debug!("peer connection closed");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    fn setup() -> (PeerSetup, mpsc::UnboundedReceiver<PeerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let setup = PeerSetup {
            ice_servers: Vec::new(),
            events: tx,
            heartbeat_interval: Duration::from_secs(15),
            shutdown: CancellationToken::new(),
        };
        (setup, rx)
    }

    #[test]
    fn config_bundles_and_muxes() {
        let cfg = rtc_config(&[IceServer::stun("stun.example.org:3478")]);
        assert_eq!(cfg.bundle_policy, RTCBundlePolicy::MaxBundle);
        assert_eq!(cfg.rtcp_mux_policy, RTCRtcpMuxPolicy::Require);
        assert_eq!(cfg.ice_servers[0].urls, vec!["stun:stun.example.org:3478"]);
    }

    #[tokio::test]
    async fn offer_receives_audio_and_close_is_idempotent() {
        let (setup, _rx) = setup();
        let peer = WebRtcConnector.connect(setup).await.unwrap();
        peer.create_offer().await.unwrap();
        let sdp = peer.local_sdp().await.unwrap();
        assert!(sdp.starts_with("v=0"));
        assert!(sdp.contains("m=audio"));

        peer.close().await.unwrap();
        peer.close().await.unwrap();
        assert!(peer.is_closed());
    }
}

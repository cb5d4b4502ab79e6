#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};

use mockcall::media::playback::{AudioOutput, PlaybackError, RemoteAudioStream};
use mockcall::media::{LocalMedia, LocalTrack, MediaConstraints, MediaDevices};
use mockcall::peer::{IceServer, PeerConnector, PeerEvent, PeerLink, PeerSetup};
use mockcall::signaling::{SessionToken, Signaling};
use mockcall::{
    Access, CallConfig, CallController, CallDeps, CallError, CallEvent, CallResult, CallTarget,
    CallTargetId, SignalingStep,
};

pub const OFFER_SDP: &str = "v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\ns=-\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=candidate:1 1 udp 2130706431 192.168.1.2 50000 typ host\r\n";
pub const ANSWER_SDP: &str = "v=0\r\no=- 3 4 IN IP4 203.0.113.9\r\ns=-\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailAt {
    #[default]
    Nothing,
    Turn,
    Token,
    Sdp,
}

fn server_error(step: SignalingStep) -> CallError {
    CallError::Http {
        step,
        status: 500,
        message: "Internal Server Error".into(),
    }
}

#[derive(Default)]
pub struct FakeSignaling {
    pub fail_at: FailAt,
    pub turn_delay: Option<Duration>,
    pub token_ttls: Mutex<Vec<Duration>>,
    pub offers: Mutex<Vec<String>>,
    pub completed: Mutex<Vec<CallTarget>>,
}

impl FakeSignaling {
    pub fn failing(fail_at: FailAt) -> Self {
        Self {
            fail_at,
            ..Default::default()
        }
    }
}

#[async_trait]
impl Signaling for FakeSignaling {
    async fn turn_credentials(&self) -> CallResult<Vec<IceServer>> {
        if let Some(delay) = self.turn_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_at == FailAt::Turn {
            return Err(server_error(SignalingStep::TurnCredentials));
        }
        Ok(vec![IceServer::stun("stun:stun.example.org:3478")])
    }

    async fn session_token(&self, _target: &CallTarget, ttl: Duration) -> CallResult<SessionToken> {
        self.token_ttls.lock().push(ttl);
        if self.fail_at == FailAt::Token {
            return Err(server_error(SignalingStep::SessionToken));
        }
        Ok(SessionToken::new("ephemeral-token"))
    }

    async fn exchange_sdp(&self, token: &SessionToken, offer_sdp: &str) -> CallResult<String> {
        assert_eq!(token.expose(), "ephemeral-token");
        self.offers.lock().push(offer_sdp.to_owned());
        if self.fail_at == FailAt::Sdp {
            return Err(server_error(SignalingStep::SdpExchange));
        }
        Ok(ANSWER_SDP.to_owned())
    }

    async fn complete_question(&self, target: &CallTarget) -> CallResult<()> {
        self.completed.lock().push(target.clone());
        Ok(())
    }
}

pub struct FakePeer {
    events: mpsc::UnboundedSender<PeerEvent>,
    auto_connect: bool,
    pub tracks: AtomicUsize,
    pub answer: Mutex<Option<String>>,
    pub close_calls: AtomicUsize,
    closed: AtomicBool,
}

impl FakePeer {
    /// Pushes a peer event as if the connection produced it.
    pub fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl PeerLink for FakePeer {
    async fn add_local_track(&self, _track: Arc<LocalTrack>) -> CallResult<()> {
        self.tracks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn create_offer(&self) -> CallResult<()> {
        Ok(())
    }

    async fn gathering_complete(&self) {}

    async fn local_sdp(&self) -> CallResult<String> {
        Ok(OFFER_SDP.to_owned())
    }

    async fn apply_answer(&self, sdp: String) -> CallResult<()> {
        *self.answer.lock() = Some(sdp);
        if self.auto_connect {
            self.emit(PeerEvent::State(mockcall::ConnectionState::Connected));
        }
        Ok(())
    }

    async fn close(&self) -> CallResult<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub struct FakeConnector {
    pub auto_connect: bool,
    pub peers: Mutex<Vec<Arc<FakePeer>>>,
    pub ice_servers: Mutex<Vec<IceServer>>,
}

impl FakeConnector {
    pub fn new(auto_connect: bool) -> Self {
        Self {
            auto_connect,
            peers: Mutex::new(Vec::new()),
            ice_servers: Mutex::new(Vec::new()),
        }
    }

    pub fn peer(&self) -> Arc<FakePeer> {
        Arc::clone(self.peers.lock().first().expect("no peer was created"))
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }
}

#[async_trait]
impl PeerConnector for FakeConnector {
    async fn connect(&self, setup: PeerSetup) -> CallResult<Arc<dyn PeerLink>> {
        *self.ice_servers.lock() = setup.ice_servers.clone();
        let peer = Arc::new(FakePeer {
            events: setup.events,
            auto_connect: self.auto_connect,
            tracks: AtomicUsize::new(0),
            answer: Mutex::new(None),
            close_calls: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        });
        self.peers.lock().push(Arc::clone(&peer));
        let link: Arc<dyn PeerLink> = peer;
        Ok(link)
    }
}

#[derive(Default)]
pub struct FakeDevices {
    pub deny: bool,
    pub tracks: Mutex<Vec<Arc<LocalTrack>>>,
    pub requested: Mutex<Vec<MediaConstraints>>,
}

impl FakeDevices {
    pub fn denying() -> Self {
        Self {
            deny: true,
            ..Default::default()
        }
    }

    pub fn all_stopped(&self) -> bool {
        let tracks = self.tracks.lock();
        !tracks.is_empty() && tracks.iter().all(|t| t.is_stopped())
    }

    pub fn audio_enabled(&self) -> Vec<bool> {
        self.tracks
            .lock()
            .iter()
            .filter(|t| t.kind() == mockcall::media::TrackKind::Audio)
            .map(|t| t.is_enabled())
            .collect()
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn acquire(&self, constraints: &MediaConstraints) -> CallResult<LocalMedia> {
        self.requested.lock().push(*constraints);
        if self.deny {
            return Err(CallError::PermissionDenied("NotAllowedError".into()));
        }
        let media = LocalMedia::new(*constraints);
        self.tracks.lock().extend(media.tracks().iter().cloned());
        Ok(media)
    }
}

/// Blocks the first `blocked` play attempts, then plays.
pub struct FakeOutput {
    blocked: AtomicUsize,
    pub attempts: AtomicUsize,
}

impl FakeOutput {
    pub fn blocking(blocked: usize) -> Self {
        Self {
            blocked: AtomicUsize::new(blocked),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Lifts the autoplay block, as a user gesture does for the page.
    pub fn unlock(&self) {
        self.blocked.store(0, Ordering::SeqCst);
    }
}

impl AudioOutput for FakeOutput {
    fn play(&self, _stream: &RemoteAudioStream) -> Result<(), PlaybackError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let left = self.blocked.load(Ordering::SeqCst);
        if left > 0 {
            self.blocked.store(left - 1, Ordering::SeqCst);
            return Err(PlaybackError::Blocked);
        }
        Ok(())
    }
}

pub struct Harness {
    pub controller: CallController,
    pub events: broadcast::Receiver<CallEvent>,
    pub signaling: Arc<FakeSignaling>,
    pub connector: Arc<FakeConnector>,
    pub devices: Arc<FakeDevices>,
    pub output: Arc<FakeOutput>,
}

pub struct HarnessBuilder {
    access: Access,
    signaling: FakeSignaling,
    devices: FakeDevices,
    auto_connect: bool,
    blocked_plays: usize,
}

impl Default for HarnessBuilder {
    fn default() -> Self {
        Self {
            access: Access::Paid,
            signaling: FakeSignaling::default(),
            devices: FakeDevices::default(),
            auto_connect: true,
            blocked_plays: 0,
        }
    }
}

impl HarnessBuilder {
    pub fn access(mut self, access: Access) -> Self {
        self.access = access;
        self
    }

    pub fn signaling(mut self, signaling: FakeSignaling) -> Self {
        self.signaling = signaling;
        self
    }

    pub fn devices(mut self, devices: FakeDevices) -> Self {
        self.devices = devices;
        self
    }

    pub fn manual_connect(mut self) -> Self {
        self.auto_connect = false;
        self
    }

    pub fn blocked_plays(mut self, n: usize) -> Self {
        self.blocked_plays = n;
        self
    }

    pub fn build(self) -> Harness {
        let signaling = Arc::new(self.signaling);
        let connector = Arc::new(FakeConnector::new(self.auto_connect));
        let devices = Arc::new(self.devices);
        let output = Arc::new(FakeOutput::blocking(self.blocked_plays));
        let deps = CallDeps {
            signaling: signaling.clone(),
            connector: connector.clone(),
            devices: devices.clone(),
            output: output.clone(),
        };
        let target = CallTarget::new(CallTargetId::new("market-sizing").unwrap()).with_question(Some(2));
        let controller = CallController::new(target, self.access, CallConfig::default(), deps);
        let events = controller.subscribe();
        Harness {
            controller,
            events,
            signaling,
            connector,
            devices,
            output,
        }
    }
}

pub fn harness() -> HarnessBuilder {
    HarnessBuilder::default()
}

impl Harness {
    /// Every event emitted so far.
    pub fn drain(&mut self) -> Vec<CallEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    pub async fn wait_for_state(&self, state: mockcall::ConnectionState) {
        let mut rx = self.controller.watch_state();
        tokio::time::timeout(Duration::from_secs(30), rx.wait_for(|s| *s == state))
            .await
            .expect("timed out waiting for state")
            .expect("state channel closed");
    }

    /// Lets spawned tasks run without advancing time much.
    pub async fn settle(&self) {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }
}

pub fn transitions(events: &[CallEvent]) -> Vec<(mockcall::ConnectionState, mockcall::ConnectionState)> {
    events
        .iter()
        .filter_map(|e| match e {
            CallEvent::StateChanged { from, to } => Some((*from, *to)),
            _ => None,
        })
        .collect()
}

pub fn error_notifications(events: &[CallEvent]) -> usize {
    events
        .iter()
        .filter(|e| {
            matches!(e, CallEvent::Notify(n) if n.severity == mockcall::Severity::Error)
        })
        .count()
}

//! The call session controller.
//!
//! One [`CallController`] drives one call: it owns the local media, the peer link and every
//! background loop, publishes state through watch channels and discrete events through the
//! [`EventBus`], and releases everything through a single teardown path.

pub mod resources;
pub mod timer;
pub mod trial;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{interval, interval_at, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::CallConfig;
use crate::error::{CallError, CallResult};
use crate::events::{CallEvent, Destination, EventBus, Notification};
use crate::media::level::AudioLevelMeter;
use crate::media::playback::{
    play_with_retries, AudioOutput, PlaybackOutcome, PlaybackPolicy, RemoteAudioStream,
};
use crate::media::{MediaConstraints, MediaDevices};
use crate::peer::ice::{analyze_candidates, combined_ice_servers, wait_for_gathering, GatheringOutcome};
use crate::peer::{ConnectionState, PeerConnector, PeerEvent, PeerSetup, WebRtcConnector};
use crate::session::{Access, CallSnapshot, CallTarget};
use crate::signaling::{HttpSignaling, Signaling};

use resources::{CallResources, Released};
use timer::{CallClock, TICK};
use trial::TrialVerdict;

/// The outside world a controller talks to.
#[derive(Clone)]
pub struct CallDeps {
    pub signaling: Arc<dyn Signaling>,
    pub connector: Arc<dyn PeerConnector>,
    pub devices: Arc<dyn MediaDevices>,
    pub output: Arc<dyn AudioOutput>,
}

impl CallDeps {
    /// HTTP signaling against the configured backend, real peer connections and the
    /// default audio devices when built with `device-cpal`.
    pub fn from_config(config: &CallConfig) -> CallResult<Self> {
        let (devices, output) = default_audio();
        Ok(Self {
            signaling: Arc::new(HttpSignaling::new(config)?),
            connector: Arc::new(WebRtcConnector),
            devices,
            output,
        })
    }
}

#[cfg(feature = "device-cpal")]
fn default_audio() -> (Arc<dyn MediaDevices>, Arc<dyn AudioOutput>) {
    use crate::media::cpal_device::{CpalDevices, CpalOutput};
    (Arc::new(CpalDevices), Arc::new(CpalOutput::default()))
}

/// Without device support tracks are fed by the embedder and remote audio is drained.
#[cfg(not(feature = "device-cpal"))]
fn default_audio() -> (Arc<dyn MediaDevices>, Arc<dyn AudioOutput>) {
    use crate::media::playback::DrainOutput;
    use crate::media::SampleTrackDevices;
    (Arc::new(SampleTrackDevices), Arc::new(DrainOutput))
}

pub struct CallController {
    inner: Arc<Inner>,
}

struct Inner {
    target: CallTarget,
    access: Access,
    config: CallConfig,
    deps: CallDeps,
    events: EventBus,
    state: watch::Sender<ConnectionState>,
    duration: watch::Sender<u64>,
    level: watch::Sender<f32>,
    started_at: OnceLock<DateTime<Utc>>,
    muted: AtomicBool,
    connecting: AtomicBool,
    ended: AtomicBool,
    call_active: AtomicBool,
    resources: Mutex<CallResources>,
    shutdown: CancellationToken,
}

/// Held for the length of a `connect`. Clears the in-progress flag on the way out; if the
/// future is dropped before `finish`, whatever the attempt acquired is released.
struct ConnectGuard {
    inner: Arc<Inner>,
    finished: bool,
}

impl ConnectGuard {
    fn new(inner: &Arc<Inner>) -> Self {
        Self {
            inner: Arc::clone(inner),
            finished: false,
        }
    }

    fn finish(mut self) {
        self.finished = true;
    }
}

impl Drop for ConnectGuard {
    fn drop(&mut self) {
        if !self.finished {
            let inner = &self.inner;
            let final_state = match inner.state() {
                ConnectionState::New => None,
                _ => Some(ConnectionState::Closed),
            };
            warn!(state = %inner.state(), "connect abandoned before it finished");
            inner
                .begin_teardown(final_state)
                .release_detached("abandoned connect");
        }
        self.inner.connecting.store(false, Ordering::SeqCst);
    }
}

impl CallController {
    pub fn new(target: CallTarget, access: Access, config: CallConfig, deps: CallDeps) -> Self {
        let inner = Inner {
            target,
            access,
            config,
            deps,
            events: EventBus::new(),
            state: watch::channel(ConnectionState::New).0,
            duration: watch::channel(0).0,
            level: watch::channel(0.0).0,
            started_at: OnceLock::new(),
            muted: AtomicBool::new(false),
            connecting: AtomicBool::new(false),
            ended: AtomicBool::new(false),
            call_active: AtomicBool::new(false),
            resources: Mutex::new(CallResources::default()),
            shutdown: CancellationToken::new(),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn with_defaults(target: CallTarget, access: Access, config: CallConfig) -> CallResult<Self> {
        config.validate()?;
        let deps = CallDeps::from_config(&config)?;
        Ok(Self::new(target, access, config, deps))
    }

    /// Runs the connect sequence up to the applied answer. The call itself starts when the
    /// connection reports `connected`.
    pub async fn connect(&self) -> CallResult<()> {
        let inner = &self.inner;
        if inner.connecting.swap(true, Ordering::SeqCst) {
            return Err(CallError::ConnectInProgress);
        }
        let guard = ConnectGuard::new(inner);

        let state = inner.state();
        let result = if state != ConnectionState::New || inner.shutdown.is_cancelled() {
            Err(CallError::SessionUnavailable(state))
        } else {
            info!(target_id = %inner.target.id, question = inner.target.question_number, "connecting");
            match Inner::run_connect(inner).await {
                Ok(()) => Ok(()),
                Err(e) => {
                    inner.fail_connect(&e).await;
                    Err(e)
                }
            }
        };
        guard.finish();
        result
    }

    /// Flips mute and returns the new value.
    pub fn toggle_mute(&self) -> bool {
        let inner = &self.inner;
        // Flag and tracks change under the resources lock so a connect storing its media
        // cannot slip in between.
        let muted = {
            let res = inner.resources.lock();
            let muted = !inner.muted.fetch_xor(true, Ordering::SeqCst);
            if let Some(media) = res.media.as_ref() {
                media.set_audio_enabled(!muted);
            }
            muted
        };
        if muted {
            inner.level.send_replace(0.0);
        }
        debug!(muted, "mute toggled");
        inner.events.emit(CallEvent::MuteChanged { muted });
        muted
    }

    /// Hangs up. Only the first call does anything.
    pub async fn end_call(&self) {
        let inner = &self.inner;
        if inner.ended.swap(true, Ordering::SeqCst) {
            debug!("end_call ignored, call already ended");
            return;
        }
        info!(target_id = %inner.target.id, duration = inner.duration_secs(), "ending call");
        inner.teardown(Some(ConnectionState::Closed)).await;

        let signaling = Arc::clone(&inner.deps.signaling);
        let target = inner.target.clone();
        tokio::spawn(async move {
            if let Err(e) = signaling.complete_question(&target).await {
                warn!(error = %e, target_id = %target.id, "could not mark question complete");
            }
        });

        inner.events.emit(CallEvent::Navigate {
            to: Destination::Dashboard,
        });
    }

    /// Releases the call without notifying the backend or navigating.
    pub async fn unmount(&self) {
        self.inner.ended.store(true, Ordering::SeqCst);
        self.inner.teardown(Some(ConnectionState::Closed)).await;
    }

    /// Consumes a pending autoplay unlock. Returns whether playback started.
    pub fn user_gesture(&self) -> bool {
        let inner = &self.inner;
        let Some(stream) = inner.resources.lock().pending_unlock.take() else {
            return false;
        };
        match inner.deps.output.play(&stream) {
            Ok(()) => {
                info!(stream_id = %stream.id(), "audio unlocked by user gesture");
                inner.events.emit(CallEvent::PlaybackStarted {
                    stream_id: stream.id(),
                });
                true
            }
            Err(e) => {
                warn!(error = %e, stream_id = %stream.id(), "playback still failing after user gesture");
                inner.rearm_unlock(&stream);
                false
            }
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn duration_secs(&self) -> u64 {
        self.inner.duration_secs()
    }

    pub fn watch_duration(&self) -> watch::Receiver<u64> {
        self.inner.duration.subscribe()
    }

    /// Microphone level in `0.0..=1.0`, refreshed every visualizer frame.
    pub fn watch_audio_level(&self) -> watch::Receiver<f32> {
        self.inner.level.subscribe()
    }

    pub fn is_muted(&self) -> bool {
        self.inner.muted.load(Ordering::SeqCst)
    }

    pub fn is_call_active(&self) -> bool {
        self.inner.call_active.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.inner.events.subscribe()
    }

    pub fn target(&self) -> &CallTarget {
        &self.inner.target
    }

    pub fn access(&self) -> Access {
        self.inner.access
    }

    pub fn snapshot(&self) -> CallSnapshot {
        let inner = &self.inner;
        CallSnapshot {
            target_id: inner.target.id.clone(),
            question_number: inner.target.question_number,
            started_at: inner.started_at.get().copied(),
            duration_seconds: inner.duration_secs(),
            connection_state: inner.state(),
            muted: self.is_muted(),
            call_active: self.is_call_active(),
        }
    }
}

impl Drop for CallController {
    fn drop(&mut self) {
        self.inner.ended.store(true, Ordering::SeqCst);
        self.inner
            .begin_teardown(Some(ConnectionState::Closed))
            .release_detached("controller dropped");
    }
}

impl Inner {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn duration_secs(&self) -> u64 {
        *self.duration.borrow()
    }

    /// Applies `next` if the state machine allows it. Returns whether the state changed.
    fn transition(&self, next: ConnectionState) -> bool {
        let mut from = next;
        let changed = self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                from = *current;
                *current = next;
                true
            } else {
                false
            }
        });
        if changed {
            info!(%from, to = %next, "connection state");
            self.events.emit(CallEvent::StateChanged { from, to: next });
        } else {
            debug!(current = %self.state(), requested = %next, "transition ignored");
        }
        changed
    }

    fn ensure_mounted(&self) -> CallResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(CallError::Cancelled);
        }
        Ok(())
    }

    fn notify(&self, notification: Notification) {
        self.events.emit(CallEvent::Notify(notification));
    }

    async fn run_connect(self: &Arc<Self>) -> CallResult<()> {
        let media = Arc::new(self.deps.devices.acquire(&MediaConstraints::default()).await?);
        {
            let mut res = self.resources.lock();
            media.set_audio_enabled(!self.muted.load(Ordering::SeqCst));
            res.media = Some(Arc::clone(&media));
        }
        self.ensure_mounted()?;

        self.transition(ConnectionState::Connecting);

        let fetched = self.deps.signaling.turn_credentials().await?;
        self.ensure_mounted()?;
        debug!(servers = fetched.len(), "TURN credentials fetched");

        let token = self
            .deps
            .signaling
            .session_token(&self.target, self.config.token_ttl())
            .await?;
        self.ensure_mounted()?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let setup = PeerSetup {
            ice_servers: combined_ice_servers(fetched, &self.config.stun_servers),
            events: events_tx,
            heartbeat_interval: self.config.heartbeat_interval(),
            shutdown: self.shutdown.child_token(),
        };
        let peer = self.deps.connector.connect(setup).await?;
        self.resources.lock().peer = Some(Arc::clone(&peer));
        self.ensure_mounted()?;
        self.spawn_event_pump(events_rx);

        for track in media.tracks() {
            peer.add_local_track(Arc::clone(track)).await?;
        }
        peer.create_offer().await?;
        let gathering =
            wait_for_gathering(peer.gathering_complete(), self.config.ice_gather_timeout()).await;
        self.ensure_mounted()?;

        let offer = peer.local_sdp().await?;
        let candidates = analyze_candidates(&offer);
        if gathering == GatheringOutcome::TimedOut && candidates.total() == 0 {
            warn!("gathering timed out before any candidate; the answer side must find us");
        }
        debug!(?gathering, candidates = candidates.total(), "sending offer");

        let answer = self.deps.signaling.exchange_sdp(&token, &offer).await?;
        self.ensure_mounted()?;
        peer.apply_answer(answer).await?;
        info!("answer applied, waiting for connectivity");
        Ok(())
    }

    async fn fail_connect(&self, err: &CallError) {
        if matches!(err, CallError::Cancelled) {
            debug!("connect abandoned by teardown");
            self.teardown(None).await;
            return;
        }

        warn!(error = %err, kind = ?err.kind(), "connect failed");
        self.notify(Notification::error(err.user_message(), self.config.notification_ttl()));
        if self.state() == ConnectionState::New {
            // Nothing was negotiated yet; the same controller may retry.
            self.teardown(None).await;
        } else {
            self.teardown(Some(ConnectionState::Failed)).await;
        }
    }

    /// Takes every resource and stops local capture. With a final state the session ends:
    /// background loops are cancelled and the state moves to it.
    fn begin_teardown(&self, final_state: Option<ConnectionState>) -> Released {
        let mut released = self.resources.lock().take_all();
        released.stop_local();
        if let Some(state) = final_state {
            self.shutdown.cancel();
            self.transition(state);
        }
        self.call_active.store(false, Ordering::SeqCst);
        self.level.send_replace(0.0);
        released
    }

    async fn teardown(&self, final_state: Option<ConnectionState>) {
        self.begin_teardown(final_state).release().await;
    }

    fn spawn_event_pump(self: &Arc<Self>, mut events: mpsc::UnboundedReceiver<PeerEvent>) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                match event {
                    PeerEvent::State(next) => inner.on_peer_state(next).await,
                    PeerEvent::RemoteAudioTrack { track_id, frames } => {
                        inner.on_remote_audio(RemoteAudioStream::new(track_id, frames))
                    }
                }
            }
            debug!("peer event pump stopped");
        });
    }

    async fn on_peer_state(self: &Arc<Self>, next: ConnectionState) {
        if !self.transition(next) {
            return;
        }
        let ttl = self.config.notification_ttl();
        match next {
            ConnectionState::Connected => {
                let grace = self.resources.lock().grace.take();
                if let Some(grace) = grace {
                    grace.cancel();
                    info!("connection restored within grace period");
                    self.notify(Notification::success("Connection restored.", ttl));
                }
                self.start_call();
            }
            ConnectionState::Disconnected => {
                self.notify(Notification::warning(
                    "Connection lost. Trying to reconnect...",
                    ttl,
                ));
                self.start_grace();
            }
            ConnectionState::Failed => {
                self.notify(Notification::error(
                    "The connection failed. Please reconnect to continue.",
                    ttl,
                ));
                self.teardown(Some(ConnectionState::Failed)).await;
            }
            ConnectionState::Closed => self.teardown(Some(ConnectionState::Closed)).await,
            _ => {}
        }
    }

    fn start_call(self: &Arc<Self>) {
        let clock = CallClock::start();
        if self.started_at.set(clock.started_at()).is_err() {
            debug!("call already started");
            return;
        }
        let meter = {
            let mut res = self.resources.lock();
            res.clock = Some(clock);
            res.media.as_ref().map(|m| m.level_meter())
        };
        self.call_active.store(true, Ordering::SeqCst);
        info!(started_at = %clock.started_at(), "call started");
        self.events.emit(CallEvent::CallStarted {
            started_at: clock.started_at(),
        });

        self.spawn_ticker(clock);
        if let Some(meter) = meter {
            self.spawn_visualizer(meter);
        }
    }

    fn spawn_ticker(self: &Arc<Self>, clock: CallClock) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticks = interval_at(clock.started() + TICK, TICK);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    _ = ticks.tick() => {
                        let elapsed = clock.elapsed_secs();
                        inner.duration.send_replace(elapsed);
                        let verdict =
                            trial::evaluate(inner.access, elapsed, inner.config.trial_ceiling());
                        if verdict != TrialVerdict::Continue {
                            inner.expire_trial(verdict).await;
                            break;
                        }
                    }
                }
            }
        });
    }

    fn spawn_visualizer(self: &Arc<Self>, meter: Arc<AudioLevelMeter>) {
        let inner = Arc::clone(self);
        let frame = self.config.visualizer_frame();
        tokio::spawn(async move {
            let mut frames = interval(frame);
            frames.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    _ = frames.tick() => {
                        let level = if inner.muted.load(Ordering::SeqCst) { 0.0 } else { meter.level() };
                        inner.level.send_if_modified(|current| {
                            if *current == level {
                                return false;
                            }
                            *current = level;
                            true
                        });
                    }
                }
            }
            inner.level.send_replace(0.0);
        });
    }

    async fn expire_trial(&self, verdict: TrialVerdict) {
        if self.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(access = ?self.access, ceiling_secs = self.config.trial_ceiling().as_secs(), "trial time is up");
        self.teardown(Some(ConnectionState::Closed)).await;
        let prompt = match verdict {
            TrialVerdict::PromptUpgrade => CallEvent::UpgradePrompt,
            _ => CallEvent::RegistrationPrompt,
        };
        self.events.emit(prompt);
        self.events.emit(CallEvent::Navigate { to: Destination::Home });
    }

    fn start_grace(self: &Arc<Self>) {
        let token = self.shutdown.child_token();
        if let Some(previous) = self.resources.lock().grace.replace(token.clone()) {
            previous.cancel();
        }
        let wait = self.config.disconnect_grace();
        info!(grace_secs = wait.as_secs(), "connection lost, grace period started");

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = sleep(wait) => {}
            }
            if inner.state() == ConnectionState::Connected {
                return;
            }
            warn!("connection not restored within grace period");
            inner.transition(ConnectionState::Failed);
            inner.notify(Notification::error(
                "The connection could not be restored. Please reconnect to continue.",
                inner.config.notification_ttl(),
            ));
            inner.teardown(Some(ConnectionState::Failed)).await;
        });
    }

    /// Whether `stream` is the remote audio of the call and still waits to be played.
    fn awaiting_playback(&self, stream: &RemoteAudioStream) -> bool {
        let res = self.resources.lock();
        let is = |s: &Option<Arc<RemoteAudioStream>>| s.as_ref().is_some_and(|s| s.id() == stream.id());
        is(&res.remote_audio) && is(&res.pending_unlock)
    }

    /// Retires the pending unlock of `stream`. Returns false when a gesture got there first.
    fn mark_playing(&self, stream: &RemoteAudioStream) -> bool {
        let mut res = self.resources.lock();
        if res.pending_unlock.as_ref().is_some_and(|s| s.id() == stream.id()) {
            res.pending_unlock = None;
            return true;
        }
        false
    }

    /// Puts a gesture's failed unlock back so the next gesture or retry can try again.
    fn rearm_unlock(&self, stream: &Arc<RemoteAudioStream>) {
        let mut res = self.resources.lock();
        let current = res.remote_audio.as_ref().is_some_and(|s| s.id() == stream.id());
        if current && res.pending_unlock.is_none() {
            res.pending_unlock = Some(Arc::clone(stream));
        }
    }

    fn on_remote_audio(self: &Arc<Self>, stream: RemoteAudioStream) {
        let stream = Arc::new(stream);
        {
            let mut res = self.resources.lock();
            if res.peer.is_none() {
                debug!(track_id = stream.track_id(), "remote audio after teardown, ignored");
                return;
            }
            // A gesture can unlock the stream from the moment it arrives, retries or not.
            res.remote_audio = Some(Arc::clone(&stream));
            res.pending_unlock = Some(Arc::clone(&stream));
        }
        info!(stream_id = %stream.id(), track_id = stream.track_id(), "remote audio stream");
        self.events.emit(CallEvent::RemoteAudio {
            stream_id: stream.id(),
        });

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let policy = PlaybackPolicy::new(inner.config.playback_retry_delays());
            let outcome = play_with_retries(
                inner.deps.output.as_ref(),
                &stream,
                &policy,
                &inner.shutdown,
                || inner.awaiting_playback(&stream),
            )
            .await;

            match outcome {
                PlaybackOutcome::Playing { attempts } => {
                    if !inner.mark_playing(&stream) {
                        debug!(stream_id = %stream.id(), "playback already started by a gesture");
                        return;
                    }
                    debug!(stream_id = %stream.id(), attempts, "remote audio playing");
                    inner.events.emit(CallEvent::PlaybackStarted {
                        stream_id: stream.id(),
                    });
                }
                PlaybackOutcome::Blocked => {
                    if !inner.awaiting_playback(&stream) {
                        return;
                    }
                    info!(
                        stream_id = %stream.id(),
                        attempts = policy.max_attempts(),
                        "autoplay blocked, waiting for a user gesture"
                    );
                    inner.events.emit(CallEvent::AudioUnlockRequired {
                        stream_id: stream.id(),
                    });
                    inner.notify(Notification::info(
                        "Sound is blocked. Click or press any key to hear the interviewer.",
                    ));
                }
                PlaybackOutcome::Failed(reason) => {
                    inner.notify(Notification::warning(
                        format!("Interviewer audio could not be played: {reason}"),
                        inner.config.notification_ttl(),
                    ));
                }
                PlaybackOutcome::Superseded | PlaybackOutcome::Cancelled => {
                    debug!(stream_id = %stream.id(), "playback attempt dropped");
                }
            }
        });
    }
}

use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Remote audio of the current call. A fresh one is built for every incoming track so
/// nothing keeps a handle on a stale track.
pub struct RemoteAudioStream {
    id: Uuid,
    track_id: String,
    frames: Mutex<Option<mpsc::Receiver<Bytes>>>,
}

impl RemoteAudioStream {
    pub fn new(track_id: impl Into<String>, frames: mpsc::Receiver<Bytes>) -> Self {
        Self {
            id: Uuid::new_v4(),
            track_id: track_id.into(),
            frames: Mutex::new(Some(frames)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn track_id(&self) -> &str {
        &self.track_id
    }

    /// Hands the frame receiver to whoever starts playback; `None` once taken.
    pub fn take_frames(&self) -> Option<mpsc::Receiver<Bytes>> {
        self.frames.lock().take()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlaybackError {
    #[error("playback blocked until a user gesture")]
    Blocked,
    #[error("audio output failed: {0}")]
    Output(String),
}

pub trait AudioOutput: Send + Sync {
    /// Starts playing `stream`, replacing whatever played before.
    fn play(&self, stream: &RemoteAudioStream) -> Result<(), PlaybackError>;
}

/// Consumes remote frames without rendering them, keeping the receive path flowing when
/// no audio device is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct DrainOutput;

impl AudioOutput for DrainOutput {
    fn play(&self, stream: &RemoteAudioStream) -> Result<(), PlaybackError> {
        let Some(mut frames) = stream.take_frames() else {
            return Ok(());
        };
        let stream_id = stream.id();
        tokio::spawn(async move {
            let mut packets = 0u64;
            let mut bytes = 0usize;
            while let Some(frame) = frames.recv().await {
                packets += 1;
                bytes += frame.len();
            }
            debug!(%stream_id, packets, bytes, "remote audio ended");
        });
        Ok(())
    }
}

/// Fixed delays for the autoplay retries that follow the immediate attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackPolicy {
    retry_delays: Vec<Duration>,
}

impl PlaybackPolicy {
    pub fn new(retry_delays: Vec<Duration>) -> Self {
        Self { retry_delays }
    }

    pub fn retry_delays(&self) -> &[Duration] {
        &self.retry_delays
    }

    pub fn max_attempts(&self) -> usize {
        self.retry_delays.len() + 1
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackOutcome {
    Playing { attempts: usize },
    /// Every attempt hit the autoplay block; a user gesture is needed.
    Blocked,
    /// A newer stream replaced this one.
    Superseded,
    Cancelled,
    Failed(String),
}

/// Tries playback now and then after each policy delay, stopping early once it plays,
/// fails hard, is superseded or the call is torn down.
pub async fn play_with_retries<F>(
    output: &dyn AudioOutput,
    stream: &RemoteAudioStream,
    policy: &PlaybackPolicy,
    shutdown: &CancellationToken,
    is_current: F,
) -> PlaybackOutcome
where
    F: Fn() -> bool,
{
    let delays = std::iter::once(Duration::ZERO).chain(policy.retry_delays().iter().copied());
    for (attempt, delay) in delays.enumerate() {
        if !delay.is_zero() {
            tokio::select! {
                _ = shutdown.cancelled() => return PlaybackOutcome::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        if shutdown.is_cancelled() {
            return PlaybackOutcome::Cancelled;
        }
        if !is_current() {
            return PlaybackOutcome::Superseded;
        }
        match output.play(stream) {
            Ok(()) => return PlaybackOutcome::Playing { attempts: attempt + 1 },
            Err(PlaybackError::Blocked) => {
                debug!(stream_id = %stream.id(), attempt = attempt + 1, "autoplay blocked");
            }
            Err(PlaybackError::Output(reason)) => {
                warn!(stream_id = %stream.id(), %reason, "audio output failed");
                return PlaybackOutcome::Failed(reason);
            }
        }
    }
    PlaybackOutcome::Blocked
}

//! Local capture side of a call.
//!
//! Rust has no `getUserMedia`: tracks are sample-fed WebRTC tracks and whoever owns the
//! capture device pushes encoded samples into them through a [`CaptureFeed`]. PCM pushed
//! through it drives the level meter.

#[cfg(feature = "device-cpal")]
pub mod cpal_device;
pub mod level;
pub mod playback;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::error::CallResult;
pub use level::AudioLevelMeter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Processing the capture side must apply to the microphone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: Option<AudioConstraints>,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: Some(AudioConstraints::default()),
            video: true,
        }
    }
}

pub struct LocalTrack {
    kind: TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
    rtc: Arc<TrackLocalStaticSample>,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, stream_id: &str) -> Self {
        let codec = match kind {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48_000,
                channels: 2,
                ..Default::default()
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90_000,
                ..Default::default()
            },
        };
        let label = match kind {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        };
        let rtc = Arc::new(TrackLocalStaticSample::new(
            codec,
            format!("{label}-{}", Uuid::new_v4()),
            stream_id.to_owned(),
        ));
        Self {
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            rtc,
        }
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Releases the track for good; later samples are dropped.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            debug!(kind = ?self.kind, "local track stopped");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn rtc_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.rtc)
    }

    /// Forwards an encoded sample. Returns `false` when the track is disabled or stopped.
    pub async fn write_sample(&self, sample: &Sample) -> CallResult<bool> {
        if self.is_stopped() || !self.is_enabled() {
            return Ok(false);
        }
        self.rtc.write_sample(sample).await?;
        Ok(true)
    }
}

/// Local stream of one call: its tracks, the constraints they were opened with and the
/// level meter fed from the microphone.
pub struct LocalMedia {
    stream_id: String,
    constraints: MediaConstraints,
    tracks: Vec<Arc<LocalTrack>>,
    meter: Arc<AudioLevelMeter>,
    released: CancellationToken,
}

impl LocalMedia {
    pub fn new(constraints: MediaConstraints) -> Self {
        let stream_id = format!("mockcall-{}", Uuid::new_v4());
        let mut tracks = Vec::new();
        if constraints.audio.is_some() {
            tracks.push(Arc::new(LocalTrack::new(TrackKind::Audio, &stream_id)));
        }
        if constraints.video {
            tracks.push(Arc::new(LocalTrack::new(TrackKind::Video, &stream_id)));
        }
        Self {
            stream_id,
            constraints,
            tracks,
            meter: Arc::new(AudioLevelMeter::new()),
            released: CancellationToken::new(),
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn constraints(&self) -> &MediaConstraints {
        &self.constraints
    }

    pub fn tracks(&self) -> &[Arc<LocalTrack>] {
        &self.tracks
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &Arc<LocalTrack>> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Audio)
    }

    pub fn level_meter(&self) -> Arc<AudioLevelMeter> {
        Arc::clone(&self.meter)
    }

    /// Enables or disables the audio tracks in place, no renegotiation.
    pub fn set_audio_enabled(&self, enabled: bool) {
        for track in self.audio_tracks() {
            track.set_enabled(enabled);
        }
        if !enabled {
            self.meter.reset();
        }
    }

    pub fn audio_enabled(&self) -> bool {
        self.audio_tracks().any(|t| t.is_enabled() && !t.is_stopped())
    }

    pub fn feed_capture_pcm(&self, samples: &[i16]) {
        feed_meter(&self.meter, self.audio_enabled(), samples);
    }

    /// Handle for a capture loop running apart from the controller.
    pub fn capture_feed(&self) -> CaptureFeed {
        CaptureFeed {
            audio: self.audio_tracks().cloned().collect(),
            meter: Arc::clone(&self.meter),
            released: self.released.clone(),
        }
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
        self.meter.reset();
        self.released.cancel();
    }
}

impl Drop for LocalMedia {
    fn drop(&mut self) {
        self.released.cancel();
    }
}

fn feed_meter(meter: &AudioLevelMeter, live: bool, samples: &[i16]) {
    if live {
        meter.feed_pcm(samples);
    } else {
        meter.reset();
    }
}

/// Microphone side of a [`LocalMedia`]: the audio tracks and level meter, plus a token
/// cancelled once the media is stopped.
#[derive(Clone)]
pub struct CaptureFeed {
    audio: Vec<Arc<LocalTrack>>,
    meter: Arc<AudioLevelMeter>,
    released: CancellationToken,
}

impl CaptureFeed {
    pub fn is_live(&self) -> bool {
        self.audio.iter().any(|t| t.is_enabled() && !t.is_stopped())
    }

    pub fn feed_pcm(&self, samples: &[i16]) {
        feed_meter(&self.meter, self.is_live(), samples);
    }

    /// Writes one encoded frame to every audio track. Returns whether any track took it.
    pub async fn write_sample(&self, sample: &Sample) -> CallResult<bool> {
        let mut written = false;
        for track in &self.audio {
            written |= track.write_sample(sample).await?;
        }
        Ok(written)
    }

    pub fn released(&self) -> &CancellationToken {
        &self.released
    }
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Opens local capture. Denied access is `CallError::PermissionDenied`.
    async fn acquire(&self, constraints: &MediaConstraints) -> CallResult<LocalMedia>;
}

/// Creates sample-fed tracks without touching hardware.
#[derive(Debug, Default, Clone, Copy)]
pub struct SampleTrackDevices;

#[async_trait]
impl MediaDevices for SampleTrackDevices {
    async fn acquire(&self, constraints: &MediaConstraints) -> CallResult<LocalMedia> {
        let media = LocalMedia::new(*constraints);
        debug!(stream_id = media.stream_id(), tracks = media.tracks().len(), "local media ready");
        Ok(media)
    }
}

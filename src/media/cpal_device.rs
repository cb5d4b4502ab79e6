//! Microphone capture and speaker playback on the host's default audio devices.
//!
//! cpal streams are not `Send`, so each one lives on its own thread and is dropped once its
//! token is cancelled. Audio crosses the peer connection as 48 kHz mono Opus in 20 ms frames.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use audiopus::coder::{Decoder as OpusDecoder, Encoder as OpusEncoder};
use audiopus::{Application, Channels, SampleRate};
use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig, SupportedStreamConfigRange};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use webrtc::media::Sample;

use crate::error::{CallError, CallResult};
use crate::media::playback::{AudioOutput, PlaybackError, RemoteAudioStream};
use crate::media::{CaptureFeed, LocalMedia, MediaConstraints, MediaDevices};

const SAMPLE_RATE: u32 = 48_000;
const FRAME: Duration = Duration::from_millis(20);
/// Mono samples in one 20 ms frame.
const FRAME_SAMPLES: usize = 960;
/// Longest Opus packet (120 ms) decoded to mono samples.
const MAX_DECODED: usize = 5_760;
const MAX_PACKET: usize = 4_000;
const CAPTURE_QUEUE: usize = 256;
/// Seconds of decoded audio queued for the speaker before the oldest is dropped.
const PLAYBACK_BACKLOG_SECS: usize = 1;
const OPEN_TIMEOUT: Duration = Duration::from_secs(3);

/// Opens the default microphone. The camera is not captured: a requested video track is
/// created but carries no frames.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalDevices;

#[async_trait]
impl MediaDevices for CpalDevices {
    async fn acquire(&self, constraints: &MediaConstraints) -> CallResult<LocalMedia> {
        let media = LocalMedia::new(*constraints);
        if let Some(audio) = constraints.audio {
            // cpal hands over raw device audio; processing is left to the host.
            debug!(?audio, "audio processing requested");
            start_capture(media.capture_feed()).await?;
        }
        info!(stream_id = media.stream_id(), tracks = media.tracks().len(), "local media ready");
        Ok(media)
    }
}

async fn start_capture(feed: CaptureFeed) -> CallResult<()> {
    let (chunks_tx, chunks_rx) = mpsc::channel(CAPTURE_QUEUE);
    let (ready_tx, ready_rx) = oneshot::channel();
    let released = feed.released().clone();
    let handle = Handle::current();

    std::thread::Builder::new()
        .name("mockcall-capture".into())
        .spawn(move || {
            let stream = match open_input(chunks_tx) {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));
            handle.block_on(released.cancelled());
            drop(stream);
            debug!("microphone closed");
        })
        .map_err(|e| CallError::MediaUnavailable(format!("capture thread: {e}")))?;

    ready_rx
        .await
        .map_err(|_| CallError::MediaUnavailable("capture thread exited".into()))??;
    tokio::spawn(encode_loop(feed, chunks_rx));
    Ok(())
}

fn open_input(chunks: mpsc::Sender<Vec<i16>>) -> CallResult<cpal::Stream> {
    let device = cpal::default_host()
        .default_input_device()
        .ok_or_else(|| CallError::MediaUnavailable("no default microphone".into()))?;
    let name = device.name().unwrap_or_else(|_| "microphone".into());
    let unavailable = |e: &dyn std::fmt::Display| CallError::MediaUnavailable(format!("{name}: {e}"));

    let ranges = device.supported_input_configs().map_err(|e| unavailable(&e))?;
    let config = pick_config(ranges)
        .ok_or_else(|| unavailable(&format!("cannot capture {SAMPLE_RATE} Hz float audio")))?;
    let channels = usize::from(config.channels);

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                // a full queue drops the chunk
                let _ = chunks.try_send(downmix(data, channels));
            },
            |err| error!(error = %err, "microphone stream error"),
            None,
        )
        .map_err(|e| unavailable(&e))?;
    stream.play().map_err(|e| unavailable(&e))?;
    info!(device = %name, channels, "microphone capture started");
    Ok(stream)
}

async fn encode_loop(feed: CaptureFeed, mut chunks: mpsc::Receiver<Vec<i16>>) {
    let mut framer = match OpusFramer::new() {
        Ok(framer) => framer,
        Err(e) => {
            error!(error = ?e, "could not create the Opus encoder");
            return;
        }
    };
    loop {
        let chunk = tokio::select! {
            _ = feed.released().cancelled() => break,
            chunk = chunks.recv() => match chunk {
                Some(chunk) => chunk,
                None => break,
            },
        };
        feed.feed_pcm(&chunk);
        for packet in framer.push(&chunk) {
            let sample = Sample {
                data: packet,
                duration: FRAME,
                ..Default::default()
            };
            if let Err(e) = feed.write_sample(&sample).await {
                warn!(error = %e, "writing microphone sample");
            }
        }
    }
    debug!("microphone encoder stopped");
}

/// Cuts captured PCM into 20 ms frames and encodes each one.
struct OpusFramer {
    encoder: OpusEncoder,
    pending: Vec<i16>,
    packet: Vec<u8>,
}

impl OpusFramer {
    fn new() -> Result<Self, audiopus::Error> {
        Ok(Self {
            encoder: OpusEncoder::new(SampleRate::Hz48000, Channels::Mono, Application::Voip)?,
            pending: Vec::with_capacity(FRAME_SAMPLES * 2),
            packet: vec![0; MAX_PACKET],
        })
    }

    fn push(&mut self, pcm: &[i16]) -> Vec<Bytes> {
        self.pending.extend_from_slice(pcm);
        let mut packets = Vec::new();
        while self.pending.len() >= FRAME_SAMPLES {
            let frame: Vec<i16> = self.pending.drain(..FRAME_SAMPLES).collect();
            match self.encoder.encode(&frame, &mut self.packet) {
                Ok(len) => packets.push(Bytes::copy_from_slice(&self.packet[..len])),
                Err(e) => warn!(error = ?e, "opus encode failed"),
            }
        }
        packets
    }
}

/// Plays remote audio on the default speaker. Native output has no autoplay policy, so
/// `play` starts or fails outright; it blocks while the device opens.
#[derive(Default)]
pub struct CpalOutput {
    current: Mutex<Option<CancellationToken>>,
}

impl AudioOutput for CpalOutput {
    fn play(&self, stream: &RemoteAudioStream) -> Result<(), PlaybackError> {
        let handle = Handle::try_current().map_err(|e| PlaybackError::Output(e.to_string()))?;
        let stop = CancellationToken::new();
        let queued = Arc::new(Mutex::new(VecDeque::new()));
        let channels = spawn_speaker(handle.clone(), Arc::clone(&queued), stop.clone())?;

        let Some(frames) = stream.take_frames() else {
            stop.cancel();
            debug!(stream_id = %stream.id(), "remote audio already playing");
            return Ok(());
        };
        if let Some(previous) = self.current.lock().replace(stop.clone()) {
            previous.cancel();
        }
        handle.spawn(decode_loop(frames, queued, channels, stop));
        info!(stream_id = %stream.id(), channels, "remote audio playing");
        Ok(())
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        if let Some(current) = self.current.lock().take() {
            current.cancel();
        }
    }
}

fn spawn_speaker(
    handle: Handle,
    queued: Arc<Mutex<VecDeque<f32>>>,
    stop: CancellationToken,
) -> Result<usize, PlaybackError> {
    let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel(1);
    let thread_stop = stop.clone();
    std::thread::Builder::new()
        .name("mockcall-playback".into())
        .spawn(move || {
            let (stream, channels) = match open_output(queued) {
                Ok(opened) => opened,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(channels));
            handle.block_on(thread_stop.cancelled());
            drop(stream);
            debug!("speaker closed");
        })
        .map_err(|e| PlaybackError::Output(format!("playback thread: {e}")))?;

    match ready_rx.recv_timeout(OPEN_TIMEOUT) {
        Ok(opened) => opened,
        Err(_) => {
            stop.cancel();
            Err(PlaybackError::Output("speaker did not open in time".into()))
        }
    }
}

fn open_output(queued: Arc<Mutex<VecDeque<f32>>>) -> Result<(cpal::Stream, usize), PlaybackError> {
    let device = cpal::default_host()
        .default_output_device()
        .ok_or_else(|| PlaybackError::Output("no default speaker".into()))?;
    let name = device.name().unwrap_or_else(|_| "speaker".into());
    let failed = |e: &dyn std::fmt::Display| PlaybackError::Output(format!("{name}: {e}"));

    let ranges = device.supported_output_configs().map_err(|e| failed(&e))?;
    let config = pick_config(ranges)
        .ok_or_else(|| failed(&format!("cannot play {SAMPLE_RATE} Hz float audio")))?;
    let channels = usize::from(config.channels);

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let mut queued = queued.lock();
                for slot in data.iter_mut() {
                    *slot = queued.pop_front().unwrap_or(0.0);
                }
            },
            |err| error!(error = %err, "speaker stream error"),
            None,
        )
        .map_err(|e| failed(&e))?;
    stream.play().map_err(|e| failed(&e))?;
    info!(device = %name, channels, "speaker opened");
    Ok((stream, channels))
}

async fn decode_loop(
    mut frames: mpsc::Receiver<Bytes>,
    queued: Arc<Mutex<VecDeque<f32>>>,
    channels: usize,
    stop: CancellationToken,
) {
    let mut playout = match OpusPlayout::new() {
        Ok(playout) => playout,
        Err(e) => {
            error!(error = ?e, "could not create the Opus decoder");
            stop.cancel();
            return;
        }
    };
    let backlog = SAMPLE_RATE as usize * channels * PLAYBACK_BACKLOG_SECS;
    loop {
        let packet = tokio::select! {
            _ = stop.cancelled() => break,
            packet = frames.recv() => match packet {
                Some(packet) => packet,
                None => break,
            },
        };
        let Some(pcm) = playout.decode(&packet) else {
            continue;
        };
        let mut queued = queued.lock();
        fan_out(pcm, channels, &mut queued);
        let excess = queued.len().saturating_sub(backlog);
        queued.drain(..excess);
    }
    stop.cancel();
    debug!("remote audio decoder stopped");
}

struct OpusPlayout {
    decoder: OpusDecoder,
    pcm: Vec<i16>,
}

impl OpusPlayout {
    fn new() -> Result<Self, audiopus::Error> {
        Ok(Self {
            decoder: OpusDecoder::new(SampleRate::Hz48000, Channels::Mono)?,
            pcm: vec![0; MAX_DECODED],
        })
    }

    fn decode(&mut self, packet: &[u8]) -> Option<&[i16]> {
        if packet.is_empty() {
            return None;
        }
        match self.decoder.decode(Some(packet), &mut self.pcm, false) {
            Ok(samples) => Some(&self.pcm[..samples]),
            Err(e) => {
                debug!(error = ?e, bytes = packet.len(), "dropping undecodable packet");
                None
            }
        }
    }
}

/// First float config that runs at 48 kHz, fewest channels first.
fn pick_config<I>(ranges: I) -> Option<StreamConfig>
where
    I: Iterator<Item = SupportedStreamConfigRange>,
{
    ranges
        .filter(|r| r.sample_format() == SampleFormat::F32)
        .filter(|r| r.min_sample_rate().0 <= SAMPLE_RATE && r.max_sample_rate().0 >= SAMPLE_RATE)
        .min_by_key(|r| r.channels())
        .map(|r| r.with_sample_rate(cpal::SampleRate(SAMPLE_RATE)).config())
}

/// Averages interleaved float frames down to mono PCM.
fn downmix(interleaved: &[f32], channels: usize) -> Vec<i16> {
    let channels = channels.max(1);
    interleaved
        .chunks(channels)
        .map(|frame| {
            let mean = frame.iter().sum::<f32>() / frame.len() as f32;
            (mean.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
        })
        .collect()
}

/// Copies mono PCM into every output channel.
fn fan_out(mono: &[i16], channels: usize, out: &mut VecDeque<f32>) {
    for &sample in mono {
        let value = sample as f32 / i16::MAX as f32;
        for _ in 0..channels.max(1) {
            out.push_back(value);
        }
    }
}

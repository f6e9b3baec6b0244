//! Local media: the one audio stream every peer connection shares.

use async_trait::async_trait;
use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use webrtc::api::media_engine::MIME_TYPE_OPUS;
use webrtc::media::Sample as MediaSample;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::audio::{FrameEncoder, FRAME_DURATION, OPUS_SAMPLE_RATE};
use crate::error::{Error, Result};

pub const LOCAL_STREAM_ID: &str = "mesh-call";

#[derive(Clone)]
pub struct LocalTrack {
    id: String,
    kind: RTPCodecType,
    enabled: Arc<AtomicBool>,
    sample_track: Arc<TrackLocalStaticSample>,
}

impl LocalTrack {
    pub fn audio(id: &str, stream_id: &str) -> Self {
        let sample_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: OPUS_SAMPLE_RATE,
                channels: 2,
                ..Default::default()
            },
            id.to_owned(),
            stream_id.to_owned(),
        ));
        Self {
            id: id.to_owned(),
            kind: RTPCodecType::Audio,
            enabled: Arc::new(AtomicBool::new(true)),
            sample_track,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> RTPCodecType {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Returns the previous value. Purely local: nothing is renegotiated.
    pub fn set_enabled(&self, enabled: bool) -> bool {
        self.enabled.swap(enabled, Ordering::SeqCst)
    }

    pub fn sample_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.sample_track)
    }
}

/// Keeps the capture thread alive; dropping the last clone stops it.
struct CaptureGuard {
    _stop: Mutex<std_mpsc::Sender<()>>,
}

#[derive(Clone)]
pub struct LocalStream {
    id: String,
    tracks: Vec<LocalTrack>,
    _capture: Option<Arc<CaptureGuard>>,
}

impl LocalStream {
    pub fn audio_only(stream_id: &str) -> Self {
        Self {
            id: stream_id.to_owned(),
            tracks: vec![LocalTrack::audio("audio", stream_id)],
            _capture: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn audio_track(&self) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.kind() == RTPCodecType::Audio)
    }

    pub fn is_audio_enabled(&self) -> bool {
        self.audio_track().map(LocalTrack::is_enabled).unwrap_or(false)
    }

    /// Returns the previous enabled state, or `None` without an audio track.
    pub fn set_audio_enabled(&self, enabled: bool) -> Option<bool> {
        self.audio_track().map(|t| t.set_enabled(enabled))
    }
}

#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self) -> Result<LocalStream>;
}

/// Track with no capture behind it, for headless clients.
pub struct SilentSource;

#[async_trait]
impl MediaSource for SilentSource {
    async fn acquire(&self) -> Result<LocalStream> {
        Ok(LocalStream::audio_only(LOCAL_STREAM_ID))
    }
}

/// Default input device via cpal, encoded to Opus on the capture thread.
pub struct Microphone;

#[async_trait]
impl MediaSource for Microphone {
    async fn acquire(&self) -> Result<LocalStream> {
        let mut stream = LocalStream::audio_only(LOCAL_STREAM_ID);
        let track = stream
            .audio_track()
            .cloned()
            .ok_or_else(|| Error::MediaAcquisition("no audio track".to_string()))?;

        let (packet_tx, packet_rx) = mpsc::channel::<Bytes>(64);
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let enabled = track.clone();

        // cpal streams are not Send, so the stream lives on its own thread.
        std::thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || {
                let (frame_tx, frame_rx) = std_mpsc::sync_channel::<Vec<f32>>(64);
                let opened = open_input(frame_tx).and_then(|(input, config)| {
                    let encoder = FrameEncoder::new(config.sample_rate.0, config.channels)?;
                    Ok((input, config, encoder))
                });
                match opened {
                    Ok((input, config, encoder)) => {
                        let _ = ready_tx.send(Ok(config));
                        encode_loop(frame_rx, stop_rx, encoder, &enabled, &packet_tx);
                        drop(input);
                        debug!("audio capture stopped");
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })
            .map_err(|e| Error::MediaAcquisition(e.to_string()))?;

        let config = ready_rx
            .await
            .map_err(|_| Error::MediaAcquisition("capture thread exited".to_string()))?
            .map_err(|e| Error::MediaAcquisition(e.to_string()))?;
        info!(
            "Audio capture started: {} Hz, {} channel(s)",
            config.sample_rate.0, config.channels
        );

        tokio::spawn(pump_packets(packet_rx, track));
        stream._capture = Some(Arc::new(CaptureGuard {
            _stop: Mutex::new(stop_tx),
        }));
        Ok(stream)
    }
}

fn open_input(
    frames: std_mpsc::SyncSender<Vec<f32>>,
) -> Result<(cpal::Stream, cpal::StreamConfig)> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| Error::Audio("No input device available".to_string()))?;

    let supported = device
        .default_input_config()
        .map_err(|e| Error::Audio(e.to_string()))?;
    let format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();

    let input = match format {
        SampleFormat::F32 => build_input_stream::<f32>(&device, &config, frames)?,
        SampleFormat::I16 => build_input_stream::<i16>(&device, &config, frames)?,
        SampleFormat::U16 => build_input_stream::<u16>(&device, &config, frames)?,
        other => return Err(Error::Audio(format!("Unsupported sample format: {:?}", other))),
    };
    input.play().map_err(|e| Error::Audio(e.to_string()))?;
    Ok((input, config))
}

fn build_input_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    frames: std_mpsc::SyncSender<Vec<f32>>,
) -> Result<cpal::Stream>
where
    T: SizedSample + Send + 'static,
    f32: FromSample<T>,
{
    let err_fn = |err| error!("An error occurred on the input audio stream: {}", err);

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let samples: Vec<f32> = data.iter().map(|s| s.to_sample::<f32>()).collect();
                // Never block the audio callback; blocks are dropped if the encoder lags.
                let _ = frames.try_send(samples);
            },
            err_fn,
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))
}

/// Runs on the capture thread until the stream is dropped or the pump goes away.
fn encode_loop(
    frames: std_mpsc::Receiver<Vec<f32>>,
    stop: std_mpsc::Receiver<()>,
    mut encoder: FrameEncoder,
    track: &LocalTrack,
    packets: &mpsc::Sender<Bytes>,
) {
    loop {
        match stop.try_recv() {
            Err(std_mpsc::TryRecvError::Empty) => {}
            _ => return,
        }
        let samples = match frames.recv_timeout(Duration::from_millis(100)) {
            Ok(samples) => samples,
            Err(std_mpsc::RecvTimeoutError::Timeout) => continue,
            Err(std_mpsc::RecvTimeoutError::Disconnected) => return,
        };
        if !track.is_enabled() {
            continue;
        }
        let encoded = match encoder.push(&samples) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!("Dropping captured audio: {}", e);
                continue;
            }
        };
        for packet in encoded {
            if packets.blocking_send(packet).is_err() {
                return;
            }
        }
    }
}

async fn pump_packets(mut packets: mpsc::Receiver<Bytes>, track: LocalTrack) {
    let sample_track = track.sample_track();
    while let Some(data) = packets.recv().await {
        let sample = MediaSample {
            data,
            duration: FRAME_DURATION,
            ..Default::default()
        };
        if let Err(e) = sample_track.write_sample(&sample).await {
            debug!("Failed to write audio sample: {}", e);
        }
    }
}

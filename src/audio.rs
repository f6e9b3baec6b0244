//! Opus framing for the microphone and playback of remote voices.
//!
//! Everything here runs at the Opus clock: mono, 48 kHz, 20 ms frames.
//! Device rates are bridged with rubato.

use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SampleFormat, SizedSample};
use rubato::{FftFixedIn, Resampler as _};
use std::collections::{HashMap, VecDeque};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

pub const OPUS_SAMPLE_RATE: u32 = 48_000;
pub const FRAME_DURATION: Duration = Duration::from_millis(20);
/// Mono samples in one 20 ms frame.
pub const FRAME_SAMPLES: usize = 960;
/// RFC 6716 upper bound for one Opus packet.
pub const MAX_PACKET_BYTES: usize = 1275;

const RESAMPLER_CHUNK: usize = 1024;
/// Per-source backlog kept for playback before old audio is dropped.
const MAX_QUEUED_FRAMES: usize = 10;
const MAX_OUTPUT_SECONDS: usize = 1;

fn audio_err(context: &str, e: impl std::fmt::Display) -> Error {
    Error::Audio(format!("{}: {}", context, e))
}

/// Average interleaved channels down to mono.
pub fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Mono rate converter that accepts arbitrary block sizes.
pub struct Resampler {
    inner: Option<FftFixedIn<f32>>,
    pending: Vec<f32>,
}

impl Resampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Result<Self> {
        let inner = if from_rate == to_rate {
            None
        } else {
            let resampler = FftFixedIn::new(
                from_rate as usize,
                to_rate as usize,
                RESAMPLER_CHUNK,
                2,
                1,
            )
            .map_err(|e| audio_err("failed to create resampler", e))?;
            Some(resampler)
        };
        Ok(Self {
            inner,
            pending: Vec::new(),
        })
    }

    /// Returns whatever output whole input chunks produced; the rest waits.
    pub fn process(&mut self, mono: &[f32]) -> Result<Vec<f32>> {
        let Some(resampler) = self.inner.as_mut() else {
            return Ok(mono.to_vec());
        };
        self.pending.extend_from_slice(mono);

        let mut out = Vec::new();
        loop {
            let needed = resampler.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            let chunk: Vec<f32> = self.pending.drain(..needed).collect();
            let mut converted = resampler
                .process(&[chunk], None)
                .map_err(|e| audio_err("resampling failed", e))?;
            out.append(&mut converted[0]);
        }
        Ok(out)
    }
}

/// Turns device-format capture blocks into 20 ms Opus packets.
pub struct FrameEncoder {
    channels: usize,
    resampler: Resampler,
    pending: Vec<f32>,
    encoder: opus::Encoder,
}

impl FrameEncoder {
    pub fn new(sample_rate: u32, channels: u16) -> Result<Self> {
        if channels == 0 || sample_rate == 0 {
            return Err(Error::Audio(format!(
                "unusable capture format: {} Hz, {} channel(s)",
                sample_rate, channels
            )));
        }
        let encoder = opus::Encoder::new(
            OPUS_SAMPLE_RATE,
            opus::Channels::Mono,
            opus::Application::Voip,
        )
        .map_err(|e| audio_err("failed to create Opus encoder", e))?;

        Ok(Self {
            channels: usize::from(channels),
            resampler: Resampler::new(sample_rate, OPUS_SAMPLE_RATE)?,
            pending: Vec::with_capacity(FRAME_SAMPLES * 2),
            encoder,
        })
    }

    /// Feed interleaved samples; returns one packet per completed frame.
    pub fn push(&mut self, interleaved: &[f32]) -> Result<Vec<Bytes>> {
        let mono = downmix(interleaved, self.channels);
        let resampled = self.resampler.process(&mono)?;
        self.pending.extend_from_slice(&resampled);

        let mut packets = Vec::new();
        while self.pending.len() >= FRAME_SAMPLES {
            let frame: Vec<f32> = self.pending.drain(..FRAME_SAMPLES).collect();
            let mut packet = vec![0u8; MAX_PACKET_BYTES];
            let len = self
                .encoder
                .encode_float(&frame, &mut packet)
                .map_err(|e| audio_err("Opus encoding failed", e))?;
            packet.truncate(len);
            packets.push(Bytes::from(packet));
        }
        Ok(packets)
    }
}

/// Where remote Opus payloads go, keyed by a per-track source name.
pub trait AudioSink: Send + Sync {
    fn play(&self, source: &str, payload: Bytes);
    fn end(&self, source: &str);
}

/// Decodes every remote source and sums them one frame at a time.
pub struct Mixer {
    sources: HashMap<String, (opus::Decoder, VecDeque<f32>)>,
}

impl Mixer {
    pub fn new() -> Self {
        Self {
            sources: HashMap::new(),
        }
    }

    pub fn push(&mut self, source: &str, payload: &[u8]) -> Result<()> {
        if !self.sources.contains_key(source) {
            let decoder = opus::Decoder::new(OPUS_SAMPLE_RATE, opus::Channels::Mono)
                .map_err(|e| audio_err("failed to create Opus decoder", e))?;
            self.sources
                .insert(source.to_string(), (decoder, VecDeque::new()));
            debug!("Playing audio from {}", source);
        }
        let Some((decoder, queue)) = self.sources.get_mut(source) else {
            return Ok(());
        };

        // 120 ms is the longest frame Opus allows.
        let mut decoded = vec![0f32; FRAME_SAMPLES * 6];
        let len = decoder
            .decode_float(payload, &mut decoded, false)
            .map_err(|e| audio_err("Opus decoding failed", e))?;
        queue.extend(&decoded[..len]);

        let limit = FRAME_SAMPLES * MAX_QUEUED_FRAMES;
        if queue.len() > limit {
            let excess = queue.len() - limit;
            queue.drain(..excess);
        }
        Ok(())
    }

    pub fn remove(&mut self, source: &str) {
        if self.sources.remove(source).is_some() {
            debug!("Audio from {} ended", source);
        }
    }

    /// Next 20 ms of the mix, or `None` when nobody has anything queued.
    pub fn mix_frame(&mut self) -> Option<Vec<f32>> {
        if self.sources.values().all(|(_, queue)| queue.is_empty()) {
            return None;
        }
        let mut frame = vec![0f32; FRAME_SAMPLES];
        for (_, queue) in self.sources.values_mut() {
            let take = queue.len().min(FRAME_SAMPLES);
            for (out, sample) in frame.iter_mut().zip(queue.drain(..take)) {
                *out += sample;
            }
        }
        for sample in frame.iter_mut() {
            *sample = sample.clamp(-1.0, 1.0);
        }
        Some(frame)
    }
}

impl Default for Mixer {
    fn default() -> Self {
        Self::new()
    }
}

enum Playback {
    Packet { source: String, payload: Bytes },
    Ended { source: String },
}

/// Default output device via cpal; remote voices are mixed and played.
pub struct Speaker {
    tx: Mutex<std_mpsc::SyncSender<Playback>>,
}

impl Speaker {
    pub fn open() -> Result<Self> {
        let (tx, rx) = std_mpsc::sync_channel::<Playback>(256);
        let (ready_tx, ready_rx) = std_mpsc::channel();

        // The output stream is not Send; it lives and dies on this thread.
        std::thread::Builder::new()
            .name("audio-playback".to_string())
            .spawn(move || {
                let ring = Arc::new(Mutex::new(VecDeque::new()));
                match open_output(Arc::clone(&ring)) {
                    Ok((output, config)) => {
                        let _ = ready_tx.send(Ok(()));
                        info!(
                            "Audio playback started: {} Hz, {} channel(s)",
                            config.sample_rate.0, config.channels
                        );
                        if let Err(e) = playback_loop(rx, ring, &config) {
                            error!("Audio playback stopped: {}", e);
                        }
                        drop(output);
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })
            .map_err(|e| audio_err("failed to spawn playback thread", e))?;

        ready_rx
            .recv()
            .map_err(|_| Error::Audio("playback thread exited".to_string()))??;
        Ok(Self { tx: Mutex::new(tx) })
    }

    fn send(&self, message: Playback) {
        let Ok(tx) = self.tx.lock() else {
            return;
        };
        if let Err(std_mpsc::TrySendError::Full(_)) = tx.try_send(message) {
            debug!("Playback queue full; dropping audio");
        }
    }
}

impl AudioSink for Speaker {
    fn play(&self, source: &str, payload: Bytes) {
        self.send(Playback::Packet {
            source: source.to_string(),
            payload,
        });
    }

    fn end(&self, source: &str) {
        self.send(Playback::Ended {
            source: source.to_string(),
        });
    }
}

type OutputRing = Arc<Mutex<VecDeque<f32>>>;

fn open_output(ring: OutputRing) -> Result<(cpal::Stream, cpal::StreamConfig)> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| Error::Audio("No output device available".to_string()))?;

    let supported = device
        .default_output_config()
        .map_err(|e| Error::Audio(e.to_string()))?;
    let format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();

    let output = match format {
        SampleFormat::F32 => build_output_stream::<f32>(&device, &config, ring)?,
        SampleFormat::I16 => build_output_stream::<i16>(&device, &config, ring)?,
        SampleFormat::U16 => build_output_stream::<u16>(&device, &config, ring)?,
        other => return Err(Error::Audio(format!("Unsupported sample format: {:?}", other))),
    };
    output.play().map_err(|e| Error::Audio(e.to_string()))?;
    Ok((output, config))
}

fn build_output_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    ring: OutputRing,
) -> Result<cpal::Stream>
where
    T: SizedSample + FromSample<f32> + Send + 'static,
{
    let err_fn = |err| error!("An error occurred on the output audio stream: {}", err);

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let mut ring = match ring.lock() {
                    Ok(ring) => ring,
                    Err(poisoned) => poisoned.into_inner(),
                };
                for out in data.iter_mut() {
                    // Silence on underrun.
                    *out = T::from_sample(ring.pop_front().unwrap_or(0.0));
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))
}

fn playback_loop(
    rx: std_mpsc::Receiver<Playback>,
    ring: OutputRing,
    config: &cpal::StreamConfig,
) -> Result<()> {
    let channels = usize::from(config.channels.max(1));
    let capacity = config.sample_rate.0 as usize * channels * MAX_OUTPUT_SECONDS;
    let mut resampler = Resampler::new(OPUS_SAMPLE_RATE, config.sample_rate.0)?;
    let mut mixer = Mixer::new();
    let mut next_tick = Instant::now() + FRAME_DURATION;

    loop {
        let wait = next_tick.saturating_duration_since(Instant::now());
        match rx.recv_timeout(wait) {
            Ok(Playback::Packet { source, payload }) => {
                if let Err(e) = mixer.push(&source, &payload) {
                    warn!("Dropping audio from {}: {}", source, e);
                }
            }
            Ok(Playback::Ended { source }) => mixer.remove(&source),
            Err(std_mpsc::RecvTimeoutError::Timeout) => {}
            Err(std_mpsc::RecvTimeoutError::Disconnected) => return Ok(()),
        }

        while Instant::now() >= next_tick {
            next_tick += FRAME_DURATION;
            let Some(frame) = mixer.mix_frame() else {
                continue;
            };
            let converted = resampler.process(&frame)?;
            let mut ring = match ring.lock() {
                Ok(ring) => ring,
                Err(poisoned) => poisoned.into_inner(),
            };
            for sample in converted {
                for _ in 0..channels {
                    ring.push_back(sample);
                }
            }
            if ring.len() > capacity {
                let excess = ring.len() - capacity;
                ring.drain(..excess);
            }
        }
    }
}

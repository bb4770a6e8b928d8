//! Audio capture stage for the sender pipeline
//!
//! Reads PCM from the selected input device on a dedicated thread and feeds
//! the transmitter's audio queue directly; audio is never re-encoded.

use anyhow::Result;
use async_trait::async_trait;
use log::{info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::audio::{self, AudioDevice, AudioFormat, AudioHost, InputStream, convert};
use crate::config::AudioConfig;
use crate::error::StreamError;
use crate::pipeline::PipelineStage;
use crate::pipeline::clock::MediaClock;
use crate::pipeline::health::PipelineHealth;
use crate::pipeline::queue::DropOldestQueue;
use crate::pipeline::session::SessionEvent;
use crate::pipeline::types::{AudioChunk, Timestamp};

/// Consecutive quiet chunks before the silence notice
const SILENCE_CHUNKS: u32 = 100;
/// Peak amplitude under which a chunk counts as quiet
const SILENCE_PEAK: u16 = 100;

/// Device-level capture API
pub struct AudioCapturer {
    host: Arc<dyn AudioHost>,
    config: AudioConfig,
}

impl AudioCapturer {
    pub fn new(host: Arc<dyn AudioHost>, config: &AudioConfig) -> Self {
        Self {
            host,
            config: config.clone(),
        }
    }

    /// Input devices in automatic selection order
    pub fn list_devices(&self) -> Result<Vec<AudioDevice>, StreamError> {
        audio::list_input_devices(self.host.as_ref())
    }

    /// Resolve the device to capture from: the explicit choice if given,
    /// otherwise the best ranked one
    pub fn select(&self, wanted: Option<&str>) -> Result<AudioDevice, StreamError> {
        let devices = self.list_devices()?;
        match wanted {
            Some(w) => audio::find_device(&devices, w).cloned().ok_or_else(|| {
                StreamError::DeviceUnavailable {
                    device: w.to_string(),
                    reason: "no such input device".into(),
                }
            }),
            None => devices
                .into_iter()
                .next()
                .ok_or_else(|| StreamError::DeviceUnavailable {
                    device: "any".into(),
                    reason: "no input devices".into(),
                }),
        }
    }

    /// Open a device; fails with `DeviceUnavailable`
    pub fn open(&self, device: &AudioDevice) -> Result<Box<dyn InputStream>, StreamError> {
        let format = AudioFormat::new(self.config.sample_rate, self.config.channels);
        self.host
            .open_input(device, format, self.config.chunk_frames)
    }

    /// Start a chunk sequence on `device`. The sequence is lazy (it reads
    /// only when polled) and restartable by calling `chunks` again.
    pub fn chunks(&self, device: &AudioDevice, clock: MediaClock) -> Result<AudioChunks, StreamError> {
        let stream = self.open(device)?;
        Ok(AudioChunks {
            format: stream.format(),
            stream,
            clock,
            last_timestamp: None,
        })
    }

    pub fn default_device(&self) -> Option<AudioDevice> {
        self.host.default_input()
    }
}

/// Lazy sequence of captured chunks
pub struct AudioChunks {
    stream: Box<dyn InputStream>,
    format: AudioFormat,
    clock: MediaClock,
    last_timestamp: Option<Timestamp>,
}

impl AudioChunks {
    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Next chunk, `Ok(None)` if the device had nothing within `timeout`
    pub fn next_chunk(&mut self, timeout: Duration) -> Result<Option<AudioChunk>, StreamError> {
        let Some(samples) = self.stream.read_chunk(timeout)? else {
            return Ok(None);
        };
        let frames = samples.len() / self.format.channels.max(1) as usize;
        // Stamp with the time of the first sample, strictly increasing
        let mut timestamp = self
            .clock
            .now()
            .sub(self.format.frames_to_duration(frames as u64));
        if let Some(last) = self.last_timestamp {
            if timestamp <= last {
                timestamp = Timestamp::from_micros(last.micros + 1);
            }
        }
        self.last_timestamp = Some(timestamp);

        Ok(Some(AudioChunk::from_samples(
            self.clock.next_audio_sequence(),
            timestamp,
            self.format.sample_rate,
            self.format.channels,
            &samples,
        )))
    }
}

/// Capture stage: device → transmit audio queue
pub struct AudioCaptureStage {
    capturer: Arc<AudioCapturer>,
    device: AudioDevice,
    clock: MediaClock,
    health: Arc<PipelineHealth>,
    output: Arc<DropOldestQueue<AudioChunk>>,
    paused: Arc<AtomicBool>,
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
    cancel: CancellationToken,
}

impl AudioCaptureStage {
    pub fn new(
        capturer: Arc<AudioCapturer>,
        device: AudioDevice,
        clock: MediaClock,
        health: Arc<PipelineHealth>,
        output: Arc<DropOldestQueue<AudioChunk>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            capturer,
            device,
            clock,
            health,
            output,
            paused: Arc::new(AtomicBool::new(false)),
            events: None,
            cancel,
        }
    }

    /// Shared pause flag; while set, chunks are read and discarded
    pub fn pause_flag(&self) -> Arc<AtomicBool> {
        self.paused.clone()
    }

    pub fn set_events(&mut self, events: mpsc::UnboundedSender<SessionEvent>) {
        self.events = Some(events);
    }
}

/// Body of the capture thread
struct CaptureLoop {
    capturer: Arc<AudioCapturer>,
    device: AudioDevice,
    clock: MediaClock,
    health: Arc<PipelineHealth>,
    output: Arc<DropOldestQueue<AudioChunk>>,
    paused: Arc<AtomicBool>,
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
    cancel: CancellationToken,
}

impl CaptureLoop {
    fn report(&self, kind: &'static str, message: String) {
        if let Some(events) = &self.events {
            let _ = events.send(SessionEvent::Fault { kind, message });
        }
    }

    fn run(mut self) -> Result<(u64, u64)> {
        let mut chunks = self.capturer.chunks(&self.device, self.clock.clone())?;
        info!(
            "AudioCaptureStage: capturing from {} ({})",
            self.device.name,
            chunks.format()
        );

        let mut sent = 0u64;
        let mut dropped = 0u64;
        let mut silent_run = 0u32;
        let mut on_default = false;

        while !self.cancel.is_cancelled() {
            let chunk = match chunks.next_chunk(Duration::from_millis(100)) {
                Ok(Some(chunk)) => chunk,
                Ok(None) => continue,
                Err(StreamError::DeviceLost { device }) if !on_default => {
                    let fallback = self.capturer.default_device().ok_or_else(|| {
                        StreamError::DeviceUnavailable {
                            device: "default".into(),
                            reason: format!("{} lost and no default input", device),
                        }
                    })?;
                    warn!(
                        "AudioCaptureStage: {} lost, continuing on default device {}",
                        device, fallback.name
                    );
                    self.report("DeviceLost", device);
                    chunks = self.capturer.chunks(&fallback, self.clock.clone())?;
                    self.device = fallback;
                    on_default = true;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            if self.paused.load(Ordering::Acquire) {
                continue;
            }

            if convert::peak(&chunk.samples()) < SILENCE_PEAK {
                silent_run += 1;
                if silent_run >= SILENCE_CHUNKS {
                    info!(
                        "AudioCaptureStage: {} has been silent for {} chunks",
                        self.device.name, silent_run
                    );
                    silent_run = 0;
                }
            } else {
                silent_run = 0;
            }

            match self.output.push(chunk) {
                Ok(Some(_evicted)) => {
                    dropped += 1;
                    self.health.record_audio_drop();
                    if dropped % 30 == 1 {
                        warn!("AudioCaptureStage: audio queue full, dropped {} chunks", dropped);
                    }
                }
                Ok(None) => {}
                Err(_) => break, // queue closed
            }
            sent += 1;
        }
        Ok((sent, dropped))
    }
}

#[async_trait]
impl PipelineStage for AudioCaptureStage {
    async fn run(&mut self) -> Result<()> {
        info!("AudioCaptureStage: started");
        let body = CaptureLoop {
            capturer: self.capturer.clone(),
            device: self.device.clone(),
            clock: self.clock.clone(),
            health: self.health.clone(),
            output: self.output.clone(),
            paused: self.paused.clone(),
            events: self.events.clone(),
            cancel: self.cancel.clone(),
        };

        // Device reads block, so they get their own thread
        let result = tokio::task::spawn_blocking(move || body.run())
            .await
            .map_err(|e| anyhow::anyhow!("audio capture thread failed: {}", e))?;

        let (sent, dropped) = result?;
        info!(
            "AudioCaptureStage: finished ({} chunks captured, {} dropped)",
            sent, dropped
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "AudioCaptureStage"
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.cancel.cancel();
        Ok(())
    }
}

//! Runtime tunables
//!
//! Every threshold the stages use lives here so it can be changed from a JSON
//! file without touching the pipeline. Durations are stored as milliseconds.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Returns a version as specified in Cargo.toml
pub fn app_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn app_name() -> &'static str {
    env!("CARGO_PKG_NAME")
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub transport: TransportConfig,
    pub reorder: ReorderConfig,
    pub sync: SyncConfig,
    pub session: SessionConfig,
    pub audio: AudioConfig,
    pub encoder: EncoderConfig,
    pub render: RenderConfig,
}

impl Config {
    /// Load from a JSON file; missing keys keep their defaults
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Config = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        fn bad(msg: &str) -> Result<()> {
            Err(crate::error::StreamError::Config(msg.to_string()).into())
        }
        if self.capture.target_fps == 0 {
            return bad("capture.target_fps must be > 0");
        }
        if self.transport.video_queue == 0 || self.transport.audio_queue == 0 {
            return bad("transport queues need room for at least one item");
        }
        if self.reorder.window == 0 {
            return bad("reorder.window must be > 0");
        }
        if self.session.loss_window == 0 {
            return bad("session.loss_window must be > 0");
        }
        if self.session.recover_loss_ratio > self.session.degrade_loss_ratio {
            return bad("session.recover_loss_ratio must not exceed degrade_loss_ratio");
        }
        if self.encoder.min_quality == 0 || self.encoder.max_quality > 100 {
            return bad("encoder quality bounds must be within 1..=100");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub target_fps: u32,
    /// Consecutive faults before capture is declared dead
    pub max_consecutive_faults: u32,
    /// External grabber run by the fallback backend
    pub grabber: String,
    /// Display size assumed when the display geometry cannot be queried
    pub fallback_width: u32,
    pub fallback_height: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            target_fps: 30,
            max_consecutive_faults: 30,
            grabber: "ffmpeg".into(),
            fallback_width: 1920,
            fallback_height: 1080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub port: u16,
    /// Backpressure bound for outgoing video frames
    pub video_queue: usize,
    /// Last-resort bound for outgoing audio chunks
    pub audio_queue: usize,
    pub max_payload: u32,
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub negotiation_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub write_timeout: Duration,
    pub max_consecutive_errors: u32,
    pub max_reconnect_attempts: u32,
    #[serde(with = "duration_ms")]
    pub reconnect_backoff_initial: Duration,
    #[serde(with = "duration_ms")]
    pub reconnect_backoff_max: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port: 9999,
            video_queue: 5,
            audio_queue: 30,
            max_payload: 10 * 1024 * 1024,
            connect_timeout: Duration::from_secs(5),
            negotiation_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(2),
            max_consecutive_errors: 10,
            max_reconnect_attempts: 5,
            reconnect_backoff_initial: Duration::from_millis(500),
            reconnect_backoff_max: Duration::from_secs(8),
        }
    }
}

impl TransportConfig {
    /// Exponential backoff delay before reconnect attempt `attempt` (0-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.reconnect_backoff_initial
            .saturating_mul(factor)
            .min(self.reconnect_backoff_max)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReorderConfig {
    /// Packets further ahead than this are treated as a gap to skip
    pub window: u64,
    /// How long a gap may hold back buffered packets
    #[serde(with = "duration_ms")]
    pub max_hold: Duration,
}

impl Default for ReorderConfig {
    fn default() -> Self {
        Self {
            window: 8,
            max_hold: Duration::from_millis(40),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub min_audio_units: usize,
    pub min_video_units: usize,
    /// Constant lag of video behind the audio clock
    #[serde(with = "duration_ms")]
    pub target_offset: Duration,
    /// Allowed deviation of the measured skew from zero
    #[serde(with = "duration_ms")]
    pub tolerance: Duration,
    /// How long skew may stay out of band before resyncing
    #[serde(with = "duration_ms")]
    pub resync_after: Duration,
    #[serde(with = "duration_ms")]
    pub priming_timeout: Duration,
    pub max_video_queue: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            min_audio_units: 4,
            min_video_units: 2,
            target_offset: Duration::from_millis(80),
            tolerance: Duration::from_millis(60),
            resync_after: Duration::from_millis(500),
            priming_timeout: Duration::from_secs(1),
            max_video_queue: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Number of recent packets in the loss estimate
    pub loss_window: usize,
    pub degrade_loss_ratio: f64,
    pub recover_loss_ratio: f64,
    /// Average queuing delay above the best observed one that counts as degraded
    #[serde(with = "duration_ms")]
    pub degrade_latency: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            loss_window: 100,
            degrade_loss_ratio: 0.05,
            recover_loss_ratio: 0.02,
            degrade_latency: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    /// Frames per captured chunk
    pub chunk_frames: usize,
    pub volume_step: f32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            channels: 2,
            chunk_frames: 4096,
            volume_step: 0.1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub adaptive_quality: bool,
    pub min_quality: u8,
    pub max_quality: u8,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            adaptive_quality: true,
            min_quality: 60,
            max_quality: 95,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub target_fps: u32,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self { target_fps: 60 }
    }
}

//! Core types for the pipeline system

use bytes::Bytes;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Timestamp representation for media units
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp {
    /// Microseconds since the sender's clock base
    pub micros: i64,
}

impl Timestamp {
    /// Create a new timestamp from microseconds
    pub fn from_micros(micros: i64) -> Self {
        Self { micros }
    }

    /// Create a timestamp from a duration since the clock base
    pub fn from_duration(duration: Duration) -> Self {
        Self {
            micros: duration.as_micros() as i64,
        }
    }

    /// Create a timestamp from instant relative to base
    pub fn from_instant(instant: Instant, base: Instant) -> Self {
        let duration = instant.saturating_duration_since(base);
        Self::from_duration(duration)
    }

    /// Wire representation (negative values never leave the process)
    pub fn as_wire(&self) -> u64 {
        self.micros.max(0) as u64
    }

    pub fn from_wire(micros: u64) -> Self {
        Self {
            micros: micros.min(i64::MAX as u64) as i64,
        }
    }

    /// Add a duration to this timestamp
    pub fn add(&self, duration: Duration) -> Self {
        Self {
            micros: self.micros + duration.as_micros() as i64,
        }
    }

    /// Subtract a duration from this timestamp
    pub fn sub(&self, duration: Duration) -> Self {
        Self {
            micros: self.micros - duration.as_micros() as i64,
        }
    }

    /// Calculate the difference between two timestamps
    pub fn diff(&self, other: Timestamp) -> Duration {
        let diff_micros = (self.micros - other.micros).abs();
        Duration::from_micros(diff_micros as u64)
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}µs", self.micros)
    }
}

/// Sub-channel a payload belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Video,
    Audio,
    Control,
}

impl MediaKind {
    pub fn wire_tag(&self) -> u8 {
        match self {
            MediaKind::Video => b'V',
            MediaKind::Audio => b'A',
            MediaKind::Control => b'C',
        }
    }

    pub fn from_wire_tag(tag: u8) -> Option<Self> {
        match tag {
            b'V' => Some(MediaKind::Video),
            b'A' => Some(MediaKind::Audio),
            b'C' => Some(MediaKind::Control),
            _ => None,
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Video => write!(f, "Video"),
            MediaKind::Audio => write!(f, "Audio"),
            MediaKind::Control => write!(f, "Control"),
        }
    }
}

/// Units that carry a per-stream sequence number
pub trait Sequenced {
    fn sequence(&self) -> u64;
}

/// Raw screen image straight from a capture backend
#[derive(Clone)]
pub struct CapturedImage {
    pub sequence: u64,
    pub captured_at: Timestamp,
    pub image: RgbImage,
}

impl Sequenced for CapturedImage {
    fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl std::fmt::Debug for CapturedImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapturedImage")
            .field("sequence", &self.sequence)
            .field("captured_at", &self.captured_at)
            .field("width", &self.image.width())
            .field("height", &self.image.height())
            .finish()
    }
}

/// One compressed still image of the screen
///
/// The timestamp is assigned once at capture and never rewritten.
#[derive(Clone, PartialEq)]
pub struct Frame {
    pub sequence: u64,
    pub timestamp: Timestamp,
    pub width: u32,
    pub height: u32,
    /// Encoder quality (1-100) in effect when the frame was produced
    pub quality: u8,
    pub payload: Bytes,
}

impl Frame {
    /// Get the size of the compressed data in bytes
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

impl Sequenced for Frame {
    fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("sequence", &self.sequence)
            .field("timestamp", &self.timestamp)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("quality", &self.quality)
            .field("size", &self.size())
            .finish()
    }
}

/// One block of interleaved signed 16-bit PCM
#[derive(Clone, PartialEq)]
pub struct AudioChunk {
    pub sequence: u64,
    pub timestamp: Timestamp,
    pub sample_rate: u32,
    pub channels: u16,
    /// Little endian i16 samples, interleaved
    pub pcm: Bytes,
}

impl AudioChunk {
    pub fn from_samples(
        sequence: u64,
        timestamp: Timestamp,
        sample_rate: u32,
        channels: u16,
        samples: &[i16],
    ) -> Self {
        let mut pcm = Vec::with_capacity(samples.len() * 2);
        for s in samples {
            pcm.extend_from_slice(&s.to_le_bytes());
        }
        Self {
            sequence,
            timestamp,
            sample_rate,
            channels,
            pcm: Bytes::from(pcm),
        }
    }

    pub fn samples(&self) -> Vec<i16> {
        self.pcm
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect()
    }

    /// Number of sample frames (one sample per channel)
    pub fn frames(&self) -> usize {
        self.pcm.len() / 2 / self.channels.max(1) as usize
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.frames() as u64 * 1_000_000 / self.sample_rate as u64)
    }

    /// Timestamp just past the last sample
    pub fn end(&self) -> Timestamp {
        self.timestamp.add(self.duration())
    }
}

impl Sequenced for AudioChunk {
    fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl std::fmt::Debug for AudioChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioChunk")
            .field("sequence", &self.sequence)
            .field("timestamp", &self.timestamp)
            .field("sample_rate", &self.sample_rate)
            .field("channels", &self.channels)
            .field("frames", &self.frames())
            .finish()
    }
}

/// A fully decoded frame, ready for presentation
#[derive(Clone)]
pub struct DecodedFrame {
    pub sequence: u64,
    pub timestamp: Timestamp,
    pub image: RgbImage,
}

impl Sequenced for DecodedFrame {
    fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl std::fmt::Debug for DecodedFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodedFrame")
            .field("sequence", &self.sequence)
            .field("timestamp", &self.timestamp)
            .field("width", &self.image.width())
            .field("height", &self.image.height())
            .finish()
    }
}

/// Capture/stream resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resolution {
    /// Keep the display's native size
    Native,
    Fixed { width: u32, height: u32 },
}

impl Resolution {
    /// Parse a preset name (`720`, `1080`, `1440`, `4k`, `auto`) or `WxH`
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim().to_lowercase();
        let fixed = |width, height| Some(Resolution::Fixed { width, height });
        match s.as_str() {
            "720" | "720p" => fixed(1280, 720),
            "1080" | "1080p" => fixed(1920, 1080),
            "1440" | "1440p" | "2k" => fixed(2560, 1440),
            "4k" | "2160" | "2160p" => fixed(3840, 2160),
            "auto" | "native" => Some(Resolution::Native),
            other => {
                let (w, h) = other.split_once('x')?;
                let (width, height) = (w.parse().ok()?, h.parse().ok()?);
                if width == 0 || height == 0 {
                    return None;
                }
                fixed(width, height)
            }
        }
    }

    /// Resolve against the native display size
    pub fn dimensions(&self, native: (u32, u32)) -> (u32, u32) {
        match self {
            Resolution::Native => native,
            Resolution::Fixed { width, height } => (*width, *height),
        }
    }
}

impl Default for Resolution {
    fn default() -> Self {
        Resolution::Fixed {
            width: 1920,
            height: 1080,
        }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resolution::Native => write!(f, "auto"),
            Resolution::Fixed { width, height } => write!(f, "{}x{}", width, height),
        }
    }
}

/// Named quality levels, each a JPEG quality and a frame rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityPreset {
    Low,
    #[default]
    Balanced,
    High,
    Ultra,
}

impl QualityPreset {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "low" => Some(QualityPreset::Low),
            "balanced" => Some(QualityPreset::Balanced),
            "high" => Some(QualityPreset::High),
            "ultra" => Some(QualityPreset::Ultra),
            _ => None,
        }
    }

    pub fn jpeg_quality(&self) -> u8 {
        match self {
            QualityPreset::Low => 60,
            QualityPreset::Balanced => 75,
            QualityPreset::High => 85,
            QualityPreset::Ultra => 95,
        }
    }

    pub fn fps(&self) -> u32 {
        match self {
            QualityPreset::Low => 20,
            QualityPreset::Balanced | QualityPreset::High => 30,
            QualityPreset::Ultra => 60,
        }
    }
}

/// Clamp a requested quality level into the encoder's 1-100 range
pub fn clamp_quality(level: i32) -> u8 {
    level.clamp(1, 100) as u8
}

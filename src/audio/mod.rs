//! Audio device abstraction
//!
//! Capture and playback talk to an [`AudioHost`], never to a platform API
//! directly. Real devices come from the cpal-backed host; tests run against an
//! in-process virtual host.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::error::StreamError;

pub mod convert;
pub mod cpal_host;
pub mod player;
pub mod ring_buffer;
#[cfg(test)]
pub(crate) mod virtual_host;

pub use cpal_host::CpalHost;
pub use player::{AudioPlayer, PlaybackClock, WriteStatus};
pub use ring_buffer::AudioRingBuffer;
#[cfg(test)]
pub(crate) use virtual_host::VirtualHost;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Input,
    Output,
}

/// A named device as the host reports it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioDevice {
    /// Stable identifier, persisted in preferences
    pub id: String,
    pub name: String,
    pub direction: Direction,
    pub is_default: bool,
}

impl std::fmt::Display for AudioDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)?;
        if self.is_default {
            write!(f, " (default)")?;
        }
        Ok(())
    }
}

/// Interleaved signed 16-bit PCM layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFormat {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    pub fn frames_to_duration(&self, frames: u64) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(frames * 1_000_000 / self.sample_rate as u64)
    }
}

impl std::fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} Hz, {} ch", self.sample_rate, self.channels)
    }
}

/// An open capture stream
///
/// `read_chunk` blocks on the device; it is only ever called from a dedicated
/// thread.
pub trait InputStream: Send {
    fn format(&self) -> AudioFormat;

    /// Next block of samples, `Ok(None)` if nothing arrived within `timeout`.
    /// A vanished device yields `DeviceLost`.
    fn read_chunk(&mut self, timeout: Duration) -> Result<Option<Vec<i16>>, StreamError>;
}

/// An open playback stream
pub trait OutputStream: Send {
    fn format(&self) -> AudioFormat;

    /// Queue samples for playback; a vanished device yields `DeviceLost`
    fn write(&mut self, samples: &[i16]) -> Result<(), StreamError>;

    /// Sample frames queued but not yet played
    fn queued_frames(&self) -> usize;

    fn set_paused(&mut self, paused: bool);
}

/// Source of audio devices
pub trait AudioHost: Send + Sync {
    fn name(&self) -> &str;

    fn input_devices(&self) -> Result<Vec<AudioDevice>, StreamError>;

    fn output_devices(&self) -> Result<Vec<AudioDevice>, StreamError>;

    fn default_input(&self) -> Option<AudioDevice>;

    fn default_output(&self) -> Option<AudioDevice>;

    fn open_input(
        &self,
        device: &AudioDevice,
        format: AudioFormat,
        chunk_frames: usize,
    ) -> Result<Box<dyn InputStream>, StreamError>;

    fn open_output(
        &self,
        device: &AudioDevice,
        format: AudioFormat,
    ) -> Result<Box<dyn OutputStream>, StreamError>;
}

/// The platform's audio devices
pub fn default_host() -> Arc<dyn AudioHost> {
    Arc::new(CpalHost::new())
}

/// Name fragments of loopback-capable inputs, best first
const LOOPBACK_KEYWORDS: [&str; 6] = [
    "cable output",
    "stereo mix",
    "what u hear",
    "loopback",
    "vb-audio",
    "voicemeeter",
];

fn loopback_rank(device: &AudioDevice) -> Option<usize> {
    let name = device.name.to_lowercase();
    LOOPBACK_KEYWORDS.iter().position(|k| name.contains(k))
}

/// Order input devices for automatic selection: loopback-capable devices by
/// keyword rank, then the system default, then everything else by name.
pub fn rank_input_devices(mut devices: Vec<AudioDevice>) -> Vec<AudioDevice> {
    devices.sort_by_key(|d| {
        let rank = loopback_rank(d).unwrap_or(if d.is_default {
            LOOPBACK_KEYWORDS.len()
        } else {
            LOOPBACK_KEYWORDS.len() + 1
        });
        (rank, d.name.to_lowercase())
    });
    devices
}

/// listDevices: input devices in selection order
pub fn list_input_devices(host: &dyn AudioHost) -> Result<Vec<AudioDevice>, StreamError> {
    Ok(rank_input_devices(host.input_devices()?))
}

/// Find an explicitly chosen device by id or, failing that, by name
pub fn find_device<'a>(devices: &'a [AudioDevice], wanted: &str) -> Option<&'a AudioDevice> {
    devices
        .iter()
        .find(|d| d.id == wanted)
        .or_else(|| devices.iter().find(|d| d.name.eq_ignore_ascii_case(wanted)))
}

/// Formats to try, in order, when opening an output for `wanted`
pub fn output_format_candidates(wanted: AudioFormat) -> Vec<AudioFormat> {
    let ch = wanted.channels;
    let mut candidates = Vec::with_capacity(6);
    for (rate, channels) in [
        (wanted.sample_rate, ch),
        (44100, ch),
        (48000, ch),
        (wanted.sample_rate, 2),
        (44100, 2),
        (48000, 2),
    ] {
        let f = AudioFormat::new(rate, channels);
        if !candidates.contains(&f) {
            candidates.push(f);
        }
    }
    candidates
}

//! Video frame encoding
//!
//! Frames travel as standalone JPEG stills: every frame is decodable on its
//! own, so a dropped or corrupt frame never poisons the ones after it.

mod jpeg;

pub use jpeg::{encode, max_encode_latency};

use log::warn;
use std::time::{Duration, Instant};

use crate::error::StreamError;
use crate::pipeline::types::{CapturedImage, Frame, clamp_quality};

/// Stateful wrapper that turns captured images into [`Frame`]s
pub struct FrameEncoder {
    quality: u8,
    frames: u64,
    bytes: u64,
    worst: Duration,
    over_budget: u64,
}

impl FrameEncoder {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: clamp_quality(quality as i32),
            frames: 0,
            bytes: 0,
            worst: Duration::ZERO,
            over_budget: 0,
        }
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    pub fn set_quality(&mut self, quality: u8) {
        self.quality = clamp_quality(quality as i32);
    }

    /// Slowest encode seen so far
    pub fn worst_latency(&self) -> Duration {
        self.worst
    }

    pub fn frames_encoded(&self) -> u64 {
        self.frames
    }

    pub fn bytes_encoded(&self) -> u64 {
        self.bytes
    }

    /// Compress one capture; the capture timestamp carries over unchanged
    pub fn encode_frame(&mut self, captured: CapturedImage) -> Result<Frame, StreamError> {
        let (width, height) = captured.image.dimensions();
        let started = Instant::now();
        let payload = encode(&captured.image, self.quality)?;
        let took = started.elapsed();

        self.worst = self.worst.max(took);
        let budget = max_encode_latency(width, height);
        if took > budget {
            self.over_budget += 1;
            if self.over_budget % 30 == 1 {
                warn!(
                    "FrameEncoder: {}x{} took {:?}, budget {:?} ({} times)",
                    width, height, took, budget, self.over_budget
                );
            }
        }

        self.frames += 1;
        self.bytes += payload.len() as u64;
        Ok(Frame {
            sequence: captured.sequence,
            timestamp: captured.captured_at,
            width,
            height,
            quality: self.quality,
            payload,
        })
    }
}

/// Depth of the capture-to-encode queue for a resolution and frame rate:
/// enough frames to cover one worst-case encode, never fewer than one.
pub fn capture_queue_depth(width: u32, height: u32, fps: u32, max: usize) -> usize {
    let interval = Duration::from_secs(1) / fps.max(1);
    let budget = max_encode_latency(width, height);
    let frames = budget.as_micros().div_ceil(interval.as_micros().max(1)) as usize;
    frames.clamp(1, max.max(1))
}

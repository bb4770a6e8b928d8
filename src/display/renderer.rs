//! Local presentation of decoded frames
//!
//! A [`Renderer`] sits in front of a [`RenderSurface`] and enforces the two
//! presentation rules: only whole frames are drawn, and never one older than
//! what is already on screen.

use log::{debug, info};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::encoder;
use crate::error::StreamError;
use crate::pipeline::types::DecodedFrame;

/// Something that can show a frame
pub trait RenderSurface: Send {
    fn name(&self) -> &str;

    fn present(&mut self, frame: &DecodedFrame) -> Result<(), StreamError>;

    fn set_fullscreen(&mut self, _fullscreen: bool) {}
}

/// What a headless surface was asked to show
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresentedFrame {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
}

/// Shared view of the most recent frames a [`HeadlessSurface`] presented
#[derive(Clone, Default)]
pub struct PresentedLog {
    inner: Arc<Mutex<LogInner>>,
}

#[derive(Default)]
struct LogInner {
    frames: VecDeque<PresentedFrame>,
    total: u64,
}

impl PresentedLog {
    /// Frames kept; older records are dropped
    pub const RETAINED: usize = 512;

    fn lock(&self) -> std::sync::MutexGuard<'_, LogInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn push(&self, frame: PresentedFrame) {
        let mut inner = self.lock();
        if inner.frames.len() == Self::RETAINED {
            inner.frames.pop_front();
        }
        inner.frames.push_back(frame);
        inner.total += 1;
    }

    pub fn frames(&self) -> Vec<PresentedFrame> {
        self.lock().frames.iter().copied().collect()
    }

    pub fn sequences(&self) -> Vec<u64> {
        self.lock().frames.iter().map(|f| f.sequence).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Frames presented since creation, retained or not
    pub fn total(&self) -> u64 {
        self.lock().total
    }
}

/// Records presentations without drawing anything
#[derive(Default)]
pub struct HeadlessSurface {
    log: PresentedLog,
    fullscreen: bool,
}

impl HeadlessSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self) -> PresentedLog {
        self.log.clone()
    }

    pub fn is_fullscreen(&self) -> bool {
        self.fullscreen
    }
}

impl RenderSurface for HeadlessSurface {
    fn name(&self) -> &str {
        "headless"
    }

    fn present(&mut self, frame: &DecodedFrame) -> Result<(), StreamError> {
        self.log.push(PresentedFrame {
            sequence: frame.sequence,
            width: frame.image.width(),
            height: frame.image.height(),
        });
        Ok(())
    }

    fn set_fullscreen(&mut self, fullscreen: bool) {
        self.fullscreen = fullscreen;
    }
}

/// Keeps the latest frame as a JPEG file, rewritten at most once per interval
pub struct SnapshotSurface {
    path: PathBuf,
    interval: Duration,
    last_write: Option<Instant>,
    written: u64,
}

impl SnapshotSurface {
    pub fn new(path: impl AsRef<Path>, interval: Duration) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            interval,
            last_write: None,
            written: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn written(&self) -> u64 {
        self.written
    }
}

impl RenderSurface for SnapshotSurface {
    fn name(&self) -> &str {
        "snapshot"
    }

    fn present(&mut self, frame: &DecodedFrame) -> Result<(), StreamError> {
        if self
            .last_write
            .is_some_and(|t| t.elapsed() < self.interval)
        {
            return Ok(());
        }
        let data = encoder::encode(&frame.image, 90)?;
        // Write aside and rename so readers never see half a file
        let tmp = self.path.with_extension("part");
        std::fs::write(&tmp, &data)?;
        std::fs::rename(&tmp, &self.path)?;
        self.last_write = Some(Instant::now());
        self.written += 1;
        debug!("SnapshotSurface: frame {} -> {}", frame.sequence, self.path.display());
        Ok(())
    }
}

/// Keyboard input on the receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyCommand {
    Stop,
    ToggleFullscreen,
    TogglePause,
    VolumeUp,
    VolumeDown,
    AudioStatus,
}

impl KeyCommand {
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "q" | "esc" | "\u{1b}" => Some(KeyCommand::Stop),
            "f" => Some(KeyCommand::ToggleFullscreen),
            "p" | "space" => Some(KeyCommand::TogglePause),
            "+" | "=" => Some(KeyCommand::VolumeUp),
            "-" => Some(KeyCommand::VolumeDown),
            "a" => Some(KeyCommand::AudioStatus),
            _ if input == " " => Some(KeyCommand::TogglePause),
            _ => None,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RenderStats {
    pub presented: u64,
    /// Incomplete or out-of-order frames refused
    pub rejected: u64,
    /// Frames that arrived while paused
    pub held: u64,
}

pub struct Renderer {
    surface: Box<dyn RenderSurface>,
    fullscreen: bool,
    paused: bool,
    last_sequence: Option<u64>,
    stats: RenderStats,
}

impl Renderer {
    pub fn new(surface: Box<dyn RenderSurface>) -> Self {
        Self {
            surface,
            fullscreen: false,
            paused: false,
            last_sequence: None,
            stats: RenderStats::default(),
        }
    }

    pub fn surface_name(&self) -> &str {
        self.surface.name()
    }

    /// Draw `frame` unless paused, incomplete or older than the last one.
    /// Returns whether it reached the surface.
    pub fn present(&mut self, frame: &DecodedFrame) -> Result<bool, StreamError> {
        if self.paused {
            self.stats.held += 1;
            return Ok(false);
        }
        let (w, h) = frame.image.dimensions();
        let complete = w > 0 && h > 0 && frame.image.as_raw().len() == w as usize * h as usize * 3;
        let in_order = self.last_sequence.is_none_or(|last| frame.sequence > last);
        if !complete || !in_order {
            self.stats.rejected += 1;
            return Ok(false);
        }
        self.surface.present(frame)?;
        self.last_sequence = Some(frame.sequence);
        self.stats.presented += 1;
        Ok(true)
    }

    /// A new sender numbers its frames from scratch
    pub fn new_stream(&mut self) {
        self.last_sequence = None;
    }

    pub fn toggle_fullscreen(&mut self) -> bool {
        self.fullscreen = !self.fullscreen;
        self.surface.set_fullscreen(self.fullscreen);
        info!(
            "Renderer: fullscreen {}",
            if self.fullscreen { "on" } else { "off" }
        );
        self.fullscreen
    }

    pub fn is_fullscreen(&self) -> bool {
        self.fullscreen
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.last_sequence
    }

    pub fn stats(&self) -> RenderStats {
        self.stats
    }
}

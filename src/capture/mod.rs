//! Screen capture
//!
//! Backends are tried in a fixed rank order: the fast native path first, the
//! external-grabber fallback second. [`ScreenCapturer`] owns the ranked list and moves
//! down it when a backend reports itself unavailable.

use image::RgbImage;
use image::imageops::{self, FilterType};
use log::{info, warn};

use crate::config::CaptureConfig;
use crate::error::StreamError;
use crate::pipeline::clock::MediaClock;
use crate::pipeline::types::{CapturedImage, Resolution};

pub mod generic;
pub mod native;
#[cfg(test)]
pub(crate) mod test_card;

pub use generic::FallbackCapture;
pub use native::NativeCapture;

/// Capability variants a backend can provide
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// GPU/compositor-backed grab of the real desktop
    FastCapture,
    /// Always-available generic path
    FallbackCapture,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::FastCapture => write!(f, "FastCapture"),
            BackendKind::FallbackCapture => write!(f, "FallbackCapture"),
        }
    }
}

/// Why a single grab failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureFault {
    /// The backend cannot work at all here (driver, permission, build flags)
    Unavailable(String),
    /// This grab failed, the next one may succeed
    Transient(String),
}

/// One way of reading the composited desktop
pub trait CaptureBackend: Send {
    fn kind(&self) -> BackendKind;

    fn name(&self) -> &str;

    /// Native size of the captured surface
    fn native_size(&self) -> (u32, u32);

    fn capture(&mut self) -> Result<RgbImage, CaptureFault>;
}

/// Fast path that could not be opened; reports itself unavailable on first use
struct UnopenedCapture {
    reason: String,
}

impl CaptureBackend for UnopenedCapture {
    fn kind(&self) -> BackendKind {
        BackendKind::FastCapture
    }

    fn name(&self) -> &str {
        "native"
    }

    fn native_size(&self) -> (u32, u32) {
        (0, 0)
    }

    fn capture(&mut self) -> Result<RgbImage, CaptureFault> {
        Err(CaptureFault::Unavailable(self.reason.clone()))
    }
}

/// Backends in fallback order: native monitor grab, then the external grabber
pub fn ranked_backends(config: &CaptureConfig) -> Vec<Box<dyn CaptureBackend>> {
    let mut backends: Vec<Box<dyn CaptureBackend>> = Vec::with_capacity(2);
    match NativeCapture::primary() {
        Ok(native) => backends.push(Box::new(native)),
        Err(reason) => backends.push(Box::new(UnopenedCapture { reason })),
    }
    backends.push(Box::new(FallbackCapture::new(config)));
    backends
}

/// Describe the backends for `lancast devices`
pub fn describe_backends(config: &CaptureConfig) -> Vec<String> {
    ranked_backends(config)
        .iter()
        .map(|b| {
            let (w, h) = b.native_size();
            format!("{} ({}, {}x{})", b.kind(), b.name(), w, h)
        })
        .collect()
}

/// Screen capturer with transparent backend fallback
///
/// `capture` returns `Ok(None)` for a fault that was absorbed (try again next
/// tick) and an error only once capture is considered dead.
pub struct ScreenCapturer {
    backends: Vec<Box<dyn CaptureBackend>>,
    active: usize,
    clock: MediaClock,
    resolution: Resolution,
    max_consecutive_faults: u32,
    consecutive_faults: u32,
    total_faults: u64,
}

impl ScreenCapturer {
    pub fn new(
        backends: Vec<Box<dyn CaptureBackend>>,
        clock: MediaClock,
        resolution: Resolution,
        config: &CaptureConfig,
    ) -> Self {
        Self {
            backends,
            active: 0,
            clock,
            resolution,
            max_consecutive_faults: config.max_consecutive_faults.max(1),
            consecutive_faults: 0,
            total_faults: 0,
        }
    }

    pub fn active_backend(&self) -> Option<BackendKind> {
        self.backends.get(self.active).map(|b| b.kind())
    }

    pub fn set_resolution(&mut self, resolution: Resolution) {
        self.resolution = resolution;
    }

    /// Size frames will have after scaling
    pub fn output_size(&self) -> (u32, u32) {
        let native = self
            .backends
            .get(self.active)
            .map(|b| b.native_size())
            .unwrap_or((0, 0));
        self.resolution.dimensions(native)
    }

    pub fn total_faults(&self) -> u64 {
        self.total_faults
    }

    fn fault(&mut self, backend: String, reason: String) -> Result<Option<CapturedImage>, StreamError> {
        self.consecutive_faults += 1;
        self.total_faults += 1;
        if self.consecutive_faults >= self.max_consecutive_faults {
            return Err(StreamError::CaptureUnavailable {
                backend,
                reason: format!(
                    "{} consecutive faults, last: {}",
                    self.consecutive_faults, reason
                ),
            });
        }
        Ok(None)
    }

    pub fn capture(&mut self) -> Result<Option<CapturedImage>, StreamError> {
        loop {
            let Some(backend) = self.backends.get_mut(self.active) else {
                return Err(StreamError::CaptureUnavailable {
                    backend: "none".into(),
                    reason: "no capture backend left".into(),
                });
            };
            let captured_at = self.clock.now();

            match backend.capture() {
                Ok(image) => {
                    self.consecutive_faults = 0;
                    let (w, h) = self.resolution.dimensions((image.width(), image.height()));
                    let image = if (w, h) != (image.width(), image.height()) {
                        imageops::resize(&image, w, h, FilterType::Triangle)
                    } else {
                        image
                    };
                    return Ok(Some(CapturedImage {
                        sequence: self.clock.next_video_sequence(),
                        captured_at,
                        image,
                    }));
                }
                Err(CaptureFault::Unavailable(reason)) => {
                    let from = backend.kind();
                    if self.active + 1 < self.backends.len() {
                        self.active += 1;
                        let to = &self.backends[self.active];
                        warn!(
                            "ScreenCapturer: {} unavailable ({}), switching to {} ({})",
                            from,
                            reason,
                            to.kind(),
                            to.name()
                        );
                        continue;
                    }
                    return self.fault(from.to_string(), reason);
                }
                Err(CaptureFault::Transient(reason)) => {
                    let from = backend.kind().to_string();
                    if self.consecutive_faults == 0 {
                        info!("ScreenCapturer: capture fault on {}: {}", from, reason);
                    }
                    return self.fault(from, reason);
                }
            }
        }
    }
}

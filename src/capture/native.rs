//! Native monitor capture through xcap

use image::{DynamicImage, RgbImage};
use xcap::Monitor;

use super::{BackendKind, CaptureBackend, CaptureFault};

pub struct NativeCapture {
    monitor: Monitor,
    name: String,
    width: u32,
    height: u32,
}

impl NativeCapture {
    /// Open the primary monitor, or the first one if none is marked primary
    pub fn primary() -> Result<Self, String> {
        let monitors = Monitor::all().map_err(|e| format!("cannot enumerate monitors: {}", e))?;
        let monitor = monitors
            .iter()
            .find(|m| m.is_primary().unwrap_or(false))
            .or_else(|| monitors.first())
            .cloned()
            .ok_or_else(|| "no monitors found".to_string())?;

        let width = monitor.width().map_err(|e| e.to_string())?;
        let height = monitor.height().map_err(|e| e.to_string())?;
        let name = monitor.name().unwrap_or_else(|_| "monitor".into());
        Ok(Self {
            monitor,
            name,
            width,
            height,
        })
    }
}

impl CaptureBackend for NativeCapture {
    fn kind(&self) -> BackendKind {
        BackendKind::FastCapture
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn native_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn capture(&mut self) -> Result<RgbImage, CaptureFault> {
        match self.monitor.capture_image() {
            Ok(rgba) => Ok(DynamicImage::ImageRgba8(rgba).to_rgb8()),
            Err(e) => {
                let reason = e.to_string();
                let lower = reason.to_lowercase();
                if lower.contains("permission") || lower.contains("not supported") {
                    Err(CaptureFault::Unavailable(reason))
                } else {
                    Err(CaptureFault::Transient(reason))
                }
            }
        }
    }
}

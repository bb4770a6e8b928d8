//! Generic fallback backend
//!
//! Queries the display geometry through display-info and grabs one frame per
//! call with an external screen grabber (ffmpeg by default) writing a PPM
//! image to stdout. Slower than the native path but needs no compositor API.

use std::io::ErrorKind;
use std::process::{Command, Stdio};

use display_info::DisplayInfo;
use image::{ImageFormat, RgbImage};
use log::{info, warn};

use super::{BackendKind, CaptureBackend, CaptureFault};
use crate::config::CaptureConfig;

/// Screen input of the grabber on each platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrabInput {
    X11,
    Gdi,
    AvFoundation,
}

impl GrabInput {
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            GrabInput::Gdi
        } else if cfg!(target_os = "macos") {
            GrabInput::AvFoundation
        } else {
            GrabInput::X11
        }
    }
}

/// Display region the grabber reads
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrabTarget {
    pub index: usize,
    pub name: String,
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl GrabTarget {
    /// Primary display, or the first one reported
    pub fn primary() -> Result<Self, String> {
        let displays =
            DisplayInfo::all().map_err(|e| format!("Failed to enumerate displays: {}", e))?;
        let (index, display) = displays
            .iter()
            .enumerate()
            .find(|(_, d)| d.is_primary)
            .or_else(|| displays.iter().enumerate().next())
            .ok_or_else(|| "No displays found".to_string())?;
        Ok(Self {
            index,
            name: display.name.clone(),
            x: display.x,
            y: display.y,
            width: display.width,
            height: display.height,
        })
    }
}

/// Grabber arguments for a single PPM frame on stdout
pub fn grab_args(input: GrabInput, target: &GrabTarget, x11_display: &str) -> Vec<String> {
    let size = format!("{}x{}", target.width, target.height);
    let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "error".into()];
    match input {
        GrabInput::X11 => {
            args.extend([
                "-f".into(),
                "x11grab".into(),
                "-video_size".into(),
                size,
                "-i".into(),
                format!("{}+{},{}", x11_display, target.x, target.y),
            ]);
        }
        GrabInput::Gdi => {
            args.extend([
                "-f".into(),
                "gdigrab".into(),
                "-offset_x".into(),
                target.x.to_string(),
                "-offset_y".into(),
                target.y.to_string(),
                "-video_size".into(),
                size,
                "-i".into(),
                "desktop".into(),
            ]);
        }
        GrabInput::AvFoundation => {
            args.extend([
                "-f".into(),
                "avfoundation".into(),
                "-capture_cursor".into(),
                "1".into(),
                "-i".into(),
                format!("Capture screen {}:none", target.index),
            ]);
        }
    }
    args.extend([
        "-frames:v".into(),
        "1".into(),
        "-f".into(),
        "image2pipe".into(),
        "-vcodec".into(),
        "ppm".into(),
        "-".into(),
    ]);
    args
}

/// Decode what the grabber wrote to stdout
pub fn decode_grab(stdout: &[u8]) -> Result<RgbImage, CaptureFault> {
    if stdout.is_empty() {
        return Err(CaptureFault::Transient("grabber wrote no image".into()));
    }
    image::load_from_memory_with_format(stdout, ImageFormat::Pnm)
        .map(|img| img.to_rgb8())
        .map_err(|e| CaptureFault::Transient(format!("unreadable grab: {}", e)))
}

pub struct FallbackCapture {
    grabber: String,
    target: GrabTarget,
    args: Vec<String>,
    grabs: u64,
}

impl FallbackCapture {
    pub fn new(config: &CaptureConfig) -> Self {
        let target = GrabTarget::primary().unwrap_or_else(|e| {
            warn!(
                "FallbackCapture: {}, assuming {}x{}",
                e, config.fallback_width, config.fallback_height
            );
            GrabTarget {
                index: 0,
                name: "display".into(),
                x: 0,
                y: 0,
                width: config.fallback_width.max(2),
                height: config.fallback_height.max(2),
            }
        });
        Self::with_target(&config.grabber, target)
    }

    pub fn with_target(grabber: &str, target: GrabTarget) -> Self {
        let x11_display = std::env::var("DISPLAY").unwrap_or_else(|_| ":0".into());
        let args = grab_args(GrabInput::current(), &target, &x11_display);
        Self {
            grabber: grabber.to_string(),
            target,
            args,
            grabs: 0,
        }
    }
}

impl CaptureBackend for FallbackCapture {
    fn kind(&self) -> BackendKind {
        BackendKind::FallbackCapture
    }

    fn name(&self) -> &str {
        &self.target.name
    }

    fn native_size(&self) -> (u32, u32) {
        (self.target.width, self.target.height)
    }

    fn capture(&mut self) -> Result<RgbImage, CaptureFault> {
        let output = Command::new(&self.grabber)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output();

        let output = match output {
            Ok(output) => output,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(CaptureFault::Unavailable(format!(
                    "screen grabber '{}' not found",
                    self.grabber
                )));
            }
            Err(e) => return Err(CaptureFault::Transient(e.to_string())),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let reason = stderr
                .lines()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("no diagnostics")
                .to_string();
            return Err(CaptureFault::Transient(format!(
                "{} exited with {}: {}",
                self.grabber, output.status, reason
            )));
        }

        let image = decode_grab(&output.stdout)?;
        if self.grabs == 0 {
            info!(
                "FallbackCapture: grabbing {} through {} ({}x{})",
                self.target.name,
                self.grabber,
                image.width(),
                image.height()
            );
        }
        self.grabs += 1;
        Ok(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn target() -> GrabTarget {
        GrabTarget {
            index: 1,
            name: "HDMI-1".into(),
            x: 1920,
            y: 0,
            width: 1280,
            height: 720,
        }
    }

    #[test]
    fn test_x11_grab_reads_display_region() {
        let args = grab_args(GrabInput::X11, &target(), ":1");
        let joined = args.join(" ");
        assert!(joined.contains("-f x11grab -video_size 1280x720 -i :1+1920,0"));
        assert!(joined.ends_with("-frames:v 1 -f image2pipe -vcodec ppm -"));
    }

    #[test]
    fn test_gdi_and_avfoundation_inputs() {
        let gdi = grab_args(GrabInput::Gdi, &target(), ":0").join(" ");
        assert!(gdi.contains("gdigrab -offset_x 1920 -offset_y 0 -video_size 1280x720 -i desktop"));

        let av = grab_args(GrabInput::AvFoundation, &target(), ":0");
        assert!(av.contains(&"Capture screen 1:none".to_string()));
    }

    #[test]
    fn test_grab_output_decoded_as_ppm() {
        let mut ppm = b"P6\n2 1\n255\n".to_vec();
        ppm.extend_from_slice(&[255, 0, 0, 0, 0, 255]);
        let image = decode_grab(&ppm).unwrap();
        assert_eq!(image.dimensions(), (2, 1));
        assert_eq!(*image.get_pixel(0, 0), Rgb([255, 0, 0]));
        assert_eq!(*image.get_pixel(1, 0), Rgb([0, 0, 255]));

        assert!(matches!(decode_grab(&[]), Err(CaptureFault::Transient(_))));
        assert!(matches!(
            decode_grab(b"not an image"),
            Err(CaptureFault::Transient(_))
        ));
    }

    #[test]
    fn test_missing_grabber_is_unavailable() {
        let mut backend = FallbackCapture::with_target("lancast-no-such-grabber", target());
        assert_eq!(backend.kind(), BackendKind::FallbackCapture);
        assert_eq!(backend.native_size(), (1280, 720));
        match backend.capture() {
            Err(CaptureFault::Unavailable(reason)) => {
                assert!(reason.contains("lancast-no-such-grabber"))
            }
            other => panic!("expected Unavailable, got {:?}", other.map(|i| i.dimensions())),
        }
    }
}

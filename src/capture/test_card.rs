//! Synthetic capture backend for pipeline tests

use image::{Rgb, RgbImage};

use super::{BackendKind, CaptureBackend, CaptureFault};

/// Color bars with a moving marker, deterministic per frame counter
pub struct TestCard {
    width: u32,
    height: u32,
    frame: u64,
}

impl TestCard {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width: width.max(2),
            height: height.max(2),
            frame: 0,
        }
    }

    pub fn render(width: u32, height: u32, frame: u64) -> RgbImage {
        const BARS: [[u8; 3]; 8] = [
            [192, 192, 192],
            [192, 192, 0],
            [0, 192, 192],
            [0, 192, 0],
            [192, 0, 192],
            [192, 0, 0],
            [0, 0, 192],
            [16, 16, 16],
        ];
        let marker_w = (width / 64).max(1);
        let marker_x = ((frame * 8) % width as u64) as u32;

        RgbImage::from_fn(width, height, |x, y| {
            if x >= marker_x && x < marker_x + marker_w {
                return Rgb([255, 255, 255]);
            }
            if y > height * 3 / 4 {
                let v = (x * 255 / width.max(1)) as u8;
                return Rgb([v, v, v]);
            }
            Rgb(BARS[(x * 8 / width) as usize % BARS.len()])
        })
    }
}

impl CaptureBackend for TestCard {
    fn kind(&self) -> BackendKind {
        BackendKind::FallbackCapture
    }

    fn name(&self) -> &str {
        "test-card"
    }

    fn native_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn capture(&mut self) -> Result<RgbImage, CaptureFault> {
        let image = Self::render(self.width, self.height, self.frame);
        self.frame += 1;
        Ok(image)
    }
}

#[test]
fn test_marker_moves_between_frames() {
    let mut backend = TestCard::new(128, 72);
    let a = backend.capture().unwrap();
    let b = backend.capture().unwrap();
    assert_eq!(a.dimensions(), (128, 72));
    assert_ne!(a, b);
    assert_eq!(a, TestCard::render(128, 72, 0));
}

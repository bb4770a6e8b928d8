//! Video frame decoding
//!
//! The inverse of [`crate::encoder`]. Decoding is a pure function of the
//! payload bytes; anything that does not decode into exactly the advertised
//! dimensions is reported as `CorruptPayload` and never retried.

use image::codecs::jpeg::JpegDecoder;
use image::{DynamicImage, ImageDecoder, RgbImage};
use std::io::Cursor;

use crate::error::StreamError;
use crate::pipeline::types::{DecodedFrame, Frame};

/// Decode raw JPEG bytes. `sequence` only labels the error.
pub fn decode(sequence: u64, data: &[u8]) -> Result<RgbImage, StreamError> {
    let decoder = JpegDecoder::new(Cursor::new(data))
        .map_err(|e| StreamError::corrupt(sequence, format!("bad jpeg header: {}", e)))?;
    let image = DynamicImage::from_decoder(decoder)
        .map_err(|e| StreamError::corrupt(sequence, format!("bad jpeg data: {}", e)))?;
    Ok(image.to_rgb8())
}

/// Stateless frame decoder with running counters
#[derive(Debug, Default)]
pub struct FrameDecoder {
    decoded: u64,
    corrupt: u64,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decoded(&self) -> u64 {
        self.decoded
    }

    pub fn corrupt(&self) -> u64 {
        self.corrupt
    }

    pub fn decode_frame(&mut self, frame: &Frame) -> Result<DecodedFrame, StreamError> {
        match self.try_decode(frame) {
            Ok(image) => {
                self.decoded += 1;
                Ok(DecodedFrame {
                    sequence: frame.sequence,
                    timestamp: frame.timestamp,
                    image,
                })
            }
            Err(e) => {
                self.corrupt += 1;
                Err(e)
            }
        }
    }

    fn try_decode(&self, frame: &Frame) -> Result<RgbImage, StreamError> {
        let decoder = JpegDecoder::new(Cursor::new(&frame.payload[..]))
            .map_err(|e| StreamError::corrupt(frame.sequence, format!("bad jpeg header: {}", e)))?;

        // Reject before allocating pixels for a size nobody asked for
        let (w, h) = decoder.dimensions();
        if (w, h) != (frame.width, frame.height) {
            return Err(StreamError::corrupt(
                frame.sequence,
                format!(
                    "jpeg is {}x{}, header says {}x{}",
                    w, h, frame.width, frame.height
                ),
            ));
        }

        let image = DynamicImage::from_decoder(decoder)
            .map_err(|e| StreamError::corrupt(frame.sequence, format!("bad jpeg data: {}", e)))?;
        Ok(image.to_rgb8())
    }
}

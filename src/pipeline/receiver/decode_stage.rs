//! Decode stage for the receiver pipeline
//!
//! Turns ordered JPEG frames into RGB images for the synchronizer. A frame
//! that does not decode is dropped and counted as lost; nothing downstream
//! ever sees a partial image.

use anyhow::Result;
use async_trait::async_trait;
use log::{info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::decoder::FrameDecoder;
use crate::pipeline::PipelineStage;
use crate::pipeline::health::PipelineHealth;
use crate::pipeline::session::SessionEvent;
use crate::pipeline::types::{DecodedFrame, Frame};

/// Decode stage: Frame → DecodedFrame
pub struct DecodeStage {
    health: Arc<PipelineHealth>,
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
    input_rx: Option<mpsc::Receiver<Frame>>,
    output_tx: Option<mpsc::Sender<DecodedFrame>>,
}

impl DecodeStage {
    pub fn new(health: Arc<PipelineHealth>) -> Self {
        Self {
            health,
            events: None,
            input_rx: None,
            output_tx: None,
        }
    }

    /// Set the input channel (frames in sequence order)
    pub fn set_input(&mut self, rx: mpsc::Receiver<Frame>) {
        self.input_rx = Some(rx);
    }

    pub fn take_output(&mut self, capacity: usize) -> mpsc::Receiver<DecodedFrame> {
        let (tx, rx) = mpsc::channel::<DecodedFrame>(capacity.max(1));
        self.output_tx = Some(tx);
        rx
    }

    pub fn set_events(&mut self, events: mpsc::UnboundedSender<SessionEvent>) {
        self.events = Some(events);
    }
}

#[async_trait]
impl PipelineStage for DecodeStage {
    async fn run(&mut self) -> Result<()> {
        let mut input_rx = self
            .input_rx
            .take()
            .ok_or_else(|| anyhow::anyhow!("No input channel"))?;
        let output_tx = self
            .output_tx
            .take()
            .ok_or_else(|| anyhow::anyhow!("No output channel"))?;

        info!("DecodeStage: started");
        let mut decoder = FrameDecoder::new();
        let mut last_stats = Instant::now();

        while let Some(frame) = input_rx.recv().await {
            let size = frame.size();
            let (back, decoded) = tokio::task::spawn_blocking(move || {
                let decoded = decoder.decode_frame(&frame);
                (decoder, decoded)
            })
            .await
            .map_err(|e| anyhow::anyhow!("decode thread failed: {}", e))?;
            decoder = back;

            match decoded {
                Ok(decoded) => {
                    self.health.record_frame(size);
                    if output_tx.send(decoded).await.is_err() {
                        info!("DecodeStage: output channel closed");
                        break;
                    }
                }
                Err(e) => {
                    self.health.record_corrupt_payload();
                    if let Some(events) = &self.events {
                        let _ = events.send(SessionEvent::Lost { count: 1 });
                    }
                    if decoder.corrupt() % 30 == 1 {
                        warn!("DecodeStage: dropping frame: {}", e);
                    }
                }
            }

            if last_stats.elapsed() >= Duration::from_secs(30) {
                info!(
                    "DecodeStage: {} decoded, {} corrupt",
                    decoder.decoded(),
                    decoder.corrupt()
                );
                last_stats = Instant::now();
            }
        }

        info!(
            "DecodeStage: finished ({} decoded, {} corrupt)",
            decoder.decoded(),
            decoder.corrupt()
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "DecodeStage"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder;
    use crate::pipeline::types::Timestamp;
    use bytes::Bytes;
    use image::{Rgb, RgbImage};

    fn frame(seq: u64, payload: Bytes) -> Frame {
        Frame {
            sequence: seq,
            timestamp: Timestamp::from_micros(seq as i64 * 33_000),
            width: 16,
            height: 8,
            quality: 80,
            payload,
        }
    }

    #[tokio::test]
    async fn test_bad_frames_dropped_as_lost() {
        let jpeg = encoder::encode(&RgbImage::from_pixel(16, 8, Rgb([9, 9, 9])), 80).unwrap();
        let health = Arc::new(PipelineHealth::new());
        let mut stage = DecodeStage::new(health.clone());
        let (tx, rx) = mpsc::channel(8);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        stage.set_input(rx);
        stage.set_events(events_tx);
        let mut out = stage.take_output(8);

        tx.send(frame(0, jpeg.clone())).await.unwrap();
        tx.send(frame(1, Bytes::from_static(b"garbage"))).await.unwrap();
        tx.send(frame(2, jpeg)).await.unwrap();
        drop(tx);
        stage.run().await.unwrap();

        let mut seqs = Vec::new();
        while let Some(f) = out.recv().await {
            assert_eq!(f.image.dimensions(), (16, 8));
            seqs.push(f.sequence);
        }
        assert_eq!(seqs, vec![0, 2]);
        assert!(matches!(events_rx.try_recv(), Ok(SessionEvent::Lost { count: 1 })));
        assert_eq!(health.corrupt_payloads(), 1);
        assert_eq!(health.frames_processed(), 2);
    }
}

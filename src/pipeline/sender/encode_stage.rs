//! Encode stage for the sender pipeline
//!
//! Consumes captured images, produces JPEG [`Frame`]s and, when enabled,
//! steers the quality level by how many frames the pipeline is dropping.

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::EncoderConfig;
use crate::encoder::FrameEncoder;
use crate::pipeline::PipelineStage;
use crate::pipeline::health::PipelineHealth;
use crate::pipeline::queue::DropOldestQueue;
use crate::pipeline::types::{CapturedImage, Frame};

/// Drops per second above which quality is lowered
const DROP_THRESHOLD: u64 = 5;
const QUALITY_DOWN: u8 = 5;
const QUALITY_UP: u8 = 2;

/// Once-per-second quality controller
#[derive(Debug, Clone)]
pub struct AdaptiveQuality {
    min: u8,
    max: u8,
    last_drops: u64,
    last_check: Instant,
}

impl AdaptiveQuality {
    pub fn new(config: &EncoderConfig, drops_now: u64) -> Self {
        Self {
            min: config.min_quality.max(1),
            max: config.max_quality.clamp(config.min_quality.max(1), 100),
            last_drops: drops_now,
            last_check: Instant::now(),
        }
    }

    /// Quality for the next second given the drops of the last one
    pub fn next_quality(&self, current: u8, dropped: u64) -> u8 {
        if dropped > DROP_THRESHOLD {
            current.saturating_sub(QUALITY_DOWN).max(self.min)
        } else if dropped == 0 {
            current.saturating_add(QUALITY_UP).min(self.max)
        } else {
            current
        }
    }

    /// Run the controller if a second has passed; returns a changed quality
    pub fn poll(&mut self, current: u8, drops_total: u64) -> Option<u8> {
        if self.last_check.elapsed() < Duration::from_secs(1) {
            return None;
        }
        let dropped = drops_total.saturating_sub(self.last_drops);
        self.last_drops = drops_total;
        self.last_check = Instant::now();
        let next = self.next_quality(current, dropped);
        (next != current).then_some(next)
    }
}

/// Encode stage: capture queue → video transmit queue
pub struct EncodeStage {
    encoder: Mutex<Option<FrameEncoder>>,
    health: Arc<PipelineHealth>,
    input: Arc<DropOldestQueue<CapturedImage>>,
    output: Arc<DropOldestQueue<Frame>>,
    /// Current quality; the transmitter announces every change
    quality: Arc<watch::Sender<u8>>,
    adaptive: Option<AdaptiveQuality>,
    cancel: CancellationToken,
}

impl EncodeStage {
    pub fn new(
        config: &EncoderConfig,
        health: Arc<PipelineHealth>,
        input: Arc<DropOldestQueue<CapturedImage>>,
        output: Arc<DropOldestQueue<Frame>>,
        quality: Arc<watch::Sender<u8>>,
        cancel: CancellationToken,
    ) -> Self {
        let adaptive = config
            .adaptive_quality
            .then(|| AdaptiveQuality::new(config, health.frame_drops()));
        let initial = *quality.borrow();
        Self {
            encoder: Mutex::new(Some(FrameEncoder::new(initial))),
            health,
            input,
            output,
            quality,
            adaptive,
            cancel,
        }
    }
}

#[async_trait]
impl PipelineStage for EncodeStage {
    async fn run(&mut self) -> Result<()> {
        let mut encoder = self
            .encoder
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
            .ok_or_else(|| anyhow::anyhow!("Encode stage already ran"))?;

        info!("EncodeStage: started (quality {})", encoder.quality());
        let mut dropped = 0u64;
        let mut failed = 0u64;
        let mut last_stats = Instant::now();

        loop {
            let captured = tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = self.input.pop() => match next {
                    Some(c) => c,
                    None => break,
                },
            };

            if let Some(adaptive) = self.adaptive.as_mut() {
                let current = *self.quality.borrow();
                if let Some(next) = adaptive.poll(current, self.health.frame_drops()) {
                    debug!("EncodeStage: adaptive quality {} -> {}", current, next);
                    self.quality.send_replace(next);
                }
            }
            encoder.set_quality(*self.quality.borrow());

            let sequence = captured.sequence;
            let (back, encoded) = tokio::task::spawn_blocking(move || {
                let encoded = encoder.encode_frame(captured);
                (encoder, encoded)
            })
            .await
            .map_err(|e| anyhow::anyhow!("encode thread failed: {}", e))?;
            encoder = back;

            let frame = match encoded {
                Ok(frame) => frame,
                Err(e) => {
                    // The sequence number becomes a gap, which reads as loss
                    failed += 1;
                    self.health.record_frame_drop();
                    if failed % 30 == 1 {
                        warn!("EncodeStage: frame {} not encoded: {}", sequence, e);
                    }
                    continue;
                }
            };

            self.health.record_frame(frame.size());
            match self.output.push(frame) {
                Ok(Some(_stale)) => {
                    dropped += 1;
                    self.health.record_frame_drop();
                    if dropped % 30 == 1 {
                        warn!("EncodeStage: network behind, dropped {} frames", dropped);
                    }
                }
                Ok(None) => {}
                Err(_) => break,
            }

            if last_stats.elapsed() >= Duration::from_secs(30) {
                info!(
                    "EncodeStage: {} encoded ({} bytes), {} dropped, worst {:?}",
                    encoder.frames_encoded(),
                    encoder.bytes_encoded(),
                    dropped,
                    encoder.worst_latency()
                );
                last_stats = Instant::now();
            }
        }

        self.output.close();
        info!(
            "EncodeStage: finished ({} frames, {} dropped, {} failed)",
            encoder.frames_encoded(),
            dropped,
            failed
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "EncodeStage"
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.cancel.cancel();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::Timestamp;
    use image::RgbImage;

    #[test]
    fn test_adaptive_steps() {
        let q = AdaptiveQuality::new(&EncoderConfig::default(), 0);
        assert_eq!(q.next_quality(80, 6), 75);
        assert_eq!(q.next_quality(62, 20), 60);
        assert_eq!(q.next_quality(80, 3), 80);
        assert_eq!(q.next_quality(80, 0), 82);
        assert_eq!(q.next_quality(94, 0), 95);
    }

    #[test]
    fn test_poll_waits_a_second() {
        let mut q = AdaptiveQuality::new(&EncoderConfig::default(), 0);
        assert_eq!(q.poll(80, 10), None);
        q.last_check -= Duration::from_secs(1);
        assert_eq!(q.poll(80, 10), Some(75));
        // Drops are measured per window, not in total
        q.last_check -= Duration::from_secs(1);
        assert_eq!(q.poll(75, 10), Some(77));
    }

    #[tokio::test]
    async fn test_encodes_in_order_and_closes() {
        let input = DropOldestQueue::new(8);
        let output = DropOldestQueue::new(8);
        let (quality, _) = watch::channel(70u8);
        let config = EncoderConfig {
            adaptive_quality: false,
            ..EncoderConfig::default()
        };
        let mut stage = EncodeStage::new(
            &config,
            Arc::new(PipelineHealth::new()),
            input.clone(),
            output.clone(),
            Arc::new(quality),
            CancellationToken::new(),
        );

        for seq in [3u64, 4, 9] {
            input
                .push(CapturedImage {
                    sequence: seq,
                    captured_at: Timestamp::from_micros(seq as i64 * 1000),
                    image: RgbImage::new(16, 8),
                })
                .unwrap();
        }
        input.close();
        stage.run().await.unwrap();

        let mut seqs = Vec::new();
        while let Some(f) = output.try_pop() {
            assert_eq!(f.quality, 70);
            assert_eq!(f.timestamp.micros, f.sequence as i64 * 1000);
            seqs.push(f.sequence);
        }
        assert_eq!(seqs, vec![3, 4, 9]);
        assert!(output.is_closed());
    }
}

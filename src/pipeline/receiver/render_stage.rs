//! Render stage for the receiver pipeline
//!
//! Pulls released frames from the synchronizer and hands them to the
//! [`Renderer`], never faster than the display rate.

use anyhow::Result;
use async_trait::async_trait;
use log::{info, warn};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::display::Renderer;
use crate::pipeline::PipelineStage;
use crate::pipeline::health::PipelineHealth;
use crate::pipeline::queue::DropOldestQueue;
use crate::pipeline::types::DecodedFrame;

/// Render stage: Synchronizer → surface
pub struct RenderStage {
    renderer: Arc<Mutex<Renderer>>,
    input: Option<Arc<DropOldestQueue<DecodedFrame>>>,
    min_interval: Duration,
    health: Arc<PipelineHealth>,
    cancel: CancellationToken,
    rendered: u64,
    refused: u64,
    failed: u64,
}

impl RenderStage {
    pub fn new(
        renderer: Arc<Mutex<Renderer>>,
        target_fps: u32,
        health: Arc<PipelineHealth>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            renderer,
            input: None,
            min_interval: Duration::from_secs(1) / target_fps.max(1),
            health,
            cancel,
            rendered: 0,
            refused: 0,
            failed: 0,
        }
    }

    pub fn set_input(&mut self, input: Arc<DropOldestQueue<DecodedFrame>>) {
        self.input = Some(input);
    }

    async fn present(&mut self, frame: DecodedFrame) -> Result<()> {
        let renderer = self.renderer.clone();
        let sequence = frame.sequence;
        let presented = tokio::task::spawn_blocking(move || {
            // A panic mid-present leaves nothing half-updated worth refusing
            let mut renderer = renderer.lock().unwrap_or_else(|p| p.into_inner());
            renderer.present(&frame)
        })
        .await
        .map_err(|e| anyhow::anyhow!("render thread failed: {}", e))?;

        match presented {
            Ok(true) => self.rendered += 1,
            Ok(false) => self.refused += 1,
            Err(e) => {
                self.failed += 1;
                self.health.record_frame_drop();
                if self.failed % 30 == 1 {
                    warn!("RenderStage: frame {} not presented: {}", sequence, e);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PipelineStage for RenderStage {
    async fn run(&mut self) -> Result<()> {
        let input = self
            .input
            .take()
            .ok_or_else(|| anyhow::anyhow!("No input queue"))?;

        info!("RenderStage: started (at most {:?} per frame)", self.min_interval);
        let mut last_present: Option<Instant> = None;
        let mut last_stats = Instant::now();

        loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => break,
                frame = input.pop() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };

            if let Some(last) = last_present {
                let next = last + self.min_interval;
                if next > Instant::now() {
                    tokio::time::sleep_until(next.into()).await;
                }
            }
            self.present(frame).await?;
            last_present = Some(Instant::now());

            if last_stats.elapsed() >= Duration::from_secs(30) {
                info!(
                    "RenderStage: {} rendered, {} refused, {} failed, queue {}/{} ({} evicted)",
                    self.rendered,
                    self.refused,
                    self.failed,
                    input.len(),
                    input.capacity(),
                    input.evicted()
                );
                last_stats = Instant::now();
            }
        }

        info!(
            "RenderStage: finished ({} rendered, {} refused)",
            self.rendered, self.refused
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "RenderStage"
    }
}

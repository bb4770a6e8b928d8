//! Capture stage for the sender pipeline
//!
//! Wraps [`ScreenCapturer`] and feeds raw images to the encoder at the
//! target frame rate.

use anyhow::Result;
use async_trait::async_trait;
use log::{error, info, warn};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::capture::ScreenCapturer;
use crate::pipeline::PipelineStage;
use crate::pipeline::health::PipelineHealth;
use crate::pipeline::queue::DropOldestQueue;
use crate::pipeline::types::{CapturedImage, Resolution};

/// Capture options the coordinator can change while running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureSettings {
    pub paused: bool,
    pub resolution: Resolution,
    pub fps: u32,
}

fn frame_interval(fps: u32) -> Duration {
    Duration::from_secs(1) / fps.max(1)
}

/// Capture stage: screen → capture-to-encode queue
pub struct CaptureStage {
    // Backends are only `Send`; the mutex makes the stage shareable
    capturer: Mutex<Option<ScreenCapturer>>,
    health: Arc<PipelineHealth>,
    settings_rx: watch::Receiver<CaptureSettings>,
    /// Size of the images actually produced
    size_tx: watch::Sender<(u32, u32)>,
    output: Arc<DropOldestQueue<CapturedImage>>,
    cancel: CancellationToken,
}

impl CaptureStage {
    pub fn new(
        mut capturer: ScreenCapturer,
        health: Arc<PipelineHealth>,
        settings_rx: watch::Receiver<CaptureSettings>,
        output: Arc<DropOldestQueue<CapturedImage>>,
        cancel: CancellationToken,
    ) -> Self {
        capturer.set_resolution(settings_rx.borrow().resolution);
        let (size_tx, _) = watch::channel(capturer.output_size());
        Self {
            capturer: Mutex::new(Some(capturer)),
            health,
            settings_rx,
            size_tx,
            output,
            cancel,
        }
    }

    /// Watch the output size; changes when the resolution or backend does
    pub fn subscribe_size(&self) -> watch::Receiver<(u32, u32)> {
        self.size_tx.subscribe()
    }
}

#[async_trait]
impl PipelineStage for CaptureStage {
    async fn run(&mut self) -> Result<()> {
        let mut capturer = self
            .capturer
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
            .ok_or_else(|| anyhow::anyhow!("Capture stage already ran"))?;

        let mut settings = *self.settings_rx.borrow_and_update();
        let mut ticker = tokio::time::interval(frame_interval(settings.fps));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            "CaptureStage: started ({:?} at {} fps, {}x{})",
            capturer.active_backend(),
            settings.fps,
            capturer.output_size().0,
            capturer.output_size().1
        );

        let mut captured = 0u64;
        let mut dropped = 0u64;
        let mut last_stats = Instant::now();
        let mut result = Ok(());

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                changed = self.settings_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let next = *self.settings_rx.borrow_and_update();
                    if next.resolution != settings.resolution {
                        capturer.set_resolution(next.resolution);
                        info!("CaptureStage: resolution set to {}", next.resolution);
                    }
                    if next.fps != settings.fps {
                        ticker = tokio::time::interval(frame_interval(next.fps));
                        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                    }
                    if next.paused != settings.paused {
                        info!("CaptureStage: {}", if next.paused { "paused" } else { "resumed" });
                    }
                    settings = next;
                    continue;
                }
                _ = ticker.tick() => {}
            }

            if settings.paused {
                continue;
            }

            // Grabs block on the display driver
            let (back, grabbed) = tokio::task::spawn_blocking(move || {
                let grabbed = capturer.capture();
                (capturer, grabbed)
            })
            .await
            .map_err(|e| anyhow::anyhow!("capture thread failed: {}", e))?;
            capturer = back;

            let image = match grabbed {
                Ok(Some(image)) => image,
                Ok(None) => continue,
                Err(e) => {
                    error!("CaptureStage: {}", e);
                    result = Err(e.into());
                    break;
                }
            };

            let size = image.image.dimensions();
            self.size_tx.send_if_modified(|current| {
                if *current != size {
                    *current = size;
                    true
                } else {
                    false
                }
            });

            captured += 1;
            match self.output.push(image) {
                Ok(Some(_stale)) => {
                    dropped += 1;
                    self.health.record_frame_drop();
                    if dropped % 30 == 1 {
                        warn!("CaptureStage: encoder behind, dropped {} frames", dropped);
                    }
                }
                Ok(None) => {}
                Err(_) => break,
            }

            if last_stats.elapsed() >= Duration::from_secs(30) {
                info!(
                    "CaptureStage: {} captured, {} dropped, {} faults",
                    captured,
                    dropped,
                    capturer.total_faults()
                );
                last_stats = Instant::now();
            }
        }

        // Downstream drains what is queued, then exits
        self.output.close();
        info!(
            "CaptureStage: finished ({} captured, {} dropped)",
            captured, dropped
        );
        result
    }

    fn name(&self) -> &'static str {
        "CaptureStage"
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.cancel.cancel();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CaptureBackend;
    use crate::capture::test_card::TestCard;
    use crate::config::CaptureConfig;
    use crate::pipeline::clock::MediaClock;

    fn stage(
        paused: bool,
        queue: Arc<DropOldestQueue<CapturedImage>>,
    ) -> (CaptureStage, watch::Sender<CaptureSettings>, CancellationToken) {
        let backends: Vec<Box<dyn CaptureBackend>> = vec![Box::new(TestCard::new(64, 36))];
        let capturer = ScreenCapturer::new(
            backends,
            MediaClock::new(),
            Resolution::Native,
            &CaptureConfig::default(),
        );
        let (tx, rx) = watch::channel(CaptureSettings {
            paused,
            resolution: Resolution::Native,
            fps: 100,
        });
        let cancel = CancellationToken::new();
        (
            CaptureStage::new(capturer, Arc::new(PipelineHealth::new()), rx, queue, cancel.clone()),
            tx,
            cancel,
        )
    }

    #[tokio::test]
    async fn test_produces_increasing_sequences() {
        let queue = DropOldestQueue::new(4);
        let (mut stage, _settings, cancel) = stage(false, queue.clone());
        let handle = tokio::spawn(async move { stage.run().await });

        let a = queue.pop().await.unwrap();
        let b = queue.pop().await.unwrap();
        assert!(b.sequence > a.sequence);
        assert_eq!(a.image.dimensions(), (64, 36));

        cancel.cancel();
        handle.await.unwrap().unwrap();
        assert!(queue.is_closed());
    }

    #[tokio::test]
    async fn test_pause_and_resolution_change() {
        let queue = DropOldestQueue::new(4);
        let (mut stage, settings, cancel) = stage(true, queue.clone());
        let mut size = stage.subscribe_size();
        let handle = tokio::spawn(async move { stage.run().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(queue.is_empty());

        settings.send_modify(|s| {
            s.paused = false;
            s.resolution = Resolution::Fixed {
                width: 32,
                height: 18,
            };
        });
        let img = queue.pop().await.unwrap();
        assert_eq!(img.image.dimensions(), (32, 18));
        size.changed().await.unwrap();
        assert_eq!(*size.borrow(), (32, 18));

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }
}

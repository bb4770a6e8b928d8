//! Playback stage for the receiver pipeline
//!
//! Feeds ordered audio chunks to the [`AudioPlayer`]. The player outlives a
//! connection so the output device stays open across reconnects; the
//! coordinator shares it for volume, pause and status.

use anyhow::Result;
use async_trait::async_trait;
use log::{info, warn};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::audio::player::{AudioPlayer, WriteStatus};
use crate::error::StreamError;
use crate::pipeline::PipelineStage;
use crate::pipeline::health::PipelineHealth;
use crate::pipeline::session::SessionEvent;
use crate::pipeline::types::AudioChunk;

/// Lock the shared player. Its state stays consistent between calls, so a
/// panic elsewhere does not make it unusable.
pub fn lock_player(player: &Mutex<AudioPlayer>) -> std::sync::MutexGuard<'_, AudioPlayer> {
    player.lock().unwrap_or_else(|p| p.into_inner())
}

/// Playback stage: audio reorder → output device
pub struct PlaybackStage {
    player: Arc<Mutex<AudioPlayer>>,
    health: Arc<PipelineHealth>,
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
    input_rx: Option<mpsc::Receiver<AudioChunk>>,
    cancel: CancellationToken,
}

impl PlaybackStage {
    pub fn new(
        player: Arc<Mutex<AudioPlayer>>,
        health: Arc<PipelineHealth>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            player,
            health,
            events: None,
            input_rx: None,
            cancel,
        }
    }

    pub fn set_input(&mut self, rx: mpsc::Receiver<AudioChunk>) {
        self.input_rx = Some(rx);
    }

    pub fn set_events(&mut self, events: mpsc::UnboundedSender<SessionEvent>) {
        self.events = Some(events);
    }

    fn write(&self, chunk: AudioChunk) -> Result<WriteStatus, StreamError> {
        lock_player(&self.player).write(chunk)
    }
}

#[async_trait]
impl PipelineStage for PlaybackStage {
    async fn run(&mut self) -> Result<()> {
        let mut input_rx = self
            .input_rx
            .take()
            .ok_or_else(|| anyhow::anyhow!("No input channel"))?;

        info!("PlaybackStage: started");
        let mut written = 0u64;
        let mut late = 0u64;
        let mut last_stats = Instant::now();

        loop {
            let chunk = tokio::select! {
                _ = self.cancel.cancelled() => break,
                chunk = input_rx.recv() => match chunk {
                    Some(chunk) => chunk,
                    None => break,
                },
            };

            match self.write(chunk) {
                Ok(WriteStatus::Late) => {
                    late += 1;
                    self.health.record_audio_drop();
                    if late % 30 == 1 {
                        warn!("PlaybackStage: dropped late chunk ({} so far)", late);
                    }
                }
                Ok(WriteStatus::Paused) => self.health.record_audio_drop(),
                Ok(WriteStatus::Substituted { lost, device }) => {
                    if let Some(events) = &self.events {
                        let _ = events.send(SessionEvent::Fault {
                            kind: "DeviceLost",
                            message: format!("{} lost, playing on {}", lost, device),
                        });
                    }
                }
                Ok(WriteStatus::Playing | WriteStatus::Priming) => written += 1,
                Err(e) => {
                    // Nothing left to play on; video carries on without audio
                    if let Some(events) = &self.events {
                        let _ = events.send(SessionEvent::Fault {
                            kind: e.kind(),
                            message: e.to_string(),
                        });
                    }
                    return Err(e.into());
                }
            }

            if last_stats.elapsed() >= Duration::from_secs(30) {
                info!(
                    "PlaybackStage: {} written, {} late, {}",
                    written,
                    late,
                    lock_player(&self.player).status()
                );
                last_stats = Instant::now();
            }
        }

        info!("PlaybackStage: finished ({} written, {} late)", written, late);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "PlaybackStage"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{AudioFormat, AudioHost, VirtualHost};
    use crate::config::AudioConfig;
    use crate::pipeline::clock::MediaClock;
    use crate::pipeline::types::Timestamp;

    fn chunk(seq: u64) -> AudioChunk {
        AudioChunk::from_samples(
            seq,
            Timestamp::from_micros(seq as i64 * 10_000),
            8000,
            1,
            &[100; 80],
        )
    }

    fn player(host: &VirtualHost) -> (Arc<Mutex<AudioPlayer>>, String) {
        let mut player = AudioPlayer::new(
            Arc::new(host.clone()),
            &AudioConfig::default(),
            2,
            MediaClock::new(),
        );
        let device = player.select(None).unwrap();
        player.open(&device).unwrap();
        (Arc::new(Mutex::new(player)), device.id)
    }

    #[tokio::test]
    async fn test_plays_and_drops_late_chunks() {
        let host = VirtualHost::with_default_devices();
        let (player, device) = player(&host);
        let health = Arc::new(PipelineHealth::new());
        let mut stage = PlaybackStage::new(player.clone(), health.clone(), CancellationToken::new());
        let (tx, rx) = mpsc::channel(16);
        stage.set_input(rx);

        for seq in [0, 1, 2, 1, 3] {
            tx.send(chunk(seq)).await.unwrap();
        }
        drop(tx);
        stage.run().await.unwrap();

        assert!(lock_player(&player).is_playing());
        assert_eq!(lock_player(&player).stats().late, 1);
        assert_eq!(health.audio_drops(), 1);
        assert_eq!(host.playback_log(&device).writes, 4);
    }

    #[tokio::test]
    async fn test_device_loss_reported_once() {
        let host = VirtualHost::with_default_devices();
        let (player, _) = player(&host);
        let extra = host.add_output("USB Headset", false, vec![AudioFormat::new(44100, 2)]);
        lock_player(&player).open(&extra).unwrap();

        let mut stage = PlaybackStage::new(
            player.clone(),
            Arc::new(PipelineHealth::new()),
            CancellationToken::new(),
        );
        let (tx, rx) = mpsc::channel(16);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        stage.set_input(rx);
        stage.set_events(events_tx);
        let handle = tokio::spawn(async move { stage.run().await });

        for seq in 0..3 {
            tx.send(chunk(seq)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(host.remove_device(&extra.id));
        for seq in 3..8 {
            tx.send(chunk(seq)).await.unwrap();
        }
        drop(tx);
        handle.await.unwrap().unwrap();

        let mut faults = 0;
        while let Ok(event) = events_rx.try_recv() {
            if matches!(event, SessionEvent::Fault { kind: "DeviceLost", .. }) {
                faults += 1;
            }
        }
        assert_eq!(faults, 1);
        let player = lock_player(&player);
        assert!(player.is_playing());
        assert_eq!(player.device().map(|d| d.name.as_str()), Some("Virtual Speakers"));
        assert!(host.default_output().is_some());
    }
}

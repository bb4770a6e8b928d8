//! Transmit stage for the sender pipeline
//!
//! Owns the write half of the connection. Audio is always drained before
//! the next video frame is taken; control messages and quality/size changes
//! go out as soon as they happen.

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::error::StreamError;
use crate::net::PacketWriter;
use crate::net::protocol::{ControlMessage, encode_audio_payload, encode_video_payload};
use crate::pipeline::PipelineStage;
use crate::pipeline::clock::MediaClock;
use crate::pipeline::health::PipelineHealth;
use crate::pipeline::queue::DropOldestQueue;
use crate::pipeline::session::SessionEvent;
use crate::pipeline::types::{AudioChunk, Frame, MediaKind};

/// Delivery stats are reported to the session this often
const REPORT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Default, Clone, Copy)]
struct TransmitStats {
    video_sent: u64,
    audio_sent: u64,
    control_sent: u64,
    /// Units handed to the socket since the last session report
    delivered: u64,
}

/// Transmit stage: queues → socket
pub struct TransmitStage<W> {
    writer: Option<PacketWriter<W>>,
    clock: MediaClock,
    health: Arc<PipelineHealth>,
    video: Arc<DropOldestQueue<Frame>>,
    audio: Arc<DropOldestQueue<AudioChunk>>,
    control_rx: Option<mpsc::Receiver<ControlMessage>>,
    quality_rx: watch::Receiver<u8>,
    size_rx: watch::Receiver<(u32, u32)>,
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
    cancel: CancellationToken,
    /// Format last announced with `AudioFormat` on this connection
    announced: Option<(u32, u16)>,
    stats: TransmitStats,
}

impl<W: AsyncWrite + Unpin + Send + Sync + 'static> TransmitStage<W> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        writer: PacketWriter<W>,
        clock: MediaClock,
        health: Arc<PipelineHealth>,
        video: Arc<DropOldestQueue<Frame>>,
        audio: Arc<DropOldestQueue<AudioChunk>>,
        quality_rx: watch::Receiver<u8>,
        size_rx: watch::Receiver<(u32, u32)>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            writer: Some(writer),
            clock,
            health,
            video,
            audio,
            control_rx: None,
            quality_rx,
            size_rx,
            events: None,
            cancel,
            announced: None,
            stats: TransmitStats::default(),
        }
    }

    /// Get the channel for control messages to the receiver
    pub fn control_sender(&mut self) -> mpsc::Sender<ControlMessage> {
        let (tx, rx) = mpsc::channel::<ControlMessage>(16);
        self.control_rx = Some(rx);
        tx
    }

    pub fn set_events(&mut self, events: mpsc::UnboundedSender<SessionEvent>) {
        self.events = Some(events);
    }

    async fn send_control(
        &mut self,
        writer: &mut PacketWriter<W>,
        msg: &ControlMessage,
    ) -> Result<(), StreamError> {
        debug!("TransmitStage: -> {:?}", msg);
        writer
            .send(
                MediaKind::Control,
                self.clock.next_control_sequence(),
                self.clock.now(),
                &msg.encode(),
            )
            .await?;
        self.stats.control_sent += 1;
        Ok(())
    }

    async fn send_audio(
        &mut self,
        writer: &mut PacketWriter<W>,
        chunk: &AudioChunk,
    ) -> Result<(), StreamError> {
        let format = (chunk.sample_rate, chunk.channels);
        if self.announced != Some(format) {
            let msg = ControlMessage::AudioFormat {
                sample_rate: chunk.sample_rate,
                channels: chunk.channels,
                bits: 16,
            };
            self.send_control(writer, &msg).await?;
            self.announced = Some(format);
        }
        writer
            .send(
                MediaKind::Audio,
                chunk.sequence,
                chunk.timestamp,
                &encode_audio_payload(chunk),
            )
            .await?;
        self.stats.audio_sent += 1;
        self.stats.delivered += 1;
        Ok(())
    }

    async fn send_video(
        &mut self,
        writer: &mut PacketWriter<W>,
        frame: &Frame,
    ) -> Result<(), StreamError> {
        writer
            .send(
                MediaKind::Video,
                frame.sequence,
                frame.timestamp,
                &encode_video_payload(frame),
            )
            .await?;
        self.stats.video_sent += 1;
        self.stats.delivered += 1;
        Ok(())
    }

    /// Drain every queued audio chunk
    async fn flush_audio(&mut self, writer: &mut PacketWriter<W>) -> Result<(), StreamError> {
        while let Some(chunk) = self.audio.try_pop() {
            self.send_audio(writer, &chunk).await?;
        }
        Ok(())
    }

    /// Units the wire queues pushed out before this stage could send them.
    /// Drops upstream of the wire (capture, encode, quality steps) are the
    /// sender's own choice and never count as link loss.
    fn wire_evictions(&self) -> u64 {
        self.video.evicted() + self.audio.evicted()
    }

    fn report(&mut self, evicted_seen: &mut u64) {
        let Some(events) = &self.events else {
            return;
        };
        let total = self.wire_evictions();
        let lost = total.saturating_sub(*evicted_seen);
        *evicted_seen = total;
        if self.stats.delivered > 0 {
            let _ = events.send(SessionEvent::Delivered {
                count: self.stats.delivered,
            });
        }
        if lost > 0 {
            let _ = events.send(SessionEvent::Lost { count: lost });
        }
        self.stats.delivered = 0;
    }

    async fn pump(&mut self, writer: &mut PacketWriter<W>) -> Result<(), StreamError> {
        let mut control_rx = self.control_rx.take();
        let mut watches_open = true;
        let mut last_report = Instant::now();
        let mut last_stats = Instant::now();
        let mut evicted_seen = self.wire_evictions();

        loop {
            self.flush_audio(writer).await?;

            if self.video.is_closed() && self.video.is_empty() {
                info!("TransmitStage: video source finished");
                return Ok(());
            }

            if last_report.elapsed() >= REPORT_INTERVAL {
                self.report(&mut evicted_seen);
                last_report = Instant::now();
            }
            if last_stats.elapsed() >= Duration::from_secs(30) {
                info!(
                    "TransmitStage: {} video, {} audio, {} control sent, {} bytes",
                    self.stats.video_sent,
                    self.stats.audio_sent,
                    self.stats.control_sent,
                    writer.bytes_written()
                );
                last_stats = Instant::now();
            }

            let audio_open = !self.audio.is_closed();
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                msg = async {
                    match control_rx.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => match msg {
                    Some(msg) => {
                        let stop = msg == ControlMessage::Stop;
                        self.send_control(writer, &msg).await?;
                        if stop {
                            return Ok(());
                        }
                    }
                    None => control_rx = None,
                },
                changed = self.quality_rx.changed(), if watches_open => {
                    if changed.is_err() {
                        watches_open = false;
                        continue;
                    }
                    let level = *self.quality_rx.borrow_and_update();
                    self.send_control(writer, &ControlMessage::SetQuality { level }).await?;
                }
                changed = self.size_rx.changed(), if watches_open => {
                    if changed.is_err() {
                        watches_open = false;
                        continue;
                    }
                    let (width, height) = *self.size_rx.borrow_and_update();
                    self.send_control(writer, &ControlMessage::SetResolution { width, height }).await?;
                }
                _ = self.audio.ready(), if audio_open => {}
                _ = self.video.ready() => {
                    // Audio that arrived meanwhile goes first
                    self.flush_audio(writer).await?;
                    if let Some(frame) = self.video.try_pop() {
                        self.send_video(writer, &frame).await?;
                    }
                }
                _ = tokio::time::sleep(REPORT_INTERVAL) => {}
            }
        }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send + Sync + 'static> PipelineStage for TransmitStage<W> {
    async fn run(&mut self) -> Result<()> {
        let mut writer = self
            .writer
            .take()
            .ok_or_else(|| anyhow::anyhow!("No output connection"))?;

        info!("TransmitStage: started");
        let result = self.pump(&mut writer).await;
        if let Err(e) = &result {
            warn!("TransmitStage: {}", e);
            self.health.record_network_error();
        } else if let Err(e) = writer.shutdown().await {
            debug!("TransmitStage: shutdown: {}", e);
        }

        info!(
            "TransmitStage: finished ({} video, {} audio, {} control, {} bytes)",
            self.stats.video_sent,
            self.stats.audio_sent,
            self.stats.control_sent,
            writer.bytes_written()
        );
        result.map_err(Into::into)
    }

    fn name(&self) -> &'static str {
        "TransmitStage"
    }
}

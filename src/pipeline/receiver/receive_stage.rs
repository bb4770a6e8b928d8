//! Receive stage for the receiver pipeline
//!
//! Reads framed packets off the connection, validates media payloads and
//! routes them to the per-stream reorder stages. Control messages go to the
//! coordinator.

use anyhow::Result;
use async_trait::async_trait;
use log::{info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::StreamError;
use crate::net::protocol::{ControlMessage, decode_audio_payload, decode_video_payload};
use crate::net::{Packet, PacketReader};
use crate::pipeline::PipelineStage;
use crate::pipeline::clock::MediaClock;
use crate::pipeline::health::PipelineHealth;
use crate::pipeline::receiver::reorder_stage::Arrival;
use crate::pipeline::session::SessionEvent;
use crate::pipeline::types::{AudioChunk, Frame, MediaKind};

#[derive(Debug, Default, Clone, Copy)]
struct ReceiveStats {
    video: u64,
    audio: u64,
    control: u64,
    corrupt: u64,
    /// Audio dropped because playback is disabled
    unrouted: u64,
}

/// Receive stage: socket → reorder stages
pub struct ReceiveStage<R> {
    reader: Option<PacketReader<R>>,
    clock: MediaClock,
    health: Arc<PipelineHealth>,
    video_tx: Option<mpsc::Sender<Arrival<Frame>>>,
    audio_tx: Option<mpsc::Sender<Arrival<AudioChunk>>>,
    control_tx: Option<mpsc::UnboundedSender<ControlMessage>>,
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
    cancel: CancellationToken,
    stats: ReceiveStats,
}

impl<R: AsyncRead + Unpin + Send + Sync + 'static> ReceiveStage<R> {
    pub fn new(
        reader: PacketReader<R>,
        clock: MediaClock,
        health: Arc<PipelineHealth>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            reader: Some(reader),
            clock,
            health,
            video_tx: None,
            audio_tx: None,
            control_tx: None,
            events: None,
            cancel,
            stats: ReceiveStats::default(),
        }
    }

    pub fn take_video_output(&mut self, capacity: usize) -> mpsc::Receiver<Arrival<Frame>> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.video_tx = Some(tx);
        rx
    }

    /// Without an audio output, audio packets are counted and dropped
    pub fn take_audio_output(&mut self, capacity: usize) -> mpsc::Receiver<Arrival<AudioChunk>> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.audio_tx = Some(tx);
        rx
    }

    pub fn take_control_output(&mut self) -> mpsc::UnboundedReceiver<ControlMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.control_tx = Some(tx);
        rx
    }

    pub fn set_events(&mut self, events: mpsc::UnboundedSender<SessionEvent>) {
        self.events = Some(events);
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    fn corrupt(&mut self, err: &StreamError) {
        self.stats.corrupt += 1;
        self.health.record_corrupt_payload();
        self.emit(SessionEvent::Lost { count: 1 });
        if self.stats.corrupt % 30 == 1 {
            warn!("ReceiveStage: {} ({} corrupt so far)", err, self.stats.corrupt);
        }
    }

    fn delivered(&self, packet: &Packet) {
        self.emit(SessionEvent::Delivered { count: 1 });
        self.emit(SessionEvent::Delay {
            sent: packet.header.timestamp,
            received_us: self.clock.timestamp_from_instant(packet.received_at).micros,
        });
    }

    /// Route one packet. Returns false once the pipeline should stop reading.
    async fn route(&mut self, packet: Packet) -> Result<bool, StreamError> {
        let seq = packet.header.sequence;
        match packet.header.kind {
            MediaKind::Video => {
                self.stats.video += 1;
                let arrival = match decode_video_payload(&packet.header, packet.payload.clone()) {
                    Ok(frame) => {
                        self.delivered(&packet);
                        Arrival::Unit(frame)
                    }
                    Err(e) => {
                        self.corrupt(&e);
                        Arrival::Lost(seq)
                    }
                };
                match &self.video_tx {
                    Some(tx) => Ok(tx.send(arrival).await.is_ok()),
                    None => Ok(true),
                }
            }
            MediaKind::Audio => {
                self.stats.audio += 1;
                let arrival = match decode_audio_payload(&packet.header, packet.payload.clone()) {
                    Ok(chunk) => {
                        self.delivered(&packet);
                        Arrival::Unit(chunk)
                    }
                    Err(e) => {
                        self.corrupt(&e);
                        Arrival::Lost(seq)
                    }
                };
                match &self.audio_tx {
                    // Playback ending on its own (device gone) must not stop video
                    Some(tx) => {
                        if tx.send(arrival).await.is_err() {
                            self.audio_tx = None;
                        }
                    }
                    None => self.stats.unrouted += 1,
                }
                Ok(true)
            }
            MediaKind::Control => {
                self.stats.control += 1;
                let msg = match ControlMessage::decode(seq, &packet.payload) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!("ReceiveStage: {}", e);
                        return Ok(true);
                    }
                };
                if let Some(tx) = &self.control_tx {
                    let _ = tx.send(msg);
                }
                Ok(msg != ControlMessage::Stop)
            }
        }
    }

    async fn receive(&mut self, reader: &mut PacketReader<R>) -> Result<(), StreamError> {
        let mut last_stats = Instant::now();
        loop {
            let packet = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                packet = reader.next_packet() => packet?,
            };
            let Some(packet) = packet else {
                return Err(StreamError::transport("sender closed the connection"));
            };

            if self.stats.video + self.stats.audio + self.stats.control == 0 {
                info!(
                    "ReceiveStage: first packet received ({}, seq {})",
                    packet.header.kind, packet.header.sequence
                );
            }
            if !self.route(packet).await? {
                return Ok(());
            }

            if last_stats.elapsed() >= Duration::from_secs(30) {
                info!(
                    "ReceiveStage: {} video, {} audio, {} control, {} corrupt, {} framing errors",
                    self.stats.video,
                    self.stats.audio,
                    self.stats.control,
                    self.stats.corrupt,
                    reader.framing_errors()
                );
                last_stats = Instant::now();
            }
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send + Sync + 'static> PipelineStage for ReceiveStage<R> {
    async fn run(&mut self) -> Result<()> {
        let mut reader = self
            .reader
            .take()
            .ok_or_else(|| anyhow::anyhow!("No input connection"))?;

        info!("ReceiveStage: started");
        let result = self.receive(&mut reader).await;
        if let Err(e) = &result {
            self.health.record_network_error();
            self.emit(SessionEvent::TransportError(e.to_string()));
        }

        // Closing the outputs lets the downstream stages drain and finish
        self.video_tx = None;
        self.audio_tx = None;
        info!(
            "ReceiveStage: finished ({} video, {} audio, {} corrupt, {} unrouted audio)",
            self.stats.video, self.stats.audio, self.stats.corrupt, self.stats.unrouted
        );
        result.map_err(Into::into)
    }

    fn name(&self) -> &'static str {
        "ReceiveStage"
    }
}

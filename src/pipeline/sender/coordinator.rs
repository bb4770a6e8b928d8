//! Sender pipeline coordinator
//!
//! Chains capture → encode → transmit, keeps the media stages running across
//! reconnects and owns one [`StreamSession`] per connection.

use anyhow::Result;
use log::{error, info, warn};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::audio::{self, AudioHost};
use crate::capture::{self, CaptureBackend, ScreenCapturer};
use crate::config::Config;
use crate::encoder::capture_queue_depth;
use crate::error::{StreamError, stream_cause};
use crate::net::protocol::ControlMessage;
use crate::net::{Connector, PacketReader, PacketWriter};
use crate::pipeline::clock::MediaClock;
use crate::pipeline::health::{HealthMonitor, PipelineHealth};
use crate::pipeline::queue::DropOldestQueue;
use crate::pipeline::sender::audio_stage::{AudioCaptureStage, AudioCapturer};
use crate::pipeline::sender::capture_stage::{CaptureSettings, CaptureStage};
use crate::pipeline::sender::control_stage::ControlStage;
use crate::pipeline::sender::encode_stage::EncodeStage;
use crate::pipeline::sender::transmit_stage::TransmitStage;
use crate::pipeline::session::{CloseCause, SessionEvent, StreamSession};
use crate::pipeline::stage::StageRunner;
use crate::pipeline::types::{AudioChunk, Frame, MediaKind, QualityPreset, Resolution, clamp_quality};
use crate::preferences::StreamPreferences;

/// User commands delivered to a running sender
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderCommand {
    Pause,
    Resume,
    Stop,
    SetQuality(u8),
    SetResolution(Resolution),
    SetFps(u32),
}

impl SenderCommand {
    /// Parse a console line: `q`, `p`, `r`, `quality <preset|1-100>`,
    /// `res <preset|WxH>` or `fps <n>`
    pub fn parse(line: &str) -> Option<Self> {
        let mut words = line.split_whitespace();
        let cmd = words.next()?.to_ascii_lowercase();
        let arg = words.next();
        match (cmd.as_str(), arg) {
            ("q" | "quit" | "stop", None) => Some(SenderCommand::Stop),
            ("p" | "pause", None) => Some(SenderCommand::Pause),
            ("r" | "resume", None) => Some(SenderCommand::Resume),
            ("quality", Some(value)) => QualityPreset::parse(value)
                .map(|preset| preset.jpeg_quality())
                .or_else(|| value.parse::<u8>().ok().filter(|q| (1..=100).contains(q)))
                .map(SenderCommand::SetQuality),
            ("res" | "resolution", Some(value)) => {
                Resolution::parse(value).map(SenderCommand::SetResolution)
            }
            ("fps", Some(value)) => value
                .parse::<u32>()
                .ok()
                .filter(|fps| *fps > 0)
                .map(SenderCommand::SetFps),
            _ => None,
        }
    }
}

/// What a local command requires beyond updating settings
enum Applied {
    Stop,
    Forward(ControlMessage),
    Done,
}

/// How one connection ended
enum ConnectionEnd {
    Closed(CloseCause),
    Lost { error: StreamError, streamed: bool },
}

/// Pipeline pieces that outlive a single connection
struct MediaPipeline {
    video: Arc<DropOldestQueue<Frame>>,
    audio: Arc<DropOldestQueue<AudioChunk>>,
    settings_tx: watch::Sender<CaptureSettings>,
    quality_tx: Arc<watch::Sender<u8>>,
    size_rx: watch::Receiver<(u32, u32)>,
    audio_paused: Option<Arc<AtomicBool>>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    stages: StageRunner,
    cancel: CancellationToken,
}

/// Coordinates the sender pipeline: Capture → Encode → Transmit
pub struct SenderCoordinator {
    config: Config,
    prefs: StreamPreferences,
    prefs_tx: watch::Sender<StreamPreferences>,
    host: Option<Arc<dyn AudioHost>>,
    // Backends are only `Send`; the mutex keeps `&self` shareable across awaits
    backends: Mutex<Option<Vec<Box<dyn CaptureBackend>>>>,
    clock: MediaClock,
    health: Arc<PipelineHealth>,
    paused: bool,
}

impl SenderCoordinator {
    pub fn new(config: Config, prefs: StreamPreferences) -> Self {
        let (prefs_tx, _) = watch::channel(prefs.clone());
        Self {
            config,
            prefs,
            prefs_tx,
            host: Some(audio::default_host()),
            backends: Mutex::new(None),
            clock: MediaClock::new(),
            health: Arc::new(PipelineHealth::new()),
            paused: false,
        }
    }

    /// Use a specific audio host instead of the build default
    pub fn with_audio_host(mut self, host: Arc<dyn AudioHost>) -> Self {
        self.host = Some(host);
        self
    }

    /// Stream video only
    pub fn without_audio(mut self) -> Self {
        self.host = None;
        self
    }

    /// Use specific capture backends instead of the ranked defaults
    pub fn with_backends(mut self, backends: Vec<Box<dyn CaptureBackend>>) -> Self {
        self.backends = Mutex::new(Some(backends));
        self
    }

    pub fn clock(&self) -> &MediaClock {
        &self.clock
    }

    pub fn health(&self) -> &Arc<PipelineHealth> {
        &self.health
    }

    /// Updated preferences, emitted whenever the user changes a value
    pub fn subscribe_preferences(&self) -> watch::Receiver<StreamPreferences> {
        self.prefs_tx.subscribe()
    }

    fn emit_preferences(&self) {
        self.prefs_tx.send_replace(self.prefs.clone());
    }

    /// Start capture, encode and audio; they run until the sender stops
    fn start_media(&mut self) -> MediaPipeline {
        let config = &self.config;
        let cancel = CancellationToken::new();
        let mut stages = StageRunner::new();

        let backends = self
            .backends
            .get_mut()
            .unwrap_or_else(|p| p.into_inner())
            .take()
            .unwrap_or_else(|| capture::ranked_backends(&config.capture));
        let capturer = ScreenCapturer::new(
            backends,
            self.clock.clone(),
            self.prefs.resolution,
            &config.capture,
        );
        let (w, h) = capturer.output_size();
        let depth = capture_queue_depth(w, h, config.capture.target_fps, config.transport.video_queue);
        info!(
            "SenderCoordinator: {}x{} at {} fps, capture queue {}",
            w, h, config.capture.target_fps, depth
        );

        let capture_queue = DropOldestQueue::new(depth);
        let video = DropOldestQueue::new(config.transport.video_queue);
        let audio = DropOldestQueue::new(config.transport.audio_queue);

        let (settings_tx, settings_rx) = watch::channel(CaptureSettings {
            paused: false,
            resolution: self.prefs.resolution,
            fps: config.capture.target_fps,
        });
        let capture_stage = CaptureStage::new(
            capturer,
            self.health.clone(),
            settings_rx,
            capture_queue.clone(),
            cancel.child_token(),
        );
        let size_rx = capture_stage.subscribe_size();

        let quality_tx = Arc::new(watch::channel(clamp_quality(self.prefs.quality as i32)).0);
        let encode_stage = EncodeStage::new(
            &config.encoder,
            self.health.clone(),
            capture_queue,
            video.clone(),
            quality_tx.clone(),
            cancel.child_token(),
        );
        stages.spawn(Box::new(capture_stage));
        stages.spawn(Box::new(encode_stage));

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let audio_paused = match self.host.clone() {
            Some(host) => {
                let capturer = Arc::new(AudioCapturer::new(host, &config.audio));
                match capturer.select(self.prefs.audio_device_id.as_deref()) {
                    Ok(device) => {
                        info!("SenderCoordinator: audio from {}", device);
                        let mut stage = AudioCaptureStage::new(
                            capturer,
                            device,
                            self.clock.clone(),
                            self.health.clone(),
                            audio.clone(),
                            cancel.child_token(),
                        );
                        stage.set_events(events_tx.clone());
                        let paused = stage.pause_flag();
                        stages.spawn(Box::new(stage));
                        Some(paused)
                    }
                    Err(e) => {
                        error!("SenderCoordinator: no audio: {}", e);
                        audio.close();
                        None
                    }
                }
            }
            None => {
                audio.close();
                None
            }
        };

        tokio::spawn(HealthMonitor::new("Sender pipeline", self.health.clone()).run(cancel.child_token()));

        MediaPipeline {
            video,
            audio,
            settings_tx,
            quality_tx,
            size_rx,
            audio_paused,
            events_tx,
            events_rx,
            stages,
            cancel,
        }
    }

    /// Apply a command to the local pipeline
    fn apply(&mut self, media: &MediaPipeline, cmd: Option<SenderCommand>) -> Applied {
        let Some(cmd) = cmd else {
            return Applied::Stop;
        };
        match cmd {
            SenderCommand::Stop => Applied::Stop,
            SenderCommand::Pause | SenderCommand::Resume => {
                let paused = cmd == SenderCommand::Pause;
                if paused == self.paused {
                    return Applied::Done;
                }
                self.paused = paused;
                media.settings_tx.send_modify(|s| s.paused = paused);
                if let Some(flag) = &media.audio_paused {
                    flag.store(paused, Ordering::Release);
                }
                info!("SenderCoordinator: {}", if paused { "paused" } else { "resumed" });
                Applied::Forward(if paused {
                    ControlMessage::Pause
                } else {
                    ControlMessage::Resume
                })
            }
            SenderCommand::SetQuality(level) => {
                let level = clamp_quality(level as i32);
                // The transmitter announces the change
                media.quality_tx.send_replace(level);
                self.prefs.quality = level;
                self.emit_preferences();
                Applied::Done
            }
            SenderCommand::SetResolution(resolution) => {
                media.settings_tx.send_modify(|s| s.resolution = resolution);
                self.prefs.resolution = resolution;
                self.emit_preferences();
                Applied::Done
            }
            SenderCommand::SetFps(fps) => {
                media.settings_tx.send_modify(|s| s.fps = fps.max(1));
                Applied::Done
            }
        }
    }

    /// Send the opening SetResolution/SetQuality pair
    ///
    /// The values sent are marked seen on the receivers the transmitter will
    /// watch, so any later change is announced again.
    async fn negotiate(
        &self,
        quality_rx: &mut watch::Receiver<u8>,
        size_rx: &mut watch::Receiver<(u32, u32)>,
        writer: &mut PacketWriter<tokio::net::tcp::OwnedWriteHalf>,
    ) -> Result<(), StreamError> {
        let (width, height) = *size_rx.borrow_and_update();
        let level = *quality_rx.borrow_and_update();
        let mut opening = vec![
            ControlMessage::SetResolution { width, height },
            ControlMessage::SetQuality { level },
        ];
        if self.paused {
            opening.push(ControlMessage::Pause);
        }

        let send_all = async {
            for msg in &opening {
                writer
                    .send(
                        MediaKind::Control,
                        self.clock.next_control_sequence(),
                        self.clock.now(),
                        &msg.encode(),
                    )
                    .await?;
            }
            Ok::<(), StreamError>(())
        };
        match tokio::time::timeout(self.config.transport.negotiation_timeout, send_all).await {
            Ok(result) => result,
            Err(_) => Err(StreamError::NegotiationFailed(
                "receiver did not accept the opening messages in time".into(),
            )),
        }
    }

    /// Dial the receiver, letting a Stop command interrupt the wait
    async fn dial(
        &mut self,
        media: &MediaPipeline,
        connector: &Connector,
        commands: &mut mpsc::Receiver<SenderCommand>,
        first: bool,
    ) -> Option<Result<TcpStream, StreamError>> {
        let connect = async {
            if first {
                connector.connect().await
            } else {
                connector.connect_once().await
            }
        };
        tokio::pin!(connect);
        loop {
            tokio::select! {
                result = &mut connect => return Some(result),
                cmd = commands.recv() => {
                    if let Applied::Stop = self.apply(media, cmd) {
                        return None;
                    }
                }
            }
        }
    }

    /// Run one connection from dial to close
    async fn run_connection(
        &mut self,
        media: &mut MediaPipeline,
        connector: &Connector,
        commands: &mut mpsc::Receiver<SenderCommand>,
        first: bool,
    ) -> ConnectionEnd {
        let mut session = StreamSession::new(
            connector.peer(),
            self.prefs.resolution,
            *media.quality_tx.borrow(),
            &self.config,
        );

        let stream = match self.dial(media, connector, commands, first).await {
            None => {
                session.stop();
                return ConnectionEnd::Closed(CloseCause::Stopped);
            }
            Some(Ok(stream)) => stream,
            Some(Err(e)) if first => {
                session.fail_negotiation(format!("cannot reach {}: {}", connector.peer(), e));
                return ConnectionEnd::Closed(session.close_cause().cloned().unwrap_or(CloseCause::Stopped));
            }
            Some(Err(error)) => {
                session.fail(&error);
                return ConnectionEnd::Lost {
                    error,
                    streamed: false,
                };
            }
        };

        let (read_half, write_half) = stream.into_split();
        let mut writer = PacketWriter::new(write_half, self.config.transport.write_timeout);
        let mut quality_rx = media.quality_tx.subscribe();
        let mut size_rx = media.size_rx.clone();
        if let Err(e) = self.negotiate(&mut quality_rx, &mut size_rx, &mut writer).await {
            session.fail_negotiation(e.to_string());
            if first {
                return ConnectionEnd::Closed(session.close_cause().cloned().unwrap_or(CloseCause::Stopped));
            }
            return ConnectionEnd::Lost {
                error: e,
                streamed: false,
            };
        }
        session.negotiated();
        self.prefs.peer_address = Some(connector.peer().to_string());
        self.emit_preferences();

        // Frames queued while disconnected are stale
        let stale = media.video.clear();
        if stale > 0 {
            info!("SenderCoordinator: discarded {} stale frames", stale);
        }
        while media.events_rx.try_recv().is_ok() {}

        let cancel = media.cancel.child_token();
        let mut transmit = TransmitStage::new(
            writer,
            self.clock.clone(),
            self.health.clone(),
            media.video.clone(),
            media.audio.clone(),
            quality_rx,
            size_rx,
            cancel.clone(),
        );
        transmit.set_events(media.events_tx.clone());
        let control_tx = transmit.control_sender();
        let control = ControlStage::new(
            PacketReader::new(
                read_half,
                self.config.transport.max_payload,
                self.config.transport.max_consecutive_errors,
            ),
            media.events_tx.clone(),
            cancel.clone(),
        );

        let mut connection = StageRunner::new();
        connection.spawn(Box::new(transmit));
        connection.spawn(Box::new(control));

        let end = loop {
            tokio::select! {
                cmd = commands.recv() => match self.apply(media, cmd) {
                    Applied::Stop => {
                        // Let the transmitter flush Stop, then hang up
                        if control_tx.send(ControlMessage::Stop).await.is_ok() {
                            let _ = tokio::time::timeout(
                                self.config.transport.write_timeout,
                                connection.next_exit(),
                            )
                            .await;
                        }
                        session.stop();
                        break ConnectionEnd::Closed(CloseCause::Stopped);
                    }
                    Applied::Forward(msg) => {
                        let _ = control_tx.send(msg).await;
                    }
                    Applied::Done => {}
                },
                Some(event) = media.events_rx.recv() => {
                    session.apply(event);
                    if let Some(cause) = session.close_cause() {
                        break ConnectionEnd::Closed(cause.clone());
                    }
                }
                Some(exit) = connection.next_exit(), if !connection.is_empty() => {
                    // A clean exit means capture ended; the media exit says why
                    if let Err(e) = exit.result {
                        let error = StreamError::transport(format!("{:#}", e));
                        warn!("SenderCoordinator: {} failed: {}", exit.name, error);
                        session.fail(&error);
                        break ConnectionEnd::Lost { error, streamed: true };
                    }
                }
                Some(exit) = media.stages.next_exit(), if !media.stages.is_empty() => {
                    match exit.result {
                        Err(e) => match stream_cause(&e) {
                            Some(err @ StreamError::CaptureUnavailable { .. }) => {
                                let cause = CloseCause::from_error(err);
                                let _ = control_tx.send(ControlMessage::Stop).await;
                                session.close(cause.clone());
                                break ConnectionEnd::Closed(cause);
                            }
                            _ => warn!("SenderCoordinator: {} stopped: {:#}; streaming without it", exit.name, e),
                        },
                        Ok(()) if exit.name == "CaptureStage" => {
                            session.stop();
                            break ConnectionEnd::Closed(CloseCause::Stopped);
                        }
                        Ok(()) => {}
                    }
                }
            }
        };

        cancel.cancel();
        connection.abort_all();
        end
    }

    /// Stream to the peer in the preferences until stopped or failed
    pub async fn run(mut self, mut commands: mpsc::Receiver<SenderCommand>) -> Result<CloseCause> {
        let peer = self
            .prefs
            .peer_address
            .clone()
            .ok_or_else(|| StreamError::Config("no receiver address given".into()))?;
        let connector = Connector::new(&peer, &self.config.transport);
        let mut media = self.start_media();
        info!("SenderCoordinator: streaming to {}", connector.peer());

        let max_reconnects = self.config.transport.max_reconnect_attempts;
        let mut reconnects = 0u32;
        let mut first = true;

        let cause = loop {
            match self.run_connection(&mut media, &connector, &mut commands, first).await {
                ConnectionEnd::Closed(cause) => break cause,
                ConnectionEnd::Lost { error, streamed } => {
                    first = false;
                    if streamed {
                        reconnects = 0;
                    }
                    if reconnects >= max_reconnects {
                        break CloseCause::from_error(&StreamError::TransportError(format!(
                            "gave up after {} reconnect attempts: {}",
                            reconnects, error
                        )));
                    }
                    let delay = self.config.transport.backoff(reconnects);
                    reconnects += 1;
                    warn!(
                        "SenderCoordinator: connection lost ({}), reconnecting in {:?} ({}/{})",
                        error, delay, reconnects, max_reconnects
                    );

                    let sleep = tokio::time::sleep(delay);
                    tokio::pin!(sleep);
                    let mut stopped = false;
                    loop {
                        tokio::select! {
                            _ = &mut sleep => break,
                            cmd = commands.recv() => {
                                if let Applied::Stop = self.apply(&media, cmd) {
                                    stopped = true;
                                    break;
                                }
                            }
                        }
                    }
                    if stopped {
                        break CloseCause::Stopped;
                    }
                }
            }
        };

        media.cancel.cancel();
        media.video.close();
        media.audio.close();
        if tokio::time::timeout(Duration::from_secs(2), media.stages.join_all())
            .await
            .is_err()
        {
            warn!("SenderCoordinator: stages did not stop in time");
            media.stages.abort_all();
        }

        info!("SenderCoordinator: closed ({})", cause);
        Ok(cause)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::VirtualHost;
    use crate::capture::test_card::TestCard;
    use crate::net::Listener;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.capture.target_fps = 50;
        config.transport.connect_timeout = Duration::from_millis(200);
        config.transport.max_reconnect_attempts = 1;
        config.transport.reconnect_backoff_initial = Duration::from_millis(10);
        config.audio.sample_rate = 8000;
        config.audio.channels = 1;
        config.audio.chunk_frames = 400;
        config
    }

    fn sender(config: Config, peer: String) -> SenderCoordinator {
        let prefs = StreamPreferences {
            peer_address: Some(peer),
            resolution: Resolution::Native,
            quality: 70,
            audio_device_id: None,
        };
        SenderCoordinator::new(config, prefs)
            .with_backends(vec![Box::new(TestCard::new(64, 36))])
            .with_audio_host(Arc::new(VirtualHost::with_default_devices()))
    }

    #[test]
    fn test_parse_console_commands() {
        assert_eq!(SenderCommand::parse("q"), Some(SenderCommand::Stop));
        assert_eq!(SenderCommand::parse(" P "), Some(SenderCommand::Pause));
        assert_eq!(SenderCommand::parse("r"), Some(SenderCommand::Resume));
        assert_eq!(SenderCommand::parse("quality high"), Some(SenderCommand::SetQuality(85)));
        assert_eq!(SenderCommand::parse("quality 42"), Some(SenderCommand::SetQuality(42)));
        assert_eq!(SenderCommand::parse("quality 0"), None);
        assert_eq!(
            SenderCommand::parse("res 720"),
            Some(SenderCommand::SetResolution(Resolution::Fixed {
                width: 1280,
                height: 720
            }))
        );
        assert_eq!(SenderCommand::parse("fps 24"), Some(SenderCommand::SetFps(24)));
        assert_eq!(SenderCommand::parse("fps"), None);
        assert_eq!(SenderCommand::parse("dance"), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_streams_and_stops_cleanly() {
        let listener = Listener::bind(0).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let coordinator = sender(test_config(), format!("127.0.0.1:{}", port));
        let (commands, commands_rx) = mpsc::channel(8);
        let handle = tokio::spawn(coordinator.run(commands_rx));

        let (stream, _) = listener.accept(Some(Duration::from_secs(5))).await.unwrap();
        let mut reader = PacketReader::new(stream, 1 << 24, 4);

        let first = reader.next_packet().await.unwrap().unwrap();
        assert_eq!(
            ControlMessage::decode(0, &first.payload).unwrap(),
            ControlMessage::SetResolution {
                width: 64,
                height: 36
            }
        );
        let second = reader.next_packet().await.unwrap().unwrap();
        assert_eq!(
            ControlMessage::decode(1, &second.payload).unwrap(),
            ControlMessage::SetQuality { level: 70 }
        );

        let (mut video, mut audio, mut audio_format_before_audio) = (0, 0, false);
        let mut last_video_seq = None;
        while video < 5 || audio < 2 {
            let p = reader.next_packet().await.unwrap().unwrap();
            match p.header.kind {
                MediaKind::Video => {
                    if let Some(last) = last_video_seq {
                        assert!(p.header.sequence > last);
                    }
                    last_video_seq = Some(p.header.sequence);
                    video += 1;
                }
                MediaKind::Audio => {
                    assert!(audio_format_before_audio);
                    audio += 1;
                }
                MediaKind::Control => {
                    if let Ok(ControlMessage::AudioFormat { sample_rate, .. }) =
                        ControlMessage::decode(p.header.sequence, &p.payload)
                    {
                        assert_eq!(sample_rate, 8000);
                        audio_format_before_audio = true;
                    }
                }
            }
        }

        commands.send(SenderCommand::Stop).await.unwrap();
        let mut saw_stop = false;
        while let Ok(Some(p)) = reader.next_packet().await {
            if p.header.kind == MediaKind::Control
                && ControlMessage::decode(p.header.sequence, &p.payload).ok() == Some(ControlMessage::Stop)
            {
                saw_stop = true;
            }
        }
        assert!(saw_stop);
        assert_eq!(handle.await.unwrap().unwrap(), CloseCause::Stopped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_unreachable_peer_fails_negotiation() {
        // Bind then drop to get a port nobody listens on
        let port = {
            let l = Listener::bind(0).await.unwrap();
            l.local_addr().unwrap().port()
        };
        let coordinator = sender(test_config(), format!("127.0.0.1:{}", port)).without_audio();
        let (_commands, commands_rx) = mpsc::channel(8);
        let cause = coordinator.run(commands_rx).await.unwrap();
        assert_eq!(cause.kind(), "NegotiationFailed");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_receiver_stop_closes_session() {
        let listener = Listener::bind(0).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let coordinator = sender(test_config(), format!("127.0.0.1:{}", port)).without_audio();
        let (_commands, commands_rx) = mpsc::channel(8);
        let handle = tokio::spawn(coordinator.run(commands_rx));

        let (stream, _) = listener.accept(Some(Duration::from_secs(5))).await.unwrap();
        let (read_half, write_half) = stream.into_split();
        let mut writer = PacketWriter::new(write_half, Duration::from_secs(1));
        writer
            .send(
                MediaKind::Control,
                0,
                crate::pipeline::types::Timestamp::from_micros(0),
                &ControlMessage::Stop.encode(),
            )
            .await
            .unwrap();

        let cause = handle.await.unwrap().unwrap();
        assert_eq!(cause, CloseCause::PeerStopped);
        drop(read_half);
    }
}

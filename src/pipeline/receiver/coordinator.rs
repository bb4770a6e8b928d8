//! Receiver pipeline coordinator
//!
//! Accepts a sender, chains receive → reorder → decode → sync → render (and
//! reorder → playback for audio) for each connection, owns one
//! [`StreamSession`] per connection and waits for the sender to come back
//! when the link drops.

use anyhow::Result;
use log::{error, info, warn};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::audio::player::AudioPlayer;
use crate::audio::{self, AudioFormat, AudioHost};
use crate::config::{Config, TransportConfig};
use crate::display::{HeadlessSurface, KeyCommand, RenderSurface, Renderer};
use crate::error::{StreamError, stream_cause};
use crate::net::protocol::ControlMessage;
use crate::net::{Listener, PacketReader, PacketWriter};
use crate::pipeline::clock::MediaClock;
use crate::pipeline::health::{HealthMonitor, PipelineHealth};
use crate::pipeline::receiver::decode_stage::DecodeStage;
use crate::pipeline::receiver::playback_stage::{PlaybackStage, lock_player};
use crate::pipeline::receiver::receive_stage::ReceiveStage;
use crate::pipeline::receiver::render_stage::RenderStage;
use crate::pipeline::receiver::reorder_stage::ReorderStage;
use crate::pipeline::receiver::sync_stage::SyncStage;
use crate::pipeline::session::{CloseCause, SessionEvent, StreamSession};
use crate::pipeline::stage::StageRunner;
use crate::pipeline::state::SessionState;
use crate::pipeline::types::{AudioChunk, Frame, MediaKind, Resolution};
use crate::preferences::StreamPreferences;

/// Frames between the synchronizer and the renderer
const RENDER_QUEUE: usize = 3;

/// How long a stopped pipeline may take to drain what it already holds
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// User commands delivered to a running receiver
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReceiverCommand {
    Stop,
    ToggleFullscreen,
    TogglePause,
    VolumeUp,
    VolumeDown,
    SetVolume(f32),
    AudioStatus,
}

impl From<KeyCommand> for ReceiverCommand {
    fn from(key: KeyCommand) -> Self {
        match key {
            KeyCommand::Stop => ReceiverCommand::Stop,
            KeyCommand::ToggleFullscreen => ReceiverCommand::ToggleFullscreen,
            KeyCommand::TogglePause => ReceiverCommand::TogglePause,
            KeyCommand::VolumeUp => ReceiverCommand::VolumeUp,
            KeyCommand::VolumeDown => ReceiverCommand::VolumeDown,
            KeyCommand::AudioStatus => ReceiverCommand::AudioStatus,
        }
    }
}

/// What a local command requires beyond updating local state
enum Applied {
    Stop,
    PauseChanged,
    Done,
}

/// How one connection ended
enum ConnectionEnd {
    Closed(CloseCause),
    Lost { error: StreamError, streamed: bool },
}

/// Pipeline pieces that live as long as one connection
struct Connection {
    stages: StageRunner,
    control_rx: mpsc::UnboundedReceiver<ControlMessage>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    writer: PacketWriter<OwnedWriteHalf>,
    pause_tx: watch::Sender<bool>,
    sender_paused: bool,
    cancel: CancellationToken,
}

/// How long to keep listening for a sender that dropped off. Covers every
/// retry the sender makes with the same transport settings.
fn reconnect_window(transport: &TransportConfig) -> Duration {
    (0..transport.max_reconnect_attempts.max(1))
        .map(|attempt| transport.backoff(attempt) + transport.connect_timeout)
        .sum()
}

/// Coordinates the receiver pipeline: Receive → Decode → Sync → Render
pub struct ReceiverCoordinator {
    config: Config,
    prefs: StreamPreferences,
    prefs_tx: watch::Sender<StreamPreferences>,
    state_tx: watch::Sender<SessionState>,
    host: Option<Arc<dyn AudioHost>>,
    player: Option<Arc<Mutex<AudioPlayer>>>,
    renderer: Arc<Mutex<Renderer>>,
    clock: MediaClock,
    health: Arc<PipelineHealth>,
    local_paused: bool,
}

impl ReceiverCoordinator {
    pub fn new(config: Config, prefs: StreamPreferences) -> Self {
        let (prefs_tx, _) = watch::channel(prefs.clone());
        let (state_tx, _) = watch::channel(SessionState::Connecting);
        Self {
            config,
            prefs,
            prefs_tx,
            state_tx,
            host: Some(audio::default_host()),
            player: None,
            renderer: Arc::new(Mutex::new(Renderer::new(Box::new(HeadlessSurface::new())))),
            clock: MediaClock::new(),
            health: Arc::new(PipelineHealth::new()),
            local_paused: false,
        }
    }

    /// Use a specific audio host instead of the build default
    pub fn with_audio_host(mut self, host: Arc<dyn AudioHost>) -> Self {
        self.host = Some(host);
        self
    }

    /// Show video only
    pub fn without_audio(mut self) -> Self {
        self.host = None;
        self
    }

    /// Present on `surface` instead of discarding frames
    pub fn with_surface(mut self, surface: Box<dyn RenderSurface>) -> Self {
        self.renderer = Arc::new(Mutex::new(Renderer::new(surface)));
        self
    }

    pub fn health(&self) -> &Arc<PipelineHealth> {
        &self.health
    }

    /// State of the current session; `Connecting` while waiting for a sender
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Updated preferences, emitted when a sender connects or the output changes
    pub fn subscribe_preferences(&self) -> watch::Receiver<StreamPreferences> {
        self.prefs_tx.subscribe()
    }

    fn emit_preferences(&self) {
        self.prefs_tx.send_replace(self.prefs.clone());
    }

    fn publish(&self, state: SessionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
    }

    fn renderer(&self) -> std::sync::MutexGuard<'_, Renderer> {
        // Renderer state is a few flags and a sequence number; nothing a
        // panicking present could leave half-written
        self.renderer.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Open the output device once; it stays open across connections
    fn open_player(&mut self) {
        let Some(host) = self.host.clone() else {
            return;
        };
        let mut player = AudioPlayer::new(
            host,
            &self.config.audio,
            self.config.sync.min_audio_units,
            self.clock.clone(),
        );
        let opened = player
            .select(self.prefs.audio_device_id.as_deref())
            .and_then(|device| player.open(&device).map(|format| (device, format)));
        match opened {
            Ok((device, format)) => {
                info!("ReceiverCoordinator: audio to {} ({})", device, format);
                self.prefs.audio_device_id = Some(device.id);
                self.emit_preferences();
                self.player = Some(Arc::new(Mutex::new(player)));
            }
            Err(e) => error!("ReceiverCoordinator: no audio: {}", e),
        }
    }

    fn adjust_volume(&self, volume: impl FnOnce(f32) -> f32) {
        let Some(player) = &self.player else {
            info!("ReceiverCoordinator: no audio output");
            return;
        };
        let mut player = lock_player(player);
        let next = volume(player.volume());
        player.set_volume(next);
        info!("ReceiverCoordinator: volume {:.0}%", player.volume() * 100.0);
    }

    /// Apply a command to the local pipeline
    fn apply(&mut self, cmd: Option<ReceiverCommand>) -> Applied {
        let Some(cmd) = cmd else {
            return Applied::Stop;
        };
        let step = self.config.audio.volume_step;
        match cmd {
            ReceiverCommand::Stop => Applied::Stop,
            ReceiverCommand::ToggleFullscreen => {
                self.renderer().toggle_fullscreen();
                Applied::Done
            }
            ReceiverCommand::TogglePause => {
                self.local_paused = !self.local_paused;
                self.renderer().set_paused(self.local_paused);
                info!(
                    "ReceiverCoordinator: {}",
                    if self.local_paused { "paused" } else { "resumed" }
                );
                Applied::PauseChanged
            }
            ReceiverCommand::VolumeUp => {
                self.adjust_volume(|v| v + step);
                Applied::Done
            }
            ReceiverCommand::VolumeDown => {
                self.adjust_volume(|v| v - step);
                Applied::Done
            }
            ReceiverCommand::SetVolume(volume) => {
                self.adjust_volume(|_| volume);
                Applied::Done
            }
            ReceiverCommand::AudioStatus => {
                match &self.player {
                    Some(player) => info!("ReceiverCoordinator: audio: {}", lock_player(player).status()),
                    None => info!("ReceiverCoordinator: audio: disabled"),
                }
                Applied::Done
            }
        }
    }

    /// Freeze or release the picture and the sound together
    fn sync_pause(&self, connection: &Connection) {
        let paused = self.local_paused || connection.sender_paused;
        if *connection.pause_tx.borrow() == paused {
            return;
        }
        connection.pause_tx.send_replace(paused);
        if let Some(player) = &self.player {
            let mut player = lock_player(player);
            if paused {
                player.pause();
            } else {
                player.resume();
            }
        }
    }

    /// Wait for a sender, letting a Stop command interrupt the wait
    async fn wait_for_sender(
        &mut self,
        listener: &Listener,
        commands: &mut mpsc::Receiver<ReceiverCommand>,
        timeout: Option<Duration>,
    ) -> Option<Result<(TcpStream, SocketAddr), StreamError>> {
        let accept = listener.accept(timeout);
        tokio::pin!(accept);
        loop {
            tokio::select! {
                result = &mut accept => return Some(result),
                cmd = commands.recv() => {
                    if let Applied::Stop = self.apply(cmd) {
                        return None;
                    }
                }
            }
        }
    }

    /// Build the per-connection stages around an accepted stream
    fn start_connection(&mut self, stream: TcpStream) -> Connection {
        let config = &self.config;
        let cancel = CancellationToken::new();
        let (read_half, write_half) = stream.into_split();
        let writer = PacketWriter::new(write_half, config.transport.write_timeout);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let mut receive = ReceiveStage::new(
            PacketReader::new(
                read_half,
                config.transport.max_payload,
                config.transport.max_consecutive_errors,
            ),
            self.clock.clone(),
            self.health.clone(),
            cancel.child_token(),
        );
        receive.set_events(events_tx.clone());
        let video_arrivals = receive.take_video_output(config.sync.max_video_queue);
        let control_rx = receive.take_control_output();

        let mut video_reorder =
            ReorderStage::<Frame>::new("VideoReorderStage", &config.reorder, self.health.clone());
        video_reorder.set_input(video_arrivals);
        video_reorder.set_events(events_tx.clone());
        let frames = video_reorder.take_output(config.transport.video_queue);

        let mut decode = DecodeStage::new(self.health.clone());
        decode.set_input(frames);
        decode.set_events(events_tx.clone());
        let decoded = decode.take_output(config.transport.video_queue);

        let (pause_tx, pause_rx) = watch::channel(false);
        let mut sync = SyncStage::new(&config.sync, self.clock.clone(), self.health.clone());
        sync.set_input(decoded);
        sync.set_pause(pause_rx);
        let released = sync.take_output(RENDER_QUEUE);

        self.renderer().new_stream();
        let mut render = RenderStage::new(
            self.renderer.clone(),
            config.render.target_fps,
            self.health.clone(),
            cancel.child_token(),
        );
        render.set_input(released);

        let mut stages = StageRunner::new();
        if let Some(player) = &self.player {
            let audio_arrivals = receive.take_audio_output(config.transport.audio_queue);
            let mut audio_reorder = ReorderStage::<AudioChunk>::new(
                "AudioReorderStage",
                &config.reorder,
                self.health.clone(),
            );
            audio_reorder.set_input(audio_arrivals);
            audio_reorder.set_events(events_tx.clone());
            let chunks = audio_reorder.take_output(config.transport.audio_queue);

            let clock = {
                let mut player = lock_player(player);
                player.reset();
                player.clock()
            };
            sync.set_audio_clock(clock);

            let mut playback = PlaybackStage::new(player.clone(), self.health.clone(), cancel.child_token());
            playback.set_input(chunks);
            playback.set_events(events_tx.clone());
            stages.spawn(Box::new(audio_reorder));
            stages.spawn(Box::new(playback));
        }

        stages.spawn(Box::new(receive));
        stages.spawn(Box::new(video_reorder));
        stages.spawn(Box::new(decode));
        stages.spawn(Box::new(sync));
        stages.spawn(Box::new(render));

        Connection {
            stages,
            control_rx,
            events_rx,
            writer,
            pause_tx,
            sender_paused: false,
            cancel,
        }
    }

    /// Act on a control message from the sender. Returns false once the
    /// sender has stopped.
    fn on_control(
        &mut self,
        session: &mut StreamSession,
        connection: &mut Connection,
        msg: ControlMessage,
    ) -> bool {
        match msg {
            ControlMessage::SetResolution { width, height } => {
                session.set_resolution(Resolution::Fixed { width, height });
                if session.state() == SessionState::Connecting {
                    session.negotiated();
                }
            }
            ControlMessage::SetQuality { level } => {
                session.set_quality(level);
                if session.state() == SessionState::Connecting {
                    session.negotiated();
                }
            }
            ControlMessage::AudioFormat {
                sample_rate,
                channels,
                bits,
            } => {
                if bits != 16 {
                    warn!("ReceiverCoordinator: {}-bit audio announced, expecting 16", bits);
                }
                if let Some(player) = &self.player {
                    let format = AudioFormat::new(sample_rate, channels);
                    if let Err(e) = lock_player(player).set_source_format(format) {
                        warn!("ReceiverCoordinator: cannot play {}: {}", format, e);
                    }
                }
            }
            ControlMessage::Pause | ControlMessage::Resume => {
                connection.sender_paused = msg == ControlMessage::Pause;
                info!(
                    "ReceiverCoordinator: sender {}",
                    if connection.sender_paused { "paused" } else { "resumed" }
                );
                self.sync_pause(connection);
            }
            ControlMessage::Stop => {
                session.apply(SessionEvent::PeerStop);
                return false;
            }
        }
        true
    }

    /// Tell the sender to stop, without waiting longer than a write allows
    async fn send_stop(&self, connection: &mut Connection) {
        let sent = connection
            .writer
            .send(
                MediaKind::Control,
                self.clock.next_control_sequence(),
                self.clock.now(),
                &ControlMessage::Stop.encode(),
            )
            .await;
        match sent {
            Ok(()) => {
                let _ = connection.writer.shutdown().await;
            }
            Err(e) => warn!("ReceiverCoordinator: could not send Stop: {}", e),
        }
    }

    /// Run one accepted connection until it closes or drops
    async fn run_connection(
        &mut self,
        stream: TcpStream,
        peer: SocketAddr,
        commands: &mut mpsc::Receiver<ReceiverCommand>,
        first: bool,
    ) -> ConnectionEnd {
        let mut session = StreamSession::new(
            peer.to_string(),
            self.prefs.resolution,
            self.prefs.quality,
            &self.config,
        );
        self.publish(session.state());
        let mut connection = self.start_connection(stream);
        self.sync_pause(&connection);

        let mut poll = tokio::time::interval(Duration::from_millis(100));
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut drain = false;

        let end = loop {
            tokio::select! {
                cmd = commands.recv() => match self.apply(cmd) {
                    Applied::Stop => {
                        self.send_stop(&mut connection).await;
                        session.stop();
                        break ConnectionEnd::Closed(CloseCause::Stopped);
                    }
                    Applied::PauseChanged => self.sync_pause(&connection),
                    Applied::Done => {}
                },
                Some(msg) = connection.control_rx.recv() => {
                    let was_connecting = session.state() == SessionState::Connecting;
                    if !self.on_control(&mut session, &mut connection, msg) {
                        drain = true;
                        break ConnectionEnd::Closed(CloseCause::PeerStopped);
                    }
                    if was_connecting && session.state().is_active() {
                        self.prefs.peer_address = Some(peer.ip().to_string());
                        self.emit_preferences();
                    }
                }
                Some(event) = connection.events_rx.recv() => {
                    session.apply(event);
                    if let Some(cause) = session.close_cause() {
                        break ConnectionEnd::Closed(cause.clone());
                    }
                }
                _ = poll.tick() => {
                    if session.poll_timeout(Instant::now()) {
                        let cause = session.close_cause().cloned().unwrap_or(CloseCause::Stopped);
                        if first {
                            break ConnectionEnd::Closed(cause);
                        }
                        break ConnectionEnd::Lost {
                            error: StreamError::NegotiationFailed(cause.to_string()),
                            streamed: false,
                        };
                    }
                }
                Some(exit) = connection.stages.next_exit(), if !connection.stages.is_empty() => {
                    let Err(e) = exit.result else {
                        // The receive stage ends cleanly after Stop, which
                        // is still queued on the control channel
                        continue;
                    };
                    if exit.name == "PlaybackStage" {
                        warn!("ReceiverCoordinator: audio stopped: {:#}; continuing with video only", e);
                        continue;
                    }
                    let error = match stream_cause(&e) {
                        Some(StreamError::TransportError(msg)) => StreamError::TransportError(msg.clone()),
                        _ => StreamError::transport(format!("{}: {:#}", exit.name, e)),
                    };
                    warn!("ReceiverCoordinator: {} failed: {}", exit.name, error);
                    let streamed = session.state().is_active();
                    session.fail(&error);
                    break ConnectionEnd::Lost { error, streamed };
                }
            }
            self.publish(session.state());
        };
        self.publish(session.state());

        if drain {
            // Let what already arrived reach the screen
            if tokio::time::timeout(DRAIN_TIMEOUT, connection.stages.join_all())
                .await
                .is_err()
            {
                warn!("ReceiverCoordinator: pipeline did not drain in time");
            }
        } else {
            connection.cancel.cancel();
            let _ = tokio::time::timeout(DRAIN_TIMEOUT, connection.stages.join_all()).await;
        }
        connection.stages.abort_all();
        end
    }

    /// Listen for a sender and show its stream until stopped or failed
    pub async fn run(
        mut self,
        listener: Listener,
        mut commands: mpsc::Receiver<ReceiverCommand>,
    ) -> Result<CloseCause> {
        self.open_player();
        let monitor = CancellationToken::new();
        tokio::spawn(HealthMonitor::new("Receiver pipeline", self.health.clone()).run(monitor.child_token()));

        match listener.shareable_address() {
            Some(addr) => info!("ReceiverCoordinator: waiting for a sender at {}", addr),
            None => info!(
                "ReceiverCoordinator: waiting for a sender on port {}",
                listener.local_addr()?.port()
            ),
        }

        let max_reconnects = self.config.transport.max_reconnect_attempts;
        let window = reconnect_window(&self.config.transport);
        let mut reconnects = 0u32;
        let mut first = true;
        let mut timeout = None;

        let cause = loop {
            let (stream, peer) = match self.wait_for_sender(&listener, &mut commands, timeout).await {
                None => break CloseCause::Stopped,
                Some(Ok(accepted)) => accepted,
                Some(Err(e)) if timeout.is_some() => {
                    break CloseCause::from_error(&StreamError::TransportError(format!(
                        "sender did not reconnect: {}",
                        e
                    )));
                }
                Some(Err(e)) => break CloseCause::from_error(&e),
            };

            match self.run_connection(stream, peer, &mut commands, first).await {
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
                    reconnects += 1;
                    warn!(
                        "ReceiverCoordinator: connection lost ({}), waiting {:?} for the sender ({}/{})",
                        error, window, reconnects, max_reconnects
                    );
                    self.publish(SessionState::Connecting);
                    timeout = Some(window);
                }
            }
        };

        monitor.cancel();
        self.publish(SessionState::Closed);
        info!("ReceiverCoordinator: closed ({})", cause);
        Ok(cause)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::VirtualHost;
    use crate::display::PresentedLog;
    use crate::encoder;
    use crate::net::protocol::{encode_audio_payload, encode_video_payload};
    use bytes::Bytes;
    use image::{Rgb, RgbImage};
    use tokio::net::tcp::OwnedReadHalf;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.transport.negotiation_timeout = Duration::from_millis(300);
        config.transport.connect_timeout = Duration::from_millis(200);
        config.transport.max_reconnect_attempts = 2;
        config.transport.reconnect_backoff_initial = Duration::from_millis(10);
        config.render.target_fps = 1000;
        config
    }

    fn receiver(config: Config) -> (ReceiverCoordinator, PresentedLog) {
        let surface = HeadlessSurface::new();
        let log = surface.log();
        let coordinator = ReceiverCoordinator::new(config, StreamPreferences::default())
            .without_audio()
            .with_surface(Box::new(surface));
        (coordinator, log)
    }

    /// Plays the sender's side of the wire protocol
    struct FakeSender {
        reader: PacketReader<OwnedReadHalf>,
        writer: PacketWriter<OwnedWriteHalf>,
        clock: MediaClock,
        jpeg: Bytes,
    }

    impl FakeSender {
        async fn connect(port: u16) -> Self {
            let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            let (read_half, write_half) = stream.into_split();
            Self {
                reader: PacketReader::new(read_half, 1 << 20, 4),
                writer: PacketWriter::new(write_half, Duration::from_secs(1)),
                clock: MediaClock::new(),
                jpeg: encoder::encode(&RgbImage::from_pixel(32, 18, Rgb([10, 20, 30])), 70).unwrap(),
            }
        }

        async fn control(&mut self, msg: ControlMessage) {
            let seq = self.clock.next_control_sequence();
            self.writer
                .send(MediaKind::Control, seq, self.clock.now(), &msg.encode())
                .await
                .unwrap();
        }

        async fn negotiate(&mut self) {
            self.control(ControlMessage::SetResolution {
                width: 32,
                height: 18,
            })
            .await;
            self.control(ControlMessage::SetQuality { level: 70 }).await;
        }

        async fn frame(&mut self, seq: u64, corrupt: bool) {
            let frame = Frame {
                sequence: seq,
                timestamp: self.clock.now(),
                width: 32,
                height: 18,
                quality: 70,
                payload: self.jpeg.clone(),
            };
            let mut payload = encode_video_payload(&frame).to_vec();
            if corrupt {
                let last = payload.len() - 1;
                payload[last] ^= 0x5a;
            }
            self.writer
                .send(MediaKind::Video, seq, frame.timestamp, &payload)
                .await
                .unwrap();
        }

        async fn audio(&mut self, seq: u64) {
            let chunk = AudioChunk::from_samples(seq, self.clock.now(), 8000, 1, &[300; 800]);
            self.writer
                .send(MediaKind::Audio, seq, chunk.timestamp, &encode_audio_payload(&chunk))
                .await
                .unwrap();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_renders_through_corruption_and_stays_streaming() {
        let listener = Listener::bind(0).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (coordinator, log) = receiver(test_config());
        let state_rx = coordinator.subscribe_state();
        let (_commands, commands_rx) = mpsc::channel(8);
        let handle = tokio::spawn(coordinator.run(listener, commands_rx));

        let mut sender = FakeSender::connect(port).await;
        sender.negotiate().await;
        // 2% of the payloads fail their checksum
        let corrupt = [40u64, 80];
        let mut ticker = tokio::time::interval(Duration::from_micros(33_333));
        for seq in 0..100 {
            ticker.tick().await;
            sender.frame(seq, corrupt.contains(&seq)).await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(state_rx.borrow().is_streaming(), "state {}", *state_rx.borrow());

        sender.control(ControlMessage::Stop).await;
        let cause = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(cause, CloseCause::PeerStopped);

        let rendered = log.sequences();
        assert!(rendered.len() >= 98, "rendered {}", rendered.len());
        assert!(corrupt.iter().all(|seq| !rendered.contains(seq)));
        assert!(rendered.windows(2).all(|w| w[0] < w[1]));
        assert!(log.frames().iter().all(|f| (f.width, f.height) == (32, 18)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_silent_sender_fails_negotiation() {
        let listener = Listener::bind(0).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (coordinator, log) = receiver(test_config());
        let (_commands, commands_rx) = mpsc::channel(8);
        let handle = tokio::spawn(coordinator.run(listener, commands_rx));

        let _sender = FakeSender::connect(port).await;
        let cause = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(cause.kind(), "NegotiationFailed");
        assert!(log.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_local_stop_is_sent_to_the_sender() {
        let listener = Listener::bind(0).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (coordinator, _log) = receiver(test_config());
        let mut state_rx = coordinator.subscribe_state();
        let (commands, commands_rx) = mpsc::channel(8);
        let handle = tokio::spawn(coordinator.run(listener, commands_rx));

        let mut sender = FakeSender::connect(port).await;
        sender.negotiate().await;
        for seq in 0..3 {
            sender.frame(seq, false).await;
        }
        state_rx.wait_for(|s| s.is_streaming()).await.unwrap();

        commands.send(ReceiverCommand::ToggleFullscreen).await.unwrap();
        commands.send(ReceiverCommand::Stop).await.unwrap();
        let packet = sender.reader.next_packet().await.unwrap().unwrap();
        assert_eq!(packet.header.kind, MediaKind::Control);
        assert_eq!(
            ControlMessage::decode(packet.header.sequence, &packet.payload).unwrap(),
            ControlMessage::Stop
        );
        assert_eq!(handle.await.unwrap().unwrap(), CloseCause::Stopped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_waits_for_the_sender_to_reconnect() {
        let listener = Listener::bind(0).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (coordinator, log) = receiver(test_config());
        let (_commands, commands_rx) = mpsc::channel(8);
        let handle = tokio::spawn(coordinator.run(listener, commands_rx));

        let mut sender = FakeSender::connect(port).await;
        sender.negotiate().await;
        for seq in 0..5 {
            sender.frame(seq, false).await;
        }
        drop(sender);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut sender = FakeSender::connect(port).await;
        sender.negotiate().await;
        let mut ticker = tokio::time::interval(Duration::from_millis(20));
        for seq in 0..10 {
            ticker.tick().await;
            sender.frame(seq, false).await;
        }
        tokio::time::sleep(Duration::from_millis(150)).await;
        sender.control(ControlMessage::Stop).await;

        let cause = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(cause, CloseCause::PeerStopped);
        assert!(log.len() >= 5, "rendered {}", log.len());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_sender_never_returns() {
        let listener = Listener::bind(0).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (coordinator, _log) = receiver(test_config());
        let (_commands, commands_rx) = mpsc::channel(8);
        let handle = tokio::spawn(coordinator.run(listener, commands_rx));

        let mut sender = FakeSender::connect(port).await;
        sender.negotiate().await;
        sender.frame(0, false).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(sender);

        let cause = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(cause.kind(), "TransportError");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_plays_audio_alongside_video() {
        let listener = Listener::bind(0).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let host = VirtualHost::with_default_devices();
        let speakers = host.default_output().unwrap();
        let surface = HeadlessSurface::new();
        let log = surface.log();
        let coordinator = ReceiverCoordinator::new(test_config(), StreamPreferences::default())
            .with_audio_host(Arc::new(host.clone()))
            .with_surface(Box::new(surface));
        let prefs_rx = coordinator.subscribe_preferences();
        let (_commands, commands_rx) = mpsc::channel(8);
        let handle = tokio::spawn(coordinator.run(listener, commands_rx));

        let mut sender = FakeSender::connect(port).await;
        sender.negotiate().await;
        sender
            .control(ControlMessage::AudioFormat {
                sample_rate: 8000,
                channels: 1,
                bits: 16,
            })
            .await;
        // 100ms of audio every third 33ms video frame
        let mut ticker = tokio::time::interval(Duration::from_micros(33_333));
        for seq in 0..60 {
            ticker.tick().await;
            if seq % 3 == 0 {
                sender.audio(seq / 3).await;
            }
            sender.frame(seq, false).await;
        }
        sender.control(ControlMessage::Stop).await;

        let cause = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(cause, CloseCause::PeerStopped);
        assert!(host.playback_log(&speakers.id).frames > 0);
        assert!(!log.is_empty());
        assert_eq!(prefs_rx.borrow().audio_device_id.as_deref(), Some(speakers.id.as_str()));
        assert_eq!(prefs_rx.borrow().peer_address.as_deref(), Some("127.0.0.1"));
    }

    #[test]
    fn test_reconnect_window_covers_sender_retries() {
        let mut transport = TransportConfig::default();
        transport.max_reconnect_attempts = 3;
        transport.connect_timeout = Duration::from_millis(100);
        transport.reconnect_backoff_initial = Duration::from_millis(10);
        // 10 + 20 + 40 of backoff, three connect timeouts
        assert_eq!(reconnect_window(&transport), Duration::from_millis(370));
    }

    #[test]
    fn test_key_commands_map_to_receiver_commands() {
        assert_eq!(
            ReceiverCommand::from(KeyCommand::parse("q").unwrap()),
            ReceiverCommand::Stop
        );
        assert_eq!(
            ReceiverCommand::from(KeyCommand::parse("+").unwrap()),
            ReceiverCommand::VolumeUp
        );
    }
}

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use log::{info, warn};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use std::{panic, process};
use tokio::runtime::Runtime;
use tokio::sync::mpsc;

use lancast::audio::{self, AudioHost};
use lancast::capture;
use lancast::config::{Config, app_name, app_version};
use lancast::display::{FrameSlot, KeyCommand, SnapshotSurface, ViewerWindow, WindowSurface};
use lancast::net::Listener;
use lancast::pipeline::CloseCause;
use lancast::pipeline::receiver::{ReceiverCommand, ReceiverCoordinator};
use lancast::pipeline::sender::{SenderCommand, SenderCoordinator};
use lancast::pipeline::types::{QualityPreset, Resolution};
use lancast::preferences::{PreferencesStore, StreamPreferences};

fn cli() -> Command {
    let config = Arg::new("config")
        .short('c')
        .long("config")
        .value_name("FILE")
        .help("JSON file overriding the default tunables")
        .value_parser(clap::value_parser!(PathBuf))
        .global(true);
    let audio_device = Arg::new("audio-device")
        .short('a')
        .long("audio-device")
        .value_name("DEVICE")
        .help("Audio device id or name (see `devices`)");
    let no_audio = Arg::new("no-audio")
        .long("no-audio")
        .help("Stream video only")
        .action(ArgAction::SetTrue);
    let port = Arg::new("port")
        .short('p')
        .long("port")
        .value_name("PORT")
        .value_parser(clap::value_parser!(u16));

    Command::new(app_name())
        .version(app_version())
        .author(env!("CARGO_PKG_AUTHORS"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .subcommand_required(true)
        .arg(config)
        .subcommand(
            Command::new("send")
                .about("Stream this screen to a receiver")
                .arg(
                    Arg::new("peer")
                        .value_name("ADDRESS")
                        .help("Receiver address, host or host:port; defaults to the last one used"),
                )
                .arg(
                    Arg::new("resolution")
                        .short('r')
                        .long("resolution")
                        .value_name("PRESET")
                        .help("720, 1080, 1440, 4k, auto or WxH"),
                )
                .arg(
                    Arg::new("quality")
                        .short('q')
                        .long("quality")
                        .value_name("LEVEL")
                        .help("low, balanced, high, ultra or 1-100"),
                )
                .arg(
                    Arg::new("fps")
                        .long("fps")
                        .value_name("FPS")
                        .value_parser(clap::value_parser!(u32).range(1..=240)),
                )
                .arg(port.clone())
                .arg(audio_device.clone())
                .arg(no_audio.clone()),
        )
        .subcommand(
            Command::new("receive")
                .about("Wait for a sender and show its stream")
                .arg(port)
                .arg(audio_device)
                .arg(no_audio)
                .arg(
                    Arg::new("snapshot")
                        .long("snapshot")
                        .value_name("FILE")
                        .help("Keep the latest frame in a JPEG file instead of opening a window")
                        .value_parser(clap::value_parser!(PathBuf)),
                )
                .arg(
                    Arg::new("headless")
                        .long("headless")
                        .help("Play audio and track frames without a window")
                        .conflicts_with("snapshot")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(Command::new("devices").about("List audio devices and capture backends"))
}

fn load_config(matches: &ArgMatches) -> Result<Config> {
    match matches.get_one::<PathBuf>("config") {
        Some(path) => Config::load(path),
        None => Ok(Config::default()),
    }
}

/// Read console lines on a plain thread; the runtime never blocks on stdin
fn spawn_console<T, F>(commands: mpsc::Sender<T>, parse: F)
where
    T: Send + 'static,
    F: Fn(&str) -> Option<T> + Send + 'static,
{
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            match parse(&line) {
                Some(cmd) => {
                    if commands.blocking_send(cmd).is_err() {
                        break;
                    }
                }
                None if line.trim().is_empty() => {}
                None => warn!("Unknown command: {}", line.trim()),
            }
        }
    });
}

/// First Ctrl-C stops the session, a second one exits
fn install_ctrlc<T: Send + 'static>(commands: mpsc::Sender<T>, stop: T) -> Result<()>
where
    T: Clone,
{
    let stopping = AtomicBool::new(false);
    ctrlc::set_handler(move || {
        if stopping.swap(true, Ordering::AcqRel) || commands.try_send(stop.clone()).is_err() {
            process::exit(130);
        }
    })
    .context("Error setting Ctrl-C handler")
}

fn save_preferences(store: &mut PreferencesStore, prefs: StreamPreferences, connected: bool) {
    let peer = prefs.peer_address.clone();
    store.update(prefs);
    if let (true, Some(peer)) = (connected, peer) {
        store.record_connection(&peer);
    }
    if let Err(e) = store.save() {
        warn!("Could not save preferences: {:#}", e);
    }
}

fn report(cause: &CloseCause) {
    match cause {
        CloseCause::Failed { .. } => eprintln!("Session ended: {}", cause),
        _ => info!("Session ended: {}", cause),
    }
}

async fn send(mut config: Config, matches: &ArgMatches) -> Result<CloseCause> {
    let mut store = PreferencesStore::open(PreferencesStore::default_path());
    let mut prefs = store.preferences().clone();

    if let Some(peer) = matches.get_one::<String>("peer") {
        prefs.peer_address = Some(peer.clone());
    }
    if let Some(value) = matches.get_one::<String>("resolution") {
        prefs.resolution = Resolution::parse(value)
            .with_context(|| format!("Unknown resolution '{}'", value))?;
    }
    if let Some(value) = matches.get_one::<String>("quality") {
        match QualityPreset::parse(value) {
            Some(preset) => {
                prefs.quality = preset.jpeg_quality();
                config.capture.target_fps = preset.fps();
            }
            None => {
                prefs.quality = value
                    .parse::<u8>()
                    .ok()
                    .filter(|q| (1..=100).contains(q))
                    .with_context(|| format!("Quality must be a preset or 1-100, got '{}'", value))?;
            }
        }
    }
    if let Some(fps) = matches.get_one::<u32>("fps") {
        config.capture.target_fps = *fps;
    }
    if let Some(port) = matches.get_one::<u16>("port") {
        config.transport.port = *port;
    }
    if let Some(device) = matches.get_one::<String>("audio-device") {
        prefs.audio_device_id = Some(device.clone());
    }
    config.validate()?;

    let mut coordinator = SenderCoordinator::new(config, prefs);
    if matches.get_flag("no-audio") {
        coordinator = coordinator.without_audio();
    }
    let prefs_rx = coordinator.subscribe_preferences();

    let (commands, commands_rx) = mpsc::channel(16);
    install_ctrlc(commands.clone(), SenderCommand::Stop)?;
    spawn_console(commands, SenderCommand::parse);
    println!("Commands: q stop, p pause, r resume, quality <preset|n>, res <preset>, fps <n>");

    let cause = coordinator.run(commands_rx).await?;
    let connected = !matches!(cause, CloseCause::Failed { kind: "NegotiationFailed", .. });
    save_preferences(&mut store, prefs_rx.borrow().clone(), connected);
    Ok(cause)
}

/// The window is gone; the session must hear Stop even behind a full queue
fn stop_session(runtime: &Runtime, commands: &mpsc::Sender<ReceiverCommand>) {
    // Fails only if the session has already ended
    let _ = runtime.block_on(commands.send(ReceiverCommand::Stop));
}

fn receive(runtime: &Runtime, mut config: Config, matches: &ArgMatches) -> Result<CloseCause> {
    let mut store = PreferencesStore::open(PreferencesStore::default_path());
    let mut prefs = store.preferences().clone();
    if let Some(device) = matches.get_one::<String>("audio-device") {
        prefs.audio_device_id = Some(device.clone());
    }
    if let Some(port) = matches.get_one::<u16>("port") {
        config.transport.port = *port;
    }
    config.validate()?;

    let listener = runtime.block_on(Listener::bind(config.transport.port))?;
    if let Some(addr) = listener.shareable_address() {
        println!("Share this address with the sender: {}", addr);
    }

    let mut coordinator = ReceiverCoordinator::new(config, prefs);
    if matches.get_flag("no-audio") {
        coordinator = coordinator.without_audio();
    }
    let mut window = None;
    if let Some(path) = matches.get_one::<PathBuf>("snapshot") {
        coordinator = coordinator.with_surface(Box::new(SnapshotSurface::new(
            path,
            Duration::from_millis(500),
        )));
    } else if !matches.get_flag("headless") {
        let slot = FrameSlot::new();
        coordinator = coordinator.with_surface(Box::new(WindowSurface::new(slot.clone())));
        window = Some(slot);
    }
    let prefs_rx = coordinator.subscribe_preferences();

    let (commands, commands_rx) = mpsc::channel(16);
    install_ctrlc(commands.clone(), ReceiverCommand::Stop)?;
    spawn_console(commands.clone(), |line| KeyCommand::parse(line).map(ReceiverCommand::from));
    println!("Keys: q stop, f fullscreen, p pause, +/- volume, a audio status");

    // A finished session closes the window
    let closing = window.clone();
    let session = runtime.spawn(async move {
        let cause = coordinator.run(listener, commands_rx).await;
        if let Some(slot) = closing {
            slot.close();
        }
        cause
    });

    if let Some(slot) = window {
        let (keys, mut keys_rx) = mpsc::channel(16);
        let forward = commands.clone();
        runtime.spawn(async move {
            while let Some(key) = keys_rx.recv().await {
                if forward.send(ReceiverCommand::from(key)).await.is_err() {
                    break;
                }
            }
        });
        // Blocks the main thread until the window goes away
        match ViewerWindow::run(slot, keys) {
            Ok(()) => stop_session(runtime, &commands),
            Err(e) => warn!("No viewer window ({}), continuing without one", e),
        }
    }

    let cause = runtime
        .block_on(session)
        .context("Receiver session panicked")??;
    let connected = prefs_rx.borrow().peer_address.is_some();
    save_preferences(&mut store, prefs_rx.borrow().clone(), connected);
    Ok(cause)
}

fn devices(config: &Config) -> Result<()> {
    let host: Arc<dyn AudioHost> = audio::default_host();
    println!("Audio host: {}", host.name());

    println!("Inputs (automatic selection order):");
    for device in audio::rank_input_devices(host.input_devices()?) {
        println!("  {}  [{}]{}", device.name, device.id, if device.is_default { " (default)" } else { "" });
    }
    println!("Outputs:");
    for device in host.output_devices()? {
        println!("  {}  [{}]{}", device.name, device.id, if device.is_default { " (default)" } else { "" });
    }
    println!("Capture backends (fallback order):");
    for backend in capture::describe_backends(&config.capture) {
        println!("  {}", backend);
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    // kill the process as soon as any thread panics
    let orig_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        orig_hook(panic_info);
        process::exit(105);
    }));

    let matches = cli().get_matches();
    // Built by hand: the viewer window needs the main thread to itself
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start the async runtime")?;
    let cause = match matches.subcommand() {
        Some(("send", sub)) => runtime.block_on(send(load_config(sub)?, sub))?,
        Some(("receive", sub)) => receive(&runtime, load_config(sub)?, sub)?,
        Some(("devices", sub)) => return devices(&load_config(sub)?),
        _ => unreachable!("a subcommand is required"),
    };

    report(&cause);
    if let CloseCause::Failed { .. } = cause {
        process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_after_window_close_waits_for_queue_space() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let (commands, mut commands_rx) = mpsc::channel(1);
        commands.try_send(ReceiverCommand::VolumeUp).unwrap();

        // A busy session that only reads its queue later
        let session = runtime.spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let mut seen = Vec::new();
            while let Some(cmd) = commands_rx.recv().await {
                seen.push(cmd);
                if cmd == ReceiverCommand::Stop {
                    break;
                }
            }
            seen
        });
        stop_session(&runtime, &commands);
        let seen = runtime.block_on(session).unwrap();
        assert_eq!(seen, vec![ReceiverCommand::VolumeUp, ReceiverCommand::Stop]);
    }

    #[test]
    fn test_stop_after_session_ended_returns() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let (commands, commands_rx) = mpsc::channel(1);
        drop(commands_rx);
        stop_session(&runtime, &commands);
    }
}

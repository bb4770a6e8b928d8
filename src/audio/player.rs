//! Receiver-side audio output
//!
//! [`AudioPlayer`] owns the output stream. It never plays a chunk older than
//! one already played, primes a few chunks before (re)starting the device and
//! publishes the position being heard through a [`PlaybackClock`], which the
//! synchronizer uses as its reference.

use log::{info, warn};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::convert;
use super::{AudioDevice, AudioFormat, AudioHost, OutputStream};
use crate::config::AudioConfig;
use crate::error::StreamError;
use crate::pipeline::clock::MediaClock;
use crate::pipeline::types::{AudioChunk, Timestamp};

#[derive(Debug, Clone, Copy)]
struct ClockSample {
    /// Sender timestamp of the sample being heard at `stamped_us`
    position_us: i64,
    /// Local time of the observation
    stamped_us: i64,
    /// Sender timestamp just past the last queued sample
    end_us: i64,
}

/// Audio reference clock, shared between the player and the synchronizer
#[derive(Clone, Default)]
pub struct PlaybackClock {
    sample: Arc<Mutex<Option<ClockSample>>>,
    /// Chunks accepted for playback since the last reset
    units: Arc<AtomicU64>,
}

impl PlaybackClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `position` is audible at local time `now_us` and that
    /// audio is queued up to `end`
    pub fn update(&self, position: Timestamp, end: Timestamp, now_us: i64) {
        let mut sample = self.sample.lock().unwrap_or_else(|p| p.into_inner());
        *sample = Some(ClockSample {
            position_us: position.micros,
            stamped_us: now_us,
            end_us: end.micros,
        });
    }

    /// Playback stopped (priming, paused or no device)
    pub fn stop(&self) {
        *self.sample.lock().unwrap_or_else(|p| p.into_inner()) = None;
    }

    pub fn record_unit(&self) {
        self.units.fetch_add(1, Ordering::AcqRel);
    }

    /// Audio units handed to the player so far
    pub fn units(&self) -> u64 {
        self.units.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.sample
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .is_some()
    }

    /// Sender timestamp audible at local time `now_us`; extrapolated from the
    /// last observation but never past the queued audio
    pub fn position(&self, now_us: i64) -> Option<Timestamp> {
        let sample = (*self.sample.lock().unwrap_or_else(|p| p.into_inner()))?;
        let advanced = sample.position_us + (now_us - sample.stamped_us).max(0);
        Some(Timestamp::from_micros(advanced.min(sample.end_us)))
    }
}

/// What happened to a written chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteStatus {
    /// Held until enough audio is buffered to start
    Priming,
    Playing,
    /// Older than audio already played; dropped
    Late,
    /// Playback is paused; dropped to stay live
    Paused,
    /// The device vanished and the default took over. The chunk is kept for
    /// the next priming cycle.
    Substituted { lost: String, device: String },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PlayerStats {
    pub chunks_played: u64,
    pub frames_played: u64,
    pub late: u64,
    pub dropped_paused: u64,
    pub devices_lost: u64,
}

/// Snapshot for the status key
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlayerStatus {
    pub device: Option<String>,
    pub format: Option<AudioFormat>,
    pub volume: f32,
    pub paused: bool,
    pub playing: bool,
    pub queued_ms: u64,
}

impl std::fmt::Display for PlayerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.device, self.format) {
            (Some(device), Some(format)) => write!(f, "{} ({})", device, format)?,
            _ => write!(f, "no output device")?,
        }
        let state = if self.paused {
            "paused"
        } else if self.playing {
            "playing"
        } else {
            "priming"
        };
        write!(
            f,
            ", {}, volume {:.0}%, {} ms queued",
            state,
            self.volume * 100.0,
            self.queued_ms
        )
    }
}

pub struct AudioPlayer {
    host: Arc<dyn AudioHost>,
    config: AudioConfig,
    clock: MediaClock,
    /// Chunks buffered before the device starts
    prime_units: usize,
    device: Option<AudioDevice>,
    stream: Option<Box<dyn OutputStream>>,
    /// Format the sender is producing
    source: Option<AudioFormat>,
    volume: f32,
    paused: bool,
    playing: bool,
    priming: VecDeque<AudioChunk>,
    last_timestamp: Option<Timestamp>,
    /// Sender timestamp just past the last sample handed to the device
    queued_end: Option<Timestamp>,
    playback: PlaybackClock,
    stats: PlayerStats,
}

impl AudioPlayer {
    pub fn new(
        host: Arc<dyn AudioHost>,
        config: &AudioConfig,
        prime_units: usize,
        clock: MediaClock,
    ) -> Self {
        Self {
            host,
            config: config.clone(),
            clock,
            prime_units: prime_units.max(1),
            device: None,
            stream: None,
            source: None,
            volume: 1.0,
            paused: false,
            playing: false,
            priming: VecDeque::new(),
            last_timestamp: None,
            queued_end: None,
            playback: PlaybackClock::new(),
            stats: PlayerStats::default(),
        }
    }

    pub fn list_devices(&self) -> Result<Vec<AudioDevice>, StreamError> {
        self.host.output_devices()
    }

    /// The explicitly chosen output, or the system default
    pub fn select(&self, wanted: Option<&str>) -> Result<AudioDevice, StreamError> {
        match wanted {
            Some(w) => {
                let devices = self.list_devices()?;
                super::find_device(&devices, w)
                    .cloned()
                    .ok_or_else(|| StreamError::DeviceUnavailable {
                        device: w.to_string(),
                        reason: "no such output device".into(),
                    })
            }
            None => self
                .host
                .default_output()
                .or_else(|| self.list_devices().ok()?.into_iter().next())
                .ok_or_else(|| StreamError::DeviceUnavailable {
                    device: "default".into(),
                    reason: "no output devices".into(),
                }),
        }
    }

    fn wanted_format(&self) -> AudioFormat {
        self.source
            .unwrap_or_else(|| AudioFormat::new(self.config.sample_rate, self.config.channels))
    }

    /// Open `device`, trying the fallback format list. Playback re-primes.
    pub fn open(&mut self, device: &AudioDevice) -> Result<AudioFormat, StreamError> {
        let mut last_err = None;
        for format in super::output_format_candidates(self.wanted_format()) {
            match self.host.open_output(device, format) {
                Ok(mut stream) => {
                    stream.set_paused(true);
                    let opened = stream.format();
                    info!("AudioPlayer: opened {} ({})", device.name, opened);
                    self.stream = Some(stream);
                    self.device = Some(device.clone());
                    self.restart_priming();
                    return Ok(opened);
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| StreamError::DeviceUnavailable {
            device: device.name.clone(),
            reason: "no usable format".into(),
        }))
    }

    /// The sender announced (or switched to) `format`
    pub fn set_source_format(&mut self, format: AudioFormat) -> Result<(), StreamError> {
        if self.source == Some(format) {
            return Ok(());
        }
        self.source = Some(format);
        let current = self.stream.as_ref().map(|s| s.format());
        if let (Some(device), Some(current)) = (self.device.clone(), current) {
            if current != format {
                // Prefer a device format that needs no conversion
                if let Err(e) = self.open(&device) {
                    warn!("AudioPlayer: cannot reopen for {}: {}", format, e);
                }
            }
        }
        Ok(())
    }

    fn restart_priming(&mut self) {
        self.playing = false;
        self.playback.stop();
        if let Some(stream) = self.stream.as_mut() {
            stream.set_paused(true);
        }
    }

    pub fn write(&mut self, chunk: AudioChunk) -> Result<WriteStatus, StreamError> {
        if self.paused {
            self.stats.dropped_paused += 1;
            return Ok(WriteStatus::Paused);
        }
        if self.last_timestamp.is_some_and(|last| chunk.timestamp <= last) {
            self.stats.late += 1;
            return Ok(WriteStatus::Late);
        }
        self.last_timestamp = Some(chunk.timestamp);
        self.playback.record_unit();
        self.set_source_format(AudioFormat::new(chunk.sample_rate, chunk.channels))?;

        if self.playing {
            return match self.play(&chunk) {
                Ok(()) => Ok(WriteStatus::Playing),
                Err(StreamError::DeviceLost { device }) => {
                    self.substitute(device, VecDeque::from([chunk]), false)
                }
                Err(e) => Err(e),
            };
        }

        self.priming.push_back(chunk);
        if self.priming.len() < self.prime_units {
            return Ok(WriteStatus::Priming);
        }
        self.flush_priming()
    }

    /// Hand every primed chunk to the device and start it
    fn flush_priming(&mut self) -> Result<WriteStatus, StreamError> {
        while let Some(next) = self.priming.pop_front() {
            if let Err(e) = self.play(&next) {
                return match e {
                    StreamError::DeviceLost { device } => {
                        // Primed chunks not yet written move to the replacement
                        self.priming.push_front(next);
                        let pending = std::mem::take(&mut self.priming);
                        self.substitute(device, pending, true)
                    }
                    other => Err(other),
                };
            }
        }
        if let Some(stream) = self.stream.as_mut() {
            stream.set_paused(false);
        }
        self.playing = true;
        self.update_clock();
        Ok(WriteStatus::Playing)
    }

    fn play(&mut self, chunk: &AudioChunk) -> Result<(), StreamError> {
        let stream = self.stream.as_mut().ok_or_else(|| StreamError::DeviceUnavailable {
            device: "none".into(),
            reason: "no output device open".into(),
        })?;
        let output = stream.format();
        let from = AudioFormat::new(chunk.sample_rate, chunk.channels);
        let mut samples = convert::convert(&chunk.samples(), from, output);
        convert::apply_volume(&mut samples, self.volume);
        stream.write(&samples)?;

        self.stats.chunks_played += 1;
        self.stats.frames_played += (samples.len() / output.channels.max(1) as usize) as u64;
        self.queued_end = Some(chunk.end());
        self.update_clock();
        Ok(())
    }

    fn update_clock(&self) {
        if !self.playing {
            return;
        }
        let (Some(stream), Some(end)) = (self.stream.as_ref(), self.queued_end) else {
            return;
        };
        let queued = stream
            .format()
            .frames_to_duration(stream.queued_frames() as u64);
        self.playback.update(end.sub(queued), end, self.clock.now_us());
    }

    /// Fall back to the default device after `lost` vanished. `pending` is
    /// audio not yet written; with `flush` it goes out to the replacement at
    /// once, otherwise it starts the next priming cycle.
    fn substitute(
        &mut self,
        lost: String,
        pending: VecDeque<AudioChunk>,
        flush: bool,
    ) -> Result<WriteStatus, StreamError> {
        self.stats.devices_lost += 1;
        self.stream = None;
        self.restart_priming();

        let lost_id = self.device.take().map(|d| d.id);
        let fallback = self
            .host
            .default_output()
            .filter(|d| Some(&d.id) != lost_id.as_ref())
            .ok_or(StreamError::DeviceLost {
                device: lost.clone(),
            })?;
        warn!(
            "AudioPlayer: {} lost, falling back to {}",
            lost, fallback.name
        );
        self.open(&fallback)?;
        self.priming = pending;
        if flush {
            if let WriteStatus::Substituted { device, .. } = self.flush_priming()? {
                // The replacement vanished too
                return Ok(WriteStatus::Substituted { lost, device });
            }
        }
        Ok(WriteStatus::Substituted {
            lost,
            device: fallback.name,
        })
    }

    /// 0.0-1.0, clamped
    pub fn set_volume(&mut self, volume: f32) {
        self.volume = if volume.is_nan() { 0.0 } else { volume.clamp(0.0, 1.0) };
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    pub fn pause(&mut self) {
        if self.paused {
            return;
        }
        self.paused = true;
        self.priming.clear();
        self.restart_priming();
    }

    /// Resume; playback restarts after the next priming cycle
    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn clock(&self) -> PlaybackClock {
        self.playback.clone()
    }

    pub fn device(&self) -> Option<&AudioDevice> {
        self.device.as_ref()
    }

    /// Forget the last played timestamp, for a new sender
    pub fn reset(&mut self) {
        self.playback.units.store(0, Ordering::Release);
        self.last_timestamp = None;
        self.queued_end = None;
        self.priming.clear();
        self.restart_priming();
    }

    pub fn stats(&self) -> PlayerStats {
        self.stats
    }

    pub fn status(&self) -> PlayerStatus {
        let stream = self.stream.as_ref();
        PlayerStatus {
            device: self.device.as_ref().map(|d| d.name.clone()),
            format: stream.map(|s| s.format()),
            volume: self.volume,
            paused: self.paused,
            playing: self.playing,
            queued_ms: stream.map_or(0, |s| {
                s.format().frames_to_duration(s.queued_frames() as u64).as_millis() as u64
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::VirtualHost;
    use crate::pipeline::types::Timestamp;

    const RATE: u32 = 8000;

    fn chunk(seq: u64, ts_ms: i64) -> AudioChunk {
        AudioChunk::from_samples(
            seq,
            Timestamp::from_micros(ts_ms * 1000),
            RATE,
            1,
            &vec![1000i16; 80],
        )
    }

    fn player(host: &VirtualHost, prime: usize) -> AudioPlayer {
        let config = AudioConfig {
            sample_rate: RATE,
            channels: 1,
            ..AudioConfig::default()
        };
        AudioPlayer::new(Arc::new(host.clone()), &config, prime, MediaClock::new())
    }

    #[test]
    fn test_primes_then_plays() {
        let host = VirtualHost::with_default_devices();
        let mut p = player(&host, 3);
        let device = p.select(None).unwrap();
        p.open(&device).unwrap();

        assert_eq!(p.write(chunk(0, 0)).unwrap(), WriteStatus::Priming);
        assert_eq!(p.write(chunk(1, 10)).unwrap(), WriteStatus::Priming);
        assert!(!p.clock().is_running());
        assert_eq!(p.write(chunk(2, 20)).unwrap(), WriteStatus::Playing);
        assert!(p.clock().is_running());
        assert_eq!(host.playback_log(&device.id).frames, 240);
    }

    #[test]
    fn test_never_reorders() {
        let host = VirtualHost::with_default_devices();
        let mut p = player(&host, 1);
        let device = p.select(None).unwrap();
        p.open(&device).unwrap();

        let mut accepted = Vec::new();
        for (seq, ts) in [0i64, 10, 20, 40, 30, 50, 50, 45, 60].into_iter().enumerate() {
            if p.write(chunk(seq as u64, ts)).unwrap() == WriteStatus::Playing {
                accepted.push(ts);
            }
        }
        assert_eq!(accepted, vec![0, 10, 20, 40, 50, 60]);
        assert_eq!(p.stats().late, 3);
        assert_eq!(host.playback_log(&device.id).writes, 6);
    }

    #[test]
    fn test_volume_is_clamped() {
        let host = VirtualHost::with_default_devices();
        let mut p = player(&host, 1);
        p.set_volume(1.7);
        assert_eq!(p.volume(), 1.0);
        p.set_volume(-0.2);
        assert_eq!(p.volume(), 0.0);
        p.set_volume(f32::NAN);
        assert_eq!(p.volume(), 0.0);
    }

    #[test]
    fn test_pause_drops_and_resume_reprimes() {
        let host = VirtualHost::with_default_devices();
        let mut p = player(&host, 2);
        let device = p.select(None).unwrap();
        p.open(&device).unwrap();
        p.write(chunk(0, 0)).unwrap();
        assert_eq!(p.write(chunk(1, 10)).unwrap(), WriteStatus::Playing);

        p.pause();
        assert!(!p.clock().is_running());
        assert_eq!(p.write(chunk(2, 20)).unwrap(), WriteStatus::Paused);
        p.resume();
        assert_eq!(p.write(chunk(3, 30)).unwrap(), WriteStatus::Priming);
        assert_eq!(p.write(chunk(4, 40)).unwrap(), WriteStatus::Playing);
        assert_eq!(p.stats().dropped_paused, 1);
        // Paused chunks never reached the player
        assert_eq!(p.clock().units(), 4);
        p.reset();
        assert_eq!(p.clock().units(), 0);
    }

    #[test]
    fn test_device_loss_falls_back_once_and_resumes_within_one_priming_cycle() {
        let host = VirtualHost::with_default_devices();
        let prime = 3;
        let mut p = player(&host, prime);
        let headphones = p.select(Some("Virtual Headphones")).unwrap();
        p.open(&headphones).unwrap();
        for i in 0..prime as i64 {
            p.write(chunk(i as u64, i * 10)).unwrap();
        }
        assert!(p.is_playing());

        assert!(host.remove_device(&headphones.id));
        let mut substitutions = 0;
        let mut writes_until_playing = None;
        for i in prime as i64..prime as i64 + 10 {
            match p.write(chunk(i as u64, i * 10)).unwrap() {
                WriteStatus::Substituted { lost, device } => {
                    substitutions += 1;
                    assert_eq!(lost, "Virtual Headphones");
                    assert_eq!(device, "Virtual Speakers");
                }
                WriteStatus::Playing if writes_until_playing.is_none() => {
                    writes_until_playing = Some(i - prime as i64 + 1);
                }
                _ => {}
            }
        }
        assert_eq!(substitutions, 1);
        assert_eq!(p.stats().devices_lost, 1);
        // The substituting write counts toward the new priming cycle
        assert_eq!(writes_until_playing, Some(prime as i64));
        assert_eq!(p.device().map(|d| d.name.as_str()), Some("Virtual Speakers"));
        let speakers = host.default_output().unwrap();
        assert!(host.playback_log(&speakers.id).frames > 0);
    }

    #[test]
    fn test_device_lost_mid_flush_moves_primed_audio_to_replacement() {
        let host = VirtualHost::with_default_devices();
        let prime = 4;
        let mut p = player(&host, prime);
        let headphones = p.select(Some("Virtual Headphones")).unwrap();
        p.open(&headphones).unwrap();
        // Two primed chunks reach the headphones, then they are unplugged
        host.unplug_after_writes(&headphones.id, 2);

        for i in 0..prime as i64 - 1 {
            assert_eq!(p.write(chunk(i as u64, i * 10)).unwrap(), WriteStatus::Priming);
        }
        match p.write(chunk(3, 30)).unwrap() {
            WriteStatus::Substituted { lost, device } => {
                assert_eq!(lost, "Virtual Headphones");
                assert_eq!(device, "Virtual Speakers");
            }
            other => panic!("expected substitution, got {:?}", other),
        }

        let speakers = host.default_output().unwrap();
        assert_eq!(host.playback_log(&headphones.id).writes, 2);
        assert_eq!(host.playback_log(&speakers.id).writes, 2);
        assert_eq!(p.stats().chunks_played, 4);
        assert!(p.is_playing());
        assert_eq!(p.stats().devices_lost, 1);
    }

    #[test]
    fn test_converts_to_opened_format() {
        let host = VirtualHost::new();
        let device = host.add_output("Stereo Only", true, vec![AudioFormat::new(48000, 2)]);
        let mut p = player(&host, 1);
        assert_eq!(p.open(&device).unwrap(), AudioFormat::new(48000, 2));
        p.write(chunk(0, 0)).unwrap();
        // 80 mono frames at 8 kHz become 480 stereo frames at 48 kHz
        assert_eq!(host.playback_log(&device.id).frames, 480);
    }

    #[test]
    fn test_clock_never_runs_past_queued_audio() {
        let clock = PlaybackClock::new();
        assert_eq!(clock.position(0), None);
        clock.update(Timestamp::from_micros(1_000), Timestamp::from_micros(5_000), 100);
        assert_eq!(clock.position(100), Some(Timestamp::from_micros(1_000)));
        assert_eq!(clock.position(2_100), Some(Timestamp::from_micros(3_000)));
        assert_eq!(clock.position(90_000), Some(Timestamp::from_micros(5_000)));
        clock.stop();
        assert!(!clock.is_running());
    }
}

//! A/V synchronization for the receiver pipeline
//!
//! Audio is the reference clock. [`Synchronizer`] holds decoded frames and
//! releases each one once its timestamp is at or behind the audio position
//! minus a constant target offset, so video trails audio by a small fixed
//! skew. Video is what adapts: it repeats the last frame while it waits and
//! skips ahead when it falls behind. Audio never waits for video.
//!
//! ```text
//!            enough queued            skew out of band too long
//! Priming ──────────────────→ Locked ───────────────────────────→ Resyncing
//!                               ↑                                     │
//!                               └─────────── re-primed ───────────────┘
//! ```
//!
//! Without an audio clock (no audio, or not started after the priming
//! timeout) the reference free-runs from the frame it locked on.

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

use crate::audio::player::PlaybackClock;
use crate::config::SyncConfig;
use crate::pipeline::PipelineStage;
use crate::pipeline::clock::MediaClock;
use crate::pipeline::health::PipelineHealth;
use crate::pipeline::queue::DropOldestQueue;
use crate::pipeline::types::{DecodedFrame, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Priming,
    Locked,
    Resyncing,
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncState::Priming => write!(f, "Priming"),
            SyncState::Locked => write!(f, "Locked"),
            SyncState::Resyncing => write!(f, "Resyncing"),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncStats {
    pub presented: u64,
    /// Frames passed over because a newer one was already due
    pub skipped: u64,
    /// Ticks that kept the previous frame on screen
    pub repeated: u64,
    /// Frames refused on arrival (stale, or queue overflow)
    pub dropped: u64,
    pub resyncs: u64,
}

fn micros(d: Duration) -> i64 {
    d.as_micros().min(i64::MAX as u128) as i64
}

pub struct Synchronizer {
    config: SyncConfig,
    expect_audio: bool,
    state: SyncState,
    queue: VecDeque<DecodedFrame>,
    last_presented: Option<(u64, Timestamp)>,
    /// Added to the audio reference; set when a lock had to be forced
    correction_us: i64,
    /// Last reference value and the local time it was taken at
    anchor: Option<(i64, i64)>,
    /// When the current Priming/Resyncing phase started
    waiting_since: Option<i64>,
    out_of_band_since: Option<i64>,
    skew_us: Option<i64>,
    /// Audio units the player has accepted, and the count at the last prime
    audio_units: u64,
    audio_units_base: u64,
    draining: bool,
    stats: SyncStats,
}

impl Synchronizer {
    pub fn new(config: &SyncConfig, expect_audio: bool) -> Self {
        Self {
            config: config.clone(),
            expect_audio,
            state: SyncState::Priming,
            queue: VecDeque::with_capacity(config.max_video_queue.max(1)),
            last_presented: None,
            correction_us: 0,
            anchor: None,
            waiting_since: None,
            out_of_band_since: None,
            skew_us: None,
            audio_units: 0,
            audio_units_base: 0,
            draining: false,
            stats: SyncStats::default(),
        }
    }

    pub fn set_expect_audio(&mut self, expect_audio: bool) {
        self.expect_audio = expect_audio;
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn stats(&self) -> SyncStats {
        self.stats
    }

    /// Reference minus the timestamp of the frame on screen; positive when
    /// video trails the reference
    pub fn skew_us(&self) -> Option<i64> {
        self.skew_us
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Running count of audio units handed to the player
    pub fn observe_audio_units(&mut self, units: u64) {
        if units < self.audio_units {
            // The player was reset for a new stream
            self.audio_units_base = 0;
        }
        self.audio_units = units;
    }

    /// Audio units buffered since the current priming phase began
    pub fn buffered_audio_units(&self) -> u64 {
        self.audio_units.saturating_sub(self.audio_units_base)
    }

    fn tolerance_us(&self) -> i64 {
        micros(self.config.tolerance)
    }

    /// Queue a decoded frame. Returns false if it was refused.
    pub fn push(&mut self, frame: DecodedFrame) -> bool {
        let newest = self
            .queue
            .back()
            .map(|f| f.sequence)
            .or(self.last_presented.map(|(seq, _)| seq));
        if newest.is_some_and(|seq| frame.sequence <= seq) {
            self.stats.dropped += 1;
            return false;
        }
        if self.queue.len() >= self.config.max_video_queue.max(1) {
            self.queue.pop_front();
            self.stats.dropped += 1;
        }
        self.queue.push_back(frame);
        true
    }

    /// Start over from Priming, keeping only the freshest frames
    pub fn reprime(&mut self, now_us: i64) {
        let keep = self.config.min_video_units.max(1);
        while self.queue.len() > keep {
            self.queue.pop_front();
            self.stats.dropped += 1;
        }
        self.state = SyncState::Priming;
        self.anchor = None;
        self.audio_units_base = self.audio_units;
        self.waiting_since = Some(now_us);
        self.out_of_band_since = None;
    }

    /// No more frames will arrive; release what is left at its due time
    pub fn finish(&mut self) {
        self.draining = true;
    }

    fn reference(&mut self, now_us: i64, audio: Option<Timestamp>) -> Option<i64> {
        match audio {
            Some(position) => {
                let r = position.micros - micros(self.config.target_offset) + self.correction_us;
                self.anchor = Some((r, now_us));
                Some(r)
            }
            None => self.anchor.map(|(r, at)| r + (now_us - at)),
        }
    }

    /// Advance to local time `now_us` with the audio clock at `audio`.
    /// Returns the frame to present, if one is due.
    pub fn tick(&mut self, now_us: i64, audio: Option<Timestamp>) -> Option<DecodedFrame> {
        // Audio stops with the stream; run the tail out on the last anchor
        let audio = audio.filter(|_| !self.draining);
        if self.state != SyncState::Locked && !self.try_lock(now_us, audio) {
            return None;
        }
        self.present(now_us, audio)
    }

    fn try_lock(&mut self, now_us: i64, audio: Option<Timestamp>) -> bool {
        let since = *self.waiting_since.get_or_insert(now_us);
        let timed_out = now_us - since >= micros(self.config.priming_timeout);
        if self.draining {
            if self.queue.is_empty() {
                return false;
            }
        } else {
            if self.queue.len() < self.config.min_video_units.max(1) {
                return false;
            }
            let audio_short = audio.is_none()
                || self.buffered_audio_units() < self.config.min_audio_units as u64;
            if self.expect_audio && audio_short && !timed_out {
                return false;
            }
        }

        let Some(front_ts) = self.queue.front().map(|f| f.timestamp.micros) else {
            return false;
        };
        let due = match audio {
            Some(position) => {
                position.micros - micros(self.config.target_offset) + self.correction_us
            }
            None => front_ts,
        };
        self.anchor = Some((due, now_us));

        // First frame that is not already too old to show
        let tolerance = self.tolerance_us();
        let start = self
            .queue
            .iter()
            .position(|f| due - f.timestamp.micros <= tolerance)
            .unwrap_or(self.queue.len() - 1);
        let front_ts = self.queue[start].timestamp.micros;

        let skew = due - front_ts;
        if skew.abs() > tolerance {
            if !timed_out && !self.draining {
                return false;
            }
            // The audio clock and the video timestamps disagree for good;
            // shift the reference onto the video
            debug!("Synchronizer: forcing lock, correcting by {}us", -skew);
            if audio.is_some() {
                self.correction_us -= skew;
            }
            self.anchor = Some((front_ts, now_us));
        }
        for _ in 0..start {
            self.queue.pop_front();
            self.stats.skipped += 1;
        }

        info!(
            "Synchronizer: {} -> Locked (skew {}ms, {} queued)",
            self.state,
            skew / 1000,
            self.queue.len()
        );
        self.state = SyncState::Locked;
        self.waiting_since = None;
        self.out_of_band_since = None;
        true
    }

    fn present(&mut self, now_us: i64, audio: Option<Timestamp>) -> Option<DecodedFrame> {
        let due = self.reference(now_us, audio)?;
        let tolerance = self.tolerance_us();

        // Skip ahead past frames that are too old while a newer one is due
        while self.queue.len() > 1 {
            let stale = self
                .queue
                .front()
                .is_some_and(|f| due - f.timestamp.micros > tolerance);
            let next_due = self.queue.get(1).is_some_and(|f| f.timestamp.micros <= due);
            if !(stale && next_due) {
                break;
            }
            self.queue.pop_front();
            self.stats.skipped += 1;
        }

        let presented = if self
            .queue
            .front()
            .is_some_and(|f| f.timestamp.micros <= due)
        {
            self.queue.pop_front()
        } else {
            None
        };

        let measured = match &presented {
            Some(frame) => {
                self.stats.presented += 1;
                self.last_presented = Some((frame.sequence, frame.timestamp));
                Some(frame.timestamp.micros)
            }
            None => {
                if self.last_presented.is_some() {
                    self.stats.repeated += 1;
                }
                self.queue
                    .front()
                    .map(|f| f.timestamp.micros)
                    .or(self.last_presented.map(|(_, ts)| ts.micros))
            }
        };
        if let Some(ts) = measured {
            self.check_band(now_us, due - ts);
        }
        presented
    }

    fn check_band(&mut self, now_us: i64, skew: i64) {
        self.skew_us = Some(skew);
        if skew.abs() <= self.tolerance_us() {
            self.out_of_band_since = None;
            return;
        }
        let since = *self.out_of_band_since.get_or_insert(now_us);
        if self.draining || now_us - since < micros(self.config.resync_after) {
            return;
        }
        warn!(
            "Synchronizer: skew {}ms out of band for {:?}, resyncing",
            skew / 1000,
            self.config.resync_after
        );
        self.stats.resyncs += 1;
        self.state = SyncState::Resyncing;
        self.audio_units_base = self.audio_units;
        self.waiting_since = Some(now_us);
        self.out_of_band_since = None;
    }
}

/// Sync stage: decoded frames → present queue
pub struct SyncStage {
    sync: Synchronizer,
    clock: MediaClock,
    audio: Option<PlaybackClock>,
    health: Arc<PipelineHealth>,
    pause_rx: Option<watch::Receiver<bool>>,
    state_tx: watch::Sender<SyncState>,
    input_rx: Option<mpsc::Receiver<DecodedFrame>>,
    output: Option<Arc<DropOldestQueue<DecodedFrame>>>,
    /// Drops already reported to health
    reported_drops: u64,
}

impl SyncStage {
    pub fn new(config: &SyncConfig, clock: MediaClock, health: Arc<PipelineHealth>) -> Self {
        let (state_tx, _) = watch::channel(SyncState::Priming);
        Self {
            sync: Synchronizer::new(config, false),
            clock,
            audio: None,
            health,
            pause_rx: None,
            state_tx,
            input_rx: None,
            output: None,
            reported_drops: 0,
        }
    }

    /// Use the audio player's position as the reference clock
    pub fn set_audio_clock(&mut self, audio: PlaybackClock) {
        self.audio = Some(audio);
        self.sync.set_expect_audio(true);
    }

    /// While the value is true the picture is frozen
    pub fn set_pause(&mut self, pause_rx: watch::Receiver<bool>) {
        self.pause_rx = Some(pause_rx);
    }

    pub fn set_input(&mut self, rx: mpsc::Receiver<DecodedFrame>) {
        self.input_rx = Some(rx);
    }

    pub fn take_output(&mut self, capacity: usize) -> Arc<DropOldestQueue<DecodedFrame>> {
        let queue = DropOldestQueue::new(capacity);
        self.output = Some(queue.clone());
        queue
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SyncState> {
        self.state_tx.subscribe()
    }

    fn report(&mut self) {
        let stats = self.sync.stats();
        let drops = stats.dropped + stats.skipped;
        for _ in self.reported_drops..drops {
            self.health.record_frame_drop();
        }
        self.reported_drops = drops;
        if self.sync.state() != *self.state_tx.borrow() {
            if self.sync.state() == SyncState::Resyncing {
                self.health.record_resync();
            }
            self.state_tx.send_replace(self.sync.state());
        }
    }

    fn step(&mut self, output: &DropOldestQueue<DecodedFrame>) {
        let now = self.clock.now_us();
        if let Some(clock) = self.audio.as_ref() {
            self.sync.observe_audio_units(clock.units());
        }
        let audio = self.audio.as_ref().and_then(|a| a.position(now));
        if let Some(frame) = self.sync.tick(now, audio) {
            if let Ok(Some(_evicted)) = output.push(frame) {
                self.health.record_frame_drop();
            }
        }
        self.report();
    }
}

#[async_trait]
impl PipelineStage for SyncStage {
    async fn run(&mut self) -> Result<()> {
        let mut input_rx = self
            .input_rx
            .take()
            .ok_or_else(|| anyhow::anyhow!("No video input channel"))?;
        let output = self
            .output
            .take()
            .ok_or_else(|| anyhow::anyhow!("No video output queue"))?;
        let mut pause_rx = self.pause_rx.take();
        let mut paused = pause_rx.as_ref().is_some_and(|rx| *rx.borrow());

        info!(
            "SyncStage: started (audio clock: {}, target offset {:?})",
            if self.audio.is_some() { "yes" } else { "no" },
            self.sync.config.target_offset
        );
        let tick = Duration::from_millis(5);
        let mut input_open = true;
        let mut last_stats = Instant::now();

        loop {
            tokio::select! {
                frame = input_rx.recv(), if input_open => match frame {
                    Some(frame) => {
                        self.sync.push(frame);
                        self.report();
                    }
                    None => {
                        debug!("SyncStage: input closed, {} frames left", self.sync.queued());
                        input_open = false;
                        self.sync.finish();
                    }
                },
                changed = async { pause_rx.as_mut()?.changed().await.ok() }, if pause_rx.is_some() => {
                    match changed {
                        Some(()) => {
                            let now_paused = pause_rx.as_ref().is_some_and(|rx| *rx.borrow());
                            if now_paused != paused {
                                paused = now_paused;
                                if paused {
                                    info!("SyncStage: paused");
                                } else {
                                    info!("SyncStage: resumed, re-priming");
                                    self.sync.reprime(self.clock.now_us());
                                }
                            }
                        }
                        None => pause_rx = None,
                    }
                },
                _ = tokio::time::sleep(tick), if !paused => self.step(&output),
            }

            if !input_open && (paused || self.sync.queued() == 0) {
                break;
            }

            if last_stats.elapsed() >= Duration::from_secs(30) {
                let s = self.sync.stats();
                info!(
                    "SyncStage: {} presented, {} skipped, {} repeated, {} dropped, {} resyncs, state {}, skew {}ms",
                    s.presented,
                    s.skipped,
                    s.repeated,
                    s.dropped,
                    s.resyncs,
                    self.sync.state(),
                    self.sync.skew_us().unwrap_or(0) / 1000
                );
                last_stats = Instant::now();
            }
        }

        output.close();
        let s = self.sync.stats();
        info!(
            "SyncStage: finished ({} presented, {} skipped, {} resyncs)",
            s.presented, s.skipped, s.resyncs
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "SyncStage"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    const FRAME_US: i64 = 33_333;

    fn frame(seq: u64) -> DecodedFrame {
        DecodedFrame {
            sequence: seq,
            timestamp: Timestamp::from_micros(seq as i64 * FRAME_US),
            image: RgbImage::new(2, 2),
        }
    }

    fn config() -> SyncConfig {
        SyncConfig {
            min_video_units: 2,
            target_offset: Duration::from_millis(80),
            tolerance: Duration::from_millis(60),
            resync_after: Duration::from_millis(500),
            priming_timeout: Duration::from_secs(1),
            max_video_queue: 30,
            ..SyncConfig::default()
        }
    }

    /// Drive the synchronizer in 5ms steps. Frames reach the receiver
    /// `latency` after their timestamp; the audio clock trails local time by
    /// `audio_lag`. Returns the presented sequences and the skews seen.
    fn simulate(
        sync: &mut Synchronizer,
        until_ms: i64,
        latency_ms: i64,
        audio_lag_ms: Option<i64>,
        lost: impl Fn(u64) -> bool,
    ) -> (Vec<u64>, Vec<(i64, i64)>) {
        let mut presented = Vec::new();
        let mut skews = Vec::new();
        let mut next = 0u64;
        let mut now = 0i64;
        while now <= until_ms * 1000 {
            while next as i64 * FRAME_US + latency_ms * 1000 <= now {
                if !lost(next) {
                    sync.push(frame(next));
                }
                next += 1;
            }
            let audio = audio_lag_ms.map(|lag| Timestamp::from_micros(now - lag * 1000));
            if audio.is_some() {
                // One 10ms chunk per 10ms of playback
                sync.observe_audio_units(now as u64 / 10_000);
            }
            if let Some(f) = sync.tick(now, audio) {
                presented.push(f.sequence);
            }
            if let Some(skew) = sync.skew_us() {
                skews.push((now, skew));
            }
            now += 5_000;
        }
        (presented, skews)
    }

    #[test]
    fn test_primes_then_locks_behind_audio() {
        let mut sync = Synchronizer::new(&config(), true);
        assert!(sync.tick(0, None).is_none());
        sync.push(frame(0));
        sync.push(frame(1));
        // Audio not started yet, still priming
        assert!(sync.tick(100_000, None).is_none());
        assert_eq!(sync.state(), SyncState::Priming);

        // Reference = 140ms - 80ms = 60ms: both frames are due, one per tick
        sync.observe_audio_units(4);
        let audio = Some(Timestamp::from_micros(140_000));
        let first = sync.tick(110_000, audio).map(|f| f.sequence);
        assert_eq!(sync.state(), SyncState::Locked);
        assert_eq!(first, Some(0));
        assert_eq!(sync.tick(115_000, audio).map(|f| f.sequence), Some(1));
        assert!(sync.tick(120_000, audio).is_none());
        assert_eq!(sync.stats().repeated, 1);
    }

    #[test]
    fn test_video_waits_for_audio_and_never_blocks_it() {
        let mut sync = Synchronizer::new(&config(), true);
        sync.observe_audio_units(4);
        for s in 0..4 {
            sync.push(frame(s));
        }
        // Audio behind the video: locked, but nothing due yet
        let audio = Some(Timestamp::from_micros(50_000));
        assert!(sync.tick(0, audio).is_none());
        assert_eq!(sync.state(), SyncState::Locked);
        // The audio jumps past frame 3; the stale frames in between are skipped
        let audio = Some(Timestamp::from_micros(3 * FRAME_US + 80_000 + 5_000));
        assert_eq!(sync.tick(10_000, audio).map(|f| f.sequence), Some(2));
        assert_eq!(sync.stats().skipped, 2);
    }

    #[test]
    fn test_priming_waits_for_audio_units() {
        let mut sync = Synchronizer::new(&config(), true);
        for s in 0..4 {
            sync.push(frame(s));
        }
        let audio = Some(Timestamp::from_micros(140_000));
        // Video is sufficient, audio is not
        sync.observe_audio_units(3);
        assert!(sync.tick(10_000, audio).is_none());
        assert_eq!(sync.state(), SyncState::Priming);
        assert_eq!(sync.buffered_audio_units(), 3);

        sync.observe_audio_units(4);
        assert_eq!(sync.tick(20_000, audio).map(|f| f.sequence), Some(0));
        assert_eq!(sync.state(), SyncState::Locked);

        // A re-prime counts audio from scratch
        sync.reprime(30_000);
        assert_eq!(sync.buffered_audio_units(), 0);
        sync.push(frame(4));
        sync.observe_audio_units(6);
        assert!(sync.tick(40_000, audio).is_none());
        assert_eq!(sync.state(), SyncState::Priming);
        sync.observe_audio_units(8);
        let later = Some(Timestamp::from_micros(160_000));
        assert_eq!(sync.tick(50_000, later).map(|f| f.sequence), Some(2));
        assert_eq!(sync.state(), SyncState::Locked);

        // A player reset restarts the count
        sync.observe_audio_units(1);
        assert_eq!(sync.buffered_audio_units(), 1);
    }

    #[test]
    fn test_free_runs_without_audio() {
        let mut sync = Synchronizer::new(&config(), false);
        let (presented, skews) = simulate(&mut sync, 1_000, 20, None, |_| false);
        assert_eq!(sync.state(), SyncState::Locked);
        assert!(presented.len() >= 27, "{:?}", presented);
        assert!(presented.windows(2).all(|w| w[1] == w[0] + 1), "{:?}", presented);
        assert!(skews.iter().all(|(_, s)| s.abs() <= 60_000));
        assert_eq!(sync.stats().resyncs, 0);
    }

    #[test]
    fn test_stale_and_duplicate_frames_refused() {
        let mut sync = Synchronizer::new(&config(), false);
        sync.push(frame(3));
        assert!(!sync.push(frame(3)));
        assert!(!sync.push(frame(1)));
        assert!(sync.push(frame(4)));
        assert_eq!(sync.stats().dropped, 2);
    }

    #[test]
    fn test_queue_overflow_drops_oldest() {
        let mut cfg = config();
        cfg.max_video_queue = 3;
        let mut sync = Synchronizer::new(&cfg, false);
        for s in 0..5 {
            sync.push(frame(s));
        }
        assert_eq!(sync.queued(), 3);
        assert_eq!(sync.stats().dropped, 2);
        assert_eq!(sync.tick(0, None).map(|f| f.sequence), Some(2));
    }

    #[test]
    fn test_burst_loss_recovers_within_bounded_resyncs() {
        let mut sync = Synchronizer::new(&config(), true);
        // Two 600ms holes in the video
        let lost = |seq: u64| {
            let ts = seq as i64 * FRAME_US;
            (1_000_000..1_600_000).contains(&ts) || (3_000_000..3_600_000).contains(&ts)
        };
        let (presented, skews) = simulate(&mut sync, 5_000, 50, Some(100), lost);

        let resyncs = sync.stats().resyncs;
        assert!((1..=2).contains(&resyncs), "{} resyncs", resyncs);
        assert_eq!(sync.state(), SyncState::Locked);
        assert!(presented.windows(2).all(|w| w[0] < w[1]));

        // Back in band well before the end and stays there
        let settled: Vec<_> = skews.iter().filter(|(t, _)| *t >= 4_500_000).collect();
        assert!(!settled.is_empty());
        assert!(settled.iter().all(|(_, s)| s.abs() <= 60_000), "{:?}", settled);
    }

    #[test]
    fn test_forced_lock_after_priming_timeout() {
        // Audio ten seconds past anything the video will reach
        let mut sync = Synchronizer::new(&config(), true);
        sync.push(frame(0));
        sync.push(frame(1));
        assert!(sync.tick(0, Some(Timestamp::from_micros(10_000_000))).is_none());
        assert_eq!(sync.state(), SyncState::Priming);
        let audio = Some(Timestamp::from_micros(11_000_000));
        assert_eq!(sync.tick(1_000_000, audio).map(|f| f.sequence), Some(1));
        assert_eq!(sync.state(), SyncState::Locked);

        // Video far ahead of the audio
        let mut sync = Synchronizer::new(&config(), true);
        sync.push(frame(100));
        sync.push(frame(101));
        let audio_at = |now: i64| Some(Timestamp::from_micros(now));
        assert!(sync.tick(0, audio_at(0)).is_none());
        assert_eq!(sync.state(), SyncState::Priming);
        assert_eq!(
            sync.tick(1_000_000, audio_at(1_000_000)).map(|f| f.sequence),
            Some(100)
        );
        assert_eq!(sync.state(), SyncState::Locked);
        assert_eq!(sync.skew_us(), Some(0));
    }

    #[tokio::test]
    async fn test_stage_drains_after_input_closes() {
        let health = Arc::new(PipelineHealth::new());
        let mut cfg = config();
        cfg.min_video_units = 1;
        let mut stage = SyncStage::new(&cfg, MediaClock::new(), health);
        let (tx, rx) = mpsc::channel(8);
        stage.set_input(rx);
        let out = stage.take_output(8);
        let state = stage.subscribe_state();

        for s in 0..4 {
            tx.send(DecodedFrame {
                sequence: s,
                timestamp: Timestamp::from_micros(s as i64 * 10_000),
                image: RgbImage::new(2, 2),
            })
            .await
            .unwrap();
        }
        drop(tx);
        tokio::time::timeout(Duration::from_secs(2), stage.run())
            .await
            .unwrap()
            .unwrap();

        let mut got = Vec::new();
        while let Some(f) = out.pop().await {
            got.push(f.sequence);
        }
        assert_eq!(got, vec![0, 1, 2, 3]);
        assert_eq!(*state.borrow(), SyncState::Locked);
    }
}

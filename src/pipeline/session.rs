//! Connection lifecycle
//!
//! A [`StreamSession`] exists for exactly one connection. It starts in
//! `Connecting`, moves to `Streaming` once negotiation completes, flips
//! between `Streaming` and `Degraded` on a sliding-window loss/latency
//! estimate, and ends in `Closed` with a single recorded cause.

use log::{info, warn};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::watch;

use super::state::SessionState;
use super::types::{Resolution, Timestamp};
use crate::config::{Config, SessionConfig};
use crate::error::StreamError;

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseCause {
    /// Local user asked to stop
    Stopped,
    /// Peer sent `Stop` or closed the connection cleanly
    PeerStopped,
    /// Ended by an error; `kind` is the [`StreamError::kind`] label
    Failed { kind: &'static str, message: String },
}

impl CloseCause {
    pub fn from_error(err: &StreamError) -> Self {
        CloseCause::Failed {
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CloseCause::Stopped => "Stopped",
            CloseCause::PeerStopped => "PeerStopped",
            CloseCause::Failed { kind, .. } => kind,
        }
    }
}

impl std::fmt::Display for CloseCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseCause::Stopped => write!(f, "stopped by user"),
            CloseCause::PeerStopped => write!(f, "stopped by peer"),
            CloseCause::Failed { message, .. } => write!(f, "{}", message),
        }
    }
}

/// Observations the pipeline stages report about the link
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Packets that arrived intact
    Delivered { count: u64 },
    /// Sequence numbers that will never be delivered (gaps, corrupt payloads)
    Lost { count: u64 },
    /// Arrival of a unit stamped `sent` at local time `received_us`
    Delay { sent: Timestamp, received_us: i64 },
    /// A recoverable fault somewhere in the pipeline
    Fault { kind: &'static str, message: String },
    TransportError(String),
    PeerStop,
}

/// One active connection
pub struct StreamSession {
    peer: String,
    resolution: Resolution,
    quality: u8,
    created_at: Instant,
    state: SessionState,
    cause: Option<CloseCause>,

    config: SessionConfig,
    negotiation_timeout: Duration,
    max_consecutive_errors: u32,

    /// Sliding window of packet outcomes, `true` = lost
    outcomes: VecDeque<bool>,
    lost_in_window: usize,
    /// Relative one-way delay: arrival minus send time, minus the best seen
    min_delay_us: Option<i64>,
    excess_delays: VecDeque<i64>,
    excess_sum: i64,

    consecutive_errors: u32,
    /// Clean deliveries needed before a fault-induced Degraded may recover
    clean_needed: usize,

    state_tx: watch::Sender<SessionState>,
}

impl StreamSession {
    pub fn new(peer: impl Into<String>, resolution: Resolution, quality: u8, config: &Config) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Connecting);
        Self {
            peer: peer.into(),
            resolution,
            quality,
            created_at: Instant::now(),
            state: SessionState::Connecting,
            cause: None,
            config: config.session.clone(),
            negotiation_timeout: config.transport.negotiation_timeout,
            max_consecutive_errors: config.transport.max_consecutive_errors.max(1),
            outcomes: VecDeque::with_capacity(config.session.loss_window),
            lost_in_window: 0,
            min_delay_us: None,
            excess_delays: VecDeque::with_capacity(config.session.loss_window),
            excess_sum: 0,
            consecutive_errors: 0,
            clean_needed: 0,
            state_tx,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Watch state changes from another task
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn close_cause(&self) -> Option<&CloseCause> {
        self.cause.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// Sender-authoritative updates after negotiation
    pub fn set_resolution(&mut self, resolution: Resolution) {
        self.resolution = resolution;
    }

    pub fn set_quality(&mut self, quality: u8) {
        self.quality = quality;
    }

    fn transition(&mut self, target: SessionState) -> bool {
        if !self.state.can_transition_to(&target) {
            return false;
        }
        info!(
            "StreamSession[{}]: {} -> {}",
            self.peer, self.state, target
        );
        self.state = target;
        self.state_tx.send_replace(target);
        true
    }

    /// Negotiation completed, media may flow
    pub fn negotiated(&mut self) -> bool {
        self.transition(SessionState::Streaming {
            since: Instant::now(),
        })
    }

    /// Close with a cause; the first cause wins
    pub fn close(&mut self, cause: CloseCause) {
        if self.state.is_closed() {
            return;
        }
        match &cause {
            CloseCause::Failed { .. } => warn!("StreamSession[{}]: closing: {}", self.peer, cause),
            _ => info!("StreamSession[{}]: closing: {}", self.peer, cause),
        }
        self.cause = Some(cause);
        self.transition(SessionState::Closed);
    }

    pub fn stop(&mut self) {
        self.close(CloseCause::Stopped);
    }

    pub fn fail(&mut self, err: &StreamError) {
        self.close(CloseCause::from_error(err));
    }

    pub fn fail_negotiation(&mut self, reason: impl Into<String>) {
        self.fail(&StreamError::NegotiationFailed(reason.into()));
    }

    /// Close a session stuck in `Connecting` past the negotiation timeout.
    /// Returns whether the session is closed afterwards.
    pub fn poll_timeout(&mut self, now: Instant) -> bool {
        if self.state == SessionState::Connecting
            && now.saturating_duration_since(self.created_at) >= self.negotiation_timeout
        {
            self.fail_negotiation(format!(
                "no negotiation data within {:?}",
                self.negotiation_timeout
            ));
        }
        self.is_closed()
    }

    /// Fraction of the recent packets that were lost
    pub fn loss_ratio(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        self.lost_in_window as f64 / self.outcomes.len() as f64
    }

    /// Average queuing delay above the best one seen in the window
    pub fn excess_latency(&self) -> Duration {
        if self.excess_delays.is_empty() {
            return Duration::ZERO;
        }
        let avg = self.excess_sum / self.excess_delays.len() as i64;
        Duration::from_micros(avg.max(0) as u64)
    }

    fn push_outcome(&mut self, lost: bool) {
        if self.outcomes.len() >= self.config.loss_window.max(1) {
            if let Some(true) = self.outcomes.pop_front() {
                self.lost_in_window -= 1;
            }
        }
        self.outcomes.push_back(lost);
        if lost {
            self.lost_in_window += 1;
        }
    }

    fn push_delay(&mut self, delay_us: i64) {
        let min = self.min_delay_us.map_or(delay_us, |m| m.min(delay_us));
        self.min_delay_us = Some(min);
        let excess = delay_us - min;
        if self.excess_delays.len() >= self.config.loss_window.max(1) {
            if let Some(old) = self.excess_delays.pop_front() {
                self.excess_sum -= old;
            }
        }
        self.excess_delays.push_back(excess);
        self.excess_sum += excess;
    }

    /// Re-evaluate Streaming/Degraded with hysteresis
    fn evaluate(&mut self) {
        // Too few samples make the ratio meaningless
        let min_samples = (self.config.loss_window / 4).max(1);
        let ratio = if self.outcomes.len() >= min_samples {
            self.loss_ratio()
        } else {
            0.0
        };
        let latency = self.excess_latency();

        match self.state {
            SessionState::Streaming { .. } => {
                if ratio > self.config.degrade_loss_ratio {
                    warn!(
                        "StreamSession[{}]: packet loss {:.1}% over budget",
                        self.peer,
                        ratio * 100.0
                    );
                    self.degrade();
                } else if latency > self.config.degrade_latency {
                    warn!(
                        "StreamSession[{}]: latency {:?} over budget",
                        self.peer, latency
                    );
                    self.degrade();
                }
            }
            SessionState::Degraded { .. } => {
                if self.clean_needed == 0
                    && ratio <= self.config.recover_loss_ratio
                    && latency <= self.config.degrade_latency / 2
                {
                    self.transition(SessionState::Streaming {
                        since: Instant::now(),
                    });
                }
            }
            _ => {}
        }
    }

    fn degrade(&mut self) {
        self.transition(SessionState::Degraded {
            since: Instant::now(),
        });
    }

    /// Apply one observation from the pipeline
    pub fn apply(&mut self, event: SessionEvent) {
        if !self.state.is_active() {
            return;
        }
        match event {
            SessionEvent::Delivered { count } => {
                self.consecutive_errors = 0;
                for _ in 0..count {
                    self.push_outcome(false);
                }
                self.clean_needed = self.clean_needed.saturating_sub(count as usize);
            }
            SessionEvent::Lost { count } => {
                for _ in 0..count {
                    self.push_outcome(true);
                }
            }
            SessionEvent::Delay { sent, received_us } => {
                self.push_delay(received_us - sent.micros);
            }
            SessionEvent::Fault { kind, message } => {
                warn!("StreamSession[{}]: {}: {}", self.peer, kind, message);
                self.clean_needed = (self.config.loss_window / 4).max(1);
                self.degrade();
                return;
            }
            SessionEvent::TransportError(message) => {
                self.consecutive_errors += 1;
                if self.consecutive_errors >= self.max_consecutive_errors {
                    self.fail(&StreamError::TransportError(format!(
                        "{} consecutive transport errors, last: {}",
                        self.consecutive_errors, message
                    )));
                } else {
                    self.clean_needed = (self.config.loss_window / 4).max(1);
                    self.degrade();
                }
                return;
            }
            SessionEvent::PeerStop => {
                self.close(CloseCause::PeerStopped);
                return;
            }
        }
        self.evaluate();
    }
}

impl std::fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSession")
            .field("peer", &self.peer)
            .field("resolution", &self.resolution)
            .field("quality", &self.quality)
            .field("state", &self.state)
            .field("age", &self.created_at.elapsed())
            .field("loss_ratio", &self.loss_ratio())
            .field("cause", &self.cause)
            .finish()
    }
}

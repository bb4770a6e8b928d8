//! Reorder stage for the receiver pipeline
//!
//! Restores per-stream sequence order inside a small window. Units that fall
//! outside the window, or gaps held longer than `max_hold`, are given up as
//! lost so the stream never stalls behind a missing packet.

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::config::ReorderConfig;
use crate::pipeline::PipelineStage;
use crate::pipeline::health::PipelineHealth;
use crate::pipeline::session::SessionEvent;
use crate::pipeline::types::Sequenced;

/// What the receive stage hands to a reorder stage
#[derive(Debug, Clone)]
pub enum Arrival<T> {
    Unit(T),
    /// A sequence number whose payload arrived corrupt; skip it without waiting
    Lost(u64),
}

impl<T: Sequenced> Arrival<T> {
    pub fn sequence(&self) -> u64 {
        match self {
            Arrival::Unit(u) => u.sequence(),
            Arrival::Lost(seq) => *seq,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReorderStats {
    pub delivered: u64,
    /// Units that arrived behind a later one and were put back in order
    pub reordered: u64,
    /// Units that arrived after their slot was given up
    pub late: u64,
    pub duplicates: u64,
    /// Sequence numbers given up without ever arriving
    pub skipped: u64,
    /// Sequence numbers reported corrupt by the receive stage
    pub corrupt: u64,
}

/// Sliding-window reorder buffer
pub struct ReorderBuffer<T> {
    pending: BTreeMap<u64, Option<T>>,
    expected: Option<u64>,
    window: u64,
    max_hold: Duration,
    /// When the current head-of-line gap was first seen
    gap_since: Option<Instant>,
    stats: ReorderStats,
    reported_skips: u64,
}

impl<T: Sequenced> ReorderBuffer<T> {
    pub fn new(config: &ReorderConfig) -> Self {
        Self {
            pending: BTreeMap::new(),
            expected: None,
            window: config.window.max(1),
            max_hold: config.max_hold,
            gap_since: None,
            stats: ReorderStats::default(),
            reported_skips: 0,
        }
    }

    pub fn insert(&mut self, arrival: Arrival<T>) {
        let seq = arrival.sequence();
        let expected = *self.expected.get_or_insert(seq);

        if seq < expected {
            if let Arrival::Unit(_) = arrival {
                self.stats.late += 1;
            }
            return;
        }
        if self.pending.contains_key(&seq) {
            self.stats.duplicates += 1;
            return;
        }
        if let Some((&last, _)) = self.pending.last_key_value() {
            if seq < last {
                self.stats.reordered += 1;
            }
        }
        match arrival {
            Arrival::Unit(unit) => {
                self.pending.insert(seq, Some(unit));
            }
            Arrival::Lost(_) => {
                self.pending.insert(seq, None);
            }
        }
    }

    /// Release every unit that is in order, skipping gaps that are too wide
    /// or have been held too long
    pub fn drain_ready(&mut self, now: Instant) -> Vec<T> {
        let mut out = Vec::new();
        let Some(mut expected) = self.expected else {
            return out;
        };

        while let Some((&first, _)) = self.pending.first_key_value() {
            if first == expected {
                self.gap_since = None;
                match self.pending.pop_first() {
                    Some((_, Some(unit))) => {
                        self.stats.delivered += 1;
                        out.push(unit);
                    }
                    Some((_, None)) => self.stats.corrupt += 1,
                    None => break,
                }
                expected += 1;
                continue;
            }

            let since = *self.gap_since.get_or_insert(now);
            let newest = self.pending.last_key_value().map_or(first, |(&k, _)| k);
            let outside_window = newest - expected >= self.window;
            let held_too_long = now.saturating_duration_since(since) >= self.max_hold;
            if !(outside_window || held_too_long) {
                break;
            }

            // Give up on the missing run in front of the buffer
            let missing = first - expected;
            self.stats.skipped += missing;
            debug!(
                "ReorderBuffer: skipping {} missing ({}..{}), {}",
                missing,
                expected,
                first,
                if outside_window { "outside window" } else { "hold expired" }
            );
            expected = first;
            self.gap_since = None;
        }

        self.expected = Some(expected);
        out
    }

    /// Release everything still buffered, in order
    pub fn flush(&mut self) -> Vec<T> {
        let mut out = Vec::new();
        while let Some((seq, unit)) = self.pending.pop_first() {
            if let Some(expected) = self.expected {
                self.stats.skipped += seq.saturating_sub(expected);
            }
            match unit {
                Some(unit) => {
                    self.stats.delivered += 1;
                    out.push(unit);
                }
                None => self.stats.corrupt += 1,
            }
            self.expected = Some(seq + 1);
        }
        self.gap_since = None;
        out
    }

    /// Skips since the last call
    pub fn take_new_skips(&mut self) -> u64 {
        let new = self.stats.skipped - self.reported_skips;
        self.reported_skips = self.stats.skipped;
        new
    }

    pub fn stats(&self) -> ReorderStats {
        self.stats
    }

    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Next sequence number to be released
    pub fn expected(&self) -> Option<u64> {
        self.expected
    }
}

/// Reorder stage: one per media stream
pub struct ReorderStage<T> {
    name: &'static str,
    buffer: ReorderBuffer<T>,
    health: Arc<PipelineHealth>,
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
    input_rx: Option<mpsc::Receiver<Arrival<T>>>,
    output_tx: Option<mpsc::Sender<T>>,
}

impl<T: Sequenced + Send + Sync + 'static> ReorderStage<T> {
    pub fn new(name: &'static str, config: &ReorderConfig, health: Arc<PipelineHealth>) -> Self {
        Self {
            name,
            buffer: ReorderBuffer::new(config),
            health,
            events: None,
            input_rx: None,
            output_tx: None,
        }
    }

    pub fn set_input(&mut self, rx: mpsc::Receiver<Arrival<T>>) {
        self.input_rx = Some(rx);
    }

    pub fn take_output(&mut self, capacity: usize) -> mpsc::Receiver<T> {
        let (tx, rx) = mpsc::channel::<T>(capacity.max(1));
        self.output_tx = Some(tx);
        rx
    }

    pub fn set_events(&mut self, events: mpsc::UnboundedSender<SessionEvent>) {
        self.events = Some(events);
    }

    fn report_skips(&mut self) {
        let skipped = self.buffer.take_new_skips();
        if skipped == 0 {
            return;
        }
        self.health.record_lost(skipped);
        if let Some(events) = &self.events {
            let _ = events.send(SessionEvent::Lost { count: skipped });
        }
    }

    async fn forward(&mut self, output: &mpsc::Sender<T>, units: Vec<T>) -> bool {
        self.report_skips();
        for unit in units {
            if output.send(unit).await.is_err() {
                return false;
            }
        }
        true
    }
}

#[async_trait]
impl<T: Sequenced + Send + Sync + 'static> PipelineStage for ReorderStage<T> {
    async fn run(&mut self) -> Result<()> {
        let mut input_rx = self
            .input_rx
            .take()
            .ok_or_else(|| anyhow::anyhow!("No input channel"))?;
        let output_tx = self
            .output_tx
            .take()
            .ok_or_else(|| anyhow::anyhow!("No output channel"))?;

        info!("{}: started", self.name);
        let mut last_stats = Instant::now();
        let drain_interval = Duration::from_millis(5);

        loop {
            tokio::select! {
                arrival = input_rx.recv() => match arrival {
                    Some(arrival) => {
                        self.buffer.insert(arrival);
                        let ready = self.buffer.drain_ready(Instant::now());
                        if !self.forward(&output_tx, ready).await {
                            info!("{}: output channel closed", self.name);
                            return Ok(());
                        }
                    }
                    None => {
                        // Input closed, drain remaining
                        let rest = self.buffer.flush();
                        self.forward(&output_tx, rest).await;
                        break;
                    }
                },
                _ = tokio::time::sleep(drain_interval), if self.buffer.buffered() > 0 => {
                    let ready = self.buffer.drain_ready(Instant::now());
                    if !self.forward(&output_tx, ready).await {
                        return Ok(());
                    }
                }
            }

            if last_stats.elapsed() >= Duration::from_secs(30) {
                let s = self.buffer.stats();
                info!(
                    "{}: {} delivered, {} reordered, {} skipped, {} late, {} corrupt",
                    self.name, s.delivered, s.reordered, s.skipped, s.late, s.corrupt
                );
                last_stats = Instant::now();
            }
        }

        let s = self.buffer.stats();
        info!(
            "{}: finished ({} delivered, {} reordered, {} skipped)",
            self.name, s.delivered, s.reordered, s.skipped
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

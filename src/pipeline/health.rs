//! Health monitoring and metrics for pipeline

use log::{info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn unix_micros() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

/// Health metrics for a pipeline
///
/// Shared by every stage of one role. All fields use atomic operations for
/// thread-safe access.
pub struct PipelineHealth {
    /// Video frames that made it through the stage that owns the counter
    pub frames_processed: AtomicU64,

    /// Total bytes of payload processed
    pub bytes_processed: AtomicU64,

    /// Video frames dropped due to backpressure or lateness
    pub frame_drops: AtomicU64,

    /// Audio chunks dropped as a last resort
    pub audio_drops: AtomicU64,

    /// Payloads that failed validation or decoding
    pub corrupt_payloads: AtomicU64,

    /// Number of network errors
    pub network_errors: AtomicU64,

    /// Sequence numbers never delivered (gaps skipped by the reorder stage)
    pub lost_packets: AtomicU64,

    /// Packets that arrived behind a newer one and were put back in order
    pub reordered_packets: AtomicU64,

    /// Times the synchronizer went through Resyncing
    pub resync_cycles: AtomicU64,

    /// Timestamp (as Unix microseconds) of the last successfully processed frame
    pub last_frame_time: AtomicU64,
}

impl PipelineHealth {
    pub fn new() -> Self {
        Self {
            frames_processed: AtomicU64::new(0),
            bytes_processed: AtomicU64::new(0),
            frame_drops: AtomicU64::new(0),
            audio_drops: AtomicU64::new(0),
            corrupt_payloads: AtomicU64::new(0),
            network_errors: AtomicU64::new(0),
            lost_packets: AtomicU64::new(0),
            reordered_packets: AtomicU64::new(0),
            resync_cycles: AtomicU64::new(0),
            last_frame_time: AtomicU64::new(unix_micros()),
        }
    }

    /// Record a successfully processed frame
    pub fn record_frame(&self, size: usize) {
        self.last_frame_time.store(unix_micros(), Ordering::Relaxed);
        self.frames_processed.fetch_add(1, Ordering::Relaxed);
        self.bytes_processed.fetch_add(size as u64, Ordering::Relaxed);
    }

    pub fn record_frame_drop(&self) {
        self.frame_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_audio_drop(&self) {
        self.audio_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_corrupt_payload(&self) {
        self.corrupt_payloads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_network_error(&self) {
        self.network_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lost(&self, count: u64) {
        self.lost_packets.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_reordered(&self) {
        self.reordered_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_resync(&self) {
        self.resync_cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed.load(Ordering::Relaxed)
    }

    pub fn bytes_processed(&self) -> u64 {
        self.bytes_processed.load(Ordering::Relaxed)
    }

    pub fn frame_drops(&self) -> u64 {
        self.frame_drops.load(Ordering::Relaxed)
    }

    pub fn audio_drops(&self) -> u64 {
        self.audio_drops.load(Ordering::Relaxed)
    }

    pub fn corrupt_payloads(&self) -> u64 {
        self.corrupt_payloads.load(Ordering::Relaxed)
    }

    pub fn network_errors(&self) -> u64 {
        self.network_errors.load(Ordering::Relaxed)
    }

    pub fn lost_packets(&self) -> u64 {
        self.lost_packets.load(Ordering::Relaxed)
    }

    pub fn reordered_packets(&self) -> u64 {
        self.reordered_packets.load(Ordering::Relaxed)
    }

    pub fn resync_cycles(&self) -> u64 {
        self.resync_cycles.load(Ordering::Relaxed)
    }

    /// Get the timestamp of the last frame (Unix microseconds)
    pub fn last_frame_time(&self) -> u64 {
        self.last_frame_time.load(Ordering::Relaxed)
    }

    /// Calculate the frame drop rate as a percentage
    pub fn frame_drop_rate(&self) -> f64 {
        let drops = self.frame_drops();
        let processed = self.frames_processed();
        if processed == 0 {
            return 0.0;
        }
        (drops as f64 / processed as f64) * 100.0
    }

    /// Check if the pipeline has stalled (no frames for given duration)
    pub fn is_stalled(&self, threshold: Duration) -> bool {
        let elapsed_micros = unix_micros().saturating_sub(self.last_frame_time());
        elapsed_micros > threshold.as_micros() as u64
    }

    pub fn summary(&self) -> HealthSummary {
        HealthSummary {
            frames_processed: self.frames_processed(),
            frame_drops: self.frame_drops(),
            audio_drops: self.audio_drops(),
            corrupt_payloads: self.corrupt_payloads(),
            network_errors: self.network_errors(),
            lost_packets: self.lost_packets(),
            reordered_packets: self.reordered_packets(),
            resync_cycles: self.resync_cycles(),
            bytes_processed: self.bytes_processed(),
            frame_drop_rate: self.frame_drop_rate(),
        }
    }
}

impl Default for PipelineHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of health metrics
#[derive(Debug, Clone)]
pub struct HealthSummary {
    pub frames_processed: u64,
    pub frame_drops: u64,
    pub audio_drops: u64,
    pub corrupt_payloads: u64,
    pub network_errors: u64,
    pub lost_packets: u64,
    pub reordered_packets: u64,
    pub resync_cycles: u64,
    pub bytes_processed: u64,
    pub frame_drop_rate: f64,
}

impl std::fmt::Display for HealthSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Health: {} frames ({} drops, {:.2}%), {} audio drops, {} corrupt, {} lost, {} reordered, {} resyncs, {} network errors, {} bytes",
            self.frames_processed,
            self.frame_drops,
            self.frame_drop_rate,
            self.audio_drops,
            self.corrupt_payloads,
            self.lost_packets,
            self.reordered_packets,
            self.resync_cycles,
            self.network_errors,
            self.bytes_processed,
        )
    }
}

/// Health alert types
#[derive(Debug, Clone)]
pub enum HealthAlert {
    /// Pipeline has stalled (no frames for threshold duration)
    Stalled { duration: Duration },

    /// High frame drop rate detected
    HighDropRate { rate: f64 },

    /// New corrupt payloads since the last check
    CorruptPayloads { count: u64 },

    NetworkErrors { count: u64 },
}

impl std::fmt::Display for HealthAlert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthAlert::Stalled { duration } => {
                write!(f, "Pipeline stalled for {:?}", duration)
            }
            HealthAlert::HighDropRate { rate } => {
                write!(f, "High frame drop rate: {:.2}%", rate)
            }
            HealthAlert::CorruptPayloads { count } => {
                write!(f, "Corrupt payloads: {}", count)
            }
            HealthAlert::NetworkErrors { count } => {
                write!(f, "Network errors: {}", count)
            }
        }
    }
}

/// Periodic health check
///
/// Logs alerts as they appear and a full summary on every summary interval.
pub struct HealthMonitor {
    name: &'static str,
    health: Arc<PipelineHealth>,
    check_interval: Duration,
    summary_interval: Duration,
    stall_threshold: Duration,
    drop_rate_threshold: f64,
    last_corrupt: u64,
    last_network_errors: u64,
}

impl HealthMonitor {
    pub fn new(name: &'static str, health: Arc<PipelineHealth>) -> Self {
        Self {
            name,
            health,
            check_interval: Duration::from_secs(5),
            summary_interval: Duration::from_secs(30),
            stall_threshold: Duration::from_secs(5),
            drop_rate_threshold: 10.0, // 10% drop rate
            last_corrupt: 0,
            last_network_errors: 0,
        }
    }

    /// Collect the alerts raised since the previous check
    pub fn check(&mut self) -> Vec<HealthAlert> {
        let mut alerts = Vec::new();

        if self.health.is_stalled(self.stall_threshold) {
            alerts.push(HealthAlert::Stalled {
                duration: self.stall_threshold,
            });
        }

        let drop_rate = self.health.frame_drop_rate();
        if drop_rate > self.drop_rate_threshold {
            alerts.push(HealthAlert::HighDropRate { rate: drop_rate });
        }

        let corrupt = self.health.corrupt_payloads();
        if corrupt > self.last_corrupt {
            alerts.push(HealthAlert::CorruptPayloads {
                count: corrupt - self.last_corrupt,
            });
            self.last_corrupt = corrupt;
        }

        let network_errors = self.health.network_errors();
        if network_errors > self.last_network_errors {
            alerts.push(HealthAlert::NetworkErrors {
                count: network_errors - self.last_network_errors,
            });
            self.last_network_errors = network_errors;
        }

        alerts
    }

    /// Run until cancelled
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.check_interval);
        let mut last_summary = std::time::Instant::now();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            for alert in self.check() {
                warn!("{}: {}", self.name, alert);
            }

            if last_summary.elapsed() >= self.summary_interval {
                info!("{}: {}", self.name, self.health.summary());
                last_summary = std::time::Instant::now();
            }
        }

        info!("{}: {}", self.name, self.health.summary());
    }
}

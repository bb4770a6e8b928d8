//! Media clock for capture timestamps and presentation timing

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use super::types::Timestamp;

/// Shared monotonic time base
///
/// On the sender every capture stage stamps its units from the same clock so
/// video and audio timestamps are directly comparable. On the receiver it is
/// the local time reference the synchronizer and the audio player share.
///
/// The clock is cheap to clone; all clones observe the same base.
#[derive(Clone)]
pub struct MediaClock {
    /// Base instant when the clock started
    base: Arc<Instant>,

    /// Sequence counters handed out per stream
    video_sequence: Arc<AtomicU64>,
    audio_sequence: Arc<AtomicU64>,
    control_sequence: Arc<AtomicU64>,
}

impl MediaClock {
    /// Create a new media clock starting now
    pub fn new() -> Self {
        Self::with_base(Instant::now())
    }

    /// Create a new media clock with a specific base instant
    pub fn with_base(base: Instant) -> Self {
        Self {
            base: Arc::new(base),
            video_sequence: Arc::new(AtomicU64::new(0)),
            audio_sequence: Arc::new(AtomicU64::new(0)),
            control_sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn base(&self) -> Instant {
        *self.base
    }

    /// Current time on this clock
    pub fn now(&self) -> Timestamp {
        Timestamp::from_duration(self.base.elapsed())
    }

    /// Current time in microseconds, for state machines driven by explicit time
    pub fn now_us(&self) -> i64 {
        self.now().micros
    }

    /// Get a timestamp relative to the clock base
    pub fn timestamp_from_instant(&self, instant: Instant) -> Timestamp {
        Timestamp::from_instant(instant, *self.base)
    }

    pub fn elapsed(&self) -> Duration {
        self.base.elapsed()
    }

    /// Next sequence number for video frames
    pub fn next_video_sequence(&self) -> u64 {
        self.video_sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Next sequence number for audio chunks
    pub fn next_audio_sequence(&self) -> u64 {
        self.audio_sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Next sequence number for control messages
    pub fn next_control_sequence(&self) -> u64 {
        self.control_sequence.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for MediaClock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MediaClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaClock")
            .field("elapsed", &self.base.elapsed())
            .field("video_sequence", &self.video_sequence.load(Ordering::Relaxed))
            .field("audio_sequence", &self.audio_sequence.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_clock_basic() {
        let clock = MediaClock::new();
        thread::sleep(Duration::from_millis(10));

        let a = clock.now();
        let b = clock.clone().now();
        assert!(a.micros >= 10_000);
        assert!(b >= a);
    }

    #[test]
    fn test_timestamp_from_instant() {
        let base = Instant::now();
        let clock = MediaClock::with_base(base);
        let ts = clock.timestamp_from_instant(base + Duration::from_millis(33));
        assert_eq!(ts.micros, 33_000);
        // Instants before the base clamp to zero
        assert_eq!(clock.timestamp_from_instant(base).micros, 0);
    }

    #[test]
    fn test_sequences_are_per_stream() {
        let clock = MediaClock::new();
        let shared = clock.clone();

        assert_eq!(clock.next_video_sequence(), 0);
        assert_eq!(shared.next_video_sequence(), 1);
        assert_eq!(clock.next_audio_sequence(), 0);
        assert_eq!(clock.next_video_sequence(), 2);
    }
}

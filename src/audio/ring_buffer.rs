//! Sample ring buffer between a producer and a device clock
//!
//! The writer never overtakes the reader: samples that do not fit are
//! dropped, and the reader gets silence when the buffer runs dry.

use std::sync::Mutex;

struct Ring {
    buffer: Vec<i16>,
    write_pos: usize,
    read_pos: usize,
}

impl Ring {
    fn available(&self) -> usize {
        let capacity = self.buffer.len();
        if self.write_pos >= self.read_pos {
            self.write_pos - self.read_pos
        } else {
            capacity - self.read_pos + self.write_pos
        }
    }
}

/// Interleaved i16 ring buffer shared by a writer and a playback callback
pub struct AudioRingBuffer {
    ring: Mutex<Ring>,
    capacity: usize,
}

impl AudioRingBuffer {
    /// Create a new ring buffer with the given capacity (in samples)
    ///
    /// For stereo 48kHz with 100ms of buffering:
    /// capacity = 48000 * 2 * 0.1 = 9600 samples
    pub fn new(capacity: usize) -> Self {
        // One slot stays empty to tell full from empty
        let capacity = capacity.max(1) + 1;
        Self {
            ring: Mutex::new(Ring {
                buffer: vec![0; capacity],
                write_pos: 0,
                read_pos: 0,
            }),
            capacity,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Ring> {
        self.ring.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Write samples, returning how many fit. Excess samples are dropped.
    pub fn write(&self, samples: &[i16]) -> usize {
        let mut ring = self.lock();
        let free = self.capacity - ring.available() - 1;
        let to_write = samples.len().min(free);

        for &sample in &samples[..to_write] {
            let pos = ring.write_pos;
            ring.buffer[pos] = sample;
            ring.write_pos = (pos + 1) % self.capacity;
        }
        to_write
    }

    /// Fill `output`, padding with silence. Returns the number of real samples.
    pub fn read(&self, output: &mut [i16]) -> usize {
        let mut ring = self.lock();
        let to_read = output.len().min(ring.available());

        for sample in output.iter_mut().take(to_read) {
            let pos = ring.read_pos;
            *sample = ring.buffer[pos];
            ring.read_pos = (pos + 1) % self.capacity;
        }
        output[to_read..].fill(0);
        to_read
    }

    /// Discard up to `count` samples without copying them out
    pub fn skip(&self, count: usize) -> usize {
        let mut ring = self.lock();
        let n = count.min(ring.available());
        ring.read_pos = (ring.read_pos + n) % self.capacity;
        n
    }

    /// Get the number of samples currently in the buffer
    pub fn available(&self) -> usize {
        self.lock().available()
    }
}

//! In-process audio host
//!
//! Devices are plain values: inputs generate a test tone (or silence) paced
//! in real time, outputs drain their queue at the device rate. Devices can be
//! removed while streams are open, which those streams then report as
//! `DeviceLost`.

use log::debug;
use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::{
    AudioDevice, AudioFormat, AudioHost, AudioRingBuffer, Direction, InputStream, OutputStream,
};
use crate::error::StreamError;

/// What a virtual input produces
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Signal {
    Tone { frequency: f32, amplitude: i16 },
    Silence,
}

/// What reached a virtual output
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlaybackLog {
    pub writes: usize,
    pub frames: u64,
    pub format: Option<AudioFormat>,
}

struct VirtualDevice {
    info: AudioDevice,
    /// Supported formats; empty accepts anything
    formats: Vec<AudioFormat>,
    present: Arc<AtomicBool>,
    /// Writes left before the device unplugs itself
    writes_left: Arc<AtomicUsize>,
    signal: Signal,
}

#[derive(Default)]
struct HostState {
    devices: Vec<VirtualDevice>,
    logs: HashMap<String, Arc<Mutex<PlaybackLog>>>,
    next_id: usize,
}

#[derive(Clone, Default)]
pub struct VirtualHost {
    state: Arc<Mutex<HostState>>,
}

impl VirtualHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// A loopback-capable input, a microphone and two outputs
    pub fn with_default_devices() -> Self {
        let host = Self::new();
        host.add_input("Virtual Microphone", true, Signal::Silence);
        host.add_input(
            "Virtual Loopback",
            false,
            Signal::Tone {
                frequency: 440.0,
                amplitude: 8000,
            },
        );
        host.add_output("Virtual Speakers", true, Vec::new());
        host.add_output("Virtual Headphones", false, Vec::new());
        host
    }

    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn add(
        &self,
        name: &str,
        direction: Direction,
        is_default: bool,
        formats: Vec<AudioFormat>,
        signal: Signal,
    ) -> AudioDevice {
        let mut state = self.lock();
        state.next_id += 1;
        let prefix = match direction {
            Direction::Input => "in",
            Direction::Output => "out",
        };
        let info = AudioDevice {
            id: format!("virtual:{}:{}", prefix, state.next_id),
            name: name.to_string(),
            direction,
            is_default,
        };
        if is_default {
            for d in state.devices.iter_mut().filter(|d| d.info.direction == direction) {
                d.info.is_default = false;
            }
        }
        state.devices.push(VirtualDevice {
            info: info.clone(),
            formats,
            present: Arc::new(AtomicBool::new(true)),
            writes_left: Arc::new(AtomicUsize::new(usize::MAX)),
            signal,
        });
        info
    }

    pub fn add_input(&self, name: &str, is_default: bool, signal: Signal) -> AudioDevice {
        self.add(name, Direction::Input, is_default, Vec::new(), signal)
    }

    pub fn add_output(&self, name: &str, is_default: bool, formats: Vec<AudioFormat>) -> AudioDevice {
        self.add(name, Direction::Output, is_default, formats, Signal::Silence)
    }

    /// Unplug a device. Open streams on it fail with `DeviceLost`; if it was
    /// the default, the first remaining device of that direction takes over.
    pub fn remove_device(&self, id: &str) -> bool {
        let mut state = self.lock();
        let Some(pos) = state.devices.iter().position(|d| d.info.id == id) else {
            return false;
        };
        let removed = state.devices.remove(pos);
        removed.present.store(false, Ordering::Release);
        debug!("VirtualHost: removed {}", removed.info.name);

        if removed.info.is_default {
            if let Some(next) = state
                .devices
                .iter_mut()
                .find(|d| d.info.direction == removed.info.direction)
            {
                next.info.is_default = true;
            }
        }
        true
    }

    /// Unplug an output once `writes` more writes went through
    pub fn unplug_after_writes(&self, id: &str, writes: usize) {
        if let Some(d) = self.lock().devices.iter().find(|d| d.info.id == id) {
            d.writes_left.store(writes, Ordering::Release);
        }
    }

    /// Everything written to an output device so far
    pub fn playback_log(&self, id: &str) -> PlaybackLog {
        self.lock()
            .logs
            .get(id)
            .map(|log| log.lock().unwrap_or_else(|p| p.into_inner()).clone())
            .unwrap_or_default()
    }

    fn devices(&self, direction: Direction) -> Vec<AudioDevice> {
        self.lock()
            .devices
            .iter()
            .filter(|d| d.info.direction == direction)
            .map(|d| d.info.clone())
            .collect()
    }

    fn default_device(&self, direction: Direction) -> Option<AudioDevice> {
        self.devices(direction).into_iter().find(|d| d.is_default)
    }
}

impl AudioHost for VirtualHost {
    fn name(&self) -> &str {
        "virtual"
    }

    fn input_devices(&self) -> Result<Vec<AudioDevice>, StreamError> {
        Ok(self.devices(Direction::Input))
    }

    fn output_devices(&self) -> Result<Vec<AudioDevice>, StreamError> {
        Ok(self.devices(Direction::Output))
    }

    fn default_input(&self) -> Option<AudioDevice> {
        self.default_device(Direction::Input)
    }

    fn default_output(&self) -> Option<AudioDevice> {
        self.default_device(Direction::Output)
    }

    fn open_input(
        &self,
        device: &AudioDevice,
        format: AudioFormat,
        chunk_frames: usize,
    ) -> Result<Box<dyn InputStream>, StreamError> {
        let state = self.lock();
        let d = state
            .devices
            .iter()
            .find(|d| d.info.id == device.id && d.info.direction == Direction::Input)
            .ok_or_else(|| StreamError::DeviceUnavailable {
                device: device.name.clone(),
                reason: "no such input device".into(),
            })?;
        // Inputs run at their native format when they have one
        let format = if d.formats.is_empty() || d.formats.contains(&format) {
            format
        } else {
            d.formats[0]
        };
        Ok(Box::new(VirtualInput {
            name: d.info.name.clone(),
            present: d.present.clone(),
            signal: d.signal,
            format,
            chunk_frames: chunk_frames.max(1),
            started: Instant::now(),
            emitted_frames: 0,
        }))
    }

    fn open_output(
        &self,
        device: &AudioDevice,
        format: AudioFormat,
    ) -> Result<Box<dyn OutputStream>, StreamError> {
        let mut state = self.lock();
        let d = state
            .devices
            .iter()
            .find(|d| d.info.id == device.id && d.info.direction == Direction::Output)
            .ok_or_else(|| StreamError::DeviceUnavailable {
                device: device.name.clone(),
                reason: "no such output device".into(),
            })?;
        if !d.formats.is_empty() && !d.formats.contains(&format) {
            return Err(StreamError::DeviceUnavailable {
                device: device.name.clone(),
                reason: format!("format {} not supported", format),
            });
        }
        let name = d.info.name.clone();
        let present = d.present.clone();
        let writes_left = d.writes_left.clone();
        let log = state
            .logs
            .entry(device.id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(PlaybackLog::default())))
            .clone();
        if let Ok(mut l) = log.lock() {
            l.format = Some(format);
        }

        // Four seconds of headroom
        let capacity = format.sample_rate as usize * format.channels as usize * 4;
        Ok(Box::new(VirtualOutput {
            host: self.clone(),
            id: device.id.clone(),
            name,
            present,
            writes_left,
            format,
            queue: AudioRingBuffer::new(capacity),
            last_drain: Cell::new(Instant::now()),
            paused: false,
            log,
        }))
    }
}

struct VirtualInput {
    name: String,
    present: Arc<AtomicBool>,
    signal: Signal,
    format: AudioFormat,
    chunk_frames: usize,
    started: Instant,
    emitted_frames: u64,
}

impl VirtualInput {
    fn generate(&self) -> Vec<i16> {
        let ch = self.format.channels.max(1) as usize;
        match self.signal {
            Signal::Silence => vec![0; self.chunk_frames * ch],
            Signal::Tone {
                frequency,
                amplitude,
            } => {
                let rate = self.format.sample_rate.max(1) as f32;
                let mut out = Vec::with_capacity(self.chunk_frames * ch);
                for i in 0..self.chunk_frames as u64 {
                    let t = (self.emitted_frames + i) as f32 / rate;
                    let v = (t * frequency * std::f32::consts::TAU).sin() * amplitude as f32;
                    out.extend(std::iter::repeat_n(v as i16, ch));
                }
                out
            }
        }
    }
}

impl InputStream for VirtualInput {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn read_chunk(&mut self, timeout: Duration) -> Result<Option<Vec<i16>>, StreamError> {
        if !self.present.load(Ordering::Acquire) {
            return Err(StreamError::DeviceLost {
                device: self.name.clone(),
            });
        }
        let due = self.started + self.format.frames_to_duration(self.emitted_frames + self.chunk_frames as u64);
        let now = Instant::now();
        if due > now + timeout {
            std::thread::sleep(timeout);
            return Ok(None);
        }
        if due > now {
            std::thread::sleep(due - now);
        }
        if !self.present.load(Ordering::Acquire) {
            return Err(StreamError::DeviceLost {
                device: self.name.clone(),
            });
        }
        let chunk = self.generate();
        self.emitted_frames += self.chunk_frames as u64;
        Ok(Some(chunk))
    }
}

struct VirtualOutput {
    host: VirtualHost,
    id: String,
    name: String,
    present: Arc<AtomicBool>,
    writes_left: Arc<AtomicUsize>,
    format: AudioFormat,
    queue: AudioRingBuffer,
    last_drain: Cell<Instant>,
    paused: bool,
    log: Arc<Mutex<PlaybackLog>>,
}

impl VirtualOutput {
    /// Consume whatever the device would have played since the last call
    fn drain(&self) {
        let now = Instant::now();
        if self.paused {
            self.last_drain.set(now);
            return;
        }
        let elapsed = now.saturating_duration_since(self.last_drain.get());
        let frames = elapsed.as_micros() as u64 * self.format.sample_rate as u64 / 1_000_000;
        if frames == 0 {
            return;
        }
        let ch = self.format.channels.max(1) as usize;
        let played = self.queue.skip(frames as usize * ch);
        if played < frames as usize * ch {
            // Underrun: the device idled, no credit carries over
            self.last_drain.set(now);
        } else {
            self.last_drain
                .set(self.last_drain.get() + self.format.frames_to_duration(frames));
        }
    }
}

impl OutputStream for VirtualOutput {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn write(&mut self, samples: &[i16]) -> Result<(), StreamError> {
        match self.writes_left.load(Ordering::Acquire) {
            0 => {
                self.host.remove_device(&self.id);
            }
            usize::MAX => {}
            n => self.writes_left.store(n - 1, Ordering::Release),
        }
        if !self.present.load(Ordering::Acquire) {
            return Err(StreamError::DeviceLost {
                device: self.name.clone(),
            });
        }
        self.drain();
        let written = self.queue.write(samples);
        let mut log = self.log.lock().unwrap_or_else(|p| p.into_inner());
        log.writes += 1;
        log.frames += (written / self.format.channels.max(1) as usize) as u64;
        Ok(())
    }

    fn queued_frames(&self) -> usize {
        self.drain();
        self.queue.available() / self.format.channels.max(1) as usize
    }

    fn set_paused(&mut self, paused: bool) {
        self.drain();
        self.paused = paused;
        self.last_drain.set(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_devices() {
        let host = VirtualHost::with_default_devices();
        assert_eq!(host.input_devices().unwrap().len(), 2);
        assert_eq!(
            host.default_output().map(|d| d.name),
            Some("Virtual Speakers".to_string())
        );
    }

    #[test]
    fn test_input_paced_and_lost_on_removal() {
        let host = VirtualHost::new();
        let mic = host.add_input(
            "Mic",
            true,
            Signal::Tone {
                frequency: 440.0,
                amplitude: 1000,
            },
        );
        let mut input = host
            .open_input(&mic, AudioFormat::new(8000, 1), 80)
            .unwrap();

        let started = Instant::now();
        let chunk = input.read_chunk(Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(chunk.len(), 80);
        assert!(started.elapsed() >= Duration::from_millis(9));
        assert!(chunk.iter().any(|&s| s != 0));

        host.remove_device(&mic.id);
        assert!(matches!(
            input.read_chunk(Duration::from_secs(1)),
            Err(StreamError::DeviceLost { .. })
        ));
    }

    #[test]
    fn test_output_drains_in_real_time() {
        let host = VirtualHost::new();
        let out = host.add_output("Speakers", true, Vec::new());
        let mut stream = host.open_output(&out, AudioFormat::new(1000, 1)).unwrap();

        stream.write(&[1; 100]).unwrap();
        assert!(stream.queued_frames() > 80);
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(stream.queued_frames(), 0);

        let log = host.playback_log(&out.id);
        assert_eq!(log.writes, 1);
        assert_eq!(log.frames, 100);
    }

    #[test]
    fn test_unsupported_format_and_default_promotion() {
        let host = VirtualHost::new();
        let a = host.add_output("A", true, vec![AudioFormat::new(48000, 2)]);
        host.add_output("B", false, Vec::new());

        assert!(matches!(
            host.open_output(&a, AudioFormat::new(44100, 2)),
            Err(StreamError::DeviceUnavailable { .. })
        ));
        assert!(host.open_output(&a, AudioFormat::new(48000, 2)).is_ok());

        assert!(host.remove_device(&a.id));
        assert_eq!(host.default_output().map(|d| d.name), Some("B".to_string()));
        assert!(!host.remove_device(&a.id));
    }
}

//! Audio host backed by cpal
//!
//! cpal streams are not `Send` on every platform, so each open stream lives
//! on its own thread and talks to the pipeline through channels.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use log::{error, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::thread;
use std::time::Duration;

use super::{
    AudioDevice, AudioFormat, AudioHost, AudioRingBuffer, Direction, InputStream, OutputStream,
};
use crate::error::StreamError;

#[derive(Default)]
pub struct CpalHost;

impl CpalHost {
    pub fn new() -> Self {
        Self
    }
}

#[allow(deprecated)]
fn device_name(device: &cpal::Device) -> Option<String> {
    device.name().ok()
}

fn device_id(direction: Direction, name: &str) -> String {
    match direction {
        Direction::Input => format!("cpal:in:{}", name),
        Direction::Output => format!("cpal:out:{}", name),
    }
}

fn describe(direction: Direction, device: &cpal::Device, default: &Option<String>) -> Option<AudioDevice> {
    let name = device_name(device)?;
    Some(AudioDevice {
        id: device_id(direction, &name),
        is_default: default.as_deref() == Some(name.as_str()),
        name,
        direction,
    })
}

fn find(direction: Direction, wanted: &AudioDevice) -> Result<cpal::Device, StreamError> {
    let host = cpal::default_host();
    let devices = match direction {
        Direction::Input => host.input_devices(),
        Direction::Output => host.output_devices(),
    }
    .map_err(|e| StreamError::DeviceUnavailable {
        device: wanted.name.clone(),
        reason: e.to_string(),
    })?;

    for device in devices {
        if device_name(&device).is_some_and(|n| device_id(direction, &n) == wanted.id || n == wanted.name) {
            return Ok(device);
        }
    }
    Err(StreamError::DeviceUnavailable {
        device: wanted.name.clone(),
        reason: "device not found".into(),
    })
}

fn stream_config(format: AudioFormat) -> cpal::StreamConfig {
    cpal::StreamConfig {
        channels: format.channels,
        sample_rate: format.sample_rate,
        buffer_size: cpal::BufferSize::Default,
    }
}

impl AudioHost for CpalHost {
    fn name(&self) -> &str {
        "cpal"
    }

    fn input_devices(&self) -> Result<Vec<AudioDevice>, StreamError> {
        let host = cpal::default_host();
        let default = host.default_input_device().and_then(|d| device_name(&d));
        let devices = host
            .input_devices()
            .map_err(|e| StreamError::DeviceUnavailable {
                device: "inputs".into(),
                reason: e.to_string(),
            })?;
        Ok(devices
            .filter_map(|d| describe(Direction::Input, &d, &default))
            .collect())
    }

    fn output_devices(&self) -> Result<Vec<AudioDevice>, StreamError> {
        let host = cpal::default_host();
        let default = host.default_output_device().and_then(|d| device_name(&d));
        let devices = host
            .output_devices()
            .map_err(|e| StreamError::DeviceUnavailable {
                device: "outputs".into(),
                reason: e.to_string(),
            })?;
        Ok(devices
            .filter_map(|d| describe(Direction::Output, &d, &default))
            .collect())
    }

    fn default_input(&self) -> Option<AudioDevice> {
        let device = cpal::default_host().default_input_device()?;
        let name = device_name(&device)?;
        describe(Direction::Input, &device, &Some(name))
    }

    fn default_output(&self) -> Option<AudioDevice> {
        let device = cpal::default_host().default_output_device()?;
        let name = device_name(&device)?;
        describe(Direction::Output, &device, &Some(name))
    }

    fn open_input(
        &self,
        device: &AudioDevice,
        format: AudioFormat,
        chunk_frames: usize,
    ) -> Result<Box<dyn InputStream>, StreamError> {
        let wanted = device.clone();
        let lost = Arc::new(AtomicBool::new(false));
        let (sample_tx, sample_rx) = std_mpsc::sync_channel::<Vec<i16>>(256);
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<AudioFormat, StreamError>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let thread_lost = lost.clone();
        thread::spawn(move || {
            let open = || -> Result<(cpal::Stream, AudioFormat), StreamError> {
                let dev = find(Direction::Input, &wanted)?;
                // Prefer the device's own format
                let native = dev
                    .default_input_config()
                    .map(|c| AudioFormat::new(c.sample_rate(), c.channels()))
                    .unwrap_or(format);
                let err_lost = thread_lost.clone();
                let stream = dev
                    .build_input_stream(
                        &stream_config(native),
                        move |data: &[f32], _: &cpal::InputCallbackInfo| {
                            let samples: Vec<i16> = data
                                .iter()
                                .map(|s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
                                .collect();
                            let _ = sample_tx.try_send(samples);
                        },
                        move |err| {
                            error!("Audio input stream error: {}", err);
                            if matches!(err, cpal::StreamError::DeviceNotAvailable) {
                                err_lost.store(true, Ordering::Release);
                            }
                        },
                        None,
                    )
                    .map_err(|e| StreamError::DeviceUnavailable {
                        device: wanted.name.clone(),
                        reason: e.to_string(),
                    })?;
                stream.play().map_err(|e| StreamError::DeviceUnavailable {
                    device: wanted.name.clone(),
                    reason: e.to_string(),
                })?;
                Ok((stream, native))
            };

            match open() {
                Ok((stream, native)) => {
                    let _ = ready_tx.send(Ok(native));
                    info!("Audio capture started on {} ({})", wanted.name, native);
                    // Held until the InputStream is dropped
                    let _ = stop_rx.recv();
                    drop(stream);
                    info!("Audio capture stopped on {}", wanted.name);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            }
        });

        let native = ready_rx
            .recv()
            .map_err(|_| StreamError::DeviceUnavailable {
                device: device.name.clone(),
                reason: "capture thread exited".into(),
            })??;

        Ok(Box::new(CpalInput {
            name: device.name.clone(),
            format: native,
            chunk_samples: chunk_frames.max(1) * native.channels as usize,
            pending: Vec::new(),
            samples: sample_rx,
            lost,
            _stop: stop_tx,
        }))
    }

    fn open_output(
        &self,
        device: &AudioDevice,
        format: AudioFormat,
    ) -> Result<Box<dyn OutputStream>, StreamError> {
        let wanted = device.clone();
        let lost = Arc::new(AtomicBool::new(false));
        let paused = Arc::new(AtomicBool::new(false));
        // Two seconds of buffering
        let queue = Arc::new(AudioRingBuffer::new(
            format.sample_rate as usize * format.channels as usize * 2,
        ));
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), StreamError>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let (thread_lost, thread_paused, thread_queue) = (lost.clone(), paused.clone(), queue.clone());
        thread::spawn(move || {
            let open = || -> Result<cpal::Stream, StreamError> {
                let dev = find(Direction::Output, &wanted)?;
                let err_lost = thread_lost.clone();
                let mut scratch: Vec<i16> = Vec::new();
                let stream = dev
                    .build_output_stream(
                        &stream_config(format),
                        move |output: &mut [f32], _: &cpal::OutputCallbackInfo| {
                            if thread_paused.load(Ordering::Acquire) {
                                output.fill(0.0);
                                return;
                            }
                            scratch.resize(output.len(), 0);
                            thread_queue.read(&mut scratch);
                            for (o, s) in output.iter_mut().zip(&scratch) {
                                *o = *s as f32 / i16::MAX as f32;
                            }
                        },
                        move |err| {
                            error!("Audio output stream error: {}", err);
                            if matches!(err, cpal::StreamError::DeviceNotAvailable) {
                                err_lost.store(true, Ordering::Release);
                            }
                        },
                        None,
                    )
                    .map_err(|e| StreamError::DeviceUnavailable {
                        device: wanted.name.clone(),
                        reason: e.to_string(),
                    })?;
                stream.play().map_err(|e| StreamError::DeviceUnavailable {
                    device: wanted.name.clone(),
                    reason: e.to_string(),
                })?;
                Ok(stream)
            };

            match open() {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    let _ = stop_rx.recv();
                    drop(stream);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            }
        });

        ready_rx
            .recv()
            .map_err(|_| StreamError::DeviceUnavailable {
                device: device.name.clone(),
                reason: "playback thread exited".into(),
            })??;

        Ok(Box::new(CpalOutput {
            name: device.name.clone(),
            format,
            queue,
            lost,
            paused,
            _stop: stop_tx,
        }))
    }
}

struct CpalInput {
    name: String,
    format: AudioFormat,
    chunk_samples: usize,
    pending: Vec<i16>,
    samples: std_mpsc::Receiver<Vec<i16>>,
    lost: Arc<AtomicBool>,
    _stop: std_mpsc::Sender<()>,
}

impl InputStream for CpalInput {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn read_chunk(&mut self, timeout: Duration) -> Result<Option<Vec<i16>>, StreamError> {
        while self.pending.len() < self.chunk_samples {
            if self.lost.load(Ordering::Acquire) {
                return Err(StreamError::DeviceLost {
                    device: self.name.clone(),
                });
            }
            match self.samples.recv_timeout(timeout) {
                Ok(block) => self.pending.extend_from_slice(&block),
                Err(std_mpsc::RecvTimeoutError::Timeout) => return Ok(None),
                Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(StreamError::DeviceLost {
                        device: self.name.clone(),
                    });
                }
            }
        }
        let rest = self.pending.split_off(self.chunk_samples);
        Ok(Some(std::mem::replace(&mut self.pending, rest)))
    }
}

struct CpalOutput {
    name: String,
    format: AudioFormat,
    queue: Arc<AudioRingBuffer>,
    lost: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    _stop: std_mpsc::Sender<()>,
}

impl OutputStream for CpalOutput {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn write(&mut self, samples: &[i16]) -> Result<(), StreamError> {
        if self.lost.load(Ordering::Acquire) {
            return Err(StreamError::DeviceLost {
                device: self.name.clone(),
            });
        }
        let written = self.queue.write(samples);
        if written < samples.len() {
            warn!(
                "Audio output buffer full, dropped {} samples",
                samples.len() - written
            );
        }
        Ok(())
    }

    fn queued_frames(&self) -> usize {
        self.queue.available() / self.format.channels.max(1) as usize
    }

    fn set_paused(&mut self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }
}

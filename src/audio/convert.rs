//! PCM format conversion for the playback path

use super::AudioFormat;

/// Up- or down-mix interleaved samples to `to` channels
///
/// Mono is duplicated when widening; when narrowing, channels are averaged.
pub fn remix(samples: &[i16], from: u16, to: u16) -> Vec<i16> {
    let (from, to) = (from.max(1) as usize, to.max(1) as usize);
    if from == to {
        return samples.to_vec();
    }
    let frames = samples.len() / from;
    let mut out = Vec::with_capacity(frames * to);

    for frame in samples.chunks_exact(from) {
        if to < from {
            // Average groups of source channels into each target channel
            if to == 1 {
                let sum: i32 = frame.iter().map(|&s| s as i32).sum();
                out.push((sum / from as i32) as i16);
            } else {
                for c in 0..to {
                    out.push(frame[c.min(from - 1)]);
                }
            }
        } else if from == 1 {
            out.extend(std::iter::repeat_n(frame[0], to));
        } else {
            out.extend_from_slice(frame);
            // Extra channels repeat the last source channel
            out.extend(std::iter::repeat_n(frame[from - 1], to - from));
        }
    }
    out
}

/// Linear-interpolation resampler for interleaved samples
pub fn resample(samples: &[i16], channels: u16, from_rate: u32, to_rate: u32) -> Vec<i16> {
    let ch = channels.max(1) as usize;
    if from_rate == to_rate || from_rate == 0 || to_rate == 0 || samples.len() < ch {
        return samples.to_vec();
    }
    let in_frames = samples.len() / ch;
    let out_frames = (in_frames as u64 * to_rate as u64 / from_rate as u64) as usize;
    let step = from_rate as f64 / to_rate as f64;
    let mut out = Vec::with_capacity(out_frames * ch);

    for i in 0..out_frames {
        let pos = i as f64 * step;
        let idx = pos as usize;
        let frac = pos - idx as f64;
        let next = (idx + 1).min(in_frames - 1);
        for c in 0..ch {
            let a = samples[idx * ch + c] as f64;
            let b = samples[next * ch + c] as f64;
            out.push((a + (b - a) * frac).round() as i16);
        }
    }
    out
}

/// Convert samples from one layout to another
pub fn convert(samples: &[i16], from: AudioFormat, to: AudioFormat) -> Vec<i16> {
    let mixed = remix(samples, from.channels, to.channels);
    resample(&mixed, to.channels, from.sample_rate, to.sample_rate)
}

/// Scale samples by a 0.0-1.0 gain
pub fn apply_volume(samples: &mut [i16], volume: f32) {
    if volume >= 1.0 {
        return;
    }
    for s in samples.iter_mut() {
        *s = (*s as f32 * volume).round() as i16;
    }
}

/// Peak absolute amplitude
pub fn peak(samples: &[i16]) -> u16 {
    samples.iter().map(|s| s.unsigned_abs()).max().unwrap_or(0)
}

//! PCM sample pipeline
//!
//! Buffers incoming samples in the encoder's internal ±32768 float
//! domain, applying the user rescale and the stereo-to-mono downmix on
//! the way in. The buffer keeps enough history for the psychoacoustic
//! FFT window and the polyphase filter to look behind the granule being
//! coded.

use crate::config::SessionConfig;
use crate::types::MAX_CHANNELS;

#[derive(Debug, Default)]
pub struct SampleBuffer {
    mf: [Vec<f32>; MAX_CHANNELS],
}

impl SampleBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Samples currently buffered per channel
    pub fn len(&self) -> usize {
        self.mf[0].len()
    }

    pub fn is_empty(&self) -> bool {
        self.mf[0].is_empty()
    }

    pub fn channel(&self, ch: usize) -> &[f32] {
        &self.mf[ch.min(MAX_CHANNELS - 1)]
    }

    /// Append samples already converted to the ±32768 domain, applying
    /// rescale and, if the session is mono with two input channels, the
    /// downmix.
    pub fn append(&mut self, cfg: &SessionConfig, left: &[f32], right: &[f32]) {
        let scale = cfg.scale;
        let scale_l = cfg.scale_left;
        let scale_r = cfg.scale_right;

        if cfg.channels_in == 2 && cfg.channels_out == 1 {
            for (&l, &r) in left.iter().zip(right.iter()) {
                let l = l * scale * scale_l;
                let r = r * scale * scale_r;
                self.mf[0].push(0.5 * (l + r));
            }
            // the analysis code reads both lanes even in mono
            let start = self.mf[0].len() - left.len();
            let tail: Vec<f32> = self.mf[0][start..].to_vec();
            self.mf[1].extend(tail);
        } else if cfg.channels_out == 2 {
            for &l in left {
                self.mf[0].push(l * scale * scale_l);
            }
            for &r in right {
                self.mf[1].push(r * scale * scale_r);
            }
        } else {
            for &l in left {
                let v = l * scale * scale_l;
                self.mf[0].push(v);
                self.mf[1].push(v);
            }
        }
    }

    /// Drop `n` consumed samples from the front
    pub fn shift(&mut self, n: usize) {
        for ch in &mut self.mf {
            ch.drain(..n.min(ch.len()));
        }
    }
}

/// i16 samples are the native domain
pub fn from_i16(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32).collect()
}

/// i32 samples scale down to ±32768
pub fn from_i32(samples: &[i32]) -> Vec<f32> {
    const SCALE: f32 = 1.0 / 65536.0;
    samples.iter().map(|&s| s as f32 * SCALE).collect()
}

/// i64 samples scale down to ±32768
pub fn from_i64(samples: &[i64]) -> Vec<f32> {
    const SCALE: f64 = 1.0 / 281_474_976_710_656.0; // 2^48
    samples.iter().map(|&s| (s as f64 * SCALE) as f32).collect()
}

/// f32 samples in ±1.0 scale up to ±32768
pub fn from_f32(samples: &[f32]) -> Vec<f32> {
    samples.iter().map(|&s| s * 32768.0).collect()
}

/// Split an interleaved buffer into channel lanes
pub fn deinterleave(samples: &[i16]) -> (Vec<f32>, Vec<f32>) {
    let mut left = Vec::with_capacity(samples.len() / 2);
    let mut right = Vec::with_capacity(samples.len() / 2);
    for pair in samples.chunks_exact(2) {
        left.push(pair[0] as f32);
        right.push(pair[1] as f32);
    }
    (left, right)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, Mode};

    #[test]
    fn conversions_land_in_the_same_domain() {
        assert_eq!(from_i16(&[16384])[0], 16384.0);
        assert!((from_i32(&[1 << 30])[0] - 16384.0).abs() < 1.0);
        assert!((from_i64(&[1 << 62])[0] - 16384.0).abs() < 1.0);
        assert!((from_f32(&[0.5])[0] - 16384.0).abs() < 1.0);
    }

    #[test]
    fn downmix_averages_channels() {
        let cfg = Config {
            num_channels: 2,
            mode: Mode::Mono,
            bitrate: 64,
            ..Default::default()
        }
        .resolve()
        .unwrap();
        let mut buf = SampleBuffer::new();
        buf.append(&cfg, &[1000.0, 2000.0], &[3000.0, -2000.0]);
        assert_eq!(buf.channel(0), &[2000.0, 0.0]);
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn scale_applies_per_channel() {
        let cfg = Config {
            scale: 2.0,
            scale_left: 0.5,
            bitrate: 128,
            ..Default::default()
        }
        .resolve()
        .unwrap();
        let mut buf = SampleBuffer::new();
        buf.append(&cfg, &[100.0], &[100.0]);
        assert_eq!(buf.channel(0), &[100.0]);
        assert_eq!(buf.channel(1), &[200.0]);
    }

    #[test]
    fn shift_discards_the_front() {
        let cfg = Config::default().resolve().unwrap();
        let mut buf = SampleBuffer::new();
        buf.append(&cfg, &[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]);
        buf.shift(2);
        assert_eq!(buf.channel(0), &[3.0]);
        assert_eq!(buf.channel(1), &[6.0]);
    }

    #[test]
    fn deinterleave_splits_pairs() {
        let (l, r) = deinterleave(&[1, 2, 3, 4]);
        assert_eq!(l, vec![1.0, 3.0]);
        assert_eq!(r, vec![2.0, 4.0]);
    }
}

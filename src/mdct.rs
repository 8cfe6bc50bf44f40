//! Polyphase filterbank and block-switched MDCT
//!
//! PCM enters through the 32-band polyphase analysis filter (512-tap
//! window, 18 output vectors per granule). Each subband's 18 previous and
//! 18 current samples are then windowed by the block type the
//! psychoacoustic model selected and transformed to 576 spectral lines:
//! one 36-point MDCT for the long types, three 12-point MDCTs for short
//! blocks. Long blocks finish with the aliasing reduction butterflies of
//! ISO Table B.9; short block coefficients are reordered so each
//! scalefactor band carries its three windows consecutively.

use crate::tables::ENWINDOW;
use crate::types::{BlockType, GRANULE_SIZE, HAN_SIZE, MAX_CHANNELS, SBLIMIT, SBMAX_S};

/// Aliasing reduction coefficients, Table B.9
const ALIAS_C: [f64; 8] = [-0.6, -0.535, -0.33, -0.185, -0.095, -0.041, -0.0142, -0.0037];

#[derive(Clone)]
pub struct Filterbank {
    /// Windowing ring buffer per channel, newest 32 samples at `off`
    x: [[f32; HAN_SIZE]; MAX_CHANNELS],
    off: [usize; MAX_CHANNELS],
    /// Analysis filter matrix
    fl: [[f32; 64]; SBLIMIT],
    /// Previous granule's subband samples, the MDCT overlap half
    sb_prev: [[[f32; SBLIMIT]; 18]; MAX_CHANNELS],
    win_norm: [f32; 36],
    win_start: [f32; 36],
    win_stop: [f32; 36],
    win_short: [f32; 12],
    cos_long: [[f32; 36]; 18],
    cos_short: [[f32; 12]; 6],
    ca: [f32; 8],
    cs: [f32; 8],
}

impl std::fmt::Debug for Filterbank {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filterbank").finish_non_exhaustive()
    }
}

impl Filterbank {
    pub fn new() -> Self {
        use std::f64::consts::PI;

        let mut fl = [[0.0f32; 64]; SBLIMIT];
        for (i, row) in fl.iter_mut().enumerate() {
            for (j, v) in row.iter_mut().enumerate() {
                // rounded to the 9 decimal places of the ISO tables
                let c = ((2 * i + 1) as f64 * (16 - j as i32) as f64 * (PI / 64.0)).cos();
                *v = ((c * 1e9).round() * 1e-9) as f32;
            }
        }

        let mut win_norm = [0.0f32; 36];
        let mut win_start = [0.0f32; 36];
        let mut win_stop = [0.0f32; 36];
        for k in 0..36 {
            let long = (PI / 36.0 * (k as f64 + 0.5)).sin();
            win_norm[k] = long as f32;
            win_start[k] = match k {
                0..=17 => long as f32,
                18..=23 => 1.0,
                24..=29 => (PI / 12.0 * (k as f64 - 18.0 + 0.5)).sin() as f32,
                _ => 0.0,
            };
            // time reverse of the start window
            win_stop[k] = match k {
                0..=5 => 0.0,
                6..=11 => (PI / 12.0 * (k as f64 - 6.0 + 0.5)).sin() as f32,
                12..=17 => 1.0,
                _ => long as f32,
            };
        }
        let mut win_short = [0.0f32; 12];
        for (k, w) in win_short.iter_mut().enumerate() {
            *w = (PI / 12.0 * (k as f64 + 0.5)).sin() as f32;
        }

        let mut cos_long = [[0.0f32; 36]; 18];
        for (m, row) in cos_long.iter_mut().enumerate() {
            for (k, v) in row.iter_mut().enumerate() {
                *v = (PI / 72.0 * (2 * k + 19) as f64 * (2 * m + 1) as f64).cos() as f32;
            }
        }
        let mut cos_short = [[0.0f32; 12]; 6];
        for (m, row) in cos_short.iter_mut().enumerate() {
            for (k, v) in row.iter_mut().enumerate() {
                *v = (PI / 24.0 * (2 * k + 7) as f64 * (2 * m + 1) as f64).cos() as f32;
            }
        }

        let mut ca = [0.0f32; 8];
        let mut cs = [0.0f32; 8];
        for (i, &c) in ALIAS_C.iter().enumerate() {
            let sq = 1.0 / (1.0 + c * c).sqrt();
            cs[i] = sq as f32;
            ca[i] = (c * sq) as f32;
        }

        Self {
            x: [[0.0; HAN_SIZE]; MAX_CHANNELS],
            off: [0; MAX_CHANNELS],
            fl,
            sb_prev: [[[0.0; SBLIMIT]; 18]; MAX_CHANNELS],
            win_norm,
            win_start,
            win_stop,
            win_short,
            cos_long,
            cos_short,
            ca,
            cs,
        }
    }

    /// One filterbank step: 32 new samples in, 32 subband samples out
    fn window_filter(&mut self, ch: usize, samples: &[f32], s: &mut [f32; SBLIMIT]) {
        // the ring runs backwards in time: x[off + t] is the sample from
        // t steps ago, so the 32 new samples land reversed
        let off = self.off[ch];
        for (i, &smp) in samples.iter().take(32).enumerate() {
            self.x[ch][(off + 31 - i) & (HAN_SIZE - 1)] = smp;
        }

        let mut y = [0.0f32; 64];
        for (i, yi) in y.iter_mut().enumerate() {
            let mut acc = 0.0f32;
            for j in 0..8 {
                acc += self.x[ch][(off + i + (j << 6)) & (HAN_SIZE - 1)] * ENWINDOW[i + (j << 6)];
            }
            *yi = acc;
        }
        // the ring moves backwards through the window
        self.off[ch] = (off + HAN_SIZE - 32) & (HAN_SIZE - 1);

        for (i, si) in s.iter_mut().enumerate() {
            let mut acc = 0.0f32;
            for j in 0..64 {
                acc += self.fl[i][j] * y[j];
            }
            *si = acc;
        }
    }

    /// Transform one granule of one channel into 576 spectral lines.
    /// `samples` holds the granule's 576 PCM samples; `sfb_short` is the
    /// short band table used to reorder short block output.
    pub fn process_granule(
        &mut self,
        ch: usize,
        samples: &[f32],
        block_type: BlockType,
        sfb_short: &[usize; SBMAX_S + 1],
        xr: &mut [f32; GRANULE_SIZE],
    ) {
        debug_assert!(samples.len() >= GRANULE_SIZE);

        let mut sb_cur = [[0.0f32; SBLIMIT]; 18];
        for k in 0..18 {
            let mut s = [0.0f32; SBLIMIT];
            self.window_filter(ch, &samples[k * 32..(k + 1) * 32], &mut s);
            // compensate the frequency inversion of the analysis filter
            if k & 1 == 1 {
                for band in (1..SBLIMIT).step_by(2) {
                    s[band] = -s[band];
                }
            }
            sb_cur[k] = s;
        }

        match block_type {
            BlockType::Short => {
                // three 12-point transforms per subband, then regroup so
                // every scalefactor band holds its windows consecutively
                let mut sr = [[0.0f32; 192]; 3];
                let mut z = [0.0f32; 36];
                for band in 0..SBLIMIT {
                    for k in 0..18 {
                        z[k] = self.sb_prev[ch][k][band];
                        z[k + 18] = sb_cur[k][band];
                    }
                    for (w, srw) in sr.iter_mut().enumerate() {
                        let zw = &z[6 + 6 * w..18 + 6 * w];
                        for m in 0..6 {
                            let mut acc = 0.0f32;
                            for k in 0..12 {
                                acc += zw[k] * self.win_short[k] * self.cos_short[m][k];
                            }
                            srw[band * 6 + m] = acc;
                        }
                    }
                }
                let mut j = 0usize;
                for sfb in 0..SBMAX_S {
                    for srw in &sr {
                        for f in sfb_short[sfb]..sfb_short[sfb + 1] {
                            xr[j] = srw[f];
                            j += 1;
                        }
                    }
                }
                debug_assert_eq!(j, GRANULE_SIZE);
            }
            _ => {
                let win = match block_type {
                    BlockType::Start => &self.win_start,
                    BlockType::Stop => &self.win_stop,
                    _ => &self.win_norm,
                };
                let mut z = [0.0f32; 36];
                for band in 0..SBLIMIT {
                    for k in 0..18 {
                        z[k] = self.sb_prev[ch][k][band] * win[k];
                        z[k + 18] = sb_cur[k][band] * win[k + 18];
                    }
                    for m in 0..18 {
                        let mut acc = 0.0f32;
                        for (k, &zk) in z.iter().enumerate() {
                            acc += zk * self.cos_long[m][k];
                        }
                        xr[band * 18 + m] = acc;
                    }
                }

                // aliasing reduction butterflies across subband borders
                for band in 1..SBLIMIT {
                    let base = band * 18;
                    for k in 0..8 {
                        let a = xr[base - 1 - k];
                        let b = xr[base + k];
                        xr[base - 1 - k] = a * self.cs[k] - b * self.ca[k];
                        xr[base + k] = a * self.ca[k] + b * self.cs[k];
                    }
                }
            }
        }

        self.sb_prev[ch] = sb_cur;
    }
}

impl Default for Filterbank {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::SFB_SHORT;

    #[test]
    fn silence_transforms_to_silence() {
        let mut fb = Filterbank::new();
        let samples = [0.0f32; GRANULE_SIZE];
        let mut xr = [1.0f32; GRANULE_SIZE];
        fb.process_granule(0, &samples, BlockType::Norm, &SFB_SHORT[0], &mut xr);
        assert!(xr.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn sine_energy_lands_in_the_right_subband() {
        let mut fb = Filterbank::new();
        // subband width is fs/64; aim at the center of subband 4
        let freq_frac = (4.0 + 0.5) / 64.0;
        let gen = |base: usize| -> Vec<f32> {
            (0..GRANULE_SIZE)
                .map(|i| {
                    (2.0 * std::f64::consts::PI * freq_frac * (base + i) as f64).sin() as f32
                        * 10000.0
                })
                .collect()
        };
        let mut xr = [0.0f32; GRANULE_SIZE];
        // run several granules so the window history fills
        for g in 0..4 {
            let samples = gen(g * GRANULE_SIZE);
            fb.process_granule(0, &samples, BlockType::Norm, &SFB_SHORT[0], &mut xr);
        }
        let band_energy: Vec<f32> = (0..SBLIMIT)
            .map(|b| xr[b * 18..(b + 1) * 18].iter().map(|v| v * v).sum())
            .collect();
        let peak = band_energy
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .unwrap()
            .0;
        assert!((3..=5).contains(&peak), "peak in subband {peak}");
    }

    #[test]
    fn short_blocks_fill_all_lines() {
        let mut fb = Filterbank::new();
        let samples: Vec<f32> = (0..GRANULE_SIZE).map(|i| ((i * 7) % 100) as f32).collect();
        let mut xr = [f32::NAN; GRANULE_SIZE];
        fb.process_granule(0, &samples, BlockType::Short, &SFB_SHORT[0], &mut xr);
        assert!(xr.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn windows_satisfy_the_overlap_transitions() {
        let fb = Filterbank::new();
        // start window: long rise, flat middle, short fall, zero tail
        assert_eq!(fb.win_start[20], 1.0);
        assert_eq!(fb.win_start[35], 0.0);
        assert_eq!(fb.win_stop[0], 0.0);
        assert_eq!(fb.win_stop[14], 1.0);
        // start and stop are time reverses of each other
        for k in 0..36 {
            assert!((fb.win_start[k] - fb.win_stop[35 - k]).abs() < 1e-6);
        }
    }
}

//! FFT front-end for the psychoacoustic model
//!
//! Each granule is analyzed with one 1024-point FFT over a Blackman window
//! centered on the granule, and three 256-point FFTs covering its short
//! windows. Mid/side spectra are derived from the left/right spectra
//! directly in the frequency domain.

use realfft::num_complex::Complex;
use realfft::{RealFftPlanner, RealToComplex};
use std::sync::Arc;

use crate::types::{BLKSIZE, BLKSIZE_S, HBLKSIZE, HBLKSIZE_S, SQRT2};

pub struct FftEngine {
    plan_long: Arc<dyn RealToComplex<f32>>,
    plan_short: Arc<dyn RealToComplex<f32>>,
    window_long: Vec<f32>,
    window_short: Vec<f32>,
    input: Vec<f32>,
    scratch: Vec<Complex<f32>>,
    /// Long spectra per psy channel slot (0/1 hold L/R, overwritten by M/S)
    spec_long: [Vec<Complex<f32>>; 2],
    /// Short spectra per slot and window
    spec_short: [[Vec<Complex<f32>>; 3]; 2],
}

impl std::fmt::Debug for FftEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FftEngine").finish_non_exhaustive()
    }
}

impl FftEngine {
    pub fn new() -> Self {
        let mut planner = RealFftPlanner::<f32>::new();
        let plan_long = planner.plan_fft_forward(BLKSIZE);
        let plan_short = planner.plan_fft_forward(BLKSIZE_S);

        let window_long = blackman(BLKSIZE);
        let window_short = blackman(BLKSIZE_S);

        let scratch_len = plan_long
            .get_scratch_len()
            .max(plan_short.get_scratch_len());
        let spec_l = plan_long.make_output_vec();
        let spec_s = plan_short.make_output_vec();

        Self {
            plan_long,
            plan_short,
            window_long,
            window_short,
            input: vec![0.0; BLKSIZE],
            scratch: vec![Complex::default(); scratch_len],
            spec_long: [spec_l.clone(), spec_l],
            spec_short: [
                [spec_s.clone(), spec_s.clone(), spec_s.clone()],
                [spec_s.clone(), spec_s.clone(), spec_s.clone()],
            ],
        }
    }

    /// Long transform of `samples[0..1024]` into channel slot `ch`
    pub fn transform_long(&mut self, ch: usize, samples: &[f32]) {
        for (x, (&s, &w)) in self
            .input
            .iter_mut()
            .zip(samples[..BLKSIZE].iter().zip(self.window_long.iter()))
        {
            *x = s * w;
        }
        self.plan_long
            .process_with_scratch(&mut self.input, &mut self.spec_long[ch], &mut self.scratch)
            .expect("fft buffer sizes are fixed");
    }

    /// Three short transforms into channel slot `ch`. Window `b` covers
    /// `samples[192*(b+1) .. 192*(b+1)+256]`.
    pub fn transform_short(&mut self, ch: usize, samples: &[f32]) {
        for b in 0..3 {
            let start = (576 / 3) * (b + 1);
            for (x, (&s, &w)) in self.input[..BLKSIZE_S].iter_mut().zip(
                samples[start..start + BLKSIZE_S]
                    .iter()
                    .zip(self.window_short.iter()),
            ) {
                *x = s * w;
            }
            self.plan_short
                .process_with_scratch(
                    &mut self.input[..BLKSIZE_S],
                    &mut self.spec_short[ch][b],
                    &mut self.scratch,
                )
                .expect("fft buffer sizes are fixed");
        }
    }

    /// Replace the L/R long spectra with mid/side
    pub fn combine_ms_long(&mut self) {
        let (l, r) = self.spec_long.split_at_mut(1);
        for (cl, cr) in l[0].iter_mut().zip(r[0].iter_mut()) {
            let m = (*cl + *cr) * (SQRT2 * 0.5);
            let s = (*cl - *cr) * (SQRT2 * 0.5);
            *cl = m;
            *cr = s;
        }
    }

    /// Replace the L/R short spectra with mid/side
    pub fn combine_ms_short(&mut self) {
        let (l, r) = self.spec_short.split_at_mut(1);
        for b in 0..3 {
            for (cl, cr) in l[0][b].iter_mut().zip(r[0][b].iter_mut()) {
                let m = (*cl + *cr) * (SQRT2 * 0.5);
                let s = (*cl - *cr) * (SQRT2 * 0.5);
                *cl = m;
                *cr = s;
            }
        }
    }

    /// Line energies of the long spectrum in slot `ch`
    pub fn energy_long(&self, ch: usize, out: &mut [f32; HBLKSIZE]) {
        let spec = &self.spec_long[ch];
        out[0] = spec[0].re * spec[0].re;
        for (e, c) in out[1..].iter_mut().zip(spec[1..].iter()) {
            *e = (c.re * c.re + c.im * c.im) * 0.5;
        }
    }

    /// Line energies of short window `b` in slot `ch`
    pub fn energy_short(&self, ch: usize, b: usize, out: &mut [f32; HBLKSIZE_S]) {
        let spec = &self.spec_short[ch][b];
        out[0] = spec[0].re * spec[0].re;
        for (e, c) in out[1..].iter_mut().zip(spec[1..].iter()) {
            *e = (c.re * c.re + c.im * c.im) * 0.5;
        }
    }
}

fn blackman(n: usize) -> Vec<f32> {
    (0..n)
        .map(|i| {
            let t = i as f64 / (n - 1) as f64;
            (0.42 - 0.5 * (2.0 * std::f64::consts::PI * t).cos()
                + 0.08 * (4.0 * std::f64::consts::PI * t).cos()) as f32
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dc_energy_of_constant_input() {
        let mut fft = FftEngine::new();
        let samples = vec![1.0f32; BLKSIZE];
        let mut energy = [0.0f32; HBLKSIZE];
        fft.transform_long(0, &samples);
        fft.energy_long(0, &mut energy);
        let window_sum: f64 = blackman(BLKSIZE).iter().map(|&w| w as f64).sum();
        let expect = (window_sum * window_sum) as f32;
        assert!((energy[0] - expect).abs() / expect < 1e-4);
    }

    #[test]
    fn sine_concentrates_energy_at_its_bin() {
        let mut fft = FftEngine::new();
        // bin-64 sine fits the 1024 window exactly
        let samples: Vec<f32> = (0..BLKSIZE)
            .map(|i| (2.0 * std::f64::consts::PI * 64.0 * i as f64 / BLKSIZE as f64).sin() as f32)
            .collect();
        let mut energy = [0.0f32; HBLKSIZE];
        fft.transform_long(0, &samples);
        fft.energy_long(0, &mut energy);
        let peak = energy
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .unwrap()
            .0;
        assert!((63..=65).contains(&peak), "peak at {peak}");
    }

    #[test]
    fn ms_combine_of_identical_channels_cancels_side() {
        let mut fft = FftEngine::new();
        let samples: Vec<f32> = (0..BLKSIZE).map(|i| (i as f32 * 0.01).sin()).collect();
        fft.transform_long(0, &samples);
        fft.transform_long(1, &samples);
        fft.combine_ms_long();
        let mut mid = [0.0f32; HBLKSIZE];
        let mut side = [0.0f32; HBLKSIZE];
        fft.energy_long(0, &mut mid);
        fft.energy_long(1, &mut side);
        let mid_sum: f32 = mid.iter().sum();
        let side_sum: f32 = side.iter().sum();
        assert!(side_sum < mid_sum * 1e-6);
    }
}

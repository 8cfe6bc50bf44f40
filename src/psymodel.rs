//! Psychoacoustic model
//!
//! Computes the psychoacoustics for one granule, delayed by one granule:
//! the block type of the previous granule can only be decided after the
//! attack analysis of the following one. Input is a window of PCM centered
//! over the granule; output is `{en, thm}` per scalefactor band for the
//! L/R channels (and M/S when joint stereo), the block type, and the
//! perceptual entropy used by the rate control.
//!
//! The spectrum is first grouped into partition bands of roughly 0.34 Bark.
//! Each partition is a masker whose strength depends on its energy and its
//! tonality (peaky spectra mask less). Convolving the masker strengths with
//! the spreading function gives the raw masking, which is then limited by
//! the thresholds of the previous two granules (pre-echo control), by the
//! partition minimum, and by the signal energy itself, before being mapped
//! onto scalefactor bands.

use lazy_static::lazy_static;

use crate::config::{Mode, SessionConfig, ShortBlocks, VbrMode};
use crate::fft::FftEngine;
use crate::tables::{SFB_LONG, SFB_SHORT};
use crate::types::{
    BlockType, PsyRatio, SfbBands, BLKSIZE, BLKSIZE_S, CBANDS, HBLKSIZE, HBLKSIZE_S,
    MAX_CHANNELS, MAX_GRANULES, SBMAX_L, SBMAX_S,
};

/// Pre-echo limit factors against the previous and pre-previous granule
const RPELEV: f32 = 2.0;
const RPELEV2: f32 = 16.0;
const RPELEV_S: f32 = 2.0;
const RPELEV2_S: f32 = 16.0;

const NS_PREECHO_ATT0: f32 = 0.8;
const NS_PREECHO_ATT1: f32 = 0.6;
const NS_PREECHO_ATT2: f32 = 0.3;

const NS_ATTACK_THRESHOLD: f32 = 4.4;
const NS_ATTACK_THRESHOLD_S: f32 = 25.0;

/// Width of one partition band in Bark
const DELBARK: f64 = 0.34;

const NSFIRLEN: usize = 21;
const LN_TO_LOG10: f64 = std::f64::consts::LN_10 / 10.0;
const TEMPORALMASK_SUSTAIN_SEC: f64 = 0.01;

/// Loudness approximation scale, roughly 1.0 for signals near clipping
const VO_SCALE: f32 = 1.0 / (14752.0 * 14752.0) / (BLKSIZE as f32 / 2.0);

/// Masking reduction by tonality: 0 dB for noise-like maskers down to
/// -9.3 dB for strongly tonal ones.
#[rustfmt::skip]
const TAB: [f32; 9] = [
    1.0, 0.79433, 0.63096, 0.63096, 0.63096, 0.63096, 0.63096, 0.25119, 0.11749,
];

// Additive masking interpolation tables (values pre-squared)
#[rustfmt::skip]
const TABLE1: [f32; 25] = [
    3.3246 * 3.3246, 3.23837 * 3.23837, 3.15437 * 3.15437, 3.00412 * 3.00412,
    2.86103 * 2.86103, 2.65407 * 2.65407, 2.46209 * 2.46209, 2.284 * 2.284,
    2.11879 * 2.11879, 1.96552 * 1.96552, 1.82335 * 1.82335, 1.69146 * 1.69146,
    1.56911 * 1.56911, 1.46658 * 1.46658, 1.37074 * 1.37074, 1.31036 * 1.31036,
    1.25264 * 1.25264, 1.20648 * 1.20648, 1.16203 * 1.16203, 1.12765 * 1.12765,
    1.09428 * 1.09428, 1.0659 * 1.0659, 1.03826 * 1.03826, 1.01895 * 1.01895,
    1.0,
];
#[rustfmt::skip]
const TABLE2: [f32; 10] = [
    1.33352 * 1.33352, 1.35879 * 1.35879, 1.38454 * 1.38454, 1.39497 * 1.39497,
    1.40548 * 1.40548, 1.3537 * 1.3537, 1.30382 * 1.30382, 1.22321 * 1.22321,
    1.14758 * 1.14758, 1.0,
];
#[rustfmt::skip]
const TABLE3: [f32; 14] = [
    2.35364 * 2.35364, 2.29259 * 2.29259, 2.23313 * 2.23313, 2.12675 * 2.12675,
    2.02545 * 2.02545, 1.87894 * 1.87894, 1.74303 * 1.74303, 1.61695 * 1.61695,
    1.49999 * 1.49999, 1.39148 * 1.39148, 1.29083 * 1.29083, 1.19746 * 1.19746,
    1.11084 * 1.11084, 1.03826 * 1.03826,
];

lazy_static! {
    /// Ratio limits that let mask_add skip the log most of the time
    static ref MA_MAX_I1: f32 = 10f32.powf((8 + 1) as f32 / 16.0);
    static ref MA_MAX_I2: f32 = 10f32.powf((23 + 1) as f32 / 16.0);
    static ref MA_MAX_M: f32 = 10f32.powf(15.0 / 10.0);
}

fn freq2bark(freq: f64) -> f64 {
    let freq = freq.max(0.0);
    13.0 * (0.00076 * freq).atan() + 3.5 * ((freq / 7500.0) * (freq / 7500.0)).atan()
}

/// Addition of simultaneous masking. When the two maskers are within about
/// 1.5 dB their powers add with a bonus; when one dominates the other is
/// ignored; near the ATH floor the absorption interpolation applies.
fn mask_add(mut m1: f32, m2: f32, b: i32, ath_floor: f32) -> f32 {
    let ratio = if m2 > m1 {
        if m2 < m1 * *MA_MAX_I2 {
            m2 / m1
        } else {
            return m1 + m2;
        }
    } else {
        if m1 >= m2 * *MA_MAX_I2 {
            return m1 + m2;
        }
        m1 / m2
    };

    debug_assert!(m1 >= 0.0 && m2 >= 0.0);
    m1 += m2;

    if (-2..=2).contains(&b) {
        // approximately, 1 bark = 3 partitions
        if ratio >= *MA_MAX_I1 {
            return m1;
        }
        let i = (ratio.log10() * 16.0) as usize;
        return m1 * TABLE2[i.min(9)];
    }

    let i = (ratio.log10() * 16.0) as usize;
    if m1 < *MA_MAX_M * ath_floor {
        if m1 > ath_floor {
            let f = if i <= 13 { TABLE3[i] } else { 1.0 };
            let r = (m1 / ath_floor).log10() * (10.0 / 15.0);
            return m1 * ((TABLE1[i.min(24)] - f) * r + f);
        }
        if i > 13 {
            return m1;
        }
        return m1 * TABLE3[i];
    }

    m1 * TABLE1[i.min(24)]
}

/// pow(x/y, r) * y without the second pow for the common r
fn ns_interp(x: f32, y: f32, r: f32) -> f32 {
    if r >= 1.0 {
        return x;
    }
    if r <= 0.0 {
        return y;
    }
    if y > 0.0 {
        return (x / y).powf(r) * y;
    }
    0.0
}

/// The classic spreading function, normalised to unit area
fn s3_func(bark: f64) -> f64 {
    let mut tempx = bark;
    if tempx >= 0.0 {
        tempx *= 3.0;
    } else {
        tempx *= 1.5;
    }

    let x = if (0.5..=2.5).contains(&tempx) {
        let temp = tempx - 0.5;
        8.0 * (temp * temp - 2.0 * temp)
    } else {
        0.0
    };
    tempx += 0.474;
    let tempy = 15.811389 + 7.5 * tempx - 17.5 * (1.0 + tempx * tempx).sqrt();
    if tempy <= -60.0 {
        return 0.0;
    }
    ((x + tempy) * LN_TO_LOG10).exp() / 0.6609193
}

/// Asymmetric variant: fixed 27 dB/Bark above the masker, `hf_slope`
/// below it
fn s3_func_x(bark: f64, hf_slope: f64) -> f64 {
    let tempy = if bark >= 0.0 {
        -bark * 27.0
    } else {
        bark * hf_slope
    };
    if tempy <= -72.0 {
        return 0.0;
    }
    (tempy * LN_TO_LOG10).exp()
}

fn norm_s3_func_x(hf_slope: f64) -> f64 {
    let bisect = |mut l: f64, mut h: f64, inside_low: bool| {
        while (h - l).abs() > 1e-12 {
            let x = (h + l) / 2.0;
            if (s3_func_x(x, hf_slope) > 0.0) == inside_low {
                h = x;
            } else {
                l = x;
            }
        }
        (h + l) / 2.0
    };
    let mut x = 0.0;
    while s3_func_x(x, hf_slope) > 1e-20 {
        x -= 1.0;
    }
    let lim_a = bisect(x, 0.0, true);
    x = 0.0;
    while s3_func_x(x, hf_slope) > 1e-20 {
        x += 1.0;
    }
    let lim_b = bisect(0.0, x, false);

    let m = 1000;
    let mut sum = 0.0;
    for i in 0..=m {
        let x = lim_a + i as f64 * (lim_b - lim_a) / m as f64;
        sum += s3_func_x(x, hf_slope);
    }
    (m + 1) as f64 / (sum * (lim_b - lim_a))
}

/// Stereo demasking threshold, reverse engineered from the plot in the
/// Johnston & Ferreira 1992 ICASSP paper
fn stereo_demask(f: f64) -> f32 {
    let arg = (freq2bark(f).min(15.5)) / 15.5;
    10f64.powf(1.25 * (1.0 - (std::f64::consts::PI * arg).cos()) - 2.5) as f32
}

/// Absolute threshold of hearing in dB, by curve type
fn ath_db(freq_hz: f64, ath_type: i32, ath_curve: f64) -> f64 {
    let f = (freq_hz / 1000.0).clamp(0.01, 21.0);
    match ath_type {
        4 => {
            3.640 * f.powf(-0.8) - 6.800 * (-0.6 * (f - 3.4) * (f - 3.4)).exp()
                + 6.000 * (-0.15 * (f - 8.7) * (f - 8.7)).exp()
                + (0.6 + 0.04 * ath_curve) * 0.001 * f * f * f * f
        }
        _ => {
            3.640 * f.powf(-0.8) - 6.5 * (-0.6 * (f - 3.3) * (f - 3.3)).exp()
                + 0.001 * f * f * f * f
        }
    }
}

/// Partition-band constants for one block length
#[derive(Debug, Clone)]
struct PsyConstBand {
    npart: usize,
    numlines: [usize; CBANDS],
    rnumlines: [f32; CBANDS],
    /// Packed spreading function rows; row `b` covers columns
    /// `s3ind[b][0] ..= s3ind[b][1]`
    s3: Vec<f32>,
    s3ind: [[usize; 2]; CBANDS],
    /// Partition at the upper edge of each scalefactor band, and how much
    /// of it belongs to the band
    bo: [usize; SBMAX_L],
    bo_weight: [f32; SBMAX_L],
    bm: [usize; SBMAX_L],
    mld_cb: [f32; CBANDS],
    minval: [f32; CBANDS],
    ath_cb: [f32; CBANDS],
}

struct NumlineOut {
    npart: usize,
    bval: [f64; CBANDS],
    bval_width: [f64; CBANDS],
}

impl PsyConstBand {
    #[allow(clippy::too_many_arguments)]
    fn init(
        sfreq: f64,
        blksize: usize,
        scalepos: &[usize],
        deltafreq: f64,
        sbmax: usize,
        snr_a: f64,
        snr_b: f64,
        use_old_s3: bool,
        ath_type: i32,
        ath_curve: f64,
        minval_xv: f64,
        is_short: bool,
    ) -> Self {
        let mut out = Self {
            npart: 0,
            numlines: [0; CBANDS],
            rnumlines: [0.0; CBANDS],
            s3: Vec::new(),
            s3ind: [[0; 2]; CBANDS],
            bo: [0; SBMAX_L],
            bo_weight: [0.0; SBMAX_L],
            bm: [0; SBMAX_L],
            mld_cb: [1.0; CBANDS],
            minval: [0.0; CBANDS],
            ath_cb: [0.0; CBANDS],
        };
        let nl = out.init_numline(sfreq, blksize, scalepos, deltafreq, sbmax);
        out.npart = nl.npart;

        // SNR interpolation over the bark range sets the per-band
        // normalisation of the spreading function
        const BVL_A: f64 = 13.0;
        const BVL_B: f64 = 24.0;
        let mut norm = [0.0f64; CBANDS];
        for i in 0..out.npart {
            let mut snr = snr_a;
            if nl.bval[i] >= BVL_A {
                snr = snr_b * (nl.bval[i] - BVL_A) / (BVL_B - BVL_A)
                    + snr_a * (BVL_B - nl.bval[i]) / (BVL_B - BVL_A);
            }
            norm[i] = 10f64.powf(snr / 10.0);
            out.rnumlines[i] = if out.numlines[i] > 0 {
                1.0 / out.numlines[i] as f32
            } else {
                0.0
            };
        }
        out.init_s3(&nl, &norm, use_old_s3);

        // per-partition ATH (FFT energy units) and masking minimum
        let mut j = 0usize;
        for i in 0..out.npart {
            let mut x = f64::MAX;
            for _ in 0..out.numlines[i] {
                let freq = sfreq * j as f64 / blksize as f64;
                // -20 dB scales the SPL curve to FFT units
                let level = 10f64.powf(0.1 * (ath_db(freq, ath_type, ath_curve) - 20.0))
                    * out.numlines[i] as f64;
                if x > level {
                    x = level;
                }
                j += 1;
            }
            out.ath_cb[i] = x as f32;

            // low-frequency masking strength limit, an ISO MPEG-1 carry-over
            let mut m = if is_short {
                let mut m = 7.0 * (nl.bval[i] / minval_xv - 1.0);
                if nl.bval[i] > minval_xv {
                    m *= 1.0 + (1.0 + m).ln() * 3.1;
                }
                if nl.bval[i] < minval_xv {
                    m *= 1.0 + (1.0 - m).ln() * 2.3;
                }
                m
            } else {
                20.0 * (nl.bval[i] / minval_xv - 1.0)
            };
            if m > 6.0 {
                m = 30.0;
            }
            if m < -100.0 {
                m = -100.0;
            }
            if sfreq < 44000.0 {
                m = 30.0;
            }
            m -= 8.0;
            out.minval[i] = (10f64.powf(m / 10.0) * out.numlines[i] as f64) as f32;
        }

        // stereo demasking per partition, at the band centers
        let mut j = 0usize;
        for i in 0..out.npart {
            let freq = sfreq * (j + out.numlines[i] / 2) as f64 / blksize as f64;
            out.mld_cb[i] = stereo_demask(freq);
            j += out.numlines[i];
        }

        out
    }

    fn init_numline(
        &mut self,
        sfreq: f64,
        blksize: usize,
        scalepos: &[usize],
        deltafreq: f64,
        sbmax: usize,
    ) -> NumlineOut {
        let sample_freq_frac = sfreq / if sbmax > 15 { 2.0 * 576.0 } else { 2.0 * 192.0 };
        let line_freq = sfreq / blksize as f64;
        let mut b_frq = [0.0f64; CBANDS + 1];
        let mut partition = [0usize; HBLKSIZE];
        let mut bval = [0.0f64; CBANDS];
        let mut bval_width = [0.0f64; CBANDS];

        // group lines into partitions of about DELBARK each
        let mut j = 0usize;
        let mut ni = 0usize;
        let mut i = 0usize;
        while i < CBANDS {
            let bark1 = freq2bark(line_freq * j as f64);
            b_frq[i] = line_freq * j as f64;
            let mut j2 = j;
            while freq2bark(line_freq * j2 as f64) - bark1 < DELBARK && j2 <= blksize / 2 {
                j2 += 1;
            }
            self.numlines[i] = j2 - j;
            ni = i + 1;
            while j < j2 {
                partition[j.min(HBLKSIZE - 1)] = i;
                j += 1;
            }
            if j > blksize / 2 {
                j = blksize / 2;
                i += 1;
                break;
            }
            i += 1;
        }
        b_frq[i] = line_freq * j as f64;

        for sfb in 0..sbmax {
            let start = scalepos[sfb];
            let end = scalepos[sfb + 1];
            let i1 = ((deltafreq * (start as f64 - 0.5) + 0.5).floor().max(0.0)) as usize;
            let mut i2 = (deltafreq * (end as f64 - 0.5) + 0.5).floor() as usize;
            if i2 > blksize / 2 {
                i2 = blksize / 2;
            }
            self.bm[sfb] = (partition[i1] + partition[i2]) / 2;
            self.bo[sfb] = partition[i2];

            // fraction of the boundary partition inside this band
            let f_tmp = sample_freq_frac * end as f64;
            let bo = self.bo[sfb];
            let w = (f_tmp - b_frq[bo]) / (b_frq[bo + 1] - b_frq[bo]);
            self.bo_weight[sfb] = w.clamp(0.0, 1.0) as f32;
        }

        let mut j = 0usize;
        for k in 0..ni {
            let w = self.numlines[k];
            let bark1 = freq2bark(line_freq * j as f64);
            let bark2 = freq2bark(line_freq * (j + w - 1) as f64);
            bval[k] = 0.5 * (bark1 + bark2);
            let bark1 = freq2bark(line_freq * (j as f64 - 0.5));
            let bark2 = freq2bark(line_freq * (j as f64 + w as f64 - 0.5));
            bval_width[k] = bark2 - bark1;
            j += w;
        }

        NumlineOut {
            npart: ni,
            bval,
            bval_width,
        }
    }

    /// Dense spreading matrix, then packed into `s3` with per-row index
    /// ranges. A dense `[npart][npart]` store would waste about 80% of its
    /// cells.
    fn init_s3(&mut self, nl: &NumlineOut, norm: &[f64; CBANDS], use_old_s3: bool) {
        let npart = self.npart;
        let mut s3 = vec![0.0f64; npart * npart];

        if use_old_s3 {
            for i in 0..npart {
                for j in 0..npart {
                    s3[i * npart + j] =
                        s3_func(nl.bval[i] - nl.bval[j]) * nl.bval_width[j] * norm[i];
                }
            }
        } else {
            for j in 0..npart {
                let hf_slope = 15.0 + (21.0 / nl.bval[j].max(0.1)).min(12.0);
                let s3_x_norm = norm_s3_func_x(hf_slope);
                for i in 0..npart {
                    s3[i * npart + j] = s3_x_norm
                        * s3_func_x(nl.bval[i] - nl.bval[j], hf_slope)
                        * nl.bval_width[j]
                        * norm[i];
                }
            }
        }

        let mut packed = 0usize;
        for i in 0..npart {
            let mut lo = 0;
            while lo < npart && s3[i * npart + lo] <= 0.0 {
                lo += 1;
            }
            let mut hi = npart - 1;
            while hi > 0 && s3[i * npart + hi] <= 0.0 {
                hi -= 1;
            }
            self.s3ind[i] = [lo.min(hi), hi];
            packed += hi - lo.min(hi) + 1;
        }
        self.s3 = Vec::with_capacity(packed);
        for i in 0..npart {
            for j in self.s3ind[i][0]..=self.s3ind[i][1] {
                self.s3.push(s3[i * npart + j] as f32);
            }
        }
    }
}

/// Persistent psychoacoustic state, per channel slot (L, R, M, S)
#[derive(Debug, Clone)]
struct PsyStateVar {
    blocktype_old: [BlockType; 2],
    nb_l1: [[f32; CBANDS]; 4],
    nb_l2: [[f32; CBANDS]; 4],
    nb_s1: [[f32; CBANDS]; 4],
    nb_s2: [[f32; CBANDS]; 4],
    en: [SfbBands; 4],
    thm: [SfbBands; 4],
    thm_prev: [SfbBands; 4],
    last_attacks: [i32; 4],
    last_en_subshort: [[f32; 9]; 4],
    loudness_sq_save: [f32; 2],
    tot_ener: [f32; 4],
}

impl PsyStateVar {
    /// Loud sentinels disable pre-echo control on the first granule
    fn new() -> Self {
        let loud = SfbBands {
            l: [1e20; SBMAX_L],
            s: [[1e20; 3]; SBMAX_S],
        };
        Self {
            blocktype_old: [BlockType::Norm; 2],
            nb_l1: [[1e20; CBANDS]; 4],
            nb_l2: [[1e20; CBANDS]; 4],
            nb_s1: [[1.0; CBANDS]; 4],
            nb_s2: [[1.0; CBANDS]; 4],
            en: [loud; 4],
            thm: [loud; 4],
            thm_prev: [loud; 4],
            last_attacks: [0; 4],
            last_en_subshort: [[10.0; 9]; 4],
            loudness_sq_save: [0.0; 2],
            tot_ener: [0.0; 4],
        }
    }
}

#[derive(Debug)]
pub struct PsyModel {
    gdl: PsyConstBand,
    gds: PsyConstBand,
    attack_threshold: [f32; 4],
    /// Temporal (post-)masking decay per granule
    decay: f32,
    eql_w: Vec<f32>,
    fft: FftEngine,
    psv: PsyStateVar,
    /// Delayed loudness^2 per [granule][channel], feeds the adaptive ATH
    pub loudness_sq: [[f32; MAX_CHANNELS]; MAX_GRANULES],
    ath_adjust_factor: f32,
    ath_adjust_limit: f32,
    athaa_sensitivity_p: f32,
    /// ATH per long scalefactor band in MDCT energy units
    pub ath_l: [f32; SBMAX_L],
    /// ATH per short scalefactor band in MDCT energy units
    pub ath_s: [f32; SBMAX_S],
}

impl PsyModel {
    pub fn new(cfg: &SessionConfig) -> Self {
        let sfreq = cfg.samplerate_out as f64;
        // the second spreading variant exists for experiments; the classic
        // curve is the production path
        let use_old_s3 = true;

        let gdl = PsyConstBand::init(
            sfreq,
            BLKSIZE,
            &SFB_LONG[cfg.samplerate_index],
            BLKSIZE as f64 / (2.0 * 576.0),
            SBMAX_L,
            0.0,
            0.0,
            use_old_s3,
            cfg.ath_type,
            cfg.ath_curve as f64,
            10.0,
            false,
        );
        let gds = PsyConstBand::init(
            sfreq,
            BLKSIZE_S,
            &SFB_SHORT[cfg.samplerate_index],
            BLKSIZE_S as f64 / (2.0 * 192.0),
            SBMAX_S,
            -8.25,
            -4.5,
            use_old_s3,
            cfg.ath_type,
            cfg.ath_curve as f64,
            12.0,
            true,
        );

        // equal loudness weights from the ATH shape, normalised to sum 1
        let mut eql_w = vec![0.0f32; BLKSIZE / 2];
        let freq_inc = sfreq / BLKSIZE as f64;
        let mut freq = 0.0;
        let mut balance = 0.0f64;
        for w in eql_w.iter_mut() {
            freq += freq_inc;
            *w = (1.0 / 10f64.powf(ath_db(freq, cfg.ath_type, cfg.ath_curve as f64) / 10.0))
                as f32;
            balance += *w as f64;
        }
        for w in eql_w.iter_mut() {
            *w = (*w as f64 / balance) as f32;
        }

        // MDCT-domain ATH per scalefactor band for the quantizer
        let mut ath_l = [0.0f32; SBMAX_L];
        for (sfb, a) in ath_l.iter_mut().enumerate() {
            let start = SFB_LONG[cfg.samplerate_index][sfb];
            let end = SFB_LONG[cfg.samplerate_index][sfb + 1];
            let mut x = f64::MAX;
            for i in start..end {
                let freq = i as f64 * sfreq / (2.0 * 576.0);
                let level = 10f64.powf((ath_db(freq, cfg.ath_type, cfg.ath_curve as f64)
                    - 100.0)
                    / 10.0);
                x = x.min(level);
            }
            *a = (x * (end - start) as f64) as f32;
        }
        let mut ath_s = [0.0f32; SBMAX_S];
        for (sfb, a) in ath_s.iter_mut().enumerate() {
            let start = SFB_SHORT[cfg.samplerate_index][sfb];
            let end = SFB_SHORT[cfg.samplerate_index][sfb + 1];
            let mut x = f64::MAX;
            for i in start..end {
                let freq = i as f64 * sfreq / (2.0 * 192.0);
                let level = 10f64.powf((ath_db(freq, cfg.ath_type, cfg.ath_curve as f64)
                    - 100.0)
                    / 10.0);
                x = x.min(level);
            }
            *a = (x * (end - start) as f64) as f32;
        }

        let decay =
            (-std::f64::consts::LN_10 / (TEMPORALMASK_SUSTAIN_SEC * sfreq / 192.0)).exp() as f32;

        Self {
            gdl,
            gds,
            attack_threshold: [
                NS_ATTACK_THRESHOLD,
                NS_ATTACK_THRESHOLD,
                NS_ATTACK_THRESHOLD,
                NS_ATTACK_THRESHOLD_S,
            ],
            decay,
            eql_w,
            fft: FftEngine::new(),
            psv: PsyStateVar::new(),
            loudness_sq: [[0.0; MAX_CHANNELS]; MAX_GRANULES],
            ath_adjust_factor: 0.01,
            ath_adjust_limit: 1.0,
            athaa_sensitivity_p: 10f32.powf(cfg.athaa_sensitivity / -10.0),
            ath_l,
            ath_s,
        }
    }

    pub fn tot_ener(&self, chn: usize) -> f32 {
        self.psv.tot_ener[chn]
    }

    /// Lower the ATH by up to ~32 dB in quiet passages, driven by the
    /// loudness approximation of the previous frame.
    pub fn adjust_ath(&mut self, cfg: &SessionConfig) {
        if cfg.athaa_type == 0 {
            self.ath_adjust_factor = 1.0;
            return;
        }
        let mut max_pow = 0.0f32;
        for gr in 0..cfg.mode_gr {
            for ch in 0..cfg.channels_out {
                max_pow = max_pow.max(self.loudness_sq[gr][ch]);
            }
        }
        max_pow *= self.athaa_sensitivity_p;

        if max_pow > 0.03125 {
            if self.ath_adjust_factor >= 1.0 {
                self.ath_adjust_factor = 1.0;
            } else if self.ath_adjust_factor < self.ath_adjust_limit {
                self.ath_adjust_factor = self.ath_adjust_limit;
            }
            self.ath_adjust_limit = 1.0;
        } else {
            // about 32 dB maximum adjust
            let adj_lim_new = 31.98 * max_pow + 0.000625;
            if self.ath_adjust_factor >= adj_lim_new {
                // descend gradually
                self.ath_adjust_factor =
                    (self.ath_adjust_factor * (adj_lim_new * 0.075 + 0.925)).max(adj_lim_new);
            } else if self.ath_adjust_limit >= adj_lim_new {
                self.ath_adjust_factor = adj_lim_new;
            } else {
                // preceded by a phase of quietness or the initial phase
                self.ath_adjust_factor = self.ath_adjust_limit;
            }
            self.ath_adjust_limit = adj_lim_new;
        }
    }

    /// Analyze one granule and return the block types for the *previous*
    /// granule. `buffer[ch]` must hold at least 1024 samples positioned so
    /// the long FFT window is centered over the granule being analyzed;
    /// `masking`/`pe` receive the delayed results for `gr_out`.
    #[allow(clippy::too_many_arguments)]
    pub fn analyze(
        &mut self,
        cfg: &SessionConfig,
        buffer: [&[f32]; MAX_CHANNELS],
        gr_out: usize,
        masking: &mut [[PsyRatio; MAX_CHANNELS]; MAX_GRANULES],
        masking_ms: &mut [[PsyRatio; MAX_CHANNELS]; MAX_GRANULES],
        pe: &mut [[f32; MAX_CHANNELS]; MAX_GRANULES],
        pe_ms: &mut [[f32; MAX_CHANNELS]; MAX_GRANULES],
        pcfact: f32,
    ) -> [BlockType; 2] {
        let n_chn_psy = if cfg.mode == Mode::JointStereo {
            4
        } else {
            cfg.channels_out
        };

        let mut ns_attacks = [[0i32; 4]; 4];
        let mut uselongblock = [1i32; 2];
        let mut sub_short_factor = [[1.0f32; 3]; 4];
        let mut en_subshort_all = [[0.0f32; 12]; 4];

        self.attack_detection(
            cfg,
            buffer,
            gr_out,
            masking,
            masking_ms,
            &mut ns_attacks,
            &mut uselongblock,
            &mut sub_short_factor,
            &mut en_subshort_all,
            n_chn_psy,
        );

        // short block policy
        if cfg.short_blocks == ShortBlocks::Coupled && !(uselongblock[0] != 0 && uselongblock[1] != 0)
        {
            uselongblock[0] = 0;
            uselongblock[1] = 0;
        }
        for u in uselongblock.iter_mut().take(cfg.channels_out) {
            if cfg.short_blocks == ShortBlocks::Dispensed {
                *u = 1;
            }
            if cfg.short_blocks == ShortBlocks::Forced {
                *u = 0;
            }
        }

        let mut eb = [[0.0f32; CBANDS]; 4];
        let mut thr = [[0.0f32; CBANDS]; 4];
        let mut fftenergy = [0.0f32; HBLKSIZE];
        let mut fftenergy_s = [[0.0f32; HBLKSIZE_S]; 3];

        // long blocks
        for chn in 0..n_chn_psy {
            let ch01 = chn & 1;
            if chn < 2 {
                self.fft.transform_long(chn, buffer[chn.min(cfg.channels_in - 1)]);
            } else if chn == 2 {
                self.fft.combine_ms_long();
            }
            self.fft.energy_long(ch01, &mut fftenergy);

            let mut tot = 0.0f32;
            for &e in &fftenergy[11..] {
                tot += e;
            }
            self.psv.tot_ener[chn] = tot;

            if chn < 2 {
                self.loudness_sq[gr_out][chn] = self.psv.loudness_sq_save[chn];
                let mut power = 0.0f32;
                for (e, w) in fftenergy.iter().zip(self.eql_w.iter()) {
                    power += e * w;
                }
                self.psv.loudness_sq_save[chn] = power * VO_SCALE;
            }

            self.compute_masking_l(chn, &fftenergy, &mut eb[chn], &mut thr[chn], pcfact);
        }

        if cfg.mode == Mode::JointStereo && uselongblock[0] + uselongblock[1] == 2 {
            compute_ms_thresholds(
                &mut eb,
                &mut thr,
                &self.gdl.mld_cb,
                &self.gdl.ath_cb,
                self.ath_adjust_factor,
                cfg.msfix,
                self.gdl.npart,
            );
        }
        for chn in 0..n_chn_psy {
            if uselongblock[chn & 1] != 0 {
                self.convert_partition2scalefac_l(chn, &eb[chn], &thr[chn]);
            }
        }

        // short blocks
        for sblock in 0..3 {
            for chn in 0..n_chn_psy {
                let ch01 = chn & 1;
                if uselongblock[ch01] != 0 {
                    // keep the rotation alive while long blocks run
                    if sblock == 0 {
                        let n = self.gds.npart;
                        let (s1, s2) = (self.psv.nb_s1[chn], &mut self.psv.nb_s2[chn]);
                        s2[..n].copy_from_slice(&s1[..n]);
                    }
                    continue;
                }
                if sblock == 0 {
                    if chn < 2 {
                        self.fft
                            .transform_short(chn, buffer[chn.min(cfg.channels_in - 1)]);
                    } else if chn == 2 {
                        self.fft.combine_ms_short();
                    }
                }
                self.fft.energy_short(ch01, sblock, &mut fftenergy_s[sblock]);
                self.compute_masking_s(chn, &fftenergy_s[sblock], &mut eb[chn], &mut thr[chn]);
            }
            if cfg.mode == Mode::JointStereo && uselongblock[0] + uselongblock[1] == 0 {
                compute_ms_thresholds(
                    &mut eb,
                    &mut thr,
                    &self.gds.mld_cb,
                    &self.gds.ath_cb,
                    self.ath_adjust_factor * (BLKSIZE_S as f32 / BLKSIZE as f32),
                    cfg.msfix,
                    self.gds.npart,
                );
            }
            for chn in 0..n_chn_psy {
                if uselongblock[chn & 1] == 0 {
                    self.convert_partition2scalefac_s(chn, sblock, &eb[chn], &thr[chn]);
                }
            }
        }

        // short block pre-echo attenuation, steered by attack positions
        for chn in 0..n_chn_psy {
            if uselongblock[chn & 1] != 0 {
                continue;
            }
            for sb in 0..SBMAX_S {
                let mut new_thmm = [0.0f32; 3];
                for sblock in 0..3 {
                    let mut thmm = self.psv.thm[chn].s[sb][sblock] * NS_PREECHO_ATT0;
                    if ns_attacks[chn][sblock] >= 2 || ns_attacks[chn][sblock + 1] == 1 {
                        let idx = if sblock != 0 { sblock - 1 } else { 2 };
                        let p = ns_interp(
                            self.psv.thm[chn].s[sb][idx],
                            thmm,
                            NS_PREECHO_ATT1 * pcfact,
                        );
                        thmm = thmm.min(p);
                    } else if ns_attacks[chn][sblock] == 1 {
                        let idx = if sblock != 0 { sblock - 1 } else { 2 };
                        let p = ns_interp(
                            self.psv.thm[chn].s[sb][idx],
                            thmm,
                            NS_PREECHO_ATT2 * pcfact,
                        );
                        thmm = thmm.min(p);
                    } else if (sblock != 0 && ns_attacks[chn][sblock - 1] == 3)
                        || (sblock == 0 && self.psv.last_attacks[chn] == 3)
                    {
                        let idx = if sblock != 2 { sblock + 1 } else { 0 };
                        let p = ns_interp(
                            self.psv.thm[chn].s[sb][idx],
                            thmm,
                            NS_PREECHO_ATT2 * pcfact,
                        );
                        thmm = thmm.min(p);
                    }
                    thmm *= sub_short_factor[chn][sblock];
                    new_thmm[sblock] = thmm;
                }
                self.psv.thm[chn].s[sb] = new_thmm;
            }
        }
        for chn in 0..n_chn_psy {
            self.psv.last_attacks[chn] = ns_attacks[chn][2];
        }

        // inter-channel masking
        if (cfg.mode == Mode::Stereo || cfg.mode == Mode::JointStereo) && cfg.inter_ch_ratio > 0.0
        {
            let ratio = cfg.inter_ch_ratio;
            let (a, b) = self.psv.thm.split_at_mut(1);
            for sb in 0..SBMAX_L {
                let l = a[0].l[sb];
                let r = b[0].l[sb];
                a[0].l[sb] += r * ratio;
                b[0].l[sb] += l * ratio;
            }
            for sb in 0..SBMAX_S {
                for w in 0..3 {
                    let l = a[0].s[sb][w];
                    let r = b[0].s[sb][w];
                    a[0].s[sb][w] += r * ratio;
                    b[0].s[sb][w] += l * ratio;
                }
            }
        }

        // temporal (post-)masking: thresholds persist, decaying, but may
        // never exceed the band energy
        if cfg.use_temporal {
            for chn in 0..n_chn_psy {
                for sb in 0..SBMAX_L {
                    let sustained = self.psv.thm_prev[chn].l[sb] * self.decay;
                    if self.psv.thm[chn].l[sb] < sustained {
                        self.psv.thm[chn].l[sb] = sustained.min(self.psv.en[chn].l[sb]);
                    }
                    self.psv.thm_prev[chn].l[sb] = self.psv.thm[chn].l[sb];
                }
            }
        }

        // final block type for the previous granule
        let mut blocktype_d = [BlockType::Norm; 2];
        for chn in 0..cfg.channels_out {
            let mut blocktype = BlockType::Norm;
            if uselongblock[chn] != 0 {
                debug_assert!(self.psv.blocktype_old[chn] != BlockType::Start);
                if self.psv.blocktype_old[chn] == BlockType::Short {
                    blocktype = BlockType::Stop;
                }
            } else {
                blocktype = BlockType::Short;
                if self.psv.blocktype_old[chn] == BlockType::Norm {
                    self.psv.blocktype_old[chn] = BlockType::Start;
                }
                if self.psv.blocktype_old[chn] == BlockType::Stop {
                    self.psv.blocktype_old[chn] = BlockType::Short;
                }
            }
            blocktype_d[chn] = self.psv.blocktype_old[chn];
            self.psv.blocktype_old[chn] = blocktype;
        }

        // perceptual entropy of the delayed granule
        for chn in 0..n_chn_psy {
            if chn > 1 {
                let block_type = if blocktype_d[0] == BlockType::Short
                    || blocktype_d[1] == BlockType::Short
                {
                    BlockType::Short
                } else {
                    BlockType::Norm
                };
                let mr = &masking_ms[gr_out][chn - 2];
                pe_ms[gr_out][chn - 2] = if block_type == BlockType::Short {
                    pecalc_s(mr, cfg.masking_lower)
                } else {
                    pecalc_l(mr, cfg.masking_lower)
                };
            } else {
                let mr = &masking[gr_out][chn];
                pe[gr_out][chn] = if blocktype_d[chn] == BlockType::Short {
                    pecalc_s(mr, cfg.masking_lower)
                } else {
                    pecalc_l(mr, cfg.masking_lower)
                };
            }
        }

        blocktype_d
    }

    /// fs/4 high-pass attack detection over 9 sub-short windows, plus the
    /// hand-off of the previous granule's maskings to the caller.
    #[allow(clippy::too_many_arguments)]
    fn attack_detection(
        &mut self,
        cfg: &SessionConfig,
        buffer: [&[f32]; MAX_CHANNELS],
        gr_out: usize,
        masking: &mut [[PsyRatio; MAX_CHANNELS]; MAX_GRANULES],
        masking_ms: &mut [[PsyRatio; MAX_CHANNELS]; MAX_GRANULES],
        ns_attacks: &mut [[i32; 4]; 4],
        uselongblock: &mut [i32; 2],
        sub_short_factor: &mut [[f32; 3]; 4],
        en_subshort_all: &mut [[f32; 12]; 4],
        n_chn_psy: usize,
    ) {
        #[rustfmt::skip]
        const FIRCOEF: [f32; 10] = [
            -8.65163e-18 * 2.0, -0.00851586 * 2.0, -6.74764e-18 * 2.0, 0.0209036 * 2.0,
            -3.36639e-17 * 2.0, -0.0438162 * 2.0, -1.54175e-17 * 2.0, 0.0931738 * 2.0,
            -5.52212e-17 * 2.0, -0.313819 * 2.0,
        ];

        let mut hpf = [[0.0f32; 576]; 2];
        for chn in 0..cfg.channels_out {
            let src = buffer[chn.min(cfg.channels_in - 1)];
            let fir_base = 576 - 350 - NSFIRLEN + 192;
            for i in 0..576 {
                let firbuf = &src[fir_base + i..];
                let mut sum1 = firbuf[10];
                let mut sum2 = 0.0f32;
                let mut j = 0;
                while j < (NSFIRLEN - 1) / 2 - 1 {
                    sum1 += FIRCOEF[j] * (firbuf[j] + firbuf[NSFIRLEN - j]);
                    sum2 += FIRCOEF[j + 1] * (firbuf[j + 1] + firbuf[NSFIRLEN - j - 1]);
                    j += 2;
                }
                hpf[chn][i] = sum1 + sum2;
            }

            // one granule delay: hand the previous results to the caller
            masking[gr_out][chn] = PsyRatio {
                en: self.psv.en[chn],
                thm: self.psv.thm[chn],
            };
            if n_chn_psy > 2 {
                masking_ms[gr_out][chn] = PsyRatio {
                    en: self.psv.en[chn + 2],
                    thm: self.psv.thm[chn + 2],
                };
            }
        }

        for chn in 0..n_chn_psy {
            if chn == 2 {
                for i in 0..576 {
                    let l = hpf[0][i];
                    let r = hpf[1][i];
                    hpf[0][i] = l + r;
                    hpf[1][i] = l - r;
                }
            }

            let mut attack_intensity = [0.0f32; 12];
            let mut en_short = [0.0f32; 4];
            let en_subshort = &mut en_subshort_all[chn];

            for i in 0..3 {
                en_subshort[i] = self.psv.last_en_subshort[chn][i + 6];
                attack_intensity[i] = en_subshort[i] / self.psv.last_en_subshort[chn][i + 4];
                en_short[0] += en_subshort[i];
            }
            let pf = &hpf[chn & 1];
            for i in 0..9 {
                let seg = &pf[i * 64..(i + 1) * 64];
                let mut p = 1.0f32;
                for &s in seg {
                    p = p.max(s.abs());
                }
                self.psv.last_en_subshort[chn][i] = p;
                en_subshort[i + 3] = p;
                en_short[1 + i / 3] += p;
                let prev = en_subshort[i + 1];
                let v = if p > prev {
                    p / prev
                } else if prev > p * 10.0 {
                    prev / (p * 10.0)
                } else {
                    0.0
                };
                attack_intensity[i + 3] = v;
            }

            // pulse-like signals get their thresholds halved
            for i in 0..3 {
                let enn =
                    en_subshort[i * 3 + 3] + en_subshort[i * 3 + 4] + en_subshort[i * 3 + 5];
                let mut factor = 1.0f32;
                if en_subshort[i * 3 + 5] * 6.0 < enn {
                    factor *= 0.5;
                    if en_subshort[i * 3 + 4] * 6.0 < enn {
                        factor *= 0.5;
                    }
                }
                sub_short_factor[chn][i] = factor;
            }

            let x = self.attack_threshold[chn];
            for i in 0..12 {
                if ns_attacks[chn][i / 3] == 0 && attack_intensity[i] > x {
                    ns_attacks[chn][i / 3] = (i % 3) as i32 + 1;
                }
            }

            // require an energy change between neighbouring short blocks,
            // to keep periodic signals from flipping to short
            for i in 1..4 {
                let u = en_short[i - 1];
                let v = en_short[i];
                let m = u.max(v);
                if m < 40000.0 && u < 1.7 * v && v < 1.7 * u {
                    if i == 1 && ns_attacks[chn][0] <= ns_attacks[chn][i] {
                        ns_attacks[chn][0] = 0;
                    }
                    ns_attacks[chn][i] = 0;
                }
            }

            if ns_attacks[chn][0] <= self.psv.last_attacks[chn] {
                ns_attacks[chn][0] = 0;
            }

            let mut ns_uselongblock = 1;
            if self.psv.last_attacks[chn] == 3
                || ns_attacks[chn][0] + ns_attacks[chn][1] + ns_attacks[chn][2] + ns_attacks[chn][3]
                    != 0
            {
                ns_uselongblock = 0;
                if ns_attacks[chn][1] != 0 && ns_attacks[chn][0] != 0 {
                    ns_attacks[chn][1] = 0;
                }
                if ns_attacks[chn][2] != 0 && ns_attacks[chn][1] != 0 {
                    ns_attacks[chn][2] = 0;
                }
                if ns_attacks[chn][3] != 0 && ns_attacks[chn][2] != 0 {
                    ns_attacks[chn][3] = 0;
                }
            }

            if chn < 2 {
                uselongblock[chn] = ns_uselongblock;
            } else if ns_uselongblock == 0 {
                uselongblock[0] = 0;
                uselongblock[1] = 0;
            }
        }
    }

    fn compute_masking_l(
        &mut self,
        chn: usize,
        fftenergy: &[f32; HBLKSIZE],
        eb_out: &mut [f32; CBANDS],
        thr_out: &mut [f32; CBANDS],
        pcfact: f32,
    ) {
        let gdl = &self.gdl;
        let mut max = [0.0f32; CBANDS];
        let mut avg = [0.0f32; CBANDS];
        let mut mask_idx = [0u8; CBANDS];

        // partition energies and the tonality estimate from the peakiness
        let mut j = 0usize;
        for b in 0..gdl.npart {
            let mut ebb = 0.0f32;
            let mut m = 0.0f32;
            for _ in 0..gdl.numlines[b] {
                let el = fftenergy[j];
                ebb += el;
                m = m.max(el);
                j += 1;
            }
            eb_out[b] = ebb;
            max[b] = m;
            avg[b] = ebb * gdl.rnumlines[b];
        }
        calc_mask_index(gdl, &max, &avg, &mut mask_idx);

        // spread the masker strengths
        let mut k = 0usize;
        for b in 0..gdl.npart {
            let mut kk = gdl.s3ind[b][0];
            let last = gdl.s3ind[b][1];
            let mut dd = mask_idx[kk] as i32;
            let mut dd_n = 1i32;
            let mut ecb = gdl.s3[k] * eb_out[kk] * TAB[mask_idx[kk] as usize];
            k += 1;
            kk += 1;
            while kk <= last {
                dd += mask_idx[kk] as i32;
                dd_n += 1;
                let x = gdl.s3[k] * eb_out[kk] * TAB[mask_idx[kk] as usize];
                ecb = mask_add(
                    ecb,
                    x,
                    kk as i32 - b as i32,
                    gdl.ath_cb[kk] * self.ath_adjust_factor,
                );
                k += 1;
                kk += 1;
            }
            let avg_mask = TAB[((1 + 2 * dd) / (2 * dd_n)) as usize] * 0.5;
            ecb *= avg_mask * 0.158489319246111; // pow(10,-0.8)

            // long block pre-echo control. If the previous granule was
            // short, its long-block masking history means nothing; any
            // pre-echo it could mask has already been handled there.
            let thr = if self.psv.blocktype_old[chn & 1] == BlockType::Short {
                ecb
            } else {
                ns_interp(
                    ecb.min(RPELEV * self.psv.nb_l1[chn][b])
                        .min(RPELEV2 * self.psv.nb_l2[chn][b]),
                    ecb,
                    pcfact,
                )
            };
            self.psv.nb_l2[chn][b] = self.psv.nb_l1[chn][b];
            self.psv.nb_l1[chn][b] = ecb;

            // strong tonal signals must not be allowed thresholds above
            // their own energy
            let mut thr = thr.min(max[b] * gdl.minval[b] * avg_mask);
            thr = thr.min(eb_out[b]);
            thr_out[b] = thr;
        }
        for b in gdl.npart..CBANDS {
            eb_out[b] = 0.0;
            thr_out[b] = 0.0;
        }
    }

    fn compute_masking_s(
        &mut self,
        chn: usize,
        fftenergy_s: &[f32; HBLKSIZE_S],
        eb_out: &mut [f32; CBANDS],
        thr_out: &mut [f32; CBANDS],
    ) {
        let gds = &self.gds;
        let mut max = [0.0f32; CBANDS];
        let mut avg = [0.0f32; CBANDS];
        let mut mask_idx = [0u8; CBANDS];

        let mut j = 0usize;
        for b in 0..gds.npart {
            let mut ebb = 0.0f32;
            let mut m = 0.0f32;
            for _ in 0..gds.numlines[b] {
                let el = fftenergy_s[j];
                ebb += el;
                m = m.max(el);
                j += 1;
            }
            eb_out[b] = ebb;
            max[b] = m;
            avg[b] = ebb * gds.rnumlines[b];
        }
        calc_mask_index(gds, &max, &avg, &mut mask_idx);

        let mut k = 0usize;
        for b in 0..gds.npart {
            let mut kk = gds.s3ind[b][0];
            let last = gds.s3ind[b][1];
            let mut dd = mask_idx[kk] as i32;
            let mut dd_n = 1i32;
            let mut ecb = gds.s3[k] * eb_out[kk] * TAB[mask_idx[kk] as usize];
            k += 1;
            kk += 1;
            while kk <= last {
                dd += mask_idx[kk] as i32;
                dd_n += 1;
                let x = gds.s3[k] * eb_out[kk] * TAB[mask_idx[kk] as usize];
                ecb = mask_add(
                    ecb,
                    x,
                    kk as i32 - b as i32,
                    gds.ath_cb[kk] * self.ath_adjust_factor,
                );
                k += 1;
                kk += 1;
            }
            let avg_mask = TAB[((1 + 2 * dd) / (2 * dd_n)) as usize] * 0.5;
            ecb *= avg_mask;

            // limit by the previous granule, and by the pre-previous one
            // while a short run is ongoing
            let mut thr = ecb.min(RPELEV_S * self.psv.nb_s1[chn][b]);
            if self.psv.blocktype_old[chn & 1] == BlockType::Short {
                thr = thr.min(RPELEV2_S * self.psv.nb_s2[chn][b]);
            }
            self.psv.nb_s2[chn][b] = self.psv.nb_s1[chn][b];
            self.psv.nb_s1[chn][b] = ecb;

            thr = thr.min(max[b] * gds.minval[b] * avg_mask);
            thr = thr.min(eb_out[b]);
            thr_out[b] = thr;
        }
        for b in gds.npart..CBANDS {
            eb_out[b] = 0.0;
            thr_out[b] = 0.0;
        }
    }

    /// Sum partitions into long scalefactor bands, splitting the boundary
    /// partition by `bo_weight`.
    fn convert_partition2scalefac_l(&mut self, chn: usize, eb: &[f32; CBANDS], thr: &[f32; CBANDS]) {
        let gdl = &self.gdl;
        let mut enn = 0.0f32;
        let mut thmm = 0.0f32;
        let mut b = 0usize;
        let mut sb = 0usize;
        while sb < SBMAX_L {
            let b_lim = gdl.bo[sb].min(gdl.npart);
            while b < b_lim {
                debug_assert!(eb[b] >= 0.0 && thr[b] >= 0.0);
                enn += eb[b];
                thmm += thr[b];
                b += 1;
            }
            self.psv.en[chn].l[sb] = enn;
            self.psv.thm[chn].l[sb] = thmm;
            if b >= gdl.npart {
                sb += 1;
                break;
            }
            let w_curr = gdl.bo_weight[sb];
            let w_next = 1.0 - w_curr;
            self.psv.en[chn].l[sb] += w_curr * eb[b];
            self.psv.thm[chn].l[sb] += w_curr * thr[b];
            enn = w_next * eb[b];
            thmm = w_next * thr[b];
            b += 1;
            sb += 1;
        }
        while sb < SBMAX_L {
            self.psv.en[chn].l[sb] = 0.0;
            self.psv.thm[chn].l[sb] = 0.0;
            sb += 1;
        }
    }

    fn convert_partition2scalefac_s(
        &mut self,
        chn: usize,
        sblock: usize,
        eb: &[f32; CBANDS],
        thr: &[f32; CBANDS],
    ) {
        let gds = &self.gds;
        let mut enn = 0.0f32;
        let mut thmm = 0.0f32;
        let mut b = 0usize;
        let mut sb = 0usize;
        while sb < SBMAX_S {
            let b_lim = gds.bo[sb].min(gds.npart);
            while b < b_lim {
                debug_assert!(eb[b] >= 0.0 && thr[b] >= 0.0);
                enn += eb[b];
                thmm += thr[b];
                b += 1;
            }
            self.psv.en[chn].s[sb][sblock] = enn;
            self.psv.thm[chn].s[sb][sblock] = thmm;
            if b >= gds.npart {
                sb += 1;
                break;
            }
            let w_curr = gds.bo_weight[sb];
            let w_next = 1.0 - w_curr;
            self.psv.en[chn].s[sb][sblock] += w_curr * eb[b];
            self.psv.thm[chn].s[sb][sblock] += w_curr * thr[b];
            enn = w_next * eb[b];
            thmm = w_next * thr[b];
            b += 1;
            sb += 1;
        }
        while sb < SBMAX_S {
            self.psv.en[chn].s[sb][sblock] = 0.0;
            self.psv.thm[chn].s[sb][sblock] = 0.0;
            sb += 1;
        }
    }
}

/// The mask index is the 0..8 peakiness of a partition against its
/// immediate neighbours; higher means more tonal, hence less masking.
fn calc_mask_index(gd: &PsyConstBand, max: &[f32; CBANDS], avg: &[f32; CBANDS], idx: &mut [u8; CBANDS]) {
    let last = TAB.len() - 1;
    let npart = gd.npart;

    let edge = |m: f32, a: f32, lines: usize, count: f32| -> u8 {
        if a <= 0.0 {
            return 0;
        }
        let k = 20.0 * (m * count - a) / (a * (lines as f32 - 1.0));
        if k >= 0.0 {
            (k as usize).min(last) as u8
        } else {
            0
        }
    };

    idx[0] = edge(
        max[0].max(max[1]),
        avg[0] + avg[1],
        gd.numlines[0] + gd.numlines[1],
        2.0,
    );
    for b in 1..npart - 1 {
        idx[b] = edge(
            max[b - 1].max(max[b]).max(max[b + 1]),
            avg[b - 1] + avg[b] + avg[b + 1],
            gd.numlines[b - 1] + gd.numlines[b] + gd.numlines[b + 1],
            3.0,
        );
    }
    idx[npart - 1] = edge(
        max[npart - 2].max(max[npart - 1]),
        avg[npart - 2] + avg[npart - 1],
        gd.numlines[npart - 2] + gd.numlines[npart - 1],
        2.0,
    );
}

/// Mid/side thresholds from the Johnston & Ferreira demasking formula,
/// with the msfix safety rescale keeping M+S in step with L+R.
fn compute_ms_thresholds(
    eb: &mut [[f32; CBANDS]; 4],
    thr: &mut [[f32; CBANDS]; 4],
    mld_cb: &[f32; CBANDS],
    ath_cb: &[f32; CBANDS],
    ath_factor: f32,
    msfix: f32,
    npart: usize,
) {
    let msfix2 = msfix * 2.0;
    for b in 0..npart {
        let eb_m = eb[2][b];
        let eb_s = eb[3][b];
        let thm_l = thr[0][b];
        let thm_r = thr[1][b];
        let mut thm_m = thr[2][b];
        let mut thm_s = thr[3][b];

        // only when L and R masking differ by 2 dB or less
        let (mut rmid, mut rside) = if thm_l <= 1.58 * thm_r && thm_r <= 1.58 * thm_l {
            let mld_m = mld_cb[b] * eb_s;
            let mld_s = mld_cb[b] * eb_m;
            (
                thm_m.max(thm_s.min(mld_m)),
                thm_s.max(thm_m.min(mld_s)),
            )
        } else {
            (thm_m, thm_s)
        };

        if msfix > 0.0 {
            let ath = ath_cb[b] * ath_factor;
            let thm_lr = thm_l.max(ath).min(thm_r.max(ath));
            thm_m = rmid.max(ath);
            thm_s = rside.max(ath);
            let thm_ms = thm_m + thm_s;
            if thm_ms > 0.0 && thm_lr * msfix2 < thm_ms {
                let f = thm_lr * msfix2 / thm_ms;
                thm_m *= f;
                thm_s *= f;
            }
            rmid = thm_m.min(rmid);
            rside = thm_s.min(rside);
        }

        thr[2][b] = rmid.min(eb_m);
        thr[3][b] = rside.min(eb_s);
    }
}

#[rustfmt::skip]
const REGCOEF_L: [f32; 21] = [
    6.8, 5.8, 5.8, 6.4, 6.5, 9.9, 12.1, 14.4, 15.0, 18.9, 21.6, 26.9, 34.2,
    40.2, 46.8, 56.5, 60.7, 73.9, 85.7, 93.4, 126.1,
];
#[rustfmt::skip]
const REGCOEF_S: [f32; 12] = [
    11.8, 13.6, 17.2, 32.0, 46.5, 51.3, 57.5, 67.1, 71.5, 84.6, 97.6, 130.0,
];

/// Perceptual entropy, long blocks. The regression was fit at 44.1 kHz.
fn pecalc_l(mr: &PsyRatio, masking_lower: f32) -> f32 {
    let mut pe = 1124.23 / 4.0;
    for sb in 0..SBMAX_L - 1 {
        let thm = mr.thm.l[sb];
        if thm > 0.0 {
            let x = thm * masking_lower;
            let en = mr.en.l[sb];
            if en > x {
                if en > x * 1e10 {
                    pe += REGCOEF_L[sb] * 10.0;
                } else {
                    pe += REGCOEF_L[sb] * (en / x).log10();
                }
            }
        }
    }
    pe
}

/// Perceptual entropy, short blocks
fn pecalc_s(mr: &PsyRatio, masking_lower: f32) -> f32 {
    let mut pe = 1236.28 / 4.0;
    for sb in 0..SBMAX_S - 1 {
        for w in 0..3 {
            let thm = mr.thm.s[sb][w];
            if thm > 0.0 {
                let x = thm * masking_lower;
                let en = mr.en.s[sb][w];
                if en > x {
                    if en > x * 1e10 {
                        pe += REGCOEF_S[sb] * 10.0;
                    } else {
                        pe += REGCOEF_S[sb] * (en / x).log10();
                    }
                }
            }
        }
    }
    pe
}

/// Reservoir-dependent pre-echo strength: a full reservoir affords full
/// pre-echo control.
pub fn pcfact(vbr: VbrMode, resv_size: i32, resv_max: i32) -> f32 {
    match vbr {
        VbrMode::Off => {
            if resv_max == 0 {
                0.0
            } else {
                resv_size as f32 / resv_max as f32 * 0.5
            }
        }
        VbrMode::Abr => 1.0,
        _ => 0.6,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn session() -> SessionConfig {
        Config::default().resolve().unwrap()
    }

    #[test]
    fn freq2bark_is_monotone() {
        let mut last = -1.0;
        for f in (0..22050).step_by(50) {
            let b = freq2bark(f as f64);
            assert!(b >= last);
            last = b;
        }
        assert!(freq2bark(22050.0) < 26.0);
    }

    #[test]
    fn partition_setup_covers_the_spectrum() {
        let cfg = session();
        let psy = PsyModel::new(&cfg);
        assert!(psy.gdl.npart <= CBANDS);
        assert!(psy.gds.npart <= CBANDS);
        let sum_l: usize = psy.gdl.numlines[..psy.gdl.npart].iter().sum();
        let sum_s: usize = psy.gds.numlines[..psy.gds.npart].iter().sum();
        assert_eq!(sum_l, HBLKSIZE);
        assert_eq!(sum_s, HBLKSIZE_S);
        // spreading rows must stay inside the partition count
        for b in 0..psy.gdl.npart {
            assert!(psy.gdl.s3ind[b][1] < psy.gdl.npart);
            assert!(psy.gdl.s3ind[b][0] <= psy.gdl.s3ind[b][1]);
        }
        // band centers sit at or below the band edges
        for sfb in 0..SBMAX_L {
            assert!(psy.gdl.bm[sfb] <= psy.gdl.bo[sfb]);
        }
    }

    #[test]
    fn spreading_function_peaks_at_zero_distance() {
        assert!(s3_func(0.0) > s3_func(1.0));
        assert!(s3_func(0.0) > s3_func(-1.0));
        // steeper towards lower frequencies
        assert!(s3_func(-2.0) < s3_func(2.0));
        assert_eq!(s3_func(20.0), 0.0);
    }

    #[test]
    fn mask_add_of_equal_maskers_exceeds_either() {
        let m = mask_add(1.0, 1.0, 10, 1e-12);
        assert!(m >= 2.0);
        // a dominant masker absorbs a tiny one
        let m = mask_add(1.0, 1e-6, 10, 1e-12);
        assert!((m - 1.000001).abs() < 1e-4);
    }

    #[test]
    fn threshold_never_exceeds_energy_on_noise() {
        let cfg = session();
        let mut psy = PsyModel::new(&cfg);
        // deterministic pseudo-noise
        let mut state = 0x2545F491u32;
        let mut next = || {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state as f32 / u32::MAX as f32 - 0.5) * 20000.0
        };
        let buf: Vec<f32> = (0..4096).map(|_| next()).collect();

        let mut masking = [[PsyRatio::default(); 2]; 2];
        let mut masking_ms = [[PsyRatio::default(); 2]; 2];
        let mut pe = [[0.0f32; 2]; 2];
        let mut pe_ms = [[0.0f32; 2]; 2];

        // run a few granules so the sentinels wash out
        for _ in 0..4 {
            psy.analyze(
                &cfg,
                [&buf[..2048], &buf[1024..3072]],
                0,
                &mut masking,
                &mut masking_ms,
                &mut pe,
                &mut pe_ms,
                0.6,
            );
        }
        for chn in 0..2 {
            for sb in 0..SBMAX_L {
                let r = &masking[0][chn];
                assert!(
                    r.thm.l[sb] <= r.en.l[sb] * (1.0 + 1e-5),
                    "thm {} > en {} in band {sb}",
                    r.thm.l[sb],
                    r.en.l[sb]
                );
            }
        }
        for chn in 0..2 {
            assert!(pe[0][chn] > 0.0);
        }
    }

    #[test]
    fn block_machine_brackets_short_runs() {
        // Norm -> Start -> Short -> Stop -> Norm under an attack pulse
        let cfg = session();
        let mut psy = PsyModel::new(&cfg);
        psy.psv.blocktype_old = [BlockType::Norm; 2];

        let silent = vec![0.0f32; 4096];
        let mut loud = vec![0.0f32; 4096];
        for (i, s) in loud.iter_mut().enumerate() {
            // a hard attack inside the high-pass analysis region
            *s = if i >= 700 { 15000.0 } else { 0.0 };
        }

        let mut masking = [[PsyRatio::default(); 2]; 2];
        let mut masking_ms = [[PsyRatio::default(); 2]; 2];
        let mut pe = [[0.0f32; 2]; 2];
        let mut pe_ms = [[0.0f32; 2]; 2];
        let mut run = |psy: &mut PsyModel, buf: &[f32]| {
            psy.analyze(
                &cfg,
                [&buf[..2048], &buf[..2048]],
                0,
                &mut masking,
                &mut masking_ms,
                &mut pe,
                &mut pe_ms,
                0.6,
            )
        };

        let mut seen = Vec::new();
        for _ in 0..2 {
            seen.push(run(&mut psy, &silent)[0]);
        }
        seen.push(run(&mut psy, &loud)[0]);
        for _ in 0..3 {
            seen.push(run(&mut psy, &silent)[0]);
        }

        // a Short must appear, bracketed by Start and Stop
        let pos = seen.iter().position(|&b| b == BlockType::Short);
        assert!(pos.is_some(), "no short block in {seen:?}");
        let pos = pos.unwrap();
        assert_eq!(seen[pos - 1], BlockType::Start, "sequence {seen:?}");
        assert!(
            seen[pos + 1] == BlockType::Stop || seen[pos + 1] == BlockType::Short,
            "sequence {seen:?}"
        );
        // never Short directly adjacent to Norm
        for w in seen.windows(2) {
            assert!(
                !(w[0] == BlockType::Norm && w[1] == BlockType::Short),
                "sequence {seen:?}"
            );
            assert!(
                !(w[0] == BlockType::Short && w[1] == BlockType::Norm),
                "sequence {seen:?}"
            );
        }
    }
}

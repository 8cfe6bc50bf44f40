//! Noise-shaping quantization
//!
//! The outer iteration loop controls the masking conditions of all
//! scalefactor bands: it computes the best scalefactors and global gain,
//! calling the inner loop (a binary search on the global gain) until the
//! quantization noise sits under the allowed distortion within the bit
//! budget. When no distortion-free quantization exists, the best candidate
//! found is kept.
//!
//! Three rate policies drive the loop: CBR distributes a fixed frame
//! budget by perceptual entropy, ABR works against a floating target and
//! picks the cheapest frame bitrate afterwards, and the VBR modes wrap the
//! whole outer loop in a binary search on the bit budget itself.

use log::debug;

use crate::bitcount::{count_bits, ipow20, pow43, scale_bitcount, scale_bitcount_lsf};
use crate::config::{SessionConfig, Version};
use crate::reservoir::Reservoir;
use crate::tables::PRETAB;
use crate::types::{
    BlockType, GranuleInfo, PsyRatio, Scalefac, SfbBands, SideInfo, Xmin, GRANULE_SIZE,
    MAX_BITS, MAX_CHANNELS, MAX_GRANULES, SBMAX_L, SBMAX_S, SBPSY_S, SQRT2,
};

/// Everything one frame's quantization works on
pub struct FrameState<'a> {
    pub cfg: &'a SessionConfig,
    pub xr: &'a mut [[[f32; GRANULE_SIZE]; MAX_CHANNELS]; MAX_GRANULES],
    pub ratio: [[PsyRatio; MAX_CHANNELS]; MAX_GRANULES],
    pub pe: [[f32; MAX_CHANNELS]; MAX_GRANULES],
    pub ms_ener_ratio: [f32; MAX_GRANULES],
    pub l3_enc: &'a mut [[[i32; GRANULE_SIZE]; MAX_CHANNELS]; MAX_GRANULES],
    pub scalefac: &'a mut [[Scalefac; MAX_CHANNELS]; MAX_GRANULES],
    pub side_info: &'a mut SideInfo,
    pub resv: &'a mut Reservoir,
    pub ath_l: &'a [f32; SBMAX_L],
    pub ath_s: &'a [f32; SBMAX_S],
    pub sfb_l: &'a [usize; SBMAX_L + 1],
    pub sfb_s: &'a [usize; SBMAX_S + 1],
    /// Padding slot decided for this frame (CBR only)
    pub padding: bool,
    /// Chosen frame bitrate index (differs from the nominal one for
    /// ABR/VBR frames)
    pub bitrate_index: usize,
}

/// Noise summary of one quantization attempt
#[derive(Debug, Clone, Copy)]
struct NoiseResult {
    over_count: i32,
    /// dB over the allowed distortion, distorted bands only
    over_noise: f32,
    /// dB relative to the allowed distortion, all bands
    tot_noise: f32,
    max_noise: f32,
}

impl Default for NoiseResult {
    fn default() -> Self {
        Self {
            over_count: 100,
            over_noise: 0.0,
            tot_noise: 0.0,
            max_noise: 0.0,
        }
    }
}

/// Session-lived quantizer state: the warm start of the gain search
#[derive(Debug)]
pub struct QuantizeLoop {
    old_value: [i32; MAX_CHANNELS],
    current_step: i32,
}

impl Default for QuantizeLoop {
    fn default() -> Self {
        Self::new()
    }
}

enum BinSearchDirection {
    None,
    Up,
    Down,
}

/// Convert one granule's L/R spectra to mid/side
pub fn ms_convert(xr: &mut [[f32; GRANULE_SIZE]; MAX_CHANNELS]) {
    let (l, r) = xr.split_at_mut(1);
    for (a, b) in l[0].iter_mut().zip(r[0].iter_mut()) {
        let m = (*a + *b) * (SQRT2 * 0.5);
        let s = (*a - *b) * (SQRT2 * 0.5);
        *a = m;
        *b = s;
    }
}

/// Fresh cod_info and scalefactors; computes `xrpow = |xr|^(3/4)`.
/// Returns false on analog silence.
fn init_outer_loop(
    cod_info: &mut GranuleInfo,
    scalefac: &mut Scalefac,
    xr: &[f32; GRANULE_SIZE],
    xrpow: &mut [f32; GRANULE_SIZE],
) -> bool {
    cod_info.reset_for_granule();
    *scalefac = Scalefac::default();

    let mut any = false;
    for (p, &x) in xrpow.iter_mut().zip(xr.iter()) {
        let t = x.abs();
        *p = (t * t.sqrt()).sqrt();
        any |= t > 1e-20;
    }
    any
}

/// Allowed noise per scalefactor band from the masking ratio and the ATH.
/// Returns the number of bands whose energy clears the ATH, for analog
/// silence detection.
#[allow(clippy::too_many_arguments)]
fn calc_xmin(
    cod_info: &GranuleInfo,
    ratio: &PsyRatio,
    xr: &[f32; GRANULE_SIZE],
    l3_xmin: &mut Xmin,
    ath_l: &[f32; SBMAX_L],
    ath_s: &[f32; SBMAX_S],
    sfb_l: &[usize; SBMAX_L + 1],
    sfb_s: &[usize; SBMAX_S + 1],
    masking_lower: f32,
) -> i32 {
    let mut ath_over = 0;

    // the sfb21 overflow band has no psy output; its xmin is the bare ATH
    let n_long = if cod_info.block_type == BlockType::Short {
        cod_info.sfb_lmax
    } else {
        SBMAX_L
    };
    for sfb in 0..n_long {
        let start = sfb_l[sfb];
        let end = sfb_l[sfb + 1];
        let en0: f32 = xr[start..end].iter().map(|&v| v * v).sum();

        let mut xmin = ath_l[sfb];
        if ratio.en.l[sfb] > 0.0 {
            let x = en0 * ratio.thm.l[sfb] * masking_lower / ratio.en.l[sfb];
            xmin = xmin.max(x);
        }
        l3_xmin.l[sfb] = xmin;
        if en0 > ath_l[sfb] {
            ath_over += 1;
        }
    }

    if cod_info.block_type == BlockType::Short {
        let mut j = 0usize;
        for sfb in 0..SBMAX_S {
            let bw = sfb_s[sfb + 1] - sfb_s[sfb];
            for w in 0..3 {
                let en0: f32 = xr[j..j + bw].iter().map(|&v| v * v).sum();
                j += bw;

                let mut xmin = ath_s[sfb];
                if ratio.en.s[sfb][w] > 0.0 {
                    let x = en0 * ratio.thm.s[sfb][w] * masking_lower / ratio.en.s[sfb][w];
                    xmin = xmin.max(x);
                }
                l3_xmin.s[sfb][w] = xmin;
                if en0 > ath_s[sfb] {
                    ath_over += 1;
                }
            }
        }
    }
    ath_over
}

/// Quantization noise per band against the allowed distortion.
/// `distort[b] = noise / allowed`, so values above 1 are audible.
#[allow(clippy::too_many_arguments)]
fn calc_noise(
    xr: &[f32; GRANULE_SIZE],
    ix: &[i32; GRANULE_SIZE],
    cod_info: &GranuleInfo,
    l3_xmin: &Xmin,
    scalefac: &Scalefac,
    distort: &mut SfbBands,
    sfb_l: &[usize; SBMAX_L + 1],
    sfb_s: &[usize; SBMAX_S + 1],
) -> NoiseResult {
    let mut res = NoiseResult {
        over_count: 0,
        over_noise: 0.0,
        tot_noise: 0.0,
        max_noise: -200.0,
    };

    let mut account = |noise_ratio: f32, distort_slot: &mut f32| {
        *distort_slot = noise_ratio;
        let db = 10.0 * noise_ratio.max(1e-20).log10();
        res.tot_noise += db;
        res.max_noise = res.max_noise.max(db);
        if db > 0.0 {
            res.over_count += 1;
            res.over_noise += db;
        }
    };

    // the sfb21 overflow band is included here so residual distortion in
    // it is visible, even though no scalefactor can fix it
    let n_long = if cod_info.block_type == BlockType::Short {
        cod_info.sfb_lmax
    } else {
        SBMAX_L
    };
    for sfb in 0..n_long {
        let s = cod_info.global_gain
            - ((scalefac.l[sfb] + if cod_info.preflag != 0 { PRETAB[sfb] } else { 0 })
                << (cod_info.scalefac_scale + 1));
        let step = 2f32.powf(0.25 * (s as f32 - 210.0));
        let start = sfb_l[sfb];
        let end = sfb_l[sfb + 1];
        let mut noise = 0.0f32;
        for l in start..end {
            let diff = xr[l].abs() - pow43(ix[l]) * step;
            noise += diff * diff;
        }
        account(noise / l3_xmin.l[sfb].max(1e-20), &mut distort.l[sfb]);
    }

    if cod_info.block_type == BlockType::Short {
        let mut j = 0usize;
        for sfb in cod_info.sfb_smin..SBMAX_S {
            let bw = sfb_s[sfb + 1] - sfb_s[sfb];
            for w in 0..3 {
                let s = cod_info.global_gain
                    - 8 * cod_info.subblock_gain[w]
                    - (scalefac.s[sfb][w] << (cod_info.scalefac_scale + 1));
                let step = 2f32.powf(0.25 * (s as f32 - 210.0));
                let mut noise = 0.0f32;
                for l in j..j + bw {
                    let diff = xr[l].abs() - pow43(ix[l]) * step;
                    noise += diff * diff;
                }
                j += bw;
                account(noise / l3_xmin.s[sfb][w].max(1e-20), &mut distort.s[sfb][w]);
            }
        }
    }

    res
}

/// Which of two quantizations is better, by the configured criterion
fn quant_compare(mode: u8, best: &NoiseResult, calc: &NoiseResult) -> bool {
    match mode {
        1 => calc.max_noise < best.max_noise,
        2 => calc.tot_noise < best.tot_noise,
        3 => calc.tot_noise < best.tot_noise && calc.max_noise < best.max_noise + 2.0,
        4 => {
            (calc.max_noise <= 0.0 && best.max_noise > 2.0)
                || (calc.max_noise <= 0.0
                    && best.max_noise < 0.0
                    && best.max_noise > calc.max_noise - 2.0
                    && calc.tot_noise < best.tot_noise)
                || (calc.max_noise <= 0.0
                    && best.max_noise > 0.0
                    && best.max_noise > calc.max_noise - 2.0
                    && calc.tot_noise < best.tot_noise + best.over_noise)
                || (calc.max_noise > 0.0
                    && best.max_noise > -0.5
                    && best.max_noise > calc.max_noise - 1.0
                    && calc.tot_noise + calc.over_noise < best.tot_noise + best.over_noise)
                || (calc.max_noise > 0.0
                    && best.max_noise > -1.0
                    && best.max_noise > calc.max_noise - 1.5
                    && calc.tot_noise + calc.over_noise + calc.over_noise
                        < best.tot_noise + best.over_noise + best.over_noise)
        }
        5 => {
            calc.over_noise < best.over_noise
                || (calc.over_noise == best.over_noise && calc.tot_noise < best.tot_noise)
        }
        6 => {
            calc.over_noise < best.over_noise
                || (calc.over_noise == best.over_noise
                    && (calc.max_noise < best.max_noise
                        || (calc.max_noise == best.max_noise
                            && calc.tot_noise <= best.tot_noise)))
        }
        7 => calc.over_count < best.over_count || calc.over_noise < best.over_noise,
        _ => {
            calc.over_count < best.over_count
                || (calc.over_count == best.over_count && calc.over_noise < best.over_noise)
                || (calc.over_count == best.over_count
                    && calc.over_noise == best.over_noise
                    && calc.tot_noise < best.tot_noise)
        }
    }
}

/// Returns true once every band has been amplified at least once
fn loop_break(cod_info: &GranuleInfo, scalefac: &Scalefac) -> bool {
    for sfb in 0..cod_info.sfb_lmax {
        if scalefac.l[sfb] == 0 {
            return false;
        }
    }
    if cod_info.block_type == BlockType::Short {
        for sfb in cod_info.sfb_smin..SBPSY_S {
            for w in 0..3 {
                if scalefac.s[sfb][w] + cod_info.subblock_gain[w] == 0 {
                    return false;
                }
            }
        }
    }
    true
}

/// Amplify the scalefactor bands that violate the masking threshold,
/// C.1.5.4.3.5 of the IS. Only bands near the worst distortion move, so
/// the loop converges instead of amplifying everything at once.
fn amp_scalefac_bands(
    vbr: bool,
    cod_info: &GranuleInfo,
    scalefac: &mut Scalefac,
    distort: &SfbBands,
    xrpow: &mut [f32; GRANULE_SIZE],
    sfb_l: &[usize; SBMAX_L + 1],
    sfb_s: &[usize; SBMAX_S + 1],
) {
    let ifqstep34 = if cod_info.scalefac_scale == 0 {
        1.296_839_6 // 2^(0.75·0.5)
    } else {
        1.681_792_8 // 2^(0.75·1.0)
    };

    let mut max_dist = 0.0f32;
    for sfb in 0..cod_info.sfb_lmax {
        max_dist = max_dist.max(distort.l[sfb]);
    }
    if cod_info.block_type == BlockType::Short {
        for sfb in cod_info.sfb_smin..SBPSY_S {
            for w in 0..3 {
                max_dist = max_dist.max(distort.s[sfb][w]);
            }
        }
    }

    let thresh = if vbr {
        if max_dist > 1.0 {
            1.0
        } else {
            max_dist.powf(1.05)
        }
    } else if max_dist > 1.0 {
        1.0
    } else {
        max_dist * 0.95
    };

    for sfb in 0..cod_info.sfb_lmax {
        if distort.l[sfb] > thresh {
            scalefac.l[sfb] += 1;
            for x in xrpow[sfb_l[sfb]..sfb_l[sfb + 1]].iter_mut() {
                *x *= ifqstep34;
            }
        }
    }
    if cod_info.block_type == BlockType::Short {
        let mut j = 0usize;
        for sfb in cod_info.sfb_smin..SBPSY_S {
            let bw = sfb_s[sfb + 1] - sfb_s[sfb];
            for w in 0..3 {
                if distort.s[sfb][w] > thresh {
                    scalefac.s[sfb][w] += 1;
                    for x in xrpow[j..j + bw].iter_mut() {
                        *x *= ifqstep34;
                    }
                }
                j += bw;
            }
        }
    }
}

/// Turn on scalefac_scale, halving every scalefactor and rounding the odd
/// ones up through xrpow
fn inc_scalefac_scale(
    cod_info: &mut GranuleInfo,
    scalefac: &mut Scalefac,
    xrpow: &mut [f32; GRANULE_SIZE],
    sfb_l: &[usize; SBMAX_L + 1],
    sfb_s: &[usize; SBMAX_S + 1],
) {
    const IFQSTEP34: f32 = 1.296_839_6;

    for sfb in 0..cod_info.sfb_lmax {
        let mut s = scalefac.l[sfb] + if cod_info.preflag != 0 { PRETAB[sfb] } else { 0 };
        if s & 1 != 0 {
            s += 1;
            for x in xrpow[sfb_l[sfb]..sfb_l[sfb + 1]].iter_mut() {
                *x *= IFQSTEP34;
            }
        }
        scalefac.l[sfb] = s >> 1;
    }
    cod_info.preflag = 0;

    if cod_info.block_type == BlockType::Short {
        let mut j = 0usize;
        for sfb in cod_info.sfb_smin..SBPSY_S {
            let bw = sfb_s[sfb + 1] - sfb_s[sfb];
            for w in 0..3 {
                if scalefac.s[sfb][w] & 1 != 0 {
                    scalefac.s[sfb][w] += 1;
                    for x in xrpow[j..j + bw].iter_mut() {
                        *x *= IFQSTEP34;
                    }
                }
                scalefac.s[sfb][w] >>= 1;
                j += bw;
            }
        }
    }
    cod_info.scalefac_scale = 1;
}

/// Raise the subblock gain of windows whose scalefactors overflow,
/// folding 4 scalefactor steps into one gain step. Returns true when a
/// window is already at the gain ceiling.
fn inc_subblock_gain(
    cod_info: &mut GranuleInfo,
    scalefac: &mut Scalefac,
    xrpow: &mut [f32; GRANULE_SIZE],
    sfb_s: &[usize; SBMAX_S + 1],
) -> bool {
    for window in 0..3 {
        let mut s1 = 0i32;
        let mut s2 = 0i32;
        for sfb in cod_info.sfb_smin..6 {
            s1 = s1.max(scalefac.s[sfb][window]);
        }
        for sfb in 6..SBPSY_S {
            s2 = s2.max(scalefac.s[sfb][window]);
        }
        if s1 < 16 && s2 < 8 {
            continue;
        }
        if cod_info.subblock_gain[window] > 7 {
            return true;
        }

        // subblock gain reaches the bands above sfb12 too, which have no
        // scalefactor of their own
        cod_info.subblock_gain[window] += 1;
        for sfb in cod_info.sfb_smin..SBMAX_S {
            let s = scalefac.s[sfb][window] - (4 >> cod_info.scalefac_scale);
            if s >= 0 {
                scalefac.s[sfb][window] = s;
                continue;
            }
            scalefac.s[sfb][window] = 0;
            let bw = sfb_s[sfb + 1] - sfb_s[sfb];
            let start = sfb_s[sfb] * 3 + bw * window;
            let amp = ipow20(210 + (s << (cod_info.scalefac_scale + 1)));
            for x in xrpow[start..start + bw].iter_mut() {
                *x *= amp;
            }
        }
    }
    false
}

/// Amplify distorted bands; when scalefactors outgrow their fields try
/// scalefac_scale and, on short blocks, subblock gain. Returns false once
/// nothing more can be amplified.
#[allow(clippy::too_many_arguments)]
fn balance_noise(
    cfg: &SessionConfig,
    cod_info: &mut GranuleInfo,
    scalefac: &mut Scalefac,
    distort: &SfbBands,
    xrpow: &mut [f32; GRANULE_SIZE],
    sfb_l: &[usize; SBMAX_L + 1],
    sfb_s: &[usize; SBMAX_S + 1],
    vbr: bool,
) -> bool {
    amp_scalefac_bands(vbr, cod_info, scalefac, distort, xrpow, sfb_l, sfb_s);

    if loop_break(cod_info, scalefac) {
        return false; // all bands amplified
    }

    let mut over = if cfg.version == Version::Mpeg1 {
        scale_bitcount(scalefac, cod_info)
    } else {
        scale_bitcount_lsf(scalefac, cod_info)
    };
    if !over {
        return true;
    }

    if cfg.noise_shaping > 1 && cod_info.scalefac_scale == 0 {
        inc_scalefac_scale(cod_info, scalefac, xrpow, sfb_l, sfb_s);
        over = false;
    } else if cod_info.block_type == BlockType::Short && cfg.noise_shaping > 1 {
        over = inc_subblock_gain(cod_info, scalefac, xrpow, sfb_s)
            || loop_break(cod_info, scalefac);
    }

    if !over {
        over = if cfg.version == Version::Mpeg1 {
            scale_bitcount(scalefac, cod_info)
        } else {
            scale_bitcount_lsf(scalefac, cod_info)
        };
    }
    !over
}

impl QuantizeLoop {
    pub fn new() -> Self {
        Self {
            old_value: [180; MAX_CHANNELS],
            current_step: 4,
        }
    }

    /// Binary search for the smallest global gain whose bit count fits
    /// `desired_rate`, warm-started from the previous granule. The step
    /// halves on each direction reversal.
    fn bin_search_step_size(
        &mut self,
        desired_rate: i32,
        start: i32,
        ix: &mut [i32; GRANULE_SIZE],
        xrpow: &[f32; GRANULE_SIZE],
        xrpow_max: f32,
        cod_info: &mut GranuleInfo,
        sfb_l: &[usize],
    ) -> i32 {
        let mut step_size = start;
        let mut current_step = self.current_step;
        let mut flag_gone_over = false;
        let mut direction = BinSearchDirection::None;
        let mut bits;

        loop {
            cod_info.global_gain = step_size;
            bits = count_bits(ix, xrpow, xrpow_max, cod_info, sfb_l);

            if current_step == 1 {
                break;
            }
            if flag_gone_over {
                current_step /= 2;
            }

            if bits > desired_rate {
                if matches!(direction, BinSearchDirection::Down) && !flag_gone_over {
                    flag_gone_over = true;
                    current_step /= 2;
                }
                direction = BinSearchDirection::Up;
                step_size += current_step;
                if step_size > 255 {
                    break;
                }
            } else if bits < desired_rate {
                if matches!(direction, BinSearchDirection::Up) && !flag_gone_over {
                    flag_gone_over = true;
                    current_step /= 2;
                }
                direction = BinSearchDirection::Down;
                step_size -= current_step;
                if step_size < 0 {
                    break;
                }
            } else {
                break;
            }
        }
        cod_info.global_gain = step_size.clamp(0, 255);

        // seed the next search from how far this one travelled
        let travelled = start - step_size;
        self.current_step = if travelled / 4 != 0 { 4 } else { 2 };

        bits
    }

    /// Raise the gain until the count fits. The search above starts low,
    /// so this walks at most a few steps.
    fn inner_loop(
        &self,
        ix: &mut [i32; GRANULE_SIZE],
        xrpow: &[f32; GRANULE_SIZE],
        xrpow_max: f32,
        cod_info: &mut GranuleInfo,
        max_bits: i32,
        sfb_l: &[usize],
    ) -> i32 {
        debug_assert!(max_bits >= 0);
        let mut bits = count_bits(ix, xrpow, xrpow_max, cod_info, sfb_l);
        while bits > max_bits && cod_info.global_gain < 255 {
            cod_info.global_gain += 1;
            bits = count_bits(ix, xrpow, xrpow_max, cod_info, sfb_l);
        }
        // bit starvation: the budget is too small even at the coarsest
        // gain. Drop spectrum from the top until the count fits; the
        // rzero region costs nothing.
        let mut limit = GRANULE_SIZE;
        while bits > max_bits && limit > 0 {
            limit -= 32.min(limit);
            for v in ix[limit..].iter_mut() {
                *v = 0;
            }
            bits = crate::bitcount::noquant_count_bits(ix, cod_info, sfb_l);
        }
        bits
    }

    /// The outer loop proper. Returns the distorted-band count of the
    /// quantization left in `cod_info`/`l3_enc`.
    #[allow(clippy::too_many_arguments)]
    fn outer_loop(
        &mut self,
        st: &mut FrameState<'_>,
        gr: usize,
        ch: usize,
        l3_xmin: &Xmin,
        xrpow: &mut [f32; GRANULE_SIZE],
        targ_bits: i32,
    ) -> i32 {
        let cfg = st.cfg;
        let vbr = cfg.vbr.is_search();
        let mut cod_info = st.side_info.gr[gr][ch].clone();
        let mut scalefac = st.scalefac[gr][ch];
        let xr = &st.xr[gr][ch];

        let mut l3_enc_w = [0i32; GRANULE_SIZE];
        let mut distort = SfbBands::default();
        let mut best_noise = NoiseResult::default();
        let mut save_cod_info = cod_info.clone();
        let mut save_scalefac = scalefac;
        let mut save_xrpow = *xrpow;
        let mut copy = false;
        let mut age = 0;
        // the table-range guard needs the true spectrum ceiling, which
        // amplification keeps moving
        let mut xrpow_live = xrpow.iter().fold(0.0f32, |m, &v| m.max(v));

        let bits_found = self.bin_search_step_size(
            targ_bits,
            self.old_value[ch],
            &mut l3_enc_w,
            xrpow,
            xrpow_live,
            &mut cod_info,
            st.sfb_l,
        );
        self.old_value[ch] = cod_info.global_gain;

        let mut iteration = 0;
        loop {
            iteration += 1;
            let huff_bits = targ_bits - cod_info.part2_length as i32;
            if huff_bits < 0 {
                // scalefactors ate the whole budget; keep the previous
                // quantization
                debug_assert!(iteration != 1);
                break;
            }

            let real_bits = if iteration == 1 {
                if bits_found > huff_bits {
                    cod_info.global_gain += 1;
                    self.inner_loop(
                        &mut l3_enc_w,
                        xrpow,
                        xrpow_live,
                        &mut cod_info,
                        huff_bits,
                        st.sfb_l,
                    )
                } else {
                    bits_found
                }
            } else {
                self.inner_loop(
                    &mut l3_enc_w,
                    xrpow,
                    xrpow_live,
                    &mut cod_info,
                    huff_bits,
                    st.sfb_l,
                )
            };
            cod_info.part2_3_length = real_bits as u32;

            if cfg.noise_shaping == 0 {
                st.l3_enc[gr][ch] = l3_enc_w;
                copy = false;
                break;
            }

            let noise_info = calc_noise(
                xr,
                &l3_enc_w,
                &cod_info,
                l3_xmin,
                &scalefac,
                &mut distort,
                st.sfb_l,
                st.sfb_s,
            );

            let better = iteration == 1 || quant_compare(cfg.quant_comp, &best_noise, &noise_info);
            if better {
                best_noise = noise_info;
                st.l3_enc[gr][ch] = l3_enc_w;
                age = 0;
            } else {
                age += 1;
            }

            // a handful of unsuccessful tries after a distortion-free
            // quantization is enough
            if age > 3 && best_noise.over_count == 0 {
                break;
            }

            // residual distortion in sfb21 cannot be amplified away; in
            // the VBR search more bits are the only cure, so give up here
            if cfg.sfb21_extra {
                let last_distorted = if cod_info.block_type == BlockType::Short {
                    distort.s[SBMAX_S - 1].iter().any(|&d| d > 1.0)
                } else {
                    distort.l[SBMAX_L - 1] > 1.0
                };
                if last_distorted {
                    break;
                }
            }

            if better {
                copy = true;
                save_cod_info = cod_info.clone();
                save_scalefac = scalefac;
                if vbr {
                    save_xrpow = *xrpow;
                }
            }

            if !balance_noise(
                cfg,
                &mut cod_info,
                &mut scalefac,
                &distort,
                xrpow,
                st.sfb_l,
                st.sfb_s,
                vbr,
            ) {
                break;
            }
            // amplification may have raised the spectrum ceiling
            xrpow_live = xrpow.iter().fold(0.0f32, |m, &v| m.max(v));
        }

        if copy {
            cod_info = save_cod_info;
            scalefac = save_scalefac;
            if vbr {
                *xrpow = save_xrpow;
            }
        }
        cod_info.part2_3_length += cod_info.part2_length;
        debug_assert!(cod_info.global_gain < 256);
        debug_assert!(cod_info.part2_3_length <= MAX_BITS as u32);

        st.side_info.gr[gr][ch] = cod_info;
        st.scalefac[gr][ch] = scalefac;
        best_noise.over_count
    }

    /// CBR: a reservoir-aware share of the frame's mean bits per granule,
    /// topped up by perceptual entropy.
    pub fn cbr_iteration_loop(&mut self, st: &mut FrameState<'_>) {
        let cfg = st.cfg;
        let mean_bits = cfg.mean_bits(cfg.bitrate_index, st.padding);
        st.bitrate_index = cfg.bitrate_index;
        st.resv.frame_begin(cfg, cfg.bitrate_index, st.padding);

        let mut xrpow = Box::new([0.0f32; GRANULE_SIZE]);
        let mut l3_xmin = Xmin::default();

        for gr in 0..cfg.mode_gr {
            let mut targ_bits = [0i32; MAX_CHANNELS];
            let max_bits = on_pe(cfg, st.resv, &st.pe[gr], st.side_info, &mut targ_bits, mean_bits, gr);

            if cfg.is_ms() {
                ms_convert(&mut st.xr[gr]);
                reduce_side(&mut targ_bits, st.ms_ener_ratio[gr], mean_bits, max_bits);
            }

            for ch in 0..cfg.channels_out {
                let has_energy = init_outer_loop(
                    &mut st.side_info.gr[gr][ch],
                    &mut st.scalefac[gr][ch],
                    &st.xr[gr][ch],
                    &mut xrpow,
                );
                if !has_energy {
                    st.l3_enc[gr][ch] = [0; GRANULE_SIZE];
                    st.side_info.gr[gr][ch].part2_3_length = 0;
                } else {
                    calc_xmin(
                        &st.side_info.gr[gr][ch],
                        &st.ratio[gr][ch],
                        &st.xr[gr][ch],
                        &mut l3_xmin,
                        st.ath_l,
                        st.ath_s,
                        st.sfb_l,
                        st.sfb_s,
                        cfg.masking_lower,
                    );
                    self.outer_loop(st, gr, ch, &l3_xmin, &mut xrpow, targ_bits[ch]);
                }
                finish_granule(st, gr, ch, mean_bits);
            }
        }
        st.resv.frame_end(cfg, st.side_info, mean_bits);
    }

    /// ABR: quantize against a PE-scaled floating target, then emit the
    /// frame at the smallest bitrate whose pool admits the bits used.
    pub fn abr_iteration_loop(&mut self, st: &mut FrameState<'_>) {
        let cfg = st.cfg;
        let mut targ_bits = [[0i32; MAX_CHANNELS]; MAX_GRANULES];
        let mut analog_silence_bits = 0;
        let mut max_frame_bits = 0;
        calc_target_bits(
            st,
            &mut targ_bits,
            &mut analog_silence_bits,
            &mut max_frame_bits,
        );

        let mut xrpow = Box::new([0.0f32; GRANULE_SIZE]);
        let mut l3_xmin = Xmin::default();
        let mut totbits = 0i32;

        for gr in 0..cfg.mode_gr {
            if cfg.is_ms() {
                ms_convert(&mut st.xr[gr]);
            }
            for ch in 0..cfg.channels_out {
                let has_energy = init_outer_loop(
                    &mut st.side_info.gr[gr][ch],
                    &mut st.scalefac[gr][ch],
                    &st.xr[gr][ch],
                    &mut xrpow,
                );
                if !has_energy {
                    st.l3_enc[gr][ch] = [0; GRANULE_SIZE];
                    st.side_info.gr[gr][ch].part2_3_length = 0;
                } else {
                    let ath_over = calc_xmin(
                        &st.side_info.gr[gr][ch],
                        &st.ratio[gr][ch],
                        &st.xr[gr][ch],
                        &mut l3_xmin,
                        st.ath_l,
                        st.ath_s,
                        st.sfb_l,
                        st.sfb_s,
                        cfg.masking_lower,
                    );
                    let bits = if ath_over == 0 {
                        analog_silence_bits
                    } else {
                        targ_bits[gr][ch]
                    };
                    self.outer_loop(st, gr, ch, &l3_xmin, &mut xrpow, bits);
                }
                totbits += st.side_info.gr[gr][ch].part2_3_length as i32;
            }
        }

        // cheapest bitrate able to hold what was spent
        let mut index = st.cfg.vbr_min_bitrate_index;
        while index < cfg.vbr_max_bitrate_index {
            let pool = st.resv.frame_begin(cfg, index, false);
            if totbits <= pool {
                break;
            }
            index += 1;
        }
        st.bitrate_index = index;
        let mean_bits = cfg.mean_bits(index, false);
        st.resv.frame_begin(cfg, index, false);

        for gr in 0..cfg.mode_gr {
            for ch in 0..cfg.channels_out {
                finish_granule(st, gr, ch, mean_bits);
            }
        }
        st.resv.frame_end(cfg, st.side_info, mean_bits);
    }

    /// VBR: per granule, binary-search the bit budget between the PE floor
    /// and the ceiling of the highest allowed bitrate, keeping the best
    /// distortion-free quantization.
    pub fn vbr_iteration_loop(&mut self, st: &mut FrameState<'_>) {
        let cfg = st.cfg;
        let mut l3_xmin = [[Xmin::default(); MAX_CHANNELS]; MAX_GRANULES];
        let mut bands = [[0i32; MAX_CHANNELS]; MAX_GRANULES];
        let mut frame_bits = [0i32; 15];

        let analog_silence = self.vbr_prepare(st, &mut l3_xmin, &mut bands);

        // bits each bitrate would provide
        let min_mean_bits = cfg.mean_bits(cfg.vbr_min_bitrate_index, false) / cfg.channels_out as i32;
        let analog_mean_bits = cfg.mean_bits(1, false) / cfg.channels_out as i32;
        for (i, fb) in frame_bits
            .iter_mut()
            .enumerate()
            .take(cfg.vbr_max_bitrate_index + 1)
            .skip(1)
        {
            *fb = st.resv.frame_begin(cfg, i, false);
        }

        let mut xrpow = Box::new([0.0f32; GRANULE_SIZE]);
        let mut used_bits = 0i32;
        let mut save_bits = [[0i32; MAX_CHANNELS]; MAX_GRANULES];

        for gr in 0..cfg.mode_gr {
            for ch in 0..cfg.channels_out {
                let has_energy = init_outer_loop(
                    &mut st.side_info.gr[gr][ch],
                    &mut st.scalefac[gr][ch],
                    &st.xr[gr][ch],
                    &mut xrpow,
                );
                if !has_energy {
                    st.l3_enc[gr][ch] = [0; GRANULE_SIZE];
                    save_bits[gr][ch] = 0;
                    st.side_info.gr[gr][ch].part2_3_length = 0;
                    continue;
                }

                let min_bits = calc_min_bits(
                    cfg,
                    &st.side_info.gr[gr][ch],
                    st.pe[gr][ch] as i32,
                    st.ms_ener_ratio[gr],
                    bands[gr][ch],
                    save_bits[gr][0],
                    analog_mean_bits,
                    min_mean_bits,
                    analog_silence,
                    ch,
                );
                let max_bits = calc_max_bits(cfg, &frame_bits, min_bits);

                self.vbr_encode_granule(
                    st,
                    gr,
                    ch,
                    &l3_xmin[gr][ch],
                    &mut xrpow,
                    min_bits,
                    max_bits,
                );
                save_bits[gr][ch] = st.side_info.gr[gr][ch].part2_3_length as i32;
                used_bits += save_bits[gr][ch];
            }
        }

        // lowest bitrate able to hold the used bits
        let mut index = if analog_silence != 0 {
            1
        } else {
            cfg.vbr_min_bitrate_index
        };
        while index < cfg.vbr_max_bitrate_index {
            if used_bits <= frame_bits[index] {
                break;
            }
            index += 1;
        }
        st.bitrate_index = index;
        let mean_bits = cfg.mean_bits(index, false);
        let bits = st.resv.frame_begin(cfg, index, false);

        // re-quantize granules that violate what the chosen frame offers
        if used_bits > bits {
            for gr in 0..cfg.mode_gr {
                for ch in 0..cfg.channels_out {
                    save_bits[gr][ch] = (save_bits[gr][ch] * frame_bits[index]) / used_bits;
                    let has_energy = init_outer_loop(
                        &mut st.side_info.gr[gr][ch],
                        &mut st.scalefac[gr][ch],
                        &st.xr[gr][ch],
                        &mut xrpow,
                    );
                    if !has_energy {
                        st.l3_enc[gr][ch] = [0; GRANULE_SIZE];
                        st.side_info.gr[gr][ch].part2_3_length = 0;
                    } else {
                        self.outer_loop(
                            st,
                            gr,
                            ch,
                            &l3_xmin[gr][ch],
                            &mut xrpow,
                            save_bits[gr][ch].min(MAX_BITS),
                        );
                    }
                }
            }
        }

        for gr in 0..cfg.mode_gr {
            for ch in 0..cfg.channels_out {
                finish_granule(st, gr, ch, mean_bits);
            }
        }
        st.resv.frame_end(cfg, st.side_info, mean_bits);
    }

    /// Masking adjustment and allowed-noise tables for a VBR frame.
    /// Returns nonzero when the whole frame is analog silence.
    fn vbr_prepare(
        &mut self,
        st: &mut FrameState<'_>,
        l3_xmin: &mut [[Xmin; MAX_CHANNELS]; MAX_GRANULES],
        bands: &mut [[i32; MAX_CHANNELS]; MAX_GRANULES],
    ) -> i32 {
        const DB_Q: [f32; 10] = [-4.0, -3.0, -2.0, -1.0, 0.0, 0.5, 1.0, 1.5, 2.0, 2.5];
        let cfg = st.cfg;
        let mut analog_silence = 1;

        for gr in 0..cfg.mode_gr {
            if cfg.is_ms() {
                ms_convert(&mut st.xr[gr]);
            }
            for ch in 0..cfg.channels_out {
                let cod_info = &st.side_info.gr[gr][ch];
                let pe = st.pe[gr][ch];
                let adjust = if cod_info.block_type == BlockType::Short {
                    5.0 / (1.0 + (3.5 - pe / 300.0).exp()) - 0.14
                } else {
                    2.0 / (1.0 + (3.5 - pe / 300.0).exp()) - 0.05
                };
                let masking_lower_db = DB_Q[cfg.vbr_quality] - adjust;
                let masking_lower = 10f32.powf(masking_lower_db * 0.1);

                bands[gr][ch] = calc_xmin(
                    cod_info,
                    &st.ratio[gr][ch],
                    &st.xr[gr][ch],
                    &mut l3_xmin[gr][ch],
                    st.ath_l,
                    st.ath_s,
                    st.sfb_l,
                    st.sfb_s,
                    masking_lower,
                );
                if bands[gr][ch] != 0 {
                    analog_silence = 0;
                }
            }
        }
        analog_silence
    }

    /// Binary search on the bit budget: on a distortion-free result try
    /// fewer bits, otherwise raise the floor, converging within 32 bits.
    #[allow(clippy::too_many_arguments)]
    fn vbr_encode_granule(
        &mut self,
        st: &mut FrameState<'_>,
        gr: usize,
        ch: usize,
        l3_xmin: &Xmin,
        xrpow: &mut [f32; GRANULE_SIZE],
        mut min_bits: i32,
        mut max_bits: i32,
    ) {
        debug_assert!(max_bits < 4096);
        let max_bits_cap = max_bits;
        let mut real_bits = max_bits + 1;
        let mut this_bits = min_bits + (max_bits - min_bits) / 2;

        let mut bst_cod_info = st.side_info.gr[gr][ch].clone();
        let mut bst_scalefac = Scalefac::default();
        let mut bst_xrpow = *xrpow;
        let mut bst_l3_enc = st.l3_enc[gr][ch];

        loop {
            debug_assert!(this_bits >= min_bits);
            debug_assert!(this_bits <= max_bits);

            let over = self.outer_loop(st, gr, ch, l3_xmin, xrpow, this_bits);

            let dbits;
            if over <= 0 {
                // it can be done in this_bits; remember it and try less
                real_bits = st.side_info.gr[gr][ch].part2_3_length as i32;
                bst_cod_info = st.side_info.gr[gr][ch].clone();
                bst_scalefac = st.scalefac[gr][ch];
                bst_xrpow = *xrpow;
                bst_l3_enc = st.l3_enc[gr][ch];

                max_bits = real_bits - 32;
                dbits = max_bits - min_bits;
                this_bits = min_bits + dbits / 2;
            } else {
                min_bits = this_bits + 32;
                dbits = max_bits - min_bits;
                this_bits = min_bits + dbits / 2;

                if dbits > 8 {
                    // restart from the best quantization so far
                    st.side_info.gr[gr][ch] = bst_cod_info.clone();
                    st.scalefac[gr][ch] = bst_scalefac;
                    *xrpow = bst_xrpow;
                }
            }
            if dbits <= 8 {
                break;
            }
        }

        if real_bits <= max_bits_cap {
            st.side_info.gr[gr][ch] = bst_cod_info;
            st.scalefac[gr][ch] = bst_scalefac;
            st.l3_enc[gr][ch] = bst_l3_enc;
        }
        debug!(
            "vbr granule {gr}/{ch}: {} bits of [{min_bits}, {max_bits_cap}]",
            st.side_info.gr[gr][ch].part2_3_length
        );
    }
}

/// Sign the quantized values from the spectrum and settle the reservoir
fn finish_granule(st: &mut FrameState<'_>, gr: usize, ch: usize, mean_bits: i32) {
    st.resv.adjust(st.cfg, &st.side_info.gr[gr][ch], mean_bits);
    for (q, &x) in st.l3_enc[gr][ch].iter_mut().zip(st.xr[gr][ch].iter()) {
        if x < 0.0 && *q > 0 {
            *q = -*q;
        }
    }
}

/// CBR bit allocation for one granule: the mean share per channel plus
/// extra from the reservoir for high perceptual entropy, with short
/// blocks always getting some headroom.
fn on_pe(
    cfg: &SessionConfig,
    resv: &Reservoir,
    pe: &[f32; MAX_CHANNELS],
    side_info: &SideInfo,
    targ_bits: &mut [i32; MAX_CHANNELS],
    mean_bits: i32,
    gr: usize,
) -> i32 {
    let (tbits, mut extra_bits) = resv.max_bits(cfg, mean_bits);
    let max_bits = (tbits + extra_bits).min(MAX_BITS);
    let mean_ch = mean_bits / cfg.channels_out as i32;

    let mut add = [0i32; MAX_CHANNELS];
    let mut bits_sum = 0i32;
    for ch in 0..cfg.channels_out {
        // the reservoir-adjusted share, not the raw mean: this is what
        // lets quiet granules bank bits for the loud ones
        targ_bits[ch] = (tbits / cfg.channels_out as i32).clamp(125, MAX_BITS);
        if pe[ch] > 700.0 {
            let mut add_bits = ((pe[ch] - 700.0) / 1.4) as i32;
            if side_info.gr[gr][ch].block_type == BlockType::Short {
                add_bits = add_bits.max(mean_ch / 4);
            }
            add_bits = add_bits.clamp(0, mean_ch * 3 / 4);
            add_bits = add_bits.min((MAX_BITS - targ_bits[ch]).max(0));
            add[ch] = add_bits;
            bits_sum += add_bits;
        }
    }
    if bits_sum > extra_bits && bits_sum > 0 {
        for a in add.iter_mut() {
            *a = extra_bits * *a / bits_sum;
        }
    }
    for ch in 0..cfg.channels_out {
        targ_bits[ch] += add[ch];
        extra_bits -= add[ch];
    }
    max_bits
}

/// Move bits from the side channel to the mid channel in proportion to
/// how mid-heavy the frame's energy is
fn reduce_side(targ_bits: &mut [i32; MAX_CHANNELS], ms_ener_ratio: f32, mean_bits: i32, max_bits: i32) {
    // ms_ener_ratio 0 -> 66/33 split, 0.5 -> 50/50
    let fac = (0.33 * (0.5 - ms_ener_ratio) / 0.5).clamp(0.0, 0.5);
    let mut move_bits = (fac * 0.5 * (targ_bits[0] + targ_bits[1]) as f32) as i32;
    move_bits = move_bits.min(MAX_BITS - targ_bits[0]).max(0);

    if targ_bits[1] >= 125 {
        if targ_bits[1] - move_bits > 125 {
            // don't starve a mid channel already past the average
            if targ_bits[0] < mean_bits {
                targ_bits[0] += move_bits;
            }
            targ_bits[1] -= move_bits;
        } else {
            targ_bits[0] += targ_bits[1] - 125;
            targ_bits[1] = 125;
        }
    }

    let total = targ_bits[0] + targ_bits[1];
    if total > max_bits {
        targ_bits[0] = max_bits * targ_bits[0] / total;
        targ_bits[1] = max_bits * targ_bits[1] / total;
    }
}

/// ABR targets: a compression-ratio share of the mean, PE top-up, side
/// reduction, and repartitioning into the largest allowed frame.
fn calc_target_bits(
    st: &mut FrameState<'_>,
    targ_bits: &mut [[i32; MAX_CHANNELS]; MAX_GRANULES],
    analog_silence_bits: &mut i32,
    max_frame_bits: &mut i32,
) {
    let cfg = st.cfg;
    *max_frame_bits = st.resv.frame_begin(cfg, cfg.vbr_max_bitrate_index, false);
    *analog_silence_bits = cfg.mean_bits(1, false) / cfg.channels_out as i32;

    let mut mean_bits =
        (cfg.vbr_mean_bitrate_kbps as i32 * cfg.framesize as i32 * 1000) / cfg.samplerate_out as i32;
    mean_bits -= 8 * cfg.sideinfo_len as i32;
    mean_bits /= cfg.mode_gr as i32;

    let res_factor =
        (0.9 + 0.1 * (11.0 - cfg.compression_ratio) / (11.0 - 5.5)).clamp(0.9, 1.0);

    for gr in 0..cfg.mode_gr {
        for ch in 0..cfg.channels_out {
            let mean_ch = mean_bits / cfg.channels_out as i32;
            targ_bits[gr][ch] = (res_factor * mean_ch as f32) as i32;
            if st.pe[gr][ch] > 700.0 {
                let mut add_bits = ((st.pe[gr][ch] - 700.0) / 1.4) as i32;
                if st.side_info.gr[gr][ch].block_type == BlockType::Short {
                    add_bits = add_bits.max(mean_ch / 4);
                }
                add_bits = add_bits.clamp(0, mean_ch * 3 / 4);
                targ_bits[gr][ch] += add_bits;
            }
        }
    }

    if cfg.is_ms() {
        for gr in 0..cfg.mode_gr {
            let mut pair = [targ_bits[gr][0], targ_bits[gr][1]];
            reduce_side(&mut pair, st.ms_ener_ratio[gr], mean_bits, MAX_BITS);
            targ_bits[gr][0] = pair[0];
            targ_bits[gr][1] = pair[1];
        }
    }

    let mut totbits = 0i32;
    for gr in 0..cfg.mode_gr {
        for ch in 0..cfg.channels_out {
            targ_bits[gr][ch] = targ_bits[gr][ch].min(MAX_BITS);
            totbits += targ_bits[gr][ch];
        }
    }
    if totbits > *max_frame_bits {
        for gr in 0..cfg.mode_gr {
            for ch in 0..cfg.channels_out {
                targ_bits[gr][ch] = targ_bits[gr][ch] * *max_frame_bits / totbits;
            }
        }
    }
}

/// Minimum bits for a VBR granule, from the perceptual entropy and the
/// count of bands above the ATH
#[allow(clippy::too_many_arguments)]
fn calc_min_bits(
    cfg: &SessionConfig,
    cod_info: &GranuleInfo,
    pe: i32,
    ms_ener_ratio: f32,
    bands: i32,
    mch_bits: i32,
    analog_mean_bits: i32,
    min_mean_bits: i32,
    analog_silence: i32,
    ch: usize,
) -> i32 {
    let mut min_bits = 125.max(min_mean_bits);
    if cfg.is_ms() && ch == 1 {
        min_bits = min_bits.max(mch_bits / 5);
    }

    let mut min_pe_bits = if cod_info.block_type == BlockType::Short {
        (pe - 350) * bands / 39
    } else {
        (pe - 350) * bands / 22
    };
    if cfg.is_ms() && ch == 1 {
        // the side channel lives on a lower skeleton
        let fac = 0.33 * (0.5 - ms_ener_ratio) / 0.5;
        min_pe_bits = (min_pe_bits as f32 * ((1.0 - fac) / (1.0 + fac))) as i32;
    }
    min_pe_bits = min_pe_bits.min(1820 * cfg.samplerate_out as i32 / 44100);

    if analog_silence != 0 {
        analog_mean_bits
    } else {
        min_bits.max(min_pe_bits)
    }
}

fn calc_max_bits(cfg: &SessionConfig, frame_bits: &[i32; 15], min_bits: i32) -> i32 {
    let mut max_bits = frame_bits[cfg.vbr_max_bitrate_index];
    max_bits /= (cfg.channels_out * cfg.mode_gr) as i32;
    max_bits = (1200 + max_bits).min(MAX_BITS - 195 * (cfg.channels_out as i32 - 1));
    max_bits.max(min_bits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, VbrMode};
    use crate::tables::{SFB_LONG, SFB_SHORT};
    use crate::types::SBPSY_L;

    fn frame_state_fixture(
        cfg: &SessionConfig,
    ) -> (
        Box<[[[f32; GRANULE_SIZE]; MAX_CHANNELS]; MAX_GRANULES]>,
        Box<[[[i32; GRANULE_SIZE]; MAX_CHANNELS]; MAX_GRANULES]>,
        Box<[[Scalefac; MAX_CHANNELS]; MAX_GRANULES]>,
        SideInfo,
        Reservoir,
        [f32; SBMAX_L],
        [f32; SBMAX_S],
    ) {
        let _ = cfg;
        (
            Box::new([[[0.0; GRANULE_SIZE]; MAX_CHANNELS]; MAX_GRANULES]),
            Box::new([[[0; GRANULE_SIZE]; MAX_CHANNELS]; MAX_GRANULES]),
            Box::new([[Scalefac::default(); MAX_CHANNELS]; MAX_GRANULES]),
            SideInfo::default(),
            Reservoir::new(),
            [1e-6; SBMAX_L],
            [1e-6; SBMAX_S],
        )
    }

    fn loud_ratio() -> [[PsyRatio; MAX_CHANNELS]; MAX_GRANULES] {
        let mut r = [[PsyRatio::default(); MAX_CHANNELS]; MAX_GRANULES];
        for gr in r.iter_mut() {
            for ch in gr.iter_mut() {
                for sfb in 0..SBMAX_L {
                    ch.en.l[sfb] = 1e8;
                    ch.thm.l[sfb] = 1e5;
                }
                for sfb in 0..SBMAX_S {
                    for w in 0..3 {
                        ch.en.s[sfb][w] = 1e8;
                        ch.thm.s[sfb][w] = 1e5;
                    }
                }
            }
        }
        r
    }

    #[test]
    fn silence_quantizes_to_nothing() {
        let cfg = Config::default().resolve().unwrap();
        let (mut xr, mut l3_enc, mut scalefac, mut side, mut resv, ath_l, ath_s) =
            frame_state_fixture(&cfg);
        let mut st = FrameState {
            cfg: &cfg,
            xr: &mut xr,
            ratio: loud_ratio(),
            pe: [[0.0; MAX_CHANNELS]; MAX_GRANULES],
            ms_ener_ratio: [0.5; MAX_GRANULES],
            l3_enc: &mut l3_enc,
            scalefac: &mut scalefac,
            side_info: &mut side,
            resv: &mut resv,
            ath_l: &ath_l,
            ath_s: &ath_s,
            sfb_l: &SFB_LONG[0],
            sfb_s: &SFB_SHORT[0],
            padding: false,
            bitrate_index: 0,
        };
        let mut ql = QuantizeLoop::new();
        ql.cbr_iteration_loop(&mut st);

        for gr in 0..2 {
            for ch in 0..2 {
                assert!(l3_enc[gr][ch].iter().all(|&q| q == 0));
                let gain = side.gr[gr][ch].global_gain;
                assert!((0..256).contains(&gain));
            }
        }
        // silent granules bank their whole share, minus stuffing
        assert!(resv.resv_size >= 0);
        assert!(resv.resv_size <= resv.resv_max);
    }

    #[test]
    fn cbr_meets_the_bit_budget_on_a_tone() {
        let cfg = Config::default().resolve().unwrap();
        let (mut xr, mut l3_enc, mut scalefac, mut side, mut resv, ath_l, ath_s) =
            frame_state_fixture(&cfg);
        // a strong low-frequency spectrum
        for gr in 0..2 {
            for ch in 0..2 {
                for (i, v) in xr[gr][ch].iter_mut().enumerate().take(200) {
                    *v = 30000.0 / (i + 1) as f32 * if i % 2 == 0 { 1.0 } else { -1.0 };
                }
            }
        }
        let mut st = FrameState {
            cfg: &cfg,
            xr: &mut xr,
            ratio: loud_ratio(),
            pe: [[800.0; MAX_CHANNELS]; MAX_GRANULES],
            ms_ener_ratio: [0.5; MAX_GRANULES],
            l3_enc: &mut l3_enc,
            scalefac: &mut scalefac,
            side_info: &mut side,
            resv: &mut resv,
            ath_l: &ath_l,
            ath_s: &ath_s,
            sfb_l: &SFB_LONG[0],
            sfb_s: &SFB_SHORT[0],
            padding: false,
            bitrate_index: 0,
        };
        let mut ql = QuantizeLoop::new();
        ql.cbr_iteration_loop(&mut st);

        let mean_bits = cfg.mean_bits(cfg.bitrate_index, false);
        let mut frame_total = 0i64;
        for gr in 0..2 {
            for ch in 0..2 {
                let gi = &side.gr[gr][ch];
                assert!(gi.part2_3_length <= MAX_BITS as u32);
                assert!(gi.part2_3_length > 0, "no bits spent on a loud tone");
                assert!((0..256).contains(&gi.global_gain));
                // scalefactors within field ranges
                let cap = if gi.scalefac_scale == 0 { 16 } else { 8 };
                for sfb in 0..SBPSY_L {
                    assert!(scalefac[gr][ch].l[sfb] < cap);
                }
                frame_total += gi.part2_3_length as i64;
            }
        }
        // the frame's spend stays within the pool plus the reservoir bound
        assert!(frame_total <= (mean_bits as i64) * 2 + 8 * 511);
        assert!(resv.resv_size <= resv.resv_max);
    }

    #[test]
    fn vbr_loop_prefers_fewer_bits_on_easy_signal() {
        let cfg = Config {
            vbr: VbrMode::Rh,
            vbr_quality: 4,
            ..Default::default()
        }
        .resolve()
        .unwrap();
        let (mut xr, mut l3_enc, mut scalefac, mut side, mut resv, ath_l, ath_s) =
            frame_state_fixture(&cfg);
        for gr in 0..2 {
            for ch in 0..2 {
                for (i, v) in xr[gr][ch].iter_mut().enumerate().take(30) {
                    *v = 500.0 / (i + 1) as f32;
                }
            }
        }
        let mut st = FrameState {
            cfg: &cfg,
            xr: &mut xr,
            ratio: loud_ratio(),
            pe: [[400.0; MAX_CHANNELS]; MAX_GRANULES],
            ms_ener_ratio: [0.5; MAX_GRANULES],
            l3_enc: &mut l3_enc,
            scalefac: &mut scalefac,
            side_info: &mut side,
            resv: &mut resv,
            ath_l: &ath_l,
            ath_s: &ath_s,
            sfb_l: &SFB_LONG[0],
            sfb_s: &SFB_SHORT[0],
            padding: false,
            bitrate_index: 0,
        };
        let mut ql = QuantizeLoop::new();
        ql.vbr_iteration_loop(&mut st);

        assert!(st.bitrate_index >= 1);
        assert!(st.bitrate_index <= cfg.vbr_max_bitrate_index);
        for gr in 0..2 {
            for ch in 0..2 {
                assert!(side.gr[gr][ch].part2_3_length <= MAX_BITS as u32);
            }
        }
    }

    #[test]
    fn reduce_side_keeps_a_floor_under_the_side_channel() {
        let mut targ = [1000, 1000];
        reduce_side(&mut targ, 0.0, 2000, 4095);
        assert!(targ[0] > 1000);
        assert!(targ[1] >= 125);
        assert!(targ[0] + targ[1] <= 4095);

        // balanced energy moves nothing
        let mut targ = [1000, 1000];
        reduce_side(&mut targ, 0.5, 2000, 4095);
        assert_eq!(targ, [1000, 1000]);
    }

    #[test]
    fn ms_convert_roundtrips_energy() {
        let mut xr = [[0.0f32; GRANULE_SIZE]; MAX_CHANNELS];
        for i in 0..GRANULE_SIZE {
            xr[0][i] = (i as f32 * 0.1).sin();
            xr[1][i] = (i as f32 * 0.07).cos();
        }
        let e_before: f32 = xr.iter().flatten().map(|v| v * v).sum();
        ms_convert(&mut xr);
        let e_after: f32 = xr.iter().flatten().map(|v| v * v).sum();
        assert!((e_before - e_after).abs() / e_before < 1e-4);
    }
}

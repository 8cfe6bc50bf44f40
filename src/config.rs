//! Encoder configuration
//!
//! The public [`Config`] enumerates every user-facing knob; [`SessionConfig`]
//! is the validated, fully-resolved form the rest of the encoder consumes.
//! Resolution fills in the "auto" values (output rate, mode, bitrate from
//! compression ratio, msfix, quality mappings) the same way the classic
//! command-line encoders do.

use crate::error::{ConfigError, ConfigResult};
use crate::tables::{samplerate_full_index, BITRATE_TABLE};

/// Channel coding mode of the output stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    Stereo,
    /// Mid/side coding where the psychoacoustic model allows it
    #[default]
    JointStereo,
    DualChannel,
    Mono,
    /// Resolved to joint stereo (or mono for 1 input channel)
    NotSet,
}

impl Mode {
    /// Two-bit header field
    pub fn bits(self) -> u32 {
        match self {
            Mode::Stereo => 0,
            Mode::JointStereo => 1,
            Mode::DualChannel => 2,
            Mode::Mono => 3,
            Mode::NotSet => 1,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Mode::Stereo => "stereo",
            Mode::JointStereo => "joint stereo",
            Mode::DualChannel => "dual channel",
            Mode::Mono => "mono",
            Mode::NotSet => "not set",
        }
    }
}

/// Variable bitrate policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VbrMode {
    /// Constant bitrate
    #[default]
    Off,
    /// Average bitrate: CBR-style quantization against a floating target
    Abr,
    /// Per-granule binary search on the bit budget
    Rh,
    /// Same search, tuned thresholds
    Mtrh,
}

impl VbrMode {
    /// The modes that binary-search the per-granule bit budget
    pub fn is_search(self) -> bool {
        matches!(self, VbrMode::Rh | VbrMode::Mtrh)
    }
}

/// Short block switching policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShortBlocks {
    #[default]
    NotSet,
    /// Channels switch independently
    Allowed,
    /// Both channels switch together (required for mid/side frames)
    Coupled,
    /// Every granule uses short blocks
    Forced,
    /// Short blocks disabled
    Dispensed,
}

/// De-emphasis field of the frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Emphasis {
    #[default]
    None,
    Fifty15Ms,
    CcittJ17,
}

impl Emphasis {
    pub fn bits(self) -> u32 {
        match self {
            Emphasis::None => 0,
            Emphasis::Fifty15Ms => 1,
            Emphasis::CcittJ17 => 3,
        }
    }
}

/// MPEG version, derived from the output sample rate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Mpeg1,
    Mpeg2,
    Mpeg25,
}

impl Version {
    /// Two-bit header field
    pub fn bits(self) -> u32 {
        match self {
            Version::Mpeg1 => 3,
            Version::Mpeg2 => 2,
            Version::Mpeg25 => 0,
        }
    }

    /// Row of [`BITRATE_TABLE`]
    pub fn bitrate_row(self) -> usize {
        match self {
            Version::Mpeg1 => 0,
            _ => 1,
        }
    }

    pub fn is_lsf(self) -> bool {
        !matches!(self, Version::Mpeg1)
    }
}

/// User-facing encoder settings. `Default` gives 44.1 kHz stereo CBR-128
/// joint stereo, the same defaults the classic frontends apply.
#[derive(Debug, Clone)]
pub struct Config {
    pub in_samplerate: u32,
    /// 0 resolves to the input rate
    pub out_samplerate: u32,
    pub num_channels: u8,
    pub mode: Mode,
    pub vbr: VbrMode,
    /// 0 (best, slowest) .. 9 (worst, fastest)
    pub quality: u8,
    /// CBR/ABR bitrate in kbps; 0 derives it from `compression_ratio`
    pub bitrate: u32,
    /// Used when `bitrate == 0`; 11.025 compresses CD audio to 128 kbps
    pub compression_ratio: f32,
    /// 0 (largest files) .. 9 (smallest) for the VBR modes
    pub vbr_quality: u8,
    pub vbr_min_bitrate_kbps: u32,
    pub vbr_max_bitrate_kbps: u32,
    pub vbr_mean_bitrate_kbps: u32,
    /// Hz; 0 disables. Informational only, the polyphase bandlimit
    pub lowpass_freq: u32,
    pub lowpass_width: i32,
    pub highpass_freq: u32,
    pub highpass_width: i32,
    pub short_blocks: ShortBlocks,
    pub disable_reservoir: bool,
    /// Emit a CRC-16 after each header
    pub error_protection: bool,
    /// Gain applied to all input samples; 0 means 1.0
    pub scale: f32,
    pub scale_left: f32,
    pub scale_right: f32,
    /// Joint stereo mid/side threshold scaling; <0 picks the default
    pub msfix: f32,
    /// Absolute threshold of hearing shape: 0 classic, 4 adjustable curve
    pub ath_type: i32,
    /// Steepness parameter of the type-4 ATH
    pub ath_curve: f32,
    /// Adaptive ATH lowering: 0 off, 3 loudness driven
    pub athaa_type: i32,
    /// dB offset applied to the adaptive ATH target
    pub athaa_sensitivity: f32,
    /// Temporal masking of the previous granule
    pub use_temporal: bool,
    /// Fraction of each channel's threshold added to the other
    pub inter_ch_ratio: f32,
    pub free_format: bool,
    pub copyright: bool,
    pub original: bool,
    pub emphasis: Emphasis,
    /// Noise comparison criterion for the outer loop, 0..=8
    pub quant_comp: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            in_samplerate: 44100,
            out_samplerate: 0,
            num_channels: 2,
            mode: Mode::NotSet,
            vbr: VbrMode::Off,
            quality: 5,
            bitrate: 0,
            compression_ratio: 0.0,
            vbr_quality: 4,
            vbr_min_bitrate_kbps: 0,
            vbr_max_bitrate_kbps: 0,
            vbr_mean_bitrate_kbps: 128,
            lowpass_freq: 0,
            lowpass_width: -1,
            highpass_freq: 0,
            highpass_width: -1,
            short_blocks: ShortBlocks::NotSet,
            disable_reservoir: false,
            error_protection: false,
            scale: 0.0,
            scale_left: 0.0,
            scale_right: 0.0,
            msfix: -1.0,
            ath_type: 4,
            ath_curve: 4.0,
            athaa_type: -1,
            athaa_sensitivity: 0.0,
            use_temporal: true,
            inter_ch_ratio: 0.0,
            free_format: false,
            copyright: false,
            original: true,
            emphasis: Emphasis::None,
            quant_comp: 0,
        }
    }
}

/// Fully resolved session parameters
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub version: Version,
    pub samplerate_out: u32,
    /// 0..9 row into the band tables
    pub samplerate_index: usize,
    pub channels_in: usize,
    pub channels_out: usize,
    pub mode: Mode,
    /// Granules per frame: 2 for MPEG-1, 1 otherwise
    pub mode_gr: usize,
    /// Samples per frame per channel
    pub framesize: usize,
    /// Header + side info bytes
    pub sideinfo_len: usize,
    pub bitrate_index: usize,
    pub bitrate_kbps: u32,
    pub free_format: bool,
    pub vbr: VbrMode,
    pub vbr_quality: usize,
    pub vbr_min_bitrate_index: usize,
    pub vbr_max_bitrate_index: usize,
    pub vbr_mean_bitrate_kbps: u32,
    pub compression_ratio: f32,
    pub quality: u8,
    /// 0 none, 1 amplify worst bands only, 2 also scalefac_scale/subblock gain
    pub noise_shaping: u8,
    pub quant_comp: u8,
    /// Allow residual distortion in sfb21 to abort the outer loop early
    pub sfb21_extra: bool,
    /// Base masking adjustment (linear power)
    pub masking_lower: f32,
    pub short_blocks: ShortBlocks,
    pub disable_reservoir: bool,
    pub error_protection: bool,
    pub scale: f32,
    pub scale_left: f32,
    pub scale_right: f32,
    pub msfix: f32,
    pub ath_type: i32,
    pub ath_curve: f32,
    pub athaa_type: i32,
    pub athaa_sensitivity: f32,
    pub use_temporal: bool,
    pub inter_ch_ratio: f32,
    pub copyright: bool,
    pub original: bool,
    pub emphasis: Emphasis,
    /// Fractional padding slots per frame, and its running remainder seed
    pub frac_slots_per_frame: f64,
    pub whole_slots_per_frame: i32,
}

/// Default mid/side masking safety factor
const DEFAULT_MSFIX: f32 = 3.5;

impl Config {
    /// Validate and resolve into a [`SessionConfig`].
    pub fn resolve(&self) -> ConfigResult<SessionConfig> {
        if self.num_channels == 0 || self.num_channels > 2 {
            return Err(ConfigError::InvalidChannels(self.num_channels));
        }
        if self.free_format && self.vbr != VbrMode::Off {
            return Err(ConfigError::FreeFormatWithVbr);
        }

        let samplerate_out = if self.out_samplerate == 0 {
            self.in_samplerate
        } else {
            self.out_samplerate
        };
        let samplerate_index = samplerate_full_index(samplerate_out)
            .ok_or(ConfigError::UnsupportedSampleRate(samplerate_out))?;
        let version = match samplerate_index {
            0..=2 => Version::Mpeg1,
            3..=5 => Version::Mpeg2,
            _ => Version::Mpeg25,
        };

        // mono input can only produce mono output
        let mut mode = self.mode;
        if self.num_channels == 1 {
            mode = Mode::Mono;
        }
        if mode == Mode::NotSet {
            mode = Mode::JointStereo;
        }
        let channels_out = if mode == Mode::Mono { 1 } else { 2 };
        if channels_out == 2 && self.num_channels == 1 {
            return Err(ConfigError::InvalidStereoMode {
                mode: mode.name(),
                channels: self.num_channels,
            });
        }

        let mode_gr = if version == Version::Mpeg1 { 2 } else { 1 };
        let framesize = 576 * mode_gr;
        let row = version.bitrate_row();

        // CBR bitrate: explicit, or derived from the compression ratio
        let mut bitrate = self.bitrate;
        if bitrate == 0 && self.vbr == VbrMode::Off {
            let ratio = if self.compression_ratio > 0.0 {
                self.compression_ratio
            } else {
                11.025
            };
            let want = (samplerate_out as f32 * 16.0 * channels_out as f32) / (1e3 * ratio);
            bitrate = nearest_bitrate(want as u32, row);
        }

        let bitrate_index = if self.vbr != VbrMode::Off {
            // CBR header fields are rewritten per frame in VBR streams;
            // start from the mean as a placeholder
            nearest_bitrate_index(self.vbr_mean_bitrate_kbps.max(8), row)
        } else if self.free_format {
            0
        } else {
            BITRATE_TABLE[row]
                .iter()
                .position(|&b| b == bitrate)
                .ok_or(ConfigError::UnsupportedBitrate {
                    bitrate,
                    sample_rate: samplerate_out,
                })?
        };

        let bitrate_kbps = if self.free_format {
            if bitrate == 0 {
                return Err(ConfigError::UnsupportedBitrate {
                    bitrate,
                    sample_rate: samplerate_out,
                });
            }
            bitrate
        } else {
            BITRATE_TABLE[row][bitrate_index.max(1)]
        };

        // VBR bitrate bounds
        let mut vbr_min_bitrate_index = 1;
        let mut vbr_max_bitrate_index = 14;
        if self.vbr_min_bitrate_kbps != 0 {
            vbr_min_bitrate_index = BITRATE_TABLE[row]
                .iter()
                .position(|&b| b == self.vbr_min_bitrate_kbps)
                .ok_or(ConfigError::UnsupportedBitrate {
                    bitrate: self.vbr_min_bitrate_kbps,
                    sample_rate: samplerate_out,
                })?;
        }
        if self.vbr_max_bitrate_kbps != 0 {
            vbr_max_bitrate_index = BITRATE_TABLE[row]
                .iter()
                .position(|&b| b == self.vbr_max_bitrate_kbps)
                .ok_or(ConfigError::UnsupportedBitrate {
                    bitrate: self.vbr_max_bitrate_kbps,
                    sample_rate: samplerate_out,
                })?;
        }
        if vbr_min_bitrate_index > vbr_max_bitrate_index || vbr_min_bitrate_index == 0 {
            return Err(ConfigError::InvalidVbrRange {
                min: self.vbr_min_bitrate_kbps,
                max: self.vbr_max_bitrate_kbps,
            });
        }
        let vbr_mean_bitrate_kbps = self
            .vbr_mean_bitrate_kbps
            .clamp(
                BITRATE_TABLE[row][vbr_min_bitrate_index],
                BITRATE_TABLE[row][vbr_max_bitrate_index],
            );

        let compression_ratio = match self.vbr {
            VbrMode::Rh | VbrMode::Mtrh => {
                // guesses tied to the usual quality/bitrate pairings
                const CMP: [f32; 10] = [5.7, 6.5, 7.3, 8.2, 10.0, 11.9, 13.0, 14.0, 15.0, 16.5];
                CMP[self.vbr_quality.min(9) as usize]
            }
            VbrMode::Abr => {
                samplerate_out as f32 * 16.0 * channels_out as f32
                    / (1e3 * vbr_mean_bitrate_kbps as f32)
            }
            VbrMode::Off => {
                samplerate_out as f32 * 16.0 * channels_out as f32 / (1e3 * bitrate_kbps as f32)
            }
        };

        // Allowed short blocks are coerced to coupled: uncoupled switching
        // is valid bitstream but widely mishandled by hardware decoders.
        let short_blocks = match self.short_blocks {
            ShortBlocks::NotSet | ShortBlocks::Allowed => ShortBlocks::Coupled,
            other => other,
        };

        let quality = self.quality.min(9);
        let noise_shaping = if quality >= 9 { 1 } else { 2 };
        let sfb21_extra = match self.vbr {
            VbrMode::Rh => samplerate_out > 44000,
            VbrMode::Mtrh => samplerate_out > 36000,
            _ => false,
        };

        // VBR quality lowers or raises the masking floor
        const DB_Q: [f32; 10] = [-2.0, -1.0, -0.66, -0.33, 0.0, 0.33, 0.66, 1.0, 1.33, 1.66];
        let masking_lower = match self.vbr {
            VbrMode::Rh | VbrMode::Mtrh => {
                10f32.powf(DB_Q[self.vbr_quality.min(9) as usize] * 0.1)
            }
            _ => 1.0,
        };

        let msfix = if self.msfix < 0.0 { DEFAULT_MSFIX } else { self.msfix };

        let sideinfo_len = {
            let base = if version == Version::Mpeg1 {
                if channels_out == 1 {
                    4 + 17
                } else {
                    4 + 32
                }
            } else if channels_out == 1 {
                4 + 9
            } else {
                4 + 17
            };
            if self.error_protection {
                base + 2
            } else {
                base
            }
        };

        // padding bookkeeping, "MPEG-Layer3 bitstream syntax and decoding"
        let slots_per_frame =
            bitrate_kbps as f64 * 125.0 * framesize as f64 / samplerate_out as f64;
        let whole_slots_per_frame = slots_per_frame as i32;
        let frac_slots_per_frame = if self.vbr == VbrMode::Off && !self.free_format {
            slots_per_frame - whole_slots_per_frame as f64
        } else {
            0.0
        };

        Ok(SessionConfig {
            version,
            samplerate_out,
            samplerate_index,
            channels_in: self.num_channels as usize,
            channels_out,
            mode,
            mode_gr,
            framesize,
            sideinfo_len,
            bitrate_index,
            bitrate_kbps,
            free_format: self.free_format,
            vbr: self.vbr,
            vbr_quality: self.vbr_quality.min(9) as usize,
            vbr_min_bitrate_index,
            vbr_max_bitrate_index,
            vbr_mean_bitrate_kbps,
            compression_ratio,
            quality,
            noise_shaping,
            quant_comp: self.quant_comp.min(8),
            sfb21_extra,
            masking_lower,
            short_blocks,
            disable_reservoir: self.disable_reservoir,
            error_protection: self.error_protection,
            scale: if self.scale == 0.0 { 1.0 } else { self.scale },
            scale_left: if self.scale_left == 0.0 { 1.0 } else { self.scale_left },
            scale_right: if self.scale_right == 0.0 { 1.0 } else { self.scale_right },
            msfix,
            ath_type: self.ath_type,
            ath_curve: self.ath_curve,
            athaa_type: if self.athaa_type < 0 {
                match self.vbr {
                    VbrMode::Rh | VbrMode::Mtrh => 3,
                    _ => 0,
                }
            } else {
                self.athaa_type
            },
            athaa_sensitivity: self.athaa_sensitivity,
            use_temporal: self.use_temporal,
            inter_ch_ratio: self.inter_ch_ratio.max(0.0),
            copyright: self.copyright,
            original: self.original,
            emphasis: self.emphasis,
            frac_slots_per_frame,
            whole_slots_per_frame,
        })
    }
}

impl SessionConfig {
    /// Bits per frame at the given bitrate index, excluding nothing:
    /// header, side info and main data all come out of this budget.
    pub fn bits_per_frame(&self, bitrate_index: usize) -> i32 {
        let kbps = if self.free_format {
            self.bitrate_kbps
        } else {
            BITRATE_TABLE[self.version.bitrate_row()][bitrate_index]
        };
        let slots = (kbps as f64 * 125.0 * self.framesize as f64 / self.samplerate_out as f64)
            as i32;
        8 * slots
    }

    /// Main data bits per granule (both channels together) at a bitrate
    /// index, with the frame's padding slot included
    pub fn mean_bits(&self, bitrate_index: usize, padding: bool) -> i32 {
        (self.bits_per_frame(bitrate_index) + 8 * padding as i32
            - 8 * self.sideinfo_len as i32)
            / self.mode_gr as i32
    }

    /// Frame is coded mid/side
    pub fn is_ms(&self) -> bool {
        self.mode == Mode::JointStereo
    }
}

fn nearest_bitrate_index(kbps: u32, row: usize) -> usize {
    let mut best = 1;
    let mut best_err = u32::MAX;
    for (i, &b) in BITRATE_TABLE[row].iter().enumerate().skip(1) {
        let err = b.abs_diff(kbps);
        if err < best_err {
            best_err = err;
            best = i;
        }
    }
    best
}

fn nearest_bitrate(kbps: u32, row: usize) -> u32 {
    BITRATE_TABLE[row][nearest_bitrate_index(kbps, row)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn default_config_resolves_to_cbr_128_joint() {
        let sc = Config::default().resolve().unwrap();
        assert_eq!(sc.samplerate_out, 44100);
        assert_eq!(sc.version, Version::Mpeg1);
        assert_eq!(sc.mode, Mode::JointStereo);
        assert_eq!(sc.bitrate_kbps, 128);
        assert_eq!(sc.bitrate_index, 9);
        assert_eq!(sc.mode_gr, 2);
        assert_eq!(sc.framesize, 1152);
        assert_eq!(sc.sideinfo_len, 36);
    }

    #[test]
    fn mono_input_forces_mono_mode() {
        let cfg = Config {
            num_channels: 1,
            mode: Mode::Stereo,
            bitrate: 128,
            ..Default::default()
        };
        let sc = cfg.resolve().unwrap();
        assert_eq!(sc.mode, Mode::Mono);
        assert_eq!(sc.channels_out, 1);
        assert_eq!(sc.sideinfo_len, 21);
    }

    #[test]
    fn invalid_samplerate_is_rejected() {
        let cfg = Config {
            in_samplerate: 44000,
            ..Default::default()
        };
        assert!(matches!(
            cfg.resolve(),
            Err(ConfigError::UnsupportedSampleRate(44000))
        ));
    }

    #[test]
    fn lsf_frame_geometry() {
        let cfg = Config {
            in_samplerate: 22050,
            bitrate: 64,
            ..Default::default()
        };
        let sc = cfg.resolve().unwrap();
        assert_eq!(sc.version, Version::Mpeg2);
        assert_eq!(sc.mode_gr, 1);
        assert_eq!(sc.framesize, 576);
        assert_eq!(sc.sideinfo_len, 21);
    }

    #[test]
    fn allowed_short_blocks_become_coupled() {
        let cfg = Config {
            short_blocks: ShortBlocks::Allowed,
            bitrate: 128,
            ..Default::default()
        };
        assert_eq!(cfg.resolve().unwrap().short_blocks, ShortBlocks::Coupled);
    }

    #[test]
    fn free_format_with_vbr_is_rejected() {
        let cfg = Config {
            free_format: true,
            vbr: VbrMode::Rh,
            ..Default::default()
        };
        assert!(matches!(cfg.resolve(), Err(ConfigError::FreeFormatWithVbr)));
    }

    #[test]
    fn compression_ratio_picks_128k_for_cd_audio() {
        let cfg = Config {
            bitrate: 0,
            compression_ratio: 11.025,
            ..Default::default()
        };
        assert_eq!(cfg.resolve().unwrap().bitrate_kbps, 128);
    }

    #[test]
    fn frame_bit_budget_at_cbr_128() {
        let sc = Config {
            bitrate: 128,
            ..Default::default()
        }
        .resolve()
        .unwrap();
        // 128000 * 1152 / 44100 / 8 = 417.96 slots
        assert_eq!(sc.bits_per_frame(9), 417 * 8);
        assert!(sc.frac_slots_per_frame > 0.9);
        assert_eq!(sc.mean_bits(9, true), sc.mean_bits(9, false) + 4);
    }

    proptest! {
        #[test]
        fn any_valid_rate_bitrate_pair_resolves(
            sr_idx in 0usize..9,
            br_idx in 1usize..15,
            channels in 1u8..=2,
        ) {
            let sr = crate::tables::SAMPLERATES[sr_idx];
            let row = if sr_idx < 3 { 0 } else { 1 };
            let cfg = Config {
                in_samplerate: sr,
                bitrate: BITRATE_TABLE[row][br_idx],
                num_channels: channels,
                mode: if channels == 1 { Mode::Mono } else { Mode::NotSet },
                ..Default::default()
            };
            let sc = cfg.resolve().unwrap();
            prop_assert_eq!(sc.bitrate_index, br_idx);
            prop_assert!(sc.bits_per_frame(br_idx) > 8 * sc.sideinfo_len as i32);
            prop_assert!(sc.mean_bits(br_idx, false) > 0);
        }

        #[test]
        fn bitrate_not_in_table_is_rejected(br in 1u32..330) {
            prop_assume!(!BITRATE_TABLE[0].contains(&br));
            let cfg = Config { bitrate: br, ..Default::default() };
            prop_assert!(cfg.resolve().is_err());
        }
    }
}

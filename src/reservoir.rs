//! Layer III bit reservoir, C.1.5.4.2.2 of the IS
//!
//! Frames may leave bits unused; later frames reach back for them through
//! the main_data_begin pointer. The reservoir size is bounded by that
//! field's range (9 bits of bytes in MPEG-1, 8 in MPEG-2) and by the
//! largest legal frame, so a decoder's main data buffer can never be
//! asked to hold more than it must.

use log::debug;

use crate::config::{SessionConfig, Version};
use crate::types::{GranuleInfo, SideInfo, MAX_BITS};

/// Largest frame the decoder must buffer, bytes
const MAX_FRAME_BYTES: i32 = 1440;

#[derive(Debug, Clone, Default)]
pub struct Reservoir {
    /// Bits currently banked
    pub resv_size: i32,
    /// Bound for the current bitrate
    pub resv_max: i32,
}

impl Reservoir {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a frame at the given bitrate index: fixes `resv_max` and
    /// returns the bits this frame's granules may spend in total.
    pub fn frame_begin(&mut self, cfg: &SessionConfig, bitrate_index: usize, padding: bool) -> i32 {
        let bits_per_frame = cfg.bits_per_frame(bitrate_index) + 8 * padding as i32;
        let mean_bits = cfg.mean_bits(bitrate_index, padding);

        // main_data_begin is 9 bits of bytes in MPEG-1, 8 in MPEG-2
        let resv_limit = match cfg.version {
            Version::Mpeg1 => 8 * 511,
            _ => 8 * 255,
        };

        self.resv_max = (8 * MAX_FRAME_BYTES - bits_per_frame).min(resv_limit);
        if self.resv_max < 0 || cfg.disable_reservoir {
            self.resv_max = 0;
        }
        self.resv_max &= !7;

        let full_frame_bits = mean_bits * cfg.mode_gr as i32 + self.resv_size.min(self.resv_max);
        let cap = MAX_BITS * (cfg.mode_gr * cfg.channels_out) as i32;
        full_frame_bits.min(cap)
    }

    /// Per-granule allowance: the mean share adjusted for the reservoir
    /// state, plus the extra bits a granule may borrow. While the
    /// reservoir is filling, a tenth of the mean is withheld to build it;
    /// when it is nearly full the surplus is forced out.
    pub fn max_bits(&self, cfg: &SessionConfig, mean_bits: i32) -> (i32, i32) {
        let mut targ_bits = mean_bits;
        let mut add_bits = 0;

        if self.resv_size * 10 > self.resv_max * 9 {
            add_bits = self.resv_size - self.resv_max * 9 / 10;
            targ_bits += add_bits;
        } else if !cfg.disable_reservoir {
            targ_bits -= mean_bits / 10;
        }

        // ISO allows a granule to borrow up to 6/10 of the reservoir
        let mut extra_bits = self.resv_size.min(self.resv_max * 6 / 10) - add_bits;
        if extra_bits < 0 {
            extra_bits = 0;
        }
        (targ_bits.min(MAX_BITS), extra_bits)
    }

    /// Bank what the granule left unused
    pub fn adjust(&mut self, cfg: &SessionConfig, gi: &GranuleInfo, mean_bits: i32) {
        self.resv_size += mean_bits / cfg.channels_out as i32 - gi.part2_3_length as i32;
    }

    /// Close the frame: trim the reservoir to its bound and to byte
    /// alignment, turning the trimmings into stuffing. Plan a puts all
    /// stuffing into the first granule; plan b spreads it; what still
    /// remains drains into ancillary bits.
    pub fn frame_end(&mut self, cfg: &SessionConfig, side_info: &mut SideInfo, mean_bits: i32) {
        side_info.resv_drain = 0;

        if cfg.channels_out == 2 && mean_bits & 1 != 0 {
            self.resv_size += 1;
        }

        let mut over_bits = (self.resv_size - self.resv_max).max(0);
        self.resv_size -= over_bits;
        let mut stuffing_bits = over_bits;

        over_bits = self.resv_size % 8;
        if over_bits != 0 {
            stuffing_bits += over_bits;
            self.resv_size -= over_bits;
        }
        if stuffing_bits == 0 {
            return;
        }
        debug!("reservoir stuffing: {stuffing_bits} bits");

        let gi = &mut side_info.gr[0][0];
        if gi.part2_3_length + (stuffing_bits as u32) < MAX_BITS as u32 {
            gi.part2_3_length += stuffing_bits as u32;
            return;
        }

        for gr in 0..cfg.mode_gr {
            for ch in 0..cfg.channels_out {
                if stuffing_bits == 0 {
                    break;
                }
                let gi = &mut side_info.gr[gr][ch];
                let room = MAX_BITS - gi.part2_3_length as i32;
                let put = room.min(stuffing_bits).max(0);
                gi.part2_3_length += put as u32;
                stuffing_bits -= put;
            }
        }
        // the bitstream formatter writes these as ancillary zeros
        side_info.resv_drain = stuffing_bits;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn session() -> SessionConfig {
        Config {
            bitrate: 128,
            ..Default::default()
        }
        .resolve()
        .unwrap()
    }

    #[test]
    fn frame_pool_includes_banked_bits() {
        let cfg = session();
        let mut resv = Reservoir::new();
        let empty = resv.frame_begin(&cfg, cfg.bitrate_index, false);
        resv.resv_size = 800;
        let banked = resv.frame_begin(&cfg, cfg.bitrate_index, false);
        assert_eq!(banked, empty + 800);
        assert!(resv.resv_max > 0);
        assert_eq!(resv.resv_max % 8, 0);
        assert!(resv.resv_max <= 8 * 511);
    }

    #[test]
    fn disabled_reservoir_never_banks() {
        let cfg = Config {
            bitrate: 128,
            disable_reservoir: true,
            ..Default::default()
        }
        .resolve()
        .unwrap();
        let mut resv = Reservoir::new();
        resv.frame_begin(&cfg, cfg.bitrate_index, false);
        assert_eq!(resv.resv_max, 0);
        let (targ, extra) = resv.max_bits(&cfg, 1000);
        assert_eq!(targ, 1000);
        assert_eq!(extra, 0);
    }

    #[test]
    fn granule_allowance_builds_then_spills() {
        let cfg = session();
        let mut resv = Reservoir::new();
        resv.frame_begin(&cfg, cfg.bitrate_index, false);

        // empty reservoir: withhold a tenth to build it
        let (targ, extra) = resv.max_bits(&cfg, 1000);
        assert_eq!(targ, 900);
        assert_eq!(extra, 0);

        // nearly full: the surplus must be spent
        resv.resv_size = resv.resv_max;
        let (targ, extra) = resv.max_bits(&cfg, 1000);
        assert!(targ > 1000);
        assert!(extra >= 0);
    }

    #[test]
    fn frame_end_byte_aligns_and_stuffs() {
        let cfg = session();
        let mut resv = Reservoir::new();
        resv.frame_begin(&cfg, cfg.bitrate_index, false);
        resv.resv_size = resv.resv_max + 13;

        let mut side = SideInfo::default();
        resv.frame_end(&cfg, &mut side, 1524);
        assert_eq!(resv.resv_size % 8, 0);
        assert!(resv.resv_size <= resv.resv_max);
        // the trimmed bits became stuffing in granule 0
        assert_eq!(side.gr[0][0].part2_3_length, 13);
        assert_eq!(side.resv_drain, 0);
    }

    #[test]
    fn overfull_stuffing_spreads_and_drains() {
        let cfg = session();
        let mut resv = Reservoir::new();
        resv.frame_begin(&cfg, cfg.bitrate_index, false);
        resv.resv_size = resv.resv_max + 4 * MAX_BITS + 64;

        let mut side = SideInfo::default();
        for gr in 0..2 {
            for ch in 0..2 {
                side.gr[gr][ch].part2_3_length = 4000;
            }
        }
        resv.frame_end(&cfg, &mut side, 1524);
        for gr in 0..2 {
            for ch in 0..2 {
                assert!(side.gr[gr][ch].part2_3_length <= MAX_BITS as u32);
            }
        }
        assert!(side.resv_drain > 0);
    }
}

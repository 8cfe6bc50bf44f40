//! Core types and constants shared across the encoder
//!
//! The layout mirrors the Layer III data model: a granule of 576 spectral
//! lines per channel, side information per (granule, channel), scalefactors
//! split into long bands and 3-window short bands, and the `{en, thm}`
//! hand-off from the psychoacoustic model to the quantizer.

/// Spectral lines per granule and channel
pub const GRANULE_SIZE: usize = 576;

/// Long FFT size used by the psychoacoustic model
pub const BLKSIZE: usize = 1024;
pub const HBLKSIZE: usize = BLKSIZE / 2 + 1;

/// Short FFT size (three of these per granule)
pub const BLKSIZE_S: usize = 256;
pub const HBLKSIZE_S: usize = BLKSIZE_S / 2 + 1;

/// Scalefactor bands: 21 usable long bands plus the sfb21 overflow band,
/// 12 usable short bands plus one
pub const SBMAX_L: usize = 22;
pub const SBMAX_S: usize = 13;
pub const SBPSY_L: usize = 21;
pub const SBPSY_S: usize = 12;

/// Upper bound on the number of ~0.34 Bark partition bands
pub const CBANDS: usize = 64;

/// Polyphase filterbank bands and window length
pub const SBLIMIT: usize = 32;
pub const HAN_SIZE: usize = 512;

pub const MAX_CHANNELS: usize = 2;
pub const MAX_GRANULES: usize = 2;

/// Samples of encoder delay before the first granule is aligned
pub const ENCDELAY: usize = 576;
/// Zero padding appended at flush so the final granule survives overlap-add
pub const POSTDELAY: usize = 288;

/// part2_3_length is a 12 bit field
pub const MAX_BITS: i32 = 4095;
/// Sentinel returned by the bit counter when the spectrum cannot be
/// quantized into table range at the current gain
pub const LARGE_BITS: i32 = 100_000;
/// Largest quantized magnitude: 15 + the widest linbits escape (8191)
pub const IXMAX_VAL: i32 = 8206;

pub const SQRT2: f32 = std::f32::consts::SQRT_2;

/// MDCT window / block type of one granule.
///
/// The overlap-add invariant makes Start and Stop mandatory transitions:
/// a Short granule is always preceded by Start and followed by Stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockType {
    #[default]
    Norm,
    Start,
    Short,
    Stop,
}

impl BlockType {
    /// Two-bit field value for the side information
    pub fn bits(self) -> u32 {
        match self {
            BlockType::Norm => 0,
            BlockType::Start => 1,
            BlockType::Short => 2,
            BlockType::Stop => 3,
        }
    }
}

/// Side information for one (granule, channel)
#[derive(Debug, Clone)]
pub struct GranuleInfo {
    pub part2_3_length: u32,
    pub big_values: u32,
    pub count1: u32,
    pub global_gain: i32,
    pub scalefac_compress: u32,
    pub block_type: BlockType,
    pub mixed_block_flag: u32,
    pub table_select: [u32; 3],
    pub subblock_gain: [i32; 3],
    pub region0_count: u32,
    pub region1_count: u32,
    pub preflag: u32,
    pub scalefac_scale: u32,
    pub count1table_select: u32,
    /// Bits spent on scalefactors (part2)
    pub part2_length: u32,
    /// Number of long scalefactor bands in use (0 for pure short blocks)
    pub sfb_lmax: usize,
    /// First short scalefactor band in use
    pub sfb_smin: usize,
    /// Spectral line indices bounding the big_values regions
    pub address1: u32,
    pub address2: u32,
    pub address3: u32,
    /// MPEG-2 scalefactor partition widths
    pub slen: [u32; 4],
    pub sfb_partition_table: [u32; 4],
}

impl Default for GranuleInfo {
    fn default() -> Self {
        Self {
            part2_3_length: 0,
            big_values: 0,
            count1: 0,
            global_gain: 210,
            scalefac_compress: 0,
            block_type: BlockType::Norm,
            mixed_block_flag: 0,
            table_select: [0; 3],
            subblock_gain: [0; 3],
            region0_count: 0,
            region1_count: 0,
            preflag: 0,
            scalefac_scale: 0,
            count1table_select: 0,
            part2_length: 0,
            sfb_lmax: SBPSY_L,
            sfb_smin: SBPSY_S,
            address1: 0,
            address2: 0,
            address3: 0,
            slen: [0; 4],
            sfb_partition_table: [0; 4],
        }
    }
}

impl GranuleInfo {
    /// Reset everything the quantization loop searches over, keeping the
    /// block type decided by the psychoacoustic model.
    pub fn reset_for_granule(&mut self) {
        let block_type = self.block_type;
        let mixed = self.mixed_block_flag;
        *self = Self::default();
        self.block_type = block_type;
        self.mixed_block_flag = mixed;
        if block_type == BlockType::Short {
            self.sfb_lmax = 0;
            self.sfb_smin = 0;
        }
    }
}

/// Per-frame side information
#[derive(Debug, Clone, Default)]
pub struct SideInfo {
    pub main_data_begin: u32,
    pub private_bits: u32,
    /// Ancillary bits the reservoir could not stuff into any granule
    pub resv_drain: i32,
    pub scfsi: [[u32; 4]; MAX_CHANNELS],
    pub gr: [[GranuleInfo; MAX_CHANNELS]; MAX_GRANULES],
}

/// Scalefactors for one (granule, channel)
#[derive(Debug, Clone, Copy, Default)]
pub struct Scalefac {
    pub l: [i32; SBMAX_L],
    pub s: [[i32; 3]; SBMAX_S],
}

/// Per-scalefactor-band energies or thresholds
#[derive(Debug, Clone, Copy)]
pub struct SfbBands {
    pub l: [f32; SBMAX_L],
    pub s: [[f32; 3]; SBMAX_S],
}

impl Default for SfbBands {
    fn default() -> Self {
        Self {
            l: [0.0; SBMAX_L],
            s: [[0.0; 3]; SBMAX_S],
        }
    }
}

/// The psychoacoustic hand-off: signal energy and masking threshold per
/// scalefactor band, delayed by one granule relative to the input.
#[derive(Debug, Clone, Copy, Default)]
pub struct PsyRatio {
    pub en: SfbBands,
    pub thm: SfbBands,
}

/// Allowed quantization noise per scalefactor band
pub type Xmin = SfbBands;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constants_are_consistent() {
        assert_eq!(GRANULE_SIZE, 576);
        assert_eq!(HBLKSIZE, 513);
        assert_eq!(HBLKSIZE_S, 129);
        assert_eq!(SBLIMIT * 18, GRANULE_SIZE);
        // largest escape value a pair table can carry
        assert_eq!(IXMAX_VAL, 15 + 8191);
    }

    #[test]
    fn block_type_field_values() {
        assert_eq!(BlockType::Norm.bits(), 0);
        assert_eq!(BlockType::Start.bits(), 1);
        assert_eq!(BlockType::Short.bits(), 2);
        assert_eq!(BlockType::Stop.bits(), 3);
    }

    #[test]
    fn granule_reset_keeps_block_type() {
        let mut gi = GranuleInfo {
            block_type: BlockType::Short,
            global_gain: 150,
            scalefac_scale: 1,
            ..Default::default()
        };
        gi.reset_for_granule();
        assert_eq!(gi.block_type, BlockType::Short);
        assert_eq!(gi.global_gain, 210);
        assert_eq!(gi.scalefac_scale, 0);
        assert_eq!(gi.sfb_lmax, 0);
    }
}

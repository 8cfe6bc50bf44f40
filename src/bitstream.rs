//! Bitstream formatting
//!
//! Frames are assembled from three streams: the 32-bit header, the side
//! information, and the main data (scalefactors + Huffman codes), which
//! flows through a byte FIFO into the payload slots of whichever frames
//! still have room. A frame's `main_data_begin` is the payload space
//! earlier frames have not yet filled when its header is cut — exactly
//! where its own main data will land. The reservoir bounds that hole to
//! the field's range, and its byte-alignment rule guarantees every
//! frame's main data is a whole number of bytes.

use std::collections::VecDeque;

use log::debug;

use crate::config::{SessionConfig, Version};
use crate::huffman::{HuffCodeTab, HUFFMAN_TABLE};
use crate::tables::{SLEN1_TAB, SLEN2_TAB};
use crate::types::{
    BlockType, GranuleInfo, Scalefac, SideInfo, GRANULE_SIZE, MAX_CHANNELS, MAX_GRANULES,
    SBPSY_L, SBPSY_S,
};

/// Bit-level writer with a 32-bit cache
#[derive(Debug, Default)]
pub struct BitWriter {
    data: Vec<u8>,
    cache: u32,
    /// Free bits remaining in the cache
    cache_bits: u32,
}

impl BitWriter {
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            cache: 0,
            cache_bits: 32,
        }
    }

    /// Write the low `n` bits of `val`
    pub fn put_bits(&mut self, val: u32, n: u32) {
        debug_assert!(n <= 32);
        debug_assert!(n == 32 || val >> n == 0, "upper bits not zero: {val:#x}/{n}");
        if n == 0 {
            return;
        }

        if self.cache_bits > n {
            self.cache_bits -= n;
            self.cache |= val << self.cache_bits;
        } else {
            let rest = n - self.cache_bits;
            if rest < 32 {
                self.cache |= val >> rest;
            }
            self.data.extend_from_slice(&self.cache.to_be_bytes());
            self.cache_bits = 32 - rest;
            self.cache = if rest == 0 {
                0
            } else {
                val << self.cache_bits
            };
        }
    }

    pub fn bit_count(&self) -> usize {
        self.data.len() * 8 + (32 - self.cache_bits) as usize
    }

    /// Hand out the accumulated whole bytes; the writer must be aligned.
    pub fn take_bytes(&mut self) -> Vec<u8> {
        debug_assert_eq!(self.bit_count() % 8, 0, "writer not byte aligned");
        let partial = 32 - self.cache_bits;
        let cached = self.cache.to_be_bytes();
        self.data.extend_from_slice(&cached[..(partial / 8) as usize]);
        self.cache = 0;
        self.cache_bits = 32;
        std::mem::take(&mut self.data)
    }
}

/// A frame whose header is cut but whose payload slots are still filling
/// from the main data FIFO
#[derive(Debug)]
struct PendingFrame {
    bytes: Vec<u8>,
    /// Payload bytes still owed
    need: usize,
}

#[derive(Debug, Default)]
pub struct Bitstream {
    /// Completed output, ready for the caller
    out: Vec<u8>,
    /// Main data written but not yet placed into any frame's payload
    fifo: VecDeque<u8>,
    pending: VecDeque<PendingFrame>,
    main: BitWriter,
}

impl Bitstream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assemble one frame: header + side info now, main data through the
    /// FIFO into whichever frames have room.
    pub fn format_frame(
        &mut self,
        cfg: &SessionConfig,
        bitrate_index: usize,
        padding: bool,
        side_info: &SideInfo,
        scalefac: &[[Scalefac; MAX_CHANNELS]; MAX_GRANULES],
        l3_enc: &[[[i32; GRANULE_SIZE]; MAX_CHANNELS]; MAX_GRANULES],
    ) {
        // this frame's main data starts wherever earlier frames left
        // payload unfilled; that hole is exactly the back-pointer
        let main_data_begin = self.pending.iter().map(|f| f.need).sum::<usize>() as u32;
        debug_assert!(
            self.fifo.is_empty(),
            "main data overran the payload capacity; the reservoir went negative"
        );
        debug_assert!(main_data_begin <= if cfg.version == Version::Mpeg1 { 511 } else { 255 });

        let mut head = BitWriter::new();
        self.write_header(cfg, bitrate_index, padding, &mut head);
        let mut side = BitWriter::new();
        self.write_side_info(cfg, side_info, main_data_begin, &mut side);

        let mut frame_bytes = head.take_bytes();
        let side_bytes = side.take_bytes();
        if cfg.error_protection {
            let crc = crc16(&frame_bytes[2..4], &side_bytes);
            frame_bytes.extend_from_slice(&crc.to_be_bytes());
        }
        frame_bytes.extend_from_slice(&side_bytes);
        debug_assert_eq!(frame_bytes.len(), cfg.sideinfo_len);

        // main data for every granule, plus what the reservoir drains
        for gr in 0..cfg.mode_gr {
            for ch in 0..cfg.channels_out {
                self.write_granule(
                    cfg,
                    &side_info.gr[gr][ch],
                    &side_info.scfsi[ch],
                    gr,
                    &scalefac[gr][ch],
                    &l3_enc[gr][ch],
                );
            }
        }
        for _ in 0..side_info.resv_drain {
            self.main.put_bits(0, 1);
        }
        for byte in self.main.take_bytes() {
            self.fifo.push_back(byte);
        }

        let total_bytes = (cfg.bits_per_frame(bitrate_index) / 8) as usize + padding as usize;
        let need = total_bytes - cfg.sideinfo_len;
        self.pending.push_back(PendingFrame {
            bytes: frame_bytes,
            need,
        });
        self.fill_pending();
    }

    /// Move FIFO bytes into payload slots, emitting completed frames
    fn fill_pending(&mut self) {
        while let Some(front) = self.pending.front_mut() {
            while front.need > 0 {
                match self.fifo.pop_front() {
                    Some(b) => {
                        front.bytes.push(b);
                        front.need -= 1;
                    }
                    None => return,
                }
            }
            let done = self.pending.pop_front().unwrap();
            self.out.extend_from_slice(&done.bytes);
        }
    }

    /// Zero-pad the FIFO so every pending frame completes
    pub fn flush(&mut self) {
        let owed: usize = self.pending.iter().map(|f| f.need).sum();
        let backlog = self.fifo.len();
        if owed > backlog {
            debug!("flush: padding {} ancillary bytes", owed - backlog);
            for _ in 0..owed - backlog {
                self.fifo.push_back(0);
            }
        }
        self.fill_pending();
        debug_assert!(self.pending.is_empty());
        self.fifo.clear();
    }

    /// Take whatever output is complete
    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.out)
    }

    fn write_header(
        &mut self,
        cfg: &SessionConfig,
        bitrate_index: usize,
        padding: bool,
        bs: &mut BitWriter,
    ) {
        bs.put_bits(0x7ff, 11);
        bs.put_bits(cfg.version.bits(), 2);
        bs.put_bits(1, 2); // layer III
        bs.put_bits(!cfg.error_protection as u32, 1);
        bs.put_bits(bitrate_index as u32, 4);
        bs.put_bits((cfg.samplerate_index % 3) as u32, 2);
        bs.put_bits(padding as u32, 1);
        bs.put_bits(0, 1); // private
        bs.put_bits(cfg.mode.bits(), 2);
        // mode extension: mid/side on, intensity off
        bs.put_bits(if cfg.is_ms() { 2 } else { 0 }, 2);
        bs.put_bits(cfg.copyright as u32, 1);
        bs.put_bits(cfg.original as u32, 1);
        bs.put_bits(cfg.emphasis.bits(), 2);
    }

    fn write_side_info(
        &mut self,
        cfg: &SessionConfig,
        side_info: &SideInfo,
        main_data_begin: u32,
        bs: &mut BitWriter,
    ) {
        if cfg.version == Version::Mpeg1 {
            bs.put_bits(main_data_begin, 9);
            bs.put_bits(
                side_info.private_bits,
                if cfg.channels_out == 2 { 3 } else { 5 },
            );
            for ch in 0..cfg.channels_out {
                for band in 0..4 {
                    bs.put_bits(side_info.scfsi[ch][band], 1);
                }
            }
            for gr in 0..MAX_GRANULES {
                for ch in 0..cfg.channels_out {
                    self.write_granule_side(cfg, &side_info.gr[gr][ch], bs);
                }
            }
        } else {
            bs.put_bits(main_data_begin, 8);
            bs.put_bits(
                side_info.private_bits,
                if cfg.channels_out == 2 { 2 } else { 1 },
            );
            for ch in 0..cfg.channels_out {
                self.write_granule_side(cfg, &side_info.gr[0][ch], bs);
            }
        }
    }

    fn write_granule_side(&mut self, cfg: &SessionConfig, gi: &GranuleInfo, bs: &mut BitWriter) {
        bs.put_bits(gi.part2_3_length, 12);
        bs.put_bits(gi.big_values, 9);
        bs.put_bits(gi.global_gain as u32, 8);
        if cfg.version == Version::Mpeg1 {
            bs.put_bits(gi.scalefac_compress, 4);
        } else {
            bs.put_bits(gi.scalefac_compress, 9);
        }

        let window_switching = gi.block_type != BlockType::Norm;
        bs.put_bits(window_switching as u32, 1);
        if window_switching {
            bs.put_bits(gi.block_type.bits(), 2);
            bs.put_bits(gi.mixed_block_flag, 1);
            for region in 0..2 {
                bs.put_bits(gi.table_select[region], 5);
            }
            for window in 0..3 {
                bs.put_bits(gi.subblock_gain[window] as u32, 3);
            }
        } else {
            for region in 0..3 {
                bs.put_bits(gi.table_select[region], 5);
            }
            bs.put_bits(gi.region0_count, 4);
            bs.put_bits(gi.region1_count, 3);
        }

        if cfg.version == Version::Mpeg1 {
            bs.put_bits(gi.preflag, 1);
        }
        bs.put_bits(gi.scalefac_scale, 1);
        bs.put_bits(gi.count1table_select, 1);
    }

    /// Scalefactors and Huffman data of one granule into the main FIFO
    fn write_granule(
        &mut self,
        cfg: &SessionConfig,
        gi: &GranuleInfo,
        scfsi: &[u32; 4],
        gr: usize,
        scalefac: &Scalefac,
        ix: &[i32; GRANULE_SIZE],
    ) {
        let bits_start = self.main.bit_count();

        if cfg.version == Version::Mpeg1 {
            let slen1 = SLEN1_TAB[gi.scalefac_compress as usize];
            let slen2 = SLEN2_TAB[gi.scalefac_compress as usize];
            if gi.block_type == BlockType::Short {
                for sfb in 0..6 {
                    for w in 0..3 {
                        self.main.put_bits(scalefac.s[sfb][w] as u32, slen1);
                    }
                }
                for sfb in 6..SBPSY_S {
                    for w in 0..3 {
                        self.main.put_bits(scalefac.s[sfb][w] as u32, slen2);
                    }
                }
            } else {
                if gr == 0 || scfsi[0] == 0 {
                    for sfb in 0..6 {
                        self.main.put_bits(scalefac.l[sfb] as u32, slen1);
                    }
                }
                if gr == 0 || scfsi[1] == 0 {
                    for sfb in 6..11 {
                        self.main.put_bits(scalefac.l[sfb] as u32, slen1);
                    }
                }
                if gr == 0 || scfsi[2] == 0 {
                    for sfb in 11..16 {
                        self.main.put_bits(scalefac.l[sfb] as u32, slen2);
                    }
                }
                if gr == 0 || scfsi[3] == 0 {
                    for sfb in 16..SBPSY_L {
                        self.main.put_bits(scalefac.l[sfb] as u32, slen2);
                    }
                }
            }
        } else {
            // MPEG-2 partition coding
            if gi.block_type == BlockType::Short {
                let mut idx = 0usize;
                for (p, &width) in gi.sfb_partition_table.iter().enumerate() {
                    for _ in 0..width {
                        let sfb = idx / 3;
                        let w = idx % 3;
                        self.main.put_bits(scalefac.s[sfb][w] as u32, gi.slen[p]);
                        idx += 1;
                    }
                }
            } else {
                let mut sfb = 0usize;
                for (p, &width) in gi.sfb_partition_table.iter().enumerate() {
                    for _ in 0..width {
                        self.main.put_bits(scalefac.l[sfb] as u32, gi.slen[p]);
                        sfb += 1;
                    }
                }
            }
        }

        self.write_huffman(gi, ix);

        // pad up to part2_3_length; the count1 tables make all-ones safe
        let used = (self.main.bit_count() - bits_start) as i32;
        let mut stuffing = gi.part2_3_length as i32 - used;
        debug_assert!(stuffing >= 0, "granule overran part2_3_length");
        while stuffing >= 32 {
            self.main.put_bits(0xffff_ffff, 32);
            stuffing -= 32;
        }
        if stuffing > 0 {
            self.main.put_bits((1u32 << stuffing) - 1, stuffing as u32);
        }
    }

    fn write_huffman(&mut self, gi: &GranuleInfo, ix: &[i32; GRANULE_SIZE]) {
        let bigvalues = (gi.big_values * 2) as usize;
        let region1 = gi.address1 as usize;
        let region2 = gi.address2 as usize;

        let mut i = 0usize;
        while i < bigvalues {
            let idx = (i >= region1) as usize + (i >= region2) as usize;
            let table_index = gi.table_select[idx];
            if table_index != 0 {
                self.huffman_code(table_index as usize, ix[i], ix[i + 1]);
            }
            i += 2;
        }

        let h = &HUFFMAN_TABLE[(gi.count1table_select + 32) as usize];
        let count1_end = bigvalues + (gi.count1 * 4) as usize;
        let mut i = bigvalues;
        while i < count1_end {
            self.huffman_coder_count1(h, ix[i], ix[i + 1], ix[i + 2], ix[i + 3]);
            i += 4;
        }
    }

    fn huffman_coder_count1(&mut self, h: &HuffCodeTab, v: i32, w: i32, x: i32, y: i32) {
        let (v, sv) = abs_and_sign(v);
        let (w, sw) = abs_and_sign(w);
        let (x, sx) = abs_and_sign(x);
        let (y, sy) = abs_and_sign(y);
        debug_assert!(v <= 1 && w <= 1 && x <= 1 && y <= 1);

        let p = (v + (w << 1) + (x << 2) + (y << 3)) as usize;
        let (hb, hlen) = (h.hb.unwrap(), h.hlen.unwrap());
        self.main.put_bits(hb[p], hlen[p] as u32);

        let mut code = 0u32;
        let mut cbits = 0u32;
        for (val, sign) in [(v, sv), (w, sw), (x, sx), (y, sy)] {
            if val != 0 {
                code = (code << 1) | sign;
                cbits += 1;
            }
        }
        if cbits > 0 {
            self.main.put_bits(code, cbits);
        }
    }

    fn huffman_code(&mut self, table_select: usize, x: i32, y: i32) {
        let (mut x, signx) = abs_and_sign(x);
        let (mut y, signy) = abs_and_sign(y);

        let h = &HUFFMAN_TABLE[table_select];
        let ylen = h.ylen as usize;
        let (hb, hlen) = (h.hb.unwrap(), h.hlen.unwrap());

        if table_select > 15 {
            // ESC table: values above 14 spill into linbits
            let linbits = h.linbits;
            let mut linbits_x = 0u32;
            let mut linbits_y = 0u32;
            if x > 14 {
                linbits_x = (x - 15) as u32;
                debug_assert!(linbits_x <= h.linmax);
                x = 15;
            }
            if y > 14 {
                linbits_y = (y - 15) as u32;
                debug_assert!(linbits_y <= h.linmax);
                y = 15;
            }

            let idx = x as usize * ylen + y as usize;
            self.main.put_bits(hb[idx], hlen[idx] as u32);

            let mut ext = 0u32;
            let mut ext_bits = 0u32;
            if x > 14 {
                ext |= linbits_x;
                ext_bits += linbits;
            }
            if x != 0 {
                ext = (ext << 1) | signx;
                ext_bits += 1;
            }
            if y > 14 {
                ext = (ext << linbits) | linbits_y;
                ext_bits += linbits;
            }
            if y != 0 {
                ext = (ext << 1) | signy;
                ext_bits += 1;
            }
            if ext_bits > 0 {
                self.main.put_bits(ext, ext_bits);
            }
        } else {
            let idx = x as usize * ylen + y as usize;
            let mut code = hb[idx];
            let mut cbits = hlen[idx] as u32;
            if x != 0 {
                code = (code << 1) | signx;
                cbits += 1;
            }
            if y != 0 {
                code = (code << 1) | signy;
                cbits += 1;
            }
            self.main.put_bits(code, cbits);
        }
    }
}

#[inline]
fn abs_and_sign(x: i32) -> (i32, u32) {
    if x >= 0 {
        (x, 0)
    } else {
        (-x, 1)
    }
}

/// CRC-16 over the protected header bytes and the side info,
/// polynomial 0x8005 seeded with 0xffff
fn crc16(header_tail: &[u8], side: &[u8]) -> u16 {
    let mut crc: u32 = 0xffff;
    let mut update = |byte: u8| {
        crc ^= (byte as u32) << 8;
        for _ in 0..8 {
            crc <<= 1;
            if crc & 0x10000 != 0 {
                crc ^= 0x8005;
            }
        }
    };
    for &b in header_tail {
        update(b);
    }
    for &b in side {
        update(b);
    }
    (crc & 0xffff) as u16
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn bit_writer_packs_msb_first() {
        let mut bw = BitWriter::new();
        bw.put_bits(0b101, 3);
        bw.put_bits(0b0000_0110, 8);
        bw.put_bits(0b10101, 5);
        let bytes = bw.take_bytes();
        assert_eq!(bytes, vec![0b1010_0000, 0b1101_0101]);
    }

    #[test]
    fn bit_writer_handles_cache_spill() {
        let mut bw = BitWriter::new();
        for i in 0..9 {
            bw.put_bits(i & 0xff, 8);
        }
        assert_eq!(bw.bit_count(), 72);
        let bytes = bw.take_bytes();
        assert_eq!(bytes.len(), 9);
        assert_eq!(bytes[4], 4);
    }

    #[test]
    fn silent_frame_has_sync_and_geometry() {
        let cfg = Config::default().resolve().unwrap();
        let mut bs = Bitstream::new();
        let side = SideInfo::default();
        let scalefac = [[Scalefac::default(); MAX_CHANNELS]; MAX_GRANULES];
        let l3_enc = [[[0i32; GRANULE_SIZE]; MAX_CHANNELS]; MAX_GRANULES];

        for _ in 0..3 {
            bs.format_frame(&cfg, cfg.bitrate_index, false, &side, &scalefac, &l3_enc);
        }
        bs.flush();
        let out = bs.take_output();

        // 128 kbps, 44.1 kHz: 417 or 418 byte frames
        assert!(out.len() >= 3 * 417);
        assert_eq!(out[0], 0xff);
        assert_eq!(out[1] & 0xe0, 0xe0);
        // MPEG-1 layer III
        assert_eq!((out[1] >> 3) & 3, 3);
        assert_eq!((out[1] >> 1) & 3, 1);
        // bitrate index 9, samplerate index 0
        assert_eq!(out[2] >> 4, 9);
        assert_eq!((out[2] >> 2) & 3, 0);
    }

    #[test]
    fn padding_bit_tracks_the_fractional_slot() {
        // 44.1 kHz CBR-128 needs padding on most frames
        let cfg = Config::default().resolve().unwrap();
        let mut bs = Bitstream::new();
        let side = SideInfo::default();
        let scalefac = [[Scalefac::default(); MAX_CHANNELS]; MAX_GRANULES];
        let l3_enc = [[[0i32; GRANULE_SIZE]; MAX_CHANNELS]; MAX_GRANULES];

        let n = 50;
        let mut slot_lag = 0.0f64;
        for _ in 0..n {
            slot_lag -= cfg.frac_slots_per_frame;
            let padding = if slot_lag < 0.0 {
                slot_lag += 1.0;
                true
            } else {
                false
            };
            bs.format_frame(&cfg, cfg.bitrate_index, padding, &side, &scalefac, &l3_enc);
        }
        bs.flush();
        let out = bs.take_output();
        // frames average 417.96 bytes; all padding off would lose 48 bytes
        let expect = (cfg.bitrate_kbps as f64 * 125.0 * cfg.framesize as f64
            / cfg.samplerate_out as f64
            * n as f64) as usize;
        assert!(out.len() >= expect - 1 && out.len() <= expect + 1, "{}", out.len());
    }

    #[test]
    fn crc_is_stable() {
        let a = crc16(&[0x12, 0x34], &[0, 1, 2, 3]);
        let b = crc16(&[0x12, 0x34], &[0, 1, 2, 3]);
        assert_eq!(a, b);
        let c = crc16(&[0x12, 0x35], &[0, 1, 2, 3]);
        assert_ne!(a, c);
    }

    #[test]
    fn main_data_begin_reflects_backlog() {
        let cfg = Config::default().resolve().unwrap();
        let mut bs = Bitstream::new();
        let mut side = SideInfo::default();
        // two granules that underfill the frame leave a backlog
        for gr in 0..2 {
            for ch in 0..2 {
                side.gr[gr][ch].part2_3_length = 100;
            }
        }
        let scalefac = [[Scalefac::default(); MAX_CHANNELS]; MAX_GRANULES];
        let l3_enc = [[[0i32; GRANULE_SIZE]; MAX_CHANNELS]; MAX_GRANULES];

        bs.format_frame(&cfg, cfg.bitrate_index, true, &side, &scalefac, &l3_enc);
        assert!(!bs.pending.is_empty());
        bs.format_frame(&cfg, cfg.bitrate_index, false, &side, &scalefac, &l3_enc);
        bs.flush();
        let out = bs.take_output();

        // second frame's main_data_begin (9 bits after the 4-byte header)
        // must be nonzero: frame 1 could not fill its payload
        let frame2 = 418; // first frame got the padding byte
        let second = &out[frame2..];
        let mdb = ((second[4] as u32) << 1) | ((second[5] as u32) >> 7);
        assert!(mdb > 0, "main_data_begin {mdb}");
    }
}

//! Bit counting for the inner quantization loop
//!
//! Quantizes `|xr|^(3/4)` at a given global gain, derives the run-length
//! split into big_values / count1 / rzero, selects Huffman tables per
//! region, and counts the part3 bits. Also the scalefactor side:
//! `scale_bitcount` picks the cheapest scalefac_compress entry (MPEG-1)
//! or partition coding (MPEG-2) and reports when a scalefactor has grown
//! past what the fields can carry.

use lazy_static::lazy_static;

use crate::huffman::HUFFMAN_TABLE;
use crate::tables::{PRETAB, SLEN1_TAB, SLEN2_TAB};
use crate::types::{
    BlockType, GranuleInfo, Scalefac, GRANULE_SIZE, IXMAX_VAL, LARGE_BITS, SBPSY_L, SBPSY_S,
};

lazy_static! {
    /// 2^(-0.1875·(q-210)): the quantizer step for a global gain
    static ref IPOW20: Vec<f32> = (0..257)
        .map(|q| 2f32.powf(-0.1875 * (q as f32 - 210.0)))
        .collect();
    /// i^(4/3) for the inverse quantizer
    static ref POW43: Vec<f32> = (0..=IXMAX_VAL as usize)
        .map(|i| (i as f32).powf(4.0 / 3.0))
        .collect();
}

#[inline]
pub fn ipow20(gain: i32) -> f32 {
    IPOW20[gain.clamp(0, 256) as usize]
}

#[inline]
pub fn pow43(ix: i32) -> f32 {
    POW43[ix.clamp(0, IXMAX_VAL) as usize]
}

/// Quantize the whole granule: `ix = (xrpow · istep + 0.4054)` truncated
fn quantize_xrpow(xrpow: &[f32; GRANULE_SIZE], ix: &mut [i32; GRANULE_SIZE], istep: f32) {
    for (q, &x) in ix.iter_mut().zip(xrpow.iter()) {
        *q = (x * istep + 0.4054) as i32;
    }
}

/// Quantize at the granule's current global gain and count the Huffman
/// bits. Returns `LARGE_BITS` when the spectrum cannot fit the code table
/// range at this gain.
pub fn count_bits(
    ix: &mut [i32; GRANULE_SIZE],
    xrpow: &[f32; GRANULE_SIZE],
    xrpow_max: f32,
    cod_info: &mut GranuleInfo,
    sfb_long: &[usize],
) -> i32 {
    let istep = ipow20(cod_info.global_gain);
    if xrpow_max * istep > IXMAX_VAL as f32 {
        return LARGE_BITS;
    }
    quantize_xrpow(xrpow, ix, istep);
    noquant_count_bits(ix, cod_info, sfb_long)
}

/// Count bits for an already-quantized granule
pub fn noquant_count_bits(
    ix: &mut [i32; GRANULE_SIZE],
    cod_info: &mut GranuleInfo,
    sfb_long: &[usize],
) -> i32 {
    calc_runlen(ix, cod_info);
    let mut bits = count1_bitcount(ix, cod_info);
    subdivide(cod_info, sfb_long);
    bigv_tab_select(ix, cod_info);
    bits += bigv_bitcount(ix, cod_info);
    cod_info.part2_3_length = bits as u32;
    bits
}

/// rzero / count1 / big_values split, scanning from the top of the
/// spectrum
fn calc_runlen(ix: &[i32; GRANULE_SIZE], cod_info: &mut GranuleInfo) {
    let mut i = GRANULE_SIZE;
    while i > 1 {
        if ix[i - 1] != 0 || ix[i - 2] != 0 {
            break;
        }
        i -= 2;
    }

    cod_info.count1 = 0;
    while i > 3 {
        if ix[i - 1] > 1 || ix[i - 2] > 1 || ix[i - 3] > 1 || ix[i - 4] > 1 {
            break;
        }
        cod_info.count1 += 1;
        i -= 4;
    }

    cod_info.big_values = (i >> 1) as u32;
}

/// Bits for the count1 region, choosing between tables A and B
fn count1_bitcount(ix: &[i32; GRANULE_SIZE], cod_info: &mut GranuleInfo) -> i32 {
    let hlen_a = HUFFMAN_TABLE[32].hlen.unwrap();
    let hlen_b = HUFFMAN_TABLE[33].hlen.unwrap();
    let mut sum0 = 0i32;
    let mut sum1 = 0i32;

    let mut i = (cod_info.big_values << 1) as usize;
    for _ in 0..cod_info.count1 {
        let v = ix[i];
        let w = ix[i + 1];
        let x = ix[i + 2];
        let y = ix[i + 3];
        let p = (v + (w << 1) + (x << 2) + (y << 3)) as usize;

        let signbits =
            (v != 0) as i32 + (w != 0) as i32 + (x != 0) as i32 + (y != 0) as i32;
        sum0 += signbits + hlen_a[p] as i32;
        sum1 += signbits + hlen_b[p] as i32;
        i += 4;
    }

    if sum0 < sum1 {
        cod_info.count1table_select = 0;
        sum0
    } else {
        cod_info.count1table_select = 1;
        sum1
    }
}

/// region0/region1 split of the big_values area. Table C.1.5.4.4.6 for
/// normal blocks; window-switched granules use the fixed 36-line boundary
/// implied by the side info layout.
fn subdivide(cod_info: &mut GranuleInfo, sfb_long: &[usize]) {
    const SUBDV_TABLE: [(u32, u32); 23] = [
        (0, 0),
        (0, 0),
        (0, 0),
        (0, 0),
        (0, 0),
        (0, 1),
        (1, 1),
        (1, 1),
        (1, 2),
        (2, 2),
        (2, 3),
        (2, 3),
        (3, 4),
        (3, 4),
        (3, 4),
        (4, 5),
        (4, 5),
        (4, 6),
        (5, 6),
        (5, 6),
        (5, 7),
        (6, 7),
        (6, 7),
    ];

    let bigvalues_region = 2 * cod_info.big_values;
    if bigvalues_region == 0 {
        cod_info.region0_count = 0;
        cod_info.region1_count = 0;
        cod_info.address1 = 0;
        cod_info.address2 = 0;
        cod_info.address3 = 0;
        return;
    }

    if cod_info.block_type != BlockType::Norm {
        // region bits are replaced by the window fields in the side info
        cod_info.region0_count = if cod_info.block_type == BlockType::Short {
            8
        } else {
            7
        };
        cod_info.region1_count = 36;
        cod_info.address1 = bigvalues_region.min(36);
        cod_info.address2 = bigvalues_region;
        cod_info.address3 = bigvalues_region;
        return;
    }

    let mut scfb_anz = 0usize;
    while scfb_anz < 22 && (sfb_long[scfb_anz] as u32) < bigvalues_region {
        scfb_anz += 1;
    }

    let mut thiscount = SUBDV_TABLE[scfb_anz].0;
    while thiscount > 0 {
        if sfb_long[thiscount as usize + 1] as u32 <= bigvalues_region {
            break;
        }
        thiscount -= 1;
    }
    cod_info.region0_count = thiscount;
    cod_info.address1 = sfb_long[thiscount as usize + 1] as u32;

    let mut thiscount = SUBDV_TABLE[scfb_anz].1;
    while thiscount > 0 {
        let idx = (cod_info.region0_count + 1 + thiscount) as usize;
        if idx < 22 && sfb_long[idx + 1] as u32 <= bigvalues_region {
            break;
        }
        thiscount -= 1;
    }
    cod_info.region1_count = thiscount;
    let idx = (cod_info.region0_count + 1 + thiscount) as usize;
    cod_info.address2 = if idx + 1 < sfb_long.len() {
        (sfb_long[idx + 1] as u32).min(bigvalues_region)
    } else {
        bigvalues_region
    };
    cod_info.address3 = bigvalues_region;
}

/// Codebook choice per big_values region
fn bigv_tab_select(ix: &[i32; GRANULE_SIZE], cod_info: &mut GranuleInfo) {
    cod_info.table_select = [0; 3];
    if cod_info.address1 > 0 {
        cod_info.table_select[0] = choose_table(ix, 0, cod_info.address1 as usize);
    }
    if cod_info.address2 > cod_info.address1 {
        cod_info.table_select[1] =
            choose_table(ix, cod_info.address1 as usize, cod_info.address2 as usize);
    }
    if cod_info.address3 > cod_info.address2 {
        cod_info.table_select[2] =
            choose_table(ix, cod_info.address2 as usize, cod_info.address3 as usize);
    }
}

fn bigv_bitcount(ix: &[i32; GRANULE_SIZE], gi: &GranuleInfo) -> i32 {
    let mut bits = 0;
    if gi.table_select[0] != 0 {
        bits += count_bit_region(ix, 0, gi.address1 as usize, gi.table_select[0]);
    }
    if gi.table_select[1] != 0 {
        bits += count_bit_region(
            ix,
            gi.address1 as usize,
            gi.address2 as usize,
            gi.table_select[1],
        );
    }
    if gi.table_select[2] != 0 {
        bits += count_bit_region(
            ix,
            gi.address2 as usize,
            gi.address3 as usize,
            gi.table_select[2],
        );
    }
    bits
}

fn ix_max(ix: &[i32], begin: usize, end: usize) -> i32 {
    ix[begin..end.min(ix.len())].iter().copied().max().unwrap_or(0)
}

/// Pick the table that codes `ix[begin..end]` with the fewest bits.
/// Tables sharing a maximum differ in their code assignments, so the
/// shortlisted alternatives are counted explicitly.
fn choose_table(ix: &[i32], begin: usize, end: usize) -> u32 {
    let max = ix_max(ix, begin, end);
    if max == 0 {
        return 0;
    }

    if max < 15 {
        let mut choice = 0u32;
        for i in 0..=13 {
            if let Some(t) = HUFFMAN_TABLE.get(i) {
                if t.hb.is_some() && t.xlen > max as u32 {
                    choice = i as u32;
                    break;
                }
            }
        }
        let mut best = count_bit_region(ix, begin, end, choice);

        match choice {
            2 => {
                let alt = count_bit_region(ix, begin, end, 3);
                if alt <= best {
                    choice = 3;
                }
            }
            5 => {
                let alt = count_bit_region(ix, begin, end, 6);
                if alt <= best {
                    choice = 6;
                }
            }
            7 => {
                let alt = count_bit_region(ix, begin, end, 8);
                if alt <= best {
                    choice = 8;
                    best = alt;
                }
                let alt = count_bit_region(ix, begin, end, 9);
                if alt <= best {
                    choice = 9;
                }
            }
            10 => {
                let alt = count_bit_region(ix, begin, end, 11);
                if alt <= best {
                    choice = 11;
                    best = alt;
                }
                let alt = count_bit_region(ix, begin, end, 12);
                if alt <= best {
                    choice = 12;
                }
            }
            13 => {
                let alt = count_bit_region(ix, begin, end, 15);
                if alt <= best {
                    choice = 15;
                }
            }
            _ => {}
        }
        choice
    } else {
        // escape tables: smallest linbits that can carry max-15
        let linmax = (max - 15) as u32;
        let mut choice0 = 23u32;
        for i in 16..24 {
            if HUFFMAN_TABLE[i].linmax >= linmax {
                choice0 = i as u32;
                break;
            }
        }
        let mut choice1 = 31u32;
        for i in 24..32 {
            if HUFFMAN_TABLE[i].linmax >= linmax {
                choice1 = i as u32;
                break;
            }
        }
        let sum0 = count_bit_region(ix, begin, end, choice0);
        let sum1 = count_bit_region(ix, begin, end, choice1);
        if sum1 < sum0 {
            choice1
        } else {
            choice0
        }
    }
}

/// Bits to code `ix[start..end]` with one table, sign and linbits included
fn count_bit_region(ix: &[i32], start: usize, end: usize, table: u32) -> i32 {
    if table == 0 {
        return 0;
    }
    let h = &HUFFMAN_TABLE[table as usize];
    let hlen = match h.hlen {
        Some(hlen) => hlen,
        None => return LARGE_BITS,
    };
    let ylen = h.ylen as usize;
    let linbits = h.linbits as i32;

    let mut sum = 0i32;
    let mut i = start;
    while i + 1 < end.min(GRANULE_SIZE) {
        let mut x = ix[i];
        let mut y = ix[i + 1];
        if table > 15 {
            if x > 14 {
                x = 15;
                sum += linbits;
            }
            if y > 14 {
                y = 15;
                sum += linbits;
            }
        }
        sum += hlen[(x as usize) * ylen + y as usize] as i32;
        if x != 0 {
            sum += 1;
        }
        if y != 0 {
            sum += 1;
        }
        i += 2;
    }
    sum
}

/// Best scalefac_compress for MPEG-1, trying the preemphasis table first.
/// Returns true when some scalefactor does not fit any entry.
pub fn scale_bitcount(scalefac: &mut Scalefac, cod_info: &mut GranuleInfo) -> bool {
    let mut max_slen1 = 0i32;
    let mut max_slen2 = 0i32;

    if cod_info.block_type == BlockType::Short {
        for sfb in 0..6 {
            for w in 0..3 {
                max_slen1 = max_slen1.max(scalefac.s[sfb][w]);
            }
        }
        for sfb in 6..SBPSY_S {
            for w in 0..3 {
                max_slen2 = max_slen2.max(scalefac.s[sfb][w]);
            }
        }
    } else {
        // all bands at or above the preemphasis contour can drop it into
        // the preflag
        if cod_info.preflag == 0 {
            let mut sfb = 11;
            while sfb < SBPSY_L && scalefac.l[sfb] >= PRETAB[sfb] {
                sfb += 1;
            }
            if sfb == SBPSY_L && scalefac.l[11..SBPSY_L].iter().any(|&s| s > 0) {
                cod_info.preflag = 1;
                for sfb in 11..SBPSY_L {
                    scalefac.l[sfb] -= PRETAB[sfb];
                }
            }
        }
        for sfb in 0..11 {
            max_slen1 = max_slen1.max(scalefac.l[sfb]);
        }
        for sfb in 11..SBPSY_L {
            max_slen2 = max_slen2.max(scalefac.l[sfb]);
        }
    }

    let (n1, n2) = if cod_info.block_type == BlockType::Short {
        (18, 18)
    } else {
        (11, 10)
    };

    let mut best_bits = LARGE_BITS;
    let mut best_k = None;
    for k in 0..16 {
        if max_slen1 < (1 << SLEN1_TAB[k]) && max_slen2 < (1 << SLEN2_TAB[k]) {
            let bits = (n1 * SLEN1_TAB[k] + n2 * SLEN2_TAB[k]) as i32;
            if bits < best_bits {
                best_bits = bits;
                best_k = Some(k);
            }
        }
    }
    match best_k {
        Some(k) => {
            cod_info.scalefac_compress = k as u32;
            cod_info.part2_length = best_bits as u32;
            false
        }
        None => true,
    }
}

/// MPEG-2 scalefactor partition widths, no preflag, no intensity stereo
const LSF_PARTITIONS_L: [u32; 4] = [6, 5, 5, 5];
const LSF_PARTITIONS_S: [u32; 4] = [9, 9, 9, 9];
/// Field widths available to each partition's slen
const LSF_SLEN_MAX: [u32; 4] = [4, 4, 3, 3];

/// MPEG-2/2.5 scalefactor coding: four partitions with independent widths,
/// packed into the 9-bit scalefac_compress.
pub fn scale_bitcount_lsf(scalefac: &Scalefac, cod_info: &mut GranuleInfo) -> bool {
    let short = cod_info.block_type == BlockType::Short;
    let partitions = if short {
        &LSF_PARTITIONS_S
    } else {
        &LSF_PARTITIONS_L
    };

    // flatten the scalefactors in transmission order
    let mut flat = [0i32; 36];
    let total: usize;
    if short {
        let mut j = 0;
        for sfb in 0..SBPSY_S {
            for w in 0..3 {
                flat[j] = scalefac.s[sfb][w];
                j += 1;
            }
        }
        total = j;
    } else {
        flat[..SBPSY_L].copy_from_slice(&scalefac.l[..SBPSY_L]);
        total = SBPSY_L;
    }
    debug_assert_eq!(total, partitions.iter().sum::<u32>() as usize);

    let mut slen = [0u32; 4];
    let mut start = 0usize;
    for (p, &width) in partitions.iter().enumerate() {
        let max = flat[start..start + width as usize]
            .iter()
            .copied()
            .max()
            .unwrap_or(0);
        let mut bits = 0u32;
        while (1i32 << bits) <= max {
            bits += 1;
        }
        if bits > LSF_SLEN_MAX[p] {
            return true;
        }
        slen[p] = bits;
        start += width as usize;
    }

    cod_info.slen = slen;
    cod_info.sfb_partition_table = *partitions;
    cod_info.scalefac_compress = ((slen[0] * 5 + slen[1]) << 4) | (slen[2] << 2) | slen[3];
    cod_info.part2_length = partitions
        .iter()
        .zip(slen.iter())
        .map(|(&n, &s)| n * s)
        .sum::<u32>();
    cod_info.preflag = 0;
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::SFB_LONG;

    #[test]
    fn power_tables_are_consistent() {
        assert!((ipow20(210) - 1.0).abs() < 1e-6);
        // one gain step is a quarter of a power of two on the 3/4 scale
        let ratio = ipow20(214) / ipow20(210);
        assert!((ratio - 2f32.powf(-0.75)).abs() < 1e-6);
        assert!((pow43(2) - 2f32.powf(4.0 / 3.0)).abs() < 1e-5);
    }

    #[test]
    fn silence_counts_zero_bits() {
        let mut ix = [0i32; GRANULE_SIZE];
        let mut gi = GranuleInfo::default();
        let bits = noquant_count_bits(&mut ix, &mut gi, &SFB_LONG[0]);
        assert_eq!(bits, 0);
        assert_eq!(gi.big_values, 0);
        assert_eq!(gi.count1, 0);
    }

    #[test]
    fn runlen_split_matches_hand_example() {
        let mut ix = [0i32; GRANULE_SIZE];
        // 6 big values, then 4 count1-able, then zeros
        ix[..6].copy_from_slice(&[3, 2, 5, 1, 2, 2]);
        ix[6..10].copy_from_slice(&[1, 0, 1, 1]);
        let mut gi = GranuleInfo::default();
        calc_runlen(&ix, &mut gi);
        assert_eq!(gi.big_values, 3);
        assert_eq!(gi.count1, 1);
    }

    #[test]
    fn bigger_gain_uses_fewer_bits() {
        let mut xrpow = [0.0f32; GRANULE_SIZE];
        for (i, v) in xrpow.iter_mut().enumerate() {
            *v = 300.0 / (i + 1) as f32;
        }
        let xrpow_max = xrpow[0];
        let mut ix = [0i32; GRANULE_SIZE];

        let mut gi = GranuleInfo::default();
        gi.global_gain = 200;
        let fine = count_bits(&mut ix, &xrpow, xrpow_max, &mut gi, &SFB_LONG[0]);
        gi.global_gain = 230;
        let coarse = count_bits(&mut ix, &xrpow, xrpow_max, &mut gi, &SFB_LONG[0]);
        assert!(fine > coarse, "fine {fine} <= coarse {coarse}");
    }

    #[test]
    fn escape_region_counts_linbits() {
        let mut ix = [0i32; GRANULE_SIZE];
        ix[0] = 100;
        ix[1] = 3;
        let mut gi = GranuleInfo::default();
        let bits = noquant_count_bits(&mut ix, &mut gi, &SFB_LONG[0]);
        assert!(gi.table_select[0] >= 16, "table {}", gi.table_select[0]);
        let linbits = HUFFMAN_TABLE[gi.table_select[0] as usize].linbits as i32;
        assert!(bits > linbits);
    }

    #[test]
    fn scale_bitcount_applies_preflag() {
        let mut sf = Scalefac::default();
        for sfb in 11..SBPSY_L {
            sf.l[sfb] = PRETAB[sfb] + 1;
        }
        let mut gi = GranuleInfo::default();
        assert!(!scale_bitcount(&mut sf, &mut gi));
        assert_eq!(gi.preflag, 1);
        for sfb in 11..SBPSY_L {
            assert_eq!(sf.l[sfb], 1);
        }
        assert!(gi.part2_length > 0);
    }

    #[test]
    fn scale_bitcount_rejects_oversized_scalefactors() {
        let mut sf = Scalefac::default();
        sf.l[0] = 16; // slen1 caps at 4 bits
        let mut gi = GranuleInfo::default();
        assert!(scale_bitcount(&mut sf, &mut gi));
    }

    #[test]
    fn lsf_partition_coding_packs_compress_field() {
        let mut sf = Scalefac::default();
        sf.l[0] = 7; // needs 3 bits in partition 0
        sf.l[20] = 3; // needs 2 bits in partition 3
        let mut gi = GranuleInfo::default();
        assert!(!scale_bitcount_lsf(&sf, &mut gi));
        assert_eq!(gi.slen[0], 3);
        assert_eq!(gi.slen[3], 2);
        assert_eq!(gi.part2_length, 6 * 3 + 5 * 2);
        assert!(gi.scalefac_compress < 512);
    }

    #[test]
    fn window_switched_granules_use_fixed_regions() {
        let mut ix = [0i32; GRANULE_SIZE];
        for v in ix.iter_mut().take(100) {
            *v = 2;
        }
        let mut gi = GranuleInfo {
            block_type: BlockType::Short,
            ..Default::default()
        };
        noquant_count_bits(&mut ix, &mut gi, &SFB_LONG[0]);
        assert_eq!(gi.address1, 36);
        assert_eq!(gi.address2, gi.address3);
    }
}

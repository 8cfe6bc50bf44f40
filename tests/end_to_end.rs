//! End-to-end bitstream scenarios: encode, then walk and parse the
//! emitted frames at the bit level.

use luster_mp3::{Config, Encoder, Mode, ShortBlocks, VbrMode};

const BITRATES_V1: [u32; 15] = [
    0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320,
];
const BITRATES_V2: [u32; 15] = [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160];
const SAMPLERATES_V1: [u32; 3] = [44100, 48000, 32000];
const SAMPLERATES_V2: [u32; 3] = [22050, 24000, 16000];
const SAMPLERATES_V25: [u32; 3] = [11025, 12000, 8000];

struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn get(&mut self, n: usize) -> u32 {
        let mut v = 0u32;
        for _ in 0..n {
            let byte = self.data[self.pos / 8];
            let bit = (byte >> (7 - self.pos % 8)) & 1;
            v = (v << 1) | bit as u32;
            self.pos += 1;
        }
        v
    }
}

#[derive(Debug, Clone)]
struct Frame {
    version: u32,
    bitrate_index: usize,
    samplerate_index: usize,
    padding: bool,
    protection: bool,
    mode: u32,
    len: usize,
    /// Whole frame bytes
    bytes: Vec<u8>,
}

impl Frame {
    fn samplerate(&self) -> u32 {
        match self.version {
            3 => SAMPLERATES_V1[self.samplerate_index],
            2 => SAMPLERATES_V2[self.samplerate_index],
            0 => SAMPLERATES_V25[self.samplerate_index],
            v => panic!("reserved version {v}"),
        }
    }

    fn bitrate(&self) -> u32 {
        if self.version == 3 {
            BITRATES_V1[self.bitrate_index]
        } else {
            BITRATES_V2[self.bitrate_index]
        }
    }
}

/// Walk the stream header by header; panics on any sync or geometry
/// violation.
fn walk_frames(data: &[u8]) -> Vec<Frame> {
    let mut frames = Vec::new();
    let mut pos = 0usize;
    while pos + 4 <= data.len() {
        assert_eq!(data[pos], 0xff, "lost sync at {pos}");
        assert_eq!(data[pos + 1] & 0xe0, 0xe0, "lost sync at {pos}");
        let version = ((data[pos + 1] >> 3) & 3) as u32;
        let layer = (data[pos + 1] >> 1) & 3;
        assert_eq!(layer, 1, "not layer III at {pos}");
        let protection = data[pos + 1] & 1 == 0;
        let bitrate_index = (data[pos + 2] >> 4) as usize;
        let samplerate_index = ((data[pos + 2] >> 2) & 3) as usize;
        assert!(bitrate_index > 0 && bitrate_index < 15, "bad bitrate index");
        assert!(samplerate_index < 3, "bad samplerate index");
        let padding = (data[pos + 2] >> 1) & 1 == 1;
        let mode = ((data[pos + 3] >> 6) & 3) as u32;

        let mut frame = Frame {
            version,
            bitrate_index,
            samplerate_index,
            padding,
            protection,
            mode,
            len: 0,
            bytes: Vec::new(),
        };
        let samples_per_frame = if version == 3 { 1152 } else { 576 };
        let len = (samples_per_frame / 8 * frame.bitrate() as usize * 1000)
            / frame.samplerate() as usize
            + padding as usize;
        frame.len = len;
        assert!(pos + len <= data.len(), "truncated frame at {pos}");
        frame.bytes = data[pos..pos + len].to_vec();
        frames.push(frame);
        pos += len;
    }
    assert_eq!(pos, data.len(), "trailing bytes after the last frame");
    frames
}

/// Side info of an MPEG-1 frame: (main_data_begin, block type per
/// [granule][channel], window_switching flags)
fn parse_side_v1(frame: &Frame, channels: usize) -> (u32, Vec<Vec<Option<u32>>>) {
    let offset = 4 + if frame.protection { 2 } else { 0 };
    let mut br = BitReader::new(&frame.bytes[offset..]);
    let main_data_begin = br.get(9);
    br.get(if channels == 2 { 3 } else { 5 }); // private
    for _ in 0..channels {
        br.get(4); // scfsi
    }
    let mut block_types = Vec::new();
    for _ in 0..2 {
        let mut per_ch = Vec::new();
        for _ in 0..channels {
            let part2_3 = br.get(12);
            assert!(part2_3 <= 4095);
            let big_values = br.get(9);
            assert!(big_values <= 288);
            let global_gain = br.get(8);
            assert!(global_gain < 256);
            br.get(4); // scalefac_compress
            let window_switching = br.get(1);
            if window_switching == 1 {
                let block_type = br.get(2);
                assert_ne!(block_type, 0, "forbidden block type 0 with switching");
                br.get(1); // mixed
                br.get(2 * 5);
                br.get(3 * 3);
                per_ch.push(Some(block_type));
            } else {
                br.get(3 * 5);
                br.get(4); // region0
                br.get(3); // region1
                per_ch.push(None);
            }
            br.get(1); // preflag
            br.get(1); // scalefac_scale
            br.get(1); // count1table_select
        }
        block_types.push(per_ch);
    }
    (main_data_begin, block_types)
}

fn encode_all(cfg: &Config, left: &[i16], right: &[i16]) -> Vec<u8> {
    let mut enc = Encoder::new(cfg).unwrap();
    let mut out = enc.encode_buffer_i16(left, right).unwrap();
    out.extend(enc.flush().unwrap());
    out
}

fn noise(len: usize, amp: f32) -> Vec<i16> {
    let mut state = 0x2545_f491u32;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            ((state as f32 / u32::MAX as f32 - 0.5) * amp) as i16
        })
        .collect()
}

#[test]
fn silence_cbr128_emits_valid_frames() {
    let samples = vec![0i16; 44100];
    let out = encode_all(&Config::default(), &samples, &samples);
    let frames = walk_frames(&out);

    // a second of audio plus delay and flush padding
    let expect = (44100 + 576 + 288) / 1152;
    assert!(frames.len() >= expect, "{} frames", frames.len());
    for f in &frames {
        assert_eq!(f.version, 3);
        assert_eq!(f.bitrate_index, 9, "128 kbps");
        assert_eq!(f.samplerate_index, 0, "44.1 kHz");
        assert_eq!(f.mode, 1, "joint stereo");
        let (mdb, _) = parse_side_v1(f, 2);
        assert!(mdb <= 511);
    }
}

#[test]
fn determinism_across_sessions() {
    use sha2::{Digest, Sha256};
    let samples = noise(20000, 18000.0);
    let a = encode_all(&Config::default(), &samples, &samples);
    let b = encode_all(&Config::default(), &samples, &samples);
    assert_eq!(Sha256::digest(&a), Sha256::digest(&b));
    assert!(!a.is_empty());
}

#[test]
fn impulse_triggers_bracketed_short_blocks() {
    // one loud impulse in otherwise silent input
    let mut samples = vec![0i16; 3 * 1152];
    samples[1000] = 29000;
    let cfg = Config {
        short_blocks: ShortBlocks::Coupled,
        ..Default::default()
    };
    let out = encode_all(&cfg, &samples, &samples);
    let frames = walk_frames(&out);

    // collect the block type sequence of channel 0 across the stream:
    // None = normal long block
    let mut seq = Vec::new();
    for f in &frames {
        let (_, bt) = parse_side_v1(f, 2);
        for gr in bt {
            seq.push(gr[0]);
        }
    }

    let shorts: Vec<usize> = seq
        .iter()
        .enumerate()
        .filter(|(_, b)| **b == Some(2))
        .map(|(i, _)| i)
        .collect();
    assert!(!shorts.is_empty(), "impulse did not switch blocks: {seq:?}");

    for &i in &shorts {
        // before a short: start(1) or another short
        let prev = seq[i - 1];
        assert!(
            prev == Some(1) || prev == Some(2),
            "granule before short was {prev:?} in {seq:?}"
        );
        // after: stop(3) or another short
        let next = seq[i + 1];
        assert!(
            next == Some(3) || next == Some(2),
            "granule after short was {next:?} in {seq:?}"
        );
    }
}

#[test]
fn stationary_sine_stays_on_long_blocks() {
    let samples: Vec<i16> = (0..44100)
        .map(|i| {
            (20000.0 * (2.0 * std::f64::consts::PI * 1000.0 * i as f64 / 44100.0).sin()) as i16
        })
        .collect();
    let out = encode_all(&Config::default(), &samples, &samples);
    let frames = walk_frames(&out);
    assert!(frames.len() > 10);

    // skip the boundary frames: startup transient at the front, the
    // cutoff click and flush padding at the back
    for f in &frames[2..frames.len() - 4] {
        let (_, bt) = parse_side_v1(f, 2);
        for gr in bt {
            for ch in gr {
                assert_eq!(ch, None, "steady sine switched away from long blocks");
            }
        }
    }
}

#[test]
fn vbr_stream_varies_its_bitrate() {
    // alternating quiet and loud passages
    let mut samples = noise(6 * 1152, 2000.0);
    let loud = noise(6 * 1152, 28000.0);
    samples.extend(loud);
    let quiet = noise(6 * 1152, 300.0);
    samples.extend(quiet);

    let cfg = Config {
        vbr: VbrMode::Rh,
        vbr_quality: 4,
        vbr_max_bitrate_kbps: 256,
        ..Default::default()
    };
    let out = encode_all(&cfg, &samples, &samples);
    let frames = walk_frames(&out);

    let mut seen = std::collections::BTreeSet::new();
    for f in &frames {
        seen.insert(f.bitrate_index);
        assert!(f.bitrate() <= 256, "frame above VBR ceiling");
        let (mdb, _) = parse_side_v1(f, 2);
        assert!(mdb <= 511);
    }
    assert!(seen.len() > 1, "VBR stream used a single bitrate: {seen:?}");
}

#[test]
fn mpeg2_mono_stream_has_lsf_geometry() {
    let samples = noise(22050, 12000.0);
    let cfg = Config {
        in_samplerate: 22050,
        num_channels: 1,
        mode: Mode::Mono,
        bitrate: 64,
        ..Default::default()
    };
    let out = encode_all(&cfg, &samples, &[]);
    let frames = walk_frames(&out);
    assert!(frames.len() > 30);
    for f in &frames {
        assert_eq!(f.version, 2, "MPEG-2");
        assert_eq!(f.samplerate(), 22050);
        assert_eq!(f.mode, 3, "mono");
    }
}

#[test]
fn error_protection_adds_a_crc() {
    let samples = vec![0i16; 4 * 1152];
    let plain = encode_all(&Config::default(), &samples, &samples);
    let cfg = Config {
        error_protection: true,
        ..Default::default()
    };
    let protected = encode_all(&cfg, &samples, &samples);

    let pf = walk_frames(&protected);
    assert!(pf.iter().all(|f| f.protection));
    assert!(walk_frames(&plain).iter().all(|f| !f.protection));
}

#[test]
fn flush_accounts_for_every_sample() {
    let n = 10_000usize;
    let samples = noise(n, 15000.0);
    let mut enc = Encoder::new(&Config::default()).unwrap();
    let mut out = enc.encode_buffer_i16(&samples, &samples).unwrap();
    out.extend(enc.flush().unwrap());

    let frames = walk_frames(&out);
    let decoded = frames.len() * 1152;
    let delay = enc.encoder_delay();
    let padding = enc.encoder_padding();
    assert!(decoded >= n + delay, "decoded {decoded} < input+delay");
    assert!(padding >= 288);
    assert!(padding < 288 + 1152);
    // every sample is covered, nothing more than one frame of slack
    assert!(decoded <= n + delay + padding + 1152);
}

#[test]
fn streaming_in_small_chunks_matches_one_shot() {
    use sha2::{Digest, Sha256};
    let samples = noise(9000, 9000.0);

    let one_shot = encode_all(&Config::default(), &samples, &samples);

    let mut enc = Encoder::new(&Config::default()).unwrap();
    let mut chunked = Vec::new();
    for chunk in samples.chunks(137) {
        chunked.extend(enc.encode_buffer_i16(chunk, chunk).unwrap());
    }
    chunked.extend(enc.flush().unwrap());

    assert_eq!(Sha256::digest(&one_shot), Sha256::digest(&chunked));
}

#[test]
fn abr_tracks_its_mean_bitrate_loosely() {
    let samples = noise(44100, 16000.0);
    let cfg = Config {
        vbr: VbrMode::Abr,
        vbr_mean_bitrate_kbps: 112,
        ..Default::default()
    };
    let out = encode_all(&cfg, &samples, &samples);
    let frames = walk_frames(&out);
    let mean: f64 =
        frames.iter().map(|f| f.bitrate() as f64).sum::<f64>() / frames.len() as f64;
    assert!(
        (48.0..=288.0).contains(&mean),
        "ABR mean bitrate drifted to {mean}"
    );
}

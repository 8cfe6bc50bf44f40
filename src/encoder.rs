//! The encoder session
//!
//! Owns every piece of per-session state and drives the per-frame
//! pipeline: sample buffering, psychoacoustic analysis (one granule of
//! lookahead), the block-switched MDCT, the rate-controlled quantization
//! loop, and frame assembly. Sessions are value types; two sessions never
//! share mutable state, so they may run on different threads.

use log::debug;

use crate::bitstream::Bitstream;
use crate::config::{Config, SessionConfig, VbrMode};
use crate::error::{ConfigResult, EncodeError, EncodeResult};
use crate::mdct::Filterbank;
use crate::pcm::{self, SampleBuffer};
use crate::psymodel::{pcfact, PsyModel};
use crate::quantize::{FrameState, QuantizeLoop};
use crate::reservoir::Reservoir;
use crate::tables::{SFB_LONG, SFB_SHORT};
use crate::types::{
    PsyRatio, Scalefac, SideInfo, ENCDELAY, GRANULE_SIZE, MAX_CHANNELS, MAX_GRANULES, POSTDELAY,
    SBMAX_L, SBMAX_S,
};

/// Offset of the psychoacoustic FFT window behind the granule start
const FFTOFFSET: usize = 272;

pub struct Encoder {
    cfg: SessionConfig,
    psy: PsyModel,
    filterbank: Filterbank,
    quant: QuantizeLoop,
    resv: Reservoir,
    bs: Bitstream,
    samples: SampleBuffer,
    /// Samples needed in the buffer before a frame can be cut
    mf_needed: usize,
    /// Real samples (plus the delay budget) not yet inside emitted frames
    mf_samples_to_encode: i64,
    slot_lag: f64,
    frame_count: u64,
    encoder_padding: usize,
    // per-frame work areas
    xr: Box<[[[f32; GRANULE_SIZE]; MAX_CHANNELS]; MAX_GRANULES]>,
    l3_enc: Box<[[[i32; GRANULE_SIZE]; MAX_CHANNELS]; MAX_GRANULES]>,
    scalefac: Box<[[Scalefac; MAX_CHANNELS]; MAX_GRANULES]>,
    masking: [[PsyRatio; MAX_CHANNELS]; MAX_GRANULES],
    masking_ms: [[PsyRatio; MAX_CHANNELS]; MAX_GRANULES],
    pe: [[f32; MAX_CHANNELS]; MAX_GRANULES],
    pe_ms: [[f32; MAX_CHANNELS]; MAX_GRANULES],
    ath_l: [f32; SBMAX_L],
    ath_s: [f32; SBMAX_S],
}

impl std::fmt::Debug for Encoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Encoder")
            .field("cfg", &self.cfg)
            .field("frame_count", &self.frame_count)
            .finish_non_exhaustive()
    }
}

impl Encoder {
    /// Validate the configuration and build a session. All tables are
    /// computed here; encoding itself never allocates beyond the output.
    pub fn new(config: &Config) -> ConfigResult<Self> {
        let cfg = config.resolve()?;
        let psy = PsyModel::new(&cfg);
        let ath_l = psy.ath_l;
        let ath_s = psy.ath_s;

        let mf_needed = (1024 + cfg.framesize - FFTOFFSET).max(512 + cfg.framesize - 32);
        debug!(
            "session: {} Hz, {} kbps nominal, {:?}, {:?}, {} granules/frame",
            cfg.samplerate_out, cfg.bitrate_kbps, cfg.mode, cfg.vbr, cfg.mode_gr
        );

        Ok(Self {
            psy,
            filterbank: Filterbank::new(),
            quant: QuantizeLoop::new(),
            resv: Reservoir::new(),
            bs: Bitstream::new(),
            samples: SampleBuffer::new(),
            mf_needed,
            mf_samples_to_encode: (ENCDELAY + POSTDELAY) as i64,
            slot_lag: 0.0,
            frame_count: 0,
            encoder_padding: 0,
            xr: Box::new([[[0.0; GRANULE_SIZE]; MAX_CHANNELS]; MAX_GRANULES]),
            l3_enc: Box::new([[[0; GRANULE_SIZE]; MAX_CHANNELS]; MAX_GRANULES]),
            scalefac: Box::new([[Scalefac::default(); MAX_CHANNELS]; MAX_GRANULES]),
            masking: [[PsyRatio::default(); MAX_CHANNELS]; MAX_GRANULES],
            masking_ms: [[PsyRatio::default(); MAX_CHANNELS]; MAX_GRANULES],
            pe: [[0.0; MAX_CHANNELS]; MAX_GRANULES],
            pe_ms: [[0.0; MAX_CHANNELS]; MAX_GRANULES],
            ath_l,
            ath_s,
            cfg,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.cfg
    }

    /// Samples of delay before the first real granule
    pub fn encoder_delay(&self) -> usize {
        ENCDELAY
    }

    /// Zero samples appended at flush, valid after [`Self::flush`]
    pub fn encoder_padding(&self) -> usize {
        self.encoder_padding
    }

    /// Encode 16-bit PCM, one slice per channel. For mono sessions the
    /// right slice may be empty.
    pub fn encode_buffer_i16(&mut self, left: &[i16], right: &[i16]) -> EncodeResult<Vec<u8>> {
        self.check_channels(left.len(), right.len())?;
        let l = pcm::from_i16(left);
        let r = if right.is_empty() { l.clone() } else { pcm::from_i16(right) };
        self.feed(&l, &r)
    }

    /// Encode high-resolution PCM in the upper 16 bits of i32
    pub fn encode_buffer_i32(&mut self, left: &[i32], right: &[i32]) -> EncodeResult<Vec<u8>> {
        self.check_channels(left.len(), right.len())?;
        let l = pcm::from_i32(left);
        let r = if right.is_empty() { l.clone() } else { pcm::from_i32(right) };
        self.feed(&l, &r)
    }

    /// Encode PCM in the upper 16 bits of i64
    pub fn encode_buffer_i64(&mut self, left: &[i64], right: &[i64]) -> EncodeResult<Vec<u8>> {
        self.check_channels(left.len(), right.len())?;
        let l = pcm::from_i64(left);
        let r = if right.is_empty() { l.clone() } else { pcm::from_i64(right) };
        self.feed(&l, &r)
    }

    /// Encode float PCM in ±1.0
    pub fn encode_buffer_f32(&mut self, left: &[f32], right: &[f32]) -> EncodeResult<Vec<u8>> {
        self.check_channels(left.len(), right.len())?;
        let l = pcm::from_f32(left);
        let r = if right.is_empty() { l.clone() } else { pcm::from_f32(right) };
        self.feed(&l, &r)
    }

    /// Encode interleaved L/R 16-bit PCM
    pub fn encode_buffer_interleaved_i16(&mut self, samples: &[i16]) -> EncodeResult<Vec<u8>> {
        if samples.len() % 2 != 0 {
            return Err(EncodeError::RaggedInterleavedBuffer(samples.len()));
        }
        let (l, r) = pcm::deinterleave(samples);
        self.feed(&l, &r)
    }

    fn check_channels(&self, left: usize, right: usize) -> EncodeResult<()> {
        if self.cfg.channels_in == 2 && left != right && right != 0 {
            return Err(EncodeError::ChannelLengthMismatch { left, right });
        }
        Ok(())
    }

    /// Buffer samples (already in the internal domain) and encode every
    /// complete frame they make available.
    fn feed(&mut self, left: &[f32], right: &[f32]) -> EncodeResult<Vec<u8>> {
        self.samples.append(&self.cfg, left, right);
        self.mf_samples_to_encode += left.len() as i64;

        let mut out = Vec::new();
        while self.samples.len() >= self.mf_needed {
            self.encode_frame();
            out.extend(self.bs.take_output());
            self.samples.shift(self.cfg.framesize);
            self.mf_samples_to_encode -= self.cfg.framesize as i64;
        }
        Ok(out)
    }

    /// Push out everything still buffered. Pads the final granule with
    /// POSTDELAY zeros so its MDCT overlap completes, then fills the last
    /// frame's payload.
    pub fn flush(&mut self) -> EncodeResult<Vec<u8>> {
        let framesize = self.cfg.framesize;
        let zeros = vec![0.0f32; framesize];
        let mut out = Vec::new();
        let mut end_padding = POSTDELAY as i64;

        while self.mf_samples_to_encode > 0 {
            out.extend(self.feed(&zeros, &zeros)?);
            // the zeros fed here don't count as samples to encode
            self.mf_samples_to_encode -= framesize as i64;
        }
        // whatever the counter overshot is extra padding in the output
        end_padding += -self.mf_samples_to_encode;
        self.encoder_padding = end_padding as usize;

        self.bs.flush();
        out.extend(self.bs.take_output());
        Ok(out)
    }

    /// One frame: psychoacoustics per granule (delayed hand-off), MDCT
    /// with the decided block types, rate control + quantization, frame
    /// assembly.
    fn encode_frame(&mut self) {
        let cfg = self.cfg.clone();
        self.psy.adjust_ath(&cfg);
        let pc = pcfact(cfg.vbr, self.resv.resv_size, self.resv.resv_max);

        let mut side_info = SideInfo::default();
        let mut ms_ener_ratio = [0.0f32; MAX_GRANULES];

        for gr in 0..cfg.mode_gr {
            let offset = 576 + gr * 576 - FFTOFFSET;
            let left = &self.samples.channel(0)[offset..];
            let right = &self.samples.channel(1)[offset..];
            let block_types = self.psy.analyze(
                &cfg,
                [left, right],
                gr,
                &mut self.masking,
                &mut self.masking_ms,
                &mut self.pe,
                &mut self.pe_ms,
                pc,
            );
            for ch in 0..cfg.channels_out {
                side_info.gr[gr][ch].block_type = block_types[ch];
            }
            let e_mid = self.psy.tot_ener(2);
            let e_side = self.psy.tot_ener(3);
            ms_ener_ratio[gr] = if e_mid + e_side > 0.0 {
                e_side / (e_mid + e_side)
            } else {
                0.5
            };
        }

        for gr in 0..cfg.mode_gr {
            for ch in 0..cfg.channels_out {
                let granule = &self.samples.channel(ch)[gr * 576..(gr + 1) * 576];
                self.filterbank.process_granule(
                    ch,
                    granule,
                    side_info.gr[gr][ch].block_type,
                    &SFB_SHORT[cfg.samplerate_index],
                    &mut self.xr[gr][ch],
                );
            }
        }

        // joint stereo frames are coded mid/side; the psy model computed
        // both threshold sets, pick the matching one
        let (ratio, pe) = if cfg.is_ms() {
            (self.masking_ms, self.pe_ms)
        } else {
            (self.masking, self.pe)
        };

        let padding = if cfg.frac_slots_per_frame > 0.0 {
            self.slot_lag -= cfg.frac_slots_per_frame;
            if self.slot_lag < 0.0 {
                self.slot_lag += 1.0;
                true
            } else {
                false
            }
        } else {
            false
        };

        let mut st = FrameState {
            cfg: &cfg,
            xr: &mut self.xr,
            ratio,
            pe,
            ms_ener_ratio,
            l3_enc: &mut self.l3_enc,
            scalefac: &mut self.scalefac,
            side_info: &mut side_info,
            resv: &mut self.resv,
            ath_l: &self.ath_l,
            ath_s: &self.ath_s,
            sfb_l: &SFB_LONG[cfg.samplerate_index],
            sfb_s: &SFB_SHORT[cfg.samplerate_index],
            padding,
            bitrate_index: cfg.bitrate_index,
        };
        match cfg.vbr {
            VbrMode::Off => self.quant.cbr_iteration_loop(&mut st),
            VbrMode::Abr => self.quant.abr_iteration_loop(&mut st),
            VbrMode::Rh | VbrMode::Mtrh => self.quant.vbr_iteration_loop(&mut st),
        }
        let bitrate_index = st.bitrate_index;

        self.bs.format_frame(
            &cfg,
            bitrate_index,
            padding,
            &side_info,
            &self.scalefac,
            &self.l3_enc,
        );
        self.frame_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_reports_delay_before_any_input() {
        let enc = Encoder::new(&Config::default()).unwrap();
        assert_eq!(enc.encoder_delay(), 576);
    }

    #[test]
    fn short_input_emits_nothing_until_flush() {
        let mut enc = Encoder::new(&Config::default()).unwrap();
        let out = enc.encode_buffer_i16(&[0i16; 100], &[0i16; 100]).unwrap();
        assert!(out.is_empty());
        let tail = enc.flush().unwrap();
        assert!(!tail.is_empty());
        assert_eq!(tail[0], 0xff);
    }

    #[test]
    fn mismatched_channel_lengths_are_rejected() {
        let mut enc = Encoder::new(&Config::default()).unwrap();
        let err = enc.encode_buffer_i16(&[0i16; 10], &[0i16; 5]);
        assert!(matches!(
            err,
            Err(EncodeError::ChannelLengthMismatch { left: 10, right: 5 })
        ));
    }

    #[test]
    fn ragged_interleaved_buffer_is_rejected() {
        let mut enc = Encoder::new(&Config::default()).unwrap();
        assert!(matches!(
            enc.encode_buffer_interleaved_i16(&[0i16; 7]),
            Err(EncodeError::RaggedInterleavedBuffer(7))
        ));
    }

    #[test]
    fn padding_stays_within_one_frame_plus_postdelay() {
        let mut enc = Encoder::new(&Config::default()).unwrap();
        enc.encode_buffer_i16(&[0i16; 4000], &[0i16; 4000]).unwrap();
        enc.flush().unwrap();
        let pad = enc.encoder_padding();
        assert!(pad >= POSTDELAY);
        assert!(pad < POSTDELAY + 1152);
    }
}

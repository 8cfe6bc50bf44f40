//! Error types for the encoder
//!
//! All failure paths are explicit `Result` values. Configuration errors are
//! fatal at session creation, encoding errors are fatal for the call that
//! raised them; internal clamps (scalefactor overflow, reservoir stuffing)
//! are absorbed and logged, never surfaced.

use thiserror::Error;

/// Configuration validation errors, reported by [`crate::Encoder::new`]
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Sample rate outside the nine MPEG-1/2/2.5 rates
    #[error("unsupported sample rate: {0} Hz")]
    UnsupportedSampleRate(u32),

    /// Bitrate not present in the table for the resolved MPEG version
    #[error("unsupported bitrate for {sample_rate} Hz: {bitrate} kbps")]
    UnsupportedBitrate { bitrate: u32, sample_rate: u32 },

    /// Channel count other than 1 or 2
    #[error("unsupported channel count: {0}")]
    InvalidChannels(u8),

    /// Stereo mode incompatible with the channel count
    #[error("invalid stereo mode {mode} for {channels} channel(s)")]
    InvalidStereoMode { mode: &'static str, channels: u8 },

    /// Free format cannot be combined with VBR
    #[error("free format bitstreams require CBR")]
    FreeFormatWithVbr,

    /// VBR bitrate bounds are inverted or out of table range
    #[error("invalid VBR bitrate range: min {min} kbps, max {max} kbps")]
    InvalidVbrRange { min: u32, max: u32 },
}

/// Errors raised while feeding samples or flushing
#[derive(Debug, Error)]
pub enum EncodeError {
    /// Left/right slices of unequal length for a stereo session
    #[error("channel buffers differ in length: left {left}, right {right}")]
    ChannelLengthMismatch { left: usize, right: usize },

    /// Interleaved buffer length is not a multiple of the channel count
    #[error("interleaved buffer length {0} is not a whole number of frames")]
    RaggedInterleavedBuffer(usize),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
pub type EncodeResult<T> = std::result::Result<T, EncodeError>;

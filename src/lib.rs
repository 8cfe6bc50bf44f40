//! # luster-mp3
//!
//! A perceptual MPEG-1/2/2.5 Layer III audio encoder in pure Rust.
//!
//! The encoder couples a psychoacoustic model (spreading-function masking,
//! pre-echo control, long/short block switching with one granule of
//! lookahead) to a noise-shaping quantization loop that fits the masked
//! spectrum into a bit budget managed by the Layer III bit reservoir.
//! Constant, average and variable bitrate policies are supported.
//!
//! ```no_run
//! use luster_mp3::{Config, Encoder};
//!
//! let mut encoder = Encoder::new(&Config {
//!     in_samplerate: 44100,
//!     bitrate: 128,
//!     ..Default::default()
//! })?;
//!
//! let left = vec![0i16; 44100];
//! let right = vec![0i16; 44100];
//! let mut mp3 = encoder.encode_buffer_i16(&left, &right)?;
//! mp3.extend(encoder.flush()?);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod bitcount;
pub mod bitstream;
pub mod config;
pub mod encoder;
pub mod error;
pub mod fft;
pub mod huffman;
pub mod mdct;
pub mod pcm;
pub mod psymodel;
pub mod quantize;
pub mod reservoir;
pub mod tables;
pub mod types;

pub use config::{Config, Emphasis, Mode, SessionConfig, ShortBlocks, VbrMode, Version};
pub use encoder::Encoder;
pub use error::{ConfigError, EncodeError};
pub use types::BlockType;

//! # Audio Module
//!
//! Everything between "the caller has a file" and "there is a mono sample buffer
//! ready to send". Has no dependency on the controller connection and can be
//! used and tested on its own.
//!
//! ## Audio Format Requirements:
//! - **Channels**: Mono (1 channel), multi-channel files are rejected
//! - **Sample Rate**: 8kHz (8,000 Hz), assumed, not enforced
//! - **Sample Format**: 32-bit float in [-1.0, 1.0]
//! - **Input Size**: at most 5,000,000 bytes by default

pub mod buffer;   // PcmBuffer and SourceBlob
pub mod decoder;  // Validating decoder and the decode backend seam

pub use buffer::{PcmBuffer, SourceBlob};
pub use decoder::{AudioDecoder, DecodeBackend, DecodedAudio, SymphoniaBackend};

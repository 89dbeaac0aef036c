//! # Signal Buffers
//!
//! The two values that move through the pipeline:
//! - **SourceBlob**: a candidate signal file as handed over by the caller (name + bytes)
//! - **PcmBuffer**: the decoded mono samples, ready to go over the wire
//!
//! ## Wire Format:
//! A `PcmBuffer` becomes a single binary frame of raw little-endian f32 samples.
//! There is no header, length prefix or checksum. The controller infers the
//! sample count from the frame length (4 bytes per sample) and assumes the fixed
//! sample rate. A rate mismatch between the two ends cannot be detected here.

use crate::error::{AppError, AppResult};
use byteorder::{ByteOrder, LittleEndian};
use std::path::Path;
use std::sync::Arc;

/// Bytes per sample on the wire (f32).
pub const BYTES_PER_SAMPLE: usize = 4;

/// Immutable single-channel PCM samples at a fixed sample rate.
///
/// ## Ownership:
/// The buffer is moved, not shared: the decoder produces it, the caller hands it
/// to `DeviceLink::send_pcm` by value, and it is consumed there.
#[derive(Debug, Clone, PartialEq)]
pub struct PcmBuffer {
    samples: Box<[f32]>,
    sample_rate: u32,
}

impl PcmBuffer {
    /// Wrap decoded samples. Samples are kept exactly as given.
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples: samples.into_boxed_slice(),
            sample_rate,
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<f32> {
        self.samples.into_vec()
    }

    /// Number of samples (one per frame, the buffer is mono).
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Sample rate the buffer is declared at.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Duration implied by the sample count at the declared rate.
    ///
    /// ## Calculation:
    /// Duration = number_of_samples / sample_rate
    pub fn duration_seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Raw little-endian f32 bytes, exactly `len() * 4` long.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; self.samples.len() * BYTES_PER_SAMPLE];
        LittleEndian::write_f32_into(&self.samples, &mut bytes);
        bytes
    }
}

/// A candidate signal file: opaque bytes plus the name it was supplied under.
///
/// The bytes sit behind an `Arc` so decoding can move a handle onto a blocking
/// worker without copying the file. The blob itself is never mutated.
#[derive(Debug, Clone)]
pub struct SourceBlob {
    name: String,
    bytes: Arc<[u8]>,
    mime_type: Option<String>,
}

impl SourceBlob {
    pub fn new(name: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
            mime_type: None,
        }
    }

    /// Attach a MIME type hint. The hint is informational and never enforced:
    /// the decoder decides whether the bytes are usable.
    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    /// Read a signal file from disk, refusing files over `max_bytes`.
    ///
    /// The size comes from the file metadata, so an oversized file fails with
    /// `OversizeInput` before any of it is read. The file name becomes the blob
    /// name and the MIME hint is guessed from the extension.
    pub async fn from_path(path: impl AsRef<Path>, max_bytes: u64) -> AppResult<Self> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let read_failure = |e: std::io::Error| AppError::DecodeFailure {
            source_name: name.clone(),
            cause: e.to_string(),
        };

        let size = tokio::fs::metadata(path).await.map_err(read_failure)?.len();
        if size > max_bytes {
            return Err(AppError::OversizeInput {
                source_name: name,
                size,
                limit: max_bytes,
            });
        }

        let bytes = tokio::fs::read(path).await.map_err(read_failure)?;
        let mut blob = Self::new(name, bytes);
        if let Some(mime) = guess_mime_type(path) {
            blob = blob.with_mime_type(mime);
        }
        Ok(blob)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Cheap handle to the shared bytes.
    pub fn shared_bytes(&self) -> Arc<[u8]> {
        Arc::clone(&self.bytes)
    }

    pub fn byte_length(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn mime_type(&self) -> Option<&str> {
        self.mime_type.as_deref()
    }
}

fn guess_mime_type(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "wav" | "wave" => Some("audio/wav"),
        "mp3" => Some("audio/mpeg"),
        "ogg" => Some("audio/ogg"),
        "flac" => Some("audio/flac"),
        _ => None,
    }
}

//! # Signal Decoding and Validation
//!
//! Turns a signal file into a validated mono `PcmBuffer`, or fails with an error
//! that names the file and the cause.
//!
//! ## Validation Order:
//! 1. **Size**: blobs over the soft cap fail with `OversizeInput` before any decoding
//! 2. **Decode**: the backend interprets the container; any failure becomes `DecodeFailure`
//! 3. **Channels**: anything but exactly one channel fails with `ChannelCountMismatch`
//!
//! Samples are returned as decoded. There is no resampling, normalization,
//! clipping or down-mixing. The source sample rate is not enforced either: a file
//! at another rate is accepted and only logged.

use crate::audio::buffer::{PcmBuffer, SourceBlob};
use crate::config::AudioConfig;
use crate::error::{AppError, AppResult};
use std::io::Cursor;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use symphonia::core::audio::{AudioBuffer, AudioBufferRef, Signal};
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::conv::FromSample;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::sample::Sample;
use tracing::{debug, warn};

/// Process-wide decoder, built on first use and never torn down.
static SHARED_DECODER: OnceLock<AudioDecoder> = OnceLock::new();

/// Audio as it comes out of a decode backend, before channel validation.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    /// Sample rate declared by the source
    pub sample_rate: u32,
    /// One vector of samples per channel
    pub channels: Vec<Vec<f32>>,
}

impl DecodedAudio {
    pub fn number_of_channels(&self) -> usize {
        self.channels.len()
    }
}

/// The facility that interprets container/codec bytes into per-channel samples.
///
/// Backends are shared read-only between concurrent decodes, so they must not
/// keep per-call state.
pub trait DecodeBackend: Send + Sync {
    /// Decode a whole file. The error string is the human-readable cause.
    fn decode(&self, source: &SourceBlob) -> Result<DecodedAudio, String>;
}

/// Container/codec backend built on symphonia.
///
/// The format is detected from the bytes; the blob's file extension and MIME
/// type are passed along as hints only. Every channel is kept separately and
/// converted to f32 with symphonia's sample conversion, so a mono source comes
/// out sample-for-sample.
///
/// ## Supported Formats:
/// - WAV: PCM, IEEE float, A-law/mu-law, including `WAVE_FORMAT_EXTENSIBLE`
/// - FLAC, MP3, AAC/MP4, Ogg Vorbis
#[derive(Debug, Default, Clone, Copy)]
pub struct SymphoniaBackend;

impl DecodeBackend for SymphoniaBackend {
    fn decode(&self, source: &SourceBlob) -> Result<DecodedAudio, String> {
        let mss = MediaSourceStream::new(
            Box::new(Cursor::new(source.shared_bytes())),
            Default::default(),
        );

        let mut hint = Hint::new();
        if let Some(ext) = Path::new(source.name()).extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }
        if let Some(mime) = source.mime_type() {
            hint.mime_type(mime);
        }

        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
            .map_err(|e| format!("Unsupported or corrupt audio container: {}", e))?;
        let mut format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| "No audio track found".to_string())?;
        let track_id = track.id;

        let sample_rate = track
            .codec_params
            .sample_rate
            .ok_or_else(|| "Sample rate not found".to_string())?;

        let mut channels: Vec<Vec<f32>> = match track.codec_params.channels {
            Some(layout) => vec![Vec::new(); layout.count()],
            None => Vec::new(),
        };

        let mut decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| format!("Failed to create decoder: {}", e))?;

        loop {
            let packet = match format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    break;
                }
                Err(e) => return Err(format!("Failed to read packet: {}", e)),
            };

            if packet.track_id() != track_id {
                continue;
            }

            let decoded = decoder
                .decode(&packet)
                .map_err(|e| format!("Failed to decode packet: {}", e))?;
            append_planes(&decoded, &mut channels)?;
        }

        if channels.is_empty() {
            return Err("Audio stream declares zero channels".to_string());
        }

        Ok(DecodedAudio {
            sample_rate,
            channels,
        })
    }
}

/// Append one decoded packet to the per-channel output, converting to f32.
fn append_planes(
    decoded: &AudioBufferRef<'_>,
    channels: &mut Vec<Vec<f32>>,
) -> Result<(), String> {
    match decoded {
        AudioBufferRef::U8(buf) => append_buffer(&**buf, channels),
        AudioBufferRef::U16(buf) => append_buffer(&**buf, channels),
        AudioBufferRef::U24(buf) => append_buffer(&**buf, channels),
        AudioBufferRef::U32(buf) => append_buffer(&**buf, channels),
        AudioBufferRef::S8(buf) => append_buffer(&**buf, channels),
        AudioBufferRef::S16(buf) => append_buffer(&**buf, channels),
        AudioBufferRef::S24(buf) => append_buffer(&**buf, channels),
        AudioBufferRef::S32(buf) => append_buffer(&**buf, channels),
        AudioBufferRef::F32(buf) => append_buffer(&**buf, channels),
        AudioBufferRef::F64(buf) => append_buffer(&**buf, channels),
    }
}

fn append_buffer<S>(buf: &AudioBuffer<S>, channels: &mut Vec<Vec<f32>>) -> Result<(), String>
where
    S: Sample,
    f32: FromSample<S>,
{
    let count = buf.spec().channels.count();
    if channels.is_empty() {
        channels.resize_with(count, Vec::new);
    }
    if count != channels.len() {
        return Err(format!(
            "Channel count changed mid-stream ({} -> {})",
            channels.len(),
            count
        ));
    }

    for (ch, out) in channels.iter_mut().enumerate() {
        out.extend(buf.chan(ch).iter().map(|&s| f32::from_sample(s)));
    }
    Ok(())
}

/// Validating decoder for signal files.
///
/// ## Thread Safety:
/// The backend sits behind an `Arc` and is only ever read, so any number of
/// `decode` calls can be in flight at once without affecting each other.
#[derive(Clone)]
pub struct AudioDecoder {
    backend: Arc<dyn DecodeBackend>,
    config: AudioConfig,
}

impl std::fmt::Debug for AudioDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioDecoder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl AudioDecoder {
    pub fn new(config: AudioConfig, backend: Arc<dyn DecodeBackend>) -> Self {
        Self { backend, config }
    }

    /// Decoder backed by symphonia.
    pub fn symphonia(config: AudioConfig) -> Self {
        Self::new(config, Arc::new(SymphoniaBackend))
    }

    /// The process-wide decoder, created with default settings on first use.
    pub fn shared() -> &'static AudioDecoder {
        SHARED_DECODER.get_or_init(|| AudioDecoder::symphonia(AudioConfig::default()))
    }

    /// Initialize the process-wide decoder with `config`.
    ///
    /// Only the first initialization takes effect; later calls return the existing decoder.
    pub fn init_shared(config: AudioConfig) -> &'static AudioDecoder {
        SHARED_DECODER.get_or_init(|| AudioDecoder::symphonia(config))
    }

    pub fn config(&self) -> &AudioConfig {
        &self.config
    }

    /// Decode `blob` into a mono `PcmBuffer`.
    ///
    /// ## Errors:
    /// - `OversizeInput` when the blob is over `max_input_bytes` (the backend is not called)
    /// - `DecodeFailure` when the backend rejects the bytes
    /// - `ChannelCountMismatch` when the decoded audio is not mono
    pub async fn decode(&self, blob: &SourceBlob) -> AppResult<PcmBuffer> {
        let size = blob.byte_length();
        if size > self.config.max_input_bytes {
            return Err(AppError::OversizeInput {
                source_name: blob.name().to_string(),
                size,
                limit: self.config.max_input_bytes,
            });
        }

        if let Some(mime) = blob.mime_type() {
            debug!("Decoding '{}' ({} bytes, declared {})", blob.name(), size, mime);
        }

        let backend = Arc::clone(&self.backend);
        let source = blob.clone();
        let decoded = tokio::task::spawn_blocking(move || backend.decode(&source))
            .await
            .map_err(|e| AppError::Internal(format!("decode task failed: {}", e)))?
            .map_err(|cause| AppError::DecodeFailure {
                source_name: blob.name().to_string(),
                cause,
            })?;

        if decoded.number_of_channels() != 1 {
            return Err(AppError::ChannelCountMismatch {
                source_name: blob.name().to_string(),
                observed: decoded.number_of_channels() as u16,
            });
        }

        if decoded.sample_rate != self.config.sample_rate {
            warn!(
                "'{}' declares {} Hz but the controller assumes {} Hz; sending unchanged",
                blob.name(),
                decoded.sample_rate,
                self.config.sample_rate
            );
        }

        let samples = decoded.channels.into_iter().next().unwrap_or_default();
        Ok(PcmBuffer::new(samples, self.config.sample_rate))
    }
}

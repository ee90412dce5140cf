#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(unsafe_code)]

//! Built-in transcoders for the switchboard call engine
//!
//! # Implementation Status
//!
//! ## G.711 (Audio)
//! - Full ITU-T G.711 μ-law and A-law companding between PCM-16 and
//!   PCMU/PCMA
//! - Decoders accept comfort noise and emit silence for it
//!
//! ## H.264 / VP8 (Video)
//! - **Simulation**: run-length coding of YUV420P frames, with key frames
//!   and XOR delta frames against the previous picture
//! - Encoded frames are split into packets no larger than the configured
//!   maximum output size, the last packet carrying the marker bit
//! - Decoders that lose their reference picture ask upstream for a key
//!   frame through the command notifier
//!
//! Call [`register_builtin`] to make every pair available to a
//! [`TranscoderRegistry`].

pub mod g711;
pub mod video;

use switchboard_core::format::well_known;
use switchboard_core::{MediaFormat, TranscoderError, TranscoderRegistry};

/// Codec error types
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Frame size mismatch: expected {expected} bytes, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("Invalid codec data: {0}")]
    InvalidData(&'static str),
    #[error("Numeric overflow in codec operation")]
    Overflow,
    #[error("Invalid dimensions: width={0}, height={1}")]
    InvalidDimensions(u32, u32),
    #[error("Data size exceeds maximum allowed: {actual} > {max}")]
    SizeExceeded { actual: usize, max: usize },
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
}

impl From<CodecError> for TranscoderError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::InvalidDimensions(..) | CodecError::UnsupportedFormat(_) => {
                TranscoderError::InvalidConfig(err.to_string())
            }
            other => TranscoderError::Conversion(other.to_string()),
        }
    }
}

/// Codec result type
pub type Result<T> = std::result::Result<T, CodecError>;

/// Maximum allowed dimensions for safety
pub const MAX_WIDTH: u32 = 8192;
pub const MAX_HEIGHT: u32 = 8192;
pub const MAX_FRAME_SIZE: usize = 100 * 1024 * 1024; // 100MB

pub use g711::{Law, G711Decoder, G711Encoder};
pub use video::{VideoCodec, VideoDecoder, VideoEncoder};

fn known(name: &str) -> Result<MediaFormat> {
    well_known::get(name).ok_or_else(|| CodecError::UnsupportedFormat(name.to_string()))
}

/// Register every built-in transcoder pair with `registry`
///
/// # Errors
///
/// Returns error if a built-in format is missing from the well-known table
pub fn register_builtin(registry: &mut TranscoderRegistry) -> Result<()> {
    let pcm = known(well_known::PCM16)?;

    for law in [Law::Mu, Law::A] {
        let companded = known(law.format_name())?;
        registry.register(pcm.clone(), companded.clone(), move |input, output| {
            Ok(Box::new(G711Encoder::new(law, input.clone(), output.clone())?))
        });
        registry.register(companded, pcm.clone(), move |input, output| {
            Ok(Box::new(G711Decoder::new(law, input.clone(), output.clone())?))
        });
    }

    let raw = known(well_known::YUV420P)?;
    for codec in [VideoCodec::H264, VideoCodec::Vp8] {
        let coded = known(codec.format_name())?;
        registry.register(raw.clone(), coded.clone(), move |input, output| {
            Ok(Box::new(VideoEncoder::new(codec, input.clone(), output.clone())?))
        });
        registry.register(coded, raw.clone(), move |input, output| {
            Ok(Box::new(VideoDecoder::new(codec, input.clone(), output.clone())?))
        });
    }

    tracing::debug!(pairs = registry.pairs().len(), "Registered built-in transcoders");
    Ok(())
}

/// A registry holding only the built-in transcoders
///
/// # Errors
///
/// Returns error if a built-in format is missing from the well-known table
pub fn builtin_registry() -> Result<TranscoderRegistry> {
    let mut registry = TranscoderRegistry::new();
    register_builtin(&mut registry)?;
    Ok(registry)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_pairs() {
        let registry = builtin_registry().unwrap();
        let pairs = registry.pairs();
        assert_eq!(pairs.len(), 8);
        assert!(pairs.contains(&("PCM-16".to_string(), "PCMU".to_string())));
        assert!(pairs.contains(&("VP8".to_string(), "YUV420P".to_string())));
    }

    #[test]
    fn test_error_mapping() {
        let err: TranscoderError = CodecError::InvalidDimensions(0, 0).into();
        assert!(matches!(err, TranscoderError::InvalidConfig(_)));
        let err: TranscoderError = CodecError::InvalidData("truncated").into();
        assert!(matches!(err, TranscoderError::Conversion(_)));
    }
}

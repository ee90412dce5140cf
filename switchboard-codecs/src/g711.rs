//! G.711 μ-law and A-law companding
//!
//! PCM-16 payloads are little-endian signed 16-bit samples. Each sample
//! compands to one byte, so a 20 ms PCMU packet of 160 bytes carries
//! 320 bytes of linear audio.

use crate::{CodecError, Result};
use switchboard_core::format::{well_known, PAYLOAD_TYPE_CN};
use switchboard_core::transcoder::{merge_format, packet_size};
use switchboard_core::{MediaFormat, MediaFrame, Transcoder, TranscoderError};

const ULAW_BIAS: i32 = 0x84;
const ULAW_CLIP: i32 = 32635;
const ALAW_SEGMENT_END: [i32; 8] = [0x1F, 0x3F, 0x7F, 0xFF, 0x1FF, 0x3FF, 0x7FF, 0xFFF];

/// Companding law
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Law {
    /// μ-law (PCMU)
    Mu,
    /// A-law (PCMA)
    A,
}

impl Law {
    /// Name of the companded format
    pub fn format_name(self) -> &'static str {
        match self {
            Self::Mu => well_known::PCMU,
            Self::A => well_known::PCMA,
        }
    }

    /// Compand one linear sample
    pub fn encode(self, sample: i16) -> u8 {
        match self {
            Self::Mu => linear_to_ulaw(sample),
            Self::A => linear_to_alaw(sample),
        }
    }

    /// Expand one companded byte
    pub fn decode(self, value: u8) -> i16 {
        match self {
            Self::Mu => ulaw_to_linear(value),
            Self::A => alaw_to_linear(value),
        }
    }
}

/// μ-law compression of one sample
pub fn linear_to_ulaw(sample: i16) -> u8 {
    let mut pcm = i32::from(sample);
    let sign = if pcm < 0 {
        pcm = -pcm;
        0x80
    } else {
        0
    };
    pcm = pcm.min(ULAW_CLIP) + ULAW_BIAS;

    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && pcm & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (pcm >> (exponent + 3)) & 0x0F;
    !((sign | (exponent << 4) | mantissa) as u8)
}

/// μ-law expansion of one byte
pub fn ulaw_to_linear(value: u8) -> i16 {
    let value = !value;
    let exponent = i32::from((value >> 4) & 0x07);
    let mantissa = i32::from(value & 0x0F);
    let magnitude = (((mantissa << 3) + ULAW_BIAS) << exponent) - ULAW_BIAS;
    if value & 0x80 != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

/// A-law compression of one sample
pub fn linear_to_alaw(sample: i16) -> u8 {
    let mut pcm = i32::from(sample) >> 3;
    let mask = if pcm >= 0 {
        0xD5
    } else {
        pcm = -pcm - 1;
        0x55
    };

    let Some(segment) = ALAW_SEGMENT_END.iter().position(|&end| pcm <= end) else {
        return 0x7F ^ mask;
    };
    let shift = if segment < 2 { 1 } else { segment };
    let value = ((segment as i32) << 4) | ((pcm >> shift) & 0x0F);
    (value as u8) ^ mask
}

/// A-law expansion of one byte
pub fn alaw_to_linear(value: u8) -> i16 {
    let value = value ^ 0x55;
    let mut magnitude = i32::from(value & 0x0F) << 4;
    let segment = (value & 0x70) >> 4;
    match segment {
        0 => magnitude += 8,
        1 => magnitude += 0x108,
        _ => {
            magnitude += 0x108;
            magnitude <<= segment - 1;
        }
    }
    if value & 0x80 != 0 {
        magnitude as i16
    } else {
        -magnitude as i16
    }
}

fn check_pair(law: Law, linear: &MediaFormat, companded: &MediaFormat) -> Result<()> {
    if !linear.is_named(well_known::PCM16) {
        return Err(CodecError::UnsupportedFormat(linear.name().to_string()));
    }
    if !companded.is_named(law.format_name()) {
        return Err(CodecError::UnsupportedFormat(companded.name().to_string()));
    }
    Ok(())
}

fn update_pair(
    input: &mut MediaFormat,
    output: &mut MediaFormat,
    new_input: &MediaFormat,
    new_output: &MediaFormat,
) -> bool {
    if !input.is_same(new_input) || !output.is_same(new_output) {
        return false;
    }
    merge_format(input, new_input);
    merge_format(output, new_output);
    true
}

/// PCM-16 to PCMU/PCMA
#[derive(Debug)]
pub struct G711Encoder {
    law: Law,
    input: MediaFormat,
    output: MediaFormat,
}

impl G711Encoder {
    /// Create an encoder from PCM-16 `input` to the companded `output`
    ///
    /// # Errors
    ///
    /// Returns error if either format is not the one `law` handles
    pub fn new(law: Law, input: MediaFormat, output: MediaFormat) -> Result<Self> {
        check_pair(law, &input, &output)?;
        Ok(Self { law, input, output })
    }

    /// Compand a buffer of little-endian PCM-16 samples
    ///
    /// # Errors
    ///
    /// Returns error if the buffer holds an odd number of bytes
    pub fn encode(&self, pcm: &[u8]) -> Result<Vec<u8>> {
        if pcm.len() % 2 != 0 {
            return Err(CodecError::InvalidData("odd PCM-16 payload length"));
        }
        Ok(pcm
            .chunks_exact(2)
            .map(|pair| self.law.encode(i16::from_le_bytes([pair[0], pair[1]])))
            .collect())
    }
}

impl Transcoder for G711Encoder {
    fn input_format(&self) -> &MediaFormat {
        &self.input
    }

    fn output_format(&self) -> &MediaFormat {
        &self.output
    }

    fn convert(&mut self, input: &MediaFrame) -> std::result::Result<Vec<MediaFrame>, TranscoderError> {
        let payload = self.encode(&input.payload)?;
        let frame = MediaFrame::new(self.output.payload_type(), input.timestamp, payload)
            .with_sequence(input.sequence)
            .with_marker(input.marker);
        Ok(vec![frame])
    }

    fn optimal_data_frame_size(&self, input: bool) -> usize {
        let samples = packet_size(&self.output);
        if input {
            samples * 2
        } else {
            samples
        }
    }

    fn update_media_formats(&mut self, input: &MediaFormat, output: &MediaFormat) -> bool {
        update_pair(&mut self.input, &mut self.output, input, output)
    }
}

/// PCMU/PCMA to PCM-16
#[derive(Debug)]
pub struct G711Decoder {
    law: Law,
    input: MediaFormat,
    output: MediaFormat,
}

impl G711Decoder {
    /// Create a decoder from the companded `input` to PCM-16 `output`
    ///
    /// # Errors
    ///
    /// Returns error if either format is not the one `law` handles
    pub fn new(law: Law, input: MediaFormat, output: MediaFormat) -> Result<Self> {
        check_pair(law, &output, &input)?;
        Ok(Self { law, input, output })
    }

    /// Expand companded bytes to little-endian PCM-16
    pub fn decode(&self, data: &[u8]) -> Vec<u8> {
        data.iter()
            .flat_map(|&value| self.law.decode(value).to_le_bytes())
            .collect()
    }
}

impl Transcoder for G711Decoder {
    fn input_format(&self) -> &MediaFormat {
        &self.input
    }

    fn output_format(&self) -> &MediaFormat {
        &self.output
    }

    fn convert(&mut self, input: &MediaFrame) -> std::result::Result<Vec<MediaFrame>, TranscoderError> {
        let payload = if input.payload_type == PAYLOAD_TYPE_CN {
            // Silence for one packet
            vec![0u8; packet_size(&self.input) * 2]
        } else {
            self.decode(&input.payload)
        };
        let frame = MediaFrame::new(self.output.payload_type(), input.timestamp, payload)
            .with_sequence(input.sequence)
            .with_marker(input.marker);
        Ok(vec![frame])
    }

    fn optimal_data_frame_size(&self, input: bool) -> usize {
        let samples = packet_size(&self.input);
        if input {
            samples
        } else {
            samples * 2
        }
    }

    fn accept_comfort_noise(&self) -> bool {
        true
    }

    fn update_media_formats(&mut self, input: &MediaFormat, output: &MediaFormat) -> bool {
        update_pair(&mut self.input, &mut self.output, input, output)
    }
}

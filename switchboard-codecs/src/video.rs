//! Simulated H.264 and VP8 video codecs
//!
//! Encoded frames are run-length coded YUV420P pictures. Key frames code the
//! picture itself; delta frames code the XOR against the previous picture, so
//! a static scene compresses to almost nothing. Each encoded frame travels as
//! one or more packets:
//!
//! ```text
//! [codec tag][flags] [width u16][height u16]   first packet only
//! [run length][value] ...                      body, split across packets
//! ```

use crate::{CodecError, Result, MAX_FRAME_SIZE, MAX_HEIGHT, MAX_WIDTH};
use bytes::{BufMut, Bytes, BytesMut};
use switchboard_core::format::{options, well_known};
use switchboard_core::transcoder::{merge_format, CommandNotifier};
use switchboard_core::{MediaCommand, MediaFormat, MediaFrame, Transcoder, TranscoderError};

const FLAG_KEY: u8 = 0x01;
const FLAG_START: u8 = 0x02;
const START_HEADER_LEN: usize = 6;
const CONTINUATION_HEADER_LEN: usize = 2;
const DEFAULT_WIDTH: u32 = 352;
const DEFAULT_HEIGHT: u32 = 288;
const DEFAULT_MAX_OUTPUT: usize = 1400;
const MIN_OUTPUT: usize = 16;

/// Key frame every this many frames unless one is requested earlier
pub const KEY_FRAME_INTERVAL: u32 = 30;

/// Video codec selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    H264,
    Vp8,
}

impl VideoCodec {
    /// Name of the encoded format
    pub fn format_name(self) -> &'static str {
        match self {
            Self::H264 => well_known::H264,
            Self::Vp8 => well_known::VP8,
        }
    }

    fn tag(self) -> u8 {
        match self {
            Self::H264 => b'H',
            Self::Vp8 => b'V',
        }
    }
}

/// Bytes in one YUV420P picture
pub fn yuv420p_size(width: u32, height: u32) -> Result<usize> {
    if width == 0 || height == 0 || width > MAX_WIDTH || height > MAX_HEIGHT {
        return Err(CodecError::InvalidDimensions(width, height));
    }
    let pixels = (width as usize)
        .checked_mul(height as usize)
        .ok_or(CodecError::Overflow)?;
    let size = pixels
        .checked_mul(3)
        .map(|n| n / 2)
        .ok_or(CodecError::Overflow)?;
    if size > MAX_FRAME_SIZE {
        return Err(CodecError::SizeExceeded {
            actual: size,
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(size)
}

fn dimensions(format: &MediaFormat) -> (u32, u32) {
    (
        format.option_u32(options::FRAME_WIDTH).unwrap_or(DEFAULT_WIDTH),
        format.option_u32(options::FRAME_HEIGHT).unwrap_or(DEFAULT_HEIGHT),
    )
}

/// Run-length encode as (count, value) pairs
pub fn rle_encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() / 4 + 2);
    let mut iter = data.iter().copied().peekable();
    while let Some(value) = iter.next() {
        let mut count: u8 = 1;
        while count < u8::MAX && iter.peek() == Some(&value) {
            iter.next();
            count += 1;
        }
        out.push(count);
        out.push(value);
    }
    out
}

/// Expand (count, value) pairs, refusing output beyond `limit`
pub fn rle_decode(data: &[u8], limit: usize) -> Result<Vec<u8>> {
    if data.len() % 2 != 0 {
        return Err(CodecError::InvalidData("truncated run"));
    }
    let mut out = Vec::with_capacity(limit);
    for pair in data.chunks_exact(2) {
        let (count, value) = (pair[0] as usize, pair[1]);
        if count == 0 {
            return Err(CodecError::InvalidData("zero-length run"));
        }
        if out.len() + count > limit {
            return Err(CodecError::SizeExceeded {
                actual: out.len() + count,
                max: limit,
            });
        }
        out.resize(out.len() + count, value);
    }
    Ok(out)
}

fn xor_in_place(data: &mut [u8], reference: &[u8]) {
    for (byte, prev) in data.iter_mut().zip(reference) {
        *byte ^= prev;
    }
}

/// YUV420P to H.264/VP8
pub struct VideoEncoder {
    codec: VideoCodec,
    input: MediaFormat,
    output: MediaFormat,
    width: u32,
    height: u32,
    frame_size: usize,
    max_output_size: usize,
    frames_since_key: u32,
    force_key: bool,
    reference: Option<Vec<u8>>,
    last_key: bool,
    target_bit_rate: Option<u32>,
}

impl std::fmt::Debug for VideoEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoEncoder")
            .field("codec", &self.codec)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("max_output_size", &self.max_output_size)
            .finish()
    }
}

impl VideoEncoder {
    /// Create an encoder from YUV420P `input` to `output`
    ///
    /// # Errors
    ///
    /// Returns error on mismatched formats or unusable frame dimensions
    pub fn new(codec: VideoCodec, input: MediaFormat, output: MediaFormat) -> Result<Self> {
        if !input.is_named(well_known::YUV420P) {
            return Err(CodecError::UnsupportedFormat(input.name().to_string()));
        }
        if !output.is_named(codec.format_name()) {
            return Err(CodecError::UnsupportedFormat(output.name().to_string()));
        }
        let (width, height) = dimensions(&input);
        let frame_size = yuv420p_size(width, height)?;
        Ok(Self {
            codec,
            input,
            output,
            width,
            height,
            frame_size,
            max_output_size: DEFAULT_MAX_OUTPUT,
            frames_since_key: 0,
            force_key: false,
            reference: None,
            last_key: false,
            target_bit_rate: None,
        })
    }

    /// Bit rate most recently requested through flow control
    pub fn target_bit_rate(&self) -> Option<u32> {
        self.target_bit_rate
    }

    /// Make the next frame a key frame
    pub fn request_key_frame(&mut self) {
        self.force_key = true;
    }

    /// Encode one picture into its packet bodies
    ///
    /// # Errors
    ///
    /// Returns error if `picture` is not exactly one frame
    pub fn encode(&mut self, picture: &[u8]) -> Result<Vec<Bytes>> {
        if picture.len() != self.frame_size {
            return Err(CodecError::DimensionMismatch {
                expected: self.frame_size,
                actual: picture.len(),
            });
        }

        let key = self.force_key
            || self.reference.is_none()
            || self.frames_since_key + 1 >= KEY_FRAME_INTERVAL;
        let mut data = picture.to_vec();
        if !key {
            if let Some(reference) = &self.reference {
                xor_in_place(&mut data, reference);
            }
        }
        let body = rle_encode(&data);

        self.reference = Some(picture.to_vec());
        self.force_key = false;
        self.last_key = key;
        self.frames_since_key = if key { 0 } else { self.frames_since_key + 1 };

        let mut packets = Vec::new();
        let mut remaining = body.as_slice();
        let mut first = true;
        loop {
            let header_len = if first {
                START_HEADER_LEN
            } else {
                CONTINUATION_HEADER_LEN
            };
            let room = self.max_output_size.saturating_sub(header_len).max(2) & !1;
            let take = room.min(remaining.len());
            let (chunk, rest) = remaining.split_at(take);

            let mut packet = BytesMut::with_capacity(header_len + chunk.len());
            packet.put_u8(self.codec.tag());
            let mut flags = if key { FLAG_KEY } else { 0 };
            if first {
                flags |= FLAG_START;
            }
            packet.put_u8(flags);
            if first {
                packet.put_u16(self.width as u16);
                packet.put_u16(self.height as u16);
            }
            packet.put_slice(chunk);
            packets.push(packet.freeze());

            remaining = rest;
            first = false;
            if remaining.is_empty() {
                break;
            }
        }

        tracing::trace!(
            codec = ?self.codec,
            key,
            packets = packets.len(),
            bytes = body.len(),
            "Encoded video frame"
        );
        Ok(packets)
    }
}

impl Transcoder for VideoEncoder {
    fn input_format(&self) -> &MediaFormat {
        &self.input
    }

    fn output_format(&self) -> &MediaFormat {
        &self.output
    }

    fn convert(&mut self, input: &MediaFrame) -> std::result::Result<Vec<MediaFrame>, TranscoderError> {
        let packets = self.encode(&input.payload)?;
        let last = packets.len().saturating_sub(1);
        Ok(packets
            .into_iter()
            .enumerate()
            .map(|(i, payload)| {
                MediaFrame::new(self.output.payload_type(), input.timestamp, payload)
                    .with_marker(i == last)
            })
            .collect())
    }

    fn optimal_data_frame_size(&self, input: bool) -> usize {
        if input {
            self.frame_size
        } else {
            self.max_output_size
        }
    }

    fn set_max_output_size(&mut self, size: usize) {
        self.max_output_size = size.max(MIN_OUTPUT);
    }

    fn update_media_formats(&mut self, input: &MediaFormat, output: &MediaFormat) -> bool {
        if !self.input.is_same(input) || !self.output.is_same(output) {
            return false;
        }
        merge_format(&mut self.input, input);
        merge_format(&mut self.output, output);

        let (width, height) = dimensions(&self.input);
        if (width, height) != (self.width, self.height) {
            match yuv420p_size(width, height) {
                Ok(size) => {
                    self.width = width;
                    self.height = height;
                    self.frame_size = size;
                    self.reference = None;
                }
                Err(e) => {
                    tracing::warn!(width, height, error = %e, "Ignoring frame size update");
                    return false;
                }
            }
        }
        true
    }

    fn execute_command(&mut self, command: &MediaCommand) -> bool {
        match command {
            MediaCommand::VideoUpdatePicture => {
                tracing::debug!(codec = ?self.codec, "Key frame requested");
                self.request_key_frame();
                true
            }
            MediaCommand::FlowControl { max_bit_rate } => {
                self.target_bit_rate = Some(*max_bit_rate);
                true
            }
            _ => false,
        }
    }

    fn was_last_frame_key(&self) -> bool {
        self.last_key
    }
}

/// H.264/VP8 to YUV420P
pub struct VideoDecoder {
    codec: VideoCodec,
    input: MediaFormat,
    output: MediaFormat,
    assembling: Option<(bool, usize, BytesMut)>,
    reference: Option<Vec<u8>>,
    last_key: bool,
    key_requested: bool,
    notifier: Option<CommandNotifier>,
}

impl std::fmt::Debug for VideoDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoDecoder")
            .field("codec", &self.codec)
            .field("has_reference", &self.reference.is_some())
            .field("key_requested", &self.key_requested)
            .finish()
    }
}

impl VideoDecoder {
    /// Create a decoder from `input` to YUV420P `output`
    ///
    /// # Errors
    ///
    /// Returns error on mismatched formats
    pub fn new(codec: VideoCodec, input: MediaFormat, output: MediaFormat) -> Result<Self> {
        if !input.is_named(codec.format_name()) {
            return Err(CodecError::UnsupportedFormat(input.name().to_string()));
        }
        if !output.is_named(well_known::YUV420P) {
            return Err(CodecError::UnsupportedFormat(output.name().to_string()));
        }
        Ok(Self {
            codec,
            input,
            output,
            assembling: None,
            reference: None,
            last_key: false,
            key_requested: false,
            notifier: None,
        })
    }

    fn request_key_frame(&mut self) {
        if self.key_requested {
            return;
        }
        self.key_requested = true;
        tracing::debug!(codec = ?self.codec, "Lost reference picture, requesting key frame");
        if let Some(notifier) = &self.notifier {
            notifier(&MediaCommand::VideoUpdatePicture);
        }
    }

    /// Feed one packet. Returns the picture once its last packet arrives.
    ///
    /// # Errors
    ///
    /// Returns error on malformed packets
    pub fn decode(&mut self, packet: &[u8], marker: bool) -> Result<Option<Vec<u8>>> {
        if packet.len() < CONTINUATION_HEADER_LEN {
            return Err(CodecError::InvalidData("packet shorter than header"));
        }
        if packet[0] != self.codec.tag() {
            return Err(CodecError::InvalidData("packet from another codec"));
        }
        let flags = packet[1];

        let body = if flags & FLAG_START != 0 {
            if packet.len() < START_HEADER_LEN {
                return Err(CodecError::InvalidData("truncated start header"));
            }
            let width = u32::from(u16::from_be_bytes([packet[2], packet[3]]));
            let height = u32::from(u16::from_be_bytes([packet[4], packet[5]]));
            let size = yuv420p_size(width, height)?;
            self.assembling = Some((flags & FLAG_KEY != 0, size, BytesMut::new()));
            &packet[START_HEADER_LEN..]
        } else {
            &packet[CONTINUATION_HEADER_LEN..]
        };

        if self.assembling.is_none() {
            // Start of this frame went missing
            self.request_key_frame();
            return Ok(None);
        }
        if let Some((_, _, buffer)) = self.assembling.as_mut() {
            buffer.put_slice(body);
        }

        if !marker {
            return Ok(None);
        }
        let Some((key, size, buffer)) = self.assembling.take() else {
            return Ok(None);
        };

        let mut picture = rle_decode(&buffer, size)?;
        if picture.len() != size {
            return Err(CodecError::DimensionMismatch {
                expected: size,
                actual: picture.len(),
            });
        }

        if !key {
            match &self.reference {
                Some(reference) if reference.len() == size => xor_in_place(&mut picture, reference),
                _ => {
                    self.request_key_frame();
                    return Ok(None);
                }
            }
        } else {
            self.key_requested = false;
        }

        self.last_key = key;
        self.reference = Some(picture.clone());
        Ok(Some(picture))
    }
}

impl Transcoder for VideoDecoder {
    fn input_format(&self) -> &MediaFormat {
        &self.input
    }

    fn output_format(&self) -> &MediaFormat {
        &self.output
    }

    fn convert(&mut self, input: &MediaFrame) -> std::result::Result<Vec<MediaFrame>, TranscoderError> {
        match self.decode(&input.payload, input.marker)? {
            Some(picture) => Ok(vec![MediaFrame::new(
                self.output.payload_type(),
                input.timestamp,
                picture,
            )
            .with_marker(true)]),
            None => Ok(Vec::new()),
        }
    }

    fn optimal_data_frame_size(&self, input: bool) -> usize {
        if input {
            DEFAULT_MAX_OUTPUT
        } else {
            let (width, height) = dimensions(&self.output);
            yuv420p_size(width, height).unwrap_or(0)
        }
    }

    fn update_media_formats(&mut self, input: &MediaFormat, output: &MediaFormat) -> bool {
        if !self.input.is_same(input) || !self.output.is_same(output) {
            return false;
        }
        merge_format(&mut self.input, input);
        merge_format(&mut self.output, output);
        true
    }

    fn set_command_notifier(&mut self, notifier: CommandNotifier) {
        self.notifier = Some(notifier);
    }

    fn was_last_frame_key(&self) -> bool {
        self.last_key
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn yuv(width: u32, height: u32) -> MediaFormat {
        well_known::get(well_known::YUV420P)
            .unwrap()
            .with_option(options::FRAME_WIDTH, width)
            .with_option(options::FRAME_HEIGHT, height)
    }

    fn h264() -> MediaFormat {
        well_known::get(well_known::H264).unwrap()
    }

    fn vp8() -> MediaFormat {
        well_known::get(well_known::VP8).unwrap()
    }

    fn picture(width: u32, height: u32, seed: u8) -> Vec<u8> {
        let size = yuv420p_size(width, height).unwrap();
        (0..size).map(|i| ((i / 7) as u8).wrapping_add(seed)).collect()
    }

    fn pair(width: u32, height: u32) -> (VideoEncoder, VideoDecoder) {
        let encoder = VideoEncoder::new(VideoCodec::H264, yuv(width, height), h264()).unwrap();
        let decoder = VideoDecoder::new(VideoCodec::H264, h264(), yuv(width, height)).unwrap();
        (encoder, decoder)
    }

    fn feed(decoder: &mut VideoDecoder, frames: &[MediaFrame]) -> Vec<MediaFrame> {
        frames
            .iter()
            .flat_map(|f| decoder.convert(f).unwrap())
            .collect()
    }

    #[test]
    fn test_rle() {
        assert_eq!(rle_encode(&[1, 1, 1, 2]), vec![3, 1, 1, 2]);
        assert_eq!(rle_encode(&[0; 300]), vec![255, 0, 45, 0]);
        assert_eq!(rle_decode(&[3, 1, 1, 2], 8).unwrap(), vec![1, 1, 1, 2]);
        assert!(rle_decode(&[3], 8).is_err());
        assert!(rle_decode(&[0, 1], 8).is_err());
        assert!(rle_decode(&[9, 1], 8).is_err());
    }

    #[test]
    fn test_invalid_dimensions() {
        assert!(yuv420p_size(0, 10).is_err());
        assert!(yuv420p_size(MAX_WIDTH + 1, 10).is_err());
        assert_eq!(yuv420p_size(16, 16).unwrap(), 384);
        assert!(VideoEncoder::new(VideoCodec::H264, yuv(0, 0), h264()).is_err());
        assert!(VideoEncoder::new(VideoCodec::Vp8, yuv(16, 16), h264()).is_err());
    }

    #[test]
    fn test_key_then_delta() {
        let (mut encoder, mut decoder) = pair(16, 16);
        let first = picture(16, 16, 0);
        let second = picture(16, 16, 1);

        let packets = encoder.convert(&MediaFrame::new(127, 0, first.clone())).unwrap();
        assert!(encoder.was_last_frame_key());
        assert!(packets.last().unwrap().marker);
        let out = feed(&mut decoder, &packets);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].payload.as_ref(), first.as_slice());
        assert!(decoder.was_last_frame_key());

        let packets = encoder.convert(&MediaFrame::new(127, 3000, second.clone())).unwrap();
        assert!(!encoder.was_last_frame_key());
        let out = feed(&mut decoder, &packets);
        assert_eq!(out[0].payload.as_ref(), second.as_slice());
        assert_eq!(out[0].timestamp, 3000);
        assert!(!decoder.was_last_frame_key());
    }

    #[test]
    fn test_static_scene_compresses() {
        let (mut encoder, _) = pair(64, 64);
        let still = picture(64, 64, 3);
        let key = encoder.encode(&still).unwrap();
        let delta = encoder.encode(&still).unwrap();
        let key_len: usize = key.iter().map(Bytes::len).sum();
        let delta_len: usize = delta.iter().map(Bytes::len).sum();
        assert!(delta_len * 10 < key_len);
    }

    #[test]
    fn test_packetization_respects_max_output() {
        let (mut encoder, mut decoder) = pair(64, 64);
        encoder.set_max_output_size(100);
        let noisy: Vec<u8> = (0..yuv420p_size(64, 64).unwrap())
            .map(|i| (i * 31 % 251) as u8)
            .collect();

        let packets = encoder.convert(&MediaFrame::new(127, 0, noisy.clone())).unwrap();
        assert!(packets.len() > 1);
        assert!(packets.iter().all(|p| p.payload_len() <= 100));
        assert_eq!(packets.iter().filter(|p| p.marker).count(), 1);

        let out = feed(&mut decoder, &packets);
        assert_eq!(out[0].payload.as_ref(), noisy.as_slice());
    }

    #[test]
    fn test_wrong_picture_size() {
        let (mut encoder, _) = pair(16, 16);
        let err = encoder.convert(&MediaFrame::new(127, 0, vec![0u8; 10])).unwrap_err();
        assert!(matches!(err, TranscoderError::Conversion(_)));
    }

    #[test]
    fn test_update_picture_forces_key() {
        let (mut encoder, _) = pair(16, 16);
        let still = picture(16, 16, 0);
        encoder.encode(&still).unwrap();
        encoder.encode(&still).unwrap();
        assert!(!encoder.was_last_frame_key());

        assert!(encoder.execute_command(&MediaCommand::VideoUpdatePicture));
        encoder.encode(&still).unwrap();
        assert!(encoder.was_last_frame_key());
    }

    #[test]
    fn test_periodic_key_frames() {
        let (mut encoder, _) = pair(16, 16);
        let still = picture(16, 16, 0);
        let keys = (0..KEY_FRAME_INTERVAL * 2)
            .filter(|_| {
                encoder.encode(&still).unwrap();
                encoder.was_last_frame_key()
            })
            .count();
        assert_eq!(keys, 2);
    }

    #[test]
    fn test_flow_control() {
        let (mut encoder, _) = pair(16, 16);
        assert!(encoder.execute_command(&MediaCommand::FlowControl {
            max_bit_rate: 64_000
        }));
        assert_eq!(encoder.target_bit_rate(), Some(64_000));
        assert!(!encoder.execute_command(&MediaCommand::Custom("x".into())));
    }

    #[test]
    fn test_missing_reference_requests_key_frame() {
        let (mut encoder, _) = pair(16, 16);
        let (_, mut decoder) = pair(16, 16);
        let recorded = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&recorded);
        decoder.set_command_notifier(Arc::new(move |command: &MediaCommand| {
            sink.lock().unwrap().push(command.clone());
        }));

        let still = picture(16, 16, 0);
        encoder.encode(&still).unwrap();
        // Decoder joins at a delta frame
        let delta = encoder.convert(&MediaFrame::new(127, 0, still.clone())).unwrap();
        assert!(feed(&mut decoder, &delta).is_empty());
        let again = encoder.convert(&MediaFrame::new(127, 0, still.clone())).unwrap();
        assert!(feed(&mut decoder, &again).is_empty());
        assert_eq!(*recorded.lock().unwrap(), vec![MediaCommand::VideoUpdatePicture]);

        encoder.request_key_frame();
        let key = encoder.convert(&MediaFrame::new(127, 0, still.clone())).unwrap();
        assert_eq!(feed(&mut decoder, &key).len(), 1);
    }

    #[test]
    fn test_codec_mismatch_rejected() {
        let mut encoder = VideoEncoder::new(VideoCodec::Vp8, yuv(16, 16), vp8()).unwrap();
        let (_, mut decoder) = pair(16, 16);
        let packets = encoder.convert(&MediaFrame::new(127, 0, picture(16, 16, 0))).unwrap();
        assert!(decoder.convert(&packets[0]).is_err());
    }

    #[test]
    fn test_frame_size_update() {
        let (mut encoder, _) = pair(16, 16);
        assert!(encoder.update_media_formats(&yuv(32, 32), &h264()));
        assert_eq!(encoder.optimal_data_frame_size(true), yuv420p_size(32, 32).unwrap());
        assert!(!encoder.update_media_formats(&yuv(32, 32), &vp8()));
    }
}

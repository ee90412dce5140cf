//! Transcoder units and the registry that builds them
//!
//! A transcoder converts frames of one [`MediaFormat`] into frames of another.
//! The [`TranscoderRegistry`] knows which (input, output) pairs can be built,
//! which formats are reachable from a native list through one or two stages,
//! and how to choose a source/sink format pair for a new media patch.

use crate::format::{well_known, MediaFormat, MediaFormatList, MediaType};
use crate::frame::MediaFrame;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Transcoder and negotiation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TranscoderError {
    /// No factory registered for the pair
    #[error("No transcoder from {from} to {to}")]
    NoTranscoder {
        /// Input format name
        from: String,
        /// Output format name
        to: String,
    },

    /// Format selection found no usable pair
    #[error("No compatible media formats: {0}")]
    NoCompatibleFormats(String),

    /// A frame could not be converted
    #[error("Conversion failed: {0}")]
    Conversion(String),

    /// Transcoder rejected the requested configuration
    #[error("Invalid transcoder configuration: {0}")]
    InvalidConfig(String),
}

/// Out-of-band commands that travel against the media flow
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaCommand {
    /// Ask the encoder for a key frame
    VideoUpdatePicture,
    /// Ask the sender to limit its bit rate
    FlowControl {
        /// New maximum in bits per second
        max_bit_rate: u32,
    },
    /// Trade frame rate against picture quality (0 = sharpest)
    TemporalSpatialTradeOff(u32),
    /// Application-specific command
    Custom(String),
}

impl fmt::Display for MediaCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VideoUpdatePicture => f.write_str("video-update-picture"),
            Self::FlowControl { max_bit_rate } => write!(f, "flow-control({max_bit_rate})"),
            Self::TemporalSpatialTradeOff(v) => write!(f, "temporal-spatial-trade-off({v})"),
            Self::Custom(name) => write!(f, "custom({name})"),
        }
    }
}

/// Callback a transcoder uses to raise commands towards the media source
pub type CommandNotifier = Arc<dyn Fn(&MediaCommand) + Send + Sync>;

/// A codec adapter converting frames from one format to another
///
/// Transcoders are owned by a single patch sink and only ever driven from one
/// thread at a time, so `Send` is sufficient.
pub trait Transcoder: Send {
    /// Format accepted by [`Transcoder::convert`]
    fn input_format(&self) -> &MediaFormat;

    /// Format produced by [`Transcoder::convert`]
    fn output_format(&self) -> &MediaFormat;

    /// Convert one input frame into zero or more output frames
    ///
    /// # Errors
    ///
    /// Returns error if the input cannot be decoded or encoded
    fn convert(&mut self, input: &MediaFrame) -> Result<Vec<MediaFrame>, TranscoderError>;

    /// Preferred payload size on the input (`true`) or output side
    fn optimal_data_frame_size(&self, input: bool) -> usize {
        let format = if input {
            self.input_format()
        } else {
            self.output_format()
        };
        packet_size(format)
    }

    /// Upper bound for produced payloads
    fn set_max_output_size(&mut self, _size: usize) {}

    /// Whether comfort noise (payload type 13) may be fed in
    fn accept_comfort_noise(&self) -> bool {
        false
    }

    /// Whether payload types other than the input format's may be fed in
    fn accept_other_payloads(&self) -> bool {
        false
    }

    /// Whether empty payloads may be fed in
    fn accept_empty_payload(&self) -> bool {
        false
    }

    /// Merge updated options into the input and output formats.
    /// Returns false if either format is a different encoding.
    fn update_media_formats(&mut self, input: &MediaFormat, output: &MediaFormat) -> bool;

    /// Handle a command. Returns true if it was understood.
    fn execute_command(&mut self, _command: &MediaCommand) -> bool {
        false
    }

    /// Install the callback used to raise commands upstream
    fn set_command_notifier(&mut self, _notifier: CommandNotifier) {}

    /// Whether the last converted input was a video key frame
    fn was_last_frame_key(&self) -> bool {
        false
    }
}

/// Bytes in one packet of `format`: frame size times TX frames per packet
pub fn packet_size(format: &MediaFormat) -> usize {
    let frames = format.tx_frames_per_packet().unwrap_or(1).max(1) as usize;
    format.frame_size() * frames
}

/// Merge `update` into `current` if it is the same encoding
pub fn merge_format(current: &mut MediaFormat, update: &MediaFormat) -> bool {
    if !current.is_same(update) {
        return false;
    }
    current.merge_options(update);
    true
}

/// Closure-backed transcoder for simple stateless conversions
pub struct FnTranscoder {
    input: MediaFormat,
    output: MediaFormat,
    convert: Box<dyn FnMut(&MediaFrame) -> Result<Vec<MediaFrame>, TranscoderError> + Send>,
}

impl FnTranscoder {
    /// Wrap `convert` as a transcoder between the two formats
    pub fn new<F>(input: MediaFormat, output: MediaFormat, convert: F) -> Self
    where
        F: FnMut(&MediaFrame) -> Result<Vec<MediaFrame>, TranscoderError> + Send + 'static,
    {
        Self {
            input,
            output,
            convert: Box::new(convert),
        }
    }
}

impl Transcoder for FnTranscoder {
    fn input_format(&self) -> &MediaFormat {
        &self.input
    }

    fn output_format(&self) -> &MediaFormat {
        &self.output
    }

    fn convert(&mut self, input: &MediaFrame) -> Result<Vec<MediaFrame>, TranscoderError> {
        (self.convert)(input)
    }

    fn update_media_formats(&mut self, input: &MediaFormat, output: &MediaFormat) -> bool {
        if !self.input.is_same(input) || !self.output.is_same(output) {
            return false;
        }
        merge_format(&mut self.input, input);
        merge_format(&mut self.output, output);
        true
    }
}

/// Factory building a transcoder for negotiated input/output formats
pub type TranscoderFactory = Arc<
    dyn Fn(&MediaFormat, &MediaFormat) -> Result<Box<dyn Transcoder>, TranscoderError>
        + Send
        + Sync,
>;

#[derive(Clone)]
struct Registration {
    input: MediaFormat,
    output: MediaFormat,
    factory: TranscoderFactory,
}

/// Registry of transcoder factories and the universe of known formats
#[derive(Clone, Default)]
pub struct TranscoderRegistry {
    registrations: Vec<Registration>,
    formats: MediaFormatList,
}

impl fmt::Debug for TranscoderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TranscoderRegistry")
            .field("pairs", &self.pairs())
            .field("formats", &self.formats.names())
            .finish()
    }
}

impl TranscoderRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for `input` → `output`. A later registration for
    /// the same pair replaces the earlier one.
    pub fn register<F>(&mut self, input: MediaFormat, output: MediaFormat, factory: F)
    where
        F: Fn(&MediaFormat, &MediaFormat) -> Result<Box<dyn Transcoder>, TranscoderError>
            + Send
            + Sync
            + 'static,
    {
        self.formats.push(input.clone());
        self.formats.push(output.clone());
        self.registrations
            .retain(|r| !(r.input.is_same(&input) && r.output.is_same(&output)));
        tracing::debug!(from = %input, to = %output, "Registered transcoder");
        self.registrations.push(Registration {
            input,
            output,
            factory: Arc::new(factory),
        });
    }

    /// Add a format to the universe without a transcoder
    pub fn register_format(&mut self, format: MediaFormat) {
        self.formats.push(format);
    }

    /// Every format known to the registry
    pub fn formats(&self) -> &MediaFormatList {
        &self.formats
    }

    /// Registered (input, output) name pairs
    pub fn pairs(&self) -> Vec<(String, String)> {
        self.registrations
            .iter()
            .map(|r| (r.input.name().to_string(), r.output.name().to_string()))
            .collect()
    }

    /// True if a single transcoder converts `from` into `to`
    pub fn has_transcoder(&self, from: &MediaFormat, to: &MediaFormat) -> bool {
        self.find(from, to).is_some()
    }

    fn find(&self, from: &MediaFormat, to: &MediaFormat) -> Option<&Registration> {
        self.registrations
            .iter()
            .find(|r| r.input.is_same(from) && r.output.is_same(to))
    }

    /// Build a transcoder for the negotiated formats
    ///
    /// # Errors
    ///
    /// Returns error if no factory is registered or the factory fails
    pub fn create(
        &self,
        input: &MediaFormat,
        output: &MediaFormat,
    ) -> Result<Box<dyn Transcoder>, TranscoderError> {
        let registration = self
            .find(input, output)
            .ok_or_else(|| TranscoderError::NoTranscoder {
                from: input.name().to_string(),
                to: output.name().to_string(),
            })?;
        (registration.factory)(input, output)
    }

    /// Find a format bridging `from` and `to` through two transcoders.
    /// Candidates are tried in universe order.
    pub fn find_intermediate(&self, from: &MediaFormat, to: &MediaFormat) -> Option<MediaFormat> {
        self.formats
            .iter()
            .filter(|mid| !mid.is_same(from) && !mid.is_same(to))
            .find(|mid| self.has_transcoder(from, mid) && self.has_transcoder(mid, to))
            .cloned()
    }

    /// Native formats followed by everything reachable from them through one
    /// or two transcoders. Aliases such as `G.711` are expanded.
    pub fn possible_formats(&self, native: &MediaFormatList) -> MediaFormatList {
        let mut expanded = MediaFormatList::new();
        for format in native {
            match well_known::lookup(format.name()) {
                Some(formats) if formats.len() > 1 => {
                    for f in formats {
                        expanded.push(f);
                    }
                }
                _ => {
                    expanded.push(format.clone());
                }
            }
        }

        let mut possible = expanded.clone();
        for format in &expanded {
            for first in self.outputs_of(format) {
                possible.push(first.clone());
                for second in self.outputs_of(&first) {
                    possible.push(second);
                }
            }
        }
        possible
    }

    fn outputs_of(&self, format: &MediaFormat) -> Vec<MediaFormat> {
        self.registrations
            .iter()
            .filter(|r| r.input.is_same(format))
            .map(|r| r.output.clone())
            .collect()
    }

    /// Choose a (source, sink) format pair of `media_type`.
    ///
    /// Pass one looks for an identical format, pass two for a single
    /// transcoder, pass three for a bridge through an intermediate format.
    /// Every pass walks the sink list in the outer loop so the sink side's
    /// preference order wins.
    ///
    /// # Errors
    ///
    /// Returns [`TranscoderError::NoCompatibleFormats`] if no pass finds a pair
    pub fn select_media_formats(
        &self,
        media_type: MediaType,
        source: &MediaFormatList,
        sink: &MediaFormatList,
    ) -> Result<(MediaFormat, MediaFormat), TranscoderError> {
        let sources: Vec<&MediaFormat> = source
            .iter()
            .filter(|f| f.media_type() == media_type)
            .collect();
        let sinks: Vec<&MediaFormat> = sink
            .iter()
            .filter(|f| f.media_type() == media_type)
            .collect();

        let passes: [&dyn Fn(&MediaFormat, &MediaFormat) -> bool; 3] = [
            &|src, dst| src.is_same(dst),
            &|src, dst| self.has_transcoder(src, dst),
            &|src, dst| self.find_intermediate(src, dst).is_some(),
        ];
        for (pass, usable) in passes.iter().enumerate() {
            for dst in &sinks {
                if let Some(src) = sources.iter().find(|src| usable(**src, *dst)) {
                    tracing::debug!(
                        pass = pass + 1,
                        source = %src,
                        sink = %dst,
                        "Selected media formats"
                    );
                    return Ok(((*src).clone(), (*dst).clone()));
                }
            }
        }

        Err(TranscoderError::NoCompatibleFormats(format!(
            "{media_type}: source {source} sink {sink}"
        )))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn fmt(name: &str) -> MediaFormat {
        well_known::get(name).unwrap()
    }

    fn relabel(from: &str, to: &str) -> (MediaFormat, MediaFormat) {
        (fmt(from), fmt(to))
    }

    fn registry() -> TranscoderRegistry {
        let mut registry = TranscoderRegistry::new();
        for (from, to) in [
            ("PCMU", "PCM-16"),
            ("PCM-16", "PCMU"),
            ("PCMA", "PCM-16"),
            ("PCM-16", "PCMA"),
            ("H.264", "YUV420P"),
            ("YUV420P", "VP8"),
        ] {
            let (input, output) = relabel(from, to);
            registry.register(input, output, |i, o| {
                let pt = o.payload_type();
                Ok(Box::new(FnTranscoder::new(i.clone(), o.clone(), move |f| {
                    let mut out = f.clone();
                    out.payload_type = pt;
                    Ok(vec![out])
                })))
            });
        }
        registry
    }

    #[test]
    fn test_exact_match_prefers_sink_order() {
        let registry = registry();
        let a = MediaFormatList::from_names(&["PCMU", "PCMA", "G.729"]).unwrap();
        let b = MediaFormatList::from_names(&["G.729", "G.711"]).unwrap();
        let (src, dst) = registry
            .select_media_formats(MediaType::Audio, &a, &b)
            .unwrap();
        assert_eq!(src.name(), "G.729");
        assert_eq!(dst.name(), "G.729");
    }

    #[test]
    fn test_single_transcoder_pass() {
        let registry = registry();
        let a = MediaFormatList::from_names(&["PCMU"]).unwrap();
        let b = MediaFormatList::from_names(&["PCM-16"]).unwrap();
        let (src, dst) = registry
            .select_media_formats(MediaType::Audio, &a, &b)
            .unwrap();
        assert_eq!((src.name(), dst.name()), ("PCMU", "PCM-16"));
    }

    #[test]
    fn test_intermediate_pass() {
        let registry = registry();
        let a = MediaFormatList::from_names(&["H.264"]).unwrap();
        let b = MediaFormatList::from_names(&["VP8"]).unwrap();
        let (src, dst) = registry
            .select_media_formats(MediaType::Video, &a, &b)
            .unwrap();
        assert_eq!((src.name(), dst.name()), ("H.264", "VP8"));
        let mid = registry.find_intermediate(&src, &dst).unwrap();
        assert_eq!(mid.name(), "YUV420P");
    }

    #[test]
    fn test_no_pair_is_error() {
        let registry = registry();
        let a = MediaFormatList::from_names(&["G.729"]).unwrap();
        let b = MediaFormatList::from_names(&["G.722"]).unwrap();
        let err = registry
            .select_media_formats(MediaType::Audio, &a, &b)
            .unwrap_err();
        assert!(matches!(err, TranscoderError::NoCompatibleFormats(_)));
    }

    #[test]
    fn test_media_type_filters_candidates() {
        let registry = registry();
        let a = MediaFormatList::from_names(&["H.264", "PCMU"]).unwrap();
        let b = MediaFormatList::from_names(&["H.264", "PCMU"]).unwrap();
        let (src, _) = registry
            .select_media_formats(MediaType::Audio, &a, &b)
            .unwrap();
        assert_eq!(src.name(), "PCMU");
    }

    #[test]
    fn test_possible_formats_two_stages_and_alias() {
        let registry = registry();
        let mut native = MediaFormatList::new();
        native.push(MediaFormat::new("G.711", MediaType::Audio, 0, 8000));
        let possible = registry.possible_formats(&native);
        assert_eq!(possible.names(), vec!["PCMU", "PCMA", "PCM-16"]);

        let video = MediaFormatList::from_names(&["H.264"]).unwrap();
        assert_eq!(
            registry.possible_formats(&video).names(),
            vec!["H.264", "YUV420P", "VP8"]
        );
    }

    #[test]
    fn test_create_unknown_pair() {
        let registry = registry();
        let err = registry.create(&fmt("G.729"), &fmt("PCMU")).err().unwrap();
        assert_eq!(
            err,
            TranscoderError::NoTranscoder {
                from: "G.729".to_string(),
                to: "PCMU".to_string()
            }
        );
    }

    #[test]
    fn test_fn_transcoder_update_rejects_other_encoding() {
        let registry = registry();
        let mut t = registry.create(&fmt("PCMU"), &fmt("PCM-16")).unwrap();
        assert!(t.update_media_formats(&fmt("PCMU"), &fmt("PCM-16")));
        assert!(!t.update_media_formats(&fmt("PCMA"), &fmt("PCM-16")));
        assert_eq!(t.optimal_data_frame_size(true), 160);
        assert_eq!(t.optimal_data_frame_size(false), 16);
    }
}

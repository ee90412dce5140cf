//! Media formats and ordered format lists
//!
//! A [`MediaFormat`] describes one encoding (name, media type, RTP payload type,
//! clock rate and framing) plus a bag of string options negotiated per call.
//! A [`MediaFormatList`] is the ordered preference list a connection offers.
//!
//! Format patterns used by masks and reorder rules accept a leading and/or
//! trailing `*` wildcard, and `@audio` / `@video` / `@fax` / `@userinput` to
//! match every format of a media type.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Format-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    /// Name does not resolve to a known format or alias
    #[error("Unknown media format: {0}")]
    UnknownFormat(String),
}

/// Kind of media carried by a format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MediaType {
    /// Audio samples or encoded audio
    Audio,
    /// Raw or encoded video
    Video,
    /// Fax (T.38)
    Fax,
    /// Out-of-band user input such as DTMF
    UserInput,
}

impl MediaType {
    /// Lower-case name used in patterns and logs
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Fax => "fax",
            Self::UserInput => "userinput",
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Well-known option names
pub mod options {
    /// Frames the sender packs into one packet
    pub const TX_FRAMES_PER_PACKET: &str = "Tx Frames Per Packet";
    /// Frames the receiver accepts in one packet
    pub const RX_FRAMES_PER_PACKET: &str = "Rx Frames Per Packet";
    /// Upper bit rate bound in bits per second
    pub const MAX_BIT_RATE: &str = "Max Bit Rate";
    /// Bit rate the encoder should aim for
    pub const TARGET_BIT_RATE: &str = "Target Bit Rate";
    /// Bit mask of supported [`super::ContentRole`]s
    pub const CONTENT_ROLE_MASK: &str = "Content Role Mask";
    /// Video frame width in pixels
    pub const FRAME_WIDTH: &str = "Frame Width";
    /// Video frame height in pixels
    pub const FRAME_HEIGHT: &str = "Frame Height";
}

/// Payload type used for comfort noise frames (RFC 3389)
pub const PAYLOAD_TYPE_CN: u8 = 13;

/// Role of a video stream within a call (H.239 style)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentRole {
    /// Main camera
    Main,
    /// Presentation / slides
    Slides,
    /// Active speaker
    Speaker,
    /// Sign language interpreter
    SignLanguage,
}

impl ContentRole {
    /// Bit for this role in [`options::CONTENT_ROLE_MASK`]
    #[must_use]
    pub fn mask_bit(self) -> u32 {
        1 << (self as u32)
    }
}

/// A single media format with negotiated options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaFormat {
    name: String,
    media_type: MediaType,
    payload_type: u8,
    clock_rate: u32,
    /// Bytes in one codec frame (0 when variable)
    frame_size: usize,
    /// Clock ticks covered by one codec frame
    frame_time: u32,
    #[serde(default)]
    options: BTreeMap<String, String>,
}

impl MediaFormat {
    /// Create a format without framing or options
    pub fn new(
        name: impl Into<String>,
        media_type: MediaType,
        payload_type: u8,
        clock_rate: u32,
    ) -> Self {
        Self {
            name: name.into(),
            media_type,
            payload_type,
            clock_rate,
            frame_size: 0,
            frame_time: 0,
            options: BTreeMap::new(),
        }
    }

    /// Set the codec framing
    #[must_use]
    pub fn with_framing(mut self, frame_size: usize, frame_time: u32) -> Self {
        self.frame_size = frame_size;
        self.frame_time = frame_time;
        self
    }

    /// Set an option
    #[must_use]
    pub fn with_option(mut self, name: &str, value: impl ToString) -> Self {
        self.set_option(name, value);
        self
    }

    /// Format name, e.g. `PCMU`
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Media type
    #[must_use]
    pub fn media_type(&self) -> MediaType {
        self.media_type
    }

    /// RTP payload type
    #[must_use]
    pub fn payload_type(&self) -> u8 {
        self.payload_type
    }

    /// Clock rate in Hz
    #[must_use]
    pub fn clock_rate(&self) -> u32 {
        self.clock_rate
    }

    /// Bytes per codec frame
    #[must_use]
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Clock ticks per codec frame
    #[must_use]
    pub fn frame_time(&self) -> u32 {
        self.frame_time
    }

    /// Same encoding, ignoring options
    #[must_use]
    pub fn is_same(&self, other: &MediaFormat) -> bool {
        self.name.eq_ignore_ascii_case(&other.name)
    }

    /// Same encoding as the named format
    #[must_use]
    pub fn is_named(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    /// Raw option value
    #[must_use]
    pub fn option(&self, name: &str) -> Option<&str> {
        self.options.get(name).map(String::as_str)
    }

    /// Option parsed as an unsigned integer
    #[must_use]
    pub fn option_u32(&self, name: &str) -> Option<u32> {
        self.option(name).and_then(|v| v.trim().parse().ok())
    }

    /// Set an option, returning true if the value changed
    pub fn set_option(&mut self, name: &str, value: impl ToString) -> bool {
        let value = value.to_string();
        match self.options.get(name) {
            Some(existing) if *existing == value => false,
            _ => {
                self.options.insert(name.to_string(), value);
                true
            }
        }
    }

    /// All options
    #[must_use]
    pub fn options(&self) -> &BTreeMap<String, String> {
        &self.options
    }

    /// Frames per packet the sender uses, if negotiated
    #[must_use]
    pub fn tx_frames_per_packet(&self) -> Option<u32> {
        self.option_u32(options::TX_FRAMES_PER_PACKET)
    }

    /// Whether the format may carry the given content role.
    ///
    /// Formats without a role mask only carry the main role.
    #[must_use]
    pub fn supports_content_role(&self, role: ContentRole) -> bool {
        match self.option_u32(options::CONTENT_ROLE_MASK) {
            Some(mask) => mask & role.mask_bit() != 0,
            None => role == ContentRole::Main,
        }
    }

    /// Adopt the options of `other` (same encoding). Returns true on change.
    pub fn merge_options(&mut self, other: &MediaFormat) -> bool {
        if !self.is_same(other) {
            return false;
        }
        let mut changed = false;
        for (name, value) in &other.options {
            changed |= self.set_option(name, value);
        }
        changed
    }

    /// Match against a mask/order pattern
    #[must_use]
    pub fn matches_pattern(&self, pattern: &str) -> bool {
        if let Some(media) = pattern.strip_prefix('@') {
            return self.media_type.as_str().eq_ignore_ascii_case(media);
        }
        wildcard_match(pattern, &self.name)
    }
}

impl fmt::Display for MediaFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

fn wildcard_match(pattern: &str, name: &str) -> bool {
    let pattern = pattern.to_ascii_lowercase();
    let name = name.to_ascii_lowercase();
    match (pattern.strip_prefix('*'), pattern.strip_suffix('*')) {
        _ if pattern == "*" => true,
        (Some(rest), _) if rest.ends_with('*') => name.contains(&rest[..rest.len() - 1]),
        (Some(rest), _) => name.ends_with(rest),
        (None, Some(rest)) => name.starts_with(rest),
        (None, None) => name == pattern,
    }
}

/// Ordered list of media formats, most preferred first
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MediaFormatList(Vec<MediaFormat>);

impl MediaFormatList {
    /// Empty list
    #[must_use]
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Build a list from well-known names and aliases, e.g. `["G.729", "G.711"]`
    ///
    /// # Errors
    ///
    /// Returns error if a name is not a well-known format or alias
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self, FormatError> {
        let mut list = Self::new();
        for name in names {
            let formats = well_known::lookup(name.as_ref())
                .ok_or_else(|| FormatError::UnknownFormat(name.as_ref().to_string()))?;
            for format in formats {
                list.push(format);
            }
        }
        Ok(list)
    }

    /// Append a format unless one with the same name is present.
    /// Returns true if added.
    pub fn push(&mut self, format: MediaFormat) -> bool {
        if self.contains(format.name()) {
            return false;
        }
        self.0.push(format);
        true
    }

    /// Append every format of `other` not already present
    pub fn extend_from(&mut self, other: &MediaFormatList) {
        for format in other.iter() {
            self.push(format.clone());
        }
    }

    /// Number of formats
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate in preference order
    pub fn iter(&self) -> std::slice::Iter<'_, MediaFormat> {
        self.0.iter()
    }

    /// First (most preferred) format
    #[must_use]
    pub fn first(&self) -> Option<&MediaFormat> {
        self.0.first()
    }

    /// True if a format with this name is present
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.find(name).is_some()
    }

    /// Find by name
    #[must_use]
    pub fn find(&self, name: &str) -> Option<&MediaFormat> {
        self.0.iter().find(|f| f.is_named(name))
    }

    /// Find by name for modification
    pub fn find_mut(&mut self, name: &str) -> Option<&mut MediaFormat> {
        self.0.iter_mut().find(|f| f.is_named(name))
    }

    /// Remove every format matching a pattern. Returns the number removed.
    pub fn remove_matching(&mut self, pattern: &str) -> usize {
        let before = self.0.len();
        self.0.retain(|f| !f.matches_pattern(pattern));
        before - self.0.len()
    }

    /// Keep only formats for which the predicate holds
    pub fn retain(&mut self, f: impl FnMut(&MediaFormat) -> bool) {
        self.0.retain(f);
    }

    /// Keep only formats of one media type
    pub fn retain_media_type(&mut self, media_type: MediaType) {
        self.0.retain(|f| f.media_type() == media_type);
    }

    /// Move formats matching the patterns to the front, in pattern order.
    /// Formats not matched keep their relative order.
    pub fn reorder<S: AsRef<str>>(&mut self, patterns: &[S]) {
        let mut front = Vec::with_capacity(self.0.len());
        for pattern in patterns {
            let mut i = 0;
            while i < self.0.len() {
                if self.0[i].matches_pattern(pattern.as_ref()) {
                    front.push(self.0.remove(i));
                } else {
                    i += 1;
                }
            }
        }
        front.append(&mut self.0);
        self.0 = front;
    }

    /// Formats of `self` whose names also appear in `other`, in `self` order
    #[must_use]
    pub fn intersection(&self, other: &MediaFormatList) -> MediaFormatList {
        Self(
            self.0
                .iter()
                .filter(|f| other.contains(f.name()))
                .cloned()
                .collect(),
        )
    }

    /// Format names in order
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.0.iter().map(|f| f.name().to_string()).collect()
    }
}

impl FromIterator<MediaFormat> for MediaFormatList {
    fn from_iter<T: IntoIterator<Item = MediaFormat>>(iter: T) -> Self {
        let mut list = Self::new();
        for format in iter {
            list.push(format);
        }
        list
    }
}

impl IntoIterator for MediaFormatList {
    type Item = MediaFormat;
    type IntoIter = std::vec::IntoIter<MediaFormat>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a MediaFormatList {
    type Item = &'a MediaFormat;
    type IntoIter = std::slice::Iter<'a, MediaFormat>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl fmt::Display for MediaFormatList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.names().join(", "))
    }
}

/// Well-known format definitions and aliases
pub mod well_known {
    use super::{options, ContentRole, Lazy, MediaFormat, MediaFormatList, MediaType};

    /// Linear 16-bit PCM, 8 kHz
    pub const PCM16: &str = "PCM-16";
    /// Linear 16-bit PCM, 16 kHz
    pub const PCM16_16K: &str = "PCM-16-16kHz";
    /// G.711 μ-law
    pub const PCMU: &str = "PCMU";
    /// G.711 A-law
    pub const PCMA: &str = "PCMA";
    /// G.729
    pub const G729: &str = "G.729";
    /// G.722
    pub const G722: &str = "G.722";
    /// RFC 2833 named telephone events
    pub const TELEPHONE_EVENT: &str = "UserInput/RFC2833";
    /// Raw planar YUV 4:2:0 video
    pub const YUV420P: &str = "YUV420P";
    /// H.264 video
    pub const H264: &str = "H.264";
    /// VP8 video
    pub const VP8: &str = "VP8";
    /// T.38 fax relay
    pub const T38: &str = "T.38";
    /// Alias expanding to both G.711 laws
    pub const G711_ALIAS: &str = "G.711";

    static TABLE: Lazy<Vec<MediaFormat>> = Lazy::new(|| {
        let video_roles = ContentRole::Main.mask_bit() | ContentRole::Slides.mask_bit();
        let all_roles = video_roles
            | ContentRole::Speaker.mask_bit()
            | ContentRole::SignLanguage.mask_bit();
        vec![
            MediaFormat::new(PCM16, MediaType::Audio, 255, 8000).with_framing(16, 8),
            MediaFormat::new(PCM16_16K, MediaType::Audio, 255, 16000).with_framing(32, 16),
            MediaFormat::new(PCMU, MediaType::Audio, 0, 8000)
                .with_framing(8, 8)
                .with_option(options::TX_FRAMES_PER_PACKET, 20),
            MediaFormat::new(PCMA, MediaType::Audio, 8, 8000)
                .with_framing(8, 8)
                .with_option(options::TX_FRAMES_PER_PACKET, 20),
            MediaFormat::new(G729, MediaType::Audio, 18, 8000)
                .with_framing(10, 80)
                .with_option(options::TX_FRAMES_PER_PACKET, 2),
            MediaFormat::new(G722, MediaType::Audio, 9, 16000)
                .with_framing(80, 160)
                .with_option(options::TX_FRAMES_PER_PACKET, 2),
            MediaFormat::new(TELEPHONE_EVENT, MediaType::UserInput, 101, 8000).with_framing(4, 8),
            MediaFormat::new(YUV420P, MediaType::Video, 127, 90000)
                .with_framing(0, 3000)
                .with_option(options::CONTENT_ROLE_MASK, all_roles)
                .with_option(options::FRAME_WIDTH, 352)
                .with_option(options::FRAME_HEIGHT, 288),
            MediaFormat::new(H264, MediaType::Video, 96, 90000)
                .with_framing(0, 3000)
                .with_option(options::CONTENT_ROLE_MASK, video_roles)
                .with_option(options::MAX_BIT_RATE, 1_000_000),
            MediaFormat::new(VP8, MediaType::Video, 97, 90000)
                .with_framing(0, 3000)
                .with_option(options::CONTENT_ROLE_MASK, video_roles)
                .with_option(options::MAX_BIT_RATE, 1_000_000),
            MediaFormat::new(T38, MediaType::Fax, 98, 8000),
        ]
    });

    /// Every well-known format
    #[must_use]
    pub fn all() -> MediaFormatList {
        TABLE.iter().cloned().collect()
    }

    /// Look up a single well-known format
    #[must_use]
    pub fn get(name: &str) -> Option<MediaFormat> {
        TABLE.iter().find(|f| f.is_named(name)).cloned()
    }

    /// Resolve a name or alias to its formats
    #[must_use]
    pub fn lookup(name: &str) -> Option<Vec<MediaFormat>> {
        if name.eq_ignore_ascii_case(G711_ALIAS) {
            return Some(vec![get(PCMU)?, get(PCMA)?]);
        }
        get(name).map(|f| vec![f])
    }
}

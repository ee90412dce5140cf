//! Call recording
//!
//! A [`Recorder`] receives frames from any number of named channels (one per
//! recorded media stream). Recorders are created through a
//! [`RecorderRegistry`] keyed by file extension; the built-in [`RawRecorder`]
//! writes the framed `.sbr` format described below.
//!
//! `.sbr` layout, all integers little endian:
//!
//! ```text
//! magic "SBR1"
//! record*:
//!   kind u8            0 = channel opened, 1 = audio frame, 2 = video frame
//!   channel_len u16, channel bytes
//!   kind 0: format_len u16, format name bytes
//!   kind 1/2: payload_type u8, timestamp u32, marker u8, payload_len u32, payload
//! ```

use crate::format::MediaFormat;
use crate::frame::MediaFrame;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Recording errors
#[derive(Error, Debug)]
pub enum RecordingError {
    /// No recorder registered for the file extension
    #[error("No recorder for file type: {0}")]
    UnsupportedType(String),

    /// Recorder used before `open`
    #[error("Recorder not open")]
    NotOpen,

    /// Frame for a channel that was never opened or already closed
    #[error("Unknown recording channel: {0}")]
    UnknownChannel(String),

    /// Recording file is malformed
    #[error("Corrupt recording: {0}")]
    Corrupt(String),

    /// I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// What to record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingOptions {
    /// Record audio streams
    pub audio: bool,
    /// Record video streams
    pub video: bool,
}

impl Default for RecordingOptions {
    fn default() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }
}

/// Sink for recorded media
pub trait Recorder: Send + Sync {
    /// Open the output file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be created
    fn open(&self, path: &Path, options: &RecordingOptions) -> Result<(), RecordingError>;

    /// Whether the recorder is open
    fn is_open(&self) -> bool;

    /// Options passed to `open`
    fn options(&self) -> RecordingOptions;

    /// Start a channel carrying `format`
    ///
    /// # Errors
    ///
    /// Returns error if the recorder is not open or the write fails
    fn open_channel(&self, channel: &str, format: &MediaFormat) -> Result<(), RecordingError>;

    /// Stop accepting frames for a channel
    fn close_channel(&self, channel: &str);

    /// Record an audio frame
    ///
    /// # Errors
    ///
    /// Returns error if the channel is unknown or the write fails
    fn write_audio(&self, channel: &str, frame: &MediaFrame) -> Result<(), RecordingError>;

    /// Record a video frame
    ///
    /// # Errors
    ///
    /// Returns error if the channel is unknown or the write fails
    fn write_video(&self, channel: &str, frame: &MediaFrame) -> Result<(), RecordingError>;

    /// Flush and close the output
    ///
    /// # Errors
    ///
    /// Returns error if flushing fails
    fn close(&self) -> Result<(), RecordingError>;
}

type RecorderFactory = Arc<dyn Fn() -> Box<dyn Recorder> + Send + Sync>;

/// Recorder factories by file extension
#[derive(Clone)]
pub struct RecorderRegistry {
    factories: HashMap<String, RecorderFactory>,
}

impl fmt::Debug for RecorderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut extensions: Vec<&String> = self.factories.keys().collect();
        extensions.sort();
        f.debug_struct("RecorderRegistry")
            .field("extensions", &extensions)
            .finish()
    }
}

impl Default for RecorderRegistry {
    fn default() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register(RawRecorder::EXTENSION, || Box::new(RawRecorder::new()));
        registry
    }
}

impl RecorderRegistry {
    /// Registry with the built-in raw recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for an extension (without the dot)
    pub fn register<F>(&mut self, extension: &str, factory: F)
    where
        F: Fn() -> Box<dyn Recorder> + Send + Sync + 'static,
    {
        self.factories
            .insert(extension.to_ascii_lowercase(), Arc::new(factory));
    }

    /// Create a recorder for `path` based on its extension
    ///
    /// # Errors
    ///
    /// Returns error if no recorder handles the extension
    pub fn create(&self, path: &Path) -> Result<Box<dyn Recorder>, RecordingError> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let factory = self
            .factories
            .get(&extension)
            .ok_or_else(|| RecordingError::UnsupportedType(extension.clone()))?;
        Ok(factory())
    }
}

// ============================================================================
// Raw recorder
// ============================================================================

const MAGIC: &[u8; 4] = b"SBR1";
const KIND_CHANNEL: u8 = 0;
const KIND_AUDIO: u8 = 1;
const KIND_VIDEO: u8 = 2;

struct RawState {
    writer: BufWriter<File>,
    path: PathBuf,
    options: RecordingOptions,
    channels: HashSet<String>,
}

/// Writes every channel's frames into one framed `.sbr` file
#[derive(Default)]
pub struct RawRecorder {
    state: Mutex<Option<RawState>>,
}

impl RawRecorder {
    /// File extension handled by this recorder
    pub const EXTENSION: &'static str = "sbr";

    /// Closed recorder
    pub fn new() -> Self {
        Self::default()
    }

    fn write_frame(&self, kind: u8, channel: &str, frame: &MediaFrame) -> Result<(), RecordingError> {
        let mut guard = self.state.lock();
        let state = guard.as_mut().ok_or(RecordingError::NotOpen)?;
        if !state.channels.contains(channel) {
            return Err(RecordingError::UnknownChannel(channel.to_string()));
        }
        let mut record = BytesMut::with_capacity(16 + channel.len() + frame.payload_len());
        put_header(&mut record, kind, channel);
        record.put_u8(frame.payload_type);
        record.put_u32_le(frame.timestamp);
        record.put_u8(u8::from(frame.marker));
        record.put_u32_le(frame.payload_len() as u32);
        record.put_slice(&frame.payload);
        state.writer.write_all(&record)?;
        Ok(())
    }
}

fn put_header(record: &mut BytesMut, kind: u8, channel: &str) {
    record.put_u8(kind);
    record.put_u16_le(channel.len() as u16);
    record.put_slice(channel.as_bytes());
}

impl Recorder for RawRecorder {
    fn open(&self, path: &Path, options: &RecordingOptions) -> Result<(), RecordingError> {
        let mut writer = BufWriter::new(File::create(path)?);
        writer.write_all(MAGIC)?;
        tracing::info!(path = %path.display(), "Recording started");
        *self.state.lock() = Some(RawState {
            writer,
            path: path.to_path_buf(),
            options: options.clone(),
            channels: HashSet::new(),
        });
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state.lock().is_some()
    }

    fn options(&self) -> RecordingOptions {
        self.state
            .lock()
            .as_ref()
            .map(|s| s.options.clone())
            .unwrap_or_default()
    }

    fn open_channel(&self, channel: &str, format: &MediaFormat) -> Result<(), RecordingError> {
        let mut guard = self.state.lock();
        let state = guard.as_mut().ok_or(RecordingError::NotOpen)?;
        let mut record = BytesMut::new();
        put_header(&mut record, KIND_CHANNEL, channel);
        record.put_u16_le(format.name().len() as u16);
        record.put_slice(format.name().as_bytes());
        state.writer.write_all(&record)?;
        state.channels.insert(channel.to_string());
        Ok(())
    }

    fn close_channel(&self, channel: &str) {
        if let Some(state) = self.state.lock().as_mut() {
            state.channels.remove(channel);
        }
    }

    fn write_audio(&self, channel: &str, frame: &MediaFrame) -> Result<(), RecordingError> {
        self.write_frame(KIND_AUDIO, channel, frame)
    }

    fn write_video(&self, channel: &str, frame: &MediaFrame) -> Result<(), RecordingError> {
        self.write_frame(KIND_VIDEO, channel, frame)
    }

    fn close(&self) -> Result<(), RecordingError> {
        if let Some(mut state) = self.state.lock().take() {
            state.writer.flush()?;
            tracing::info!(path = %state.path.display(), "Recording stopped");
        }
        Ok(())
    }
}

/// One record read back from an `.sbr` file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordEntry {
    /// Channel opened with the named format
    Channel {
        /// Channel name
        channel: String,
        /// Format name
        format: String,
    },
    /// Audio frame
    Audio {
        /// Channel name
        channel: String,
        /// Recorded frame
        frame: MediaFrame,
    },
    /// Video frame
    Video {
        /// Channel name
        channel: String,
        /// Recorded frame
        frame: MediaFrame,
    },
}

/// Read every record of an `.sbr` file
///
/// # Errors
///
/// Returns error on I/O failure or malformed content
pub fn read_raw_recording(path: &Path) -> Result<Vec<RecordEntry>, RecordingError> {
    let mut data = Vec::new();
    File::open(path)?.read_to_end(&mut data)?;
    let mut buf = Bytes::from(data);

    if buf.remaining() < MAGIC.len() || &buf[..MAGIC.len()] != MAGIC {
        return Err(RecordingError::Corrupt("missing header".to_string()));
    }
    buf.advance(MAGIC.len());

    let mut entries = Vec::new();
    while buf.has_remaining() {
        let kind = buf.get_u8();
        let channel = take_string(&mut buf)?;
        let entry = match kind {
            KIND_CHANNEL => RecordEntry::Channel {
                channel,
                format: take_string(&mut buf)?,
            },
            KIND_AUDIO | KIND_VIDEO => {
                need(&buf, 10)?;
                let payload_type = buf.get_u8();
                let timestamp = buf.get_u32_le();
                let marker = buf.get_u8() != 0;
                let len = buf.get_u32_le() as usize;
                need(&buf, len)?;
                let frame = MediaFrame::new(payload_type, timestamp, buf.split_to(len))
                    .with_marker(marker);
                if kind == KIND_AUDIO {
                    RecordEntry::Audio { channel, frame }
                } else {
                    RecordEntry::Video { channel, frame }
                }
            }
            other => return Err(RecordingError::Corrupt(format!("unknown record kind {other}"))),
        };
        entries.push(entry);
    }
    Ok(entries)
}

fn need(buf: &Bytes, len: usize) -> Result<(), RecordingError> {
    if buf.remaining() < len {
        return Err(RecordingError::Corrupt("truncated record".to_string()));
    }
    Ok(())
}

fn take_string(buf: &mut Bytes) -> Result<String, RecordingError> {
    need(buf, 2)?;
    let len = buf.get_u16_le() as usize;
    need(buf, len)?;
    String::from_utf8(buf.split_to(len).to_vec())
        .map_err(|e| RecordingError::Corrupt(e.to_string()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::format::well_known;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_registry_by_extension() {
        let registry = RecorderRegistry::new();
        assert!(registry.create(Path::new("call.SBR")).is_ok());
        assert!(matches!(
            registry.create(Path::new("call.wav")),
            Err(RecordingError::UnsupportedType(ext)) if ext == "wav"
        ));
    }

    #[test]
    fn test_raw_recording_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("call.sbr");
        let recorder = RawRecorder::new();
        recorder.open(&path, &RecordingOptions::default()).unwrap();

        let pcmu = well_known::get(well_known::PCMU).unwrap();
        recorder.open_channel("a-1", &pcmu).unwrap();
        let frame = MediaFrame::new(0, 160, vec![1u8, 2, 3]).with_marker(true);
        recorder.write_audio("a-1", &frame).unwrap();
        assert!(matches!(
            recorder.write_audio("b-1", &frame),
            Err(RecordingError::UnknownChannel(_))
        ));
        recorder.close_channel("a-1");
        assert!(recorder.write_audio("a-1", &frame).is_err());
        recorder.close().unwrap();
        assert!(!recorder.is_open());

        let entries = read_raw_recording(&path).unwrap();
        assert_eq!(
            entries,
            vec![
                RecordEntry::Channel {
                    channel: "a-1".to_string(),
                    format: "PCMU".to_string()
                },
                RecordEntry::Audio {
                    channel: "a-1".to_string(),
                    frame
                },
            ]
        );
    }

    #[test]
    fn test_write_before_open() {
        let recorder = RawRecorder::new();
        let frame = MediaFrame::default();
        assert!(matches!(
            recorder.write_video("v", &frame),
            Err(RecordingError::NotOpen)
        ));
    }

    #[test]
    fn test_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.sbr");
        std::fs::write(&path, b"NOPE").unwrap();
        assert!(matches!(
            read_raw_recording(&path),
            Err(RecordingError::Corrupt(_))
        ));
    }
}

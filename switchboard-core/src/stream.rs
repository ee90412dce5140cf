//! Media streams: the endpoint-owned ends of a media patch
//!
//! A stream is either a source (read by a patch pump) or a sink (written by a
//! patch). Sources own their patch; sinks only point back at it.

use crate::format::MediaFormat;
use crate::frame::MediaFrame;
use crate::patch::MediaPatch;
use crate::transcoder::{merge_format, MediaCommand};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Media stream errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// Stream has been closed
    #[error("Stream closed")]
    Closed,

    /// Read attempted on a sink
    #[error("Stream {0} is not a source")]
    NotSource(StreamId),

    /// Write attempted on a source
    #[error("Stream {0} is not a sink")]
    NotSink(StreamId),

    /// Write failed
    #[error("Write failed: {0}")]
    WriteFailed(String),

    /// Stream could not be opened
    #[error("Open failed: {0}")]
    OpenFailed(String),
}

/// Process-unique stream identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(u64);

impl StreamId {
    /// Allocate the next identifier
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Numeric value
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Directional channel of timestamped frames for one format
///
/// Implementations must be `Send + Sync`: a source is read by its patch's pump
/// thread while signaling threads query and close it.
pub trait MediaStream: Send + Sync {
    /// Stream identifier
    fn id(&self) -> StreamId;

    /// Current format
    fn media_format(&self) -> MediaFormat;

    /// Session the stream belongs to
    fn session_id(&self) -> u32;

    /// True for sources, false for sinks
    fn is_source(&self) -> bool;

    /// True for sinks
    fn is_sink(&self) -> bool {
        !self.is_source()
    }

    /// False once closed
    fn is_open(&self) -> bool;

    /// Read the next frame, blocking until one is available
    ///
    /// # Errors
    ///
    /// Returns error when the stream is closed or not a source
    fn read_packet(&self, frame: &mut MediaFrame) -> Result<(), StreamError>;

    /// Write one frame
    ///
    /// # Errors
    ///
    /// Returns error when the frame cannot be delivered
    fn write_packet(&self, frame: &MediaFrame) -> Result<(), StreamError>;

    /// Payload size the stream reads or writes per packet
    fn data_size(&self) -> usize;

    /// Set payload size and frame time per packet
    fn set_data_size(&self, size: usize, frame_time: u32);

    /// Whether reads or writes are paced in real time
    fn is_synchronous(&self) -> bool;

    /// Whether the stream currently discards media
    fn is_paused(&self) -> bool;

    /// Handle a command. Returns true if it was understood.
    fn execute_command(&self, command: &MediaCommand) -> bool;

    /// Merge updated format options. Returns true if accepted.
    fn update_media_format(&self, format: &MediaFormat) -> bool;

    /// Patch this stream is attached to
    fn patch(&self) -> Option<Arc<MediaPatch>>;

    /// Attach to or detach from a patch
    fn set_patch(&self, patch: Option<&Arc<MediaPatch>>);

    /// Whether a patch on this source needs its own pump thread
    fn requires_patch_thread(&self) -> bool {
        true
    }

    /// Called on the pump thread before the first read
    fn on_patch_start(&self) {}

    /// Called on the pump thread after the pump exits
    fn on_patch_stop(&self) {}

    /// Close the stream. Idempotent.
    fn close(&self);
}

// ============================================================================
// In-memory stream
// ============================================================================

enum PatchLink {
    None,
    Owned(Arc<MediaPatch>),
    Attached(Weak<MediaPatch>),
}

/// Queue-backed media stream
///
/// As a source, frames pushed with [`MemoryMediaStream::push`] are handed out
/// by `read_packet`, which blocks on a condition variable until a frame
/// arrives or the stream closes. As a sink, written frames are captured and
/// can be inspected with [`MemoryMediaStream::written`]. Write failures and
/// pausing can be injected.
pub struct MemoryMediaStream {
    id: StreamId,
    session_id: u32,
    is_source: bool,
    format: Mutex<MediaFormat>,
    open: AtomicBool,
    synchronous: bool,
    requires_thread: bool,
    paused: AtomicBool,
    fail_writes: AtomicBool,
    data_size: AtomicUsize,
    frame_time: AtomicU32,
    queue: Mutex<VecDeque<MediaFrame>>,
    queue_ready: Condvar,
    written: Mutex<Vec<MediaFrame>>,
    written_ready: Condvar,
    commands: Mutex<Vec<MediaCommand>>,
    patch: Mutex<PatchLink>,
    patch_started: AtomicBool,
    patch_stopped: AtomicBool,
}

impl MemoryMediaStream {
    fn new(format: MediaFormat, session_id: u32, is_source: bool) -> Self {
        Self {
            id: StreamId::next(),
            session_id,
            is_source,
            data_size: AtomicUsize::new(format.frame_size()),
            frame_time: AtomicU32::new(format.frame_time()),
            format: Mutex::new(format),
            open: AtomicBool::new(true),
            synchronous: false,
            requires_thread: true,
            paused: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            queue: Mutex::new(VecDeque::new()),
            queue_ready: Condvar::new(),
            written: Mutex::new(Vec::new()),
            written_ready: Condvar::new(),
            commands: Mutex::new(Vec::new()),
            patch: Mutex::new(PatchLink::None),
            patch_started: AtomicBool::new(false),
            patch_stopped: AtomicBool::new(false),
        }
    }

    /// New source stream
    pub fn source(format: MediaFormat, session_id: u32) -> Self {
        Self::new(format, session_id, true)
    }

    /// New sink stream
    pub fn sink(format: MediaFormat, session_id: u32) -> Self {
        Self::new(format, session_id, false)
    }

    /// Mark the stream as real-time paced
    #[must_use]
    pub fn synchronous(mut self, synchronous: bool) -> Self {
        self.synchronous = synchronous;
        self
    }

    /// Source whose patch is driven by [`MediaPatch::push_frame`] instead of a
    /// pump thread
    #[must_use]
    pub fn passive(mut self) -> Self {
        self.requires_thread = false;
        self
    }

    /// Queue a frame for reading
    pub fn push(&self, frame: MediaFrame) {
        self.queue.lock().push_back(frame);
        self.queue_ready.notify_one();
    }

    /// Frames queued but not yet read
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Frames written so far
    pub fn written(&self) -> Vec<MediaFrame> {
        self.written.lock().clone()
    }

    /// Number of frames written so far
    pub fn written_count(&self) -> usize {
        self.written.lock().len()
    }

    /// Wait until at least `count` frames were written. Returns false on timeout.
    pub fn wait_for_written(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut written = self.written.lock();
        while written.len() < count {
            if self.written_ready.wait_until(&mut written, deadline).timed_out() {
                return written.len() >= count;
            }
        }
        true
    }

    /// Make subsequent writes fail
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Pause or resume the stream
    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    /// Commands received so far
    pub fn commands(&self) -> Vec<MediaCommand> {
        self.commands.lock().clone()
    }

    /// Frame time per packet last set by [`MediaStream::set_data_size`]
    pub fn frame_time(&self) -> u32 {
        self.frame_time.load(Ordering::SeqCst)
    }

    /// Whether a patch pump started on this source
    pub fn patch_started(&self) -> bool {
        self.patch_started.load(Ordering::SeqCst)
    }

    /// Whether a patch pump stopped on this source
    pub fn patch_stopped(&self) -> bool {
        self.patch_stopped.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for MemoryMediaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryMediaStream")
            .field("id", &self.id)
            .field("session_id", &self.session_id)
            .field("is_source", &self.is_source)
            .field("format", &self.format.lock().name())
            .field("open", &self.is_open())
            .finish()
    }
}

impl MediaStream for MemoryMediaStream {
    fn id(&self) -> StreamId {
        self.id
    }

    fn media_format(&self) -> MediaFormat {
        self.format.lock().clone()
    }

    fn session_id(&self) -> u32 {
        self.session_id
    }

    fn is_source(&self) -> bool {
        self.is_source
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn read_packet(&self, frame: &mut MediaFrame) -> Result<(), StreamError> {
        if !self.is_source {
            return Err(StreamError::NotSource(self.id));
        }
        let mut queue = self.queue.lock();
        loop {
            if let Some(next) = queue.pop_front() {
                *frame = next;
                return Ok(());
            }
            if !self.is_open() {
                return Err(StreamError::Closed);
            }
            self.queue_ready.wait(&mut queue);
        }
    }

    fn write_packet(&self, frame: &MediaFrame) -> Result<(), StreamError> {
        if self.is_source {
            return Err(StreamError::NotSink(self.id));
        }
        if !self.is_open() {
            return Err(StreamError::Closed);
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StreamError::WriteFailed(format!("stream {} rejects writes", self.id)));
        }
        self.written.lock().push(frame.clone());
        self.written_ready.notify_all();
        Ok(())
    }

    fn data_size(&self) -> usize {
        self.data_size.load(Ordering::SeqCst)
    }

    fn set_data_size(&self, size: usize, frame_time: u32) {
        self.data_size.store(size, Ordering::SeqCst);
        self.frame_time.store(frame_time, Ordering::SeqCst);
    }

    fn is_synchronous(&self) -> bool {
        self.synchronous
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn execute_command(&self, command: &MediaCommand) -> bool {
        tracing::trace!(stream = %self.id, %command, "Stream command");
        self.commands.lock().push(command.clone());
        true
    }

    fn update_media_format(&self, format: &MediaFormat) -> bool {
        merge_format(&mut self.format.lock(), format)
    }

    fn patch(&self) -> Option<Arc<MediaPatch>> {
        match &*self.patch.lock() {
            PatchLink::None => None,
            PatchLink::Owned(patch) => Some(Arc::clone(patch)),
            PatchLink::Attached(patch) => patch.upgrade(),
        }
    }

    fn set_patch(&self, patch: Option<&Arc<MediaPatch>>) {
        let link = match patch {
            None => PatchLink::None,
            Some(patch) if self.is_source => PatchLink::Owned(Arc::clone(patch)),
            Some(patch) => PatchLink::Attached(Arc::downgrade(patch)),
        };
        // Drop the previous link outside the lock.
        let previous = std::mem::replace(&mut *self.patch.lock(), link);
        drop(previous);
    }

    fn requires_patch_thread(&self) -> bool {
        self.requires_thread
    }

    fn on_patch_start(&self) {
        self.patch_started.store(true, Ordering::SeqCst);
    }

    fn on_patch_stop(&self) {
        self.patch_stopped.store(true, Ordering::SeqCst);
    }

    fn close(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(stream = %self.id, source = self.is_source, "Closing media stream");
        {
            let _queue = self.queue.lock();
            self.queue_ready.notify_all();
        }

        let link = std::mem::replace(&mut *self.patch.lock(), PatchLink::None);
        match link {
            PatchLink::Owned(patch) => patch.close(),
            PatchLink::Attached(patch) => {
                if let Some(patch) = patch.upgrade() {
                    patch.remove_sink(self.id);
                }
            }
            PatchLink::None => {}
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::format::well_known;
    use std::thread;

    fn pcmu() -> MediaFormat {
        well_known::get(well_known::PCMU).unwrap()
    }

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(StreamId::next(), StreamId::next());
    }

    #[test]
    fn test_read_blocks_until_push() {
        let source = Arc::new(MemoryMediaStream::source(pcmu(), 1));
        let reader = Arc::clone(&source);
        let handle = thread::spawn(move || {
            let mut frame = MediaFrame::default();
            reader.read_packet(&mut frame).map(|()| frame.timestamp)
        });
        thread::sleep(Duration::from_millis(20));
        source.push(MediaFrame::new(0, 160, vec![0u8; 160]));
        assert_eq!(handle.join().unwrap(), Ok(160));
    }

    #[test]
    fn test_close_wakes_reader() {
        let source = Arc::new(MemoryMediaStream::source(pcmu(), 1));
        let reader = Arc::clone(&source);
        let handle = thread::spawn(move || {
            let mut frame = MediaFrame::default();
            reader.read_packet(&mut frame)
        });
        thread::sleep(Duration::from_millis(20));
        source.close();
        assert_eq!(handle.join().unwrap(), Err(StreamError::Closed));
        assert!(!source.is_open());
    }

    #[test]
    fn test_direction_is_enforced() {
        let source = MemoryMediaStream::source(pcmu(), 1);
        let sink = MemoryMediaStream::sink(pcmu(), 1);
        assert!(matches!(
            source.write_packet(&MediaFrame::default()),
            Err(StreamError::NotSink(_))
        ));
        let mut frame = MediaFrame::default();
        assert!(matches!(
            sink.read_packet(&mut frame),
            Err(StreamError::NotSource(_))
        ));
    }

    #[test]
    fn test_write_capture_and_failure_injection() {
        let sink = MemoryMediaStream::sink(pcmu(), 1);
        sink.write_packet(&MediaFrame::new(0, 0, vec![1u8])).unwrap();
        sink.set_fail_writes(true);
        assert!(sink.write_packet(&MediaFrame::default()).is_err());
        assert_eq!(sink.written_count(), 1);
        assert!(sink.wait_for_written(1, Duration::from_millis(1)));
        assert!(!sink.wait_for_written(2, Duration::from_millis(5)));
    }

    #[test]
    fn test_update_format_only_same_encoding() {
        let sink = MemoryMediaStream::sink(pcmu(), 1);
        let updated = pcmu().with_option(crate::format::options::TX_FRAMES_PER_PACKET, 30);
        assert!(sink.update_media_format(&updated));
        assert_eq!(sink.media_format().tx_frames_per_packet(), Some(30));
        assert!(!sink.update_media_format(&well_known::get(well_known::PCMA).unwrap()));
    }
}

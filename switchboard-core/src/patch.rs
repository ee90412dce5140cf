//! Media patch: one source stream, any number of sinks, a pump in between
//!
//! Each sink gets its own pipeline of zero, one or two transcoders. A pump
//! thread named `patch-<source id>` reads the source, runs filters and writes
//! through every sink pipeline. Two patches can be bypass-linked so that the
//! upstream patch writes raw frames straight into the downstream patch's
//! sinks while the downstream pump idles.
//!
//! Locking:
//! - `inner` (read/write) guards sinks, filters and the cached source format.
//!   Dispatch and statistics read it; sink and filter changes write it.
//! - `bypass` guards the link pointers. Link changes are additionally
//!   serialized process-wide by a wiring lock so two patches never update
//!   each other's links concurrently.
//! - Connection callbacks are never invoked with either lock held.

use crate::format::{options, MediaFormat, MediaType, PAYLOAD_TYPE_CN};
use crate::frame::MediaFrame;
use crate::rate::{BitRateController, RateController, RateDecision};
use crate::stream::{MediaStream, StreamId};
use crate::transcoder::{
    CommandNotifier, MediaCommand, Transcoder, TranscoderError, TranscoderRegistry,
};
use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use thread_priority::{set_current_thread_priority, ThreadPriority};

/// Media patch errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PatchError {
    /// Stream passed as a sink is a source
    #[error("Stream {0} is not a sink")]
    NotSink(StreamId),

    /// Stream passed as the source is a sink
    #[error("Stream {0} is not a source")]
    NotSource(StreamId),

    /// Transcoder could not be found or built
    #[error(transparent)]
    Transcoder(#[from] TranscoderError),

    /// Intermediate packet time does not divide the sink packet time
    #[error("Uneven frame ratio: {intermediate} frame time {intermediate_time} does not divide {sink_time}")]
    UnevenFrameRatio {
        /// Intermediate format name
        intermediate: String,
        /// Intermediate frame time
        intermediate_time: u32,
        /// Sink packet time
        sink_time: u32,
    },

    /// A sink pipeline failed to convert a frame
    #[error("Conversion failed on sink {sink}: {reason}")]
    Conversion {
        /// Sink stream
        sink: StreamId,
        /// Transcoder error text
        reason: String,
    },

    /// Bypass link request violates link rules
    #[error("Bypass rejected: {0}")]
    BypassRejected(String),

    /// Patch is closing or closed
    #[error("Patch closed")]
    Closed,

    /// Pump thread could not be spawned
    #[error("Failed to spawn patch thread: {0}")]
    Spawn(String),
}

/// Media patch tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatchConfig {
    /// Interval between throttle sleeps of an asynchronous pump (ms)
    pub throttle_interval_ms: u64,
    /// Length of each throttle sleep (ms)
    pub throttle_sleep_ms: u64,
    /// How long `close` waits for the pump thread (ms)
    pub close_timeout_ms: u64,
    /// Back-off between attempts to take the sink lock while closing (ms)
    pub close_retry_ms: u64,
    /// Re-check interval while the pump waits for a bypass to end (ms)
    pub read_poll_ms: u64,
    /// Attach bit-rate controllers to video sinks with a target bit rate
    pub video_rate_control: bool,
    /// Raise the pump thread above default priority
    pub elevated_priority: bool,
}

impl Default for PatchConfig {
    fn default() -> Self {
        Self {
            throttle_interval_ms: 100,
            throttle_sleep_ms: 10,
            close_timeout_ms: 5000,
            close_retry_ms: 10,
            read_poll_ms: 100,
            video_rate_control: true,
            elevated_priority: true,
        }
    }
}

impl PatchConfig {
    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }
}

/// Callback run on frames as they pass a pipeline stage
pub type FilterFn = Arc<dyn Fn(&mut MediaFrame, &MediaFormat) + Send + Sync>;

struct Filter {
    notifier: FilterFn,
    stage: Option<MediaFormat>,
}

impl Filter {
    fn is(&self, notifier: &FilterFn, stage: Option<&MediaFormat>) -> bool {
        same_notifier(&self.notifier, notifier)
            && match (&self.stage, stage) {
                (None, None) => true,
                (Some(a), Some(b)) => a.is_same(b),
                _ => false,
            }
    }
}

fn same_notifier(a: &FilterFn, b: &FilterFn) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// Run every filter registered for `stage`. Filters without a stage run
/// everywhere.
fn filter_frame(filters: &[Filter], frame: &mut MediaFrame, stage: &MediaFormat) {
    for filter in filters {
        let matches = filter.stage.as_ref().map_or(true, |s| s.is_same(stage));
        if matches {
            (filter.notifier)(frame, stage);
        }
    }
}

/// Whether `transcoder` must not be fed `frame`
fn cannot_transcode(transcoder: &dyn Transcoder, frame: &MediaFrame) -> bool {
    if frame.payload_type == PAYLOAD_TYPE_CN && transcoder.accept_comfort_noise() {
        return false;
    }
    if frame.is_empty() {
        return !transcoder.accept_empty_payload();
    }
    frame.payload_type != transcoder.input_format().payload_type()
        && !transcoder.accept_other_payloads()
}

// ============================================================================
// Sinks
// ============================================================================

#[derive(Default)]
struct Pipeline {
    primary: Option<Box<dyn Transcoder>>,
    secondary: Option<Box<dyn Transcoder>>,
    rate_controller: Option<Box<dyn RateController>>,
}

struct Sink {
    stream: Arc<dyn MediaStream>,
    pipeline: Mutex<Pipeline>,
    write_successful: AtomicBool,
    written: AtomicU64,
    dropped: AtomicU64,
    rate_dropped: AtomicU64,
}

impl Sink {
    fn new(stream: Arc<dyn MediaStream>, pipeline: Pipeline) -> Self {
        Self {
            stream,
            pipeline: Mutex::new(pipeline),
            write_successful: AtomicBool::new(true),
            written: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            rate_dropped: AtomicU64::new(0),
        }
    }

    /// Write to the stream, latching the sink dead on failure
    fn write_direct(&self, frame: &MediaFrame) -> bool {
        match self.stream.write_packet(frame) {
            Ok(()) => {
                self.written.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                tracing::debug!(stream = %self.stream.id(), error = %e, "Sink write failed, disabling sink");
                self.write_successful.store(false, Ordering::SeqCst);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Replace an untranscodable frame with an empty placeholder
    fn write_placeholder(&self, frame: &MediaFrame) -> bool {
        let mut placeholder = frame.clone();
        placeholder.payload = bytes::Bytes::new();
        placeholder.payload_type = self.stream.media_format().payload_type();
        self.write_direct(&placeholder)
    }

    fn conversion_error(&self, error: TranscoderError) -> PatchError {
        PatchError::Conversion {
            sink: self.stream.id(),
            reason: error.to_string(),
        }
    }

    fn write_frame(&self, frame: &mut MediaFrame, filters: &[Filter]) -> Result<bool, PatchError> {
        if !self.write_successful.load(Ordering::SeqCst) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(false);
        }
        if self.stream.is_paused() {
            return Ok(true);
        }

        let mut guard = self.pipeline.lock();
        let pipeline = &mut *guard;

        if let Some(controller) = pipeline.rate_controller.as_mut() {
            if let RateDecision::Skip {
                request_key_frame,
                substitutes,
            } = controller.decide(frame, Instant::now())
            {
                self.rate_dropped.fetch_add(1, Ordering::Relaxed);
                if request_key_frame {
                    self.stream.execute_command(&MediaCommand::VideoUpdatePicture);
                }
                for substitute in &substitutes {
                    if !self.write_direct(substitute) {
                        return Ok(false);
                    }
                }
                return Ok(true);
            }
        }

        let Some(primary) = pipeline.primary.as_mut() else {
            return Ok(self.write_direct(frame));
        };

        if cannot_transcode(&**primary, frame) {
            return Ok(self.write_placeholder(frame));
        }

        let intermediates = primary
            .convert(frame)
            .map_err(|e| self.conversion_error(e))?;

        let mut last_timestamp = None;
        for mut intermediate in intermediates {
            filter_frame(filters, &mut intermediate, primary.output_format());

            let Some(secondary) = pipeline.secondary.as_mut() else {
                if !self.write_direct(&intermediate) {
                    return Ok(false);
                }
                last_timestamp = Some(intermediate.timestamp);
                continue;
            };

            if cannot_transcode(&**secondary, &intermediate) {
                if !self.write_placeholder(&intermediate) {
                    return Ok(false);
                }
                last_timestamp = Some(intermediate.timestamp);
                continue;
            }

            let outputs = secondary
                .convert(&intermediate)
                .map_err(|e| self.conversion_error(e))?;
            for mut output in outputs {
                filter_frame(filters, &mut output, secondary.output_format());
                if !self.write_direct(&output) {
                    return Ok(false);
                }
                last_timestamp = Some(output.timestamp);
            }
        }

        if let Some(timestamp) = last_timestamp {
            frame.timestamp = timestamp;
        }
        Ok(true)
    }

    fn statistics(&self) -> SinkStatistics {
        let pipeline = self.pipeline.lock();
        let transcoders = [pipeline.primary.as_ref(), pipeline.secondary.as_ref()]
            .into_iter()
            .flatten()
            .map(|t| format!("{}->{}", t.input_format(), t.output_format()))
            .collect();
        SinkStatistics {
            stream: self.stream.id().value(),
            format: self.stream.media_format().name().to_string(),
            transcoders,
            rate_controlled: pipeline.rate_controller.is_some(),
            written: self.written.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            rate_dropped: self.rate_dropped.load(Ordering::Relaxed),
            failed: !self.write_successful.load(Ordering::SeqCst),
        }
    }
}

/// Counters for one sink
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkStatistics {
    /// Sink stream id
    pub stream: u64,
    /// Sink format name
    pub format: String,
    /// Transcoder chain, `input->output` per stage
    pub transcoders: Vec<String>,
    /// Whether a rate controller is attached
    pub rate_controlled: bool,
    /// Frames written to the stream
    pub written: u64,
    /// Frames lost to write failures or a dead sink
    pub dropped: u64,
    /// Frames skipped by the rate controller
    pub rate_dropped: u64,
    /// Sink latched dead after a write failure
    pub failed: bool,
}

/// Counters for a patch and its sinks
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchStatistics {
    /// Source stream id
    pub source: u64,
    /// Source format name
    pub source_format: String,
    /// Frames read from the source or pushed in
    pub frames_read: u64,
    /// Frames dropped because a conversion failed
    pub conversion_errors: u64,
    /// Frames forwarded through a bypass link
    pub bypassed_frames: u64,
    /// Per-sink counters
    pub sinks: Vec<SinkStatistics>,
}

// ============================================================================
// Patch
// ============================================================================

struct PatchInner {
    source_format: MediaFormat,
    sinks: Vec<Sink>,
    filters: Vec<Filter>,
}

#[derive(Default)]
struct BypassLinks {
    to: Option<Weak<MediaPatch>>,
    from: Option<Weak<MediaPatch>>,
    active: bool,
}

static BYPASS_WIRING: Mutex<()> = parking_lot::const_mutex(());

/// Connects one source stream to its sinks through transcoding pipelines
pub struct MediaPatch {
    this: Weak<MediaPatch>,
    source: Arc<dyn MediaStream>,
    registry: Arc<TranscoderRegistry>,
    config: PatchConfig,
    requires_thread: bool,
    inner: RwLock<PatchInner>,
    bypass: Mutex<BypassLinks>,
    bypass_ended: Condvar,
    thread: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
    closing: AtomicBool,
    finished: Mutex<bool>,
    finished_signal: Condvar,
    frames_read: AtomicU64,
    conversion_errors: AtomicU64,
    bypassed_frames: AtomicU64,
}

impl fmt::Debug for MediaPatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaPatch")
            .field("source", &self.source.id())
            .field("sinks", &self.sink_count())
            .field("requires_thread", &self.requires_thread)
            .field("closing", &self.closing.load(Ordering::SeqCst))
            .finish()
    }
}

impl MediaPatch {
    /// Create a patch for `source` and attach it to the stream.
    ///
    /// The source keeps the patch alive until either is closed.
    ///
    /// # Errors
    ///
    /// Returns error if `source` is not a source stream
    pub fn new(
        source: Arc<dyn MediaStream>,
        registry: Arc<TranscoderRegistry>,
        config: PatchConfig,
        requires_thread: bool,
    ) -> Result<Arc<Self>, PatchError> {
        if !source.is_source() {
            return Err(PatchError::NotSource(source.id()));
        }
        let source_format = source.media_format();
        let patch = Arc::new_cyclic(|this| Self {
            this: this.clone(),
            source: Arc::clone(&source),
            registry,
            config,
            requires_thread,
            inner: RwLock::new(PatchInner {
                source_format,
                sinks: Vec::new(),
                filters: Vec::new(),
            }),
            bypass: Mutex::new(BypassLinks::default()),
            bypass_ended: Condvar::new(),
            thread: Mutex::new(None),
            started: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            finished: Mutex::new(false),
            finished_signal: Condvar::new(),
            frames_read: AtomicU64::new(0),
            conversion_errors: AtomicU64::new(0),
            bypassed_frames: AtomicU64::new(0),
        });
        source.set_patch(Some(&patch));
        tracing::debug!(patch = %source.id(), format = %patch.source_format(), requires_thread, "Created media patch");
        Ok(patch)
    }

    fn arc(&self) -> Result<Arc<Self>, PatchError> {
        self.this.upgrade().ok_or(PatchError::Closed)
    }

    /// Source stream
    pub fn source(&self) -> &Arc<dyn MediaStream> {
        &self.source
    }

    /// Current source format
    pub fn source_format(&self) -> MediaFormat {
        self.inner.read().source_format.clone()
    }

    /// Whether the patch runs its own pump thread
    pub fn requires_thread(&self) -> bool {
        self.requires_thread
    }

    /// Whether `start` has been called
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Number of sinks
    pub fn sink_count(&self) -> usize {
        self.inner.read().sinks.len()
    }

    /// Sink streams in insertion order
    pub fn sink_streams(&self) -> Vec<Arc<dyn MediaStream>> {
        self.inner
            .read()
            .sinks
            .iter()
            .map(|s| Arc::clone(&s.stream))
            .collect()
    }

    /// Sink stream by id
    pub fn sink_stream(&self, id: StreamId) -> Option<Arc<dyn MediaStream>> {
        self.inner
            .read()
            .sinks
            .iter()
            .find(|s| s.stream.id() == id)
            .map(|s| Arc::clone(&s.stream))
    }

    /// Add a sink, building the transcoders needed to reach its format.
    ///
    /// Adding a stream that is already a sink replaces its record, which
    /// also clears a latched write failure.
    ///
    /// # Errors
    ///
    /// Returns error if the stream is not a sink, no transcoder path exists,
    /// or an audio intermediate cannot be framed evenly
    pub fn add_sink(&self, stream: Arc<dyn MediaStream>) -> Result<(), PatchError> {
        if !stream.is_sink() {
            return Err(PatchError::NotSink(stream.id()));
        }
        if self.is_closed() {
            return Err(PatchError::Closed);
        }

        let source_format = self.source_format();
        let sink_format = stream.media_format();
        let mut pipeline = Pipeline::default();

        if source_format.is_same(&sink_format) {
            let frames = sink_format
                .tx_frames_per_packet()
                .or_else(|| source_format.tx_frames_per_packet())
                .unwrap_or(1)
                .max(1);
            let size = source_format.frame_size() * frames as usize;
            let time = source_format.frame_time() * frames;
            stream.set_data_size(size, time);
            self.source.set_data_size(size, time);
        } else {
            let (primary, secondary) = self.build_transcoders(&source_format, &sink_format)?;
            let last = secondary.as_ref().unwrap_or(&primary);
            let sink_frames = sink_format.tx_frames_per_packet().unwrap_or(1).max(1);
            let source_frames = source_format.tx_frames_per_packet().unwrap_or(1).max(1);
            stream.set_data_size(
                last.optimal_data_frame_size(false),
                sink_format.frame_time() * sink_frames,
            );
            self.source.set_data_size(
                primary.optimal_data_frame_size(true),
                source_format.frame_time() * source_frames,
            );
            pipeline.primary = Some(primary);
            pipeline.secondary = secondary;
        }

        if self.config.video_rate_control && sink_format.media_type() == MediaType::Video {
            if let Some(controller) = BitRateController::for_format(&sink_format) {
                tracing::debug!(patch = %self.source.id(), stream = %stream.id(), "Video rate control enabled");
                pipeline.rate_controller = Some(Box::new(controller));
            }
        }

        let patch = self.arc()?;
        stream.set_patch(Some(&patch));

        let id = stream.id();
        let sink = Sink::new(stream, pipeline);
        {
            let mut inner = self.inner.write();
            inner.sinks.retain(|s| s.stream.id() != id);
            inner.sinks.push(sink);
        }
        tracing::debug!(patch = %self.source.id(), stream = %id, from = %source_format, to = %sink_format, "Added sink");
        Ok(())
    }

    fn build_transcoders(
        &self,
        source_format: &MediaFormat,
        sink_format: &MediaFormat,
    ) -> Result<(Box<dyn Transcoder>, Option<Box<dyn Transcoder>>), PatchError> {
        let notifier = self.command_notifier();

        if self.registry.has_transcoder(source_format, sink_format) {
            let mut primary = self.registry.create(source_format, sink_format)?;
            primary.set_command_notifier(notifier);
            return Ok((primary, None));
        }

        let mut intermediate = self
            .registry
            .find_intermediate(source_format, sink_format)
            .ok_or_else(|| TranscoderError::NoTranscoder {
                from: source_format.name().to_string(),
                to: sink_format.name().to_string(),
            })?;

        if intermediate.media_type() == MediaType::Audio {
            let sink_frames = sink_format.tx_frames_per_packet().unwrap_or(1).max(1);
            let sink_time = sink_format.frame_time() * sink_frames;
            let intermediate_time = intermediate.frame_time();
            if intermediate_time == 0 || sink_time % intermediate_time != 0 {
                return Err(PatchError::UnevenFrameRatio {
                    intermediate: intermediate.name().to_string(),
                    intermediate_time,
                    sink_time,
                });
            }
            intermediate.set_option(options::TX_FRAMES_PER_PACKET, sink_time / intermediate_time);
        }

        let mut primary = self.registry.create(source_format, &intermediate)?;
        let mut secondary = self.registry.create(&intermediate, sink_format)?;
        primary.set_command_notifier(Arc::clone(&notifier));
        secondary.set_command_notifier(notifier);
        tracing::debug!(
            patch = %self.source.id(),
            from = %source_format,
            via = %intermediate,
            to = %sink_format,
            "Two-stage transcoding"
        );
        Ok((primary, Some(secondary)))
    }

    fn command_notifier(&self) -> CommandNotifier {
        let source = Arc::downgrade(&self.source);
        Arc::new(move |command: &MediaCommand| {
            if let Some(source) = source.upgrade() {
                source.execute_command(command);
            }
        })
    }

    /// Remove a sink. Removing the last sink also drops an upstream bypass.
    pub fn remove_sink(&self, id: StreamId) -> bool {
        let (removed, now_empty) = {
            let mut inner = self.inner.write();
            let Some(pos) = inner.sinks.iter().position(|s| s.stream.id() == id) else {
                return false;
            };
            let removed = inner.sinks.remove(pos);
            (removed, inner.sinks.is_empty())
        };
        removed.stream.set_patch(None);
        tracing::debug!(patch = %self.source.id(), stream = %id, "Removed sink");

        if now_empty {
            if let Some(upstream) = self.bypass_source() {
                if let Err(e) = upstream.set_bypass_patch(None) {
                    tracing::warn!(patch = %self.source.id(), error = %e, "Failed to clear upstream bypass");
                }
            }
        }
        true
    }

    /// Register a filter for a stage (`None` = every stage).
    /// Returns false if the same filter is already registered for the stage.
    pub fn add_filter(&self, notifier: FilterFn, stage: Option<MediaFormat>) -> bool {
        let mut inner = self.inner.write();
        if inner.filters.iter().any(|f| f.is(&notifier, stage.as_ref())) {
            return false;
        }
        inner.filters.push(Filter { notifier, stage });
        true
    }

    /// Remove a filter registration. Returns false if it was not registered.
    pub fn remove_filter(&self, notifier: &FilterFn, stage: Option<&MediaFormat>) -> bool {
        let mut inner = self.inner.write();
        let before = inner.filters.len();
        inner.filters.retain(|f| !f.is(notifier, stage));
        inner.filters.len() != before
    }

    /// Number of registered filters
    pub fn filter_count(&self) -> usize {
        self.inner.read().filters.len()
    }

    // ------------------------------------------------------------------------
    // Bypass
    // ------------------------------------------------------------------------

    /// Patch this one forwards raw frames into
    pub fn bypass_target(&self) -> Option<Arc<MediaPatch>> {
        self.bypass.lock().to.as_ref().and_then(Weak::upgrade)
    }

    /// Patch forwarding raw frames into this one
    pub fn bypass_source(&self) -> Option<Arc<MediaPatch>> {
        self.bypass.lock().from.as_ref().and_then(Weak::upgrade)
    }

    /// Whether frames are currently forwarded through the bypass link
    pub fn is_bypass_active(&self) -> bool {
        let links = self.bypass.lock();
        links.active && links.to.is_some()
    }

    /// Link (or with `None`, unlink) this patch to a downstream bypass target.
    ///
    /// Audio bypasses become active immediately. Video bypasses activate on
    /// the next key frame seen by a sink's primary transcoder.
    ///
    /// # Errors
    ///
    /// Returns error if this patch is itself a bypass target, the target is
    /// this patch, or the target already takes part in another link
    pub fn set_bypass_patch(&self, target: Option<&Arc<MediaPatch>>) -> Result<(), PatchError> {
        let _wiring = BYPASS_WIRING.lock();

        {
            let links = self.bypass.lock();
            if links.from.is_some() {
                tracing::error!(patch = %self.source.id(), "Bypass requested on a patch that is a bypass target");
                return Err(PatchError::BypassRejected(
                    "patch is already a bypass target".to_string(),
                ));
            }
            let current = links.to.as_ref().and_then(Weak::upgrade);
            match (&current, target) {
                (Some(current), Some(target)) if Arc::ptr_eq(current, target) => return Ok(()),
                (None, None) => return Ok(()),
                _ => {}
            }
        }

        if let Some(target) = target {
            if std::ptr::eq(Arc::as_ptr(target), self) {
                tracing::error!(patch = %self.source.id(), "Bypass to self rejected");
                return Err(PatchError::BypassRejected("patch cannot bypass to itself".to_string()));
            }
            let target_links = target.bypass.lock();
            if target_links.from.is_some() || target_links.to.is_some() {
                tracing::error!(patch = %self.source.id(), target = %target.source.id(), "Bypass target already linked");
                return Err(PatchError::BypassRejected(
                    "target already takes part in a bypass".to_string(),
                ));
            }
        }

        let previous = {
            let mut links = self.bypass.lock();
            links.active = false;
            links.to.take().and_then(|w| w.upgrade())
        };
        if let Some(previous) = previous {
            previous.bypass.lock().from = None;
            previous.bypass_ended.notify_all();
            tracing::debug!(patch = %self.source.id(), target = %previous.source.id(), "Bypass ended");
        }

        if let Some(target) = target {
            target.bypass.lock().from = Some(self.this.clone());
            let immediate = self.source_format().media_type() != MediaType::Video;
            let mut links = self.bypass.lock();
            links.to = Some(Arc::downgrade(target));
            links.active = immediate;
            tracing::debug!(patch = %self.source.id(), target = %target.source.id(), active = immediate, "Bypass linked");
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Frame flow
    // ------------------------------------------------------------------------

    /// Start the pump thread. Passive patches and repeated calls do nothing.
    ///
    /// # Errors
    ///
    /// Returns error if the patch is closed or the thread cannot be spawned
    pub fn start(&self) -> Result<(), PatchError> {
        if self.is_closed() {
            return Err(PatchError::Closed);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if !self.requires_thread {
            tracing::debug!(patch = %self.source.id(), "Passive patch started");
            return Ok(());
        }

        let patch = self.arc()?;
        let handle = thread::Builder::new()
            .name(format!("patch-{}", self.source.id()))
            .spawn(move || patch.run())
            .map_err(|e| PatchError::Spawn(e.to_string()))?;
        *self.thread.lock() = Some(handle);
        Ok(())
    }

    fn run(&self) {
        let id = self.source.id();
        if self.config.elevated_priority {
            if let Err(e) = set_current_thread_priority(ThreadPriority::Max) {
                tracing::warn!(patch = %id, error = ?e, "Could not raise patch thread priority");
            }
        }
        tracing::debug!(patch = %id, "Media patch thread started");
        self.source.on_patch_start();

        let asynchronous = !self.source.is_synchronous()
            && !self
                .inner
                .read()
                .sinks
                .iter()
                .any(|s| s.stream.is_synchronous());
        let throttle_interval = PatchConfig::ms(self.config.throttle_interval_ms);
        let throttle_sleep = PatchConfig::ms(self.config.throttle_sleep_ms);

        let mut frame = MediaFrame::default();
        let mut last_throttle = Instant::now();
        while self.source.is_open() {
            frame.reset();
            if let Err(e) = self.source.read_packet(&mut frame) {
                tracing::debug!(patch = %id, error = %e, "Source read ended");
                break;
            }
            self.frames_read.fetch_add(1, Ordering::Relaxed);

            match self.dispatch_frame(&mut frame) {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(patch = %id, "No sink accepted the frame, stopping");
                    break;
                }
                Err(e) => tracing::trace!(patch = %id, error = %e, "Frame dropped"),
            }

            if asynchronous && last_throttle.elapsed() >= throttle_interval {
                thread::sleep(throttle_sleep);
                last_throttle = Instant::now();
            }
        }

        self.source.on_patch_stop();
        *self.finished.lock() = true;
        self.finished_signal.notify_all();
        tracing::debug!(patch = %id, "Media patch thread ended");
    }

    /// Dispatch a frame on the caller's thread (passive patches)
    ///
    /// # Errors
    ///
    /// Returns error if a sink pipeline fails to convert the frame
    pub fn push_frame(&self, frame: &mut MediaFrame) -> Result<bool, PatchError> {
        if self.is_closed() {
            return Ok(false);
        }
        self.frames_read.fetch_add(1, Ordering::Relaxed);
        self.dispatch_frame(frame)
    }

    fn dispatch_frame(&self, frame: &mut MediaFrame) -> Result<bool, PatchError> {
        {
            let mut links = self.bypass.lock();
            if links.from.is_some() {
                let poll = PatchConfig::ms(self.config.read_poll_ms);
                while links.from.is_some() && self.source.is_open() {
                    self.bypass_ended.wait_for(&mut links, poll);
                }
                return Ok(true);
            }
        }

        let (target, active) = {
            let links = self.bypass.lock();
            (links.to.as_ref().and_then(Weak::upgrade), links.active)
        };

        let inner = self.inner.read();
        filter_frame(&inner.filters, frame, &inner.source_format);

        if let (Some(target), true) = (&target, active) {
            drop(inner);
            return Ok(self.write_bypassed(target, frame));
        }

        let mut written = false;
        let mut failure = None;
        for sink in &inner.sinks {
            match sink.write_frame(frame, &inner.filters) {
                Ok(ok) => written |= ok,
                Err(e) => {
                    if failure.is_none() {
                        failure = Some(e);
                    }
                }
            }
        }

        if target.is_some() && inner.source_format.media_type() == MediaType::Video {
            let key_frame = inner.sinks.iter().any(|s| {
                s.pipeline
                    .lock()
                    .primary
                    .as_ref()
                    .is_some_and(|t| t.was_last_frame_key())
            });
            if key_frame {
                self.bypass.lock().active = true;
                tracing::debug!(patch = %self.source.id(), "Video bypass activated on key frame");
            }
        }

        match failure {
            Some(e) => {
                self.conversion_errors.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
            None => Ok(written),
        }
    }

    fn write_bypassed(&self, target: &MediaPatch, frame: &MediaFrame) -> bool {
        self.bypassed_frames.fetch_add(1, Ordering::Relaxed);
        let inner = target.inner.read();
        let mut written = false;
        for sink in &inner.sinks {
            if sink.write_successful.load(Ordering::SeqCst) && !sink.stream.is_paused() {
                written |= sink.write_direct(frame);
            }
        }
        written
    }

    // ------------------------------------------------------------------------
    // Control
    // ------------------------------------------------------------------------

    /// Forward a command to each sink's encoder stage. True if any accepted.
    pub fn execute_command(&self, command: &MediaCommand) -> bool {
        let inner = self.inner.read();
        let mut handled = false;
        for sink in &inner.sinks {
            let mut guard = sink.pipeline.lock();
            let pipeline = &mut *guard;
            let encoder = match (pipeline.secondary.as_mut(), pipeline.primary.as_mut()) {
                (Some(secondary), _) => Some(secondary),
                (None, primary) => primary,
            };
            if let Some(encoder) = encoder {
                handled |= encoder.execute_command(command);
            }
        }
        tracing::debug!(patch = %self.source.id(), %command, handled, "Patch command");
        handled
    }

    /// Apply updated format options to the source and sink pipelines.
    /// True if any stage accepted the update.
    pub fn update_media_format(&self, format: &MediaFormat) -> bool {
        let mut inner = self.inner.write();
        let mut accepted = false;

        if inner.source_format.is_same(format) {
            inner.source_format.merge_options(format);
            self.source.update_media_format(format);
            accepted = true;
        }

        for sink in &inner.sinks {
            let mut guard = sink.pipeline.lock();
            let pipeline = &mut *guard;
            let Some(primary) = pipeline.primary.as_mut() else {
                accepted |= sink.stream.update_media_format(format);
                continue;
            };
            if let Some(secondary) = pipeline
                .secondary
                .as_mut()
                .filter(|s| s.output_format().is_same(format))
            {
                let input = secondary.input_format().clone();
                if secondary.update_media_formats(&input, format) {
                    sink.stream.update_media_format(format);
                    accepted = true;
                }
            } else if primary.output_format().is_same(format) {
                let input = primary.input_format().clone();
                if primary.update_media_formats(&input, format) {
                    if pipeline.secondary.is_none() {
                        sink.stream.update_media_format(format);
                    }
                    accepted = true;
                }
            } else {
                let output = primary.output_format().clone();
                accepted |= primary.update_media_formats(format, &output);
            }
        }
        accepted
    }

    /// Counters for the patch and every sink
    pub fn statistics(&self) -> PatchStatistics {
        let inner = self.inner.read();
        PatchStatistics {
            source: self.source.id().value(),
            source_format: inner.source_format.name().to_string(),
            frames_read: self.frames_read.load(Ordering::Relaxed),
            conversion_errors: self.conversion_errors.load(Ordering::Relaxed),
            bypassed_frames: self.bypassed_frames.load(Ordering::Relaxed),
            sinks: inner.sinks.iter().map(Sink::statistics).collect(),
        }
    }

    /// Close the patch: unlink bypasses, drop filters, close the source and
    /// every sink, then wait for the pump thread. Idempotent.
    pub fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        let id = self.source.id();
        tracing::debug!(patch = %id, "Closing media patch");

        if let Some(upstream) = self.bypass_source() {
            if let Err(e) = upstream.set_bypass_patch(None) {
                tracing::warn!(patch = %id, error = %e, "Failed to clear upstream bypass");
            }
        }
        if let Err(e) = self.set_bypass_patch(None) {
            tracing::warn!(patch = %id, error = %e, "Failed to clear bypass");
        }

        self.inner.write().filters.clear();
        self.source.close();
        self.source.set_patch(None);

        let retry = PatchConfig::ms(self.config.close_retry_ms);
        loop {
            let Some(mut inner) = self.inner.try_write_for(retry) else {
                tracing::trace!(patch = %id, "Sink list busy, retrying close");
                thread::sleep(retry);
                continue;
            };
            let Some(sink) = inner.sinks.pop() else {
                break;
            };
            drop(inner);
            sink.stream.set_patch(None);
            sink.stream.close();
        }

        self.join();
    }

    fn join(&self) {
        let Some(handle) = self.thread.lock().take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            tracing::debug!(patch = %self.source.id(), "Patch closed from its own thread");
            return;
        }

        let deadline = Instant::now() + PatchConfig::ms(self.config.close_timeout_ms);
        let finished = {
            let mut finished = self.finished.lock();
            while !*finished {
                if self
                    .finished_signal
                    .wait_until(&mut finished, deadline)
                    .timed_out()
                {
                    break;
                }
            }
            *finished
        };

        if finished {
            if handle.join().is_err() {
                tracing::error!(patch = %self.source.id(), "Media patch thread panicked");
            }
        } else {
            tracing::error!(patch = %self.source.id(), "Media patch thread did not stop in time");
            debug_assert!(finished, "media patch thread did not stop in time");
        }
    }
}

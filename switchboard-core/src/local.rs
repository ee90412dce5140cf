//! In-process endpoint backed by memory streams
//!
//! The local endpoint (prefix `local`) stands in for a user at this host:
//! its connections answer automatically, open their media as soon as they
//! are connected and capture whatever user input the far side sends.
//! Frames are fed into and read out of the [`MemoryMediaStream`]s a
//! connection opens.
//!
//! The first connection made in a call is the originating one: it connects
//! immediately so the call can dial party B. Later connections are incoming
//! and ring until answered.

use crate::call::{Call, CallError};
use crate::connection::{Connection, ConnectionPhase, Endpoint};
use crate::format::{MediaFormat, MediaFormatList, MediaType};
use crate::frame::MediaFrame;
use crate::patch::{FilterFn, MediaPatch};
use crate::stream::{MediaStream, MemoryMediaStream, StreamError};
use crate::types::CallEndReason;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Local endpoint configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalEndpointConfig {
    /// Address prefix
    pub prefix: String,
    /// Supported formats by name, aliases allowed
    pub formats: Vec<String>,
    /// Answer incoming connections without waiting for [`LocalConnection::accept`]
    pub auto_answer: bool,
    /// Open audio and video media when connected
    pub autostart: bool,
    /// Create real-time paced streams
    pub synchronous: bool,
    /// Offer media bypass for every session
    pub media_bypass: bool,
}

impl Default for LocalEndpointConfig {
    fn default() -> Self {
        Self {
            prefix: "local".to_string(),
            formats: vec!["PCMU".to_string(), "PCMA".to_string()],
            auto_answer: true,
            autostart: true,
            synchronous: false,
            media_bypass: false,
        }
    }
}

/// Session used for each media type
pub fn default_session_id(media_type: MediaType) -> u32 {
    match media_type {
        MediaType::Audio => 1,
        MediaType::Video => 2,
        MediaType::Fax => 3,
        MediaType::UserInput => 4,
    }
}

/// In-process endpoint
pub struct LocalEndpoint {
    this: Weak<LocalEndpoint>,
    config: LocalEndpointConfig,
    formats: MediaFormatList,
    connections: RwLock<HashMap<String, Arc<LocalConnection>>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for LocalEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalEndpoint")
            .field("prefix", &self.config.prefix)
            .field("formats", &self.formats.names())
            .field("connections", &self.connections.read().len())
            .finish()
    }
}

impl LocalEndpoint {
    /// Create an endpoint
    ///
    /// # Errors
    ///
    /// Returns error if a configured format name is unknown
    pub fn new(config: LocalEndpointConfig) -> Result<Arc<Self>, CallError> {
        let formats = MediaFormatList::from_names(&config.formats)
            .map_err(|e| CallError::ConnectionFailed(e.to_string()))?;
        Ok(Arc::new_cyclic(|this| Self {
            this: this.clone(),
            config,
            formats,
            connections: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }))
    }

    /// Configuration
    pub fn config(&self) -> &LocalEndpointConfig {
        &self.config
    }

    /// Live connection by token
    pub fn find_connection(&self, token: &str) -> Option<Arc<LocalConnection>> {
        self.connections.read().get(token).cloned()
    }

    /// Live connections
    pub fn connections(&self) -> Vec<Arc<LocalConnection>> {
        self.connections.read().values().cloned().collect()
    }

    fn forget(&self, token: &str) {
        self.connections.write().remove(token);
    }
}

impl Endpoint for LocalEndpoint {
    fn prefix(&self) -> &str {
        &self.config.prefix
    }

    fn media_formats(&self) -> MediaFormatList {
        self.formats.clone()
    }

    fn make_connection(
        &self,
        call: &Arc<Call>,
        address: &str,
    ) -> Result<Arc<dyn Connection>, CallError> {
        let remote = address
            .split_once(':')
            .map_or(address, |(_, rest)| rest)
            .to_string();
        if remote.is_empty() {
            return Err(CallError::ConnectionFailed(address.to_string()));
        }
        let token = format!(
            "{}/{}",
            self.config.prefix,
            self.next_id.fetch_add(1, Ordering::Relaxed)
        );
        let connection = Arc::new(LocalConnection {
            token: token.clone(),
            endpoint: self.this.clone(),
            call: Arc::downgrade(call),
            remote_party: Mutex::new(remote),
            originating: call.connection_count() == 0,
            formats: self.formats.clone(),
            auto_answer: self.config.auto_answer,
            autostart: self.config.autostart,
            synchronous: self.config.synchronous,
            media_bypass: self.config.media_bypass,
            phase: Mutex::new(ConnectionPhase::Uninitialised),
            end_reason: Mutex::new(None),
            streams: Mutex::new(Vec::new()),
            alerted_by: Mutex::new(None),
            on_hold: AtomicBool::new(false),
            user_input: Mutex::new(Vec::new()),
            recording: AtomicBool::new(false),
            taps: Mutex::new(Vec::new()),
        });
        tracing::debug!(connection = %token, call = %call.token(), originating = connection.originating, "Local connection created");
        self.connections
            .write()
            .insert(token, Arc::clone(&connection));
        Ok(connection)
    }
}

struct RecordingTap {
    channel: String,
    patch: Weak<MediaPatch>,
    filter: FilterFn,
    stage: MediaFormat,
}

/// Connection of the local endpoint
pub struct LocalConnection {
    token: String,
    endpoint: Weak<LocalEndpoint>,
    call: Weak<Call>,
    remote_party: Mutex<String>,
    originating: bool,
    formats: MediaFormatList,
    auto_answer: bool,
    autostart: bool,
    synchronous: bool,
    media_bypass: bool,
    phase: Mutex<ConnectionPhase>,
    end_reason: Mutex<Option<CallEndReason>>,
    streams: Mutex<Vec<Arc<MemoryMediaStream>>>,
    alerted_by: Mutex<Option<String>>,
    on_hold: AtomicBool,
    user_input: Mutex<Vec<String>>,
    recording: AtomicBool,
    taps: Mutex<Vec<RecordingTap>>,
}

impl std::fmt::Debug for LocalConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalConnection")
            .field("token", &self.token)
            .field("phase", &*self.phase.lock())
            .field("originating", &self.originating)
            .finish()
    }
}

impl LocalConnection {
    fn owner(&self) -> Option<Arc<Call>> {
        self.call.upgrade()
    }

    /// True for the connection that started the call
    pub fn is_originating(&self) -> bool {
        self.originating
    }

    /// Name passed with the last alerting indication
    pub fn alerted_by(&self) -> Option<String> {
        self.alerted_by.lock().clone()
    }

    /// User input received from the far side
    pub fn user_input(&self) -> Vec<String> {
        self.user_input.lock().clone()
    }

    /// Open source stream for a session
    pub fn source_stream(&self, session_id: u32) -> Option<Arc<MemoryMediaStream>> {
        self.find_stream(session_id, true)
    }

    /// Open sink stream for a session
    pub fn sink_stream(&self, session_id: u32) -> Option<Arc<MemoryMediaStream>> {
        self.find_stream(session_id, false)
    }

    fn find_stream(&self, session_id: u32, is_source: bool) -> Option<Arc<MemoryMediaStream>> {
        self.streams
            .lock()
            .iter()
            .find(|s| s.session_id() == session_id && s.is_source() == is_source && s.is_open())
            .cloned()
    }

    /// Answer a ringing incoming connection
    pub fn accept(&self) -> bool {
        {
            let mut phase = self.phase.lock();
            if *phase >= ConnectionPhase::Connected {
                return false;
            }
            *phase = ConnectionPhase::Connected;
        }
        tracing::info!(connection = %self.token, "Local connection answered");
        if let Some(call) = self.owner() {
            call.on_connected(self);
        }
        self.establish();
        true
    }

    /// Send user input towards the other connections of the call
    pub fn send_user_input(&self, value: &str) {
        if let Some(call) = self.owner() {
            call.on_user_input_string(self, value);
        }
    }

    /// Open this connection's source media and move to established
    fn establish(&self) {
        if self.autostart {
            self.open_media();
        }
        {
            let mut phase = self.phase.lock();
            if *phase != ConnectionPhase::Connected {
                return;
            }
            *phase = ConnectionPhase::Established;
        }
        if let Some(call) = self.owner() {
            call.on_established(self);
        }
    }

    fn open_media(&self) {
        let Some(call) = self.owner() else {
            return;
        };
        for media_type in [MediaType::Audio, MediaType::Video] {
            if !self.formats.iter().any(|f| f.media_type() == media_type) {
                continue;
            }
            let session_id = default_session_id(media_type);
            if let Err(e) = call.open_source_media_streams(self, media_type, session_id, None, None) {
                tracing::warn!(connection = %self.token, %media_type, error = %e, "Could not open media");
            }
        }
    }

    fn add_tap(&self, call: &Arc<Call>, patch: &Arc<MediaPatch>) {
        let stage = patch.source_format();
        let channel = format!("{}#{}", self.token, patch.source().session_id());
        if !call.open_recording_channel(&channel, &stage) {
            return;
        }
        let weak_call = Arc::downgrade(call);
        let tap_channel = channel.clone();
        let filter: FilterFn = Arc::new(move |frame: &mut MediaFrame, format: &MediaFormat| {
            let Some(call) = weak_call.upgrade() else {
                return;
            };
            match format.media_type() {
                MediaType::Video => call.on_record_video(&tap_channel, frame),
                _ => call.on_record_audio(&tap_channel, frame),
            }
        });
        patch.add_filter(Arc::clone(&filter), Some(stage.clone()));
        self.taps.lock().push(RecordingTap {
            channel,
            patch: Arc::downgrade(patch),
            filter,
            stage,
        });
    }
}

impl Connection for LocalConnection {
    fn token(&self) -> String {
        self.token.clone()
    }

    fn prefix(&self) -> String {
        self.endpoint
            .upgrade()
            .map(|e| e.config.prefix.clone())
            .unwrap_or_else(|| "local".to_string())
    }

    fn remote_party_name(&self) -> String {
        self.remote_party.lock().clone()
    }

    fn phase(&self) -> ConnectionPhase {
        *self.phase.lock()
    }

    fn set_phase(&self, phase: ConnectionPhase) {
        *self.phase.lock() = phase;
    }

    fn media_formats(&self) -> MediaFormatList {
        self.formats.clone()
    }

    fn open_media_stream(
        &self,
        format: &MediaFormat,
        session_id: u32,
        is_source: bool,
    ) -> Result<Arc<dyn MediaStream>, StreamError> {
        if self.phase().is_releasing() {
            return Err(StreamError::OpenFailed(format!(
                "connection {} is releasing",
                self.token
            )));
        }
        if !self.formats.contains(format.name()) {
            return Err(StreamError::OpenFailed(format!(
                "{} not supported by {}",
                format, self.token
            )));
        }
        let stream = if is_source {
            MemoryMediaStream::source(format.clone(), session_id)
        } else {
            MemoryMediaStream::sink(format.clone(), session_id)
        };
        let stream = Arc::new(stream.synchronous(self.synchronous));

        let mut streams = self.streams.lock();
        streams.retain(|s| s.is_open());
        streams.push(Arc::clone(&stream));
        tracing::debug!(connection = %self.token, stream = %stream.id(), %format, session_id, is_source, "Opened media stream");
        Ok(stream)
    }

    fn media_streams(&self) -> Vec<Arc<dyn MediaStream>> {
        self.streams
            .lock()
            .iter()
            .filter(|s| s.is_open())
            .map(|s| Arc::clone(s) as Arc<dyn MediaStream>)
            .collect()
    }

    fn next_session_id(&self, media_type: MediaType, _is_source: bool) -> u32 {
        default_session_id(media_type)
    }

    fn set_up_connection(&self) -> bool {
        {
            let mut phase = self.phase.lock();
            if *phase != ConnectionPhase::Uninitialised {
                return false;
            }
            *phase = ConnectionPhase::SetUp;
        }
        let Some(call) = self.owner() else {
            return false;
        };

        if self.originating {
            tracing::debug!(connection = %self.token, "Originating local connection set up");
            call.on_connected(self);
            return !self.phase().is_releasing();
        }

        self.set_phase(ConnectionPhase::Alerting);
        call.on_alerting(self);
        if self.auto_answer {
            self.accept();
        }
        !self.phase().is_releasing()
    }

    fn set_alerting(&self, caller_name: &str, with_media: bool) -> bool {
        tracing::debug!(connection = %self.token, caller = %caller_name, with_media, "Remote alerting");
        *self.alerted_by.lock() = Some(caller_name.to_string());
        let mut phase = self.phase.lock();
        if *phase < ConnectionPhase::Alerting {
            *phase = ConnectionPhase::Alerting;
        }
        true
    }

    fn set_connected(&self) -> bool {
        {
            let mut phase = self.phase.lock();
            if *phase >= ConnectionPhase::Connected {
                return false;
            }
            *phase = ConnectionPhase::Connected;
        }
        self.establish();
        true
    }

    fn start_media_streams(&self) {
        let sources: Vec<Arc<MemoryMediaStream>> = self
            .streams
            .lock()
            .iter()
            .filter(|s| s.is_source() && s.is_open())
            .cloned()
            .collect();
        for source in sources {
            if let Some(patch) = source.patch() {
                if let Err(e) = patch.start() {
                    tracing::warn!(connection = %self.token, stream = %source.id(), error = %e, "Could not start patch");
                }
            }
        }
    }

    fn release(&self, reason: CallEndReason) {
        {
            let mut phase = self.phase.lock();
            if phase.is_releasing() {
                return;
            }
            *phase = ConnectionPhase::Releasing;
        }
        {
            let mut end_reason = self.end_reason.lock();
            if end_reason.is_none() {
                *end_reason = Some(reason);
            }
        }
        tracing::info!(connection = %self.token, %reason, "Releasing local connection");

        self.taps.lock().clear();
        let streams = std::mem::take(&mut *self.streams.lock());
        for stream in streams {
            stream.close();
        }

        self.set_phase(ConnectionPhase::Released);
        if let Some(endpoint) = self.endpoint.upgrade() {
            endpoint.forget(&self.token);
        }
        if let Some(call) = self.owner() {
            call.on_released(self);
        }
    }

    fn call_end_reason(&self) -> Option<CallEndReason> {
        *self.end_reason.lock()
    }

    fn send_user_input_string(&self, value: &str) -> bool {
        tracing::debug!(connection = %self.token, %value, "User input received");
        self.user_input.lock().push(value.to_string());
        true
    }

    fn send_user_input_tone(&self, tone: char, duration_ms: u32) -> bool {
        tracing::debug!(connection = %self.token, %tone, duration_ms, "User input tone received");
        self.user_input.lock().push(tone.to_string());
        true
    }

    fn hold_connection(&self) -> bool {
        if self.on_hold.swap(true, Ordering::SeqCst) {
            return false;
        }
        for stream in self.streams.lock().iter().filter(|s| s.is_sink()) {
            stream.set_paused(true);
        }
        true
    }

    fn retrieve_connection(&self) -> bool {
        if !self.on_hold.swap(false, Ordering::SeqCst) {
            return false;
        }
        for stream in self.streams.lock().iter().filter(|s| s.is_sink()) {
            stream.set_paused(false);
        }
        true
    }

    fn is_connection_on_hold(&self, from_remote: bool) -> bool {
        // Nothing holds a local connection from the far side.
        !from_remote && self.on_hold.load(Ordering::SeqCst)
    }

    fn transfer_connection(&self, address: &str) -> bool {
        let remote = address.split_once(':').map_or(address, |(_, rest)| rest);
        if remote.is_empty() {
            return false;
        }
        tracing::info!(connection = %self.token, to = %remote, "Local transfer");
        *self.remote_party.lock() = remote.to_string();
        true
    }

    fn on_patch_media_stream(&self, is_source: bool, patch: &Arc<MediaPatch>) {
        tracing::trace!(connection = %self.token, is_source, patch = %patch.source().id(), "Patch created");
        if !is_source || !self.recording.load(Ordering::SeqCst) {
            return;
        }
        if let Some(call) = self.owner() {
            self.add_tap(&call, patch);
        }
    }

    fn enable_recording(&self) -> bool {
        let Some(call) = self.owner() else {
            return false;
        };
        self.recording.store(true, Ordering::SeqCst);
        let patches: Vec<Arc<MediaPatch>> = self
            .streams
            .lock()
            .iter()
            .filter(|s| s.is_source() && s.is_open())
            .filter_map(|s| s.patch())
            .collect();
        for patch in &patches {
            self.add_tap(&call, patch);
        }
        true
    }

    fn disable_recording(&self) {
        self.recording.store(false, Ordering::SeqCst);
        let taps = std::mem::take(&mut *self.taps.lock());
        let call = self.owner();
        for tap in taps {
            if let Some(patch) = tap.patch.upgrade() {
                patch.remove_filter(&tap.filter, Some(&tap.stage));
            }
            if let Some(call) = &call {
                call.close_recording_channel(&tap.channel);
            }
        }
    }

    fn is_media_bypass_possible(&self, _session_id: u32) -> bool {
        self.media_bypass
    }
}

//! Calls: connection set, format negotiation and the clearing state machine
//!
//! A [`Call`] owns the connections taking part in one logical conversation.
//! Connections report progress through the `on_*` callbacks; the call fans
//! the progress out to the other connections, negotiates media formats
//! between them and asks the manager for media patches.
//!
//! The call state is kept under one mutex that is never held while a
//! connection is invoked. Every walk over the connections works on a
//! snapshot and skips connections that are releasing.
//!
//! ```text
//!  Created ─► SettingUp ─► Proceeding ─► Alerting ─► Connected ─► Established
//!     │            │             │            │           │             │
//!     └────────────┴─────────────┴──── clear / release ───┴─────────────┘
//!                                        │
//!                                        ▼
//!                                    Clearing ─► Cleared (no connections left)
//! ```

use crate::connection::{Connection, ConnectionPhase};
use crate::format::{ContentRole, MediaFormat, MediaFormatList, MediaType};
use crate::frame::MediaFrame;
use crate::manager::CallManager;
use crate::patch::{MediaPatch, PatchError};
use crate::recording::{Recorder, RecordingError, RecordingOptions};
use crate::stream::{MediaStream, StreamError};
use crate::transcoder::TranscoderError;
use crate::types::{CallEndReason, CallState, CallSummary};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::oneshot;

/// Call and manager errors
#[derive(Error, Debug)]
pub enum CallError {
    /// Call is clearing, no new activity allowed
    #[error("Call is clearing")]
    Clearing,

    /// Media cannot be opened while on hold
    #[error("Call is on hold")]
    OnHold,

    /// Format negotiation failed
    #[error("Media negotiation failed: {0}")]
    Negotiation(#[from] TranscoderError),

    /// Patch construction failed
    #[error(transparent)]
    Patch(#[from] PatchError),

    /// Stream could not be opened
    #[error(transparent)]
    Stream(#[from] StreamError),

    /// Recording failed
    #[error(transparent)]
    Recording(#[from] RecordingError),

    /// No sink could be opened for a source
    #[error("No media streams opened for session {0}")]
    NoMediaStreams(u32),

    /// No endpoint handles the address prefix
    #[error("No endpoint for address: {0}")]
    NoEndpoint(String),

    /// Endpoint refused to create a connection
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Unknown call token
    #[error("Call not found: {0}")]
    CallNotFound(String),

    /// Manager call limit reached
    #[error("Too many calls (limit {0})")]
    TooManyCalls(usize),

    /// Transfer could not be completed
    #[error("Transfer failed: {0}")]
    TransferFailed(String),

    /// The manager owning the call was dropped
    #[error("Call manager is gone")]
    ManagerGone,
}

struct Member {
    token: String,
    name: String,
    connection: Arc<dyn Connection>,
}

struct CallInner {
    members: Vec<Member>,
    established: bool,
    clearing: bool,
    cleared: bool,
    end_reason: Option<CallEndReason>,
    established_at: Option<DateTime<Utc>>,
    party_a: String,
    party_b: String,
    party_b_address: Option<String>,
    clear_sync: Vec<oneshot::Sender<CallEndReason>>,
}

impl CallInner {
    /// First reason wins
    fn latch_end_reason(&mut self, reason: CallEndReason) {
        if self.end_reason.is_none() {
            self.end_reason = Some(reason);
        }
    }

    fn recompute_parties(&mut self) {
        self.party_a = self.members.first().map(|m| m.name.clone()).unwrap_or_default();
        self.party_b = self.members.get(1).map(|m| m.name.clone()).unwrap_or_default();
    }
}

/// One logical call between two or more connections
pub struct Call {
    this: Weak<Call>,
    token: String,
    manager: Weak<CallManager>,
    created_at: DateTime<Utc>,
    inner: Mutex<CallInner>,
    recorder: Mutex<Option<Arc<dyn Recorder>>>,
}

impl std::fmt::Debug for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Call")
            .field("token", &self.token)
            .field("connections", &inner.members.len())
            .field("established", &inner.established)
            .field("clearing", &inner.clearing)
            .finish()
    }
}

impl Call {
    pub(crate) fn new(manager: &Arc<CallManager>, token: String) -> Arc<Self> {
        tracing::debug!(call = %token, "Call created");
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            token,
            manager: Arc::downgrade(manager),
            created_at: Utc::now(),
            inner: Mutex::new(CallInner {
                members: Vec::new(),
                established: false,
                clearing: false,
                cleared: false,
                end_reason: None,
                established_at: None,
                party_a: String::new(),
                party_b: String::new(),
                party_b_address: None,
                clear_sync: Vec::new(),
            }),
            recorder: Mutex::new(None),
        })
    }

    fn manager(&self) -> Result<Arc<CallManager>, CallError> {
        self.manager.upgrade().ok_or(CallError::ManagerGone)
    }

    fn arc(&self) -> Option<Arc<Call>> {
        self.this.upgrade()
    }

    /// Unique call token
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Creation time
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Time the call became established
    pub fn established_at(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().established_at
    }

    /// True once every connection reached established
    pub fn is_established(&self) -> bool {
        self.inner.lock().established
    }

    /// True once clearing began
    pub fn is_clearing(&self) -> bool {
        self.inner.lock().clearing
    }

    /// True once the last connection was released
    pub fn is_cleared(&self) -> bool {
        self.inner.lock().cleared
    }

    /// Latched end reason
    pub fn end_reason(&self) -> Option<CallEndReason> {
        self.inner.lock().end_reason
    }

    /// Latch `reason` unless a reason is already set
    pub fn set_end_reason(&self, reason: CallEndReason) {
        self.inner.lock().latch_end_reason(reason);
    }

    /// Display name of the first connection
    pub fn party_a(&self) -> String {
        self.inner.lock().party_a.clone()
    }

    /// Display name of the second connection
    pub fn party_b(&self) -> String {
        self.inner.lock().party_b.clone()
    }

    /// Address to dial once the first connection answers
    pub fn set_party_b_address(&self, address: Option<String>) {
        self.inner.lock().party_b_address = address;
    }

    /// Number of connections, releasing ones included
    pub fn connection_count(&self) -> usize {
        self.inner.lock().members.len()
    }

    /// All connections in insertion order
    pub fn connections(&self) -> Vec<Arc<dyn Connection>> {
        self.inner
            .lock()
            .members
            .iter()
            .map(|m| Arc::clone(&m.connection))
            .collect()
    }

    /// Connection by token
    pub fn find_connection(&self, token: &str) -> Option<Arc<dyn Connection>> {
        self.inner
            .lock()
            .members
            .iter()
            .find(|m| m.token == token)
            .map(|m| Arc::clone(&m.connection))
    }

    /// Active connections other than `connection`
    pub fn other_connections(&self, connection: &dyn Connection) -> Vec<Arc<dyn Connection>> {
        let token = connection.token();
        let snapshot: Vec<(String, Arc<dyn Connection>)> = self
            .inner
            .lock()
            .members
            .iter()
            .map(|m| (m.token.clone(), Arc::clone(&m.connection)))
            .collect();
        snapshot
            .into_iter()
            .filter(|(t, c)| *t != token && !c.phase().is_releasing())
            .map(|(_, c)| c)
            .collect()
    }

    fn active_connections(&self) -> Vec<Arc<dyn Connection>> {
        self.connections()
            .into_iter()
            .filter(|c| !c.phase().is_releasing())
            .collect()
    }

    /// Observable state derived from flags and connection phases
    pub fn state(&self) -> CallState {
        {
            let inner = self.inner.lock();
            if inner.cleared {
                return CallState::Cleared;
            }
            if inner.clearing {
                return CallState::Clearing;
            }
            if inner.established {
                return CallState::Established;
            }
        }
        let furthest = self
            .connections()
            .iter()
            .map(|c| c.phase())
            .filter(|p| *p < ConnectionPhase::Forwarding)
            .max();
        match furthest {
            None | Some(ConnectionPhase::Uninitialised) => CallState::Created,
            Some(ConnectionPhase::SetUp) => CallState::SettingUp,
            Some(ConnectionPhase::Proceeding) => CallState::Proceeding,
            Some(ConnectionPhase::Alerting) => CallState::Alerting,
            Some(_) => CallState::Connected,
        }
    }

    /// Snapshot for display
    pub fn summary(&self) -> CallSummary {
        let state = self.state();
        let inner = self.inner.lock();
        CallSummary {
            token: self.token.clone(),
            party_a: inner.party_a.clone(),
            party_b: inner.party_b.clone(),
            state,
            created_at: self.created_at,
            established_at: inner.established_at,
            end_reason: inner.end_reason,
        }
    }

    /// Add a connection. Refused once clearing began.
    pub fn add_connection(&self, connection: Arc<dyn Connection>) -> bool {
        let token = connection.token();
        let name = connection.remote_party_name();
        let mut inner = self.inner.lock();
        if inner.clearing {
            tracing::debug!(call = %self.token, connection = %token, "Connection refused, call clearing");
            return false;
        }
        inner.members.push(Member {
            token,
            name,
            connection,
        });
        inner.recompute_parties();
        true
    }

    // ------------------------------------------------------------------------
    // Progress callbacks
    // ------------------------------------------------------------------------

    /// `connection` started setting up: set up every other connection.
    /// True if any of them succeeded.
    pub fn on_set_up(&self, connection: &dyn Connection) -> bool {
        if self.is_clearing() {
            return false;
        }
        let mut ok = false;
        for other in self.other_connections(connection) {
            if other.set_up_connection() {
                other.on_set_up_connection();
                ok = true;
            }
        }
        tracing::debug!(call = %self.token, connection = %connection.token(), ok, "Call set up");
        ok
    }

    /// `connection` is ringing: tell the other connections
    pub fn on_alerting(&self, connection: &dyn Connection) -> bool {
        let with_media = connection
            .media_stream_of_type(MediaType::Audio, true)
            .is_some();
        let caller = connection.remote_party_name();
        let mut ok = false;
        for other in self.other_connections(connection) {
            ok |= other.set_alerting(&caller, with_media);
        }
        tracing::debug!(call = %self.token, connection = %connection.token(), with_media, "Call alerting");
        ok
    }

    /// `connection` answered
    pub fn on_connected(&self, connection: &dyn Connection) -> bool {
        let pending = {
            let mut inner = self.inner.lock();
            if inner.members.len() == 1 {
                inner.party_b_address.take()
            } else {
                None
            }
        };

        if let Some(address) = pending {
            let made = match (self.manager(), self.arc()) {
                (Ok(manager), Some(call)) => manager.make_connection(&call, &address),
                (Err(e), _) => Err(e),
                (_, None) => Err(CallError::CallNotFound(self.token.clone())),
            };
            return match made {
                Ok(_) => self.on_set_up(connection),
                Err(e) => {
                    tracing::warn!(call = %self.token, address = %address, error = %e, "Could not reach party B");
                    self.clear(CallEndReason::NoUser, None);
                    false
                }
            };
        }

        let mut ok = false;
        for other in self.other_connections(connection) {
            if other.phase() < ConnectionPhase::Connected {
                ok |= other.set_connected();
            }
        }
        ok
    }

    /// `connection` is established. Starts its media; the call becomes
    /// established once at least two connections are and all of them are.
    pub fn on_established(&self, connection: &dyn Connection) -> bool {
        connection.start_media_streams();

        if self.is_established() {
            return false;
        }
        let connections = self.connections();
        if connections.len() < 2
            || !connections
                .iter()
                .all(|c| c.phase() == ConnectionPhase::Established)
        {
            return false;
        }

        {
            let mut inner = self.inner.lock();
            if inner.established || inner.clearing {
                return false;
            }
            inner.established = true;
            inner.established_at = Some(Utc::now());
        }
        tracing::info!(call = %self.token, "Call established");
        if let Ok(manager) = self.manager() {
            manager.on_established_call(self);
        }
        true
    }

    /// Clear the call with `reason`.
    ///
    /// `sync` is signalled with the latched end reason when the call is
    /// cleared, immediately if it already is.
    pub fn clear(&self, reason: CallEndReason, sync: Option<oneshot::Sender<CallEndReason>>) {
        let members = {
            let mut inner = self.inner.lock();
            inner.clearing = true;
            inner.latch_end_reason(reason);
            if inner.cleared {
                let latched = inner.end_reason.unwrap_or(reason);
                drop(inner);
                if let Some(sync) = sync {
                    let _ = sync.send(latched);
                }
                return;
            }
            if let Some(sync) = sync {
                inner.clear_sync.push(sync);
            }
            inner
                .members
                .iter()
                .map(|m| Arc::clone(&m.connection))
                .collect::<Vec<_>>()
        };

        tracing::info!(call = %self.token, %reason, connections = members.len(), "Clearing call");
        if members.is_empty() {
            self.check_cleared();
            return;
        }
        for connection in members {
            connection.release(reason);
        }
    }

    /// `connection` was released. The last remaining peer is released with
    /// the same reason.
    pub fn on_released(&self, connection: &dyn Connection) {
        let token = connection.token();
        let released_reason = connection.call_end_reason();

        let (last, reason) = {
            let mut inner = self.inner.lock();
            let before = inner.members.len();
            inner.members.retain(|m| m.token != token);
            if inner.members.len() == before {
                return;
            }
            if let Some(reason) = released_reason {
                inner.latch_end_reason(reason);
            }
            inner.recompute_parties();
            let last = if inner.members.len() == 1 {
                inner.members.first().map(|m| Arc::clone(&m.connection))
            } else {
                None
            };
            let reason = released_reason
                .or(inner.end_reason)
                .unwrap_or(CallEndReason::LocalUser);
            (last, reason)
        };
        tracing::debug!(call = %self.token, connection = %token, %reason, "Connection released");

        if let Some(last) = last {
            last.release(reason);
        }
        self.check_cleared();
    }

    fn check_cleared(&self) {
        let fire = {
            let mut inner = self.inner.lock();
            if inner.members.is_empty() && !inner.cleared {
                inner.cleared = true;
                inner.clearing = true;
                true
            } else {
                false
            }
        };
        if fire {
            self.on_cleared();
        }
    }

    fn on_cleared(&self) {
        self.stop_recording();
        let reason = self.end_reason().unwrap_or(CallEndReason::LocalUser);
        tracing::info!(call = %self.token, %reason, "Call cleared");

        if let Ok(manager) = self.manager() {
            manager.on_cleared_call(self);
        }

        let sync = std::mem::take(&mut self.inner.lock().clear_sync);
        for sender in sync {
            let _ = sender.send(reason);
        }
    }

    // ------------------------------------------------------------------------
    // Media
    // ------------------------------------------------------------------------

    /// Formats usable towards `connection`: the intersection of every other
    /// connection's possible formats (native plus transcodable), in the
    /// order of the first list examined, after connection and manager
    /// adjustments.
    pub fn media_formats(&self, connection: &dyn Connection, include_own: bool) -> MediaFormatList {
        let Ok(manager) = self.manager() else {
            return MediaFormatList::new();
        };
        let registry = manager.registry();

        let mut common: Option<MediaFormatList> = None;
        if include_own {
            common = Some(registry.possible_formats(&connection.media_formats()));
        }
        for other in self.other_connections(connection) {
            let mut possible = registry.possible_formats(&other.media_formats());
            other.adjust_media_formats(false, Some(connection), &mut possible);
            common = Some(match common {
                None => possible,
                Some(list) => list.intersection(&possible),
            });
        }

        let mut formats = common.unwrap_or_default();
        connection.adjust_media_formats(true, None, &mut formats);
        manager.adjust_media_formats(true, Some(connection), &mut formats);
        formats
    }

    /// Open a source stream on `connection` and a sink on every other
    /// connection, joined by one media patch.
    ///
    /// # Errors
    ///
    /// Returns error if the call is clearing or on hold, no format pair can
    /// be negotiated, or no sink stream can be opened
    pub fn open_source_media_streams(
        &self,
        connection: &dyn Connection,
        media_type: MediaType,
        session_id: u32,
        preselected: Option<&MediaFormat>,
        content_role: Option<ContentRole>,
    ) -> Result<(), CallError> {
        if self.is_clearing() {
            return Err(CallError::Clearing);
        }
        if self.is_on_hold() {
            return Err(CallError::OnHold);
        }

        if session_id != 0 {
            if let Some(existing) = connection.media_stream(session_id, true) {
                if existing.is_open() {
                    if already_matches(existing.as_ref(), preselected) {
                        tracing::debug!(call = %self.token, session_id, "Source already open");
                        return Ok(());
                    }
                    tracing::debug!(call = %self.token, session_id, "Reopening source with new format");
                    existing.close();
                }
            }
        }

        let session_id = if session_id == 0 {
            connection.next_session_id(media_type, true)
        } else {
            session_id
        };

        let manager = self.manager()?;
        let registry = manager.registry();
        let native_source = connection.media_formats();

        let mut source: Option<(Arc<dyn MediaStream>, Arc<MediaPatch>)> = None;
        let mut sinks: Vec<Arc<dyn Connection>> = Vec::new();
        let mut last_error: Option<CallError> = None;

        for other in self.other_connections(connection) {
            let mut sink_formats = other.media_formats();
            other.adjust_media_formats(true, None, &mut sink_formats);
            let mut source_formats = match &source {
                Some((stream, _)) => std::iter::once(stream.media_format()).collect(),
                None => native_source.clone(),
            };

            let mut preferences = Vec::new();
            if let Some(reverse) = other.media_stream(session_id, true) {
                preferences.push(reverse.media_format().name().to_string());
            }
            if let Some(format) = preselected {
                preferences.push(format.name().to_string());
            }
            preferences.push(format!("@{media_type}"));
            sink_formats.reorder(&preferences);
            source_formats.reorder(&preferences);

            if let (MediaType::Video, Some(role)) = (media_type, content_role) {
                sink_formats.retain(|f| f.supports_content_role(role));
                source_formats.retain(|f| f.supports_content_role(role));
                if sink_formats.is_empty() {
                    tracing::debug!(call = %self.token, other = %other.token(), ?role, "No format supports content role");
                    last_error = Some(CallError::Negotiation(TranscoderError::NoCompatibleFormats(
                        format!("content role {role:?}"),
                    )));
                    continue;
                }
            }

            if manager.is_media_bypass_possible(connection, other.as_ref(), session_id) {
                sink_formats.retain(|f| native_source.contains(f.name()));
            }

            let (source_format, sink_format) =
                match registry.select_media_formats(media_type, &source_formats, &sink_formats) {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::debug!(call = %self.token, other = %other.token(), error = %e, "Format selection failed");
                        last_error = Some(e.into());
                        continue;
                    }
                };

            if source.is_none() {
                let stream = connection.open_media_stream(&source_format, session_id, true)?;
                let patch = match manager.create_media_patch(&stream, stream.requires_patch_thread()) {
                    Ok(patch) => patch,
                    Err(e) => {
                        stream.close();
                        return Err(e);
                    }
                };
                source = Some((stream, patch));
            }
            let Some((_, patch)) = &source else {
                continue;
            };

            let sink = match other.open_media_stream(&sink_format, session_id, false) {
                Ok(sink) => sink,
                Err(e) => {
                    last_error = Some(e.into());
                    continue;
                }
            };
            if let Err(e) = patch.add_sink(Arc::clone(&sink)) {
                tracing::warn!(call = %self.token, other = %other.token(), error = %e, "Could not add sink");
                sink.close();
                last_error = Some(e.into());
                continue;
            }
            sinks.push(other);
        }

        let Some((stream, patch)) = source else {
            return Err(last_error.unwrap_or(CallError::NoMediaStreams(session_id)));
        };
        if sinks.is_empty() {
            stream.close();
            return Err(last_error.unwrap_or(CallError::NoMediaStreams(session_id)));
        }

        tracing::info!(
            call = %self.token,
            session_id,
            %media_type,
            format = %stream.media_format(),
            sinks = sinks.len(),
            "Opened media streams"
        );
        connection.on_patch_media_stream(true, &patch);
        for other in &sinks {
            other.on_patch_media_stream(false, &patch);
        }
        if self.is_established() {
            patch.start()?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Hold, transfer, user input
    // ------------------------------------------------------------------------

    /// Put every connection on hold. True if any acknowledged.
    pub fn hold(&self) -> bool {
        let mut ok = false;
        for connection in self.active_connections() {
            ok |= connection.hold_connection();
        }
        ok
    }

    /// Take every connection off hold. True if any acknowledged.
    pub fn retrieve(&self) -> bool {
        let mut ok = false;
        for connection in self.active_connections() {
            ok |= connection.retrieve_connection();
        }
        ok
    }

    /// True if any connection holds locally
    pub fn is_on_hold(&self) -> bool {
        self.active_connections()
            .iter()
            .any(|c| c.is_connection_on_hold(false))
    }

    /// Transfer `connection` (default: the first connection) to `address`.
    ///
    /// Addresses for the connection's own protocol, without a prefix, or
    /// naming an existing call are handed to the connection. A `*` prefix
    /// stands for the connection's own prefix. Anything else replaces the
    /// connection with a new one made through the manager.
    ///
    /// # Errors
    ///
    /// Returns error if the transfer is refused or the new connection fails
    pub fn transfer(
        &self,
        address: &str,
        connection: Option<&Arc<dyn Connection>>,
    ) -> Result<(), CallError> {
        let connection = match connection {
            Some(c) => Arc::clone(c),
            None => self
                .active_connections()
                .into_iter()
                .next()
                .ok_or_else(|| CallError::TransferFailed("no connection".to_string()))?,
        };
        let manager = self.manager()?;

        let (prefix, rest) = address.split_once(':').unwrap_or(("", address));
        if prefix == "*" {
            let target = format!("{}:{rest}", connection.prefix());
            return transfer_within(connection.as_ref(), &target);
        }
        if prefix.is_empty()
            || prefix.eq_ignore_ascii_case(&connection.prefix())
            || manager.has_call(address)
        {
            return transfer_within(connection.as_ref(), address);
        }

        let call = self
            .arc()
            .ok_or_else(|| CallError::CallNotFound(self.token.clone()))?;
        let replacement = manager.make_connection(&call, address)?;
        let previous_reason = self.end_reason();
        let old_phase = connection.phase();
        connection.set_phase(ConnectionPhase::Forwarding);
        tracing::info!(call = %self.token, from = %connection.token(), to = %address, "Forwarding connection");

        if replacement.set_up_connection() {
            replacement.on_set_up_connection();
            connection.release(CallEndReason::CallForwarded);
            self.restore_end_reason(previous_reason);
            return Ok(());
        }

        replacement.release(CallEndReason::TemporaryFailure);
        self.restore_end_reason(previous_reason);
        connection.set_phase(old_phase);
        Err(CallError::TransferFailed(address.to_string()))
    }

    /// Undo a latch made by a connection that left without ending the call
    fn restore_end_reason(&self, previous: Option<CallEndReason>) {
        let mut inner = self.inner.lock();
        if !inner.clearing {
            inner.end_reason = previous;
        }
    }

    /// Forward user input from `connection` to every other connection
    pub fn on_user_input_string(&self, connection: &dyn Connection, value: &str) {
        for other in self.other_connections(connection) {
            other.send_user_input_string(value);
        }
    }

    /// Forward a user input tone from `connection` to every other connection
    pub fn on_user_input_tone(&self, connection: &dyn Connection, tone: char, duration_ms: u32) {
        for other in self.other_connections(connection) {
            other.send_user_input_tone(tone, duration_ms);
        }
    }

    // ------------------------------------------------------------------------
    // Recording
    // ------------------------------------------------------------------------

    /// Start recording to `path`; the recorder is chosen by file extension.
    /// An existing recording is stopped first.
    ///
    /// # Errors
    ///
    /// Returns error if no recorder handles the extension or it cannot open
    pub fn start_recording(&self, path: &Path, options: &RecordingOptions) -> Result<(), CallError> {
        self.stop_recording();
        let manager = self.manager()?;
        let recorder: Arc<dyn Recorder> = Arc::from(manager.recorders().create(path)?);
        recorder.open(path, options)?;
        *self.recorder.lock() = Some(recorder);

        for connection in self.active_connections() {
            if !connection.enable_recording() {
                tracing::debug!(call = %self.token, connection = %connection.token(), "Connection cannot record");
            }
        }
        Ok(())
    }

    /// Stop recording, if active
    pub fn stop_recording(&self) {
        let Some(recorder) = self.recorder.lock().take() else {
            return;
        };
        for connection in self.active_connections() {
            connection.disable_recording();
        }
        if let Err(e) = recorder.close() {
            tracing::warn!(call = %self.token, error = %e, "Closing recorder failed");
        }
    }

    /// True while a recorder is attached
    pub fn is_recording(&self) -> bool {
        self.recorder.lock().is_some()
    }

    fn current_recorder(&self) -> Option<Arc<dyn Recorder>> {
        self.recorder.lock().clone()
    }

    /// Register a recording channel. False if not recording or refused.
    pub fn open_recording_channel(&self, channel: &str, format: &MediaFormat) -> bool {
        let Some(recorder) = self.current_recorder() else {
            return false;
        };
        let options = recorder.options();
        let wanted = match format.media_type() {
            MediaType::Audio => options.audio,
            MediaType::Video => options.video,
            _ => false,
        };
        if !wanted {
            return false;
        }
        match recorder.open_channel(channel, format) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(call = %self.token, channel, error = %e, "Recording channel refused");
                false
            }
        }
    }

    /// Drop a recording channel
    pub fn close_recording_channel(&self, channel: &str) {
        if let Some(recorder) = self.current_recorder() {
            recorder.close_channel(channel);
        }
    }

    /// Record an audio frame. A failed write closes only this channel.
    pub fn on_record_audio(&self, channel: &str, frame: &MediaFrame) {
        if let Some(recorder) = self.current_recorder() {
            if let Err(e) = recorder.write_audio(channel, frame) {
                tracing::warn!(call = %self.token, channel, error = %e, "Audio recording failed, closing channel");
                recorder.close_channel(channel);
            }
        }
    }

    /// Record a video frame. A failed write closes only this channel.
    pub fn on_record_video(&self, channel: &str, frame: &MediaFrame) {
        if let Some(recorder) = self.current_recorder() {
            if let Err(e) = recorder.write_video(channel, frame) {
                tracing::warn!(call = %self.token, channel, error = %e, "Video recording failed, closing channel");
                recorder.close_channel(channel);
            }
        }
    }
}

fn already_matches(existing: &dyn MediaStream, preselected: Option<&MediaFormat>) -> bool {
    let Some(wanted) = preselected else {
        return true;
    };
    if existing.media_format().is_same(wanted) {
        return true;
    }
    existing.patch().is_some_and(|patch| {
        patch
            .sink_streams()
            .iter()
            .any(|sink| sink.media_format().is_same(wanted))
    })
}

fn transfer_within(connection: &dyn Connection, address: &str) -> Result<(), CallError> {
    if connection.transfer_connection(address) {
        Ok(())
    } else {
        Err(CallError::TransferFailed(address.to_string()))
    }
}

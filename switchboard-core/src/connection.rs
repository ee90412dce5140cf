//! Connection and endpoint capability traits
//!
//! A [`Connection`] is one endpoint's participation in a call. Protocol
//! stacks implement it; the call drives it through the methods below and the
//! connection reports progress back through the call's `on_*` callbacks.
//!
//! Connections are shared as `Arc<dyn Connection>` and every method takes
//! `&self`; implementations keep their own interior locking. The call never
//! holds its own locks while invoking a connection, so implementations may
//! call back into the call from any method.

use crate::call::{Call, CallError};
use crate::format::{MediaFormat, MediaFormatList, MediaType};
use crate::patch::MediaPatch;
use crate::stream::{MediaStream, StreamError};
use crate::types::CallEndReason;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Lifecycle phase of a connection, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ConnectionPhase {
    /// Created, nothing sent
    Uninitialised,
    /// Set-up in progress
    SetUp,
    /// Remote is proceeding
    Proceeding,
    /// Remote is ringing
    Alerting,
    /// Answered, media pending
    Connected,
    /// Media flowing
    Established,
    /// Being replaced by a forwarded connection
    Forwarding,
    /// Release in progress
    Releasing,
    /// Gone
    Released,
}

impl ConnectionPhase {
    /// True at or past `Releasing`
    pub fn is_releasing(self) -> bool {
        self >= Self::Releasing
    }
}

/// One endpoint's participation in a call
pub trait Connection: Send + Sync {
    /// Unique connection token
    fn token(&self) -> String;

    /// Prefix of the owning endpoint, e.g. `local`
    fn prefix(&self) -> String;

    /// Display name of the far party
    fn remote_party_name(&self) -> String;

    /// Current phase
    fn phase(&self) -> ConnectionPhase;

    /// Force the phase (used by transfer)
    fn set_phase(&self, phase: ConnectionPhase);

    /// Formats this connection supports natively, in preference order
    fn media_formats(&self) -> MediaFormatList;

    /// Hook to adjust a format list offered to (`local`) or by another connection
    fn adjust_media_formats(
        &self,
        _local: bool,
        _other: Option<&dyn Connection>,
        _formats: &mut MediaFormatList,
    ) {
    }

    /// Open a stream in `format` for a session
    ///
    /// # Errors
    ///
    /// Returns error if the stream cannot be opened
    fn open_media_stream(
        &self,
        format: &MediaFormat,
        session_id: u32,
        is_source: bool,
    ) -> Result<Arc<dyn MediaStream>, StreamError>;

    /// All streams currently open on this connection
    fn media_streams(&self) -> Vec<Arc<dyn MediaStream>>;

    /// Open stream for a session and direction
    fn media_stream(&self, session_id: u32, is_source: bool) -> Option<Arc<dyn MediaStream>> {
        self.media_streams()
            .into_iter()
            .find(|s| s.session_id() == session_id && s.is_source() == is_source && s.is_open())
    }

    /// First open stream of a media type and direction
    fn media_stream_of_type(
        &self,
        media_type: MediaType,
        is_source: bool,
    ) -> Option<Arc<dyn MediaStream>> {
        self.media_streams().into_iter().find(|s| {
            s.media_format().media_type() == media_type && s.is_source() == is_source && s.is_open()
        })
    }

    /// Session id to use for a new stream of `media_type`
    fn next_session_id(&self, media_type: MediaType, is_source: bool) -> u32;

    /// Begin set-up towards the remote. Returns false on failure.
    fn set_up_connection(&self) -> bool;

    /// Another connection of the call started setting up
    fn on_set_up_connection(&self) {}

    /// Indicate ringing to this side
    fn set_alerting(&self, caller_name: &str, with_media: bool) -> bool;

    /// Indicate answer to this side
    fn set_connected(&self) -> bool;

    /// Start any opened media (patch pumps)
    fn start_media_streams(&self);

    /// Release with `reason`
    fn release(&self, reason: CallEndReason);

    /// Reason latched when the connection ended
    fn call_end_reason(&self) -> Option<CallEndReason>;

    /// Send a user input string (DTMF digits)
    fn send_user_input_string(&self, _value: &str) -> bool {
        false
    }

    /// Send a single user input tone
    fn send_user_input_tone(&self, _tone: char, _duration_ms: u32) -> bool {
        false
    }

    /// Put the remote on hold
    fn hold_connection(&self) -> bool {
        false
    }

    /// Take the remote off hold
    fn retrieve_connection(&self) -> bool {
        false
    }

    /// Hold state initiated locally, or by the remote when `from_remote`
    fn is_connection_on_hold(&self, _from_remote: bool) -> bool {
        false
    }

    /// Transfer inside the protocol (same endpoint)
    fn transfer_connection(&self, _address: &str) -> bool {
        false
    }

    /// A patch was created for one of this connection's streams
    fn on_patch_media_stream(&self, _is_source: bool, _patch: &Arc<MediaPatch>) {}

    /// Start tapping media into the call recorder
    fn enable_recording(&self) -> bool {
        false
    }

    /// Stop tapping media into the call recorder
    fn disable_recording(&self) {}

    /// Whether media for `session_id` may bypass the local pipeline
    fn is_media_bypass_possible(&self, _session_id: u32) -> bool {
        false
    }
}

/// A protocol endpoint able to create connections
pub trait Endpoint: Send + Sync {
    /// Address prefix routed to this endpoint
    fn prefix(&self) -> &str;

    /// Formats the endpoint supports
    fn media_formats(&self) -> MediaFormatList;

    /// Create a connection for `address` in `call`. The manager adds it to
    /// the call.
    ///
    /// # Errors
    ///
    /// Returns error if the address cannot be reached
    fn make_connection(
        &self,
        call: &Arc<Call>,
        address: &str,
    ) -> Result<Arc<dyn Connection>, CallError>;
}

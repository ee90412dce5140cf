//! Switchboard - call processing core
//!
//! This library establishes calls between endpoints, negotiates the media
//! formats they will use and moves media between them. It features:
//!
//! - **Format negotiation**: intersection of what every party can send or
//!   receive, including formats reachable through transcoders
//! - **Media patches**: one pump thread per source stream feeding any number
//!   of sinks through zero, one or two transcoder stages
//! - **Live reconfiguration**: format updates, codec commands, filters,
//!   recording taps and patch-to-patch bypass while media flows
//! - **Call state machine**: set-up, alerting, connect, establishment and
//!   cascading release with a latched end reason
//!
//! # Examples
//!
//! ```rust,no_run
//! use switchboard_core::{CallManager, LocalEndpoint, LocalEndpointConfig, ManagerConfig, TranscoderRegistry};
//!
//! # fn example() -> Result<(), switchboard_core::CallError> {
//! let manager = CallManager::new(ManagerConfig::default(), TranscoderRegistry::new());
//! manager.attach_endpoint(LocalEndpoint::new(LocalEndpointConfig::default())?);
//!
//! let call = manager.set_up_call("local:alice", "local:bob")?;
//! assert!(call.is_established());
//! call.clear(switchboard_core::CallEndReason::LocalUser, None);
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

/// Call-level types: end reasons, states, events
pub mod types;

/// Media types, formats and format lists
pub mod format;

/// Media frames
pub mod frame;

/// Transcoder units and the transcoder registry
pub mod transcoder;

/// Media streams
pub mod stream;

/// Per-sink rate control
pub mod rate;

/// Media patches: pump, sinks and transcoding pipelines
pub mod patch;

/// Call recording
pub mod recording;

/// Connection and endpoint traits
pub mod connection;

/// Calls: negotiation and lifecycle
pub mod call;

/// Call manager
pub mod manager;

/// In-process endpoint
pub mod local;

// Re-export main types at crate root
pub use call::{Call, CallError};
pub use connection::{Connection, ConnectionPhase, Endpoint};
pub use format::{
    well_known, ContentRole, FormatError, MediaFormat, MediaFormatList, MediaType,
};
pub use frame::MediaFrame;
pub use local::{LocalConnection, LocalEndpoint, LocalEndpointConfig};
pub use manager::{CallManager, ManagerConfig};
pub use patch::{FilterFn, MediaPatch, PatchConfig, PatchError, PatchStatistics, SinkStatistics};
pub use rate::{BitRateController, RateController, RateDecision};
pub use recording::{
    RawRecorder, RecordEntry, Recorder, RecorderRegistry, RecordingError, RecordingOptions,
};
pub use stream::{MediaStream, MemoryMediaStream, StreamError, StreamId};
pub use transcoder::{
    FnTranscoder, MediaCommand, Transcoder, TranscoderError, TranscoderFactory, TranscoderRegistry,
};
pub use types::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::call::{Call, CallError};
    pub use crate::connection::{Connection, Endpoint};
    pub use crate::format::{well_known, MediaFormat, MediaFormatList, MediaType};
    pub use crate::frame::MediaFrame;
    pub use crate::local::{LocalEndpoint, LocalEndpointConfig};
    pub use crate::manager::{CallManager, ManagerConfig};
    pub use crate::patch::MediaPatch;
    pub use crate::stream::{MediaStream, MemoryMediaStream};
    pub use crate::transcoder::{Transcoder, TranscoderRegistry};
    pub use crate::types::{CallEndReason, CallEvent, CallState};
}

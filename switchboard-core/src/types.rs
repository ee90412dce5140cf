//! Call-level types shared by calls, connections and the manager

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a call or connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallEndReason {
    /// Local user hung up
    LocalUser,
    /// Remote user hung up
    RemoteUser,
    /// Remote party did not answer
    NoAnswer,
    /// Remote party refused the call
    Refused,
    /// Destination could not be reached or created
    NoUser,
    /// Call was forwarded to another address
    CallForwarded,
    /// Capability exchange failed
    CapabilityExchange,
    /// No media format in common
    NoCompatibleMedia,
    /// Temporary failure, retry later
    TemporaryFailure,
    /// Transport failed
    TransportFail,
    /// Media could not be started or failed mid-call
    MediaFailed,
    /// Too many concurrent calls
    Congestion,
    /// Call cleared by the application during shutdown
    Shutdown,
}

impl fmt::Display for CallEndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::LocalUser => "local user cleared",
            Self::RemoteUser => "remote user cleared",
            Self::NoAnswer => "no answer",
            Self::Refused => "refused",
            Self::NoUser => "no user",
            Self::CallForwarded => "forwarded",
            Self::CapabilityExchange => "capability exchange failed",
            Self::NoCompatibleMedia => "no compatible media",
            Self::TemporaryFailure => "temporary failure",
            Self::TransportFail => "transport failure",
            Self::MediaFailed => "media failed",
            Self::Congestion => "congestion",
            Self::Shutdown => "shutdown",
        };
        f.write_str(text)
    }
}

/// Observable call state, derived from connection phases and call flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CallState {
    /// Created, no connection set up yet
    Created,
    /// First connection is setting up
    SettingUp,
    /// Remote side is proceeding
    Proceeding,
    /// Remote side is ringing
    Alerting,
    /// Remote side answered, media not yet up
    Connected,
    /// All connections established
    Established,
    /// Releasing connections
    Clearing,
    /// No connections remain
    Cleared,
}

/// Events broadcast by the call manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallEvent {
    /// A connection joined a call
    NewConnection {
        /// Call token
        call: String,
        /// Connection token
        connection: String,
    },
    /// Every connection of the call is established
    Established {
        /// Call token
        call: String,
    },
    /// Call has no connections left
    Cleared {
        /// Call token
        call: String,
        /// Latched end reason
        reason: CallEndReason,
    },
}

impl CallEvent {
    /// Token of the call the event belongs to
    pub fn call_token(&self) -> &str {
        match self {
            Self::NewConnection { call, .. } | Self::Established { call } | Self::Cleared { call, .. } => {
                call
            }
        }
    }
}

/// Snapshot of a call for display and logging
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSummary {
    /// Call token
    pub token: String,
    /// Display name of the first connection
    pub party_a: String,
    /// Display name of the second connection
    pub party_b: String,
    /// Current state
    pub state: CallState,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Time every connection reached established
    pub established_at: Option<DateTime<Utc>>,
    /// End reason, once latched
    pub end_reason: Option<CallEndReason>,
}

impl CallSummary {
    /// Time since establishment, if established
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.established_at.map(|start| Utc::now() - start)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_call_state_ordering() {
        assert!(CallState::Created < CallState::Established);
        assert!(CallState::Established < CallState::Clearing);
        assert!(CallState::Clearing < CallState::Cleared);
    }

    #[test]
    fn test_event_token() {
        let event = CallEvent::Cleared {
            call: "C1".to_string(),
            reason: CallEndReason::NoUser,
        };
        assert_eq!(event.call_token(), "C1");
        let json = serde_json::to_string(&event).unwrap();
        let back: CallEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_summary_duration() {
        let summary = CallSummary {
            token: "C1".to_string(),
            party_a: "a".to_string(),
            party_b: "b".to_string(),
            state: CallState::Established,
            created_at: Utc::now(),
            established_at: Some(Utc::now()),
            end_reason: None,
        };
        assert!(summary.duration().is_some());
    }
}

//! Call manager: endpoint and call registries, media policy and events

use crate::call::{Call, CallError};
use crate::connection::{Connection, Endpoint};
use crate::format::MediaFormatList;
use crate::patch::{MediaPatch, PatchConfig};
use crate::recording::RecorderRegistry;
use crate::stream::MediaStream;
use crate::transcoder::TranscoderRegistry;
use crate::types::{CallEndReason, CallEvent, CallSummary};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, oneshot};
use uuid::Uuid;

/// Call manager configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Maximum concurrent calls
    pub max_calls: usize,
    /// Format names (or `*` patterns, `@audio` media types) moved to the
    /// front of every negotiated list, in this order
    pub media_format_order: Vec<String>,
    /// Format patterns removed from every negotiated list
    pub media_format_mask: Vec<String>,
    /// Allow media to bypass local transcoding when both connections agree
    pub allow_media_bypass: bool,
    /// Capacity of the call event channel
    pub event_capacity: usize,
    /// Settings for every patch the manager creates
    pub patch: PatchConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_calls: 100,
            media_format_order: Vec::new(),
            media_format_mask: Vec::new(),
            allow_media_bypass: false,
            event_capacity: 256,
            patch: PatchConfig::default(),
        }
    }
}

impl ManagerConfig {
    /// Load from a JSON file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed
    pub fn from_json_file(path: &Path) -> Result<Self, std::io::Error> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(std::io::Error::from)
    }
}

/// Registry of endpoints and active calls
pub struct CallManager {
    this: Weak<CallManager>,
    config: ManagerConfig,
    registry: Arc<TranscoderRegistry>,
    recorders: RecorderRegistry,
    endpoints: RwLock<Vec<Arc<dyn Endpoint>>>,
    calls: RwLock<HashMap<String, Arc<Call>>>,
    event_sender: broadcast::Sender<CallEvent>,
}

impl std::fmt::Debug for CallManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallManager")
            .field("config", &self.config)
            .field("endpoints", &self.endpoints.read().len())
            .field("calls", &self.calls.read().len())
            .finish()
    }
}

impl CallManager {
    /// Create a manager with the default recorders
    pub fn new(config: ManagerConfig, registry: TranscoderRegistry) -> Arc<Self> {
        Self::with_recorders(config, registry, RecorderRegistry::default())
    }

    /// Create a manager with a custom recorder registry
    pub fn with_recorders(
        config: ManagerConfig,
        registry: TranscoderRegistry,
        recorders: RecorderRegistry,
    ) -> Arc<Self> {
        let (event_sender, _) = broadcast::channel(config.event_capacity.max(1));
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            config,
            registry: Arc::new(registry),
            recorders,
            endpoints: RwLock::new(Vec::new()),
            calls: RwLock::new(HashMap::new()),
            event_sender,
        })
    }

    fn arc(&self) -> Result<Arc<Self>, CallError> {
        self.this.upgrade().ok_or(CallError::ManagerGone)
    }

    /// Configuration
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Transcoder registry used for negotiation and patches
    pub fn registry(&self) -> &Arc<TranscoderRegistry> {
        &self.registry
    }

    /// Recorder registry
    pub fn recorders(&self) -> &RecorderRegistry {
        &self.recorders
    }

    /// Subscribe to call events
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.event_sender.subscribe()
    }

    fn emit(&self, event: CallEvent) {
        // No subscribers is fine.
        let _ = self.event_sender.send(event);
    }

    /// New unique token starting with `prefix`
    pub fn next_token(&self, prefix: &str) -> String {
        format!("{prefix}-{}", Uuid::new_v4().simple())
    }

    // ------------------------------------------------------------------------
    // Endpoints
    // ------------------------------------------------------------------------

    /// Register an endpoint. An endpoint with the same prefix is replaced.
    pub fn attach_endpoint(&self, endpoint: Arc<dyn Endpoint>) {
        let mut endpoints = self.endpoints.write();
        endpoints.retain(|e| !e.prefix().eq_ignore_ascii_case(endpoint.prefix()));
        tracing::info!(prefix = %endpoint.prefix(), "Endpoint attached");
        endpoints.push(endpoint);
    }

    /// Endpoint handling the prefix of `address` (`prefix:rest`)
    pub fn find_endpoint(&self, address: &str) -> Option<Arc<dyn Endpoint>> {
        let (prefix, _) = address.split_once(':')?;
        self.endpoints
            .read()
            .iter()
            .find(|e| e.prefix().eq_ignore_ascii_case(prefix))
            .cloned()
    }

    // ------------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------------

    /// Create an empty call
    ///
    /// # Errors
    ///
    /// Returns error if the call limit is reached
    pub fn create_call(&self) -> Result<Arc<Call>, CallError> {
        let manager = self.arc()?;
        let mut calls = self.calls.write();
        if calls.len() >= self.config.max_calls {
            tracing::warn!(limit = self.config.max_calls, "Call limit reached");
            return Err(CallError::TooManyCalls(self.config.max_calls));
        }
        let call = Call::new(&manager, self.next_token("call"));
        calls.insert(call.token().to_string(), Arc::clone(&call));
        Ok(call)
    }

    /// Create a call from `party_a` to `party_b`: party A is connected and
    /// set up now, party B once A connects.
    ///
    /// # Errors
    ///
    /// Returns error if party A cannot be reached or refuses set-up
    pub fn set_up_call(&self, party_a: &str, party_b: &str) -> Result<Arc<Call>, CallError> {
        let call = self.create_call()?;
        tracing::info!(call = %call.token(), %party_a, %party_b, "Setting up call");
        call.set_party_b_address(Some(party_b.to_string()));

        let connection = match self.make_connection(&call, party_a) {
            Ok(connection) => connection,
            Err(e) => {
                call.clear(CallEndReason::NoUser, None);
                return Err(e);
            }
        };
        if !connection.set_up_connection() {
            call.clear(CallEndReason::TemporaryFailure, None);
            return Err(CallError::ConnectionFailed(party_a.to_string()));
        }
        Ok(call)
    }

    /// Ask the endpoint for `address` to create a connection and add it to `call`
    ///
    /// # Errors
    ///
    /// Returns error if no endpoint handles the address, the endpoint fails,
    /// or the call is clearing
    pub fn make_connection(
        &self,
        call: &Arc<Call>,
        address: &str,
    ) -> Result<Arc<dyn Connection>, CallError> {
        let endpoint = self
            .find_endpoint(address)
            .ok_or_else(|| CallError::NoEndpoint(address.to_string()))?;
        let connection = endpoint.make_connection(call, address)?;
        if !call.add_connection(Arc::clone(&connection)) {
            connection.release(CallEndReason::LocalUser);
            return Err(CallError::Clearing);
        }
        self.on_new_connection(call, connection.as_ref());
        Ok(connection)
    }

    /// Call by token
    pub fn find_call(&self, token: &str) -> Option<Arc<Call>> {
        self.calls.read().get(token).cloned()
    }

    /// True if `token` names an active call
    pub fn has_call(&self, token: &str) -> bool {
        self.calls.read().contains_key(token)
    }

    /// Number of active calls
    pub fn call_count(&self) -> usize {
        self.calls.read().len()
    }

    /// Summaries of every active call
    pub fn call_summaries(&self) -> Vec<CallSummary> {
        let calls: Vec<Arc<Call>> = self.calls.read().values().cloned().collect();
        calls.iter().map(|c| c.summary()).collect()
    }

    /// Clear the call named by `token`
    ///
    /// # Errors
    ///
    /// Returns error if no such call exists
    pub fn clear_call(
        &self,
        token: &str,
        reason: CallEndReason,
        sync: Option<oneshot::Sender<CallEndReason>>,
    ) -> Result<(), CallError> {
        let call = self
            .find_call(token)
            .ok_or_else(|| CallError::CallNotFound(token.to_string()))?;
        call.clear(reason, sync);
        Ok(())
    }

    /// Clear every call and wait until all of them are cleared
    pub async fn clear_all_calls(&self, reason: CallEndReason) {
        let calls: Vec<Arc<Call>> = self.calls.read().values().cloned().collect();
        tracing::info!(count = calls.len(), %reason, "Clearing all calls");

        let mut waiting = Vec::with_capacity(calls.len());
        for call in calls {
            let (tx, rx) = oneshot::channel();
            call.clear(reason, Some(tx));
            waiting.push(rx);
        }
        for rx in waiting {
            // A dropped sender means the call went away without signalling.
            let _ = rx.await;
        }
    }

    // ------------------------------------------------------------------------
    // Media policy
    // ------------------------------------------------------------------------

    /// Apply the configured mask and order to a format list
    pub fn adjust_media_formats(
        &self,
        local: bool,
        connection: Option<&dyn Connection>,
        formats: &mut MediaFormatList,
    ) {
        for pattern in &self.config.media_format_mask {
            formats.remove_matching(pattern);
        }
        if !self.config.media_format_order.is_empty() {
            formats.reorder(&self.config.media_format_order);
        }
        tracing::trace!(
            local,
            connection = connection.map(|c| c.token()).unwrap_or_default(),
            formats = %formats,
            "Adjusted media formats"
        );
    }

    /// Whether media between `a` and `b` for a session may bypass the
    /// local pipeline
    pub fn is_media_bypass_possible(
        &self,
        a: &dyn Connection,
        b: &dyn Connection,
        session_id: u32,
    ) -> bool {
        self.config.allow_media_bypass
            && a.is_media_bypass_possible(session_id)
            && b.is_media_bypass_possible(session_id)
    }

    /// Create the patch for a source stream
    ///
    /// # Errors
    ///
    /// Returns error if the stream is not a source
    pub fn create_media_patch(
        &self,
        source: &Arc<dyn MediaStream>,
        requires_thread: bool,
    ) -> Result<Arc<MediaPatch>, CallError> {
        Ok(MediaPatch::new(
            Arc::clone(source),
            Arc::clone(&self.registry),
            self.config.patch.clone(),
            requires_thread,
        )?)
    }

    // ------------------------------------------------------------------------
    // Call notifications
    // ------------------------------------------------------------------------

    /// A connection was added to a call
    pub fn on_new_connection(&self, call: &Call, connection: &dyn Connection) {
        tracing::debug!(call = %call.token(), connection = %connection.token(), "New connection");
        self.emit(CallEvent::NewConnection {
            call: call.token().to_string(),
            connection: connection.token(),
        });
    }

    /// A call became established
    pub fn on_established_call(&self, call: &Call) {
        self.emit(CallEvent::Established {
            call: call.token().to_string(),
        });
    }

    /// A call has no connections left: drop it from the registry
    pub fn on_cleared_call(&self, call: &Call) {
        self.calls.write().remove(call.token());
        let reason = call.end_reason().unwrap_or(CallEndReason::LocalUser);
        tracing::debug!(call = %call.token(), %reason, remaining = self.call_count(), "Call removed");
        self.emit(CallEvent::Cleared {
            call: call.token().to_string(),
            reason,
        });
    }
}

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::watch;

use tandem_core::{ConversationId, PeerId};
use tandem_vendor::{
    ChannelState, Identity, ListenerId, ListenerScope, RawEvent, RawHandler, VendorClient,
    VendorError,
};

/// Holds a scripted vendor call in flight until [`Gate::release`] is called.
#[derive(Debug, Clone)]
pub struct Gate(Arc<watch::Sender<bool>>);

impl Gate {
    fn new() -> Self {
        Self(Arc::new(watch::channel(false).0))
    }

    pub fn release(&self) {
        self.0.send_replace(true);
    }

    async fn passed(&self) {
        let mut rx = self.0.subscribe();
        let _ = rx.wait_for(|open| *open).await;
    }
}

#[derive(Default)]
struct FakeState {
    channels: HashMap<ConversationId, Result<ChannelState, VendorError>>,
    channel_gates: HashMap<ConversationId, Gate>,
    presence: HashMap<PeerId, bool>,
    presence_error: Option<VendorError>,
    presence_gate: Option<Gate>,
    connect_error: Option<VendorError>,
    listeners: HashMap<ListenerId, (ListenerScope, RawHandler)>,
    retired: Vec<(ListenerScope, RawHandler)>,
    watch_calls: Vec<ConversationId>,
    presence_calls: Vec<Vec<PeerId>>,
    connect_calls: usize,
    disconnect_calls: usize,
}

/// In-memory [`VendorClient`] with scripted answers.
///
/// Unscripted channels report zero unread messages and unscripted peers are
/// left out of presence answers, as the real vendor does for unknown users.
pub struct FakeVendorClient {
    channel_type: String,
    connected: AtomicBool,
    next_listener: AtomicU64,
    state: Mutex<FakeState>,
}

impl Default for FakeVendorClient {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeVendorClient {
    pub fn new() -> Self {
        Self::with_channel_type("messaging")
    }

    pub fn with_channel_type(channel_type: impl Into<String>) -> Self {
        Self {
            channel_type: channel_type.into(),
            connected: AtomicBool::new(false),
            next_listener: AtomicU64::new(1),
            state: Mutex::new(FakeState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_unread(&self, conversation: &ConversationId, unread_count: u32) {
        let mut state = self.state();
        match state
            .channels
            .entry(conversation.clone())
            .or_insert_with(|| Ok(ChannelState::default()))
        {
            Ok(channel) => channel.unread_count = unread_count,
            failed => {
                *failed = Ok(ChannelState {
                    unread_count,
                    read: Vec::new(),
                })
            }
        }
    }

    pub fn set_channel(&self, conversation: &ConversationId, state: ChannelState) {
        self.state()
            .channels
            .insert(conversation.clone(), Ok(state));
    }

    pub fn fail_channel(&self, conversation: &ConversationId, error: VendorError) {
        self.state()
            .channels
            .insert(conversation.clone(), Err(error));
    }

    pub fn set_presence(&self, peer: &PeerId, online: bool) {
        self.state().presence.insert(peer.clone(), online);
    }

    pub fn fail_presence(&self, error: Option<VendorError>) {
        self.state().presence_error = error;
    }

    pub fn fail_connect(&self, error: Option<VendorError>) {
        self.state().connect_error = error;
    }

    /// Hold every `watch_channel` call for `conversation` until released.
    pub fn hold_channel(&self, conversation: &ConversationId) -> Gate {
        let gate = Gate::new();
        self.state()
            .channel_gates
            .insert(conversation.clone(), gate.clone());
        gate
    }

    /// Hold every `query_presence` call until released.
    pub fn hold_presence(&self) -> Gate {
        let gate = Gate::new();
        self.state().presence_gate = Some(gate.clone());
        gate
    }

    /// Deliver `raw` to every live listener whose scope covers it. Returns the
    /// number of handlers called.
    pub fn emit(&self, raw: &RawEvent) -> usize {
        let handlers: Vec<RawHandler> = self
            .state()
            .listeners
            .values()
            .filter(|(scope, _)| self.covers(scope, raw))
            .map(|(_, handler)| handler.clone())
            .collect();
        for handler in &handlers {
            handler(raw);
        }
        handlers.len()
    }

    /// Deliver `raw` to handlers that were already deregistered, the way a
    /// vendor callback racing with `off` would.
    pub fn emit_to_retired(&self, raw: &RawEvent) -> usize {
        let handlers: Vec<RawHandler> = self
            .state()
            .retired
            .iter()
            .filter(|(scope, _)| self.covers(scope, raw))
            .map(|(_, handler)| handler.clone())
            .collect();
        for handler in &handlers {
            handler(raw);
        }
        handlers.len()
    }

    pub fn listener_count(&self) -> usize {
        self.state().listeners.len()
    }

    pub fn listeners_for(&self, scope: &ListenerScope) -> usize {
        self.state()
            .listeners
            .values()
            .filter(|(registered, _)| registered == scope)
            .count()
    }

    pub fn listener_scopes(&self) -> Vec<ListenerScope> {
        self.state()
            .listeners
            .values()
            .map(|(scope, _)| scope.clone())
            .collect()
    }

    pub fn watch_calls(&self) -> Vec<ConversationId> {
        self.state().watch_calls.clone()
    }

    pub fn presence_calls(&self) -> Vec<Vec<PeerId>> {
        self.state().presence_calls.clone()
    }

    pub fn connect_calls(&self) -> usize {
        self.state().connect_calls
    }

    pub fn disconnect_calls(&self) -> usize {
        self.state().disconnect_calls
    }

    fn covers(&self, scope: &ListenerScope, raw: &RawEvent) -> bool {
        let value = raw.as_value();
        match scope {
            ListenerScope::Conversation(conversation) => value
                .get("cid")
                .and_then(Value::as_str)
                .and_then(|cid| ConversationId::from_vendor_cid(cid, &self.channel_type))
                .is_some_and(|cid| &cid == conversation),
            ListenerScope::User(peer) => {
                value.get("cid").is_none()
                    && value
                        .get("user")
                        .and_then(|user| user.get("id"))
                        .and_then(Value::as_str)
                        .is_some_and(|id| id == peer.as_str())
            }
        }
    }
}

impl VendorClient for FakeVendorClient {
    async fn connect(&self, _identity: &Identity, _token: &str) -> Result<(), VendorError> {
        let mut state = self.state();
        state.connect_calls += 1;
        if let Some(error) = state.connect_error.clone() {
            return Err(error);
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) -> Result<(), VendorError> {
        self.state().disconnect_calls += 1;
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn watch_channel(
        &self,
        conversation: &ConversationId,
    ) -> Result<ChannelState, VendorError> {
        let gate = {
            let mut state = self.state();
            state.watch_calls.push(conversation.clone());
            state.channel_gates.get(conversation).cloned()
        };
        if let Some(gate) = gate {
            gate.passed().await;
        }
        self.state()
            .channels
            .get(conversation)
            .cloned()
            .unwrap_or_else(|| Ok(ChannelState::default()))
    }

    async fn query_presence(
        &self,
        peers: &[PeerId],
    ) -> Result<HashMap<PeerId, bool>, VendorError> {
        let gate = {
            let mut state = self.state();
            state.presence_calls.push(peers.to_vec());
            state.presence_gate.clone()
        };
        if let Some(gate) = gate {
            gate.passed().await;
        }
        let state = self.state();
        if let Some(error) = state.presence_error.clone() {
            return Err(error);
        }
        Ok(peers
            .iter()
            .filter_map(|peer| state.presence.get(peer).map(|online| (peer.clone(), *online)))
            .collect())
    }

    fn on(&self, scope: ListenerScope, handler: RawHandler) -> ListenerId {
        let id = ListenerId::new(self.next_listener.fetch_add(1, Ordering::SeqCst));
        self.state().listeners.insert(id, (scope, handler));
        id
    }

    fn off(&self, id: ListenerId) -> bool {
        let mut state = self.state();
        match state.listeners.remove(&id) {
            Some(listener) => {
                state.retired.push(listener);
                true
            }
            None => false,
        }
    }
}

//! Owns the vendor listeners for the current peer set.
//!
//! Every listener is registered with the scope generation current at
//! registration time. Rebuilding the scope or detaching bumps the generation
//! first, so a callback the vendor delivers to an already deregistered
//! listener finds itself stale and leaves the ledger and table alone.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, watch};
use tracing::{debug, error, info, trace, warn};

use tandem_core::event::{EventBus, EventPayload, EventSource};
use tandem_core::{ConversationId, PeerId, PeerIdError};
use tandem_presence::{PendingSnapshot, PresenceError, PresenceTable};
use tandem_unread::{InitReport, PendingFetch, UnreadLedger};
use tandem_vendor::{
    ActivityEvent, EventNormalizer, Identity, ListenerId, ListenerScope, RawEvent, RawHandler,
    VendorClient, VendorError,
};

const SUBSCRIPTION_SOURCE: &str = "subscription";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Disconnected,
    Connecting,
    Attached,
    Detaching,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Disconnected => "disconnected",
            LifecycleState::Connecting => "connecting",
            LifecycleState::Attached => "attached",
            LifecycleState::Detaching => "detaching",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
    #[error("vendor token is missing")]
    MissingToken,

    #[error("invalid peer id: {0}")]
    InvalidPeerId(#[from] PeerIdError),

    #[error("failed to connect to vendor: {0}")]
    Connect(#[source] VendorError),

    #[error("vendor disconnect failed: {0}")]
    Disconnect(#[source] VendorError),

    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: LifecycleState,
    },
}

impl SubscriptionError {
    /// Whether the UI should offer a retry.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, SubscriptionError::Connect(_))
    }
}

/// Outcome of attaching to, or rebuilding, a peer set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttachReport {
    pub unread: InitReport,
    /// The presence snapshot failed; flags stay at their previous values.
    pub presence_degraded: bool,
    /// A later rebuild or detach overtook this one.
    pub superseded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ListenerPair {
    messages: ListenerId,
    presence: ListenerId,
}

struct PendingScope {
    generation: u64,
    unread: PendingFetch,
    presence: PendingSnapshot,
}

/// What the vendor callbacks write into.
struct ActivitySink {
    ledger: UnreadLedger,
    presence: PresenceTable,
    normalizer: EventNormalizer,
    event_bus: Arc<dyn EventBus>,
    scope_generation: AtomicU64,
}

impl ActivitySink {
    fn handle(&self, generation: u64, raw: &RawEvent) {
        if self.scope_generation.load(Ordering::SeqCst) != generation {
            trace!(generation, "event for a retired listener ignored");
            return;
        }
        let Some(event) = self.normalizer.normalize(raw) else {
            return;
        };

        let (channel, payload) = match event {
            ActivityEvent::MessageArrived(arrived) => {
                if let Some(count) = self.ledger.on_message_arrived(&arrived) {
                    trace!(peer = %arrived.peer, count, "arrival applied");
                }
                (
                    "activity.message.arrived",
                    EventPayload::MessageArrived {
                        peer: arrived.peer,
                        conversation_id: arrived.conversation_id,
                        sent_at: arrived.timestamp,
                        preview: arrived.preview,
                    },
                )
            }
            ActivityEvent::MessageRead(read) => {
                self.ledger.on_message_read(&read);
                (
                    "activity.message.read",
                    EventPayload::MessageRead {
                        by_peer: read.by_peer,
                        conversation_id: read.conversation_id,
                        read_at: read.timestamp,
                    },
                )
            }
            ActivityEvent::PresenceChanged(changed) => {
                self.presence.on_presence_changed(&changed);
                (
                    "activity.presence.changed",
                    EventPayload::PresenceChanged {
                        peer: changed.peer,
                        online: changed.online,
                    },
                )
            }
        };

        if let Err(error) = self.event_bus.emit(channel, EventSource::Vendor, payload) {
            warn!(error = %error, channel, "failed to publish activity");
        }
    }
}

pub struct SubscriptionManager<C: VendorClient> {
    client: Arc<C>,
    identity: Identity,
    sink: Arc<ActivitySink>,
    listeners: Mutex<HashMap<PeerId, ListenerPair>>,
    lifecycle: AsyncMutex<()>,
    state: watch::Sender<LifecycleState>,
}

impl<C: VendorClient> SubscriptionManager<C> {
    pub fn new(
        client: Arc<C>,
        identity: Identity,
        channel_type: &str,
        event_bus: Arc<dyn EventBus>,
    ) -> Self {
        let (state, _) = watch::channel(LifecycleState::Disconnected);
        let sink = ActivitySink {
            ledger: UnreadLedger::new(identity.id.clone()),
            presence: PresenceTable::new(),
            normalizer: EventNormalizer::new(channel_type),
            event_bus,
            scope_generation: AtomicU64::new(0),
        };
        Self {
            client,
            identity,
            sink: Arc::new(sink),
            listeners: Mutex::new(HashMap::new()),
            lifecycle: AsyncMutex::new(()),
            state,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn ledger(&self) -> &UnreadLedger {
        &self.sink.ledger
    }

    pub fn presence(&self) -> &PresenceTable {
        &self.sink.presence
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    pub fn tracked_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.listeners().keys().cloned().collect();
        peers.sort();
        peers
    }

    fn listeners(&self) -> MutexGuard<'_, HashMap<PeerId, ListenerPair>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Connect if needed, register listeners for `peers` and load their
    /// unread counts and presence.
    pub async fn attach(
        &self,
        token: &str,
        peers: &[PeerId],
    ) -> Result<AttachReport, SubscriptionError> {
        if token.trim().is_empty() {
            return Err(SubscriptionError::MissingToken);
        }

        let pending = {
            let _lifecycle = self.lifecycle.lock().await;
            let state = self.state();
            if state != LifecycleState::Disconnected {
                return Err(SubscriptionError::InvalidState {
                    operation: "attach",
                    state,
                });
            }
            self.set_state(LifecycleState::Connecting);

            if !self.client.is_connected() {
                info!(user = %self.identity.id, "connecting to vendor");
                if let Err(error) = self.client.connect(&self.identity, token).await {
                    error!(user = %self.identity.id, error = %error, "vendor connection failed");
                    self.publish_system(
                        "system.connection.failed",
                        EventPayload::ConnectionFailed {
                            reason: error.to_string(),
                            recoverable: true,
                        },
                    );
                    self.set_state(LifecycleState::Disconnected);
                    return Err(SubscriptionError::Connect(error));
                }
            }

            self.rebuild_scope(peers)
        };

        Ok(self.complete(pending).await)
    }

    /// Swap the peer set on a live connection. Every old listener is gone
    /// before the first new one is registered.
    pub async fn replace_peers(&self, peers: &[PeerId]) -> Result<AttachReport, SubscriptionError> {
        let pending = {
            let _lifecycle = self.lifecycle.lock().await;
            let state = self.state();
            if !matches!(state, LifecycleState::Attached | LifecycleState::Connecting) {
                return Err(SubscriptionError::InvalidState {
                    operation: "replace peers",
                    state,
                });
            }
            self.set_state(LifecycleState::Detaching);
            let pending = self.rebuild_scope(peers);
            self.set_state(LifecycleState::Connecting);
            pending
        };

        Ok(self.complete(pending).await)
    }

    /// Drop every listener and forget all counts and flags. The vendor
    /// connection stays open for its owner.
    pub async fn detach(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        if self.state() == LifecycleState::Disconnected {
            return;
        }
        self.set_state(LifecycleState::Detaching);
        let generation = self.sink.scope_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let removed = self.deregister_all(&mut self.listeners());
        self.sink.ledger.clear();
        self.sink.presence.clear();
        self.set_state(LifecycleState::Disconnected);
        info!(generation, listeners = removed, "detached from vendor events");
    }

    /// Session end: detach, then close the vendor connection.
    pub async fn disconnect(&self) -> Result<(), SubscriptionError> {
        self.detach().await;
        if !self.client.is_connected() {
            return Ok(());
        }
        self.client.disconnect().await.map_err(|error| {
            warn!(error = %error, "vendor disconnect failed");
            SubscriptionError::Disconnect(error)
        })
    }

    fn rebuild_scope(&self, peers: &[PeerId]) -> PendingScope {
        let peers = self.scope_peers(peers);
        let generation = self.sink.scope_generation.fetch_add(1, Ordering::SeqCst) + 1;

        let mut listeners = self.listeners();
        let removed = self.deregister_all(&mut listeners);

        let unread = self.sink.ledger.track(&peers);
        let presence = self.sink.presence.track(&peers);

        for peer in &peers {
            let conversation = ConversationId::between(&self.identity.id, peer);
            let pair = ListenerPair {
                messages: self.client.on(
                    ListenerScope::Conversation(conversation),
                    self.handler(generation),
                ),
                presence: self
                    .client
                    .on(ListenerScope::User(peer.clone()), self.handler(generation)),
            };
            listeners.insert(peer.clone(), pair);
        }

        debug!(
            generation,
            removed,
            registered = listeners.len(),
            "listener scope rebuilt"
        );
        PendingScope {
            generation,
            unread,
            presence,
        }
    }

    async fn complete(&self, pending: PendingScope) -> AttachReport {
        let PendingScope {
            generation,
            unread,
            presence,
        } = pending;
        let client = &*self.client;

        let (unread, presence) = tokio::join!(
            self.sink.ledger.fetch(client, unread),
            self.sink.presence.fetch(client, presence)
        );

        let mut report = AttachReport {
            superseded: unread.superseded,
            unread,
            presence_degraded: false,
        };
        match presence {
            Ok(()) => {}
            Err(PresenceError::Superseded) => report.superseded = true,
            Err(error) => {
                warn!(error = %error, "continuing without a presence snapshot");
                report.presence_degraded = true;
            }
        }

        let _lifecycle = self.lifecycle.lock().await;
        if self.sink.scope_generation.load(Ordering::SeqCst) == generation {
            self.set_state(LifecycleState::Attached);
        } else {
            debug!(generation, "scope replaced before initialization finished");
            report.superseded = true;
        }
        report
    }

    fn scope_peers(&self, peers: &[PeerId]) -> Vec<PeerId> {
        let mut seen = HashSet::with_capacity(peers.len());
        peers
            .iter()
            .filter(|peer| {
                if **peer == self.identity.id {
                    warn!(peer = %peer, "ignoring own id in peer set");
                    return false;
                }
                seen.insert((*peer).clone())
            })
            .cloned()
            .collect()
    }

    fn deregister_all(&self, listeners: &mut HashMap<PeerId, ListenerPair>) -> usize {
        let mut removed = 0;
        for (peer, pair) in listeners.drain() {
            for id in [pair.messages, pair.presence] {
                if self.client.off(id) {
                    removed += 1;
                } else {
                    debug!(peer = %peer, listener = id.as_u64(), "listener already gone");
                }
            }
        }
        removed
    }

    fn handler(&self, generation: u64) -> RawHandler {
        let sink = self.sink.clone();
        Arc::new(move |raw: &RawEvent| sink.handle(generation, raw))
    }

    fn set_state(&self, next: LifecycleState) {
        let changed = self.state.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            *state = next;
            true
        });
        if changed {
            debug!(state = %next, "lifecycle changed");
            self.publish_system(
                "system.lifecycle.changed",
                EventPayload::LifecycleChanged {
                    state: next.to_string(),
                },
            );
        }
    }

    fn publish_system(&self, channel: &str, payload: EventPayload) {
        let source = EventSource::System(SUBSCRIPTION_SOURCE.to_string());
        if let Err(error) = self.sink.event_bus.emit(channel, source, payload) {
            warn!(error = %error, channel, "failed to publish lifecycle event");
        }
    }
}

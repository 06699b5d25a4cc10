//! Unread message counts per tracked peer.
//!
//! Each peer starts out pending while its authoritative count is fetched.
//! Events for a pending peer are applied to the visible count right away and
//! also queued; when the baseline lands the queue is replayed on top of it, so
//! nothing that arrived during the fetch is lost or counted against a stale
//! value. Every `initialize` and `clear` bumps a generation, and fetch results
//! tagged with an older generation are dropped.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use tandem_core::{ConversationId, PeerId, TandemError};
use tandem_vendor::{ChannelState, MessageArrived, MessageRead, VendorClient, VendorError};

use crate::receipts::{DeliveryStatus, ReadReceipts};

/// Read-only view handed to the UI.
pub type UnreadMap = BTreeMap<PeerId, u32>;

/// Outcome of one [`UnreadLedger::initialize`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitReport {
    /// Peers whose authoritative count landed, in completion order.
    pub ready: Vec<PeerId>,
    /// Peers whose fetch failed; their baseline is 0.
    pub degraded: Vec<PeerId>,
    /// The ledger was cleared or re-initialised before every fetch landed.
    pub superseded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    /// `counted` is false when the conversation was open at arrival time.
    Arrived { counted: bool },
    Read,
}

fn apply(count: u32, op: Op) -> u32 {
    match op {
        Op::Arrived { counted: true } => count.saturating_add(1),
        Op::Arrived { counted: false } => count,
        Op::Read => 0,
    }
}

#[derive(Debug)]
struct Entry {
    conversation: ConversationId,
    count: u32,
    /// `Some` while the authoritative count is in flight.
    queued: Option<Vec<Op>>,
    degraded: bool,
}

#[derive(Debug, Default)]
struct LedgerState {
    generation: u64,
    entries: HashMap<PeerId, Entry>,
    conversations: HashMap<ConversationId, PeerId>,
    active: Option<ConversationId>,
    receipts: ReadReceipts,
}

/// Peers tracked by [`UnreadLedger::track`] whose counts are still to be
/// fetched.
#[derive(Debug)]
#[must_use]
pub struct PendingFetch {
    generation: u64,
    fetches: Vec<(PeerId, ConversationId)>,
}

impl PendingFetch {
    pub fn len(&self) -> usize {
        self.fetches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fetches.is_empty()
    }
}

enum Landed {
    Ready,
    Degraded,
    Stale,
}

pub struct UnreadLedger {
    self_id: PeerId,
    state: Mutex<LedgerState>,
    view: watch::Sender<UnreadMap>,
}

impl UnreadLedger {
    pub fn new(self_id: PeerId) -> Self {
        let (view, _) = watch::channel(UnreadMap::new());
        Self {
            self_id,
            state: Mutex::new(LedgerState::default()),
            view,
        }
    }

    pub fn self_id(&self) -> &PeerId {
        &self.self_id
    }

    fn state(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track `peers` and fetch their authoritative counts concurrently.
    ///
    /// Peers no longer in `peers` are dropped. Peers already tracked keep
    /// showing their previous count until their new baseline lands. A failed
    /// fetch degrades only that peer and is never returned as an error.
    pub async fn initialize<C: VendorClient>(&self, client: &C, peers: &[PeerId]) -> InitReport {
        let pending = self.track(peers);
        self.fetch(client, pending).await
    }

    /// First half of [`UnreadLedger::initialize`]: start tracking `peers`
    /// with their counts pending. Events for them are queued from here on.
    pub fn track(&self, peers: &[PeerId]) -> PendingFetch {
        let mut guard = self.state();
        let state = &mut *guard;
        state.generation += 1;

        let mut entries = HashMap::with_capacity(peers.len());
        let mut fetches = Vec::with_capacity(peers.len());
        for peer in peers {
            if entries.contains_key(peer) {
                continue;
            }
            let conversation = ConversationId::between(&self.self_id, peer);
            let count = state.entries.get(peer).map_or(0, |entry| entry.count);
            entries.insert(
                peer.clone(),
                Entry {
                    conversation: conversation.clone(),
                    count,
                    queued: Some(Vec::new()),
                    degraded: false,
                },
            );
            fetches.push((peer.clone(), conversation));
        }

        state.conversations = entries
            .iter()
            .map(|(peer, entry)| (entry.conversation.clone(), peer.clone()))
            .collect();
        state.entries = entries;
        let entries = &state.entries;
        state.receipts.retain(|peer| entries.contains_key(peer));

        debug!(
            generation = state.generation,
            peers = fetches.len(),
            "tracking peers, counts pending"
        );
        self.publish(state);
        PendingFetch {
            generation: state.generation,
            fetches,
        }
    }

    /// Second half of [`UnreadLedger::initialize`]. Baselines land in
    /// completion order.
    pub async fn fetch<C: VendorClient>(&self, client: &C, pending: PendingFetch) -> InitReport {
        let PendingFetch {
            generation,
            fetches,
        } = pending;

        let mut in_flight: FuturesUnordered<_> = fetches
            .into_iter()
            .map(move |(peer, conversation)| async move {
                let result = client.watch_channel(&conversation).await;
                (peer, result)
            })
            .collect();

        let mut report = InitReport::default();
        while let Some((peer, result)) = in_flight.next().await {
            match self.land(generation, &peer, result) {
                Landed::Ready => report.ready.push(peer),
                Landed::Degraded => report.degraded.push(peer),
                Landed::Stale => {
                    report.superseded = true;
                    break;
                }
            }
        }

        debug!(
            generation,
            ready = report.ready.len(),
            degraded = report.degraded.len(),
            superseded = report.superseded,
            "unread ledger initialized"
        );
        report
    }

    fn land(
        &self,
        generation: u64,
        peer: &PeerId,
        result: Result<ChannelState, VendorError>,
    ) -> Landed {
        let mut guard = self.state();
        let state = &mut *guard;
        if state.generation != generation {
            debug!(peer = %peer, generation, "discarding unread count from a previous generation");
            return Landed::Stale;
        }
        let Some(entry) = state.entries.get_mut(peer) else {
            return Landed::Stale;
        };

        let (baseline, landed) = match result {
            Ok(channel) => {
                for marker in channel.read.iter().filter(|marker| &marker.user == peer) {
                    state.receipts.record(peer, marker.last_read);
                }
                entry.degraded = false;
                (channel.unread_count, Landed::Ready)
            }
            Err(error) => {
                let error = TandemError::PerPeerFetch {
                    peer: peer.to_string(),
                    message: error.to_string(),
                };
                warn!(peer = %peer, error = %error, "unread fetch failed, peer degraded");
                entry.degraded = true;
                (0, Landed::Degraded)
            }
        };

        let queued = entry.queued.take().unwrap_or_default();
        let replayed = queued.len();
        entry.count = queued.into_iter().fold(baseline, apply);
        debug!(peer = %peer, baseline, replayed, count = entry.count, "unread baseline landed");

        self.publish(state);
        landed
    }

    /// Count one arrival from the tracked peer of `event.conversation_id`.
    /// Returns the peer's count when the event was applied.
    pub fn on_message_arrived(&self, event: &MessageArrived) -> Option<u32> {
        if event.peer == self.self_id {
            trace!(conversation = %event.conversation_id, "own message, not counted");
            return None;
        }
        let mut state = self.state();
        let Some(peer) = state.conversations.get(&event.conversation_id).cloned() else {
            trace!(conversation = %event.conversation_id, "arrival for untracked conversation");
            return None;
        };
        if peer != event.peer {
            return None;
        }
        let counted = state.active.as_ref() != Some(&event.conversation_id);
        self.record(&mut state, &peer, Op::Arrived { counted })
    }

    /// Our own reads reset the count; a peer's read advances its receipt.
    /// Returns the peer's count when the read was ours.
    pub fn on_message_read(&self, event: &MessageRead) -> Option<u32> {
        let mut state = self.state();
        let peer = state.conversations.get(&event.conversation_id).cloned()?;
        if event.by_peer == self.self_id {
            return self.record(&mut state, &peer, Op::Read);
        }
        if event.by_peer == peer && state.receipts.record(&peer, event.timestamp) {
            trace!(peer = %peer, read_at = %event.timestamp, "read receipt advanced");
        }
        None
    }

    /// Optimistic reset when the user reads a conversation locally.
    pub fn mark_read_locally(&self, peer: &PeerId) -> Option<u32> {
        let mut state = self.state();
        self.record(&mut state, peer, Op::Read)
    }

    /// Record which conversation the UI has open; arrivals there are not
    /// counted.
    pub fn set_active_conversation(&self, peer: Option<&PeerId>) {
        let active = peer.map(|peer| ConversationId::between(&self.self_id, peer));
        debug!(
            conversation = ?active.as_ref().map(ConversationId::as_str),
            "active conversation changed"
        );
        self.state().active = active;
    }

    pub fn active_conversation(&self) -> Option<ConversationId> {
        self.state().active.clone()
    }

    fn record(&self, state: &mut LedgerState, peer: &PeerId, op: Op) -> Option<u32> {
        let entry = state.entries.get_mut(peer)?;
        if let Some(queue) = entry.queued.as_mut() {
            queue.push(op);
        }
        let before = entry.count;
        entry.count = apply(before, op);
        let count = entry.count;
        if count != before {
            debug!(peer = %peer, before, count, "unread count changed");
            self.publish(state);
        }
        Some(count)
    }

    fn publish(&self, state: &LedgerState) {
        let counts: UnreadMap = state
            .entries
            .iter()
            .map(|(peer, entry)| (peer.clone(), entry.count))
            .collect();
        self.view.send_if_modified(|current| {
            if *current == counts {
                return false;
            }
            *current = counts;
            true
        });
    }

    pub fn count(&self, peer: &PeerId) -> Option<u32> {
        self.state().entries.get(peer).map(|entry| entry.count)
    }

    pub fn counts(&self) -> UnreadMap {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<UnreadMap> {
        self.view.subscribe()
    }

    pub fn tracked_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.state().entries.keys().cloned().collect();
        peers.sort();
        peers
    }

    pub fn is_pending(&self, peer: &PeerId) -> bool {
        self.state()
            .entries
            .get(peer)
            .is_some_and(|entry| entry.queued.is_some())
    }

    pub fn degraded_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .state()
            .entries
            .iter()
            .filter(|(_, entry)| entry.degraded)
            .map(|(peer, _)| peer.clone())
            .collect();
        peers.sort();
        peers
    }

    pub fn last_read_by(&self, peer: &PeerId) -> Option<DateTime<Utc>> {
        self.state().receipts.last_read(peer)
    }

    /// Status badge for one of our own messages to `peer`.
    pub fn delivery_status(
        &self,
        peer: &PeerId,
        sent_at: DateTime<Utc>,
        delivered: bool,
    ) -> DeliveryStatus {
        self.state().receipts.status_of(peer, sent_at, delivered)
    }

    /// Forget every peer. Fetches still in flight are discarded when they
    /// land.
    pub fn clear(&self) {
        let mut state = self.state();
        state.generation += 1;
        state.entries.clear();
        state.conversations.clear();
        state.active = None;
        state.receipts.clear();
        info!(generation = state.generation, "unread ledger cleared");
        self.publish(&state);
    }
}

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use tandem_core::PeerId;
use tandem_vendor::{PresenceChanged, VendorClient, VendorError};

/// Read-only view handed to the UI. Every tracked peer has a flag.
pub type PresenceMap = BTreeMap<PeerId, bool>;

#[derive(Debug, thiserror::Error)]
pub enum PresenceError {
    #[error("presence query failed: {0}")]
    Query(#[from] VendorError),

    #[error("presence snapshot superseded by a newer peer set")]
    Superseded,
}

#[derive(Debug, Default)]
struct TableState {
    generation: u64,
    online: HashMap<PeerId, bool>,
    /// `Some` while a snapshot is in flight.
    queued: Option<Vec<PresenceChanged>>,
}

/// Peers tracked by [`PresenceTable::track`] awaiting their snapshot.
#[derive(Debug)]
#[must_use]
pub struct PendingSnapshot {
    generation: u64,
    peers: Vec<PeerId>,
}

pub struct PresenceTable {
    state: Mutex<TableState>,
    view: watch::Sender<PresenceMap>,
}

impl Default for PresenceTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceTable {
    pub fn new() -> Self {
        let (view, _) = watch::channel(PresenceMap::new());
        Self {
            state: Mutex::new(TableState::default()),
            view,
        }
    }

    fn state(&self) -> MutexGuard<'_, TableState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// One batched presence lookup for the whole peer set.
    ///
    /// Peers missing from the answer are offline. On failure every peer keeps
    /// its previous flag (offline if new) and the error is returned for the
    /// caller to log.
    pub async fn snapshot<C: VendorClient>(
        &self,
        client: &C,
        peers: &[PeerId],
    ) -> Result<(), PresenceError> {
        let pending = self.track(peers);
        self.fetch(client, pending).await
    }

    /// Start tracking `peers` with their flags pending. Presence events for
    /// them are queued until [`PresenceTable::fetch`] lands.
    pub fn track(&self, peers: &[PeerId]) -> PendingSnapshot {
        let mut state = self.state();
        state.generation += 1;
        let online: HashMap<PeerId, bool> = peers
            .iter()
            .map(|peer| {
                let previous = state.online.get(peer).copied().unwrap_or(false);
                (peer.clone(), previous)
            })
            .collect();
        state.online = online;
        state.queued = Some(Vec::new());
        debug!(generation = state.generation, peers = state.online.len(), "tracking presence");
        self.publish(&state);
        PendingSnapshot {
            generation: state.generation,
            peers: peers.to_vec(),
        }
    }

    pub async fn fetch<C: VendorClient>(
        &self,
        client: &C,
        pending: PendingSnapshot,
    ) -> Result<(), PresenceError> {
        let result = client.query_presence(&pending.peers).await;
        self.land(pending.generation, result)
    }

    fn land(
        &self,
        generation: u64,
        result: Result<HashMap<PeerId, bool>, VendorError>,
    ) -> Result<(), PresenceError> {
        let mut guard = self.state();
        let state = &mut *guard;
        if state.generation != generation {
            debug!(generation, "discarding presence snapshot from a previous generation");
            return Err(PresenceError::Superseded);
        }

        let outcome = match result {
            Ok(answer) => {
                for (peer, online) in state.online.iter_mut() {
                    *online = answer.get(peer).copied().unwrap_or(false);
                }
                Ok(())
            }
            Err(error) => {
                warn!(error = %error, "presence snapshot failed, keeping previous flags");
                Err(PresenceError::Query(error))
            }
        };

        let queued = state.queued.take().unwrap_or_default();
        let replayed = queued.len();
        for event in queued {
            if let Some(online) = state.online.get_mut(&event.peer) {
                *online = event.online;
            }
        }
        debug!(
            peers = state.online.len(),
            online = state.online.values().filter(|online| **online).count(),
            replayed,
            "presence snapshot landed"
        );
        self.publish(state);
        outcome
    }

    /// Overwrite the flag of a tracked peer. Returns the flag when applied.
    pub fn on_presence_changed(&self, event: &PresenceChanged) -> Option<bool> {
        let mut guard = self.state();
        let state = &mut *guard;
        let Some(online) = state.online.get_mut(&event.peer) else {
            trace!(peer = %event.peer, "presence for untracked peer ignored");
            return None;
        };
        *online = event.online;
        if let Some(queue) = state.queued.as_mut() {
            queue.push(event.clone());
        }
        debug!(peer = %event.peer, online = event.online, "presence changed");
        self.publish(state);
        Some(event.online)
    }

    /// `false` for peers that are offline or not tracked.
    pub fn is_online(&self, peer: &PeerId) -> bool {
        self.state().online.get(peer).copied().unwrap_or(false)
    }

    pub fn flag(&self, peer: &PeerId) -> Option<bool> {
        self.state().online.get(peer).copied()
    }

    pub fn flags(&self) -> PresenceMap {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PresenceMap> {
        self.view.subscribe()
    }

    pub fn is_pending(&self) -> bool {
        self.state().queued.is_some()
    }

    pub fn clear(&self) {
        let mut state = self.state();
        state.generation += 1;
        state.online.clear();
        state.queued = None;
        info!(generation = state.generation, "presence table cleared");
        self.publish(&state);
    }

    fn publish(&self, state: &TableState) {
        let flags: PresenceMap = state
            .online
            .iter()
            .map(|(peer, online)| (peer.clone(), *online))
            .collect();
        self.view.send_if_modified(|current| {
            if *current == flags {
                return false;
            }
            *current = flags;
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tandem_test_support::FakeVendorClient;
    use tracing_test::traced_test;

    fn peer(id: &str) -> PeerId {
        PeerId::new(id).unwrap()
    }

    fn changed(id: &str, online: bool) -> PresenceChanged {
        PresenceChanged {
            peer: peer(id),
            online,
        }
    }

    #[tokio::test]
    async fn snapshot_marks_missing_peers_offline() {
        let client = FakeVendorClient::new();
        client.set_presence(&peer("u2"), true);
        let table = PresenceTable::new();

        table.snapshot(&client, &[peer("u2"), peer("u3")]).await.unwrap();

        assert!(table.is_online(&peer("u2")));
        assert!(!table.is_online(&peer("u3")));
        assert_eq!(
            table.flags(),
            PresenceMap::from([(peer("u2"), true), (peer("u3"), false)])
        );
    }

    #[tokio::test]
    async fn snapshot_is_one_batched_query() {
        let client = FakeVendorClient::new();
        let table = PresenceTable::new();
        table
            .snapshot(&client, &[peer("u2"), peer("u3"), peer("u4")])
            .await
            .unwrap();
        assert_eq!(
            client.presence_calls(),
            vec![vec![peer("u2"), peer("u3"), peer("u4")]]
        );
    }

    #[tokio::test]
    async fn every_tracked_peer_has_a_flag() {
        let client = FakeVendorClient::new();
        let table = PresenceTable::new();
        let peers = [peer("u2"), peer("u3"), peer("u4")];
        table.snapshot(&client, &peers).await.unwrap();
        for p in &peers {
            assert_eq!(table.flag(p), Some(false));
        }
    }

    #[tokio::test]
    async fn events_overwrite_last_write_wins() {
        let client = FakeVendorClient::new();
        let table = PresenceTable::new();
        table.snapshot(&client, &[peer("u2")]).await.unwrap();

        assert_eq!(table.on_presence_changed(&changed("u2", true)), Some(true));
        assert_eq!(table.on_presence_changed(&changed("u2", false)), Some(false));
        assert_eq!(table.on_presence_changed(&changed("u2", true)), Some(true));
        assert!(table.is_online(&peer("u2")));
    }

    #[tokio::test]
    async fn untracked_peers_are_ignored() {
        let client = FakeVendorClient::new();
        let table = PresenceTable::new();
        table.snapshot(&client, &[peer("u2")]).await.unwrap();

        assert_eq!(table.on_presence_changed(&changed("u9", true)), None);
        assert_eq!(table.flag(&peer("u9")), None);
        assert!(!table.is_online(&peer("u9")));
    }

    #[tokio::test]
    #[traced_test]
    async fn failed_snapshot_keeps_previous_flags() {
        let client = FakeVendorClient::new();
        client.set_presence(&peer("u2"), true);
        let table = PresenceTable::new();
        table.snapshot(&client, &[peer("u2")]).await.unwrap();

        client.fail_presence(Some(VendorError::Network("reset".into())));
        let result = table.snapshot(&client, &[peer("u2"), peer("u3")]).await;

        assert_matches!(result, Err(PresenceError::Query(VendorError::Network(_))));
        assert_eq!(
            table.flags(),
            PresenceMap::from([(peer("u2"), true), (peer("u3"), false)])
        );
        assert!(logs_contain("presence snapshot failed"));
    }

    #[tokio::test]
    async fn snapshot_drops_peers_not_in_set() {
        let client = FakeVendorClient::new();
        client.set_presence(&peer("u2"), true);
        let table = PresenceTable::new();
        table.snapshot(&client, &[peer("u2"), peer("u3")]).await.unwrap();

        table.snapshot(&client, &[peer("u3")]).await.unwrap();
        assert_eq!(table.flags(), PresenceMap::from([(peer("u3"), false)]));
        assert_eq!(table.on_presence_changed(&changed("u2", false)), None);
    }

    #[tokio::test]
    async fn events_during_snapshot_replay_on_top() {
        let client = FakeVendorClient::new();
        client.set_presence(&peer("u2"), false);
        client.set_presence(&peer("u3"), true);
        let gate = client.hold_presence();
        let table = PresenceTable::new();

        let peers = [peer("u2"), peer("u3")];
        let (result, ()) = tokio::join!(
            table.snapshot(&client, &peers),
            async {
                tokio::task::yield_now().await;
                assert!(table.is_pending());
                table.on_presence_changed(&changed("u2", true));
                gate.release();
            }
        );

        result.unwrap();
        assert!(!table.is_pending());
        assert!(table.is_online(&peer("u2")));
        assert!(table.is_online(&peer("u3")));
    }

    #[tokio::test]
    async fn clear_discards_snapshot_in_flight() {
        let client = FakeVendorClient::new();
        client.set_presence(&peer("u2"), true);
        let gate = client.hold_presence();
        let table = PresenceTable::new();

        let peers = [peer("u2")];
        let (result, ()) = tokio::join!(table.snapshot(&client, &peers), async {
            tokio::task::yield_now().await;
            table.clear();
            gate.release();
        });

        assert_matches!(result, Err(PresenceError::Superseded));
        assert!(table.flags().is_empty());
        assert_eq!(table.on_presence_changed(&changed("u2", true)), None);
    }

    #[tokio::test]
    async fn subscribers_see_flag_changes() {
        let client = FakeVendorClient::new();
        let table = PresenceTable::new();
        table.snapshot(&client, &[peer("u2")]).await.unwrap();
        let mut flags = table.subscribe();
        flags.borrow_and_update();

        table.on_presence_changed(&changed("u2", false));
        assert!(!flags.has_changed().unwrap());

        table.on_presence_changed(&changed("u2", true));
        assert!(flags.has_changed().unwrap());
        assert_eq!(flags.borrow_and_update().get(&peer("u2")), Some(&true));
    }
}

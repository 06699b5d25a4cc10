use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, warn};

use tandem_core::config::Config;
use tandem_core::event::{EventBus, EventPayload, EventSource};
use tandem_core::{ConversationId, Peer, PeerId};
use tandem_notifications::NotificationManager;
use tandem_presence::PresenceMap;
use tandem_unread::{DeliveryStatus, UnreadMap};
use tandem_vendor::{Identity, VendorClient};

use crate::subscription::{AttachReport, LifecycleState, SubscriptionError, SubscriptionManager};

/// Build peers from `(id, display name)` pairs as the social graph hands
/// them out. Fails on the first invalid id.
pub fn peers_from_graph<I, S, N>(entries: I) -> Result<Vec<Peer>, SubscriptionError>
where
    I: IntoIterator<Item = (S, N)>,
    S: Into<String>,
    N: Into<String>,
{
    entries
        .into_iter()
        .map(|(id, display_name)| -> Result<Peer, SubscriptionError> {
            Ok(Peer::new(PeerId::new(id)?, display_name))
        })
        .collect()
}

fn peer_ids(peers: &[Peer]) -> Vec<PeerId> {
    peers.iter().map(|peer| peer.id.clone()).collect()
}

/// The UI-facing surface: two reactive maps, two mutators and the mount
/// lifecycle.
pub struct PeerActivityAggregator<C: VendorClient> {
    subscription: SubscriptionManager<C>,
    notifications: Arc<NotificationManager>,
    event_bus: Arc<dyn EventBus>,
    peers: Mutex<Vec<Peer>>,
    active_peer: Mutex<Option<PeerId>>,
    call_base_url: Option<String>,
}

impl<C: VendorClient> PeerActivityAggregator<C> {
    pub fn new(
        client: Arc<C>,
        identity: Identity,
        config: &Config,
        event_bus: Arc<dyn EventBus>,
    ) -> Self {
        let notifications = Arc::new(NotificationManager::new(
            identity.id.clone(),
            event_bus.clone(),
            config,
        ));
        let subscription = SubscriptionManager::new(
            client,
            identity,
            &config.vendor.channel_type,
            event_bus.clone(),
        );
        Self {
            subscription,
            notifications,
            event_bus,
            peers: Mutex::new(Vec::new()),
            active_peer: Mutex::new(None),
            call_base_url: config.ui.call_base_url.clone(),
        }
    }

    fn peers(&self) -> MutexGuard<'_, Vec<Peer>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn active_peer(&self) -> MutexGuard<'_, Option<PeerId>> {
        self.active_peer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach to `peers`. A rejected attach leaves the previous peer list in
    /// place.
    pub async fn mount(
        &self,
        token: &str,
        peers: &[Peer],
    ) -> Result<AttachReport, SubscriptionError> {
        let previous = self.remember_peers(peers);
        let result = self.subscription.attach(token, &peer_ids(peers)).await;
        if result.is_err() {
            self.restore_peers(previous);
        }
        result
    }

    pub async fn update_peers(&self, peers: &[Peer]) -> Result<AttachReport, SubscriptionError> {
        let previous = self.remember_peers(peers);
        let result = self.subscription.replace_peers(&peer_ids(peers)).await;
        if result.is_err() {
            self.restore_peers(previous);
        }
        result
    }

    pub async fn unmount(&self) {
        if let Err(error) = self.set_active_conversation(None) {
            warn!(error = %error, "failed to close active conversation");
        }
        self.subscription.detach().await;
        self.peers().clear();
    }

    /// Unmount and close the vendor connection.
    pub async fn end_session(&self) -> Result<(), SubscriptionError> {
        self.unmount().await;
        self.subscription.disconnect().await
    }

    /// Store `peers` and return the list it replaces.
    fn remember_peers(&self, peers: &[Peer]) -> Vec<Peer> {
        self.notifications.set_peers(peers);
        std::mem::replace(&mut *self.peers(), peers.to_vec())
    }

    fn restore_peers(&self, previous: Vec<Peer>) {
        debug!(peers = previous.len(), "peer change rejected, restoring previous peers");
        self.notifications.set_peers(&previous);
        *self.peers() = previous;
    }

    pub fn unread(&self) -> watch::Receiver<UnreadMap> {
        self.subscription.ledger().subscribe()
    }

    pub fn presence(&self) -> watch::Receiver<PresenceMap> {
        self.subscription.presence().subscribe()
    }

    pub fn unread_counts(&self) -> UnreadMap {
        self.subscription.ledger().counts()
    }

    pub fn presence_flags(&self) -> PresenceMap {
        self.subscription.presence().flags()
    }

    pub fn mark_read_locally(&self, peer: &PeerId) -> Option<u32> {
        self.subscription.ledger().mark_read_locally(peer)
    }

    /// Record the conversation the UI shows and announce the change on the
    /// bus. `None` closes the current one.
    pub fn set_active_conversation(&self, peer: Option<&str>) -> Result<(), SubscriptionError> {
        let next = peer.map(PeerId::new).transpose()?;
        let previous = {
            let mut active = self.active_peer();
            if *active == next {
                return Ok(());
            }
            std::mem::replace(&mut *active, next.clone())
        };

        self.subscription
            .ledger()
            .set_active_conversation(next.as_ref());
        debug!(
            previous = ?previous.as_ref().map(PeerId::as_str),
            next = ?next.as_ref().map(PeerId::as_str),
            "active conversation changed"
        );

        if let Some(peer) = previous {
            self.publish_ui("ui.conversation.closed", EventPayload::ConversationClosed { peer });
        }
        if let Some(peer) = next {
            self.publish_ui("ui.conversation.opened", EventPayload::ConversationOpened { peer });
        }
        Ok(())
    }

    pub fn active_conversation(&self) -> Option<PeerId> {
        self.active_peer().clone()
    }

    pub fn state(&self) -> LifecycleState {
        self.subscription.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<LifecycleState> {
        self.subscription.watch_state()
    }

    pub fn tracked_peers(&self) -> Vec<Peer> {
        self.peers().clone()
    }

    pub fn degraded_peers(&self) -> Vec<PeerId> {
        self.subscription.ledger().degraded_peers()
    }

    pub fn delivery_status(
        &self,
        peer: &PeerId,
        sent_at: DateTime<Utc>,
        delivered: bool,
    ) -> DeliveryStatus {
        self.subscription
            .ledger()
            .delivery_status(peer, sent_at, delivered)
    }

    /// Video call link for the conversation with `peer`, if a call service
    /// is configured.
    pub fn call_url(&self, peer: &PeerId) -> Option<String> {
        let base = self.call_base_url.as_deref()?;
        let conversation = ConversationId::between(&self.subscription.identity().id, peer);
        Some(conversation.call_url(base))
    }

    /// Run its `serve` loop to turn arrivals into notifications.
    pub fn notifications(&self) -> Arc<NotificationManager> {
        self.notifications.clone()
    }

    fn publish_ui(&self, channel: &str, payload: EventPayload) {
        if let Err(error) = self.event_bus.emit(channel, EventSource::Ui, payload) {
            warn!(error = %error, channel, "failed to publish ui event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tandem_core::PeerIdError;

    #[test]
    fn peers_from_graph_validates_ids() {
        let peers = peers_from_graph([("u2", "Lucía"), ("u3", "Marco")]).unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].display_name, "Lucía");

        assert_matches!(
            peers_from_graph([("u2", "Lucía"), ("", "Nobody")]),
            Err(SubscriptionError::InvalidPeerId(PeerIdError::Empty))
        );
        assert_matches!(
            peers_from_graph([("team:u4", "Team")]),
            Err(SubscriptionError::InvalidPeerId(PeerIdError::ContainsSeparator(_)))
        );
    }
}

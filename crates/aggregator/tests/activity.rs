use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use chrono::{TimeZone, Utc};
use serde_json::json;
use tokio_test::assert_ok;

use tandem_aggregator::{
    DeliveryStatus, LifecycleState, PeerActivityAggregator, PresenceMap, SubscriptionError,
    UnreadMap, peers_from_graph,
};
use tandem_core::config::Config;
use tandem_core::event::{BroadcastEventBus, EventBus, EventPayload};
use tandem_core::{Peer, PeerId, resolve};
use tandem_test_support::{FakeVendorClient, fixtures};
use tandem_vendor::{Identity, ListenerScope, RawEvent, VendorClient, VendorError};

fn peer(id: &str) -> PeerId {
    PeerId::new(id).unwrap()
}

fn friends() -> Vec<Peer> {
    peers_from_graph([("u2", "Lucía"), ("u3", "Marco")]).unwrap()
}

struct Harness {
    aggregator: PeerActivityAggregator<FakeVendorClient>,
    client: Arc<FakeVendorClient>,
    event_bus: Arc<dyn EventBus>,
}

fn harness() -> Harness {
    let mut config = Config::default();
    config.ui.call_base_url = Some("https://meet.tandem.app/".to_string());

    let client = Arc::new(FakeVendorClient::new());
    let event_bus: Arc<dyn EventBus> =
        Arc::new(BroadcastEventBus::from_config(&config.event_bus));
    let aggregator = PeerActivityAggregator::new(
        client.clone(),
        Identity::new(peer("u1"), "Sam"),
        &config,
        event_bus.clone(),
    );
    Harness {
        aggregator,
        client,
        event_bus,
    }
}

fn message_from(id: &str) -> RawEvent {
    RawEvent::new(json!({
        "type": "message.new",
        "cid": resolve("u1", id).unwrap().vendor_cid("messaging"),
        "user": { "id": id },
        "message": { "text": "hola" },
        "created_at": "2026-10-19T10:00:00Z"
    }))
}

#[tokio::test]
async fn unread_count_follows_arrival_and_local_read() {
    let h = harness();
    h.client.set_unread(&resolve("u1", "u2").unwrap(), 3);
    let mut unread = h.aggregator.unread();

    assert_ok!(h.aggregator.mount("token", &friends()).await);
    assert_eq!(unread.borrow_and_update().get(&peer("u2")), Some(&3));

    h.client.emit(&fixtures::event("message-new.json"));
    assert_eq!(unread.borrow_and_update().get(&peer("u2")), Some(&4));

    assert_eq!(h.aggregator.mark_read_locally(&peer("u2")), Some(0));
    assert_eq!(unread.borrow_and_update().get(&peer("u2")), Some(&0));

    h.client.emit(&fixtures::event("message-read.json"));
    assert_eq!(h.aggregator.unread_counts().get(&peer("u2")), Some(&0));
}

#[tokio::test]
async fn presence_snapshot_marks_unknown_peers_offline() {
    let h = harness();
    h.client.set_presence(&peer("u2"), true);

    h.aggregator.mount("token", &friends()).await.unwrap();

    assert_eq!(
        h.aggregator.presence_flags(),
        PresenceMap::from([(peer("u2"), true), (peer("u3"), false)])
    );

    h.client.emit(&fixtures::event("presence-offline.json"));
    assert_eq!(h.aggregator.presence().borrow().get(&peer("u2")), Some(&false));
}

#[tokio::test]
async fn n_arrivals_for_closed_conversation_add_n() {
    let h = harness();
    h.aggregator.mount("token", &friends()).await.unwrap();

    for _ in 0..5 {
        h.client.emit(&message_from("u3"));
    }
    assert_eq!(
        h.aggregator.unread_counts(),
        UnreadMap::from([(peer("u2"), 0), (peer("u3"), 5)])
    );
}

#[tokio::test]
async fn open_conversation_is_not_counted_and_is_announced() {
    let h = harness();
    let mut ui = h.event_bus.subscribe("ui.conversation.*").unwrap();
    h.aggregator.mount("token", &friends()).await.unwrap();

    h.aggregator.set_active_conversation(Some("u2")).unwrap();
    h.client.emit(&message_from("u2"));
    assert_eq!(h.aggregator.unread_counts().get(&peer("u2")), Some(&0));

    h.aggregator.set_active_conversation(Some("u3")).unwrap();
    h.client.emit(&message_from("u2"));
    assert_eq!(h.aggregator.unread_counts().get(&peer("u2")), Some(&1));

    let opened = ui.recv().await.unwrap();
    assert_matches!(
        opened.payload,
        EventPayload::ConversationOpened { ref peer } if peer.as_str() == "u2"
    );
    let closed = ui.recv().await.unwrap();
    assert_matches!(
        closed.payload,
        EventPayload::ConversationClosed { ref peer } if peer.as_str() == "u2"
    );
    let opened = ui.recv().await.unwrap();
    assert_matches!(
        opened.payload,
        EventPayload::ConversationOpened { ref peer } if peer.as_str() == "u3"
    );

    assert_matches!(
        h.aggregator.set_active_conversation(Some("")),
        Err(SubscriptionError::InvalidPeerId(_))
    );
    assert_eq!(h.aggregator.active_conversation(), Some(peer("u3")));
}

#[tokio::test]
async fn peer_change_leaves_one_listener_pair_per_peer() {
    let h = harness();
    h.aggregator.mount("token", &friends()).await.unwrap();

    let next = peers_from_graph([("u3", "Marco"), ("u4", "Yuki")]).unwrap();
    h.aggregator.update_peers(&next).await.unwrap();

    assert_eq!(h.client.listener_count(), 4);
    for id in ["u3", "u4"] {
        assert_eq!(
            h.client
                .listeners_for(&ListenerScope::Conversation(resolve("u1", id).unwrap())),
            1
        );
        assert_eq!(h.client.listeners_for(&ListenerScope::User(peer(id))), 1);
    }

    assert_eq!(h.client.emit(&message_from("u2")), 0);
    h.client.emit_to_retired(&message_from("u2"));
    h.client.emit_to_retired(&fixtures::event("presence-online.json"));
    assert_eq!(h.aggregator.unread_counts().get(&peer("u2")), None);
    assert_eq!(h.aggregator.presence_flags().get(&peer("u2")), None);
    assert_eq!(
        h.aggregator
            .tracked_peers()
            .iter()
            .map(|p| p.display_name.as_str())
            .collect::<Vec<_>>(),
        vec!["Marco", "Yuki"]
    );
}

fn display_names(aggregator: &PeerActivityAggregator<FakeVendorClient>) -> Vec<String> {
    aggregator
        .tracked_peers()
        .into_iter()
        .map(|p| p.display_name)
        .collect()
}

#[tokio::test]
async fn rejected_peer_changes_keep_the_tracked_peers() {
    let h = harness();
    let stranger = peers_from_graph([("u9", "Ines")]).unwrap();

    assert_matches!(
        h.aggregator.update_peers(&stranger).await,
        Err(SubscriptionError::InvalidState {
            state: LifecycleState::Disconnected,
            ..
        })
    );
    assert!(h.aggregator.tracked_peers().is_empty());

    h.aggregator.mount("token", &friends()).await.unwrap();
    let others = peers_from_graph([("u4", "Yuki")]).unwrap();
    assert_matches!(
        h.aggregator.mount("token", &others).await,
        Err(SubscriptionError::InvalidState {
            state: LifecycleState::Attached,
            ..
        })
    );

    assert_eq!(display_names(&h.aggregator), vec!["Lucía", "Marco"]);
    assert_eq!(
        h.aggregator.unread_counts().into_keys().collect::<Vec<_>>(),
        vec![peer("u2"), peer("u3")]
    );

    let mut shown = h.event_bus.subscribe("ui.notification.show").unwrap();
    let serve = tokio::spawn(h.aggregator.notifications().serve());
    tokio::task::yield_now().await;
    h.client.emit(&fixtures::event("message-new.json"));

    let event = tokio::time::timeout(Duration::from_secs(1), shown.recv())
        .await
        .expect("timed out")
        .expect("should receive event");
    assert_matches!(
        event.payload,
        EventPayload::NotificationRequested { ref title, .. } if title == "Lucía"
    );
    serve.abort();
}

#[tokio::test]
async fn connect_failure_surfaces_and_can_be_retried() {
    let h = harness();
    h.client.fail_connect(Some(VendorError::Network("dns lookup failed".into())));

    let error = h.aggregator.mount("token", &friends()).await.unwrap_err();
    assert!(error.is_recoverable());
    assert_eq!(h.aggregator.state(), LifecycleState::Disconnected);
    assert!(h.aggregator.tracked_peers().is_empty());

    h.client.fail_connect(None);
    h.aggregator.mount("token", &friends()).await.unwrap();
    assert_eq!(h.aggregator.state(), LifecycleState::Attached);
}

#[tokio::test]
async fn degraded_peer_does_not_block_the_others() {
    let h = harness();
    h.client.set_unread(&resolve("u1", "u2").unwrap(), 2);
    h.client.fail_channel(&resolve("u1", "u3").unwrap(), VendorError::Timeout);

    let report = h.aggregator.mount("token", &friends()).await.unwrap();

    assert_eq!(report.unread.degraded, vec![peer("u3")]);
    assert_eq!(h.aggregator.degraded_peers(), vec![peer("u3")]);
    assert_eq!(
        h.aggregator.unread_counts(),
        UnreadMap::from([(peer("u2"), 2), (peer("u3"), 0)])
    );
    assert_eq!(h.aggregator.state(), LifecycleState::Attached);
}

#[tokio::test]
async fn activity_is_republished_on_the_bus() {
    let h = harness();
    let mut activity = h.event_bus.subscribe("activity.**").unwrap();
    h.aggregator.mount("token", &friends()).await.unwrap();

    h.client.emit(&fixtures::event("message-new.json"));
    h.client.emit(&fixtures::event("presence-online.json"));
    h.client.emit(&fixtures::event("typing-start.json"));

    let arrived = activity.recv().await.unwrap();
    assert_eq!(arrived.channel.as_str(), "activity.message.arrived");
    assert_matches!(
        arrived.payload,
        EventPayload::MessageArrived { ref preview, .. }
            if preview.as_deref() == Some("Hola! ¿Practicamos hoy?")
    );
    let presence = activity.recv().await.unwrap();
    assert_eq!(presence.channel.as_str(), "activity.presence.changed");
}

#[tokio::test]
async fn unmount_empties_both_maps() {
    let h = harness();
    h.client.set_unread(&resolve("u1", "u2").unwrap(), 3);
    h.client.set_presence(&peer("u2"), true);
    h.aggregator.mount("token", &friends()).await.unwrap();
    h.aggregator.set_active_conversation(Some("u2")).unwrap();

    h.aggregator.unmount().await;

    assert_eq!(h.aggregator.state(), LifecycleState::Disconnected);
    assert!(h.aggregator.unread_counts().is_empty());
    assert!(h.aggregator.presence_flags().is_empty());
    assert_eq!(h.aggregator.active_conversation(), None);
    assert_eq!(h.client.listener_count(), 0);
    assert!(h.client.is_connected());

    h.aggregator.end_session().await.unwrap();
    assert!(!h.client.is_connected());
}

#[tokio::test]
async fn remount_reconciles_with_vendor_counts() {
    let h = harness();
    h.client.set_unread(&resolve("u1", "u2").unwrap(), 1);
    h.aggregator.mount("token", &friends()).await.unwrap();
    h.aggregator.unmount().await;

    h.client.set_unread(&resolve("u1", "u2").unwrap(), 6);
    h.aggregator.mount("token", &friends()).await.unwrap();
    assert_eq!(h.aggregator.unread_counts().get(&peer("u2")), Some(&6));
    assert_eq!(h.client.connect_calls(), 1);
}

#[tokio::test]
async fn peer_read_receipts_drive_delivery_status() {
    let h = harness();
    h.aggregator.mount("token", &friends()).await.unwrap();
    let sent_at = Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap();
    assert_eq!(
        h.aggregator.delivery_status(&peer("u2"), sent_at, true),
        DeliveryStatus::Delivered
    );

    h.client.emit(&RawEvent::new(json!({
        "type": "message.read",
        "cid": "messaging:u1::u2",
        "user": { "id": "u2" },
        "created_at": "2026-10-19T09:05:00Z"
    })));
    assert_eq!(
        h.aggregator.delivery_status(&peer("u2"), sent_at, true),
        DeliveryStatus::Read
    );
    assert_eq!(h.aggregator.unread_counts().get(&peer("u2")), Some(&0));
}

#[tokio::test]
async fn call_url_uses_conversation_id() {
    let h = harness();
    assert_eq!(
        h.aggregator.call_url(&peer("u2")).as_deref(),
        Some("https://meet.tandem.app/call/u1::u2")
    );
}

#[tokio::test]
async fn arrivals_raise_notifications_with_display_names() {
    let h = harness();
    let mut shown = h.event_bus.subscribe("ui.notification.show").unwrap();
    h.aggregator.mount("token", &friends()).await.unwrap();
    let serve = tokio::spawn(h.aggregator.notifications().serve());
    tokio::task::yield_now().await;

    h.client.emit(&fixtures::event("message-new.json"));

    let event = tokio::time::timeout(Duration::from_secs(1), shown.recv())
        .await
        .expect("timed out")
        .expect("should receive event");
    assert_matches!(
        event.payload,
        EventPayload::NotificationRequested { ref title, ref body, .. }
            if title == "Lucía" && body == "Hola! ¿Practicamos hoy?"
    );
    serve.abort();
}

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError,
    atomic::{AtomicBool, Ordering},
};
use std::time::{Duration, Instant};

#[cfg(feature = "desktop")]
use notify_rust::Notification;
use tracing::{debug, error, trace, warn};

use tandem_core::config::Config;
use tandem_core::error::EventBusError;
use tandem_core::event::{Event, EventBus, EventPayload, EventSource};
use tandem_core::{Peer, PeerId};

const NOTIFICATION_SOURCE: &str = "notifications";
const SUMMARY_TITLE: &str = "Tandem";
const DEFAULT_BODY: &str = "Sent you a message";

#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("notification dispatch failed: {0}")]
    DispatchFailed(String),

    #[error("event bus error: {0}")]
    EventBus(#[from] EventBusError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationRequest {
    pub title: String,
    pub body: String,
    /// `None` for burst summaries.
    pub peer: Option<PeerId>,
}

impl NotificationRequest {
    fn summary(total: usize) -> Self {
        Self {
            title: SUMMARY_TITLE.to_string(),
            body: format!("{total} new messages"),
            peer: None,
        }
    }
}

#[derive(Debug)]
struct AggregationState {
    window: Duration,
    recent_notifications: VecDeque<Instant>,
}

impl AggregationState {
    fn new(window: Duration) -> Self {
        Self {
            window,
            recent_notifications: VecDeque::new(),
        }
    }

    fn record_and_count(&mut self, now: Instant) -> usize {
        self.recent_notifications.push_back(now);
        while let Some(oldest) = self.recent_notifications.front() {
            if now.duration_since(*oldest) > self.window {
                self.recent_notifications.pop_front();
            } else {
                break;
            }
        }
        self.recent_notifications.len()
    }
}

/// Where notifications end up.
#[cfg_attr(test, mockall::automock)]
pub trait NotificationDispatcher: Send + Sync {
    fn dispatch(&self, request: NotificationRequest) -> Result<(), NotificationError>;
}

/// Hands notifications to the UI as `ui.notification.show` events.
pub struct BusNotificationDispatcher {
    event_bus: Arc<dyn EventBus>,
}

impl BusNotificationDispatcher {
    pub fn new(event_bus: Arc<dyn EventBus>) -> Self {
        Self { event_bus }
    }
}

impl NotificationDispatcher for BusNotificationDispatcher {
    fn dispatch(&self, request: NotificationRequest) -> Result<(), NotificationError> {
        self.event_bus.emit(
            "ui.notification.show",
            EventSource::System(NOTIFICATION_SOURCE.to_string()),
            EventPayload::NotificationRequested {
                title: request.title,
                body: request.body,
                peer: request.peer,
            },
        )?;
        Ok(())
    }
}

#[cfg(feature = "desktop")]
#[derive(Debug, Default)]
pub struct NativeNotificationDispatcher;

#[cfg(feature = "desktop")]
impl NotificationDispatcher for NativeNotificationDispatcher {
    fn dispatch(&self, request: NotificationRequest) -> Result<(), NotificationError> {
        let mut notification = Notification::new();
        notification.summary(&request.title).body(&request.body);

        #[cfg(all(unix, not(target_os = "macos")))]
        if request.peer.is_some() {
            notification.action("default", "Open");
        }

        notification
            .show()
            .map_err(|error| NotificationError::DispatchFailed(error.to_string()))?;
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Raises a notification for messages from peers whose conversation is not
/// open, collapsing bursts into a single summary.
pub struct NotificationManager {
    self_id: PeerId,
    notifications_enabled: AtomicBool,
    focused_peer: Mutex<Option<PeerId>>,
    muted_peers: Mutex<HashSet<PeerId>>,
    display_names: Mutex<HashMap<PeerId, String>>,
    aggregation: Mutex<AggregationState>,
    aggregation_threshold: usize,
    dispatcher: Arc<dyn NotificationDispatcher>,
    event_bus: Arc<dyn EventBus>,
}

impl NotificationManager {
    pub fn new(self_id: PeerId, event_bus: Arc<dyn EventBus>, config: &Config) -> Self {
        let dispatcher = Arc::new(BusNotificationDispatcher::new(event_bus.clone()));
        Self::with_dispatcher(self_id, event_bus, config, dispatcher)
    }

    pub fn with_dispatcher(
        self_id: PeerId,
        event_bus: Arc<dyn EventBus>,
        config: &Config,
        dispatcher: Arc<dyn NotificationDispatcher>,
    ) -> Self {
        Self {
            self_id,
            notifications_enabled: AtomicBool::new(config.ui.notifications),
            focused_peer: Mutex::new(None),
            muted_peers: Mutex::new(HashSet::new()),
            display_names: Mutex::new(HashMap::new()),
            aggregation: Mutex::new(AggregationState::new(
                config.notifications.aggregation_window(),
            )),
            aggregation_threshold: config.notifications.aggregation_threshold,
            dispatcher,
            event_bus,
        }
    }

    pub async fn run(
        self_id: PeerId,
        event_bus: Arc<dyn EventBus>,
        config: &Config,
    ) -> Result<(), NotificationError> {
        let manager = Arc::new(Self::new(self_id, event_bus, config));
        manager.serve().await
    }

    pub fn set_notifications_enabled(&self, enabled: bool) {
        self.notifications_enabled.store(enabled, Ordering::Relaxed);
    }

    /// Display names used as notification titles.
    pub fn set_peers(&self, peers: &[Peer]) {
        *lock(&self.display_names) = peers
            .iter()
            .map(|peer| (peer.id.clone(), peer.display_name.clone()))
            .collect();
    }

    pub fn set_focused_peer(&self, peer: Option<&PeerId>) {
        *lock(&self.focused_peer) = peer.cloned();
    }

    pub fn set_peer_muted(&self, peer: &PeerId, muted: bool) {
        let mut muted_peers = lock(&self.muted_peers);
        if muted {
            muted_peers.insert(peer.clone());
        } else {
            muted_peers.remove(peer);
        }
    }

    pub fn is_peer_muted(&self, peer: &PeerId) -> bool {
        lock(&self.muted_peers).contains(peer)
    }

    pub fn handle_event(&self, event: &Event) {
        match &event.payload {
            EventPayload::ConversationOpened { peer } => {
                self.set_focused_peer(Some(peer));
            }
            EventPayload::ConversationClosed { peer } => {
                let mut focused = lock(&self.focused_peer);
                if focused.as_ref() == Some(peer) {
                    *focused = None;
                }
            }
            EventPayload::MessageArrived { peer, preview, .. } => {
                self.maybe_notify_message(peer, preview.as_deref());
            }
            _ => {}
        }
    }

    fn maybe_notify_message(&self, peer: &PeerId, preview: Option<&str>) {
        if !self.should_notify_for(peer) {
            trace!(peer = %peer, "notification suppressed");
            return;
        }

        let title = lock(&self.display_names)
            .get(peer)
            .cloned()
            .unwrap_or_else(|| peer.to_string());
        self.dispatch_with_aggregation(NotificationRequest {
            title,
            body: preview.unwrap_or(DEFAULT_BODY).to_string(),
            peer: Some(peer.clone()),
        });
    }

    fn should_notify_for(&self, peer: &PeerId) -> bool {
        if *peer == self.self_id {
            return false;
        }

        if !self.notifications_enabled.load(Ordering::Relaxed) {
            return false;
        }

        if lock(&self.muted_peers).contains(peer) {
            return false;
        }

        lock(&self.focused_peer).as_ref() != Some(peer)
    }

    fn dispatch_with_aggregation(&self, request: NotificationRequest) {
        let count = lock(&self.aggregation).record_and_count(Instant::now());

        let outgoing = if count > self.aggregation_threshold {
            debug!(count, "aggregating notification burst");
            NotificationRequest::summary(count)
        } else {
            request
        };

        if let Err(error) = self.dispatcher.dispatch(outgoing) {
            error!(error = %error, "failed to dispatch notification");
        }
    }

    pub async fn serve(self: Arc<Self>) -> Result<(), NotificationError> {
        let mut subscription = self
            .event_bus
            .subscribe("{activity.message.arrived,ui.conversation.*}")?;

        loop {
            match subscription.recv().await {
                Ok(event) => {
                    self.handle_event(&event);
                }
                Err(EventBusError::ChannelClosed) => {
                    debug!("event bus closed, notification manager stopping");
                    return Ok(());
                }
                Err(EventBusError::Lagged(count)) => {
                    warn!(count, "notification manager lagged, some events dropped");
                }
                Err(error) => {
                    return Err(error.into());
                }
            }
        }
    }
}

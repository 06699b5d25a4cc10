use chrono::{DateTime, Utc};
use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::config::EventBusConfig;
use crate::error::EventBusError;
use crate::peer::{ConversationId, PeerId};

/// Hierarchical channel name validation and parsing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Channel(String);

impl Channel {
    /// Create a new channel, validating its format.
    pub fn new(name: impl Into<String>) -> Result<Self, EventBusError> {
        let name = name.into();
        if Self::is_valid(&name) {
            Ok(Self(name))
        } else {
            Err(EventBusError::InvalidChannel(name))
        }
    }

    /// Check if a channel name is valid.
    pub fn is_valid(name: &str) -> bool {
        if name.is_empty() || name.starts_with('.') || name.ends_with('.') || name.contains("..") {
            return false;
        }

        // Lowercase a-z, 0-9 and dots only
        if name
            .chars()
            .any(|c| !matches!(c, 'a'..='z' | '0'..='9' | '.'))
        {
            return false;
        }

        matches!(
            name.split('.').next(),
            Some("system" | "activity" | "ui")
        )
    }

    /// Get the domain of the channel.
    pub fn domain(&self) -> &str {
        self.0.split('.').next().unwrap_or("")
    }

    /// Get the full channel name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Channel> for String {
    fn from(channel: Channel) -> Self {
        channel.0
    }
}

/// The standard event envelope wrapping all events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Hierarchical channel name (e.g., "activity.message.arrived")
    pub channel: Channel,

    /// When the event was created (UTC)
    pub timestamp: DateTime<Utc>,

    /// Unique identifier for this event
    pub id: Uuid,

    /// Optional correlation ID linking related events
    pub correlation_id: Option<Uuid>,

    /// Source component that emitted this event
    pub source: EventSource,

    /// The typed event payload
    pub payload: EventPayload,
}

impl Event {
    pub fn new(channel: Channel, source: EventSource, payload: EventPayload) -> Self {
        Self {
            channel,
            timestamp: Utc::now(),
            id: Uuid::new_v4(),
            correlation_id: None,
            source,
            payload,
        }
    }

    pub fn with_correlation(
        channel: Channel,
        source: EventSource,
        payload: EventPayload,
        correlation_id: Uuid,
    ) -> Self {
        Self {
            correlation_id: Some(correlation_id),
            ..Self::new(channel, source, payload)
        }
    }
}

/// Identifies the source of an event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "camelCase")]
pub enum EventSource {
    /// Aggregator component, by name
    System(String),
    /// Normalized vendor activity
    Vendor,
    /// User interface
    Ui,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum EventPayload {
    // ── Lifecycle events ──────────────────────────────────────────
    LifecycleChanged {
        state: String,
    },
    ConnectionFailed {
        reason: String,
        recoverable: bool,
    },

    // ── Normalized vendor activity ────────────────────────────────
    MessageArrived {
        peer: PeerId,
        conversation_id: ConversationId,
        sent_at: DateTime<Utc>,
        preview: Option<String>,
    },
    MessageRead {
        by_peer: PeerId,
        conversation_id: ConversationId,
        read_at: DateTime<Utc>,
    },
    PresenceChanged {
        peer: PeerId,
        online: bool,
    },

    // ── UI events ────────────────────────────────────────────────
    ConversationOpened {
        peer: PeerId,
    },
    ConversationClosed {
        peer: PeerId,
    },
    NotificationRequested {
        title: String,
        body: String,
        peer: Option<PeerId>,
    },
}

pub trait EventBus: Send + Sync + 'static {
    fn publish(&self, event: Event) -> Result<(), EventBusError>;

    fn subscribe(&self, pattern: &str) -> Result<EventSubscription, EventBusError>;

    /// Validate `channel` and publish `payload` on it.
    fn emit(
        &self,
        channel: &str,
        source: EventSource,
        payload: EventPayload,
    ) -> Result<(), EventBusError> {
        self.publish(Event::new(Channel::new(channel)?, source, payload))
    }
}

#[derive(Clone)]
pub struct BroadcastEventBus {
    system_sender: broadcast::Sender<Event>,
    activity_sender: broadcast::Sender<Event>,
    ui_sender: broadcast::Sender<Event>,
}

impl BroadcastEventBus {
    pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

    pub fn new(channel_capacity: usize) -> Self {
        let capacity = channel_capacity.max(1);
        let (system_sender, _) = broadcast::channel(capacity);
        let (activity_sender, _) = broadcast::channel(capacity);
        let (ui_sender, _) = broadcast::channel(capacity);

        Self {
            system_sender,
            activity_sender,
            ui_sender,
        }
    }

    /// Bus sized by the `[event_bus]` section of the config.
    pub fn from_config(config: &EventBusConfig) -> Self {
        Self::new(config.channel_capacity)
    }

    fn sender_for_domain(&self, domain: &str) -> Option<&broadcast::Sender<Event>> {
        match domain {
            "system" => Some(&self.system_sender),
            "activity" => Some(&self.activity_sender),
            "ui" => Some(&self.ui_sender),
            _ => None,
        }
    }

    fn receivers_for_pattern(&self, pattern: &str) -> Result<DomainReceivers, EventBusError> {
        let first_segment = pattern.split('.').next().unwrap_or_default();

        if first_segment.is_empty() {
            return Err(EventBusError::InvalidPattern(pattern.to_string()));
        }

        if has_glob_meta(first_segment) {
            return Ok(DomainReceivers {
                system: Some(self.system_sender.subscribe()),
                activity: Some(self.activity_sender.subscribe()),
                ui: Some(self.ui_sender.subscribe()),
            });
        }

        let mut receivers = DomainReceivers::default();
        match first_segment {
            "system" => receivers.system = Some(self.system_sender.subscribe()),
            "activity" => receivers.activity = Some(self.activity_sender.subscribe()),
            "ui" => receivers.ui = Some(self.ui_sender.subscribe()),
            _ => return Err(EventBusError::InvalidPattern(pattern.to_string())),
        }
        Ok(receivers)
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CHANNEL_CAPACITY)
    }
}

impl EventBus for BroadcastEventBus {
    fn publish(&self, event: Event) -> Result<(), EventBusError> {
        let sender = self
            .sender_for_domain(event.channel.domain())
            .ok_or_else(|| EventBusError::InvalidChannel(event.channel.to_string()))?;

        // No subscribers is not an error.
        let _ = sender.send(event);
        Ok(())
    }

    fn subscribe(&self, pattern: &str) -> Result<EventSubscription, EventBusError> {
        let matcher = Glob::new(pattern)
            .map_err(|_| EventBusError::InvalidPattern(pattern.to_string()))?
            .compile_matcher();
        let receivers = self.receivers_for_pattern(pattern)?;

        Ok(EventSubscription { matcher, receivers })
    }
}

#[derive(Default)]
struct DomainReceivers {
    system: Option<broadcast::Receiver<Event>>,
    activity: Option<broadcast::Receiver<Event>>,
    ui: Option<broadcast::Receiver<Event>>,
}

pub struct EventSubscription {
    matcher: GlobMatcher,
    receivers: DomainReceivers,
}

impl EventSubscription {
    pub async fn recv(&mut self) -> Result<Event, EventBusError> {
        loop {
            let system_receiver = self.receivers.system.as_mut();
            let activity_receiver = self.receivers.activity.as_mut();
            let ui_receiver = self.receivers.ui.as_mut();

            let received = tokio::select! {
                result = recv_from_domain(system_receiver) => result,
                result = recv_from_domain(activity_receiver) => result,
                result = recv_from_domain(ui_receiver) => result,
            };

            match received {
                Ok(event) if self.matcher.is_match(event.channel.as_str()) => return Ok(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(EventBusError::ChannelClosed);
                }
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    return Err(EventBusError::Lagged(count));
                }
            }
        }
    }
}

async fn recv_from_domain(
    receiver: Option<&mut broadcast::Receiver<Event>>,
) -> Result<Event, broadcast::error::RecvError> {
    match receiver {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

fn has_glob_meta(segment: &str) -> bool {
    segment.contains(['*', '?', '[', ']', '{', '}', '!'])
}

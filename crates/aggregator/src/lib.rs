//! Live unread counts and online status for every peer of the authenticated
//! user, fed by the vendor's real-time messaging client.

pub mod aggregator;
pub mod subscription;

pub use aggregator::{PeerActivityAggregator, peers_from_graph};
pub use subscription::{AttachReport, LifecycleState, SubscriptionError, SubscriptionManager};

pub use tandem_presence::PresenceMap;
pub use tandem_unread::{DeliveryStatus, UnreadMap};

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use tandem_core::PeerId;

/// How far one of our own messages has travelled towards a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Read,
}

/// Latest read marker each peer has acknowledged in their conversation with
/// us. Markers only move forward.
#[derive(Debug, Clone, Default)]
pub struct ReadReceipts {
    last_read: HashMap<PeerId, DateTime<Utc>>,
}

impl ReadReceipts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the marker advanced.
    pub fn record(&mut self, peer: &PeerId, at: DateTime<Utc>) -> bool {
        match self.last_read.get_mut(peer) {
            Some(current) if *current >= at => false,
            Some(current) => {
                *current = at;
                true
            }
            None => {
                self.last_read.insert(peer.clone(), at);
                true
            }
        }
    }

    pub fn last_read(&self, peer: &PeerId) -> Option<DateTime<Utc>> {
        self.last_read.get(peer).copied()
    }

    pub fn status_of(
        &self,
        peer: &PeerId,
        sent_at: DateTime<Utc>,
        delivered: bool,
    ) -> DeliveryStatus {
        match self.last_read(peer) {
            Some(read_at) if read_at >= sent_at => DeliveryStatus::Read,
            _ if delivered => DeliveryStatus::Delivered,
            _ => DeliveryStatus::Sent,
        }
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&PeerId) -> bool) {
        self.last_read.retain(|peer, _| keep(peer));
    }

    pub fn clear(&mut self) {
        self.last_read.clear();
    }
}

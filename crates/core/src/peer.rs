use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Joins the two participants of a conversation id. Peer ids may not contain
/// any `:` so the joined form always splits back into exactly two ids.
pub const CONVERSATION_SEPARATOR: &str = "::";

const FORBIDDEN_CHAR: char = ':';

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PeerIdError {
    #[error("peer id is empty")]
    Empty,

    #[error("peer id {0:?} contains the reserved ':' character")]
    ContainsSeparator(String),

    #[error("malformed conversation id: {0:?}")]
    MalformedConversation(String),
}

/// Opaque, validated identifier of a user known to the social graph.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Result<Self, PeerIdError> {
        let id = id.into();
        validate(&id)?;
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PeerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for PeerId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for PeerId {
    type Error = PeerIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for PeerId {
    type Error = PeerIdError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PeerId> for String {
    fn from(id: PeerId) -> Self {
        id.0
    }
}

/// A friend of the authenticated user, as supplied by the social graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Peer {
    pub id: PeerId,
    pub display_name: String,
    pub avatar: Option<String>,
}

impl Peer {
    pub fn new(id: PeerId, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            avatar: None,
        }
    }

    pub fn with_avatar(mut self, avatar: impl Into<String>) -> Self {
        self.avatar = Some(avatar.into());
        self
    }
}

/// Stable key of the two-party conversation between a pair of peers.
///
/// Always built through [`resolve`] (or [`ConversationId::parse`], which
/// enforces the same canonical form), so equality on the key is equality on
/// the unordered pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ConversationId(String);

impl ConversationId {
    /// Parse an id in canonical `low::high` form.
    pub fn parse(value: &str) -> Result<Self, PeerIdError> {
        let malformed = || PeerIdError::MalformedConversation(value.to_string());
        let (low, high) = value
            .split_once(CONVERSATION_SEPARATOR)
            .ok_or_else(malformed)?;
        validate(low).map_err(|_| malformed())?;
        validate(high).map_err(|_| malformed())?;
        if low > high {
            return Err(malformed());
        }
        Ok(Self(value.to_string()))
    }

    /// Conversation between two already validated peers.
    pub fn between(a: &PeerId, b: &PeerId) -> Self {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        Self(format!("{low}{CONVERSATION_SEPARATOR}{high}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The two participants, lexicographically ordered.
    pub fn participants(&self) -> (&str, &str) {
        self.0
            .split_once(CONVERSATION_SEPARATOR)
            .unwrap_or((self.0.as_str(), ""))
    }

    /// The participant that is not `self_id`, if `self_id` takes part.
    pub fn counterpart(&self, self_id: &str) -> Option<&str> {
        let (low, high) = self.participants();
        if low == self_id {
            Some(high)
        } else if high == self_id {
            Some(low)
        } else {
            None
        }
    }

    /// Vendor channel key, e.g. `messaging:u1::u2`.
    pub fn vendor_cid(&self, channel_type: &str) -> String {
        format!("{channel_type}:{}", self.0)
    }

    /// Inverse of [`ConversationId::vendor_cid`]. Returns `None` for channels
    /// of another type or ids that are not two-party conversations.
    pub fn from_vendor_cid(cid: &str, channel_type: &str) -> Option<Self> {
        let (kind, id) = cid.split_once(FORBIDDEN_CHAR)?;
        if kind != channel_type {
            return None;
        }
        Self::parse(id).ok()
    }

    /// Link a participant shares to start a video call in this conversation.
    pub fn call_url(&self, base_url: &str) -> String {
        format!("{}/call/{}", base_url.trim_end_matches('/'), self.0)
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ConversationId {
    type Error = PeerIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ConversationId> for String {
    fn from(id: ConversationId) -> Self {
        id.0
    }
}

/// Derive the conversation id for an unordered pair of peers.
pub fn resolve(a: &str, b: &str) -> Result<ConversationId, PeerIdError> {
    validate(a)?;
    validate(b)?;
    let (low, high) = if a <= b { (a, b) } else { (b, a) };
    Ok(ConversationId(format!("{low}{CONVERSATION_SEPARATOR}{high}")))
}

fn validate(id: &str) -> Result<(), PeerIdError> {
    if id.is_empty() {
        return Err(PeerIdError::Empty);
    }
    if id.contains(FORBIDDEN_CHAR) {
        return Err(PeerIdError::ContainsSeparator(id.to_string()));
    }
    Ok(())
}

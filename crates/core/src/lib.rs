pub mod config;
pub mod error;
pub mod event;
pub mod peer;
pub mod telemetry;

pub use error::{EventBusError, Result, TandemError};
pub use peer::{CONVERSATION_SEPARATOR, ConversationId, Peer, PeerId, PeerIdError, resolve};

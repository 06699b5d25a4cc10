use thiserror::Error;

use crate::peer::PeerIdError;

/// The umbrella error type for Tandem.
#[derive(Error, Debug)]
pub enum TandemError {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Fetch failed for peer {peer}: {message}")]
    PerPeerFetch { peer: String, message: String },

    #[error("Invalid peer id: {0}")]
    InvalidPeerId(#[from] PeerIdError),

    #[error("Event bus error: {0}")]
    EventBus(#[from] EventBusError),
}

impl TandemError {
    /// Only configuration failures reach the user; everything else degrades
    /// a single peer or is dropped.
    pub fn is_user_visible(&self) -> bool {
        matches!(self, TandemError::Config(_))
    }
}

/// A specialized Result type for Tandem operations.
pub type Result<T> = std::result::Result<T, TandemError>;

#[derive(thiserror::Error, Debug, Clone)]
pub enum EventBusError {
    #[error("Invalid channel: {0}")]
    InvalidChannel(String),

    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Subscriber lagged: {0} events missed")]
    Lagged(u64),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigError;

    #[test]
    fn only_config_failures_are_user_visible() {
        let invalid = ConfigError::InvalidValue {
            field: "logging.level".into(),
            message: "must be one of: trace, debug, info, warn, error".into(),
        };
        assert!(TandemError::from(invalid).is_user_visible());
        assert!(
            !TandemError::PerPeerFetch {
                peer: "u2".into(),
                message: "timeout".into(),
            }
            .is_user_visible()
        );
        assert!(!TandemError::InvalidPeerId(PeerIdError::Empty).is_user_visible());
        assert!(!TandemError::EventBus(EventBusError::ChannelClosed).is_user_visible());
    }

    #[test]
    fn peer_id_error_converts() {
        let err: TandemError = PeerIdError::Empty.into();
        assert_eq!(err.to_string(), "Invalid peer id: peer id is empty");
    }
}

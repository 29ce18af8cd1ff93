//! Error types for peershare.

use thiserror::Error;

/// Result type alias for peershare operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while negotiating consent, proxying, or allocating.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed SOCKS5 bytes, bad version, or a fragmented handshake
    #[error("protocol error: {0}")]
    Protocol(String),

    /// BIND, UDP ASSOCIATE, IPv6 destinations, or an unsupported STUN method
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Traffic was requested without GRANTED consent on the relevant axis
    #[error("consent not granted for peer {peer}")]
    ConsentViolation { peer: String },

    /// The shared channel to the peer failed or closed
    #[error("transport error: {0}")]
    Transport(String),

    /// NAT allocation negotiation failed
    #[error("allocation error: {0}")]
    Allocation(String),

    /// A consent action is not defined for the current state
    #[error("invalid consent transition: {action} in state {state}")]
    InvalidTransition { state: String, action: String },

    /// No registry entry exists for the peer
    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    /// Session lifecycle misuse (e.g. starting an active session)
    #[error("session error: {0}")]
    Session(String),

    /// Invalid message format
    #[error("invalid message format: {0}")]
    InvalidMessage(String),

    /// Operation timed out
    #[error("timeout after {0}ms")]
    Timeout(u64),

    /// Network I/O error
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Loading or saving the peer registry failed
    #[error("persistence error: {0}")]
    Persistence(String),
}

impl Error {
    /// Create a new protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Create a new unsupported-operation error
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Error::Unsupported(msg.into())
    }

    /// Create a new consent violation for `peer`
    pub fn consent(peer: impl Into<String>) -> Self {
        Error::ConsentViolation { peer: peer.into() }
    }

    /// Create a new transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Error::Transport(msg.into())
    }

    /// Create a new allocation error
    pub fn allocation(msg: impl Into<String>) -> Self {
        Error::Allocation(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Errors that end a single proxied connection but leave the session up.
    pub fn is_connection_scoped(&self) -> bool {
        matches!(
            self,
            Error::Protocol(_)
                | Error::Unsupported(_)
                | Error::ConsentViolation { .. }
                | Error::Timeout(_)
        )
    }

    /// Errors that tear down a whole session.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, Error::Transport(_))
    }

    /// Check if a fresh attempt may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::Allocation(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Persistence(e.to_string())
    }
}

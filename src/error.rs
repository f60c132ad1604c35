//! Engine error types

use thiserror::Error;

/// Engine error type
#[derive(Error, Debug)]
pub enum EngineError {
    /// Dial or transport failure
    #[error("connection error: {0}")]
    Connection(String),

    /// Auth-required relay never delivered a challenge
    #[error("auth challenge timeout: {0}")]
    AuthTimeout(String),

    /// Relay rejected the signed auth event
    #[error("auth rejected: {0}")]
    AuthRejected(String),

    /// No reply within the per-relay window
    #[error("relay timeout: {0}")]
    RelayTimeout(String),

    /// Caller asked for resolution of a kind outside the claimed class
    #[error("kind {kind} is outside the {expected} range")]
    InvalidKindRange { kind: u16, expected: &'static str },

    /// Event violates the shape its identity class requires
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    /// Stored payload unreadable with the supplied capability
    #[error("decryption failure: {0}")]
    Decryption(String),

    /// Injected signing capability failed
    #[error("signer error: {0}")]
    Signer(String),

    /// Invalid relay URL
    #[error("invalid relay URL: {0}")]
    InvalidUrl(String),

    /// Not connected to relay
    #[error("not connected to relay")]
    NotConnected,

    /// Malformed wire message from a relay
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// URL parse error
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),
}

/// Engine result type
pub type Result<T> = std::result::Result<T, EngineError>;

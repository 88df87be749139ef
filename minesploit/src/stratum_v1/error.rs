//! Error types for Stratum v1 protocol.

use thiserror::Error;

/// Reasons a single wire frame failed to decode into a [`Message`].
///
/// [`Message`]: super::Message
#[derive(Error, Debug)]
pub enum DecodeError {
    /// Frame is not valid UTF-8
    #[error("malformed encoding: {0}")]
    Encoding(#[from] std::str::Utf8Error),

    /// Frame is not valid JSON
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Valid JSON, but not an object
    #[error("message is not a JSON object")]
    NotAnObject,

    /// `id` present but neither null nor a non-negative integer
    #[error("message id is not a non-negative integer or null")]
    InvalidId,

    /// `method` present but not a string
    #[error("method is not a string")]
    InvalidMethod,

    /// Object carries neither `method` nor `result`/`error`
    #[error("object is neither a request nor a response")]
    NotRpc,
}

/// Stratum protocol errors.
#[derive(Error, Debug)]
pub enum StratumError {
    /// Network I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame could not be decoded
    #[error("Undecodable frame: {0}")]
    Decode(#[from] DecodeError),

    /// Message decoded but its contents are not what the method requires
    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    /// Peer returned an error response
    #[error("Pool error: {0}")]
    PoolError(String),

    /// Connection error
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Subscription failed
    #[error("Subscription failed: {0}")]
    SubscriptionFailed(String),

    /// Authorization failed
    #[error("Authorization failed: {0}")]
    AuthorizationFailed(String),

    /// Unexpected response (wrong ID, missing fields, etc.)
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    /// Connection lost
    #[error("Connection lost")]
    Disconnected,

    /// Timeout waiting for response
    #[error("Timeout waiting for response")]
    Timeout,
}

/// Convenient Result type for Stratum operations.
pub type StratumResult<T> = Result<T, StratumError>;

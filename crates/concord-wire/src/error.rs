//! Errors from the wire protocol layer.

use std::time::Duration;
use thiserror::Error;

/// Errors from framing, envelope decoding, and the key-auth handshake.
///
/// Everything here is connection-fatal when it surfaces from a peer's read
/// or write task. Protocol-state errors are kept apart from I/O errors so
/// callers can tell a misbehaving peer from a broken socket.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: u64, max: u32 },
    #[error("Empty message")]
    EmptyMessage,
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("Encode error: {0}")]
    Encode(String),
    #[error("Invalid authentication state '{state}' for {operation}")]
    InvalidAuthState {
        state: &'static str,
        operation: &'static str,
    },
    #[error("Received a key-auth challenge that was not requested")]
    UnexpectedChallenge,
    #[error("Invalid challenge response")]
    InvalidChallengeResponse,
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),
    #[error("Crypto error: {0}")]
    Crypto(String),
    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl WireError {
    /// True for errors caused by the remote violating the handshake protocol.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            WireError::InvalidAuthState { .. }
                | WireError::UnexpectedChallenge
                | WireError::InvalidChallengeResponse
                | WireError::InvalidPublicKey(_)
        )
    }
}

impl From<rmp_serde::decode::Error> for WireError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        WireError::Decode(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for WireError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        WireError::Encode(e.to_string())
    }
}

impl From<WireError> for concord_types::ConcordError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::Io(io) => concord_types::ConcordError::Io(io),
            other => concord_types::ConcordError::Wire(other.to_string()),
        }
    }
}

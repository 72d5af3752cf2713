//! Error types for the messaging client.

use crate::types::{FileId, Revision};
use std::time::Duration;
use thiserror::Error;

/// Main error type for client operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Connection lost")]
    ConnectionLost,

    #[error("Connection is reconnecting")]
    Reconnecting,

    #[error("Connection closed")]
    Closed,

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Revision {revision:?} of key {key} is not retained")]
    RevisionMismatch { key: String, revision: Revision },

    #[error("Server error: {0}")]
    Server(String),

    #[error("Corrupt chunk {index} of {file_id}: expected checksum {expected:08x}, got {got:08x}")]
    CorruptChunk {
        file_id: FileId,
        index: u32,
        expected: u32,
        got: u32,
    },

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Watcher fell behind and was disconnected")]
    Overrun,

    #[error("Malformed payload: {0}")]
    Malformed(String),

    #[error("Invalid subject: {0}")]
    InvalidSubject(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Entropy source unavailable: {0}")]
    Entropy(String),
}

impl Error {
    /// True if the error is a request deadline expiry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }

    /// True if the error reports a missing key or object.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// True if the error was caused by the connection going away.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Error::Connect(_) | Error::ConnectionLost | Error::Reconnecting | Error::Closed
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Malformed(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(e: rmp_serde::encode::Error) -> Self {
        Error::Malformed(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(e: rmp_serde::decode::Error) -> Self {
        Error::Malformed(e.to_string())
    }
}

impl From<getrandom::Error> for Error {
    fn from(e: getrandom::Error) -> Self {
        Error::Entropy(e.to_string())
    }
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predicates() {
        assert!(Error::Timeout(Duration::from_secs(1)).is_timeout());
        assert!(Error::NotFound("k".into()).is_not_found());
        assert!(Error::Reconnecting.is_connection_error());
        assert!(Error::ConnectionLost.is_connection_error());
        assert!(!Error::Overrun.is_connection_error());
        assert!(!Error::Server("boom".into()).is_connection_error());
    }
}

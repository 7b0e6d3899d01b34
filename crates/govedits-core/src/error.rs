//! Error types for the edit watcher
//!
//! This module defines all error types used throughout the crate.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Result type alias for watcher operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the edit watcher
#[derive(Error, Debug)]
pub enum Error {
    /// Text is not a valid IPv4 or IPv6 literal
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// The range table could not be loaded (fatal at startup)
    #[error("Range table load failed: {0}")]
    RangeLoad(String),

    /// Network or upstream failure worth retrying
    #[error("Transient fetch error: {0}")]
    TransientFetch(String),

    /// Upstream answered with something we cannot interpret
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// The resumption point is too old for the push feed to replay
    #[error("Feed gap exceeded: last cursor {since}, now {now}")]
    GapExceeded {
        /// Timestamp of the last durable cursor
        since: DateTime<Utc>,
        /// Time the gap was measured at
        now: DateTime<Utc>,
    },

    /// Another process holds the run lock
    #[error("Already running: {0}")]
    AlreadyRunning(String),

    /// A single collaborator failed while dispatching a match
    #[error("Dispatch failed ({collaborator}): {message}")]
    Dispatch {
        /// Collaborator name
        collaborator: String,
        /// Error message
        message: String,
    },

    /// State store-related errors
    #[error("State store error: {0}")]
    StateStore(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an invalid address error
    pub fn invalid_address(msg: impl Into<String>) -> Self {
        Self::InvalidAddress(msg.into())
    }

    /// Create a range load error
    pub fn range_load(msg: impl Into<String>) -> Self {
        Self::RangeLoad(msg.into())
    }

    /// Create a transient fetch error
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientFetch(msg.into())
    }

    /// Create a malformed response error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedResponse(msg.into())
    }

    /// Create a state store error
    pub fn state_store(msg: impl Into<String>) -> Self {
        Self::StateStore(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a collaborator dispatch error
    pub fn dispatch(collaborator: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Dispatch {
            collaborator: collaborator.into(),
            message: message.into(),
        }
    }

    /// Whether a retry of the same request may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientFetch(_) | Self::Io(_))
    }
}

/// Helper for converting anyhow::Error to our Error type
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}

impl From<csv::Error> for Error {
    fn from(err: csv::Error) -> Self {
        Self::Other(format!("CSV error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(Error::transient("timeout").is_transient());
        assert!(!Error::malformed("bad json").is_transient());
        assert!(!Error::dispatch("capture", "boom").is_transient());
    }

    #[test]
    fn dispatch_error_names_collaborator() {
        let err = Error::dispatch("publisher", "rate limited");
        assert_eq!(err.to_string(), "Dispatch failed (publisher): rate limited");
    }
}

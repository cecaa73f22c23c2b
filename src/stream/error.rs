//! Stream error types

use thiserror::Error;

/// Failure of a streamed turn, with classification
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct StreamError {
    pub kind: StreamErrorKind,
    pub message: String,
}

impl StreamError {
    pub fn new(kind: StreamErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(StreamErrorKind::Network, message)
    }

    pub fn no_body(message: impl Into<String>) -> Self {
        Self::new(StreamErrorKind::NoBody, message)
    }

    pub fn upstream(status: u16, message: impl Into<String>) -> Self {
        Self::new(StreamErrorKind::Upstream { status }, message)
    }

    pub fn read(message: impl Into<String>) -> Self {
        Self::new(StreamErrorKind::Read, message)
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(StreamErrorKind::Storage, message)
    }

    /// Map a reqwest failure from sending a request
    pub fn from_send(e: &reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::network(format!("Request timeout: {e}"))
        } else if e.is_connect() {
            Self::network(format!("Connection failed: {e}"))
        } else if e.is_builder() {
            Self::network(format!("Invalid request: {e}"))
        } else {
            Self::network(format!("Request failed: {e}"))
        }
    }

    /// Map a reqwest failure while reading the body
    pub fn from_body(e: &reqwest::Error) -> Self {
        Self::read(format!("Stream read error: {e}"))
    }
}

/// Error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamErrorKind {
    /// Request could not be sent or no response arrived
    Network,
    /// Response arrived without a body to stream
    NoBody,
    /// Relay or backend answered with a failure status
    Upstream { status: u16 },
    /// Body broke off mid-stream
    Read,
    /// The turn could not be recorded locally
    Storage,
}

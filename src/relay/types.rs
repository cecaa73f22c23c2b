//! Relay request and response bodies

use serde::Serialize;

pub use crate::stream::transport::NO_READER_ERROR;
pub use crate::stream::RelayRequest;

/// Returned for any other upstream failure
pub const WORKFLOW_ERROR: &str = "Something went wrong in workflow API";

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

//! HTTP relay between chat clients and the workflow backend
//!
//! Accepts the conversation history, forwards the newest message upstream
//! and pipes the raw generated text back chunk by chunk.

mod handlers;
mod types;

pub use handlers::create_router;
pub use types::*;

use crate::upstream::WorkflowClient;
use std::sync::Arc;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub upstream: Arc<WorkflowClient>,
}

impl AppState {
    pub fn new(upstream: WorkflowClient) -> Self {
        Self {
            upstream: Arc::new(upstream),
        }
    }
}

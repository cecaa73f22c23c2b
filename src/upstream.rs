//! Client for the external workflow generation backend
//!
//! The backend takes a single prompt plus a session id and answers with a
//! chunked raw-text body. Used by the relay, or directly by the client when
//! it is wired without a relay.

use crate::stream::transport::{body_stream, status_error};
use crate::stream::{ChatTransport, ChunkStream, RelayRequest, StreamError};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::{Map, Value};
use std::str::FromStr;

/// Default workflow execute endpoint
pub const DEFAULT_UPSTREAM_URL: &str = "https://workflow.sandbox.kayatech.ai/api/v1/workflows/execute";

/// Prompt used when a request has no messages
pub const FALLBACK_PROMPT: &str = "Hello";

/// How upstream session ids are chosen
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionPolicy {
    /// Fresh session for every request; the backend sees no continuity
    #[default]
    PerRequest,
    /// Reuse the conversation id so the backend can keep context
    PerConversation,
}

impl FromStr for SessionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "per-request" | "per_request" | "request" => Ok(Self::PerRequest),
            "per-conversation" | "per_conversation" | "conversation" => {
                Ok(Self::PerConversation)
            }
            other => Err(format!("unknown session policy: {other}")),
        }
    }
}

/// Connection settings for the backend
#[derive(Debug, Clone, Default)]
pub struct UpstreamConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub workflow_id: Option<String>,
    pub session_policy: SessionPolicy,
}

/// Request body of the workflow execute call
#[derive(Debug, Serialize)]
pub struct WorkflowRequest<'a> {
    pub message: &'a str,
    pub workflow_id: &'a str,
    pub session_id: String,
    pub variables: Map<String, Value>,
    pub is_stream: bool,
    pub auth_type: &'static str,
}

/// Streams generations from the workflow backend
#[derive(Clone)]
pub struct WorkflowClient {
    client: Client,
    config: UpstreamConfig,
}

impl WorkflowClient {
    pub fn new(config: UpstreamConfig) -> Self {
        Self::with_client(Client::new(), config)
    }

    pub fn with_client(client: Client, config: UpstreamConfig) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    /// Session id for one request under the configured policy
    pub fn session_for(&self, requested: Option<&str>) -> String {
        match (self.config.session_policy, requested) {
            (SessionPolicy::PerConversation, Some(id)) if !id.is_empty() => id.to_string(),
            _ => uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn build_request<'a>(&'a self, message: &'a str, session_id: String) -> WorkflowRequest<'a> {
        WorkflowRequest {
            message,
            workflow_id: self.config.workflow_id.as_deref().unwrap_or_default(),
            session_id,
            variables: Map::new(),
            is_stream: true,
            auth_type: "API_KEY",
        }
    }

    /// Post one prompt and return the raw response body as it arrives
    pub async fn open_stream(
        &self,
        message: &str,
        session_id: Option<&str>,
    ) -> Result<ChunkStream, StreamError> {
        let body = self.build_request(message, self.session_for(session_id));

        let mut request = self.client.post(&self.config.url).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.header("x-api-key", key);
        }

        let response = request.send().await.map_err(|e| StreamError::from_send(&e))?;

        let status = response.status();
        if status == StatusCode::NO_CONTENT {
            return Err(StreamError::no_body("No streaming reader returned"));
        }
        if !status.is_success() {
            return Err(status_error(response).await);
        }

        tracing::debug!(
            status = %status,
            session_id = %body.session_id,
            "Upstream stream opened"
        );
        Ok(body_stream(response))
    }
}

#[async_trait]
impl ChatTransport for WorkflowClient {
    async fn open(&self, request: &RelayRequest) -> Result<ChunkStream, StreamError> {
        let prompt = request.prompt().unwrap_or(FALLBACK_PROMPT);
        self.open_stream(prompt, request.session_id.as_deref()).await
    }
}

//! Transport seam between the stream consumer and the network
//!
//! A transport turns one request into a stream of raw body chunks. The
//! consumer never sees reqwest directly, so tests can feed chunks by hand.

use super::StreamError;
use crate::store::HistoryMessage;
use async_trait::async_trait;
use axum::body::Bytes;
use futures::stream::{BoxStream, StreamExt};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Error text the relay sends when the backend answered without a body
pub const NO_READER_ERROR: &str = "No streaming reader returned";

/// Body chunks of one streamed response
pub type ChunkStream = BoxStream<'static, Result<Bytes, StreamError>>;

/// Request body accepted by the relay endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayRequest {
    pub messages: Vec<HistoryMessage>,
    /// Session to continue upstream; the relay mints one when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl RelayRequest {
    /// Text of the newest message, which is what the backend answers
    pub fn prompt(&self) -> Option<&str> {
        self.messages.last().map(|m| m.content.as_str())
    }
}

/// Opens one streamed response per turn
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn open(&self, request: &RelayRequest) -> Result<ChunkStream, StreamError>;
}

#[async_trait]
impl<T: ChatTransport + ?Sized> ChatTransport for Arc<T> {
    async fn open(&self, request: &RelayRequest) -> Result<ChunkStream, StreamError> {
        (**self).open(request).await
    }
}

/// Result of waiting for the next chunk
#[derive(Debug)]
pub enum ReadOutcome {
    Chunk(Bytes),
    Done,
    Cancelled,
    Failed(StreamError),
}

/// Wait for the next chunk unless the turn is cancelled first
pub async fn read_next(stream: &mut ChunkStream, cancel: &CancellationToken) -> ReadOutcome {
    tokio::select! {
        biased;

        () = cancel.cancelled() => ReadOutcome::Cancelled,

        next = stream.next() => match next {
            Some(Ok(bytes)) => ReadOutcome::Chunk(bytes),
            Some(Err(e)) => ReadOutcome::Failed(e),
            None => ReadOutcome::Done,
        },
    }
}

/// Wrap a reqwest response body as a chunk stream
pub fn body_stream(response: reqwest::Response) -> ChunkStream {
    response
        .bytes_stream()
        .map(|chunk| chunk.map_err(|e| StreamError::from_body(&e)))
        .boxed()
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// Build an error from a non-success response
pub async fn status_error(response: reqwest::Response) -> StreamError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&body)
        .map(|b| b.error)
        .unwrap_or_else(|_| {
            if body.is_empty() {
                format!("HTTP {status}")
            } else {
                format!("HTTP {status}: {body}")
            }
        });
    StreamError::upstream(status.as_u16(), message)
}

// ============================================================
// Relay transport
// ============================================================

/// Posts the conversation history to the relay endpoint
pub struct RelayTransport {
    client: Client,
    url: String,
}

impl RelayTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), url)
    }

    pub fn with_client(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl ChatTransport for RelayTransport {
    async fn open(&self, request: &RelayRequest) -> Result<ChunkStream, StreamError> {
        let response = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .map_err(|e| StreamError::from_send(&e))?;

        let status = response.status();
        if status == StatusCode::NO_CONTENT {
            return Err(StreamError::no_body("Relay returned no response stream"));
        }
        if !status.is_success() {
            let error = status_error(response).await;
            if error.message == NO_READER_ERROR {
                return Err(StreamError::no_body(error.message));
            }
            return Err(error);
        }

        tracing::debug!(url = %self.url, status = %status, "Relay stream opened");
        Ok(body_stream(response))
    }
}

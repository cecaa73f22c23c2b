//! HTTP request handlers

use super::types::{ErrorResponse, HealthResponse, RelayRequest, NO_READER_ERROR, WORKFLOW_ERROR};
use super::AppState;
use crate::stream::{ChunkStream, StreamError, StreamErrorKind};
use crate::upstream::FALLBACK_PROMPT;
use axum::{
    body::{Body, Bytes},
    extract::{rejection::JsonRejection, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{Stream, StreamExt};
use std::time::Instant;

/// Create the relay router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/chat", post(relay_chat))
        .route("/version", get(get_version))
        .route("/health", get(get_health))
        .with_state(state)
}

// ============================================================
// Chat relay
// ============================================================

async fn relay_chat(
    State(state): State<AppState>,
    payload: Result<Json<RelayRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let Json(request) = payload.map_err(|e| AppError::BadRequest(e.body_text()))?;

    let prompt = request.prompt().unwrap_or(FALLBACK_PROMPT);
    let started = Instant::now();

    let stream = state
        .upstream
        .open_stream(prompt, request.session_id.as_deref())
        .await
        .map_err(|e| {
            let status = match e.kind {
                StreamErrorKind::Upstream { status } => Some(status),
                _ => None,
            };
            tracing::warn!(
                kind = ?e.kind,
                upstream_status = ?status,
                duration_ms = %started.elapsed().as_millis(),
                "Upstream request failed"
            );
            AppError::from(e)
        })?;

    tracing::info!(
        messages = request.messages.len(),
        prompt_bytes = prompt.len(),
        first_byte_ms = %started.elapsed().as_millis(),
        "Relaying upstream stream"
    );

    Ok((
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            (header::CACHE_CONTROL, "no-cache, no-transform"),
        ],
        Body::from_stream(with_stats(stream, started)),
    )
        .into_response())
}

/// Count relayed chunks. The stats live as long as the body stream.
fn with_stats(
    stream: ChunkStream,
    started: Instant,
) -> impl Stream<Item = Result<Bytes, StreamError>> + Send + 'static {
    let mut stats = RelayStats {
        bytes: 0,
        chunks: 0,
        started,
    };
    stream.inspect(move |chunk| {
        // Whole-struct capture keeps the guard alive as long as the stream
        let stats = &mut stats;
        if let Ok(bytes) = chunk {
            stats.bytes += bytes.len();
            stats.chunks += 1;
        }
    })
}

/// Logs the size of a relayed body once the stream is dropped
struct RelayStats {
    bytes: usize,
    chunks: usize,
    started: Instant,
}

impl Drop for RelayStats {
    fn drop(&mut self) {
        tracing::info!(
            bytes = self.bytes,
            chunks = self.chunks,
            duration_ms = %self.started.elapsed().as_millis(),
            "Relay stream closed"
        );
    }
}

// ============================================================
// Version / health
// ============================================================

async fn get_version() -> &'static str {
    concat!("streamchat ", env!("CARGO_PKG_VERSION"))
}

async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

// ============================================================
// Error Handling
// ============================================================

#[derive(Debug)]
enum AppError {
    BadRequest(String),
    Internal(String),
}

impl From<StreamError> for AppError {
    fn from(e: StreamError) -> Self {
        match e.kind {
            StreamErrorKind::NoBody => AppError::Internal(NO_READER_ERROR.to_string()),
            _ => AppError::Internal(WORKFLOW_ERROR.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse::new(message));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use crate::store::{ConversationStore, Sender};
    use crate::stream::{RelayTransport, StreamConsumer, TurnOutcome, NO_STREAM_TEXT};
    use crate::upstream::{SessionPolicy, UpstreamConfig, WorkflowClient};
    use axum::body::Bytes;
    use axum::http::{HeaderMap, Request};
    use serde_json::Value;
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};
    use tower::ServiceExt;

    #[derive(Clone)]
    enum Reply {
        Chunks(Vec<&'static str>),
        Status(StatusCode),
    }

    /// Records what the relay sent and answers with a canned reply
    #[derive(Clone)]
    struct MockUpstream {
        seen: Arc<Mutex<Vec<(Option<String>, Value)>>>,
        reply: Reply,
    }

    impl MockUpstream {
        fn new(reply: Reply) -> Self {
            Self {
                seen: Arc::new(Mutex::new(Vec::new())),
                reply,
            }
        }

        fn seen(&self) -> Vec<(Option<String>, Value)> {
            self.seen.lock().unwrap().clone()
        }
    }

    async fn execute(
        State(upstream): State<MockUpstream>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> Response {
        let key = headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        upstream.seen.lock().unwrap().push((key, body));

        match upstream.reply {
            Reply::Chunks(chunks) => {
                let stream = futures::stream::iter(
                    chunks
                        .into_iter()
                        .map(|c| Ok::<_, Infallible>(Bytes::from_static(c.as_bytes()))),
                );
                Body::from_stream(stream).into_response()
            }
            Reply::Status(status) => (status, "upstream exploded").into_response(),
        }
    }

    async fn serve(app: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    async fn spawn_upstream(reply: Reply) -> (MockUpstream, SocketAddr) {
        let upstream = MockUpstream::new(reply);
        let app = Router::new()
            .route("/execute", post(execute))
            .with_state(upstream.clone());
        (upstream, serve(app).await)
    }

    fn relay_app(upstream: SocketAddr, policy: SessionPolicy) -> Router {
        create_router(AppState::new(WorkflowClient::new(UpstreamConfig {
            url: format!("http://{upstream}/execute"),
            api_key: Some("test-key".to_string()),
            workflow_id: Some("wf-test".to_string()),
            session_policy: policy,
        })))
    }

    fn chat_request(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/chat")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_relays_stream_with_headers() {
        let (upstream, addr) = spawn_upstream(Reply::Chunks(vec!["Hel", "lo!"])).await;
        let app = relay_app(addr, SessionPolicy::PerRequest);

        let response = app
            .oneshot(chat_request(
                r#"{"messages":[{"role":"user","content":"first"},{"role":"assistant","content":"ok"},{"role":"user","content":"Hi"}]}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/plain; charset=utf-8"
        );
        assert_eq!(
            response.headers()[header::CACHE_CONTROL],
            "no-cache, no-transform"
        );
        assert_eq!(body_text(response).await, "Hello!");

        let seen = upstream.seen();
        assert_eq!(seen.len(), 1);
        let (key, body) = &seen[0];
        assert_eq!(key.as_deref(), Some("test-key"));
        assert_eq!(body["message"], "Hi");
        assert_eq!(body["workflow_id"], "wf-test");
        assert_eq!(body["is_stream"], true);
        assert_eq!(body["auth_type"], "API_KEY");
        assert_eq!(body["variables"], serde_json::json!({}));
        assert!(body["session_id"].as_str().is_some_and(|s| !s.is_empty()));
    }

    /// Captures formatted log output
    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_stats_logged_after_body_drains() {
        let logs = LogBuffer::default();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer({
                let logs = logs.clone();
                move || logs.clone()
            })
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            let chunks: ChunkStream = futures::stream::iter(vec![
                Ok(Bytes::from_static(b"Hel")),
                Ok(Bytes::from_static(b"lo!")),
            ])
            .boxed();
            let body = with_stats(chunks, Instant::now());
            let relayed: Vec<_> = futures::executor::block_on(body.collect());
            assert_eq!(relayed.len(), 2);
        });

        let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("Relay stream closed"));
        assert!(output.contains("bytes=6"));
        assert!(output.contains("chunks=2"));
    }

    #[tokio::test]
    async fn test_empty_history_sends_hello() {
        let (upstream, addr) = spawn_upstream(Reply::Chunks(vec!["hey"])).await;
        let app = relay_app(addr, SessionPolicy::PerRequest);

        let response = app.oneshot(chat_request(r#"{"messages":[]}"#)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "hey");
        assert_eq!(upstream.seen()[0].1["message"], "Hello");
    }

    #[tokio::test]
    async fn test_session_policy_applied() {
        let body = r#"{"messages":[{"role":"user","content":"x"}],"session_id":"conv-9"}"#;

        let (upstream, addr) = spawn_upstream(Reply::Chunks(vec!["a"])).await;
        let response = relay_app(addr, SessionPolicy::PerConversation)
            .oneshot(chat_request(body))
            .await
            .unwrap();
        body_text(response).await;
        assert_eq!(upstream.seen()[0].1["session_id"], "conv-9");

        let (upstream, addr) = spawn_upstream(Reply::Chunks(vec!["a"])).await;
        let response = relay_app(addr, SessionPolicy::PerRequest)
            .oneshot(chat_request(body))
            .await
            .unwrap();
        body_text(response).await;
        assert_ne!(upstream.seen()[0].1["session_id"], "conv-9");
    }

    #[tokio::test]
    async fn test_upstream_failure_is_500() {
        let (_upstream, addr) =
            spawn_upstream(Reply::Status(StatusCode::INTERNAL_SERVER_ERROR)).await;
        let response = relay_app(addr, SessionPolicy::PerRequest)
            .oneshot(chat_request(r#"{"messages":[{"role":"user","content":"x"}]}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json: Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(json, serde_json::json!({"error": WORKFLOW_ERROR}));
    }

    #[tokio::test]
    async fn test_upstream_without_body_is_500() {
        let (_upstream, addr) = spawn_upstream(Reply::Status(StatusCode::NO_CONTENT)).await;
        let response = relay_app(addr, SessionPolicy::PerRequest)
            .oneshot(chat_request(r#"{"messages":[{"role":"user","content":"x"}]}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json: Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(json, serde_json::json!({"error": NO_READER_ERROR}));
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_500() {
        // Bind then drop to get a port nobody listens on
        let addr = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let response = relay_app(addr, SessionPolicy::PerRequest)
            .oneshot(chat_request(r#"{"messages":[]}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json: Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(json["error"], WORKFLOW_ERROR);
    }

    #[tokio::test]
    async fn test_malformed_body_is_400() {
        let (upstream, addr) = spawn_upstream(Reply::Chunks(vec![])).await;
        let response = relay_app(addr, SessionPolicy::PerRequest)
            .oneshot(chat_request("{not json"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json: Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert!(json["error"].as_str().is_some_and(|e| !e.is_empty()));
        assert!(upstream.seen().is_empty());
    }

    #[tokio::test]
    async fn test_version_and_health() {
        let app = relay_app("127.0.0.1:1".parse().unwrap(), SessionPolicy::PerRequest);

        let response = app
            .clone()
            .oneshot(Request::get("/version").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(body_text(response).await.starts_with("streamchat "));

        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, r#"{"status":"ok"}"#);
    }

    #[tokio::test]
    async fn test_end_to_end_turn_through_relay() {
        let (upstream, upstream_addr) = spawn_upstream(Reply::Chunks(vec!["Hel", "lo!"])).await;
        let relay_addr = serve(relay_app(upstream_addr, SessionPolicy::PerRequest)).await;

        let store = ConversationStore::load(Arc::new(MemoryKv::new()));
        let consumer = StreamConsumer::new(
            store.clone(),
            RelayTransport::new(format!("http://{relay_addr}/api/chat")),
        );

        let outcome = consumer.send("Hi").await;
        assert!(matches!(outcome, TurnOutcome::Completed), "{outcome:?}");

        let conversation = store.active_conversation().unwrap().unwrap();
        assert_eq!(conversation.messages.len(), 2);
        assert_eq!(conversation.messages[0].sender, Sender::User);
        assert_eq!(conversation.messages[0].text, "Hi");
        assert_eq!(conversation.messages[1].sender, Sender::Bot);
        assert_eq!(conversation.messages[1].text, "Hello!");
        assert_eq!(upstream.seen()[0].1["message"], "Hi");
    }

    #[tokio::test]
    async fn test_end_to_end_failure_surfaces_in_transcript() {
        let (_upstream, upstream_addr) =
            spawn_upstream(Reply::Status(StatusCode::BAD_GATEWAY)).await;
        let relay_addr = serve(relay_app(upstream_addr, SessionPolicy::PerRequest)).await;

        let store = ConversationStore::load(Arc::new(MemoryKv::new()));
        let consumer = StreamConsumer::new(
            store.clone(),
            RelayTransport::new(format!("http://{relay_addr}/api/chat")),
        );

        let outcome = consumer.send("Hi").await;
        assert!(matches!(outcome, TurnOutcome::Failed(_)), "{outcome:?}");

        let conversation = store.active_conversation().unwrap().unwrap();
        assert_eq!(
            conversation.messages[1].text,
            format!("⚠️ Error: {WORKFLOW_ERROR}")
        );
    }

    #[tokio::test]
    async fn test_end_to_end_missing_body_shows_warning() {
        let (_upstream, upstream_addr) =
            spawn_upstream(Reply::Status(StatusCode::NO_CONTENT)).await;
        let relay_addr = serve(relay_app(upstream_addr, SessionPolicy::PerRequest)).await;

        let store = ConversationStore::load(Arc::new(MemoryKv::new()));
        let consumer = StreamConsumer::new(
            store.clone(),
            RelayTransport::new(format!("http://{relay_addr}/api/chat")),
        );

        match consumer.send("Hi").await {
            TurnOutcome::Failed(e) => assert_eq!(e.kind, StreamErrorKind::NoBody),
            other => panic!("expected failure, got {other:?}"),
        }

        let conversation = store.active_conversation().unwrap().unwrap();
        assert_eq!(conversation.messages[1].text, NO_STREAM_TEXT);
    }
}

//! streamchat relay server
//!
//! Forwards chat turns to the workflow backend and streams the reply back.

use std::net::SocketAddr;
use streamchat::config::RelayConfig;
use streamchat::relay::{create_router, AppState};
use streamchat::upstream::WorkflowClient;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    streamchat::telemetry::init_server();

    let config = RelayConfig::from_env();

    if config.upstream.api_key.is_none() {
        tracing::warn!("No upstream API key configured. Set STREAMCHAT_API_KEY.");
    }
    if config.upstream.workflow_id.is_none() {
        tracing::warn!("No workflow id configured. Set STREAMCHAT_WORKFLOW_ID.");
    }
    tracing::info!(
        upstream = %config.upstream.url,
        session_policy = ?config.upstream.session_policy,
        "Upstream configured"
    );

    let state = AppState::new(WorkflowClient::new(config.upstream));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // No compression layer: chunks must reach the client as they arrive
    let app = create_router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("streamchat relay listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

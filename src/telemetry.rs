//! Tracing subscriber setup for the two binaries

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Server default when `RUST_LOG` is unset
pub const SERVER_FILTER: &str = "streamchat=info,tower_http=debug";

/// Client default; keeps the transcript readable
pub const CLI_FILTER: &str = "streamchat=warn";

/// JSON lines on stdout
pub fn init_server() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| SERVER_FILTER.into()))
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();
}

/// Compact lines on stderr
pub fn init_cli() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| CLI_FILTER.into()))
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

//! Environment configuration for the relay server and the client

use crate::upstream::{SessionPolicy, UpstreamConfig, DEFAULT_UPSTREAM_URL};
use std::path::PathBuf;

pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_RELAY_URL: &str = "http://127.0.0.1:8000/api/chat";

/// Relay server settings
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub port: u16,
    pub upstream: UpstreamConfig,
}

impl RelayConfig {
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let port = var("STREAMCHAT_PORT")
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_PORT);

        Self {
            port,
            upstream: upstream_from_vars(&var),
        }
    }
}

/// Where the client sends turns
#[derive(Debug, Clone)]
pub enum ClientTarget {
    Relay { url: String },
    Direct(UpstreamConfig),
}

/// Interactive client settings
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub db_path: PathBuf,
    pub target: ClientTarget,
    pub session_policy: SessionPolicy,
}

impl ClientConfig {
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let db_path = var("STREAMCHAT_DB_PATH").map_or_else(
            || {
                let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".streamchat").join("chats.db")
            },
            PathBuf::from,
        );

        let upstream = upstream_from_vars(&var);
        let session_policy = upstream.session_policy;

        let direct = var("STREAMCHAT_DIRECT").is_some_and(|v| is_truthy(&v));
        let target = if direct {
            ClientTarget::Direct(upstream)
        } else {
            ClientTarget::Relay {
                url: var("STREAMCHAT_RELAY_URL").unwrap_or_else(|| DEFAULT_RELAY_URL.to_string()),
            }
        };

        Self {
            db_path,
            target,
            session_policy,
        }
    }
}

fn upstream_from_vars(var: &impl Fn(&str) -> Option<String>) -> UpstreamConfig {
    let session_policy = match var("STREAMCHAT_SESSION_POLICY") {
        Some(raw) => raw.parse::<SessionPolicy>().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Ignoring STREAMCHAT_SESSION_POLICY");
            SessionPolicy::default()
        }),
        None => SessionPolicy::default(),
    };

    UpstreamConfig {
        url: var("STREAMCHAT_UPSTREAM_URL").unwrap_or_else(|| DEFAULT_UPSTREAM_URL.to_string()),
        api_key: var("STREAMCHAT_API_KEY").filter(|k| !k.is_empty()),
        workflow_id: var("STREAMCHAT_WORKFLOW_ID").filter(|w| !w.is_empty()),
        session_policy,
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

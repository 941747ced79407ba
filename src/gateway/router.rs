//! HTTP router and admin handlers

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    response::IntoResponse,
    routing::get,
};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::debug;

use super::{proxy::proxy_handler, upstream::UpstreamTable};
use crate::token::{TokenManager, TokenState};

/// Shared application state
pub struct AppState {
    /// Upstream table and path allow-list
    pub upstreams: Arc<UpstreamTable>,
    /// Token cache
    pub tokens: Arc<TokenManager>,
}

/// Create the router: admin endpoints plus the proxy fallback
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/readyz", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .route("/token-info", get(token_info_handler))
        .fallback(proxy_handler)
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Liveness probe
async fn health_handler() -> &'static str {
    "OK"
}

/// Readiness probe
async fn ready_handler() -> &'static str {
    "READY"
}

/// Aggregate token cache counters
#[derive(Debug, Serialize)]
struct MetricsResponse {
    tokens_cached: usize,
    tokens_refreshed: u64,
    tokens_rejected: u64,
    tokens_errors: u64,
    upstreams_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    oldest_token_age: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    newest_token_age: Option<i64>,
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.tokens.stats().await;
    let now = Utc::now();

    let response = MetricsResponse {
        tokens_cached: stats.tokens_cached,
        tokens_refreshed: stats.tokens_refreshed,
        tokens_rejected: stats.tokens_rejected,
        tokens_errors: stats.tokens_errors,
        upstreams_count: state.upstreams.len(),
        oldest_token_age: stats.oldest_token.map(|t| (now - t).num_seconds()),
        newest_token_age: stats.newest_token.map(|t| (now - t).num_seconds()),
    };

    debug!(tokens_cached = response.tokens_cached, "Metrics response sent");
    Json(response)
}

/// Per-audience token details
#[derive(Debug, Serialize)]
struct TokenInfoResponse {
    total_tokens: usize,
    upstreams_configured: usize,
    tokens: Vec<TokenInfo>,
}

#[derive(Debug, Serialize)]
struct TokenInfo {
    audience: String,
    state: TokenState,
    issued_at: String,
    expires_at: String,
    /// Seconds until expiry (negative once expired)
    expires_in: i64,
    last_used: String,
    refresh_count: u64,
    rejected_count: u64,
    error_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_error: Option<String>,
}

async fn token_info_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let all = state.tokens.all_metadata().await;
    let now = Utc::now();

    let mut tokens: Vec<TokenInfo> = all
        .into_iter()
        .map(|(audience, meta)| TokenInfo {
            audience,
            state: meta.state,
            issued_at: meta.issued_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            expires_at: meta.expires_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            expires_in: (meta.expires_at - now).num_seconds(),
            last_used: meta.last_used.to_rfc3339_opts(SecondsFormat::Secs, true),
            refresh_count: meta.refresh_count,
            rejected_count: meta.rejected_count,
            error_count: meta.error_count,
            last_error: (!meta.last_error.is_empty()).then_some(meta.last_error),
        })
        .collect();
    tokens.sort_by(|a, b| a.audience.cmp(&b.audience));

    let response = TokenInfoResponse {
        total_tokens: tokens.len(),
        upstreams_configured: state.upstreams.len(),
        tokens,
    };

    debug!(token_count = response.total_tokens, "Token info response sent");
    Json(response)
}

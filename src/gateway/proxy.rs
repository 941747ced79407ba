//! Proxy pipeline
//!
//! For each request: gate the path, select the upstream, acquire a token,
//! rewrite the destination, stream the request through, and feed 401/403
//! rejection signals back into the token cache.

use std::{net::SocketAddr, sync::Arc, time::Instant};

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode, header},
    response::{IntoResponse, Response},
};
use tracing::{debug, error, info, warn};

use super::{router::AppState, upstream::Upstream};

/// Hop-by-hop headers (RFC 7230) stripped in both directions
const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Fallback handler proxying every non-admin request to an upstream
pub async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(client_addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    let started = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    if !state.upstreams.is_allowed(&path) {
        warn!(path = %path, client = %client_addr, "Path not allowed");
        return (StatusCode::NOT_FOUND, "Not Found").into_response();
    }

    let Some(upstream) = state.upstreams.select(request.headers()) else {
        warn!(path = %path, "No upstream configured");
        return (
            StatusCode::NOT_FOUND,
            "No upstream configured for this request",
        )
            .into_response();
    };

    let token = match state.tokens.get_token(&upstream.config.audience).await {
        Ok(token) => token,
        Err(err) => {
            error!(
                upstream = %upstream.config.name,
                audience = %upstream.config.audience,
                error = %err,
                "Failed to get token"
            );
            // Raw provider errors stay in the logs; the client sees a
            // generic prefix only.
            return (StatusCode::INTERNAL_SERVER_ERROR, "Authentication error").into_response();
        }
    };

    let response = match forward(&state, &upstream, &token, client_addr, request).await {
        Ok(response) => response,
        Err(err) => {
            error!(
                upstream = %upstream.config.name,
                error = %err,
                duration_ms = started.elapsed().as_millis() as u64,
                "Proxy error"
            );
            (StatusCode::BAD_GATEWAY, format!("Bad Gateway: {err}")).into_response()
        }
    };

    info!(
        method = %method,
        path = %path,
        upstream = %upstream.config.name,
        status = response.status().as_u16(),
        duration_ms = started.elapsed().as_millis() as u64,
        "Request completed"
    );

    response
}

/// Rewrite and forward a request, streaming the response back.
///
/// A 401/403 from the upstream marks the token rejected; the body is buffered
/// and restored so the client still receives the original response.
async fn forward(
    state: &AppState,
    upstream: &Upstream,
    token: &str,
    client_addr: SocketAddr,
    request: Request<Body>,
) -> crate::Result<Response> {
    let (parts, body) = request.into_parts();

    let mut target = upstream.url.clone();
    target.set_path(&single_joining_slash(upstream.url.path(), parts.uri.path()));
    target.set_query(parts.uri.query());

    let mut headers = parts.headers;
    strip_hop_by_hop(&mut headers);
    // The client owns framing and host selection from here on.
    headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);

    let host = upstream
        .config
        .host
        .clone()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| target_authority(&target));
    if let Ok(value) = HeaderValue::from_str(&host) {
        headers.insert(header::HOST, value);
    }

    let mut bearer = HeaderValue::from_str(&format!("Bearer {token}"))
        .map_err(|e| crate::Error::Internal(format!("invalid bearer value: {e}")))?;
    bearer.set_sensitive(true);
    headers.insert(header::AUTHORIZATION, bearer);

    // Preserve an existing forwarding chain; only start one when absent.
    if !headers.contains_key("x-forwarded-for") {
        if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
            headers.insert(HeaderName::from_static("x-forwarded-for"), value);
        }
    }
    headers.insert(
        HeaderName::from_static("x-forwarded-proto"),
        HeaderValue::from_static("https"),
    );

    debug!(
        method = %parts.method,
        url = %target,
        host = %host,
        upstream = %upstream.config.name,
        token_length = token.len(),
        "Upstream request prepared"
    );

    let upstream_response = upstream
        .client
        .request(parts.method, target)
        .headers(headers)
        .body(reqwest::Body::wrap_stream(body.into_data_stream()))
        .send()
        .await?;

    let status = upstream_response.status();
    let mut response_headers = upstream_response.headers().clone();
    strip_hop_by_hop(&mut response_headers);

    let body = if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        warn!(
            upstream = %upstream.config.name,
            status = status.as_u16(),
            "Upstream rejected token"
        );

        // Buffer so the original response still reaches the client.
        let bytes = upstream_response.bytes().await?;
        state.tokens.mark_rejected(&upstream.config.audience).await;
        Body::from(bytes)
    } else {
        Body::from_stream(upstream_response.bytes_stream())
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;

    Ok(response)
}

/// Authority (host, plus port when non-default) of the target URL
fn target_authority(url: &url::Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

/// Join two URL paths with exactly one slash between them
fn single_joining_slash(a: &str, b: &str) -> String {
    let a_slash = a.ends_with('/');
    let b_slash = b.starts_with('/');
    match (a_slash, b_slash) {
        (true, true) => format!("{a}{}", &b[1..]),
        (false, false) => format!("{a}/{b}"),
        _ => format!("{a}{b}"),
    }
}

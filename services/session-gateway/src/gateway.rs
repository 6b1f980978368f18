//! Request forwarding through the refresh layer
//!
//! Each inbound request gets its own cookie jar seeded from its `Cookie`
//! headers and its own `ApiClient` in the server environment. The backend sees
//! `Authorization: Bearer <auth.token>` in place of the auth cookies; any other
//! cookies are forwarded as sent. If the backend reports the token expired,
//! the client refreshes with `auth.refreshToken` and replays, and the new pair
//! goes back to the browser as `Set-Cookie`.

use axum::body::Body;
use axum::http::header::{CONTENT_TYPE, COOKIE, HOST, SET_COOKIE};
use axum::http::{HeaderMap, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use refresh_client::{ApiClient, ApiRequest, ApiResponse, Environment, Error};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use token_auth::{ACCESS_TOKEN_COOKIE, CookieJar, CookieOptions, REFRESH_TOKEN_COOKIE};
use tracing::{debug, error, instrument, warn};

use crate::metrics;

/// Headers to strip before forwarding (hop-by-hop per RFC 2616 Section 13.5.1)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Inbound request body limit
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Counters surfaced on `/health`.
#[derive(Clone)]
pub struct GatewayStats {
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
    pub in_flight: Arc<AtomicU64>,
    pub started_at: Instant,
}

impl GatewayStats {
    pub fn new() -> Self {
        Self {
            requests_total: Arc::new(AtomicU64::new(0)),
            errors_total: Arc::new(AtomicU64::new(0)),
            in_flight: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }
}

/// Decrements `in_flight` when the request finishes, however it finishes.
struct InFlight(Arc<AtomicU64>);

impl InFlight {
    fn enter(counter: &Arc<AtomicU64>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Shared state passed to the gateway handler via axum State extractor
#[derive(Clone)]
pub struct GatewayState {
    pub http: reqwest::Client,
    pub backend_url: String,
    pub timeout: Duration,
    pub cookies: CookieOptions,
    pub max_replays: Option<u32>,
    pub stats: GatewayStats,
}

/// JSON error body: {"error":{"type":"...","message":"...","request_id":"req_..."}}
fn error_response(status: StatusCode, kind: &str, message: &str, request_id: &str) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": kind,
            "message": message,
            "request_id": request_id,
        }
    });
    (status, [(CONTENT_TYPE, "application/json")], body.to_string()).into_response()
}

/// Forward an inbound request to the backend with token refresh.
#[instrument(skip_all, fields(request_id = %request_id, method = %request.method(), path = %request.uri().path()))]
pub async fn forward_request(
    state: &GatewayState,
    request: Request<Body>,
    request_id: String,
) -> Response {
    let started = Instant::now();
    let _in_flight = InFlight::enter(&state.stats.in_flight);
    state.stats.requests_total.fetch_add(1, Ordering::Relaxed);

    let method = request.method().clone();
    let path = request
        .uri()
        .path_and_query()
        .map_or_else(|| request.uri().path().to_string(), |pq| pq.to_string());

    let jar = Arc::new(inbound_jar(request.headers(), state.cookies.clone()));

    let headers = outbound_headers(request.headers());

    let body = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(e) => {
            state.stats.errors_total.fetch_add(1, Ordering::Relaxed);
            error!(error = %e, "failed to read request body");
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                &format!("invalid request body: {e}"),
                &request_id,
            );
        }
    };

    let client = match ApiClient::setup(
        &state.backend_url,
        state.http.clone(),
        Some(state.timeout),
        jar.clone(),
        Environment::Server,
    )
    .await
    {
        Ok(client) => match state.max_replays {
            Some(max) => client.with_max_replays(max),
            None => client,
        },
        Err(e) => {
            state.stats.errors_total.fetch_add(1, Ordering::Relaxed);
            error!(error = %e, "failed to set up backend client");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "gateway_error",
                &e.to_string(),
                &request_id,
            );
        }
    };

    let mut outgoing = ApiRequest::new(method.clone(), path);
    outgoing.headers = headers;
    if !body.is_empty() {
        outgoing.body = Some(body);
    }

    let mut response = match client.send(outgoing).await {
        Ok(upstream) => backend_response(upstream, &request_id),
        Err(e) => error_to_response(e, &state.stats, &request_id),
    };

    for cookie in jar.set_cookie_headers().await {
        match HeaderValue::from_str(&cookie) {
            Ok(value) => {
                response.headers_mut().append(SET_COOKIE, value);
            }
            Err(e) => warn!(error = %e, "skipping unrepresentable Set-Cookie value"),
        }
    }

    metrics::record_request(
        response.status().as_u16(),
        method.as_str(),
        started.elapsed().as_secs_f64(),
    );
    response
}

/// Seed the request's jar from every `Cookie` header.
///
/// Browsers and intermediaries may split cookies across several headers.
/// Bytes that are not UTF-8 are replaced, so one odd cookie does not cost
/// the request its tokens.
fn inbound_jar(headers: &HeaderMap, options: CookieOptions) -> CookieJar {
    let merged = headers
        .get_all(COOKIE)
        .iter()
        .map(|value| String::from_utf8_lossy(value.as_bytes()))
        .collect::<Vec<_>>()
        .join("; ");
    CookieJar::from_cookie_header(&merged, options)
}

/// Request headers to send to the backend.
///
/// Drops hop-by-hop headers and `Host` (set from the backend URL). `Cookie`
/// headers are folded into one with the auth cookies removed, since the
/// token travels as the bearer header instead.
fn outbound_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in inbound {
        if is_hop_by_hop(name.as_str()) || name == HOST || name == COOKIE {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    if let Some(cookies) = forwarded_cookies(inbound) {
        headers.insert(COOKIE, cookies);
    }
    headers
}

/// The inbound cookies other than `auth.token` and `auth.refreshToken`,
/// byte for byte, or `None` if nothing is left.
fn forwarded_cookies(inbound: &HeaderMap) -> Option<HeaderValue> {
    let mut kept: Vec<&[u8]> = Vec::new();
    for value in inbound.get_all(COOKIE) {
        for pair in value.as_bytes().split(|b| *b == b';') {
            let pair = pair.trim_ascii();
            if pair.is_empty() {
                continue;
            }
            let name = pair
                .split(|b| *b == b'=')
                .next()
                .unwrap_or_default()
                .trim_ascii();
            if name == ACCESS_TOKEN_COOKIE.as_bytes() || name == REFRESH_TOKEN_COOKIE.as_bytes() {
                continue;
            }
            kept.push(pair);
        }
    }
    if kept.is_empty() {
        return None;
    }
    HeaderValue::from_bytes(&kept.join(&b"; "[..])).ok()
}

/// Rebuild the backend's response for the browser.
fn backend_response(upstream: ApiResponse, request_id: &str) -> Response {
    let mut response = Response::builder().status(upstream.status);
    for (name, value) in &upstream.headers {
        if !is_hop_by_hop(name.as_str()) {
            response = response.header(name, value);
        }
    }
    response
        .body(Body::from(upstream.body))
        .unwrap_or_else(|e| {
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "gateway_error",
                &format!("response build error: {e}"),
                request_id,
            )
        })
}

/// Map a refresh-layer error to the response the browser sees.
///
/// Backend failures that are not about the token are forwarded verbatim.
fn error_to_response(err: Error, stats: &GatewayStats, request_id: &str) -> Response {
    match err {
        Error::Status(upstream) | Error::Unauthorized(upstream) => {
            debug!(status = upstream.status.as_u16(), "forwarding backend error");
            backend_response(*upstream, request_id)
        }
        err if err.requires_reauthentication() => {
            debug!(error = %err, "session needs re-authentication");
            error_response(
                StatusCode::UNAUTHORIZED,
                "auth_token_error",
                &err.to_string(),
                request_id,
            )
        }
        err @ (Error::Transport(_) | Error::ReplayLimit(_)) => {
            stats.errors_total.fetch_add(1, Ordering::Relaxed);
            let error_type = if matches!(err, Error::Transport(_)) {
                "transport"
            } else {
                "replay_limit"
            };
            metrics::record_upstream_error(error_type);
            error!(error = %err, "backend request failed");
            error_response(
                StatusCode::BAD_GATEWAY,
                "gateway_error",
                &err.to_string(),
                request_id,
            )
        }
        err => {
            stats.errors_total.fetch_add(1, Ordering::Relaxed);
            metrics::record_upstream_error("internal");
            error!(error = %err, "request failed inside gateway");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "gateway_error",
                &err.to_string(),
                request_id,
            )
        }
    }
}

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

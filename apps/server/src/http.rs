//! HTTP surface: WebSocket upgrade, health endpoint, response headers.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use chrono::SecondsFormat;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use warplan_protocol::constants::WS_MAX_MESSAGE_SIZE;
use warplan_signaling::{run_session, Hub, RateLimiter};

use crate::config::Config;

pub const SERVICE_NAME: &str = "warp-lan-signaling";

const CONTENT_SECURITY_POLICY: &str = "default-src 'self'; \
    script-src 'self' 'unsafe-inline'; \
    style-src 'self' 'unsafe-inline' https://fonts.googleapis.com; \
    font-src 'self' https://fonts.gstatic.com; \
    connect-src 'self' wss://*.railway.app wss://localhost:* ws://localhost:*; \
    img-src 'self' data: blob:; \
    frame-ancestors 'none'; \
    base-uri 'self';";

/// Process-lifetime counters surfaced by `/health`.
pub struct Metrics {
    started_at: Instant,
    total_connections: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            total_connections: AtomicU64::new(0),
        }
    }

    fn record_connection(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub hub: Arc<Hub>,
    pub rate_limiter: Arc<RateLimiter>,
    pub metrics: Arc<Metrics>,
    pub cancel: CancellationToken,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler).options(preflight))
        .route("/health", get(health).options(preflight))
        .fallback(fallback)
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            apply_response_headers,
        ))
        .with_state(state)
}

/// Adds the security and CORS headers to every response, upgrade
/// responses included.
async fn apply_response_headers(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let origin = request
        .headers()
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok())
        .map(String::from);

    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static(CONTENT_SECURITY_POLICY),
    );
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::X_XSS_PROTECTION,
        HeaderValue::from_static("1; mode=block"),
    );
    headers.insert(
        header::REFERRER_POLICY,
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    headers.insert(
        HeaderName::from_static("permissions-policy"),
        HeaderValue::from_static("geolocation=(), microphone=(), camera=()"),
    );

    if state.config.allows_any_origin() {
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        );
    } else if let Some(origin) = origin.filter(|o| state.config.origin_allowed(Some(o))) {
        if let Ok(value) = HeaderValue::from_str(&origin) {
            headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
        }
    }
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type"),
    );

    response
}

/// Admission, origin check, and WebSocket upgrade.
async fn ws_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let source = client_ip(&headers, peer);

    if !state.rate_limiter.allow(&source) {
        warn!(ip = %source, "rate limited client");
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }

    let origin = headers
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok());
    if !state.config.origin_allowed(origin) {
        warn!(ip = %source, origin = origin.unwrap_or(""), "origin not allowed");
        return StatusCode::FORBIDDEN.into_response();
    }

    ws.max_message_size(WS_MAX_MESSAGE_SIZE)
        .max_frame_size(WS_MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| async move {
            state.metrics.record_connection();
            let id = short_id();
            info!(client_id = %id, ip = %source, "websocket connection established");
            run_session(socket, id, Arc::clone(&state.hub), &state.cancel).await;
        })
}

/// Server-assigned client id: the first 8 characters of a v4 uuid, short
/// enough to read in logs and to address peers by hand while debugging.
fn short_id() -> String {
    Uuid::new_v4().to_string()[..8].to_string()
}

/// Source-address key for rate limiting: first forwarded-for entry, then
/// real-ip, then the transport peer address.
fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(real_ip) = headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
    {
        let real_ip = real_ip.trim();
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }
    peer.ip().to_string()
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    uptime_seconds: u64,
    total_connections: u64,
    active_rooms: usize,
    active_clients: usize,
    version: &'static str,
    timestamp: String,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let snapshot = state.hub.snapshot().await;
    Json(HealthResponse {
        status: "healthy",
        service: SERVICE_NAME,
        uptime_seconds: state.metrics.uptime_seconds(),
        total_connections: state.metrics.total_connections(),
        active_rooms: snapshot.active_rooms,
        active_clients: snapshot.active_clients,
        version: env!("CARGO_PKG_VERSION"),
        timestamp: chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    })
}

async fn preflight() -> StatusCode {
    StatusCode::OK
}

async fn fallback(method: Method) -> StatusCode {
    if method == Method::OPTIONS {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_state(config: Config) -> AppState {
        AppState {
            config: Arc::new(config),
            hub: Hub::new(),
            rate_limiter: Arc::new(RateLimiter::new(5, Duration::from_secs(60))),
            metrics: Arc::new(Metrics::new()),
            cancel: CancellationToken::new(),
        }
    }

    fn any_origin_config() -> Config {
        Config {
            port: 0,
            allowed_origins: vec![],
        }
    }

    #[test]
    fn short_id_is_eight_chars() {
        let id = short_id();
        assert_eq!(id.len(), 8);
        assert_ne!(id, short_id());
    }

    #[test]
    fn client_ip_prefers_forwarded_for_chain_head() {
        let peer: SocketAddr = "10.0.0.1:9999".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7 , 198.51.100.2"),
        );
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.9"));

        assert_eq!(client_ip(&headers, peer), "203.0.113.7");
    }

    #[test]
    fn client_ip_falls_back_to_real_ip_then_peer() {
        let peer: SocketAddr = "10.0.0.1:9999".parse().unwrap();

        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.9"));
        assert_eq!(client_ip(&headers, peer), "198.51.100.9");

        let headers = HeaderMap::new();
        assert_eq!(client_ip(&headers, peer), "10.0.0.1");
    }

    #[tokio::test]
    async fn health_reports_registry_counts() {
        let state = test_state(any_origin_config());
        state.metrics.record_connection();
        state.metrics.record_connection();

        let Json(body) = health(State(state)).await;
        assert_eq!(body.status, "healthy");
        assert_eq!(body.service, "warp-lan-signaling");
        assert_eq!(body.total_connections, 2);
        assert_eq!(body.active_rooms, 0);
        assert_eq!(body.active_clients, 0);
        assert!(!body.version.is_empty());
        // RFC 3339 UTC at seconds precision.
        assert!(body.timestamp.ends_with('Z'));
    }

    #[tokio::test]
    async fn fallback_serves_preflight_and_404() {
        assert_eq!(fallback(Method::OPTIONS).await, StatusCode::OK);
        assert_eq!(fallback(Method::GET).await, StatusCode::NOT_FOUND);
        assert_eq!(fallback(Method::POST).await, StatusCode::NOT_FOUND);
    }
}

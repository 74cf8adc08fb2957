//! Axum-based HTTP gateway with body limits, timeouts, and rate limiting.
//!
//! Route table:
//! - `GET /health` — liveness + link state, always public
//! - `GET /qr` — latest pairing QR payload as JSON
//! - `GET /qr.png` — latest pairing QR rendered as PNG
//! - `POST /send` — send a text message (requires `X-Api-Key`)
//! - `POST /reset-auth` — wipe session credentials (requires `X-Api-Key`)

use crate::channels::WhatsAppBackend;
use crate::config::Config;
use crate::qr::{self, QrState};
use crate::security::{constant_time_eq, hash_api_key};
use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tracing::{error, info, warn};

/// Maximum request body size (64KB) — prevents memory exhaustion
pub const MAX_BODY_SIZE: usize = 65_536;
/// Request timeout — gateway operations are quick; slow-loris protection
pub const REQUEST_TIMEOUT_SECS: u64 = 30;
/// Sliding window used by gateway rate limiting.
pub const RATE_LIMIT_WINDOW_SECS: u64 = 60;

/// How often the rate limiter sweeps stale client entries from its map.
const RATE_LIMITER_SWEEP_INTERVAL_SECS: u64 = 300; // 5 minutes

#[derive(Debug)]
struct SlidingWindowRateLimiter {
    limit_per_window: u32,
    window: Duration,
    requests: Mutex<(HashMap<String, Vec<Instant>>, Instant)>,
}

impl SlidingWindowRateLimiter {
    fn new(limit_per_window: u32, window: Duration) -> Self {
        Self {
            limit_per_window,
            window,
            requests: Mutex::new((HashMap::new(), Instant::now())),
        }
    }

    fn allow(&self, key: &str) -> bool {
        if self.limit_per_window == 0 {
            return true;
        }

        let now = Instant::now();
        let cutoff = now.checked_sub(self.window).unwrap_or_else(Instant::now);

        let mut guard = self.requests.lock();
        let (requests, last_sweep) = &mut *guard;

        // Periodic sweep: drop clients with no recent requests
        if last_sweep.elapsed() >= Duration::from_secs(RATE_LIMITER_SWEEP_INTERVAL_SECS) {
            requests.retain(|_, timestamps| {
                timestamps.retain(|t| *t > cutoff);
                !timestamps.is_empty()
            });
            *last_sweep = now;
        }

        let entry = requests.entry(key.to_owned()).or_default();
        entry.retain(|instant| *instant > cutoff);

        if entry.len() >= self.limit_per_window as usize {
            return false;
        }

        entry.push(now);
        true
    }
}

#[derive(Debug)]
pub struct GatewayRateLimiter {
    send: SlidingWindowRateLimiter,
    reset: SlidingWindowRateLimiter,
}

impl GatewayRateLimiter {
    pub fn new(send_per_minute: u32, reset_per_minute: u32) -> Self {
        let window = Duration::from_secs(RATE_LIMIT_WINDOW_SECS);
        Self {
            send: SlidingWindowRateLimiter::new(send_per_minute, window),
            reset: SlidingWindowRateLimiter::new(reset_per_minute, window),
        }
    }

    pub fn allow_send(&self, key: &str) -> bool {
        self.send.allow(key)
    }

    pub fn allow_reset(&self, key: &str) -> bool {
        self.reset.allow(key)
    }
}

/// Shared state for all axum handlers
#[derive(Clone)]
pub struct AppState {
    pub backend: Arc<dyn WhatsAppBackend>,
    pub qr: QrState,
    /// SHA-256 hash of the API key (hex-encoded), never plaintext.
    pub api_key_hash: Option<Arc<str>>,
    pub rate_limiter: Arc<GatewayRateLimiter>,
}

impl AppState {
    pub fn new(backend: Arc<dyn WhatsAppBackend>, qr: QrState, config: &Config) -> Self {
        Self {
            backend,
            qr,
            api_key_hash: config
                .gateway
                .api_key
                .as_deref()
                .map(|key| Arc::from(hash_api_key(key).as_str())),
            rate_limiter: Arc::new(GatewayRateLimiter::new(
                config.gateway.send_per_minute,
                config.gateway.reset_per_minute,
            )),
        }
    }
}

/// True when the bind address exposes the gateway beyond loopback.
pub fn is_public_bind(host: &str) -> bool {
    !matches!(host, "127.0.0.1" | "localhost" | "::1")
}

/// Build the route table with its middleware stack.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers([
            header::CONTENT_TYPE,
            header::HeaderName::from_static("x-api-key"),
        ])
        .max_age(Duration::from_secs(3600));

    Router::new()
        .route("/health", get(handle_health))
        .route("/qr", get(handle_qr))
        .route("/qr.png", get(handle_qr_png))
        .route("/send", post(handle_send))
        .route("/reset-auth", post(handle_reset_auth))
        .with_state(state)
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(REQUEST_TIMEOUT_SECS),
        ))
}

/// Run the HTTP gateway.
pub async fn run_gateway(config: &Config, state: AppState) -> anyhow::Result<()> {
    let host = &config.gateway.host;
    if is_public_bind(host) && !config.gateway.allow_public_bind {
        anyhow::bail!(
            "refusing to bind to {host} — gateway would be exposed beyond loopback.\n\
             Fix: use host = \"127.0.0.1\" (default), or set\n\
             [gateway] allow_public_bind = true in config.toml."
        );
    }

    let addr: SocketAddr = format!("{host}:{}", config.gateway.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("whatsapp gateway listening on http://{}", listener.local_addr()?);

    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// Rate-limit key: forwarded client address where available.
fn client_key_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .or_else(|| headers.get("x-real-ip"))
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').next().unwrap_or(v).trim().to_string())
        .unwrap_or_else(|| "local".to_string())
}

/// Check `X-Api-Key` against the stored hash. Constant-time; a gateway with
/// no configured key rejects every protected request.
fn require_api_key(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let unauthorized = || {
        let err = serde_json::json!({"error": "unauthorized"});
        (StatusCode::UNAUTHORIZED, Json(err)).into_response()
    };

    let Some(ref expected_hash) = state.api_key_hash else {
        warn!("protected endpoint hit but no api_key is configured");
        return Err(unauthorized());
    };

    let presented = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(hash_api_key);

    match presented {
        Some(hash) if constant_time_eq(&hash, expected_hash.as_ref()) => Ok(()),
        _ => {
            warn!("rejected request with invalid or missing X-Api-Key");
            Err(unauthorized())
        }
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// AXUM HANDLERS
// ══════════════════════════════════════════════════════════════════════════════

/// GET /health — always public (no secrets leaked)
async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    let body = serde_json::json!({
        "status": "ok",
        "backend": state.backend.name(),
        "connected": state.backend.is_connected().await,
        "linked": state.backend.is_linked(),
    });
    Json(body)
}

/// GET /qr — latest pairing QR payload (null once paired)
async fn handle_qr(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({ "qr": state.qr.current() }))
}

/// GET /qr.png — latest pairing QR rendered as PNG
async fn handle_qr_png(State(state): State<AppState>) -> Response {
    let Some(payload) = state.qr.current() else {
        return (StatusCode::NOT_FOUND, "no-qr").into_response();
    };

    match qr::render_png(&payload) {
        Ok(png) => ([(header::CONTENT_TYPE, "image/png")], png).into_response(),
        Err(e) => {
            error!("QR PNG render failed: {e}");
            let err = serde_json::json!({"error": "failed to render QR"});
            (StatusCode::INTERNAL_SERVER_ERROR, Json(err)).into_response()
        }
    }
}

/// Send request body
#[derive(Debug, Deserialize)]
pub struct SendBody {
    pub to_number: String,
    pub text: String,
}

/// POST /send — send a text message to a phone number
async fn handle_send(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<SendBody>, axum::extract::rejection::JsonRejection>,
) -> Response {
    let client_key = client_key_from_headers(&headers);
    if !state.rate_limiter.allow_send(&client_key) {
        warn!("/send rate limit exceeded for key: {client_key}");
        let err = serde_json::json!({
            "error": "too many send requests, retry later",
            "retry_after": RATE_LIMIT_WINDOW_SECS,
        });
        return (StatusCode::TOO_MANY_REQUESTS, Json(err)).into_response();
    }

    if let Err(resp) = require_api_key(&state, &headers) {
        return resp;
    }

    let Json(send_body) = match body {
        Ok(b) => b,
        Err(e) => {
            warn!("/send JSON parse error: {e}");
            let err = serde_json::json!({
                "error": "invalid JSON body, expected {\"to_number\": \"...\", \"text\": \"...\"}"
            });
            return (StatusCode::BAD_REQUEST, Json(err)).into_response();
        }
    };

    if send_body.to_number.trim().is_empty() || send_body.text.is_empty() {
        let err = serde_json::json!({"error": "to_number and text must be non-empty"});
        return (StatusCode::BAD_REQUEST, Json(err)).into_response();
    }

    if !state.backend.is_connected().await {
        let err = serde_json::json!({"error": "whatsapp not connected"});
        return (StatusCode::SERVICE_UNAVAILABLE, Json(err)).into_response();
    }

    match state
        .backend
        .send_text(&send_body.to_number, &send_body.text)
        .await
    {
        Ok(()) => Json(serde_json::json!({"status": "sent"})).into_response(),
        Err(e) => {
            error!("whatsapp send failed: {e}");
            let err = serde_json::json!({"error": "send failed"});
            (StatusCode::BAD_GATEWAY, Json(err)).into_response()
        }
    }
}

/// POST /reset-auth — wipe session credentials so the next start re-pairs
async fn handle_reset_auth(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let client_key = client_key_from_headers(&headers);
    if !state.rate_limiter.allow_reset(&client_key) {
        warn!("/reset-auth rate limit exceeded for key: {client_key}");
        let err = serde_json::json!({
            "error": "too many reset requests, retry later",
            "retry_after": RATE_LIMIT_WINDOW_SECS,
        });
        return (StatusCode::TOO_MANY_REQUESTS, Json(err)).into_response();
    }

    if let Err(resp) = require_api_key(&state, &headers) {
        return resp;
    }

    match state.backend.reset_session().await {
        Ok(()) => Json(serde_json::json!({"status": "cleared"})).into_response(),
        Err(e) => {
            error!("auth reset failed: {e}");
            Json(serde_json::json!({"status": "failed"})).into_response()
        }
    }
}

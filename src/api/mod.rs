//! HTTP surface: router plus middleware (request logging, per-IP rate limit,
//! token auth with a loopback bypass, body size limits). The front end only
//! translates requests into core calls.

mod chat_handlers;
mod facts_handlers;

use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::HeaderMap;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use parking_lot::Mutex;
use subtle::ConstantTimeEq;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{info, warn};

use crate::error::TimeLayerError;
use crate::AppState;

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/api/chat", post(chat_handlers::api_chat))
        .route("/api/chat/stream", post(chat_handlers::api_chat_stream))
        .route("/api/context/audit", post(chat_handlers::api_context_audit))
        .route("/api/debug/context", post(chat_handlers::api_context_audit))
        .route(
            "/api/facts/counts",
            get(facts_handlers::facts_counts),
        )
        .route(
            "/api/facts/pending",
            get(facts_handlers::list_pending).post(facts_handlers::add_pending),
        )
        .route("/api/facts/pending/count", get(facts_handlers::pending_count))
        .route("/api/facts/pending/groups", get(facts_handlers::pending_groups))
        .route(
            "/api/facts/pending/{id}/remember",
            post(facts_handlers::remember_pending_by_path),
        )
        .route(
            "/api/facts/pending/{id}/reject",
            post(facts_handlers::reject_pending_by_path),
        )
        .route("/api/facts/remember", post(facts_handlers::remember_pending_by_body))
        .route("/api/facts/reject", post(facts_handlers::reject_pending_by_body))
        .route("/api/facts/remember_batch", post(facts_handlers::remember_batch))
        .route("/api/facts/reject_batch", post(facts_handlers::reject_batch))
        .route("/api/facts/conflicts", get(facts_handlers::list_conflicts))
        .route(
            "/api/facts/conflicts/{id}/resolve",
            post(facts_handlers::resolve_conflict),
        )
        .route("/api/facts/active", get(facts_handlers::list_active))
        .route("/api/facts/history", get(facts_handlers::fact_history))
        .route("/api/reindex", post(facts_handlers::reindex));

    Router::new()
        .route("/health", get(chat_handlers::health))
        .merge(api)
        .layer(middleware::from_fn_with_state(state.clone(), guard_api))
        .layer(middleware::from_fn(access_log))
        .layer(RequestBodyLimitLayer::new(1024 * 1024))
        .with_state(state)
}

/// Refuse to expose the API on a non-loopback address unless a shared secret
/// is configured or insecure remote binding was explicitly allowed.
pub fn check_bind_safety(cfg: &crate::config::Config) -> Result<(), TimeLayerError> {
    if cfg.http_allow_insecure_remote || cfg.http_auth_token.is_some() {
        return Ok(());
    }
    if is_loopback_listen_addr(&cfg.http_addr) {
        return Ok(());
    }
    Err(TimeLayerError::Validation(format!(
        "refusing to bind to {} without auth; set TIMELAYER_HTTP_AUTH_TOKEN or TIMELAYER_HTTP_ALLOW_INSECURE_REMOTE=1",
        cfg.http_addr
    )))
}

/// True only when the address binds exclusively to loopback.
/// ":3210", "0.0.0.0:3210" and "[::]:3210" are NOT loopback-only.
pub fn is_loopback_listen_addr(addr: &str) -> bool {
    let addr = addr.trim();
    let Some((host, _port)) = addr.rsplit_once(':') else { return false };
    let host = host.trim().trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return false;
    }
    if host == "localhost" {
        return true;
    }
    host.parse::<IpAddr>().map(|ip| ip.is_loopback()).unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

async fn access_log(req: Request, next: Next) -> Response {
    let req_id = uuid::Uuid::new_v4().simple().to_string();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let ip = client_ip(&req);
    let start = Instant::now();

    let mut res = next.run(req).await;

    let headers = res.headers_mut();
    headers.insert("X-Content-Type-Options", "nosniff".parse().unwrap());
    headers.insert("X-Frame-Options", "DENY".parse().unwrap());
    headers.insert("Referrer-Policy", "no-referrer".parse().unwrap());

    info!(
        req_id = %&req_id[..8],
        %ip,
        method = %method,
        %path,
        status = res.status().as_u16(),
        dur_ms = start.elapsed().as_millis() as u64,
        "http"
    );
    res
}

/// Rate limit + token auth, API paths only.
async fn guard_api(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, TimeLayerError> {
    let path = req.uri().path();
    if !path.starts_with("/api/") {
        return Ok(next.run(req).await);
    }

    let ip = client_ip(&req);
    if !limiter(&state).allow(ip) {
        warn!(%ip, path, "rate limit exceeded");
        return Ok((axum::http::StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded").into_response());
    }

    if let Some(ref token) = state.cfg.http_auth_token {
        if !auth_ok(token, &req, ip) {
            return Err(TimeLayerError::Unauthorized);
        }
    }
    Ok(next.run(req).await)
}

fn client_ip(req: &Request) -> IpAddr {
    // RemoteAddr only; forwarded headers are untrusted by default.
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip())
        .unwrap_or_else(|| IpAddr::from([127, 0, 0, 1]))
}

fn has_forwarded_headers(headers: &HeaderMap) -> bool {
    ["forwarded", "x-forwarded-for", "x-real-ip", "x-forwarded-proto"]
        .iter()
        .any(|h| headers.get(*h).map(|v| !v.is_empty()).unwrap_or(false))
}

/// Loopback peers get a token-free bypass, but never when proxy-forwarding
/// headers are present, so a reverse proxy cannot accidentally skip auth.
fn auth_ok(expected: &str, req: &Request, ip: IpAddr) -> bool {
    if ip.is_loopback() && !has_forwarded_headers(req.headers()) {
        return true;
    }

    let eq = |t: &str| -> bool { t.as_bytes().ct_eq(expected.as_bytes()).into() };

    if let Some(t) = req.headers().get("x-auth-token").and_then(|v| v.to_str().ok()) {
        let t = t.trim();
        if !t.is_empty() {
            return eq(t);
        }
    }
    if let Some(a) = req.headers().get("authorization").and_then(|v| v.to_str().ok()) {
        let a = a.trim();
        if a.to_lowercase().starts_with("bearer ") {
            return eq(a[7..].trim());
        }
    }
    false
}

// ---------------------------------------------------------------------------
// Per-IP token bucket
// ---------------------------------------------------------------------------

struct Bucket {
    tokens: f64,
    last: Instant,
}

pub struct IpRateLimiter {
    rpm: u32,
    burst: f64,
    states: Mutex<std::collections::HashMap<IpAddr, Bucket>>,
}

impl IpRateLimiter {
    pub fn new(rpm: u32) -> Self {
        Self {
            rpm,
            burst: (rpm / 6).max(1) as f64, // ~10s of burst
            states: Mutex::new(std::collections::HashMap::new()),
        }
    }

    pub fn allow(&self, ip: IpAddr) -> bool {
        if self.rpm == 0 {
            return true;
        }
        let mut states = self.states.lock();
        let now = Instant::now();
        let b = states.entry(ip).or_insert(Bucket { tokens: self.burst, last: now });

        let per_sec = self.rpm as f64 / 60.0;
        let dt = now.duration_since(b.last).as_secs_f64();
        if dt > 0.0 {
            b.tokens = (b.tokens + dt * per_sec).min(self.burst);
            b.last = now;
        }
        if b.tokens < 1.0 {
            return false;
        }
        b.tokens -= 1.0;

        if states.len() > 2048 {
            let cutoff = now - std::time::Duration::from_secs(600);
            states.retain(|_, v| v.last >= cutoff);
        }
        true
    }
}

fn limiter(state: &AppState) -> &'static IpRateLimiter {
    use std::sync::OnceLock;
    static LIMITER: OnceLock<IpRateLimiter> = OnceLock::new();
    LIMITER.get_or_init(|| IpRateLimiter::new(state.cfg.http_rate_limit_rpm))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_listen_addr_detection() {
        assert!(is_loopback_listen_addr("127.0.0.1:3210"));
        assert!(is_loopback_listen_addr("localhost:3210"));
        assert!(is_loopback_listen_addr("[::1]:3210"));
        assert!(!is_loopback_listen_addr("0.0.0.0:3210"));
        assert!(!is_loopback_listen_addr(":3210"));
        assert!(!is_loopback_listen_addr("[::]:3210"));
        assert!(!is_loopback_listen_addr("192.168.1.4:3210"));
    }

    #[test]
    fn rate_limiter_refills() {
        let l = IpRateLimiter::new(60);
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        let burst = (60 / 6) as usize;
        for _ in 0..burst {
            assert!(l.allow(ip));
        }
        assert!(!l.allow(ip));
        // rpm == 0 disables limiting
        let open = IpRateLimiter::new(0);
        for _ in 0..100 {
            assert!(open.allow(ip));
        }
    }
}

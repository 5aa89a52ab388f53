use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{ConnectInfo, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};
use tokio::sync::Mutex;

use crate::rooms::room::{Room, MAX_CLIENTS};
use crate::state::AppState;

/// Per-IP budget: 120 requests per 60 seconds.
const RATE_CAPACITY: f64 = 120.0;
const RATE_PER_SEC: f64 = 2.0;

/// Aggregate streaming budget per room.
const MAX_ROOM_BANDWIDTH_MBPS: f64 = 150.0;

/// Estimate used when no final file exists yet.
const DEFAULT_BITRATE_MBPS: f64 = 15.0;

/// Assumed feature length for the size-based bitrate estimate.
const ASSUMED_DURATION_SECS: f64 = 7200.0;

#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64) -> Self {
        Self {
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn try_consume(&mut self, rate: f64, capacity: f64) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;

        self.tokens = (self.tokens + elapsed * rate).min(capacity);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Per-IP token-bucket limiter shared across the router.
#[derive(Clone)]
pub struct RateLimiter {
    buckets: Arc<Mutex<HashMap<IpAddr, TokenBucket>>>,
    rate: f64,
    capacity: f64,
}

impl RateLimiter {
    pub fn new(rate: f64, capacity: f64) -> Self {
        Self {
            buckets: Arc::new(Mutex::new(HashMap::new())),
            rate,
            capacity,
        }
    }

    pub async fn check(&self, ip: IpAddr) -> bool {
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets
            .entry(ip)
            .or_insert_with(|| TokenBucket::new(self.capacity));
        bucket.try_consume(self.rate, self.capacity)
    }

    pub async fn purge_stale(&self, max_idle_secs: f64) {
        let mut buckets = self.buckets.lock().await;
        let now = Instant::now();
        buckets.retain(|_, bucket| {
            now.duration_since(bucket.last_refill).as_secs_f64() < max_idle_secs
        });
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RATE_PER_SEC, RATE_CAPACITY)
    }
}

/// Axum middleware applying the per-IP budget. Upload traffic is exempt:
/// a chunked upload legitimately issues hundreds of requests per minute.
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    if !req.uri().path().starts_with("/api/upload/") {
        if let Some(ip) = extract_client_ip(&req) {
            if !state.limiter.check(ip).await {
                tracing::warn!(ip = %ip, path = %req.uri().path(), "rate limit exceeded");
                return Err(StatusCode::TOO_MANY_REQUESTS);
            }
        }
    }

    Ok(next.run(req).await)
}

/// Try ConnectInfo first, then X-Forwarded-For, then X-Real-IP.
fn extract_client_ip<B>(req: &Request<B>) -> Option<IpAddr> {
    if let Some(connect_info) = req.extensions().get::<ConnectInfo<std::net::SocketAddr>>() {
        return Some(connect_info.0.ip());
    }

    if let Some(forwarded) = req.headers().get("x-forwarded-for") {
        if let Ok(value) = forwarded.to_str() {
            if let Some(first) = value.split(',').next() {
                if let Ok(ip) = first.trim().parse::<IpAddr>() {
                    return Some(ip);
                }
            }
        }
    }

    if let Some(real_ip) = req.headers().get("x-real-ip") {
        if let Ok(value) = real_ip.to_str() {
            if let Ok(ip) = value.trim().parse::<IpAddr>() {
                return Some(ip);
            }
        }
    }

    None
}

/// Spawn the stale-bucket purge so idle IPs do not accumulate.
pub fn spawn_bucket_purge_loop(state: AppState) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(60)).await;
            state.limiter.purge_stale(300.0).await;
        }
    });
}

/// Size-derived bitrate estimate in Mbps, clamped to [2, 50]; falls back to
/// a fixed 15 Mbps before the final file exists.
pub fn estimated_bitrate_mbps(file_size: Option<u64>) -> f64 {
    match file_size {
        Some(size) => (size as f64 * 8.0 / ASSUMED_DURATION_SECS / 1e6).clamp(2.0, 50.0),
        None => DEFAULT_BITRATE_MBPS,
    }
}

/// Pure admission decision given the current client count and estimate.
pub fn admission_allowed(current_clients: usize, bitrate_mbps: f64) -> bool {
    if current_clients >= MAX_CLIENTS {
        return false;
    }
    (current_clients as f64 + 1.0) * bitrate_mbps <= MAX_ROOM_BANDWIDTH_MBPS
}

/// Admission check for a WebSocket join: client cap and room bandwidth cap.
pub async fn check_room_admission(room: &Room) -> Result<(), String> {
    let video_path = room.state().video_path.clone();
    let size = match video_path {
        Some(path) => tokio::fs::metadata(&path).await.ok().map(|m| m.len()),
        None => None,
    };

    if admission_allowed(room.clients.len(), estimated_bitrate_mbps(size)) {
        Ok(())
    } else {
        Err("Room full or bandwidth limit exceeded".to_string())
    }
}

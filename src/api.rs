//! Wire types for the admin surface.

use serde::{Deserialize, Serialize};

//----------- Health -----------------------------------------------------------

/// `GET /health`.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResult {
    pub status: HealthStatus,
    pub uptime_ms: u64,
    pub qps: f64,
    pub error_rate: f64,
    pub servers: ListenerMatrix,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Which listeners are up.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct ListenerMatrix {
    pub udp: bool,
    pub tcp: bool,
    pub dot: bool,
    pub doh: bool,
}

//----------- Cache ------------------------------------------------------------

/// `GET /api/cache/stats`.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatsResult {
    #[serde(flatten)]
    pub stats: crate::cache::CacheStats,
    pub max_entries: usize,
    pub serve_stale_enabled: bool,
    pub prefetch_enabled: bool,
}

//----------- Blocklist --------------------------------------------------------

/// `POST /api/blocklists/refresh`.
#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResult {
    pub feeds_ok: usize,
    pub feeds_failed: usize,
    pub domains: usize,
}

//----------- Rate limiting ----------------------------------------------------

/// `POST /api/ratelimit/clear`.
#[derive(Clone, Debug, Deserialize)]
pub struct RateLimitClear {
    pub ip: std::net::IpAddr,
}

/// Generic mutation acknowledgement.
#[derive(Clone, Debug, Serialize)]
pub struct Acknowledged {
    pub ok: bool,
}

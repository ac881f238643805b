//! The HTTP admin surface.
//!
//! The small slice of the admin API that touches the core directly:
//! health, metrics, cache controls, blocklist refresh, rate-limit
//! clearing, a live query stream, and a test endpoint that feeds an
//! encoded query through the pipeline as if it came from localhost.
//! The full CRUD admin API and UI live outside this binary and talk to
//! the same store.

use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::api::{
    Acknowledged, CacheStatsResult, HealthResult, HealthStatus, ListenerMatrix, RateLimitClear,
    RefreshResult,
};
use crate::engine::Engine;
use crate::pipeline::{self, ClientInfo, TransportKind};

/// Run the admin listener until the process exits.
pub async fn run(engine: Arc<Engine>) {
    let addr = engine.config.http.listen;
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Could not bind admin HTTP {addr}: {e}");
            return;
        }
    };
    info!("Admin HTTP listener on {addr}");

    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/api/dns/test", post(dns_test))
        .route("/api/cache/stats", get(cache_stats))
        .route("/api/cache/clear", post(cache_clear))
        .route("/api/blocklists/refresh", post(blocklists_refresh))
        .route("/api/ratelimit/clear", post(ratelimit_clear))
        .route("/api/upstreams", get(upstreams))
        .route("/api/queries/stream", get(queries_stream))
        .with_state(engine);

    if let Err(e) = axum::serve(listener, app).await {
        error!("Admin HTTP server failed: {e}");
    }
}

async fn health(State(engine): State<Arc<Engine>>) -> Json<HealthResult> {
    let (qps, error_rate) = engine.stats.rates(engine.now_unix());
    let servers = ListenerMatrix {
        udp: engine.listeners.udp.load(Ordering::Relaxed),
        tcp: engine.listeners.tcp.load(Ordering::Relaxed),
        dot: engine.listeners.dot.load(Ordering::Relaxed),
        doh: engine.listeners.doh.load(Ordering::Relaxed),
    };

    // UDP is the primary listener; losing it is an outage, not a
    // degradation.
    let mut enabled_down = !servers.udp || !servers.tcp;
    if engine.config.dot.enabled && !servers.dot {
        enabled_down = true;
    }
    if engine.config.doh.enabled && !servers.doh {
        enabled_down = true;
    }

    let status = if error_rate > 0.05 || !servers.udp {
        HealthStatus::Unhealthy
    } else if error_rate > 0.01 || enabled_down {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    };

    Json(HealthResult {
        status,
        uptime_ms: engine.uptime().as_millis() as u64,
        qps,
        error_rate,
        servers,
    })
}

async fn metrics(State(engine): State<Arc<Engine>>) -> Response {
    match engine.metrics.assemble(&engine) {
        Ok(text) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

/// Feed an encoded query through the pipeline as if it arrived from
/// 127.0.0.1; the response comes back in wire format.
async fn dns_test(State(engine): State<Arc<Engine>>, body: axum::body::Bytes) -> Response {
    let client = ClientInfo {
        addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
        transport: TransportKind::Doh,
    };
    match pipeline::handle(&engine, &body, client).await {
        Some(response) => (
            [(header::CONTENT_TYPE, "application/dns-message")],
            response,
        )
            .into_response(),
        None => StatusCode::BAD_REQUEST.into_response(),
    }
}

async fn cache_stats(State(engine): State<Arc<Engine>>) -> Json<CacheStatsResult> {
    let settings = engine.settings.load();
    Json(CacheStatsResult {
        stats: engine.cache.stats(),
        max_entries: settings.cache_max_entries,
        serve_stale_enabled: settings.serve_stale_enabled,
        prefetch_enabled: settings.prefetch_enabled,
    })
}

async fn cache_clear(State(engine): State<Arc<Engine>>) -> Json<Acknowledged> {
    engine.cache.clear();
    info!("Cache cleared via admin");
    Json(Acknowledged { ok: true })
}

async fn blocklists_refresh(State(engine): State<Arc<Engine>>) -> Json<RefreshResult> {
    let outcome = engine.refresh_blocklist().await;
    Json(RefreshResult {
        feeds_ok: outcome.feeds_ok,
        feeds_failed: outcome.feeds_failed,
        domains: outcome.domains,
    })
}

async fn ratelimit_clear(
    State(engine): State<Arc<Engine>>,
    Json(request): Json<RateLimitClear>,
) -> Json<Acknowledged> {
    engine.rate_limiter.clear(request.ip);
    info!("Rate-limit state cleared for {}", request.ip);
    Json(Acknowledged { ok: true })
}

async fn upstreams(State(engine): State<Arc<Engine>>) -> Response {
    Json(engine.upstreams.snapshot(engine.now_ms())).into_response()
}

/// Live query records as newline-delimited JSON, fed from the query
/// log's in-process fan-out.  Replaces polling: the stream ends only
/// when the client disconnects.
async fn queries_stream(State(engine): State<Arc<Engine>>) -> Response {
    use tokio::sync::broadcast::error::RecvError;

    let rx = engine.query_log.subscribe();
    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(record) => {
                    let mut line = serde_json::to_vec(&*record).unwrap_or_default();
                    line.push(b'\n');
                    return Some((Ok::<_, Infallible>(line), rx));
                }
                // A lagging reader lost some records; carry on with the
                // next live one.
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return None,
            }
        }
    });

    Response::builder()
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
        .unwrap()
}

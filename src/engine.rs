//! The resolver engine.
//!
//! One explicit value holding every shared subsystem: configuration, the
//! persistent store, the compiled snapshots (blocklist, policy, zones,
//! TSIG keys, forwarding), the answer cache, the upstream pool, rate
//! limiting, the query log and metrics.  Listeners and the admin surface
//! receive an `Arc<Engine>`; there are no ambient singletons.
//!
//! Snapshots are shared-immutable behind `ArcSwap`: rebuilds happen
//! off-path and swap atomically, so in-flight queries finish against the
//! snapshot they started with.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tracing::{debug, info};

use sinkhole_wire::RType;

use crate::blocklist::{self, Blocklist, RefreshOutcome};
use crate::cache::{Cache, CacheKey, Singleflight};
use crate::config::Config;
use crate::metrics::MetricsCollection;
use crate::policy::PolicySnapshot;
use crate::querylog::QueryLog;
use crate::ratelimit::RateLimiter;
use crate::store::{CachedResponse, Store, ZoneRecordSpec};
use crate::tsig::TsigKeyStore;
use crate::upstream::{parse_upstreams, ForwardTable, Upstream, UpstreamPool};
use crate::zone::ZoneSet;

/// Maintenance cadence: prefetch scan and housekeeping.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

//----------- Engine -----------------------------------------------------------

/// The resolver's central state.
#[derive(Debug)]
pub struct Engine {
    pub config: Config,
    pub store: Arc<Store>,

    /// Runtime-tunable settings, snapshotted from the store.
    pub settings: ArcSwap<crate::store::Settings>,

    /// The aggregated blocklist (adlist feeds plus the manual denylist).
    pub blocklist: ArcSwap<Blocklist>,
    pub policy: ArcSwap<PolicySnapshot>,
    pub zones: ArcSwap<ZoneSet>,
    pub tsig_keys: ArcSwap<TsigKeyStore>,
    pub forward_table: ArcSwap<ForwardTable>,
    pub default_upstreams: ArcSwap<Vec<Upstream>>,

    pub cache: Cache,
    pub singleflight: Singleflight,
    pub upstreams: UpstreamPool,
    pub rate_limiter: RateLimiter,
    pub query_log: QueryLog,
    pub metrics: MetricsCollection,

    pub listeners: ListenerStatus,
    pub stats: ServerStats,

    started: Instant,
    http: reqwest::Client,
}

impl Engine {
    /// Build the engine from configuration and the opened store.
    ///
    /// The blocklist starts with the manual denylist only; adlist feeds
    /// arrive with the first refresh.
    pub fn new(config: Config, store: Arc<Store>) -> Arc<Self> {
        let data = store.snapshot();

        let engine = Arc::new(Self {
            settings: ArcSwap::from_pointee(data.settings.clone()),
            blocklist: ArcSwap::from_pointee(Blocklist::from_domains(&data.denylist)),
            policy: ArcSwap::from_pointee(PolicySnapshot::build(&data)),
            zones: ArcSwap::from_pointee(ZoneSet::build(&data)),
            tsig_keys: ArcSwap::from_pointee(TsigKeyStore::build(&data)),
            forward_table: ArcSwap::from_pointee(ForwardTable::build(&data.forward_rules)),
            default_upstreams: ArcSwap::from_pointee(parse_upstreams(&data.settings.upstream_dns)),
            cache: Cache::new(data.settings.cache_max_entries),
            singleflight: Singleflight::default(),
            upstreams: UpstreamPool::new(),
            rate_limiter: RateLimiter::default(),
            query_log: QueryLog::new(),
            metrics: MetricsCollection::new(),
            listeners: ListenerStatus::default(),
            stats: ServerStats::default(),
            started: Instant::now(),
            http: reqwest::Client::new(),
            config,
            store,
        });

        engine.query_log.set_privacy_mode(data.settings.privacy_mode);
        engine.restore_cache(&data.cached_responses);
        engine
    }

    /// Current wall-clock time in unix milliseconds.
    pub fn now_ms(&self) -> i64 {
        jiff::Timestamp::now().as_millisecond()
    }

    /// Current wall-clock time in unix seconds.
    pub fn now_unix(&self) -> i64 {
        jiff::Timestamp::now().as_second()
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Rebuild every store-derived snapshot.  Called after any admin
    /// mutation of the store; cheap enough to be wholesale.
    pub fn rebuild_from_store(&self) {
        let data = self.store.snapshot();
        self.settings.store(Arc::new(data.settings.clone()));
        self.policy.store(Arc::new(PolicySnapshot::build(&data)));
        self.zones.store(Arc::new(ZoneSet::build(&data)));
        self.tsig_keys.store(Arc::new(TsigKeyStore::build(&data)));
        self.forward_table
            .store(Arc::new(ForwardTable::build(&data.forward_rules)));
        self.default_upstreams
            .store(Arc::new(parse_upstreams(&data.settings.upstream_dns)));
        self.cache.set_capacity(data.settings.cache_max_entries);
        self.query_log.set_privacy_mode(data.settings.privacy_mode);
        debug!("Rebuilt snapshots from the store");
    }

    /// Fetch all adlist feeds and swap in a fresh blocklist snapshot.
    pub async fn refresh_blocklist(self: &Arc<Self>) -> RefreshOutcome {
        let data = self.store.snapshot();
        let (snapshot, outcome) = blocklist::build_snapshot(&self.http, &data).await;
        self.blocklist.store(snapshot);
        self.metrics.adlist_refreshes.inc();
        info!(
            "Blocklist refreshed: {} domains ({} feeds ok, {} failed)",
            outcome.domains, outcome.feeds_ok, outcome.feeds_failed
        );
        outcome
    }

    /// Mutate one zone's records, bump its serial, and rebuild.
    ///
    /// Every record mutation path goes through here so the serial can
    /// never miss an increment.
    pub fn mutate_zone_records(
        &self,
        zone_domain: &str,
        f: impl FnOnce(&mut Vec<ZoneRecordSpec>),
    ) -> bool {
        let mut found = false;
        self.store.mutate(|data| {
            if let Some(zone) = data.zones.iter_mut().find(|z| z.domain == zone_domain) {
                found = true;
                zone.soa.serial = zone.soa.serial.wrapping_add(1);
                f(&mut data.zone_records);
            }
        });
        if found {
            self.rebuild_from_store();
        }
        found
    }

    /// Persist live cache entries into the store (called at shutdown).
    pub fn persist_cache(&self) {
        let now_ms = self.now_ms();
        let entries: Vec<CachedResponse> = self
            .cache
            .export(now_ms)
            .into_iter()
            .map(|(key, wire, expires_at_ms)| CachedResponse {
                name: key.name.to_string(),
                rtype: key.rtype.to_string(),
                response: BASE64.encode(wire),
                expires_at: expires_at_ms / 1000,
            })
            .collect();
        let count = entries.len();
        self.store.mutate(move |data| data.cached_responses = entries);
        self.store.save_now();
        debug!("Persisted {count} cache entries");
    }

    fn restore_cache(&self, persisted: &[CachedResponse]) {
        let now_ms = self.now_ms();
        let mut restored = 0;
        for entry in persisted {
            let Ok(rtype) = entry.rtype.parse::<RType>() else {
                continue;
            };
            let Ok(wire) = BASE64.decode(&entry.response) else {
                continue;
            };
            let key = CacheKey::new(&entry.name, rtype);
            self.cache.import(key, &wire, entry.expires_at * 1000, now_ms);
            restored += 1;
        }
        if restored > 0 {
            info!("Restored {restored} cache entries from the store");
        }
    }

    /// Spawn the periodic maintenance task: prefetch of popular names and
    /// scheduled adlist refreshes.
    pub fn spawn_maintenance(self: &Arc<Self>) {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut last_adlist_refresh = Instant::now();
            loop {
                ticker.tick().await;

                let settings = engine.settings.load();
                if settings.prefetch_enabled {
                    engine.prefetch_tick().await;
                }

                let refresh_secs = settings.adlist_refresh_secs;
                if refresh_secs > 0
                    && last_adlist_refresh.elapsed() >= Duration::from_secs(refresh_secs)
                {
                    last_adlist_refresh = Instant::now();
                    engine.refresh_blocklist().await;
                }
            }
        });
    }

    /// One prefetch pass: refresh cache entries that are near expiry and
    /// popular enough in the query log.
    ///
    /// Runs in the background task only; foreground requests are never
    /// blocked.  At-most-one-in-flight per key comes from the shared
    /// singleflight map.
    async fn prefetch_tick(self: &Arc<Self>) {
        let settings = self.settings.load();
        let now_ms = self.now_ms();

        let near = self.cache.near_expiry(settings.prefetch_threshold, now_ms);
        if near.is_empty() {
            return;
        }

        let popular = self
            .query_log
            .popular_names(settings.prefetch_min_queries, now_ms);

        for key in near {
            let is_popular = popular
                .iter()
                .any(|(name, rtype, _)| *rtype == key.rtype && name.trim_end_matches('.') == &*key.name);
            if !is_popular {
                continue;
            }
            let engine = self.clone();
            tokio::spawn(async move {
                crate::pipeline::background_refresh(&engine, key).await;
            });
        }
    }
}

//----------- ListenerStatus ---------------------------------------------------

/// Which listeners are up, for the health endpoint.
#[derive(Debug, Default)]
pub struct ListenerStatus {
    pub udp: AtomicBool,
    pub tcp: AtomicBool,
    pub dot: AtomicBool,
    pub doh: AtomicBool,
}

//----------- ServerStats ------------------------------------------------------

/// Rolling counters for the health endpoint (qps and error rate over the
/// last minute).
#[derive(Debug, Default)]
pub struct ServerStats {
    pub total_queries: AtomicU64,
    pub total_errors: AtomicU64,
    window: Mutex<RollingWindow>,
}

#[derive(Debug)]
struct RollingWindow {
    queries: [u32; 60],
    errors: [u32; 60],
    last_sec: i64,
}

impl Default for RollingWindow {
    fn default() -> Self {
        RollingWindow {
            queries: [0; 60],
            errors: [0; 60],
            last_sec: 0,
        }
    }
}

impl ServerStats {
    /// Record one completed query; `error` marks SERVFAIL-class outcomes.
    pub fn record(&self, error: bool, now_unix: i64) {
        self.total_queries.fetch_add(1, Ordering::Relaxed);
        if error {
            self.total_errors.fetch_add(1, Ordering::Relaxed);
        }

        let mut window = self.window.lock().unwrap();
        window.roll(now_unix);
        let slot = (now_unix % 60) as usize;
        window.queries[slot] += 1;
        if error {
            window.errors[slot] += 1;
        }
    }

    /// (queries per second, error rate) over the trailing minute.
    pub fn rates(&self, now_unix: i64) -> (f64, f64) {
        let mut window = self.window.lock().unwrap();
        window.roll(now_unix);
        let queries: u64 = window.queries.iter().map(|&q| q as u64).sum();
        let errors: u64 = window.errors.iter().map(|&e| e as u64).sum();
        let qps = queries as f64 / 60.0;
        let error_rate = if queries == 0 {
            0.0
        } else {
            errors as f64 / queries as f64
        };
        (qps, error_rate)
    }
}

impl RollingWindow {
    fn roll(&mut self, now_unix: i64) {
        if self.last_sec == 0 {
            self.last_sec = now_unix;
            return;
        }
        let gap = (now_unix - self.last_sec).clamp(0, 60);
        for i in 1..=gap {
            let slot = ((self.last_sec + i) % 60) as usize;
            self.queries[slot] = 0;
            self.errors[slot] = 0;
        }
        self.last_sec = self.last_sec.max(now_unix);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreData;

    fn test_engine() -> Arc<Engine> {
        let mut data = StoreData::default();
        data.denylist.push("doubleclick.net".into());
        Engine::new(Config::default(), Store::in_memory(data))
    }

    #[test]
    fn snapshots_build_at_startup() {
        let engine = test_engine();
        assert_eq!(engine.blocklist.load().len(), 1);
        assert_eq!(engine.default_upstreams.load().len(), 2);
    }

    #[test]
    fn store_mutations_rebuild_snapshots() {
        let engine = test_engine();
        engine
            .store
            .mutate(|data| data.denylist.push("tracker.example".into()));
        // The blocklist snapshot is feed-derived; policy and settings come
        // from rebuild_from_store.
        engine
            .store
            .mutate(|data| data.settings.blocking_enabled = false);
        engine.rebuild_from_store();
        assert!(!engine.settings.load().blocking_enabled);
    }

    #[test]
    fn zone_record_mutation_bumps_serial() {
        let mut data = StoreData::default();
        data.zones.push(crate::store::ZoneSpec {
            domain: "home.lan".into(),
            enabled: true,
            soa: crate::store::SoaSpec {
                mname: "ns.home.lan".into(),
                rname: "admin.home.lan".into(),
                serial: 1,
                refresh: 7200,
                retry: 3600,
                expire: 1_209_600,
                minimum: 300,
                ttl: 3600,
            },
        });
        let engine = Engine::new(Config::default(), Store::in_memory(data));

        let changed = engine.mutate_zone_records("home.lan", |records| {
            records.push(ZoneRecordSpec {
                zone: "home.lan".into(),
                name: "pi".into(),
                rtype: "A".into(),
                value: "192.168.1.10".into(),
                ttl: 3600,
            });
        });
        assert!(changed);
        assert_eq!(engine.store.with(|d| d.zones[0].soa.serial), 2);
        assert!(!engine.mutate_zone_records("nosuch.zone", |_| {}));
    }

    #[test]
    fn rolling_stats_cover_the_last_minute() {
        let stats = ServerStats::default();
        for i in 0..30 {
            stats.record(i % 10 == 0, 1000 + i);
        }
        let (qps, error_rate) = stats.rates(1030);
        assert!(qps > 0.0);
        assert!((error_rate - 0.1).abs() < 0.05);

        // Two minutes later the window is empty.
        let (qps, _) = stats.rates(1030 + 120);
        assert_eq!(qps, 0.0);
    }
}

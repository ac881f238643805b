//! Maintaining and outputting metrics.
//!
//! Relevant sources for selecting metrics, metric names, and labels:
//! - https://prometheus.io/docs/practices/naming/
//! - https://prometheus.io/docs/practices/instrumentation/

use std::fmt;
use std::sync::Arc;

use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

use crate::engine::Engine;

/// The application prefix to use in the names of Prometheus metrics.
const PROMETHEUS_PREFIX: &str = "sinkhole";

//------------ QueryOutcome --------------------------------------------------

/// How a query was answered, as a metric label.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum QueryOutcome {
    Forwarded,
    Cached,
    Blocked,
    Local,
    Refused,
    Error,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct QueryLabels {
    pub outcome: QueryOutcome,
}

//------------ MetricsCollection ---------------------------------------------

/// The metrics registry and the live counters the hot path touches.
#[derive(Debug)]
pub struct MetricsCollection {
    registry: Registry,

    pub queries: Family<QueryLabels, Counter>,
    pub rate_limited: Counter,
    pub upstream_failures: Counter,
    pub adlist_refreshes: Counter,

    /// Gauges rebuilt from state on each scrape.
    cache_size: Gauge,
    blocklist_size: Gauge,
    zones_configured: Gauge,
}

impl MetricsCollection {
    pub fn new() -> Self {
        let mut col = Self {
            registry: Registry::with_prefix(PROMETHEUS_PREFIX),
            queries: Default::default(),
            rate_limited: Default::default(),
            upstream_failures: Default::default(),
            adlist_refreshes: Default::default(),
            cache_size: Default::default(),
            blocklist_size: Default::default(),
            zones_configured: Default::default(),
        };

        col.registry.register(
            "queries",
            "Completed queries by outcome",
            col.queries.clone(),
        );
        col.registry.register(
            "rate_limited_queries",
            "Queries refused by the rate limiter",
            col.rate_limited.clone(),
        );
        col.registry.register(
            "upstream_failures",
            "Failed upstream exchanges",
            col.upstream_failures.clone(),
        );
        col.registry.register(
            "adlist_refreshes",
            "Completed adlist refresh runs",
            col.adlist_refreshes.clone(),
        );
        col.registry.register(
            "cache_entries",
            "Entries currently in the answer cache",
            col.cache_size.clone(),
        );
        col.registry.register(
            "blocklist_domains",
            "Domains in the active blocklist snapshot",
            col.blocklist_size.clone(),
        );
        col.registry.register(
            "zones_configured",
            "Authoritative zones configured",
            col.zones_configured.clone(),
        );

        col
    }

    /// Record one completed query.
    pub fn count_query(&self, outcome: QueryOutcome) {
        self.queries.get_or_create(&QueryLabels { outcome }).inc();
    }

    /// Turn metrics into a [`String`], refreshing the state gauges first.
    pub fn assemble(&self, engine: &Arc<Engine>) -> Result<String, fmt::Error> {
        self.cache_size.set(engine.cache.len() as i64);
        self.blocklist_size
            .set(engine.blocklist.load().len() as i64);
        self.zones_configured.set(engine.zones.load().len() as i64);

        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}

impl Default for MetricsCollection {
    fn default() -> Self {
        Self::new()
    }
}

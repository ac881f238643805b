//! The persistent store.
//!
//! The engine works from in-memory snapshots (blocklist, policy, zones,
//! TSIG keys) that are rebuilt from this store whenever it changes.  The
//! store itself is one TOML document saved with an atomic
//! write-to-tempfile-and-rename, debounced so a burst of admin mutations
//! causes a single write.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

//----------- Settings ---------------------------------------------------------

/// Runtime-tunable settings.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Comma-separated upstream list, e.g.
    /// `"1.1.1.1, tls://9.9.9.9, https://dns.google/dns-query"`.
    pub upstream_dns: String,

    /// Suppress client addresses in the query log.
    pub privacy_mode: bool,

    pub rate_limit_enabled: bool,
    /// Maximum queries per client per window.
    pub rate_limit_max: u32,
    pub rate_limit_window_ms: u64,

    pub cache_enabled: bool,
    pub cache_max_entries: usize,
    pub serve_stale_enabled: bool,
    pub serve_stale_max_age_secs: u64,
    pub prefetch_enabled: bool,
    /// Fraction of the TTL that must have elapsed before prefetch kicks in.
    pub prefetch_threshold: f64,
    /// Minimum queries in the last 24 h for a name to qualify.
    pub prefetch_min_queries: u64,

    pub blocking_enabled: bool,
    /// Unix seconds until which blocking is suspended, if set.
    pub blocking_disabled_until: Option<i64>,
    pub block_page_enabled: bool,
    pub block_page_ipv4: Ipv4Addr,
    pub block_page_ipv6: Ipv6Addr,

    /// Copy the DO bit through and request validation upstream.
    pub dnssec_validation: bool,

    pub query_retention_days: u32,

    /// Seconds between automatic adlist refreshes; 0 disables.
    pub adlist_refresh_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            upstream_dns: "1.1.1.1, 1.0.0.1".into(),
            privacy_mode: false,
            rate_limit_enabled: true,
            rate_limit_max: 1000,
            rate_limit_window_ms: 60_000,
            cache_enabled: true,
            cache_max_entries: 10_000,
            serve_stale_enabled: true,
            serve_stale_max_age_secs: 86_400,
            prefetch_enabled: true,
            prefetch_threshold: 0.9,
            prefetch_min_queries: 10,
            blocking_enabled: true,
            blocking_disabled_until: None,
            block_page_enabled: false,
            block_page_ipv4: Ipv4Addr::UNSPECIFIED,
            block_page_ipv6: Ipv6Addr::UNSPECIFIED,
            dnssec_validation: false,
            query_retention_days: 30,
            adlist_refresh_secs: 86_400,
        }
    }
}

//----------- List entities ----------------------------------------------------

/// A subscribed blocklist feed.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Adlist {
    pub url: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub comment: String,
}

/// A regex filter rule.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RegexFilter {
    pub pattern: String,
    pub action: RuleAction,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Whether a rule allows or blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Allow,
    Block,
}

/// A local DNS record outside any authoritative zone ("local DNS").
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LocalRecord {
    pub name: String,
    pub rtype: String,
    pub value: String,
    #[serde(default = "default_local_ttl")]
    pub ttl: u32,
}

/// A conditional-forwarding rule.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ForwardRule {
    /// Queries for this suffix go to `upstream`.
    pub domain: String,
    pub upstream: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Breaks ties between equally specific rules; higher wins.
    #[serde(default)]
    pub priority: i32,
}

/// A client group.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Group {
    pub id: u32,
    pub name: String,
    #[serde(default = "default_true")]
    pub blocking_enabled: bool,
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub block: Vec<String>,
}

/// Per-client configuration, keyed by source address.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Client {
    pub ip: IpAddr,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub groups: Vec<u32>,
    #[serde(default = "default_true")]
    pub blocking_enabled: bool,
    /// Overrides the global upstream list when set.
    #[serde(default)]
    pub upstream_dns: Option<String>,
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub block: Vec<String>,
}

/// An authoritative zone.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ZoneSpec {
    pub domain: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub soa: SoaSpec,
}

/// SOA fields for a zone.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SoaSpec {
    pub mname: String,
    pub rname: String,
    pub serial: u32,
    #[serde(default = "default_refresh")]
    pub refresh: u32,
    #[serde(default = "default_retry")]
    pub retry: u32,
    #[serde(default = "default_expire")]
    pub expire: u32,
    #[serde(default = "default_minimum")]
    pub minimum: u32,
    #[serde(default = "default_soa_ttl")]
    pub ttl: u32,
}

/// A record belonging to a zone.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ZoneRecordSpec {
    /// The owning zone's domain.
    pub zone: String,
    /// Owner name relative to the zone; `@` for the apex.
    pub name: String,
    pub rtype: String,
    pub value: String,
    #[serde(default = "default_local_ttl")]
    pub ttl: u32,
}

/// A DNSSEC key for a zone.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ZoneKeySpec {
    pub zone: String,
    /// 256 = ZSK, 257 = KSK.
    pub flags: u16,
    /// DNSSEC algorithm number (13 = Ed25519, 8 = RSA-SHA256).
    pub algorithm: u8,
    /// PKCS#8 private key, base64.
    pub private_key: String,
    /// Public key in DNSKEY rdata form, base64.
    pub public_key: String,
    pub key_tag: u16,
    #[serde(default = "default_true")]
    pub active: bool,
}

/// A TSIG key.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TsigKeySpec {
    pub name: String,
    /// `hmac-md5`, `hmac-sha1`, `hmac-sha256` or `hmac-sha512`.
    pub algorithm: String,
    /// Shared secret, base64.
    pub secret: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// A cache entry persisted across restarts.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CachedResponse {
    pub name: String,
    pub rtype: String,
    /// The full wire response template, base64.
    pub response: String,
    /// Unix seconds at which the entry expires.
    pub expires_at: i64,
}

fn default_true() -> bool {
    true
}
fn default_local_ttl() -> u32 {
    3600
}
fn default_refresh() -> u32 {
    7200
}
fn default_retry() -> u32 {
    3600
}
fn default_expire() -> u32 {
    1_209_600
}
fn default_minimum() -> u32 {
    300
}
fn default_soa_ttl() -> u32 {
    3600
}

//----------- StoreData --------------------------------------------------------

/// Everything the store persists.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreData {
    pub settings: Settings,
    pub adlists: Vec<Adlist>,
    /// Globally allowed domains.
    pub allowlist: Vec<String>,
    /// Manually blocked domains, merged with the adlist feeds.
    pub denylist: Vec<String>,
    pub regex_filters: Vec<RegexFilter>,
    pub local_records: Vec<LocalRecord>,
    pub forward_rules: Vec<ForwardRule>,
    pub groups: Vec<Group>,
    pub clients: Vec<Client>,
    pub zones: Vec<ZoneSpec>,
    pub zone_records: Vec<ZoneRecordSpec>,
    pub zone_keys: Vec<ZoneKeySpec>,
    pub tsig_keys: Vec<TsigKeySpec>,
    pub cached_responses: Vec<CachedResponse>,
}

//----------- Store ------------------------------------------------------------

/// The persistent store.
///
/// In-memory when no path is configured (tests, ephemeral runs).
#[derive(Debug)]
pub struct Store {
    path: Option<Utf8PathBuf>,
    data: Mutex<StoreData>,
    enqueued_save: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Store {
    /// An in-memory store seeded with `data`.
    pub fn in_memory(data: StoreData) -> Arc<Self> {
        Arc::new(Self {
            path: None,
            data: Mutex::new(data),
            enqueued_save: Mutex::new(None),
        })
    }

    /// Open the store at `path`, creating it on first use.
    pub fn open(path: Utf8PathBuf) -> std::io::Result<Arc<Self>> {
        let data = match std::fs::read_to_string(path.as_std_path()) {
            Ok(text) => toml::from_str(&text).map_err(|e| {
                std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreData::default(),
            Err(e) => return Err(e),
        };
        Ok(Arc::new(Self {
            path: Some(path),
            data: Mutex::new(data),
            enqueued_save: Mutex::new(None),
        }))
    }

    /// A snapshot of the current data.
    pub fn snapshot(&self) -> StoreData {
        self.data.lock().unwrap().clone()
    }

    /// Read a value out of the store without cloning everything.
    pub fn with<R>(&self, f: impl FnOnce(&StoreData) -> R) -> R {
        f(&self.data.lock().unwrap())
    }

    /// Apply a mutation and enqueue a debounced save.
    pub fn mutate(self: &Arc<Self>, f: impl FnOnce(&mut StoreData)) {
        f(&mut self.data.lock().unwrap());
        self.mark_dirty();
    }

    /// Enqueue a persistence operation for the near future, unless one is
    /// already pending.
    fn mark_dirty(self: &Arc<Self>) {
        if self.path.is_none() {
            return;
        }
        let mut enqueued = self.enqueued_save.lock().unwrap();
        if enqueued.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        let store = self.clone();
        *enqueued = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            store.save_now();
        }));
    }

    /// Persist the current data synchronously.
    pub fn save_now(&self) {
        let Some(path) = &self.path else { return };
        let text = {
            let data = self.data.lock().unwrap();
            match toml::to_string_pretty(&*data) {
                Ok(text) => text,
                Err(e) => {
                    error!("Could not serialize the store: {e}");
                    return;
                }
            }
        };

        match write_atomically(path, text.as_bytes()) {
            Ok(()) => debug!("Saved the store (to '{path}')"),
            Err(e) => error!("Could not save the store to '{path}': {e}"),
        }
    }
}

/// Write via a temporary file in the same directory, then rename over the
/// target, so readers never observe a half-written store.
fn write_atomically(path: &Utf8PathBuf, bytes: &[u8]) -> std::io::Result<()> {
    use std::io::Write;

    let dir = path
        .parent()
        .map(|p| p.as_std_path().to_owned())
        .unwrap_or_else(|| ".".into());
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.persist(path.as_std_path()).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_round_trips_through_toml() {
        let mut data = StoreData::default();
        data.denylist.push("doubleclick.net".into());
        data.zones.push(ZoneSpec {
            domain: "home.lan".into(),
            enabled: true,
            soa: SoaSpec {
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

        let text = toml::to_string_pretty(&data).unwrap();
        let back: StoreData = toml::from_str(&text).unwrap();
        assert_eq!(back.denylist, data.denylist);
        assert_eq!(back.zones[0].domain, "home.lan");
        assert_eq!(back.settings.cache_max_entries, 10_000);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let data: StoreData = toml::from_str(
            r#"
            [settings]
            blocking_enabled = false
            "#,
        )
        .unwrap();
        assert!(!data.settings.blocking_enabled);
        assert!(data.settings.cache_enabled);
    }
}

//! The answer cache.
//!
//! Keyed by (lower-cased name, qtype).  Entries store the full decoded
//! response as a template; hits rewrite TTLs by the elapsed age before
//! returning.  Negative responses (NXDOMAIN, NODATA) live in the same
//! structure with their lifetime taken from the SOA minimum.  Expired
//! entries can be served stale while upstreams are down.
//!
//! The table sits behind a plain mutex and is only touched synchronously;
//! no lock is ever held across I/O.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use lru::LruCache;
use serde::Serialize;
use tokio::sync::broadcast;

use sinkhole_wire::{Message, RData, RType, Rcode, Record};

/// Positive TTL clamp, in seconds.
const MIN_TTL_SECS: u32 = 60;
const MAX_TTL_SECS: u32 = 7 * 24 * 3600;

/// Negative TTL clamp (SOA minimum), in seconds.
const NEG_MIN_TTL_SECS: u32 = 60;
const NEG_MAX_TTL_SECS: u32 = 3600;

//----------- CacheKey ---------------------------------------------------------

/// The cache key: lower-cased name without trailing dot, plus qtype.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub name: Box<str>,
    pub rtype: RType,
}

impl CacheKey {
    pub fn new(name: &str, rtype: RType) -> Self {
        Self {
            name: name
                .trim_end_matches('.')
                .to_ascii_lowercase()
                .into_boxed_str(),
            rtype,
        }
    }
}

//----------- CacheEntry -------------------------------------------------------

#[derive(Clone, Debug)]
struct CacheEntry {
    /// The response template with its original TTLs.
    response: Message,
    inserted_at_ms: i64,
    expires_at_ms: i64,
    negative: bool,
}

//----------- Lookup -----------------------------------------------------------

/// The outcome of a cache lookup.
#[derive(Clone, Debug)]
pub enum Lookup {
    /// A fresh entry; TTLs already rewritten to the remaining lifetime.
    Hit { response: Message, remaining: u32 },

    /// An expired entry within the serve-stale window; TTLs are zero.
    Stale { response: Message, age_secs: u64 },

    Miss,
}

//----------- CacheStats -------------------------------------------------------

/// Counters exposed on the admin surface.
#[derive(Clone, Copy, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub stale_served: u64,
    pub hit_rate: f64,
}

//----------- Cache ------------------------------------------------------------

/// The in-memory answer cache.
pub struct Cache {
    entries: Mutex<LruCache<CacheKey, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    stale_served: AtomicU64,
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("size", &self.len())
            .finish_non_exhaustive()
    }
}

impl Cache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(cap(max_entries))),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stale_served: AtomicU64::new(0),
        }
    }

    /// Change the capacity, evicting LRU entries if shrinking.
    pub fn set_capacity(&self, max_entries: usize) {
        self.entries.lock().unwrap().resize(cap(max_entries));
    }

    /// Look up a response.
    ///
    /// `serve_stale` carries the serve-stale switch and maximum age; stale
    /// entries past the maximum age are dropped.
    pub fn lookup(
        &self,
        key: &CacheKey,
        now_ms: i64,
        serve_stale: Option<u64>,
    ) -> Lookup {
        let mut entries = self.entries.lock().unwrap();
        let Some(entry) = entries.get(key) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Lookup::Miss;
        };

        if now_ms < entry.expires_at_ms {
            let elapsed = ((now_ms - entry.inserted_at_ms) / 1000).max(0) as u32;
            let remaining = ((entry.expires_at_ms - now_ms) / 1000) as u32;
            let response = response_with_age(&entry.response, elapsed);
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Lookup::Hit {
                response,
                remaining,
            };
        }

        let age_secs = ((now_ms - entry.expires_at_ms) / 1000).max(0) as u64;
        match serve_stale {
            Some(max_age) if age_secs <= max_age => {
                let response = response_with_age(&entry.response, u32::MAX);
                self.stale_served.fetch_add(1, Ordering::Relaxed);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Lookup::Stale { response, age_secs }
            }
            _ => {
                entries.pop(key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                Lookup::Miss
            }
        }
    }

    /// Insert a response.
    ///
    /// The entry's lifetime is the minimum TTL in the response, or for
    /// negatives the SOA minimum from the authority section; both are
    /// clamped.  Responses with neither records nor an SOA are not worth
    /// caching and are ignored.
    pub fn insert(&self, key: CacheKey, response: Message, now_ms: i64) {
        let negative = is_negative(&response);
        let ttl_secs = if negative {
            match soa_minimum(&response) {
                Some(minimum) => minimum.clamp(NEG_MIN_TTL_SECS, NEG_MAX_TTL_SECS),
                None => return,
            }
        } else {
            match min_record_ttl(&response) {
                Some(ttl) => ttl.clamp(MIN_TTL_SECS, MAX_TTL_SECS),
                None => return,
            }
        };

        let entry = CacheEntry {
            response,
            inserted_at_ms: now_ms,
            expires_at_ms: now_ms + ttl_secs as i64 * 1000,
            negative,
        };
        self.entries.lock().unwrap().put(key, entry);
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            size: self.len(),
            hits,
            misses,
            stale_served: self.stale_served.load(Ordering::Relaxed),
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
        }
    }

    /// Keys whose entries have consumed at least `threshold` of their
    /// lifetime; prefetch candidates.
    pub fn near_expiry(&self, threshold: f64, now_ms: i64) -> Vec<CacheKey> {
        let entries = self.entries.lock().unwrap();
        entries
            .iter()
            .filter(|(_, e)| {
                !e.negative && {
                    let lifetime = (e.expires_at_ms - e.inserted_at_ms).max(1) as f64;
                    let used = (now_ms - e.inserted_at_ms) as f64;
                    used / lifetime >= threshold
                }
            })
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Export live entries for cross-restart persistence.
    pub fn export(&self, now_ms: i64) -> Vec<(CacheKey, Vec<u8>, i64)> {
        let entries = self.entries.lock().unwrap();
        entries
            .iter()
            .filter(|(_, e)| now_ms < e.expires_at_ms)
            .map(|(k, e)| (k.clone(), e.response.encode(), e.expires_at_ms))
            .collect()
    }

    /// Re-import a persisted entry; expired ones are dropped by `insert`'s
    /// caller checking `expires_at_ms` first.
    pub fn import(&self, key: CacheKey, wire: &[u8], expires_at_ms: i64, now_ms: i64) {
        if expires_at_ms <= now_ms {
            return;
        }
        let Ok(response) = Message::decode(wire) else {
            return;
        };
        let entry = CacheEntry {
            negative: is_negative(&response),
            response,
            inserted_at_ms: now_ms,
            expires_at_ms,
        };
        self.entries.lock().unwrap().put(key, entry);
    }
}

fn cap(max_entries: usize) -> NonZeroUsize {
    NonZeroUsize::new(max_entries.max(1)).unwrap()
}

fn is_negative(response: &Message) -> bool {
    response.header.rcode == Rcode::NxDomain
        || (response.header.rcode == Rcode::NoError && response.answers.is_empty())
}

fn min_record_ttl(response: &Message) -> Option<u32> {
    response
        .answers
        .iter()
        .chain(&response.authorities)
        .chain(&response.additionals)
        .filter(|r| r.rtype() != RType::Opt)
        .map(|r| r.ttl)
        .min()
}

fn soa_minimum(response: &Message) -> Option<u32> {
    response.authorities.iter().find_map(|r| match &r.data {
        RData::Soa { minimum, .. } => Some((*minimum).min(r.ttl)),
        _ => None,
    })
}

/// A copy of `response` with every record TTL reduced by `elapsed`
/// seconds, floored at zero.  OPT pseudo-records are left alone.
fn response_with_age(response: &Message, elapsed: u32) -> Message {
    let mut out = response.clone();
    let age = |r: &mut Record| {
        if r.rtype() != RType::Opt {
            r.ttl = r.ttl.saturating_sub(elapsed);
        }
    };
    out.answers.iter_mut().for_each(age);
    out.authorities.iter_mut().for_each(age);
    out.additionals.iter_mut().for_each(age);
    out
}

//----------- Singleflight -----------------------------------------------------

/// At most one upstream refresh in flight per cache key.
///
/// The first caller becomes the leader and must call
/// [`Singleflight::complete`] exactly once; followers wait on a broadcast
/// of the leader's outcome.  A follower that sees the channel close
/// without a result (leader died) falls back to resolving itself.
#[derive(Debug, Default)]
pub struct Singleflight {
    inflight: Mutex<foldhash::HashMap<CacheKey, broadcast::Sender<Arc<Option<Message>>>>>,
}

/// A caller's role for one key.
pub enum Flight {
    Leader,
    Follower(broadcast::Receiver<Arc<Option<Message>>>),
}

impl Singleflight {
    pub fn join(&self, key: &CacheKey) -> Flight {
        let mut inflight = self.inflight.lock().unwrap();
        if let Some(tx) = inflight.get(key) {
            return Flight::Follower(tx.subscribe());
        }
        let (tx, _) = broadcast::channel(1);
        inflight.insert(key.clone(), tx);
        Flight::Leader
    }

    pub fn complete(&self, key: &CacheKey, result: Arc<Option<Message>>) {
        let tx = self.inflight.lock().unwrap().remove(key);
        if let Some(tx) = tx {
            let _ = tx.send(result);
        }
    }
}

//! The query log.
//!
//! One record per completed query.  Records are kept in a bounded ring for
//! the admin surface, fanned out to in-process subscribers, and folded
//! into hourly per-name counters that drive cache prefetch.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::broadcast;

use sinkhole_wire::RType;

/// How many records the in-memory ring retains.
const RING_CAPACITY: usize = 10_000;

/// Fan-out buffer per subscriber; slow subscribers lose records rather
/// than stalling resolution.
const SUBSCRIBER_BUFFER: usize = 1024;

//----------- QueryRecord ------------------------------------------------------

/// A completed query.
#[derive(Clone, Debug, Serialize)]
pub struct QueryRecord {
    pub id: u64,
    /// Unix milliseconds.
    pub timestamp: i64,
    pub client_ip: String,
    pub name: String,
    #[serde(rename = "type")]
    pub qtype: String,
    pub blocked: bool,
    pub cached: bool,
    pub rcode: String,
    pub response_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_reason: Option<String>,
}

//----------- QueryLog ---------------------------------------------------------

/// The query log writer and fan-out point.
#[derive(Debug)]
pub struct QueryLog {
    seq: AtomicU64,
    ring: Mutex<VecDeque<Arc<QueryRecord>>>,
    counters: Mutex<foldhash::HashMap<(Box<str>, RType), HourlyCounter>>,
    subscribers: broadcast::Sender<Arc<QueryRecord>>,
    /// Client addresses are replaced by a placeholder when set.
    privacy_mode: std::sync::atomic::AtomicBool,
}

impl QueryLog {
    pub fn new() -> Self {
        let (subscribers, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        Self {
            seq: AtomicU64::new(1),
            ring: Mutex::new(VecDeque::with_capacity(RING_CAPACITY)),
            counters: Mutex::new(Default::default()),
            subscribers,
            privacy_mode: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn set_privacy_mode(&self, on: bool) {
        self.privacy_mode.store(on, Ordering::Relaxed);
    }

    /// Record a completed query.
    ///
    /// Synchronous and lock-bounded: the resolution path calls this after
    /// the response has been sent.
    pub fn record(
        &self,
        client: IpAddr,
        name: &str,
        qtype: RType,
        blocked: bool,
        cached: bool,
        rcode: sinkhole_wire::Rcode,
        response_time_ms: u64,
        block_reason: Option<String>,
        now_ms: i64,
    ) -> Arc<QueryRecord> {
        let client_ip = if self.privacy_mode.load(Ordering::Relaxed) {
            "hidden".into()
        } else {
            client.to_string()
        };
        let record = Arc::new(QueryRecord {
            id: self.seq.fetch_add(1, Ordering::Relaxed),
            timestamp: now_ms,
            client_ip,
            name: name.into(),
            qtype: qtype.to_string(),
            blocked,
            cached,
            rcode: rcode.to_string(),
            response_time_ms,
            block_reason,
        });

        {
            let mut ring = self.ring.lock().unwrap();
            if ring.len() == RING_CAPACITY {
                // Back-pressure favours live resolution: drop the oldest.
                ring.pop_front();
            }
            ring.push_back(record.clone());
        }

        {
            let hour = record.timestamp / 3_600_000;
            let mut counters = self.counters.lock().unwrap();
            counters
                .entry((record.name.clone().into_boxed_str(), qtype))
                .or_default()
                .bump(hour);
        }

        // Nobody listening is fine.
        let _ = self.subscribers.send(record.clone());

        record
    }

    /// Subscribe to the live record stream.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<QueryRecord>> {
        self.subscribers.subscribe()
    }

    /// The most recent records, newest last.
    pub fn recent(&self, limit: usize) -> Vec<Arc<QueryRecord>> {
        let ring = self.ring.lock().unwrap();
        let skip = ring.len().saturating_sub(limit);
        ring.iter().skip(skip).cloned().collect()
    }

    /// Names with at least `min_queries` lookups in the last 24 hours,
    /// most popular first.  Feeds cache prefetch.
    pub fn popular_names(&self, min_queries: u64, now_ms: i64) -> Vec<(String, RType, u64)> {
        let hour = now_ms / 3_600_000;
        let mut counters = self.counters.lock().unwrap();
        counters.retain(|_, c| hour - c.last_hour < 24);

        let mut out: Vec<(String, RType, u64)> = counters
            .iter()
            .filter_map(|((name, qtype), c)| {
                let total = c.total(hour);
                (total >= min_queries).then(|| (name.to_string(), *qtype, total))
            })
            .collect();
        out.sort_by(|a, b| b.2.cmp(&a.2));
        out
    }
}

impl Default for QueryLog {
    fn default() -> Self {
        Self::new()
    }
}

//----------- HourlyCounter ----------------------------------------------------

/// A rolling 24-hour counter, bucketed by hour.
#[derive(Clone, Debug, Default)]
struct HourlyCounter {
    buckets: [u32; 24],
    last_hour: i64,
}

impl HourlyCounter {
    fn bump(&mut self, hour: i64) {
        self.advance(hour);
        self.buckets[(hour % 24) as usize] += 1;
    }

    fn total(&self, hour: i64) -> u64 {
        if hour - self.last_hour >= 24 {
            return 0;
        }
        self.buckets.iter().map(|&b| b as u64).sum()
    }

    /// Zero every bucket that has rolled out of the window.
    fn advance(&mut self, hour: i64) {
        if self.last_hour == 0 {
            self.last_hour = hour;
            return;
        }
        let gap = (hour - self.last_hour).clamp(0, 24);
        for i in 1..=gap {
            self.buckets[((self.last_hour + i) % 24) as usize] = 0;
        }
        self.last_hour = self.last_hour.max(hour);
    }
}

//! Per-client rate limiting.
//!
//! A sliding window approximated by two adjacent counting buckets, O(1)
//! per query.  A client that trips the limit is sidelined for the rest of
//! its window; the admin surface can clear the sidelining early.

use std::net::IpAddr;
use std::sync::Mutex;

use tracing::info;

//----------- RateLimiter ------------------------------------------------------

#[derive(Debug, Default)]
pub struct RateLimiter {
    clients: Mutex<foldhash::HashMap<IpAddr, ClientWindow>>,
}

#[derive(Clone, Copy, Debug, Default)]
struct ClientWindow {
    /// Start of the current bucket, unix ms.
    bucket_start_ms: i64,
    current: u32,
    previous: u32,
    sidelined_until_ms: i64,
}

impl RateLimiter {
    /// Account one query; returns false when the client is over its
    /// budget and must be refused.
    pub fn check(&self, client: IpAddr, now_ms: i64, max: u32, window_ms: u64) -> bool {
        let window_ms = window_ms.max(1) as i64;
        let mut clients = self.clients.lock().unwrap();

        // Opportunistic cleanup keeps the map from growing without bound.
        if clients.len() > 100_000 {
            clients.retain(|_, w| now_ms - w.bucket_start_ms < 2 * window_ms);
        }

        let window = clients.entry(client).or_default();

        if now_ms < window.sidelined_until_ms {
            return false;
        }

        let elapsed = now_ms - window.bucket_start_ms;
        if elapsed >= 2 * window_ms {
            *window = ClientWindow {
                bucket_start_ms: now_ms,
                ..Default::default()
            };
        } else if elapsed >= window_ms {
            window.previous = window.current;
            window.current = 0;
            window.bucket_start_ms += window_ms;
        }

        window.current += 1;

        // Weight the previous bucket by how much of it still overlaps the
        // sliding window.
        let frac = (now_ms - window.bucket_start_ms) as f64 / window_ms as f64;
        let weighted = window.previous as f64 * (1.0 - frac) + window.current as f64;

        if weighted > max as f64 {
            window.sidelined_until_ms = window.bucket_start_ms + window_ms;
            info!("Rate limit tripped for {client}; sidelined for the rest of the window");
            return false;
        }
        true
    }

    /// Whether a client is currently sidelined.
    pub fn is_sidelined(&self, client: IpAddr, now_ms: i64) -> bool {
        self.clients
            .lock()
            .unwrap()
            .get(&client)
            .is_some_and(|w| now_ms < w.sidelined_until_ms)
    }

    /// Forget a client's state, clearing any sidelining.
    pub fn clear(&self, client: IpAddr) {
        self.clients.lock().unwrap().remove(&client);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip() -> IpAddr {
        "10.1.2.3".parse().unwrap()
    }

    #[test]
    fn under_budget_clients_pass() {
        let rl = RateLimiter::default();
        for i in 0..10 {
            assert!(rl.check(ip(), i * 100, 100, 60_000));
        }
    }

    #[test]
    fn tripping_the_limit_sidelines_for_the_window() {
        let rl = RateLimiter::default();
        let mut refused_at = None;
        for i in 0..20 {
            if !rl.check(ip(), i, 10, 60_000) {
                refused_at = Some(i);
                break;
            }
        }
        let refused_at = refused_at.expect("limit should trip");
        assert_eq!(refused_at, 10);

        // Still sidelined mid-window, even though the counter would allow.
        assert!(!rl.check(ip(), 30_000, 10, 60_000));
        assert!(rl.is_sidelined(ip(), 30_000));

        // A fresh window readmits the client.
        assert!(rl.check(ip(), 130_000, 10, 60_000));
    }

    #[test]
    fn clear_readmits_immediately() {
        let rl = RateLimiter::default();
        for i in 0..=10 {
            rl.check(ip(), i, 10, 60_000);
        }
        assert!(rl.is_sidelined(ip(), 100));
        rl.clear(ip());
        assert!(rl.check(ip(), 101, 10, 60_000));
    }

    #[test]
    fn previous_window_weighs_into_the_budget() {
        let rl = RateLimiter::default();
        // Fill most of the first window.
        for i in 0..9 {
            assert!(rl.check(ip(), i, 10, 1_000));
        }
        // Just into the next bucket the previous one still counts almost
        // fully, so two more queries trip the limit.
        assert!(rl.check(ip(), 1_010, 10, 1_000));
        assert!(!rl.check(ip(), 1_020, 10, 1_000));
    }
}

//! The upstream pool.
//!
//! Parses the configured upstream list, classifies entries by scheme,
//! tracks per-endpoint health (consecutive failures, cooldown, EWMA
//! latency) and carries the per-protocol transports: plain UDP with TCP
//! fallback, plain TCP, DoT and DoH.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use sinkhole_wire::Name;

use crate::store::ForwardRule;

/// Failures before an endpoint enters cooldown.
const COOLDOWN_THRESHOLD: u32 = 3;
/// Cooldown cap, seconds.
const COOLDOWN_MAX_SECS: u64 = 300;
/// EWMA smoothing factor for latency.
const EWMA_ALPHA: f64 = 0.2;
/// Per-attempt cap; the request deadline still applies overall.
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(2);

//----------- Upstream ---------------------------------------------------------

/// One configured upstream endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Upstream {
    /// The entry as configured; doubles as the health-table key.
    pub spec: Box<str>,
    pub transport: Transport,
}

/// How to reach an upstream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Transport {
    /// Plain DNS over UDP, falling back to TCP on truncation.
    Udp { host: String, port: u16 },
    /// Plain DNS over TCP.
    Tcp { host: String, port: u16 },
    /// DNS over TLS (default port 853).
    Tls { host: String, port: u16 },
    /// DNS over HTTPS (POST, `application/dns-message`).
    Https { url: url::Url },
}

/// Parse a comma-separated upstream list.
///
/// Entries are whitespace-trimmed; empty entries are discarded; invalid
/// entries are logged and skipped.
pub fn parse_upstreams(list: &str) -> Vec<Upstream> {
    list.split(',')
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .filter_map(|entry| match parse_upstream(entry) {
            Ok(upstream) => Some(upstream),
            Err(e) => {
                warn!("Skipping upstream '{entry}': {e}");
                None
            }
        })
        .collect()
}

fn parse_upstream(entry: &str) -> Result<Upstream, UpstreamParseError> {
    let spec: Box<str> = entry.into();

    if entry.starts_with("https://") {
        let url = url::Url::parse(entry).map_err(|_| UpstreamParseError)?;
        return Ok(Upstream {
            spec,
            transport: Transport::Https { url },
        });
    }

    let (scheme, rest) = match entry.split_once("://") {
        Some((scheme, rest)) => (scheme, rest),
        None => ("udp", entry),
    };
    let (host, port) = split_host_port(rest)?;
    let transport = match scheme {
        "udp" => Transport::Udp {
            host,
            port: port.unwrap_or(53),
        },
        "tcp" => Transport::Tcp {
            host,
            port: port.unwrap_or(53),
        },
        "tls" => Transport::Tls {
            host,
            port: port.unwrap_or(853),
        },
        _ => return Err(UpstreamParseError),
    };
    Ok(Upstream { spec, transport })
}

/// Split `host[:port]`, handling bracketed IPv6 literals.
fn split_host_port(s: &str) -> Result<(String, Option<u16>), UpstreamParseError> {
    if s.is_empty() {
        return Err(UpstreamParseError);
    }
    if let Some(rest) = s.strip_prefix('[') {
        let (host, rest) = rest.split_once(']').ok_or(UpstreamParseError)?;
        let port = match rest.strip_prefix(':') {
            Some(p) => Some(p.parse().map_err(|_| UpstreamParseError)?),
            None if rest.is_empty() => None,
            None => return Err(UpstreamParseError),
        };
        return Ok((host.to_string(), port));
    }
    // A bare IPv6 literal has multiple colons and no port.
    if s.matches(':').count() > 1 {
        return Ok((s.to_string(), None));
    }
    match s.split_once(':') {
        Some((host, port)) => Ok((
            host.to_string(),
            Some(port.parse().map_err(|_| UpstreamParseError)?),
        )),
        None => Ok((s.to_string(), None)),
    }
}

/// An unparseable upstream entry.
#[derive(Clone, Copy, Debug)]
pub struct UpstreamParseError;

impl std::error::Error for UpstreamParseError {}

impl fmt::Display for UpstreamParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("unrecognized upstream entry")
    }
}

//----------- ForwardTable -----------------------------------------------------

/// Compiled conditional-forwarding rules.
#[derive(Debug, Default)]
pub struct ForwardTable {
    /// (suffix, priority, upstreams), longest suffix first.
    rules: Vec<(Name, i32, Vec<Upstream>)>,
}

impl ForwardTable {
    pub fn build(rules: &[ForwardRule]) -> Self {
        let mut compiled: Vec<(Name, i32, Vec<Upstream>)> = rules
            .iter()
            .filter(|r| r.enabled)
            .filter_map(|r| {
                let suffix: Name = r.domain.parse().ok()?;
                let upstreams = parse_upstreams(&r.upstream);
                (!upstreams.is_empty()).then_some((suffix, r.priority, upstreams))
            })
            .collect();
        // Longest suffix first; ties broken by higher priority.
        compiled.sort_by(|a, b| {
            b.0.labels()
                .len()
                .cmp(&a.0.labels().len())
                .then(b.1.cmp(&a.1))
        });
        Self { rules: compiled }
    }

    /// The upstream override for a name, if a rule matches.
    pub fn lookup(&self, name: &Name) -> Option<&[Upstream]> {
        self.rules
            .iter()
            .find(|(suffix, _, _)| name.ends_with(suffix))
            .map(|(_, _, upstreams)| upstreams.as_slice())
    }
}

//----------- UpstreamPool -----------------------------------------------------

/// Per-endpoint health.
#[derive(Clone, Copy, Debug, Default)]
struct Health {
    consecutive_failures: u32,
    cooldown_until_ms: i64,
    ewma_latency_ms: f64,
}

/// A health snapshot row for the admin surface.
#[derive(Clone, Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamHealth {
    pub endpoint: String,
    pub consecutive_failures: u32,
    pub in_cooldown: bool,
    pub ewma_latency_ms: f64,
}

/// The shared upstream pool.
pub struct UpstreamPool {
    health: Mutex<foldhash::HashMap<Box<str>, Health>>,
    http: reqwest::Client,
    tls: TlsConnector,
}

impl fmt::Debug for UpstreamPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamPool").finish_non_exhaustive()
    }
}

impl UpstreamPool {
    pub fn new() -> Self {
        // Settle on one TLS crypto provider for the process; a no-op if
        // one (e.g. the one `main` installs) is already in place.
        static CRYPTO_PROVIDER: std::sync::Once = std::sync::Once::new();
        CRYPTO_PROVIDER.call_once(|| {
            let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
        });

        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Self {
            health: Mutex::new(Default::default()),
            http: reqwest::Client::new(),
            tls: TlsConnector::from(Arc::new(tls_config)),
        }
    }

    /// Order upstreams for an attempt: endpoints not in cooldown first,
    /// ascending by EWMA latency with ties in config order, then the
    /// cooled-down remainder in config order as a last resort.
    pub fn select<'a>(&self, upstreams: &'a [Upstream], now_ms: i64) -> Vec<&'a Upstream> {
        let health = self.health.lock().unwrap();
        let mut available: Vec<(usize, f64, &Upstream)> = Vec::new();
        let mut cooling: Vec<(usize, &Upstream)> = Vec::new();

        for (i, upstream) in upstreams.iter().enumerate() {
            let h = health.get(&upstream.spec).copied().unwrap_or_default();
            if now_ms < h.cooldown_until_ms {
                cooling.push((i, upstream));
            } else {
                available.push((i, h.ewma_latency_ms, upstream));
            }
        }

        available.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap().then(a.0.cmp(&b.0)));

        available
            .into_iter()
            .map(|(_, _, u)| u)
            .chain(cooling.into_iter().map(|(_, u)| u))
            .collect()
    }

    /// Record a successful exchange.
    pub fn mark_success(&self, upstream: &Upstream, latency: Duration) {
        let mut health = self.health.lock().unwrap();
        let h = health.entry(upstream.spec.clone()).or_default();
        let sample = latency.as_secs_f64() * 1000.0;
        h.ewma_latency_ms = if h.ewma_latency_ms == 0.0 {
            sample
        } else {
            h.ewma_latency_ms * (1.0 - EWMA_ALPHA) + sample * EWMA_ALPHA
        };
        h.consecutive_failures = 0;
        h.cooldown_until_ms = 0;
    }

    /// Record a failed exchange; repeated failures put the endpoint in
    /// exponential-backoff cooldown.
    pub fn mark_failure(&self, upstream: &Upstream, now_ms: i64) {
        let mut health = self.health.lock().unwrap();
        let h = health.entry(upstream.spec.clone()).or_default();
        h.consecutive_failures += 1;
        if h.consecutive_failures >= COOLDOWN_THRESHOLD {
            let backoff = 2u64
                .saturating_pow(h.consecutive_failures)
                .min(COOLDOWN_MAX_SECS);
            h.cooldown_until_ms = now_ms + backoff as i64 * 1000;
            debug!(
                "Upstream '{}' in cooldown for {backoff}s after {} failures",
                upstream.spec, h.consecutive_failures
            );
        }
    }

    /// Whether an endpoint is currently in cooldown.
    pub fn in_cooldown(&self, upstream: &Upstream, now_ms: i64) -> bool {
        self.health
            .lock()
            .unwrap()
            .get(&upstream.spec)
            .is_some_and(|h| now_ms < h.cooldown_until_ms)
    }

    /// Health rows for the admin surface.
    pub fn snapshot(&self, now_ms: i64) -> Vec<UpstreamHealth> {
        self.health
            .lock()
            .unwrap()
            .iter()
            .map(|(spec, h)| UpstreamHealth {
                endpoint: spec.to_string(),
                consecutive_failures: h.consecutive_failures,
                in_cooldown: now_ms < h.cooldown_until_ms,
                ewma_latency_ms: h.ewma_latency_ms,
            })
            .collect()
    }

    /// Send one request to one upstream.
    pub async fn query(
        &self,
        upstream: &Upstream,
        request: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, QueryError> {
        let timeout = timeout.min(ATTEMPT_TIMEOUT);
        tokio::time::timeout(timeout, self.query_inner(upstream, request))
            .await
            .map_err(|_| QueryError::Timeout)?
    }

    async fn query_inner(
        &self,
        upstream: &Upstream,
        request: &[u8],
    ) -> Result<Vec<u8>, QueryError> {
        match &upstream.transport {
            Transport::Udp { host, port } => {
                let response = self.query_udp(host, *port, request).await?;
                // Truncated answers retry over TCP transparently.
                if response.len() >= 12 && response[2] & 0x02 != 0 {
                    self.query_tcp_like(host, *port, request, false).await
                } else {
                    Ok(response)
                }
            }
            Transport::Tcp { host, port } => {
                self.query_tcp_like(host, *port, request, false).await
            }
            Transport::Tls { host, port } => {
                self.query_tcp_like(host, *port, request, true).await
            }
            Transport::Https { url } => self.query_https(url.clone(), request).await,
        }
    }

    async fn query_udp(&self, host: &str, port: u16, request: &[u8]) -> Result<Vec<u8>, QueryError> {
        let bind = if host.contains(':') { "[::]:0" } else { "0.0.0.0:0" };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect((host, port)).await?;
        socket.send(request).await?;

        let mut buf = vec![0u8; 4096];
        loop {
            let n = socket.recv(&mut buf).await?;
            // Responses with a foreign ID are late answers to earlier
            // queries from this port; keep waiting.
            if n >= 2 && buf[..2] == request[..2] {
                buf.truncate(n);
                return Ok(buf);
            }
        }
    }

    async fn query_tcp_like(
        &self,
        host: &str,
        port: u16,
        request: &[u8],
        tls: bool,
    ) -> Result<Vec<u8>, QueryError> {
        let stream = TcpStream::connect((host, port)).await?;
        if tls {
            let server_name = ServerName::try_from(host.to_string())
                .map_err(|_| QueryError::BadServerName)?;
            let stream = self.tls.connect(server_name, stream).await?;
            exchange_framed(stream, request).await
        } else {
            exchange_framed(stream, request).await
        }
    }

    async fn query_https(&self, url: url::Url, request: &[u8]) -> Result<Vec<u8>, QueryError> {
        let response = self
            .http
            .post(url)
            .header("content-type", "application/dns-message")
            .header("accept", "application/dns-message")
            .body(request.to_vec())
            .send()
            .await?
            .error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }
}

impl Default for UpstreamPool {
    fn default() -> Self {
        Self::new()
    }
}

/// One length-prefixed exchange over a TCP-like stream (RFC 1035
/// §4.2.2).
async fn exchange_framed<S>(mut stream: S, request: &[u8]) -> Result<Vec<u8>, QueryError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut framed = Vec::with_capacity(request.len() + 2);
    framed.extend_from_slice(&(request.len() as u16).to_be_bytes());
    framed.extend_from_slice(request);
    stream.write_all(&framed).await?;

    let mut len = [0u8; 2];
    stream.read_exact(&mut len).await?;
    let mut response = vec![0u8; u16::from_be_bytes(len) as usize];
    stream.read_exact(&mut response).await?;
    Ok(response)
}

//----------- QueryError -------------------------------------------------------

/// A failed exchange with one upstream.
#[derive(Debug)]
pub enum QueryError {
    Io(std::io::Error),
    Http(reqwest::Error),
    BadServerName,
    Timeout,
}

impl From<std::io::Error> for QueryError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<reqwest::Error> for QueryError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e)
    }
}

impl std::error::Error for QueryError {}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "transport error: {e}"),
            Self::Http(e) => write!(f, "http error: {e}"),
            Self::BadServerName => f.write_str("invalid TLS server name"),
            Self::Timeout => f.write_str("timed out"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_classify_by_scheme() {
        let list = parse_upstreams(
            "1.1.1.1, tcp://9.9.9.9, tls://dns.quad9.net, https://dns.google/dns-query,, udp://[2606:4700:4700::1111]:5353",
        );
        assert_eq!(list.len(), 5);
        assert_eq!(
            list[0].transport,
            Transport::Udp {
                host: "1.1.1.1".into(),
                port: 53
            }
        );
        assert_eq!(
            list[1].transport,
            Transport::Tcp {
                host: "9.9.9.9".into(),
                port: 53
            }
        );
        assert_eq!(
            list[2].transport,
            Transport::Tls {
                host: "dns.quad9.net".into(),
                port: 853
            }
        );
        assert!(matches!(list[3].transport, Transport::Https { .. }));
        assert_eq!(
            list[4].transport,
            Transport::Udp {
                host: "2606:4700:4700::1111".into(),
                port: 5353
            }
        );
    }

    #[test]
    fn junk_entries_are_skipped() {
        let list = parse_upstreams("ftp://nope, , 1.1.1.1:abc, 8.8.8.8");
        assert_eq!(list.len(), 1);
        assert_eq!(&*list[0].spec, "8.8.8.8");
    }

    #[test]
    fn selection_prefers_available_then_latency_then_config_order() {
        let pool = UpstreamPool::new();
        let ups = parse_upstreams("1.1.1.1, 8.8.8.8, 9.9.9.9");

        // 8.8.8.8 is fast, 1.1.1.1 slow, 9.9.9.9 cooling down.
        pool.mark_success(&ups[0], Duration::from_millis(80));
        pool.mark_success(&ups[1], Duration::from_millis(10));
        for _ in 0..3 {
            pool.mark_failure(&ups[2], 0);
        }

        let order: Vec<&str> = pool
            .select(&ups, 1_000)
            .into_iter()
            .map(|u| &*u.spec)
            .collect();
        assert_eq!(order, vec!["8.8.8.8", "1.1.1.1", "9.9.9.9"]);
    }

    #[test]
    fn cooldown_applies_after_three_failures_and_expires() {
        let pool = UpstreamPool::new();
        let ups = parse_upstreams("1.1.1.1");
        let u = &ups[0];

        pool.mark_failure(u, 0);
        pool.mark_failure(u, 0);
        assert!(!pool.in_cooldown(u, 1));
        pool.mark_failure(u, 0);
        assert!(pool.in_cooldown(u, 1));

        // 2^3 = 8s backoff.
        assert!(pool.in_cooldown(u, 7_999));
        assert!(!pool.in_cooldown(u, 8_001));

        // Success clears everything.
        pool.mark_success(u, Duration::from_millis(5));
        assert!(!pool.in_cooldown(u, 0));
    }

    #[test]
    fn cooldown_backoff_is_capped() {
        let pool = UpstreamPool::new();
        let ups = parse_upstreams("1.1.1.1");
        for _ in 0..64 {
            pool.mark_failure(&ups[0], 0);
        }
        assert!(pool.in_cooldown(&ups[0], 299_000));
        assert!(!pool.in_cooldown(&ups[0], 301_000));
    }

    #[test]
    fn forward_table_longest_suffix_and_priority() {
        let rules = vec![
            ForwardRule {
                domain: "corp.example".into(),
                upstream: "10.0.0.1".into(),
                enabled: true,
                priority: 0,
            },
            ForwardRule {
                domain: "internal.corp.example".into(),
                upstream: "10.0.0.2".into(),
                enabled: true,
                priority: 0,
            },
            ForwardRule {
                domain: "corp.example".into(),
                upstream: "10.0.0.3".into(),
                enabled: true,
                priority: 5,
            },
            ForwardRule {
                domain: "corp.example".into(),
                upstream: "10.0.0.4".into(),
                enabled: false,
                priority: 99,
            },
        ];
        let table = ForwardTable::build(&rules);

        let hit = table
            .lookup(&"db.internal.corp.example".parse().unwrap())
            .unwrap();
        assert_eq!(&*hit[0].spec, "10.0.0.2");

        // Equal specificity: the higher priority rule wins; disabled rules
        // never match.
        let hit = table.lookup(&"www.corp.example".parse().unwrap()).unwrap();
        assert_eq!(&*hit[0].spec, "10.0.0.3");

        assert!(table.lookup(&"example.com".parse().unwrap()).is_none());
    }
}

//! The blocklist set.
//!
//! A snapshot is an immutable set of lower-case FQDNs built off the hot
//! path and swapped in atomically.  Membership covers exact names and any
//! label-aligned parent: blocking `doubleclick.net` blocks
//! `ads.doubleclick.net` too.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::store::{Adlist, StoreData};

//----------- Blocklist --------------------------------------------------------

/// An immutable blocklist snapshot.
#[derive(Debug, Default)]
pub struct Blocklist {
    domains: foldhash::HashSet<Box<str>>,
}

impl Blocklist {
    /// Build a snapshot from domain strings; invalid entries are dropped.
    pub fn from_domains<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = foldhash::HashSet::default();
        for domain in domains {
            let domain = domain.as_ref().trim().trim_end_matches('.');
            if is_valid_domain(domain) {
                set.insert(domain.to_ascii_lowercase().into_boxed_str());
            }
        }
        Self { domains: set }
    }

    /// Exact membership.
    pub fn contains(&self, name: &str) -> bool {
        self.domains.contains(name)
    }

    /// Membership including parent domains.  Returns the matching rule,
    /// which may be the name itself or a suffix of it.
    pub fn contains_suffix<'a>(&self, name: &'a str) -> Option<&'a str> {
        let mut candidate = name;
        loop {
            if self.domains.contains(candidate) {
                return Some(candidate);
            }
            match candidate.split_once('.') {
                Some((_, rest)) if !rest.is_empty() => candidate = rest,
                _ => return None,
            }
        }
    }

    /// The number of domains in this snapshot.
    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}

//----------- Hosts-format parsing ---------------------------------------------

/// Extract the domain from one hosts-format line, if any.
///
/// Comments are stripped.  `0.0.0.0 ads.example` and `127.0.0.1
/// ads.example` yield the second token; a bare `ads.example` yields the
/// first.
pub fn parse_hosts_line(line: &str) -> Option<&str> {
    let line = line.split('#').next().unwrap_or("");
    let mut tokens = line.split_whitespace();
    let first = tokens.next()?;
    let candidate = if first == "0.0.0.0" || first == "127.0.0.1" {
        tokens.next()?
    } else {
        first
    };
    let candidate = candidate.trim_end_matches('.');
    is_valid_domain(candidate).then_some(candidate)
}

/// Validate a domain: labels of 1–63 LDH characters, no leading or
/// trailing hyphen, at most 253 octets overall.
pub fn is_valid_domain(domain: &str) -> bool {
    if domain.is_empty() || domain.len() > 253 {
        return false;
    }
    domain.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    })
}

//----------- Ingestion --------------------------------------------------------

/// The outcome of refreshing all adlists.
#[derive(Clone, Copy, Debug, Default)]
pub struct RefreshOutcome {
    pub feeds_ok: usize,
    pub feeds_failed: usize,
    pub domains: usize,
}

/// Fetch every enabled adlist and build a fresh snapshot, merging in the
/// manual denylist.
///
/// A feed that fails to download contributes nothing; the rest of the
/// snapshot is still built so one dead URL cannot empty the blocklist.
pub async fn build_snapshot(
    client: &reqwest::Client,
    data: &StoreData,
) -> (Arc<Blocklist>, RefreshOutcome) {
    let mut outcome = RefreshOutcome::default();
    let mut domains: Vec<String> = data.denylist.clone();

    for adlist in data.adlists.iter().filter(|a| a.enabled) {
        match fetch_feed(client, adlist).await {
            Ok(found) => {
                debug!("Fetched {} entries from '{}'", found.len(), adlist.url);
                outcome.feeds_ok += 1;
                domains.extend(found);
            }
            Err(e) => {
                warn!("Could not fetch adlist '{}': {e}", adlist.url);
                outcome.feeds_failed += 1;
            }
        }
    }

    let snapshot = Arc::new(Blocklist::from_domains(domains));
    outcome.domains = snapshot.len();
    (snapshot, outcome)
}

async fn fetch_feed(
    client: &reqwest::Client,
    adlist: &Adlist,
) -> Result<Vec<String>, FetchError> {
    let response = client
        .get(&adlist.url)
        .timeout(Duration::from_secs(60))
        .send()
        .await?
        .error_for_status()?;
    let body = response.text().await?;
    Ok(body
        .lines()
        .filter_map(parse_hosts_line)
        .map(str::to_owned)
        .collect())
}

//----------- FetchError -------------------------------------------------------

/// An error fetching a single feed.
#[derive(Debug)]
pub struct FetchError(reqwest::Error);

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        Self(e)
    }
}

impl std::error::Error for FetchError {}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffix_matching_is_label_aligned() {
        let list = Blocklist::from_domains(["doubleclick.net", "ads.example.com"]);

        assert_eq!(
            list.contains_suffix("ads.doubleclick.net"),
            Some("doubleclick.net")
        );
        assert_eq!(
            list.contains_suffix("a.b.c.doubleclick.net"),
            Some("doubleclick.net")
        );
        assert_eq!(list.contains_suffix("doubleclick.net"), Some("doubleclick.net"));

        // Not label-aligned: "click.net" is not a parent of this name.
        assert_eq!(list.contains_suffix("notdoubleclick.net"), None);
        assert_eq!(list.contains_suffix("example.com"), None);
    }

    #[test]
    fn hosts_lines_parse_per_convention() {
        assert_eq!(parse_hosts_line("0.0.0.0 ads.example.com"), Some("ads.example.com"));
        assert_eq!(parse_hosts_line("127.0.0.1 ads.example.com # banner"), Some("ads.example.com"));
        assert_eq!(parse_hosts_line("ads.example.com"), Some("ads.example.com"));
        assert_eq!(parse_hosts_line("# comment only"), None);
        assert_eq!(parse_hosts_line(""), None);
        assert_eq!(parse_hosts_line("0.0.0.0"), None);
        assert_eq!(parse_hosts_line("trailing.dot.example."), Some("trailing.dot.example"));
    }

    #[test]
    fn invalid_domains_are_rejected() {
        assert!(!is_valid_domain(""));
        assert!(!is_valid_domain("-leading.example"));
        assert!(!is_valid_domain("trailing-.example"));
        assert!(!is_valid_domain(&"a".repeat(64)));
        assert!(!is_valid_domain(&format!("{}.example", "a.".repeat(127))));
        assert!(is_valid_domain("under_score.example"));
        assert!(is_valid_domain("xn--bcher-kva.example"));
    }

    #[test]
    fn snapshots_fold_case_and_drop_junk() {
        let list = Blocklist::from_domains(["ADS.Example.COM", "not a domain", ""]);
        assert_eq!(list.len(), 1);
        assert!(list.contains("ads.example.com"));
    }
}

//! The policy engine.
//!
//! Resolves an allow/block verdict for a (client, name) pair from the
//! global lists, per-client and per-group rules, and regex filters.  The
//! compiled form is an immutable snapshot, rebuilt off-path whenever the
//! store changes and swapped in atomically.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use regex::Regex;
use tracing::warn;

use crate::blocklist::Blocklist;
use crate::store::{RuleAction, StoreData};

//----------- Decision ---------------------------------------------------------

/// The verdict for one query.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Forward the query.  Carries the allow rule that matched, if any, so
    /// the query log can attribute it.
    Allow(Option<String>),

    /// Deny the query.  Carries the rule that matched, e.g.
    /// `blocklist:doubleclick.net`.
    Block(String),
}

impl Decision {
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Block(_))
    }
}

//----------- PolicySnapshot ---------------------------------------------------

/// Compiled policy state.
#[derive(Debug)]
pub struct PolicySnapshot {
    blocking_enabled: bool,
    /// Unix seconds; blocking is suspended while `now < until`.
    blocking_disabled_until: Option<i64>,

    pub block_page_enabled: bool,
    pub block_page_ipv4: Ipv4Addr,
    pub block_page_ipv6: Ipv6Addr,

    global_allow: Blocklist,
    regex_allow: Vec<Regex>,
    regex_block: Vec<Regex>,

    clients: foldhash::HashMap<IpAddr, ClientPolicy>,
    groups: foldhash::HashMap<u32, GroupPolicy>,
}

impl Default for PolicySnapshot {
    fn default() -> Self {
        PolicySnapshot {
            blocking_enabled: false,
            blocking_disabled_until: None,
            block_page_enabled: false,
            block_page_ipv4: Ipv4Addr::UNSPECIFIED,
            block_page_ipv6: Ipv6Addr::UNSPECIFIED,
            global_allow: Blocklist::default(),
            regex_allow: Vec::new(),
            regex_block: Vec::new(),
            clients: foldhash::HashMap::default(),
            groups: foldhash::HashMap::default(),
        }
    }
}

#[derive(Debug, Default)]
struct ClientPolicy {
    allow: Blocklist,
    block: Blocklist,
    blocking_enabled: bool,
    groups: Vec<u32>,
    pub upstream_dns: Option<String>,
}

#[derive(Debug, Default)]
struct GroupPolicy {
    allow: Blocklist,
    block: Blocklist,
    blocking_enabled: bool,
}

impl PolicySnapshot {
    /// Compile a snapshot from the store.
    ///
    /// Invalid regex patterns are logged and skipped; they disable
    /// themselves, not the snapshot.
    pub fn build(data: &StoreData) -> Self {
        let mut regex_allow = Vec::new();
        let mut regex_block = Vec::new();
        for filter in data.regex_filters.iter().filter(|f| f.enabled) {
            match Regex::new(&filter.pattern) {
                Ok(re) => match filter.action {
                    RuleAction::Allow => regex_allow.push(re),
                    RuleAction::Block => regex_block.push(re),
                },
                Err(e) => {
                    warn!("Skipping invalid regex filter '{}': {e}", filter.pattern);
                }
            }
        }

        let clients = data
            .clients
            .iter()
            .map(|c| {
                (
                    c.ip,
                    ClientPolicy {
                        allow: Blocklist::from_domains(&c.allow),
                        block: Blocklist::from_domains(&c.block),
                        blocking_enabled: c.blocking_enabled,
                        groups: c.groups.clone(),
                        upstream_dns: c.upstream_dns.clone(),
                    },
                )
            })
            .collect();

        let groups = data
            .groups
            .iter()
            .map(|g| {
                (
                    g.id,
                    GroupPolicy {
                        allow: Blocklist::from_domains(&g.allow),
                        block: Blocklist::from_domains(&g.block),
                        blocking_enabled: g.blocking_enabled,
                    },
                )
            })
            .collect();

        Self {
            blocking_enabled: data.settings.blocking_enabled,
            blocking_disabled_until: data.settings.blocking_disabled_until,
            block_page_enabled: data.settings.block_page_enabled,
            block_page_ipv4: data.settings.block_page_ipv4,
            block_page_ipv6: data.settings.block_page_ipv6,
            global_allow: Blocklist::from_domains(&data.allowlist),
            regex_allow,
            regex_block,
            clients,
            groups,
        }
    }

    /// The upstream override for a client, if configured.
    pub fn client_upstreams(&self, client: IpAddr) -> Option<&str> {
        self.clients.get(&client)?.upstream_dns.as_deref()
    }

    /// Whether block verdicts apply for this client right now.
    fn blocking_effective(&self, client: IpAddr, now_unix: i64) -> bool {
        if !self.blocking_enabled {
            return false;
        }
        if let Some(until) = self.blocking_disabled_until {
            if now_unix < until {
                return false;
            }
        }
        if let Some(cp) = self.clients.get(&client) {
            if !cp.blocking_enabled {
                return false;
            }
            for gid in &cp.groups {
                if let Some(group) = self.groups.get(gid) {
                    if !group.blocking_enabled {
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Resolve the verdict for a query.
    ///
    /// Precedence, first match wins: client allow, group allow, global
    /// allowlist, regex allow, client block, group block, global
    /// blocklist, regex block, default allow.  When blocking is disabled
    /// (globally, per client/group, or by the disable timer) block
    /// verdicts flip to allow; allow rules still short-circuit and are
    /// still attributed.
    pub fn evaluate(
        &self,
        client: IpAddr,
        name: &str,
        blocklist: &Blocklist,
        now_unix: i64,
    ) -> Decision {
        let client_policy = self.clients.get(&client);
        let groups: &[u32] = client_policy.map(|c| c.groups.as_slice()).unwrap_or(&[]);

        // 1. Client per-name allow.
        if let Some(cp) = client_policy {
            if let Some(rule) = cp.allow.contains_suffix(name) {
                return Decision::Allow(Some(format!("client-allow:{rule}")));
            }
        }

        // 2. Group per-name allow.
        for gid in groups {
            if let Some(group) = self.groups.get(gid) {
                if let Some(rule) = group.allow.contains_suffix(name) {
                    return Decision::Allow(Some(format!("group-allow:{gid}:{rule}")));
                }
            }
        }

        // 3. Global allowlist.
        if let Some(rule) = self.global_allow.contains_suffix(name) {
            return Decision::Allow(Some(format!("allowlist:{rule}")));
        }

        // 4. Regex allow.
        if let Some(re) = self.regex_allow.iter().find(|re| re.is_match(name)) {
            return Decision::Allow(Some(format!("regex-allow:{}", re.as_str())));
        }

        let blocking = self.blocking_effective(client, now_unix);
        let block = |reason: String| {
            if blocking {
                Decision::Block(reason)
            } else {
                Decision::Allow(None)
            }
        };

        // 5. Client per-name block.
        if let Some(cp) = client_policy {
            if let Some(rule) = cp.block.contains_suffix(name) {
                return block(format!("client-block:{rule}"));
            }
        }

        // 6. Group per-name block.
        for gid in groups {
            if let Some(group) = self.groups.get(gid) {
                if let Some(rule) = group.block.contains_suffix(name) {
                    return block(format!("group-block:{gid}:{rule}"));
                }
            }
        }

        // 7. Global blocklist.
        if let Some(rule) = blocklist.contains_suffix(name) {
            return block(format!("blocklist:{rule}"));
        }

        // 8. Regex block.
        if let Some(re) = self.regex_block.iter().find(|re| re.is_match(name)) {
            return block(format!("regex-block:{}", re.as_str()));
        }

        // 9. Default.
        Decision::Allow(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Client, Group, RegexFilter, Settings};

    fn client_ip() -> IpAddr {
        "192.168.1.50".parse().unwrap()
    }

    fn store_with(f: impl FnOnce(&mut StoreData)) -> StoreData {
        let mut data = StoreData {
            settings: Settings::default(),
            ..Default::default()
        };
        f(&mut data);
        data
    }

    fn blocklist() -> Blocklist {
        Blocklist::from_domains(["doubleclick.net", "tracker.example"])
    }

    #[test]
    fn precedence_table() {
        // Each row: (store mutation description, expected verdict for
        // ads.doubleclick.net), exercising rules in increasing precedence
        // so every higher rule overrides everything below it.
        let name = "ads.doubleclick.net";

        // Default: the global blocklist wins.
        let snap = PolicySnapshot::build(&store_with(|_| {}));
        assert_eq!(
            snap.evaluate(client_ip(), name, &blocklist(), 0),
            Decision::Block("blocklist:doubleclick.net".into())
        );

        // Regex allow overrides the blocklist.
        let snap = PolicySnapshot::build(&store_with(|d| {
            d.regex_filters.push(RegexFilter {
                pattern: r"doubleclick\.net$".into(),
                action: RuleAction::Allow,
                enabled: true,
            });
        }));
        assert!(!snap.evaluate(client_ip(), name, &blocklist(), 0).is_blocked());

        // Global allowlist overrides regex block.
        let snap = PolicySnapshot::build(&store_with(|d| {
            d.allowlist.push("doubleclick.net".into());
            d.regex_filters.push(RegexFilter {
                pattern: ".*".into(),
                action: RuleAction::Block,
                enabled: true,
            });
        }));
        assert_eq!(
            snap.evaluate(client_ip(), name, &blocklist(), 0),
            Decision::Allow(Some("allowlist:doubleclick.net".into()))
        );

        // Group allow overrides the global allowlist order (still allow,
        // but attributed to the group).
        let snap = PolicySnapshot::build(&store_with(|d| {
            d.allowlist.push("doubleclick.net".into());
            d.groups.push(Group {
                id: 7,
                name: "kids".into(),
                blocking_enabled: true,
                allow: vec!["ads.doubleclick.net".into()],
                block: vec![],
            });
            d.clients.push(Client {
                ip: client_ip(),
                name: String::new(),
                groups: vec![7],
                blocking_enabled: true,
                upstream_dns: None,
                allow: vec![],
                block: vec![],
            });
        }));
        assert_eq!(
            snap.evaluate(client_ip(), name, &blocklist(), 0),
            Decision::Allow(Some("group-allow:7:ads.doubleclick.net".into()))
        );

        // Client allow beats everything.
        let snap = PolicySnapshot::build(&store_with(|d| {
            d.clients.push(Client {
                ip: client_ip(),
                name: String::new(),
                groups: vec![],
                blocking_enabled: true,
                upstream_dns: None,
                allow: vec!["doubleclick.net".into()],
                block: vec!["doubleclick.net".into()],
            });
        }));
        assert_eq!(
            snap.evaluate(client_ip(), name, &blocklist(), 0),
            Decision::Allow(Some("client-allow:doubleclick.net".into()))
        );

        // Client block beats group block and the global blocklist.
        let snap = PolicySnapshot::build(&store_with(|d| {
            d.clients.push(Client {
                ip: client_ip(),
                name: String::new(),
                groups: vec![],
                blocking_enabled: true,
                upstream_dns: None,
                allow: vec![],
                block: vec!["doubleclick.net".into()],
            });
        }));
        assert_eq!(
            snap.evaluate(client_ip(), name, &blocklist(), 0),
            Decision::Block("client-block:doubleclick.net".into())
        );
    }

    #[test]
    fn disabled_blocking_flips_block_verdicts() {
        let snap = PolicySnapshot::build(&store_with(|d| {
            d.settings.blocking_enabled = false;
        }));
        assert_eq!(
            snap.evaluate(client_ip(), "ads.doubleclick.net", &blocklist(), 0),
            Decision::Allow(None)
        );
    }

    #[test]
    fn disable_timer_is_honoured() {
        let snap = PolicySnapshot::build(&store_with(|d| {
            d.settings.blocking_disabled_until = Some(1000);
        }));
        let name = "ads.doubleclick.net";
        assert!(!snap.evaluate(client_ip(), name, &blocklist(), 999).is_blocked());
        assert!(snap.evaluate(client_ip(), name, &blocklist(), 1000).is_blocked());
    }

    #[test]
    fn allow_rules_short_circuit_even_when_blocking_is_off() {
        let snap = PolicySnapshot::build(&store_with(|d| {
            d.settings.blocking_enabled = false;
            d.allowlist.push("doubleclick.net".into());
        }));
        assert_eq!(
            snap.evaluate(client_ip(), "ads.doubleclick.net", &blocklist(), 0),
            Decision::Allow(Some("allowlist:doubleclick.net".into()))
        );
    }

    #[test]
    fn invalid_regex_is_skipped_not_fatal() {
        let snap = PolicySnapshot::build(&store_with(|d| {
            d.regex_filters.push(RegexFilter {
                pattern: "(unclosed".into(),
                action: RuleAction::Block,
                enabled: true,
            });
        }));
        assert!(!snap
            .evaluate(client_ip(), "anything.example", &blocklist(), 0)
            .is_blocked());
    }
}

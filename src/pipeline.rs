//! The query pipeline.
//!
//! The per-request state machine: decode, rate limit, policy decision,
//! authoritative answer, cache lookup, upstream resolution with failover,
//! response shaping, logging.  Every request runs this on its own task;
//! nothing here holds a lock across I/O.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, trace, warn};

use sinkhole_wire::{Class, Edns, Message, Name, Opcode, RData, RType, Rcode, Record};

use crate::cache::{CacheKey, Flight, Lookup};
use crate::engine::Engine;
use crate::metrics::QueryOutcome;
use crate::policy::Decision;
use crate::tsig::{self, TsigOutcome};
use crate::upstream::{parse_upstreams, Upstream};
use crate::zone::{render_rdata, Zone, ZoneAnswer};

/// The payload size we advertise in our own OPT records.
const OUR_UDP_PAYLOAD: u16 = 4096;

/// TTL of synthesised block-page answers.
const BLOCK_PAGE_TTL: u32 = 60;

//----------- ClientInfo -------------------------------------------------------

/// Where a request came from.
#[derive(Clone, Copy, Debug)]
pub struct ClientInfo {
    pub addr: IpAddr,
    pub transport: TransportKind,
}

/// The listener a request arrived on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportKind {
    Udp,
    Tcp,
    Dot,
    Doh,
}

impl TransportKind {
    /// TCP-like transports carry transfers and have no size limit.
    fn is_stream(&self) -> bool {
        !matches!(self, Self::Udp)
    }
}

//----------- Entry point ------------------------------------------------------

/// Handle one raw request; returns the encoded response.
///
/// `None` means the input was too short to even echo an ID, and is
/// silently dropped.
pub async fn handle(engine: &Arc<Engine>, wire: &[u8], client: ClientInfo) -> Option<Vec<u8>> {
    let started = Instant::now();

    let query = match Message::decode(wire) {
        Ok(query) => query,
        Err(e) => {
            trace!("Dropping malformed query from {}: {e}", client.addr);
            // FORMERR if at least a header came through.
            if wire.len() >= 12 {
                let mut response = Message::default();
                response.header.id = u16::from_be_bytes([wire[0], wire[1]]);
                response.header.flags.qr = true;
                response.header.rcode = Rcode::FormErr;
                engine.metrics.count_query(QueryOutcome::Error);
                engine.stats.record(true, engine.now_unix());
                return Some(response.encode());
            }
            return None;
        }
    };

    let outcome = process(engine, wire, &query, client).await;
    Some(finish(engine, &query, client, outcome, started))
}

/// What a processed query resolved to, before encoding.
struct Processed {
    response: Message,
    outcome: QueryOutcome,
    cached: bool,
    blocked: bool,
    block_reason: Option<String>,
}

impl Processed {
    fn new(response: Message, outcome: QueryOutcome) -> Self {
        Self {
            response,
            outcome,
            cached: false,
            blocked: false,
            block_reason: None,
        }
    }
}

async fn process(
    engine: &Arc<Engine>,
    wire: &[u8],
    query: &Message,
    client: ClientInfo,
) -> Processed {
    // An empty or absent question is FORMERR.
    let Some(question) = query.question() else {
        return Processed::new(error_response(query, Rcode::FormErr), QueryOutcome::Error);
    };

    // Dynamic update has its own path.
    if query.header.opcode == Opcode::Update {
        return handle_update(engine, wire, query, client).await;
    }
    if query.header.opcode != Opcode::Query {
        return Processed::new(error_response(query, Rcode::NotImp), QueryOutcome::Error);
    }
    if question.qclass != Class::In {
        return Processed::new(error_response(query, Rcode::NotImp), QueryOutcome::Error);
    }

    // Rate limit before any real work.
    let settings = engine.settings.load();
    if settings.rate_limit_enabled
        && !engine.rate_limiter.check(
            client.addr,
            engine.now_ms(),
            settings.rate_limit_max,
            settings.rate_limit_window_ms,
        )
    {
        engine.metrics.rate_limited.inc();
        return Processed::new(error_response(query, Rcode::Refused), QueryOutcome::Refused);
    }

    // Zone transfers.
    if matches!(question.qtype, RType::Axfr | RType::Ixfr) {
        return handle_transfer(engine, wire, query, client).await;
    }

    let qname = question.qname.clone();
    let name_text = qname.to_string().trim_end_matches('.').to_string();
    let do_bit = query.edns().map(|e| e.do_bit()).unwrap_or(false);

    // Authoritative zones answer before policy: local names are never
    // filtered.
    let zones = engine.zones.load();
    if let Some(zone) = zones.find_zone(&qname) {
        return answer_from_zone(engine, query, zone, &qname, question.qtype, do_bit);
    }
    if let Some(records) = zones.local_lookup(&qname, question.qtype) {
        let mut response = Message::reply_to(query);
        response.header.flags.aa = true;
        response.answers = records;
        return Processed::new(response, QueryOutcome::Local);
    }
    drop(zones);

    // Policy.
    let policy = engine.policy.load();
    let blocklist = engine.blocklist.load();
    let decision = policy.evaluate(client.addr, &name_text, &blocklist, engine.now_unix());
    let allow_reason = match decision {
        Decision::Block(reason) => {
            let mut processed = blocked_response(query, question.qtype, &policy);
            processed.block_reason = Some(reason);
            return processed;
        }
        Decision::Allow(reason) => reason,
    };
    drop(blocklist);
    drop(policy);

    // Resolution: cache, then upstreams, then stale fallback.
    let mut processed = resolve(engine, query, &qname, question.qtype, client).await;
    if processed.block_reason.is_none() {
        processed.block_reason = allow_reason;
    }
    processed
}

/// Shape, encode and log the final response.
fn finish(
    engine: &Arc<Engine>,
    query: &Message,
    client: ClientInfo,
    mut processed: Processed,
    started: Instant,
) -> Vec<u8> {
    let question = query.question();

    // Echo EDNS: our OPT advertises our payload size and copies DO.
    if let Some(client_edns) = query.edns() {
        let mut edns = Edns::new(OUR_UDP_PAYLOAD);
        edns.set_do_bit(client_edns.do_bit());
        processed
            .response
            .additionals
            .retain(|r| r.rtype() != RType::Opt);
        processed.response.additionals.push(Record::opt(edns));
    }

    let max_size = match client.transport {
        TransportKind::Udp => query
            .edns()
            .map(|e| (e.udp_size as usize).max(512))
            .unwrap_or(512),
        _ => sinkhole_wire::MAX_MESSAGE_LEN,
    };
    let bytes = processed.response.encode_with_limit(max_size);

    let elapsed_ms = started.elapsed().as_millis() as u64;
    let is_error = matches!(processed.outcome, QueryOutcome::Error);
    engine.metrics.count_query(processed.outcome);
    engine.stats.record(is_error, engine.now_unix());

    if let Some(question) = question {
        engine.query_log.record(
            client.addr,
            question.qname.to_string().trim_end_matches('.'),
            question.qtype,
            processed.blocked,
            processed.cached,
            processed.response.header.rcode,
            elapsed_ms,
            processed.block_reason.clone(),
            engine.now_ms(),
        );
    }

    bytes
}

//----------- Authoritative answers --------------------------------------------

fn answer_from_zone(
    engine: &Arc<Engine>,
    query: &Message,
    zone: &Arc<Zone>,
    qname: &Name,
    qtype: RType,
    do_bit: bool,
) -> Processed {
    let mut response = Message::reply_to(query);
    response.header.flags.aa = true;

    match zone.lookup(qname, qtype) {
        ZoneAnswer::Records(records) => {
            response.answers = records;
            // DNSSEC: sign every positive rrset when the client asked.
            if do_bit {
                if let Some(key) = zone.signing_key() {
                    let rrsigs = crate::zone::dnssec::sign_records(
                        key,
                        &zone.domain,
                        &response.answers,
                        engine.now_unix(),
                    );
                    response.answers.extend(rrsigs);
                }
            }
        }
        ZoneAnswer::NoData => {
            response.authorities.push(zone.negative_soa());
        }
        ZoneAnswer::NxDomain => {
            response.header.rcode = Rcode::NxDomain;
            response.authorities.push(zone.negative_soa());
        }
    }

    Processed::new(response, QueryOutcome::Local)
}

//----------- Blocked answers --------------------------------------------------

fn blocked_response(
    query: &Message,
    qtype: RType,
    policy: &crate::policy::PolicySnapshot,
) -> Processed {
    let mut response = Message::reply_to(query);

    if policy.block_page_enabled && matches!(qtype, RType::A | RType::Aaaa) {
        let qname = query.question().map(|q| q.qname.clone()).unwrap_or_default();
        let data = match qtype {
            RType::A => RData::A(policy.block_page_ipv4),
            _ => RData::Aaaa(policy.block_page_ipv6),
        };
        response
            .answers
            .push(Record::new(qname, BLOCK_PAGE_TTL, data));
    } else {
        response.header.rcode = Rcode::NxDomain;
    }

    let mut processed = Processed::new(response, QueryOutcome::Blocked);
    processed.blocked = true;
    processed
}

//----------- Resolution -------------------------------------------------------

async fn resolve(
    engine: &Arc<Engine>,
    query: &Message,
    qname: &Name,
    qtype: RType,
    client: ClientInfo,
) -> Processed {
    let settings = engine.settings.load();
    let key = CacheKey::new(&qname.to_string(), qtype);
    let now_ms = engine.now_ms();

    let serve_stale = settings
        .serve_stale_enabled
        .then_some(settings.serve_stale_max_age_secs);

    let mut stale: Option<Message> = None;
    if settings.cache_enabled {
        match engine.cache.lookup(&key, now_ms, serve_stale) {
            Lookup::Hit { response, .. } => {
                let mut processed =
                    Processed::new(from_template(query, &response), QueryOutcome::Cached);
                processed.cached = true;
                return processed;
            }
            Lookup::Stale { response, .. } => stale = Some(response),
            Lookup::Miss => {}
        }
    }

    // Upstream resolution, deduplicated per key.
    let resolved = match engine.singleflight.join(&key) {
        Flight::Leader => {
            let result = Arc::new(resolve_upstream(engine, qname, qtype, Some(client)).await);
            engine.singleflight.complete(&key, result.clone());
            result
        }
        Flight::Follower(mut rx) => match rx.recv().await {
            Ok(result) => result,
            // The leader died; resolve independently.
            Err(_) => Arc::new(resolve_upstream(engine, qname, qtype, Some(client)).await),
        },
    };

    match resolved.as_ref() {
        Some(upstream_response) => {
            if settings.cache_enabled {
                engine
                    .cache
                    .insert(key, upstream_response.clone(), engine.now_ms());
            }
            Processed::new(
                from_template(query, upstream_response),
                QueryOutcome::Forwarded,
            )
        }
        None => {
            if let Some(stale) = stale {
                debug!("Serving stale answer for {qname} (upstreams unavailable)");
                let mut processed =
                    Processed::new(from_template(query, &stale), QueryOutcome::Cached);
                processed.cached = true;
                processed
            } else {
                Processed::new(error_response(query, Rcode::ServFail), QueryOutcome::Error)
            }
        }
    }
}

/// Query upstreams in failover order; `Some` carries a decoded response
/// with an acceptable RCODE.
async fn resolve_upstream(
    engine: &Arc<Engine>,
    qname: &Name,
    qtype: RType,
    client: Option<ClientInfo>,
) -> Option<Message> {
    let settings = engine.settings.load();

    // Per-client, then per-domain (conditional forwarding), then default.
    let client_override: Option<Vec<Upstream>> = client.and_then(|c| {
        engine
            .policy
            .load()
            .client_upstreams(c.addr)
            .map(parse_upstreams)
    });
    let forward_table = engine.forward_table.load();
    let default = engine.default_upstreams.load();
    let upstreams: &[Upstream] = client_override
        .as_deref()
        .filter(|u| !u.is_empty())
        .or_else(|| forward_table.lookup(qname))
        .unwrap_or(default.as_slice());

    let mut outbound = Message::query(rand::thread_rng().gen(), qname.clone(), qtype);
    let mut edns = Edns::new(OUR_UDP_PAYLOAD);
    edns.set_do_bit(settings.dnssec_validation);
    outbound.additionals.push(Record::opt(edns));
    let request = outbound.encode();

    let deadline = Instant::now() + Duration::from_millis(engine.config.server.deadline_ms);
    let now_ms = engine.now_ms();

    for upstream in engine.upstreams.select(upstreams, now_ms) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }

        let attempt = Instant::now();
        match engine.upstreams.query(upstream, &request, remaining).await {
            Ok(bytes) if acceptable_rcode(&bytes) => {
                engine.upstreams.mark_success(upstream, attempt.elapsed());
                match Message::decode(&bytes) {
                    Ok(response) => return Some(response),
                    Err(e) => {
                        warn!("Upstream '{}' sent an undecodable response: {e}", upstream.spec);
                        engine.upstreams.mark_failure(upstream, engine.now_ms());
                        engine.metrics.upstream_failures.inc();
                    }
                }
            }
            Ok(_) => {
                engine.upstreams.mark_failure(upstream, engine.now_ms());
                engine.metrics.upstream_failures.inc();
            }
            Err(e) => {
                trace!("Upstream '{}' failed: {e}", upstream.spec);
                engine.upstreams.mark_failure(upstream, engine.now_ms());
                engine.metrics.upstream_failures.inc();
            }
        }
    }
    None
}

/// NOERROR, NXDOMAIN and REFUSED are answers; everything else is a
/// failed attempt and the next upstream is tried.
fn acceptable_rcode(bytes: &[u8]) -> bool {
    bytes.len() >= 12 && matches!(bytes[3] & 0x0f, 0 | 3 | 5)
}

/// Rebuild a response for this client from a cached or upstream template:
/// the client's ID and question, the template's verdict and sections.
fn from_template(query: &Message, template: &Message) -> Message {
    let mut response = Message::reply_to(query);
    response.header.rcode = template.header.rcode;
    response.answers = template.answers.clone();
    response.authorities = template.authorities.clone();
    response.additionals = template
        .additionals
        .iter()
        .filter(|r| r.rtype() != RType::Opt)
        .cloned()
        .collect();
    response
}

fn error_response(query: &Message, rcode: Rcode) -> Message {
    let mut response = Message::reply_to(query);
    response.header.rcode = rcode;
    response
}

//----------- Zone transfer ----------------------------------------------------

async fn handle_transfer(
    engine: &Arc<Engine>,
    wire: &[u8],
    query: &Message,
    client: ClientInfo,
) -> Processed {
    // Transfers ride the TCP-framed transports only.
    if !client.transport.is_stream() {
        return Processed::new(error_response(query, Rcode::Refused), QueryOutcome::Refused);
    }
    let question = query.question().expect("checked by caller");

    let verified = match authenticate_transfer(engine, wire, query, client) {
        Ok(verified) => verified,
        Err(processed) => return processed,
    };

    let zones = engine.zones.load();
    let Some(zone) = zones.zone_by_name(&question.qname).filter(|z| z.enabled) else {
        return Processed::new(error_response(query, Rcode::NotAuth), QueryOutcome::Refused);
    };

    let mut response = Message::reply_to(query);
    response.header.flags.aa = true;
    // IXFR is answered with full zone contents (RFC 1995 permits falling
    // back to an AXFR-style response).
    response.answers = zone.transfer_records();

    sign_if_verified(engine, &mut response, verified);
    Processed::new(response, QueryOutcome::Local)
}

/// TSIG when present; otherwise the transfer ACL.  Denied by default in
/// production mode.
fn authenticate_transfer(
    engine: &Arc<Engine>,
    wire: &[u8],
    query: &Message,
    client: ClientInfo,
) -> Result<Option<tsig::VerifiedTsig>, Processed> {
    let keys = engine.tsig_keys.load();
    match tsig::verify(&keys, wire, query, engine.now_unix()) {
        Ok(TsigOutcome::Verified(v)) => Ok(Some(v)),
        Ok(TsigOutcome::Unsigned) => {
            let acl = &engine.config.transfer.allow_from;
            let allowed = if acl.is_empty() {
                // With no ACL configured, unsigned transfers are a
                // development convenience only.
                !engine.config.production_mode()
            } else {
                acl.contains(&client.addr)
            };
            if allowed {
                Ok(None)
            } else {
                warn!("Refusing unsigned transfer from {}", client.addr);
                Err(Processed::new(
                    error_response(query, Rcode::Refused),
                    QueryOutcome::Refused,
                ))
            }
        }
        Err(e) => {
            warn!("TSIG verification failed from {}: {e}", client.addr);
            Err(Processed::new(
                error_response(query, Rcode::Refused),
                QueryOutcome::Refused,
            ))
        }
    }
}

fn sign_if_verified(
    engine: &Arc<Engine>,
    response: &mut Message,
    verified: Option<tsig::VerifiedTsig>,
) {
    let Some(verified) = verified else { return };
    let keys = engine.tsig_keys.load();
    let Some(key) = keys.get(&verified.key_name) else {
        return;
    };
    if let Err(e) = tsig::sign_response(key, response, &verified.request_mac, engine.now_unix()) {
        warn!("Could not sign response: {e}");
    }
}

//----------- Dynamic update ---------------------------------------------------

/// RFC 2136 dynamic update: the update section is applied as record
/// adds and deletes; prerequisites are not evaluated.
async fn handle_update(
    engine: &Arc<Engine>,
    wire: &[u8],
    query: &Message,
    client: ClientInfo,
) -> Processed {
    let Some(zone_question) = query.question() else {
        return Processed::new(error_response(query, Rcode::FormErr), QueryOutcome::Error);
    };

    let verified = match authenticate_transfer(engine, wire, query, client) {
        Ok(verified) => verified,
        Err(processed) => return processed,
    };

    let zone_domain = {
        let zones = engine.zones.load();
        let Some(zone) = zones.zone_by_name(&zone_question.qname).filter(|z| z.enabled) else {
            return Processed::new(error_response(query, Rcode::NotAuth), QueryOutcome::Refused);
        };
        zone.domain.clone()
    };
    let zone_name = zone_domain.to_string().trim_end_matches('.').to_string();

    // Every updated name must lie within the zone.
    if query
        .authorities
        .iter()
        .any(|r| !r.name.ends_with(&zone_domain))
    {
        return Processed::new(error_response(query, Rcode::NotZone), QueryOutcome::Refused);
    }

    let updates: Vec<Record> = query.authorities.clone();
    let applied = engine.mutate_zone_records(&zone_name, |records| {
        for update in &updates {
            apply_update_record(records, &zone_name, update);
        }
    });
    if !applied {
        return Processed::new(error_response(query, Rcode::NotAuth), QueryOutcome::Refused);
    }

    let mut response = Message::reply_to(query);
    sign_if_verified(engine, &mut response, verified);
    Processed::new(response, QueryOutcome::Local)
}

fn apply_update_record(
    records: &mut Vec<crate::store::ZoneRecordSpec>,
    zone: &str,
    update: &Record,
) {
    let owner = update.name.to_string().trim_end_matches('.').to_string();
    let rtype_text = update.rtype().to_string();

    match update.class {
        // Class IN: add the record.
        Class::In => {
            if let Some(value) = render_rdata(&update.data) {
                records.push(crate::store::ZoneRecordSpec {
                    zone: zone.into(),
                    name: format!("{owner}."),
                    rtype: rtype_text,
                    value,
                    ttl: update.ttl,
                });
            }
        }
        // Class ANY: delete the rrset (or all rrsets of the name).
        Class::Any => {
            let delete_all = update.rtype() == RType::Any;
            records.retain(|r| {
                let record_owner = resolve_owner(&r.name, zone);
                record_owner != owner || (!delete_all && r.rtype != rtype_text)
            });
        }
        // Class NONE: delete the specific record.
        Class::None => {
            if let Some(value) = render_rdata(&update.data) {
                records.retain(|r| {
                    resolve_owner(&r.name, zone) != owner
                        || r.rtype != rtype_text
                        || r.value != value
                });
            }
        }
        _ => {}
    }
}

/// A stored record's fully-qualified owner, lower-case, no trailing dot.
fn resolve_owner(stored: &str, zone: &str) -> String {
    let stored = stored.trim_end_matches('.');
    let owner = if stored == "@" || stored.is_empty() {
        zone.to_string()
    } else if stored.ends_with(zone) {
        stored.to_string()
    } else {
        format!("{stored}.{zone}")
    };
    owner.to_ascii_lowercase()
}

//----------- Prefetch ---------------------------------------------------------

/// Refresh one cache entry in the background (prefetch path).  Never
/// blocks a foreground request; singleflight keeps it to one refresh per
/// key.
pub async fn background_refresh(engine: &Arc<Engine>, key: CacheKey) {
    let Ok(qname) = key.name.parse::<Name>() else {
        return;
    };

    match engine.singleflight.join(&key) {
        Flight::Leader => {
            let result = Arc::new(resolve_upstream(engine, &qname, key.rtype, None).await);
            if let Some(response) = result.as_ref() {
                engine
                    .cache
                    .insert(key.clone(), response.clone(), engine.now_ms());
                trace!("Prefetched {} {}", key.name, key.rtype);
            }
            engine.singleflight.complete(&key, result);
        }
        // A refresh is already under way.
        Flight::Follower(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::store::{SoaSpec, Store, StoreData, ZoneRecordSpec, ZoneSpec};

    fn engine_with(f: impl FnOnce(&mut StoreData)) -> Arc<Engine> {
        let mut data = StoreData::default();
        // No upstreams: resolution paths that would go upstream fail fast.
        data.settings.upstream_dns = String::new();
        f(&mut data);
        Engine::new(Config::default(), Store::in_memory(data))
    }

    fn udp_client() -> ClientInfo {
        ClientInfo {
            addr: "192.168.1.50".parse().unwrap(),
            transport: TransportKind::Udp,
        }
    }

    fn query_wire(name: &str, qtype: RType) -> Vec<u8> {
        Message::query(0x5555, name.parse().unwrap(), qtype).encode()
    }

    async fn ask(engine: &Arc<Engine>, name: &str, qtype: RType) -> Message {
        let wire = query_wire(name, qtype);
        let response = handle(engine, &wire, udp_client()).await.unwrap();
        Message::decode(&response).unwrap()
    }

    #[tokio::test]
    async fn blocked_names_get_nxdomain() {
        let engine = engine_with(|d| d.denylist.push("doubleclick.net".into()));
        let response = ask(&engine, "ads.doubleclick.net", RType::A).await;
        assert_eq!(response.header.rcode, Rcode::NxDomain);
        assert!(!response.header.flags.aa);
        assert!(response.answers.is_empty());

        let log = engine.query_log.recent(1);
        assert!(log[0].blocked);
        assert_eq!(
            log[0].block_reason.as_deref(),
            Some("blocklist:doubleclick.net")
        );
    }

    #[tokio::test]
    async fn client_allow_overrides_the_blocklist() {
        let engine = engine_with(|d| {
            d.denylist.push("doubleclick.net".into());
            d.clients.push(crate::store::Client {
                ip: "192.168.1.50".parse().unwrap(),
                name: String::new(),
                groups: vec![],
                blocking_enabled: true,
                upstream_dns: None,
                allow: vec!["ads.doubleclick.net".into()],
                block: vec![],
            });
        });
        // Allowed, so the query goes to the (empty) upstream pool and
        // fails with SERVFAIL rather than NXDOMAIN.
        let response = ask(&engine, "ads.doubleclick.net", RType::A).await;
        assert_eq!(response.header.rcode, Rcode::ServFail);
        assert!(!engine.query_log.recent(1)[0].blocked);
    }

    #[tokio::test]
    async fn block_page_mode_synthesises_addresses() {
        let engine = engine_with(|d| {
            d.denylist.push("doubleclick.net".into());
            d.settings.block_page_enabled = true;
            d.settings.block_page_ipv4 = "10.10.10.10".parse().unwrap();
        });
        let response = ask(&engine, "ads.doubleclick.net", RType::A).await;
        assert_eq!(response.header.rcode, Rcode::NoError);
        assert_eq!(response.answers.len(), 1);
        assert_eq!(response.answers[0].ttl, BLOCK_PAGE_TTL);
        assert_eq!(
            response.answers[0].data,
            RData::A("10.10.10.10".parse().unwrap())
        );

        // Non-address types still get NXDOMAIN.
        let response = ask(&engine, "ads.doubleclick.net", RType::Txt).await;
        assert_eq!(response.header.rcode, Rcode::NxDomain);
    }

    fn home_lan(d: &mut StoreData) {
        d.zones.push(ZoneSpec {
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
        d.zone_records.push(ZoneRecordSpec {
            zone: "home.lan".into(),
            name: "pi".into(),
            rtype: "A".into(),
            value: "192.168.1.10".into(),
            ttl: 3600,
        });
    }

    #[tokio::test]
    async fn authoritative_answers_set_aa_and_skip_upstream() {
        let engine = engine_with(home_lan);
        let response = ask(&engine, "pi.home.lan", RType::A).await;
        assert_eq!(response.header.rcode, Rcode::NoError);
        assert!(response.header.flags.aa);
        assert_eq!(response.answers.len(), 1);
        assert_eq!(response.answers[0].ttl, 3600);
        assert_eq!(
            response.answers[0].data,
            RData::A("192.168.1.10".parse().unwrap())
        );
    }

    #[tokio::test]
    async fn authoritative_negatives_carry_the_soa() {
        let engine = engine_with(home_lan);
        let response = ask(&engine, "ghost.home.lan", RType::A).await;
        assert_eq!(response.header.rcode, Rcode::NxDomain);
        assert!(response.header.flags.aa);
        assert_eq!(response.authorities.len(), 1);
        assert_eq!(response.authorities[0].rtype(), RType::Soa);
        assert_eq!(response.authorities[0].ttl, 300);
    }

    #[tokio::test]
    async fn signed_zone_answers_carry_rrsigs_when_do_is_set() {
        let key_spec = crate::zone::dnssec::SigningKey::generate_zsk("home.lan").unwrap();
        let engine = engine_with(|d| {
            home_lan(d);
            d.zone_keys.push(key_spec);
        });

        let mut query = Message::query(7, "pi.home.lan".parse().unwrap(), RType::A);
        let mut edns = Edns::new(4096);
        edns.set_do_bit(true);
        query.additionals.push(Record::opt(edns));

        let response = handle(&engine, &query.encode(), udp_client()).await.unwrap();
        let response = Message::decode(&response).unwrap();
        let types: Vec<RType> = response.answers.iter().map(|r| r.rtype()).collect();
        assert_eq!(types, vec![RType::A, RType::Rrsig]);

        // Without DO the same answer is unsigned.
        let response = ask(&engine, "pi.home.lan", RType::A).await;
        assert_eq!(response.answers.len(), 1);
    }

    #[tokio::test]
    async fn cache_hits_are_served_and_marked() {
        let engine = engine_with(|_| {});
        let qname: Name = "example.com".parse().unwrap();

        // Seed the cache as a completed forward would.
        let seed_query = Message::query(1, qname.clone(), RType::A);
        let mut seed = Message::reply_to(&seed_query);
        seed.answers.push(Record::new(
            qname.clone(),
            300,
            RData::A("192.0.2.1".parse().unwrap()),
        ));
        engine
            .cache
            .insert(CacheKey::new("example.com", RType::A), seed, engine.now_ms());

        let response = ask(&engine, "EXAMPLE.com", RType::A).await;
        assert_eq!(response.header.rcode, Rcode::NoError);
        assert_eq!(response.answers.len(), 1);
        assert_eq!(response.header.id, 0x5555);
        assert!(engine.query_log.recent(1)[0].cached);
    }

    #[tokio::test]
    async fn stale_entries_serve_when_upstreams_are_down() {
        let engine = engine_with(|_| {});
        let qname: Name = "slow.example".parse().unwrap();
        let seed_query = Message::query(1, qname.clone(), RType::A);
        let mut seed = Message::reply_to(&seed_query);
        seed.answers.push(Record::new(
            qname,
            60,
            RData::A("192.0.2.9".parse().unwrap()),
        ));
        // Insert dated 10 minutes into the past so the entry is expired.
        engine.cache.insert(
            CacheKey::new("slow.example", RType::A),
            seed,
            engine.now_ms() - 600_000,
        );

        let response = ask(&engine, "slow.example", RType::A).await;
        assert_eq!(response.header.rcode, Rcode::NoError);
        assert_eq!(response.answers[0].ttl, 0);
        assert!(engine.query_log.recent(1)[0].cached);
    }

    #[tokio::test]
    async fn unresolvable_queries_servfail() {
        let engine = engine_with(|_| {});
        let response = ask(&engine, "unreachable.example", RType::A).await;
        assert_eq!(response.header.rcode, Rcode::ServFail);
    }

    #[tokio::test]
    async fn malformed_and_unsupported_queries_get_proper_rcodes() {
        let engine = engine_with(|_| {});

        // Garbage with a readable header: FORMERR, ID echoed.
        let mut garbage = vec![0u8; 12];
        garbage[0] = 0xab;
        garbage[1] = 0xcd;
        garbage[5] = 1; // claims one question that isn't there
        let response = handle(&engine, &garbage, udp_client()).await.unwrap();
        let response = Message::decode(&response).unwrap();
        assert_eq!(response.header.id, 0xabcd);
        assert_eq!(response.header.rcode, Rcode::FormErr);

        // Too short to answer at all.
        assert!(handle(&engine, &[0u8; 4], udp_client()).await.is_none());

        // Non-IN class: NOTIMPL.
        let mut query = Message::query(5, "example.com".parse().unwrap(), RType::A);
        query.questions[0].qclass = Class::Ch;
        let response = handle(&engine, &query.encode(), udp_client()).await.unwrap();
        assert_eq!(Message::decode(&response).unwrap().header.rcode, Rcode::NotImp);
    }

    #[tokio::test]
    async fn rate_limited_clients_are_refused() {
        let engine = engine_with(|d| {
            d.settings.rate_limit_max = 3;
            d.settings.rate_limit_window_ms = 60_000;
        });

        let mut last = None;
        for _ in 0..5 {
            last = Some(ask(&engine, "pi.home.lan", RType::A).await);
        }
        assert_eq!(last.unwrap().header.rcode, Rcode::Refused);
        assert!(engine
            .rate_limiter
            .is_sidelined("192.168.1.50".parse().unwrap(), engine.now_ms()));
    }

    #[tokio::test]
    async fn udp_responses_truncate_to_the_negotiated_size() {
        let engine = engine_with(|d| {
            home_lan(d);
            // Forty TXT records at the same name blow past 512 octets.
            for i in 0..40 {
                d.zone_records.push(ZoneRecordSpec {
                    zone: "home.lan".into(),
                    name: "big".into(),
                    rtype: "TXT".into(),
                    value: format!("record number {i} with some padding text"),
                    ttl: 3600,
                });
            }
        });

        let response = handle(
            &engine,
            &query_wire("big.home.lan", RType::Txt),
            udp_client(),
        )
        .await
        .unwrap();
        assert!(response.len() <= 512);
        let decoded = Message::decode(&response).unwrap();
        assert!(decoded.header.flags.tc);
        assert!(decoded.answers.is_empty());

        // The same query over TCP returns everything.
        let tcp = ClientInfo {
            addr: "192.168.1.50".parse().unwrap(),
            transport: TransportKind::Tcp,
        };
        let response = handle(&engine, &query_wire("big.home.lan", RType::Txt), tcp)
            .await
            .unwrap();
        let decoded = Message::decode(&response).unwrap();
        assert!(!decoded.header.flags.tc);
        assert_eq!(decoded.answers.len(), 40);
    }

    #[tokio::test]
    async fn axfr_requires_tcp_and_authorization() {
        let engine = engine_with(home_lan);

        // Over UDP: refused outright.
        let response = handle(&engine, &query_wire("home.lan", RType::Axfr), udp_client())
            .await
            .unwrap();
        assert_eq!(
            Message::decode(&response).unwrap().header.rcode,
            Rcode::Refused
        );

        // Over TCP in dev mode (no ACL): the zone comes back SOA-wrapped.
        let tcp = ClientInfo {
            addr: "192.168.1.50".parse().unwrap(),
            transport: TransportKind::Tcp,
        };
        let response = handle(&engine, &query_wire("home.lan", RType::Axfr), tcp)
            .await
            .unwrap();
        let decoded = Message::decode(&response).unwrap();
        assert_eq!(decoded.header.rcode, Rcode::NoError);
        assert_eq!(decoded.answers.first().unwrap().rtype(), RType::Soa);
        assert_eq!(decoded.answers.last().unwrap().rtype(), RType::Soa);
        assert_eq!(decoded.answers.len(), 3);
    }

    #[tokio::test]
    async fn dynamic_update_adds_records_and_bumps_serial() {
        let engine = engine_with(home_lan);
        let tcp = ClientInfo {
            addr: "192.168.1.50".parse().unwrap(),
            transport: TransportKind::Tcp,
        };

        let mut update = Message::default();
        update.header.id = 99;
        update.header.opcode = Opcode::Update;
        update
            .questions
            .push(sinkhole_wire::Question::new("home.lan".parse().unwrap(), RType::Soa));
        update.authorities.push(Record::new(
            "printer.home.lan".parse().unwrap(),
            600,
            RData::A("192.168.1.77".parse().unwrap()),
        ));

        let response = handle(&engine, &update.encode(), tcp).await.unwrap();
        assert_eq!(
            Message::decode(&response).unwrap().header.rcode,
            Rcode::NoError
        );
        assert_eq!(engine.store.with(|d| d.zones[0].soa.serial), 2);

        let answer = ask(&engine, "printer.home.lan", RType::A).await;
        assert_eq!(answer.answers.len(), 1);
        assert_eq!(answer.answers[0].ttl, 600);
    }
}

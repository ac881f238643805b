//! Authoritative zones and local records.
//!
//! The compiled form of the store's zones, zone records, keys and local
//! DNS entries.  Snapshots are immutable; every mutation goes through the
//! store and a rebuild.

pub mod dnssec;

use std::fmt;
use std::sync::Arc;

use tracing::warn;

use sinkhole_wire::{Name, RData, RType, Record};

use crate::store::{LocalRecord, SoaSpec, StoreData, ZoneRecordSpec};

//----------- ZoneSet ----------------------------------------------------------

/// An immutable snapshot of all zones plus the free-standing local
/// records.
#[derive(Debug, Default)]
pub struct ZoneSet {
    zones: Vec<Arc<Zone>>,
    /// Local DNS entries outside any zone, keyed by owner name.
    local: foldhash::HashMap<Name, Vec<Record>>,
}

impl ZoneSet {
    /// Compile a snapshot from the store.  Entries that fail to parse are
    /// logged and skipped; they never take the snapshot down.
    pub fn build(data: &StoreData) -> Self {
        let mut zones = Vec::new();
        for spec in &data.zones {
            match Zone::build(spec, data) {
                Ok(zone) => zones.push(Arc::new(zone)),
                Err(e) => warn!("Skipping zone '{}': {e}", spec.domain),
            }
        }
        // Longest domain first so find_zone can take the first suffix hit.
        zones.sort_by(|a, b| b.domain.labels().len().cmp(&a.domain.labels().len()));

        let mut local: foldhash::HashMap<Name, Vec<Record>> = Default::default();
        for spec in &data.local_records {
            match parse_local_record(spec) {
                Ok(record) => local.entry(record.name.clone()).or_default().push(record),
                Err(e) => warn!("Skipping local record '{}': {e}", spec.name),
            }
        }

        Self { zones, local }
    }

    /// The most specific enabled zone covering `qname`, if any.
    pub fn find_zone(&self, qname: &Name) -> Option<&Arc<Zone>> {
        self.zones
            .iter()
            .filter(|z| z.enabled)
            .find(|z| qname.ends_with(&z.domain))
    }

    /// A zone by exact apex name.
    pub fn zone_by_name(&self, domain: &Name) -> Option<&Arc<Zone>> {
        self.zones.iter().find(|z| &z.domain == domain)
    }

    /// Free-standing local records for a name and type; CNAMEs answer any
    /// type.
    pub fn local_lookup(&self, qname: &Name, qtype: RType) -> Option<Vec<Record>> {
        let records = self.local.get(qname)?;
        let matching: Vec<Record> = records
            .iter()
            .filter(|r| r.rtype() == qtype || r.rtype() == RType::Cname)
            .cloned()
            .collect();
        (!matching.is_empty()).then_some(matching)
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }
}

//----------- Zone -------------------------------------------------------------

/// A compiled authoritative zone.
#[derive(Debug)]
pub struct Zone {
    pub domain: Name,
    pub enabled: bool,
    pub soa: SoaSpec,
    soa_mname: Name,
    soa_rname: Name,
    /// Records with fully-qualified owner names.
    records: Vec<Record>,
    /// Signing keys; only active ZSKs are used for responses.
    pub keys: Vec<dnssec::SigningKey>,
}

/// The outcome of a zone lookup.
#[derive(Debug, PartialEq, Eq)]
pub enum ZoneAnswer {
    /// Matching records, possibly via one chased CNAME step.
    Records(Vec<Record>),

    /// The name exists, but not with this type.
    NoData,

    /// The name does not exist in the zone.
    NxDomain,
}

impl Zone {
    fn build(
        spec: &crate::store::ZoneSpec,
        data: &StoreData,
    ) -> Result<Self, ZoneBuildError> {
        let domain: Name = spec
            .domain
            .parse()
            .map_err(|_| ZoneBuildError::BadDomain)?;

        let soa_mname: Name = spec
            .soa
            .mname
            .parse()
            .map_err(|_| ZoneBuildError::BadDomain)?;
        let soa_rname: Name = spec
            .soa
            .rname
            .parse()
            .map_err(|_| ZoneBuildError::BadDomain)?;

        let mut records = Vec::new();
        for rec in data.zone_records.iter().filter(|r| r.zone == spec.domain) {
            match parse_zone_record(rec, &domain) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!("Skipping record '{}' in zone '{}': {e}", rec.name, spec.domain);
                }
            }
        }

        let mut keys = Vec::new();
        for key in data.zone_keys.iter().filter(|k| k.zone == spec.domain) {
            match dnssec::SigningKey::from_spec(key) {
                Ok(key) => keys.push(key),
                Err(e) => warn!("Skipping key for zone '{}': {e}", spec.domain),
            }
        }

        Ok(Self {
            domain,
            enabled: spec.enabled,
            soa: spec.soa.clone(),
            soa_mname,
            soa_rname,
            records,
            keys,
        })
    }

    /// Look up records for a question within this zone.
    ///
    /// If no direct match exists but the name has a CNAME, the CNAME is
    /// returned and chased one step when the target also lies in this
    /// zone; targets elsewhere are left for the client to resolve.
    pub fn lookup(&self, qname: &Name, qtype: RType) -> ZoneAnswer {
        // SOA and DNSKEY at the apex come from zone metadata.
        if qname == &self.domain {
            if qtype == RType::Soa {
                return ZoneAnswer::Records(vec![self.soa_record()]);
            }
            if qtype == RType::Dnskey {
                let dnskeys: Vec<Record> = self
                    .keys
                    .iter()
                    .filter(|k| k.active)
                    .map(|k| Record::new(self.domain.clone(), self.soa.ttl, k.dnskey_rdata()))
                    .collect();
                if !dnskeys.is_empty() {
                    return ZoneAnswer::Records(dnskeys);
                }
            }
        }

        let direct: Vec<Record> = self
            .records
            .iter()
            .filter(|r| &r.name == qname && (r.rtype() == qtype || qtype == RType::Any))
            .cloned()
            .collect();
        if !direct.is_empty() {
            return ZoneAnswer::Records(direct);
        }

        // CNAME fallback with a single chase step.
        let cname = self
            .records
            .iter()
            .find(|r| &r.name == qname && r.rtype() == RType::Cname);
        if let Some(cname) = cname {
            let mut answer = vec![cname.clone()];
            if let RData::Cname(target) = &cname.data {
                if target.ends_with(&self.domain) {
                    answer.extend(
                        self.records
                            .iter()
                            .filter(|r| &r.name == target && r.rtype() == qtype)
                            .cloned(),
                    );
                }
            }
            return ZoneAnswer::Records(answer);
        }

        // A name "exists" when it owns records or has records beneath it
        // (an empty non-terminal); both get NODATA rather than NXDOMAIN.
        let name_exists =
            qname == &self.domain || self.records.iter().any(|r| r.name.ends_with(qname));
        if name_exists {
            ZoneAnswer::NoData
        } else {
            ZoneAnswer::NxDomain
        }
    }

    /// The SOA record at the apex.
    pub fn soa_record(&self) -> Record {
        Record::new(
            self.domain.clone(),
            self.soa.ttl,
            RData::Soa {
                mname: self.soa_mname.clone(),
                rname: self.soa_rname.clone(),
                serial: self.soa.serial,
                refresh: self.soa.refresh,
                retry: self.soa.retry,
                expire: self.soa.expire,
                minimum: self.soa.minimum,
            },
        )
    }

    /// The SOA for the authority section of negative answers, with
    /// `ttl = min(SOA ttl, SOA minimum)`.
    pub fn negative_soa(&self) -> Record {
        let mut soa = self.soa_record();
        soa.ttl = self.soa.ttl.min(self.soa.minimum);
        soa
    }

    /// The full zone contents for a transfer: SOA first and last.
    pub fn transfer_records(&self) -> Vec<Record> {
        let soa = self.soa_record();
        let mut out = Vec::with_capacity(self.records.len() + 2);
        out.push(soa.clone());
        out.extend(self.records.iter().cloned());
        out.push(soa);
        out
    }

    /// The first active signing key, if any.
    pub fn signing_key(&self) -> Option<&dnssec::SigningKey> {
        self.keys.iter().find(|k| k.active)
    }
}

//----------- Record parsing ---------------------------------------------------

fn parse_zone_record(spec: &ZoneRecordSpec, zone: &Name) -> Result<Record, ZoneBuildError> {
    let name = if spec.name == "@" || spec.name.is_empty() {
        zone.clone()
    } else if spec.name.ends_with('.') {
        spec.name.parse().map_err(|_| ZoneBuildError::BadName)?
    } else {
        // Zone-relative: resolve against the apex.
        format!("{}.{}", spec.name, zone)
            .parse()
            .map_err(|_| ZoneBuildError::BadName)?
    };
    let data = parse_rdata(&spec.rtype, &spec.value)?;
    Ok(Record::new(name, spec.ttl, data))
}

fn parse_local_record(spec: &LocalRecord) -> Result<Record, ZoneBuildError> {
    let name: Name = spec.name.parse().map_err(|_| ZoneBuildError::BadName)?;
    let data = parse_rdata(&spec.rtype, &spec.value)?;
    Ok(Record::new(name, spec.ttl, data))
}

/// Parse record data from its presentation value.
pub fn parse_rdata(rtype: &str, value: &str) -> Result<RData, ZoneBuildError> {
    let rtype: RType = rtype.parse().map_err(|_| ZoneBuildError::BadType)?;
    let value = value.trim();

    Ok(match rtype {
        RType::A => RData::A(value.parse().map_err(|_| ZoneBuildError::BadValue)?),
        RType::Aaaa => RData::Aaaa(value.parse().map_err(|_| ZoneBuildError::BadValue)?),
        RType::Cname => RData::Cname(value.parse().map_err(|_| ZoneBuildError::BadValue)?),
        RType::Ns => RData::Ns(value.parse().map_err(|_| ZoneBuildError::BadValue)?),
        RType::Ptr => RData::Ptr(value.parse().map_err(|_| ZoneBuildError::BadValue)?),
        RType::Txt => RData::Txt(
            // Split into 255-octet character-strings.
            value
                .as_bytes()
                .chunks(255)
                .map(|c| c.to_vec())
                .collect(),
        ),
        RType::Mx => {
            let (prio, host) = value
                .split_once(char::is_whitespace)
                .ok_or(ZoneBuildError::BadValue)?;
            RData::Mx {
                preference: prio.parse().map_err(|_| ZoneBuildError::BadValue)?,
                exchange: host.trim().parse().map_err(|_| ZoneBuildError::BadValue)?,
            }
        }
        RType::Srv => {
            let mut parts = value.split_whitespace();
            let mut next =
                || -> Result<&str, ZoneBuildError> { parts.next().ok_or(ZoneBuildError::BadValue) };
            RData::Srv {
                priority: next()?.parse().map_err(|_| ZoneBuildError::BadValue)?,
                weight: next()?.parse().map_err(|_| ZoneBuildError::BadValue)?,
                port: next()?.parse().map_err(|_| ZoneBuildError::BadValue)?,
                target: next()?.parse().map_err(|_| ZoneBuildError::BadValue)?,
            }
        }
        _ => return Err(ZoneBuildError::BadType),
    })
}

/// Render record data back into its presentation value, for storing
/// records received via dynamic update.  Types we never store render as
/// `None`.
pub fn render_rdata(data: &RData) -> Option<String> {
    Some(match data {
        RData::A(addr) => addr.to_string(),
        RData::Aaaa(addr) => addr.to_string(),
        RData::Cname(name) | RData::Ns(name) | RData::Ptr(name) => name.to_string(),
        RData::Txt(strings) => strings
            .iter()
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .collect::<Vec<_>>()
            .concat(),
        RData::Mx {
            preference,
            exchange,
        } => format!("{preference} {exchange}"),
        RData::Srv {
            priority,
            weight,
            port,
            target,
        } => format!("{priority} {weight} {port} {target}"),
        _ => return None,
    })
}

//----------- ZoneBuildError ---------------------------------------------------

/// An error compiling a zone or record from the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ZoneBuildError {
    BadDomain,
    BadName,
    BadType,
    BadValue,
    BadKey,
}

impl std::error::Error for ZoneBuildError {}

impl fmt::Display for ZoneBuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::BadDomain => "invalid zone domain",
            Self::BadName => "invalid record name",
            Self::BadType => "unsupported record type",
            Self::BadValue => "invalid record value",
            Self::BadKey => "invalid key material",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ZoneSpec, ZoneRecordSpec};

    fn home_lan(records: Vec<ZoneRecordSpec>) -> StoreData {
        StoreData {
            zones: vec![ZoneSpec {
                domain: "home.lan".into(),
                enabled: true,
                soa: SoaSpec {
                    mname: "ns.home.lan".into(),
                    rname: "admin.home.lan".into(),
                    serial: 7,
                    refresh: 7200,
                    retry: 3600,
                    expire: 1_209_600,
                    minimum: 300,
                    ttl: 3600,
                },
            }],
            zone_records: records,
            ..Default::default()
        }
    }

    fn record(name: &str, rtype: &str, value: &str) -> ZoneRecordSpec {
        ZoneRecordSpec {
            zone: "home.lan".into(),
            name: name.into(),
            rtype: rtype.into(),
            value: value.into(),
            ttl: 3600,
        }
    }

    #[test]
    fn longest_suffix_zone_wins() {
        let mut data = home_lan(vec![]);
        data.zones.push(ZoneSpec {
            domain: "iot.home.lan".into(),
            enabled: true,
            soa: data.zones[0].soa.clone(),
        });
        let set = ZoneSet::build(&data);

        let q: Name = "cam.iot.home.lan".parse().unwrap();
        assert_eq!(set.find_zone(&q).unwrap().domain.to_string(), "iot.home.lan.");

        let q: Name = "pi.home.lan".parse().unwrap();
        assert_eq!(set.find_zone(&q).unwrap().domain.to_string(), "home.lan.");

        let q: Name = "example.com".parse().unwrap();
        assert!(set.find_zone(&q).is_none());
    }

    #[test]
    fn disabled_zones_are_invisible() {
        let mut data = home_lan(vec![]);
        data.zones[0].enabled = false;
        let set = ZoneSet::build(&data);
        let q: Name = "pi.home.lan".parse().unwrap();
        assert!(set.find_zone(&q).is_none());
    }

    #[test]
    fn relative_names_resolve_against_the_apex() {
        let data = home_lan(vec![record("pi", "A", "192.168.1.10")]);
        let set = ZoneSet::build(&data);
        let zone = set.zone_by_name(&"home.lan".parse().unwrap()).unwrap();

        match zone.lookup(&"pi.home.lan".parse().unwrap(), RType::A) {
            ZoneAnswer::Records(records) => {
                assert_eq!(records.len(), 1);
                assert_eq!(records[0].ttl, 3600);
                assert_eq!(records[0].data, RData::A("192.168.1.10".parse().unwrap()));
            }
            other => panic!("expected records, got {other:?}"),
        }
    }

    #[test]
    fn cname_is_chased_one_step_inside_the_zone() {
        let data = home_lan(vec![
            record("www", "CNAME", "pi.home.lan."),
            record("pi", "A", "192.168.1.10"),
            record("ext", "CNAME", "other.example.com."),
        ]);
        let set = ZoneSet::build(&data);
        let zone = set.zone_by_name(&"home.lan".parse().unwrap()).unwrap();

        match zone.lookup(&"www.home.lan".parse().unwrap(), RType::A) {
            ZoneAnswer::Records(records) => {
                assert_eq!(records.len(), 2);
                assert_eq!(records[0].rtype(), RType::Cname);
                assert_eq!(records[1].rtype(), RType::A);
            }
            other => panic!("expected records, got {other:?}"),
        }

        // External target: the CNAME alone comes back.
        match zone.lookup(&"ext.home.lan".parse().unwrap(), RType::A) {
            ZoneAnswer::Records(records) => assert_eq!(records.len(), 1),
            other => panic!("expected records, got {other:?}"),
        }
    }

    #[test]
    fn negative_answers_distinguish_nodata_from_nxdomain() {
        let data = home_lan(vec![record("pi", "A", "192.168.1.10")]);
        let set = ZoneSet::build(&data);
        let zone = set.zone_by_name(&"home.lan".parse().unwrap()).unwrap();

        assert_eq!(
            zone.lookup(&"pi.home.lan".parse().unwrap(), RType::Mx),
            ZoneAnswer::NoData
        );
        assert_eq!(
            zone.lookup(&"ghost.home.lan".parse().unwrap(), RType::A),
            ZoneAnswer::NxDomain
        );
    }

    #[test]
    fn negative_soa_ttl_is_min_of_ttl_and_minimum() {
        let data = home_lan(vec![]);
        let set = ZoneSet::build(&data);
        let zone = set.zone_by_name(&"home.lan".parse().unwrap()).unwrap();
        assert_eq!(zone.negative_soa().ttl, 300);
    }

    #[test]
    fn transfers_are_soa_wrapped() {
        let data = home_lan(vec![record("pi", "A", "192.168.1.10")]);
        let set = ZoneSet::build(&data);
        let zone = set.zone_by_name(&"home.lan".parse().unwrap()).unwrap();

        let records = zone.transfer_records();
        assert_eq!(records.len(), 3);
        assert_eq!(records.first().unwrap().rtype(), RType::Soa);
        assert_eq!(records.last().unwrap().rtype(), RType::Soa);
    }

    #[test]
    fn local_records_answer_without_a_zone() {
        let mut data = StoreData::default();
        data.local_records.push(LocalRecord {
            name: "nas.local".into(),
            rtype: "A".into(),
            value: "10.0.0.5".into(),
            ttl: 600,
        });
        let set = ZoneSet::build(&data);
        let hit = set
            .local_lookup(&"nas.local".parse().unwrap(), RType::A)
            .unwrap();
        assert_eq!(hit[0].data, RData::A("10.0.0.5".parse().unwrap()));
        assert!(set
            .local_lookup(&"nas.local".parse().unwrap(), RType::Mx)
            .is_none());
    }
}

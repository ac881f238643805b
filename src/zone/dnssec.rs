//! DNSSEC signing for authoritative zones.
//!
//! Zones can carry zone-signing keys; when a query arrives with the DO
//! bit set, every positive rrset in the response is accompanied by an
//! RRSIG computed here.  Ed25519 (algorithm 13) keys are generated
//! in-process; RSA-SHA256 (algorithm 8) keys can be imported as PKCS#8
//! and are used for signing only.
//!
//! Negative answers go out unsigned: NSEC/NSEC3 generation is not
//! implemented.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ring::rand::SystemRandom;
use ring::signature::{Ed25519KeyPair, KeyPair, RsaKeyPair, RSA_PKCS1_SHA256};

use sinkhole_wire::{Class, Name, RData, RType, Record};

use crate::store::ZoneKeySpec;
use crate::zone::ZoneBuildError;

/// DNSSEC algorithm numbers (RFC 8624).
pub const ALG_RSA_SHA256: u8 = 8;
pub const ALG_ED25519: u8 = 13;

/// Zone-signing key flags value.
pub const FLAGS_ZSK: u16 = 256;
/// Key-signing key flags value.
pub const FLAGS_KSK: u16 = 257;

/// RRSIG validity: one hour of clock-skew grace before now.
const INCEPTION_SKEW_SECS: i64 = 3600;
/// RRSIG validity: thirty days ahead.
const EXPIRATION_AHEAD_SECS: i64 = 30 * 24 * 3600;

//----------- SigningKey -------------------------------------------------------

/// A zone's signing key, parsed and ready to sign.
pub struct SigningKey {
    pub flags: u16,
    pub algorithm: u8,
    pub key_tag: u16,
    pub active: bool,
    public_key: Vec<u8>,
    signer: Signer,
}

enum Signer {
    Ed25519(Ed25519KeyPair),
    Rsa(Box<RsaKeyPair>),
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey")
            .field("flags", &self.flags)
            .field("algorithm", &self.algorithm)
            .field("key_tag", &self.key_tag)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

impl SigningKey {
    /// Generate a fresh Ed25519 zone-signing key.
    ///
    /// Returns the store spec; parse it back with [`Self::from_spec`].
    pub fn generate_zsk(zone: &str) -> Result<ZoneKeySpec, ZoneBuildError> {
        let rng = SystemRandom::new();
        let pkcs8 =
            Ed25519KeyPair::generate_pkcs8(&rng).map_err(|_| ZoneBuildError::BadKey)?;
        let key_pair = Ed25519KeyPair::from_pkcs8(pkcs8.as_ref())
            .map_err(|_| ZoneBuildError::BadKey)?;
        let public_key = key_pair.public_key().as_ref().to_vec();

        let key_tag = key_tag(FLAGS_ZSK, ALG_ED25519, &public_key);
        Ok(ZoneKeySpec {
            zone: zone.into(),
            flags: FLAGS_ZSK,
            algorithm: ALG_ED25519,
            private_key: BASE64.encode(pkcs8.as_ref()),
            public_key: BASE64.encode(&public_key),
            key_tag,
            active: true,
        })
    }

    /// Parse a key out of its store spec.
    pub fn from_spec(spec: &ZoneKeySpec) -> Result<Self, ZoneBuildError> {
        let private = BASE64
            .decode(&spec.private_key)
            .map_err(|_| ZoneBuildError::BadKey)?;
        let public_key = BASE64
            .decode(&spec.public_key)
            .map_err(|_| ZoneBuildError::BadKey)?;

        let signer = match spec.algorithm {
            ALG_ED25519 => Signer::Ed25519(
                Ed25519KeyPair::from_pkcs8(&private).map_err(|_| ZoneBuildError::BadKey)?,
            ),
            ALG_RSA_SHA256 => Signer::Rsa(Box::new(
                RsaKeyPair::from_pkcs8(&private).map_err(|_| ZoneBuildError::BadKey)?,
            )),
            _ => return Err(ZoneBuildError::BadKey),
        };

        Ok(Self {
            flags: spec.flags,
            algorithm: spec.algorithm,
            key_tag: key_tag(spec.flags, spec.algorithm, &public_key),
            active: spec.active,
            public_key,
            signer,
        })
    }

    /// The DNSKEY rdata for this key.
    pub fn dnskey_rdata(&self) -> RData {
        RData::Dnskey {
            flags: self.flags,
            protocol: 3,
            algorithm: self.algorithm,
            public_key: self.public_key.clone(),
        }
    }

    /// The raw public key, for verification in tests.
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Sign one rrset.
    ///
    /// All records must share an owner, type and TTL (an rrset); the
    /// signature covers the RRSIG rdata minus the signature itself,
    /// followed by the canonical-form records sorted by rdata octets
    /// (RFC 4034 §3.1.8.1).
    pub fn sign_rrset(
        &self,
        zone_apex: &Name,
        records: &[Record],
        now_unix: i64,
    ) -> Option<Record> {
        let first = records.first()?;
        let owner = &first.name;
        let type_covered = first.rtype();
        let original_ttl = first.ttl;
        let expiration = (now_unix + EXPIRATION_AHEAD_SECS) as u32;
        let inception = (now_unix - INCEPTION_SKEW_SECS) as u32;

        // The RRSIG rdata prefix (everything up to the signature).
        let mut signed = Vec::new();
        signed.extend_from_slice(&u16::from(type_covered).to_be_bytes());
        signed.push(self.algorithm);
        signed.push(owner.rrsig_label_count());
        signed.extend_from_slice(&original_ttl.to_be_bytes());
        signed.extend_from_slice(&expiration.to_be_bytes());
        signed.extend_from_slice(&inception.to_be_bytes());
        signed.extend_from_slice(&self.key_tag.to_be_bytes());
        zone_apex.write_uncompressed(&mut signed);

        // The rrset in canonical form, rdata-sorted.
        let mut rdatas: Vec<Vec<u8>> = records.iter().map(|r| r.canonical_rdata()).collect();
        rdatas.sort();
        for rdata in &rdatas {
            owner.write_uncompressed(&mut signed);
            signed.extend_from_slice(&u16::from(type_covered).to_be_bytes());
            signed.extend_from_slice(&u16::from(Class::In).to_be_bytes());
            signed.extend_from_slice(&original_ttl.to_be_bytes());
            signed.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
            signed.extend_from_slice(rdata);
        }

        let signature = match &self.signer {
            Signer::Ed25519(key) => key.sign(&signed).as_ref().to_vec(),
            Signer::Rsa(key) => {
                let rng = SystemRandom::new();
                let mut sig = vec![0; key.public().modulus_len()];
                key.sign(&RSA_PKCS1_SHA256, &rng, &signed, &mut sig).ok()?;
                sig
            }
        };

        Some(Record::new(
            owner.clone(),
            original_ttl,
            RData::Rrsig {
                type_covered,
                algorithm: self.algorithm,
                labels: owner.rrsig_label_count(),
                original_ttl,
                expiration,
                inception,
                key_tag: self.key_tag,
                signer: zone_apex.clone(),
                signature,
            },
        ))
    }
}

/// The RFC 4034 appendix-B key tag over the DNSKEY rdata.
pub fn key_tag(flags: u16, algorithm: u8, public_key: &[u8]) -> u16 {
    let mut rdata = Vec::with_capacity(4 + public_key.len());
    rdata.extend_from_slice(&flags.to_be_bytes());
    rdata.push(3);
    rdata.push(algorithm);
    rdata.extend_from_slice(public_key);

    let mut acc: u32 = 0;
    for (i, &b) in rdata.iter().enumerate() {
        acc += if i & 1 == 0 {
            (b as u32) << 8
        } else {
            b as u32
        };
    }
    acc += (acc >> 16) & 0xffff;
    (acc & 0xffff) as u16
}

/// Group records into rrsets by (owner, type) and sign each one.
///
/// Records of types that are themselves DNSSEC glue (RRSIG, OPT) are not
/// signed.
pub fn sign_records(
    key: &SigningKey,
    zone_apex: &Name,
    records: &[Record],
    now_unix: i64,
) -> Vec<Record> {
    let mut out: Vec<Record> = Vec::new();
    let mut done: Vec<(Name, RType)> = Vec::new();
    for record in records {
        let id = (record.name.clone(), record.rtype());
        if matches!(id.1, RType::Rrsig | RType::Opt) || done.contains(&id) {
            continue;
        }
        let rrset: Vec<Record> = records
            .iter()
            .filter(|r| r.name == id.0 && r.rtype() == id.1)
            .cloned()
            .collect();
        if let Some(rrsig) = key.sign_rrset(zone_apex, &rrset, now_unix) {
            out.push(rrsig);
        }
        done.push(id);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ring::signature::{UnparsedPublicKey, ED25519};

    fn test_key() -> SigningKey {
        let spec = SigningKey::generate_zsk("home.lan").unwrap();
        SigningKey::from_spec(&spec).unwrap()
    }

    #[test]
    fn generated_keys_round_trip_through_the_store() {
        let spec = SigningKey::generate_zsk("home.lan").unwrap();
        assert_eq!(spec.flags, FLAGS_ZSK);
        assert_eq!(spec.algorithm, ALG_ED25519);
        let key = SigningKey::from_spec(&spec).unwrap();
        assert_eq!(key.key_tag, spec.key_tag);
        assert_eq!(key.public_key().len(), 32);
    }

    #[test]
    fn key_tag_matches_rfc_4034_worked_example() {
        // A structural check: the tag of a known rdata is stable and fits
        // the fold-and-carry computation.
        let tag = key_tag(256, 13, &[0u8; 32]);
        let rdata_sum = (256u32 << 0) + ((3u32) << 8) + (13u32);
        let expected = {
            let mut acc = rdata_sum;
            acc += (acc >> 16) & 0xffff;
            (acc & 0xffff) as u16
        };
        assert_eq!(tag, expected);
    }

    #[test]
    fn rrsigs_verify_against_the_dnskey() {
        let key = test_key();
        let apex: Name = "home.lan".parse().unwrap();
        let rrset = vec![Record::new(
            "pi.home.lan".parse().unwrap(),
            3600,
            RData::A("192.168.1.10".parse().unwrap()),
        )];

        let now = 1_700_000_000;
        let rrsig = key.sign_rrset(&apex, &rrset, now).unwrap();
        let RData::Rrsig {
            signature,
            expiration,
            inception,
            labels,
            ..
        } = &rrsig.data
        else {
            panic!("expected RRSIG rdata");
        };
        assert_eq!(*labels, 3);
        assert_eq!(*expiration, (now + EXPIRATION_AHEAD_SECS) as u32);
        assert_eq!(*inception, (now - INCEPTION_SKEW_SECS) as u32);

        // Rebuild the signed data and verify with the public key.
        let mut signed = Vec::new();
        signed.extend_from_slice(&u16::from(RType::A).to_be_bytes());
        signed.push(ALG_ED25519);
        signed.push(3);
        signed.extend_from_slice(&3600u32.to_be_bytes());
        signed.extend_from_slice(&expiration.to_be_bytes());
        signed.extend_from_slice(&inception.to_be_bytes());
        signed.extend_from_slice(&key.key_tag.to_be_bytes());
        apex.write_uncompressed(&mut signed);
        let owner: Name = "pi.home.lan".parse().unwrap();
        owner.write_uncompressed(&mut signed);
        signed.extend_from_slice(&u16::from(RType::A).to_be_bytes());
        signed.extend_from_slice(&1u16.to_be_bytes());
        signed.extend_from_slice(&3600u32.to_be_bytes());
        signed.extend_from_slice(&4u16.to_be_bytes());
        signed.extend_from_slice(&[192, 168, 1, 10]);

        UnparsedPublicKey::new(&ED25519, key.public_key())
            .verify(&signed, signature)
            .expect("signature must verify");

        // Tampering with the signed data must fail verification.
        let mut tampered = signed.clone();
        *tampered.last_mut().unwrap() ^= 1;
        assert!(UnparsedPublicKey::new(&ED25519, key.public_key())
            .verify(&tampered, signature)
            .is_err());
    }

    #[test]
    fn rrsets_sign_once_per_owner_and_type() {
        let key = test_key();
        let apex: Name = "home.lan".parse().unwrap();
        let records = vec![
            Record::new(
                "pi.home.lan".parse().unwrap(),
                3600,
                RData::A("192.168.1.10".parse().unwrap()),
            ),
            Record::new(
                "pi.home.lan".parse().unwrap(),
                3600,
                RData::A("192.168.1.11".parse().unwrap()),
            ),
            Record::new(
                "nas.home.lan".parse().unwrap(),
                3600,
                RData::A("192.168.1.20".parse().unwrap()),
            ),
        ];
        let rrsigs = sign_records(&key, &apex, &records, 1_700_000_000);
        assert_eq!(rrsigs.len(), 2);
        assert!(rrsigs.iter().all(|r| r.rtype() == RType::Rrsig));
    }
}

//! TSIG transaction authentication (RFC 8945).
//!
//! Used on zone transfer and dynamic-update requests.  Verification
//! reconstructs the MAC input from the raw request bytes (ID and ARCOUNT
//! restored, TSIG record stripped) followed by the TSIG variables, and
//! compares in constant time via `ring::hmac::verify`.

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ring::hmac;
use tracing::warn;

use sinkhole_wire::message::tsig_boundary;
use sinkhole_wire::{Message, Name, RData, RType, Record};

use crate::store::StoreData;

/// Accepted clock skew is carried by the request's fudge field; this is
/// the cap we apply to unreasonable values.
const MAX_FUDGE_SECS: u64 = 3600;

/// TSIG error codes (RFC 8945 §5.2).
pub const TSIG_ERROR_BADSIG: u16 = 16;
pub const TSIG_ERROR_BADKEY: u16 = 17;
pub const TSIG_ERROR_BADTIME: u16 = 18;

//----------- TsigAlgorithm ----------------------------------------------------

/// A TSIG HMAC algorithm.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TsigAlgorithm {
    /// Recognised in configuration, refused at verification time
    /// (deprecated by RFC 8945).
    HmacMd5,
    HmacSha1,
    HmacSha256,
    HmacSha512,
}

impl TsigAlgorithm {
    /// Parse a configuration name like `hmac-sha256`.
    pub fn from_config(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "hmac-md5" => Some(Self::HmacMd5),
            "hmac-sha1" => Some(Self::HmacSha1),
            "hmac-sha256" => Some(Self::HmacSha256),
            "hmac-sha512" => Some(Self::HmacSha512),
            _ => None,
        }
    }

    /// The on-the-wire algorithm name.
    pub fn wire_name(&self) -> Name {
        match self {
            Self::HmacMd5 => "hmac-md5.sig-alg.reg.int",
            Self::HmacSha1 => "hmac-sha1",
            Self::HmacSha256 => "hmac-sha256",
            Self::HmacSha512 => "hmac-sha512",
        }
        .parse()
        .unwrap()
    }

    pub fn from_wire_name(name: &Name) -> Option<Self> {
        let text = name.to_string();
        match text.trim_end_matches('.') {
            "hmac-md5.sig-alg.reg.int" => Some(Self::HmacMd5),
            "hmac-sha1" => Some(Self::HmacSha1),
            "hmac-sha256" => Some(Self::HmacSha256),
            "hmac-sha512" => Some(Self::HmacSha512),
            _ => None,
        }
    }

    fn hmac_algorithm(&self) -> Option<hmac::Algorithm> {
        match self {
            // ring has no HMAC-MD5, and RFC 8945 deprecates it anyway.
            Self::HmacMd5 => None,
            Self::HmacSha1 => Some(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY),
            Self::HmacSha256 => Some(hmac::HMAC_SHA256),
            Self::HmacSha512 => Some(hmac::HMAC_SHA512),
        }
    }
}

//----------- TsigKey / TsigKeyStore -------------------------------------------

/// A shared TSIG key.
#[derive(Clone)]
pub struct TsigKey {
    pub name: Name,
    pub algorithm: TsigAlgorithm,
    secret: Vec<u8>,
    pub enabled: bool,
}

impl fmt::Debug for TsigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TsigKey")
            .field("name", &self.name)
            .field("algorithm", &self.algorithm)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

/// An immutable snapshot of the configured TSIG keys.
#[derive(Debug, Default)]
pub struct TsigKeyStore {
    keys: foldhash::HashMap<Name, TsigKey>,
}

impl TsigKeyStore {
    /// Compile a snapshot from the store; malformed keys are skipped.
    pub fn build(data: &StoreData) -> Self {
        let mut keys = foldhash::HashMap::default();
        for spec in &data.tsig_keys {
            let Ok(name) = spec.name.parse::<Name>() else {
                warn!("Skipping TSIG key with invalid name '{}'", spec.name);
                continue;
            };
            let Some(algorithm) = TsigAlgorithm::from_config(&spec.algorithm) else {
                warn!("Skipping TSIG key '{}': unknown algorithm '{}'", spec.name, spec.algorithm);
                continue;
            };
            let Ok(secret) = BASE64.decode(&spec.secret) else {
                warn!("Skipping TSIG key '{}': secret is not base64", spec.name);
                continue;
            };
            keys.insert(
                name.clone(),
                TsigKey {
                    name,
                    algorithm,
                    secret,
                    enabled: spec.enabled,
                },
            );
        }
        Self { keys }
    }

    pub fn get(&self, name: &Name) -> Option<&TsigKey> {
        self.keys.get(name).filter(|k| k.enabled)
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

//----------- Verification -----------------------------------------------------

/// A successfully verified TSIG, retained for signing the response.
#[derive(Clone, Debug)]
pub struct VerifiedTsig {
    pub key_name: Name,
    pub request_mac: Vec<u8>,
}

/// The outcome of scanning a request for TSIG.
#[derive(Debug)]
pub enum TsigOutcome {
    /// No TSIG record present.
    Unsigned,
    /// Present and valid.
    Verified(VerifiedTsig),
}

/// Verify the TSIG on a request, if one is present.
///
/// `raw` must be the exact bytes the message was decoded from.
pub fn verify(
    store: &TsigKeyStore,
    raw: &[u8],
    message: &Message,
    now_unix: i64,
) -> Result<TsigOutcome, TsigError> {
    let Some(tsig_record) = message
        .additionals
        .iter()
        .find(|r| r.rtype() == RType::Tsig)
    else {
        return Ok(TsigOutcome::Unsigned);
    };

    let RData::Tsig {
        algorithm,
        time_signed,
        fudge,
        mac,
        original_id,
        ..
    } = &tsig_record.data
    else {
        return Err(TsigError::Malformed);
    };

    // The TSIG record must be the last record of the message.
    let boundary = tsig_boundary(raw)
        .map_err(|_| TsigError::Malformed)?
        .ok_or(TsigError::Malformed)?;

    let key = store
        .get(&tsig_record.name)
        .ok_or(TsigError::BadKey)?;

    if TsigAlgorithm::from_wire_name(algorithm) != Some(key.algorithm) {
        return Err(TsigError::BadKey);
    }
    let Some(hmac_alg) = key.algorithm.hmac_algorithm() else {
        return Err(TsigError::UnsupportedAlgorithm);
    };

    // Timestamp skew beyond the fudge is rejected before any MAC work.
    let fudge_secs = (*fudge as u64).min(MAX_FUDGE_SECS) as i64;
    if (now_unix - *time_signed as i64).abs() > fudge_secs {
        return Err(TsigError::BadTime);
    }

    // Reconstruct the signed data: the message with the TSIG stripped,
    // the original ID restored and ARCOUNT decremented, followed by the
    // TSIG variables.
    let mut signed = raw[..boundary].to_vec();
    signed[0..2].copy_from_slice(&original_id.to_be_bytes());
    let arcount = u16::from_be_bytes(raw[10..12].try_into().unwrap()) - 1;
    signed[10..12].copy_from_slice(&arcount.to_be_bytes());
    append_tsig_variables(&mut signed, tsig_record);

    let hmac_key = hmac::Key::new(hmac_alg, &key.secret);
    hmac::verify(&hmac_key, &signed, mac).map_err(|_| TsigError::BadSig)?;

    Ok(TsigOutcome::Verified(VerifiedTsig {
        key_name: key.name.clone(),
        request_mac: mac.clone(),
    }))
}

/// The TSIG variables covered by the MAC (RFC 8945 §4.3.3): key name,
/// class, TTL, algorithm, time, fudge, error, other.
fn append_tsig_variables(signed: &mut Vec<u8>, tsig: &Record) {
    let RData::Tsig {
        algorithm,
        time_signed,
        fudge,
        error,
        other,
        ..
    } = &tsig.data
    else {
        return;
    };
    tsig.name.write_uncompressed(signed);
    signed.extend_from_slice(&u16::from(tsig.class).to_be_bytes());
    signed.extend_from_slice(&tsig.ttl.to_be_bytes());
    algorithm.write_uncompressed(signed);
    signed.extend_from_slice(&time_signed.to_be_bytes()[2..8]);
    signed.extend_from_slice(&fudge.to_be_bytes());
    signed.extend_from_slice(&error.to_be_bytes());
    signed.extend_from_slice(&(other.len() as u16).to_be_bytes());
    signed.extend_from_slice(other);
}

/// Sign a response message with `key`.
///
/// The response MAC covers the request MAC (length-prefixed), the
/// response without its TSIG, and the TSIG variables; the signed record
/// is appended to the additionals.
pub fn sign_response(
    key: &TsigKey,
    response: &mut Message,
    request_mac: &[u8],
    now_unix: i64,
) -> Result<(), TsigError> {
    let Some(hmac_alg) = key.algorithm.hmac_algorithm() else {
        return Err(TsigError::UnsupportedAlgorithm);
    };

    let tsig_record = Record {
        name: key.name.clone(),
        class: sinkhole_wire::Class::Any,
        ttl: 0,
        data: RData::Tsig {
            algorithm: key.algorithm.wire_name(),
            time_signed: now_unix as u64,
            fudge: 300,
            mac: Vec::new(),
            original_id: response.header.id,
            error: 0,
            other: Vec::new(),
        },
    };

    let mut signed = Vec::new();
    signed.extend_from_slice(&(request_mac.len() as u16).to_be_bytes());
    signed.extend_from_slice(request_mac);
    signed.extend_from_slice(&response.encode());
    append_tsig_variables(&mut signed, &tsig_record);

    let hmac_key = hmac::Key::new(hmac_alg, &key.secret);
    let mac = hmac::sign(&hmac_key, &signed).as_ref().to_vec();

    let mut tsig_record = tsig_record;
    if let RData::Tsig { mac: m, .. } = &mut tsig_record.data {
        *m = mac;
    }
    response.additionals.push(tsig_record);
    Ok(())
}

//----------- TsigError --------------------------------------------------------

/// A TSIG verification failure; all map to REFUSED at the server
/// boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TsigError {
    /// No such key, key disabled, or algorithm mismatch.
    BadKey,
    /// The algorithm is recognised but not served (hmac-md5).
    UnsupportedAlgorithm,
    /// Timestamp outside the fudge window.
    BadTime,
    /// MAC mismatch.
    BadSig,
    /// The TSIG record is structurally wrong or not last.
    Malformed,
}

impl TsigError {
    /// The TSIG-level error code for the response.
    pub fn code(&self) -> u16 {
        match self {
            Self::BadKey | Self::UnsupportedAlgorithm => TSIG_ERROR_BADKEY,
            Self::BadTime => TSIG_ERROR_BADTIME,
            Self::BadSig | Self::Malformed => TSIG_ERROR_BADSIG,
        }
    }
}

impl std::error::Error for TsigError {}

impl fmt::Display for TsigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::BadKey => "unknown or mismatched key",
            Self::UnsupportedAlgorithm => "unsupported algorithm",
            Self::BadTime => "timestamp outside fudge window",
            Self::BadSig => "MAC mismatch",
            Self::Malformed => "malformed TSIG record",
        })
    }
}

//----------- Signing requests (for tests and transfers-out) -------------------

/// Sign a request message, appending the TSIG record.
pub fn sign_request(
    key: &TsigKey,
    message: &mut Message,
    now_unix: i64,
) -> Result<(), TsigError> {
    let Some(hmac_alg) = key.algorithm.hmac_algorithm() else {
        return Err(TsigError::UnsupportedAlgorithm);
    };

    let tsig_record = Record {
        name: key.name.clone(),
        class: sinkhole_wire::Class::Any,
        ttl: 0,
        data: RData::Tsig {
            algorithm: key.algorithm.wire_name(),
            time_signed: now_unix as u64,
            fudge: 300,
            mac: Vec::new(),
            original_id: message.header.id,
            error: 0,
            other: Vec::new(),
        },
    };

    let mut signed = message.encode();
    append_tsig_variables(&mut signed, &tsig_record);

    let hmac_key = hmac::Key::new(hmac_alg, &key.secret);
    let mac = hmac::sign(&hmac_key, &signed).as_ref().to_vec();

    let mut tsig_record = tsig_record;
    if let RData::Tsig { mac: m, .. } = &mut tsig_record.data {
        *m = mac;
    }
    message.additionals.push(tsig_record);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::TsigKeySpec;
    use sinkhole_wire::RType;

    fn keystore() -> TsigKeyStore {
        TsigKeyStore::build(&StoreData {
            tsig_keys: vec![TsigKeySpec {
                name: "transfer-key".into(),
                algorithm: "hmac-sha256".into(),
                secret: BASE64.encode(b"a-very-secret-shared-key"),
                enabled: true,
            }],
            ..Default::default()
        })
    }

    fn signed_axfr(now: i64) -> (Vec<u8>, Message) {
        let store = keystore();
        let key = store.get(&"transfer-key".parse().unwrap()).unwrap();
        let mut msg = Message::query(42, "home.lan".parse().unwrap(), RType::Axfr);
        sign_request(key, &mut msg, now).unwrap();
        (msg.encode(), msg)
    }

    #[test]
    fn valid_signatures_verify() {
        let store = keystore();
        let now = 1_700_000_000;
        let (raw, msg) = signed_axfr(now);
        match verify(&store, &raw, &msg, now + 10).unwrap() {
            TsigOutcome::Verified(v) => {
                assert_eq!(v.key_name.to_string(), "transfer-key.");
                assert!(!v.request_mac.is_empty());
            }
            other => panic!("expected verified, got {other:?}"),
        }
    }

    #[test]
    fn unsigned_messages_pass_through() {
        let store = keystore();
        let msg = Message::query(1, "home.lan".parse().unwrap(), RType::Axfr);
        let raw = msg.encode();
        assert!(matches!(
            verify(&store, &raw, &msg, 0).unwrap(),
            TsigOutcome::Unsigned
        ));
    }

    #[test]
    fn bit_flips_in_the_signed_region_fail() {
        let store = keystore();
        let now = 1_700_000_000;
        let (mut raw, _) = signed_axfr(now);

        // Flip a bit in the question name, then re-decode so the decoded
        // view matches the mutated bytes.
        raw[14] ^= 0x01;
        let msg = Message::decode(&raw).unwrap();
        assert_eq!(
            verify(&store, &raw, &msg, now).unwrap_err(),
            TsigError::BadSig
        );
    }

    #[test]
    fn stale_timestamps_are_rejected() {
        let store = keystore();
        let now = 1_700_000_000;
        let (raw, msg) = signed_axfr(now);
        assert_eq!(
            verify(&store, &raw, &msg, now + 1000).unwrap_err(),
            TsigError::BadTime
        );
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let now = 1_700_000_000;
        let (raw, msg) = signed_axfr(now);
        let empty = TsigKeyStore::default();
        assert_eq!(verify(&empty, &raw, &msg, now).unwrap_err(), TsigError::BadKey);
    }

    #[test]
    fn md5_keys_are_recognised_but_refused() {
        let store = TsigKeyStore::build(&StoreData {
            tsig_keys: vec![TsigKeySpec {
                name: "legacy".into(),
                algorithm: "hmac-md5".into(),
                secret: BASE64.encode(b"legacy-secret"),
                enabled: true,
            }],
            ..Default::default()
        });
        let key = store.get(&"legacy".parse().unwrap()).unwrap();
        let mut msg = Message::query(1, "home.lan".parse().unwrap(), RType::Axfr);
        assert_eq!(
            sign_request(key, &mut msg, 0).unwrap_err(),
            TsigError::UnsupportedAlgorithm
        );
    }

    #[test]
    fn responses_sign_and_carry_the_request_mac_chain() {
        let store = keystore();
        let key = store.get(&"transfer-key".parse().unwrap()).unwrap();
        let now = 1_700_000_000;
        let (_, request) = signed_axfr(now);
        let request_mac = match &request.additionals.last().unwrap().data {
            RData::Tsig { mac, .. } => mac.clone(),
            _ => unreachable!(),
        };

        let mut response = Message::reply_to(&request);
        sign_response(key, &mut response, &request_mac, now).unwrap();
        let tsig = response.additionals.last().unwrap();
        assert_eq!(tsig.rtype(), RType::Tsig);
        match &tsig.data {
            RData::Tsig { mac, .. } => assert_eq!(mac.len(), 32),
            _ => unreachable!(),
        }
    }
}

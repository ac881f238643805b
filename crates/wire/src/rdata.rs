//! Resource records and their typed rdata.

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::edns::Edns;
use crate::message::{Encoder, Reader};
use crate::name::Name;
use crate::types::{Class, RType};
use crate::DecodeError;

//----------- Record -----------------------------------------------------------

/// A resource record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    /// The owner name.
    pub name: Name,

    /// The class.  For OPT pseudo-records this carries the raw requestor
    /// payload size off the wire; [`Record::opt`] keeps it consistent.
    pub class: Class,

    /// Time to live, in seconds.
    pub ttl: u32,

    /// The typed record data.
    pub data: RData,
}

impl Record {
    /// Build a plain IN-class record.
    pub fn new(name: Name, ttl: u32, data: RData) -> Self {
        Self {
            name,
            class: Class::In,
            ttl,
            data,
        }
    }

    /// Build the OPT pseudo-record for an EDNS(0) block.
    ///
    /// The OPT record abuses the class and TTL header fields; this
    /// constructor fills them so that the record round-trips.
    pub fn opt(edns: Edns) -> Self {
        Self {
            name: Name::root(),
            class: Class::from(edns.udp_size),
            ttl: edns.packed_ttl(),
            data: RData::Opt(edns),
        }
    }

    /// The record type, as carried by the rdata variant.
    pub fn rtype(&self) -> RType {
        self.data.rtype()
    }

    pub(crate) fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let name = r.name()?;
        let rtype = RType::from(r.u16()?);
        let class = Class::from(r.u16()?);
        let ttl = r.u32()?;
        let rdlen = r.u16()? as usize;
        let data = RData::decode(rtype, class, ttl, r, rdlen)?;
        Ok(Self {
            name,
            class,
            ttl,
            data,
        })
    }

    pub(crate) fn encode(&self, enc: &mut Encoder) {
        enc.name_compressed(&self.name);
        enc.u16(self.rtype().into());
        match &self.data {
            RData::Opt(edns) => {
                enc.u16(edns.udp_size);
                enc.u32(edns.packed_ttl());
            }
            _ => {
                enc.u16(self.class.into());
                enc.u32(self.ttl);
            }
        }
        let mark = enc.rdlen_placeholder();
        self.data.encode_body(enc);
        enc.patch_rdlen(mark);
    }

    /// The rdata in canonical (uncompressed, lower-case) wire form, as
    /// covered by DNSSEC signatures.
    pub fn canonical_rdata(&self) -> Vec<u8> {
        self.data.canonical_bytes()
    }
}

//----------- RData ------------------------------------------------------------

/// Typed record data.
///
/// Unknown types are carried as opaque bytes and never altered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Ns(Name),
    Cname(Name),
    Ptr(Name),
    Soa {
        mname: Name,
        rname: Name,
        serial: u32,
        refresh: u32,
        retry: u32,
        expire: u32,
        minimum: u32,
    },
    Mx {
        preference: u16,
        exchange: Name,
    },
    /// A sequence of character-strings; concatenated for display.
    Txt(Vec<Vec<u8>>),
    Srv {
        priority: u16,
        weight: u16,
        port: u16,
        target: Name,
    },
    Naptr {
        order: u16,
        preference: u16,
        flags: Vec<u8>,
        services: Vec<u8>,
        regexp: Vec<u8>,
        replacement: Name,
    },
    Sshfp {
        algorithm: u8,
        fingerprint_type: u8,
        fingerprint: Vec<u8>,
    },
    Tlsa {
        usage: u8,
        selector: u8,
        matching_type: u8,
        data: Vec<u8>,
    },
    Svcb {
        priority: u16,
        target: Name,
        params: Vec<u8>,
    },
    Https {
        priority: u16,
        target: Name,
        params: Vec<u8>,
    },
    Opt(Edns),
    Ds {
        key_tag: u16,
        algorithm: u8,
        digest_type: u8,
        digest: Vec<u8>,
    },
    Dnskey {
        flags: u16,
        protocol: u8,
        algorithm: u8,
        public_key: Vec<u8>,
    },
    Rrsig {
        type_covered: RType,
        algorithm: u8,
        labels: u8,
        original_ttl: u32,
        expiration: u32,
        inception: u32,
        key_tag: u16,
        signer: Name,
        signature: Vec<u8>,
    },
    Nsec {
        next: Name,
        type_bitmaps: Vec<u8>,
    },
    Nsec3 {
        hash_algorithm: u8,
        flags: u8,
        iterations: u16,
        salt: Vec<u8>,
        next_hashed: Vec<u8>,
        type_bitmaps: Vec<u8>,
    },
    Tsig {
        algorithm: Name,
        /// Seconds since the epoch, 48 bits on the wire.
        time_signed: u64,
        fudge: u16,
        mac: Vec<u8>,
        original_id: u16,
        error: u16,
        other: Vec<u8>,
    },
    Unknown {
        rtype: u16,
        data: Vec<u8>,
    },
}

impl RData {
    /// The record type of this rdata.
    pub fn rtype(&self) -> RType {
        match self {
            Self::A(_) => RType::A,
            Self::Aaaa(_) => RType::Aaaa,
            Self::Ns(_) => RType::Ns,
            Self::Cname(_) => RType::Cname,
            Self::Ptr(_) => RType::Ptr,
            Self::Soa { .. } => RType::Soa,
            Self::Mx { .. } => RType::Mx,
            Self::Txt(_) => RType::Txt,
            Self::Srv { .. } => RType::Srv,
            Self::Naptr { .. } => RType::Naptr,
            Self::Sshfp { .. } => RType::Sshfp,
            Self::Tlsa { .. } => RType::Tlsa,
            Self::Svcb { .. } => RType::Svcb,
            Self::Https { .. } => RType::Https,
            Self::Opt(_) => RType::Opt,
            Self::Ds { .. } => RType::Ds,
            Self::Dnskey { .. } => RType::Dnskey,
            Self::Rrsig { .. } => RType::Rrsig,
            Self::Nsec { .. } => RType::Nsec,
            Self::Nsec3 { .. } => RType::Nsec3,
            Self::Tsig { .. } => RType::Tsig,
            Self::Unknown { rtype, .. } => RType::from(*rtype),
        }
    }

    fn decode(
        rtype: RType,
        class: Class,
        ttl: u32,
        r: &mut Reader<'_>,
        rdlen: usize,
    ) -> Result<Self, DecodeError> {
        let end = r.pos() + rdlen;
        if end > r.limit() {
            return Err(DecodeError::Truncated);
        }

        let data = match rtype {
            RType::A => Self::A(Ipv4Addr::from(r.u32()?)),
            RType::Aaaa => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(r.bytes(16)?);
                Self::Aaaa(Ipv6Addr::from(octets))
            }
            RType::Ns => Self::Ns(r.name()?),
            RType::Cname => Self::Cname(r.name()?),
            RType::Ptr => Self::Ptr(r.name()?),
            RType::Soa => Self::Soa {
                mname: r.name()?,
                rname: r.name()?,
                serial: r.u32()?,
                refresh: r.u32()?,
                retry: r.u32()?,
                expire: r.u32()?,
                minimum: r.u32()?,
            },
            RType::Mx => Self::Mx {
                preference: r.u16()?,
                exchange: r.name()?,
            },
            RType::Txt => {
                let mut strings = Vec::new();
                while r.pos() < end {
                    let len = r.u8()? as usize;
                    strings.push(r.bytes(len)?.to_vec());
                }
                Self::Txt(strings)
            }
            RType::Srv => Self::Srv {
                priority: r.u16()?,
                weight: r.u16()?,
                port: r.u16()?,
                target: r.name()?,
            },
            RType::Naptr => Self::Naptr {
                order: r.u16()?,
                preference: r.u16()?,
                flags: r.char_string()?,
                services: r.char_string()?,
                regexp: r.char_string()?,
                replacement: r.name()?,
            },
            RType::Sshfp => Self::Sshfp {
                algorithm: r.u8()?,
                fingerprint_type: r.u8()?,
                fingerprint: r.bytes_until(end)?,
            },
            RType::Tlsa => Self::Tlsa {
                usage: r.u8()?,
                selector: r.u8()?,
                matching_type: r.u8()?,
                data: r.bytes_until(end)?,
            },
            RType::Svcb => Self::Svcb {
                priority: r.u16()?,
                target: r.name()?,
                params: r.bytes_until(end)?,
            },
            RType::Https => Self::Https {
                priority: r.u16()?,
                target: r.name()?,
                params: r.bytes_until(end)?,
            },
            RType::Opt => Self::Opt(Edns::from_wire(
                class.into(),
                ttl,
                r.bytes_until(end)?,
            )),
            RType::Ds => Self::Ds {
                key_tag: r.u16()?,
                algorithm: r.u8()?,
                digest_type: r.u8()?,
                digest: r.bytes_until(end)?,
            },
            RType::Dnskey => Self::Dnskey {
                flags: r.u16()?,
                protocol: r.u8()?,
                algorithm: r.u8()?,
                public_key: r.bytes_until(end)?,
            },
            RType::Rrsig => Self::Rrsig {
                type_covered: RType::from(r.u16()?),
                algorithm: r.u8()?,
                labels: r.u8()?,
                original_ttl: r.u32()?,
                expiration: r.u32()?,
                inception: r.u32()?,
                key_tag: r.u16()?,
                signer: r.name()?,
                signature: r.bytes_until(end)?,
            },
            RType::Nsec => Self::Nsec {
                next: r.name()?,
                type_bitmaps: r.bytes_until(end)?,
            },
            RType::Nsec3 => {
                let hash_algorithm = r.u8()?;
                let flags = r.u8()?;
                let iterations = r.u16()?;
                let salt_len = r.u8()? as usize;
                let salt = r.bytes(salt_len)?.to_vec();
                let hash_len = r.u8()? as usize;
                let next_hashed = r.bytes(hash_len)?.to_vec();
                Self::Nsec3 {
                    hash_algorithm,
                    flags,
                    iterations,
                    salt,
                    next_hashed,
                    type_bitmaps: r.bytes_until(end)?,
                }
            }
            RType::Tsig => {
                let algorithm = r.name()?;
                let time_signed = r.u48()?;
                let fudge = r.u16()?;
                let mac_len = r.u16()? as usize;
                let mac = r.bytes(mac_len)?.to_vec();
                let original_id = r.u16()?;
                let error = r.u16()?;
                let other_len = r.u16()? as usize;
                let other = r.bytes(other_len)?.to_vec();
                Self::Tsig {
                    algorithm,
                    time_signed,
                    fudge,
                    mac,
                    original_id,
                    error,
                    other,
                }
            }
            _ => Self::Unknown {
                rtype: rtype.into(),
                data: r.bytes_until(end)?,
            },
        };

        if r.pos() != end {
            return Err(DecodeError::BadRdata(rtype.into()));
        }
        Ok(data)
    }

    fn encode_body(&self, enc: &mut Encoder) {
        match self {
            Self::A(addr) => enc.bytes(&addr.octets()),
            Self::Aaaa(addr) => enc.bytes(&addr.octets()),
            // NS, CNAME, PTR, SOA and MX targets may compress (RFC 1035);
            // everything else is written verbatim (RFC 3597).
            Self::Ns(name) | Self::Cname(name) | Self::Ptr(name) => {
                enc.name_compressed(name);
            }
            Self::Soa {
                mname,
                rname,
                serial,
                refresh,
                retry,
                expire,
                minimum,
            } => {
                enc.name_compressed(mname);
                enc.name_compressed(rname);
                enc.u32(*serial);
                enc.u32(*refresh);
                enc.u32(*retry);
                enc.u32(*expire);
                enc.u32(*minimum);
            }
            Self::Mx {
                preference,
                exchange,
            } => {
                enc.u16(*preference);
                enc.name_compressed(exchange);
            }
            Self::Txt(strings) => {
                for s in strings {
                    enc.u8(s.len() as u8);
                    enc.bytes(s);
                }
            }
            Self::Srv {
                priority,
                weight,
                port,
                target,
            } => {
                enc.u16(*priority);
                enc.u16(*weight);
                enc.u16(*port);
                enc.name_uncompressed(target);
            }
            Self::Naptr {
                order,
                preference,
                flags,
                services,
                regexp,
                replacement,
            } => {
                enc.u16(*order);
                enc.u16(*preference);
                enc.char_string(flags);
                enc.char_string(services);
                enc.char_string(regexp);
                enc.name_uncompressed(replacement);
            }
            Self::Sshfp {
                algorithm,
                fingerprint_type,
                fingerprint,
            } => {
                enc.u8(*algorithm);
                enc.u8(*fingerprint_type);
                enc.bytes(fingerprint);
            }
            Self::Tlsa {
                usage,
                selector,
                matching_type,
                data,
            } => {
                enc.u8(*usage);
                enc.u8(*selector);
                enc.u8(*matching_type);
                enc.bytes(data);
            }
            Self::Svcb {
                priority,
                target,
                params,
            }
            | Self::Https {
                priority,
                target,
                params,
            } => {
                enc.u16(*priority);
                enc.name_uncompressed(target);
                enc.bytes(params);
            }
            Self::Opt(edns) => enc.bytes(&edns.options),
            Self::Ds {
                key_tag,
                algorithm,
                digest_type,
                digest,
            } => {
                enc.u16(*key_tag);
                enc.u8(*algorithm);
                enc.u8(*digest_type);
                enc.bytes(digest);
            }
            Self::Dnskey {
                flags,
                protocol,
                algorithm,
                public_key,
            } => {
                enc.u16(*flags);
                enc.u8(*protocol);
                enc.u8(*algorithm);
                enc.bytes(public_key);
            }
            Self::Rrsig {
                type_covered,
                algorithm,
                labels,
                original_ttl,
                expiration,
                inception,
                key_tag,
                signer,
                signature,
            } => {
                enc.u16((*type_covered).into());
                enc.u8(*algorithm);
                enc.u8(*labels);
                enc.u32(*original_ttl);
                enc.u32(*expiration);
                enc.u32(*inception);
                enc.u16(*key_tag);
                enc.name_uncompressed(signer);
                enc.bytes(signature);
            }
            Self::Nsec {
                next,
                type_bitmaps,
            } => {
                enc.name_uncompressed(next);
                enc.bytes(type_bitmaps);
            }
            Self::Nsec3 {
                hash_algorithm,
                flags,
                iterations,
                salt,
                next_hashed,
                type_bitmaps,
            } => {
                enc.u8(*hash_algorithm);
                enc.u8(*flags);
                enc.u16(*iterations);
                enc.u8(salt.len() as u8);
                enc.bytes(salt);
                enc.u8(next_hashed.len() as u8);
                enc.bytes(next_hashed);
                enc.bytes(type_bitmaps);
            }
            Self::Tsig {
                algorithm,
                time_signed,
                fudge,
                mac,
                original_id,
                error,
                other,
            } => {
                enc.name_uncompressed(algorithm);
                enc.u48(*time_signed);
                enc.u16(*fudge);
                enc.u16(mac.len() as u16);
                enc.bytes(mac);
                enc.u16(*original_id);
                enc.u16(*error);
                enc.u16(other.len() as u16);
                enc.bytes(other);
            }
            Self::Unknown { data, .. } => enc.bytes(data),
        }
    }

    /// The rdata in canonical wire form (no compression; names are already
    /// lower-case by construction).
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut enc = Encoder::uncompressed();
        self.encode_body(&mut enc);
        enc.into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_rdata_never_compresses() {
        let rdata = RData::Mx {
            preference: 10,
            exchange: "mail.example.com".parse().unwrap(),
        };
        let bytes = rdata.canonical_bytes();
        assert_eq!(
            bytes,
            [
                &[0, 10][..],
                b"\x04mail\x07example\x03com\x00",
            ]
            .concat()
        );
    }

    #[test]
    fn txt_strings_are_length_prefixed() {
        let rdata = RData::Txt(vec![b"hello".to_vec(), b"world".to_vec()]);
        assert_eq!(rdata.canonical_bytes(), b"\x05hello\x05world");
    }
}

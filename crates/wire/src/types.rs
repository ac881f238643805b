//! Protocol enumerations.

use std::fmt;
use std::str::FromStr;

//----------- RType ------------------------------------------------------------

/// A resource record type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RType {
    A,
    Ns,
    Cname,
    Soa,
    Ptr,
    Mx,
    Txt,
    Aaaa,
    Srv,
    Naptr,
    Sshfp,
    Opt,
    Ds,
    Rrsig,
    Nsec,
    Dnskey,
    Nsec3,
    Tlsa,
    Svcb,
    Https,
    Tsig,
    Ixfr,
    Axfr,
    Any,
    Unknown(u16),
}

impl From<u16> for RType {
    fn from(value: u16) -> Self {
        match value {
            1 => Self::A,
            2 => Self::Ns,
            5 => Self::Cname,
            6 => Self::Soa,
            12 => Self::Ptr,
            15 => Self::Mx,
            16 => Self::Txt,
            28 => Self::Aaaa,
            33 => Self::Srv,
            35 => Self::Naptr,
            44 => Self::Sshfp,
            41 => Self::Opt,
            43 => Self::Ds,
            46 => Self::Rrsig,
            47 => Self::Nsec,
            48 => Self::Dnskey,
            50 => Self::Nsec3,
            52 => Self::Tlsa,
            64 => Self::Svcb,
            65 => Self::Https,
            250 => Self::Tsig,
            251 => Self::Ixfr,
            252 => Self::Axfr,
            255 => Self::Any,
            other => Self::Unknown(other),
        }
    }
}

impl From<RType> for u16 {
    fn from(value: RType) -> Self {
        match value {
            RType::A => 1,
            RType::Ns => 2,
            RType::Cname => 5,
            RType::Soa => 6,
            RType::Ptr => 12,
            RType::Mx => 15,
            RType::Txt => 16,
            RType::Aaaa => 28,
            RType::Srv => 33,
            RType::Naptr => 35,
            RType::Sshfp => 44,
            RType::Opt => 41,
            RType::Ds => 43,
            RType::Rrsig => 46,
            RType::Nsec => 47,
            RType::Dnskey => 48,
            RType::Nsec3 => 50,
            RType::Tlsa => 52,
            RType::Svcb => 64,
            RType::Https => 65,
            RType::Tsig => 250,
            RType::Ixfr => 251,
            RType::Axfr => 252,
            RType::Any => 255,
            RType::Unknown(other) => other,
        }
    }
}

impl fmt::Display for RType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::A => f.write_str("A"),
            Self::Ns => f.write_str("NS"),
            Self::Cname => f.write_str("CNAME"),
            Self::Soa => f.write_str("SOA"),
            Self::Ptr => f.write_str("PTR"),
            Self::Mx => f.write_str("MX"),
            Self::Txt => f.write_str("TXT"),
            Self::Aaaa => f.write_str("AAAA"),
            Self::Srv => f.write_str("SRV"),
            Self::Naptr => f.write_str("NAPTR"),
            Self::Sshfp => f.write_str("SSHFP"),
            Self::Opt => f.write_str("OPT"),
            Self::Ds => f.write_str("DS"),
            Self::Rrsig => f.write_str("RRSIG"),
            Self::Nsec => f.write_str("NSEC"),
            Self::Dnskey => f.write_str("DNSKEY"),
            Self::Nsec3 => f.write_str("NSEC3"),
            Self::Tlsa => f.write_str("TLSA"),
            Self::Svcb => f.write_str("SVCB"),
            Self::Https => f.write_str("HTTPS"),
            Self::Tsig => f.write_str("TSIG"),
            Self::Ixfr => f.write_str("IXFR"),
            Self::Axfr => f.write_str("AXFR"),
            Self::Any => f.write_str("ANY"),
            Self::Unknown(n) => write!(f, "TYPE{n}"),
        }
    }
}

impl FromStr for RType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "A" => Ok(Self::A),
            "NS" => Ok(Self::Ns),
            "CNAME" => Ok(Self::Cname),
            "SOA" => Ok(Self::Soa),
            "PTR" => Ok(Self::Ptr),
            "MX" => Ok(Self::Mx),
            "TXT" => Ok(Self::Txt),
            "AAAA" => Ok(Self::Aaaa),
            "SRV" => Ok(Self::Srv),
            "NAPTR" => Ok(Self::Naptr),
            "SSHFP" => Ok(Self::Sshfp),
            "DS" => Ok(Self::Ds),
            "RRSIG" => Ok(Self::Rrsig),
            "NSEC" => Ok(Self::Nsec),
            "DNSKEY" => Ok(Self::Dnskey),
            "NSEC3" => Ok(Self::Nsec3),
            "TLSA" => Ok(Self::Tlsa),
            "SVCB" => Ok(Self::Svcb),
            "HTTPS" => Ok(Self::Https),
            "ANY" => Ok(Self::Any),
            other => other
                .strip_prefix("TYPE")
                .and_then(|n| n.parse::<u16>().ok())
                .map(Self::from)
                .ok_or(()),
        }
    }
}

//----------- Class ------------------------------------------------------------

/// A resource record class.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Class {
    In,
    Ch,
    Hs,
    None,
    Any,
    Unknown(u16),
}

impl From<u16> for Class {
    fn from(value: u16) -> Self {
        match value {
            1 => Self::In,
            3 => Self::Ch,
            4 => Self::Hs,
            254 => Self::None,
            255 => Self::Any,
            other => Self::Unknown(other),
        }
    }
}

impl From<Class> for u16 {
    fn from(value: Class) -> Self {
        match value {
            Class::In => 1,
            Class::Ch => 3,
            Class::Hs => 4,
            Class::None => 254,
            Class::Any => 255,
            Class::Unknown(other) => other,
        }
    }
}

impl fmt::Display for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::In => f.write_str("IN"),
            Self::Ch => f.write_str("CH"),
            Self::Hs => f.write_str("HS"),
            Self::None => f.write_str("NONE"),
            Self::Any => f.write_str("ANY"),
            Self::Unknown(n) => write!(f, "CLASS{n}"),
        }
    }
}

//----------- Opcode -----------------------------------------------------------

/// A message opcode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Opcode {
    Query,
    Status,
    Notify,
    Update,
    Unknown(u8),
}

impl From<u8> for Opcode {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Query,
            2 => Self::Status,
            4 => Self::Notify,
            5 => Self::Update,
            other => Self::Unknown(other & 0xf),
        }
    }
}

impl From<Opcode> for u8 {
    fn from(value: Opcode) -> Self {
        match value {
            Opcode::Query => 0,
            Opcode::Status => 2,
            Opcode::Notify => 4,
            Opcode::Update => 5,
            Opcode::Unknown(other) => other,
        }
    }
}

//----------- Rcode ------------------------------------------------------------

/// A response code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rcode {
    NoError,
    FormErr,
    ServFail,
    NxDomain,
    NotImp,
    Refused,
    YxDomain,
    NotAuth,
    NotZone,
    Unknown(u8),
}

impl From<u8> for Rcode {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::NoError,
            1 => Self::FormErr,
            2 => Self::ServFail,
            3 => Self::NxDomain,
            4 => Self::NotImp,
            5 => Self::Refused,
            6 => Self::YxDomain,
            9 => Self::NotAuth,
            10 => Self::NotZone,
            other => Self::Unknown(other & 0xf),
        }
    }
}

impl From<Rcode> for u8 {
    fn from(value: Rcode) -> Self {
        match value {
            Rcode::NoError => 0,
            Rcode::FormErr => 1,
            Rcode::ServFail => 2,
            Rcode::NxDomain => 3,
            Rcode::NotImp => 4,
            Rcode::Refused => 5,
            Rcode::YxDomain => 6,
            Rcode::NotAuth => 9,
            Rcode::NotZone => 10,
            Rcode::Unknown(other) => other,
        }
    }
}

impl fmt::Display for Rcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoError => f.write_str("NOERROR"),
            Self::FormErr => f.write_str("FORMERR"),
            Self::ServFail => f.write_str("SERVFAIL"),
            Self::NxDomain => f.write_str("NXDOMAIN"),
            Self::NotImp => f.write_str("NOTIMP"),
            Self::Refused => f.write_str("REFUSED"),
            Self::YxDomain => f.write_str("YXDOMAIN"),
            Self::NotAuth => f.write_str("NOTAUTH"),
            Self::NotZone => f.write_str("NOTZONE"),
            Self::Unknown(n) => write!(f, "RCODE{n}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rtype_u16_round_trip() {
        for n in 0..=300u16 {
            assert_eq!(u16::from(RType::from(n)), n);
        }
    }

    #[test]
    fn rtype_text_forms() {
        assert_eq!("aaaa".parse::<RType>(), Ok(RType::Aaaa));
        assert_eq!("TYPE64".parse::<RType>(), Ok(RType::Svcb));
        assert_eq!("TYPE1234".parse::<RType>(), Ok(RType::Unknown(1234)));
        assert_eq!(RType::Unknown(1234).to_string(), "TYPE1234");
    }

    #[test]
    fn class_u16_round_trip() {
        for n in [1u16, 3, 4, 254, 255, 42] {
            assert_eq!(u16::from(Class::from(n)), n);
        }
    }
}

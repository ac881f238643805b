//! The DNS wire-format codec.
//!
//! Everything here is synchronous and allocation-only: parsing and
//! serialising RFC 1035 messages with EDNS(0), name compression and the
//! DNSSEC/TSIG record types.  Transport, caching and policy live in the
//! daemon crate.

use std::fmt;

pub mod edns;
pub mod message;
pub mod name;
pub mod rdata;
pub mod types;

pub use edns::{Edns, DEFAULT_UDP_PAYLOAD, EDNS_FLAG_DO};
pub use message::{Flags, Header, Message, Question, MAX_MESSAGE_LEN};
pub use name::{Name, NameError};
pub use rdata::{RData, Record};
pub use types::{Class, Opcode, RType, Rcode};

//----------- DecodeError ------------------------------------------------------

/// An error decoding a message.
///
/// All variants map to FORMERR at the server boundary; they are
/// distinguished for logging and tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeError {
    /// The input ended before the structure did.
    Truncated,

    /// The input exceeds the 65535-octet message limit.
    TooLarge,

    /// A label carried a reserved type tag.
    BadLabel,

    /// A name exceeded 255 octets after decompression.
    NameTooLong,

    /// A compression pointer did not jump strictly backwards.
    BadPointer,

    /// An rdata section was inconsistent with its rdlength.
    BadRdata(u16),
}

impl std::error::Error for DecodeError {}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => f.write_str("message truncated"),
            Self::TooLarge => f.write_str("message exceeds 65535 octets"),
            Self::BadLabel => f.write_str("invalid label type"),
            Self::NameTooLong => f.write_str("name exceeds 255 octets"),
            Self::BadPointer => f.write_str("invalid compression pointer"),
            Self::BadRdata(rtype) => write!(f, "malformed rdata for type {rtype}"),
        }
    }
}

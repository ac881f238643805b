//! DNS messages and the wire codec driver.

use std::collections::HashMap;

use crate::edns::Edns;
use crate::name::{parse_name, Name};
use crate::rdata::{RData, Record};
use crate::types::{Class, Opcode, RType, Rcode};
use crate::DecodeError;

/// The largest message the codec will accept or produce.
pub const MAX_MESSAGE_LEN: usize = 65535;

//----------- Flags ------------------------------------------------------------

/// The boolean flags of a message header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Flags {
    /// This message is a response.
    pub qr: bool,
    /// Authoritative answer.
    pub aa: bool,
    /// Truncated; retry over TCP.
    pub tc: bool,
    /// Recursion desired.
    pub rd: bool,
    /// Recursion available.
    pub ra: bool,
    /// Authenticated data (DNSSEC).
    pub ad: bool,
    /// Checking disabled (DNSSEC).
    pub cd: bool,
}

//----------- Header -----------------------------------------------------------

/// A message header.
///
/// The count fields are not stored; they are derived from the section
/// vectors at encode time, which keeps them consistent by construction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Header {
    pub id: u16,
    pub opcode: Opcode,
    pub flags: Flags,
    pub rcode: Rcode,
}

impl Default for Opcode {
    fn default() -> Self {
        Self::Query
    }
}

impl Default for Rcode {
    fn default() -> Self {
        Self::NoError
    }
}

impl Header {
    fn decode(r: &mut Reader<'_>) -> Result<(Self, [u16; 4]), DecodeError> {
        let id = r.u16()?;
        let bits = r.u16()?;
        let counts = [r.u16()?, r.u16()?, r.u16()?, r.u16()?];
        let header = Self {
            id,
            opcode: Opcode::from(((bits >> 11) & 0xf) as u8),
            flags: Flags {
                qr: bits & 0x8000 != 0,
                aa: bits & 0x0400 != 0,
                tc: bits & 0x0200 != 0,
                rd: bits & 0x0100 != 0,
                ra: bits & 0x0080 != 0,
                ad: bits & 0x0020 != 0,
                cd: bits & 0x0010 != 0,
            },
            rcode: Rcode::from((bits & 0xf) as u8),
        };
        Ok((header, counts))
    }

    fn encode(&self, enc: &mut Encoder, counts: [u16; 4]) {
        let f = &self.flags;
        let mut bits = (u8::from(self.opcode) as u16) << 11;
        bits |= (u8::from(self.rcode) as u16) & 0xf;
        bits |= (f.qr as u16) << 15;
        bits |= (f.aa as u16) << 10;
        bits |= (f.tc as u16) << 9;
        bits |= (f.rd as u16) << 8;
        bits |= (f.ra as u16) << 7;
        bits |= (f.ad as u16) << 5;
        bits |= (f.cd as u16) << 4;
        enc.u16(self.id);
        enc.u16(bits);
        for count in counts {
            enc.u16(count);
        }
    }
}

//----------- Question ---------------------------------------------------------

/// A question.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Question {
    pub qname: Name,
    pub qtype: RType,
    pub qclass: Class,
}

impl Question {
    pub fn new(qname: Name, qtype: RType) -> Self {
        Self {
            qname,
            qtype,
            qclass: Class::In,
        }
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            qname: r.name()?,
            qtype: RType::from(r.u16()?),
            qclass: Class::from(r.u16()?),
        })
    }

    fn encode(&self, enc: &mut Encoder) {
        enc.name_compressed(&self.qname);
        enc.u16(self.qtype.into());
        enc.u16(self.qclass.into());
    }
}

//----------- Message ----------------------------------------------------------

/// A DNS message.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Message {
    pub header: Header,
    pub questions: Vec<Question>,
    pub answers: Vec<Record>,
    pub authorities: Vec<Record>,
    pub additionals: Vec<Record>,
}

impl Message {
    /// Build a recursive query for a single question.
    pub fn query(id: u16, qname: Name, qtype: RType) -> Self {
        Self {
            header: Header {
                id,
                flags: Flags {
                    rd: true,
                    ..Default::default()
                },
                ..Default::default()
            },
            questions: vec![Question::new(qname, qtype)],
            ..Default::default()
        }
    }

    /// Start a response to `query`: same id and opcode, question echoed,
    /// RD copied, QR and RA set.
    pub fn reply_to(query: &Message) -> Self {
        Self {
            header: Header {
                id: query.header.id,
                opcode: query.header.opcode,
                flags: Flags {
                    qr: true,
                    rd: query.header.flags.rd,
                    ra: true,
                    cd: query.header.flags.cd,
                    ..Default::default()
                },
                rcode: Rcode::NoError,
            },
            questions: query.questions.clone(),
            ..Default::default()
        }
    }

    /// The first (and on the live path, only) question.
    pub fn question(&self) -> Option<&Question> {
        self.questions.first()
    }

    /// The EDNS(0) block from the additional section, if present.
    pub fn edns(&self) -> Option<&Edns> {
        self.additionals.iter().find_map(|r| match &r.data {
            RData::Opt(edns) => Some(edns),
            _ => None,
        })
    }

    /// Decode a message.
    ///
    /// Trailing octets past the counted records are ignored, as resolvers
    /// conventionally do.
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() > MAX_MESSAGE_LEN {
            return Err(DecodeError::TooLarge);
        }
        let mut r = Reader::new(buf);
        let (header, counts) = Header::decode(&mut r)?;

        let mut questions = Vec::with_capacity(counts[0].min(16) as usize);
        for _ in 0..counts[0] {
            questions.push(Question::decode(&mut r)?);
        }

        let mut sections: [Vec<Record>; 3] = Default::default();
        for (section, count) in sections.iter_mut().zip(&counts[1..]) {
            for _ in 0..*count {
                section.push(Record::decode(&mut r)?);
            }
        }
        let [answers, authorities, additionals] = sections;

        Ok(Self {
            header,
            questions,
            answers,
            authorities,
            additionals,
        })
    }

    /// Encode without a size limit (TCP, DoT, DoH).
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::compressed();
        self.encode_into(&mut enc);
        enc.into_bytes()
    }

    /// Encode with a size limit (UDP).
    ///
    /// If the full encoding exceeds `max_size`, only the header and the
    /// question survive, with TC set; the OPT record is kept when it still
    /// fits so the client learns our payload size.
    pub fn encode_with_limit(&self, max_size: usize) -> Vec<u8> {
        let full = self.encode();
        if full.len() <= max_size {
            return full;
        }

        let mut truncated = Message {
            header: self.header,
            questions: self.questions.clone(),
            answers: Vec::new(),
            authorities: Vec::new(),
            additionals: self
                .additionals
                .iter()
                .filter(|r| r.rtype() == RType::Opt)
                .cloned()
                .collect(),
        };
        truncated.header.flags.tc = true;

        let bytes = truncated.encode();
        if bytes.len() <= max_size {
            return bytes;
        }
        truncated.additionals.clear();
        truncated.encode()
    }

    fn encode_into(&self, enc: &mut Encoder) {
        let counts = [
            self.questions.len() as u16,
            self.answers.len() as u16,
            self.authorities.len() as u16,
            self.additionals.len() as u16,
        ];
        self.header.encode(enc, counts);
        for q in &self.questions {
            q.encode(enc);
        }
        for r in self
            .answers
            .iter()
            .chain(&self.authorities)
            .chain(&self.additionals)
        {
            r.encode(enc);
        }
    }
}

/// Locate a trailing TSIG record in a raw message.
///
/// Returns the byte offset at which the TSIG record's owner name starts,
/// if the final additional record is of type TSIG.  TSIG MACs cover the
/// message up to exactly this offset (with the ID and ARCOUNT fixed up),
/// so the caller needs the raw boundary rather than the decoded form.
pub fn tsig_boundary(buf: &[u8]) -> Result<Option<usize>, DecodeError> {
    let mut r = Reader::new(buf);
    let (_, counts) = Header::decode(&mut r)?;
    let arcount = counts[3];
    if arcount == 0 {
        return Ok(None);
    }

    for _ in 0..counts[0] {
        r.name()?;
        r.bytes(4)?;
    }
    let records = counts[1] as usize + counts[2] as usize + arcount as usize;
    let mut boundary = None;
    for i in 0..records {
        let start = r.pos();
        r.name()?;
        let rtype = r.u16()?;
        r.bytes(8)?; // class, ttl, rdlength
        let rdlen = u16::from_be_bytes(buf[r.pos() - 2..r.pos()].try_into().unwrap());
        r.bytes(rdlen as usize)?;
        if i == records - 1 && RType::from(rtype) == RType::Tsig {
            boundary = Some(start);
        }
    }
    Ok(boundary)
}

//----------- Reader -----------------------------------------------------------

/// A cursor over a whole message.
///
/// Carries the full buffer so that embedded names can resolve compression
/// pointers against it.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn limit(&self) -> usize {
        self.buf.len()
    }

    pub fn u8(&mut self) -> Result<u8, DecodeError> {
        let b = *self.buf.get(self.pos).ok_or(DecodeError::Truncated)?;
        self.pos += 1;
        Ok(b)
    }

    pub fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_be_bytes(
            self.bytes(2)?.try_into().unwrap(),
        ))
    }

    pub fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_be_bytes(
            self.bytes(4)?.try_into().unwrap(),
        ))
    }

    pub fn u48(&mut self) -> Result<u64, DecodeError> {
        let hi = self.u16()? as u64;
        let lo = self.u32()? as u64;
        Ok(hi << 32 | lo)
    }

    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let slice = self
            .buf
            .get(self.pos..self.pos + len)
            .ok_or(DecodeError::Truncated)?;
        self.pos += len;
        Ok(slice)
    }

    /// The remaining bytes up to `end`, which must not lie behind the
    /// cursor.
    pub fn bytes_until(&mut self, end: usize) -> Result<Vec<u8>, DecodeError> {
        let len = end
            .checked_sub(self.pos)
            .ok_or(DecodeError::Truncated)?;
        Ok(self.bytes(len)?.to_vec())
    }

    /// A single length-prefixed character-string.
    pub fn char_string(&mut self) -> Result<Vec<u8>, DecodeError> {
        let len = self.u8()? as usize;
        Ok(self.bytes(len)?.to_vec())
    }

    pub fn name(&mut self) -> Result<Name, DecodeError> {
        let (name, end) = parse_name(self.buf, self.pos)?;
        self.pos = end;
        Ok(name)
    }
}

//----------- Encoder ----------------------------------------------------------

/// A message encoder with optional name compression.
pub(crate) struct Encoder {
    buf: Vec<u8>,
    /// Offsets of previously written name suffixes, keyed by label
    /// sequence.  `None` disables compression (canonical form).
    offsets: Option<HashMap<Vec<Box<[u8]>>, u16>>,
}

impl Encoder {
    pub fn compressed() -> Self {
        Self {
            buf: Vec::with_capacity(512),
            offsets: Some(HashMap::new()),
        }
    }

    pub fn uncompressed() -> Self {
        Self {
            buf: Vec::new(),
            offsets: None,
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn u48(&mut self, v: u64) {
        self.u16((v >> 32) as u16);
        self.u32(v as u32);
    }

    pub fn bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    pub fn char_string(&mut self, v: &[u8]) {
        self.u8(v.len() as u8);
        self.bytes(v);
    }

    pub fn name_uncompressed(&mut self, name: &Name) {
        name.write_uncompressed(&mut self.buf);
    }

    /// Write a name, compressing against previously written names where
    /// possible and registering new suffixes for later reuse.
    pub fn name_compressed(&mut self, name: &Name) {
        if self.offsets.is_none() {
            return self.name_uncompressed(name);
        }
        let Self { buf, offsets } = self;
        let offsets = offsets.as_mut().unwrap();

        let labels = name.labels();
        let mut split = labels.len();
        let mut pointer = None;
        for i in 0..labels.len() {
            if let Some(&off) = offsets.get(&labels[i..]) {
                split = i;
                pointer = Some(off);
                break;
            }
        }

        for i in 0..split {
            let off = buf.len();
            if off < 0x4000 {
                offsets.insert(labels[i..].to_vec(), off as u16);
            }
            buf.push(labels[i].len() as u8);
            buf.extend_from_slice(&labels[i]);
        }

        match pointer {
            Some(off) => buf.extend_from_slice(&(0xc000 | off).to_be_bytes()),
            None => buf.push(0),
        }
    }

    /// Reserve the rdlength field; returns a mark for [`patch_rdlen`].
    ///
    /// [`patch_rdlen`]: Self::patch_rdlen
    pub fn rdlen_placeholder(&mut self) -> usize {
        let mark = self.buf.len();
        self.u16(0);
        mark
    }

    pub fn patch_rdlen(&mut self, mark: usize) {
        let len = (self.buf.len() - mark - 2) as u16;
        self.buf[mark..mark + 2].copy_from_slice(&len.to_be_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message() -> Message {
        let mut msg = Message::query(0x1234, "example.com".parse().unwrap(), RType::A);
        msg.header.flags.qr = true;
        msg.header.flags.ra = true;
        msg.answers.push(Record::new(
            "example.com".parse().unwrap(),
            300,
            RData::A("192.0.2.1".parse().unwrap()),
        ));
        msg.answers.push(Record::new(
            "example.com".parse().unwrap(),
            300,
            RData::Aaaa("2001:db8::1".parse().unwrap()),
        ));
        msg.authorities.push(Record::new(
            "example.com".parse().unwrap(),
            3600,
            RData::Soa {
                mname: "ns1.example.com".parse().unwrap(),
                rname: "hostmaster.example.com".parse().unwrap(),
                serial: 2024010101,
                refresh: 7200,
                retry: 3600,
                expire: 1209600,
                minimum: 300,
            },
        ));
        msg.additionals.push(Record::opt(Edns::new(4096)));
        msg
    }

    #[test]
    fn decode_encode_round_trips() {
        let msg = sample_message();
        let wire = msg.encode();
        let decoded = Message::decode(&wire).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.encode(), wire);
    }

    #[test]
    fn compression_shrinks_repeated_names() {
        let msg = sample_message();
        let compressed = msg.encode().len();

        let mut enc = Encoder::uncompressed();
        msg.encode_into(&mut enc);
        let flat = enc.into_bytes().len();

        assert!(compressed < flat);
    }

    #[test]
    fn oversized_responses_truncate_to_question() {
        let mut msg = sample_message();
        for i in 0..100 {
            msg.answers.push(Record::new(
                format!("host{i}.example.com").parse().unwrap(),
                60,
                RData::A("192.0.2.7".parse().unwrap()),
            ));
        }

        let wire = msg.encode_with_limit(512);
        assert!(wire.len() <= 512);

        let decoded = Message::decode(&wire).unwrap();
        assert!(decoded.header.flags.tc);
        assert!(decoded.answers.is_empty());
        assert_eq!(decoded.questions, msg.questions);
        assert_eq!(decoded.edns().map(|e| e.udp_size), Some(4096));
    }

    #[test]
    fn malformed_inputs_fail_cleanly() {
        // Short header.
        assert!(Message::decode(&[0u8; 11]).is_err());

        // A question whose name never terminates.
        let mut buf = vec![0u8; 12];
        buf[5] = 1; // qdcount = 1
        buf.push(63);
        assert_eq!(Message::decode(&buf), Err(DecodeError::Truncated));

        // A compression pointer into itself.
        let mut buf = vec![0u8; 12];
        buf[5] = 1;
        buf.extend_from_slice(&[0xc0, 12, 0, 1, 0, 1]);
        assert_eq!(Message::decode(&buf), Err(DecodeError::BadPointer));
    }

    #[test]
    fn unknown_rdata_is_opaque() {
        let mut msg = Message::query(7, "x.test".parse().unwrap(), RType::Unknown(4242));
        msg.answers.push(Record::new(
            "x.test".parse().unwrap(),
            60,
            RData::Unknown {
                rtype: 4242,
                data: vec![0xde, 0xad, 0xbe, 0xef],
            },
        ));
        let wire = msg.encode();
        let decoded = Message::decode(&wire).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn tsig_rdata_round_trips() {
        let mut msg = Message::query(9, "transfer.example".parse().unwrap(), RType::Axfr);
        msg.additionals.push(Record {
            name: "transfer-key".parse().unwrap(),
            class: Class::Any,
            ttl: 0,
            data: RData::Tsig {
                algorithm: "hmac-sha256".parse().unwrap(),
                time_signed: 1_700_000_000,
                fudge: 300,
                mac: vec![0xab; 32],
                original_id: 9,
                error: 0,
                other: Vec::new(),
            },
        });
        let wire = msg.encode();
        assert_eq!(Message::decode(&wire).unwrap(), msg);
    }
}

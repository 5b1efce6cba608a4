//! Hand-rolled DNS wire codec for TXT question/answer exchanges.
//!
//! Only what the tunnel needs is supported: decoding the single question of a query and
//! encoding one TXT answer for it. Compression pointers are refused when decoding
//! names; the only pointer ever written is the answer's reference back to the question
//! name at offset 12.
//!
//! The client side, [`encode_query`] and [`decode_txt_answer`], is just enough to ask a
//! server for a TXT record and read it back.
//!
//! ```text
//! +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
//! |                      ID                       |
//! |QR|   Opcode  |AA|TC|RD|RA|   Z    |   RCODE   |
//! |                    QDCOUNT                    |
//! |                    ANCOUNT                    |
//! |                    NSCOUNT                    |
//! |                    ARCOUNT                    |
//! +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
//! ```

use std::fmt;

/// Fixed DNS header length.
pub const HEADER_LEN: usize = 12;
/// Largest label length (RFC 1035 2.3.4).
pub const MAX_LABEL_LEN: usize = 63;
/// Largest encoded name length, counting length bytes (RFC 1035 2.3.4).
pub const MAX_NAME_LEN: usize = 255;
/// Largest TXT character-string.
pub const MAX_CHARACTER_STRING_LEN: usize = 255;
/// Classic UDP payload limit without EDNS.
pub const MAX_UDP_SIZE: usize = 512;

pub const TYPE_TXT: u16 = 16;
pub const CLASS_IN: u16 = 1;

const FLAG_QR: u16 = 0x8000;
const FLAG_AA: u16 = 0x0400;
const FLAG_TC: u16 = 0x0200;
const FLAG_RD: u16 = 0x0100;
const FLAG_RA: u16 = 0x0080;

const POINTER_MASK: u8 = 0xC0;
/// Compression pointer to the question name, which always starts right after the header.
const QUESTION_NAME_POINTER: [u8; 2] = [0xC0, HEADER_LEN as u8];

/// Reasons a datagram is refused. All of them mean "drop without replying".
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("datagram shorter than a DNS header ({0} bytes)")]
    ShortHeader(usize),
    #[error("datagram is a response, not a query")]
    NotAQuery,
    #[error("query carries no question")]
    NoQuestion,
    #[error("compression pointer in question name")]
    CompressedName,
    #[error("label of {0} bytes exceeds 63")]
    LabelTooLong(usize),
    #[error("name exceeds 255 bytes")]
    NameTooLong,
    #[error("question truncated at offset {0}")]
    Truncated(usize),
    #[error("datagram is a query, not a response")]
    NotAResponse,
    #[error("response carries no TXT answer")]
    NoAnswer,
}

/// The fixed header fields of a DNS message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    pub id: u16,
    pub flags: u16,
    pub qdcount: u16,
    pub ancount: u16,
    pub nscount: u16,
    pub arcount: u16,
}

impl Header {
    /// Parse the header at the start of `buf`.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::ShortHeader`] when `buf` is shorter than 12 bytes.
    pub fn parse(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < HEADER_LEN {
            return Err(DecodeError::ShortHeader(buf.len()));
        }
        let word = |at: usize| u16::from_be_bytes([buf[at], buf[at + 1]]);
        Ok(Self {
            id: word(0),
            flags: word(2),
            qdcount: word(4),
            ancount: word(6),
            nscount: word(8),
            arcount: word(10),
        })
    }

    #[must_use]
    pub fn is_response(&self) -> bool {
        self.flags & FLAG_QR != 0
    }

    #[must_use]
    pub fn is_truncated(&self) -> bool {
        self.flags & FLAG_TC != 0
    }

    #[must_use]
    pub fn is_authoritative(&self) -> bool {
        self.flags & FLAG_AA != 0
    }

    fn write(&self, out: &mut Vec<u8>) {
        for word in [
            self.id,
            self.flags,
            self.qdcount,
            self.ancount,
            self.nscount,
            self.arcount,
        ] {
            out.extend_from_slice(&word.to_be_bytes());
        }
    }
}

/// The single question of a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub header: Header,
    /// Dotted name without the trailing root dot, e.g. `what-is-2-2.ch.at`.
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
    /// Offset one past the question's class field.
    pub end: usize,
}

/// A TXT answer record whose owner is the question name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRecord {
    pub rtype: u16,
    pub rclass: u16,
    pub ttl: u32,
    pub rdata: Vec<u8>,
}

impl ResourceRecord {
    #[must_use]
    pub fn txt(text: &str, ttl: u32) -> Self {
        Self {
            rtype: TYPE_TXT,
            rclass: CLASS_IN,
            ttl,
            rdata: txt_rdata(text.as_bytes()),
        }
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&QUESTION_NAME_POINTER);
        out.extend_from_slice(&self.rtype.to_be_bytes());
        out.extend_from_slice(&self.rclass.to_be_bytes());
        out.extend_from_slice(&self.ttl.to_be_bytes());
        // RDATA beyond u16 can't be expressed; it's cut here and the UDP limit cuts further.
        let rdlength = u16::try_from(self.rdata.len()).unwrap_or(u16::MAX);
        out.extend_from_slice(&rdlength.to_be_bytes());
        out.extend_from_slice(&self.rdata[..usize::from(rdlength)]);
    }
}

impl fmt::Display for Question {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (type {}, class {})", self.name, self.qtype, self.qclass)
    }
}

/// Decode the question of an untrusted query datagram.
///
/// # Errors
///
/// Returns a [`DecodeError`] when the datagram is too short, is a response, carries no
/// question, or its name uses compression, has an over-long label, exceeds 255 bytes or
/// runs past the end of the buffer.
pub fn decode(datagram: &[u8]) -> Result<Question, DecodeError> {
    let header = Header::parse(datagram)?;
    if header.is_response() {
        return Err(DecodeError::NotAQuery);
    }
    if header.qdcount == 0 {
        return Err(DecodeError::NoQuestion);
    }

    let mut pos = HEADER_LEN;
    let mut labels: Vec<String> = Vec::new();
    let mut name_len = 0usize;
    loop {
        let Some(&len_byte) = datagram.get(pos) else {
            return Err(DecodeError::Truncated(pos));
        };
        if len_byte & POINTER_MASK == POINTER_MASK {
            return Err(DecodeError::CompressedName);
        }
        let len = usize::from(len_byte);
        if len == 0 {
            pos += 1;
            break;
        }
        if len > MAX_LABEL_LEN {
            return Err(DecodeError::LabelTooLong(len));
        }
        name_len += len + 1;
        if name_len > MAX_NAME_LEN {
            return Err(DecodeError::NameTooLong);
        }
        let label = datagram
            .get(pos + 1..pos + 1 + len)
            .ok_or(DecodeError::Truncated(pos))?;
        labels.push(String::from_utf8_lossy(label).into_owned());
        pos += 1 + len;
    }

    let fixed = datagram
        .get(pos..pos + 4)
        .ok_or(DecodeError::Truncated(pos))?;
    Ok(Question {
        header,
        name: labels.join("."),
        qtype: u16::from_be_bytes([fixed[0], fixed[1]]),
        qclass: u16::from_be_bytes([fixed[2], fixed[3]]),
        end: pos + 4,
    })
}

/// Build a recursive query for `name` of type `qtype`. Labels longer than 63 bytes are
/// cut to 63.
#[must_use]
pub fn encode_query(id: u16, name: &str, qtype: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + name.len() + 6);
    Header {
        id,
        flags: FLAG_RD,
        qdcount: 1,
        ..Header::default()
    }
    .write(&mut buf);
    for label in name.split('.').filter(|l| !l.is_empty()) {
        let label = &label.as_bytes()[..label.len().min(MAX_LABEL_LEN)];
        // Cut to MAX_LABEL_LEN above.
        buf.push(label.len() as u8);
        buf.extend_from_slice(label);
    }
    buf.push(0);
    buf.extend_from_slice(&qtype.to_be_bytes());
    buf.extend_from_slice(&CLASS_IN.to_be_bytes());
    buf
}

/// Read the text of the first TXT answer in `response`, joining its character-strings.
///
/// # Errors
///
/// Returns a [`DecodeError`] when `response` isn't a response, holds no TXT answer, or
/// is cut short.
pub fn decode_txt_answer(response: &[u8]) -> Result<String, DecodeError> {
    let header = Header::parse(response)?;
    if !header.is_response() {
        return Err(DecodeError::NotAResponse);
    }

    let mut pos = HEADER_LEN;
    for _ in 0..header.qdcount {
        pos = skip_name(response, pos)? + 4;
    }
    for _ in 0..header.ancount {
        pos = skip_name(response, pos)?;
        let fixed = response
            .get(pos..pos + 10)
            .ok_or(DecodeError::Truncated(pos))?;
        let rtype = u16::from_be_bytes([fixed[0], fixed[1]]);
        let rdlength = usize::from(u16::from_be_bytes([fixed[8], fixed[9]]));
        pos += 10;
        let rdata = response
            .get(pos..pos + rdlength)
            .ok_or(DecodeError::Truncated(pos))?;
        pos += rdlength;
        if rtype != TYPE_TXT {
            continue;
        }

        let mut text = Vec::with_capacity(rdlength);
        let mut at = 0;
        while let Some(&len) = rdata.get(at) {
            let chunk = rdata
                .get(at + 1..at + 1 + usize::from(len))
                .ok_or(DecodeError::Truncated(pos - rdlength + at))?;
            text.extend_from_slice(chunk);
            at += 1 + usize::from(len);
        }
        return Ok(String::from_utf8_lossy(&text).into_owned());
    }
    Err(DecodeError::NoAnswer)
}

/// Offset just past the name starting at `pos`. Pointers are followed no further than
/// their own two bytes.
fn skip_name(buf: &[u8], mut pos: usize) -> Result<usize, DecodeError> {
    loop {
        let &len = buf.get(pos).ok_or(DecodeError::Truncated(pos))?;
        if len & POINTER_MASK == POINTER_MASK {
            return if pos + 2 <= buf.len() {
                Ok(pos + 2)
            } else {
                Err(DecodeError::Truncated(pos))
            };
        }
        if len == 0 {
            return Ok(pos + 1);
        }
        pos += 1 + usize::from(len);
    }
}

/// Recover the natural language prompt carried in a query name.
///
/// The configured `suffix` zone and any trailing root dot are stripped, then dashes
/// become spaces: `what-is-2-2.ch.at` is `what is 2 2`.
#[must_use]
pub fn prompt_from_name(name: &str, suffix: &str) -> String {
    let suffix = suffix.trim_matches('.');
    let mut name = name.strip_suffix('.').unwrap_or(name);
    if !suffix.is_empty() {
        if let Some(stripped) = strip_suffix_ignore_case(name, suffix) {
            name = stripped.strip_suffix('.').unwrap_or(stripped);
        }
    }
    name.strip_suffix('.').unwrap_or(name).replace('-', " ")
}

fn strip_suffix_ignore_case<'a>(name: &'a str, suffix: &str) -> Option<&'a str> {
    let split = name.len().checked_sub(suffix.len())?;
    let tail = name.get(split..)?;
    if !tail.eq_ignore_ascii_case(suffix) {
        return None;
    }
    let head = &name[..split];
    // Only strip whole labels: `xch.at` doesn't end in the `ch.at` zone.
    if head.is_empty() || head.ends_with('.') {
        Some(head)
    } else {
        None
    }
}

/// Split `text` into length-prefixed character-strings of at most 255 bytes.
///
/// The final string holds the remainder. Empty text yields empty RDATA.
#[must_use]
pub fn txt_rdata(text: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len() + text.len() / MAX_CHARACTER_STRING_LEN + 1);
    for chunk in text.chunks(MAX_CHARACTER_STRING_LEN) {
        // chunks() never yields more than MAX_CHARACTER_STRING_LEN bytes.
        out.push(chunk.len() as u8);
        out.extend_from_slice(chunk);
    }
    out
}

/// Largest answer, in bytes, whose response to `question` fits in `max_size` bytes.
#[must_use]
pub fn answer_capacity(question: &Question, max_size: usize) -> usize {
    // Pointer, type, class, TTL and RDLENGTH.
    const ANSWER_FIXED_LEN: usize = 2 + 2 + 2 + 4 + 2;
    let room = max_size.saturating_sub(question.end + ANSWER_FIXED_LEN);
    // Every started 255-byte string costs a length byte.
    room - room.div_ceil(MAX_CHARACTER_STRING_LEN + 1)
}

/// Encode the TXT response to `query`, whose question was decoded as `question`.
///
/// The transaction ID and question section are copied verbatim, QR and AA are set and a
/// single TXT answer pointing back at the question name is appended. A response larger
/// than `max_size` is cut to `max_size` bytes and flagged TC; the TXT strings are not
/// re-split, so a client that ignores TC sees a damaged record.
#[must_use]
pub fn encode(query: &[u8], question: &Question, answer: &str, ttl: u32, max_size: usize) -> Vec<u8> {
    let record = ResourceRecord::txt(answer, ttl);
    let header = Header {
        id: question.header.id,
        flags: FLAG_QR | FLAG_AA | FLAG_RA | (question.header.flags & FLAG_RD),
        qdcount: 1,
        ancount: 1,
        nscount: 0,
        arcount: 0,
    };

    let question_section = &query[HEADER_LEN..question.end.min(query.len())];
    let mut out = Vec::with_capacity(
        HEADER_LEN + question_section.len() + 12 + record.rdata.len(),
    );
    header.write(&mut out);
    out.extend_from_slice(question_section);
    record.write(&mut out);

    if out.len() > max_size {
        out.truncate(max_size);
        if out.len() >= 4 {
            out[2] |= (FLAG_TC >> 8) as u8;
        }
    }
    out
}

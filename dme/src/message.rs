//! # Summary
//!
//! Stateless wire codec for the two datagram families. Every datagram starts
//! with a magic constant identifying its top-level tag; peer messages carry a
//! fixed 18-byte header followed by an algorithm-specific payload, supervisor
//! messages are a fixed 24 bytes with no payload. All fields are network byte
//! order with no padding beyond the declared fields.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use bytes::{Buf, BufMut};

use crate::config::SiteId;
use crate::error::Error;
use crate::timestamp::{Request, Timestamp};

pub const PEER_MAGIC: u32 = 0xDAAE_AA59;
pub const SUP_MAGIC: u32 = 0x500F_AA59;

/// magic(u32) + site(u64) + msg-type(u16) + flags(u16) + payload-length(u16).
pub const PEER_HEADER_LEN: usize = 18;

/// magic(u32) + site(u64) + msg-type(u16) + flags(u16) + secs(u32) + nanos(u32).
pub const SUP_MESSAGE_LEN: usize = 24;

/// Largest datagram we are willing to emit or accept, to avoid fragmentation.
pub const MAX_DATAGRAM: usize = 1024;

/// Algorithm tags in the shared wire enumeration.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Algorithm {
    Lamport,
    Ricart,
    Suzuki,
    Singhal,
}

impl Algorithm {
    pub fn tag(self) -> u16 {
        match self {
            Algorithm::Lamport => 1,
            Algorithm::Ricart => 2,
            Algorithm::Suzuki => 3,
            Algorithm::Singhal => 4,
        }
    }

    pub fn from_tag(tag: u16) -> Option<Self> {
        match tag {
            1 => Some(Algorithm::Lamport),
            2 => Some(Algorithm::Ricart),
            3 => Some(Algorithm::Suzuki),
            4 => Some(Algorithm::Singhal),
            _ => None,
        }
    }
}

impl FromStr for Algorithm {
    type Err = Error;
    fn from_str(name: &str) -> Result<Self, Error> {
        match name {
            "lamport" => Ok(Algorithm::Lamport),
            "ricart" => Ok(Algorithm::Ricart),
            "suzuki" => Ok(Algorithm::Suzuki),
            "singhal" => Ok(Algorithm::Singhal),
            _ => Err(Error::Config(format!("unknown algorithm '{}'", name))),
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Algorithm::Lamport => write!(f, "lamport"),
            Algorithm::Ricart => write!(f, "ricart"),
            Algorithm::Suzuki => write!(f, "suzuki"),
            Algorithm::Singhal => write!(f, "singhal"),
        }
    }
}

/// Per-algorithm message sub-types. RELEASE is only valid for Lamport.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SubType {
    Request,
    Reply,
    Release,
}

impl SubType {
    pub fn tag(self) -> u16 {
        match self {
            SubType::Request => 0,
            SubType::Reply => 1,
            SubType::Release => 2,
        }
    }

    fn from_tag(tag: u16) -> Result<Self, Error> {
        match tag {
            0 => Ok(SubType::Request),
            1 => Ok(SubType::Reply),
            2 => Ok(SubType::Release),
            _ => Err(Error::BadSubType(tag)),
        }
    }
}

/// Supervisor message types.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SupKind {
    WantCs,
    EnteredCs,
    ExitedCs,
}

impl SupKind {
    fn tag(self) -> u16 {
        match self {
            SupKind::WantCs => 0,
            SupKind::EnteredCs => 1,
            SupKind::ExitedCs => 2,
        }
    }

    fn from_tag(tag: u16) -> Result<Self, Error> {
        match tag {
            0 => Ok(SupKind::WantCs),
            1 => Ok(SupKind::EnteredCs),
            2 => Ok(SupKind::ExitedCs),
            _ => Err(Error::BadSupType(tag)),
        }
    }
}

/// The single transferable permission object of the token-passing policy.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Token {
    /// Per-site sequence number of the last request executed with this token,
    /// indexed by site id (entry 0 unused).
    pub last_executed: Vec<u32>,
    /// Sites waiting for the token, in hand-off order.
    pub queue: VecDeque<SiteId>,
}

impl Token {
    pub fn new(count: usize) -> Self {
        Token {
            last_executed: vec![0; count + 1],
            queue: VecDeque::new(),
        }
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        buf.put_u16((self.last_executed.len().saturating_sub(1)) as u16);
        buf.put_u16(self.queue.len() as u16);
        for ln in &self.last_executed {
            buf.put_u32(*ln);
        }
        for site in &self.queue {
            buf.put_u64(*site);
        }
    }

    fn decode(buf: &mut &[u8]) -> Result<Self, Error> {
        if buf.remaining() < 4 {
            return Err(Error::ShortDatagram(buf.remaining()));
        }
        let count = buf.get_u16() as usize;
        let queued = buf.get_u16() as usize;
        if buf.remaining() < (count + 1) * 4 + queued * 8 {
            return Err(Error::ShortDatagram(buf.remaining()));
        }
        let last_executed = (0..=count).map(|_| buf.get_u32()).collect();
        let queue = (0..queued).map(|_| buf.get_u64()).collect();
        Ok(Token {
            last_executed,
            queue,
        })
    }
}

/// Algorithm-specific trailing payload of a peer message. The site id inside
/// the timestamped bodies is redundant with the header but mirrors the
/// request records the theory is written in terms of.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    Lamport { kind: SubType, request: Request },
    Ricart { kind: SubType, request: Request },
    Singhal { kind: SubType, request: Request },
    Suzuki { kind: SubType, site: SiteId, seq: u32, token: Option<Token> },
}

impl Payload {
    pub fn algorithm(&self) -> Algorithm {
        match self {
            Payload::Lamport { .. } => Algorithm::Lamport,
            Payload::Ricart { .. } => Algorithm::Ricart,
            Payload::Singhal { .. } => Algorithm::Singhal,
            Payload::Suzuki { .. } => Algorithm::Suzuki,
        }
    }

    pub fn kind(&self) -> SubType {
        match self {
            Payload::Lamport { kind, .. }
            | Payload::Ricart { kind, .. }
            | Payload::Singhal { kind, .. }
            | Payload::Suzuki { kind, .. } => *kind,
        }
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Payload::Lamport { kind, request }
            | Payload::Ricart { kind, request }
            | Payload::Singhal { kind, request } => {
                buf.put_u16(kind.tag());
                buf.put_u32(request.stamp.secs);
                buf.put_u32(request.stamp.nanos);
                buf.put_u64(request.site);
            }
            Payload::Suzuki {
                kind,
                site,
                seq,
                token,
            } => {
                buf.put_u16(kind.tag());
                buf.put_u64(*site);
                buf.put_u32(*seq);
                if let Some(token) = token {
                    token.encode(buf);
                }
            }
        }
    }

    fn decode(algorithm: Algorithm, buf: &mut &[u8]) -> Result<Self, Error> {
        if buf.remaining() < 2 {
            return Err(Error::ShortDatagram(buf.remaining()));
        }
        let kind = SubType::from_tag(buf.get_u16())?;
        match algorithm {
            Algorithm::Lamport | Algorithm::Ricart | Algorithm::Singhal => {
                if buf.remaining() < 16 {
                    return Err(Error::ShortDatagram(buf.remaining()));
                }
                if kind == SubType::Release && algorithm != Algorithm::Lamport {
                    return Err(Error::BadSubType(kind.tag()));
                }
                let stamp = Timestamp::new(buf.get_u32(), buf.get_u32());
                let request = Request::new(stamp, buf.get_u64());
                Ok(match algorithm {
                    Algorithm::Lamport => Payload::Lamport { kind, request },
                    Algorithm::Ricart => Payload::Ricart { kind, request },
                    _ => Payload::Singhal { kind, request },
                })
            }
            Algorithm::Suzuki => {
                if buf.remaining() < 12 {
                    return Err(Error::ShortDatagram(buf.remaining()));
                }
                let site = buf.get_u64();
                let seq = buf.get_u32();
                let token = match kind {
                    SubType::Request => None,
                    SubType::Reply => Some(Token::decode(buf)?),
                    SubType::Release => return Err(Error::BadSubType(kind.tag())),
                };
                Ok(Payload::Suzuki {
                    kind,
                    site,
                    seq,
                    token,
                })
            }
        }
    }
}

/// A decoded inter-peer datagram.
#[derive(Clone, Debug, PartialEq)]
pub struct PeerMessage {
    /// Sending site, from the common header.
    pub site: SiteId,
    pub flags: u16,
    pub payload: Payload,
}

impl PeerMessage {
    pub fn new(site: SiteId, payload: Payload) -> Self {
        PeerMessage {
            site,
            flags: 0,
            payload,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(64);
        self.payload.encode(&mut body);
        let mut buf = Vec::with_capacity(PEER_HEADER_LEN + body.len());
        buf.put_u32(PEER_MAGIC);
        buf.put_u64(self.site);
        buf.put_u16(self.payload.algorithm().tag());
        buf.put_u16(self.flags);
        buf.put_u16(body.len() as u16);
        buf.extend_from_slice(&body);
        buf
    }

    pub fn decode(datagram: &[u8]) -> Result<Self, Error> {
        if datagram.len() < PEER_HEADER_LEN {
            return Err(Error::ShortDatagram(datagram.len()));
        }
        let mut buf = datagram;
        let magic = buf.get_u32();
        if magic != PEER_MAGIC {
            return Err(Error::BadMagic(magic));
        }
        let site = buf.get_u64();
        let tag = buf.get_u16();
        let flags = buf.get_u16();
        let length = buf.get_u16() as usize;
        if buf.remaining() < length {
            return Err(Error::ShortDatagram(datagram.len()));
        }
        let algorithm = Algorithm::from_tag(tag).ok_or(Error::BadAlgorithm(tag))?;
        let mut body = &buf[..length];
        let payload = Payload::decode(algorithm, &mut body)?;
        Ok(PeerMessage {
            site,
            flags,
            payload,
        })
    }
}

/// A supervisor datagram: prompts toward the peers, reports back from them.
/// The delta carries the simulated occupancy duration in a WANT_CS and the
/// elapsed time since the last supervisor contact in the two reports.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SupMessage {
    pub site: SiteId,
    pub kind: SupKind,
    pub flags: u16,
    pub delta: Timestamp,
}

impl SupMessage {
    pub fn new(site: SiteId, kind: SupKind, delta: Timestamp) -> Self {
        SupMessage {
            site,
            kind,
            flags: 0,
            delta,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(SUP_MESSAGE_LEN);
        buf.put_u32(SUP_MAGIC);
        buf.put_u64(self.site);
        buf.put_u16(self.kind.tag());
        buf.put_u16(self.flags);
        buf.put_u32(self.delta.secs);
        buf.put_u32(self.delta.nanos);
        buf
    }

    pub fn decode(datagram: &[u8]) -> Result<Self, Error> {
        if datagram.len() < SUP_MESSAGE_LEN {
            return Err(Error::ShortDatagram(datagram.len()));
        }
        let mut buf = datagram;
        let magic = buf.get_u32();
        if magic != SUP_MAGIC {
            return Err(Error::BadMagic(magic));
        }
        let site = buf.get_u64();
        let kind = SupKind::from_tag(buf.get_u16())?;
        let flags = buf.get_u16();
        let delta = Timestamp::new(buf.get_u32(), buf.get_u32());
        Ok(SupMessage {
            site,
            kind,
            flags,
            delta,
        })
    }
}

/// Reads the leading magic without consuming the datagram.
pub fn peek_magic(datagram: &[u8]) -> Result<u32, Error> {
    if datagram.len() < 4 {
        return Err(Error::ShortDatagram(datagram.len()));
    }
    let mut head = &datagram[..4];
    Ok(head.get_u32())
}

#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(test)]
extern crate std;

use core::fmt::{self, Display};

use num_enum::TryFromPrimitive;

pub mod client;
pub mod config;
pub mod server;

pub use config::{Config, Mode};

/// First byte of every AHCP packet.
pub const MAGIC: u8 = 0x2B;
/// Protocol version spoken by this implementation.
pub const VERSION: u8 = 0;

/// Largest datagram ever sent or accepted.
pub const BUFFER_SIZE: usize = 1500;
/// Largest stateless body that fits in a reply packet.
pub const MAX_BODY: usize = BUFFER_SIZE - REPLY_HEADER_SIZE;
/// Unique client identifiers longer than this are rejected outright.
pub const MAX_UNIQUE_ID: usize = 500;

const HEADER_SIZE: usize = 4;
const REPLY_HEADER_SIZE: usize = 20;
const STATEFUL_HEADER_SIZE: usize = 8;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Error {
    /// The packet is shorter than its framing requires.
    TooShort,
    /// An option extends past the end of the declared body.
    TruncatedOption,
    /// An option value has an impossible length or an out-of-range value.
    BadLength,
    /// An option we do not understand was flagged as mandatory.
    UnknownMandatory,
    /// The data carries no lifetime, or has already expired.
    Expired,
    /// The origin/expiry stamps contradict each other or the local clock.
    InconsistentTimes,
    /// The output buffer is too small for what is being encoded.
    BufferFull,
    /// Valid framing, but an opcode this implementation does not know.
    UnknownOpcode,
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort => write!(f, "Packet too short"),
            Self::TruncatedOption => write!(f, "Truncated option"),
            Self::BadLength => write!(f, "Bad option length"),
            Self::UnknownMandatory => write!(f, "Unknown mandatory option"),
            Self::Expired => write!(f, "Expired data"),
            Self::InconsistentTimes => write!(f, "Inconsistent timestamps"),
            Self::BufferFull => write!(f, "Buffer full"),
            Self::UnknownOpcode => write!(f, "Unknown opcode"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

///
/// AHCP message type, carried in the third byte of the packet header.
///
/// `Query` and `Reply` form the stateless protocol; the four `Stateful*`
/// opcodes form the DHCP-like request/acknowledge exchange with a
/// designated server.
///
#[derive(Copy, Clone, PartialEq, Eq, Debug, TryFromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    /// Multicast solicitation for stateless data. Bare header, no body.
    Query = 0,

    /// Stateless data, flooded in response to queries or unsolicited.
    Reply = 1,

    /// Client to server: request or renew an IPv4 lease.
    StatefulRequest = 2,

    /// Client to server: relinquish the lease.
    StatefulRelease = 3,

    /// Server to client: lease granted.
    StatefulAck = 4,

    /// Server to client: lease refused.
    StatefulNak = 5,
}

/// A decoded AHCP packet, borrowing its body from the receive buffer.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Packet<'a> {
    Query,
    Reply(Reply<'a>),
    Stateful(Stateful<'a>),
}

impl<'a> Packet<'a> {
    /// Parses the packet from a byte slice.
    pub fn decode(data: &'a [u8]) -> Result<Self, Error> {
        if data.len() < HEADER_SIZE {
            return Err(Error::TooShort);
        }

        if data[0] != MAGIC || data[1] != VERSION {
            return Err(Error::UnknownOpcode);
        }

        let opcode =
            Opcode::try_from_primitive(data[2]).map_err(|_| Error::UnknownOpcode)?;

        match opcode {
            Opcode::Query => Ok(Self::Query),
            Opcode::Reply => Reply::decode(data).map(Self::Reply),
            _ => Stateful::decode(opcode, data).map(Self::Stateful),
        }
    }

    /// Encodes a bare query packet into the provided buf slice.
    pub fn encode_query(buf: &mut [u8]) -> Result<&[u8], Error> {
        let mut bytes = BytesOut::new(buf);

        bytes
            .byte(MAGIC)?
            .byte(VERSION)?
            .byte(Opcode::Query as _)?
            .byte(0)?;

        let len = bytes.len();

        Ok(&buf[..len])
    }
}

/// A stateless reply: the freshness triple plus the raw option body.
///
/// `origin` and `expires` are wall-clock seconds at the authority; `age`
/// is the seconds elapsed since the authority produced the body, as
/// accumulated by forwarders.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Reply<'a> {
    pub origin: u32,
    pub expires: u32,
    pub age: u16,
    pub body: &'a [u8],
}

impl<'a> Reply<'a> {
    /// Parses a reply from a full packet, header included.
    ///
    /// Reads exactly the declared body length; trailing bytes are ignored.
    pub fn decode(data: &'a [u8]) -> Result<Self, Error> {
        if data.len() < REPLY_HEADER_SIZE {
            return Err(Error::TooShort);
        }

        let mut bytes = BytesIn::new(data);

        bytes.slice(HEADER_SIZE)?;

        let origin = u32::from_be_bytes(bytes.arr()?);
        let expires = u32::from_be_bytes(bytes.arr()?);
        bytes.slice(4)?; // reserved
        let age = u16::from_be_bytes(bytes.arr()?);
        let len = u16::from_be_bytes(bytes.arr()?) as usize;

        let body = bytes.slice(len).map_err(|_| Error::TooShort)?;

        Ok(Self {
            origin,
            expires,
            age,
            body,
        })
    }

    /// Encodes the full reply packet into the provided buf slice.
    pub fn encode<'o>(&self, buf: &'o mut [u8]) -> Result<&'o [u8], Error> {
        if self.body.len() > u16::MAX as usize {
            return Err(Error::BufferFull);
        }

        let mut bytes = BytesOut::new(buf);

        bytes
            .byte(MAGIC)?
            .byte(VERSION)?
            .byte(Opcode::Reply as _)?
            .byte(0)?
            .push(&self.origin.to_be_bytes())?
            .push(&self.expires.to_be_bytes())?
            .push(&[0; 4])?
            .push(&self.age.to_be_bytes())?
            .push(&(self.body.len() as u16).to_be_bytes())?
            .push(self.body)?;

        let len = bytes.len();

        Ok(&buf[..len])
    }
}

/// A stateful message: request, release, acknowledgement or refusal.
///
/// The body, when present, is a TLV option stream carrying the requested
/// or granted addresses.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Stateful<'a> {
    pub opcode: Opcode,
    pub lease_time: u16,
    pub unique_id: &'a [u8],
    pub body: &'a [u8],
}

impl<'a> Stateful<'a> {
    /// Parses a stateful packet, header included.
    ///
    /// The trailing `dlen`/data pair is optional on the wire; a packet
    /// that ends right after the unique id has an empty body.
    pub fn decode(opcode: Opcode, data: &'a [u8]) -> Result<Self, Error> {
        if data.len() < STATEFUL_HEADER_SIZE {
            return Err(Error::TooShort);
        }

        let mut bytes = BytesIn::new(data);

        bytes.slice(HEADER_SIZE)?;

        let lease_time = u16::from_be_bytes(bytes.arr()?);
        let ulen = u16::from_be_bytes(bytes.arr()?) as usize;

        if ulen > MAX_UNIQUE_ID {
            return Err(Error::BadLength);
        }

        let unique_id = bytes.slice(ulen).map_err(|_| Error::TooShort)?;

        let body = if bytes.is_empty() {
            &data[data.len()..]
        } else {
            let dlen = u16::from_be_bytes(bytes.arr()?) as usize;
            bytes.slice(dlen).map_err(|_| Error::TooShort)?
        };

        Ok(Self {
            opcode,
            lease_time,
            unique_id,
            body,
        })
    }

    /// Encodes the full stateful packet into the provided buf slice.
    pub fn encode<'o>(&self, buf: &'o mut [u8]) -> Result<&'o [u8], Error> {
        if self.unique_id.len() > MAX_UNIQUE_ID {
            return Err(Error::BadLength);
        }

        let mut bytes = BytesOut::new(buf);

        bytes
            .byte(MAGIC)?
            .byte(VERSION)?
            .byte(self.opcode as _)?
            .byte(0)?
            .push(&self.lease_time.to_be_bytes())?
            .push(&(self.unique_id.len() as u16).to_be_bytes())?
            .push(self.unique_id)?
            .push(&(self.body.len() as u16).to_be_bytes())?
            .push(self.body)?;

        let len = bytes.len();

        Ok(&buf[..len])
    }
}

pub(crate) struct BytesIn<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> BytesIn<'a> {
    pub const fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.offset == self.data.len()
    }

    pub fn byte(&mut self) -> Result<u8, Error> {
        self.arr::<1>().map(|arr| arr[0])
    }

    pub fn slice(&mut self, len: usize) -> Result<&'a [u8], Error> {
        if len > self.data.len() - self.offset {
            Err(Error::TruncatedOption)
        } else {
            let data = &self.data[self.offset..self.offset + len];
            self.offset += len;

            Ok(data)
        }
    }

    pub fn arr<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        let slice = self.slice(N)?;

        let mut data = [0; N];
        data.copy_from_slice(slice);

        Ok(data)
    }
}

pub(crate) struct BytesOut<'a> {
    buf: &'a mut [u8],
    offset: usize,
}

impl<'a> BytesOut<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    pub fn len(&self) -> usize {
        self.offset
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.offset
    }

    pub fn byte(&mut self, data: u8) -> Result<&mut Self, Error> {
        self.push(&[data])
    }

    pub fn push(&mut self, data: &[u8]) -> Result<&mut Self, Error> {
        if data.len() > self.buf.len() - self.offset {
            Err(Error::BufferFull)
        } else {
            self.buf[self.offset..self.offset + data.len()].copy_from_slice(data);
            self.offset += data.len();

            Ok(self)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reply_framing() {
        let body = [config::OPT_PAD, config::OPT_PAD];
        let reply = Reply {
            origin: 1000,
            expires: 1600,
            age: 7,
            body: &body,
        };

        let mut buf = [0; 64];
        let data = reply.encode(&mut buf).unwrap();

        assert_eq!(data.len(), 22);
        assert_eq!(&data[..4], &[MAGIC, VERSION, 1, 0]);

        match Packet::decode(data).unwrap() {
            Packet::Reply(decoded) => assert_eq!(decoded, reply),
            other => panic!("unexpected packet {other:?}"),
        }
    }

    #[test]
    fn reply_body_must_fit() {
        // Declared body length larger than the datagram
        let data = [
            MAGIC, VERSION, 1, 0, 0, 0, 0, 1, 0, 0, 0, 2, 0, 0, 0, 0, 0, 0, 0, 9,
        ];
        assert!(matches!(Packet::decode(&data), Err(Error::TooShort)));
    }

    #[test]
    fn stateful_framing() {
        let id = [0xAB; 16];
        let msg = Stateful {
            opcode: Opcode::StatefulRequest,
            lease_time: 1800,
            unique_id: &id,
            body: &[],
        };

        let mut buf = [0; 64];
        let data = msg.encode(&mut buf).unwrap();

        match Packet::decode(data).unwrap() {
            Packet::Stateful(decoded) => assert_eq!(decoded, msg),
            other => panic!("unexpected packet {other:?}"),
        }

        // The dlen field is optional on the wire
        let truncated = &data[..STATEFUL_HEADER_SIZE + id.len()];
        match Packet::decode(truncated).unwrap() {
            Packet::Stateful(decoded) => {
                assert_eq!(decoded.unique_id, &id);
                assert!(decoded.body.is_empty());
            }
            other => panic!("unexpected packet {other:?}"),
        }
    }

    #[test]
    fn rejects_foreign_packets() {
        assert!(matches!(Packet::decode(&[]), Err(Error::TooShort)));
        assert!(matches!(
            Packet::decode(&[0x2A, 0, 0, 0]),
            Err(Error::UnknownOpcode)
        ));
        assert!(matches!(
            Packet::decode(&[MAGIC, 1, 0, 0]),
            Err(Error::UnknownOpcode)
        ));
        assert!(matches!(
            Packet::decode(&[MAGIC, VERSION, 17, 0]),
            Err(Error::UnknownOpcode)
        ));
    }

    #[test]
    fn query_is_bare_header() {
        let mut buf = [0; 16];
        let data = Packet::encode_query(&mut buf).unwrap();

        assert_eq!(data, &[MAGIC, VERSION, 0, 0]);
        assert!(matches!(Packet::decode(data).unwrap(), Packet::Query));
    }
}

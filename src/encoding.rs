//! Wire encodings shared by the command bootup payloads: the 14-bit
//! varint integer, the length-prefixed string and the remote address.
//!
//! All parsers consume a [`LimitedReader`] so they respect frame
//! boundaries; marshalling appends to a caller-provided buffer.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::{
    error::{Error, ProtocolError},
    fetch::LimitedReader,
};

const INTEGER_HAS_NEXT_BIT: u8 = 0x80;
const INTEGER_VALUE_CUTTER: u8 = 0x7f;

/// Largest value a wire integer can carry.
pub const INTEGER_MAX: u16 = 0x3fff;

/// An unsigned 14-bit integer encoded in one or two bytes.
///
/// The top bit of each byte flags that another byte follows:
///
/// ```text
/// 01111111          = 127
/// 11111111 01000000 = 16320
/// ```
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct Integer(pub u16);

impl Integer {
    /// How many bytes the integer encodes into: 1 iff the value fits
    /// in 7 bits.
    pub fn byte_size(self) -> usize {
        if self.0 > u16::from(INTEGER_VALUE_CUTTER) {
            2
        } else {
            1
        }
    }

    /// Appends the encoded integer to `out`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::IntegerTooLarge`] for values above
    /// [`INTEGER_MAX`].
    pub fn marshal(self, out: &mut Vec<u8>) -> Result<(), Error> {
        if self.0 > INTEGER_MAX {
            return Err(ProtocolError::IntegerTooLarge.into());
        }
        if self.0 <= u16::from(INTEGER_VALUE_CUTTER) {
            out.push(self.0 as u8);
        } else {
            out.push((self.0 >> 7) as u8 | INTEGER_HAS_NEXT_BIT);
            out.push(self.0 as u8 & INTEGER_VALUE_CUTTER);
        }
        Ok(())
    }

    /// Reads an encoded integer.
    pub async fn unmarshal(r: &mut LimitedReader<'_>) -> io::Result<Self> {
        let mut v = 0u16;
        for _ in 0..2 {
            let b = r.fetch_one_byte().await?;
            v |= u16::from(b & INTEGER_VALUE_CUTTER);
            if b & INTEGER_HAS_NEXT_BIT == 0 {
                return Ok(Self(v));
            }
            v <<= 7;
        }
        Ok(Self(v))
    }
}

/// A length-prefixed byte string, at most [`INTEGER_MAX`] bytes.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct WireString(Vec<u8>);

impl WireString {
    /// Wraps raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::IntegerTooLarge`] when the data is too
    /// long for the length prefix.
    pub fn new(data: Vec<u8>) -> Result<Self, Error> {
        if data.len() > usize::from(INTEGER_MAX) {
            return Err(ProtocolError::IntegerTooLarge.into());
        }
        Ok(Self(data))
    }

    /// The raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The bytes rendered as text, replacing invalid UTF-8.
    pub fn to_text(&self) -> String {
        String::from_utf8_lossy(&self.0).into_owned()
    }

    /// Appends the length prefix and data to `out`.
    pub fn marshal(&self, out: &mut Vec<u8>) -> Result<(), Error> {
        Integer(self.0.len() as u16).marshal(out)?;
        out.extend_from_slice(&self.0);
        Ok(())
    }

    /// Reads a length-prefixed string.
    pub async fn parse(r: &mut LimitedReader<'_>) -> io::Result<Self> {
        let len = Integer::unmarshal(r).await?.0 as usize;
        let mut data = vec![0u8; len];
        r.read_exact(&mut data).await?;
        Ok(Self(data))
    }
}

const ADDRESS_KIND_CUTTER: u8 = 0xc0;
const ADDRESS_LEN_CUTTER: u8 = 0x3f;

/// The host part of an [`Address`].
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum HostKind {
    /// The gateway machine itself; carries no body.
    Loopback,

    /// A 4-byte IPv4 address.
    V4([u8; 4]),

    /// A 16-byte IPv6 address.
    V6([u8; 16]),

    /// A host name of at most 63 bytes.
    Name(String),
}

/// A remote endpoint as carried in SSH and Telnet bootup payloads.
///
/// Wire format:
///
/// ```text
/// | port | kind(2b) len(6b) | body     |
/// |  2B  |        1B        | variable |
/// ```
///
/// Kinds: `00` loopback (no body), `01` IPv4 (4 bytes), `10` IPv6
/// (16 bytes), `11` host name (body length in the low 6 bits).
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Address {
    port: u16,
    host: HostKind,
}

impl Address {
    /// Builds an address from its parts.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::ValueTooLarge`] when a host name
    /// exceeds 63 bytes.
    pub fn new(host: HostKind, port: u16) -> Result<Self, Error> {
        if let HostKind::Name(name) = &host {
            if name.len() > usize::from(ADDRESS_LEN_CUTTER) {
                return Err(ProtocolError::ValueTooLarge.into());
            }
        }
        Ok(Self { port, host })
    }

    /// The host part.
    pub fn host(&self) -> &HostKind {
        &self.host
    }

    /// The port number.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The host rendered for dialing, without the port.
    pub fn host_text(&self) -> String {
        match &self.host {
            HostKind::Loopback => "localhost".to_owned(),
            HostKind::V4(b) => Ipv4Addr::from(*b).to_string(),
            HostKind::V6(b) => Ipv6Addr::from(*b).to_string(),
            HostKind::Name(name) => name.clone(),
        }
    }

    /// Appends the wire form to `out`.
    pub fn marshal(&self, out: &mut Vec<u8>) -> Result<(), Error> {
        out.extend_from_slice(&self.port.to_be_bytes());
        match &self.host {
            HostKind::Loopback => out.push(0x00 << 6),
            HostKind::V4(b) => {
                out.push(0x01 << 6);
                out.extend_from_slice(b);
            }
            HostKind::V6(b) => {
                out.push(0x02 << 6);
                out.extend_from_slice(b);
            }
            HostKind::Name(name) => {
                if name.len() > usize::from(ADDRESS_LEN_CUTTER) {
                    return Err(ProtocolError::ValueTooLarge.into());
                }
                out.push((0x03 << 6) | name.len() as u8);
                out.extend_from_slice(name.as_bytes());
            }
        }
        Ok(())
    }

    /// Reads an address.
    pub async fn parse(r: &mut LimitedReader<'_>) -> io::Result<Self> {
        let mut hdr = [0u8; 3];
        r.read_exact(&mut hdr).await?;
        let port = u16::from_be_bytes([hdr[0], hdr[1]]);

        let host = match hdr[2] & ADDRESS_KIND_CUTTER {
            0x00 => HostKind::Loopback,
            0x40 => {
                let mut b = [0u8; 4];
                r.read_exact(&mut b).await?;
                HostKind::V4(b)
            }
            0x80 => {
                let mut b = [0u8; 16];
                r.read_exact(&mut b).await?;
                HostKind::V6(b)
            }
            _ => {
                let len = usize::from(hdr[2] & ADDRESS_LEN_CUTTER);
                let mut b = vec![0u8; len];
                r.read_exact(&mut b).await?;
                HostKind::Name(String::from_utf8_lossy(&b).into_owned())
            }
        };

        Ok(Self { port, host })
    }
}

impl core::fmt::Display for Address {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match &self.host {
            HostKind::V6(b) => write!(f, "[{}]:{}", Ipv6Addr::from(*b), self.port),
            _ => write!(f, "{}:{}", self.host_text(), self.port),
        }
    }
}

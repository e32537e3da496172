//! Routable network addresses for masternode services.
//!
//! Addresses are carried in the 16-byte form used on the wire: IPv4 as a
//! v4-mapped IPv6 address, onion services in the OnionCat range.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};

const ONIONCAT_PREFIX: [u8; 6] = [0xfd, 0x87, 0xd8, 0x7e, 0xeb, 0x43];

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AddrFamily {
    IPv4,
    IPv6,
    Onion,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NetAddr {
    ip: [u8; 16],
    port: u16,
}

impl NetAddr {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        let ip = match ip {
            IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
            IpAddr::V6(v6) => v6.octets(),
        };
        Self { ip, port }
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }

    /// An onion service id (the 10-byte v2 form carried in OnionCat space).
    pub fn new_onion(service_id: [u8; 10], port: u16) -> Self {
        let mut ip = [0u8; 16];
        ip[..6].copy_from_slice(&ONIONCAT_PREFIX);
        ip[6..].copy_from_slice(&service_id);
        Self { ip, port }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The per-host pacing key: same address, port zeroed.
    pub fn squashed(&self) -> NetAddr {
        NetAddr {
            ip: self.ip,
            port: 0,
        }
    }

    pub fn family(&self) -> AddrFamily {
        if self.ip[..6] == ONIONCAT_PREFIX {
            AddrFamily::Onion
        } else if Ipv6Addr::from(self.ip).to_ipv4_mapped().is_some() {
            AddrFamily::IPv4
        } else {
            AddrFamily::IPv6
        }
    }

    pub fn is_ipv4(&self) -> bool {
        self.family() == AddrFamily::IPv4
    }

    pub fn is_ipv6(&self) -> bool {
        self.family() == AddrFamily::IPv6
    }

    pub fn is_onion(&self) -> bool {
        self.family() == AddrFamily::Onion
    }

    fn as_ipv4(&self) -> Option<Ipv4Addr> {
        if self.is_onion() {
            return None;
        }
        Ipv6Addr::from(self.ip).to_ipv4_mapped()
    }

    pub fn is_loopback(&self) -> bool {
        match self.as_ipv4() {
            Some(v4) => v4.is_loopback(),
            None => !self.is_onion() && Ipv6Addr::from(self.ip).is_loopback(),
        }
    }

    pub fn is_unspecified(&self) -> bool {
        match self.as_ipv4() {
            Some(v4) => v4.is_unspecified(),
            None => !self.is_onion() && Ipv6Addr::from(self.ip).is_unspecified(),
        }
    }

    /// RFC1918 private IPv4 space.
    pub fn is_rfc1918(&self) -> bool {
        self.as_ipv4().is_some_and(|v4| v4.is_private())
    }

    pub fn is_local(&self) -> bool {
        self.is_loopback() || self.is_unspecified()
    }

    /// Whether peers elsewhere on the network could reach this address.
    pub fn is_routable(&self) -> bool {
        !self.is_local() && !self.is_rfc1918()
    }

    /// Concrete dialable address; onion services need a proxy and return None.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        if self.is_onion() {
            return None;
        }
        let ip = match self.as_ipv4() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(Ipv6Addr::from(self.ip)),
        };
        Some(SocketAddr::new(ip, self.port))
    }
}

// Display is the form signed into legacy verification messages, so it must
// stay stable: "a.b.c.d:port", "[v6]:port", "<base32>.onion:port".
impl fmt::Display for NetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.family() {
            AddrFamily::IPv4 => {
                let v4 = self.as_ipv4().unwrap_or(Ipv4Addr::UNSPECIFIED);
                write!(f, "{}:{}", v4, self.port)
            }
            AddrFamily::IPv6 => {
                write!(f, "[{}]:{}", Ipv6Addr::from(self.ip), self.port)
            }
            AddrFamily::Onion => {
                let mut id = [0u8; 10];
                id.copy_from_slice(&self.ip[6..]);
                write!(f, "{}.onion:{}", base32_lower(&id), self.port)
            }
        }
    }
}

fn base32_lower(bytes: &[u8]) -> String {
    const ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";
    let mut out = String::new();
    let mut acc: u32 = 0;
    let mut bits = 0u32;
    for byte in bytes {
        acc = (acc << 8) | u32::from(*byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(ALPHABET[(acc >> bits) as usize & 0x1f] as char);
        }
    }
    if bits > 0 {
        out.push(ALPHABET[(acc << (5 - bits)) as usize & 0x1f] as char);
    }
    out
}

impl Encodable for NetAddr {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_bytes(&self.ip);
        encoder.write_u16_be(self.port);
    }
}

impl Decodable for NetAddr {
    fn consensus_decode(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let ip = decoder.read_fixed::<16>()?;
        let port = decoder.read_u16_be()?;
        Ok(Self { ip, port })
    }
}

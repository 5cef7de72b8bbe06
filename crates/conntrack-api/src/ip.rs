// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The IPv4 vocabulary shared by the tracker and its consumers.

use alloc::string::String;
use core::fmt;
use core::str::FromStr;
use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;

pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;
pub const PROTO_GRE: u8 = 47;

/// The protocol carried by an IPv4 datagram.
///
/// Protocols without a dedicated tracker are carried as `Other` and
/// handled by the generic tracker.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub enum Protocol {
    ICMP,
    TCP,
    UDP,
    GRE,
    Other(u8),
}

impl Protocol {
    pub const fn number(self) -> u8 {
        match self {
            Self::ICMP => PROTO_ICMP,
            Self::TCP => PROTO_TCP,
            Self::UDP => PROTO_UDP,
            Self::GRE => PROTO_GRE,
            Self::Other(n) => n,
        }
    }
}

impl From<u8> for Protocol {
    fn from(n: u8) -> Self {
        match n {
            PROTO_ICMP => Self::ICMP,
            PROTO_TCP => Self::TCP,
            PROTO_UDP => Self::UDP,
            PROTO_GRE => Self::GRE,
            n => Self::Other(n),
        }
    }
}

impl From<Protocol> for u8 {
    fn from(proto: Protocol) -> u8 {
        proto.number()
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::ICMP => "ICMP",
            Self::TCP => "TCP",
            Self::UDP => "UDP",
            Self::GRE => "GRE",
            Self::Other(n) => return write!(f, "PROTO({n})"),
        };
        f.write_str(name)
    }
}

/// An IPv4 address, held in network order.
///
/// Serialized in its dotted-quad form so dumps and config files read
/// naturally.
#[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Ipv4Addr([u8; 4]);

impl Ipv4Addr {
    pub const UNSPECIFIED: Self = Self([0; 4]);

    #[inline]
    pub const fn bytes(&self) -> [u8; 4] {
        self.0
    }

    /// Keep the leading `len` bits, zeroing the rest.
    fn truncate(self, len: PrefixLen) -> Self {
        Self::from(u32::from(self) & len.netmask())
    }
}

impl From<[u8; 4]> for Ipv4Addr {
    fn from(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }
}

impl From<u32> for Ipv4Addr {
    fn from(val: u32) -> Self {
        Self(val.to_be_bytes())
    }
}

impl From<Ipv4Addr> for u32 {
    fn from(ip: Ipv4Addr) -> u32 {
        u32::from_be_bytes(ip.0)
    }
}

impl From<core::net::Ipv4Addr> for Ipv4Addr {
    fn from(ip: core::net::Ipv4Addr) -> Self {
        Self(ip.octets())
    }
}

impl From<Ipv4Addr> for core::net::Ipv4Addr {
    fn from(ip: Ipv4Addr) -> Self {
        Self::from(ip.0)
    }
}

impl FromStr for Ipv4Addr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<core::net::Ipv4Addr>()
            .map(Self::from)
            .map_err(|_| format!("malformed IPv4 address: {s:?}"))
    }
}

impl fmt::Display for Ipv4Addr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let [a, b, c, d] = self.0;
        write!(f, "{a}.{b}.{c}.{d}")
    }
}

impl fmt::Debug for Ipv4Addr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Ipv4Addr({self})")
    }
}

impl Serialize for Ipv4Addr {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Ipv4Addr {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// The length of a network prefix, 0 through 32.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
struct PrefixLen(u8);

impl PrefixLen {
    const NONE: Self = Self(0);
    const HOST: Self = Self(32);

    fn new(len: u8) -> Result<Self, String> {
        if len > 32 {
            return Err(format!("IPv4 prefix length out of range: {len}"));
        }
        Ok(Self(len))
    }

    fn netmask(self) -> u32 {
        u32::MAX.checked_shl(32 - u32::from(self.0)).unwrap_or(0)
    }
}

/// An IPv4 network: an address with its host bits cleared and a
/// prefix length.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Ipv4Cidr {
    net: Ipv4Addr,
    len: PrefixLen,
}

impl Ipv4Cidr {
    /// `0.0.0.0/0`
    pub const ANY: Self =
        Self { net: Ipv4Addr::UNSPECIFIED, len: PrefixLen::NONE };

    /// Build a network from any address inside it.
    pub fn new(ip: Ipv4Addr, prefix_len: u8) -> Result<Self, String> {
        let len = PrefixLen::new(prefix_len)?;
        Ok(Self { net: ip.truncate(len), len })
    }

    /// The `/32` holding only `ip`.
    pub fn host(ip: Ipv4Addr) -> Self {
        Self { net: ip, len: PrefixLen::HOST }
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.net
    }

    pub fn prefix_len(&self) -> u8 {
        self.len.0
    }

    pub fn is_member(&self, ip: Ipv4Addr) -> bool {
        ip.truncate(self.len) == self.net
    }

    /// Do the two networks share at least one address? For prefixes
    /// that is the same as one containing the other.
    pub fn overlaps(&self, other: &Self) -> bool {
        let len = self.len.min(other.len);
        self.net.truncate(len) == other.net.truncate(len)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = String;

    /// Parse `a.b.c.d/len`. A bare address is taken as a `/32`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            None => s.parse().map(Self::host),
            Some((ip, len)) => {
                let len = len
                    .parse::<u8>()
                    .map_err(|_| format!("malformed prefix length: {len:?}"))?;
                Self::new(ip.parse()?, len)
            }
        }
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.net, self.len.0)
    }
}

impl Serialize for Ipv4Cidr {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Ipv4Cidr {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn cidr_membership() {
        let cidr: Ipv4Cidr = "10.9.9.9/8".parse().unwrap();
        assert_eq!(cidr.ip(), ip("10.0.0.0"));
        assert!(cidr.is_member(ip("10.7.7.7")));
        assert!(!cidr.is_member(ip("11.0.0.1")));
        assert!(Ipv4Cidr::ANY.is_member(ip("52.10.128.69")));
        assert!(cidr.overlaps(&"10.1.0.0/16".parse().unwrap()));
        assert!(!cidr.overlaps(&"192.168.0.0/16".parse().unwrap()));
    }

    #[test]
    fn prefix_edges() {
        assert_eq!(PrefixLen::NONE.netmask(), 0);
        assert_eq!(PrefixLen::HOST.netmask(), u32::MAX);
        assert!(Ipv4Cidr::new(ip("1.2.3.4"), 33).is_err());
        let host: Ipv4Cidr = "1.2.3.4".parse().unwrap();
        assert_eq!(host.prefix_len(), 32);
        assert!(!host.is_member(ip("1.2.3.5")));
        assert!("1.2.3/8".parse::<Ipv4Cidr>().is_err());
    }

    #[test]
    fn protocol_numbers() {
        assert_eq!(Protocol::from(6), Protocol::TCP);
        assert_eq!(u8::from(Protocol::Other(132)), 132);
        assert_eq!(format!("{}", Protocol::Other(132)), "PROTO(132)");
    }

    #[test]
    fn addresses_serialize_dotted() {
        let json = serde_json::to_string(&ip("192.168.1.10")).unwrap();
        assert_eq!(json, "\"192.168.1.10\"");
        let back: Ipv4Cidr = serde_json::from_str("\"10.0.0.0/24\"").unwrap();
        assert!(back.is_member(ip("10.0.0.200")));
    }
}

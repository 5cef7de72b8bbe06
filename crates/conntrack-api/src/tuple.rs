// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use super::ip::Ipv4Addr;
use super::ip::Protocol;
use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;

/// The protocol-specific part of a [`Tuple`].
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
pub enum L4Tuple {
    /// TCP, UDP and anything else keyed by a port pair.
    Ports { src: u16, dst: u16 },

    /// ICMP queries. The `ty` is the type this direction's packets
    /// carry; the reply tuple holds the matching reply type.
    Icmp { id: u16, ty: u8, code: u8 },

    /// Protocols tracked by address pair alone.
    None,
}

impl Default for L4Tuple {
    fn default() -> Self {
        Self::None
    }
}

/// The identity of a flow in one direction.
///
/// A tuple says nothing about which direction of its connection it
/// describes; the connection table records that alongside each
/// entry.
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
pub struct Tuple {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub proto: Protocol,
    pub l4: L4Tuple,
}

impl Tuple {
    pub fn new_ports(
        proto: Protocol,
        src: Ipv4Addr,
        sport: u16,
        dst: Ipv4Addr,
        dport: u16,
    ) -> Self {
        Self { src, dst, proto, l4: L4Tuple::Ports { src: sport, dst: dport } }
    }

    pub fn new_icmp(
        src: Ipv4Addr,
        dst: Ipv4Addr,
        id: u16,
        ty: u8,
        code: u8,
    ) -> Self {
        Self {
            src,
            dst,
            proto: Protocol::ICMP,
            l4: L4Tuple::Icmp { id, ty, code },
        }
    }

    /// The source port, if this tuple has one.
    pub fn src_port(&self) -> Option<u16> {
        match self.l4 {
            L4Tuple::Ports { src, .. } => Some(src),
            _ => None,
        }
    }

    /// The destination port, if this tuple has one.
    pub fn dst_port(&self) -> Option<u16> {
        match self.l4 {
            L4Tuple::Ports { dst, .. } => Some(dst),
            _ => None,
        }
    }

    /// Swap the addresses, and the ports when present. The ICMP
    /// part is carried over untouched; mapping a query type to its
    /// reply is the ICMP tracker's business.
    pub fn swap_endpoints(&self) -> Self {
        let l4 = match self.l4 {
            L4Tuple::Ports { src, dst } => {
                L4Tuple::Ports { src: dst, dst: src }
            }
            other => other,
        };

        Self { src: self.dst, dst: self.src, proto: self.proto, l4 }
    }
}

impl Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "src={} dst={}", self.src, self.dst)?;
        match self.l4 {
            L4Tuple::Ports { src, dst } => {
                write!(f, " sport={src} dport={dst}")
            }
            L4Tuple::Icmp { id, ty, code } => {
                write!(f, " type={ty} code={code} id={id}")
            }
            L4Tuple::None => Ok(()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn display() {
        let t = Tuple::new_ports(
            Protocol::TCP,
            "10.0.0.1".parse().unwrap(),
            40000,
            "10.0.0.2".parse().unwrap(),
            80,
        );
        assert_eq!(
            t.to_string(),
            "src=10.0.0.1 dst=10.0.0.2 sport=40000 dport=80"
        );

        let i = Tuple::new_icmp(
            "10.0.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
            7,
            8,
            0,
        );
        assert_eq!(
            i.to_string(),
            "src=10.0.0.1 dst=10.0.0.2 type=8 code=0 id=7"
        );
    }

    #[test]
    fn swap_twice_is_identity() {
        let t = Tuple::new_ports(
            Protocol::UDP,
            "192.168.1.10".parse().unwrap(),
            5353,
            "8.8.8.8".parse().unwrap(),
            53,
        );
        assert_eq!(t.swap_endpoints().swap_endpoints(), t);
        assert_eq!(t.swap_endpoints().dst_port(), Some(5353));
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Turning packets into tuples, and tuples into their inverse.
//!
//! The IP layer of a tuple is the same for every protocol; the rest
//! is up to the protocol's tracker.

use super::headers::Ipv4Meta;
use super::headers::ParseError;
use super::proto::ProtoRegistry;
use super::proto::ProtoTracker;
use crate::api::Protocol;
use crate::api::Tuple;

/// Build the tuple of a parsed IPv4 packet.
pub fn parse_tuple(
    ip: &Ipv4Meta,
    tracker: &dyn ProtoTracker,
) -> Result<Tuple, ParseError> {
    let l4 = tracker.pkt_to_tuple(ip.body)?;
    Ok(Tuple {
        src: ip.hdr.src(),
        dst: ip.hdr.dst(),
        proto: Protocol::from(ip.proto()),
        l4,
    })
}

/// The tuple packets flowing the other way would carry, if there is
/// one.
pub fn invert_tuple(
    tuple: &Tuple,
    tracker: &dyn ProtoTracker,
) -> Option<Tuple> {
    tracker.invert_tuple(tuple)
}

/// Parse the tuple of a raw IPv4 packet, picking the tracker from the
/// registry.
pub fn parse_packet(
    pkt: &[u8],
    reg: &ProtoRegistry,
) -> Result<Tuple, ParseError> {
    let ip = Ipv4Meta::parse(pkt)?;
    parse_tuple(&ip, reg.find(ip.proto()).as_ref())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::L4Tuple;
    use crate::engine::proto::generic::GenericTracker;
    use crate::engine::proto::tcp::TcpTracker;
    use crate::engine::proto::udp::UdpTracker;
    use std::sync::Arc;

    fn registry() -> ProtoRegistry {
        let reg = ProtoRegistry::new(Arc::new(GenericTracker));
        reg.register(Arc::new(TcpTracker)).unwrap();
        reg.register(Arc::new(UdpTracker)).unwrap();
        reg
    }

    fn ipv4(proto: u8, body: &[u8]) -> Vec<u8> {
        let total = 20 + body.len();
        let mut b = vec![0u8; 20];
        b[0] = 0x45;
        b[2..4].copy_from_slice(&(total as u16).to_be_bytes());
        b[8] = 64;
        b[9] = proto;
        b[12..16].copy_from_slice(&[10, 0, 0, 1]);
        b[16..20].copy_from_slice(&[10, 0, 0, 2]);
        b.extend_from_slice(body);
        b
    }

    #[test]
    fn tcp_tuple_inverts_twice() {
        let reg = registry();
        let mut tcp = vec![0u8; 20];
        tcp[0..2].copy_from_slice(&40000u16.to_be_bytes());
        tcp[2..4].copy_from_slice(&443u16.to_be_bytes());

        let t = parse_packet(&ipv4(6, &tcp), &reg).unwrap();
        assert_eq!(t.l4, L4Tuple::Ports { src: 40000, dst: 443 });
        assert_eq!(t.proto, Protocol::TCP);

        let tracker = reg.find(6);
        let inv = invert_tuple(&t, tracker.as_ref()).unwrap();
        assert_eq!(inv.src_port(), Some(443));
        assert_eq!(inv.dst, t.src);
        assert_eq!(invert_tuple(&inv, tracker.as_ref()), Some(t));
    }

    #[test]
    fn truncated_ports() {
        let reg = registry();
        let err = parse_packet(&ipv4(17, &[0, 53]), &reg).unwrap_err();
        assert!(matches!(err, ParseError::Truncated { hdr: "UDP", .. }));
    }

    #[test]
    fn unknown_protocol_uses_generic() {
        let reg = registry();
        let t = parse_packet(&ipv4(47, &[0; 4]), &reg).unwrap();
        assert_eq!(t.proto, Protocol::GRE);
        assert_eq!(t.l4, L4Tuple::None);
    }
}

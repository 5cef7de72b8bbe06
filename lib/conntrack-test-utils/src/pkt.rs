// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Packet builders.
//!
//! Every builder returns the bytes of a whole IPv4 packet with valid
//! checksums; wrap them with [`ether_frame`] when a capture wants
//! Ethernet.

use conntrack::api::Ipv4Addr;
use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::EthernetAddress;
use smoltcp::wire::EthernetFrame;
use smoltcp::wire::EthernetProtocol;
use smoltcp::wire::EthernetRepr;
use smoltcp::wire::Icmpv4DstUnreachable;
use smoltcp::wire::Icmpv4Packet;
use smoltcp::wire::Icmpv4Repr;
use smoltcp::wire::IpAddress;
use smoltcp::wire::IpProtocol;
use smoltcp::wire::Ipv4Address;
use smoltcp::wire::Ipv4Packet;
use smoltcp::wire::Ipv4Repr;
pub use smoltcp::wire::TcpControl;
use smoltcp::wire::TcpPacket;
use smoltcp::wire::TcpRepr;
use smoltcp::wire::TcpSeqNumber;
use smoltcp::wire::UdpPacket;
use smoltcp::wire::UdpRepr;

pub const GW_MAC: EthernetAddress =
    EthernetAddress([0xA8, 0x40, 0x25, 0x00, 0x00, 0x01]);
pub const HOST_MAC: EthernetAddress =
    EthernetAddress([0xA8, 0x40, 0x25, 0x00, 0x00, 0x02]);

fn smol(ip: Ipv4Addr) -> Ipv4Address {
    Ipv4Address(ip.bytes())
}

fn smol_ip(ip: Ipv4Addr) -> IpAddress {
    IpAddress::Ipv4(smol(ip))
}

/// Wrap an L4 payload in an IPv4 header. The header smoltcp emits has
/// DF set and an ident of zero.
pub fn ipv4(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    proto: IpProtocol,
    payload: &[u8],
) -> Vec<u8> {
    let repr = Ipv4Repr {
        src_addr: smol(src),
        dst_addr: smol(dst),
        next_header: proto,
        payload_len: payload.len(),
        hop_limit: 64,
    };

    let mut buf = vec![0u8; repr.buffer_len() + payload.len()];
    let mut pkt = Ipv4Packet::new_unchecked(&mut buf[..]);
    repr.emit(&mut pkt, &ChecksumCapabilities::default());
    pkt.payload_mut().copy_from_slice(payload);
    buf
}

/// Clear DF and set the ident, making the packet fair game for
/// fragmentation.
pub fn allow_frag(pkt: &mut [u8], ident: u16) {
    let mut ip = Ipv4Packet::new_unchecked(pkt);
    ip.set_dont_frag(false);
    ip.set_ident(ident);
    ip.fill_checksum();
}

/// A TCP segment's control fields.
#[derive(Clone, Copy, Debug)]
pub struct TcpSeg {
    pub control: TcpControl,
    pub seq: u32,
    pub ack: Option<u32>,
    pub window: u16,
    pub wscale: Option<u8>,
}

impl TcpSeg {
    const WINDOW: u16 = 64240;

    pub fn syn(seq: u32) -> Self {
        Self {
            control: TcpControl::Syn,
            seq,
            ack: None,
            window: Self::WINDOW,
            wscale: None,
        }
    }

    pub fn syn_ack(seq: u32, ack: u32) -> Self {
        Self { ack: Some(ack), ..Self::syn(seq) }
    }

    pub fn ack(seq: u32, ack: u32) -> Self {
        Self {
            control: TcpControl::None,
            seq,
            ack: Some(ack),
            window: Self::WINDOW,
            wscale: None,
        }
    }

    pub fn fin_ack(seq: u32, ack: u32) -> Self {
        Self { control: TcpControl::Fin, ..Self::ack(seq, ack) }
    }

    pub fn rst_ack(seq: u32, ack: u32) -> Self {
        Self { control: TcpControl::Rst, ..Self::ack(seq, ack) }
    }

    pub fn with_wscale(mut self, scale: u8) -> Self {
        self.wscale = Some(scale);
        self
    }
}

pub fn tcp_pkt(
    src: Ipv4Addr,
    sport: u16,
    dst: Ipv4Addr,
    dport: u16,
    seg: TcpSeg,
    payload: &[u8],
) -> Vec<u8> {
    let repr = TcpRepr {
        src_port: sport,
        dst_port: dport,
        control: seg.control,
        seq_number: TcpSeqNumber(seg.seq as i32),
        ack_number: seg.ack.map(|a| TcpSeqNumber(a as i32)),
        window_len: seg.window,
        window_scale: seg.wscale,
        max_seg_size: None,
        sack_permitted: false,
        sack_ranges: [None, None, None],
        payload,
    };

    let mut buf = vec![0u8; repr.buffer_len()];
    let mut tcp = TcpPacket::new_unchecked(&mut buf[..]);
    repr.emit(
        &mut tcp,
        &smol_ip(src),
        &smol_ip(dst),
        &ChecksumCapabilities::default(),
    );
    ipv4(src, dst, IpProtocol::Tcp, &buf)
}

/// Overwrite the TCP flags of a packet built by [`tcp_pkt`], for
/// combinations no sane stack would emit.
pub fn set_tcp_flags(pkt: &mut [u8], flags: u8) {
    let hdr_len = usize::from(pkt[0] & 0x0F) * 4;
    let src = Ipv4Address::from_bytes(&pkt[12..16]);
    let dst = Ipv4Address::from_bytes(&pkt[16..20]);
    pkt[hdr_len + 13] = flags;
    let mut tcp = TcpPacket::new_unchecked(&mut pkt[hdr_len..]);
    tcp.fill_checksum(&IpAddress::Ipv4(src), &IpAddress::Ipv4(dst));
}

pub fn udp_pkt(
    src: Ipv4Addr,
    sport: u16,
    dst: Ipv4Addr,
    dport: u16,
    payload: &[u8],
) -> Vec<u8> {
    let repr = UdpRepr { src_port: sport, dst_port: dport };
    let mut buf = vec![0u8; repr.header_len() + payload.len()];
    let mut udp = UdpPacket::new_unchecked(&mut buf[..]);
    repr.emit(
        &mut udp,
        &smol_ip(src),
        &smol_ip(dst),
        payload.len(),
        |b| b.copy_from_slice(payload),
        &ChecksumCapabilities::default(),
    );
    ipv4(src, dst, IpProtocol::Udp, &buf)
}

pub fn icmp_echo(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    ident: u16,
    seq_no: u16,
    reply: bool,
) -> Vec<u8> {
    let data = b"conntrack";
    let repr = if reply {
        Icmpv4Repr::EchoReply { ident, seq_no, data }
    } else {
        Icmpv4Repr::EchoRequest { ident, seq_no, data }
    };

    let mut buf = vec![0u8; repr.buffer_len()];
    let mut icmp = Icmpv4Packet::new_unchecked(&mut buf[..]);
    repr.emit(&mut icmp, &ChecksumCapabilities::default());
    ipv4(src, dst, IpProtocol::Icmp, &buf)
}

/// A port unreachable error from `src` to `dst`, quoting the header
/// and first eight payload bytes of `orig`.
pub fn icmp_port_unreach(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    orig: &[u8],
) -> Vec<u8> {
    let inner = Ipv4Packet::new_checked(orig).unwrap();
    let header =
        Ipv4Repr::parse(&inner, &ChecksumCapabilities::ignored()).unwrap();
    let body = inner.payload();
    let data = &body[..body.len().min(8)];
    let repr = Icmpv4Repr::DstUnreachable {
        reason: Icmpv4DstUnreachable::PortUnreachable,
        header,
        data,
    };

    let mut buf = vec![0u8; repr.buffer_len()];
    let mut icmp = Icmpv4Packet::new_unchecked(&mut buf[..]);
    repr.emit(&mut icmp, &ChecksumCapabilities::default());
    ipv4(src, dst, IpProtocol::Icmp, &buf)
}

/// Put an IPv4 packet in an Ethernet frame, as captured on the wire.
pub fn ether_frame(ip: &[u8], outbound: bool) -> Vec<u8> {
    let (src_addr, dst_addr) =
        if outbound { (HOST_MAC, GW_MAC) } else { (GW_MAC, HOST_MAC) };
    let repr =
        EthernetRepr { src_addr, dst_addr, ethertype: EthernetProtocol::Ipv4 };

    let mut buf = vec![0u8; repr.buffer_len() + ip.len()];
    let mut frame = EthernetFrame::new_unchecked(&mut buf[..]);
    repr.emit(&mut frame);
    frame.payload_mut().copy_from_slice(ip);
    buf
}

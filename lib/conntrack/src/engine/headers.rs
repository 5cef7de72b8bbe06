// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Raw IPv4, TCP, UDP and ICMP headers.
//!
//! These are thin, unaligned views over packet bytes. Nothing here
//! interprets state; the trackers and the tuple codec do that.

use crate::api::Ipv4Addr;
use bitflags::bitflags;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::Unaligned;
use zerocopy::network_endian::U16;
use zerocopy::network_endian::U32;

pub const IPV4_HDR_LEN_MIN: usize = 20;
pub const IPV4_VERSION: u8 = 4;
pub const IPV4_FLAG_DF: u16 = 0x4000;
pub const IPV4_FLAG_MF: u16 = 0x2000;
pub const IPV4_FRAG_OFF_MASK: u16 = 0x1FFF;

pub const TCP_HDR_LEN_MIN: usize = 20;
pub const TCP_HDR_OFFSET_MASK: u8 = 0xF0;
pub const TCP_HDR_OFFSET_SHIFT: u8 = 4;

pub const TCP_OPT_EOL: u8 = 0;
pub const TCP_OPT_NOP: u8 = 1;
pub const TCP_OPT_WSCALE: u8 = 3;
/// RFC 7323 §2.3: shift counts above 14 are treated as 14.
pub const TCP_MAX_WSCALE: u8 = 14;

pub const UDP_HDR_LEN: usize = 8;
pub const ICMP_HDR_LEN: usize = 8;

/// Errors raised while reading headers out of a packet.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum ParseError {
    #[error("{hdr} header truncated: need {need} bytes, have {have}")]
    Truncated { hdr: &'static str, need: usize, have: usize },

    #[error("bad IP version {0}")]
    BadVersion(u8),

    #[error("bad {hdr} header length {len}")]
    BadHeaderLen { hdr: &'static str, len: usize },

    #[error("IP total length {total} exceeds packet length {have}")]
    BadTotalLen { total: usize, have: usize },

    #[error("no tracker able to parse protocol {0}")]
    UnknownProtocol(u8),

    #[error("{0}")]
    Malformed(&'static str),
}

impl From<ParseError> for crate::api::CtError {
    fn from(e: ParseError) -> Self {
        Self::InvalidPacket(e.to_string())
    }
}

fn truncated(hdr: &'static str, need: usize, have: usize) -> ParseError {
    ParseError::Truncated { hdr, need, have }
}

#[repr(C)]
#[derive(
    Clone, Copy, Debug, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
)]
pub struct Ipv4HdrRaw {
    pub ver_hdr_len: u8,
    pub dscp_ecn: u8,
    pub total_len: U16,
    pub ident: U16,
    pub frag_and_flags: U16,
    pub ttl: u8,
    pub proto: u8,
    pub csum: [u8; 2],
    pub src: [u8; 4],
    pub dst: [u8; 4],
}

impl Ipv4HdrRaw {
    pub fn version(&self) -> u8 {
        self.ver_hdr_len >> 4
    }

    /// Header length in bytes.
    pub fn hdr_len(&self) -> usize {
        usize::from(self.ver_hdr_len & 0x0F) * 4
    }

    pub fn src(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.src)
    }

    pub fn dst(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.dst)
    }

    pub fn dont_frag(&self) -> bool {
        self.frag_and_flags.get() & IPV4_FLAG_DF != 0
    }

    pub fn more_frags(&self) -> bool {
        self.frag_and_flags.get() & IPV4_FLAG_MF != 0
    }

    /// Fragment offset in bytes.
    pub fn frag_offset(&self) -> usize {
        usize::from(self.frag_and_flags.get() & IPV4_FRAG_OFF_MASK) * 8
    }

    /// Is this packet a piece of a larger datagram?
    pub fn is_fragment(&self) -> bool {
        self.more_frags() || self.frag_offset() != 0
    }
}

/// The validated IPv4 layer of a packet.
#[derive(Clone, Copy, Debug)]
pub struct Ipv4Meta<'a> {
    pub hdr: &'a Ipv4HdrRaw,
    /// Header length in bytes, options included.
    pub hdr_len: usize,
    /// Total length per the header, which may be shorter than the
    /// buffer holding it.
    pub total_len: usize,
    /// The IP payload, trimmed to `total_len`.
    pub body: &'a [u8],
}

impl<'a> Ipv4Meta<'a> {
    /// Parse and sanity check an IPv4 header at the start of `bytes`.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, ParseError> {
        let (hdr, _) = Ipv4HdrRaw::ref_from_prefix(bytes).map_err(|_| {
            truncated("IPv4", IPV4_HDR_LEN_MIN, bytes.len())
        })?;

        if hdr.version() != IPV4_VERSION {
            return Err(ParseError::BadVersion(hdr.version()));
        }

        let hdr_len = hdr.hdr_len();
        if hdr_len < IPV4_HDR_LEN_MIN {
            return Err(ParseError::BadHeaderLen { hdr: "IPv4", len: hdr_len });
        }

        if bytes.len() < hdr_len {
            return Err(truncated("IPv4", hdr_len, bytes.len()));
        }

        let total_len = usize::from(hdr.total_len.get());
        if total_len < hdr_len {
            return Err(ParseError::BadHeaderLen {
                hdr: "IPv4",
                len: total_len,
            });
        }

        if total_len > bytes.len() {
            return Err(ParseError::BadTotalLen {
                total: total_len,
                have: bytes.len(),
            });
        }

        Ok(Self { hdr, hdr_len, total_len, body: &bytes[hdr_len..total_len] })
    }

    /// Parse the datagram quoted in an ICMP error. The quote usually
    /// stops shortly after the transport header, so the total length
    /// is not held against the buffer; the body is whatever follows
    /// the IP header.
    pub fn parse_quoted(bytes: &'a [u8]) -> Result<Self, ParseError> {
        let (hdr, _) = Ipv4HdrRaw::ref_from_prefix(bytes).map_err(|_| {
            truncated("quoted IPv4", IPV4_HDR_LEN_MIN, bytes.len())
        })?;

        if hdr.version() != IPV4_VERSION {
            return Err(ParseError::BadVersion(hdr.version()));
        }

        let hdr_len = hdr.hdr_len();
        if hdr_len < IPV4_HDR_LEN_MIN || bytes.len() < hdr_len {
            return Err(ParseError::BadHeaderLen {
                hdr: "quoted IPv4",
                len: hdr_len,
            });
        }

        let total_len = usize::from(hdr.total_len.get());
        let end = total_len.clamp(hdr_len, bytes.len());
        Ok(Self { hdr, hdr_len, total_len, body: &bytes[hdr_len..end] })
    }

    pub fn proto(&self) -> u8 {
        self.hdr.proto
    }

    /// The IP header, options included.
    pub fn hdr_bytes(&self, pkt: &'a [u8]) -> &'a [u8] {
        &pkt[..self.hdr_len]
    }
}

bitflags! {
    /// TCP control flags.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct TcpFlags: u8 {
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PSH = 0x08;
        const ACK = 0x10;
        const URG = 0x20;
        const ECE = 0x40;
        const CWR = 0x80;
    }
}

#[repr(C)]
#[derive(
    Clone, Copy, Debug, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
)]
pub struct TcpHdrRaw {
    pub src_port: U16,
    pub dst_port: U16,
    pub seq: U32,
    pub ack: U32,
    pub offset: u8,
    pub flags: u8,
    pub window: U16,
    pub csum: [u8; 2],
    pub urg: U16,
}

/// A parsed TCP header, plus the bits of its segment the tracker
/// needs.
#[derive(Clone, Copy, Debug)]
pub struct TcpMeta {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    /// Header length in bytes.
    pub hdr_len: usize,
    /// Bytes of payload carried by the segment.
    pub data_len: usize,
    /// The window scale option, if present (only meaningful on SYN).
    pub wscale: Option<u8>,
    /// Whether the SYN carried a SACK permitted option.
    pub sack_perm: bool,
}

impl TcpMeta {
    pub fn parse(body: &[u8]) -> Result<Self, ParseError> {
        let (hdr, _) = TcpHdrRaw::ref_from_prefix(body)
            .map_err(|_| truncated("TCP", TCP_HDR_LEN_MIN, body.len()))?;

        let hdr_len = usize::from(
            (hdr.offset & TCP_HDR_OFFSET_MASK) >> TCP_HDR_OFFSET_SHIFT,
        ) * 4;
        if hdr_len < TCP_HDR_LEN_MIN {
            return Err(ParseError::BadHeaderLen { hdr: "TCP", len: hdr_len });
        }

        if body.len() < hdr_len {
            return Err(truncated("TCP", hdr_len, body.len()));
        }

        let flags = TcpFlags::from_bits_retain(hdr.flags);
        let (wscale, sack_perm) = if flags.contains(TcpFlags::SYN) {
            parse_syn_opts(&body[TCP_HDR_LEN_MIN..hdr_len])
        } else {
            (None, false)
        };

        Ok(Self {
            src_port: hdr.src_port.get(),
            dst_port: hdr.dst_port.get(),
            seq: hdr.seq.get(),
            ack: hdr.ack.get(),
            flags,
            window: hdr.window.get(),
            hdr_len,
            data_len: body.len() - hdr_len,
            wscale,
            sack_perm,
        })
    }

    pub fn has_flag(&self, flag: TcpFlags) -> bool {
        self.flags.contains(flag)
    }
}

const TCP_OPT_SACK_PERM: u8 = 4;

/// Walk the options of a SYN looking for window scale and SACK
/// permitted. A malformed option list ends the walk without error;
/// whatever was found up to that point stands.
fn parse_syn_opts(mut opts: &[u8]) -> (Option<u8>, bool) {
    let mut wscale = None;
    let mut sack_perm = false;

    while let Some(&kind) = opts.first() {
        match kind {
            TCP_OPT_EOL => break,
            TCP_OPT_NOP => {
                opts = &opts[1..];
                continue;
            }
            _ => {}
        }

        let Some(&len) = opts.get(1) else { break };
        let len = usize::from(len);
        if len < 2 || len > opts.len() {
            break;
        }

        match kind {
            TCP_OPT_WSCALE if len == 3 => {
                wscale = Some(opts[2].min(TCP_MAX_WSCALE));
            }
            TCP_OPT_SACK_PERM if len == 2 => sack_perm = true,
            _ => {}
        }

        opts = &opts[len..];
    }

    (wscale, sack_perm)
}

#[repr(C)]
#[derive(
    Clone, Copy, Debug, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
)]
pub struct UdpHdrRaw {
    pub src_port: U16,
    pub dst_port: U16,
    pub len: U16,
    pub csum: [u8; 2],
}

impl UdpHdrRaw {
    pub fn parse(body: &[u8]) -> Result<&Self, ParseError> {
        let (hdr, _) = UdpHdrRaw::ref_from_prefix(body)
            .map_err(|_| truncated("UDP", UDP_HDR_LEN, body.len()))?;
        Ok(hdr)
    }
}

pub const ICMP_ECHO_REPLY: u8 = 0;
pub const ICMP_DEST_UNREACH: u8 = 3;
pub const ICMP_SOURCE_QUENCH: u8 = 4;
pub const ICMP_REDIRECT: u8 = 5;
pub const ICMP_ECHO: u8 = 8;
pub const ICMP_TIME_EXCEEDED: u8 = 11;
pub const ICMP_PARAMETER_PROB: u8 = 12;
pub const ICMP_TIMESTAMP: u8 = 13;
pub const ICMP_TIMESTAMP_REPLY: u8 = 14;
pub const ICMP_INFO_REQUEST: u8 = 15;
pub const ICMP_INFO_REPLY: u8 = 16;
pub const ICMP_ADDRESS: u8 = 17;
pub const ICMP_ADDRESS_REPLY: u8 = 18;

/// Codes for `ICMP_DEST_UNREACH`.
pub const ICMP_FRAG_NEEDED: u8 = 4;

#[repr(C)]
#[derive(
    Clone, Copy, Debug, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
)]
pub struct IcmpHdrRaw {
    pub ty: u8,
    pub code: u8,
    pub csum: [u8; 2],
    /// For queries: identifier then sequence number. For errors:
    /// unused, or the next-hop MTU.
    pub rest: [u8; 4],
}

impl IcmpHdrRaw {
    pub fn parse(body: &[u8]) -> Result<&Self, ParseError> {
        let (hdr, _) = IcmpHdrRaw::ref_from_prefix(body)
            .map_err(|_| truncated("ICMP", ICMP_HDR_LEN, body.len()))?;
        Ok(hdr)
    }

    pub fn id(&self) -> u16 {
        u16::from_be_bytes([self.rest[0], self.rest[1]])
    }

    /// Is this one of the error types which quote the offending
    /// datagram?
    pub fn is_error(&self) -> bool {
        matches!(
            self.ty,
            ICMP_DEST_UNREACH
                | ICMP_SOURCE_QUENCH
                | ICMP_REDIRECT
                | ICMP_TIME_EXCEEDED
                | ICMP_PARAMETER_PROB
        )
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Tuple templates.
//!
//! A [`TupleMatch`] describes a set of tuples. Helpers use one to say
//! which connections they want to inspect, and expectations use one
//! to describe the related flow they predict.

use crate::api::Ipv4Addr;
use crate::api::Ipv4Cidr;
use crate::api::L4Tuple;
use crate::api::Protocol;
use crate::api::Tuple;
use core::fmt;
use core::fmt::Display;
use core::ops::RangeInclusive;
use serde::Deserialize;
use serde::Serialize;

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Ipv4AddrMatch {
    Any,
    /// Match an exact address.
    Exact(Ipv4Addr),
    /// Match an address in the same CIDR block.
    Prefix(Ipv4Cidr),
}

impl Ipv4AddrMatch {
    pub fn matches(&self, ip: Ipv4Addr) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(addr) => ip == *addr,
            Self::Prefix(cidr) => cidr.is_member(ip),
        }
    }

    fn as_cidr(&self) -> Ipv4Cidr {
        match self {
            Self::Any => Ipv4Cidr::ANY,
            Self::Exact(addr) => Ipv4Cidr::host(*addr),
            Self::Prefix(cidr) => *cidr,
        }
    }

    /// Is there an address both matchers accept?
    pub fn overlaps(&self, other: &Self) -> bool {
        self.as_cidr().overlaps(&other.as_cidr())
    }
}

impl Display for Ipv4AddrMatch {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Any => write!(f, "*"),
            Self::Exact(ip) => write!(f, "{ip}"),
            Self::Prefix(cidr) => write!(f, "{cidr}"),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum PortMatch {
    Any,
    Exact(u16),
    Range(RangeInclusive<u16>),
}

impl PortMatch {
    pub fn matches(&self, port: Option<u16>) -> bool {
        match (self, port) {
            (Self::Any, _) => true,
            (Self::Exact(p), Some(port)) => port == *p,
            (Self::Range(r), Some(port)) => r.contains(&port),
            (_, None) => false,
        }
    }

    fn bounds(&self) -> (u16, u16) {
        match self {
            Self::Any => (0, u16::MAX),
            Self::Exact(p) => (*p, *p),
            Self::Range(r) => (*r.start(), *r.end()),
        }
    }

    pub fn overlaps(&self, other: &Self) -> bool {
        let (a_lo, a_hi) = self.bounds();
        let (b_lo, b_hi) = other.bounds();
        a_lo <= b_hi && b_lo <= a_hi
    }
}

impl Display for PortMatch {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Any => write!(f, "*"),
            Self::Exact(p) => write!(f, "{p}"),
            Self::Range(r) => write!(f, "{}-{}", r.start(), r.end()),
        }
    }
}

/// A template over tuples: every field must match.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct TupleMatch {
    pub proto: Protocol,
    pub src: Ipv4AddrMatch,
    pub dst: Ipv4AddrMatch,
    pub src_port: PortMatch,
    pub dst_port: PortMatch,
}

impl TupleMatch {
    /// Match any tuple of `proto`.
    pub fn any(proto: Protocol) -> Self {
        Self {
            proto,
            src: Ipv4AddrMatch::Any,
            dst: Ipv4AddrMatch::Any,
            src_port: PortMatch::Any,
            dst_port: PortMatch::Any,
        }
    }

    /// Match connections to a given destination port of `proto`, the
    /// usual criteria for a helper.
    pub fn dst_port(proto: Protocol, port: u16) -> Self {
        Self { dst_port: PortMatch::Exact(port), ..Self::any(proto) }
    }

    /// Match exactly one tuple.
    pub fn exact(t: &Tuple) -> Self {
        let (src_port, dst_port) = match t.l4 {
            L4Tuple::Ports { src, dst } => {
                (PortMatch::Exact(src), PortMatch::Exact(dst))
            }
            _ => (PortMatch::Any, PortMatch::Any),
        };

        Self {
            proto: t.proto,
            src: Ipv4AddrMatch::Exact(t.src),
            dst: Ipv4AddrMatch::Exact(t.dst),
            src_port,
            dst_port,
        }
    }

    pub fn matches(&self, t: &Tuple) -> bool {
        self.proto == t.proto
            && self.src.matches(t.src)
            && self.dst.matches(t.dst)
            && self.src_port.matches(t.src_port())
            && self.dst_port.matches(t.dst_port())
    }

    /// Is there a tuple both templates would match?
    pub fn overlaps(&self, other: &Self) -> bool {
        self.proto == other.proto
            && self.src.overlaps(&other.src)
            && self.dst.overlaps(&other.dst)
            && self.src_port.overlaps(&other.src_port)
            && self.dst_port.overlaps(&other.dst_port)
    }
}

impl Display for TupleMatch {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "proto={} src={} dst={} sport={} dport={}",
            self.proto, self.src, self.dst, self.src_port, self.dst_port
        )
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! ICMP tracking.
//!
//! Queries (echo, timestamp, information and address mask requests)
//! start connections whose reply tuple carries the matching reply
//! type. Errors never start anything: they quote the head of the
//! datagram they complain about, and are tied to that datagram's
//! connection as related traffic.

use super::ErrorCheck;
use super::ProtoRegistry;
use super::ProtoState;
use super::ProtoTracker;
use super::TrackCtx;
use super::TrackVerdict;
use crate::api::Direction;
use crate::api::L4Tuple;
use crate::api::PROTO_ICMP;
use crate::api::Tuple;
use crate::engine::cfg::ConntrackCfg;
use crate::engine::checksum::Checksum;
use crate::engine::headers::*;
use crate::engine::hook::HookPoint;
use crate::engine::tuple::parse_tuple;
use core::time::Duration;

/// The highest ICMP type we know of; anything above it is invalid.
const ICMP_MAX_TYPE: u8 = ICMP_ADDRESS_REPLY;

/// The reply type for each query type.
fn reply_type(ty: u8) -> Option<u8> {
    match ty {
        ICMP_ECHO => Some(ICMP_ECHO_REPLY),
        ICMP_ECHO_REPLY => Some(ICMP_ECHO),
        ICMP_TIMESTAMP => Some(ICMP_TIMESTAMP_REPLY),
        ICMP_TIMESTAMP_REPLY => Some(ICMP_TIMESTAMP),
        ICMP_INFO_REQUEST => Some(ICMP_INFO_REPLY),
        ICMP_INFO_REPLY => Some(ICMP_INFO_REQUEST),
        ICMP_ADDRESS => Some(ICMP_ADDRESS_REPLY),
        ICMP_ADDRESS_REPLY => Some(ICMP_ADDRESS),
        _ => None,
    }
}

/// Requests still waiting for a reply.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct IcmpConnState {
    pub outstanding: u32,
}

pub struct IcmpTracker;

impl ProtoTracker for IcmpTracker {
    fn proto(&self) -> u8 {
        PROTO_ICMP
    }

    fn name(&self) -> &'static str {
        "icmp"
    }

    fn pkt_to_tuple(&self, body: &[u8]) -> Result<L4Tuple, ParseError> {
        let icmp = IcmpHdrRaw::parse(body)?;
        Ok(L4Tuple::Icmp { id: icmp.id(), ty: icmp.ty, code: icmp.code })
    }

    fn invert_tuple(&self, tuple: &Tuple) -> Option<Tuple> {
        let L4Tuple::Icmp { id, ty, code } = tuple.l4 else {
            return None;
        };

        let mut inv = tuple.swap_endpoints();
        inv.l4 = L4Tuple::Icmp { id, ty: reply_type(ty)?, code };
        Some(inv)
    }

    fn error(
        &self,
        ip: &Ipv4Meta,
        hook: HookPoint,
        reg: &ProtoRegistry,
    ) -> ErrorCheck {
        let Ok(icmp) = IcmpHdrRaw::parse(ip.body) else {
            return ErrorCheck::Invalid("truncated ICMP header");
        };

        // Packets we generated ourselves have not been checksummed
        // yet, so only check what arrives from the wire.
        if hook == HookPoint::PreRouting
            && Checksum::compute(ip.body).finalize() != 0xFFFF
        {
            return ErrorCheck::Invalid("bad ICMP checksum");
        }

        if icmp.ty > ICMP_MAX_TYPE {
            return ErrorCheck::Invalid("invalid ICMP type");
        }

        if !icmp.is_error() {
            return ErrorCheck::NotError;
        }

        let Ok(inner) = Ipv4Meta::parse_quoted(&ip.body[ICMP_HDR_LEN..]) else {
            return ErrorCheck::Invalid(
                "ICMP error quotes a malformed datagram",
            );
        };

        if inner.hdr.frag_offset() != 0 {
            return ErrorCheck::Invalid("ICMP error quotes a trailing fragment");
        }

        let tracker = reg.find(inner.proto());
        let Ok(quoted) = parse_tuple(&inner, tracker.as_ref()) else {
            return ErrorCheck::Invalid("ICMP error quotes too little");
        };

        // The quoted datagram travelled the other way; the error
        // itself belongs to whatever direction its inverse does.
        let Some(lookup) = tracker.invert_tuple(&quoted) else {
            return ErrorCheck::Invalid("ICMP error about a one-way flow");
        };

        ErrorCheck::Related { lookup, quoted }
    }

    fn new(
        &self,
        ip: &Ipv4Meta,
        _cfg: &ConntrackCfg,
    ) -> Result<ProtoState, &'static str> {
        let icmp =
            IcmpHdrRaw::parse(ip.body).map_err(|_| "truncated ICMP header")?;

        match icmp.ty {
            ICMP_ECHO | ICMP_TIMESTAMP | ICMP_INFO_REQUEST | ICMP_ADDRESS => {
                Ok(ProtoState::Icmp(IcmpConnState::default()))
            }
            _ => Err("not an ICMP query"),
        }
    }

    fn packet(&self, ctx: &mut TrackCtx) -> TrackVerdict {
        let ProtoState::Icmp(st) = &mut ctx.inner.proto else {
            return TrackVerdict::Invalid("connection has no ICMP state");
        };

        match ctx.dir {
            Direction::Original => {
                st.outstanding = st.outstanding.saturating_add(1);
                ctx.refresh(Duration::from_secs(ctx.cfg.icmp.timeout));
            }
            Direction::Reply => {
                st.outstanding = st.outstanding.saturating_sub(1);
            }
        }

        TrackVerdict::Accept
    }

    fn print(&self, state: &ProtoState) -> String {
        match state {
            ProtoState::Icmp(st) => format!("outstanding={}", st.outstanding),
            _ => String::new(),
        }
    }
}

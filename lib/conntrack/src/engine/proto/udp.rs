// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! UDP tracking.
//!
//! UDP has no state to speak of. A flow which has only been seen one
//! way gets the short timeout; once it has been seen both ways it is
//! treated as a stream and gets the long one.

use super::ErrorCheck;
use super::ProtoRegistry;
use super::ProtoState;
use super::ProtoTracker;
use super::TrackCtx;
use super::TrackVerdict;
use super::parse_ports;
use crate::api::L4Tuple;
use crate::api::PROTO_UDP;
use crate::api::Tuple;
use crate::engine::cfg::ConntrackCfg;
use crate::engine::headers::Ipv4Meta;
use crate::engine::headers::ParseError;
use crate::engine::headers::UDP_HDR_LEN;
use crate::engine::headers::UdpHdrRaw;
use crate::engine::hook::HookPoint;
use core::time::Duration;

pub struct UdpTracker;

impl ProtoTracker for UdpTracker {
    fn proto(&self) -> u8 {
        PROTO_UDP
    }

    fn name(&self) -> &'static str {
        "udp"
    }

    fn pkt_to_tuple(&self, body: &[u8]) -> Result<L4Tuple, ParseError> {
        parse_ports("UDP", body)
    }

    fn invert_tuple(&self, tuple: &Tuple) -> Option<Tuple> {
        Some(tuple.swap_endpoints())
    }

    fn error(
        &self,
        ip: &Ipv4Meta,
        _hook: HookPoint,
        _reg: &ProtoRegistry,
    ) -> ErrorCheck {
        let Ok(udp) = UdpHdrRaw::parse(ip.body) else {
            return ErrorCheck::Invalid("truncated UDP header");
        };

        let len = usize::from(udp.len.get());
        if len < UDP_HDR_LEN || len > ip.body.len() {
            return ErrorCheck::Invalid("bad UDP length");
        }

        ErrorCheck::NotError
    }

    fn new(
        &self,
        _ip: &Ipv4Meta,
        _cfg: &ConntrackCfg,
    ) -> Result<ProtoState, &'static str> {
        Ok(ProtoState::None)
    }

    fn packet(&self, ctx: &mut TrackCtx) -> TrackVerdict {
        if ctx.seen_reply() {
            ctx.refresh(Duration::from_secs(ctx.cfg.udp.timeout_stream));
            ctx.assure = true;
        } else {
            ctx.refresh(Duration::from_secs(ctx.cfg.udp.timeout));
        }

        TrackVerdict::Accept
    }

    fn print(&self, _state: &ProtoState) -> String {
        String::new()
    }
}

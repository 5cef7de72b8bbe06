// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The fallback tracker, for protocols nothing else claims.

use super::ProtoState;
use super::ProtoTracker;
use super::TrackCtx;
use super::TrackVerdict;
use crate::api::L4Tuple;
use crate::api::Tuple;
use crate::engine::cfg::ConntrackCfg;
use crate::engine::headers::Ipv4Meta;
use crate::engine::headers::ParseError;
use core::time::Duration;

/// Tracks flows by address pair alone, with a single timeout.
pub struct GenericTracker;

impl ProtoTracker for GenericTracker {
    /// Never registered under a number; the registry falls back to it.
    fn proto(&self) -> u8 {
        0
    }

    fn name(&self) -> &'static str {
        "generic"
    }

    fn pkt_to_tuple(&self, _body: &[u8]) -> Result<L4Tuple, ParseError> {
        Ok(L4Tuple::None)
    }

    fn invert_tuple(&self, tuple: &Tuple) -> Option<Tuple> {
        Some(tuple.swap_endpoints())
    }

    fn new(
        &self,
        _ip: &Ipv4Meta,
        _cfg: &ConntrackCfg,
    ) -> Result<ProtoState, &'static str> {
        Ok(ProtoState::None)
    }

    fn packet(&self, ctx: &mut TrackCtx) -> TrackVerdict {
        ctx.refresh(Duration::from_secs(ctx.cfg.generic.timeout));
        TrackVerdict::Accept
    }

    fn print(&self, _state: &ProtoState) -> String {
        String::new()
    }
}

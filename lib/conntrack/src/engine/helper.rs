// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Connection helpers.
//!
//! A helper is attached to a connection when the connection is
//! created: either inherited from the expectation it matched, or
//! picked from the registry by the connection's original tuple. It
//! then sees every tracked packet of the connection (save related
//! replies) just before confirmation, and may register expectations
//! for connections the payload announces.

use super::conn::Conn;
use super::conn::CtInfo;
use super::expect::ExpectStore;
use super::expect::Expectation;
use super::headers::Ipv4Meta;
use super::headers::TcpMeta;
use super::headers::UDP_HDR_LEN;
use super::hook::Verdict;
use super::predicate::TupleMatch;
use crate::api::CtError;
use crate::api::Direction;
use crate::api::PROTO_TCP;
use crate::api::PROTO_UDP;
use crate::api::Tuple;
use crate::ddi::sync::KRwLock;
use crate::ddi::time::Moment;
use core::time::Duration;
use std::sync::Arc;

pub trait Helper: Send + Sync {
    /// A unique name, shown in dumps.
    fn name(&self) -> &'static str;

    /// The original tuples of the connections this helper wants.
    fn tuple_match(&self) -> &TupleMatch;

    /// The most expectations one master may hold at once. Zero means
    /// no limit beyond the store's.
    fn max_expected(&self) -> u32 {
        0
    }

    /// How long an expectation created by this helper lives.
    fn expect_timeout(&self) -> Duration;

    /// Inspect a packet of a helped connection.
    fn help(&self, ctx: &mut HelpCtx) -> Verdict;
}

/// What a helper sees of a packet.
pub struct HelpCtx<'a> {
    pub conn: &'a Arc<Conn>,
    pub info: CtInfo,
    pub dir: Direction,
    /// The whole IPv4 packet.
    pub pkt: &'a [u8],
    pub now: Moment,
    expects: &'a ExpectStore,
}

impl<'a> HelpCtx<'a> {
    pub(crate) fn new(
        conn: &'a Arc<Conn>,
        info: CtInfo,
        dir: Direction,
        pkt: &'a [u8],
        now: Moment,
        expects: &'a ExpectStore,
    ) -> Self {
        Self { conn, info, dir, pkt, now, expects }
    }

    /// The transport payload of a TCP or UDP packet.
    pub fn payload(&self) -> Option<&'a [u8]> {
        let ip = Ipv4Meta::parse(self.pkt).ok()?;
        match ip.proto() {
            PROTO_TCP => {
                let tcp = TcpMeta::parse(ip.body).ok()?;
                ip.body.get(tcp.hdr_len..)
            }
            PROTO_UDP => ip.body.get(UDP_HDR_LEN..),
            _ => None,
        }
    }

    /// The tuple of this packet's direction.
    pub fn tuple(&self) -> Tuple {
        self.conn.tuple(self.dir)
    }

    /// Start an expectation owned by this connection.
    pub fn expect(&self, template: TupleMatch) -> Expectation {
        self.expects.alloc(self.conn, template)
    }

    pub fn related(
        &self,
        exp: Expectation,
    ) -> Result<Arc<Expectation>, CtError> {
        self.expects.related(exp, self.now)
    }

    pub fn unexpect(&self, exp: &Expectation) -> bool {
        self.expects.unexpect(exp)
    }

    pub fn change(
        &self,
        exp: &Expectation,
        template: TupleMatch,
    ) -> Result<(), CtError> {
        self.expects.change(exp, template)
    }
}

/// The registered helpers, in registration order.
#[derive(Default)]
pub struct HelperRegistry {
    helpers: KRwLock<Vec<Arc<dyn Helper>>>,
}

impl HelperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a helper. A second helper with the same name, or with the
    /// same match criteria as one already registered, is refused.
    pub fn register(&self, helper: Arc<dyn Helper>) -> Result<(), CtError> {
        let mut helpers = self.helpers.write();
        if let Some(existing) = helpers.iter().find(|h| {
            h.name() == helper.name()
                || h.tuple_match() == helper.tuple_match()
        }) {
            return Err(CtError::Busy(format!(
                "helper {} (held by {})",
                helper.name(),
                existing.name()
            )));
        }

        helpers.push(helper);
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> Result<Arc<dyn Helper>, CtError> {
        let mut helpers = self.helpers.write();
        let pos = helpers
            .iter()
            .position(|h| h.name() == name)
            .ok_or_else(|| CtError::NotFound(format!("helper {name}")))?;
        Ok(helpers.remove(pos))
    }

    /// The first helper wanting connections with original tuple
    /// `tuple`.
    pub fn find(&self, tuple: &Tuple) -> Option<Arc<dyn Helper>> {
        self.helpers
            .read()
            .iter()
            .find(|h| h.tuple_match().matches(tuple))
            .cloned()
    }

    pub fn list(&self) -> Vec<&'static str> {
        self.helpers.read().iter().map(|h| h.name()).collect()
    }
}

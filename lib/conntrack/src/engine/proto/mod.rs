// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Protocol trackers.
//!
//! A tracker knows how to pull the protocol-specific part of a tuple
//! out of a packet, how to invert it, and how to drive the state of a
//! connection of its protocol. Trackers are registered by protocol
//! number in a [`ProtoRegistry`]; any protocol without one is handled
//! by the [`generic::GenericTracker`].

pub mod generic;
pub mod icmp;
pub mod tcp;
pub mod udp;

use super::cfg::ConntrackCfg;
use super::conn::Conn;
use super::conn::ConnInner;
use super::conn::CtInfo;
use super::headers::Ipv4Meta;
use super::headers::ParseError;
use super::hook::HookPoint;
use crate::api::CtError;
use crate::api::Direction;
use crate::api::L4Tuple;
use crate::api::Tuple;
use crate::ddi::sync::KRwLock;
use crate::ddi::time::Moment;
use core::any::Any;
use core::time::Duration;
use std::collections::BTreeMap;
use std::sync::Arc;

pub use tcp::TcpConnState;

/// The per-connection state a tracker keeps.
pub enum ProtoState {
    /// Nothing beyond the timeout.
    None,
    Tcp(TcpConnState),
    Icmp(icmp::IcmpConnState),
    /// State for trackers registered from outside this crate.
    Other(Box<dyn Any + Send>),
}

/// The outcome of a tracker looking at a packet.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TrackVerdict {
    Accept,
    /// The packet doesn't fit the connection's state. It continues
    /// untracked, per the invalid-packet policy, and the connection is
    /// left alone.
    Invalid(&'static str),
    /// Drop the packet whatever the policy says.
    Drop(&'static str),
    /// The connection was killed; look the packet up again so it can
    /// start a fresh one.
    Repeat,
}

/// What a tracker's error check decided about a packet, before any
/// tuple is parsed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ErrorCheck {
    /// Track it normally.
    NotError,
    Invalid(&'static str),
    /// The packet reports on another flow (an ICMP error). `lookup` is
    /// the tuple the reported-on connection would have in the
    /// direction this packet travels; `quoted` is the tuple of the
    /// quoted datagram itself.
    Related { lookup: Tuple, quoted: Tuple },
}

/// The context a tracker's `packet` sees.
pub struct TrackCtx<'a, 'b> {
    pub conn: &'a Conn,
    /// The connection's mutable state, locked for the duration of the
    /// call.
    pub inner: &'a mut ConnInner,
    pub dir: Direction,
    pub info: CtInfo,
    pub ip: &'a Ipv4Meta<'b>,
    pub now: Moment,
    pub cfg: &'a ConntrackCfg,
    /// Set by the tracker to delete the connection once the packet is
    /// done with it.
    pub kill: bool,
    /// Set by the tracker to mark the connection assured once the
    /// reply bit has been updated.
    pub assure: bool,
}

impl TrackCtx<'_, '_> {
    /// Apply a new timeout to the connection.
    pub fn refresh(&mut self, timeout: Duration) {
        let confirmed = self.conn.is_confirmed();
        self.inner.refresh(confirmed, self.now, timeout);
    }

    /// Has the connection seen a reply, counting this packet?
    pub fn seen_reply(&self) -> bool {
        self.dir == Direction::Reply
            || self
                .conn
                .status()
                .contains(super::conn::ConnStatus::SEEN_REPLY)
    }
}

/// A protocol tracker.
pub trait ProtoTracker: Send + Sync {
    /// The IP protocol number this tracker handles.
    fn proto(&self) -> u8;

    fn name(&self) -> &'static str;

    /// Pull the protocol-specific part of the tuple out of the IP
    /// payload. The payload may be a quoted header inside an ICMP
    /// error, so only the first few bytes are guaranteed.
    fn pkt_to_tuple(&self, body: &[u8]) -> Result<L4Tuple, ParseError>;

    /// The tuple a reply to `tuple` would carry, or `None` if a packet
    /// with this tuple cannot start a flow which has replies.
    fn invert_tuple(&self, tuple: &Tuple) -> Option<Tuple>;

    /// Screen a packet before it is parsed into a tuple.
    fn error(
        &self,
        _ip: &Ipv4Meta,
        _hook: HookPoint,
        _reg: &ProtoRegistry,
    ) -> ErrorCheck {
        ErrorCheck::NotError
    }

    /// Build the state for a connection this packet would create, or
    /// refuse to create one.
    fn new(
        &self,
        ip: &Ipv4Meta,
        cfg: &ConntrackCfg,
    ) -> Result<ProtoState, &'static str>;

    /// Process a packet belonging to a connection, updating its state
    /// and timeout.
    fn packet(&self, ctx: &mut TrackCtx) -> TrackVerdict;

    /// A short summary of the connection state, e.g. the TCP state.
    fn print(&self, state: &ProtoState) -> String;
}

/// Read the source and destination ports which lead both the TCP and
/// UDP headers.
pub(crate) fn parse_ports(
    hdr: &'static str,
    body: &[u8],
) -> Result<L4Tuple, ParseError> {
    match body {
        [s0, s1, d0, d1, ..] => Ok(L4Tuple::Ports {
            src: u16::from_be_bytes([*s0, *s1]),
            dst: u16::from_be_bytes([*d0, *d1]),
        }),
        _ => Err(ParseError::Truncated { hdr, need: 4, have: body.len() }),
    }
}

/// The registered trackers, keyed by protocol number.
pub struct ProtoRegistry {
    trackers: KRwLock<BTreeMap<u8, Arc<dyn ProtoTracker>>>,
    generic: Arc<dyn ProtoTracker>,
}

impl ProtoRegistry {
    /// A registry holding only the generic fallback.
    pub fn new(generic: Arc<dyn ProtoTracker>) -> Self {
        Self { trackers: KRwLock::new(BTreeMap::new()), generic }
    }

    /// The tracker for `proto`, or the generic tracker if none is
    /// registered.
    pub fn find(&self, proto: u8) -> Arc<dyn ProtoTracker> {
        self.trackers
            .read()
            .get(&proto)
            .cloned()
            .unwrap_or_else(|| self.generic.clone())
    }

    pub fn is_registered(&self, proto: u8) -> bool {
        self.trackers.read().contains_key(&proto)
    }

    pub fn register(
        &self,
        tracker: Arc<dyn ProtoTracker>,
    ) -> Result<(), CtError> {
        let proto = tracker.proto();
        let mut trackers = self.trackers.write();
        if let Some(existing) = trackers.get(&proto) {
            return Err(CtError::Busy(format!(
                "tracker {} for protocol {proto}",
                existing.name()
            )));
        }

        trackers.insert(proto, tracker);
        Ok(())
    }

    pub fn unregister(
        &self,
        proto: u8,
    ) -> Result<Arc<dyn ProtoTracker>, CtError> {
        self.trackers
            .write()
            .remove(&proto)
            .ok_or_else(|| CtError::NotFound(format!("tracker for {proto}")))
    }

    pub fn generic(&self) -> &Arc<dyn ProtoTracker> {
        &self.generic
    }

    /// The registered protocol numbers and tracker names.
    pub fn list(&self) -> Vec<(u8, &'static str)> {
        self.trackers.read().iter().map(|(p, t)| (*p, t.name())).collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::PROTO_TCP;

    #[test]
    fn duplicate_registration_busy() {
        let reg = ProtoRegistry::new(Arc::new(generic::GenericTracker));
        reg.register(Arc::new(tcp::TcpTracker)).unwrap();
        let err = reg.register(Arc::new(tcp::TcpTracker)).unwrap_err();
        assert!(matches!(err, CtError::Busy(_)));
        assert_eq!(reg.find(PROTO_TCP).name(), "tcp");

        reg.unregister(PROTO_TCP).unwrap();
        assert_eq!(reg.find(PROTO_TCP).name(), "generic");
        assert!(reg.unregister(PROTO_TCP).is_err());
    }
}

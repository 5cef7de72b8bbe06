// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Hook points and the table of handlers registered on them.
//!
//! The engine doesn't see packets on its own: whoever moves packets
//! calls [`HookTable::run`] at each interception point, and the
//! handlers registered there, in priority order, decide the packet's
//! fate.

use super::packet::Packet;
use crate::api::CtError;
use crate::ddi::sync::KRwLock;
use crate::ddi::time::Moment;
use core::fmt;
use core::fmt::Display;
use core::str::FromStr;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Where in the packet's journey a hook runs.
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
pub enum HookPoint {
    /// Every packet arriving from the wire.
    PreRouting,
    /// Packets addressed to this host.
    LocalIn,
    /// Packets passing through.
    Forward,
    /// Packets this host originates.
    LocalOut,
    /// Every packet about to leave.
    PostRouting,
}

impl Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::PreRouting => "PRE_ROUTING",
            Self::LocalIn => "LOCAL_IN",
            Self::Forward => "FORWARD",
            Self::LocalOut => "LOCAL_OUT",
            Self::PostRouting => "POST_ROUTING",
        };
        write!(f, "{s}")
    }
}

impl FromStr for HookPoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "pre_routing" | "prerouting" => Ok(Self::PreRouting),
            "local_in" | "input" => Ok(Self::LocalIn),
            "forward" => Ok(Self::Forward),
            "local_out" | "output" => Ok(Self::LocalOut),
            "post_routing" | "postrouting" => Ok(Self::PostRouting),
            _ => Err(format!("unknown hook point: {s}")),
        }
    }
}

/// Priorities of the handlers the engine registers. Lower runs first.
pub mod priority {
    pub const DEFRAG: i32 = -400;
    pub const CONNTRACK: i32 = -200;
    pub const HELPER: i32 = i32::MAX - 2;
    pub const CONFIRM: i32 = i32::MAX;
}

/// The fate of a packet at a hook.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Verdict {
    /// Hand it to the next handler.
    Accept,
    Drop,
    /// A handler took the packet; nothing more is to be done with it.
    Stolen,
    /// Queued for userspace.
    Queue,
    /// Run the same handler again.
    Repeat,
}

impl Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Accept => "ACCEPT",
            Self::Drop => "DROP",
            Self::Stolen => "STOLEN",
            Self::Queue => "QUEUE",
            Self::Repeat => "REPEAT",
        };
        write!(f, "{s}")
    }
}

/// What a hook run knows besides the packet.
#[derive(Debug, Default)]
pub struct HookCtx {
    pub now: Moment,
    /// MTU of the interface the packet leaves on, if it is leaving.
    pub out_mtu: Option<usize>,
    /// Packets a handler produced in place of the one it stole, e.g.
    /// the fragments of a refragmented datagram.
    pub emitted: Vec<Packet>,
}

impl HookCtx {
    pub fn new(now: Moment) -> Self {
        Self { now, out_mtu: None, emitted: Vec::new() }
    }

    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.out_mtu = Some(mtu);
        self
    }
}

pub type HookFn =
    Box<dyn Fn(HookPoint, &mut Packet, &mut HookCtx) -> Verdict + Send + Sync>;

/// A handler and where it goes.
pub struct HookOps {
    pub name: &'static str,
    pub hook: HookPoint,
    pub priority: i32,
    pub handler: HookFn,
}

impl fmt::Debug for HookOps {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("HookOps")
            .field("name", &self.name)
            .field("hook", &self.hook)
            .field("priority", &self.priority)
            .finish()
    }
}

/// A handler asking for a repeat more than this many times in a row
/// gets the packet dropped.
pub const MAX_REPEATS: u8 = 3;

/// Handlers per hook point, kept sorted by priority. Handlers with
/// equal priority run in registration order.
#[derive(Default)]
pub struct HookTable {
    hooks: KRwLock<BTreeMap<HookPoint, Vec<Arc<HookOps>>>>,
}

impl HookTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, ops: HookOps) {
        let mut hooks = self.hooks.write();
        let list = hooks.entry(ops.hook).or_default();
        let pos = list.partition_point(|h| h.priority <= ops.priority);
        list.insert(pos, Arc::new(ops));
    }

    /// Remove the handler named `name` from `hook`.
    pub fn unregister(
        &self,
        hook: HookPoint,
        name: &str,
    ) -> Result<(), CtError> {
        let mut hooks = self.hooks.write();
        let list = hooks.entry(hook).or_default();
        let before = list.len();
        list.retain(|h| h.name != name);
        if list.len() == before {
            return Err(CtError::NotFound(format!("hook {name} on {hook}")));
        }

        Ok(())
    }

    /// The names and priorities of the handlers on `hook`, in run
    /// order.
    pub fn list(&self, hook: HookPoint) -> Vec<(&'static str, i32)> {
        self.hooks
            .read()
            .get(&hook)
            .map(|l| l.iter().map(|h| (h.name, h.priority)).collect())
            .unwrap_or_default()
    }

    /// Run every handler on `hook` over `pkt`. The result is
    /// `Accept` only if every handler accepted.
    pub fn run(
        &self,
        hook: HookPoint,
        pkt: &mut Packet,
        ctx: &mut HookCtx,
    ) -> Verdict {
        // Handlers may themselves consult the table, so don't hold
        // the lock while they run.
        let handlers = match self.hooks.read().get(&hook) {
            Some(list) => list.clone(),
            None => return Verdict::Accept,
        };

        for ops in handlers {
            let mut repeats = 0;
            loop {
                match (ops.handler)(hook, pkt, ctx) {
                    Verdict::Accept => break,
                    Verdict::Repeat if repeats < MAX_REPEATS => repeats += 1,
                    Verdict::Repeat => return Verdict::Drop,
                    v => return v,
                }
            }
        }

        Verdict::Accept
    }
}

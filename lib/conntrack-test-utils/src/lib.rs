// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Common routines for integration tests, the replay tool's tests and
//! benchmarks.

pub mod pcap;
pub mod pkt;

pub use conntrack::ExecCtx;
pub use conntrack::api::Direction;
pub use conntrack::api::Ipv4Addr;
pub use conntrack::api::Protocol;
pub use conntrack::api::TcpCtState;
pub use conntrack::api::Tuple;
pub use conntrack::ddi::time::Moment;
pub use conntrack::engine::ConntrackCfg;
pub use conntrack::engine::ConntrackEngine;
pub use conntrack::engine::CtInfo;
pub use conntrack::engine::HookCtx;
pub use conntrack::engine::HookPoint;
pub use conntrack::engine::HookTable;
pub use conntrack::engine::Packet;
pub use conntrack::engine::Verdict;
pub use pkt::*;

use conntrack::provider::NullLog;
use std::sync::Arc;

/// Parse a dotted-quad address.
pub fn ip(s: &str) -> Ipv4Addr {
    s.parse().unwrap()
}

/// An engine which logs to stdout, so `cargo test -- --nocapture`
/// shows what it did.
pub fn engine(cfg: ConntrackCfg) -> Arc<ConntrackEngine> {
    ConntrackEngine::init(cfg, Arc::new(ExecCtx::println())).unwrap()
}

/// An engine which logs nothing.
pub fn quiet_engine(cfg: ConntrackCfg) -> Arc<ConntrackEngine> {
    let ectx = ExecCtx { log: Box::new(NullLog) };
    ConntrackEngine::init(cfg, Arc::new(ectx)).unwrap()
}

/// An engine wired into a hook table, standing in for one host's
/// packet path.
pub struct Host {
    pub engine: Arc<ConntrackEngine>,
    pub hooks: HookTable,
}

impl Host {
    pub fn new(engine: Arc<ConntrackEngine>) -> Self {
        let hooks = HookTable::new();
        engine.register_hooks(&hooks);
        Self { engine, hooks }
    }

    /// Run a packet this host originates through `LocalOut` and
    /// `PostRouting`.
    pub fn send(&self, pkt: &mut Packet, ctx: &mut HookCtx) -> Verdict {
        self.path(pkt, ctx, [HookPoint::LocalOut, HookPoint::PostRouting])
    }

    /// Run a packet arriving for this host through `PreRouting` and
    /// `LocalIn`.
    pub fn recv(&self, pkt: &mut Packet, ctx: &mut HookCtx) -> Verdict {
        self.path(pkt, ctx, [HookPoint::PreRouting, HookPoint::LocalIn])
    }

    /// Send `bytes` at time `now`, returning the verdict and the
    /// packet as the hooks left it.
    pub fn send_bytes(&self, bytes: Vec<u8>, now: Moment) -> (Verdict, Packet) {
        let mut pkt = Packet::new(bytes);
        let v = self.send(&mut pkt, &mut HookCtx::new(now));
        (v, pkt)
    }

    pub fn recv_bytes(&self, bytes: Vec<u8>, now: Moment) -> (Verdict, Packet) {
        let mut pkt = Packet::new(bytes);
        let v = self.recv(&mut pkt, &mut HookCtx::new(now));
        (v, pkt)
    }

    fn path(
        &self,
        pkt: &mut Packet,
        ctx: &mut HookCtx,
        hooks: [HookPoint; 2],
    ) -> Verdict {
        for hook in hooks {
            let v = self.hooks.run(hook, pkt, ctx);
            if v != Verdict::Accept {
                return v;
            }
        }
        Verdict::Accept
    }
}

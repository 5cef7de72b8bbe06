// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The connection tracking engine.
//!
//! [`ConntrackEngine`] owns the connection table, the expectation
//! store and the tracker and helper registries, and exposes the stages
//! of the packet path as hook handlers:
//!
//! * `defrag`: gather fragments before anything else looks at them.
//! * `conntrack_in`: find or create the packet's connection and run
//!   its protocol tracker.
//! * `help`: hand the packet to the connection's helper.
//! * `confirm`: make a new connection visible in the table.
//! * `refrag`: confirm, then split a datagram too big for the link.
//!
//! [`ConntrackEngine::hook_ops`] lays these out on the hook points at
//! their fixed priorities.
//!
//! No stage ever returns an error to its caller. Malformed or
//! unexpected packets turn into a verdict under the configured
//! invalid-packet policy; exhaustion turns into `Drop`.

use super::cfg::ConntrackCfg;
use super::conn::AllocToken;
use super::conn::Conn;
use super::conn::ConnStatus;
use super::conn::CtInfo;
use super::defrag::FragQueue;
use super::defrag::Reassembler;
use super::defrag::fragment_ipv4;
use super::expect::ExpectStore;
use super::headers::Ipv4Meta;
use super::helper::HelpCtx;
use super::helper::Helper;
use super::helper::HelperRegistry;
use super::hook::HookCtx;
use super::hook::HookOps;
use super::hook::HookPoint;
use super::hook::HookTable;
use super::hook::Verdict;
use super::hook::priority;
use super::packet::CtAttach;
use super::packet::Packet;
use super::proto::ErrorCheck;
use super::proto::ProtoRegistry;
use super::proto::ProtoTracker;
use super::proto::TrackCtx;
use super::proto::TrackVerdict;
use super::proto::generic::GenericTracker;
use super::proto::icmp::IcmpTracker;
use super::proto::tcp::TcpTracker;
use super::proto::udp::UdpTracker;
use super::stat::ConntrackStats;
use super::stat::StatsDump;
use super::table::Clash;
use super::table::ConnTable;
use super::tuple::parse_tuple;
use crate::ExecCtx;
use crate::LogLevel;
use crate::api::ConnDump;
use crate::api::CtError;
use crate::api::Direction;
use crate::api::DumpConnsResp;
use crate::api::DumpExpectsResp;
use crate::api::Protocol;
use crate::api::Tuple;
use crate::ddi::stat::PerCpu;
use crate::ddi::sync::KMutex;
use crate::ddi::time::Interval;
use crate::ddi::time::Moment;
use crate::ddi::time::Periodic;
use core::sync::atomic::AtomicBool;
use core::sync::atomic::Ordering;
use core::time::Duration;
use itertools::Itertools;
use std::sync::Arc;
use std::sync::Weak;

/// How the packet relates to a connection found in the table.
fn ctinfo(conn: &Conn, dir: Direction) -> CtInfo {
    let status = conn.status().get();
    if dir == Direction::Reply || status.contains(ConnStatus::SEEN_REPLY) {
        CtInfo::Established
    } else if status.contains(ConnStatus::EXPECTED) {
        CtInfo::Related
    } else {
        CtInfo::New
    }
}

pub struct ConntrackEngine {
    cfg: ConntrackCfg,
    ectx: Arc<ExecCtx>,
    table: ConnTable,
    expects: ExpectStore,
    protos: ProtoRegistry,
    helpers: HelperRegistry,
    reasm: Box<dyn Reassembler>,
    stats: Arc<PerCpu<ConntrackStats>>,
    running: AtomicBool,
    gc: KMutex<Option<Periodic>>,
}

impl ConntrackEngine {
    /// Build an engine with the built-in TCP, UDP and ICMP trackers
    /// and an in-memory reassembly queue.
    pub fn init(
        cfg: ConntrackCfg,
        ectx: Arc<ExecCtx>,
    ) -> Result<Arc<Self>, CtError> {
        let reasm = Box::new(FragQueue::new(
            cfg.frag_timeout(),
            cfg.frag_max_datagrams,
        ));
        Self::init_with_reassembler(cfg, ectx, reasm)
    }

    /// Build an engine which hands fragments to `reasm`.
    pub fn init_with_reassembler(
        cfg: ConntrackCfg,
        ectx: Arc<ExecCtx>,
        reasm: Box<dyn Reassembler>,
    ) -> Result<Arc<Self>, CtError> {
        cfg.validate()?;

        let stats = Arc::new(PerCpu::new());
        let engine = Self {
            table: ConnTable::new(cfg.hashsize, cfg.max_conns, stats.clone()),
            expects: ExpectStore::new(cfg.expect_max, stats.clone()),
            protos: ProtoRegistry::new(Arc::new(GenericTracker)),
            helpers: HelperRegistry::new(),
            reasm,
            stats,
            running: AtomicBool::new(true),
            gc: KMutex::new(None),
            cfg,
            ectx,
        };

        engine.protos.register(Arc::new(TcpTracker))?;
        engine.protos.register(Arc::new(UdpTracker))?;
        engine.protos.register(Arc::new(IcmpTracker))?;

        engine.ectx.log(
            LogLevel::Note,
            &format!(
                "conntrack: {} buckets, max {} connections",
                engine.cfg.hashsize, engine.cfg.max_conns
            ),
        );
        Ok(Arc::new(engine))
    }

    pub fn cfg(&self) -> &ConntrackCfg {
        &self.cfg
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn table(&self) -> &ConnTable {
        &self.table
    }

    pub fn expects(&self) -> &ExpectStore {
        &self.expects
    }

    pub fn protos(&self) -> &ProtoRegistry {
        &self.protos
    }

    pub fn helpers(&self) -> &HelperRegistry {
        &self.helpers
    }

    fn log(&self, level: LogLevel, msg: &str) {
        self.ectx.log(level, msg);
    }

    /// Count an invalid packet and decide its fate.
    fn invalid(&self, proto: u8, reason: &str) -> Verdict {
        self.stats.get().invalid.incr(1);
        if self.cfg.log_invalid(proto) {
            self.log(
                LogLevel::Note,
                &format!("invalid packet (proto {proto}): {reason}"),
            );
        }
        self.cfg.invalid_policy.verdict()
    }

    // ================================================================
    // Packet path
    // ================================================================

    /// Classify a packet and run its connection's tracker. On success
    /// the packet leaves attached to its connection; otherwise it
    /// leaves untouched, with whatever verdict the failure calls for.
    pub fn conntrack_in(
        &self,
        hook: HookPoint,
        pkt: &mut Packet,
        now: Moment,
    ) -> Verdict {
        if !self.is_running() {
            return Verdict::Accept;
        }

        // Looped back, or seen at an earlier hook.
        if pkt.ct().is_some() {
            self.stats.get().ignore.incr(1);
            return Verdict::Accept;
        }

        match self.track(hook, pkt.data(), now) {
            Ok(CtAttach { conn, info, dir }) => {
                pkt.attach(conn, info, dir);
                Verdict::Accept
            }
            Err(verdict) => verdict,
        }
    }

    fn track(
        &self,
        hook: HookPoint,
        data: &[u8],
        now: Moment,
    ) -> Result<CtAttach, Verdict> {
        let proto = data.get(9).copied().unwrap_or(0);
        let ip = Ipv4Meta::parse(data)
            .map_err(|e| self.invalid(proto, &e.to_string()))?;

        // The defrag stage should have caught these.
        if ip.hdr.is_fragment() {
            return Err(self.invalid(proto, "unreassembled fragment"));
        }

        let tracker = self.protos.find(proto);
        match tracker.error(&ip, hook, &self.protos) {
            ErrorCheck::NotError => {}
            ErrorCheck::Invalid(reason) => {
                return Err(self.invalid(proto, reason));
            }
            ErrorCheck::Related { lookup, quoted } => {
                return self.related_error(hook, proto, &lookup, &quoted);
            }
        }

        let tuple = parse_tuple(&ip, tracker.as_ref())
            .map_err(|e| self.invalid(proto, &e.to_string()))?;

        let (conn, dir, info) = match self.table.find(&tuple) {
            Some((conn, dir)) => {
                let info = ctinfo(&conn, dir);
                (conn, dir, info)
            }
            None => self.init_conn(&ip, tuple, tracker.as_ref(), now)?,
        };

        let (verdict, kill, assure) = {
            let mut inner = conn.lock();
            let mut ctx = TrackCtx {
                conn: &conn,
                inner: &mut inner,
                dir,
                info,
                ip: &ip,
                now,
                cfg: &self.cfg,
                kill: false,
                assure: false,
            };
            let verdict = tracker.packet(&mut ctx);
            (verdict, ctx.kill, ctx.assure)
        };

        if kill {
            self.delete(&conn);
        }

        match verdict {
            TrackVerdict::Accept => {
                if dir == Direction::Reply {
                    conn.status().set_seen_reply();
                }
                if assure {
                    conn.status().set_assured();
                }
                conn.account(dir, data.len());
                Ok(CtAttach { conn, info, dir })
            }

            TrackVerdict::Invalid(reason) => Err(self.invalid(proto, reason)),

            TrackVerdict::Drop(reason) => {
                self.stats.get().invalid.incr(1);
                if self.cfg.log_invalid(proto) {
                    self.log(
                        LogLevel::Note,
                        &format!("dropping packet (proto {proto}): {reason}"),
                    );
                }
                Err(Verdict::Drop)
            }

            TrackVerdict::Repeat => {
                self.stats.get().repeat.incr(1);
                Err(Verdict::Repeat)
            }
        }
    }

    /// Attach an ICMP error to the connection it reports on.
    fn related_error(
        &self,
        hook: HookPoint,
        proto: u8,
        lookup: &Tuple,
        quoted: &Tuple,
    ) -> Result<CtAttach, Verdict> {
        let found = self.table.find(lookup).or_else(|| {
            // Errors we generate ourselves match the quoted tuple
            // as is.
            if hook == HookPoint::LocalOut {
                self.table.find(quoted).map(|(c, d)| (c, d.inverse()))
            } else {
                None
            }
        });

        let Some((conn, dir)) = found else {
            return Err(self.invalid(proto, "ICMP error for unknown conn"));
        };

        self.stats.get().icmp_error.incr(1);
        Ok(CtAttach { conn, info: CtInfo::Related, dir })
    }

    /// Create the connection for the first packet of a flow.
    fn init_conn(
        &self,
        ip: &Ipv4Meta,
        tuple: Tuple,
        tracker: &dyn ProtoTracker,
        now: Moment,
    ) -> Result<(Arc<Conn>, Direction, CtInfo), Verdict> {
        let proto = ip.proto();
        let Some(reply) = tracker.invert_tuple(&tuple) else {
            return Err(self.invalid(proto, "cannot invert tuple"));
        };

        let token = match self.table.reserve() {
            Some(token) => token,
            None => self.make_room(&tuple)?,
        };

        let state = tracker
            .new(ip, &self.cfg)
            .map_err(|reason| self.invalid(proto, reason))?;

        let exp = self.expects.take_match(&tuple, now);
        let master = exp.as_ref().map(|e| e.master());
        let conn = self.table.alloc(token, tuple, reply, state, master);

        let helper = match &exp {
            Some(e) => e.helper().cloned(),
            None => self.helpers.find(&tuple),
        };
        conn.lock().helper = helper;

        let info = match exp {
            Some(exp) => {
                self.stats.get().expect_new.incr(1);
                exp.matched(&conn);
                CtInfo::Related
            }
            None => CtInfo::New,
        };

        Ok((conn, Direction::Original, info))
    }

    /// The table is full: evict a connection hashing near `orig` and
    /// take the slot it frees. A victim still held by a packet in
    /// flight keeps its slot until that packet is done, in which case
    /// this packet is dropped.
    fn make_room(&self, orig: &Tuple) -> Result<AllocToken, Verdict> {
        if let Some(victim) = self.table.early_drop(orig) {
            self.expects.remove_master(victim.id());
            drop(victim);
            if let Some(token) = self.table.reserve() {
                return Ok(token);
            }
        }

        self.stats.get().drop.incr(1);
        self.log(
            LogLevel::Warn,
            &format!(
                "table full ({} entries), dropping packet",
                self.table.max()
            ),
        );
        Err(Verdict::Drop)
    }

    /// Insert the packet's connection into the table if it isn't
    /// there yet. Should another packet have confirmed a connection
    /// with the same tuples first, this packet moves over to that one
    /// and ours is discarded.
    pub fn confirm(&self, pkt: &mut Packet, now: Moment) -> Verdict {
        let Some(ct) = pkt.ct() else {
            return Verdict::Accept;
        };

        if ct.dir == Direction::Reply || ct.conn.is_confirmed() {
            return Verdict::Accept;
        }

        let Err(Clash { winner }) = self.table.confirm(&ct.conn, now) else {
            return Verdict::Accept;
        };

        let loser = ct.conn.clone();
        self.expects.remove_master(loser.id());
        self.log(
            LogLevel::Note,
            &format!("lost confirm race for {}", loser.orig()),
        );

        match winner {
            Some((conn, dir)) => {
                // The loser counted this packet; it belongs to the
                // winner now.
                conn.account(dir, pkt.len());
                let info = ctinfo(&conn, dir);
                pkt.attach(conn, info, dir);
            }
            None => {
                pkt.detach();
            }
        }

        Verdict::Accept
    }

    /// Run the connection's helper, if it has one.
    pub fn help(&self, pkt: &Packet, now: Moment) -> Verdict {
        let Some(ct) = pkt.ct() else {
            return Verdict::Accept;
        };

        if ct.info == CtInfo::Related && ct.dir == Direction::Reply {
            return Verdict::Accept;
        }

        let Some(helper) = ct.conn.helper() else {
            return Verdict::Accept;
        };

        let mut hctx = HelpCtx::new(
            &ct.conn,
            ct.info,
            ct.dir,
            pkt.data(),
            now,
            &self.expects,
        );
        helper.help(&mut hctx)
    }

    /// Swap a fragment for its whole datagram. The packet is stolen
    /// while the datagram is still incomplete.
    pub fn defrag(&self, pkt: &mut Packet, now: Moment) -> Verdict {
        if pkt.ct().is_some() {
            return Verdict::Accept;
        }

        // Anything unparseable is left for the tracking stage to
        // count.
        match Ipv4Meta::parse(pkt.data()) {
            Ok(ip) if ip.hdr.is_fragment() => {}
            _ => return Verdict::Accept,
        }

        let data = core::mem::take(pkt.data_mut());
        match self.reasm.gather(data, now) {
            Ok(Some(whole)) => {
                *pkt.data_mut() = whole;
                Verdict::Accept
            }
            Ok(None) => {
                self.stats.get().defrag_consumed.incr(1);
                Verdict::Stolen
            }
            Err(e) => {
                self.log(LogLevel::Note, &format!("reassembly failed: {e}"));
                Verdict::Drop
            }
        }
    }

    /// Confirm, then fragment the packet if it has outgrown the
    /// outbound link. The fragments are handed back through
    /// `ctx.emitted` and the original is stolen.
    pub fn refrag(&self, pkt: &mut Packet, ctx: &mut HookCtx) -> Verdict {
        let verdict = self.confirm(pkt, ctx.now);
        if verdict != Verdict::Accept {
            return verdict;
        }

        let Some(mtu) = ctx.out_mtu else {
            return Verdict::Accept;
        };

        if pkt.len() <= mtu || pkt.is_gso() {
            return Verdict::Accept;
        }

        match fragment_ipv4(pkt.data(), mtu) {
            Ok(frags) => {
                for frag in frags {
                    let mut p = Packet::new(frag);
                    if let Some(ct) = pkt.ct() {
                        p.attach(ct.conn.clone(), ct.info, ct.dir);
                    }
                    ctx.emitted.push(p);
                }
                self.stats.get().refrag.incr(1);
                Verdict::Stolen
            }
            Err(e) => {
                self.log(
                    LogLevel::Note,
                    &format!("refragmenting to MTU {mtu} failed: {e}"),
                );
                Verdict::Drop
            }
        }
    }

    /// The engine's handlers, ready for a [`HookTable`].
    pub fn hook_ops(self: &Arc<Self>) -> Vec<HookOps> {
        let mut ops = Vec::with_capacity(8);

        for hook in [HookPoint::PreRouting, HookPoint::LocalOut] {
            let e = self.clone();
            ops.push(HookOps {
                name: "defrag",
                hook,
                priority: priority::DEFRAG,
                handler: Box::new(move |_, pkt, ctx| e.defrag(pkt, ctx.now)),
            });

            let e = self.clone();
            ops.push(HookOps {
                name: "conntrack",
                hook,
                priority: priority::CONNTRACK,
                handler: Box::new(move |hook, pkt, ctx| {
                    e.conntrack_in(hook, pkt, ctx.now)
                }),
            });
        }

        for hook in [HookPoint::PostRouting, HookPoint::LocalIn] {
            let e = self.clone();
            ops.push(HookOps {
                name: "helper",
                hook,
                priority: priority::HELPER,
                handler: Box::new(move |_, pkt, ctx| e.help(pkt, ctx.now)),
            });
        }

        let e = self.clone();
        ops.push(HookOps {
            name: "confirm",
            hook: HookPoint::PostRouting,
            priority: priority::CONFIRM,
            handler: Box::new(move |_, pkt, ctx| e.refrag(pkt, ctx)),
        });

        let e = self.clone();
        ops.push(HookOps {
            name: "confirm",
            hook: HookPoint::LocalIn,
            priority: priority::CONFIRM,
            handler: Box::new(move |_, pkt, ctx| e.confirm(pkt, ctx.now)),
        });

        ops
    }

    pub fn register_hooks(self: &Arc<Self>, table: &HookTable) {
        for ops in self.hook_ops() {
            table.register(ops);
        }
    }

    pub fn unregister_hooks(&self, table: &HookTable) -> Result<(), CtError> {
        for (hook, name) in [
            (HookPoint::PreRouting, "defrag"),
            (HookPoint::PreRouting, "conntrack"),
            (HookPoint::LocalOut, "defrag"),
            (HookPoint::LocalOut, "conntrack"),
            (HookPoint::PostRouting, "helper"),
            (HookPoint::LocalIn, "helper"),
            (HookPoint::PostRouting, "confirm"),
            (HookPoint::LocalIn, "confirm"),
        ] {
            table.unregister(hook, name)?;
        }
        Ok(())
    }

    // ================================================================
    // Table management
    // ================================================================

    pub fn find(&self, tuple: &Tuple) -> Option<(Arc<Conn>, Direction)> {
        self.table.find(tuple)
    }

    /// Is `tuple` used by some connection other than `ignore`?
    pub fn tuple_taken(&self, tuple: &Tuple, ignore: &Conn) -> bool {
        self.table.is_taken(tuple, ignore.id())
    }

    /// Delete a connection along with its expectations. Returns false
    /// if someone else got there first.
    pub fn delete(&self, conn: &Conn) -> bool {
        if !self.table.delete(conn) {
            return false;
        }

        self.expects.remove_master(conn.id());
        true
    }

    /// Delete every connection matching `pred`, returning the count.
    pub fn cleanup_by_predicate<F>(&self, pred: F) -> usize
    where
        F: Fn(&Conn) -> bool,
    {
        let gone = self.table.cleanup_by_predicate(pred);
        for conn in &gone {
            self.expects.remove_master(conn.id());
        }
        gone.len()
    }

    /// Expire connections, expectations and partial datagrams whose
    /// time is up as of `now`. Returns the number of connections
    /// expired.
    pub fn expire_at(&self, now: Moment) -> usize {
        let gone = self.table.expire(now);
        for conn in &gone {
            self.expects.remove_master(conn.id());
        }

        self.expects.expire_at(now);
        let frags = self.reasm.expire(now);
        if frags > 0 {
            self.log(
                LogLevel::Note,
                &format!("reassembly timed out for {frags} datagrams"),
            );
        }
        gone.len()
    }

    /// Start a thread expiring connections every `interval`. It stops
    /// at shutdown, or when the engine is dropped.
    pub fn start_gc(
        self: &Arc<Self>,
        interval: Duration,
    ) -> Result<(), CtError> {
        fn tick(engine: &mut Weak<ConntrackEngine>) {
            if let Some(engine) = engine.upgrade() {
                engine.expire_at(Moment::now());
            }
        }

        let periodic = Periodic::new(
            "conntrack-gc".to_string(),
            tick,
            Box::new(Arc::downgrade(self)),
            Interval::from_duration(interval),
        )
        .map_err(|e| CtError::BadState(format!("gc thread: {e}")))?;

        *self.gc.lock() = Some(periodic);
        Ok(())
    }

    // ================================================================
    // Registration
    // ================================================================

    pub fn register_tracker(
        &self,
        tracker: Arc<dyn ProtoTracker>,
    ) -> Result<(), CtError> {
        let (proto, name) = (tracker.proto(), tracker.name());
        if let Err(e) = self.protos.register(tracker) {
            self.log(
                LogLevel::Warn,
                &format!("tracker {name} for protocol {proto}: {e}"),
            );
            return Err(e);
        }

        self.log(
            LogLevel::Note,
            &format!("registered tracker {name} for protocol {proto}"),
        );
        Ok(())
    }

    /// Remove the tracker for `proto` and every connection it was
    /// tracking.
    pub fn unregister_tracker(&self, proto: u8) -> Result<(), CtError> {
        let tracker = self.protos.unregister(proto)?;
        let proto = Protocol::from(proto);
        let gone = self.cleanup_by_predicate(|c| c.orig().proto == proto);
        self.log(
            LogLevel::Note,
            &format!(
                "unregistered tracker {}, {gone} connections deleted",
                tracker.name()
            ),
        );
        Ok(())
    }

    pub fn register_helper(
        &self,
        helper: Arc<dyn Helper>,
    ) -> Result<(), CtError> {
        let name = helper.name();
        self.helpers.register(helper)?;
        self.log(LogLevel::Note, &format!("registered helper {name}"));
        Ok(())
    }

    /// Remove a helper. Its expectations go with it; connections it
    /// was helping carry on without a helper.
    pub fn unregister_helper(&self, name: &str) -> Result<(), CtError> {
        self.helpers.unregister(name)?;
        let expects = self.expects.remove_helper(name);

        for conn in self.table.dump() {
            let mut inner = conn.lock();
            if inner.helper.as_ref().is_some_and(|h| h.name() == name) {
                inner.helper = None;
            }
        }

        self.log(
            LogLevel::Note,
            &format!("unregistered helper {name}, {expects} expectations"),
        );
        Ok(())
    }

    // ================================================================
    // Introspection
    // ================================================================

    pub fn dump_conns(&self, now: Moment) -> DumpConnsResp {
        let conns: Vec<ConnDump> = self
            .table
            .dump()
            .iter()
            .sorted_by_key(|c| c.id())
            .map(|c| {
                let proto = c.orig().proto;
                let tracker = self.protos.find(u8::from(proto));
                let inner = c.lock();
                ConnDump {
                    id: c.id(),
                    proto,
                    orig: *c.orig(),
                    reply: inner.reply,
                    timeout_ms: inner.expires.map(|e| e.delta_as_millis(now)),
                    status: c.status_dump(),
                    proto_state: tracker.print(&inner.proto),
                    helper: inner.helper.as_ref().map(|h| h.name().into()),
                    master: c.master(),
                    pkts: c.pkts(),
                    bytes: c.bytes(),
                }
            })
            .collect();

        DumpConnsResp::new(
            conns.len() as u64,
            u64::from(self.table.max()),
            conns,
        )
    }

    pub fn dump_expects(&self, now: Moment) -> DumpExpectsResp {
        DumpExpectsResp::new(self.expects.dump(now))
    }

    pub fn stats(&self) -> StatsDump {
        StatsDump::from(self.stats.as_ref())
    }

    /// Stop tracking. Every connection and expectation is flushed and
    /// later packets pass untracked.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        // Dropping the periodic waits out a running tick; don't do it
        // under the lock.
        let gc = self.gc.lock().take();
        drop(gc);

        let conns = self.cleanup_by_predicate(|_| true);
        let expects = self.expects.flush();
        self.log(
            LogLevel::Note,
            &format!(
                "conntrack shut down: {conns} connections, \
                 {expects} expectations flushed"
            ),
        );
    }
}

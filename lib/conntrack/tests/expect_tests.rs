// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Helpers and expectations, end to end.
//!
//! The helper here understands a toy control protocol: a client line
//! `PORT <n>` asks the server to connect back to the client on port
//! `n`, much like active-mode FTP.

use common::*;
use conntrack::api::CtError;
use conntrack::engine::Conn;
use conntrack::engine::expect::Expectation;
use conntrack::engine::helper::HelpCtx;
use conntrack::engine::helper::Helper;
use conntrack::engine::hook::HookOps;
use conntrack::engine::hook::priority;
use conntrack::engine::predicate::Ipv4AddrMatch;
use conntrack::engine::predicate::PortMatch;
use conntrack::engine::predicate::TupleMatch;
use conntrack::print::print_expects_into;
use conntrack_test_utils as common;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

const CTL_PORT: u16 = 2121;
const CLIENT_ISN: u32 = 1000;
const SERVER_ISN: u32 = 5000;

struct PortCmd {
    tm: TupleMatch,
    matched: Arc<AtomicUsize>,
}

impl PortCmd {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            tm: TupleMatch::dst_port(Protocol::TCP, CTL_PORT),
            matched: Arc::new(AtomicUsize::new(0)),
        })
    }
}

fn parse_port(payload: &[u8]) -> Option<u16> {
    let line = std::str::from_utf8(payload).ok()?;
    line.trim_end().strip_prefix("PORT ")?.parse().ok()
}

impl Helper for PortCmd {
    fn name(&self) -> &'static str {
        "portcmd"
    }

    fn tuple_match(&self) -> &TupleMatch {
        &self.tm
    }

    fn max_expected(&self) -> u32 {
        1
    }

    fn expect_timeout(&self) -> Duration {
        Duration::from_secs(60)
    }

    fn help(&self, ctx: &mut HelpCtx) -> Verdict {
        if ctx.dir != Direction::Original {
            return Verdict::Accept;
        }

        let Some(port) = ctx.payload().and_then(parse_port) else {
            return Verdict::Accept;
        };

        let orig = *ctx.conn.orig();
        let template = TupleMatch {
            proto: Protocol::TCP,
            src: Ipv4AddrMatch::Exact(orig.dst),
            dst: Ipv4AddrMatch::Exact(orig.src),
            src_port: PortMatch::Any,
            dst_port: PortMatch::Exact(port),
        };

        let matched = self.matched.clone();
        let exp = ctx.expect(template).on_match(Box::new(
            move |_: &Conn, _: &Expectation| {
                matched.fetch_add(1, Ordering::Relaxed);
            },
        ));

        match ctx.related(exp) {
            Ok(_) => Verdict::Accept,
            Err(_) => Verdict::Drop,
        }
    }
}

fn client() -> Ipv4Addr {
    ip("10.0.0.1")
}

fn server() -> Ipv4Addr {
    ip("192.168.1.10")
}

/// Open the control connection and send `PORT <port>` over it.
fn open_ctl(host: &Host, port: u16, now: Moment) -> Packet {
    let out = |seg, payload: &[u8]| {
        tcp_pkt(client(), 40000, server(), CTL_PORT, seg, payload)
    };
    let back = |seg| tcp_pkt(server(), CTL_PORT, client(), 40000, seg, &[]);

    host.send_bytes(out(TcpSeg::syn(CLIENT_ISN), &[]), now);
    host.recv_bytes(back(TcpSeg::syn_ack(SERVER_ISN, CLIENT_ISN + 1)), now);
    host.send_bytes(out(TcpSeg::ack(CLIENT_ISN + 1, SERVER_ISN + 1), &[]), now);

    let cmd = format!("PORT {port}\r\n");
    let seg = TcpSeg::ack(CLIENT_ISN + 1, SERVER_ISN + 1);
    let (v, pkt) = host.send_bytes(out(seg, cmd.as_bytes()), now);
    assert_eq!(v, Verdict::Accept);
    pkt
}

fn data_syn(sport: u16, dport: u16) -> Vec<u8> {
    tcp_pkt(server(), sport, client(), dport, TcpSeg::syn(77), &[])
}

#[test]
fn expectation_consumed_once() {
    let host = Host::new(engine(ConntrackCfg::with_hashsize(256)));
    let helper = PortCmd::new();
    host.engine.register_helper(helper.clone()).unwrap();
    let now = Moment::now();

    let ctl = open_ctl(&host, 3000, now).ct().unwrap().conn.clone();
    assert_eq!(ctl.helper().unwrap().name(), "portcmd");
    assert_eq!(host.engine.expects().len(), 1);

    let dump = host.engine.dump_expects(now);
    assert_eq!(dump.expects[0].master, ctl.id());
    assert_eq!(dump.expects[0].helper.as_deref(), Some("portcmd"));
    let mut out = vec![];
    print_expects_into(&mut out, &dump).unwrap();
    assert!(String::from_utf8(out).unwrap().contains("portcmd"));

    let (v, data) = host.recv_bytes(data_syn(20, 3000), now);
    assert_eq!(v, Verdict::Accept);
    let ct = data.ct().unwrap();
    assert_eq!(ct.info, CtInfo::Related);
    assert_eq!(ct.conn.master(), Some(ctl.id()));
    assert!(ct.conn.status_dump().expected);
    assert_eq!(ct.conn.helper().unwrap().name(), "portcmd");
    assert_eq!(host.engine.expects().len(), 0);
    assert_eq!(helper.matched.load(Ordering::Relaxed), 1);
    assert_eq!(host.engine.stats().total.expect_new, 1);

    // The expectation is gone, so a second flow is on its own.
    let (_, other) = host.recv_bytes(data_syn(21, 3000), now);
    let ct = other.ct().unwrap();
    assert_eq!(ct.info, CtInfo::New);
    assert_eq!(ct.conn.master(), None);
    assert!(ct.conn.helper().is_none());
    assert_eq!(helper.matched.load(Ordering::Relaxed), 1);
}

#[test]
fn expectation_times_out() {
    let host = Host::new(engine(ConntrackCfg::with_hashsize(256)));
    host.engine.register_helper(PortCmd::new()).unwrap();
    let now = Moment::now();

    open_ctl(&host, 3000, now);
    assert_eq!(host.engine.expects().len(), 1);

    let later = now + Duration::from_secs(61);
    host.engine.expire_at(later);
    assert_eq!(host.engine.expects().len(), 0);

    let (_, data) = host.recv_bytes(data_syn(20, 3000), later);
    assert_eq!(data.ct().unwrap().info, CtInfo::New);
}

#[test]
fn master_deletion_takes_expectations() {
    let host = Host::new(engine(ConntrackCfg::with_hashsize(256)));
    host.engine.register_helper(PortCmd::new()).unwrap();
    let now = Moment::now();

    let ctl = open_ctl(&host, 3000, now).ct().unwrap().conn.clone();
    assert_eq!(host.engine.expects().len(), 1);
    assert!(host.engine.delete(&ctl));
    assert_eq!(host.engine.expects().len(), 0);
}

#[test]
fn helper_registration() {
    let host = Host::new(engine(ConntrackCfg::with_hashsize(256)));
    host.engine.register_helper(PortCmd::new()).unwrap();
    let err = host.engine.register_helper(PortCmd::new()).unwrap_err();
    assert!(matches!(err, CtError::Busy(_)));

    let now = Moment::now();
    let ctl = open_ctl(&host, 3000, now).ct().unwrap().conn.clone();

    // Unregistering takes the helper's expectations and leaves its
    // connections unhelped.
    host.engine.unregister_helper("portcmd").unwrap();
    assert_eq!(host.engine.expects().len(), 0);
    assert!(ctl.helper().is_none());
    assert!(host.engine.helpers().list().is_empty());
    assert!(matches!(
        host.engine.unregister_helper("portcmd"),
        Err(CtError::NotFound(_))
    ));
}

/// Every query to port 53 announces a callback to port 9999.
struct Callback {
    tm: TupleMatch,
}

const CALLBACK_PORT: u16 = 9999;

impl Helper for Callback {
    fn name(&self) -> &'static str {
        "callback"
    }

    fn tuple_match(&self) -> &TupleMatch {
        &self.tm
    }

    fn expect_timeout(&self) -> Duration {
        Duration::from_secs(60)
    }

    fn help(&self, ctx: &mut HelpCtx) -> Verdict {
        let tm = TupleMatch::dst_port(Protocol::UDP, CALLBACK_PORT);
        match ctx.related(ctx.expect(tm)) {
            Ok(_) => Verdict::Accept,
            Err(_) => Verdict::Drop,
        }
    }
}

#[test]
fn dropped_before_confirm_leaves_no_expectation() {
    let host = Host::new(engine(ConntrackCfg::with_hashsize(256)));
    let tm = TupleMatch::dst_port(Protocol::UDP, 53);
    host.engine.register_helper(Arc::new(Callback { tm })).unwrap();

    // A filter between the helper and confirmation.
    host.hooks.register(HookOps {
        name: "filter",
        hook: HookPoint::LocalIn,
        priority: priority::HELPER + 1,
        handler: Box::new(|_, _, _| Verdict::Drop),
    });

    let now = Moment::now();
    let query = udp_pkt(client(), 5353, server(), 53, b"q");
    let (v, pkt) = host.recv_bytes(query, now);
    assert_eq!(v, Verdict::Drop);
    assert!(!pkt.ct().unwrap().conn.is_confirmed());
    drop(pkt);

    assert_eq!(host.engine.table().len(), 0);
    assert_eq!(host.engine.table().allocated(), 0);
    assert_eq!(host.engine.expects().len(), 0);
    assert!(host.engine.dump_expects(now).expects.is_empty());

    let cb = udp_pkt(client(), 7, server(), CALLBACK_PORT, b"x");
    let (_, pkt) = host.recv_bytes(cb, now);
    let ct = pkt.ct().unwrap();
    assert_eq!(ct.info, CtInfo::New);
    assert_eq!(ct.conn.master(), None);
    assert_eq!(host.engine.stats().total.expect_new, 0);
}


// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Fragments on the way in and out.

use common::*;
use conntrack::engine::defrag::fragment_ipv4;
use conntrack_test_utils as common;
use std::sync::Arc;

fn big_udp(len: usize, ident: u16) -> Vec<u8> {
    let payload: Vec<u8> = (0..len).map(|i| i as u8).collect();
    let mut pkt =
        udp_pkt(ip("192.168.1.10"), 53, ip("10.0.0.1"), 5353, &payload);
    allow_frag(&mut pkt, ident);
    pkt
}

#[test]
fn inbound_fragments_are_gathered_before_tracking() {
    let host = Host::new(engine(ConntrackCfg::with_hashsize(64)));
    let now = Moment::now();

    let whole = big_udp(3000, 0x1234);
    let mut frags = fragment_ipv4(&whole, 1000).unwrap();
    assert_eq!(frags.len(), 4);
    frags.reverse();
    let last = frags.pop().unwrap();

    for frag in frags {
        let (v, pkt) = host.recv_bytes(frag, now);
        assert_eq!(v, Verdict::Stolen);
        assert!(pkt.ct().is_none());
    }
    assert_eq!(host.engine.table().len(), 0);
    assert_eq!(host.engine.stats().total.defrag_consumed, 3);

    let (v, pkt) = host.recv_bytes(last, now);
    assert_eq!(v, Verdict::Accept);
    assert_eq!(pkt.data(), whole.as_slice());
    assert!(pkt.ct().is_some());
    assert_eq!(host.engine.table().len(), 1);
}

#[test]
fn overlapping_fragment_drops() {
    let host = Host::new(engine(ConntrackCfg::with_hashsize(64)));
    let now = Moment::now();

    let frags = fragment_ipv4(&big_udp(3000, 7), 1000).unwrap();
    let (v, _) = host.recv_bytes(frags[0].clone(), now);
    assert_eq!(v, Verdict::Stolen);

    // Same offset, different contents.
    let mut bogus = frags[0].clone();
    let n = bogus.len();
    bogus[n - 1] ^= 0xFF;
    let (v, _) = host.recv_bytes(bogus, now);
    assert_eq!(v, Verdict::Drop);
}

#[test]
fn outbound_datagram_split_after_confirm() {
    let host = Host::new(engine(ConntrackCfg::with_hashsize(64)));
    let now = Moment::now();

    let mut whole =
        udp_pkt(ip("10.0.0.1"), 5353, ip("192.168.1.10"), 53, &[9u8; 2000]);
    allow_frag(&mut whole, 99);

    let mut pkt = Packet::new(whole);
    let mut ctx = HookCtx::new(now).with_mtu(576);
    assert_eq!(host.send(&mut pkt, &mut ctx), Verdict::Stolen);

    let conn = pkt.ct().unwrap().conn.clone();
    assert!(conn.is_confirmed());
    assert_eq!(host.engine.table().len(), 1);
    assert_eq!(host.engine.stats().total.refrag, 1);

    assert_eq!(ctx.emitted.len(), 4);
    for frag in &ctx.emitted {
        assert!(frag.len() <= 576);
        assert!(Arc::ptr_eq(&frag.ct().unwrap().conn, &conn));
    }
}

#[test]
fn outbound_dont_fragment_and_gso() {
    let host = Host::new(engine(ConntrackCfg::with_hashsize(64)));
    let now = Moment::now();

    // smoltcp sets DF.
    let df = udp_pkt(ip("10.0.0.1"), 1, ip("192.168.1.10"), 53, &[0; 2000]);
    let mut ctx = HookCtx::new(now).with_mtu(1500);
    let mut pkt = Packet::new(df.clone());
    assert_eq!(host.send(&mut pkt, &mut ctx), Verdict::Drop);
    assert!(ctx.emitted.is_empty());

    let mut pkt = Packet::new(df).with_gso();
    assert_eq!(host.send(&mut pkt, &mut ctx), Verdict::Accept);
    assert!(ctx.emitted.is_empty());
}

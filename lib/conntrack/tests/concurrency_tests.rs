// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Many threads, one engine.

use common::*;
use conntrack::engine::Conn;
use conntrack_test_utils as common;
use std::sync::Arc;
use std::sync::Barrier;
use std::thread;

const THREADS: usize = 8;

#[test]
fn confirm_race_has_one_winner() {
    let e = quiet_engine(ConntrackCfg::with_hashsize(64));
    let now = Moment::now();
    let bytes = udp_pkt(ip("10.0.0.1"), 4000, ip("10.0.0.2"), 53, b"q");
    let barrier = Barrier::new(THREADS);

    let conns: Vec<Arc<Conn>> = thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                s.spawn(|| {
                    let mut pkt = Packet::new(bytes.clone());
                    let v = e.conntrack_in(HookPoint::LocalOut, &mut pkt, now);
                    assert_eq!(v, Verdict::Accept);
                    assert!(!pkt.ct().unwrap().conn.is_confirmed());

                    // Everyone holds an unconfirmed connection before
                    // anyone confirms.
                    barrier.wait();
                    assert_eq!(e.confirm(&mut pkt, now), Verdict::Accept);
                    pkt.ct().unwrap().conn.clone()
                })
            })
            .collect();

        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let winner = &conns[0];
    assert!(winner.is_confirmed());
    for conn in &conns {
        assert!(Arc::ptr_eq(conn, winner));
    }

    assert_eq!(e.table().len(), 1);
    assert_eq!(e.table().entries_for(winner.id()), 2);
    assert_eq!(e.table().allocated(), 1);

    let stats = e.stats().total;
    assert_eq!(stats.new, THREADS as u64);
    assert_eq!(stats.insert, 1);
    assert_eq!(stats.insert_failed, THREADS as u64 - 1);
    // Each thread's packet is counted once, on the winner.
    assert_eq!(winner.pkts()[Direction::Original.idx()], THREADS as u64);
    assert_eq!(
        winner.bytes()[Direction::Original.idx()],
        (THREADS * bytes.len()) as u64
    );
}

#[test]
fn distinct_flows_in_parallel() {
    const FLOWS: u16 = 64;
    let host = Host::new(quiet_engine(ConntrackCfg::with_hashsize(128)));
    let now = Moment::now();

    thread::scope(|s| {
        for t in 0..THREADS as u16 {
            let host = &host;
            s.spawn(move || {
                for i in 0..FLOWS {
                    let sport = 10_000 + t * FLOWS + i;
                    let bytes = udp_pkt(
                        ip("10.0.0.1"),
                        sport,
                        ip("10.0.0.2"),
                        53,
                        &[],
                    );
                    let (v, _) = host.send_bytes(bytes, now);
                    assert_eq!(v, Verdict::Accept);
                }
            });
        }
    });

    let n = THREADS * usize::from(FLOWS);
    assert_eq!(host.engine.table().len(), n);
    let stats = host.engine.stats();
    assert_eq!(stats.total.new, n as u64);
    assert_eq!(stats.total.insert, n as u64);
    let summed: u64 = stats.per_cpu.iter().map(|s| s.insert).sum();
    assert_eq!(summed, n as u64);
}

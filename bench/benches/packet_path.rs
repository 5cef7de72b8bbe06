// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use conntrack_bench::MeasurementInfo;
use conntrack_bench::alloc::*;
use conntrack_bench::packet::BenchPacket;
use conntrack_bench::packet::Icmp4;
use conntrack_bench::packet::Tcp;
use conntrack_bench::packet::Udp;
use conntrack_test_utils::*;
use criterion::BatchSize;
use criterion::BenchmarkId;
use criterion::Criterion;
use criterion::criterion_group;
use criterion::criterion_main;
use rand::Rng;
use std::hint::black_box;

const HASHSIZE: u32 = 16384;

fn host() -> Host {
    Host::new(quiet_engine(ConntrackCfg::with_hashsize(HASHSIZE)))
}

/// Time one packet of each case through the full hook path of a
/// host, starting from the state the case primes.
fn flows<M: MeasurementInfo + 'static>(
    c: &mut Criterion<M>,
    kinds: &[&dyn BenchPacket],
) {
    let mut c = c.benchmark_group(format!("flow/{}", M::label()));
    let now = Moment::now();

    for flow in kinds {
        for case in flow.test_cases() {
            let host = host();
            case.prime(&host, now);
            let (bytes, outbound) = case.generate();
            let fresh = host.engine.table().len() == 0;

            // A case starting from nothing gets an empty table every
            // time, which rules out batching the setup.
            let size = if fresh {
                BatchSize::PerIteration
            } else {
                BatchSize::SmallInput
            };

            let id =
                BenchmarkId::new(flow.packet_label(), case.instance_name());
            c.bench_with_input(id, &bytes, |b, bytes| {
                b.iter_batched(
                    || {
                        if fresh {
                            host.engine.cleanup_by_predicate(|_| true);
                        }
                        Packet::new(bytes.clone())
                    },
                    |mut pkt| {
                        let mut ctx = HookCtx::new(now);
                        let v = if outbound {
                            host.send(black_box(&mut pkt), &mut ctx)
                        } else {
                            host.recv(black_box(&mut pkt), &mut ctx)
                        };
                        (v, pkt)
                    },
                    size,
                )
            });
        }
    }
}

pub fn packet_path<M: MeasurementInfo + 'static>(c: &mut Criterion<M>) {
    let all: [&dyn BenchPacket; 3] = [&Udp, &Tcp, &Icmp4];
    flows(c, &all);
}

/// Lookups against a table holding many connections, hitting and
/// missing.
pub fn lookup<M: MeasurementInfo + 'static>(c: &mut Criterion<M>) {
    let host = host();
    let now = Moment::now();
    let mut rng = rand::rng();
    let server = ip("192.168.1.10");

    let mut tuples = Vec::with_capacity(4096);
    for i in 0..4096u32 {
        let client = Ipv4Addr::from(0x0A00_0000 | i);
        let sport = rng.random_range(1024..=u16::MAX);
        let (_, pkt) =
            host.send_bytes(udp_pkt(client, sport, server, 53, &[]), now);
        if let Some(ct) = pkt.ct() {
            tuples.push(*ct.conn.orig());
        }
    }

    let mut miss = tuples[0];
    miss.dst = ip("192.168.1.11");

    let mut c = c.benchmark_group(format!("lookup/{}", M::label()));
    let mut i = 0;
    c.bench_function("hit", |b| {
        b.iter(|| {
            i = (i + 1) % tuples.len();
            host.engine.find(black_box(&tuples[i]))
        })
    });
    c.bench_function("miss", |b| {
        b.iter(|| host.engine.find(black_box(&miss)))
    });
}

criterion_group!(wall, packet_path, lookup);
criterion_group!(
    name = alloc_ct;
    config = new_crit(Allocs);
    targets = packet_path
);
criterion_group!(
    name = alloc_sz;
    config = new_crit(BytesAlloced);
    targets = packet_path
);
criterion_main!(wall, alloc_ct, alloc_sz);

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Build captures, then replay them.

use common::pcap::PcapBuilder;
use common::*;
use conntrack::api::Ipv4Cidr;
use conntrack_test_utils as common;
use ctadm::Replayer;
use ctadm::read_capture;
use ctadm::replay::PktPath;
use ctadm::replay::print_summary_into;
use pcap_parser::Linktype;
use std::path::PathBuf;
use std::time::Duration;

const T0: Duration = Duration::from_secs(1_700_000_000);

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

fn tmp_pcap(name: &str) -> PathBuf {
    let pid = std::process::id();
    std::env::temp_dir().join(format!("ctadm-{pid}-{name}.pcap"))
}

fn local() -> Vec<Ipv4Cidr> {
    vec!["10.0.0.0/24".parse().unwrap()]
}

#[test]
fn replay_ethernet_capture() {
    let client = ip("10.0.0.1");
    let server = ip("192.168.1.10");
    let out = |seg| {
        ether_frame(&tcp_pkt(client, 40000, server, 80, seg, &[]), true)
    };
    let back = |seg| {
        ether_frame(&tcp_pkt(server, 80, client, 40000, seg, &[]), false)
    };

    let path = tmp_pcap("ether");
    let mut pcap = PcapBuilder::new(Linktype::ETHERNET);
    pcap.add_pkt(T0, &out(TcpSeg::syn(1000)));
    pcap.add_pkt(T0 + ms(1), &back(TcpSeg::syn_ack(5000, 1001)));
    pcap.add_pkt(T0 + ms(2), &out(TcpSeg::ack(1001, 5001)));

    // A query which is never answered.
    let query = udp_pkt(client, 5353, ip("192.168.1.53"), 53, b"q");
    pcap.add_pkt(T0 + ms(3), &ether_frame(&query, true));

    // ARP
    let mut arp = vec![0u8; 42];
    arp[12..14].copy_from_slice(&[0x08, 0x06]);
    pcap.add_pkt(T0 + ms(4), &arp);

    // By now the query has timed out, the TCP connection has not.
    pcap.add_pkt(T0 + Duration::from_secs(40), &out(TcpSeg::ack(1001, 5001)));
    pcap.save(&path);

    let bytes = std::fs::read(&path).unwrap();
    std::fs::remove_file(&path).unwrap();
    let cap = read_capture(&bytes).unwrap();
    assert_eq!(cap.frames.len(), 5);
    assert_eq!(cap.skipped, 1);
    assert_eq!(cap.frames[4].ts, T0 + Duration::from_secs(40));

    let mut r =
        Replayer::new(quiet_engine(ConntrackCfg::with_hashsize(64)), local());
    r.replay(cap);

    let summary = r.summary();
    assert_eq!(summary.packets, 5);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.accepted, 5);
    assert_eq!(summary.expired, 1);

    let report = r.report();
    assert_eq!(report.conns.count, 1);
    let conn = &report.conns.conns[0];
    assert_eq!(conn.proto, Protocol::TCP);
    assert_eq!(conn.orig.src, client);
    assert!(conn.status.seen_reply);
    assert!(conn.proto_state.contains("ESTABLISHED"));
    assert_eq!(conn.pkts, [3, 1]);
    assert_eq!(report.stats.total.new, 2);
    assert!(report.expects.expects.is_empty());

    let mut out = vec![];
    print_summary_into(&mut out, &report.summary).unwrap();
    let out = String::from_utf8(out).unwrap();
    assert!(out.contains("expired"));

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["summary"]["packets"], 5);
    assert_eq!(json["conns"]["count"], 1);
}

#[test]
fn replay_raw_ipv4_forwarded() {
    let a = ip("172.16.0.5");
    let b = ip("192.168.1.10");

    let mut pcap = PcapBuilder::new(Linktype::RAW);
    pcap.add_pkt(T0, &udp_pkt(a, 1234, b, 53, b"q"))
        .add_pkt(T0 + ms(5), &udp_pkt(b, 53, a, 1234, b"a"));

    let cap = read_capture(pcap.bytes()).unwrap();
    assert_eq!(cap.frames.len(), 2);

    let mut r =
        Replayer::new(quiet_engine(ConntrackCfg::with_hashsize(64)), local());
    assert_eq!(r.path(&cap.frames[0].ip), PktPath::Forward);
    r.replay(cap);

    let report = r.report();
    assert_eq!(report.summary.accepted, 2);
    assert_eq!(report.conns.count, 1);
    let conn = &report.conns.conns[0];
    assert_eq!(conn.orig.src, a);
    assert!(conn.status.seen_reply);
    assert!(conn.status.confirmed);
}

#[test]
fn local_prefixes_pick_the_path() {
    let r =
        Replayer::new(quiet_engine(ConntrackCfg::with_hashsize(16)), local());
    let out = udp_pkt(ip("10.0.0.7"), 1, ip("8.8.8.8"), 53, &[]);
    let inb = udp_pkt(ip("8.8.8.8"), 53, ip("10.0.0.7"), 1, &[]);
    assert_eq!(r.path(&out), PktPath::Outbound);
    assert_eq!(r.path(&inb), PktPath::Inbound);
}

#[test]
fn unknown_link_type_refused() {
    let pcap = PcapBuilder::new(Linktype::NULL);
    assert!(read_capture(pcap.bytes()).is_err());
}

#[test]
fn nanosecond_timestamps() {
    let q = udp_pkt(ip("10.0.0.1"), 1234, ip("192.168.1.53"), 53, b"q");
    let ts = T0 + Duration::from_nanos(1_500);

    let mut pcap = PcapBuilder::nanosecond(Linktype::RAW);
    pcap.add_pkt(ts, &q);
    let cap = read_capture(pcap.bytes()).unwrap();
    assert_eq!(cap.frames[0].ts, ts);

    let mut pcap = PcapBuilder::new(Linktype::RAW);
    pcap.add_pkt(ts, &q);
    let cap = read_capture(pcap.bytes()).unwrap();
    assert_eq!(cap.frames[0].ts, T0 + Duration::from_micros(1));
}

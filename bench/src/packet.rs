// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The flows benchmarks push through the packet path.

use conntrack_test_utils::*;

const CLIENT: &str = "10.0.0.1";
const SERVER: &str = "192.168.1.10";

/// A family of related packet path cases to benchmark.
pub trait BenchPacket {
    /// Label the flow type in a human-friendly manner.
    fn packet_label(&self) -> String;

    /// Return a list of discrete scenarios.
    fn test_cases(&self) -> Vec<Box<dyn BenchPacketInstance>>;
}

/// An individual packet to time.
pub trait BenchPacketInstance {
    fn instance_name(&self) -> String;

    /// Bring `host` to the point the timed packet expects, e.g. an
    /// established connection.
    fn prime(&self, host: &Host, now: Moment);

    /// The timed packet, and whether the host sends it.
    fn generate(&self) -> (Vec<u8>, bool);
}

/// Where a flow's connection is when the timed packet arrives.
#[derive(Clone, Copy, Debug)]
pub enum FlowStage {
    /// No connection yet.
    New,
    /// The connection has seen traffic both ways.
    Replied,
}

const STAGES: [FlowStage; 2] = [FlowStage::New, FlowStage::Replied];

fn cases<T>(f: impl Fn(FlowStage) -> T) -> Vec<Box<dyn BenchPacketInstance>>
where
    T: BenchPacketInstance + 'static,
{
    STAGES
        .into_iter()
        .map(|s| Box::new(f(s)) as Box<dyn BenchPacketInstance>)
        .collect()
}

pub struct Udp;
pub struct UdpInstance(FlowStage);

impl BenchPacket for Udp {
    fn packet_label(&self) -> String {
        "UDP".into()
    }

    fn test_cases(&self) -> Vec<Box<dyn BenchPacketInstance>> {
        cases(UdpInstance)
    }
}

impl BenchPacketInstance for UdpInstance {
    fn instance_name(&self) -> String {
        format!("{:?}", self.0)
    }

    fn prime(&self, host: &Host, now: Moment) {
        if let FlowStage::Replied = self.0 {
            host.send_bytes(self.generate().0, now);
            let reply = udp_pkt(ip(SERVER), 53, ip(CLIENT), 5353, b"a");
            host.recv_bytes(reply, now);
        }
    }

    fn generate(&self) -> (Vec<u8>, bool) {
        (udp_pkt(ip(CLIENT), 5353, ip(SERVER), 53, b"q"), true)
    }
}

pub struct Tcp;
pub struct TcpInstance(FlowStage);

impl BenchPacket for Tcp {
    fn packet_label(&self) -> String {
        "TCP".into()
    }

    fn test_cases(&self) -> Vec<Box<dyn BenchPacketInstance>> {
        cases(TcpInstance)
    }
}

impl BenchPacketInstance for TcpInstance {
    fn instance_name(&self) -> String {
        match self.0 {
            FlowStage::New => "Syn".into(),
            FlowStage::Replied => "EstablishedAck".into(),
        }
    }

    fn prime(&self, host: &Host, now: Moment) {
        if let FlowStage::New = self.0 {
            return;
        }

        let out = |seg| tcp_pkt(ip(CLIENT), 40000, ip(SERVER), 80, seg, &[]);
        let back = |seg| tcp_pkt(ip(SERVER), 80, ip(CLIENT), 40000, seg, &[]);
        host.send_bytes(out(TcpSeg::syn(1000)), now);
        host.recv_bytes(back(TcpSeg::syn_ack(5000, 1001)), now);
        host.send_bytes(out(TcpSeg::ack(1001, 5001)), now);
    }

    fn generate(&self) -> (Vec<u8>, bool) {
        let seg = match self.0 {
            FlowStage::New => TcpSeg::syn(1000),
            FlowStage::Replied => TcpSeg::ack(1001, 5001),
        };
        (tcp_pkt(ip(CLIENT), 40000, ip(SERVER), 80, seg, &[]), true)
    }
}

pub struct Icmp4;
pub struct Icmp4Instance(FlowStage);

impl BenchPacket for Icmp4 {
    fn packet_label(&self) -> String {
        "ICMPv4".into()
    }

    fn test_cases(&self) -> Vec<Box<dyn BenchPacketInstance>> {
        cases(Icmp4Instance)
    }
}

impl BenchPacketInstance for Icmp4Instance {
    fn instance_name(&self) -> String {
        match self.0 {
            FlowStage::New => "EchoRequest".into(),
            FlowStage::Replied => "EchoReply".into(),
        }
    }

    fn prime(&self, host: &Host, now: Moment) {
        if let FlowStage::Replied = self.0 {
            let req = icmp_echo(ip(CLIENT), ip(SERVER), 7, 1, false);
            host.send_bytes(req, now);
        }
    }

    fn generate(&self) -> (Vec<u8>, bool) {
        match self.0 {
            FlowStage::New => {
                (icmp_echo(ip(CLIENT), ip(SERVER), 7, 1, false), true)
            }
            FlowStage::Replied => {
                (icmp_echo(ip(SERVER), ip(CLIENT), 7, 1, true), false)
            }
        }
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Replay a packet capture through the engine.
//!
//! Each captured IPv4 packet walks the hooks a real host would run it
//! through. A packet whose source is one of the host's own addresses
//! is sent, one whose destination is local is received, and anything
//! else is forwarded. The first packet's timestamp is taken as the
//! engine's present and every later one is offset from it, so a
//! capture spanning an hour of idle time ages connections by an hour.

use anyhow::Result;
use anyhow::anyhow;
use anyhow::bail;
use conntrack::api::DumpConnsResp;
use conntrack::api::DumpExpectsResp;
use conntrack::api::Ipv4Addr;
use conntrack::api::Ipv4Cidr;
use conntrack::ddi::time::Moment;
use conntrack::engine::ConntrackEngine;
use conntrack::engine::HookCtx;
use conntrack::engine::HookPoint;
use conntrack::engine::HookTable;
use conntrack::engine::Packet;
use conntrack::engine::Verdict;
use conntrack::engine::stat::StatsDump;
use pcap_parser::Linktype;
use pcap_parser::pcap;
use serde::Serialize;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tabwriter::TabWriter;

const ETHER_HDR_LEN: usize = 14;
const ETHER_TYPE_IPV4: u16 = 0x0800;
const IPV4_HDR_LEN_MIN: usize = 20;

/// How far the capture clock moves between sweeps of idle
/// connections.
const GC_INTERVAL: Duration = Duration::from_secs(1);

/// One captured IPv4 packet.
#[derive(Clone, Debug)]
pub struct Frame {
    /// Time since the epoch, as recorded by the capture.
    pub ts: Duration,
    pub ip: Vec<u8>,
}

/// The IPv4 packets of a capture, in capture order.
#[derive(Debug, Default)]
pub struct Capture {
    pub frames: Vec<Frame>,
    /// Records which were not IPv4, or were cut short by the
    /// capture's snap length.
    pub skipped: u64,
}

/// Parse a classic pcap file. Ethernet and raw IPv4 link types are
/// understood.
pub fn read_capture(bytes: &[u8]) -> Result<Capture> {
    let (mut rest, hdr) = pcap::parse_pcap_header(bytes)
        .map_err(|e| anyhow!("bad pcap header: {e:?}"))?;

    if hdr.is_bigendian() {
        bail!("big-endian captures are not supported");
    }

    let ether = if hdr.network == Linktype::ETHERNET {
        true
    } else if hdr.network == Linktype::RAW || hdr.network == Linktype::IPV4
    {
        false
    } else {
        bail!("unsupported link type: {:?}", hdr.network);
    };

    let nanos = hdr.is_nanosecond_precision();
    let mut cap = Capture::default();

    while !rest.is_empty() {
        let (next, block) = pcap::parse_pcap_frame(rest)
            .map_err(|e| anyhow!("bad pcap record: {e:?}"))?;
        rest = next;

        let frac = if nanos {
            Duration::from_nanos(u64::from(block.ts_usec))
        } else {
            Duration::from_micros(u64::from(block.ts_usec))
        };
        let ts = Duration::from_secs(u64::from(block.ts_sec)) + frac;

        if block.caplen < block.origlen {
            cap.skipped += 1;
            continue;
        }

        match ipv4_bytes(block.data, ether) {
            Some(ip) => cap.frames.push(Frame { ts, ip: ip.to_vec() }),
            None => cap.skipped += 1,
        }
    }

    Ok(cap)
}

/// Find the IPv4 packet in a captured record, trimming any link
/// layer padding past its total length.
fn ipv4_bytes(data: &[u8], ether: bool) -> Option<&[u8]> {
    let ip = if ether {
        let ty = data.get(12..ETHER_HDR_LEN)?;
        if u16::from_be_bytes([ty[0], ty[1]]) != ETHER_TYPE_IPV4 {
            return None;
        }
        &data[ETHER_HDR_LEN..]
    } else {
        data
    };

    if ip.len() < IPV4_HDR_LEN_MIN || ip[0] >> 4 != 4 {
        return None;
    }

    let total = usize::from(u16::from_be_bytes([ip[2], ip[3]]));
    if total < IPV4_HDR_LEN_MIN {
        return None;
    }
    Some(&ip[..total.min(ip.len())])
}

/// The hooks a packet walks.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PktPath {
    Inbound,
    Outbound,
    Forward,
}

impl PktPath {
    pub fn hooks(self) -> &'static [HookPoint] {
        match self {
            Self::Inbound => &[HookPoint::PreRouting, HookPoint::LocalIn],
            Self::Outbound => &[HookPoint::LocalOut, HookPoint::PostRouting],
            Self::Forward => &[
                HookPoint::PreRouting,
                HookPoint::Forward,
                HookPoint::PostRouting,
            ],
        }
    }
}

/// What happened to the packets of a replay.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ReplaySummary {
    pub packets: u64,
    pub skipped: u64,
    pub accepted: u64,
    pub dropped: u64,
    /// Taken by a hook, e.g. a fragment held for reassembly.
    pub stolen: u64,
    pub queued: u64,
    /// Packets hooks produced in place of stolen ones.
    pub emitted: u64,
    /// Connections reaped as the capture clock advanced.
    pub expired: u64,
}

/// Everything a replay leaves behind.
#[derive(Debug, Serialize)]
pub struct ReplayReport {
    pub summary: ReplaySummary,
    pub conns: DumpConnsResp,
    pub expects: DumpExpectsResp,
    pub stats: StatsDump,
}

/// An engine, the hooks it is wired into, and a clock driven by
/// capture timestamps.
pub struct Replayer {
    engine: Arc<ConntrackEngine>,
    hooks: HookTable,
    local: Vec<Ipv4Cidr>,
    mtu: Option<usize>,
    start: Moment,
    now: Moment,
    first_ts: Option<Duration>,
    last_gc: Duration,
    summary: ReplaySummary,
}

impl Replayer {
    /// Wire `engine` into a fresh hook table for a host owning the
    /// `local` prefixes.
    pub fn new(engine: Arc<ConntrackEngine>, local: Vec<Ipv4Cidr>) -> Self {
        let hooks = HookTable::new();
        engine.register_hooks(&hooks);
        let start = Moment::now();

        Self {
            engine,
            hooks,
            local,
            mtu: None,
            start,
            now: start,
            first_ts: None,
            last_gc: Duration::ZERO,
            summary: ReplaySummary::default(),
        }
    }

    /// Give outbound packets an interface MTU, so oversized ones are
    /// refragmented.
    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = Some(mtu);
        self
    }

    pub fn engine(&self) -> &Arc<ConntrackEngine> {
        &self.engine
    }

    pub fn summary(&self) -> &ReplaySummary {
        &self.summary
    }

    /// The capture time of the last packet replayed.
    pub fn now(&self) -> Moment {
        self.now
    }

    fn is_local(&self, ip: Ipv4Addr) -> bool {
        self.local.iter().any(|cidr| cidr.is_member(ip))
    }

    /// Decide a packet's hooks from its addresses.
    pub fn path(&self, ip: &[u8]) -> PktPath {
        let src = Ipv4Addr::from([ip[12], ip[13], ip[14], ip[15]]);
        let dst = Ipv4Addr::from([ip[16], ip[17], ip[18], ip[19]]);

        if self.is_local(src) {
            PktPath::Outbound
        } else if self.is_local(dst) {
            PktPath::Inbound
        } else {
            PktPath::Forward
        }
    }

    /// Move the engine's clock to the capture time `ts`, sweeping idle
    /// connections when it has moved far enough.
    fn advance(&mut self, ts: Duration) {
        let first = *self.first_ts.get_or_insert(ts);
        // Out of order records don't turn the clock back.
        let elapsed = ts.saturating_sub(first).max(self.last_gc);
        self.now = self.start + elapsed;

        if elapsed >= self.last_gc + GC_INTERVAL {
            self.summary.expired += self.engine.expire_at(self.now) as u64;
            self.last_gc = elapsed;
        }
    }

    /// Run one packet captured at `ts` through its hooks.
    pub fn replay_frame(&mut self, ts: Duration, ip: Vec<u8>) -> Verdict {
        self.advance(ts);

        let path = self.path(&ip);
        let mut pkt = Packet::new(ip);
        let mut ctx = HookCtx::new(self.now);
        if let Some(mtu) = self.mtu {
            ctx = ctx.with_mtu(mtu);
        }

        let mut verdict = Verdict::Accept;
        for hook in path.hooks() {
            verdict = self.hooks.run(*hook, &mut pkt, &mut ctx);
            if verdict != Verdict::Accept {
                break;
            }
        }

        self.summary.packets += 1;
        self.summary.emitted += ctx.emitted.len() as u64;
        match verdict {
            Verdict::Accept => self.summary.accepted += 1,
            Verdict::Drop => self.summary.dropped += 1,
            Verdict::Stolen => self.summary.stolen += 1,
            Verdict::Queue => self.summary.queued += 1,
            // The hook table resolves repeats itself.
            Verdict::Repeat => self.summary.dropped += 1,
        }

        verdict
    }

    /// Replay every packet of `cap`.
    pub fn replay(&mut self, cap: Capture) {
        self.summary.skipped += cap.skipped;
        for frame in cap.frames {
            self.replay_frame(frame.ts, frame.ip);
        }
    }

    /// Dump the engine's state as of the last packet.
    pub fn report(&self) -> ReplayReport {
        ReplayReport {
            summary: self.summary.clone(),
            conns: self.engine.dump_conns(self.now),
            expects: self.engine.dump_expects(self.now),
            stats: self.engine.stats(),
        }
    }
}

impl Drop for Replayer {
    fn drop(&mut self) {
        let _ = self.engine.unregister_hooks(&self.hooks);
    }
}

pub fn print_summary(summary: &ReplaySummary) -> std::io::Result<()> {
    print_summary_into(&mut std::io::stdout(), summary)
}

pub fn print_summary_into(
    out: &mut impl Write,
    summary: &ReplaySummary,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(out);
    writeln!(t, "Replay")?;
    writeln!(t, "{:-<70}", "")?;
    for (name, val) in [
        ("packets", summary.packets),
        ("skipped", summary.skipped),
        ("accepted", summary.accepted),
        ("dropped", summary.dropped),
        ("stolen", summary.stolen),
        ("queued", summary.queued),
        ("emitted", summary.emitted),
        ("expired", summary.expired),
    ] {
        writeln!(t, "{name}\t{val}")?;
    }
    t.flush()
}

#[cfg(test)]
mod test {
    use super::*;

    fn raw_ipv4(total: u16, len: usize) -> Vec<u8> {
        let mut ip = vec![0u8; len];
        ip[0] = 0x45;
        ip[2..4].copy_from_slice(&total.to_be_bytes());
        ip
    }

    #[test]
    fn ethernet_padding_trimmed() {
        let mut frame = vec![0u8; ETHER_HDR_LEN];
        frame[12..14].copy_from_slice(&ETHER_TYPE_IPV4.to_be_bytes());
        frame.extend(raw_ipv4(40, 46));

        let ip = ipv4_bytes(&frame, true).unwrap();
        assert_eq!(ip.len(), 40);
    }

    #[test]
    fn non_ipv4_skipped() {
        let mut frame = vec![0u8; ETHER_HDR_LEN + 40];
        // ARP
        frame[12..14].copy_from_slice(&0x0806u16.to_be_bytes());
        assert!(ipv4_bytes(&frame, true).is_none());

        let mut v6 = raw_ipv4(40, 40);
        v6[0] = 0x60;
        assert!(ipv4_bytes(&v6, false).is_none());
        assert!(ipv4_bytes(&[0x45; 10], false).is_none());
    }
}

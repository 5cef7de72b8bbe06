// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Capture files for feeding `ctadm replay`.

use pcap_parser::Linktype;
use pcap_parser::ToVec;
use pcap_parser::pcap::LegacyPcapBlock;
use pcap_parser::pcap::PcapHeader;
use std::path::Path;
use std::time::Duration;

const MAGIC_USEC: u32 = 0xa1b2_c3d4;
const MAGIC_NSEC: u32 = 0xa1b2_3c4d;

/// Accumulates a legacy pcap capture in memory.
pub struct PcapBuilder {
    buf: Vec<u8>,
    nanos: bool,
}

impl PcapBuilder {
    /// A capture whose records start with `network`'s header, either
    /// Ethernet or the IPv4 header itself. Timestamps carry
    /// microseconds.
    pub fn new(network: Linktype) -> Self {
        Self::start(network, false)
    }

    /// As [`PcapBuilder::new`], with nanosecond timestamps.
    pub fn nanosecond(network: Linktype) -> Self {
        Self::start(network, true)
    }

    fn start(network: Linktype, nanos: bool) -> Self {
        let mut hdr = PcapHeader {
            magic_number: if nanos { MAGIC_NSEC } else { MAGIC_USEC },
            version_major: 2,
            version_minor: 4,
            thiszone: 0,
            sigfigs: 0,
            snaplen: u32::from(u16::MAX),
            network,
        };

        Self { buf: hdr.to_vec().unwrap(), nanos }
    }

    /// Record `pkt` as captured `ts` after the epoch.
    pub fn add_pkt(&mut self, ts: Duration, pkt: &[u8]) -> &mut Self {
        let frac =
            if self.nanos { ts.subsec_nanos() } else { ts.subsec_micros() };
        let len = u32::try_from(pkt.len()).unwrap();
        let mut block = LegacyPcapBlock {
            ts_sec: u32::try_from(ts.as_secs()).unwrap(),
            ts_usec: frac,
            caplen: len,
            origlen: len,
            data: pkt,
        };

        self.buf.extend(block.to_vec().unwrap());
        self
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Write the capture out to `path`.
    pub fn save(&self, path: &Path) {
        std::fs::write(path, &self.buf).unwrap();
    }
}

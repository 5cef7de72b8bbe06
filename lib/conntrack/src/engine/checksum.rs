// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The internet checksum (RFC 1071).
//!
//! The engine only rewrites IPv4 headers (when reassembling and when
//! refragmenting), so all it needs is a way to sum a header and store
//! the result.
//!
//! The checksum is not a logical integer but a pair of bytes. Each
//! 16-bit word is summed in native byte order and the result is
//! stored back in native order, which leaves it in network order in
//! memory regardless of host endianness (RFC 1071 §1.B).

/// The checksum value as it is contained in a network header: the
/// one's complement of the one's complement sum.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HeaderChecksum {
    inner: [u8; 2],
}

impl HeaderChecksum {
    pub fn bytes(&self) -> [u8; 2] {
        self.inner
    }

    /// Wrap the checksum bytes read out of a header.
    pub fn wrap(hc: [u8; 2]) -> Self {
        Self { inner: hc }
    }
}

impl From<Checksum> for HeaderChecksum {
    fn from(mut csum: Checksum) -> HeaderChecksum {
        Self { inner: (!csum.finalize()).to_ne_bytes() }
    }
}

/// A rolling one's complement sum. Carries are folded only when the
/// sum is finalized.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Checksum {
    inner: u32,
}

impl Checksum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_bytes(&mut self, bytes: &[u8]) {
        self.inner = csum_add(self.inner, bytes);
    }

    pub fn compute(bytes: &[u8]) -> Self {
        Self { inner: csum_add(0, bytes) }
    }

    /// Fold the carries and return the 16-bit sum.
    pub fn finalize(&mut self) -> u16 {
        while (self.inner >> 16) != 0 {
            self.inner = (self.inner >> 16) + (self.inner & 0xFFFF);
        }

        (self.inner & 0xFFFF) as u16
    }
}

fn csum_add(mut csum: u32, bytes: &[u8]) -> u32 {
    let mut chunks = bytes.chunks_exact(2);
    for pair in &mut chunks {
        csum += u32::from(u16::from_ne_bytes([pair[0], pair[1]]));
        // Fold early so very large inputs can't overflow the u32.
        if csum & 0x8000_0000 != 0 {
            csum = (csum >> 16) + (csum & 0xFFFF);
        }
    }

    if let [last] = chunks.remainder() {
        csum += u32::from(u16::from_ne_bytes([*last, 0]));
    }

    csum
}

/// Offset of the checksum field within an IPv4 header.
const IPV4_CSUM_OFF: usize = 10;

/// Recompute the checksum of the IPv4 header occupying the whole of
/// `hdr`, options included, and store it in place.
pub fn ipv4_hdr_fill_csum(hdr: &mut [u8]) {
    if hdr.len() < IPV4_CSUM_OFF + 2 {
        return;
    }

    hdr[IPV4_CSUM_OFF..IPV4_CSUM_OFF + 2].copy_from_slice(&[0, 0]);
    let hc = HeaderChecksum::from(Checksum::compute(hdr));
    hdr[IPV4_CSUM_OFF..IPV4_CSUM_OFF + 2].copy_from_slice(&hc.bytes());
}

/// Does the IPv4 header in `hdr` carry a valid checksum?
pub fn ipv4_hdr_csum_ok(hdr: &[u8]) -> bool {
    Checksum::compute(hdr).finalize() == 0xFFFF
}

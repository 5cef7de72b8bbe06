// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Fragment reassembly and refragmentation.
//!
//! Tracking needs the transport header, which only the first fragment
//! of a datagram carries, so fragments are gathered into whole
//! datagrams before the tracker sees them. On the way out a datagram
//! gathered here may be too big for the outbound link and is split
//! again.
//!
//! The engine only talks to reassembly through [`Reassembler`];
//! [`FragQueue`] is the implementation it uses by default.

use super::checksum::ipv4_hdr_fill_csum;
use super::headers::IPV4_FLAG_DF;
use super::headers::IPV4_FLAG_MF;
use super::headers::IPV4_HDR_LEN_MIN;
use super::headers::Ipv4Meta;
use super::headers::ParseError;
use crate::ddi::sync::KMutex;
use crate::ddi::time::Moment;
use core::time::Duration;
use std::collections::BTreeMap;
use thiserror::Error;

/// Largest IPv4 datagram, header included.
pub const IPV4_MAX_LEN: usize = 65535;

const IPOPT_END: u8 = 0;
const IPOPT_NOOP: u8 = 1;
/// Options with this bit set are copied into every fragment.
const IPOPT_COPY: u8 = 0x80;

#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum ReasmError {
    #[error("fragment: {0}")]
    Parse(#[from] ParseError),

    #[error("too many partial datagrams ({0})")]
    TooMany(u32),

    #[error("fragment overlaps data already queued")]
    Overlap,

    #[error("reassembled datagram would exceed {IPV4_MAX_LEN} bytes")]
    TooBig,

    #[error("{0}")]
    Malformed(&'static str),
}

#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum FragError {
    #[error("datagram needs fragmenting but has DF set")]
    DontFragment,

    #[error("MTU {0} too small to fragment into")]
    MtuTooSmall(usize),

    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// A reassembly service.
pub trait Reassembler: Send + Sync {
    /// Take ownership of a packet. Non-fragments come straight back.
    /// A fragment is queued; the whole datagram is returned once the
    /// last missing piece arrives.
    fn gather(
        &self,
        pkt: Vec<u8>,
        now: Moment,
    ) -> Result<Option<Vec<u8>>, ReasmError>;

    /// Discard partial datagrams which have waited too long. Returns
    /// how many went.
    fn expire(&self, now: Moment) -> usize;

    /// Partial datagrams currently held.
    fn len(&self) -> usize;
}

#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
struct FragKey {
    src: [u8; 4],
    dst: [u8; 4],
    proto: u8,
    ident: u16,
}

struct Partial {
    /// The header of the first fragment, once seen.
    hdr: Option<Vec<u8>>,
    /// Payload pieces by offset.
    pieces: BTreeMap<usize, Vec<u8>>,
    /// Payload length, known once the last fragment is seen.
    total: Option<usize>,
    expires: Moment,
}

impl Partial {
    /// The payload, if every piece is in.
    fn complete_len(&self) -> Option<usize> {
        let total = self.total?;
        self.hdr.as_ref()?;
        let mut next = 0;
        for (off, data) in &self.pieces {
            if *off != next {
                return None;
            }
            next += data.len();
        }
        (next == total).then_some(total)
    }
}

/// An in-memory reassembly queue keyed by source, destination,
/// protocol and IP identifier.
pub struct FragQueue {
    queues: KMutex<BTreeMap<FragKey, Partial>>,
    timeout: Duration,
    max: u32,
}

impl FragQueue {
    pub fn new(timeout: Duration, max: u32) -> Self {
        Self { queues: KMutex::new(BTreeMap::new()), timeout, max }
    }
}

impl Reassembler for FragQueue {
    fn gather(
        &self,
        pkt: Vec<u8>,
        now: Moment,
    ) -> Result<Option<Vec<u8>>, ReasmError> {
        let ip = Ipv4Meta::parse(&pkt)?;
        if !ip.hdr.is_fragment() {
            return Ok(Some(pkt));
        }

        let off = ip.hdr.frag_offset();
        let data = ip.body;
        let end = off + data.len();
        let more = ip.hdr.more_frags();

        if more && data.len() % 8 != 0 {
            return Err(ReasmError::Malformed(
                "non-final fragment not a multiple of 8 bytes",
            ));
        }

        if end + ip.hdr_len > IPV4_MAX_LEN {
            return Err(ReasmError::TooBig);
        }

        let key = FragKey {
            src: ip.hdr.src,
            dst: ip.hdr.dst,
            proto: ip.proto(),
            ident: ip.hdr.ident.get(),
        };

        let mut queues = self.queues.lock();
        if queues.get(&key).is_some_and(|p| p.expires <= now) {
            queues.remove(&key);
        }

        if !queues.contains_key(&key) && queues.len() >= self.max as usize {
            return Err(ReasmError::TooMany(self.max));
        }

        let part = queues.entry(key).or_insert_with(|| Partial {
            hdr: None,
            pieces: BTreeMap::new(),
            total: None,
            expires: now + self.timeout,
        });

        for (&o, d) in &part.pieces {
            if o == off && d.as_slice() == data {
                // A retransmitted duplicate.
                return Ok(None);
            }
        }

        let overlaps = part
            .pieces
            .iter()
            .any(|(&o, d)| off < o + d.len() && o < end);
        let beyond = match part.total {
            Some(total) => end > total || (!more && end != total),
            None => {
                !more && part.pieces.iter().any(|(&o, d)| o + d.len() > end)
            }
        };

        if overlaps || beyond {
            queues.remove(&key);
            return Err(ReasmError::Overlap);
        }

        if !more {
            part.total = Some(end);
        }

        if off == 0 {
            part.hdr = Some(ip.hdr_bytes(&pkt).to_vec());
        }

        part.pieces.insert(off, data.to_vec());

        let Some(total) = part.complete_len() else {
            return Ok(None);
        };

        let Some(Partial { hdr: Some(mut out), pieces, .. }) =
            queues.remove(&key)
        else {
            return Ok(None);
        };

        let hdr_len = out.len();
        let total_len = (hdr_len + total) as u16;
        out[2..4].copy_from_slice(&total_len.to_be_bytes());
        let df = u16::from_be_bytes([out[6], out[7]]) & IPV4_FLAG_DF;
        out[6..8].copy_from_slice(&df.to_be_bytes());
        ipv4_hdr_fill_csum(&mut out);
        for piece in pieces.into_values() {
            out.extend_from_slice(&piece);
        }

        Ok(Some(out))
    }

    fn expire(&self, now: Moment) -> usize {
        let mut queues = self.queues.lock();
        let before = queues.len();
        queues.retain(|_, p| p.expires > now);
        before - queues.len()
    }

    fn len(&self) -> usize {
        self.queues.lock().len()
    }
}

/// Rewrite the options of a non-first fragment's header: options not
/// flagged for copying are replaced with no-ops.
fn strip_uncopied_opts(hdr: &mut [u8]) {
    let mut i = IPV4_HDR_LEN_MIN;
    while i < hdr.len() {
        match hdr[i] {
            IPOPT_END => break,
            IPOPT_NOOP => i += 1,
            kind => {
                let len = match hdr.get(i + 1) {
                    Some(&len) => usize::from(len),
                    None => break,
                };

                if len < 2 || i + len > hdr.len() {
                    break;
                }

                if kind & IPOPT_COPY == 0 {
                    hdr[i..i + len].fill(IPOPT_NOOP);
                }
                i += len;
            }
        }
    }
}

/// Split an IPv4 datagram into fragments of at most `mtu` bytes.
///
/// Payload is cut on 8-byte boundaries. The first fragment keeps the
/// whole header; later ones keep only the options marked for
/// copying. A datagram that is itself a fragment keeps its offset and
/// more-fragments bit. A datagram which already fits comes back as a
/// single packet.
pub fn fragment_ipv4(
    pkt: &[u8],
    mtu: usize,
) -> Result<Vec<Vec<u8>>, FragError> {
    let ip = Ipv4Meta::parse(pkt)?;
    if ip.total_len <= mtu {
        return Ok(vec![pkt[..ip.total_len].to_vec()]);
    }

    if ip.hdr.dont_frag() {
        return Err(FragError::DontFragment);
    }

    let hdr_len = ip.hdr_len;
    let chunk = mtu.saturating_sub(hdr_len) & !7;
    if chunk == 0 {
        return Err(FragError::MtuTooSmall(mtu));
    }

    let first_hdr = ip.hdr_bytes(pkt).to_vec();
    let mut later_hdr = first_hdr.clone();
    strip_uncopied_opts(&mut later_hdr);

    let base_off = ip.hdr.frag_offset();
    let base_mf = ip.hdr.more_frags();
    let body = ip.body;

    let mut frags = Vec::with_capacity(body.len().div_ceil(chunk));
    for (i, piece) in body.chunks(chunk).enumerate() {
        let off = i * chunk;
        let last = off + piece.len() == body.len();
        let mut frag =
            if i == 0 { first_hdr.clone() } else { later_hdr.clone() };

        let total_len = (hdr_len + piece.len()) as u16;
        frag[2..4].copy_from_slice(&total_len.to_be_bytes());
        let mut ff = ((base_off + off) / 8) as u16;
        if !last || base_mf {
            ff |= IPV4_FLAG_MF;
        }
        frag[6..8].copy_from_slice(&ff.to_be_bytes());
        ipv4_hdr_fill_csum(&mut frag);
        frag.extend_from_slice(piece);
        frags.push(frag);
    }

    Ok(frags)
}

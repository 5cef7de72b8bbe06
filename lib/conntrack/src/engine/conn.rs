// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Tracked connections.

use super::helper::Helper;
use super::proto::ProtoState;
use crate::api::ConnStatusDump;
use crate::api::CtError;
use crate::api::Direction;
use crate::api::Tuple;
use crate::ddi::sync::KMutex;
use crate::ddi::sync::KMutexGuard;
use crate::ddi::time::Moment;
use bitflags::bitflags;
use core::fmt;
use core::fmt::Display;
use core::sync::atomic::AtomicU32;
use core::sync::atomic::AtomicU64;
use core::sync::atomic::Ordering;
use core::time::Duration;
use std::sync::Arc;

/// A stable handle naming a connection for its whole life.
pub type ConnId = u64;

bitflags! {
    /// The status bits of a connection.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct ConnStatus: u32 {
        /// Created by matching an expectation.
        const EXPECTED = 1 << 0;
        /// Traffic has been seen in the reply direction.
        const SEEN_REPLY = 1 << 1;
        /// The tracker considers the connection worth keeping; it
        /// is never chosen for early drop.
        const ASSURED = 1 << 2;
        /// Inserted into the table.
        const CONFIRMED = 1 << 3;
        /// Deletion has begun.
        const DYING = 1 << 4;
    }
}

/// Atomic status bits.
///
/// Every bit only ever goes from clear to set, and `ASSURED` can only
/// be set once `SEEN_REPLY` is. All updates go through the methods
/// here so those rules live in one place.
#[derive(Debug, Default)]
pub struct StatusBits(AtomicU32);

impl StatusBits {
    fn new(initial: ConnStatus) -> Self {
        Self(AtomicU32::new(initial.bits()))
    }

    pub fn get(&self) -> ConnStatus {
        ConnStatus::from_bits_retain(self.0.load(Ordering::Acquire))
    }

    pub fn contains(&self, bit: ConnStatus) -> bool {
        self.get().contains(bit)
    }

    /// Set `bit`, returning whether this call is the one which set
    /// it.
    fn test_and_set(&self, bit: ConnStatus) -> bool {
        let prev = self.0.fetch_or(bit.bits(), Ordering::AcqRel);
        prev & bit.bits() == 0
    }

    pub fn set_seen_reply(&self) -> bool {
        self.test_and_set(ConnStatus::SEEN_REPLY)
    }

    /// Mark the connection assured. Refused until a reply has been
    /// seen.
    pub fn set_assured(&self) -> bool {
        if !self.contains(ConnStatus::SEEN_REPLY) {
            return false;
        }

        self.test_and_set(ConnStatus::ASSURED)
    }

    pub(crate) fn set_confirmed(&self) -> bool {
        self.test_and_set(ConnStatus::CONFIRMED)
    }

    /// Claim the right to delete the connection. Exactly one caller
    /// ever gets `true`.
    pub fn try_set_dying(&self) -> bool {
        self.test_and_set(ConnStatus::DYING)
    }
}

/// How a packet relates to the connection it was attached to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CtInfo {
    /// First packet(s) of a connection, before any reply.
    New,
    /// Part of a connection which has seen traffic both ways.
    Established,
    /// Related to an existing connection: an ICMP error about it, or
    /// the first packets of an expected connection.
    Related,
}

impl Display for CtInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::New => "NEW",
            Self::Established => "ESTABLISHED",
            Self::Related => "RELATED",
        };
        write!(f, "{s}")
    }
}

/// Decrements the allocation count of the table which created a
/// connection when the last reference to it goes away.
#[derive(Debug)]
pub(crate) struct AllocToken {
    count: Arc<AtomicU32>,
}

impl AllocToken {
    /// Take one of `max` slots, or `None` if all are taken.
    pub(crate) fn reserve(count: &Arc<AtomicU32>, max: u32) -> Option<Self> {
        count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .ok()?;
        Some(Self { count: count.clone() })
    }
}

impl Drop for AllocToken {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::AcqRel);
    }
}

/// The mutable part of a connection, guarded by the connection lock.
pub struct ConnInner {
    /// The reply tuple. Only rewritten before confirmation.
    pub reply: Tuple,
    pub proto: ProtoState,
    /// The timeout most recently applied by the tracker.
    pub timeout: Duration,
    /// When the connection expires. Unset until confirmation.
    pub expires: Option<Moment>,
    pub helper: Option<Arc<dyn Helper>>,
}

/// A tracked connection.
///
/// Connections are shared through `Arc`: the table holds one
/// reference, and every packet attached to the connection holds
/// another for as long as it is being processed.
pub struct Conn {
    id: ConnId,
    orig: Tuple,
    master: Option<ConnId>,
    status: StatusBits,
    inner: KMutex<ConnInner>,
    pkts: [AtomicU64; 2],
    bytes: [AtomicU64; 2],
    _alloc: Option<AllocToken>,
}

impl Conn {
    pub(crate) fn new(
        id: ConnId,
        orig: Tuple,
        reply: Tuple,
        proto: ProtoState,
        master: Option<ConnId>,
        alloc: Option<AllocToken>,
    ) -> Self {
        let status = if master.is_some() {
            ConnStatus::EXPECTED
        } else {
            ConnStatus::empty()
        };

        Self {
            id,
            orig,
            master,
            status: StatusBits::new(status),
            inner: KMutex::new(ConnInner {
                reply,
                proto,
                timeout: Duration::ZERO,
                expires: None,
                helper: None,
            }),
            pkts: Default::default(),
            bytes: Default::default(),
            _alloc: alloc,
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn orig(&self) -> &Tuple {
        &self.orig
    }

    pub fn reply(&self) -> Tuple {
        self.inner.lock().reply
    }

    /// The tuple of a given direction.
    pub fn tuple(&self, dir: Direction) -> Tuple {
        match dir {
            Direction::Original => self.orig,
            Direction::Reply => self.reply(),
        }
    }

    /// The connection whose expectation created this one.
    pub fn master(&self) -> Option<ConnId> {
        self.master
    }

    pub fn status(&self) -> &StatusBits {
        &self.status
    }

    pub fn is_confirmed(&self) -> bool {
        self.status.contains(ConnStatus::CONFIRMED)
    }

    pub fn is_dying(&self) -> bool {
        self.status.contains(ConnStatus::DYING)
    }

    pub fn lock(&self) -> KMutexGuard<'_, ConnInner> {
        self.inner.lock()
    }

    /// Rewrite the reply tuple, e.g. for a NAT-like helper. Only
    /// possible before the connection is confirmed: after that the
    /// table is indexed by the reply tuple.
    pub fn alter_reply(&self, reply: Tuple) -> Result<(), CtError> {
        if self.is_confirmed() {
            return Err(CtError::BadState(format!(
                "conn {} already confirmed",
                self.id
            )));
        }

        self.inner.lock().reply = reply;
        Ok(())
    }

    /// Count a packet of `len` bytes in direction `dir`.
    pub fn account(&self, dir: Direction, len: usize) {
        self.pkts[dir.idx()].fetch_add(1, Ordering::Relaxed);
        self.bytes[dir.idx()].fetch_add(len as u64, Ordering::Relaxed);
    }

    pub fn pkts(&self) -> [u64; 2] {
        [
            self.pkts[0].load(Ordering::Relaxed),
            self.pkts[1].load(Ordering::Relaxed),
        ]
    }

    pub fn bytes(&self) -> [u64; 2] {
        [
            self.bytes[0].load(Ordering::Relaxed),
            self.bytes[1].load(Ordering::Relaxed),
        ]
    }

    pub fn helper(&self) -> Option<Arc<dyn Helper>> {
        self.inner.lock().helper.clone()
    }

    /// Milliseconds until expiry, if a timer is armed.
    pub fn remaining_ms(&self, now: Moment) -> Option<u64> {
        self.inner.lock().expires.map(|exp| exp.delta_as_millis(now))
    }

    pub fn status_dump(&self) -> ConnStatusDump {
        let s = self.status.get();
        ConnStatusDump {
            expected: s.contains(ConnStatus::EXPECTED),
            seen_reply: s.contains(ConnStatus::SEEN_REPLY),
            assured: s.contains(ConnStatus::ASSURED),
            confirmed: s.contains(ConnStatus::CONFIRMED),
            dying: s.contains(ConnStatus::DYING),
        }
    }
}

impl ConnInner {
    /// Apply `timeout`. A confirmed connection's timer is pushed out
    /// to `now + timeout`; an unconfirmed one just remembers the value
    /// and arms it at confirmation.
    pub fn refresh(&mut self, confirmed: bool, now: Moment, timeout: Duration) {
        self.timeout = timeout;
        if confirmed {
            self.expires = Some(now + timeout);
        }
    }

    /// Has the timer fired as of `now`?
    pub fn is_expired(&self, now: Moment) -> bool {
        matches!(self.expires, Some(exp) if exp <= now)
    }
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Conn")
            .field("id", &self.id)
            .field("orig", &self.orig)
            .field("status", &self.status.get())
            .finish()
    }
}

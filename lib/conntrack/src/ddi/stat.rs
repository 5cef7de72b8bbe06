// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Named counters, sharded per CPU.
//!
//! A stats struct is a set of named [`StatU64`] fields with
//! `#[derive(StatProvider)]`:
//!
//! ```ignore
//! #[derive(StatProvider)]
//! struct SomeStats {
//!     pkts_in: StatU64,
//!     pkts_out: StatU64,
//! }
//! ```
//!
//! The derive generates a `SomeStatsSnap` holding plain `u64`s, which
//! is what the introspection interface hands out. Wrapping the
//! provider in a [`PerCpu`] gives each thread its own shard to bump,
//! and the shards are only summed when someone asks.
use core::ops::AddAssign;
use core::sync::atomic::AtomicU64;
use core::sync::atomic::AtomicUsize;
use core::sync::atomic::Ordering;

/// A provider of named counters.
///
/// Rather than implementing this trait manually, the stat-macro
/// should be used.
pub trait StatProvider {
    const NUM_FIELDS: u32;
    type Snap;

    fn new() -> Self;

    fn num_fields(&self) -> u32 {
        Self::NUM_FIELDS
    }

    /// Return a snapshot of the stats. This is how you obtain a copy,
    /// as opposed to the traditional clone().
    fn snapshot(&self) -> Self::Snap;

    /// Zero every counter.
    fn reset(&self);
}

/// A 64-bit unsigned counter.
///
/// Updates are relaxed atomics: individual counters never tear, but a
/// snapshot taken while packets are in flight may present a set of
/// values that were never simultaneously true.
#[derive(Debug, Default)]
#[repr(transparent)]
pub struct StatU64 {
    value: AtomicU64,
}

impl StatU64 {
    pub const fn new() -> Self {
        Self { value: AtomicU64::new(0) }
    }

    #[inline]
    pub fn incr(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn decr(&self, n: u64) {
        self.value.fetch_sub(n, Ordering::Relaxed);
    }

    pub fn set(&self, val: u64) {
        self.value.store(val, Ordering::Relaxed);
    }

    pub fn val(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl AddAssign<u64> for StatU64 {
    #[inline]
    fn add_assign(&mut self, other: u64) {
        *self.value.get_mut() += other;
    }
}

static NEXT_SHARD: AtomicUsize = AtomicUsize::new(0);

std::thread_local! {
    static SHARD_SEED: usize = NEXT_SHARD.fetch_add(1, Ordering::Relaxed);
}

/// One copy of `T` per available CPU.
///
/// Threads are assigned to shards round-robin the first time they
/// touch any `PerCpu`, and keep that assignment for life. With no
/// more threads than shards each thread has its counters to itself.
pub struct PerCpu<T> {
    shards: Vec<T>,
}

impl<T: StatProvider> PerCpu<T> {
    /// Allocate one shard per available CPU.
    pub fn new() -> Self {
        let n = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::with_shards(n)
    }

    pub fn with_shards(n: usize) -> Self {
        let shards = (0..n.max(1)).map(|_| T::new()).collect();
        Self { shards }
    }

    /// The shard belonging to the calling thread.
    #[inline]
    pub fn get(&self) -> &T {
        let idx = SHARD_SEED.with(|s| *s) % self.shards.len();
        &self.shards[idx]
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    /// Snapshot every shard, in shard order.
    pub fn snapshots(&self) -> Vec<T::Snap> {
        self.shards.iter().map(StatProvider::snapshot).collect()
    }

    /// The sum of all shards.
    pub fn total(&self) -> T::Snap
    where
        T::Snap: AddAssign + Default,
    {
        let mut total = T::Snap::default();
        for shard in &self.shards {
            total += shard.snapshot();
        }
        total
    }

    pub fn reset(&self) {
        self.shards.iter().for_each(StatProvider::reset);
    }
}

impl<T: StatProvider> Default for PerCpu<T> {
    fn default() -> Self {
        Self::new()
    }
}

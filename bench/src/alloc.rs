// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! A counting allocator, so benchmarks can report how many
//! allocations (and bytes) a packet costs on its way through the
//! tracker.

use super::MeasurementInfo;
use criterion::Criterion;
use criterion::Throughput;
use criterion::measurement::Measurement;
use criterion::measurement::ValueFormatter;
use std::alloc::GlobalAlloc;
use std::alloc::Layout;
use std::alloc::System;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

#[global_allocator]
static BENCH_ALLOC: CountingAlloc = CountingAlloc::new();

// Criterion runs one benchmark at a time, so process-wide counters
// are good enough.
struct CountingAlloc {
    allocs: AtomicU64,
    bytes: AtomicU64,
}

impl CountingAlloc {
    const fn new() -> Self {
        Self { allocs: AtomicU64::new(0), bytes: AtomicU64::new(0) }
    }
}

unsafe impl GlobalAlloc for CountingAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.allocs.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(layout.size() as u64, Ordering::Relaxed);
        unsafe { System.alloc(layout) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { System.dealloc(ptr, layout) }
    }
}

/// Counts are small per packet, so values are never rescaled.
struct Unscaled(&'static str);

impl ValueFormatter for Unscaled {
    fn scale_values(&self, _typical: f64, _values: &mut [f64]) -> &'static str {
        self.0
    }

    fn scale_throughputs(
        &self,
        _typical: f64,
        _throughput: &Throughput,
        _values: &mut [f64],
    ) -> &'static str {
        self.0
    }

    fn scale_for_machines(&self, _values: &mut [f64]) -> &'static str {
        self.0
    }
}

static ALLOCS_FMT: Unscaled = Unscaled("");
static BYTES_FMT: Unscaled = Unscaled("B");

/// A measurement reading the allocation count.
pub struct Allocs;

/// A measurement reading the bytes allocated.
pub struct BytesAlloced;

macro_rules! alloc_measurement {
    ($ty:ty, $counter:ident, $fmt:expr, $label:literal) => {
        impl Measurement for $ty {
            type Intermediate = u64;
            type Value = u64;

            fn start(&self) -> u64 {
                BENCH_ALLOC.$counter.load(Ordering::Relaxed)
            }

            fn end(&self, start: u64) -> u64 {
                BENCH_ALLOC.$counter.load(Ordering::Relaxed) - start
            }

            fn add(&self, v1: &u64, v2: &u64) -> u64 {
                v1 + v2
            }

            fn zero(&self) -> u64 {
                0
            }

            fn to_f64(&self, value: &u64) -> f64 {
                *value as f64
            }

            fn formatter(&self) -> &dyn ValueFormatter {
                &$fmt
            }
        }

        impl MeasurementInfo for $ty {
            fn label() -> &'static str {
                $label
            }
        }
    };
}

alloc_measurement!(Allocs, allocs, ALLOCS_FMT, "alloc_ct");
alloc_measurement!(BytesAlloced, bytes, BYTES_FMT, "alloc_sz");

/// A [`Criterion`] tuned for counting: the numbers don't vary from
/// run to run, so a handful of short samples will do.
pub fn new_crit<M: Measurement>(m: M) -> Criterion<M> {
    Criterion::default()
        .with_measurement(m)
        .sample_size(10)
        .warm_up_time(Duration::from_nanos(1))
        .measurement_time(Duration::from_micros(10))
        .nresamples(1)
        // Identical samples trip up the plotting backend.
        .without_plots()
}

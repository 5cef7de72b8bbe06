// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Moments, periodics, etc.
use core::ops::Add;
use core::time::Duration;
use std::io;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::thread::JoinHandle;
use std::time::Instant;

/// The number of milliseconds in a second.
pub const MILLIS: u64 = 1_000;

/// A moment in time.
///
/// Every timeout in the engine is computed against a `Moment` handed
/// in by the caller (see the `_at` entry points), which lets tests and
/// the pcap replayer drive the clock.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Moment {
    inner: Instant,
}

impl Add<Duration> for Moment {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self::Output {
        Moment { inner: self.inner + rhs }
    }
}

impl Moment {
    /// Compute the delta between `self - earlier` and return as
    /// milliseconds. Saturates to zero if `earlier` is in fact later.
    pub fn delta_as_millis(&self, earlier: Moment) -> u64 {
        let delta = self.inner.saturating_duration_since(earlier.inner);
        delta.as_secs() * MILLIS + u64::from(delta.subsec_millis())
    }

    pub fn now() -> Self {
        Self { inner: Instant::now() }
    }
}

impl Default for Moment {
    fn default() -> Self {
        Self::now()
    }
}

/// The interval between invocations of a [`Periodic`].
#[derive(Clone, Copy, Debug)]
pub struct Interval {
    inner: Duration,
}

impl Interval {
    pub fn from_duration(d: Duration) -> Self {
        Self { inner: d }
    }

    pub fn as_duration(&self) -> Duration {
        self.inner
    }
}

struct PeriodicStop {
    stopped: Mutex<bool>,
    cv: Condvar,
}

/// Execute a callback periodically on a dedicated thread.
///
/// The `Box<T>` is owned by the periodic itself and the callback is
/// passed an `&mut T`. Dropping the periodic stops the thread and
/// waits for any in-progress callback to return.
///
/// NOTE: A periodic **cannot** implement `Clone` as it represents a
/// unique resource on the system.
pub struct Periodic {
    name: String,
    stop: Arc<PeriodicStop>,
    handle: Option<JoinHandle<()>>,
}

impl Periodic {
    pub fn new<T: Send + 'static>(
        name: String,
        cb: fn(&mut T),
        mut arg: Box<T>,
        interval: Interval,
    ) -> io::Result<Self> {
        let stop = Arc::new(PeriodicStop {
            stopped: Mutex::new(false),
            cv: Condvar::new(),
        });
        let thread_stop = stop.clone();
        let period = interval.as_duration();

        let handle = std::thread::Builder::new().name(name.clone()).spawn(
            move || {
                let mut stopped = thread_stop
                    .stopped
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);

                loop {
                    let (guard, res) = thread_stop
                        .cv
                        .wait_timeout(stopped, period)
                        .unwrap_or_else(PoisonError::into_inner);
                    stopped = guard;

                    if *stopped {
                        return;
                    }

                    if res.timed_out() {
                        drop(stopped);
                        cb(&mut arg);
                        stopped = thread_stop
                            .stopped
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner);
                    }
                }
            },
        )?;

        Ok(Self { name, stop, handle: Some(handle) })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for Periodic {
    fn drop(&mut self) {
        *self.stop.stopped.lock().unwrap_or_else(PoisonError::into_inner) =
            true;
        self.stop.cv.notify_all();

        // The callback may hold the last reference to whatever owns
        // us, in which case we are being dropped on our own thread. It
        // exits by itself once the callback returns.
        if let Some(handle) = self.handle.take()
            && handle.thread().id() != std::thread::current().id()
        {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::sync::atomic::Ordering;

    #[test]
    fn moment_delta() {
        let t0 = Moment::now();
        let t1 = t0 + Duration::from_millis(1500);
        assert_eq!(t1.delta_as_millis(t0), 1500);
        assert_eq!(t0.delta_as_millis(t1), 0);
    }

    #[test]
    fn periodic_fires_and_stops() {
        fn tick(c: &mut Arc<AtomicU64>) {
            c.fetch_add(1, Ordering::Relaxed);
        }

        let count = Arc::new(AtomicU64::new(0));
        let p = Periodic::new(
            "tick".to_string(),
            tick,
            Box::new(count.clone()),
            Interval::from_duration(Duration::from_millis(5)),
        )
        .unwrap();

        while count.load(Ordering::Relaxed) < 2 {
            std::thread::sleep(Duration::from_millis(5));
        }
        drop(p);

        let after = count.load(Ordering::Relaxed);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(count.load(Ordering::Relaxed), after);
    }
}

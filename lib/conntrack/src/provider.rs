// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Providers allow the engine to run in different contexts by letting
//! the embedder plug in implementations of core services. Today that
//! is only logging: a test wants `println!`, the `ctadm` replay tool
//! wants a structured logger. If a service doesn't have at least two
//! obvious implementations it probably doesn't need to be a provider.

use core::fmt;
use core::fmt::Display;

/// The execution context handed to the engine at init.
pub struct ExecCtx {
    pub log: Box<dyn LogProvider>,
}

impl ExecCtx {
    /// A context which logs to stdout.
    pub fn println() -> Self {
        Self { log: Box::new(PrintlnLog) }
    }

    pub fn log(&self, level: LogLevel, msg: &str) {
        self.log.log(level, msg);
    }
}

/// A logging provider provides the means to log messages to some
/// destination based on the context in which the engine is running.
///
/// For example, in a unit test this could map to `println!`. In
/// `ctadm` it maps to an `slog` drain.
///
/// Logging levels are provided by [`LogLevel`]. These levels will map
/// to the underlying provider with varying degrees of success.
pub trait LogProvider: Send + Sync {
    /// Log a message at the specified level.
    fn log(&self, level: LogLevel, msg: &str);
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LogLevel {
    Note,
    Warn,
    Error,
}

impl Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let level_s = match self {
            Self::Note => "[NOTE]",
            Self::Warn => "[WARN]",
            Self::Error => "[ERROR]",
        };
        write!(f, "{level_s}")
    }
}

#[derive(Clone, Copy)]
pub struct PrintlnLog;

impl LogProvider for PrintlnLog {
    fn log(&self, level: LogLevel, msg: &str) {
        println!("{level} {msg}");
    }
}

/// Discard everything. Used by benchmarks, where a chatty logger
/// would dominate the measurement.
#[derive(Clone, Copy)]
pub struct NullLog;

impl LogProvider for NullLog {
    fn log(&self, _level: LogLevel, _msg: &str) {}
}

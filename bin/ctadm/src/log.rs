// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Engine logging through `slog`.

use conntrack::LogLevel;
use conntrack::LogProvider;
use slog::Drain;
use slog::Logger;
use slog::error;
use slog::info;
use slog::o;
use slog::warn;

/// A terminal logger on stderr, filtered by `RUST_LOG`.
pub fn logger() -> Logger {
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_envlogger::new(drain).fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, o!("component" => "conntrack"))
}

/// Hands engine log messages to an `slog` logger.
pub struct SlogLog {
    log: Logger,
}

impl SlogLog {
    pub fn new(log: Logger) -> Self {
        Self { log }
    }
}

impl LogProvider for SlogLog {
    fn log(&self, level: LogLevel, msg: &str) {
        match level {
            LogLevel::Note => info!(self.log, "{}", msg),
            LogLevel::Warn => warn!(self.log, "{}", msg),
            LogLevel::Error => error!(self.log, "{}", msg),
        }
    }
}

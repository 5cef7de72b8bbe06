// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! An IPv4 connection tracker.
//!
//! The engine classifies every packet handed to it into a tracked
//! connection, drives a per-protocol state machine for that
//! connection, and expires connections which fall idle. It plugs into
//! a packet path through a small set of hook handlers (see
//! [`engine::hook`]) registered at fixed priorities: defragmentation,
//! tracking, helpers, and confirmation.
//!
//! The entry point is [`engine::ConntrackEngine`].

#![allow(clippy::len_without_is_empty)]
#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

// This is needed so that the stat-macro (`#[derive(StatProvider)]`)
// can use fully-qualified type paths.
extern crate self as conntrack;

pub use conntrack_api as api;

pub mod ddi;
pub mod engine;
pub mod print;
pub mod provider;

pub use provider::ExecCtx;
pub use provider::LogLevel;
pub use provider::LogProvider;

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The connection tracking engine.
pub mod cfg;
pub mod checksum;
pub mod conn;
pub mod core;
pub mod defrag;
pub mod expect;
pub mod headers;
pub mod helper;
pub mod hook;
pub mod packet;
pub mod predicate;
pub mod proto;
pub mod stat;
pub mod table;
pub mod tuple;

pub use self::core::ConntrackEngine;
pub use cfg::ConntrackCfg;
pub use conn::Conn;
pub use conn::ConnStatus;
pub use conn::CtInfo;
pub use hook::HookCtx;
pub use hook::HookPoint;
pub use hook::HookTable;
pub use hook::Verdict;
pub use packet::Packet;

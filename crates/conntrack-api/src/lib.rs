// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

#![no_std]
#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

#[cfg(any(feature = "std", test))]
#[macro_use]
extern crate std;

#[macro_use]
extern crate alloc;

use alloc::string::String;
use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;

pub mod cmd;
pub mod ip;
pub mod tcp;
pub mod tuple;

pub use cmd::*;
pub use ip::*;
pub use tcp::*;
pub use tuple::*;

/// The overall version of the API. Anytime a dump or request type is
/// added, removed, or modified, this number should increment. `ctadm`
/// refuses to print JSON produced by a different version.
pub const API_VERSION: u64 = 3;

/// The direction of a packet relative to the connection it belongs
/// to.
///
/// The `Original` direction is whichever way the first packet of the
/// connection travelled; `Reply` is the opposite.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub enum Direction {
    Original = 0,
    Reply = 1,
}

impl Direction {
    /// Return the opposite direction.
    pub const fn inverse(self) -> Self {
        match self {
            Self::Original => Self::Reply,
            Self::Reply => Self::Original,
        }
    }

    /// Index into a two-element, per-direction array.
    pub const fn idx(self) -> usize {
        self as usize
    }
}

impl core::str::FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "original" | "orig" => Ok(Direction::Original),
            "reply" => Ok(Direction::Reply),
            _ => Err(format!("invalid direction: {s}")),
        }
    }
}

impl Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let dirstr = match self {
            Direction::Original => "ORIGINAL",
            Direction::Reply => "REPLY",
        };

        write!(f, "{dirstr}")
    }
}

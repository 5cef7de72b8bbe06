// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use super::API_VERSION;
use super::ip::Protocol;
use super::tuple::Tuple;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use core::fmt::Debug;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;

/// Errors surfaced by the connection tracker.
///
/// Only setup-time operations (engine init, tracker and helper
/// registration, explicit table manipulation) hand these back to the
/// caller. The packet path resolves every error into a verdict.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum CtError {
    BadApiVersion {
        user: u64,
        engine: u64,
    },
    /// The config handed to `init` is unusable.
    BadConfig(String),
    BadState(String),
    /// Both tuples of a connection, or one of them, are already in
    /// the table.
    Conflict,
    /// A tracker or helper with the same key is already registered,
    /// or an expectation clashes with another master's.
    Busy(String),
    InvalidPacket(String),
    NotFound(String),
    OutOfMemory,
    /// The table holds its maximum number of connections and nothing
    /// could be evicted.
    TableFull(u64),
}

impl Display for CtError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::BadApiVersion { user, engine } => write!(
                f,
                "API version mismatch: user {user}, engine {engine}"
            ),
            Self::BadConfig(msg) => write!(f, "bad config: {msg}"),
            Self::BadState(msg) => write!(f, "bad state: {msg}"),
            Self::Conflict => write!(f, "tuple already present in table"),
            Self::Busy(what) => write!(f, "{what} already registered"),
            Self::InvalidPacket(msg) => write!(f, "invalid packet: {msg}"),
            Self::NotFound(what) => write!(f, "{what} not found"),
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::TableFull(max) => {
                write!(f, "connection table full ({max} entries)")
            }
        }
    }
}

impl core::error::Error for CtError {}

/// A marker trait indicating a response type that may be handed to
/// an administrative client.
pub trait CmdOk: Debug + Serialize {}

impl CmdOk for () {}

/// The status bits of a connection, flattened for presentation.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize)]
pub struct ConnStatusDump {
    pub expected: bool,
    pub seen_reply: bool,
    pub assured: bool,
    pub confirmed: bool,
    pub dying: bool,
}

impl Display for ConnStatusDump {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut flags = Vec::new();
        if self.expected {
            flags.push("EXPECTED");
        }
        if !self.seen_reply {
            flags.push("UNREPLIED");
        }
        if self.assured {
            flags.push("ASSURED");
        }
        if !self.confirmed {
            flags.push("UNCONFIRMED");
        }
        if self.dying {
            flags.push("DYING");
        }

        if flags.is_empty() {
            write!(f, "-")
        } else {
            write!(f, "[{}]", flags.join(","))
        }
    }
}

/// One live connection.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ConnDump {
    pub id: u64,
    pub proto: Protocol,
    pub orig: Tuple,
    pub reply: Tuple,
    /// Milliseconds until the connection expires, `None` when no
    /// timeout has been armed yet (unconfirmed).
    pub timeout_ms: Option<u64>,
    pub status: ConnStatusDump,
    /// Protocol state summary, e.g. the TCP state name.
    pub proto_state: String,
    pub helper: Option<String>,
    pub master: Option<u64>,
    pub pkts: [u64; 2],
    pub bytes: [u64; 2],
}

/// The response to a connection table dump.
#[derive(Debug, Deserialize, Serialize)]
pub struct DumpConnsResp {
    pub api_version: u64,
    pub count: u64,
    pub max: u64,
    pub conns: Vec<ConnDump>,
}

impl DumpConnsResp {
    pub fn new(count: u64, max: u64, conns: Vec<ConnDump>) -> Self {
        Self { api_version: API_VERSION, count, max, conns }
    }
}

impl CmdOk for DumpConnsResp {}

/// One live expectation.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ExpectDump {
    pub id: u64,
    /// Milliseconds left, or `None` for expectations without a timer
    /// (registered without a helper).
    pub timeout_ms: Option<u64>,
    pub use_count: u32,
    pub permanent: bool,
    pub master: u64,
    pub helper: Option<String>,
    pub template: String,
}

/// The response to an expectation dump.
#[derive(Debug, Deserialize, Serialize)]
pub struct DumpExpectsResp {
    pub api_version: u64,
    pub expects: Vec<ExpectDump>,
}

impl DumpExpectsResp {
    pub fn new(expects: Vec<ExpectDump>) -> Self {
        Self { api_version: API_VERSION, expects }
    }
}

impl CmdOk for DumpExpectsResp {}

/// Check that a response was produced by an engine speaking the same
/// API version as this client.
pub fn check_api_version(engine: u64) -> Result<(), CtError> {
    if engine != API_VERSION {
        return Err(CtError::BadApiVersion { user: API_VERSION, engine });
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn status_display() {
        let mut s = ConnStatusDump::default();
        assert_eq!(s.to_string(), "[UNREPLIED,UNCONFIRMED]");
        s.seen_reply = true;
        s.confirmed = true;
        s.assured = true;
        assert_eq!(s.to_string(), "[ASSURED]");
    }

    #[test]
    fn version_mismatch() {
        assert!(check_api_version(API_VERSION).is_ok());
        assert_eq!(
            check_api_version(API_VERSION + 1),
            Err(CtError::BadApiVersion {
                user: API_VERSION,
                engine: API_VERSION + 1
            })
        );
    }
}

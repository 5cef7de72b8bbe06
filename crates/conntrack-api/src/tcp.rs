// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;

/// The states of a tracked TCP connection.
///
/// Unlike the endpoint states of RFC 793 these describe the
/// connection as seen by a middlebox observing both directions.
/// `FinWait` covers both FIN_WAIT_1 and FIN_WAIT_2, as the observer
/// cannot distinguish them.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[repr(u8)]
pub enum TcpCtState {
    #[default]
    None = 0,
    SynSent = 1,
    SynRecv = 2,
    Established = 3,
    FinWait = 4,
    CloseWait = 5,
    LastAck = 6,
    TimeWait = 7,
    Close = 8,
    Listen = 9,
}

impl TcpCtState {
    /// The number of real states, used to size per-state tables.
    pub const COUNT: usize = 10;

    pub const ALL: [TcpCtState; Self::COUNT] = [
        Self::None,
        Self::SynSent,
        Self::SynRecv,
        Self::Established,
        Self::FinWait,
        Self::CloseWait,
        Self::LastAck,
        Self::TimeWait,
        Self::Close,
        Self::Listen,
    ];

    pub const fn idx(self) -> usize {
        self as usize
    }

    /// Is the connection on its way down?
    pub const fn is_closing(self) -> bool {
        matches!(
            self,
            Self::FinWait
                | Self::CloseWait
                | Self::LastAck
                | Self::TimeWait
                | Self::Close
        )
    }
}

impl Display for TcpCtState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            TcpCtState::None => "NONE",
            TcpCtState::SynSent => "SYN_SENT",
            TcpCtState::SynRecv => "SYN_RECV",
            TcpCtState::Established => "ESTABLISHED",
            TcpCtState::FinWait => "FIN_WAIT",
            TcpCtState::CloseWait => "CLOSE_WAIT",
            TcpCtState::LastAck => "LAST_ACK",
            TcpCtState::TimeWait => "TIME_WAIT",
            TcpCtState::Close => "CLOSE",
            TcpCtState::Listen => "LISTEN",
        };
        write!(f, "{s}")
    }
}

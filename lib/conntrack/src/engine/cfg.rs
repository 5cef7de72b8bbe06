// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Engine configuration.
//!
//! Every field has a default, so a TOML file only needs to name the
//! values it wants to change. Timeouts are in seconds.

use super::Verdict;
use crate::api::CtError;
use crate::api::TcpCtState;
use core::time::Duration;
use serde::Deserialize;
use serde::Serialize;

pub const DEFAULT_HASHSIZE: u32 = 8192;

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConntrackCfg {
    /// Number of hash buckets. Fixed for the life of the engine.
    pub hashsize: u32,

    /// Ceiling on allocated connections, unconfirmed ones included.
    /// Defaults to eight per bucket.
    pub max_conns: u32,

    /// Ceiling on live expectations across all helpers.
    pub expect_max: u32,

    pub tcp: TcpCfg,
    pub udp: UdpCfg,
    pub icmp: IcmpCfg,
    pub generic: GenericCfg,

    /// What to do with a packet which fails to parse or which a
    /// tracker rejects.
    pub invalid_policy: InvalidPolicy,

    /// Log invalid packets whose IP protocol falls in
    /// `[log_invalid_min, log_invalid_max]`. Nothing is logged when
    /// either bound is unset.
    pub log_invalid_min: Option<u8>,
    pub log_invalid_max: Option<u8>,

    /// Seconds a partially reassembled datagram waits for the rest
    /// of its fragments.
    pub frag_timeout: u64,

    /// Concurrent partial datagrams before new ones are refused.
    pub frag_max_datagrams: u32,
}

impl Default for ConntrackCfg {
    fn default() -> Self {
        Self {
            hashsize: DEFAULT_HASHSIZE,
            max_conns: DEFAULT_HASHSIZE * 8,
            expect_max: 256,
            tcp: TcpCfg::default(),
            udp: UdpCfg::default(),
            icmp: IcmpCfg::default(),
            generic: GenericCfg::default(),
            invalid_policy: InvalidPolicy::Accept,
            log_invalid_min: None,
            log_invalid_max: None,
            frag_timeout: 30,
            frag_max_datagrams: 1024,
        }
    }
}

impl ConntrackCfg {
    /// A config sized for a given number of buckets, with the
    /// connection ceiling scaled to match.
    pub fn with_hashsize(hashsize: u32) -> Self {
        Self {
            hashsize,
            max_conns: hashsize.saturating_mul(8),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), CtError> {
        if self.hashsize == 0 {
            return Err(CtError::BadConfig("hashsize must be non-zero".into()));
        }

        if self.max_conns == 0 {
            return Err(CtError::BadConfig(
                "max_conns must be non-zero".into(),
            ));
        }

        if let (Some(min), Some(max)) =
            (self.log_invalid_min, self.log_invalid_max)
            && min > max
        {
            return Err(CtError::BadConfig(format!(
                "log_invalid_min ({min}) exceeds log_invalid_max ({max})"
            )));
        }

        Ok(())
    }

    /// Should an invalid packet of protocol `proto` be logged?
    pub fn log_invalid(&self, proto: u8) -> bool {
        match (self.log_invalid_min, self.log_invalid_max) {
            (Some(min), Some(max)) => (min..=max).contains(&proto),
            _ => false,
        }
    }

    pub fn frag_timeout(&self) -> Duration {
        Duration::from_secs(self.frag_timeout)
    }
}

/// The verdict applied to invalid packets.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum InvalidPolicy {
    /// Let the packet through, untracked.
    Accept,
    Drop,
}

impl InvalidPolicy {
    pub fn verdict(self) -> Verdict {
        match self {
            Self::Accept => Verdict::Accept,
            Self::Drop => Verdict::Drop,
        }
    }
}

/// Per-state TCP timeouts.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct TcpTimeouts {
    pub syn_sent: u64,
    pub syn_recv: u64,
    pub established: u64,
    pub fin_wait: u64,
    pub close_wait: u64,
    pub last_ack: u64,
    pub time_wait: u64,
    pub close: u64,
    pub listen: u64,
}

impl Default for TcpTimeouts {
    fn default() -> Self {
        Self {
            syn_sent: 2 * 60,
            syn_recv: 60,
            established: 5 * 24 * 60 * 60,
            fin_wait: 2 * 60,
            close_wait: 60,
            last_ack: 30,
            time_wait: 2 * 60,
            close: 10,
            listen: 2 * 60,
        }
    }
}

impl TcpTimeouts {
    /// The timeout for a given state. `NONE` never persists past the
    /// packet which created it, so it borrows the `CLOSE` value.
    pub fn get(&self, state: TcpCtState) -> Duration {
        let secs = match state {
            TcpCtState::None | TcpCtState::Close => self.close,
            TcpCtState::SynSent => self.syn_sent,
            TcpCtState::SynRecv => self.syn_recv,
            TcpCtState::Established => self.established,
            TcpCtState::FinWait => self.fin_wait,
            TcpCtState::CloseWait => self.close_wait,
            TcpCtState::LastAck => self.last_ack,
            TcpCtState::TimeWait => self.time_wait,
            TcpCtState::Listen => self.listen,
        };
        Duration::from_secs(secs)
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct TcpCfg {
    pub timeouts: TcpTimeouts,

    /// Applied instead of the state timeout once a connection has
    /// seen more than `max_retrans` retransmissions in a row.
    pub max_retrans_timeout: u64,
    pub max_retrans: u8,

    /// Accept packets outside the tracked window instead of marking
    /// them invalid.
    pub be_liberal: bool,

    /// Pick up connections mid-stream, i.e. let a bare ACK create a
    /// connection in `ESTABLISHED`.
    pub loose: bool,
}

impl Default for TcpCfg {
    fn default() -> Self {
        Self {
            timeouts: TcpTimeouts::default(),
            max_retrans_timeout: 5 * 60,
            max_retrans: 3,
            be_liberal: false,
            loose: true,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct UdpCfg {
    /// Until traffic has been seen in both directions.
    pub timeout: u64,
    pub timeout_stream: u64,
}

impl Default for UdpCfg {
    fn default() -> Self {
        Self { timeout: 30, timeout_stream: 180 }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct IcmpCfg {
    pub timeout: u64,
}

impl Default for IcmpCfg {
    fn default() -> Self {
        Self { timeout: 30 }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct GenericCfg {
    pub timeout: u64,
}

impl Default for GenericCfg {
    fn default() -> Self {
        Self { timeout: 600 }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn validate_rejects_empty_table() {
        let mut cfg = ConntrackCfg::default();
        assert!(cfg.validate().is_ok());
        cfg.hashsize = 0;
        assert!(matches!(cfg.validate(), Err(CtError::BadConfig(_))));

        let cfg = ConntrackCfg { max_conns: 0, ..Default::default() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn log_invalid_range() {
        let mut cfg = ConntrackCfg::default();
        assert!(!cfg.log_invalid(6));
        cfg.log_invalid_min = Some(6);
        cfg.log_invalid_max = Some(17);
        assert!(cfg.log_invalid(6));
        assert!(cfg.log_invalid(17));
        assert!(!cfg.log_invalid(1));
        cfg.log_invalid_min = Some(18);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn tcp_timeout_ordering() {
        let t = TcpTimeouts::default();
        let est = t.get(TcpCtState::Established);
        for state in TcpCtState::ALL {
            assert!(t.get(state) <= est);
        }
        assert!(t.get(TcpCtState::Close) <= t.get(TcpCtState::TimeWait));
    }
}

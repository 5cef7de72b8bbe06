// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Engine counters.

use crate::ddi::stat::PerCpu;
use crate::ddi::stat::StatU64;
use serde::Deserialize;
use serde::Serialize;
use stat_macro::StatProvider;

/// Packet path and table counters, kept per CPU.
#[derive(StatProvider)]
pub struct ConntrackStats {
    /// Hash entries walked during lookups.
    pub searched: StatU64,
    /// Lookups which hit.
    pub found: StatU64,
    /// Connections created.
    pub new: StatU64,
    /// Packets the engine refused to track.
    pub invalid: StatU64,
    /// Packets which already carried a connection when they reached
    /// the tracking hook.
    pub ignore: StatU64,
    /// Connections removed from the table.
    pub delete: StatU64,
    /// Connections confirmed into the table.
    pub insert: StatU64,
    /// Confirmations which lost a race to another packet.
    pub insert_failed: StatU64,
    /// Packets dropped for lack of room.
    pub drop: StatU64,
    pub early_drop: StatU64,
    /// ICMP errors tied to a tracked connection.
    pub icmp_error: StatU64,
    /// Connections created by matching an expectation.
    pub expect_new: StatU64,
    pub expect_create: StatU64,
    pub expect_delete: StatU64,
    /// Packets looked up again after their connection was killed.
    pub repeat: StatU64,
    /// Fragments held back for reassembly.
    pub defrag_consumed: StatU64,
    /// Datagrams split to fit the outbound MTU.
    pub refrag: StatU64,
}

/// Every shard's counters and their sum.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct StatsDump {
    pub per_cpu: Vec<ConntrackStatsSnap>,
    pub total: ConntrackStatsSnap,
}

impl From<&PerCpu<ConntrackStats>> for StatsDump {
    fn from(stats: &PerCpu<ConntrackStats>) -> Self {
        Self { per_cpu: stats.snapshots(), total: stats.total() }
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use conntrack::ExecCtx;
use conntrack::api::Ipv4Cidr;
use conntrack::engine::ConntrackCfg;
use conntrack::engine::ConntrackEngine;
use conntrack::print::print_conns;
use conntrack::print::print_expects;
use conntrack::print::print_stats;
use ctadm::Replayer;
use ctadm::SlogLog;
use ctadm::read_capture;
use ctadm::replay::print_summary;

/// Administer the IPv4 connection tracker
#[derive(Debug, Parser)]
#[command(version)]
enum Command {
    /// Replay a packet capture through a fresh engine, then dump its
    /// connections, expectations and counters.
    Replay {
        /// The capture file. Ethernet and raw IPv4 link types are
        /// understood.
        pcap: PathBuf,

        /// Prefixes owned by the replaying host, comma separated.
        ///
        /// Packets from a local address take the output path, packets
        /// to one take the input path, and the rest are forwarded.
        #[arg(long, value_delimiter = ',', required = true)]
        local: Vec<Ipv4Cidr>,

        /// Engine configuration, in TOML. Unnamed values keep their
        /// defaults.
        #[arg(long)]
        config: Option<PathBuf>,

        /// MTU of the outbound interface. Oversized outbound packets
        /// are refragmented to fit.
        #[arg(long)]
        mtu: Option<usize>,

        /// Print the dumps as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Print the default engine configuration as TOML.
    PrintConfig,
}

fn load_cfg(path: &Path) -> anyhow::Result<ConntrackCfg> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    toml::from_str(&s)
        .with_context(|| format!("failed to parse {}", path.display()))
}

fn main() -> anyhow::Result<()> {
    let cmd = Command::parse();
    match cmd {
        Command::Replay { pcap, local, config, mtu, json } => {
            let cfg = match config {
                Some(path) => load_cfg(&path)?,
                None => ConntrackCfg::default(),
            };

            let bytes = std::fs::read(&pcap)
                .with_context(|| format!("failed to read {}", pcap.display()))?;
            let cap = read_capture(&bytes)?;

            let log = SlogLog::new(ctadm::log::logger());
            let ectx = Arc::new(ExecCtx { log: Box::new(log) });
            let engine = ConntrackEngine::init(cfg, ectx)?;

            let mut replayer = Replayer::new(engine, local);
            if let Some(mtu) = mtu {
                replayer = replayer.with_mtu(mtu);
            }
            replayer.replay(cap);

            let report = replayer.report();
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_summary(&report.summary)?;
                println!();
                print_conns(&report.conns)?;
                println!();
                print_expects(&report.expects)?;
                println!();
                print_stats(&report.stats)?;
            }

            replayer.engine().shutdown();
        }

        Command::PrintConfig => {
            print!("{}", toml::to_string(&ConntrackCfg::default())?);
        }
    }

    Ok(())
}

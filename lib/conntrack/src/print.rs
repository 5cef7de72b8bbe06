// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Print introspection dumps in human-friendly manner.
//!
//! This is mostly just a place to hang printing routines so that they
//! can be used by both ctadm and integration tests.

use crate::api::ConnDump;
use crate::api::DumpConnsResp;
use crate::api::DumpExpectsResp;
use crate::api::L4Tuple;
use crate::api::Tuple;
use crate::engine::stat::ConntrackStatsSnap;
use crate::engine::stat::StatsDump;
use std::io::Write;
use tabwriter::TabWriter;

/// Print a [`DumpConnsResp`].
pub fn print_conns(resp: &DumpConnsResp) -> std::io::Result<()> {
    print_conns_into(&mut std::io::stdout(), resp)
}

/// Print a [`DumpConnsResp`] into a given writer.
pub fn print_conns_into(
    writer: &mut impl Write,
    resp: &DumpConnsResp,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);

    writeln!(t, "Connections: {}/{}", resp.count, resp.max)?;
    write_hr(&mut t)?;
    print_conn_header(&mut t)?;
    for conn in &resp.conns {
        print_conn(&mut t, conn)?;
    }
    t.flush()
}

/// Print the header for the [`print_conn()`] output.
pub fn print_conn_header(t: &mut impl Write) -> std::io::Result<()> {
    writeln!(
        t,
        "ID\tPROTO\tORIG\tREPLY\tSTATE\tTIMEOUT\tFLAGS\tPKTS\tBYTES\tHELPER"
    )
}

fn tuple_str(t: &Tuple) -> String {
    match t.l4 {
        L4Tuple::Ports { src, dst } => {
            format!("{}:{src} > {}:{dst}", t.src, t.dst)
        }
        L4Tuple::Icmp { id, ty, code } => {
            format!("{} > {} {ty}/{code} id={id}", t.src, t.dst)
        }
        L4Tuple::None => format!("{} > {}", t.src, t.dst),
    }
}

/// Print information about a connection.
pub fn print_conn(t: &mut impl Write, conn: &ConnDump) -> std::io::Result<()> {
    let timeout = match conn.timeout_ms {
        Some(ms) => format!("{}s", ms / 1000),
        None => "-".to_string(),
    };

    writeln!(
        t,
        "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}/{}\t{}/{}\t{}",
        conn.id,
        conn.proto,
        tuple_str(&conn.orig),
        tuple_str(&conn.reply),
        if conn.proto_state.is_empty() { "-" } else { &conn.proto_state },
        timeout,
        conn.status,
        conn.pkts[0],
        conn.pkts[1],
        conn.bytes[0],
        conn.bytes[1],
        conn.helper.as_deref().unwrap_or("-"),
    )
}

/// Print a [`DumpExpectsResp`].
pub fn print_expects(resp: &DumpExpectsResp) -> std::io::Result<()> {
    print_expects_into(&mut std::io::stdout(), resp)
}

/// Print a [`DumpExpectsResp`] into a given writer.
pub fn print_expects_into(
    writer: &mut impl Write,
    resp: &DumpExpectsResp,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);

    writeln!(t, "Expectations: {}", resp.expects.len())?;
    write_hr(&mut t)?;
    writeln!(t, "ID\tMASTER\tTIMEOUT\tUSE\tHELPER\tTEMPLATE")?;
    for exp in &resp.expects {
        let timeout = match exp.timeout_ms {
            Some(ms) => format!("{}s", ms / 1000),
            None => "no timeout".to_string(),
        };
        let mut helper = exp.helper.clone().unwrap_or_else(|| "-".into());
        if exp.permanent {
            helper.push_str(" (permanent)");
        }

        writeln!(
            t,
            "{}\t{}\t{}\t{}\t{}\t{}",
            exp.id, exp.master, timeout, exp.use_count, helper, exp.template
        )?;
    }
    t.flush()
}

/// Print a [`StatsDump`]: one column per CPU, then the total.
pub fn print_stats(stats: &StatsDump) -> std::io::Result<()> {
    print_stats_into(&mut std::io::stdout(), stats)
}

/// Print a [`StatsDump`] into a given writer.
pub fn print_stats_into(
    writer: &mut impl Write,
    stats: &StatsDump,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);

    write!(t, "COUNTER")?;
    for cpu in 0..stats.per_cpu.len() {
        write!(t, "\tCPU{cpu}")?;
    }
    writeln!(t, "\tTOTAL")?;

    let total = stats.total.values();
    for (i, name) in ConntrackStatsSnap::NAMES.iter().enumerate() {
        write!(t, "{name}")?;
        for shard in &stats.per_cpu {
            write!(t, "\t{}", shard.values()[i])?;
        }
        writeln!(t, "\t{}", total[i])?;
    }
    t.flush()
}

/// Print a horizontal rule.
pub fn write_hr(t: &mut impl Write) -> std::io::Result<()> {
    writeln!(t, "{:-<70}", "-")
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::ConnStatusDump;
    use crate::api::Protocol;

    #[test]
    fn conn_table() {
        let orig = Tuple::new_ports(
            Protocol::UDP,
            "10.0.0.1".parse().unwrap(),
            5000,
            "10.0.0.2".parse().unwrap(),
            53,
        );
        let resp = DumpConnsResp::new(
            1,
            64,
            vec![ConnDump {
                id: 7,
                proto: Protocol::UDP,
                orig,
                reply: orig.swap_endpoints(),
                timeout_ms: Some(29_500),
                status: ConnStatusDump {
                    confirmed: true,
                    ..Default::default()
                },
                proto_state: String::new(),
                helper: None,
                master: None,
                pkts: [1, 0],
                bytes: [28, 0],
            }],
        );

        let mut out = vec![];
        print_conns_into(&mut out, &resp).unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(out.starts_with("Connections: 1/64"));
        assert!(out.contains("10.0.0.1:5000 > 10.0.0.2:53"));
        assert!(out.contains("[UNREPLIED]"));
        assert!(out.contains("29s"));
    }
}

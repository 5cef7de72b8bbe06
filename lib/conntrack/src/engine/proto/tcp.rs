// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! TCP state and window tracking.
//!
//! The state machine is table driven: the flags of a segment reduce it
//! to one of six classes, and the class, the segment's direction and
//! the current state select the next state. A transition can also say
//! to ignore the segment (it may be legitimate, but we can't tell yet)
//! or that it is invalid.
//!
//! On top of the state machine each direction tracks the highest
//! sequence number sent, the highest one the peer's window allows,
//! and the largest window seen. A segment must fall inside those
//! bounds to move the state along. This is what stops an off-path
//! host from tearing down or hijacking a flow without knowing where
//! its sequence space is.

use super::ErrorCheck;
use super::ProtoRegistry;
use super::ProtoState;
use super::ProtoTracker;
use super::TrackCtx;
use super::TrackVerdict;
use super::parse_ports;
use crate::api::Direction;
use crate::api::L4Tuple;
use crate::api::PROTO_TCP;
use crate::api::TcpCtState;
use crate::api::Tuple;
use crate::engine::cfg::ConntrackCfg;
use crate::engine::cfg::TcpCfg;
use crate::engine::conn::ConnStatus;
use crate::engine::headers::Ipv4Meta;
use crate::engine::headers::ParseError;
use crate::engine::headers::TcpFlags;
use crate::engine::headers::TcpMeta;
use crate::engine::hook::HookPoint;
use bitflags::bitflags;
use core::fmt;
use core::time::Duration;

/// The number of packets of a connection picked up mid-stream which
/// are let through even if they fall outside the window. Until both
/// sides have sent a few segments our idea of the window is a guess.
const LOOSE_PICKUP_PKTS: u8 = 3;

/// The lower bound on how far behind the peer's highest sequence
/// number an acknowledgement may be.
const MAX_ACK_WIN_CONST: u32 = 66000;

/// The classes a segment's flags reduce to, in table order.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum FlagIdx {
    Syn = 0,
    SynAck = 1,
    Fin = 2,
    Ack = 3,
    Rst = 4,
    None = 5,
}

impl FlagIdx {
    fn of(flags: TcpFlags) -> Self {
        if flags.contains(TcpFlags::RST) {
            Self::Rst
        } else if flags.contains(TcpFlags::SYN) {
            if flags.contains(TcpFlags::ACK) { Self::SynAck } else { Self::Syn }
        } else if flags.contains(TcpFlags::FIN) {
            Self::Fin
        } else if flags.contains(TcpFlags::ACK) {
            Self::Ack
        } else {
            Self::None
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Next {
    To(TcpCtState),
    /// Let the segment through without touching state.
    Ignore,
    Invalid,
}

const SS: Next = Next::To(TcpCtState::SynSent);
const SR: Next = Next::To(TcpCtState::SynRecv);
const ES: Next = Next::To(TcpCtState::Established);
const FW: Next = Next::To(TcpCtState::FinWait);
const CW: Next = Next::To(TcpCtState::CloseWait);
const LA: Next = Next::To(TcpCtState::LastAck);
const TW: Next = Next::To(TcpCtState::TimeWait);
const CL: Next = Next::To(TcpCtState::Close);
const IV: Next = Next::Invalid;
const IG: Next = Next::Ignore;

/// `TRANSITIONS[dir][flags][state]`. The state columns are, in order:
/// NONE, SYN_SENT, SYN_RECV, ESTABLISHED, FIN_WAIT, CLOSE_WAIT,
/// LAST_ACK, TIME_WAIT, CLOSE, LISTEN.
#[rustfmt::skip]
const TRANSITIONS: [[[Next; TcpCtState::COUNT]; 6]; 2] = [
    // Original
    [
        /* syn    */ [SS, SS, IG, IG, IG, IG, IG, SS, SS, IV],
        /* synack */ [IV, IV, IG, IG, IG, IG, IG, IG, IG, IV],
        /* fin    */ [IV, IV, FW, FW, LA, LA, LA, TW, CL, IV],
        /* ack    */ [ES, IV, ES, ES, CW, CW, TW, TW, CL, IV],
        /* rst    */ [IV, CL, CL, CL, CL, CL, CL, CL, CL, IV],
        /* none   */ [IV, IV, IV, IV, IV, IV, IV, IV, IV, IV],
    ],
    // Reply
    [
        /* syn    */ [IV, IV, IV, IV, IV, IV, IV, IV, IV, IV],
        /* synack */ [IV, SR, SR, IG, IG, IG, IG, IG, IG, IV],
        /* fin    */ [IV, IV, FW, FW, LA, LA, LA, TW, CL, IV],
        /* ack    */ [IV, IG, SR, ES, CW, CW, TW, TW, CL, IV],
        /* rst    */ [IV, CL, CL, CL, CL, CL, CL, CL, CL, IV],
        /* none   */ [IV, IV, IV, IV, IV, IV, IV, IV, IV, IV],
    ],
];

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct PeerFlags: u8 {
        /// The peer's SYN carried a window scale option.
        const WINDOW_SCALE = 0x01;
        const SACK_PERM = 0x02;
        /// This peer started the close.
        const CLOSE_INIT = 0x04;
    }
}

/// What we know about one side's sequence space.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TcpPeer {
    /// One past the highest sequence number sent.
    pub end: u32,
    /// The highest sequence number the other side's window allows.
    pub max_end: u32,
    /// The largest window advertised.
    pub max_win: u32,
    pub scale: u8,
    pub flags: PeerFlags,
    /// Remaining out-of-window packets tolerated after a mid-stream
    /// pickup.
    pub loose: u8,
}

impl TcpPeer {
    fn take_syn_opts(&mut self, tcp: &TcpMeta) {
        self.flags.remove(PeerFlags::WINDOW_SCALE | PeerFlags::SACK_PERM);
        self.scale = 0;
        if let Some(scale) = tcp.wscale {
            self.flags |= PeerFlags::WINDOW_SCALE;
            self.scale = scale;
        }

        if tcp.sack_perm {
            self.flags |= PeerFlags::SACK_PERM;
        }
    }
}

/// The TCP part of a connection.
#[derive(Clone, Copy, Debug)]
pub struct TcpConnState {
    pub state: TcpCtState,
    /// Indexed by direction.
    pub peers: [TcpPeer; 2],
    /// Consecutive retransmissions of the same segment.
    pub retrans: u8,
    last_index: FlagIdx,
    last_dir: Direction,
    last_seq: u32,
    last_ack: u32,
    last_end: u32,
}

impl Default for TcpConnState {
    fn default() -> Self {
        Self {
            state: TcpCtState::None,
            peers: Default::default(),
            retrans: 0,
            last_index: FlagIdx::None,
            last_dir: Direction::Original,
            last_seq: 0,
            last_ack: 0,
            last_end: 0,
        }
    }
}

impl fmt::Display for TcpConnState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.state)
    }
}

/// `a` comes before `b` in sequence space.
fn before(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

fn after(a: u32, b: u32) -> bool {
    before(b, a)
}

/// The sequence number following the segment: SYN and FIN each take
/// one.
fn seg_end(tcp: &TcpMeta) -> u32 {
    let mut end = tcp.seq.wrapping_add(tcp.data_len as u32);
    if tcp.has_flag(TcpFlags::SYN) {
        end = end.wrapping_add(1);
    }
    if tcp.has_flag(TcpFlags::FIN) {
        end = end.wrapping_add(1);
    }
    end
}

/// Is this a combination of flags a real stack would send? ECE and
/// CWR are ignored.
pub fn valid_flags(flags: TcpFlags) -> bool {
    use TcpFlags as F;

    let f = flags - (F::ECE | F::CWR);
    let valid = [
        F::SYN,
        F::SYN | F::URG,
        F::SYN | F::ACK,
        F::RST,
        F::RST | F::ACK,
        F::RST | F::ACK | F::PSH,
        F::FIN | F::ACK,
        F::ACK,
        F::ACK | F::PSH,
        F::ACK | F::URG,
        F::ACK | F::URG | F::PSH,
        F::FIN | F::ACK | F::PSH,
        F::FIN | F::ACK | F::URG,
        F::FIN | F::ACK | F::URG | F::PSH,
    ];
    valid.contains(&f)
}

/// The result of running a segment through the state machine.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct Outcome {
    verdict: TrackVerdict,
    kill: bool,
    assure: bool,
    /// The timeout to apply, if the segment moved the connection.
    timeout: Option<Duration>,
}

impl Outcome {
    fn verdict(verdict: TrackVerdict) -> Self {
        Self { verdict, kill: false, assure: false, timeout: None }
    }

    fn kill(verdict: TrackVerdict) -> Self {
        Self { kill: true, ..Self::verdict(verdict) }
    }
}

impl TcpConnState {
    /// Build the state for a connection whose first segment is `tcp`.
    fn first(tcp: &TcpMeta, cfg: &TcpCfg) -> Result<Self, &'static str> {
        let index = FlagIdx::of(tcp.flags);
        let next = TRANSITIONS[Direction::Original.idx()][index as usize]
            [TcpCtState::None.idx()];

        let mut st = Self::default();
        let orig = &mut st.peers[Direction::Original.idx()];

        match next {
            Next::To(TcpCtState::SynSent) => {
                orig.end = seg_end(tcp);
                orig.max_end = orig.end;
                orig.max_win = u32::from(tcp.window).max(1);
                orig.take_syn_opts(tcp);
            }

            Next::To(_) if cfg.loose => {
                // Picking up a connection whose start we missed: go
                // with what this segment says and be lenient for a
                // few packets.
                orig.end = seg_end(tcp);
                orig.max_win = u32::from(tcp.window).max(1);
                orig.max_end = orig.end.wrapping_add(orig.max_win);
                for peer in st.peers.iter_mut() {
                    peer.flags = PeerFlags::SACK_PERM;
                    peer.loose = LOOSE_PICKUP_PKTS;
                }
            }

            Next::To(_) => return Err("mid-stream pickup disabled"),

            _ => return Err("segment cannot start a connection"),
        }

        Ok(st)
    }

    fn track(
        &mut self,
        tcp: &TcpMeta,
        dir: Direction,
        status: ConnStatus,
        cfg: &TcpCfg,
    ) -> Outcome {
        let index = FlagIdx::of(tcp.flags);
        let old = self.state;

        let new = match TRANSITIONS[dir.idx()][index as usize][old.idx()] {
            Next::To(s) => s,

            Next::Ignore => {
                // A SYN/ACK acknowledging a SYN we ignored means both
                // ends agree on a connection we lost sync with. Kill
                // ours and drop the SYN/ACK; the client retransmits
                // its SYN and starts clean.
                if index == FlagIdx::SynAck
                    && self.last_index == FlagIdx::Syn
                    && self.last_dir != dir
                    && tcp.ack == self.last_end
                {
                    return Outcome::kill(TrackVerdict::Drop(
                        "SYN/ACK answers an ignored SYN",
                    ));
                }

                self.last_index = index;
                self.last_dir = dir;
                self.last_seq = tcp.seq;
                self.last_end = seg_end(tcp);
                return Outcome::verdict(TrackVerdict::Accept);
            }

            Next::Invalid => {
                return Outcome::verdict(TrackVerdict::Invalid(
                    "invalid TCP state transition",
                ));
            }
        };

        match new {
            TcpCtState::SynSent
                if matches!(old, TcpCtState::TimeWait | TcpCtState::Close) =>
            {
                let sender = &self.peers[dir.idx()];
                if sender.flags.contains(PeerFlags::CLOSE_INIT)
                    || after(tcp.seq, sender.end)
                {
                    // Reopening a closed connection.
                    return Outcome::kill(TrackVerdict::Repeat);
                }

                return Outcome::verdict(TrackVerdict::Invalid(
                    "SYN inside the window of a closing connection",
                ));
            }

            TcpCtState::Close
                if index == FlagIdx::Rst
                    && ((status.contains(ConnStatus::SEEN_REPLY)
                        && self.last_index == FlagIdx::Syn)
                        || (!status.contains(ConnStatus::ASSURED)
                            && self.last_index == FlagIdx::Ack))
                    && tcp.ack == self.last_end =>
            {
                // A RST answering a SYN or ACK we let through while
                // ignoring it.
                return Outcome::verdict(TrackVerdict::Accept);
            }

            _ => {}
        }

        if !self.in_window(tcp, dir, index, cfg) {
            return Outcome::verdict(TrackVerdict::Invalid(
                "segment outside the TCP window",
            ));
        }

        self.last_index = index;
        self.state = new;
        if old != new
            && matches!(new, TcpCtState::FinWait | TcpCtState::Close)
        {
            self.peers[dir.idx()].flags |= PeerFlags::CLOSE_INIT;
        }

        let mut timeout = cfg.timeouts.get(new);
        let retrans_timeout = Duration::from_secs(cfg.max_retrans_timeout);
        if self.retrans >= cfg.max_retrans && timeout > retrans_timeout {
            timeout = retrans_timeout;
        }

        let mut out = Outcome {
            verdict: TrackVerdict::Accept,
            kill: false,
            assure: false,
            timeout: Some(timeout),
        };

        if !status.contains(ConnStatus::SEEN_REPLY) {
            // A connection whose only answer is a RST was never
            // established; drop it now.
            if tcp.has_flag(TcpFlags::RST) {
                return Outcome::kill(TrackVerdict::Accept);
            }
        } else if !status.contains(ConnStatus::ASSURED)
            && matches!(old, TcpCtState::SynRecv | TcpCtState::Established)
            && new == TcpCtState::Established
        {
            out.assure = true;
        }

        out
    }

    fn in_window(
        &mut self,
        tcp: &TcpMeta,
        dir: Direction,
        index: FlagIdx,
        cfg: &TcpCfg,
    ) -> bool {
        let state = self.state;
        let [orig, reply] = &mut self.peers;
        let (sender, receiver) = match dir {
            Direction::Original => (orig, reply),
            Direction::Reply => (reply, orig),
        };

        let syn = tcp.has_flag(TcpFlags::SYN);
        let has_ack = tcp.has_flag(TcpFlags::ACK);
        let rst = tcp.has_flag(TcpFlags::RST);
        let win = u32::from(tcp.window);
        let mut seq = tcp.seq;
        let mut ack = tcp.ack;
        let mut end = seg_end(tcp);

        if sender.end == 0 {
            if syn && has_ack {
                // The SYN/ACK answering the original SYN.
                sender.end = end;
                sender.max_end = end;
                sender.max_win = win.max(1);
                sender.take_syn_opts(tcp);

                // RFC 7323: scaling is only on if both sides offer it.
                if !(sender.flags.contains(PeerFlags::WINDOW_SCALE)
                    && receiver.flags.contains(PeerFlags::WINDOW_SCALE))
                {
                    sender.scale = 0;
                    receiver.scale = 0;
                }
            } else {
                // First segment from this side of a picked up
                // connection.
                sender.end = end;
                sender.max_win = win.max(1);
                sender.max_end = end.wrapping_add(sender.max_win);
            }
        } else if ((state == TcpCtState::SynSent && dir == Direction::Original)
            || (state == TcpCtState::SynRecv && dir == Direction::Reply))
            && after(end, sender.end)
        {
            // A retried SYN (or SYN/ACK) with a new initial sequence
            // number.
            sender.end = end;
            sender.max_end = end;
            sender.max_win = win.max(1);
            sender.take_syn_opts(tcp);
        }

        if !has_ack || (rst && ack == 0) {
            ack = receiver.end;
        }

        if seq == end && (!rst || (seq == 0 && state == TcpCtState::SynSent)) {
            // No data: only the ACK is worth checking.
            seq = sender.end;
            end = sender.end;
        }

        let max_ack_win = sender.max_win.max(MAX_ACK_WIN_CONST);
        let low = sender.end.wrapping_sub(receiver.max_win).wrapping_sub(1);
        let ok = before(seq, sender.max_end.wrapping_add(1))
            && after(end, low)
            && before(ack, receiver.end.wrapping_add(1))
            && after(ack, receiver.end.wrapping_sub(max_ack_win));

        if !ok {
            return sender.loose > 0 || receiver.loose > 0 || cfg.be_liberal;
        }

        let win = if syn { win } else { win << sender.scale };
        if sender.max_win < win {
            sender.max_win = win;
        }

        if after(end, sender.end) {
            sender.end = end;
        }

        if after(end, sender.max_end) {
            receiver.max_win = receiver
                .max_win
                .wrapping_add(end.wrapping_sub(sender.max_end));
        }

        if after(ack.wrapping_add(win), receiver.max_end.wrapping_sub(1)) {
            receiver.max_end = ack.wrapping_add(win);
            if win == 0 {
                receiver.max_end = receiver.max_end.wrapping_add(1);
            }
        }

        sender.loose = sender.loose.saturating_sub(1);

        if index == FlagIdx::Ack {
            if self.last_dir == dir
                && self.last_seq == seq
                && self.last_ack == ack
                && self.last_end == end
            {
                self.retrans = self.retrans.saturating_add(1);
            } else {
                self.last_dir = dir;
                self.last_seq = seq;
                self.last_ack = ack;
                self.last_end = end;
                self.retrans = 0;
            }
        }

        true
    }
}

pub struct TcpTracker;

impl ProtoTracker for TcpTracker {
    fn proto(&self) -> u8 {
        PROTO_TCP
    }

    fn name(&self) -> &'static str {
        "tcp"
    }

    fn pkt_to_tuple(&self, body: &[u8]) -> Result<L4Tuple, ParseError> {
        parse_ports("TCP", body)
    }

    fn invert_tuple(&self, tuple: &Tuple) -> Option<Tuple> {
        Some(tuple.swap_endpoints())
    }

    fn error(
        &self,
        ip: &Ipv4Meta,
        _hook: HookPoint,
        _reg: &ProtoRegistry,
    ) -> ErrorCheck {
        match TcpMeta::parse(ip.body) {
            Err(_) => ErrorCheck::Invalid("truncated or malformed TCP header"),
            Ok(tcp) if !valid_flags(tcp.flags) => {
                ErrorCheck::Invalid("invalid TCP flag combination")
            }
            Ok(_) => ErrorCheck::NotError,
        }
    }

    fn new(
        &self,
        ip: &Ipv4Meta,
        cfg: &ConntrackCfg,
    ) -> Result<ProtoState, &'static str> {
        let tcp = TcpMeta::parse(ip.body)
            .map_err(|_| "truncated or malformed TCP header")?;
        TcpConnState::first(&tcp, &cfg.tcp).map(ProtoState::Tcp)
    }

    fn packet(&self, ctx: &mut TrackCtx) -> TrackVerdict {
        let Ok(tcp) = TcpMeta::parse(ctx.ip.body) else {
            return TrackVerdict::Invalid("truncated or malformed TCP header");
        };

        let status = ctx.conn.status().get();
        let ProtoState::Tcp(st) = &mut ctx.inner.proto else {
            return TrackVerdict::Invalid("connection has no TCP state");
        };

        let out = st.track(&tcp, ctx.dir, status, &ctx.cfg.tcp);
        ctx.kill |= out.kill;
        ctx.assure |= out.assure;
        if let Some(timeout) = out.timeout {
            ctx.refresh(timeout);
        }

        out.verdict
    }

    fn print(&self, state: &ProtoState) -> String {
        match state {
            ProtoState::Tcp(st) => st.to_string(),
            _ => String::from("?"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const CLIENT_ISN: u32 = 1000;
    const SERVER_ISN: u32 = 5000;

    fn seg(flags: TcpFlags, seq: u32, ack: u32) -> TcpMeta {
        TcpMeta {
            src_port: 40000,
            dst_port: 80,
            seq,
            ack,
            flags,
            window: 64240,
            hdr_len: 20,
            data_len: 0,
            wscale: None,
            sack_perm: false,
        }
    }

    const SYN: TcpFlags = TcpFlags::SYN;
    const SYN_ACK: TcpFlags = TcpFlags::SYN.union(TcpFlags::ACK);
    const ACK: TcpFlags = TcpFlags::ACK;
    const FIN_ACK: TcpFlags = TcpFlags::FIN.union(TcpFlags::ACK);
    const RST_ACK: TcpFlags = TcpFlags::RST.union(TcpFlags::ACK);

    const ORIG: Direction = Direction::Original;
    const REPLY: Direction = Direction::Reply;

    fn replied() -> ConnStatus {
        ConnStatus::SEEN_REPLY | ConnStatus::CONFIRMED
    }

    /// Run the three-way handshake, returning the established state.
    fn handshake(cfg: &TcpCfg) -> TcpConnState {
        let syn = seg(SYN, CLIENT_ISN, 0);
        let mut st = TcpConnState::first(&syn, cfg).unwrap();

        let out = st.track(&syn, ORIG, ConnStatus::empty(), cfg);
        assert_eq!(out.verdict, TrackVerdict::Accept);
        assert_eq!(st.state, TcpCtState::SynSent);

        let synack = seg(SYN_ACK, SERVER_ISN, CLIENT_ISN + 1);
        let out = st.track(&synack, REPLY, ConnStatus::CONFIRMED, cfg);
        assert_eq!(out.verdict, TrackVerdict::Accept);
        assert_eq!(st.state, TcpCtState::SynRecv);

        let ack = seg(ACK, CLIENT_ISN + 1, SERVER_ISN + 1);
        let out = st.track(&ack, ORIG, replied(), cfg);
        assert_eq!(out.verdict, TrackVerdict::Accept);
        assert!(out.assure);
        assert_eq!(st.state, TcpCtState::Established);
        let established = cfg.timeouts.get(TcpCtState::Established);
        assert_eq!(out.timeout, Some(established));
        st
    }

    #[test]
    fn three_way_handshake() {
        handshake(&TcpCfg::default());
    }

    #[test]
    fn teardown_reaches_time_wait() {
        use TcpCtState::{CloseWait, FinWait, LastAck, TimeWait};

        let cfg = TcpCfg::default();
        let mut st = handshake(&cfg);
        let status = replied() | ConnStatus::ASSURED;

        let steps = [
            (FIN_ACK, ORIG, CLIENT_ISN + 1, SERVER_ISN + 1, FinWait),
            (ACK, REPLY, SERVER_ISN + 1, CLIENT_ISN + 2, CloseWait),
            (FIN_ACK, REPLY, SERVER_ISN + 1, CLIENT_ISN + 2, LastAck),
            (ACK, ORIG, CLIENT_ISN + 2, SERVER_ISN + 2, TimeWait),
        ];

        for (flags, dir, seq, ack, expect) in steps {
            let out = st.track(&seg(flags, seq, ack), dir, status, &cfg);
            assert_eq!(out.verdict, TrackVerdict::Accept, "{expect}");
            assert_eq!(st.state, expect);
            assert_ne!(st.state, TcpCtState::None);
        }

        assert!(st.peers[ORIG.idx()].flags.contains(PeerFlags::CLOSE_INIT));
        assert!(!st.peers[REPLY.idx()].flags.contains(PeerFlags::CLOSE_INIT));
    }

    #[test]
    fn retransmitted_syn_keeps_state() {
        let cfg = TcpCfg::default();
        let syn = seg(SYN, CLIENT_ISN, 0);
        let mut st = TcpConnState::first(&syn, &cfg).unwrap();
        st.track(&syn, ORIG, ConnStatus::empty(), &cfg);
        let before = st.peers;

        let out = st.track(&syn, ORIG, ConnStatus::CONFIRMED, &cfg);
        assert_eq!(out.verdict, TrackVerdict::Accept);
        assert_eq!(st.state, TcpCtState::SynSent);
        assert_eq!(st.peers, before);
    }

    #[test]
    fn rst_on_established_closes() {
        let cfg = TcpCfg::default();
        let mut st = handshake(&cfg);
        let rst = seg(RST_ACK, CLIENT_ISN + 1, SERVER_ISN + 1);
        let out = st.track(&rst, ORIG, replied() | ConnStatus::ASSURED, &cfg);
        assert_eq!(out.verdict, TrackVerdict::Accept);
        assert!(!out.kill);
        assert_eq!(st.state, TcpCtState::Close);
        assert_eq!(out.timeout, Some(Duration::from_secs(cfg.timeouts.close)));
    }

    #[test]
    fn rst_to_unreplied_syn_kills() {
        let cfg = TcpCfg::default();
        let syn = seg(SYN, CLIENT_ISN, 0);
        let mut st = TcpConnState::first(&syn, &cfg).unwrap();
        st.track(&syn, ORIG, ConnStatus::empty(), &cfg);

        let rst = seg(RST_ACK, 0, CLIENT_ISN + 1);
        let out = st.track(&rst, REPLY, ConnStatus::CONFIRMED, &cfg);
        assert_eq!(out.verdict, TrackVerdict::Accept);
        assert!(out.kill);
    }

    #[test]
    fn syn_on_time_wait_repeats() {
        let cfg = TcpCfg::default();
        let mut st = handshake(&cfg);
        let status = replied() | ConnStatus::ASSURED;
        for (flags, dir, seq, ack) in [
            (FIN_ACK, ORIG, CLIENT_ISN + 1, SERVER_ISN + 1),
            (ACK, REPLY, SERVER_ISN + 1, CLIENT_ISN + 2),
            (FIN_ACK, REPLY, SERVER_ISN + 1, CLIENT_ISN + 2),
            (ACK, ORIG, CLIENT_ISN + 2, SERVER_ISN + 2),
        ] {
            st.track(&seg(flags, seq, ack), dir, status, &cfg);
        }
        assert_eq!(st.state, TcpCtState::TimeWait);

        let out = st.track(&seg(SYN, 90_000, 0), ORIG, status, &cfg);
        assert_eq!(out.verdict, TrackVerdict::Repeat);
        assert!(out.kill);
    }

    #[test]
    fn out_of_window_strict_and_liberal() {
        let mut cfg = TcpCfg::default();
        let mut st = handshake(&cfg);
        let status = replied() | ConnStatus::ASSURED;

        // An ACK for data the server never sent.
        let bogus = seg(ACK, CLIENT_ISN + 1, SERVER_ISN + 1_000_000);
        let out = st.track(&bogus, ORIG, status, &cfg);
        assert!(matches!(out.verdict, TrackVerdict::Invalid(_)));
        assert_eq!(out.timeout, None);

        cfg.be_liberal = true;
        let out = st.track(&bogus, ORIG, status, &cfg);
        assert_eq!(out.verdict, TrackVerdict::Accept);
    }

    #[test]
    fn retransmissions_shorten_timeout() {
        let cfg = TcpCfg { max_retrans: 2, ..Default::default() };
        let mut st = handshake(&cfg);
        let status = replied() | ConnStatus::ASSURED;
        let mut data = seg(ACK, CLIENT_ISN + 1, SERVER_ISN + 1);
        data.data_len = 100;

        let mut last = None;
        for _ in 0..4 {
            last = st.track(&data, ORIG, status, &cfg).timeout;
        }

        assert!(st.retrans >= 2);
        assert_eq!(last, Some(Duration::from_secs(cfg.max_retrans_timeout)));
    }

    #[test]
    fn pickup_requires_loose() {
        let ack = seg(ACK, CLIENT_ISN, SERVER_ISN);
        let st = TcpConnState::first(&ack, &TcpCfg::default()).unwrap();
        assert_eq!(st.peers[0].loose, LOOSE_PICKUP_PKTS);

        let strict = TcpCfg { loose: false, ..Default::default() };
        assert!(TcpConnState::first(&ack, &strict).is_err());
        assert!(TcpConnState::first(&seg(FIN_ACK, 1, 1), &strict).is_err());
    }

    #[test]
    fn flag_combinations() {
        assert!(valid_flags(SYN));
        assert!(valid_flags(SYN_ACK | TcpFlags::ECE | TcpFlags::CWR));
        assert!(!valid_flags(TcpFlags::FIN));
        assert!(!valid_flags(TcpFlags::SYN | TcpFlags::RST));
        assert!(!valid_flags(TcpFlags::SYN | TcpFlags::FIN));
        assert!(!valid_flags(TcpFlags::empty()));
    }

    #[test]
    fn sequence_wraparound() {
        assert!(before(u32::MAX, 1));
        assert!(after(1, u32::MAX));
        assert!(!before(5, 5));
    }
}

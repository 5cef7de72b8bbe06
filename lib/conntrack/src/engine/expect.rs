// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Expectations: connections a helper predicts before they arrive.
//!
//! A helper watching a control connection (say, FTP) learns from the
//! payload that a related data connection is coming, and registers a
//! template for it. The first new connection whose original tuple
//! matches the template consumes the expectation, becomes `EXPECTED`,
//! records the control connection as its master, and inherits the
//! expectation's helper.
//!
//! The store is a single list in registration order, so when several
//! templates match a tuple the oldest wins.
//!
//! An expectation only holds a weak reference to its master. A master
//! released without ever being confirmed (its packet dropped between
//! the helper and confirmation, say) leaves its expectations
//! orphaned, and the store purges those before it matches, expires or
//! reports anything.

use super::conn::Conn;
use super::conn::ConnId;
use super::helper::Helper;
use super::predicate::TupleMatch;
use super::stat::ConntrackStats;
use crate::api::CtError;
use crate::api::ExpectDump;
use crate::api::Tuple;
use crate::ddi::stat::PerCpu;
use crate::ddi::sync::KMutex;
use crate::ddi::sync::KRwLock;
use crate::ddi::time::Moment;
use bitflags::bitflags;
use core::fmt;
use core::sync::atomic::AtomicU64;
use core::sync::atomic::Ordering;
use core::time::Duration;
use std::sync::Arc;
use std::sync::Weak;

pub type ExpectId = u64;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct ExpectFlags: u8 {
        /// Survives being matched; only expiry or an explicit
        /// unexpect removes it.
        const PERMANENT = 1 << 0;
    }
}

/// Called with the new connection and the expectation it consumed.
pub type ExpectFn = Box<dyn Fn(&Conn, &Expectation) + Send + Sync>;

struct ExpectState {
    template: TupleMatch,
    /// Unset for expectations registered without a helper, which
    /// have no timer.
    expires: Option<Moment>,
    use_count: u32,
}

/// A predicted connection.
///
/// Built by [`ExpectStore::alloc`] (or [`HelpCtx::expect`]), adjusted
/// with the builder methods, then made live by
/// [`ExpectStore::related`]. An expectation which is never registered
/// is simply dropped.
///
/// [`HelpCtx::expect`]: super::helper::HelpCtx::expect
pub struct Expectation {
    id: ExpectId,
    master: ConnId,
    master_ref: Weak<Conn>,
    helper: Option<Arc<dyn Helper>>,
    flags: ExpectFlags,
    timeout: Option<Duration>,
    on_match: Option<ExpectFn>,
    state: KMutex<ExpectState>,
}

impl Expectation {
    pub fn permanent(mut self) -> Self {
        self.flags |= ExpectFlags::PERMANENT;
        self
    }

    /// Override the helper's expectation timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn on_match(mut self, f: ExpectFn) -> Self {
        self.on_match = Some(f);
        self
    }

    pub fn id(&self) -> ExpectId {
        self.id
    }

    pub fn master(&self) -> ConnId {
        self.master
    }

    pub fn helper(&self) -> Option<&Arc<dyn Helper>> {
        self.helper.as_ref()
    }

    pub fn flags(&self) -> ExpectFlags {
        self.flags
    }

    pub fn is_permanent(&self) -> bool {
        self.flags.contains(ExpectFlags::PERMANENT)
    }

    pub fn template(&self) -> TupleMatch {
        self.state.lock().template.clone()
    }

    pub fn use_count(&self) -> u32 {
        self.state.lock().use_count
    }

    pub fn expires(&self) -> Option<Moment> {
        self.state.lock().expires
    }

    /// Is the master gone, or on its way out?
    fn is_orphaned(&self) -> bool {
        self.master_ref.upgrade().is_none_or(|m| m.is_dying())
    }

    fn is_expired(&self, now: Moment) -> bool {
        matches!(self.state.lock().expires, Some(exp) if exp <= now)
    }

    fn arm(&self, now: Moment) {
        self.state.lock().expires = self.timeout.map(|t| now + t);
    }

    /// Run the match callback, if any, for the connection which just
    /// consumed this expectation.
    pub(crate) fn matched(&self, conn: &Conn) {
        if let Some(f) = &self.on_match {
            f(conn, self);
        }
    }

    fn helper_name(&self) -> Option<String> {
        self.helper.as_ref().map(|h| h.name().to_string())
    }
}

impl fmt::Debug for Expectation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Expectation")
            .field("id", &self.id)
            .field("master", &self.master)
            .field("helper", &self.helper_name())
            .field("flags", &self.flags)
            .field("template", &self.template())
            .finish()
    }
}

/// The live expectations.
pub struct ExpectStore {
    list: KRwLock<Vec<Arc<Expectation>>>,
    next_id: AtomicU64,
    max: u32,
    stats: Arc<PerCpu<ConntrackStats>>,
}

impl ExpectStore {
    pub fn new(max: u32, stats: Arc<PerCpu<ConntrackStats>>) -> Self {
        Self {
            list: KRwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            max,
            stats,
        }
    }

    /// Start building an expectation owned by `master`. It inherits
    /// the master's helper and that helper's timeout.
    pub fn alloc(
        &self,
        master: &Arc<Conn>,
        template: TupleMatch,
    ) -> Expectation {
        let helper = master.helper();
        let timeout = helper.as_ref().map(|h| h.expect_timeout());
        Expectation {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            master: master.id(),
            master_ref: Arc::downgrade(master),
            helper,
            flags: ExpectFlags::empty(),
            timeout,
            on_match: None,
            state: KMutex::new(ExpectState {
                template,
                expires: None,
                use_count: 0,
            }),
        }
    }

    /// Make `exp` live.
    ///
    /// Registering the same template for the same master again just
    /// restarts the existing expectation's timer, and hands back that
    /// one. A template overlapping another live one is refused with
    /// `Busy`. When the helper caps the expectations per master and
    /// the cap is reached, the master's oldest goes to make room.
    pub fn related(
        &self,
        exp: Expectation,
        now: Moment,
    ) -> Result<Arc<Expectation>, CtError> {
        let template = exp.template();
        let mut list = self.list.write();
        self.purge_orphans(&mut list);

        for e in list.iter() {
            let other = e.template();
            if e.master == exp.master && other == template {
                e.arm(now);
                return Ok(e.clone());
            }

            if other.overlaps(&template) {
                return Err(CtError::Busy(format!(
                    "expectation {template} (clashes with {})",
                    e.id
                )));
            }
        }

        let max_expected =
            exp.helper.as_ref().map_or(0, |h| h.max_expected());
        if max_expected > 0 {
            let mine = list.iter().filter(|e| e.master == exp.master).count();
            if mine >= max_expected as usize
                && let Some(pos) =
                    list.iter().position(|e| e.master == exp.master)
            {
                list.remove(pos);
                self.stats.get().expect_delete.incr(1);
            }
        }

        if list.len() >= self.max as usize {
            return Err(CtError::OutOfMemory);
        }

        exp.arm(now);
        let exp = Arc::new(exp);
        list.push(exp.clone());
        self.stats.get().expect_create.incr(1);
        Ok(exp)
    }

    /// The oldest expectation whose template matches `tuple`.
    pub fn find(&self, tuple: &Tuple) -> Option<Arc<Expectation>> {
        self.list
            .read()
            .iter()
            .find(|e| {
                !e.is_orphaned() && e.state.lock().template.matches(tuple)
            })
            .cloned()
    }

    /// Consume the oldest live expectation matching `tuple`, the
    /// original tuple of a connection being created. Unless the
    /// expectation is permanent it leaves the store.
    pub fn take_match(
        &self,
        tuple: &Tuple,
        now: Moment,
    ) -> Option<Arc<Expectation>> {
        let mut list = self.list.write();
        self.purge_orphans(&mut list);
        let pos = list.iter().position(|e| {
            !e.is_expired(now) && e.state.lock().template.matches(tuple)
        })?;

        let exp = if list[pos].is_permanent() {
            list[pos].clone()
        } else {
            list.remove(pos)
        };

        exp.state.lock().use_count += 1;
        Some(exp)
    }

    /// Replace the template of a live expectation.
    pub fn change(
        &self,
        exp: &Expectation,
        template: TupleMatch,
    ) -> Result<(), CtError> {
        let list = self.list.read();
        if !list.iter().any(|e| e.id == exp.id) {
            return Err(CtError::NotFound(format!("expectation {}", exp.id)));
        }

        if let Some(clash) = list
            .iter()
            .find(|e| e.id != exp.id && e.template().overlaps(&template))
        {
            return Err(CtError::Busy(format!(
                "expectation {template} (clashes with {})",
                clash.id
            )));
        }

        exp.state.lock().template = template;
        Ok(())
    }

    /// Remove `exp`. Returns false if it was no longer live.
    pub fn unexpect(&self, exp: &Expectation) -> bool {
        self.remove_where(|e| e.id == exp.id) > 0
    }

    /// Remove every expectation owned by `master`.
    pub fn remove_master(&self, master: ConnId) -> usize {
        self.remove_where(|e| e.master == master)
    }

    /// Remove every expectation created through the helper `name`.
    pub fn remove_helper(&self, name: &str) -> usize {
        self.remove_where(|e| {
            e.helper.as_ref().is_some_and(|h| h.name() == name)
        })
    }

    /// Remove the expectations whose timer has fired as of `now`,
    /// along with any orphans.
    pub fn expire_at(&self, now: Moment) -> usize {
        self.remove_where(|e| e.is_orphaned() || e.is_expired(now))
    }

    pub fn flush(&self) -> usize {
        self.remove_where(|_| true)
    }

    fn remove_where<F>(&self, pred: F) -> usize
    where
        F: Fn(&Expectation) -> bool,
    {
        let mut list = self.list.write();
        self.retain(&mut list, |e| !pred(e))
    }

    fn retain<F>(&self, list: &mut Vec<Arc<Expectation>>, keep: F) -> usize
    where
        F: Fn(&Expectation) -> bool,
    {
        let before = list.len();
        list.retain(|e| keep(e));
        let removed = before - list.len();
        if removed > 0 {
            self.stats.get().expect_delete.incr(removed as u64);
        }
        removed
    }

    fn purge_orphans(&self, list: &mut Vec<Arc<Expectation>>) -> usize {
        self.retain(list, |e| !e.is_orphaned())
    }

    /// The number of live expectations.
    pub fn len(&self) -> usize {
        let mut list = self.list.write();
        self.purge_orphans(&mut list);
        list.len()
    }

    pub fn dump(&self, now: Moment) -> Vec<ExpectDump> {
        let mut list = self.list.write();
        self.purge_orphans(&mut list);
        list.iter()
            .map(|e| {
                let st = e.state.lock();
                ExpectDump {
                    id: e.id,
                    timeout_ms: st.expires.map(|exp| exp.delta_as_millis(now)),
                    use_count: st.use_count,
                    permanent: e.is_permanent(),
                    master: e.master,
                    helper: e.helper_name(),
                    template: st.template.to_string(),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::Protocol;
    use crate::engine::predicate::Ipv4AddrMatch;
    use crate::engine::predicate::PortMatch;
    use crate::engine::proto::ProtoState;

    fn master(id: ConnId) -> Arc<Conn> {
        let orig = Tuple::new_ports(
            Protocol::TCP,
            "10.0.0.1".parse().unwrap(),
            40000,
            "10.0.0.2".parse().unwrap(),
            21,
        );
        let reply = orig.swap_endpoints();
        Arc::new(Conn::new(id, orig, reply, ProtoState::None, None, None))
    }

    fn data_ports(lo: u16, hi: u16) -> TupleMatch {
        TupleMatch {
            dst: Ipv4AddrMatch::Exact("10.0.0.2".parse().unwrap()),
            dst_port: PortMatch::Range(lo..=hi),
            ..TupleMatch::any(Protocol::TCP)
        }
    }

    fn data_conn(sport: u16, dport: u16) -> Tuple {
        Tuple::new_ports(
            Protocol::TCP,
            "10.0.0.1".parse().unwrap(),
            sport,
            "10.0.0.2".parse().unwrap(),
            dport,
        )
    }

    fn store(max: u32) -> ExpectStore {
        ExpectStore::new(max, Arc::new(PerCpu::with_shards(1)))
    }

    #[test]
    fn consumed_once() {
        let s = store(16);
        let now = Moment::now();
        let m = master(1);
        s.related(s.alloc(&m, data_ports(5000, 5010)), now).unwrap();
        assert!(s.find(&data_conn(1, 5005)).is_some());

        let exp = s.take_match(&data_conn(1, 5005), now).unwrap();
        assert_eq!(exp.master(), 1);
        assert_eq!(exp.use_count(), 1);
        assert_eq!(s.len(), 0);
        assert!(s.take_match(&data_conn(2, 5005), now).is_none());
    }

    #[test]
    fn permanent_survives_matches() {
        let s = store(16);
        let now = Moment::now();
        let m = master(1);
        s.related(s.alloc(&m, data_ports(5000, 5010)).permanent(), now)
            .unwrap();

        for i in 0..3 {
            assert!(s.take_match(&data_conn(i, 5001), now).is_some());
        }
        assert_eq!(s.len(), 1);
        assert_eq!(s.dump(now)[0].use_count, 3);
        assert!(s.dump(now)[0].permanent);
    }

    #[test]
    fn identical_refreshes_overlap_busy() {
        let s = store(16);
        let t0 = Moment::now();
        let m1 = master(1);
        let m2 = master(2);

        let ten = Duration::from_secs(10);
        let a = s
            .related(s.alloc(&m1, data_ports(5000, 5010)).timeout(ten), t0)
            .unwrap();
        let t1 = t0 + Duration::from_secs(5);
        let b = s.related(s.alloc(&m1, data_ports(5000, 5010)), t1).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.expires(), Some(t1 + Duration::from_secs(10)));
        assert_eq!(s.len(), 1);

        let err = s.related(s.alloc(&m2, data_ports(5010, 5020)), t1);
        assert!(matches!(err, Err(CtError::Busy(_))));
        s.related(s.alloc(&m2, data_ports(6000, 6000)), t1).unwrap();
        assert_eq!(s.len(), 2);
    }

    #[test]
    fn store_limit() {
        let s = store(1);
        let now = Moment::now();
        let m = master(1);
        s.related(s.alloc(&m, data_ports(1, 1)), now).unwrap();
        assert_eq!(
            s.related(s.alloc(&m, data_ports(2, 2)), now).unwrap_err(),
            CtError::OutOfMemory
        );
    }

    #[test]
    fn expiry_and_master_removal() {
        let s = store(16);
        let now = Moment::now();
        let m1 = master(1);
        let m2 = master(2);
        let timeout = Duration::from_secs(30);

        s.related(s.alloc(&m1, data_ports(1, 1)).timeout(timeout), now)
            .unwrap();
        s.related(s.alloc(&m1, data_ports(2, 2)), now).unwrap();
        s.related(s.alloc(&m2, data_ports(3, 3)).timeout(timeout), now)
            .unwrap();

        // No helper, no timer.
        assert_eq!(s.dump(now)[1].timeout_ms, None);
        assert_eq!(s.dump(now)[0].timeout_ms, Some(30_000));

        let later = now + timeout;
        assert!(s.take_match(&data_conn(9, 1), later).is_none());
        assert_eq!(s.expire_at(later), 2);
        assert_eq!(s.len(), 1);

        assert_eq!(s.remove_master(1), 1);
        assert_eq!(s.len(), 0);
        assert_eq!(s.stats.total().expect_delete, 3);
    }

    #[test]
    fn change_template() {
        let s = store(16);
        let now = Moment::now();
        let m = master(1);
        let a = s.related(s.alloc(&m, data_ports(1, 1)), now).unwrap();
        let b = s.related(s.alloc(&m, data_ports(2, 2)), now).unwrap();

        let err = s.change(&a, data_ports(2, 3));
        assert!(matches!(err, Err(CtError::Busy(_))));
        s.change(&a, data_ports(1, 1)).unwrap();
        s.change(&a, data_ports(7, 7)).unwrap();
        assert!(s.find(&data_conn(0, 7)).is_some());

        assert!(s.unexpect(&b));
        assert!(!s.unexpect(&b));
        let err = s.change(&b, data_ports(9, 9));
        assert!(matches!(err, Err(CtError::NotFound(_))));
    }

    #[test]
    fn released_master_orphans_its_expectations() {
        let s = store(16);
        let now = Moment::now();
        let m1 = master(1);
        let m2 = master(2);
        s.related(s.alloc(&m1, data_ports(5000, 5000)), now).unwrap();
        s.related(s.alloc(&m2, data_ports(6000, 6000)), now).unwrap();
        assert_eq!(s.len(), 2);

        drop(m1);
        assert!(s.find(&data_conn(1, 5000)).is_none());
        assert!(s.take_match(&data_conn(1, 5000), now).is_none());
        assert_eq!(s.len(), 1);
        assert_eq!(s.dump(now)[0].master, 2);

        // A master being deleted counts as gone too.
        assert!(m2.status().try_set_dying());
        assert_eq!(s.expire_at(now), 1);
        assert_eq!(s.len(), 0);
        assert_eq!(s.stats.total().expect_delete, 2);
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The connection table.
//!
//! Connections live in an arena keyed by [`ConnId`]. The hash buckets
//! hold ids, not connections: a confirmed connection has exactly two
//! bucket entries, one for its original tuple and one for its reply
//! tuple. An unconfirmed connection has none; it is only reachable
//! through the packet which created it.
//!
//! Tuples are spread over the buckets by SipHash under a random key
//! drawn per table, so which tuples share a bucket can't be worked
//! out ahead of time.
//!
//! A single reader/writer lock covers the buckets and the arena.
//! Lookups share it; confirmation and deletion take it exclusively. A
//! connection's own lock may be taken while holding the table lock,
//! never the other way around.

use super::conn::AllocToken;
use super::conn::Conn;
use super::conn::ConnId;
use super::conn::ConnStatus;
use super::proto::ProtoState;
use super::stat::ConntrackStats;
use crate::api::CtError;
use crate::api::Direction;
use crate::api::Tuple;
use crate::ddi::stat::PerCpu;
use crate::ddi::sync::KRwLock;
use crate::ddi::time::Moment;
use core::hash::Hash;
use core::hash::Hasher;
use siphasher::sip::SipHasher;
use core::sync::atomic::AtomicU32;
use core::sync::atomic::AtomicU64;
use core::sync::atomic::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

/// How many buckets past the one a new connection hashes to are
/// searched for an early-drop victim.
const EARLY_DROP_BUCKETS: usize = 8;

#[derive(Clone, Copy, Debug)]
struct HashEntry {
    tuple: Tuple,
    dir: Direction,
    id: ConnId,
}

struct TableInner {
    buckets: Vec<Vec<HashEntry>>,
    conns: BTreeMap<ConnId, Arc<Conn>>,
}

impl TableInner {
    fn lookup(
        &self,
        bucket: usize,
        tuple: &Tuple,
    ) -> (Option<&HashEntry>, u64) {
        let mut searched = 0;
        for entry in &self.buckets[bucket] {
            if entry.tuple == *tuple {
                return (Some(entry), searched);
            }
            searched += 1;
        }
        (None, searched)
    }

    fn unlink(&mut self, id: ConnId, buckets: [usize; 2]) {
        for b in buckets {
            self.buckets[b].retain(|e| e.id != id);
        }
    }
}

/// A confirmation found one of the connection's tuples already in the
/// table.
#[derive(Debug)]
pub struct Clash {
    /// The connection holding the original tuple, and the direction
    /// it holds it in. `None` if only the reply tuple clashed, or the
    /// connection being confirmed was already dying.
    pub winner: Option<(Arc<Conn>, Direction)>,
}

impl From<Clash> for CtError {
    fn from(_: Clash) -> Self {
        CtError::Conflict
    }
}

pub struct ConnTable {
    inner: KRwLock<TableInner>,
    key: [u8; 16],
    hashsize: u32,
    max: u32,
    /// Connections allocated, confirmed or not. Decremented when the
    /// last reference to a connection goes away.
    allocated: Arc<AtomicU32>,
    next_id: AtomicU64,
    stats: Arc<PerCpu<ConntrackStats>>,
}

impl ConnTable {
    pub fn new(
        hashsize: u32,
        max: u32,
        stats: Arc<PerCpu<ConntrackStats>>,
    ) -> Self {
        let buckets = (0..hashsize.max(1)).map(|_| Vec::new()).collect();
        Self {
            inner: KRwLock::new(TableInner { buckets, conns: BTreeMap::new() }),
            key: rand::random(),
            hashsize: hashsize.max(1),
            max,
            allocated: Arc::new(AtomicU32::new(0)),
            next_id: AtomicU64::new(1),
            stats,
        }
    }

    fn bucket(&self, tuple: &Tuple) -> usize {
        let mut hasher = SipHasher::new_with_key(&self.key);
        tuple.hash(&mut hasher);
        let h = hasher.finish() >> 32;
        ((h * u64::from(self.hashsize)) >> 32) as usize
    }

    /// Number of confirmed connections.
    pub fn len(&self) -> usize {
        self.inner.read().conns.len()
    }

    /// Number of allocated connections, unconfirmed and recently
    /// deleted but still referenced ones included.
    pub fn allocated(&self) -> u32 {
        self.allocated.load(Ordering::Acquire)
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn is_full(&self) -> bool {
        self.allocated() >= self.max
    }

    /// Claim room for one more connection. The slot stays taken
    /// until the token, or the connection it is handed to, is
    /// dropped.
    pub(crate) fn reserve(&self) -> Option<AllocToken> {
        AllocToken::reserve(&self.allocated, self.max)
    }

    /// Create a new, unconfirmed connection in the slot `token`
    /// holds.
    pub(crate) fn alloc(
        &self,
        token: AllocToken,
        orig: Tuple,
        reply: Tuple,
        proto: ProtoState,
        master: Option<ConnId>,
    ) -> Arc<Conn> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.stats.get().new.incr(1);
        Arc::new(Conn::new(id, orig, reply, proto, master, Some(token)))
    }

    /// Find the connection with a tuple equal to `tuple`, and the
    /// direction `tuple` is for.
    pub fn find(&self, tuple: &Tuple) -> Option<(Arc<Conn>, Direction)> {
        let bucket = self.bucket(tuple);
        let inner = self.inner.read();
        let (entry, searched) = inner.lookup(bucket, tuple);
        let stats = self.stats.get();
        stats.searched.incr(searched);

        let entry = entry?;
        let conn = inner.conns.get(&entry.id)?.clone();
        stats.found.incr(1);
        Some((conn, entry.dir))
    }

    /// Is `tuple` held by a connection other than `ignore`? A helper
    /// rewriting a reply tuple uses this to pick a free one.
    pub fn is_taken(&self, tuple: &Tuple, ignore: ConnId) -> bool {
        let bucket = self.bucket(tuple);
        let inner = self.inner.read();
        inner.buckets[bucket]
            .iter()
            .any(|e| e.tuple == *tuple && e.id != ignore)
    }

    pub fn get(&self, id: ConnId) -> Option<Arc<Conn>> {
        self.inner.read().conns.get(&id).cloned()
    }

    /// Link both tuples of `conn` into the table.
    pub fn insert(&self, conn: &Arc<Conn>) -> Result<(), CtError> {
        let mut inner = self.inner.write();
        self.link(&mut inner, conn).map_err(|_| CtError::Conflict)
    }

    fn link(
        &self,
        inner: &mut TableInner,
        conn: &Arc<Conn>,
    ) -> Result<(), Clash> {
        let orig = *conn.orig();
        let reply = conn.reply();
        let ob = self.bucket(&orig);
        let rb = self.bucket(&reply);

        if let (Some(e), _) = inner.lookup(ob, &orig) {
            let winner = inner.conns.get(&e.id).map(|c| (c.clone(), e.dir));
            return Err(Clash { winner });
        }

        if inner.lookup(rb, &reply).0.is_some() {
            return Err(Clash { winner: None });
        }

        let id = conn.id();
        inner.buckets[ob].push(HashEntry {
            tuple: orig,
            dir: Direction::Original,
            id,
        });
        inner.buckets[rb].push(HashEntry {
            tuple: reply,
            dir: Direction::Reply,
            id,
        });
        inner.conns.insert(id, conn.clone());
        Ok(())
    }

    /// Make an unconfirmed connection visible to lookups and start its
    /// timer. Of several connections racing for the same tuples,
    /// exactly one wins; the others get a [`Clash`] naming it.
    pub fn confirm(&self, conn: &Arc<Conn>, now: Moment) -> Result<(), Clash> {
        let mut inner = self.inner.write();
        if conn.is_confirmed() {
            return Ok(());
        }

        if conn.is_dying() {
            return Err(Clash { winner: None });
        }

        if let Err(clash) = self.link(&mut inner, conn) {
            self.stats.get().insert_failed.incr(1);
            return Err(clash);
        }

        {
            let mut ci = conn.lock();
            ci.expires = Some(now + ci.timeout);
        }
        conn.status().set_confirmed();
        self.stats.get().insert.incr(1);
        Ok(())
    }

    /// Remove `conn` from the table. Only the first caller for a given
    /// connection does anything; the return value says whether that
    /// was us.
    pub fn delete(&self, conn: &Conn) -> bool {
        if !conn.status().try_set_dying() {
            return false;
        }

        let mut inner = self.inner.write();
        if inner.conns.remove(&conn.id()).is_some() {
            let orig = self.bucket(conn.orig());
            let reply = self.bucket(&conn.reply());
            inner.unlink(conn.id(), [orig, reply]);
            self.stats.get().delete.incr(1);
        }

        true
    }

    /// Delete every confirmed connection for which `pred` holds,
    /// returning the ones this call deleted.
    pub fn cleanup_by_predicate<F>(&self, pred: F) -> Vec<Arc<Conn>>
    where
        F: Fn(&Conn) -> bool,
    {
        let candidates: Vec<Arc<Conn>> = self
            .inner
            .read()
            .conns
            .values()
            .filter(|c| pred(c))
            .cloned()
            .collect();

        candidates.into_iter().filter(|c| self.delete(c)).collect()
    }

    /// Delete every connection whose timer has fired as of `now`.
    pub fn expire(&self, now: Moment) -> Vec<Arc<Conn>> {
        self.cleanup_by_predicate(|c| c.lock().is_expired(now))
    }

    /// Pick a connection to evict so one hashing like `orig` can be
    /// admitted. Only connections which are not assured are eligible;
    /// of those, the one closest to expiring goes. The victim is
    /// removed from the table and returned.
    pub fn early_drop(&self, orig: &Tuple) -> Option<Arc<Conn>> {
        let start = self.bucket(orig);
        let victim = {
            let inner = self.inner.read();
            let nbuckets = inner.buckets.len();
            let mut best: Option<(Option<Moment>, Arc<Conn>)> = None;

            for i in 0..=EARLY_DROP_BUCKETS.min(nbuckets - 1) {
                let bucket = &inner.buckets[(start + i) % nbuckets];
                for e in bucket.iter().filter(|e| e.dir == Direction::Original)
                {
                    let Some(conn) = inner.conns.get(&e.id) else {
                        continue;
                    };

                    if conn.status().contains(ConnStatus::ASSURED) {
                        continue;
                    }

                    let expires = conn.lock().expires;
                    let better = match &best {
                        None => true,
                        Some((best_exp, _)) => expires < *best_exp,
                    };

                    if better {
                        best = Some((expires, conn.clone()));
                    }
                }
            }

            best.map(|(_, c)| c)
        }?;

        if !self.delete(&victim) {
            return None;
        }

        self.stats.get().early_drop.incr(1);
        Some(victim)
    }

    /// All confirmed connections, oldest first.
    pub fn dump(&self) -> Vec<Arc<Conn>> {
        self.inner.read().conns.values().cloned().collect()
    }

    /// The number of bucket entries pointing at `id`.
    #[cfg(any(test, feature = "test-help"))]
    pub fn entries_for(&self, id: ConnId) -> usize {
        self.inner
            .read()
            .buckets
            .iter()
            .flatten()
            .filter(|e| e.id == id)
            .count()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::Ipv4Addr;
    use crate::api::Protocol;
    use core::time::Duration;

    fn table(hashsize: u32, max: u32) -> ConnTable {
        ConnTable::new(hashsize, max, Arc::new(PerCpu::with_shards(1)))
    }

    fn udp(sport: u16) -> Tuple {
        Tuple::new_ports(
            Protocol::UDP,
            "10.0.0.1".parse().unwrap(),
            sport,
            "10.0.0.2".parse().unwrap(),
            53,
        )
    }

    fn alloc(t: &ConnTable, sport: u16) -> Arc<Conn> {
        let orig = udp(sport);
        let token = t.reserve().unwrap();
        t.alloc(token, orig, orig.swap_endpoints(), ProtoState::None, None)
    }

    #[test]
    fn confirm_links_both_directions() {
        let t = table(16, 16);
        let c = alloc(&t, 1000);
        assert!(t.find(c.orig()).is_none());
        assert_eq!(t.entries_for(c.id()), 0);

        t.confirm(&c, Moment::now()).unwrap();
        assert!(c.is_confirmed());
        assert_eq!(t.entries_for(c.id()), 2);

        let (found, dir) = t.find(c.orig()).unwrap();
        assert!(Arc::ptr_eq(&found, &c));
        assert_eq!(dir, Direction::Original);
        let (found, dir) = t.find(&c.reply()).unwrap();
        assert!(Arc::ptr_eq(&found, &c));
        assert_eq!(dir, Direction::Reply);
    }

    #[test]
    fn confirm_race_has_one_winner() {
        let t = table(16, 16);
        let a = alloc(&t, 1000);
        let b = alloc(&t, 1000);
        let now = Moment::now();

        t.confirm(&a, now).unwrap();
        let clash = t.confirm(&b, now).unwrap_err();
        let (winner, dir) = clash.winner.unwrap();
        assert!(Arc::ptr_eq(&winner, &a));
        assert_eq!(dir, Direction::Original);
        assert_eq!(t.len(), 1);
        assert_eq!(t.entries_for(b.id()), 0);
        assert_eq!(t.stats.total().insert_failed, 1);

        assert!(matches!(t.insert(&b), Err(CtError::Conflict)));
    }

    #[test]
    fn delete_once() {
        let t = table(16, 16);
        let c = alloc(&t, 1000);
        t.confirm(&c, Moment::now()).unwrap();

        assert!(t.delete(&c));
        assert!(!t.delete(&c));
        assert!(t.find(c.orig()).is_none());
        assert_eq!(t.entries_for(c.id()), 0);
        assert_eq!(t.stats.total().delete, 1);

        // Still referenced by us, so still counted.
        assert_eq!(t.allocated(), 1);
        drop(c);
        assert_eq!(t.allocated(), 0);
    }

    #[test]
    fn expire_by_timer() {
        let t = table(16, 16);
        let now = Moment::now();
        let c = alloc(&t, 1000);
        c.lock().timeout = Duration::from_secs(30);
        t.confirm(&c, now).unwrap();

        assert!(t.expire(now + Duration::from_secs(29)).is_empty());
        let gone = t.expire(now + Duration::from_secs(30));
        assert_eq!(gone.len(), 1);
        assert!(c.is_dying());
        assert_eq!(t.len(), 0);
    }

    #[test]
    fn early_drop_spares_assured() {
        // One bucket, so every connection is a candidate.
        let t = table(1, 2);
        let now = Moment::now();

        let keep = alloc(&t, 1000);
        keep.lock().timeout = Duration::from_secs(1);
        t.confirm(&keep, now).unwrap();
        keep.status().set_seen_reply();
        keep.status().set_assured();

        let drop_me = alloc(&t, 1001);
        drop_me.lock().timeout = Duration::from_secs(60);
        t.confirm(&drop_me, now).unwrap();
        assert!(t.is_full());

        let victim = t.early_drop(&udp(1002)).unwrap();
        assert!(Arc::ptr_eq(&victim, &drop_me));
        assert!(t.find(keep.orig()).is_some());
        assert_eq!(t.stats.total().early_drop, 1);

        drop((victim, drop_me));
        assert!(!t.is_full());
        assert!(t.early_drop(&udp(1003)).is_none());
    }

    #[test]
    fn cleanup_matching() {
        let t = table(64, 64);
        let now = Moment::now();
        let conns: Vec<_> = (0..10).map(|i| alloc(&t, 2000 + i)).collect();
        for c in &conns {
            t.confirm(c, now).unwrap();
        }

        let gone = t.cleanup_by_predicate(|c| c.orig().src_port() < Some(2005));
        assert_eq!(gone.len(), 5);
        assert_eq!(t.len(), 5);
        assert!(t.cleanup_by_predicate(|c| c.is_dying()).is_empty());
    }

    #[test]
    fn reservations_stop_at_max() {
        const MAX: u32 = 50;
        let t = table(16, MAX);

        let tokens: Vec<AllocToken> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        (0..20).filter_map(|_| t.reserve()).collect::<Vec<_>>()
                    })
                })
                .collect();
            handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(tokens.len(), MAX as usize);
        assert_eq!(t.allocated(), MAX);
        assert!(t.reserve().is_none());

        drop(tokens);
        assert_eq!(t.allocated(), 0);
        assert!(t.reserve().is_some());
    }

    /// Tuples sharing a bucket in one table go their separate ways
    /// in tables keyed differently.
    #[test]
    fn bucket_collisions_are_per_table() {
        const HASHSIZE: u32 = 1 << 16;
        let t = table(HASHSIZE, 16);

        let mut seen = std::collections::HashMap::new();
        let (a, b) = (0..=u16::MAX)
            .map(|sport| {
                Tuple::new_ports(
                    Protocol::TCP,
                    Ipv4Addr::from(0x0a00_0000 | u32::from(sport)),
                    sport,
                    "192.168.1.10".parse().unwrap(),
                    80,
                )
            })
            .find_map(|tuple| {
                seen.insert(t.bucket(&tuple), tuple).map(|prev| (prev, tuple))
            })
            .unwrap();
        assert_eq!(t.bucket(&a), t.bucket(&b));

        let together = (0..32)
            .map(|_| table(HASHSIZE, 16))
            .filter(|other| other.bucket(&a) == other.bucket(&b))
            .count();
        assert!(together < 4, "{a} and {b} share a bucket {together}/32");
    }
}

//! Lock Manager
//!
//! Logical locks held until the owning transaction ends. Resources form a
//! two-level hierarchy: tables take intent modes (IS, IX, SIX) or full S/X,
//! rows and unique-key values take S or X under an intent lock on their
//! table.
//!
//! The lock table is sharded by resource hash; each shard has its own mutex
//! and condition variable. Waiters re-check their request whenever the shard
//! is signalled and at a short polling interval, which is also where
//! cancellation, timeouts and deadlock victimisation are observed.
//!
//! Deadlocks are found by [`LockManager::detect_deadlocks`], which builds the
//! waits-for graph from the queues and aborts the youngest transaction (the
//! highest id) of every cycle.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use super::CancelToken;
use crate::error::{Error, Result};
use crate::storage::disk::TableId;
use crate::storage::heap::RowId;
use crate::storage::wal::TxId;

const SHARD_COUNT: usize = 16;
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Lock Mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockMode {
    IntentionShared,
    IntentionExclusive,
    Shared,
    SharedIntentionExclusive,
    Exclusive,
}

impl LockMode {
    /// Standard multi-granularity compatibility matrix
    pub fn is_compatible(self, other: LockMode) -> bool {
        use LockMode::*;
        match (self, other) {
            (IntentionShared, Exclusive) | (Exclusive, IntentionShared) => false,
            (IntentionShared, _) | (_, IntentionShared) => true,
            (IntentionExclusive, IntentionExclusive) => true,
            (Shared, Shared) => true,
            _ => false,
        }
    }

    /// Whether holding `self` already grants everything `other` would.
    pub fn covers(self, other: LockMode) -> bool {
        self.combine(other) == self
    }

    /// Weakest mode granting both `self` and `other`
    pub fn combine(self, other: LockMode) -> LockMode {
        use LockMode::*;
        match (self, other) {
            (a, b) if a == b => a,
            (Exclusive, _) | (_, Exclusive) => Exclusive,
            (SharedIntentionExclusive, _) | (_, SharedIntentionExclusive) => SharedIntentionExclusive,
            (Shared, IntentionExclusive) | (IntentionExclusive, Shared) => SharedIntentionExclusive,
            (Shared, IntentionShared) | (IntentionShared, Shared) => Shared,
            (IntentionExclusive, IntentionShared) | (IntentionShared, IntentionExclusive) => {
                IntentionExclusive
            }
            (a, _) => a,
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LockMode::IntentionShared => "IS",
            LockMode::IntentionExclusive => "IX",
            LockMode::Shared => "S",
            LockMode::SharedIntentionExclusive => "SIX",
            LockMode::Exclusive => "X",
        };
        write!(f, "{}", s)
    }
}

/// A lockable object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockResource {
    Table(TableId),
    Row(TableId, RowId),
    /// A value of a unique index: index name and encoded key prefix
    Key(TableId, String, Vec<u8>),
}

impl LockResource {
    pub fn table_id(&self) -> TableId {
        match self {
            LockResource::Table(t) | LockResource::Row(t, _) | LockResource::Key(t, _, _) => *t,
        }
    }
}

impl fmt::Display for LockResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockResource::Table(t) => write!(f, "table {}", t),
            LockResource::Row(t, rid) => write!(f, "row {} of table {}", rid, t),
            LockResource::Key(t, index, key) => {
                write!(f, "key {} of index '{}' (table {})", hex(key), index, t)
            }
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[derive(Debug, Clone)]
struct Request {
    txid: TxId,
    granted: Option<LockMode>,
    /// Mode being waited for (the combined mode for upgrades)
    waiting: Option<LockMode>,
}

#[derive(Debug, Default)]
struct LockQueue {
    requests: Vec<Request>,
}

impl LockQueue {
    fn position(&self, txid: TxId) -> Option<usize> {
        self.requests.iter().position(|r| r.txid == txid)
    }

    /// Whether `txid` (at `pos`) can be granted `mode` now. Upgrades only
    /// need to agree with the granted modes; new requests also queue behind
    /// earlier waiters.
    fn grantable(&self, pos: usize, mode: LockMode) -> bool {
        let txid = self.requests[pos].txid;
        let upgrade = self.requests[pos].granted.is_some();
        for (i, r) in self.requests.iter().enumerate() {
            if r.txid == txid {
                continue;
            }
            if let Some(g) = r.granted {
                if !mode.is_compatible(g) {
                    return false;
                }
            }
            if !upgrade && i < pos && r.waiting.is_some() && r.granted.is_none() {
                return false;
            }
        }
        true
    }

    /// Transactions `txid` waits for
    fn blockers(&self, txid: TxId) -> Vec<TxId> {
        let pos = match self.position(txid) {
            Some(pos) => pos,
            None => return Vec::new(),
        };
        let mode = match self.requests[pos].waiting {
            Some(mode) => mode,
            None => return Vec::new(),
        };
        let upgrade = self.requests[pos].granted.is_some();
        self.requests
            .iter()
            .enumerate()
            .filter(|(i, r)| {
                r.txid != txid
                    && (r.granted.map_or(false, |g| !mode.is_compatible(g))
                        || (!upgrade
                            && *i < pos
                            && r.waiting.map_or(false, |w| !mode.is_compatible(w))))
            })
            .map(|(_, r)| r.txid)
            .collect()
    }
}

#[derive(Debug, Default)]
struct Shard {
    queues: Mutex<HashMap<LockResource, LockQueue>>,
    cv: Condvar,
}

/// Lock Manager
#[derive(Debug)]
pub struct LockManager {
    shards: Vec<Shard>,
    /// Resource each blocked transaction waits on
    waiting: Mutex<HashMap<TxId, LockResource>>,
    victims: Mutex<HashSet<TxId>>,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Shard::default()).collect(),
            waiting: Mutex::new(HashMap::new()),
            victims: Mutex::new(HashSet::new()),
        }
    }

    fn shard(&self, resource: &LockResource) -> &Shard {
        let mut hasher = DefaultHasher::new();
        resource.hash(&mut hasher);
        &self.shards[hasher.finish() as usize % SHARD_COUNT]
    }

    /// Acquire `mode` on `resource` for `txid`, blocking up to `timeout`.
    /// Returns true when the transaction did not hold the resource before.
    pub fn acquire(
        &self,
        txid: TxId,
        resource: &LockResource,
        mode: LockMode,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<bool> {
        let shard = self.shard(resource);
        let mut queues = shard.queues.lock();
        let queue = queues.entry(resource.clone()).or_default();
        let (pos, target, fresh) = match queue.position(txid) {
            Some(pos) => {
                let held = queue.requests[pos].granted.unwrap_or(mode);
                if held.covers(mode) && queue.requests[pos].granted.is_some() {
                    return Ok(false);
                }
                (pos, held.combine(mode), false)
            }
            None => {
                queue.requests.push(Request {
                    txid,
                    granted: None,
                    waiting: None,
                });
                (queue.requests.len() - 1, mode, true)
            }
        };
        if queue.grantable(pos, target) {
            let req = &mut queue.requests[pos];
            req.granted = Some(target);
            req.waiting = None;
            return Ok(fresh);
        }
        queue.requests[pos].waiting = Some(target);
        self.waiting.lock().insert(txid, resource.clone());
        debug!(txid, %resource, mode = %target, "waiting for lock");

        let deadline = Instant::now() + timeout;
        let outcome = loop {
            let queue = match queues.get_mut(resource) {
                Some(queue) => queue,
                None => break Err(Error::InternalInvariant(format!("lock queue for {} vanished", resource))),
            };
            let pos = match queue.position(txid) {
                Some(pos) => pos,
                None => break Err(Error::InternalInvariant(format!("lock request of {} vanished", txid))),
            };
            if self.victims.lock().remove(&txid) {
                break Err(Error::Deadlock(txid));
            }
            if cancel.is_cancelled() {
                break Err(Error::Cancelled);
            }
            if queue.grantable(pos, target) {
                let req = &mut queue.requests[pos];
                req.granted = Some(target);
                req.waiting = None;
                break Ok(fresh);
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(txid, %resource, mode = %target, "lock wait timed out");
                break Err(Error::LockTimeout(resource.to_string()));
            }
            shard
                .cv
                .wait_for(&mut queues, (deadline - now).min(POLL_INTERVAL));
        };
        self.waiting.lock().remove(&txid);
        if outcome.is_err() {
            if let Some(queue) = queues.get_mut(resource) {
                if let Some(pos) = queue.position(txid) {
                    if queue.requests[pos].granted.is_some() {
                        queue.requests[pos].waiting = None;
                    } else {
                        queue.requests.remove(pos);
                    }
                }
                if queue.requests.is_empty() {
                    queues.remove(resource);
                }
            }
            // our queued request may have been blocking others
            shard.cv.notify_all();
        }
        outcome
    }

    /// Drop every lock `txid` holds on `resources` and wake waiters.
    pub fn release_all<'a, I>(&self, txid: TxId, resources: I)
    where
        I: IntoIterator<Item = &'a LockResource>,
    {
        let mut by_shard: BTreeMap<usize, Vec<&LockResource>> = BTreeMap::new();
        for resource in resources {
            let mut hasher = DefaultHasher::new();
            resource.hash(&mut hasher);
            by_shard
                .entry(hasher.finish() as usize % SHARD_COUNT)
                .or_default()
                .push(resource);
        }
        for (idx, resources) in by_shard {
            let shard = &self.shards[idx];
            let mut queues = shard.queues.lock();
            for resource in resources {
                if let Some(queue) = queues.get_mut(resource) {
                    queue.requests.retain(|r| r.txid != txid);
                    if queue.requests.is_empty() {
                        queues.remove(resource);
                    }
                }
            }
            shard.cv.notify_all();
        }
        self.victims.lock().remove(&txid);
    }

    /// Granted locks on `resource`
    pub fn holders(&self, resource: &LockResource) -> Vec<(TxId, LockMode)> {
        self.shard(resource)
            .queues
            .lock()
            .get(resource)
            .map(|q| {
                q.requests
                    .iter()
                    .filter_map(|r| r.granted.map(|g| (r.txid, g)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of resources with at least one request
    pub fn resource_count(&self) -> usize {
        self.shards.iter().map(|s| s.queues.lock().len()).sum()
    }

    /// Build the waits-for graph and pick one victim per cycle. Victims are
    /// woken and fail their pending request with `Deadlock`.
    pub fn detect_deadlocks(&self) -> Vec<TxId> {
        let waiting: Vec<(TxId, LockResource)> = self
            .waiting
            .lock()
            .iter()
            .map(|(t, r)| (*t, r.clone()))
            .collect();
        if waiting.is_empty() {
            return Vec::new();
        }
        let mut graph: BTreeMap<TxId, BTreeSet<TxId>> = BTreeMap::new();
        for (txid, resource) in &waiting {
            let queues = self.shard(resource).queues.lock();
            if let Some(queue) = queues.get(resource) {
                let blockers = queue.blockers(*txid);
                if !blockers.is_empty() {
                    graph.entry(*txid).or_default().extend(blockers);
                }
            }
        }

        let mut victims = Vec::new();
        while let Some(cycle) = find_cycle(&graph) {
            let victim = cycle.iter().copied().max().unwrap_or_default();
            warn!(victim, cycle = ?cycle, "deadlock detected, aborting youngest transaction");
            graph.remove(&victim);
            for edges in graph.values_mut() {
                edges.remove(&victim);
            }
            victims.push(victim);
        }
        if victims.is_empty() {
            return victims;
        }
        self.victims.lock().extend(victims.iter().copied());
        for (txid, resource) in &waiting {
            if victims.contains(txid) {
                let shard = self.shard(resource);
                let _queues = shard.queues.lock();
                shard.cv.notify_all();
            }
        }
        victims
    }
}

/// Any cycle of the graph, as the list of its members
fn find_cycle(graph: &BTreeMap<TxId, BTreeSet<TxId>>) -> Option<Vec<TxId>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Active,
        Done,
    }
    let mut marks: HashMap<TxId, Mark> = HashMap::new();
    for &start in graph.keys() {
        if marks.contains_key(&start) {
            continue;
        }
        // iterative DFS keeping the current path
        let mut path: Vec<TxId> = vec![start];
        let mut iters: Vec<Vec<TxId>> = vec![graph[&start].iter().copied().collect()];
        marks.insert(start, Mark::Active);
        while let Some(pending) = iters.last_mut() {
            match pending.pop() {
                Some(next) => match marks.get(&next) {
                    Some(Mark::Active) => {
                        let from = path.iter().position(|t| *t == next).unwrap_or(0);
                        return Some(path[from..].to_vec());
                    }
                    Some(Mark::Done) => {}
                    None => {
                        marks.insert(next, Mark::Active);
                        path.push(next);
                        iters.push(
                            graph
                                .get(&next)
                                .map(|e| e.iter().copied().collect())
                                .unwrap_or_default(),
                        );
                    }
                },
                None => {
                    iters.pop();
                    if let Some(done) = path.pop() {
                        marks.insert(done, Mark::Done);
                    }
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    const SHORT: Duration = Duration::from_millis(50);

    fn row(slot: u16) -> LockResource {
        LockResource::Row(1, RowId::new(1, slot))
    }

    #[test]
    fn test_compatibility_matrix() {
        use LockMode::*;
        let modes = [IntentionShared, IntentionExclusive, Shared, SharedIntentionExclusive, Exclusive];
        let expected = [
            [true, true, true, true, false],
            [true, true, false, false, false],
            [true, false, true, false, false],
            [true, false, false, false, false],
            [false, false, false, false, false],
        ];
        for (i, a) in modes.iter().enumerate() {
            for (j, b) in modes.iter().enumerate() {
                assert_eq!(a.is_compatible(*b), expected[i][j], "{} vs {}", a, b);
            }
        }
    }

    #[test]
    fn test_combine() {
        use LockMode::*;
        assert_eq!(Shared.combine(IntentionExclusive), SharedIntentionExclusive);
        assert_eq!(IntentionShared.combine(Shared), Shared);
        assert!(Exclusive.covers(Shared));
        assert!(!Shared.covers(IntentionExclusive));
    }

    #[test]
    fn test_shared_then_exclusive_times_out() {
        let lm = LockManager::new();
        let cancel = CancelToken::new();
        assert!(lm.acquire(1, &row(1), LockMode::Shared, SHORT, &cancel).unwrap());
        assert!(lm.acquire(2, &row(1), LockMode::Shared, SHORT, &cancel).unwrap());
        let err = lm
            .acquire(3, &row(1), LockMode::Exclusive, SHORT, &cancel)
            .unwrap_err();
        assert!(matches!(err, Error::LockTimeout(_)));
        assert_eq!(lm.holders(&row(1)).len(), 2);
    }

    #[test]
    fn test_reacquire_and_upgrade() {
        let lm = LockManager::new();
        let cancel = CancelToken::new();
        assert!(lm.acquire(1, &row(1), LockMode::Shared, SHORT, &cancel).unwrap());
        assert!(!lm.acquire(1, &row(1), LockMode::Shared, SHORT, &cancel).unwrap());
        assert!(!lm.acquire(1, &row(1), LockMode::Exclusive, SHORT, &cancel).unwrap());
        assert_eq!(lm.holders(&row(1)), vec![(1, LockMode::Exclusive)]);
        lm.release_all(1, &[row(1)]);
        assert_eq!(lm.resource_count(), 0);
    }

    #[test]
    fn test_waiter_is_granted_after_release() {
        let lm = Arc::new(LockManager::new());
        let cancel = CancelToken::new();
        lm.acquire(1, &row(1), LockMode::Exclusive, SHORT, &cancel).unwrap();
        let lm2 = Arc::clone(&lm);
        let waiter = thread::spawn(move || {
            lm2.acquire(2, &row(1), LockMode::Exclusive, Duration::from_secs(5), &CancelToken::new())
        });
        thread::sleep(Duration::from_millis(30));
        lm.release_all(1, &[row(1)]);
        assert!(waiter.join().unwrap().unwrap());
        assert_eq!(lm.holders(&row(1)), vec![(2, LockMode::Exclusive)]);
    }

    #[test]
    fn test_cancelled_wait() {
        let lm = Arc::new(LockManager::new());
        lm.acquire(1, &row(1), LockMode::Exclusive, SHORT, &CancelToken::new())
            .unwrap();
        let cancel = CancelToken::new();
        let lm2 = Arc::clone(&lm);
        let token = cancel.clone();
        let waiter = thread::spawn(move || {
            lm2.acquire(2, &row(1), LockMode::Shared, Duration::from_secs(5), &token)
        });
        thread::sleep(Duration::from_millis(30));
        cancel.cancel();
        assert!(matches!(waiter.join().unwrap(), Err(Error::Cancelled)));
        assert_eq!(lm.holders(&row(1)), vec![(1, LockMode::Exclusive)]);
    }

    #[test]
    fn test_deadlock_picks_youngest() {
        let lm = Arc::new(LockManager::new());
        let cancel = CancelToken::new();
        lm.acquire(1, &row(1), LockMode::Exclusive, SHORT, &cancel).unwrap();
        lm.acquire(2, &row(2), LockMode::Exclusive, SHORT, &cancel).unwrap();

        let lm1 = Arc::clone(&lm);
        let t1 = thread::spawn(move || {
            lm1.acquire(1, &row(2), LockMode::Exclusive, Duration::from_secs(5), &CancelToken::new())
        });
        let lm2 = Arc::clone(&lm);
        let t2 = thread::spawn(move || {
            lm2.acquire(2, &row(1), LockMode::Exclusive, Duration::from_secs(5), &CancelToken::new())
        });

        let mut victims = Vec::new();
        for _ in 0..100 {
            thread::sleep(Duration::from_millis(10));
            victims = lm.detect_deadlocks();
            if !victims.is_empty() {
                break;
            }
        }
        assert_eq!(victims, vec![2]);
        assert!(matches!(t2.join().unwrap(), Err(Error::Deadlock(2))));
        lm.release_all(2, &[row(2)]);
        assert!(t1.join().unwrap().is_ok());
    }

    #[test]
    fn test_find_cycle() {
        let mut graph = BTreeMap::new();
        graph.insert(1, BTreeSet::from([2]));
        graph.insert(2, BTreeSet::from([3]));
        assert!(find_cycle(&graph).is_none());
        graph.insert(3, BTreeSet::from([1]));
        let mut cycle = find_cycle(&graph).unwrap();
        cycle.sort_unstable();
        assert_eq!(cycle, vec![1, 2, 3]);
    }
}

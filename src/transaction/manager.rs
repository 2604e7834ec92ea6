//! Transaction Manager
//!
//! Hands out transaction ids, takes snapshots, and tracks which
//! transactions are running. The WAL sees a transaction only once it writes:
//! `Begin` is logged lazily by [`TransactionManager::register_writer`], so
//! read-only transactions never touch the log.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::mvcc::{Snapshot, StatusTable};
use crate::error::{Error, Result};
use crate::storage::wal::{LogRecordKind, Lsn, TxId, Wal};

/// Isolation levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IsolationLevel {
    /// Fresh snapshot per statement
    ReadCommitted,
    /// Snapshot plus shared locks on rows read
    RepeatableRead,
    /// One snapshot for the whole transaction
    #[default]
    Snapshot,
    /// Snapshot plus shared locks on rows read and tables scanned
    Serializable,
}

impl IsolationLevel {
    /// Whether the snapshot is refreshed before each statement
    pub fn per_statement_snapshot(&self) -> bool {
        matches!(self, IsolationLevel::ReadCommitted)
    }

    /// Whether rows read are share-locked until commit
    pub fn locks_reads(&self) -> bool {
        matches!(self, IsolationLevel::RepeatableRead | IsolationLevel::Serializable)
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Snapshot => "SNAPSHOT",
            IsolationLevel::Serializable => "SERIALIZABLE",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for IsolationLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_uppercase().replace(['_', '-'], " ");
        match normalized.as_str() {
            "READ COMMITTED" => Ok(IsolationLevel::ReadCommitted),
            "REPEATABLE READ" => Ok(IsolationLevel::RepeatableRead),
            "SNAPSHOT" => Ok(IsolationLevel::Snapshot),
            "SERIALIZABLE" => Ok(IsolationLevel::Serializable),
            _ => Err(Error::InvalidArgument(format!("unknown isolation level '{}'", s))),
        }
    }
}

/// Transaction State
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    /// A statement failed; only abort is accepted
    Failed,
    Committed,
    Aborted,
}

#[derive(Debug, Clone)]
struct ActiveTx {
    /// Oldest id the transaction's current snapshot may not see
    xmin: TxId,
    started: Instant,
    writer: bool,
}

/// Transaction Manager
#[derive(Debug)]
pub struct TransactionManager {
    wal: Arc<Wal>,
    next_txid: AtomicU64,
    active: Mutex<BTreeMap<TxId, ActiveTx>>,
    status: Arc<StatusTable>,
}

impl TransactionManager {
    /// Create a manager whose first transaction id is `next_txid`
    pub fn new(wal: Arc<Wal>, next_txid: TxId) -> Self {
        Self {
            wal,
            next_txid: AtomicU64::new(next_txid.max(1)),
            active: Mutex::new(BTreeMap::new()),
            status: Arc::new(StatusTable::new()),
        }
    }

    pub fn status(&self) -> &Arc<StatusTable> {
        &self.status
    }

    fn take_snapshot(&self, active: &BTreeMap<TxId, ActiveTx>, txid: TxId) -> Snapshot {
        let in_progress: HashSet<TxId> = active.keys().copied().filter(|t| *t != txid).collect();
        Snapshot::new(
            txid,
            self.next_txid.load(Ordering::SeqCst),
            in_progress,
            Arc::clone(&self.status),
        )
    }

    /// Start a transaction and take its first snapshot.
    pub fn begin(&self) -> (TxId, Snapshot) {
        let mut active = self.active.lock();
        let txid = self.next_txid.fetch_add(1, Ordering::SeqCst);
        let snapshot = self.take_snapshot(&active, txid);
        active.insert(
            txid,
            ActiveTx {
                xmin: snapshot.xmin(),
                started: Instant::now(),
                writer: false,
            },
        );
        debug!(txid, "began transaction");
        (txid, snapshot)
    }

    /// A new snapshot for a running transaction (Read Committed statements).
    pub fn refresh_snapshot(&self, txid: TxId) -> Snapshot {
        let mut active = self.active.lock();
        let snapshot = self.take_snapshot(&active, txid);
        if let Some(tx) = active.get_mut(&txid) {
            tx.xmin = snapshot.xmin();
        }
        snapshot
    }

    /// Log `Begin` before the transaction's first write.
    pub fn register_writer(&self, txid: TxId) -> Result<()> {
        let mut active = self.active.lock();
        let tx = active.get_mut(&txid).ok_or_else(|| {
            Error::InternalInvariant(format!("transaction {} is not active", txid))
        })?;
        if !tx.writer {
            self.wal.append(txid, LogRecordKind::Begin)?;
            tx.writer = true;
        }
        Ok(())
    }

    /// Make the transaction durable per the WAL sync mode, then end it.
    /// Returns the commit LSN for writers.
    pub fn commit(&self, txid: TxId) -> Result<Option<Lsn>> {
        let writer = self.is_writer(txid);
        let lsn = if writer {
            let lsn = self.wal.append(txid, LogRecordKind::Commit)?;
            self.wal.commit_flush(lsn)?;
            Some(lsn)
        } else {
            None
        };
        self.active.lock().remove(&txid);
        debug!(txid, ?lsn, "committed transaction");
        Ok(lsn)
    }

    /// End a transaction whose changes were already undone.
    pub fn abort(&self, txid: TxId) -> Result<()> {
        let writer = self.is_writer(txid);
        self.status.mark_aborted(txid);
        self.active.lock().remove(&txid);
        if writer {
            self.wal.append(txid, LogRecordKind::Abort)?;
        }
        debug!(txid, "aborted transaction");
        Ok(())
    }

    fn is_writer(&self, txid: TxId) -> bool {
        self.active.lock().get(&txid).map_or(false, |tx| tx.writer)
    }

    /// Versions deleted by a committed transaction below this id are
    /// invisible to every running and future snapshot.
    pub fn vacuum_horizon(&self) -> TxId {
        let active = self.active.lock();
        active
            .values()
            .map(|tx| tx.xmin)
            .min()
            .unwrap_or_else(|| self.next_txid.load(Ordering::SeqCst))
    }

    /// Whether `txid` has begun and not yet ended
    pub fn is_active(&self, txid: TxId) -> bool {
        self.active.lock().contains_key(&txid)
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Age of the oldest running transaction
    pub fn oldest_active_age(&self) -> Option<std::time::Duration> {
        self.active.lock().values().map(|tx| tx.started.elapsed()).max()
    }

    pub fn next_txid(&self) -> TxId {
        self.next_txid.load(Ordering::SeqCst)
    }

    /// Run `f` while no transaction can start writing. `f` learns whether a
    /// writer is in flight.
    pub fn quiesce<R>(&self, f: impl FnOnce(bool) -> R) -> R {
        let active = self.active.lock();
        let writers = active.values().any(|tx| tx.writer);
        f(writers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::wal::WalSyncMode;
    use tempfile::TempDir;

    fn manager() -> (TempDir, Arc<Wal>, TransactionManager) {
        let dir = TempDir::new().unwrap();
        let (wal, _) = Wal::open(dir.path(), WalSyncMode::Full).unwrap();
        let wal = Arc::new(wal);
        let tm = TransactionManager::new(Arc::clone(&wal), 1);
        (dir, wal, tm)
    }

    #[test]
    fn test_ids_increase_and_snapshots_exclude_running() {
        let (_dir, _wal, tm) = manager();
        let (t1, _) = tm.begin();
        let (t2, s2) = tm.begin();
        assert!(t2 > t1);
        assert!(s2.in_progress.contains(&t1));
        assert!(!s2.includes(t1));
        tm.commit(t1).unwrap();
        assert!(!s2.includes(t1));
        assert!(tm.refresh_snapshot(t2).includes(t1));
    }

    #[test]
    fn test_read_only_commit_writes_no_log() {
        let (_dir, wal, tm) = manager();
        let (t1, _) = tm.begin();
        assert_eq!(tm.commit(t1).unwrap(), None);
        let (t2, _) = tm.begin();
        tm.register_writer(t2).unwrap();
        tm.register_writer(t2).unwrap();
        assert!(tm.commit(t2).unwrap().is_some());
        let kinds: Vec<_> = wal.read_all().unwrap().into_iter().map(|r| r.kind).collect();
        assert_eq!(kinds, vec![LogRecordKind::Begin, LogRecordKind::Commit]);
    }

    #[test]
    fn test_abort_marks_status() {
        let (_dir, _wal, tm) = manager();
        let (t1, _) = tm.begin();
        tm.abort(t1).unwrap();
        assert!(tm.status().is_aborted(t1));
        assert_eq!(tm.active_count(), 0);
    }

    #[test]
    fn test_vacuum_horizon_tracks_oldest_snapshot() {
        let (_dir, _wal, tm) = manager();
        let (t1, _) = tm.begin();
        let (t2, _) = tm.begin();
        // t2's snapshot still misses t1
        tm.commit(t1).unwrap();
        assert_eq!(tm.vacuum_horizon(), t1);
        tm.commit(t2).unwrap();
        assert_eq!(tm.vacuum_horizon(), tm.next_txid());
    }

    #[test]
    fn test_isolation_from_str() {
        assert_eq!(
            "read_committed".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::ReadCommitted
        );
        assert_eq!(IsolationLevel::default(), IsolationLevel::Snapshot);
        assert!("chaos".parse::<IsolationLevel>().is_err());
    }
}

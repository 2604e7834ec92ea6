//! Snapshots and version visibility
//!
//! A snapshot is taken when a transaction (or, under Read Committed, a
//! statement) starts. It records the first transaction id not yet handed
//! out (`high`) and the ids that were still running. A writer's effects are
//! part of the snapshot when it finished before the snapshot was taken and
//! did not abort.
//!
//! A version `(xmin, xmax)` is visible when `xmin` is part of the snapshot
//! (or is the reader itself) and `xmax` is unset, aborted, or not part of
//! the snapshot. A version deleted inside the snapshot ends the walk: older
//! versions of the same row are never visible either.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::storage::heap::{RowVersion, INVALID_TXID, POISON_TXID};
use crate::storage::wal::TxId;

/// Ids of transactions that rolled back. Their versions are undone before
/// the id lands here, so the set only closes the window in between.
#[derive(Debug, Default)]
pub struct StatusTable {
    aborted: RwLock<HashSet<TxId>>,
}

impl StatusTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_aborted(&self, txid: TxId) {
        self.aborted.write().insert(txid);
    }

    pub fn is_aborted(&self, txid: TxId) -> bool {
        txid == POISON_TXID || self.aborted.read().contains(&txid)
    }

    /// Forget aborted ids below `horizon`; no snapshot can ask about them.
    pub fn prune(&self, horizon: TxId) -> usize {
        let mut aborted = self.aborted.write();
        let before = aborted.len();
        aborted.retain(|txid| *txid >= horizon);
        before - aborted.len()
    }
}

/// What a reader sees of one version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisibilityResult {
    Visible,
    /// Not yet (or never) committed for this reader: try the older version
    Invisible,
    /// Deleted within the snapshot: the row does not exist for this reader
    Deleted,
}

/// Whether a writer holding the row's exclusive lock may modify the head
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteCheckResult {
    /// The head is committed and visible; a new version must be pushed
    CanWrite,
    /// The head was written by this transaction and is updated in place
    OwnVersion,
    /// The row is gone (deleted, or an aborted insert)
    Gone,
    /// A transaction outside the snapshot changed or deleted the row
    Conflict,
}

#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Reading transaction
    pub txid: TxId,
    /// First id not handed out when the snapshot was taken
    pub high: TxId,
    /// Transactions running when the snapshot was taken
    pub in_progress: Arc<HashSet<TxId>>,
    status: Arc<StatusTable>,
}

impl Snapshot {
    pub fn new(txid: TxId, high: TxId, in_progress: HashSet<TxId>, status: Arc<StatusTable>) -> Self {
        Self {
            txid,
            high,
            in_progress: Arc::new(in_progress),
            status,
        }
    }

    /// Smallest id whose effects this snapshot may still miss.
    pub fn xmin(&self) -> TxId {
        self.in_progress
            .iter()
            .copied()
            .min()
            .unwrap_or(self.txid)
            .min(self.txid)
    }

    /// Whether the effects of `txid` are part of this snapshot. The reader's
    /// own writes are handled by the callers.
    pub fn includes(&self, txid: TxId) -> bool {
        txid != POISON_TXID
            && txid != self.txid
            && txid < self.high
            && !self.in_progress.contains(&txid)
            && !self.status.is_aborted(txid)
    }

    fn created(&self, xmin: TxId) -> bool {
        xmin != POISON_TXID && (xmin == self.txid || self.includes(xmin))
    }

    pub fn visibility(&self, version: &RowVersion) -> VisibilityResult {
        if !self.created(version.xmin) {
            return VisibilityResult::Invisible;
        }
        if version.xmax == INVALID_TXID {
            return VisibilityResult::Visible;
        }
        if version.xmax == self.txid || self.includes(version.xmax) {
            VisibilityResult::Deleted
        } else {
            VisibilityResult::Visible
        }
    }

    /// Classify the newest version of a row for a writer that holds the
    /// row's exclusive lock, so no other writer is in flight on it.
    pub fn check_write(&self, head: &RowVersion) -> WriteCheckResult {
        if head.xmin == POISON_TXID || self.status.is_aborted(head.xmin) {
            return WriteCheckResult::Gone;
        }
        let deleted = head.xmax != INVALID_TXID && !self.status.is_aborted(head.xmax);
        if head.xmin == self.txid {
            return if deleted {
                WriteCheckResult::Gone
            } else {
                WriteCheckResult::OwnVersion
            };
        }
        if !self.includes(head.xmin) {
            return WriteCheckResult::Conflict;
        }
        if deleted {
            if head.xmax == self.txid || self.includes(head.xmax) {
                return WriteCheckResult::Gone;
            }
            return WriteCheckResult::Conflict;
        }
        WriteCheckResult::CanWrite
    }

    /// Classify the head for a Read Committed writer: any committed head
    /// may be overwritten.
    pub fn check_write_latest(&self, head: &RowVersion) -> WriteCheckResult {
        if head.xmin == POISON_TXID || self.status.is_aborted(head.xmin) {
            return WriteCheckResult::Gone;
        }
        let deleted = head.xmax != INVALID_TXID && !self.status.is_aborted(head.xmax);
        match (head.xmin == self.txid, deleted) {
            (_, true) => WriteCheckResult::Gone,
            (true, false) => WriteCheckResult::OwnVersion,
            (false, false) => WriteCheckResult::CanWrite,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tuple::Tuple;

    fn snapshot(txid: TxId, high: TxId, running: &[TxId]) -> Snapshot {
        Snapshot::new(
            txid,
            high,
            running.iter().copied().collect(),
            Arc::new(StatusTable::new()),
        )
    }

    fn version(xmin: TxId, xmax: TxId) -> RowVersion {
        let mut v = RowVersion::new(xmin, Tuple::new(vec![]));
        v.xmax = xmax;
        v
    }

    #[test]
    fn test_committed_before_snapshot_is_visible() {
        let s = snapshot(10, 11, &[]);
        assert_eq!(s.visibility(&version(5, 0)), VisibilityResult::Visible);
        assert_eq!(s.visibility(&version(5, 7)), VisibilityResult::Deleted);
    }

    #[test]
    fn test_running_or_later_writers_are_invisible() {
        let s = snapshot(10, 11, &[8]);
        assert_eq!(s.visibility(&version(8, 0)), VisibilityResult::Invisible);
        assert_eq!(s.visibility(&version(12, 0)), VisibilityResult::Invisible);
        // deleted by a transaction the snapshot cannot see
        assert_eq!(s.visibility(&version(5, 8)), VisibilityResult::Visible);
        assert_eq!(s.visibility(&version(5, 12)), VisibilityResult::Visible);
    }

    #[test]
    fn test_own_writes() {
        let s = snapshot(10, 11, &[]);
        assert_eq!(s.visibility(&version(10, 0)), VisibilityResult::Visible);
        assert_eq!(s.visibility(&version(5, 10)), VisibilityResult::Deleted);
        assert_eq!(s.visibility(&version(POISON_TXID, 0)), VisibilityResult::Invisible);
    }

    #[test]
    fn test_aborted_deleter_is_ignored() {
        let status = Arc::new(StatusTable::new());
        status.mark_aborted(7);
        let s = Snapshot::new(10, 11, HashSet::new(), Arc::clone(&status));
        assert_eq!(s.visibility(&version(5, 7)), VisibilityResult::Visible);
        assert_eq!(s.visibility(&version(7, 0)), VisibilityResult::Invisible);
        assert_eq!(status.prune(8), 1);
    }

    #[test]
    fn test_write_checks() {
        let s = snapshot(10, 11, &[8]);
        assert_eq!(s.check_write(&version(5, 0)), WriteCheckResult::CanWrite);
        assert_eq!(s.check_write(&version(10, 0)), WriteCheckResult::OwnVersion);
        assert_eq!(s.check_write(&version(8, 0)), WriteCheckResult::Conflict);
        assert_eq!(s.check_write(&version(12, 0)), WriteCheckResult::Conflict);
        assert_eq!(s.check_write(&version(5, 12)), WriteCheckResult::Conflict);
        assert_eq!(s.check_write(&version(5, 6)), WriteCheckResult::Gone);
        assert_eq!(s.check_write(&version(POISON_TXID, 0)), WriteCheckResult::Gone);
        assert_eq!(s.check_write_latest(&version(12, 0)), WriteCheckResult::CanWrite);
        assert_eq!(s.check_write_latest(&version(5, 12)), WriteCheckResult::Gone);
    }

    #[test]
    fn test_xmin() {
        assert_eq!(snapshot(10, 11, &[4, 8]).xmin(), 4);
        assert_eq!(snapshot(10, 11, &[]).xmin(), 10);
    }
}

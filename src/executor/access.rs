//! Row access for the executor
//!
//! MVCC reads over the heap, row and key locking per isolation level, and
//! the write paths that keep every index of a table in step with its heap.
//!
//! An index key is the key encoding of the indexed columns, followed (for
//! secondary indexes) by the primary key columns, followed by the row id.
//! The entry value is the row id. Every version of a row has its key in
//! every index; entries whose version is gone are removed by vacuum, so a
//! reader always re-derives the key from the version it can see and skips
//! entries that do not match.

use std::collections::HashSet;
use std::ops::Bound;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use crate::catalog::{IndexDef, TableDef};
use crate::error::{Error, Result};
use crate::storage::btree::{BTree, Direction};
use crate::storage::codec;
use crate::storage::heap::{HeapFile, RowId, RowVersion, INVALID_TXID, POISON_TXID};
use crate::storage::tuple::{Tuple, Value};
use crate::storage::wal::TxId;
use crate::transaction::{
    CancelToken, IsolationLevel, LockManager, LockMode, LockResource, Snapshot, TransactionManager,
    UndoLog, UndoRecord, VisibilityResult, WriteCheckResult,
};

/// The storage of one table: its heap and one tree per index, in the order
/// of `def.indexes`
#[derive(Debug)]
pub struct TableStore {
    pub def: Arc<TableDef>,
    pub heap: Arc<HeapFile>,
    pub indexes: Vec<Arc<BTree>>,
    next_rowid: AtomicI64,
}

impl TableStore {
    pub fn new(def: Arc<TableDef>, heap: Arc<HeapFile>, indexes: Vec<Arc<BTree>>) -> Result<Self> {
        if indexes.len() != def.indexes.len() {
            return Err(Error::InternalInvariant(format!(
                "table '{}' has {} indexes but {} trees",
                def.name,
                def.indexes.len(),
                indexes.len()
            )));
        }
        let next_rowid = match def.rowid_column() {
            Some(_) => Self::max_rowid(&indexes[0])? + 1,
            None => 1,
        };
        Ok(Self {
            def,
            heap,
            indexes,
            next_rowid: AtomicI64::new(next_rowid),
        })
    }

    /// The same storage with one more index
    pub fn with_index(&self, def: Arc<TableDef>, tree: Arc<BTree>) -> Self {
        let mut indexes = self.indexes.clone();
        indexes.push(tree);
        Self {
            def,
            heap: Arc::clone(&self.heap),
            indexes,
            next_rowid: AtomicI64::new(self.next_rowid.load(Ordering::SeqCst)),
        }
    }

    /// The same storage without the tree of index `name`, which is returned
    /// alongside. `def` must no longer list the index.
    pub fn without_index(&self, def: Arc<TableDef>, name: &str) -> Result<(Self, Arc<BTree>)> {
        let position = self.index_position(name).ok_or_else(|| Error::NoSuchIndex(name.to_string()))?;
        let mut indexes = self.indexes.clone();
        let tree = indexes.remove(position);
        let store = Self {
            def,
            heap: Arc::clone(&self.heap),
            indexes,
            next_rowid: AtomicI64::new(self.next_rowid.load(Ordering::SeqCst)),
        };
        if store.indexes.len() != store.def.indexes.len() {
            return Err(Error::InternalInvariant(format!(
                "table '{}' still lists index '{}'",
                store.def.name, name
            )));
        }
        Ok((store, tree))
    }

    fn max_rowid(primary: &Arc<BTree>) -> Result<i64> {
        let mut cursor = primary.range(Bound::Unbounded, Bound::Unbounded, Direction::Reverse);
        match cursor.next() {
            Some(entry) => {
                let (key, _) = entry?;
                let values = codec::decode_key_tuple(&key, 1)?;
                Ok(values.first().and_then(Value::as_i64).unwrap_or(0))
            }
            None => Ok(0),
        }
    }

    /// Recompute the row-id counter after the primary index was rebuilt.
    pub fn reseed_rowid(&self) -> Result<()> {
        if self.def.rowid_column().is_some() {
            let next = Self::max_rowid(&self.indexes[0])? + 1;
            self.next_rowid.store(next, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Allocate a value for the hidden row-id column
    pub fn next_rowid(&self) -> i64 {
        self.next_rowid.fetch_add(1, Ordering::SeqCst)
    }

    pub fn table_id(&self) -> u32 {
        self.def.id
    }

    pub fn index_position(&self, name: &str) -> Option<usize> {
        self.def
            .indexes
            .iter()
            .position(|idx| idx.name.eq_ignore_ascii_case(name))
    }

    /// Encoded index columns of `tuple`: the part of the key a uniqueness
    /// check or an equality seek looks at.
    pub fn key_prefix(&self, index_no: usize, tuple: &Tuple) -> Vec<u8> {
        let idx = &self.def.indexes[index_no];
        codec::encode_key_tuple(idx.columns.iter().map(|&c| tuple.get(c).unwrap_or(&Value::Null)))
    }

    /// Full entry key of `tuple` stored at `rid`
    pub fn index_key(&self, index_no: usize, tuple: &Tuple, rid: RowId) -> Vec<u8> {
        let idx = &self.def.indexes[index_no];
        let mut key = self.key_prefix(index_no, tuple);
        if !idx.primary {
            for &c in &self.def.primary_key {
                codec::encode_key_into(&mut key, tuple.get(c).unwrap_or(&Value::Null));
            }
        }
        key.extend_from_slice(&rid.to_bytes());
        key
    }

    /// The version of the row at `rid` that `snapshot` sees.
    pub fn read_visible(&self, rid: RowId, snapshot: &Snapshot) -> Result<Option<RowVersion>> {
        for version in self.heap.versions(rid) {
            let version = version?;
            match snapshot.visibility(&version) {
                VisibilityResult::Visible => return Ok(Some(version)),
                VisibilityResult::Deleted => return Ok(None),
                VisibilityResult::Invisible => {}
            }
        }
        Ok(None)
    }

    /// Every version of the row at `rid` that was not rolled back
    pub fn live_versions(&self, rid: RowId) -> Result<Vec<RowVersion>> {
        let mut out = Vec::new();
        for version in self.heap.versions(rid) {
            let version = version?;
            if version.xmin != POISON_TXID {
                out.push(version);
            }
        }
        Ok(out)
    }

    /// Add the keys of every version of every row to index `index_no`.
    /// Used when an index is created and when indexes are rebuilt after
    /// recovery. Returns the number of entries added.
    pub fn fill_index(&self, index_no: usize) -> Result<usize> {
        let tree = &self.indexes[index_no];
        let mut added = 0;
        for rid in self.heap.scan() {
            let rid = rid?;
            for version in self.live_versions(rid)? {
                let key = self.index_key(index_no, &version.tuple, rid);
                if tree.insert_if_absent(&key, &rid.to_bytes())? {
                    added += 1;
                }
            }
        }
        debug!(
            table = %self.def.name,
            index = %self.def.indexes[index_no].name,
            added,
            "filled index"
        );
        Ok(added)
    }

    /// Fail if two rows whose newest version is live share a key of the
    /// unique index `index_no`.
    pub fn verify_unique(&self, index_no: usize) -> Result<()> {
        let idx = &self.def.indexes[index_no];
        let mut seen: HashSet<Vec<u8>> = HashSet::new();
        for rid in self.heap.scan() {
            let rid = rid?;
            let head = match self.heap.read_head(rid)? {
                Some((_, head)) => head,
                None => continue,
            };
            if head.xmin == POISON_TXID || head.xmax != INVALID_TXID {
                continue;
            }
            if idx.columns.iter().any(|&c| head.tuple.get(c).map_or(true, Value::is_null)) {
                continue;
            }
            if !seen.insert(self.key_prefix(index_no, &head.tuple)) {
                return Err(self.unique_error(idx, &head.tuple));
            }
        }
        Ok(())
    }

    fn unique_error(&self, idx: &IndexDef, tuple: &Tuple) -> Error {
        let values: Vec<String> = idx
            .columns
            .iter()
            .map(|&c| tuple.get(c).map(|v| v.to_string()).unwrap_or_default())
            .collect();
        if idx.primary {
            return Error::DuplicateKey {
                table: self.def.name.clone(),
                key: format!("({})", values.join(", ")),
            };
        }
        let columns: Vec<&str> = idx
            .columns
            .iter()
            .map(|&c| self.def.columns()[c].name.as_str())
            .collect();
        Error::UniqueViolation {
            table: self.def.name.clone(),
            column: columns.join(", "),
            value: values.join(", "),
        }
    }
}

/// What a running transaction carries between statements
#[derive(Debug)]
pub struct TxnState {
    pub txid: TxId,
    pub isolation: IsolationLevel,
    pub snapshot: Snapshot,
    pub undo: UndoLog,
    /// Every lock resource granted to the transaction
    pub held: HashSet<LockResource>,
    pub cancel: CancelToken,
}

impl TxnState {
    pub fn new(txid: TxId, isolation: IsolationLevel, snapshot: Snapshot, cancel: CancelToken) -> Self {
        Self {
            txid,
            isolation,
            snapshot,
            undo: UndoLog::new(),
            held: HashSet::new(),
            cancel,
        }
    }
}

/// Everything an operator needs to touch rows on behalf of a transaction
pub struct ExecContext<'a> {
    pub locks: &'a LockManager,
    pub txns: &'a TransactionManager,
    pub lock_timeout: Duration,
    pub sort_spill_bytes: usize,
    /// Share-lock rows as they are read
    pub lock_reads: bool,
    pub tx: &'a mut TxnState,
}

impl<'a> ExecContext<'a> {
    pub fn txid(&self) -> TxId {
        self.tx.txid
    }

    pub fn check_cancelled(&self) -> Result<()> {
        self.tx.cancel.check()
    }

    /// Acquire `mode` on `resource`, held until the transaction ends.
    pub fn lock(&mut self, resource: LockResource, mode: LockMode) -> Result<()> {
        self.check_cancelled()?;
        self.locks
            .acquire(self.tx.txid, &resource, mode, self.lock_timeout, &self.tx.cancel)?;
        self.tx.held.insert(resource);
        Ok(())
    }

    /// Block until no other transaction holds `resource` exclusively. The
    /// lock is kept only if the transaction held it already.
    fn wait_for(&mut self, resource: LockResource) -> Result<()> {
        self.check_cancelled()?;
        let fresh = self.locks.acquire(
            self.tx.txid,
            &resource,
            LockMode::Shared,
            self.lock_timeout,
            &self.tx.cancel,
        )?;
        if fresh && !self.tx.held.contains(&resource) {
            self.locks.release_all(self.tx.txid, [&resource]);
        }
        Ok(())
    }

    /// Table lock for a statement that only reads `table_id`. Serializable
    /// transactions share-lock the whole table so no writer can slip a row
    /// into a range they scanned.
    pub fn lock_table_for_read(&mut self, table_id: u32) -> Result<()> {
        let mode = if self.tx.isolation == IsolationLevel::Serializable {
            LockMode::Shared
        } else {
            LockMode::IntentionShared
        };
        self.lock(LockResource::Table(table_id), mode)
    }

    pub fn lock_table_for_write(&mut self, table_id: u32) -> Result<()> {
        if self.tx.isolation == IsolationLevel::Serializable {
            self.lock(LockResource::Table(table_id), LockMode::Shared)?;
        }
        self.lock(LockResource::Table(table_id), LockMode::IntentionExclusive)
    }

    fn begin_write(&mut self) -> Result<()> {
        self.txns.register_writer(self.tx.txid)
    }

    // ---------------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------------

    /// The tuple of the row at `rid` this transaction sees, share-locking it
    /// when the isolation level asks for it.
    pub fn fetch_visible(&mut self, store: &TableStore, rid: RowId) -> Result<Option<Tuple>> {
        let version = match store.read_visible(rid, &self.tx.snapshot)? {
            Some(version) => version,
            None => return Ok(None),
        };
        if self.lock_reads {
            self.lock(LockResource::Row(store.table_id(), rid), LockMode::Shared)?;
        }
        Ok(Some(version.tuple))
    }

    // ---------------------------------------------------------------------
    // Writes
    // ---------------------------------------------------------------------

    fn write_check(&self, head: &RowVersion) -> WriteCheckResult {
        if self.tx.isolation.per_statement_snapshot() {
            self.tx.snapshot.check_write_latest(head)
        } else {
            self.tx.snapshot.check_write(head)
        }
    }

    fn conflict(&self, store: &TableStore, rid: RowId) -> Error {
        Error::SerializationFailure(format!("row {} of table '{}'", rid, store.def.name))
    }

    fn check_not_null(&self, store: &TableStore, tuple: &Tuple) -> Result<()> {
        for (i, col) in store.def.columns().iter().enumerate() {
            if !col.nullable && tuple.get(i).map_or(true, Value::is_null) {
                return Err(Error::NotNullViolation {
                    table: store.def.name.clone(),
                    column: col.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Enforce unique index `index_no` for `tuple`, about to be stored at
    /// `own` (or inserted when `None`). The key lock serializes writers of
    /// the same value; rows another transaction is still changing are
    /// waited for through their row lock.
    fn check_unique(&mut self, store: &TableStore, index_no: usize, tuple: &Tuple, own: Option<RowId>) -> Result<()> {
        let idx = &store.def.indexes[index_no];
        if idx.columns.iter().any(|&c| tuple.get(c).map_or(true, Value::is_null)) {
            return Ok(());
        }
        let prefix = store.key_prefix(index_no, tuple);
        self.lock(
            LockResource::Key(store.table_id(), idx.name.clone(), prefix.clone()),
            LockMode::Exclusive,
        )?;

        let hi = match codec::prefix_successor(&prefix) {
            Some(succ) => Bound::Excluded(succ),
            None => Bound::Unbounded,
        };
        let mut candidates = Vec::new();
        for entry in store.indexes[index_no].range(Bound::Included(prefix.clone()), hi, Direction::Forward) {
            let (_, value) = entry?;
            match RowId::from_bytes(&value) {
                Some(rid) if Some(rid) != own && !candidates.contains(&rid) => candidates.push(rid),
                Some(_) => {}
                None => {
                    return Err(Error::InternalInvariant(format!(
                        "malformed entry in index '{}'",
                        idx.name
                    )))
                }
            }
        }

        let status = Arc::clone(self.txns.status());
        for rid in candidates {
            let mut waited = false;
            loop {
                let head = match store.heap.read_head(rid)? {
                    Some((_, head)) => head,
                    None => break,
                };
                if store.key_prefix(index_no, &head.tuple) != prefix {
                    break;
                }
                let in_flight = |t: TxId| t != self.tx.txid && t != INVALID_TXID && self.txns.is_active(t);
                if !waited && (in_flight(head.xmin) || in_flight(head.xmax)) {
                    trace!(txid = self.tx.txid, %rid, "waiting for writer of a conflicting key");
                    self.wait_for(LockResource::Row(store.table_id(), rid))?;
                    waited = true;
                    continue;
                }
                let inserted = head.xmin != POISON_TXID && !status.is_aborted(head.xmin);
                let deleted = head.xmax != INVALID_TXID && !status.is_aborted(head.xmax);
                if inserted && !deleted {
                    return Err(store.unique_error(idx, tuple));
                }
                break;
            }
        }
        Ok(())
    }

    fn add_index_entries(&mut self, store: &TableStore, tuple: &Tuple, rid: RowId) -> Result<()> {
        for (i, tree) in store.indexes.iter().enumerate() {
            let key = store.index_key(i, tuple, rid);
            if tree.insert_if_absent(&key, &rid.to_bytes())? {
                self.tx.undo.push(UndoRecord::IndexInsert {
                    table_id: store.table_id(),
                    index: store.def.indexes[i].name.clone(),
                    key,
                });
            }
        }
        Ok(())
    }

    /// Insert a full-width row. Hidden row ids are assigned here.
    pub fn insert_row(&mut self, store: &TableStore, mut values: Vec<Value>) -> Result<RowId> {
        self.check_cancelled()?;
        let hidden = store.def.rowid_column();
        if let Some(c) = hidden {
            values[c] = Value::Int64(store.next_rowid());
        }
        let tuple = Tuple::new(values);
        self.check_not_null(store, &tuple)?;
        for (i, idx) in store.def.indexes.iter().enumerate() {
            if idx.unique && !(idx.primary && hidden.is_some()) {
                self.check_unique(store, i, &tuple, None)?;
            }
        }

        self.begin_write()?;
        let version = RowVersion::new(self.tx.txid, tuple);
        let rid = store.heap.insert(self.tx.txid, &version)?;
        self.tx.undo.push(UndoRecord::Poison {
            table_id: store.table_id(),
            rid,
            inserted: version.clone(),
        });
        self.lock(LockResource::Row(store.table_id(), rid), LockMode::Exclusive)?;
        self.add_index_entries(store, &version.tuple, rid)?;
        Ok(rid)
    }

    /// Exclusive-lock the row at `rid` and classify its newest version.
    /// Returns the head when this transaction may write it and it still
    /// satisfies `recheck`.
    fn lock_for_write(
        &mut self,
        store: &TableStore,
        rid: RowId,
        recheck: &dyn Fn(&Tuple) -> Result<bool>,
    ) -> Result<Option<(RowVersion, WriteCheckResult)>> {
        self.check_cancelled()?;
        self.lock(LockResource::Row(store.table_id(), rid), LockMode::Exclusive)?;
        let head = match store.heap.read_head(rid)? {
            Some((_, head)) => head,
            None => return Ok(None),
        };
        let check = self.write_check(&head);
        match check {
            WriteCheckResult::Gone => Ok(None),
            WriteCheckResult::Conflict => Err(self.conflict(store, rid)),
            WriteCheckResult::CanWrite | WriteCheckResult::OwnVersion => {
                if recheck(&head.tuple)? {
                    Ok(Some((head, check)))
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Apply `changes` to the row at `rid`. Returns false when the row
    /// vanished or no longer matches.
    pub fn update_row(
        &mut self,
        store: &TableStore,
        rid: RowId,
        changes: &[(usize, Value)],
        recheck: &dyn Fn(&Tuple) -> Result<bool>,
    ) -> Result<bool> {
        let (head, check) = match self.lock_for_write(store, rid, recheck)? {
            Some(found) => found,
            None => return Ok(false),
        };
        let mut tuple = head.tuple.clone();
        for (column, value) in changes {
            tuple.set(*column, value.clone());
        }
        self.check_not_null(store, &tuple)?;
        for (i, idx) in store.def.indexes.iter().enumerate() {
            if idx.unique && store.key_prefix(i, &tuple) != store.key_prefix(i, &head.tuple) {
                self.check_unique(store, i, &tuple, Some(rid))?;
            }
        }

        self.begin_write()?;
        let txid = self.tx.txid;
        match check {
            WriteCheckResult::OwnVersion => {
                let mut next = head.clone();
                next.tuple = tuple.clone();
                store.heap.write_head(txid, rid, &next)?;
                self.tx.undo.push(UndoRecord::Restore {
                    table_id: store.table_id(),
                    rid,
                    before: head,
                });
            }
            _ => {
                let mut old = head.clone();
                old.xmax = txid;
                store
                    .heap
                    .push_version(txid, rid, &old, RowVersion::new(txid, tuple.clone()))?;
                self.tx.undo.push(UndoRecord::Restore {
                    table_id: store.table_id(),
                    rid,
                    before: head,
                });
            }
        }
        self.add_index_entries(store, &tuple, rid)?;
        Ok(true)
    }

    /// Delete the row at `rid`. Returns false when the row vanished or no
    /// longer matches.
    pub fn delete_row(
        &mut self,
        store: &TableStore,
        rid: RowId,
        recheck: &dyn Fn(&Tuple) -> Result<bool>,
    ) -> Result<bool> {
        let (head, _) = match self.lock_for_write(store, rid, recheck)? {
            Some(found) => found,
            None => return Ok(false),
        };
        self.begin_write()?;
        let mut next = head.clone();
        next.xmax = self.tx.txid;
        store.heap.write_head(self.tx.txid, rid, &next)?;
        self.tx.undo.push(UndoRecord::Restore {
            table_id: store.table_id(),
            rid,
            before: head,
        });
        Ok(true)
    }
}

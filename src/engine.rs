//! Engine handle
//!
//! [`Engine`] owns every shared component of an open database: the disk
//! manager, buffer pool, WAL, catalog, lock manager and transaction table,
//! plus the per-table storage the executor works on. Statements run inside
//! a [`Transaction`]; [`Engine::exec`] and [`Engine::query`] wrap a single
//! statement in its own transaction.
//!
//! Opening a database replays the WAL when it holds records, rebuilds every
//! index from the heap and checkpoints. Dropping the engine stops the
//! background threads and checkpoints again.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::catalog::{Catalog, Column, IndexDef, TableDef, TableStatistics};
use crate::error::{Error, ErrorCategory, ErrorKind, Result};
use crate::executor::{ExecContext, Operator, Planner, TableStore, TxnState};
use crate::sql::ast::{CreateIndexStatement, CreateTableStatement, Statement, TableConstraint};
use crate::sql::parse_statement;
use crate::storage::btree::{BTree, Direction};
use crate::storage::heap::{HeapFile, HeapRecord, RowId, RowVersion, INVALID_TXID, POISON_TXID, SYSTEM_TXID};
use crate::storage::page::PageId;
use crate::storage::recovery::{self, RecoveryStats};
use crate::storage::tuple::{Tuple, Value};
use crate::storage::wal::{TxId, Wal, WalSyncMode};
use crate::storage::{BufferPool, DiskManager, TableId};
use crate::transaction::{
    CancelToken, IsolationLevel, LockManager, LockMode, LockResource, TransactionManager,
    TransactionState, UndoTarget,
};

/// Vacuum gives up on a table whose writers do not finish within this time
const VACUUM_LOCK_TIMEOUT: Duration = Duration::from_millis(50);

/// Longest version chain vacuum and the integrity check will walk
const MAX_CHAIN_LEN: usize = 1 << 20;

/// Engine configuration
#[derive(Debug, Clone, PartialEq)]
pub struct Options {
    pub buffer_pool_pages: usize,
    /// Fixed when the database is created
    pub page_size: usize,
    pub default_isolation: IsolationLevel,
    pub lock_timeout: Duration,
    pub deadlock_check_interval: Duration,
    /// Sorts larger than this spill to temporary files
    pub sort_spill_bytes: usize,
    pub wal_sync_mode: WalSyncMode,
    pub wal_flush_interval: Duration,
    /// `None` disables the vacuum thread
    pub autovacuum_interval: Option<Duration>,
    pub create_if_missing: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            buffer_pool_pages: 256,
            page_size: 8192,
            default_isolation: IsolationLevel::Snapshot,
            lock_timeout: Duration::from_secs(30),
            deadlock_check_interval: Duration::from_secs(1),
            sort_spill_bytes: 4 * 1024 * 1024,
            wal_sync_mode: WalSyncMode::Normal,
            wal_flush_interval: Duration::from_millis(200),
            autovacuum_interval: Some(Duration::from_secs(60)),
            create_if_missing: true,
        }
    }
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_buffer_pool_pages(mut self, pages: usize) -> Self {
        self.buffer_pool_pages = pages;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_default_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.default_isolation = isolation;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_deadlock_check_interval(mut self, interval: Duration) -> Self {
        self.deadlock_check_interval = interval;
        self
    }

    pub fn with_sort_spill_bytes(mut self, bytes: usize) -> Self {
        self.sort_spill_bytes = bytes;
        self
    }

    pub fn with_wal_sync_mode(mut self, mode: WalSyncMode) -> Self {
        self.wal_sync_mode = mode;
        self
    }

    pub fn with_wal_flush_interval(mut self, interval: Duration) -> Self {
        self.wal_flush_interval = interval;
        self
    }

    pub fn with_autovacuum_interval(mut self, interval: Option<Duration>) -> Self {
        self.autovacuum_interval = interval;
        self
    }

    pub fn with_create_if_missing(mut self, create: bool) -> Self {
        self.create_if_missing = create;
        self
    }

    fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two() || !(1024..=32768).contains(&self.page_size) {
            return Err(Error::InvalidArgument(format!(
                "page size {} is not a power of two between 1024 and 32768",
                self.page_size
            )));
        }
        if self.buffer_pool_pages < 8 {
            return Err(Error::InvalidArgument(format!(
                "buffer pool of {} pages is too small (minimum 8)",
                self.buffer_pool_pages
            )));
        }
        for (name, interval) in [
            ("deadlock_check_interval", self.deadlock_check_interval),
            ("wal_flush_interval", self.wal_flush_interval),
        ] {
            if interval.is_zero() {
                return Err(Error::InvalidArgument(format!("{} must be positive", name)));
            }
        }
        Ok(())
    }
}

/// Materialised statement result
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryResult {
    /// Column names
    pub columns: Vec<String>,
    /// Result rows
    pub rows: Vec<Tuple>,
    /// Number of affected rows (for INSERT/UPDATE/DELETE)
    pub affected_rows: u64,
    /// Message (EXPLAIN output, DDL acknowledgements)
    pub message: Option<String>,
}

impl QueryResult {
    pub fn with_rows(columns: Vec<String>, rows: Vec<Tuple>) -> Self {
        Self {
            columns,
            rows,
            ..Default::default()
        }
    }

    pub fn with_message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn with_affected_rows(count: u64) -> Self {
        Self {
            affected_rows: count,
            ..Default::default()
        }
    }
}

/// Result of [`Transaction::exec`]
pub enum ExecResult<'t> {
    /// Rows of a SELECT, produced as the stream is consumed
    Rows(RowStream<'t>),
    /// Rows affected by a write
    Count(u64),
    /// EXPLAIN output
    Plan(String),
}

/// What one VACUUM pass reclaimed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VacuumStats {
    pub tables: usize,
    /// Tables skipped because writers held them
    pub skipped: usize,
    pub rows_removed: usize,
    pub versions_removed: usize,
    pub index_entries_removed: usize,
    pub pages_released: usize,
}

/// Findings of [`Engine::check_integrity`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    pub tables_checked: usize,
    pub pages_checked: usize,
    pub corrupt_pages: Vec<(TableId, PageId)>,
    /// Ordering, balance, high-key and leaf-link problems
    pub index_errors: Vec<String>,
    /// Index entries matching no live row version
    pub orphan_entries: Vec<String>,
    /// Live row versions missing from an index
    pub unindexed_rows: Vec<String>,
}

impl IntegrityReport {
    pub fn is_ok(&self) -> bool {
        self.corrupt_pages.is_empty()
            && self.index_errors.is_empty()
            && self.orphan_entries.is_empty()
            && self.unindexed_rows.is_empty()
    }
}

/// Stop signal for the background threads
#[derive(Default)]
struct Shutdown {
    stopped: Mutex<bool>,
    cv: Condvar,
}

impl Shutdown {
    /// Sleep up to `timeout`; true once shutdown was requested.
    fn wait(&self, timeout: Duration) -> bool {
        let mut stopped = self.stopped.lock();
        if !*stopped {
            self.cv.wait_for(&mut stopped, timeout);
        }
        *stopped
    }

    fn stop(&self) {
        *self.stopped.lock() = true;
        self.cv.notify_all();
    }
}

/// Shared state behind [`Engine`] and every [`Transaction`]
pub(crate) struct EngineInner {
    options: Options,
    dir: PathBuf,
    disk: Arc<DiskManager>,
    pool: Arc<BufferPool>,
    wal: Arc<Wal>,
    catalog: Catalog,
    stores: RwLock<HashMap<TableId, Arc<TableStore>>>,
    locks: LockManager,
    txns: TransactionManager,
    /// Set by the first internal invariant failure
    read_only: Mutex<Option<Error>>,
    /// Serializes DDL
    ddl: Mutex<()>,
    /// Serializes vacuum, checkpoint and the integrity check
    maintenance: Mutex<()>,
}

impl UndoTarget for EngineInner {
    fn heap(&self, table_id: TableId) -> Result<Arc<HeapFile>> {
        Ok(Arc::clone(&self.store(table_id)?.heap))
    }

    fn index(&self, table_id: TableId, name: &str) -> Result<Option<Arc<BTree>>> {
        let store = self.store(table_id)?;
        Ok(store.index_position(name).map(|i| Arc::clone(&store.indexes[i])))
    }
}

impl EngineInner {
    fn store(&self, table_id: TableId) -> Result<Arc<TableStore>> {
        self.stores
            .read()
            .get(&table_id)
            .cloned()
            .ok_or_else(|| Error::NoSuchTable(format!("#{}", table_id)))
    }

    fn check_latch(&self) -> Result<()> {
        match &*self.read_only.lock() {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn latch(&self, err: &Error) {
        let mut read_only = self.read_only.lock();
        if read_only.is_none() {
            error!(error = %err, "internal invariant violated, engine is now read-only");
            *read_only = Some(err.clone());
        }
    }

    fn context<'a>(&'a self, state: &'a mut TxnState, lock_reads: bool) -> ExecContext<'a> {
        ExecContext {
            locks: &self.locks,
            txns: &self.txns,
            lock_timeout: self.options.lock_timeout,
            sort_spill_bytes: self.options.sort_spill_bytes,
            lock_reads,
            tx: state,
        }
    }

    fn planner(&self) -> Planner<'_> {
        Planner::new(&self.catalog).with_sort_spill_bytes(self.options.sort_spill_bytes)
    }

    /// Run `f` as a short internal transaction that only takes locks.
    fn with_system_txn<R>(&self, f: impl FnOnce(&mut ExecContext<'_>) -> Result<R>) -> Result<R> {
        let (txid, snapshot) = self.txns.begin();
        let mut state = TxnState::new(txid, IsolationLevel::Snapshot, snapshot, CancelToken::new());
        let result = {
            let mut cx = self.context(&mut state, false);
            f(&mut cx)
        };
        let ended = self.txns.commit(txid);
        self.locks.release_all(txid, state.held.iter());
        let value = result?;
        ended?;
        Ok(value)
    }

    /// Exclusive-lock a table by name for DDL and return its current
    /// definition.
    fn lock_table_exclusive(&self, cx: &mut ExecContext<'_>, name: &str) -> Result<Arc<TableDef>> {
        let def = self.catalog.get_table(name)?;
        cx.lock(LockResource::Table(def.id), LockMode::Exclusive)?;
        let current = self.catalog.get_table(name)?;
        if current.id != def.id {
            return Err(Error::NoSuchTable(name.to_string()));
        }
        Ok(current)
    }

    // ---------------------------------------------------------------------
    // DDL
    // ---------------------------------------------------------------------

    fn create_table(&self, def: TableDef) -> Result<Arc<TableDef>> {
        self.check_latch()?;
        let _ddl = self.ddl.lock();
        let def = self.catalog.create_table(def)?;
        match self.create_table_storage(&def) {
            Ok(def) => {
                info!(table = %def.name, table_id = def.id, "created table");
                Ok(def)
            }
            Err(e) => {
                self.stores.write().remove(&def.id);
                if let Err(cleanup) = self.catalog.drop_table(&def.name) {
                    warn!(table = %def.name, error = %cleanup, "could not undo catalog entry");
                }
                self.pool.discard_table(def.id);
                if let Err(cleanup) = self.disk.remove_table_file(def.id) {
                    warn!(table = %def.name, error = %cleanup, "could not remove table file");
                }
                Err(e)
            }
        }
    }

    fn create_table_storage(&self, def: &Arc<TableDef>) -> Result<Arc<TableDef>> {
        self.disk.create_table_file(def.id)?;
        let heap = Arc::new(HeapFile::new(def.id, Arc::clone(&self.pool), Arc::clone(&self.wal)));
        let (def, trees) = self.create_index_trees(def)?;
        let store = TableStore::new(Arc::clone(&def), heap, trees)?;
        self.stores.write().insert(def.id, Arc::new(store));
        // index pages are not logged
        self.pool.flush_all(Some(def.id))?;
        Ok(def)
    }

    /// Allocate an empty tree for every index of `def` and record the roots.
    fn create_index_trees(&self, def: &Arc<TableDef>) -> Result<(Arc<TableDef>, Vec<Arc<BTree>>)> {
        let trees = def
            .indexes
            .iter()
            .map(|idx| BTree::create(Arc::clone(&self.pool), def.id, idx.name.clone()).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        let roots: Vec<(String, PageId)> = trees
            .iter()
            .map(|t| (t.name().to_string(), t.root_page_id()))
            .collect();
        let def = self.catalog.set_index_roots(&def.name, &roots)?;
        let primary_root = trees[0].root_page_id();
        self.disk
            .update_meta(def.id, |meta| meta.root_page_id = primary_root)?;
        Ok((def, trees))
    }

    fn create_index(&self, stmt: &CreateIndexStatement) -> Result<bool> {
        self.check_latch()?;
        let _ddl = self.ddl.lock();
        if self.catalog.index_exists(&stmt.name) {
            if stmt.if_not_exists {
                return Ok(false);
            }
            return Err(Error::DuplicateIndex(stmt.name.clone()));
        }
        self.with_system_txn(|cx| {
            let def = self.lock_table_exclusive(cx, &stmt.table)?;
            if stmt.columns.is_empty() {
                return Err(Error::InvalidArgument(format!(
                    "index '{}' needs at least one column",
                    stmt.name
                )));
            }
            let mut columns = Vec::with_capacity(stmt.columns.len());
            for name in &stmt.columns {
                let column = def.column_index(name)?;
                if columns.contains(&column) {
                    return Err(Error::InvalidArgument(format!(
                        "column '{}' appears twice in index '{}'",
                        name, stmt.name
                    )));
                }
                columns.push(column);
            }
            let store = self.store(def.id)?;
            let tree = Arc::new(BTree::create(Arc::clone(&self.pool), def.id, stmt.name.clone())?);
            let mut index = IndexDef::new(stmt.name.clone(), columns).unique(stmt.unique);
            index.root_page_id = tree.root_page_id();

            let built = self.build_index(&store, &def, &index, &tree);
            let def = match built.and_then(|_| self.catalog.add_index(&def.name, index)) {
                Ok(def) => def,
                Err(e) => {
                    if let Err(cleanup) = tree.destroy() {
                        warn!(index = %stmt.name, error = %cleanup, "could not free index pages");
                    }
                    return Err(e);
                }
            };
            let store = Arc::new(store.with_index(Arc::clone(&def), tree));
            self.stores.write().insert(def.id, store);
            self.pool.flush_all(Some(def.id))?;
            info!(index = %stmt.name, table = %def.name, "created index");
            Ok(true)
        })
    }

    /// Fill `tree` from the heap and enforce uniqueness before the index is
    /// published.
    fn build_index(&self, store: &TableStore, def: &TableDef, index: &IndexDef, tree: &Arc<BTree>) -> Result<()> {
        let mut candidate = def.clone();
        candidate.indexes.push(index.clone());
        let staged = store.with_index(Arc::new(candidate), Arc::clone(tree));
        let position = staged.indexes.len() - 1;
        staged.fill_index(position)?;
        if index.unique {
            staged.verify_unique(position)?;
        }
        Ok(())
    }

    fn drop_table(&self, name: &str, if_exists: bool) -> Result<bool> {
        self.check_latch()?;
        let _ddl = self.ddl.lock();
        if !self.catalog.table_exists(name) && if_exists {
            return Ok(false);
        }
        self.with_system_txn(|cx| {
            let def = self.lock_table_exclusive(cx, name)?;
            self.catalog.drop_table(&def.name)?;
            self.stores.write().remove(&def.id);
            self.pool.discard_table(def.id);
            self.disk.remove_table_file(def.id)?;
            info!(table = %def.name, table_id = def.id, "dropped table");
            Ok(true)
        })
    }

    fn drop_index(&self, name: &str, if_exists: bool) -> Result<bool> {
        self.check_latch()?;
        let _ddl = self.ddl.lock();
        let table = match self
            .catalog
            .list_indexes()
            .into_iter()
            .find(|(_, idx)| idx.name.eq_ignore_ascii_case(name))
        {
            Some((table, _)) => table,
            None if if_exists => return Ok(false),
            None => return Err(Error::NoSuchIndex(name.to_string())),
        };
        self.with_system_txn(|cx| {
            self.lock_table_exclusive(cx, &table)?;
            let (before, index) = self.catalog.drop_index(name)?;
            let def = self.catalog.get_table(&before.name)?;
            let store = self.store(def.id)?;
            let (store, tree) = store.without_index(Arc::clone(&def), &index.name)?;
            self.stores.write().insert(def.id, Arc::new(store));
            tree.destroy()?;
            self.pool.flush_all(Some(def.id))?;
            info!(index = %index.name, table = %def.name, "dropped index");
            Ok(true)
        })
    }

    // ---------------------------------------------------------------------
    // Maintenance
    // ---------------------------------------------------------------------

    fn tables_named(&self, table: Option<&str>) -> Result<Vec<Arc<TableDef>>> {
        match table {
            Some(name) => Ok(vec![self.catalog.get_table(name)?]),
            None => Ok(self.catalog.tables()),
        }
    }

    fn vacuum(&self, table: Option<&str>) -> Result<VacuumStats> {
        self.check_latch()?;
        let _maintenance = self.maintenance.lock();
        let mut stats = VacuumStats::default();
        for def in self.tables_named(table)? {
            let vacuumed = self.with_system_txn(|cx| {
                let resource = LockResource::Table(def.id);
                match cx.locks.acquire(
                    cx.tx.txid,
                    &resource,
                    LockMode::Shared,
                    VACUUM_LOCK_TIMEOUT,
                    &cx.tx.cancel,
                ) {
                    Ok(_) => {
                        cx.tx.held.insert(resource);
                    }
                    Err(Error::LockTimeout(_)) => return Ok(false),
                    Err(e) => return Err(e),
                }
                let store = match self.store(def.id) {
                    Ok(store) => store,
                    // dropped meanwhile
                    Err(_) => return Ok(false),
                };
                let horizon = self.txns.vacuum_horizon();
                self.vacuum_table(&store, horizon, &mut stats)?;
                Ok(true)
            });
            match vacuumed {
                Ok(true) => stats.tables += 1,
                Ok(false) => {
                    debug!(table = %def.name, "vacuum skipped busy table");
                    stats.skipped += 1;
                }
                Err(e) => {
                    if e.kind() == ErrorKind::InternalInvariant {
                        self.latch(&e);
                    }
                    return Err(e);
                }
            }
        }
        let pruned = self.txns.status().prune(self.txns.vacuum_horizon());
        debug!(?stats, pruned, "vacuum finished");
        Ok(stats)
    }

    /// Remove dead rows and versions no snapshot can see any more, then the
    /// index entries that pointed at them. Runs under a table share lock, so
    /// no writer is active on the table.
    fn vacuum_table(&self, store: &TableStore, horizon: TxId, stats: &mut VacuumStats) -> Result<()> {
        let heap = &store.heap;
        let mut touched: BTreeSet<PageId> = BTreeSet::new();
        // slots still linked from a live anchor
        let mut reachable: HashSet<RowId> = HashSet::new();
        for page_id in 1..heap.page_count()? {
            let anchors = match heap.anchors_on(page_id)? {
                Some(anchors) => anchors,
                None => continue,
            };
            for rid in anchors {
                reachable.insert(rid);
                let chain = version_chain(heap, rid)?;
                let head = match chain.first() {
                    Some((_, head)) => head,
                    None => continue,
                };
                let deleted = head.xmax != INVALID_TXID && head.xmax != POISON_TXID && head.xmax < horizon;
                if head.xmin == POISON_TXID || deleted {
                    for (at, _) in &chain[1..] {
                        heap.remove_slot(SYSTEM_TXID, *at)?;
                        touched.insert(at.page_id);
                    }
                    touched.insert(chain[0].0.page_id);
                    heap.remove_anchor(SYSTEM_TXID, rid)?;
                    touched.insert(rid.page_id);
                    stats.rows_removed += 1;
                    stats.versions_removed += chain.len();
                    continue;
                }
                // every snapshot sees this version or a newer one
                let keep = match chain
                    .iter()
                    .position(|(_, v)| v.xmin != POISON_TXID && v.xmin < horizon)
                {
                    Some(keep) if keep + 1 < chain.len() => keep,
                    _ => {
                        reachable.extend(chain.iter().map(|(at, _)| *at));
                        continue;
                    }
                };
                reachable.extend(chain[..=keep].iter().map(|(at, _)| *at));
                let (at, version) = &chain[keep];
                let mut cut = version.clone();
                cut.next = None;
                if keep == 0 {
                    heap.write_head(SYSTEM_TXID, rid, &cut)?;
                } else {
                    heap.restore_image(SYSTEM_TXID, *at, Some(&cut.encode(0)))?;
                }
                for (at, _) in &chain[keep + 1..] {
                    heap.remove_slot(SYSTEM_TXID, *at)?;
                    touched.insert(at.page_id);
                }
                stats.versions_removed += chain.len() - keep - 1;
            }
        }

        // Copies unlinked by a rollback. Once their xmax is below the
        // horizon no reader can still hold a link to them.
        for page_id in 1..heap.page_count()? {
            let records = match heap.records_on(page_id)? {
                Some(records) => records,
                None => continue,
            };
            for (at, record) in records {
                let orphan = match &record {
                    HeapRecord::Version { flags: 0, version } => {
                        !reachable.contains(&at)
                            && version.xmax != INVALID_TXID
                            && version.xmax != POISON_TXID
                            && version.xmax < horizon
                    }
                    _ => false,
                };
                if orphan {
                    heap.remove_slot(SYSTEM_TXID, at)?;
                    touched.insert(page_id);
                    stats.versions_removed += 1;
                }
            }
        }

        for (i, tree) in store.indexes.iter().enumerate() {
            let mut stale = Vec::new();
            for entry in tree.range(Bound::Unbounded, Bound::Unbounded, Direction::Forward) {
                let (key, value) = entry?;
                let matched = match RowId::from_bytes(&value) {
                    Some(rid) => store
                        .live_versions(rid)?
                        .iter()
                        .any(|v| store.index_key(i, &v.tuple, rid) == key),
                    None => false,
                };
                if !matched {
                    stale.push(key);
                }
            }
            for key in stale {
                if tree.delete(&key)? {
                    stats.index_entries_removed += 1;
                }
            }
        }

        for page_id in touched {
            if heap.release_if_empty(page_id)? {
                stats.pages_released += 1;
            } else {
                heap.note_free_space(page_id);
            }
        }
        Ok(())
    }

    fn analyze(&self, table: Option<&str>) -> Result<usize> {
        self.check_latch()?;
        let mut analyzed = 0;
        for def in self.tables_named(table)? {
            let stats = self.with_system_txn(|cx| {
                cx.lock_table_for_read(def.id)?;
                let store = self.store(def.id)?;
                let width = store.def.columns().len();
                let mut distinct: Vec<HashSet<Value>> = vec![HashSet::new(); width];
                let mut rows = 0u64;
                let mut bytes = 0u64;
                for rid in store.heap.scan() {
                    let rid = rid?;
                    let version = match store.read_visible(rid, &cx.tx.snapshot)? {
                        Some(version) => version,
                        None => continue,
                    };
                    rows += 1;
                    bytes += version.tuple.to_bytes().len() as u64;
                    for (seen, value) in distinct.iter_mut().zip(version.tuple.values()) {
                        if !value.is_null() {
                            seen.insert(value.clone());
                        }
                    }
                }
                Ok(TableStatistics {
                    row_count: rows,
                    avg_row_bytes: if rows == 0 { 0 } else { bytes / rows },
                    distinct: distinct.iter().map(|s| s.len() as u64).collect(),
                })
            })?;
            debug!(table = %def.name, rows = stats.row_count, "analyzed table");
            self.catalog.update_table_stats(&def.name, stats)?;
            analyzed += 1;
        }
        Ok(analyzed)
    }

    fn check_integrity(&self) -> Result<IntegrityReport> {
        self.check_latch()?;
        let _maintenance = self.maintenance.lock();
        let mut report = IntegrityReport::default();
        for def in self.catalog.tables() {
            self.with_system_txn(|cx| {
                cx.lock(LockResource::Table(def.id), LockMode::Shared)?;
                let store = self.store(def.id)?;
                self.pool.flush_all(Some(def.id))?;
                let mut corrupt = false;
                for page_id in 0..self.disk.page_count(def.id)? {
                    report.pages_checked += 1;
                    match self.disk.read_page(def.id, page_id) {
                        Ok(_) => {}
                        Err(Error::CorruptPage { table_id, page_id }) => {
                            warn!(table_id, page_id, "page failed CRC check");
                            report.corrupt_pages.push((table_id, page_id));
                            corrupt = true;
                        }
                        Err(e) => return Err(e),
                    }
                }
                if !corrupt {
                    check_table_indexes(&store, &mut report)?;
                }
                report.tables_checked += 1;
                Ok(())
            })?;
        }
        if !report.is_ok() {
            warn!(?report, "integrity check found problems");
        }
        Ok(report)
    }

    /// Write back every dirty page, stamp the metadata pages and, when no
    /// transaction is writing, empty the WAL.
    fn checkpoint(&self) -> Result<bool> {
        self.wal.flush_to(self.wal.last_lsn())?;
        let truncated = self.txns.quiesce(|writers| -> Result<bool> {
            let written = self.pool.flush_all(None)?;
            let last_lsn = self.wal.last_lsn();
            let last_txid = self.txns.next_txid().saturating_sub(1);
            for table_id in self.disk.open_tables() {
                self.disk.update_meta(table_id, |meta| {
                    meta.last_lsn = last_lsn;
                    meta.last_txid = last_txid;
                })?;
            }
            self.disk.sync_all()?;
            if !writers {
                self.wal.truncate()?;
            }
            debug!(pages = written, last_lsn, truncated = !writers, "checkpoint");
            Ok(!writers)
        })?;
        Ok(truncated)
    }
}

/// Physical location and contents of every version of a row, newest first
fn version_chain(heap: &HeapFile, rid: RowId) -> Result<Vec<(RowId, RowVersion)>> {
    let mut chain = Vec::new();
    let (at, head) = match heap.read_head(rid)? {
        Some(found) => found,
        None => return Ok(chain),
    };
    let mut next = head.next;
    chain.push((at, head));
    while let Some(at) = next {
        if chain.len() > MAX_CHAIN_LEN {
            return Err(Error::InternalInvariant(format!(
                "version chain cycle at {} in table {}",
                rid,
                heap.table_id()
            )));
        }
        match heap.fetch_record(at)? {
            Some(HeapRecord::Version { version, .. }) => {
                next = version.next;
                chain.push((at, version));
            }
            _ => break,
        }
    }
    Ok(chain)
}

fn check_table_indexes(store: &TableStore, report: &mut IntegrityReport) -> Result<()> {
    for (i, tree) in store.indexes.iter().enumerate() {
        let check = tree.check()?;
        report
            .index_errors
            .extend(check.errors.iter().map(|e| format!("{}: {}", tree.name(), e)));
        for entry in tree.range(Bound::Unbounded, Bound::Unbounded, Direction::Forward) {
            let (key, value) = entry?;
            let rid = match RowId::from_bytes(&value) {
                Some(rid) => rid,
                None => {
                    report
                        .orphan_entries
                        .push(format!("{}: malformed row id", tree.name()));
                    continue;
                }
            };
            let matched = store
                .live_versions(rid)?
                .iter()
                .any(|v| store.index_key(i, &v.tuple, rid) == key);
            if !matched {
                report
                    .orphan_entries
                    .push(format!("{}: entry for row {} matches no version", tree.name(), rid));
            }
        }
    }
    for rid in store.heap.scan() {
        let rid = rid?;
        for version in store.live_versions(rid)? {
            for (i, tree) in store.indexes.iter().enumerate() {
                if tree.get(&store.index_key(i, &version.tuple, rid))?.is_none() {
                    report.unindexed_rows.push(format!(
                        "{}: row {} of table '{}' has no entry",
                        tree.name(),
                        rid,
                        store.def.name
                    ));
                }
            }
        }
    }
    Ok(())
}

/// Build a table description from CREATE TABLE.
fn table_def(stmt: &CreateTableStatement) -> Result<TableDef> {
    let mut columns = Vec::with_capacity(stmt.columns.len());
    let mut primary_key: Vec<String> = Vec::new();
    let mut unique_sets = Vec::new();
    for c in &stmt.columns {
        let mut column = Column::new(&c.name, c.data_type)
            .nullable(!c.not_null)
            .unique(c.unique);
        if let Some(default) = &c.default {
            column = column.default(default.bind(c.data_type)?);
        }
        if c.primary_key {
            primary_key.push(c.name.clone());
        }
        columns.push(column);
    }
    if primary_key.len() > 1 {
        return Err(Error::InvalidArgument(format!(
            "table '{}' declares PRIMARY KEY on more than one column; use PRIMARY KEY (a, b)",
            stmt.name
        )));
    }
    for constraint in &stmt.constraints {
        match constraint {
            TableConstraint::PrimaryKey(cols) => {
                if !primary_key.is_empty() {
                    return Err(Error::InvalidArgument(format!(
                        "table '{}' has more than one primary key",
                        stmt.name
                    )));
                }
                primary_key = cols.clone();
            }
            TableConstraint::Unique(cols) => unique_sets.push(cols.clone()),
        }
    }
    TableDef::new(stmt.name.clone(), columns, &primary_key, &unique_sets)
}

fn spawn_worker(
    name: &str,
    interval: Duration,
    shutdown: Arc<Shutdown>,
    inner: Weak<EngineInner>,
    task: fn(&EngineInner),
) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("emberdb-{}", name))
        .spawn(move || loop {
            if shutdown.wait(interval) {
                break;
            }
            match inner.upgrade() {
                Some(inner) => task(&inner),
                None => break,
            }
        })
        .map_err(Error::from)
}

fn detect_deadlocks(inner: &EngineInner) {
    let victims = inner.locks.detect_deadlocks();
    if !victims.is_empty() {
        debug!(?victims, "deadlock victims chosen");
    }
}

fn flush_wal(inner: &EngineInner) {
    if let Err(e) = inner.wal.background_flush() {
        warn!(error = %e, "background WAL flush failed");
    }
}

fn autovacuum(inner: &EngineInner) {
    if inner.check_latch().is_err() {
        return;
    }
    if let Err(e) = inner.vacuum(None) {
        warn!(error = %e, "autovacuum failed");
    }
}

/// An open database
pub struct Engine {
    inner: Arc<EngineInner>,
    shutdown: Arc<Shutdown>,
    workers: Vec<JoinHandle<()>>,
    crashed: AtomicBool,
}

impl Engine {
    /// Open the database in `path`, creating it when allowed, and recover
    /// it if the WAL holds records.
    pub fn open(path: impl AsRef<Path>, options: Options) -> Result<Engine> {
        options.validate()?;
        let dir = path.as_ref().to_path_buf();
        if !dir.exists() {
            if !options.create_if_missing {
                return Err(Error::InvalidArgument(format!(
                    "database directory '{}' does not exist",
                    dir.display()
                )));
            }
            fs::create_dir_all(&dir)?;
        }
        let catalog = Catalog::open(&dir)?;
        let tables = catalog.tables();

        let mut page_size = options.page_size;
        let probe = DiskManager::new(&dir, page_size);
        for def in &tables {
            if let Some(on_disk) = DiskManager::probe_page_size(&probe.table_path(def.id))? {
                if on_disk != page_size {
                    warn!(requested = page_size, on_disk, "using the page size the database was created with");
                    page_size = on_disk;
                }
                break;
            }
        }
        let disk = Arc::new(DiskManager::new(&dir, page_size));

        let (wal, records) = Wal::open(&dir, options.wal_sync_mode)?;
        let wal = Arc::new(wal);
        let mut last_lsn = 0;
        let mut last_txid = 0;
        let mut missing = HashSet::new();
        for def in &tables {
            let meta = if disk.table_path(def.id).exists() {
                disk.open_table_file(def.id)?
            } else {
                warn!(table = %def.name, "table file missing, recreating it empty");
                missing.insert(def.id);
                disk.create_table_file(def.id)?
            };
            last_lsn = last_lsn.max(meta.last_lsn);
            last_txid = last_txid.max(meta.last_txid);
        }
        wal.advance_lsn(last_lsn);

        let pool = BufferPool::new(options.buffer_pool_pages, Arc::clone(&disk), Some(Arc::clone(&wal)));
        let heaps: HashMap<TableId, Arc<HeapFile>> = tables
            .iter()
            .map(|def| {
                let heap = HeapFile::new(def.id, Arc::clone(&pool), Arc::clone(&wal));
                (def.id, Arc::new(heap))
            })
            .collect();
        let recovered = !records.is_empty();
        let stats = if recovered {
            info!(records = records.len(), "recovering from write-ahead log");
            recovery::replay(&pool, &wal, &heaps, &records)?
        } else {
            RecoveryStats::default()
        };

        let inner = Arc::new(EngineInner {
            txns: TransactionManager::new(Arc::clone(&wal), last_txid.max(stats.max_txid) + 1),
            options,
            dir,
            disk,
            pool,
            wal,
            catalog,
            stores: RwLock::new(HashMap::new()),
            locks: LockManager::new(),
            read_only: Mutex::new(None),
            ddl: Mutex::new(()),
            maintenance: Mutex::new(()),
        });

        for def in &tables {
            let heap = heaps
                .get(&def.id)
                .cloned()
                .ok_or_else(|| Error::InternalInvariant(format!("no heap for table {}", def.id)))?;
            let store = if recovered || missing.contains(&def.id) {
                recovery::reclaim_index_pages(&inner.pool, def.id)?;
                let (def, trees) = inner.create_index_trees(def)?;
                let store = TableStore::new(def, heap, trees)?;
                for i in 0..store.indexes.len() {
                    store.fill_index(i)?;
                }
                store.reseed_rowid()?;
                store
            } else {
                let trees = def
                    .indexes
                    .iter()
                    .map(|idx| {
                        Arc::new(BTree::open(
                            Arc::clone(&inner.pool),
                            def.id,
                            idx.root_page_id,
                            idx.name.clone(),
                        ))
                    })
                    .collect();
                TableStore::new(Arc::clone(def), heap, trees)?
            };
            inner.stores.write().insert(def.id, Arc::new(store));
        }
        inner.checkpoint()?;
        info!(
            dir = %inner.dir.display(),
            tables = tables.len(),
            recovered,
            losers = stats.losers.len(),
            "opened database"
        );

        let shutdown = Arc::new(Shutdown::default());
        let mut workers = vec![
            spawn_worker(
                "deadlock",
                inner.options.deadlock_check_interval,
                Arc::clone(&shutdown),
                Arc::downgrade(&inner),
                detect_deadlocks,
            )?,
            spawn_worker(
                "wal-flush",
                inner.options.wal_flush_interval,
                Arc::clone(&shutdown),
                Arc::downgrade(&inner),
                flush_wal,
            )?,
        ];
        if let Some(interval) = inner.options.autovacuum_interval {
            workers.push(spawn_worker(
                "autovacuum",
                interval,
                Arc::clone(&shutdown),
                Arc::downgrade(&inner),
                autovacuum,
            )?);
        }
        Ok(Engine {
            inner,
            shutdown,
            workers,
            crashed: AtomicBool::new(false),
        })
    }

    pub fn options(&self) -> &Options {
        &self.inner.options
    }

    pub fn catalog(&self) -> &Catalog {
        &self.inner.catalog
    }

    /// The error that made the engine read-only, if any
    pub fn read_only_error(&self) -> Option<Error> {
        self.inner.read_only.lock().clone()
    }

    pub fn begin(&self, isolation: IsolationLevel) -> Result<Transaction> {
        self.inner.check_latch()?;
        let (txid, snapshot) = self.inner.txns.begin();
        Ok(Transaction {
            engine: Arc::clone(&self.inner),
            state: TxnState::new(txid, isolation, snapshot, CancelToken::new()),
            status: TransactionState::Active,
        })
    }

    /// Run one statement in its own transaction and return the number of
    /// rows it affected or returned.
    pub fn exec(&self, sql: &str) -> Result<u64> {
        let result = self.query(sql)?;
        Ok(if result.columns.is_empty() {
            result.affected_rows
        } else {
            result.rows.len() as u64
        })
    }

    /// Run one statement in its own transaction and materialise its result.
    pub fn query(&self, sql: &str) -> Result<QueryResult> {
        self.inner.check_latch()?;
        let stmt = parse_statement(sql)?;
        self.query_statement(stmt)
    }

    pub fn query_statement(&self, stmt: Statement) -> Result<QueryResult> {
        match stmt {
            Statement::CreateTable(create) => {
                let def = table_def(&create)?;
                match self.create_table(def) {
                    Ok(def) => Ok(QueryResult::with_message(format!("Table '{}' created", def.name))),
                    Err(Error::TableExists(name)) if create.if_not_exists => {
                        Ok(QueryResult::with_message(format!("Table '{}' already exists", name)))
                    }
                    Err(e) => Err(e),
                }
            }
            Statement::CreateIndex(create) => {
                let message = if self.inner.create_index(&create)? {
                    format!("Index '{}' created", create.name)
                } else {
                    format!("Index '{}' already exists", create.name)
                };
                Ok(QueryResult::with_message(message))
            }
            Statement::DropTable(drop) => {
                let message = if self.inner.drop_table(&drop.name, drop.if_exists)? {
                    format!("Table '{}' dropped", drop.name)
                } else {
                    format!("Table '{}' does not exist", drop.name)
                };
                Ok(QueryResult::with_message(message))
            }
            Statement::DropIndex(drop) => {
                let message = if self.inner.drop_index(&drop.name, drop.if_exists)? {
                    format!("Index '{}' dropped", drop.name)
                } else {
                    format!("Index '{}' does not exist", drop.name)
                };
                Ok(QueryResult::with_message(message))
            }
            Statement::Vacuum(table) => {
                let stats = self.vacuum(table.as_deref())?;
                Ok(QueryResult::with_message(format!(
                    "Vacuumed {} tables: {} rows, {} versions, {} index entries removed",
                    stats.tables, stats.rows_removed, stats.versions_removed, stats.index_entries_removed
                )))
            }
            Statement::Analyze(table) => {
                let tables = self.inner.analyze(table.as_deref())?;
                Ok(QueryResult::with_message(format!("Analyzed {} tables", tables)))
            }
            Statement::Begin(_) | Statement::Commit | Statement::Rollback => Err(Error::InvalidArgument(
                "transaction control needs a session; use Engine::begin".to_string(),
            )),
            stmt => {
                let mut tx = self.begin(self.inner.options.default_isolation)?;
                let result = tx.query_statement(stmt)?;
                tx.commit()?;
                Ok(result)
            }
        }
    }

    pub fn create_table(&self, def: TableDef) -> Result<Arc<TableDef>> {
        self.inner.create_table(def)
    }

    pub fn create_index(&self, name: &str, table: &str, columns: &[&str], unique: bool) -> Result<()> {
        let stmt = CreateIndexStatement {
            name: name.to_string(),
            table: table.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            unique,
            if_not_exists: false,
        };
        self.inner.create_index(&stmt).map(|_| ())
    }

    pub fn drop_table(&self, name: &str) -> Result<()> {
        self.inner.drop_table(name, false).map(|_| ())
    }

    /// Drop a secondary index. Primary key and UNIQUE constraint indexes
    /// cannot be dropped.
    pub fn drop_index(&self, name: &str) -> Result<()> {
        self.inner.drop_index(name, false).map(|_| ())
    }

    /// Reclaim dead rows and versions of one table or all of them.
    pub fn vacuum(&self, table: Option<&str>) -> Result<VacuumStats> {
        self.inner.vacuum(table)
    }

    /// Refresh planner statistics of one table or all of them.
    pub fn analyze(&self, table: Option<&str>) -> Result<()> {
        self.inner.analyze(table).map(|_| ())
    }

    pub fn check_integrity(&self) -> Result<IntegrityReport> {
        self.inner.check_integrity()
    }

    /// Flush all pages and truncate the WAL if no transaction is writing.
    /// Returns whether the WAL was truncated.
    pub fn checkpoint(&self) -> Result<bool> {
        self.inner.check_latch()?;
        let _maintenance = self.inner.maintenance.lock();
        self.inner.checkpoint()
    }

    /// Drop the engine without flushing pages or checkpointing, leaving the
    /// files as a crash would.
    pub fn crash_for_testing(self) {
        self.crashed.store(true, Ordering::SeqCst);
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown.stop();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("background thread panicked");
            }
        }
        if self.crashed.load(Ordering::SeqCst) || self.inner.check_latch().is_err() {
            return;
        }
        let _maintenance = self.inner.maintenance.lock();
        if let Err(e) = self.inner.checkpoint() {
            warn!(error = %e, "checkpoint on close failed");
        }
    }
}

/// A running transaction. Dropping it without commit aborts it.
pub struct Transaction {
    engine: Arc<EngineInner>,
    state: TxnState,
    status: TransactionState,
}

impl Transaction {
    pub fn txid(&self) -> TxId {
        self.state.txid
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.state.isolation
    }

    pub fn state(&self) -> TransactionState {
        self.status
    }

    /// Token that cancels the running statement and any lock wait
    pub fn cancel_token(&self) -> CancelToken {
        self.state.cancel.clone()
    }

    pub fn exec(&mut self, sql: &str) -> Result<ExecResult<'_>> {
        match parse_statement(sql) {
            Ok(stmt) => self.exec_statement(stmt),
            Err(e) => {
                let mark = self.state.undo.mark();
                Err(self.fail(mark, e))
            }
        }
    }

    pub fn query(&mut self, sql: &str) -> Result<QueryResult> {
        match parse_statement(sql) {
            Ok(stmt) => self.query_statement(stmt),
            Err(e) => {
                let mark = self.state.undo.mark();
                Err(self.fail(mark, e))
            }
        }
    }

    pub fn query_statement(&mut self, stmt: Statement) -> Result<QueryResult> {
        match self.exec_statement(stmt)? {
            ExecResult::Rows(stream) => {
                let columns = stream.columns().to_vec();
                let rows = stream.collect::<Result<Vec<_>>>()?;
                Ok(QueryResult::with_rows(columns, rows))
            }
            ExecResult::Count(count) => Ok(QueryResult::with_affected_rows(count)),
            ExecResult::Plan(text) => Ok(QueryResult::with_message(text)),
        }
    }

    pub fn exec_statement(&mut self, stmt: Statement) -> Result<ExecResult<'_>> {
        self.engine.check_latch()?;
        match self.status {
            TransactionState::Active => {}
            TransactionState::Failed => {
                return Err(Error::InvalidArgument(format!(
                    "transaction {} failed; only abort is accepted",
                    self.state.txid
                )))
            }
            TransactionState::Committed | TransactionState::Aborted => {
                return Err(Error::InvalidArgument(format!(
                    "transaction {} has ended",
                    self.state.txid
                )))
            }
        }
        match &stmt {
            Statement::Select(_) | Statement::Insert(_) | Statement::Update(_) | Statement::Delete(_) => {}
            Statement::Explain(inner) => {
                return self
                    .engine
                    .planner()
                    .explain(inner)
                    .map(ExecResult::Plan)
            }
            Statement::Begin(_) => {
                return Err(Error::InvalidArgument(format!(
                    "transaction {} is already in progress",
                    self.state.txid
                )))
            }
            Statement::Commit | Statement::Rollback => {
                return Err(Error::InvalidArgument(
                    "use Transaction::commit or Transaction::abort".to_string(),
                ))
            }
            _ => {
                return Err(Error::InvalidArgument(
                    "DDL, VACUUM and ANALYZE run outside explicit transactions".to_string(),
                ))
            }
        }

        if self.state.isolation.per_statement_snapshot() {
            self.state.snapshot = self.engine.txns.refresh_snapshot(self.state.txid);
        }
        let mark = self.state.undo.mark();
        let lock_reads = self.state.isolation.locks_reads() && matches!(stmt, Statement::Select(_));
        let prepared = self.prepare(&stmt, lock_reads);
        let (mut root, columns, write) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => return Err(self.fail(mark, e)),
        };
        root.open();
        if !write {
            return Ok(ExecResult::Rows(RowStream {
                tx: self,
                root,
                columns,
                mark,
                lock_reads,
                done: false,
            }));
        }
        let engine = Arc::clone(&self.engine);
        let outcome = {
            let mut cx = engine.context(&mut self.state, false);
            root.next(&mut cx)
        };
        root.close();
        match outcome {
            Ok(Some(row)) => Ok(ExecResult::Count(
                row.tuple.get(0).and_then(Value::as_i64).unwrap_or(0) as u64,
            )),
            Ok(None) => Ok(ExecResult::Count(0)),
            Err(e) => Err(self.fail(mark, e)),
        }
    }

    /// Lock the statement's table and build its operator tree.
    fn prepare(&mut self, stmt: &Statement, lock_reads: bool) -> Result<(Operator, Vec<String>, bool)> {
        self.state.cancel.check()?;
        let engine = Arc::clone(&self.engine);
        let (name, write) = match stmt {
            Statement::Select(s) => (&s.from, false),
            Statement::Insert(s) => (&s.table, true),
            Statement::Update(s) => (&s.table, true),
            Statement::Delete(s) => (&s.table, true),
            _ => return Err(Error::InternalInvariant("not a data statement".to_string())),
        };
        let def = engine.catalog.get_table(name)?;
        {
            let mut cx = engine.context(&mut self.state, lock_reads);
            if write {
                cx.lock_table_for_write(def.id)?;
            } else {
                cx.lock_table_for_read(def.id)?;
            }
        }
        // the table may have been dropped while we waited
        let store = engine
            .store(def.id)
            .map_err(|_| Error::NoSuchTable(name.to_string()))?;
        let plan = engine.planner().plan(stmt)?;
        debug!(txid = self.state.txid, plan = %plan.explain().trim_end(), "planned statement");
        let columns = plan.columns();
        let root = Operator::build(plan, &store)?;
        Ok((root, columns, write))
    }

    /// Roll the failed statement back and apply the error policy: conflicts
    /// abort the transaction, storage and runtime errors leave it failed,
    /// and an internal invariant failure makes the engine read-only.
    fn fail(&mut self, mark: usize, err: Error) -> Error {
        let engine = Arc::clone(&self.engine);
        if let Err(undo) = self.state.undo.rollback_to(mark, self.state.txid, &*engine) {
            engine.latch(&undo);
            self.status = TransactionState::Failed;
            return undo;
        }
        match err.category() {
            ErrorCategory::Concurrency => {
                debug!(txid = self.state.txid, error = %err, "aborting transaction");
                if let Err(abort) = self.rollback() {
                    warn!(txid = self.state.txid, error = %abort, "abort failed");
                }
            }
            ErrorCategory::Storage | ErrorCategory::Runtime => {
                if err.kind() == ErrorKind::InternalInvariant {
                    engine.latch(&err);
                }
                self.status = TransactionState::Failed;
            }
            ErrorCategory::Schema | ErrorCategory::Constraint => {}
        }
        err
    }

    fn release_locks(&mut self) {
        self.engine
            .locks
            .release_all(self.state.txid, self.state.held.iter());
        self.state.held.clear();
    }

    fn rollback(&mut self) -> Result<()> {
        let engine = Arc::clone(&self.engine);
        let undone = self.state.undo.rollback_to(0, self.state.txid, &*engine);
        if let Err(e) = &undone {
            engine.latch(e);
        }
        let ended = engine.txns.abort(self.state.txid);
        self.release_locks();
        self.status = TransactionState::Aborted;
        undone?;
        ended
    }

    /// Make the transaction's writes durable and visible.
    pub fn commit(mut self) -> Result<()> {
        match self.status {
            TransactionState::Active => {}
            TransactionState::Failed => {
                self.rollback()?;
                return Err(Error::InvalidArgument(format!(
                    "transaction {} failed and was rolled back",
                    self.state.txid
                )));
            }
            _ => {
                return Err(Error::InvalidArgument(format!(
                    "transaction {} has ended",
                    self.state.txid
                )))
            }
        }
        if let Err(e) = self.engine.check_latch() {
            self.rollback()?;
            return Err(e);
        }
        match self.engine.txns.commit(self.state.txid) {
            Ok(_) => {
                self.state.undo.clear();
                self.release_locks();
                self.status = TransactionState::Committed;
                Ok(())
            }
            Err(e) => {
                self.rollback()?;
                Err(e)
            }
        }
    }

    /// Undo every change of the transaction.
    pub fn abort(mut self) -> Result<()> {
        match self.status {
            TransactionState::Active | TransactionState::Failed => self.rollback(),
            _ => Ok(()),
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if matches!(self.status, TransactionState::Active | TransactionState::Failed) {
            if let Err(e) = self.rollback() {
                warn!(txid = self.state.txid, error = %e, "abort on drop failed");
            }
        }
    }
}

/// Rows of a running SELECT
pub struct RowStream<'t> {
    tx: &'t mut Transaction,
    root: Operator,
    columns: Vec<String>,
    mark: usize,
    lock_reads: bool,
    done: bool,
}

impl RowStream<'_> {
    pub fn columns(&self) -> &[String] {
        &self.columns
    }
}

impl Iterator for RowStream<'_> {
    type Item = Result<Tuple>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let engine = Arc::clone(&self.tx.engine);
        let outcome = {
            let mut cx = engine.context(&mut self.tx.state, self.lock_reads);
            self.root.next(&mut cx)
        };
        match outcome {
            Ok(Some(row)) => Some(Ok(row.tuple)),
            Ok(None) => {
                self.done = true;
                self.root.close();
                None
            }
            Err(e) => {
                self.done = true;
                self.root.close();
                Some(Err(self.tx.fail(self.mark, e)))
            }
        }
    }
}

impl Drop for RowStream<'_> {
    fn drop(&mut self) {
        self.root.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn options() -> Options {
        Options::default()
            .with_page_size(4096)
            .with_buffer_pool_pages(64)
            .with_autovacuum_interval(None)
            .with_lock_timeout(Duration::from_millis(500))
    }

    fn open(dir: &TempDir) -> Engine {
        Engine::open(dir.path(), options()).unwrap()
    }

    fn names(result: &QueryResult, column: usize) -> Vec<String> {
        result
            .rows
            .iter()
            .map(|r| r.get(column).unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_options_validation() {
        assert!(options().validate().is_ok());
        assert!(options().with_page_size(3000).validate().is_err());
        assert!(options().with_page_size(65536).validate().is_err());
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");
        assert!(matches!(
            Engine::open(&missing, options().with_create_if_missing(false)),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_crud_round_trip() {
        let dir = TempDir::new().unwrap();
        let engine = open(&dir);
        engine
            .exec("CREATE TABLE t (id INT PRIMARY KEY, name VARCHAR, n INT DEFAULT 7)")
            .unwrap();
        assert_eq!(engine.exec("INSERT INTO t (id, name) VALUES (1, 'a'), (2, 'b')").unwrap(), 2);
        assert_eq!(engine.exec("UPDATE t SET name = 'z' WHERE id = 2").unwrap(), 1);
        assert_eq!(engine.exec("DELETE FROM t WHERE id = 1").unwrap(), 1);
        let result = engine.query("SELECT * FROM t").unwrap();
        assert_eq!(result.columns, vec!["id", "name", "n"]);
        assert_eq!(
            result.rows,
            vec![Tuple::new(vec![
                Value::Int32(2),
                Value::Varchar("z".into()),
                Value::Int32(7)
            ])]
        );
    }

    #[test]
    fn test_statement_failure_keeps_transaction_usable() {
        let dir = TempDir::new().unwrap();
        let engine = open(&dir);
        engine.exec("CREATE TABLE t (id INT PRIMARY KEY)").unwrap();
        let mut tx = engine.begin(IsolationLevel::Snapshot).unwrap();
        tx.query("INSERT INTO t VALUES (1)").unwrap();
        let err = tx.query("INSERT INTO t VALUES (2), (1)").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateKey);
        assert_eq!(tx.state(), TransactionState::Active);
        // the failed statement's first row is gone too
        assert_eq!(tx.query("SELECT id FROM t").unwrap().rows.len(), 1);
        tx.commit().unwrap();
        assert_eq!(engine.exec("SELECT * FROM t").unwrap(), 1);
    }

    #[test]
    fn test_runtime_error_fails_transaction() {
        let dir = TempDir::new().unwrap();
        let engine = open(&dir);
        engine.exec("CREATE TABLE t (id INT PRIMARY KEY)").unwrap();
        let mut tx = engine.begin(IsolationLevel::Snapshot).unwrap();
        tx.query("INSERT INTO t VALUES (1)").unwrap();
        assert!(tx.query("SELEC oops").is_err());
        assert_eq!(tx.state(), TransactionState::Failed);
        assert!(tx.query("SELECT * FROM t").is_err());
        assert!(tx.commit().is_err());
        assert_eq!(engine.exec("SELECT * FROM t").unwrap(), 0);
    }

    #[test]
    fn test_ddl_rejected_inside_transaction() {
        let dir = TempDir::new().unwrap();
        let engine = open(&dir);
        engine.exec("CREATE TABLE t (id INT PRIMARY KEY, v INT)").unwrap();
        let mut tx = engine.begin(IsolationLevel::Snapshot).unwrap();
        for sql in [
            "CREATE TABLE u (id INT)",
            "CREATE INDEX t_v ON t (v)",
            "DROP INDEX t_pkey",
            "DROP TABLE t",
            "VACUUM",
            "ANALYZE t",
        ] {
            assert!(matches!(tx.query(sql), Err(Error::InvalidArgument(_))), "{}", sql);
        }
        assert_eq!(tx.state(), TransactionState::Active);
        tx.query("INSERT INTO t VALUES (1, 1)").unwrap();
        tx.commit().unwrap();
        assert!(matches!(engine.exec("COMMIT"), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_explain_and_streaming() {
        let dir = TempDir::new().unwrap();
        let engine = open(&dir);
        engine.exec("CREATE TABLE t (id INT PRIMARY KEY, v INT)").unwrap();
        for i in 0..20 {
            engine.exec(&format!("INSERT INTO t VALUES ({}, {})", i, i % 3)).unwrap();
        }
        let plan = engine.query("EXPLAIN SELECT v FROM t WHERE id >= 5").unwrap();
        assert!(plan.message.unwrap().contains("IndexRange t.t_pkey"));

        let mut tx = engine.begin(IsolationLevel::Snapshot).unwrap();
        match tx.exec("SELECT id FROM t WHERE id >= 5 LIMIT 3").unwrap() {
            ExecResult::Rows(stream) => {
                assert_eq!(stream.columns(), ["id"]);
                let ids: Vec<Tuple> = stream.map(|r| r.unwrap()).collect();
                assert_eq!(ids.len(), 3);
                assert_eq!(ids[0], Tuple::new(vec![Value::Int32(5)]));
            }
            _ => panic!("expected rows"),
        }
        tx.commit().unwrap();
    }

    #[test]
    fn test_create_index_and_unique_backfill() {
        let dir = TempDir::new().unwrap();
        let engine = open(&dir);
        engine.exec("CREATE TABLE t (id INT PRIMARY KEY, v INT)").unwrap();
        engine.exec("INSERT INTO t VALUES (1, 10), (2, 10), (3, 30)").unwrap();
        let err = engine.exec("CREATE UNIQUE INDEX t_v ON t (v)").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UniqueViolation);
        assert!(!engine.catalog().index_exists("t_v"));

        engine.create_index("t_v", "t", &["v"], false).unwrap();
        let result = engine.query("SELECT id FROM t WHERE v = 10 ORDER BY id").unwrap();
        assert_eq!(names(&result, 0), vec!["1", "2"]);
        assert!(engine.check_integrity().unwrap().is_ok());
    }

    #[test]
    fn test_drop_index() {
        let dir = TempDir::new().unwrap();
        let engine = open(&dir);
        engine
            .exec("CREATE TABLE t (id INT PRIMARY KEY, v INT, code VARCHAR UNIQUE)")
            .unwrap();
        for i in 0..200 {
            engine
                .exec(&format!("INSERT INTO t VALUES ({}, {}, 'c{}')", i, i % 7, i))
                .unwrap();
        }
        engine.exec("CREATE INDEX t_v ON t (v)").unwrap();
        let plan = engine.query("EXPLAIN SELECT id FROM t WHERE v = 3").unwrap();
        assert!(plan.message.unwrap().contains("t.t_v"));

        // waits for the writer's table lock
        let mut writer = engine.begin(IsolationLevel::Snapshot).unwrap();
        writer.query("INSERT INTO t VALUES (500, 3, 'c500')").unwrap();
        assert_eq!(engine.drop_index("t_v").unwrap_err().kind(), ErrorKind::LockTimeout);
        writer.commit().unwrap();

        let result = engine.query("DROP INDEX t_v").unwrap();
        assert_eq!(result.message.as_deref(), Some("Index 't_v' dropped"));
        assert!(!engine.catalog().index_exists("t_v"));
        let plan = engine.query("EXPLAIN SELECT id FROM t WHERE v = 3").unwrap();
        assert!(plan.message.unwrap().contains("HeapScan t"));
        assert_eq!(engine.exec("SELECT id FROM t WHERE v = 3").unwrap(), 30);

        let result = engine.query("DROP INDEX IF EXISTS t_v").unwrap();
        assert_eq!(result.message.as_deref(), Some("Index 't_v' does not exist"));
        assert_eq!(engine.exec("DROP INDEX t_v").unwrap_err().kind(), ErrorKind::NoSuchIndex);
        for keep in ["t_pkey", "t_code_key"] {
            assert_eq!(engine.drop_index(keep).unwrap_err().kind(), ErrorKind::InvalidArgument);
        }
        assert!(matches!(engine.exec("INSERT INTO t VALUES (900, 1, 'c1')"), Err(Error::UniqueViolation { .. })));

        // writes after the drop leave the freed pages alone
        engine.exec("UPDATE t SET v = v + 1 WHERE id < 50").unwrap();
        engine.exec("CREATE INDEX t_v ON t (v)").unwrap();
        assert_eq!(engine.exec("SELECT id FROM t WHERE v = 1").unwrap(), 30);
        assert!(engine.check_integrity().unwrap().is_ok());
    }

    #[test]
    fn test_vacuum_reclaims_versions() {
        let dir = TempDir::new().unwrap();
        let engine = open(&dir);
        engine.exec("CREATE TABLE t (id INT PRIMARY KEY, v INT)").unwrap();
        engine.exec("INSERT INTO t VALUES (1, 0), (2, 0)").unwrap();
        for i in 1..5 {
            engine.exec(&format!("UPDATE t SET v = {} WHERE id = 1", i)).unwrap();
        }
        engine.exec("DELETE FROM t WHERE id = 2").unwrap();
        let stats = engine.vacuum(None).unwrap();
        assert_eq!(stats.rows_removed, 1);
        assert!(stats.versions_removed >= 5);
        assert!(engine.check_integrity().unwrap().is_ok());
        let result = engine.query("SELECT v FROM t WHERE id = 1").unwrap();
        assert_eq!(names(&result, 0), vec!["4"]);
    }

    #[test]
    fn test_vacuum_keeps_versions_visible_to_old_snapshots() {
        let dir = TempDir::new().unwrap();
        let engine = open(&dir);
        engine.exec("CREATE TABLE t (id INT PRIMARY KEY, v INT)").unwrap();
        engine.exec("INSERT INTO t VALUES (1, 0)").unwrap();
        let mut reader = engine.begin(IsolationLevel::Snapshot).unwrap();
        assert_eq!(names(&reader.query("SELECT v FROM t").unwrap(), 0), vec!["0"]);
        engine.exec("UPDATE t SET v = 1 WHERE id = 1").unwrap();
        engine.vacuum(Some("t")).unwrap();
        assert_eq!(names(&reader.query("SELECT v FROM t").unwrap(), 0), vec!["0"]);
        reader.commit().unwrap();
    }

    #[test]
    fn test_vacuum_reclaims_copies_left_by_rollback() {
        let dir = TempDir::new().unwrap();
        let engine = open(&dir);
        engine.exec("CREATE TABLE t (id INT PRIMARY KEY, v INT)").unwrap();
        engine.exec("INSERT INTO t VALUES (1, 0)").unwrap();

        let mut reader = engine.begin(IsolationLevel::Snapshot).unwrap();
        let mut tx = engine.begin(IsolationLevel::Snapshot).unwrap();
        tx.query("UPDATE t SET v = 9 WHERE id = 1").unwrap();
        tx.abort().unwrap();

        // the older reader pins the horizon below the rolled back writer
        let stats = engine.vacuum(Some("t")).unwrap();
        assert_eq!(stats.versions_removed, 0);
        assert_eq!(names(&reader.query("SELECT v FROM t").unwrap(), 0), vec!["0"]);
        reader.commit().unwrap();

        let stats = engine.vacuum(Some("t")).unwrap();
        assert_eq!(stats.rows_removed, 0);
        assert_eq!(stats.versions_removed, 1);
        assert!(engine.check_integrity().unwrap().is_ok());
        assert_eq!(names(&engine.query("SELECT v FROM t").unwrap(), 0), vec!["0"]);
    }

    #[test]
    fn test_reopen_keeps_data_and_rowids() {
        let dir = TempDir::new().unwrap();
        {
            let engine = open(&dir);
            engine.exec("CREATE TABLE log (msg VARCHAR)").unwrap();
            engine.exec("INSERT INTO log VALUES ('a'), ('b')").unwrap();
        }
        let engine = open(&dir);
        engine.exec("INSERT INTO log VALUES ('c')").unwrap();
        let result = engine.query("SELECT msg FROM log").unwrap();
        let mut msgs = names(&result, 0);
        msgs.sort();
        assert_eq!(msgs, vec!["a", "b", "c"]);
        assert!(engine.check_integrity().unwrap().is_ok());
    }

    #[test]
    fn test_analyze_feeds_explain() {
        let dir = TempDir::new().unwrap();
        let engine = open(&dir);
        engine.exec("CREATE TABLE t (id INT PRIMARY KEY, v VARCHAR)").unwrap();
        engine.exec("INSERT INTO t VALUES (1, 'x'), (2, 'y'), (3, 'x')").unwrap();
        engine.exec("ANALYZE t").unwrap();
        let stats = engine.catalog().get_table("t").unwrap().stats.clone().unwrap();
        assert_eq!(stats.row_count, 3);
        assert_eq!(stats.distinct, vec![3, 2]);
        let plan = engine.query("EXPLAIN SELECT * FROM t ORDER BY v").unwrap();
        assert!(plan.message.unwrap().contains("in memory"));
    }

    #[test]
    fn test_drop_table() {
        let dir = TempDir::new().unwrap();
        let engine = open(&dir);
        engine.exec("CREATE TABLE t (id INT PRIMARY KEY)").unwrap();
        engine.drop_table("t").unwrap();
        assert!(matches!(engine.exec("SELECT * FROM t"), Err(Error::NoSuchTable(_))));
        engine.exec("DROP TABLE IF EXISTS t").unwrap();
        engine.exec("CREATE TABLE t (id INT PRIMARY KEY)").unwrap();
        assert_eq!(engine.exec("SELECT * FROM t").unwrap(), 0);
    }
}

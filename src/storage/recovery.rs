//! Crash recovery
//!
//! Runs on open when the WAL still holds records, which only happens after an
//! unclean shutdown. The log is replayed in three passes:
//!
//! 1. analysis: find transactions that never logged commit or abort;
//! 2. redo: reapply every slot image whose LSN is newer than its page;
//! 3. undo: for each slot last written by an unfinished transaction, put back
//!    the image that slot held before that transaction first touched it.
//!
//! Index pages are not logged. After replay every non-heap page is returned
//! to the free list and the caller rebuilds the indexes from the heap.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info};

use super::buffer_pool::{BufferPool, GlobalPageId};
use super::disk::TableId;
use super::heap::{HeapFile, RowId, SYSTEM_TXID};
use super::page::{PageId, PageKind, INVALID_PAGE_ID};
use super::wal::{LogRecord, LogRecordKind, Lsn, TxId, Wal};
use crate::error::{Error, Result};

/// Summary of a recovery run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    pub records: usize,
    pub redone: usize,
    pub undone_slots: usize,
    pub losers: Vec<TxId>,
    pub max_txid: TxId,
    pub max_lsn: Lsn,
}

type SlotKey = (TableId, PageId, u16);

/// Replay `records` against the heap files of the live tables.
pub fn replay(
    pool: &Arc<BufferPool>,
    wal: &Wal,
    heaps: &HashMap<TableId, Arc<HeapFile>>,
    records: &[LogRecord],
) -> Result<RecoveryStats> {
    let mut stats = RecoveryStats {
        records: records.len(),
        ..Default::default()
    };

    // analysis
    let mut finished = HashSet::new();
    let mut seen = HashSet::new();
    for record in records {
        stats.max_txid = stats.max_txid.max(record.txid);
        stats.max_lsn = stats.max_lsn.max(record.lsn);
        match record.kind {
            LogRecordKind::Commit | LogRecordKind::Abort => {
                finished.insert(record.txid);
            }
            _ => {
                seen.insert(record.txid);
            }
        }
    }
    let losers: HashSet<TxId> = seen
        .into_iter()
        .filter(|txid| *txid != SYSTEM_TXID && !finished.contains(txid))
        .collect();

    // redo
    for record in records {
        if let LogRecordKind::Write {
            table_id,
            page_id,
            slot,
            after,
            ..
        } = &record.kind
        {
            if !heaps.contains_key(table_id) {
                continue;
            }
            if redo_write(pool, *table_id, *page_id, *slot, after.as_deref(), record.lsn)? {
                stats.redone += 1;
            }
        }
    }

    // undo
    let mut last_writer: HashMap<SlotKey, TxId> = HashMap::new();
    let mut first_before: HashMap<SlotKey, Option<Vec<u8>>> = HashMap::new();
    for record in records {
        if let LogRecordKind::Write {
            table_id,
            page_id,
            slot,
            before,
            ..
        } = &record.kind
        {
            let key = (*table_id, *page_id, *slot);
            last_writer.insert(key, record.txid);
            if losers.contains(&record.txid) {
                first_before
                    .entry(key)
                    .or_insert_with(|| before.clone());
            }
        }
    }
    let mut undo: Vec<(SlotKey, Option<Vec<u8>>)> = first_before
        .into_iter()
        .filter(|(key, _)| {
            last_writer
                .get(key)
                .map_or(false, |txid| losers.contains(txid))
        })
        .collect();
    // emptied slots first so relocations never land on a slot still to be undone
    undo.sort_by_key(|((table_id, page_id, slot), image)| {
        (image.is_some(), *table_id, *page_id, *slot)
    });
    for ((table_id, page_id, slot), image) in undo {
        let heap = match heaps.get(&table_id) {
            Some(heap) => heap,
            None => continue,
        };
        heap.restore_image(SYSTEM_TXID, RowId::new(page_id, slot), image.as_deref())?;
        stats.undone_slots += 1;
    }
    let mut losers: Vec<TxId> = losers.into_iter().collect();
    losers.sort_unstable();
    for txid in &losers {
        wal.append(*txid, LogRecordKind::Abort)?;
    }
    stats.losers = losers;

    info!(
        records = stats.records,
        redone = stats.redone,
        undone = stats.undone_slots,
        losers = stats.losers.len(),
        "replayed write-ahead log"
    );
    Ok(stats)
}

fn redo_write(
    pool: &Arc<BufferPool>,
    table_id: TableId,
    page_id: PageId,
    slot: u16,
    after: Option<&[u8]>,
    lsn: Lsn,
) -> Result<bool> {
    let disk = pool.disk();
    while disk.page_count(table_id)? <= page_id {
        disk.extend(table_id, PageKind::Heap)?;
    }
    let mut page = pool.fetch_write(GlobalPageId::new(table_id, page_id))?;
    if page.kind() != Some(PageKind::Heap) {
        // page was reused for an index or freed after this record
        page.reset(page_id, PageKind::Heap);
        page.set_lsn(0);
    }
    if lsn <= page.lsn() {
        return Ok(false);
    }
    if !page.put_record(slot, after) {
        return Err(Error::InternalInvariant(format!(
            "redo of lsn {} does not fit on page {} of table {}",
            lsn, page_id, table_id
        )));
    }
    page.set_lsn(lsn);
    Ok(true)
}

/// Return every index and free page of a table to a freshly built free list
/// and clear the primary index root. Heap pages are left untouched.
pub fn reclaim_index_pages(pool: &Arc<BufferPool>, table_id: TableId) -> Result<usize> {
    let disk = pool.disk();
    disk.update_meta(table_id, |meta| {
        meta.free_list_head = INVALID_PAGE_ID;
        meta.root_page_id = INVALID_PAGE_ID;
    })?;
    let mut reclaimed = 0;
    for page_id in 1..disk.page_count(table_id)? {
        let id = GlobalPageId::new(table_id, page_id);
        let is_heap = pool.fetch_read(id)?.kind() == Some(PageKind::Heap);
        if !is_heap {
            pool.free_page(id)?;
            reclaimed += 1;
        }
    }
    debug!(table_id, reclaimed, "rebuilt free list");
    Ok(reclaimed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::disk::DiskManager;
    use crate::storage::heap::RowVersion;
    use crate::storage::tuple::{Tuple, Value};
    use crate::storage::wal::WalSyncMode;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        pool: Arc<BufferPool>,
        wal: Arc<Wal>,
        heaps: HashMap<TableId, Arc<HeapFile>>,
    }

    fn open(dir: TempDir, create: bool) -> (Fixture, Vec<LogRecord>) {
        let disk = Arc::new(DiskManager::new(dir.path(), 1024));
        if create {
            disk.create_table_file(1).unwrap();
        } else {
            disk.open_table_file(1).unwrap();
        }
        let (wal, records) = Wal::open(dir.path(), WalSyncMode::Full).unwrap();
        let wal = Arc::new(wal);
        let pool = BufferPool::new(16, disk, Some(Arc::clone(&wal)));
        let mut heaps = HashMap::new();
        heaps.insert(
            1,
            Arc::new(HeapFile::new(1, Arc::clone(&pool), Arc::clone(&wal))),
        );
        (
            Fixture {
                _dir: dir,
                pool,
                wal,
                heaps,
            },
            records,
        )
    }

    fn version(txid: TxId, v: i32) -> RowVersion {
        RowVersion::new(txid, Tuple::new(vec![Value::Int32(v)]))
    }

    #[test]
    fn test_redo_committed_and_undo_unfinished() {
        let (fx, _) = open(TempDir::new().unwrap(), true);
        let heap = Arc::clone(&fx.heaps[&1]);
        let committed = heap.insert(1, &version(1, 10)).unwrap();
        let lsn = fx.wal.append(1, LogRecordKind::Commit).unwrap();
        fx.wal.commit_flush(lsn).unwrap();

        // tx 2 overwrites the committed row and inserts another, then "crashes"
        heap.write_head(2, committed, &version(2, 20)).unwrap();
        let orphan = heap.insert(2, &version(2, 30)).unwrap();
        fx.wal.sync_to(u64::MAX).unwrap();
        let Fixture { _dir: dir, pool, .. } = fx;
        // pages were never written back
        drop(pool);

        let (fx, records) = open(dir, false);
        let stats = replay(&fx.pool, &fx.wal, &fx.heaps, &records).unwrap();
        assert_eq!(stats.losers, vec![2]);
        assert_eq!(stats.max_txid, 2);

        let heap = &fx.heaps[&1];
        let (_, head) = heap.read_head(committed).unwrap().unwrap();
        assert_eq!(head.tuple, Tuple::new(vec![Value::Int32(10)]));
        assert!(heap.read_head(orphan).unwrap().is_none());
    }

    #[test]
    fn test_reclaim_index_pages() {
        let (fx, _) = open(TempDir::new().unwrap(), true);
        let heap = &fx.heaps[&1];
        heap.insert(1, &version(1, 1)).unwrap();
        let index_page = fx.pool.allocate_page(1, PageKind::BTreeLeaf).unwrap().id();
        assert_eq!(reclaim_index_pages(&fx.pool, 1).unwrap(), 1);
        let meta = fx.pool.disk().meta(1).unwrap();
        assert_eq!(meta.free_list_head, index_page.page_id);
        assert_eq!(meta.root_page_id, INVALID_PAGE_ID);
    }
}

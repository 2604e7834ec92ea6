//! Per-transaction undo log
//!
//! Each heap or index change made by a transaction leaves one record here.
//! Rolling back (the whole transaction, or a statement back to its
//! savepoint) applies the records newest first. Undo writes go through the
//! heap like any other write, so they are WAL-logged under the aborting
//! transaction's id.

use std::sync::Arc;

use tracing::trace;

use crate::error::Result;
use crate::storage::btree::BTree;
use crate::storage::disk::TableId;
use crate::storage::heap::{HeapFile, RowId, RowVersion, POISON_TXID};
use crate::storage::wal::TxId;

/// Where undo records are applied
pub trait UndoTarget {
    fn heap(&self, table_id: TableId) -> Result<Arc<HeapFile>>;

    /// `None` when the index no longer exists
    fn index(&self, table_id: TableId, name: &str) -> Result<Option<Arc<BTree>>>;
}

#[derive(Debug, Clone)]
pub enum UndoRecord {
    /// Put back the head a row had before an update or delete. The copy of
    /// the old head an update pushed down the chain stays in place, since a
    /// reader may still be walking towards it; vacuum reclaims it.
    Restore {
        table_id: TableId,
        rid: RowId,
        before: RowVersion,
    },
    /// Make an inserted row invisible to everyone; vacuum reclaims it.
    Poison {
        table_id: TableId,
        rid: RowId,
        inserted: RowVersion,
    },
    /// Remove an index entry added by the transaction
    IndexInsert {
        table_id: TableId,
        index: String,
        key: Vec<u8>,
    },
}

impl UndoRecord {
    fn apply(&self, txid: TxId, target: &dyn UndoTarget) -> Result<()> {
        match self {
            UndoRecord::Restore {
                table_id,
                rid,
                before,
            } => {
                target.heap(*table_id)?.write_head(txid, *rid, before)?;
            }
            UndoRecord::Poison {
                table_id,
                rid,
                inserted,
            } => {
                let mut poisoned = inserted.clone();
                poisoned.xmin = POISON_TXID;
                target.heap(*table_id)?.write_head(txid, *rid, &poisoned)?;
            }
            UndoRecord::IndexInsert {
                table_id,
                index,
                key,
            } => {
                if let Some(tree) = target.index(*table_id, index)? {
                    tree.delete(key)?;
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct UndoLog {
    records: Vec<UndoRecord>,
}

impl UndoLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: UndoRecord) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Savepoint for the statement about to run
    pub fn mark(&self) -> usize {
        self.records.len()
    }

    /// Undo everything recorded after `mark`, newest first. Records are
    /// dropped as they are applied, so a failed rollback can be resumed.
    pub fn rollback_to(&mut self, mark: usize, txid: TxId, target: &dyn UndoTarget) -> Result<usize> {
        let mut applied = 0;
        while self.records.len() > mark {
            if let Some(record) = self.records.last() {
                record.apply(txid, target)?;
            }
            self.records.pop();
            applied += 1;
        }
        trace!(txid, applied, "rolled back undo records");
        Ok(applied)
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::storage::buffer_pool::BufferPool;
    use crate::storage::disk::DiskManager;
    use crate::storage::heap::HeapRecord;
    use crate::storage::tuple::{Tuple, Value};
    use crate::storage::wal::{Wal, WalSyncMode};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        heap: Arc<HeapFile>,
        tree: Arc<BTree>,
    }

    impl UndoTarget for Fixture {
        fn heap(&self, table_id: TableId) -> Result<Arc<HeapFile>> {
            if table_id == 1 {
                Ok(Arc::clone(&self.heap))
            } else {
                Err(Error::NoSuchTable(table_id.to_string()))
            }
        }

        fn index(&self, _table_id: TableId, name: &str) -> Result<Option<Arc<BTree>>> {
            Ok((name == "idx").then(|| Arc::clone(&self.tree)))
        }
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let disk = Arc::new(DiskManager::new(dir.path(), 1024));
        disk.create_table_file(1).unwrap();
        let (wal, _) = Wal::open(dir.path(), WalSyncMode::Off).unwrap();
        let wal = Arc::new(wal);
        let pool = BufferPool::new(32, disk, Some(Arc::clone(&wal)));
        let heap = Arc::new(HeapFile::new(1, Arc::clone(&pool), wal));
        let tree = Arc::new(BTree::create(pool, 1, "idx").unwrap());
        Fixture { _dir: dir, heap, tree }
    }

    fn row(txid: TxId, v: i32) -> RowVersion {
        RowVersion::new(txid, Tuple::new(vec![Value::Int32(v)]))
    }

    #[test]
    fn test_rollback_update_and_insert() {
        let fx = fixture();
        let original = row(1, 10);
        let rid = fx.heap.insert(1, &original).unwrap();

        let mut undo = UndoLog::new();
        let mut old = original.clone();
        old.xmax = 2;
        let copy = fx.heap.push_version(2, rid, &old, row(2, 20)).unwrap();
        undo.push(UndoRecord::Restore {
            table_id: 1,
            rid,
            before: original.clone(),
        });
        let inserted = row(2, 30);
        let new_rid = fx.heap.insert(2, &inserted).unwrap();
        undo.push(UndoRecord::Poison {
            table_id: 1,
            rid: new_rid,
            inserted,
        });
        fx.tree.insert(b"k", &new_rid.to_bytes()).unwrap();
        undo.push(UndoRecord::IndexInsert {
            table_id: 1,
            index: "idx".to_string(),
            key: b"k".to_vec(),
        });

        assert_eq!(undo.rollback_to(0, 2, &fx).unwrap(), 3);
        assert!(undo.is_empty());
        assert_eq!(fx.heap.read_head(rid).unwrap().unwrap().1, original);
        // unlinked, but left for vacuum
        assert!(matches!(
            fx.heap.fetch_record(copy).unwrap(),
            Some(HeapRecord::Version { flags: 0, .. })
        ));
        let chain: Vec<RowVersion> = fx.heap.versions(rid).map(|v| v.unwrap()).collect();
        assert_eq!(chain, vec![original.clone()]);
        assert_eq!(fx.heap.read_head(new_rid).unwrap().unwrap().1.xmin, POISON_TXID);
        assert!(fx.tree.get(b"k").unwrap().is_none());
    }

    #[test]
    fn test_rollback_to_savepoint() {
        let fx = fixture();
        let mut undo = UndoLog::new();
        for i in 0..3 {
            let v = row(5, i);
            let rid = fx.heap.insert(5, &v).unwrap();
            undo.push(UndoRecord::Poison {
                table_id: 1,
                rid,
                inserted: v,
            });
        }
        let mark = 1;
        assert_eq!(undo.rollback_to(mark, 5, &fx).unwrap(), 2);
        assert_eq!(undo.len(), 1);
    }
}

//! Storage engine module
//!
//! This module contains the storage engine components:
//! - Value encoding (tuples, order-preserving keys, temporal types)
//! - Pages, table files and the metadata page
//! - Buffer pool with page latches
//! - Heap files with MVCC version chains
//! - B+ tree indexes
//! - Write-ahead log and crash recovery

pub mod btree;
pub mod buffer_pool;
pub mod codec;
pub mod disk;
pub mod heap;
pub mod meta;
pub mod page;
pub mod recovery;
pub mod temporal;
pub mod tuple;
pub mod wal;

pub use btree::{BTree, CursorPosition, Direction, RangeCursor};
pub use buffer_pool::{BufferPool, GlobalPageId};
pub use disk::{DiskManager, TableId};
pub use heap::{HeapFile, RowId, RowVersion};
pub use page::{Page, PageId, PageKind};
pub use tuple::{Comparison, Tuple, Value};
pub use wal::{LogRecord, LogRecordKind, Lsn, TxId, Wal, WalSyncMode};

//! Heap file storage for EmberDB
//!
//! Rows live in slotted heap pages that share the table file with the index
//! pages. Every row has an *anchor* slot whose [`RowId`] never changes; the
//! anchor always holds the newest version of the row, and older versions are
//! copied to other slots and linked through `next`. When the newest version
//! outgrows its page it is relocated and the anchor keeps a forwarding stub.
//!
//! Record layout (big-endian):
//!
//! ```text
//! version: tag=0 | flags u8 | xmin u64 | xmax u64 | next page u32 | next slot u16 | tuple
//! forward: tag=1 | page u32 | slot u16
//! ```
//!
//! Every slot change is logged to the WAL as a before/after image before the
//! page latch is released.

use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use bytes::{Buf, BufMut};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::buffer_pool::{BufferPool, GlobalPageId, PageWriteGuard};
use super::disk::TableId;
use super::page::{Page, PageId, PageKind, INVALID_PAGE_ID};
use super::tuple::Tuple;
use super::wal::{LogRecordKind, TxId, Wal};
use crate::error::{Error, Result};

/// `xmax` of a version nobody has deleted
pub const INVALID_TXID: TxId = 0;

/// `xmin` of a version whose inserting transaction aborted
pub const POISON_TXID: TxId = u64::MAX;

/// Transaction id used for maintenance writes (vacuum, recovery undo)
pub const SYSTEM_TXID: TxId = 0;

const TAG_VERSION: u8 = 0;
const TAG_FORWARD: u8 = 1;

/// Anchor slot holding the newest version
pub const FLAG_HEAD: u8 = 0x01;
/// Newest version relocated away from its anchor
pub const FLAG_MOVED: u8 = 0x02;

pub const VERSION_HEADER_SIZE: usize = 24;
const FORWARD_SIZE: usize = 7;

/// Longest version chain walked before the heap is declared corrupt
const MAX_CHAIN_LEN: usize = 1 << 16;

/// Stable row address: the anchor slot of a row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowId {
    pub page_id: PageId,
    pub slot: u16,
}

impl RowId {
    pub const ENCODED_LEN: usize = 6;

    pub fn new(page_id: PageId, slot: u16) -> Self {
        Self { page_id, slot }
    }

    /// Big-endian bytes, so encoded row ids sort like `(page_id, slot)`.
    pub fn to_bytes(&self) -> [u8; 6] {
        let mut out = [0u8; 6];
        out[..4].copy_from_slice(&self.page_id.to_be_bytes());
        out[4..].copy_from_slice(&self.slot.to_be_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::ENCODED_LEN {
            return None;
        }
        let mut buf = bytes;
        Some(RowId::new(buf.get_u32(), buf.get_u16()))
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.page_id, self.slot)
    }
}

/// One version of a row with its MVCC header
#[derive(Debug, Clone, PartialEq)]
pub struct RowVersion {
    pub xmin: TxId,
    pub xmax: TxId,
    pub next: Option<RowId>,
    pub tuple: Tuple,
}

impl RowVersion {
    pub fn new(xmin: TxId, tuple: Tuple) -> Self {
        Self {
            xmin,
            xmax: INVALID_TXID,
            next: None,
            tuple,
        }
    }

    pub fn encode(&self, flags: u8) -> Vec<u8> {
        let tuple = self.tuple.to_bytes();
        let mut buf = Vec::with_capacity(VERSION_HEADER_SIZE + tuple.len());
        buf.put_u8(TAG_VERSION);
        buf.put_u8(flags);
        buf.put_u64(self.xmin);
        buf.put_u64(self.xmax);
        let next = self.next.unwrap_or(RowId::new(INVALID_PAGE_ID, 0));
        buf.put_u32(next.page_id);
        buf.put_u16(next.slot);
        buf.put_slice(&tuple);
        buf
    }
}

/// A decoded heap slot
#[derive(Debug, Clone, PartialEq)]
pub enum HeapRecord {
    Version { flags: u8, version: RowVersion },
    Forward(RowId),
}

impl HeapRecord {
    pub fn decode(bytes: &[u8]) -> Result<HeapRecord> {
        let mut buf = bytes;
        let malformed = || Error::InternalInvariant("malformed heap record".to_string());
        if buf.remaining() < 1 {
            return Err(malformed());
        }
        match buf.get_u8() {
            TAG_FORWARD => {
                if buf.remaining() < FORWARD_SIZE - 1 {
                    return Err(malformed());
                }
                Ok(HeapRecord::Forward(RowId::new(buf.get_u32(), buf.get_u16())))
            }
            TAG_VERSION => {
                if buf.remaining() < VERSION_HEADER_SIZE - 1 {
                    return Err(malformed());
                }
                let flags = buf.get_u8();
                let xmin = buf.get_u64();
                let xmax = buf.get_u64();
                let page_id = buf.get_u32();
                let slot = buf.get_u16();
                let next = (page_id != INVALID_PAGE_ID).then(|| RowId::new(page_id, slot));
                let tuple = Tuple::from_bytes(buf)?;
                Ok(HeapRecord::Version {
                    flags,
                    version: RowVersion {
                        xmin,
                        xmax,
                        next,
                        tuple,
                    },
                })
            }
            _ => Err(malformed()),
        }
    }

    /// Whether this slot is the entry point of a row.
    pub fn is_anchor(&self) -> bool {
        match self {
            HeapRecord::Forward(_) => true,
            HeapRecord::Version { flags, .. } => flags & FLAG_HEAD != 0,
        }
    }
}

fn forward_bytes(target: RowId) -> Vec<u8> {
    let mut buf = Vec::with_capacity(FORWARD_SIZE);
    buf.put_u8(TAG_FORWARD);
    buf.put_u32(target.page_id);
    buf.put_u16(target.slot);
    buf
}

/// Heap file of one table
#[derive(Debug)]
pub struct HeapFile {
    table_id: TableId,
    pool: Arc<BufferPool>,
    wal: Arc<Wal>,
    /// Page most recently inserted into
    insert_hint: Mutex<Option<PageId>>,
    /// Pages known to have room after vacuum
    free_space: Mutex<BTreeSet<PageId>>,
}

impl HeapFile {
    pub fn new(table_id: TableId, pool: Arc<BufferPool>, wal: Arc<Wal>) -> Self {
        Self {
            table_id,
            pool,
            wal,
            insert_hint: Mutex::new(None),
            free_space: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn table_id(&self) -> TableId {
        self.table_id
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Largest encoded tuple a single version can carry.
    pub fn max_tuple_size(&self) -> usize {
        Page::max_record_size(self.pool.page_size()) - VERSION_HEADER_SIZE
    }

    fn gid(&self, page_id: PageId) -> GlobalPageId {
        GlobalPageId::new(self.table_id, page_id)
    }

    // ---------------------------------------------------------------------
    // Logged slot writes
    // ---------------------------------------------------------------------

    /// Set a slot image and log it. Returns false when the image does not fit.
    fn put_logged(
        &self,
        txid: TxId,
        page: &mut PageWriteGuard,
        slot: u16,
        after: Option<&[u8]>,
    ) -> Result<bool> {
        let before = page.get_record(slot).map(|r| r.to_vec());
        if !page.put_record(slot, after) {
            return Ok(false);
        }
        self.log_write(txid, page, slot, before, after.map(|a| a.to_vec()))?;
        Ok(true)
    }

    /// Insert into a page and log it. Returns `None` when the page is full.
    fn insert_logged(&self, txid: TxId, page: &mut PageWriteGuard, bytes: &[u8]) -> Result<Option<u16>> {
        let slot = match page.insert_record(bytes) {
            Some(slot) => slot,
            None => return Ok(None),
        };
        self.log_write(txid, page, slot, None, Some(bytes.to_vec()))?;
        Ok(Some(slot))
    }

    fn log_write(
        &self,
        txid: TxId,
        page: &mut PageWriteGuard,
        slot: u16,
        before: Option<Vec<u8>>,
        after: Option<Vec<u8>>,
    ) -> Result<()> {
        let page_id = page.page_id();
        let appended = self.wal.append(
            txid,
            LogRecordKind::Write {
                table_id: self.table_id,
                page_id,
                slot,
                before: before.clone(),
                after,
            },
        );
        match appended {
            Ok(lsn) => {
                page.set_lsn(lsn);
                Ok(())
            }
            Err(e) => {
                page.put_record(slot, before.as_deref());
                Err(e)
            }
        }
    }

    /// Place a record on any heap page with room, allocating one if needed.
    fn insert_anywhere(&self, txid: TxId, bytes: &[u8]) -> Result<RowId> {
        if bytes.len() > Page::max_record_size(self.pool.page_size()) {
            return Err(Error::InvalidArgument(format!(
                "row of {} bytes exceeds the page capacity of table {}",
                bytes.len(),
                self.table_id
            )));
        }
        let hint = *self.insert_hint.lock();
        if let Some(page_id) = hint {
            if let Some(rid) = self.try_insert_on(txid, page_id, bytes)? {
                return Ok(rid);
            }
        }
        loop {
            let candidate = self.free_space.lock().pop_first();
            let page_id = match candidate {
                Some(page_id) => page_id,
                None => break,
            };
            if let Some(rid) = self.try_insert_on(txid, page_id, bytes)? {
                self.free_space.lock().insert(page_id);
                *self.insert_hint.lock() = Some(page_id);
                return Ok(rid);
            }
        }
        let mut page = self.pool.allocate_page(self.table_id, PageKind::Heap)?;
        let page_id = page.page_id();
        let slot = self.insert_logged(txid, &mut page, bytes)?.ok_or_else(|| {
            Error::InternalInvariant(format!("record does not fit on fresh page {}", page_id))
        })?;
        trace!(table_id = self.table_id, page_id, "allocated heap page");
        *self.insert_hint.lock() = Some(page_id);
        Ok(RowId::new(page_id, slot))
    }

    fn try_insert_on(&self, txid: TxId, page_id: PageId, bytes: &[u8]) -> Result<Option<RowId>> {
        let mut page = self.pool.fetch_write(self.gid(page_id))?;
        if page.kind() != Some(PageKind::Heap) {
            return Ok(None);
        }
        Ok(self
            .insert_logged(txid, &mut page, bytes)?
            .map(|slot| RowId::new(page_id, slot)))
    }

    // ---------------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------------

    /// Decode the slot at `rid`, or `None` when it is empty.
    pub fn fetch_record(&self, rid: RowId) -> Result<Option<HeapRecord>> {
        let page = self.pool.fetch_read(self.gid(rid.page_id))?;
        if page.kind() != Some(PageKind::Heap) {
            return Ok(None);
        }
        match page.get_record(rid.slot) {
            Some(bytes) => HeapRecord::decode(bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Resolve the newest version of the row anchored at `rid`, returning
    /// it with its physical location.
    pub fn read_head(&self, rid: RowId) -> Result<Option<(RowId, RowVersion)>> {
        let page = self.pool.fetch_read(self.gid(rid.page_id))?;
        if page.kind() != Some(PageKind::Heap) {
            return Ok(None);
        }
        let target = match page.get_record(rid.slot).map(HeapRecord::decode).transpose()? {
            None => return Ok(None),
            Some(HeapRecord::Version { version, .. }) => return Ok(Some((rid, version))),
            Some(HeapRecord::Forward(target)) => target,
        };
        // the stub cannot be repointed while the anchor page is latched
        let moved = if target.page_id == rid.page_id {
            page.get_record(target.slot).map(HeapRecord::decode).transpose()?
        } else {
            self.fetch_record(target)?
        };
        match moved {
            Some(HeapRecord::Version { version, .. }) => Ok(Some((target, version))),
            _ => Err(Error::InternalInvariant(format!(
                "dangling forward pointer {} -> {} in table {}",
                rid, target, self.table_id
            ))),
        }
    }

    /// Walk the versions of a row, newest first.
    pub fn versions(&self, rid: RowId) -> VersionChain<'_> {
        VersionChain {
            heap: self,
            next: Some(rid),
            first: true,
            steps: 0,
        }
    }

    // ---------------------------------------------------------------------
    // Row writes
    // ---------------------------------------------------------------------

    /// Insert a new row and return its anchor.
    pub fn insert(&self, txid: TxId, version: &RowVersion) -> Result<RowId> {
        let rid = self.insert_anywhere(txid, &version.encode(FLAG_HEAD))?;
        trace!(table_id = self.table_id, %rid, txid, "inserted row");
        Ok(rid)
    }

    /// Overwrite the newest version of the row at `rid`, relocating it when
    /// it no longer fits.
    pub fn write_head(&self, txid: TxId, rid: RowId, version: &RowVersion) -> Result<()> {
        let head_bytes = version.encode(FLAG_HEAD);
        let moved_to = {
            let mut page = self.pool.fetch_write(self.gid(rid.page_id))?;
            let current = match page.get_record(rid.slot) {
                Some(bytes) => Some(HeapRecord::decode(bytes)?),
                None => None,
            };
            match current {
                Some(HeapRecord::Forward(target)) => Some(target),
                _ => {
                    if self.put_logged(txid, &mut page, rid.slot, Some(&head_bytes))? {
                        return Ok(());
                    }
                    None
                }
            }
        };

        let moved_bytes = version.encode(FLAG_MOVED);
        if let Some(target) = moved_to {
            let mut page = self.pool.fetch_write(self.gid(target.page_id))?;
            if self.put_logged(txid, &mut page, target.slot, Some(&moved_bytes))? {
                return Ok(());
            }
        }

        let relocated = self.insert_anywhere(txid, &moved_bytes)?;
        {
            let mut page = self.pool.fetch_write(self.gid(rid.page_id))?;
            if !self.put_logged(txid, &mut page, rid.slot, Some(&forward_bytes(relocated)))? {
                return Err(Error::InternalInvariant(format!(
                    "forward stub does not fit at {} in table {}",
                    rid, self.table_id
                )));
            }
        }
        if let Some(old) = moved_to {
            self.remove_slot(txid, old)?;
        }
        debug!(table_id = self.table_id, %rid, to = %relocated, "relocated row");
        Ok(())
    }

    /// Push a new newest version: the old head (with its `xmax` already set)
    /// is copied aside and linked from the new head. Returns the copy's slot.
    pub fn push_version(
        &self,
        txid: TxId,
        rid: RowId,
        old_head: &RowVersion,
        mut new_head: RowVersion,
    ) -> Result<RowId> {
        let copy = self.insert_anywhere(txid, &old_head.encode(0))?;
        new_head.next = Some(copy);
        if let Err(e) = self.write_head(txid, rid, &new_head) {
            self.remove_slot(txid, copy)?;
            return Err(e);
        }
        Ok(copy)
    }

    /// Empty a single slot.
    pub fn remove_slot(&self, txid: TxId, rid: RowId) -> Result<()> {
        let mut page = self.pool.fetch_write(self.gid(rid.page_id))?;
        if page.kind() == Some(PageKind::Heap) && page.get_record(rid.slot).is_some() {
            self.put_logged(txid, &mut page, rid.slot, None)?;
        }
        Ok(())
    }

    /// Remove an anchor together with the relocated version it points at.
    pub fn remove_anchor(&self, txid: TxId, rid: RowId) -> Result<()> {
        if let Some(HeapRecord::Forward(target)) = self.fetch_record(rid)? {
            self.remove_slot(txid, target)?;
        }
        self.remove_slot(txid, rid)
    }

    /// Force a slot back to a previous raw image. Anchors that no longer fit
    /// are relocated behind a forwarding stub.
    pub fn restore_image(&self, txid: TxId, rid: RowId, image: Option<&[u8]>) -> Result<()> {
        {
            let mut page = self.pool.fetch_write(self.gid(rid.page_id))?;
            if page.kind() != Some(PageKind::Heap) {
                page.reset(rid.page_id, PageKind::Heap);
            }
            if self.put_logged(txid, &mut page, rid.slot, image)? {
                return Ok(());
            }
        }
        let version = match image.map(HeapRecord::decode).transpose()? {
            Some(HeapRecord::Version { flags, version }) if flags & FLAG_HEAD != 0 => version,
            _ => {
                return Err(Error::InternalInvariant(format!(
                    "cannot restore slot {} of table {}: page full",
                    rid, self.table_id
                )))
            }
        };
        let relocated = self.insert_anywhere(txid, &version.encode(FLAG_MOVED))?;
        let mut page = self.pool.fetch_write(self.gid(rid.page_id))?;
        if !self.put_logged(txid, &mut page, rid.slot, Some(&forward_bytes(relocated)))? {
            return Err(Error::InternalInvariant(format!(
                "forward stub does not fit at {} in table {}",
                rid, self.table_id
            )));
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Scans and maintenance
    // ---------------------------------------------------------------------

    pub fn page_count(&self) -> Result<u32> {
        self.pool.disk().page_count(self.table_id)
    }

    /// Anchors stored on `page_id`, or `None` if it is not a heap page.
    pub fn anchors_on(&self, page_id: PageId) -> Result<Option<Vec<RowId>>> {
        let page = self.pool.fetch_read(self.gid(page_id))?;
        if page.kind() != Some(PageKind::Heap) {
            return Ok(None);
        }
        let mut anchors = Vec::new();
        for slot in page.live_slots() {
            if let Some(bytes) = page.get_record(slot) {
                if HeapRecord::decode(bytes)?.is_anchor() {
                    anchors.push(RowId::new(page_id, slot));
                }
            }
        }
        Ok(Some(anchors))
    }

    /// Every record on a heap page, anchors or not.
    pub fn records_on(&self, page_id: PageId) -> Result<Option<Vec<(RowId, HeapRecord)>>> {
        let page = self.pool.fetch_read(self.gid(page_id))?;
        if page.kind() != Some(PageKind::Heap) {
            return Ok(None);
        }
        let mut out = Vec::new();
        for slot in page.live_slots() {
            if let Some(bytes) = page.get_record(slot) {
                out.push((RowId::new(page_id, slot), HeapRecord::decode(bytes)?));
            }
        }
        Ok(Some(out))
    }

    /// Scan anchors in page order.
    pub fn scan(self: &Arc<Self>) -> HeapScan {
        HeapScan {
            heap: Arc::clone(self),
            next_page: 1,
            batch: VecDeque::new(),
        }
    }

    /// Record that vacuum opened up space on a page.
    pub fn note_free_space(&self, page_id: PageId) {
        self.free_space.lock().insert(page_id);
    }

    /// Return an empty heap page to the free list. The caller must exclude
    /// concurrent writers of the table.
    pub fn release_if_empty(&self, page_id: PageId) -> Result<bool> {
        {
            let page = self.pool.fetch_read(self.gid(page_id))?;
            if page.kind() != Some(PageKind::Heap) || page.live_slots().next().is_some() {
                return Ok(false);
            }
        }
        self.free_space.lock().remove(&page_id);
        {
            let mut hint = self.insert_hint.lock();
            if *hint == Some(page_id) {
                *hint = None;
            }
        }
        self.pool.free_page(self.gid(page_id))?;
        Ok(true)
    }
}

/// Lazy walk over a row's version chain
pub struct VersionChain<'a> {
    heap: &'a HeapFile,
    next: Option<RowId>,
    first: bool,
    steps: usize,
}

impl Iterator for VersionChain<'_> {
    type Item = Result<RowVersion>;

    fn next(&mut self) -> Option<Self::Item> {
        let at = self.next.take()?;
        self.steps += 1;
        if self.steps > MAX_CHAIN_LEN {
            return Some(Err(Error::InternalInvariant(format!(
                "version chain cycle at {} in table {}",
                at, self.heap.table_id
            ))));
        }
        let version = if std::mem::take(&mut self.first) {
            match self.heap.read_head(at) {
                Ok(Some((_, version))) => version,
                Ok(None) => return None,
                Err(e) => return Some(Err(e)),
            }
        } else {
            match self.heap.fetch_record(at) {
                Ok(Some(HeapRecord::Version { version, .. })) => version,
                // pruned by vacuum
                Ok(_) => return None,
                Err(e) => return Some(Err(e)),
            }
        };
        self.next = version.next;
        Some(Ok(version))
    }
}

/// Page-order iterator over row anchors. Holds no latch between pages.
pub struct HeapScan {
    heap: Arc<HeapFile>,
    next_page: PageId,
    batch: VecDeque<RowId>,
}

impl Iterator for HeapScan {
    type Item = Result<RowId>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(rid) = self.batch.pop_front() {
                return Some(Ok(rid));
            }
            let count = match self.heap.page_count() {
                Ok(count) => count,
                Err(e) => return Some(Err(e)),
            };
            if self.next_page >= count {
                return None;
            }
            let page_id = self.next_page;
            self.next_page += 1;
            match self.heap.anchors_on(page_id) {
                Ok(Some(anchors)) => self.batch.extend(anchors),
                Ok(None) => {}
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::disk::DiskManager;
    use crate::storage::tuple::Value;
    use crate::storage::wal::WalSyncMode;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Arc<HeapFile>) {
        let dir = TempDir::new().unwrap();
        let disk = Arc::new(DiskManager::new(dir.path(), 1024));
        disk.create_table_file(1).unwrap();
        let (wal, _) = Wal::open(dir.path(), WalSyncMode::Off).unwrap();
        let wal = Arc::new(wal);
        let pool = BufferPool::new(16, disk, Some(Arc::clone(&wal)));
        (dir, Arc::new(HeapFile::new(1, pool, wal)))
    }

    fn row(id: i32, name: &str) -> Tuple {
        Tuple::new(vec![Value::Int32(id), Value::from(name)])
    }

    #[test]
    fn test_insert_and_read_head() {
        let (_dir, heap) = setup();
        let rid = heap.insert(5, &RowVersion::new(5, row(1, "a"))).unwrap();
        let (at, head) = heap.read_head(rid).unwrap().unwrap();
        assert_eq!(at, rid);
        assert_eq!(head.xmin, 5);
        assert_eq!(head.xmax, INVALID_TXID);
        assert_eq!(head.tuple, row(1, "a"));
    }

    #[test]
    fn test_push_version_builds_chain() {
        let (_dir, heap) = setup();
        let rid = heap.insert(5, &RowVersion::new(5, row(1, "a"))).unwrap();
        let (_, mut old) = heap.read_head(rid).unwrap().unwrap();
        old.xmax = 6;
        heap.push_version(6, rid, &old, RowVersion::new(6, row(1, "b")))
            .unwrap();

        let chain: Vec<RowVersion> = heap.versions(rid).map(|v| v.unwrap()).collect();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].tuple, row(1, "b"));
        assert_eq!(chain[0].xmin, 6);
        assert_eq!(chain[1].tuple, row(1, "a"));
        assert_eq!(chain[1].xmax, 6);

        // only the anchor is reported by a scan
        let anchors: Vec<RowId> = heap.scan().map(|r| r.unwrap()).collect();
        assert_eq!(anchors, vec![rid]);
    }

    #[test]
    fn test_growing_row_is_forwarded() {
        let (_dir, heap) = setup();
        let mut rids = Vec::new();
        for i in 0..6 {
            let name = "x".repeat(120);
            rids.push(heap.insert(1, &RowVersion::new(1, row(i, &name))).unwrap());
        }
        let target = rids[0];
        let big = RowVersion::new(2, row(0, &"y".repeat(600)));
        heap.write_head(2, target, &big).unwrap();

        assert!(matches!(
            heap.fetch_record(target).unwrap(),
            Some(HeapRecord::Forward(_))
        ));
        let (at, head) = heap.read_head(target).unwrap().unwrap();
        assert_ne!(at, target);
        assert_eq!(head.tuple, big.tuple);

        // the relocated record is not a second anchor
        let anchors: Vec<RowId> = heap.scan().map(|r| r.unwrap()).collect();
        assert_eq!(anchors.len(), 6);

        // shrinking again rewrites the relocated record in place
        let small = RowVersion::new(3, row(0, "z"));
        heap.write_head(3, target, &small).unwrap();
        assert_eq!(heap.read_head(target).unwrap().unwrap().0, at);
    }

    #[test]
    fn test_restore_and_remove() {
        let (_dir, heap) = setup();
        let rid = heap.insert(1, &RowVersion::new(1, row(1, "a"))).unwrap();
        let image = RowVersion::new(1, row(1, "a")).encode(FLAG_HEAD);
        heap.write_head(2, rid, &RowVersion::new(2, row(1, "b"))).unwrap();
        heap.restore_image(2, rid, Some(&image)).unwrap();
        assert_eq!(heap.read_head(rid).unwrap().unwrap().1.tuple, row(1, "a"));

        heap.remove_anchor(3, rid).unwrap();
        assert!(heap.read_head(rid).unwrap().is_none());
        assert!(heap.release_if_empty(rid.page_id).unwrap());
    }

    #[test]
    fn test_writes_are_logged() {
        let (_dir, heap) = setup();
        let rid = heap.insert(9, &RowVersion::new(9, row(1, "a"))).unwrap();
        heap.wal.flush_to(u64::MAX).unwrap();
        let records = heap.wal.read_all().unwrap();
        assert_eq!(records.len(), 1);
        match &records[0].kind {
            LogRecordKind::Write {
                page_id,
                slot,
                before,
                after,
                ..
            } => {
                assert_eq!(*page_id, rid.page_id);
                assert_eq!(*slot, rid.slot);
                assert!(before.is_none());
                assert!(after.is_some());
            }
            other => panic!("unexpected record {:?}", other),
        }
        let page = heap.pool.fetch_read(heap.gid(rid.page_id)).unwrap();
        assert_eq!(page.lsn(), records[0].lsn);
    }
}

//! Buffer pool manager for EmberDB
//!
//! A fixed set of frames caches pages from every table file. Each frame's
//! `RwLock` is the page latch; a guard returned by [`BufferPool::fetch_read`]
//! or [`BufferPool::fetch_write`] holds both the latch and a pin, so a latched
//! page can never be evicted. Replacement uses the CLOCK policy and its state
//! lives under one short mutex that is never held while waiting on a latch.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};
use tracing::debug;

use super::disk::{DiskManager, TableId};
use super::page::{Page, PageId, PageKind, INVALID_PAGE_ID};
use super::wal::Wal;
use crate::error::{Error, Result};

/// A global page identifier (table_id, page_id)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GlobalPageId {
    pub table_id: TableId,
    pub page_id: PageId,
}

impl GlobalPageId {
    pub fn new(table_id: TableId, page_id: PageId) -> Self {
        Self { table_id, page_id }
    }
}

#[derive(Debug, Default)]
struct FrameState {
    page_id: Option<GlobalPageId>,
    pin_count: u32,
    referenced: bool,
}

#[derive(Debug)]
struct PoolState {
    page_table: HashMap<GlobalPageId, usize>,
    frames: Vec<FrameState>,
    free_frames: Vec<usize>,
    clock_hand: usize,
}

/// Buffer pool manager
#[derive(Debug)]
pub struct BufferPool {
    frames: Vec<Arc<RwLock<Page>>>,
    state: Mutex<PoolState>,
    disk: Arc<DiskManager>,
    wal: Option<Arc<Wal>>,
    alloc_lock: Mutex<()>,
}

/// Releases a pin when dropped
#[derive(Debug)]
struct Pin {
    pool: Arc<BufferPool>,
    frame: usize,
}

impl Drop for Pin {
    fn drop(&mut self) {
        self.pool.unpin(self.frame);
    }
}

/// Shared latch on a pinned page
pub struct PageReadGuard {
    guard: ArcRwLockReadGuard<RawRwLock, Page>,
    _pin: Pin,
    id: GlobalPageId,
}

/// Exclusive latch on a pinned page
pub struct PageWriteGuard {
    guard: ArcRwLockWriteGuard<RawRwLock, Page>,
    _pin: Pin,
    id: GlobalPageId,
}

impl PageReadGuard {
    pub fn id(&self) -> GlobalPageId {
        self.id
    }
}

impl PageWriteGuard {
    pub fn id(&self) -> GlobalPageId {
        self.id
    }
}

impl Deref for PageReadGuard {
    type Target = Page;
    fn deref(&self) -> &Page {
        &self.guard
    }
}

impl Deref for PageWriteGuard {
    type Target = Page;
    fn deref(&self) -> &Page {
        &self.guard
    }
}

impl DerefMut for PageWriteGuard {
    fn deref_mut(&mut self) -> &mut Page {
        &mut self.guard
    }
}

impl BufferPool {
    pub fn new(pool_size: usize, disk: Arc<DiskManager>, wal: Option<Arc<Wal>>) -> Arc<Self> {
        let page_size = disk.page_size();
        let pool_size = pool_size.max(8);
        let frames = (0..pool_size)
            .map(|_| {
                let mut empty = Page::new(INVALID_PAGE_ID, PageKind::Free, page_size);
                empty.clear_dirty();
                Arc::new(RwLock::new(empty))
            })
            .collect();
        let state = PoolState {
            page_table: HashMap::new(),
            frames: (0..pool_size).map(|_| FrameState::default()).collect(),
            free_frames: (0..pool_size).rev().collect(),
            clock_hand: 0,
        };
        Arc::new(Self {
            frames,
            state: Mutex::new(state),
            disk,
            wal,
            alloc_lock: Mutex::new(()),
        })
    }

    pub fn disk(&self) -> &Arc<DiskManager> {
        &self.disk
    }

    pub fn page_size(&self) -> usize {
        self.disk.page_size()
    }

    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    fn unpin(&self, frame: usize) {
        let mut state = self.state.lock();
        let fs = &mut state.frames[frame];
        fs.pin_count = fs.pin_count.saturating_sub(1);
    }

    /// Write a page back to its file, forcing the log first for heap pages.
    fn write_back(&self, id: GlobalPageId, page: &mut Page) -> Result<()> {
        if page.kind() == Some(PageKind::Heap) {
            if let Some(wal) = &self.wal {
                wal.flush_to(page.lsn())?;
            }
        }
        self.disk.write_page(id.table_id, page)
    }

    /// CLOCK sweep. Caller holds the state mutex.
    fn find_victim(&self, state: &mut PoolState) -> Result<usize> {
        if let Some(frame) = state.free_frames.pop() {
            return Ok(frame);
        }
        let n = state.frames.len();
        for _ in 0..2 * n {
            let hand = state.clock_hand;
            state.clock_hand = (hand + 1) % n;
            let fs = &mut state.frames[hand];
            if fs.pin_count > 0 {
                continue;
            }
            if fs.referenced {
                fs.referenced = false;
                continue;
            }
            if let Some(old) = fs.page_id.take() {
                // unpinned frames have no latch holders
                let mut page = self.frames[hand].write();
                if page.is_dirty() {
                    debug!(table_id = old.table_id, page_id = old.page_id, "evicting dirty page");
                    if let Err(e) = self.write_back(old, &mut page) {
                        state.frames[hand].page_id = Some(old);
                        return Err(e);
                    }
                }
                state.page_table.remove(&old);
            }
            return Ok(hand);
        }
        Err(Error::NoSpace(format!(
            "buffer pool exhausted: all {} frames pinned",
            n
        )))
    }

    /// Pin the frame holding `id`, loading it from disk on a miss.
    fn pin(&self, id: GlobalPageId) -> Result<usize> {
        let mut state = self.state.lock();
        if let Some(&frame) = state.page_table.get(&id) {
            let fs = &mut state.frames[frame];
            fs.pin_count += 1;
            fs.referenced = true;
            return Ok(frame);
        }
        let frame = self.find_victim(&mut state)?;
        let page = match self.disk.read_page(id.table_id, id.page_id) {
            Ok(page) => page,
            Err(e) => {
                state.free_frames.push(frame);
                return Err(e);
            }
        };
        *self.frames[frame].write() = page;
        self.install(&mut state, frame, id);
        Ok(frame)
    }

    fn install(&self, state: &mut PoolState, frame: usize, id: GlobalPageId) {
        state.page_table.insert(id, frame);
        let fs = &mut state.frames[frame];
        fs.page_id = Some(id);
        fs.pin_count = 1;
        fs.referenced = true;
    }

    pub fn fetch_read(self: &Arc<Self>, id: GlobalPageId) -> Result<PageReadGuard> {
        let frame = self.pin(id)?;
        let pin = Pin {
            pool: Arc::clone(self),
            frame,
        };
        let guard = self.frames[frame].read_arc();
        Ok(PageReadGuard {
            guard,
            _pin: pin,
            id,
        })
    }

    pub fn fetch_write(self: &Arc<Self>, id: GlobalPageId) -> Result<PageWriteGuard> {
        let frame = self.pin(id)?;
        let pin = Pin {
            pool: Arc::clone(self),
            frame,
        };
        let guard = self.frames[frame].write_arc();
        Ok(PageWriteGuard {
            guard,
            _pin: pin,
            id,
        })
    }

    /// Allocate a page of `kind`, reusing the table's free list first.
    pub fn allocate_page(self: &Arc<Self>, table_id: TableId, kind: PageKind) -> Result<PageWriteGuard> {
        let _alloc = self.alloc_lock.lock();
        let head = self.disk.meta(table_id)?.free_list_head;
        if head != INVALID_PAGE_ID {
            let mut guard = self.fetch_write(GlobalPageId::new(table_id, head))?;
            let next = free_list_next(&guard);
            self.disk.update_meta(table_id, |m| m.free_list_head = next)?;
            guard.reset(head, kind);
            return Ok(guard);
        }

        let page = self.disk.extend(table_id, kind)?;
        let id = GlobalPageId::new(table_id, page.page_id());
        let frame = {
            let mut state = self.state.lock();
            let frame = self.find_victim(&mut state)?;
            *self.frames[frame].write() = page;
            self.install(&mut state, frame, id);
            frame
        };
        let pin = Pin {
            pool: Arc::clone(self),
            frame,
        };
        let guard = self.frames[frame].write_arc();
        Ok(PageWriteGuard {
            guard,
            _pin: pin,
            id,
        })
    }

    /// Return a page to its table's free list. The caller must not hold its latch.
    pub fn free_page(self: &Arc<Self>, id: GlobalPageId) -> Result<()> {
        let _alloc = self.alloc_lock.lock();
        let head = self.disk.meta(id.table_id)?.free_list_head;
        {
            let mut guard = self.fetch_write(id)?;
            guard.reset(id.page_id, PageKind::Free);
            set_free_list_next(&mut guard, head);
            // the link must be durable before the metadata points at it
            self.write_back(id, &mut guard)?;
        }
        self.disk
            .update_meta(id.table_id, |m| m.free_list_head = id.page_id)?;
        debug!(table_id = id.table_id, page_id = id.page_id, "freed page");
        Ok(())
    }

    fn pinned_frames(self: &Arc<Self>, filter: impl Fn(&GlobalPageId) -> bool) -> Vec<(Pin, GlobalPageId)> {
        let mut state = self.state.lock();
        let mut out = Vec::new();
        for frame in 0..state.frames.len() {
            let fs = &mut state.frames[frame];
            if let Some(id) = fs.page_id {
                if filter(&id) {
                    fs.pin_count += 1;
                    out.push((
                        Pin {
                            pool: Arc::clone(self),
                            frame,
                        },
                        id,
                    ));
                }
            }
        }
        out
    }

    pub fn flush_page(self: &Arc<Self>, id: GlobalPageId) -> Result<()> {
        for (pin, pid) in self.pinned_frames(|p| *p == id) {
            let mut page = self.frames[pin.frame].write();
            if page.is_dirty() {
                self.write_back(pid, &mut page)?;
            }
        }
        Ok(())
    }

    /// Flush every dirty page, or only those of `table_id` when given.
    pub fn flush_all(self: &Arc<Self>, table_id: Option<TableId>) -> Result<usize> {
        let mut written = 0;
        for (pin, id) in self.pinned_frames(|p| table_id.map_or(true, |t| p.table_id == t)) {
            let mut page = self.frames[pin.frame].write();
            if page.is_dirty() {
                self.write_back(id, &mut page)?;
                written += 1;
            }
        }
        Ok(written)
    }

    /// Drop every cached page of a table without writing it back.
    pub fn discard_table(&self, table_id: TableId) {
        let mut state = self.state.lock();
        let victims: Vec<(GlobalPageId, usize)> = state
            .page_table
            .iter()
            .filter(|(id, _)| id.table_id == table_id)
            .map(|(id, f)| (*id, *f))
            .collect();
        for (id, frame) in victims {
            state.page_table.remove(&id);
            let fs = &mut state.frames[frame];
            fs.page_id = None;
            fs.referenced = false;
            if fs.pin_count == 0 {
                state.free_frames.push(frame);
            }
        }
    }

    pub fn dirty_pages(&self) -> usize {
        self.frames.iter().filter(|f| f.read().is_dirty()).count()
    }
}

fn free_list_next(page: &Page) -> PageId {
    let body = page.body();
    u32::from_le_bytes([body[0], body[1], body[2], body[3]])
}

fn set_free_list_next(page: &mut Page, next: PageId) {
    page.body_mut()[..4].copy_from_slice(&next.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup(frames: usize) -> (TempDir, Arc<BufferPool>) {
        let dir = TempDir::new().unwrap();
        let disk = Arc::new(DiskManager::new(dir.path(), 1024));
        disk.create_table_file(1).unwrap();
        (dir, BufferPool::new(frames, disk, None))
    }

    #[test]
    fn test_allocate_and_fetch() {
        let (_dir, pool) = setup(8);
        let id = {
            let mut page = pool.allocate_page(1, PageKind::Heap).unwrap();
            page.insert_record(b"hello").unwrap();
            page.id()
        };
        let page = pool.fetch_read(id).unwrap();
        assert_eq!(page.get_record(0), Some(&b"hello"[..]));
    }

    #[test]
    fn test_eviction_writes_back() {
        let (_dir, pool) = setup(8);
        let mut ids = Vec::new();
        for i in 0..20u8 {
            let mut page = pool.allocate_page(1, PageKind::Heap).unwrap();
            page.insert_record(&[i; 10]).unwrap();
            ids.push(page.id());
        }
        for (i, id) in ids.iter().enumerate() {
            let page = pool.fetch_read(*id).unwrap();
            assert_eq!(page.get_record(0).unwrap(), &[i as u8; 10][..]);
        }
    }

    #[test]
    fn test_all_pinned_is_no_space() {
        let (_dir, pool) = setup(8);
        let mut held = Vec::new();
        for _ in 0..8 {
            held.push(pool.allocate_page(1, PageKind::Heap).unwrap());
        }
        assert!(matches!(
            pool.allocate_page(1, PageKind::Heap),
            Err(Error::NoSpace(_))
        ));
        drop(held);
        assert!(pool.allocate_page(1, PageKind::Heap).is_ok());
    }

    #[test]
    fn test_free_list_reuse() {
        let (_dir, pool) = setup(8);
        let first = pool.allocate_page(1, PageKind::Heap).unwrap().id();
        let _second = pool.allocate_page(1, PageKind::Heap).unwrap().id();
        pool.free_page(first).unwrap();
        let again = pool.allocate_page(1, PageKind::BTreeLeaf).unwrap();
        assert_eq!(again.id(), first);
        assert_eq!(again.kind(), Some(PageKind::BTreeLeaf));
    }

    #[test]
    fn test_flush_all_clears_dirty() {
        let (_dir, pool) = setup(8);
        {
            let mut page = pool.allocate_page(1, PageKind::Heap).unwrap();
            page.insert_record(b"x").unwrap();
        }
        assert!(pool.dirty_pages() >= 1);
        pool.flush_all(None).unwrap();
        assert_eq!(pool.dirty_pages(), 0);
    }
}

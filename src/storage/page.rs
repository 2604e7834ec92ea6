//! Page management for EmberDB
//!
//! A page is a fixed-size block laid out as:
//!
//! ```text
//! +--------------------+----------------+ .... +--------------+-------+
//! | header (24 bytes)  | slot directory | free | record data  | CRC32 |
//! +--------------------+----------------+ .... +--------------+-------+
//! ```
//!
//! The slot directory grows forward from the header and record data grows
//! backward from the trailer. B+tree, metadata and free pages reuse the same
//! header and trailer but treat the space between them as an opaque body.

use byteorder::{ByteOrder, LittleEndian};

/// Default page size in bytes (8KB)
pub const DEFAULT_PAGE_SIZE: usize = 8192;
pub const MIN_PAGE_SIZE: usize = 1024;
pub const MAX_PAGE_SIZE: usize = 32768;

/// Page header size
pub const PAGE_HEADER_SIZE: usize = 24;

/// CRC32 trailer size
pub const PAGE_TRAILER_SIZE: usize = 4;

const SLOT_SIZE: usize = 4;

/// Page ID type
pub type PageId = u32;

/// Special page ID for invalid/unallocated pages
pub const INVALID_PAGE_ID: PageId = u32::MAX;

/// Header field offsets
const OFF_PAGE_ID: usize = 0;
const OFF_KIND: usize = 4;
const OFF_SLOT_COUNT: usize = 6;
const OFF_FREE_PTR: usize = 8;
const OFF_LSN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    Free = 0,
    Meta = 1,
    Heap = 2,
    BTreeInternal = 3,
    BTreeLeaf = 4,
}

impl PageKind {
    pub fn from_u8(v: u8) -> Option<PageKind> {
        match v {
            0 => Some(PageKind::Free),
            1 => Some(PageKind::Meta),
            2 => Some(PageKind::Heap),
            3 => Some(PageKind::BTreeInternal),
            4 => Some(PageKind::BTreeLeaf),
            _ => None,
        }
    }
}

/// A database page
#[derive(Debug, Clone)]
pub struct Page {
    data: Vec<u8>,
    dirty: bool,
}

impl Page {
    /// Create a new empty page of the given kind
    pub fn new(page_id: PageId, kind: PageKind, page_size: usize) -> Self {
        let mut page = Self {
            data: vec![0u8; page_size],
            dirty: true,
        };
        page.reset(page_id, kind);
        page
    }

    /// Wrap raw bytes read from disk. The checksum is not verified here.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            data: bytes,
            dirty: false,
        }
    }

    /// Reinitialise the page in place, dropping all content but keeping the LSN.
    pub fn reset(&mut self, page_id: PageId, kind: PageKind) {
        let lsn = self.lsn();
        self.data.fill(0);
        LittleEndian::write_u32(&mut self.data[OFF_PAGE_ID..], page_id);
        self.data[OFF_KIND] = kind as u8;
        LittleEndian::write_u16(&mut self.data[OFF_SLOT_COUNT..], 0);
        let end = self.data_end() as u32;
        LittleEndian::write_u32(&mut self.data[OFF_FREE_PTR..], end);
        LittleEndian::write_u64(&mut self.data[OFF_LSN..], lsn);
        self.dirty = true;
    }

    pub fn page_size(&self) -> usize {
        self.data.len()
    }

    pub fn page_id(&self) -> PageId {
        LittleEndian::read_u32(&self.data[OFF_PAGE_ID..])
    }

    pub fn kind(&self) -> Option<PageKind> {
        PageKind::from_u8(self.data[OFF_KIND])
    }

    pub fn lsn(&self) -> u64 {
        LittleEndian::read_u64(&self.data[OFF_LSN..])
    }

    pub fn set_lsn(&mut self, lsn: u64) {
        LittleEndian::write_u64(&mut self.data[OFF_LSN..], lsn);
        self.dirty = true;
    }

    pub fn slot_count(&self) -> u16 {
        LittleEndian::read_u16(&self.data[OFF_SLOT_COUNT..])
    }

    fn set_slot_count(&mut self, count: u16) {
        LittleEndian::write_u16(&mut self.data[OFF_SLOT_COUNT..], count);
    }

    pub fn free_space_ptr(&self) -> usize {
        LittleEndian::read_u32(&self.data[OFF_FREE_PTR..]) as usize
    }

    fn set_free_space_ptr(&mut self, ptr: usize) {
        LittleEndian::write_u32(&mut self.data[OFF_FREE_PTR..], ptr as u32);
    }

    fn data_end(&self) -> usize {
        self.data.len() - PAGE_TRAILER_SIZE
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    // ---------------------------------------------------------------------
    // Checksums
    // ---------------------------------------------------------------------

    fn compute_checksum(&self) -> u32 {
        crc32fast::hash(&self.data[..self.data_end()])
    }

    /// Stamp the CRC32 trailer and return the bytes to write.
    pub fn seal(&mut self) -> &[u8] {
        let crc = self.compute_checksum();
        let end = self.data_end();
        LittleEndian::write_u32(&mut self.data[end..], crc);
        &self.data
    }

    pub fn verify_checksum(&self) -> bool {
        let stored = LittleEndian::read_u32(&self.data[self.data_end()..]);
        stored == self.compute_checksum()
    }

    // ---------------------------------------------------------------------
    // Opaque body (B+tree nodes, metadata, free-list links)
    // ---------------------------------------------------------------------

    pub fn body(&self) -> &[u8] {
        let end = self.data_end();
        &self.data[PAGE_HEADER_SIZE..end]
    }

    pub fn body_mut(&mut self) -> &mut [u8] {
        self.dirty = true;
        let end = self.data_end();
        &mut self.data[PAGE_HEADER_SIZE..end]
    }

    pub fn body_capacity(page_size: usize) -> usize {
        page_size - PAGE_HEADER_SIZE - PAGE_TRAILER_SIZE
    }

    // ---------------------------------------------------------------------
    // Slotted records
    // ---------------------------------------------------------------------

    fn slot(&self, slot: u16) -> (usize, usize) {
        let at = PAGE_HEADER_SIZE + slot as usize * SLOT_SIZE;
        let offset = LittleEndian::read_u16(&self.data[at..]) as usize;
        let len = LittleEndian::read_u16(&self.data[at + 2..]) as usize;
        (offset, len)
    }

    fn set_slot(&mut self, slot: u16, offset: usize, len: usize) {
        let at = PAGE_HEADER_SIZE + slot as usize * SLOT_SIZE;
        LittleEndian::write_u16(&mut self.data[at..], offset as u16);
        LittleEndian::write_u16(&mut self.data[at + 2..], len as u16);
    }

    fn slot_dir_end(&self) -> usize {
        PAGE_HEADER_SIZE + self.slot_count() as usize * SLOT_SIZE
    }

    /// Contiguous gap between the slot directory and record data.
    pub fn free_space(&self) -> usize {
        self.free_space_ptr().saturating_sub(self.slot_dir_end())
    }

    fn live_bytes(&self) -> usize {
        (0..self.slot_count())
            .map(|s| self.slot(s))
            .filter(|(off, _)| *off != 0)
            .map(|(_, len)| len)
            .sum()
    }

    /// Free space once fragmented holes are compacted away.
    pub fn reclaimable_space(&self) -> usize {
        self.data_end() - self.slot_dir_end() - self.live_bytes()
    }

    /// Largest record a fresh heap page of this size can hold.
    pub fn max_record_size(page_size: usize) -> usize {
        page_size - PAGE_HEADER_SIZE - PAGE_TRAILER_SIZE - SLOT_SIZE
    }

    fn first_empty_slot(&self) -> Option<u16> {
        (0..self.slot_count()).find(|&s| self.slot(s).0 == 0)
    }

    /// Whether `len` bytes can be inserted, possibly after compaction.
    pub fn can_insert(&self, len: usize) -> bool {
        let dir_growth = if self.first_empty_slot().is_some() {
            0
        } else {
            SLOT_SIZE
        };
        self.reclaimable_space() >= len + dir_growth
    }

    /// Rewrite record data contiguously at the end of the page.
    pub fn compact(&mut self) {
        let records: Vec<(u16, Vec<u8>)> = (0..self.slot_count())
            .filter_map(|s| self.get_record(s).map(|r| (s, r.to_vec())))
            .collect();
        let mut ptr = self.data_end();
        for (slot, bytes) in records {
            ptr -= bytes.len();
            self.data[ptr..ptr + bytes.len()].copy_from_slice(&bytes);
            self.set_slot(slot, ptr, bytes.len());
        }
        self.set_free_space_ptr(ptr);
        self.dirty = true;
    }

    fn place(&mut self, slot: u16, bytes: &[u8]) {
        let ptr = self.free_space_ptr() - bytes.len();
        self.data[ptr..ptr + bytes.len()].copy_from_slice(bytes);
        self.set_slot(slot, ptr, bytes.len());
        self.set_free_space_ptr(ptr);
        self.dirty = true;
    }

    /// Insert a record, returning its slot number.
    pub fn insert_record(&mut self, bytes: &[u8]) -> Option<u16> {
        if bytes.is_empty() || !self.can_insert(bytes.len()) {
            return None;
        }
        let slot = match self.first_empty_slot() {
            Some(s) => s,
            None => {
                let s = self.slot_count();
                self.set_slot_count(s + 1);
                self.set_slot(s, 0, 0);
                s
            }
        };
        if self.free_space() < bytes.len() {
            self.compact();
        }
        self.place(slot, bytes);
        Some(slot)
    }

    pub fn get_record(&self, slot: u16) -> Option<&[u8]> {
        if slot >= self.slot_count() {
            return None;
        }
        let (offset, len) = self.slot(slot);
        if offset == 0 {
            return None;
        }
        Some(&self.data[offset..offset + len])
    }

    /// Replace a record in place. Returns false when it does not fit.
    pub fn update_record(&mut self, slot: u16, bytes: &[u8]) -> bool {
        if self.get_record(slot).is_none() || bytes.is_empty() {
            return false;
        }
        let (offset, len) = self.slot(slot);
        if bytes.len() <= len {
            self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
            self.set_slot(slot, offset, bytes.len());
            self.dirty = true;
            return true;
        }
        if self.reclaimable_space() + len < bytes.len() {
            return false;
        }
        self.set_slot(slot, 0, 0);
        if self.free_space() < bytes.len() {
            self.compact();
        }
        self.place(slot, bytes);
        true
    }

    pub fn delete_record(&mut self, slot: u16) -> bool {
        if self.get_record(slot).is_none() {
            return false;
        }
        self.set_slot(slot, 0, 0);
        self.dirty = true;
        true
    }

    /// Force the content of a specific slot, growing the directory if needed.
    /// Used by recovery to replay and undo slot images.
    pub fn put_record(&mut self, slot: u16, bytes: Option<&[u8]>) -> bool {
        let existing = self.get_record(slot).map(|r| r.len()).unwrap_or(0);
        match bytes {
            None => {
                if existing > 0 {
                    self.delete_record(slot);
                }
                true
            }
            Some(bytes) => {
                let dir_growth = (slot as usize + 1).saturating_sub(self.slot_count() as usize) * SLOT_SIZE;
                if self.reclaimable_space() + existing < bytes.len() + dir_growth {
                    return false;
                }
                if slot >= self.slot_count() {
                    for s in self.slot_count()..=slot {
                        self.set_slot(s, 0, 0);
                    }
                    self.set_slot_count(slot + 1);
                }
                if existing > 0 {
                    return self.update_record(slot, bytes);
                }
                if self.free_space() < bytes.len() {
                    self.compact();
                }
                self.place(slot, bytes);
                true
            }
        }
    }

    /// Slots currently holding a record
    pub fn live_slots(&self) -> impl Iterator<Item = u16> + '_ {
        (0..self.slot_count()).filter(move |&s| self.slot(s).0 != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_creation() {
        let page = Page::new(3, PageKind::Heap, 1024);
        assert_eq!(page.page_id(), 3);
        assert_eq!(page.kind(), Some(PageKind::Heap));
        assert_eq!(page.slot_count(), 0);
        assert_eq!(page.free_space_ptr(), 1024 - PAGE_TRAILER_SIZE);
        assert!(page.is_dirty());
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let mut page = Page::new(1, PageKind::Heap, 1024);
        page.insert_record(b"hello").unwrap();
        let mut bytes = page.seal().to_vec();
        assert!(Page::from_bytes(bytes.clone()).verify_checksum());
        bytes[100] ^= 0xFF;
        assert!(!Page::from_bytes(bytes).verify_checksum());
    }

    #[test]
    fn test_insert_get_delete_reuses_slot() {
        let mut page = Page::new(1, PageKind::Heap, 1024);
        let a = page.insert_record(b"alpha").unwrap();
        let b = page.insert_record(b"beta").unwrap();
        assert_eq!(page.get_record(a), Some(&b"alpha"[..]));
        assert!(page.delete_record(a));
        assert_eq!(page.get_record(a), None);
        let c = page.insert_record(b"gamma").unwrap();
        assert_eq!(c, a);
        assert_eq!(page.get_record(b), Some(&b"beta"[..]));
        assert_eq!(page.live_slots().count(), 2);
    }

    #[test]
    fn test_update_grows_with_compaction() {
        let mut page = Page::new(1, PageKind::Heap, 1024);
        let big = vec![7u8; 400];
        let a = page.insert_record(&big).unwrap();
        let b = page.insert_record(&big).unwrap();
        page.delete_record(a);
        // growing b needs the hole left by a
        let bigger = vec![9u8; 700];
        assert!(page.update_record(b, &bigger));
        assert_eq!(page.get_record(b).unwrap(), &bigger[..]);
        assert!(!page.update_record(b, &vec![1u8; 2000]));
    }

    #[test]
    fn test_page_full() {
        let mut page = Page::new(1, PageKind::Heap, 1024);
        let rec = vec![1u8; 100];
        let mut n = 0;
        while page.insert_record(&rec).is_some() {
            n += 1;
        }
        assert_eq!(n, (1024 - PAGE_HEADER_SIZE - PAGE_TRAILER_SIZE) / 104);
        assert!(!page.can_insert(100));
    }

    #[test]
    fn test_put_record_at_slot() {
        let mut page = Page::new(1, PageKind::Heap, 1024);
        assert!(page.put_record(4, Some(b"late")));
        assert_eq!(page.slot_count(), 5);
        assert_eq!(page.get_record(4), Some(&b"late"[..]));
        assert!(page.put_record(4, None));
        assert_eq!(page.get_record(4), None);
    }
}

//! Metadata header page
//!
//! Page 0 of every table file describes the file: format magic and version,
//! page size, primary index root, free-list head, owning table, and the last
//! LSN / transaction id known to be durable at the latest checkpoint.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};
use crate::storage::page::{Page, PageId, PageKind, INVALID_PAGE_ID};

pub const META_MAGIC: u32 = 0x454D_4252; // "EMBR"
pub const META_VERSION: u32 = 1;
pub const META_PAGE_ID: PageId = 0;

const META_LEN: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaPage {
    pub magic: u32,
    pub version: u32,
    pub page_size: u32,
    pub root_page_id: PageId,
    pub free_list_head: PageId,
    pub table_id: u32,
    pub last_lsn: u64,
    pub last_txid: u64,
}

impl MetaPage {
    pub fn new(table_id: u32, page_size: usize) -> Self {
        Self {
            magic: META_MAGIC,
            version: META_VERSION,
            page_size: page_size as u32,
            root_page_id: INVALID_PAGE_ID,
            free_list_head: INVALID_PAGE_ID,
            table_id,
            last_lsn: 0,
            last_txid: 0,
        }
    }

    fn encode_fields(&self, buf: &mut [u8]) {
        LittleEndian::write_u32(&mut buf[0..], self.magic);
        LittleEndian::write_u32(&mut buf[4..], self.version);
        LittleEndian::write_u32(&mut buf[8..], self.page_size);
        LittleEndian::write_u32(&mut buf[12..], self.root_page_id);
        LittleEndian::write_u32(&mut buf[16..], self.free_list_head);
        LittleEndian::write_u32(&mut buf[20..], self.table_id);
        LittleEndian::write_u64(&mut buf[24..], self.last_lsn);
        LittleEndian::write_u64(&mut buf[32..], self.last_txid);
    }

    /// Render into a full page, including the field checksum.
    pub fn to_page(&self) -> Page {
        let mut page = Page::new(META_PAGE_ID, PageKind::Meta, self.page_size as usize);
        let body = page.body_mut();
        self.encode_fields(&mut body[..META_LEN]);
        let checksum = crc32fast::hash(&body[..META_LEN]);
        LittleEndian::write_u32(&mut body[META_LEN..], checksum);
        page
    }

    pub fn from_page(page: &Page) -> Result<Self> {
        let body = page.body();
        let corrupt = || Error::CorruptPage {
            table_id: LittleEndian::read_u32(&body[20..]),
            page_id: META_PAGE_ID,
        };
        if page.kind() != Some(PageKind::Meta) {
            return Err(corrupt());
        }
        let stored = LittleEndian::read_u32(&body[META_LEN..]);
        if stored != crc32fast::hash(&body[..META_LEN]) {
            return Err(corrupt());
        }
        let meta = Self {
            magic: LittleEndian::read_u32(&body[0..]),
            version: LittleEndian::read_u32(&body[4..]),
            page_size: LittleEndian::read_u32(&body[8..]),
            root_page_id: LittleEndian::read_u32(&body[12..]),
            free_list_head: LittleEndian::read_u32(&body[16..]),
            table_id: LittleEndian::read_u32(&body[20..]),
            last_lsn: LittleEndian::read_u64(&body[24..]),
            last_txid: LittleEndian::read_u64(&body[32..]),
        };
        if meta.magic != META_MAGIC || meta.version != META_VERSION {
            return Err(corrupt());
        }
        Ok(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_round_trip() {
        let mut meta = MetaPage::new(7, 4096);
        meta.root_page_id = 1;
        meta.last_lsn = 99;
        let page = meta.to_page();
        assert_eq!(MetaPage::from_page(&page).unwrap(), meta);
    }

    #[test]
    fn test_meta_checksum_mismatch() {
        let meta = MetaPage::new(7, 4096);
        let mut page = meta.to_page();
        page.body_mut()[13] ^= 0x01;
        assert!(matches!(
            MetaPage::from_page(&page),
            Err(Error::CorruptPage { page_id: 0, .. })
        ));
    }
}

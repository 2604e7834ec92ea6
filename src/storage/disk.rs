//! Disk manager for EmberDB
//!
//! One file per table (`table_<id>.db`). Page 0 of each file is the
//! [`MetaPage`]; the manager keeps the decoded metadata and the page count
//! of every open file in memory.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::storage::meta::{MetaPage, META_PAGE_ID};
use crate::storage::page::{Page, PageId, PageKind, PAGE_HEADER_SIZE};

pub type TableId = u32;

const ENOSPC: i32 = 28;

#[derive(Debug)]
struct TableFile {
    file: File,
    meta: MetaPage,
    page_count: u32,
}

/// Disk manager
#[derive(Debug)]
pub struct DiskManager {
    data_dir: PathBuf,
    page_size: usize,
    files: Mutex<HashMap<TableId, TableFile>>,
}

impl DiskManager {
    pub fn new(data_dir: impl AsRef<Path>, page_size: usize) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            page_size,
            files: Mutex::new(HashMap::new()),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn table_path(&self, table_id: TableId) -> PathBuf {
        self.data_dir.join(format!("table_{}.db", table_id))
    }

    /// Read the page size recorded in an existing table file.
    pub fn probe_page_size(path: &Path) -> Result<Option<usize>> {
        if !path.exists() {
            return Ok(None);
        }
        let mut file = File::open(path)?;
        let mut head = vec![0u8; 64];
        if file.read(&mut head)? < 64 {
            return Ok(None);
        }
        // page_size sits after the page header, magic and version
        let page_size = LittleEndian::read_u32(&head[PAGE_HEADER_SIZE + 8..]);
        Ok(Some(page_size as usize))
    }

    /// Create a new table file with a fresh metadata page.
    pub fn create_table_file(&self, table_id: TableId) -> Result<MetaPage> {
        let path = self.table_path(table_id);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        let meta = MetaPage::new(table_id, self.page_size);
        let mut page = meta.to_page();
        file.write_all(page.seal())?;
        file.sync_data()?;
        debug!(table_id, path = %path.display(), "created table file");
        self.files.lock().insert(
            table_id,
            TableFile {
                file,
                meta,
                page_count: 1,
            },
        );
        Ok(meta)
    }

    /// Open an existing table file and validate its metadata page.
    pub fn open_table_file(&self, table_id: TableId) -> Result<MetaPage> {
        if let Some(tf) = self.files.lock().get(&table_id) {
            return Ok(tf.meta);
        }
        let path = self.table_path(table_id);
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let len = file.metadata()?.len();
        let mut bytes = vec![0u8; self.page_size];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut bytes)?;
        let page = Page::from_bytes(bytes);
        if !page.verify_checksum() {
            warn!(table_id, "metadata page failed CRC check");
            return Err(Error::CorruptPage {
                table_id,
                page_id: META_PAGE_ID,
            });
        }
        let meta = MetaPage::from_page(&page)?;
        if meta.table_id != table_id || meta.page_size as usize != self.page_size {
            return Err(Error::CorruptPage {
                table_id,
                page_id: META_PAGE_ID,
            });
        }
        let page_count = (len / self.page_size as u64) as u32;
        self.files.lock().insert(
            table_id,
            TableFile {
                file,
                meta,
                page_count,
            },
        );
        Ok(meta)
    }

    pub fn remove_table_file(&self, table_id: TableId) -> Result<()> {
        self.files.lock().remove(&table_id);
        let path = self.table_path(table_id);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    fn with_file<T>(
        &self,
        table_id: TableId,
        f: impl FnOnce(&mut TableFile) -> Result<T>,
    ) -> Result<T> {
        let mut files = self.files.lock();
        let tf = files
            .get_mut(&table_id)
            .ok_or_else(|| Error::InternalInvariant(format!("table file {} not open", table_id)))?;
        f(tf)
    }

    pub fn meta(&self, table_id: TableId) -> Result<MetaPage> {
        self.with_file(table_id, |tf| Ok(tf.meta))
    }

    /// Update the metadata page and write it through to disk.
    pub fn update_meta(&self, table_id: TableId, f: impl FnOnce(&mut MetaPage)) -> Result<()> {
        self.with_file(table_id, |tf| {
            f(&mut tf.meta);
            let mut page = tf.meta.to_page();
            tf.file.seek(SeekFrom::Start(0))?;
            tf.file.write_all(page.seal())?;
            Ok(())
        })
    }

    pub fn page_count(&self, table_id: TableId) -> Result<u32> {
        self.with_file(table_id, |tf| Ok(tf.page_count))
    }

    /// Read a page, verifying its CRC trailer.
    pub fn read_page(&self, table_id: TableId, page_id: PageId) -> Result<Page> {
        let page_size = self.page_size;
        let page = self.with_file(table_id, |tf| {
            if page_id >= tf.page_count {
                return Err(Error::InternalInvariant(format!(
                    "page {} beyond end of table {}",
                    page_id, table_id
                )));
            }
            let mut bytes = vec![0u8; page_size];
            tf.file
                .seek(SeekFrom::Start(page_id as u64 * page_size as u64))?;
            tf.file.read_exact(&mut bytes)?;
            Ok(Page::from_bytes(bytes))
        })?;
        if !page.verify_checksum() || page.page_id() != page_id {
            warn!(table_id, page_id, "page failed CRC check");
            return Err(Error::CorruptPage { table_id, page_id });
        }
        Ok(page)
    }

    pub fn write_page(&self, table_id: TableId, page: &mut Page) -> Result<()> {
        let page_id = page.page_id();
        let page_size = self.page_size;
        self.with_file(table_id, |tf| {
            tf.file
                .seek(SeekFrom::Start(page_id as u64 * page_size as u64))?;
            tf.file.write_all(page.seal())?;
            if page_id >= tf.page_count {
                tf.page_count = page_id + 1;
            }
            Ok(())
        })?;
        page.clear_dirty();
        Ok(())
    }

    /// Append a new page of `kind` to the file and return it.
    pub fn extend(&self, table_id: TableId, kind: PageKind) -> Result<Page> {
        let page_size = self.page_size;
        self.with_file(table_id, |tf| {
            let page_id = tf.page_count;
            let mut page = Page::new(page_id, kind, page_size);
            tf.file
                .seek(SeekFrom::Start(page_id as u64 * page_size as u64))?;
            tf.file.write_all(page.seal()).map_err(|e| {
                if e.raw_os_error() == Some(ENOSPC) {
                    Error::NoSpace(format!("table {} file cannot grow", table_id))
                } else {
                    e.into()
                }
            })?;
            tf.page_count += 1;
            Ok(page)
        })
    }

    pub fn sync_all(&self) -> Result<()> {
        let files = self.files.lock();
        for tf in files.values() {
            tf.file.sync_data()?;
        }
        Ok(())
    }

    pub fn open_tables(&self) -> Vec<TableId> {
        let mut ids: Vec<_> = self.files.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_extend_read_write() {
        let dir = TempDir::new().unwrap();
        let disk = DiskManager::new(dir.path(), 1024);
        disk.create_table_file(1).unwrap();
        assert_eq!(disk.page_count(1).unwrap(), 1);

        let mut page = disk.extend(1, PageKind::Heap).unwrap();
        assert_eq!(page.page_id(), 1);
        page.insert_record(b"row").unwrap();
        disk.write_page(1, &mut page).unwrap();

        let read = disk.read_page(1, 1).unwrap();
        assert_eq!(read.get_record(0), Some(&b"row"[..]));
    }

    #[test]
    fn test_reopen_and_meta_update() {
        let dir = TempDir::new().unwrap();
        {
            let disk = DiskManager::new(dir.path(), 1024);
            disk.create_table_file(4).unwrap();
            disk.update_meta(4, |m| m.root_page_id = 9).unwrap();
        }
        let disk = DiskManager::new(dir.path(), 1024);
        let meta = disk.open_table_file(4).unwrap();
        assert_eq!(meta.root_page_id, 9);
        assert_eq!(
            DiskManager::probe_page_size(&disk.table_path(4)).unwrap(),
            Some(1024)
        );
    }

    #[test]
    fn test_corrupt_page_detected() {
        let dir = TempDir::new().unwrap();
        let disk = DiskManager::new(dir.path(), 1024);
        disk.create_table_file(2).unwrap();
        let mut page = disk.extend(2, PageKind::Heap).unwrap();
        disk.write_page(2, &mut page).unwrap();
        drop(disk);

        let path = dir.path().join("table_2.db");
        let mut bytes = fs::read(&path).unwrap();
        bytes[1024 + 200] ^= 0xAA;
        fs::write(&path, bytes).unwrap();

        let disk = DiskManager::new(dir.path(), 1024);
        disk.open_table_file(2).unwrap();
        assert!(matches!(
            disk.read_page(2, 1),
            Err(Error::CorruptPage { page_id: 1, .. })
        ));
    }
}

//! Write-Ahead Log (WAL) Manager
//!
//! Every heap slot change is logged as a physical before/after image before
//! the page is touched. Records are framed as
//! `[u32 len][payload][u32 crc32(payload)]` and appended to the `__wal` side
//! file. A torn or corrupt tail is cut off when the log is opened.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use bytes::{Buf, BufMut};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::storage::disk::TableId;
use crate::storage::page::PageId;

pub type Lsn = u64;
pub type TxId = u64;

pub const WAL_FILE_NAME: &str = "__wal";

/// Buffered bytes that trigger a write even without a flush request
const WAL_BUFFER_LIMIT: usize = 1 << 20;

/// How hard commit pushes the log towards stable storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalSyncMode {
    /// Commit does not wait for the log; the background flusher writes it
    Off,
    /// Commit writes the log to the OS; the flusher fsyncs it
    Normal,
    /// Commit writes and fsyncs the log
    Full,
}

impl FromStr for WalSyncMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "off" => Ok(WalSyncMode::Off),
            "normal" => Ok(WalSyncMode::Normal),
            "full" => Ok(WalSyncMode::Full),
            other => Err(Error::InvalidArgument(format!(
                "unknown wal sync mode '{}'",
                other
            ))),
        }
    }
}

/// Type of log record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecordKind {
    Begin,
    /// Slot image change on a heap page. `None` means the slot is empty.
    Write {
        table_id: TableId,
        page_id: PageId,
        slot: u16,
        before: Option<Vec<u8>>,
        after: Option<Vec<u8>>,
    },
    Commit,
    Abort,
}

/// A single log record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub lsn: Lsn,
    pub txid: TxId,
    pub kind: LogRecordKind,
}

const KIND_BEGIN: u8 = 1;
const KIND_WRITE: u8 = 2;
const KIND_COMMIT: u8 = 3;
const KIND_ABORT: u8 = 4;

fn put_image(buf: &mut Vec<u8>, image: &Option<Vec<u8>>) {
    match image {
        None => buf.put_u32(u32::MAX),
        Some(bytes) => {
            buf.put_u32(bytes.len() as u32);
            buf.put_slice(bytes);
        }
    }
}

fn get_image(buf: &mut &[u8]) -> Option<Option<Vec<u8>>> {
    if buf.remaining() < 4 {
        return None;
    }
    let len = buf.get_u32();
    if len == u32::MAX {
        return Some(None);
    }
    let len = len as usize;
    if buf.remaining() < len {
        return None;
    }
    let bytes = buf[..len].to_vec();
    buf.advance(len);
    Some(Some(bytes))
}

impl LogRecord {
    fn encode(&self, out: &mut Vec<u8>) {
        let mut payload = Vec::with_capacity(32);
        payload.put_u64(self.lsn);
        payload.put_u64(self.txid);
        match &self.kind {
            LogRecordKind::Begin => payload.put_u8(KIND_BEGIN),
            LogRecordKind::Commit => payload.put_u8(KIND_COMMIT),
            LogRecordKind::Abort => payload.put_u8(KIND_ABORT),
            LogRecordKind::Write {
                table_id,
                page_id,
                slot,
                before,
                after,
            } => {
                payload.put_u8(KIND_WRITE);
                payload.put_u32(*table_id);
                payload.put_u32(*page_id);
                payload.put_u16(*slot);
                put_image(&mut payload, before);
                put_image(&mut payload, after);
            }
        }
        out.put_u32(payload.len() as u32);
        out.put_slice(&payload);
        out.put_u32(crc32fast::hash(&payload));
    }

    fn decode_payload(mut payload: &[u8]) -> Option<LogRecord> {
        if payload.remaining() < 17 {
            return None;
        }
        let lsn = payload.get_u64();
        let txid = payload.get_u64();
        let kind = match payload.get_u8() {
            KIND_BEGIN => LogRecordKind::Begin,
            KIND_COMMIT => LogRecordKind::Commit,
            KIND_ABORT => LogRecordKind::Abort,
            KIND_WRITE => {
                if payload.remaining() < 10 {
                    return None;
                }
                let table_id = payload.get_u32();
                let page_id = payload.get_u32();
                let slot = payload.get_u16();
                let before = get_image(&mut payload)?;
                let after = get_image(&mut payload)?;
                LogRecordKind::Write {
                    table_id,
                    page_id,
                    slot,
                    before,
                    after,
                }
            }
            _ => return None,
        };
        Some(LogRecord { lsn, txid, kind })
    }
}

/// Decode framed records, stopping at the first torn or corrupt frame.
/// Returns the records and the byte length of the valid prefix.
fn decode_frames(bytes: &[u8]) -> (Vec<LogRecord>, usize) {
    let mut records = Vec::new();
    let mut buf = bytes;
    let mut valid = 0;
    loop {
        if buf.remaining() < 4 {
            break;
        }
        let len = (&buf[..4]).get_u32() as usize;
        if buf.remaining() < 4 + len + 4 {
            break;
        }
        let payload = &buf[4..4 + len];
        let crc = (&buf[4 + len..8 + len]).get_u32();
        if crc != crc32fast::hash(payload) {
            break;
        }
        match LogRecord::decode_payload(payload) {
            Some(record) => records.push(record),
            None => break,
        }
        buf.advance(8 + len);
        valid += 8 + len;
    }
    (records, valid)
}

#[derive(Debug)]
struct WalInner {
    file: File,
    buffer: Vec<u8>,
    next_lsn: Lsn,
    /// Highest LSN handed to the OS
    written_lsn: Lsn,
    /// Highest LSN known to be fsynced
    synced_lsn: Lsn,
    /// Highest LSN currently sitting in `buffer`
    buffered_lsn: Lsn,
}

/// Manages Write-Ahead Logs
#[derive(Debug)]
pub struct Wal {
    path: PathBuf,
    sync_mode: WalSyncMode,
    inner: Mutex<WalInner>,
}

impl Wal {
    /// Open (or create) the log in `dir`, returning the surviving records.
    pub fn open(dir: &Path, sync_mode: WalSyncMode) -> Result<(Wal, Vec<LogRecord>)> {
        let path = dir.join(WAL_FILE_NAME);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        let (records, valid) = decode_frames(&bytes);
        if valid < bytes.len() {
            warn!(
                dropped = bytes.len() - valid,
                "discarding torn tail of write-ahead log"
            );
            file.set_len(valid as u64)?;
        }
        file.seek(SeekFrom::End(0))?;
        let last = records.last().map(|r| r.lsn).unwrap_or(0);
        debug!(records = records.len(), last_lsn = last, "opened write-ahead log");
        let wal = Wal {
            path,
            sync_mode,
            inner: Mutex::new(WalInner {
                file,
                buffer: Vec::new(),
                next_lsn: last + 1,
                written_lsn: last,
                synced_lsn: last,
                buffered_lsn: last,
            }),
        };
        Ok((wal, records))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sync_mode(&self) -> WalSyncMode {
        self.sync_mode
    }

    /// Make sure future LSNs are above `lsn` (pages may carry LSNs from
    /// before the last truncation).
    pub fn advance_lsn(&self, lsn: Lsn) {
        let mut inner = self.inner.lock();
        if inner.next_lsn <= lsn {
            inner.next_lsn = lsn + 1;
            inner.written_lsn = inner.written_lsn.max(lsn);
            inner.synced_lsn = inner.synced_lsn.max(lsn);
            inner.buffered_lsn = inner.buffered_lsn.max(lsn);
        }
    }

    pub fn last_lsn(&self) -> Lsn {
        self.inner.lock().next_lsn - 1
    }

    /// Append a record and return its LSN.
    pub fn append(&self, txid: TxId, kind: LogRecordKind) -> Result<Lsn> {
        let mut inner = self.inner.lock();
        let lsn = inner.next_lsn;
        inner.next_lsn += 1;
        let record = LogRecord { lsn, txid, kind };
        record.encode(&mut inner.buffer);
        inner.buffered_lsn = lsn;
        if inner.buffer.len() >= WAL_BUFFER_LIMIT {
            Self::write_buffer(&mut inner)?;
        }
        Ok(lsn)
    }

    fn write_buffer(inner: &mut WalInner) -> Result<()> {
        if !inner.buffer.is_empty() {
            let WalInner { file, buffer, .. } = inner;
            file.write_all(buffer)?;
            buffer.clear();
        }
        inner.written_lsn = inner.buffered_lsn;
        Ok(())
    }

    /// Hand everything up to `lsn` to the OS.
    pub fn flush_to(&self, lsn: Lsn) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.written_lsn < lsn {
            Self::write_buffer(&mut inner)?;
        }
        Ok(())
    }

    /// Apply the commit durability policy for a commit record at `lsn`.
    pub fn commit_flush(&self, lsn: Lsn) -> Result<()> {
        match self.sync_mode {
            WalSyncMode::Off => Ok(()),
            WalSyncMode::Normal => self.flush_to(lsn),
            WalSyncMode::Full => self.sync_to(lsn),
        }
    }

    /// Write and fsync everything up to `lsn`.
    pub fn sync_to(&self, lsn: Lsn) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.synced_lsn >= lsn {
            return Ok(());
        }
        Self::write_buffer(&mut inner)?;
        inner.file.sync_data()?;
        inner.synced_lsn = inner.written_lsn;
        Ok(())
    }

    /// Background flush: write the buffer, fsync unless the mode is `Off`.
    pub fn background_flush(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::write_buffer(&mut inner)?;
        if self.sync_mode != WalSyncMode::Off && inner.synced_lsn < inner.written_lsn {
            inner.file.sync_data()?;
            inner.synced_lsn = inner.written_lsn;
        }
        Ok(())
    }

    /// Drop all records. Only valid once every logged change is on disk and
    /// no transaction is in flight.
    pub fn truncate(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.buffer.clear();
        inner.file.set_len(0)?;
        inner.file.seek(SeekFrom::Start(0))?;
        inner.file.sync_data()?;
        let last = inner.next_lsn - 1;
        inner.written_lsn = last;
        inner.synced_lsn = last;
        inner.buffered_lsn = last;
        debug!(last_lsn = last, "truncated write-ahead log");
        Ok(())
    }

    /// Re-read the records currently on disk (buffered records excluded).
    pub fn read_all(&self) -> Result<Vec<LogRecord>> {
        let mut bytes = Vec::new();
        File::open(&self.path)?.read_to_end(&mut bytes)?;
        Ok(decode_frames(&bytes).0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(txid: TxId, slot: u16) -> LogRecordKind {
        LogRecordKind::Write {
            table_id: 1,
            page_id: 2,
            slot,
            before: None,
            after: Some(vec![txid as u8; 3]),
        }
    }

    #[test]
    fn test_append_flush_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let (wal, records) = Wal::open(dir.path(), WalSyncMode::Full).unwrap();
            assert!(records.is_empty());
            wal.append(1, LogRecordKind::Begin).unwrap();
            wal.append(1, write(1, 0)).unwrap();
            let lsn = wal.append(1, LogRecordKind::Commit).unwrap();
            wal.commit_flush(lsn).unwrap();
        }
        let (wal, records) = Wal::open(dir.path(), WalSyncMode::Full).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[1].kind, write(1, 0));
        assert_eq!(records[2].kind, LogRecordKind::Commit);
        assert_eq!(wal.last_lsn(), 3);
    }

    #[test]
    fn test_unflushed_records_are_lost_in_off_mode() {
        let dir = TempDir::new().unwrap();
        {
            let (wal, _) = Wal::open(dir.path(), WalSyncMode::Off).unwrap();
            let lsn = wal.append(5, LogRecordKind::Commit).unwrap();
            wal.commit_flush(lsn).unwrap();
        }
        let (_, records) = Wal::open(dir.path(), WalSyncMode::Off).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_torn_tail_is_discarded() {
        let dir = TempDir::new().unwrap();
        {
            let (wal, _) = Wal::open(dir.path(), WalSyncMode::Normal).unwrap();
            wal.append(1, write(1, 0)).unwrap();
            let lsn = wal.append(1, write(1, 1)).unwrap();
            wal.flush_to(lsn).unwrap();
        }
        let path = dir.path().join(WAL_FILE_NAME);
        let mut bytes = std::fs::read(&path).unwrap();
        let len = bytes.len();
        bytes[len - 2] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        let (wal, records) = Wal::open(dir.path(), WalSyncMode::Normal).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(wal.append(2, LogRecordKind::Begin).unwrap(), 2);
    }

    #[test]
    fn test_truncate_keeps_lsns_monotonic() {
        let dir = TempDir::new().unwrap();
        let (wal, _) = Wal::open(dir.path(), WalSyncMode::Normal).unwrap();
        wal.append(1, LogRecordKind::Begin).unwrap();
        wal.append(1, LogRecordKind::Commit).unwrap();
        wal.truncate().unwrap();
        assert!(wal.read_all().unwrap().is_empty());
        assert_eq!(wal.append(2, LogRecordKind::Begin).unwrap(), 3);
        wal.advance_lsn(100);
        assert_eq!(wal.append(2, LogRecordKind::Commit).unwrap(), 101);
    }
}

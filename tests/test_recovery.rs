use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::time::Duration;

use emberdb::{Engine, IsolationLevel, Options, Value};
use tempfile::TempDir;

fn options() -> Options {
    Options::default()
        .with_page_size(4096)
        .with_buffer_pool_pages(16)
        .with_autovacuum_interval(None)
        .with_lock_timeout(Duration::from_millis(200))
}

fn names(engine: &Engine, sql: &str) -> Vec<String> {
    engine
        .query(sql)
        .unwrap()
        .rows
        .iter()
        .map(|r| r.get(0).unwrap().to_string())
        .collect()
}

fn table_files(dir: &TempDir) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map_or(false, |n| n.starts_with("table_"))
        })
        .collect();
    files.sort();
    files
}

#[test]
fn test_crash_keeps_committed_and_drops_uncommitted() {
    let dir = TempDir::new().unwrap();
    {
        let engine = Engine::open(dir.path(), options()).unwrap();
        engine
            .exec("CREATE TABLE items (id INT PRIMARY KEY, label VARCHAR, qty INT)")
            .unwrap();
        engine.exec("CREATE INDEX items_qty ON items (qty)").unwrap();
        for i in 0..300 {
            engine
                .exec(&format!("INSERT INTO items VALUES ({}, 'item-{:03}', {})", i, i, i % 10))
                .unwrap();
        }
        engine.exec("DELETE FROM items WHERE id >= 250").unwrap();
        engine.exec("UPDATE items SET label = 'changed' WHERE qty = 3").unwrap();

        let mut aborted = engine.begin(IsolationLevel::Snapshot).unwrap();
        aborted.query("UPDATE items SET label = 'aborted' WHERE qty = 4").unwrap();
        aborted.abort().unwrap();

        let mut loser = engine.begin(IsolationLevel::Snapshot).unwrap();
        loser.query("DELETE FROM items WHERE qty = 5").unwrap();
        loser.query("INSERT INTO items VALUES (1000, 'ghost', 0)").unwrap();
        engine.exec("INSERT INTO items VALUES (999, 'last', 9)").unwrap();
        std::mem::forget(loser);
        engine.crash_for_testing();
    }

    let engine = Engine::open(dir.path(), options()).unwrap();
    assert_eq!(engine.exec("SELECT * FROM items").unwrap(), 251);
    assert_eq!(engine.exec("SELECT * FROM items WHERE qty = 5").unwrap(), 25);
    assert_eq!(engine.exec("SELECT * FROM items WHERE id = 1000").unwrap(), 0);
    assert_eq!(
        names(&engine, "SELECT label FROM items WHERE qty = 3 LIMIT 1"),
        vec!["changed"]
    );
    assert_eq!(
        names(&engine, "SELECT label FROM items WHERE id = 4"),
        vec!["item-004"]
    );
    assert!(engine.check_integrity().unwrap().is_ok());

    // the primary key of the lost insert is free again
    engine.exec("INSERT INTO items VALUES (1000, 'real', 0)").unwrap();
}

#[test]
fn test_hidden_rowids_continue_after_crash() {
    let dir = TempDir::new().unwrap();
    {
        let engine = Engine::open(dir.path(), options()).unwrap();
        engine.exec("CREATE TABLE log (msg VARCHAR)").unwrap();
        engine.exec("INSERT INTO log VALUES ('a'), ('b'), ('c')").unwrap();
        engine.crash_for_testing();
    }
    let engine = Engine::open(dir.path(), options()).unwrap();
    engine.exec("INSERT INTO log VALUES ('d')").unwrap();
    let mut msgs = names(&engine, "SELECT msg FROM log");
    msgs.sort();
    assert_eq!(msgs, vec!["a", "b", "c", "d"]);
    assert!(engine.check_integrity().unwrap().is_ok());
}

#[test]
fn test_checkpoint_truncates_wal() {
    let dir = TempDir::new().unwrap();
    let engine = Engine::open(dir.path(), options()).unwrap();
    engine.exec("CREATE TABLE t (id INT PRIMARY KEY)").unwrap();
    engine.exec("INSERT INTO t VALUES (1), (2)").unwrap();
    let wal = dir.path().join("__wal");
    assert!(fs::metadata(&wal).unwrap().len() > 0);

    let mut open_tx = engine.begin(IsolationLevel::Snapshot).unwrap();
    open_tx.query("INSERT INTO t VALUES (3)").unwrap();
    assert!(!engine.checkpoint().unwrap());
    open_tx.commit().unwrap();

    assert!(engine.checkpoint().unwrap());
    assert_eq!(fs::metadata(&wal).unwrap().len(), 0);
    assert_eq!(engine.exec("SELECT * FROM t").unwrap(), 3);
}

#[test]
fn test_corrupt_page_is_reported() {
    let dir = TempDir::new().unwrap();
    {
        let engine = Engine::open(dir.path(), options()).unwrap();
        engine.exec("CREATE TABLE t (id INT PRIMARY KEY, pad VARCHAR)").unwrap();
        for i in 0..50 {
            engine
                .exec(&format!("INSERT INTO t VALUES ({}, '{}')", i, "x".repeat(100)))
                .unwrap();
        }
    }

    let files = table_files(&dir);
    assert_eq!(files.len(), 1);
    let mut file = OpenOptions::new().read(true).write(true).open(&files[0]).unwrap();
    let pages = file.metadata().unwrap().len() / 4096;
    assert!(pages >= 3);
    let offset = (pages - 1) * 4096 + 2048;
    let mut byte = [0u8; 1];
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.read_exact(&mut byte).unwrap();
    byte[0] ^= 0x5A;
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.write_all(&byte).unwrap();
    drop(file);

    let engine = Engine::open(dir.path(), options()).unwrap();
    let report = engine.check_integrity().unwrap();
    assert!(!report.is_ok());
    assert_eq!(report.corrupt_pages.len(), 1);
    assert_eq!(report.corrupt_pages[0].1 as u64, pages - 1);
}

#[test]
fn test_reopen_uses_page_size_on_disk() {
    let dir = TempDir::new().unwrap();
    {
        let engine = Engine::open(dir.path(), options()).unwrap();
        engine.exec("CREATE TABLE t (id INT PRIMARY KEY, v DATE)").unwrap();
        engine.exec("INSERT INTO t VALUES (1, DATE '2024-02-29')").unwrap();
    }
    let engine = Engine::open(dir.path(), options().with_page_size(8192)).unwrap();
    let result = engine.query("SELECT v FROM t").unwrap();
    assert_eq!(result.rows[0].get(0).unwrap().to_string(), "2024-02-29");
    assert!(matches!(result.rows[0].get(0), Some(Value::Date(_))));
}

#[test]
fn test_dropped_table_stays_dropped() {
    let dir = TempDir::new().unwrap();
    {
        let engine = Engine::open(dir.path(), options()).unwrap();
        engine.exec("CREATE TABLE a (id INT PRIMARY KEY)").unwrap();
        engine.exec("CREATE TABLE b (id INT PRIMARY KEY)").unwrap();
        engine.exec("INSERT INTO b VALUES (1)").unwrap();
        engine.exec("DROP TABLE a").unwrap();
    }
    assert_eq!(table_files(&dir).len(), 1);
    let engine = Engine::open(dir.path(), options()).unwrap();
    assert_eq!(engine.catalog().list_tables(), vec!["b".to_string()]);
    assert_eq!(engine.exec("SELECT * FROM b").unwrap(), 1);
}

#[test]
fn test_dropped_index_stays_dropped() {
    let dir = TempDir::new().unwrap();
    {
        let engine = Engine::open(dir.path(), options()).unwrap();
        engine.exec("CREATE TABLE t (id INT PRIMARY KEY, v INT)").unwrap();
        for i in 0..100 {
            engine.exec(&format!("INSERT INTO t VALUES ({}, {})", i, i % 5)).unwrap();
        }
        engine.exec("CREATE INDEX t_v ON t (v)").unwrap();
        engine.exec("CREATE INDEX t_id_v ON t (id, v)").unwrap();
        engine.exec("DROP INDEX t_v").unwrap();
        engine.exec("INSERT INTO t VALUES (100, 0)").unwrap();
        engine.crash_for_testing();
    }
    let engine = Engine::open(dir.path(), options()).unwrap();
    let indexes: Vec<String> = engine
        .catalog()
        .list_indexes_for_table("t")
        .unwrap()
        .into_iter()
        .map(|idx| idx.name)
        .collect();
    assert_eq!(indexes, vec!["t_pkey", "t_id_v"]);
    assert_eq!(engine.exec("SELECT * FROM t WHERE v = 0").unwrap(), 21);
    assert!(engine.check_integrity().unwrap().is_ok());
    engine.exec("CREATE INDEX t_v ON t (v)").unwrap();
    assert_eq!(engine.exec("SELECT * FROM t WHERE v = 0").unwrap(), 21);
}

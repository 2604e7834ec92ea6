use std::time::Duration;

use emberdb::{Engine, ErrorKind, ExecResult, IsolationLevel, Options, TransactionState, Value};
use tempfile::TempDir;

fn open(dir: &TempDir) -> Engine {
    let options = Options::default()
        .with_page_size(4096)
        .with_autovacuum_interval(None)
        .with_lock_timeout(Duration::from_millis(300));
    let engine = Engine::open(dir.path(), options).unwrap();
    engine
        .exec("CREATE TABLE accounts (id INT PRIMARY KEY, balance INT NOT NULL)")
        .unwrap();
    engine
        .exec("INSERT INTO accounts VALUES (1, 100), (2, 50)")
        .unwrap();
    engine
}

fn balance(engine: &Engine, id: i32) -> Option<i64> {
    let result = engine
        .query(&format!("SELECT balance FROM accounts WHERE id = {}", id))
        .unwrap();
    result.rows.first().and_then(|r| r.get(0)).and_then(Value::as_i64)
}

#[test]
fn test_transaction_lifecycle() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);

    // BEGIN ... COMMIT
    let mut tx = engine.begin(IsolationLevel::Snapshot).unwrap();
    assert_eq!(tx.state(), TransactionState::Active);
    match tx.exec("UPDATE accounts SET balance = 90 WHERE id = 1").unwrap() {
        ExecResult::Count(n) => assert_eq!(n, 1),
        _ => panic!("expected a count"),
    }
    tx.query("UPDATE accounts SET balance = 60 WHERE id = 2").unwrap();
    // not visible outside until commit
    assert_eq!(balance(&engine, 1), Some(100));
    tx.commit().unwrap();
    assert_eq!(balance(&engine, 1), Some(90));
    assert_eq!(balance(&engine, 2), Some(60));

    // BEGIN ... ROLLBACK
    let mut tx = engine.begin(IsolationLevel::Snapshot).unwrap();
    tx.query("DELETE FROM accounts WHERE id = 1").unwrap();
    tx.query("INSERT INTO accounts VALUES (3, 10)").unwrap();
    assert_eq!(tx.query("SELECT id FROM accounts").unwrap().rows.len(), 2);
    tx.abort().unwrap();
    assert_eq!(balance(&engine, 1), Some(90));
    assert_eq!(balance(&engine, 3), None);
}

#[test]
fn test_drop_aborts() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);
    {
        let mut tx = engine.begin(IsolationLevel::Snapshot).unwrap();
        tx.query("UPDATE accounts SET balance = 0").unwrap();
    }
    assert_eq!(balance(&engine, 1), Some(100));
    // the dropped transaction's row locks are gone
    assert_eq!(engine.exec("UPDATE accounts SET balance = 1 WHERE id = 1").unwrap(), 1);
}

#[test]
fn test_constraint_error_keeps_transaction_active() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);
    let mut tx = engine.begin(IsolationLevel::Snapshot).unwrap();
    tx.query("UPDATE accounts SET balance = 1 WHERE id = 1").unwrap();
    let err = tx.query("INSERT INTO accounts VALUES (4, NULL)").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotNullViolation);
    assert_eq!(tx.state(), TransactionState::Active);
    tx.commit().unwrap();
    assert_eq!(balance(&engine, 1), Some(1));
}

#[test]
fn test_failed_transaction_only_accepts_abort() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);
    let mut tx = engine.begin(IsolationLevel::Snapshot).unwrap();
    tx.query("UPDATE accounts SET balance = 1 WHERE id = 1").unwrap();
    let err = tx.query("SELECT * FROM accounts a JOIN accounts b").unwrap_err();
    assert_eq!(err.kind().category(), emberdb::ErrorCategory::Runtime);
    assert_eq!(tx.state(), TransactionState::Failed);
    assert_eq!(
        tx.query("SELECT * FROM accounts").unwrap_err().kind(),
        ErrorKind::InvalidArgument
    );
    tx.abort().unwrap();
    assert_eq!(balance(&engine, 1), Some(100));
}

#[test]
fn test_cancel_aborts_transaction() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);
    let mut tx = engine.begin(IsolationLevel::Snapshot).unwrap();
    tx.query("UPDATE accounts SET balance = 1 WHERE id = 1").unwrap();
    tx.cancel_token().cancel();
    let err = tx.query("SELECT * FROM accounts").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(tx.state(), TransactionState::Aborted);
    assert_eq!(balance(&engine, 1), Some(100));
}

#[test]
fn test_read_committed_sees_new_commits() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);
    let mut tx = engine.begin(IsolationLevel::ReadCommitted).unwrap();
    let first = tx.query("SELECT balance FROM accounts WHERE id = 1").unwrap();
    engine.exec("UPDATE accounts SET balance = 7 WHERE id = 1").unwrap();
    let second = tx.query("SELECT balance FROM accounts WHERE id = 1").unwrap();
    assert_eq!(first.rows[0].get(0), Some(&Value::Int32(100)));
    assert_eq!(second.rows[0].get(0), Some(&Value::Int32(7)));
    tx.commit().unwrap();
}

#[test]
fn test_repeatable_read_blocks_writers_of_read_rows() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);
    let mut tx = engine.begin(IsolationLevel::RepeatableRead).unwrap();
    tx.query("SELECT balance FROM accounts WHERE id = 1").unwrap();
    let err = engine
        .exec("UPDATE accounts SET balance = 7 WHERE id = 1")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LockTimeout);
    // rows it did not read stay writable
    assert_eq!(engine.exec("UPDATE accounts SET balance = 7 WHERE id = 2").unwrap(), 1);
    tx.commit().unwrap();
    assert_eq!(engine.exec("UPDATE accounts SET balance = 7 WHERE id = 1").unwrap(), 1);
}

#[test]
fn test_serializable_scan_blocks_inserts() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);
    let mut tx = engine.begin(IsolationLevel::Serializable).unwrap();
    tx.query("SELECT * FROM accounts WHERE balance > 10").unwrap();
    let err = engine.exec("INSERT INTO accounts VALUES (9, 99)").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LockTimeout);
    tx.commit().unwrap();
    assert_eq!(engine.exec("INSERT INTO accounts VALUES (9, 99)").unwrap(), 1);
}

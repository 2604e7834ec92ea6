//! EmberDB - An embedded MVCC relational engine written in Rust
//!
//! This library provides the core components of a transactional database:
//! - SQL parsing (lexer, parser, AST)
//! - Storage engine (slotted pages, buffer pool, heap files, B+ tree, WAL)
//! - Concurrency control (lock manager, MVCC snapshots, undo logging)
//! - Query execution (planner, iterator operators, external sort)
//! - System catalog
//!
//! ```no_run
//! use emberdb::{Engine, IsolationLevel, Options};
//!
//! # fn main() -> emberdb::Result<()> {
//! let engine = Engine::open("data", Options::default())?;
//! engine.exec("CREATE TABLE users (id INT PRIMARY KEY, name VARCHAR)")?;
//! let mut tx = engine.begin(IsolationLevel::Snapshot)?;
//! tx.query("INSERT INTO users VALUES (1, 'Alice')")?;
//! tx.commit()?;
//! # Ok(())
//! # }
//! ```

pub mod catalog;
pub mod engine;
pub mod error;
pub mod executor;
pub mod sql;
pub mod storage;
pub mod transaction;

pub use catalog::DataType;
pub use engine::{
    Engine, ExecResult, IntegrityReport, Options, QueryResult, RowStream, Transaction, VacuumStats,
};
pub use error::{Error, ErrorCategory, ErrorKind, Result};
pub use storage::{Tuple, Value, WalSyncMode};
pub use transaction::{CancelToken, IsolationLevel, TransactionState};

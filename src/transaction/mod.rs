//! Transaction module
//!
//! Concurrency control: the lock manager with deadlock detection, MVCC
//! snapshots and visibility, the transaction table, and undo logging.

pub mod lock_manager;
pub mod manager;
pub mod mvcc;
pub mod undo;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub use lock_manager::{LockManager, LockMode, LockResource};
pub use manager::{IsolationLevel, TransactionManager, TransactionState};
pub use mvcc::{Snapshot, StatusTable, VisibilityResult, WriteCheckResult};
pub use undo::{UndoLog, UndoRecord, UndoTarget};

/// Cooperative cancellation flag, checked at every wait point
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> crate::error::Result<()> {
        if self.is_cancelled() {
            Err(crate::error::Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

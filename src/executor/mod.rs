//! Query execution module
//!
//! This module contains the planner, the physical operators and the row
//! access paths they share.

pub mod access;
pub mod operators;
pub mod planner;
pub mod sort;

pub use access::{ExecContext, TableStore, TxnState};
pub use operators::{Operator, Row, Truth};
pub use planner::{IndexScan, Plan, Planner, Predicate, SortKey, DEFAULT_SORT_SPILL_BYTES};
pub use sort::ExternalSorter;

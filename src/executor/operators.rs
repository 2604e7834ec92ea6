//! Physical operators
//!
//! A plan is turned into a tree of [`Operator`]s that produce rows on
//! demand. Every operator supports `open`, `next` and `close`; `next`
//! yields one row at a time so a caller can stop early. Write operators
//! produce a single row holding the number of rows affected.

use std::ops::Bound;
use std::sync::Arc;

use tracing::trace;

use super::access::{ExecContext, TableStore};
use super::planner::{IndexScan, Plan, Predicate, SortKey};
use super::sort::{ExternalSorter, SortedRows};
use crate::error::{Error, Result};
use crate::sql::ast::CompareOp;
use crate::storage::btree::{Direction, RangeCursor};
use crate::storage::heap::{HeapScan, RowId};
use crate::storage::tuple::{Comparison, Tuple, Value};

/// A row flowing between operators; `rid` is set while the row still has
/// table width.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub rid: Option<RowId>,
    pub tuple: Tuple,
}

/// Three-valued truth
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Truth {
    True,
    False,
    Unknown,
}

impl Truth {
    fn and(self, other: Truth) -> Truth {
        match (self, other) {
            (Truth::False, _) | (_, Truth::False) => Truth::False,
            (Truth::True, Truth::True) => Truth::True,
            _ => Truth::Unknown,
        }
    }

    fn or(self, other: Truth) -> Truth {
        match (self, other) {
            (Truth::True, _) | (_, Truth::True) => Truth::True,
            (Truth::False, Truth::False) => Truth::False,
            _ => Truth::Unknown,
        }
    }

    fn not(self) -> Truth {
        match self {
            Truth::True => Truth::False,
            Truth::False => Truth::True,
            Truth::Unknown => Truth::Unknown,
        }
    }
}

impl Predicate {
    /// Evaluate against a full-width tuple. Comparisons with NULL are
    /// unknown.
    pub fn evaluate(&self, tuple: &Tuple) -> Result<Truth> {
        Ok(match self {
            Predicate::Compare {
                column, op, value, ..
            } => {
                let left = tuple.get(*column).unwrap_or(&Value::Null);
                let cmp = left.compare(value)?;
                let truth = match (cmp, op) {
                    (Comparison::Unordered, _) => return Ok(Truth::Unknown),
                    (Comparison::Equal, CompareOp::Eq | CompareOp::LtEq | CompareOp::GtEq) => true,
                    (Comparison::Less, CompareOp::Lt | CompareOp::LtEq | CompareOp::NotEq) => true,
                    (Comparison::Greater, CompareOp::Gt | CompareOp::GtEq | CompareOp::NotEq) => true,
                    _ => false,
                };
                if truth {
                    Truth::True
                } else {
                    Truth::False
                }
            }
            Predicate::IsNull {
                column, negated, ..
            } => {
                let null = tuple.get(*column).map_or(true, Value::is_null);
                if null != *negated {
                    Truth::True
                } else {
                    Truth::False
                }
            }
            Predicate::And(l, r) => l.evaluate(tuple)?.and(r.evaluate(tuple)?),
            Predicate::Or(l, r) => l.evaluate(tuple)?.or(r.evaluate(tuple)?),
            Predicate::Not(p) => p.evaluate(tuple)?.not(),
        })
    }

    /// Whether the row qualifies: only `True` does.
    pub fn matches(&self, tuple: &Tuple) -> Result<bool> {
        Ok(self.evaluate(tuple)? == Truth::True)
    }
}

/// Physical operator
pub enum Operator {
    HeapScan {
        store: Arc<TableStore>,
        cursor: Option<HeapScan>,
        limit: Option<u64>,
        produced: u64,
    },
    IndexScan {
        store: Arc<TableStore>,
        index_no: usize,
        lo: Bound<Vec<u8>>,
        hi: Bound<Vec<u8>>,
        direction: Direction,
        cursor: Option<RangeCursor>,
        limit: Option<u64>,
        produced: u64,
    },
    Filter {
        input: Box<Operator>,
        predicate: Predicate,
    },
    Project {
        input: Box<Operator>,
        columns: Vec<usize>,
    },
    Sort {
        input: Box<Operator>,
        keys: Vec<SortKey>,
        limit: Option<u64>,
        spill_bytes: usize,
        output: Option<SortedRows>,
    },
    Limit {
        input: Box<Operator>,
        limit: Option<u64>,
        offset: u64,
        skipped: u64,
        produced: u64,
    },
    Insert {
        store: Arc<TableStore>,
        rows: Vec<Vec<Value>>,
        done: bool,
    },
    Update {
        input: Box<Operator>,
        store: Arc<TableStore>,
        assignments: Vec<(usize, Value)>,
        predicate: Option<Predicate>,
        done: bool,
    },
    Delete {
        input: Box<Operator>,
        store: Arc<TableStore>,
        predicate: Option<Predicate>,
        done: bool,
    },
}

fn count_row(count: u64) -> Row {
    Row {
        rid: None,
        tuple: Tuple::new(vec![Value::Int64(count as i64)]),
    }
}

fn recheck(predicate: &Option<Predicate>) -> impl Fn(&Tuple) -> Result<bool> + '_ {
    move |tuple: &Tuple| match predicate {
        Some(p) => p.matches(tuple),
        None => Ok(true),
    }
}

impl Operator {
    /// Build the operator tree for a plan over `store`.
    pub fn build(plan: Plan, store: &Arc<TableStore>) -> Result<Operator> {
        if plan.table_id() != store.table_id() {
            return Err(Error::InternalInvariant(format!(
                "plan for table {} run against table {}",
                plan.table_id(),
                store.table_id()
            )));
        }
        let child = |input: Box<Plan>| Operator::build(*input, store).map(Box::new);
        Ok(match plan {
            Plan::HeapScan { limit, .. } => Operator::HeapScan {
                store: Arc::clone(store),
                cursor: None,
                limit,
                produced: 0,
            },
            Plan::IndexSeek(scan) | Plan::IndexRange(scan) => Self::index_scan(scan, store)?,
            Plan::Filter { input, predicate } => Operator::Filter {
                input: child(input)?,
                predicate,
            },
            Plan::Project { input, columns, .. } => Operator::Project {
                input: child(input)?,
                columns,
            },
            Plan::Sort {
                input,
                keys,
                limit,
                spill_bytes,
                ..
            } => Operator::Sort {
                input: child(input)?,
                keys,
                limit,
                spill_bytes,
                output: None,
            },
            Plan::Limit {
                input,
                limit,
                offset,
            } => Operator::Limit {
                input: child(input)?,
                limit,
                offset,
                skipped: 0,
                produced: 0,
            },
            Plan::Insert { rows, .. } => Operator::Insert {
                store: Arc::clone(store),
                rows,
                done: false,
            },
            Plan::Update {
                input,
                assignments,
                predicate,
                ..
            } => Operator::Update {
                input: child(input)?,
                store: Arc::clone(store),
                assignments,
                predicate,
                done: false,
            },
            Plan::Delete {
                input, predicate, ..
            } => Operator::Delete {
                input: child(input)?,
                store: Arc::clone(store),
                predicate,
                done: false,
            },
        })
    }

    fn index_scan(scan: IndexScan, store: &Arc<TableStore>) -> Result<Operator> {
        // the planner's position is only valid against the same definition
        let index_no = store.index_position(&scan.index).ok_or_else(|| {
            Error::InternalInvariant(format!(
                "index '{}' missing from table '{}'",
                scan.index, scan.table
            ))
        })?;
        Ok(Operator::IndexScan {
            store: Arc::clone(store),
            index_no,
            lo: scan.lo,
            hi: scan.hi,
            direction: scan.direction,
            cursor: None,
            limit: scan.limit,
            produced: 0,
        })
    }

    /// Position scans at their first row.
    pub fn open(&mut self) {
        match self {
            Operator::HeapScan {
                store,
                cursor,
                produced,
                ..
            } => {
                *cursor = Some(store.heap.scan());
                *produced = 0;
            }
            Operator::IndexScan {
                store,
                index_no,
                lo,
                hi,
                direction,
                cursor,
                produced,
                ..
            } => {
                let tree = &store.indexes[*index_no];
                *cursor = Some(tree.range(lo.clone(), hi.clone(), *direction));
                *produced = 0;
            }
            Operator::Filter { input, .. } | Operator::Project { input, .. } => input.open(),
            Operator::Sort { input, output, .. } => {
                *output = None;
                input.open();
            }
            Operator::Limit {
                input,
                skipped,
                produced,
                ..
            } => {
                *skipped = 0;
                *produced = 0;
                input.open();
            }
            Operator::Insert { done, .. } => *done = false,
            Operator::Update { input, done, .. } | Operator::Delete { input, done, .. } => {
                *done = false;
                input.open();
            }
        }
    }

    /// Release cursors and buffered rows.
    pub fn close(&mut self) {
        match self {
            Operator::HeapScan { cursor, .. } => *cursor = None,
            Operator::IndexScan { cursor, .. } => *cursor = None,
            Operator::Sort { input, output, .. } => {
                *output = None;
                input.close();
            }
            Operator::Filter { input, .. }
            | Operator::Project { input, .. }
            | Operator::Limit { input, .. }
            | Operator::Update { input, .. }
            | Operator::Delete { input, .. } => input.close(),
            Operator::Insert { .. } => {}
        }
    }

    /// Produce the next row, or `None` when exhausted.
    pub fn next(&mut self, cx: &mut ExecContext<'_>) -> Result<Option<Row>> {
        match self {
            Operator::HeapScan {
                store,
                cursor,
                limit,
                produced,
            } => {
                if limit.map_or(false, |n| *produced >= n) {
                    return Ok(None);
                }
                let Some(scan) = cursor.as_mut() else {
                    return Err(Error::InternalInvariant("heap scan not opened".to_string()));
                };
                for rid in scan.by_ref() {
                    cx.check_cancelled()?;
                    let rid = rid?;
                    if let Some(tuple) = cx.fetch_visible(store, rid)? {
                        *produced += 1;
                        return Ok(Some(Row {
                            rid: Some(rid),
                            tuple,
                        }));
                    }
                }
                Ok(None)
            }
            Operator::IndexScan {
                store,
                index_no,
                cursor,
                limit,
                produced,
                ..
            } => {
                if limit.map_or(false, |n| *produced >= n) {
                    return Ok(None);
                }
                let Some(range) = cursor.as_mut() else {
                    return Err(Error::InternalInvariant("index scan not opened".to_string()));
                };
                for entry in range.by_ref() {
                    cx.check_cancelled()?;
                    let (key, value) = entry?;
                    let rid = RowId::from_bytes(&value).ok_or_else(|| {
                        Error::InternalInvariant(format!(
                            "index '{}' holds a malformed row id",
                            store.def.indexes[*index_no].name
                        ))
                    })?;
                    let Some(tuple) = cx.fetch_visible(store, rid)? else {
                        continue;
                    };
                    // entries of other versions of the row
                    if store.index_key(*index_no, &tuple, rid) != key {
                        trace!(%rid, "skipping stale index entry");
                        continue;
                    }
                    *produced += 1;
                    return Ok(Some(Row {
                        rid: Some(rid),
                        tuple,
                    }));
                }
                Ok(None)
            }
            Operator::Filter { input, predicate } => {
                while let Some(row) = input.next(cx)? {
                    if predicate.matches(&row.tuple)? {
                        return Ok(Some(row));
                    }
                }
                Ok(None)
            }
            Operator::Project { input, columns } => Ok(input.next(cx)?.map(|row| Row {
                rid: None,
                tuple: row.tuple.project(columns),
            })),
            Operator::Sort {
                input,
                keys,
                limit,
                spill_bytes,
                output,
            } => {
                if output.is_none() {
                    let mut sorter = ExternalSorter::new(keys.clone(), *limit, *spill_bytes);
                    while let Some(row) = input.next(cx)? {
                        sorter.push(row.tuple)?;
                    }
                    *output = Some(sorter.finish()?);
                }
                match output.as_mut().and_then(Iterator::next) {
                    Some(tuple) => Ok(Some(Row {
                        rid: None,
                        tuple: tuple?,
                    })),
                    None => Ok(None),
                }
            }
            Operator::Limit {
                input,
                limit,
                offset,
                skipped,
                produced,
            } => {
                if limit.map_or(false, |n| *produced >= n) {
                    return Ok(None);
                }
                while *skipped < *offset {
                    if input.next(cx)?.is_none() {
                        return Ok(None);
                    }
                    *skipped += 1;
                }
                let row = input.next(cx)?;
                if row.is_some() {
                    *produced += 1;
                }
                Ok(row)
            }
            Operator::Insert { store, rows, done } => {
                if *done {
                    return Ok(None);
                }
                *done = true;
                let mut count = 0;
                for values in std::mem::take(rows) {
                    cx.check_cancelled()?;
                    cx.insert_row(store, values)?;
                    count += 1;
                }
                Ok(Some(count_row(count)))
            }
            Operator::Update {
                input,
                store,
                assignments,
                predicate,
                done,
            } => {
                if *done {
                    return Ok(None);
                }
                *done = true;
                let targets = Self::collect_targets(input, cx)?;
                let check = recheck(predicate);
                let mut count = 0;
                for rid in targets {
                    if cx.update_row(store, rid, assignments, &check)? {
                        count += 1;
                    }
                }
                Ok(Some(count_row(count)))
            }
            Operator::Delete {
                input,
                store,
                predicate,
                done,
            } => {
                if *done {
                    return Ok(None);
                }
                *done = true;
                let targets = Self::collect_targets(input, cx)?;
                let check = recheck(predicate);
                let mut count = 0;
                for rid in targets {
                    if cx.delete_row(store, rid, &check)? {
                        count += 1;
                    }
                }
                Ok(Some(count_row(count)))
            }
        }
    }

    /// Row ids an UPDATE or DELETE touches, gathered before the first write
    /// so rows it writes are never visited again.
    fn collect_targets(input: &mut Operator, cx: &mut ExecContext<'_>) -> Result<Vec<RowId>> {
        let mut targets = Vec::new();
        while let Some(row) = input.next(cx)? {
            let rid = row.rid.ok_or_else(|| {
                Error::InternalInvariant("write target lost its row id".to_string())
            })?;
            targets.push(rid);
        }
        Ok(targets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compare(column: usize, op: CompareOp, value: Value) -> Predicate {
        Predicate::Compare {
            column,
            name: format!("c{}", column),
            op,
            value,
        }
    }

    #[test]
    fn test_comparisons() {
        let t = Tuple::new(vec![Value::Int32(5), Value::Varchar("b".into())]);
        let cases = [
            (CompareOp::Eq, 5, true),
            (CompareOp::NotEq, 5, false),
            (CompareOp::Lt, 6, true),
            (CompareOp::LtEq, 5, true),
            (CompareOp::Gt, 5, false),
            (CompareOp::GtEq, 4, true),
        ];
        for (op, v, expected) in cases {
            assert_eq!(
                compare(0, op, Value::Int32(v)).matches(&t).unwrap(),
                expected,
                "{} {}",
                op,
                v
            );
        }
        assert!(compare(1, CompareOp::Gt, Value::Varchar("a".into())).matches(&t).unwrap());
    }

    #[test]
    fn test_null_logic() {
        let t = Tuple::new(vec![Value::Null, Value::Int32(1)]);
        let unknown = compare(0, CompareOp::Eq, Value::Int32(1));
        let yes = compare(1, CompareOp::Eq, Value::Int32(1));
        let no = compare(1, CompareOp::Eq, Value::Int32(2));

        assert_eq!(unknown.evaluate(&t).unwrap(), Truth::Unknown);
        assert_eq!(
            Predicate::Not(Box::new(unknown.clone())).evaluate(&t).unwrap(),
            Truth::Unknown
        );
        assert_eq!(
            Predicate::Or(Box::new(unknown.clone()), Box::new(yes.clone())).evaluate(&t).unwrap(),
            Truth::True
        );
        assert_eq!(
            Predicate::And(Box::new(unknown.clone()), Box::new(no)).evaluate(&t).unwrap(),
            Truth::False
        );
        assert!(!Predicate::And(Box::new(unknown), Box::new(yes)).matches(&t).unwrap());

        let is_null = Predicate::IsNull {
            column: 0,
            name: "c0".into(),
            negated: false,
        };
        assert!(is_null.matches(&t).unwrap());
    }

    #[test]
    fn test_mixed_kinds_are_an_error() {
        let t = Tuple::new(vec![Value::Int32(1)]);
        assert!(matches!(
            compare(0, CompareOp::Eq, Value::Varchar("1".into())).evaluate(&t),
            Err(Error::TypeMismatch(_))
        ));
    }
}

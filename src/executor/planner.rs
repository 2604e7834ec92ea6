//! Query Planner for EmberDB
//!
//! This module converts a parsed statement into a tree of physical
//! operators. Planning is rule based and deterministic:
//!
//! 1. names are resolved against the catalog;
//! 2. top-level AND conjuncts comparing an indexed column with a literal
//!    are sargable;
//! 3. the index matching the most equality columns (then a range on the
//!    next column, then declaration order, primary key first) becomes an
//!    `IndexSeek` or `IndexRange`; without one the table is heap scanned;
//! 4. every other conjunct is kept in a `Filter`, `Project` goes on top;
//! 5. ORDER BY matching the key order of the chosen index needs no `Sort`;
//! 6. LIMIT is pushed into the scan when nothing above it drops or reorders
//!    rows, and bounds the `Sort` otherwise.

use std::fmt;
use std::ops::Bound;

use crate::catalog::{Catalog, TableDef};
use crate::error::{Error, Result};
use crate::sql::ast::*;
use crate::storage::btree::Direction;
use crate::storage::codec;
use crate::storage::disk::TableId;
use crate::storage::tuple::Value;

/// Default threshold above which a sort spills to disk
pub const DEFAULT_SORT_SPILL_BYTES: usize = 4 * 1024 * 1024;

/// A WHERE clause bound to column positions and typed values
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Compare {
        column: usize,
        name: String,
        op: CompareOp,
        value: Value,
    },
    IsNull {
        column: usize,
        name: String,
        negated: bool,
    },
    And(Box<Predicate>, Box<Predicate>),
    Or(Box<Predicate>, Box<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    /// Rebuild a conjunction from its parts
    fn conjunction(mut parts: Vec<Predicate>) -> Option<Predicate> {
        let first = if parts.is_empty() {
            return None;
        } else {
            parts.remove(0)
        };
        Some(
            parts
                .into_iter()
                .fold(first, |acc, p| Predicate::And(Box::new(acc), Box::new(p))),
        )
    }

    fn split_conjuncts(self, out: &mut Vec<Predicate>) {
        match self {
            Predicate::And(l, r) => {
                l.split_conjuncts(out);
                r.split_conjuncts(out);
            }
            other => out.push(other),
        }
    }
}

fn fmt_value(f: &mut fmt::Formatter<'_>, value: &Value) -> fmt::Result {
    match value {
        Value::Varchar(s) => write!(f, "'{}'", s.replace('\'', "''")),
        Value::Date(_) => write!(f, "DATE '{}'", value),
        Value::Time(_) => write!(f, "TIME '{}'", value),
        Value::Timestamp(_) => write!(f, "TIMESTAMP '{}'", value),
        other => write!(f, "{}", other),
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Compare { name, op, value, .. } => {
                write!(f, "{} {} ", name, op)?;
                fmt_value(f, value)
            }
            Predicate::IsNull { name, negated, .. } => {
                write!(f, "{} IS {}NULL", name, if *negated { "NOT " } else { "" })
            }
            Predicate::And(l, r) => write!(f, "({} AND {})", l, r),
            Predicate::Or(l, r) => write!(f, "({} OR {})", l, r),
            Predicate::Not(p) => write!(f, "NOT {}", p),
        }
    }
}

/// Sort key
#[derive(Debug, Clone, PartialEq)]
pub struct SortKey {
    pub column: usize,
    pub name: String,
    pub ascending: bool,
}

/// Key range over one index
#[derive(Debug, Clone, PartialEq)]
pub struct IndexScan {
    pub table: String,
    pub table_id: TableId,
    pub index: String,
    /// Position in the table's index list
    pub index_no: usize,
    pub lo: Bound<Vec<u8>>,
    pub hi: Bound<Vec<u8>>,
    pub direction: Direction,
    /// Stop after this many rows
    pub limit: Option<u64>,
    /// Key condition, for EXPLAIN
    pub condition: String,
}

/// Physical plan node
#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
    /// Visit every row in page order
    HeapScan {
        table: String,
        table_id: TableId,
        limit: Option<u64>,
    },
    /// Equality on every column of an index
    IndexSeek(IndexScan),
    /// Any other key range
    IndexRange(IndexScan),
    Filter {
        input: Box<Plan>,
        predicate: Predicate,
    },
    Project {
        input: Box<Plan>,
        columns: Vec<usize>,
        names: Vec<String>,
    },
    Sort {
        input: Box<Plan>,
        keys: Vec<SortKey>,
        /// Only this many leading rows are needed
        limit: Option<u64>,
        /// Estimated input size from table statistics
        estimated_bytes: Option<u64>,
        spill_bytes: usize,
    },
    Limit {
        input: Box<Plan>,
        limit: Option<u64>,
        offset: u64,
    },
    /// Full-width rows; hidden row ids are assigned at execution
    Insert {
        table: String,
        table_id: TableId,
        rows: Vec<Vec<Value>>,
    },
    Update {
        input: Box<Plan>,
        table: String,
        table_id: TableId,
        assignments: Vec<(usize, Value)>,
        /// Re-checked against the newest version before writing
        predicate: Option<Predicate>,
    },
    Delete {
        input: Box<Plan>,
        table: String,
        table_id: TableId,
        predicate: Option<Predicate>,
    },
}

impl Plan {
    /// Output column names of a query plan
    pub fn columns(&self) -> Vec<String> {
        match self {
            Plan::Project { names, .. } => names.clone(),
            Plan::Filter { input, .. } | Plan::Sort { input, .. } | Plan::Limit { input, .. } => {
                input.columns()
            }
            _ => Vec::new(),
        }
    }

    /// The table the plan reads or writes
    pub fn table_id(&self) -> TableId {
        match self {
            Plan::HeapScan { table_id, .. }
            | Plan::Insert { table_id, .. }
            | Plan::Update { table_id, .. }
            | Plan::Delete { table_id, .. } => *table_id,
            Plan::IndexSeek(scan) | Plan::IndexRange(scan) => scan.table_id,
            Plan::Filter { input, .. }
            | Plan::Project { input, .. }
            | Plan::Sort { input, .. }
            | Plan::Limit { input, .. } => input.table_id(),
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(self, Plan::Insert { .. } | Plan::Update { .. } | Plan::Delete { .. })
    }

    /// Indented operator tree, one node per line
    pub fn explain(&self) -> String {
        let mut out = String::new();
        self.render(0, &mut out);
        out
    }

    fn render(&self, depth: usize, out: &mut String) {
        let pad = "  ".repeat(depth);
        let line = match self {
            Plan::HeapScan { table, limit, .. } => {
                format!("HeapScan {}{}", table, limit_note(*limit))
            }
            Plan::IndexSeek(scan) => format!(
                "IndexSeek {}.{} ({}){}",
                scan.table,
                scan.index,
                scan.condition,
                limit_note(scan.limit)
            ),
            Plan::IndexRange(scan) => format!(
                "IndexRange {}.{} ({}) {}{}",
                scan.table,
                scan.index,
                scan.condition,
                match scan.direction {
                    Direction::Forward => "forward",
                    Direction::Reverse => "reverse",
                },
                limit_note(scan.limit)
            ),
            Plan::Filter { predicate, .. } => format!("Filter {}", predicate),
            Plan::Project { names, .. } => format!("Project [{}]", names.join(", ")),
            Plan::Sort {
                keys,
                limit,
                estimated_bytes,
                spill_bytes,
                ..
            } => {
                let keys: Vec<String> = keys
                    .iter()
                    .map(|k| format!("{} {}", k.name, if k.ascending { "ASC" } else { "DESC" }))
                    .collect();
                let estimate = match estimated_bytes {
                    Some(bytes) if *bytes > *spill_bytes as u64 => {
                        format!("estimated {} bytes, external", bytes)
                    }
                    Some(bytes) => format!("estimated {} bytes, in memory", bytes),
                    None => "no statistics".to_string(),
                };
                let top = limit.map(|n| format!(" top {}", n)).unwrap_or_default();
                format!("Sort [{}]{} ({})", keys.join(", "), top, estimate)
            }
            Plan::Limit { limit, offset, .. } => match limit {
                Some(n) => format!("Limit {} offset {}", n, offset),
                None => format!("Offset {}", offset),
            },
            Plan::Insert { table, rows, .. } => format!("Insert {} ({} rows)", table, rows.len()),
            Plan::Update {
                table, assignments, ..
            } => format!("Update {} ({} columns)", table, assignments.len()),
            Plan::Delete { table, .. } => format!("Delete {}", table),
        };
        out.push_str(&pad);
        out.push_str(&line);
        out.push('\n');
        match self {
            Plan::Filter { input, .. }
            | Plan::Project { input, .. }
            | Plan::Sort { input, .. }
            | Plan::Limit { input, .. }
            | Plan::Update { input, .. }
            | Plan::Delete { input, .. } => input.render(depth + 1, out),
            _ => {}
        }
    }
}

fn limit_note(limit: Option<u64>) -> String {
    limit.map(|n| format!(" limit {}", n)).unwrap_or_default()
}

/// A sargable conjunct: `column op value` with a non-null value
#[derive(Debug, Clone)]
struct KeyCondition {
    conjunct: usize,
    column: usize,
    op: CompareOp,
    value: Value,
}

/// The access path picked for a table
struct AccessPath {
    plan: Plan,
    /// Conjuncts enforced by the key range
    consumed: Vec<usize>,
    /// Columns of the index key in order, with those pinned by equality
    key_columns: Vec<usize>,
    eq_columns: Vec<usize>,
}

/// Query Planner
pub struct Planner<'a> {
    catalog: &'a Catalog,
    sort_spill_bytes: usize,
}

impl<'a> Planner<'a> {
    /// Create a new planner
    pub fn new(catalog: &'a Catalog) -> Self {
        Self {
            catalog,
            sort_spill_bytes: DEFAULT_SORT_SPILL_BYTES,
        }
    }

    pub fn with_sort_spill_bytes(mut self, bytes: usize) -> Self {
        self.sort_spill_bytes = bytes;
        self
    }

    /// Plan a data statement
    pub fn plan(&self, stmt: &Statement) -> Result<Plan> {
        match stmt {
            Statement::Select(select) => self.plan_select(select),
            Statement::Insert(insert) => self.plan_insert(insert),
            Statement::Update(update) => self.plan_update(update),
            Statement::Delete(delete) => self.plan_delete(delete),
            Statement::Explain(_) => Err(Error::Unsupported("nested EXPLAIN".to_string())),
            _ => Err(Error::InvalidArgument(
                "only SELECT, INSERT, UPDATE and DELETE have a query plan".to_string(),
            )),
        }
    }

    /// EXPLAIN output for a data statement
    pub fn explain(&self, stmt: &Statement) -> Result<String> {
        Ok(self.plan(stmt)?.explain())
    }

    fn resolve(def: &TableDef, column: &str) -> Result<usize> {
        def.schema
            .get_column_index(column)
            .ok_or_else(|| Error::UnresolvedColumn {
                table: def.name.clone(),
                column: column.to_string(),
            })
    }

    fn bind(def: &TableDef, expr: &Expr) -> Result<Predicate> {
        Ok(match expr {
            Expr::Compare { column, op, value } => {
                let idx = Self::resolve(def, column)?;
                let col = &def.columns()[idx];
                Predicate::Compare {
                    column: idx,
                    name: col.name.clone(),
                    op: *op,
                    value: value.bind(col.data_type)?,
                }
            }
            Expr::IsNull { column, negated } => {
                let idx = Self::resolve(def, column)?;
                Predicate::IsNull {
                    column: idx,
                    name: def.columns()[idx].name.clone(),
                    negated: *negated,
                }
            }
            Expr::And(l, r) => Predicate::And(Box::new(Self::bind(def, l)?), Box::new(Self::bind(def, r)?)),
            Expr::Or(l, r) => Predicate::Or(Box::new(Self::bind(def, l)?), Box::new(Self::bind(def, r)?)),
            Expr::Not(e) => Predicate::Not(Box::new(Self::bind(def, e)?)),
        })
    }

    fn plan_select(&self, select: &SelectStatement) -> Result<Plan> {
        let def = self.catalog.get_table(&select.from)?;
        let (columns, names) = match &select.projection {
            Projection::All => {
                let cols = def.visible_columns();
                let names = cols.iter().map(|&i| def.columns()[i].name.clone()).collect();
                (cols, names)
            }
            Projection::Columns(list) => {
                let mut cols = Vec::with_capacity(list.len());
                let mut names = Vec::with_capacity(list.len());
                for name in list {
                    let idx = Self::resolve(&def, name)?;
                    cols.push(idx);
                    names.push(def.columns()[idx].name.clone());
                }
                (cols, names)
            }
        };
        let order: Vec<SortKey> = select
            .order_by
            .iter()
            .map(|item| {
                let column = Self::resolve(&def, &item.column)?;
                Ok(SortKey {
                    column,
                    name: def.columns()[column].name.clone(),
                    ascending: item.ascending,
                })
            })
            .collect::<Result<_>>()?;
        let predicate = select
            .where_clause
            .as_ref()
            .map(|e| Self::bind(&def, e))
            .transpose()?;

        let mut conjuncts = Vec::new();
        if let Some(p) = predicate {
            p.split_conjuncts(&mut conjuncts);
        }
        let wants_order = !order.is_empty() && select.limit.is_some();
        let access = self.choose_access(&def, &conjuncts, if wants_order { &order } else { &[] });

        let (mut plan, consumed, satisfied) = match access {
            Some(mut path) => {
                let satisfied = order_direction(&order, &path.key_columns, &path.eq_columns);
                if let (Some(dir), Plan::IndexRange(scan) | Plan::IndexSeek(scan)) = (satisfied, &mut path.plan) {
                    scan.direction = dir;
                }
                (path.plan, path.consumed, satisfied.is_some())
            }
            None => (
                Plan::HeapScan {
                    table: def.name.clone(),
                    table_id: def.id,
                    limit: None,
                },
                Vec::new(),
                order.is_empty(),
            ),
        };

        let residual: Vec<Predicate> = conjuncts
            .into_iter()
            .enumerate()
            .filter(|(i, _)| !consumed.contains(i))
            .map(|(_, p)| p)
            .collect();
        let filtered = !residual.is_empty();
        if let Some(predicate) = Predicate::conjunction(residual) {
            plan = Plan::Filter {
                input: Box::new(plan),
                predicate,
            };
        }

        let offset = select.offset.unwrap_or(0);
        let needed = select.limit.map(|n| n.saturating_add(offset));
        if !satisfied {
            let estimated_bytes = def.stats.as_ref().map(|s| s.estimated_bytes(needed));
            plan = Plan::Sort {
                input: Box::new(plan),
                keys: order,
                limit: needed,
                estimated_bytes,
                spill_bytes: self.sort_spill_bytes,
            };
        } else if !filtered {
            push_limit(&mut plan, needed);
        }
        if select.limit.is_some() || offset > 0 {
            plan = Plan::Limit {
                input: Box::new(plan),
                limit: select.limit,
                offset,
            };
        }
        Ok(Plan::Project {
            input: Box::new(plan),
            columns,
            names,
        })
    }

    /// Pick an index for the sargable conjuncts, or for `order` alone when
    /// no conjunct is sargable.
    fn choose_access(&self, def: &TableDef, conjuncts: &[Predicate], order: &[SortKey]) -> Option<AccessPath> {
        let conditions: Vec<KeyCondition> = conjuncts
            .iter()
            .enumerate()
            .filter_map(|(i, p)| match p {
                Predicate::Compare {
                    column, op, value, ..
                } if *op != CompareOp::NotEq && !value.is_null() => Some(KeyCondition {
                    conjunct: i,
                    column: *column,
                    op: *op,
                    value: value.clone(),
                }),
                _ => None,
            })
            .collect();

        // (eq columns, has range) per index, first best wins
        let mut best: Option<(usize, (usize, bool))> = None;
        for (i, idx) in def.indexes.iter().enumerate() {
            let eq = idx
                .columns
                .iter()
                .take_while(|&&c| conditions.iter().any(|k| k.column == c && k.op == CompareOp::Eq))
                .count();
            let range = idx.columns.get(eq).map_or(false, |&c| {
                conditions.iter().any(|k| k.column == c && k.op != CompareOp::Eq)
            });
            let score = (eq, range);
            if score == (0, false) {
                continue;
            }
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((i, score));
            }
        }

        match best {
            Some((i, _)) => Some(self.key_range(def, i, &conditions)),
            None if !order.is_empty() => def
                .indexes
                .iter()
                .position(|idx| order_direction(order, &key_columns(def, idx.columns.as_slice(), idx.primary), &[]).is_some())
                .map(|i| self.key_range(def, i, &[])),
            None => None,
        }
    }

    fn key_range(&self, def: &TableDef, index_no: usize, conditions: &[KeyCondition]) -> AccessPath {
        let idx = &def.indexes[index_no];
        let mut consumed = Vec::new();
        let mut eq_values = Vec::new();
        let mut eq_columns = Vec::new();
        let mut described = Vec::new();
        for &c in &idx.columns {
            match conditions.iter().find(|k| k.column == c && k.op == CompareOp::Eq) {
                Some(k) => {
                    consumed.push(k.conjunct);
                    eq_values.push(k.value.clone());
                    eq_columns.push(c);
                    described.push(describe(def, k));
                }
                None => break,
            }
        }
        let prefix = codec::encode_key_tuple(eq_values.iter());
        let full = eq_columns.len() == idx.columns.len();

        let (lo, hi) = match idx.columns.get(eq_columns.len()) {
            Some(&c) => {
                let mut lower: Option<&KeyCondition> = None;
                let mut upper: Option<&KeyCondition> = None;
                for k in conditions.iter().filter(|k| k.column == c) {
                    match k.op {
                        CompareOp::Gt | CompareOp::GtEq => {
                            if lower.map_or(true, |cur| tighter(k, cur, true)) {
                                lower = Some(k);
                            }
                        }
                        CompareOp::Lt | CompareOp::LtEq => {
                            if upper.map_or(true, |cur| tighter(k, cur, false)) {
                                upper = Some(k);
                            }
                        }
                        _ => {}
                    }
                }
                let ranged = lower.is_some() || upper.is_some();
                for k in conditions
                    .iter()
                    .filter(|k| k.column == c && k.op != CompareOp::Eq)
                {
                    consumed.push(k.conjunct);
                }
                if let Some(k) = lower {
                    described.push(describe(def, k));
                }
                if let Some(k) = upper {
                    described.push(describe(def, k));
                }
                if ranged {
                    let tag = codec::tag_of(def.columns()[c].data_type);
                    (lower_bound(&prefix, lower, tag), upper_bound(&prefix, upper, tag))
                } else {
                    prefix_bounds(&prefix)
                }
            }
            None => prefix_bounds(&prefix),
        };

        let scan = IndexScan {
            table: def.name.clone(),
            table_id: def.id,
            index: idx.name.clone(),
            index_no,
            lo,
            hi,
            direction: Direction::Forward,
            limit: None,
            condition: if described.is_empty() {
                "full".to_string()
            } else {
                described.join(" AND ")
            },
        };
        AccessPath {
            plan: if full { Plan::IndexSeek(scan) } else { Plan::IndexRange(scan) },
            consumed,
            key_columns: key_columns(def, &idx.columns, idx.primary),
            eq_columns,
        }
    }

    fn plan_insert(&self, insert: &InsertStatement) -> Result<Plan> {
        let def = self.catalog.get_table(&insert.table)?;
        let targets: Vec<usize> = match &insert.columns {
            Some(names) => {
                let mut targets = Vec::with_capacity(names.len());
                for name in names {
                    let idx = Self::resolve(&def, name)?;
                    if targets.contains(&idx) {
                        return Err(Error::InvalidArgument(format!(
                            "column '{}' appears twice in INSERT",
                            name
                        )));
                    }
                    targets.push(idx);
                }
                targets
            }
            None => def.visible_columns(),
        };
        if let Some(hidden) = targets.iter().find(|&&i| def.columns()[i].hidden) {
            return Err(Error::InvalidArgument(format!(
                "column '{}' is assigned by the engine",
                def.columns()[*hidden].name
            )));
        }

        let mut rows = Vec::with_capacity(insert.rows.len());
        for literals in &insert.rows {
            if literals.len() != targets.len() {
                return Err(Error::InvalidArgument(format!(
                    "INSERT has {} values for {} columns",
                    literals.len(),
                    targets.len()
                )));
            }
            let mut row: Vec<Value> = def
                .columns()
                .iter()
                .map(|c| c.default.clone().unwrap_or(Value::Null))
                .collect();
            for (&idx, literal) in targets.iter().zip(literals) {
                row[idx] = literal.bind(def.columns()[idx].data_type)?;
            }
            rows.push(row);
        }
        Ok(Plan::Insert {
            table: def.name.clone(),
            table_id: def.id,
            rows,
        })
    }

    /// Scan and filter for the rows an UPDATE or DELETE touches
    fn plan_target(&self, def: &TableDef, where_clause: Option<&Expr>) -> Result<(Plan, Option<Predicate>)> {
        let predicate = where_clause.map(|e| Self::bind(def, e)).transpose()?;
        let mut conjuncts = Vec::new();
        if let Some(p) = predicate.clone() {
            p.split_conjuncts(&mut conjuncts);
        }
        let (mut plan, consumed) = match self.choose_access(def, &conjuncts, &[]) {
            Some(path) => (path.plan, path.consumed),
            None => (
                Plan::HeapScan {
                    table: def.name.clone(),
                    table_id: def.id,
                    limit: None,
                },
                Vec::new(),
            ),
        };
        let residual: Vec<Predicate> = conjuncts
            .into_iter()
            .enumerate()
            .filter(|(i, _)| !consumed.contains(i))
            .map(|(_, p)| p)
            .collect();
        if let Some(predicate) = Predicate::conjunction(residual) {
            plan = Plan::Filter {
                input: Box::new(plan),
                predicate,
            };
        }
        Ok((plan, predicate))
    }

    fn plan_update(&self, update: &UpdateStatement) -> Result<Plan> {
        let def = self.catalog.get_table(&update.table)?;
        let mut assignments: Vec<(usize, Value)> = Vec::with_capacity(update.assignments.len());
        for assignment in &update.assignments {
            let idx = Self::resolve(&def, &assignment.column)?;
            let col = &def.columns()[idx];
            if col.hidden {
                return Err(Error::InvalidArgument(format!(
                    "column '{}' is assigned by the engine",
                    col.name
                )));
            }
            if assignments.iter().any(|(i, _)| *i == idx) {
                return Err(Error::InvalidArgument(format!(
                    "column '{}' is assigned twice",
                    col.name
                )));
            }
            assignments.push((idx, assignment.value.bind(col.data_type)?));
        }
        let (input, predicate) = self.plan_target(&def, update.where_clause.as_ref())?;
        Ok(Plan::Update {
            input: Box::new(input),
            table: def.name.clone(),
            table_id: def.id,
            assignments,
            predicate,
        })
    }

    fn plan_delete(&self, delete: &DeleteStatement) -> Result<Plan> {
        let def = self.catalog.get_table(&delete.table)?;
        let (input, predicate) = self.plan_target(&def, delete.where_clause.as_ref())?;
        Ok(Plan::Delete {
            input: Box::new(input),
            table: def.name.clone(),
            table_id: def.id,
            predicate,
        })
    }
}

/// Index key columns in key order: the indexed columns, then the primary
/// key for secondary indexes.
fn key_columns(def: &TableDef, columns: &[usize], primary: bool) -> Vec<usize> {
    let mut out = columns.to_vec();
    if !primary {
        out.extend(def.primary_key.iter().copied());
    }
    out
}

/// Scan direction that yields rows in `order`, if the index can.
fn order_direction(order: &[SortKey], key_columns: &[usize], eq_columns: &[usize]) -> Option<Direction> {
    let rest: Vec<&SortKey> = order
        .iter()
        .filter(|k| !eq_columns.contains(&k.column))
        .collect();
    let Some(first) = rest.first() else {
        return Some(Direction::Forward);
    };
    if rest.iter().any(|k| k.ascending != first.ascending) {
        return None;
    }
    let free: Vec<usize> = key_columns
        .iter()
        .copied()
        .filter(|c| !eq_columns.contains(c))
        .collect();
    if rest.len() > free.len() || rest.iter().zip(&free).any(|(k, c)| k.column != *c) {
        return None;
    }
    Some(if first.ascending {
        Direction::Forward
    } else {
        Direction::Reverse
    })
}

fn push_limit(plan: &mut Plan, needed: Option<u64>) {
    match plan {
        Plan::HeapScan { limit, .. } => *limit = needed,
        Plan::IndexSeek(scan) | Plan::IndexRange(scan) => scan.limit = needed,
        _ => {}
    }
}

fn describe(def: &TableDef, k: &KeyCondition) -> String {
    Predicate::Compare {
        column: k.column,
        name: def.columns()[k.column].name.clone(),
        op: k.op,
        value: k.value.clone(),
    }
    .to_string()
}

/// Whether `a` bounds tighter than `b`: the larger lower bound or the
/// smaller upper bound, with an exclusive bound winning a tie.
fn tighter(a: &KeyCondition, b: &KeyCondition, lower: bool) -> bool {
    match a.value.compare(&b.value).ok().and_then(|c| c.to_ordering()) {
        Some(std::cmp::Ordering::Greater) => lower,
        Some(std::cmp::Ordering::Less) => !lower,
        Some(std::cmp::Ordering::Equal) => matches!(a.op, CompareOp::Gt | CompareOp::Lt),
        None => false,
    }
}

fn successor(bytes: Vec<u8>) -> Bound<Vec<u8>> {
    match codec::prefix_successor(&bytes) {
        Some(next) => Bound::Excluded(next),
        None => Bound::Unbounded,
    }
}

/// Every key starting with `prefix`
fn prefix_bounds(prefix: &[u8]) -> (Bound<Vec<u8>>, Bound<Vec<u8>>) {
    if prefix.is_empty() {
        return (Bound::Unbounded, Bound::Unbounded);
    }
    (Bound::Included(prefix.to_vec()), successor(prefix.to_vec()))
}

/// Keys after `prefix` whose next column is above `cond`; without a
/// condition, every non-null value of a column with key tag `tag`.
fn lower_bound(prefix: &[u8], cond: Option<&KeyCondition>, tag: u8) -> Bound<Vec<u8>> {
    let mut key = prefix.to_vec();
    match cond {
        None => {
            key.push(tag);
            Bound::Included(key)
        }
        Some(k) => {
            codec::encode_key_into(&mut key, &k.value);
            if k.op == CompareOp::GtEq {
                Bound::Included(key)
            } else {
                match successor(key) {
                    Bound::Excluded(next) => Bound::Included(next),
                    other => other,
                }
            }
        }
    }
}

fn upper_bound(prefix: &[u8], cond: Option<&KeyCondition>, tag: u8) -> Bound<Vec<u8>> {
    let mut key = prefix.to_vec();
    match cond {
        None => {
            key.push(tag + 1);
            Bound::Excluded(key)
        }
        Some(k) => {
            codec::encode_key_into(&mut key, &k.value);
            if k.op == CompareOp::Lt {
                Bound::Excluded(key)
            } else {
                successor(key)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Column, DataType, IndexDef, TableStatistics};
    use crate::sql::parse_statement;

    fn catalog() -> Catalog {
        let catalog = Catalog::new();
        let def = TableDef::new(
            "users",
            vec![
                Column::new("id", DataType::Int32),
                Column::new("name", DataType::Varchar),
                Column::new("email", DataType::Varchar).unique(true),
                Column::new("age", DataType::Int32).default(Value::Int32(18)),
            ],
            &["id".to_string()],
            &[],
        )
        .unwrap();
        catalog.create_table(def).unwrap();
        catalog
            .add_index("users", IndexDef::new("idx_age", vec![3]))
            .unwrap();
        catalog
    }

    fn plan(catalog: &Catalog, sql: &str) -> Result<Plan> {
        Planner::new(catalog).plan(&parse_statement(sql)?)
    }

    fn unwrap_project(plan: Plan) -> Plan {
        match plan {
            Plan::Project { input, .. } => *input,
            other => panic!("expected Project, got {:?}", other),
        }
    }

    #[test]
    fn test_plan_simple_select() {
        let catalog = catalog();
        let plan = plan(&catalog, "SELECT * FROM users WHERE name = 'x'").unwrap();
        assert_eq!(plan.columns(), vec!["id", "name", "email", "age"]);
        match unwrap_project(plan) {
            Plan::Filter { input, .. } => assert!(matches!(*input, Plan::HeapScan { .. })),
            other => panic!("expected Filter, got {:?}", other),
        }
    }

    #[test]
    fn test_primary_key_equality_is_a_seek() {
        let catalog = catalog();
        let plan = plan(&catalog, "SELECT name FROM users WHERE id = 1").unwrap();
        match unwrap_project(plan) {
            Plan::IndexSeek(scan) => {
                assert_eq!(scan.index, "users_pkey");
                let key = codec::encode_key(&Value::Int32(1));
                assert_eq!(scan.lo, Bound::Included(key.clone()));
                assert_eq!(scan.hi, successor(key));
            }
            other => panic!("expected IndexSeek, got {:?}", other),
        }
    }

    #[test]
    fn test_range_with_matching_order_needs_no_sort() {
        let catalog = catalog();
        let plan = plan(
            &catalog,
            "SELECT id FROM users WHERE age >= 30 AND age < 40 ORDER BY age",
        )
        .unwrap();
        match unwrap_project(plan) {
            Plan::IndexRange(scan) => {
                assert_eq!(scan.index, "idx_age");
                assert_eq!(scan.direction, Direction::Forward);
                assert_eq!(scan.lo, Bound::Included(codec::encode_key(&Value::Int32(30))));
                assert_eq!(scan.hi, Bound::Excluded(codec::encode_key(&Value::Int32(40))));
                assert_eq!(scan.condition, "age >= 30 AND age < 40");
            }
            other => panic!("expected IndexRange, got {:?}", other),
        }
    }

    #[test]
    fn test_descending_order_reverses_the_scan() {
        let catalog = catalog();
        let plan = plan(&catalog, "SELECT id FROM users WHERE age > 60 ORDER BY age DESC").unwrap();
        match unwrap_project(plan) {
            Plan::IndexRange(scan) => {
                assert_eq!(scan.direction, Direction::Reverse);
                // unbounded above, but NULLs stay out
                assert_eq!(scan.hi, Bound::Excluded(vec![codec::tag_of(DataType::Int32) + 1]));
            }
            other => panic!("expected IndexRange, got {:?}", other),
        }
    }

    #[test]
    fn test_residual_predicates_stay_in_filter() {
        let catalog = catalog();
        let plan = plan(
            &catalog,
            "SELECT * FROM users WHERE age = 30 AND (name = 'a' OR name = 'b')",
        )
        .unwrap();
        match unwrap_project(plan) {
            Plan::Filter { input, predicate } => {
                assert_eq!(predicate.to_string(), "(name = 'a' OR name = 'b')");
                assert!(matches!(*input, Plan::IndexSeek(ref s) if s.index == "idx_age"));
            }
            other => panic!("expected Filter, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_column() {
        let catalog = catalog();
        for sql in [
            "SELECT nope FROM users",
            "SELECT * FROM users WHERE nope = 1",
            "SELECT * FROM users ORDER BY nope",
            "UPDATE users SET nope = 1",
        ] {
            assert!(
                matches!(plan(&catalog, sql), Err(Error::UnresolvedColumn { .. })),
                "{}",
                sql
            );
        }
        assert!(matches!(
            plan(&catalog, "SELECT * FROM nobody"),
            Err(Error::NoSuchTable(_))
        ));
    }

    #[test]
    fn test_limit_placement() {
        let catalog = catalog();
        let plan_ = plan(&catalog, "SELECT * FROM users LIMIT 5 OFFSET 2").unwrap();
        match unwrap_project(plan_) {
            Plan::Limit { input, limit, offset } => {
                assert_eq!((limit, offset), (Some(5), 2));
                assert!(matches!(*input, Plan::HeapScan { limit: Some(7), .. }));
            }
            other => panic!("expected Limit, got {:?}", other),
        }

        let plan_ = plan(&catalog, "SELECT * FROM users ORDER BY name LIMIT 3").unwrap();
        match unwrap_project(plan_) {
            Plan::Limit { input, .. } => match *input {
                Plan::Sort { limit, input, .. } => {
                    assert_eq!(limit, Some(3));
                    assert!(matches!(*input, Plan::HeapScan { limit: None, .. }));
                }
                other => panic!("expected Sort, got {:?}", other),
            },
            other => panic!("expected Limit, got {:?}", other),
        }

        // ordered index scan instead of a sort
        let plan_ = plan(&catalog, "SELECT * FROM users ORDER BY id DESC LIMIT 3").unwrap();
        match unwrap_project(plan_) {
            Plan::Limit { input, .. } => {
                assert!(matches!(*input, Plan::IndexRange(ref s)
                    if s.direction == Direction::Reverse && s.limit == Some(3)));
            }
            other => panic!("expected Limit, got {:?}", other),
        }
    }

    #[test]
    fn test_explain_shows_sort_estimate() {
        let catalog = catalog();
        catalog
            .update_table_stats(
                "users",
                TableStatistics {
                    row_count: 1000,
                    avg_row_bytes: 100,
                    distinct: vec![],
                },
            )
            .unwrap();
        let planner = Planner::new(&catalog).with_sort_spill_bytes(50_000);
        let text = planner
            .explain(&parse_statement("SELECT name FROM users ORDER BY name").unwrap())
            .unwrap();
        assert_eq!(
            text,
            "Project [name]\n  Sort [name ASC] (estimated 100000 bytes, external)\n    HeapScan users\n"
        );
    }

    #[test]
    fn test_insert_binds_defaults() {
        let catalog = catalog();
        match plan(&catalog, "INSERT INTO users (id, name) VALUES (1, 'a'), (2, NULL)").unwrap() {
            Plan::Insert { rows, .. } => {
                assert_eq!(rows.len(), 2);
                assert_eq!(
                    rows[0],
                    vec![
                        Value::Int32(1),
                        Value::Varchar("a".into()),
                        Value::Null,
                        Value::Int32(18)
                    ]
                );
            }
            other => panic!("expected Insert, got {:?}", other),
        }
        assert!(matches!(
            plan(&catalog, "INSERT INTO users VALUES (1, 'a')"),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            plan(&catalog, "INSERT INTO users (id) VALUES ('abc')"),
            Err(Error::TypeMismatch(_))
        ));
    }

    #[test]
    fn test_update_keeps_predicate_for_recheck() {
        let catalog = catalog();
        match plan(&catalog, "UPDATE users SET name = 'z' WHERE id = 7").unwrap() {
            Plan::Update {
                input,
                assignments,
                predicate,
                ..
            } => {
                assert_eq!(assignments, vec![(1, Value::Varchar("z".into()))]);
                assert_eq!(predicate.unwrap().to_string(), "id = 7");
                assert!(matches!(*input, Plan::IndexSeek(_)));
            }
            other => panic!("expected Update, got {:?}", other),
        }
    }
}

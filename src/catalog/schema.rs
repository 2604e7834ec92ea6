//! Schema definitions for EmberDB
//!
//! This module defines table schemas, column metadata and index descriptors.

use super::types::DataType;
use crate::error::{Error, Result};
use crate::storage::disk::TableId;
use crate::storage::page::{PageId, INVALID_PAGE_ID};
use crate::storage::tuple::Value;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Name of the synthetic row-id column added to tables without a primary key
pub const ROWID_COLUMN: &str = "__rowid";

/// Column definition in a table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    /// Column name
    pub name: String,
    /// Data type
    pub data_type: DataType,
    /// Is this column nullable?
    pub nullable: bool,
    /// Is this column unique on its own?
    pub unique: bool,
    /// Value used when an INSERT omits the column
    pub default: Option<Value>,
    /// Hidden columns are not returned by `SELECT *`
    #[serde(default)]
    pub hidden: bool,
}

impl Column {
    /// Create a new nullable column
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
            unique: false,
            default: None,
            hidden: false,
        }
    }

    /// Set nullable flag
    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    /// Set unique flag
    pub fn unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }

    /// Set default value
    pub fn default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    fn rowid() -> Self {
        Self {
            name: ROWID_COLUMN.to_string(),
            data_type: DataType::Int64,
            nullable: false,
            unique: false,
            default: None,
            hidden: true,
        }
    }
}

/// Ordered column list with a name lookup
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    columns: Vec<Column>,
    #[serde(skip)]
    name_to_index: HashMap<String, usize>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_columns(columns: Vec<Column>) -> Self {
        let mut schema = Self::new();
        for col in columns {
            schema.add_column(col);
        }
        schema
    }

    pub fn add_column(&mut self, column: Column) {
        self.name_to_index
            .insert(column.name.to_ascii_lowercase(), self.columns.len());
        self.columns.push(column);
    }

    /// Rebuild the name lookup after deserialization
    pub(crate) fn reindex(&mut self) {
        self.name_to_index = self
            .columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name.to_ascii_lowercase(), i))
            .collect();
    }

    /// Column names are matched case-insensitively
    pub fn get_column_index(&self, name: &str) -> Option<usize> {
        self.name_to_index.get(&name.to_ascii_lowercase()).copied()
    }

    pub fn get_column(&self, name: &str) -> Option<&Column> {
        self.get_column_index(name).map(|idx| &self.columns[idx])
    }

    pub fn get_column_by_index(&self, index: usize) -> Option<&Column> {
        self.columns.get(index)
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.get_column_index(name).is_some()
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

/// Statistics gathered by ANALYZE
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableStatistics {
    /// Visible row count
    pub row_count: u64,
    /// Average encoded tuple size
    pub avg_row_bytes: u64,
    /// Distinct non-null values per column
    pub distinct: Vec<u64>,
}

impl TableStatistics {
    /// Estimated bytes for `rows` rows, or the whole table when `None`.
    pub fn estimated_bytes(&self, rows: Option<u64>) -> u64 {
        rows.unwrap_or(self.row_count)
            .min(self.row_count)
            .saturating_mul(self.avg_row_bytes)
    }
}

/// Index definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDef {
    /// Index name, unique across the database
    pub name: String,
    /// Positions of the indexed columns
    pub columns: Vec<usize>,
    /// Is this a unique index?
    pub unique: bool,
    /// Is this the primary key index?
    pub primary: bool,
    /// Backs a UNIQUE constraint declared with the table
    #[serde(default)]
    pub constraint: bool,
    /// Root page inside the table file
    pub root_page_id: PageId,
}

impl IndexDef {
    pub fn new(name: impl Into<String>, columns: Vec<usize>) -> Self {
        Self {
            name: name.into(),
            columns,
            unique: false,
            primary: false,
            constraint: false,
            root_page_id: INVALID_PAGE_ID,
        }
    }

    pub fn unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }

    /// Can `DROP INDEX` remove this index?
    pub fn droppable(&self) -> bool {
        !self.primary && !self.constraint
    }

    pub fn primary(mut self, primary: bool) -> Self {
        self.primary = primary;
        if primary {
            self.unique = true;
        }
        self
    }
}

/// Table definition - full table metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDef {
    /// Table name
    pub name: String,
    /// Table ID, also names the table file
    pub id: TableId,
    /// Table schema
    pub schema: Schema,
    /// Primary key column positions
    pub primary_key: Vec<usize>,
    /// Primary index first, then secondaries in creation order
    pub indexes: Vec<IndexDef>,
    /// Table statistics
    pub stats: Option<TableStatistics>,
}

impl TableDef {
    /// Validate a table description and derive its indexes: the primary key
    /// index, one unique index per UNIQUE column and one per `unique_sets`
    /// entry. A table without a primary key gets a hidden row-id key.
    pub fn new(
        name: impl Into<String>,
        columns: Vec<Column>,
        primary_key: &[String],
        unique_sets: &[Vec<String>],
    ) -> Result<Self> {
        let name = name.into();
        if columns.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "table '{}' must have at least one column",
                name
            )));
        }
        let mut schema = Schema::new();
        for col in columns {
            if schema.has_column(&col.name) || col.name.eq_ignore_ascii_case(ROWID_COLUMN) {
                return Err(Error::ColumnExists {
                    table: name.clone(),
                    column: col.name,
                });
            }
            if col.data_type == DataType::Null {
                return Err(Error::TypeMismatch(format!(
                    "column '{}' cannot have type NULL",
                    col.name
                )));
            }
            schema.add_column(col);
        }

        let resolve = |schema: &Schema, cols: &[String]| -> Result<Vec<usize>> {
            cols.iter()
                .map(|c| {
                    schema.get_column_index(c).ok_or_else(|| Error::NoSuchColumn {
                        table: name.clone(),
                        column: c.clone(),
                    })
                })
                .collect()
        };

        let pk = if primary_key.is_empty() {
            schema.add_column(Column::rowid());
            vec![schema.column_count() - 1]
        } else {
            let pk = resolve(&schema, primary_key)?;
            for &i in &pk {
                schema.columns[i].nullable = false;
            }
            pk
        };

        let mut indexes = vec![IndexDef::new(format!("{}_pkey", name), pk.clone()).primary(true)];
        let mut unique_cols: Vec<Vec<usize>> = schema
            .columns()
            .iter()
            .enumerate()
            .filter(|(_, c)| c.unique)
            .map(|(i, _)| vec![i])
            .collect();
        for set in unique_sets {
            unique_cols.push(resolve(&schema, set)?);
        }
        for cols in unique_cols {
            if cols == pk || indexes.iter().any(|idx| idx.columns == cols) {
                continue;
            }
            let suffix: Vec<&str> = cols
                .iter()
                .map(|&i| schema.columns()[i].name.as_str())
                .collect();
            let index = IndexDef::new(format!("{}_{}_key", name, suffix.join("_")), cols).unique(true);
            indexes.push(IndexDef {
                constraint: true,
                ..index
            });
        }

        Ok(Self {
            name,
            id: 0,
            schema,
            primary_key: pk,
            indexes,
            stats: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn columns(&self) -> &[Column] {
        self.schema.columns()
    }

    pub fn get_column(&self, name: &str) -> Option<&Column> {
        self.schema.get_column(name)
    }

    /// Resolve a column name, failing with `NoSuchColumn`.
    pub fn column_index(&self, name: &str) -> Result<usize> {
        self.schema
            .get_column_index(name)
            .ok_or_else(|| Error::NoSuchColumn {
                table: self.name.clone(),
                column: name.to_string(),
            })
    }

    /// Positions of the columns `SELECT *` returns
    pub fn visible_columns(&self) -> Vec<usize> {
        self.columns()
            .iter()
            .enumerate()
            .filter(|(_, c)| !c.hidden)
            .map(|(i, _)| i)
            .collect()
    }

    /// Position of the synthetic row-id column, if the table has one
    pub fn rowid_column(&self) -> Option<usize> {
        self.schema.get_column_index(ROWID_COLUMN)
    }

    pub fn primary_index(&self) -> &IndexDef {
        &self.indexes[0]
    }

    pub fn index(&self, name: &str) -> Option<&IndexDef> {
        self.indexes.iter().find(|idx| idx.name.eq_ignore_ascii_case(name))
    }

    /// Human-readable description used by `.schema`
    pub fn describe(&self) -> String {
        let mut info = format!("Table: {} (id {})\n", self.name, self.id);
        info.push_str("Columns:\n");
        for (i, col) in self.columns().iter().enumerate() {
            if col.hidden {
                continue;
            }
            let mut flags = Vec::new();
            if self.primary_key.contains(&i) {
                flags.push("PRIMARY KEY".to_string());
            }
            if !col.nullable {
                flags.push("NOT NULL".to_string());
            }
            if col.unique {
                flags.push("UNIQUE".to_string());
            }
            if let Some(default) = &col.default {
                flags.push(format!("DEFAULT {}", default));
            }
            let flags = if flags.is_empty() {
                String::new()
            } else {
                format!(" [{}]", flags.join(", "))
            };
            info.push_str(&format!("  {} {}{}\n", col.name, col.data_type, flags));
        }
        info.push_str("Indexes:\n");
        for idx in &self.indexes {
            let cols: Vec<&str> = idx
                .columns
                .iter()
                .map(|&i| self.columns()[i].name.as_str())
                .collect();
            let kind = if idx.primary {
                " PRIMARY"
            } else if idx.unique {
                " UNIQUE"
            } else {
                ""
            };
            info.push_str(&format!("  {} ({}){}\n", idx.name, cols.join(", "), kind));
        }
        if let Some(stats) = &self.stats {
            info.push_str(&format!(
                "Statistics: {} rows, ~{} bytes/row\n",
                stats.row_count, stats.avg_row_bytes
            ));
        }
        info
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users() -> TableDef {
        TableDef::new(
            "users",
            vec![
                Column::new("id", DataType::Int32),
                Column::new("name", DataType::Varchar).nullable(false),
                Column::new("email", DataType::Varchar).unique(true),
            ],
            &["id".to_string()],
            &[],
        )
        .unwrap()
    }

    #[test]
    fn test_schema_creation() {
        let table = users();
        assert_eq!(table.schema().column_count(), 3);
        assert!(table.schema().has_column("ID"));
        assert!(!table.schema().has_column("unknown"));
        assert!(!table.get_column("id").unwrap().nullable);
        assert_eq!(table.primary_key, vec![0]);
    }

    #[test]
    fn test_derived_indexes() {
        let table = users();
        assert_eq!(table.indexes.len(), 2);
        assert_eq!(table.primary_index().name, "users_pkey");
        assert!(table.primary_index().primary);
        let email = table.index("users_email_key").unwrap();
        assert!(email.unique);
        assert_eq!(email.columns, vec![2]);
        assert!(!email.droppable());
        assert!(!table.primary_index().droppable());
        assert!(IndexDef::new("idx", vec![1]).unique(true).droppable());
    }

    #[test]
    fn test_hidden_rowid() {
        let table = TableDef::new("log", vec![Column::new("msg", DataType::Varchar)], &[], &[]).unwrap();
        assert_eq!(table.rowid_column(), Some(1));
        assert_eq!(table.visible_columns(), vec![0]);
        assert_eq!(table.primary_key, vec![1]);
    }

    #[test]
    fn test_duplicate_column() {
        let err = TableDef::new(
            "t",
            vec![Column::new("a", DataType::Int32), Column::new("A", DataType::Int64)],
            &[],
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, Error::ColumnExists { .. }));
    }

    #[test]
    fn test_unknown_key_column() {
        let err = TableDef::new("t", vec![Column::new("a", DataType::Int32)], &["b".to_string()], &[])
            .unwrap_err();
        assert!(matches!(err, Error::NoSuchColumn { .. }));
    }
}

//! System Catalog for EmberDB
//!
//! Table and index metadata, persisted as JSON in the `__tables` file of the
//! data directory. Every change rewrites the file through a temporary file
//! and a rename, so a crash leaves either the old or the new catalog.

use super::schema::{Column, IndexDef, TableDef, TableStatistics};
use super::types::DataType;
use crate::error::{Error, Result};
use crate::storage::disk::TableId;
use crate::storage::page::PageId;
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// File name of the persisted catalog
pub const CATALOG_FILE_NAME: &str = "__tables";

/// System Catalog - manages all database metadata
#[derive(Debug)]
pub struct Catalog {
    path: Option<PathBuf>,
    inner: RwLock<CatalogData>,
}

/// Serializable form of the catalog
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CatalogData {
    tables: IndexMap<String, Arc<TableDef>>,
    next_table_id: TableId,
}

impl Catalog {
    /// Create an in-memory catalog that is never persisted
    pub fn new() -> Self {
        Self {
            path: None,
            inner: RwLock::new(CatalogData {
                tables: IndexMap::new(),
                next_table_id: 1,
            }),
        }
    }

    /// Load the catalog of `dir`, starting empty when none exists yet.
    pub fn open(dir: &Path) -> Result<Self> {
        let path = dir.join(CATALOG_FILE_NAME);
        let data = if path.exists() {
            let json = fs::read_to_string(&path)?;
            let mut data: CatalogData = serde_json::from_str(&json)?;
            for table in data.tables.values_mut() {
                Arc::make_mut(table).schema.reindex();
            }
            data
        } else {
            CatalogData {
                tables: IndexMap::new(),
                next_table_id: 1,
            }
        };
        debug!(tables = data.tables.len(), path = %path.display(), "loaded catalog");
        Ok(Self {
            path: Some(path),
            inner: RwLock::new(data),
        })
    }

    fn save(&self, data: &CatalogData) -> Result<()> {
        let path = match &self.path {
            Some(path) => path,
            None => return Ok(()),
        };
        let json = serde_json::to_string_pretty(data)?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, json)?;
        fs::File::open(&tmp)?.sync_all()?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Register a table, assigning its id. Index names must be unused.
    pub fn create_table(&self, mut def: TableDef) -> Result<Arc<TableDef>> {
        let mut data = self.inner.write();
        let key = def.name.to_ascii_lowercase();
        if data.tables.contains_key(&key) {
            return Err(Error::TableExists(def.name));
        }
        for idx in &def.indexes {
            if Self::find_index(&data, &idx.name).is_some() {
                return Err(Error::DuplicateIndex(idx.name.clone()));
            }
        }
        def.id = data.next_table_id;
        data.next_table_id += 1;
        let def = Arc::new(def);
        data.tables.insert(key, Arc::clone(&def));
        self.save(&data)?;
        Ok(def)
    }

    /// Id the next created table will get
    pub fn peek_next_table_id(&self) -> TableId {
        self.inner.read().next_table_id
    }

    /// Get a table by name
    pub fn get_table(&self, name: &str) -> Result<Arc<TableDef>> {
        self.inner
            .read()
            .tables
            .get(&name.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| Error::NoSuchTable(name.to_string()))
    }

    pub fn table_exists(&self, name: &str) -> bool {
        self.inner
            .read()
            .tables
            .contains_key(&name.to_ascii_lowercase())
    }

    /// Remove a table with its indexes
    pub fn drop_table(&self, name: &str) -> Result<Arc<TableDef>> {
        let mut data = self.inner.write();
        let removed = data
            .tables
            .shift_remove(&name.to_ascii_lowercase())
            .ok_or_else(|| Error::NoSuchTable(name.to_string()))?;
        self.save(&data)?;
        Ok(removed)
    }

    /// Table names in creation order
    pub fn list_tables(&self) -> Vec<String> {
        self.inner
            .read()
            .tables
            .values()
            .map(|t| t.name.clone())
            .collect()
    }

    /// All table definitions in creation order
    pub fn tables(&self) -> Vec<Arc<TableDef>> {
        self.inner.read().tables.values().cloned().collect()
    }

    fn find_index<'a>(data: &'a CatalogData, name: &str) -> Option<(&'a TableDef, &'a IndexDef)> {
        data.tables
            .values()
            .find_map(|t| t.index(name).map(|idx| (t.as_ref(), idx)))
    }

    pub fn index_exists(&self, name: &str) -> bool {
        Self::find_index(&self.inner.read(), name).is_some()
    }

    fn modify_table(
        &self,
        table: &str,
        f: impl FnOnce(&mut TableDef) -> Result<()>,
    ) -> Result<Arc<TableDef>> {
        let mut data = self.inner.write();
        let key = table.to_ascii_lowercase();
        let current = data
            .tables
            .get(&key)
            .ok_or_else(|| Error::NoSuchTable(table.to_string()))?;
        let mut def = (**current).clone();
        f(&mut def)?;
        let def = Arc::new(def);
        data.tables.insert(key, Arc::clone(&def));
        self.save(&data)?;
        Ok(def)
    }

    /// Append a secondary index to a table
    pub fn add_index(&self, table: &str, index: IndexDef) -> Result<Arc<TableDef>> {
        if self.index_exists(&index.name) {
            return Err(Error::DuplicateIndex(index.name));
        }
        self.modify_table(table, |def| {
            def.indexes.push(index);
            Ok(())
        })
    }

    /// Remove a secondary index, returning the owning table as it was before
    /// and the removed definition. Primary key and constraint indexes stay.
    pub fn drop_index(&self, name: &str) -> Result<(Arc<TableDef>, IndexDef)> {
        let mut data = self.inner.write();
        let (key, before, index) = data
            .tables
            .iter()
            .find_map(|(key, t)| t.index(name).map(|idx| (key.clone(), Arc::clone(t), idx.clone())))
            .ok_or_else(|| Error::NoSuchIndex(name.to_string()))?;
        if !index.droppable() {
            return Err(Error::InvalidArgument(format!(
                "index '{}' backs a constraint of table '{}'",
                index.name, before.name
            )));
        }
        let mut def = (*before).clone();
        def.indexes.retain(|idx| idx.name != index.name);
        data.tables.insert(key, Arc::new(def));
        self.save(&data)?;
        Ok((before, index))
    }

    /// `(table, index)` for every index, in table creation order
    pub fn list_indexes(&self) -> Vec<(String, IndexDef)> {
        self.inner
            .read()
            .tables
            .values()
            .flat_map(|t| t.indexes.iter().map(move |idx| (t.name.clone(), idx.clone())))
            .collect()
    }

    pub fn list_indexes_for_table(&self, table: &str) -> Result<Vec<IndexDef>> {
        Ok(self.get_table(table)?.indexes.clone())
    }

    /// Record new root pages, by index name
    pub fn set_index_roots(&self, table: &str, roots: &[(String, PageId)]) -> Result<Arc<TableDef>> {
        self.modify_table(table, |def| {
            for (name, root) in roots {
                match def.indexes.iter_mut().find(|i| &i.name == name) {
                    Some(idx) => idx.root_page_id = *root,
                    None => {
                        return Err(Error::InternalInvariant(format!(
                            "index '{}' vanished from table '{}'",
                            name, def.name
                        )))
                    }
                }
            }
            Ok(())
        })
    }

    /// Update table statistics
    pub fn update_table_stats(&self, table: &str, stats: TableStatistics) -> Result<()> {
        self.modify_table(table, |def| {
            def.stats = Some(stats);
            Ok(())
        })?;
        Ok(())
    }

    /// Get table schema info as a formatted string (for `.schema`)
    pub fn get_table_info(&self, name: &str) -> Result<String> {
        Ok(self.get_table(name)?.describe())
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for creating tables with a fluent API
pub struct TableBuilder {
    name: String,
    columns: Vec<Column>,
    primary_key: Vec<String>,
    unique_sets: Vec<Vec<String>>,
}

impl TableBuilder {
    /// Start building a new table
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            primary_key: Vec::new(),
            unique_sets: Vec::new(),
        }
    }

    /// Add a nullable column
    pub fn column(mut self, name: impl Into<String>, data_type: DataType) -> Self {
        self.columns.push(Column::new(name, data_type));
        self
    }

    /// Add a NOT NULL column
    pub fn column_not_null(mut self, name: impl Into<String>, data_type: DataType) -> Self {
        self.columns.push(Column::new(name, data_type).nullable(false));
        self
    }

    /// Add a fully specified column
    pub fn with_column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    /// Add a single-column primary key
    pub fn primary_key(mut self, name: impl Into<String>, data_type: DataType) -> Self {
        let name = name.into();
        self.columns.push(Column::new(name.clone(), data_type).nullable(false));
        self.primary_key = vec![name];
        self
    }

    /// Declare a (possibly composite) primary key over existing columns
    pub fn key(mut self, columns: &[&str]) -> Self {
        self.primary_key = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    /// Declare a unique constraint over existing columns
    pub fn unique(mut self, columns: &[&str]) -> Self {
        self.unique_sets
            .push(columns.iter().map(|c| c.to_string()).collect());
        self
    }

    /// Validate into a table definition
    pub fn build(self) -> Result<TableDef> {
        TableDef::new(self.name, self.columns, &self.primary_key, &self.unique_sets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn users() -> TableDef {
        TableBuilder::new("users")
            .primary_key("id", DataType::Int32)
            .column("name", DataType::Varchar)
            .with_column(Column::new("email", DataType::Varchar).unique(true))
            .build()
            .unwrap()
    }

    #[test]
    fn test_create_and_get_table() {
        let catalog = Catalog::new();
        let table = catalog.create_table(users()).unwrap();
        assert_eq!(table.name(), "users");
        assert_eq!(table.id, 1);
        assert_eq!(catalog.get_table("USERS").unwrap().schema().column_count(), 3);
    }

    #[test]
    fn test_table_already_exists() {
        let catalog = Catalog::new();
        catalog.create_table(users()).unwrap();
        let result = catalog.create_table(users());
        assert!(matches!(result, Err(Error::TableExists(_))));
    }

    #[test]
    fn test_drop_table() {
        let catalog = Catalog::new();
        catalog.create_table(users()).unwrap();
        assert!(catalog.table_exists("users"));
        catalog.drop_table("users").unwrap();
        assert!(!catalog.table_exists("users"));
        assert!(matches!(catalog.drop_table("users"), Err(Error::NoSuchTable(_))));
    }

    #[test]
    fn test_duplicate_index_name() {
        let catalog = Catalog::new();
        catalog.create_table(users()).unwrap();
        let err = catalog
            .add_index("users", IndexDef::new("users_pkey", vec![1]))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateIndex(_)));
    }

    #[test]
    fn test_drop_and_list_indexes() {
        let catalog = Catalog::new();
        catalog.create_table(users()).unwrap();
        catalog
            .add_index("users", IndexDef::new("idx_name", vec![1]))
            .unwrap();
        let names: Vec<String> = catalog.list_indexes().into_iter().map(|(_, i)| i.name).collect();
        assert_eq!(names, vec!["users_pkey", "users_email_key", "idx_name"]);

        for keep in ["users_pkey", "users_email_key"] {
            let err = catalog.drop_index(keep).unwrap_err();
            assert!(matches!(err, Error::InvalidArgument(_)));
        }
        let (before, removed) = catalog.drop_index("IDX_NAME").unwrap();
        assert_eq!(removed.name, "idx_name");
        assert_eq!(before.indexes.len(), 3);
        assert_eq!(catalog.list_indexes_for_table("users").unwrap().len(), 2);
        assert!(!catalog.index_exists("idx_name"));
        assert!(matches!(catalog.drop_index("idx_name"), Err(Error::NoSuchIndex(_))));
        assert!(matches!(catalog.list_indexes_for_table("nope"), Err(Error::NoSuchTable(_))));
    }

    #[test]
    fn test_persistence() {
        let dir = TempDir::new().unwrap();
        {
            let catalog = Catalog::open(dir.path()).unwrap();
            catalog.create_table(users()).unwrap();
            catalog
                .add_index("users", IndexDef::new("idx_name", vec![1]))
                .unwrap();
            catalog
                .set_index_roots("users", &[("idx_name".to_string(), 7)])
                .unwrap();
        }
        let catalog = Catalog::open(dir.path()).unwrap();
        let table = catalog.get_table("users").unwrap();
        assert_eq!(table.index("idx_name").unwrap().root_page_id, 7);
        assert_eq!(table.schema().get_column_index("email"), Some(2));
        assert_eq!(catalog.peek_next_table_id(), 2);
    }
}

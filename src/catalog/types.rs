//! Data types for EmberDB
//!
//! The eleven scalar kinds a [`Value`](crate::storage::Value) can take. Every
//! kind except `Null` is also a valid column type.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// Scalar kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Null,
    Bool,
    /// 32-bit signed integer
    Int32,
    /// 64-bit signed integer
    Int64,
    /// IEEE-754 double
    Float64,
    /// Fixed-point decimal with six fractional digits
    Decimal,
    /// UTF-8 string
    Varchar,
    /// Raw bytes
    Blob,
    /// Days since 1970-01-01
    Date,
    /// Microseconds since midnight
    Time,
    /// Microseconds since 1970-01-01 00:00:00
    Timestamp,
}

impl DataType {
    /// Fixed encoded body width, `None` for variable-length kinds.
    pub fn size(&self) -> Option<usize> {
        match self {
            DataType::Null => Some(0),
            DataType::Bool => Some(1),
            DataType::Int32 | DataType::Date => Some(4),
            DataType::Int64 | DataType::Float64 | DataType::Time | DataType::Timestamp => Some(8),
            DataType::Decimal => Some(16),
            DataType::Varchar | DataType::Blob => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            DataType::Int32 | DataType::Int64 | DataType::Float64 | DataType::Decimal
        )
    }

    pub fn is_temporal(&self) -> bool {
        matches!(self, DataType::Date | DataType::Time | DataType::Timestamp)
    }

    /// Resolve a type name as written in `CREATE TABLE`.
    pub fn from_sql_name(name: &str) -> Result<DataType> {
        let dt = match name.to_ascii_uppercase().as_str() {
            "BOOL" | "BOOLEAN" => DataType::Bool,
            "INT" | "INTEGER" | "INT4" | "INT32" | "SMALLINT" => DataType::Int32,
            "BIGINT" | "INT8" | "INT64" => DataType::Int64,
            "FLOAT" | "DOUBLE" | "REAL" | "FLOAT8" | "FLOAT64" => DataType::Float64,
            "DECIMAL" | "NUMERIC" => DataType::Decimal,
            "VARCHAR" | "TEXT" | "STRING" | "CHAR" => DataType::Varchar,
            "BLOB" | "BYTES" | "BYTEA" => DataType::Blob,
            "DATE" => DataType::Date,
            "TIME" => DataType::Time,
            "TIMESTAMP" | "DATETIME" => DataType::Timestamp,
            other => return Err(Error::Parse(format!("unknown column type '{}'", other))),
        };
        Ok(dt)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Null => write!(f, "NULL"),
            DataType::Bool => write!(f, "BOOLEAN"),
            DataType::Int32 => write!(f, "INTEGER"),
            DataType::Int64 => write!(f, "BIGINT"),
            DataType::Float64 => write!(f, "DOUBLE"),
            DataType::Decimal => write!(f, "DECIMAL"),
            DataType::Varchar => write!(f, "VARCHAR"),
            DataType::Blob => write!(f, "BLOB"),
            DataType::Date => write!(f, "DATE"),
            DataType::Time => write!(f, "TIME"),
            DataType::Timestamp => write!(f, "TIMESTAMP"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_size() {
        assert_eq!(DataType::Int32.size(), Some(4));
        assert_eq!(DataType::Int64.size(), Some(8));
        assert_eq!(DataType::Varchar.size(), None);
    }

    #[test]
    fn test_sql_names() {
        assert_eq!(DataType::from_sql_name("int").unwrap(), DataType::Int32);
        assert_eq!(DataType::from_sql_name("TEXT").unwrap(), DataType::Varchar);
        assert_eq!(
            DataType::from_sql_name("timestamp").unwrap(),
            DataType::Timestamp
        );
        assert!(DataType::from_sql_name("GEOMETRY").is_err());
    }
}

//! SQL Abstract Syntax Tree (AST)
//!
//! This module defines the AST nodes for SQL statements.

use std::fmt;

use crate::catalog::DataType;
use crate::error::{Error, Result};
use crate::storage::temporal::{self, Decimal};
use crate::storage::Value;
use crate::transaction::IsolationLevel;

/// A SQL statement
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    /// SELECT statement
    Select(SelectStatement),
    /// INSERT statement
    Insert(InsertStatement),
    /// UPDATE statement
    Update(UpdateStatement),
    /// DELETE statement
    Delete(DeleteStatement),
    /// CREATE TABLE statement
    CreateTable(CreateTableStatement),
    /// CREATE INDEX statement
    CreateIndex(CreateIndexStatement),
    /// DROP TABLE statement
    DropTable(DropTableStatement),
    /// DROP INDEX statement
    DropIndex(DropIndexStatement),
    /// BEGIN [TRANSACTION] [ISOLATION LEVEL ...]
    Begin(Option<IsolationLevel>),
    /// COMMIT
    Commit,
    /// ROLLBACK
    Rollback,
    /// EXPLAIN <statement>
    Explain(Box<Statement>),
    /// VACUUM [table]
    Vacuum(Option<String>),
    /// ANALYZE [table]
    Analyze(Option<String>),
}

/// Select list
#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    /// All columns (*)
    All,
    Columns(Vec<String>),
}

/// SELECT statement
#[derive(Debug, Clone, PartialEq)]
pub struct SelectStatement {
    pub projection: Projection,
    /// FROM table
    pub from: String,
    /// WHERE clause
    pub where_clause: Option<Expr>,
    /// ORDER BY clause
    pub order_by: Vec<OrderByItem>,
    /// LIMIT clause
    pub limit: Option<u64>,
    /// OFFSET clause
    pub offset: Option<u64>,
}

/// ORDER BY item
#[derive(Debug, Clone, PartialEq)]
pub struct OrderByItem {
    pub column: String,
    pub ascending: bool,
}

/// INSERT statement
#[derive(Debug, Clone, PartialEq)]
pub struct InsertStatement {
    /// Table name
    pub table: String,
    /// Column names (optional; defaults to every visible column)
    pub columns: Option<Vec<String>>,
    /// VALUES rows
    pub rows: Vec<Vec<Literal>>,
}

/// UPDATE statement
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateStatement {
    /// Table name
    pub table: String,
    /// SET assignments
    pub assignments: Vec<Assignment>,
    /// WHERE clause
    pub where_clause: Option<Expr>,
}

/// SET column = value
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub column: String,
    pub value: Literal,
}

/// DELETE statement
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteStatement {
    /// Table name
    pub table: String,
    /// WHERE clause
    pub where_clause: Option<Expr>,
}

/// CREATE TABLE statement
#[derive(Debug, Clone, PartialEq)]
pub struct CreateTableStatement {
    /// Table name
    pub name: String,
    /// IF NOT EXISTS flag
    pub if_not_exists: bool,
    /// Column definitions
    pub columns: Vec<ColumnDef>,
    /// Table constraints
    pub constraints: Vec<TableConstraint>,
}

/// Column definition
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDef {
    /// Column name
    pub name: String,
    /// Data type
    pub data_type: DataType,
    /// NOT NULL constraint
    pub not_null: bool,
    /// PRIMARY KEY constraint
    pub primary_key: bool,
    /// UNIQUE constraint
    pub unique: bool,
    /// DEFAULT value
    pub default: Option<Literal>,
}

/// Table constraint
#[derive(Debug, Clone, PartialEq)]
pub enum TableConstraint {
    PrimaryKey(Vec<String>),
    Unique(Vec<String>),
}

/// CREATE INDEX statement
#[derive(Debug, Clone, PartialEq)]
pub struct CreateIndexStatement {
    /// Index name
    pub name: String,
    /// Table name
    pub table: String,
    /// Column names
    pub columns: Vec<String>,
    /// UNIQUE flag
    pub unique: bool,
    /// IF NOT EXISTS flag
    pub if_not_exists: bool,
}

/// DROP TABLE statement
#[derive(Debug, Clone, PartialEq)]
pub struct DropTableStatement {
    /// Table name
    pub name: String,
    /// IF EXISTS flag
    pub if_exists: bool,
}

/// DROP INDEX statement
#[derive(Debug, Clone, PartialEq)]
pub struct DropIndexStatement {
    /// Index name
    pub name: String,
    /// IF EXISTS flag
    pub if_exists: bool,
}

/// Literal values
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Bool(bool),
    Integer(i64),
    /// Number with a fraction or exponent, as written
    Number(String),
    String(String),
    Blob(Vec<u8>),
    Date(String),
    Time(String),
    Timestamp(String),
}

impl Literal {
    /// The literal's natural value
    pub fn to_value(&self) -> Result<Value> {
        Ok(match self {
            Literal::Null => Value::Null,
            Literal::Bool(b) => Value::Bool(*b),
            Literal::Integer(i) => Value::Int64(*i),
            Literal::Number(n) => Value::Float64(
                n.parse()
                    .map_err(|_| Error::Parse(format!("invalid number '{}'", n)))?,
            ),
            Literal::String(s) => Value::Varchar(s.clone()),
            Literal::Blob(b) => Value::Blob(b.clone()),
            Literal::Date(s) => Value::Date(temporal::parse_date(s)?),
            Literal::Time(s) => Value::Time(temporal::parse_time(s)?),
            Literal::Timestamp(s) => Value::Timestamp(temporal::parse_timestamp(s)?),
        })
    }

    /// Bind the literal to a column of type `target`.
    pub fn bind(&self, target: DataType) -> Result<Value> {
        match (self, target) {
            // keep every written digit
            (Literal::Number(n), DataType::Decimal) => Ok(Value::Decimal(Decimal::parse(n)?)),
            _ => self.to_value()?.cast(target),
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Null => write!(f, "NULL"),
            Literal::Bool(b) => write!(f, "{}", if *b { "TRUE" } else { "FALSE" }),
            Literal::Integer(i) => write!(f, "{}", i),
            Literal::Number(n) => write!(f, "{}", n),
            Literal::String(s) => write!(f, "'{}'", s.replace('\'', "''")),
            Literal::Blob(b) => {
                write!(f, "X'")?;
                for byte in b {
                    write!(f, "{:02X}", byte)?;
                }
                write!(f, "'")
            }
            Literal::Date(s) => write!(f, "DATE '{}'", s),
            Literal::Time(s) => write!(f, "TIME '{}'", s),
            Literal::Timestamp(s) => write!(f, "TIMESTAMP '{}'", s),
        }
    }
}

/// Comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl CompareOp {
    /// The operator seen from the other side: `a < b` is `b > a`.
    pub fn flip(self) -> CompareOp {
        match self {
            CompareOp::Eq => CompareOp::Eq,
            CompareOp::NotEq => CompareOp::NotEq,
            CompareOp::Lt => CompareOp::Gt,
            CompareOp::LtEq => CompareOp::GtEq,
            CompareOp::Gt => CompareOp::Lt,
            CompareOp::GtEq => CompareOp::LtEq,
        }
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompareOp::Eq => "=",
            CompareOp::NotEq => "<>",
            CompareOp::Lt => "<",
            CompareOp::LtEq => "<=",
            CompareOp::Gt => ">",
            CompareOp::GtEq => ">=",
        };
        write!(f, "{}", s)
    }
}

/// WHERE predicates: boolean combinations of column comparisons
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// column op literal
    Compare {
        column: String,
        op: CompareOp,
        value: Literal,
    },
    /// column IS [NOT] NULL
    IsNull { column: String, negated: bool },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
}

impl Expr {
    /// Every column the predicate mentions
    pub fn columns(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Compare { column, .. } | Expr::IsNull { column, .. } => out.push(column),
            Expr::And(l, r) | Expr::Or(l, r) => {
                l.collect_columns(out);
                r.collect_columns(out);
            }
            Expr::Not(e) => e.collect_columns(out),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Compare { column, op, value } => write!(f, "{} {} {}", column, op, value),
            Expr::IsNull { column, negated } => {
                write!(f, "{} IS {}NULL", column, if *negated { "NOT " } else { "" })
            }
            Expr::And(l, r) => write!(f, "({} AND {})", l, r),
            Expr::Or(l, r) => write!(f, "({} OR {})", l, r),
            Expr::Not(e) => write!(f, "NOT {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_binding() {
        assert_eq!(Literal::Integer(7).bind(DataType::Int32).unwrap(), Value::Int32(7));
        assert!(Literal::Integer(1 << 40).bind(DataType::Int32).is_err());
        assert_eq!(
            Literal::Number("1.25".into()).bind(DataType::Decimal).unwrap(),
            Value::Decimal(Decimal::parse("1.25").unwrap())
        );
        assert_eq!(
            Literal::String("2024-02-29".into()).bind(DataType::Date).unwrap(),
            Literal::Date("2024-02-29".into()).to_value().unwrap()
        );
        assert_eq!(Literal::Null.bind(DataType::Varchar).unwrap(), Value::Null);
    }

    #[test]
    fn test_expr_display() {
        let e = Expr::And(
            Box::new(Expr::Compare {
                column: "age".into(),
                op: CompareOp::GtEq,
                value: Literal::Integer(30),
            }),
            Box::new(Expr::IsNull {
                column: "email".into(),
                negated: true,
            }),
        );
        assert_eq!(e.to_string(), "(age >= 30 AND email IS NOT NULL)");
        assert_eq!(e.columns(), vec!["age", "email"]);
    }
}

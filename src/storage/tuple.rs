//! Tuple and Value types for EmberDB
//!
//! This module defines how data values are represented in memory and how a
//! row is laid out as a length-prefixed tuple of encoded values.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use bytes::{Buf, BufMut};

use crate::catalog::DataType;
use crate::error::{Error, Result};
use crate::storage::codec;
use crate::storage::temporal::{self, Decimal};

/// A value in the database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    Decimal(Decimal),
    Varchar(String),
    Blob(Vec<u8>),
    /// Days since epoch
    Date(i32),
    /// Microseconds since midnight
    Time(i64),
    /// Microseconds since epoch
    Timestamp(i64),
}

/// Outcome of comparing two values of the same kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Less,
    Equal,
    Greater,
    /// At least one side is NULL
    Unordered,
}

impl Comparison {
    pub fn to_ordering(self) -> Option<Ordering> {
        match self {
            Comparison::Less => Some(Ordering::Less),
            Comparison::Equal => Some(Ordering::Equal),
            Comparison::Greater => Some(Ordering::Greater),
            Comparison::Unordered => None,
        }
    }
}

impl From<Ordering> for Comparison {
    fn from(ord: Ordering) -> Self {
        match ord {
            Ordering::Less => Comparison::Less,
            Ordering::Equal => Comparison::Equal,
            Ordering::Greater => Comparison::Greater,
        }
    }
}

// Floats compare by bit pattern so values can be hashed and deduplicated
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int32(a), Value::Int32(b)) => a == b,
            (Value::Int64(a), Value::Int64(b)) => a == b,
            (Value::Float64(a), Value::Float64(b)) => a.to_bits() == b.to_bits(),
            (Value::Decimal(a), Value::Decimal(b)) => a == b,
            (Value::Varchar(a), Value::Varchar(b)) => a == b,
            (Value::Blob(a), Value::Blob(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::Time(a), Value::Time(b)) => a == b,
            (Value::Timestamp(a), Value::Timestamp(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl std::hash::Hash for Value {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null => {}
            Value::Bool(v) => v.hash(state),
            Value::Int32(v) | Value::Date(v) => v.hash(state),
            Value::Int64(v) | Value::Time(v) | Value::Timestamp(v) => v.hash(state),
            Value::Float64(v) => v.to_bits().hash(state),
            Value::Decimal(v) => v.hash(state),
            Value::Varchar(v) => v.hash(state),
            Value::Blob(v) => v.hash(state),
        }
    }
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn kind(&self) -> DataType {
        match self {
            Value::Null => DataType::Null,
            Value::Bool(_) => DataType::Bool,
            Value::Int32(_) => DataType::Int32,
            Value::Int64(_) => DataType::Int64,
            Value::Float64(_) => DataType::Float64,
            Value::Decimal(_) => DataType::Decimal,
            Value::Varchar(_) => DataType::Varchar,
            Value::Blob(_) => DataType::Blob,
            Value::Date(_) => DataType::Date,
            Value::Time(_) => DataType::Time,
            Value::Timestamp(_) => DataType::Timestamp,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int32(i) => Some(*i as i64),
            Value::Int64(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Varchar(s) => Some(s),
            _ => None,
        }
    }

    /// Compare two values of the same kind. NULL on either side is unordered;
    /// values of different kinds cannot be compared.
    pub fn compare(&self, other: &Value) -> Result<Comparison> {
        let ord = match (self, other) {
            (Value::Null, _) | (_, Value::Null) => return Ok(Comparison::Unordered),
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int32(a), Value::Int32(b)) => a.cmp(b),
            (Value::Int64(a), Value::Int64(b)) => a.cmp(b),
            (Value::Float64(a), Value::Float64(b)) => a.total_cmp(b),
            (Value::Decimal(a), Value::Decimal(b)) => a.cmp(b),
            (Value::Varchar(a), Value::Varchar(b)) => a.as_bytes().cmp(b.as_bytes()),
            (Value::Blob(a), Value::Blob(b)) => a.cmp(b),
            (Value::Date(a), Value::Date(b)) => a.cmp(b),
            (Value::Time(a), Value::Time(b)) => a.cmp(b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            (a, b) => {
                return Err(Error::TypeMismatch(format!(
                    "cannot compare {} with {}",
                    a.kind(),
                    b.kind()
                )))
            }
        };
        Ok(ord.into())
    }

    /// Total order used for sorting: NULL sorts after every value, mixed
    /// kinds fall back to their tag order.
    pub fn sort_cmp(&self, other: &Value) -> Ordering {
        match self.compare(other) {
            Ok(Comparison::Unordered) => match (self.is_null(), other.is_null()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Greater,
                _ => Ordering::Less,
            },
            Ok(c) => c.to_ordering().unwrap_or(Ordering::Equal),
            Err(_) => codec::tag_of(self.kind()).cmp(&codec::tag_of(other.kind())),
        }
    }

    /// Convert a value to `target`, used when binding literals to columns.
    pub fn cast(&self, target: DataType) -> Result<Value> {
        if self.is_null() || self.kind() == target {
            return Ok(self.clone());
        }
        let mismatch = || {
            Error::TypeMismatch(format!(
                "cannot convert {} value {} to {}",
                self.kind(),
                self,
                target
            ))
        };
        let out = match (self, target) {
            (Value::Int32(v), DataType::Int64) => Value::Int64(*v as i64),
            (Value::Int32(v), DataType::Float64) => Value::Float64(*v as f64),
            (Value::Int32(v), DataType::Decimal) => Value::Decimal(Decimal::from_i64(*v as i64)),
            (Value::Int64(v), DataType::Int32) => {
                Value::Int32(i32::try_from(*v).map_err(|_| mismatch())?)
            }
            (Value::Int64(v), DataType::Float64) => Value::Float64(*v as f64),
            (Value::Int64(v), DataType::Decimal) => Value::Decimal(Decimal::from_i64(*v)),
            (Value::Decimal(d), DataType::Float64) => Value::Float64(d.to_f64()),
            (Value::Varchar(s), DataType::Date) => Value::Date(temporal::parse_date(s)?),
            (Value::Varchar(s), DataType::Time) => Value::Time(temporal::parse_time(s)?),
            (Value::Varchar(s), DataType::Timestamp) => {
                Value::Timestamp(temporal::parse_timestamp(s)?)
            }
            (Value::Varchar(s), DataType::Decimal) => Value::Decimal(Decimal::parse(s)?),
            (Value::Varchar(s), DataType::Blob) => Value::Blob(s.as_bytes().to_vec()),
            (Value::Date(d), DataType::Timestamp) => {
                Value::Timestamp(*d as i64 * temporal::MICROS_PER_DAY)
            }
            _ => return Err(mismatch()),
        };
        Ok(out)
    }

    /// Approximate in-memory footprint, used for sort spill accounting.
    pub fn heap_size(&self) -> usize {
        let payload = match self {
            Value::Varchar(s) => s.len(),
            Value::Blob(b) => b.len(),
            _ => 0,
        };
        std::mem::size_of::<Value>() + payload
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{}", if *b { "TRUE" } else { "FALSE" }),
            Value::Int32(i) => write!(f, "{}", i),
            Value::Int64(i) => write!(f, "{}", i),
            Value::Float64(n) => write!(f, "{}", n),
            Value::Decimal(d) => write!(f, "{}", d),
            Value::Varchar(s) => write!(f, "{}", s),
            Value::Blob(b) => {
                write!(f, "X'")?;
                for byte in b {
                    write!(f, "{:02x}", byte)?;
                }
                write!(f, "'")
            }
            Value::Date(d) => write!(f, "{}", temporal::format_date(*d)),
            Value::Time(t) => write!(f, "{}", temporal::format_time(*t)),
            Value::Timestamp(t) => write!(f, "{}", temporal::format_timestamp(*t)),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float64(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Varchar(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Varchar(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(inner) => inner.into(),
            None => Value::Null,
        }
    }
}

/// A tuple (row) in the database
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tuple {
    values: Vec<Value>,
}

impl Tuple {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn set(&mut self, index: usize, value: Value) {
        if index < self.values.len() {
            self.values[index] = value;
        }
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    /// Project specific columns
    pub fn project(&self, indices: &[usize]) -> Tuple {
        let values = indices
            .iter()
            .map(|&i| self.values.get(i).cloned().unwrap_or(Value::Null))
            .collect();
        Tuple::new(values)
    }

    pub fn heap_size(&self) -> usize {
        self.values.iter().map(Value::heap_size).sum::<usize>() + std::mem::size_of::<Tuple>()
    }

    /// Serialize as a u16 value count followed by row-format values.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(2 + self.values.len() * 9);
        bytes.put_u16(self.values.len() as u16);
        for value in &self.values {
            codec::encode_into(&mut bytes, value);
        }
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut buf = bytes;
        if buf.remaining() < 2 {
            return Err(Error::InvalidArgument(
                "buffer too short for tuple header".to_string(),
            ));
        }
        let count = buf.get_u16() as usize;
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(codec::decode_from(&mut buf)?);
        }
        Ok(Tuple::new(values))
    }
}

impl FromIterator<Value> for Tuple {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        Tuple::new(iter.into_iter().collect())
    }
}

impl IntoIterator for Tuple {
    type Item = Value;
    type IntoIter = std::vec::IntoIter<Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.into_iter()
    }
}

impl<'a> IntoIterator for &'a Tuple {
    type Item = &'a Value;
    type IntoIter = std::slice::Iter<'a, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.iter()
    }
}

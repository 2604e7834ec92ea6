//! Order-preserving value encoding
//!
//! Every encoded value starts with a one-byte kind tag followed by a body.
//! Fixed-width bodies are big-endian with the sign bit flipped, floats are
//! mapped to bit patterns whose unsigned order matches `f64::total_cmp`, and
//! NULL is the single tag byte `0xFF` so it sorts after every other value.
//!
//! Two flavours exist for strings and blobs. The row format ([`encode`])
//! length-prefixes them. The key format ([`encode_key`]) escapes `0x00` as
//! `0x00 0xFF` and terminates with `0x00 0x00`, which keeps prefix ordering
//! intact when keys are concatenated.

use bytes::{Buf, BufMut};

use crate::catalog::DataType;
use crate::error::{Error, Result};
use crate::storage::temporal::Decimal;
use crate::storage::tuple::Value;

pub const TAG_BOOL: u8 = 0x01;
pub const TAG_INT32: u8 = 0x02;
pub const TAG_INT64: u8 = 0x03;
pub const TAG_FLOAT64: u8 = 0x04;
pub const TAG_DECIMAL: u8 = 0x05;
pub const TAG_VARCHAR: u8 = 0x06;
pub const TAG_BLOB: u8 = 0x07;
pub const TAG_DATE: u8 = 0x08;
pub const TAG_TIME: u8 = 0x09;
pub const TAG_TIMESTAMP: u8 = 0x0A;
pub const TAG_NULL: u8 = 0xFF;

const SIGN32: u32 = 1 << 31;
const SIGN64: u64 = 1 << 63;
const SIGN128: u128 = 1 << 127;

pub fn tag_of(kind: DataType) -> u8 {
    match kind {
        DataType::Null => TAG_NULL,
        DataType::Bool => TAG_BOOL,
        DataType::Int32 => TAG_INT32,
        DataType::Int64 => TAG_INT64,
        DataType::Float64 => TAG_FLOAT64,
        DataType::Decimal => TAG_DECIMAL,
        DataType::Varchar => TAG_VARCHAR,
        DataType::Blob => TAG_BLOB,
        DataType::Date => TAG_DATE,
        DataType::Time => TAG_TIME,
        DataType::Timestamp => TAG_TIMESTAMP,
    }
}

fn kind_of_tag(tag: u8) -> Result<DataType> {
    Ok(match tag {
        TAG_NULL => DataType::Null,
        TAG_BOOL => DataType::Bool,
        TAG_INT32 => DataType::Int32,
        TAG_INT64 => DataType::Int64,
        TAG_FLOAT64 => DataType::Float64,
        TAG_DECIMAL => DataType::Decimal,
        TAG_VARCHAR => DataType::Varchar,
        TAG_BLOB => DataType::Blob,
        TAG_DATE => DataType::Date,
        TAG_TIME => DataType::Time,
        TAG_TIMESTAMP => DataType::Timestamp,
        other => {
            return Err(Error::InvalidArgument(format!(
                "unknown value tag 0x{:02x}",
                other
            )))
        }
    })
}

fn float_to_ordered(v: f64) -> u64 {
    let bits = v.to_bits();
    if bits & SIGN64 != 0 {
        !bits
    } else {
        bits | SIGN64
    }
}

fn ordered_to_float(bits: u64) -> f64 {
    if bits & SIGN64 != 0 {
        f64::from_bits(bits & !SIGN64)
    } else {
        f64::from_bits(!bits)
    }
}

fn put_fixed(buf: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null | Value::Varchar(_) | Value::Blob(_) => {}
        Value::Bool(b) => buf.put_u8(*b as u8),
        Value::Int32(v) | Value::Date(v) => buf.put_u32(*v as u32 ^ SIGN32),
        Value::Int64(v) | Value::Time(v) | Value::Timestamp(v) => buf.put_u64(*v as u64 ^ SIGN64),
        Value::Float64(v) => buf.put_u64(float_to_ordered(*v)),
        Value::Decimal(d) => buf.put_u128(d.units() as u128 ^ SIGN128),
    }
}

/// Append the row-format encoding of `value` to `buf`.
pub fn encode_into(buf: &mut Vec<u8>, value: &Value) {
    buf.put_u8(tag_of(value.kind()));
    match value {
        Value::Varchar(s) => {
            buf.put_u32(s.len() as u32);
            buf.put_slice(s.as_bytes());
        }
        Value::Blob(b) => {
            buf.put_u32(b.len() as u32);
            buf.put_slice(b);
        }
        other => put_fixed(buf, other),
    }
}

pub fn encode(value: &Value) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16);
    encode_into(&mut buf, value);
    buf
}

fn put_stuffed(buf: &mut Vec<u8>, bytes: &[u8]) {
    for &b in bytes {
        buf.put_u8(b);
        if b == 0x00 {
            buf.put_u8(0xFF);
        }
    }
    buf.put_u8(0x00);
    buf.put_u8(0x00);
}

/// Append the key-format encoding of `value` to `buf`.
pub fn encode_key_into(buf: &mut Vec<u8>, value: &Value) {
    buf.put_u8(tag_of(value.kind()));
    match value {
        Value::Varchar(s) => put_stuffed(buf, s.as_bytes()),
        Value::Blob(b) => put_stuffed(buf, b),
        other => put_fixed(buf, other),
    }
}

pub fn encode_key(value: &Value) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16);
    encode_key_into(&mut buf, value);
    buf
}

/// Concatenated key encoding of several values.
pub fn encode_key_tuple<'a, I>(values: I) -> Vec<u8>
where
    I: IntoIterator<Item = &'a Value>,
{
    let mut buf = Vec::with_capacity(32);
    for v in values {
        encode_key_into(&mut buf, v);
    }
    buf
}

fn truncated() -> Error {
    Error::InvalidArgument("truncated value encoding".to_string())
}

fn need(buf: &&[u8], n: usize) -> Result<()> {
    if buf.remaining() < n {
        Err(truncated())
    } else {
        Ok(())
    }
}

fn get_fixed(buf: &mut &[u8], kind: DataType) -> Result<Value> {
    if let Some(width) = kind.size() {
        need(buf, width)?;
    }
    Ok(match kind {
        DataType::Null => Value::Null,
        DataType::Bool => Value::Bool(buf.get_u8() != 0),
        DataType::Int32 => Value::Int32((buf.get_u32() ^ SIGN32) as i32),
        DataType::Date => Value::Date((buf.get_u32() ^ SIGN32) as i32),
        DataType::Int64 => Value::Int64((buf.get_u64() ^ SIGN64) as i64),
        DataType::Time => Value::Time((buf.get_u64() ^ SIGN64) as i64),
        DataType::Timestamp => Value::Timestamp((buf.get_u64() ^ SIGN64) as i64),
        DataType::Float64 => Value::Float64(ordered_to_float(buf.get_u64())),
        DataType::Decimal => Value::Decimal(Decimal::from_units((buf.get_u128() ^ SIGN128) as i128)),
        DataType::Varchar | DataType::Blob => return Err(truncated()),
    })
}

/// Decode one row-format value from the front of `buf`, advancing it.
pub fn decode_from(buf: &mut &[u8]) -> Result<Value> {
    need(buf, 1)?;
    let kind = kind_of_tag(buf.get_u8())?;
    match kind {
        DataType::Varchar | DataType::Blob => {
            need(buf, 4)?;
            let len = buf.get_u32() as usize;
            need(buf, len)?;
            let bytes = buf[..len].to_vec();
            buf.advance(len);
            if kind == DataType::Blob {
                Ok(Value::Blob(bytes))
            } else {
                String::from_utf8(bytes)
                    .map(Value::Varchar)
                    .map_err(|_| Error::InvalidArgument("invalid UTF-8 in VARCHAR".to_string()))
            }
        }
        other => get_fixed(buf, other),
    }
}

/// Decode a row-format value that must be of `kind` (or NULL).
pub fn decode(bytes: &[u8], kind: DataType) -> Result<Value> {
    let mut buf = bytes;
    let value = decode_from(&mut buf)?;
    if !value.is_null() && value.kind() != kind {
        return Err(Error::TypeMismatch(format!(
            "expected {} but found {}",
            kind,
            value.kind()
        )));
    }
    if buf.has_remaining() {
        return Err(Error::InvalidArgument(
            "trailing bytes after value encoding".to_string(),
        ));
    }
    Ok(value)
}

fn get_stuffed(buf: &mut &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        need(buf, 1)?;
        let b = buf.get_u8();
        if b != 0x00 {
            out.push(b);
            continue;
        }
        need(buf, 1)?;
        match buf.get_u8() {
            0x00 => return Ok(out),
            0xFF => out.push(0x00),
            _ => return Err(Error::InvalidArgument("bad key escape".to_string())),
        }
    }
}

/// Decode one key-format value from the front of `buf`, advancing it.
pub fn decode_key_from(buf: &mut &[u8]) -> Result<Value> {
    need(buf, 1)?;
    let kind = kind_of_tag(buf.get_u8())?;
    match kind {
        DataType::Varchar => String::from_utf8(get_stuffed(buf)?)
            .map(Value::Varchar)
            .map_err(|_| Error::InvalidArgument("invalid UTF-8 in key".to_string())),
        DataType::Blob => Ok(Value::Blob(get_stuffed(buf)?)),
        other => get_fixed(buf, other),
    }
}

pub fn decode_key(bytes: &[u8], kind: DataType) -> Result<Value> {
    let mut buf = bytes;
    let value = decode_key_from(&mut buf)?;
    if !value.is_null() && value.kind() != kind {
        return Err(Error::TypeMismatch(format!(
            "expected {} but found {}",
            kind,
            value.kind()
        )));
    }
    Ok(value)
}

/// Decode `count` concatenated key values.
pub fn decode_key_tuple(bytes: &[u8], count: usize) -> Result<Vec<Value>> {
    let mut buf = bytes;
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        values.push(decode_key_from(&mut buf)?);
    }
    Ok(values)
}

/// Smallest byte string greater than every string starting with `prefix`.
/// `None` when no such string exists (all bytes are `0xFF`).
pub fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut out = prefix.to_vec();
    while let Some(last) = out.pop() {
        if last != 0xFF {
            out.push(last + 1);
            return Some(out);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_order() {
        let neg = encode_key(&Value::Int32(-5));
        let zero = encode_key(&Value::Int32(0));
        let pos = encode_key(&Value::Int32(7));
        assert!(neg < zero && zero < pos);
        assert!(encode_key(&Value::Int64(i64::MIN)) < encode_key(&Value::Int64(i64::MAX)));
    }

    #[test]
    fn test_float_order() {
        let vals = [f64::NEG_INFINITY, -2.5, -0.0, 0.0, 1e-300, 3.0, f64::INFINITY];
        let keys: Vec<_> = vals.iter().map(|v| encode_key(&Value::Float64(*v))).collect();
        for w in keys.windows(2) {
            assert!(w[0] < w[1]);
        }
        let decoded = decode(&encode(&Value::Float64(-2.5)), DataType::Float64).unwrap();
        assert_eq!(decoded, Value::Float64(-2.5));
    }

    #[test]
    fn test_string_key_prefix_order() {
        let a = encode_key(&Value::Varchar("a".into()));
        let a_nul = encode_key(&Value::Varchar("a\0".into()));
        let ab = encode_key(&Value::Varchar("ab".into()));
        let b = encode_key(&Value::Varchar("b".into()));
        assert!(a < a_nul && a_nul < ab && ab < b);
        assert_eq!(
            decode_key(&a_nul, DataType::Varchar).unwrap(),
            Value::Varchar("a\0".into())
        );
    }

    #[test]
    fn test_null_sorts_last() {
        let null = encode_key(&Value::Null);
        assert_eq!(null, vec![TAG_NULL]);
        assert!(encode_key(&Value::Int32(i32::MAX)) < null);
        assert!(encode_key(&Value::Varchar("zzz".into())) < null);
    }

    #[test]
    fn test_row_format_string() {
        let v = Value::Varchar("hello".into());
        let bytes = encode(&v);
        assert_eq!(bytes[0], TAG_VARCHAR);
        assert_eq!(&bytes[1..5], &5u32.to_be_bytes());
        assert_eq!(decode(&bytes, DataType::Varchar).unwrap(), v);
    }

    #[test]
    fn test_decode_kind_mismatch() {
        let bytes = encode(&Value::Int32(1));
        assert!(matches!(
            decode(&bytes, DataType::Int64),
            Err(Error::TypeMismatch(_))
        ));
        assert!(decode(&bytes[..2], DataType::Int32).is_err());
    }

    #[test]
    fn test_key_tuple_and_successor() {
        let key = encode_key_tuple(&[Value::Int32(3), Value::Varchar("x".into())]);
        let values = decode_key_tuple(&key, 2).unwrap();
        assert_eq!(values, vec![Value::Int32(3), Value::Varchar("x".into())]);

        let prefix = encode_key(&Value::Int32(3));
        let succ = prefix_successor(&prefix).unwrap();
        assert!(key.as_slice() < succ.as_slice());
        assert!(succ <= encode_key(&Value::Int32(4)));
        assert_eq!(prefix_successor(&[0xFF, 0xFF]), None);
    }
}

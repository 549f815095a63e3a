//! Deterministic binary codec for row-value maps.
//!
//! Operations carry a heterogeneous map of column name -> value. To hash and
//! replay operations deterministically, that map must encode to identical
//! bytes regardless of insertion order, so keys live in a `BTreeMap` and are
//! written out in lexicographic order. The wire format is hand-rolled rather
//! than handed to postcard directly because postcard has no native map type
//! and we want the exact byte layout pinned down rather than left to derive
//! output, which can shift across serde/postcard versions.
//!
//! Layout (all integers little-endian):
//! `entry_count: u32`, then for each entry in key order:
//! `key_len: u32, key_bytes, value_tag: u8, value_bytes`.
//!
//! Value tags: `0 = Null`, `1 = Integer(i64)`, `2 = Real(f64)`,
//! `3 = Text(String)` (u32 length prefix), `4 = Blob(Vec<u8>)` (u32 length
//! prefix).

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single column value in a captured row. Mirrors SQLite's storage
/// classes (`INTEGER`, `REAL`, `TEXT`, `BLOB`, `NULL`) since operations are
/// captured straight off row data read back from the embedded store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

/// An ordered column map, keyed by column name.
pub type ValueMap = BTreeMap<String, Value>;

const TAG_NULL: u8 = 0;
const TAG_INTEGER: u8 = 1;
const TAG_REAL: u8 = 2;
const TAG_TEXT: u8 = 3;
const TAG_BLOB: u8 = 4;

/// Encode a value map to its deterministic byte representation.
///
/// Floats are rejected if NaN or infinite: such values cannot be compared
/// for equality across devices and have no canonical byte form.
pub fn encode_value_map(map: &ValueMap) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    out.extend_from_slice(&(map.len() as u32).to_le_bytes());
    for (key, value) in map {
        out.extend_from_slice(&(key.len() as u32).to_le_bytes());
        out.extend_from_slice(key.as_bytes());
        encode_value(value, &mut out)?;
    }
    Ok(out)
}

fn encode_value(value: &Value, out: &mut Vec<u8>) -> Result<()> {
    match value {
        Value::Null => out.push(TAG_NULL),
        Value::Integer(i) => {
            out.push(TAG_INTEGER);
            out.extend_from_slice(&i.to_le_bytes());
        }
        Value::Real(f) => {
            let normalized = normalize_f64(*f)?;
            out.push(TAG_REAL);
            out.extend_from_slice(&normalized.to_le_bytes());
        }
        Value::Text(s) => {
            out.push(TAG_TEXT);
            out.extend_from_slice(&(s.len() as u32).to_le_bytes());
            out.extend_from_slice(s.as_bytes());
        }
        Value::Blob(b) => {
            out.push(TAG_BLOB);
            out.extend_from_slice(&(b.len() as u32).to_le_bytes());
            out.extend_from_slice(b);
        }
    }
    Ok(())
}

/// Decode a value map from its deterministic byte representation.
pub fn decode_value_map(bytes: &[u8]) -> Result<ValueMap> {
    let mut cursor = Cursor::new(bytes);
    let entry_count = cursor.read_u32()?;
    let mut map = ValueMap::new();
    for _ in 0..entry_count {
        let key_len = cursor.read_u32()? as usize;
        let key = String::from_utf8(cursor.read_bytes(key_len)?.to_vec())
            .map_err(|e| Error::MalformedCodec(format!("invalid utf-8 key: {e}")))?;
        let value = decode_value(&mut cursor)?;
        map.insert(key, value);
    }
    Ok(map)
}

fn decode_value(cursor: &mut Cursor<'_>) -> Result<Value> {
    let tag = cursor.read_u8()?;
    match tag {
        TAG_NULL => Ok(Value::Null),
        TAG_INTEGER => {
            let bytes = cursor.read_bytes(8)?;
            Ok(Value::Integer(i64::from_le_bytes(bytes.try_into().unwrap())))
        }
        TAG_REAL => {
            let bytes = cursor.read_bytes(8)?;
            Ok(Value::Real(f64::from_le_bytes(bytes.try_into().unwrap())))
        }
        TAG_TEXT => {
            let len = cursor.read_u32()? as usize;
            let bytes = cursor.read_bytes(len)?;
            String::from_utf8(bytes.to_vec())
                .map(Value::Text)
                .map_err(|e| Error::MalformedCodec(format!("invalid utf-8 text: {e}")))
        }
        TAG_BLOB => {
            let len = cursor.read_u32()? as usize;
            Ok(Value::Blob(cursor.read_bytes(len)?.to_vec()))
        }
        other => Err(Error::MalformedCodec(format!("unknown value tag {other}"))),
    }
}

/// Reject NaN/infinite floats and normalize -0.0 to +0.0 so equal values
/// always encode to equal bytes.
pub fn normalize_f64(v: f64) -> Result<f64> {
    if v.is_nan() {
        return Err(Error::FloatNormalization("NaN not allowed".into()));
    }
    if v.is_infinite() {
        return Err(Error::FloatNormalization("infinity not allowed".into()));
    }
    if v == 0.0 && v.is_sign_negative() {
        return Ok(0.0);
    }
    Ok(v)
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.pos + len > self.bytes.len() {
            return Err(Error::MalformedCodec("unexpected end of payload".into()));
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_map() -> ValueMap {
        let mut m = ValueMap::new();
        m.insert("zeta".into(), Value::Text("last".into()));
        m.insert("amount".into(), Value::Integer(-42));
        m.insert("nickname".into(), Value::Null);
        m.insert("ratio".into(), Value::Real(1.5));
        m.insert("payload".into(), Value::Blob(vec![1, 2, 3]));
        m
    }

    #[test]
    fn round_trips() {
        let map = sample_map();
        let bytes = encode_value_map(&map).unwrap();
        let decoded = decode_value_map(&bytes).unwrap();
        assert_eq!(map, decoded);
    }

    #[test]
    fn encoding_is_insertion_order_independent() {
        let mut a = ValueMap::new();
        a.insert("b".into(), Value::Integer(2));
        a.insert("a".into(), Value::Integer(1));

        let mut b = ValueMap::new();
        b.insert("a".into(), Value::Integer(1));
        b.insert("b".into(), Value::Integer(2));

        assert_eq!(encode_value_map(&a).unwrap(), encode_value_map(&b).unwrap());
    }

    #[test]
    fn rejects_nan_and_infinity() {
        let mut m = ValueMap::new();
        m.insert("x".into(), Value::Real(f64::NAN));
        assert!(encode_value_map(&m).is_err());

        let mut m = ValueMap::new();
        m.insert("x".into(), Value::Real(f64::INFINITY));
        assert!(encode_value_map(&m).is_err());
    }

    #[test]
    fn normalizes_negative_zero() {
        let mut neg = ValueMap::new();
        neg.insert("x".into(), Value::Real(-0.0));
        let mut pos = ValueMap::new();
        pos.insert("x".into(), Value::Real(0.0));
        assert_eq!(encode_value_map(&neg).unwrap(), encode_value_map(&pos).unwrap());
    }

    #[test]
    fn rejects_truncated_payload() {
        let map = sample_map();
        let bytes = encode_value_map(&map).unwrap();
        let truncated = &bytes[..bytes.len() - 2];
        assert!(decode_value_map(truncated).is_err());
    }
}

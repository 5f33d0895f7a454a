//! Deterministic Value Blob Codec
//!
//! Log records store their payload as a self-describing binary blob so that
//! the storage engine stays oblivious to the value's interior structure. The
//! encoding here is deliberately hand-rolled rather than delegated to a
//! generic serializer: the entry CRC and the merge pass both require that the
//! same value always encodes to the same bytes.
//!
//! Layout: one tag byte per shape, BigEndian fixed-width scalars and lengths,
//! recursion for aggregates. Tag `0x00` is reserved for the tombstone
//! sentinel; no live value encoding begins with it.

use crate::protocol::Value;
use byteorder::{BigEndian, ReadBytesExt};
use bytes::Bytes;
use std::io::{Cursor, Read};
use thiserror::Error;

// Tag bytes. 0x00 is the tombstone sentinel and never starts a live value.
const TAG_TOMBSTONE: u8 = 0x00;
const TAG_NULL: u8 = 0x01;
const TAG_BOOL: u8 = 0x02;
const TAG_INT: u8 = 0x03;
const TAG_FLOAT: u8 = 0x04;
const TAG_BYTES: u8 = 0x05;
const TAG_STRING: u8 = 0x06;
const TAG_ERROR: u8 = 0x07;
const TAG_ARRAY: u8 = 0x08;
const TAG_MAP: u8 = 0x09;
const TAG_SET: u8 = 0x0A;

/// The on-disk tombstone blob: a single sentinel byte.
pub const TOMBSTONE: &[u8] = &[TAG_TOMBSTONE];

/// Errors raised while decoding a value blob.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValueCodecError {
    /// The blob ended before the declared structure was complete
    #[error("truncated value blob")]
    Truncated,

    /// Unknown tag byte
    #[error("unknown value tag: {0:#04x}")]
    UnknownTag(u8),

    /// A string payload was not valid UTF-8
    #[error("invalid utf-8 in string value")]
    InvalidUtf8,

    /// Bytes remained after the value was fully decoded
    #[error("trailing bytes after value")]
    TrailingBytes,
}

/// Returns true if the blob is the tombstone sentinel.
#[inline]
pub fn is_tombstone(blob: &[u8]) -> bool {
    blob == TOMBSTONE
}

/// Encodes a value into its deterministic blob form.
pub fn encode_value(value: &Value) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16);
    write_value(value, &mut buf);
    buf
}

fn write_value(value: &Value, buf: &mut Vec<u8>) {
    match value {
        Value::Null => buf.push(TAG_NULL),
        Value::Bool(b) => {
            buf.push(TAG_BOOL);
            buf.push(if *b { 0x01 } else { 0x00 });
        }
        Value::Int(n) => {
            buf.push(TAG_INT);
            buf.extend_from_slice(&n.to_be_bytes());
        }
        Value::Float(f) => {
            buf.push(TAG_FLOAT);
            buf.extend_from_slice(&f.to_bits().to_be_bytes());
        }
        Value::Bulk(data) => {
            buf.push(TAG_BYTES);
            buf.extend_from_slice(&(data.len() as u32).to_be_bytes());
            buf.extend_from_slice(data);
        }
        Value::Simple(s) => {
            buf.push(TAG_STRING);
            buf.extend_from_slice(&(s.len() as u32).to_be_bytes());
            buf.extend_from_slice(s.as_bytes());
        }
        Value::Error(s) => {
            buf.push(TAG_ERROR);
            buf.extend_from_slice(&(s.len() as u32).to_be_bytes());
            buf.extend_from_slice(s.as_bytes());
        }
        Value::Array(values) => {
            buf.push(TAG_ARRAY);
            buf.extend_from_slice(&(values.len() as u32).to_be_bytes());
            for v in values {
                write_value(v, buf);
            }
        }
        Value::Map(pairs) => {
            buf.push(TAG_MAP);
            buf.extend_from_slice(&(pairs.len() as u32).to_be_bytes());
            for (k, v) in pairs {
                write_value(k, buf);
                write_value(v, buf);
            }
        }
        Value::Set(values) => {
            buf.push(TAG_SET);
            buf.extend_from_slice(&(values.len() as u32).to_be_bytes());
            for v in values {
                write_value(v, buf);
            }
        }
    }
}

/// Decodes a value blob, requiring the whole slice to be consumed.
///
/// Tombstone blobs are not values; callers check [`is_tombstone`] first.
pub fn decode_value(blob: &[u8]) -> Result<Value, ValueCodecError> {
    let mut cursor = Cursor::new(blob);
    let value = read_value(&mut cursor)?;
    if cursor.position() as usize != blob.len() {
        return Err(ValueCodecError::TrailingBytes);
    }
    Ok(value)
}

fn read_value(cursor: &mut Cursor<&[u8]>) -> Result<Value, ValueCodecError> {
    let tag = cursor.read_u8().map_err(|_| ValueCodecError::Truncated)?;

    match tag {
        TAG_NULL => Ok(Value::Null),
        TAG_BOOL => {
            let b = cursor.read_u8().map_err(|_| ValueCodecError::Truncated)?;
            Ok(Value::Bool(b != 0))
        }
        TAG_INT => {
            let n = cursor
                .read_i64::<BigEndian>()
                .map_err(|_| ValueCodecError::Truncated)?;
            Ok(Value::Int(n))
        }
        TAG_FLOAT => {
            let bits = cursor
                .read_u64::<BigEndian>()
                .map_err(|_| ValueCodecError::Truncated)?;
            Ok(Value::Float(f64::from_bits(bits)))
        }
        TAG_BYTES => {
            let raw = read_len_prefixed(cursor)?;
            Ok(Value::Bulk(Bytes::from(raw)))
        }
        TAG_STRING => {
            let raw = read_len_prefixed(cursor)?;
            let s = String::from_utf8(raw).map_err(|_| ValueCodecError::InvalidUtf8)?;
            Ok(Value::Simple(s))
        }
        TAG_ERROR => {
            let raw = read_len_prefixed(cursor)?;
            let s = String::from_utf8(raw).map_err(|_| ValueCodecError::InvalidUtf8)?;
            Ok(Value::Error(s))
        }
        TAG_ARRAY => {
            let count = read_count(cursor)?;
            let mut values = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                values.push(read_value(cursor)?);
            }
            Ok(Value::Array(values))
        }
        TAG_MAP => {
            let count = read_count(cursor)?;
            let mut pairs = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                let k = read_value(cursor)?;
                let v = read_value(cursor)?;
                pairs.push((k, v));
            }
            Ok(Value::Map(pairs))
        }
        TAG_SET => {
            let count = read_count(cursor)?;
            let mut values = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                values.push(read_value(cursor)?);
            }
            Ok(Value::Set(values))
        }
        other => Err(ValueCodecError::UnknownTag(other)),
    }
}

fn read_count(cursor: &mut Cursor<&[u8]>) -> Result<usize, ValueCodecError> {
    let count = cursor
        .read_u32::<BigEndian>()
        .map_err(|_| ValueCodecError::Truncated)?;
    Ok(count as usize)
}

fn read_len_prefixed(cursor: &mut Cursor<&[u8]>) -> Result<Vec<u8>, ValueCodecError> {
    let len = read_count(cursor)?;
    let remaining = cursor.get_ref().len() - cursor.position() as usize;
    if len > remaining {
        return Err(ValueCodecError::Truncated);
    }
    let mut raw = vec![0u8; len];
    cursor
        .read_exact(&mut raw)
        .map_err(|_| ValueCodecError::Truncated)?;
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: Value) {
        let blob = encode_value(&value);
        let decoded = decode_value(&blob).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_scalar_roundtrips() {
        roundtrip(Value::Null);
        roundtrip(Value::Bool(true));
        roundtrip(Value::Bool(false));
        roundtrip(Value::Int(0));
        roundtrip(Value::Int(i64::MIN));
        roundtrip(Value::Int(i64::MAX));
        roundtrip(Value::Float(3.25));
        roundtrip(Value::Float(f64::NEG_INFINITY));
        roundtrip(Value::Simple("OK".to_string()));
        roundtrip(Value::Error("ERR bad".to_string()));
        roundtrip(Value::Bulk(Bytes::from_static(b"binary\x00safe")));
        roundtrip(Value::Bulk(Bytes::new()));
    }

    #[test]
    fn test_aggregate_roundtrips() {
        roundtrip(Value::Array(vec![
            Value::Int(1),
            Value::Bulk(Bytes::from("two")),
            Value::Array(vec![Value::Bool(false)]),
        ]));
        roundtrip(Value::Map(vec![
            (Value::Bulk(Bytes::from("k1")), Value::Int(1)),
            (Value::Bulk(Bytes::from("k2")), Value::Null),
        ]));
        roundtrip(Value::Set(vec![Value::Int(1), Value::Int(2)]));
        roundtrip(Value::Array(vec![]));
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let value = Value::Map(vec![
            (Value::Bulk(Bytes::from("a")), Value::Int(1)),
            (Value::Bulk(Bytes::from("b")), Value::Float(2.5)),
        ]);
        assert_eq!(encode_value(&value), encode_value(&value.clone()));
    }

    #[test]
    fn test_tombstone_sentinel() {
        assert!(is_tombstone(TOMBSTONE));
        assert!(!is_tombstone(&encode_value(&Value::Null)));
        assert!(!is_tombstone(&encode_value(&Value::Bulk(Bytes::from("x")))));
        // A tombstone is not a decodable value.
        assert!(decode_value(TOMBSTONE).is_err());
    }

    #[test]
    fn test_truncated_blob() {
        let mut blob = encode_value(&Value::Bulk(Bytes::from("hello")));
        blob.truncate(blob.len() - 2);
        assert_eq!(decode_value(&blob), Err(ValueCodecError::Truncated));
    }

    #[test]
    fn test_unknown_tag() {
        assert_eq!(decode_value(&[0x7F]), Err(ValueCodecError::UnknownTag(0x7F)));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut blob = encode_value(&Value::Int(1));
        blob.push(0xAA);
        assert_eq!(decode_value(&blob), Err(ValueCodecError::TrailingBytes));
    }
}

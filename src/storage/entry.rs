//! Log Entry Codec
//!
//! One datafile record, as it exists on disk:
//!
//! ```text
//! ┌────────┬───────────────┬──────────┬────────────┬─────┬───────────┐
//! │ crc32  │ expiration_ms │ key_size │ value_size │ key │ value blob│
//! │  4 B   │   8 B (BE)    │ 4 B (BE) │  4 B (BE)  │     │           │
//! └────────┴───────────────┴──────────┴────────────┴─────┴───────────┘
//! ```
//!
//! The CRC covers everything after itself: the 16-byte header tail plus the
//! key and value bytes. `expiration_ms` of zero means the record never
//! expires; otherwise it is a wall-clock millisecond deadline. Deletion is
//! recorded by appending a record whose value blob is the tombstone
//! sentinel.
//!
//! Decoding never filters expired or tombstone records: the scan used by
//! keydir rebuild and merge needs to see them.

use crate::protocol::Value;
use crate::storage::value::{self, ValueCodecError};
use byteorder::{BigEndian, ReadBytesExt};
use bytes::Bytes;
use std::io::Cursor;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Size of the fixed record header: 4-byte CRC plus 16 bytes of fields.
pub const HEADER_SIZE: usize = 20;

/// Errors raised while decoding a log record.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EntryError {
    /// The stored CRC does not match the recomputed one
    #[error("checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { stored: u32, computed: u32 },

    /// The record is structurally invalid (truncated, bad sizes, bad blob)
    #[error("malformed entry: {0}")]
    MalformedEntry(String),
}

impl From<ValueCodecError> for EntryError {
    fn from(err: ValueCodecError) -> Self {
        EntryError::MalformedEntry(err.to_string())
    }
}

/// A decoded log record.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    /// The record's key
    pub key: Bytes,
    /// The decoded value; `Value::Null` for tombstones
    pub value: Value,
    /// Millisecond expiration deadline; 0 means no expiration
    pub expiration_ms: u64,
    /// Whether this record marks a deletion
    tombstone: bool,
}

impl Entry {
    /// Returns true if this record is a deletion marker.
    #[inline]
    pub fn is_tombstone(&self) -> bool {
        self.tombstone
    }

    /// Returns true if the record has expired at `now_ms`.
    #[inline]
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expiration_ms != 0 && now_ms >= self.expiration_ms
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Encodes a live record for `key` holding `value`.
pub fn encode(key: &[u8], value: &Value, expiration_ms: u64) -> Vec<u8> {
    encode_blob(key, &value::encode_value(value), expiration_ms)
}

/// Encodes a tombstone record for `key`.
pub fn encode_tombstone(key: &[u8]) -> Vec<u8> {
    encode_blob(key, value::TOMBSTONE, 0)
}

fn encode_blob(key: &[u8], blob: &[u8], expiration_ms: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + key.len() + blob.len());

    // CRC placeholder; filled in after the tail is written.
    buf.extend_from_slice(&[0u8; 4]);
    buf.extend_from_slice(&expiration_ms.to_be_bytes());
    buf.extend_from_slice(&(key.len() as u32).to_be_bytes());
    buf.extend_from_slice(&(blob.len() as u32).to_be_bytes());
    buf.extend_from_slice(key);
    buf.extend_from_slice(blob);

    let crc = crc32fast::hash(&buf[4..]);
    buf[0..4].copy_from_slice(&crc.to_be_bytes());
    buf
}

/// Decodes a full record from `bytes`.
///
/// The slice must contain exactly one record. The CRC is recomputed and
/// verified; expired and tombstone records decode successfully, filtering
/// them is the caller's duty so that merge can observe them.
pub fn decode(bytes: &[u8]) -> Result<Entry, EntryError> {
    if bytes.len() < HEADER_SIZE {
        return Err(EntryError::MalformedEntry(format!(
            "record shorter than header: {} bytes",
            bytes.len()
        )));
    }

    let mut cursor = Cursor::new(bytes);
    let stored = cursor.read_u32::<BigEndian>().map_err(truncated)?;
    let expiration_ms = cursor.read_u64::<BigEndian>().map_err(truncated)?;
    let key_size = cursor.read_u32::<BigEndian>().map_err(truncated)? as usize;
    let value_size = cursor.read_u32::<BigEndian>().map_err(truncated)? as usize;

    if key_size == 0 {
        return Err(EntryError::MalformedEntry("zero-length key".to_string()));
    }

    let expected_len = HEADER_SIZE + key_size + value_size;
    if bytes.len() != expected_len {
        return Err(EntryError::MalformedEntry(format!(
            "record length {} does not match declared {}",
            bytes.len(),
            expected_len
        )));
    }

    let computed = crc32fast::hash(&bytes[4..]);
    if computed != stored {
        return Err(EntryError::ChecksumMismatch { stored, computed });
    }

    let key = Bytes::copy_from_slice(&bytes[HEADER_SIZE..HEADER_SIZE + key_size]);
    let blob = &bytes[HEADER_SIZE + key_size..];

    if value::is_tombstone(blob) {
        return Ok(Entry {
            key,
            value: Value::Null,
            expiration_ms,
            tombstone: true,
        });
    }

    let value = value::decode_value(blob)?;
    Ok(Entry {
        key,
        value,
        expiration_ms,
        tombstone: false,
    })
}

/// Reads the declared key and value sizes out of a record header.
///
/// Used by the scan path to learn the total record size before reading the
/// body. No CRC validation happens here.
pub fn decode_sizes(header: &[u8]) -> Result<(usize, usize), EntryError> {
    if header.len() < HEADER_SIZE {
        return Err(EntryError::MalformedEntry(
            "header shorter than 20 bytes".to_string(),
        ));
    }
    let mut cursor = Cursor::new(&header[12..HEADER_SIZE]);
    let key_size = cursor.read_u32::<BigEndian>().map_err(truncated)? as usize;
    let value_size = cursor.read_u32::<BigEndian>().map_err(truncated)? as usize;
    Ok((key_size, value_size))
}

fn truncated(_: std::io::Error) -> EntryError {
    EntryError::MalformedEntry("truncated header".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let value = Value::Bulk(Bytes::from("hello world"));
        let bytes = encode(b"mykey", &value, 0);
        let entry = decode(&bytes).unwrap();

        assert_eq!(entry.key, Bytes::from("mykey"));
        assert_eq!(entry.value, value);
        assert_eq!(entry.expiration_ms, 0);
        assert!(!entry.is_tombstone());
        assert!(!entry.is_expired(unix_ms()));
    }

    #[test]
    fn test_roundtrip_all_shapes() {
        let values = vec![
            Value::Null,
            Value::Bool(true),
            Value::Int(-99),
            Value::Float(1.5),
            Value::Bulk(Bytes::from_static(b"\x00\x01\x02")),
            Value::Array(vec![Value::Int(1), Value::Simple("x".to_string())]),
            Value::Map(vec![(Value::Bulk(Bytes::from("k")), Value::Int(2))]),
            Value::Set(vec![Value::Int(3)]),
        ];

        for value in values {
            let bytes = encode(b"k", &value, 42);
            let entry = decode(&bytes).unwrap();
            assert_eq!(entry.value, value);
            assert_eq!(entry.expiration_ms, 42);
        }
    }

    #[test]
    fn test_expiration() {
        let bytes = encode(b"k", &Value::Int(1), 1_000);
        let entry = decode(&bytes).unwrap();

        assert!(!entry.is_expired(999));
        assert!(entry.is_expired(1_000));
        assert!(entry.is_expired(2_000));

        // Zero means never expires.
        let bytes = encode(b"k", &Value::Int(1), 0);
        let entry = decode(&bytes).unwrap();
        assert!(!entry.is_expired(u64::MAX));
    }

    #[test]
    fn test_tombstone() {
        let bytes = encode_tombstone(b"gone");
        let entry = decode(&bytes).unwrap();

        assert!(entry.is_tombstone());
        assert_eq!(entry.key, Bytes::from("gone"));
        assert_eq!(bytes.len(), HEADER_SIZE + 4 + 1);
    }

    #[test]
    fn test_checksum_rejected() {
        let mut bytes = encode(b"k", &Value::Bulk(Bytes::from("v")), 0);
        // Flip one bit in the value payload.
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;

        assert!(matches!(
            decode(&bytes),
            Err(EntryError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_truncated_record() {
        let bytes = encode(b"k", &Value::Bulk(Bytes::from("value")), 0);
        assert!(matches!(
            decode(&bytes[..bytes.len() - 3]),
            Err(EntryError::MalformedEntry(_))
        ));
        assert!(matches!(
            decode(&bytes[..10]),
            Err(EntryError::MalformedEntry(_))
        ));
    }

    #[test]
    fn test_zero_length_key_rejected() {
        let bytes = encode(b"", &Value::Int(1), 0);
        assert!(matches!(
            decode(&bytes),
            Err(EntryError::MalformedEntry(_))
        ));
    }

    #[test]
    fn test_decode_sizes() {
        let bytes = encode(b"abc", &Value::Bulk(Bytes::from("defg")), 0);
        let (key_size, value_size) = decode_sizes(&bytes[..HEADER_SIZE]).unwrap();
        assert_eq!(key_size, 3);
        assert_eq!(bytes.len(), HEADER_SIZE + key_size + value_size);
    }

    #[test]
    fn test_header_size_is_fixed() {
        let bytes = encode(b"k", &Value::Int(0), 0);
        // 4 CRC + 8 expiration + 4 key size + 4 value size.
        assert_eq!(HEADER_SIZE, 20);
        assert!(bytes.len() > HEADER_SIZE);
    }
}

//! RESP (Redis Serialization Protocol) Data Types
//!
//! This module defines the value universe shared by the wire codec and the
//! storage engine, together with the RESP encoder.
//!
//! ## Protocol Format
//!
//! Each RESP frame starts with a type prefix byte:
//! - `+` Simple String
//! - `-` Error
//! - `:` Integer
//! - `$` Bulk String
//! - `*` Array
//! - `_` Null
//! - `#` Boolean
//! - `,` Double
//! - `%` Map
//! - `~` Set
//!
//! All frames are terminated with CRLF (`\r\n`).
//!
//! ## Examples
//!
//! Simple String: `+OK\r\n`
//! Error: `-ERR unknown command\r\n`
//! Integer: `:1000\r\n`
//! Bulk String: `$5\r\nhello\r\n`
//! Null: `_\r\n`
//! Boolean: `#t\r\n`
//! Double: `,3.25\r\n`
//! Array: `*2\r\n$3\r\nGET\r\n$4\r\nname\r\n`
//! Map: `%1\r\n$3\r\nkey\r\n:1\r\n`

use bytes::Bytes;
use std::fmt;

/// The CRLF terminator used in the RESP protocol
pub const CRLF: &[u8] = b"\r\n";

/// RESP protocol type prefixes
pub mod prefix {
    pub const SIMPLE_STRING: u8 = b'+';
    pub const ERROR: u8 = b'-';
    pub const INTEGER: u8 = b':';
    pub const BULK_STRING: u8 = b'$';
    pub const ARRAY: u8 = b'*';
    pub const NULL: u8 = b'_';
    pub const BOOLEAN: u8 = b'#';
    pub const DOUBLE: u8 = b',';
    pub const BIG_NUMBER: u8 = b'(';
    pub const BULK_ERROR: u8 = b'!';
    pub const MAP: u8 = b'%';
    pub const SET: u8 = b'~';
}

/// A value in the RESP protocol.
///
/// This enum doubles as the application value universe: the storage engine
/// persists these values through its deterministic blob codec, and the wire
/// codec parses and produces them. Aggregates preserve insertion order, which
/// keeps both codecs deterministic.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Null (`_\r\n`). Also produced when decoding the RESP2 forms
    /// `$-1\r\n` and `*-1\r\n`.
    Null,

    /// Simple strings are non-binary-safe and cannot contain CRLF.
    /// Format: `+<string>\r\n`
    Simple(String),

    /// Errors are simple strings that indicate a failure condition.
    /// Format: `-<error message>\r\n`
    Error(String),

    /// Booleans. Format: `#t\r\n` / `#f\r\n`
    Bool(bool),

    /// 64-bit signed integers. Format: `:<integer>\r\n`
    Int(i64),

    /// Double-precision floats. Format: `,<float>\r\n`, with `inf`, `-inf`
    /// and `nan` permitted as textual payloads.
    Float(f64),

    /// Bulk strings are binary-safe byte strings.
    /// Format: `$<length>\r\n<data>\r\n`
    Bulk(Bytes),

    /// Arrays can contain any value, including nested arrays.
    /// Format: `*<count>\r\n<element1><element2>...`
    Array(Vec<Value>),

    /// Maps are ordered key-value pair lists.
    /// Format: `%<pairs>\r\n<key1><value1>...`
    Map(Vec<(Value, Value)>),

    /// Sets are ordered element lists with set semantics at the application
    /// level. Format: `~<count>\r\n<element1>...`
    Set(Vec<Value>),
}

impl Value {
    /// Creates a new simple string value.
    pub fn simple(s: impl Into<String>) -> Self {
        Value::Simple(s.into())
    }

    /// Creates a new error value.
    pub fn error(s: impl Into<String>) -> Self {
        Value::Error(s.into())
    }

    /// Creates a new integer value.
    pub fn int(n: i64) -> Self {
        Value::Int(n)
    }

    /// Creates a new bulk string value.
    pub fn bulk(data: impl Into<Bytes>) -> Self {
        Value::Bulk(data.into())
    }

    /// Creates a null value.
    pub fn null() -> Self {
        Value::Null
    }

    /// Creates an array value.
    pub fn array(values: Vec<Value>) -> Self {
        Value::Array(values)
    }

    /// The `+OK\r\n` reply for successful operations.
    pub fn ok() -> Self {
        Value::Simple("OK".to_string())
    }

    /// The `+PONG\r\n` reply.
    pub fn pong() -> Self {
        Value::Simple("PONG".to_string())
    }

    /// The `+QUEUED\r\n` reply used inside transactions.
    pub fn queued() -> Self {
        Value::Simple("QUEUED".to_string())
    }

    /// Serializes the value to RESP wire bytes.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.serialize_into(&mut buf);
        buf
    }

    /// Serializes the value into an existing buffer.
    ///
    /// This is more efficient than `serialize()` when replies for a whole
    /// pipeline batch are accumulated into one send buffer.
    pub fn serialize_into(&self, buf: &mut Vec<u8>) {
        match self {
            Value::Null => {
                buf.push(prefix::NULL);
                buf.extend_from_slice(CRLF);
            }
            Value::Simple(s) => {
                buf.push(prefix::SIMPLE_STRING);
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(CRLF);
            }
            Value::Error(s) => {
                buf.push(prefix::ERROR);
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(CRLF);
            }
            Value::Bool(b) => {
                buf.push(prefix::BOOLEAN);
                buf.push(if *b { b't' } else { b'f' });
                buf.extend_from_slice(CRLF);
            }
            Value::Int(n) => {
                buf.push(prefix::INTEGER);
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.extend_from_slice(CRLF);
            }
            Value::Float(f) => {
                buf.push(prefix::DOUBLE);
                buf.extend_from_slice(format_float(*f).as_bytes());
                buf.extend_from_slice(CRLF);
            }
            Value::Bulk(data) => {
                buf.push(prefix::BULK_STRING);
                buf.extend_from_slice(data.len().to_string().as_bytes());
                buf.extend_from_slice(CRLF);
                buf.extend_from_slice(data);
                buf.extend_from_slice(CRLF);
            }
            Value::Array(values) => {
                buf.push(prefix::ARRAY);
                buf.extend_from_slice(values.len().to_string().as_bytes());
                buf.extend_from_slice(CRLF);
                for value in values {
                    value.serialize_into(buf);
                }
            }
            Value::Map(pairs) => {
                buf.push(prefix::MAP);
                buf.extend_from_slice(pairs.len().to_string().as_bytes());
                buf.extend_from_slice(CRLF);
                for (key, value) in pairs {
                    key.serialize_into(buf);
                    value.serialize_into(buf);
                }
            }
            Value::Set(values) => {
                buf.push(prefix::SET);
                buf.extend_from_slice(values.len().to_string().as_bytes());
                buf.extend_from_slice(CRLF);
                for value in values {
                    value.serialize_into(buf);
                }
            }
        }
    }

    /// Returns true if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Returns true if this value is an error.
    pub fn is_error(&self) -> bool {
        matches!(self, Value::Error(_))
    }

    /// Attempts to view the value as a string (Simple or UTF-8 Bulk).
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Simple(s) => Some(s),
            Value::Bulk(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Attempts to view the inner bytes of a bulk string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bulk(b) => Some(b),
            _ => None,
        }
    }

    /// Attempts to extract the inner integer.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Attempts to view the inner array.
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(arr) => Some(arr),
            _ => None,
        }
    }

    /// Consumes self and returns the inner array if this is an Array.
    pub fn into_array(self) -> Option<Vec<Value>> {
        match self {
            Value::Array(arr) => Some(arr),
            _ => None,
        }
    }
}

/// Formats a float as its RESP textual payload.
///
/// Infinities and NaN use the protocol's lowercase spellings so they survive
/// a decode round-trip.
fn format_float(f: f64) -> String {
    if f.is_nan() {
        "nan".to_string()
    } else if f == f64::INFINITY {
        "inf".to_string()
    } else if f == f64::NEG_INFINITY {
        "-inf".to_string()
    } else {
        format!("{}", f)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "(nil)"),
            Value::Simple(s) => write!(f, "\"{}\"", s),
            Value::Error(s) => write!(f, "(error) {}", s),
            Value::Bool(b) => write!(f, "({})", b),
            Value::Int(n) => write!(f, "(integer) {}", n),
            Value::Float(x) => write!(f, "(double) {}", format_float(*x)),
            Value::Bulk(data) => {
                if let Ok(s) = std::str::from_utf8(data) {
                    write!(f, "\"{}\"", s)
                } else {
                    write!(f, "(binary data, {} bytes)", data.len())
                }
            }
            Value::Array(values) => {
                if values.is_empty() {
                    write!(f, "(empty array)")
                } else {
                    writeln!(f)?;
                    for (i, v) in values.iter().enumerate() {
                        writeln!(f, "{}) {}", i + 1, v)?;
                    }
                    Ok(())
                }
            }
            Value::Map(pairs) => {
                if pairs.is_empty() {
                    write!(f, "(empty map)")
                } else {
                    writeln!(f)?;
                    for (i, (k, v)) in pairs.iter().enumerate() {
                        writeln!(f, "{}# {} => {}", i + 1, k, v)?;
                    }
                    Ok(())
                }
            }
            Value::Set(values) => {
                if values.is_empty() {
                    write!(f, "(empty set)")
                } else {
                    writeln!(f)?;
                    for (i, v) in values.iter().enumerate() {
                        writeln!(f, "{}~ {}", i + 1, v)?;
                    }
                    Ok(())
                }
            }
        }
    }
}

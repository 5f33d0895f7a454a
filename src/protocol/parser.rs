//! Streaming RESP Protocol Parser
//!
//! This module implements an incremental parser for the RESP protocol.
//! It handles partial data gracefully: a TCP read may deliver half a frame,
//! several frames, or several frames plus a trailing fragment, and the parser
//! never emits a value until the frame is fully present in the buffer.
//!
//! ## How the Parser Works
//!
//! The parser reads from a buffer and returns either:
//! - `Ok(Some((value, consumed)))` - Successfully parsed a value, `consumed` bytes were used
//! - `Ok(None)` - Need more data, the frame is incomplete
//! - `Err(ParseError)` - Invalid protocol data
//!
//! This design allows the caller to:
//! 1. Append incoming network data to a buffer
//! 2. Call `parse()` to attempt parsing
//! 3. If successful, advance the buffer by `consumed` bytes
//! 4. If incomplete, wait for more data
//! 5. If error, reply with an error and drop the buffer
//!
//! For callers that know the buffer holds a complete frame (tests, replay
//! tooling), [`decode_message`] converts an incomplete parse into a hard
//! error: a missing line terminator becomes `MalformedLine` and a truncated
//! bulk payload becomes `InsufficientData`.

use crate::protocol::types::{prefix, Value, CRLF};
use bytes::Bytes;
use thiserror::Error;

/// Errors that can occur during RESP parsing.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    /// Unknown type prefix byte
    #[error("invalid type prefix: {0:#04x}")]
    InvalidType(u8),

    /// A protocol line was syntactically broken (bad terminator, bad payload)
    #[error("malformed line: {0}")]
    MalformedLine(String),

    /// Invalid integer where one was expected (lengths, `:`/`(` payloads)
    #[error("invalid integer: {0}")]
    InvalidInteger(String),

    /// Negative or oversized length other than the null sentinel -1
    #[error("invalid length: {0}")]
    InvalidLength(i64),

    /// A declared bulk length exceeds the bytes available in a buffer the
    /// caller asserted was complete
    #[error("insufficient data: need {needed} bytes, have {have}")]
    InsufficientData { needed: usize, have: usize },
}

/// Result type for parsing operations.
pub type ParseResult<T> = Result<T, ParseError>;

/// Maximum size for a single bulk string (512 MB, same as Redis)
pub const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;

/// Maximum aggregate nesting depth (prevents stack overflow)
pub const MAX_NESTING_DEPTH: usize = 32;

/// Internal parse outcome, distinguishing the two flavors of "incomplete":
/// a line whose CRLF has not arrived yet versus a bulk payload whose declared
/// length exceeds the buffered bytes. The streaming API collapses both into
/// `Ok(None)`; the strict API maps them to different errors.
enum Step {
    Complete(Value, usize),
    NeedLine,
    NeedData { needed: usize, have: usize },
}

/// A streaming RESP protocol parser.
///
/// # Example
///
/// ```ignore
/// use beetle::protocol::Parser;
/// use bytes::BytesMut;
///
/// let mut parser = Parser::new();
/// let mut buffer = BytesMut::from(&b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n"[..]);
///
/// if let Some((value, consumed)) = parser.parse(&buffer)? {
///     buffer.advance(consumed);
///     println!("Parsed: {:?}", value);
/// }
/// ```
#[derive(Debug, Default)]
pub struct Parser {
    /// Current nesting depth (for aggregate parsing)
    depth: usize,
}

impl Parser {
    /// Creates a new parser instance.
    pub fn new() -> Self {
        Self { depth: 0 }
    }

    /// Attempts to parse one RESP value from the buffer.
    ///
    /// # Returns
    ///
    /// - `Ok(Some((value, consumed)))` - Successfully parsed a value
    /// - `Ok(None)` - Incomplete data, need more bytes
    /// - `Err(e)` - Parse error
    pub fn parse(&mut self, buf: &[u8]) -> ParseResult<Option<(Value, usize)>> {
        self.depth = 0;
        match self.parse_value(buf)? {
            Step::Complete(value, consumed) => Ok(Some((value, consumed))),
            Step::NeedLine | Step::NeedData { .. } => Ok(None),
        }
    }

    /// Drains every complete frame from the buffer.
    ///
    /// Returns the parsed frames and the total number of bytes consumed;
    /// bytes past `consumed` are the trailing partial frame, if any. This is
    /// the entry point the connection layer uses to pick up pipelined
    /// batches in one pass.
    pub fn parse_all(&mut self, buf: &[u8]) -> ParseResult<(Vec<Value>, usize)> {
        let mut frames = Vec::new();
        let mut consumed = 0;

        while consumed < buf.len() {
            match self.parse(&buf[consumed..])? {
                Some((value, n)) => {
                    frames.push(value);
                    consumed += n;
                }
                None => break,
            }
        }

        Ok((frames, consumed))
    }

    /// Internal recursive parsing function.
    fn parse_value(&mut self, buf: &[u8]) -> ParseResult<Step> {
        if buf.is_empty() {
            return Ok(Step::NeedLine);
        }

        if self.depth > MAX_NESTING_DEPTH {
            return Err(ParseError::MalformedLine(format!(
                "maximum nesting depth exceeded: {}",
                MAX_NESTING_DEPTH
            )));
        }

        match buf[0] {
            prefix::SIMPLE_STRING => self.parse_simple(buf, false),
            prefix::ERROR => self.parse_simple(buf, true),
            prefix::INTEGER => self.parse_integer(buf),
            prefix::BIG_NUMBER => self.parse_integer(buf),
            prefix::BULK_STRING => self.parse_bulk(buf, false),
            prefix::BULK_ERROR => self.parse_bulk(buf, true),
            prefix::ARRAY => self.parse_aggregate(buf, Aggregate::Array),
            prefix::MAP => self.parse_aggregate(buf, Aggregate::Map),
            prefix::SET => self.parse_aggregate(buf, Aggregate::Set),
            prefix::NULL => self.parse_null(buf),
            prefix::BOOLEAN => self.parse_boolean(buf),
            prefix::DOUBLE => self.parse_double(buf),
            other => Err(ParseError::InvalidType(other)),
        }
    }

    /// Parses `+<string>\r\n` or `-<message>\r\n`.
    fn parse_simple(&mut self, buf: &[u8], is_error: bool) -> ParseResult<Step> {
        match find_crlf(&buf[1..]) {
            Some(pos) => {
                let content = &buf[1..1 + pos];
                let s = std::str::from_utf8(content)
                    .map_err(|e| ParseError::MalformedLine(e.to_string()))?;

                // +1 for prefix, +2 for CRLF
                let consumed = 1 + pos + 2;
                let value = if is_error {
                    Value::Error(s.to_string())
                } else {
                    Value::Simple(s.to_string())
                };
                Ok(Step::Complete(value, consumed))
            }
            None => Ok(Step::NeedLine),
        }
    }

    /// Parses `:<integer>\r\n`, and `(<big number>\r\n` which is returned as
    /// an integer.
    fn parse_integer(&mut self, buf: &[u8]) -> ParseResult<Step> {
        match find_crlf(&buf[1..]) {
            Some(pos) => {
                let n = parse_i64(&buf[1..1 + pos])?;
                Ok(Step::Complete(Value::Int(n), 1 + pos + 2))
            }
            None => Ok(Step::NeedLine),
        }
    }

    /// Parses `_\r\n`.
    fn parse_null(&mut self, buf: &[u8]) -> ParseResult<Step> {
        match find_crlf(&buf[1..]) {
            Some(0) => Ok(Step::Complete(Value::Null, 3)),
            Some(_) => Err(ParseError::MalformedLine(
                "null frame carries a payload".to_string(),
            )),
            None => Ok(Step::NeedLine),
        }
    }

    /// Parses `#t\r\n` / `#f\r\n`.
    fn parse_boolean(&mut self, buf: &[u8]) -> ParseResult<Step> {
        match find_crlf(&buf[1..]) {
            Some(1) => match buf[1] {
                b't' => Ok(Step::Complete(Value::Bool(true), 4)),
                b'f' => Ok(Step::Complete(Value::Bool(false), 4)),
                other => Err(ParseError::MalformedLine(format!(
                    "invalid boolean payload: {:#04x}",
                    other
                ))),
            },
            Some(_) => Err(ParseError::MalformedLine(
                "boolean payload must be a single 't' or 'f'".to_string(),
            )),
            None => Ok(Step::NeedLine),
        }
    }

    /// Parses `,<float>\r\n`, accepting `inf`, `+inf`, `-inf` and `nan`.
    fn parse_double(&mut self, buf: &[u8]) -> ParseResult<Step> {
        match find_crlf(&buf[1..]) {
            Some(pos) => {
                let s = std::str::from_utf8(&buf[1..1 + pos])
                    .map_err(|e| ParseError::MalformedLine(e.to_string()))?;
                let f = match s {
                    "inf" | "+inf" => f64::INFINITY,
                    "-inf" => f64::NEG_INFINITY,
                    "nan" => f64::NAN,
                    other => other
                        .parse::<f64>()
                        .map_err(|_| ParseError::MalformedLine(format!("invalid double: {}", other)))?,
                };
                Ok(Step::Complete(Value::Float(f), 1 + pos + 2))
            }
            None => Ok(Step::NeedLine),
        }
    }

    /// Parses `$<length>\r\n<data>\r\n` (and `!` bulk errors, which are
    /// returned as byte strings). `$-1\r\n` decodes to null.
    fn parse_bulk(&mut self, buf: &[u8], _is_error: bool) -> ParseResult<Step> {
        let length_end = match find_crlf(&buf[1..]) {
            Some(pos) => pos,
            None => return Ok(Step::NeedLine),
        };

        let length = parse_i64(&buf[1..1 + length_end])?;

        // RESP2 null bulk string
        if length == -1 {
            return Ok(Step::Complete(Value::Null, 1 + length_end + 2));
        }

        if length < 0 || length as usize > MAX_BULK_SIZE {
            return Err(ParseError::InvalidLength(length));
        }

        let length = length as usize;
        let data_start = 1 + length_end + 2;
        let total_needed = data_start + length + 2;

        if buf.len() < total_needed {
            return Ok(Step::NeedData {
                needed: total_needed,
                have: buf.len(),
            });
        }

        if &buf[data_start + length..data_start + length + 2] != CRLF {
            return Err(ParseError::MalformedLine(
                "bulk string missing trailing CRLF".to_string(),
            ));
        }

        let data = Bytes::copy_from_slice(&buf[data_start..data_start + length]);
        Ok(Step::Complete(Value::Bulk(data), total_needed))
    }

    /// Parses `*`, `%` and `~` aggregates. `*-1\r\n` decodes to null.
    fn parse_aggregate(&mut self, buf: &[u8], kind: Aggregate) -> ParseResult<Step> {
        let count_end = match find_crlf(&buf[1..]) {
            Some(pos) => pos,
            None => return Ok(Step::NeedLine),
        };

        let count = parse_i64(&buf[1..1 + count_end])?;

        if count == -1 && matches!(kind, Aggregate::Array) {
            return Ok(Step::Complete(Value::Null, 1 + count_end + 2));
        }

        if count < 0 {
            return Err(ParseError::InvalidLength(count));
        }

        let count = count as usize;
        // Maps carry two child values per declared pair.
        let children = match kind {
            Aggregate::Map => count * 2,
            _ => count,
        };

        let mut elements = Vec::with_capacity(children);
        let mut consumed = 1 + count_end + 2;

        self.depth += 1;

        for _ in 0..children {
            match self.parse_value(&buf[consumed..])? {
                Step::Complete(value, n) => {
                    elements.push(value);
                    consumed += n;
                }
                incomplete => {
                    self.depth -= 1;
                    return Ok(incomplete);
                }
            }
        }

        self.depth -= 1;

        let value = match kind {
            Aggregate::Array => Value::Array(elements),
            Aggregate::Set => Value::Set(elements),
            Aggregate::Map => {
                let mut pairs = Vec::with_capacity(count);
                let mut iter = elements.into_iter();
                while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
                    pairs.push((k, v));
                }
                Value::Map(pairs)
            }
        };

        Ok(Step::Complete(value, consumed))
    }
}

/// The three RESP aggregate shapes that share header parsing.
enum Aggregate {
    Array,
    Map,
    Set,
}

/// Finds the position of CRLF in the buffer.
///
/// Returns the position of `\r` if the pair is present, or None otherwise.
#[inline]
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == CRLF)
}

/// Parses a protocol integer (frame lengths, `:` and `(` payloads).
fn parse_i64(raw: &[u8]) -> ParseResult<i64> {
    let s = std::str::from_utf8(raw)
        .map_err(|_| ParseError::InvalidInteger("non-ASCII integer".to_string()))?;
    s.parse::<i64>()
        .map_err(|_| ParseError::InvalidInteger(s.to_string()))
}

/// Parses a single RESP frame from a buffer the caller asserts is complete.
///
/// Incomplete input is an error here: a missing CRLF yields `MalformedLine`,
/// a short bulk payload yields `InsufficientData`.
pub fn decode_message(buf: &[u8]) -> ParseResult<(Value, usize)> {
    let mut parser = Parser::new();
    match parser.parse_value(buf)? {
        Step::Complete(value, consumed) => Ok((value, consumed)),
        Step::NeedLine => Err(ParseError::MalformedLine(
            "missing CRLF terminator".to_string(),
        )),
        Step::NeedData { needed, have } => Err(ParseError::InsufficientData { needed, have }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_one(input: &[u8]) -> ParseResult<Option<(Value, usize)>> {
        Parser::new().parse(input)
    }

    #[test]
    fn test_parse_simple_string() {
        let result = parse_one(b"+OK\r\n").unwrap().unwrap();
        assert_eq!(result.0, Value::Simple("OK".to_string()));
        assert_eq!(result.1, 5);
    }

    #[test]
    fn test_parse_simple_string_incomplete() {
        assert!(parse_one(b"+OK").unwrap().is_none());
    }

    #[test]
    fn test_parse_error() {
        let result = parse_one(b"-ERR unknown command\r\n").unwrap().unwrap();
        assert_eq!(result.0, Value::Error("ERR unknown command".to_string()));
        assert_eq!(result.1, 22);
    }

    #[test]
    fn test_parse_integer() {
        let result = parse_one(b":1000\r\n").unwrap().unwrap();
        assert_eq!(result.0, Value::Int(1000));
        assert_eq!(result.1, 7);
    }

    #[test]
    fn test_parse_negative_integer() {
        let result = parse_one(b":-42\r\n").unwrap().unwrap();
        assert_eq!(result.0, Value::Int(-42));
    }

    #[test]
    fn test_parse_big_number_as_integer() {
        let result = parse_one(b"(3492890328409238509324\r\n");
        // Exceeds i64; surfaces as an integer error rather than silent wrap.
        assert!(matches!(result, Err(ParseError::InvalidInteger(_))));

        let result = parse_one(b"(12345\r\n").unwrap().unwrap();
        assert_eq!(result.0, Value::Int(12345));
    }

    #[test]
    fn test_parse_null() {
        let result = parse_one(b"_\r\n").unwrap().unwrap();
        assert_eq!(result.0, Value::Null);
        assert_eq!(result.1, 3);
    }

    #[test]
    fn test_parse_boolean() {
        assert_eq!(parse_one(b"#t\r\n").unwrap().unwrap().0, Value::Bool(true));
        assert_eq!(parse_one(b"#f\r\n").unwrap().unwrap().0, Value::Bool(false));
        assert!(matches!(
            parse_one(b"#x\r\n"),
            Err(ParseError::MalformedLine(_))
        ));
    }

    #[test]
    fn test_parse_double() {
        assert_eq!(
            parse_one(b",3.25\r\n").unwrap().unwrap().0,
            Value::Float(3.25)
        );
        assert_eq!(
            parse_one(b",inf\r\n").unwrap().unwrap().0,
            Value::Float(f64::INFINITY)
        );
        assert_eq!(
            parse_one(b",-inf\r\n").unwrap().unwrap().0,
            Value::Float(f64::NEG_INFINITY)
        );
        match parse_one(b",nan\r\n").unwrap().unwrap().0 {
            Value::Float(f) => assert!(f.is_nan()),
            other => panic!("expected float, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_bulk_string() {
        let result = parse_one(b"$5\r\nhello\r\n").unwrap().unwrap();
        assert_eq!(result.0, Value::Bulk(Bytes::from("hello")));
        assert_eq!(result.1, 11);
    }

    #[test]
    fn test_parse_null_bulk_string() {
        let result = parse_one(b"$-1\r\n").unwrap().unwrap();
        assert_eq!(result.0, Value::Null);
        assert_eq!(result.1, 5);
    }

    #[test]
    fn test_parse_empty_bulk_string() {
        let result = parse_one(b"$0\r\n\r\n").unwrap().unwrap();
        assert_eq!(result.0, Value::Bulk(Bytes::from("")));
        assert_eq!(result.1, 6);
    }

    #[test]
    fn test_parse_bulk_string_incomplete() {
        assert!(parse_one(b"$5\r\nhel").unwrap().is_none());
    }

    #[test]
    fn test_parse_bulk_error_as_bytes() {
        let result = parse_one(b"!9\r\nSYNTAX err\r\n");
        // Declared length shorter than the payload line is malformed.
        assert!(result.is_err() || result.unwrap().is_none());

        let result = parse_one(b"!10\r\nSYNTAX err\r\n").unwrap().unwrap();
        assert_eq!(result.0, Value::Bulk(Bytes::from("SYNTAX err")));
    }

    #[test]
    fn test_parse_negative_bulk_length() {
        assert!(matches!(
            parse_one(b"$-2\r\n"),
            Err(ParseError::InvalidLength(-2))
        ));
    }

    #[test]
    fn test_parse_array() {
        let result = parse_one(b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(
            result.0,
            Value::Array(vec![
                Value::Bulk(Bytes::from("GET")),
                Value::Bulk(Bytes::from("name")),
            ])
        );
        assert_eq!(result.1, 23);
    }

    #[test]
    fn test_parse_null_array() {
        let result = parse_one(b"*-1\r\n").unwrap().unwrap();
        assert_eq!(result.0, Value::Null);
    }

    #[test]
    fn test_parse_empty_array() {
        let result = parse_one(b"*0\r\n").unwrap().unwrap();
        assert_eq!(result.0, Value::Array(vec![]));
    }

    #[test]
    fn test_parse_nested_array() {
        let result = parse_one(b"*2\r\n:1\r\n*2\r\n:2\r\n:3\r\n").unwrap().unwrap();
        assert_eq!(
            result.0,
            Value::Array(vec![
                Value::Int(1),
                Value::Array(vec![Value::Int(2), Value::Int(3)]),
            ])
        );
    }

    #[test]
    fn test_parse_map() {
        let result = parse_one(b"%2\r\n$1\r\na\r\n:1\r\n$1\r\nb\r\n:2\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(
            result.0,
            Value::Map(vec![
                (Value::Bulk(Bytes::from("a")), Value::Int(1)),
                (Value::Bulk(Bytes::from("b")), Value::Int(2)),
            ])
        );
    }

    #[test]
    fn test_parse_set() {
        let result = parse_one(b"~3\r\n:1\r\n:2\r\n:3\r\n").unwrap().unwrap();
        assert_eq!(
            result.0,
            Value::Set(vec![Value::Int(1), Value::Int(2), Value::Int(3)])
        );
    }

    #[test]
    fn test_parse_invalid_type() {
        assert!(matches!(
            parse_one(b"@invalid\r\n"),
            Err(ParseError::InvalidType(b'@'))
        ));
    }

    #[test]
    fn test_parse_invalid_integer() {
        assert!(matches!(
            parse_one(b":not_a_number\r\n"),
            Err(ParseError::InvalidInteger(_))
        ));
    }

    #[test]
    fn test_parse_all_pipelined() {
        let input = b"+OK\r\n:1\r\n$2\r\nhi\r\n$3\r\npar";
        let (frames, consumed) = Parser::new().parse_all(input).unwrap();
        assert_eq!(
            frames,
            vec![
                Value::Simple("OK".to_string()),
                Value::Int(1),
                Value::Bulk(Bytes::from("hi")),
            ]
        );
        // The partial `$3\r\npar` stays in the buffer.
        assert_eq!(consumed, input.len() - 8);
    }

    #[test]
    fn test_streaming_across_splits() {
        // Feeding a frame in arbitrary splits must produce the same value as
        // feeding it whole.
        let frame = b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$5\r\nhello\r\n";
        let whole = parse_one(frame).unwrap().unwrap().0;

        for split in 1..frame.len() {
            let mut parser = Parser::new();
            // First fragment alone must be incomplete.
            assert!(parser.parse(&frame[..split]).unwrap().is_none());
            // The reassembled buffer parses to the identical value.
            let (value, consumed) = parser.parse(frame).unwrap().unwrap();
            assert_eq!(value, whole);
            assert_eq!(consumed, frame.len());
        }
    }

    #[test]
    fn test_decode_message_strict() {
        assert!(decode_message(b"+OK\r\n").is_ok());
        assert!(matches!(
            decode_message(b"+OK"),
            Err(ParseError::MalformedLine(_))
        ));
        assert!(matches!(
            decode_message(b"$10\r\nabc"),
            Err(ParseError::InsufficientData { .. })
        ));
    }

    #[test]
    fn test_roundtrip() {
        let cases = vec![
            Value::Null,
            Value::Simple("OK".to_string()),
            Value::Error("ERR bad".to_string()),
            Value::Bool(true),
            Value::Int(-7),
            Value::Float(2.5),
            Value::Bulk(Bytes::from_static(b"binary\x00safe")),
            Value::Array(vec![Value::Int(1), Value::Bulk(Bytes::from("x"))]),
            Value::Map(vec![(Value::Bulk(Bytes::from("k")), Value::Int(9))]),
            Value::Set(vec![Value::Int(1), Value::Int(2)]),
        ];

        for original in cases {
            let serialized = original.serialize();
            let (parsed, consumed) = parse_one(&serialized).unwrap().unwrap();
            assert_eq!(parsed, original);
            assert_eq!(consumed, serialized.len());
        }
    }

    #[test]
    fn test_binary_safe_bulk_string() {
        let result = parse_one(b"$5\r\nhel\x00o\r\n").unwrap().unwrap();
        assert_eq!(result.0, Value::Bulk(Bytes::from(&b"hel\x00o"[..])));
    }
}

//! RESP Protocol Implementation
//!
//! This module provides a complete implementation of the Redis Serialization
//! Protocol (RESP), covering the simple, bulk, aggregate, and typed scalar
//! frame forms.
//!
//! ## Modules
//!
//! - `types`: Defines the [`Value`] enum and the RESP encoder
//! - `parser`: Streaming parser for incoming RESP data
//!
//! ## Example
//!
//! ```ignore
//! use beetle::protocol::{Parser, Value};
//! use bytes::Bytes;
//!
//! // Parsing incoming data
//! let data = b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n";
//! let (value, consumed) = Parser::new().parse(data).unwrap().unwrap();
//!
//! // Creating responses
//! let response = Value::bulk(Bytes::from("beetle"));
//! let bytes = response.serialize();
//! ```

pub mod parser;
pub mod types;

// Re-export commonly used types for convenience
pub use parser::{decode_message, ParseError, ParseResult, Parser};
pub use types::Value;

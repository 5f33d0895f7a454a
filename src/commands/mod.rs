//! Command Handler Module
//!
//! This module implements the command processing layer for beetle.
//! It receives parsed RESP commands, executes them against the sharded
//! storage engine, and returns appropriate responses.
//!
//! ## Architecture
//!
//! ```text
//! Client Request
//!       │
//!       ▼
//! ┌─────────────────┐
//! │  RESP Parser    │  (protocol module)
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │ CommandHandler  │  (this module)
//! │                 │
//! │  - Dispatch     │
//! │  - Validate     │
//! │  - Execute      │
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │     Engine      │  (storage module)
//! └─────────────────┘
//! ```
//!
//! ## Supported Commands
//!
//! ### String Commands
//! - `SET`, `GET`, `DEL`, `APPEND`
//! - `GETDEL`, `GETEX`, `GETRANGE`, `STRLEN`
//!
//! ### Key Commands
//! - `TTL`, `EXISTS`, `KEYS`
//!
//! ### Server Commands
//! - `PING`, `ECHO`, `DBSIZE`, `FLUSHDB`
//!
//! Transaction control (`MULTI`/`EXEC`/`DISCARD`) lives in the connection
//! layer, which queues commands and replays them through this handler.

pub mod handler;

// Re-export the main command handler
pub use handler::{command_name_of, CommandHandler};

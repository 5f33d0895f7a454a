//! Connection Handler Module
//!
//! This module manages individual client connections. Each accepted socket
//! is handled by its own async task, so thousands of clients can be served
//! concurrently.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Acceptor pool                            │
//! │                     (server.rs)                             │
//! └──────────────────────┬──────────────────────────────────────┘
//!                        │ accept()
//!                        ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 ConnectionHandler                           │
//! │                                                             │
//! │  ┌─────────────┐   ┌──────────────┐   ┌─────────────────┐   │
//! │  │ Read bytes  │──>│ Parse frames │──>│ Execute / queue │   │
//! │  └─────────────┘   └──────────────┘   └────────┬────────┘   │
//! │                                                │            │
//! │                                                ▼            │
//! │                                    ┌────────────────────┐   │
//! │                                    │ Ordered reply batch│   │
//! │                                    └────────────────────┘   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Pipelining**: a batch of commands in one read executes concurrently,
//!   replies stay in arrival order, one socket write per batch
//! - **Transactions**: `MULTI`/`EXEC`/`DISCARD` with per-connection queues
//! - **Buffer management**: partial frames accumulate in a `BytesMut`
//! - **Statistics**: connection and command counters shared with the server

pub mod handler;

// Re-export commonly used types
pub use handler::{handle_connection, ConnectionError, ConnectionHandler, ConnectionStats};

//! Storage Engine Module
//!
//! This module provides the persistent storage core of beetle: a
//! Bitcask-style log-structured design layered from small parts.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Engine                              │
//! │        hash-partitions keys across N shard workers          │
//! │  ┌──────────┐  ┌──────────┐  ┌──────────┐  ┌──────────┐     │
//! │  │ Store 0  │  │ Store 1  │  │ Store 2  │  │ Store N  │     │
//! │  │ keydir + │  │ keydir + │  │ keydir + │  │ keydir + │     │
//! │  │ datafiles│  │ datafiles│  │ datafiles│  │ datafiles│     │
//! │  └──────────┘  └──────────┘  └──────────┘  └──────────┘     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Layers, bottom up:
//!
//! - [`value`]: deterministic blob codec for stored values
//! - [`entry`]: one CRC-checked log record with TTL and tombstones
//! - [`datafile`]: an append-only file with positioned reads and scans
//! - [`keydir`]: the in-memory index, persistable as a hints file
//! - [`bitcask`]: one shard's store, orchestrating datafiles and keydir
//! - [`engine`]: the shard router, worker threads, and maintenance ticks

pub mod bitcask;
pub mod datafile;
pub mod engine;
pub mod entry;
pub mod keydir;
pub mod value;

// Re-export commonly used types
pub use bitcask::{Lookup, Store, StoreError};
pub use engine::{Engine, EngineError, Maintenance, MaintenanceConfig};
pub use entry::{unix_ms, Entry, EntryError};
pub use keydir::{FormatError, Keydir, Slot};

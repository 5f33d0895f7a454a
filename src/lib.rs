//! # Beetle - A Persistent, Redis-Compatible Key-Value Database
//!
//! Beetle speaks the Redis wire protocol over TCP and stores data in a
//! log-structured (Bitcask-style) engine: append-only datafiles per shard,
//! an in-memory key index, CRC-checked records with TTL support, and
//! background compaction.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                               Beetle                                │
//! │                                                                     │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐              │
//! │  │  Acceptor   │───>│ Connection  │───>│  Command    │              │
//! │  │    pool     │    │  handler    │    │  handler    │              │
//! │  └─────────────┘    └─────────────┘    └──────┬──────┘              │
//! │                          │                    │                     │
//! │                     RESP codec                ▼                     │
//! │                                  ┌─────────────────────────────┐    │
//! │                                  │           Engine            │    │
//! │                                  │  crc32(key) % N shards      │    │
//! │                                  │ ┌─────────┐    ┌─────────┐  │    │
//! │                                  │ │ Store 0 │ .. │ Store N │  │    │
//! │                                  │ │ keydir  │    │ keydir  │  │    │
//! │                                  │ │ logs    │    │ logs    │  │    │
//! │                                  │ └─────────┘    └─────────┘  │    │
//! │                                  └─────────────────────────────┘    │
//! │                                               ▲                     │
//! │                                  ┌────────────┴──────────────┐      │
//! │                                  │  Maintenance ticks        │      │
//! │                                  │  (merge, rotate, flush)   │      │
//! │                                  └───────────────────────────┘      │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## On-Disk Layout
//!
//! Under `<storage_directory>/shard_<n>/`:
//!
//! - `beetle_<file_id>.db` — append-only log files; one is active for
//!   writes, the rest are stale and read-only
//! - `beetle.hints` — keydir snapshot for bounded-time restart
//! - `merge/` — transient directory present only during compaction
//!
//! ## Quick Start
//!
//! ```ignore
//! use beetle::config::Config;
//! use beetle::server::Server;
//! use beetle::storage::{Engine, Maintenance, MaintenanceConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::default();
//!     let engine = Arc::new(Engine::open(
//!         &config.storage_directory,
//!         config.database_shards,
//!     )?);
//!
//!     let _maintenance = Maintenance::start(
//!         Arc::clone(&engine),
//!         MaintenanceConfig {
//!             merge_interval: config.merge_interval,
//!             rotation_interval: config.log_rotation_interval,
//!             rotation_min_bytes: config.log_file_size,
//!         },
//!     );
//!
//!     let server = Server::bind(&config, Arc::clone(&engine))?;
//!     server.run().await;
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`protocol`]: RESP codec — typed values, encoder, streaming parser
//! - [`storage`]: the log-structured engine, layer by layer
//! - [`commands`]: command handlers over the engine
//! - [`connection`]: per-client state, pipelining, transactions
//! - [`server`]: listener and acceptor pool
//! - [`config`]: typed settings and the config-file loader
//!
//! ## Design Highlights
//!
//! ### Single-Writer Shards
//!
//! Each shard's store is owned by exactly one worker thread fed through a
//! request channel, so stores need no locks and every key observes a total
//! write order. Different shards are fully independent; multi-key commands
//! fan out and are not atomic across shards.
//!
//! ### Crash Recovery
//!
//! Every record carries a CRC. On restart the keydir is restored from the
//! hints snapshot when one exists, or rebuilt by scanning the logs; torn
//! bytes at a log's tail are discarded and corrupt records are skipped
//! without hiding their neighbours.
//!
//! ### Lazy Expiry
//!
//! Expired records stay on disk until compaction reaps them; reads treat
//! them as absent the moment their deadline passes.

pub mod commands;
pub mod config;
pub mod connection;
pub mod protocol;
pub mod server;
pub mod storage;

// Re-export commonly used types for convenience
pub use commands::CommandHandler;
pub use config::Config;
pub use connection::{handle_connection, ConnectionStats};
pub use protocol::{ParseError, Parser, Value};
pub use server::Server;
pub use storage::{Engine, Maintenance, MaintenanceConfig, Store};

/// The default port beetle listens on
pub const DEFAULT_PORT: u16 = 6969;

/// Version of beetle
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Sharded Storage Engine
//!
//! The engine hash-partitions the key space across N independent Bitcask
//! stores and gives each store to exactly one worker thread.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Engine                              │
//! │                                                             │
//! │   crc32(key) % N                                            │
//! │        │                                                    │
//! │        ▼                                                    │
//! │  ┌──────────┐   ┌──────────┐   ┌──────────┐                 │
//! │  │ Shard 0  │   │ Shard 1  │   │ Shard N  │                 │
//! │  │ channel  │   │ channel  │   │ channel  │                 │
//! │  └────┬─────┘   └────┬─────┘   └────┬─────┘                 │
//! │       ▼              ▼              ▼                       │
//! │  worker thread  worker thread  worker thread                │
//! │  owns Store 0   owns Store 1   owns Store N                 │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every operation on a shard flows through its request channel, so each
//! store is mutated by at most one thread and needs no locks. Multi-key
//! operations fan out one request per owning shard; they are not atomic
//! across shards. Different shards are fully independent.
//!
//! The routing hash is CRC32. It is stable across restarts and platforms,
//! which keeps a key's shard assignment fixed for the lifetime of the data
//! directory; changing it would strand existing keys in the wrong shard.

use crate::storage::bitcask::{Lookup, Store, StoreError};
use crate::protocol::Value;
use bytes::Bytes;
use std::path::Path;
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

/// Depth of each shard's request channel.
const SHARD_QUEUE_DEPTH: usize = 1024;

/// How often a shard's write buffer is flushed toward the page cache.
const FLUSH_INTERVAL: Duration = Duration::from_secs(2);

/// Errors surfaced by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The shard worker is gone (engine shut down or worker panicked)
    #[error("shard worker unavailable")]
    Closed,
}

/// A request routed to one shard worker.
enum Request {
    Fetch {
        key: Bytes,
        now_ms: u64,
        reply: oneshot::Sender<Result<Option<Lookup>, StoreError>>,
    },
    Put {
        key: Bytes,
        value: Value,
        expiration_ms: u64,
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
    Delete {
        keys: Vec<Bytes>,
        reply: oneshot::Sender<Result<u64, StoreError>>,
    },
    Keys {
        reply: oneshot::Sender<Vec<Bytes>>,
    },
    Count {
        reply: oneshot::Sender<usize>,
    },
    Clear {
        reply: oneshot::Sender<Result<u64, StoreError>>,
    },
    Merge {
        now_ms: u64,
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
    Rotate {
        /// Skip the rotation while the active file is below this size.
        min_active_size: u64,
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
    Sync {
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
    Shutdown,
}

/// The sharded engine handle shared by every connection.
pub struct Engine {
    shards: Vec<mpsc::Sender<Request>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("shards", &self.shards.len())
            .finish()
    }
}

impl Engine {
    /// Opens `shard_count` stores under `dir` and spawns their workers.
    ///
    /// Store opening happens before any worker starts, so an unreadable
    /// shard directory fails engine start instead of surfacing later.
    pub fn open(dir: &Path, shard_count: usize) -> Result<Self, StoreError> {
        assert!(shard_count > 0, "engine needs at least one shard");

        let mut stores = Vec::with_capacity(shard_count);
        for n in 0..shard_count {
            stores.push(Store::open(dir.join(format!("shard_{}", n)))?);
        }

        let mut shards = Vec::with_capacity(shard_count);
        let mut workers = Vec::with_capacity(shard_count);

        for (n, store) in stores.into_iter().enumerate() {
            let (tx, rx) = mpsc::channel(SHARD_QUEUE_DEPTH);
            shards.push(tx);
            workers.push(
                std::thread::Builder::new()
                    .name(format!("beetle-shard-{}", n))
                    .spawn(move || shard_worker(n, store, rx))?,
            );
        }

        info!(shards = shard_count, dir = %dir.display(), "engine started");

        Ok(Self {
            shards,
            workers: Mutex::new(workers),
        })
    }

    /// Number of shards.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// The shard that owns `key`: a stable, portable CRC32 partition.
    pub fn shard_index(&self, key: &[u8]) -> usize {
        crc32fast::hash(key) as usize % self.shards.len()
    }

    /// Looks up `key`, returning the value and its expiration deadline.
    pub async fn fetch(&self, key: Bytes, now_ms: u64) -> Result<Option<Lookup>, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(
            self.shard_index(&key),
            Request::Fetch { key, now_ms, reply },
        )
        .await?;
        Ok(rx.await.map_err(|_| EngineError::Closed)??)
    }

    /// Writes `key`, overwriting any prior mapping.
    pub async fn put(
        &self,
        key: Bytes,
        value: Value,
        expiration_ms: u64,
    ) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(
            self.shard_index(&key),
            Request::Put {
                key,
                value,
                expiration_ms,
                reply,
            },
        )
        .await?;
        Ok(rx.await.map_err(|_| EngineError::Closed)??)
    }

    /// Deletes every present key and returns the total removed.
    ///
    /// Keys are grouped by owning shard and each shard is called once with
    /// its subset; the shards work concurrently but the result is the plain
    /// sum, with no cross-shard atomicity.
    pub async fn delete(&self, keys: Vec<Bytes>) -> Result<u64, EngineError> {
        let mut buckets: Vec<Vec<Bytes>> = vec![Vec::new(); self.shards.len()];
        for key in keys {
            let idx = self.shard_index(&key);
            buckets[idx].push(key);
        }

        let mut pending = Vec::new();
        for (idx, bucket) in buckets.into_iter().enumerate() {
            if bucket.is_empty() {
                continue;
            }
            let (reply, rx) = oneshot::channel();
            self.send(idx, Request::Delete { keys: bucket, reply }).await?;
            pending.push(rx);
        }

        let mut total = 0;
        for rx in pending {
            total += rx.await.map_err(|_| EngineError::Closed)??;
        }
        Ok(total)
    }

    /// All keys across all shards.
    pub async fn keys(&self) -> Result<Vec<Bytes>, EngineError> {
        let mut pending = Vec::new();
        for idx in 0..self.shards.len() {
            let (reply, rx) = oneshot::channel();
            self.send(idx, Request::Keys { reply }).await?;
            pending.push(rx);
        }

        let mut all = Vec::new();
        for rx in pending {
            all.extend(rx.await.map_err(|_| EngineError::Closed)?);
        }
        Ok(all)
    }

    /// Total number of indexed keys across all shards.
    pub async fn len(&self) -> Result<usize, EngineError> {
        let mut pending = Vec::new();
        for idx in 0..self.shards.len() {
            let (reply, rx) = oneshot::channel();
            self.send(idx, Request::Count { reply }).await?;
            pending.push(rx);
        }

        let mut total = 0;
        for rx in pending {
            total += rx.await.map_err(|_| EngineError::Closed)?;
        }
        Ok(total)
    }

    /// Tombstones every key in every shard. Returns the number removed.
    pub async fn clear(&self) -> Result<u64, EngineError> {
        let mut pending = Vec::new();
        for idx in 0..self.shards.len() {
            let (reply, rx) = oneshot::channel();
            self.send(idx, Request::Clear { reply }).await?;
            pending.push(rx);
        }

        let mut total = 0;
        for rx in pending {
            total += rx.await.map_err(|_| EngineError::Closed)??;
        }
        Ok(total)
    }

    /// Compacts one shard.
    pub async fn merge_shard(&self, idx: usize, now_ms: u64) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(idx, Request::Merge { now_ms, reply }).await?;
        Ok(rx.await.map_err(|_| EngineError::Closed)??)
    }

    /// Rotates one shard's active datafile, unless it is still below
    /// `min_active_size` bytes.
    pub async fn rotate_shard(
        &self,
        idx: usize,
        min_active_size: u64,
    ) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(
            idx,
            Request::Rotate {
                min_active_size,
                reply,
            },
        )
        .await?;
        Ok(rx.await.map_err(|_| EngineError::Closed)??)
    }

    /// Flushes one shard's active datafile.
    pub async fn sync_shard(&self, idx: usize) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(idx, Request::Sync { reply }).await?;
        Ok(rx.await.map_err(|_| EngineError::Closed)??)
    }

    /// Stops every worker after persisting hints and closing file handles.
    ///
    /// Safe to call once at process shutdown; later requests fail with
    /// [`EngineError::Closed`].
    pub async fn shutdown(&self) {
        for shard in &self.shards {
            let _ = shard.send(Request::Shutdown).await;
        }

        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock().expect("workers mutex");
            workers.drain(..).collect()
        };
        for handle in handles {
            let _ = tokio::task::spawn_blocking(move || {
                let _ = handle.join();
            })
            .await;
        }

        info!("engine shut down");
    }

    async fn send(&self, idx: usize, request: Request) -> Result<(), EngineError> {
        self.shards[idx]
            .send(request)
            .await
            .map_err(|_| EngineError::Closed)
    }
}

/// One shard's worker loop: owns the store, drains the channel, closes the
/// store when the engine shuts down.
fn shard_worker(n: usize, mut store: Store, mut rx: mpsc::Receiver<Request>) {
    debug!(shard = n, "shard worker running");

    while let Some(request) = rx.blocking_recv() {
        match request {
            Request::Fetch { key, now_ms, reply } => {
                let _ = reply.send(store.get(&key, now_ms));
            }
            Request::Put {
                key,
                value,
                expiration_ms,
                reply,
            } => {
                let _ = reply.send(store.put(key, &value, expiration_ms));
            }
            Request::Delete { keys, reply } => {
                let _ = reply.send(store.delete(&keys));
            }
            Request::Keys { reply } => {
                let _ = reply.send(store.keys());
            }
            Request::Count { reply } => {
                let _ = reply.send(store.len());
            }
            Request::Clear { reply } => {
                let keys = store.keys();
                let _ = reply.send(store.delete(&keys));
            }
            Request::Merge { now_ms, reply } => {
                let _ = reply.send(store.merge(now_ms));
            }
            Request::Rotate {
                min_active_size,
                reply,
            } => {
                let result = if store.active_size() < min_active_size {
                    Ok(())
                } else {
                    store.rotate()
                };
                let _ = reply.send(result);
            }
            Request::Sync { reply } => {
                let _ = reply.send(store.sync());
            }
            Request::Shutdown => break,
        }
    }

    if let Err(err) = store.close() {
        error!(shard = n, error = %err, "error closing shard store");
    } else {
        debug!(shard = n, "shard worker stopped");
    }
}

// ============================================================================
// Background maintenance
// ============================================================================

/// Intervals for the per-shard background ticks.
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// Compaction period
    pub merge_interval: Duration,
    /// Rotation period
    pub rotation_interval: Duration,
    /// Active file size below which a rotation tick is skipped
    pub rotation_min_bytes: u64,
}

/// A handle to the running maintenance tasks.
///
/// Dropping the handle stops merge, rotation, and flush ticks for every
/// shard; in-flight requests drain through the shard channels first.
#[derive(Debug)]
pub struct Maintenance {
    shutdown_tx: watch::Sender<bool>,
}

impl Maintenance {
    /// Starts merge/rotation/flush ticks for every shard of `engine`.
    pub fn start(engine: std::sync::Arc<Engine>, config: MaintenanceConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        for idx in 0..engine.shard_count() {
            let engine = engine.clone();
            let config = config.clone();
            let shutdown_rx = shutdown_rx.clone();
            tokio::spawn(maintenance_loop(engine, idx, config, shutdown_rx));
        }

        info!("background maintenance started");
        Self { shutdown_tx }
    }

    /// Stops the ticks. Called automatically when the handle is dropped.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for Maintenance {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn maintenance_loop(
    engine: std::sync::Arc<Engine>,
    idx: usize,
    config: MaintenanceConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let start = tokio::time::Instant::now();
    let mut merge_tick = tokio::time::interval_at(start + config.merge_interval, config.merge_interval);
    let mut rotate_tick =
        tokio::time::interval_at(start + config.rotation_interval, config.rotation_interval);
    let mut flush_tick = tokio::time::interval_at(start + FLUSH_INTERVAL, FLUSH_INTERVAL);

    loop {
        tokio::select! {
            _ = merge_tick.tick() => {
                let now_ms = crate::storage::entry::unix_ms();
                if let Err(err) = engine.merge_shard(idx, now_ms).await {
                    warn!(shard = idx, error = %err, "scheduled merge failed, will retry next tick");
                }
            }
            _ = rotate_tick.tick() => {
                if let Err(err) = engine.rotate_shard(idx, config.rotation_min_bytes).await {
                    warn!(shard = idx, error = %err, "scheduled rotation failed");
                }
            }
            _ = flush_tick.tick() => {
                if let Err(err) = engine.sync_shard(idx).await {
                    warn!(shard = idx, error = %err, "scheduled flush failed");
                }
            }
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    debug!(shard = idx, "maintenance loop stopping");
                    return;
                }
            }
        }
    }
}

//! Bitcask Store
//!
//! The central authority for one shard's data: a set of append-only
//! datafiles plus the keydir that indexes them.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                        Store                              │
//! │                                                           │
//! │   keydir: key ──> (file_id, position, size)               │
//! │                                                           │
//! │   beetle_0.db   beetle_1.db   beetle_2.db  ◄── active     │
//! │   (stale)       (stale)       (append)                    │
//! │                                                           │
//! │   beetle.hints  ◄── keydir snapshot, written at close     │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! Exactly one datafile is open for appends. Writes go to its tail and
//! update the keydir; deletes append a tombstone and drop the key from the
//! keydir. Overwritten, deleted, and expired records accumulate as garbage
//! until `merge` rewrites the live set into a fresh `beetle_0.db`.
//!
//! A store is owned by a single shard worker, which serializes every
//! operation; nothing here locks.

use crate::protocol::Value;
use crate::storage::datafile::Datafile;
use crate::storage::entry;
use crate::storage::keydir::{Keydir, Slot, HINTS_FILE};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Name of the transient directory used while compacting.
const MERGE_DIR: &str = "merge";

/// Errors surfaced by store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The keydir referenced a datafile that is not open. Indicates an index
    /// bug or on-disk tampering; surfaced rather than masked.
    #[error("keydir references unknown datafile {0}")]
    MissingFile(u64),
}

/// A value read back from the store, along with its expiration deadline.
#[derive(Debug, Clone, PartialEq)]
pub struct Lookup {
    pub value: Value,
    /// Millisecond deadline; 0 means the record never expires.
    pub expiration_ms: u64,
}

/// One shard's log-structured store.
#[derive(Debug)]
pub struct Store {
    path: PathBuf,
    active_id: u64,
    files: BTreeMap<u64, Datafile>,
    keydir: Keydir,
}

impl Store {
    /// Opens the store rooted at `path`, creating the directory if needed.
    ///
    /// Existing datafiles are opened read-ready; the keydir is loaded from
    /// the hints snapshot when one exists and rebuilt by scanning otherwise.
    /// A consumed snapshot is deleted immediately, so a crash before the
    /// next clean close falls back to the scan rebuild instead of trusting
    /// a stale index. A fresh active file is created at `max(existing) + 1`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        fs::create_dir_all(&path)?;

        // A leftover merge directory means a compaction died mid-flight; the
        // main directory is still authoritative.
        let merge_dir = path.join(MERGE_DIR);
        if merge_dir.exists() {
            warn!(path = %merge_dir.display(), "removing leftover merge directory");
            fs::remove_dir_all(&merge_dir)?;
        }

        let mut files = BTreeMap::new();
        for dirent in fs::read_dir(&path)? {
            let dirent = dirent?;
            if let Some(name) = dirent.file_name().to_str() {
                if let Some(file_id) = Datafile::parse_file_id(name) {
                    files.insert(file_id, Datafile::open(&path, file_id)?);
                }
            }
        }

        let hints_path = path.join(HINTS_FILE);
        let keydir = if hints_path.exists() {
            match Keydir::load(&hints_path) {
                Ok(keydir) => {
                    fs::remove_file(&hints_path)?;
                    debug!(keys = keydir.len(), "keydir restored from hints");
                    keydir
                }
                Err(err) => {
                    warn!(error = %err, "hints unreadable, rebuilding keydir by scan");
                    fs::remove_file(&hints_path)?;
                    Keydir::build(&files)?
                }
            }
        } else {
            Keydir::build(&files)?
        };

        let active_id = files.keys().max().map(|id| id + 1).unwrap_or(0);
        files.insert(active_id, Datafile::open(&path, active_id)?);

        info!(
            path = %path.display(),
            datafiles = files.len(),
            keys = keydir.len(),
            active = active_id,
            "store opened"
        );

        Ok(Self {
            path,
            active_id,
            files,
            keydir,
        })
    }

    /// Looks up `key`, treating expired records, tombstones, and corrupt
    /// records as absent. Corruption is logged; it never poisons other keys.
    pub fn get(&mut self, key: &[u8], now_ms: u64) -> Result<Option<Lookup>, StoreError> {
        let slot = match self.keydir.get(key) {
            Some(slot) => slot,
            None => return Ok(None),
        };

        let file = self
            .files
            .get_mut(&slot.file_id)
            .ok_or(StoreError::MissingFile(slot.file_id))?;

        match file.read_at(slot.position, slot.size)? {
            Ok(entry) => {
                if entry.is_tombstone() || entry.is_expired(now_ms) {
                    Ok(None)
                } else {
                    Ok(Some(Lookup {
                        value: entry.value,
                        expiration_ms: entry.expiration_ms,
                    }))
                }
            }
            Err(err) => {
                warn!(
                    file_id = slot.file_id,
                    position = slot.position,
                    error = %err,
                    "corrupt record read as absent"
                );
                Ok(None)
            }
        }
    }

    /// Appends a record for `key` and points the keydir at it.
    ///
    /// On an append error the keydir is left untouched, so the previous
    /// value of the key remains visible.
    pub fn put(&mut self, key: Bytes, value: &Value, expiration_ms: u64) -> Result<(), StoreError> {
        let record = entry::encode(&key, value, expiration_ms);
        let active_id = self.active_id;
        let position = self.active_mut().write(&record)?;

        self.keydir.put(
            key,
            Slot {
                file_id: active_id,
                position,
                size: record.len() as u32,
            },
        );
        Ok(())
    }

    /// Tombstones every key that is currently present and returns how many
    /// were removed. Keys without a keydir slot are skipped silently.
    pub fn delete(&mut self, keys: &[Bytes]) -> Result<u64, StoreError> {
        let mut deleted = 0;
        for key in keys {
            if self.keydir.get(key).is_none() {
                continue;
            }
            let record = entry::encode_tombstone(key);
            self.active_mut().write(&record)?;
            self.keydir.remove(key);
            deleted += 1;
        }
        Ok(deleted)
    }

    /// Rewrites all live records into a single fresh datafile.
    ///
    /// No-op when only the active file exists. The new file is built inside
    /// a transient `merge/` directory and only swapped in once complete;
    /// a failure while building leaves the original store untouched and
    /// removes the temporary directory. After a successful merge exactly one
    /// datafile remains, with file id 0, and the hints snapshot matches it.
    pub fn merge(&mut self, now_ms: u64) -> Result<(), StoreError> {
        if self.files.len() <= 1 {
            return Ok(());
        }

        let merge_dir = self.path.join(MERGE_DIR);
        let result = self.merge_inner(&merge_dir, now_ms);
        if result.is_err() {
            let _ = fs::remove_dir_all(&merge_dir);
        }
        result
    }

    fn merge_inner(&mut self, merge_dir: &Path, now_ms: u64) -> Result<(), StoreError> {
        // Make buffered tail bytes of the active file visible to scans.
        self.active_mut().sync()?;

        fs::create_dir_all(merge_dir)?;
        let mut merged = Datafile::open(merge_dir, 0)?;
        let mut fresh = Keydir::new();
        let mut live = 0u64;
        let mut reclaimed = 0u64;

        for (file_id, file) in &self.files {
            for item in file.scan()? {
                let (entry, position, _) = match item {
                    Ok(record) => record,
                    Err(err) => {
                        warn!(file_id = file_id, error = %err, "skipping corrupt record in merge");
                        continue;
                    }
                };

                if entry.is_tombstone() || entry.is_expired(now_ms) {
                    reclaimed += 1;
                    continue;
                }

                // Live means: this is the exact record the keydir points at.
                // Superseded versions of a key are garbage.
                match self.keydir.get(&entry.key) {
                    Some(slot) if slot.file_id == *file_id && slot.position == position => {}
                    _ => {
                        reclaimed += 1;
                        continue;
                    }
                }

                let record = entry::encode(&entry.key, &entry.value, entry.expiration_ms);
                let new_position = merged.write(&record)?;
                fresh.put(
                    entry.key,
                    Slot {
                        file_id: 0,
                        position: new_position,
                        size: record.len() as u32,
                    },
                );
                live += 1;
            }
        }

        merged.close()?;

        // Commit: retire the old generation and promote the merged file.
        let old_paths: Vec<PathBuf> = self
            .files
            .values()
            .map(|f| f.path().to_path_buf())
            .collect();
        self.files.clear();
        for old in old_paths {
            fs::remove_file(old)?;
        }
        fs::rename(
            merge_dir.join(Datafile::file_name(0)),
            self.path.join(Datafile::file_name(0)),
        )?;
        fs::remove_dir_all(merge_dir)?;

        fresh.persist(&self.path.join(HINTS_FILE))?;

        self.files.insert(0, Datafile::open(&self.path, 0)?);
        self.active_id = 0;
        self.keydir = fresh;

        info!(live, reclaimed, "merge complete");
        Ok(())
    }

    /// Opens a new active datafile; the previous active file becomes stale.
    pub fn rotate(&mut self) -> Result<(), StoreError> {
        self.active_mut().sync()?;

        let new_id = self.active_id + 1;
        let file = Datafile::open(&self.path, new_id)?;
        self.files.insert(new_id, file);
        self.active_id = new_id;

        debug!(active = new_id, "rotated to new active datafile");
        Ok(())
    }

    /// Flushes the active datafile to disk.
    pub fn sync(&mut self) -> Result<(), StoreError> {
        self.active_mut().sync()?;
        Ok(())
    }

    /// Persists the hints snapshot, syncs, and closes every handle.
    pub fn close(mut self) -> Result<(), StoreError> {
        self.keydir.persist(&self.path.join(HINTS_FILE))?;
        self.active_mut().sync()?;
        info!(path = %self.path.display(), keys = self.keydir.len(), "store closed");
        Ok(())
    }

    /// Keys currently present in the keydir. May include keys whose records
    /// have expired but not yet been reaped; reads reconcile lazily.
    pub fn keys(&self) -> Vec<Bytes> {
        self.keydir.keys()
    }

    /// Number of indexed keys.
    pub fn len(&self) -> usize {
        self.keydir.len()
    }

    /// Returns true if no keys are indexed.
    pub fn is_empty(&self) -> bool {
        self.keydir.is_empty()
    }

    /// Size in bytes of the active datafile.
    pub fn active_size(&self) -> u64 {
        self.files
            .get(&self.active_id)
            .map(|f| f.offset())
            .unwrap_or(0)
    }

    /// Number of open datafiles, the active one included.
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// The shard directory this store lives under.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn active_mut(&mut self) -> &mut Datafile {
        self.files
            .get_mut(&self.active_id)
            .expect("active datafile is always open")
    }
}

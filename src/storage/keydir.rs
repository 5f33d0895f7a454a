//! Keydir — In-Memory Key Index
//!
//! The keydir maps every live key to the location of its newest record:
//! `(file_id, position, size)`. It is the authoritative read index: a key is
//! present exactly when it has a keydir slot and the referenced record is
//! neither expired nor a tombstone.
//!
//! The keydir can be rebuilt from the datafiles (the slow path at startup)
//! or loaded from a hints file snapshot persisted at clean shutdown and
//! after merge (the fast path). The hints format is a small versioned
//! BigEndian record stream behind a magic number.

use crate::storage::datafile::Datafile;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use thiserror::Error;
use tracing::warn;

/// File name of the keydir snapshot inside a shard directory.
pub const HINTS_FILE: &str = "beetle.hints";

/// Magic number at the head of a hints file, ASCII "BHNT".
const HINTS_MAGIC: u32 = 0x42484E54;

/// Hints format version.
const HINTS_VERSION: u16 = 1;

/// Location of one record: file, byte position, and total record size
/// (header included).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub file_id: u64,
    pub position: u64,
    pub size: u32,
}

/// Errors raised while loading a hints file.
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("io error reading hints: {0}")]
    Io(#[from] io::Error),

    #[error("bad hints magic: {0:#010x}")]
    BadMagic(u32),

    #[error("unsupported hints version: {0}")]
    UnsupportedVersion(u16),

    #[error("truncated hints file")]
    Truncated,

    #[error("invalid slot for key of {key_len} bytes: size must be positive")]
    InvalidSlot { key_len: usize },
}

/// The in-memory index from key to newest-record location.
#[derive(Debug, Default)]
pub struct Keydir {
    map: HashMap<Bytes, Slot>,
}

impl Keydir {
    /// Creates an empty keydir.
    pub fn new() -> Self {
        Self::default()
    }

    /// Points `key` at a new record location, replacing any prior slot.
    pub fn put(&mut self, key: Bytes, slot: Slot) {
        self.map.insert(key, slot);
    }

    /// Looks up the slot for `key`.
    pub fn get(&self, key: &[u8]) -> Option<Slot> {
        self.map.get(key).copied()
    }

    /// Removes `key` from the index.
    pub fn remove(&mut self, key: &[u8]) -> Option<Slot> {
        self.map.remove(key)
    }

    /// Number of indexed keys.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns true if no keys are indexed.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// All indexed keys. May reference records that have expired but not yet
    /// been reaped; readers reconcile lazily.
    pub fn keys(&self) -> Vec<Bytes> {
        self.map.keys().cloned().collect()
    }

    /// Iterates over `(key, slot)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&Bytes, &Slot)> {
        self.map.iter()
    }

    /// Rebuilds a keydir by scanning datafiles.
    ///
    /// Files are visited in ascending file id and records in ascending
    /// offset, which reproduces the last-writer-wins order of the log:
    /// file ids grow monotonically with rotation, so a later slot always
    /// supersedes an earlier one. Tombstones remove the key; expired records
    /// are inserted tentatively and filtered at read time. Corrupt records
    /// are skipped with a warning, matching the read path's treatment.
    pub fn build(files: &BTreeMap<u64, Datafile>) -> io::Result<Self> {
        let mut keydir = Self::new();

        for (file_id, file) in files {
            for item in file.scan()? {
                match item {
                    Ok((entry, position, size)) => {
                        if entry.is_tombstone() {
                            keydir.remove(&entry.key);
                        } else {
                            keydir.put(
                                entry.key,
                                Slot {
                                    file_id: *file_id,
                                    position,
                                    size,
                                },
                            );
                        }
                    }
                    Err(err) => {
                        warn!(
                            file_id = file_id,
                            error = %err,
                            "skipping corrupt record during keydir rebuild"
                        );
                    }
                }
            }
        }

        Ok(keydir)
    }

    /// Persists the keydir as a hints file at `path`.
    ///
    /// The snapshot is written through a buffered writer and synced; it only
    /// exists to make the next restart bounded-time.
    pub fn persist(&self, path: &Path) -> io::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        let mut writer = BufWriter::new(file);

        writer.write_u32::<BigEndian>(HINTS_MAGIC)?;
        writer.write_u16::<BigEndian>(HINTS_VERSION)?;
        writer.write_u64::<BigEndian>(self.map.len() as u64)?;

        for (key, slot) in &self.map {
            writer.write_u32::<BigEndian>(key.len() as u32)?;
            writer.write_all(key)?;
            writer.write_u64::<BigEndian>(slot.file_id)?;
            writer.write_u64::<BigEndian>(slot.position)?;
            writer.write_u32::<BigEndian>(slot.size)?;
        }

        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Loads a keydir from a hints file.
    ///
    /// Every slot is validated: a zero record size (or any truncation) means
    /// the snapshot cannot be trusted and the caller falls back to a scan
    /// rebuild.
    pub fn load(path: &Path) -> Result<Self, FormatError> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);

        let magic = reader.read_u32::<BigEndian>().map_err(read_err)?;
        if magic != HINTS_MAGIC {
            return Err(FormatError::BadMagic(magic));
        }

        let version = reader.read_u16::<BigEndian>().map_err(read_err)?;
        if version != HINTS_VERSION {
            return Err(FormatError::UnsupportedVersion(version));
        }

        let count = reader.read_u64::<BigEndian>().map_err(read_err)?;
        let mut map = HashMap::with_capacity(count as usize);

        for _ in 0..count {
            let key_len = reader.read_u32::<BigEndian>().map_err(read_err)? as usize;
            let mut key = vec![0u8; key_len];
            reader.read_exact(&mut key).map_err(read_err)?;

            let file_id = reader.read_u64::<BigEndian>().map_err(read_err)?;
            let position = reader.read_u64::<BigEndian>().map_err(read_err)?;
            let size = reader.read_u32::<BigEndian>().map_err(read_err)?;

            if size == 0 {
                return Err(FormatError::InvalidSlot { key_len });
            }

            map.insert(
                Bytes::from(key),
                Slot {
                    file_id,
                    position,
                    size,
                },
            );
        }

        Ok(Self { map })
    }
}

fn read_err(err: io::Error) -> FormatError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        FormatError::Truncated
    } else {
        FormatError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Value;
    use crate::storage::entry;
    use tempfile::tempdir;

    fn slot(file_id: u64, position: u64, size: u32) -> Slot {
        Slot {
            file_id,
            position,
            size,
        }
    }

    #[test]
    fn test_put_get_remove() {
        let mut keydir = Keydir::new();
        let key = Bytes::from("key");

        assert!(keydir.get(&key).is_none());

        keydir.put(key.clone(), slot(0, 0, 30));
        assert_eq!(keydir.get(&key), Some(slot(0, 0, 30)));

        // A newer location replaces the old one.
        keydir.put(key.clone(), slot(1, 128, 42));
        assert_eq!(keydir.get(&key), Some(slot(1, 128, 42)));

        keydir.remove(&key);
        assert!(keydir.get(&key).is_none());
        assert!(keydir.is_empty());
    }

    #[test]
    fn test_build_last_writer_wins() {
        let dir = tempdir().unwrap();
        let mut files = BTreeMap::new();

        // File 0: k written twice, then overwritten again in file 1.
        let mut f0 = Datafile::open(dir.path(), 0).unwrap();
        f0.write(&entry::encode(b"k", &Value::Int(1), 0)).unwrap();
        let second = entry::encode(b"k", &Value::Int(2), 0);
        let pos = f0.write(&second).unwrap();
        f0.write(&entry::encode(b"other", &Value::Int(9), 0)).unwrap();
        f0.sync().unwrap();

        let mut f1 = Datafile::open(dir.path(), 1).unwrap();
        let third = entry::encode(b"k", &Value::Int(3), 0);
        let pos1 = f1.write(&third).unwrap();
        f1.sync().unwrap();

        files.insert(0, f0);
        files.insert(1, f1);

        let keydir = Keydir::build(&files).unwrap();
        assert_eq!(keydir.len(), 2);
        assert_eq!(
            keydir.get(b"k"),
            Some(slot(1, pos1, third.len() as u32)),
            "the newest file's record must win"
        );
        assert_ne!(keydir.get(b"k"), Some(slot(0, pos, second.len() as u32)));
    }

    #[test]
    fn test_build_tombstone_removes() {
        let dir = tempdir().unwrap();
        let mut files = BTreeMap::new();

        let mut f0 = Datafile::open(dir.path(), 0).unwrap();
        f0.write(&entry::encode(b"kept", &Value::Int(1), 0)).unwrap();
        f0.write(&entry::encode(b"gone", &Value::Int(2), 0)).unwrap();
        f0.write(&entry::encode_tombstone(b"gone")).unwrap();
        f0.sync().unwrap();
        files.insert(0, f0);

        let keydir = Keydir::build(&files).unwrap();
        assert_eq!(keydir.len(), 1);
        assert!(keydir.get(b"kept").is_some());
        assert!(keydir.get(b"gone").is_none());
    }

    #[test]
    fn test_hints_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(HINTS_FILE);

        let mut keydir = Keydir::new();
        keydir.put(Bytes::from("alpha"), slot(0, 0, 27));
        keydir.put(Bytes::from("beta"), slot(2, 512, 31));
        keydir.put(Bytes::from_static(b"bin\x00key"), slot(1, 64, 29));

        keydir.persist(&path).unwrap();
        let loaded = Keydir::load(&path).unwrap();

        assert_eq!(loaded.len(), keydir.len());
        for (key, slot) in keydir.iter() {
            assert_eq!(loaded.get(key), Some(*slot));
        }
    }

    #[test]
    fn test_load_rejects_bad_magic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(HINTS_FILE);
        std::fs::write(&path, b"not a hints file at all").unwrap();

        assert!(matches!(
            Keydir::load(&path),
            Err(FormatError::BadMagic(_))
        ));
    }

    #[test]
    fn test_load_rejects_truncation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(HINTS_FILE);

        let mut keydir = Keydir::new();
        keydir.put(Bytes::from("key"), slot(0, 0, 30));
        keydir.persist(&path).unwrap();

        let full = std::fs::read(&path).unwrap();
        std::fs::write(&path, &full[..full.len() - 5]).unwrap();

        assert!(matches!(
            Keydir::load(&path),
            Err(FormatError::Truncated)
        ));
    }

    #[test]
    fn test_load_rejects_zero_size_slot() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(HINTS_FILE);

        let mut keydir = Keydir::new();
        keydir.put(Bytes::from("key"), slot(0, 0, 30));
        keydir.persist(&path).unwrap();

        // The size field is the last four bytes of the single record.
        let mut raw = std::fs::read(&path).unwrap();
        let len = raw.len();
        raw[len - 4..].copy_from_slice(&0u32.to_be_bytes());
        std::fs::write(&path, &raw).unwrap();

        assert!(matches!(
            Keydir::load(&path),
            Err(FormatError::InvalidSlot { .. })
        ));
    }
}

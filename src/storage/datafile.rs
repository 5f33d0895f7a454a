//! Append-Only Datafiles
//!
//! A datafile is one `beetle_<file_id>.db` log file on disk, wrapped in a
//! pair of handles: a buffered append writer and an independent positioned
//! reader. A store keeps exactly one datafile open for appends (the active
//! file); older files are stale and only ever read.
//!
//! Positioned reads may run against a file that is still being appended to:
//! the keydir only ever references bytes that a completed `write` has pushed
//! through the writer, so a reader never observes a half-written record via
//! the index.

use crate::storage::entry::{self, Entry, EntryError, HEADER_SIZE};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Write buffer capacity for the append handle.
const WRITE_BUFFER_SIZE: usize = 128 * 1024;

/// Read-ahead buffer capacity for the read handle.
const READ_BUFFER_SIZE: usize = 128 * 1024;

/// Upper bound on a single record; larger declared sizes are treated as
/// garbage during scans.
const MAX_RECORD_SIZE: usize = 512 * 1024 * 1024;

/// One append-only log file with its writer/reader handle pair.
#[derive(Debug)]
pub struct Datafile {
    file_id: u64,
    path: PathBuf,
    writer: BufWriter<File>,
    reader: BufReader<File>,
    offset: u64,
    /// Offset up to which bytes are known to have left the write buffer.
    flushed: u64,
}

impl Datafile {
    /// Returns the on-disk file name for a file id.
    pub fn file_name(file_id: u64) -> String {
        format!("beetle_{}.db", file_id)
    }

    /// Parses a file id out of a `beetle_<id>.db` file name.
    pub fn parse_file_id(name: &str) -> Option<u64> {
        name.strip_prefix("beetle_")?
            .strip_suffix(".db")?
            .parse()
            .ok()
    }

    /// Opens (or creates) the datafile for `file_id` inside `dir`.
    ///
    /// The append offset is initialized from the current file size, so
    /// reopening an existing file continues where the last writer stopped.
    pub fn open(dir: &Path, file_id: u64) -> io::Result<Self> {
        let path = dir.join(Self::file_name(file_id));

        let write_handle = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        let offset = write_handle.metadata()?.len();

        let read_handle = OpenOptions::new().read(true).open(&path)?;

        Ok(Self {
            file_id,
            path,
            writer: BufWriter::with_capacity(WRITE_BUFFER_SIZE, write_handle),
            reader: BufReader::with_capacity(READ_BUFFER_SIZE, read_handle),
            offset,
            flushed: offset,
        })
    }

    /// The file id, unique within a shard directory.
    pub fn file_id(&self) -> u64 {
        self.file_id
    }

    /// The file's path on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current append offset, equal to the file size in bytes.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Appends an encoded record and returns the position it was written at.
    ///
    /// The caller records `(position, record.len())` in the keydir; together
    /// with the file id that is everything a later read needs.
    pub fn write(&mut self, record: &[u8]) -> io::Result<u64> {
        let position = self.offset;
        self.writer.write_all(record)?;
        self.offset += record.len() as u64;
        Ok(position)
    }

    /// Reads and decodes exactly one record at `(position, size)`.
    ///
    /// Returns the entry regardless of expiration or tombstone status;
    /// filtering belongs to the caller. Bytes are flushed first so a read
    /// through the index never races the write buffer.
    pub fn read_at(&mut self, position: u64, size: u32) -> io::Result<Result<Entry, EntryError>> {
        if position + size as u64 > self.flushed {
            self.writer.flush()?;
            self.flushed = self.offset;
        }

        self.reader.seek(SeekFrom::Start(position))?;
        let mut buf = vec![0u8; size as usize];
        self.reader.read_exact(&mut buf)?;
        Ok(entry::decode(&buf))
    }

    /// Streams every record in the file from offset zero.
    ///
    /// The scan opens its own read handle, so it can run against a file whose
    /// writer and reader handles are busy elsewhere (merge scans stale files
    /// this way). Buffered-but-unflushed bytes are not visible to a scan;
    /// callers that need them flush first.
    pub fn scan(&self) -> io::Result<ScanIter> {
        ScanIter::open(&self.path)
    }

    /// Flushes buffered writes and syncs file contents to disk.
    pub fn sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.flushed = self.offset;
        self.writer.get_ref().sync_all()
    }

    /// Syncs and drops the handles.
    pub fn close(mut self) -> io::Result<()> {
        self.sync()
    }
}

/// Iterator over `(entry, position, size)` triples of one datafile.
///
/// Torn bytes at the end of the file (a crash mid-append) terminate the scan
/// cleanly. A record that is fully present but fails its CRC is yielded as
/// an error and the scan continues at the next record boundary, so one bad
/// record does not hide the rest of the file.
pub struct ScanIter {
    reader: BufReader<File>,
    file_size: u64,
    position: u64,
    done: bool,
}

impl ScanIter {
    fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        let file_size = file.metadata()?.len();
        Ok(Self {
            reader: BufReader::with_capacity(READ_BUFFER_SIZE, file),
            file_size,
            position: 0,
            done: false,
        })
    }

    fn read_record(&mut self) -> Option<Result<(Entry, u64, u32), EntryError>> {
        if self.done || self.position + HEADER_SIZE as u64 > self.file_size {
            // Trailing fragment smaller than a header: end of log.
            return None;
        }

        let mut header = [0u8; HEADER_SIZE];
        if self.reader.read_exact(&mut header).is_err() {
            return None;
        }

        let (key_size, value_size) = match entry::decode_sizes(&header) {
            Ok(sizes) => sizes,
            Err(_) => {
                self.done = true;
                return None;
            }
        };

        let total = HEADER_SIZE + key_size + value_size;
        if total > MAX_RECORD_SIZE || self.position + total as u64 > self.file_size {
            // Sizes point past EOF: a torn tail, not a record.
            self.done = true;
            return None;
        }

        let mut record = vec![0u8; total];
        record[..HEADER_SIZE].copy_from_slice(&header);
        if self.reader.read_exact(&mut record[HEADER_SIZE..]).is_err() {
            self.done = true;
            return None;
        }

        let position = self.position;
        self.position += total as u64;

        match entry::decode(&record) {
            Ok(entry) => Some(Ok((entry, position, total as u32))),
            Err(err) => Some(Err(err)),
        }
    }
}

impl Iterator for ScanIter {
    type Item = Result<(Entry, u64, u32), EntryError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_record()
    }
}

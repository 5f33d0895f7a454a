//! Server Configuration
//!
//! A typed settings record plus the loader for beetle's config file format:
//! one whitespace-separated `key value` pair per line, `#` comments, blank
//! lines ignored, unknown keys ignored. Durations accept `s`, `m`, and `h`
//! suffixes (plain numbers are milliseconds); sizes accept `KB`, `MB`, and
//! `GB` (plain numbers are bytes).
//!
//! ```text
//! # beetle.conf
//! port 6969
//! storage_directory /var/lib/beetle
//! database_shards 8
//! log_file_size 5MB
//! log_rotation_interval 30m
//! merge_interval 30m
//! ```
//!
//! The record is installed once at startup and read-only afterwards.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Errors raised while loading a config file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] io::Error),

    #[error("invalid value for '{key}': {value}")]
    InvalidValue { key: String, value: String },

    #[error("line {line}: expected 'key value'")]
    MalformedLine { line: usize },
}

/// Typed server settings.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP listen port
    pub port: u16,

    /// Root directory for datafiles; shards live in subdirectories
    pub storage_directory: PathBuf,

    /// Number of independent stores the key space is partitioned across
    pub database_shards: usize,

    /// Soft size threshold for rotating the active datafile (bytes)
    pub log_file_size: u64,

    /// Period of the per-shard rotation tick
    pub log_rotation_interval: Duration,

    /// Period of the per-shard compaction tick
    pub merge_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 6969,
            storage_directory: default_storage_directory(),
            database_shards: num_cpus::get(),
            log_file_size: 5 * 1024 * 1024,
            log_rotation_interval: Duration::from_secs(30 * 60),
            merge_interval: Duration::from_secs(30 * 60),
        }
    }
}

fn default_storage_directory() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("beetle")
}

impl Config {
    /// Loads settings from a config file, with defaults for absent keys.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parses the `key value` config format.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        for (idx, raw_line) in contents.lines().enumerate() {
            let line = raw_line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }

            let mut parts = line.split_whitespace();
            let (key, value) = match (parts.next(), parts.next()) {
                (Some(k), Some(v)) => (k, v),
                _ => return Err(ConfigError::MalformedLine { line: idx + 1 }),
            };

            match key {
                "port" => {
                    config.port = value.parse().map_err(|_| invalid(key, value))?;
                }
                "storage_directory" => {
                    config.storage_directory = PathBuf::from(value);
                }
                "database_shards" => {
                    let shards: usize = value.parse().map_err(|_| invalid(key, value))?;
                    if shards == 0 {
                        return Err(invalid(key, value));
                    }
                    config.database_shards = shards;
                }
                "log_file_size" => {
                    config.log_file_size =
                        parse_size(value).ok_or_else(|| invalid(key, value))?;
                }
                "log_rotation_interval" => {
                    config.log_rotation_interval =
                        parse_duration(value).ok_or_else(|| invalid(key, value))?;
                }
                "merge_interval" => {
                    config.merge_interval =
                        parse_duration(value).ok_or_else(|| invalid(key, value))?;
                }
                unknown => {
                    debug!(key = unknown, "ignoring unknown config key");
                }
            }
        }

        Ok(config)
    }

    /// The address the listener binds, on all interfaces.
    pub fn bind_address(&self) -> String {
        format!("0.0.0.0:{}", self.port)
    }
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

/// Parses a duration: plain milliseconds, or a number with an `s`, `m`, or
/// `h` suffix.
fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Some(n) = value.strip_suffix('s') {
        return Some(Duration::from_secs(n.parse().ok()?));
    }
    if let Some(n) = value.strip_suffix('m') {
        return Some(Duration::from_secs(n.parse::<u64>().ok()? * 60));
    }
    if let Some(n) = value.strip_suffix('h') {
        return Some(Duration::from_secs(n.parse::<u64>().ok()? * 3600));
    }
    Some(Duration::from_millis(value.parse().ok()?))
}

/// Parses a size: plain bytes, or a number with a `KB`, `MB`, or `GB`
/// suffix (case-insensitive).
fn parse_size(value: &str) -> Option<u64> {
    let upper = value.trim().to_ascii_uppercase();
    if let Some(n) = upper.strip_suffix("KB") {
        return Some(n.parse::<u64>().ok()? * 1024);
    }
    if let Some(n) = upper.strip_suffix("MB") {
        return Some(n.parse::<u64>().ok()? * 1024 * 1024);
    }
    if let Some(n) = upper.strip_suffix("GB") {
        return Some(n.parse::<u64>().ok()? * 1024 * 1024 * 1024);
    }
    upper.parse().ok()
}

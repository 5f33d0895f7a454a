//! Command Handler Module
//!
//! This module implements the Redis-compatible command surface of beetle.
//! It receives parsed RESP arrays, validates arity and options, executes
//! against the sharded storage engine, and produces reply values.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     CommandHandler                          │
//! │                                                             │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐      │
//! │  │ normalize() │───>│  dispatch() │───>│  handlers   │      │
//! │  └─────────────┘    └─────────────┘    └──────┬──────┘      │
//! │                                               │             │
//! │                                               ▼             │
//! │                                       Engine (shards)       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Supported Commands
//!
//! ### String Commands
//! - `SET key value [NX|XX] [GET] [EX s | PX ms | EXAT s | PXAT ms | KEEPTTL]`
//! - `GET key`
//! - `DEL key [key ...]`
//! - `APPEND key value`
//! - `GETDEL key`
//! - `GETEX key [PERSIST | EX s | PX ms | EXAT s | PXAT ms]`
//! - `GETRANGE key start stop`
//! - `STRLEN key`
//!
//! ### Key Commands
//! - `TTL key`
//! - `EXISTS key [key ...]`
//! - `KEYS pattern`
//!
//! ### Server Commands
//! - `PING [message]`, `ECHO message`, `DBSIZE`, `FLUSHDB`
//!
//! `MULTI`, `EXEC` and `DISCARD` never reach this layer; the connection
//! handler owns the transaction state machine.

use crate::protocol::Value;
use crate::storage::{unix_ms, Engine, EngineError, Lookup};
use bytes::Bytes;
use std::sync::Arc;
use tracing::warn;

/// Executes commands against the storage engine.
///
/// Cheap to clone; every connection holds one.
#[derive(Clone)]
pub struct CommandHandler {
    engine: Arc<Engine>,
}

impl CommandHandler {
    /// Creates a new command handler over the shared engine.
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// Executes one command frame and returns the reply.
    ///
    /// The frame must be a RESP array whose first element is the command
    /// name; usage errors come back as RESP error values, never as Rust
    /// errors.
    pub async fn execute(&self, command: Value) -> Value {
        let args = match command {
            Value::Array(args) => args,
            _ => return Value::error("ERR invalid command format"),
        };

        if args.is_empty() {
            return Value::error("ERR empty command");
        }

        let name = match command_name_of(&args[0]) {
            Some(name) => name,
            None => return Value::error("ERR invalid command name"),
        };

        self.dispatch(&name, &args[1..]).await
    }

    /// Routes a normalized command name to its handler.
    async fn dispatch(&self, cmd: &str, args: &[Value]) -> Value {
        match cmd {
            // String commands
            "SET" => self.cmd_set(args).await,
            "GET" => self.cmd_get(args).await,
            "DEL" => self.cmd_del(args).await,
            "APPEND" => self.cmd_append(args).await,
            "GETDEL" => self.cmd_getdel(args).await,
            "GETEX" => self.cmd_getex(args).await,
            "GETRANGE" => self.cmd_getrange(args).await,
            "STRLEN" => self.cmd_strlen(args).await,

            // Key commands
            "TTL" => self.cmd_ttl(args).await,
            "EXISTS" => self.cmd_exists(args).await,
            "KEYS" => self.cmd_keys(args).await,

            // Server commands
            "PING" => self.cmd_ping(args),
            "ECHO" => self.cmd_echo(args),
            "DBSIZE" => self.cmd_dbsize(args).await,
            "FLUSHDB" => self.cmd_flushdb(args).await,

            _ => Value::error(format!("ERR unknown command '{}'", cmd)),
        }
    }

    // ========================================================================
    // String commands
    // ========================================================================

    /// SET key value [NX|XX] [GET] [EX s | PX ms | EXAT s | PXAT ms | KEEPTTL]
    async fn cmd_set(&self, args: &[Value]) -> Value {
        if args.len() < 2 {
            return wrong_arity("SET");
        }

        let key = match arg_bytes(&args[0]) {
            Some(k) => k,
            None => return Value::error("ERR invalid key"),
        };
        let value = match arg_bytes(&args[1]) {
            Some(v) => v,
            None => return Value::error("ERR invalid value"),
        };

        let mut existence: Option<Existence> = None;
        let mut get_flag = false;
        let mut expiry: Option<Expiry> = None;

        let mut i = 2;
        while i < args.len() {
            let opt = match arg_string(&args[i]) {
                Some(s) => s.to_uppercase(),
                None => return Value::error("ERR syntax error"),
            };

            match opt.as_str() {
                "NX" => {
                    if existence.is_some() {
                        return Value::error("ERR syntax error");
                    }
                    existence = Some(Existence::IfAbsent);
                }
                "XX" => {
                    if existence.is_some() {
                        return Value::error("ERR syntax error");
                    }
                    existence = Some(Existence::IfPresent);
                }
                "GET" => get_flag = true,
                "KEEPTTL" => {
                    if expiry.is_some() {
                        return Value::error("ERR syntax error");
                    }
                    expiry = Some(Expiry::Keep);
                }
                "EX" | "PX" | "EXAT" | "PXAT" => {
                    if expiry.is_some() {
                        return Value::error("ERR syntax error");
                    }
                    i += 1;
                    if i >= args.len() {
                        return Value::error("ERR syntax error");
                    }
                    let n = match arg_int(&args[i]) {
                        Some(n) => n,
                        None => {
                            return Value::error("ERR value is not an integer or out of range")
                        }
                    };
                    if n <= 0 {
                        return Value::error("ERR invalid expire time in 'SET' command");
                    }
                    expiry = Some(match opt.as_str() {
                        "EX" => Expiry::RelativeSecs(n as u64),
                        "PX" => Expiry::RelativeMillis(n as u64),
                        "EXAT" => Expiry::AbsoluteSecs(n as u64),
                        _ => Expiry::AbsoluteMillis(n as u64),
                    });
                }
                _ => return Value::error("ERR syntax error"),
            }
            i += 1;
        }

        let now = unix_ms();

        // A single read serves the NX/XX precondition, the GET reply, and
        // KEEPTTL's deadline lookup.
        let needs_prior =
            get_flag || existence.is_some() || matches!(expiry, Some(Expiry::Keep));
        let prior = if needs_prior {
            match self.engine.fetch(key.clone(), now).await {
                Ok(prior) => prior,
                Err(err) => return storage_error(err),
            }
        } else {
            None
        };

        match existence {
            Some(Existence::IfAbsent) if prior.is_some() => {
                return if get_flag {
                    reply_value(prior)
                } else {
                    Value::null()
                };
            }
            Some(Existence::IfPresent) if prior.is_none() => {
                return Value::null();
            }
            _ => {}
        }

        let expiration_ms = match expiry {
            None => 0,
            Some(Expiry::RelativeSecs(s)) => now.saturating_add(s.saturating_mul(1000)),
            Some(Expiry::RelativeMillis(ms)) => now.saturating_add(ms),
            Some(Expiry::AbsoluteSecs(s)) => s.saturating_mul(1000),
            Some(Expiry::AbsoluteMillis(ms)) => ms,
            Some(Expiry::Keep) => prior.as_ref().map(|p| p.expiration_ms).unwrap_or(0),
            Some(Expiry::Clear) => 0,
        };

        if let Err(err) = self
            .engine
            .put(key, Value::Bulk(value), expiration_ms)
            .await
        {
            return storage_error(err);
        }

        if get_flag {
            reply_value(prior)
        } else {
            Value::ok()
        }
    }

    /// GET key
    async fn cmd_get(&self, args: &[Value]) -> Value {
        if args.len() != 1 {
            return wrong_arity("GET");
        }
        let key = match arg_bytes(&args[0]) {
            Some(k) => k,
            None => return Value::error("ERR invalid key"),
        };

        match self.engine.fetch(key, unix_ms()).await {
            Ok(lookup) => reply_value(lookup),
            Err(err) => storage_error(err),
        }
    }

    /// DEL key [key ...]
    async fn cmd_del(&self, args: &[Value]) -> Value {
        if args.is_empty() {
            return wrong_arity("DEL");
        }

        let keys: Vec<Bytes> = args.iter().filter_map(arg_bytes).collect();
        match self.engine.delete(keys).await {
            Ok(deleted) => Value::int(deleted as i64),
            Err(err) => storage_error(err),
        }
    }

    /// APPEND key value
    async fn cmd_append(&self, args: &[Value]) -> Value {
        if args.len() != 2 {
            return wrong_arity("APPEND");
        }
        let key = match arg_bytes(&args[0]) {
            Some(k) => k,
            None => return Value::error("ERR invalid key"),
        };
        let suffix = match arg_bytes(&args[1]) {
            Some(v) => v,
            None => return Value::error("ERR invalid value"),
        };

        let now = unix_ms();
        let (combined, expiration_ms) = match self.engine.fetch(key.clone(), now).await {
            Ok(Some(Lookup {
                value: Value::Bulk(existing),
                expiration_ms,
            })) => {
                let mut joined = Vec::with_capacity(existing.len() + suffix.len());
                joined.extend_from_slice(&existing);
                joined.extend_from_slice(&suffix);
                (Bytes::from(joined), expiration_ms)
            }
            Ok(Some(_)) => {
                return Value::error(
                    "WRONGTYPE Operation against a key holding the wrong kind of value",
                )
            }
            Ok(None) => (suffix, 0),
            Err(err) => return storage_error(err),
        };

        let new_len = combined.len();
        match self
            .engine
            .put(key, Value::Bulk(combined), expiration_ms)
            .await
        {
            Ok(()) => Value::int(new_len as i64),
            Err(err) => storage_error(err),
        }
    }

    /// GETDEL key
    async fn cmd_getdel(&self, args: &[Value]) -> Value {
        if args.len() != 1 {
            return wrong_arity("GETDEL");
        }
        let key = match arg_bytes(&args[0]) {
            Some(k) => k,
            None => return Value::error("ERR invalid key"),
        };

        let prior = match self.engine.fetch(key.clone(), unix_ms()).await {
            Ok(prior) => prior,
            Err(err) => return storage_error(err),
        };

        if prior.is_some() {
            if let Err(err) = self.engine.delete(vec![key]).await {
                return storage_error(err);
            }
        }
        reply_value(prior)
    }

    /// GETEX key [PERSIST | EX s | PX ms | EXAT s | PXAT ms]
    async fn cmd_getex(&self, args: &[Value]) -> Value {
        if args.is_empty() {
            return wrong_arity("GETEX");
        }
        let key = match arg_bytes(&args[0]) {
            Some(k) => k,
            None => return Value::error("ERR invalid key"),
        };

        let mut expiry: Option<Expiry> = None;
        let mut i = 1;
        while i < args.len() {
            if expiry.is_some() {
                return Value::error("ERR syntax error");
            }
            let opt = match arg_string(&args[i]) {
                Some(s) => s.to_uppercase(),
                None => return Value::error("ERR syntax error"),
            };
            match opt.as_str() {
                "PERSIST" => expiry = Some(Expiry::Clear),
                "EX" | "PX" | "EXAT" | "PXAT" => {
                    i += 1;
                    if i >= args.len() {
                        return Value::error("ERR syntax error");
                    }
                    let n = match arg_int(&args[i]) {
                        Some(n) => n,
                        None => {
                            return Value::error("ERR value is not an integer or out of range")
                        }
                    };
                    if n <= 0 {
                        return Value::error("ERR invalid expire time in 'GETEX' command");
                    }
                    expiry = Some(match opt.as_str() {
                        "EX" => Expiry::RelativeSecs(n as u64),
                        "PX" => Expiry::RelativeMillis(n as u64),
                        "EXAT" => Expiry::AbsoluteSecs(n as u64),
                        _ => Expiry::AbsoluteMillis(n as u64),
                    });
                }
                _ => return Value::error("ERR syntax error"),
            }
            i += 1;
        }

        let now = unix_ms();
        let lookup = match self.engine.fetch(key.clone(), now).await {
            Ok(lookup) => lookup,
            Err(err) => return storage_error(err),
        };

        let lookup = match lookup {
            Some(lookup) => lookup,
            None => return Value::null(),
        };

        let new_expiration = match expiry {
            None => return reply_value(Some(lookup)),
            Some(Expiry::Clear) => 0,
            Some(Expiry::RelativeSecs(s)) => now.saturating_add(s.saturating_mul(1000)),
            Some(Expiry::RelativeMillis(ms)) => now.saturating_add(ms),
            Some(Expiry::AbsoluteSecs(s)) => s.saturating_mul(1000),
            Some(Expiry::AbsoluteMillis(ms)) => ms,
            Some(Expiry::Keep) => lookup.expiration_ms,
        };

        if new_expiration != lookup.expiration_ms {
            if let Err(err) = self
                .engine
                .put(key, lookup.value.clone(), new_expiration)
                .await
            {
                return storage_error(err);
            }
        }

        reply_value(Some(lookup))
    }

    /// GETRANGE key start stop
    async fn cmd_getrange(&self, args: &[Value]) -> Value {
        if args.len() != 3 {
            return wrong_arity("GETRANGE");
        }
        let key = match arg_bytes(&args[0]) {
            Some(k) => k,
            None => return Value::error("ERR invalid key"),
        };
        let (start, stop) = match (arg_int(&args[1]), arg_int(&args[2])) {
            (Some(start), Some(stop)) => (start, stop),
            _ => return Value::error("ERR value is not an integer or out of range"),
        };

        let bytes = match self.engine.fetch(key, unix_ms()).await {
            Ok(Some(Lookup {
                value: Value::Bulk(bytes),
                ..
            })) => bytes,
            Ok(Some(_)) => {
                return Value::error(
                    "WRONGTYPE Operation against a key holding the wrong kind of value",
                )
            }
            Ok(None) => return Value::bulk(Bytes::new()),
            Err(err) => return storage_error(err),
        };

        let len = bytes.len() as i64;
        let mut start = if start < 0 { len + start } else { start };
        let mut stop = if stop < 0 { len + stop } else { stop };
        if start < 0 {
            start = 0;
        }
        if stop >= len {
            stop = len - 1;
        }

        if len == 0 || start > stop || start >= len {
            return Value::bulk(Bytes::new());
        }

        Value::Bulk(bytes.slice(start as usize..(stop + 1) as usize))
    }

    /// STRLEN key
    async fn cmd_strlen(&self, args: &[Value]) -> Value {
        if args.len() != 1 {
            return wrong_arity("STRLEN");
        }
        let key = match arg_bytes(&args[0]) {
            Some(k) => k,
            None => return Value::error("ERR invalid key"),
        };

        match self.engine.fetch(key, unix_ms()).await {
            Ok(Some(Lookup {
                value: Value::Bulk(bytes),
                ..
            })) => Value::int(bytes.len() as i64),
            Ok(Some(_)) => Value::error(
                "WRONGTYPE Operation against a key holding the wrong kind of value",
            ),
            Ok(None) => Value::int(0),
            Err(err) => storage_error(err),
        }
    }

    // ========================================================================
    // Key commands
    // ========================================================================

    /// TTL key
    async fn cmd_ttl(&self, args: &[Value]) -> Value {
        if args.len() != 1 {
            return wrong_arity("TTL");
        }
        let key = match arg_bytes(&args[0]) {
            Some(k) => k,
            None => return Value::error("ERR invalid key"),
        };

        let now = unix_ms();
        match self.engine.fetch(key, now).await {
            Ok(None) => Value::int(-2),
            Ok(Some(lookup)) if lookup.expiration_ms == 0 => Value::int(-1),
            Ok(Some(lookup)) => {
                // Remaining time rounded up to whole seconds; the engine
                // already filtered expired records, so the deadline is ahead.
                let remaining_ms = lookup.expiration_ms.saturating_sub(now);
                Value::int(((remaining_ms + 999) / 1000) as i64)
            }
            Err(err) => storage_error(err),
        }
    }

    /// EXISTS key [key ...]
    async fn cmd_exists(&self, args: &[Value]) -> Value {
        if args.is_empty() {
            return wrong_arity("EXISTS");
        }

        let now = unix_ms();
        let mut count = 0i64;
        for arg in args {
            let key = match arg_bytes(arg) {
                Some(k) => k,
                None => continue,
            };
            match self.engine.fetch(key, now).await {
                Ok(Some(_)) => count += 1,
                Ok(None) => {}
                Err(err) => return storage_error(err),
            }
        }
        Value::int(count)
    }

    /// KEYS pattern
    async fn cmd_keys(&self, args: &[Value]) -> Value {
        if args.len() != 1 {
            return wrong_arity("KEYS");
        }
        let pattern = match arg_bytes(&args[0]) {
            Some(p) => p,
            None => return Value::error("ERR invalid pattern"),
        };

        let keys = match self.engine.keys().await {
            Ok(keys) => keys,
            Err(err) => return storage_error(err),
        };

        let now = unix_ms();
        let mut matched = Vec::new();
        for key in keys {
            if !glob_match(&pattern, &key) {
                continue;
            }
            // The keydir may still hold keys whose records have expired;
            // reconcile before reporting.
            match self.engine.fetch(key.clone(), now).await {
                Ok(Some(_)) => matched.push(Value::Bulk(key)),
                Ok(None) => {}
                Err(err) => return storage_error(err),
            }
        }
        Value::Array(matched)
    }

    // ========================================================================
    // Server commands
    // ========================================================================

    /// PING [message]
    fn cmd_ping(&self, args: &[Value]) -> Value {
        match args.len() {
            0 => Value::pong(),
            1 => match arg_bytes(&args[0]) {
                Some(msg) => Value::Bulk(msg),
                None => Value::error("ERR invalid argument"),
            },
            _ => wrong_arity("PING"),
        }
    }

    /// ECHO message
    fn cmd_echo(&self, args: &[Value]) -> Value {
        if args.len() != 1 {
            return wrong_arity("ECHO");
        }
        match arg_bytes(&args[0]) {
            Some(msg) => Value::Bulk(msg),
            None => Value::error("ERR invalid argument"),
        }
    }

    /// DBSIZE
    async fn cmd_dbsize(&self, args: &[Value]) -> Value {
        if !args.is_empty() {
            return wrong_arity("DBSIZE");
        }
        match self.engine.len().await {
            Ok(len) => Value::int(len as i64),
            Err(err) => storage_error(err),
        }
    }

    /// FLUSHDB
    async fn cmd_flushdb(&self, _args: &[Value]) -> Value {
        match self.engine.clear().await {
            Ok(_) => Value::ok(),
            Err(err) => storage_error(err),
        }
    }
}

/// SET/GETEX existence preconditions.
enum Existence {
    IfAbsent,
    IfPresent,
}

/// Parsed expiry options shared by SET and GETEX.
enum Expiry {
    RelativeSecs(u64),
    RelativeMillis(u64),
    AbsoluteSecs(u64),
    AbsoluteMillis(u64),
    /// SET KEEPTTL: carry the prior record's deadline forward
    Keep,
    /// GETEX PERSIST: drop the deadline
    Clear,
}

/// Extracts the uppercased command name from the first array element.
pub fn command_name_of(value: &Value) -> Option<String> {
    match value {
        Value::Bulk(raw) => std::str::from_utf8(raw).ok().map(|s| s.to_uppercase()),
        Value::Simple(s) => Some(s.to_uppercase()),
        _ => None,
    }
}

fn wrong_arity(cmd: &str) -> Value {
    Value::error(format!(
        "ERR wrong number of arguments for '{}' command",
        cmd
    ))
}

fn storage_error(err: EngineError) -> Value {
    warn!(error = %err, "storage operation failed");
    Value::error("ERR internal storage error")
}

fn reply_value(lookup: Option<Lookup>) -> Value {
    match lookup {
        Some(lookup) => lookup.value,
        None => Value::null(),
    }
}

/// Extracts a Bytes argument.
fn arg_bytes(value: &Value) -> Option<Bytes> {
    match value {
        Value::Bulk(b) => Some(b.clone()),
        Value::Simple(s) => Some(Bytes::from(s.clone())),
        _ => None,
    }
}

/// Extracts a string argument.
fn arg_string(value: &Value) -> Option<String> {
    match value {
        Value::Bulk(b) => std::str::from_utf8(b).ok().map(|s| s.to_string()),
        Value::Simple(s) => Some(s.clone()),
        _ => None,
    }
}

/// Extracts an integer argument.
fn arg_int(value: &Value) -> Option<i64> {
    match value {
        Value::Int(n) => Some(*n),
        Value::Bulk(b) => std::str::from_utf8(b).ok().and_then(|s| s.parse().ok()),
        Value::Simple(s) => s.parse().ok(),
        _ => None,
    }
}

/// Matches a key against a Redis-style glob pattern for the KEYS command.
///
/// Supported syntax: `*` (any run of bytes), `?` (any single byte),
/// `[...]` classes with ranges and `^` negation, and backslash escapes.
/// Works on raw bytes, so binary keys participate in matching.
///
/// Iterative two-cursor scan rather than recursion: on a mismatch the
/// cursors rewind to just past the most recent `*` with one more key byte
/// swallowed, so a pattern of length P over a key of length K stays O(P*K)
/// worst case with no stack growth.
fn glob_match(pattern: &[u8], key: &[u8]) -> bool {
    let mut p = 0;
    let mut k = 0;
    // Resume point of the most recent `*`: (pattern index past the star,
    // key index it will swallow up to next).
    let mut retry: Option<(usize, usize)> = None;

    while k < key.len() {
        let mut advanced = false;

        if p < pattern.len() {
            match pattern[p] {
                b'*' => {
                    retry = Some((p + 1, k));
                    p += 1;
                    continue;
                }
                b'?' => {
                    p += 1;
                    k += 1;
                    advanced = true;
                }
                b'[' => {
                    if let Some((hit, span)) = class_match(&pattern[p..], key[k]) {
                        if hit {
                            p += span;
                            k += 1;
                            advanced = true;
                        }
                    }
                }
                b'\\' if p + 1 < pattern.len() => {
                    if pattern[p + 1] == key[k] {
                        p += 2;
                        k += 1;
                        advanced = true;
                    }
                }
                literal => {
                    if literal == key[k] {
                        p += 1;
                        k += 1;
                        advanced = true;
                    }
                }
            }
        }

        if advanced {
            continue;
        }

        // Mismatch: hand the last star one more byte of the key, or fail.
        match retry {
            Some((resume_p, swallowed)) => {
                p = resume_p;
                k = swallowed + 1;
                retry = Some((resume_p, swallowed + 1));
            }
            None => return false,
        }
    }

    // Key exhausted; the pattern may only have trailing stars left.
    while p < pattern.len() && pattern[p] == b'*' {
        p += 1;
    }
    p == pattern.len()
}

/// Tests `byte` against the `[...]` class opening at `pattern[0]`.
///
/// Returns whether the byte is in the class and how many pattern bytes the
/// class spans, or None when the class never closes.
fn class_match(pattern: &[u8], byte: u8) -> Option<(bool, usize)> {
    let negated = pattern.get(1) == Some(&b'^');
    let mut i = if negated { 2 } else { 1 };
    let mut hit = false;

    while i < pattern.len() && pattern[i] != b']' {
        let is_range =
            i + 2 < pattern.len() && pattern[i + 1] == b'-' && pattern[i + 2] != b']';
        if is_range {
            if (pattern[i]..=pattern[i + 2]).contains(&byte) {
                hit = true;
            }
            i += 3;
        } else {
            if pattern[i] == byte {
                hit = true;
            }
            i += 1;
        }
    }

    if i >= pattern.len() {
        return None;
    }
    Some((hit != negated, i + 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_handler() -> (TempDir, CommandHandler) {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(Engine::open(dir.path(), 2).unwrap());
        (dir, CommandHandler::new(engine))
    }

    fn cmd(parts: &[&str]) -> Value {
        Value::Array(
            parts
                .iter()
                .map(|p| Value::bulk(Bytes::copy_from_slice(p.as_bytes())))
                .collect(),
        )
    }

    async fn run(handler: &CommandHandler, parts: &[&str]) -> Value {
        handler.execute(cmd(parts)).await
    }

    #[tokio::test]
    async fn test_ping() {
        let (_dir, handler) = test_handler();
        assert_eq!(run(&handler, &["PING"]).await, Value::pong());
        assert_eq!(
            run(&handler, &["PING", "hello"]).await,
            Value::bulk(Bytes::from("hello"))
        );
    }

    #[tokio::test]
    async fn test_echo() {
        let (_dir, handler) = test_handler();
        assert_eq!(
            run(&handler, &["ECHO", "beetle"]).await,
            Value::bulk(Bytes::from("beetle"))
        );
        assert!(run(&handler, &["ECHO"]).await.is_error());
    }

    #[tokio::test]
    async fn test_set_get() {
        let (_dir, handler) = test_handler();
        assert_eq!(run(&handler, &["SET", "k", "v"]).await, Value::ok());
        assert_eq!(
            run(&handler, &["GET", "k"]).await,
            Value::bulk(Bytes::from("v"))
        );
        assert_eq!(run(&handler, &["GET", "missing"]).await, Value::null());
    }

    #[tokio::test]
    async fn test_set_is_case_insensitive() {
        let (_dir, handler) = test_handler();
        assert_eq!(run(&handler, &["set", "k", "v"]).await, Value::ok());
        assert_eq!(
            run(&handler, &["gEt", "k"]).await,
            Value::bulk(Bytes::from("v"))
        );
    }

    #[tokio::test]
    async fn test_set_nx_xx() {
        let (_dir, handler) = test_handler();

        // XX on a missing key fails.
        assert_eq!(run(&handler, &["SET", "k", "v", "XX"]).await, Value::null());
        // NX on a missing key succeeds.
        assert_eq!(run(&handler, &["SET", "k", "v1", "NX"]).await, Value::ok());
        // NX on a present key fails and leaves the value alone.
        assert_eq!(
            run(&handler, &["SET", "k", "v2", "NX"]).await,
            Value::null()
        );
        assert_eq!(
            run(&handler, &["GET", "k"]).await,
            Value::bulk(Bytes::from("v1"))
        );
        // XX on a present key succeeds.
        assert_eq!(run(&handler, &["SET", "k", "v3", "XX"]).await, Value::ok());
        assert_eq!(
            run(&handler, &["GET", "k"]).await,
            Value::bulk(Bytes::from("v3"))
        );
    }

    #[tokio::test]
    async fn test_set_get_option_returns_prior() {
        let (_dir, handler) = test_handler();

        assert_eq!(
            run(&handler, &["SET", "k", "first", "GET"]).await,
            Value::null()
        );
        assert_eq!(
            run(&handler, &["SET", "k", "second", "GET"]).await,
            Value::bulk(Bytes::from("first"))
        );
        // NX failure with GET still reports the prior value.
        assert_eq!(
            run(&handler, &["SET", "k", "third", "NX", "GET"]).await,
            Value::bulk(Bytes::from("second"))
        );
        assert_eq!(
            run(&handler, &["GET", "k"]).await,
            Value::bulk(Bytes::from("second"))
        );
    }

    #[tokio::test]
    async fn test_set_option_conflicts() {
        let (_dir, handler) = test_handler();

        assert_eq!(
            run(&handler, &["SET", "k", "v", "NX", "XX"]).await,
            Value::error("ERR syntax error")
        );
        assert_eq!(
            run(&handler, &["SET", "k", "v", "EX", "10", "KEEPTTL"]).await,
            Value::error("ERR syntax error")
        );
        assert_eq!(
            run(&handler, &["SET", "k", "v", "EX", "10", "PX", "500"]).await,
            Value::error("ERR syntax error")
        );
        assert_eq!(
            run(&handler, &["SET", "k", "v", "EX"]).await,
            Value::error("ERR syntax error")
        );
        assert!(run(&handler, &["SET", "k", "v", "EX", "abc"]).await.is_error());
        assert!(run(&handler, &["SET", "k", "v", "EX", "0"]).await.is_error());
        assert!(run(&handler, &["SET", "k", "v", "BOGUS"]).await.is_error());
    }

    #[tokio::test]
    async fn test_ttl() {
        let (_dir, handler) = test_handler();

        // Absent key.
        assert_eq!(run(&handler, &["TTL", "miss"]).await, Value::int(-2));

        // No expiry.
        run(&handler, &["SET", "forever", "v"]).await;
        assert_eq!(run(&handler, &["TTL", "forever"]).await, Value::int(-1));

        // With expiry.
        run(&handler, &["SET", "temp", "v", "EX", "100"]).await;
        match run(&handler, &["TTL", "temp"]).await {
            Value::Int(n) => assert!(n > 0 && n <= 100, "ttl {} out of range", n),
            other => panic!("expected integer, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_set_keepttl() {
        let (_dir, handler) = test_handler();

        run(&handler, &["SET", "k", "v1", "EX", "100"]).await;
        run(&handler, &["SET", "k", "v2", "KEEPTTL"]).await;
        match run(&handler, &["TTL", "k"]).await {
            Value::Int(n) => assert!(n > 0, "KEEPTTL must preserve the deadline"),
            other => panic!("expected integer, got {:?}", other),
        }

        // A plain SET clears the deadline.
        run(&handler, &["SET", "k", "v3"]).await;
        assert_eq!(run(&handler, &["TTL", "k"]).await, Value::int(-1));
    }

    #[tokio::test]
    async fn test_expired_key_is_absent() {
        let (_dir, handler) = test_handler();

        run(&handler, &["SET", "gone", "v", "PX", "1"]).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert_eq!(run(&handler, &["GET", "gone"]).await, Value::null());
        assert_eq!(run(&handler, &["TTL", "gone"]).await, Value::int(-2));
    }

    #[tokio::test]
    async fn test_del_counts_removed() {
        let (_dir, handler) = test_handler();

        run(&handler, &["SET", "a", "1"]).await;
        run(&handler, &["SET", "b", "2"]).await;

        assert_eq!(
            run(&handler, &["DEL", "a", "b", "missing"]).await,
            Value::int(2)
        );
        assert_eq!(run(&handler, &["GET", "a"]).await, Value::null());
    }

    #[tokio::test]
    async fn test_append() {
        let (_dir, handler) = test_handler();

        assert_eq!(run(&handler, &["APPEND", "k", "Hello"]).await, Value::int(5));
        assert_eq!(
            run(&handler, &["APPEND", "k", " World"]).await,
            Value::int(11)
        );
        assert_eq!(
            run(&handler, &["GET", "k"]).await,
            Value::bulk(Bytes::from("Hello World"))
        );
    }

    #[tokio::test]
    async fn test_getdel() {
        let (_dir, handler) = test_handler();

        run(&handler, &["SET", "k", "v"]).await;
        assert_eq!(
            run(&handler, &["GETDEL", "k"]).await,
            Value::bulk(Bytes::from("v"))
        );
        assert_eq!(run(&handler, &["GET", "k"]).await, Value::null());
        assert_eq!(run(&handler, &["GETDEL", "k"]).await, Value::null());
    }

    #[tokio::test]
    async fn test_getex() {
        let (_dir, handler) = test_handler();

        run(&handler, &["SET", "k", "v", "EX", "100"]).await;

        // Plain GETEX reads without touching the deadline.
        assert_eq!(
            run(&handler, &["GETEX", "k"]).await,
            Value::bulk(Bytes::from("v"))
        );
        match run(&handler, &["TTL", "k"]).await {
            Value::Int(n) => assert!(n > 0),
            other => panic!("expected integer, got {:?}", other),
        }

        // PERSIST clears it.
        assert_eq!(
            run(&handler, &["GETEX", "k", "PERSIST"]).await,
            Value::bulk(Bytes::from("v"))
        );
        assert_eq!(run(&handler, &["TTL", "k"]).await, Value::int(-1));

        // EX sets a new one.
        assert_eq!(
            run(&handler, &["GETEX", "k", "EX", "50"]).await,
            Value::bulk(Bytes::from("v"))
        );
        match run(&handler, &["TTL", "k"]).await {
            Value::Int(n) => assert!(n > 0 && n <= 50),
            other => panic!("expected integer, got {:?}", other),
        }

        assert_eq!(run(&handler, &["GETEX", "missing"]).await, Value::null());
        assert!(run(&handler, &["GETEX", "k", "EX", "1", "PERSIST"])
            .await
            .is_error());
    }

    #[tokio::test]
    async fn test_getrange() {
        let (_dir, handler) = test_handler();

        run(&handler, &["SET", "k", "This is a string"]).await;

        assert_eq!(
            run(&handler, &["GETRANGE", "k", "0", "3"]).await,
            Value::bulk(Bytes::from("This"))
        );
        assert_eq!(
            run(&handler, &["GETRANGE", "k", "-3", "-1"]).await,
            Value::bulk(Bytes::from("ing"))
        );
        assert_eq!(
            run(&handler, &["GETRANGE", "k", "0", "-1"]).await,
            Value::bulk(Bytes::from("This is a string"))
        );
        assert_eq!(
            run(&handler, &["GETRANGE", "k", "10", "100"]).await,
            Value::bulk(Bytes::from("string"))
        );
        assert_eq!(
            run(&handler, &["GETRANGE", "k", "5", "3"]).await,
            Value::bulk(Bytes::new())
        );
        assert_eq!(
            run(&handler, &["GETRANGE", "missing", "0", "10"]).await,
            Value::bulk(Bytes::new())
        );
    }

    #[tokio::test]
    async fn test_strlen() {
        let (_dir, handler) = test_handler();

        run(&handler, &["SET", "k", "hello"]).await;
        assert_eq!(run(&handler, &["STRLEN", "k"]).await, Value::int(5));
        assert_eq!(run(&handler, &["STRLEN", "missing"]).await, Value::int(0));
    }

    #[tokio::test]
    async fn test_exists_dbsize_flushdb() {
        let (_dir, handler) = test_handler();

        run(&handler, &["SET", "a", "1"]).await;
        run(&handler, &["SET", "b", "2"]).await;

        assert_eq!(
            run(&handler, &["EXISTS", "a", "b", "a", "missing"]).await,
            Value::int(3)
        );
        assert_eq!(run(&handler, &["DBSIZE"]).await, Value::int(2));

        assert_eq!(run(&handler, &["FLUSHDB"]).await, Value::ok());
        assert_eq!(run(&handler, &["DBSIZE"]).await, Value::int(0));
    }

    #[tokio::test]
    async fn test_keys_glob() {
        let (_dir, handler) = test_handler();

        run(&handler, &["SET", "hello", "1"]).await;
        run(&handler, &["SET", "hallo", "2"]).await;
        run(&handler, &["SET", "world", "3"]).await;

        let matched = run(&handler, &["KEYS", "h?llo"]).await;
        match matched {
            Value::Array(keys) => assert_eq!(keys.len(), 2),
            other => panic!("expected array, got {:?}", other),
        }

        let all = run(&handler, &["KEYS", "*"]).await;
        match all {
            Value::Array(keys) => assert_eq!(keys.len(), 3),
            other => panic!("expected array, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let (_dir, handler) = test_handler();
        assert_eq!(
            run(&handler, &["NOSUCH", "x"]).await,
            Value::error("ERR unknown command 'NOSUCH'")
        );
    }

    #[tokio::test]
    async fn test_wrong_arity() {
        let (_dir, handler) = test_handler();
        assert_eq!(
            run(&handler, &["GET"]).await,
            Value::error("ERR wrong number of arguments for 'GET' command")
        );
        assert_eq!(
            run(&handler, &["SET", "only-key"]).await,
            Value::error("ERR wrong number of arguments for 'SET' command")
        );
    }

    #[tokio::test]
    async fn test_non_array_command() {
        let (_dir, handler) = test_handler();
        assert!(handler.execute(Value::int(5)).await.is_error());
        assert!(handler.execute(Value::Array(vec![])).await.is_error());
    }

    #[test]
    fn test_glob_match_wildcards() {
        assert!(glob_match(b"h*llo", b"hello"));
        assert!(glob_match(b"h*llo", b"hallo"));
        assert!(glob_match(b"h*llo", b"hllo"));
        assert!(glob_match(b"h*llo", b"heeeello"));
        assert!(!glob_match(b"h*llo", b"world"));

        assert!(glob_match(b"h?llo", b"hello"));
        assert!(!glob_match(b"h?llo", b"hllo"));
        assert!(!glob_match(b"h?llo", b"heello"));

        assert!(glob_match(b"*", b""));
        assert!(glob_match(b"*", b"anything"));
        assert!(glob_match(b"a*b*c", b"a-b-b-c"));
        assert!(!glob_match(b"a*b*c", b"a-c"));
        // A trailing star may match nothing.
        assert!(glob_match(b"user:*", b"user:"));
    }

    #[test]
    fn test_glob_match_classes_and_escapes() {
        assert!(glob_match(b"h[ae]llo", b"hello"));
        assert!(glob_match(b"h[ae]llo", b"hallo"));
        assert!(!glob_match(b"h[ae]llo", b"hillo"));

        assert!(glob_match(b"h[^i]llo", b"hallo"));
        assert!(!glob_match(b"h[^i]llo", b"hillo"));

        assert!(glob_match(b"h[a-z]llo", b"hmllo"));
        assert!(!glob_match(b"h[a-z]llo", b"hAllo"));

        assert!(glob_match(b"ends\\*", b"ends*"));
        assert!(!glob_match(b"ends\\*", b"endsX"));

        // An unterminated class matches nothing.
        assert!(!glob_match(b"h[unterminated", b"hu"));
    }

    #[test]
    fn test_glob_match_binary_keys() {
        assert!(glob_match(b"*", b"\x00\xff\x01"));
        assert!(glob_match(b"bin:?", b"bin:\x00"));
        assert!(glob_match(b"\x00*", b"\x00rest"));
        assert!(!glob_match(b"\x01*", b"\x00rest"));
    }
}

//! Connection Handler Module
//!
//! This module handles individual client connections. Each client gets its
//! own handler task that reads bytes, extracts complete RESP frames,
//! executes them, and writes replies.
//!
//! ## Pipelining
//!
//! TCP is a stream: one read may deliver half a command, one command, or a
//! whole batch. The handler drains every complete frame out of its buffer
//! per read. A batch of independent commands is executed concurrently, but
//! replies are always written in arrival order, accumulated into one send
//! buffer, and flushed with a single socket write.
//!
//! ## Transactions
//!
//! The handler owns the `MULTI`/`EXEC`/`DISCARD` state machine:
//!
//! ```text
//!            MULTI                EXEC (replies array, queue runs in order)
//! Inactive ────────► Active ────────────────────────► Inactive
//!     ▲                │  other commands: queued, reply +QUEUED
//!     └────────────────┘
//!          DISCARD (queue dropped)
//! ```
//!
//! While a transaction is active every non-control command is queued and
//! acknowledged with `+QUEUED`; `EXEC` replays the queue sequentially and
//! replies with the array of results, individual errors included.

use crate::commands::{command_name_of, CommandHandler};
use crate::protocol::{Parser, Value};
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

/// Maximum size of the inbound buffer (128 KB application buffer)
const MAX_BUFFER_SIZE: usize = 128 * 1024;

/// Initial inbound buffer capacity
const INITIAL_BUFFER_SIZE: usize = 4096;

/// A send that makes no progress for this long closes the connection
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Consecutive protocol errors tolerated before the connection is dropped
const MAX_PROTOCOL_ERRORS: u32 = 4;

/// Statistics for connection handling
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Total number of connections accepted
    pub connections_accepted: AtomicU64,
    /// Currently active connections
    pub active_connections: AtomicU64,
    /// Total commands processed
    pub commands_processed: AtomicU64,
    /// Total bytes read
    pub bytes_read: AtomicU64,
    /// Total bytes written
    pub bytes_written: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn commands_processed(&self, count: u64) {
        self.commands_processed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, count: usize) {
        self.bytes_read.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn bytes_written(&self, count: usize) {
        self.bytes_written
            .fetch_add(count as u64, Ordering::Relaxed);
    }
}

/// Per-connection transaction record.
#[derive(Debug, Default)]
struct Transaction {
    active: bool,
    queue: Vec<Value>,
}

/// Handles a single client connection.
pub struct ConnectionHandler {
    /// The TCP stream for this connection
    stream: BufWriter<TcpStream>,

    /// Client's address (for logging)
    addr: SocketAddr,

    /// Buffer for incoming data, may hold a trailing partial frame
    buffer: BytesMut,

    /// The command handler (shared engine behind it)
    handler: CommandHandler,

    /// RESP parser
    parser: Parser,

    /// MULTI/EXEC/DISCARD state
    txn: Transaction,

    /// Connection statistics (shared)
    stats: Arc<ConnectionStats>,

    /// Server shutdown signal
    shutdown: watch::Receiver<bool>,

    /// Consecutive protocol errors from this client
    protocol_errors: u32,
}

impl ConnectionHandler {
    pub fn new(
        stream: TcpStream,
        addr: SocketAddr,
        handler: CommandHandler,
        stats: Arc<ConnectionStats>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        stats.connection_opened();

        Self {
            stream: BufWriter::new(stream),
            addr,
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            handler,
            parser: Parser::new(),
            txn: Transaction::default(),
            stats,
            shutdown,
            protocol_errors: 0,
        }
    }

    /// Runs the connection to completion.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        info!(client = %self.addr, "client connected");

        let result = self.main_loop().await;

        match &result {
            Ok(()) => info!(client = %self.addr, "client disconnected"),
            Err(ConnectionError::ClientDisconnected) => {
                debug!(client = %self.addr, "client disconnected")
            }
            Err(ConnectionError::Io(io_err))
                if io_err.kind() == std::io::ErrorKind::ConnectionReset =>
            {
                debug!(client = %self.addr, "connection reset by client")
            }
            Err(e) => warn!(client = %self.addr, error = %e, "connection error"),
        }

        self.stats.connection_closed();
        result
    }

    /// The read → parse → execute → reply loop.
    async fn main_loop(&mut self) -> Result<(), ConnectionError> {
        loop {
            match self.parser.parse_all(&self.buffer) {
                Ok((frames, consumed)) => {
                    if consumed > 0 {
                        let _ = self.buffer.split_to(consumed);
                    }
                    if !frames.is_empty() {
                        self.protocol_errors = 0;
                        self.stats.commands_processed(frames.len() as u64);
                        self.process_frames(frames).await?;
                    }
                }
                Err(err) => {
                    // Convert the decode error into a reply, drop the
                    // offending bytes, and keep the connection unless the
                    // client keeps sending garbage.
                    warn!(client = %self.addr, error = %err, "protocol error");
                    self.buffer.clear();
                    self.protocol_errors += 1;
                    let reply = Value::error(format!("ERR protocol error: {}", err));
                    self.write_batch(&reply.serialize()).await?;
                    if self.protocol_errors >= MAX_PROTOCOL_ERRORS {
                        return Err(ConnectionError::TooManyProtocolErrors);
                    }
                }
            }

            self.read_more_data().await?;
        }
    }

    /// Executes one batch of frames and writes their replies in order.
    async fn process_frames(&mut self, frames: Vec<Value>) -> Result<(), ConnectionError> {
        let mut out = Vec::new();

        let sequential = self.txn.active
            || frames.len() == 1
            || frames.iter().any(is_transaction_control);

        if sequential {
            for frame in frames {
                let reply = self.process_one(frame).await;
                reply.serialize_into(&mut out);
            }
        } else {
            // Independent pipelined commands fan out across the shard
            // workers; awaiting the tasks in spawn order keeps the replies
            // in arrival order. The wave size bounds in-flight commands.
            let wave = 2 * num_cpus::get();
            for chunk in frames.chunks(wave) {
                let mut handles = Vec::with_capacity(chunk.len());
                for frame in chunk {
                    let handler = self.handler.clone();
                    let frame = frame.clone();
                    handles.push(tokio::spawn(async move { handler.execute(frame).await }));
                }
                for handle in handles {
                    let reply = handle
                        .await
                        .unwrap_or_else(|_| Value::error("ERR internal error"));
                    reply.serialize_into(&mut out);
                }
            }
        }

        self.write_batch(&out).await
    }

    /// Executes one frame, driving the transaction state machine.
    async fn process_one(&mut self, frame: Value) -> Value {
        let name = frame
            .as_array()
            .and_then(|args| args.first())
            .and_then(command_name_of);

        match name.as_deref() {
            Some("MULTI") => {
                if self.txn.active {
                    Value::error("ERR MULTI calls can not be nested")
                } else {
                    self.txn.active = true;
                    Value::ok()
                }
            }
            Some("EXEC") => {
                if !self.txn.active {
                    Value::error("ERR EXEC without MULTI")
                } else {
                    self.txn.active = false;
                    let queue = std::mem::take(&mut self.txn.queue);
                    trace!(client = %self.addr, queued = queue.len(), "executing transaction");
                    let mut replies = Vec::with_capacity(queue.len());
                    for queued in queue {
                        // Individual failures become error replies in the
                        // array; they do not abort the rest.
                        replies.push(self.handler.execute(queued).await);
                    }
                    Value::Array(replies)
                }
            }
            Some("DISCARD") => {
                if !self.txn.active {
                    Value::error("ERR DISCARD without MULTI")
                } else {
                    self.txn.active = false;
                    self.txn.queue.clear();
                    Value::ok()
                }
            }
            _ if self.txn.active => {
                self.txn.queue.push(frame);
                Value::queued()
            }
            _ => self.handler.execute(frame).await,
        }
    }

    /// Reads more data from the socket into the buffer, or returns when the
    /// server is shutting down.
    async fn read_more_data(&mut self) -> Result<(), ConnectionError> {
        if self.buffer.len() >= MAX_BUFFER_SIZE {
            return Err(ConnectionError::BufferFull);
        }

        if self.buffer.capacity() - self.buffer.len() < 1024 {
            self.buffer.reserve(4096);
        }

        if *self.shutdown.borrow() {
            return Err(ConnectionError::ServerShutdown);
        }

        let n = tokio::select! {
            result = self.stream.get_mut().read_buf(&mut self.buffer) => result?,
            _ = self.shutdown.changed() => {
                debug!(client = %self.addr, "closing connection for shutdown");
                return Err(ConnectionError::ServerShutdown);
            }
        };

        if n == 0 {
            return if self.buffer.is_empty() {
                Err(ConnectionError::ClientDisconnected)
            } else {
                Err(ConnectionError::UnexpectedEof)
            };
        }

        self.stats.bytes_read(n);
        trace!(client = %self.addr, bytes = n, "read data");
        Ok(())
    }

    /// Writes one batch of reply bytes with a single flush.
    async fn write_batch(&mut self, bytes: &[u8]) -> Result<(), ConnectionError> {
        if bytes.is_empty() {
            return Ok(());
        }

        let write = async {
            self.stream.write_all(bytes).await?;
            self.stream.flush().await
        };

        match tokio::time::timeout(WRITE_TIMEOUT, write).await {
            Ok(result) => result?,
            Err(_) => return Err(ConnectionError::WriteTimeout),
        }

        self.stats.bytes_written(bytes.len());
        trace!(client = %self.addr, bytes = bytes.len(), "sent replies");
        Ok(())
    }
}

/// Returns true for frames that drive the transaction state machine.
fn is_transaction_control(frame: &Value) -> bool {
    matches!(
        frame
            .as_array()
            .and_then(|args| args.first())
            .and_then(command_name_of)
            .as_deref(),
        Some("MULTI") | Some("EXEC") | Some("DISCARD")
    )
}

/// Errors that can occur while handling a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// I/O error (network issue)
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Client disconnected normally
    #[error("client disconnected")]
    ClientDisconnected,

    /// Unexpected end of stream (partial command in buffer)
    #[error("unexpected end of stream")]
    UnexpectedEof,

    /// Inbound buffer limit exceeded
    #[error("buffer size limit exceeded")]
    BufferFull,

    /// A reply write made no progress within the timeout
    #[error("send timed out")]
    WriteTimeout,

    /// The client kept sending undecodable bytes
    #[error("too many protocol errors")]
    TooManyProtocolErrors,

    /// The server is shutting down
    #[error("server shutting down")]
    ServerShutdown,
}

/// Handles a client connection to completion.
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    handler: CommandHandler,
    stats: Arc<ConnectionStats>,
    shutdown: watch::Receiver<bool>,
) {
    let connection = ConnectionHandler::new(stream, addr, handler, stats, shutdown);
    if let Err(e) = connection.run().await {
        match e {
            ConnectionError::ClientDisconnected | ConnectionError::ServerShutdown => {}
            ConnectionError::Io(ref io_err)
                if io_err.kind() == std::io::ErrorKind::ConnectionReset => {}
            _ => {
                debug!(client = %addr, error = %e, "connection ended with error");
            }
        }
    }
}

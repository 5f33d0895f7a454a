//! TCP Server
//!
//! Owns the listening socket and the acceptor pool.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Server                               │
//! │                                                             │
//! │   TcpListener (SO_REUSEADDR, 512 KiB buffers, backlog 1024) │
//! │        │                                                    │
//! │        ├── acceptor task 1 ──┐                              │
//! │        ├── acceptor task 2 ──┤  accept(), set TCP_NODELAY,  │
//! │        ├── ...               │  spawn connection handler    │
//! │        └── acceptor task 2×N ┘                              │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! All acceptors share one listener; whichever is free picks up the next
//! client. A fatal accept error makes the acceptor back off briefly and
//! retry rather than die. Shutdown flips a watch channel: acceptors stop
//! taking new sockets and every connection handler's read loop exits.

use crate::commands::CommandHandler;
use crate::config::Config;
use crate::connection::{handle_connection, ConnectionStats};
use crate::storage::Engine;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Kernel socket buffer size for the listener (send and receive).
const SOCKET_BUFFER_SIZE: u32 = 512 * 1024;

/// Listen backlog.
const BACKLOG: u32 = 1024;

/// Back-off after a failed accept before retrying.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// The running server: listener plus acceptor pool.
pub struct Server {
    listener: Arc<TcpListener>,
    engine: Arc<Engine>,
    stats: Arc<ConnectionStats>,
    shutdown_tx: watch::Sender<bool>,
}

impl Server {
    /// Binds the listening socket per the configured port.
    pub fn bind(config: &Config, engine: Arc<Engine>) -> std::io::Result<Self> {
        let addr = config.bind_address().parse().map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("bad bind address: {}", e))
        })?;

        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        socket.set_keepalive(true)?;
        socket.set_send_buffer_size(SOCKET_BUFFER_SIZE)?;
        socket.set_recv_buffer_size(SOCKET_BUFFER_SIZE)?;
        socket.bind(addr)?;
        let listener = socket.listen(BACKLOG)?;

        info!(addr = %addr, "listening");

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            listener: Arc::new(listener),
            engine,
            stats: Arc::new(ConnectionStats::new()),
            shutdown_tx,
        })
    }

    /// The bound local address (useful when the port was 0).
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Shared connection statistics.
    pub fn stats(&self) -> Arc<ConnectionStats> {
        Arc::clone(&self.stats)
    }

    /// A handle that stops the server when flipped.
    pub fn shutdown_handle(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }

    /// Runs the acceptor pool until shutdown is signalled.
    ///
    /// Returns once every acceptor has stopped; open connections observe the
    /// same signal and drain on their own.
    pub async fn run(&self) {
        let pool_size = 2 * num_cpus::get();
        info!(acceptors = pool_size, "acceptor pool starting");

        let mut acceptors = Vec::with_capacity(pool_size);
        for n in 0..pool_size {
            let listener = Arc::clone(&self.listener);
            let engine = Arc::clone(&self.engine);
            let stats = Arc::clone(&self.stats);
            let shutdown_rx = self.shutdown_tx.subscribe();

            acceptors.push(tokio::spawn(accept_loop(
                n,
                listener,
                engine,
                stats,
                shutdown_rx,
            )));
        }

        for acceptor in acceptors {
            let _ = acceptor.await;
        }

        info!("acceptor pool stopped");
    }
}

/// One acceptor worker: accept, tune the socket, hand off to a handler.
async fn accept_loop(
    n: usize,
    listener: Arc<TcpListener>,
    engine: Arc<Engine>,
    stats: Arc<ConnectionStats>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!(client = %addr, error = %e, "failed to set TCP_NODELAY");
                        }

                        let handler = CommandHandler::new(Arc::clone(&engine));
                        let stats = Arc::clone(&stats);
                        let shutdown = shutdown_rx.clone();
                        tokio::spawn(handle_connection(stream, addr, handler, stats, shutdown));
                    }
                    Err(e) => {
                        // Transient resource exhaustion (fd limits, aborted
                        // handshakes); back off and keep accepting.
                        error!(acceptor = n, error = %e, "accept failed, retrying");
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                }
            }
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn start_server() -> (TempDir, std::net::SocketAddr, watch::Sender<bool>) {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(Engine::open(dir.path(), 2).unwrap());

        let config = Config {
            port: 0,
            ..Config::default()
        };
        let server = Server::bind(&config, engine).unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = server.shutdown_handle();

        tokio::spawn(async move { server.run().await });

        (dir, addr, shutdown)
    }

    #[tokio::test]
    async fn test_end_to_end_set_get() {
        let (_dir, addr, _shutdown) = start_server().await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"*3\r\n$3\r\nSET\r\n$4\r\nname\r\n$6\r\nbeetle\r\n")
            .await
            .unwrap();

        let mut buf = [0u8; 64];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"+OK\r\n");

        client
            .write_all(b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n")
            .await
            .unwrap();
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"$6\r\nbeetle\r\n");
    }

    #[tokio::test]
    async fn test_concurrent_clients() {
        let (_dir, addr, _shutdown) = start_server().await;

        let mut tasks = Vec::new();
        for i in 0..8 {
            tasks.push(tokio::spawn(async move {
                let mut client = TcpStream::connect(addr).await.unwrap();
                let set = format!(
                    "*3\r\n$3\r\nSET\r\n$6\r\nclient\r\n$1\r\n{}\r\n",
                    i % 10
                );
                client.write_all(set.as_bytes()).await.unwrap();
                let mut buf = [0u8; 16];
                let n = client.read(&mut buf).await.unwrap();
                assert_eq!(&buf[..n], b"+OK\r\n");
            }));
        }

        for task in tasks {
            task.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_shutdown_stops_accepting() {
        let (_dir, addr, shutdown) = start_server().await;

        // A connected client observes the shutdown as a closed socket.
        let mut client = TcpStream::connect(addr).await.unwrap();
        shutdown.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(Duration::from_secs(1), client.read(&mut buf)).await;
        match read {
            Ok(Ok(0)) => {}     // clean close
            Ok(Ok(_)) => panic!("unexpected data after shutdown"),
            Ok(Err(_)) => {}    // reset is fine too
            Err(_) => panic!("server did not close the connection"),
        }
    }
}

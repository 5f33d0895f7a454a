//! Beetle - A Persistent, Redis-Compatible Key-Value Database
//!
//! This is the main entry point for the beetle server. It loads the
//! configuration, opens the storage engine, starts background maintenance,
//! and serves the RESP protocol until interrupted.

use beetle::config::Config;
use beetle::server::Server;
use beetle::storage::{Engine, Maintenance, MaintenanceConfig};
use std::sync::Arc;
use tokio::signal;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Parsed command line: an optional config file path.
struct Args {
    config_path: Option<String>,
}

impl Args {
    fn parse() -> Self {
        let mut config_path = None;

        for arg in std::env::args().skip(1) {
            match arg.as_str() {
                "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "--version" | "-v" => {
                    println!("beetle version {}", beetle::VERSION);
                    std::process::exit(0);
                }
                flag if flag.starts_with('-') => {
                    eprintln!("Unknown argument: {}", flag);
                    print_help();
                    std::process::exit(1);
                }
                path => {
                    if config_path.replace(path.to_string()).is_some() {
                        eprintln!("Error: more than one config file given");
                        std::process::exit(1);
                    }
                }
            }
        }

        Self { config_path }
    }
}

fn print_help() {
    println!(
        r#"
Beetle - A Persistent, Redis-Compatible Key-Value Database

USAGE:
    beetle [CONFIG_FILE]

ARGS:
    CONFIG_FILE    Optional path to a beetle config file

OPTIONS:
    -v, --version  Print version information
        --help     Print this help message

CONFIG FILE:
    One `key value` pair per line, `#` comments. Recognized keys:
        port                   TCP listen port (default: 6969)
        storage_directory      datafile root (default: ~/.local/share/beetle)
        database_shards        shard count (default: CPU count)
        log_file_size          rotation threshold, e.g. 5MB
        log_rotation_interval  e.g. 30m
        merge_interval         e.g. 30m

CONNECTING:
    Use redis-cli or any Redis client:
    $ redis-cli -p 6969
    127.0.0.1:6969> SET greeting "hello"
    OK
    127.0.0.1:6969> GET greeting
    "hello"
"#
    );
}

fn print_banner(config: &Config) {
    println!(
        r#"
        ▄▄▄▄· ▄▄▄ .▄▄▄ .▄▄▄▄▄▄▄▌  ▄▄▄ .
        ▐█ ▀█▪▀▄.▀·▀▄.▀·•██  ██•  ▀▄.▀·
        ▐█▀▀█▄▐▀▀▪▄▐▀▀▪▄ ▐█.▪██▪  ▐▀▀▪▄
        ██▄▪▐█▐█▄▄▌▐█▄▄▌ ▐█▌·▐█▌▐▌▐█▄▄▌
        ·▀▀▀▀  ▀▀▀  ▀▀▀  ▀▀▀ .▀▀▀  ▀▀▀

beetle v{} - persistent, Redis-compatible key-value store
──────────────────────────────────────────────────────────
Listening on port {} | {} shards | data in {}

Use Ctrl+C to shut down gracefully.
"#,
        beetle::VERSION,
        config.port,
        config.database_shards,
        config.storage_directory.display()
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let _subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    let config = match &args.config_path {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    print_banner(&config);

    // Open every shard before serving; an unreadable data directory should
    // fail startup, not the first request.
    let engine = Arc::new(Engine::open(
        &config.storage_directory,
        config.database_shards,
    )?);

    let maintenance = Maintenance::start(
        Arc::clone(&engine),
        MaintenanceConfig {
            merge_interval: config.merge_interval,
            rotation_interval: config.log_rotation_interval,
            rotation_min_bytes: config.log_file_size,
        },
    );

    let server = Server::bind(&config, Arc::clone(&engine))?;
    let shutdown = server.shutdown_handle();

    tokio::spawn(async move {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        info!("shutdown signal received");
        let _ = shutdown.send(true);
    });

    server.run().await;

    // Stop the ticks before flushing so no merge races the close.
    maintenance.stop();
    engine.shutdown().await;

    info!("server shutdown complete");
    Ok(())
}

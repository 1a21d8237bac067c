use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use reef_relay::cache::PageCache;
use reef_relay::config::{FileConfig, RelayConfig, load_config};
use reef_relay::db::Database;
use reef_relay::dispatcher::Dispatcher;
use reef_relay::notify::LogNotifier;
use reef_relay::observer::LogObserver;
use reef_relay::repository::Repository;
use reef_relay::server::{Relay, RelayHandle};

#[derive(Parser)]
#[command(name = "reefd")]
#[command(about = "Realtime chat relay server")]
struct Cli {
    /// Bind host (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Bind port (overrides config)
    #[arg(long)]
    port: Option<u16>,

    /// Custom data directory (defaults to ~/.reef)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Verbose logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "reef_relay=debug,reef_wire=debug,info"
    } else {
        "reef_relay=info,reef_wire=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let data_dir = cli.data_dir.unwrap_or_else(|| {
        dirs::home_dir()
            .expect("Could not find home directory")
            .join(".reef")
    });

    let mut fc: FileConfig = load_config(&data_dir)
        .extract()
        .context("Invalid configuration")?;
    if let Some(host) = cli.host {
        fc.server.host = host;
    }
    if let Some(port) = cli.port {
        fc.server.port = port;
    }
    let config = RelayConfig::new(Some(data_dir), &fc)?;

    info!("Starting Reef relay");

    let db = Database::new(&config).await?;
    let repository = Repository::new(db.pool.clone());

    // The default room must exist before the first join.
    let mut cache = PageCache::new(config.cache_max_entries);
    repository.ensure_main_room(&mut cache).await?;

    let dispatcher = Dispatcher::new(
        repository,
        cache,
        Box::new(LogNotifier),
        Box::new(LogObserver),
        config.history_page_size,
    );

    let relay = Relay::bind(&config.bind_addr(), dispatcher).await?;
    let handle = relay.handle();

    tokio::spawn(console_loop(handle.clone()));
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        handle.shutdown();
    });

    relay.run().await
}

/// Operator console on stdin: `kick <name>` and `quit`.
async fn console_loop(handle: RelayHandle) {
    use tokio::io::AsyncBufReadExt;

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if let Some(name) = line.strip_prefix("kick ") {
            handle.kick(name.trim());
        } else if line == "quit" {
            handle.shutdown();
            break;
        } else if !line.is_empty() {
            warn!(command = line, "unknown console command");
        }
    }
}

use clap::Parser;
use relaymq::{BrokerConfig, BrokerServer, Result};
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "relaymq")]
#[command(about = "A point-to-point message-queue broker with peer federation")]
struct Args {
    #[arg(long)]
    host: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[arg(long)]
    repository_dir: Option<String>,

    /// Peer brokers as host:port, repeatable
    #[arg(long)]
    peer: Vec<String>,

    #[arg(long)]
    housekeeper_interval_ms: Option<u64>,

    #[arg(long)]
    dead_queue_name: Option<String>,

    /// Reject connects from users missing in the configured user table
    #[arg(long)]
    deny_anonymous: bool,

    /// Start from RELAYMQ_* environment variables instead of defaults
    #[arg(long)]
    from_env: bool,
}

/// Flags that were actually passed win over the base configuration; absent
/// flags leave it alone, so `--from-env` values survive.
fn apply_overrides(mut config: BrokerConfig, args: &Args) -> BrokerConfig {
    if let Some(host) = &args.host {
        config.host = host.clone();
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(dir) = &args.repository_dir {
        config.repository_dir = dir.clone();
    }
    if let Some(interval) = args.housekeeper_interval_ms {
        config.housekeeper_interval_ms = interval;
    }
    if let Some(name) = &args.dead_queue_name {
        config.dead_queue_name = name.clone();
    }
    if !args.peer.is_empty() {
        config.peers = args.peer.clone();
    }
    if args.deny_anonymous {
        config.allow_anonymous = false;
    }
    config
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(parse_log_level(&args.log_level))
        .init();

    let base = if args.from_env {
        BrokerConfig::from_env()?
    } else {
        BrokerConfig::default()
    };
    let config = apply_overrides(base, &args);

    info!("starting relaymq broker on {}:{}", config.host, config.port);
    info!("repository directory: {}", config.repository_dir);
    if config.peers.is_empty() {
        info!("federation: no peers configured");
    } else {
        info!("federation peers: {}", config.peers.join(", "));
    }

    let server = Arc::new(BrokerServer::new(config)?);

    let runner = Arc::clone(&server);
    let handle = tokio::spawn(async move { runner.run().await });

    signal::ctrl_c()
        .await
        .map_err(|e| relaymq::RelayError::Network(format!("signal handler failed: {}", e)))?;
    info!("received interrupt, shutting down");
    server.shutdown();

    match handle.await {
        Ok(result) => result,
        Err(e) => {
            warn!("server task panicked: {}", e);
            Err(relaymq::RelayError::Network(e.to_string()))
        }
    }
}

fn parse_log_level(level: &str) -> tracing::Level {
    match level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    }
}

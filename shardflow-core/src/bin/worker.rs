//! One worker of a TCP group
//!
//! Every process receives the same peer list; its rank picks its own
//! listen address from it. Peers are awaited until they listen unless
//! SHARDFLOW_CONNECT_RETRIES bounds the attempts.

use shardflow_core::comm::{Channel, TcpChannel, TcpConfig};
use shardflow_core::{Processor, ProcessorConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path: PathBuf = std::env::var("SHARDFLOW_CONFIG")
        .map_err(|_| "SHARDFLOW_CONFIG must name a JSON run configuration")?
        .into();
    let rank: u32 = std::env::var("SHARDFLOW_RANK")
        .map_err(|_| "SHARDFLOW_RANK is required")?
        .parse()?;
    let peers = std::env::var("SHARDFLOW_PEERS")
        .map_err(|_| "SHARDFLOW_PEERS must list every worker address, comma separated")?
        .split(',')
        .map(|addr| addr.trim().parse::<SocketAddr>())
        .collect::<Result<Vec<_>, _>>()?;

    let connect_retries: u32 = match std::env::var("SHARDFLOW_CONNECT_RETRIES") {
        Ok(v) => v.parse()?,
        Err(_) => 0,
    };
    let connect_backoff_ms: u64 = match std::env::var("SHARDFLOW_CONNECT_BACKOFF_MS") {
        Ok(v) => v.parse()?,
        Err(_) => 100,
    };

    let config = ProcessorConfig::from_json_file(&config_path)?;
    let processor = Processor::from_config(config)?;
    processor.check()?;

    info!("Starting worker {} of {}", rank, peers.len());
    let tcp = TcpConfig::new(rank, peers)
        .with_connect(connect_retries, Duration::from_millis(connect_backoff_ms));
    let channel: Arc<dyn Channel> = Arc::new(TcpChannel::bind(tcp).await?);

    match processor.run(channel).await {
        Ok(report) => {
            info!(
                "Worker {}: {} owned, {} processed, {} failed, {} buffered",
                report.rank, report.owned, report.processed, report.failed, report.buffered
            );
            print!("{}", report.metrics.to_prometheus());
            Ok(())
        }
        Err(e) => {
            error!("Worker {} failed: {}", rank, e);
            Err(e.into())
        }
    }
}

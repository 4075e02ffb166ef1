//! Single-process runner: every worker is a task over an in-process group

use shardflow_core::comm::{Channel, LocalGroup};
use shardflow_core::{Processor, ProcessorConfig};
use std::path::PathBuf;
use std::sync::Arc;
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
    let workers: u32 = std::env::var("SHARDFLOW_WORKERS")
        .unwrap_or_else(|_| "4".into())
        .parse()?;
    if workers == 0 {
        return Err("SHARDFLOW_WORKERS must be at least 1".into());
    }

    let config = ProcessorConfig::from_json_file(&config_path)?;
    let processor = Arc::new(Processor::from_config(config)?);
    processor.check()?;

    info!("Starting {} local workers", workers);

    let mut handles = Vec::with_capacity(workers as usize);
    for channel in LocalGroup::channels(workers) {
        let processor = processor.clone();
        let channel: Arc<dyn Channel> = Arc::new(channel);
        handles.push(tokio::spawn(async move { processor.run(channel).await }));
    }

    let mut failed = false;
    for handle in handles {
        match handle.await? {
            Ok(report) => info!(
                "Worker {}: {} owned, {} processed, {} failed, {} buffered",
                report.rank, report.owned, report.processed, report.failed, report.buffered
            ),
            Err(e) => {
                error!("Worker failed: {}", e);
                failed = true;
            }
        }
    }

    if failed {
        return Err("one or more workers failed".into());
    }
    Ok(())
}

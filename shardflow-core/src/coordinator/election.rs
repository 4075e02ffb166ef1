//! Write-manager election
//!
//! The default primitive is a lock marker next to the sink: the first
//! worker to find it missing creates it stamped with its rank, everyone
//! then reads the first stamped rank back.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::LockConfig;
use crate::error::{Result, ShardflowError};

/// Mutual-exclusion primitive naming the write manager
#[async_trait]
pub trait Election: Send + Sync {
    /// Return the rank of the manager, as seen by `rank`
    async fn elect(&self, rank: u32) -> Result<u32>;

    /// Tear the primitive down. Called by the manager only, after every
    /// worker has written.
    async fn release(&self) -> Result<()>;
}

/// Lock-marker file election
#[derive(Debug, Clone)]
pub struct LockFileElection {
    path: PathBuf,
    retries: u32,
    backoff: Duration,
}

impl LockFileElection {
    /// Create an election over the marker at `path`
    pub fn new(path: impl Into<PathBuf>, config: &LockConfig) -> Self {
        Self {
            path: path.into(),
            retries: config.retries.max(1),
            backoff: config.backoff(),
        }
    }

    /// Marker path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove a stale marker left by an earlier run
    pub async fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path).await {
            Ok(()) => {
                debug!("Removed stale lock marker {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn stamp(&self, rank: u32) -> Result<()> {
        if fs::try_exists(&self.path).await? {
            return Ok(());
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(format!("{} ", rank).as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn read_manager(&self) -> std::result::Result<u32, String> {
        let text = fs::read_to_string(&self.path)
            .await
            .map_err(|e| e.to_string())?;
        let first = text
            .split_whitespace()
            .next()
            .ok_or_else(|| "lock marker is empty".to_string())?;
        first
            .parse::<u32>()
            .map_err(|e| format!("bad rank {:?}: {}", first, e))
    }
}

#[async_trait]
impl Election for LockFileElection {
    async fn elect(&self, rank: u32) -> Result<u32> {
        self.stamp(rank).await?;

        let mut last_error = String::new();
        for attempt in 1..=self.retries {
            match self.read_manager().await {
                Ok(manager) => {
                    debug!("Worker {} sees manager {}", rank, manager);
                    return Ok(manager);
                }
                Err(reason) => {
                    warn!(
                        "Worker {} lock read attempt {}/{} on {} failed: {}",
                        rank,
                        attempt,
                        self.retries,
                        self.path.display(),
                        reason
                    );
                    last_error = reason;
                    if attempt < self.retries {
                        tokio::time::sleep(self.backoff).await;
                    }
                }
            }
        }

        Err(ShardflowError::Election {
            path: self.path.display().to_string(),
            attempts: self.retries,
            reason: last_error,
        })
    }

    async fn release(&self) -> Result<()> {
        self.clear().await?;
        info!("Released lock marker {}", self.path.display());
        Ok(())
    }
}

/// Election with a preassigned manager
#[derive(Debug, Clone, Copy)]
pub struct FixedElection(pub u32);

#[async_trait]
impl Election for FixedElection {
    async fn elect(&self, _rank: u32) -> Result<u32> {
        Ok(self.0)
    }

    async fn release(&self) -> Result<()> {
        Ok(())
    }
}

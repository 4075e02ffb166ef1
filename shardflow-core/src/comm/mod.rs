//! Point-to-point message channel between the workers of a group
//!
//! Token messages carry only a worker identity. Broadcast values travel as
//! JSON bytes.

pub mod local;
pub mod tcp;

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, ShardflowError};

pub use local::{LocalChannel, LocalGroup};
pub use tcp::{TcpChannel, TcpConfig};

/// Message channel of one worker
#[async_trait]
pub trait Channel: Send + Sync {
    /// Identity of this worker, `0..size`
    fn rank(&self) -> u32;

    /// Number of workers in the group
    fn size(&self) -> u32;

    /// Send a worker identity to `to`
    async fn send(&self, to: u32, payload: u32) -> Result<()>;

    /// Block until a message arrives from any worker
    async fn receive(&self) -> Result<(u32, u32)>;

    /// Distribute `value` from `root` to every worker. Only the root passes
    /// `Some`.
    async fn broadcast_bytes(&self, value: Option<Bytes>, root: u32) -> Result<Bytes>;

    /// Block until every worker has entered the barrier
    async fn barrier(&self) -> Result<()>;
}

/// Typed broadcast over `broadcast_bytes`
pub async fn broadcast<T>(channel: &dyn Channel, value: Option<&T>, root: u32) -> Result<T>
where
    T: Serialize + DeserializeOwned,
{
    let encoded = match value {
        Some(v) if channel.rank() == root => Some(Bytes::from(serde_json::to_vec(v)?)),
        None if channel.rank() == root => {
            return Err(ShardflowError::InvalidMessage {
                reason: format!("broadcast root {} has no value", root),
            })
        }
        _ => None,
    };

    let bytes = channel.broadcast_bytes(encoded, root).await?;
    serde_json::from_slice(&bytes).map_err(|e| ShardflowError::InvalidMessage {
        reason: format!("broadcast payload: {}", e),
    })
}

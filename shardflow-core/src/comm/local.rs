//! In-process worker group
//!
//! Every worker is a task in the same runtime. Token messages and
//! broadcasts travel over unbounded mpsc queues, one inbox per worker.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{mpsc, Barrier, Mutex};

use super::Channel;
use crate::error::{Result, ShardflowError};

/// Factory for the channels of an in-process group
pub struct LocalGroup;

impl LocalGroup {
    /// Create `size` connected channels, indexed by rank
    pub fn channels(size: u32) -> Vec<LocalChannel> {
        let mut token_tx = Vec::with_capacity(size as usize);
        let mut token_rx = Vec::with_capacity(size as usize);
        let mut bcast_tx = Vec::with_capacity(size as usize);
        let mut bcast_rx = Vec::with_capacity(size as usize);

        for _ in 0..size {
            let (tx, rx) = mpsc::unbounded_channel();
            token_tx.push(tx);
            token_rx.push(rx);
            let (tx, rx) = mpsc::unbounded_channel();
            bcast_tx.push(tx);
            bcast_rx.push(rx);
        }

        let token_tx = Arc::new(token_tx);
        let bcast_tx = Arc::new(bcast_tx);
        let barrier = Arc::new(Barrier::new(size.max(1) as usize));

        token_rx
            .into_iter()
            .zip(bcast_rx)
            .enumerate()
            .map(|(rank, (tokens, broadcasts))| LocalChannel {
                rank: rank as u32,
                size,
                token_tx: token_tx.clone(),
                tokens: Mutex::new(tokens),
                bcast_tx: bcast_tx.clone(),
                broadcasts: Mutex::new(broadcasts),
                barrier: barrier.clone(),
            })
            .collect()
    }
}

/// Channel of one in-process worker
pub struct LocalChannel {
    rank: u32,
    size: u32,
    token_tx: Arc<Vec<mpsc::UnboundedSender<(u32, u32)>>>,
    tokens: Mutex<mpsc::UnboundedReceiver<(u32, u32)>>,
    bcast_tx: Arc<Vec<mpsc::UnboundedSender<Bytes>>>,
    broadcasts: Mutex<mpsc::UnboundedReceiver<Bytes>>,
    barrier: Arc<Barrier>,
}

impl LocalChannel {
    fn closed(&self, peer: u32) -> ShardflowError {
        ShardflowError::Channel {
            peer,
            reason: "in-process channel closed".into(),
        }
    }
}

#[async_trait]
impl Channel for LocalChannel {
    fn rank(&self) -> u32 {
        self.rank
    }

    fn size(&self) -> u32 {
        self.size
    }

    async fn send(&self, to: u32, payload: u32) -> Result<()> {
        let tx = self
            .token_tx
            .get(to as usize)
            .ok_or_else(|| ShardflowError::Channel {
                peer: to,
                reason: format!("no such worker in a group of {}", self.size),
            })?;
        tx.send((self.rank, payload)).map_err(|_| self.closed(to))
    }

    async fn receive(&self) -> Result<(u32, u32)> {
        self.tokens
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| self.closed(self.rank))
    }

    async fn broadcast_bytes(&self, value: Option<Bytes>, root: u32) -> Result<Bytes> {
        if self.rank == root {
            let value = value.ok_or_else(|| ShardflowError::InvalidMessage {
                reason: format!("broadcast root {} has no value", root),
            })?;
            for (peer, tx) in self.bcast_tx.iter().enumerate() {
                if peer as u32 != root {
                    tx.send(value.clone()).map_err(|_| self.closed(peer as u32))?;
                }
            }
            return Ok(value);
        }

        self.broadcasts
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| self.closed(root))
    }

    async fn barrier(&self) -> Result<()> {
        self.barrier.wait().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::broadcast;

    #[tokio::test]
    async fn test_send_receive() {
        let mut channels = LocalGroup::channels(2);
        let b = channels.pop().unwrap();
        let a = channels.pop().unwrap();

        a.send(1, 0).await.unwrap();
        assert_eq!(b.receive().await.unwrap(), (0, 0));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all() {
        let channels: Vec<Arc<LocalChannel>> =
            LocalGroup::channels(4).into_iter().map(Arc::new).collect();

        let mut handles = Vec::new();
        for channel in channels {
            handles.push(tokio::spawn(async move {
                let value = vec!["a".to_string(), "b".to_string()];
                let sent = (channel.rank() == 0).then_some(&value);
                broadcast::<Vec<String>>(channel.as_ref(), sent, 0).await.unwrap()
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), vec!["a", "b"]);
        }
    }
}

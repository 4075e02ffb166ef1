//! Single-writer sink protocol
//!
//! One worker is elected manager and flushes first. Every other worker
//! asks the manager for the token, flushes while holding it and hands it
//! back. Grants go out in request order. A failed flush is held until the
//! closing barrier so the rest of the group still gets its turn.

use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::election::Election;
use super::token::{TokenEvent, TokenLedger};
use crate::comm::Channel;
use crate::error::{Result, ShardflowError};

/// Channel plus group facts shared by every phase of a run
#[derive(Clone)]
pub struct CoordinationContext {
    channel: Arc<dyn Channel>,
}

impl CoordinationContext {
    pub fn new(channel: Arc<dyn Channel>) -> Self {
        Self { channel }
    }

    pub fn rank(&self) -> u32 {
        self.channel.rank()
    }

    pub fn size(&self) -> u32 {
        self.channel.size()
    }

    pub fn channel(&self) -> &dyn Channel {
        self.channel.as_ref()
    }
}

/// Result of a completed write phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    pub manager: u32,
    pub was_manager: bool,
}

/// Drives one worker through the token protocol
pub struct WriteCoordinator {
    context: CoordinationContext,
    election: Box<dyn Election>,
}

impl WriteCoordinator {
    pub fn new(context: CoordinationContext, election: Box<dyn Election>) -> Self {
        Self { context, election }
    }

    pub fn context(&self) -> &CoordinationContext {
        &self.context
    }

    /// Run `flush` once while holding the token, then wait for the group.
    ///
    /// Every worker of the group must call this exactly once. A flush error
    /// is returned as [`ShardflowError::Flush`] only after the barrier.
    pub async fn write<F, Fut>(&self, flush: F) -> Result<WriteOutcome>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<()>> + Send,
    {
        let rank = self.context.rank();
        let manager = self.election.elect(rank).await?;
        if manager >= self.context.size() {
            return Err(ShardflowError::Protocol {
                rank,
                reason: format!(
                    "elected manager {} outside group of {}",
                    manager,
                    self.context.size()
                ),
            });
        }

        let was_manager = manager == rank;
        let deferred = if was_manager {
            self.run_manager(flush).await?
        } else {
            self.run_member(manager, flush).await?
        };

        self.context.channel().barrier().await?;

        match deferred {
            Some(source) => {
                error!("Worker {} flush failed: {}", rank, source);
                Err(ShardflowError::Flush {
                    rank,
                    source: Box::new(source),
                })
            }
            None => Ok(WriteOutcome {
                manager,
                was_manager,
            }),
        }
    }

    async fn run_manager<F, Fut>(&self, flush: F) -> Result<Option<ShardflowError>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let rank = self.context.rank();
        let channel = self.context.channel();
        info!("Worker {} is write manager for {} workers", rank, self.context.size());

        let deferred = flush().await.err();

        let mut ledger = TokenLedger::new(rank, self.context.size());
        while !ledger.is_finished() {
            let (from, payload) = channel.receive().await?;
            if payload != from {
                return Err(ShardflowError::Protocol {
                    rank,
                    reason: format!("worker {} sent identity {}", from, payload),
                });
            }

            match ledger.on_message(from)? {
                TokenEvent::Granted(to) => {
                    debug!("Granting token to {}", to);
                    channel.send(to, to).await?;
                }
                TokenEvent::Queued(who) => {
                    debug!("Worker {} queued behind {:?}", who, ledger.holder());
                }
                TokenEvent::Completed { rank: done, next } => {
                    debug!(
                        "Worker {} finished writing ({}/{})",
                        done,
                        ledger.completed(),
                        self.context.size()
                    );
                    if let Some(to) = next {
                        debug!("Granting token to {}", to);
                        channel.send(to, to).await?;
                    }
                }
            }
        }

        if let Err(e) = self.election.release().await {
            warn!("Worker {} could not release election: {}", rank, e);
        }

        Ok(deferred)
    }

    async fn run_member<F, Fut>(&self, manager: u32, flush: F) -> Result<Option<ShardflowError>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let rank = self.context.rank();
        let channel = self.context.channel();

        channel.send(manager, rank).await?;
        let (from, payload) = channel.receive().await?;
        if from != manager || payload != rank {
            return Err(ShardflowError::Protocol {
                rank,
                reason: format!(
                    "expected grant from {}, got {} from {}",
                    manager, payload, from
                ),
            });
        }

        debug!("Worker {} holds the token", rank);
        let deferred = flush().await.err();
        channel.send(manager, rank).await?;

        Ok(deferred)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::LocalGroup;
    use crate::coordinator::FixedElection;

    #[tokio::test]
    async fn test_single_worker_writes() {
        let channel: Arc<dyn Channel> = Arc::new(LocalGroup::channels(1).remove(0));
        let writer = WriteCoordinator::new(
            CoordinationContext::new(channel),
            Box::new(FixedElection(0)),
        );

        let outcome = writer.write(|| async { Ok(()) }).await.unwrap();
        assert!(outcome.was_manager);
    }

    #[tokio::test]
    async fn test_failed_flush_is_deferred() {
        let mut handles = Vec::new();
        for channel in LocalGroup::channels(3) {
            let channel: Arc<dyn Channel> = Arc::new(channel);
            handles.push(tokio::spawn(async move {
                let rank = channel.rank();
                let writer = WriteCoordinator::new(
                    CoordinationContext::new(channel),
                    Box::new(FixedElection(0)),
                );
                writer
                    .write(|| async move {
                        if rank == 1 {
                            Err(ShardflowError::Sink {
                                path: "out.json".into(),
                                reason: "disk full".into(),
                            })
                        } else {
                            Ok(())
                        }
                    })
                    .await
            }));
        }

        let results: Vec<_> = futures_join(handles).await;
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(ShardflowError::Flush { rank: 1, .. })));
        assert!(results[2].is_ok());
    }

    async fn futures_join(
        handles: Vec<tokio::task::JoinHandle<Result<WriteOutcome>>>,
    ) -> Vec<Result<WriteOutcome>> {
        let mut out = Vec::new();
        for handle in handles {
            out.push(handle.await.unwrap());
        }
        out
    }
}

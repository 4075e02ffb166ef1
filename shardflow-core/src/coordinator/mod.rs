//! Coordination of a worker group
//!
//! Key partitioning, manager election and the write-token protocol that
//! keeps the shared sink single-writer.

pub mod election;
pub mod partitioner;
pub mod token;
pub mod writer;

pub use election::{Election, FixedElection, LockFileElection};
pub use partitioner::{KeyAssigner, KeyEntry, KeySet};
pub use token::{TokenEvent, TokenLedger};
pub use writer::{CoordinationContext, WriteCoordinator, WriteOutcome};

//! Shardflow Core - distributed keyed processing with a single-writer sink
//!
//! This crate coordinates a fixed group of workers that:
//! - Partition complete work keys round-robin without a broker
//! - Resolve per-key inputs lazily through accessors
//! - Serialize sink writes through an elected manager and a write token

pub mod comm;
pub mod config;
pub mod coordinator;
pub mod data;
pub mod error;
pub mod metrics;
pub mod processor;
pub mod store;

pub use config::{Mode, ModeSpec, OnError, ProcessorConfig};
pub use error::{Result, ShardflowError};
pub use processor::{Processor, RunReport};

/// Suffix of the lock marker next to the sink
pub const DEFAULT_LOCK_SUFFIX: &str = ".lock";

/// Output tag used when neither an output nor an input tag is known
pub const DEFAULT_OUTPUT_TAG: &str = "processed";

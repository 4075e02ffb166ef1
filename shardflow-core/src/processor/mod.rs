//! Per-worker processing
//!
//! Transform plumbing, the output buffer and the engine driving a run.

pub mod buffer;
pub mod builtin;
pub mod engine;
pub mod output;

pub use buffer::{FlushStats, OutputBuffer};
pub use engine::{ErrorCallback, Processor, RunReport};
pub use output::{
    normalize, transform, OutputItem, OutputValue, Transform, TransformInput, TransformOutput,
};

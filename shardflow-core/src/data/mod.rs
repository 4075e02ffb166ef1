//! Input side of a run
//!
//! Record types, lazy accessors and per-source key enumeration.

pub mod accessor;
pub mod keys;
pub mod record;

pub use accessor::Accessor;
pub use keys::{KeyResolver, SourceTagMap};
pub use record::{
    AuxiliaryRecord, MetadataRecord, Parameters, Scalar, SeriesCollection, SeriesItem, Target,
};

/// Identifier of one unit of work, shared by every source
pub type WorkKey = String;

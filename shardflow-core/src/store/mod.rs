//! Source and sink capability interfaces
//!
//! The container format lives behind these traits. `JsonStore` is the
//! bundled implementation.

pub mod json;

use std::path::Path;
use std::sync::Arc;

use crate::data::{AuxiliaryRecord, MetadataRecord, Parameters, SeriesCollection, SeriesItem};
use crate::error::Result;

pub use json::{Document, JsonDataset, JsonSinkWriter, JsonStore};

/// Read-only handle to one opened source
pub trait DataSource: Send + Sync {
    /// Path the source was opened from
    fn path(&self) -> &Path;

    /// Auxiliary group tags, in the store's order
    fn auxiliary_tags(&self) -> Result<Vec<String>>;

    /// Paths of the auxiliary records under a group tag
    fn auxiliary_paths(&self, tag: &str) -> Result<Vec<String>>;

    /// Unit keys, in the store's order
    fn units(&self) -> Result<Vec<String>>;

    /// Series tags available for a unit
    fn series_tags(&self, unit: &str) -> Result<Vec<String>>;

    /// Components stored for a unit under a tag
    fn components(&self, unit: &str, tag: &str) -> Result<Vec<String>>;

    /// All items of a unit under a tag
    fn collection(&self, tag: &str, unit: &str) -> Result<SeriesCollection>;

    /// One auxiliary record
    fn auxiliary(&self, tag: &str, path: &str) -> Result<AuxiliaryRecord>;

    /// Inventory attached to a unit
    fn inventory(&self, unit: &str) -> Result<Option<MetadataRecord>>;

    /// Event metadata attached to the source
    fn events(&self) -> Result<Vec<MetadataRecord>>;
}

/// Opens sources
pub trait SourceStore: Send + Sync {
    fn open(&self, path: &Path) -> Result<Arc<dyn DataSource>>;
}

/// Creates and appends to sinks
pub trait SinkStore: Send + Sync {
    /// Replace whatever is at `path` with an empty sink holding `events`
    fn create(&self, path: &Path, events: &[MetadataRecord]) -> Result<()>;

    /// Open an existing (or new) sink for append
    fn open_append(&self, path: &Path) -> Result<Box<dyn SinkWriter>>;
}

/// Append handle to a sink. Nothing is visible until `close` succeeds.
pub trait SinkWriter: Send {
    fn write_series(&mut self, item: &SeriesItem, tag: &str) -> Result<()>;

    fn write_auxiliary(
        &mut self,
        data: &[f64],
        tag: &str,
        path: &str,
        parameters: &Parameters,
    ) -> Result<()>;

    fn write_metadata(&mut self, record: &MetadataRecord, subject: &str) -> Result<()>;

    fn close(self: Box<Self>) -> Result<()>;
}

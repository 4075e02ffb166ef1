//! Per-worker staging area for output not yet written to the sink

use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

use super::output::OutputItem;
use crate::data::{AuxiliaryRecord, MetadataRecord, SeriesItem};
use crate::error::Result;
use crate::store::SinkStore;

/// Counts written by one flush
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub series: usize,
    pub auxiliary: usize,
    pub metadata: usize,
}

impl FlushStats {
    pub fn total(&self) -> usize {
        self.series + self.auxiliary + self.metadata
    }
}

/// Buffered output of one worker
#[derive(Debug, Default)]
pub struct OutputBuffer {
    /// Series items with their tag, in buffered order
    series: Vec<(SeriesItem, String)>,
    /// Output path -> record and tag
    auxiliary: BTreeMap<String, (AuxiliaryRecord, String)>,
    /// Subject -> record
    metadata: BTreeMap<String, MetadataRecord>,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage one normalized item under `tag`
    pub fn add(&mut self, id: &str, item: OutputItem, tag: &str) {
        match item {
            OutputItem::Item(item) => self.series.push((item, tag.to_string())),
            OutputItem::Collection(collection) => self
                .series
                .extend(collection.items.into_iter().map(|i| (i, tag.to_string()))),
            OutputItem::Auxiliary(record) => {
                if self
                    .auxiliary
                    .insert(id.to_string(), (record, tag.to_string()))
                    .is_some()
                {
                    debug!("Output path {} buffered twice, keeping the latest", id);
                }
            }
            OutputItem::Metadata(record) => self.add_metadata(id, record),
        }
    }

    /// Stage a metadata record for `subject`
    pub fn add_metadata(&mut self, subject: &str, record: MetadataRecord) {
        self.metadata.insert(subject.to_string(), record);
    }

    /// Number of staged entries
    pub fn len(&self) -> usize {
        self.series.len() + self.auxiliary.len() + self.metadata.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop everything staged
    pub fn clear(&mut self) {
        self.series.clear();
        self.auxiliary.clear();
        self.metadata.clear();
    }

    /// Write everything to the sink at `path` in one append session.
    ///
    /// The buffer is empty afterwards whether or not the write succeeded.
    pub fn flush(&mut self, store: &dyn SinkStore, path: &Path) -> Result<FlushStats> {
        let series = std::mem::take(&mut self.series);
        let auxiliary = std::mem::take(&mut self.auxiliary);
        let metadata = std::mem::take(&mut self.metadata);

        let stats = FlushStats {
            series: series.len(),
            auxiliary: auxiliary.len(),
            metadata: metadata.len(),
        };

        let mut writer = store.open_append(path)?;
        for (item, tag) in &series {
            writer.write_series(item, tag)?;
        }
        for (output_path, (record, tag)) in &auxiliary {
            writer.write_auxiliary(record.data(), tag, output_path, record.parameters())?;
        }
        for (subject, record) in &metadata {
            writer.write_metadata(record, subject)?;
        }
        writer.close()?;

        debug!(
            "Flushed {} series, {} auxiliary, {} metadata into {}",
            stats.series,
            stats.auxiliary,
            stats.metadata,
            path.display()
        );
        Ok(stats)
    }
}

//! Lazy per-key accessors
//!
//! An accessor binds an opened source to a (mode, tag, key) triple and
//! resolves the addressed object only when asked.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use super::record::{
    AuxiliaryRecord, MetadataRecord, Parameters, SeriesCollection, SeriesItem, Target,
};
use super::WorkKey;
use crate::config::Mode;
use crate::error::{Result, ShardflowError};
use crate::store::DataSource;

/// Lazy resolver for one key on one source
#[derive(Clone)]
pub struct Accessor {
    source: Arc<dyn DataSource>,
    mode: Mode,
    tag: String,
    key: WorkKey,
    /// Every accessor of the run for the same source index. Read-only.
    fellows: Option<Arc<Vec<Accessor>>>,
}

impl Accessor {
    /// Create an accessor without fellows
    pub fn new(
        source: Arc<dyn DataSource>,
        mode: Mode,
        tag: impl Into<String>,
        key: impl Into<WorkKey>,
    ) -> Self {
        Self {
            source,
            mode,
            tag: tag.into(),
            key: key.into(),
            fellows: None,
        }
    }

    /// Attach the shared fellows list
    pub fn with_fellows(mut self, fellows: Arc<Vec<Accessor>>) -> Self {
        self.fellows = Some(fellows);
        self
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Path of the underlying source
    pub fn source_path(&self) -> &Path {
        self.source.path()
    }

    /// Accessors of every key on the same source, empty unless pairwise
    pub fn fellows(&self) -> &[Accessor] {
        self.fellows.as_deref().map(Vec::as_slice).unwrap_or(&[])
    }

    /// Unit key for series modes
    pub fn unit(&self) -> Option<&str> {
        match self.mode {
            Mode::SeriesCollection => Some(self.key.as_str()),
            Mode::SeriesItem => Some(
                split_item_key(&self.key)
                    .map(|(unit, _)| unit)
                    .unwrap_or(self.key.as_str()),
            ),
            Mode::AuxiliaryItem | Mode::AuxiliaryGroup => None,
        }
    }

    /// Resolve the object this accessor points to
    pub fn target(&self) -> Result<Target> {
        match self.mode {
            Mode::SeriesItem => self.resolve_item().map(Target::Item),
            Mode::SeriesCollection => self.resolve_collection().map(Target::Collection),
            Mode::AuxiliaryItem => self.resolve_auxiliary().map(Target::Auxiliary),
            Mode::AuxiliaryGroup => self.resolve_group().map(Target::AuxiliaryGroup),
        }
    }

    /// Collection of the unit (series modes only)
    pub fn collection(&self) -> Result<Option<SeriesCollection>> {
        if !self.mode.is_series() {
            return Ok(None);
        }
        self.resolve_collection().map(Some)
    }

    /// Single item (item mode only)
    pub fn item(&self) -> Result<Option<SeriesItem>> {
        if self.mode != Mode::SeriesItem {
            return Ok(None);
        }
        self.resolve_item().map(Some)
    }

    /// Auxiliary record (auxiliary item mode only)
    pub fn auxiliary(&self) -> Result<Option<AuxiliaryRecord>> {
        if self.mode != Mode::AuxiliaryItem {
            return Ok(None);
        }
        self.resolve_auxiliary().map(Some)
    }

    /// Auxiliary group members (auxiliary group mode only)
    pub fn auxiliary_group(&self) -> Result<Option<BTreeMap<String, AuxiliaryRecord>>> {
        if self.mode != Mode::AuxiliaryGroup {
            return Ok(None);
        }
        self.resolve_group().map(Some)
    }

    /// Raw array for item and auxiliary modes
    pub fn data(&self) -> Result<Option<Vec<f64>>> {
        Ok(match self.mode {
            Mode::SeriesItem => Some(self.resolve_item()?.data),
            Mode::AuxiliaryItem => Some(self.resolve_auxiliary()?.into_parts().0),
            Mode::SeriesCollection | Mode::AuxiliaryGroup => None,
        })
    }

    /// Parameters of an auxiliary record, empty otherwise
    pub fn parameters(&self) -> Result<Parameters> {
        match self.mode {
            Mode::AuxiliaryItem => Ok(self.resolve_auxiliary()?.into_parts().1),
            _ => Ok(Parameters::new()),
        }
    }

    /// Inventory of the unit (series modes only)
    pub fn inventory(&self) -> Result<Option<MetadataRecord>> {
        match self.unit() {
            Some(unit) => self.source.inventory(unit),
            None => Ok(None),
        }
    }

    /// Events attached to the source
    pub fn events(&self) -> Result<Vec<MetadataRecord>> {
        self.source.events()
    }

    fn resolve_collection(&self) -> Result<SeriesCollection> {
        let unit = self.unit().unwrap_or(self.key.as_str());
        self.source.collection(&self.tag, unit)
    }

    fn resolve_item(&self) -> Result<SeriesItem> {
        let (unit, component) =
            split_item_key(&self.key).ok_or_else(|| ShardflowError::KeyNotFound {
                tag: self.tag.clone(),
                key: self.key.clone(),
            })?;

        self.source
            .collection(&self.tag, unit)?
            .select(component)
            .cloned()
            .ok_or_else(|| ShardflowError::KeyNotFound {
                tag: self.tag.clone(),
                key: self.key.clone(),
            })
    }

    fn resolve_auxiliary(&self) -> Result<AuxiliaryRecord> {
        self.source.auxiliary(&self.tag, &self.key)
    }

    fn resolve_group(&self) -> Result<BTreeMap<String, AuxiliaryRecord>> {
        let prefix = format!("{}_", self.key);
        let mut members = BTreeMap::new();

        for path in self.source.auxiliary_paths(&self.tag)? {
            if let Some(member) = path.strip_prefix(&prefix) {
                if !member.is_empty() && !member.contains('_') {
                    let record = self.source.auxiliary(&self.tag, &path)?;
                    members.insert(member.to_string(), record);
                }
            }
        }

        if members.is_empty() {
            return Err(ShardflowError::KeyNotFound {
                tag: self.tag.clone(),
                key: self.key.clone(),
            });
        }
        Ok(members)
    }
}

impl fmt::Debug for Accessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Accessor")
            .field("source", &self.source.path())
            .field("mode", &self.mode)
            .field("tag", &self.tag)
            .field("key", &self.key)
            .field("fellows", &self.fellows().len())
            .finish()
    }
}

/// Split "{unit}_{component}" at the last separator
pub fn split_item_key(key: &str) -> Option<(&str, &str)> {
    key.rsplit_once('_').filter(|(u, c)| !u.is_empty() && !c.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_item_key() {
        assert_eq!(split_item_key("II_BFO_Z"), Some(("II_BFO", "Z")));
        assert_eq!(split_item_key("BFO"), None);
        assert_eq!(split_item_key("BFO_"), None);
    }
}

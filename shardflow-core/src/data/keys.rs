//! Work key enumeration for one source
//!
//! Produces the keys visible on a source and the tag each key is read
//! under. Output order is sorted, never the store's native order.

use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use super::accessor::split_item_key;
use super::WorkKey;
use crate::config::Mode;
use crate::error::{Result, ShardflowError};
use crate::store::DataSource;

/// Key -> tag for one source
pub type SourceTagMap = BTreeMap<WorkKey, String>;

/// Enumerates work keys on a source for one mode
#[derive(Debug, Clone)]
pub struct KeyResolver {
    mode: Mode,
    /// Explicit tag, `None` for the first available
    input_tag: Option<String>,
}

impl KeyResolver {
    /// Create a resolver
    pub fn new(mode: Mode, input_tag: Option<String>) -> Self {
        Self { mode, input_tag }
    }

    /// Build the key -> tag map for a source
    pub fn resolve(&self, source: &dyn DataSource) -> Result<SourceTagMap> {
        let keys = match self.mode {
            Mode::AuxiliaryItem => self.auxiliary_items(source)?,
            Mode::AuxiliaryGroup => self.auxiliary_groups(source)?,
            Mode::SeriesItem | Mode::SeriesCollection => self.series(source)?,
        };

        debug!(
            "Resolved {} {} keys on {}",
            keys.len(),
            self.mode.as_str(),
            source.path().display()
        );
        Ok(keys)
    }

    fn auxiliary_tag(&self, source: &dyn DataSource) -> Result<String> {
        if let Some(tag) = &self.input_tag {
            return Ok(tag.clone());
        }

        source
            .auxiliary_tags()?
            .into_iter()
            .min()
            .ok_or_else(|| ShardflowError::TagNotFound {
                path: source.path().display().to_string(),
                tag: "<first available>".into(),
            })
    }

    fn auxiliary_items(&self, source: &dyn DataSource) -> Result<SourceTagMap> {
        let tag = self.auxiliary_tag(source)?;
        Ok(source
            .auxiliary_paths(&tag)?
            .into_iter()
            .map(|path| (path, tag.clone()))
            .collect())
    }

    fn auxiliary_groups(&self, source: &dyn DataSource) -> Result<SourceTagMap> {
        let tag = self.auxiliary_tag(source)?;
        let groups: BTreeSet<String> = source
            .auxiliary_paths(&tag)?
            .iter()
            .filter_map(|path| split_item_key(path).map(|(group, _)| group.to_string()))
            .collect();

        Ok(groups.into_iter().map(|g| (g, tag.clone())).collect())
    }

    fn series(&self, source: &dyn DataSource) -> Result<SourceTagMap> {
        let mut keys = SourceTagMap::new();

        let mut units = source.units()?;
        units.sort();

        for unit in units {
            let mut tags = source.series_tags(&unit)?;
            tags.sort();

            let tag = match &self.input_tag {
                Some(wanted) if tags.contains(wanted) => wanted.clone(),
                Some(_) => continue,
                None => match tags.into_iter().next() {
                    Some(first) => first,
                    None => continue,
                },
            };

            if self.mode == Mode::SeriesItem {
                for component in source.components(&unit, &tag)? {
                    keys.insert(format!("{}_{}", unit, component), tag.clone());
                }
            } else {
                keys.insert(unit, tag);
            }
        }

        Ok(keys)
    }
}

//! Single-file JSON container
//!
//! Holds units (per-tag series items plus an optional inventory), auxiliary
//! groups and events. Writes go to a temporary file that replaces the
//! container on close.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use super::{DataSource, SinkStore, SinkWriter, SourceStore};
use crate::data::record::{array_bits, array_checksum};
use crate::data::{
    AuxiliaryRecord, MetadataRecord, Parameters, Scalar, SeriesCollection, SeriesItem,
};
use crate::error::{Result, ShardflowError};

/// Stored auxiliary record with its array checksum
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredAuxiliary {
    #[serde(with = "array_bits")]
    pub data: Vec<f64>,
    #[serde(default)]
    pub parameters: Parameters,
    /// CRC32C of the little-endian array bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crc32c: Option<u32>,
}

/// Series and inventory of one unit
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnitEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inventory: Option<MetadataRecord>,
    /// Tag -> items
    #[serde(default)]
    pub series: BTreeMap<String, Vec<SeriesItem>>,
}

/// On-disk layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub version: u32,
    #[serde(default)]
    pub events: Vec<MetadataRecord>,
    /// Unit name -> entry. Names may use '.' separators; keys never do.
    #[serde(default)]
    pub units: BTreeMap<String, UnitEntry>,
    /// Group tag -> path -> record
    #[serde(default)]
    pub auxiliary: BTreeMap<String, BTreeMap<String, StoredAuxiliary>>,
}

impl Default for Document {
    fn default() -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            events: Vec::new(),
            units: BTreeMap::new(),
            auxiliary: BTreeMap::new(),
        }
    }
}

impl Document {
    /// Current layout version
    pub const CURRENT_VERSION: u32 = 1;

    /// Key of a unit name
    pub fn unit_key(name: &str) -> String {
        name.replace('.', "_")
    }

    /// Read and parse a container
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let doc: Self = serde_json::from_str(&text)?;
        if doc.version > Self::CURRENT_VERSION {
            return Err(ShardflowError::InvalidMessage {
                reason: format!(
                    "{} has layout version {}, newest supported is {}",
                    path.display(),
                    doc.version,
                    Self::CURRENT_VERSION
                ),
            });
        }
        Ok(doc)
    }

    /// Write the container through a temporary file
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        std::fs::write(&tmp, serde_json::to_vec(self)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Entry for a unit key, created under that key if absent
    fn unit_entry_mut(&mut self, key: &str) -> &mut UnitEntry {
        let name = self
            .units
            .keys()
            .find(|name| Self::unit_key(name) == key)
            .cloned()
            .unwrap_or_else(|| key.to_string());
        self.units.entry(name).or_default()
    }

    /// Add an event unless one with the same id is present
    pub fn add_event(&mut self, event: &MetadataRecord) {
        if !self.events.iter().any(|e| e.id == event.id) {
            self.events.push(event.clone());
        }
    }
}

/// Opened container, parsed once and resolved per key on demand
pub struct JsonDataset {
    path: PathBuf,
    doc: Document,
    /// Unit key -> unit name
    index: BTreeMap<String, String>,
}

impl JsonDataset {
    /// Open a container for reading
    pub fn open(path: &Path) -> Result<Self> {
        let doc = Document::load(path).map_err(|e| ShardflowError::SourceOpen {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        let index = doc
            .units
            .keys()
            .map(|name| (Document::unit_key(name), name.clone()))
            .collect();

        debug!("Opened {} ({} units)", path.display(), doc.units.len());

        Ok(Self {
            path: path.to_path_buf(),
            doc,
            index,
        })
    }

    fn unit(&self, key: &str) -> Result<&UnitEntry> {
        self.index
            .get(key)
            .and_then(|name| self.doc.units.get(name))
            .ok_or_else(|| ShardflowError::KeyNotFound {
                tag: "<unit>".into(),
                key: key.into(),
            })
    }

    fn group(&self, tag: &str) -> Result<&BTreeMap<String, StoredAuxiliary>> {
        self.doc
            .auxiliary
            .get(tag)
            .ok_or_else(|| ShardflowError::TagNotFound {
                path: self.path.display().to_string(),
                tag: tag.into(),
            })
    }
}

impl DataSource for JsonDataset {
    fn path(&self) -> &Path {
        &self.path
    }

    fn auxiliary_tags(&self) -> Result<Vec<String>> {
        Ok(self.doc.auxiliary.keys().cloned().collect())
    }

    fn auxiliary_paths(&self, tag: &str) -> Result<Vec<String>> {
        Ok(self.group(tag)?.keys().cloned().collect())
    }

    fn units(&self) -> Result<Vec<String>> {
        Ok(self.index.keys().cloned().collect())
    }

    fn series_tags(&self, unit: &str) -> Result<Vec<String>> {
        Ok(self.unit(unit)?.series.keys().cloned().collect())
    }

    fn components(&self, unit: &str, tag: &str) -> Result<Vec<String>> {
        Ok(self.collection(tag, unit)?.components())
    }

    fn collection(&self, tag: &str, unit: &str) -> Result<SeriesCollection> {
        let items = self
            .unit(unit)?
            .series
            .get(tag)
            .ok_or_else(|| ShardflowError::KeyNotFound {
                tag: tag.into(),
                key: unit.into(),
            })?;
        Ok(SeriesCollection::new(unit, items.clone()))
    }

    fn auxiliary(&self, tag: &str, path: &str) -> Result<AuxiliaryRecord> {
        let stored = self
            .group(tag)?
            .get(path)
            .ok_or_else(|| ShardflowError::KeyNotFound {
                tag: tag.into(),
                key: path.into(),
            })?;

        if let Some(expected) = stored.crc32c {
            let actual = array_checksum(&stored.data);
            if actual != expected {
                return Err(ShardflowError::ChecksumMismatch {
                    path: format!("{}/{}", tag, path),
                    expected,
                    actual,
                });
            }
        }

        Ok(AuxiliaryRecord::new(
            stored.data.clone(),
            stored.parameters.clone(),
        ))
    }

    fn inventory(&self, unit: &str) -> Result<Option<MetadataRecord>> {
        Ok(self.unit(unit)?.inventory.clone())
    }

    fn events(&self) -> Result<Vec<MetadataRecord>> {
        Ok(self.doc.events.clone())
    }
}

/// Append handle holding the whole container in memory until close
pub struct JsonSinkWriter {
    path: PathBuf,
    doc: Document,
}

impl JsonSinkWriter {
    /// JSON numbers cannot hold NaN or infinities; arrays go through
    /// `array_bits`, scalars are refused before they reach the document.
    fn check_finite(&self, what: &str, parameters: &Parameters) -> Result<()> {
        let bad = parameters
            .iter()
            .find(|(_, v)| matches!(v, Scalar::Float(f) if !f.is_finite()));

        match bad {
            Some((name, value)) => Err(ShardflowError::Sink {
                path: self.path.display().to_string(),
                reason: format!("{} parameter {} is {:?}", what, name, value),
            }),
            None => Ok(()),
        }
    }
}

impl SinkWriter for JsonSinkWriter {
    fn write_series(&mut self, item: &SeriesItem, tag: &str) -> Result<()> {
        if !item.sampling_rate.is_finite() {
            return Err(ShardflowError::Sink {
                path: self.path.display().to_string(),
                reason: format!("{} has sampling rate {}", item.key(), item.sampling_rate),
            });
        }
        self.check_finite(&item.key(), &item.headers)?;

        let items = self
            .doc
            .unit_entry_mut(&item.unit)
            .series
            .entry(tag.to_string())
            .or_default();

        match items.iter_mut().find(|i| i.component == item.component) {
            Some(existing) => *existing = item.clone(),
            None => items.push(item.clone()),
        }
        Ok(())
    }

    fn write_auxiliary(
        &mut self,
        data: &[f64],
        tag: &str,
        path: &str,
        parameters: &Parameters,
    ) -> Result<()> {
        if path.is_empty() {
            return Err(ShardflowError::Sink {
                path: self.path.display().to_string(),
                reason: format!("auxiliary data under {} has no path", tag),
            });
        }
        self.check_finite(path, parameters)?;

        self.doc.auxiliary.entry(tag.to_string()).or_default().insert(
            path.to_string(),
            StoredAuxiliary {
                data: data.to_vec(),
                parameters: parameters.clone(),
                crc32c: Some(array_checksum(data)),
            },
        );
        Ok(())
    }

    fn write_metadata(&mut self, record: &MetadataRecord, subject: &str) -> Result<()> {
        self.doc.unit_entry_mut(subject).inventory = Some(record.clone());
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<()> {
        self.doc.save(&self.path).map_err(|e| ShardflowError::Sink {
            path: self.path.display().to_string(),
            reason: e.to_string(),
        })
    }
}

/// Source and sink store backed by JSON containers
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonStore;

impl SourceStore for JsonStore {
    fn open(&self, path: &Path) -> Result<Arc<dyn DataSource>> {
        Ok(Arc::new(JsonDataset::open(path)?))
    }
}

impl SinkStore for JsonStore {
    fn create(&self, path: &Path, events: &[MetadataRecord]) -> Result<()> {
        let sink_err = |e: std::io::Error| ShardflowError::Sink {
            path: path.display().to_string(),
            reason: e.to_string(),
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(sink_err)?;
        }

        match std::fs::remove_file(path) {
            Ok(()) => debug!("Removed stale sink {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(sink_err(e)),
        }

        let mut doc = Document::default();
        let mut seen = HashSet::new();
        for event in events {
            if seen.insert(event.id.as_str()) {
                doc.events.push(event.clone());
            }
        }
        doc.save(path)
    }

    fn open_append(&self, path: &Path) -> Result<Box<dyn SinkWriter>> {
        let doc = if path.exists() {
            Document::load(path).map_err(|e| ShardflowError::Sink {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?
        } else {
            Document::default()
        };

        Ok(Box::new(JsonSinkWriter {
            path: path.to_path_buf(),
            doc,
        }))
    }
}

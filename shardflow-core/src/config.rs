//! Run configuration
//!
//! Serde-loadable options for a processing run plus the processing mode
//! selector used by key resolution and accessors.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, ShardflowError};

/// What one key addresses on a source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mode {
    /// One component of one unit
    #[serde(rename = "trace", alias = "series_item", alias = "item")]
    SeriesItem,
    /// Every component of one unit
    #[serde(rename = "stream", alias = "series_collection", alias = "collection")]
    SeriesCollection,
    /// One auxiliary record
    #[serde(rename = "auxiliary", alias = "auxiliary_item")]
    AuxiliaryItem,
    /// Auxiliary records sharing a path prefix
    #[serde(rename = "auxiliary_group")]
    AuxiliaryGroup,
}

impl Mode {
    /// Canonical name
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::SeriesItem => "trace",
            Mode::SeriesCollection => "stream",
            Mode::AuxiliaryItem => "auxiliary",
            Mode::AuxiliaryGroup => "auxiliary_group",
        }
    }

    /// True for series item / collection modes
    pub fn is_series(&self) -> bool {
        matches!(self, Mode::SeriesItem | Mode::SeriesCollection)
    }
}

impl FromStr for Mode {
    type Err = ShardflowError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "trace" | "series_item" | "item" => Ok(Mode::SeriesItem),
            "stream" | "series_collection" | "collection" => Ok(Mode::SeriesCollection),
            "auxiliary" | "auxiliary_item" => Ok(Mode::AuxiliaryItem),
            "auxiliary_group" => Ok(Mode::AuxiliaryGroup),
            other => Err(ShardflowError::UnsupportedMode { mode: other.into() }),
        }
    }
}

/// One mode for every source, or one mode per source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ModeSpec {
    Uniform(Mode),
    PerSource(Vec<Mode>),
}

impl ModeSpec {
    /// Mode of the j-th source
    pub fn for_source(&self, j: usize) -> Mode {
        match self {
            ModeSpec::Uniform(mode) => *mode,
            // length is checked by ProcessorConfig::validate
            ModeSpec::PerSource(modes) => modes[j.min(modes.len().saturating_sub(1))],
        }
    }
}

impl Default for ModeSpec {
    fn default() -> Self {
        ModeSpec::Uniform(Mode::SeriesItem)
    }
}

impl From<Mode> for ModeSpec {
    fn from(mode: Mode) -> Self {
        ModeSpec::Uniform(mode)
    }
}

/// What happens to a recoverable error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    /// Stop processing at the first error and return it from `run` once the
    /// group has finished writing
    Raise,
    /// Hand the error to the callback registered on the processor
    Callback,
    /// Log the error and continue
    #[default]
    Report,
}

/// Lock-marker election settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Suffix appended to the sink path
    pub suffix: String,
    /// Read attempts before election fails
    pub retries: u32,
    /// Delay between read attempts in milliseconds
    pub backoff_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            suffix: crate::DEFAULT_LOCK_SUFFIX.into(),
            retries: 3,
            backoff_ms: 200,
        }
    }
}

impl LockConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(PathBuf),
    Many(Vec<PathBuf>),
}

fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<PathBuf>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(path) => vec![path],
        OneOrMany::Many(paths) => paths,
    })
}

/// Configuration for a processing run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Input source paths; the same path may appear more than once
    #[serde(deserialize_with = "one_or_many")]
    pub sources: Vec<PathBuf>,
    /// Output sink; `None` processes without persisting
    pub sink: Option<PathBuf>,
    /// Name of a builtin transform (binaries only)
    pub transform: Option<String>,
    /// Input mode
    pub mode: ModeSpec,
    /// Input tag, `None` for the first available
    pub input_tag: Option<String>,
    /// Output tag, `None` for the input tag
    pub output_tag: Option<String>,
    /// Pass accessors instead of resolved targets
    pub pass_accessor: bool,
    /// Attach the read-only fellows list to accessors
    pub pairwise: bool,
    /// Recoverable error policy
    #[serde(alias = "error_policy")]
    pub on_error: OnError,
    /// Lock marker settings
    pub lock: LockConfig,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            sink: None,
            transform: None,
            mode: ModeSpec::default(),
            input_tag: None,
            output_tag: None,
            pass_accessor: false,
            pairwise: false,
            on_error: OnError::default(),
            lock: LockConfig::default(),
        }
    }
}

impl ProcessorConfig {
    /// Create a configuration for the given sources
    pub fn new<P: Into<PathBuf>>(sources: impl IntoIterator<Item = P>) -> Self {
        Self {
            sources: sources.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Set the sink path
    pub fn with_sink(mut self, sink: impl Into<PathBuf>) -> Self {
        self.sink = Some(sink.into());
        self
    }

    /// Set the input mode
    pub fn with_mode(mut self, mode: impl Into<ModeSpec>) -> Self {
        self.mode = mode.into();
        self
    }

    /// Load from a JSON file
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| ShardflowError::InvalidConfig {
            reason: format!("cannot read {}: {}", path.display(), e),
        })?;
        Self::from_json(&text)
    }

    /// Parse from JSON text
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| ShardflowError::InvalidConfig {
            reason: e.to_string(),
        })
    }

    /// Mode of the j-th source
    pub fn mode_for(&self, j: usize) -> Mode {
        self.mode.for_source(j)
    }

    /// Check option consistency. Performs no I/O.
    pub fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            return Err(ShardflowError::InvalidConfig {
                reason: "at least one source is required".into(),
            });
        }

        if self.pairwise && !self.pass_accessor {
            return Err(ShardflowError::InvalidConfig {
                reason: "pass_accessor must be enabled for pairwise processing".into(),
            });
        }

        if let ModeSpec::PerSource(modes) = &self.mode {
            if modes.len() != self.sources.len() {
                return Err(ShardflowError::InvalidConfig {
                    reason: format!(
                        "{} modes given for {} sources",
                        modes.len(),
                        self.sources.len()
                    ),
                });
            }
        }

        if let Some(tag) = &self.output_tag {
            if tag.is_empty() {
                return Err(ShardflowError::InvalidConfig {
                    reason: "output_tag must not be empty".into(),
                });
            }
        }

        Ok(())
    }

    /// Path of the lock marker next to the sink
    pub fn lock_path(&self) -> Option<PathBuf> {
        self.sink.as_ref().map(|sink| {
            let mut name = sink.clone().into_os_string();
            name.push(&self.lock.suffix);
            PathBuf::from(name)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_source() {
        let config = ProcessorConfig::from_json(
            r#"{"sources": "a.json", "sink": "out.json", "mode": "stream"}"#,
        )
        .unwrap();
        assert_eq!(config.sources, vec![PathBuf::from("a.json")]);
        assert_eq!(config.mode_for(0), Mode::SeriesCollection);
        assert_eq!(config.lock_path(), Some(PathBuf::from("out.json.lock")));
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_per_source_modes() {
        let config = ProcessorConfig::from_json(
            r#"{"sources": ["a", "b"], "mode": ["trace", "auxiliary"], "on_error": "raise"}"#,
        )
        .unwrap();
        assert_eq!(config.mode_for(1), Mode::AuxiliaryItem);
        assert_eq!(config.on_error, OnError::Raise);
        config.validate().unwrap();
    }

    #[test]
    fn test_unsupported_mode_rejected() {
        let err = ProcessorConfig::from_json(r#"{"sources": "a", "mode": "image"}"#).unwrap_err();
        assert!(err.is_config());
        assert!("image".parse::<Mode>().is_err());
    }

    #[test]
    fn test_pairwise_requires_accessor() {
        let mut config = ProcessorConfig::new(["a"]);
        config.pairwise = true;
        assert!(config.validate().unwrap_err().is_config());

        config.pass_accessor = true;
        config.validate().unwrap();
    }

    #[test]
    fn test_mode_count_mismatch() {
        let config = ProcessorConfig::new(["a", "b"])
            .with_mode(ModeSpec::PerSource(vec![Mode::SeriesItem]));
        assert!(config.validate().is_err());
    }
}

//! Transform inputs, return shapes and their normalization

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::data::{
    Accessor, AuxiliaryRecord, MetadataRecord, Parameters, SeriesCollection, SeriesItem, Target,
};
use crate::error::{BoxError, Result};

/// One input of a transform call, in source order
#[derive(Debug, Clone)]
pub enum TransformInput {
    /// Lazy handle, passed when `pass_accessor` is set
    Accessor(Accessor),
    /// Resolved object
    Target(Target),
}

impl TransformInput {
    pub fn accessor(&self) -> Option<&Accessor> {
        match self {
            TransformInput::Accessor(a) => Some(a),
            TransformInput::Target(_) => None,
        }
    }

    pub fn as_target(&self) -> Option<&Target> {
        match self {
            TransformInput::Target(t) => Some(t),
            TransformInput::Accessor(_) => None,
        }
    }

    /// Resolved object, resolving through the accessor if needed
    pub fn resolve(&self) -> Result<Target> {
        match self {
            TransformInput::Accessor(a) => a.target(),
            TransformInput::Target(t) => Ok(t.clone()),
        }
    }

    /// Short description for error reports
    pub fn describe(&self) -> String {
        match self {
            TransformInput::Accessor(a) => {
                format!("accessor {} {}:{}", a.mode().as_str(), a.tag(), a.key())
            }
            TransformInput::Target(t) => t.to_string(),
        }
    }
}

/// A single value a transform may return
#[derive(Debug, Clone, PartialEq)]
pub enum OutputValue {
    Collection(SeriesCollection),
    Item(SeriesItem),
    Auxiliary(AuxiliaryRecord),
    /// Array plus parameters, stored as an auxiliary record
    Pair(Vec<f64>, Parameters),
    Metadata(MetadataRecord),
}

impl From<SeriesCollection> for OutputValue {
    fn from(v: SeriesCollection) -> Self {
        OutputValue::Collection(v)
    }
}

impl From<SeriesItem> for OutputValue {
    fn from(v: SeriesItem) -> Self {
        OutputValue::Item(v)
    }
}

impl From<AuxiliaryRecord> for OutputValue {
    fn from(v: AuxiliaryRecord) -> Self {
        OutputValue::Auxiliary(v)
    }
}

impl From<(Vec<f64>, Parameters)> for OutputValue {
    fn from((data, parameters): (Vec<f64>, Parameters)) -> Self {
        OutputValue::Pair(data, parameters)
    }
}

impl From<MetadataRecord> for OutputValue {
    fn from(v: MetadataRecord) -> Self {
        OutputValue::Metadata(v)
    }
}

/// Everything a transform may return for one key
#[derive(Debug, Clone, PartialEq, Default)]
pub enum TransformOutput {
    /// Nothing to store
    #[default]
    None,
    /// Stored under the key itself
    Single(OutputValue),
    /// Each entry stored under "{key}_{name}"; `None` entries are skipped
    Named(BTreeMap<String, Option<OutputValue>>),
}

macro_rules! single_output {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for TransformOutput {
                fn from(v: $ty) -> Self {
                    TransformOutput::Single(v.into())
                }
            }
        )*
    };
}

single_output!(
    OutputValue,
    SeriesCollection,
    SeriesItem,
    AuxiliaryRecord,
    (Vec<f64>, Parameters),
    MetadataRecord,
);

impl From<Option<OutputValue>> for TransformOutput {
    fn from(v: Option<OutputValue>) -> Self {
        v.map(TransformOutput::Single).unwrap_or_default()
    }
}

impl From<Target> for TransformOutput {
    fn from(target: Target) -> Self {
        match target {
            Target::Item(item) => item.into(),
            Target::Collection(c) => c.into(),
            Target::Auxiliary(aux) => aux.into(),
            Target::AuxiliaryGroup(members) => TransformOutput::Named(
                members
                    .into_iter()
                    .map(|(name, aux)| (name, Some(aux.into())))
                    .collect(),
            ),
        }
    }
}

/// Normalized unit of output ready for buffering
#[derive(Debug, Clone, PartialEq)]
pub enum OutputItem {
    Collection(SeriesCollection),
    Item(SeriesItem),
    Auxiliary(AuxiliaryRecord),
    Metadata(MetadataRecord),
}

impl From<OutputValue> for OutputItem {
    fn from(value: OutputValue) -> Self {
        match value {
            OutputValue::Collection(c) => OutputItem::Collection(c),
            OutputValue::Item(i) => OutputItem::Item(i),
            OutputValue::Auxiliary(a) => OutputItem::Auxiliary(a),
            OutputValue::Pair(data, parameters) => {
                OutputItem::Auxiliary(AuxiliaryRecord::new(data, parameters))
            }
            OutputValue::Metadata(m) => OutputItem::Metadata(m),
        }
    }
}

/// Flatten a transform's return value into identified output items
pub fn normalize(key: &str, output: TransformOutput) -> Vec<(String, OutputItem)> {
    match output {
        TransformOutput::None => Vec::new(),
        TransformOutput::Single(value) => vec![(key.to_string(), value.into())],
        TransformOutput::Named(entries) => entries
            .into_iter()
            .filter_map(|(name, value)| Some((format!("{}_{}", key, name), value?.into())))
            .collect(),
    }
}

/// User transform: called exactly once per owned key with one input per
/// source
pub type Transform =
    Arc<dyn Fn(&[TransformInput]) -> std::result::Result<TransformOutput, BoxError> + Send + Sync>;

/// Wrap a closure as a [`Transform`]
pub fn transform<F>(f: F) -> Transform
where
    F: Fn(&[TransformInput]) -> std::result::Result<TransformOutput, BoxError>
        + Send
        + Sync
        + 'static,
{
    Arc::new(f)
}

//! Record types exchanged with sources, transforms and sinks
//!
//! Series items and collections, auxiliary records and opaque metadata.

use bytes::{BufMut, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Scalar parameter value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

/// Named parameters attached to auxiliary records and series headers
pub type Parameters = BTreeMap<String, Scalar>;

impl From<bool> for Scalar {
    fn from(v: bool) -> Self {
        Scalar::Bool(v)
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Scalar::Int(v)
    }
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Scalar::Float(v)
    }
}

impl From<&str> for Scalar {
    fn from(v: &str) -> Self {
        Scalar::Text(v.to_string())
    }
}

impl From<String> for Scalar {
    fn from(v: String) -> Self {
        Scalar::Text(v)
    }
}

/// Array plus named parameters. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuxiliaryRecord {
    data: Vec<f64>,
    parameters: Parameters,
}

impl AuxiliaryRecord {
    /// Create a new auxiliary record
    pub fn new(data: Vec<f64>, parameters: Parameters) -> Self {
        Self { data, parameters }
    }

    /// Raw array
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    /// Named parameters
    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    /// Split into array and parameters
    pub fn into_parts(self) -> (Vec<f64>, Parameters) {
        (self.data, self.parameters)
    }

    /// CRC32C over the little-endian bytes of the array
    pub fn checksum(&self) -> u32 {
        array_checksum(&self.data)
    }
}

fn le_bytes(data: &[f64]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(data.len() * 8);
    for v in data {
        buf.put_f64_le(*v);
    }
    buf
}

/// CRC32C over the little-endian bytes of an array
pub fn array_checksum(data: &[f64]) -> u32 {
    crc32c::crc32c(&le_bytes(data))
}

/// Serde adapter writing arrays as hex of their little-endian bytes.
///
/// Every value reads back with the same bits, NaN and infinities included.
/// Plain number arrays are still accepted on read.
pub mod array_bits {
    use super::*;
    use serde::{de, Deserializer, Serializer};
    use std::fmt::Write as _;

    pub fn serialize<S: Serializer>(data: &[f64], serializer: S) -> Result<S::Ok, S::Error> {
        let mut hex = String::with_capacity(data.len() * 16);
        for byte in le_bytes(data).iter() {
            let _ = write!(hex, "{:02x}", byte);
        }
        serializer.serialize_str(&hex)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f64>, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Stored {
            Hex(String),
            Numbers(Vec<f64>),
        }

        match Stored::deserialize(deserializer)? {
            Stored::Numbers(values) => Ok(values),
            Stored::Hex(hex) => decode(&hex).map_err(de::Error::custom),
        }
    }

    fn decode(hex: &str) -> Result<Vec<f64>, String> {
        if hex.len() % 16 != 0 {
            return Err(format!("array of {} hex digits is not whole f64 values", hex.len()));
        }

        let mut bytes = Vec::with_capacity(hex.len() / 2);
        for pair in hex.as_bytes().chunks(2) {
            let digits = std::str::from_utf8(pair).map_err(|e| e.to_string())?;
            let byte = u8::from_str_radix(digits, 16)
                .map_err(|_| format!("invalid hex digits {:?}", digits))?;
            bytes.push(byte);
        }

        Ok(bytes
            .chunks_exact(8)
            .map(|chunk| {
                let mut le = [0u8; 8];
                le.copy_from_slice(chunk);
                f64::from_le_bytes(le)
            })
            .collect())
    }
}

/// One component of one unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesItem {
    /// Unit key this item belongs to (e.g. "II_BFO")
    pub unit: String,
    /// Component name (e.g. "Z")
    pub component: String,
    /// Time of the first sample
    pub start: DateTime<Utc>,
    /// Samples per second
    pub sampling_rate: f64,
    /// Samples
    #[serde(with = "array_bits")]
    pub data: Vec<f64>,
    /// Free-form header values
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: Parameters,
}

impl SeriesItem {
    /// Create a new series item
    pub fn new(
        unit: impl Into<String>,
        component: impl Into<String>,
        start: DateTime<Utc>,
        sampling_rate: f64,
        data: Vec<f64>,
    ) -> Self {
        Self {
            unit: unit.into(),
            component: component.into(),
            start,
            sampling_rate,
            data,
            headers: Parameters::new(),
        }
    }

    /// Key of this item ("{unit}_{component}")
    pub fn key(&self) -> String {
        format!("{}_{}", self.unit, self.component)
    }
}

/// All components of one unit under one tag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesCollection {
    pub unit: String,
    pub items: Vec<SeriesItem>,
}

impl SeriesCollection {
    /// Create a collection
    pub fn new(unit: impl Into<String>, items: Vec<SeriesItem>) -> Self {
        Self {
            unit: unit.into(),
            items,
        }
    }

    /// Find the item for a component
    pub fn select(&self, component: &str) -> Option<&SeriesItem> {
        self.items.iter().find(|item| item.component == component)
    }

    /// Component names in stored order
    pub fn components(&self) -> Vec<String> {
        self.items.iter().map(|item| item.component.clone()).collect()
    }
}

/// Opaque metadata (station inventory, event description, ...)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub id: String,
    #[serde(default)]
    pub content: serde_json::Value,
}

impl MetadataRecord {
    pub fn new(id: impl Into<String>, content: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            content,
        }
    }
}

/// Object a key resolves to on one source
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    Item(SeriesItem),
    Collection(SeriesCollection),
    Auxiliary(AuxiliaryRecord),
    /// Group members keyed by the last path segment
    AuxiliaryGroup(BTreeMap<String, AuxiliaryRecord>),
}

impl Target {
    /// Raw array for single-array targets
    pub fn data(&self) -> Option<&[f64]> {
        match self {
            Target::Item(item) => Some(&item.data),
            Target::Auxiliary(aux) => Some(aux.data()),
            Target::Collection(_) | Target::AuxiliaryGroup(_) => None,
        }
    }
}

impl fmt::Display for Target {
    /// Short shape description used in error reports
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Item(item) => write!(f, "item {}[{}]", item.key(), item.data.len()),
            Target::Collection(c) => {
                let lens: Vec<String> = c
                    .items
                    .iter()
                    .map(|i| format!("{}[{}]", i.component, i.data.len()))
                    .collect();
                write!(f, "collection {} {{{}}}", c.unit, lens.join(", "))
            }
            Target::Auxiliary(aux) => write!(
                f,
                "auxiliary[{}] with {} parameters",
                aux.data().len(),
                aux.parameters().len()
            ),
            Target::AuxiliaryGroup(group) => write!(f, "auxiliary group of {}", group.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_untagged() {
        let params: Parameters =
            serde_json::from_str(r#"{"a": true, "b": 3, "c": 0.5, "d": "x"}"#).unwrap();
        assert_eq!(params["a"], Scalar::Bool(true));
        assert_eq!(params["b"], Scalar::Int(3));
        assert_eq!(params["c"], Scalar::Float(0.5));
        assert_eq!(params["d"], Scalar::Text("x".into()));
    }

    #[test]
    fn test_checksum_tracks_bits() {
        let a = AuxiliaryRecord::new(vec![0.1, 0.2], Parameters::new());
        let b = AuxiliaryRecord::new(vec![0.1, 0.2 + f64::EPSILON], Parameters::new());
        assert_eq!(a.checksum(), a.clone().checksum());
        assert_ne!(a.checksum(), b.checksum());
    }

    #[test]
    fn test_array_bits_keep_non_finite_values() {
        #[derive(Serialize, Deserialize)]
        struct Wrapped {
            #[serde(with = "array_bits")]
            data: Vec<f64>,
        }

        let data = vec![1.0, f64::NAN, f64::from_bits(0x7ff8_0000_0000_0001), f64::INFINITY, -0.0];
        let text = serde_json::to_string(&Wrapped { data: data.clone() }).unwrap();
        assert!(!text.contains("null"));

        let back: Wrapped = serde_json::from_str(&text).unwrap();
        let bits = |v: &[f64]| v.iter().map(|x| x.to_bits()).collect::<Vec<_>>();
        assert_eq!(bits(&back.data), bits(&data));

        let plain: Wrapped = serde_json::from_str(r#"{"data": [0.5, 2]}"#).unwrap();
        assert_eq!(plain.data, vec![0.5, 2.0]);
        assert!(serde_json::from_str::<Wrapped>(r#"{"data": "00ff"}"#).is_err());
    }

    #[test]
    fn test_collection_select() {
        let start = Utc::now();
        let c = SeriesCollection::new(
            "II_BFO",
            vec![
                SeriesItem::new("II_BFO", "Z", start, 1.0, vec![1.0]),
                SeriesItem::new("II_BFO", "N", start, 1.0, vec![2.0]),
            ],
        );
        assert_eq!(c.select("N").unwrap().data, vec![2.0]);
        assert!(c.select("E").is_none());
        assert_eq!(c.items[0].key(), "II_BFO_Z");
    }
}

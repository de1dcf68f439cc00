use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SyncError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FunctionalId(String);

impl FunctionalId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FunctionalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for FunctionalId {
    type Err = SyncError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(SyncError::InvalidRecord(
                "empty functional identifier".to_string(),
            ));
        }
        Ok(Self(trimmed.to_string()))
    }
}

/// Host identity of a data node. Normalized to lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataNode(String);

impl DataNode {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DataNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DataNode {
    type Err = SyncError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_lowercase();
        let is_valid = !normalized.is_empty()
            && normalized
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_' | ':'));
        if !is_valid {
            return Err(SyncError::InvalidRecord(format!("invalid data node: {value}")));
        }
        Ok(Self(normalized))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordType {
    File,
    Dataset,
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordType::File => write!(f, "File"),
            RecordType::Dataset => write!(f, "Dataset"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum NearestMode {
    Geolocation,
    Rtt,
}

impl fmt::Display for NearestMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NearestMode::Geolocation => write!(f, "geolocation"),
            NearestMode::Rtt => write!(f, "rtt"),
        }
    }
}

impl FromStr for NearestMode {
    type Err = SyncError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "geolocation" => Ok(NearestMode::Geolocation),
            "rtt" => Ok(NearestMode::Rtt),
            other => Err(SyncError::Configuration(format!(
                "incorrect nearest mode ({other})"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    #[serde(alias = "file_functional_id", deserialize_with = "scalar")]
    pub functional_id: FunctionalId,
    #[serde(deserialize_with = "scalar")]
    pub data_node: DataNode,
    #[serde(default, deserialize_with = "opt_scalar")]
    pub size: Option<u64>,
    #[serde(default, deserialize_with = "string_list")]
    pub variable: Vec<String>,
    #[serde(default, deserialize_with = "opt_scalar")]
    pub url: Option<String>,
    #[serde(default, deserialize_with = "opt_scalar")]
    pub local_path: Option<String>,
    #[serde(default, deserialize_with = "opt_scalar")]
    pub dataset_functional_id: Option<FunctionalId>,
    #[serde(default, deserialize_with = "opt_scalar")]
    pub checksum: Option<String>,
    #[serde(default, deserialize_with = "opt_scalar")]
    pub checksum_type: Option<String>,
    #[serde(default, deserialize_with = "opt_scalar")]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetRecord {
    #[serde(alias = "dataset_functional_id", deserialize_with = "scalar")]
    pub functional_id: FunctionalId,
    #[serde(deserialize_with = "scalar")]
    pub data_node: DataNode,
    #[serde(default, deserialize_with = "opt_scalar")]
    pub master_id: Option<String>,
    #[serde(default, deserialize_with = "opt_scalar")]
    pub version: Option<String>,
    #[serde(default, deserialize_with = "opt_scalar")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "opt_scalar")]
    pub latest: Option<bool>,
    #[serde(default, deserialize_with = "opt_scalar")]
    pub size: Option<u64>,
    #[serde(default, deserialize_with = "opt_scalar")]
    pub local_path: Option<String>,
}

impl DatasetRecord {
    /// Identity shared by every version of the same dataset.
    pub fn group_key(&self) -> String {
        if let Some(master_id) = &self.master_id {
            return master_id.clone();
        }
        let id = self.functional_id.as_str();
        match id.rsplit_once('.') {
            Some((head, tail)) if is_version_segment(tail) => head.to_string(),
            _ => id.to_string(),
        }
    }
}

fn is_version_segment(segment: &str) -> bool {
    let digits = segment.strip_prefix('v').unwrap_or(segment);
    !digits.is_empty() && digits.chars().all(|ch| ch.is_ascii_digit())
}

/// A search result entry with a closed attribute vocabulary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Record {
    File(FileRecord),
    Dataset(DatasetRecord),
}

impl Record {
    pub fn record_type(&self) -> RecordType {
        match self {
            Record::File(_) => RecordType::File,
            Record::Dataset(_) => RecordType::Dataset,
        }
    }

    pub fn functional_id(&self) -> &FunctionalId {
        match self {
            Record::File(file) => &file.functional_id,
            Record::Dataset(dataset) => &dataset.functional_id,
        }
    }

    pub fn data_node(&self) -> &DataNode {
        match self {
            Record::File(file) => &file.data_node,
            Record::Dataset(dataset) => &dataset.data_node,
        }
    }

    pub fn size(&self) -> Option<u64> {
        match self {
            Record::File(file) => file.size,
            Record::Dataset(dataset) => dataset.size,
        }
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Record::File(file) => file.timestamp,
            Record::Dataset(dataset) => dataset.timestamp,
        }
    }

    pub fn as_file(&self) -> Option<&FileRecord> {
        match self {
            Record::File(file) => Some(file),
            Record::Dataset(_) => None,
        }
    }

    pub fn as_dataset(&self) -> Option<&DatasetRecord> {
        match self {
            Record::Dataset(dataset) => Some(dataset),
            Record::File(_) => None,
        }
    }
}

// The search API wraps most scalars in single-element lists.
fn scalar_text(value: Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Array(items) => items.into_iter().next().and_then(scalar_text),
        Value::Null | Value::Object(_) => None,
    }
}

fn scalar<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: fmt::Display,
{
    let value = Value::deserialize(deserializer)?;
    let text = scalar_text(value).ok_or_else(|| de::Error::custom("expected a scalar value"))?;
    text.parse().map_err(de::Error::custom)
}

fn opt_scalar<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: fmt::Display,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    match value.and_then(scalar_text) {
        Some(text) => text.parse().map(Some).map_err(de::Error::custom),
        None => Ok(None),
    }
}

fn string_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Array(items)) => items.into_iter().filter_map(scalar_text).collect(),
        Some(other) => scalar_text(other).into_iter().collect(),
        None => Vec::new(),
    })
}

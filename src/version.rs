//! Dataset version ordering.
//!
//! Version identifiers come in several lexical shapes (`1`, `v1`, `20160618`,
//! `v20160618`). Equal-width identifiers compare lexically; otherwise the
//! dataset timestamps decide, with a narrow fallback for records that have
//! none.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::collection::RecordCollection;
use crate::domain::{DatasetRecord, FunctionalId, RecordType};
use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionFormat {
    /// `v20160618`
    LongWithPrefix,
    /// `v1`
    ShortWithPrefix,
    /// `20160618`
    Long,
    /// `1`
    Short,
}

// Evaluated in order: a more specific pattern must precede any pattern that
// also matches its inputs.
static VERSION_PATTERNS: LazyLock<Vec<(VersionFormat, Regex)>> = LazyLock::new(|| {
    [
        (VersionFormat::LongWithPrefix, r"(?i)^v(\d{8})$"),
        (VersionFormat::ShortWithPrefix, r"(?i)^v(\d+)$"),
        (VersionFormat::Long, r"^(\d{8})$"),
        (VersionFormat::Short, r"^(\d+)$"),
    ]
    .into_iter()
    .map(|(format, pattern)| (format, Regex::new(pattern).expect("valid version regex")))
    .collect()
});

/// Identifies the format of `version` and extracts its number.
pub fn classify(version: &str) -> Option<(VersionFormat, u64)> {
    VERSION_PATTERNS.iter().find_map(|(format, regex)| {
        let number = regex.captures(version)?.get(1)?.as_str().parse().ok()?;
        Some((*format, number))
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetVersion {
    pub functional_id: Option<FunctionalId>,
    pub version: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub latest: bool,
}

impl DatasetVersion {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            functional_id: None,
            version: version.into(),
            timestamp: None,
            latest: false,
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_latest(mut self, latest: bool) -> Self {
        self.latest = latest;
        self
    }

    /// Uses the record's `version`, or the last segment of its functional id.
    pub fn from_record(record: &DatasetRecord) -> Option<Self> {
        let version = record.version.clone().or_else(|| {
            record
                .functional_id
                .as_str()
                .rsplit_once('.')
                .map(|(_, tail)| tail.to_string())
                .filter(|tail| classify(tail).is_some())
        })?;
        Some(Self {
            functional_id: Some(record.functional_id.clone()),
            version,
            timestamp: record.timestamp,
            latest: record.latest.unwrap_or(false),
        })
    }

    pub fn format(&self) -> Option<VersionFormat> {
        classify(&self.version).map(|(format, _)| format)
    }
}

/// True when `a` is more recent than `b`.
pub fn compare(a: &DatasetVersion, b: &DatasetVersion) -> Result<bool, SyncError> {
    if a.version.len() == b.version.len() {
        return Ok(a.version > b.version);
    }
    if let (Some(ts_a), Some(ts_b)) = (a.timestamp, b.timestamp) {
        return Ok(ts_a > ts_b);
    }
    // Datasets without a timestamp: only the `v1` against `v20110901` case is decidable.
    match (a.version.len(), b.version.len()) {
        (9, 2) => Ok(true),
        (2, 9) => Ok(false),
        _ => Err(SyncError::Version {
            left: a.version.clone(),
            right: b.version.clone(),
        }),
    }
}

/// Every known version of one dataset.
#[derive(Debug, Clone, Default)]
pub struct DatasetVersions {
    versions: Vec<DatasetVersion>,
}

impl DatasetVersions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, version: DatasetVersion) {
        self.versions.push(version);
    }

    pub fn datasets(&self) -> &[DatasetVersion] {
        &self.versions
    }

    pub fn count(&self) -> usize {
        self.versions.len()
    }

    pub fn versions(&self) -> Vec<&str> {
        self.versions.iter().map(|d| d.version.as_str()).collect()
    }

    pub fn sorted_versions(&self) -> Vec<&str> {
        let mut versions = self.versions();
        versions.sort_unstable();
        versions
    }

    pub fn exists_version_with_latest_flag(&self) -> bool {
        self.versions.iter().any(|d| d.latest)
    }

    pub fn latest_flagged(&self) -> Result<&DatasetVersion, SyncError> {
        self.versions
            .iter()
            .find(|d| d.latest)
            .ok_or_else(|| SyncError::Fatal("no dataset version flagged latest".to_string()))
    }

    pub fn is_version_higher_than_latest(&self, candidate: &DatasetVersion) -> Result<bool, SyncError> {
        compare(candidate, self.latest_flagged()?)
    }

    /// Computed from the version strings; the latest flag is ignored.
    pub fn latest(&self) -> Result<&DatasetVersion, SyncError> {
        let mut latest = self.first()?;
        for candidate in &self.versions {
            if compare(candidate, latest)? {
                latest = candidate;
            }
        }
        Ok(latest)
    }

    pub fn oldest(&self) -> Result<&DatasetVersion, SyncError> {
        let mut oldest = self.first()?;
        for candidate in &self.versions {
            if !compare(candidate, oldest)? {
                oldest = candidate;
            }
        }
        Ok(oldest)
    }

    /// Computed from the version strings; the latest flag is ignored.
    pub fn is_most_recent(&self, candidate: &DatasetVersion) -> Result<bool, SyncError> {
        Ok(self.latest()?.version == candidate.version)
    }

    /// Versions ordered oldest first.
    pub fn sorted(&self) -> Result<Vec<&DatasetVersion>, SyncError> {
        let mut sorted: Vec<&DatasetVersion> = Vec::with_capacity(self.versions.len());
        for candidate in &self.versions {
            let mut index = sorted.len();
            for (i, placed) in sorted.iter().enumerate() {
                if !compare(candidate, placed)? {
                    index = i;
                    break;
                }
            }
            sorted.insert(index, candidate);
        }
        Ok(sorted)
    }

    fn first(&self) -> Result<&DatasetVersion, SyncError> {
        self.versions
            .first()
            .ok_or_else(|| SyncError::NotFound("dataset has no version".to_string()))
    }
}

impl FromIterator<DatasetVersion> for DatasetVersions {
    fn from_iter<I: IntoIterator<Item = DatasetVersion>>(iter: I) -> Self {
        Self {
            versions: iter.into_iter().collect(),
        }
    }
}

/// Keeps, in a dataset collection, the records of the most recent version of
/// each dataset. Persisted latest flags are checked against the computed
/// answer but never rewritten.
pub fn keep_latest_versions(
    collection: RecordCollection,
    chunk_size: usize,
) -> Result<RecordCollection, SyncError> {
    if collection.record_type()? != Some(RecordType::Dataset) {
        return Ok(collection);
    }

    let mut groups: HashMap<String, DatasetVersions> = HashMap::new();
    for chunk in collection.chunks(chunk_size)? {
        for record in chunk? {
            let Some(dataset) = record.as_dataset() else {
                continue;
            };
            match DatasetVersion::from_record(dataset) {
                Some(version) => groups.entry(dataset.group_key()).or_default().add(version),
                None => debug!(id = %dataset.functional_id, "dataset without version kept as is"),
            }
        }
    }

    let mut latest_ids = HashSet::new();
    for (group, versions) in &groups {
        let latest = versions.latest()?;
        if let Ok(flagged) = versions.latest_flagged() {
            if flagged.version != latest.version {
                warn!(
                    dataset = %group,
                    flagged = %flagged.version,
                    computed = %latest.version,
                    "latest flag disagrees with version order"
                );
            }
        }
        latest_ids.insert((group.clone(), latest.version.clone()));
    }

    let output = collection.filter(chunk_size, |record| match record.as_dataset() {
        Some(dataset) => match DatasetVersion::from_record(dataset) {
            Some(version) => latest_ids.contains(&(dataset.group_key(), version.version)),
            None => true,
        },
        None => true,
    })?;
    info!(
        groups = groups.len(),
        dropped = collection.count() - output.count(),
        "older dataset versions removed"
    );
    Ok(output)
}

//! Transfer lifecycle.
//!
//! A tracked file moves `new -> waiting -> running -> done | error`. Any
//! status can be marked `delete`; a later sweep removes the local data and the
//! row in one transaction.

use std::collections::HashSet;
use std::fmt;
use std::io;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::collection::RecordCollection;
use crate::domain::{DataNode, FileRecord, FunctionalId, Record};
use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    New,
    Waiting,
    Running,
    Done,
    Error,
    Delete,
}

impl TransferStatus {
    pub fn can_transition_to(self, next: TransferStatus) -> bool {
        use TransferStatus::*;
        matches!(
            (self, next),
            (New, Waiting)
                | (Waiting, Running)
                | (Running, Done)
                | (Running, Error)
                | (Running, Waiting)
                | (Error, Waiting)
                | (_, Delete)
        )
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TransferStatus::New => "new",
            TransferStatus::Waiting => "waiting",
            TransferStatus::Running => "running",
            TransferStatus::Done => "done",
            TransferStatus::Error => "error",
            TransferStatus::Delete => "delete",
        };
        write!(f, "{label}")
    }
}

impl FromStr for TransferStatus {
    type Err = SyncError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "new" => Ok(TransferStatus::New),
            "waiting" => Ok(TransferStatus::Waiting),
            "running" => Ok(TransferStatus::Running),
            "done" => Ok(TransferStatus::Done),
            "error" => Ok(TransferStatus::Error),
            "delete" => Ok(TransferStatus::Delete),
            _ => Err(SyncError::InvalidStatus(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub file_functional_id: FunctionalId,
    pub dataset_functional_id: Option<FunctionalId>,
    pub data_node: DataNode,
    pub url: String,
    pub local_path: String,
    pub size: Option<u64>,
    pub checksum: Option<String>,
    pub checksum_type: Option<String>,
    pub status: TransferStatus,
    /// Status held before the record was marked for deletion.
    #[serde(default)]
    pub previous_status: Option<TransferStatus>,
    pub error_msg: Option<String>,
    pub sdget_status: Option<i32>,
    pub sdget_error_msg: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransferRecord {
    pub fn from_file(file: &FileRecord) -> Result<Self, SyncError> {
        let url = file.url.clone().ok_or_else(|| {
            SyncError::InvalidRecord(format!("file {} has no url", file.functional_id))
        })?;
        let now = Utc::now();
        Ok(Self {
            file_functional_id: file.functional_id.clone(),
            dataset_functional_id: file.dataset_functional_id.clone(),
            data_node: file.data_node.clone(),
            url,
            local_path: file
                .local_path
                .clone()
                .unwrap_or_else(|| file.functional_id.as_str().to_string()),
            size: file.size,
            checksum: file.checksum.clone(),
            checksum_type: file.checksum_type.clone(),
            status: TransferStatus::New,
            previous_status: None,
            error_msg: None,
            sdget_status: None,
            sdget_error_msg: None,
            created_at: now,
            updated_at: now,
        })
    }

    fn set_status(&mut self, next: TransferStatus) -> Result<(), SyncError> {
        if !self.status.can_transition_to(next) {
            return Err(SyncError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetEntry {
    pub functional_id: FunctionalId,
    pub local_path: Option<String>,
    pub version: Option<String>,
    pub latest: bool,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Persisted transfer and dataset rows.
///
/// Writes made with `commit = false` stay pending until [`commit`]; a crash
/// before that loses them and leaves the last committed state intact.
///
/// [`commit`]: TransferStore::commit
pub trait TransferStore {
    fn get_transfer(&self, id: &FunctionalId) -> Result<Option<TransferRecord>, SyncError>;
    fn list_transfers(
        &self,
        status: Option<TransferStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<TransferRecord>, SyncError>;
    fn count_transfers(&self, status: TransferStatus) -> Result<usize, SyncError>;
    fn upsert_transfer(&mut self, record: TransferRecord, commit: bool) -> Result<(), SyncError>;
    fn delete_transfer(&mut self, id: &FunctionalId, commit: bool) -> Result<(), SyncError>;
    fn get_dataset(&self, id: &FunctionalId) -> Result<Option<DatasetEntry>, SyncError>;
    fn list_datasets(&self) -> Result<Vec<DatasetEntry>, SyncError>;
    fn upsert_dataset(&mut self, dataset: DatasetEntry, commit: bool) -> Result<(), SyncError>;
    fn delete_dataset(&mut self, id: &FunctionalId, commit: bool) -> Result<(), SyncError>;
    fn commit(&mut self) -> Result<(), SyncError>;
    fn rollback(&mut self) -> Result<(), SyncError>;
}

pub trait LocalFs {
    fn is_file(&self, path: &Utf8Path) -> bool;
    fn remove_file(&self, path: &Utf8Path) -> io::Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OsFs;

impl LocalFs for OsFs {
    fn is_file(&self, path: &Utf8Path) -> bool {
        path.as_std_path().is_file()
    }

    fn remove_file(&self, path: &Utf8Path) -> io::Result<()> {
        std::fs::remove_file(path.as_std_path())
    }
}

/// Which part of a transfer a sweep removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteScope {
    DataAndMetadata,
    MetadataOnly,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct InstallReport {
    pub added: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub removed: usize,
    pub retained: usize,
    /// Records still marked for deletion after the sweep committed.
    pub remaining: usize,
    #[serde(skip)]
    pub removed_paths: Vec<Utf8PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ResetReport {
    pub transfers: usize,
    pub datasets: usize,
}

/// Relative paths live under `data_folder`; absolute ones are used verbatim.
pub fn build_full_local_path(local_path: &str, data_folder: &Utf8Path) -> Utf8PathBuf {
    if local_path.starts_with('/') {
        Utf8PathBuf::from(local_path)
    } else {
        data_folder.join(local_path)
    }
}

pub struct LifecycleManager<S: TransferStore, F: LocalFs = OsFs> {
    store: S,
    fs: F,
    data_folder: Utf8PathBuf,
}

impl<S: TransferStore, F: LocalFs> LifecycleManager<S, F> {
    pub fn new(store: S, fs: F, data_folder: Utf8PathBuf) -> Self {
        Self {
            store,
            fs,
            data_folder,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn data_folder(&self) -> &Utf8Path {
        &self.data_folder
    }

    pub fn full_local_path(&self, record: &TransferRecord) -> Utf8PathBuf {
        build_full_local_path(&record.local_path, &self.data_folder)
    }

    /// Queues every file of `collection` that is not tracked yet.
    pub fn install(
        &mut self,
        collection: &RecordCollection,
        chunk_size: usize,
    ) -> Result<InstallReport, SyncError> {
        let mut report = InstallReport::default();
        let mut datasets = HashSet::new();
        for chunk in collection.chunks(chunk_size)? {
            for record in chunk? {
                let Record::File(file) = record else {
                    continue;
                };
                if self.store.get_transfer(&file.functional_id)?.is_some() {
                    report.skipped += 1;
                    continue;
                }
                let mut transfer = TransferRecord::from_file(&file)?;
                transfer.set_status(TransferStatus::Waiting)?;
                if let Some(dataset_id) = &transfer.dataset_functional_id {
                    if datasets.insert(dataset_id.clone())
                        && self.store.get_dataset(dataset_id)?.is_none()
                    {
                        self.store.upsert_dataset(
                            DatasetEntry {
                                functional_id: dataset_id.clone(),
                                local_path: None,
                                version: None,
                                latest: false,
                                timestamp: None,
                            },
                            false,
                        )?;
                    }
                }
                self.store.upsert_transfer(transfer, false)?;
                report.added += 1;
            }
        }
        self.store.commit()?;
        info!(added = report.added, skipped = report.skipped, "transfers queued");
        Ok(report)
    }

    pub fn start(&mut self, id: &FunctionalId) -> Result<(), SyncError> {
        self.transition(id, TransferStatus::Running, |_| {})
    }

    pub fn complete(&mut self, id: &FunctionalId) -> Result<(), SyncError> {
        self.transition(id, TransferStatus::Done, |record| {
            record.error_msg = None;
            record.sdget_status = Some(0);
            record.sdget_error_msg = None;
        })
    }

    pub fn fail(
        &mut self,
        id: &FunctionalId,
        error_msg: &str,
        sdget_status: Option<i32>,
        sdget_error_msg: Option<&str>,
    ) -> Result<(), SyncError> {
        self.transition(id, TransferStatus::Error, |record| {
            record.error_msg = Some(error_msg.to_string());
            record.sdget_status = sdget_status;
            record.sdget_error_msg = sdget_error_msg.map(str::to_string);
        })
    }

    /// Marks a transfer for removal by a later sweep. Does not commit.
    pub fn deferred_delete(&mut self, id: &FunctionalId) -> Result<(), SyncError> {
        let mut record = self.require(id)?;
        if record.status != TransferStatus::Delete {
            record.previous_status = Some(record.status);
        }
        record.set_status(TransferStatus::Delete)?;
        record.error_msg = None;
        record.sdget_status = None;
        record.sdget_error_msg = None;
        self.store.upsert_transfer(record, false)
    }

    pub fn mark_for_delete(&mut self, ids: &[FunctionalId]) -> Result<usize, SyncError> {
        for id in ids {
            if let Err(err) = self.deferred_delete(id) {
                self.store.rollback()?;
                return Err(err);
            }
        }
        self.store.commit()?;
        Ok(ids.len())
    }

    /// Removes up to `limit` transfers marked for deletion, committing once at
    /// the end. Rows whose data could not be removed stay marked and are seen
    /// again by the next sweep.
    pub fn delete_transfers(
        &mut self,
        limit: Option<usize>,
        scope: DeleteScope,
    ) -> Result<SweepReport, SyncError> {
        let candidates = self
            .store
            .list_transfers(Some(TransferStatus::Delete), limit)?;
        let mut report = SweepReport::default();

        for record in &candidates {
            let removed = match scope {
                DeleteScope::DataAndMetadata => self.immediate_delete(record, &mut report),
                DeleteScope::MetadataOnly => self.immediate_md_delete(record),
            };
            if removed {
                report.removed += 1;
            } else {
                report.retained += 1;
            }
        }

        self.store.commit()?;
        report.remaining = self.store.count_transfers(TransferStatus::Delete)?;
        info!(
            removed = report.removed,
            retained = report.retained,
            remaining = report.remaining,
            "delete sweep committed"
        );
        Ok(report)
    }

    /// Drops transfers stuck in error or waiting, then the datasets they orphaned.
    pub fn reset(&mut self) -> Result<ResetReport, SyncError> {
        let transfers = self.purge_error_and_waiting()?;
        let datasets = self.purge_orphan_datasets()?;
        self.store.commit()?;
        info!(transfers, datasets, "transfer(s) removed");
        Ok(ResetReport {
            transfers,
            datasets,
        })
    }

    fn immediate_delete(&mut self, record: &TransferRecord, report: &mut SweepReport) -> bool {
        let path = self.full_local_path(record);
        info!(path = %path, "delete transfer");

        if self.fs.is_file(&path) {
            if let Err(err) = self.fs.remove_file(&path) {
                error!(path = %path, error = %err, "error occurred during file suppression");
                return false;
            }
            report.removed_paths.push(path);
            return self.delete_row(record);
        }

        if record.previous_status == Some(TransferStatus::Done) {
            error!(path = %path, "can't delete file: file not found");
        } else {
            debug!(path = %path, "no local data, removing metadata only");
        }
        self.delete_row(record)
    }

    fn immediate_md_delete(&mut self, record: &TransferRecord) -> bool {
        info!(path = %self.full_local_path(record), "delete metadata");
        self.delete_row(record)
    }

    fn delete_row(&mut self, record: &TransferRecord) -> bool {
        match self.store.delete_transfer(&record.file_functional_id, false) {
            Ok(()) => true,
            Err(err) => {
                error!(
                    id = %record.file_functional_id,
                    error = %err,
                    "error occurred during file metadata suppression"
                );
                false
            }
        }
    }

    fn purge_error_and_waiting(&mut self) -> Result<usize, SyncError> {
        let mut purged = 0;
        for status in [TransferStatus::Error, TransferStatus::Waiting] {
            for record in self.store.list_transfers(Some(status), None)? {
                self.store
                    .delete_transfer(&record.file_functional_id, false)?;
                purged += 1;
            }
        }
        Ok(purged)
    }

    fn purge_orphan_datasets(&mut self) -> Result<usize, SyncError> {
        let referenced = self
            .store
            .list_transfers(None, None)?
            .into_iter()
            .filter_map(|record| record.dataset_functional_id)
            .collect::<HashSet<_>>();
        let mut purged = 0;
        for dataset in self.store.list_datasets()? {
            if !referenced.contains(&dataset.functional_id) {
                self.store.delete_dataset(&dataset.functional_id, false)?;
                purged += 1;
            }
        }
        Ok(purged)
    }

    fn transition<M>(
        &mut self,
        id: &FunctionalId,
        next: TransferStatus,
        mutate: M,
    ) -> Result<(), SyncError>
    where
        M: FnOnce(&mut TransferRecord),
    {
        let mut record = self.require(id)?;
        record.set_status(next)?;
        mutate(&mut record);
        self.store.upsert_transfer(record, true)
    }

    fn require(&self, id: &FunctionalId) -> Result<TransferRecord, SyncError> {
        self.store
            .get_transfer(id)?
            .ok_or_else(|| SyncError::NotFound(format!("transfer {id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions() {
        assert!(TransferStatus::New.can_transition_to(TransferStatus::Waiting));
        assert!(TransferStatus::Done.can_transition_to(TransferStatus::Delete));
        assert!(!TransferStatus::Done.can_transition_to(TransferStatus::Running));
        assert!(!TransferStatus::New.can_transition_to(TransferStatus::Done));
    }

    #[test]
    fn relative_paths_join_data_folder() {
        let data = Utf8PathBuf::from("/srv/data");
        assert_eq!(
            build_full_local_path("cmip5/tas.nc", &data),
            Utf8PathBuf::from("/srv/data/cmip5/tas.nc")
        );
        assert_eq!(
            build_full_local_path("/abs/tas.nc", &data),
            Utf8PathBuf::from("/abs/tas.nc")
        );
    }
}

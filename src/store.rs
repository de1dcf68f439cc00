use std::collections::BTreeMap;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tempfile::Builder;
use tracing::debug;

use crate::domain::FunctionalId;
use crate::error::SyncError;
use crate::transfer::{DatasetEntry, TransferRecord, TransferStatus, TransferStore};

pub const CATALOG_FILE: &str = "transfers.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Catalog {
    #[serde(default)]
    transfers: BTreeMap<FunctionalId, TransferRecord>,
    #[serde(default)]
    datasets: BTreeMap<FunctionalId, DatasetEntry>,
}

/// Transfer catalog kept as one JSON document.
///
/// Uncommitted writes live in a working copy; `commit` replaces the file on
/// disk with a rename so a reader sees either the old or the new catalog.
#[derive(Debug, Clone)]
pub struct JsonTransferStore {
    path: Option<Utf8PathBuf>,
    committed: Catalog,
    working: Catalog,
}

impl JsonTransferStore {
    pub fn open(db_folder: &Utf8Path) -> Result<Self, SyncError> {
        let path = db_folder.join(CATALOG_FILE);
        let committed = if path.as_std_path().exists() {
            let content = fs::read(path.as_std_path())
                .map_err(|err| SyncError::Store(format!("{path}: {err}")))?;
            serde_json::from_slice(&content)
                .map_err(|err| SyncError::Store(format!("{path}: {err}")))?
        } else {
            Catalog::default()
        };
        debug!(path = %path, transfers = committed.transfers.len(), "catalog loaded");
        Ok(Self {
            path: Some(path),
            working: committed.clone(),
            committed,
        })
    }

    /// A catalog that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            committed: Catalog::default(),
            working: Catalog::default(),
        }
    }

    pub fn path(&self) -> Option<&Utf8Path> {
        self.path.as_deref()
    }

    pub fn has_pending_changes(&self) -> bool {
        self.committed.transfers != self.working.transfers
            || self.committed.datasets != self.working.datasets
    }

    fn write_catalog(path: &Utf8Path, catalog: &Catalog) -> Result<(), SyncError> {
        let parent = path
            .parent()
            .ok_or_else(|| SyncError::Store(format!("invalid catalog path: {path}")))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        let content = serde_json::to_vec_pretty(catalog)
            .map_err(|err| SyncError::Store(err.to_string()))?;
        let temp = Builder::new()
            .prefix("climsync-catalog")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        fs::write(temp.path(), &content).map_err(|err| SyncError::Filesystem(err.to_string()))?;
        temp.persist(path.as_std_path())
            .map_err(|err| SyncError::Filesystem(err.error.to_string()))?;
        Ok(())
    }

    fn maybe_commit(&mut self, commit: bool) -> Result<(), SyncError> {
        if commit { self.commit() } else { Ok(()) }
    }
}

impl TransferStore for JsonTransferStore {
    fn get_transfer(&self, id: &FunctionalId) -> Result<Option<TransferRecord>, SyncError> {
        Ok(self.working.transfers.get(id).cloned())
    }

    fn list_transfers(
        &self,
        status: Option<TransferStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<TransferRecord>, SyncError> {
        Ok(self
            .working
            .transfers
            .values()
            .filter(|record| status.is_none_or(|status| record.status == status))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    fn count_transfers(&self, status: TransferStatus) -> Result<usize, SyncError> {
        Ok(self
            .working
            .transfers
            .values()
            .filter(|record| record.status == status)
            .count())
    }

    fn upsert_transfer(&mut self, record: TransferRecord, commit: bool) -> Result<(), SyncError> {
        self.working
            .transfers
            .insert(record.file_functional_id.clone(), record);
        self.maybe_commit(commit)
    }

    fn delete_transfer(&mut self, id: &FunctionalId, commit: bool) -> Result<(), SyncError> {
        if self.working.transfers.remove(id).is_none() {
            return Err(SyncError::NotFound(format!("transfer {id}")));
        }
        self.maybe_commit(commit)
    }

    fn get_dataset(&self, id: &FunctionalId) -> Result<Option<DatasetEntry>, SyncError> {
        Ok(self.working.datasets.get(id).cloned())
    }

    fn list_datasets(&self) -> Result<Vec<DatasetEntry>, SyncError> {
        Ok(self.working.datasets.values().cloned().collect())
    }

    fn upsert_dataset(&mut self, dataset: DatasetEntry, commit: bool) -> Result<(), SyncError> {
        self.working
            .datasets
            .insert(dataset.functional_id.clone(), dataset);
        self.maybe_commit(commit)
    }

    fn delete_dataset(&mut self, id: &FunctionalId, commit: bool) -> Result<(), SyncError> {
        if self.working.datasets.remove(id).is_none() {
            return Err(SyncError::NotFound(format!("dataset {id}")));
        }
        self.maybe_commit(commit)
    }

    fn commit(&mut self) -> Result<(), SyncError> {
        if let Some(path) = &self.path {
            Self::write_catalog(path, &self.working)?;
        }
        self.committed = self.working.clone();
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), SyncError> {
        self.working = self.committed.clone();
        Ok(())
    }
}

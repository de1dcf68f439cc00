use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;

use crate::cleanup::{CleanupReport, part_cleanup};
use crate::collection::RecordCollection;
use crate::config::ResolvedConfig;
use crate::domain::{FunctionalId, Record};
use crate::error::SyncError;
use crate::nearest::{DistanceCache, NearestSelector};
use crate::pipeline::{
    Engine, LATEST_STATE, NEAREST_STATE, PipelineRun, SANITIZE_STATE, Transform,
    post_search_pipeline,
};
use crate::probe::NetworkProbe;
use crate::sanitize::remove_anomalies;
use crate::store::JsonTransferStore;
use crate::transfer::{
    DeleteScope, InstallReport, LifecycleManager, OsFs, ResetReport, SweepReport,
};
use crate::version::{DatasetVersion, DatasetVersions, keep_latest_versions};

#[derive(Debug, Clone, Serialize)]
pub struct FilterResult {
    pub pipeline: String,
    pub visited: Vec<String>,
    pub count: usize,
    pub size: u64,
    pub records: Vec<Record>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstallResult {
    pub selected: usize,
    #[serde(flatten)]
    pub report: InstallReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct RemoveResult {
    pub marked: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepResult {
    #[serde(flatten)]
    pub report: SweepReport,
    pub empty_files_removed: usize,
    pub empty_dirs_removed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct LatestResult {
    pub datasets: Vec<LatestEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LatestEntry {
    pub dataset: String,
    /// Oldest first.
    pub versions: Vec<String>,
    pub latest: String,
    pub flagged_latest: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

pub struct App<P: NetworkProbe> {
    config: ResolvedConfig,
    probe: P,
    cache: DistanceCache,
}

impl<P: NetworkProbe> App<P> {
    pub fn new(config: ResolvedConfig, probe: P) -> Self {
        Self {
            config,
            probe,
            cache: DistanceCache::new(),
        }
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    /// Reads search results from a JSON array or a JSON-lines file.
    pub fn load_records(&self, path: &Utf8Path) -> Result<RecordCollection, SyncError> {
        let file = File::open(path.as_std_path())
            .map_err(|err| SyncError::Filesystem(format!("open {path}: {err}")))?;
        let mut reader = BufReader::new(file);
        let mut collection = RecordCollection::new(self.config.storage)?;

        let starts_with_array = reader
            .fill_buf()
            .map_err(|err| SyncError::Filesystem(err.to_string()))?
            .iter()
            .find(|byte| !byte.is_ascii_whitespace())
            == Some(&b'[');

        if starts_with_array {
            let mut content = String::new();
            reader
                .read_to_string(&mut content)
                .map_err(|err| SyncError::Filesystem(err.to_string()))?;
            let records: Vec<Record> = serde_json::from_str(&content)
                .map_err(|err| SyncError::InvalidRecord(format!("{path}: {err}")))?;
            for chunk in records.chunks(self.config.chunk_size) {
                collection.append(chunk.to_vec())?;
            }
            return Ok(collection);
        }

        let mut batch = Vec::with_capacity(self.config.chunk_size.min(1024));
        for (number, line) in reader.lines().enumerate() {
            let line = line.map_err(|err| SyncError::Filesystem(err.to_string()))?;
            if line.trim().is_empty() {
                continue;
            }
            let record: Record = serde_json::from_str(&line).map_err(|err| {
                SyncError::InvalidRecord(format!("{path}:{}: {err}", number + 1))
            })?;
            batch.push(record);
            if batch.len() >= self.config.chunk_size {
                collection.append(std::mem::take(&mut batch))?;
            }
        }
        collection.append(batch)?;
        Ok(collection)
    }

    /// Runs the post-search pipeline over `input`.
    pub fn filter(
        &self,
        input: RecordCollection,
        sink: &dyn ProgressSink,
    ) -> Result<FilterResult, SyncError> {
        let (pipeline, run) = self.run_pipeline(input, sink)?;
        Ok(FilterResult {
            pipeline,
            visited: run.visited,
            count: run.output.count(),
            size: run.output.size(),
            records: run.output.records()?,
        })
    }

    /// Filters `input` and queues the surviving files for download.
    ///
    /// The kept records are read back chunk by chunk from the pipeline output,
    /// so a spooled collection is never loaded whole.
    pub fn install(
        &self,
        input: RecordCollection,
        sink: &dyn ProgressSink,
    ) -> Result<InstallResult, SyncError> {
        let (_, run) = self.run_pipeline(input, sink)?;
        let selected = run.output.count();

        sink.event(ProgressEvent {
            message: format!("phase=Install; {selected} file(s) selected"),
            elapsed: None,
        });
        let mut manager = self.manager()?;
        let report = manager.install(&run.output, self.config.chunk_size)?;
        Ok(InstallResult { selected, report })
    }

    fn run_pipeline(
        &self,
        input: RecordCollection,
        sink: &dyn ProgressSink,
    ) -> Result<(String, PipelineRun), SyncError> {
        let started = Instant::now();
        sink.event(ProgressEvent {
            message: format!("phase=Filter; {} record(s)", input.count()),
            elapsed: None,
        });

        let pipeline = post_search_pipeline()?;
        let chunk_size = self.config.chunk_size;
        let log_inconsistency = self.config.log_domain_inconsistency;
        let selector = NearestSelector::new(
            self.config.nearest_mode,
            &self.probe,
            &self.cache,
            self.config.max_parallel,
            chunk_size,
        );

        let mut engine = Engine::new(chunk_size)
            .register(
                SANITIZE_STATE,
                Transform::chunked(move |records| Ok(remove_anomalies(records, log_inconsistency))),
            )
            .register(
                NEAREST_STATE,
                Transform::whole(|collection| selector.select(collection)),
            );
        if self.config.keep_latest_version {
            engine = engine.register(
                LATEST_STATE,
                Transform::whole(move |collection| keep_latest_versions(collection, chunk_size)),
            );
        }

        let run = engine.run(&pipeline, input)?;
        sink.event(ProgressEvent {
            message: format!("phase=Filter; kept {} record(s)", run.output.count()),
            elapsed: Some(started.elapsed()),
        });
        Ok((pipeline.name().to_string(), run))
    }

    pub fn remove(
        &self,
        ids: &[FunctionalId],
        sink: &dyn ProgressSink,
    ) -> Result<RemoveResult, SyncError> {
        sink.event(ProgressEvent {
            message: format!("phase=Remove; marking {} transfer(s)", ids.len()),
            elapsed: None,
        });
        let mut manager = self.manager()?;
        let marked = manager.mark_for_delete(ids)?;
        Ok(RemoveResult { marked })
    }

    /// Deletes transfers marked for removal, then tidies emptied directories.
    pub fn sweep(
        &self,
        limit: Option<usize>,
        scope: DeleteScope,
        sink: &dyn ProgressSink,
    ) -> Result<SweepResult, SyncError> {
        let started = Instant::now();
        sink.event(ProgressEvent {
            message: "phase=Sweep; deleting marked transfers".to_string(),
            elapsed: None,
        });
        let mut manager = self.manager()?;
        let report = manager.delete_transfers(limit, scope)?;

        let mut parents = report
            .removed_paths
            .iter()
            .filter_map(|path| path.parent().map(Utf8Path::to_path_buf))
            .collect::<Vec<Utf8PathBuf>>();
        parents.sort();
        parents.dedup();
        let cleanup = if parents.is_empty() {
            CleanupReport::default()
        } else {
            part_cleanup(parents.iter().map(Utf8PathBuf::as_path), &self.config.data_folder)?
        };

        sink.event(ProgressEvent {
            message: format!("phase=Sweep; {} transfer(s) left to delete", report.remaining),
            elapsed: Some(started.elapsed()),
        });
        Ok(SweepResult {
            report,
            empty_files_removed: cleanup.files,
            empty_dirs_removed: cleanup.directories,
        })
    }

    pub fn reset(&self, sink: &dyn ProgressSink) -> Result<ResetReport, SyncError> {
        sink.event(ProgressEvent {
            message: "phase=Reset; purging error and waiting transfers".to_string(),
            elapsed: None,
        });
        self.manager()?.reset()
    }

    /// Lists the known versions of every dataset in `input` and the most recent one.
    pub fn latest(
        &self,
        input: &RecordCollection,
        sink: &dyn ProgressSink,
    ) -> Result<LatestResult, SyncError> {
        sink.event(ProgressEvent {
            message: "phase=Latest; ordering dataset versions".to_string(),
            elapsed: None,
        });
        let mut groups: BTreeMap<String, DatasetVersions> = BTreeMap::new();
        for chunk in input.chunks(self.config.chunk_size)? {
            for record in chunk? {
                if let Some(dataset) = record.as_dataset() {
                    if let Some(version) = DatasetVersion::from_record(dataset) {
                        groups.entry(dataset.group_key()).or_default().add(version);
                    }
                }
            }
        }

        let mut datasets = Vec::with_capacity(groups.len());
        for (dataset, versions) in groups {
            let sorted = versions
                .sorted()?
                .into_iter()
                .map(|d| d.version.clone())
                .collect();
            let flagged_latest = if versions.exists_version_with_latest_flag() {
                Some(versions.latest_flagged()?.version.clone())
            } else {
                None
            };
            datasets.push(LatestEntry {
                dataset,
                versions: sorted,
                latest: versions.latest()?.version.clone(),
                flagged_latest,
            });
        }
        Ok(LatestResult { datasets })
    }

    fn manager(&self) -> Result<LifecycleManager<JsonTransferStore, OsFs>, SyncError> {
        let store = JsonTransferStore::open(&self.config.db_folder)?;
        Ok(LifecycleManager::new(
            store,
            OsFs,
            self.config.data_folder.clone(),
        ))
    }
}

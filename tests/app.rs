use std::cell::RefCell;
use std::fs;

use camino::Utf8PathBuf;
use serde_json::json;
use tempfile::TempDir;

use climsync::app::{App, ProgressEvent, ProgressSink};
use climsync::collection::StorageMode;
use climsync::config::{ProbeSettings, ResolvedConfig};
use climsync::domain::{DataNode, NearestMode};
use climsync::error::SyncError;
use climsync::output::JsonOutput;
use climsync::pipeline::DONE_STATE;
use climsync::probe::{Coordinates, NetworkProbe, PingStats, RttOutcome};
use climsync::transfer::DeleteScope;

struct FixedProbe;

impl NetworkProbe for FixedProbe {
    fn ping(&self, host: &DataNode) -> Result<RttOutcome, SyncError> {
        let avg = match host.as_str() {
            "esgf.ipsl.fr" => 12.0,
            "esgf.llnl.gov" => 140.0,
            _ => return Ok(RttOutcome::Unreachable),
        };
        Ok(RttOutcome::Measured(PingStats {
            min: avg,
            avg,
            max: avg,
            mdev: 0.0,
        }))
    }

    fn geolocate(&self, _host: &DataNode) -> Result<Coordinates, SyncError> {
        Err(SyncError::ProbeHttp("not implemented".to_string()))
    }

    fn local_coordinates(&self) -> Result<Coordinates, SyncError> {
        Err(SyncError::ProbeHttp("not implemented".to_string()))
    }
}

#[derive(Default)]
struct RecordingSink {
    messages: RefCell<Vec<String>>,
}

impl ProgressSink for RecordingSink {
    fn event(&self, event: ProgressEvent) {
        self.messages.borrow_mut().push(event.message);
    }
}

fn config(root: &Utf8PathBuf) -> ResolvedConfig {
    ResolvedConfig {
        nearest_mode: NearestMode::Rtt,
        chunk_size: 2,
        max_parallel: 2,
        storage: StorageMode::Spool,
        data_folder: root.join("data"),
        db_folder: root.join("db"),
        keep_latest_version: false,
        log_domain_inconsistency: true,
        probe: ProbeSettings::default(),
    }
}

fn search_results(root: &Utf8PathBuf) -> Utf8PathBuf {
    let lines = [
        json!({"type": "File", "file_functional_id": ["tas_1.nc"], "data_node": ["esgf.llnl.gov"],
               "variable": ["tas"], "size": [10], "url": ["http://esgf.llnl.gov/tas_1.nc"],
               "local_path": "cmip5/tas_1.nc", "dataset_functional_id": "cmip5.ipsl.v1"}),
        json!({"type": "File", "file_functional_id": ["tas_1.nc"], "data_node": ["esgf.ipsl.fr"],
               "variable": ["tas"], "size": [10], "url": ["http://esgf.ipsl.fr/tas_1.nc"],
               "local_path": "cmip5/tas_1.nc", "dataset_functional_id": "cmip5.ipsl.v1"}),
        json!({"type": "File", "file_functional_id": ["tas_1.nc"], "data_node": ["esgf.ipsl.fr"],
               "variable": ["tas"], "size": [10], "url": ["http://esgf.ipsl.fr/tas_1.nc"],
               "local_path": "cmip5/tas_1.nc", "dataset_functional_id": "cmip5.ipsl.v1"}),
        json!({"type": "File", "file_functional_id": "multi.nc", "data_node": "esgf.ipsl.fr",
               "variable": ["tas", "pr"], "url": "http://esgf.ipsl.fr/multi.nc"}),
        json!({"type": "File", "file_functional_id": "pr_1.nc", "data_node": "esgf.llnl.gov",
               "variable": "pr", "size": 5, "url": "http://esgf.llnl.gov/pr_1.nc",
               "local_path": "cmip5/pr_1.nc", "dataset_functional_id": "cmip5.ipsl.v1"}),
    ];
    let content = lines
        .iter()
        .map(|line| line.to_string())
        .collect::<Vec<_>>()
        .join("\n");
    let path = root.join("search.jsonl");
    fs::write(path.as_std_path(), content).unwrap();
    path
}

fn temp_root() -> (TempDir, Utf8PathBuf) {
    let temp = TempDir::new().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    (temp, root)
}

#[test]
fn filter_runs_full_pipeline() {
    let (_temp, root) = temp_root();
    let app = App::new(config(&root), FixedProbe);
    let sink = RecordingSink::default();

    let input = app.load_records(&search_results(&root)).unwrap();
    assert_eq!(input.count(), 5);
    let result = app.filter(input, &sink).unwrap();

    assert_eq!(result.visited.last().map(String::as_str), Some(DONE_STATE));
    let kept = result
        .records
        .iter()
        .map(|r| (r.functional_id().to_string(), r.data_node().to_string()))
        .collect::<Vec<_>>();
    assert_eq!(
        kept,
        vec![
            ("tas_1.nc".to_string(), "esgf.ipsl.fr".to_string()),
            ("pr_1.nc".to_string(), "esgf.llnl.gov".to_string()),
        ]
    );
    assert_eq!(result.size, 15);
    assert!(sink.messages.borrow().iter().any(|m| m.starts_with("phase=Filter")));
}

#[test]
fn install_remove_sweep_round() {
    let (_temp, root) = temp_root();
    let app = App::new(config(&root), FixedProbe);
    let sink = RecordingSink::default();

    let input = app.load_records(&search_results(&root)).unwrap();
    let installed = app.install(input, &sink).unwrap();
    assert_eq!(installed.selected, 2);
    assert_eq!(installed.report.added, 2);

    let local = root.join("data/cmip5/tas_1.nc");
    fs::create_dir_all(local.parent().unwrap().as_std_path()).unwrap();
    fs::write(local.as_std_path(), b"netcdf").unwrap();

    let removed = app
        .remove(&["tas_1.nc".parse().unwrap()], &sink)
        .unwrap();
    assert_eq!(removed.marked, 1);

    let swept = app
        .sweep(None, DeleteScope::DataAndMetadata, &sink)
        .unwrap();
    assert_eq!(swept.report.removed, 1);
    assert_eq!(swept.report.remaining, 0);
    assert!(!local.as_std_path().exists());
    assert_eq!(swept.empty_dirs_removed, 2);
    assert!(root.join("data").as_std_path().is_dir());

    let reset = app.reset(&sink).unwrap();
    assert_eq!(reset.transfers, 1);
    assert_eq!(reset.datasets, 1);
}

#[test]
fn install_reads_spooled_output_chunk_by_chunk() {
    let (_temp, root) = temp_root();
    let app = App::new(config(&root), FixedProbe);
    let path = root.join("many.jsonl");
    let content = (0..7)
        .map(|i| {
            json!({"type": "File", "file_functional_id": format!("tas_{i}.nc"),
                   "data_node": "esgf.ipsl.fr", "variable": "tas", "size": 3,
                   "url": format!("http://esgf.ipsl.fr/tas_{i}.nc"),
                   "local_path": format!("cmip5/tas_{i}.nc"),
                   "dataset_functional_id": "cmip5.ipsl.v1"})
            .to_string()
        })
        .collect::<Vec<_>>()
        .join("\n");
    fs::write(path.as_std_path(), content).unwrap();

    let input = app.load_records(&path).unwrap();
    assert_eq!(input.mode(), StorageMode::Spool);
    let installed = app.install(input, &RecordingSink::default()).unwrap();

    assert_eq!(installed.selected, 7);
    assert_eq!(installed.report.added, 7);
    assert_eq!(installed.report.skipped, 0);
}

#[test]
fn latest_lists_versions_per_dataset() {
    let (_temp, root) = temp_root();
    let app = App::new(config(&root), FixedProbe);
    let path = root.join("datasets.json");
    let records = json!([
        {"type": "Dataset", "dataset_functional_id": "cmip5.ipsl.tas.v20120101",
         "data_node": "esgf.ipsl.fr", "version": "v20120101", "latest": true},
        {"type": "Dataset", "dataset_functional_id": "cmip5.ipsl.tas.v20110101",
         "data_node": "esgf.ipsl.fr", "version": "v20110101", "latest": false},
    ]);
    fs::write(path.as_std_path(), records.to_string()).unwrap();

    let input = app.load_records(&path).unwrap();
    let result = app.latest(&input, &RecordingSink::default()).unwrap();

    assert_eq!(result.datasets.len(), 1);
    let entry = &result.datasets[0];
    assert_eq!(entry.dataset, "cmip5.ipsl.tas");
    assert_eq!(entry.versions, vec!["v20110101", "v20120101"]);
    assert_eq!(entry.latest, "v20120101");
    assert_eq!(entry.flagged_latest.as_deref(), Some("v20120101"));
}

#[test]
fn malformed_line_is_invalid_record() {
    let (_temp, root) = temp_root();
    let app = App::new(config(&root), FixedProbe);
    let path = root.join("broken.jsonl");
    fs::write(path.as_std_path(), "{\"type\": \"File\"}\n").unwrap();

    let err = app.load_records(&path).unwrap_err();

    assert!(matches!(err, SyncError::InvalidRecord(_)));
}

#[test]
fn json_output_sink_ignores_progress() {
    JsonOutput.event(ProgressEvent {
        message: "phase=Filter".to_string(),
        elapsed: None,
    });
}

use std::fs;

use assert_matches::assert_matches;
use tempfile::TempDir;

use climsync::collection::StorageMode;
use climsync::config::{Config, ConfigLoader, DEFAULT_MAX_PARALLEL};
use climsync::domain::NearestMode;
use climsync::error::SyncError;

#[test]
fn resolve_reads_json_file() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("climsync.json");
    fs::write(
        &path,
        r#"{
            "nearest_mode": "geolocation",
            "chunk_size": 100,
            "lowmem": false,
            "data_folder": "/srv/climate/data",
            "db_folder": "/srv/climate/db",
            "keep_latest_version": true,
            "probe": {"ping_count": 3, "geolocation_url": "http://geo.local/json/"}
        }"#,
    )
    .unwrap();

    let resolved = ConfigLoader::resolve(path.to_str()).unwrap();

    assert_eq!(resolved.nearest_mode, NearestMode::Geolocation);
    assert_eq!(resolved.chunk_size, 100);
    assert_eq!(resolved.max_parallel, DEFAULT_MAX_PARALLEL);
    assert_eq!(resolved.storage, StorageMode::Memory);
    assert_eq!(resolved.data_folder.as_str(), "/srv/climate/data");
    assert!(resolved.keep_latest_version);
    assert_eq!(resolved.probe.ping_count, 3);
    assert_eq!(resolved.probe.timeout_secs, 5);
}

#[test]
fn explicit_missing_file_is_read_error() {
    let err = ConfigLoader::resolve(Some("/nonexistent/climsync.json")).unwrap_err();
    assert_matches!(err, SyncError::ConfigRead(_));
}

#[test]
fn malformed_file_is_parse_error() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("climsync.json");
    fs::write(&path, "{ nearest_mode: rtt }").unwrap();

    let err = ConfigLoader::resolve(path.to_str()).unwrap_err();
    assert_matches!(err, SyncError::ConfigParse(_));
}

#[test]
fn zero_chunk_size_is_rejected() {
    let config = Config {
        chunk_size: Some(0),
        data_folder: Some("/tmp/data".to_string()),
        db_folder: Some("/tmp/db".to_string()),
        ..Config::default()
    };
    assert_matches!(
        ConfigLoader::resolve_config(config),
        Err(SyncError::Configuration(_))
    );
}

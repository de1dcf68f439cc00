use std::fs;
use std::path::PathBuf;

use camino::Utf8PathBuf;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::collection::StorageMode;
use crate::domain::NearestMode;
use crate::error::SyncError;

pub const DEFAULT_CONFIG_FILE: &str = "climsync.json";
pub const DEFAULT_CHUNK_SIZE: usize = 5000;
pub const DEFAULT_MAX_PARALLEL: usize = 8;
pub const DEFAULT_GEOLOCATION_URL: &str = "http://ip-api.com/json";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub nearest_mode: Option<String>,
    #[serde(default)]
    pub chunk_size: Option<usize>,
    #[serde(default)]
    pub max_parallel: Option<usize>,
    #[serde(default)]
    pub lowmem: Option<bool>,
    #[serde(default)]
    pub data_folder: Option<String>,
    #[serde(default)]
    pub db_folder: Option<String>,
    #[serde(default)]
    pub keep_latest_version: Option<bool>,
    #[serde(default)]
    pub log_domain_inconsistency: Option<bool>,
    #[serde(default)]
    pub probe: Option<ProbeEntry>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ProbeEntry {
    #[serde(default)]
    pub ping_count: Option<u32>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub geolocation_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ProbeSettings {
    pub ping_count: u32,
    pub timeout_secs: u64,
    pub geolocation_url: String,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            ping_count: 1,
            timeout_secs: 5,
            geolocation_url: DEFAULT_GEOLOCATION_URL.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub nearest_mode: NearestMode,
    pub chunk_size: usize,
    pub max_parallel: usize,
    pub storage: StorageMode,
    pub data_folder: Utf8PathBuf,
    pub db_folder: Utf8PathBuf,
    pub keep_latest_version: bool,
    pub log_domain_inconsistency: bool,
    pub probe: ProbeSettings,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads `path`, or `climsync.json` in the current directory when present.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, SyncError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Self::resolve_config(Config::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| SyncError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| SyncError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, SyncError> {
        let nearest_mode = match config.nearest_mode.as_deref() {
            Some(value) => value.parse()?,
            None => NearestMode::Rtt,
        };
        let chunk_size = positive("chunk_size", config.chunk_size, DEFAULT_CHUNK_SIZE)?;
        let max_parallel = positive("max_parallel", config.max_parallel, DEFAULT_MAX_PARALLEL)?;
        let storage = if config.lowmem.unwrap_or(true) {
            StorageMode::Spool
        } else {
            StorageMode::Memory
        };

        let data_folder = match config.data_folder {
            Some(folder) => Utf8PathBuf::from(folder),
            None => default_root()?.join("data"),
        };
        let db_folder = match config.db_folder {
            Some(folder) => Utf8PathBuf::from(folder),
            None => default_root()?.join("db"),
        };

        let defaults = ProbeSettings::default();
        let probe = match config.probe {
            Some(entry) => ProbeSettings {
                ping_count: entry.ping_count.unwrap_or(defaults.ping_count),
                timeout_secs: entry.timeout_secs.unwrap_or(defaults.timeout_secs),
                geolocation_url: entry.geolocation_url.unwrap_or(defaults.geolocation_url),
            },
            None => defaults,
        };
        if probe.timeout_secs == 0 {
            return Err(SyncError::Configuration(
                "probe.timeout_secs must be greater than zero".to_string(),
            ));
        }

        Ok(ResolvedConfig {
            nearest_mode,
            chunk_size,
            max_parallel,
            storage,
            data_folder,
            db_folder,
            keep_latest_version: config.keep_latest_version.unwrap_or(false),
            log_domain_inconsistency: config.log_domain_inconsistency.unwrap_or(false),
            probe,
        })
    }
}

fn positive(key: &str, value: Option<usize>, default: usize) -> Result<usize, SyncError> {
    match value {
        Some(0) => Err(SyncError::Configuration(format!(
            "{key} must be greater than zero"
        ))),
        Some(value) => Ok(value),
        None => Ok(default),
    }
}

fn default_root() -> Result<Utf8PathBuf, SyncError> {
    ProjectDirs::from("org", "climsync", "climsync")
        .and_then(|dirs| Utf8PathBuf::from_path_buf(dirs.data_dir().to_path_buf()).ok())
        .ok_or_else(|| SyncError::Filesystem("unable to resolve data directory".to_string()))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn defaults_apply() {
        let config = Config {
            data_folder: Some("/tmp/climsync/data".to_string()),
            db_folder: Some("/tmp/climsync/db".to_string()),
            ..Config::default()
        };

        let resolved = ConfigLoader::resolve_config(config).unwrap();
        assert_eq!(resolved.nearest_mode, NearestMode::Rtt);
        assert_eq!(resolved.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(resolved.storage, StorageMode::Spool);
        assert_eq!(resolved.probe.ping_count, 1);
    }

    #[test]
    fn unknown_nearest_mode_is_configuration_error() {
        let config = Config {
            nearest_mode: Some("closest".to_string()),
            data_folder: Some("/tmp/data".to_string()),
            db_folder: Some("/tmp/db".to_string()),
            ..Config::default()
        };
        let err = ConfigLoader::resolve_config(config).unwrap_err();
        assert_matches!(err, SyncError::Configuration(_));
    }
}

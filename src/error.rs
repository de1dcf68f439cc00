use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Clone, Error, Diagnostic)]
pub enum SyncError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("incorrect version number ({left},{right})")]
    Version { left: String, right: String },

    #[error("fatal error: {0}")]
    Fatal(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("probe failed for {host}: {message}")]
    Probe { host: String, message: String },

    #[error("geolocation request failed: {0}")]
    ProbeHttp(String),

    #[error("geolocation service returned status {status}: {message}")]
    ProbeStatus { status: u16, message: String },

    #[error("malformed geolocation response: {0}")]
    ProbeResponse(String),

    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("invalid transfer status: {0}")]
    InvalidStatus(String),

    #[error("illegal transfer transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("record store error: {0}")]
    Store(String),
}

use std::io::{self, Write};

use serde::Serialize;

use crate::app::{
    FilterResult, InstallResult, LatestResult, ProgressEvent, ProgressSink, RemoveResult,
    SweepResult,
};
use crate::transfer::ResetReport;

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_filter(result: &FilterResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_install(result: &InstallResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_remove(result: &RemoveResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_sweep(result: &SweepResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_reset(result: &ResetReport) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_latest(result: &LatestResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

/// Writes progress events to stderr through `tracing`.
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => tracing::info!(
                elapsed_ms = elapsed.as_millis() as u64,
                "{}",
                event.message
            ),
            None => tracing::info!("{}", event.message),
        }
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

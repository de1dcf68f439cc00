use std::process::Command;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};

use crate::config::ProbeSettings;
use crate::domain::DataNode;
use crate::error::SyncError;

static PING_SUMMARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"min/avg/max/mdev = ([0-9.]+)/([0-9.]+)/([0-9.]+)/([0-9.]+) ms")
        .expect("valid ping summary regex")
});

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PingStats {
    pub min: f64,
    pub avg: f64,
    pub max: f64,
    pub mdev: f64,
}

/// Result of a round-trip probe. A silent host is not an error.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RttOutcome {
    Measured(PingStats),
    Unreachable,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    #[serde(alias = "lat")]
    pub latitude: f64,
    #[serde(alias = "lon")]
    pub longitude: f64,
}

pub trait NetworkProbe: Send + Sync {
    fn ping(&self, host: &DataNode) -> Result<RttOutcome, SyncError>;
    fn geolocate(&self, host: &DataNode) -> Result<Coordinates, SyncError>;
    fn local_coordinates(&self) -> Result<Coordinates, SyncError>;

    fn distance(&self, a: Coordinates, b: Coordinates) -> f64 {
        haversine_km(a, b)
    }
}

/// Great-circle distance in kilometres.
pub fn haversine_km(a: Coordinates, b: Coordinates) -> f64 {
    const EARTH_RADIUS_KM: f64 = 6371.0;
    let (lat_a, lat_b) = (a.latitude.to_radians(), b.latitude.to_radians());
    let d_lat = lat_b - lat_a;
    let d_lon = (b.longitude - a.longitude).to_radians();
    let h = (d_lat / 2.0).sin().powi(2) + lat_a.cos() * lat_b.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

pub fn parse_ping_summary(output: &str) -> Option<PingStats> {
    let captures = PING_SUMMARY.captures(output)?;
    let value = |index: usize| captures.get(index)?.as_str().parse::<f64>().ok();
    Some(PingStats {
        min: value(1)?,
        avg: value(2)?,
        max: value(3)?,
        mdev: value(4)?,
    })
}

/// Probes hosts with the system `ping` and an HTTP geolocation service.
#[derive(Clone)]
pub struct SystemProbe {
    client: Client,
    geolocation_url: String,
    ping_count: u32,
    timeout: Duration,
}

impl SystemProbe {
    pub fn new(settings: &ProbeSettings) -> Result<Self, SyncError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("climsync/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| SyncError::ProbeHttp(err.to_string()))?,
        );
        let timeout = Duration::from_secs(settings.timeout_secs);
        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|err| SyncError::ProbeHttp(err.to_string()))?;
        Ok(Self {
            client,
            geolocation_url: settings.geolocation_url.trim_end_matches('/').to_string(),
            ping_count: settings.ping_count.max(1),
            timeout,
        })
    }

    fn fetch_coordinates(&self, url: String) -> Result<Coordinates, SyncError> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|err| SyncError::ProbeHttp(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "geolocation request failed".to_string());
            return Err(SyncError::ProbeStatus { status, message });
        }
        let body = response
            .text()
            .map_err(|err| SyncError::ProbeHttp(err.to_string()))?;
        serde_json::from_str::<Coordinates>(&body)
            .map_err(|err| SyncError::ProbeResponse(err.to_string()))
    }
}

impl NetworkProbe for SystemProbe {
    fn ping(&self, host: &DataNode) -> Result<RttOutcome, SyncError> {
        let deadline = self.timeout.as_secs().max(1).to_string();
        let output = Command::new("ping")
            .args(["-q", "-c", &self.ping_count.to_string(), "-w", &deadline])
            .arg(host.as_str())
            .output()
            .map_err(|err| SyncError::Probe {
                host: host.to_string(),
                message: err.to_string(),
            })?;
        if !output.status.success() {
            return Ok(RttOutcome::Unreachable);
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_ping_summary(&stdout)
            .map(RttOutcome::Measured)
            .ok_or_else(|| SyncError::Probe {
                host: host.to_string(),
                message: format!("unparsable ping output ({})", stdout.trim()),
            })
    }

    fn geolocate(&self, host: &DataNode) -> Result<Coordinates, SyncError> {
        self.fetch_coordinates(format!("{}/{}", self.geolocation_url, host.as_str()))
    }

    fn local_coordinates(&self) -> Result<Coordinates, SyncError> {
        self.fetch_coordinates(self.geolocation_url.clone())
    }
}

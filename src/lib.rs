pub mod alerts;
pub mod config;
pub mod discovery;
pub mod evaluator;
pub mod fetcher;
pub mod notify;
pub mod protocol;
pub mod rules;
pub mod scheduler;
pub mod store;
pub mod util;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One normalized telemetry snapshot for a device at a point in time.
///
/// Readings are immutable once created; the fetch cycle appends them to
/// the reading store and never rewrites history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Device identifier (dotted IPv4 address)
    pub device_id: String,

    /// When the device reported, or when we polled it (always UTC)
    pub timestamp: DateTime<Utc>,

    /// Hashrate in TH/s
    pub hashrate_ths: f64,

    /// Power draw in watts (0.0 when the firmware reports none)
    pub power_w: f64,

    /// Average temperature across all reported sensors (°C)
    pub avg_temp_c: f64,

    /// Average fan speed across all reported fans (RPM)
    pub avg_fan_rpm: f64,

    /// Uptime in seconds as reported by the device
    pub elapsed_s: i64,

    /// Vendor model string, best-effort ("" when undetectable)
    pub model: String,
}

impl Reading {
    /// Age of this reading relative to `now`.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.timestamp
    }
}

/// Whether a fetched reading came from the device or from stored history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    Live,
    Fallback,
}

/// A reading plus its provenance, as returned by the fan-out fetcher.
#[derive(Debug, Clone)]
pub struct FetchedReading {
    pub reading: Reading,
    pub source: DataSource,
}

/// Operator-maintained metadata for a device, served by the device store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceMeta {
    pub device_id: String,
    pub model: Option<String>,
    pub nominal_ths: Option<f64>,
    pub power_cap_w: Option<f64>,
    #[serde(default)]
    pub tags: Vec<String>,
}

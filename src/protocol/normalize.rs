//! Vendor-agnostic response normalization
//!
//! Firmwares disagree on everything: hashrate units and key names,
//! where temperatures live, whether fans are "fan1" or "Fan Speed In".
//! The normalizer maps whatever came back into a canonical [`Reading`]
//! by scanning key names, and must tolerate missing keys and
//! non-numeric values without ever failing.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::Reading;

/// Hashrate field families in priority order, with the divisor that
/// converts the unit to TH/s. First present key wins.
const HASHRATE_KEYS: [(&str, f64); 6] = [
    ("GHS 5s", 1e3),
    ("GHS av", 1e3),
    ("GHS 1s", 1e3),
    ("MHS 5s", 1e6),
    ("MHS av", 1e6),
    ("MHS 1s", 1e6),
];

/// Stats keys recognized as per-board power draw (lowercase)
const POWER_KEYS: [&str; 4] = ["power", "device power", "power_draw", "chain_power"];

/// Keys that may carry the model name, for the recursive fallback scan
/// (lowercase, whitespace-insensitive)
const MODEL_KEYS: [&str; 9] = [
    "model",
    "type",
    "miner type",
    "minertype",
    "modelname",
    "miner name",
    "product type",
    "product",
    "hw type",
];

/// Map raw summary/stats/version responses into a canonical reading.
///
/// `now` is used when the device does not report a usable epoch.
pub fn normalize(
    device_id: &str,
    summary: &Value,
    stats: &Value,
    version: &Value,
    now: DateTime<Utc>,
) -> Reading {
    let empty = Map::new();
    let s0 = first_entry(summary, "SUMMARY").unwrap_or(&empty);

    // hashrate: prefer the GHS family, fall back to MHS
    let mut hashrate_ths = 0.0;
    for (key, divisor) in HASHRATE_KEYS {
        if let Some(value) = s0.get(key) {
            hashrate_ths = to_f64(value).unwrap_or(0.0) / divisor;
            break;
        }
    }

    let elapsed_s = s0.get("Elapsed").and_then(to_f64).unwrap_or(0.0) as i64;

    let timestamp = first_entry(summary, "STATUS")
        .and_then(|status| status.get("When"))
        .and_then(Value::as_f64)
        .and_then(|epoch| DateTime::from_timestamp(epoch as i64, 0))
        .unwrap_or(now);

    // scan every key of every stats entry by name prefix
    let mut temps = Vec::new();
    let mut fans = Vec::new();
    let mut powers = Vec::new();
    for entry in entries(stats, "STATS") {
        for (key, value) in entry {
            let Some(fv) = to_f64(value) else {
                continue;
            };
            let lk = key.to_lowercase();
            if lk.starts_with("temp") {
                temps.push(fv);
            } else if lk.starts_with("fan") {
                fans.push(fv);
            } else if POWER_KEYS.contains(&lk.as_str()) {
                powers.push(fv);
            }
        }
    }

    Reading {
        device_id: device_id.to_string(),
        timestamp,
        hashrate_ths,
        power_w: powers.iter().sum(),
        avg_temp_c: avg(&temps),
        avg_fan_rpm: avg(&fans),
        elapsed_s,
        model: detect_model(summary, stats, version),
    }
}

/// Best-effort `float(x)`: numbers pass through, numeric strings parse,
/// everything else is ignored.
fn to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn avg(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// First object of a status-keyed top-level array field.
fn first_entry<'a>(doc: &'a Value, key: &str) -> Option<&'a Map<String, Value>> {
    doc.get(key)?.as_array()?.first()?.as_object()
}

/// All objects of a status-keyed top-level array field.
fn entries<'a>(doc: &'a Value, key: &str) -> impl Iterator<Item = &'a Map<String, Value>> {
    doc.get(key)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_object)
}

/// Determine the vendor model string, robust across firmware variants.
///
/// Tries the well-known spots first (SUMMARY, STATS entries, VERSION),
/// then falls back to a recursive scan for common model keys.
fn detect_model(summary: &Value, stats: &Value, version: &Value) -> String {
    let s0 = first_entry(summary, "SUMMARY");
    let v0 = first_entry(version, "VERSION");

    let mut candidates: Vec<Option<&Value>> = vec![
        summary.get("Model"),
        s0.and_then(|e| e.get("Model")),
        // SUMMARY sometimes has "Type": "Antminer S19 Pro"
        s0.and_then(|e| e.get("Type")),
    ];

    for entry in entries(stats, "STATS") {
        for key in ["Model", "ModelName", "Type", "Miner Name", "MinerType", "Product Type"] {
            candidates.push(entry.get(key));
        }
    }

    candidates.push(version.get("Model"));
    for key in ["Model", "Type", "MinerType", "Miner Name"] {
        candidates.push(v0.and_then(|e| e.get(key)));
    }

    let found = candidates
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .find(|s| !s.trim().is_empty());

    let found = found.map(str::to_string).or_else(|| {
        [summary, stats, version]
            .into_iter()
            .find_map(walk_for_model)
    });

    // collapse whitespace
    found
        .unwrap_or_default()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn walk_for_model(value: &Value) -> Option<String> {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                if child.is_object() || child.is_array() {
                    if let Some(found) = walk_for_model(child) {
                        return Some(found);
                    }
                } else if MODEL_KEYS.contains(&key.trim().to_lowercase().as_str())
                    && let Some(s) = child.as_str()
                    && !s.trim().is_empty()
                {
                    return Some(s.to_string());
                }
            }
            None
        }
        Value::Array(items) => items.iter().find_map(walk_for_model),
        _ => None,
    }
}

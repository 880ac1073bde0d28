//! Alert rule configuration
//!
//! Rules are long-lived configuration edited outside this process. A
//! rule pairs a predicate type with scope filters, a free-form threshold
//! map, a severity, and a cooldown. Thresholds used during one
//! evaluation are a snapshot; the live rule may change before the next
//! cycle.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{DeviceMeta, Reading};

/// The five supported rule predicates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    Offline,
    Temp,
    Hashrate,
    Fan,
    Power,
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleType::Offline => write!(f, "offline"),
            RuleType::Temp => write!(f, "temp"),
            RuleType::Hashrate => write!(f, "hashrate"),
            RuleType::Fan => write!(f, "fan"),
            RuleType::Power => write!(f, "power"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub rule_type: RuleType,
    pub enabled: bool,

    /// Restrict to one device id (exact match)
    pub device_filter: Option<String>,

    /// Restrict to devices whose model contains this substring
    /// (case-insensitive)
    pub model_filter: Option<String>,

    /// Restrict to devices sharing at least one of these tags
    pub tag_filter: Option<Vec<String>>,

    /// Type-specific threshold values
    #[serde(default)]
    pub thresholds: Map<String, Value>,

    pub severity: Severity,

    /// Per-rule cooldown override; the evaluator default applies when
    /// absent
    pub cooldown_minutes: Option<i64>,
}

/// A threshold key was present but its value is unusable.
#[derive(Debug)]
pub struct InvalidThreshold {
    pub key: String,
    pub value: Value,
}

impl fmt::Display for InvalidThreshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "threshold '{}' has invalid value {}", self.key, self.value)
    }
}

impl std::error::Error for InvalidThreshold {}

impl Rule {
    /// Read a numeric threshold. `Ok(None)` when the key is absent,
    /// `Err` when it is present but not a finite number.
    pub fn threshold_f64(&self, key: &str) -> Result<Option<f64>, InvalidThreshold> {
        match self.thresholds.get(key) {
            None => Ok(None),
            Some(value) => match value.as_f64() {
                Some(n) if n.is_finite() => Ok(Some(n)),
                _ => Err(InvalidThreshold {
                    key: key.to_string(),
                    value: value.clone(),
                }),
            },
        }
    }

    /// Whether this rule's scope covers the given device.
    ///
    /// All configured filters must pass. The model and tag filters only
    /// apply when the device actually carries that metadata - a device
    /// with unknown model is not excluded by a model filter.
    pub fn applies_to(
        &self,
        device_id: &str,
        meta: Option<&DeviceMeta>,
        reading: &Reading,
    ) -> bool {
        if let Some(wanted) = &self.device_filter
            && wanted != device_id
        {
            return false;
        }

        if let Some(filter) = &self.model_filter {
            let model = meta
                .and_then(|m| m.model.as_deref())
                .filter(|m| !m.is_empty())
                .unwrap_or(&reading.model);
            if !model.is_empty() && !model.to_lowercase().contains(&filter.to_lowercase()) {
                return false;
            }
        }

        if let Some(required) = &self.tag_filter
            && let Some(meta) = meta
            && !meta.tags.is_empty()
            && !required.iter().any(|tag| meta.tags.contains(tag))
        {
            return false;
        }

        true
    }
}

/// The rule set seeded into an empty rule store at startup.
pub fn default_rules() -> Vec<Rule> {
    let rule = |id, name: &str, rule_type, thresholds: &[(&str, f64)], severity, cooldown| Rule {
        id,
        name: name.to_string(),
        description: None,
        rule_type,
        enabled: true,
        device_filter: None,
        model_filter: None,
        tag_filter: None,
        thresholds: thresholds
            .iter()
            .map(|(k, v)| (k.to_string(), Value::from(*v)))
            .collect(),
        severity,
        cooldown_minutes: Some(cooldown),
    };

    vec![
        rule(
            1,
            "High Temperature Alert",
            RuleType::Temp,
            &[("temp_c", 80.0)],
            Severity::Warning,
            30,
        ),
        rule(
            2,
            "Miner Offline",
            RuleType::Offline,
            &[("max_age_minutes", 10.0)],
            Severity::Critical,
            60,
        ),
        rule(
            3,
            "Hashrate Drop",
            RuleType::Hashrate,
            &[("drop_threshold", 0.9)],
            Severity::Warning,
            45,
        ),
        rule(
            4,
            "Fan Speed Low",
            RuleType::Fan,
            &[("min_rpm", 2000.0)],
            Severity::Warning,
            30,
        ),
    ]
}

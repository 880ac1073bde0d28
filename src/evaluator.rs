//! Rule evaluation engine
//!
//! Once per cycle the evaluator loads the enabled rules and the latest
//! reading per device, runs every rule predicate against every in-scope
//! device, creates alerts for firing conditions, and finally walks the
//! active alerts to auto-resolve the ones whose condition has cleared
//! under a hysteresis margin.
//!
//! ## Cooldown
//!
//! A (rule, device) pair that fired recently is suppressed for the
//! rule's cooldown window. Two layers enforce this: the in-process
//! [`CooldownTable`] owned by this evaluator, and the store's
//! unresolved-alert window which holds across restarts.
//!
//! ## Hysteresis
//!
//! Auto-resolve uses a looser threshold (95% of the trigger value) than
//! the one that fired, so a value hovering at the limit cannot toggle
//! an alert open and closed every cycle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde_json::{Value, json};
use tracing::{debug, info, instrument, trace, warn};

use crate::alerts::{Alert, AlertStatus, NewAlert};
use crate::config::EvaluatorConfig;
use crate::rules::{InvalidThreshold, Rule, RuleType};
use crate::store::{AlertStore, DeviceStore, ReadingStore, RuleStore, StoreResult};
use crate::{DeviceMeta, Reading};

/// Default offline threshold (minutes) when the rule carries none
const DEFAULT_OFFLINE_MAX_AGE_MIN: f64 = 10.0;

/// A device counts as back online when its reading is younger than this
const ONLINE_AGE_MIN: f64 = 5.0;

/// Hysteresis margin: conditions clear at 95% of their trigger value
const RESOLVE_MARGIN: f64 = 0.95;

const DEFAULT_FAN_MIN_RPM: f64 = 2000.0;
const DEFAULT_FAN_MAX_RPM: f64 = 6500.0;

/// Tolerance over the device power cap before the power rule fires
const POWER_CAP_TOLERANCE: f64 = 1.05;

/// Transient (rule, device) → last trigger time map.
///
/// Owned by one evaluator instance and never persisted; it only
/// suppresses duplicate alerts between cycles of the same process.
/// Each check or arm is a single atomic read-modify-write.
pub struct CooldownTable {
    entries: Mutex<HashMap<(i64, String), DateTime<Utc>>>,
}

impl CooldownTable {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn in_cooldown(
        &self,
        rule_id: i64,
        device_id: &str,
        now: DateTime<Utc>,
        window: Duration,
    ) -> bool {
        let entries = self.entries.lock().expect("cooldown table lock poisoned");
        entries
            .get(&(rule_id, device_id.to_string()))
            .is_some_and(|last| now - *last < window)
    }

    pub fn arm(&self, rule_id: i64, device_id: &str, now: DateTime<Utc>) {
        let mut entries = self.entries.lock().expect("cooldown table lock poisoned");
        entries.insert((rule_id, device_id.to_string()), now);
    }
}

impl Default for CooldownTable {
    fn default() -> Self {
        Self::new()
    }
}

pub struct RuleEvaluator {
    readings: Arc<dyn ReadingStore>,
    rules: Arc<dyn RuleStore>,
    devices: Arc<dyn DeviceStore>,
    alerts: Arc<dyn AlertStore>,
    cooldowns: CooldownTable,
    config: EvaluatorConfig,
}

impl RuleEvaluator {
    pub fn new(
        readings: Arc<dyn ReadingStore>,
        rules: Arc<dyn RuleStore>,
        devices: Arc<dyn DeviceStore>,
        alerts: Arc<dyn AlertStore>,
        config: EvaluatorConfig,
    ) -> Self {
        Self {
            readings,
            rules,
            devices,
            alerts,
            cooldowns: CooldownTable::new(),
            config,
        }
    }

    /// One full evaluation pass. Returns the alerts created this pass
    /// so the caller can notify on them.
    #[instrument(skip(self))]
    pub async fn evaluate_once(&self) -> StoreResult<Vec<Alert>> {
        let rules = self.rules.list_enabled_rules().await?;
        if rules.is_empty() {
            debug!("no enabled alert rules");
            return Ok(Vec::new());
        }

        let latest = self.readings.latest_reading_per_device().await?;
        let now = Utc::now();

        // one metadata lookup per device, shared by all rules
        let mut metas: HashMap<String, Option<DeviceMeta>> = HashMap::new();
        for device_id in latest.keys() {
            metas.insert(
                device_id.clone(),
                self.devices.device_meta(device_id).await?,
            );
        }

        let mut created = Vec::new();

        for rule in &rules {
            if let Err(e) = validate_thresholds(rule) {
                warn!("rule {} ({}) has invalid thresholds, skipping: {e}", rule.id, rule.name);
                continue;
            }

            for (device_id, reading) in &latest {
                let meta = metas.get(device_id).and_then(Option::as_ref);

                if !rule.applies_to(device_id, meta, reading) {
                    continue;
                }

                if self.in_cooldown(rule, device_id, now).await? {
                    trace!("rule {} for {device_id} is in cooldown", rule.id);
                    continue;
                }

                let fired = match rule.rule_type {
                    RuleType::Offline => check_offline(rule, reading, now),
                    RuleType::Temp => check_temperature(rule, reading, self.config.temp_limit_c),
                    RuleType::Hashrate => {
                        let baseline = self.hashrate_baseline(device_id, meta, rule).await?;
                        check_hashrate(rule, reading, baseline, self.config.hashrate_drop_fraction)
                    }
                    RuleType::Fan => check_fan(rule, reading),
                    RuleType::Power => check_power(rule, reading, meta),
                };

                let Some(new_alert) = fired else {
                    continue;
                };

                let alert = self.alerts.create_alert(new_alert).await?;
                self.cooldowns.arm(rule.id, device_id, now);
                info!("alert triggered: {} for {}", alert.message, alert.device_id);
                created.push(alert);
            }
        }

        self.auto_resolve_pass(&latest, now).await?;

        Ok(created)
    }

    fn cooldown_window(&self, rule: &Rule) -> Duration {
        Duration::minutes(rule.cooldown_minutes.unwrap_or(self.config.cooldown_minutes))
    }

    async fn in_cooldown(
        &self,
        rule: &Rule,
        device_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let window = self.cooldown_window(rule);

        if self.cooldowns.in_cooldown(rule.id, device_id, now, window) {
            return Ok(true);
        }

        // the store enforces the one-unresolved-alert invariant across
        // process restarts
        self.alerts
            .unresolved_alert_since(rule.id, device_id, now - window)
            .await
    }

    /// Baseline resolution order: stored nominal rating, explicit rule
    /// threshold, rolling mean of the last K positive samples. 0.0 when
    /// none of them produce a usable figure.
    async fn hashrate_baseline(
        &self,
        device_id: &str,
        meta: Option<&DeviceMeta>,
        rule: &Rule,
    ) -> StoreResult<f64> {
        if let Some(nominal) = meta.and_then(|m| m.nominal_ths)
            && nominal > 0.0
        {
            return Ok(nominal);
        }

        if let Some(explicit) = rule.threshold_f64("baseline_ths").ok().flatten()
            && explicit > 0.0
        {
            return Ok(explicit);
        }

        let recent = self
            .readings
            .recent_readings(device_id, self.config.rolling_window_samples)
            .await?;
        let valid: Vec<f64> = recent
            .iter()
            .map(|r| r.hashrate_ths)
            .filter(|h| *h > 0.0)
            .collect();

        if valid.is_empty() {
            return Ok(0.0);
        }
        Ok(valid.iter().sum::<f64>() / valid.len() as f64)
    }

    /// Auto-resolve pass: close every active alert whose condition has
    /// cleared under the hysteresis margin. Acknowledged alerts are
    /// deliberately left for a human.
    async fn auto_resolve_pass(
        &self,
        latest: &HashMap<String, Reading>,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let active = self.alerts.active_alerts().await?;

        for mut alert in active {
            let Some(reading) = latest.get(&alert.device_id) else {
                continue;
            };

            let cleared = match alert.alert_type {
                RuleType::Temp => {
                    let threshold = alert
                        .details
                        .get("threshold")
                        .and_then(Value::as_f64)
                        .unwrap_or(self.config.temp_limit_c);
                    reading.avg_temp_c > 0.0
                        && reading.avg_temp_c <= threshold * RESOLVE_MARGIN
                }

                RuleType::Offline => age_minutes(reading, now) < ONLINE_AGE_MIN,

                RuleType::Hashrate => {
                    let baseline = alert
                        .details
                        .get("baseline_hashrate")
                        .and_then(Value::as_f64)
                        .unwrap_or(0.0);
                    baseline > 0.0
                        && reading.hashrate_ths > 0.0
                        && reading.hashrate_ths >= baseline * RESOLVE_MARGIN
                }

                // fan and power conditions are re-evaluated every cycle
                // instead of being auto-resolved
                RuleType::Fan | RuleType::Power => false,
            };

            if cleared && alert.status.can_transition(AlertStatus::AutoResolved) {
                alert.status = AlertStatus::AutoResolved;
                alert.resolved_at = Some(now);
                alert.resolution_note = Some("condition cleared automatically".to_string());
                info!("auto-resolved alert {} for {}", alert.id, alert.device_id);
                self.alerts.update_alert(alert).await?;
            }
        }

        Ok(())
    }
}

/// Reject thresholds that are present but unusable before any device is
/// evaluated, so a misconfigured rule is skipped whole.
fn validate_thresholds(rule: &Rule) -> Result<(), InvalidThreshold> {
    let keys: &[&str] = match rule.rule_type {
        RuleType::Offline => &["max_age_minutes"],
        RuleType::Temp => &["temp_c"],
        RuleType::Hashrate => &["drop_threshold", "baseline_ths"],
        RuleType::Fan => &["min_rpm", "max_rpm"],
        RuleType::Power => &["max_power_w", "min_power_w"],
    };

    for key in keys {
        let value = rule.threshold_f64(key)?;

        // these must be positive to make sense
        if matches!(*key, "max_age_minutes" | "temp_c" | "drop_threshold" | "baseline_ths")
            && let Some(n) = value
            && n <= 0.0
        {
            return Err(InvalidThreshold {
                key: key.to_string(),
                value: Value::from(n),
            });
        }
    }

    Ok(())
}

fn age_minutes(reading: &Reading, now: DateTime<Utc>) -> f64 {
    reading.age(now).num_seconds() as f64 / 60.0
}

fn new_alert(rule: &Rule, device_id: &str, message: String, details: Value) -> NewAlert {
    NewAlert {
        rule_id: rule.id,
        device_id: device_id.to_string(),
        alert_type: rule.rule_type,
        severity: rule.severity,
        message,
        details,
    }
}

fn check_offline(rule: &Rule, reading: &Reading, now: DateTime<Utc>) -> Option<NewAlert> {
    let max_age = rule
        .threshold_f64("max_age_minutes")
        .ok()
        .flatten()
        .unwrap_or(DEFAULT_OFFLINE_MAX_AGE_MIN);

    let age = age_minutes(reading, now);
    if age <= max_age {
        return None;
    }

    Some(new_alert(
        rule,
        &reading.device_id,
        format!("Miner offline for {age:.1} minutes"),
        json!({
            "age_minutes": age,
            "last_seen": reading.timestamp.to_rfc3339(),
        }),
    ))
}

fn check_temperature(rule: &Rule, reading: &Reading, default_limit: f64) -> Option<NewAlert> {
    let limit = rule
        .threshold_f64("temp_c")
        .ok()
        .flatten()
        .unwrap_or(default_limit);

    if reading.avg_temp_c <= limit {
        return None;
    }

    Some(new_alert(
        rule,
        &reading.device_id,
        format!(
            "Temperature {:.1}°C exceeds threshold {limit}°C",
            reading.avg_temp_c
        ),
        json!({
            "current_temp": reading.avg_temp_c,
            "threshold": limit,
        }),
    ))
}

fn check_hashrate(
    rule: &Rule,
    reading: &Reading,
    baseline: f64,
    default_fraction: f64,
) -> Option<NewAlert> {
    // a device reporting zero hashrate is the offline rule's business
    if reading.hashrate_ths <= 0.0 || baseline <= 0.0 {
        return None;
    }

    let fraction = rule
        .threshold_f64("drop_threshold")
        .ok()
        .flatten()
        .unwrap_or(default_fraction);
    let min_expected = baseline * fraction;

    if reading.hashrate_ths >= min_expected {
        return None;
    }

    let drop_pct = (baseline - reading.hashrate_ths) / baseline * 100.0;
    Some(new_alert(
        rule,
        &reading.device_id,
        format!(
            "Hashrate {:.1} TH/s is {drop_pct:.1}% below baseline {baseline:.1} TH/s",
            reading.hashrate_ths
        ),
        json!({
            "current_hashrate": reading.hashrate_ths,
            "baseline_hashrate": baseline,
            "drop_percentage": drop_pct,
        }),
    ))
}

fn check_fan(rule: &Rule, reading: &Reading) -> Option<NewAlert> {
    if reading.avg_fan_rpm <= 0.0 {
        return None;
    }

    let min_rpm = rule
        .threshold_f64("min_rpm")
        .ok()
        .flatten()
        .unwrap_or(DEFAULT_FAN_MIN_RPM);
    let max_rpm = rule
        .threshold_f64("max_rpm")
        .ok()
        .flatten()
        .unwrap_or(DEFAULT_FAN_MAX_RPM);

    if reading.avg_fan_rpm < min_rpm {
        return Some(new_alert(
            rule,
            &reading.device_id,
            format!(
                "Fan speed {:.0} RPM below minimum {min_rpm:.0} RPM",
                reading.avg_fan_rpm
            ),
            json!({
                "current_rpm": reading.avg_fan_rpm,
                "min_rpm": min_rpm,
            }),
        ));
    }

    if reading.avg_fan_rpm > max_rpm {
        return Some(new_alert(
            rule,
            &reading.device_id,
            format!(
                "Fan speed {:.0} RPM exceeds maximum {max_rpm:.0} RPM",
                reading.avg_fan_rpm
            ),
            json!({
                "current_rpm": reading.avg_fan_rpm,
                "max_rpm": max_rpm,
            }),
        ));
    }

    None
}

fn check_power(rule: &Rule, reading: &Reading, meta: Option<&DeviceMeta>) -> Option<NewAlert> {
    if reading.power_w <= 0.0 {
        return None;
    }

    if let Some(cap) = meta.and_then(|m| m.power_cap_w)
        && cap > 0.0
        && reading.power_w > cap * POWER_CAP_TOLERANCE
    {
        return Some(new_alert(
            rule,
            &reading.device_id,
            format!("Power {:.0}W exceeds cap {cap:.0}W", reading.power_w),
            json!({
                "current_power": reading.power_w,
                "power_cap": cap,
            }),
        ));
    }

    if let Some(max_power) = rule.threshold_f64("max_power_w").ok().flatten()
        && reading.power_w > max_power
    {
        return Some(new_alert(
            rule,
            &reading.device_id,
            format!("Power {:.0}W exceeds threshold {max_power}W", reading.power_w),
            json!({
                "current_power": reading.power_w,
                "max_power": max_power,
            }),
        ));
    }

    if let Some(min_power) = rule.threshold_f64("min_power_w").ok().flatten()
        && reading.power_w < min_power
    {
        return Some(new_alert(
            rule,
            &reading.device_id,
            format!("Power {:.0}W below threshold {min_power}W", reading.power_w),
            json!({
                "current_power": reading.power_w,
                "min_power": min_power,
            }),
        ));
    }

    None
}

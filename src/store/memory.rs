//! In-memory store (no persistence)
//!
//! Implements all four store traits on top of `tokio::sync::RwLock`
//! maps. Used by the test suite and by the standalone hub when no
//! external store is wired up. Readings are kept in a per-device ring
//! buffer; when the buffer is full, oldest readings are evicted.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::alerts::{Alert, AlertStatus, NewAlert};
use crate::rules::Rule;
use crate::{DeviceMeta, Reading};

use super::backend::{AlertStore, DeviceStore, ReadingStore, RuleStore};
use super::error::StoreResult;

/// Maximum readings kept per device
const MAX_READINGS_PER_DEVICE: usize = 1000;

pub struct MemoryStore {
    readings: RwLock<HashMap<String, VecDeque<Reading>>>,
    rules: RwLock<Vec<Rule>>,
    devices: RwLock<HashMap<String, DeviceMeta>>,
    alerts: RwLock<HashMap<i64, Alert>>,
    next_alert_id: AtomicI64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            readings: RwLock::new(HashMap::new()),
            rules: RwLock::new(Vec::new()),
            devices: RwLock::new(HashMap::new()),
            alerts: RwLock::new(HashMap::new()),
            next_alert_id: AtomicI64::new(1),
        }
    }

    /// Replace or insert a rule (test/bootstrap helper).
    pub async fn upsert_rule(&self, rule: Rule) {
        let mut rules = self.rules.write().await;
        match rules.iter_mut().find(|r| r.id == rule.id) {
            Some(existing) => *existing = rule,
            None => rules.push(rule),
        }
    }

    pub async fn rule_count(&self) -> usize {
        self.rules.read().await.len()
    }

    /// Set device metadata (test/bootstrap helper).
    pub async fn set_device_meta(&self, meta: DeviceMeta) {
        self.devices
            .write()
            .await
            .insert(meta.device_id.clone(), meta);
    }

    pub async fn alerts_for_device(&self, device_id: &str) -> Vec<Alert> {
        self.alerts
            .read()
            .await
            .values()
            .filter(|a| a.device_id == device_id)
            .cloned()
            .collect()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReadingStore for MemoryStore {
    async fn append_reading(&self, reading: Reading) -> StoreResult<()> {
        let mut readings = self.readings.write().await;
        let buffer = readings.entry(reading.device_id.clone()).or_default();
        if buffer.len() >= MAX_READINGS_PER_DEVICE {
            buffer.pop_front();
        }
        buffer.push_back(reading);
        Ok(())
    }

    async fn latest_reading(&self, device_id: &str) -> StoreResult<Option<Reading>> {
        Ok(self
            .readings
            .read()
            .await
            .get(device_id)
            .and_then(|buffer| buffer.back().cloned()))
    }

    async fn latest_reading_per_device(&self) -> StoreResult<HashMap<String, Reading>> {
        Ok(self
            .readings
            .read()
            .await
            .iter()
            .filter_map(|(id, buffer)| buffer.back().map(|r| (id.clone(), r.clone())))
            .collect())
    }

    async fn recent_readings(&self, device_id: &str, limit: usize) -> StoreResult<Vec<Reading>> {
        Ok(self
            .readings
            .read()
            .await
            .get(device_id)
            .map(|buffer| buffer.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl RuleStore for MemoryStore {
    async fn list_enabled_rules(&self) -> StoreResult<Vec<Rule>> {
        Ok(self
            .rules
            .read()
            .await
            .iter()
            .filter(|r| r.enabled)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl DeviceStore for MemoryStore {
    async fn device_meta(&self, device_id: &str) -> StoreResult<Option<DeviceMeta>> {
        Ok(self.devices.read().await.get(device_id).cloned())
    }
}

#[async_trait]
impl AlertStore for MemoryStore {
    async fn create_alert(&self, alert: NewAlert) -> StoreResult<Alert> {
        let id = self.next_alert_id.fetch_add(1, Ordering::SeqCst);
        let alert = Alert {
            id,
            rule_id: alert.rule_id,
            device_id: alert.device_id,
            alert_type: alert.alert_type,
            severity: alert.severity,
            message: alert.message,
            details: alert.details,
            status: AlertStatus::Active,
            created_at: Utc::now(),
            acknowledged_at: None,
            acknowledged_by: None,
            resolved_at: None,
            resolution_note: None,
        };
        self.alerts.write().await.insert(id, alert.clone());
        Ok(alert)
    }

    async fn get_alert(&self, id: i64) -> StoreResult<Option<Alert>> {
        Ok(self.alerts.read().await.get(&id).cloned())
    }

    async fn update_alert(&self, alert: Alert) -> StoreResult<()> {
        self.alerts.write().await.insert(alert.id, alert);
        Ok(())
    }

    async fn active_alerts(&self) -> StoreResult<Vec<Alert>> {
        Ok(self
            .alerts
            .read()
            .await
            .values()
            .filter(|a| a.status == AlertStatus::Active)
            .cloned()
            .collect())
    }

    async fn unresolved_alert_since(
        &self,
        rule_id: i64,
        device_id: &str,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<bool> {
        Ok(self.alerts.read().await.values().any(|a| {
            a.rule_id == rule_id
                && a.device_id == device_id
                && a.status.is_unresolved()
                && a.created_at >= cutoff
        }))
    }
}

//! Store trait definitions
//!
//! Every trait here models one collaborator interface of the external
//! store. Implementations must be `Send + Sync` as they are shared
//! across async tasks, and every method is a single atomic operation
//! against the backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::alerts::{Alert, NewAlert};
use crate::rules::Rule;
use crate::{DeviceMeta, Reading};

use super::error::StoreResult;

/// Time-series store for normalized readings.
///
/// Readings are append-only; history is never rewritten.
#[async_trait]
pub trait ReadingStore: Send + Sync {
    /// Append one reading to the device's history
    async fn append_reading(&self, reading: Reading) -> StoreResult<()>;

    /// Most recent reading for one device, if any exists
    async fn latest_reading(&self, device_id: &str) -> StoreResult<Option<Reading>>;

    /// The single most recent reading per device, across the fleet
    async fn latest_reading_per_device(&self) -> StoreResult<HashMap<String, Reading>>;

    /// Up to `limit` most recent readings for a device, newest first
    async fn recent_readings(&self, device_id: &str, limit: usize) -> StoreResult<Vec<Reading>>;
}

/// Rule configuration store. Rules are edited externally; the evaluator
/// only ever reads the enabled set.
#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn list_enabled_rules(&self) -> StoreResult<Vec<Rule>>;
}

/// Device metadata store (nominal rating, power cap, model, tags).
#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn device_meta(&self, device_id: &str) -> StoreResult<Option<DeviceMeta>>;
}

/// Alert store. Creation and every lifecycle transition are single
/// atomic writes.
#[async_trait]
pub trait AlertStore: Send + Sync {
    /// Persist a new alert, assigning its id
    async fn create_alert(&self, alert: NewAlert) -> StoreResult<Alert>;

    async fn get_alert(&self, id: i64) -> StoreResult<Option<Alert>>;

    /// Replace the stored alert with the given state
    async fn update_alert(&self, alert: Alert) -> StoreResult<()>;

    /// All alerts currently in `Active` status
    async fn active_alerts(&self) -> StoreResult<Vec<Alert>>;

    /// Whether an unresolved (active/acknowledged) alert for this
    /// (rule, device) pair was created at or after `cutoff`
    async fn unresolved_alert_since(
        &self,
        rule_id: i64,
        device_id: &str,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<bool>;
}

//! Alert model and lifecycle
//!
//! An alert's status forms a small state machine:
//!
//! ```text
//! Active ──► Acknowledged ──► Resolved
//!   │
//!   └──────► AutoResolved (terminal, evaluator only)
//! ```
//!
//! `Resolved` and `AutoResolved` are terminal. Invalid transitions are
//! rejected as a no-op rather than an error, so callers racing against
//! the auto-resolver do not blow up.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::rules::{RuleType, Severity};
use crate::store::{AlertStore, StoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Active,
    Acknowledged,
    Resolved,
    AutoResolved,
}

impl AlertStatus {
    /// Explicit transition table for the lifecycle state machine.
    pub fn can_transition(self, to: AlertStatus) -> bool {
        use AlertStatus::*;
        matches!(
            (self, to),
            (Active, Acknowledged) | (Active, Resolved) | (Active, AutoResolved) | (Acknowledged, Resolved)
        )
    }

    /// Whether the alert still demands attention.
    pub fn is_unresolved(self) -> bool {
        matches!(self, AlertStatus::Active | AlertStatus::Acknowledged)
    }
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertStatus::Active => write!(f, "active"),
            AlertStatus::Acknowledged => write!(f, "acknowledged"),
            AlertStatus::Resolved => write!(f, "resolved"),
            AlertStatus::AutoResolved => write!(f, "auto_resolved"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: i64,
    pub rule_id: i64,
    pub device_id: String,
    pub alert_type: RuleType,
    pub severity: Severity,
    pub message: String,

    /// Measured value(s) and threshold(s) at trigger time
    pub details: Value,

    pub status: AlertStatus,
    pub created_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_note: Option<String>,
}

/// An alert as produced by the evaluator, before the store assigns an id.
#[derive(Debug, Clone)]
pub struct NewAlert {
    pub rule_id: i64,
    pub device_id: String,
    pub alert_type: RuleType,
    pub severity: Severity,
    pub message: String,
    pub details: Value,
}

/// Acknowledge an active alert.
///
/// Returns `Ok(false)` when the alert does not exist or is not in
/// `Active` status.
#[instrument(skip(alerts))]
pub async fn acknowledge(alerts: &dyn AlertStore, id: i64, actor: &str) -> StoreResult<bool> {
    let Some(mut alert) = alerts.get_alert(id).await? else {
        return Ok(false);
    };

    if !alert.status.can_transition(AlertStatus::Acknowledged) {
        debug!("alert {id} is {}, not acknowledgeable", alert.status);
        return Ok(false);
    }

    alert.status = AlertStatus::Acknowledged;
    alert.acknowledged_at = Some(Utc::now());
    alert.acknowledged_by = Some(actor.to_string());
    alerts.update_alert(alert).await?;

    Ok(true)
}

/// Manually resolve an alert from `Active` or `Acknowledged`.
///
/// Returns `Ok(false)` when the alert does not exist or is already
/// closed.
#[instrument(skip(alerts, note))]
pub async fn resolve(
    alerts: &dyn AlertStore,
    id: i64,
    note: Option<&str>,
    actor: &str,
) -> StoreResult<bool> {
    let Some(mut alert) = alerts.get_alert(id).await? else {
        return Ok(false);
    };

    if !alert.status.can_transition(AlertStatus::Resolved) {
        debug!("alert {id} is {}, not resolvable", alert.status);
        return Ok(false);
    }

    alert.status = AlertStatus::Resolved;
    alert.resolved_at = Some(Utc::now());
    alert.resolution_note = note.map(str::to_string);
    alerts.update_alert(alert).await?;

    Ok(true)
}

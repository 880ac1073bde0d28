//! Notification sink seam
//!
//! Actual transports (email, webhooks, chat) live outside this crate.
//! The monitor only needs somewhere to hand newly created alerts;
//! `LogSink` is the in-tree implementation that writes them to the log.

use async_trait::async_trait;
use tracing::info;

use crate::alerts::Alert;
use crate::rules::Rule;

#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Deliver one newly created alert. Best-effort: delivery failures
    /// are the sink's problem and must not bounce back into the cycle.
    async fn notify(&self, alert: &Alert, rule: &Rule);
}

/// Sink that logs alerts instead of delivering them anywhere.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn notify(&self, alert: &Alert, rule: &Rule) {
        info!(
            rule = %rule.name,
            device = %alert.device_id,
            severity = %alert.severity,
            "{}",
            alert.message
        );
    }
}

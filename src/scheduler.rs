//! Monitor loop
//!
//! One background actor drives periodic monitoring cycles:
//!
//! ```text
//! Timer tick → discover → fetch (fan-out) → persist readings
//!            → evaluate rules → notify on new alerts
//!     ↑
//!     └─── Commands (CycleNow, EvaluateNow, Shutdown)
//! ```
//!
//! Cycles are strictly sequential. A cycle that overruns the interval
//! delays the next tick instead of stacking a concurrent cycle, and a
//! cycle that fails is logged and swallowed - the loop itself never
//! dies.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, instrument, warn};

use crate::alerts::Alert;
use crate::config::Config;
use crate::discovery::{Ipv4Cidr, discover};
use crate::evaluator::RuleEvaluator;
use crate::fetcher::fetch_all;
use crate::notify::NotificationSink;
use crate::store::{AlertStore, DeviceStore, ReadingStore, RuleStore};
use crate::DataSource;

/// Commands that can be sent to the monitor loop
#[derive(Debug)]
pub enum MonitorCommand {
    /// Run a full discovery→fetch→evaluate cycle immediately
    CycleNow {
        respond_to: oneshot::Sender<Result<CycleReport>>,
    },

    /// Run only the rule evaluation pass
    EvaluateNow {
        respond_to: oneshot::Sender<Result<Vec<Alert>>>,
    },

    /// Gracefully shut down the loop
    Shutdown,
}

/// What one cycle accomplished
#[derive(Debug, Clone, Copy, Default)]
pub struct CycleReport {
    /// Addresses discovery returned
    pub discovered: usize,

    /// Devices fetched live
    pub live: usize,

    /// Devices served from stored history
    pub fallback: usize,

    /// Alerts created by the evaluation pass
    pub alerts_created: usize,
}

pub struct Monitor {
    config: Config,
    readings: Arc<dyn ReadingStore>,
    rules: Arc<dyn RuleStore>,
    evaluator: RuleEvaluator,
    sink: Arc<dyn NotificationSink>,
    command_rx: mpsc::Receiver<MonitorCommand>,
    interval_duration: Duration,
}

impl Monitor {
    pub fn new(
        config: Config,
        readings: Arc<dyn ReadingStore>,
        rules: Arc<dyn RuleStore>,
        devices: Arc<dyn DeviceStore>,
        alerts: Arc<dyn AlertStore>,
        sink: Arc<dyn NotificationSink>,
        command_rx: mpsc::Receiver<MonitorCommand>,
    ) -> Self {
        let evaluator = RuleEvaluator::new(
            readings.clone(),
            rules.clone(),
            devices,
            alerts,
            config.evaluator.clone(),
        );
        let interval_duration = Duration::from_secs(config.cycle_interval_secs);

        Self {
            config,
            readings,
            rules,
            evaluator,
            sink,
            command_rx,
            interval_duration,
        }
    }

    /// Run the monitor's main loop until shut down.
    #[instrument(skip(self))]
    pub async fn run(mut self) {
        debug!(
            "starting monitor loop, cycle every {}s",
            self.interval_duration.as_secs()
        );

        let mut ticker = interval(self.interval_duration);
        // an overrunning cycle delays the next one instead of stacking
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.run_cycle().await {
                        Ok(report) => debug!(
                            "cycle done: {} discovered, {} live, {} fallback, {} alerts",
                            report.discovered, report.live, report.fallback, report.alerts_created
                        ),
                        Err(e) => error!("monitoring cycle failed: {e:#}"),
                    }
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        MonitorCommand::CycleNow { respond_to } => {
                            let result = self.run_cycle().await;
                            let _ = respond_to.send(result);
                        }

                        MonitorCommand::EvaluateNow { respond_to } => {
                            let result = self.evaluate_rules_once().await;
                            let _ = respond_to.send(result);
                        }

                        MonitorCommand::Shutdown => {
                            debug!("received shutdown command");
                            break;
                        }
                    }
                }

                else => {
                    warn!("command channel closed, shutting down");
                    break;
                }
            }
        }

        debug!("monitor loop stopped");
    }

    /// One full cycle: discover → fetch → persist → evaluate → notify.
    #[instrument(skip(self))]
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let mut report = self.run_discovery_and_fetch_cycle().await?;

        let created = self.evaluate_rules_once().await?;
        report.alerts_created = created.len();

        if !created.is_empty() {
            // rules may have been edited since evaluation - notify
            // best-effort against the current set
            let rules = self
                .rules
                .list_enabled_rules()
                .await
                .context("failed to load rules for notification")?;

            for alert in &created {
                match rules.iter().find(|r| r.id == alert.rule_id) {
                    Some(rule) => self.sink.notify(alert, rule).await,
                    None => debug!("rule {} vanished before notification", alert.rule_id),
                }
            }
        }

        Ok(report)
    }

    /// Discover devices and fetch a reading per device, persisting the
    /// live ones. Fallback readings are already in the store; appending
    /// them again would fake freshness and defeat the offline rule.
    #[instrument(skip(self))]
    pub async fn run_discovery_and_fetch_cycle(&self) -> Result<CycleReport> {
        let network: Ipv4Cidr = self
            .config
            .discovery
            .network
            .parse()
            .context("invalid discovery network")?;

        let found = discover(
            &network,
            self.config.discovery.port,
            Duration::from_millis(self.config.discovery.probe_timeout_ms),
            self.config.discovery.concurrency,
            self.config.discovery.use_broadcast,
        )
        .await;

        let addresses: Vec<Ipv4Addr> = found.keys().copied().collect();
        let results = fetch_all(
            &addresses,
            self.config.discovery.port,
            Duration::from_secs(self.config.fetch.timeout_secs),
            self.config.fetch.max_concurrency,
            &self.readings,
        )
        .await;

        let mut report = CycleReport {
            discovered: addresses.len(),
            ..Default::default()
        };

        for fetched in results.values() {
            match fetched.source {
                DataSource::Live => {
                    report.live += 1;
                    self.readings
                        .append_reading(fetched.reading.clone())
                        .await
                        .context("failed to persist reading")?;
                }
                DataSource::Fallback => report.fallback += 1,
            }
        }

        Ok(report)
    }

    /// Run the rule evaluation pass on whatever the store holds.
    pub async fn evaluate_rules_once(&self) -> Result<Vec<Alert>> {
        let created = self
            .evaluator
            .evaluate_once()
            .await
            .context("rule evaluation failed")?;
        Ok(created)
    }
}

/// Handle for controlling a running monitor loop.
///
/// Can be cloned and shared; commands are serviced between cycles.
#[derive(Clone)]
pub struct MonitorHandle {
    sender: mpsc::Sender<MonitorCommand>,
}

impl MonitorHandle {
    /// Spawn the monitor loop as a background task.
    pub fn spawn(
        config: Config,
        readings: Arc<dyn ReadingStore>,
        rules: Arc<dyn RuleStore>,
        devices: Arc<dyn DeviceStore>,
        alerts: Arc<dyn AlertStore>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);

        let actor = Monitor::new(config, readings, rules, devices, alerts, sink, cmd_rx);
        tokio::spawn(actor.run());

        Self { sender: cmd_tx }
    }

    /// Run a full cycle immediately, bypassing the interval timer.
    pub async fn cycle_now(&self) -> Result<CycleReport> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(MonitorCommand::CycleNow { respond_to: tx })
            .await
            .context("failed to send CycleNow command")?;

        rx.await.context("failed to receive cycle result")?
    }

    /// Run only the rule evaluation pass.
    pub async fn evaluate_now(&self) -> Result<Vec<Alert>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(MonitorCommand::EvaluateNow { respond_to: tx })
            .await
            .context("failed to send EvaluateNow command")?;

        rx.await.context("failed to receive evaluation result")?
    }

    /// Gracefully shut down the monitor loop.
    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(MonitorCommand::Shutdown)
            .await
            .context("failed to send Shutdown command")?;
        Ok(())
    }
}

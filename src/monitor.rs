//! Stuck-Step Monitor.
//!
//! A periodic sweep for steps that have sat in `queued` or `started` longer
//! than expected. Findings go to an [`AlertSink`]; nothing is requeued, since
//! a step that is merely slow would then run twice.

use anyhow::{ensure, Context};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::config::MonitorConfig;
use crate::error::{CollaboratorError, StoreError};
use crate::steps::{StepStatus, StepStore, WorkflowStep};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StuckThresholds {
    pub queued: ChronoDuration,
    pub started: ChronoDuration,
    /// Maximum steps reported per status in one sweep.
    pub batch_size: usize,
}

impl Default for StuckThresholds {
    fn default() -> Self {
        Self {
            queued: ChronoDuration::hours(24),
            started: ChronoDuration::hours(48),
            batch_size: 500,
        }
    }
}

impl TryFrom<&MonitorConfig> for StuckThresholds {
    type Error = anyhow::Error;

    fn try_from(config: &MonitorConfig) -> Result<Self, Self::Error> {
        ensure!(config.batch_size > 0, "monitor.batch_size must be at least 1");
        Ok(Self {
            queued: threshold("queued_threshold_hours", config.queued_threshold_hours)?,
            started: threshold("started_threshold_hours", config.started_threshold_hours)?,
            batch_size: config.batch_size,
        })
    }
}

fn threshold(name: &str, hours: u64) -> anyhow::Result<ChronoDuration> {
    i64::try_from(hours)
        .ok()
        .and_then(ChronoDuration::try_hours)
        .with_context(|| format!("monitor.{name} is out of range: {hours}"))
}

#[derive(Debug, Clone, PartialEq)]
pub struct StuckStepReport {
    pub swept_at: DateTime<Utc>,
    pub queued: Vec<WorkflowStep>,
    pub started: Vec<WorkflowStep>,
    /// A status hit the batch limit; more stuck steps may exist.
    pub truncated: bool,
}

impl StuckStepReport {
    pub fn is_empty(&self) -> bool {
        self.queued.is_empty() && self.started.is_empty()
    }

    pub fn total(&self) -> usize {
        self.queued.len() + self.started.len()
    }

    pub fn steps(&self) -> impl Iterator<Item = &WorkflowStep> {
        self.queued.iter().chain(self.started.iter())
    }
}

/// Out-of-band channel for monitor findings.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn alert(&self, report: &StuckStepReport) -> Result<(), CollaboratorError>;
}

/// Alerts by logging each stuck step at `warn`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn alert(&self, report: &StuckStepReport) -> Result<(), CollaboratorError> {
        for step in report.steps() {
            warn!(
                object_id = %step.key.object_id,
                workflow = %step.key.workflow,
                version = step.key.version,
                process = %step.key.process,
                status = %step.status,
                lane = %step.lane,
                since = %step.updated_at,
                "Workflow step appears stuck"
            );
        }
        Ok(())
    }
}

pub struct StuckStepMonitor {
    store: Arc<dyn StepStore>,
    thresholds: StuckThresholds,
    alerts: Arc<dyn AlertSink>,
}

impl StuckStepMonitor {
    pub fn new(
        store: Arc<dyn StepStore>,
        thresholds: StuckThresholds,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            store,
            thresholds,
            alerts,
        }
    }

    pub async fn sweep(&self) -> Result<StuckStepReport, StoreError> {
        self.sweep_at(Utc::now()).await
    }

    /// Sweep as if the current time were `now`. Alert delivery failures are
    /// logged and do not fail the sweep.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<StuckStepReport, StoreError> {
        let limit = self.thresholds.batch_size.max(1);
        let queued = self
            .store
            .stale_steps(StepStatus::Queued, now - self.thresholds.queued, limit)
            .await?;
        let started = self
            .store
            .stale_steps(StepStatus::Started, now - self.thresholds.started, limit)
            .await?;

        let report = StuckStepReport {
            swept_at: now,
            truncated: queued.len() >= limit || started.len() >= limit,
            queued,
            started,
        };

        if report.is_empty() {
            debug!("No stuck steps");
            return Ok(report);
        }

        info!(
            queued = report.queued.len(),
            started = report.started.len(),
            truncated = report.truncated,
            "Stuck steps found"
        );
        if let Err(e) = self.alerts.alert(&report).await {
            error!(error = %e, "Failed to deliver stuck step alert");
        }
        Ok(report)
    }

    /// Sweep every `interval` until `shutdown` resolves. Sweep failures are
    /// logged and the loop carries on.
    pub async fn run<F>(&self, interval: Duration, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        info!(interval_secs = interval.as_secs(), "Stuck step monitor started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "Stuck step sweep failed");
                    }
                }
                _ = &mut shutdown => {
                    info!("Stuck step monitor stopping");
                    break;
                }
            }
        }
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_LANE: &str = "default";

/// Scheduling status of a single workflow step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Waiting,
    Queued,
    Started,
    Completed,
    Error,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Waiting => "waiting",
            StepStatus::Queued => "queued",
            StepStatus::Started => "started",
            StepStatus::Completed => "completed",
            StepStatus::Error => "error",
            StepStatus::Skipped => "skipped",
        }
    }

    /// Completed or skipped; nothing left to run for this step.
    pub fn is_done(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Skipped)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(StepStatus::Waiting),
            "queued" => Ok(StepStatus::Queued),
            "started" => Ok(StepStatus::Started),
            "completed" => Ok(StepStatus::Completed),
            "error" => Ok(StepStatus::Error),
            "skipped" => Ok(StepStatus::Skipped),
            other => Err(format!("unknown step status '{other}'")),
        }
    }
}

/// One workflow instance: every step of `workflow` for `object_id` at `version`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionKey {
    pub object_id: String,
    pub workflow: String,
    pub version: u32,
}

impl VersionKey {
    pub fn new(object_id: impl Into<String>, workflow: impl Into<String>, version: u32) -> Self {
        Self {
            object_id: object_id.into(),
            workflow: workflow.into(),
            version,
        }
    }

    pub fn step(&self, process: impl Into<String>) -> StepKey {
        StepKey {
            object_id: self.object_id.clone(),
            workflow: self.workflow.clone(),
            version: self.version,
            process: process.into(),
        }
    }
}

impl fmt::Display for VersionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@v{}", self.object_id, self.workflow, self.version)
    }
}

/// Unique identity of a workflow step.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StepKey {
    pub object_id: String,
    pub workflow: String,
    pub version: u32,
    pub process: String,
}

impl StepKey {
    pub fn new(
        object_id: impl Into<String>,
        workflow: impl Into<String>,
        version: u32,
        process: impl Into<String>,
    ) -> Self {
        Self {
            object_id: object_id.into(),
            workflow: workflow.into(),
            version,
            process: process.into(),
        }
    }

    pub fn version_key(&self) -> VersionKey {
        VersionKey::new(self.object_id.clone(), self.workflow.clone(), self.version)
    }
}

impl fmt::Display for StepKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}@v{}:{}",
            self.object_id, self.workflow, self.version, self.process
        )
    }
}

/// Persisted scheduling state of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub key: StepKey,
    pub status: StepStatus,
    pub attempts: u32,
    pub lane: String,
    pub lifecycle: Option<String>,
    pub error_message: Option<String>,
    pub error_text: Option<String>,
    pub note: Option<String>,
    pub elapsed_seconds: f64,
    pub active_version: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowStep {
    /// A fresh, not yet persisted step.
    pub fn new(key: StepKey, status: StepStatus, lane: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            key,
            status,
            attempts: 0,
            lane: lane.into(),
            lifecycle: None,
            error_message: None,
            error_text: None,
            note: None,
            elapsed_seconds: 0.0,
            active_version: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn process(&self) -> &str {
        &self.key.process
    }

    /// Apply a status update in place; shared by every store implementation
    /// so the bookkeeping rules stay identical.
    pub fn apply_status(&mut self, update: &StatusUpdate, now: DateTime<Utc>) {
        if update.status == StepStatus::Started {
            self.attempts += 1;
        }
        if update.status != StepStatus::Error {
            self.error_message = None;
            self.error_text = None;
        }
        self.status = update.status;
        self.elapsed_seconds = update.elapsed_seconds;
        if let Some(lifecycle) = &update.lifecycle {
            self.lifecycle = Some(lifecycle.clone());
        }
        if let Some(note) = &update.note {
            self.note = Some(note.clone());
        }
        self.updated_at = now;
    }

    pub fn apply_error(&mut self, message: &str, text: Option<&str>, now: DateTime<Utc>) {
        self.status = StepStatus::Error;
        self.error_message = Some(message.to_string());
        self.error_text = text.map(str::to_string);
        self.updated_at = now;
    }
}

/// Status report from an external executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub key: StepKey,
    pub status: StepStatus,
    pub elapsed_seconds: f64,
    pub lifecycle: Option<String>,
    pub note: Option<String>,
    /// Optimistic check: refuse the update unless the step is currently in
    /// this status.
    pub expected_current: Option<StepStatus>,
}

impl StatusUpdate {
    pub fn new(key: StepKey, status: StepStatus) -> Self {
        Self {
            key,
            status,
            elapsed_seconds: 0.0,
            lifecycle: None,
            note: None,
            expected_current: None,
        }
    }

    pub fn completed(key: StepKey) -> Self {
        Self::new(key, StepStatus::Completed)
    }

    pub fn elapsed(mut self, seconds: f64) -> Self {
        self.elapsed_seconds = seconds;
        self
    }

    pub fn lifecycle(mut self, lifecycle: impl Into<String>) -> Self {
        self.lifecycle = Some(lifecycle.into());
        self
    }

    pub fn note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn expecting(mut self, current: StepStatus) -> Self {
        self.expected_current = Some(current);
        self
    }
}

/// A completed lifecycle milestone of an object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Milestone {
    pub lifecycle: String,
    pub version: u32,
    pub completed_at: DateTime<Utc>,
}

//! Step Dispatcher: routes claimed steps onto the execution fabric's queues.
//!
//! The default queue of a step is `{workflow}_{lane}`. Two fixed tables keyed
//! by process identity override that: dedicated queues isolate heavy or
//! serialization-sensitive processes, and fabric routes send a process to a
//! queue in another fabric's namespace altogether.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info};

#[cfg(test)]
use mockall::automock;

use crate::config::DispatchConfig;
use crate::error::{CollaboratorError, DispatchError};
use crate::steps::WorkflowStep;

/// Identity of a process across all instances of its workflow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessId {
    pub workflow: String,
    pub process: String,
}

impl ProcessId {
    pub fn new(workflow: impl Into<String>, process: impl Into<String>) -> Self {
        Self {
            workflow: workflow.into(),
            process: process.into(),
        }
    }

    pub fn of(step: &WorkflowStep) -> Self {
        Self::new(step.key.workflow.as_str(), step.key.process.as_str())
    }
}

/// Fully qualified queue name. `fabric` is `None` for the default fabric.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueAddress {
    pub fabric: Option<String>,
    pub name: String,
}

impl QueueAddress {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            fabric: None,
            name: name.into(),
        }
    }

    pub fn in_fabric(fabric: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            fabric: Some(fabric.into()),
            name: name.into(),
        }
    }
}

impl fmt::Display for QueueAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.fabric {
            Some(fabric) => write!(f, "{}:{}", fabric, self.name),
            None => f.write_str(&self.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid route for {workflow}/{process}: {reason}")]
pub struct InvalidRoute {
    pub workflow: String,
    pub process: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    dedicated: HashMap<ProcessId, QueueAddress>,
    fabric: HashMap<ProcessId, QueueAddress>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &DispatchConfig) -> Result<Self, InvalidRoute> {
        let mut table = Self::new();
        for route in &config.dedicated_queues {
            table = table.dedicated(&route.workflow, &route.process, &route.queue)?;
        }
        for route in &config.fabric_routes {
            table = table.fabric(&route.workflow, &route.process, &route.fabric, &route.queue)?;
        }
        Ok(table)
    }

    pub fn dedicated(
        mut self,
        workflow: &str,
        process: &str,
        queue: &str,
    ) -> Result<Self, InvalidRoute> {
        check_name(workflow, process, queue, "queue")?;
        self.dedicated
            .insert(ProcessId::new(workflow, process), QueueAddress::new(queue));
        Ok(self)
    }

    pub fn fabric(
        mut self,
        workflow: &str,
        process: &str,
        fabric: &str,
        queue: &str,
    ) -> Result<Self, InvalidRoute> {
        check_name(workflow, process, fabric, "fabric")?;
        check_name(workflow, process, queue, "queue")?;
        self.fabric.insert(
            ProcessId::new(workflow, process),
            QueueAddress::in_fabric(fabric, queue),
        );
        Ok(self)
    }

    /// Where a step goes: fabric override, then dedicated queue, then the
    /// lane queue of its workflow.
    pub fn route(&self, step: &WorkflowStep) -> QueueAddress {
        let id = ProcessId::of(step);
        if let Some(address) = self.fabric.get(&id) {
            return address.clone();
        }
        if let Some(address) = self.dedicated.get(&id) {
            return address.clone();
        }
        QueueAddress::new(format!("{}_{}", step.key.workflow, step.lane))
    }
}

fn check_name(workflow: &str, process: &str, value: &str, what: &str) -> Result<(), InvalidRoute> {
    if value.trim().is_empty() {
        return Err(InvalidRoute {
            workflow: workflow.to_string(),
            process: process.to_string(),
            reason: format!("{what} name is empty"),
        });
    }
    Ok(())
}

/// Payload handed to the execution fabric.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub object_id: String,
    pub workflow: String,
    pub process: String,
    pub version: u32,
    pub lane: String,
}

impl Job {
    pub fn for_step(step: &WorkflowStep) -> Self {
        Self {
            object_id: step.key.object_id.clone(),
            workflow: step.key.workflow.clone(),
            process: step.key.process.clone(),
            version: step.key.version,
            lane: step.lane.clone(),
        }
    }
}

/// The execution fabric, seen as an opaque enqueue sink.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Enqueue a JSON job payload and return the fabric's job id.
    async fn enqueue(&self, queue: &QueueAddress, payload: &str)
        -> Result<String, CollaboratorError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchedJob {
    pub job_id: String,
    pub queue: QueueAddress,
    pub job: Job,
}

pub struct StepDispatcher {
    routes: RoutingTable,
    queue: Arc<dyn WorkQueue>,
}

impl StepDispatcher {
    pub fn new(routes: RoutingTable, queue: Arc<dyn WorkQueue>) -> Self {
        Self { routes, queue }
    }

    pub fn routes(&self) -> &RoutingTable {
        &self.routes
    }

    pub async fn dispatch(&self, step: &WorkflowStep) -> Result<DispatchedJob, DispatchError> {
        let queue = self.routes.route(step);
        let job = Job::for_step(step);
        let payload = serde_json::to_string(&job).map_err(|source| DispatchError::Payload {
            key: step.key.clone(),
            source,
        })?;

        match self.queue.enqueue(&queue, &payload).await {
            Ok(job_id) => {
                info!(
                    object_id = %step.key.object_id,
                    workflow = %step.key.workflow,
                    version = step.key.version,
                    process = %step.key.process,
                    queue = %queue,
                    job_id = %job_id,
                    "Dispatched step"
                );
                Ok(DispatchedJob { job_id, queue, job })
            }
            Err(e) => {
                error!(
                    object_id = %step.key.object_id,
                    workflow = %step.key.workflow,
                    version = step.key.version,
                    process = %step.key.process,
                    queue = %queue,
                    error = %e,
                    "Failed to dispatch queued step"
                );
                Err(DispatchError::Enqueue {
                    key: step.key.clone(),
                    queue: queue.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Dispatch every step once, even when some fail. Fails with `Partial`
    /// listing the steps left without a job.
    pub async fn dispatch_all(
        &self,
        steps: &[WorkflowStep],
    ) -> Result<Vec<DispatchedJob>, (Vec<DispatchedJob>, DispatchError)> {
        let mut dispatched = Vec::with_capacity(steps.len());
        let mut failures = Vec::new();

        for step in steps {
            match self.dispatch(step).await {
                Ok(job) => dispatched.push(job),
                Err(e) => failures.push(e),
            }
        }

        if failures.is_empty() {
            Ok(dispatched)
        } else {
            Err((dispatched, DispatchError::Partial { failures }))
        }
    }
}

/// Work queue that keeps jobs in memory. Queues can be marked as failing to
/// exercise dispatch error handling.
#[derive(Debug, Default)]
pub struct InMemoryWorkQueue {
    jobs: Mutex<Vec<(QueueAddress, Job)>>,
    failing: Mutex<HashSet<String>>,
}

impl InMemoryWorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn jobs(&self) -> Vec<(QueueAddress, Job)> {
        self.jobs.lock().await.clone()
    }

    pub async fn processes(&self) -> Vec<String> {
        self.jobs
            .lock()
            .await
            .iter()
            .map(|(_, job)| job.process.clone())
            .collect()
    }

    pub async fn fail_queue(&self, name: &str) {
        self.failing.lock().await.insert(name.to_string());
    }

    pub async fn recover_queue(&self, name: &str) {
        self.failing.lock().await.remove(name);
    }
}

#[async_trait]
impl WorkQueue for InMemoryWorkQueue {
    async fn enqueue(
        &self,
        queue: &QueueAddress,
        payload: &str,
    ) -> Result<String, CollaboratorError> {
        if self.failing.lock().await.contains(&queue.to_string()) {
            return Err(CollaboratorError::Unavailable {
                service: "work queue".to_string(),
                reason: format!("queue {queue} rejected the job"),
            });
        }

        let job: Job = serde_json::from_str(payload).map_err(|e| CollaboratorError::Unavailable {
            service: "work queue".to_string(),
            reason: format!("unreadable payload: {e}"),
        })?;
        self.jobs.lock().await.push((queue.clone(), job));
        Ok(uuid::Uuid::new_v4().to_string())
    }
}

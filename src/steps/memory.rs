use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use tracing::debug;

use super::store::StepStore;
use super::types::{StatusUpdate, StepKey, StepStatus, VersionKey, WorkflowStep};
use crate::error::StoreError;

/// Step store held in process memory.
///
/// Every operation takes the write lock for its whole duration, which gives
/// the same per-operation atomicity the SQLite store gets from its
/// conditional updates.
#[derive(Debug, Default)]
pub struct InMemoryStepStore {
    steps: RwLock<BTreeMap<StepKey, WorkflowStep>>,
}

impl InMemoryStepStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.steps.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.steps.read().await.is_empty()
    }

    /// Overwrite the last-update time of a step. Used to age steps in tests
    /// and when importing existing state.
    pub async fn set_updated_at(&self, key: &StepKey, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut steps = self.steps.write().await;
        let step = steps
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        step.updated_at = at;
        Ok(())
    }
}

#[async_trait]
impl StepStore for InMemoryStepStore {
    async fn instantiate(&self, new_steps: Vec<WorkflowStep>) -> Result<usize, StoreError> {
        let mut steps = self.steps.write().await;
        let mut inserted = 0;

        for mut step in new_steps {
            if steps.contains_key(&step.key) {
                continue;
            }

            let object_id = step.key.object_id.clone();
            let version = step.key.version;
            let newest = steps
                .values()
                .filter(|s| s.key.object_id == object_id)
                .map(|s| s.key.version)
                .max()
                .map_or(true, |max| version >= max);

            if newest {
                for existing in steps.values_mut().filter(|s| s.key.object_id == object_id) {
                    existing.active_version = existing.key.version == version;
                }
            }
            step.active_version = newest;

            steps.insert(step.key.clone(), step);
            inserted += 1;
        }

        debug!(inserted, "Instantiated workflow steps in memory");
        Ok(inserted)
    }

    async fn find(&self, key: &StepKey) -> Result<WorkflowStep, StoreError> {
        self.steps
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.clone()))
    }

    async fn steps_for(&self, version: &VersionKey) -> Result<Vec<WorkflowStep>, StoreError> {
        Ok(self
            .steps
            .read()
            .await
            .values()
            .filter(|s| {
                s.key.object_id == version.object_id
                    && s.key.workflow == version.workflow
                    && s.key.version == version.version
            })
            .cloned()
            .collect())
    }

    async fn steps_for_object(&self, object_id: &str) -> Result<Vec<WorkflowStep>, StoreError> {
        Ok(self
            .steps
            .read()
            .await
            .values()
            .filter(|s| s.key.object_id == object_id)
            .cloned()
            .collect())
    }

    async fn update_status(&self, update: &StatusUpdate) -> Result<WorkflowStep, StoreError> {
        let mut steps = self.steps.write().await;
        let step = steps
            .get_mut(&update.key)
            .ok_or_else(|| StoreError::NotFound(update.key.clone()))?;

        if let Some(expected) = update.expected_current {
            if step.status != expected {
                return Err(StoreError::Conflict {
                    key: update.key.clone(),
                    expected,
                    actual: step.status,
                });
            }
        }

        step.apply_status(update, Utc::now());
        Ok(step.clone())
    }

    async fn update_error(
        &self,
        key: &StepKey,
        message: &str,
        text: Option<&str>,
    ) -> Result<WorkflowStep, StoreError> {
        let mut steps = self.steps.write().await;
        let step = steps
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        step.apply_error(message, text, Utc::now());
        Ok(step.clone())
    }

    async fn claim_waiting(
        &self,
        version: &VersionKey,
        processes: &[String],
    ) -> Result<Vec<WorkflowStep>, StoreError> {
        let mut steps = self.steps.write().await;
        let now = Utc::now();
        let mut claimed = Vec::new();

        for process in processes {
            if let Some(step) = steps.get_mut(&version.step(process.clone())) {
                if step.status == StepStatus::Waiting {
                    step.status = StepStatus::Queued;
                    step.updated_at = now;
                    claimed.push(step.clone());
                }
            }
        }

        Ok(claimed)
    }

    async fn stale_steps(
        &self,
        status: StepStatus,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkflowStep>, StoreError> {
        let mut stale: Vec<WorkflowStep> = self
            .steps
            .read()
            .await
            .values()
            .filter(|s| s.status == status && s.updated_at < updated_before)
            .cloned()
            .collect();
        stale.sort_by_key(|s| s.updated_at);
        stale.truncate(limit);
        Ok(stale)
    }
}

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::types::{StatusUpdate, StepKey, StepStatus, VersionKey, WorkflowStep};
use crate::error::StoreError;

/// The persisted record of every workflow step.
///
/// The store exclusively owns step state. Every mutation goes through one of
/// these operations, each of which is atomic on its own.
#[async_trait]
pub trait StepStore: Send + Sync {
    /// Insert the steps of a freshly instantiated workflow.
    ///
    /// Rows whose identity already exists are left untouched, so instantiating
    /// the same workflow twice never duplicates steps. When the steps belong to
    /// the newest version of the object, they become the active version and
    /// every older row of the object is marked inactive. Returns the number of
    /// rows actually inserted.
    async fn instantiate(&self, steps: Vec<WorkflowStep>) -> Result<usize, StoreError>;

    async fn find(&self, key: &StepKey) -> Result<WorkflowStep, StoreError>;

    /// All steps of one workflow instance. Empty when it was never instantiated.
    async fn steps_for(&self, version: &VersionKey) -> Result<Vec<WorkflowStep>, StoreError>;

    /// Every step of every workflow and version of an object.
    async fn steps_for_object(&self, object_id: &str) -> Result<Vec<WorkflowStep>, StoreError>;

    /// Fails with `Conflict` when `update.expected_current` is set and does not
    /// match the persisted status.
    async fn update_status(&self, update: &StatusUpdate) -> Result<WorkflowStep, StoreError>;

    async fn update_error(
        &self,
        key: &StepKey,
        message: &str,
        text: Option<&str>,
    ) -> Result<WorkflowStep, StoreError>;

    /// Move the named processes of one workflow instance from `waiting` to
    /// `queued` in a single atomic operation and return the rows that actually
    /// moved. Rows in any other status are left alone, so concurrent callers
    /// never claim the same row twice.
    async fn claim_waiting(
        &self,
        version: &VersionKey,
        processes: &[String],
    ) -> Result<Vec<WorkflowStep>, StoreError>;

    /// Steps in `status` whose last update is older than `updated_before`,
    /// oldest first.
    async fn stale_steps(
        &self,
        status: StepStatus,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkflowStep>, StoreError>;
}

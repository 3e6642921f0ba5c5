//! Interfaces to the services the scheduler depends on but does not own.
//!
//! Each trait is the whole contract the core needs from that service. The
//! `memory` module has simple in-process implementations for tests and local
//! runs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[cfg(test)]
use mockall::automock;

use crate::error::CollaboratorError;
use crate::steps::WorkflowStep;

pub mod memory;

pub use memory::{InMemoryObjectStore, InMemoryPreservation, RecordingIndexer};

/// Description of why a version exists. `close` requires both description
/// and significance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionMetadata {
    pub description: Option<String>,
    pub significance: Option<String>,
    pub user: Option<String>,
}

impl VersionMetadata {
    pub fn new(description: impl Into<String>, significance: impl Into<String>) -> Self {
        Self {
            description: Some(description.into()),
            significance: Some(significance.into()),
            user: None,
        }
    }

    pub fn by(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.description.is_none() && self.significance.is_none() && self.user.is_none()
    }

    /// Fields set in `overrides` win; everything else is kept.
    pub fn merged(&self, overrides: &VersionMetadata) -> VersionMetadata {
        VersionMetadata {
            description: overrides
                .description
                .clone()
                .or_else(|| self.description.clone()),
            significance: overrides
                .significance
                .clone()
                .or_else(|| self.significance.clone()),
            user: overrides.user.clone().or_else(|| self.user.clone()),
        }
    }
}

/// Version history events recorded on the object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum VersionEvent {
    Opened {
        version: u32,
        metadata: VersionMetadata,
    },
    Closed {
        version: u32,
        metadata: VersionMetadata,
    },
}

/// The descriptive/structural object store: source of the version counter
/// and the version description.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn current_version(&self, object_id: &str) -> Result<u32, CollaboratorError>;

    /// Move the version counter from `from` to `from + 1`. Returns false,
    /// changing nothing, when the counter is no longer at `from`.
    async fn advance_version(&self, object_id: &str, from: u32) -> Result<bool, CollaboratorError>;

    async fn version_metadata(
        &self,
        object_id: &str,
        version: u32,
    ) -> Result<VersionMetadata, CollaboratorError>;

    async fn record_version_metadata(
        &self,
        object_id: &str,
        version: u32,
        metadata: &VersionMetadata,
    ) -> Result<(), CollaboratorError>;

    async fn record_event(
        &self,
        object_id: &str,
        event: &VersionEvent,
    ) -> Result<(), CollaboratorError>;
}

/// The preservation store, consulted for the last preserved version.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PreservationService: Send + Sync {
    /// `None` when preservation has never seen the object.
    async fn current_version(&self, object_id: &str) -> Result<Option<u32>, CollaboratorError>;
}

/// The search indexer.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait IndexingService: Send + Sync {
    /// Idempotent; callers may send duplicates.
    async fn reindex(&self, object_id: &str) -> Result<(), CollaboratorError>;

    async fn step_updated(&self, step: &WorkflowStep) -> Result<(), CollaboratorError>;
}

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

use super::{IndexingService, ObjectStore, PreservationService, VersionEvent, VersionMetadata};
use crate::error::CollaboratorError;
use crate::steps::{StepKey, WorkflowStep};

#[derive(Debug, Clone, Default)]
struct ObjectRecord {
    version: u32,
    metadata: HashMap<u32, VersionMetadata>,
    events: Vec<VersionEvent>,
}

/// Object store kept in memory.
#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    objects: Mutex<HashMap<String, ObjectRecord>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new object at version 1.
    pub async fn register(&self, object_id: &str) {
        self.objects.lock().await.insert(
            object_id.to_string(),
            ObjectRecord {
                version: 1,
                ..Default::default()
            },
        );
    }

    pub async fn events(&self, object_id: &str) -> Vec<VersionEvent> {
        self.objects
            .lock()
            .await
            .get(object_id)
            .map(|o| o.events.clone())
            .unwrap_or_default()
    }
}

fn missing(object_id: &str) -> CollaboratorError {
    CollaboratorError::ObjectNotFound {
        service: "object store".to_string(),
        object_id: object_id.to_string(),
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn current_version(&self, object_id: &str) -> Result<u32, CollaboratorError> {
        self.objects
            .lock()
            .await
            .get(object_id)
            .map(|o| o.version)
            .ok_or_else(|| missing(object_id))
    }

    async fn advance_version(&self, object_id: &str, from: u32) -> Result<bool, CollaboratorError> {
        let mut objects = self.objects.lock().await;
        let object = objects.get_mut(object_id).ok_or_else(|| missing(object_id))?;
        if object.version != from {
            return Ok(false);
        }
        object.version = from + 1;
        Ok(true)
    }

    async fn version_metadata(
        &self,
        object_id: &str,
        version: u32,
    ) -> Result<VersionMetadata, CollaboratorError> {
        let objects = self.objects.lock().await;
        let object = objects.get(object_id).ok_or_else(|| missing(object_id))?;
        Ok(object.metadata.get(&version).cloned().unwrap_or_default())
    }

    async fn record_version_metadata(
        &self,
        object_id: &str,
        version: u32,
        metadata: &VersionMetadata,
    ) -> Result<(), CollaboratorError> {
        let mut objects = self.objects.lock().await;
        let object = objects.get_mut(object_id).ok_or_else(|| missing(object_id))?;
        object.metadata.insert(version, metadata.clone());
        Ok(())
    }

    async fn record_event(
        &self,
        object_id: &str,
        event: &VersionEvent,
    ) -> Result<(), CollaboratorError> {
        let mut objects = self.objects.lock().await;
        let object = objects.get_mut(object_id).ok_or_else(|| missing(object_id))?;
        object.events.push(event.clone());
        Ok(())
    }
}

/// Preservation store kept in memory; objects are unknown until given a
/// version.
#[derive(Debug, Default)]
pub struct InMemoryPreservation {
    versions: Mutex<HashMap<String, u32>>,
}

impl InMemoryPreservation {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_version(&self, object_id: &str, version: u32) {
        self.versions
            .lock()
            .await
            .insert(object_id.to_string(), version);
    }
}

#[async_trait]
impl PreservationService for InMemoryPreservation {
    async fn current_version(&self, object_id: &str) -> Result<Option<u32>, CollaboratorError> {
        Ok(self.versions.lock().await.get(object_id).copied())
    }
}

/// Indexer that only records what it was asked to do.
#[derive(Debug, Default)]
pub struct RecordingIndexer {
    reindexed: Mutex<Vec<String>>,
    notified: Mutex<Vec<StepKey>>,
}

impl RecordingIndexer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn reindexed(&self) -> Vec<String> {
        self.reindexed.lock().await.clone()
    }

    pub async fn notified(&self) -> Vec<StepKey> {
        self.notified.lock().await.clone()
    }
}

#[async_trait]
impl IndexingService for RecordingIndexer {
    async fn reindex(&self, object_id: &str) -> Result<(), CollaboratorError> {
        self.reindexed.lock().await.push(object_id.to_string());
        Ok(())
    }

    async fn step_updated(&self, step: &WorkflowStep) -> Result<(), CollaboratorError> {
        self.notified.lock().await.push(step.key.clone());
        Ok(())
    }
}

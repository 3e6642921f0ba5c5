use std::collections::HashMap;
use std::sync::{Arc, PoisonError};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, Instrument};

use super::state::{LifecycleTerminals, VersionState};
use crate::collaborators::{
    ObjectStore, PreservationService, VersionEvent, VersionMetadata,
};
use crate::error::{LifecycleError, PreconditionFailure, ServiceError};
use crate::service::WorkflowService;
use crate::steps::{StatusUpdate, VersionKey};
use crate::telemetry::{create_lifecycle_span, generate_correlation_id};
use crate::workflows::{ACCESSION_WORKFLOW, VERSIONING_WORKFLOW};

#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    /// Skip the accessioned and preservation checks for version 1.
    pub assume_accessioned: bool,
    /// Recorded with a version-opened event when not empty.
    pub metadata: Option<VersionMetadata>,
    pub lane: Option<String>,
}

impl OpenOptions {
    pub fn assume_accessioned(mut self) -> Self {
        self.assume_accessioned = true;
        self
    }

    pub fn metadata(mut self, metadata: VersionMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn lane(mut self, lane: impl Into<String>) -> Self {
        self.lane = Some(lane.into());
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct CloseOptions {
    /// Fields that replace the recorded version metadata.
    pub metadata: Option<VersionMetadata>,
    pub lane: Option<String>,
}

impl CloseOptions {
    pub fn metadata(mut self, metadata: VersionMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn lane(mut self, lane: impl Into<String>) -> Self {
        self.lane = Some(lane.into());
        self
    }
}

/// One mutex per object with an operation in flight.
#[derive(Debug, Default)]
struct ObjectLocks {
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ObjectLocks {
    async fn acquire(&self, object_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(object_id.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    /// Drop the object's mutex once nobody holds or waits for it.
    fn release(&self, object_id: &str, guard: OwnedMutexGuard<()>) {
        drop(guard);
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(object_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(object_id);
        }
    }
}

/// Opens and closes object versions. Calls for the same object are
/// serialized, so preconditions and the mutation they guard are applied
/// together.
pub struct VersionLifecycleController {
    service: Arc<WorkflowService>,
    objects: Arc<dyn ObjectStore>,
    preservation: Arc<dyn PreservationService>,
    locks: ObjectLocks,
}

impl VersionLifecycleController {
    pub fn new(
        service: Arc<WorkflowService>,
        objects: Arc<dyn ObjectStore>,
        preservation: Arc<dyn PreservationService>,
    ) -> Self {
        Self {
            service,
            objects,
            preservation,
            locks: ObjectLocks::default(),
        }
    }

    pub fn service(&self) -> &Arc<WorkflowService> {
        &self.service
    }

    /// State of the object's current version.
    pub async fn current_state(&self, object_id: &str) -> Result<VersionState, LifecycleError> {
        let version = self.objects.current_version(object_id).await?;
        Ok(self.service.version_state(object_id, version).await?)
    }

    /// Open a new version for editing and return its number.
    pub async fn open(&self, object_id: &str, options: OpenOptions) -> Result<u32, LifecycleError> {
        let span = create_lifecycle_span("open", object_id, &generate_correlation_id());
        let guard = self.locks.acquire(object_id).await;
        let result = self.open_locked(object_id, options).instrument(span).await;
        self.locks.release(object_id, guard);
        result
    }

    async fn open_locked(&self, object_id: &str, options: OpenOptions) -> Result<u32, LifecycleError> {
        let current = self.objects.current_version(object_id).await?;
        let state = self.service.version_state(object_id, current).await?;

        if state.open {
            return Err(LifecycleError::AlreadyOpen {
                object_id: object_id.to_string(),
                version: current,
            });
        }
        if state.accessioning {
            return Err(LifecycleError::precondition(
                object_id,
                PreconditionFailure::AccessioningInProgress { version: current },
            ));
        }

        let bypass = options.assume_accessioned && current == 1;
        if !state.accessioned && !bypass {
            return Err(LifecycleError::NotAccessioned {
                object_id: object_id.to_string(),
            });
        }
        if !bypass {
            self.check_preserved(object_id, current).await?;
        }

        // The versioning rows claim the new version; the store lets exactly
        // one caller create them. The counter follows the rows, so a bump
        // that failed earlier is completed by the next attempt.
        let version = current + 1;
        let mut instantiation = self
            .service
            .start_workflow(object_id, VERSIONING_WORKFLOW, version, options.lane.as_deref())
            .await?;
        if !self.objects.advance_version(object_id, current).await? {
            debug!(version, "Version counter already advanced");
        }
        if instantiation.created == 0 {
            return Err(LifecycleError::AlreadyOpen {
                object_id: object_id.to_string(),
                version,
            });
        }

        if let Some(metadata) = options.metadata.filter(|m| !m.is_empty()) {
            self.objects
                .record_version_metadata(object_id, version, &metadata)
                .await?;
            self.objects
                .record_event(object_id, &VersionEvent::Opened { version, metadata })
                .await?;
        }

        if let Some(source) = instantiation.resolution.dispatch_error.take() {
            return Err(LifecycleError::StrandedDispatch {
                object_id: object_id.to_string(),
                version,
                source,
            });
        }
        info!(version, "Opened object version");
        Ok(version)
    }

    async fn check_preserved(&self, object_id: &str, current: u32) -> Result<(), LifecycleError> {
        match self.preservation.current_version(object_id).await? {
            None => Err(LifecycleError::NotAccessioned {
                object_id: object_id.to_string(),
            }),
            Some(preserved) if preserved != current => Err(LifecycleError::precondition(
                object_id,
                PreconditionFailure::PreservationVersionMismatch { preserved, current },
            )),
            Some(_) => Ok(()),
        }
    }

    /// Submit the open version and start accessioning it. Returns the
    /// version that was closed.
    pub async fn close(&self, object_id: &str, options: CloseOptions) -> Result<u32, LifecycleError> {
        let span = create_lifecycle_span("close", object_id, &generate_correlation_id());
        let guard = self.locks.acquire(object_id).await;
        let result = self.close_locked(object_id, options).instrument(span).await;
        self.locks.release(object_id, guard);
        result
    }

    async fn close_locked(&self, object_id: &str, options: CloseOptions) -> Result<u32, LifecycleError> {
        let version = self.objects.current_version(object_id).await?;
        let recorded = self.objects.version_metadata(object_id, version).await?;
        let metadata = match &options.metadata {
            Some(overrides) => recorded.merged(overrides),
            None => recorded,
        };

        let fail = |failure| Err(LifecycleError::precondition(object_id, failure));
        if is_blank(&metadata.description) {
            return fail(PreconditionFailure::MissingDescription { version });
        }
        if is_blank(&metadata.significance) {
            return fail(PreconditionFailure::MissingSignificance { version });
        }

        let state = self.service.version_state(object_id, version).await?;
        let resuming = state.close_interrupted();
        if !state.open && !resuming {
            return fail(PreconditionFailure::NotOpen { version });
        }
        if state.assembling {
            return fail(PreconditionFailure::AssemblyIncomplete { version });
        }
        if state.accession_started() {
            return fail(PreconditionFailure::AccessioningAlreadyExists { version });
        }

        if options.metadata.is_some() {
            self.objects
                .record_version_metadata(object_id, version, &metadata)
                .await?;
        }

        if resuming {
            info!(version, "Resuming interrupted close");
        } else {
            let terminals = LifecycleTerminals::load(self.service.definitions())
                .await
                .map_err(ServiceError::from)?;
            let submit =
                VersionKey::new(object_id, VERSIONING_WORKFLOW, version).step(terminals.versioning);
            self.service
                .update_status(StatusUpdate::completed(submit))
                .await?;
        }

        let mut instantiation = self
            .service
            .start_workflow(object_id, ACCESSION_WORKFLOW, version, options.lane.as_deref())
            .await?;
        if instantiation.created == 0 {
            return fail(PreconditionFailure::AccessioningAlreadyExists { version });
        }

        // The accessioning rows exist from here on, so the close is recorded
        // even when their first steps could not be enqueued.
        self.objects
            .record_event(object_id, &VersionEvent::Closed { version, metadata })
            .await?;

        if let Some(source) = instantiation.resolution.dispatch_error.take() {
            return Err(LifecycleError::StrandedDispatch {
                object_id: object_id.to_string(),
                version,
                source,
            });
        }
        info!(version, "Closed object version; accessioning started");
        Ok(version)
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}

impl std::fmt::Debug for VersionLifecycleController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionLifecycleController")
            .field("service", &self.service)
            .finish()
    }
}

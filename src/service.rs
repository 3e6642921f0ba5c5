//! `WorkflowService`: the entry point executors and the lifecycle controller
//! use to create workflows and report step progress.

use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn, Instrument};

use crate::dispatch::{DispatchedJob, StepDispatcher};
use crate::error::{ResolveError, ServiceError, StoreError};
use crate::lifecycle::{LifecycleTerminals, VersionState};
use crate::notify::Notifier;
use crate::resolver::{NextStepResolver, Resolution};
use crate::steps::{
    Milestone, StatusUpdate, StepKey, StepStatus, StepStore, VersionKey, WorkflowStep,
    DEFAULT_LANE,
};
use crate::telemetry::{create_span_for_step, create_step_span, generate_correlation_id};
use crate::workflows::{DefinitionCache, ACCESSION_WORKFLOW};

/// Result of creating a workflow instance.
#[derive(Debug)]
pub struct Instantiation {
    pub version: VersionKey,
    /// Rows inserted; zero when the workflow already existed.
    pub created: usize,
    pub resolution: Resolution,
}

/// Result of a status report.
#[derive(Debug)]
pub struct StepOutcome {
    pub step: WorkflowStep,
    /// Empty unless the step moved to `completed`.
    pub resolution: Resolution,
}

pub struct WorkflowService {
    store: Arc<dyn StepStore>,
    definitions: DefinitionCache,
    resolver: NextStepResolver,
    notifier: Arc<Notifier>,
    default_lane: String,
}

impl WorkflowService {
    pub fn new(
        store: Arc<dyn StepStore>,
        definitions: DefinitionCache,
        dispatcher: Arc<StepDispatcher>,
        notifier: Arc<Notifier>,
    ) -> Self {
        let resolver = NextStepResolver::new(Arc::clone(&store), definitions.clone(), dispatcher);
        Self {
            store,
            definitions,
            resolver,
            notifier,
            default_lane: DEFAULT_LANE.to_string(),
        }
    }

    pub fn with_default_lane(mut self, lane: impl Into<String>) -> Self {
        self.default_lane = lane.into();
        self
    }

    pub fn store(&self) -> &Arc<dyn StepStore> {
        &self.store
    }

    pub fn definitions(&self) -> &DefinitionCache {
        &self.definitions
    }

    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    /// Create every step of `workflow` for one object version and dispatch
    /// its root processes. Instantiating an existing workflow creates nothing
    /// but still dispatches anything left runnable.
    pub async fn instantiate_workflow(
        &self,
        object_id: &str,
        workflow: &str,
        version: u32,
        lane: Option<&str>,
    ) -> Result<Instantiation, ServiceError> {
        let mut instantiation = self.start_workflow(object_id, workflow, version, lane).await?;
        if let Some(e) = instantiation.resolution.dispatch_error.take() {
            return Err(ResolveError::Dispatch(e).into());
        }
        Ok(instantiation)
    }

    /// As [`instantiate_workflow`](Self::instantiate_workflow), except that a
    /// dispatch failure is left in `resolution.dispatch_error`. The rows exist
    /// either way, so callers can finish their own bookkeeping first.
    pub async fn start_workflow(
        &self,
        object_id: &str,
        workflow: &str,
        version: u32,
        lane: Option<&str>,
    ) -> Result<Instantiation, ServiceError> {
        let key = VersionKey::new(object_id, workflow, version);
        let span = create_step_span("instantiate", &key, None, &generate_correlation_id());

        async {
            let definition = self.definitions.load(workflow).await?;
            let lane = lane.unwrap_or(&self.default_lane);
            let steps = definition.initial_steps(object_id, version, Some(lane), Utc::now());
            let created = self.store.instantiate(steps).await?;
            info!(created, lane, "Instantiated workflow");

            let resolution = self.resolver.advance(&key).await?;
            Ok::<_, ServiceError>(Instantiation {
                version: key.clone(),
                created,
                resolution,
            })
        }
        .instrument(span)
        .await
    }

    /// Record a status report. A completion triggers a resolution pass and
    /// delivers its events.
    pub async fn update_status(&self, update: StatusUpdate) -> Result<StepOutcome, ServiceError> {
        let span = create_span_for_step("update_status", &update.key, &generate_correlation_id());

        async {
            let update = self.guard_accessioned(update).await?;
            let step = self.store.update_status(&update).await?;
            info!(status = %step.status, attempts = step.attempts, "Step status updated");

            if step.status != StepStatus::Completed {
                return Ok(StepOutcome {
                    step,
                    resolution: Resolution::default(),
                });
            }

            let mut resolution = self.resolver.on_completed(&step).await?;
            let events = std::mem::take(&mut resolution.events);
            self.notifier.deliver(events).await;
            let resolution = resolution.into_result()?;
            Ok::<_, ServiceError>(StepOutcome { step, resolution })
        }
        .instrument(span)
        .await
    }

    pub async fn update_error(
        &self,
        key: &StepKey,
        message: &str,
        text: Option<&str>,
    ) -> Result<WorkflowStep, ServiceError> {
        let current = self.store.find(key).await?;
        if self.is_accessioned_terminal(&current).await? {
            return Err(ServiceError::AccessionedImmutable(key.clone()));
        }

        let step = self.store.update_error(key, message, text).await?;
        warn!(step = %key, error = message, "Step reported an error");
        Ok(step)
    }

    /// Enqueue a `queued` step again without claiming it. This is the retry
    /// path after a dispatch failure.
    pub async fn redispatch(&self, key: &StepKey) -> Result<DispatchedJob, ServiceError> {
        let step = self.store.find(key).await?;
        if step.status != StepStatus::Queued {
            return Err(StoreError::Conflict {
                key: key.clone(),
                expected: StepStatus::Queued,
                actual: step.status,
            }
            .into());
        }

        info!(step = %key, "Re-dispatching queued step");
        Ok(self.resolver.dispatcher().dispatch(&step).await?)
    }

    pub async fn version_state(
        &self,
        object_id: &str,
        version: u32,
    ) -> Result<VersionState, ServiceError> {
        let terminals = LifecycleTerminals::load(&self.definitions).await?;
        let steps = self.store.steps_for_object(object_id).await?;
        Ok(VersionState::derive(version, &steps, &terminals))
    }

    /// Completed lifecycle milestones of an object, oldest first.
    pub async fn lifecycle_milestones(&self, object_id: &str) -> Result<Vec<Milestone>, ServiceError> {
        let mut milestones: Vec<Milestone> = self
            .store
            .steps_for_object(object_id)
            .await?
            .into_iter()
            .filter(|s| s.status == StepStatus::Completed)
            .filter_map(|s| {
                s.lifecycle.map(|lifecycle| Milestone {
                    lifecycle,
                    version: s.key.version,
                    completed_at: s.updated_at,
                })
            })
            .collect();
        milestones.sort_by(|a, b| {
            a.completed_at
                .cmp(&b.completed_at)
                .then(a.version.cmp(&b.version))
        });
        Ok(milestones)
    }

    /// Refuse updates to a completed accessioning terminal step. Any other
    /// update to that step is pinned to the status just read, so a completion
    /// racing with it turns into a conflict.
    async fn guard_accessioned(&self, mut update: StatusUpdate) -> Result<StatusUpdate, ServiceError> {
        if update.key.workflow != ACCESSION_WORKFLOW {
            return Ok(update);
        }

        let current = self.store.find(&update.key).await?;
        if self.is_accessioned_terminal(&current).await? {
            return Err(ServiceError::AccessionedImmutable(update.key));
        }
        let definition = self.definitions.load(ACCESSION_WORKFLOW).await?;
        if definition.is_terminal(current.process()) && update.expected_current.is_none() {
            update.expected_current = Some(current.status);
        }
        Ok(update)
    }

    async fn is_accessioned_terminal(&self, step: &WorkflowStep) -> Result<bool, ServiceError> {
        if step.key.workflow != ACCESSION_WORKFLOW || step.status != StepStatus::Completed {
            return Ok(false);
        }
        let definition = self.definitions.load(ACCESSION_WORKFLOW).await?;
        Ok(definition.is_terminal(step.process()))
    }
}

impl std::fmt::Debug for WorkflowService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowService")
            .field("definitions", &self.definitions)
            .field("default_lane", &self.default_lane)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::RecordingIndexer;
    use crate::config::NotificationConfig;
    use crate::dispatch::{InMemoryWorkQueue, RoutingTable};
    use crate::steps::InMemoryStepStore;

    const OBJECT: &str = "druid:bc123df4567";

    struct Fixture {
        service: WorkflowService,
        store: Arc<InMemoryStepStore>,
        queue: Arc<InMemoryWorkQueue>,
        indexer: Arc<RecordingIndexer>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStepStore::new());
        let queue = Arc::new(InMemoryWorkQueue::new());
        let indexer = Arc::new(RecordingIndexer::new());
        let notifier = Arc::new(Notifier::new(
            indexer.clone(),
            &NotificationConfig {
                terminal_step_delay_ms: 0,
                reindex_delay_ms: 0,
            },
        ));
        let routes = RoutingTable::new()
            .dedicated(ACCESSION_WORKFLOW, "shelve", "accessionWF_shelve")
            .unwrap();
        let service = WorkflowService::new(
            store.clone(),
            DefinitionCache::builtin(),
            Arc::new(StepDispatcher::new(routes, queue.clone())),
            notifier,
        );
        Fixture {
            service,
            store,
            queue,
            indexer,
        }
    }

    fn accession_step(process: &str) -> StepKey {
        StepKey::new(OBJECT, ACCESSION_WORKFLOW, 1, process)
    }

    #[tokio::test]
    async fn test_instantiate_dispatches_roots_once() {
        let f = fixture();
        let first = f
            .service
            .instantiate_workflow(OBJECT, ACCESSION_WORKFLOW, 1, None)
            .await
            .unwrap();
        assert!(first.created > 0);
        assert_eq!(first.resolution.claimed_processes(), vec!["start-accession"]);

        let again = f
            .service
            .instantiate_workflow(OBJECT, ACCESSION_WORKFLOW, 1, None)
            .await
            .unwrap();
        assert_eq!(again.created, 0);
        assert!(again.resolution.claimed.is_empty());
        assert_eq!(f.queue.jobs().await.len(), 1);
    }

    #[tokio::test]
    async fn test_configured_default_lane() {
        let f = fixture();
        let service = f.service.with_default_lane("priority");
        service
            .instantiate_workflow(OBJECT, ACCESSION_WORKFLOW, 1, None)
            .await
            .unwrap();

        let start = f.store.find(&accession_step("start-accession")).await.unwrap();
        assert_eq!(start.lane, "priority");
        assert_eq!(f.queue.jobs().await[0].0.name, "accessionWF_priority");
    }

    #[tokio::test]
    async fn test_completion_dispatches_next_and_reindexes() {
        let f = fixture();
        f.service
            .instantiate_workflow(OBJECT, ACCESSION_WORKFLOW, 1, Some("low"))
            .await
            .unwrap();

        let outcome = f
            .service
            .update_status(StatusUpdate::completed(accession_step("start-accession")).elapsed(1.5))
            .await
            .unwrap();
        assert_eq!(outcome.resolution.claimed_processes(), vec!["stage"]);
        assert_eq!(outcome.step.elapsed_seconds, 1.5);

        let jobs = f.queue.jobs().await;
        assert_eq!(jobs.last().unwrap().0.name, "accessionWF_low");

        f.service.notifier().flush().await;
        assert_eq!(f.indexer.reindexed().await, vec![OBJECT.to_string()]);
    }

    #[tokio::test]
    async fn test_completion_reindexes_even_when_dispatch_fails() {
        let f = fixture();
        f.service
            .instantiate_workflow(OBJECT, ACCESSION_WORKFLOW, 1, None)
            .await
            .unwrap();
        f.queue.fail_queue("accessionWF_default").await;

        let err = f
            .service
            .update_status(StatusUpdate::completed(accession_step("start-accession")))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Resolve(ResolveError::Dispatch(_))));
        let start = f.store.find(&accession_step("start-accession")).await.unwrap();
        assert_eq!(start.status, StepStatus::Completed);

        f.service.notifier().flush().await;
        assert_eq!(f.indexer.reindexed().await, vec![OBJECT.to_string()]);
    }

    #[tokio::test]
    async fn test_start_workflow_keeps_rows_on_dispatch_failure() {
        let f = fixture();
        f.queue.fail_queue("accessionWF_default").await;

        let instantiation = f
            .service
            .start_workflow(OBJECT, ACCESSION_WORKFLOW, 1, None)
            .await
            .unwrap();
        assert!(instantiation.created > 0);
        let stranded: Vec<StepKey> = instantiation
            .resolution
            .dispatch_error
            .as_ref()
            .map(|e| e.stranded_steps().into_iter().cloned().collect())
            .unwrap_or_default();
        assert_eq!(stranded, vec![accession_step("start-accession")]);

        let again = f
            .service
            .instantiate_workflow(OBJECT, ACCESSION_WORKFLOW, 1, None)
            .await
            .unwrap();
        assert_eq!(again.created, 0);
    }

    #[tokio::test]
    async fn test_unknown_step_is_not_found() {
        let f = fixture();
        let err = f
            .service
            .update_status(StatusUpdate::completed(StepKey::new(OBJECT, "assemblyWF", 1, "jp2-create")))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_optimistic_conflict() {
        let f = fixture();
        f.service
            .instantiate_workflow(OBJECT, ACCESSION_WORKFLOW, 1, None)
            .await
            .unwrap();

        let err = f
            .service
            .update_status(
                StatusUpdate::new(accession_step("start-accession"), StepStatus::Started)
                    .expecting(StepStatus::Waiting),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Store(StoreError::Conflict {
                actual: StepStatus::Queued,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_error_then_restart_bookkeeping() {
        let f = fixture();
        f.service
            .instantiate_workflow(OBJECT, ACCESSION_WORKFLOW, 1, None)
            .await
            .unwrap();
        let key = accession_step("start-accession");

        f.service
            .update_status(StatusUpdate::new(key.clone(), StepStatus::Started))
            .await
            .unwrap();
        let errored = f
            .service
            .update_error(&key, "disk full", Some("No space left on device"))
            .await
            .unwrap();
        assert_eq!(errored.status, StepStatus::Error);
        assert_eq!(errored.attempts, 1);

        let restarted = f
            .service
            .update_status(StatusUpdate::new(key.clone(), StepStatus::Started))
            .await
            .unwrap()
            .step;
        assert_eq!(restarted.attempts, 2);
        assert!(restarted.error_message.is_none());
        assert!(restarted.error_text.is_none());
    }

    #[tokio::test]
    async fn test_redispatch_only_for_queued_steps() {
        let f = fixture();
        f.service
            .instantiate_workflow(OBJECT, ACCESSION_WORKFLOW, 1, None)
            .await
            .unwrap();

        let job = f
            .service
            .redispatch(&accession_step("start-accession"))
            .await
            .unwrap();
        assert_eq!(job.job.process, "start-accession");
        assert_eq!(f.queue.jobs().await.len(), 2);

        let err = f.service.redispatch(&accession_step("stage")).await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Store(StoreError::Conflict {
                actual: StepStatus::Waiting,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_completed_accession_terminal_is_immutable() {
        let f = fixture();
        f.service
            .instantiate_workflow(OBJECT, ACCESSION_WORKFLOW, 1, None)
            .await
            .unwrap();
        let terminal = accession_step("end-accession");
        f.store
            .update_status(&StatusUpdate::completed(terminal.clone()))
            .await
            .unwrap();

        let err = f
            .service
            .update_status(StatusUpdate::new(terminal.clone(), StepStatus::Waiting))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::AccessionedImmutable(_)));

        let err = f
            .service
            .update_error(&terminal, "late failure", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::AccessionedImmutable(_)));
    }

    #[tokio::test]
    async fn test_lifecycle_milestones_in_completion_order() {
        let f = fixture();
        f.service
            .instantiate_workflow(OBJECT, ACCESSION_WORKFLOW, 1, None)
            .await
            .unwrap();
        f.service
            .update_status(
                StatusUpdate::completed(accession_step("start-accession")).lifecycle("submitted"),
            )
            .await
            .unwrap();
        f.service
            .update_status(StatusUpdate::completed(accession_step("stage")))
            .await
            .unwrap();

        let milestones = f.service.lifecycle_milestones(OBJECT).await.unwrap();
        assert_eq!(milestones.len(), 1);
        assert_eq!(milestones[0].lifecycle, "submitted");
        assert_eq!(milestones[0].version, 1);
    }
}

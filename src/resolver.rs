//! Next-Step Resolver.
//!
//! After a step completes, the resolver works out which processes of that
//! workflow instance have become runnable, claims their rows in one atomic
//! store operation and dispatches whatever it actually claimed. Dispatch only
//! happens after the claim has returned, so an executor picking up a job
//! always sees its step as `queued`.
//!
//! Side effects beyond dispatch are returned as [`ResolverEvent`]s for the
//! notifier to deliver.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, Instrument};

use crate::dispatch::{DispatchedJob, StepDispatcher};
use crate::error::{DispatchError, ResolveError};
use crate::steps::{StepStore, VersionKey, WorkflowStep};
use crate::telemetry::{create_step_span, generate_correlation_id};
use crate::workflows::{DefinitionCache, WorkflowDefinition, ACCESSION_WORKFLOW};

/// Processes that may run once everything in `done` has finished: not done
/// themselves, every prerequisite done, and not excluded from queueing.
/// Returned in definition order.
pub fn ready_set(definition: &WorkflowDefinition, done: &HashSet<String>) -> Vec<String> {
    definition
        .processes()
        .iter()
        .filter(|p| !done.contains(&p.name))
        .filter(|p| !p.skip_queue)
        .filter(|p| p.prerequisites.iter().all(|pre| done.contains(pre)))
        .map(|p| p.name.clone())
        .collect()
}

/// Names of the steps that no longer need to run.
pub fn done_names(steps: &[WorkflowStep]) -> HashSet<String> {
    steps
        .iter()
        .filter(|s| s.status.is_done())
        .map(|s| s.key.process.clone())
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResolverEvent {
    /// The accessioning terminal step finished; the index must learn about it.
    StepUpdated(WorkflowStep),
    /// The object's index entry is stale.
    Reindex { object_id: String },
}

/// Outcome of one resolution pass.
#[derive(Debug, Default)]
pub struct Resolution {
    /// Rows this pass moved from `waiting` to `queued`.
    pub claimed: Vec<WorkflowStep>,
    pub dispatched: Vec<DispatchedJob>,
    pub events: Vec<ResolverEvent>,
    /// Claimed steps that could not be enqueued. Events are still produced
    /// when this is set.
    pub dispatch_error: Option<DispatchError>,
}

impl Resolution {
    pub fn claimed_processes(&self) -> Vec<&str> {
        self.claimed.iter().map(|s| s.process()).collect()
    }

    /// Fail with the dispatch error, if any. Take `events` first; they are
    /// dropped along with the resolution on failure.
    pub fn into_result(mut self) -> Result<Resolution, ResolveError> {
        match self.dispatch_error.take() {
            Some(e) => Err(ResolveError::Dispatch(e)),
            None => Ok(self),
        }
    }
}

#[derive(Clone)]
pub struct NextStepResolver {
    store: Arc<dyn StepStore>,
    definitions: DefinitionCache,
    dispatcher: Arc<StepDispatcher>,
}

impl NextStepResolver {
    pub fn new(
        store: Arc<dyn StepStore>,
        definitions: DefinitionCache,
        dispatcher: Arc<StepDispatcher>,
    ) -> Self {
        Self {
            store,
            definitions,
            dispatcher,
        }
    }

    pub fn dispatcher(&self) -> &StepDispatcher {
        &self.dispatcher
    }

    /// React to `completed` having just moved to `completed`. The reindex
    /// event is produced even when dispatch fails.
    pub async fn on_completed(&self, completed: &WorkflowStep) -> Result<Resolution, ResolveError> {
        let version = completed.key.version_key();
        let span = create_step_span(
            "resolve_next_steps",
            &version,
            Some(completed.process()),
            &generate_correlation_id(),
        );

        async {
            let definition = self.definitions.load(&version.workflow).await?;
            let mut resolution = self.claim_and_dispatch(&version, &definition).await?;

            if version.workflow == ACCESSION_WORKFLOW && definition.is_terminal(completed.process()) {
                info!("Accessioning terminal step completed");
                resolution
                    .events
                    .push(ResolverEvent::StepUpdated(completed.clone()));
            }
            resolution.events.push(ResolverEvent::Reindex {
                object_id: version.object_id.clone(),
            });
            Ok::<_, ResolveError>(resolution)
        }
        .instrument(span)
        .await
    }

    /// Claim and dispatch whatever is runnable in a workflow instance without
    /// a triggering completion. Used right after instantiation.
    pub async fn advance(&self, version: &VersionKey) -> Result<Resolution, ResolveError> {
        let span = create_step_span("advance", version, None, &generate_correlation_id());
        async {
            let definition = self.definitions.load(&version.workflow).await?;
            self.claim_and_dispatch(version, &definition).await
        }
        .instrument(span)
        .await
    }

    async fn claim_and_dispatch(
        &self,
        version: &VersionKey,
        definition: &WorkflowDefinition,
    ) -> Result<Resolution, ResolveError> {
        let steps = self.store.steps_for(version).await?;
        let ready = ready_set(definition, &done_names(&steps));
        if ready.is_empty() {
            debug!("No processes ready");
            return Ok(Resolution::default());
        }

        let claimed = self.store.claim_waiting(version, &ready).await?;
        debug!(
            ready = ready.len(),
            claimed = claimed.len(),
            "Claimed ready steps"
        );

        match self.dispatcher.dispatch_all(&claimed).await {
            Ok(dispatched) => Ok(Resolution {
                claimed,
                dispatched,
                ..Resolution::default()
            }),
            Err((dispatched, e)) => {
                error!(
                    dispatched = dispatched.len(),
                    stranded = e.stranded_steps().len(),
                    "Claimed steps left queued without a job"
                );
                Ok(Resolution {
                    claimed,
                    dispatched,
                    events: Vec::new(),
                    dispatch_error: Some(flatten(e)),
                })
            }
        }
    }
}

fn flatten(error: DispatchError) -> DispatchError {
    match error {
        DispatchError::Partial { mut failures } if failures.len() == 1 => failures.remove(0),
        other => other,
    }
}

impl std::fmt::Debug for NextStepResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NextStepResolver")
            .field("definitions", &self.definitions)
            .finish()
    }
}

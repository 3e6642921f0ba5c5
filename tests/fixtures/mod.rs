// Shared harness: the full scheduler stack wired to in-process collaborators.
#![allow(dead_code)]

use std::sync::Arc;

use accession_flow::collaborators::{InMemoryObjectStore, InMemoryPreservation, RecordingIndexer};
use accession_flow::config::{DispatchConfig, NotificationConfig};
use accession_flow::dispatch::{InMemoryWorkQueue, RoutingTable, StepDispatcher};
use accession_flow::lifecycle::VersionLifecycleController;
use accession_flow::notify::Notifier;
use accession_flow::service::WorkflowService;
use accession_flow::steps::{
    InMemoryStepStore, StatusUpdate, StepStatus, StepStore, VersionKey,
};
use accession_flow::workflows::{DefinitionCache, WorkflowDefinition, ACCESSION_WORKFLOW};

pub const OBJECT: &str = "druid:bc123df4567";

pub struct Stack {
    pub store: Arc<InMemoryStepStore>,
    pub queue: Arc<InMemoryWorkQueue>,
    pub indexer: Arc<RecordingIndexer>,
    pub objects: Arc<InMemoryObjectStore>,
    pub preservation: Arc<InMemoryPreservation>,
    pub service: Arc<WorkflowService>,
    pub controller: Arc<VersionLifecycleController>,
}

impl Stack {
    pub fn new() -> Self {
        Self::with_definitions(DefinitionCache::builtin())
    }

    pub fn with_workflows(definitions: Vec<WorkflowDefinition>) -> Self {
        Self::with_definitions(DefinitionCache::with_definitions(definitions))
    }

    fn with_definitions(definitions: DefinitionCache) -> Self {
        let store = Arc::new(InMemoryStepStore::new());
        let queue = Arc::new(InMemoryWorkQueue::new());
        let indexer = Arc::new(RecordingIndexer::new());
        let objects = Arc::new(InMemoryObjectStore::new());
        let preservation = Arc::new(InMemoryPreservation::new());

        let dispatch = DispatchConfig::default();
        let routes = RoutingTable::from_config(&dispatch).expect("default routes are valid");
        let notifier = Notifier::new(
            indexer.clone(),
            &NotificationConfig {
                terminal_step_delay_ms: 0,
                reindex_delay_ms: 0,
            },
        );
        let service = Arc::new(
            WorkflowService::new(
                store.clone(),
                definitions,
                Arc::new(StepDispatcher::new(routes, queue.clone())),
                Arc::new(notifier),
            )
            .with_default_lane(dispatch.default_lane),
        );
        let controller = Arc::new(VersionLifecycleController::new(
            service.clone(),
            objects.clone(),
            preservation.clone(),
        ));

        Self {
            store,
            queue,
            indexer,
            objects,
            preservation,
            service,
            controller,
        }
    }

    /// Register an object at version 1 and accession it, leaving preservation
    /// in step with the object.
    pub async fn register_accessioned(&self, object_id: &str) {
        self.objects.register(object_id).await;
        self.service
            .instantiate_workflow(object_id, ACCESSION_WORKFLOW, 1, None)
            .await
            .unwrap();
        self.finish_accessioning(object_id, 1).await;
    }

    /// Play the executor for an accessioning workflow that already exists:
    /// complete every process in definition order.
    pub async fn finish_accessioning(&self, object_id: &str, version: u32) {
        let definition = self.service.definitions().load(ACCESSION_WORKFLOW).await.unwrap();
        let key = VersionKey::new(object_id, ACCESSION_WORKFLOW, version);
        for process in definition.processes() {
            let step = self.store.find(&key.step(process.name.as_str())).await.unwrap();
            if step.status != StepStatus::Completed {
                self.service
                    .update_status(StatusUpdate::completed(step.key))
                    .await
                    .unwrap();
            }
        }
        self.preservation.set_version(object_id, version).await;
    }
}

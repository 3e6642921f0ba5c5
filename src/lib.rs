// Accession Flow Library - workflow step scheduling and object version lifecycle
// This exposes the core components for embedding and integration testing

pub mod collaborators;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod lifecycle;
pub mod monitor;
pub mod notify;
pub mod resolver;
pub mod service;
pub mod steps;
pub mod telemetry;
pub mod workflows;

// Re-export key types for easy access
pub use collaborators::{
    IndexingService, InMemoryObjectStore, InMemoryPreservation, ObjectStore, PreservationService,
    RecordingIndexer, VersionEvent, VersionMetadata,
};
pub use config::{config, init_config, AccessionFlowConfig};
pub use dispatch::{
    DispatchedJob, InMemoryWorkQueue, Job, QueueAddress, RoutingTable, StepDispatcher, WorkQueue,
};
pub use error::{
    CollaboratorError, DefinitionError, DispatchError, LifecycleError, PreconditionFailure,
    ResolveError, ServiceError, StoreError,
};
pub use lifecycle::{
    CloseOptions, OpenOptions, VersionLifecycleController, VersionPhase, VersionState,
};
pub use monitor::{AlertSink, StuckStepMonitor, StuckStepReport, StuckThresholds, TracingAlertSink};
pub use notify::Notifier;
pub use resolver::{ready_set, NextStepResolver, Resolution, ResolverEvent};
pub use service::{Instantiation, StepOutcome, WorkflowService};
pub use steps::{
    InMemoryStepStore, Milestone, StatusUpdate, StepKey, StepStatus, StepStore, VersionKey,
    WorkflowStep,
};
#[cfg(feature = "database")]
pub use steps::SqliteStepStore;
pub use telemetry::{generate_correlation_id, init_telemetry, shutdown_telemetry};
pub use workflows::{DefinitionCache, ProcessSpec, WorkflowDefinition};

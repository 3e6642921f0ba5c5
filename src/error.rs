// Error taxonomy for the scheduler and the version lifecycle.
// Permanent failures (not found, preconditions) are kept apart from
// transient ones (dispatch) so callers can decide whether a retry is safe.

use thiserror::Error;

use crate::steps::{StepKey, StepStatus};

#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("no workflow definition named '{name}'")]
    NotFound { name: String },

    #[error("failed to parse workflow definition '{name}': {source}")]
    Parse {
        name: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to read workflow definition '{name}': {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("workflow '{workflow}' declares process '{process}' more than once")]
    DuplicateProcess { workflow: String, process: String },

    #[error("process '{process}' in workflow '{workflow}' depends on unknown process '{prerequisite}'")]
    UnknownPrerequisite {
        workflow: String,
        process: String,
        prerequisite: String,
    },

    #[error("workflow '{workflow}' contains a prerequisite cycle: {}", cycle.join(" -> "))]
    Cycle { workflow: String, cycle: Vec<String> },

    #[error("definition file for '{requested}' declares workflow '{declared}'")]
    NameMismatch { requested: String, declared: String },

    #[error("workflow '{workflow}' names terminal process '{process}' which it does not declare")]
    UnknownTerminal { workflow: String, process: String },

    #[error("workflow '{workflow}' declares no processes")]
    Empty { workflow: String },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("workflow step not found: {0}")]
    NotFound(StepKey),

    #[error("status conflict on {key}: expected {expected}, found {actual}")]
    Conflict {
        key: StepKey,
        expected: StepStatus,
        actual: StepStatus,
    },

    #[error("stored step row is corrupt: {0}")]
    Corrupt(String),

    #[cfg(feature = "database")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[cfg(feature = "database")]
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("failed to enqueue {key} on queue '{queue}': {reason}")]
    Enqueue {
        key: StepKey,
        queue: String,
        reason: String,
    },

    #[error("failed to encode job payload for {key}: {source}")]
    Payload {
        key: StepKey,
        #[source]
        source: serde_json::Error,
    },

    #[error("{} claimed step(s) could not be enqueued: {}", failures.len(), summarize(failures))]
    Partial { failures: Vec<DispatchError> },
}

impl DispatchError {
    /// Steps that were claimed but have no job behind them.
    pub fn stranded_steps(&self) -> Vec<&StepKey> {
        match self {
            DispatchError::Enqueue { key, .. } | DispatchError::Payload { key, .. } => vec![key],
            DispatchError::Partial { failures } => {
                failures.iter().flat_map(|f| f.stranded_steps()).collect()
            }
        }
    }
}

fn summarize(failures: &[DispatchError]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// Why a `close` (or `open`) request was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PreconditionFailure {
    #[error("version {version} has no description")]
    MissingDescription { version: u32 },

    #[error("version {version} has no significance")]
    MissingSignificance { version: u32 },

    #[error("version {version} is not open")]
    NotOpen { version: u32 },

    #[error("version {version} is currently being accessioned")]
    AccessioningInProgress { version: u32 },

    #[error("assembly of version {version} has unfinished steps")]
    AssemblyIncomplete { version: u32 },

    #[error("accessioning workflow already exists for version {version}")]
    AccessioningAlreadyExists { version: u32 },

    #[error("preservation holds version {preserved} but the object is at version {current}")]
    PreservationVersionMismatch { preserved: u32, current: u32 },
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("object {object_id} already has an open version ({version})")]
    AlreadyOpen { object_id: String, version: u32 },

    #[error("object {object_id} has not been accessioned")]
    NotAccessioned { object_id: String },

    #[error("cannot change version of {object_id}: {failure}")]
    Precondition {
        object_id: String,
        failure: PreconditionFailure,
    },

    /// The version change took effect, but steps it made runnable have no
    /// job behind them. Re-dispatch the stranded steps; do not repeat the call.
    #[error("version {version} of {object_id} changed but its ready steps were not enqueued: {source}")]
    StrandedDispatch {
        object_id: String,
        version: u32,
        #[source]
        source: DispatchError,
    },

    #[error("collaborator call failed: {0}")]
    Collaborator(#[from] CollaboratorError),

    #[error(transparent)]
    Service(#[from] ServiceError),
}

impl LifecycleError {
    pub(crate) fn precondition(object_id: &str, failure: PreconditionFailure) -> Self {
        LifecycleError::Precondition {
            object_id: object_id.to_string(),
            failure,
        }
    }
}

/// Failure reported by an external collaborator (object store, preservation,
/// indexing, alerting).
#[derive(Debug, Clone, Error)]
pub enum CollaboratorError {
    #[error("{service}: object {object_id} not found")]
    ObjectNotFound { service: String, object_id: String },

    #[error("{service} unavailable: {reason}")]
    Unavailable { service: String, reason: String },
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("{0} belongs to an accessioned version and can no longer change")]
    AccessionedImmutable(StepKey),
}

impl ServiceError {
    /// True when the step (or workflow instance) simply does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            ServiceError::Store(e) => e.is_not_found(),
            ServiceError::Resolve(ResolveError::Store(e)) => e.is_not_found(),
            _ => false,
        }
    }
}

// Step Store: the persisted scheduling state of every workflow step.

pub mod memory;
#[cfg(feature = "database")]
pub mod sqlite;
pub mod store;
pub mod types;

pub use memory::InMemoryStepStore;
#[cfg(feature = "database")]
pub use sqlite::SqliteStepStore;
pub use store::StepStore;
pub use types::{
    Milestone, StatusUpdate, StepKey, StepStatus, VersionKey, WorkflowStep, DEFAULT_LANE,
};

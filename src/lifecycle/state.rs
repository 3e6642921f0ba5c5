use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::DefinitionError;
use crate::steps::{StepStatus, WorkflowStep};
use crate::workflows::{
    DefinitionCache, ACCESSION_WORKFLOW, ASSEMBLY_WORKFLOW, VERSIONING_WORKFLOW,
};

/// Where an object version stands. Never stored; always derived from steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionPhase {
    Open,
    Accessioning,
    Accessioned,
    Unaccessioned,
}

impl fmt::Display for VersionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VersionPhase::Open => "open",
            VersionPhase::Accessioning => "accessioning",
            VersionPhase::Accessioned => "accessioned",
            VersionPhase::Unaccessioned => "unaccessioned",
        };
        f.write_str(name)
    }
}

/// Terminal processes of the workflows that carry lifecycle meaning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleTerminals {
    pub versioning: String,
    pub accessioning: String,
}

impl LifecycleTerminals {
    pub async fn load(definitions: &DefinitionCache) -> Result<Self, DefinitionError> {
        let versioning = definitions.load(VERSIONING_WORKFLOW).await?;
        let accessioning = definitions.load(ACCESSION_WORKFLOW).await?;
        Ok(Self {
            versioning: versioning.terminal_process().to_string(),
            accessioning: accessioning.terminal_process().to_string(),
        })
    }
}

/// Milestone flags of one object version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionState {
    pub version: u32,
    /// A versioning workflow exists and has not been submitted.
    pub open: bool,
    /// The versioning workflow's terminal step is done.
    pub submitted: bool,
    /// An accessioning workflow exists and its terminal step is not complete.
    pub accessioning: bool,
    /// The accessioning terminal step is complete.
    pub accessioned: bool,
    /// An assembly workflow has steps that are not done.
    pub assembling: bool,
}

impl VersionState {
    /// Derive the state of `version` from the object's steps. Steps of other
    /// versions are ignored.
    pub fn derive(version: u32, steps: &[WorkflowStep], terminals: &LifecycleTerminals) -> Self {
        let versioning_started = steps_of(steps, version, VERSIONING_WORKFLOW).next().is_some();
        let submitted = steps_of(steps, version, VERSIONING_WORKFLOW)
            .any(|s| s.key.process == terminals.versioning && s.status.is_done());

        let accession_started = steps_of(steps, version, ACCESSION_WORKFLOW).next().is_some();
        let accessioned = steps_of(steps, version, ACCESSION_WORKFLOW)
            .any(|s| s.key.process == terminals.accessioning && s.status == StepStatus::Completed);

        Self {
            version,
            open: versioning_started && !submitted,
            submitted,
            accessioning: accession_started && !accessioned,
            accessioned,
            assembling: steps_of(steps, version, ASSEMBLY_WORKFLOW).any(|s| !s.status.is_done()),
        }
    }

    pub fn phase(&self) -> VersionPhase {
        if self.accessioned {
            VersionPhase::Accessioned
        } else if self.accessioning {
            VersionPhase::Accessioning
        } else if self.open {
            VersionPhase::Open
        } else {
            VersionPhase::Unaccessioned
        }
    }

    /// True once any accessioning workflow exists for this version.
    pub fn accession_started(&self) -> bool {
        self.accessioning || self.accessioned
    }

    /// Submitted but never handed to accessioning: a close that stopped
    /// halfway.
    pub fn close_interrupted(&self) -> bool {
        self.submitted && !self.accession_started()
    }
}

fn steps_of<'a>(
    steps: &'a [WorkflowStep],
    version: u32,
    workflow: &'a str,
) -> impl Iterator<Item = &'a WorkflowStep> + 'a {
    steps
        .iter()
        .filter(move |s| s.key.version == version && s.key.workflow == workflow)
}

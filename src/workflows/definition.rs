//! Declarative workflow definitions.
//!
//! A definition is a named, ordered list of processes, each naming the
//! processes that must be complete before it may run. Definitions are written
//! in TOML:
//!
//! ```toml
//! name = "versioningWF"
//! terminal = "submit-version"
//!
//! [[process]]
//! name = "start-version"
//! label = "Open a new object version"
//! pre_satisfied = true
//!
//! [[process]]
//! name = "submit-version"
//! prerequisites = ["start-version"]
//! skip_queue = true
//! ```
//!
//! Every definition is validated when it is parsed: duplicate names, unknown
//! prerequisites and prerequisite cycles are rejected, so the resolver never
//! has to deal with a graph that can stall or loop.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};

use crate::error::DefinitionError;
use crate::steps::{StepKey, StepStatus, WorkflowStep, DEFAULT_LANE};

/// Static definition of one process in a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub name: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub prerequisites: BTreeSet<String>,
    /// Never dispatched automatically; something outside the scheduler
    /// completes it.
    #[serde(default)]
    pub skip_queue: bool,
    #[serde(default)]
    pub lifecycle: Option<String>,
    /// Starts out `completed` when the workflow is instantiated.
    #[serde(default)]
    pub pre_satisfied: bool,
}

impl ProcessSpec {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            label: name.clone(),
            name,
            prerequisites: BTreeSet::new(),
            skip_queue: false,
            lifecycle: None,
            pre_satisfied: false,
        }
    }

    pub fn after<I, S>(mut self, prerequisites: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prerequisites
            .extend(prerequisites.into_iter().map(Into::into));
        self
    }

    pub fn skip_queue(mut self) -> Self {
        self.skip_queue = true;
        self
    }

    pub fn pre_satisfied(mut self) -> Self {
        self.pre_satisfied = true;
        self
    }

    pub fn lifecycle(mut self, lifecycle: impl Into<String>) -> Self {
        self.lifecycle = Some(lifecycle.into());
        self
    }
}

#[derive(Debug, Deserialize)]
struct RawDefinition {
    name: String,
    #[serde(default)]
    terminal: Option<String>,
    #[serde(default, rename = "process")]
    processes: Vec<ProcessSpec>,
}

/// A validated, acyclic workflow definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkflowDefinition {
    name: String,
    terminal: Option<String>,
    processes: Vec<ProcessSpec>,
}

impl WorkflowDefinition {
    /// Build and validate a definition from parts.
    pub fn new(
        name: impl Into<String>,
        processes: Vec<ProcessSpec>,
        terminal: Option<String>,
    ) -> Result<Self, DefinitionError> {
        let definition = Self {
            name: name.into(),
            terminal,
            processes,
        };
        definition.validate()?;
        Ok(definition)
    }

    /// Parse the TOML text of the definition registered as `requested`.
    pub fn parse(requested: &str, text: &str) -> Result<Self, DefinitionError> {
        let raw: RawDefinition = toml::from_str(text).map_err(|source| DefinitionError::Parse {
            name: requested.to_string(),
            source,
        })?;

        if raw.name != requested {
            return Err(DefinitionError::NameMismatch {
                requested: requested.to_string(),
                declared: raw.name,
            });
        }

        Self::new(raw.name, raw.processes, raw.terminal)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn processes(&self) -> &[ProcessSpec] {
        &self.processes
    }

    pub fn process(&self, name: &str) -> Option<&ProcessSpec> {
        self.processes.iter().find(|p| p.name == name)
    }

    /// The process whose completion finishes the workflow: the declared
    /// terminal process, or the last one listed.
    pub fn terminal_process(&self) -> &str {
        match &self.terminal {
            Some(terminal) => terminal,
            None => self
                .processes
                .last()
                .map(|p| p.name.as_str())
                .unwrap_or_default(),
        }
    }

    pub fn is_terminal(&self, process: &str) -> bool {
        self.terminal_process() == process
    }

    /// The concrete steps of this workflow for one object version.
    ///
    /// Pre-satisfied processes start `completed`, everything else `waiting`.
    /// `lane` applies to every step; `None` means the default lane.
    pub fn initial_steps(
        &self,
        object_id: &str,
        version: u32,
        lane: Option<&str>,
        now: DateTime<Utc>,
    ) -> Vec<WorkflowStep> {
        let lane = lane.unwrap_or(DEFAULT_LANE);
        self.processes
            .iter()
            .map(|process| {
                let status = if process.pre_satisfied {
                    StepStatus::Completed
                } else {
                    StepStatus::Waiting
                };
                let mut step = WorkflowStep::new(
                    StepKey::new(object_id, self.name.as_str(), version, process.name.as_str()),
                    status,
                    lane,
                    now,
                );
                step.lifecycle = process.lifecycle.clone();
                step
            })
            .collect()
    }

    fn validate(&self) -> Result<(), DefinitionError> {
        if self.processes.is_empty() {
            return Err(DefinitionError::Empty {
                workflow: self.name.clone(),
            });
        }

        let mut seen = HashSet::new();
        for process in &self.processes {
            if !seen.insert(process.name.as_str()) {
                return Err(DefinitionError::DuplicateProcess {
                    workflow: self.name.clone(),
                    process: process.name.clone(),
                });
            }
        }

        for process in &self.processes {
            if let Some(missing) = process
                .prerequisites
                .iter()
                .find(|p| !seen.contains(p.as_str()))
            {
                return Err(DefinitionError::UnknownPrerequisite {
                    workflow: self.name.clone(),
                    process: process.name.clone(),
                    prerequisite: missing.clone(),
                });
            }
        }

        if let Some(terminal) = &self.terminal {
            if !seen.contains(terminal.as_str()) {
                return Err(DefinitionError::UnknownTerminal {
                    workflow: self.name.clone(),
                    process: terminal.clone(),
                });
            }
        }

        if let Some(cycle) = self.find_cycle() {
            return Err(DefinitionError::Cycle {
                workflow: self.name.clone(),
                cycle,
            });
        }

        Ok(())
    }

    /// Depth-first search over prerequisite edges; returns the first cycle
    /// found, closed on its starting process.
    fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit<'a>(
            name: &'a str,
            edges: &HashMap<&'a str, &'a BTreeSet<String>>,
            marks: &mut HashMap<&'a str, Mark>,
            path: &mut Vec<&'a str>,
        ) -> Option<Vec<String>> {
            match marks.get(name) {
                Some(Mark::Done) => return None,
                Some(Mark::Visiting) => {
                    let start = path.iter().position(|p| *p == name).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        path[start..].iter().map(|p| p.to_string()).collect();
                    cycle.push(name.to_string());
                    return Some(cycle);
                }
                None => {}
            }

            marks.insert(name, Mark::Visiting);
            path.push(name);
            if let Some(&prerequisites) = edges.get(name) {
                for prerequisite in prerequisites.iter() {
                    if let Some(cycle) = visit(prerequisite.as_str(), edges, marks, path) {
                        return Some(cycle);
                    }
                }
            }
            path.pop();
            marks.insert(name, Mark::Done);
            None
        }

        let edges: HashMap<&str, &BTreeSet<String>> = self
            .processes
            .iter()
            .map(|p| (p.name.as_str(), &p.prerequisites))
            .collect();
        let mut marks = HashMap::new();
        let mut path = Vec::new();

        self.processes
            .iter()
            .find_map(|p| visit(p.name.as_str(), &edges, &mut marks, &mut path))
    }
}

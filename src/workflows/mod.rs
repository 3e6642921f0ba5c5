// Process Graph Loader: declarative workflow definitions and their cache.

pub mod definition;
pub mod loader;
pub mod names;

pub use definition::{ProcessSpec, WorkflowDefinition};
pub use loader::{
    BuiltinDefinitions, DefinitionCache, DefinitionSource, DirectoryDefinitions,
    InlineDefinitions,
};
pub use names::{ACCESSION_WORKFLOW, ASSEMBLY_WORKFLOW, VERSIONING_WORKFLOW};

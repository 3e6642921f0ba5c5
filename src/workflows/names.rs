// Workflows with lifecycle meaning. Their terminal processes come from the
// definitions themselves.

pub const ACCESSION_WORKFLOW: &str = "accessionWF";
pub const VERSIONING_WORKFLOW: &str = "versioningWF";
pub const ASSEMBLY_WORKFLOW: &str = "assemblyWF";

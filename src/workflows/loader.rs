use async_trait::async_trait;
use moka::future::Cache;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use super::definition::WorkflowDefinition;
use crate::error::DefinitionError;

const BUILTIN: &[(&str, &str)] = &[
    ("accessionWF", include_str!("../../definitions/accessionWF.toml")),
    ("assemblyWF", include_str!("../../definitions/assemblyWF.toml")),
    ("versioningWF", include_str!("../../definitions/versioningWF.toml")),
];

/// Where workflow definitions come from.
#[async_trait]
pub trait DefinitionSource: Send + Sync {
    async fn fetch(&self, name: &str) -> Result<WorkflowDefinition, DefinitionError>;

    /// Every workflow name this source can provide.
    async fn names(&self) -> Result<Vec<String>, DefinitionError>;
}

/// The definitions compiled into the binary.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinDefinitions;

#[async_trait]
impl DefinitionSource for BuiltinDefinitions {
    async fn fetch(&self, name: &str) -> Result<WorkflowDefinition, DefinitionError> {
        let (_, text) = BUILTIN
            .iter()
            .find(|(builtin, _)| *builtin == name)
            .ok_or_else(|| DefinitionError::NotFound {
                name: name.to_string(),
            })?;
        WorkflowDefinition::parse(name, text)
    }

    async fn names(&self) -> Result<Vec<String>, DefinitionError> {
        Ok(BUILTIN.iter().map(|(name, _)| name.to_string()).collect())
    }
}

/// Definitions read from `<directory>/<workflowName>.toml`.
#[derive(Debug, Clone)]
pub struct DirectoryDefinitions {
    directory: PathBuf,
}

impl DirectoryDefinitions {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

#[async_trait]
impl DefinitionSource for DirectoryDefinitions {
    async fn fetch(&self, name: &str) -> Result<WorkflowDefinition, DefinitionError> {
        let not_found = || DefinitionError::NotFound {
            name: name.to_string(),
        };
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(not_found());
        }

        let path = self.directory.join(format!("{name}.toml"));
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(not_found()),
            Err(source) => {
                return Err(DefinitionError::Io {
                    name: name.to_string(),
                    source,
                })
            }
        };

        debug!(workflow = name, path = %path.display(), "Read workflow definition");
        WorkflowDefinition::parse(name, &text)
    }

    async fn names(&self) -> Result<Vec<String>, DefinitionError> {
        let io_error = |source| DefinitionError::Io {
            name: self.directory.display().to_string(),
            source,
        };

        let mut entries = tokio::fs::read_dir(&self.directory).await.map_err(io_error)?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_error)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("toml") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Definitions supplied directly, mostly for embedding and tests.
#[derive(Debug, Default, Clone)]
pub struct InlineDefinitions {
    definitions: HashMap<String, WorkflowDefinition>,
}

impl InlineDefinitions {
    pub fn new(definitions: impl IntoIterator<Item = WorkflowDefinition>) -> Self {
        Self {
            definitions: definitions
                .into_iter()
                .map(|d| (d.name().to_string(), d))
                .collect(),
        }
    }
}

#[async_trait]
impl DefinitionSource for InlineDefinitions {
    async fn fetch(&self, name: &str) -> Result<WorkflowDefinition, DefinitionError> {
        self.definitions
            .get(name)
            .cloned()
            .ok_or_else(|| DefinitionError::NotFound {
                name: name.to_string(),
            })
    }

    async fn names(&self) -> Result<Vec<String>, DefinitionError> {
        let mut names: Vec<String> = self.definitions.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

/// Loads definitions once and keeps them for the life of the process.
///
/// Definitions never change while the service runs, so entries are never
/// invalidated. Two tasks racing on a cold entry may both parse it; the
/// result is identical either way.
#[derive(Clone)]
pub struct DefinitionCache {
    source: Arc<dyn DefinitionSource>,
    cache: Cache<String, Arc<WorkflowDefinition>>,
}

impl DefinitionCache {
    pub fn new(source: Arc<dyn DefinitionSource>) -> Self {
        Self {
            source,
            cache: Cache::builder().build(),
        }
    }

    pub fn builtin() -> Self {
        Self::new(Arc::new(BuiltinDefinitions))
    }

    /// Directory-backed when `directory` is set, built-in otherwise.
    pub fn from_directory(directory: Option<&Path>) -> Self {
        match directory {
            Some(dir) => Self::new(Arc::new(DirectoryDefinitions::new(dir))),
            None => Self::builtin(),
        }
    }

    pub fn with_definitions(definitions: impl IntoIterator<Item = WorkflowDefinition>) -> Self {
        Self::new(Arc::new(InlineDefinitions::new(definitions)))
    }

    pub async fn load(&self, name: &str) -> Result<Arc<WorkflowDefinition>, DefinitionError> {
        if let Some(definition) = self.cache.get(name).await {
            return Ok(definition);
        }

        let definition = Arc::new(self.source.fetch(name).await?);
        self.cache
            .insert(name.to_string(), Arc::clone(&definition))
            .await;
        debug!(workflow = name, "Cached workflow definition");
        Ok(definition)
    }

    /// Load every definition the source knows about, failing on the first
    /// invalid one. Returns the validated workflow names.
    pub async fn validate_all(&self) -> Result<Vec<String>, DefinitionError> {
        let names = self.source.names().await?;
        for name in &names {
            self.load(name).await?;
        }
        info!(count = names.len(), "Validated workflow definitions");
        Ok(names)
    }
}

impl std::fmt::Debug for DefinitionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefinitionCache")
            .field("cached", &self.cache.entry_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflows::names::{ACCESSION_WORKFLOW, VERSIONING_WORKFLOW};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_builtin_definitions_are_valid() {
        let cache = DefinitionCache::builtin();
        let names = cache.validate_all().await.unwrap();
        assert_eq!(names.len(), BUILTIN.len());

        let accession = cache.load(ACCESSION_WORKFLOW).await.unwrap();
        assert_eq!(accession.terminal_process(), "end-accession");
        let versioning = cache.load(VERSIONING_WORKFLOW).await.unwrap();
        assert_eq!(versioning.terminal_process(), "submit-version");
    }

    #[tokio::test]
    async fn test_load_is_cached() {
        let cache = DefinitionCache::builtin();
        let first = cache.load(ACCESSION_WORKFLOW).await.unwrap();
        let second = cache.load(ACCESSION_WORKFLOW).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_unknown_workflow_is_not_found() {
        let cache = DefinitionCache::builtin();
        let err = cache.load("noSuchWF").await.unwrap_err();
        assert!(matches!(err, DefinitionError::NotFound { name } if name == "noSuchWF"));
    }

    #[tokio::test]
    async fn test_directory_source() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("tinyWF.toml"),
            "name = \"tinyWF\"\n[[process]]\nname = \"only\"\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("README.md"), "not a definition").unwrap();

        let cache = DefinitionCache::from_directory(Some(dir.path()));
        assert_eq!(cache.validate_all().await.unwrap(), vec!["tinyWF".to_string()]);
        assert_eq!(cache.load("tinyWF").await.unwrap().terminal_process(), "only");
        assert!(matches!(
            cache.load("../tinyWF").await.unwrap_err(),
            DefinitionError::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn test_invalid_directory_definition_fails_validation() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("brokenWF.toml"),
            "name = \"brokenWF\"\n[[process]]\nname = \"a\"\nprerequisites = [\"missing\"]\n",
        )
        .unwrap();

        let cache = DefinitionCache::from_directory(Some(dir.path()));
        assert!(matches!(
            cache.validate_all().await.unwrap_err(),
            DefinitionError::UnknownPrerequisite { .. }
        ));
    }
}

use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::steps::DEFAULT_LANE;

/// Main configuration structure for the accession scheduler
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AccessionFlowConfig {
    /// Where workflow definitions come from
    pub definitions: DefinitionsConfig,
    /// Queue routing
    pub dispatch: DispatchConfig,
    /// Index notifications
    pub notifications: NotificationConfig,
    /// Stuck-step monitor
    pub monitor: MonitorConfig,
    /// Observability settings
    pub observability: ObservabilityConfig,
    /// Database settings (optional)
    pub database: Option<DatabaseConfig>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DefinitionsConfig {
    /// Directory of `<workflow>.toml` files; built-in definitions when unset
    pub directory: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DedicatedQueue {
    pub workflow: String,
    pub process: String,
    pub queue: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct FabricRoute {
    pub workflow: String,
    pub process: String,
    pub fabric: String,
    pub queue: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Lane used when a workflow is instantiated without one
    pub default_lane: String,
    /// Processes isolated on their own queue
    pub dedicated_queues: Vec<DedicatedQueue>,
    /// Processes executed by another fabric
    pub fabric_routes: Vec<FabricRoute>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_lane: DEFAULT_LANE.to_string(),
            dedicated_queues: vec![
                DedicatedQueue {
                    workflow: "accessionWF".to_string(),
                    process: "shelve".to_string(),
                    queue: "accessionWF_shelve".to_string(),
                },
                DedicatedQueue {
                    workflow: "accessionWF".to_string(),
                    process: "publish".to_string(),
                    queue: "accessionWF_publish".to_string(),
                },
            ],
            fabric_routes: vec![FabricRoute {
                workflow: "accessionWF".to_string(),
                process: "sdr-ingest-transfer".to_string(),
                fabric: "preservation".to_string(),
                queue: "preservation_ingest".to_string(),
            }],
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Pause before announcing the accessioning terminal step. Works around an
    /// ordering race in the index consumer; zero disables it.
    pub terminal_step_delay_ms: u64,
    /// Window in which reindex requests for the same object are coalesced
    pub reindex_delay_ms: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            terminal_step_delay_ms: 1000,
            reindex_delay_ms: 0,
        }
    }
}

impl NotificationConfig {
    pub fn terminal_step_delay(&self) -> Duration {
        Duration::from_millis(self.terminal_step_delay_ms)
    }

    pub fn reindex_delay(&self) -> Duration {
        Duration::from_millis(self.reindex_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Alert on steps queued longer than this
    pub queued_threshold_hours: u64,
    /// Alert on steps started longer than this
    pub started_threshold_hours: u64,
    /// Time between sweeps
    pub interval_seconds: u64,
    /// Maximum steps reported per status per sweep
    pub batch_size: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            queued_threshold_hours: 24,
            started_threshold_hours: 48,
            interval_seconds: 3600,
            batch_size: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level
    pub log_level: String,
    /// Emit JSON log lines
    pub json: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Database URL (SQLite file path or connection string)
    pub url: String,
    /// Maximum connections in pool
    pub max_connections: u32,
    /// Enable automatic migrations
    pub auto_migrate: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://accession-flow.db".to_string(),
            max_connections: 10,
            auto_migrate: true,
        }
    }
}

impl AccessionFlowConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration files (accession-flow.toml, .accession-flow-rc)
    /// 3. Environment variables (prefixed with ACCESSION_FLOW__)
    pub fn load() -> Result<Self> {
        let mut builder = Config::builder();

        if Path::new("accession-flow.toml").exists() {
            builder = builder.add_source(File::with_name("accession-flow"));
        }

        if Path::new(".accession-flow-rc").exists() {
            builder = builder
                .add_source(File::new(".accession-flow-rc", config::FileFormat::Toml));
        }

        builder = builder.add_source(Self::environment());

        let config = builder.build()?;
        Ok(config.try_deserialize()?)
    }

    /// Load from one explicit file, still honouring environment overrides.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::from(path.as_ref()))
            .add_source(Self::environment())
            .build()?;
        Ok(config.try_deserialize()?)
    }

    fn environment() -> Environment {
        Environment::with_prefix("ACCESSION_FLOW")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}

/// Global configuration instance, used by the binary only
static CONFIG: std::sync::LazyLock<Result<AccessionFlowConfig, anyhow::Error>> =
    std::sync::LazyLock::new(|| {
        let _ = AccessionFlowConfig::load_env_file();
        AccessionFlowConfig::load()
    });

/// Get the global configuration
pub fn config() -> Result<&'static AccessionFlowConfig> {
    CONFIG
        .as_ref()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))
}

/// Initialize configuration (call this early in main)
pub fn init_config() -> Result<()> {
    let _config = config()?;
    tracing::info!("Configuration loaded successfully");
    Ok(())
}

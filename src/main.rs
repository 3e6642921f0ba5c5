use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use accession_flow::config::{config, init_config, AccessionFlowConfig};
use accession_flow::telemetry::{init_telemetry, shutdown_telemetry};
use accession_flow::workflows::DefinitionCache;

#[derive(Parser)]
#[command(name = "accession-flow")]
#[command(about = "Operator tools for the accessioning workflow scheduler")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate every workflow definition
    Validate {
        /// Definition directory (overrides definitions.directory)
        #[arg(long, help = "Read <dir>/<workflow>.toml instead of the configured source")]
        dir: Option<PathBuf>,
    },
    /// Report steps stuck in queued or started
    Monitor {
        /// Sweep once and exit
        #[arg(long, help = "Run a single sweep instead of sweeping until interrupted")]
        once: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    init_config()?;
    let config = config()?;
    init_telemetry(&config.observability)?;

    let result = match cli.command {
        Commands::Validate { dir } => tokio::runtime::Runtime::new()?
            .block_on(async { validate_command(config, dir).await }),
        Commands::Monitor { once } => tokio::runtime::Runtime::new()?
            .block_on(async { monitor_command(config, once).await }),
    };

    shutdown_telemetry();
    result
}

async fn validate_command(config: &AccessionFlowConfig, dir: Option<PathBuf>) -> Result<()> {
    let directory = dir.or_else(|| config.definitions.directory.clone());
    let cache = DefinitionCache::from_directory(directory.as_deref());

    let names = cache
        .validate_all()
        .await
        .context("workflow definition validation failed")?;
    for name in &names {
        let definition = cache.load(name).await?;
        println!(
            "✅ {} ({} processes, terminal: {})",
            name,
            definition.processes().len(),
            definition.terminal_process()
        );
    }
    Ok(())
}

#[cfg(feature = "database")]
async fn monitor_command(config: &AccessionFlowConfig, once: bool) -> Result<()> {
    use accession_flow::monitor::{StuckStepMonitor, StuckThresholds, TracingAlertSink};
    use accession_flow::steps::SqliteStepStore;
    use std::sync::Arc;
    use std::time::Duration;

    let database = config
        .database
        .as_ref()
        .context("monitor needs a [database] section in the configuration")?;
    let store = Arc::new(
        SqliteStepStore::new(&database.url, database.max_connections, database.auto_migrate)
            .await
            .context("failed to open the step store")?,
    );
    let monitor = StuckStepMonitor::new(
        store.clone(),
        StuckThresholds::try_from(&config.monitor)?,
        Arc::new(TracingAlertSink),
    );

    if once {
        let report = monitor.sweep().await?;
        println!("{} stuck step(s)", report.total());
    } else {
        let shutdown = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            }
        };
        monitor
            .run(Duration::from_secs(config.monitor.interval_seconds), shutdown)
            .await;
    }

    store.shutdown().await;
    Ok(())
}

#[cfg(not(feature = "database"))]
async fn monitor_command(_config: &AccessionFlowConfig, _once: bool) -> Result<()> {
    anyhow::bail!("the monitor reads the SQLite step store; rebuild with --features database")
}

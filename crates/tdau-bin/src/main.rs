//! CLI entry point for the TDAU characterization bench.
//!
//! ```bash
//! # List serial ports to fill in the [[devices]] and [bath] addresses
//! tdau-bench ports
//!
//! # Measure, derive RS/Idea and create the project view
//! tdau-bench run --config bench.toml
//!
//! # Rehearse the same run against simulated boards and bath
//! tdau-bench run --config bench.toml --mock
//!
//! # Re-run the derivation or the view for an existing project
//! tdau-bench derive --project 3
//! tdau-bench view --project 3
//! ```

// Global allocator
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

mod tracing_init;

use anyhow::{bail, Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tdau_experiment::{
    derive_project, BenchConfig, DriverFactory, MockDriverFactory, RunEngine,
};
use tdau_hardware::drivers::mock::Chamber;
use tdau_hardware::port_resolver::available_ports;
use tdau_storage::{SqliteStore, TestStore};
use tokio::signal;
use tracing::{info, warn};
use tracing_init::TracingConfig;

const DEFAULT_DATABASE: &str = "sqlite://tdau_bench.db";

#[derive(Parser)]
#[command(name = "tdau-bench")]
#[command(about = "Thermal diode characterization bench", long_about = None)]
struct Cli {
    /// Override the configured log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List serial ports available for boards and the bath
    Ports {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Execute a characterization run
    Run {
        /// Bench configuration file (TOML)
        #[arg(long)]
        config: PathBuf,

        /// Use simulated boards and bath
        #[arg(long)]
        mock: bool,

        /// Stop after measuring; leave Ic/RS/Idea empty
        #[arg(long)]
        skip_derive: bool,
    },

    /// Compute Ic, RS and Idea for a measured project
    Derive {
        #[arg(long)]
        project: i64,

        #[arg(long, default_value = DEFAULT_DATABASE)]
        database: String,
    },

    /// Create the flat view for a project
    View {
        #[arg(long)]
        project: i64,

        #[arg(long, default_value = DEFAULT_DATABASE)]
        database: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Ports { json } => {
            init_tracing(TracingConfig::default(), cli.log_level.as_deref())?;
            list_ports(json)
        }
        Commands::Run {
            config,
            mock,
            skip_derive,
        } => {
            let config = BenchConfig::load(&config)
                .with_context(|| format!("loading {}", config.display()))?;
            let tracing_config = TracingConfig::from_logging(&config.logging)
                .map_err(anyhow::Error::msg)?;
            init_tracing(tracing_config, cli.log_level.as_deref())?;
            run(config, mock, skip_derive).await
        }
        Commands::Derive { project, database } => {
            init_tracing(TracingConfig::default(), cli.log_level.as_deref())?;
            let store = SqliteStore::connect(&database).await?;
            let summary = derive_project(&store, project).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Commands::View { project, database } => {
            init_tracing(TracingConfig::default(), cli.log_level.as_deref())?;
            let store = SqliteStore::connect(&database).await?;
            let Some(info) = store.project_info(project).await? else {
                bail!("project {} does not exist in {}", project, database);
            };
            let view = store
                .create_project_view(project, &info.name, Local::now())
                .await?;
            println!("{}", view);
            Ok(())
        }
    }
}

fn init_tracing(config: TracingConfig, level_override: Option<&str>) -> Result<()> {
    let config = match level_override {
        Some(level) => config.with_level(
            tracing_init::parse_log_level(level).map_err(anyhow::Error::msg)?,
        ),
        None => config,
    };
    tracing_init::init(config).map_err(anyhow::Error::msg)
}

fn list_ports(json: bool) -> Result<()> {
    let ports = available_ports()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&ports)?);
        return Ok(());
    }
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        println!("{:<20} {}", port.name, port.description);
    }
    Ok(())
}

fn driver_factory(mock: bool) -> Result<Arc<dyn DriverFactory>> {
    if mock {
        return Ok(Arc::new(
            MockDriverFactory::new(Chamber::default()).with_bath_ramp(2.0),
        ));
    }
    serial_factory()
}

#[cfg(feature = "serial")]
fn serial_factory() -> Result<Arc<dyn DriverFactory>> {
    Ok(Arc::new(tdau_experiment::SerialDriverFactory))
}

#[cfg(not(feature = "serial"))]
fn serial_factory() -> Result<Arc<dyn DriverFactory>> {
    bail!("built without serial support; use --mock")
}

async fn run(mut config: BenchConfig, mock: bool, skip_derive: bool) -> Result<()> {
    if mock {
        // Simulated bath: no reason to wait on wall-clock settling.
        config.bath.policy.poll_interval = Duration::from_millis(50);
        config.bath.policy.settle_time = Duration::ZERO;
        info!("Running against the simulated bench");
    }

    let store = Arc::new(SqliteStore::connect(&config.storage.url).await?);
    let engine = Arc::new(RunEngine::new(store.clone(), driver_factory(mock)?));

    let interrupt = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            if signal::ctrl_c().await.is_ok() {
                warn!("Ctrl-C received, stopping after the current row");
                engine.abort();
            }
        })
    };
    let outcome = engine.run(&config).await;
    interrupt.abort();
    let summary = outcome?;

    let mut report = serde_json::json!({ "run": summary });
    if summary.aborted {
        warn!(proj_id = summary.proj_id, "Run aborted; skipping derivation");
    } else if !skip_derive {
        let derived = derive_project(store.as_ref(), summary.proj_id).await?;
        report["derive"] = serde_json::to_value(derived)?;
        if config.storage.create_view {
            let view = store
                .create_project_view(summary.proj_id, &config.project.name, Local::now())
                .await?;
            report["view"] = serde_json::Value::String(view);
        }
    }

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

// Slape: Small Language-model Pipeline Engine
// Main entry point for the slape binary

use clap::Parser;
use slape_engine::cli::{Cli, Command};
use slape_engine::config::Config;
use slape_engine::container::DockerRuntime;
use slape_engine::daemon::{ensure_not_serving, open_registry, reconcile, Daemon};
use slape_engine::readiness::HttpHealthProbe;
use slape_engine::models::list_models;
use slape_engine::telemetry::{effective_level, init_telemetry, init_telemetry_with_level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            init_telemetry();
            tracing::error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    init_telemetry_with_level(effective_level(cli.log.as_deref(), &config.core.log_level));

    let version = env!("CARGO_PKG_VERSION");
    let commit = env!("GIT_COMMIT_HASH");
    let timestamp = env!("BUILD_TIMESTAMP");

    tracing::info!("Slape Engine v{} ({} - {})", version, commit, timestamp);

    match cli.command {
        Command::Serve => {
            tracing::info!("Starting service on {}", config.server.bind);
            let daemon = Daemon::new(config).await?;
            daemon.run().await?;
            Ok(())
        }

        Command::Reconcile { dry_run } => {
            tracing::info!("Reconciling worker containers (dry run: {})", dry_run);
            if !dry_run {
                let probe = HttpHealthProbe::new(config.readiness.probe_timeout())?;
                ensure_not_serving(&probe, &config.server.bind).await?;
            }

            let runtime = DockerRuntime::new(config.workers.stop_grace_secs);
            runtime.ping().await?;

            let database = open_registry(&config).await?;
            let registry = database.as_ref().map(|db| db.workers());
            let report = reconcile(&runtime, registry.as_ref(), !dry_run).await?;

            if report.is_clean() {
                println!("No orphaned workers.");
            } else if dry_run {
                println!("Orphaned workers ({}):", report.orphans.len());
                for id in &report.orphans {
                    println!("  {}", id);
                }
            } else {
                for id in &report.removed {
                    println!("Removed {}", id);
                }
                for id in &report.failed {
                    println!("Failed to remove {}", id);
                }
            }

            if let Some(database) = database {
                database.close().await?;
            }
            Ok(())
        }

        Command::Models => {
            let models = list_models(&config.workers.models_dir).await?;
            if models.is_empty() {
                println!("No models found in {}", config.workers.models_dir.display());
            } else {
                for model in models {
                    println!("{}", model);
                }
            }
            Ok(())
        }

        Command::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config, sdk::errors::EngineError> {
    match &cli.config {
        Some(path) => Config::load_from_path(path),
        None => Config::load_or_create(),
    }
}

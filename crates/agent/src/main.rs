//! Maintenance agent
//!
//! Runs the training coordinator every `run_interval_secs` until SIGINT.
//! A SIGINT lets the current job finish before exiting.

use anyhow::{Context, Result};
use clap::Parser;
use maint_agent::api;
use maint_lib::{
    health::{components, HealthRegistry},
    observability::{MaintenanceMetrics, StructuredLogger},
    runner::{ProcessRunner, TokioProcessRunner},
    Settings, SqliteDataStore, TrainingCoordinator,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(name = "maint-agent")]
#[command(author, version, about = "Runs incremental model maintenance on a schedule", long_about = None)]
struct Args {
    /// Settings file (TOML, YAML or JSON)
    #[arg(short, long, env = "MLMAINT_CONFIG")]
    config: Option<PathBuf>,

    /// Run once and exit instead of looping
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let args = Args::parse();
    info!("Starting maint-agent");

    let settings = Settings::load(args.config.as_deref()).context("Failed to load settings")?;
    info!(
        instance = %settings.instance_name,
        coordinator = %settings.coordinator_id,
        "Agent configured"
    );

    let health_registry = HealthRegistry::new();
    health_registry.register(components::STORE).await;
    health_registry.register(components::COORDINATOR).await;
    health_registry.register(components::NOTIFIER).await;

    let metrics = MaintenanceMetrics::new();
    let logger = StructuredLogger::new(&settings.instance_name);
    logger.log_startup(AGENT_VERSION);

    let app_state = Arc::new(api::AppState::new(health_registry.clone(), metrics));
    let api_handle = tokio::spawn(api::serve(settings.api_port, app_state.clone()));

    let store = match SqliteDataStore::connect(&settings.store_config()).await {
        Ok(store) => store,
        Err(e) => {
            health_registry
                .set_unhealthy(components::STORE, e.to_string())
                .await;
            api_handle.abort();
            return Err(e).context("Failed to connect to data store");
        }
    };

    if settings.notification.mail_command.is_none() {
        health_registry
            .set_degraded(components::NOTIFIER, "No mail command; failure reports are only logged")
            .await;
    }

    std::fs::create_dir_all(&settings.work_dir)
        .with_context(|| format!("Failed to create work dir {}", settings.work_dir.display()))?;
    let runner: Arc<dyn ProcessRunner> =
        Arc::new(TokioProcessRunner::with_working_dir(settings.work_dir.clone()));

    let mut coordinator = TrainingCoordinator::from_settings(&settings, store, runner)
        .await
        .context("Failed to load coordinator status")?;
    health_registry.set_ready(true).await;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("SIGINT received, finishing current job");
                cancel.cancel();
            }
        });
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(settings.run_interval_secs));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match coordinator.run(&cancel).await {
            Ok(summary) => {
                if summary.failed > 0 {
                    health_registry
                        .set_degraded(
                            components::COORDINATOR,
                            format!("{} job(s) failed in the last run", summary.failed),
                        )
                        .await;
                } else {
                    health_registry.set_healthy(components::COORDINATOR).await;
                }
                app_state.record_run(summary).await;
            }
            Err(e) if e.is_run_fatal() => {
                error!(error = %e, "Run aborted");
                health_registry
                    .set_unhealthy(components::COORDINATOR, e.to_string())
                    .await;
                logger.log_shutdown("fatal error");
                api_handle.abort();
                return Err(e).context("Coordinator run aborted");
            }
            Err(e) => {
                error!(error = %e, "Run failed");
                health_registry
                    .set_degraded(components::COORDINATOR, e.to_string())
                    .await;
            }
        }

        if args.once {
            break;
        }
    }

    let reason = if cancel.is_cancelled() {
        "SIGINT received"
    } else {
        "single run finished"
    };
    logger.log_shutdown(reason);
    info!("Shutting down");
    api_handle.abort();

    Ok(())
}

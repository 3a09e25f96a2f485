//! Application composition.
//!
//! Wires the state source, inference client, backend supervisor, catalog
//! reloader and dispatch scheduler together and runs them until shutdown.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::infrastructure::{
    backend_supervisor::{BackendSupervisor, SupervisorError},
    clock::SystemClock,
    config::BridgeConfig,
    ollama::{model_is_listed, OllamaClient},
    ports::{BackendStatus, InferencePort},
    sqlite_state::SqliteStateSource,
    trigger_file::TriggerFile,
};
use crate::use_cases::catalog::{CatalogHandle, CatalogReloader};
use crate::use_cases::dispatch::{DispatchError, DispatchScheduler, RunSummary};

/// Positional arguments and flags given on the command line.
#[derive(Debug, Clone)]
pub struct BridgeArgs {
    /// Default model for triggers without an override
    pub model: String,
    pub triggers: PathBuf,
    pub database: PathBuf,
    /// Address of an externally managed backend; disables supervision
    pub server: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// Configuration or resource problem found before dispatch started.
    #[error("{0:#}")]
    Startup(anyhow::Error),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Backend(#[from] SupervisorError),
}

impl RunError {
    /// Process exit code: 1 for startup errors, 2 for fatal runtime errors.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Startup(_) => 1,
            Self::Dispatch(_) | Self::Backend(_) => 2,
        }
    }
}

/// Run the bridge until `shutdown` fires or a fatal error occurs.
pub async fn run(args: BridgeArgs, shutdown: CancellationToken) -> Result<RunSummary, RunError> {
    let app = App::build(&args).await.map_err(RunError::Startup)?;
    app.run(shutdown).await
}

struct App {
    args: BridgeArgs,
    config: BridgeConfig,
    catalog: CatalogHandle,
    triggers: TriggerFile,
    state: Arc<SqliteStateSource>,
    inference: Arc<OllamaClient>,
}

impl App {
    async fn build(args: &BridgeArgs) -> anyhow::Result<Self> {
        let config = BridgeConfig::from_env(&args.model).context("Invalid configuration")?;

        check_database(&args.database).await?;

        let triggers = TriggerFile::new(&args.triggers);
        let catalog = triggers.load().await?;
        if catalog.is_empty() {
            tracing::warn!(
                path = %args.triggers.display(),
                "Triggers file defines no triggers, nothing will be dispatched"
            );
        }
        tracing::info!(
            path = %args.triggers.display(),
            triggers = catalog.len(),
            "Loaded trigger catalog"
        );

        let state = SqliteStateSource::open(
            &args.database,
            config.schema.clone(),
            config.busy.clone(),
            Arc::new(SystemClock::new()),
        )
        .await
        .with_context(|| format!("Cannot use game database {}", args.database.display()))?;

        let address = args.server.as_deref().unwrap_or(&config.backend_address);
        let inference = Arc::new(OllamaClient::new(address));

        tracing::info!(
            model = %args.model,
            database = %args.database.display(),
            backend = %inference.base_url(),
            supervised = args.server.is_none(),
            "Bridge configured"
        );

        Ok(Self {
            args: args.clone(),
            config,
            catalog: CatalogHandle::new(catalog),
            triggers,
            state: Arc::new(state),
            inference,
        })
    }

    async fn run(self, shutdown: CancellationToken) -> Result<RunSummary, RunError> {
        // Background tasks outlive the scheduler's shutdown grace period so
        // in-flight jobs can still reach the backend.
        let background = CancellationToken::new();

        let (status, supervisor) = match &self.args.server {
            Some(_) => (BackendSupervisor::external(), None),
            None => {
                let (supervisor, status) = BackendSupervisor::new(
                    self.config.backend.clone(),
                    self.inference.clone(),
                );
                let handle = tokio::spawn(supervisor.run(background.clone()));
                (status, Some(handle))
            }
        };

        tokio::spawn(warn_if_model_missing(
            self.inference.clone(),
            status.clone(),
            self.args.model.clone(),
            background.clone(),
        ));

        if let Some(interval) = self.config.catalog_reload {
            let reloader = CatalogReloader::new(self.triggers.clone(), self.catalog.clone(), interval);
            tokio::spawn(reloader.run(background.clone()));
        }

        let scheduler = DispatchScheduler::new(
            self.state.clone(),
            self.inference.clone(),
            self.catalog.clone(),
            status,
            self.config.dispatch.clone(),
        );
        let outcome = scheduler.run(shutdown).await;

        background.cancel();
        let supervisor_result = join_supervisor(supervisor).await;

        match (outcome, supervisor_result) {
            (Ok(summary), _) => Ok(summary),
            // The supervisor's error says why the backend failed.
            (Err(DispatchError::BackendFailed), Err(e)) => Err(e.into()),
            (Err(e), _) => Err(e.into()),
        }
    }
}

/// The database must already exist and be writable by this process.
async fn check_database(path: &Path) -> anyhow::Result<()> {
    let metadata = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("Game database {} not found", path.display()))?;
    if !metadata.is_file() {
        bail!("Game database {} is not a file", path.display());
    }
    tokio::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .await
        .with_context(|| format!("Game database {} is not writable", path.display()))?;
    Ok(())
}

async fn join_supervisor(
    handle: Option<JoinHandle<Result<(), SupervisorError>>>,
) -> Result<(), SupervisorError> {
    let Some(handle) = handle else {
        return Ok(());
    };
    match handle.await {
        Ok(result) => result,
        Err(e) => {
            tracing::error!(error = %e, "Backend supervisor task failed");
            Err(SupervisorError::TaskFailed(e.to_string()))
        }
    }
}

/// Once the backend is up, warn when the default model is not installed.
async fn warn_if_model_missing(
    inference: Arc<dyn InferencePort>,
    mut status: watch::Receiver<BackendStatus>,
    model: String,
    cancel: CancellationToken,
) {
    while !status.borrow_and_update().is_available() {
        tokio::select! {
            _ = cancel.cancelled() => return,
            changed = status.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }

    match inference.list_models().await {
        Ok(models) if model_is_listed(&model, &models) => {
            tracing::debug!(model = %model, "Default model is available");
        }
        Ok(models) => {
            tracing::warn!(
                model = %model,
                available = ?models,
                "Default model is not listed by the backend; requests may fail until it is pulled"
            );
        }
        Err(e) => {
            tracing::warn!(error = %e, "Could not list backend models");
        }
    }
}

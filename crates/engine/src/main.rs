//! NWN Bridge - main entry point.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::error::ErrorKind;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nwnbridge_engine::app::{self, BridgeArgs};

/// Dispatch game database changes to a local model and write the responses back.
#[derive(Parser, Debug)]
#[command(name = "bridge")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Default model for triggers that do not name one (e.g. gemma3)
    model: String,

    /// Triggers file (JSON array of trigger definitions)
    triggers: PathBuf,

    /// Game database (SQLite file written by the game)
    database: PathBuf,

    /// Use an already running backend at this address instead of starting one
    #[arg(short = 's', long = "server")]
    server: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(usage_exit_code(&e));
        }
    };

    load_dotenv_from_repo_root();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nwnbridge_engine=info,bridge=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting NWN bridge");

    let shutdown = CancellationToken::new();
    setup_shutdown_signal(shutdown.clone());

    let args = BridgeArgs {
        model: cli.model,
        triggers: cli.triggers,
        database: cli.database,
        server: cli.server,
    };

    match app::run(args, shutdown).await {
        Ok(summary) => {
            tracing::info!(
                changes = summary.changes_scanned,
                jobs = summary.jobs_created,
                succeeded = summary.succeeded,
                failed = summary.failed(),
                interrupted = summary.interrupted,
                resume_marker = %summary.resume_marker,
                "Bridge stopped"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "Bridge stopped with error");
            ExitCode::from(e.exit_code())
        }
    }
}

/// Help and version requests succeed; every other argument error is a
/// startup failure (exit 1), distinct from fatal runtime errors (exit 2).
fn usage_exit_code(error: &clap::Error) -> u8 {
    match error.kind() {
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
        _ => 1,
    }
}

/// Load `.env.local` then `.env` from the repository root when present.
fn load_dotenv_from_repo_root() {
    let repo_root = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("..");

    for filename in [".env.local", ".env"] {
        let path = repo_root.join(filename);
        if path.exists() {
            let _ = dotenvy::from_path(path);
        }
    }
    // Then the working directory, without overriding anything already set.
    let _ = dotenvy::dotenv();
}

fn setup_shutdown_signal(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown...");
            }
        }

        cancel.cancel();
    });
}

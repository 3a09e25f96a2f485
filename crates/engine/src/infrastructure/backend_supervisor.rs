//! Local inference backend process lifecycle.
//!
//! Starts the backend as a child process, forwards its output to the log,
//! probes readiness through the inference client and restarts it on
//! unexpected exit. Availability is published on a watch channel; nothing
//! else is shared with the dispatch loop.

use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::infrastructure::backoff::Backoff;
use crate::infrastructure::ports::{BackendStatus, InferencePort};

/// Log target for forwarded backend output.
pub const BACKEND_LOG_TARGET: &str = "inference_backend";

/// How long output forwarders may keep draining after the backend stops.
const FORWARDER_DRAIN: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq)]
pub struct BackendConfig {
    pub program: String,
    pub args: Vec<String>,
    /// Restarts allowed before the backend is declared failed
    pub max_restarts: u32,
    /// How long a fresh process may take to answer health checks
    pub ready_timeout: Duration,
    pub probe_interval: Duration,
    pub restart_backoff: Backoff,
    /// A run lasting this long resets the restart count
    pub stable_after: Duration,
}

impl BackendConfig {
    /// Split a shell-style command line on whitespace.
    pub fn from_command_line(command: &str) -> Result<Self, SupervisorError> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next().ok_or(SupervisorError::EmptyCommand)?;
        Ok(Self {
            program,
            args: parts.collect(),
            ..Self::default()
        })
    }

    fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            program: "ollama".to_string(),
            args: vec!["serve".to_string()],
            max_restarts: 5,
            ready_timeout: Duration::from_secs(30),
            probe_interval: Duration::from_secs(1),
            restart_backoff: Backoff::default(),
            stable_after: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Backend command is empty")]
    EmptyCommand,

    #[error("Backend restart budget exhausted after {0} restarts")]
    RestartsExhausted(u32),

    #[error("Backend supervisor task failed: {0}")]
    TaskFailed(String),
}

/// Why a supervised run ended.
enum RunOutcome {
    Cancelled,
    Exited(Option<ExitStatus>),
    NeverReady,
    SpawnFailed,
}

/// Why monitoring an adopted backend ended.
enum MonitorOutcome {
    Cancelled,
    Lost,
}

pub struct BackendSupervisor {
    config: BackendConfig,
    inference: Arc<dyn InferencePort>,
    status: watch::Sender<BackendStatus>,
}

impl BackendSupervisor {
    pub fn new(
        config: BackendConfig,
        inference: Arc<dyn InferencePort>,
    ) -> (Self, watch::Receiver<BackendStatus>) {
        let (status, receiver) = watch::channel(BackendStatus::Starting);
        (
            Self {
                config,
                inference,
                status,
            },
            receiver,
        )
    }

    /// Status for an externally managed backend: always available.
    pub fn external() -> watch::Receiver<BackendStatus> {
        watch::channel(BackendStatus::Available).1
    }

    /// Supervise until cancelled. Returns an error once the restart budget
    /// is exhausted; the last published status is then `Failed`.
    ///
    /// A backend that already answers is adopted and only monitored until it
    /// stays unhealthy for `ready_timeout`; after that the supervisor starts
    /// its own process.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), SupervisorError> {
        if self.inference.health_check().await.is_ok() {
            tracing::info!("Inference backend already running, not starting another");
            self.publish(BackendStatus::Available);
            match self.monitor(&cancel).await {
                MonitorOutcome::Cancelled => return Ok(()),
                MonitorOutcome::Lost => tracing::warn!(
                    timeout_secs = self.config.ready_timeout.as_secs(),
                    "Adopted inference backend stopped answering, starting our own"
                ),
            }
        }

        let mut restarts: u32 = 0;
        loop {
            self.publish(BackendStatus::Starting);
            let started = Instant::now();
            let outcome = self.run_once(&cancel).await;
            if matches!(outcome, RunOutcome::Cancelled) {
                self.publish(BackendStatus::Unavailable);
                return Ok(());
            }
            self.publish(BackendStatus::Unavailable);

            match outcome {
                RunOutcome::Exited(status) => {
                    tracing::warn!(exit_status = ?status, "Inference backend exited")
                }
                RunOutcome::NeverReady => tracing::warn!(
                    timeout_secs = self.config.ready_timeout.as_secs(),
                    "Inference backend did not become ready, stopped it"
                ),
                RunOutcome::SpawnFailed | RunOutcome::Cancelled => {}
            }

            if started.elapsed() >= self.config.stable_after {
                restarts = 0;
            }
            restarts += 1;
            if restarts > self.config.max_restarts {
                tracing::error!(
                    max_restarts = self.config.max_restarts,
                    "Inference backend restart budget exhausted"
                );
                self.publish(BackendStatus::Failed);
                return Err(SupervisorError::RestartsExhausted(self.config.max_restarts));
            }

            let delay = self.config.restart_backoff.delay(restarts);
            tracing::info!(
                restart = restarts,
                max_restarts = self.config.max_restarts,
                delay_ms = delay.as_millis() as u64,
                "Restarting inference backend"
            );
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn run_once(&self, cancel: &CancellationToken) -> RunOutcome {
        let mut child = match self.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(
                    command = %self.config.command_line(),
                    error = %e,
                    "Failed to start inference backend"
                );
                return RunOutcome::SpawnFailed;
            }
        };
        tracing::info!(
            command = %self.config.command_line(),
            pid = ?child.id(),
            "Started inference backend"
        );

        let mut forwarders: Vec<JoinHandle<()>> = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            forwarders.push(forward_lines(stdout, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            forwarders.push(forward_lines(stderr, "stderr"));
        }

        let group = child.id();
        let outcome = self.watch_child(&mut child, cancel).await;
        // Helpers the backend started share its group and may hold the pipes open.
        if let Some(group) = group {
            kill_process_group(group);
        }
        if !matches!(outcome, RunOutcome::Exited(_)) {
            if let Err(e) = child.kill().await {
                tracing::warn!(error = %e, "Failed to kill inference backend");
            }
        }
        drain_forwarders(forwarders).await;
        outcome
    }

    fn spawn(&self) -> std::io::Result<Child> {
        let mut command = Command::new(&self.config.program);
        command
            .args(&self.config.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);
        command.spawn()
    }

    async fn watch_child(&self, child: &mut Child, cancel: &CancellationToken) -> RunOutcome {
        let ready_deadline = Instant::now() + self.config.ready_timeout;
        let mut ready = false;
        let mut probe = tokio::time::interval(self.config.probe_interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return RunOutcome::Cancelled,
                status = child.wait() => return RunOutcome::Exited(status.ok()),
                _ = probe.tick() => {
                    let healthy = self.inference.health_check().await.is_ok();
                    if healthy != ready {
                        ready = healthy;
                        self.publish(if healthy {
                            BackendStatus::Available
                        } else {
                            BackendStatus::Unavailable
                        });
                    } else if !ready && Instant::now() >= ready_deadline {
                        return RunOutcome::NeverReady;
                    }
                }
            }
        }
    }

    /// Track an already-running backend we did not start.
    async fn monitor(&self, cancel: &CancellationToken) -> MonitorOutcome {
        let mut probe = tokio::time::interval(self.config.probe_interval);
        let mut last_healthy = Instant::now();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return MonitorOutcome::Cancelled,
                _ = probe.tick() => {
                    if self.inference.health_check().await.is_ok() {
                        last_healthy = Instant::now();
                        self.publish(BackendStatus::Available);
                    } else {
                        self.publish(BackendStatus::Unavailable);
                        if last_healthy.elapsed() >= self.config.ready_timeout {
                            return MonitorOutcome::Lost;
                        }
                    }
                }
            }
        }
    }

    fn publish(&self, status: BackendStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            match status {
                BackendStatus::Available => tracing::info!(%status, "Inference backend status"),
                BackendStatus::Starting => tracing::info!(%status, "Inference backend status"),
                BackendStatus::Unavailable | BackendStatus::Failed => {
                    tracing::warn!(%status, "Inference backend status")
                }
            }
        }
    }
}

/// Wait for the output forwarders to reach EOF, aborting any still running
/// once the drain window closes.
async fn drain_forwarders(forwarders: Vec<JoinHandle<()>>) {
    let deadline = Instant::now() + FORWARDER_DRAIN;
    for mut handle in forwarders {
        if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
            tracing::debug!(target: BACKEND_LOG_TARGET, "Output still open after stop, detaching");
            handle.abort();
        }
    }
}

/// SIGKILL every process in the backend's group. The group id is the
/// backend's pid since it was spawned as a group leader.
#[cfg(unix)]
#[allow(unsafe_code)]
fn kill_process_group(group: u32) {
    let Ok(pgid) = libc::pid_t::try_from(group) else {
        return;
    };
    // SAFETY: kill(2) takes plain integers and touches no memory of ours.
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc != 0 {
        let e = std::io::Error::last_os_error();
        if e.raw_os_error() != Some(libc::ESRCH) {
            tracing::warn!(pgid, error = %e, "Failed to kill inference backend process group");
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_group: u32) {}

fn forward_lines<R>(reader: R, stream: &'static str) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => tracing::info!(target: BACKEND_LOG_TARGET, stream, "{line}"),
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(target: BACKEND_LOG_TARGET, stream, error = %e, "Output stream closed");
                    break;
                }
            }
        }
    })
}

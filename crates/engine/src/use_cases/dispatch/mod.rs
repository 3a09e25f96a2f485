//! Dispatch scheduler - the trigger detection and dispatch loop.
//!
//! One loop owns all scheduling state:
//!
//! 1. Every poll interval, scan the state source past the scan cursor.
//! 2. Resolve each change against the active catalog; every match becomes a
//!    `DispatchJob` queued under its concurrency key.
//! 3. Admit queued jobs while the backend is available, at most one per key
//!    and at most `max_in_flight` overall.
//! 4. Each admitted job runs on its own task: generate, then commit.
//! 5. Completions come back to the loop, which retries, drops or finishes
//!    the job and moves the resume marker past fully terminal changes.
//!
//! The scan cursor (how far we have read) and the resume marker (how far
//! everything is terminal) are separate; only the resume marker is durable.

mod admission;
mod resume;
mod worker;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use nwnbridge_domain::{DispatchJob, JobId, SequenceMarker};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::infrastructure::backoff::Backoff;
use crate::infrastructure::ports::{BackendStatus, InferencePort, StateSourcePort, StoreError};
use crate::use_cases::catalog::CatalogHandle;

pub use admission::{AdmissionQueue, Ticket};
pub use resume::ResumeTracker;

use worker::{AttemptResult, QueuedJob, WorkerContext};

/// Tuning for the dispatch loop.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchConfig {
    /// Model used by triggers without an override
    pub default_model: String,
    /// Scan interval; trades write-back latency against database load
    pub poll_interval: Duration,
    pub scan_batch_size: usize,
    /// Scanning pauses while this many jobs wait for admission
    pub max_pending: usize,
    pub max_in_flight: usize,
    /// Attempts per job, including the first
    pub max_attempts: u32,
    pub retry_backoff: Backoff,
    pub inference_timeout: Duration,
    pub commit_timeout: Duration,
    /// How long in-flight jobs may finish after shutdown is requested
    pub shutdown_grace: Duration,
    /// Consecutive failed scans before giving up
    pub max_scan_failures: u32,
}

impl DispatchConfig {
    pub fn new(default_model: impl Into<String>) -> Self {
        Self {
            default_model: default_model.into(),
            poll_interval: Duration::from_millis(500),
            scan_batch_size: 256,
            max_pending: 1024,
            max_in_flight: 2,
            max_attempts: 3,
            retry_backoff: Backoff::default(),
            inference_timeout: Duration::from_secs(120),
            commit_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(10),
            max_scan_failures: 3,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Cannot read resume marker: {0}")]
    Resume(#[source] StoreError),

    #[error("State source failed {failures} consecutive scans: {last}")]
    ScanFailed { failures: u32, last: StoreError },

    #[error("Inference backend failed permanently")]
    BackendFailed,

    #[error("Job worker panicked: {0}")]
    WorkerPanicked(String),
}

/// Counts for one run of the scheduler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub changes_scanned: u64,
    pub jobs_created: u64,
    pub succeeded: u64,
    /// Dropped on write conflict
    pub conflicts: u64,
    /// Dropped after exhausting attempts
    pub abandoned: u64,
    /// In flight at shutdown; redelivered on restart
    pub interrupted: u64,
    pub resume_marker: SequenceMarker,
}

impl RunSummary {
    /// Jobs that ended `Failed`.
    pub fn failed(&self) -> u64 {
        self.conflicts + self.abandoned
    }
}

/// Identity of an admitted job, for logging jobs cut off by shutdown.
struct Running {
    trigger: String,
    tag: String,
    marker: SequenceMarker,
}

struct Completion {
    ticket: Ticket,
    queued: QueuedJob,
    result: AttemptResult,
}

struct RunState {
    cursor: SequenceMarker,
    resume: ResumeTracker,
    queue: AdmissionQueue<QueuedJob>,
    workers: JoinSet<Completion>,
    running: HashMap<JobId, Running>,
    scan_failures: u32,
    summary: RunSummary,
}

pub struct DispatchScheduler {
    state: Arc<dyn StateSourcePort>,
    inference: Arc<dyn InferencePort>,
    catalog: CatalogHandle,
    backend: watch::Receiver<BackendStatus>,
    config: DispatchConfig,
}

impl DispatchScheduler {
    pub fn new(
        state: Arc<dyn StateSourcePort>,
        inference: Arc<dyn InferencePort>,
        catalog: CatalogHandle,
        backend: watch::Receiver<BackendStatus>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            state,
            inference,
            catalog,
            backend,
            config,
        }
    }

    /// Run until `cancel` fires (clean shutdown) or a fatal error occurs.
    pub async fn run(self, cancel: CancellationToken) -> Result<RunSummary, DispatchError> {
        let start = self
            .state
            .current_marker()
            .await
            .map_err(DispatchError::Resume)?;
        tracing::info!(
            marker = %start,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            max_in_flight = self.config.max_in_flight,
            "Dispatch loop starting"
        );

        let mut run = RunState {
            cursor: start,
            resume: ResumeTracker::new(start),
            queue: AdmissionQueue::new(self.config.max_in_flight),
            workers: JoinSet::new(),
            running: HashMap::new(),
            scan_failures: 0,
            summary: RunSummary {
                resume_marker: start,
                ..RunSummary::default()
            },
        };

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut backend = self.backend.clone();
        let mut backend_open = true;

        let outcome = loop {
            if *backend.borrow() == BackendStatus::Failed {
                break Err(DispatchError::BackendFailed);
            }
            self.admit(&mut run);

            // Backed-off jobs only matter while admission is open.
            let wakeup = if self.backend.borrow().is_available() {
                run.queue.next_wakeup()
            } else {
                None
            };
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                Some(joined) = run.workers.join_next(), if !run.workers.is_empty() => {
                    if let Err(e) = self.handle_joined(&mut run, joined) {
                        break Err(e);
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.scan(&mut run).await {
                        break Err(e);
                    }
                }
                _ = sleep_until(wakeup) => {}
                changed = backend.changed(), if backend_open => {
                    if changed.is_err() {
                        // Nobody will publish again; only a final Available is usable.
                        if !backend.borrow().is_available() {
                            tracing::error!("Backend status channel closed while unavailable");
                            break Err(DispatchError::BackendFailed);
                        }
                        backend_open = false;
                    }
                }
            }
            self.persist_resume(&mut run).await;
        };

        match &outcome {
            Ok(()) => self.drain(&mut run).await,
            Err(e) => {
                tracing::error!(error = %e, "Dispatch loop stopping on fatal error");
                self.interrupt_all(&mut run).await;
            }
        }
        self.persist_resume(&mut run).await;

        run.summary.resume_marker = run.resume.resume_marker();
        tracing::info!(
            succeeded = run.summary.succeeded,
            conflicts = run.summary.conflicts,
            abandoned = run.summary.abandoned,
            interrupted = run.summary.interrupted,
            resume_marker = %run.summary.resume_marker,
            "Dispatch loop stopped"
        );
        outcome.map(|()| run.summary)
    }

    async fn scan(&self, run: &mut RunState) -> Result<(), DispatchError> {
        if !self.backend.borrow().is_available() {
            tracing::trace!("Backend not available, skipping scan");
            return Ok(());
        }
        if run.queue.pending_len() >= self.config.max_pending {
            tracing::debug!(
                pending = run.queue.pending_len(),
                "Pending limit reached, skipping scan"
            );
            return Ok(());
        }

        let changes = match self
            .state
            .scan(run.cursor, self.config.scan_batch_size)
            .await
        {
            Ok(changes) => {
                run.scan_failures = 0;
                changes
            }
            Err(e) => {
                run.scan_failures += 1;
                tracing::warn!(
                    error = %e,
                    failures = run.scan_failures,
                    max_failures = self.config.max_scan_failures,
                    "Scan failed"
                );
                if run.scan_failures >= self.config.max_scan_failures {
                    return Err(DispatchError::ScanFailed {
                        failures: run.scan_failures,
                        last: e,
                    });
                }
                return Ok(());
            }
        };

        if changes.is_empty() {
            return Ok(());
        }
        tracing::debug!(count = changes.len(), since = %run.cursor, "Scanned changes");

        // One snapshot per batch so a reload never splits a batch.
        let catalog = self.catalog.current();
        for change in changes {
            if change.marker <= run.cursor {
                continue;
            }
            run.cursor = change.marker;
            run.summary.changes_scanned += 1;

            let change = Arc::new(change);
            let matches = catalog.resolve(&change);
            run.resume.record_scanned(change.marker, matches.len());
            for trigger in matches {
                self.enqueue(run, DispatchJob::new(trigger, Arc::clone(&change)));
            }
        }
        Ok(())
    }

    fn enqueue(&self, run: &mut RunState, job: DispatchJob) {
        let rendered = job.trigger.render_prompt(&job.source);
        if !rendered.missing.is_empty() {
            tracing::warn!(
                trigger = %job.trigger_name(),
                tag = %job.tag(),
                marker = %job.marker(),
                missing = ?rendered.missing,
                "Prompt has unknown placeholders, leaving them verbatim"
            );
        }
        let model = job.trigger.model_or(&self.config.default_model).to_string();
        tracing::debug!(
            job_id = %job.id,
            trigger = %job.trigger_name(),
            tag = %job.tag(),
            marker = %job.marker(),
            key = %job.concurrency_key,
            "Queued job"
        );
        run.summary.jobs_created += 1;
        run.queue.push(
            job.concurrency_key.clone(),
            QueuedJob {
                job,
                prompt: rendered.text.into(),
                model,
            },
        );
    }

    fn admit(&self, run: &mut RunState) {
        if !self.backend.borrow().is_available() {
            return;
        }
        let ctx = WorkerContext {
            inference: Arc::clone(&self.inference),
            state: Arc::clone(&self.state),
            inference_timeout: self.config.inference_timeout,
            commit_timeout: self.config.commit_timeout,
        };

        while let Some((ticket, mut queued)) = run.queue.pop_ready(Instant::now()) {
            if let Err(e) = queued.job.start() {
                tracing::error!(error = %e, "Admitted job in unexpected state, dropping");
                run.queue.release(&ticket);
                run.resume.job_finished(queued.job.marker());
                continue;
            }
            let job = &queued.job;
            tracing::info!(
                job_id = %job.id,
                trigger = %job.trigger_name(),
                tag = %job.tag(),
                marker = %job.marker(),
                attempt = job.attempt(),
                model = %queued.model,
                "Dispatching job"
            );
            run.running.insert(
                job.id,
                Running {
                    trigger: job.trigger_name().to_string(),
                    tag: job.tag().to_string(),
                    marker: job.marker(),
                },
            );

            let ctx = ctx.clone();
            run.workers.spawn(async move {
                let result = worker::execute(&queued, &ctx).await;
                Completion {
                    ticket,
                    queued,
                    result,
                }
            });
        }
    }

    /// A panicked worker took its admission ticket with it; the key can
    /// never be released, so the loop stops.
    fn handle_joined(
        &self,
        run: &mut RunState,
        joined: Result<Completion, JoinError>,
    ) -> Result<(), DispatchError> {
        match joined {
            Ok(completion) => {
                run.running.remove(&completion.queued.job.id);
                self.complete(run, completion);
                Ok(())
            }
            Err(e) if e.is_panic() => Err(DispatchError::WorkerPanicked(e.to_string())),
            Err(_) => Ok(()),
        }
    }

    fn complete(&self, run: &mut RunState, completion: Completion) {
        let Completion {
            ticket,
            mut queued,
            result,
        } = completion;
        let marker = queued.job.marker();

        match result {
            AttemptResult::Committed => {
                run.queue.release(&ticket);
                let job = &mut queued.job;
                if let Err(e) = job.succeed() {
                    tracing::error!(error = %e, "Job state out of sync");
                }
                tracing::info!(
                    job_id = %job.id,
                    trigger = %job.trigger_name(),
                    tag = %job.tag(),
                    marker = %marker,
                    attempt = job.attempt(),
                    target = %job.trigger.write_target,
                    "Committed response"
                );
                run.summary.succeeded += 1;
                run.resume.job_finished(marker);
            }
            AttemptResult::Conflict(e) => {
                run.queue.release(&ticket);
                let job = &mut queued.job;
                let _ = job.fail();
                tracing::warn!(
                    job_id = %job.id,
                    trigger = %job.trigger_name(),
                    tag = %job.tag(),
                    marker = %marker,
                    error = %e,
                    "Write-back conflict, dropping job"
                );
                run.summary.conflicts += 1;
                run.resume.job_finished(marker);
            }
            AttemptResult::Failed(e) => {
                let job = &mut queued.job;
                let _ = job.fail();
                let attempt = job.attempt();
                if attempt < self.config.max_attempts && job.retry().is_ok() {
                    let delay = self.config.retry_backoff.delay(attempt);
                    tracing::warn!(
                        job_id = %job.id,
                        trigger = %job.trigger_name(),
                        tag = %job.tag(),
                        marker = %marker,
                        attempt,
                        max_attempts = self.config.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Job attempt failed, retrying"
                    );
                    run.queue.requeue(ticket, queued, Instant::now() + delay);
                } else {
                    run.queue.release(&ticket);
                    tracing::error!(
                        job_id = %job.id,
                        trigger = %job.trigger_name(),
                        tag = %job.tag(),
                        marker = %marker,
                        attempts = attempt,
                        error = %e,
                        "Job failed after all attempts, abandoning"
                    );
                    run.summary.abandoned += 1;
                    run.resume.job_finished(marker);
                }
            }
        }
    }

    async fn persist_resume(&self, run: &mut RunState) {
        let Some(marker) = run.resume.unpersisted() else {
            return;
        };
        match self.state.persist_marker(marker).await {
            Ok(()) => {
                run.resume.mark_persisted(marker);
                tracing::debug!(marker = %marker, "Persisted resume marker");
            }
            Err(e) => {
                tracing::warn!(
                    marker = %marker,
                    error = %e,
                    "Failed to persist resume marker, will retry"
                );
            }
        }
    }

    /// Let in-flight jobs finish within the grace period, then cancel the rest.
    async fn drain(&self, run: &mut RunState) {
        if run.workers.is_empty() {
            return;
        }
        tracing::info!(
            in_flight = run.workers.len(),
            grace_secs = self.config.shutdown_grace.as_secs_f64(),
            "Shutdown requested, waiting for in-flight jobs"
        );
        let deadline = Instant::now() + self.config.shutdown_grace;
        loop {
            tokio::select! {
                joined = run.workers.join_next() => match joined {
                    Some(joined) => {
                        if let Err(e) = self.handle_joined(run, joined) {
                            tracing::error!(error = %e, "Worker failed during shutdown");
                            break;
                        }
                    }
                    None => return,
                },
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }
        self.interrupt_all(run).await;
    }

    /// Cancel every in-flight job. They stay non-terminal and are redelivered
    /// after restart.
    async fn interrupt_all(&self, run: &mut RunState) {
        run.workers.abort_all();
        // Jobs that finished before the abort landed still count.
        while let Some(joined) = run.workers.join_next().await {
            if let Ok(completion) = joined {
                run.running.remove(&completion.queued.job.id);
                self.complete(run, completion);
            }
        }
        for (_, running) in run.running.drain() {
            tracing::warn!(
                trigger = %running.trigger,
                tag = %running.tag,
                marker = %running.marker,
                "Cancelled in-flight job, will be redelivered"
            );
            run.summary.interrupted += 1;
        }
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests;

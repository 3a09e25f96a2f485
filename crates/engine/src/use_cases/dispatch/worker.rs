//! One attempt of one job: generate, then write back.

use std::sync::Arc;
use std::time::Duration;

use nwnbridge_domain::DispatchJob;

use crate::infrastructure::ports::{
    InferenceError, InferencePort, InferenceRequest, StateSourcePort, StoreError,
};

/// A job together with what it sends to the model.
#[derive(Debug)]
pub(super) struct QueuedJob {
    pub job: DispatchJob,
    pub prompt: Arc<str>,
    pub model: String,
}

#[derive(Clone)]
pub(super) struct WorkerContext {
    pub inference: Arc<dyn InferencePort>,
    pub state: Arc<dyn StateSourcePort>,
    pub inference_timeout: Duration,
    pub commit_timeout: Duration,
}

#[derive(Debug)]
pub(super) enum AttemptResult {
    Committed,
    /// Target stale or consumed; never retried
    Conflict(StoreError),
    Failed(AttemptError),
}

#[derive(Debug, thiserror::Error)]
pub(super) enum AttemptError {
    #[error(transparent)]
    Inference(#[from] InferenceError),

    #[error("Write-back failed: {0}")]
    Commit(StoreError),

    #[error("Write-back timed out after {0:?}")]
    CommitTimeout(Duration),
}

pub(super) async fn execute(queued: &QueuedJob, ctx: &WorkerContext) -> AttemptResult {
    let job = &queued.job;
    let request = InferenceRequest::new(
        queued.prompt.as_ref(),
        queued.model.as_str(),
        ctx.inference_timeout,
    );

    // The outer deadline also covers clients that ignore the request timeout.
    let text = match tokio::time::timeout(ctx.inference_timeout, ctx.inference.generate(request))
        .await
    {
        Ok(Ok(text)) => text,
        Ok(Err(e)) => return AttemptResult::Failed(e.into()),
        Err(_) => {
            return AttemptResult::Failed(InferenceError::Timeout(ctx.inference_timeout).into())
        }
    };

    tracing::debug!(
        job_id = %job.id,
        trigger = %job.trigger_name(),
        tag = %job.tag(),
        marker = %job.marker(),
        chars = text.len(),
        "Generated response"
    );

    let commit = ctx.state.commit(&job.trigger.write_target, job.tag(), &text);
    match tokio::time::timeout(ctx.commit_timeout, commit).await {
        Ok(Ok(())) => AttemptResult::Committed,
        Ok(Err(e)) if e.is_write_conflict() => AttemptResult::Conflict(e),
        Ok(Err(e)) => AttemptResult::Failed(AttemptError::Commit(e)),
        Err(_) => AttemptResult::Failed(AttemptError::CommitTimeout(ctx.commit_timeout)),
    }
}

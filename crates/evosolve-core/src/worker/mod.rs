//! Phase workers: variator, enricher, ranker.
//!
//! Each worker is idempotent on replay: a task that finds its phase already
//! complete returns without calling the LLM or mutating the store. Errors
//! are recorded as `{phase}_error` before the task fails, so the
//! orchestrator and redelivery can drive recovery from persisted state.

pub mod enricher;
pub mod ranker;
pub mod variator;

use sqlx::PgPool;

use evosolve_db::models::Phase;
use evosolve_db::queries::{generations, jobs, telemetry};

use crate::error::EngineError;
use crate::llm::{LlmClient, LlmRequest, LlmResponse, call_id};
use crate::queue::WorkerTask;

/// Shared dependencies for one worker invocation.
pub struct WorkerContext<'a> {
    pub pool: &'a PgPool,
    pub llm: &'a dyn LlmClient,
    /// Concurrency bound for the enricher's per-idea fan-out.
    pub enricher_concurrency: usize,
}

/// What a worker invocation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseOutcome {
    /// The phase ran and persisted its results.
    Completed,
    /// The phase was already complete (or the job is terminal); nothing was
    /// executed.
    Skipped,
}

/// Dispatch one worker task to its phase handler.
///
/// On failure the error is recorded on the generation record before being
/// returned, so the HTTP handler can answer 5xx and the queue redeliver.
pub async fn handle_task(
    ctx: &WorkerContext<'_>,
    task: &WorkerTask,
) -> Result<PhaseOutcome, EngineError> {
    let job = jobs::get_job(ctx.pool, &task.job_id)
        .await?
        .ok_or_else(|| EngineError::Validation(format!("job {} not found", task.job_id)))?;

    if job.status.is_terminal() {
        tracing::info!(
            job_id = %job.id,
            status = %job.status,
            "job is terminal, skipping worker task"
        );
        return Ok(PhaseOutcome::Skipped);
    }

    let result = match task.task_type {
        Phase::Variator => variator::run(ctx, &job, task.generation).await,
        Phase::Enricher => enricher::run(ctx, &job, task.generation).await,
        Phase::Ranker => ranker::run(ctx, &job, task.generation).await,
    };

    if let Err(err) = &result {
        tracing::warn!(
            job_id = %job.id,
            phase = %task.task_type,
            generation = task.generation,
            kind = err.kind(),
            error = %err,
            "phase task failed"
        );
        let message = format!("[{}] {err}", err.kind());
        if let Err(record_err) = generations::record_phase_error(
            ctx.pool,
            &job.id,
            task.generation,
            task.task_type,
            &message,
            err.is_parse(),
        )
        .await
        {
            tracing::error!(
                job_id = %job.id,
                error = %record_err,
                "failed to record phase error"
            );
        }
    }

    result
}

/// Record one LLM call: append telemetry (required) and write the debug
/// blob (best-effort). Returns the call id.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn record_llm_call(
    pool: &PgPool,
    job_id: &str,
    phase: Phase,
    generation: u32,
    attempt: i32,
    request: &LlmRequest,
    response: &LlmResponse,
    parsed: Option<&serde_json::Value>,
) -> Result<String, EngineError> {
    let call_id = call_id(job_id, generation, phase);

    telemetry::append_api_call(
        pool,
        &telemetry::NewApiCall {
            job_id,
            call_id: &call_id,
            phase,
            generation,
            attempt,
            model: &response.model,
            prompt_tokens: response.prompt_tokens,
            completion_tokens: response.completion_tokens,
            duration_ms: response.duration_ms,
        },
    )
    .await?;

    let debug = telemetry::NewApiDebug {
        call_id: &call_id,
        job_id,
        phase,
        generation,
        attempt,
        prompt: &request.prompt,
        raw_response: &response.content,
        parsed_response: parsed,
        prompt_tokens: response.prompt_tokens,
        completion_tokens: response.completion_tokens,
        duration_ms: response.duration_ms,
    };
    if let Err(e) = telemetry::save_api_debug(pool, &debug).await {
        tracing::warn!(call_id = %call_id, error = %e, "failed to save api debug record");
    }

    Ok(call_id)
}

//! Database query functions for the `jobs` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use sqlx::types::Json;

use crate::models::{
    EvolutionConfig, GenerationSummary, JobDocument, JobRow, JobStatus, Preferences, ScoredIdea,
};
use crate::queries::{generations, telemetry};

/// Create a job row in `pending` status.
///
/// Idempotent on an existing id: the conflict arm only bumps `updated_at`
/// and returns the stored row, so a replayed submission cannot clobber a
/// job that has already started processing.
pub async fn create_job(
    pool: &PgPool,
    id: &str,
    problem_context: &str,
    preferences: &Preferences,
    evolution_config: &EvolutionConfig,
) -> Result<JobRow> {
    let job = sqlx::query_as::<_, JobRow>(
        "INSERT INTO jobs (id, problem_context, preferences, evolution_config) \
         VALUES ($1, $2, $3, $4) \
         ON CONFLICT (id) DO UPDATE SET updated_at = now() \
         RETURNING *",
    )
    .bind(id)
    .bind(problem_context)
    .bind(Json(preferences))
    .bind(Json(evolution_config))
    .fetch_one(pool)
    .await
    .context("failed to create job")?;

    Ok(job)
}

/// Fetch a job by its ID. Snapshot read; `None` when absent.
pub async fn get_job(pool: &PgPool, id: &str) -> Result<Option<JobRow>> {
    let job = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch job")?;

    Ok(job)
}

/// List all jobs, newest first.
pub async fn list_jobs(pool: &PgPool) -> Result<Vec<JobRow>> {
    let jobs = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs ORDER BY created_at DESC")
        .fetch_all(pool)
        .await
        .context("failed to list jobs")?;

    Ok(jobs)
}

/// Generic status transition, optionally recording a failure reason.
pub async fn update_job_status(
    pool: &PgPool,
    id: &str,
    status: JobStatus,
    error: Option<&str>,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE jobs SET status = $1, error = COALESCE($2, error), updated_at = now() \
         WHERE id = $3",
    )
    .bind(status)
    .bind(error)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to update job status")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("job {id} not found");
    }

    Ok(())
}

/// Transition a job from `pending` to `processing`.
///
/// A no-op when the job is already past `pending`, so replayed orchestrator
/// tasks are safe.
pub async fn mark_processing(pool: &PgPool, id: &str) -> Result<()> {
    sqlx::query(
        "UPDATE jobs SET status = 'processing', updated_at = now() \
         WHERE id = $1 AND status = 'pending'",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("failed to mark job processing")?;

    Ok(())
}

/// Atomically persist the final results and set `status = completed`.
pub async fn complete_job(
    pool: &PgPool,
    id: &str,
    top_solutions: &[ScoredIdea],
    all_solutions: &[ScoredIdea],
    generation_history: &[GenerationSummary],
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE jobs \
         SET status = 'completed', \
             top_solutions = $1, \
             all_solutions = $2, \
             generation_history = $3, \
             completed_at = now(), \
             updated_at = now() \
         WHERE id = $4",
    )
    .bind(Json(top_solutions))
    .bind(Json(all_solutions))
    .bind(Json(generation_history))
    .bind(id)
    .execute(pool)
    .await
    .context("failed to complete job")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("job {id} not found");
    }

    Ok(())
}

/// Mark a job failed with a reason. Sets `completed_at` so callers can tell
/// when the job stopped.
pub async fn fail_job(pool: &PgPool, id: &str, reason: &str) -> Result<()> {
    let result = sqlx::query(
        "UPDATE jobs \
         SET status = 'failed', error = $1, completed_at = now(), updated_at = now() \
         WHERE id = $2",
    )
    .bind(reason)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to mark job failed")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("job {id} not found");
    }

    Ok(())
}

/// Assemble the full job document (job + generations + telemetry) for
/// read-through. Returns `None` when the job does not exist.
pub async fn load_job_document(pool: &PgPool, id: &str) -> Result<Option<JobDocument>> {
    let Some(job) = get_job(pool, id).await? else {
        return Ok(None);
    };

    let gen_rows = generations::list_generations(pool, id).await?;
    let api_rows = telemetry::list_api_calls(pool, id).await?;

    let generations = gen_rows
        .into_iter()
        .map(|row| (row.generation.to_string(), row.into()))
        .collect();

    Ok(Some(JobDocument {
        job_id: job.id,
        status: job.status,
        problem_context: job.problem_context,
        preferences: job.preferences.0,
        evolution_config: job.evolution_config.0,
        current_generation: job.current_generation,
        current_phase: job.current_phase,
        generations,
        api_calls: api_rows.into_iter().map(Into::into).collect(),
        top_solutions: job.top_solutions.map(|j| j.0),
        all_solutions: job.all_solutions.map(|j| j.0),
        generation_history: job.generation_history.map(|j| j.0),
        error: job.error,
        created_at: job.created_at,
        updated_at: job.updated_at,
        completed_at: job.completed_at,
    }))
}

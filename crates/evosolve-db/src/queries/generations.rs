//! Database query functions for the `generations` table.
//!
//! Phase tracking columns are updated per-column so the variator, enricher,
//! and ranker never overwrite each other's fields. Column names cannot be
//! parameterised, so each phase gets its own static statement.

use anyhow::{Context, Result};
use sqlx::PgPool;
use sqlx::types::Json;

use crate::models::{EnrichedIdea, GenerationRow, Idea, Phase, ScoredIdea};

/// Create the generation row if it does not exist yet. Generations are
/// created lazily on first phase start.
pub async fn ensure_generation(pool: &PgPool, job_id: &str, generation: u32) -> Result<()> {
    sqlx::query(
        "INSERT INTO generations (job_id, generation) VALUES ($1, $2) \
         ON CONFLICT DO NOTHING",
    )
    .bind(job_id)
    .bind(generation as i32)
    .execute(pool)
    .await
    .context("failed to ensure generation row")?;

    Ok(())
}

/// Fetch a single generation record.
pub async fn get_generation(
    pool: &PgPool,
    job_id: &str,
    generation: u32,
) -> Result<Option<GenerationRow>> {
    let row = sqlx::query_as::<_, GenerationRow>(
        "SELECT * FROM generations WHERE job_id = $1 AND generation = $2",
    )
    .bind(job_id)
    .bind(generation as i32)
    .fetch_optional(pool)
    .await
    .context("failed to fetch generation")?;

    Ok(row)
}

/// List all generation records for a job, in generation order.
pub async fn list_generations(pool: &PgPool, job_id: &str) -> Result<Vec<GenerationRow>> {
    let rows = sqlx::query_as::<_, GenerationRow>(
        "SELECT * FROM generations WHERE job_id = $1 ORDER BY generation ASC",
    )
    .bind(job_id)
    .fetch_all(pool)
    .await
    .context("failed to list generations")?;

    Ok(rows)
}

/// Mark a phase started: sets `{phase}_started[_at]` on the generation and
/// `current_generation` / `current_phase` on the job. Creates the generation
/// row when absent.
pub async fn mark_phase_started(
    pool: &PgPool,
    job_id: &str,
    generation: u32,
    phase: Phase,
) -> Result<()> {
    ensure_generation(pool, job_id, generation).await?;

    let stmt = match phase {
        Phase::Variator => {
            "UPDATE generations \
             SET variator_started = TRUE, variator_started_at = now() \
             WHERE job_id = $1 AND generation = $2"
        }
        Phase::Enricher => {
            "UPDATE generations \
             SET enricher_started = TRUE, enricher_started_at = now() \
             WHERE job_id = $1 AND generation = $2"
        }
        Phase::Ranker => {
            "UPDATE generations \
             SET ranker_started = TRUE, ranker_started_at = now() \
             WHERE job_id = $1 AND generation = $2"
        }
    };

    sqlx::query(stmt)
        .bind(job_id)
        .bind(generation as i32)
        .execute(pool)
        .await
        .with_context(|| format!("failed to mark {phase} started"))?;

    sqlx::query(
        "UPDATE jobs SET current_generation = $1, current_phase = $2, updated_at = now() \
         WHERE id = $3",
    )
    .bind(generation as i32)
    .bind(phase)
    .bind(job_id)
    .execute(pool)
    .await
    .context("failed to update job position")?;

    Ok(())
}

/// Reset a phase after a timeout: clears the started flags and any recorded
/// error, and bumps the attempt counter so the next task carries a fresh
/// idempotency key.
pub async fn reset_phase(pool: &PgPool, job_id: &str, generation: u32, phase: Phase) -> Result<()> {
    let stmt = match phase {
        Phase::Variator => {
            "UPDATE generations \
             SET variator_started = FALSE, variator_started_at = NULL, \
                 variator_error = NULL, variator_attempt = variator_attempt + 1 \
             WHERE job_id = $1 AND generation = $2 AND NOT variator_complete"
        }
        Phase::Enricher => {
            "UPDATE generations \
             SET enricher_started = FALSE, enricher_started_at = NULL, \
                 enricher_error = NULL, enricher_parse_failure = FALSE, \
                 enricher_attempt = enricher_attempt + 1 \
             WHERE job_id = $1 AND generation = $2 AND NOT enricher_complete"
        }
        Phase::Ranker => {
            "UPDATE generations \
             SET ranker_started = FALSE, ranker_started_at = NULL, \
                 ranker_error = NULL, ranker_attempt = ranker_attempt + 1 \
             WHERE job_id = $1 AND generation = $2 AND NOT ranker_complete"
        }
    };

    sqlx::query(stmt)
        .bind(job_id)
        .bind(generation as i32)
        .execute(pool)
        .await
        .with_context(|| format!("failed to reset {phase}"))?;

    Ok(())
}

/// Persist the variator's output and mark the phase complete.
pub async fn save_variator_results(
    pool: &PgPool,
    job_id: &str,
    generation: u32,
    ideas: &[Idea],
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE generations \
         SET ideas = $1, variator_complete = TRUE, variator_completed_at = now() \
         WHERE job_id = $2 AND generation = $3",
    )
    .bind(Json(ideas))
    .bind(job_id)
    .bind(generation as i32)
    .execute(pool)
    .await
    .context("failed to save variator results")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("generation {generation} of job {job_id} not found");
    }

    touch_job(pool, job_id).await
}

/// Persist the enricher's output and mark the phase complete.
pub async fn save_enricher_results(
    pool: &PgPool,
    job_id: &str,
    generation: u32,
    enriched_ideas: &[EnrichedIdea],
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE generations \
         SET enriched_ideas = $1, enricher_complete = TRUE, enricher_completed_at = now() \
         WHERE job_id = $2 AND generation = $3",
    )
    .bind(Json(enriched_ideas))
    .bind(job_id)
    .bind(generation as i32)
    .execute(pool)
    .await
    .context("failed to save enricher results")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("generation {generation} of job {job_id} not found");
    }

    touch_job(pool, job_id).await
}

/// Persist the ranker's output. Marks both `ranker_complete` and
/// `generation_complete`.
pub async fn save_ranker_results(
    pool: &PgPool,
    job_id: &str,
    generation: u32,
    solutions: &[ScoredIdea],
    top_performers: &[ScoredIdea],
    top_score: f64,
    avg_score: f64,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE generations \
         SET solutions = $1, top_performers = $2, top_score = $3, avg_score = $4, \
             ranker_complete = TRUE, ranker_completed_at = now(), \
             generation_complete = TRUE \
         WHERE job_id = $5 AND generation = $6",
    )
    .bind(Json(solutions))
    .bind(Json(top_performers))
    .bind(top_score)
    .bind(avg_score)
    .bind(job_id)
    .bind(generation as i32)
    .execute(pool)
    .await
    .context("failed to save ranker results")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("generation {generation} of job {job_id} not found");
    }

    touch_job(pool, job_id).await
}

/// Record a phase failure. `parse_failure` is only meaningful for the
/// enricher, where it sets the dedicated flag alongside the error message.
pub async fn record_phase_error(
    pool: &PgPool,
    job_id: &str,
    generation: u32,
    phase: Phase,
    message: &str,
    parse_failure: bool,
) -> Result<()> {
    let stmt = match phase {
        Phase::Variator => {
            "UPDATE generations SET variator_error = $1 \
             WHERE job_id = $2 AND generation = $3"
        }
        Phase::Enricher => {
            "UPDATE generations \
             SET enricher_error = $1, enricher_parse_failure = $4 \
             WHERE job_id = $2 AND generation = $3"
        }
        Phase::Ranker => {
            "UPDATE generations SET ranker_error = $1 \
             WHERE job_id = $2 AND generation = $3"
        }
    };

    let mut query = sqlx::query(stmt)
        .bind(message)
        .bind(job_id)
        .bind(generation as i32);
    if phase == Phase::Enricher {
        query = query.bind(parse_failure);
    }

    query
        .execute(pool)
        .await
        .with_context(|| format!("failed to record {phase} error"))?;

    touch_job(pool, job_id).await
}

async fn touch_job(pool: &PgPool, job_id: &str) -> Result<()> {
    sqlx::query("UPDATE jobs SET updated_at = now() WHERE id = $1")
        .bind(job_id)
        .execute(pool)
        .await
        .context("failed to touch job")?;
    Ok(())
}

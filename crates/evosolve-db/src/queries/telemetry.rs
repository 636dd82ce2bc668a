//! Database query functions for the `api_calls` and `api_debug` tables.
//!
//! `api_calls` is append-only; rows are never updated or deleted.

use anyhow::{Context, Result};
use sqlx::PgPool;
use sqlx::types::Json;

use crate::models::{ApiCallRow, ApiDebugRow, Phase};

/// Fields for a new telemetry entry.
#[derive(Debug, Clone)]
pub struct NewApiCall<'a> {
    pub job_id: &'a str,
    pub call_id: &'a str,
    pub phase: Phase,
    pub generation: u32,
    pub attempt: i32,
    pub model: &'a str,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub duration_ms: i64,
}

/// Append one telemetry entry. Returns the row id.
pub async fn append_api_call(pool: &PgPool, entry: &NewApiCall<'_>) -> Result<i64> {
    let (id,): (i64,) = sqlx::query_as(
        "INSERT INTO api_calls \
         (job_id, call_id, phase, generation, attempt, model, prompt_tokens, \
          completion_tokens, duration_ms) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
         RETURNING id",
    )
    .bind(entry.job_id)
    .bind(entry.call_id)
    .bind(entry.phase)
    .bind(entry.generation as i32)
    .bind(entry.attempt)
    .bind(entry.model)
    .bind(entry.prompt_tokens)
    .bind(entry.completion_tokens)
    .bind(entry.duration_ms)
    .fetch_one(pool)
    .await
    .context("failed to append api call telemetry")?;

    Ok(id)
}

/// List telemetry entries for a job in write order.
pub async fn list_api_calls(pool: &PgPool, job_id: &str) -> Result<Vec<ApiCallRow>> {
    let rows = sqlx::query_as::<_, ApiCallRow>(
        "SELECT * FROM api_calls WHERE job_id = $1 ORDER BY id ASC",
    )
    .bind(job_id)
    .fetch_all(pool)
    .await
    .context("failed to list api calls")?;

    Ok(rows)
}

/// Fields for a new debug record.
#[derive(Debug, Clone)]
pub struct NewApiDebug<'a> {
    pub call_id: &'a str,
    pub job_id: &'a str,
    pub phase: Phase,
    pub generation: u32,
    pub attempt: i32,
    pub prompt: &'a str,
    pub raw_response: &'a str,
    pub parsed_response: Option<&'a serde_json::Value>,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub duration_ms: i64,
}

/// Write the full prompt/response blob for one call.
///
/// Callers treat this as best-effort: a failure here is logged, never
/// propagated into the phase outcome.
pub async fn save_api_debug(pool: &PgPool, entry: &NewApiDebug<'_>) -> Result<()> {
    sqlx::query(
        "INSERT INTO api_debug \
         (call_id, job_id, phase, generation, attempt, prompt, raw_response, \
          parsed_response, prompt_tokens, completion_tokens, duration_ms) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
         ON CONFLICT (call_id) DO NOTHING",
    )
    .bind(entry.call_id)
    .bind(entry.job_id)
    .bind(entry.phase)
    .bind(entry.generation as i32)
    .bind(entry.attempt)
    .bind(entry.prompt)
    .bind(entry.raw_response)
    .bind(entry.parsed_response.map(Json))
    .bind(entry.prompt_tokens)
    .bind(entry.completion_tokens)
    .bind(entry.duration_ms)
    .execute(pool)
    .await
    .context("failed to save api debug record")?;

    Ok(())
}

/// Fetch one debug record by call id.
pub async fn get_api_debug(pool: &PgPool, call_id: &str) -> Result<Option<ApiDebugRow>> {
    let row = sqlx::query_as::<_, ApiDebugRow>("SELECT * FROM api_debug WHERE call_id = $1")
        .bind(call_id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch api debug record")?;

    Ok(row)
}

/// List debug records for a job, oldest first.
pub async fn list_api_debug(pool: &PgPool, job_id: &str) -> Result<Vec<ApiDebugRow>> {
    let rows = sqlx::query_as::<_, ApiDebugRow>(
        "SELECT * FROM api_debug WHERE job_id = $1 ORDER BY recorded_at ASC",
    )
    .bind(job_id)
    .fetch_all(pool)
    .await
    .context("failed to list api debug records")?;

    Ok(rows)
}

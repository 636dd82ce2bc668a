//! Database query functions for the `queue_tasks` table.
//!
//! The queue provides delayed, at-least-once delivery. Claiming uses
//! `FOR UPDATE SKIP LOCKED` so multiple dispatcher processes can drain the
//! same table, and a lock lease so tasks orphaned by a crashed dispatcher
//! become claimable again.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use crate::models::{QueueTaskRow, TaskKind};

/// How long a claimed task stays invisible before it can be re-claimed.
pub const LOCK_LEASE_SECS: i64 = 600;

/// Enqueue a task for delivery no earlier than `scheduled_at`.
///
/// When `idempotency_key` is set and a task with the same key already
/// exists, the insert is a no-op and `None` is returned.
pub async fn enqueue(
    pool: &PgPool,
    kind: TaskKind,
    payload: &serde_json::Value,
    idempotency_key: Option<&str>,
    scheduled_at: DateTime<Utc>,
    max_attempts: i32,
) -> Result<Option<Uuid>> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        "INSERT INTO queue_tasks (kind, payload, idempotency_key, scheduled_at, max_attempts) \
         VALUES ($1, $2, $3, $4, $5) \
         ON CONFLICT (idempotency_key) WHERE idempotency_key IS NOT NULL DO NOTHING \
         RETURNING id",
    )
    .bind(kind)
    .bind(Json(payload))
    .bind(idempotency_key)
    .bind(scheduled_at)
    .bind(max_attempts)
    .fetch_optional(pool)
    .await
    .context("failed to enqueue task")?;

    Ok(row.map(|(id,)| id))
}

/// Claim up to `limit` due tasks, locking them against other dispatchers.
pub async fn claim_due(pool: &PgPool, limit: i64) -> Result<Vec<QueueTaskRow>> {
    let rows = sqlx::query_as::<_, QueueTaskRow>(
        "UPDATE queue_tasks SET locked_at = now() \
         WHERE id IN ( \
             SELECT id FROM queue_tasks \
             WHERE completed_at IS NULL \
               AND scheduled_at <= now() \
               AND (locked_at IS NULL OR locked_at < now() - make_interval(secs => $1)) \
             ORDER BY scheduled_at ASC \
             LIMIT $2 \
             FOR UPDATE SKIP LOCKED \
         ) \
         RETURNING *",
    )
    .bind(LOCK_LEASE_SECS as f64)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to claim due tasks")?;

    Ok(rows)
}

/// Mark a task delivered. Terminal.
pub async fn mark_completed(pool: &PgPool, id: Uuid) -> Result<()> {
    let result = sqlx::query("UPDATE queue_tasks SET completed_at = now() WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to mark task completed")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("queue task {id} not found");
    }

    Ok(())
}

/// Record a failed delivery and reschedule the task.
///
/// Increments the attempt counter and releases the lock so the task is
/// redelivered at `next_at`. Returns the new attempt count.
pub async fn mark_failed_retry(
    pool: &PgPool,
    id: Uuid,
    error: &str,
    next_at: DateTime<Utc>,
) -> Result<i32> {
    let (attempt,): (i32,) = sqlx::query_as(
        "UPDATE queue_tasks \
         SET attempt = attempt + 1, locked_at = NULL, last_error = $1, scheduled_at = $2 \
         WHERE id = $3 \
         RETURNING attempt",
    )
    .bind(error)
    .bind(next_at)
    .bind(id)
    .fetch_one(pool)
    .await
    .context("failed to reschedule task")?;

    Ok(attempt)
}

/// Mark a task dead after exhausting its delivery attempts.
pub async fn mark_exhausted(pool: &PgPool, id: Uuid, error: &str) -> Result<()> {
    sqlx::query(
        "UPDATE queue_tasks \
         SET completed_at = now(), last_error = $1 \
         WHERE id = $2",
    )
    .bind(error)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to mark task exhausted")?;

    Ok(())
}

/// Fetch a task by id.
pub async fn get_task(pool: &PgPool, id: Uuid) -> Result<Option<QueueTaskRow>> {
    let row = sqlx::query_as::<_, QueueTaskRow>("SELECT * FROM queue_tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch queue task")?;

    Ok(row)
}

/// Count tasks still awaiting delivery.
pub async fn pending_count(pool: &PgPool) -> Result<i64> {
    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM queue_tasks WHERE completed_at IS NULL")
            .fetch_one(pool)
            .await
            .context("failed to count pending tasks")?;

    Ok(count)
}

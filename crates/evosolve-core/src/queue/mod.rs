//! Task queue adapter: delayed delivery of orchestrator and worker tasks.
//!
//! Tasks are opaque JSON payloads POSTed to the orchestrator or worker HTTP
//! endpoint. Delivery is at-least-once; the endpoints own idempotency.

pub mod auth;
pub mod dispatcher;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use evosolve_db::models::{EvolutionConfig, Phase, TaskKind};
use evosolve_db::queries::queue;

/// Delivery attempts per task before it is parked as dead.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 5;

/// Payload for an orchestrator check.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrateTask {
    pub job_id: String,
    pub check_attempt: u32,
}

/// Payload for one phase worker task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerTask {
    pub job_id: String,
    #[serde(rename = "type")]
    pub task_type: Phase,
    pub generation: u32,
    pub evolution_config: EvolutionConfig,
    pub problem_context: String,
    /// Phase attempt at enqueue time; feeds the idempotency key so a reset
    /// phase gets a genuinely new task.
    pub attempt: i32,
}

impl WorkerTask {
    /// Idempotency key: one task per (job, generation, phase, attempt).
    pub fn idempotency_key(&self) -> String {
        format!(
            "{}_gen{}_{}_a{}",
            self.job_id, self.generation, self.task_type, self.attempt
        )
    }
}

/// Enqueue seam used by the orchestrator and the submission path.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueue an orchestrator check, deliverable no earlier than
    /// `schedule_at`.
    async fn enqueue_orchestrate(
        &self,
        task: &OrchestrateTask,
        schedule_at: DateTime<Utc>,
        idempotency_key: Option<&str>,
    ) -> Result<()>;

    /// Enqueue a worker task for immediate delivery.
    async fn enqueue_worker(&self, task: &WorkerTask) -> Result<()>;
}

/// Durable queue backed by the `queue_tasks` table.
#[derive(Clone)]
pub struct PgTaskQueue {
    pool: PgPool,
}

impl PgTaskQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskQueue for PgTaskQueue {
    async fn enqueue_orchestrate(
        &self,
        task: &OrchestrateTask,
        schedule_at: DateTime<Utc>,
        idempotency_key: Option<&str>,
    ) -> Result<()> {
        let payload = serde_json::to_value(task)?;
        let id = queue::enqueue(
            &self.pool,
            TaskKind::Orchestrate,
            &payload,
            idempotency_key,
            schedule_at,
            DEFAULT_MAX_ATTEMPTS,
        )
        .await?;

        if id.is_none() {
            tracing::debug!(
                job_id = %task.job_id,
                key = ?idempotency_key,
                "orchestrate task deduplicated"
            );
        }
        Ok(())
    }

    async fn enqueue_worker(&self, task: &WorkerTask) -> Result<()> {
        let payload = serde_json::to_value(task)?;
        let key = task.idempotency_key();
        let id = queue::enqueue(
            &self.pool,
            TaskKind::Worker,
            &payload,
            Some(&key),
            Utc::now(),
            DEFAULT_MAX_ATTEMPTS,
        )
        .await?;

        if id.is_none() {
            tracing::debug!(job_id = %task.job_id, key = %key, "worker task deduplicated");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_task_key_covers_phase_and_attempt() {
        let config = EvolutionConfig {
            generations: 1,
            population_size: 3,
            top_select_count: 1,
            offspring_ratio: 0.5,
            diversification_factor: 0.05,
            model: "m".into(),
            enricher_mode: Default::default(),
            reenrich_carried: false,
        };
        let task = WorkerTask {
            job_id: "job-1".into(),
            task_type: Phase::Enricher,
            generation: 2,
            evolution_config: config,
            problem_context: "p".into(),
            attempt: 1,
        };
        assert_eq!(task.idempotency_key(), "job-1_gen2_enricher_a1");
    }

    #[test]
    fn worker_task_wire_shape() {
        let config = EvolutionConfig {
            generations: 1,
            population_size: 3,
            top_select_count: 1,
            offspring_ratio: 0.5,
            diversification_factor: 0.05,
            model: "m".into(),
            enricher_mode: Default::default(),
            reenrich_carried: false,
        };
        let task = WorkerTask {
            job_id: "job-1".into(),
            task_type: Phase::Variator,
            generation: 1,
            evolution_config: config,
            problem_context: "p".into(),
            attempt: 0,
        };
        let value = serde_json::to_value(&task).unwrap();
        assert_eq!(value["jobId"], "job-1");
        assert_eq!(value["type"], "variator");
        assert_eq!(value["generation"], 1);
        assert_eq!(value["evolutionConfig"]["populationSize"], 3);
    }
}

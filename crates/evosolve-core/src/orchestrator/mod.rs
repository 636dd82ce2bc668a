//! The orchestrator: a re-entrant state machine that decides, idempotently,
//! what to do next for a job.
//!
//! The decision is a pure function of the durable job state, so it can be
//! replayed after a crash and tested without a store. The effectful wrapper
//! executes exactly one decision per invocation and reschedules itself
//! until the job is terminal.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use sqlx::PgPool;

use evosolve_db::models::{GenerationRow, JobRow, JobStatus, Phase};
use evosolve_db::queries::{generations, jobs};

use crate::queue::{OrchestrateTask, TaskQueue, WorkerTask};

/// Orchestration cycles allowed per job before it is failed.
pub const MAX_CHECK_ATTEMPTS: u32 = 100;

/// A phase that has been started but not completed within this window is
/// considered dead and gets reset.
pub const PHASE_TIMEOUT_SECS: i64 = 300;

/// What the orchestrator decided to do for a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum Decision {
    /// The job is already terminal; nothing to do.
    AlreadyComplete,
    /// A phase is running and within its timeout; check again later.
    Wait,
    /// Enqueue a worker for a phase that has not started.
    CreateTask { phase: Phase, generation: u32 },
    /// A phase timed out; reset it and enqueue a fresh worker.
    RetryTask { phase: Phase, generation: u32 },
    /// Every generation is complete; finalize the job.
    MarkComplete,
    /// The job cannot make progress; fail it.
    MarkFailed { reason: String },
}

/// Decide the next action for a job. Pure in the job state and `now`.
///
/// First matching rule wins:
/// 1. terminal status: already complete
/// 2. attempt budget exhausted: mark failed
/// 3. pending: create the first variator task
/// 4. walk the current generation's phases in order; an incomplete started
///    phase either waits (within timeout) or retries (past it), an
///    unstarted phase gets a task
/// 5. all phases complete: next generation, or mark complete
pub fn decide(
    job: &JobRow,
    gens: &[GenerationRow],
    check_attempt: u32,
    now: DateTime<Utc>,
) -> Decision {
    if job.status.is_terminal() {
        return Decision::AlreadyComplete;
    }

    if check_attempt >= MAX_CHECK_ATTEMPTS {
        return Decision::MarkFailed {
            reason: "max orchestration attempts exceeded".to_owned(),
        };
    }

    if job.status == JobStatus::Pending {
        return Decision::CreateTask {
            phase: Phase::Variator,
            generation: 1,
        };
    }

    let generation = job.current_generation.max(1) as u32;
    let Some(r#gen) = gens.iter().find(|g| g.generation as u32 == generation) else {
        // Processing but the generation row has not been created yet: the
        // worker never ran. Issue the task again.
        return Decision::CreateTask {
            phase: Phase::Variator,
            generation,
        };
    };

    for phase in Phase::ALL {
        if r#gen.phase_complete(phase) {
            continue;
        }
        if r#gen.phase_started(phase) {
            let started_at = r#gen.phase_started_at(phase).unwrap_or(now);
            let elapsed = now.signed_duration_since(started_at);
            if elapsed.num_seconds() > PHASE_TIMEOUT_SECS {
                return Decision::RetryTask { phase, generation };
            }
            return Decision::Wait;
        }
        return Decision::CreateTask { phase, generation };
    }

    let total_generations = job.evolution_config.0.generations;
    if generation < total_generations {
        Decision::CreateTask {
            phase: Phase::Variator,
            generation: generation + 1,
        }
    } else {
        Decision::MarkComplete
    }
}

/// Delay before the next orchestrator check:
/// `min(5000 · 1.5^attempt, 60000) + jitter[0, 1000)` milliseconds.
pub fn backoff_delay(attempt: u32) -> Duration {
    let base = 5_000.0 * 1.5_f64.powi(attempt.min(32) as i32);
    let capped = base.min(60_000.0) as u64;
    let jitter = rand::rng().random_range(0..1000);
    Duration::from_millis(capped + jitter)
}

/// Execute one orchestration step for a job.
///
/// Reads the job, decides, performs the decision's effects, and (for
/// non-terminal decisions) re-enqueues another check with backoff. Returns
/// the decision taken.
pub async fn orchestrate(
    pool: &PgPool,
    queue: &dyn TaskQueue,
    job_id: &str,
    check_attempt: u32,
) -> Result<Decision> {
    let job = jobs::get_job(pool, job_id)
        .await?
        .with_context(|| format!("job {job_id} not found"))?;
    let gens = generations::list_generations(pool, job_id).await?;

    let decision = decide(&job, &gens, check_attempt, Utc::now());
    tracing::info!(
        job_id = %job_id,
        check_attempt,
        decision = ?decision,
        "orchestrator decision"
    );

    match &decision {
        Decision::AlreadyComplete => {}
        Decision::Wait => {
            reschedule(queue, job_id, check_attempt).await?;
        }
        Decision::CreateTask { phase, generation } => {
            jobs::mark_processing(pool, job_id).await?;
            enqueue_worker(pool, queue, &job, *phase, *generation).await?;
            reschedule(queue, job_id, check_attempt).await?;
        }
        Decision::RetryTask { phase, generation } => {
            tracing::warn!(
                job_id = %job_id,
                phase = %phase,
                generation,
                "phase timed out, resetting"
            );
            generations::reset_phase(pool, job_id, *generation, *phase).await?;
            enqueue_worker(pool, queue, &job, *phase, *generation).await?;
            reschedule(queue, job_id, check_attempt).await?;
        }
        Decision::MarkComplete => {
            finalize(pool, &job).await?;
        }
        Decision::MarkFailed { reason } => {
            jobs::fail_job(pool, job_id, reason).await?;
        }
    }

    Ok(decision)
}

async fn reschedule(queue: &dyn TaskQueue, job_id: &str, check_attempt: u32) -> Result<()> {
    let next = OrchestrateTask {
        job_id: job_id.to_owned(),
        check_attempt: check_attempt + 1,
    };
    let delay = backoff_delay(check_attempt);
    let schedule_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
    queue.enqueue_orchestrate(&next, schedule_at, None).await
}

async fn enqueue_worker(
    pool: &PgPool,
    queue: &dyn TaskQueue,
    job: &JobRow,
    phase: Phase,
    generation: u32,
) -> Result<()> {
    // The phase attempt (bumped by reset) keys the task, so a reset phase
    // gets a genuinely new task while replays of the same decision dedupe.
    let attempt = generations::get_generation(pool, &job.id, generation)
        .await?
        .map(|g| g.phase_attempt(phase))
        .unwrap_or(0);

    let task = WorkerTask {
        job_id: job.id.clone(),
        task_type: phase,
        generation,
        evolution_config: job.evolution_config.0.clone(),
        problem_context: job.problem_context.clone(),
        attempt,
    };
    queue.enqueue_worker(&task).await
}

/// Gather all generations' solutions into the final job fields and mark the
/// job completed.
async fn finalize(pool: &PgPool, job: &JobRow) -> Result<()> {
    let gens = generations::list_generations(pool, &job.id).await?;

    let mut all_solutions: Vec<_> = gens
        .iter()
        .flat_map(|g| {
            g.solutions
                .as_ref()
                .map(|j| j.0.clone())
                .unwrap_or_default()
        })
        .collect();
    all_solutions.sort_by(|a, b| b.score.partial_cmp(&a.score).expect("finite scores"));

    let top_solutions: Vec<_> = all_solutions.iter().take(10).cloned().collect();

    let generation_history: Vec<_> = gens
        .iter()
        .map(|g| {
            let solutions = g.solutions.as_ref().map(|j| j.0.as_slice()).unwrap_or(&[]);
            evosolve_db::models::GenerationSummary {
                generation: g.generation as u32,
                top_score: g.top_score.unwrap_or(0.0),
                avg_score: g.avg_score.unwrap_or(0.0),
                idea_count: solutions.len() as u32,
                best_idea_id: solutions.first().map(|s| s.idea_id().to_owned()),
            }
        })
        .collect();

    jobs::complete_job(pool, &job.id, &top_solutions, &all_solutions, &generation_history).await?;
    tracing::info!(
        job_id = %job.id,
        solutions = all_solutions.len(),
        "job completed"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use sqlx::types::Json;

    use evosolve_db::models::{EnricherMode, EvolutionConfig, Preferences};

    fn job(status: JobStatus, current_generation: i32, total_generations: u32) -> JobRow {
        JobRow {
            id: "job-1".to_owned(),
            status,
            problem_context: "a problem".to_owned(),
            preferences: Json(Preferences {
                max_capex: 10.0,
                min_profits: 1.0,
                target_return: 3.0,
                timeline_months: 36,
            }),
            evolution_config: Json(EvolutionConfig {
                generations: total_generations,
                population_size: 3,
                top_select_count: 1,
                offspring_ratio: 0.5,
                diversification_factor: 0.05,
                model: "m".to_owned(),
                enricher_mode: EnricherMode::Batch,
                reenrich_carried: false,
            }),
            current_generation,
            current_phase: Phase::Variator,
            top_solutions: None,
            all_solutions: None,
            generation_history: None,
            error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            completed_at: None,
        }
    }

    fn gen_row(generation: i32) -> GenerationRow {
        GenerationRow {
            job_id: "job-1".to_owned(),
            generation,
            variator_started: false,
            variator_started_at: None,
            variator_complete: false,
            variator_completed_at: None,
            variator_error: None,
            variator_attempt: 0,
            enricher_started: false,
            enricher_started_at: None,
            enricher_complete: false,
            enricher_completed_at: None,
            enricher_error: None,
            enricher_parse_failure: false,
            enricher_attempt: 0,
            ranker_started: false,
            ranker_started_at: None,
            ranker_complete: false,
            ranker_completed_at: None,
            ranker_error: None,
            ranker_attempt: 0,
            ideas: None,
            enriched_ideas: None,
            solutions: None,
            top_performers: None,
            top_score: None,
            avg_score: None,
            generation_complete: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn terminal_jobs_are_already_complete() {
        let now = Utc::now();
        for status in [JobStatus::Completed, JobStatus::Failed] {
            let decision = decide(&job(status, 1, 1), &[], 0, now);
            assert_eq!(decision, Decision::AlreadyComplete);
        }
    }

    #[test]
    fn pending_job_gets_first_variator_task() {
        let decision = decide(&job(JobStatus::Pending, 1, 2), &[], 0, Utc::now());
        assert_eq!(
            decision,
            Decision::CreateTask {
                phase: Phase::Variator,
                generation: 1
            }
        );
    }

    #[test]
    fn attempt_budget_exhaustion_fails_the_job() {
        let decision = decide(
            &job(JobStatus::Processing, 1, 1),
            &[],
            MAX_CHECK_ATTEMPTS,
            Utc::now(),
        );
        assert!(matches!(decision, Decision::MarkFailed { reason } if reason.contains("max orchestration attempts")));
    }

    #[test]
    fn processing_without_generation_row_recreates_variator() {
        let decision = decide(&job(JobStatus::Processing, 1, 1), &[], 3, Utc::now());
        assert_eq!(
            decision,
            Decision::CreateTask {
                phase: Phase::Variator,
                generation: 1
            }
        );
    }

    #[test]
    fn started_phase_within_timeout_waits() {
        let now = Utc::now();
        let mut r#gen = gen_row(1);
        r#gen.variator_started = true;
        r#gen.variator_started_at = Some(now - ChronoDuration::seconds(60));

        let decision = decide(&job(JobStatus::Processing, 1, 1), &[r#gen], 2, now);
        assert_eq!(decision, Decision::Wait);
    }

    #[test]
    fn started_phase_past_timeout_retries() {
        let now = Utc::now();
        let mut r#gen = gen_row(1);
        r#gen.variator_started = true;
        r#gen.variator_started_at = Some(now - ChronoDuration::seconds(PHASE_TIMEOUT_SECS + 30));

        let decision = decide(&job(JobStatus::Processing, 1, 1), &[r#gen], 2, now);
        assert_eq!(
            decision,
            Decision::RetryTask {
                phase: Phase::Variator,
                generation: 1
            }
        );
    }

    #[test]
    fn phases_advance_in_order() {
        let now = Utc::now();
        let mut r#gen = gen_row(1);
        r#gen.variator_started = true;
        r#gen.variator_complete = true;

        let decision = decide(&job(JobStatus::Processing, 1, 1), &[r#gen.clone()], 2, now);
        assert_eq!(
            decision,
            Decision::CreateTask {
                phase: Phase::Enricher,
                generation: 1
            }
        );

        r#gen.enricher_started = true;
        r#gen.enricher_complete = true;
        let decision = decide(&job(JobStatus::Processing, 1, 1), &[r#gen], 2, now);
        assert_eq!(
            decision,
            Decision::CreateTask {
                phase: Phase::Ranker,
                generation: 1
            }
        );
    }

    #[test]
    fn completed_generation_advances_or_finishes() {
        let now = Utc::now();
        let mut r#gen = gen_row(1);
        r#gen.variator_complete = true;
        r#gen.enricher_complete = true;
        r#gen.ranker_complete = true;
        r#gen.generation_complete = true;

        // More generations remain: start the next one.
        let decision = decide(&job(JobStatus::Processing, 1, 2), &[r#gen.clone()], 2, now);
        assert_eq!(
            decision,
            Decision::CreateTask {
                phase: Phase::Variator,
                generation: 2
            }
        );

        // Last generation done: finalize.
        let decision = decide(&job(JobStatus::Processing, 1, 1), &[r#gen], 2, now);
        assert_eq!(decision, Decision::MarkComplete);
    }

    #[test]
    fn decision_is_stable_across_repeated_calls() {
        let now = Utc::now();
        let mut r#gen = gen_row(1);
        r#gen.variator_started = true;
        r#gen.variator_complete = true;
        let j = job(JobStatus::Processing, 1, 1);

        let first = decide(&j, std::slice::from_ref(&r#gen), 2, now);
        let second = decide(&j, std::slice::from_ref(&r#gen), 3, now);
        assert_eq!(first, second);
    }

    #[test]
    fn backoff_grows_and_caps() {
        // Jitter is [0, 1000), so compare against the base envelope.
        let d0 = backoff_delay(0).as_millis() as u64;
        assert!((5_000..6_000).contains(&d0), "attempt 0: {d0}");

        let d3 = backoff_delay(3).as_millis() as u64;
        assert!((16_875..17_875).contains(&d3), "attempt 3: {d3}");

        let d50 = backoff_delay(50).as_millis() as u64;
        assert!((60_000..61_000).contains(&d50), "attempt 50: {d50}");
    }

    #[test]
    fn decision_wire_shape() {
        let value = serde_json::to_value(Decision::CreateTask {
            phase: Phase::Variator,
            generation: 2,
        })
        .unwrap();
        assert_eq!(value["action"], "create-task");
        assert_eq!(value["phase"], "variator");
        assert_eq!(value["generation"], 2);

        let value = serde_json::to_value(Decision::Wait).unwrap();
        assert_eq!(value["action"], "wait");
    }
}

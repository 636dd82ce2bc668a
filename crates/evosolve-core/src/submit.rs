//! Job submission: validate the spec, create the durable job, and enqueue
//! the first orchestrator check.
//!
//! Shared by the HTTP surface and the CLI so both paths apply the same
//! validation.

use anyhow::Result;
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use evosolve_db::models::{EvolutionConfig, JobRow, Preferences};
use evosolve_db::queries::jobs;

use crate::error::EngineError;
use crate::queue::{OrchestrateTask, TaskQueue};

/// Problem description length bounds.
pub const MIN_PROBLEM_LEN: usize = 10;
pub const MAX_PROBLEM_LEN: usize = 5000;

/// Validate a submission, normalizing `top_select_count` down to the
/// population size when oversized.
pub fn validate_job_spec(
    problem_context: &str,
    preferences: &Preferences,
    config: &mut EvolutionConfig,
) -> Result<(), EngineError> {
    let len = problem_context.trim().len();
    if !(MIN_PROBLEM_LEN..=MAX_PROBLEM_LEN).contains(&len) {
        return Err(EngineError::Validation(format!(
            "problemContext length {len} outside [{MIN_PROBLEM_LEN}, {MAX_PROBLEM_LEN}]"
        )));
    }
    if config.generations < 1 {
        return Err(EngineError::Validation(
            "generations must be at least 1".to_owned(),
        ));
    }
    if config.population_size < 1 {
        return Err(EngineError::Validation(
            "populationSize must be at least 1".to_owned(),
        ));
    }
    if config.top_select_count < 1 {
        return Err(EngineError::Validation(
            "topSelectCount must be at least 1".to_owned(),
        ));
    }
    if !(0.0..=1.0).contains(&config.offspring_ratio) {
        return Err(EngineError::Validation(format!(
            "offspringRatio {} outside [0, 1]",
            config.offspring_ratio
        )));
    }
    if config.diversification_factor <= 0.0 {
        return Err(EngineError::Validation(format!(
            "diversificationFactor {} must be positive",
            config.diversification_factor
        )));
    }
    if config.model.trim().is_empty() {
        return Err(EngineError::Validation("model must be set".to_owned()));
    }
    if preferences.max_capex <= 0.0 {
        return Err(EngineError::Validation(format!(
            "maxCapex {} must be positive",
            preferences.max_capex
        )));
    }

    if config.top_select_count > config.population_size {
        config.top_select_count = config.population_size;
    }
    Ok(())
}

/// Create a job and enqueue its first orchestrator check.
///
/// The orchestrate task carries an idempotency key derived from the job id,
/// so a replayed submission cannot double-start the loop.
pub async fn submit_job(
    pool: &PgPool,
    queue: &dyn TaskQueue,
    job_id: Option<String>,
    problem_context: &str,
    preferences: &Preferences,
    mut config: EvolutionConfig,
) -> Result<JobRow, EngineError> {
    validate_job_spec(problem_context, preferences, &mut config)?;

    let id = job_id.unwrap_or_else(|| format!("job_{}", Uuid::new_v4().simple()));
    let job = jobs::create_job(pool, &id, problem_context.trim(), preferences, &config).await?;

    let first_check = OrchestrateTask {
        job_id: id.clone(),
        check_attempt: 0,
    };
    let key = format!("{id}_submit");
    queue
        .enqueue_orchestrate(&first_check, Utc::now(), Some(&key))
        .await?;

    tracing::info!(job_id = %id, "job submitted");
    Ok(job)
}

#[cfg(test)]
mod tests {
    use super::*;
    use evosolve_db::models::EnricherMode;

    fn preferences() -> Preferences {
        Preferences {
            max_capex: 10.0,
            min_profits: 1.0,
            target_return: 3.0,
            timeline_months: 36,
        }
    }

    fn config() -> EvolutionConfig {
        EvolutionConfig {
            generations: 2,
            population_size: 4,
            top_select_count: 2,
            offspring_ratio: 0.5,
            diversification_factor: 0.05,
            model: "gpt-4.1-mini".to_owned(),
            enricher_mode: EnricherMode::Batch,
            reenrich_carried: false,
        }
    }

    #[test]
    fn valid_spec_passes() {
        let mut cfg = config();
        validate_job_spec("A perfectly fine problem statement", &preferences(), &mut cfg)
            .expect("should validate");
        assert_eq!(cfg.top_select_count, 2);
    }

    #[test]
    fn short_problem_is_rejected() {
        let mut cfg = config();
        let err = validate_job_spec("too short", &preferences(), &mut cfg).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn oversized_problem_is_rejected() {
        let mut cfg = config();
        let long = "x".repeat(MAX_PROBLEM_LEN + 1);
        assert!(validate_job_spec(&long, &preferences(), &mut cfg).is_err());
    }

    #[test]
    fn offspring_ratio_bounds_are_enforced() {
        let mut cfg = config();
        cfg.offspring_ratio = 1.2;
        assert!(validate_job_spec("A fine problem statement", &preferences(), &mut cfg).is_err());
    }

    #[test]
    fn oversized_top_select_is_capped_to_population() {
        let mut cfg = config();
        cfg.top_select_count = 10;
        validate_job_spec("A fine problem statement", &preferences(), &mut cfg).unwrap();
        assert_eq!(cfg.top_select_count, cfg.population_size);
    }

    #[test]
    fn zero_generations_rejected() {
        let mut cfg = config();
        cfg.generations = 0;
        assert!(validate_job_spec("A fine problem statement", &preferences(), &mut cfg).is_err());
    }
}

//! The ranker worker: score, order, and select. Pure computation; the only
//! phase with no LLM call.

use evosolve_db::models::{JobRow, Phase};
use evosolve_db::queries::generations;

use crate::error::EngineError;
use crate::evolve::scoring::{rank, select_top_performers};
use crate::worker::{PhaseOutcome, WorkerContext};

/// Run the ranker for one generation.
pub async fn run(
    ctx: &WorkerContext<'_>,
    job: &JobRow,
    generation: u32,
) -> Result<PhaseOutcome, EngineError> {
    let r#gen = generations::get_generation(ctx.pool, &job.id, generation)
        .await?
        .ok_or_else(|| {
            EngineError::Validation(format!(
                "generation {generation} of job {} has no enricher results",
                job.id
            ))
        })?;

    if r#gen.ranker_complete {
        tracing::info!(job_id = %job.id, generation, "ranker already complete, skipping");
        return Ok(PhaseOutcome::Skipped);
    }

    let enriched = r#gen
        .enriched_ideas
        .map(|j| j.0)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            EngineError::NumericValidation(format!(
                "generation {generation} of job {} has no enriched ideas to rank",
                job.id
            ))
        })?;

    generations::mark_phase_started(ctx.pool, &job.id, generation, Phase::Ranker).await?;

    let config = &job.evolution_config.0;
    let outcome = rank(
        &enriched,
        &job.preferences.0,
        config.diversification_factor,
    )?;
    let top_performers =
        select_top_performers(&outcome.solutions, config.top_select_count as usize);

    generations::save_ranker_results(
        ctx.pool,
        &job.id,
        generation,
        &outcome.solutions,
        &top_performers,
        outcome.top_score,
        outcome.avg_score,
    )
    .await?;

    tracing::info!(
        job_id = %job.id,
        generation,
        solutions = outcome.solutions.len(),
        top_performers = top_performers.len(),
        top_score = outcome.top_score,
        "ranker complete"
    );

    Ok(PhaseOutcome::Completed)
}

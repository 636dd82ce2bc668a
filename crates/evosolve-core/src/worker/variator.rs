//! The variator worker: produce one generation's population of ideas.

use evosolve_db::models::{JobRow, Phase, ScoredIdea};
use evosolve_db::queries::generations;

use crate::error::EngineError;
use crate::evolve::{merge_population, normalize_new_ideas, request_split};
use crate::llm::LlmRequest;
use crate::llm::parse::parse_tolerant;
use crate::llm::prompts::variator_prompt;
use crate::llm::schema::{ideas_from_response, variator_schema};
use crate::worker::{PhaseOutcome, WorkerContext, record_llm_call};

/// Run the variator for one generation.
///
/// The persisted population is the carried top performers (generation > 1)
/// followed by the new ideas the model produced, totalling exactly
/// `population_size`.
pub async fn run(
    ctx: &WorkerContext<'_>,
    job: &JobRow,
    generation: u32,
) -> Result<PhaseOutcome, EngineError> {
    let r#gen = generations::get_generation(ctx.pool, &job.id, generation).await?;
    if r#gen.as_ref().is_some_and(|g| g.variator_complete) {
        tracing::info!(job_id = %job.id, generation, "variator already complete, skipping");
        return Ok(PhaseOutcome::Skipped);
    }
    let attempt = r#gen.map(|g| g.variator_attempt).unwrap_or(0);

    generations::mark_phase_started(ctx.pool, &job.id, generation, Phase::Variator).await?;

    let config = &job.evolution_config.0;
    let carried = carried_top_performers(ctx, job, generation).await?;
    let split = request_split(
        config.population_size,
        config.offspring_ratio,
        carried.len() as u32,
        !carried.is_empty(),
    );
    let requested = (split.offspring + split.wildcards) as usize;

    tracing::info!(
        job_id = %job.id,
        generation,
        carried = carried.len(),
        offspring = split.offspring,
        wildcards = split.wildcards,
        "running variator"
    );

    let mut new_ideas = if requested == 0 {
        Vec::new()
    } else {
        let request = LlmRequest {
            model: config.model.clone(),
            phase: Phase::Variator,
            prompt: variator_prompt(&job.problem_context, generation, split, &carried),
            schema: variator_schema(),
            schema_name: "variator_response".to_owned(),
        };
        let response = ctx.llm.complete(&request).await?;

        let parsed = parse_tolerant(&response.content);
        record_llm_call(
            ctx.pool,
            &job.id,
            Phase::Variator,
            generation,
            attempt,
            &request,
            &response,
            parsed.as_ref().ok(),
        )
        .await?;

        let mut ideas = ideas_from_response(parsed?)?;
        if ideas.len() < requested {
            return Err(EngineError::LlmParse(format!(
                "model returned {} ideas, expected {requested}",
                ideas.len()
            )));
        }
        ideas.truncate(requested);
        ideas
    };

    normalize_new_ideas(&mut new_ideas, generation, split);
    let population = merge_population(&carried, new_ideas);

    generations::save_variator_results(ctx.pool, &job.id, generation, &population).await?;
    tracing::info!(
        job_id = %job.id,
        generation,
        population = population.len(),
        "variator complete"
    );

    Ok(PhaseOutcome::Completed)
}

/// Top performers forwarded from the previous generation, if any.
async fn carried_top_performers(
    ctx: &WorkerContext<'_>,
    job: &JobRow,
    generation: u32,
) -> Result<Vec<ScoredIdea>, EngineError> {
    if generation <= 1 {
        return Ok(Vec::new());
    }
    let prev = generations::get_generation(ctx.pool, &job.id, generation - 1).await?;
    Ok(prev
        .and_then(|g| g.top_performers.map(|j| j.0))
        .unwrap_or_default())
}

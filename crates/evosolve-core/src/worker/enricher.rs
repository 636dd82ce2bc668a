//! The enricher worker: attach a business case to every idea in a
//! generation.
//!
//! Two execution modes: `batch` (one LLM call for the whole population) and
//! `per_idea` (bounded fan-out of one call per idea, consulting the shared
//! content-addressed cache first).

use std::collections::HashMap;

use futures::StreamExt;
use sha2::{Digest, Sha256};

use evosolve_db::models::{BusinessCase, EnrichedIdea, Idea, JobRow, Phase};
use evosolve_db::queries::{cache, generations};

use crate::error::EngineError;
use crate::llm::LlmRequest;
use crate::llm::parse::parse_tolerant;
use crate::llm::prompts::{enricher_batch_prompt, enricher_idea_prompt};
use crate::llm::schema::{EnrichedItem, enricher_schema, enriched_from_response};
use crate::worker::{PhaseOutcome, WorkerContext, record_llm_call};

/// Bump when the business-case shape changes; keys the cache alongside the
/// content hash.
const SCHEMA_VERSION: &str = "v1";

/// Run the enricher for one generation.
pub async fn run(
    ctx: &WorkerContext<'_>,
    job: &JobRow,
    generation: u32,
) -> Result<PhaseOutcome, EngineError> {
    let r#gen = generations::get_generation(ctx.pool, &job.id, generation)
        .await?
        .ok_or_else(|| {
            EngineError::Validation(format!(
                "generation {generation} of job {} has no variator results",
                job.id
            ))
        })?;

    if r#gen.enricher_complete {
        tracing::info!(job_id = %job.id, generation, "enricher already complete, skipping");
        return Ok(PhaseOutcome::Skipped);
    }
    let attempt = r#gen.enricher_attempt;

    let ideas = r#gen
        .ideas
        .map(|j| j.0)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            EngineError::Validation(format!(
                "generation {generation} of job {} has no ideas to enrich",
                job.id
            ))
        })?;

    generations::mark_phase_started(ctx.pool, &job.id, generation, Phase::Enricher).await?;

    let config = &job.evolution_config.0;

    // Carried top performers keep their prior enrichment unless the job
    // opted into re-enrichment.
    let carried_cases = if generation > 1 && !config.reenrich_carried {
        prior_enrichments(ctx, job, generation).await?
    } else {
        HashMap::new()
    };

    let to_enrich: Vec<Idea> = ideas
        .iter()
        .filter(|i| !carried_cases.contains_key(&i.idea_id))
        .cloned()
        .collect();

    tracing::info!(
        job_id = %job.id,
        generation,
        mode = %config.enricher_mode,
        total = ideas.len(),
        carried = carried_cases.len(),
        to_enrich = to_enrich.len(),
        "running enricher"
    );

    let newly_enriched: Vec<EnrichedItem> = if to_enrich.is_empty() {
        Vec::new()
    } else {
        match config.enricher_mode {
            evosolve_db::models::EnricherMode::Batch => {
                enrich_batch(ctx, job, generation, attempt, &to_enrich).await?
            }
            evosolve_db::models::EnricherMode::PerIdea => {
                enrich_per_idea(ctx, job, generation, attempt, &to_enrich).await?
            }
        }
    };

    let by_id: HashMap<&str, &BusinessCase> = newly_enriched
        .iter()
        .map(|e| (e.idea_id.as_str(), &e.business_case))
        .collect();

    // Assemble in the original population order: the output must be a
    // permutation of `ideas` by idea_id.
    let mut enriched = Vec::with_capacity(ideas.len());
    for idea in &ideas {
        let business_case = carried_cases
            .get(&idea.idea_id)
            .or_else(|| by_id.get(idea.idea_id.as_str()).copied())
            .cloned()
            .ok_or_else(|| {
                EngineError::LlmParse(format!("no enrichment returned for {}", idea.idea_id))
            })?;
        enriched.push(EnrichedIdea {
            idea: idea.clone(),
            business_case,
        });
    }

    generations::save_enricher_results(ctx.pool, &job.id, generation, &enriched).await?;
    tracing::info!(
        job_id = %job.id,
        generation,
        enriched = enriched.len(),
        "enricher complete"
    );

    Ok(PhaseOutcome::Completed)
}

/// Business cases carried forward from the previous generation's top
/// performers, keyed by idea id.
async fn prior_enrichments(
    ctx: &WorkerContext<'_>,
    job: &JobRow,
    generation: u32,
) -> Result<HashMap<String, BusinessCase>, EngineError> {
    let prev = generations::get_generation(ctx.pool, &job.id, generation - 1).await?;
    Ok(prev
        .and_then(|g| g.top_performers.map(|j| j.0))
        .unwrap_or_default()
        .into_iter()
        .map(|s| (s.enriched.idea.idea_id.clone(), s.enriched.business_case))
        .collect())
}

/// One LLM call for the whole population.
async fn enrich_batch(
    ctx: &WorkerContext<'_>,
    job: &JobRow,
    generation: u32,
    attempt: i32,
    ideas: &[Idea],
) -> Result<Vec<EnrichedItem>, EngineError> {
    let config = &job.evolution_config.0;
    let request = LlmRequest {
        model: config.model.clone(),
        phase: Phase::Enricher,
        prompt: enricher_batch_prompt(&job.problem_context, ideas),
        schema: enricher_schema(),
        schema_name: "enricher_response".to_owned(),
    };
    let response = ctx.llm.complete(&request).await?;

    let parsed = parse_tolerant(&response.content);
    record_llm_call(
        ctx.pool,
        &job.id,
        Phase::Enricher,
        generation,
        attempt,
        &request,
        &response,
        parsed.as_ref().ok(),
    )
    .await?;

    enriched_from_response(parsed?)
}

/// Bounded fan-out of one call per idea, preserving input order.
async fn enrich_per_idea(
    ctx: &WorkerContext<'_>,
    job: &JobRow,
    generation: u32,
    attempt: i32,
    ideas: &[Idea],
) -> Result<Vec<EnrichedItem>, EngineError> {
    let concurrency = ctx.enricher_concurrency.max(1);

    let mut pending: Vec<
        std::pin::Pin<Box<dyn std::future::Future<Output = Result<EnrichedItem, EngineError>> + Send + '_>>,
    > = Vec::with_capacity(ideas.len());
    for idea in ideas {
        pending.push(Box::pin(enrich_one(ctx, job, generation, attempt, idea)));
    }

    let results: Vec<Result<EnrichedItem, EngineError>> =
        futures::stream::iter(pending)
            .buffered(concurrency)
            .collect()
            .await;

    results.into_iter().collect()
}

/// Enrich a single idea, consulting the shared cache first.
async fn enrich_one(
    ctx: &WorkerContext<'_>,
    job: &JobRow,
    generation: u32,
    attempt: i32,
    idea: &Idea,
) -> Result<EnrichedItem, EngineError> {
    let config = &job.evolution_config.0;
    let key = cache_key(&job.problem_context, idea, &config.model);

    if let Some(case) = cache::get_cached(ctx.pool, &key).await? {
        tracing::debug!(job_id = %job.id, idea_id = %idea.idea_id, "enrichment cache hit");
        return Ok(EnrichedItem {
            idea_id: idea.idea_id.clone(),
            business_case: case,
        });
    }

    let request = LlmRequest {
        model: config.model.clone(),
        phase: Phase::Enricher,
        prompt: enricher_idea_prompt(&job.problem_context, idea),
        schema: enricher_schema(),
        schema_name: "enricher_response".to_owned(),
    };
    let response = ctx.llm.complete(&request).await?;

    let parsed = parse_tolerant(&response.content);
    record_llm_call(
        ctx.pool,
        &job.id,
        Phase::Enricher,
        generation,
        attempt,
        &request,
        &response,
        parsed.as_ref().ok(),
    )
    .await?;

    let items = enriched_from_response(parsed?)?;
    let business_case = items
        .into_iter()
        .find(|e| e.idea_id == idea.idea_id)
        .map(|e| e.business_case)
        .ok_or_else(|| {
            EngineError::LlmParse(format!("response does not cover idea {}", idea.idea_id))
        })?;

    // Write-once: losing the race to another worker is fine.
    if let Err(e) = cache::put_cached(ctx.pool, &key, &business_case, &config.model).await {
        tracing::warn!(idea_id = %idea.idea_id, error = %e, "failed to write enrichment cache");
    }

    Ok(EnrichedItem {
        idea_id: idea.idea_id.clone(),
        business_case,
    })
}

/// Content hash over everything that determines an enrichment.
fn cache_key(problem_context: &str, idea: &Idea, model: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(problem_context.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(idea.title.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(idea.description.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(idea.core_mechanism.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(model.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(SCHEMA_VERSION.as_bytes());
    hex::encode(hasher.finalize())
}

//! `evosolve submit` command: create a job directly against the store and
//! enqueue its first orchestrator check.

use anyhow::{Result, anyhow};
use sqlx::PgPool;

use evosolve_core::queue::PgTaskQueue;
use evosolve_core::submit::submit_job;
use evosolve_db::models::{EnricherMode, EvolutionConfig, Preferences};

/// Flags for the submit command.
pub struct SubmitOptions {
    pub problem: String,
    pub generations: u32,
    pub population: u32,
    pub top_select: u32,
    pub offspring_ratio: f64,
    pub diversification_factor: f64,
    pub max_capex: f64,
    pub min_profits: f64,
    pub target_return: f64,
    pub timeline_months: u32,
    pub model: String,
    pub per_idea_enrichment: bool,
    pub reenrich_carried: bool,
}

/// Run the submit command.
pub async fn run_submit(pool: &PgPool, options: &SubmitOptions) -> Result<()> {
    let preferences = Preferences {
        max_capex: options.max_capex,
        min_profits: options.min_profits,
        target_return: options.target_return,
        timeline_months: options.timeline_months,
    };
    let config = EvolutionConfig {
        generations: options.generations,
        population_size: options.population,
        top_select_count: options.top_select,
        offspring_ratio: options.offspring_ratio,
        diversification_factor: options.diversification_factor,
        model: options.model.clone(),
        enricher_mode: if options.per_idea_enrichment {
            EnricherMode::PerIdea
        } else {
            EnricherMode::Batch
        },
        reenrich_carried: options.reenrich_carried,
    };

    let queue = PgTaskQueue::new(pool.clone());
    let job = submit_job(pool, &queue, None, &options.problem, &preferences, config)
        .await
        .map_err(|e| anyhow!("{e}"))?;

    println!("Submitted job {}", job.id);
    println!(
        "  generations={} population={} topSelect={}",
        job.evolution_config.0.generations,
        job.evolution_config.0.population_size,
        job.evolution_config.0.top_select_count,
    );
    println!();
    println!("Track it with `evosolve status {}`.", job.id);
    println!("A running `evosolve serve` instance will pick it up from the queue.");

    Ok(())
}

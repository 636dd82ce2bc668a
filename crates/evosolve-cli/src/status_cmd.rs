//! `evosolve status` command: show job progress and per-generation phases.

use anyhow::{Context, Result};
use sqlx::PgPool;

use evosolve_db::models::GenerationRow;
use evosolve_db::queries::{generations, jobs};

/// Run the status command.
///
/// When `job_id` is `Some`, shows detailed status for that job.
/// When `None`, lists all jobs with a progress summary.
pub async fn run_status(pool: &PgPool, job_id: Option<&str>) -> Result<()> {
    match job_id {
        Some(id) => run_job_status(pool, id).await,
        None => run_all_jobs_status(pool).await,
    }
}

/// Show detailed status for a single job.
async fn run_job_status(pool: &PgPool, job_id: &str) -> Result<()> {
    let job = jobs::get_job(pool, job_id)
        .await?
        .with_context(|| format!("job {job_id} not found"))?;

    let config = &job.evolution_config.0;
    println!("Job: {}", job.id);
    println!("Status: {}", job.status);
    println!(
        "Position: generation {}/{} ({})",
        job.current_generation, config.generations, job.current_phase
    );
    println!(
        "Config: population={} topSelect={} offspringRatio={} model={}",
        config.population_size, config.top_select_count, config.offspring_ratio, config.model
    );
    if let Some(completed_at) = job.completed_at {
        println!(
            "Completed: {}",
            completed_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    if let Some(error) = &job.error {
        println!("Error: {error}");
    }
    println!();

    let gens = generations::list_generations(pool, job_id).await?;
    if gens.is_empty() {
        println!("No generations started yet.");
        return Ok(());
    }

    println!("Generations:");
    for r#gen in &gens {
        println!(
            "  gen {}: variator[{}] enricher[{}] ranker[{}]{}",
            r#gen.generation,
            phase_icon(r#gen, "variator"),
            phase_icon(r#gen, "enricher"),
            phase_icon(r#gen, "ranker"),
            if r#gen.generation_complete {
                format!(
                    "  top={:.2} avg={:.2}",
                    r#gen.top_score.unwrap_or(0.0),
                    r#gen.avg_score.unwrap_or(0.0)
                )
            } else {
                String::new()
            }
        );
        for (phase, error) in [
            ("variator", &r#gen.variator_error),
            ("enricher", &r#gen.enricher_error),
            ("ranker", &r#gen.ranker_error),
        ] {
            if let Some(error) = error {
                println!("      {phase} error: {error}");
            }
        }
    }

    Ok(())
}

fn phase_icon(r#gen: &GenerationRow, phase: &str) -> &'static str {
    let (started, complete, error) = match phase {
        "variator" => (
            r#gen.variator_started,
            r#gen.variator_complete,
            r#gen.variator_error.is_some(),
        ),
        "enricher" => (
            r#gen.enricher_started,
            r#gen.enricher_complete,
            r#gen.enricher_error.is_some(),
        ),
        _ => (
            r#gen.ranker_started,
            r#gen.ranker_complete,
            r#gen.ranker_error.is_some(),
        ),
    };
    if complete {
        "+"
    } else if error {
        "!"
    } else if started {
        "*"
    } else {
        "."
    }
}

/// List all jobs with a progress summary.
async fn run_all_jobs_status(pool: &PgPool) -> Result<()> {
    let all_jobs = jobs::list_jobs(pool).await?;

    if all_jobs.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }

    println!(
        "{:<38} {:<12} {:<12} {:<22}",
        "ID", "STATUS", "POSITION", "CREATED"
    );
    println!("{}", "-".repeat(86));

    for job in &all_jobs {
        let position = format!(
            "g{}/{} {}",
            job.current_generation, job.evolution_config.0.generations, job.current_phase
        );
        println!(
            "{:<38} {:<12} {:<12} {:<22}",
            job.id,
            job.status.to_string(),
            position,
            job.created_at.format("%Y-%m-%d %H:%M:%S"),
        );
    }

    Ok(())
}

//! `evosolve results` command: print a completed job's ranked solutions.

use anyhow::{Context, Result};
use sqlx::PgPool;

use evosolve_db::models::JobStatus;
use evosolve_db::queries::jobs;

/// Run the results command.
pub async fn run_results(pool: &PgPool, job_id: &str, all: bool) -> Result<()> {
    let job = jobs::get_job(pool, job_id)
        .await?
        .with_context(|| format!("job {job_id} not found"))?;

    match job.status {
        JobStatus::Completed => {}
        JobStatus::Failed => {
            println!(
                "Job {} failed: {}",
                job.id,
                job.error.as_deref().unwrap_or("unknown reason")
            );
            return Ok(());
        }
        other => {
            println!("Job {} is still {other}; no results yet.", job.id);
            return Ok(());
        }
    }

    let solutions = if all {
        job.all_solutions.map(|j| j.0).unwrap_or_default()
    } else {
        job.top_solutions.map(|j| j.0).unwrap_or_default()
    };
    if solutions.is_empty() {
        println!("Job {} completed with no solutions.", job.id);
        return Ok(());
    }

    println!(
        "{} solutions for job {}:",
        if all { "All" } else { "Top" },
        job.id
    );
    println!();
    for solution in &solutions {
        let case = &solution.enriched.business_case;
        let flag = if solution.violates_preferences {
            "  [violates preferences]"
        } else {
            ""
        };
        println!(
            "#{} {} (score {:.2}){}",
            solution.rank,
            solution.enriched.idea.title,
            solution.score,
            flag
        );
        println!("    id: {}", solution.idea_id());
        println!("    {}", solution.enriched.idea.description);
        println!(
            "    npv={:.1}M capex={:.2}M likelihood={:.0}% timeline={:.0}mo",
            case.npv_success,
            case.capex_est,
            case.likelihood * 100.0,
            case.timeline_months,
        );
        if let Some(note) = &solution.preference_note {
            println!("    note: {note}");
        }
        println!();
    }

    if let Some(history) = job.generation_history.map(|j| j.0) {
        println!("Generation history:");
        for entry in &history {
            println!(
                "  gen {}: top={:.2} avg={:.2} ideas={}",
                entry.generation, entry.top_score, entry.avg_score, entry.idea_count
            );
        }
    }

    Ok(())
}

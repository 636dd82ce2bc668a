mod config;
mod results_cmd;
mod serve_cmd;
mod status_cmd;
mod submit_cmd;

use anyhow::Result;
use clap::{Parser, Subcommand};

use evosolve_db::pool;

use config::EvosolveConfig;

#[derive(Parser)]
#[command(
    name = "evosolve",
    about = "Distributed evolutionary search over business ideas, driven by an LLM"
)]
struct Cli {
    /// Database URL (overrides EVOSOLVE_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write an evosolve config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/evosolve")]
        db_url: String,
        /// LLM provider base URL
        #[arg(long, default_value = "https://api.openai.com/v1")]
        llm_base_url: String,
        /// Default model for submissions
        #[arg(long, default_value = "gpt-4.1-mini")]
        model: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the evosolve database (requires config file or env vars)
    DbInit,
    /// Run the HTTP surface and the queue dispatcher
    Serve {
        /// Bind address
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        /// Port
        #[arg(long, default_value_t = 8080)]
        port: u16,
        /// Serve HTTP only; a separate process drains the queue
        #[arg(long)]
        no_dispatcher: bool,
    },
    /// Submit a job
    Submit {
        /// Problem description (10 to 5000 characters)
        #[arg(long)]
        problem: String,
        /// Number of generations
        #[arg(long, default_value_t = 3)]
        generations: u32,
        /// Ideas per generation
        #[arg(long, default_value_t = 8)]
        population: u32,
        /// Top performers carried into the next generation
        #[arg(long, default_value_t = 3)]
        top_select: u32,
        /// Fraction of each population derived from top performers
        #[arg(long, default_value_t = 0.7)]
        offspring_ratio: f64,
        /// Reference capex for the diversification penalty, in millions USD
        #[arg(long, default_value_t = 0.05)]
        diversification_factor: f64,
        /// Capex ceiling in millions USD
        #[arg(long, default_value_t = 10.0)]
        max_capex: f64,
        /// Minimum acceptable profits in millions USD
        #[arg(long, default_value_t = 1.0)]
        min_profits: f64,
        /// Target return multiple
        #[arg(long, default_value_t = 3.0)]
        target_return: f64,
        /// Timeline horizon in months
        #[arg(long, default_value_t = 36)]
        timeline_months: u32,
        /// Model override (defaults to the configured model)
        #[arg(long)]
        model: Option<String>,
        /// Enrich one idea per LLM call instead of one batched call
        #[arg(long)]
        per_idea_enrichment: bool,
        /// Re-enrich carried top performers each generation
        #[arg(long)]
        reenrich_carried: bool,
    },
    /// Show job status and phase progress (omit job_id to list all jobs)
    Status {
        /// Job ID to show status for (omit to list all jobs)
        job_id: Option<String>,
    },
    /// Show a completed job's ranked solutions
    Results {
        /// Job ID to show results for
        job_id: String,
        /// Show all solutions instead of the top 10
        #[arg(long)]
        all: bool,
    },
}

/// Execute the `evosolve init` command: write the config file.
fn cmd_init(db_url: &str, llm_base_url: &str, model: &str, force: bool) -> Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let secret = config::generate_dispatch_secret();

    let cfg = config::ConfigFile {
        database: config::DatabaseSection {
            url: db_url.to_string(),
        },
        dispatch: config::DispatchSection {
            secret: secret.clone(),
        },
        llm: config::LlmSection {
            base_url: llm_base_url.to_string(),
            api_key: None,
            model: model.to_string(),
            structured_output: true,
        },
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!("  dispatch.secret = {}...{}", &secret[..8], &secret[56..]);
    println!("  llm.base_url = {llm_base_url}");
    println!("  llm.model = {model}");
    println!();
    println!("Set EVOSOLVE_LLM_API_KEY before serving.");
    println!("Next: run `evosolve db-init` to create and migrate the database.");

    Ok(())
}

/// Execute the `evosolve db-init` command: create database and run
/// migrations.
async fn cmd_db_init(cli_db_url: Option<&str>) -> Result<()> {
    let resolved = EvosolveConfig::resolve(cli_db_url)?;

    println!("Initializing evosolve database...");

    pool::ensure_database_exists(&resolved.db_config).await?;
    let db_pool = pool::create_pool(&resolved.db_config).await?;
    pool::run_migrations(&db_pool).await?;

    let counts = pool::table_counts(&db_pool).await?;
    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }

    db_pool.close().await;

    println!("evosolve db-init complete.");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init {
            db_url,
            llm_base_url,
            model,
            force,
        } => {
            cmd_init(&db_url, &llm_base_url, &model, force)?;
        }
        Commands::DbInit => {
            cmd_db_init(cli.database_url.as_deref()).await?;
        }
        Commands::Serve {
            bind,
            port,
            no_dispatcher,
        } => {
            let resolved = EvosolveConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let options = serve_cmd::ServeOptions {
                bind,
                port,
                no_dispatcher,
            };
            let result = serve_cmd::run_serve(db_pool.clone(), &resolved, &options).await;
            db_pool.close().await;
            result?;
        }
        Commands::Submit {
            problem,
            generations,
            population,
            top_select,
            offspring_ratio,
            diversification_factor,
            max_capex,
            min_profits,
            target_return,
            timeline_months,
            model,
            per_idea_enrichment,
            reenrich_carried,
        } => {
            let resolved = EvosolveConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let options = submit_cmd::SubmitOptions {
                problem,
                generations,
                population,
                top_select,
                offspring_ratio,
                diversification_factor,
                max_capex,
                min_profits,
                target_return,
                timeline_months,
                model: model.unwrap_or_else(|| resolved.default_model.clone()),
                per_idea_enrichment,
                reenrich_carried,
            };
            let result = submit_cmd::run_submit(&db_pool, &options).await;
            db_pool.close().await;
            result?;
        }
        Commands::Status { job_id } => {
            let resolved = EvosolveConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = status_cmd::run_status(&db_pool, job_id.as_deref()).await;
            db_pool.close().await;
            result?;
        }
        Commands::Results { job_id, all } => {
            let resolved = EvosolveConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = results_cmd::run_results(&db_pool, &job_id, all).await;
            db_pool.close().await;
            result?;
        }
    }

    Ok(())
}

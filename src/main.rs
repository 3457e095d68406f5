#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::select;

mod api;
mod catalog;
mod error;
mod executor;
mod loader;
mod orchestrator;
mod pg;
mod preflight;
mod scheduler;
mod settings;

use crate::api::{ApiClient, ApiClientConfig};
use crate::catalog::CatalogStore;
use crate::executor::{ExecuteOptions, JobExecutor};
use crate::loader::DataLoader;
use crate::orchestrator::{JobOutcome, Orchestrator};
use crate::scheduler::Scheduler;
use crate::settings::{CoreOptions, Settings};

#[derive(Debug, Clone, Parser)]
#[command(version, about, subcommand_required = true)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    /// Runs the scheduler service
    Run(RunOptions),
    /// Executes a single job
    RunJob(RunJobOptions),
    /// Plans the dependency DAG and runs it once
    Orchestrate(OrchestrateOptions),
    /// Sweeps runs stuck in `running` to `failed`
    SweepStuck(SweepStuckOptions),
    /// Migrate the postgres database
    Migrate(MigrationOptions),
}

#[derive(Debug, Clone, Parser)]
pub struct RunOptions {
    #[command(flatten)]
    core: CoreOptions,
}

#[derive(Debug, Clone, Parser)]
pub struct RunJobOptions {
    /// Job id from the catalog
    job_id: i64,

    /// Resume the latest checkpointed run instead of starting fresh
    #[arg(long, default_value_t = false)]
    resume: bool,

    /// Per-run deadline override in seconds
    #[arg(long)]
    timeout_seconds: Option<u64>,

    /// Override the parameter list for a parameterized job (repeatable)
    #[arg(long = "parameter")]
    parameters: Vec<String>,

    #[command(flatten)]
    core: CoreOptions,
}

#[derive(Debug, Clone, Parser)]
pub struct OrchestrateOptions {
    /// Restrict the pass to these job ids (comma-separated)
    #[arg(long, value_delimiter = ',')]
    jobs: Option<Vec<i64>>,

    #[command(flatten)]
    core: CoreOptions,
}

#[derive(Debug, Clone, Parser)]
pub struct SweepStuckOptions {
    #[arg(long, env = "DATABASE_URL")]
    postgres_url: String,

    #[arg(long, env = "ETL_STUCK_RUN_THRESHOLD_HOURS", default_value_t = 24)]
    threshold_hours: u64,
}

#[derive(Debug, Clone, Parser)]
pub struct MigrationOptions {
    #[arg(long, env = "DATABASE_URL")]
    postgres_url: String,
}

struct Engine {
    settings: Settings,
    catalog: CatalogStore,
    executor: Arc<JobExecutor>,
}

async fn build_engine(core: CoreOptions) -> anyhow::Result<Engine> {
    let settings = Settings::from(core);
    settings::init_global(settings.clone());

    // Startup rails run before anything can touch the network or database.
    preflight::check_environment(&settings)?;
    preflight::check_api_host(&settings)?;

    if let Some(reason) = preflight::dry_run_status() {
        println!("Dry run enabled ({reason}): network and staging writes are blocked.");
    }

    let pool = pg::create_pool(&settings.database_url).await?;
    let catalog = CatalogStore::new(pool.clone());
    let client = ApiClient::new(ApiClientConfig::from_settings(&settings))?;
    let loader = DataLoader::new(pool, &settings);
    let executor = Arc::new(JobExecutor::new(
        catalog.clone(),
        loader,
        client,
        settings.clone(),
    ));

    Ok(Engine {
        settings,
        catalog,
        executor,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv_override();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(options) => {
            let engine = build_engine(options.core).await?;
            let scheduler = Scheduler::new(engine.catalog.clone(), engine.executor.clone());

            println!("Starting scheduler...");
            select! {
              scheduler_res = scheduler.clone().start() => {
                println!("Scheduler Service Stopped.");
                scheduler_res?;
              },
              _ = tokio::signal::ctrl_c() => println!("Received Ctrl-C.")
            }
        }
        Commands::RunJob(options) => {
            let engine = build_engine(options.core).await?;

            let opts = ExecuteOptions {
                resume: options.resume,
                timeout: options.timeout_seconds.map(Duration::from_secs),
                parameter_values: (!options.parameters.is_empty())
                    .then_some(options.parameters),
                ..Default::default()
            };

            let result = engine.executor.execute(options.job_id, opts).await?;
            println!(
                "Run {} finished: status={} records_loaded={} duration={:.1}s",
                result.run_id, result.status, result.records_loaded, result.duration_seconds
            );
            if let Some(error) = result.error_message {
                println!("Error: {error}");
            }

            let run = engine.catalog.run(result.run_id).await?;
            println!(
                "Catalog state: status={} records={} started_at={}",
                run.run_status, run.records_loaded, run.started_at
            );
            if run.run_status == "running" {
                println!("Run is resumable; re-run with --resume to continue.");
            }
        }
        Commands::Orchestrate(options) => {
            let engine = build_engine(options.core).await?;
            let orchestrator = Orchestrator::new(
                engine.catalog.clone(),
                engine.executor.clone(),
                engine.settings.max_parallel,
            );

            let report = match options.jobs {
                Some(job_ids) => {
                    orchestrator
                        .run_selected(&job_ids, ExecuteOptions::default())
                        .await?
                }
                None => orchestrator.run_all(ExecuteOptions::default()).await?,
            };

            println!(
                "Orchestrated pass: {} succeeded, {} failed, {} still running, {} skipped, {} records loaded",
                report.succeeded(),
                report.failed(),
                report.running(),
                report.skipped(),
                report.records_loaded()
            );
            for (job_id, outcome) in &report.outcomes {
                match outcome {
                    JobOutcome::Finished(result) => println!(
                        "  job {job_id}: {} ({} records)",
                        result.status, result.records_loaded
                    ),
                    JobOutcome::Skipped { reason } => {
                        println!("  job {job_id}: skipped ({reason})")
                    }
                    JobOutcome::DispatchFailed { error } => {
                        println!("  job {job_id}: dispatch failed ({error})")
                    }
                }
            }
        }
        Commands::SweepStuck(options) => {
            let pool = pg::create_pool(&options.postgres_url).await?;
            let catalog = CatalogStore::new(pool);
            let swept = catalog.sweep_stuck_runs(options.threshold_hours).await?;
            println!("Swept {swept} stuck runs to failed.");
        }
        Commands::Migrate(options) => {
            let pool = pg::create_pool(&options.postgres_url).await?;
            println!("Migrating database...");
            pg::migrate_pg(&pool).await?;
        }
    }

    println!("Program stopped.");

    Ok(())
}

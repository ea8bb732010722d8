use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use retl_core::StagedArtifactRef;
use retl_sync::{
    connect_post_store, maybe_build_scheduler, report_recent_runs_markdown, PipelineOrchestrator,
    PipelineRun, PostStore, SyncConfig,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "retl-cli")]
#[command(about = "Reddit extract-and-load pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, stage and load one run.
    Run,
    /// Run only the fetch unit and print the staged artifact reference.
    Fetch {
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Load a previously staged artifact into the store.
    Load {
        #[arg(long)]
        artifact: PathBuf,
        /// Run that owns the artifact; defaults to the run recorded in it.
        #[arg(long)]
        run_id: Option<Uuid>,
    },
    /// Create the target table if it does not exist.
    Migrate,
    /// Run the daily schedule until interrupted.
    Schedule,
    /// Summarize the most recent run reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

/// Cancels the token on ctrl-c so in-flight work stops at the next boundary.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run");
            token.cancel();
        }
    });
    cancel
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let summary = retl_sync::run_sync_once(&config, &cancel_on_ctrl_c()).await?;
            let fetch = summary.fetch.unwrap_or_default();
            let load = summary.load.unwrap_or_default();
            println!(
                "run complete: run_id={} pages={} records={} inserted={} skipped={}",
                summary.run_id, fetch.pages, fetch.records, load.inserted, load.skipped
            );
        }
        Commands::Fetch { out } => {
            config.credentials()?;
            let orchestrator = PipelineOrchestrator::from_config(&config).await?;
            let mut run = PipelineRun::new();
            let artifact = orchestrator.fetch(&mut run, &cancel_on_ctrl_c()).await?;
            let json = serde_json::to_string_pretty(&artifact)?;
            match out {
                Some(path) => {
                    std::fs::write(&path, &json)
                        .with_context(|| format!("writing {}", path.display()))?;
                    info!(path = %path.display(), "artifact reference written");
                }
                None => println!("{json}"),
            }
        }
        Commands::Load { artifact, run_id } => {
            let raw = std::fs::read_to_string(&artifact)
                .with_context(|| format!("reading {}", artifact.display()))?;
            let artifact: StagedArtifactRef =
                serde_json::from_str(&raw).context("parsing artifact reference")?;
            let orchestrator = PipelineOrchestrator::from_config(&config).await?;
            let run_id = run_id.unwrap_or(artifact.run_id);
            let mut run = PipelineRun::resume_after_fetch(run_id, artifact);
            let report = orchestrator.load(&mut run, &cancel_on_ctrl_c()).await?;
            println!(
                "load complete: run_id={} inserted={} skipped={}",
                run.run_id(),
                report.inserted,
                report.skipped
            );
        }
        Commands::Migrate => {
            let store = connect_post_store(&config.database_url).await?;
            store.ensure_schema().await?;
            println!("schema ready: {} rows in reddit_posts", store.count().await?);
        }
        Commands::Schedule => {
            config.credentials()?;
            let config = SyncConfig {
                scheduler_enabled: true,
                ..config
            };
            if let Some(mut sched) = maybe_build_scheduler(&config).await? {
                sched.start().await.context("starting scheduler")?;
                info!(cron = %config.schedule_cron, "scheduler started");
                tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
                sched.shutdown().await.context("stopping scheduler")?;
            }
        }
        Commands::Report { runs } => {
            println!("{}", report_recent_runs_markdown(runs, &config.reports_dir)?);
        }
    }

    Ok(())
}

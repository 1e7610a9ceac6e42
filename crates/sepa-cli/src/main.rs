use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use sepa_sync::{build_pipeline, build_scheduler, connect_pool, run_migrations, SyncConfig};
use tracing::info;
use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "sepa-cli")]
#[command(about = "SEPA price ingestion command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion for a publication date (default: today in the publisher's zone).
    Sync {
        #[arg(long, value_name = "YYYY-MM-DD")]
        date: Option<NaiveDate>,
        /// Load into an in-memory catalog; DATABASE_URL is not required.
        #[arg(long)]
        dry_run: bool,
    },
    /// Apply pending schema migrations.
    Migrate,
    /// Serve the product lookup API.
    Serve,
    /// Run ingestion on the configured cron schedule until interrupted.
    Schedule,
}

fn init_tracing(default_filter: &str) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing("info")?;

    let command = cli.command.unwrap_or(Commands::Sync {
        date: None,
        dry_run: false,
    });
    match command {
        Commands::Sync { date, dry_run } => {
            let summary = sepa_sync::run_sync_once_from_env(date, dry_run).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&summary).context("serializing run summary")?
            );
            if !summary.succeeded() {
                bail!(
                    "run {} failed: {}",
                    summary.run_id,
                    summary.first_error.as_deref().unwrap_or("unknown error")
                );
            }
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env()?;
            let pool = connect_pool(config.require_database_url()?, 1).await?;
            run_migrations(&pool).await?;
        }
        Commands::Serve => {
            sepa_web::serve_from_env().await?;
        }
        Commands::Schedule => {
            let config = SyncConfig::from_env()?;
            let pipeline = Arc::new(build_pipeline(config).await?);
            let mut sched = build_scheduler(pipeline).await?;
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

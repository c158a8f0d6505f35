use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use segmentation_queue::{
    config::AppConfig,
    db::{self, JobStore, PgJobStore},
    services::{
        inference::{HttpInferenceBackend, InferenceInvoker},
        notifier::{NotifierHandle, RedisNotifier},
        reconciler::Reconciler,
        scheduler::Scheduler,
    },
};

/// One-shot consistency tooling for the segmentation job table.
///
/// `fix` and `orphans` treat every `processing` row as orphaned, since this
/// process runs nothing. Only use them while the server is stopped.
#[derive(Parser)]
#[command(name = "reconcile")]
#[command(about = "Inspect and repair segmentation job status")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "warn", global = true)]
    log_level: String,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Report jobs in a project whose status is missing, invalid, or orphaned.
    Check {
        /// Project id to audit.
        #[arg(long)]
        scope: String,
    },

    /// Repair the issues `check` reports.
    Fix {
        #[arg(long)]
        scope: String,

        /// Report what would be repaired without writing anything.
        #[arg(long)]
        dry_run: bool,
    },

    /// Requeue or fail every `processing` job across all projects.
    Orphans,

    /// List a subject's recent jobs that have no readable status.
    Recent {
        #[arg(long)]
        subject: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries the JSON report.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .with_writer(std::io::stderr)
        .json()
        .init();

    let config = AppConfig::from_env()?;

    let db_pool = db::init_pool(&config.database_url).await?;
    let store: Arc<dyn JobStore> = Arc::new(PgJobStore::new(db_pool));

    let redis = Arc::new(RedisNotifier::new(&config.redis_url)?);
    let (notifier, notifier_task) = NotifierHandle::spawn(redis);

    let backend = HttpInferenceBackend::new(
        config.inference_url.clone(),
        config.inference_api_token.clone(),
    );
    let invoker = InferenceInvoker::new(Arc::new(backend), config.inference_timeout());
    let scheduler = Scheduler::new(config.scheduler_config(), store, invoker, notifier);
    // Nothing may be dispatched from here; requeued jobs wait for the server.
    scheduler.shutdown(Duration::ZERO).await;

    let reconciler = Reconciler::new(scheduler, config.reconciler_config());

    match cli.command {
        Command::Check { scope } => print(&reconciler.check_consistency(&scope).await?)?,
        Command::Fix { scope, dry_run } => {
            print(&reconciler.fix_consistency(&scope, dry_run).await?)?
        }
        Command::Orphans => print(&reconciler.reconcile_orphans().await?)?,
        Command::Recent { subject } => {
            print(&reconciler.verify_recent_submissions(&subject).await?)?
        }
    }

    drop(reconciler);
    notifier_task.await?;
    Ok(())
}

fn print<T: Serialize>(report: &T) -> Result<(), serde_json::Error> {
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}

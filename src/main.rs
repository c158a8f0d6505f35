use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use segmentation_queue::{
    app_state::AppState,
    config::AppConfig,
    db::{self, JobStore, PgJobStore},
    routes,
    services::{
        inference::{HttpInferenceBackend, InferenceInvoker},
        notifier::{NotifierHandle, RedisNotifier},
        reconciler::Reconciler,
        scheduler::Scheduler,
    },
};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing segmentation-queue server");
    describe_metrics();

    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");
    let store: Arc<dyn JobStore> = Arc::new(PgJobStore::new(db_pool));

    tracing::info!("Connecting to Redis for status events");
    let redis = Arc::new(RedisNotifier::new(&config.redis_url).expect("Failed to initialize Redis"));
    let (notifier, notifier_task) = NotifierHandle::spawn(redis.clone());

    let backend = HttpInferenceBackend::new(
        config.inference_url.clone(),
        config.inference_api_token.clone(),
    );
    let invoker = InferenceInvoker::new(Arc::new(backend), config.inference_timeout());

    let scheduler = Scheduler::new(config.scheduler_config(), store, invoker, notifier);
    let reconciler = Arc::new(Reconciler::new(
        scheduler.clone(),
        config.reconciler_config(),
    ));

    reconciler
        .startup()
        .await
        .expect("Startup reconciliation failed");

    let cancel = CancellationToken::new();
    let reconciler_task = {
        let reconciler = reconciler.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { reconciler.run(cancel).await })
    };

    let state = AppState::new(scheduler.clone(), redis);
    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    tracing::info!("Shutting down");
    cancel.cancel();
    if let Err(e) = reconciler_task.await {
        tracing::error!(error = %e, "Reconciler task ended abnormally");
    }

    scheduler.shutdown(config.shutdown_grace()).await;

    // The event channel closes once the last scheduler handle is gone. Jobs
    // still running past the grace period keep theirs, so bound the flush.
    drop(reconciler);
    drop(scheduler);
    if tokio::time::timeout(Duration::from_secs(5), notifier_task)
        .await
        .is_err()
    {
        tracing::warn!("Gave up flushing status events");
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
}

fn describe_metrics() {
    metrics::describe_counter!(
        "segmentation_jobs_submitted_total",
        "Total segmentation jobs submitted"
    );
    metrics::describe_counter!(
        "segmentation_jobs_completed_total",
        "Total segmentation jobs completed"
    );
    metrics::describe_counter!(
        "segmentation_jobs_failed_total",
        "Total segmentation jobs that failed after exhausting retries"
    );
    metrics::describe_counter!(
        "segmentation_jobs_retried_total",
        "Total failed attempts that were re-queued"
    );
    metrics::describe_counter!(
        "segmentation_jobs_cancelled_total",
        "Total segmentation jobs cancelled before starting"
    );
    metrics::describe_counter!(
        "segmentation_orphans_repaired_total",
        "Orphaned processing jobs requeued or failed by the reconciler"
    );
    metrics::describe_gauge!(
        "segmentation_queue_depth",
        "Current number of jobs waiting in the queue"
    );
    metrics::describe_gauge!(
        "segmentation_jobs_processing",
        "Current number of jobs holding a processing slot"
    );
    metrics::describe_histogram!(
        "segmentation_inference_seconds",
        "Time spent in the inference backend per attempt"
    );
}

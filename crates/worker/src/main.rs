use std::sync::Arc;

use anyhow::Context;
use sqlx::PgPool;

use casefile_ai::GenerationClient;
use casefile_infra::CasefileConfig;
use casefile_infra::generation::build_client;
use casefile_infra::investigations::{InvestigationReader, PostgresInvestigationReader};
use casefile_infra::jobs::{AiJobWorker, JobQueueService, JobStore, PostgresJobStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    casefile_observability::init();

    let config = CasefileConfig::from_env().context("invalid configuration")?;
    let client = build_client(&config.generation).context("failed to build generation client")?;

    let pool = PgPool::connect(database_url(&config)?)
        .await
        .context("failed to connect to Postgres")?;
    let store = PostgresJobStore::new(pool.clone());
    store.ensure_schema().await.context("failed to prepare ai_jobs schema")?;
    let reader = PostgresInvestigationReader::new(pool);
    run(store, Arc::new(reader), client, config).await
}

/// The worker has no enqueue surface of its own; it only drains the shared
/// Postgres queue.
fn database_url(config: &CasefileConfig) -> anyhow::Result<&str> {
    match config.database_url.as_deref() {
        Some(url) if config.use_postgres => Ok(url),
        _ => anyhow::bail!("DATABASE_URL must be set and CASEFILE_USE_POSTGRES enabled to run the worker"),
    }
}

async fn run<S: JobStore + 'static>(
    store: S,
    investigations: Arc<dyn InvestigationReader>,
    client: Arc<dyn GenerationClient>,
    config: CasefileConfig,
) -> anyhow::Result<()> {
    let queue = Arc::new(JobQueueService::new(store, investigations, config.queue.clone()));
    let worker = AiJobWorker::new(queue, client, config.generation.models.clone(), config.worker.clone());

    tracing::info!(
        worker = %config.worker.worker_id,
        provider = %config.generation.provider,
        max_attempts = config.queue.max_attempts,
        "starting AI job worker"
    );
    let handle = worker.spawn();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested");

    let stats = handle.stats();
    handle.shutdown().await.context("worker task panicked")?;
    tracing::info!(?stats, "AI job worker exited");
    Ok(())
}

// Copyright (c) Pgvault Contributors
// SPDX-License-Identifier: Apache-2.0

//! Pgvault worker entry point: hosts the job queue, the worker pool, and
//! the backup scheduler.

use clap::Parser;
use pgvault_service::{
    common::{
        metrics::{self, SchedulerMetricSet, WorkerMetricSet},
        telemetry,
    },
    config::ServiceConfig,
    db,
    logs::DbLogWriter,
    queue::JobQueue,
    scheduler::Scheduler,
    storage::ArtifactStore,
    worker::{tool_version, WorkerContext},
};
use tokio_util::sync::CancellationToken;

/// Run the pgvault worker service.
#[derive(Parser, Debug)]
#[command(name = env!("CARGO_BIN_NAME"), version, rename_all = "kebab-case")]
struct Args {
    /// Size of the worker pool; overrides WORKER_COUNT.
    #[arg(long)]
    workers: Option<usize>,
    /// Development mode: pretty log output and a debug default filter.
    #[arg(long)]
    dev: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    telemetry::init_tracing_subscriber(args.dev)?;

    let config = ServiceConfig::from_env()?;
    let worker_count = args.workers.unwrap_or(config.worker_count);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        worker_count,
        "starting pgvault worker service"
    );

    db::run_pending_migrations(&config.database.url()).await?;

    // Surface the external tool versions early; a missing pg_dump means
    // every backup job will fail.
    match tool_version("pg_dump").await {
        Some(version) => tracing::info!(%version, "found pg_dump on PATH"),
        None => tracing::warn!("pg_dump not found on PATH; backup jobs will fail"),
    }
    match tool_version("psql").await {
        Some(version) => tracing::info!(%version, "found psql on PATH"),
        None => tracing::warn!("psql not found on PATH; restore jobs will fail"),
    }

    let registry = prometheus::Registry::new();
    metrics::export_build_info(&registry, env!("CARGO_PKG_VERSION"));
    let cancel = CancellationToken::new();
    let metrics_task = tokio::spawn(metrics::serve_metrics(
        config.metrics_address,
        registry.clone(),
        cancel.child_token(),
    ));

    let pool = db::establish_pool(&config.database.url()).await?;
    let store = ArtifactStore::from_config(&config.object_store)?;

    let queue = JobQueue::new(pool.clone(), &registry);
    let ctx = WorkerContext {
        pool: pool.clone(),
        queue: queue.clone(),
        store,
        temp_dir: config.temp_dir.clone(),
        retention: config.retention,
        log: DbLogWriter::new(pool.clone(), "WORKER"),
        metrics: WorkerMetricSet::new(&registry),
    };
    queue.start(ctx, worker_count).await?;

    let scheduler = Scheduler::new(
        pool.clone(),
        queue.clone(),
        SchedulerMetricSet::new(&registry),
        cancel.child_token(),
    );
    let scheduler_task = scheduler.spawn();

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received, stopping worker service...");

    cancel.cancel();
    let _ = scheduler_task.await;
    queue.stop().await;
    let _ = metrics_task.await;

    tracing::info!("graceful shutdown complete");
    Ok(())
}

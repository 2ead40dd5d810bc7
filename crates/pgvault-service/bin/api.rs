// Copyright (c) Pgvault Contributors
// SPDX-License-Identifier: Apache-2.0

//! Pgvault admin API entry point.

use std::sync::Arc;

use clap::Parser;
use pgvault_service::{
    api::{self, ApiState},
    common::{metrics, telemetry},
    config::{ConfigError, ServiceConfig},
    db,
    queue::JobQueue,
};
use tokio_util::sync::CancellationToken;

/// Run the pgvault admin API.
#[derive(Parser, Debug)]
#[command(name = env!("CARGO_BIN_NAME"), version, rename_all = "kebab-case")]
struct Args {
    /// Port to serve the admin API on.
    #[arg(long, default_value_t = 8080)]
    port: u16,
    /// Development mode: pretty log output and a debug default filter.
    #[arg(long)]
    dev: bool,
    /// Apply pending control-database migrations before serving.
    #[arg(long)]
    migrate: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    telemetry::init_tracing_subscriber(args.dev)?;

    let config = ServiceConfig::from_env()?;
    let api_key = config
        .api_key
        .clone()
        .ok_or(ConfigError::MissingVar("API_KEY"))?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        port = args.port,
        "starting pgvault API service"
    );

    if args.migrate {
        db::run_pending_migrations(&config.database.url()).await?;
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

    // The queue is never started here: the API process is a pure producer,
    // and the worker processes' loaders pick the persisted jobs up.
    let queue = JobQueue::new(pool.clone(), &registry);

    let state = Arc::new(ApiState {
        pool,
        queue,
        api_key,
    });
    let app = api::router(state);

    let address = std::net::SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = tokio::net::TcpListener::bind(address).await?;
    tracing::info!(%address, "serving admin API");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received, stopping API service...");
        })
        .await?;

    cancel.cancel();
    let _ = metrics_task.await;
    tracing::info!("graceful shutdown complete");
    Ok(())
}

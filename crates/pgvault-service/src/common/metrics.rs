// Copyright (c) Pgvault Contributors
// SPDX-License-Identifier: Apache-2.0

//! Prometheus metric sets and the `/metrics` exporter.
//!
//! Each component instantiates its metric set against the shared registry at
//! startup; registration of a compile-time-defined metric cannot fail.

use std::net::SocketAddr;

use anyhow::Context as _;
use axum::{routing::get, Router};
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "pgvault";

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let metric = IntCounter::with_opts(Opts::new(name, help).namespace(NAMESPACE))
        .expect("metrics defined at compile time must be valid");
    registry
        .register(Box::new(metric.clone()))
        .expect("metrics defined at compile time must be valid");
    metric
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let metric = IntCounterVec::new(Opts::new(name, help).namespace(NAMESPACE), labels)
        .expect("metrics defined at compile time must be valid");
    registry
        .register(Box::new(metric.clone()))
        .expect("metrics defined at compile time must be valid");
    metric
}

fn gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let metric = IntGauge::with_opts(Opts::new(name, help).namespace(NAMESPACE))
        .expect("metrics defined at compile time must be valid");
    registry
        .register(Box::new(metric.clone()))
        .expect("metrics defined at compile time must be valid");
    metric
}

fn histogram(registry: &Registry, name: &str, help: &str, buckets: Vec<f64>) -> Histogram {
    let mut opts: HistogramOpts = Opts::new(name, help).namespace(NAMESPACE).into();
    opts.buckets = buckets;
    let metric =
        Histogram::with_opts(opts).expect("metrics defined at compile time must be valid");
    registry
        .register(Box::new(metric.clone()))
        .expect("metrics defined at compile time must be valid");
    metric
}

fn duration_buckets() -> Vec<f64> {
    prometheus::exponential_buckets(0.05, 2.5, 12).expect("this is a valid buckets config")
}

/// Metrics exported by the job queue.
#[derive(Debug, Clone)]
pub struct QueueMetricSet {
    /// Jobs moved from the database into the local channel.
    pub jobs_loaded: IntCounter,
    /// Claim updates that affected zero rows (another process won).
    pub claim_conflicts: IntCounter,
    /// Claimed jobs rolled back to pending because the channel was full.
    pub channel_rollbacks: IntCounter,
    /// Loader ticks that failed and will retry.
    pub loader_errors: IntCounter,
    /// Current depth of the local job channel.
    pub queue_depth: IntGauge,
}

impl QueueMetricSet {
    pub fn new(registry: &Registry) -> Self {
        Self {
            jobs_loaded: counter(
                registry,
                "queue_jobs_loaded",
                "The total count of jobs loaded from the database into the local channel",
            ),
            claim_conflicts: counter(
                registry,
                "queue_claim_conflicts",
                "The total count of job claims lost to another process",
            ),
            channel_rollbacks: counter(
                registry,
                "queue_channel_rollbacks",
                "The total count of claimed jobs rolled back because the local channel was full",
            ),
            loader_errors: counter(
                registry,
                "queue_loader_errors",
                "The total count of failed loader ticks",
            ),
            queue_depth: gauge(
                registry,
                "queue_depth",
                "The current number of jobs buffered in the local channel",
            ),
        }
    }
}

/// Metrics exported by the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerMetricSet {
    /// Jobs processed, by job type and outcome.
    pub jobs_processed: IntCounterVec,
    /// Wall-clock duration of `pg_dump` invocations.
    pub dump_duration: Histogram,
    /// Wall-clock duration of artifact uploads.
    pub upload_duration: Histogram,
    /// Dump bytes uploaded to the object store.
    pub bytes_uploaded: IntCounter,
    /// Workers currently executing a job.
    pub active_workers: IntGauge,
}

impl WorkerMetricSet {
    pub fn new(registry: &Registry) -> Self {
        Self {
            jobs_processed: counter_vec(
                registry,
                "worker_jobs_processed",
                "The total count of jobs processed, by type and outcome",
                &["type", "outcome"],
            ),
            dump_duration: histogram(
                registry,
                "worker_dump_duration_seconds",
                "The time it takes pg_dump to produce one dump",
                duration_buckets(),
            ),
            upload_duration: histogram(
                registry,
                "worker_upload_duration_seconds",
                "The time it takes to upload one dump to the object store",
                duration_buckets(),
            ),
            bytes_uploaded: counter(
                registry,
                "worker_bytes_uploaded",
                "The total count of dump bytes uploaded to the object store",
            ),
            active_workers: gauge(
                registry,
                "worker_active",
                "The number of workers currently executing a job",
            ),
        }
    }
}

/// Metrics exported by the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerMetricSet {
    /// Ticks fired, by cadence.
    pub ticks: IntCounterVec,
    /// Backup jobs created by the scheduler, by cadence.
    pub jobs_created: IntCounterVec,
    /// Ticks suppressed because another scheduler held the lease.
    pub lease_conflicts: IntCounter,
}

impl SchedulerMetricSet {
    pub fn new(registry: &Registry) -> Self {
        Self {
            ticks: counter_vec(
                registry,
                "scheduler_ticks",
                "The total count of cadence triggers fired",
                &["cadence"],
            ),
            jobs_created: counter_vec(
                registry,
                "scheduler_jobs_created",
                "The total count of backup jobs created by the scheduler",
                &["cadence"],
            ),
            lease_conflicts: counter(
                registry,
                "scheduler_lease_conflicts",
                "The total count of ticks suppressed by another scheduler's lease",
            ),
        }
    }
}

/// Exports the binary version as a labelled gauge.
pub fn export_build_info(registry: &Registry, version: &str) {
    let opts = Opts::new("build_info", "Pgvault binary info").namespace(NAMESPACE);
    let metric = prometheus::IntGaugeVec::new(opts, &["version"])
        .expect("metrics defined at compile time must be valid");
    registry
        .register(Box::new(metric.clone()))
        .expect("metrics defined at compile time must be valid");
    metric.with_label_values(&[version]).set(1);
}

/// Serves the registry at `/metrics` until `cancel` fires.
pub async fn serve_metrics(
    address: SocketAddr,
    registry: Registry,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let registry = registry.clone();
            async move {
                use prometheus::Encoder as _;
                let mut buffer = Vec::new();
                let encoder = prometheus::TextEncoder::new();
                if let Err(error) = encoder.encode(&registry.gather(), &mut buffer) {
                    tracing::warn!(?error, "failed to encode metrics");
                }
                String::from_utf8(buffer).unwrap_or_default()
            }
        }),
    );

    let listener = tokio::net::TcpListener::bind(address)
        .await
        .with_context(|| format!("failed to bind metrics endpoint on {address}"))?;
    tracing::info!(%address, "started Prometheus HTTP endpoint");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("metrics endpoint failed")
}

// Copyright (c) Pgvault Contributors
// SPDX-License-Identifier: Apache-2.0

//! Tracing subscriber setup shared by the binaries.

use anyhow::anyhow;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _, EnvFilter, Layer};

/// Initializes the global tracing subscriber.
///
/// The filter is seeded from `LOG_LEVEL`, falling back to `RUST_LOG`, and
/// defaults to `info` (`debug` in dev mode). The output format is controlled
/// by `LOG_FORMAT` (`default|compact|pretty|json`); dev mode defaults to
/// `pretty`.
pub fn init_tracing_subscriber(dev: bool) -> anyhow::Result<()> {
    let default_level = if dev { "debug" } else { "info" };
    let directive = std::env::var("LOG_LEVEL")
        .or_else(|_| std::env::var(EnvFilter::DEFAULT_ENV))
        .unwrap_or_else(|_| default_level.to_owned());
    let filter = EnvFilter::try_new(&directive)
        .map_err(|error| anyhow!("invalid log filter {directive:?}: {error}"))?;

    let layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    let format = std::env::var("LOG_FORMAT")
        .ok()
        .or_else(|| dev.then(|| "pretty".to_owned()));
    let layer = match format.as_deref() {
        None | Some("default") => layer.boxed(),
        Some("compact") => layer.compact().boxed(),
        Some("pretty") => layer.pretty().boxed(),
        Some("json") => layer.json().boxed(),
        Some(other) => return Err(anyhow!("LOG_FORMAT '{other}' is not supported")),
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(filter))
        .init();
    tracing::debug!("initialized global tracing subscriber");
    Ok(())
}

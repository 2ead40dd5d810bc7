// Copyright (c) Pgvault Contributors
// SPDX-License-Identifier: Apache-2.0

//! Connection pool and migrations for the control database.

use anyhow::Context as _;
use diesel::Connection as _;
use diesel_async::{
    async_connection_wrapper::AsyncConnectionWrapper,
    pooled_connection::{
        bb8::{Pool, PooledConnection, RunError},
        AsyncDieselConnectionManager,
    },
    AsyncPgConnection,
};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

/// Embedded schema migrations, applied by the binaries at startup.
pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!();

/// The shared control-database connection pool.
///
/// Every worker acquires a connection per logical operation and returns it
/// to the pool immediately; no connection is held across external process or
/// object-store I/O.
pub type DbPool = Pool<AsyncPgConnection>;

/// A connection checked out of [`DbPool`].
pub type DbConnection<'a> = PooledConnection<'a, AsyncPgConnection>;

/// Error returned when checking a connection out of the pool fails.
pub type PoolError = RunError;

const MAX_POOL_SIZE: u32 = 16;

/// Builds the control-database pool and verifies connectivity with one
/// initial checkout.
pub async fn establish_pool(database_url: &str) -> anyhow::Result<DbPool> {
    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
    let pool = Pool::builder()
        .max_size(MAX_POOL_SIZE)
        .build(manager)
        .await
        .context("failed to build control-database pool")?;
    pool.get()
        .await
        .context("failed to connect to the control database")?;
    Ok(pool)
}

/// A pool that has not attempted any connection, for router tests that must
/// never touch a live database.
#[cfg(test)]
pub(crate) fn establish_pool_lazy_for_tests() -> DbPool {
    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(
        "postgres://pgvault@localhost:5432/pgvault_test",
    );
    Pool::builder().build_unchecked(manager)
}

/// Applies pending embedded migrations.
///
/// Diesel's migration harness is synchronous; the wrapped connection runs on
/// a blocking thread.
pub async fn run_pending_migrations(database_url: &str) -> anyhow::Result<()> {
    let database_url = database_url.to_owned();
    tokio::task::spawn_blocking(move || {
        let mut conn = AsyncConnectionWrapper::<AsyncPgConnection>::establish(&database_url)
            .context("failed to connect to the control database for migrations")?;
        let applied = conn
            .run_pending_migrations(MIGRATIONS)
            .map_err(|error| anyhow::anyhow!("failed to run migrations: {error}"))?;
        for migration in applied {
            tracing::info!(%migration, "applied control-database migration");
        }
        Ok(())
    })
    .await
    .context("migration task panicked")?
}

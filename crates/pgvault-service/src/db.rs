// Copyright (c) Pgvault Contributors
// SPDX-License-Identifier: Apache-2.0

//! Control-database access: schema, row models, and the connection pool.

mod connection;
pub mod models;
pub mod schema;

#[cfg(test)]
pub(crate) use connection::establish_pool_lazy_for_tests;
pub use connection::{
    establish_pool, run_pending_migrations, DbConnection, DbPool, PoolError, MIGRATIONS,
};

// Copyright (c) Pgvault Contributors
// SPDX-License-Identifier: Apache-2.0

//! Multi-tenant PostgreSQL backup orchestrator.
//!
//! The service maintains a registry of PostgreSQL instances, schedules
//! periodic dumps at four cadences, executes them as concurrent jobs, ships
//! the artifacts to an S3-compatible object store, and enforces per-cadence
//! retention. Three long-lived processes share one control database:
//!
//!   - API process (`pgvault-api`): accepts admin requests, writes
//!     authoritative backup and job rows, and enqueues work. Stateless and
//!     horizontally replicable.
//!   - Worker process (`pgvault-worker`): hosts the queue loader, N workers,
//!     and the scheduler. Horizontally replicable; all coordination happens
//!     through the control database.
//!   - Control database: the single source of truth for instances, backups,
//!     jobs, and structured logs. Its atomic row transitions are the only
//!     cross-process lock.
//!
//! A backup request inserts one pending backup row and one pending job row.
//! The queue loader claims the job with a conditional UPDATE whose
//! affected-row count is the claim decision, a worker drives the
//! `pg_dump` → object-store pipeline, and terminal status lands on both
//! rows. Retention cleanup and restore ride the same queue under different
//! job types. Workers that die mid-job leave the row `running`; the
//! loader's staleness window reclaims it in any process.

pub mod api;
pub mod common;
pub mod config;
pub mod db;
pub mod logs;
pub mod queue;
pub mod scheduler;
pub mod storage;
pub mod worker;

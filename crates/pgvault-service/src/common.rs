// Copyright (c) Pgvault Contributors
// SPDX-License-Identifier: Apache-2.0

//! Cross-cutting runtime concerns: tracing setup and Prometheus metrics.

pub mod metrics;
pub mod telemetry;

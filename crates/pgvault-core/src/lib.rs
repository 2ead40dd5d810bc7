// Copyright (c) Pgvault Contributors
// SPDX-License-Identifier: Apache-2.0

//! Core vocabulary for the pgvault backup orchestrator.
//!
//! This crate defines the closed string vocabularies shared by the control
//! database, the job queue, and the admin API: backup cadences, job and
//! backup statuses, job types, and SSL modes. The string form of each value
//! is the canonical one; it is what the database CHECK constraints accept
//! and what appears in job payloads and API responses.
//!
//! The [`keys`] module defines the object-store key layout and the dump
//! filename format. Both are load-bearing: retention relies on the
//! lexicographic order of keys under one `(instance, cadence)` prefix being
//! chronological.

pub mod keys;

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// Error returned when a string is not part of one of the closed
/// vocabularies defined in this crate.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind}: {value:?}")]
pub struct ParseError {
    kind: &'static str,
    value: String,
}

impl ParseError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_owned(),
        }
    }
}

macro_rules! string_enum {
    (
        $(#[$outer:meta])*
        $name:ident ($kind:literal) {
            $( $(#[$var_meta:meta])* $variant:ident => $text:literal ),+ $(,)?
        }
    ) => {
        $(#[$outer])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $( $(#[$var_meta])* $variant, )+
        }

        impl $name {
            /// The canonical string form, as stored in the control database.
            pub const fn as_str(&self) -> &'static str {
                match self {
                    $( Self::$variant => $text, )+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $( $text => Ok(Self::$variant), )+
                    other => Err(ParseError::new($kind, other)),
                }
            }
        }
    };
}

string_enum! {
    /// The cadence of a backup: one of the four scheduled intervals or
    /// `manual` for operator-triggered dumps.
    ///
    /// Manual backups are exempt from retention; cleanup jobs are only ever
    /// created for the scheduled cadences.
    Cadence ("cadence") {
        Hourly => "hourly",
        Daily => "daily",
        Weekly => "weekly",
        Monthly => "monthly",
        Manual => "manual",
    }
}

impl Cadence {
    /// The cadences driven by the wall-clock scheduler, in trigger order.
    pub const SCHEDULED: [Cadence; 4] = [
        Cadence::Hourly,
        Cadence::Daily,
        Cadence::Weekly,
        Cadence::Monthly,
    ];

    /// Returns true iff this cadence is fired by the scheduler.
    pub fn is_scheduled(&self) -> bool {
        !matches!(self, Cadence::Manual)
    }
}

string_enum! {
    /// The lifecycle status of a backup record.
    BackupStatus ("backup status") {
        Pending => "pending",
        InProgress => "in_progress",
        Completed => "completed",
        Failed => "failed",
    }
}

impl BackupStatus {
    /// Returns true iff no further transition is permitted.
    ///
    /// Terminal statuses are exactly the ones for which `end_time` is set.
    pub fn is_terminal(&self) -> bool {
        matches!(self, BackupStatus::Completed | BackupStatus::Failed)
    }
}

string_enum! {
    /// The lifecycle status of a queued job.
    ///
    /// `retrying` rows are re-observed by the queue loader after a backoff
    /// delay; `running` rows older than the staleness window are reclaimed.
    JobStatus ("job status") {
        Pending => "pending",
        Running => "running",
        Completed => "completed",
        Failed => "failed",
        Retrying => "retrying",
    }
}

impl JobStatus {
    /// Returns true iff the job will never execute again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

string_enum! {
    /// The kind of work a job row describes.
    JobType ("job type") {
        Backup => "backup",
        Restore => "restore",
        Cleanup => "cleanup",
    }
}

impl JobType {
    /// The default retry budget for this job type.
    ///
    /// Restores never retry automatically: re-running `psql` against a
    /// partially restored database is not safe without operator judgement.
    pub const fn default_max_retries(&self) -> i32 {
        match self {
            JobType::Backup | JobType::Cleanup => 3,
            JobType::Restore => 1,
        }
    }
}

string_enum! {
    /// SSL mode used when connecting to a registered PostgreSQL instance.
    ///
    /// This is passed verbatim to `pg_dump`/`psql` via `PGSSLMODE`.
    SslMode ("ssl mode") {
        Disable => "disable",
        Allow => "allow",
        Prefer => "prefer",
        Require => "require",
    }
}

impl Default for SslMode {
    fn default() -> Self {
        SslMode::Prefer
    }
}

/// Job priorities used by the producers. Higher runs earlier.
pub mod priority {
    /// Scheduler-created backup jobs.
    pub const SCHEDULED_BACKUP: i32 = 7;
    /// Manual backup jobs triggered through the admin API.
    pub const MANUAL_BACKUP: i32 = 5;
    /// Restore jobs.
    pub const RESTORE: i32 = 8;
    /// Retention cleanup jobs.
    pub const CLEANUP: i32 = 3;
}

#[cfg(test)]
mod tests {
    use pgvault_test_utils::param_test;

    use super::*;

    param_test! {
        cadence_round_trips -> Result<(), ParseError>: [
            hourly: (Cadence::Hourly),
            daily: (Cadence::Daily),
            weekly: (Cadence::Weekly),
            monthly: (Cadence::Monthly),
            manual: (Cadence::Manual),
        ]
    }
    fn cadence_round_trips(cadence: Cadence) -> Result<(), ParseError> {
        assert_eq!(cadence.as_str().parse::<Cadence>()?, cadence);
        Ok(())
    }

    #[test]
    fn status_strings_round_trip() {
        assert_eq!(
            "in_progress".parse::<BackupStatus>().unwrap(),
            BackupStatus::InProgress
        );
        assert_eq!("retrying".parse::<JobStatus>().unwrap(), JobStatus::Retrying);
        assert_eq!("cleanup".parse::<JobType>().unwrap(), JobType::Cleanup);
        assert_eq!("prefer".parse::<SslMode>().unwrap(), SslMode::Prefer);
    }

    #[test]
    fn rejects_unknown_values() {
        assert!("yearly".parse::<Cadence>().is_err());
        assert!("IN_PROGRESS".parse::<BackupStatus>().is_err());
        assert!("".parse::<JobType>().is_err());
    }

    #[test]
    fn serde_form_matches_db_form() {
        // The CHECK constraints and serde must agree on the string form.
        let json = serde_json::to_string(&Cadence::Hourly).unwrap();
        assert_eq!(json, "\"hourly\"");
        let back: Cadence = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Cadence::Hourly);
        assert_eq!(
            serde_json::to_string(&BackupStatus::InProgress).unwrap(),
            "\"in_progress\""
        );
    }

    #[test]
    fn manual_is_not_scheduled() {
        assert!(!Cadence::Manual.is_scheduled());
        assert!(Cadence::SCHEDULED.iter().all(Cadence::is_scheduled));
    }

    param_test! {
        default_retry_budget: [
            backup: (JobType::Backup, 3),
            restore: (JobType::Restore, 1),
            cleanup: (JobType::Cleanup, 3),
        ]
    }
    fn default_retry_budget(job_type: JobType, expected: i32) {
        assert_eq!(job_type.default_max_retries(), expected);
    }
}

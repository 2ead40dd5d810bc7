// Copyright (c) Pgvault Contributors
// SPDX-License-Identifier: Apache-2.0

//! Object-store key layout and dump filename construction.
//!
//! Keys take the form `backups/{instance_id}/{cadence}/{YYYY}/{MM}/{filename}`
//! and filenames embed a second-precision timestamp, so that the
//! lexicographic order of the keys under one `(instance, cadence)` prefix is
//! their chronological order. Retention depends on this property and on
//! nothing else; it must be preserved by any change here.

use chrono::{DateTime, Datelike, Utc};

use crate::Cadence;

/// Format string for the timestamp segment embedded in dump filenames.
///
/// Zero-padded and ordered most-significant-first, so filenames (and
/// therefore keys) sort chronologically.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d-%H-%M-%S";

/// Builds the filename of a dump produced at `at`.
///
/// Whitespace in the instance or database name is replaced with `_` so the
/// filename is safe to pass as a single `pg_dump -f` argument and as an
/// object-store key segment.
pub fn dump_filename(
    instance_name: &str,
    database: &str,
    cadence: Cadence,
    at: DateTime<Utc>,
) -> String {
    let filename = format!(
        "{instance_name}_{database}_{cadence}_{timestamp}.sql",
        timestamp = at.format(TIMESTAMP_FORMAT),
    );
    filename
        .chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .collect()
}

/// Builds the object-store key for a dump of `instance_id` taken at `at`.
pub fn object_key(
    instance_id: &str,
    cadence: Cadence,
    at: DateTime<Utc>,
    filename: &str,
) -> String {
    format!(
        "backups/{instance_id}/{cadence}/{year:04}/{month:02}/{filename}",
        year = at.year(),
        month = at.month(),
    )
}

/// The key prefix under which all dumps of one `(instance, cadence)` pair
/// live. Listing this prefix yields keys in chronological order.
pub fn cadence_prefix(instance_id: &str, cadence: Cadence) -> String {
    format!("backups/{instance_id}/{cadence}/")
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use pgvault_test_utils::param_test;

    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn filename_embeds_timestamp() {
        let name = dump_filename("pg1", "app", Cadence::Manual, at(2025, 7, 18, 8, 41, 3));
        assert_eq!(name, "pg1_app_manual_2025-07-18-08-41-03.sql");
    }

    param_test! {
        filename_replaces_whitespace: [
            space_in_name: ("prod primary", "app", "prod_primary_app_hourly_2025-01-02-03-04-05.sql"),
            tab_in_database: ("pg1", "my\tdb", "pg1_my_db_hourly_2025-01-02-03-04-05.sql"),
        ]
    }
    fn filename_replaces_whitespace(instance: &str, database: &str, expected: &str) {
        let name = dump_filename(instance, database, Cadence::Hourly, at(2025, 1, 2, 3, 4, 5));
        assert_eq!(name, expected);
    }

    #[test]
    fn key_layout() {
        let when = at(2025, 7, 18, 8, 41, 3);
        let filename = dump_filename("pg1", "app", Cadence::Manual, when);
        let key = object_key("pg1", Cadence::Manual, when, &filename);
        assert_eq!(
            key,
            "backups/pg1/manual/2025/07/pg1_app_manual_2025-07-18-08-41-03.sql"
        );
        assert!(key.starts_with(&cadence_prefix("pg1", Cadence::Manual)));
    }

    #[test]
    fn keys_sort_chronologically_within_prefix() {
        // The retention algorithm deletes the lexicographically smallest
        // keys; this only trims the oldest backups if key order is time
        // order, including across month and year boundaries.
        let times = [
            at(2024, 12, 31, 23, 0, 0),
            at(2025, 1, 1, 0, 0, 0),
            at(2025, 9, 30, 23, 59, 59),
            at(2025, 10, 1, 2, 0, 0),
        ];
        let keys: Vec<String> = times
            .iter()
            .map(|&t| {
                let filename = dump_filename("pg1", "app", Cadence::Hourly, t);
                object_key("pg1", Cadence::Hourly, t, &filename)
            })
            .collect();

        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }
}

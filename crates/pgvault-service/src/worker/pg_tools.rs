// Copyright (c) Pgvault Contributors
// SPDX-License-Identifier: Apache-2.0

//! Invocation of the external `pg_dump` and `psql` tools.
//!
//! Both tools are spawned directly with an argument vector; user-supplied
//! strings never pass through a shell. The instance password travels
//! out-of-band in the child's `PGPASSWORD` and must not appear in the
//! command line or in any log line. Children are spawned kill-on-drop so
//! that an aborted worker reliably terminates its in-flight dump.

use std::{path::Path, process::Stdio};

use tokio::process::Command;

use crate::db::models::Instance;

/// A tool invocation that did not produce a usable exit.
#[derive(Debug)]
pub(crate) struct ToolFailure {
    /// Short summary: the exit status, or the spawn error.
    pub summary: String,
    /// Combined stdout and stderr of the child, empty if it never ran.
    pub output: String,
}

/// Reports the version line of an external tool, if it can be invoked.
pub async fn tool_version(tool: &str) -> Option<String> {
    let output = Command::new(tool).arg("--version").output().await.ok()?;
    output
        .status
        .success()
        .then(|| String::from_utf8_lossy(&output.stdout).trim().to_owned())
}

/// Runs `pg_dump` against `instance`/`database`, writing to `output_file`.
/// Returns the combined tool output on success.
pub(crate) async fn run_pg_dump(
    instance: &Instance,
    database: &str,
    output_file: &Path,
) -> Result<String, ToolFailure> {
    let mut command = Command::new("pg_dump");
    command
        .arg("-h")
        .arg(&instance.host)
        .arg("-p")
        .arg(instance.port.to_string())
        .arg("-U")
        .arg(&instance.username)
        .arg("-d")
        .arg(database)
        .arg("-f")
        .arg(output_file)
        .arg("--verbose")
        .arg("--no-password");
    run(command, instance).await
}

/// Runs `psql` against `instance`/`database`, feeding it `input_file`.
pub(crate) async fn run_psql(
    instance: &Instance,
    database: &str,
    input_file: &Path,
) -> Result<String, ToolFailure> {
    let mut command = Command::new("psql");
    command
        .arg("-h")
        .arg(&instance.host)
        .arg("-p")
        .arg(instance.port.to_string())
        .arg("-U")
        .arg(&instance.username)
        .arg("-d")
        .arg(database)
        .arg("-f")
        .arg(input_file)
        .arg("--quiet");
    run(command, instance).await
}

async fn run(mut command: Command, instance: &Instance) -> Result<String, ToolFailure> {
    command
        .env("PGPASSWORD", &instance.password)
        .env("PGSSLMODE", instance.ssl_mode().as_str())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = command.output().await.map_err(|error| ToolFailure {
        summary: error.to_string(),
        output: String::new(),
    })?;

    let combined = combined_output(&output.stdout, &output.stderr);
    if output.status.success() {
        Ok(combined)
    } else {
        Err(ToolFailure {
            summary: output.status.to_string(),
            output: combined,
        })
    }
}

fn combined_output(stdout: &[u8], stderr: &[u8]) -> String {
    let mut combined = String::from_utf8_lossy(stdout).into_owned();
    if !stderr.is_empty() {
        if !combined.is_empty() && !combined.ends_with('\n') {
            combined.push('\n');
        }
        combined.push_str(&String::from_utf8_lossy(stderr));
    }
    combined
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combines_streams_with_separator() {
        assert_eq!(combined_output(b"out", b"err"), "out\nerr");
        assert_eq!(combined_output(b"out\n", b"err"), "out\nerr");
        assert_eq!(combined_output(b"", b"err"), "err");
        assert_eq!(combined_output(b"out", b""), "out");
    }
}

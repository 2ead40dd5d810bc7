// Copyright (c) Pgvault Contributors
// SPDX-License-Identifier: Apache-2.0

//! Process configuration, read from the environment.
//!
//! Both binaries build one [`ServiceConfig`] at startup. Missing or invalid
//! object-store settings are fatal; everything else has a default. Reads go
//! through an injectable lookup so tests never mutate process-global
//! environment state.

use std::{net::SocketAddr, path::PathBuf};

use pgvault_core::Cadence;

/// Missing or invalid startup configuration. Fatal: the process exits
/// non-zero without starting any subsystem.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("required environment variable {0} is not set")]
    MissingVar(&'static str),
    #[error("invalid value {value:?} for {var}: {reason}")]
    InvalidVar {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Connection settings for the control database.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub ssl_mode: String,
}

impl DatabaseConfig {
    /// The connection URL consumed by diesel.
    pub fn url(&self) -> String {
        format!(
            "postgres://{user}:{password}@{host}:{port}/{database}?sslmode={ssl_mode}",
            user = self.user,
            password = self.password,
            host = self.host,
            port = self.port,
            database = self.database,
            ssl_mode = self.ssl_mode,
        )
    }
}

/// Settings for the S3-compatible object store holding backup artifacts.
#[derive(Debug, Clone)]
pub struct ObjectStoreConfig {
    /// Custom endpoint for non-AWS implementations; `None` uses AWS proper.
    pub endpoint: Option<String>,
    pub region: String,
    pub bucket: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    /// When false, plain HTTP to the endpoint is allowed.
    pub use_ssl: bool,
}

/// Per-cadence retention: how many objects to keep under each
/// `(instance, cadence)` prefix.
///
/// `None` disables retention for that cadence entirely (no cleanup job is
/// scheduled); `Some(0)` is valid and deletes everything under the prefix.
/// Manual backups are always exempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub hourly: Option<u32>,
    pub daily: Option<u32>,
    pub weekly: Option<u32>,
    pub monthly: Option<u32>,
}

impl RetentionPolicy {
    /// The configured object count for `cadence`, if retention applies.
    pub fn for_cadence(&self, cadence: Cadence) -> Option<u32> {
        match cadence {
            Cadence::Hourly => self.hourly,
            Cadence::Daily => self.daily,
            Cadence::Weekly => self.weekly,
            Cadence::Monthly => self.monthly,
            Cadence::Manual => None,
        }
    }
}

/// The full service configuration shared by both binaries.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub database: DatabaseConfig,
    pub object_store: ObjectStoreConfig,
    /// Filesystem path for intermediate dump files.
    pub temp_dir: PathBuf,
    /// Size of the worker pool in the worker process.
    pub worker_count: usize,
    /// Shared secret for the admin surface. Only the api binary requires it.
    pub api_key: Option<String>,
    pub retention: RetentionPolicy,
    /// Address of the Prometheus exporter.
    pub metrics_address: SocketAddr,
}

impl ServiceConfig {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Reads the configuration through `lookup`. Empty values are treated as
    /// unset, matching the behaviour of the deployment tooling.
    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let get = |var: &'static str| lookup(var).filter(|value| !value.is_empty());

        let required = |var: &'static str| get(var).ok_or(ConfigError::MissingVar(var));

        let database = DatabaseConfig {
            host: get("POSTGRES_HOST").unwrap_or_else(|| defaults::POSTGRES_HOST.to_owned()),
            port: parse(get("POSTGRES_PORT"), "POSTGRES_PORT", defaults::POSTGRES_PORT)?,
            database: get("POSTGRES_DB").unwrap_or_else(|| defaults::POSTGRES_DB.to_owned()),
            user: get("POSTGRES_USER").unwrap_or_else(|| defaults::POSTGRES_USER.to_owned()),
            password: get("POSTGRES_PASSWORD").unwrap_or_default(),
            ssl_mode: get("POSTGRES_SSLMODE")
                .unwrap_or_else(|| defaults::POSTGRES_SSLMODE.to_owned()),
        };

        let object_store = ObjectStoreConfig {
            endpoint: get("S3_ENDPOINT"),
            region: required("S3_REGION")?,
            bucket: required("S3_BUCKET")?,
            access_key_id: required("S3_ACCESS_KEY_ID")?,
            secret_access_key: required("S3_SECRET_ACCESS_KEY")?,
            use_ssl: match get("S3_USE_SSL").as_deref() {
                None => true,
                Some("true") | Some("1") => true,
                Some("false") | Some("0") => false,
                Some(other) => {
                    return Err(ConfigError::InvalidVar {
                        var: "S3_USE_SSL",
                        value: other.to_owned(),
                        reason: "expected true or false".to_owned(),
                    })
                }
            },
        };

        let retention = RetentionPolicy {
            hourly: parse_opt(get("RETENTION_HOURLY"), "RETENTION_HOURLY")?,
            daily: parse_opt(get("RETENTION_DAILY"), "RETENTION_DAILY")?,
            weekly: parse_opt(get("RETENTION_WEEKLY"), "RETENTION_WEEKLY")?,
            monthly: parse_opt(get("RETENTION_MONTHLY"), "RETENTION_MONTHLY")?,
        };

        Ok(Self {
            database,
            object_store,
            temp_dir: get("BACKUP_TEMP_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(defaults::TEMP_DIR)),
            worker_count: parse(get("WORKER_COUNT"), "WORKER_COUNT", defaults::WORKER_COUNT)?,
            api_key: get("API_KEY"),
            retention,
            metrics_address: parse(
                get("METRICS_ADDRESS"),
                "METRICS_ADDRESS",
                defaults::metrics_address(),
            )?,
        })
    }
}

fn parse<T: std::str::FromStr>(
    value: Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match value {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidVar {
            var,
            value: raw,
            reason: format!("expected a {}", std::any::type_name::<T>()),
        }),
    }
}

fn parse_opt(value: Option<String>, var: &'static str) -> Result<Option<u32>, ConfigError> {
    value
        .map(|raw| {
            raw.parse().map_err(|_| ConfigError::InvalidVar {
                var,
                value: raw,
                reason: "expected a non-negative integer".to_owned(),
            })
        })
        .transpose()
}

/// Default configuration values.
pub mod defaults {
    use std::net::{Ipv4Addr, SocketAddr};

    pub const POSTGRES_HOST: &str = "localhost";
    pub const POSTGRES_PORT: u16 = 5432;
    pub const POSTGRES_DB: &str = "pgvault";
    pub const POSTGRES_USER: &str = "pgvault";
    pub const POSTGRES_SSLMODE: &str = "disable";
    pub const TEMP_DIR: &str = "/tmp/postgres-backups";
    pub const WORKER_COUNT: usize = 4;

    /// Default Prometheus exporter port.
    pub const METRICS_PORT: u16 = 9184;

    /// Returns the default metrics address.
    pub fn metrics_address() -> SocketAddr {
        (Ipv4Addr::LOCALHOST, METRICS_PORT).into()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn base_env() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("S3_REGION", "us-east-1"),
            ("S3_BUCKET", "pgvault-backups"),
            ("S3_ACCESS_KEY_ID", "key"),
            ("S3_SECRET_ACCESS_KEY", "secret"),
        ])
    }

    fn config_from(env: &HashMap<&'static str, &'static str>) -> Result<ServiceConfig, ConfigError> {
        ServiceConfig::from_lookup(|var| env.get(var).map(|v| (*v).to_owned()))
    }

    #[test]
    fn defaults_apply() {
        let config = config_from(&base_env()).unwrap();
        assert_eq!(config.database.host, "localhost");
        assert_eq!(config.database.port, 5432);
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.temp_dir, PathBuf::from("/tmp/postgres-backups"));
        assert!(config.object_store.use_ssl);
        assert_eq!(config.retention, RetentionPolicy::default());
        assert_eq!(config.api_key, None);
        assert_eq!(
            config.database.url(),
            "postgres://pgvault:@localhost:5432/pgvault?sslmode=disable"
        );
    }

    #[test]
    fn missing_object_store_settings_are_fatal() {
        for var in ["S3_REGION", "S3_BUCKET", "S3_ACCESS_KEY_ID", "S3_SECRET_ACCESS_KEY"] {
            let mut env = base_env();
            env.remove(var);
            let error = config_from(&env).unwrap_err();
            assert!(matches!(error, ConfigError::MissingVar(v) if v == var));
        }
    }

    #[test]
    fn empty_values_count_as_unset() {
        let mut env = base_env();
        env.insert("S3_BUCKET", "");
        assert!(matches!(
            config_from(&env),
            Err(ConfigError::MissingVar("S3_BUCKET"))
        ));
    }

    #[test]
    fn retention_parses_and_zero_is_valid() {
        let mut env = base_env();
        env.insert("RETENTION_HOURLY", "24");
        env.insert("RETENTION_DAILY", "0");
        let config = config_from(&env).unwrap();
        assert_eq!(config.retention.for_cadence(Cadence::Hourly), Some(24));
        assert_eq!(config.retention.for_cadence(Cadence::Daily), Some(0));
        assert_eq!(config.retention.for_cadence(Cadence::Weekly), None);
        assert_eq!(config.retention.for_cadence(Cadence::Manual), None);
    }

    #[test]
    fn invalid_values_are_reported() {
        let mut env = base_env();
        env.insert("WORKER_COUNT", "many");
        assert!(matches!(
            config_from(&env),
            Err(ConfigError::InvalidVar { var: "WORKER_COUNT", .. })
        ));

        let mut env = base_env();
        env.insert("S3_USE_SSL", "maybe");
        assert!(matches!(
            config_from(&env),
            Err(ConfigError::InvalidVar { var: "S3_USE_SSL", .. })
        ));
    }
}

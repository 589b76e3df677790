//! Operator configuration
//!
//! All settings come from environment variables so the operator can be
//! configured from its Deployment manifest. `PGPASSWORD_FILE` allows the admin
//! password to be mounted from a Secret instead of being set inline.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

/// Default maintenance database used for role and database DDL
pub const DEFAULT_MAINTENANCE_DATABASE: &str = "postgres";
/// Default per-database pool size
pub const DEFAULT_POOL_MAX_SIZE: usize = 4;
/// Default timeout for a single catalog query, statement or secret call
pub const DEFAULT_OPERATION_TIMEOUT_SECS: u64 = 10;

/// Errors raised while reading configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required setting: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },

    #[error("Failed to read {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// TLS behaviour for the admin connection
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SslMode {
    /// Plain TCP
    Disable,
    /// TLS without certificate verification
    Require,
    /// TLS verified against the CA bundle at the given path
    VerifyFull { ca_cert_path: PathBuf },
}

/// Connection settings for the managed PostgreSQL instance
#[derive(Clone)]
pub struct PostgresSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub maintenance_database: String,
    pub ssl_mode: SslMode,
    pub pool_max_size: usize,
    pub operation_timeout: Duration,
}

impl std::fmt::Debug for PostgresSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("maintenance_database", &self.maintenance_database)
            .field("ssl_mode", &self.ssl_mode)
            .field("pool_max_size", &self.pool_max_size)
            .field("operation_timeout", &self.operation_timeout)
            .finish()
    }
}

/// Complete operator configuration
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    pub postgres: PostgresSettings,
    /// Restrict watches to one namespace (cluster-wide when unset)
    pub watch_namespace: Option<String>,
}

impl OperatorConfig {
    /// Read configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let host = non_empty("PGHOST").ok_or(ConfigError::Missing("PGHOST"))?;
        let port = parse_or("PGPORT", non_empty("PGPORT"), 5432u16)?;
        let user = non_empty("PGUSER").unwrap_or_else(|| {
            warn!("PGUSER not set, using 'postgres'");
            "postgres".to_string()
        });

        let password = match (non_empty("PGPASSWORD"), non_empty("PGPASSWORD_FILE")) {
            (Some(password), _) => password,
            (None, Some(path)) => {
                let path = PathBuf::from(path);
                std::fs::read_to_string(&path)
                    .map(|s| s.trim_end_matches(['\n', '\r']).to_string())
                    .map_err(|source| ConfigError::ReadFile { path, source })?
            }
            (None, None) => return Err(ConfigError::Missing("PGPASSWORD or PGPASSWORD_FILE")),
        };

        let maintenance_database = non_empty("PGDATABASE")
            .unwrap_or_else(|| DEFAULT_MAINTENANCE_DATABASE.to_string());

        let ssl_mode = match non_empty("PGSSLMODE").as_deref() {
            None | Some("disable") => SslMode::Disable,
            Some("require") => SslMode::Require,
            Some("verify-full") => {
                let ca = non_empty("PGSSLROOTCERT").ok_or(ConfigError::Missing("PGSSLROOTCERT"))?;
                SslMode::VerifyFull {
                    ca_cert_path: PathBuf::from(ca),
                }
            }
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "PGSSLMODE",
                    value: other.to_string(),
                });
            }
        };

        let pool_max_size = parse_or("POOL_MAX_SIZE", non_empty("POOL_MAX_SIZE"), DEFAULT_POOL_MAX_SIZE)?;
        if pool_max_size == 0 {
            return Err(ConfigError::Invalid {
                key: "POOL_MAX_SIZE",
                value: "0".to_string(),
            });
        }

        let timeout_secs = parse_or(
            "SQL_TIMEOUT_SECS",
            non_empty("SQL_TIMEOUT_SECS"),
            DEFAULT_OPERATION_TIMEOUT_SECS,
        )?;

        Ok(Self {
            postgres: PostgresSettings {
                host,
                port,
                user,
                password,
                maintenance_database,
                ssl_mode,
                pool_max_size,
                operation_timeout: Duration::from_secs(timeout_secs.max(1)),
            },
            watch_namespace: non_empty("WATCH_NAMESPACE"),
        })
    }
}

fn parse_or<T: std::str::FromStr>(
    key: &'static str,
    raw: Option<String>,
    default: T,
) -> Result<T, ConfigError> {
    match raw {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}

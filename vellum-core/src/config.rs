//! Configuration types

use crate::{ConfigError, IndexResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

// ============================================================================
// RETRY
// ============================================================================

/// Fixed-delay retry policy for transient backend failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay between attempts
    pub retry_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            retry_delay: Duration::from_secs(1),
        }
    }
}

impl RetryConfig {
    /// Environment variables:
    /// - `VELLUM_DB_MAX_RETRIES` (default: 10)
    /// - `VELLUM_DB_RETRY_DELAY_MS` (default: 1000)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_retries: env_or("VELLUM_DB_MAX_RETRIES", defaults.max_retries),
            retry_delay: Duration::from_millis(env_or(
                "VELLUM_DB_RETRY_DELAY_MS",
                defaults.retry_delay.as_millis() as u64,
            )),
        }
    }

    /// No retries, no delay.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            retry_delay: Duration::ZERO,
        }
    }
}

// ============================================================================
// LOCAL BACKEND
// ============================================================================

/// Settings for the locally persisted index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalIndexConfig {
    /// Directory holding the persisted index
    pub path: PathBuf,
    /// Upper bound on the persisted index size in megabytes
    pub max_size_mb: usize,
}

impl LocalIndexConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_size_mb: 1024,
        }
    }

    /// Environment variables:
    /// - `VELLUM_LOCAL_INDEX_PATH` (default: `./vellum-index`)
    /// - `VELLUM_LOCAL_INDEX_MAX_SIZE_MB` (default: 1024)
    pub fn from_env() -> Self {
        let path = std::env::var("VELLUM_LOCAL_INDEX_PATH")
            .unwrap_or_else(|_| "./vellum-index".to_string());
        Self {
            max_size_mb: env_or("VELLUM_LOCAL_INDEX_MAX_SIZE_MB", 1024),
            path: PathBuf::from(path),
        }
    }

    pub fn validate(&self) -> IndexResult<()> {
        if self.path.as_os_str().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "local.path".to_string(),
            }
            .into());
        }
        if self.max_size_mb == 0 {
            return Err(invalid("local.max_size_mb", self.max_size_mb, "max_size_mb must be positive").into());
        }
        Ok(())
    }
}

// ============================================================================
// SQL BACKEND
// ============================================================================

/// Connection settings and credentials for the PostgreSQL backend.
///
/// Owned by whichever component constructs the SQL index; nothing reads
/// credentials from global state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlIndexConfig {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub password: String,
    /// Maximum pool size
    pub max_pool_size: usize,
    /// Timeout for acquiring a pooled connection
    pub connect_timeout: Duration,
    /// Schema to place first on the search path, if any
    pub search_path: Option<String>,
    pub retry: RetryConfig,
}

impl Default for SqlIndexConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            dbname: "vellum".to_string(),
            user: "postgres".to_string(),
            password: String::new(),
            max_pool_size: 16,
            connect_timeout: Duration::from_secs(30),
            search_path: None,
            retry: RetryConfig::default(),
        }
    }
}

impl SqlIndexConfig {
    /// Create a configuration from `VELLUM_DB_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("VELLUM_DB_HOST").unwrap_or(defaults.host),
            port: env_or("VELLUM_DB_PORT", defaults.port),
            dbname: std::env::var("VELLUM_DB_NAME").unwrap_or(defaults.dbname),
            user: std::env::var("VELLUM_DB_USER").unwrap_or(defaults.user),
            password: std::env::var("VELLUM_DB_PASSWORD").unwrap_or_default(),
            max_pool_size: env_or("VELLUM_DB_POOL_SIZE", defaults.max_pool_size),
            connect_timeout: Duration::from_secs(env_or("VELLUM_DB_TIMEOUT", 30)),
            search_path: std::env::var("VELLUM_DB_SEARCH_PATH").ok(),
            retry: RetryConfig::from_env(),
        }
    }

    pub fn validate(&self) -> IndexResult<()> {
        if self.host.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "sql.host".to_string(),
            }
            .into());
        }
        if self.dbname.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "sql.dbname".to_string(),
            }
            .into());
        }
        if self.max_pool_size == 0 {
            return Err(invalid("sql.max_pool_size", self.max_pool_size, "pool size must be positive").into());
        }
        if self.connect_timeout.is_zero() {
            return Err(invalid(
                "sql.connect_timeout",
                format!("{:?}", self.connect_timeout),
                "connect_timeout must be positive",
            )
            .into());
        }
        if let Some(schema) = &self.search_path {
            let valid = !schema.is_empty()
                && schema
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_');
            if !valid {
                return Err(invalid(
                    "sql.search_path",
                    schema,
                    "schema name must be a non-empty identifier of [A-Za-z0-9_]",
                )
                .into());
            }
        }
        Ok(())
    }
}

// ============================================================================
// MASTER CONFIG
// ============================================================================

/// Which artifact index implementation to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Process memory only
    Volatile,
    /// Process memory persisted to a local file
    Local,
    /// PostgreSQL
    Sql,
}

impl std::str::FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "volatile" => Ok(BackendKind::Volatile),
            "local" => Ok(BackendKind::Local),
            "sql" => Ok(BackendKind::Sql),
            other => Err(invalid("backend", other, "expected volatile, local or sql")),
        }
    }
}

/// Master configuration for an artifact index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexConfig {
    pub backend: BackendKind,
    /// Required when `backend` is `Local`
    pub local: Option<LocalIndexConfig>,
    /// Required when `backend` is `Sql`
    pub sql: Option<SqlIndexConfig>,
    /// How long callers wait for the index to become ready
    pub ready_timeout: Duration,
}

impl IndexConfig {
    pub fn volatile() -> Self {
        Self {
            backend: BackendKind::Volatile,
            local: None,
            sql: None,
            ready_timeout: Duration::from_secs(60),
        }
    }

    pub fn local(config: LocalIndexConfig) -> Self {
        Self {
            backend: BackendKind::Local,
            local: Some(config),
            ..Self::volatile()
        }
    }

    pub fn sql(config: SqlIndexConfig) -> Self {
        Self {
            backend: BackendKind::Sql,
            sql: Some(config),
            ..Self::volatile()
        }
    }

    /// Environment variables:
    /// - `VELLUM_INDEX_BACKEND`: `volatile` | `local` | `sql` (default: volatile)
    /// - `VELLUM_INDEX_READY_TIMEOUT_SECS` (default: 60)
    /// - plus the variables read by [`LocalIndexConfig::from_env`] or
    ///   [`SqlIndexConfig::from_env`] for the selected backend
    pub fn from_env() -> IndexResult<Self> {
        let backend = match std::env::var("VELLUM_INDEX_BACKEND") {
            Ok(value) => value.parse::<BackendKind>()?,
            Err(_) => BackendKind::Volatile,
        };
        let mut config = match backend {
            BackendKind::Volatile => Self::volatile(),
            BackendKind::Local => Self::local(LocalIndexConfig::from_env()),
            BackendKind::Sql => Self::sql(SqlIndexConfig::from_env()),
        };
        config.ready_timeout =
            Duration::from_secs(env_or("VELLUM_INDEX_READY_TIMEOUT_SECS", 60));
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - the selected backend has its sub-configuration
    /// - the sub-configuration itself is valid
    /// - ready_timeout is positive
    pub fn validate(&self) -> IndexResult<()> {
        match self.backend {
            BackendKind::Volatile => {}
            BackendKind::Local => match &self.local {
                Some(local) => local.validate()?,
                None => {
                    return Err(ConfigError::MissingRequired {
                        field: "local".to_string(),
                    }
                    .into())
                }
            },
            BackendKind::Sql => match &self.sql {
                Some(sql) => sql.validate()?,
                None => {
                    return Err(ConfigError::MissingRequired {
                        field: "sql".to_string(),
                    }
                    .into())
                }
            },
        }

        if self.ready_timeout.is_zero() {
            return Err(invalid(
                "ready_timeout",
                format!("{:?}", self.ready_timeout),
                "ready_timeout must be positive",
            )
            .into());
        }

        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IndexError;

    #[test]
    fn test_volatile_config_is_valid() {
        assert!(IndexConfig::volatile().validate().is_ok());
    }

    #[test]
    fn test_local_backend_requires_local_section() {
        let mut config = IndexConfig::local(LocalIndexConfig::new("/tmp/vellum"));
        assert!(config.validate().is_ok());
        config.local = None;
        match config.validate() {
            Err(IndexError::Config(ConfigError::MissingRequired { field })) => {
                assert_eq!(field, "local")
            }
            other => panic!("expected missing local config, got {:?}", other),
        }
    }

    #[test]
    fn test_sql_backend_requires_sql_section() {
        let mut config = IndexConfig::sql(SqlIndexConfig::default());
        assert!(config.validate().is_ok());
        config.sql = None;
        assert!(matches!(
            config.validate(),
            Err(IndexError::Config(ConfigError::MissingRequired { .. }))
        ));
    }

    #[test]
    fn test_local_rejects_zero_size() {
        let mut local = LocalIndexConfig::new("/tmp/vellum");
        local.max_size_mb = 0;
        assert!(local.validate().is_err());
    }

    #[test]
    fn test_sql_rejects_bad_search_path() {
        let mut sql = SqlIndexConfig::default();
        sql.search_path = Some("public; DROP TABLE artifact".to_string());
        assert!(sql.validate().is_err());
        sql.search_path = Some("vellum_test_1".to_string());
        assert!(sql.validate().is_ok());
    }

    #[test]
    fn test_zero_ready_timeout_rejected() {
        let mut config = IndexConfig::volatile();
        config.ready_timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!("SQL".parse::<BackendKind>(), Ok(BackendKind::Sql));
        assert_eq!("local".parse::<BackendKind>(), Ok(BackendKind::Local));
        assert!("mongo".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_retry_none() {
        let retry = RetryConfig::none();
        assert_eq!(retry.max_retries, 0);
        assert!(retry.retry_delay.is_zero());
    }
}

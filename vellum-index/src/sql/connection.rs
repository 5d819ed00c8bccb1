//! Connection pool and schema management for the SQL artifact index.

use deadpool_postgres::{
    Config, ManagerConfig, Object, Pool, PoolConfig, RecyclingMethod, Runtime, Timeouts,
};
use tokio_postgres::error::SqlState;
use tokio_postgres::NoTls;
use vellum_core::{IndexResult, SqlIndexConfig, StorageError};

use super::retry::SqlError;
use super::schema::{ARTIFACT_TABLE_SQL, SCHEMA_VERSION, VERSION_TABLE_SQL};

/// Create a connection pool from `config`.
///
/// When `config.search_path` is set, every pooled connection is opened with
/// that schema as its search path.
pub fn create_pool(config: &SqlIndexConfig) -> IndexResult<Pool> {
    config.validate()?;

    let mut cfg = Config::new();
    cfg.host = Some(config.host.clone());
    cfg.port = Some(config.port);
    cfg.dbname = Some(config.dbname.clone());
    cfg.user = Some(config.user.clone());
    cfg.password = Some(config.password.clone());
    cfg.connect_timeout = Some(config.connect_timeout);
    cfg.options = config
        .search_path
        .as_ref()
        .map(|schema| format!("-c search_path={}", schema));

    cfg.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    });

    let mut pool_config = PoolConfig::new(config.max_pool_size);
    pool_config.timeouts = Timeouts {
        wait: Some(config.connect_timeout),
        create: Some(config.connect_timeout),
        recycle: Some(config.connect_timeout),
    };
    cfg.pool = Some(pool_config);

    let pool = cfg
        .create_pool(Some(Runtime::Tokio1), NoTls)
        .map_err(|e| StorageError::Database {
            operation: "create_pool".to_string(),
            reason: e.to_string(),
        })?;

    Ok(pool)
}

/// Supplies connections to the SQL index and owns its schema.
#[derive(Clone)]
pub struct PgConnectionManager {
    pool: Pool,
    search_path: Option<String>,
}

impl PgConnectionManager {
    pub fn new(pool: Pool, search_path: Option<String>) -> Self {
        Self { pool, search_path }
    }

    pub fn from_config(config: &SqlIndexConfig) -> IndexResult<Self> {
        let pool = create_pool(config)?;
        Ok(Self::new(pool, config.search_path.clone()))
    }

    /// Current pool size, for health reporting.
    pub fn pool_size(&self) -> usize {
        self.pool.status().size
    }

    /// Close the pool. Idle connections are dropped and checkouts fail from now on.
    pub fn close(&self) {
        self.pool.close();
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    pub(crate) async fn connection(&self) -> Result<Object, SqlError> {
        Ok(self.pool.get().await?)
    }

    /// Installed schema version, or `None` if the schema has never been installed.
    pub async fn schema_version(&self) -> Result<Option<i32>, SqlError> {
        let conn = self.connection().await?;
        let row = conn
            .query_opt(
                "SELECT version FROM vellum_schema_version ORDER BY version DESC LIMIT 1",
                &[],
            )
            .await;

        match row {
            Ok(row) => Ok(row.map(|r| r.get(0))),
            Err(e) if e.code() == Some(&SqlState::UNDEFINED_TABLE) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Create the schema at [`SCHEMA_VERSION`] if it is not already installed.
    ///
    /// Production deployments run their own migrations; this exists for
    /// bootstrapping development and test databases.
    pub async fn install_schema(&self) -> Result<(), SqlError> {
        let mut conn = self.connection().await?;
        let tx = conn.transaction().await?;

        if let Some(schema) = &self.search_path {
            tx.batch_execute(&format!("CREATE SCHEMA IF NOT EXISTS {}", schema))
                .await?;
        }
        tx.batch_execute(VERSION_TABLE_SQL).await?;
        tx.batch_execute(ARTIFACT_TABLE_SQL).await?;
        tx.execute(
            "INSERT INTO vellum_schema_version (version)
             SELECT $1::INTEGER
             WHERE NOT EXISTS (SELECT 1 FROM vellum_schema_version WHERE version = $1::INTEGER)",
            &[&SCHEMA_VERSION],
        )
        .await?;
        tx.commit().await?;

        tracing::info!(
            version = SCHEMA_VERSION,
            search_path = ?self.search_path,
            "Installed artifact index schema"
        );
        Ok(())
    }

    /// Drop the schema named by the search path, with everything in it.
    /// Without a search path there is nothing this manager owns, so it is a no-op.
    pub async fn drop_schema(&self) -> Result<(), SqlError> {
        let Some(schema) = &self.search_path else {
            return Ok(());
        };
        let conn = self.connection().await?;
        conn.batch_execute(&format!("DROP SCHEMA IF EXISTS {} CASCADE", schema))
            .await?;
        tracing::info!(schema = %schema, "Dropped artifact index schema");
        Ok(())
    }
}

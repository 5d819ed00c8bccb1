//! SQL artifact index over PostgreSQL.
//!
//! Every operation is a single statement, so each runs in its own
//! transaction and reads see one consistent snapshot. Ordering, latest
//! version selection and size aggregation happen in the database.
//! Transient failures are retried by [`retry::retry_transient`].

mod connection;
mod retry;
mod schema;

pub use connection::{create_pool, PgConnectionManager};
pub use retry::SqlError;
pub use schema::SCHEMA_VERSION;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_postgres::types::ToSql;
use tokio_postgres::Row;
use uuid::Uuid;
use vellum_core::{
    require_non_empty, require_uuid, Artifact, ArtifactVersion, ArtifactVersions, AuSize,
    HealthCheck, IndexResult, LifecycleError, RetryConfig, SqlIndexConfig, StorageError,
};

use crate::data_store::{ArtifactDataStore, DataStoreSlot};
use crate::lifecycle::{idle_health, IndexState, Lifecycle};
use crate::{require_au, require_cross_au, require_stem, ArtifactIndex};
use retry::retry_transient;
use schema::URL_KEY_CHARS;

const COMPONENT: &str = "sql_artifact_index";

// ============================================================================
// STATEMENTS
// ============================================================================

macro_rules! artifact_columns {
    () => {
        "uuid, namespace, auid, uri, version, committed, storage_url, \
         content_length, content_digest, collection_date"
    };
}

const INSERT_ARTIFACT: &str = concat!(
    "INSERT INTO artifact (uuid, namespace, auid, uri, version, committed, storage_url, \
     content_length, content_digest, collection_date) \
     VALUES ($1, $2, $3, $4, $5, FALSE, $6, $7, $8, $9) \
     ON CONFLICT (uuid) DO NOTHING RETURNING ",
    artifact_columns!()
);

const SELECT_BY_UUID: &str =
    concat!("SELECT ", artifact_columns!(), " FROM artifact WHERE uuid = $1");

const COMMIT_ARTIFACT: &str = concat!(
    "UPDATE artifact SET committed = TRUE WHERE uuid = $1 RETURNING ",
    artifact_columns!()
);

const DELETE_ARTIFACT: &str = "DELETE FROM artifact WHERE uuid = $1";

const UPDATE_STORAGE_URL: &str = concat!(
    "UPDATE artifact SET storage_url = $2 WHERE uuid = $1 RETURNING ",
    artifact_columns!()
);

const SELECT_LATEST: &str = concat!(
    "SELECT ",
    artifact_columns!(),
    " FROM artifact WHERE namespace = $1 AND auid = $2 AND md5(uri) = md5($3::TEXT) AND uri = $3 \
     AND (committed OR $4) ORDER BY version DESC LIMIT 1"
);

const SELECT_VERSION: &str = concat!(
    "SELECT ",
    artifact_columns!(),
    " FROM artifact WHERE namespace = $1 AND auid = $2 AND md5(uri) = md5($3::TEXT) AND uri = $3 \
     AND version = $4 AND (committed OR $5)"
);

const SELECT_NAMESPACES: &str = "SELECT DISTINCT namespace FROM artifact ORDER BY namespace";

const SELECT_AU_IDS: &str =
    "SELECT DISTINCT auid FROM artifact WHERE namespace = $1 ORDER BY auid";

const SELECT_AU_LATEST: &str = concat!(
    "SELECT DISTINCT ON (uri) ",
    artifact_columns!(),
    " FROM artifact WHERE namespace = $1 AND auid = $2 AND (committed OR $3) \
     ORDER BY uri, version DESC"
);

const SELECT_AU_ALL_VERSIONS: &str = concat!(
    "SELECT ",
    artifact_columns!(),
    " FROM artifact WHERE namespace = $1 AND auid = $2 AND (committed OR $3) \
     ORDER BY uri, version DESC"
);

const SELECT_URL_ALL_VERSIONS: &str = concat!(
    "SELECT ",
    artifact_columns!(),
    " FROM artifact WHERE namespace = $1 AND auid = $2 AND md5(uri) = md5($3::TEXT) AND uri = $3 \
     AND (committed OR $4) ORDER BY version DESC"
);

const SELECT_PREFIX_LATEST: &str = concat!(
    "SELECT DISTINCT ON (uri) ",
    artifact_columns!(),
    " FROM artifact WHERE namespace = $1 AND auid = $2 AND committed \
     AND left(uri, 2048) LIKE $4 ESCAPE '\\' AND uri LIKE $3 ESCAPE '\\' \
     ORDER BY uri, version DESC"
);

const SELECT_PREFIX_ALL_VERSIONS: &str = concat!(
    "SELECT ",
    artifact_columns!(),
    " FROM artifact WHERE namespace = $1 AND auid = $2 AND committed \
     AND left(uri, 2048) LIKE $4 ESCAPE '\\' AND uri LIKE $3 ESCAPE '\\' \
     ORDER BY uri, version DESC"
);

const SELECT_URL_ALL_AUS: &str = concat!(
    "SELECT ",
    artifact_columns!(),
    " FROM artifact WHERE namespace = $1 AND md5(uri) = md5($2::TEXT) AND uri = $2 AND committed \
     ORDER BY uri, auid, version DESC"
);

const SELECT_URL_ALL_AUS_LATEST: &str = concat!(
    "SELECT DISTINCT ON (uri, auid) ",
    artifact_columns!(),
    " FROM artifact WHERE namespace = $1 AND md5(uri) = md5($2::TEXT) AND uri = $2 AND committed \
     ORDER BY uri, auid, version DESC"
);

const SELECT_PREFIX_ALL_AUS: &str = concat!(
    "SELECT ",
    artifact_columns!(),
    " FROM artifact WHERE namespace = $1 AND left(uri, 2048) LIKE $3 ESCAPE '\\' \
     AND uri LIKE $2 ESCAPE '\\' AND committed \
     ORDER BY uri, auid, version DESC"
);

const SELECT_PREFIX_ALL_AUS_LATEST: &str = concat!(
    "SELECT DISTINCT ON (uri, auid) ",
    artifact_columns!(),
    " FROM artifact WHERE namespace = $1 AND left(uri, 2048) LIKE $3 ESCAPE '\\' \
     AND uri LIKE $2 ESCAPE '\\' AND committed \
     ORDER BY uri, auid, version DESC"
);

const SELECT_AU_SIZE: &str = "
SELECT
    COALESCE(SUM(content_length) FILTER (WHERE is_latest), 0)::BIGINT AS total_latest_versions,
    COALESCE(SUM(content_length), 0)::BIGINT AS total_all_versions
FROM (
    SELECT content_length,
           version = MAX(version) OVER (PARTITION BY uri) AS is_latest
    FROM artifact
    WHERE namespace = $1 AND auid = $2 AND committed
) committed_artifacts
";

/// `LIKE` pattern matching every string that starts with `prefix` literally.
fn like_prefix_pattern(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '\\' | '%' | '_') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

/// Pattern for the indexed `left(uri, 2048)` key. It is implied by the full
/// pattern, so the full pattern still decides the match.
fn like_key_pattern(prefix: &str) -> String {
    match prefix.char_indices().nth(URL_KEY_CHARS) {
        Some((end, _)) => like_prefix_pattern(&prefix[..end]),
        None => like_prefix_pattern(prefix),
    }
}

/// Whether `stored` is the row an insert of `requested` writes. The commit
/// flag is ignored since the row may have been committed since.
fn is_same_insert(requested: &Artifact, stored: &Artifact) -> bool {
    requested.uuid == stored.uuid
        && requested.namespace == stored.namespace
        && requested.auid == stored.auid
        && requested.url == stored.url
        && requested.version == stored.version
        && requested.storage_url == stored.storage_url
        && requested.content_length == stored.content_length
        && requested.content_digest == stored.content_digest
        && requested.collection_date == stored.collection_date
}

fn artifact_from_row(row: &Row) -> Result<Artifact, SqlError> {
    Ok(Artifact {
        uuid: row.try_get("uuid")?,
        namespace: row.try_get("namespace")?,
        auid: row.try_get("auid")?,
        url: row.try_get("uri")?,
        version: row.try_get("version")?,
        committed: row.try_get("committed")?,
        storage_url: row.try_get("storage_url")?,
        content_length: row.try_get("content_length")?,
        content_digest: row.try_get("content_digest")?,
        collection_date: row.try_get("collection_date")?,
    })
}

// ============================================================================
// SQL ARTIFACT INDEX
// ============================================================================

/// PostgreSQL-backed [`ArtifactIndex`].
pub struct SqlArtifactIndex {
    manager: PgConnectionManager,
    retry: RetryConfig,
    lifecycle: Lifecycle,
    data_store: DataStoreSlot,
}

impl SqlArtifactIndex {
    pub fn new(manager: PgConnectionManager, retry: RetryConfig) -> Self {
        Self {
            manager,
            retry,
            lifecycle: Lifecycle::new(),
            data_store: DataStoreSlot::default(),
        }
    }

    /// Build the index and its connection pool. No connection is made until `init`.
    pub fn from_config(config: &SqlIndexConfig) -> IndexResult<Self> {
        let manager = PgConnectionManager::from_config(config)?;
        Ok(Self::new(manager, config.retry.clone()))
    }

    pub fn manager(&self) -> &PgConnectionManager {
        &self.manager
    }

    async fn query_artifacts(
        &self,
        operation: &str,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> IndexResult<Vec<Artifact>> {
        retry_transient(&self.retry, operation, || async move {
            let conn = self.manager.connection().await?;
            let statement = conn.prepare_cached(sql).await?;
            let rows = conn.query(&statement, params).await?;
            rows.iter()
                .map(artifact_from_row)
                .collect::<Result<Vec<_>, SqlError>>()
        })
        .await
    }

    async fn query_artifact(
        &self,
        operation: &str,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> IndexResult<Option<Artifact>> {
        retry_transient(&self.retry, operation, || async move {
            let conn = self.manager.connection().await?;
            let statement = conn.prepare_cached(sql).await?;
            let row = conn.query_opt(&statement, params).await?;
            row.as_ref().map(artifact_from_row).transpose()
        })
        .await
    }

    async fn query_strings(
        &self,
        operation: &str,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> IndexResult<Vec<String>> {
        retry_transient(&self.retry, operation, || async move {
            let conn = self.manager.connection().await?;
            let statement = conn.prepare_cached(sql).await?;
            let rows = conn.query(&statement, params).await?;
            rows.iter()
                .map(|row| row.try_get(0).map_err(SqlError::from))
                .collect::<Result<Vec<String>, SqlError>>()
        })
        .await
    }
}

#[async_trait]
impl ArtifactIndex for SqlArtifactIndex {
    async fn init(&self) -> IndexResult<()> {
        if self.lifecycle.state() == IndexState::Constructed {
            let found = retry_transient(&self.retry, "schema_version", || async move {
                self.manager.schema_version().await
            })
            .await?;

            if found != Some(SCHEMA_VERSION) {
                tracing::error!(
                    expected = SCHEMA_VERSION,
                    found = ?found,
                    "Artifact index schema is not at the expected version"
                );
                return Err(LifecycleError::SchemaMismatch {
                    expected: SCHEMA_VERSION,
                    found,
                }
                .into());
            }
        }
        self.lifecycle.mark_initialized()
    }

    async fn start(&self) -> IndexResult<()> {
        if self.lifecycle.state() == IndexState::Constructed {
            self.init().await?;
        }
        self.lifecycle.mark_ready()
    }

    async fn stop(&self) -> IndexResult<()> {
        self.lifecycle.mark_stopped();
        if !self.manager.is_closed() {
            self.manager.close();
            tracing::info!("Closed artifact index connection pool");
        }
        Ok(())
    }

    fn state(&self) -> IndexState {
        self.lifecycle.state()
    }

    async fn wait_ready(&self, timeout: Duration) -> IndexResult<()> {
        self.lifecycle.wait_ready(timeout).await
    }

    fn set_data_store(&self, store: Arc<dyn ArtifactDataStore>) {
        self.data_store.set(store);
    }

    async fn health_check(&self) -> HealthCheck {
        let state = self.lifecycle.state();
        if state != IndexState::Ready {
            return idle_health(COMPONENT, state);
        }

        let started = Instant::now();
        let probe = async {
            let conn = self.manager.connection().await?;
            conn.query_one("SELECT 1", &[]).await?;
            Ok::<_, SqlError>(())
        }
        .await;
        let elapsed = started.elapsed().as_millis() as i64;

        let check = match probe {
            Ok(()) => HealthCheck::healthy(COMPONENT),
            Err(e) => HealthCheck::unhealthy(COMPONENT, e.to_string()),
        };
        check
            .with_metadata("pool_size", serde_json::json!(self.manager.pool_size()))
            .with_metadata("schema_version", serde_json::json!(SCHEMA_VERSION))
            .with_response_time(elapsed)
    }

    async fn index_artifact(&self, artifact: &Artifact) -> IndexResult<Artifact> {
        self.lifecycle.ensure_ready()?;
        artifact.validate()?;

        let attempts = AtomicU32::new(0);
        let stored = retry_transient(&self.retry, "index_artifact", || {
            let attempts = &attempts;
            async move {
                let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
                let conn = self.manager.connection().await?;
                let statement = conn.prepare_cached(INSERT_ARTIFACT).await?;
                let row = conn
                    .query_opt(
                        &statement,
                        &[
                            &artifact.uuid,
                            &artifact.namespace,
                            &artifact.auid,
                            &artifact.url,
                            &artifact.version,
                            &artifact.storage_url,
                            &artifact.content_length,
                            &artifact.content_digest,
                            &artifact.collection_date,
                        ],
                    )
                    .await?;
                if let Some(row) = row {
                    return artifact_from_row(&row).map(Some);
                }
                if attempt == 1 {
                    return Ok(None);
                }

                // An earlier attempt may have committed before its reply was lost.
                let statement = conn.prepare_cached(SELECT_BY_UUID).await?;
                let existing = conn
                    .query_opt(&statement, &[&artifact.uuid])
                    .await?
                    .as_ref()
                    .map(artifact_from_row)
                    .transpose()?;
                Ok::<_, SqlError>(existing.filter(|existing| is_same_insert(artifact, existing)))
            }
        })
        .await?
        .ok_or(StorageError::AlreadyExists {
            uuid: artifact.uuid,
        })?;

        tracing::debug!(
            uuid = %stored.uuid,
            stem = %stored.stem(),
            version = stored.version,
            "Indexed artifact"
        );
        Ok(stored)
    }

    async fn commit_artifact(&self, uuid: Uuid) -> IndexResult<Option<Artifact>> {
        self.lifecycle.ensure_ready()?;
        require_uuid(uuid)?;

        let committed = self
            .query_artifact("commit_artifact", COMMIT_ARTIFACT, &[&uuid])
            .await?;
        if committed.is_some() {
            tracing::debug!(uuid = %uuid, "Committed artifact");
        }
        Ok(committed)
    }

    async fn delete_artifact(&self, uuid: Uuid) -> IndexResult<bool> {
        self.lifecycle.ensure_ready()?;
        require_uuid(uuid)?;

        let removed = retry_transient(&self.retry, "delete_artifact", || async move {
            let conn = self.manager.connection().await?;
            let statement = conn.prepare_cached(DELETE_ARTIFACT).await?;
            Ok::<_, SqlError>(conn.execute(&statement, &[&uuid]).await?)
        })
        .await?;

        if removed > 0 {
            tracing::debug!(uuid = %uuid, "Deleted artifact");
        }
        Ok(removed > 0)
    }

    async fn update_storage_url(&self, uuid: Uuid, storage_url: &str) -> IndexResult<Artifact> {
        self.lifecycle.ensure_ready()?;
        require_uuid(uuid)?;
        require_non_empty("storage_url", storage_url)?;

        let updated = self
            .query_artifact("update_storage_url", UPDATE_STORAGE_URL, &[&uuid, &storage_url])
            .await?
            .ok_or(StorageError::NotFound { uuid })?;
        Ok(updated)
    }

    async fn get_artifact(&self, uuid: Uuid) -> IndexResult<Option<Artifact>> {
        self.lifecycle.ensure_ready()?;
        require_uuid(uuid)?;
        self.query_artifact("get_artifact", SELECT_BY_UUID, &[&uuid])
            .await
    }

    async fn get_latest_artifact(
        &self,
        namespace: &str,
        auid: &str,
        url: &str,
        include_uncommitted: bool,
    ) -> IndexResult<Option<Artifact>> {
        self.lifecycle.ensure_ready()?;
        require_stem(namespace, auid, url)?;
        self.query_artifact(
            "get_latest_artifact",
            SELECT_LATEST,
            &[&namespace, &auid, &url, &include_uncommitted],
        )
        .await
    }

    async fn get_artifact_version(
        &self,
        namespace: &str,
        auid: &str,
        url: &str,
        version: ArtifactVersion,
        include_uncommitted: bool,
    ) -> IndexResult<Option<Artifact>> {
        self.lifecycle.ensure_ready()?;
        require_stem(namespace, auid, url)?;
        self.query_artifact(
            "get_artifact_version",
            SELECT_VERSION,
            &[&namespace, &auid, &url, &version, &include_uncommitted],
        )
        .await
    }

    async fn get_namespaces(&self) -> IndexResult<Vec<String>> {
        self.lifecycle.ensure_ready()?;
        self.query_strings("get_namespaces", SELECT_NAMESPACES, &[])
            .await
    }

    async fn get_au_ids(&self, namespace: &str) -> IndexResult<Vec<String>> {
        self.lifecycle.ensure_ready()?;
        require_non_empty("namespace", namespace)?;
        self.query_strings("get_au_ids", SELECT_AU_IDS, &[&namespace])
            .await
    }

    async fn get_artifacts(
        &self,
        namespace: &str,
        auid: &str,
        include_uncommitted: bool,
    ) -> IndexResult<Vec<Artifact>> {
        self.lifecycle.ensure_ready()?;
        require_au(namespace, auid)?;
        self.query_artifacts(
            "get_artifacts",
            SELECT_AU_LATEST,
            &[&namespace, &auid, &include_uncommitted],
        )
        .await
    }

    async fn get_artifacts_all_versions(
        &self,
        namespace: &str,
        auid: &str,
        include_uncommitted: bool,
    ) -> IndexResult<Vec<Artifact>> {
        self.lifecycle.ensure_ready()?;
        require_au(namespace, auid)?;
        self.query_artifacts(
            "get_artifacts_all_versions",
            SELECT_AU_ALL_VERSIONS,
            &[&namespace, &auid, &include_uncommitted],
        )
        .await
    }

    async fn get_artifact_all_versions(
        &self,
        namespace: &str,
        auid: &str,
        url: &str,
        include_uncommitted: bool,
    ) -> IndexResult<Vec<Artifact>> {
        self.lifecycle.ensure_ready()?;
        require_stem(namespace, auid, url)?;
        self.query_artifacts(
            "get_artifact_all_versions",
            SELECT_URL_ALL_VERSIONS,
            &[&namespace, &auid, &url, &include_uncommitted],
        )
        .await
    }

    async fn get_artifacts_with_prefix(
        &self,
        namespace: &str,
        auid: &str,
        prefix: &str,
    ) -> IndexResult<Vec<Artifact>> {
        self.lifecycle.ensure_ready()?;
        require_au(namespace, auid)?;
        let pattern = like_prefix_pattern(prefix);
        let key_pattern = like_key_pattern(prefix);
        self.query_artifacts(
            "get_artifacts_with_prefix",
            SELECT_PREFIX_LATEST,
            &[&namespace, &auid, &pattern, &key_pattern],
        )
        .await
    }

    async fn get_artifacts_with_prefix_all_versions(
        &self,
        namespace: &str,
        auid: &str,
        prefix: &str,
    ) -> IndexResult<Vec<Artifact>> {
        self.lifecycle.ensure_ready()?;
        require_au(namespace, auid)?;
        let pattern = like_prefix_pattern(prefix);
        let key_pattern = like_key_pattern(prefix);
        self.query_artifacts(
            "get_artifacts_with_prefix_all_versions",
            SELECT_PREFIX_ALL_VERSIONS,
            &[&namespace, &auid, &pattern, &key_pattern],
        )
        .await
    }

    async fn get_artifacts_with_url_from_all_aus(
        &self,
        namespace: &str,
        url: &str,
        versions: ArtifactVersions,
    ) -> IndexResult<Vec<Artifact>> {
        self.lifecycle.ensure_ready()?;
        require_cross_au(namespace, "url", url)?;
        let sql = match versions {
            ArtifactVersions::All => SELECT_URL_ALL_AUS,
            ArtifactVersions::Latest => SELECT_URL_ALL_AUS_LATEST,
        };
        self.query_artifacts("get_artifacts_with_url_from_all_aus", sql, &[&namespace, &url])
            .await
    }

    async fn get_artifacts_with_url_prefix_from_all_aus(
        &self,
        namespace: &str,
        prefix: &str,
        versions: ArtifactVersions,
    ) -> IndexResult<Vec<Artifact>> {
        self.lifecycle.ensure_ready()?;
        require_cross_au(namespace, "prefix", prefix)?;
        let sql = match versions {
            ArtifactVersions::All => SELECT_PREFIX_ALL_AUS,
            ArtifactVersions::Latest => SELECT_PREFIX_ALL_AUS_LATEST,
        };
        let pattern = like_prefix_pattern(prefix);
        let key_pattern = like_key_pattern(prefix);
        self.query_artifacts(
            "get_artifacts_with_url_prefix_from_all_aus",
            sql,
            &[&namespace, &pattern, &key_pattern],
        )
        .await
    }

    async fn au_size(&self, namespace: &str, auid: &str) -> IndexResult<AuSize> {
        self.lifecycle.ensure_ready()?;
        require_au(namespace, auid)?;

        let (total_latest_versions, total_all_versions) =
            retry_transient(&self.retry, "au_size", || async move {
                let conn = self.manager.connection().await?;
                let statement = conn.prepare_cached(SELECT_AU_SIZE).await?;
                let row = conn.query_one(&statement, &[&namespace, &auid]).await?;
                Ok::<_, SqlError>((
                    row.try_get::<_, i64>("total_latest_versions")?,
                    row.try_get::<_, i64>("total_all_versions")?,
                ))
            })
            .await?;
        let total_warc_size = self.data_store.au_warc_size(namespace, auid).await?;

        Ok(AuSize {
            total_latest_versions,
            total_all_versions,
            total_warc_size,
        })
    }
}

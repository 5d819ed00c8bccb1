//! Vellum Index - Artifact Index Contract and Backends
//!
//! Defines the [`ArtifactIndex`] contract and its three implementations:
//! - [`VolatileArtifactIndex`]: process memory only
//! - [`LocalArtifactIndex`]: process memory persisted to a local LMDB file
//! - [`SqlArtifactIndex`]: PostgreSQL
//!
//! All three must behave identically; the shared conformance suite in
//! `vellum-test-utils` is run against each of them.

pub mod data_store;
pub mod lifecycle;
pub mod local;
mod memory;
pub mod ordering;
pub mod sql;
pub mod volatile;

pub use data_store::ArtifactDataStore;
pub use lifecycle::{IndexState, Lifecycle};
pub use local::{LocalArtifactIndex, LocalStoreError};
pub use sql::{PgConnectionManager, SqlArtifactIndex, SqlError, SCHEMA_VERSION};
pub use volatile::VolatileArtifactIndex;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;
use vellum_core::{
    require_non_empty, Artifact, ArtifactVersion, ArtifactVersions, AuSize, BackendKind,
    ConfigError, HealthCheck, IndexConfig, IndexResult,
};

// ============================================================================
// ARTIFACT INDEX CONTRACT
// ============================================================================

/// Metadata index over captured web resources.
///
/// Not-found is never an error: lookups return `None`, `commit_artifact`
/// returns `None` and `delete_artifact` returns `false` for unknown or deleted
/// uuids. The one exception is [`ArtifactIndex::update_storage_url`].
///
/// Each call is atomic with respect to every other call. No sequence of calls
/// is atomic as a whole.
#[async_trait]
pub trait ArtifactIndex: Send + Sync {
    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Allocate structures, load persisted state, validate the schema.
    async fn init(&self) -> IndexResult<()>;

    /// Declare the index ready, initializing first if needed.
    async fn start(&self) -> IndexResult<()>;

    /// Stop serving. Terminal.
    async fn stop(&self) -> IndexResult<()>;

    fn state(&self) -> IndexState;

    fn is_ready(&self) -> bool {
        self.state() == IndexState::Ready
    }

    /// Block until the index is ready or `timeout` elapses.
    async fn wait_ready(&self, timeout: Duration) -> IndexResult<()>;

    /// Register the content store consulted by [`ArtifactIndex::au_size`].
    fn set_data_store(&self, store: Arc<dyn ArtifactDataStore>);

    async fn health_check(&self) -> HealthCheck;

    // ========================================================================
    // MUTATIONS
    // ========================================================================

    /// Add a new artifact in the uncommitted state and return the stored record.
    async fn index_artifact(&self, artifact: &Artifact) -> IndexResult<Artifact>;

    /// Mark an artifact committed. Idempotent.
    async fn commit_artifact(&self, uuid: Uuid) -> IndexResult<Option<Artifact>>;

    /// Remove an artifact. Returns whether a record was removed.
    async fn delete_artifact(&self, uuid: Uuid) -> IndexResult<bool>;

    /// Change the content store locator of an existing artifact.
    ///
    /// Fails with `StorageError::NotFound` if the uuid is unknown or deleted.
    async fn update_storage_url(&self, uuid: Uuid, storage_url: &str) -> IndexResult<Artifact>;

    // ========================================================================
    // IDENTITY LOOKUPS
    // ========================================================================

    /// Exact lookup by uuid, regardless of commit state.
    async fn get_artifact(&self, uuid: Uuid) -> IndexResult<Option<Artifact>>;

    async fn artifact_exists(&self, uuid: Uuid) -> IndexResult<bool> {
        Ok(self.get_artifact(uuid).await?.is_some())
    }

    // ========================================================================
    // STEM LOOKUPS
    // ========================================================================

    /// Highest eligible version of a URL.
    async fn get_latest_artifact(
        &self,
        namespace: &str,
        auid: &str,
        url: &str,
        include_uncommitted: bool,
    ) -> IndexResult<Option<Artifact>>;

    /// One exact version of a URL.
    async fn get_artifact_version(
        &self,
        namespace: &str,
        auid: &str,
        url: &str,
        version: ArtifactVersion,
        include_uncommitted: bool,
    ) -> IndexResult<Option<Artifact>>;

    // ========================================================================
    // LISTINGS
    // ========================================================================

    /// Namespaces holding at least one artifact, ascending.
    async fn get_namespaces(&self) -> IndexResult<Vec<String>>;

    /// AUs holding at least one artifact (committed or not), ascending.
    async fn get_au_ids(&self, namespace: &str) -> IndexResult<Vec<String>>;

    /// Latest eligible version of every URL in an AU, URL ascending.
    async fn get_artifacts(
        &self,
        namespace: &str,
        auid: &str,
        include_uncommitted: bool,
    ) -> IndexResult<Vec<Artifact>>;

    /// Every eligible version of every URL in an AU; URL ascending, version descending.
    async fn get_artifacts_all_versions(
        &self,
        namespace: &str,
        auid: &str,
        include_uncommitted: bool,
    ) -> IndexResult<Vec<Artifact>>;

    /// Every eligible version of one URL, highest first.
    async fn get_artifact_all_versions(
        &self,
        namespace: &str,
        auid: &str,
        url: &str,
        include_uncommitted: bool,
    ) -> IndexResult<Vec<Artifact>>;

    /// Latest committed version of every URL in an AU starting with `prefix`.
    async fn get_artifacts_with_prefix(
        &self,
        namespace: &str,
        auid: &str,
        prefix: &str,
    ) -> IndexResult<Vec<Artifact>>;

    /// Every committed version of every URL in an AU starting with `prefix`.
    async fn get_artifacts_with_prefix_all_versions(
        &self,
        namespace: &str,
        auid: &str,
        prefix: &str,
    ) -> IndexResult<Vec<Artifact>>;

    // ========================================================================
    // CROSS-AU SEARCH
    // ========================================================================

    /// Committed artifacts with exactly this URL in any AU of the namespace.
    /// Ordered URL, then AU ascending, then version descending.
    async fn get_artifacts_with_url_from_all_aus(
        &self,
        namespace: &str,
        url: &str,
        versions: ArtifactVersions,
    ) -> IndexResult<Vec<Artifact>>;

    /// Committed artifacts whose URL starts with `prefix` in any AU of the
    /// namespace. Same ordering as the exact-URL search.
    async fn get_artifacts_with_url_prefix_from_all_aus(
        &self,
        namespace: &str,
        prefix: &str,
        versions: ArtifactVersions,
    ) -> IndexResult<Vec<Artifact>>;

    // ========================================================================
    // SIZE ACCOUNTING
    // ========================================================================

    /// Size figures for one AU. An AU without artifacts reports zero totals.
    async fn au_size(&self, namespace: &str, auid: &str) -> IndexResult<AuSize>;
}

// ============================================================================
// ARGUMENT CHECKS
// ============================================================================

pub(crate) fn require_au(namespace: &str, auid: &str) -> IndexResult<()> {
    require_non_empty("namespace", namespace)?;
    require_non_empty("auid", auid)
}

pub(crate) fn require_stem(namespace: &str, auid: &str, url: &str) -> IndexResult<()> {
    require_au(namespace, auid)?;
    require_non_empty("url", url)
}

/// Cross-AU searches need a namespace and a non-empty URL or prefix.
pub(crate) fn require_cross_au(namespace: &str, field: &str, value: &str) -> IndexResult<()> {
    require_non_empty("namespace", namespace)?;
    require_non_empty(field, value)
}

// ============================================================================
// CONSTRUCTION
// ============================================================================

/// Construct the backend selected by `config`. The index is not started.
pub fn build_index(config: &IndexConfig) -> IndexResult<Arc<dyn ArtifactIndex>> {
    config.validate()?;

    let index: Arc<dyn ArtifactIndex> = match config.backend {
        BackendKind::Volatile => Arc::new(VolatileArtifactIndex::new()),
        BackendKind::Local => {
            let local = config.local.clone().ok_or_else(|| ConfigError::MissingRequired {
                field: "local".to_string(),
            })?;
            Arc::new(LocalArtifactIndex::new(local))
        }
        BackendKind::Sql => {
            let sql = config.sql.as_ref().ok_or_else(|| ConfigError::MissingRequired {
                field: "sql".to_string(),
            })?;
            Arc::new(SqlArtifactIndex::from_config(sql)?)
        }
    };

    tracing::info!(backend = ?config.backend, "Constructed artifact index");
    Ok(index)
}

/// Construct, start and wait for the backend selected by `config`.
pub async fn start_index(config: &IndexConfig) -> IndexResult<Arc<dyn ArtifactIndex>> {
    let index = build_index(config)?;
    index.start().await?;
    index.wait_ready(config.ready_timeout).await?;
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vellum_core::{IndexError, LocalIndexConfig, ValidationError};

    #[test]
    fn test_require_stem_names_missing_field() {
        match require_stem("ns", "au", "") {
            Err(IndexError::Validation(ValidationError::RequiredFieldMissing { field })) => {
                assert_eq!(field, "url")
            }
            other => panic!("expected missing url, got {:?}", other),
        }
        assert!(require_stem("ns", "au", "u").is_ok());
        assert!(require_au("", "au").is_err());
        assert!(require_cross_au("ns", "prefix", "").is_err());
    }

    #[test]
    fn test_build_index_rejects_invalid_config() {
        let mut config = IndexConfig::local(LocalIndexConfig::new("/tmp/unused"));
        config.local = None;
        assert!(matches!(build_index(&config), Err(IndexError::Config(_))));
    }

    #[tokio::test]
    async fn test_start_volatile_index() {
        let index = start_index(&IndexConfig::volatile()).await.expect("start");
        assert!(index.is_ready());
        assert_eq!(index.state(), IndexState::Ready);
    }

    #[tokio::test]
    async fn test_start_local_index() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = IndexConfig::local(LocalIndexConfig::new(dir.path().join("index")));
        let index = start_index(&config).await.expect("start");
        assert!(index.is_ready());
        index.stop().await.expect("stop");
        assert_eq!(index.state(), IndexState::Stopped);
    }
}

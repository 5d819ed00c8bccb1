//! Volatile artifact index: process memory only, lost on shutdown.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use uuid::Uuid;
use vellum_core::{
    require_non_empty, require_uuid, Artifact, ArtifactVersion, ArtifactVersions, AuSize,
    HealthCheck, IndexResult, StorageError,
};

use crate::data_store::{ArtifactDataStore, DataStoreSlot};
use crate::lifecycle::{idle_health, IndexState, Lifecycle};
use crate::memory::SharedTable;
use crate::{require_au, require_cross_au, require_stem, ArtifactIndex};

const COMPONENT: &str = "volatile_artifact_index";

/// In-memory [`ArtifactIndex`].
#[derive(Default)]
pub struct VolatileArtifactIndex {
    pub(crate) table: SharedTable,
    pub(crate) lifecycle: Lifecycle,
    data_store: DataStoreSlot,
}

impl VolatileArtifactIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of indexed artifacts, committed or not.
    pub fn len(&self) -> IndexResult<usize> {
        self.table.read(|t| t.len())
    }

    pub fn is_empty(&self) -> IndexResult<bool> {
        Ok(self.len()? == 0)
    }
}

#[async_trait]
impl ArtifactIndex for VolatileArtifactIndex {
    async fn init(&self) -> IndexResult<()> {
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
        let started = Instant::now();
        let state = self.lifecycle.state();
        let check = match (state, self.table.read(|t| t.len())) {
            (IndexState::Ready, Ok(count)) => HealthCheck::healthy(COMPONENT)
                .with_metadata("artifacts", serde_json::json!(count)),
            (IndexState::Ready, Err(e)) => HealthCheck::unhealthy(COMPONENT, e.to_string()),
            (state, _) => idle_health(COMPONENT, state),
        };
        check.with_response_time(started.elapsed().as_millis() as i64)
    }

    async fn index_artifact(&self, artifact: &Artifact) -> IndexResult<Artifact> {
        self.lifecycle.ensure_ready()?;
        artifact.validate()?;

        let stored = self.table.mutate(|t| t.insert(artifact))?;
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

        let committed = self.table.mutate(|t| Ok(t.commit(uuid)))?;
        if committed.is_some() {
            tracing::debug!(uuid = %uuid, "Committed artifact");
        }
        Ok(committed)
    }

    async fn delete_artifact(&self, uuid: Uuid) -> IndexResult<bool> {
        self.lifecycle.ensure_ready()?;
        require_uuid(uuid)?;

        let removed = self.table.mutate(|t| Ok(t.remove(uuid)))?;
        if removed.is_some() {
            tracing::debug!(uuid = %uuid, "Deleted artifact");
        }
        Ok(removed.is_some())
    }

    async fn update_storage_url(&self, uuid: Uuid, storage_url: &str) -> IndexResult<Artifact> {
        self.lifecycle.ensure_ready()?;
        require_uuid(uuid)?;
        require_non_empty("storage_url", storage_url)?;

        self.table.mutate(|t| {
            t.set_storage_url(uuid, storage_url)
                .ok_or_else(|| StorageError::NotFound { uuid }.into())
        })
    }

    async fn get_artifact(&self, uuid: Uuid) -> IndexResult<Option<Artifact>> {
        self.lifecycle.ensure_ready()?;
        require_uuid(uuid)?;
        self.table.read(|t| t.get(uuid).cloned())
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
        self.table
            .read(|t| t.latest(namespace, auid, url, include_uncommitted))
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
        self.table
            .read(|t| t.version(namespace, auid, url, version, include_uncommitted))
    }

    async fn get_namespaces(&self) -> IndexResult<Vec<String>> {
        self.lifecycle.ensure_ready()?;
        self.table.read(|t| t.namespaces())
    }

    async fn get_au_ids(&self, namespace: &str) -> IndexResult<Vec<String>> {
        self.lifecycle.ensure_ready()?;
        require_non_empty("namespace", namespace)?;
        self.table.read(|t| t.au_ids(namespace))
    }

    async fn get_artifacts(
        &self,
        namespace: &str,
        auid: &str,
        include_uncommitted: bool,
    ) -> IndexResult<Vec<Artifact>> {
        self.lifecycle.ensure_ready()?;
        require_au(namespace, auid)?;
        self.table
            .read(|t| t.au_latest(namespace, auid, include_uncommitted))
    }

    async fn get_artifacts_all_versions(
        &self,
        namespace: &str,
        auid: &str,
        include_uncommitted: bool,
    ) -> IndexResult<Vec<Artifact>> {
        self.lifecycle.ensure_ready()?;
        require_au(namespace, auid)?;
        self.table
            .read(|t| t.au_all_versions(namespace, auid, include_uncommitted))
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
        self.table
            .read(|t| t.url_all_versions(namespace, auid, url, include_uncommitted))
    }

    async fn get_artifacts_with_prefix(
        &self,
        namespace: &str,
        auid: &str,
        prefix: &str,
    ) -> IndexResult<Vec<Artifact>> {
        self.lifecycle.ensure_ready()?;
        require_au(namespace, auid)?;
        self.table.read(|t| t.prefix_latest(namespace, auid, prefix))
    }

    async fn get_artifacts_with_prefix_all_versions(
        &self,
        namespace: &str,
        auid: &str,
        prefix: &str,
    ) -> IndexResult<Vec<Artifact>> {
        self.lifecycle.ensure_ready()?;
        require_au(namespace, auid)?;
        self.table
            .read(|t| t.prefix_all_versions(namespace, auid, prefix))
    }

    async fn get_artifacts_with_url_from_all_aus(
        &self,
        namespace: &str,
        url: &str,
        versions: ArtifactVersions,
    ) -> IndexResult<Vec<Artifact>> {
        self.lifecycle.ensure_ready()?;
        require_cross_au(namespace, "url", url)?;
        self.table
            .read(|t| t.across_aus(namespace, |candidate| candidate == url, versions))
    }

    async fn get_artifacts_with_url_prefix_from_all_aus(
        &self,
        namespace: &str,
        prefix: &str,
        versions: ArtifactVersions,
    ) -> IndexResult<Vec<Artifact>> {
        self.lifecycle.ensure_ready()?;
        require_cross_au(namespace, "prefix", prefix)?;
        self.table.read(|t| {
            t.across_aus(namespace, |candidate| candidate.starts_with(prefix), versions)
        })
    }

    async fn au_size(&self, namespace: &str, auid: &str) -> IndexResult<AuSize> {
        self.lifecycle.ensure_ready()?;
        require_au(namespace, auid)?;

        let (total_latest_versions, total_all_versions) =
            self.table.read(|t| t.size_totals(namespace, auid))?;
        let total_warc_size = self.data_store.au_warc_size(namespace, auid).await?;

        Ok(AuSize {
            total_latest_versions,
            total_all_versions,
            total_warc_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vellum_core::{IndexError, LifecycleError};

    async fn ready_index() -> VolatileArtifactIndex {
        let index = VolatileArtifactIndex::new();
        index.start().await.expect("start");
        index
    }

    fn artifact(url: &str, version: i32) -> Artifact {
        Artifact::new(Uuid::now_v7(), "ns", "au", url, version).with_content(8, "SHA-256:00")
    }

    #[tokio::test]
    async fn test_operations_rejected_before_start() {
        let index = VolatileArtifactIndex::new();
        let result = index.get_namespaces().await;
        assert!(matches!(
            result,
            Err(IndexError::Lifecycle(LifecycleError::NotReady { .. }))
        ));
    }

    #[tokio::test]
    async fn test_operations_rejected_after_stop() {
        let index = ready_index().await;
        index.stop().await.expect("stop");
        let result = index.index_artifact(&artifact("u", 1)).await;
        assert!(matches!(
            result,
            Err(IndexError::Lifecycle(LifecycleError::NotReady { .. }))
        ));
        assert!(matches!(
            index.start().await,
            Err(IndexError::Lifecycle(LifecycleError::Stopped))
        ));
    }

    #[tokio::test]
    async fn test_index_commit_delete() {
        let index = ready_index().await;
        let stored = index.index_artifact(&artifact("u", 1)).await.expect("index");
        assert_eq!(index.len().expect("len"), 1);

        let committed = index.commit_artifact(stored.uuid).await.expect("commit");
        assert!(committed.expect("present").committed);

        assert!(index.delete_artifact(stored.uuid).await.expect("delete"));
        assert!(!index.delete_artifact(stored.uuid).await.expect("delete"));
        assert!(index.is_empty().expect("empty"));
        assert!(index.commit_artifact(stored.uuid).await.expect("commit").is_none());
    }

    #[tokio::test]
    async fn test_update_storage_url_unknown_uuid() {
        let index = ready_index().await;
        let uuid = Uuid::now_v7();
        match index.update_storage_url(uuid, "file:///x").await {
            Err(IndexError::Storage(StorageError::NotFound { uuid: missing })) => {
                assert_eq!(missing, uuid)
            }
            other => panic!("expected not found, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_au_size_without_data_store() {
        let index = ready_index().await;
        assert!(matches!(
            index.au_size("ns", "au").await,
            Err(IndexError::Lifecycle(LifecycleError::DataStoreUnavailable))
        ));
    }

    #[tokio::test]
    async fn test_health_reports_state() {
        let index = VolatileArtifactIndex::new();
        assert!(!index.health_check().await.is_healthy());
        index.start().await.expect("start");
        let health = index.health_check().await;
        assert!(health.is_healthy());
        assert_eq!(
            health.metadata.as_ref().and_then(|m| m.get("artifacts")),
            Some(&serde_json::json!(0))
        );
    }
}

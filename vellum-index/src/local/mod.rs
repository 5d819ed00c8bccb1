//! Local artifact index: in-memory table persisted to an LMDB file.
//!
//! Reads are served from memory exactly as the volatile backend serves them.
//! Every mutation is recorded as a pending change and flushed to disk while
//! the table lock is still held, so the on-disk snapshot never reflects a
//! state the in-memory table did not pass through.
//!
//! Persistence is best-effort: a failed flush is logged, the changes stay
//! pending for the next flush, and the mutation itself still succeeds.

mod lmdb_store;

pub use lmdb_store::LocalStoreError;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use uuid::Uuid;
use vellum_core::{
    require_non_empty, require_uuid, Artifact, ArtifactVersion, ArtifactVersions, AuSize,
    HealthCheck, IndexResult, LocalIndexConfig, StorageError,
};

use crate::data_store::ArtifactDataStore;
use crate::lifecycle::{idle_health, IndexState};
use crate::volatile::VolatileArtifactIndex;
use crate::ArtifactIndex;
use lmdb_store::{LmdbSnapshotStore, PendingChanges};

const COMPONENT: &str = "local_artifact_index";

#[derive(Default)]
struct Persistence {
    store: Option<LmdbSnapshotStore>,
    pending: PendingChanges,
}

impl Persistence {
    fn flush(&mut self) -> IndexResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let Some(store) = self.store.as_ref() else {
            return Err(StorageError::PersistenceFailed {
                reason: format!("{} changes pending with no open store", self.pending.len()),
            }
            .into());
        };
        store.apply(&self.pending)?;
        self.pending.clear();
        Ok(())
    }

    /// Record a change and try to flush everything pending.
    fn record(&mut self, uuid: Uuid, change: Option<Artifact>) {
        self.pending.insert(uuid, change);
        if let Err(e) = self.flush() {
            tracing::warn!(
                uuid = %uuid,
                pending = self.pending.len(),
                error = %e,
                "Failed to persist artifact index change"
            );
        }
    }
}

/// Persistent in-memory [`ArtifactIndex`].
pub struct LocalArtifactIndex {
    config: LocalIndexConfig,
    memory: VolatileArtifactIndex,
    persistence: Mutex<Persistence>,
}

impl LocalArtifactIndex {
    pub fn new(config: LocalIndexConfig) -> Self {
        Self {
            config,
            memory: VolatileArtifactIndex::new(),
            persistence: Mutex::new(Persistence::default()),
        }
    }

    pub fn config(&self) -> &LocalIndexConfig {
        &self.config
    }

    fn persistence(&self) -> MutexGuard<'_, Persistence> {
        match self.persistence.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Number of changes not yet written to disk.
    pub fn pending_writes(&self) -> usize {
        self.persistence().pending.len()
    }

    /// Write every pending change to disk.
    pub fn flush(&self) -> IndexResult<()> {
        self.memory.table.read(|_| self.persistence().flush())?
    }

    fn load(&self) -> IndexResult<()> {
        let store = LmdbSnapshotStore::open(&self.config)?;
        let artifacts = store.load_all()?;
        let found = artifacts.len();

        let restored = self.memory.table.mutate(|table| {
            let mut restored = 0usize;
            for artifact in artifacts {
                let uuid = artifact.uuid;
                match table.restore(artifact) {
                    Ok(()) => restored += 1,
                    Err(e) => tracing::warn!(uuid = %uuid, error = %e, "Skipping persisted artifact"),
                }
            }
            Ok(restored)
        })?;

        self.persistence().store = Some(store);
        tracing::info!(
            path = %self.config.path.display(),
            found,
            restored,
            "Loaded local artifact index"
        );
        Ok(())
    }
}

#[async_trait]
impl ArtifactIndex for LocalArtifactIndex {
    async fn init(&self) -> IndexResult<()> {
        if self.memory.lifecycle.state() == IndexState::Constructed {
            self.load()?;
        }
        self.memory.lifecycle.mark_initialized()
    }

    async fn start(&self) -> IndexResult<()> {
        if self.memory.lifecycle.state() == IndexState::Constructed {
            self.init().await?;
        }
        self.memory.lifecycle.mark_ready()
    }

    async fn stop(&self) -> IndexResult<()> {
        self.memory.lifecycle.mark_stopped();
        let flushed = self.memory.table.read(|_| {
            let mut persistence = self.persistence();
            let flushed = persistence.flush();
            // Release the environment so the path can be reopened.
            persistence.store = None;
            flushed
        })?;
        if let Err(e) = &flushed {
            tracing::error!(
                path = %self.config.path.display(),
                error = %e,
                "Pending artifact index changes lost at shutdown"
            );
        }
        flushed
    }

    fn state(&self) -> IndexState {
        self.memory.state()
    }

    async fn wait_ready(&self, timeout: Duration) -> IndexResult<()> {
        self.memory.wait_ready(timeout).await
    }

    fn set_data_store(&self, store: Arc<dyn ArtifactDataStore>) {
        self.memory.set_data_store(store);
    }

    async fn health_check(&self) -> HealthCheck {
        let started = Instant::now();
        let state = self.memory.lifecycle.state();
        let pending = self.pending_writes();

        let check = match (state, self.memory.len()) {
            (IndexState::Ready, Ok(count)) if pending > 0 => HealthCheck::degraded(
                COMPONENT,
                format!("{} changes not yet persisted", pending),
            )
            .with_metadata("artifacts", serde_json::json!(count)),
            (IndexState::Ready, Ok(count)) => HealthCheck::healthy(COMPONENT)
                .with_metadata("artifacts", serde_json::json!(count)),
            (IndexState::Ready, Err(e)) => HealthCheck::unhealthy(COMPONENT, e.to_string()),
            (state, _) => idle_health(COMPONENT, state),
        };

        check
            .with_metadata("pending_writes", serde_json::json!(pending))
            .with_metadata("path", serde_json::json!(self.config.path.display().to_string()))
            .with_response_time(started.elapsed().as_millis() as i64)
    }

    async fn index_artifact(&self, artifact: &Artifact) -> IndexResult<Artifact> {
        self.memory.lifecycle.ensure_ready()?;
        artifact.validate()?;

        let stored = self.memory.table.mutate(|t| {
            self.memory.lifecycle.ensure_ready()?;
            let stored = t.insert(artifact)?;
            self.persistence().record(stored.uuid, Some(stored.clone()));
            Ok(stored)
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
        self.memory.lifecycle.ensure_ready()?;
        require_uuid(uuid)?;

        self.memory.table.mutate(|t| {
            self.memory.lifecycle.ensure_ready()?;
            let committed = t.commit(uuid);
            if let Some(artifact) = &committed {
                self.persistence().record(uuid, Some(artifact.clone()));
                tracing::debug!(uuid = %uuid, "Committed artifact");
            }
            Ok(committed)
        })
    }

    async fn delete_artifact(&self, uuid: Uuid) -> IndexResult<bool> {
        self.memory.lifecycle.ensure_ready()?;
        require_uuid(uuid)?;

        self.memory.table.mutate(|t| {
            self.memory.lifecycle.ensure_ready()?;
            let removed = t.remove(uuid).is_some();
            if removed {
                self.persistence().record(uuid, None);
                tracing::debug!(uuid = %uuid, "Deleted artifact");
            }
            Ok(removed)
        })
    }

    async fn update_storage_url(&self, uuid: Uuid, storage_url: &str) -> IndexResult<Artifact> {
        self.memory.lifecycle.ensure_ready()?;
        require_uuid(uuid)?;
        require_non_empty("storage_url", storage_url)?;

        self.memory.table.mutate(|t| {
            self.memory.lifecycle.ensure_ready()?;
            let updated = t
                .set_storage_url(uuid, storage_url)
                .ok_or(StorageError::NotFound { uuid })?;
            self.persistence().record(uuid, Some(updated.clone()));
            Ok(updated)
        })
    }

    async fn get_artifact(&self, uuid: Uuid) -> IndexResult<Option<Artifact>> {
        self.memory.get_artifact(uuid).await
    }

    async fn get_latest_artifact(
        &self,
        namespace: &str,
        auid: &str,
        url: &str,
        include_uncommitted: bool,
    ) -> IndexResult<Option<Artifact>> {
        self.memory
            .get_latest_artifact(namespace, auid, url, include_uncommitted)
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
        self.memory
            .get_artifact_version(namespace, auid, url, version, include_uncommitted)
            .await
    }

    async fn get_namespaces(&self) -> IndexResult<Vec<String>> {
        self.memory.get_namespaces().await
    }

    async fn get_au_ids(&self, namespace: &str) -> IndexResult<Vec<String>> {
        self.memory.get_au_ids(namespace).await
    }

    async fn get_artifacts(
        &self,
        namespace: &str,
        auid: &str,
        include_uncommitted: bool,
    ) -> IndexResult<Vec<Artifact>> {
        self.memory
            .get_artifacts(namespace, auid, include_uncommitted)
            .await
    }

    async fn get_artifacts_all_versions(
        &self,
        namespace: &str,
        auid: &str,
        include_uncommitted: bool,
    ) -> IndexResult<Vec<Artifact>> {
        self.memory
            .get_artifacts_all_versions(namespace, auid, include_uncommitted)
            .await
    }

    async fn get_artifact_all_versions(
        &self,
        namespace: &str,
        auid: &str,
        url: &str,
        include_uncommitted: bool,
    ) -> IndexResult<Vec<Artifact>> {
        self.memory
            .get_artifact_all_versions(namespace, auid, url, include_uncommitted)
            .await
    }

    async fn get_artifacts_with_prefix(
        &self,
        namespace: &str,
        auid: &str,
        prefix: &str,
    ) -> IndexResult<Vec<Artifact>> {
        self.memory
            .get_artifacts_with_prefix(namespace, auid, prefix)
            .await
    }

    async fn get_artifacts_with_prefix_all_versions(
        &self,
        namespace: &str,
        auid: &str,
        prefix: &str,
    ) -> IndexResult<Vec<Artifact>> {
        self.memory
            .get_artifacts_with_prefix_all_versions(namespace, auid, prefix)
            .await
    }

    async fn get_artifacts_with_url_from_all_aus(
        &self,
        namespace: &str,
        url: &str,
        versions: ArtifactVersions,
    ) -> IndexResult<Vec<Artifact>> {
        self.memory
            .get_artifacts_with_url_from_all_aus(namespace, url, versions)
            .await
    }

    async fn get_artifacts_with_url_prefix_from_all_aus(
        &self,
        namespace: &str,
        prefix: &str,
        versions: ArtifactVersions,
    ) -> IndexResult<Vec<Artifact>> {
        self.memory
            .get_artifacts_with_url_prefix_from_all_aus(namespace, prefix, versions)
            .await
    }

    async fn au_size(&self, namespace: &str, auid: &str) -> IndexResult<AuSize> {
        self.memory.au_size(namespace, auid).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> LocalIndexConfig {
        let mut config = LocalIndexConfig::new(dir.path().join("index"));
        config.max_size_mb = 16;
        config
    }

    fn artifact(url: &str, version: i32) -> Artifact {
        Artifact::new(Uuid::now_v7(), "ns", "au", url, version)
            .with_storage_url("file:///tmp/a.warc")
            .with_content(5, "SHA-256:00")
    }

    async fn started(config: LocalIndexConfig) -> LocalArtifactIndex {
        let index = LocalArtifactIndex::new(config);
        index.start().await.expect("start");
        index
    }

    #[tokio::test]
    async fn test_mutations_are_flushed_immediately() {
        let dir = TempDir::new().expect("tempdir");
        let index = started(config(&dir)).await;

        let stored = index.index_artifact(&artifact("u", 1)).await.expect("index");
        index.commit_artifact(stored.uuid).await.expect("commit");
        assert_eq!(index.pending_writes(), 0);
        assert!(index.health_check().await.is_healthy());
        index.stop().await.expect("stop");
    }

    #[test]
    fn test_flush_without_store_keeps_pending() {
        let mut persistence = Persistence::default();
        assert!(persistence.flush().is_ok());

        let stored = artifact("u", 1);
        persistence.record(stored.uuid, Some(stored.clone()));
        match persistence.flush() {
            Err(vellum_core::IndexError::Storage(StorageError::PersistenceFailed { .. })) => {}
            other => panic!("Expected PersistenceFailed, got: {:?}", other),
        }
        assert_eq!(persistence.pending.len(), 1);
    }

    #[tokio::test]
    async fn test_mutations_after_stop_are_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let index = started(config(&dir)).await;
        let stored = index.index_artifact(&artifact("u", 1)).await.expect("index");
        index.stop().await.expect("stop");

        assert!(index.index_artifact(&artifact("v", 1)).await.is_err());
        assert!(index.commit_artifact(stored.uuid).await.is_err());
        assert!(index.delete_artifact(stored.uuid).await.is_err());
        assert_eq!(index.pending_writes(), 0);
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let dir = TempDir::new().expect("tempdir");

        let index = started(config(&dir)).await;
        let kept = index.index_artifact(&artifact("kept", 1)).await.expect("index");
        index.commit_artifact(kept.uuid).await.expect("commit");
        let moved = index.index_artifact(&artifact("moved", 1)).await.expect("index");
        index
            .update_storage_url(moved.uuid, "file:///tmp/b.warc")
            .await
            .expect("update");
        let gone = index.index_artifact(&artifact("gone", 1)).await.expect("index");
        index.delete_artifact(gone.uuid).await.expect("delete");
        index.stop().await.expect("stop");
        drop(index);

        let reopened = started(config(&dir)).await;
        let kept_again = reopened.get_artifact(kept.uuid).await.expect("get").expect("kept");
        assert!(kept_again.committed);
        let moved_again = reopened.get_artifact(moved.uuid).await.expect("get").expect("moved");
        assert!(!moved_again.committed);
        assert_eq!(moved_again.storage_url, "file:///tmp/b.warc");
        assert!(reopened.get_artifact(gone.uuid).await.expect("get").is_none());
        reopened.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn test_init_is_idempotent() {
        let dir = TempDir::new().expect("tempdir");
        let index = LocalArtifactIndex::new(config(&dir));
        index.init().await.expect("init");
        index.init().await.expect("second init");
        index.start().await.expect("start");
        assert!(index.is_ready());
        index.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn test_unopenable_path_fails_init() {
        let dir = TempDir::new().expect("tempdir");
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"not a directory").expect("write");

        let index = LocalArtifactIndex::new(LocalIndexConfig::new(blocker.join("index")));
        assert!(index.start().await.is_err());
        assert_eq!(index.state(), IndexState::Constructed);
    }
}

//! Local backend: shared conformance suite plus restart recovery.

use std::sync::Arc;
use std::time::Duration;

use vellum_index::{ArtifactIndex, IndexState, LocalArtifactIndex};
use vellum_test_utils::fixtures::{artifact, artifact_with_length, local_config, long_url};
use vellum_test_utils::assertions::assert_not_ready;
use vellum_test_utils::{AuSize, HealthStatus, IndexError, MockDataStore, StorageError};

vellum_test_utils::artifact_index_conformance!(vellum_test_utils::local_test_index);

async fn open(config: &vellum_test_utils::LocalIndexConfig) -> LocalArtifactIndex {
    let index = LocalArtifactIndex::new(config.clone());
    index.set_data_store(Arc::new(MockDataStore::new()));
    index.start().await.expect("start");
    index
}

#[tokio::test]
async fn restart_recovers_every_mutation() {
    vellum_test_utils::init_test_tracing();
    let dir = tempfile::tempdir().expect("tempdir");
    let config = local_config(dir.path());
    let url = "http://example.com/page";

    let (v1, v2, pending, moved) = {
        let index = open(&config).await;
        let v1 = index.index_artifact(&artifact("ns", "au", url, 1)).await.expect("v1");
        let v1 = index.commit_artifact(v1.uuid).await.expect("commit").expect("v1");
        let v2 = index.index_artifact(&artifact("ns", "au", url, 2)).await.expect("v2");
        let v2 = index.commit_artifact(v2.uuid).await.expect("commit").expect("v2");
        let pending = index
            .index_artifact(&artifact("ns", "au", url, 3))
            .await
            .expect("v3");
        let gone = index
            .index_artifact(&artifact("ns", "au2", url, 1))
            .await
            .expect("gone");
        assert!(index.delete_artifact(gone.uuid).await.expect("delete"));
        let moved = index
            .update_storage_url(v1.uuid, "file:///permanent/v1.warc")
            .await
            .expect("update");
        assert_eq!(index.pending_writes(), 0);
        index.stop().await.expect("stop");
        (v1, v2, pending, moved)
    };

    let index = open(&config).await;
    assert_eq!(index.get_artifact(v1.uuid).await.expect("get"), Some(moved));
    assert_eq!(index.get_artifact(v2.uuid).await.expect("get"), Some(v2.clone()));
    assert_eq!(
        index.get_latest_artifact("ns", "au", url, false).await.expect("latest"),
        Some(v2)
    );
    assert_eq!(
        index.get_latest_artifact("ns", "au", url, true).await.expect("latest"),
        Some(pending)
    );
    assert_eq!(index.get_au_ids("ns").await.expect("aus"), vec!["au"]);
    index.stop().await.expect("stop");
}

#[tokio::test]
async fn restart_preserves_size_accounting() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = local_config(dir.path());

    let before = {
        let index = open(&config).await;
        for (url, version, length) in [("http://a/", 1, 10), ("http://a/", 2, 20), ("http://b/", 1, 5)] {
            let stored = index
                .index_artifact(&artifact_with_length("ns", "au", url, version, length))
                .await
                .expect("index");
            index.commit_artifact(stored.uuid).await.expect("commit");
        }
        let size = index.au_size("ns", "au").await.expect("size");
        index.stop().await.expect("stop");
        size
    };
    assert_eq!(
        before,
        AuSize {
            total_latest_versions: 25,
            total_all_versions: 35,
            total_warc_size: 0,
        }
    );

    let index = open(&config).await;
    assert_eq!(index.au_size("ns", "au").await.expect("size"), before);
    index.stop().await.expect("stop");
}

#[tokio::test]
async fn long_urls_survive_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = local_config(dir.path());
    let url = long_url(30_000);

    let stored = {
        let index = open(&config).await;
        let stored = index.index_artifact(&artifact("ns", "au", &url, 1)).await.expect("index");
        index.stop().await.expect("stop");
        stored
    };

    let index = open(&config).await;
    assert_eq!(
        index.get_latest_artifact("ns", "au", &url, true).await.expect("latest"),
        Some(stored)
    );
    index.stop().await.expect("stop");
}

#[tokio::test]
async fn health_reports_persistence_state() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = local_config(dir.path());
    let index = LocalArtifactIndex::new(config.clone());

    assert_eq!(index.health_check().await.status, HealthStatus::Unknown);

    index.start().await.expect("start");
    let health = index.health_check().await;
    assert_eq!(health.status, HealthStatus::Healthy);
    let metadata = health.metadata.expect("metadata");
    assert_eq!(metadata.get("pending_writes"), Some(&serde_json::json!(0)));

    index.stop().await.expect("stop");
    assert_eq!(index.state(), IndexState::Stopped);
    assert_eq!(index.health_check().await.status, HealthStatus::Unhealthy);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn writes_racing_stop_are_persisted_or_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = local_config(dir.path());
    let index = Arc::new(open(&config).await);

    let writers: Vec<_> = (0..8)
        .map(|w| {
            let index = Arc::clone(&index);
            tokio::spawn(async move {
                let mut acked = Vec::new();
                for i in 0..2000 {
                    let url = format!("http://example.com/w{}/{}", w, i);
                    match index.index_artifact(&artifact("ns", "au", &url, 1)).await {
                        Ok(stored) => acked.push(stored.uuid),
                        Err(e) => {
                            assert_not_ready(&Err::<(), _>(e));
                            break;
                        }
                    }
                    tokio::task::yield_now().await;
                }
                acked
            })
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(5)).await;
    index.stop().await.expect("stop");

    let mut acked = Vec::new();
    for writer in writers {
        acked.extend(writer.await.expect("writer"));
    }
    assert_eq!(index.pending_writes(), 0);
    drop(index);

    let reopened = open(&config).await;
    for uuid in &acked {
        assert!(
            reopened.get_artifact(*uuid).await.expect("get").is_some(),
            "acknowledged artifact {} missing after restart",
            uuid
        );
    }
    reopened.stop().await.expect("stop");
}

#[tokio::test]
async fn failed_flush_keeps_mutations_pending() {
    vellum_test_utils::init_test_tracing();
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = local_config(dir.path());
    config.max_size_mb = 1;
    let index = open(&config).await;

    let mut stored = Vec::new();
    for i in 0..40 {
        let url = format!("{}/{}", long_url(60_000), i);
        let artifact = index
            .index_artifact(&artifact("ns", "au", &url, 1))
            .await
            .expect("mutation is acknowledged even when the flush fails");
        stored.push(artifact);
    }

    assert!(index.pending_writes() > 0);
    for artifact in &stored {
        assert_eq!(
            index.get_artifact(artifact.uuid).await.expect("get").as_ref(),
            Some(artifact)
        );
    }
    assert_eq!(
        index.get_artifacts("ns", "au", true).await.expect("list").len(),
        stored.len()
    );

    let health = index.health_check().await;
    assert_eq!(health.status, HealthStatus::Degraded);
    let pending = index.pending_writes();
    let metadata = health.metadata.expect("metadata");
    assert_eq!(metadata.get("pending_writes"), Some(&serde_json::json!(pending)));

    match index.stop().await {
        Err(IndexError::Storage(StorageError::PersistenceFailed { .. })) => {}
        other => panic!("Expected PersistenceFailed, got: {:?}", other),
    }
}

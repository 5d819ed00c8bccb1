//! Volatile backend: shared conformance suite plus concurrency and lifecycle checks.

use std::sync::Arc;
use std::time::Duration;

use vellum_index::{ArtifactIndex, IndexState, VolatileArtifactIndex};
use vellum_test_utils::fixtures::artifact;
use vellum_test_utils::{IndexError, LifecycleError};

vellum_test_utils::artifact_index_conformance!(vellum_test_utils::volatile_test_index);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writers_are_all_applied() {
    let index = Arc::new(VolatileArtifactIndex::new());
    index.start().await.expect("start");

    let mut tasks = Vec::new();
    for writer in 0..8 {
        let index = Arc::clone(&index);
        tasks.push(tokio::spawn(async move {
            for n in 0..25 {
                let url = format!("http://example.com/{}/{}", writer, n);
                let stored = index
                    .index_artifact(&artifact("ns", "au", &url, 1))
                    .await
                    .expect("index");
                index.commit_artifact(stored.uuid).await.expect("commit");
            }
        }));
    }
    for task in tasks {
        task.await.expect("writer task");
    }

    assert_eq!(index.len().expect("len"), 200);
    let listed = index.get_artifacts("ns", "au", false).await.expect("list");
    assert_eq!(listed.len(), 200);
    assert!(listed.iter().all(|a| a.committed));
}

#[tokio::test]
async fn wait_ready_unblocks_on_start() {
    let index = Arc::new(VolatileArtifactIndex::new());

    let waiter = {
        let index = Arc::clone(&index);
        tokio::spawn(async move { index.wait_ready(Duration::from_secs(5)).await })
    };
    tokio::task::yield_now().await;
    index.start().await.expect("start");

    waiter.await.expect("waiter task").expect("ready");
    assert_eq!(index.state(), IndexState::Ready);
}

#[tokio::test]
async fn wait_ready_times_out_without_start() {
    let index = VolatileArtifactIndex::new();
    index.init().await.expect("init");

    match index.wait_ready(Duration::from_millis(20)).await {
        Err(IndexError::Lifecycle(LifecycleError::Timeout { waited })) => {
            assert_eq!(waited, Duration::from_millis(20))
        }
        other => panic!("expected timeout, got {:?}", other),
    }
}

#[tokio::test]
async fn wait_ready_fails_when_stopped() {
    let index = Arc::new(VolatileArtifactIndex::new());

    let waiter = {
        let index = Arc::clone(&index);
        tokio::spawn(async move { index.wait_ready(Duration::from_secs(5)).await })
    };
    tokio::task::yield_now().await;
    index.stop().await.expect("stop");

    assert!(matches!(
        waiter.await.expect("waiter task"),
        Err(IndexError::Lifecycle(LifecycleError::Stopped))
    ));
}

//! Vellum Test Utilities
//!
//! Shared test infrastructure for the Vellum workspace:
//! - A mock content store reporting configurable WARC sizes
//! - A started-index harness with per-backend factories
//! - Proptest generators for artifacts and index operations
//! - Fixtures and custom assertions
//! - The conformance suite every [`ArtifactIndex`] backend must pass

pub mod conformance;

// Re-export core types for convenience
pub use vellum_core::{
    compute_content_digest, Artifact, ArtifactStem, ArtifactVersion, ArtifactVersions, AuSize,
    HealthStatus, IndexError, IndexResult, LifecycleError, LocalIndexConfig, RetryConfig,
    SqlIndexConfig, StorageError, Timestamp, ValidationError,
};
pub use vellum_index::{
    ArtifactDataStore, ArtifactIndex, LocalArtifactIndex, PgConnectionManager, SqlArtifactIndex,
    VolatileArtifactIndex,
};

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::ops::Deref;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

/// How long a harness waits for a freshly started index.
pub const READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Install a fmt subscriber filtered by `RUST_LOG` (default `warn`).
/// Safe to call from every test; only the first call installs anything.
pub fn init_test_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

// ============================================================================
// MOCK CONTENT STORE
// ============================================================================

/// Content store stand-in that reports whatever WARC size a test sets.
/// Unknown AUs report zero.
#[derive(Debug, Default)]
pub struct MockDataStore {
    sizes: Mutex<HashMap<(String, String), i64>>,
}

impl MockDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_warc_size(&self, namespace: &str, auid: &str, size: i64) {
        let mut sizes = match self.sizes.lock() {
            Ok(sizes) => sizes,
            Err(poisoned) => poisoned.into_inner(),
        };
        sizes.insert((namespace.to_string(), auid.to_string()), size);
    }
}

#[async_trait]
impl ArtifactDataStore for MockDataStore {
    async fn au_warc_size(&self, namespace: &str, auid: &str) -> IndexResult<i64> {
        let sizes = self.sizes.lock().map_err(|_| StorageError::LockPoisoned)?;
        Ok(sizes
            .get(&(namespace.to_string(), auid.to_string()))
            .copied()
            .unwrap_or(0))
    }
}

// ============================================================================
// TEST HARNESS
// ============================================================================

type Teardown = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A started index with a [`MockDataStore`] registered.
///
/// Dereferences to the index itself. Call [`TestIndex::teardown`] at the end
/// of a test to stop the index and release whatever backs it.
pub struct TestIndex {
    index: Arc<dyn ArtifactIndex>,
    pub data_store: Arc<MockDataStore>,
    teardown: Option<Teardown>,
    // Dropped last so backing files outlive the index.
    guard: Option<Box<dyn Any + Send>>,
}

impl TestIndex {
    /// Register a mock content store, start `index` and wait until it is ready.
    pub async fn start<I>(index: Arc<I>) -> Self
    where
        I: ArtifactIndex + 'static,
    {
        let index: Arc<dyn ArtifactIndex> = index;
        let data_store = Arc::new(MockDataStore::new());
        index.set_data_store(data_store.clone());
        index.start().await.expect("index should start");
        index
            .wait_ready(READY_TIMEOUT)
            .await
            .expect("index should become ready");

        Self {
            index,
            data_store,
            teardown: None,
            guard: None,
        }
    }

    /// Keep `guard` alive for as long as the harness.
    pub fn with_guard(mut self, guard: impl Any + Send) -> Self {
        self.guard = Some(Box::new(guard));
        self
    }

    /// Run `teardown` after the index has been stopped.
    pub fn with_teardown(mut self, teardown: impl Future<Output = ()> + Send + 'static) -> Self {
        self.teardown = Some(Box::pin(teardown));
        self
    }

    pub fn index(&self) -> Arc<dyn ArtifactIndex> {
        Arc::clone(&self.index)
    }

    /// Index `artifact` and commit it, returning the committed record.
    pub async fn index_committed(&self, artifact: &Artifact) -> Artifact {
        let stored = self.index_uncommitted(artifact).await;
        self.index
            .commit_artifact(stored.uuid)
            .await
            .expect("commit should succeed")
            .expect("indexed artifact should be committable")
    }

    /// Index `artifact`, leaving it uncommitted.
    pub async fn index_uncommitted(&self, artifact: &Artifact) -> Artifact {
        self.index
            .index_artifact(artifact)
            .await
            .expect("index should succeed")
    }

    pub async fn teardown(mut self) {
        self.index.stop().await.expect("index should stop");
        if let Some(teardown) = self.teardown.take() {
            teardown.await;
        }
    }
}

impl Deref for TestIndex {
    type Target = dyn ArtifactIndex;

    fn deref(&self) -> &Self::Target {
        self.index.as_ref()
    }
}

// ============================================================================
// BACKEND FACTORIES
// ============================================================================

pub async fn volatile_test_index() -> TestIndex {
    init_test_tracing();
    TestIndex::start(Arc::new(VolatileArtifactIndex::new())).await
}

/// Local index in a fresh temporary directory, removed on teardown.
pub async fn local_test_index() -> TestIndex {
    init_test_tracing();
    let dir = tempfile::tempdir().expect("create temp dir");
    let index = LocalArtifactIndex::new(fixtures::local_config(dir.path()));
    TestIndex::start(Arc::new(index)).await.with_guard(dir)
}

/// SQL index in a fresh PostgreSQL schema, dropped on teardown.
///
/// Connects with `VELLUM_DB_*` settings.
pub async fn sql_test_index() -> TestIndex {
    init_test_tracing();
    let mut config = SqlIndexConfig::from_env();
    config.search_path = Some(format!("vellum_test_{}", Uuid::new_v4().simple()));
    config.retry = RetryConfig {
        max_retries: 3,
        retry_delay: Duration::from_millis(50),
    };

    // Stopping the index closes its pool, so schema setup and teardown use their own.
    let admin = PgConnectionManager::from_config(&config).expect("create pool");
    admin.install_schema().await.expect("install schema");

    let index = SqlArtifactIndex::from_config(&config).expect("create pool");
    TestIndex::start(Arc::new(index))
        .await
        .with_teardown(async move {
            if let Err(e) = admin.drop_schema().await {
                eprintln!("failed to drop test schema: {}", e);
            }
        })
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for artifacts and index operations.
    //!
    //! Value domains are deliberately small so generated operations collide
    //! on namespaces, AUs, URLs and versions.

    use super::*;
    use proptest::prelude::*;

    pub fn arb_uuid() -> impl Strategy<Value = Uuid> {
        any::<[u8; 16]>()
            .prop_filter("nil uuid", |bytes| bytes.iter().any(|b| *b != 0))
            .prop_map(Uuid::from_bytes)
    }

    pub fn arb_namespace() -> impl Strategy<Value = String> {
        prop_oneof![Just("ns1".to_string()), Just("ns2".to_string())]
    }

    pub fn arb_auid() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("au1".to_string()),
            Just("au2".to_string()),
            Just("au3".to_string()),
        ]
    }

    /// URLs sharing prefixes, including LIKE metacharacters.
    pub fn arb_url() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("http://example.com/".to_string()),
            Just("http://example.com/a".to_string()),
            Just("http://example.com/a/b".to_string()),
            Just("http://example.com/a_b".to_string()),
            Just("http://example.com/100%".to_string()),
            "http://example\\.com/[a-z]{1,3}",
        ]
    }

    /// URL prefixes likely to match some of [`arb_url`].
    pub fn arb_url_prefix() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("http://".to_string()),
            Just("http://example.com/a".to_string()),
            Just("http://example.com/a_".to_string()),
            Just("http://example.com/100%".to_string()),
            Just("https://".to_string()),
        ]
    }

    pub fn arb_version() -> impl Strategy<Value = ArtifactVersion> {
        1..=4i32
    }

    pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        // 2020-01-01 .. 2030-01-01, millisecond precision
        (1_577_836_800_000i64..1_893_456_000_000i64).prop_map(|millis| {
            chrono::DateTime::from_timestamp_millis(millis).unwrap_or_else(vellum_core::collection_now)
        })
    }

    /// A valid, uncommitted artifact.
    pub fn arb_artifact() -> impl Strategy<Value = Artifact> {
        (
            arb_uuid(),
            arb_namespace(),
            arb_auid(),
            arb_url(),
            arb_version(),
            0..10_000i64,
            arb_timestamp(),
        )
            .prop_map(|(uuid, namespace, auid, url, version, length, date)| {
                fixtures::artifact_with_uuid(uuid, &namespace, &auid, &url, version, length)
                    .with_collection_date(date)
            })
    }

    /// One step of a randomized index workload.
    ///
    /// `Commit`, `Delete` and `UpdateStorageUrl` pick their target by position
    /// among the artifacts indexed so far (modulo their count), so most steps
    /// hit a live artifact while some hit deleted ones.
    #[derive(Debug, Clone)]
    pub enum IndexOp {
        Index(Artifact),
        Commit(usize),
        Delete(usize),
        UpdateStorageUrl(usize, String),
    }

    pub fn arb_index_op() -> impl Strategy<Value = IndexOp> {
        prop_oneof![
            4 => arb_artifact().prop_map(IndexOp::Index),
            3 => any::<usize>().prop_map(IndexOp::Commit),
            1 => any::<usize>().prop_map(IndexOp::Delete),
            1 => (any::<usize>(), "file:///warcs/[a-z]{1,8}\\.warc")
                .prop_map(|(target, url)| IndexOp::UpdateStorageUrl(target, url)),
        ]
    }

    pub fn arb_index_ops(max: usize) -> impl Strategy<Value = Vec<IndexOp>> {
        prop::collection::vec(arb_index_op(), 1..max)
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built artifacts and configurations.

    use super::*;
    use std::path::Path;

    /// Artifact whose content is a short body derived from its stem and version.
    pub fn artifact(namespace: &str, auid: &str, url: &str, version: ArtifactVersion) -> Artifact {
        let body = format!("{} {} {} v{}", namespace, auid, url, version);
        artifact_with_length(namespace, auid, url, version, body.len() as i64)
            .with_content(body.len() as i64, compute_content_digest(body.as_bytes()))
    }

    /// Artifact with an explicit content length, for size accounting.
    pub fn artifact_with_length(
        namespace: &str,
        auid: &str,
        url: &str,
        version: ArtifactVersion,
        content_length: i64,
    ) -> Artifact {
        let uuid = vellum_core::new_artifact_uuid();
        artifact_with_uuid(uuid, namespace, auid, url, version, content_length)
    }

    pub fn artifact_with_uuid(
        uuid: Uuid,
        namespace: &str,
        auid: &str,
        url: &str,
        version: ArtifactVersion,
        content_length: i64,
    ) -> Artifact {
        let digest = compute_content_digest(format!("{}:{}", uuid, content_length).as_bytes());
        Artifact::new(uuid, namespace, auid, url, version)
            .with_storage_url(format!("file:///warcs/{}/{}.warc", auid, uuid))
            .with_content(content_length, digest)
    }

    /// A URL of exactly `len` bytes.
    pub fn long_url(len: usize) -> String {
        let base = "http://example.com/";
        let mut url = String::with_capacity(len);
        url.push_str(base);
        let path = "abcdefghij";
        while url.len() < len {
            let take = (len - url.len()).min(path.len());
            url.push_str(&path[..take]);
        }
        url
    }

    /// Local index settings under `dir` with a small map size.
    pub fn local_config(dir: &Path) -> LocalIndexConfig {
        let mut config = LocalIndexConfig::new(dir.join("index"));
        config.max_size_mb = 64;
        config
    }

    pub fn uuids(artifacts: &[Artifact]) -> Vec<Uuid> {
        artifacts.iter().map(|a| a.uuid).collect()
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions over index results.

    use super::*;
    use std::cmp::Ordering;
    use vellum_index::ordering::{cmp_across_aus, cmp_within_au};

    #[track_caller]
    pub fn assert_invalid_argument<T: std::fmt::Debug>(result: &IndexResult<T>) {
        match result {
            Err(IndexError::Validation(
                ValidationError::RequiredFieldMissing { .. } | ValidationError::InvalidValue { .. },
            )) => {}
            other => panic!("Expected invalid argument, got: {:?}", other),
        }
    }

    /// Assert an invalid-argument error naming `field`.
    #[track_caller]
    pub fn assert_required_field<T: std::fmt::Debug>(result: &IndexResult<T>, field: &str) {
        match result {
            Err(IndexError::Validation(ValidationError::RequiredFieldMissing { field: f }))
            | Err(IndexError::Validation(ValidationError::InvalidValue { field: f, .. })) => {
                assert_eq!(f, field, "Wrong field in validation error");
            }
            other => panic!("Expected invalid {}, got: {:?}", field, other),
        }
    }

    #[track_caller]
    pub fn assert_not_found_error<T: std::fmt::Debug>(result: &IndexResult<T>, uuid: Uuid) {
        match result {
            Err(IndexError::Storage(StorageError::NotFound { uuid: missing })) => {
                assert_eq!(*missing, uuid, "Wrong uuid in NotFound error");
            }
            other => panic!("Expected NotFound for {}, got: {:?}", uuid, other),
        }
    }

    #[track_caller]
    pub fn assert_already_exists<T: std::fmt::Debug>(result: &IndexResult<T>, uuid: Uuid) {
        match result {
            Err(IndexError::Storage(StorageError::AlreadyExists { uuid: existing })) => {
                assert_eq!(*existing, uuid, "Wrong uuid in AlreadyExists error");
            }
            other => panic!("Expected AlreadyExists for {}, got: {:?}", uuid, other),
        }
    }

    #[track_caller]
    pub fn assert_constraint_violation<T: std::fmt::Debug>(
        result: &IndexResult<T>,
        constraint: &str,
    ) {
        match result {
            Err(IndexError::Validation(ValidationError::ConstraintViolation {
                constraint: c, ..
            })) => {
                assert_eq!(c, constraint, "Wrong constraint in violation");
            }
            other => panic!("Expected {} violation, got: {:?}", constraint, other),
        }
    }

    #[track_caller]
    pub fn assert_not_ready<T: std::fmt::Debug>(result: &IndexResult<T>) {
        match result {
            Err(IndexError::Lifecycle(LifecycleError::NotReady { .. })) => {}
            other => panic!("Expected NotReady, got: {:?}", other),
        }
    }

    /// Assert `actual` holds exactly `expected`, in order, compared by uuid.
    #[track_caller]
    pub fn assert_artifacts(actual: &[Artifact], expected: &[&Artifact]) {
        let describe = |a: &Artifact| format!("{}@{}/v{}", a.url, a.auid, a.version);
        let actual_ids: Vec<Uuid> = actual.iter().map(|a| a.uuid).collect();
        let expected_ids: Vec<Uuid> = expected.iter().map(|a| a.uuid).collect();
        assert_eq!(
            actual_ids,
            expected_ids,
            "Expected {:?}, got {:?}",
            expected.iter().map(|a| describe(*a)).collect::<Vec<_>>(),
            actual.iter().map(describe).collect::<Vec<_>>(),
        );
    }

    /// URL ascending, then version descending.
    #[track_caller]
    pub fn assert_within_au_order(artifacts: &[Artifact]) {
        for pair in artifacts.windows(2) {
            assert_ne!(
                cmp_within_au(&pair[0], &pair[1]),
                Ordering::Greater,
                "{} v{} listed before {} v{}",
                pair[0].url,
                pair[0].version,
                pair[1].url,
                pair[1].version,
            );
        }
    }

    /// URL ascending, then AU ascending, then version descending.
    #[track_caller]
    pub fn assert_cross_au_order(artifacts: &[Artifact]) {
        for pair in artifacts.windows(2) {
            assert_ne!(
                cmp_across_aus(&pair[0], &pair[1]),
                Ordering::Greater,
                "{}@{} v{} listed before {}@{} v{}",
                pair[0].url,
                pair[0].auid,
                pair[0].version,
                pair[1].url,
                pair[1].auid,
                pair[1].version,
            );
        }
    }
}

// ============================================================================
// CONFORMANCE SUITE MACRO
// ============================================================================

/// Generate one `#[tokio::test]` per conformance case, each against a fresh
/// index from `$factory` (an async fn returning [`TestIndex`]).
///
/// ```ignore
/// vellum_test_utils::artifact_index_conformance!(vellum_test_utils::volatile_test_index);
/// ```
#[macro_export]
macro_rules! artifact_index_conformance {
    ($factory:path) => {
        $crate::artifact_index_conformance!(@cases $factory;
            index_then_get_is_uncommitted,
            commit_is_idempotent,
            unknown_uuid_is_not_found,
            delete_removes_artifact,
            latest_respects_commit_state,
            latest_absent_without_eligible_version,
            deleting_latest_falls_back,
            artifact_version_lookup,
            update_storage_url_round_trip,
            update_storage_url_unknown_uuid,
            nil_uuid_is_invalid,
            invalid_artifact_rejected,
            blank_arguments_are_invalid,
            namespaces_and_au_ids,
            get_artifacts_commit_scenario,
            get_artifacts_latest_per_url,
            all_versions_ordering,
            prefix_search_latest_committed,
            prefix_search_is_literal,
            prefix_search_all_versions,
            empty_prefix_matches_whole_au,
            cross_au_url_search,
            cross_au_prefix_search,
            au_size_additivity,
            au_size_empty_au_is_zero,
            au_size_ignores_uncommitted,
            duplicate_uuid_rejected,
            duplicate_stem_version_rejected,
            long_url_round_trip,
            stopped_index_rejects_operations,
        );
    };
    (@cases $factory:path; $($case:ident),+ $(,)?) => {
        $(
            #[::tokio::test]
            async fn $case() {
                let harness = $factory().await;
                $crate::conformance::$case(&harness).await;
                harness.teardown().await;
            }
        )+
    };
}

// ============================================================================
// TESTS
// ============================================================================

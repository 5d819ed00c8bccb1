//! Vellum Core - Artifact Types
//!
//! Pure data structures shared by every artifact index backend.
//! This crate contains ONLY data types, validation and configuration - no I/O.

pub mod config;
pub mod error;
pub mod health;

pub use config::{BackendKind, IndexConfig, LocalIndexConfig, RetryConfig, SqlIndexConfig};
pub use error::{
    ConfigError, IndexError, IndexResult, LifecycleError, StorageError, ValidationError,
};
pub use health::{HealthCheck, HealthStatus};

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Current time at the millisecond precision collection dates are recorded with.
pub fn collection_now() -> Timestamp {
    Utc::now().trunc_subsecs(3)
}

/// Artifact version number. Versions start at 1 and are assigned by the caller.
pub type ArtifactVersion = i32;

/// Generate a new artifact identifier (UUIDv7, timestamp-sortable).
pub fn new_artifact_uuid() -> Uuid {
    Uuid::now_v7()
}

/// Compute the `SHA-256:<hex>` digest string recorded for captured content.
pub fn compute_content_digest(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("SHA-256:{}", hex::encode(hasher.finalize()))
}

// ============================================================================
// ARTIFACT STEM
// ============================================================================

/// The (namespace, auid, url) position shared by every version of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArtifactStem {
    pub namespace: String,
    pub auid: String,
    pub url: String,
}

impl ArtifactStem {
    pub fn new(
        namespace: impl Into<String>,
        auid: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            auid: auid.into(),
            url: url.into(),
        }
    }
}

impl fmt::Display for ArtifactStem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.auid, self.url)
    }
}

/// Identity of one specific version of one resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactIdentifier {
    pub uuid: Uuid,
    pub stem: ArtifactStem,
    pub version: ArtifactVersion,
}

// ============================================================================
// ARTIFACT
// ============================================================================

/// Index record for one version of one captured web resource.
///
/// Identity (`uuid`, stem, `version`) never changes once indexed. Only
/// `committed` and `storage_url` are mutated by the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Caller-assigned primary key
    pub uuid: Uuid,
    /// Partition (tenant/collection) the artifact belongs to
    pub namespace: String,
    /// Owning Archival Unit
    pub auid: String,
    /// Captured resource URL
    pub url: String,
    /// Caller-assigned version, unique within the stem
    pub version: ArtifactVersion,
    /// Whether the artifact is visible to committed-only queries
    pub committed: bool,
    /// Opaque locator into the content store
    pub storage_url: String,
    /// Length of the captured content in bytes
    pub content_length: i64,
    /// Digest of the captured content
    pub content_digest: String,
    /// When the resource was captured
    pub collection_date: Timestamp,
}

impl Artifact {
    /// Create an uncommitted artifact with empty content metadata.
    pub fn new(
        uuid: Uuid,
        namespace: impl Into<String>,
        auid: impl Into<String>,
        url: impl Into<String>,
        version: ArtifactVersion,
    ) -> Self {
        Self {
            uuid,
            namespace: namespace.into(),
            auid: auid.into(),
            url: url.into(),
            version,
            committed: false,
            storage_url: String::new(),
            content_length: 0,
            content_digest: String::new(),
            collection_date: collection_now(),
        }
    }

    pub fn with_storage_url(mut self, storage_url: impl Into<String>) -> Self {
        self.storage_url = storage_url.into();
        self
    }

    pub fn with_content(mut self, content_length: i64, content_digest: impl Into<String>) -> Self {
        self.content_length = content_length;
        self.content_digest = content_digest.into();
        self
    }

    pub fn with_collection_date(mut self, collection_date: Timestamp) -> Self {
        self.collection_date = collection_date;
        self
    }

    pub fn with_committed(mut self, committed: bool) -> Self {
        self.committed = committed;
        self
    }

    pub fn stem(&self) -> ArtifactStem {
        ArtifactStem::new(&self.namespace, &self.auid, &self.url)
    }

    pub fn identifier(&self) -> ArtifactIdentifier {
        ArtifactIdentifier {
            uuid: self.uuid,
            stem: self.stem(),
            version: self.version,
        }
    }

    /// True if `other` is a version of the same resource.
    pub fn same_stem(&self, other: &Artifact) -> bool {
        self.namespace == other.namespace && self.auid == other.auid && self.url == other.url
    }

    /// Visible to a query that does or does not include uncommitted artifacts.
    pub fn is_visible(&self, include_uncommitted: bool) -> bool {
        include_uncommitted || self.committed
    }

    /// Check the artifact is acceptable for indexing.
    pub fn validate(&self) -> IndexResult<()> {
        require_uuid(self.uuid)?;
        require_non_empty("namespace", &self.namespace)?;
        require_non_empty("auid", &self.auid)?;
        require_non_empty("url", &self.url)?;

        if self.version < 1 {
            return Err(ValidationError::InvalidValue {
                field: "version".to_string(),
                reason: format!("version must be positive, got {}", self.version),
            }
            .into());
        }

        if self.content_length < 0 {
            return Err(ValidationError::InvalidValue {
                field: "content_length".to_string(),
                reason: format!("content_length must be non-negative, got {}", self.content_length),
            }
            .into());
        }

        Ok(())
    }
}

// ============================================================================
// QUERY TYPES
// ============================================================================

/// Which versions of a matching URL a cross-AU search returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArtifactVersions {
    /// Every committed version
    All,
    /// Only the highest committed version
    Latest,
}

/// Aggregate size figures for one Archival Unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuSize {
    /// Sum of content lengths of the latest committed version of every URL
    pub total_latest_versions: i64,
    /// Sum of content lengths of every committed version
    pub total_all_versions: i64,
    /// Physical footprint reported by the content store
    pub total_warc_size: i64,
}

// ============================================================================
// ARGUMENT VALIDATION
// ============================================================================

/// Reject the nil uuid.
pub fn require_uuid(uuid: Uuid) -> IndexResult<()> {
    if uuid.is_nil() {
        return Err(ValidationError::RequiredFieldMissing {
            field: "uuid".to_string(),
        }
        .into());
    }
    Ok(())
}

/// Reject an empty string argument.
pub fn require_non_empty(field: &str, value: &str) -> IndexResult<()> {
    if value.is_empty() {
        return Err(ValidationError::RequiredFieldMissing {
            field: field.to_string(),
        }
        .into());
    }
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Artifact {
        Artifact::new(new_artifact_uuid(), "ns", "au", "http://example.com/", 1)
            .with_storage_url("file:///warcs/a.warc?offset=0")
            .with_content(42, compute_content_digest(b"hello"))
    }

    #[test]
    fn test_new_artifact_is_uncommitted() {
        let artifact = sample();
        assert!(!artifact.committed);
        assert!(artifact.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_nil_uuid() {
        let mut artifact = sample();
        artifact.uuid = Uuid::nil();
        match artifact.validate() {
            Err(IndexError::Validation(ValidationError::RequiredFieldMissing { field })) => {
                assert_eq!(field, "uuid");
            }
            other => panic!("expected missing uuid, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_empty_fields() {
        for field in ["namespace", "auid", "url"] {
            let mut artifact = sample();
            match field {
                "namespace" => artifact.namespace.clear(),
                "auid" => artifact.auid.clear(),
                _ => artifact.url.clear(),
            }
            assert!(
                matches!(artifact.validate(), Err(IndexError::Validation(_))),
                "empty {} should be rejected",
                field
            );
        }
    }

    #[test]
    fn test_validate_rejects_non_positive_version() {
        let mut artifact = sample();
        artifact.version = 0;
        assert!(artifact.validate().is_err());
        artifact.version = -3;
        assert!(artifact.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_negative_length() {
        let artifact = sample().with_content(-1, "SHA-256:00");
        assert!(artifact.validate().is_err());
    }

    #[test]
    fn test_stem_and_identifier() {
        let artifact = sample();
        let stem = artifact.stem();
        assert_eq!(stem.to_string(), "ns/au/http://example.com/");
        let id = artifact.identifier();
        assert_eq!(id.uuid, artifact.uuid);
        assert_eq!(id.stem, stem);
        assert_eq!(id.version, 1);
    }

    #[test]
    fn test_visibility() {
        let artifact = sample();
        assert!(!artifact.is_visible(false));
        assert!(artifact.is_visible(true));
        let committed = artifact.with_committed(true);
        assert!(committed.is_visible(false));
    }

    #[test]
    fn test_content_digest_format() {
        let digest = compute_content_digest(b"");
        assert_eq!(
            digest,
            "SHA-256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_collection_date_has_millisecond_precision() {
        let artifact = sample();
        assert_eq!(artifact.collection_date.timestamp_subsec_nanos() % 1_000_000, 0);
    }

    #[test]
    fn test_au_size_default_is_zero() {
        let size = AuSize::default();
        assert_eq!(size.total_latest_versions, 0);
        assert_eq!(size.total_all_versions, 0);
        assert_eq!(size.total_warc_size, 0);
    }

    #[test]
    fn test_artifact_json_round_trip() {
        let artifact = sample().with_committed(true);
        let json = serde_json::to_vec(&artifact).expect("serialize");
        let back: Artifact = serde_json::from_slice(&json).expect("deserialize");
        assert_eq!(back, artifact);
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Any positive version with non-empty stem fields validates.
        #[test]
        fn prop_positive_versions_validate(
            version in 1i32..=i32::MAX,
            url in "[a-z]{1,20}",
            length in 0i64..i64::MAX,
        ) {
            let artifact = Artifact::new(new_artifact_uuid(), "ns", "au", url, version)
                .with_content(length, "SHA-256:00");
            prop_assert!(artifact.validate().is_ok());
        }

        /// Non-positive versions are always rejected with a validation error.
        #[test]
        fn prop_non_positive_versions_rejected(version in i32::MIN..=0) {
            let artifact = Artifact::new(new_artifact_uuid(), "ns", "au", "u", version);
            let result = artifact.validate();
            if let Err(IndexError::Validation(ValidationError::InvalidValue { field, .. })) = result {
                prop_assert_eq!(field, "version");
            } else {
                prop_assert!(false, "Expected ValidationError::InvalidValue");
            }
        }
    }
}

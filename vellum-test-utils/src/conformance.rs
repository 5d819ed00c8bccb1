//! Behavior every [`crate::ArtifactIndex`] backend must share.
//!
//! Each case takes a freshly started, empty index. Backends run the whole set
//! through [`crate::artifact_index_conformance!`].

use std::time::Duration;

use uuid::Uuid;

use crate::assertions::*;
use crate::fixtures::{artifact, artifact_with_length, long_url};
use crate::{ArtifactVersions, AuSize, TestIndex};

const NS: &str = "ns1";
const AU: &str = "au1";

// ============================================================================
// STATE MACHINE
// ============================================================================

pub async fn index_then_get_is_uncommitted(index: &TestIndex) {
    // A commit flag on the incoming record is ignored.
    let incoming = artifact(NS, AU, "http://example.com/", 1).with_committed(true);

    let stored = index.index_uncommitted(&incoming).await;
    assert!(!stored.committed);
    assert_eq!(stored, incoming.clone().with_committed(false));

    let fetched = index.get_artifact(incoming.uuid).await.expect("get");
    assert_eq!(fetched, Some(stored));
    assert!(index.artifact_exists(incoming.uuid).await.expect("exists"));
}

pub async fn commit_is_idempotent(index: &TestIndex) {
    let a = artifact(NS, AU, "http://example.com/", 1);
    index.index_uncommitted(&a).await;

    let first = index.commit_artifact(a.uuid).await.expect("commit");
    let expected = a.clone().with_committed(true);
    assert_eq!(first.as_ref(), Some(&expected));

    let second = index.commit_artifact(a.uuid).await.expect("recommit");
    assert_eq!(second, first);
    assert_eq!(index.get_artifact(a.uuid).await.expect("get"), Some(expected));
}

pub async fn unknown_uuid_is_not_found(index: &TestIndex) {
    let unknown = Uuid::now_v7();
    assert_eq!(index.get_artifact(unknown).await.expect("get"), None);
    assert!(!index.artifact_exists(unknown).await.expect("exists"));
    assert_eq!(index.commit_artifact(unknown).await.expect("commit"), None);
    assert!(!index.delete_artifact(unknown).await.expect("delete"));
}

pub async fn delete_removes_artifact(index: &TestIndex) {
    let uncommitted = artifact(NS, AU, "http://example.com/a", 1);
    let committed = artifact(NS, AU, "http://example.com/b", 1);
    index.index_uncommitted(&uncommitted).await;
    index.index_committed(&committed).await;

    for a in [&uncommitted, &committed] {
        assert!(index.delete_artifact(a.uuid).await.expect("delete"));
        assert!(!index.artifact_exists(a.uuid).await.expect("exists"));
        assert_eq!(index.get_artifact(a.uuid).await.expect("get"), None);
        assert!(!index.delete_artifact(a.uuid).await.expect("redelete"));
        assert_eq!(index.commit_artifact(a.uuid).await.expect("commit"), None);
        assert_not_found_error(
            &index.update_storage_url(a.uuid, "file:///moved.warc").await,
            a.uuid,
        );
    }

    assert!(index.get_namespaces().await.expect("namespaces").is_empty());
    assert!(index.get_artifacts(NS, AU, true).await.expect("list").is_empty());
}

// ============================================================================
// STEM LOOKUPS
// ============================================================================

pub async fn latest_respects_commit_state(index: &TestIndex) {
    let url = "http://example.com/page";
    let v1 = index.index_committed(&artifact(NS, AU, url, 1)).await;
    let v2 = index.index_uncommitted(&artifact(NS, AU, url, 2)).await;

    let committed_only = index.get_latest_artifact(NS, AU, url, false).await.expect("latest");
    assert_eq!(committed_only, Some(v1));
    let any = index.get_latest_artifact(NS, AU, url, true).await.expect("latest");
    assert_eq!(any, Some(v2.clone()));

    let v2 = index.commit_artifact(v2.uuid).await.expect("commit");
    assert_eq!(index.get_latest_artifact(NS, AU, url, false).await.expect("latest"), v2);
    assert_eq!(index.get_latest_artifact(NS, AU, url, true).await.expect("latest"), v2);
}

pub async fn latest_absent_without_eligible_version(index: &TestIndex) {
    let url = "http://example.com/page";
    let v1 = index.index_uncommitted(&artifact(NS, AU, url, 1)).await;

    assert_eq!(index.get_latest_artifact(NS, AU, url, false).await.expect("latest"), None);
    assert_eq!(index.get_latest_artifact(NS, AU, url, true).await.expect("latest"), Some(v1));
    assert_eq!(
        index
            .get_latest_artifact(NS, AU, "http://example.com/other", true)
            .await
            .expect("latest"),
        None
    );
    assert_eq!(index.get_latest_artifact(NS, "au2", url, true).await.expect("latest"), None);
    assert_eq!(index.get_latest_artifact("ns2", AU, url, true).await.expect("latest"), None);
}

pub async fn deleting_latest_falls_back(index: &TestIndex) {
    let url = "http://example.com/page";
    let v1 = index.index_committed(&artifact(NS, AU, url, 1)).await;
    let v2 = index.index_committed(&artifact(NS, AU, url, 2)).await;

    assert!(index.delete_artifact(v2.uuid).await.expect("delete"));
    assert_eq!(
        index.get_latest_artifact(NS, AU, url, false).await.expect("latest"),
        Some(v1.clone())
    );

    assert!(index.delete_artifact(v1.uuid).await.expect("delete"));
    assert_eq!(index.get_latest_artifact(NS, AU, url, true).await.expect("latest"), None);
}

pub async fn artifact_version_lookup(index: &TestIndex) {
    let url = "http://example.com/page";
    let v1 = index.index_committed(&artifact(NS, AU, url, 1)).await;
    let v2 = index.index_uncommitted(&artifact(NS, AU, url, 2)).await;

    let v1 = Some(v1);
    let v2 = Some(v2);
    for (version, include_uncommitted, expected) in [
        (1, false, &v1),
        (1, true, &v1),
        (2, false, &None),
        (2, true, &v2),
        (3, true, &None),
    ] {
        let found = index
            .get_artifact_version(NS, AU, url, version, include_uncommitted)
            .await
            .expect("version lookup");
        assert_eq!(&found, expected, "version {} ({})", version, include_uncommitted);
    }
}

// ============================================================================
// STORAGE URL
// ============================================================================

pub async fn update_storage_url_round_trip(index: &TestIndex) {
    let uncommitted = index
        .index_uncommitted(&artifact(NS, AU, "http://example.com/a", 1))
        .await;
    let committed = index
        .index_committed(&artifact(NS, AU, "http://example.com/b", 1))
        .await;

    for original in [uncommitted, committed] {
        let location = format!("file:///permanent/{}.warc", original.uuid);
        let updated = index
            .update_storage_url(original.uuid, &location)
            .await
            .expect("update");

        let expected = original.clone().with_storage_url(location.clone());
        assert_eq!(updated, expected);
        assert_eq!(index.get_artifact(original.uuid).await.expect("get"), Some(expected));
    }
}

pub async fn update_storage_url_unknown_uuid(index: &TestIndex) {
    let unknown = Uuid::now_v7();
    assert_not_found_error(&index.update_storage_url(unknown, "file:///x.warc").await, unknown);
}

// ============================================================================
// ARGUMENT VALIDATION
// ============================================================================

pub async fn nil_uuid_is_invalid(index: &TestIndex) {
    let nil = Uuid::nil();
    assert_required_field(&index.get_artifact(nil).await, "uuid");
    assert_required_field(&index.artifact_exists(nil).await, "uuid");
    assert_required_field(&index.commit_artifact(nil).await, "uuid");
    assert_required_field(&index.delete_artifact(nil).await, "uuid");
    assert_required_field(&index.update_storage_url(nil, "file:///x.warc").await, "uuid");

    let a = index
        .index_uncommitted(&artifact(NS, AU, "http://example.com/", 1))
        .await;
    assert_required_field(&index.update_storage_url(a.uuid, "").await, "storage_url");
}

pub async fn invalid_artifact_rejected(index: &TestIndex) {
    let valid = artifact(NS, AU, "http://example.com/", 1);

    let mut nil_uuid = valid.clone();
    nil_uuid.uuid = Uuid::nil();
    assert_required_field(&index.index_artifact(&nil_uuid).await, "uuid");

    let mut no_namespace = valid.clone();
    no_namespace.namespace = String::new();
    assert_required_field(&index.index_artifact(&no_namespace).await, "namespace");

    let mut no_auid = valid.clone();
    no_auid.auid = String::new();
    assert_required_field(&index.index_artifact(&no_auid).await, "auid");

    let mut no_url = valid.clone();
    no_url.url = String::new();
    assert_required_field(&index.index_artifact(&no_url).await, "url");

    let mut zero_version = valid.clone();
    zero_version.version = 0;
    assert_required_field(&index.index_artifact(&zero_version).await, "version");

    let negative_length = valid.clone().with_content(-1, valid.content_digest.clone());
    assert_required_field(&index.index_artifact(&negative_length).await, "content_length");

    assert!(index.get_namespaces().await.expect("namespaces").is_empty());
    assert!(!index.artifact_exists(valid.uuid).await.expect("exists"));
}

pub async fn blank_arguments_are_invalid(index: &TestIndex) {
    let url = "http://example.com/";

    assert_required_field(&index.get_latest_artifact("", AU, url, true).await, "namespace");
    assert_required_field(&index.get_latest_artifact(NS, "", url, true).await, "auid");
    assert_required_field(&index.get_latest_artifact(NS, AU, "", true).await, "url");
    assert_required_field(&index.get_artifact_version(NS, AU, "", 1, true).await, "url");
    assert_required_field(&index.get_au_ids("").await, "namespace");
    assert_required_field(&index.get_artifacts(NS, "", true).await, "auid");
    assert_required_field(&index.get_artifacts_all_versions("", AU, true).await, "namespace");
    assert_required_field(&index.get_artifact_all_versions(NS, AU, "", true).await, "url");
    assert_required_field(&index.get_artifacts_with_prefix("", AU, "http").await, "namespace");
    assert_required_field(&index.au_size(NS, "").await, "auid");

    for versions in [ArtifactVersions::All, ArtifactVersions::Latest] {
        assert_required_field(
            &index.get_artifacts_with_url_from_all_aus("", url, versions).await,
            "namespace",
        );
        assert_required_field(
            &index.get_artifacts_with_url_from_all_aus(NS, "", versions).await,
            "url",
        );
        assert_required_field(
            &index.get_artifacts_with_url_prefix_from_all_aus("", "http", versions).await,
            "namespace",
        );
        assert_required_field(
            &index.get_artifacts_with_url_prefix_from_all_aus(NS, "", versions).await,
            "prefix",
        );
    }
}

// ============================================================================
// LISTINGS
// ============================================================================

pub async fn namespaces_and_au_ids(index: &TestIndex) {
    assert!(index.get_namespaces().await.expect("namespaces").is_empty());

    let only = index
        .index_uncommitted(&artifact("ns2", "au2", "http://example.com/", 1))
        .await;
    index
        .index_committed(&artifact("ns1", "au1", "http://example.com/", 1))
        .await;
    index
        .index_uncommitted(&artifact("ns1", "au0", "http://example.com/", 1))
        .await;
    index
        .index_committed(&artifact("ns1", "au1", "http://example.com/x", 1))
        .await;

    assert_eq!(index.get_namespaces().await.expect("namespaces"), vec!["ns1", "ns2"]);
    // Uncommitted-only AUs are listed.
    assert_eq!(index.get_au_ids("ns1").await.expect("aus"), vec!["au0", "au1"]);
    assert_eq!(index.get_au_ids("ns2").await.expect("aus"), vec!["au2"]);
    assert!(index.get_au_ids("ns3").await.expect("aus").is_empty());

    assert!(index.delete_artifact(only.uuid).await.expect("delete"));
    assert_eq!(index.get_namespaces().await.expect("namespaces"), vec!["ns1"]);
    assert!(index.get_au_ids("ns2").await.expect("aus").is_empty());
}

pub async fn get_artifacts_commit_scenario(index: &TestIndex) {
    let v1 = index.index_uncommitted(&artifact("d", "a", "u", 1)).await;
    let v2 = index.index_uncommitted(&artifact("d", "a", "u", 2)).await;

    assert!(index.get_artifacts("d", "a", false).await.expect("list").is_empty());
    assert_artifacts(&index.get_artifacts("d", "a", true).await.expect("list"), &[&v2]);

    let v1 = index.commit_artifact(v1.uuid).await.expect("commit").expect("v1");
    assert_artifacts(&index.get_artifacts("d", "a", false).await.expect("list"), &[&v1]);

    let v2 = index.commit_artifact(v2.uuid).await.expect("commit").expect("v2");
    assert_artifacts(&index.get_artifacts("d", "a", false).await.expect("list"), &[&v2]);
}

pub async fn get_artifacts_latest_per_url(index: &TestIndex) {
    let b1 = index.index_committed(&artifact(NS, AU, "http://b.com/", 1)).await;
    let a1 = index.index_committed(&artifact(NS, AU, "http://a.com/", 1)).await;
    let a2 = index.index_committed(&artifact(NS, AU, "http://a.com/", 2)).await;
    let c3 = index.index_uncommitted(&artifact(NS, AU, "http://c.com/", 3)).await;
    index.index_committed(&artifact(NS, "au2", "http://a.com/", 7)).await;
    index.index_committed(&artifact("ns2", AU, "http://a.com/", 9)).await;

    let committed = index.get_artifacts(NS, AU, false).await.expect("list");
    assert_artifacts(&committed, &[&a2, &b1]);

    let all = index.get_artifacts(NS, AU, true).await.expect("list");
    assert_artifacts(&all, &[&a2, &b1, &c3]);
    assert_within_au_order(&all);
    assert!(!all.iter().any(|a| a.uuid == a1.uuid));
}

pub async fn all_versions_ordering(index: &TestIndex) {
    let a1 = index.index_committed(&artifact(NS, AU, "http://a.com/", 1)).await;
    let b2 = index.index_committed(&artifact(NS, AU, "http://b.com/", 2)).await;
    let a3 = index.index_uncommitted(&artifact(NS, AU, "http://a.com/", 3)).await;
    let a2 = index.index_committed(&artifact(NS, AU, "http://a.com/", 2)).await;
    let b1 = index.index_committed(&artifact(NS, AU, "http://b.com/", 1)).await;
    index.index_committed(&artifact(NS, "au2", "http://a.com/", 4)).await;

    let committed = index.get_artifacts_all_versions(NS, AU, false).await.expect("list");
    assert_artifacts(&committed, &[&a2, &a1, &b2, &b1]);

    let all = index.get_artifacts_all_versions(NS, AU, true).await.expect("list");
    assert_artifacts(&all, &[&a3, &a2, &a1, &b2, &b1]);
    assert_within_au_order(&all);

    let one_url = index
        .get_artifact_all_versions(NS, AU, "http://a.com/", false)
        .await
        .expect("list");
    assert_artifacts(&one_url, &[&a2, &a1]);

    let one_url = index
        .get_artifact_all_versions(NS, AU, "http://a.com/", true)
        .await
        .expect("list");
    assert_artifacts(&one_url, &[&a3, &a2, &a1]);

    assert!(index
        .get_artifact_all_versions(NS, AU, "http://c.com/", true)
        .await
        .expect("list")
        .is_empty());
}

// ============================================================================
// PREFIX SEARCH
// ============================================================================

pub async fn prefix_search_latest_committed(index: &TestIndex) {
    let a1_v1 = index
        .index_committed(&artifact(NS, AU, "http://example.com/a/1", 1))
        .await;
    let a1_v2 = index
        .index_committed(&artifact(NS, AU, "http://example.com/a/1", 2))
        .await;
    index
        .index_uncommitted(&artifact(NS, AU, "http://example.com/a/1", 3))
        .await;
    let a2 = index
        .index_committed(&artifact(NS, AU, "http://example.com/a/2", 1))
        .await;
    index
        .index_uncommitted(&artifact(NS, AU, "http://example.com/a/3", 1))
        .await;
    index
        .index_committed(&artifact(NS, AU, "http://example.com/b/1", 1))
        .await;
    index
        .index_committed(&artifact(NS, "au2", "http://example.com/a/9", 1))
        .await;

    let found = index
        .get_artifacts_with_prefix(NS, AU, "http://example.com/a/")
        .await
        .expect("prefix");
    assert_artifacts(&found, &[&a1_v2, &a2]);
    assert!(!found.iter().any(|a| a.uuid == a1_v1.uuid));

    assert!(index
        .get_artifacts_with_prefix(NS, AU, "http://example.com/c")
        .await
        .expect("prefix")
        .is_empty());
}

pub async fn prefix_search_is_literal(index: &TestIndex) {
    let percent = index
        .index_committed(&artifact(NS, AU, "http://x.com/100%", 1))
        .await;
    index.index_committed(&artifact(NS, AU, "http://x.com/1000", 1)).await;
    let underscore = index
        .index_committed(&artifact(NS, AU, "http://x.com/a_b", 1))
        .await;
    index.index_committed(&artifact(NS, AU, "http://x.com/axb", 1)).await;
    let backslash = index
        .index_committed(&artifact(NS, AU, "http://x.com/back\\slash", 1))
        .await;
    index.index_committed(&artifact(NS, AU, "http://x.com/backslash", 1)).await;

    for (prefix, expected) in [
        ("http://x.com/100%", &percent),
        ("http://x.com/a_", &underscore),
        ("http://x.com/back\\", &backslash),
    ] {
        let found = index.get_artifacts_with_prefix(NS, AU, prefix).await.expect("prefix");
        assert_artifacts(&found, &[expected]);
    }

    let cross = index
        .get_artifacts_with_url_prefix_from_all_aus(NS, "http://x.com/a_", ArtifactVersions::All)
        .await
        .expect("cross prefix");
    assert_artifacts(&cross, &[&underscore]);
}

pub async fn prefix_search_all_versions(index: &TestIndex) {
    let a1 = index.index_committed(&artifact(NS, AU, "http://s.com/a", 1)).await;
    let a2 = index.index_committed(&artifact(NS, AU, "http://s.com/a", 2)).await;
    index.index_uncommitted(&artifact(NS, AU, "http://s.com/a", 3)).await;
    let b1 = index.index_committed(&artifact(NS, AU, "http://s.com/b", 1)).await;
    index.index_committed(&artifact(NS, AU, "http://t.com/a", 1)).await;

    let found = index
        .get_artifacts_with_prefix_all_versions(NS, AU, "http://s.com/")
        .await
        .expect("prefix");
    assert_artifacts(&found, &[&a2, &a1, &b1]);
    assert_within_au_order(&found);
}

pub async fn empty_prefix_matches_whole_au(index: &TestIndex) {
    index.index_committed(&artifact(NS, AU, "http://a.com/", 1)).await;
    index.index_committed(&artifact(NS, AU, "http://a.com/", 2)).await;
    index.index_committed(&artifact(NS, AU, "https://b.com/", 1)).await;
    index.index_uncommitted(&artifact(NS, AU, "ftp://c.com/", 1)).await;

    let everything = index.get_artifacts(NS, AU, false).await.expect("list");
    let prefixed = index.get_artifacts_with_prefix(NS, AU, "").await.expect("prefix");
    assert_eq!(prefixed, everything);
    assert_eq!(prefixed.len(), 2);

    let all_versions = index
        .get_artifacts_with_prefix_all_versions(NS, AU, "")
        .await
        .expect("prefix");
    assert_eq!(all_versions.len(), 3);
}

// ============================================================================
// CROSS-AU SEARCH
// ============================================================================

pub async fn cross_au_url_search(index: &TestIndex) {
    let url = "http://example.com/shared";
    let au1_v1 = index.index_committed(&artifact(NS, "au1", url, 1)).await;
    let au1_v2 = index.index_committed(&artifact(NS, "au1", url, 2)).await;
    index.index_uncommitted(&artifact(NS, "au1", url, 3)).await;
    let au2_v1 = index.index_committed(&artifact(NS, "au2", url, 1)).await;
    index.index_uncommitted(&artifact(NS, "au3", url, 1)).await;
    index.index_committed(&artifact("ns2", "au1", url, 5)).await;
    index
        .index_committed(&artifact(NS, "au1", "http://example.com/shared2", 1))
        .await;

    let latest = index
        .get_artifacts_with_url_from_all_aus(NS, url, ArtifactVersions::Latest)
        .await
        .expect("latest");
    assert_artifacts(&latest, &[&au1_v2, &au2_v1]);

    let all = index
        .get_artifacts_with_url_from_all_aus(NS, url, ArtifactVersions::All)
        .await
        .expect("all");
    assert_artifacts(&all, &[&au1_v2, &au1_v1, &au2_v1]);
    assert_cross_au_order(&all);

    assert!(index
        .get_artifacts_with_url_from_all_aus("ns3", url, ArtifactVersions::All)
        .await
        .expect("other namespace")
        .is_empty());
}

pub async fn cross_au_prefix_search(index: &TestIndex) {
    let a_au2 = index.index_committed(&artifact(NS, "au2", "http://site/a", 1)).await;
    let b_au1 = index.index_committed(&artifact(NS, "au1", "http://site/b", 1)).await;
    let a_au1_v1 = index.index_committed(&artifact(NS, "au1", "http://site/a", 1)).await;
    let a_au1_v2 = index.index_committed(&artifact(NS, "au1", "http://site/a", 2)).await;
    index.index_uncommitted(&artifact(NS, "au1", "http://site/c", 1)).await;
    index.index_committed(&artifact(NS, "au1", "http://other/a", 1)).await;
    index.index_committed(&artifact("ns2", "au1", "http://site/a", 3)).await;

    let latest = index
        .get_artifacts_with_url_prefix_from_all_aus(NS, "http://site/", ArtifactVersions::Latest)
        .await
        .expect("latest");
    assert_artifacts(&latest, &[&a_au1_v2, &a_au2, &b_au1]);

    let all = index
        .get_artifacts_with_url_prefix_from_all_aus(NS, "http://site/", ArtifactVersions::All)
        .await
        .expect("all");
    assert_artifacts(&all, &[&a_au1_v2, &a_au1_v1, &a_au2, &b_au1]);
    assert_cross_au_order(&all);
}

// ============================================================================
// SIZE ACCOUNTING
// ============================================================================

pub async fn au_size_additivity(index: &TestIndex) {
    let url1 = "http://example.com/1";
    let url2 = "http://example.com/2";
    index.data_store.set_warc_size(NS, AU, 4096);

    let url1_v1 = index
        .index_committed(&artifact_with_length(NS, AU, url1, 1, 100))
        .await;
    index
        .index_committed(&artifact_with_length(NS, AU, url2, 1, 200))
        .await;
    assert_eq!(
        index.au_size(NS, AU).await.expect("size"),
        AuSize {
            total_latest_versions: 300,
            total_all_versions: 300,
            total_warc_size: 4096,
        }
    );

    index
        .index_committed(&artifact_with_length(NS, AU, url1, 2, 50))
        .await;
    let size = index.au_size(NS, AU).await.expect("size");
    assert_eq!(size.total_all_versions, 350);
    assert_eq!(size.total_latest_versions, 250);

    // Dropping a superseded version leaves the latest total alone.
    assert!(index.delete_artifact(url1_v1.uuid).await.expect("delete"));
    let size = index.au_size(NS, AU).await.expect("size");
    assert_eq!(size.total_all_versions, 250);
    assert_eq!(size.total_latest_versions, 250);
    assert_eq!(size.total_warc_size, 4096);
}

pub async fn au_size_empty_au_is_zero(index: &TestIndex) {
    assert_eq!(index.au_size(NS, AU).await.expect("size"), AuSize::default());

    index.index_committed(&artifact(NS, AU, "http://example.com/", 1)).await;
    assert_eq!(index.au_size("ns2", AU).await.expect("size"), AuSize::default());
    assert_eq!(index.au_size(NS, "au2").await.expect("size"), AuSize::default());
}

pub async fn au_size_ignores_uncommitted(index: &TestIndex) {
    let url = "http://example.com/";
    index
        .index_committed(&artifact_with_length(NS, AU, url, 1, 10))
        .await;
    let v2 = index
        .index_uncommitted(&artifact_with_length(NS, AU, url, 2, 1000))
        .await;
    index
        .index_uncommitted(&artifact_with_length(NS, AU, "http://example.com/x", 1, 500))
        .await;

    let size = index.au_size(NS, AU).await.expect("size");
    assert_eq!(size.total_latest_versions, 10);
    assert_eq!(size.total_all_versions, 10);

    index.commit_artifact(v2.uuid).await.expect("commit");
    let size = index.au_size(NS, AU).await.expect("size");
    assert_eq!(size.total_latest_versions, 1000);
    assert_eq!(size.total_all_versions, 1010);
}

// ============================================================================
// DUPLICATES AND LIMITS
// ============================================================================

pub async fn duplicate_uuid_rejected(index: &TestIndex) {
    let original = index
        .index_committed(&artifact(NS, AU, "http://example.com/a", 1))
        .await;

    let mut duplicate = artifact(NS, AU, "http://example.com/b", 1);
    duplicate.uuid = original.uuid;
    assert_already_exists(&index.index_artifact(&duplicate).await, original.uuid);

    assert_eq!(index.get_artifact(original.uuid).await.expect("get"), Some(original));
}

pub async fn duplicate_stem_version_rejected(index: &TestIndex) {
    let url = "http://example.com/a";
    let original = index.index_uncommitted(&artifact(NS, AU, url, 1)).await;

    let clash = artifact(NS, AU, url, 1);
    assert_constraint_violation(&index.index_artifact(&clash).await, "artifact_stem_version");
    assert!(!index.artifact_exists(clash.uuid).await.expect("exists"));

    // The same version in another AU or namespace is a different stem.
    index.index_uncommitted(&artifact(NS, "au2", url, 1)).await;
    index.index_uncommitted(&artifact("ns2", AU, url, 1)).await;
    assert_eq!(
        index.get_latest_artifact(NS, AU, url, true).await.expect("latest"),
        Some(original)
    );
}

pub async fn long_url_round_trip(index: &TestIndex) {
    let url = long_url(30_000);
    let stored = index.index_committed(&artifact(NS, AU, &url, 1)).await;
    // Shares the first 10k characters, then diverges.
    let sibling_url = format!("{}~", &url[..10_000]);
    let sibling = index.index_committed(&artifact(NS, AU, &sibling_url, 1)).await;

    assert_eq!(
        index.get_latest_artifact(NS, AU, &url, false).await.expect("latest"),
        Some(stored.clone())
    );
    assert_eq!(
        index.get_artifact_version(NS, AU, &url, 1, false).await.expect("version"),
        Some(stored.clone())
    );
    assert_artifacts(
        &index
            .get_artifacts_with_prefix(NS, AU, &url[..20_000])
            .await
            .expect("prefix"),
        &[&stored],
    );
    assert_artifacts(
        &index
            .get_artifacts_with_url_from_all_aus(NS, &url, ArtifactVersions::Latest)
            .await
            .expect("cross"),
        &[&stored],
    );
    assert_artifacts(
        &index
            .get_artifacts_with_url_prefix_from_all_aus(NS, &url[..20_000], ArtifactVersions::All)
            .await
            .expect("cross prefix"),
        &[&stored],
    );
    assert_artifacts(
        &index
            .get_artifacts_with_prefix(NS, AU, &url[..5_000])
            .await
            .expect("shared prefix"),
        &[&stored, &sibling],
    );
}

// ============================================================================
// LIFECYCLE
// ============================================================================

pub async fn stopped_index_rejects_operations(index: &TestIndex) {
    let a = index
        .index_committed(&artifact(NS, AU, "http://example.com/", 1))
        .await;
    index.stop().await.expect("stop");

    assert!(!index.is_ready());
    assert_not_ready(&index.get_artifact(a.uuid).await);
    assert_not_ready(&index.index_artifact(&artifact(NS, AU, "http://x.com/", 1)).await);
    assert_not_ready(&index.get_namespaces().await);
    assert!(index.wait_ready(Duration::from_millis(50)).await.is_err());
    assert!(!index.health_check().await.is_healthy());
}

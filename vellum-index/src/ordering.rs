//! Ordering and aggregation rules shared by every backend.
//!
//! The in-memory backends apply these directly. The SQL backend expresses the
//! same rules in its queries (`ORDER BY uri, auid, version DESC`,
//! `DISTINCT ON`, windowed sums) and its results must agree with them.

use std::cmp::Ordering;
use std::collections::HashMap;

use vellum_core::{Artifact, ArtifactVersions, ArtifactVersion};

/// Within one AU: URL ascending, then version descending.
pub fn cmp_within_au(a: &Artifact, b: &Artifact) -> Ordering {
    a.url
        .cmp(&b.url)
        .then_with(|| b.version.cmp(&a.version))
}

/// Across AUs: URL ascending, then AU ascending, then version descending.
pub fn cmp_across_aus(a: &Artifact, b: &Artifact) -> Ordering {
    a.url
        .cmp(&b.url)
        .then_with(|| a.auid.cmp(&b.auid))
        .then_with(|| b.version.cmp(&a.version))
}

/// Keep the first artifact of every run of same-stem artifacts.
///
/// The input must already be grouped by stem with the highest version first
/// (either ordering above satisfies this), so the survivor of each run is the
/// latest version.
pub fn latest_per_stem(mut artifacts: Vec<Artifact>) -> Vec<Artifact> {
    artifacts.dedup_by(|later, first| later.same_stem(first));
    artifacts
}

/// Apply a cross-AU version selection to stem-grouped, version-descending input.
pub fn select_versions(artifacts: Vec<Artifact>, versions: ArtifactVersions) -> Vec<Artifact> {
    match versions {
        ArtifactVersions::All => artifacts,
        ArtifactVersions::Latest => latest_per_stem(artifacts),
    }
}

/// `(total_latest_versions, total_all_versions)` over the committed artifacts
/// of a single AU. Uncommitted artifacts in the input are ignored.
pub fn committed_size_totals<'a, I>(artifacts: I) -> (i64, i64)
where
    I: IntoIterator<Item = &'a Artifact>,
{
    let mut all_versions = 0i64;
    let mut latest: HashMap<&str, (ArtifactVersion, i64)> = HashMap::new();

    for artifact in artifacts.into_iter().filter(|a| a.committed) {
        all_versions += artifact.content_length;
        latest
            .entry(artifact.url.as_str())
            .and_modify(|(version, length)| {
                if artifact.version > *version {
                    *version = artifact.version;
                    *length = artifact.content_length;
                }
            })
            .or_insert((artifact.version, artifact.content_length));
    }

    let latest_versions = latest.values().map(|(_, length)| length).sum();
    (latest_versions, all_versions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn artifact(auid: &str, url: &str, version: i32, length: i64, committed: bool) -> Artifact {
        Artifact::new(Uuid::now_v7(), "ns", auid, url, version)
            .with_content(length, "SHA-256:00")
            .with_committed(committed)
    }

    fn keys(artifacts: &[Artifact]) -> Vec<(String, String, i32)> {
        artifacts
            .iter()
            .map(|a| (a.url.clone(), a.auid.clone(), a.version))
            .collect()
    }

    #[test]
    fn test_cross_au_order() {
        let mut artifacts = vec![
            artifact("b", "u2", 1, 0, true),
            artifact("b", "u1", 1, 0, true),
            artifact("a", "u1", 1, 0, true),
            artifact("a", "u1", 3, 0, true),
        ];
        artifacts.sort_by(cmp_across_aus);
        assert_eq!(
            keys(&artifacts),
            vec![
                ("u1".into(), "a".into(), 3),
                ("u1".into(), "a".into(), 1),
                ("u1".into(), "b".into(), 1),
                ("u2".into(), "b".into(), 1),
            ]
        );
    }

    #[test]
    fn test_latest_per_stem_keeps_highest() {
        let mut artifacts = vec![
            artifact("a", "u1", 1, 0, true),
            artifact("a", "u1", 2, 0, true),
            artifact("a", "u2", 5, 0, true),
            artifact("b", "u1", 4, 0, true),
        ];
        artifacts.sort_by(cmp_across_aus);
        let latest = latest_per_stem(artifacts);
        assert_eq!(
            keys(&latest),
            vec![
                ("u1".into(), "a".into(), 2),
                ("u1".into(), "b".into(), 4),
                ("u2".into(), "a".into(), 5),
            ]
        );
    }

    #[test]
    fn test_select_versions_all_is_identity() {
        let artifacts = vec![artifact("a", "u", 2, 0, true), artifact("a", "u", 1, 0, true)];
        assert_eq!(select_versions(artifacts.clone(), ArtifactVersions::All), artifacts);
        assert_eq!(select_versions(artifacts, ArtifactVersions::Latest).len(), 1);
    }

    #[test]
    fn test_size_totals() {
        let artifacts = vec![
            artifact("a", "u1", 1, 100, true),
            artifact("a", "u1", 2, 300, true),
            artifact("a", "u2", 1, 200, true),
            artifact("a", "u2", 2, 999, false),
        ];
        assert_eq!(committed_size_totals(&artifacts), (500, 600));
    }

    #[test]
    fn test_size_totals_empty() {
        assert_eq!(committed_size_totals(&Vec::new()), (0, 0));
    }
}

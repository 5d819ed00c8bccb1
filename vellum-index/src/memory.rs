//! In-memory artifact table shared by the volatile and local backends.
//!
//! Two structures guarded by one lock:
//! - `by_uuid`: primary map, O(1) identity lookups
//! - `by_stem`: ordered secondary index keyed `(namespace, auid, url, Reverse(version))`
//!   so that an AU, a URL or a URL prefix is a contiguous range already in
//!   "URL ascending, version descending" order
//!
//! `au_counts` tracks how many records every (namespace, auid) holds so the
//! namespace and AU listings never scan artifacts.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use uuid::Uuid;
use vellum_core::{
    Artifact, ArtifactVersion, ArtifactVersions, IndexResult, StorageError, ValidationError,
};

use crate::ordering::{cmp_across_aus, committed_size_totals, latest_per_stem, select_versions};

type StemKey = (String, String, String, Reverse<ArtifactVersion>);

fn stem_key(namespace: &str, auid: &str, url: &str, version: ArtifactVersion) -> StemKey {
    (
        namespace.to_string(),
        auid.to_string(),
        url.to_string(),
        Reverse(version),
    )
}

/// Smallest key at or after which every key of the given stem position sorts.
fn range_start(namespace: &str, auid: &str, url: &str) -> StemKey {
    stem_key(namespace, auid, url, ArtifactVersion::MAX)
}

#[derive(Debug, Default)]
pub(crate) struct ArtifactTable {
    by_uuid: HashMap<Uuid, Artifact>,
    by_stem: BTreeMap<StemKey, Uuid>,
    au_counts: BTreeMap<String, BTreeMap<String, usize>>,
}

impl ArtifactTable {
    pub(crate) fn len(&self) -> usize {
        self.by_uuid.len()
    }

    /// Add a new, uncommitted artifact.
    pub(crate) fn insert(&mut self, artifact: &Artifact) -> IndexResult<Artifact> {
        let stored = artifact.clone().with_committed(false);
        self.restore(stored.clone())?;
        Ok(stored)
    }

    /// Add an artifact exactly as given (commit state included).
    pub(crate) fn restore(&mut self, artifact: Artifact) -> IndexResult<()> {
        if self.by_uuid.contains_key(&artifact.uuid) {
            return Err(StorageError::AlreadyExists {
                uuid: artifact.uuid,
            }
            .into());
        }

        let key = stem_key(
            &artifact.namespace,
            &artifact.auid,
            &artifact.url,
            artifact.version,
        );
        if let Some(existing) = self.by_stem.get(&key) {
            return Err(ValidationError::ConstraintViolation {
                constraint: "artifact_stem_version".to_string(),
                reason: format!(
                    "version {} of {} is already indexed as {}",
                    artifact.version,
                    artifact.stem(),
                    existing
                ),
            }
            .into());
        }

        *self
            .au_counts
            .entry(artifact.namespace.clone())
            .or_default()
            .entry(artifact.auid.clone())
            .or_default() += 1;
        self.by_stem.insert(key, artifact.uuid);
        self.by_uuid.insert(artifact.uuid, artifact);
        Ok(())
    }

    pub(crate) fn get(&self, uuid: Uuid) -> Option<&Artifact> {
        self.by_uuid.get(&uuid)
    }

    pub(crate) fn commit(&mut self, uuid: Uuid) -> Option<Artifact> {
        let artifact = self.by_uuid.get_mut(&uuid)?;
        artifact.committed = true;
        Some(artifact.clone())
    }

    pub(crate) fn set_storage_url(&mut self, uuid: Uuid, storage_url: &str) -> Option<Artifact> {
        let artifact = self.by_uuid.get_mut(&uuid)?;
        artifact.storage_url = storage_url.to_string();
        Some(artifact.clone())
    }

    pub(crate) fn remove(&mut self, uuid: Uuid) -> Option<Artifact> {
        let artifact = self.by_uuid.remove(&uuid)?;
        self.by_stem.remove(&stem_key(
            &artifact.namespace,
            &artifact.auid,
            &artifact.url,
            artifact.version,
        ));

        if let Some(aus) = self.au_counts.get_mut(&artifact.namespace) {
            if let Some(count) = aus.get_mut(&artifact.auid) {
                *count -= 1;
                if *count == 0 {
                    aus.remove(&artifact.auid);
                }
            }
            if aus.is_empty() {
                self.au_counts.remove(&artifact.namespace);
            }
        }

        Some(artifact)
    }

    // ========================================================================
    // RANGE SCANS
    // ========================================================================

    fn resolve<'a>(
        &'a self,
        entries: impl Iterator<Item = (&'a StemKey, &'a Uuid)> + 'a,
    ) -> impl Iterator<Item = &'a Artifact> + 'a {
        entries.filter_map(move |(_, uuid)| self.by_uuid.get(uuid))
    }

    /// Every version of every URL in one AU; URL ascending, version descending.
    fn au_range<'a>(&'a self, namespace: &'a str, auid: &'a str) -> impl Iterator<Item = &'a Artifact> + 'a {
        let entries = self
            .by_stem
            .range(range_start(namespace, auid, "")..)
            .take_while(move |((ns, au, _, _), _)| ns == namespace && au == auid);
        self.resolve(entries)
    }

    /// Every version of one URL, highest first.
    fn url_range<'a>(
        &'a self,
        namespace: &'a str,
        auid: &'a str,
        url: &'a str,
    ) -> impl Iterator<Item = &'a Artifact> + 'a {
        let entries = self
            .by_stem
            .range(range_start(namespace, auid, url)..)
            .take_while(move |((ns, au, u, _), _)| ns == namespace && au == auid && u == url);
        self.resolve(entries)
    }

    /// Every version of every URL in one AU starting with `prefix`.
    fn prefix_range<'a>(
        &'a self,
        namespace: &'a str,
        auid: &'a str,
        prefix: &'a str,
    ) -> impl Iterator<Item = &'a Artifact> + 'a {
        let entries = self
            .by_stem
            .range(range_start(namespace, auid, prefix)..)
            .take_while(move |((ns, au, u, _), _)| {
                ns == namespace && au == auid && u.starts_with(prefix)
            });
        self.resolve(entries)
    }

    /// Every artifact in a namespace, grouped by AU.
    fn namespace_range<'a>(&'a self, namespace: &'a str) -> impl Iterator<Item = &'a Artifact> + 'a {
        let entries = self
            .by_stem
            .range(range_start(namespace, "", "")..)
            .take_while(move |((ns, _, _, _), _)| ns == namespace);
        self.resolve(entries)
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    pub(crate) fn namespaces(&self) -> Vec<String> {
        self.au_counts.keys().cloned().collect()
    }

    pub(crate) fn au_ids(&self, namespace: &str) -> Vec<String> {
        self.au_counts
            .get(namespace)
            .map(|aus| aus.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn latest(
        &self,
        namespace: &str,
        auid: &str,
        url: &str,
        include_uncommitted: bool,
    ) -> Option<Artifact> {
        self.url_range(namespace, auid, url)
            .find(|a| a.is_visible(include_uncommitted))
            .cloned()
    }

    pub(crate) fn version(
        &self,
        namespace: &str,
        auid: &str,
        url: &str,
        version: ArtifactVersion,
        include_uncommitted: bool,
    ) -> Option<Artifact> {
        self.by_stem
            .get(&stem_key(namespace, auid, url, version))
            .and_then(|uuid| self.by_uuid.get(uuid))
            .filter(|a| a.is_visible(include_uncommitted))
            .cloned()
    }

    pub(crate) fn au_latest(&self, namespace: &str, auid: &str, include_uncommitted: bool) -> Vec<Artifact> {
        latest_per_stem(self.au_all_versions(namespace, auid, include_uncommitted))
    }

    pub(crate) fn au_all_versions(
        &self,
        namespace: &str,
        auid: &str,
        include_uncommitted: bool,
    ) -> Vec<Artifact> {
        self.au_range(namespace, auid)
            .filter(|a| a.is_visible(include_uncommitted))
            .cloned()
            .collect()
    }

    pub(crate) fn url_all_versions(
        &self,
        namespace: &str,
        auid: &str,
        url: &str,
        include_uncommitted: bool,
    ) -> Vec<Artifact> {
        self.url_range(namespace, auid, url)
            .filter(|a| a.is_visible(include_uncommitted))
            .cloned()
            .collect()
    }

    pub(crate) fn prefix_latest(&self, namespace: &str, auid: &str, prefix: &str) -> Vec<Artifact> {
        latest_per_stem(self.prefix_all_versions(namespace, auid, prefix))
    }

    pub(crate) fn prefix_all_versions(&self, namespace: &str, auid: &str, prefix: &str) -> Vec<Artifact> {
        self.prefix_range(namespace, auid, prefix)
            .filter(|a| a.committed)
            .cloned()
            .collect()
    }

    /// Committed artifacts of every AU in a namespace whose URL satisfies
    /// `matches`, in cross-AU order.
    pub(crate) fn across_aus(
        &self,
        namespace: &str,
        matches: impl Fn(&str) -> bool,
        versions: ArtifactVersions,
    ) -> Vec<Artifact> {
        let mut found: Vec<Artifact> = self
            .namespace_range(namespace)
            .filter(|a| a.committed && matches(&a.url))
            .cloned()
            .collect();
        found.sort_by(cmp_across_aus);
        select_versions(found, versions)
    }

    /// `(total_latest_versions, total_all_versions)` of one AU.
    pub(crate) fn size_totals(&self, namespace: &str, auid: &str) -> (i64, i64) {
        committed_size_totals(self.au_range(namespace, auid))
    }
}

// ============================================================================
// SHARED TABLE
// ============================================================================

/// An [`ArtifactTable`] behind the backend's single lock.
#[derive(Debug, Default)]
pub(crate) struct SharedTable {
    inner: RwLock<ArtifactTable>,
}

impl SharedTable {
    fn read_guard(&self) -> IndexResult<RwLockReadGuard<'_, ArtifactTable>> {
        self.inner.read().map_err(|_| StorageError::LockPoisoned.into())
    }

    fn write_guard(&self) -> IndexResult<RwLockWriteGuard<'_, ArtifactTable>> {
        self.inner.write().map_err(|_| StorageError::LockPoisoned.into())
    }

    /// Run a read-only query under the lock. Results are owned copies so the
    /// lock is released before the caller continues.
    pub(crate) fn read<T>(&self, query: impl FnOnce(&ArtifactTable) -> T) -> IndexResult<T> {
        let table = self.read_guard()?;
        Ok(query(&table))
    }

    /// Apply a mutation under the exclusive lock.
    pub(crate) fn mutate<T>(
        &self,
        mutation: impl FnOnce(&mut ArtifactTable) -> IndexResult<T>,
    ) -> IndexResult<T> {
        let mut table = self.write_guard()?;
        mutation(&mut table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vellum_core::IndexError;

    fn artifact(auid: &str, url: &str, version: i32) -> Artifact {
        Artifact::new(Uuid::now_v7(), "ns", auid, url, version).with_content(10, "SHA-256:00")
    }

    #[test]
    fn test_insert_forces_uncommitted() {
        let mut table = ArtifactTable::default();
        let stored = table
            .insert(&artifact("au", "u", 1).with_committed(true))
            .expect("insert");
        assert!(!stored.committed);
        assert!(!table.get(stored.uuid).expect("present").committed);
    }

    #[test]
    fn test_duplicate_uuid_rejected() {
        let mut table = ArtifactTable::default();
        let a = artifact("au", "u", 1);
        table.insert(&a).expect("insert");
        let mut again = a.clone();
        again.version = 2;
        assert!(matches!(
            table.insert(&again),
            Err(IndexError::Storage(StorageError::AlreadyExists { .. }))
        ));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_duplicate_stem_version_rejected() {
        let mut table = ArtifactTable::default();
        table.insert(&artifact("au", "u", 1)).expect("insert");
        assert!(matches!(
            table.insert(&artifact("au", "u", 1)),
            Err(IndexError::Validation(ValidationError::ConstraintViolation { .. }))
        ));
    }

    #[test]
    fn test_ranges_do_not_leak_across_aus() {
        let mut table = ArtifactTable::default();
        for (au, url, v) in [("a", "u", 1), ("a", "v", 1), ("ab", "u", 1), ("b", "u", 2)] {
            table.insert(&artifact(au, url, v)).expect("insert");
        }
        assert_eq!(table.au_all_versions("ns", "a", true).len(), 2);
        assert_eq!(table.au_all_versions("ns", "ab", true).len(), 1);
        assert_eq!(table.url_all_versions("ns", "a", "u", true).len(), 1);
        assert_eq!(table.au_all_versions("other", "a", true).len(), 0);
    }

    #[test]
    fn test_prefix_range_is_literal() {
        let mut table = ArtifactTable::default();
        for url in ["http://x/a%", "http://x/a_", "http://x/ab", "http://x/b"] {
            let stored = table.insert(&artifact("au", url, 1)).expect("insert");
            table.commit(stored.uuid);
        }
        let urls: Vec<String> = table
            .prefix_latest("ns", "au", "http://x/a%")
            .into_iter()
            .map(|a| a.url)
            .collect();
        assert_eq!(urls, vec!["http://x/a%".to_string()]);
        assert_eq!(table.prefix_latest("ns", "au", "http://x/a").len(), 3);
        assert_eq!(table.prefix_latest("ns", "au", "").len(), 4);
    }

    #[test]
    fn test_counts_track_removal() {
        let mut table = ArtifactTable::default();
        let a = table.insert(&artifact("a", "u", 1)).expect("insert");
        let b = table.insert(&artifact("b", "u", 1)).expect("insert");
        assert_eq!(table.au_ids("ns"), vec!["a".to_string(), "b".to_string()]);

        table.remove(a.uuid).expect("removed");
        assert_eq!(table.au_ids("ns"), vec!["b".to_string()]);
        assert_eq!(table.namespaces(), vec!["ns".to_string()]);

        table.remove(b.uuid).expect("removed");
        assert!(table.namespaces().is_empty());
        assert!(table.au_ids("ns").is_empty());
        assert!(table.remove(b.uuid).is_none());
    }

    #[test]
    fn test_latest_skips_uncommitted_when_excluded() {
        let mut table = ArtifactTable::default();
        let v1 = table.insert(&artifact("au", "u", 1)).expect("insert");
        table.commit(v1.uuid);
        let v2 = table.insert(&artifact("au", "u", 2)).expect("insert");

        assert_eq!(table.latest("ns", "au", "u", false).map(|a| a.uuid), Some(v1.uuid));
        assert_eq!(table.latest("ns", "au", "u", true).map(|a| a.uuid), Some(v2.uuid));
        assert!(table.version("ns", "au", "u", 2, false).is_none());
        assert!(table.version("ns", "au", "u", 2, true).is_some());
    }
}

//! Content store collaborator.
//!
//! The index never reads artifact bytes. The only thing it needs from the
//! content store is the physical size of an AU's stored WARCs, which it relays
//! in [`vellum_core::AuSize::total_warc_size`].

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use vellum_core::{IndexResult, LifecycleError, StorageError};

/// The part of the content store the index depends on.
#[async_trait]
pub trait ArtifactDataStore: Send + Sync {
    /// Physical on-disk footprint of an AU's stored content, in bytes.
    async fn au_warc_size(&self, namespace: &str, auid: &str) -> IndexResult<i64>;
}

/// Registration point for the content store, which registers itself after
/// the index has been constructed.
#[derive(Default)]
pub(crate) struct DataStoreSlot {
    store: RwLock<Option<Arc<dyn ArtifactDataStore>>>,
}

impl DataStoreSlot {
    pub(crate) fn set(&self, store: Arc<dyn ArtifactDataStore>) {
        match self.store.write() {
            Ok(mut slot) => *slot = Some(store),
            Err(poisoned) => *poisoned.into_inner() = Some(store),
        }
    }

    pub(crate) fn get(&self) -> IndexResult<Arc<dyn ArtifactDataStore>> {
        let slot = self.store.read().map_err(|_| StorageError::LockPoisoned)?;
        slot.clone()
            .ok_or_else(|| LifecycleError::DataStoreUnavailable.into())
    }

    pub(crate) async fn au_warc_size(&self, namespace: &str, auid: &str) -> IndexResult<i64> {
        let store = self.get()?;
        store.au_warc_size(namespace, auid).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vellum_core::IndexError;

    struct FixedSize(i64);

    #[async_trait]
    impl ArtifactDataStore for FixedSize {
        async fn au_warc_size(&self, _namespace: &str, _auid: &str) -> IndexResult<i64> {
            Ok(self.0)
        }
    }

    #[tokio::test]
    async fn test_unregistered_store_is_unavailable() {
        let slot = DataStoreSlot::default();
        assert!(matches!(
            slot.au_warc_size("ns", "au").await,
            Err(IndexError::Lifecycle(LifecycleError::DataStoreUnavailable))
        ));
    }

    #[tokio::test]
    async fn test_registered_store_is_used() {
        let slot = DataStoreSlot::default();
        slot.set(Arc::new(FixedSize(4096)));
        assert_eq!(slot.au_warc_size("ns", "au").await.expect("size"), 4096);
        slot.set(Arc::new(FixedSize(1)));
        assert_eq!(slot.au_warc_size("ns", "au").await.expect("size"), 1);
    }
}

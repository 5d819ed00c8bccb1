//! LMDB snapshot store for the local artifact index.
//!
//! Uses the heed crate (Rust bindings for LMDB). One record per artifact:
//! the key is the artifact uuid (16 bytes), the value is the JSON-encoded
//! [`Artifact`]. A batch of changes is applied in a single write
//! transaction, so the file on disk is always a consistent snapshot.

use std::collections::HashMap;

use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use uuid::Uuid;
use vellum_core::{Artifact, IndexError, LocalIndexConfig, StorageError};

/// Error type for LMDB snapshot operations.
#[derive(Debug, thiserror::Error)]
pub enum LocalStoreError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open the database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LocalStoreError> for IndexError {
    fn from(e: LocalStoreError) -> Self {
        IndexError::Storage(StorageError::PersistenceFailed {
            reason: e.to_string(),
        })
    }
}

/// A pending change to one artifact record: `Some` writes it, `None` removes it.
pub(crate) type PendingChanges = HashMap<Uuid, Option<Artifact>>;

pub(crate) struct LmdbSnapshotStore {
    env: Env,
    db: Database<Bytes, Bytes>,
}

impl LmdbSnapshotStore {
    /// Open (creating if needed) the store described by `config`.
    pub(crate) fn open(config: &LocalIndexConfig) -> Result<Self, LocalStoreError> {
        std::fs::create_dir_all(&config.path)?;

        // SAFETY: the environment is opened once per index instance and the
        // index never maps the same path twice while it is open.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(config.max_size_mb * 1024 * 1024)
                .max_dbs(1)
                .open(&config.path)
        }
        .map_err(|e| LocalStoreError::EnvOpen(e.to_string()))?;

        let mut wtxn = env
            .write_txn()
            .map_err(|e| LocalStoreError::Transaction(e.to_string()))?;
        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| LocalStoreError::DbOpen(e.to_string()))?;
        wtxn.commit()
            .map_err(|e| LocalStoreError::Transaction(e.to_string()))?;

        Ok(Self { env, db })
    }

    /// Read every persisted artifact. Undecodable records are skipped.
    pub(crate) fn load_all(&self) -> Result<Vec<Artifact>, LocalStoreError> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| LocalStoreError::Transaction(e.to_string()))?;
        let iter = self
            .db
            .iter(&rtxn)
            .map_err(|e| LocalStoreError::Transaction(e.to_string()))?;

        let mut artifacts = Vec::new();
        for entry in iter {
            let (key, value) = entry.map_err(|e| LocalStoreError::Transaction(e.to_string()))?;
            match decode_record(key, value) {
                Ok(artifact) => artifacts.push(artifact),
                Err(e) => tracing::warn!(error = %e, "Skipping unreadable artifact record"),
            }
        }
        Ok(artifacts)
    }

    /// Apply a batch of changes in one write transaction.
    pub(crate) fn apply(&self, changes: &PendingChanges) -> Result<(), LocalStoreError> {
        if changes.is_empty() {
            return Ok(());
        }

        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| LocalStoreError::Transaction(e.to_string()))?;

        for (uuid, change) in changes {
            match change {
                Some(artifact) => {
                    let value = serde_json::to_vec(artifact)
                        .map_err(|e| LocalStoreError::Serialization(e.to_string()))?;
                    self.db
                        .put(&mut wtxn, uuid.as_bytes(), &value)
                        .map_err(|e| LocalStoreError::Transaction(e.to_string()))?;
                }
                None => {
                    self.db
                        .delete(&mut wtxn, uuid.as_bytes())
                        .map_err(|e| LocalStoreError::Transaction(e.to_string()))?;
                }
            }
        }

        wtxn.commit()
            .map_err(|e| LocalStoreError::Transaction(e.to_string()))
    }

    /// Number of persisted records.
    #[cfg(test)]
    pub(crate) fn record_count(&self) -> Result<u64, LocalStoreError> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| LocalStoreError::Transaction(e.to_string()))?;
        self.db
            .len(&rtxn)
            .map_err(|e| LocalStoreError::Transaction(e.to_string()))
    }
}

fn decode_record(key: &[u8], value: &[u8]) -> Result<Artifact, StorageError> {
    let corrupt = |reason: String| StorageError::CorruptRecord {
        key: hex::encode(key),
        reason,
    };

    let uuid = Uuid::from_slice(key).map_err(|e| corrupt(e.to_string()))?;
    let artifact: Artifact = serde_json::from_slice(value).map_err(|e| corrupt(e.to_string()))?;
    if artifact.uuid != uuid {
        return Err(corrupt(format!("record holds artifact {}", artifact.uuid)));
    }
    Ok(artifact)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_temp() -> (TempDir, LocalIndexConfig, LmdbSnapshotStore) {
        let dir = TempDir::new().expect("tempdir");
        let mut config = LocalIndexConfig::new(dir.path().join("index"));
        config.max_size_mb = 16;
        let store = LmdbSnapshotStore::open(&config).expect("open");
        (dir, config, store)
    }

    fn artifact(url: &str) -> Artifact {
        Artifact::new(Uuid::now_v7(), "ns", "au", url, 1).with_content(3, "SHA-256:00")
    }

    #[test]
    fn test_apply_and_load() {
        let (_dir, _config, store) = open_temp();
        let a = artifact("a");
        let b = artifact("b").with_committed(true);

        let mut changes = PendingChanges::new();
        changes.insert(a.uuid, Some(a.clone()));
        changes.insert(b.uuid, Some(b.clone()));
        store.apply(&changes).expect("apply");
        assert_eq!(store.record_count().expect("count"), 2);

        let mut changes = PendingChanges::new();
        changes.insert(a.uuid, None);
        store.apply(&changes).expect("apply");

        let loaded = store.load_all().expect("load");
        assert_eq!(loaded, vec![b]);
    }

    #[test]
    fn test_reopen_sees_previous_records() {
        let (_dir, config, store) = open_temp();
        let a = artifact("a");
        let mut changes = PendingChanges::new();
        changes.insert(a.uuid, Some(a.clone()));
        store.apply(&changes).expect("apply");
        drop(store);

        let reopened = LmdbSnapshotStore::open(&config).expect("reopen");
        assert_eq!(reopened.load_all().expect("load"), vec![a]);
    }

    #[test]
    fn test_delete_of_missing_record_is_harmless() {
        let (_dir, _config, store) = open_temp();
        let mut changes = PendingChanges::new();
        changes.insert(Uuid::now_v7(), None);
        store.apply(&changes).expect("apply");
        assert_eq!(store.record_count().expect("count"), 0);
    }

    #[test]
    fn test_decode_rejects_mismatched_key() {
        let a = artifact("a");
        let value = serde_json::to_vec(&a).expect("encode");
        let other = Uuid::now_v7();
        assert!(matches!(
            decode_record(other.as_bytes(), &value),
            Err(StorageError::CorruptRecord { .. })
        ));
        assert!(decode_record(a.uuid.as_bytes(), &value).is_ok());
        assert!(decode_record(b"short", &value).is_err());
    }
}

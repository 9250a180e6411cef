//! Local filesystem storage connector.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

use tokenvault_common::{Error, Metadata, ProviderId, Result, SealedRecord, TokenId};
use crate::connector::{Connector, ConnectorMetrics, Operation};

/// Characters escaped when a token id becomes a file name.
const FILENAME_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_');

const RECORD_EXTENSION: &str = "json";

/// On-disk document: the record plus provider-side tags.
#[derive(Debug, Serialize, Deserialize)]
struct StoredDocument {
    record: SealedRecord,
    tags: Metadata,
    stored_at: DateTime<Utc>,
}

/// Local filesystem storage connector.
///
/// Stores one JSON document per token in a flat directory. Writes go to a
/// temporary file first and are renamed into place, so readers never see a
/// partially written record.
pub struct LocalConnector {
    id: ProviderId,
    root: PathBuf,
    stores: AtomicU64,
    retrieves: AtomicU64,
    deletes: AtomicU64,
}

impl LocalConnector {
    /// Create a new local connector rooted at `root`.
    ///
    /// # Postconditions
    /// - Root directory is created if it doesn't exist
    ///
    /// # Errors
    /// - Permission denied
    pub fn new(id: ProviderId, root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        // Create root if it doesn't exist (sync for constructor)
        if !root.exists() {
            std::fs::create_dir_all(&root)?;
        }

        Ok(Self {
            id,
            root,
            stores: AtomicU64::new(0),
            retrieves: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
        })
    }

    /// Root directory of this connector.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn file_name(token_id: &TokenId) -> String {
        format!(
            "{}.{}",
            utf8_percent_encode(token_id.as_str(), FILENAME_ESCAPE),
            RECORD_EXTENSION
        )
    }

    fn path_for(&self, token_id: &TokenId) -> PathBuf {
        self.root.join(Self::file_name(token_id))
    }

    /// Recover a token id from a directory entry name.
    fn token_from_file_name(name: &str) -> Option<TokenId> {
        let stem = name.strip_suffix(&format!(".{}", RECORD_EXTENSION))?;
        if stem.starts_with('.') {
            return None;
        }
        let decoded = percent_decode_str(stem).decode_utf8().ok()?;
        TokenId::new(decoded.into_owned()).ok()
    }

    fn io_error(&self, operation: Operation, err: std::io::Error) -> Error {
        Error::connector(self.id.as_str(), operation.as_str(), err.to_string())
    }
}

#[async_trait]
impl Connector for LocalConnector {
    fn id(&self) -> &ProviderId {
        &self.id
    }

    fn kind(&self) -> &str {
        "local"
    }

    async fn initialize(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| self.io_error(Operation::Initialize, e))
    }

    async fn store(&self, record: &SealedRecord, metadata: &Metadata) -> Result<()> {
        let document = StoredDocument {
            record: record.clone(),
            tags: metadata.clone(),
            stored_at: Utc::now(),
        };
        let bytes = serde_json::to_vec(&document)?;

        let target = self.path_for(&record.token_id);
        let staging = self
            .root
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), Self::file_name(&record.token_id)));

        fs::write(&staging, &bytes)
            .await
            .map_err(|e| self.io_error(Operation::Store, e))?;
        if let Err(e) = fs::rename(&staging, &target).await {
            let _ = fs::remove_file(&staging).await;
            return Err(self.io_error(Operation::Store, e));
        }

        self.stores.fetch_add(1, Ordering::Relaxed);
        debug!(provider = %self.id, token = %record.token_id, "Stored record on disk");
        Ok(())
    }

    async fn retrieve(&self, token_id: &TokenId) -> Result<Option<SealedRecord>> {
        self.retrieves.fetch_add(1, Ordering::Relaxed);

        let bytes = match fs::read(self.path_for(token_id)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_error(Operation::Retrieve, e)),
        };

        let document: StoredDocument = serde_json::from_slice(&bytes).map_err(|e| {
            Error::connector(
                self.id.as_str(),
                Operation::Retrieve.as_str(),
                format!("corrupt record {}: {}", token_id, e),
            )
        })?;
        Ok(Some(document.record))
    }

    async fn delete(&self, token_id: &TokenId) -> Result<()> {
        match fs::remove_file(self.path_for(token_id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(self.io_error(Operation::Delete, e)),
        }
        self.deletes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn list_inventory(&self) -> Result<HashSet<TokenId>> {
        let mut entries = fs::read_dir(&self.root)
            .await
            .map_err(|e| self.io_error(Operation::ListInventory, e))?;

        let mut inventory = HashSet::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| self.io_error(Operation::ListInventory, e))?
        {
            if let Some(token_id) = entry.file_name().to_str().and_then(Self::token_from_file_name) {
                inventory.insert(token_id);
            }
        }
        Ok(inventory)
    }

    async fn token_count(&self) -> Result<u64> {
        Ok(self.list_inventory().await?.len() as u64)
    }

    async fn is_healthy(&self) -> bool {
        fs::metadata(&self.root)
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false)
    }

    async fn metrics(&self) -> ConnectorMetrics {
        let mut metrics = ConnectorMetrics::new();
        metrics.insert("provider".into(), self.id.as_str().into());
        metrics.insert("kind".into(), "local".into());
        metrics.insert("root".into(), self.root.display().to_string().into());
        if let Ok(count) = self.token_count().await {
            metrics.insert("token_count".into(), count.into());
        }
        metrics.insert("stores".into(), self.stores.load(Ordering::Relaxed).into());
        metrics.insert("retrieves".into(), self.retrieves.load(Ordering::Relaxed).into());
        metrics.insert("deletes".into(), self.deletes.load(Ordering::Relaxed).into());
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(id: &str) -> SealedRecord {
        SealedRecord::new(
            TokenId::new(id).unwrap(),
            b"opaque-ciphertext".to_vec(),
            vec![3; 12],
            "AES-256-GCM",
        )
        .with_metadata("last4", "4242")
    }

    #[tokio::test]
    async fn test_store_retrieve_round_trip() {
        let dir = TempDir::new().unwrap();
        let connector = LocalConnector::new(ProviderId::AZURE, dir.path()).unwrap();
        let original = record("tok_1");

        connector.store(&original, &Metadata::new()).await.unwrap();
        let fetched = connector
            .retrieve(&original.token_id)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(fetched, original);
    }

    #[tokio::test]
    async fn test_retrieve_missing_is_none() {
        let dir = TempDir::new().unwrap();
        let connector = LocalConnector::new(ProviderId::AZURE, dir.path()).unwrap();
        let missing = TokenId::new("tok_missing").unwrap();
        assert!(connector.retrieve(&missing).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_token_ids_with_separators() {
        let dir = TempDir::new().unwrap();
        let connector = LocalConnector::new(ProviderId::GCP, dir.path()).unwrap();
        let original = record("merchant/42:tok.9");

        connector.store(&original, &Metadata::new()).await.unwrap();
        let inventory = connector.list_inventory().await.unwrap();

        assert_eq!(inventory.len(), 1);
        assert!(inventory.contains(&original.token_id));
        assert!(connector.retrieve(&original.token_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_and_count() {
        let dir = TempDir::new().unwrap();
        let connector = LocalConnector::new(ProviderId::AWS, dir.path()).unwrap();
        for id in ["a", "b"] {
            connector.store(&record(id), &Metadata::new()).await.unwrap();
        }
        assert_eq!(connector.token_count().await.unwrap(), 2);

        let a = TokenId::new("a").unwrap();
        connector.delete(&a).await.unwrap();
        connector.delete(&a).await.unwrap();
        assert_eq!(connector.token_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_record_is_connector_error() {
        let dir = TempDir::new().unwrap();
        let connector = LocalConnector::new(ProviderId::AWS, dir.path()).unwrap();
        std::fs::write(dir.path().join("broken.json"), b"{not json").unwrap();

        let err = connector
            .retrieve(&TokenId::new("broken").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Connector { .. }));
    }

    #[tokio::test]
    async fn test_health_follows_root_directory() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("store");
        let connector = LocalConnector::new(ProviderId::AWS, &root).unwrap();
        assert!(connector.is_healthy().await);

        std::fs::remove_dir_all(&root).unwrap();
        assert!(!connector.is_healthy().await);

        connector.initialize().await.unwrap();
        assert!(connector.is_healthy().await);
    }
}

//! In-memory storage connector for testing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

use tokenvault_common::{Error, Metadata, ProviderId, Result, SealedRecord, TokenId};
use crate::connector::{Connector, ConnectorMetrics, Operation};

/// A stored record plus the provider-side tags it was written with.
#[derive(Debug, Clone)]
struct StoredObject {
    record: SealedRecord,
    tags: Metadata,
    stored_at: DateTime<Utc>,
}

/// In-memory storage connector.
///
/// Useful for testing and development. All data is stored in memory
/// and lost on drop. Failures can be injected per operation to simulate
/// a degraded provider.
pub struct MemoryConnector {
    id: ProviderId,
    objects: RwLock<HashMap<TokenId, StoredObject>>,
    healthy: AtomicBool,
    /// Bitmask of operations that currently fail.
    failing: AtomicU8,
    latency_ms: AtomicU64,
    stores: AtomicU64,
    retrieves: AtomicU64,
    deletes: AtomicU64,
}

impl MemoryConnector {
    /// Create a new empty connector for `id`.
    pub fn new(id: ProviderId) -> Self {
        Self {
            id,
            objects: RwLock::new(HashMap::new()),
            healthy: AtomicBool::new(true),
            failing: AtomicU8::new(0),
            latency_ms: AtomicU64::new(0),
            stores: AtomicU64::new(0),
            retrieves: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
        }
    }

    /// Make `operation` fail (or succeed again) on every call.
    pub fn set_fail_on(&self, operation: Operation, fail: bool) {
        let bit = Self::bit(operation);
        if fail {
            self.failing.fetch_or(bit, Ordering::SeqCst);
        } else {
            self.failing.fetch_and(!bit, Ordering::SeqCst);
        }
    }

    /// Control the answer of the liveness probe.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Delay every operation by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Provider-side tags a token was stored with.
    pub async fn tags(&self, token_id: &TokenId) -> Option<Metadata> {
        self.objects
            .read()
            .await
            .get(token_id)
            .map(|object| object.tags.clone())
    }

    fn bit(operation: Operation) -> u8 {
        1 << (operation as u8)
    }

    /// Apply simulated latency and injected failures for `operation`.
    async fn gate(&self, operation: Operation) -> Result<()> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.failing.load(Ordering::SeqCst) & Self::bit(operation) != 0 {
            return Err(Error::connector(
                self.id.as_str(),
                operation.as_str(),
                "injected failure",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    fn id(&self) -> &ProviderId {
        &self.id
    }

    fn kind(&self) -> &str {
        "memory"
    }

    async fn initialize(&self) -> Result<()> {
        self.gate(Operation::Initialize).await
    }

    async fn store(&self, record: &SealedRecord, metadata: &Metadata) -> Result<()> {
        self.gate(Operation::Store).await?;

        let object = StoredObject {
            record: record.clone(),
            tags: metadata.clone(),
            stored_at: Utc::now(),
        };
        self.objects
            .write()
            .await
            .insert(record.token_id.clone(), object);
        self.stores.fetch_add(1, Ordering::Relaxed);

        Ok(())
    }

    async fn retrieve(&self, token_id: &TokenId) -> Result<Option<SealedRecord>> {
        self.gate(Operation::Retrieve).await?;
        self.retrieves.fetch_add(1, Ordering::Relaxed);

        Ok(self
            .objects
            .read()
            .await
            .get(token_id)
            .map(|object| object.record.clone()))
    }

    async fn delete(&self, token_id: &TokenId) -> Result<()> {
        self.gate(Operation::Delete).await?;
        self.objects.write().await.remove(token_id);
        self.deletes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn list_inventory(&self) -> Result<HashSet<TokenId>> {
        self.gate(Operation::ListInventory).await?;
        Ok(self.objects.read().await.keys().cloned().collect())
    }

    async fn token_count(&self) -> Result<u64> {
        self.gate(Operation::ListInventory).await?;
        Ok(self.objects.read().await.len() as u64)
    }

    async fn is_healthy(&self) -> bool {
        self.gate(Operation::HealthCheck).await.is_ok() && self.healthy.load(Ordering::SeqCst)
    }

    async fn metrics(&self) -> ConnectorMetrics {
        let objects = self.objects.read().await;
        let newest = objects.values().map(|object| object.stored_at).max();

        let mut metrics = ConnectorMetrics::new();
        metrics.insert("provider".into(), self.id.as_str().into());
        metrics.insert("kind".into(), "memory".into());
        metrics.insert("token_count".into(), (objects.len() as u64).into());
        metrics.insert("stores".into(), self.stores.load(Ordering::Relaxed).into());
        metrics.insert("retrieves".into(), self.retrieves.load(Ordering::Relaxed).into());
        metrics.insert("deletes".into(), self.deletes.load(Ordering::Relaxed).into());
        if let Some(newest) = newest {
            metrics.insert("last_store_at".into(), newest.to_rfc3339().into());
        }
        metrics
    }
}

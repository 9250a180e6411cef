//! Storage connector trait definition.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

use tokenvault_common::{Metadata, ProviderId, Result, SealedRecord, TokenId};

/// Connector operations, used for error attribution and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Initialize,
    Store,
    Retrieve,
    Delete,
    ListInventory,
    HealthCheck,
}

impl Operation {
    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialize => "initialize",
            Self::Store => "store",
            Self::Retrieve => "retrieve",
            Self::Delete => "delete",
            Self::ListInventory => "list_inventory",
            Self::HealthCheck => "health_check",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Free-form connector metrics, keyed by metric name.
pub type ConnectorMetrics = HashMap<String, serde_json::Value>;

/// Uniform contract over one storage provider.
///
/// The replication coordinator calls every connector from independent
/// concurrent tasks, so implementations must tolerate concurrent
/// invocation of any method.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Provider tag this connector is registered under.
    fn id(&self) -> &ProviderId;

    /// Implementation kind (e.g. "memory", "local").
    fn kind(&self) -> &str;

    /// Prepare the backend (create buckets, directories, clients).
    async fn initialize(&self) -> Result<()>;

    /// Store a sealed record.
    ///
    /// `metadata` is provider-side object metadata (merchant, job id). It is
    /// kept next to the record and does not alter the record itself.
    ///
    /// # Postconditions
    /// - A later `retrieve` of the same token returns `record` unchanged
    ///
    /// # Errors
    /// - `Error::Connector` for network, auth or quota failures
    async fn store(&self, record: &SealedRecord, metadata: &Metadata) -> Result<()>;

    /// Retrieve a sealed record.
    ///
    /// Absence is `Ok(None)`, not an error.
    async fn retrieve(&self, token_id: &TokenId) -> Result<Option<SealedRecord>>;

    /// Delete a sealed record. Deleting an absent token succeeds.
    async fn delete(&self, token_id: &TokenId) -> Result<()>;

    /// Ids of every token held by this provider.
    async fn list_inventory(&self) -> Result<HashSet<TokenId>>;

    /// Number of tokens held by this provider.
    async fn token_count(&self) -> Result<u64>;

    /// Cheap liveness probe.
    async fn is_healthy(&self) -> bool;

    /// Implementation-specific counters.
    async fn metrics(&self) -> ConnectorMetrics;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_names() {
        assert_eq!(Operation::ListInventory.to_string(), "list_inventory");
        let json = serde_json::to_string(&Operation::HealthCheck).unwrap();
        assert_eq!(json, "\"health_check\"");
    }
}

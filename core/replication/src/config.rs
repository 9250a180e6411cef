//! Replication configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use tokenvault_common::{Error, ProviderId, Result};
use tokenvault_storage::{ConnectorRegistry, ConnectorSet};

use crate::affinity::RegionAffinity;
use crate::health::DEFAULT_FAILURE_THRESHOLD;
use crate::job::DEFAULT_JOB_HISTORY_CAPACITY;

/// One configured provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSpec {
    /// Provider tag (e.g. "aws").
    pub id: ProviderId,
    /// Connector kind registered in the [`ConnectorRegistry`] (e.g. "local").
    pub kind: String,
    /// Kind-specific configuration.
    #[serde(default)]
    pub config: serde_json::Value,
}

/// Configuration for the replication coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Concurrent provider calls for replicate, retrieve and delete.
    pub worker_pool_size: usize,
    /// Concurrent provider calls for reconciliation passes.
    pub reconcile_pool_size: usize,
    /// Deadline for any single provider call.
    pub operation_timeout_ms: u64,
    /// Period of the active health probe.
    pub health_probe_interval_secs: u64,
    /// Period of the reconciliation pass.
    pub reconcile_interval_secs: u64,
    /// Consecutive failures before a provider is marked unavailable.
    pub failure_threshold: u32,
    /// Finished jobs kept for statistics.
    pub job_history_capacity: usize,
    /// Region hint routing table.
    pub region_affinity: RegionAffinity,
    /// Providers, in their stable declared order.
    pub providers: Vec<ProviderSpec>,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 10,
            reconcile_pool_size: 4,
            operation_timeout_ms: 10_000,
            health_probe_interval_secs: 30,
            reconcile_interval_secs: 300,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            job_history_capacity: DEFAULT_JOB_HISTORY_CAPACITY,
            region_affinity: RegionAffinity::default(),
            providers: Vec::new(),
        }
    }
}

impl ReplicationConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn health_probe_interval(&self) -> Duration {
        Duration::from_secs(self.health_probe_interval_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    /// Check internal consistency.
    ///
    /// # Errors
    /// - Zero pool sizes, timeouts, intervals or threshold
    /// - Duplicate provider ids
    /// - Affinity rules naming providers that are not declared
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("worker_pool_size", self.worker_pool_size as u64),
            ("reconcile_pool_size", self.reconcile_pool_size as u64),
            ("operation_timeout_ms", self.operation_timeout_ms),
            ("health_probe_interval_secs", self.health_probe_interval_secs),
            ("reconcile_interval_secs", self.reconcile_interval_secs),
            ("failure_threshold", self.failure_threshold as u64),
            ("job_history_capacity", self.job_history_capacity as u64),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(Error::Config(format!("{} must be greater than zero", name)));
            }
        }

        let mut seen = HashSet::new();
        for spec in &self.providers {
            if !seen.insert(&spec.id) {
                return Err(Error::Config(format!("Provider '{}' is declared twice", spec.id)));
            }
        }

        if !self.providers.is_empty() {
            for provider in self.region_affinity.referenced_providers() {
                if !seen.contains(provider) {
                    return Err(Error::Config(format!(
                        "Region affinity references undeclared provider '{}'",
                        provider
                    )));
                }
            }
        }

        Ok(())
    }

    /// Build the declared connectors through `registry`.
    pub fn build_connectors(&self, registry: &ConnectorRegistry) -> Result<ConnectorSet> {
        let mut set = ConnectorSet::new();
        for spec in &self.providers {
            let connector = registry.resolve(&spec.kind, spec.id.clone(), spec.config.clone())?;
            set.insert(connector)?;
        }
        Ok(set)
    }

    /// Serialize configuration to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))
    }

    /// Read and validate a configuration file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = tokio::fs::read_to_string(path.as_ref()).await?;
        let config = Self::from_json(&json)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokenvault_storage::create_default_registry;

    fn three_memory_providers() -> Vec<ProviderSpec> {
        [ProviderId::AWS, ProviderId::AZURE, ProviderId::GCP]
            .into_iter()
            .map(|id| ProviderSpec {
                id,
                kind: "memory".to_string(),
                config: serde_json::Value::Null,
            })
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = ReplicationConfig::default();
        assert_eq!(config.worker_pool_size, 10);
        assert_eq!(config.health_probe_interval(), Duration::from_secs(30));
        assert_eq!(config.reconcile_interval(), Duration::from_secs(300));
        assert_eq!(config.failure_threshold, 3);
        assert_eq!(config.job_history_capacity, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = ReplicationConfig::from_json(
            r#"{
                "operation_timeout_ms": 250,
                "providers": [
                    { "id": "aws", "kind": "memory" },
                    { "id": "azure", "kind": "memory" },
                    { "id": "gcp", "kind": "memory" }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(config.operation_timeout(), Duration::from_millis(250));
        assert_eq!(config.worker_pool_size, 10);
        assert_eq!(config.providers.len(), 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = ReplicationConfig {
            worker_pool_size: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut duplicate = ReplicationConfig {
            providers: three_memory_providers(),
            ..Default::default()
        };
        duplicate.providers.push(duplicate.providers[0].clone());
        assert!(matches!(duplicate.validate(), Err(Error::Config(_))));

        let mut dangling = ReplicationConfig {
            providers: three_memory_providers(),
            ..Default::default()
        };
        dangling.providers.truncate(2);
        assert!(matches!(dangling.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_json_round_trip() {
        let config = ReplicationConfig {
            providers: three_memory_providers(),
            ..Default::default()
        };
        let restored = ReplicationConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(restored, config);
    }

    #[test]
    fn test_build_connectors_keeps_order() {
        let config = ReplicationConfig {
            providers: three_memory_providers(),
            ..Default::default()
        };
        let set = config.build_connectors(&create_default_registry()).unwrap();
        assert_eq!(set.ids(), vec![ProviderId::AWS, ProviderId::AZURE, ProviderId::GCP]);
    }

    #[test]
    fn test_build_connectors_unknown_kind() {
        let config = ReplicationConfig {
            providers: vec![ProviderSpec {
                id: ProviderId::AWS,
                kind: "s3".to_string(),
                config: json!({}),
            }],
            ..Default::default()
        };
        assert!(config.build_connectors(&create_default_registry()).is_err());
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        let config = ReplicationConfig {
            providers: three_memory_providers(),
            ..Default::default()
        };
        tokio::fs::write(&path, config.to_json().unwrap()).await.unwrap();

        let loaded = ReplicationConfig::load(&path).await.unwrap();
        assert_eq!(loaded, config);
    }
}

//! Connector registry for dynamic connector resolution.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use tokenvault_common::{Error, ProviderId, Result};
use crate::connector::Connector;

/// Factory function type for creating connectors.
///
/// Receives the provider tag the connector will serve and its JSON config.
pub type ConnectorFactory =
    Box<dyn Fn(ProviderId, Value) -> Result<Arc<dyn Connector>> + Send + Sync>;

/// Registry for connector factories.
///
/// Allows dynamic registration and resolution of connector kinds
/// by name and configuration.
pub struct ConnectorRegistry {
    factories: HashMap<String, ConnectorFactory>,
}

impl ConnectorRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a connector factory.
    ///
    /// # Errors
    /// - Returns error if `kind` is already registered
    pub fn register(&mut self, kind: impl Into<String>, factory: ConnectorFactory) -> Result<()> {
        let kind = kind.into();
        if self.factories.contains_key(&kind) {
            return Err(Error::AlreadyExists(format!(
                "Connector kind '{}' is already registered",
                kind
            )));
        }
        self.factories.insert(kind, factory);
        Ok(())
    }

    /// Build a connector of `kind` serving `provider`.
    ///
    /// # Errors
    /// - Kind not registered
    /// - Configuration invalid for the kind
    pub fn resolve(&self, kind: &str, provider: ProviderId, config: Value) -> Result<Arc<dyn Connector>> {
        let factory = self.factories.get(kind).ok_or_else(|| {
            Error::NotFound(format!("Connector kind '{}' is not registered", kind))
        })?;
        factory(provider, config)
    }

    /// Get list of registered connector kinds.
    pub fn kinds(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    /// Check if a connector kind is registered.
    pub fn has_kind(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a registry with the built-in connector kinds.
pub fn create_default_registry() -> ConnectorRegistry {
    let mut registry = ConnectorRegistry::new();

    // In-memory connector (for testing)
    registry.factories.insert(
        "memory".to_string(),
        Box::new(|provider, _config| Ok(Arc::new(crate::memory::MemoryConnector::new(provider)))),
    );

    // Local filesystem connector
    registry.factories.insert(
        "local".to_string(),
        Box::new(|provider, config| {
            let root = config
                .get("root")
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    Error::Config(format!("Local connector '{}' requires 'root' path", provider))
                })?;
            Ok(Arc::new(crate::local::LocalConnector::new(provider, root)?))
        }),
    );

    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryConnector;
    use serde_json::json;

    #[test]
    fn test_register_and_resolve() {
        let mut registry = ConnectorRegistry::new();

        registry
            .register("test", Box::new(|id, _| Ok(Arc::new(MemoryConnector::new(id)))))
            .unwrap();

        let connector = registry.resolve("test", ProviderId::GCP, Value::Null).unwrap();
        assert_eq!(connector.kind(), "memory");
        assert_eq!(connector.id(), &ProviderId::GCP);
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = ConnectorRegistry::new();

        registry
            .register("test", Box::new(|id, _| Ok(Arc::new(MemoryConnector::new(id)))))
            .unwrap();

        let result = registry.register("test", Box::new(|id, _| Ok(Arc::new(MemoryConnector::new(id)))));
        assert!(matches!(result, Err(Error::AlreadyExists(_))));
    }

    #[test]
    fn test_resolve_unknown_fails() {
        let registry = ConnectorRegistry::new();
        let result = registry.resolve("s3", ProviderId::AWS, Value::Null);
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_default_registry() {
        let registry = create_default_registry();
        assert!(registry.has_kind("memory"));
        assert!(registry.has_kind("local"));

        let missing_root = registry.resolve("local", ProviderId::AWS, json!({}));
        assert!(matches!(missing_root, Err(Error::Config(_))));

        let dir = tempfile::TempDir::new().unwrap();
        let local = registry
            .resolve("local", ProviderId::AWS, json!({ "root": dir.path() }))
            .unwrap();
        assert_eq!(local.kind(), "local");
    }
}

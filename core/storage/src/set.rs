//! Ordered set of live connectors, keyed by provider tag.

use std::sync::Arc;
use tracing::info;

use tokenvault_common::{Error, ProviderId, Result};
use crate::connector::Connector;

/// Connectors in their declared order.
///
/// The declared order is the stable order used for failover and for
/// breaking conflict ties, so it is preserved exactly as inserted.
#[derive(Clone, Default)]
pub struct ConnectorSet {
    entries: Vec<Arc<dyn Connector>>,
}

impl ConnectorSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a connector.
    ///
    /// # Errors
    /// - Returns error if a connector with the same provider tag exists
    pub fn insert(&mut self, connector: Arc<dyn Connector>) -> Result<()> {
        if self.contains(connector.id()) {
            return Err(Error::AlreadyExists(format!(
                "Provider '{}' is already in the set",
                connector.id()
            )));
        }
        self.entries.push(connector);
        Ok(())
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with(mut self, connector: Arc<dyn Connector>) -> Result<Self> {
        self.insert(connector)?;
        Ok(self)
    }

    pub fn get(&self, id: &ProviderId) -> Option<&Arc<dyn Connector>> {
        self.entries.iter().find(|c| c.id() == id)
    }

    pub fn contains(&self, id: &ProviderId) -> bool {
        self.get(id).is_some()
    }

    /// Provider tags in declared order.
    pub fn ids(&self) -> Vec<ProviderId> {
        self.entries.iter().map(|c| c.id().clone()).collect()
    }

    /// Position of `id` in declared order.
    pub fn position(&self, id: &ProviderId) -> Option<usize> {
        self.entries.iter().position(|c| c.id() == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Connector>> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Initialize every connector, stopping at the first failure.
    pub async fn initialize_all(&self) -> Result<()> {
        for connector in &self.entries {
            connector.initialize().await?;
            info!(provider = %connector.id(), kind = connector.kind(), "Connector initialized");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryConnector;

    #[test]
    fn test_declared_order_is_kept() {
        let set = ConnectorSet::new()
            .with(Arc::new(MemoryConnector::new(ProviderId::GCP)))
            .unwrap()
            .with(Arc::new(MemoryConnector::new(ProviderId::AWS)))
            .unwrap()
            .with(Arc::new(MemoryConnector::new(ProviderId::AZURE)))
            .unwrap();

        assert_eq!(set.ids(), vec![ProviderId::GCP, ProviderId::AWS, ProviderId::AZURE]);
        assert_eq!(set.position(&ProviderId::AWS), Some(1));
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_duplicate_provider_rejected() {
        let mut set = ConnectorSet::new();
        set.insert(Arc::new(MemoryConnector::new(ProviderId::AWS))).unwrap();
        let result = set.insert(Arc::new(MemoryConnector::new(ProviderId::AWS)));
        assert!(matches!(result, Err(Error::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_initialize_all() {
        let set = ConnectorSet::new()
            .with(Arc::new(MemoryConnector::new(ProviderId::AWS)))
            .unwrap();
        set.initialize_all().await.unwrap();
        assert!(set.get(&ProviderId::AWS).is_some());
        assert!(set.get(&ProviderId::GCP).is_none());
    }
}

//! Replication coordinator.
//!
//! The [`ReplicationCoordinator`] ties the connectors, the health monitor and
//! the conflict resolver together:
//!
//! - `replicate` fans one store task out per provider and waits for all
//! - `retrieve` reads from the region's preferred provider and fails over
//! - `delete_everywhere` fans one delete task out per provider
//! - `reconcile` repairs inventory gaps between providers
//!
//! Foreground calls and reconciliation use separate worker pools, so a
//! repair pass never queues ahead of a replication request.

mod dispatch;
mod reconcile;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use tokenvault_common::{ProviderId, Result, SealedRecord, TokenId};
use tokenvault_storage::{Connector, ConnectorMetrics, ConnectorRegistry, ConnectorSet, Operation};

use crate::affinity::RegionAffinity;
use crate::config::ReplicationConfig;
use crate::conflict::ConflictResolver;
use crate::health::{HealthMonitor, OverallHealth, ProviderHealthSnapshot};
use crate::job::{
    DeletionResult, JobHistory, JobStatus, ProviderOutcome, ReplicationContext, ReplicationJob,
    RetrievalResult,
};

use dispatch::Dispatcher;
pub use reconcile::{ReconciliationReport, RepairAction, RepairFailure, SkippedProvider};

/// Point-in-time view of the whole subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Statistics {
    pub overall_health: OverallHealth,
    pub providers: Vec<ProviderHealthSnapshot>,
    /// Most recent finished jobs, oldest first.
    pub recent_jobs: Vec<ReplicationJob>,
    pub generated_at: DateTime<Utc>,
}

/// Orchestrates replication, reads, deletes and repair across providers.
pub struct ReplicationCoordinator {
    connectors: ConnectorSet,
    health: Arc<HealthMonitor>,
    resolver: ConflictResolver,
    affinity: RegionAffinity,
    history: JobHistory,
    workers: Dispatcher,
    repair_workers: Dispatcher,
    /// Serializes reconciliation passes.
    reconcile_lock: Mutex<()>,
    config: ReplicationConfig,
}

impl ReplicationCoordinator {
    /// Create a coordinator over already-built connectors.
    ///
    /// The connector set's order is the declared provider order; it drives
    /// failover order and conflict tie-breaks.
    ///
    /// # Errors
    /// - Invalid configuration
    pub fn new(config: ReplicationConfig, connectors: ConnectorSet) -> Result<Self> {
        config.validate()?;

        let health = Arc::new(HealthMonitor::new(connectors.ids(), config.failure_threshold));
        let workers = Dispatcher::new(
            config.worker_pool_size,
            health.clone(),
            config.operation_timeout(),
        );
        let repair_workers = Dispatcher::new(
            config.reconcile_pool_size,
            health.clone(),
            config.operation_timeout(),
        );

        for provider in config.region_affinity.referenced_providers() {
            if !connectors.contains(provider) {
                warn!(%provider, "Region affinity names a provider with no connector");
            }
        }

        Ok(Self {
            resolver: ConflictResolver::new(connectors.ids()),
            affinity: config.region_affinity.clone(),
            history: JobHistory::new(config.job_history_capacity),
            connectors,
            health,
            workers,
            repair_workers,
            reconcile_lock: Mutex::new(()),
            config,
        })
    }

    /// Build connectors from the configured providers and initialize them.
    pub async fn from_config(config: ReplicationConfig, registry: &ConnectorRegistry) -> Result<Self> {
        let connectors = config.build_connectors(registry)?;
        connectors.initialize_all().await?;
        Self::new(config, connectors)
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    pub fn connectors(&self) -> &ConnectorSet {
        &self.connectors
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    /// Replicate `record` to every registered provider.
    pub async fn replicate(&self, record: SealedRecord, context: &ReplicationContext) -> ReplicationJob {
        self.replicate_to(record, context, None).await
    }

    /// Replicate `record` to `targets` (all providers when `None`).
    ///
    /// Blocks until every dispatched store has finished. Provider failures
    /// become failed outcomes; a target without a connector is a failed
    /// outcome too. The finished job is kept in the job history.
    pub async fn replicate_to(
        &self,
        record: SealedRecord,
        context: &ReplicationContext,
        targets: Option<&[ProviderId]>,
    ) -> ReplicationJob {
        let job = ReplicationJob::start(record.token_id.clone());
        let metadata = Arc::new(context.store_metadata(&job));
        let record = Arc::new(record);

        let (selected, unknown) = self.select_targets(targets);
        debug!(
            job_id = %job.job_id,
            token = %record.token_id,
            providers = selected.len(),
            "Dispatching replication"
        );

        let calls = self
            .workers
            .fan_out(&selected, Operation::Store, |connector| {
                let record = record.clone();
                let metadata = metadata.clone();
                async move { connector.store(&record, &metadata).await }
            })
            .await;

        let mut outcomes: Vec<ProviderOutcome> = calls.iter().map(|call| call.outcome()).collect();
        outcomes.extend(unknown.into_iter().map(|provider| {
            ProviderOutcome::failed(provider, std::time::Duration::ZERO, "provider not registered")
        }));

        let job = job.finalize(outcomes);
        self.log_job(&job);
        self.history.push(job.clone()).await;
        job
    }

    fn select_targets(&self, targets: Option<&[ProviderId]>) -> (Vec<Arc<dyn Connector>>, Vec<ProviderId>) {
        match targets {
            None => (self.connectors.iter().cloned().collect(), Vec::new()),
            Some(targets) => {
                let mut selected = Vec::new();
                let mut unknown = Vec::new();
                for target in targets {
                    match self.connectors.get(target) {
                        Some(connector) => selected.push(connector.clone()),
                        None => unknown.push(target.clone()),
                    }
                }
                (selected, unknown)
            }
        }
    }

    fn log_job(&self, job: &ReplicationJob) {
        let succeeded = job.success_count();
        let total = job.outcomes.len();
        match job.status {
            JobStatus::Failed => error!(
                job_id = %job.job_id,
                token = %job.token_id,
                "Replication failed on every provider"
            ),
            _ if !job.success => warn!(
                job_id = %job.job_id,
                token = %job.token_id,
                succeeded,
                total,
                "Replication quorum not met, awaiting reconciliation"
            ),
            _ => info!(
                job_id = %job.job_id,
                token = %job.token_id,
                status = ?job.status,
                succeeded,
                total,
                "Replication completed"
            ),
        }
    }

    /// Read order for `region_hint`.
    ///
    /// The preferred provider leads; the rest follow in declared order.
    /// Providers the health monitor holds unavailable are moved to the end,
    /// never dropped.
    fn read_order(&self, region_hint: &str) -> Vec<Arc<dyn Connector>> {
        let preferred = self.affinity.preferred(region_hint);

        let mut order: Vec<Arc<dyn Connector>> = Vec::with_capacity(self.connectors.len());
        if let Some(connector) = self.connectors.get(preferred) {
            order.push(connector.clone());
        }
        order.extend(
            self.connectors
                .iter()
                .filter(|c| c.id() != preferred)
                .cloned(),
        );

        let (available, unavailable): (Vec<_>, Vec<_>) = order
            .into_iter()
            .partition(|c| self.health.is_provider_healthy(c.id()));
        available.into_iter().chain(unavailable).collect()
    }

    /// Region-aware read with failover.
    ///
    /// Tries providers in [`read_order`](Self::read_order) until one returns
    /// the record. Errors and not-found answers both move on to the next
    /// provider.
    ///
    /// The region's preferred provider goes first only while the health
    /// monitor holds it available; a tripped preferred provider is tried
    /// after every available one.
    pub async fn retrieve(&self, token_id: &TokenId, region_hint: &str) -> RetrievalResult {
        let order = self.read_order(region_hint);
        let mut attempts = 0;

        for connector in order {
            attempts += 1;
            let call = self
                .workers
                .call(connector.id(), Operation::Retrieve, connector.retrieve(token_id))
                .await;

            match call.result {
                Ok(Some(record)) => {
                    if attempts > 1 {
                        info!(
                            token = %token_id,
                            provider = %call.provider,
                            attempts,
                            "Retrieved after failover"
                        );
                    }
                    return RetrievalResult::found(record, call.provider, attempts);
                }
                Ok(None) => debug!(token = %token_id, provider = %call.provider, "Token not held"),
                Err(_) => {}
            }
        }

        debug!(token = %token_id, attempts, "Token not found on any provider");
        RetrievalResult::not_found(attempts)
    }

    /// Delete `token_id` from every provider, tolerating individual failures.
    pub async fn delete_everywhere(&self, token_id: &TokenId) -> DeletionResult {
        let connectors: Vec<Arc<dyn Connector>> = self.connectors.iter().cloned().collect();
        let token = Arc::new(token_id.clone());

        let calls = self
            .workers
            .fan_out(&connectors, Operation::Delete, |connector| {
                let token = token.clone();
                async move { connector.delete(&token).await }
            })
            .await;

        let result = DeletionResult::from_outcomes(
            token_id.clone(),
            calls.iter().map(|call| call.outcome()).collect(),
        );
        if result.is_fully_deleted() {
            info!(token = %token_id, providers = result.total_count, "Token deleted everywhere");
        } else {
            warn!(
                token = %token_id,
                deleted = result.success_count,
                total = result.total_count,
                "Token only partially deleted"
            );
        }
        result
    }

    /// Run one active health probe over every provider.
    pub async fn probe_health(&self) -> Vec<(ProviderId, bool)> {
        let results = self
            .health
            .probe_all(&self.connectors, self.config.operation_timeout())
            .await;
        debug!(overall = ?self.health.overall_health(), "Health probe pass finished");
        results
    }

    /// Overall health, per-provider health and recent jobs.
    pub async fn statistics(&self) -> Statistics {
        Statistics {
            overall_health: self.health.overall_health(),
            providers: self.health.snapshots(),
            recent_jobs: self.history.recent().await,
            generated_at: Utc::now(),
        }
    }

    /// Connector-reported metrics, in declared order.
    pub async fn provider_metrics(&self) -> Vec<(ProviderId, ConnectorMetrics)> {
        let mut metrics = Vec::with_capacity(self.connectors.len());
        for connector in self.connectors.iter() {
            metrics.push((connector.id().clone(), connector.metrics().await));
        }
        metrics
    }
}

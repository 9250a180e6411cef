//! Anti-entropy reconciliation.
//!
//! A pass lists every provider's inventory, computes what each provider is
//! missing relative to the union, and copies the missing records in from
//! providers that hold them. When several providers hold a missing token,
//! the conflict resolver picks the copy to spread.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tokenvault_common::{Metadata, ProviderId, TokenId};
use tokenvault_storage::{Connector, Operation};

use super::ReplicationCoordinator;
use crate::conflict::RecordVersion;

/// A provider left out of a pass because its inventory could not be listed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedProvider {
    pub provider: ProviderId,
    pub reason: String,
}

/// A record copied into a provider that lacked it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairAction {
    pub token_id: TokenId,
    pub source: ProviderId,
    pub target: ProviderId,
}

/// A missing record that could not be copied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairFailure {
    pub token_id: TokenId,
    pub target: ProviderId,
    pub error: String,
}

/// Summary of one reconciliation pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconciliationReport {
    /// Providers whose inventory was listed.
    pub scanned: Vec<ProviderId>,
    pub skipped: Vec<SkippedProvider>,
    /// Missing (token, provider) pairs found.
    pub missing: usize,
    pub repairs: Vec<RepairAction>,
    pub failures: Vec<RepairFailure>,
    /// The pass stopped early on shutdown.
    pub cancelled: bool,
    pub duration_ms: u64,
}

impl ReconciliationReport {
    /// Every scanned provider was listed and every gap was repaired.
    pub fn is_complete(&self) -> bool {
        self.skipped.is_empty() && self.failures.is_empty() && !self.cancelled
    }
}

/// Where a missing token should be copied from.
type Resolved = Option<RecordVersion>;

impl ReplicationCoordinator {
    /// Run one reconciliation pass to completion.
    pub async fn reconcile(&self) -> ReconciliationReport {
        self.reconcile_with_cancel(&CancellationToken::new()).await
    }

    /// Run one reconciliation pass, stopping between repairs once `cancel` fires.
    pub async fn reconcile_with_cancel(&self, cancel: &CancellationToken) -> ReconciliationReport {
        let _pass = self.reconcile_lock.lock().await;
        let started = Instant::now();
        let mut report = ReconciliationReport::default();

        if cancel.is_cancelled() {
            report.cancelled = true;
            return report;
        }

        let inventories = self.list_inventories(&mut report).await;

        let union: BTreeSet<&TokenId> = inventories.iter().flat_map(|(_, ids)| ids.iter()).collect();
        let mut resolved: HashMap<TokenId, Resolved> = HashMap::new();

        'providers: for (target, own) in &inventories {
            let missing: Vec<&TokenId> = union.iter().copied().filter(|id| !own.contains(*id)).collect();
            if missing.is_empty() {
                continue;
            }
            report.missing += missing.len();
            debug!(provider = %target.id(), missing = missing.len(), "Provider has inventory gaps");

            for token_id in missing {
                if cancel.is_cancelled() {
                    report.cancelled = true;
                    break 'providers;
                }

                if !resolved.contains_key(token_id) {
                    let holders: Vec<Arc<dyn Connector>> = inventories
                        .iter()
                        .filter(|(_, ids)| ids.contains(token_id))
                        .map(|(connector, _)| connector.clone())
                        .collect();
                    let winner = self.fetch_winner(token_id, &holders).await;
                    resolved.insert(token_id.clone(), winner);
                }

                match resolved.get(token_id).and_then(|w| w.as_ref()) {
                    Some(winner) => self.repair(target, token_id, winner, &mut report).await,
                    None => report.failures.push(RepairFailure {
                        token_id: token_id.clone(),
                        target: target.id().clone(),
                        error: "no readable copy on any provider".to_string(),
                    }),
                }
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            scanned = report.scanned.len(),
            skipped = report.skipped.len(),
            missing = report.missing,
            repaired = report.repairs.len(),
            failed = report.failures.len(),
            cancelled = report.cancelled,
            duration_ms = report.duration_ms,
            "Reconciliation pass finished"
        );
        report
    }

    /// List every provider's inventory; unreachable providers are skipped.
    async fn list_inventories(
        &self,
        report: &mut ReconciliationReport,
    ) -> Vec<(Arc<dyn Connector>, HashSet<TokenId>)> {
        let connectors: Vec<Arc<dyn Connector>> = self.connectors.iter().cloned().collect();
        let calls = self
            .repair_workers
            .fan_out(&connectors, Operation::ListInventory, |connector| async move {
                connector.list_inventory().await
            })
            .await;

        let mut inventories = Vec::with_capacity(calls.len());
        for (connector, call) in connectors.into_iter().zip(calls) {
            match call.result {
                Ok(ids) => {
                    report.scanned.push(call.provider);
                    inventories.push((connector, ids));
                }
                Err(e) => {
                    warn!(
                        provider = %call.provider,
                        error = %e,
                        "Inventory listing failed, provider skipped for this pass"
                    );
                    report.skipped.push(SkippedProvider {
                        provider: call.provider,
                        reason: e.to_string(),
                    });
                }
            }
        }
        inventories
    }

    /// Read `token_id` from every holder and pick the copy to spread.
    async fn fetch_winner(&self, token_id: &TokenId, holders: &[Arc<dyn Connector>]) -> Resolved {
        let token = Arc::new(token_id.clone());
        let calls = self
            .repair_workers
            .fan_out(holders, Operation::Retrieve, |connector| {
                let token = token.clone();
                async move { connector.retrieve(&token).await }
            })
            .await;

        let versions: Vec<RecordVersion> = calls
            .into_iter()
            .filter_map(|call| match call.result {
                Ok(Some(record)) => Some(RecordVersion::new(call.provider, record)),
                _ => None,
            })
            .collect();

        self.resolver.resolve_and_merge(&versions)
    }

    async fn repair(
        &self,
        target: &Arc<dyn Connector>,
        token_id: &TokenId,
        winner: &RecordVersion,
        report: &mut ReconciliationReport,
    ) {
        let mut tags = Metadata::new();
        tags.insert("repaired_from".to_string(), winner.provider.to_string());
        tags.insert("repaired_at".to_string(), chrono::Utc::now().to_rfc3339());

        let call = self
            .repair_workers
            .call(target.id(), Operation::Store, target.store(&winner.record, &tags))
            .await;

        match call.result {
            Ok(()) => {
                debug!(
                    token = %token_id,
                    source = %winner.provider,
                    target = %call.provider,
                    "Repaired missing token"
                );
                report.repairs.push(RepairAction {
                    token_id: token_id.clone(),
                    source: winner.provider.clone(),
                    target: call.provider,
                });
            }
            Err(e) => report.failures.push(RepairFailure {
                token_id: token_id.clone(),
                target: call.provider,
                error: e.to_string(),
            }),
        }
    }
}

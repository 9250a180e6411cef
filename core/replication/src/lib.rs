//! TokenVault Replication
//!
//! Keeps sealed payment-token records replicated across independent storage
//! providers:
//! - Concurrent fan-out writes with a fixed two-provider quorum
//! - Region-aware reads with failover
//! - Provider health tracking with hysteresis and active probes
//! - Last-writer-wins conflict resolution
//! - Anti-entropy reconciliation and background scheduling

pub mod affinity;
pub mod config;
pub mod conflict;
pub mod coordinator;
pub mod health;
pub mod job;
pub mod scheduler;

// Re-export main types
pub use affinity::{AffinityRule, RegionAffinity};
pub use config::{ProviderSpec, ReplicationConfig};
pub use conflict::{ConflictResolver, RecordVersion};
pub use coordinator::{
    ReconciliationReport, RepairAction, RepairFailure, ReplicationCoordinator, SkippedProvider,
    Statistics,
};
pub use health::{HealthMonitor, OverallHealth, ProviderHealthSnapshot};
pub use job::{
    DeletionResult, JobStatus, ProviderOutcome, ReplicationContext, ReplicationJob, RetrievalResult,
    REPLICATION_QUORUM,
};
pub use scheduler::BackgroundTasks;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_exports() {
        let _config = ReplicationConfig::default();
        let _affinity = RegionAffinity::default();
        let _resolver = ConflictResolver::new(Vec::new());
        assert_eq!(REPLICATION_QUORUM, 2);
    }
}

//! Replication job records, per-provider outcomes and the job history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use tokenvault_common::{Error, Metadata, ProviderId, Result, SealedRecord, TokenId};

/// Number of provider successes a replication needs to count as successful.
///
/// This is a fixed count, not a majority of the configured providers.
pub const REPLICATION_QUORUM: usize = 2;

/// Default number of finished jobs kept for observability.
pub const DEFAULT_JOB_HISTORY_CAPACITY: usize = 100;

/// Lifecycle status of a replication job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    InProgress,
    /// Every provider stored the record.
    Success,
    /// Some, but not all, providers stored the record.
    PartialSuccess,
    /// No provider stored the record.
    Failed,
}

impl JobStatus {
    /// Classify a completed set of outcomes.
    pub fn from_outcomes(outcomes: &[ProviderOutcome]) -> Self {
        let succeeded = outcomes.iter().filter(|o| o.success).count();
        if succeeded == 0 {
            Self::Failed
        } else if succeeded == outcomes.len() {
            Self::Success
        } else {
            Self::PartialSuccess
        }
    }
}

/// Result of one provider call within a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderOutcome {
    pub provider: ProviderId,
    pub success: bool,
    pub duration_ms: u64,
    pub error: Option<String>,
}

impl ProviderOutcome {
    pub fn succeeded(provider: ProviderId, duration: Duration) -> Self {
        Self {
            provider,
            success: true,
            duration_ms: duration.as_millis() as u64,
            error: None,
        }
    }

    pub fn failed(provider: ProviderId, duration: Duration, error: impl ToString) -> Self {
        Self {
            provider,
            success: false,
            duration_ms: duration.as_millis() as u64,
            error: Some(error.to_string()),
        }
    }
}

/// Caller context for a replication request.
///
/// Becomes the provider-side metadata handed to each connector's `store`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplicationContext {
    pub merchant_id: Option<String>,
    #[serde(default)]
    pub attributes: Metadata,
}

impl ReplicationContext {
    pub fn for_merchant(merchant_id: impl Into<String>) -> Self {
        Self {
            merchant_id: Some(merchant_id.into()),
            attributes: Metadata::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Provider-side metadata for `job`.
    pub(crate) fn store_metadata(&self, job: &ReplicationJob) -> Metadata {
        let mut metadata = self.attributes.clone();
        if let Some(merchant_id) = &self.merchant_id {
            metadata.insert("merchant_id".to_string(), merchant_id.clone());
        }
        metadata.insert("job_id".to_string(), job.job_id.to_string());
        metadata.insert("replicated_at".to_string(), job.start_time.to_rfc3339());
        metadata
    }
}

/// One replication of one record across providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationJob {
    pub job_id: Uuid,
    pub token_id: TokenId,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub outcomes: Vec<ProviderOutcome>,
    /// Coarse caller-facing verdict: at least [`REPLICATION_QUORUM`] providers succeeded.
    pub success: bool,
}

impl ReplicationJob {
    /// Open a job for `token_id`.
    pub fn start(token_id: TokenId) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            token_id,
            start_time: Utc::now(),
            end_time: None,
            status: JobStatus::InProgress,
            outcomes: Vec::new(),
            success: false,
        }
    }

    /// Close the job with the complete outcome set.
    ///
    /// Consumes the open job, so a job can only be finalized once.
    pub fn finalize(mut self, outcomes: Vec<ProviderOutcome>) -> Self {
        self.status = JobStatus::from_outcomes(&outcomes);
        self.success = outcomes.iter().filter(|o| o.success).count() >= REPLICATION_QUORUM;
        self.outcomes = outcomes;
        self.end_time = Some(Utc::now());
        self
    }

    pub fn success_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.success).count()
    }

    pub fn failed_providers(&self) -> Vec<&ProviderId> {
        self.outcomes
            .iter()
            .filter(|o| !o.success)
            .map(|o| &o.provider)
            .collect()
    }

    /// Surface a missed quorum as an error.
    ///
    /// # Errors
    /// - `Error::QuorumNotMet` when fewer than [`REPLICATION_QUORUM`] providers succeeded
    pub fn ensure_quorum(&self) -> Result<()> {
        if self.success {
            Ok(())
        } else {
            Err(Error::QuorumNotMet {
                token_id: self.token_id.to_string(),
                succeeded: self.success_count(),
                required: REPLICATION_QUORUM,
            })
        }
    }

    /// Wall time from start to finalization.
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.end_time.map(|end| end - self.start_time)
    }
}

/// Outcome of a cross-provider delete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletionResult {
    pub token_id: TokenId,
    pub success_count: usize,
    pub total_count: usize,
    pub outcomes: Vec<ProviderOutcome>,
}

impl DeletionResult {
    pub(crate) fn from_outcomes(token_id: TokenId, outcomes: Vec<ProviderOutcome>) -> Self {
        Self {
            token_id,
            success_count: outcomes.iter().filter(|o| o.success).count(),
            total_count: outcomes.len(),
            outcomes,
        }
    }

    /// Every provider confirmed the delete.
    pub fn is_fully_deleted(&self) -> bool {
        self.total_count > 0 && self.success_count == self.total_count
    }
}

/// Outcome of a region-aware read.
#[derive(Debug, Clone)]
pub struct RetrievalResult {
    pub found: bool,
    pub record: Option<SealedRecord>,
    pub source_provider: Option<ProviderId>,
    /// Providers tried, the successful one included.
    pub attempt_count: usize,
}

impl RetrievalResult {
    pub(crate) fn found(record: SealedRecord, source: ProviderId, attempt_count: usize) -> Self {
        Self {
            found: true,
            record: Some(record),
            source_provider: Some(source),
            attempt_count,
        }
    }

    pub(crate) fn not_found(attempt_count: usize) -> Self {
        Self {
            found: false,
            record: None,
            source_provider: None,
            attempt_count,
        }
    }
}

/// Bounded history of finished jobs, oldest first.
pub struct JobHistory {
    capacity: usize,
    jobs: Mutex<VecDeque<ReplicationJob>>,
}

impl JobHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            jobs: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Append a job, evicting the oldest when full.
    pub async fn push(&self, job: ReplicationJob) {
        let mut jobs = self.jobs.lock().await;
        if jobs.len() == self.capacity {
            jobs.pop_front();
        }
        jobs.push_back(job);
    }

    /// Retained jobs, oldest first.
    pub async fn recent(&self) -> Vec<ReplicationJob> {
        self.jobs.lock().await.iter().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.jobs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.lock().await.is_empty()
    }
}

impl Default for JobHistory {
    fn default() -> Self {
        Self::new(DEFAULT_JOB_HISTORY_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn outcome(provider: &str, success: bool) -> ProviderOutcome {
        let provider = ProviderId::new(provider).unwrap();
        if success {
            ProviderOutcome::succeeded(provider, Duration::from_millis(5))
        } else {
            ProviderOutcome::failed(provider, Duration::from_millis(5), "boom")
        }
    }

    fn token() -> TokenId {
        TokenId::new("tok_1").unwrap()
    }

    #[test]
    fn test_status_classification() {
        let all = vec![outcome("a", true), outcome("b", true), outcome("c", true)];
        let some = vec![outcome("a", true), outcome("b", false), outcome("c", true)];
        let none = vec![outcome("a", false), outcome("b", false)];

        assert_eq!(JobStatus::from_outcomes(&all), JobStatus::Success);
        assert_eq!(JobStatus::from_outcomes(&some), JobStatus::PartialSuccess);
        assert_eq!(JobStatus::from_outcomes(&none), JobStatus::Failed);
        assert_eq!(JobStatus::from_outcomes(&[]), JobStatus::Failed);
    }

    #[test]
    fn test_quorum_is_fixed_at_two() {
        // A single configured provider can never reach quorum.
        let solo = ReplicationJob::start(token()).finalize(vec![outcome("a", true)]);
        assert_eq!(solo.status, JobStatus::Success);
        assert!(!solo.success);
        assert!(matches!(
            solo.ensure_quorum(),
            Err(Error::QuorumNotMet { succeeded: 1, required: 2, .. })
        ));

        // Two of five is enough.
        let wide = ReplicationJob::start(token()).finalize(vec![
            outcome("a", true),
            outcome("b", true),
            outcome("c", false),
            outcome("d", false),
            outcome("e", false),
        ]);
        assert_eq!(wide.status, JobStatus::PartialSuccess);
        assert!(wide.success);
        assert!(wide.ensure_quorum().is_ok());
        assert_eq!(wide.failed_providers().len(), 3);
    }

    #[test]
    fn test_finalize_sets_end_time() {
        let job = ReplicationJob::start(token());
        assert_eq!(job.status, JobStatus::InProgress);
        assert!(job.end_time.is_none());

        let job = job.finalize(vec![outcome("a", true), outcome("b", true)]);
        assert!(job.end_time.is_some());
        assert!(job.duration().is_some());
    }

    #[test]
    fn test_context_metadata() {
        let job = ReplicationJob::start(token());
        let context = ReplicationContext::for_merchant("m-7").with_attribute("channel", "pos");
        let metadata = context.store_metadata(&job);

        assert_eq!(metadata["merchant_id"], "m-7");
        assert_eq!(metadata["channel"], "pos");
        assert_eq!(metadata["job_id"], job.job_id.to_string());
        assert!(metadata.contains_key("replicated_at"));
    }

    #[test]
    fn test_context_without_merchant_adds_no_tag() {
        let job = ReplicationJob::start(token());
        let metadata = ReplicationContext::default().store_metadata(&job);

        assert!(!metadata.contains_key("merchant_id"));
        assert!(metadata.contains_key("job_id"));
    }

    #[test]
    fn test_deletion_result() {
        let partial = DeletionResult::from_outcomes(
            token(),
            vec![outcome("a", true), outcome("b", false), outcome("c", true)],
        );
        assert_eq!(partial.success_count, 2);
        assert_eq!(partial.total_count, 3);
        assert!(!partial.is_fully_deleted());

        let empty = DeletionResult::from_outcomes(token(), vec![]);
        assert!(!empty.is_fully_deleted());
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let history = JobHistory::new(3);
        let mut ids = Vec::new();
        for _ in 0..5 {
            let job = ReplicationJob::start(token()).finalize(vec![]);
            ids.push(job.job_id);
            history.push(job).await;
        }

        let recent = history.recent().await;
        assert_eq!(recent.len(), 3);
        let kept: Vec<Uuid> = recent.iter().map(|j| j.job_id).collect();
        assert_eq!(kept, ids[2..].to_vec());
    }

    proptest! {
        #[test]
        fn prop_status_and_quorum(flags in proptest::collection::vec(any::<bool>(), 1..8)) {
            let outcomes: Vec<ProviderOutcome> = flags
                .iter()
                .enumerate()
                .map(|(i, ok)| outcome(&format!("p{}", i), *ok))
                .collect();
            let succeeded = flags.iter().filter(|f| **f).count();

            let job = ReplicationJob::start(token()).finalize(outcomes);

            let expected = if succeeded == flags.len() {
                JobStatus::Success
            } else if succeeded == 0 {
                JobStatus::Failed
            } else {
                JobStatus::PartialSuccess
            };
            prop_assert_eq!(job.status, expected);
            prop_assert_eq!(job.success, succeeded >= 2);
        }
    }
}

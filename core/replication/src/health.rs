//! Per-provider health tracking.
//!
//! Availability follows a two-state machine (available / unavailable) fed
//! from two paths:
//!
//! - **Passive**: every real connector call reports its outcome. A run of
//!   `failure_threshold` consecutive failures marks the provider unavailable
//!   immediately. A success resets the failure run but does not, on its own,
//!   make an unavailable provider available again.
//! - **Active**: the periodic probe calls [`Connector::is_healthy`]. A passing
//!   probe restores availability; a failing probe counts toward the
//!   threshold like any other failure.
//!
//! All counters are atomics. Replication jobs for unrelated tokens update the
//! same provider concurrently and must not serialize on a lock.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use tokenvault_common::ProviderId;
use tokenvault_storage::ConnectorSet;

/// Default number of consecutive failures that trips a provider.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Overall system health derived from provider availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OverallHealth {
    /// Every configured provider is available.
    Healthy,
    /// At least two, but not all, providers are available.
    Degraded,
    /// Exactly one provider is available.
    Critical,
    /// No provider is available.
    Down,
}

impl OverallHealth {
    /// Classify `available` out of `total` configured providers.
    pub fn classify(available: usize, total: usize) -> Self {
        if total > 0 && available == total {
            Self::Healthy
        } else if available >= 2 {
            Self::Degraded
        } else if available == 1 {
            Self::Critical
        } else {
            Self::Down
        }
    }
}

/// Live counters for one provider.
struct ProviderHealth {
    available: AtomicBool,
    consecutive_failures: AtomicU32,
    success_count: AtomicU64,
    failure_count: AtomicU64,
    operation_count: AtomicU64,
    cumulative_latency_us: AtomicU64,
    // Unix millis, 0 = never.
    last_success_at: AtomicI64,
    last_failure_at: AtomicI64,
    last_probe_at: AtomicI64,
}

impl ProviderHealth {
    fn new() -> Self {
        Self {
            available: AtomicBool::new(true),
            consecutive_failures: AtomicU32::new(0),
            success_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            operation_count: AtomicU64::new(0),
            cumulative_latency_us: AtomicU64::new(0),
            last_success_at: AtomicI64::new(0),
            last_failure_at: AtomicI64::new(0),
            last_probe_at: AtomicI64::new(0),
        }
    }
}

/// Point-in-time view of one provider's health.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderHealthSnapshot {
    pub provider: ProviderId,
    pub available: bool,
    pub consecutive_failures: u32,
    pub success_count: u64,
    pub failure_count: u64,
    pub operation_count: u64,
    /// Mean latency of recorded operations, 0 when there are none.
    pub average_latency_ms: f64,
    /// Percentage of recorded operations that succeeded, 0 when there are none.
    pub success_rate: f64,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_probe_at: Option<DateTime<Utc>>,
}

/// Tracks availability, latency and success rate for every provider.
pub struct HealthMonitor {
    order: Vec<ProviderId>,
    providers: HashMap<ProviderId, ProviderHealth>,
    failure_threshold: u32,
}

impl HealthMonitor {
    /// Create a monitor for a fixed set of providers, all initially available.
    pub fn new(providers: impl IntoIterator<Item = ProviderId>, failure_threshold: u32) -> Self {
        let order: Vec<ProviderId> = providers.into_iter().collect();
        let providers = order
            .iter()
            .map(|id| (id.clone(), ProviderHealth::new()))
            .collect();

        Self {
            order,
            providers,
            failure_threshold: failure_threshold.max(1),
        }
    }

    fn entry(&self, provider: &ProviderId) -> Option<&ProviderHealth> {
        let entry = self.providers.get(provider);
        if entry.is_none() {
            debug!(%provider, "Health update for unknown provider ignored");
        }
        entry
    }

    /// Record a successful operation.
    ///
    /// Resets the consecutive failure count. Availability is left untouched;
    /// only a passing active probe restores a tripped provider.
    pub fn record_success(&self, provider: &ProviderId, latency: Duration) {
        let Some(health) = self.entry(provider) else {
            return;
        };

        health.consecutive_failures.store(0, Ordering::SeqCst);
        health.success_count.fetch_add(1, Ordering::Relaxed);
        health.operation_count.fetch_add(1, Ordering::Relaxed);
        health
            .cumulative_latency_us
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
        health
            .last_success_at
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Record a failed operation, tripping the provider at the threshold.
    pub fn record_failure(&self, provider: &ProviderId, latency: Duration, error: &str) {
        let Some(health) = self.entry(provider) else {
            return;
        };

        health.failure_count.fetch_add(1, Ordering::Relaxed);
        health.operation_count.fetch_add(1, Ordering::Relaxed);
        health
            .cumulative_latency_us
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
        health
            .last_failure_at
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);

        debug!(%provider, error, "Provider operation failed");
        self.count_failure(provider, health);
    }

    /// Record the result of an active liveness probe.
    pub fn record_probe(&self, provider: &ProviderId, healthy: bool) {
        let Some(health) = self.entry(provider) else {
            return;
        };

        health
            .last_probe_at
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);

        if healthy {
            health.consecutive_failures.store(0, Ordering::SeqCst);
            if !health.available.swap(true, Ordering::SeqCst) {
                info!(%provider, "Provider restored by health probe");
            }
        } else {
            debug!(%provider, "Health probe failed");
            self.count_failure(provider, health);
        }
    }

    fn count_failure(&self, provider: &ProviderId, health: &ProviderHealth) {
        let failures = health.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= self.failure_threshold && health.available.swap(false, Ordering::SeqCst) {
            warn!(
                %provider,
                consecutive_failures = failures,
                "Provider marked unavailable"
            );
        }
    }

    /// Whether `provider` is currently considered available.
    pub fn is_provider_healthy(&self, provider: &ProviderId) -> bool {
        self.providers
            .get(provider)
            .map(|h| h.available.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Available providers, in declared order.
    pub fn available_providers(&self) -> Vec<ProviderId> {
        self.order
            .iter()
            .filter(|id| self.is_provider_healthy(id))
            .cloned()
            .collect()
    }

    /// Overall health across all monitored providers.
    pub fn overall_health(&self) -> OverallHealth {
        OverallHealth::classify(self.available_providers().len(), self.order.len())
    }

    /// Snapshot of one provider.
    pub fn snapshot(&self, provider: &ProviderId) -> Option<ProviderHealthSnapshot> {
        let health = self.providers.get(provider)?;

        let operations = health.operation_count.load(Ordering::Relaxed);
        let successes = health.success_count.load(Ordering::Relaxed);
        let latency_us = health.cumulative_latency_us.load(Ordering::Relaxed);
        let (average_latency_ms, success_rate) = if operations == 0 {
            (0.0, 0.0)
        } else {
            (
                latency_us as f64 / 1000.0 / operations as f64,
                successes as f64 / operations as f64 * 100.0,
            )
        };

        Some(ProviderHealthSnapshot {
            provider: provider.clone(),
            available: health.available.load(Ordering::SeqCst),
            consecutive_failures: health.consecutive_failures.load(Ordering::SeqCst),
            success_count: successes,
            failure_count: health.failure_count.load(Ordering::Relaxed),
            operation_count: operations,
            average_latency_ms,
            success_rate,
            last_success_at: millis_to_datetime(health.last_success_at.load(Ordering::Relaxed)),
            last_failure_at: millis_to_datetime(health.last_failure_at.load(Ordering::Relaxed)),
            last_probe_at: millis_to_datetime(health.last_probe_at.load(Ordering::Relaxed)),
        })
    }

    /// Snapshots of every provider, in declared order.
    pub fn snapshots(&self) -> Vec<ProviderHealthSnapshot> {
        self.order.iter().filter_map(|id| self.snapshot(id)).collect()
    }

    /// Probe every connector concurrently and record the results.
    ///
    /// A probe that panics or does not answer within `deadline` counts as
    /// failed.
    pub async fn probe_all(&self, connectors: &ConnectorSet, deadline: Duration) -> Vec<(ProviderId, bool)> {
        let probes = connectors.iter().map(|connector| async move {
            let probe = AssertUnwindSafe(connector.is_healthy()).catch_unwind();
            let healthy = match tokio::time::timeout(deadline, probe).await {
                Ok(Ok(healthy)) => healthy,
                Ok(Err(_)) => {
                    warn!(provider = %connector.id(), "Health probe panicked");
                    false
                }
                Err(_) => false,
            };
            (connector.id().clone(), healthy)
        });

        let results = join_all(probes).await;
        for (provider, healthy) in &results {
            self.record_probe(provider, *healthy);
        }
        results
    }
}

fn millis_to_datetime(millis: i64) -> Option<DateTime<Utc>> {
    if millis == 0 {
        None
    } else {
        DateTime::from_timestamp_millis(millis)
    }
}

//! Background scheduling - periodic health probes and reconciliation.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tokenvault_common::{Error, Result};

use crate::config::ReplicationConfig;
use crate::coordinator::{ReconciliationReport, ReplicationCoordinator};

type ReconcileReply = oneshot::Sender<ReconciliationReport>;

/// Shortest loop period; shorter requests are raised to it.
const MIN_PERIOD: Duration = Duration::from_millis(1);

/// The probe and reconciliation loops of one coordinator.
///
/// Both loops stop when the shared cancellation token fires. A reconciliation
/// pass in flight at that moment stops between repairs.
pub struct BackgroundTasks {
    cancel: CancellationToken,
    request_tx: mpsc::Sender<ReconcileReply>,
    probe_task: JoinHandle<()>,
    reconcile_task: JoinHandle<()>,
}

impl BackgroundTasks {
    /// Start both loops with the intervals from `config`.
    pub fn spawn(coordinator: Arc<ReplicationCoordinator>, config: &ReplicationConfig) -> Self {
        Self::with_intervals(
            coordinator,
            config.health_probe_interval(),
            config.reconcile_interval(),
        )
    }

    /// Start both loops with explicit periods.
    ///
    /// The first probe and the first pass run one period after start. A zero
    /// period is raised to one millisecond.
    pub fn with_intervals(
        coordinator: Arc<ReplicationCoordinator>,
        probe_every: Duration,
        reconcile_every: Duration,
    ) -> Self {
        let probe_every = probe_every.max(MIN_PERIOD);
        let reconcile_every = reconcile_every.max(MIN_PERIOD);
        let cancel = CancellationToken::new();
        let (request_tx, request_rx) = mpsc::channel(16);

        let probe_task = tokio::spawn(probe_loop(
            coordinator.clone(),
            probe_every,
            cancel.clone(),
        ));
        let reconcile_task = tokio::spawn(reconcile_loop(
            coordinator,
            reconcile_every,
            request_rx,
            cancel.clone(),
        ));

        info!(
            probe_every_ms = probe_every.as_millis() as u64,
            reconcile_every_ms = reconcile_every.as_millis() as u64,
            "Background tasks started"
        );

        Self {
            cancel,
            request_tx,
            probe_task,
            reconcile_task,
        }
    }

    /// Run a reconciliation pass now and wait for its report.
    ///
    /// The pass runs on the reconciliation loop, so it never overlaps a
    /// periodic pass.
    pub async fn request_reconcile(&self) -> Result<ReconciliationReport> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.request_tx
            .send(reply_tx)
            .await
            .map_err(|_| Error::Cancelled)?;
        reply_rx.await.map_err(|_| Error::Cancelled)
    }

    /// Token that stops both loops when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop both loops and wait for them to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for (name, task) in [("probe", self.probe_task), ("reconcile", self.reconcile_task)] {
            if let Err(e) = task.await {
                warn!(task = name, error = %e, "Background task ended abnormally");
            }
        }
        info!("Background tasks stopped");
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn probe_loop(
    coordinator: Arc<ReplicationCoordinator>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = ticker(period);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let results = coordinator.probe_health().await;
                let unhealthy: Vec<_> = results
                    .iter()
                    .filter(|(_, healthy)| !healthy)
                    .map(|(provider, _)| provider.as_str())
                    .collect();
                if unhealthy.is_empty() {
                    debug!(providers = results.len(), "All providers answered the probe");
                } else {
                    warn!(?unhealthy, "Providers failed the health probe");
                }
            }
        }
    }

    debug!("Probe loop exited");
}

async fn reconcile_loop(
    coordinator: Arc<ReplicationCoordinator>,
    period: Duration,
    mut requests: mpsc::Receiver<ReconcileReply>,
    cancel: CancellationToken,
) {
    let mut ticker = ticker(period);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(reply) = requests.recv() => {
                debug!("Processing on-demand reconciliation");
                let report = coordinator.reconcile_with_cancel(&cancel).await;
                let _ = reply.send(report);
            }
            _ = ticker.tick() => {
                debug!("Triggering periodic reconciliation");
                let report = coordinator.reconcile_with_cancel(&cancel).await;
                if !report.is_complete() {
                    warn!(
                        skipped = report.skipped.len(),
                        failed = report.failures.len(),
                        cancelled = report.cancelled,
                        "Periodic reconciliation left gaps"
                    );
                }
            }
        }
    }

    debug!("Reconcile loop exited");
}

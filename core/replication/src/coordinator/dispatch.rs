//! Bounded, deadline-enforced provider calls.
//!
//! Every call runs under a permit of its dispatcher's pool, is cut off at the
//! operation deadline and reports its outcome to the [`HealthMonitor`].
//! Fan-out spawns one task per connector and waits for all of them; a
//! failing or panicking task becomes a failed result, never an abort of its
//! siblings. Inline calls catch a connector panic the same way.

use futures::future::join_all;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

use tokenvault_common::{Error, ProviderId, Result};
use tokenvault_storage::{Connector, Operation};

use crate::health::HealthMonitor;
use crate::job::ProviderOutcome;

/// Result of one provider call.
pub(crate) struct CallResult<T> {
    pub provider: ProviderId,
    pub elapsed: Duration,
    pub result: Result<T>,
}

impl<T> CallResult<T> {
    pub fn outcome(&self) -> ProviderOutcome {
        match &self.result {
            Ok(_) => ProviderOutcome::succeeded(self.provider.clone(), self.elapsed),
            Err(e) => ProviderOutcome::failed(self.provider.clone(), self.elapsed, e),
        }
    }
}

#[derive(Clone)]
pub(crate) struct Dispatcher {
    pool: Arc<Semaphore>,
    health: Arc<HealthMonitor>,
    deadline: Duration,
}

impl Dispatcher {
    pub fn new(pool_size: usize, health: Arc<HealthMonitor>, deadline: Duration) -> Self {
        Self {
            pool: Arc::new(Semaphore::new(pool_size.max(1))),
            health,
            deadline,
        }
    }

    /// Run one call inline on the current task.
    ///
    /// A panic inside `fut` becomes a failed result.
    pub async fn call<T, Fut>(
        &self,
        provider: &ProviderId,
        operation: Operation,
        fut: Fut,
    ) -> CallResult<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let result = match self.pool.acquire().await {
            Ok(_permit) => {
                let guarded = AssertUnwindSafe(fut).catch_unwind().map(|caught| {
                    caught.unwrap_or_else(|panic| {
                        Err(Error::connector(
                            provider.as_str(),
                            operation.as_str(),
                            format!("connector panicked: {}", panic_message(panic.as_ref())),
                        ))
                    })
                });
                timed(provider, operation, self.deadline, guarded).await
            }
            Err(_) => (Duration::ZERO, Err(Error::Cancelled)),
        };
        self.finish(provider.clone(), operation, result)
    }

    /// Run `task` against every connector concurrently and wait for all.
    ///
    /// Results come back in the order of `connectors`, not completion order.
    pub async fn fan_out<T, F, Fut>(
        &self,
        connectors: &[Arc<dyn Connector>],
        operation: Operation,
        task: F,
    ) -> Vec<CallResult<T>>
    where
        F: Fn(Arc<dyn Connector>) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let handles: Vec<_> = connectors
            .iter()
            .map(|connector| {
                let provider = connector.id().clone();
                let pool = self.pool.clone();
                let deadline = self.deadline;
                let fut = task(connector.clone());
                let task_provider = provider.clone();
                let handle = tokio::spawn(async move {
                    match pool.acquire_owned().await {
                        Ok(_permit) => timed(&task_provider, operation, deadline, fut).await,
                        Err(_) => (Duration::ZERO, Err(Error::Cancelled)),
                    }
                });
                (provider, handle)
            })
            .collect();

        let (providers, handles): (Vec<_>, Vec<_>) = handles.into_iter().unzip();
        let joined = join_all(handles).await;

        providers
            .into_iter()
            .zip(joined)
            .map(|(provider, joined)| {
                let result = joined.unwrap_or_else(|e| {
                    (
                        Duration::ZERO,
                        Err(Error::connector(
                            provider.as_str(),
                            operation.as_str(),
                            format!("task aborted: {}", e),
                        )),
                    )
                });
                self.finish(provider, operation, result)
            })
            .collect()
    }

    fn finish<T>(
        &self,
        provider: ProviderId,
        operation: Operation,
        (elapsed, result): (Duration, Result<T>),
    ) -> CallResult<T> {
        match &result {
            Ok(_) => self.health.record_success(&provider, elapsed),
            Err(Error::Cancelled) => {}
            Err(e) => {
                tracing::warn!(%provider, %operation, error = %e, "Provider call failed");
                self.health.record_failure(&provider, elapsed, &e.to_string());
            }
        }
        CallResult {
            provider,
            elapsed,
            result,
        }
    }
}

/// Text of a caught panic payload.
fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

async fn timed<T>(
    provider: &ProviderId,
    operation: Operation,
    deadline: Duration,
    fut: impl Future<Output = Result<T>>,
) -> (Duration, Result<T>) {
    let started = Instant::now();
    let result = match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout {
            provider: provider.to_string(),
            operation: operation.to_string(),
            after_ms: deadline.as_millis() as u64,
        }),
    };
    (started.elapsed(), result)
}

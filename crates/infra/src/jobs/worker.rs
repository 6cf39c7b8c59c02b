//! Queue consumer: receives deliveries, dispatches them, settles them.
//!
//! ## Guarantees
//!
//! - The registry is fully built before the first receive
//! - A failing job never affects any other job
//! - Only broker transport failures stop the loop
//! - At most `concurrency` jobs are in flight at once

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{oneshot, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use jobrelay_broker::{Broker, Delivery, NackOutcome, Subscription};
use jobrelay_core::{DispatchError, RegistrationError, TransportError};

use super::dispatcher::{DispatchOutcome, Dispatcher};
use super::registry::RegistryLoader;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Consumer identity within the broker's consumer group
    pub consumer_name: String,
    /// Maximum jobs executing at once
    pub concurrency: usize,
    /// How long a single receive waits before the loop re-checks shutdown
    pub receive_wait: Duration,
    /// Refuse to start when any handler definition was rejected
    pub fail_on_registration_error: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            consumer_name: format!("worker-{}", uuid::Uuid::now_v7()),
            concurrency: 1,
            receive_wait: Duration::from_millis(1000),
            fail_on_registration_error: false,
        }
    }
}

impl WorkerConfig {
    pub fn with_consumer_name(mut self, name: impl Into<String>) -> Self {
        self.consumer_name = name.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_receive_wait(mut self, wait: Duration) -> Self {
        self.receive_wait = wait;
        self
    }

    pub fn fail_on_registration_error(mut self, fail: bool) -> Self {
        self.fail_on_registration_error = fail;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("no job handlers registered ({candidates} candidates, {failed} rejected)")]
    EmptyRegistry { candidates: usize, failed: usize },

    #[error("{} handler definition(s) rejected", .0.len())]
    RegistrationFailed(Vec<RegistrationError>),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("worker task ended abnormally: {0}")]
    Aborted(String),
}

/// Running totals, updated as deliveries settle.
#[derive(Debug, Default)]
pub struct WorkerStats {
    received: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    unknown_job: AtomicU64,
}

/// Point-in-time copy of [`WorkerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStatsSnapshot {
    pub received: u64,
    pub completed: u64,
    pub failed: u64,
    /// Subset of `failed` whose name had no handler
    pub unknown_job: u64,
}

impl WorkerStats {
    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            unknown_job: self.unknown_job.load(Ordering::Relaxed),
        }
    }
}

/// A started worker bound to one broker subscription.
pub struct Worker {
    subscription: Arc<dyn Subscription>,
    dispatcher: Dispatcher,
    config: WorkerConfig,
    stats: Arc<WorkerStats>,
}

impl core::fmt::Debug for Worker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Worker")
            .field("config", &self.config)
            .field("registry", self.dispatcher.registry())
            .finish_non_exhaustive()
    }
}

impl Worker {
    /// Build the handler registry, then subscribe.
    ///
    /// Fails without subscribing when no handler could be registered, or when
    /// any definition was rejected and `fail_on_registration_error` is set.
    pub async fn start(
        broker: &dyn Broker,
        loader: &RegistryLoader,
        config: WorkerConfig,
    ) -> Result<Self, WorkerError> {
        let build = loader.build();

        if build.registry.is_empty() {
            return Err(WorkerError::EmptyRegistry {
                candidates: build.candidates,
                failed: build.failures.len(),
            });
        }
        if config.fail_on_registration_error && !build.is_complete() {
            return Err(WorkerError::RegistrationFailed(build.failures.clone()));
        }

        let subscription = broker.subscribe(&config.consumer_name).await?;

        info!(
            consumer = %config.consumer_name,
            concurrency = config.concurrency,
            handlers = ?build.registry.names(),
            "worker subscribed"
        );

        Ok(Self {
            subscription,
            dispatcher: Dispatcher::new(Arc::clone(&build.registry)),
            config,
            stats: Arc::new(WorkerStats::default()),
        })
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn stats(&self) -> WorkerStatsSnapshot {
        self.stats.snapshot()
    }

    /// Dispatch one delivery and report its outcome to the broker.
    ///
    /// Only a failure to ack/nack is returned as an error. A job whose name
    /// has no handler is dead-lettered at once: no redelivery to this
    /// registry can succeed. Counters move only once the broker accepted the
    /// settlement.
    pub async fn process(&self, delivery: Delivery) -> Result<DispatchOutcome, TransportError> {
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        let job = &delivery.job;

        let outcome = self.dispatcher.dispatch(job).await;

        match &outcome {
            DispatchOutcome::Completed => {
                self.subscription.ack(&delivery).await?;
                self.stats.completed.fetch_add(1, Ordering::Relaxed);
                info!(job_id = %job.id, job = %job.name, attempt = job.attempts, "job completed");
            }
            DispatchOutcome::Failed(err) => {
                let reason = err.to_string();
                let unknown = matches!(err, DispatchError::UnknownJob(_));

                let settled = if unknown {
                    self.subscription.fail(&delivery, &reason).await?
                } else {
                    self.subscription.nack(&delivery, &reason).await?
                };

                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                if unknown {
                    self.stats.unknown_job.fetch_add(1, Ordering::Relaxed);
                }

                match settled {
                    NackOutcome::Retrying {
                        next_attempt,
                        delay,
                    } => warn!(
                        job_id = %job.id,
                        job = %job.name,
                        attempt = job.attempts,
                        next_attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %reason,
                        "job failed; retry scheduled"
                    ),
                    NackOutcome::DeadLettered => warn!(
                        job_id = %job.id,
                        job = %job.name,
                        attempt = job.attempts,
                        error = %reason,
                        "job failed"
                    ),
                    NackOutcome::Stale => debug!(
                        job_id = %job.id,
                        receipt = %delivery.receipt,
                        error = %reason,
                        "job failed on a delivery that was already settled"
                    ),
                }
            }
        }

        Ok(outcome)
    }

    /// Receive and dispatch until `shutdown` resolves or the broker fails.
    ///
    /// On shutdown, in-flight jobs are allowed to finish and settle. On a
    /// transport failure they are aborted; the broker redelivers them.
    pub async fn run<F>(self: Arc<Self>, shutdown: F) -> Result<(), WorkerError>
    where
        F: Future<Output = ()> + Send,
    {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut tasks: JoinSet<Result<(), TransportError>> = JoinSet::new();
        tokio::pin!(shutdown);

        info!(consumer = %self.config.consumer_name, "worker started");

        let result: Result<(), TransportError> = loop {
            let permit = tokio::select! {
                biased;
                _ = &mut shutdown => break Ok(()),
                Some(joined) = tasks.join_next() => match settle(joined) {
                    Ok(()) => continue,
                    Err(e) => break Err(e),
                },
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break Ok(()),
                },
            };

            let received = tokio::select! {
                biased;
                _ = &mut shutdown => break Ok(()),
                received = self.subscription.receive(self.config.receive_wait) => received,
            };

            match received {
                Ok(Some(delivery)) => {
                    debug!(job_id = %delivery.job.id, receipt = %delivery.receipt, "delivery received");
                    let worker = Arc::clone(&self);
                    tasks.spawn(async move {
                        let _permit = permit;
                        worker.process(delivery).await.map(|_| ())
                    });
                }
                Ok(None) => {}
                Err(e) => break Err(e),
            }
        };

        match result {
            Ok(()) => {
                info!(in_flight = tasks.len(), "worker draining");
                while let Some(joined) = tasks.join_next().await {
                    if let Err(e) = settle(joined) {
                        warn!(error = %e, "failed to settle job during shutdown");
                    }
                }
                info!(consumer = %self.config.consumer_name, stats = ?self.stats(), "worker stopped");
                Ok(())
            }
            Err(e) => {
                error!(consumer = %self.config.consumer_name, error = %e, "broker transport failed; worker stopping");
                tasks.abort_all();
                while tasks.join_next().await.is_some() {}
                Err(WorkerError::Transport(e))
            }
        }
    }

    /// Run on a background task until the returned handle is shut down.
    ///
    /// Dropping the handle also stops the worker.
    pub fn spawn(self: Arc<Self>) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let stats = Arc::clone(&self.stats);

        let join = tokio::spawn(self.run(async move {
            let _ = shutdown_rx.await;
        }));

        WorkerHandle {
            shutdown: Some(shutdown_tx),
            join,
            stats,
        }
    }
}

fn settle(joined: Result<Result<(), TransportError>, JoinError>) -> Result<(), TransportError> {
    match joined {
        Ok(result) => result,
        Err(e) => {
            // Handler panics are contained by the dispatcher; this is the loop's own task.
            error!(error = %e, "job task ended abnormally");
            Ok(())
        }
    }
}

/// Handle to control and join a spawned worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: Option<oneshot::Sender<()>>,
    join: JoinHandle<Result<(), WorkerError>>,
    stats: Arc<WorkerStats>,
}

impl WorkerHandle {
    pub fn stats(&self) -> WorkerStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Request graceful shutdown and wait for in-flight jobs to settle.
    pub async fn shutdown(mut self) -> Result<(), WorkerError> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        join(self.join).await
    }

    /// Wait for the worker to stop on its own (a transport failure).
    pub async fn wait(mut self) -> Result<(), WorkerError> {
        let _keep_running = self.shutdown.take();
        join(self.join).await
    }
}

async fn join(handle: JoinHandle<Result<(), WorkerError>>) -> Result<(), WorkerError> {
    handle
        .await
        .unwrap_or_else(|e| Err(WorkerError::Aborted(e.to_string())))
}

//! Process-wide composition root for the worker.
//!
//! Owns the broker handle, the registry loader and the worker slot. Every
//! caller of [`WorkerRuntime::worker`] shares one started worker, so a
//! process never opens more than one subscription.

use std::sync::Arc;

use tokio::sync::OnceCell;

use jobrelay_broker::Broker;
use jobrelay_core::RetryPolicy;

use super::registry::RegistryLoader;
use super::worker::{Worker, WorkerConfig, WorkerError};
use crate::queue::QueueClient;

pub struct WorkerRuntime {
    broker: Arc<dyn Broker>,
    loader: RegistryLoader,
    config: WorkerConfig,
    worker: OnceCell<Arc<Worker>>,
}

impl WorkerRuntime {
    pub fn new(broker: Arc<dyn Broker>, loader: RegistryLoader, config: WorkerConfig) -> Self {
        Self {
            broker,
            loader,
            config,
            worker: OnceCell::new(),
        }
    }

    /// The process's worker, started on first use.
    ///
    /// Concurrent first calls start it once; a failed start leaves the slot
    /// empty so a later call can retry.
    pub async fn worker(&self) -> Result<Arc<Worker>, WorkerError> {
        self.worker
            .get_or_try_init(|| async {
                let worker =
                    Worker::start(self.broker.as_ref(), &self.loader, self.config.clone()).await?;
                Ok::<_, WorkerError>(Arc::new(worker))
            })
            .await
            .map(Arc::clone)
    }

    pub fn is_started(&self) -> bool {
        self.worker.initialized()
    }

    /// Producer bound to the same broker.
    pub fn queue(&self) -> QueueClient {
        QueueClient::new(Arc::clone(&self.broker))
    }

    pub fn queue_with_retry(&self, retry: RetryPolicy) -> QueueClient {
        QueueClient::new(Arc::clone(&self.broker)).with_default_retry(retry)
    }

    pub fn loader(&self) -> &RegistryLoader {
        &self.loader
    }
}

impl core::fmt::Debug for WorkerRuntime {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WorkerRuntime")
            .field("config", &self.config)
            .field("started", &self.is_started())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use jobrelay_broker::InMemoryBroker;
    use jobrelay_core::JobState;

    use super::*;
    use crate::jobs::handlers::{self, HandlerDeps};
    use crate::jobs::registry::HandlerCatalog;

    fn runtime(broker: Arc<InMemoryBroker>, catalog: HandlerCatalog) -> Arc<WorkerRuntime> {
        Arc::new(WorkerRuntime::new(
            broker,
            RegistryLoader::new(catalog),
            WorkerConfig::default().with_receive_wait(Duration::from_millis(20)),
        ))
    }

    #[tokio::test]
    async fn repeated_calls_share_one_worker() {
        let broker = InMemoryBroker::arc();
        let runtime = runtime(broker.clone(), handlers::catalog(&HandlerDeps::default()));

        let first = runtime.worker().await.unwrap();
        let second = runtime.worker().await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(broker.subscription_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_calls_share_one_worker() {
        let broker = InMemoryBroker::arc();
        let runtime = runtime(broker.clone(), handlers::catalog(&HandlerDeps::default()));

        let calls: Vec<_> = (0..8)
            .map(|_| {
                let runtime = Arc::clone(&runtime);
                tokio::spawn(async move { runtime.worker().await.unwrap() })
            })
            .collect();

        let mut workers = Vec::new();
        for call in calls {
            workers.push(call.await.unwrap());
        }

        assert!(workers.iter().all(|w| Arc::ptr_eq(w, &workers[0])));
        assert_eq!(broker.subscription_count(), 1);
        assert!(runtime.loader().is_built());
    }

    #[tokio::test]
    async fn failed_start_is_not_cached() {
        let broker = InMemoryBroker::arc();
        let runtime = runtime(broker.clone(), HandlerCatalog::new());

        assert!(matches!(
            runtime.worker().await,
            Err(WorkerError::EmptyRegistry { candidates: 0, .. })
        ));
        assert!(!runtime.is_started());
        assert_eq!(broker.subscription_count(), 0);
    }

    #[tokio::test]
    async fn queue_and_worker_share_the_broker() {
        let broker = InMemoryBroker::arc();
        let runtime = runtime(broker.clone(), handlers::catalog(&HandlerDeps::default()));

        let handle = runtime.worker().await.unwrap().spawn();
        let id = runtime
            .queue()
            .enqueue("generatePDF", &json!({"hello": "world"}))
            .await
            .unwrap();

        let record = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let status = runtime.queue().status(id).await.unwrap();
                if let Some(record) = status.filter(|r| r.state.is_terminal()) {
                    return record;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(record.state, JobState::Completed);
        handle.shutdown().await.unwrap();
    }
}

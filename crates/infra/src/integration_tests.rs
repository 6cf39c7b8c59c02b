//! Integration tests for the full job pipeline.
//!
//! Tests: QueueClient → Broker → Worker → Dispatcher → Handler
//!
//! Verifies:
//! - Every enqueued job with a registered name runs exactly once
//! - Unknown names never invoke a handler and end up dead-lettered
//! - Unacknowledged work is redelivered

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use proptest::prelude::*;
    use serde_json::{json, Value};

    use jobrelay_broker::{Broker, InMemoryBroker, Subscription};
    use jobrelay_core::{JobHandler, JobId, JobState};

    use crate::jobs::{HandlerCatalog, HandlerDefinition, RegistryLoader, Worker, WorkerConfig};
    use crate::queue::QueueClient;

    type Calls = Arc<Mutex<HashMap<String, Vec<Value>>>>;

    struct Counting {
        name: String,
        calls: Calls,
    }

    #[async_trait]
    impl JobHandler for Counting {
        fn name(&self) -> &str {
            &self.name
        }

        async fn execute(&self, payload: Value) -> anyhow::Result<()> {
            self.calls
                .lock()
                .unwrap()
                .entry(self.name.clone())
                .or_default()
                .push(payload);
            Ok(())
        }
    }

    fn loader(names: &[&str], calls: &Calls) -> RegistryLoader {
        let mut catalog = HandlerCatalog::new();
        for name in names {
            let name = name.to_string();
            let calls = Arc::clone(calls);
            catalog.push(HandlerDefinition::new(name.clone(), move || {
                Ok(Arc::new(Counting {
                    name: name.clone(),
                    calls: Arc::clone(&calls),
                }) as Arc<dyn JobHandler>)
            }));
        }
        RegistryLoader::new(catalog)
    }

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    /// Drain the queue through `worker`, using `reader` to pull deliveries.
    async fn drain(worker: &Worker, reader: &dyn Subscription) {
        while let Some(delivery) = reader.receive(Duration::ZERO).await.unwrap() {
            worker.process(delivery).await.unwrap();
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            ..ProptestConfig::default()
        })]

        /// Property: each enqueued job whose name is registered is executed
        /// exactly once with its payload; unknown names are never executed.
        #[test]
        fn enqueued_jobs_execute_exactly_once(
            jobs in prop::collection::vec((prop::sample::select(vec!["render", "email", "missing"]), any::<i64>()), 1..40)
        ) {
            let rt = runtime();
            let calls: Calls = Arc::default();

            let (ids, records) = rt.block_on(async {
                let broker = InMemoryBroker::arc();
                let loader = loader(&["render", "email"], &calls);
                let worker = Worker::start(broker.as_ref(), &loader, WorkerConfig::default()).await.unwrap();
                let reader = broker.subscribe("reader").await.unwrap();
                let queue = QueueClient::new(broker.clone());

                let mut ids: Vec<JobId> = Vec::new();
                for (name, n) in &jobs {
                    ids.push(queue.enqueue(name, &json!({"n": n})).await.unwrap());
                }

                drain(&worker, reader.as_ref()).await;

                let mut records = Vec::new();
                for id in &ids {
                    records.push(queue.status(*id).await.unwrap().unwrap());
                }
                (ids, records)
            });

            prop_assert_eq!(ids.len(), jobs.len());

            let calls = calls.lock().unwrap();
            for known in ["render", "email"] {
                let expected: Vec<Value> = jobs
                    .iter()
                    .filter(|(name, _)| *name == known)
                    .map(|(_, n)| json!({"n": n}))
                    .collect();
                let seen = calls.get(known).cloned().unwrap_or_default();
                prop_assert_eq!(seen, expected);
            }
            prop_assert!(!calls.contains_key("missing"));

            for ((name, _), record) in jobs.iter().zip(&records) {
                let expected = if *name == "missing" { JobState::Failed } else { JobState::Completed };
                prop_assert_eq!(record.state, expected);
                prop_assert_eq!(record.attempts, 1);
            }
        }
    }

    #[tokio::test]
    async fn unacknowledged_delivery_is_redelivered() {
        let calls: Calls = Arc::default();
        let broker = InMemoryBroker::arc();
        let loader = loader(&["render"], &calls);
        let worker = Worker::start(broker.as_ref(), &loader, WorkerConfig::default())
            .await
            .unwrap();
        let reader = broker.subscribe("reader").await.unwrap();

        let id = QueueClient::new(broker.clone())
            .enqueue("render", &json!({"page": 1}))
            .await
            .unwrap();

        // A consumer takes the job and dies before acknowledging.
        let lost = reader.receive(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(lost.job.id, id);
        broker.redeliver_in_flight();

        drain(&worker, reader.as_ref()).await;

        let record = broker.job_record(id).await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Completed);
        assert_eq!(record.attempts, 2);
        assert_eq!(calls.lock().unwrap()["render"], vec![json!({"page": 1})]);
    }

    #[tokio::test]
    async fn unknown_job_is_dead_lettered_with_reason() {
        let calls: Calls = Arc::default();
        let broker = InMemoryBroker::arc();
        let loader = loader(&["render"], &calls);
        let worker = Worker::start(broker.as_ref(), &loader, WorkerConfig::default())
            .await
            .unwrap();
        let reader = broker.subscribe("reader").await.unwrap();

        QueueClient::new(broker.clone())
            .enqueue("doesNotExist", &json!({}))
            .await
            .unwrap();
        drain(&worker, reader.as_ref()).await;

        let dead = broker.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].job.name, "doesNotExist");
        assert_eq!(dead[0].reason, "no handler registered for job `doesNotExist`");
        assert!(calls.lock().unwrap().is_empty());
    }
}

//! Producer side: submit jobs by name to the durable queue.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, instrument};

use jobrelay_broker::Broker;
use jobrelay_core::{Job, JobId, JobRecord, RetryPolicy, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("job name must not be empty")]
    EmptyName,

    #[error("payload for job `{name}` is not serializable: {source}")]
    Payload {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Cheap to clone; every clone shares the broker connection.
///
/// The client does not check that a handler exists for the name: an unknown
/// name is accepted here and fails at dispatch.
#[derive(Clone)]
pub struct QueueClient {
    broker: Arc<dyn Broker>,
    default_retry: RetryPolicy,
}

impl QueueClient {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            default_retry: RetryPolicy::default(),
        }
    }

    pub fn with_default_retry(mut self, retry: RetryPolicy) -> Self {
        self.default_retry = retry;
        self
    }

    /// Enqueue `name` with `payload` under the client's default retry policy.
    ///
    /// Returns once the broker has durably accepted the job.
    pub async fn enqueue<P>(&self, name: &str, payload: &P) -> Result<JobId, QueueError>
    where
        P: Serialize + ?Sized,
    {
        self.enqueue_with(name, payload, self.default_retry.clone())
            .await
    }

    #[instrument(skip(self, payload, retry), fields(job_name = %name))]
    pub async fn enqueue_with<P>(
        &self,
        name: &str,
        payload: &P,
        retry: RetryPolicy,
    ) -> Result<JobId, QueueError>
    where
        P: Serialize + ?Sized,
    {
        if name.trim().is_empty() {
            return Err(QueueError::EmptyName);
        }

        let payload = serde_json::to_value(payload).map_err(|source| QueueError::Payload {
            name: name.to_string(),
            source,
        })?;

        let job = Job::new(name, payload).with_retry(retry);
        let id = self.broker.enqueue(job).await?;

        debug!(job_id = %id, "job enqueued");
        Ok(id)
    }

    /// Tracking record for a previously enqueued job, if the broker still has it.
    pub async fn status(&self, id: JobId) -> Result<Option<JobRecord>, QueueError> {
        Ok(self.broker.job_record(id).await?)
    }
}

impl core::fmt::Debug for QueueClient {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("QueueClient")
            .field("default_retry", &self.default_retry)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use serde::ser::Error as _;
    use serde_json::json;

    use jobrelay_broker::{InMemoryBroker, Subscription};
    use jobrelay_core::JobState;

    use super::*;

    #[tokio::test]
    async fn enqueue_records_job_as_queued() {
        let broker = InMemoryBroker::arc();
        let queue = QueueClient::new(broker.clone());

        let id = queue
            .enqueue("generatePDF", &json!({"hello": "world"}))
            .await
            .unwrap();

        let record = queue.status(id).await.unwrap().unwrap();
        assert_eq!(record.id, id);
        assert_eq!(record.name, "generatePDF");
        assert_eq!(record.state, JobState::Queued);
        assert_eq!(record.attempts, 0);
        assert_eq!(broker.queued_len(), 1);
    }

    #[tokio::test]
    async fn unknown_names_are_accepted() {
        let queue = QueueClient::new(InMemoryBroker::arc());
        assert!(queue.enqueue("doesNotExist", &json!({})).await.is_ok());
    }

    #[tokio::test]
    async fn ids_are_distinct() {
        let queue = QueueClient::new(InMemoryBroker::arc());

        let a = queue.enqueue("a", &json!(null)).await.unwrap();
        let b = queue.enqueue("a", &json!(null)).await.unwrap();

        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn typed_payloads_are_serialized() {
        #[derive(Serialize)]
        struct Invoice {
            number: u32,
            lines: BTreeMap<String, f64>,
        }

        let broker = InMemoryBroker::arc();
        let queue = QueueClient::new(broker.clone());
        queue
            .enqueue(
                "render",
                &Invoice {
                    number: 7,
                    lines: BTreeMap::from([("widget".to_string(), 2.5)]),
                },
            )
            .await
            .unwrap();

        let sub = broker.subscribe("t").await.unwrap();
        let delivery = sub.receive(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(delivery.job.payload, json!({"number": 7, "lines": {"widget": 2.5}}));
    }

    #[tokio::test]
    async fn default_retry_is_applied() {
        let broker = InMemoryBroker::arc();
        let retry = RetryPolicy::fixed(5, Duration::from_secs(1));
        let queue = QueueClient::new(broker.clone()).with_default_retry(retry.clone());

        queue.enqueue("a", &json!({})).await.unwrap();

        let sub = broker.subscribe("t").await.unwrap();
        let delivery = sub.receive(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(delivery.job.retry, retry);
    }

    #[tokio::test]
    async fn rejects_empty_name() {
        let broker = InMemoryBroker::arc();
        let queue = QueueClient::new(broker.clone());

        let err = queue.enqueue("  ", &json!({})).await.unwrap_err();

        assert!(matches!(err, QueueError::EmptyName));
        assert_eq!(broker.queued_len(), 0);
    }

    #[tokio::test]
    async fn rejects_unserializable_payload() {
        struct Opaque;

        impl Serialize for Opaque {
            fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
                Err(S::Error::custom("opaque handle"))
            }
        }

        let queue = QueueClient::new(InMemoryBroker::arc());
        let err = queue.enqueue("a", &Opaque).await.unwrap_err();

        assert!(matches!(err, QueueError::Payload { ref name, .. } if name == "a"));
    }

    #[tokio::test]
    async fn broker_outage_is_a_transport_error() {
        let broker = InMemoryBroker::arc();
        let queue = QueueClient::new(broker.clone());
        broker.disconnect();

        let err = queue.enqueue("a", &json!({})).await.unwrap_err();

        assert!(matches!(
            err,
            QueueError::Transport(TransportError::Connection(_))
        ));
    }
}

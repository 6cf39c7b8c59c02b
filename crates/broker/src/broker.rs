//! Broker and subscription traits (mechanics only).
//!
//! A broker is a durable queue with **at-least-once delivery**:
//!
//! - A job accepted by `enqueue` survives a worker crash
//! - A delivery that is neither acked nor nacked may be delivered again
//! - Consumers must therefore tolerate duplicates
//!
//! ```text
//! QueueClient ── enqueue ──► Broker ── receive ──► Worker
//!                              ▲                     │
//!                              └──── ack / nack ─────┘
//! ```
//!
//! Redelivery after a failed attempt (backoff, dead-lettering) is a broker
//! concern driven by the job's `RetryPolicy`; handlers never see it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use jobrelay_core::{Job, JobId, JobRecord, TransportError};

/// A job handed to a consumer, plus the receipt needed to settle it.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// The job; `attempts` includes this delivery.
    pub job: Job,
    /// Broker-specific handle (stream entry id, in-memory sequence, ...).
    pub receipt: String,
}

/// What the broker did with a nacked delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    /// The job will be delivered again after `delay`.
    Retrying { next_attempt: u32, delay: Duration },
    /// The job exhausted its attempts, or failed permanently, and was dead-lettered.
    DeadLettered,
    /// The receipt no longer names an unsettled delivery (already settled or
    /// redelivered under a new receipt). Nothing changed.
    Stale,
}

/// Producer side of the durable queue.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Durably accept a job. Returns once the broker has acknowledged the write.
    async fn enqueue(&self, job: Job) -> Result<JobId, TransportError>;

    /// Open a consumer subscription.
    async fn subscribe(&self, consumer: &str) -> Result<Arc<dyn Subscription>, TransportError>;

    /// Look up the tracking record of a job.
    async fn job_record(&self, id: JobId) -> Result<Option<JobRecord>, TransportError>;
}

/// Consumer side of the durable queue.
///
/// Shared by every dispatch task of a worker: `receive` is driven by the
/// worker loop, `ack`/`nack` by the tasks.
#[async_trait]
pub trait Subscription: Send + Sync {
    /// Wait up to `wait` for the next delivery. `Ok(None)` means nothing arrived.
    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>, TransportError>;

    /// Report the delivery completed. A receipt that is no longer pending is ignored.
    async fn ack(&self, delivery: &Delivery) -> Result<(), TransportError>;

    /// Report the delivery failed. The job's `RetryPolicy` decides between
    /// redelivery and the dead-letter queue.
    async fn nack(&self, delivery: &Delivery, reason: &str) -> Result<NackOutcome, TransportError>;

    /// Report the delivery failed in a way no redelivery can fix. The job is
    /// dead-lettered regardless of attempts left.
    async fn fail(&self, delivery: &Delivery, reason: &str) -> Result<NackOutcome, TransportError>;
}

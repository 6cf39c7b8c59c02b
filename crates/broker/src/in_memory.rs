//! In-memory broker for tests/dev.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use jobrelay_core::{DeadLetterEntry, Job, JobId, JobRecord, JobState, TransportError};

use crate::broker::{Broker, Delivery, NackOutcome, Subscription};

#[derive(Debug, Default)]
struct State {
    ready: VecDeque<Job>,
    delayed: Vec<(Instant, Job)>,
    in_flight: HashMap<String, Job>,
    records: HashMap<JobId, JobRecord>,
    dead_letters: Vec<DeadLetterEntry>,
    subscriptions: usize,
    next_receipt: u64,
}

impl State {
    /// Move delayed jobs whose backoff elapsed to the back of the ready queue.
    fn promote_due(&mut self, now: Instant) {
        let mut i = 0;
        while i < self.delayed.len() {
            if self.delayed[i].0 <= now {
                let (_, job) = self.delayed.remove(i);
                self.ready.push_back(job);
            } else {
                i += 1;
            }
        }
    }

    fn next_due(&self) -> Option<Instant> {
        self.delayed.iter().map(|(at, _)| *at).min()
    }
}

#[derive(Debug)]
struct Inner {
    state: Mutex<State>,
    notify: Notify,
    connected: AtomicBool,
}

impl Inner {
    fn lock(&self) -> Result<MutexGuard<'_, State>, TransportError> {
        self.ensure_connected()?;
        self.state
            .lock()
            .map_err(|_| TransportError::connection("in-memory broker lock poisoned"))
    }

    fn ensure_connected(&self) -> Result<(), TransportError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::connection("in-memory broker disconnected"))
        }
    }
}

/// In-memory durable-queue stand-in.
///
/// - FIFO delivery, one in-flight entry per delivery
/// - Retries honour the job's `RetryPolicy` (delayed, then dead-lettered)
/// - `disconnect()` makes every call fail with `TransportError::Connection`
/// - `redeliver_in_flight()` simulates the broker redelivering unacked work
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                notify: Notify::new(),
                connected: AtomicBool::new(true),
            }),
        }
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Simulate losing the broker connection.
    pub fn disconnect(&self) {
        self.inner.connected.store(false, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn reconnect(&self) {
        self.inner.connected.store(true, Ordering::SeqCst);
    }

    /// Number of subscriptions opened so far.
    pub fn subscription_count(&self) -> usize {
        self.snapshot(|s| s.subscriptions)
    }

    /// Jobs waiting for delivery (ready or delayed).
    pub fn queued_len(&self) -> usize {
        self.snapshot(|s| s.ready.len() + s.delayed.len())
    }

    pub fn in_flight_len(&self) -> usize {
        self.snapshot(|s| s.in_flight.len())
    }

    pub fn dead_letters(&self) -> Vec<DeadLetterEntry> {
        self.snapshot(|s| s.dead_letters.clone())
    }

    /// Put every unsettled delivery back on the queue, as a broker does when
    /// a consumer dies without acknowledging.
    pub fn redeliver_in_flight(&self) {
        let Ok(mut state) = self.inner.state.lock() else {
            return;
        };
        let mut unsettled: Vec<(String, Job)> = state.in_flight.drain().collect();
        unsettled.sort_by(|a, b| a.0.cmp(&b.0));
        for (_, job) in unsettled {
            if let Some(record) = state.records.get_mut(&job.id) {
                record.transition(JobState::Queued, job.attempts, None);
            }
            state.ready.push_back(job);
        }
        drop(state);
        self.inner.notify.notify_one();
    }

    fn snapshot<T: Default>(&self, f: impl FnOnce(&State) -> T) -> T {
        // Inspection helpers stay usable while "disconnected".
        self.inner.state.lock().map(|s| f(&s)).unwrap_or_default()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn enqueue(&self, job: Job) -> Result<JobId, TransportError> {
        let id = job.id;
        {
            let mut state = self.inner.lock()?;
            state.records.insert(id, JobRecord::queued(&job));
            state.ready.push_back(job);
        }
        self.inner.notify.notify_one();
        Ok(id)
    }

    async fn subscribe(&self, consumer: &str) -> Result<Arc<dyn Subscription>, TransportError> {
        let mut state = self.inner.lock()?;
        state.subscriptions += 1;
        debug!(consumer, subscriptions = state.subscriptions, "in-memory subscription opened");

        Ok(Arc::new(InMemorySubscription {
            inner: Arc::clone(&self.inner),
        }))
    }

    async fn job_record(&self, id: JobId) -> Result<Option<JobRecord>, TransportError> {
        let state = self.inner.lock()?;
        Ok(state.records.get(&id).cloned())
    }
}

/// Consumer handle returned by [`InMemoryBroker::subscribe`].
#[derive(Debug)]
pub struct InMemorySubscription {
    inner: Arc<Inner>,
}

#[async_trait]
impl Subscription for InMemorySubscription {
    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>, TransportError> {
        let deadline = Instant::now() + wait;

        loop {
            let next_due = {
                let mut state = self.inner.lock()?;
                state.promote_due(Instant::now());

                if let Some(mut job) = state.ready.pop_front() {
                    job.attempts += 1;
                    state.next_receipt += 1;
                    let receipt = format!("{:020}", state.next_receipt);

                    if let Some(record) = state.records.get_mut(&job.id) {
                        record.transition(JobState::Active, job.attempts, None);
                    }
                    state.in_flight.insert(receipt.clone(), job.clone());

                    return Ok(Some(Delivery { job, receipt }));
                }

                state.next_due()
            };

            if Instant::now() >= deadline {
                return Ok(None);
            }

            let until = next_due.map_or(deadline, |due| due.min(deadline));
            let _ = tokio::time::timeout_at(until, self.inner.notify.notified()).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), TransportError> {
        let mut state = self.inner.lock()?;

        let Some(job) = state.in_flight.remove(&delivery.receipt) else {
            debug!(receipt = %delivery.receipt, "ack for settled delivery ignored");
            return Ok(());
        };

        if let Some(record) = state.records.get_mut(&job.id) {
            record.transition(JobState::Completed, job.attempts, None);
        }
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, reason: &str) -> Result<NackOutcome, TransportError> {
        self.settle_failed(delivery, reason, true)
    }

    async fn fail(&self, delivery: &Delivery, reason: &str) -> Result<NackOutcome, TransportError> {
        self.settle_failed(delivery, reason, false)
    }
}

impl InMemorySubscription {
    fn settle_failed(
        &self,
        delivery: &Delivery,
        reason: &str,
        retryable: bool,
    ) -> Result<NackOutcome, TransportError> {
        let outcome = {
            let mut state = self.inner.lock()?;

            let Some(job) = state.in_flight.remove(&delivery.receipt) else {
                debug!(receipt = %delivery.receipt, "nack for settled delivery ignored");
                return Ok(NackOutcome::Stale);
            };

            if retryable && job.can_retry() {
                let delay = job.retry_delay();
                if let Some(record) = state.records.get_mut(&job.id) {
                    record.transition(JobState::Queued, job.attempts, Some(reason.to_string()));
                }
                let next_attempt = job.attempts + 1;
                state.delayed.push((Instant::now() + delay, job));
                NackOutcome::Retrying {
                    next_attempt,
                    delay,
                }
            } else {
                if let Some(record) = state.records.get_mut(&job.id) {
                    record.transition(JobState::Failed, job.attempts, Some(reason.to_string()));
                }
                state.dead_letters.push(DeadLetterEntry::new(job, reason));
                NackOutcome::DeadLettered
            }
        };

        if matches!(outcome, NackOutcome::Retrying { .. }) {
            self.inner.notify.notify_one();
        }
        Ok(outcome)
    }
}

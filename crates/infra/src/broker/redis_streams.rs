//! Redis Streams-backed broker (durable, at-least-once delivery).
//!
//! ## Layout
//!
//! - **Stream**: `{prefix}:{queue}`, one entry per delivery (`job_id`, `name`, `job`)
//! - **Consumer group**: shared by every worker process of the queue
//! - **Delayed retries**: `{prefix}:{queue}:delayed`, a sorted set scored by due time (ms)
//! - **Dead-letter queue**: `{prefix}:{queue}:dlq`
//! - **Job records**: `{prefix}:{queue}:job:{id}` hashes, expired after settling
//!
//! A consumer first re-reads its own pending entries (id `0`) so work left
//! unacknowledged by a crash is picked up again, then switches to new
//! entries (`>`) with `BLOCK`. Before each blocking read it also claims
//! (`XAUTOCLAIM`) one entry that has sat unacknowledged with any consumer for
//! longer than `claim_idle`, which covers workers that never come back under
//! the same name. Settled entries are acknowledged and deleted; settling a
//! receipt that is no longer pending changes nothing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use jobrelay_broker::{Broker, Delivery, NackOutcome, Subscription};
use jobrelay_core::{DeadLetterEntry, Job, JobId, JobRecord, JobState, TransportError};

use crate::config::RedisSettings;

/// Max delayed jobs moved back to the stream per receive.
const PROMOTE_BATCH: usize = 100;

/// Moves one delayed job to the stream unless another consumer already did.
const PROMOTE_SCRIPT: &str = r"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 1 then
  redis.call('XADD', KEYS[2], '*', 'job_id', ARGV[2], 'name', ARGV[3], 'job', ARGV[1])
  return 1
end
return 0
";

/// Acks an entry and marks its record completed, only if it was still pending.
const ACK_SCRIPT: &str = r"
if redis.call('XACK', KEYS[1], ARGV[1], ARGV[2]) == 0 then
  return 0
end
redis.call('XDEL', KEYS[1], ARGV[2])
redis.call('HSET', KEYS[2], 'state', ARGV[3], 'attempts', ARGV[4], 'updated_at', ARGV[5])
redis.call('EXPIRE', KEYS[2], ARGV[6])
return 1
";

/// Settles a failed entry, only if it was still pending: either schedules the
/// job body in the delayed set or appends it to the dead-letter stream.
const FAIL_SCRIPT: &str = r"
if redis.call('XACK', KEYS[1], ARGV[1], ARGV[2]) == 0 then
  return 0
end
redis.call('XDEL', KEYS[1], ARGV[2])
if ARGV[3] == 'retry' then
  redis.call('ZADD', KEYS[2], ARGV[5], ARGV[4])
else
  redis.call('XADD', KEYS[3], '*', 'job_id', ARGV[9], 'name', ARGV[10], 'entry', ARGV[4])
  redis.call('EXPIRE', KEYS[4], ARGV[8])
end
redis.call('HSET', KEYS[4], 'state', ARGV[11], 'last_error', ARGV[6], 'updated_at', ARGV[7])
return 1
";

#[derive(Debug, Clone)]
struct Keys {
    stream: String,
    delayed: String,
    dlq: String,
    record_prefix: String,
}

impl Keys {
    fn new(prefix: &str, queue: &str) -> Self {
        let stream = format!("{prefix}:{queue}");
        Self {
            delayed: format!("{stream}:delayed"),
            dlq: format!("{stream}:dlq"),
            record_prefix: format!("{stream}:job:"),
            stream,
        }
    }

    fn record(&self, id: JobId) -> String {
        format!("{}{id}", self.record_prefix)
    }
}

struct Shared {
    client: redis::Client,
    conn: MultiplexedConnection,
    keys: Keys,
    group: String,
    record_ttl: Duration,
    claim_idle: Duration,
    promote: redis::Script,
    ack: redis::Script,
    fail: redis::Script,
}

impl Shared {
    fn conn(&self) -> MultiplexedConnection {
        self.conn.clone()
    }

    /// Move delayed jobs whose backoff elapsed back onto the stream.
    ///
    /// Returns how long until the next delayed job falls due, if any.
    async fn promote_due(&self) -> Result<Option<Duration>, TransportError> {
        let mut conn = self.conn();
        let now = now_ms();
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&self.keys.delayed)
            .arg("-inf")
            .arg(now)
            .arg("LIMIT")
            .arg(0)
            .arg(PROMOTE_BATCH)
            .query_async(&mut conn)
            .await
            .map_err(|e| transport("ZRANGEBYSCORE", e))?;

        for member in due {
            let (job_id, name) = match serde_json::from_str::<Job>(&member) {
                Ok(job) => (job.id.to_string(), job.name),
                // Still promoted; the receive path dead-letters it.
                Err(_) => (String::new(), String::new()),
            };

            let moved: i64 = self
                .promote
                .key(&self.keys.delayed)
                .key(&self.keys.stream)
                .arg(&member)
                .arg(&job_id)
                .arg(&name)
                .invoke_async(&mut conn)
                .await
                .map_err(|e| transport("promote", e))?;

            if moved == 1 {
                debug!(job_id = %job_id, job_name = %name, "delayed job promoted");
            }
        }

        let next: Vec<(String, f64)> = redis::cmd("ZRANGE")
            .arg(&self.keys.delayed)
            .arg(0)
            .arg(0)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await
            .map_err(|e| transport("ZRANGE", e))?;

        Ok(next
            .first()
            .map(|(_, due)| Duration::from_millis((*due as i64 - now).max(0) as u64)))
    }

    /// Acknowledge and delete a stream entry.
    async fn discard(&self, entry_id: &str) -> Result<(), TransportError> {
        let mut conn = self.conn();
        redis::pipe()
            .atomic()
            .cmd("XACK")
            .arg(&self.keys.stream)
            .arg(&self.group)
            .arg(entry_id)
            .ignore()
            .cmd("XDEL")
            .arg(&self.keys.stream)
            .arg(entry_id)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| transport("XACK", e))
    }

    /// Dead-letter an entry that cannot be decoded into a job.
    async fn bury(&self, raw: &RawEntry, reason: &str) -> Result<(), TransportError> {
        let mut conn = self.conn();
        let body = raw.field("job").unwrap_or_default();

        redis::pipe()
            .atomic()
            .cmd("XADD")
            .arg(&self.keys.dlq)
            .arg("*")
            .arg("original_entry_id")
            .arg(&raw.id)
            .arg("reason")
            .arg(reason)
            .arg("failed_at")
            .arg(Utc::now().to_rfc3339())
            .arg("payload")
            .arg(body)
            .ignore()
            .cmd("XACK")
            .arg(&self.keys.stream)
            .arg(&self.group)
            .arg(&raw.id)
            .ignore()
            .cmd("XDEL")
            .arg(&self.keys.stream)
            .arg(&raw.id)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| transport("DLQ XADD", e))?;

        warn!(entry_id = %raw.id, reason, "undecodable entry sent to dead-letter queue");
        Ok(())
    }

    /// Turn a raw stream entry into a delivery, or settle it on the spot.
    async fn claim(&self, raw: RawEntry) -> Result<Option<Delivery>, TransportError> {
        if raw.fields.is_none() {
            // Pending entry whose data is gone.
            self.discard(&raw.id).await?;
            return Ok(None);
        }

        let mut job = match raw.field("job").map(serde_json::from_str::<Job>) {
            Some(Ok(job)) => job,
            Some(Err(e)) => {
                self.bury(&raw, &format!("invalid job body: {e}")).await?;
                return Ok(None);
            }
            None => {
                self.bury(&raw, "missing job field").await?;
                return Ok(None);
            }
        };

        let record_key = self.keys.record(job.id);
        let mut conn = self.conn();

        let state: Option<String> = redis::cmd("HGET")
            .arg(&record_key)
            .arg("state")
            .query_async(&mut conn)
            .await
            .map_err(|e| transport("HGET", e))?;

        if let Some(state) = state.as_deref().and_then(|s| s.parse::<JobState>().ok()) {
            if state.is_terminal() {
                debug!(job_id = %job.id, entry_id = %raw.id, state = %state, "duplicate delivery of settled job acknowledged");
                self.discard(&raw.id).await?;
                return Ok(None);
            }
        }

        let (attempts,): (u32,) = redis::pipe()
            .atomic()
            .cmd("HINCRBY")
            .arg(&record_key)
            .arg("attempts")
            .arg(1)
            .cmd("HSET")
            .arg(&record_key)
            .arg("id")
            .arg(job.id.to_string())
            .arg("name")
            .arg(&job.name)
            .arg("state")
            .arg(JobState::Active.as_str())
            .arg("updated_at")
            .arg(Utc::now().to_rfc3339())
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| transport("claim", e))?;

        job.attempts = attempts;
        Ok(Some(Delivery {
            job,
            receipt: raw.id,
        }))
    }
}

/// Durable broker on Redis Streams.
#[derive(Clone)]
pub struct RedisStreamsBroker {
    shared: Arc<Shared>,
}

impl core::fmt::Debug for RedisStreamsBroker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisStreamsBroker")
            .field("keys", &self.shared.keys)
            .field("group", &self.shared.group)
            .field("record_ttl", &self.shared.record_ttl)
            .field("claim_idle", &self.shared.claim_idle)
            .finish_non_exhaustive()
    }
}

impl RedisStreamsBroker {
    /// Connect and make sure the consumer group exists.
    pub async fn connect(settings: &RedisSettings) -> Result<Self, TransportError> {
        let client = redis::Client::open(settings.url.as_str())
            .map_err(|e| TransportError::connection(e.to_string()))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| transport("connect", e))?;

        let broker = Self {
            shared: Arc::new(Shared {
                client,
                conn,
                keys: Keys::new(&settings.key_prefix, &settings.queue),
                group: settings.consumer_group.clone(),
                record_ttl: settings.record_ttl,
                claim_idle: settings.claim_idle,
                promote: redis::Script::new(PROMOTE_SCRIPT),
                ack: redis::Script::new(ACK_SCRIPT),
                fail: redis::Script::new(FAIL_SCRIPT),
            }),
        };
        broker.ensure_consumer_group().await?;

        debug!(stream = %broker.shared.keys.stream, group = %broker.shared.group, "redis broker connected");
        Ok(broker)
    }

    /// Create the consumer group (and stream) if missing. Idempotent.
    pub async fn ensure_consumer_group(&self) -> Result<(), TransportError> {
        let mut conn = self.shared.conn();
        let created: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.shared.keys.stream)
            .arg(&self.shared.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match created {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(transport("XGROUP CREATE", e)),
        }
    }

    pub fn stream_key(&self) -> &str {
        &self.shared.keys.stream
    }

    pub fn dead_letter_key(&self) -> &str {
        &self.shared.keys.dlq
    }
}

#[async_trait]
impl Broker for RedisStreamsBroker {
    #[instrument(skip(self, job), fields(job_id = %job.id, job_name = %job.name), err)]
    async fn enqueue(&self, job: Job) -> Result<JobId, TransportError> {
        let body =
            serde_json::to_string(&job).map_err(|e| TransportError::Serialization(e.to_string()))?;
        let record_key = self.shared.keys.record(job.id);
        let mut conn = self.shared.conn();

        let (entry_id,): (String,) = redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(&record_key)
            .arg("id")
            .arg(job.id.to_string())
            .arg("name")
            .arg(&job.name)
            .arg("state")
            .arg(JobState::Queued.as_str())
            .arg("attempts")
            .arg(job.attempts)
            .arg("updated_at")
            .arg(Utc::now().to_rfc3339())
            .ignore()
            .cmd("XADD")
            .arg(&self.shared.keys.stream)
            .arg("*")
            .arg("job_id")
            .arg(job.id.to_string())
            .arg("name")
            .arg(&job.name)
            .arg("job")
            .arg(&body)
            .query_async(&mut conn)
            .await
            .map_err(|e| transport("XADD", e))?;

        debug!(entry_id = %entry_id, "job appended to stream");
        Ok(job.id)
    }

    async fn subscribe(&self, consumer: &str) -> Result<Arc<dyn Subscription>, TransportError> {
        self.ensure_consumer_group().await?;

        // Blocking reads get their own connection so they never stall acks.
        let conn = self
            .shared
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| transport("connect", e))?;

        Ok(Arc::new(RedisStreamsSubscription {
            shared: Arc::clone(&self.shared),
            consumer: consumer.to_string(),
            reader: Mutex::new(Reader {
                conn,
                backlog_cursor: Some("0".to_string()),
                claim_cursor: "0-0".to_string(),
            }),
        }))
    }

    async fn job_record(&self, id: JobId) -> Result<Option<JobRecord>, TransportError> {
        let mut conn = self.shared.conn();
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.shared.keys.record(id))
            .query_async(&mut conn)
            .await
            .map_err(|e| transport("HGETALL", e))?;

        record_from_fields(id, &fields)
    }
}

struct Reader {
    conn: MultiplexedConnection,
    /// Last backlog id read; `None` once the backlog is drained.
    backlog_cursor: Option<String>,
    /// Where the next `XAUTOCLAIM` scan of the pending list resumes.
    claim_cursor: String,
}

/// Consumer within the queue's consumer group.
pub struct RedisStreamsSubscription {
    shared: Arc<Shared>,
    consumer: String,
    reader: Mutex<Reader>,
}

#[async_trait]
impl Subscription for RedisStreamsSubscription {
    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>, TransportError> {
        let deadline = Instant::now() + wait;
        let mut reader = self.reader.lock().await;

        loop {
            let next_due = self.shared.promote_due().await?;

            let mut read = redis::cmd("XREADGROUP");
            read.arg("GROUP")
                .arg(&self.shared.group)
                .arg(&self.consumer)
                .arg("COUNT")
                .arg(1);

            let backlog = reader.backlog_cursor.clone();

            if backlog.is_none() {
                let reply: Value = redis::cmd("XAUTOCLAIM")
                    .arg(&self.shared.keys.stream)
                    .arg(&self.shared.group)
                    .arg(&self.consumer)
                    .arg(self.shared.claim_idle.as_millis() as u64)
                    .arg(&reader.claim_cursor)
                    .arg("COUNT")
                    .arg(1)
                    .query_async(&mut reader.conn)
                    .await
                    .map_err(|e| transport("XAUTOCLAIM", e))?;

                let (next_cursor, claimed) = autoclaim_reply(reply)?;
                reader.claim_cursor = next_cursor;
                if let Some(raw) = claimed {
                    debug!(entry_id = %raw.id, consumer = %self.consumer, "claimed idle entry from another consumer");
                    if let Some(delivery) = self.shared.claim(raw).await? {
                        return Ok(Some(delivery));
                    }
                    continue;
                }
            }

            let cursor = match &backlog {
                Some(cursor) => cursor.as_str(),
                None => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    let block = next_due.map_or(remaining, |due| due.min(remaining));
                    read.arg("BLOCK").arg((block.as_millis() as u64).max(1));
                    ">"
                }
            };
            read.arg("STREAMS").arg(&self.shared.keys.stream).arg(cursor);

            let reply: Value = read
                .query_async(&mut reader.conn)
                .await
                .map_err(|e| transport("XREADGROUP", e))?;

            match first_entry(reply)? {
                Some(raw) => {
                    if backlog.is_some() {
                        reader.backlog_cursor = Some(raw.id.clone());
                        debug!(entry_id = %raw.id, consumer = %self.consumer, "recovering unacknowledged entry");
                    }
                    if let Some(delivery) = self.shared.claim(raw).await? {
                        return Ok(Some(delivery));
                    }
                }
                None if backlog.is_some() => reader.backlog_cursor = None,
                None => {
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                }
            }
        }
    }

    #[instrument(skip(self, delivery), fields(job_id = %delivery.job.id, entry_id = %delivery.receipt), err)]
    async fn ack(&self, delivery: &Delivery) -> Result<(), TransportError> {
        let shared = &self.shared;
        let mut conn = shared.conn();

        let settled: i64 = shared
            .ack
            .key(&shared.keys.stream)
            .key(shared.keys.record(delivery.job.id))
            .arg(&shared.group)
            .arg(&delivery.receipt)
            .arg(JobState::Completed.as_str())
            .arg(delivery.job.attempts)
            .arg(Utc::now().to_rfc3339())
            .arg(shared.record_ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| transport("ack", e))?;

        if settled == 0 {
            debug!("ack for settled delivery ignored");
        }
        Ok(())
    }

    #[instrument(skip(self, delivery), fields(job_id = %delivery.job.id, entry_id = %delivery.receipt), err)]
    async fn nack(&self, delivery: &Delivery, reason: &str) -> Result<NackOutcome, TransportError> {
        self.settle_failed(delivery, reason, true).await
    }

    #[instrument(skip(self, delivery), fields(job_id = %delivery.job.id, entry_id = %delivery.receipt), err)]
    async fn fail(&self, delivery: &Delivery, reason: &str) -> Result<NackOutcome, TransportError> {
        self.settle_failed(delivery, reason, false).await
    }
}

impl RedisStreamsSubscription {
    async fn settle_failed(
        &self,
        delivery: &Delivery,
        reason: &str,
        retryable: bool,
    ) -> Result<NackOutcome, TransportError> {
        let shared = &self.shared;
        let job = &delivery.job;

        let (mode, body, due, state, outcome) = if retryable && job.can_retry() {
            let delay = job.retry_delay();
            let body = serde_json::to_string(job)
                .map_err(|e| TransportError::Serialization(e.to_string()))?;
            let outcome = NackOutcome::Retrying {
                next_attempt: job.attempts + 1,
                delay,
            };
            let due = now_ms() + delay.as_millis() as i64;
            ("retry", body, due, JobState::Queued, outcome)
        } else {
            let body = serde_json::to_string(&DeadLetterEntry::new(job.clone(), reason))
                .map_err(|e| TransportError::Serialization(e.to_string()))?;
            ("dead", body, 0, JobState::Failed, NackOutcome::DeadLettered)
        };

        let mut conn = shared.conn();
        let settled: i64 = shared
            .fail
            .key(&shared.keys.stream)
            .key(&shared.keys.delayed)
            .key(&shared.keys.dlq)
            .key(shared.keys.record(job.id))
            .arg(&shared.group)
            .arg(&delivery.receipt)
            .arg(mode)
            .arg(body)
            .arg(due)
            .arg(reason)
            .arg(Utc::now().to_rfc3339())
            .arg(shared.record_ttl.as_secs().max(1))
            .arg(job.id.to_string())
            .arg(&job.name)
            .arg(state.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| transport("nack", e))?;

        if settled == 0 {
            debug!("nack for settled delivery ignored");
            return Ok(NackOutcome::Stale);
        }
        Ok(outcome)
    }
}

/// One entry of an `XREADGROUP` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RawEntry {
    id: String,
    /// `None` when the entry is still pending but was deleted from the stream.
    fields: Option<HashMap<String, String>>,
}

impl RawEntry {
    fn field(&self, name: &str) -> Option<&str> {
        self.fields.as_ref()?.get(name).map(String::as_str)
    }
}

/// Extract the first entry of a single-stream `XREADGROUP` reply.
fn first_entry(reply: Value) -> Result<Option<RawEntry>, TransportError> {
    let malformed = |what: &str| TransportError::Serialization(format!("malformed XREADGROUP reply: {what}"));

    let streams = match reply {
        Value::Nil => return Ok(None),
        Value::Bulk(streams) => streams,
        _ => return Err(malformed("expected stream list")),
    };

    let Some(Value::Bulk(stream)) = streams.into_iter().next() else {
        return Ok(None);
    };
    let entries = match stream.into_iter().nth(1) {
        Some(Value::Bulk(entries)) => entries,
        Some(Value::Nil) | None => return Ok(None),
        Some(_) => return Err(malformed("expected entry list")),
    };

    match entries.into_iter().next() {
        Some(entry) => parse_entry(entry, "XREADGROUP"),
        None => Ok(None),
    }
}

/// Split an `XAUTOCLAIM` reply into the next scan cursor and the claimed entry.
fn autoclaim_reply(reply: Value) -> Result<(String, Option<RawEntry>), TransportError> {
    let malformed = |what: &str| TransportError::Serialization(format!("malformed XAUTOCLAIM reply: {what}"));

    let Value::Bulk(parts) = reply else {
        return Err(malformed("expected array"));
    };
    let mut parts = parts.into_iter();

    let cursor = match parts.next() {
        Some(Value::Data(cursor)) => String::from_utf8_lossy(&cursor).into_owned(),
        Some(Value::Status(cursor)) => cursor,
        _ => return Err(malformed("expected cursor")),
    };

    let entry = match parts.next() {
        Some(Value::Bulk(entries)) => match entries.into_iter().next() {
            Some(entry) => parse_entry(entry, "XAUTOCLAIM")?,
            None => None,
        },
        _ => return Err(malformed("expected entry list")),
    };

    Ok((cursor, entry))
}

/// Parse one `[id, [field, value, ...]]` stream entry.
///
/// `Ok(None)` for a nil entry (deleted while pending, older servers).
fn parse_entry(entry: Value, command: &str) -> Result<Option<RawEntry>, TransportError> {
    let malformed = |what: &str| TransportError::Serialization(format!("malformed {command} reply: {what}"));

    let mut parts = match entry {
        Value::Bulk(parts) => parts,
        Value::Nil => return Ok(None),
        _ => return Err(malformed("expected entry")),
    };
    if parts.len() < 2 {
        return Err(malformed("entry too short"));
    }

    let raw_fields = parts.remove(1);
    let id = match parts.remove(0) {
        Value::Data(id) => String::from_utf8_lossy(&id).into_owned(),
        Value::Status(id) => id,
        _ => return Err(malformed("expected entry id")),
    };

    let fields = match raw_fields {
        Value::Nil => None,
        Value::Bulk(values) => {
            let mut fields = HashMap::new();
            for pair in values.chunks(2) {
                if let [Value::Data(key), Value::Data(value)] = pair {
                    fields.insert(
                        String::from_utf8_lossy(key).into_owned(),
                        String::from_utf8_lossy(value).into_owned(),
                    );
                }
            }
            Some(fields)
        }
        _ => return Err(malformed("expected field list")),
    };

    Ok(Some(RawEntry { id, fields }))
}

/// Build a [`JobRecord`] from a record hash; an empty hash means no record.
fn record_from_fields(
    id: JobId,
    fields: &HashMap<String, String>,
) -> Result<Option<JobRecord>, TransportError> {
    if fields.is_empty() {
        return Ok(None);
    }

    let invalid = |field: &str, detail: String| {
        TransportError::Serialization(format!("job record {id}: invalid {field}: {detail}"))
    };

    let state = fields
        .get("state")
        .ok_or_else(|| invalid("state", "missing".to_string()))?
        .parse::<JobState>()
        .map_err(|e| invalid("state", e))?;

    let attempts = match fields.get("attempts") {
        Some(raw) => raw
            .parse::<u32>()
            .map_err(|e| invalid("attempts", e.to_string()))?,
        None => 0,
    };

    let updated_at = match fields.get("updated_at") {
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map_err(|e| invalid("updated_at", e.to_string()))?
            .with_timezone(&Utc),
        None => Utc::now(),
    };

    Ok(Some(JobRecord {
        id,
        name: fields.get("name").cloned().unwrap_or_default(),
        state,
        attempts,
        last_error: fields.get("last_error").cloned(),
        updated_at,
    }))
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn transport(op: &str, e: redis::RedisError) -> TransportError {
    if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() {
        TransportError::Connection(format!("{op} failed: {e}"))
    } else {
        TransportError::Command(format!("{op} failed: {e}"))
    }
}

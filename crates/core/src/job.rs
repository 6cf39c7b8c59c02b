//! Job data model.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::JobId;
use crate::retry::RetryPolicy;

/// Lifecycle state of an enqueued job.
///
/// `queued → active → completed | failed`. A failed delivery with attempts
/// left goes back to `queued`. Only brokers move jobs between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl core::fmt::Display for JobState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobState::Queued),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

/// A unit of requested work, as it travels through the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Name of the handler that should process this job
    pub name: String,
    /// Handler-defined payload
    pub payload: serde_json::Value,
    /// Deliveries so far, including the one in progress
    pub attempts: u32,
    pub retry: RetryPolicy,
    pub enqueued_at: DateTime<Utc>,
}

impl Job {
    pub fn new(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: JobId::new(),
            name: name.into(),
            payload,
            attempts: 0,
            retry: RetryPolicy::default(),
            enqueued_at: Utc::now(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Whether the broker may deliver this job again after the current failure.
    pub fn can_retry(&self) -> bool {
        self.retry.should_retry(self.attempts)
    }

    /// Backoff before the next delivery, jittered by this job's id.
    pub fn retry_delay(&self) -> Duration {
        // Low bits of a v7 id are random.
        let seed = self.id.as_uuid().as_u128() as u64;
        self.retry.jittered_delay(self.attempts, seed)
    }
}

/// Broker-side tracking record for a job id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub name: String,
    pub state: JobState,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// Record for a job that was just accepted by the broker.
    pub fn queued(job: &Job) -> Self {
        Self {
            id: job.id,
            name: job.name.clone(),
            state: JobState::Queued,
            attempts: job.attempts,
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    pub fn transition(&mut self, state: JobState, attempts: u32, error: Option<String>) {
        self.state = state;
        self.attempts = attempts;
        if error.is_some() {
            self.last_error = error;
        }
        self.updated_at = Utc::now();
    }
}

/// A job that exhausted its deliveries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub job: Job,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn new(job: Job, reason: impl Into<String>) -> Self {
        Self {
            job,
            reason: reason.into(),
            dead_lettered_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_job_is_undelivered() {
        let job = Job::new("generatePDF", serde_json::json!({"hello": "world"}));
        assert_eq!(job.attempts, 0);
        assert_eq!(job.name, "generatePDF");
        assert!(job.can_retry());
    }

    #[test]
    fn retry_budget_follows_policy() {
        let mut job = Job::new("x", serde_json::json!({}))
            .with_retry(RetryPolicy::fixed(2, std::time::Duration::ZERO));

        job.attempts = 1;
        assert!(job.can_retry());
        job.attempts = 2;
        assert!(!job.can_retry());
    }

    #[test]
    fn retry_delay_differs_between_jobs() {
        let policy = RetryPolicy::exponential(5, Duration::from_secs(10), Duration::from_secs(60));
        let delays: Vec<Duration> = (0..16)
            .map(|_| {
                let mut job = Job::new("x", serde_json::json!({})).with_retry(policy.clone());
                job.attempts = 1;
                job.retry_delay()
            })
            .collect();

        assert!(delays.iter().all(|d| *d >= Duration::from_secs(9) && *d <= Duration::from_secs(11)));
        assert!(delays.iter().any(|d| *d != delays[0]));
    }

    #[test]
    fn state_round_trips_through_str() {
        for state in [
            JobState::Queued,
            JobState::Active,
            JobState::Completed,
            JobState::Failed,
        ] {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert!("paused".parse::<JobState>().is_err());
    }

    #[test]
    fn record_keeps_last_error_across_transitions() {
        let job = Job::new("x", serde_json::json!(null));
        let mut record = JobRecord::queued(&job);

        record.transition(JobState::Queued, 1, Some("boom".to_string()));
        record.transition(JobState::Active, 2, None);

        assert_eq!(record.state, JobState::Active);
        assert_eq!(record.attempts, 2);
        assert_eq!(record.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn job_serializes_to_json() {
        let job = Job::new("generatePDF", serde_json::json!({"hello": "world"}));
        let encoded = serde_json::to_string(&job).unwrap();
        let decoded: Job = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, job);
    }
}

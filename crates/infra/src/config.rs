//! Configuration loading and representation.
//!
//! Everything comes from environment variables, read once at startup.
//! `Settings::from_lookup` takes the lookup as a function so tests never
//! touch the process environment.

use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use crate::jobs::WorkerConfig;

/// Default Redis URL used when `REDIS_URL` is unset (dev only).
const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Queue name the producer and the worker agree on.
const DEFAULT_QUEUE: &str = "job";

const DEFAULT_CONSUMER_GROUP: &str = "workers";

const DEFAULT_KEY_PREFIX: &str = "jobrelay";

/// How long settled job records stay queryable.
const DEFAULT_RECORD_TTL_SECS: u64 = 24 * 60 * 60;

/// Pending entries idle this long are taken over from their consumer.
const DEFAULT_CLAIM_IDLE_MS: u64 = 60_000;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("{key} must be set")]
    Missing { key: &'static str },
}

/// Connection descriptor for the Redis Streams broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisSettings {
    pub url: String,
    pub queue: String,
    pub consumer_group: String,
    pub key_prefix: String,
    pub record_ttl: Duration,
    /// Minimum idle time before an unacknowledged entry is claimed from its
    /// consumer and redelivered. Keep it above the longest job run time.
    pub claim_idle: Duration,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_REDIS_URL.to_string(),
            queue: DEFAULT_QUEUE.to_string(),
            consumer_group: DEFAULT_CONSUMER_GROUP.to_string(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            record_ttl: Duration::from_secs(DEFAULT_RECORD_TTL_SECS),
            claim_idle: Duration::from_millis(DEFAULT_CLAIM_IDLE_MS),
        }
    }
}

/// Process settings for the worker binary.
#[derive(Debug, Clone)]
pub struct Settings {
    pub redis: RedisSettings,
    pub worker: WorkerConfig,
    /// Where `generatePDF` writes documents.
    pub pdf_output_dir: Option<PathBuf>,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let url = get("REDIS_URL").unwrap_or_else(|| {
            warn!("REDIS_URL not set; using {DEFAULT_REDIS_URL}");
            DEFAULT_REDIS_URL.to_string()
        });

        let redis = RedisSettings {
            url,
            queue: get("JOBRELAY_QUEUE").unwrap_or_else(|| DEFAULT_QUEUE.to_string()),
            consumer_group: get("JOBRELAY_CONSUMER_GROUP")
                .unwrap_or_else(|| DEFAULT_CONSUMER_GROUP.to_string()),
            key_prefix: get("JOBRELAY_KEY_PREFIX")
                .unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string()),
            record_ttl: Duration::from_secs(parse_or(
                "JOBRELAY_RECORD_TTL_SECS",
                get("JOBRELAY_RECORD_TTL_SECS"),
                DEFAULT_RECORD_TTL_SECS,
            )?),
            claim_idle: Duration::from_millis(parse_or(
                "JOBRELAY_CLAIM_IDLE_MS",
                get("JOBRELAY_CLAIM_IDLE_MS"),
                DEFAULT_CLAIM_IDLE_MS,
            )?),
        };

        let defaults = WorkerConfig::default();

        let concurrency: usize = parse_or(
            "JOBRELAY_CONCURRENCY",
            get("JOBRELAY_CONCURRENCY"),
            defaults.concurrency,
        )?;
        if concurrency == 0 {
            return Err(ConfigError::Invalid {
                key: "JOBRELAY_CONCURRENCY",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        let block_ms: u64 = parse_or(
            "JOBRELAY_BLOCK_MS",
            get("JOBRELAY_BLOCK_MS"),
            defaults.receive_wait.as_millis() as u64,
        )?;

        let worker = WorkerConfig {
            consumer_name: get("JOBRELAY_CONSUMER_NAME").unwrap_or(defaults.consumer_name),
            concurrency,
            receive_wait: Duration::from_millis(block_ms.max(1)),
            fail_on_registration_error: parse_or(
                "JOBRELAY_FAIL_ON_REGISTRATION_ERROR",
                get("JOBRELAY_FAIL_ON_REGISTRATION_ERROR"),
                defaults.fail_on_registration_error,
            )?,
        };

        Ok(Self {
            redis,
            worker,
            pdf_output_dir: get("JOBRELAY_PDF_OUTPUT_DIR").map(PathBuf::from),
        })
    }

    /// The document directory, required by the worker binary.
    pub fn require_pdf_output_dir(&self) -> Result<&PathBuf, ConfigError> {
        self.pdf_output_dir.as_ref().ok_or(ConfigError::Missing {
            key: "JOBRELAY_PDF_OUTPUT_DIR",
        })
    }
}

fn parse_or<T>(key: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: core::str::FromStr,
    T::Err: core::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(value) => {
            let parsed = value.trim().parse::<T>();
            parsed.map_err(|e| ConfigError::Invalid {
                key,
                reason: e.to_string(),
                value,
            })
        }
    }
}

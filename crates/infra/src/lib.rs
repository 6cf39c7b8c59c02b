//! Infrastructure layer: queue client, handler registry, worker, Redis broker.

pub mod broker;
pub mod config;
pub mod jobs;
pub mod queue;

mod integration_tests;

pub use config::{ConfigError, RedisSettings, Settings};
pub use queue::{QueueClient, QueueError};

//! Infrastructure-backed broker implementations.
//!
//! The broker abstraction and the in-memory broker live in `jobrelay-broker`.
//! This module provides the Redis-backed one.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::{RedisStreamsBroker, RedisStreamsSubscription};

//! Durable queue abstraction consumed by the queue client and the worker.
//!
//! The broker itself is an external collaborator (Redis Streams in
//! production). This crate defines the seam and ships an in-memory broker for
//! tests and local development.

pub mod broker;
pub mod in_memory;

pub use broker::{Broker, Delivery, NackOutcome, Subscription};
pub use in_memory::InMemoryBroker;

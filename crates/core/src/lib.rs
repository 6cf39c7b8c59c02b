//! `jobrelay-core`: job subsystem building blocks.
//!
//! This crate contains the job data model, the handler contract and the error
//! taxonomy shared by brokers, the queue client and the worker. No IO.

pub mod error;
pub mod handler;
pub mod id;
pub mod job;
pub mod retry;

pub use error::{
    DispatchError, HandlerExecutionError, RegistrationError, TransportError, UnknownJobError,
};
pub use handler::{JobHandler, Typed, TypedJob};
pub use id::JobId;
pub use job::{DeadLetterEntry, Job, JobRecord, JobState};
pub use retry::{BackoffStrategy, RetryPolicy};

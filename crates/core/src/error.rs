//! Job subsystem error taxonomy.
//!
//! Per-job failures (`UnknownJobError`, `HandlerExecutionError`) are contained
//! at the dispatch boundary and reported to the broker. `RegistrationError`
//! is collected while building the registry. `TransportError` is the only
//! class that escapes the worker loop.

use thiserror::Error;

/// The broker could not be reached or rejected a command.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("broker command error: {0}")]
    Command(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl TransportError {
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn command(msg: impl Into<String>) -> Self {
        Self::Command(msg.into())
    }
}

/// A handler definition could not be registered.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    /// The definition declares an empty name.
    #[error("handler definition has an empty name")]
    EmptyName,

    /// The factory failed to produce a handler instance.
    #[error("handler `{name}` could not be constructed: {reason}")]
    Construction { name: String, reason: String },

    /// The constructed handler reports a different name than it was declared under.
    #[error("handler declared as `{declared}` reports name `{reported}`")]
    NameMismatch { declared: String, reported: String },

    /// Another handler is already registered under this name.
    #[error("handler `{0}` is already registered")]
    Duplicate(String),
}

impl RegistrationError {
    /// Name of the candidate this error refers to (empty for `EmptyName`).
    pub fn candidate(&self) -> &str {
        match self {
            RegistrationError::EmptyName => "",
            RegistrationError::Construction { name, .. } => name,
            RegistrationError::NameMismatch { declared, .. } => declared,
            RegistrationError::Duplicate(name) => name,
        }
    }
}

/// A delivered job names no registered handler.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("no handler registered for job `{name}`")]
pub struct UnknownJobError {
    pub name: String,
}

/// A handler failed (returned an error or panicked).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("handler `{name}` failed: {message}")]
pub struct HandlerExecutionError {
    pub name: String,
    pub message: String,
}

/// Why a single dispatch failed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error(transparent)]
    UnknownJob(#[from] UnknownJobError),

    #[error(transparent)]
    Execution(#[from] HandlerExecutionError),
}

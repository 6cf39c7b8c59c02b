//! The contract every unit of executable work implements.

use anyhow::Context;
use async_trait::async_trait;
use serde::de::DeserializeOwned;

/// A named, asynchronous unit of work.
///
/// Handlers are instantiated once when the registry is built and shared by
/// every dispatch task, so `execute` takes `&self`. Any state a handler keeps
/// across invocations is its own concurrency concern.
///
/// `execute` returns normally on success and fails with a handler-defined
/// error otherwise. Redelivery is decided by the broker, never by the handler.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    /// Stable identifier; must be unique across registered handlers.
    fn name(&self) -> &str;

    async fn execute(&self, payload: serde_json::Value) -> anyhow::Result<()>;
}

/// A handler with a typed payload.
///
/// Wrap an implementation in [`Typed`] to register it.
#[async_trait]
pub trait TypedJob: Send + Sync + 'static {
    const NAME: &'static str;

    type Payload: DeserializeOwned + Send + 'static;

    async fn run(&self, payload: Self::Payload) -> anyhow::Result<()>;
}

/// Adapts a [`TypedJob`] to the untyped [`JobHandler`] contract.
///
/// A payload that does not deserialize into `J::Payload` fails the execution.
#[derive(Debug, Clone)]
pub struct Typed<J>(J);

impl<J: TypedJob> Typed<J> {
    pub fn new(job: J) -> Self {
        Self(job)
    }

    pub fn inner(&self) -> &J {
        &self.0
    }
}

#[async_trait]
impl<J: TypedJob> JobHandler for Typed<J> {
    fn name(&self) -> &str {
        J::NAME
    }

    async fn execute(&self, payload: serde_json::Value) -> anyhow::Result<()> {
        let payload: J::Payload = serde_json::from_value(payload)
            .with_context(|| format!("invalid payload for job `{}`", J::NAME))?;
        self.0.run(payload).await
    }
}

//! Routes a delivered job to its handler and contains every per-job failure.

use std::sync::Arc;

use tracing::debug;

use jobrelay_core::{DispatchError, HandlerExecutionError, Job, UnknownJobError};

use super::registry::{panic_message, HandlerRegistry};

/// Result of dispatching one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Completed,
    Failed(DispatchError),
}

impl DispatchOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, DispatchOutcome::Completed)
    }
}

/// Stateless apart from the registry it reads.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Invoke the handler registered under `job.name` with `job.payload`.
    ///
    /// Never fails: an unknown name, a handler error and a handler panic all
    /// come back as [`DispatchOutcome::Failed`].
    pub async fn dispatch(&self, job: &Job) -> DispatchOutcome {
        let Some(handler) = self.registry.lookup(&job.name) else {
            return DispatchOutcome::Failed(
                UnknownJobError {
                    name: job.name.clone(),
                }
                .into(),
            );
        };

        debug!(job_id = %job.id, job = %job.name, attempt = job.attempts, "invoking handler");

        // The handler runs in its own task so a panic unwinds there, not here.
        let payload = job.payload.clone();
        let task = tokio::spawn(async move { handler.execute(payload).await });

        let message = match task.await {
            Ok(Ok(())) => return DispatchOutcome::Completed,
            Ok(Err(err)) => format!("{err:#}"),
            Err(join) if join.is_panic() => {
                format!("handler panicked: {}", panic_message(join.into_panic().as_ref()))
            }
            Err(join) => format!("handler task cancelled: {join}"),
        };

        DispatchOutcome::Failed(
            HandlerExecutionError {
                name: job.name.clone(),
                message,
            }
            .into(),
        )
    }
}

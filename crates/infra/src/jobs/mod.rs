//! Consumer side of the job system.
//!
//! ## Components
//!
//! - `HandlerCatalog` / `HandlerRegistry`: compile-time handler declarations,
//!   validated once into an immutable name → handler map
//! - `Dispatcher`: routes one job to its handler, containing failures
//! - `Worker`: broker subscription loop with bounded concurrency
//! - `WorkerRuntime`: the process's single worker plus a matching producer
//! - `handlers`: the bundled handlers (`generatePDF`)

pub mod dispatcher;
pub mod handlers;
pub mod registry;
pub mod runtime;
pub mod worker;

pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use handlers::{HandlerDeps, catalog};
pub use registry::{HandlerCatalog, HandlerDefinition, HandlerRegistry, RegistryBuild, RegistryLoader};
pub use runtime::WorkerRuntime;
pub use worker::{Worker, WorkerConfig, WorkerError, WorkerHandle, WorkerStats, WorkerStatsSnapshot};

//! Handler registry: name → handler instance.
//!
//! Handlers are declared in a compile-time [`HandlerCatalog`]. Building the
//! registry validates every definition once; a bad definition is skipped and
//! reported, it never prevents the valid ones from registering.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};

use tracing::{error, info, warn};

use jobrelay_core::{JobHandler, RegistrationError};

type HandlerFactory = Arc<dyn Fn() -> anyhow::Result<Arc<dyn JobHandler>> + Send + Sync>;

/// A declared handler: the name it is registered under and how to build it.
///
/// The factory is where dependencies are wired in; it runs once, when the
/// registry is built.
#[derive(Clone)]
pub struct HandlerDefinition {
    name: String,
    factory: HandlerFactory,
}

impl HandlerDefinition {
    pub fn new<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> anyhow::Result<Arc<dyn JobHandler>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            factory: Arc::new(factory),
        }
    }

    /// Definition for a handler built with `Default`.
    pub fn of<H>(name: impl Into<String>) -> Self
    where
        H: JobHandler + Default,
    {
        Self::new(name, || Ok(Arc::new(H::default()) as Arc<dyn JobHandler>))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Instantiate and validate the handler against its declaration.
    fn instantiate(&self) -> Result<Arc<dyn JobHandler>, RegistrationError> {
        if self.name.trim().is_empty() {
            return Err(RegistrationError::EmptyName);
        }

        let built = panic::catch_unwind(AssertUnwindSafe(|| (self.factory)())).map_err(|panic| {
            RegistrationError::Construction {
                name: self.name.clone(),
                reason: format!("factory panicked: {}", panic_message(panic.as_ref())),
            }
        })?;

        let handler = built.map_err(|e| RegistrationError::Construction {
            name: self.name.clone(),
            reason: format!("{e:#}"),
        })?;

        if handler.name() != self.name {
            return Err(RegistrationError::NameMismatch {
                declared: self.name.clone(),
                reported: handler.name().to_string(),
            });
        }

        Ok(handler)
    }
}

impl core::fmt::Debug for HandlerDefinition {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HandlerDefinition")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// The designated collection of handler definitions.
#[derive(Debug, Clone, Default)]
pub struct HandlerCatalog {
    definitions: Vec<HandlerDefinition>,
}

impl HandlerCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, definition: HandlerDefinition) -> Self {
        self.definitions.push(definition);
        self
    }

    pub fn push(&mut self, definition: HandlerDefinition) {
        self.definitions.push(definition);
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    pub fn definitions(&self) -> &[HandlerDefinition] {
        &self.definitions
    }
}

/// Immutable mapping from job name to handler.
///
/// Read-only after [`HandlerRegistry::build`]; lookups need no locking.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

/// Result of building a registry: the handlers that made it plus every
/// rejected definition.
#[derive(Debug)]
pub struct RegistryBuild {
    pub registry: Arc<HandlerRegistry>,
    pub failures: Vec<RegistrationError>,
    pub candidates: usize,
}

impl RegistryBuild {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

impl HandlerRegistry {
    /// Validate every definition in `catalog` and register the valid ones.
    pub fn build(catalog: &HandlerCatalog) -> RegistryBuild {
        let mut handlers: HashMap<String, Arc<dyn JobHandler>> = HashMap::new();
        let mut failures = Vec::new();

        for definition in catalog.definitions() {
            let registered = definition.instantiate().and_then(|handler| {
                if handlers.contains_key(definition.name()) {
                    Err(RegistrationError::Duplicate(definition.name().to_string()))
                } else {
                    Ok(handler)
                }
            });

            match registered {
                Ok(handler) => {
                    handlers.insert(definition.name().to_string(), handler);
                }
                Err(err) => {
                    error!(candidate = definition.name(), error = %err, "handler registration failed");
                    failures.push(err);
                }
            }
        }

        let registry = Self { handlers };

        if registry.is_empty() {
            warn!(
                candidates = catalog.len(),
                failed = failures.len(),
                "handler registry is empty"
            );
        } else {
            info!(
                registered = registry.len(),
                failed = failures.len(),
                handlers = ?registry.names(),
                "handler registry built"
            );
        }

        RegistryBuild {
            registry: Arc::new(registry),
            failures,
            candidates: catalog.len(),
        }
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl core::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}

/// Builds the registry from a catalog exactly once.
///
/// Later calls return the cached build without running any factory again.
#[derive(Debug)]
pub struct RegistryLoader {
    catalog: HandlerCatalog,
    built: OnceLock<Arc<RegistryBuild>>,
}

impl RegistryLoader {
    pub fn new(catalog: HandlerCatalog) -> Self {
        Self {
            catalog,
            built: OnceLock::new(),
        }
    }

    pub fn build(&self) -> Arc<RegistryBuild> {
        Arc::clone(
            self.built
                .get_or_init(|| Arc::new(HandlerRegistry::build(&self.catalog))),
        )
    }

    pub fn is_built(&self) -> bool {
        self.built.get().is_some()
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

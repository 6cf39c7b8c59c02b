//! Bundled job handlers and the catalog the worker loads them from.
//!
//! Each handler module exposes a `definition`; [`catalog`] lists them.

pub mod generate_pdf;

use std::sync::Arc;

use super::registry::HandlerCatalog;

pub use generate_pdf::{
    DirectoryDocumentSink, DocumentSink, GeneratePdf, InMemoryDocumentSink, StoredDocument,
};

/// Shared dependencies handed to handler factories.
#[derive(Clone)]
pub struct HandlerDeps {
    pub documents: Arc<dyn DocumentSink>,
}

impl Default for HandlerDeps {
    fn default() -> Self {
        Self {
            documents: Arc::new(InMemoryDocumentSink::default()),
        }
    }
}

/// Every handler this worker can run.
pub fn catalog(deps: &HandlerDeps) -> HandlerCatalog {
    HandlerCatalog::new().with(GeneratePdf::definition(Arc::clone(&deps.documents)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::registry::HandlerRegistry;

    #[test]
    fn bundled_catalog_registers_cleanly() {
        let build = HandlerRegistry::build(&catalog(&HandlerDeps::default()));

        assert!(build.is_complete());
        assert_eq!(build.registry.names(), vec!["generatePDF".to_string()]);
    }
}

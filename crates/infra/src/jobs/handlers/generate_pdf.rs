//! `generatePDF`: renders a job payload into a one-page PDF.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::info;

use jobrelay_core::{JobHandler, Typed, TypedJob};

use crate::jobs::registry::HandlerDefinition;

/// Page lines that fit below the title at 14pt leading.
const MAX_LINES: usize = 46;

/// A rendered document ready for storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredDocument {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// Where rendered documents go.
#[async_trait]
pub trait DocumentSink: Send + Sync + 'static {
    /// Persist `bytes` under `name`; returns a description of the location.
    async fn store(&self, name: &str, bytes: Vec<u8>) -> anyhow::Result<String>;
}

/// Keeps documents in memory (dev and tests).
#[derive(Debug, Default)]
pub struct InMemoryDocumentSink {
    documents: Mutex<Vec<StoredDocument>>,
}

impl InMemoryDocumentSink {
    pub fn documents(&self) -> Vec<StoredDocument> {
        self.documents
            .lock()
            .map(|docs| docs.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl DocumentSink for InMemoryDocumentSink {
    async fn store(&self, name: &str, bytes: Vec<u8>) -> anyhow::Result<String> {
        self.documents
            .lock()
            .map_err(|_| anyhow::anyhow!("document store lock poisoned"))?
            .push(StoredDocument {
                name: name.to_string(),
                bytes,
            });
        Ok(format!("memory:{name}"))
    }
}

/// Writes documents as files under a directory, creating it on demand.
#[derive(Debug, Clone)]
pub struct DirectoryDocumentSink {
    dir: PathBuf,
}

impl DirectoryDocumentSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl DocumentSink for DirectoryDocumentSink {
    async fn store(&self, name: &str, bytes: Vec<u8>) -> anyhow::Result<String> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating {}", self.dir.display()))?;

        let path = self.dir.join(name);
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;

        Ok(path.display().to_string())
    }
}

/// Renders the payload's key/value pairs and stores the result.
pub struct GeneratePdf {
    documents: Arc<dyn DocumentSink>,
}

impl GeneratePdf {
    pub fn new(documents: Arc<dyn DocumentSink>) -> Self {
        Self { documents }
    }

    /// Registration entry for the catalog.
    pub fn definition(documents: Arc<dyn DocumentSink>) -> HandlerDefinition {
        HandlerDefinition::new(Self::NAME, move || {
            Ok(Arc::new(Typed::new(GeneratePdf::new(Arc::clone(&documents)))) as Arc<dyn JobHandler>)
        })
    }
}

#[async_trait]
impl TypedJob for GeneratePdf {
    const NAME: &'static str = "generatePDF";

    type Payload = Map<String, Value>;

    async fn run(&self, payload: Map<String, Value>) -> anyhow::Result<()> {
        let bytes = render(Self::NAME, &payload);
        let size = bytes.len();
        let name = format!("{}.pdf", uuid::Uuid::now_v7());

        let location = self.documents.store(&name, bytes).await?;
        info!(document = %location, bytes = size, fields = payload.len(), "pdf generated");
        Ok(())
    }
}

/// Render `fields` under `title` as a single-page PDF 1.4 document.
pub fn render(title: &str, fields: &Map<String, Value>) -> Vec<u8> {
    let mut lines: Vec<String> = fields
        .iter()
        .map(|(key, value)| match value {
            Value::String(s) => format!("{key}: {s}"),
            other => format!("{key}: {other}"),
        })
        .collect();
    if lines.len() > MAX_LINES {
        let hidden = lines.len() - (MAX_LINES - 1);
        lines.truncate(MAX_LINES - 1);
        lines.push(format!("... ({hidden} more)"));
    }

    let mut content = String::from("BT\n/F1 18 Tf\n72 720 Td\n");
    content.push_str(&format!("({}) Tj\n/F1 11 Tf\n14 TL\nT* T*\n", escape(title)));
    for line in &lines {
        content.push_str(&format!("({}) Tj T*\n", escape(line)));
    }
    content.push_str("ET\n");

    let objects = [
        "<< /Type /Catalog /Pages 2 0 R >>".to_string(),
        "<< /Type /Pages /Kids [3 0 R] /Count 1 >>".to_string(),
        "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] \
         /Resources << /Font << /F1 4 0 R >> >> /Contents 5 0 R >>"
            .to_string(),
        "<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica >>".to_string(),
        format!(
            "<< /Length {} >>\nstream\n{content}endstream",
            content.len()
        ),
    ];

    let mut out: Vec<u8> = b"%PDF-1.4\n".to_vec();
    let mut offsets = Vec::with_capacity(objects.len());
    for (i, body) in objects.iter().enumerate() {
        offsets.push(out.len());
        out.extend_from_slice(format!("{} 0 obj\n{body}\nendobj\n", i + 1).as_bytes());
    }

    let xref = out.len();
    out.extend_from_slice(format!("xref\n0 {}\n", objects.len() + 1).as_bytes());
    out.extend_from_slice(b"0000000000 65535 f \n");
    for offset in offsets {
        out.extend_from_slice(format!("{offset:010} 00000 n \n").as_bytes());
    }
    out.extend_from_slice(
        format!(
            "trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{xref}\n%%EOF\n",
            objects.len() + 1
        )
        .as_bytes(),
    );
    out
}

/// Escape a PDF literal string; non-ASCII becomes `?` (Helvetica has no glyphs for it).
fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' | '(' | ')' => {
                escaped.push('\\');
                escaped.push(c);
            }
            c if c.is_ascii_graphic() || c == ' ' => escaped.push(c),
            _ => escaped.push('?'),
        }
    }
    escaped
}

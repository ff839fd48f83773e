use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::domain::document::{Document, DocumentError};

use super::options::RenderOptions;
use super::resources::ResourceError;

/// Structured errors surfaced by renderer units. The pipeline reports them per
/// renderer and carries on; they never abort a run.
#[derive(Debug, Clone, Error)]
pub enum RenderError {
    #[error(transparent)]
    Resource(#[from] ResourceError),
    #[error("document processing failed: {0}")]
    Document(#[from] DocumentError),
    #[error("syntax highlighting failed: {language}: {message}")]
    Highlighting { language: String, message: String },
    #[error("{engine} engine unavailable: {message}")]
    EngineUnavailable { engine: String, message: String },
    #[error("markdown conversion failed: {message}")]
    Markdown { message: String },
}

impl RenderError {
    pub fn engine_unavailable(engine: impl Into<String>, message: impl Into<String>) -> Self {
        Self::EngineUnavailable {
            engine: engine.into(),
            message: message.into(),
        }
    }
}

/// A named, prioritised enrichment unit.
///
/// Renderers run in ascending [`Renderer::priority`]; equal priorities keep
/// registration order. `apply` must be idempotent: nodes a renderer already
/// enriched carry a marker and are skipped on the next pass.
#[async_trait]
pub trait Renderer: Send + Sync {
    fn name(&self) -> &str;

    fn priority(&self) -> i32;

    /// Cheap scan deciding whether `apply` runs at all this pass.
    fn applies(&self, document: &Document, options: &RenderOptions) -> bool;

    async fn apply(&self, document: &mut Document, options: &RenderOptions)
    -> Result<(), RenderError>;

    /// Release renderer-owned resources when unregistered.
    fn dispose(&self) {}
}

/// A renderer failure captured by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RendererFailure {
    pub renderer: String,
    pub message: String,
}

impl RendererFailure {
    pub fn new(renderer: &str, error: &RenderError) -> Self {
        Self {
            renderer: renderer.to_string(),
            message: error.to_string(),
        }
    }
}

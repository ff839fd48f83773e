//! Rendering surface: one registry, its pipeline and the outline it feeds.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use crate::application::render::{
    BuiltinRenderers, CancelHandle, DIAGRAM_OWNER, MATH_RENDERED_ATTR, OWNER_ATTR,
    PipelineError, PipelineEvent, Registration, RenderContext, RenderError, RenderOptions,
    RenderOptionsPatch, RenderPipeline, Renderer, RendererFailure, ResourceLoader, RunReport,
    parse_markdown,
};
use crate::application::toc::{TableOfContents, TocError};
use crate::domain::document::Document;

#[derive(Debug, Error)]
pub enum SurfaceError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error("outline generation failed: {0}")]
    Toc(#[from] TocError),
}

/// Counts of enriched content after a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ContentMetrics {
    pub code_blocks: usize,
    pub math_elements: usize,
    pub diagrams: usize,
    pub headings: usize,
}

impl ContentMetrics {
    pub fn collect(document: &Document, headings: usize) -> Self {
        let root = document.root();
        let code_blocks = document
            .select(root, |element| {
                element.tag() == "pre" && element.attr(OWNER_ATTR) != Some(DIAGRAM_OWNER)
            })
            .len();
        let math_elements = document
            .select(root, |element| element.has_attr(MATH_RENDERED_ATTR))
            .len();
        let diagrams = document
            .select(root, |element| {
                element.has_class("diagram") && element.attr(OWNER_ATTR) == Some(DIAGRAM_OWNER)
            })
            .len();
        Self {
            code_blocks,
            math_elements,
            diagrams,
            headings,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SurfaceReport {
    #[serde(flatten)]
    pub run: RunReport,
    pub content: ContentMetrics,
    pub outline_changed: bool,
}

/// Wires content through the pipeline and into the outline, and signals the
/// caller once enriched content is ready.
pub struct RenderSurface {
    context: RenderContext,
    pipeline: Arc<RenderPipeline>,
    loader: Arc<ResourceLoader>,
    toc: TableOfContents,
    ready: watch::Sender<Option<u64>>,
}

impl RenderSurface {
    pub fn new(context: RenderContext, loader: Arc<ResourceLoader>) -> Self {
        let pipeline = Arc::new(context.pipeline());
        let (ready, _) = watch::channel(None);
        Self {
            context,
            pipeline,
            loader,
            toc: TableOfContents::default(),
            ready,
        }
    }

    /// A surface with the built-in renderers registered.
    pub fn with_builtin_renderers(options: RenderOptions, builtins: &BuiltinRenderers) -> Self {
        let context = RenderContext::with_builtin_renderers(options, builtins);
        Self::new(context, Arc::clone(&builtins.loader))
    }

    pub fn context(&self) -> &RenderContext {
        &self.context
    }

    pub fn options(&self) -> &RenderOptions {
        self.context.options()
    }

    pub fn toc(&self) -> &TableOfContents {
        &self.toc
    }

    pub fn toc_mut(&mut self) -> &mut TableOfContents {
        &mut self.toc
    }

    pub fn register(&mut self, renderer: Arc<dyn Renderer>) -> Registration {
        let registration = self.context.register(renderer);
        if registration == Registration::Added {
            self.rebuild();
        }
        registration
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        let removed = self.context.unregister(name);
        if removed {
            self.rebuild();
        }
        removed
    }

    pub fn set_options(&mut self, patch: &RenderOptionsPatch) {
        self.context.set_options(patch);
        self.rebuild();
    }

    pub fn on_error<F>(&mut self, callback: F)
    where
        F: Fn(&RendererFailure) + Send + Sync + 'static,
    {
        self.context.on_error(callback);
        self.rebuild();
    }

    /// The pipeline the next render will use.
    pub fn pipeline(&self) -> Arc<RenderPipeline> {
        Arc::clone(&self.pipeline)
    }

    /// Cancels the run in progress on the current pipeline.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.pipeline.cancel_handle()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.context.subscribe()
    }

    /// Holds the run number of the last run that produced ready content.
    pub fn ready(&self) -> watch::Receiver<Option<u64>> {
        self.ready.subscribe()
    }

    /// `<link>`/`<script>` tags for every resource the renderers loaded.
    pub fn head_html(&self) -> String {
        self.loader.head_html()
    }

    /// Enrich `document` in place, then refresh the outline from the events
    /// the run emitted.
    pub async fn render(&mut self, document: &mut Document) -> Result<SurfaceReport, SurfaceError> {
        let mut events = self.pipeline.subscribe();
        let run = self.pipeline.execute(document).await?;

        let mut outline_changed = false;
        loop {
            match events.try_recv() {
                Ok(event) => {
                    outline_changed |= self.toc.on_pipeline_event(&event, document)?;
                }
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(
                        target = "application::surface",
                        skipped,
                        "Pipeline events lagged; rescanning outline"
                    );
                    outline_changed |= self.toc.refresh(document)?;
                }
                Err(_) => break,
            }
        }

        let content = ContentMetrics::collect(document, self.toc.items().len());
        if !run.cancelled {
            self.ready.send_replace(Some(run.run));
        }
        info!(
            target = "application::surface",
            run = run.run,
            code_blocks = content.code_blocks,
            math_elements = content.math_elements,
            diagrams = content.diagrams,
            headings = content.headings,
            "Content ready"
        );

        Ok(SurfaceReport {
            run,
            content,
            outline_changed,
        })
    }

    /// Parse markdown with the current math options, then [`Self::render`].
    pub async fn render_markdown(
        &mut self,
        markdown: &str,
    ) -> Result<(Document, SurfaceReport), SurfaceError> {
        let mut document = parse_markdown(markdown, &self.context.options().math)?;
        let report = self.render(&mut document).await?;
        Ok((document, report))
    }

    fn rebuild(&mut self) {
        self.pipeline = Arc::new(self.context.pipeline());
    }
}

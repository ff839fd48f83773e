//! Per-surface renderer registry and options.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::code::CodeWrapper;
use super::diagram::{DiagramEngine, DiagramRenderer};
use super::highlight::SyntaxHighlighter;
use super::math::MathTypesetter;
use super::mermaid::{DEFAULT_MERMAID_CACHE_DIR, DEFAULT_MERMAID_CLI_PATH, MermaidCli};
use super::options::{RenderOptions, RenderOptionsPatch};
use super::pipeline::{ErrorCallback, PipelineEvent, RenderPipeline};
use super::resources::{ResourceLoader, resource_loader};
use super::types::{Renderer, RendererFailure};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Registration {
    Added,
    /// A renderer with the same name is already registered; nothing changed.
    Duplicate,
}

/// Listing entry for a registered renderer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RendererInfo {
    pub name: String,
    pub priority: i32,
}

struct Entry {
    renderer: Arc<dyn Renderer>,
    seq: u64,
}

/// Where the built-in renderers get their collaborators.
#[derive(Clone)]
pub struct BuiltinRenderers {
    pub loader: Arc<ResourceLoader>,
    pub mermaid_cli_path: PathBuf,
    pub mermaid_cache_dir: PathBuf,
}

impl Default for BuiltinRenderers {
    fn default() -> Self {
        Self {
            loader: resource_loader(),
            mermaid_cli_path: PathBuf::from(DEFAULT_MERMAID_CLI_PATH),
            mermaid_cache_dir: PathBuf::from(DEFAULT_MERMAID_CACHE_DIR),
        }
    }
}

impl BuiltinRenderers {
    /// Code wrapper, syntax highlighter, math typesetter and diagram renderer.
    pub fn build(&self) -> Vec<Arc<dyn Renderer>> {
        let mermaid: Arc<dyn DiagramEngine> = Arc::new(MermaidCli::new(
            self.mermaid_cli_path.clone(),
            self.mermaid_cache_dir.clone(),
        ));
        vec![
            Arc::new(CodeWrapper::new()),
            Arc::new(SyntaxHighlighter::new(Arc::clone(&self.loader))),
            Arc::new(MathTypesetter::new(Arc::clone(&self.loader))),
            Arc::new(DiagramRenderer::new(Arc::clone(&self.loader), vec![mermaid])),
        ]
    }
}

/// Options plus the live, priority-sorted renderer set of one rendering
/// surface. Mutation happens through `&mut self`; share it across tasks only
/// behind the owner's own synchronisation.
pub struct RenderContext {
    options: RenderOptions,
    entries: Vec<Entry>,
    next_seq: u64,
    on_error: Option<ErrorCallback>,
    events: broadcast::Sender<PipelineEvent>,
}

impl Default for RenderContext {
    fn default() -> Self {
        Self::new(RenderOptions::default())
    }
}

impl RenderContext {
    pub fn new(options: RenderOptions) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            options,
            entries: Vec::new(),
            next_seq: 0,
            on_error: None,
            events,
        }
    }

    /// A context with the four built-in renderers registered.
    pub fn with_builtin_renderers(options: RenderOptions, builtins: &BuiltinRenderers) -> Self {
        let mut context = Self::new(options);
        for renderer in builtins.build() {
            context.register(renderer);
        }
        context
    }

    pub fn register(&mut self, renderer: Arc<dyn Renderer>) -> Registration {
        let name = renderer.name().to_string();
        if self.entries.iter().any(|entry| entry.renderer.name() == name) {
            warn!(
                target = "application::render::registry",
                renderer = %name,
                "Renderer already registered; ignoring duplicate"
            );
            return Registration::Duplicate;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push(Entry { renderer, seq });
        self.entries
            .sort_by_key(|entry| (entry.renderer.priority(), entry.seq));
        debug!(
            target = "application::render::registry",
            renderer = %name,
            registered = self.entries.len(),
            "Renderer registered"
        );
        Registration::Added
    }

    /// Remove a renderer, disposing it first. Returns whether it was present.
    pub fn unregister(&mut self, name: &str) -> bool {
        let Some(position) = self
            .entries
            .iter()
            .position(|entry| entry.renderer.name() == name)
        else {
            return false;
        };
        self.entries[position].renderer.dispose();
        self.entries.remove(position);
        debug!(
            target = "application::render::registry",
            renderer = name,
            "Renderer unregistered"
        );
        true
    }

    pub fn options(&self) -> &RenderOptions {
        &self.options
    }

    /// Deep-merge `patch` into a fresh options value and make it current.
    pub fn set_options(&mut self, patch: &RenderOptionsPatch) -> &RenderOptions {
        self.options = self.options.merged(patch);
        &self.options
    }

    /// Registered renderers in execution order.
    pub fn list(&self) -> Vec<Arc<dyn Renderer>> {
        self.entries
            .iter()
            .map(|entry| Arc::clone(&entry.renderer))
            .collect()
    }

    pub fn describe(&self) -> Vec<RendererInfo> {
        self.entries
            .iter()
            .map(|entry| RendererInfo {
                name: entry.renderer.name().to_string(),
                priority: entry.renderer.priority(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|entry| entry.renderer.name() == name)
    }

    /// Callback invoked with every renderer failure.
    pub fn on_error<F>(&mut self, callback: F)
    where
        F: Fn(&RendererFailure) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    /// Snapshot the current renderers and options into a runnable pipeline.
    pub fn pipeline(&self) -> RenderPipeline {
        RenderPipeline::new(
            self.list().into(),
            Arc::new(self.options.clone()),
            self.events.clone(),
            self.on_error.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::application::render::options::{CodeOptionsPatch, Theme};
    use crate::application::render::types::RenderError;
    use crate::domain::document::Document;

    struct Named {
        name: &'static str,
        priority: i32,
        disposed: Arc<AtomicBool>,
    }

    impl Named {
        fn new(name: &'static str, priority: i32) -> Arc<Self> {
            Arc::new(Self {
                name,
                priority,
                disposed: Arc::new(AtomicBool::new(false)),
            })
        }
    }

    #[async_trait]
    impl Renderer for Named {
        fn name(&self) -> &str {
            self.name
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        fn applies(&self, _document: &Document, _options: &RenderOptions) -> bool {
            false
        }

        async fn apply(
            &self,
            _document: &mut Document,
            _options: &RenderOptions,
        ) -> Result<(), RenderError> {
            Ok(())
        }

        fn dispose(&self) {
            self.disposed.store(true, Ordering::SeqCst);
        }
    }

    fn names(context: &RenderContext) -> Vec<String> {
        context.describe().into_iter().map(|info| info.name).collect()
    }

    #[test]
    fn list_is_sorted_by_priority_then_registration() {
        let mut context = RenderContext::default();
        context.register(Named::new("late", 40));
        context.register(Named::new("first-tie", 10));
        context.register(Named::new("second-tie", 10));
        context.register(Named::new("early", 5));

        assert_eq!(
            names(&context),
            vec!["early", "first-tie", "second-tie", "late"]
        );
    }

    #[test]
    fn duplicate_names_are_ignored() {
        let mut context = RenderContext::default();
        assert_eq!(context.register(Named::new("math", 30)), Registration::Added);
        assert_eq!(
            context.register(Named::new("math", 1)),
            Registration::Duplicate
        );

        assert_eq!(context.len(), 1);
        assert_eq!(context.describe()[0].priority, 30);
    }

    #[test]
    fn unregister_disposes_renderer() {
        let mut context = RenderContext::default();
        let renderer = Named::new("diagram", 40);
        let disposed = Arc::clone(&renderer.disposed);
        context.register(renderer);

        assert!(context.unregister("diagram"));
        assert!(disposed.load(Ordering::SeqCst));
        assert!(context.is_empty());
        assert!(!context.unregister("diagram"));
    }

    #[test]
    fn set_options_merges_without_touching_pipeline_snapshots() {
        let mut context = RenderContext::default();
        let snapshot = context.pipeline();

        context.set_options(&RenderOptionsPatch {
            theme: Some(Theme::Dark),
            code: Some(CodeOptionsPatch {
                line_numbers: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        });

        assert_eq!(context.options().theme, Theme::Dark);
        assert!(context.options().code.line_numbers);
        assert!(context.options().code.copy_button);
        assert_eq!(snapshot.options().theme, Theme::Light);
    }

    #[test]
    fn builtin_renderers_register_in_priority_order() {
        let context = RenderContext::with_builtin_renderers(
            RenderOptions::default(),
            &BuiltinRenderers::default(),
        );
        assert_eq!(
            names(&context),
            vec![
                "code-wrapper",
                "syntax-highlighter",
                "math-typesetter",
                "diagram-renderer"
            ]
        );
    }
}

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::domain::document::{Document, Element, NodeId};

use super::claim::{OWNER_ATTR, claim, claimed_by_other, declared_language};
use super::code::code_element;
use super::copy::{COPY_SOURCE_ATTR, COPY_STATE_ATTR, COPY_STATE_IDLE};
use super::options::{RenderOptions, Theme};
use super::resources::{ResourceLoader, asset_url};
use super::types::{RenderError, Renderer};

pub const DIAGRAM_OWNER: &str = "diagram";
pub const RENDERED_ATTR: &str = "data-diagram-rendered";
pub const DIAGRAM_ERROR_TITLE: &str = "Diagram rendering failed";

const PRIORITY: i32 = 40;
const DEFAULT_WIDTH: u32 = 800;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DiagramError {
    #[error("diagram engine unavailable: {0}")]
    Unavailable(String),
    #[error("{0}")]
    Render(String),
    #[error("failed to configure diagram engine: {0}")]
    Configure(String),
}

/// Theme and layout handed to an engine before it renders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagramConfig {
    pub theme: Theme,
    pub background: String,
    pub width: u32,
}

impl Default for DiagramConfig {
    fn default() -> Self {
        Self {
            theme: Theme::Light,
            background: "transparent".to_string(),
            width: DEFAULT_WIDTH,
        }
    }
}

impl DiagramConfig {
    pub fn from_options(options: &RenderOptions) -> Self {
        Self {
            theme: options.diagram.theme,
            ..Self::default()
        }
    }
}

/// Turns a textual diagram description into SVG.
#[async_trait]
pub trait DiagramEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Block languages handled by this engine, lower-cased.
    fn languages(&self) -> &[&str];

    /// Runtime asset, relative to the resource base.
    fn asset_path(&self) -> &str;

    fn configure(&self, config: &DiagramConfig) -> Result<(), DiagramError>;

    async fn render(&self, source: &str) -> Result<String, DiagramError>;
}

#[derive(Debug, Clone)]
struct DiagramBlock {
    node: NodeId,
    source: String,
    engine: usize,
}

pub struct DiagramRenderer {
    loader: Arc<ResourceLoader>,
    engines: Vec<Arc<dyn DiagramEngine>>,
    configured: Mutex<HashMap<String, DiagramConfig>>,
}

impl DiagramRenderer {
    pub fn new(loader: Arc<ResourceLoader>, engines: Vec<Arc<dyn DiagramEngine>>) -> Self {
        Self {
            loader,
            engines,
            configured: Mutex::new(HashMap::new()),
        }
    }

    fn engine_for(&self, language: &str, options: &RenderOptions) -> Option<usize> {
        self.engines.iter().position(|engine| {
            options.diagram.enabled_engines.contains(engine.name())
                && engine.languages().contains(&language)
        })
    }

    /// Diagram candidates in document order: fenced blocks plus containers a
    /// host marked directly (`<div class="mermaid">`).
    fn pending(&self, document: &Document, options: &RenderOptions) -> Vec<DiagramBlock> {
        let mut blocks = Vec::new();

        for node in document.descendants(document.root()) {
            let Some(element) = document.element(node) else {
                continue;
            };
            if element.has_attr(RENDERED_ATTR) || claimed_by_other(document, node, DIAGRAM_OWNER) {
                continue;
            }
            let candidate = match element.tag() {
                "code" => None,
                "pre" => self.fenced_block(document, node, options),
                _ => self.host_container(document, node, options),
            };
            blocks.extend(candidate);
        }

        blocks
    }

    fn fenced_block(
        &self,
        document: &Document,
        pre: NodeId,
        options: &RenderOptions,
    ) -> Option<DiagramBlock> {
        let code = code_element(document, pre);
        let language = declared_language(document, code)?;
        let engine = self.engine_for(&language, options)?;
        Some(DiagramBlock {
            node: pre,
            source: document.text_content(code),
            engine,
        })
    }

    fn host_container(
        &self,
        document: &Document,
        node: NodeId,
        options: &RenderOptions,
    ) -> Option<DiagramBlock> {
        let element = document.element(node)?;
        let language = element
            .attr("data-diagram")
            .map(|value| value.trim().to_ascii_lowercase())
            .or_else(|| {
                element
                    .classes()
                    .find(|class| self.engine_for(class, options).is_some())
                    .map(str::to_string)
            })?;
        let engine = self.engine_for(&language, options)?;
        Some(DiagramBlock {
            node,
            source: document.text_content(node),
            engine,
        })
    }

    async fn prepare_engine(
        &self,
        engine: &Arc<dyn DiagramEngine>,
        options: &RenderOptions,
    ) -> Result<(), RenderError> {
        let runtime = asset_url(&options.resource_base, engine.asset_path())?;
        self.loader
            .ensure_script(&runtime, &format!("diagram-engine-{}", engine.name()))
            .await?;

        let config = DiagramConfig::from_options(options);
        let mut configured = self
            .configured
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if configured.get(engine.name()) != Some(&config) {
            engine
                .configure(&config)
                .map_err(|err| RenderError::engine_unavailable(engine.name(), err.to_string()))?;
            info!(
                target = "application::render::diagram",
                engine = engine.name(),
                theme = %config.theme,
                "Configured diagram engine"
            );
            configured.insert(engine.name().to_string(), config);
        }
        Ok(())
    }
}

fn source_digest(source: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hex::encode(hasher.finalize())
}

fn copy_button(document: &mut Document, parent: NodeId, source: &str) -> Result<NodeId, RenderError> {
    let button = document.append_element(
        parent,
        Element::new("button")
            .with_class("diagram__copy")
            .with_attr("type", "button")
            .with_attr("aria-label", "Copy diagram source")
            .with_attr(COPY_SOURCE_ATTR, source)
            .with_attr(COPY_STATE_ATTR, COPY_STATE_IDLE),
    )?;
    document.append_text(button, "Copy source")?;
    Ok(button)
}

fn build_figure(
    document: &mut Document,
    engine: &str,
    source: &str,
    svg: &str,
) -> Result<NodeId, RenderError> {
    let figure = document.create_element(
        Element::new("figure")
            .with_class("diagram")
            .with_attr("data-diagram-engine", engine)
            .with_attr(RENDERED_ATTR, "true")
            .with_attr(OWNER_ATTR, DIAGRAM_OWNER)
            .with_attr(COPY_SOURCE_ATTR, source),
    );
    let toolbar = document.append_element(
        figure,
        Element::new("div")
            .with_class("diagram__toolbar")
            .with_attr("role", "toolbar"),
    )?;
    copy_button(document, toolbar, source)?;

    let file_name = format!("{engine}-{}.svg", &source_digest(source)[..12]);
    let download = document.append_element(
        toolbar,
        Element::new("a")
            .with_class("diagram__download")
            .with_attr("download", file_name)
            .with_attr(
                "href",
                format!("data:image/svg+xml;base64,{}", STANDARD.encode(svg)),
            ),
    )?;
    document.append_text(download, "Download SVG")?;

    let graphic = document.append_element(figure, Element::new("div").with_class("diagram__graphic"))?;
    let markup = document.create_markup(svg);
    document.append_child(graphic, markup)?;
    Ok(figure)
}

fn build_error_panel(
    document: &mut Document,
    engine: &str,
    source: &str,
    message: &str,
) -> Result<NodeId, RenderError> {
    let panel = document.create_element(
        Element::new("div")
            .with_class("diagram")
            .with_class("diagram--error")
            .with_attr("role", "alert")
            .with_attr("data-diagram-engine", engine)
            .with_attr(RENDERED_ATTR, "error")
            .with_attr(OWNER_ATTR, DIAGRAM_OWNER)
            .with_attr(COPY_SOURCE_ATTR, source),
    );
    let toolbar = document.append_element(
        panel,
        Element::new("div")
            .with_class("diagram__toolbar")
            .with_attr("role", "toolbar"),
    )?;
    copy_button(document, toolbar, source)?;

    let title = document.append_element(panel, Element::new("p").with_class("diagram-error__title"))?;
    document.append_text(title, DIAGRAM_ERROR_TITLE)?;
    let detail =
        document.append_element(panel, Element::new("p").with_class("diagram-error__message"))?;
    document.append_text(detail, message)?;
    let pre = document.append_element(
        panel,
        Element::new("pre")
            .with_class("diagram-error__source")
            .with_attr(OWNER_ATTR, DIAGRAM_OWNER),
    )?;
    let code = document.append_element(pre, Element::new("code"))?;
    document.append_text(code, source)?;
    Ok(panel)
}

#[async_trait]
impl Renderer for DiagramRenderer {
    fn name(&self) -> &str {
        "diagram-renderer"
    }

    fn priority(&self) -> i32 {
        PRIORITY
    }

    fn applies(&self, document: &Document, options: &RenderOptions) -> bool {
        !self.pending(document, options).is_empty()
    }

    async fn apply(
        &self,
        document: &mut Document,
        options: &RenderOptions,
    ) -> Result<(), RenderError> {
        let blocks = self.pending(document, options);

        let mut used: Vec<usize> = blocks.iter().map(|block| block.engine).collect();
        used.sort_unstable();
        used.dedup();
        for index in used {
            self.prepare_engine(&self.engines[index], options).await?;
        }

        let mut rendered = 0usize;
        let mut failed = 0usize;
        for block in blocks {
            let engine = Arc::clone(&self.engines[block.engine]);
            if !claim(document, block.node, DIAGRAM_OWNER)? {
                continue;
            }
            let source = block.source.trim_end_matches('\n').to_string();

            let replacement = match engine.render(&source).await {
                Ok(svg) => {
                    rendered += 1;
                    build_figure(document, engine.name(), &source, &svg)?
                }
                Err(err) => {
                    failed += 1;
                    warn!(
                        target = "application::render::diagram",
                        engine = engine.name(),
                        error = %err,
                        "Diagram rendering failed; showing error panel"
                    );
                    build_error_panel(document, engine.name(), &source, &err.to_string())?
                }
            };
            document.replace(block.node, replacement)?;
        }

        debug!(
            target = "application::render::diagram",
            rendered,
            failed,
            "Rendered diagrams"
        );
        Ok(())
    }

    fn dispose(&self) {
        self.configured
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

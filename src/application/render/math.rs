use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use katex::{OptsBuilder, OutputType};
use tracing::{debug, warn};

use crate::domain::document::{Document, Element, NodeId, escape_text};

use super::claim::{claim, claimed_by_other, declared_language};
use super::code::code_blocks;
use super::copy::{COPY_SOURCE_ATTR, COPY_STATE_ATTR, COPY_STATE_IDLE};
use super::options::{MathEngineKind, RenderOptions};
use super::resources::{ResourceLoader, asset_url};
use super::types::{RenderError, Renderer};

pub const MATH_OWNER: &str = "math";
pub const MATH_SOURCE_ATTR: &str = "data-math-source";
pub const RENDERED_ATTR: &str = "data-math-rendered";
pub const ERROR_ATTR: &str = "data-math-error";

const PRIORITY: i32 = 30;
const MATH_LANGUAGES: [&str; 4] = ["math", "latex", "tex", "katex"];

/// A typesetting backend.
pub trait MathEngine: Send + Sync {
    fn kind(&self) -> MathEngineKind;

    /// Runtime asset, relative to the resource base.
    fn asset_path(&self) -> &str;

    fn typeset(
        &self,
        source: &str,
        display: bool,
        macros: &BTreeMap<String, String>,
    ) -> Result<String, String>;
}

/// KaTeX compiled into the binary. The `mathjax` engine choice is served by
/// KaTeX's MathML output.
#[derive(Debug, Clone, Copy)]
pub struct KatexEngine {
    kind: MathEngineKind,
}

impl KatexEngine {
    pub fn new(kind: MathEngineKind) -> Self {
        Self { kind }
    }

    fn output_type(&self) -> OutputType {
        match self.kind {
            MathEngineKind::Katex => OutputType::Html,
            MathEngineKind::Mathjax => OutputType::Mathml,
        }
    }
}

impl MathEngine for KatexEngine {
    fn kind(&self) -> MathEngineKind {
        self.kind
    }

    fn asset_path(&self) -> &str {
        match self.kind {
            MathEngineKind::Katex => "katex/katex.js",
            MathEngineKind::Mathjax => "mathjax/mathjax.js",
        }
    }

    fn typeset(
        &self,
        source: &str,
        display: bool,
        macros: &BTreeMap<String, String>,
    ) -> Result<String, String> {
        let mut builder = OptsBuilder::default();
        builder.display_mode(display);
        builder.output_type(self.output_type());
        let mut opts = builder
            .build()
            .map_err(|err| format!("failed to build KaTeX options: {err}"))?;
        for (name, expansion) in macros {
            opts.add_macro(name.clone(), expansion.clone());
        }
        katex::render_with_opts(source, &opts).map_err(|err| err.to_string())
    }
}

#[derive(Debug, Clone)]
struct MathTarget {
    node: NodeId,
    source: String,
    display: bool,
}

pub struct MathTypesetter {
    loader: Arc<ResourceLoader>,
    engine_override: Option<Arc<dyn MathEngine>>,
}

impl MathTypesetter {
    pub fn new(loader: Arc<ResourceLoader>) -> Self {
        Self {
            loader,
            engine_override: None,
        }
    }

    /// Use `engine` regardless of the configured engine kind.
    pub fn with_engine(loader: Arc<ResourceLoader>, engine: Arc<dyn MathEngine>) -> Self {
        Self {
            loader,
            engine_override: Some(engine),
        }
    }

    fn engine(&self, options: &RenderOptions) -> Arc<dyn MathEngine> {
        self.engine_override
            .clone()
            .unwrap_or_else(|| Arc::new(KatexEngine::new(options.math.engine)))
    }

    fn pending(document: &Document) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = document
            .select(document.root(), is_math_element)
            .into_iter()
            .filter(|node| document.attr(*node, RENDERED_ATTR).is_none())
            .filter(|node| !claimed_by_other(document, *node, MATH_OWNER))
            .collect();

        nodes.extend(
            code_blocks(document)
                .into_iter()
                .filter(|block| {
                    declared_language(document, block.code)
                        .is_some_and(|language| MATH_LANGUAGES.contains(&language.as_str()))
                })
                .filter(|block| !claimed_by_other(document, block.pre, MATH_OWNER))
                .map(|block| block.pre),
        );
        nodes
    }

    /// Resolve a pending node into something to typeset; fenced math blocks
    /// are swapped for a display container first.
    fn target(document: &mut Document, node: NodeId) -> Result<Option<MathTarget>, RenderError> {
        let Some(element) = document.element(node) else {
            return Ok(None);
        };

        if element.tag() == "pre" {
            let source = document.text_content(node).trim_end().to_string();
            let container = document.create_element(
                Element::new("div")
                    .with_class("math")
                    .with_class("math-display")
                    .with_attr(MATH_SOURCE_ATTR, source.clone()),
            );
            document.replace(node, container)?;
            return Ok(Some(MathTarget {
                node: container,
                source,
                display: true,
            }));
        }

        let display = element.tag() == "div"
            || element.has_class("math-display")
            || element.attr("data-math-style") == Some("display");
        let source = match element.attr(MATH_SOURCE_ATTR) {
            Some(source) => source.to_string(),
            None => document.text_content(node),
        };
        Ok(Some(MathTarget {
            node,
            source,
            display,
        }))
    }

    fn typeset_target(
        document: &mut Document,
        engine: &dyn MathEngine,
        target: &MathTarget,
        options: &RenderOptions,
    ) -> Result<bool, RenderError> {
        if !claim(document, target.node, MATH_OWNER)? {
            return Ok(false);
        }
        document.set_attr(target.node, MATH_SOURCE_ATTR, target.source.clone())?;

        if !target.display && !options.math.inline_digit_mode && is_numeric(&target.source) {
            document.set_text(target.node, format!("${}$", target.source))?;
            document.set_attr(target.node, RENDERED_ATTR, "literal")?;
            return Ok(true);
        }

        match engine.typeset(&target.source, target.display, &options.math.macros) {
            Ok(markup) => {
                document.set_markup(target.node, markup)?;
                document.set_attr(target.node, RENDERED_ATTR, "true")?;
                document.set_attr(target.node, COPY_SOURCE_ATTR, target.source.clone())?;
                document.set_attr(target.node, COPY_STATE_ATTR, COPY_STATE_IDLE)?;
                Ok(true)
            }
            Err(message) => {
                warn!(
                    target = "application::render::math",
                    engine = %engine.kind(),
                    display = target.display,
                    error = %message,
                    "Math typesetting failed; leaving error marker"
                );
                document.set_markup(target.node, error_marker(&message, &target.source))?;
                document.set_attr(target.node, RENDERED_ATTR, "true")?;
                document.set_attr(target.node, ERROR_ATTR, "true")?;
                document.set_attr(target.node, COPY_SOURCE_ATTR, target.source.clone())?;
                Ok(false)
            }
        }
    }
}

fn is_math_element(element: &Element) -> bool {
    element.has_class("math")
        || element.has_class("math-inline")
        || element.has_class("math-display")
        || (element.has_attr(MATH_SOURCE_ATTR) && element.tag() != "pre")
}

fn is_numeric(source: &str) -> bool {
    let trimmed = source.trim();
    !trimmed.is_empty()
        && trimmed.chars().any(|ch| ch.is_ascii_digit())
        && trimmed
            .chars()
            .all(|ch| ch.is_ascii_digit() || matches!(ch, '.' | ','))
}

fn error_marker(message: &str, source: &str) -> String {
    format!(
        "<span class=\"math-error\" role=\"alert\"><span class=\"math-error__message\">{}</span> <code class=\"math-error__source\">{}</code></span>",
        escape_text(message),
        escape_text(source)
    )
}

#[async_trait]
impl Renderer for MathTypesetter {
    fn name(&self) -> &str {
        "math-typesetter"
    }

    fn priority(&self) -> i32 {
        PRIORITY
    }

    fn applies(&self, document: &Document, _options: &RenderOptions) -> bool {
        !Self::pending(document).is_empty()
    }

    async fn apply(
        &self,
        document: &mut Document,
        options: &RenderOptions,
    ) -> Result<(), RenderError> {
        let engine = self.engine(options);
        let runtime = asset_url(&options.resource_base, engine.asset_path())?;
        self.loader
            .ensure_script(&runtime, &format!("math-engine-{}", engine.kind()))
            .await?;

        let mut rendered = 0usize;
        let mut failed = 0usize;
        for node in Self::pending(document) {
            let Some(target) = Self::target(document, node)? else {
                continue;
            };
            if Self::typeset_target(document, engine.as_ref(), &target, options)? {
                rendered += 1;
            } else if document.attr(target.node, ERROR_ATTR).is_some() {
                failed += 1;
            }
        }

        debug!(
            target = "application::render::math",
            engine = %engine.kind(),
            rendered,
            failed,
            "Typeset math elements"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::assets::AssetFetcher;

    struct EchoEngine;

    impl MathEngine for EchoEngine {
        fn kind(&self) -> MathEngineKind {
            MathEngineKind::Katex
        }

        fn asset_path(&self) -> &str {
            "katex/katex.js"
        }

        fn typeset(
            &self,
            source: &str,
            display: bool,
            _macros: &BTreeMap<String, String>,
        ) -> Result<String, String> {
            if source.contains("\\broken") {
                return Err("Undefined control sequence: \\broken".to_string());
            }
            Ok(format!("<span class=\"typeset\" data-display=\"{display}\">ok</span>"))
        }
    }

    fn typesetter() -> MathTypesetter {
        let loader = Arc::new(ResourceLoader::new(Arc::new(AssetFetcher::default())));
        MathTypesetter::with_engine(loader, Arc::new(EchoEngine))
    }

    fn math_doc(sources: &[(&str, bool)]) -> (Document, Vec<NodeId>) {
        let mut doc = Document::new();
        let root = doc.root();
        let p = doc.append_element(root, Element::new("p")).expect("p");
        let nodes = sources
            .iter()
            .map(|(source, display)| {
                let element = if *display {
                    Element::new("div").with_class("math").with_class("math-display")
                } else {
                    Element::new("span").with_class("math").with_class("math-inline")
                };
                let node = doc
                    .append_element(p, element.with_attr(MATH_SOURCE_ATTR, *source))
                    .expect("math");
                doc.append_text(node, *source).expect("text");
                node
            })
            .collect();
        (doc, nodes)
    }

    #[tokio::test]
    async fn renders_inline_and_display_math_with_source_for_copy() {
        let (mut doc, nodes) = math_doc(&[("x^2", false), ("\\int_0^1 f", true)]);
        let renderer = typesetter();
        let options = RenderOptions::default();

        renderer.apply(&mut doc, &options).await.expect("apply");

        assert_eq!(doc.attr(nodes[0], RENDERED_ATTR), Some("true"));
        assert_eq!(doc.attr(nodes[0], COPY_SOURCE_ATTR), Some("x^2"));
        assert_eq!(doc.attr(nodes[1], COPY_SOURCE_ATTR), Some("\\int_0^1 f"));
        assert!(doc.inner_html(nodes[1]).contains("data-display=\"true\""));
        assert!(!renderer.applies(&doc, &options));
    }

    #[tokio::test]
    async fn failures_leave_marker_with_source() {
        let (mut doc, nodes) = math_doc(&[("\\broken{<x>}", false)]);
        typesetter()
            .apply(&mut doc, &RenderOptions::default())
            .await
            .expect("failure is contained");

        let html = doc.outer_html(nodes[0]);
        assert!(html.contains("math-error"));
        assert!(html.contains("Undefined control sequence"));
        assert!(html.contains("\\broken{&lt;x&gt;}"));
    }

    #[tokio::test]
    async fn digit_guard_keeps_numeric_inline_math_literal() {
        let (mut doc, nodes) = math_doc(&[("5", false), ("x", false)]);
        let mut options = RenderOptions::default();
        options.math.inline_digit_mode = false;

        typesetter().apply(&mut doc, &options).await.expect("apply");

        assert_eq!(doc.text_content(nodes[0]), "$5$");
        assert_eq!(doc.attr(nodes[0], RENDERED_ATTR), Some("literal"));
        assert_eq!(doc.attr(nodes[1], RENDERED_ATTR), Some("true"));
    }

    #[tokio::test]
    async fn fenced_math_becomes_display_container() {
        let mut doc = Document::new();
        let root = doc.root();
        let pre = doc.append_element(root, Element::new("pre")).expect("pre");
        let code = doc
            .append_element(pre, Element::new("code").with_class("language-math"))
            .expect("code");
        doc.append_text(code, "a+b\n").expect("text");

        typesetter()
            .apply(&mut doc, &RenderOptions::default())
            .await
            .expect("apply");

        assert!(!doc.is_attached(pre));
        let display = doc.select(root, |el| el.has_class("math-display"));
        assert_eq!(display.len(), 1);
        assert_eq!(doc.attr(display[0], MATH_SOURCE_ATTR), Some("a+b"));
    }

    #[test]
    fn katex_engine_reports_parse_errors() {
        let engine = KatexEngine::new(MathEngineKind::Katex);
        assert!(engine.typeset("x^2", false, &BTreeMap::new()).is_ok());
        assert!(engine.typeset("\\frac{", true, &BTreeMap::new()).is_err());
    }
}

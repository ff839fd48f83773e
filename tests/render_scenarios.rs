use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use paperflow::{
    application::render::{
        CodeOptionsPatch, CodeWrapper, DIAGRAM_ERROR_TITLE, DiagramConfig, DiagramEngine,
        DiagramError, DiagramRenderer, MATH_ERROR_ATTR, MATH_RENDERED_ATTR, MathTypesetter,
        Registration, RenderContext, RenderError, RenderOptions, RenderOptionsPatch, Renderer,
        ResourceLoader, SyntaxHighlighter, copy_source, parse_markdown,
    },
    domain::document::Document,
    infra::assets::AssetFetcher,
};

struct BrokenMermaid;

#[async_trait]
impl DiagramEngine for BrokenMermaid {
    fn name(&self) -> &str {
        "mermaid"
    }

    fn languages(&self) -> &[&str] {
        &["mermaid"]
    }

    fn asset_path(&self) -> &str {
        "mermaid/mermaid.js"
    }

    fn configure(&self, _config: &DiagramConfig) -> Result<(), DiagramError> {
        Ok(())
    }

    async fn render(&self, _source: &str) -> Result<String, DiagramError> {
        Err(DiagramError::Render("Parse error on line 1".to_string()))
    }
}

struct FakeMath {
    calls: Arc<Mutex<usize>>,
}

#[async_trait]
impl Renderer for FakeMath {
    fn name(&self) -> &str {
        "math-typesetter"
    }

    fn priority(&self) -> i32 {
        1
    }

    fn applies(&self, _document: &Document, _options: &RenderOptions) -> bool {
        true
    }

    async fn apply(
        &self,
        _document: &mut Document,
        _options: &RenderOptions,
    ) -> Result<(), RenderError> {
        *self.calls.lock().expect("calls") += 1;
        Ok(())
    }
}

fn loader() -> Arc<ResourceLoader> {
    Arc::new(ResourceLoader::new(Arc::new(AssetFetcher::default())))
}

fn context(options: RenderOptions) -> RenderContext {
    let loader = loader();
    let mut context = RenderContext::new(options);
    context.register(Arc::new(CodeWrapper::new()));
    context.register(Arc::new(SyntaxHighlighter::new(Arc::clone(&loader))));
    context.register(Arc::new(MathTypesetter::new(Arc::clone(&loader))));
    context.register(Arc::new(DiagramRenderer::new(
        loader,
        vec![Arc::new(BrokenMermaid)],
    )));
    context
}

#[tokio::test]
async fn python_block_gets_tag_copy_control_and_line_markers() {
    let mut options = RenderOptions::default();
    options.code.line_numbers = true;
    let pipeline = context(options.clone()).pipeline();
    let mut document =
        parse_markdown("```python\nprint(1)\nprint(2)\n```\n", &options.math).expect("parse");

    let report = pipeline.execute(&mut document).await.expect("run");

    assert!(report.is_clean(), "failures: {:?}", report.failures);
    let root = document.root();
    let tag = document.select(root, |element| element.has_class("code-block__language"));
    assert_eq!(document.text_content(tag[0]), "PYTHON");

    let copy = document.select(root, |element| element.has_class("code-block__copy"));
    assert_eq!(copy.len(), 1);
    assert_eq!(
        copy_source(&document, copy[0]).as_deref(),
        Some("print(1)\nprint(2)")
    );

    let markers = document.select(root, |element| element.has_class("line-number"));
    assert_eq!(markers.len(), 2);
}

#[tokio::test]
async fn escaped_code_survives_into_the_copy_source() {
    let options = RenderOptions::default();
    let pipeline = context(options.clone()).pipeline();
    let source = "re.compile(r\"\\(\\d+\\)\")\nname = a\\_b\nmore = r\"\\\\(x\\\\)\"";
    let markdown = format!("Prior work \\[1\\].\n\n```python\n{source}\n```\n");
    let mut document = parse_markdown(&markdown, &options.math).expect("parse");

    pipeline.execute(&mut document).await.expect("run");

    let root = document.root();
    let copy = document.select(root, |element| element.has_class("code-block__copy"));
    assert_eq!(copy_source(&document, copy[0]).as_deref(), Some(source));
    assert!(
        document
            .select(root, |element| element.has_class("math"))
            .is_empty()
    );
    assert!(document.to_html().contains("Prior work [1]."));
}

#[tokio::test]
async fn blank_default_language_leaves_untagged_blocks_bare() {
    let options = RenderOptions::default().merged(&RenderOptionsPatch {
        code: Some(CodeOptionsPatch {
            default_language: Some(Some("  ".into())),
            ..Default::default()
        }),
        ..Default::default()
    });
    let pipeline = context(options.clone()).pipeline();
    let mut document = parse_markdown("```
plain text
```
", &options.math).expect("parse");

    let report = pipeline.execute(&mut document).await.expect("run");

    assert!(report.is_clean(), "failures: {:?}", report.failures);
    let html = document.to_html();
    assert!(html.contains("code-block"), "{html}");
    assert!(html.contains("syntax-lang-text"), "{html}");
    assert!(!html.contains(r#"syntax-lang-""#), "{html}");
    assert!(!html.contains(r#"data-language="""#), "{html}");
    assert!(
        document
            .select(document.root(), |element| element.has_class("code-block__language"))
            .is_empty()
    );
}

#[tokio::test]
async fn math_copies_original_latex() {
    let options = RenderOptions::default();
    let pipeline = context(options.clone()).pipeline();
    let mut document =
        parse_markdown("Inline $x^2$ and\n\n$$\\int_0^1 f$$\n", &options.math).expect("parse");

    pipeline.execute(&mut document).await.expect("run");

    let root = document.root();
    let rendered = document.select(root, |element| {
        element.attr(MATH_RENDERED_ATTR) == Some("true")
    });
    assert_eq!(rendered.len(), 2);
    let sources: Vec<String> = rendered
        .iter()
        .filter_map(|node| copy_source(&document, *node))
        .collect();
    assert_eq!(sources, vec!["x^2".to_string(), "\\int_0^1 f".to_string()]);
}

#[tokio::test]
async fn invalid_math_is_contained_in_place() {
    let options = RenderOptions::default();
    let pipeline = context(options.clone()).pipeline();
    let mut document =
        parse_markdown("Good $a+b$, bad $\\nope{x}$.\n", &options.math).expect("parse");

    let report = pipeline.execute(&mut document).await.expect("run");

    assert!(report.failures.is_empty());
    let root = document.root();
    let errors = document.select(root, |element| element.has_attr(MATH_ERROR_ATTR));
    assert_eq!(errors.len(), 1);
    assert!(document.outer_html(errors[0]).contains("\\nope{x}"));
    let rendered = document.select(root, |element| {
        element.attr(MATH_RENDERED_ATTR) == Some("true") && !element.has_attr(MATH_ERROR_ATTR)
    });
    assert_eq!(rendered.len(), 1);
}

#[tokio::test]
async fn invalid_diagram_becomes_error_panel_with_source() {
    let options = RenderOptions::default();
    let pipeline = context(options.clone()).pipeline();
    let mut document = parse_markdown(
        "```mermaid\ngraph TD; A-->\n```\n\n```rust\nfn main() {}\n```\n",
        &options.math,
    )
    .expect("parse");

    let report = pipeline.execute(&mut document).await.expect("run");

    assert!(report.failures.is_empty());
    let root = document.root();
    let panels = document.select(root, |element| element.has_class("diagram--error"));
    assert_eq!(panels.len(), 1);
    let panel = document.outer_html(panels[0]);
    assert!(panel.contains(DIAGRAM_ERROR_TITLE));
    assert!(panel.contains("Parse error on line 1"));
    assert!(panel.contains("graph TD; A--&gt;"));

    let button = document.select(panels[0], |element| element.has_class("diagram__copy"));
    assert_eq!(
        copy_source(&document, button[0]).as_deref(),
        Some("graph TD; A-->")
    );

    // The rust block after the failed diagram is still enriched.
    let wrapped = document.select(root, |element| element.attr("data-language") == Some("rust"));
    assert!(!wrapped.is_empty());
}

#[tokio::test]
async fn duplicate_math_registration_keeps_the_first() {
    let options = RenderOptions::default();
    let mut context = context(options.clone());
    let calls = Arc::new(Mutex::new(0));

    let registration = context.register(Arc::new(FakeMath {
        calls: Arc::clone(&calls),
    }));

    assert_eq!(registration, Registration::Duplicate);
    let names: Vec<String> = context.describe().into_iter().map(|info| info.name).collect();
    assert_eq!(
        names,
        vec![
            "code-wrapper",
            "syntax-highlighter",
            "math-typesetter",
            "diagram-renderer"
        ]
    );

    let mut document = parse_markdown("$y$\n", &options.math).expect("parse");
    context.pipeline().execute(&mut document).await.expect("run");
    assert_eq!(*calls.lock().expect("calls"), 0);
    assert!(document.to_html().contains(MATH_RENDERED_ATTR));
}

#[tokio::test]
async fn second_pass_is_byte_identical() {
    let options = RenderOptions::default();
    let pipeline = context(options.clone()).pipeline();
    let mut document = parse_markdown(
        "# Title\n\n```python\nx = 1\n```\n\nEuler $e^{i\\pi}$\n\n```mermaid\ngraph TD\n```\n",
        &options.math,
    )
    .expect("parse");

    pipeline.execute(&mut document).await.expect("first");
    let first = document.to_html();
    let second_report = pipeline.execute(&mut document).await.expect("second");

    assert_eq!(document.to_html(), first);
    assert!(second_report.applied.is_empty());
}

use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use syntect::{
    highlighting::ThemeSet,
    html::{ClassStyle, ClassedHTMLGenerator, css_for_theme_with_class_style},
    parsing::{SyntaxReference, SyntaxSet},
    util::LinesWithEndings,
};
use tracing::{debug, warn};

use crate::domain::document::{Document, Element};

use super::code::{CODE_OWNER, CodeBlock, block_language, code_blocks, is_plain_code};
use super::claim::claim;
use super::options::{DEFAULT_CODE_THEME, DEFAULT_DARK_CODE_THEME, RenderOptions, Theme};
use super::resources::{ResourceLoader, asset_url};
use super::types::{RenderError, Renderer};

pub const HIGHLIGHTED_ATTR: &str = "data-highlighted";
pub const ENGINE_RESOURCE_ID: &str = "highlight-engine";
pub const THEME_RESOURCE_ID: &str = "highlight-theme";

const PRIORITY: i32 = 20;
const CLASS_STYLE: ClassStyle = ClassStyle::SpacedPrefixed { prefix: "syntax-" };
const PLAIN_TEXT: &str = "text";

static SYNTAX_SET: Lazy<SyntaxSet> = Lazy::new(SyntaxSet::load_defaults_newlines);
static THEME_SET: Lazy<ThemeSet> = Lazy::new(ThemeSet::load_defaults);

/// Stylesheet for a bundled highlighting theme, with `syntax-` prefixed classes.
pub fn theme_css(name: &str) -> Option<String> {
    let theme = THEME_SET.themes.get(name)?;
    match css_for_theme_with_class_style(theme, CLASS_STYLE) {
        Ok(css) => Some(css),
        Err(err) => {
            warn!(
                target = "application::render::highlight",
                theme = name,
                error = %err,
                "Failed to generate theme stylesheet"
            );
            None
        }
    }
}

/// Highlighting theme in effect: the dark page theme swaps the stock light
/// theme for its dark counterpart unless a theme was chosen explicitly.
pub fn effective_code_theme(options: &RenderOptions) -> &str {
    if options.theme == Theme::Dark && options.code.theme == DEFAULT_CODE_THEME {
        DEFAULT_DARK_CODE_THEME
    } else {
        options.code.theme.as_str()
    }
}

/// Highlight `code` as `language`, falling back to plain text for unknown
/// languages.
pub(crate) fn highlight_code(language: Option<&str>, code: &str) -> Result<String, RenderError> {
    let lang_token = language.unwrap_or(PLAIN_TEXT);
    let syntax =
        find_syntax(&SYNTAX_SET, lang_token).unwrap_or_else(|| SYNTAX_SET.find_syntax_plain_text());

    let mut code_with_newline = code.to_string();
    if !code_with_newline.ends_with('\n') {
        code_with_newline.push('\n');
    }

    let mut generator = ClassedHTMLGenerator::new_with_class_style(syntax, &SYNTAX_SET, CLASS_STYLE);
    for line in LinesWithEndings::from(code_with_newline.as_str()) {
        generator
            .parse_html_for_line_which_includes_newline(line)
            .map_err(|err| RenderError::Highlighting {
                language: lang_token.to_string(),
                message: err.to_string(),
            })?;
    }
    Ok(generator.finalize())
}

/// Source lines shown to the reader; a final newline does not open a new line.
pub(crate) fn count_source_lines(code: &str) -> usize {
    code.lines().count().max(1)
}

fn find_syntax<'a>(syntax_set: &'a SyntaxSet, token: &str) -> Option<&'a SyntaxReference> {
    let lowercase = token.to_ascii_lowercase();
    syntax_set
        .find_syntax_by_token(&lowercase)
        .or_else(|| syntax_set.find_syntax_by_name(token))
        .or_else(|| syntax_set.find_syntax_by_extension(&lowercase))
}

pub struct SyntaxHighlighter {
    loader: Arc<ResourceLoader>,
}

impl SyntaxHighlighter {
    pub fn new(loader: Arc<ResourceLoader>) -> Self {
        Self { loader }
    }

    fn pending(document: &Document) -> Vec<CodeBlock> {
        code_blocks(document)
            .into_iter()
            .filter(|block| document.attr(block.pre, HIGHLIGHTED_ATTR).is_none())
            .filter(|block| is_plain_code(document, *block))
            .collect()
    }

    async fn ensure_assets(&self, options: &RenderOptions) -> Result<(), RenderError> {
        let engine = asset_url(&options.resource_base, "highlight/engine.js")?;
        self.loader.ensure_script(&engine, ENGINE_RESOURCE_ID).await?;

        let theme_path = format!("highlight/themes/{}.css", effective_code_theme(options));
        let theme = asset_url(&options.resource_base, &theme_path)?;
        self.loader.ensure_style(&theme, THEME_RESOURCE_ID).await?;
        Ok(())
    }

    fn highlight_block(
        document: &mut Document,
        block: CodeBlock,
        options: &RenderOptions,
    ) -> Result<(), RenderError> {
        claim(document, block.pre, CODE_OWNER)?;
        let language =
            block_language(document, block).or_else(|| options.code.fallback_language());
        let source = document.text_content(block.code);

        // Marked before highlighting so a failing block is not retried forever.
        document.set_attr(block.pre, HIGHLIGHTED_ATTR, "true")?;
        let highlighted = highlight_code(language.as_deref(), &source)?;

        let lang_token = language.as_deref().unwrap_or(PLAIN_TEXT);
        document.set_markup(block.code, highlighted)?;
        if let Some(code) = document.element_mut(block.code) {
            code.add_class("syntax-code");
        }
        if let Some(pre) = document.element_mut(block.pre) {
            pre.add_class("syntax-highlight");
            pre.add_class(&format!("syntax-lang-{lang_token}"));
            pre.set_attr("data-language", lang_token);
        }

        if options.code.line_numbers {
            let gutter = document.create_element(
                Element::new("span")
                    .with_class("line-numbers")
                    .with_attr("aria-hidden", "true"),
            );
            for number in 1..=count_source_lines(&source) {
                let marker = document.append_element(
                    gutter,
                    Element::new("span").with_class("line-number"),
                )?;
                document.append_text(marker, number.to_string())?;
            }
            if block.code == block.pre {
                document.append_child(block.pre, gutter)?;
            } else {
                document.insert_before(block.code, gutter)?;
            }
            if let Some(pre) = document.element_mut(block.pre) {
                pre.add_class("line-numbers-enabled");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Renderer for SyntaxHighlighter {
    fn name(&self) -> &str {
        "syntax-highlighter"
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
        self.ensure_assets(options).await?;

        let mut first_error = None;
        let mut highlighted = 0usize;
        for block in Self::pending(document) {
            match Self::highlight_block(document, block, options) {
                Ok(()) => highlighted += 1,
                Err(err) => {
                    warn!(
                        target = "application::render::highlight",
                        error = %err,
                        "Leaving code block unhighlighted"
                    );
                    first_error.get_or_insert(err);
                }
            }
        }
        debug!(
            target = "application::render::highlight",
            highlighted,
            theme = effective_code_theme(options),
            "Highlighted code blocks"
        );
        first_error.map_or(Ok(()), Err)
    }
}

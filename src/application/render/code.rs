//! Code block chrome: container, language tag and copy control.

use async_trait::async_trait;
use tracing::debug;

use crate::domain::document::{Document, Element, NodeId};

use super::claim::{claim, claimed_by_other, declared_language, is_reserved_language};
use super::copy::{COPY_SOURCE_ATTR, COPY_STATE_ATTR, COPY_STATE_IDLE, normalize_copy_text};
use super::options::RenderOptions;
use super::types::{RenderError, Renderer};

pub const CODE_OWNER: &str = "code";
pub const WRAPPED_ATTR: &str = "data-code-wrapped";

const PRIORITY: i32 = 10;

/// A `pre` block together with the element holding its source.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CodeBlock {
    pub(crate) pre: NodeId,
    pub(crate) code: NodeId,
}

/// Every `pre` block in document order, paired with its `code` child when it
/// has one.
pub(crate) fn code_blocks(document: &Document) -> Vec<CodeBlock> {
    document
        .select(document.root(), |element| element.tag() == "pre")
        .into_iter()
        .map(|pre| CodeBlock {
            pre,
            code: code_element(document, pre),
        })
        .collect()
}

/// The `code` child of a `pre`, or the `pre` itself when it has none.
pub(crate) fn code_element(document: &Document, pre: NodeId) -> NodeId {
    document
        .children(pre)
        .iter()
        .copied()
        .find(|child| document.element(*child).is_some_and(|el| el.tag() == "code"))
        .unwrap_or(pre)
}

/// Language of a block: declared on the `code` element, then on the `pre`.
pub(crate) fn block_language(document: &Document, block: CodeBlock) -> Option<String> {
    declared_language(document, block.code).or_else(|| declared_language(document, block.pre))
}

/// Blocks the code renderers may touch: not owned elsewhere and not written
/// in a math or diagram language.
pub(crate) fn is_plain_code(document: &Document, block: CodeBlock) -> bool {
    if claimed_by_other(document, block.pre, CODE_OWNER) {
        return false;
    }
    block_language(document, block).is_none_or(|language| !is_reserved_language(&language))
}

#[derive(Debug, Default)]
pub struct CodeWrapper;

impl CodeWrapper {
    pub fn new() -> Self {
        Self
    }

    fn pending(document: &Document) -> Vec<CodeBlock> {
        code_blocks(document)
            .into_iter()
            .filter(|block| document.attr(block.pre, WRAPPED_ATTR).is_none())
            .filter(|block| is_plain_code(document, *block))
            .collect()
    }

    fn wrap_block(
        document: &mut Document,
        block: CodeBlock,
        options: &RenderOptions,
    ) -> Result<(), RenderError> {
        if !claim(document, block.pre, CODE_OWNER)? {
            return Ok(());
        }

        let language =
            block_language(document, block).or_else(|| options.code.fallback_language());
        let source = normalize_copy_text(&document.text_content(block.code));

        let mut container = Element::new("div").with_class("code-block");
        if let Some(language) = language.as_deref() {
            container.set_attr("data-language", language);
        }
        let container = document.wrap(block.pre, container)?;

        let header = document.create_element(Element::new("div").with_class("code-block__header"));
        document.insert_before(block.pre, header)?;

        if let Some(language) = language.as_deref() {
            let tag = document.append_element(
                header,
                Element::new("span").with_class("code-block__language"),
            )?;
            document.append_text(tag, language.to_uppercase())?;
        }

        if options.code.copy_button {
            let button = document.append_element(
                header,
                Element::new("button")
                    .with_class("code-block__copy")
                    .with_attr("type", "button")
                    .with_attr("aria-label", "Copy code")
                    .with_attr(COPY_SOURCE_ATTR, source)
                    .with_attr(COPY_STATE_ATTR, COPY_STATE_IDLE),
            )?;
            document.append_text(button, "Copy")?;
        }

        document.set_attr(block.pre, WRAPPED_ATTR, "true")?;
        debug!(
            target = "application::render::code",
            container = container.index(),
            language = language.as_deref().unwrap_or("none"),
            "Wrapped code block"
        );
        Ok(())
    }
}

#[async_trait]
impl Renderer for CodeWrapper {
    fn name(&self) -> &str {
        "code-wrapper"
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
        for block in Self::pending(document) {
            Self::wrap_block(document, block, options)?;
        }
        Ok(())
    }
}

//! Markdown source conversion into the content tree.
//!
//! comrak parses the markdown; the AST is then walked into a [`Document`] so
//! the renderers find the structure they look for: `pre > code.language-*`
//! blocks, `span.math` / `div.math` elements carrying their TeX source, and
//! headings with unique anchors. Nodes without a dedicated mapping are
//! rendered through comrak's HTML formatter and kept as sanitised markup.

use std::collections::HashSet;

use ammonia::Builder as AmmoniaBuilder;
use comrak::nodes::{AstNode, ListType, NodeValue};
use comrak::options::{ListStyleType, Options};
use comrak::{Arena, format_html, parse_document};
use url::Url;

use crate::domain::document::{Document, Element, NodeId};
use crate::domain::slug::AnchorSlugger;

use super::math::MATH_SOURCE_ATTR;
use super::options::MathOptions;
use super::types::RenderError;

const ALLOWED_URL_SCHEMES: [&str; 4] = ["http", "https", "mailto", "tel"];

const DELIMITER_REPLACEMENTS: [(&str, &str); 9] = [
    (r"\\\\[", "$$"),
    (r"\\\\]", "$$"),
    (r"\\[", "$$"),
    (r"\\]", "$$"),
    (r"\\\\(", "$"),
    (r"\\\\)", "$"),
    (r"\\(", "$"),
    (r"\\)", "$"),
    (r"\\_", "_"),
];

/// Rewrite escaped TeX delimiters into the dollar forms comrak understands.
///
/// Only the doubled and quadrupled backslash forms are rewritten: `\\[ \\]`
/// become `$$`, `\\( \\)` become `$` and `\\_` becomes `_`. A single
/// backslash is an ordinary markdown escape and is left alone, so `\[1\]`
/// stays a bracketed citation. Fenced code blocks and inline code spans pass
/// through untouched.
pub fn normalize_math_delimiters(markdown: &str) -> String {
    let mut output = String::with_capacity(markdown.len());
    let mut fence: Option<(char, usize)> = None;

    for line in markdown.split_inclusive('\n') {
        if let Some((marker, width)) = fence {
            if closes_fence(line, marker, width) {
                fence = None;
            }
            output.push_str(line);
            continue;
        }
        if let Some(opened) = opening_fence(line) {
            fence = Some(opened);
            output.push_str(line);
            continue;
        }
        normalize_outside_code_spans(line, &mut output);
    }
    output
}

fn replace_delimiters(text: &str) -> String {
    DELIMITER_REPLACEMENTS
        .iter()
        .fold(text.to_string(), |text, (from, to)| text.replace(from, to))
}

/// Splits a fence line into its marker, run width and trailing text.
fn fence_marker(line: &str) -> Option<(char, usize, &str)> {
    let trimmed = line.trim_start_matches(' ');
    if line.len() - trimmed.len() > 3 {
        return None;
    }
    let marker = trimmed.chars().next().filter(|c| *c == '`' || *c == '~')?;
    let width = trimmed.chars().take_while(|c| *c == marker).count();
    (width >= 3).then(|| (marker, width, &trimmed[width..]))
}

fn opening_fence(line: &str) -> Option<(char, usize)> {
    let (marker, width, info) = fence_marker(line)?;
    if marker == '`' && info.contains('`') {
        return None;
    }
    Some((marker, width))
}

fn closes_fence(line: &str, marker: char, width: usize) -> bool {
    fence_marker(line)
        .is_some_and(|(found, run, rest)| found == marker && run >= width && rest.trim().is_empty())
}

fn backtick_run(text: &str) -> usize {
    text.bytes().take_while(|byte| *byte == b'`').count()
}

fn closing_backticks(text: &str, width: usize) -> Option<usize> {
    let mut offset = 0;
    while let Some(found) = text[offset..].find('`') {
        let at = offset + found;
        let run = backtick_run(&text[at..]);
        if run == width {
            return Some(at);
        }
        offset = at + run;
    }
    None
}

fn normalize_outside_code_spans(line: &str, output: &mut String) {
    let mut rest = line;
    while let Some(start) = rest.find('`') {
        let run = backtick_run(&rest[start..]);
        let after = &rest[start + run..];
        match closing_backticks(after, run) {
            Some(close) => {
                let span_end = start + run + close + run;
                output.push_str(&replace_delimiters(&rest[..start]));
                output.push_str(&rest[start..span_end]);
                rest = &rest[span_end..];
            }
            None => {
                output.push_str(&replace_delimiters(&rest[..start + run]));
                rest = after;
            }
        }
    }
    output.push_str(&replace_delimiters(rest));
}

fn comrak_options() -> Options<'static> {
    let mut options = Options::default();
    let ext = &mut options.extension;
    ext.strikethrough = true;
    ext.table = true;
    ext.autolink = true;
    ext.tasklist = true;
    ext.superscript = true;
    ext.footnotes = true;
    ext.description_lists = true;
    ext.front_matter_delimiter = Some("---".to_string());
    ext.alerts = true;
    ext.math_dollars = true;
    ext.math_code = true;

    let render = &mut options.render;
    render.github_pre_lang = true;
    render.full_info_string = true;
    render.tasklist_classes = true;
    render.list_style = ListStyleType::Dash;
    render.r#unsafe = true;
    render.sourcepos = false;
    options
}

fn sanitizer() -> AmmoniaBuilder<'static> {
    let mut builder = AmmoniaBuilder::default();
    builder.add_tags(&["figure", "figcaption", "details", "summary", "section", "input"]);
    builder.add_generic_attributes(&["class", "id"]);
    builder.add_generic_attribute_prefixes(&["data-"]);
    builder.add_tag_attributes("input", &["type", "checked", "disabled"]);
    builder.url_schemes(ALLOWED_URL_SCHEMES.iter().copied().collect::<HashSet<_>>());
    builder
}

/// Parse `markdown` into a fresh content tree.
pub fn parse_markdown(markdown: &str, math: &MathOptions) -> Result<Document, RenderError> {
    let source = if math.normalize_delimiters {
        normalize_math_delimiters(markdown)
    } else {
        markdown.to_string()
    };

    let options = comrak_options();
    let arena = Arena::new();
    let root = parse_document(&arena, &source, &options);

    let sanitizer = sanitizer();
    let mut converter = Converter {
        document: Document::new(),
        slugger: AnchorSlugger::new(),
        headings: 0,
        options: &options,
        sanitizer: &sanitizer,
    };
    let target = converter.document.root();
    converter.convert_children(root, target)?;
    Ok(converter.document)
}

struct Converter<'o> {
    document: Document,
    slugger: AnchorSlugger,
    headings: usize,
    options: &'o Options<'static>,
    sanitizer: &'o AmmoniaBuilder<'static>,
}

impl Converter<'_> {
    fn convert_children<'a>(
        &mut self,
        node: &'a AstNode<'a>,
        parent: NodeId,
    ) -> Result<(), RenderError> {
        for child in node.children() {
            self.convert(child, parent)?;
        }
        Ok(())
    }

    fn container<'a>(
        &mut self,
        node: &'a AstNode<'a>,
        parent: NodeId,
        element: Element,
    ) -> Result<NodeId, RenderError> {
        let id = self.document.append_element(parent, element)?;
        self.convert_children(node, id)?;
        Ok(id)
    }

    fn convert<'a>(&mut self, node: &'a AstNode<'a>, parent: NodeId) -> Result<(), RenderError> {
        let value = node.data.borrow().value.clone();
        match value {
            NodeValue::Document => self.convert_children(node, parent)?,
            NodeValue::FrontMatter(_) => {}
            NodeValue::Paragraph if in_tight_list(node) => self.convert_children(node, parent)?,
            NodeValue::Paragraph => {
                self.container(node, parent, Element::new("p"))?;
            }
            NodeValue::BlockQuote => {
                self.container(node, parent, Element::new("blockquote"))?;
            }
            NodeValue::List(list) => {
                let element = if list.list_type == ListType::Ordered {
                    let element = Element::new("ol");
                    if list.start != 1 {
                        element.with_attr("start", list.start.to_string())
                    } else {
                        element
                    }
                } else {
                    Element::new("ul")
                };
                self.container(node, parent, element)?;
            }
            NodeValue::Item(_) => {
                self.container(node, parent, Element::new("li"))?;
            }
            NodeValue::Heading(heading) => {
                let text = collect_inline_text(node);
                let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
                let anchor = self
                    .slugger
                    .anchor_or_positional(normalized.trim(), self.headings);
                self.headings += 1;
                self.container(
                    node,
                    parent,
                    Element::new(format!("h{}", heading.level)).with_attr("id", anchor),
                )?;
            }
            NodeValue::ThematicBreak => {
                self.document.append_element(parent, Element::new("hr"))?;
            }
            NodeValue::CodeBlock(block) => {
                let info = block.info.trim();
                let (language, meta) = match info.split_once(char::is_whitespace) {
                    Some((language, meta)) => (language, meta.trim()),
                    None => (info, ""),
                };
                let pre = self.document.append_element(parent, Element::new("pre"))?;
                let mut code = Element::new("code");
                if !language.is_empty() {
                    code.add_class(&format!("language-{}", language.to_ascii_lowercase()));
                }
                if !meta.is_empty() {
                    code.set_attr("data-meta", meta);
                }
                let code = self.document.append_element(pre, code)?;
                self.document.append_text(code, block.literal.clone())?;
            }
            NodeValue::HtmlBlock(block) => {
                let markup = self.sanitizer.clean(&block.literal).to_string();
                let markup = self.document.create_markup(markup);
                self.document.append_child(parent, markup)?;
            }
            NodeValue::HtmlInline(raw) => {
                let markup = self.sanitizer.clean(&raw).to_string();
                let markup = self.document.create_markup(markup);
                self.document.append_child(parent, markup)?;
            }
            NodeValue::Text(text) => {
                self.document.append_text(parent, text.to_string())?;
            }
            NodeValue::Code(code) => {
                let element = self.document.append_element(parent, Element::new("code"))?;
                self.document.append_text(element, code.literal.clone())?;
            }
            NodeValue::SoftBreak => {
                self.document.append_text(parent, "\n")?;
            }
            NodeValue::LineBreak => {
                self.document.append_element(parent, Element::new("br"))?;
            }
            NodeValue::Emph => {
                self.container(node, parent, Element::new("em"))?;
            }
            NodeValue::Strong => {
                self.container(node, parent, Element::new("strong"))?;
            }
            NodeValue::Strikethrough => {
                self.container(node, parent, Element::new("del"))?;
            }
            NodeValue::Superscript => {
                self.container(node, parent, Element::new("sup"))?;
            }
            NodeValue::Link(link) => {
                let mut element = Element::new("a");
                if is_allowed_url(&link.url) {
                    element.set_attr("href", link.url.clone());
                }
                if !link.title.is_empty() {
                    element.set_attr("title", link.title.clone());
                }
                self.container(node, parent, element)?;
            }
            NodeValue::Image(link) => {
                let mut element = Element::new("img").with_attr("alt", collect_inline_text(node));
                if is_allowed_url(&link.url) {
                    element.set_attr("src", link.url.clone());
                }
                if !link.title.is_empty() {
                    element.set_attr("title", link.title.clone());
                }
                self.document.append_element(parent, element)?;
            }
            NodeValue::Table(_) => self.convert_table(node, parent)?,
            NodeValue::Math(math) => {
                let element = if math.display_math {
                    Element::new("div")
                        .with_class("math")
                        .with_class("math-display")
                } else {
                    Element::new("span")
                        .with_class("math")
                        .with_class("math-inline")
                };
                let element = self
                    .document
                    .append_element(parent, element.with_attr(MATH_SOURCE_ATTR, math.literal.clone()))?;
                self.document.append_text(element, math.literal.clone())?;
            }
            _ => self.convert_fallback(node, parent)?,
        }
        Ok(())
    }

    fn convert_table<'a>(
        &mut self,
        node: &'a AstNode<'a>,
        parent: NodeId,
    ) -> Result<(), RenderError> {
        let table = self.document.append_element(parent, Element::new("table"))?;
        let mut body: Option<NodeId> = None;
        for row in node.children() {
            let header = matches!(row.data.borrow().value, NodeValue::TableRow(true));
            let section = if header {
                self.document.append_element(table, Element::new("thead"))?
            } else {
                match body {
                    Some(body) => body,
                    None => {
                        let created = self.document.append_element(table, Element::new("tbody"))?;
                        body = Some(created);
                        created
                    }
                }
            };
            let tr = self.document.append_element(section, Element::new("tr"))?;
            let cell_tag = if header { "th" } else { "td" };
            for cell in row.children() {
                self.container(cell, tr, Element::new(cell_tag))?;
            }
        }
        Ok(())
    }

    fn convert_fallback<'a>(
        &mut self,
        node: &'a AstNode<'a>,
        parent: NodeId,
    ) -> Result<(), RenderError> {
        let mut html = String::new();
        format_html(node, self.options, &mut html).map_err(|err| RenderError::Markdown {
            message: err.to_string(),
        })?;
        let markup = self.sanitizer.clean(&html).to_string();
        let markup = self.document.create_markup(markup);
        self.document.append_child(parent, markup)?;
        Ok(())
    }
}

fn is_allowed_url(raw: &str) -> bool {
    match Url::parse(raw) {
        Ok(url) => ALLOWED_URL_SCHEMES.contains(&url.scheme()),
        // relative references
        Err(_) => true,
    }
}

fn in_tight_list(paragraph: &AstNode<'_>) -> bool {
    paragraph
        .parent()
        .and_then(|item| item.parent())
        .is_some_and(|list| matches!(&list.data.borrow().value, NodeValue::List(list) if list.tight))
}

fn collect_inline_text<'a>(node: &'a AstNode<'a>) -> String {
    fn walk<'a>(node: &'a AstNode<'a>, buffer: &mut String) {
        match &node.data.borrow().value {
            NodeValue::Text(text) => buffer.push_str(text),
            NodeValue::Code(code) => buffer.push_str(&code.literal),
            NodeValue::Math(math) => buffer.push_str(&math.literal),
            NodeValue::LineBreak | NodeValue::SoftBreak => buffer.push(' '),
            _ => {}
        }
        for child in node.children() {
            walk(child, buffer);
        }
    }

    let mut text = String::new();
    for child in node.children() {
        walk(child, &mut text);
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(markdown: &str) -> Document {
        parse_markdown(markdown, &MathOptions::default()).expect("parse")
    }

    #[test]
    fn headings_get_unique_anchors() {
        let doc = parse("# Intro\n\n## Intro\n\n## 基线对齐\n");
        let ids: Vec<String> = doc
            .select(doc.root(), |element| element.heading_level().is_some())
            .into_iter()
            .filter_map(|node| doc.attr(node, "id").map(str::to_string))
            .collect();
        assert_eq!(ids, vec!["intro", "intro-2", "ji-xian-dui-qi"]);
    }

    #[test]
    fn fenced_code_keeps_language_and_meta() {
        let doc = parse("```Rust title=main.rs\nfn main() {}\n```\n");
        let html = doc.to_html();
        assert!(
            html.contains(r#"<pre><code class="language-rust" data-meta="title=main.rs">fn main() {}"#),
            "{html}"
        );
    }

    #[test]
    fn dollar_math_becomes_math_elements() {
        let doc = parse("Energy $E=mc^2$ and\n\n$$\n\\int_0^1 x\\,dx\n$$\n");
        let inline = doc.select(doc.root(), |element| element.has_class("math-inline"));
        let display = doc.select(doc.root(), |element| element.has_class("math-display"));

        assert_eq!(inline.len(), 1);
        assert_eq!(doc.attr(inline[0], MATH_SOURCE_ATTR), Some("E=mc^2"));
        assert_eq!(display.len(), 1);
        assert_eq!(doc.element(display[0]).map(Element::tag), Some("div"));
    }

    #[test]
    fn escaped_delimiters_are_normalized() {
        assert_eq!(normalize_math_delimiters(r"\\(a_1\\)"), "$a_1$");
        assert_eq!(normalize_math_delimiters(r"\\\\[x\\\\]"), "$$x$$");
        assert_eq!(normalize_math_delimiters(r"a\\_b"), "a_b");

        let doc = parse(r"Inline \\(x^2\\) here");
        assert_eq!(
            doc.select(doc.root(), |element| element.has_class("math-inline"))
                .len(),
            1
        );
    }

    #[test]
    fn single_backslash_citations_stay_text() {
        let markdown = r"Prior work \[1\] and \[2\] shows this.";
        assert_eq!(normalize_math_delimiters(markdown), markdown);

        let doc = parse(markdown);
        assert!(
            doc.select(doc.root(), |element| element.has_class("math"))
                .is_empty()
        );
        assert_eq!(
            doc.text_content(doc.root()),
            "Prior work [1] and [2] shows this."
        );
    }

    #[test]
    fn code_is_not_normalized() {
        let markdown = "```python\nre.compile(r\"\\\\(\\d+\\\\)\")\nname = a\\\\_b\n```\n\nUse `\\\\(x\\\\)` or \\\\(y\\\\).\n";
        let normalized = normalize_math_delimiters(markdown);
        assert!(normalized.contains("re.compile(r\"\\\\(\\d+\\\\)\")\nname = a\\\\_b\n"));
        assert!(normalized.contains("`\\\\(x\\\\)`"));
        assert!(normalized.ends_with("or $y$.\n"));

        let doc = parse(markdown);
        let code = doc.select(doc.root(), |element| element.tag() == "pre");
        assert_eq!(
            doc.text_content(code[0]),
            "re.compile(r\"\\\\(\\d+\\\\)\")\nname = a\\\\_b\n"
        );
    }

    #[test]
    fn tilde_fences_close_on_matching_marker() {
        let markdown = "~~~~\n\\\\[a\\\\]\n```\n\\\\[b\\\\]\n~~~~\n\\\\[c\\\\]\n";
        assert_eq!(
            normalize_math_delimiters(markdown),
            "~~~~\n\\\\[a\\\\]\n```\n\\\\[b\\\\]\n~~~~\n$$c$$\n"
        );
    }

    #[test]
    fn raw_html_is_sanitized() {
        let doc = parse("<div class=\"note\"><script>alert(1)</script>kept</div>\n");
        let html = doc.to_html();
        assert!(html.contains("kept"), "{html}");
        assert!(!html.contains("<script"), "{html}");
    }

    #[test]
    fn tables_split_head_and_body() {
        let doc = parse("| a | b |\n|---|---|\n| 1 | 2 |\n");
        let html = doc.to_html();
        assert!(html.contains("<thead><tr><th>a</th><th>b</th></tr></thead>"), "{html}");
        assert!(html.contains("<tbody><tr><td>1</td><td>2</td></tr></tbody>"), "{html}");
    }

    #[test]
    fn tight_lists_skip_paragraphs() {
        let doc = parse("1. one\n2. two\n");
        assert_eq!(doc.to_html(), "<ol><li>one</li><li>two</li></ol>");
    }

    #[test]
    fn script_urls_are_dropped() {
        let doc = parse("[x](javascript:alert(1)) [y](/docs)");
        let html = doc.to_html();
        assert!(!html.contains("javascript:"), "{html}");
        assert!(html.contains(r#"href="/docs""#), "{html}");
    }
}

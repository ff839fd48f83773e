//! Heading outline derived from rendered content.

use serde::Serialize;
use thiserror::Error;

use crate::application::render::MATH_SOURCE_ATTR;
use crate::domain::document::{
    Document, DocumentError, NodeData, NodeId, escape_attribute, escape_text,
};
use crate::domain::slug::AnchorSlugger;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TocError {
    #[error("no outline entry with id `{id}`")]
    UnknownItem { id: String },
    #[error(transparent)]
    Document(#[from] DocumentError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TocItem {
    pub id: String,
    pub text: String,
    pub level: u8,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TocItem>,
}

/// Flattened nesting walk, suitable for streaming list markup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TocEvent {
    StartList,
    EndList,
    StartItem { id: String, text: String, level: u8 },
    EndItem,
}

/// Scan `h1`..`h6` below `scope` in document order.
///
/// Headings without an id get `heading-<index>`, where the index counts
/// headings from zero; ids already present in the scope are never reused.
/// A scope that is not attached to the document yields an empty outline.
pub fn scan_headings(
    document: &mut Document,
    scope: NodeId,
) -> Result<Vec<TocItem>, DocumentError> {
    if !document.is_attached(scope) {
        return Ok(Vec::new());
    }

    let headings = document.select(scope, |element| element.heading_level().is_some());
    let mut slugger = AnchorSlugger::new();
    for node in document.descendants(scope) {
        if let Some(id) = document.attr(node, "id")
            && !id.is_empty()
        {
            slugger.reserve(id);
        }
    }

    let mut items = Vec::with_capacity(headings.len());
    for (index, node) in headings.into_iter().enumerate() {
        let Some(level) = document.element(node).and_then(|element| element.heading_level())
        else {
            continue;
        };
        let id = match document.attr(node, "id") {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => {
                let id = slugger.positional(index);
                document.set_attr(node, "id", id.clone())?;
                id
            }
        };
        items.push(TocItem {
            id,
            text: heading_text(document, node),
            level,
            children: Vec::new(),
        });
    }
    Ok(items)
}

/// Visible heading text with whitespace collapsed. Typeset math contributes
/// its source so the text is stable across render passes.
fn heading_text(document: &Document, heading: NodeId) -> String {
    fn walk(document: &Document, node: NodeId, buffer: &mut String) {
        match document.data(node) {
            Some(NodeData::Text(text)) => buffer.push_str(text),
            Some(NodeData::Element(element)) => {
                if let Some(source) = element.attr(MATH_SOURCE_ATTR) {
                    buffer.push_str(source);
                    return;
                }
                for child in document.children(node) {
                    walk(document, *child, buffer);
                }
            }
            Some(NodeData::Markup(_)) | None => {}
        }
    }

    let mut text = String::new();
    walk(document, heading, &mut text);
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Parent index for each item: the closest preceding item with a lower level.
fn compute_parent_indices(items: &[TocItem]) -> Vec<Option<usize>> {
    let mut parent_indices = vec![None; items.len()];
    let mut stack: Vec<(u8, usize)> = Vec::new();

    for (idx, item) in items.iter().enumerate() {
        while let Some(&(level, _)) = stack.last() {
            if level < item.level {
                break;
            }
            stack.pop();
        }
        parent_indices[idx] = stack.last().map(|&(_, parent_idx)| parent_idx);
        stack.push((item.level, idx));
    }

    parent_indices
}

/// Nest a flat outline under the closest lower-level predecessors.
pub fn nest(items: &[TocItem]) -> Vec<TocItem> {
    let parents = compute_parent_indices(items);
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); items.len()];
    let mut roots = Vec::new();
    for (idx, parent) in parents.iter().enumerate() {
        match parent {
            Some(parent) => children[*parent].push(idx),
            None => roots.push(idx),
        }
    }

    fn build(idx: usize, items: &[TocItem], children: &[Vec<usize>]) -> TocItem {
        TocItem {
            children: children[idx]
                .iter()
                .map(|child| build(*child, items, children))
                .collect(),
            ..items[idx].clone()
        }
    }

    roots
        .into_iter()
        .map(|idx| build(idx, items, &children))
        .collect()
}

pub fn toc_events(nested: &[TocItem]) -> Vec<TocEvent> {
    fn append(nodes: &[TocItem], events: &mut Vec<TocEvent>) {
        events.push(TocEvent::StartList);
        for node in nodes {
            events.push(TocEvent::StartItem {
                id: node.id.clone(),
                text: node.text.trim().to_string(),
                level: node.level,
            });
            if !node.children.is_empty() {
                append(&node.children, events);
            }
            events.push(TocEvent::EndItem);
        }
        events.push(TocEvent::EndList);
    }

    let mut events = Vec::new();
    if !nested.is_empty() {
        append(nested, &mut events);
    }
    events
}

/// Nested `<ul>` outline with one link per heading; `None` when there are no
/// headings.
pub fn render_outline_html(items: &[TocItem], active: Option<&str>) -> Option<String> {
    if items.is_empty() {
        return None;
    }

    let mut html = String::from("<nav class=\"toc\" aria-label=\"Table of contents\">");
    for event in toc_events(&nest(items)) {
        match event {
            TocEvent::StartList => html.push_str("<ul class=\"toc__list\">"),
            TocEvent::EndList => html.push_str("</ul>"),
            TocEvent::StartItem { id, text, level } => {
                let active_class = if active == Some(id.as_str()) {
                    " toc__item--active"
                } else {
                    ""
                };
                html.push_str(&format!(
                    "<li class=\"toc__item toc__item--h{level}{active_class}\"><a href=\"#{}\">{}</a>",
                    escape_attribute(&id),
                    escape_text(&text)
                ));
            }
            TocEvent::EndItem => html.push_str("</li>"),
        }
    }
    html.push_str("</nav>");
    Some(html)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::document::Element;

    fn doc_with_levels(levels: &[u8]) -> Document {
        let mut doc = Document::new();
        let root = doc.root();
        for (index, level) in levels.iter().enumerate() {
            let heading = doc
                .append_element(root, Element::new(format!("h{level}")))
                .expect("heading");
            doc.append_text(heading, format!("Heading {index}"))
                .expect("text");
        }
        doc
    }

    #[test]
    fn missing_ids_get_positional_anchors() {
        let mut doc = doc_with_levels(&[1, 2, 2, 3, 1]);
        let root = doc.root();
        let items = scan_headings(&mut doc, root).expect("scan");

        let ids: Vec<&str> = items.iter().map(|item| item.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["heading-0", "heading-1", "heading-2", "heading-3", "heading-4"]
        );
        let levels: Vec<u8> = items.iter().map(|item| item.level).collect();
        assert_eq!(levels, vec![1, 2, 2, 3, 1]);
        assert!(doc.to_html().contains(r#"<h3 id="heading-3">"#));
    }

    #[test]
    fn existing_ids_are_kept_and_never_duplicated() {
        let mut doc = Document::new();
        let root = doc.root();
        doc.append_element(root, Element::new("h2").with_attr("id", "heading-1"))
            .expect("h2");
        doc.append_element(root, Element::new("h2")).expect("h2");

        let items = scan_headings(&mut doc, root).expect("scan");
        assert_eq!(items[0].id, "heading-1");
        assert_eq!(items[1].id, "heading-1-2");
    }

    #[test]
    fn detached_scope_is_empty() {
        let mut doc = doc_with_levels(&[1]);
        let orphan = doc.create_element(Element::new("section"));
        assert!(scan_headings(&mut doc, orphan).expect("scan").is_empty());
    }

    #[test]
    fn nesting_follows_levels() {
        let mut doc = doc_with_levels(&[1, 2, 2, 3, 1]);
        let root = doc.root();
        let items = scan_headings(&mut doc, root).expect("scan");
        let nested = nest(&items);

        assert_eq!(nested.len(), 2);
        assert_eq!(nested[0].children.len(), 2);
        assert_eq!(nested[0].children[1].children[0].id, "heading-3");
        assert!(nested[1].children.is_empty());
    }

    #[test]
    fn math_headings_use_source_text() {
        let mut doc = Document::new();
        let root = doc.root();
        let heading = doc.append_element(root, Element::new("h2")).expect("h2");
        doc.append_text(heading, "Bound ").expect("text");
        let math = doc
            .append_element(
                heading,
                Element::new("span")
                    .with_class("math")
                    .with_attr(MATH_SOURCE_ATTR, "O(n)"),
            )
            .expect("math");
        doc.set_markup(math, "<span class=\"katex\">…</span>")
            .expect("markup");

        let items = scan_headings(&mut doc, root).expect("scan");
        assert_eq!(items[0].text, "Bound O(n)");
    }

    #[test]
    fn outline_html_marks_active_item() {
        let mut doc = doc_with_levels(&[1, 2]);
        let root = doc.root();
        let items = scan_headings(&mut doc, root).expect("scan");

        let html = render_outline_html(&items, Some("heading-1")).expect("outline");
        assert!(html.starts_with("<nav class=\"toc\""));
        assert!(html.contains("toc__item--h2 toc__item--active"));
        assert_eq!(html.matches("<ul").count(), 2);
        assert!(render_outline_html(&[], None).is_none());
    }
}

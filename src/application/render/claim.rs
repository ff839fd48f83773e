//! Element ownership between renderers.
//!
//! The first renderer (by ascending priority) that transforms an element
//! stamps it with [`OWNER_ATTR`]; every other renderer leaves it alone, even
//! if its own predicate would match.

use crate::domain::document::{Document, DocumentError, NodeId};

pub const OWNER_ATTR: &str = "data-render-owner";

/// Languages handled by the math and diagram renderers; code renderers skip them.
pub const RESERVED_LANGUAGES: [&str; 7] = [
    "math", "latex", "tex", "katex", "mermaid", "mermind", "diagram",
];

pub fn is_reserved_language(language: &str) -> bool {
    let lowered = language.trim().to_ascii_lowercase();
    RESERVED_LANGUAGES.contains(&lowered.as_str())
}

/// True when another renderer already owns the element.
pub fn claimed_by_other(document: &Document, node: NodeId, owner: &str) -> bool {
    document
        .attr(node, OWNER_ATTR)
        .is_some_and(|existing| existing != owner)
}

/// Stamp ownership; returns `false` when someone else got there first.
pub fn claim(document: &mut Document, node: NodeId, owner: &str) -> Result<bool, DocumentError> {
    if claimed_by_other(document, node, owner) {
        return Ok(false);
    }
    document.set_attr(node, OWNER_ATTR, owner)?;
    Ok(true)
}

/// Language declared on a code element: `data-language` wins over a
/// `language-*` class.
pub fn declared_language(document: &Document, node: NodeId) -> Option<String> {
    let element = document.element(node)?;
    if let Some(language) = element.attr("data-language") {
        let trimmed = language.trim();
        if !trimmed.is_empty() {
            return Some(trimmed.to_ascii_lowercase());
        }
    }
    element
        .classes()
        .find_map(|class| class.strip_prefix("language-"))
        .filter(|language| !language.is_empty())
        .map(|language| language.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::document::Element;

    #[test]
    fn first_claim_wins() {
        let mut doc = Document::new();
        let root = doc.root();
        let node = doc
            .append_element(root, Element::new("div").with_class("math"))
            .expect("div");

        assert!(claim(&mut doc, node, "math").expect("claim"));
        assert!(claim(&mut doc, node, "math").expect("reclaim by owner"));
        assert!(!claim(&mut doc, node, "diagram").expect("claim"));
        assert!(claimed_by_other(&doc, node, "diagram"));
        assert_eq!(doc.attr(node, OWNER_ATTR), Some("math"));
    }

    #[test]
    fn declared_language_prefers_data_attribute() {
        let mut doc = Document::new();
        let root = doc.root();
        let code = doc
            .append_element(
                root,
                Element::new("code")
                    .with_class("language-rust")
                    .with_attr("data-language", "Python"),
            )
            .expect("code");
        let bare = doc
            .append_element(root, Element::new("code").with_class("language-Go"))
            .expect("code");

        assert_eq!(declared_language(&doc, code).as_deref(), Some("python"));
        assert_eq!(declared_language(&doc, bare).as_deref(), Some("go"));
        assert!(is_reserved_language(" Mermaid "));
    }
}

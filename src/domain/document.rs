//! In-memory content tree enriched by the render pipeline.
//!
//! Nodes live in an arena owned by [`Document`] and are addressed through
//! [`NodeId`] handles. Renderers never hold references into the tree across
//! mutations: they collect handles first, then read or rewrite through the
//! document. Detached nodes stay in the arena but are no longer reachable from
//! the content root, so they never show up in scans or serialised output.

use thiserror::Error;

const VOID_ELEMENTS: [&str; 6] = ["br", "hr", "img", "input", "link", "meta"];
const ROOT_TAG: &str = "article";

/// Handle to a node inside a [`Document`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Payload carried by a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeData {
    Element(Element),
    Text(String),
    /// Markup produced by an engine (typeset math, highlighted code, SVG);
    /// serialised verbatim.
    Markup(String),
}

/// An element with a lower-cased tag name and ordered attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    tag: String,
    attributes: Vec<(String, String)>,
}

impl Element {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into().to_ascii_lowercase(),
            attributes: Vec::new(),
        }
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attr(name, value);
        self
    }

    pub fn with_class(mut self, class: &str) -> Self {
        self.add_class(class);
        self
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn has_attr(&self, name: &str) -> bool {
        self.attr(name).is_some()
    }

    pub fn set_attr(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.attributes.iter_mut().find(|(key, _)| *key == name) {
            Some((_, existing)) => *existing = value,
            None => self.attributes.push((name, value)),
        }
    }

    pub fn remove_attr(&mut self, name: &str) -> Option<String> {
        let position = self.attributes.iter().position(|(key, _)| key == name)?;
        Some(self.attributes.remove(position).1)
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attributes
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.attr("class").unwrap_or_default().split_whitespace()
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.classes().any(|candidate| candidate == class)
    }

    pub fn add_class(&mut self, class: &str) {
        if self.has_class(class) {
            return;
        }
        let merged = match self.attr("class") {
            Some(existing) if !existing.trim().is_empty() => format!("{} {class}", existing.trim()),
            _ => class.to_string(),
        };
        self.set_attr("class", merged);
    }

    /// Heading level for `h1`..`h6`.
    pub fn heading_level(&self) -> Option<u8> {
        let level = self.tag.strip_prefix('h')?.parse::<u8>().ok()?;
        (1..=6).contains(&level).then_some(level)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DocumentError {
    #[error("node {0:?} does not exist in this document")]
    UnknownNode(NodeId),
    #[error("node {0:?} is not an element")]
    NotAnElement(NodeId),
    #[error("node {0:?} has no parent")]
    Orphan(NodeId),
    #[error("inserting {child:?} under {parent:?} would create a cycle")]
    Cycle { parent: NodeId, child: NodeId },
    #[error("the content root cannot be moved or replaced")]
    RootImmutable,
}

#[derive(Debug, Clone)]
struct Node {
    data: NodeData,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

/// The content root plus every node ever created for it.
#[derive(Debug, Clone)]
pub struct Document {
    nodes: Vec<Node>,
    root: NodeId,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    pub fn new() -> Self {
        Self {
            nodes: vec![Node {
                data: NodeData::Element(Element::new(ROOT_TAG)),
                parent: None,
                children: Vec::new(),
            }],
            root: NodeId(0),
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn contains(&self, id: NodeId) -> bool {
        id.0 < self.nodes.len()
    }

    pub fn data(&self, id: NodeId) -> Option<&NodeData> {
        self.nodes.get(id.0).map(|node| &node.data)
    }

    pub fn element(&self, id: NodeId) -> Option<&Element> {
        match self.data(id) {
            Some(NodeData::Element(element)) => Some(element),
            _ => None,
        }
    }

    pub fn element_mut(&mut self, id: NodeId) -> Option<&mut Element> {
        match self.nodes.get_mut(id.0).map(|node| &mut node.data) {
            Some(NodeData::Element(element)) => Some(element),
            _ => None,
        }
    }

    /// Shorthand for reading one attribute of an element node.
    pub fn attr(&self, id: NodeId, name: &str) -> Option<&str> {
        self.element(id).and_then(|element| element.attr(name))
    }

    pub fn set_attr(
        &mut self,
        id: NodeId,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), DocumentError> {
        self.element_mut(id)
            .ok_or(DocumentError::NotAnElement(id))?
            .set_attr(name, value);
        Ok(())
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.nodes
            .get(id.0)
            .map(|node| node.children.as_slice())
            .unwrap_or_default()
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes.get(id.0).and_then(|node| node.parent)
    }

    /// Whether the node is reachable from the content root.
    pub fn is_attached(&self, id: NodeId) -> bool {
        if !self.contains(id) {
            return false;
        }
        let mut current = id;
        while let Some(parent) = self.parent(current) {
            current = parent;
        }
        current == self.root
    }

    /// Nearest ancestor (excluding `id`) whose element satisfies `predicate`.
    pub fn closest<F>(&self, id: NodeId, predicate: F) -> Option<NodeId>
    where
        F: Fn(&Element) -> bool,
    {
        let mut current = self.parent(id);
        while let Some(candidate) = current {
            if self.element(candidate).is_some_and(&predicate) {
                return Some(candidate);
            }
            current = self.parent(candidate);
        }
        None
    }

    /// Descendants of `id` in document (pre-)order, excluding `id` itself.
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut ordered = Vec::new();
        let mut stack: Vec<NodeId> = self.children(id).iter().rev().copied().collect();
        while let Some(next) = stack.pop() {
            ordered.push(next);
            stack.extend(self.children(next).iter().rev().copied());
        }
        ordered
    }

    /// Element descendants of `id` matching `predicate`, in document order.
    pub fn select<F>(&self, id: NodeId, predicate: F) -> Vec<NodeId>
    where
        F: Fn(&Element) -> bool,
    {
        self.descendants(id)
            .into_iter()
            .filter(|candidate| self.element(*candidate).is_some_and(&predicate))
            .collect()
    }

    /// Concatenated text of every text node below (and including) `id`.
    pub fn text_content(&self, id: NodeId) -> String {
        let mut text = String::new();
        if let Some(NodeData::Text(value)) = self.data(id) {
            text.push_str(value);
        }
        for descendant in self.descendants(id) {
            if let Some(NodeData::Text(value)) = self.data(descendant) {
                text.push_str(value);
            }
        }
        text
    }

    pub fn create_element(&mut self, element: Element) -> NodeId {
        self.push(NodeData::Element(element))
    }

    pub fn create_text(&mut self, text: impl Into<String>) -> NodeId {
        self.push(NodeData::Text(text.into()))
    }

    pub fn create_markup(&mut self, markup: impl Into<String>) -> NodeId {
        self.push(NodeData::Markup(markup.into()))
    }

    pub fn append_child(&mut self, parent: NodeId, child: NodeId) -> Result<(), DocumentError> {
        self.check_insertable(parent, child)?;
        self.detach(child)?;
        self.nodes[child.0].parent = Some(parent);
        self.nodes[parent.0].children.push(child);
        Ok(())
    }

    /// Convenience: create an element and append it under `parent`.
    pub fn append_element(
        &mut self,
        parent: NodeId,
        element: Element,
    ) -> Result<NodeId, DocumentError> {
        let id = self.create_element(element);
        self.append_child(parent, id)?;
        Ok(id)
    }

    pub fn append_text(
        &mut self,
        parent: NodeId,
        text: impl Into<String>,
    ) -> Result<NodeId, DocumentError> {
        let id = self.create_text(text);
        self.append_child(parent, id)?;
        Ok(id)
    }

    pub fn insert_before(&mut self, reference: NodeId, node: NodeId) -> Result<(), DocumentError> {
        let parent = self
            .parent(reference)
            .ok_or(DocumentError::Orphan(reference))?;
        self.check_insertable(parent, node)?;
        self.detach(node)?;
        let position = self.position_in_parent(parent, reference)?;
        self.nodes[node.0].parent = Some(parent);
        self.nodes[parent.0].children.insert(position, node);
        Ok(())
    }

    /// Put `replacement` where `old` was and detach `old`.
    pub fn replace(&mut self, old: NodeId, replacement: NodeId) -> Result<(), DocumentError> {
        if old == replacement {
            return Ok(());
        }
        self.insert_before(old, replacement)?;
        self.detach(old)
    }

    /// Insert `wrapper` in place of `node` and move `node` inside it.
    pub fn wrap(&mut self, node: NodeId, wrapper: Element) -> Result<NodeId, DocumentError> {
        let wrapper = self.create_element(wrapper);
        self.replace(node, wrapper)?;
        self.append_child(wrapper, node)?;
        Ok(wrapper)
    }

    pub fn detach(&mut self, id: NodeId) -> Result<(), DocumentError> {
        if !self.contains(id) {
            return Err(DocumentError::UnknownNode(id));
        }
        if id == self.root {
            return Err(DocumentError::RootImmutable);
        }
        if let Some(parent) = self.nodes[id.0].parent.take() {
            self.nodes[parent.0].children.retain(|child| *child != id);
        }
        Ok(())
    }

    pub fn clear_children(&mut self, id: NodeId) -> Result<(), DocumentError> {
        if !self.contains(id) {
            return Err(DocumentError::UnknownNode(id));
        }
        let children = std::mem::take(&mut self.nodes[id.0].children);
        for child in children {
            self.nodes[child.0].parent = None;
        }
        Ok(())
    }

    /// Replace the children of an element with a single text node.
    pub fn set_text(&mut self, id: NodeId, text: impl Into<String>) -> Result<(), DocumentError> {
        self.element(id).ok_or(DocumentError::NotAnElement(id))?;
        self.clear_children(id)?;
        self.append_text(id, text)?;
        Ok(())
    }

    /// Replace the children of an element with verbatim markup.
    pub fn set_markup(
        &mut self,
        id: NodeId,
        markup: impl Into<String>,
    ) -> Result<(), DocumentError> {
        self.element(id).ok_or(DocumentError::NotAnElement(id))?;
        self.clear_children(id)?;
        let markup = self.create_markup(markup);
        self.append_child(id, markup)
    }

    /// Serialise the children of the content root.
    pub fn to_html(&self) -> String {
        self.inner_html(self.root)
    }

    pub fn inner_html(&self, id: NodeId) -> String {
        let mut html = String::new();
        for child in self.children(id) {
            self.write_node(*child, &mut html);
        }
        html
    }

    pub fn outer_html(&self, id: NodeId) -> String {
        let mut html = String::new();
        self.write_node(id, &mut html);
        html
    }

    fn push(&mut self, data: NodeData) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            data,
            parent: None,
            children: Vec::new(),
        });
        id
    }

    fn check_insertable(&self, parent: NodeId, child: NodeId) -> Result<(), DocumentError> {
        for id in [parent, child] {
            if !self.contains(id) {
                return Err(DocumentError::UnknownNode(id));
            }
        }
        if child == self.root {
            return Err(DocumentError::RootImmutable);
        }
        if self.element(parent).is_none() {
            return Err(DocumentError::NotAnElement(parent));
        }
        let mut current = Some(parent);
        while let Some(ancestor) = current {
            if ancestor == child {
                return Err(DocumentError::Cycle { parent, child });
            }
            current = self.parent(ancestor);
        }
        Ok(())
    }

    fn position_in_parent(&self, parent: NodeId, child: NodeId) -> Result<usize, DocumentError> {
        self.children(parent)
            .iter()
            .position(|candidate| *candidate == child)
            .ok_or(DocumentError::Orphan(child))
    }

    fn write_node(&self, id: NodeId, html: &mut String) {
        let Some(data) = self.data(id) else {
            return;
        };
        match data {
            NodeData::Text(text) => html.push_str(&escape_text(text)),
            NodeData::Markup(markup) => html.push_str(markup),
            NodeData::Element(element) => {
                html.push('<');
                html.push_str(element.tag());
                for (name, value) in element.attributes() {
                    html.push(' ');
                    html.push_str(name);
                    html.push_str("=\"");
                    html.push_str(&escape_attribute(value));
                    html.push('"');
                }
                if VOID_ELEMENTS.contains(&element.tag()) {
                    html.push_str(" />");
                    return;
                }
                html.push('>');
                for child in self.children(id) {
                    self.write_node(*child, html);
                }
                html.push_str("</");
                html.push_str(element.tag());
                html.push('>');
            }
        }
    }
}

/// Escape text for use between tags.
pub fn escape_text(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

/// Escape a value for use inside a double-quoted attribute.
pub fn escape_attribute(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '"' => escaped.push_str("&quot;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

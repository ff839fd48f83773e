//! Table of contents: outline generation and active-section tracking.

mod observer;
mod outline;

use tracing::{debug, info};

use crate::application::render::PipelineEvent;
use crate::domain::document::{Document, NodeId};

pub use observer::{IntersectionEntry, RootMargin, SectionObserver};
pub use outline::{
    TocError, TocEvent, TocItem, nest, render_outline_html, scan_headings, toc_events,
};

/// How a navigation scroll should be performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollBehavior {
    Smooth,
    Instant,
}

/// Whatever can bring a heading into view.
pub trait ScrollTarget {
    fn scroll_into_view(&self, id: &str, behavior: ScrollBehavior);
}

/// Outline of one content root plus the observer tracking it.
#[derive(Debug)]
pub struct TableOfContents {
    scope: Option<NodeId>,
    items: Vec<TocItem>,
    signature: Vec<(u8, String, String)>,
    active: Option<String>,
    observer: Option<SectionObserver>,
    generation: u64,
    margin: RootMargin,
}

impl Default for TableOfContents {
    fn default() -> Self {
        Self::new(RootMargin::default())
    }
}

impl TableOfContents {
    pub fn new(margin: RootMargin) -> Self {
        Self {
            scope: None,
            items: Vec::new(),
            signature: Vec::new(),
            active: None,
            observer: None,
            generation: 0,
            margin,
        }
    }

    /// Restrict scanning to the subtree under `scope` instead of the root.
    pub fn with_scope(mut self, scope: NodeId) -> Self {
        self.scope = Some(scope);
        self
    }

    /// Flat outline in document order.
    pub fn items(&self) -> &[TocItem] {
        &self.items
    }

    pub fn nested(&self) -> Vec<TocItem> {
        nest(&self.items)
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn active(&self) -> Option<&str> {
        self.active.as_deref()
    }

    /// Bumped every time the outline is regenerated.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn observer(&self) -> Option<&SectionObserver> {
        self.observer.as_ref()
    }

    /// Rescan headings; the outline and observer are replaced only when the
    /// heading structure differs from the last scan. Returns whether it did.
    pub fn refresh(&mut self, document: &mut Document) -> Result<bool, TocError> {
        let scope = self.scope.unwrap_or_else(|| document.root());
        let items = scan_headings(document, scope)?;
        let signature: Vec<(u8, String, String)> = items
            .iter()
            .map(|item| (item.level, item.id.clone(), item.text.clone()))
            .collect();

        if self.generation > 0 && signature == self.signature {
            debug!(
                target = "application::toc",
                generation = self.generation,
                "Heading structure unchanged; keeping outline"
            );
            return Ok(false);
        }

        if let Some(mut previous) = self.observer.take() {
            previous.disconnect();
        }
        self.generation += 1;
        self.signature = signature;
        self.items = items;
        let stale = self
            .active
            .as_deref()
            .is_some_and(|active| !self.items.iter().any(|item| item.id == active));
        if stale {
            self.active = None;
        }
        self.observer = if self.items.is_empty() {
            None
        } else {
            Some(SectionObserver::new(
                self.generation,
                self.items.iter().map(|item| item.id.clone()).collect(),
                self.margin,
            ))
        };

        info!(
            target = "application::toc",
            generation = self.generation,
            headings = self.items.len(),
            "Outline regenerated"
        );
        Ok(true)
    }

    /// React to a pipeline event. Only a completed run triggers a rescan.
    pub fn on_pipeline_event(
        &mut self,
        event: &PipelineEvent,
        document: &mut Document,
    ) -> Result<bool, TocError> {
        match event {
            PipelineEvent::Completed { .. } => self.refresh(document),
            _ => Ok(false),
        }
    }

    /// Feed an intersection report to the current observer.
    pub fn observe(&mut self, entries: &[IntersectionEntry]) -> Option<&str> {
        let entered = self
            .observer
            .as_ref()
            .and_then(|observer| observer.observe(entries))
            .map(str::to_string);
        if let Some(id) = entered {
            self.active = Some(id);
        }
        self.active.as_deref()
    }

    /// Scroll to `id` smoothly, make it active right away and hand the item to
    /// `on_select`.
    pub fn navigate<F>(
        &mut self,
        id: &str,
        target: &dyn ScrollTarget,
        on_select: F,
    ) -> Result<(), TocError>
    where
        F: FnOnce(&TocItem),
    {
        let Some(item) = self.items.iter().find(|item| item.id == id).cloned() else {
            return Err(TocError::UnknownItem { id: id.to_string() });
        };
        target.scroll_into_view(&item.id, ScrollBehavior::Smooth);
        self.active = Some(item.id.clone());
        on_select(&item);
        Ok(())
    }

    /// Rendered outline, `None` when there are no headings.
    pub fn render_html(&self) -> Option<String> {
        render_outline_html(&self.items, self.active.as_deref())
    }
}

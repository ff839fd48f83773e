//! Copy affordances attached by the renderers.
//!
//! Renderers only stamp controls with `data-copy-source`; the text is written
//! to a clipboard when the host activates a control through [`CopyService`].
//! The control then shows a transient `copied` state that reverts after
//! [`CopyService::revert_after`].

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::domain::document::{Document, DocumentError, NodeId};

pub const COPY_SOURCE_ATTR: &str = "data-copy-source";
pub const COPY_STATE_ATTR: &str = "data-copy-state";
pub const COPY_STATE_IDLE: &str = "idle";
pub const COPY_STATE_COPIED: &str = "copied";
pub const COPY_STATE_FAILED: &str = "failed";

const DEFAULT_REVERT_AFTER: Duration = Duration::from_millis(2000);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CopyError {
    #[error("clipboard unavailable: {0}")]
    Unavailable(String),
    #[error("clipboard write failed: {0}")]
    Write(String),
    #[error("node has no copy source")]
    MissingSource,
    #[error(transparent)]
    Document(#[from] DocumentError),
}

/// Something text can be copied into.
pub trait Clipboard: Send + Sync {
    fn name(&self) -> &str;

    fn write_text(&self, text: &str) -> Result<(), CopyError>;
}

/// Legacy selection-based copy: the text is kept as the current selection.
#[derive(Debug, Default)]
pub struct SelectionClipboard {
    selection: Mutex<Option<String>>,
}

impl SelectionClipboard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn selection(&self) -> Option<String> {
        self.selection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Clipboard for SelectionClipboard {
    fn name(&self) -> &str {
        "selection"
    }

    fn write_text(&self, text: &str) -> Result<(), CopyError> {
        *self.selection.lock().unwrap_or_else(PoisonError::into_inner) = Some(text.to_string());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CopyOutcome {
    pub method: String,
    pub text: String,
}

pub struct CopyService {
    primary: Option<Arc<dyn Clipboard>>,
    fallback: Arc<SelectionClipboard>,
    revert_after: Duration,
}

impl CopyService {
    pub fn new(primary: Option<Arc<dyn Clipboard>>) -> Self {
        Self {
            primary,
            fallback: Arc::new(SelectionClipboard::new()),
            revert_after: DEFAULT_REVERT_AFTER,
        }
    }

    pub fn with_revert_after(mut self, revert_after: Duration) -> Self {
        self.revert_after = revert_after;
        self
    }

    pub fn revert_after(&self) -> Duration {
        self.revert_after
    }

    pub fn fallback(&self) -> &SelectionClipboard {
        &self.fallback
    }

    /// Write `text` to the primary clipboard, falling back to the selection.
    pub fn copy_text(&self, text: &str) -> Result<CopyOutcome, CopyError> {
        if let Some(primary) = self.primary.as_ref() {
            match primary.write_text(text) {
                Ok(()) => {
                    return Ok(CopyOutcome {
                        method: primary.name().to_string(),
                        text: text.to_string(),
                    });
                }
                Err(err) => {
                    warn!(
                        target = "application::render::copy",
                        clipboard = primary.name(),
                        error = %err,
                        "Clipboard write failed; using selection fallback"
                    );
                }
            }
        }

        self.fallback.write_text(text)?;
        Ok(CopyOutcome {
            method: self.fallback.name().to_string(),
            text: text.to_string(),
        })
    }

    /// Copy the source attached to `control` (or its nearest ancestor carrying
    /// one) and flip the control into the `copied` state.
    pub fn activate(
        &self,
        document: &mut Document,
        control: NodeId,
    ) -> Result<CopyOutcome, CopyError> {
        let source = copy_source(document, control).ok_or(CopyError::MissingSource)?;
        match self.copy_text(&source) {
            Ok(outcome) => {
                document.set_attr(control, COPY_STATE_ATTR, COPY_STATE_COPIED)?;
                debug!(
                    target = "application::render::copy",
                    method = %outcome.method,
                    bytes = outcome.text.len(),
                    "Copied source"
                );
                Ok(outcome)
            }
            Err(err) => {
                document.set_attr(control, COPY_STATE_ATTR, COPY_STATE_FAILED)?;
                Err(err)
            }
        }
    }

    /// Return a control to its idle state.
    pub fn revert(&self, document: &mut Document, control: NodeId) -> Result<(), CopyError> {
        document.set_attr(control, COPY_STATE_ATTR, COPY_STATE_IDLE)?;
        Ok(())
    }

    /// Activate a control on a shared document and revert it once the
    /// transient state has elapsed.
    pub async fn flash(
        &self,
        document: &tokio::sync::Mutex<Document>,
        control: NodeId,
    ) -> Result<CopyOutcome, CopyError> {
        let outcome = {
            let mut guard = document.lock().await;
            self.activate(&mut guard, control)?
        };
        tokio::time::sleep(self.revert_after).await;
        let mut guard = document.lock().await;
        if guard.attr(control, COPY_STATE_ATTR) == Some(COPY_STATE_COPIED) {
            self.revert(&mut guard, control)?;
        }
        Ok(outcome)
    }
}

impl Default for CopyService {
    fn default() -> Self {
        Self::new(None)
    }
}

/// Text a control copies: its own `data-copy-source`, or the nearest
/// ancestor's.
pub fn copy_source(document: &Document, control: NodeId) -> Option<String> {
    if let Some(source) = document.attr(control, COPY_SOURCE_ATTR) {
        return Some(source.to_string());
    }
    document
        .closest(control, |element| element.has_attr(COPY_SOURCE_ATTR))
        .and_then(|ancestor| document.attr(ancestor, COPY_SOURCE_ATTR))
        .map(str::to_string)
}

/// Line endings unified and trailing newlines dropped.
pub fn normalize_copy_text(text: &str) -> String {
    text.replace("\r\n", "\n")
        .replace('\r', "\n")
        .trim_end_matches('\n')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::document::Element;

    struct BrokenClipboard;

    impl Clipboard for BrokenClipboard {
        fn name(&self) -> &str {
            "broken"
        }

        fn write_text(&self, _text: &str) -> Result<(), CopyError> {
            Err(CopyError::Unavailable("no display".to_string()))
        }
    }

    fn doc_with_button() -> (Document, NodeId) {
        let mut doc = Document::new();
        let root = doc.root();
        let block = doc
            .append_element(
                root,
                Element::new("div").with_attr(COPY_SOURCE_ATTR, "x^2"),
            )
            .expect("block");
        let button = doc
            .append_element(block, Element::new("button"))
            .expect("button");
        (doc, button)
    }

    #[test]
    fn falls_back_to_selection_when_clipboard_fails() {
        let service = CopyService::new(Some(Arc::new(BrokenClipboard)));
        let (mut doc, button) = doc_with_button();

        let outcome = service.activate(&mut doc, button).expect("copied");

        assert_eq!(outcome.method, "selection");
        assert_eq!(outcome.text, "x^2");
        assert_eq!(service.fallback().selection().as_deref(), Some("x^2"));
        assert_eq!(doc.attr(button, COPY_STATE_ATTR), Some(COPY_STATE_COPIED));
    }

    #[test]
    fn missing_source_is_an_error() {
        let service = CopyService::default();
        let mut doc = Document::new();
        let root = doc.root();
        let button = doc
            .append_element(root, Element::new("button"))
            .expect("button");

        assert_eq!(
            service.activate(&mut doc, button),
            Err(CopyError::MissingSource)
        );
    }

    #[tokio::test]
    async fn copied_state_reverts_after_delay() {
        let service = CopyService::default().with_revert_after(Duration::from_millis(5));
        let (doc, button) = doc_with_button();
        let shared = tokio::sync::Mutex::new(doc);

        service.flash(&shared, button).await.expect("flash");

        let doc = shared.lock().await;
        assert_eq!(doc.attr(button, COPY_STATE_ATTR), Some(COPY_STATE_IDLE));
    }

    #[test]
    fn normalizes_line_endings_and_trailing_newlines() {
        assert_eq!(normalize_copy_text("a\r\nb\n\n"), "a\nb");
        assert_eq!(normalize_copy_text("  keep\n"), "  keep");
    }
}

//! System clipboard backed by `arboard`.

use std::sync::Arc;

use tracing::debug;

use crate::application::render::{Clipboard, CopyError, CopyService};

/// Writes to the desktop clipboard. A fresh handle is opened per write so a
/// missing display server only fails the copy that needed it.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClipboard;

impl Clipboard for SystemClipboard {
    fn name(&self) -> &str {
        "system"
    }

    fn write_text(&self, text: &str) -> Result<(), CopyError> {
        let mut clipboard =
            arboard::Clipboard::new().map_err(|err| CopyError::Unavailable(err.to_string()))?;
        clipboard
            .set_text(text.to_owned())
            .map_err(|err| CopyError::Write(err.to_string()))?;
        debug!(
            target = "infra::clipboard",
            bytes = text.len(),
            "Wrote system clipboard"
        );
        Ok(())
    }
}

/// Copy service that tries the system clipboard before the selection
/// fallback.
pub fn system_copy_service() -> CopyService {
    CopyService::new(Some(Arc::new(SystemClipboard)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_always_lands_somewhere() {
        let service = system_copy_service();
        let outcome = service.copy_text("x^2").expect("copy");

        assert_eq!(outcome.text, "x^2");
        match outcome.method.as_str() {
            "system" => {}
            "selection" => assert_eq!(service.fallback().selection().as_deref(), Some("x^2")),
            other => panic!("unexpected copy method: {other}"),
        }
    }
}

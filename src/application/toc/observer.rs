//! Active-section tracking from viewport intersection reports.

use serde::{Deserialize, Serialize};

const DEFAULT_TOP_PX: f64 = 80.0;
const DEFAULT_BOTTOM_FRACTION: f64 = 0.8;

/// Shrinks the viewport into the band a heading must enter to become
/// active: `top_px` off the top and `bottom_fraction` of the height off the
/// bottom.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RootMargin {
    pub top_px: f64,
    pub bottom_fraction: f64,
}

impl Default for RootMargin {
    fn default() -> Self {
        Self {
            top_px: DEFAULT_TOP_PX,
            bottom_fraction: DEFAULT_BOTTOM_FRACTION,
        }
    }
}

impl RootMargin {
    pub fn contains(&self, top: f64, viewport_height: f64) -> bool {
        let bottom = viewport_height * (1.0 - self.bottom_fraction.clamp(0.0, 1.0));
        top >= self.top_px && top < bottom.max(self.top_px)
    }
}

/// Position of one heading relative to the viewport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntersectionEntry {
    pub id: String,
    pub top: f64,
    pub viewport_height: f64,
}

/// Observes one heading set; replaced, not updated, when the outline changes.
#[derive(Debug, Clone)]
pub struct SectionObserver {
    generation: u64,
    targets: Vec<String>,
    margin: RootMargin,
    connected: bool,
}

impl SectionObserver {
    pub fn new(generation: u64, targets: Vec<String>, margin: RootMargin) -> Self {
        Self {
            generation,
            targets,
            margin,
            connected: true,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn targets(&self) -> &[String] {
        &self.targets
    }

    pub fn margin(&self) -> RootMargin {
        self.margin
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn disconnect(&mut self) {
        self.connected = false;
    }

    /// The heading that entered the band, if any. When several entered in one
    /// report the last one wins. A disconnected observer reports nothing.
    pub fn observe<'e>(&self, entries: &'e [IntersectionEntry]) -> Option<&'e str> {
        if !self.connected {
            return None;
        }
        entries
            .iter()
            .filter(|entry| self.targets.iter().any(|target| *target == entry.id))
            .filter(|entry| self.margin.contains(entry.top, entry.viewport_height))
            .last()
            .map(|entry| entry.id.as_str())
    }
}

//! Deterministic, human-friendly anchors for document headings.
//!
//! ASCII slugification (`slug` crate) is combined with Chinese transliteration
//! (`pinyin` crate) so a heading like “基线对齐” anchors as `ji-xian-dui-qi`.
//! Paper analyses are frequently bilingual, so both scripts must produce
//! readable fragment identifiers.

use std::collections::HashSet;

use pinyin::{Pinyin, ToPinyin};
use slug::slugify;
use thiserror::Error;

/// Prefix for anchors synthesised from a heading's position.
pub const POSITIONAL_ANCHOR_PREFIX: &str = "heading-";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SlugError {
    #[error("slug source text is empty")]
    EmptyInput,
    #[error("failed to derive slug from `{input}`")]
    Unrepresentable { input: String },
}

/// Derive a base slug from the provided human-readable text.
pub fn derive_slug(input: &str) -> Result<String, SlugError> {
    if input.trim().is_empty() {
        return Err(SlugError::EmptyInput);
    }

    let transliterated = transliterate_to_ascii(input);
    let candidate = slugify(&transliterated);

    if candidate.is_empty() {
        return Err(SlugError::Unrepresentable {
            input: input.to_string(),
        });
    }

    Ok(candidate)
}

/// Anchor synthesised from a heading's zero-based position in the document.
pub fn positional_anchor(index: usize) -> String {
    format!("{POSITIONAL_ANCHOR_PREFIX}{index}")
}

/// Hands out anchors that are unique within one document.
///
/// Headings processed in order receive monotonic suffixes when duplicates
/// occur (`section`, `section-2`, `section-3`).
#[derive(Default, Debug)]
pub struct AnchorSlugger {
    taken: HashSet<String>,
}

impl AnchorSlugger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark an identifier that already exists in the document as used.
    pub fn reserve(&mut self, anchor: impl Into<String>) {
        self.taken.insert(anchor.into());
    }

    pub fn is_taken(&self, anchor: &str) -> bool {
        self.taken.contains(anchor)
    }

    /// Generate an anchor for the heading text. Fails when the text cannot
    /// produce a slug (empty or unrepresentable input).
    pub fn anchor_for(&mut self, heading: &str) -> Result<String, SlugError> {
        let base = derive_slug(heading)?;
        Ok(self.claim(base))
    }

    /// Like [`AnchorSlugger::anchor_for`], falling back to a positional anchor.
    pub fn anchor_or_positional(&mut self, heading: &str, index: usize) -> String {
        let base = derive_slug(heading).unwrap_or_else(|_| positional_anchor(index));
        self.claim(base)
    }

    /// Claim the positional anchor for `index`, suffixed if already used.
    pub fn positional(&mut self, index: usize) -> String {
        self.claim(positional_anchor(index))
    }

    fn claim(&mut self, base: String) -> String {
        if self.taken.insert(base.clone()) {
            return base;
        }
        let mut suffix = 2usize;
        loop {
            let candidate = format!("{base}-{suffix}");
            if self.taken.insert(candidate.clone()) {
                return candidate;
            }
            suffix += 1;
        }
    }
}

fn transliterate_to_ascii(input: &str) -> String {
    let mut output = String::with_capacity(input.len());

    for ch in input.chars() {
        if ch.is_ascii() {
            output.push(ch);
            continue;
        }

        match ch.to_pinyin() {
            Some(py) => append_pinyin(&mut output, py),
            None if ch.is_whitespace() => output.push(' '),
            None => {
                // slugify decides how to filter what pinyin cannot map
                output.push(ch);
            }
        }
    }

    output
}

fn append_pinyin(buffer: &mut String, pinyin: Pinyin) {
    if !buffer.is_empty() && !buffer.ends_with(' ') {
        buffer.push(' ');
    }
    buffer.push_str(pinyin.plain());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_slug_transliterates_chinese() {
        let slug = derive_slug("Transformer 注意力机制").expect("slug");
        assert_eq!(slug, "transformer-zhu-yi-li-ji-zhi");
    }

    #[test]
    fn derive_slug_rejects_blank_input() {
        assert_eq!(derive_slug("   "), Err(SlugError::EmptyInput));
    }

    #[test]
    fn anchor_slugger_produces_unique_slugs() {
        let mut slugger = AnchorSlugger::new();

        let first = slugger.anchor_for("Related Work").expect("slug");
        let second = slugger.anchor_for("Related Work").expect("slug");
        let third = slugger.anchor_for("深入理解").expect("slug");

        assert_eq!(first, "related-work");
        assert_eq!(second, "related-work-2");
        assert_eq!(third, "shen-ru-li-jie");
    }

    #[test]
    fn reserved_anchors_are_skipped() {
        let mut slugger = AnchorSlugger::new();
        slugger.reserve("method");
        slugger.reserve("method-2");

        assert_eq!(slugger.anchor_for("Method").expect("slug"), "method-3");
    }

    #[test]
    fn unrepresentable_heading_falls_back_to_position() {
        let mut slugger = AnchorSlugger::new();
        assert_eq!(slugger.anchor_or_positional("", 4), "heading-4");
        assert_eq!(slugger.anchor_or_positional("", 4), "heading-4-2");
    }
}

//! Render configuration snapshot and its partial-update form.
//!
//! [`RenderOptions`] is immutable for the duration of a pipeline run. Callers
//! adjust it by building a [`RenderOptionsPatch`] and calling
//! [`RenderOptions::merged`], which deep-merges each section (math, code,
//! diagram) independently and returns a fresh value.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub const DEFAULT_RESOURCE_BASE: &str = "bundled://assets/";
pub const DEFAULT_CODE_THEME: &str = "InspiredGitHub";
pub const DEFAULT_DARK_CODE_THEME: &str = "base16-ocean.dark";
pub const DEFAULT_LANGUAGE: &str = "en";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    Light,
    Dark,
}

impl Theme {
    pub fn as_str(self) -> &'static str {
        match self {
            Theme::Light => "light",
            Theme::Dark => "dark",
        }
    }
}

impl fmt::Display for Theme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Theme {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "light" => Ok(Theme::Light),
            "dark" => Ok(Theme::Dark),
            other => Err(format!("unknown theme `{other}` (expected light|dark)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MathEngineKind {
    #[default]
    Katex,
    Mathjax,
}

impl MathEngineKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MathEngineKind::Katex => "katex",
            MathEngineKind::Mathjax => "mathjax",
        }
    }
}

impl fmt::Display for MathEngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MathEngineKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "katex" => Ok(MathEngineKind::Katex),
            "mathjax" => Ok(MathEngineKind::Mathjax),
            other => Err(format!(
                "unknown math engine `{other}` (expected katex|mathjax)"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MathOptions {
    pub engine: MathEngineKind,
    pub macros: BTreeMap<String, String>,
    /// Typeset inline spans whose whole source is numeric (`$5$`). When off,
    /// such spans are kept as literal text so prices are not set as math.
    pub inline_digit_mode: bool,
    /// Rewrite escaped `\\[`/`\\(` delimiters to dollar form before parsing.
    pub normalize_delimiters: bool,
}

impl Default for MathOptions {
    fn default() -> Self {
        Self {
            engine: MathEngineKind::Katex,
            macros: BTreeMap::new(),
            inline_digit_mode: true,
            normalize_delimiters: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeOptions {
    pub theme: String,
    pub line_numbers: bool,
    pub copy_button: bool,
    pub default_language: Option<String>,
}

impl CodeOptions {
    /// The configured fallback language, trimmed and lower-cased; blank
    /// values count as unset.
    pub fn fallback_language(&self) -> Option<String> {
        self.default_language
            .as_deref()
            .map(|language| language.trim().to_ascii_lowercase())
            .filter(|language| !language.is_empty())
    }
}

impl Default for CodeOptions {
    fn default() -> Self {
        Self {
            theme: DEFAULT_CODE_THEME.to_string(),
            line_numbers: false,
            copy_button: true,
            default_language: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagramOptions {
    pub enabled_engines: BTreeSet<String>,
    pub theme: Theme,
}

impl Default for DiagramOptions {
    fn default() -> Self {
        Self {
            enabled_engines: BTreeSet::from(["mermaid".to_string()]),
            theme: Theme::Light,
        }
    }
}

/// Full configuration for one rendering surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderOptions {
    pub resource_base: String,
    pub theme: Theme,
    pub language: String,
    pub math: MathOptions,
    pub code: CodeOptions,
    pub diagram: DiagramOptions,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            resource_base: DEFAULT_RESOURCE_BASE.to_string(),
            theme: Theme::Light,
            language: DEFAULT_LANGUAGE.to_string(),
            math: MathOptions::default(),
            code: CodeOptions::default(),
            diagram: DiagramOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MathOptionsPatch {
    pub engine: Option<MathEngineKind>,
    /// Entries are merged into the existing macro table.
    pub macros: Option<BTreeMap<String, String>>,
    pub inline_digit_mode: Option<bool>,
    pub normalize_delimiters: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CodeOptionsPatch {
    pub theme: Option<String>,
    pub line_numbers: Option<bool>,
    pub copy_button: Option<bool>,
    /// `Some(None)` clears the default language.
    pub default_language: Option<Option<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DiagramOptionsPatch {
    /// Replaces the enabled engine set.
    pub enabled_engines: Option<BTreeSet<String>>,
    pub theme: Option<Theme>,
}

/// Partial update applied with [`RenderOptions::merged`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RenderOptionsPatch {
    pub resource_base: Option<String>,
    pub theme: Option<Theme>,
    pub language: Option<String>,
    pub math: Option<MathOptionsPatch>,
    pub code: Option<CodeOptionsPatch>,
    pub diagram: Option<DiagramOptionsPatch>,
}

impl RenderOptions {
    /// Produce a new options value with `patch` applied; `self` is untouched.
    pub fn merged(&self, patch: &RenderOptionsPatch) -> RenderOptions {
        let mut next = self.clone();
        if let Some(base) = patch.resource_base.as_ref() {
            next.resource_base = base.clone();
        }
        if let Some(theme) = patch.theme {
            next.theme = theme;
        }
        if let Some(language) = patch.language.as_ref() {
            next.language = language.clone();
        }
        if let Some(math) = patch.math.as_ref() {
            next.math = self.math.merged(math);
        }
        if let Some(code) = patch.code.as_ref() {
            next.code = self.code.merged(code);
        }
        if let Some(diagram) = patch.diagram.as_ref() {
            next.diagram = self.diagram.merged(diagram);
        }
        next
    }
}

impl MathOptions {
    fn merged(&self, patch: &MathOptionsPatch) -> MathOptions {
        let mut next = self.clone();
        if let Some(engine) = patch.engine {
            next.engine = engine;
        }
        if let Some(macros) = patch.macros.as_ref() {
            next.macros
                .extend(macros.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        if let Some(mode) = patch.inline_digit_mode {
            next.inline_digit_mode = mode;
        }
        if let Some(normalize) = patch.normalize_delimiters {
            next.normalize_delimiters = normalize;
        }
        next
    }
}

impl CodeOptions {
    fn merged(&self, patch: &CodeOptionsPatch) -> CodeOptions {
        let mut next = self.clone();
        if let Some(theme) = patch.theme.as_ref() {
            next.theme = theme.clone();
        }
        if let Some(line_numbers) = patch.line_numbers {
            next.line_numbers = line_numbers;
        }
        if let Some(copy_button) = patch.copy_button {
            next.copy_button = copy_button;
        }
        if let Some(language) = patch.default_language.as_ref() {
            next.default_language = language.clone();
        }
        next
    }
}

impl DiagramOptions {
    fn merged(&self, patch: &DiagramOptionsPatch) -> DiagramOptions {
        let mut next = self.clone();
        if let Some(engines) = patch.enabled_engines.as_ref() {
            next.enabled_engines = engines
                .iter()
                .map(|engine| engine.trim().to_ascii_lowercase())
                .filter(|engine| !engine.is_empty())
                .collect();
        }
        if let Some(theme) = patch.theme {
            next.theme = theme;
        }
        next
    }
}

//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{collections::BTreeMap, path::PathBuf, str::FromStr};

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::application::render::{
    CodeOptions, DEFAULT_CODE_THEME, DEFAULT_LANGUAGE, DEFAULT_MERMAID_CACHE_DIR,
    DEFAULT_MERMAID_CLI_PATH, DEFAULT_RESOURCE_BASE, DiagramOptions, MathEngineKind, MathOptions,
    RenderOptions, Theme, theme_css,
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "paperflow";
const ENV_PREFIX: &str = "PAPERFLOW";

/// Command-line arguments for the paperflow binary.
#[derive(Debug, Parser)]
#[command(
    name = "paperflow",
    version,
    about = "Render academic markdown: highlighted code, typeset math, diagrams and an outline"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "PAPERFLOW_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Parse a markdown file, run the render pipeline and print the HTML.
    Render(RenderArgs),
    /// Print the heading outline of a markdown file.
    Outline(OutlineArgs),
    /// Render a markdown file and copy the source behind one copy control.
    Copy(CopyArgs),
}

#[derive(Debug, Args, Clone)]
pub struct RenderArgs {
    #[command(flatten)]
    pub overrides: RenderOverrides,

    /// Markdown file to render; `-` reads standard input.
    #[arg(value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub file: PathBuf,

    /// Print the outline after the rendered content.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub toc: bool,

    /// Print a JSON report (html, outline, head, run summary) instead of HTML.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub json: bool,
}

#[derive(Debug, Args, Clone)]
pub struct OutlineArgs {
    #[command(flatten)]
    pub overrides: RenderOverrides,

    /// Markdown file to scan; `-` reads standard input.
    #[arg(value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub file: PathBuf,

    /// Print the outline as JSON.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub json: bool,
}

#[derive(Debug, Args, Clone)]
pub struct CopyArgs {
    #[command(flatten)]
    pub overrides: RenderOverrides,

    /// Markdown file to render; `-` reads standard input.
    #[arg(value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub file: PathBuf,

    /// Zero-based index of the copy control, in document order.
    #[arg(long = "index", value_name = "N", default_value_t = 0)]
    pub index: usize,
}

#[derive(Debug, Args, Default, Clone)]
pub struct RenderOverrides {
    /// Override the colour theme (light|dark).
    #[arg(long = "theme", value_name = "THEME")]
    pub theme: Option<String>,

    /// Override the math engine (katex|mathjax).
    #[arg(long = "math-engine", value_name = "ENGINE")]
    pub math_engine: Option<String>,

    /// Override the syntax highlighting theme.
    #[arg(long = "code-theme", value_name = "NAME")]
    pub code_theme: Option<String>,

    /// Emit a line-number marker per source line in code blocks.
    #[arg(long = "line-numbers", action = clap::ArgAction::SetTrue)]
    pub line_numbers: bool,

    /// Do not attach copy controls to code blocks.
    #[arg(long = "no-copy-button", action = clap::ArgAction::SetTrue)]
    pub no_copy_button: bool,

    /// Override the origin engine assets are loaded from.
    #[arg(long = "resource-base", value_name = "URL")]
    pub resource_base: Option<String>,

    /// Override the Mermaid CLI executable path used for diagram rendering.
    #[arg(long = "mermaid-cli-path", value_name = "PATH")]
    pub mermaid_cli_path: Option<PathBuf>,

    /// Override the directory used to cache rendered Mermaid diagrams.
    #[arg(long = "mermaid-cache-dir", value_name = "PATH")]
    pub mermaid_cache_dir: Option<PathBuf>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub render: RenderSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub options: RenderOptions,
    pub mermaid_cli_path: PathBuf,
    pub mermaid_cache_dir: PathBuf,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match &cli.command {
        Command::Render(args) => raw.apply_render_overrides(&args.overrides),
        Command::Outline(args) => raw.apply_render_overrides(&args.overrides),
        Command::Copy(args) => raw.apply_render_overrides(&args.overrides),
    }

    Settings::from_raw(raw)
}

pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    render: RawRenderSettings,
}

impl RawSettings {
    fn apply_render_overrides(&mut self, overrides: &RenderOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(theme) = overrides.theme.as_ref() {
            self.render.theme = Some(theme.clone());
        }
        if let Some(engine) = overrides.math_engine.as_ref() {
            self.render.math.engine = Some(engine.clone());
        }
        if let Some(theme) = overrides.code_theme.as_ref() {
            self.render.code.theme = Some(theme.clone());
        }
        if overrides.line_numbers {
            self.render.code.line_numbers = Some(true);
        }
        if overrides.no_copy_button {
            self.render.code.copy_button = Some(false);
        }
        if let Some(base) = overrides.resource_base.as_ref() {
            self.render.resource_base = Some(base.clone());
        }
        if let Some(path) = overrides.mermaid_cli_path.as_ref() {
            self.render.mermaid_cli_path = Some(path.clone());
        }
        if let Some(dir) = overrides.mermaid_cache_dir.as_ref() {
            self.render.mermaid_cache_dir = Some(dir.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings { logging, render } = raw;

        let logging = build_logging_settings(logging)?;
        let render = build_render_settings(render)?;

        Ok(Self { logging, render })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_render_settings(render: RawRenderSettings) -> Result<RenderSettings, LoadError> {
    let RawRenderSettings {
        resource_base,
        theme,
        language,
        mermaid_cli_path,
        mermaid_cache_dir,
        code,
        math,
        diagram,
    } = render;

    let resource_base = resource_base.unwrap_or_else(|| DEFAULT_RESOURCE_BASE.to_string());
    Url::parse(resource_base.trim())
        .map_err(|err| LoadError::invalid("render.resource_base", err.to_string()))?;

    let theme = match theme {
        Some(value) => Theme::from_str(&value)
            .map_err(|reason| LoadError::invalid("render.theme", reason))?,
        None => Theme::default(),
    };

    let language = language
        .map(|value| value.trim().to_string())
        .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string());
    if language.is_empty() {
        return Err(LoadError::invalid("render.language", "must not be empty"));
    }

    let cli_path = mermaid_cli_path.unwrap_or_else(|| PathBuf::from(DEFAULT_MERMAID_CLI_PATH));
    if cli_path.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "render.mermaid_cli_path",
            "path must not be empty",
        ));
    }

    let cache_dir = mermaid_cache_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_MERMAID_CACHE_DIR));
    if cache_dir.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "render.mermaid_cache_dir",
            "path must not be empty",
        ));
    }

    let options = RenderOptions {
        resource_base: resource_base.trim().to_string(),
        theme,
        language,
        math: build_math_options(math)?,
        code: build_code_options(code)?,
        diagram: build_diagram_options(diagram, theme)?,
    };

    Ok(RenderSettings {
        options,
        mermaid_cli_path: cli_path,
        mermaid_cache_dir: cache_dir,
    })
}

fn build_math_options(math: RawMathSettings) -> Result<MathOptions, LoadError> {
    let defaults = MathOptions::default();
    let engine = match math.engine {
        Some(value) => MathEngineKind::from_str(&value)
            .map_err(|reason| LoadError::invalid("render.math.engine", reason))?,
        None => defaults.engine,
    };

    Ok(MathOptions {
        engine,
        macros: math.macros.unwrap_or_default(),
        inline_digit_mode: math.inline_digit_mode.unwrap_or(defaults.inline_digit_mode),
        normalize_delimiters: math
            .normalize_delimiters
            .unwrap_or(defaults.normalize_delimiters),
    })
}

fn build_code_options(code: RawCodeSettings) -> Result<CodeOptions, LoadError> {
    let defaults = CodeOptions::default();
    let theme = code
        .theme
        .map(|value| value.trim().to_string())
        .unwrap_or_else(|| DEFAULT_CODE_THEME.to_string());
    if theme_css(&theme).is_none() {
        return Err(LoadError::invalid(
            "render.code.theme",
            format!("unknown highlighting theme `{theme}`"),
        ));
    }

    let default_language = code.default_language.and_then(|value| {
        let trimmed = value.trim().to_ascii_lowercase();
        (!trimmed.is_empty()).then_some(trimmed)
    });

    Ok(CodeOptions {
        theme,
        line_numbers: code.line_numbers.unwrap_or(defaults.line_numbers),
        copy_button: code.copy_button.unwrap_or(defaults.copy_button),
        default_language,
    })
}

fn build_diagram_options(
    diagram: RawDiagramSettings,
    surface_theme: Theme,
) -> Result<DiagramOptions, LoadError> {
    let enabled_engines = match diagram.enabled_engines {
        Some(engines) => {
            let mut normalized = std::collections::BTreeSet::new();
            for engine in engines {
                let name = engine.trim().to_ascii_lowercase();
                if name.is_empty() {
                    return Err(LoadError::invalid(
                        "render.diagram.enabled_engines",
                        "engine names must not be empty",
                    ));
                }
                normalized.insert(name);
            }
            normalized
        }
        None => DiagramOptions::default().enabled_engines,
    };

    let theme = match diagram.theme {
        Some(value) => Theme::from_str(&value)
            .map_err(|reason| LoadError::invalid("render.diagram.theme", reason))?,
        None => surface_theme,
    };

    Ok(DiagramOptions {
        enabled_engines,
        theme,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRenderSettings {
    resource_base: Option<String>,
    theme: Option<String>,
    language: Option<String>,
    mermaid_cli_path: Option<PathBuf>,
    mermaid_cache_dir: Option<PathBuf>,
    code: RawCodeSettings,
    math: RawMathSettings,
    diagram: RawDiagramSettings,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCodeSettings {
    theme: Option<String>,
    line_numbers: Option<bool>,
    copy_button: Option<bool>,
    default_language: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawMathSettings {
    engine: Option<String>,
    macros: Option<BTreeMap<String, String>>,
    inline_digit_mode: Option<bool>,
    normalize_delimiters: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDiagramSettings {
    enabled_engines: Option<Vec<String>>,
    theme: Option<String>,
}

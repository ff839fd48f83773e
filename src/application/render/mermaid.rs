use std::{
    fs,
    io::{self, ErrorKind, Write},
    path::PathBuf,
    process::{Command, Stdio},
    sync::{PoisonError, RwLock},
    time::Instant,
};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{info, warn};

use super::diagram::{DiagramConfig, DiagramEngine, DiagramError};
use super::options::Theme;

pub const DEFAULT_MERMAID_CLI_PATH: &str = "mmdc";
pub const DEFAULT_MERMAID_CACHE_DIR: &str = "/tmp/paperflow/mermaid";

const LANGUAGES: [&str; 2] = ["mermaid", "mermind"];

#[derive(Debug, Error)]
pub enum MermaidRenderError {
    #[error("failed to prepare cache directory: {0}")]
    CacheInit(io::Error),
    #[error("failed to write temporary file: {0}")]
    Io(io::Error),
    #[error("mermaid CLI invocation failed (exit {exit_code:?}): {stderr}")]
    Cli {
        exit_code: Option<i32>,
        stderr: String,
    },
    #[error("mermaid CLI unavailable: {0}")]
    NotFound(io::Error),
    #[error("failed to read rendered SVG: {0}")]
    Read(io::Error),
}

impl From<MermaidRenderError> for DiagramError {
    fn from(err: MermaidRenderError) -> Self {
        match err {
            MermaidRenderError::NotFound(_) | MermaidRenderError::CacheInit(_) => {
                DiagramError::Unavailable(err.to_string())
            }
            MermaidRenderError::Cli { ref stderr, .. } if !stderr.trim().is_empty() => {
                DiagramError::Render(stderr.trim().to_string())
            }
            other => DiagramError::Render(other.to_string()),
        }
    }
}

/// Mermaid diagrams rendered to SVG by the `mmdc` CLI, cached on disk by a
/// hash of the source and the active configuration.
#[derive(Debug)]
pub struct MermaidCli {
    command: MermaidCommand,
    config: RwLock<DiagramConfig>,
}

#[derive(Debug, Clone)]
struct MermaidCommand {
    cli_path: PathBuf,
    cache_dir: PathBuf,
}

impl MermaidCli {
    pub fn new(cli_path: PathBuf, cache_dir: PathBuf) -> Self {
        Self {
            command: MermaidCommand {
                cli_path,
                cache_dir,
            },
            config: RwLock::new(DiagramConfig::default()),
        }
    }

    fn current_config(&self) -> DiagramConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn render_svg(
        &self,
        source: &str,
        config: &DiagramConfig,
    ) -> Result<String, MermaidRenderError> {
        self.command.render_svg(source, config)
    }
}

impl MermaidCommand {
    fn render_svg(
        &self,
        source: &str,
        config: &DiagramConfig,
    ) -> Result<String, MermaidRenderError> {
        let started_at = Instant::now();
        fs::create_dir_all(&self.cache_dir).map_err(MermaidRenderError::CacheInit)?;
        let cache_key = hash_source(source, config);
        let cache_path = self.cache_dir.join(format!("{cache_key}.svg"));
        match fs::read_to_string(&cache_path) {
            Ok(svg) => {
                info!(
                    target = "application::render::mermaid",
                    op = "mermaid::render_svg",
                    result = "cache_hit",
                    elapsed_ms = started_at.elapsed().as_millis() as u64,
                    cache_path = %cache_path.display(),
                    svg_bytes = svg.len(),
                    "Mermaid diagram served from cache"
                );
                return Ok(svg);
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                warn!(
                    target = "application::render::mermaid",
                    op = "mermaid::render_svg",
                    result = "cache_read_error",
                    cache_path = %cache_path.display(),
                    error = %err,
                    "Failed to read cached Mermaid diagram; re-rendering"
                );
            }
        }

        let mut input_file = NamedTempFile::new().map_err(MermaidRenderError::Io)?;
        input_file
            .write_all(source.as_bytes())
            .map_err(MermaidRenderError::Io)?;
        input_file.flush().map_err(MermaidRenderError::Io)?;

        let output_file = tempfile::Builder::new()
            .suffix(".svg")
            .tempfile_in(&self.cache_dir)
            .map_err(MermaidRenderError::Io)?;
        let output_path = output_file.path().to_path_buf();

        let cli_started_at = Instant::now();
        let output = Command::new(&self.cli_path)
            .arg("--input")
            .arg(input_file.path())
            .arg("--output")
            .arg(&output_path)
            .arg("--outputFormat")
            .arg("svg")
            .arg("--theme")
            .arg(mermaid_theme(config.theme))
            .arg("--backgroundColor")
            .arg(&config.background)
            .arg("--width")
            .arg(config.width.to_string())
            .arg("--quiet")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .map_err(|err| {
                warn!(
                    target = "application::render::mermaid",
                    op = "mermaid::render_svg",
                    result = "error",
                    error_code = "spawn_cli",
                    cli_path = %self.cli_path.display(),
                    error = %err,
                    "Failed to spawn Mermaid CLI"
                );
                if err.kind() == ErrorKind::NotFound {
                    MermaidRenderError::NotFound(err)
                } else {
                    MermaidRenderError::Io(err)
                }
            })?;

        if !output.status.success() {
            let exit_code = output.status.code();
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            warn!(
                target = "application::render::mermaid",
                op = "mermaid::render_svg",
                result = "error",
                cli_elapsed_ms = cli_started_at.elapsed().as_millis() as u64,
                exit_code = exit_code.map(i64::from).unwrap_or(-1),
                error_code = "mermaid_cli",
                stderr = %stderr,
                "Mermaid CLI invocation failed"
            );
            return Err(MermaidRenderError::Cli { exit_code, stderr });
        }

        match output_file.persist(&cache_path) {
            Ok(_) => {}
            Err(err) if err.error.kind() == ErrorKind::AlreadyExists => {}
            Err(err) => return Err(MermaidRenderError::Io(err.error)),
        }

        let svg = fs::read_to_string(&cache_path).map_err(MermaidRenderError::Read)?;

        info!(
            target = "application::render::mermaid",
            op = "mermaid::render_svg",
            result = "cache_miss",
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            cli_elapsed_ms = cli_started_at.elapsed().as_millis() as u64,
            cache_path = %cache_path.display(),
            svg_bytes = svg.len(),
            "Mermaid diagram rendered via CLI"
        );

        Ok(svg)
    }
}

#[async_trait]
impl DiagramEngine for MermaidCli {
    fn name(&self) -> &str {
        "mermaid"
    }

    fn languages(&self) -> &[&str] {
        &LANGUAGES
    }

    fn asset_path(&self) -> &str {
        "mermaid/mermaid.js"
    }

    fn configure(&self, config: &DiagramConfig) -> Result<(), DiagramError> {
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config.clone();
        Ok(())
    }

    async fn render(&self, source: &str) -> Result<String, DiagramError> {
        let command = self.command.clone();
        let config = self.current_config();
        let source = source.to_string();
        tokio::task::spawn_blocking(move || command.render_svg(&source, &config))
            .await
            .map_err(|err| DiagramError::Render(format!("mermaid render task failed: {err}")))?
            .map_err(DiagramError::from)
    }
}

fn mermaid_theme(theme: Theme) -> &'static str {
    match theme {
        Theme::Light => "default",
        Theme::Dark => "dark",
    }
}

fn hash_source(source: &str, config: &DiagramConfig) -> String {
    let mut hasher = Sha256::new();
    hasher.update(mermaid_theme(config.theme).as_bytes());
    hasher.update([0]);
    hasher.update(config.background.as_bytes());
    hasher.update([0]);
    hasher.update(config.width.to_le_bytes());
    hasher.update([0]);
    hasher.update(source.as_bytes());
    hex::encode(hasher.finalize())
}

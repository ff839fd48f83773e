//! Post-processing render pipeline.
//!
//! Content arrives as an already-parsed [`Document`](crate::domain::document::Document).
//! Registered renderers run over it in priority order and enrich it in place:
//! code blocks are wrapped and highlighted, math is typeset and diagrams are
//! turned into SVG figures. Each renderer fails on its own; the pipeline
//! reports failures and keeps going.

mod claim;
mod code;
mod copy;
mod diagram;
mod highlight;
mod math;
mod mermaid;
mod options;
mod parse;
mod pipeline;
mod registry;
mod resources;
mod types;

pub use claim::{OWNER_ATTR, RESERVED_LANGUAGES, is_reserved_language};
pub use code::{CODE_OWNER, CodeWrapper, WRAPPED_ATTR};
pub use copy::{
    COPY_SOURCE_ATTR, COPY_STATE_ATTR, COPY_STATE_COPIED, COPY_STATE_FAILED, COPY_STATE_IDLE,
    Clipboard, CopyError, CopyOutcome, CopyService, SelectionClipboard, copy_source,
    normalize_copy_text,
};
pub use diagram::{
    DIAGRAM_ERROR_TITLE, DIAGRAM_OWNER, DiagramConfig, DiagramEngine, DiagramError,
    DiagramRenderer,
};
pub use highlight::{HIGHLIGHTED_ATTR, SyntaxHighlighter, effective_code_theme, theme_css};
pub use math::{
    ERROR_ATTR as MATH_ERROR_ATTR, KatexEngine, MATH_OWNER, MATH_SOURCE_ATTR, MathEngine,
    MathTypesetter, RENDERED_ATTR as MATH_RENDERED_ATTR,
};
pub use mermaid::{
    DEFAULT_MERMAID_CACHE_DIR, DEFAULT_MERMAID_CLI_PATH, MermaidCli, MermaidRenderError,
};
pub use options::{
    CodeOptions, CodeOptionsPatch, DEFAULT_CODE_THEME, DEFAULT_DARK_CODE_THEME,
    DEFAULT_LANGUAGE, DEFAULT_RESOURCE_BASE, DiagramOptions, DiagramOptionsPatch,
    MathEngineKind, MathOptions, MathOptionsPatch, RenderOptions, RenderOptionsPatch, Theme,
};
pub use parse::{normalize_math_delimiters, parse_markdown};
pub use pipeline::{
    CancelHandle, ErrorCallback, PipelineError, PipelineEvent, PipelineRunState, RenderPipeline,
    RunReport,
};
pub use registry::{BuiltinRenderers, Registration, RenderContext, RendererInfo};
pub use resources::{
    ResourceBody, ResourceError, ResourceFetcher, ResourceHandle, ResourceKind, ResourceLoader,
    ResourceRequest, asset_url, resource_loader,
};
pub use types::{RenderError, Renderer, RendererFailure};

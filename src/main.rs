use std::{path::Path, process};

use paperflow::{
    application::{
        error::AppError,
        render::{BuiltinRenderers, COPY_STATE_ATTR, parse_markdown},
        surface::{RenderSurface, SurfaceReport},
        toc::TableOfContents,
    },
    config,
    domain::document::Document,
    infra::{clipboard::system_copy_service, error::InfraError, telemetry},
};
use tokio::io::AsyncReadExt;
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(error.exit_code());
    }
}

fn report_application_error(error: &AppError) {
    let report = error.report();
    if dispatcher::has_been_set() {
        error!(error = %error, chain = ?report.messages, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, chain = ?report.messages, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::from(InfraError::configuration(err.to_string())))?;

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match cli_args.command {
        config::Command::Render(args) => run_render(settings, args).await,
        config::Command::Outline(args) => run_outline(settings, args).await,
        config::Command::Copy(args) => run_copy(settings, args).await,
    }
}

fn build_surface(settings: &config::Settings) -> RenderSurface {
    let builtins = BuiltinRenderers {
        mermaid_cli_path: settings.render.mermaid_cli_path.clone(),
        mermaid_cache_dir: settings.render.mermaid_cache_dir.clone(),
        ..BuiltinRenderers::default()
    };
    RenderSurface::with_builtin_renderers(settings.render.options.clone(), &builtins)
}

async fn read_source(path: &Path) -> Result<String, AppError> {
    if path.as_os_str() == "-" {
        let mut buffer = String::new();
        tokio::io::stdin()
            .read_to_string(&mut buffer)
            .await
            .map_err(InfraError::from)?;
        return Ok(buffer);
    }

    tokio::fs::read_to_string(path)
        .await
        .map_err(|err| AppError::validation(format!("cannot read `{}`: {err}", path.display())))
}

async fn render_file(
    settings: &config::Settings,
    path: &Path,
) -> Result<(RenderSurface, Document, SurfaceReport), AppError> {
    let markdown = read_source(path).await?;
    let mut surface = build_surface(settings);
    let (document, report) = surface.render_markdown(&markdown).await?;

    info!(
        target = "paperflow::render",
        file = %path.display(),
        run = report.run.run,
        applied = report.run.applied.len(),
        failures = report.run.failures.len(),
        elapsed_ms = report.run.elapsed_ms,
        "Rendered document"
    );
    Ok((surface, document, report))
}

async fn run_render(settings: config::Settings, args: config::RenderArgs) -> Result<(), AppError> {
    let (surface, document, report) = render_file(&settings, &args.file).await?;
    let html = document.to_html();
    let outline = surface.toc().render_html();

    if args.json {
        let payload = serde_json::json!({
            "html": html,
            "head": surface.head_html(),
            "outline": surface.toc().nested(),
            "report": report,
        });
        let rendered = serde_json::to_string_pretty(&payload)
            .map_err(|err| AppError::unexpected(format!("failed to encode report: {err}")))?;
        println!("{rendered}");
        return Ok(());
    }

    println!("{html}");
    if args.toc
        && let Some(outline) = outline
    {
        println!("{outline}");
    }
    Ok(())
}

async fn run_outline(settings: config::Settings, args: config::OutlineArgs) -> Result<(), AppError> {
    let markdown = read_source(&args.file).await?;
    let mut document = parse_markdown(&markdown, &settings.render.options.math).map_err(|err| {
        AppError::validation(format!("cannot parse `{}`: {err}", args.file.display()))
    })?;

    let mut toc = TableOfContents::default();
    toc.refresh(&mut document)
        .map_err(|err| AppError::unexpected(format!("outline generation failed: {err}")))?;

    if args.json {
        let rendered = serde_json::to_string_pretty(&toc.nested())
            .map_err(|err| AppError::unexpected(format!("failed to encode outline: {err}")))?;
        println!("{rendered}");
        return Ok(());
    }

    for item in toc.items() {
        let indent = "  ".repeat(usize::from(item.level.saturating_sub(1)));
        println!("{indent}- {} (#{})", item.text, item.id);
    }
    Ok(())
}

async fn run_copy(settings: config::Settings, args: config::CopyArgs) -> Result<(), AppError> {
    let (_surface, mut document, _report) = render_file(&settings, &args.file).await?;

    let root = document.root();
    let controls = document.select(root, |element| element.has_attr(COPY_STATE_ATTR));
    let Some(control) = controls.get(args.index).copied() else {
        return Err(AppError::validation(format!(
            "no copy control at index {} ({} available)",
            args.index,
            controls.len()
        )));
    };

    let service = system_copy_service();
    let outcome = service
        .activate(&mut document, control)
        .map_err(|err| AppError::unexpected(format!("copy failed: {err}")))?;

    info!(
        target = "paperflow::copy",
        method = %outcome.method,
        bytes = outcome.text.len(),
        "Copied control source"
    );
    if outcome.method != "system" {
        println!("{}", outcome.text);
    }
    Ok(())
}

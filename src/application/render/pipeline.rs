//! Sequential, single-flight execution of renderers over one content root.

use std::sync::{
    Arc,
    atomic::{AtomicU8, AtomicU64, Ordering},
};
use std::time::Instant;

use metrics::{counter, histogram};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::domain::document::Document;

use super::options::RenderOptions;
use super::types::{Renderer, RendererFailure};

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const CANCELLING: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineRunState {
    Idle,
    Running,
    Cancelling,
}

impl PipelineRunState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            RUNNING => PipelineRunState::Running,
            CANCELLING => PipelineRunState::Cancelling,
            _ => PipelineRunState::Idle,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("render pipeline busy")]
    Busy,
}

/// Signals emitted over the course of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    Started { run: u64 },
    RendererFailed { run: u64, failure: RendererFailure },
    /// The run finished every scheduled renderer; the content was enriched.
    Completed { run: u64, applied: Vec<String> },
    Cancelled { run: u64 },
}

pub type ErrorCallback = Arc<dyn Fn(&RendererFailure) + Send + Sync>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub run: u64,
    pub applied: Vec<String>,
    pub skipped: Vec<String>,
    pub failures: Vec<RendererFailure>,
    /// Set only when a cancel left at least one renderer unscheduled.
    pub cancelled: bool,
    pub elapsed_ms: u64,
}

impl RunReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && !self.cancelled
    }
}

/// Cancels the run of the pipeline it was taken from.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    state: Arc<AtomicU8>,
}

impl CancelHandle {
    /// Request cancellation; returns `false` when no run is in progress.
    pub fn cancel(&self) -> bool {
        self.state
            .compare_exchange(RUNNING, CANCELLING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

struct RunGuard {
    state: Arc<AtomicU8>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.state.store(IDLE, Ordering::SeqCst);
    }
}

/// An immutable, already-sorted renderer list plus the options snapshot it
/// runs with.
pub struct RenderPipeline {
    renderers: Arc<[Arc<dyn Renderer>]>,
    options: Arc<RenderOptions>,
    state: Arc<AtomicU8>,
    runs: AtomicU64,
    events: broadcast::Sender<PipelineEvent>,
    on_error: Option<ErrorCallback>,
}

impl RenderPipeline {
    pub(crate) fn new(
        renderers: Arc<[Arc<dyn Renderer>]>,
        options: Arc<RenderOptions>,
        events: broadcast::Sender<PipelineEvent>,
        on_error: Option<ErrorCallback>,
    ) -> Self {
        Self {
            renderers,
            options,
            state: Arc::new(AtomicU8::new(IDLE)),
            runs: AtomicU64::new(0),
            events,
            on_error,
        }
    }

    pub fn options(&self) -> &RenderOptions {
        &self.options
    }

    pub fn renderer_names(&self) -> Vec<String> {
        self.renderers
            .iter()
            .map(|renderer| renderer.name().to_string())
            .collect()
    }

    pub fn state(&self) -> PipelineRunState {
        PipelineRunState::from_raw(self.state.load(Ordering::SeqCst))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            state: Arc::clone(&self.state),
        }
    }

    /// Stop scheduling further renderers; the one in flight finishes.
    pub fn cancel(&self) -> bool {
        self.cancel_handle().cancel()
    }

    /// Run every renderer in order over `document`.
    ///
    /// Renderer failures are reported through the error callback and the
    /// event stream and never abort the run. Only a concurrent call is
    /// rejected, with [`PipelineError::Busy`].
    pub async fn execute(&self, document: &mut Document) -> Result<RunReport, PipelineError> {
        if self
            .state
            .compare_exchange(IDLE, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!(
                target = "application::render::pipeline",
                state = ?self.state(),
                "Rejected execute while a run is in progress"
            );
            return Err(PipelineError::Busy);
        }
        let _guard = RunGuard {
            state: Arc::clone(&self.state),
        };

        let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        let started_at = Instant::now();
        let mut report = RunReport {
            run,
            ..RunReport::default()
        };
        self.emit(PipelineEvent::Started { run });

        for renderer in self.renderers.iter() {
            if self.is_cancelling() {
                report.cancelled = true;
                break;
            }

            let name = renderer.name().to_string();
            if !renderer.applies(document, &self.options) {
                debug!(
                    target = "application::render::pipeline",
                    run,
                    renderer = %name,
                    "Renderer skipped"
                );
                report.skipped.push(name);
                continue;
            }

            let renderer_started_at = Instant::now();
            match renderer.apply(document, &self.options).await {
                Ok(()) => {
                    debug!(
                        target = "application::render::pipeline",
                        run,
                        renderer = %name,
                        elapsed_ms = renderer_started_at.elapsed().as_millis() as u64,
                        "Renderer applied"
                    );
                    report.applied.push(name);
                }
                Err(err) => {
                    let failure = RendererFailure::new(&name, &err);
                    warn!(
                        target = "application::render::pipeline",
                        run,
                        renderer = %name,
                        error = %err,
                        "Renderer failed; continuing with the next one"
                    );
                    counter!("paperflow_renderer_failure_total", "renderer" => name.clone())
                        .increment(1);
                    if let Some(callback) = self.on_error.as_ref() {
                        callback(&failure);
                    }
                    self.emit(PipelineEvent::RendererFailed {
                        run,
                        failure: failure.clone(),
                    });
                    report.failures.push(failure);
                }
            }
        }

        report.elapsed_ms = started_at.elapsed().as_millis() as u64;
        histogram!("paperflow_pipeline_run_ms").record(report.elapsed_ms as f64);

        if report.cancelled {
            info!(
                target = "application::render::pipeline",
                run,
                applied = report.applied.len(),
                "Render run cancelled"
            );
            self.emit(PipelineEvent::Cancelled { run });
        } else {
            info!(
                target = "application::render::pipeline",
                run,
                applied = report.applied.len(),
                skipped = report.skipped.len(),
                failures = report.failures.len(),
                elapsed_ms = report.elapsed_ms,
                "Render run completed"
            );
            self.emit(PipelineEvent::Completed {
                run,
                applied: report.applied.clone(),
            });
        }

        Ok(report)
    }

    fn is_cancelling(&self) -> bool {
        self.state.load(Ordering::SeqCst) == CANCELLING
    }

    fn emit(&self, event: PipelineEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

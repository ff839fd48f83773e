use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use paperflow::{
    application::render::{
        CancelHandle, PipelineEvent, Registration, RenderContext, RenderError, RenderOptions,
        Renderer, ResourceBody, ResourceError, ResourceFetcher, ResourceLoader, ResourceRequest,
    },
    domain::document::Document,
};

type Log = Arc<Mutex<Vec<String>>>;

struct Step {
    name: &'static str,
    priority: i32,
    log: Log,
    fail: bool,
    cancel: Arc<Mutex<Option<CancelHandle>>>,
}

impl Step {
    fn new(name: &'static str, priority: i32, log: &Log) -> Self {
        Self {
            name,
            priority,
            log: Arc::clone(log),
            fail: false,
            cancel: Arc::new(Mutex::new(None)),
        }
    }
}

#[async_trait]
impl Renderer for Step {
    fn name(&self) -> &str {
        self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn applies(&self, _document: &Document, _options: &RenderOptions) -> bool {
        true
    }

    async fn apply(
        &self,
        _document: &mut Document,
        _options: &RenderOptions,
    ) -> Result<(), RenderError> {
        self.log.lock().expect("log").push(self.name.to_string());
        if let Some(handle) = self.cancel.lock().expect("cancel").as_ref() {
            handle.cancel();
        }
        if self.fail {
            return Err(RenderError::engine_unavailable(self.name, "offline"));
        }
        Ok(())
    }
}

#[derive(Default)]
struct CountingFetcher {
    calls: AtomicUsize,
}

#[async_trait]
impl ResourceFetcher for CountingFetcher {
    async fn fetch(&self, request: &ResourceRequest) -> Result<ResourceBody, ResourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        Ok(ResourceBody::Text(format!("/* {} */", request.id)))
    }
}

#[tokio::test]
async fn renderers_run_by_priority_then_registration_order() {
    let log: Log = Arc::default();
    let mut context = RenderContext::new(RenderOptions::default());
    context.register(Arc::new(Step::new("late", 30, &log)));
    context.register(Arc::new(Step::new("tie-first", 10, &log)));
    context.register(Arc::new(Step::new("tie-second", 10, &log)));
    context.register(Arc::new(Step::new("early", 0, &log)));

    let mut document = Document::new();
    context.pipeline().execute(&mut document).await.expect("run");

    assert_eq!(
        *log.lock().expect("log"),
        vec!["early", "tie-first", "tie-second", "late"]
    );
}

#[tokio::test]
async fn failing_renderer_does_not_stop_the_run() {
    let log: Log = Arc::default();
    let mut context = RenderContext::new(RenderOptions::default());
    let mut broken = Step::new("broken", 0, &log);
    broken.fail = true;
    context.register(Arc::new(broken));
    context.register(Arc::new(Step::new("after", 1, &log)));
    let failures = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&failures);
    context.on_error(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let mut events = context.subscribe();

    let mut document = Document::new();
    let report = context.pipeline().execute(&mut document).await.expect("run");

    assert_eq!(report.applied, vec!["after".to_string()]);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].renderer, "broken");
    assert_eq!(failures.load(Ordering::SeqCst), 1);

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(matches!(seen.first(), Some(PipelineEvent::Started { .. })));
    assert!(
        seen.iter()
            .any(|event| matches!(event, PipelineEvent::RendererFailed { .. }))
    );
    assert!(matches!(seen.last(), Some(PipelineEvent::Completed { .. })));
}

#[tokio::test]
async fn cancellation_after_k_renderers_skips_the_rest() {
    let log: Log = Arc::default();
    let mut context = RenderContext::new(RenderOptions::default());
    let second = Step::new("second", 1, &log);
    let cancel_slot = Arc::clone(&second.cancel);
    context.register(Arc::new(Step::new("first", 0, &log)));
    context.register(Arc::new(second));
    context.register(Arc::new(Step::new("third", 2, &log)));
    context.register(Arc::new(Step::new("fourth", 3, &log)));

    let pipeline = context.pipeline();
    *cancel_slot.lock().expect("slot") = Some(pipeline.cancel_handle());
    let mut events = pipeline.subscribe();

    let mut document = Document::new();
    let report = pipeline.execute(&mut document).await.expect("run");

    assert!(report.cancelled);
    assert_eq!(*log.lock().expect("log"), vec!["first", "second"]);

    let mut last = None;
    while let Ok(event) = events.try_recv() {
        last = Some(event);
    }
    assert!(matches!(last, Some(PipelineEvent::Cancelled { .. })));
}

#[tokio::test]
async fn cancel_during_the_last_renderer_still_completes() {
    let log: Log = Arc::default();
    let mut context = RenderContext::new(RenderOptions::default());
    let last = Step::new("last", 1, &log);
    let cancel_slot = Arc::clone(&last.cancel);
    context.register(Arc::new(Step::new("first", 0, &log)));
    context.register(Arc::new(last));

    let pipeline = context.pipeline();
    *cancel_slot.lock().expect("slot") = Some(pipeline.cancel_handle());
    let mut events = pipeline.subscribe();

    let mut document = Document::new();
    let report = pipeline.execute(&mut document).await.expect("run");

    assert!(!report.cancelled);
    assert!(report.is_clean());
    assert_eq!(report.applied, vec!["first".to_string(), "last".to_string()]);

    let mut last_event = None;
    while let Ok(event) = events.try_recv() {
        last_event = Some(event);
    }
    assert!(matches!(last_event, Some(PipelineEvent::Completed { .. })));

    *cancel_slot.lock().expect("slot") = None;
    let rerun = pipeline.execute(&mut document).await.expect("rerun");
    assert!(!rerun.cancelled);
}

#[tokio::test]
async fn duplicate_names_are_ignored_and_unregister_removes() {
    let log: Log = Arc::default();
    let mut context = RenderContext::new(RenderOptions::default());

    assert_eq!(
        context.register(Arc::new(Step::new("only", 0, &log))),
        Registration::Added
    );
    assert_eq!(
        context.register(Arc::new(Step::new("only", 5, &log))),
        Registration::Duplicate
    );
    assert_eq!(context.len(), 1);
    assert_eq!(context.describe()[0].priority, 0);

    assert!(context.unregister("only"));
    assert!(!context.unregister("only"));
    assert!(context.is_empty());
}

#[tokio::test]
async fn concurrent_requests_share_one_fetch() {
    let fetcher = Arc::new(CountingFetcher::default());
    let loader = Arc::new(ResourceLoader::new(Arc::clone(&fetcher) as Arc<dyn ResourceFetcher>));

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let loader = Arc::clone(&loader);
            tokio::spawn(async move {
                loader
                    .ensure_script("https://cdn.example.test/katex.js", "katex")
                    .await
            })
        })
        .collect();
    for task in tasks {
        task.await.expect("join").expect("load");
    }
    loader
        .ensure_script("https://cdn.example.test/katex.js", "katex")
        .await
        .expect("cached");

    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    assert_eq!(loader.fetch_count(), 1);
    assert_eq!(loader.len(), 1);
}

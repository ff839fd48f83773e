//! Cache-backed loading of engine scripts and stylesheets.
//!
//! Every asset is keyed by a stable id. The first request for an id starts a
//! load; every later or concurrent request for the same id attaches to that
//! same shared future and observes its outcome, success or failure. A style
//! requested again under a different url has its source swapped in place:
//! the slot (and its position in [`ResourceLoader::handles`]) is kept.

use std::fmt;
use std::sync::{
    Arc,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};

use async_trait::async_trait;
use dashmap::{DashMap, mapref::entry::Entry};
use futures::future::{BoxFuture, FutureExt, Shared};
use metrics::counter;
use once_cell::sync::Lazy;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::domain::document::escape_attribute;
use crate::infra::assets::AssetFetcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Script,
    Style,
}

impl ResourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Script => "script",
            ResourceKind::Style => "style",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRequest {
    pub id: String,
    pub url: String,
    pub kind: ResourceKind,
}

/// What a fetch produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceBody {
    /// Engine linked into this binary; nothing to ship to a client.
    Builtin { engine: String },
    /// Fetched or generated text (CSS or script source).
    Text(String),
}

/// Persistent record of a loaded asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceHandle {
    pub id: String,
    pub url: String,
    pub kind: ResourceKind,
    pub body: ResourceBody,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResourceError {
    #[error("failed to load {url}: {message}")]
    Load { url: String, message: String },
    #[error("failed to load {url}: not found")]
    NotFound { url: String },
    #[error("invalid resource url `{url}`: {message}")]
    InvalidUrl { url: String, message: String },
    #[error("resource `{id}` is already registered as a {existing}")]
    KindMismatch { id: String, existing: ResourceKind },
}

impl ResourceError {
    pub fn load(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Load {
            url: url.into(),
            message: message.into(),
        }
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            ResourceError::Load { url, .. }
            | ResourceError::NotFound { url }
            | ResourceError::InvalidUrl { url, .. } => Some(url),
            ResourceError::KindMismatch { .. } => None,
        }
    }
}

/// Backend that actually retrieves an asset.
#[async_trait]
pub trait ResourceFetcher: Send + Sync {
    async fn fetch(&self, request: &ResourceRequest) -> Result<ResourceBody, ResourceError>;
}

type SharedLoad = Shared<BoxFuture<'static, Result<Arc<ResourceHandle>, ResourceError>>>;

struct Slot {
    url: String,
    kind: ResourceKind,
    order: u64,
    load: SharedLoad,
}

pub struct ResourceLoader {
    fetcher: Arc<dyn ResourceFetcher>,
    slots: DashMap<String, Slot>,
    next_order: AtomicU64,
    fetches: Arc<AtomicUsize>,
}

static RESOURCE_LOADER: Lazy<Arc<ResourceLoader>> =
    Lazy::new(|| Arc::new(ResourceLoader::new(Arc::new(AssetFetcher::default()))));

/// Process-wide loader shared by every rendering surface.
pub fn resource_loader() -> Arc<ResourceLoader> {
    Arc::clone(&RESOURCE_LOADER)
}

impl ResourceLoader {
    pub fn new(fetcher: Arc<dyn ResourceFetcher>) -> Self {
        Self {
            fetcher,
            slots: DashMap::new(),
            next_order: AtomicU64::new(0),
            fetches: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub async fn ensure_script(
        &self,
        url: &str,
        id: &str,
    ) -> Result<Arc<ResourceHandle>, ResourceError> {
        self.ensure_loaded(id, url, ResourceKind::Script).await
    }

    pub async fn ensure_style(
        &self,
        url: &str,
        id: &str,
    ) -> Result<Arc<ResourceHandle>, ResourceError> {
        self.ensure_loaded(id, url, ResourceKind::Style).await
    }

    /// Load the asset identified by `id` at most once.
    pub async fn ensure_loaded(
        &self,
        id: &str,
        url: &str,
        kind: ResourceKind,
    ) -> Result<Arc<ResourceHandle>, ResourceError> {
        let load = self.slot_for(id, url, kind)?;
        load.await
    }

    /// Number of underlying fetches started by this loader.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Successfully loaded handles in first-request order.
    pub fn handles(&self) -> Vec<Arc<ResourceHandle>> {
        let mut loaded: Vec<(u64, Arc<ResourceHandle>)> = self
            .slots
            .iter()
            .filter_map(|slot| match slot.load.peek() {
                Some(Ok(handle)) => Some((slot.order, Arc::clone(handle))),
                _ => None,
            })
            .collect();
        loaded.sort_by_key(|(order, _)| *order);
        loaded.into_iter().map(|(_, handle)| handle).collect()
    }

    /// Tags a host page must include for the loaded assets. Statically linked
    /// engines contribute nothing; generated stylesheets are inlined.
    pub fn head_html(&self) -> String {
        let mut html = String::new();
        for handle in self.handles() {
            let id = escape_attribute(&handle.id);
            let url = escape_attribute(&handle.url);
            let remote = handle.url.starts_with("http://") || handle.url.starts_with("https://");
            match (&handle.body, handle.kind) {
                (ResourceBody::Builtin { .. }, _) => {}
                (ResourceBody::Text(_), ResourceKind::Script) if remote => {
                    html.push_str(&format!(
                        "<script src=\"{url}\" data-resource-id=\"{id}\" defer></script>\n"
                    ));
                }
                (ResourceBody::Text(_), ResourceKind::Style) if remote => {
                    html.push_str(&format!(
                        "<link rel=\"stylesheet\" href=\"{url}\" data-resource-id=\"{id}\" />\n"
                    ));
                }
                (ResourceBody::Text(body), ResourceKind::Script) => {
                    html.push_str(&format!(
                        "<script data-resource-id=\"{id}\">{body}</script>\n"
                    ));
                }
                (ResourceBody::Text(body), ResourceKind::Style) => {
                    html.push_str(&format!("<style data-resource-id=\"{id}\">{body}</style>\n"));
                }
            }
        }
        html
    }

    fn slot_for(
        &self,
        id: &str,
        url: &str,
        kind: ResourceKind,
    ) -> Result<SharedLoad, ResourceError> {
        let request = ResourceRequest {
            id: id.to_string(),
            url: url.to_string(),
            kind,
        };

        match self.slots.entry(id.to_string()) {
            Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                if slot.kind != kind {
                    return Err(ResourceError::KindMismatch {
                        id: id.to_string(),
                        existing: slot.kind,
                    });
                }
                if slot.url != url {
                    if kind == ResourceKind::Style {
                        info!(
                            target = "application::render::resources",
                            id,
                            previous = %slot.url,
                            url,
                            "Swapping stylesheet source in place"
                        );
                        slot.url = url.to_string();
                        slot.load = self.start_load(request);
                        return Ok(slot.load.clone());
                    }
                    debug!(
                        target = "application::render::resources",
                        id,
                        loaded = %slot.url,
                        requested = url,
                        "Script already registered under this id; reusing it"
                    );
                }
                counter!("paperflow_resource_cache_hit_total", "kind" => kind.as_str())
                    .increment(1);
                Ok(slot.load.clone())
            }
            Entry::Vacant(vacant) => {
                let order = self.next_order.fetch_add(1, Ordering::SeqCst);
                let load = self.start_load(request);
                vacant.insert(Slot {
                    url: url.to_string(),
                    kind,
                    order,
                    load: load.clone(),
                });
                Ok(load)
            }
        }
    }

    fn start_load(&self, request: ResourceRequest) -> SharedLoad {
        let fetcher = Arc::clone(&self.fetcher);
        let fetches = Arc::clone(&self.fetches);
        async move {
            fetches.fetch_add(1, Ordering::SeqCst);
            counter!("paperflow_resource_fetch_total", "kind" => request.kind.as_str())
                .increment(1);
            match fetcher.fetch(&request).await {
                Ok(body) => {
                    debug!(
                        target = "application::render::resources",
                        id = %request.id,
                        url = %request.url,
                        kind = %request.kind,
                        "Resource loaded"
                    );
                    Ok(Arc::new(ResourceHandle {
                        id: request.id,
                        url: request.url,
                        kind: request.kind,
                        body,
                    }))
                }
                Err(err) => {
                    warn!(
                        target = "application::render::resources",
                        id = %request.id,
                        url = %request.url,
                        error = %err,
                        "Resource load failed"
                    );
                    Err(err)
                }
            }
        }
        .boxed()
        .shared()
    }
}

/// Resolve `path` against the configured resource base.
pub fn asset_url(resource_base: &str, path: &str) -> Result<String, ResourceError> {
    let trimmed = resource_base.trim();
    let normalized = format!("{}/", trimmed.trim_end_matches('/'));
    let base = Url::parse(&normalized).map_err(|err| ResourceError::InvalidUrl {
        url: trimmed.to_string(),
        message: err.to_string(),
    })?;
    base.join(path.trim_start_matches('/'))
        .map(String::from)
        .map_err(|err| ResourceError::InvalidUrl {
            url: format!("{normalized}{path}"),
            message: err.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    struct CountingFetcher {
        delay: Duration,
        fail: bool,
    }

    #[async_trait]
    impl ResourceFetcher for CountingFetcher {
        async fn fetch(&self, request: &ResourceRequest) -> Result<ResourceBody, ResourceError> {
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(ResourceError::NotFound {
                    url: request.url.clone(),
                });
            }
            Ok(ResourceBody::Text(format!("/* {} */", request.url)))
        }
    }

    fn loader(fail: bool) -> ResourceLoader {
        ResourceLoader::new(Arc::new(CountingFetcher {
            delay: Duration::from_millis(20),
            fail,
        }))
    }

    #[tokio::test]
    async fn concurrent_requests_share_one_fetch() {
        let loader = loader(false);
        let (first, second) = tokio::join!(
            loader.ensure_script("https://cdn.test/katex.js", "katex"),
            loader.ensure_script("https://cdn.test/katex.js", "katex"),
        );

        assert!(Arc::ptr_eq(&first.expect("first"), &second.expect("second")));
        assert_eq!(loader.fetch_count(), 1);
    }

    #[tokio::test]
    async fn sequential_requests_reuse_cached_outcome() {
        let loader = loader(false);
        loader
            .ensure_style("https://cdn.test/a.css", "theme")
            .await
            .expect("first");
        loader
            .ensure_style("https://cdn.test/a.css", "theme")
            .await
            .expect("second");

        assert_eq!(loader.fetch_count(), 1);
        assert_eq!(loader.len(), 1);
    }

    #[tokio::test]
    async fn failures_are_shared_and_name_the_url() {
        let loader = loader(true);
        let first = loader
            .ensure_script("https://cdn.test/missing.js", "engine")
            .await
            .expect_err("fails");
        let second = loader
            .ensure_script("https://cdn.test/missing.js", "engine")
            .await
            .expect_err("fails again");

        assert_eq!(first, second);
        assert_eq!(first.url(), Some("https://cdn.test/missing.js"));
        assert!(first.to_string().contains("https://cdn.test/missing.js"));
        assert_eq!(loader.fetch_count(), 1);
    }

    #[tokio::test]
    async fn style_url_change_updates_slot_in_place() {
        let loader = loader(false);
        loader
            .ensure_style("https://cdn.test/light.css", "code-theme")
            .await
            .expect("light");
        loader
            .ensure_script("https://cdn.test/engine.js", "engine")
            .await
            .expect("engine");
        let dark = loader
            .ensure_style("https://cdn.test/dark.css", "code-theme")
            .await
            .expect("dark");

        assert_eq!(dark.url, "https://cdn.test/dark.css");
        assert_eq!(loader.len(), 2);
        let ids: Vec<String> = loader.handles().iter().map(|h| h.id.clone()).collect();
        assert_eq!(ids, vec!["code-theme".to_string(), "engine".to_string()]);
        assert!(loader.head_html().contains("dark.css"));
        assert!(!loader.head_html().contains("light.css"));
    }

    #[tokio::test]
    async fn kind_mismatch_is_rejected() {
        let loader = loader(false);
        loader
            .ensure_script("https://cdn.test/x.js", "x")
            .await
            .expect("script");
        let err = loader
            .ensure_style("https://cdn.test/x.css", "x")
            .await
            .expect_err("mismatch");
        assert!(matches!(err, ResourceError::KindMismatch { .. }));
    }

    #[test]
    fn asset_url_joins_against_normalised_base() {
        assert_eq!(
            asset_url("https://cdn.test/paperflow", "katex/katex.css").expect("url"),
            "https://cdn.test/paperflow/katex/katex.css"
        );
        assert_eq!(
            asset_url("bundled://assets/", "/highlight/engine.js").expect("url"),
            "bundled://assets/highlight/engine.js"
        );
        assert!(asset_url("not a url", "x.js").is_err());
    }
}

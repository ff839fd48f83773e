//! Asset backends for the resource loader.
//!
//! `bundled://assets/...` resolves to engines linked into this binary and to
//! stylesheets generated at runtime; `file://` and `http(s)://` locators are
//! read from disk or fetched over the network.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::debug;
use url::Url;

use crate::application::render::{
    ResourceBody, ResourceError, ResourceFetcher, ResourceKind, ResourceRequest, theme_css,
};

const BUNDLED_SCHEME: &str = "bundled";
const HTTP_TIMEOUT: Duration = Duration::from_secs(15);

/// Engines that ship inside the binary, keyed by bundled path.
const BUILTIN_ENGINES: [(&str, &str); 4] = [
    ("highlight/engine.js", "syntect"),
    ("katex/katex.js", "katex"),
    ("mathjax/mathjax.js", "katex-mathml"),
    ("mermaid/mermaid.js", "mermaid-cli"),
];

const THEME_PREFIX: &str = "highlight/themes/";

#[derive(Debug, Clone, Default)]
pub struct AssetFetcher {
    client: Client,
}

impl AssetFetcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn fetch_bundled(
        &self,
        url: &Url,
        request: &ResourceRequest,
    ) -> Result<ResourceBody, ResourceError> {
        let path = bundled_path(url);
        let not_found = || ResourceError::NotFound {
            url: request.url.clone(),
        };

        match request.kind {
            ResourceKind::Script => BUILTIN_ENGINES
                .iter()
                .find(|(candidate, _)| *candidate == path)
                .map(|(_, engine)| ResourceBody::Builtin {
                    engine: (*engine).to_string(),
                })
                .ok_or_else(not_found),
            ResourceKind::Style => {
                let name = path
                    .strip_prefix(THEME_PREFIX)
                    .and_then(|file| file.strip_suffix(".css"))
                    .ok_or_else(not_found)?;
                theme_css(&percent_decode(name))
                    .map(ResourceBody::Text)
                    .ok_or_else(not_found)
            }
        }
    }

    async fn fetch_file(
        &self,
        url: &Url,
        request: &ResourceRequest,
    ) -> Result<ResourceBody, ResourceError> {
        let path = url.to_file_path().map_err(|()| ResourceError::InvalidUrl {
            url: request.url.clone(),
            message: "not a local file path".to_string(),
        })?;
        match tokio::fs::read_to_string(&path).await {
            Ok(body) => Ok(ResourceBody::Text(body)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(ResourceError::NotFound {
                    url: request.url.clone(),
                })
            }
            Err(err) => Err(ResourceError::load(&request.url, err.to_string())),
        }
    }

    async fn fetch_remote(
        &self,
        url: Url,
        request: &ResourceRequest,
    ) -> Result<ResourceBody, ResourceError> {
        let response = self
            .client
            .get(url)
            .timeout(HTTP_TIMEOUT)
            .send()
            .await
            .map_err(|err| ResourceError::load(&request.url, err.to_string()))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(ResourceError::NotFound {
                url: request.url.clone(),
            });
        }
        let response = response
            .error_for_status()
            .map_err(|err| ResourceError::load(&request.url, err.to_string()))?;
        let body = response
            .text()
            .await
            .map_err(|err| ResourceError::load(&request.url, err.to_string()))?;
        Ok(ResourceBody::Text(body))
    }
}

#[async_trait]
impl ResourceFetcher for AssetFetcher {
    async fn fetch(&self, request: &ResourceRequest) -> Result<ResourceBody, ResourceError> {
        let url = Url::parse(&request.url).map_err(|err| ResourceError::InvalidUrl {
            url: request.url.clone(),
            message: err.to_string(),
        })?;
        debug!(
            target = "infra::assets",
            id = %request.id,
            scheme = url.scheme(),
            "Fetching asset"
        );

        match url.scheme() {
            BUNDLED_SCHEME => self.fetch_bundled(&url, request),
            "file" => self.fetch_file(&url, request).await,
            "http" | "https" => self.fetch_remote(url, request).await,
            other => Err(ResourceError::InvalidUrl {
                url: request.url.clone(),
                message: format!("unsupported scheme `{other}`"),
            }),
        }
    }
}

/// Host and path of a bundled locator, without the leading `assets/` root.
fn bundled_path(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    let path = url.path().trim_start_matches('/');
    let joined = if host.is_empty() || host == "assets" {
        path.to_string()
    } else {
        format!("{host}/{path}")
    };
    joined
        .strip_prefix("assets/")
        .map(str::to_string)
        .unwrap_or(joined)
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        if bytes[index] == b'%'
            && index + 2 < bytes.len()
            && let Some(byte) = std::str::from_utf8(&bytes[index + 1..index + 3])
                .ok()
                .and_then(|hex| u8::from_str_radix(hex, 16).ok())
        {
            decoded.push(byte);
            index += 3;
            continue;
        }
        decoded.push(bytes[index]);
        index += 1;
    }
    String::from_utf8_lossy(&decoded).into_owned()
}

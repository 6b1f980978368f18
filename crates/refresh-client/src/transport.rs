//! Dispatching decorated requests over HTTP

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::debug;

use crate::error::{Error, Result};
use crate::request::{ApiRequest, ApiResponse};

/// Sends one request and returns the response, whatever its status.
///
/// Non-2xx statuses are successful transport results; only failures to get a
/// response at all (connect, timeout, body read) are errors here.
pub trait Transport: Send + Sync {
    fn execute(
        &self,
        request: ApiRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ApiResponse>> + Send + '_>>;
}

/// `reqwest`-backed transport bound to one backend base URL.
pub struct ReqwestTransport {
    client: reqwest::Client,
    base_url: String,
    timeout: Option<Duration>,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            timeout: None,
        }
    }

    /// Per-request timeout applied to every dispatch.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Resolve a request path against the base URL. Absolute URLs pass through.
    pub fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        let base = self.base_url.trim_end_matches('/');
        if path.starts_with('/') {
            format!("{base}{path}")
        } else {
            format!("{base}/{path}")
        }
    }
}

impl Transport for ReqwestTransport {
    fn execute(
        &self,
        request: ApiRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ApiResponse>> + Send + '_>> {
        Box::pin(async move {
            let url = self.url_for(&request.path);
            let mut builder = self
                .client
                .request(request.method.clone(), &url)
                .headers(request.headers);
            if let Some(timeout) = self.timeout {
                builder = builder.timeout(timeout);
            }
            if let Some(body) = request.body {
                builder = builder.body(body);
            }

            let response = builder.send().await.map_err(|e| {
                if e.is_timeout() {
                    Error::Transport(format!("request to {url} timed out: {e}"))
                } else {
                    Error::Transport(format!("request to {url} failed: {e}"))
                }
            })?;

            let status = response.status();
            let headers = response.headers().clone();
            let body = response
                .bytes()
                .await
                .map_err(|e| Error::Transport(format!("reading response from {url}: {e}")))?;

            debug!(method = %request.method, %url, status = status.as_u16(), "request completed");
            Ok(ApiResponse {
                status,
                headers,
                body,
            })
        })
    }
}

//! Decorated dispatch with transparent token refresh
//!
//! `ApiClient::send` is the only entry point callers need. It decorates the
//! request with the coordinator's current token, dispatches it, and loops:
//! an expired token parks the request until the refresh settles and then
//! replays it with the new token through the same classification. By default
//! a replay that expires again refreshes again with no upper bound; set
//! `with_max_replays` to cap it.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use token_auth::TokenStore;
use tracing::{debug, instrument, warn};

use crate::classify::{Classification, classify};
use crate::coordinator::RefreshCoordinator;
use crate::decorator::authorize;
use crate::error::{Error, Result};
use crate::refresher::HttpRefresher;
use crate::request::{ApiRequest, ApiResponse};
use crate::session::Environment;
use crate::transport::{ReqwestTransport, Transport};

/// HTTP client that refreshes expired access tokens and replays the requests
/// that hit them.
#[derive(Clone)]
pub struct ApiClient {
    transport: Arc<dyn Transport>,
    coordinator: Arc<RefreshCoordinator>,
    max_replays: Option<u32>,
}

impl ApiClient {
    pub fn new(transport: Arc<dyn Transport>, coordinator: Arc<RefreshCoordinator>) -> Self {
        Self {
            transport,
            coordinator,
            max_replays: None,
        }
    }

    /// Build a client for `base_url` that reads its tokens from `store` and
    /// refreshes against the same backend's `/refresh` endpoint.
    pub async fn setup(
        base_url: &str,
        http: reqwest::Client,
        timeout: Option<Duration>,
        store: Arc<dyn TokenStore>,
        environment: Environment,
    ) -> Result<Self> {
        let mut transport = ReqwestTransport::new(http.clone(), base_url);
        if let Some(timeout) = timeout {
            transport = transport.with_timeout(timeout);
        }
        let refresher = HttpRefresher::new(http, base_url);
        let coordinator =
            RefreshCoordinator::new(store, Arc::new(refresher), environment).await?;
        Ok(Self::new(Arc::new(transport), Arc::new(coordinator)))
    }

    /// Stop replaying after `max` refreshes for a single request.
    pub fn with_max_replays(mut self, max: u32) -> Self {
        self.max_replays = Some(max);
        self
    }

    pub fn max_replays(&self) -> Option<u32> {
        self.max_replays
    }

    pub fn coordinator(&self) -> &Arc<RefreshCoordinator> {
        &self.coordinator
    }

    /// Send a request, refreshing and replaying on an expired token.
    ///
    /// 2xx responses are returned as `Ok`. Any other status is an error:
    /// `Unauthorized` (or `AuthToken` in the server environment) for a 401
    /// that is not an expiry, `Status` for everything else, carrying the
    /// backend response unchanged.
    #[instrument(skip_all, fields(method = %request.method, path = %request.path))]
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse> {
        let token = self.coordinator.current_token();
        let mut outgoing = authorize(request, token.as_ref())?;
        let mut replays = 0u32;

        loop {
            let response = self.transport.execute(outgoing.clone()).await?;
            if response.is_success() {
                return Ok(response);
            }

            let classification = classify(response.status.as_u16(), &response.body);
            debug!(
                status = response.status.as_u16(),
                classification = classification.label(),
                "request failed"
            );

            match classification {
                Classification::Unhandled => return Err(Error::Status(Box::new(response))),
                Classification::Unauthorized => return Err(self.reject(response).await),
                Classification::TokenExpired => {
                    if self.max_replays.is_some_and(|max| replays >= max) {
                        warn!(replays, "token still expired after refresh, giving up");
                        return Err(Error::ReplayLimit(replays));
                    }
                    outgoing = self.coordinator.park(outgoing).await?;
                    replays += 1;
                    debug!(replays, "replaying request with refreshed token");
                }
            }
        }
    }

    /// `GET path`
    pub async fn get(&self, path: &str) -> Result<ApiResponse> {
        self.send(ApiRequest::get(path)).await
    }

    /// `POST path` with a JSON body
    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<ApiResponse> {
        self.send(ApiRequest::post(path).json(body)?).await
    }

    /// Terminal handling for a non-expiry 401.
    async fn reject(&self, response: ApiResponse) -> Error {
        if self.coordinator.environment().invalidate("unauthorized").await {
            Error::Unauthorized(Box::new(response))
        } else {
            Error::AuthToken
        }
    }
}

//! Single-flight refresh coordination
//!
//! The coordinator is either Idle (no session) or Refreshing (a session
//! exists). The first request that fails with an expired token opens a
//! session, joins its queue, and spawns the one refresh task for it. Any
//! request that expires while the session is open joins the same queue.
//!
//! Transitions:
//! - Idle → Refreshing (first expired token; refresh task spawned)
//! - Refreshing → Refreshing (another expired token; queued, no new refresh)
//! - Refreshing → Idle (refresh succeeded; store written, queue resumed in order)
//! - Refreshing → Idle (refresh failed; queue aborted in order, session invalidated
//!   in the client environment)
//!
//! The session slot and the default credential share one `std::sync::Mutex`
//! that is never held across an `.await`. Taking the session out of the slot
//! is the drain, so a request can never join a session whose waiters have
//! already been released; it opens the next session instead. Every session
//! carries an id and only the refresh task that opened it can settle it.
//!
//! The refresher and store run on their own task. If that task panics, the
//! session still settles, failing its waiters with
//! `token_auth::Error::RefreshAborted`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use common::Secret;
use token_auth::{CredentialPair, TokenStore};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::decorator;
use crate::error::{Error, Result};
use crate::refresher::TokenRefresher;
use crate::request::ApiRequest;
use crate::session::Environment;

/// A request parked until the current refresh settles.
///
/// Holds the original descriptor and the handle that releases the suspended
/// caller. Both `resume` and `abort` consume it, so it is released exactly once.
pub struct PendingRequest {
    request: ApiRequest,
    completion: oneshot::Sender<Result<ApiRequest>>,
}

impl PendingRequest {
    fn new(request: ApiRequest) -> (Self, oneshot::Receiver<Result<ApiRequest>>) {
        let (completion, settled) = oneshot::channel();
        (
            Self {
                request,
                completion,
            },
            settled,
        )
    }

    pub fn request(&self) -> &ApiRequest {
        &self.request
    }

    /// Hand the caller its request re-decorated with `token` for replay.
    ///
    /// Returns false if the caller stopped waiting.
    pub fn resume(self, token: &Secret<String>) -> bool {
        let replay = decorator::authorize(self.request, Some(token));
        self.completion.send(replay).is_ok()
    }

    /// Fail the caller with the refresh error.
    ///
    /// Returns false if the caller stopped waiting.
    pub fn abort(self, error: token_auth::Error) -> bool {
        self.completion.send(Err(Error::RefreshFailed(error))).is_ok()
    }
}

/// One in-flight refresh and the requests waiting on it, in arrival order.
pub struct RefreshSession {
    id: u64,
    queue: VecDeque<PendingRequest>,
    started_at: Instant,
}

impl RefreshSession {
    fn new(id: u64) -> Self {
        Self {
            id,
            queue: VecDeque::new(),
            started_at: Instant::now(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }
}

struct CoordinatorState {
    session: Option<RefreshSession>,
    /// Id of the most recently opened session
    last_session: u64,
    /// Credential attached to new requests; replaced only by a successful refresh
    default_token: Option<Secret<String>>,
}

/// Owns the refresh session for one token store.
///
/// Shared as `Arc<RefreshCoordinator>`; parking needs the `Arc` so the
/// refresh task can outlive the request that started it.
pub struct RefreshCoordinator {
    state: Mutex<CoordinatorState>,
    store: Arc<dyn TokenStore>,
    refresher: Arc<dyn TokenRefresher>,
    environment: Environment,
}

impl RefreshCoordinator {
    /// Create a coordinator whose default credential is the store's current
    /// access token.
    pub async fn new(
        store: Arc<dyn TokenStore>,
        refresher: Arc<dyn TokenRefresher>,
        environment: Environment,
    ) -> Result<Self> {
        let default_token = store
            .load()
            .await
            .map_err(Error::Store)?
            .map(|pair| pair.access_token);
        debug!(
            environment = environment.label(),
            signed_in = default_token.is_some(),
            "refresh coordinator created"
        );
        Ok(Self::with_default_token(
            store,
            refresher,
            environment,
            default_token,
        ))
    }

    /// Create a coordinator with an explicit default credential.
    pub fn with_default_token(
        store: Arc<dyn TokenStore>,
        refresher: Arc<dyn TokenRefresher>,
        environment: Environment,
        default_token: Option<Secret<String>>,
    ) -> Self {
        Self {
            state: Mutex::new(CoordinatorState {
                session: None,
                last_session: 0,
                default_token,
            }),
            store,
            refresher,
            environment,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The credential new requests are decorated with.
    pub fn current_token(&self) -> Option<Secret<String>> {
        self.lock().default_token.clone()
    }

    /// Whether a refresh session is open.
    pub fn is_refreshing(&self) -> bool {
        self.lock().session.is_some()
    }

    /// Number of requests waiting on the open session.
    pub fn queued(&self) -> usize {
        self.lock().session.as_ref().map_or(0, RefreshSession::len)
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    pub fn store(&self) -> &Arc<dyn TokenStore> {
        &self.store
    }

    /// Park a request that failed with an expired token.
    ///
    /// Opens a session and starts the refresh if none is open, otherwise joins
    /// the open one. Resolves to the request re-decorated with the new token,
    /// or to `Error::RefreshFailed` if the refresh failed.
    pub async fn park(self: &Arc<Self>, request: ApiRequest) -> Result<ApiRequest> {
        let (pending, settled) = PendingRequest::new(request);

        let (opened, session_id, position) = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let opened = state.session.is_none();
            if opened {
                state.last_session += 1;
            }
            let id = state.last_session;
            let session = state.session.get_or_insert_with(|| RefreshSession::new(id));
            session.queue.push_back(pending);
            (opened, session.id, session.queue.len())
        };
        metrics::counter!("auth_requests_parked_total").increment(1);

        if opened {
            info!(session_id, "access token expired, starting refresh");
            let coordinator = Arc::clone(self);
            tokio::spawn(async move {
                coordinator.run_refresh(session_id).await;
            });
        } else {
            debug!(session_id, position, "refresh in progress, request queued");
        }

        settled.await.unwrap_or(Err(Error::RefreshAbandoned))
    }

    /// The refresh task: one call with the stored refresh token, then settle.
    ///
    /// The store read and refresher call run on a child task so a panic in
    /// either still settles the session.
    async fn run_refresh(self: Arc<Self>, session_id: u64) {
        let store = Arc::clone(&self.store);
        let refresher = Arc::clone(&self.refresher);
        let attempt = tokio::spawn(async move {
            match store.load().await? {
                Some(pair) => refresher.refresh(pair.refresh_token.expose()).await,
                None => Err(token_auth::Error::MissingRefreshToken),
            }
        });

        let outcome = match attempt.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(session_id, error = %e, "refresh task did not complete");
                Err(token_auth::Error::RefreshAborted(e.to_string()))
            }
        };
        self.settle(session_id, outcome).await;
    }

    /// Settle the open session with the refresh outcome.
    ///
    /// On success the new pair is written to the store, becomes the default
    /// credential, and every waiter is resumed in arrival order. On failure
    /// every waiter is aborted in arrival order and, in the client
    /// environment, the session is invalidated. Returns the number of waiters
    /// released. Settling while Idle, or with the id of a session that is no
    /// longer open, does nothing.
    pub(crate) async fn settle(
        &self,
        session_id: u64,
        outcome: token_auth::Result<CredentialPair>,
    ) -> usize {
        let open = self
            .lock()
            .session
            .as_ref()
            .is_some_and(|session| session.id == session_id);
        if !open {
            debug!(session_id, "refresh session not open, nothing to settle");
            return 0;
        }

        match outcome {
            Ok(pair) => {
                if let Err(e) = self.store.save(pair.clone()).await {
                    warn!(error = %e, "failed to persist refreshed tokens");
                }

                let Some(session) = self.drain(session_id, Some(pair.access_token.clone())) else {
                    return 0;
                };
                let elapsed_ms = session.started_at.elapsed().as_millis() as u64;
                let waiters = session.len();
                for pending in session.queue {
                    if !pending.resume(&pair.access_token) {
                        debug!("waiting request was dropped before resume");
                    }
                }

                metrics::counter!("auth_refresh_total", "outcome" => "success").increment(1);
                info!(waiters, elapsed_ms, "token refresh succeeded");
                waiters
            }
            Err(error) => {
                let Some(session) = self.drain(session_id, None) else {
                    return 0;
                };
                let waiters = session.len();
                for pending in session.queue {
                    if !pending.abort(error.clone()) {
                        debug!("waiting request was dropped before abort");
                    }
                }

                metrics::counter!("auth_refresh_total", "outcome" => "failure").increment(1);
                warn!(waiters, error = %error, "token refresh failed");
                self.environment.invalidate("refresh_failed").await;
                waiters
            }
        }
    }

    /// Close session `session_id` if it is the open one, swapping in the new
    /// default credential in the same critical section.
    fn drain(&self, session_id: u64, new_token: Option<Secret<String>>) -> Option<RefreshSession> {
        let mut state = self.lock();
        if state.session.as_ref()?.id != session_id {
            return None;
        }
        let session = state.session.take()?;
        if let Some(token) = new_token {
            state.default_token = Some(token);
        }
        Some(session)
    }
}

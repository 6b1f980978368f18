//! Session invalidation and execution environment
//!
//! Whether the request layer may end the session itself depends on where it
//! runs. A long-running client owns its tokens and can clear them. A server
//! handling one inbound request only holds that request's cookies; clearing
//! them would not sign the user out, so it reports `Error::AuthToken` instead
//! and lets the caller decide.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use token_auth::TokenStore;
use tracing::{debug, warn};

/// Ends the local session. Must be safe to call more than once.
pub trait SessionInvalidator: Send + Sync {
    fn invalidate_session(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Invalidates the session by clearing both stored tokens.
pub struct ClearStoredTokens {
    store: Arc<dyn TokenStore>,
}

impl ClearStoredTokens {
    pub fn new(store: Arc<dyn TokenStore>) -> Self {
        Self { store }
    }
}

impl SessionInvalidator for ClearStoredTokens {
    fn invalidate_session(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            match self.store.clear().await {
                Ok(()) => debug!("cleared stored tokens"),
                Err(e) => warn!(error = %e, "failed to clear stored tokens"),
            }
        })
    }
}

/// Where the request layer is running, chosen by whoever builds the client.
#[derive(Clone)]
pub enum Environment {
    /// Owns the ambient session and can end it directly
    Client {
        invalidator: Arc<dyn SessionInvalidator>,
    },
    /// Scoped to one inbound request; never invalidates
    Server,
}

impl Environment {
    pub fn client(invalidator: Arc<dyn SessionInvalidator>) -> Self {
        Environment::Client { invalidator }
    }

    pub fn invalidator(&self) -> Option<&Arc<dyn SessionInvalidator>> {
        match self {
            Environment::Client { invalidator } => Some(invalidator),
            Environment::Server => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Environment::Client { .. } => "client",
            Environment::Server => "server",
        }
    }

    /// Invalidate the session if this environment can. Returns whether it did.
    pub(crate) async fn invalidate(&self, reason: &'static str) -> bool {
        let Some(invalidator) = self.invalidator() else {
            debug!(reason, "server environment, leaving session invalidation to caller");
            return false;
        };
        warn!(reason, "invalidating session");
        metrics::counter!("auth_session_invalidations_total", "reason" => reason).increment(1);
        invalidator.invalidate_session().await;
        true
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use token_auth::{CookieJar, CookieOptions, CredentialPair};

    struct CountingInvalidator(AtomicUsize);

    impl SessionInvalidator for CountingInvalidator {
        fn invalidate_session(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {})
        }
    }

    #[tokio::test]
    async fn clear_stored_tokens_signs_out_and_is_idempotent() {
        let jar = Arc::new(CookieJar::new(CookieOptions::default()));
        jar.save(CredentialPair::new("T1", "R1")).await.unwrap();

        let invalidator = ClearStoredTokens::new(jar.clone());
        invalidator.invalidate_session().await;
        invalidator.invalidate_session().await;

        assert!(jar.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn client_environment_invalidates() {
        let counter = Arc::new(CountingInvalidator(AtomicUsize::new(0)));
        let environment = Environment::client(counter.clone());

        assert!(environment.invalidate("unauthorized").await);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert_eq!(environment.label(), "client");
    }

    #[tokio::test]
    async fn server_environment_never_invalidates() {
        let environment = Environment::Server;
        assert!(!environment.invalidate("unauthorized").await);
        assert!(environment.invalidator().is_none());
        assert_eq!(format!("{environment:?}"), "server");
    }
}

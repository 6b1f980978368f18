//! Bearer-token request layer with single-flight token refresh
//!
//! Every request gets the current access token attached, and a
//! `401 {"code":"token.expired"}` response parks the request instead of failing
//! it. The first parked request starts one refresh; everything that expires
//! while it runs joins the same queue. When the refresh settles, parked
//! requests are released in arrival order and replayed with the new token, or
//! all fail with the refresh error.
//!
//! Request lifecycle:
//! 1. `decorator::authorize()` attaches `Authorization: Bearer <token>`
//! 2. `Transport::execute()` dispatches it
//! 3. `classify::classify()` sorts a failure into expired / unauthorized / unhandled
//! 4. Expired → `RefreshCoordinator::park()` until the refresh settles, then replay
//! 5. Unauthorized → `SessionInvalidator` (client) or `Error::AuthToken` (server)
//! 6. Unhandled → returned to the caller untouched

pub mod classify;
pub mod client;
pub mod coordinator;
pub mod decorator;
pub mod error;
pub mod refresher;
pub mod request;
pub mod session;
pub mod transport;

pub use classify::{Classification, TOKEN_EXPIRED_CODE, classify};
pub use client::ApiClient;
pub use coordinator::{PendingRequest, RefreshCoordinator, RefreshSession};
pub use decorator::authorize;
pub use error::{Error, Result};
pub use refresher::{HttpRefresher, TokenRefresher};
pub use request::{ApiRequest, ApiResponse};
pub use session::{ClearStoredTokens, Environment, SessionInvalidator};
pub use transport::{ReqwestTransport, Transport};

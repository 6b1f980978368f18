//! Cookie names and endpoint paths shared with the authentication backend
//!
//! The backend and any browser front-end read the same two cookies, so these
//! names are part of the wire contract and must not change.

/// Cookie holding the short-lived access token
pub const ACCESS_TOKEN_COOKIE: &str = "auth.token";

/// Cookie holding the long-lived refresh token
pub const REFRESH_TOKEN_COOKIE: &str = "auth.refreshToken";

/// Backend path that trades a refresh token for a new pair
pub const REFRESH_PATH: &str = "/refresh";

/// Default cookie lifetime: 30 days
pub const DEFAULT_COOKIE_MAX_AGE_SECS: u64 = 60 * 60 * 24 * 30;

/// Default cookie visibility scope
pub const DEFAULT_COOKIE_PATH: &str = "/";

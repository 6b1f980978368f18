//! Token storage and refresh for bearer-token sessions
//!
//! Owns the credential side of the refresh protocol: the access/refresh token
//! pair, the cookie-like stores that persist it, and the `POST /refresh` call
//! that trades a refresh token for a new pair. The refresh coordination itself
//! lives in `refresh-client`; this crate has no knowledge of request replay.
//!
//! Credential flow:
//! 1. Sign-in writes a pair via `TokenStore::save()`
//! 2. The client reads the access token once at construction
//! 3. An expired access token triggers `token::refresh_tokens()`
//! 4. The new pair is written back via `TokenStore::save()`
//! 5. Session invalidation calls `TokenStore::clear()`

pub mod constants;
pub mod credentials;
pub mod error;
pub mod token;

pub use constants::*;
pub use credentials::{CookieJar, CookieOptions, CredentialPair, FileCookieStore, TokenStore};
pub use error::{Error, Result};
pub use token::{RefreshResponse, refresh_endpoint, refresh_tokens};

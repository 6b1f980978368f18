//! Credential storage for the access/refresh token pair
//!
//! Tokens live in two named cookie-like values (`auth.token` and
//! `auth.refreshToken`). Two stores implement the `TokenStore` seam:
//!
//! - `CookieJar` is in-memory and scoped to one inbound request. It is seeded
//!   from a `Cookie` header and renders `Set-Cookie` headers for every value
//!   written during its lifetime. The gateway uses one per request.
//! - `FileCookieStore` persists the jar as JSON for long-running clients. All
//!   writes use atomic temp-file + rename, and a tokio Mutex serializes writes
//!   from the refresh task and session invalidation.
//!
//! Both stores uphold the pair invariant on read: a store holding only one of
//! the two tokens reads as unauthenticated.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use common::Secret;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::constants::{
    ACCESS_TOKEN_COOKIE, DEFAULT_COOKIE_MAX_AGE_SECS, DEFAULT_COOKIE_PATH, REFRESH_TOKEN_COOKIE,
};
use crate::error::{Error, Result};

/// The access/refresh token pair.
///
/// Only a successful refresh (or an explicit sign-in) replaces it; everything
/// else treats it as read-only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialPair {
    pub access_token: Secret<String>,
    pub refresh_token: Secret<String>,
}

impl CredentialPair {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: Secret::new(access_token.into()),
            refresh_token: Secret::new(refresh_token.into()),
        }
    }
}

/// Options applied to every stored token value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CookieOptions {
    /// Lifetime of the stored value in seconds
    #[serde(default = "default_max_age")]
    pub max_age_seconds: u64,
    /// Visibility scope of the stored value
    #[serde(default = "default_path")]
    pub path: String,
}

fn default_max_age() -> u64 {
    DEFAULT_COOKIE_MAX_AGE_SECS
}

fn default_path() -> String {
    DEFAULT_COOKIE_PATH.to_string()
}

impl Default for CookieOptions {
    fn default() -> Self {
        Self {
            max_age_seconds: default_max_age(),
            path: default_path(),
        }
    }
}

/// Persistence seam for the credential pair.
///
/// Uses `Pin<Box<dyn Future>>` return types so stores can be shared as
/// `Arc<dyn TokenStore>`.
pub trait TokenStore: Send + Sync {
    /// Read the current pair. `None` when either token is missing.
    fn load(&self) -> Pin<Box<dyn Future<Output = Result<Option<CredentialPair>>> + Send + '_>>;

    /// Replace both tokens.
    fn save(&self, pair: CredentialPair) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Remove both tokens. Clearing an empty store succeeds.
    fn clear(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Build a pair from two looked-up values, enforcing the both-or-neither rule.
fn pair_from(access: Option<String>, refresh: Option<String>) -> Option<CredentialPair> {
    match (access, refresh) {
        (Some(access), Some(refresh)) => Some(CredentialPair::new(access, refresh)),
        (None, None) => None,
        (access, _) => {
            warn!(
                has_access_token = access.is_some(),
                "token store holds only one of the token pair, treating as signed out"
            );
            None
        }
    }
}

/// A pending cookie write, rendered as a `Set-Cookie` header.
enum CookieChange {
    Set(String),
    Remove,
}

#[derive(Default)]
struct JarState {
    values: HashMap<String, String>,
    /// Writes in first-touched order; later writes to the same name replace earlier ones
    changes: Vec<(String, CookieChange)>,
}

impl JarState {
    fn record(&mut self, name: &str, change: CookieChange) {
        match self.changes.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => entry.1 = change,
            None => self.changes.push((name.to_string(), change)),
        }
    }
}

/// RFC 6265 `cookie-octet`.
fn is_cookie_octet(b: u8) -> bool {
    matches!(b, 0x21 | 0x23..=0x2B | 0x2D..=0x3A | 0x3C..=0x5B | 0x5D..=0x7E)
}

fn check_cookie_value(name: &str, value: &str) -> Result<()> {
    if value.bytes().all(is_cookie_octet) {
        Ok(())
    } else {
        Err(Error::InvalidCookieValue(name.to_string()))
    }
}

/// In-memory cookie jar scoped to a single inbound request.
pub struct CookieJar {
    options: CookieOptions,
    state: Mutex<JarState>,
}

impl CookieJar {
    /// Create an empty jar.
    pub fn new(options: CookieOptions) -> Self {
        Self {
            options,
            state: Mutex::new(JarState::default()),
        }
    }

    /// Seed a jar from a `Cookie` request header (`a=1; b=2`).
    ///
    /// Malformed pairs are skipped. Seeded values are not echoed back by
    /// `set_cookie_headers()`.
    pub fn from_cookie_header(header: &str, options: CookieOptions) -> Self {
        let mut state = JarState::default();
        for pair in header.split(';') {
            let Some((name, value)) = pair.split_once('=') else {
                continue;
            };
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            state
                .values
                .insert(name.to_string(), value.trim().trim_matches('"').to_string());
        }
        Self {
            options,
            state: Mutex::new(state),
        }
    }

    /// Look up a single value.
    pub async fn get(&self, name: &str) -> Option<String> {
        self.state.lock().await.values.get(name).cloned()
    }

    /// Write a single value.
    ///
    /// Values outside the cookie-octet set (whitespace, `"`, `,`, `;`, backslash,
    /// controls, non-ASCII) are rejected, so a value can never add attributes
    /// to the rendered `Set-Cookie` header.
    pub async fn set(&self, name: &str, value: String) -> Result<()> {
        check_cookie_value(name, &value)?;
        let mut state = self.state.lock().await;
        state.values.insert(name.to_string(), value.clone());
        state.record(name, CookieChange::Set(value));
        Ok(())
    }

    /// Remove a single value (rendered as an immediately expiring cookie).
    pub async fn remove(&self, name: &str) {
        let mut state = self.state.lock().await;
        state.values.remove(name);
        state.record(name, CookieChange::Remove);
    }

    /// `Set-Cookie` header values for every write made through this jar.
    pub async fn set_cookie_headers(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .changes
            .iter()
            .map(|(name, change)| match change {
                CookieChange::Set(value) => format!(
                    "{name}={value}; Max-Age={}; Path={}",
                    self.options.max_age_seconds, self.options.path
                ),
                CookieChange::Remove => {
                    format!("{name}=; Max-Age=0; Path={}", self.options.path)
                }
            })
            .collect()
    }
}

impl TokenStore for CookieJar {
    fn load(&self) -> Pin<Box<dyn Future<Output = Result<Option<CredentialPair>>> + Send + '_>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(pair_from(
                state.values.get(ACCESS_TOKEN_COOKIE).cloned(),
                state.values.get(REFRESH_TOKEN_COOKIE).cloned(),
            ))
        })
    }

    fn save(&self, pair: CredentialPair) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            // Check both first so a rejected pair leaves the jar untouched
            check_cookie_value(ACCESS_TOKEN_COOKIE, pair.access_token.expose())?;
            check_cookie_value(REFRESH_TOKEN_COOKIE, pair.refresh_token.expose())?;
            self.set(ACCESS_TOKEN_COOKIE, pair.access_token.expose().clone())
                .await?;
            self.set(REFRESH_TOKEN_COOKIE, pair.refresh_token.expose().clone())
                .await?;
            debug!("stored refreshed tokens in request cookie jar");
            Ok(())
        })
    }

    fn clear(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.remove(ACCESS_TOKEN_COOKIE).await;
            self.remove(REFRESH_TOKEN_COOKIE).await;
            Ok(())
        })
    }
}

/// A persisted cookie value with the options it was written under.
#[derive(Clone, Serialize, Deserialize)]
struct StoredCookie {
    value: String,
    path: String,
    max_age_seconds: u64,
    /// Unix timestamp in seconds when the value was written
    set_at: u64,
}

impl StoredCookie {
    fn is_expired(&self, now: u64) -> bool {
        self.set_at.saturating_add(self.max_age_seconds) <= now
    }
}

/// File-backed cookie store for long-running clients.
///
/// The Mutex serializes all writes. Values past their max-age are dropped on
/// load and ignored on read.
pub struct FileCookieStore {
    path: PathBuf,
    options: CookieOptions,
    state: Mutex<HashMap<String, StoredCookie>>,
}

impl FileCookieStore {
    /// Load the store from the given file path.
    ///
    /// If the file doesn't exist, creates it as `{}` (signed out).
    pub async fn load(path: PathBuf, options: CookieOptions) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading cookie file: {e}")))?;
            let mut cookies: HashMap<String, StoredCookie> = serde_json::from_str(&contents)
                .map_err(|e| Error::CredentialParse(format!("parsing cookie file: {e}")))?;
            let now = now_secs();
            cookies.retain(|name, cookie| {
                let keep = !cookie.is_expired(now);
                if !keep {
                    debug!(cookie = name, "dropping expired cookie");
                }
                keep
            });
            info!(path = %path.display(), cookies = cookies.len(), "loaded cookie store");
            cookies
        } else {
            info!(path = %path.display(), "cookie file not found, starting signed out");
            let cookies = HashMap::new();
            write_atomic(&path, &cookies).await?;
            cookies
        };

        Ok(Self {
            path,
            options,
            state: Mutex::new(state),
        })
    }

    /// Look up a single unexpired value.
    pub async fn get(&self, name: &str) -> Option<String> {
        let state = self.state.lock().await;
        let now = now_secs();
        state
            .get(name)
            .filter(|cookie| !cookie.is_expired(now))
            .map(|cookie| cookie.value.clone())
    }

    /// Options new values are written with.
    pub fn options(&self) -> &CookieOptions {
        &self.options
    }

    fn stored(&self, value: &str, now: u64) -> StoredCookie {
        StoredCookie {
            value: value.to_string(),
            path: self.options.path.clone(),
            max_age_seconds: self.options.max_age_seconds,
            set_at: now,
        }
    }
}

impl TokenStore for FileCookieStore {
    fn load(&self) -> Pin<Box<dyn Future<Output = Result<Option<CredentialPair>>> + Send + '_>> {
        Box::pin(async move {
            Ok(pair_from(
                self.get(ACCESS_TOKEN_COOKIE).await,
                self.get(REFRESH_TOKEN_COOKIE).await,
            ))
        })
    }

    fn save(&self, pair: CredentialPair) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let now = now_secs();
            state.insert(
                ACCESS_TOKEN_COOKIE.to_string(),
                self.stored(pair.access_token.expose(), now),
            );
            state.insert(
                REFRESH_TOKEN_COOKIE.to_string(),
                self.stored(pair.refresh_token.expose(), now),
            );
            debug!("updated token pair");
            write_atomic(&self.path, &state).await
        })
    }

    fn clear(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let removed_access = state.remove(ACCESS_TOKEN_COOKIE).is_some();
            let removed_refresh = state.remove(REFRESH_TOKEN_COOKIE).is_some();
            if removed_access || removed_refresh {
                debug!("cleared token pair");
                write_atomic(&self.path, &state).await?;
            }
            Ok(())
        })
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Write cookies to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. Sets file permissions to 0600 since the file holds tokens.
async fn write_atomic(path: &Path, data: &HashMap<String, StoredCookie>) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::CredentialParse(format!("serializing cookies: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("cookie path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".cookies.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp cookie file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting cookie file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp cookie file: {e}")))?;

    debug!(path = %path.display(), "persisted cookies");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn jar_parses_cookie_header() {
        let jar = CookieJar::from_cookie_header(
            "theme=dark; auth.token=at_1; auth.refreshToken=rt_1; junk",
            CookieOptions::default(),
        );
        assert_eq!(jar.get("theme").await.as_deref(), Some("dark"));

        let pair = jar.load().await.unwrap().unwrap();
        assert_eq!(pair.access_token.expose(), "at_1");
        assert_eq!(pair.refresh_token.expose(), "rt_1");

        // Seeded values are not written back to the client
        assert!(jar.set_cookie_headers().await.is_empty());
    }

    #[tokio::test]
    async fn jar_with_half_a_pair_reads_as_signed_out() {
        let jar = CookieJar::from_cookie_header("auth.token=at_only", CookieOptions::default());
        assert!(jar.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn jar_renders_set_cookie_for_saved_pair() {
        let jar = CookieJar::new(CookieOptions {
            max_age_seconds: 3600,
            path: "/app".into(),
        });
        jar.save(CredentialPair::new("T2", "R2")).await.unwrap();

        let headers = jar.set_cookie_headers().await;
        assert_eq!(
            headers,
            vec![
                "auth.token=T2; Max-Age=3600; Path=/app".to_string(),
                "auth.refreshToken=R2; Max-Age=3600; Path=/app".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn jar_clear_expires_cookies() {
        let jar = CookieJar::from_cookie_header(
            "auth.token=at_1; auth.refreshToken=rt_1",
            CookieOptions::default(),
        );
        jar.clear().await.unwrap();
        assert!(jar.load().await.unwrap().is_none());

        let headers = jar.set_cookie_headers().await;
        assert_eq!(headers.len(), 2);
        assert!(headers.iter().all(|h| h.contains("Max-Age=0")));
    }

    #[tokio::test]
    async fn jar_rejects_values_that_would_inject_cookie_attributes() {
        let jar = CookieJar::from_cookie_header(
            "auth.token=T1; auth.refreshToken=R1",
            CookieOptions::default(),
        );

        for bad in ["T2; Domain=evil.example", "T2,R2", "T 2", "T2\"", "Tö"] {
            let err = jar
                .save(CredentialPair::new(bad, "R2"))
                .await
                .unwrap_err();
            assert_eq!(err, Error::InvalidCookieValue(ACCESS_TOKEN_COOKIE.into()));
        }
        let err = jar
            .save(CredentialPair::new("T2", "R2; Path=/admin"))
            .await
            .unwrap_err();
        assert_eq!(err, Error::InvalidCookieValue(REFRESH_TOKEN_COOKIE.into()));

        // Nothing was written, not even the valid half
        assert!(jar.set_cookie_headers().await.is_empty());
        let pair = jar.load().await.unwrap().unwrap();
        assert_eq!(pair.access_token.expose(), "T1");

        // JWT-shaped values pass
        jar.save(CredentialPair::new("eyJhbGciOi.eyJzdWIi.sig-_=", "R2"))
            .await
            .unwrap();
        assert_eq!(jar.set_cookie_headers().await.len(), 2);
    }

    #[tokio::test]
    async fn jar_last_write_wins_per_cookie() {
        let jar = CookieJar::new(CookieOptions::default());
        jar.set(ACCESS_TOKEN_COOKIE, "first".into()).await.unwrap();
        jar.set(ACCESS_TOKEN_COOKIE, "second".into()).await.unwrap();

        let headers = jar.set_cookie_headers().await;
        assert_eq!(headers.len(), 1);
        assert!(headers[0].starts_with("auth.token=second;"));
    }

    #[tokio::test]
    async fn file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cookies.json");

        let store = FileCookieStore::load(path.clone(), CookieOptions::default())
            .await
            .unwrap();
        store.save(CredentialPair::new("at_1", "rt_1")).await.unwrap();

        let reloaded = FileCookieStore::load(path, CookieOptions::default())
            .await
            .unwrap();
        let pair = reloaded.load().await.unwrap().unwrap();
        assert_eq!(pair, CredentialPair::new("at_1", "rt_1"));
    }

    #[tokio::test]
    async fn file_store_cold_start_creates_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cookies.json");

        let store = FileCookieStore::load(path.clone(), CookieOptions::default())
            .await
            .unwrap();
        assert!(store.load().await.unwrap().is_none());
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap().trim(), "{}");
    }

    #[tokio::test]
    async fn file_store_clear_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cookies.json");

        let store = FileCookieStore::load(path.clone(), CookieOptions::default())
            .await
            .unwrap();
        store.save(CredentialPair::new("at_1", "rt_1")).await.unwrap();
        store.clear().await.unwrap();
        store.clear().await.unwrap();

        assert!(store.load().await.unwrap().is_none());
        let reloaded = FileCookieStore::load(path, CookieOptions::default())
            .await
            .unwrap();
        assert!(reloaded.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_store_drops_expired_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cookies.json");

        let store = FileCookieStore::load(
            path.clone(),
            CookieOptions {
                max_age_seconds: 0,
                path: "/".into(),
            },
        )
        .await
        .unwrap();
        store.save(CredentialPair::new("at_1", "rt_1")).await.unwrap();

        // A zero max-age value is expired as soon as it is written
        assert!(store.load().await.unwrap().is_none());
        let reloaded = FileCookieStore::load(path, CookieOptions::default())
            .await
            .unwrap();
        assert!(reloaded.get(ACCESS_TOKEN_COOKIE).await.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_permissions_are_0600() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cookies.json");

        let store = FileCookieStore::load(path.clone(), CookieOptions::default())
            .await
            .unwrap();
        store.save(CredentialPair::new("at_1", "rt_1")).await.unwrap();

        let metadata = tokio::fs::metadata(&path).await.unwrap();
        let mode = metadata.permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "cookie file must be 0600, got {mode:o}");
    }

    #[test]
    fn cookie_options_defaults_fill_missing_fields() {
        let options: CookieOptions = serde_json::from_str(r#"{"path":"/api"}"#).unwrap();
        assert_eq!(options.path, "/api");
        assert_eq!(options.max_age_seconds, DEFAULT_COOKIE_MAX_AGE_SECS);
    }
}

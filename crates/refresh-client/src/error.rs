//! Error types for the request layer

use crate::request::ApiResponse;

/// Errors surfaced to callers of `ApiClient`.
///
/// `Status` and `Unauthorized` carry the backend's response unchanged so
/// callers can inspect it exactly as they would without the refresh layer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("request failed with status {}", .0.status)]
    Status(Box<ApiResponse>),

    #[error("unauthorized ({})", .0.status)]
    Unauthorized(Box<ApiResponse>),

    /// Must re-authenticate, but this context cannot clear the session itself
    #[error("missing or invalid auth token")]
    AuthToken,

    #[error("token refresh failed: {0}")]
    RefreshFailed(#[source] token_auth::Error),

    #[error("token refresh ended without settling")]
    RefreshAbandoned,

    #[error("token still expired after {0} replays")]
    ReplayLimit(u32),

    #[error("invalid header value: {0}")]
    InvalidHeader(String),

    #[error("token store error: {0}")]
    Store(#[source] token_auth::Error),

    #[error("response decode error: {0}")]
    Decode(String),
}

impl Error {
    /// Whether the caller has to sign in again before retrying.
    pub fn requires_reauthentication(&self) -> bool {
        matches!(
            self,
            Error::AuthToken | Error::Unauthorized(_) | Error::RefreshFailed(_)
        )
    }

    /// The backend response behind this error, when there is one.
    pub fn response(&self) -> Option<&ApiResponse> {
        match self {
            Error::Status(response) | Error::Unauthorized(response) => Some(response),
            _ => None,
        }
    }
}

/// Result alias for request layer operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn auth_failures_require_reauthentication() {
        let response = Box::new(ApiResponse::new(StatusCode::UNAUTHORIZED, "{}"));
        assert!(Error::AuthToken.requires_reauthentication());
        assert!(Error::Unauthorized(response).requires_reauthentication());
        assert!(
            Error::RefreshFailed(token_auth::Error::MissingRefreshToken)
                .requires_reauthentication()
        );
        assert!(!Error::Transport("connection refused".into()).requires_reauthentication());
    }

    #[test]
    fn status_error_exposes_response() {
        let err = Error::Status(Box::new(ApiResponse::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "boom",
        )));
        assert_eq!(err.to_string(), "request failed with status 500 Internal Server Error");
        assert_eq!(err.response().unwrap().text(), "boom");
        assert!(Error::AuthToken.response().is_none());
    }
}

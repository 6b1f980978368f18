//! Error types for token storage and refresh

/// Errors from token storage and refresh operations.
///
/// `Clone` so a single refresh failure can be handed to every caller that was
/// waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("token refresh returned {status}: {body}")]
    Refresh { status: u16, body: String },

    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("no refresh token stored")]
    MissingRefreshToken,

    #[error("token refresh did not complete: {0}")]
    RefreshAborted(String),

    #[error("value for cookie {0} contains characters not allowed in a cookie")]
    InvalidCookieValue(String),

    #[error("credential parse error: {0}")]
    CredentialParse(String),

    #[error("I/O error: {0}")]
    Io(String),
}

/// Result alias for token operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_error_reports_status_and_body() {
        let err = Error::Refresh {
            status: 503,
            body: "maintenance".into(),
        };
        assert_eq!(err.to_string(), "token refresh returned 503: maintenance");
    }

    #[test]
    fn cloned_error_compares_equal() {
        let err = Error::InvalidCredentials("refresh token revoked".into());
        assert_eq!(err.clone(), err);
    }
}

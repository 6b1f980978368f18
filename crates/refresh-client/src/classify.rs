//! Classification of failed responses
//!
//! Decides whether a failure is an expired access token (refresh and replay),
//! any other authentication failure (terminal), or something the refresh
//! layer does not handle at all. Only a 401 is ever looked at; the body's
//! `code` field tells expiry apart from every other 401.

use serde::Deserialize;

/// Error code the backend sends with a 401 when the access token has expired.
pub const TOKEN_EXPIRED_CODE: &str = "token.expired";

/// How the request layer treats a non-2xx response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// 401 with `code: "token.expired"`: refresh and replay
    TokenExpired,
    /// Any other 401: invalidate the session, never retry
    Unauthorized,
    /// Anything else: forwarded to the caller untouched
    Unhandled,
}

impl Classification {
    /// Label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Classification::TokenExpired => "token_expired",
            Classification::Unauthorized => "unauthorized",
            Classification::Unhandled => "unhandled",
        }
    }
}

#[derive(Deserialize)]
struct ApiErrorBody {
    code: Option<String>,
}

/// The `code` field of a JSON error body, if present.
pub fn error_code(body: &[u8]) -> Option<String> {
    serde_json::from_slice::<ApiErrorBody>(body).ok()?.code
}

/// Classify a failed response by status and body.
pub fn classify(status: u16, body: &[u8]) -> Classification {
    if status != 401 {
        return Classification::Unhandled;
    }
    match error_code(body).as_deref() {
        Some(TOKEN_EXPIRED_CODE) => Classification::TokenExpired,
        _ => Classification::Unauthorized,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expired_token_code() {
        let body = br#"{"error":true,"code":"token.expired","message":"Token expired."}"#;
        assert_eq!(classify(401, body), Classification::TokenExpired);
    }

    #[test]
    fn other_code_is_unauthorized() {
        assert_eq!(
            classify(401, br#"{"code":"token.invalid"}"#),
            Classification::Unauthorized
        );
    }

    #[test]
    fn missing_code_is_unauthorized() {
        assert_eq!(classify(401, br#"{"message":"nope"}"#), Classification::Unauthorized);
        assert_eq!(classify(401, b""), Classification::Unauthorized);
        assert_eq!(classify(401, b"<html>401</html>"), Classification::Unauthorized);
    }

    #[test]
    fn non_string_code_is_unauthorized() {
        assert_eq!(classify(401, br#"{"code":42}"#), Classification::Unauthorized);
    }

    #[test]
    fn expired_code_on_other_status_is_unhandled() {
        let body = br#"{"code":"token.expired"}"#;
        assert_eq!(classify(403, body), Classification::Unhandled);
        assert_eq!(classify(400, body), Classification::Unhandled);
    }

    #[test]
    fn server_errors_are_unhandled() {
        assert_eq!(classify(500, b"boom"), Classification::Unhandled);
        assert_eq!(classify(404, b""), Classification::Unhandled);
    }

    #[test]
    fn labels_are_stable() {
        assert_eq!(Classification::TokenExpired.label(), "token_expired");
        assert_eq!(Classification::Unauthorized.label(), "unauthorized");
        assert_eq!(Classification::Unhandled.label(), "unhandled");
    }
}

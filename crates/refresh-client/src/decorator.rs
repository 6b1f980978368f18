//! Attaches the bearer credential to outgoing requests

use common::Secret;
use reqwest::header::{AUTHORIZATION, HeaderValue};

use crate::error::{Error, Result};
use crate::request::ApiRequest;

/// Build the `Authorization` value for a token.
///
/// A missing token still yields a header (`Bearer ` with an empty
/// credential); the backend decides what an empty credential means.
pub fn bearer_value(token: Option<&Secret<String>>) -> Result<HeaderValue> {
    let raw = zeroize::Zeroizing::new(format!(
        "Bearer {}",
        token.map(|t| t.expose().as_str()).unwrap_or_default()
    ));
    let mut value = HeaderValue::from_str(&raw).map_err(|e| Error::InvalidHeader(e.to_string()))?;
    value.set_sensitive(true);
    Ok(value)
}

/// Return `request` with `Authorization: Bearer <token>`, replacing any
/// existing value.
pub fn authorize(mut request: ApiRequest, token: Option<&Secret<String>>) -> Result<ApiRequest> {
    request.headers.insert(AUTHORIZATION, bearer_value(token)?);
    Ok(request)
}

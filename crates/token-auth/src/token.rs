//! Access token refresh
//!
//! One interaction with the authentication backend: `POST /refresh` with the
//! stored refresh token, answered by a brand-new token pair. The refresh
//! token rotates on every call, so the caller must persist both values.

use serde::{Deserialize, Serialize};

use crate::constants::REFRESH_PATH;
use crate::credentials::CredentialPair;
use crate::error::{Error, Result};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

/// Success body of the refresh endpoint.
#[derive(Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    pub token: String,
    pub refresh_token: String,
}

impl From<RefreshResponse> for CredentialPair {
    fn from(response: RefreshResponse) -> Self {
        CredentialPair::new(response.token, response.refresh_token)
    }
}

/// Full refresh endpoint URL for a backend base URL.
pub fn refresh_endpoint(base_url: &str) -> String {
    format!("{}{REFRESH_PATH}", base_url.trim_end_matches('/'))
}

/// Trade a refresh token for a new token pair.
///
/// 401/403 from the backend means the refresh token itself is revoked or
/// expired and maps to `InvalidCredentials`.
pub async fn refresh_tokens(
    client: &reqwest::Client,
    endpoint: &str,
    refresh: &str,
) -> Result<CredentialPair> {
    let response = client
        .post(endpoint)
        .json(&RefreshRequest {
            refresh_token: refresh,
        })
        .send()
        .await
        .map_err(|e| Error::Http(format!("token refresh request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));

        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(Error::InvalidCredentials(format!(
                "refresh token rejected ({status}): {body}"
            )));
        }

        return Err(Error::Refresh {
            status: status.as_u16(),
            body,
        });
    }

    response
        .json::<RefreshResponse>()
        .await
        .map(CredentialPair::from)
        .map_err(|e| Error::CredentialParse(format!("invalid refresh response: {e}")))
}

//! The refresh call seam

use std::future::Future;
use std::pin::Pin;

use token_auth::CredentialPair;

/// Trades a refresh token for a new credential pair.
///
/// The coordinator only ever calls this from its single refresh task.
pub trait TokenRefresher: Send + Sync {
    fn refresh<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = token_auth::Result<CredentialPair>> + Send + 'a>>;
}

/// Refreshes against the backend's `POST /refresh` endpoint.
pub struct HttpRefresher {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpRefresher {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            endpoint: token_auth::refresh_endpoint(base_url),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl TokenRefresher for HttpRefresher {
    fn refresh<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = token_auth::Result<CredentialPair>> + Send + 'a>> {
        Box::pin(token_auth::refresh_tokens(
            &self.client,
            &self.endpoint,
            refresh_token,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_is_refresh_path_on_base_url() {
        let refresher = HttpRefresher::new(reqwest::Client::new(), "http://localhost:3333/");
        assert_eq!(refresher.endpoint(), "http://localhost:3333/refresh");
    }
}

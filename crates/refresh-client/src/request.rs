//! Request and response descriptors
//!
//! A request is kept as plain data rather than a built `reqwest::Request` so
//! it can be parked, re-decorated with a new token and dispatched again.

use bytes::Bytes;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};

/// An outgoing request: method, path (relative to the backend base URL, or
/// absolute), headers and optional body.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    /// Add or replace a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set a raw body.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Serialize `body` as JSON and set the content type.
    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self> {
        let bytes = serde_json::to_vec(body).map_err(|e| Error::Decode(e.to_string()))?;
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.body = Some(Bytes::from(bytes));
        Ok(self)
    }

    /// The bearer credential currently attached, if any.
    pub fn bearer_token(&self) -> Option<&str> {
        self.headers
            .get(AUTHORIZATION)?
            .to_str()
            .ok()?
            .strip_prefix("Bearer ")
    }
}

/// A completed response with its body fully read.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ApiResponse {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Body as text, replacing invalid UTF-8.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Decode the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|e| Error::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_body_sets_content_type() {
        let request = ApiRequest::post("/sessions")
            .json(&serde_json::json!({"email": "a@b.c"}))
            .unwrap();
        assert_eq!(request.headers.get(CONTENT_TYPE).unwrap(), "application/json");
        assert_eq!(request.body.as_deref(), Some(&br#"{"email":"a@b.c"}"#[..]));
    }

    #[test]
    fn bearer_token_reads_authorization_header() {
        let request =
            ApiRequest::get("/me").header(AUTHORIZATION, HeaderValue::from_static("Bearer T1"));
        assert_eq!(request.bearer_token(), Some("T1"));
        assert_eq!(ApiRequest::get("/me").bearer_token(), None);
    }

    #[test]
    fn response_decodes_json() {
        let response = ApiResponse::new(StatusCode::OK, r#"{"email":"a@b.c"}"#);
        let value: serde_json::Value = response.json().unwrap();
        assert_eq!(value["email"], "a@b.c");
        assert!(response.is_success());

        let err = ApiResponse::new(StatusCode::OK, "not json")
            .json::<serde_json::Value>()
            .unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }
}

//! Transport abstraction for provider HTTP APIs.
//!
//! Providers describe requests as plain [`HttpRequest`] values and parse the
//! returned [`HttpResponse`] bodies; the transport only moves bytes. This
//! keeps every provider testable against [`MockTransport`].
//!
//! # Status mapping
//!
//! | Status              | Error                        |
//! |---------------------|------------------------------|
//! | 2xx                 | none                         |
//! | 401, 403            | [`SyncError::Auth`]          |
//! | 408, 429, 5xx       | [`SyncError::Transient`]     |
//! | 410                 | [`SyncError::ResyncRequired`]|
//! | anything else       | [`SyncError::ProviderData`]  |

mod http;
mod mock;

pub use http::{ReqwestTransport, DEFAULT_REQUEST_TIMEOUT};
pub use mock::MockTransport;

use async_trait::async_trait;
use std::fmt;
use sync_types::SyncError;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection could not be established or was reset.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Request timed out.
    #[error("request timed out")]
    Timeout,

    /// Request could not be built (bad URL, header).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Response body could not be read.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),
}

impl From<TransportError> for SyncError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::InvalidRequest(reason) => SyncError::ProviderData(reason),
            other => SyncError::Transient(other.to_string()),
        }
    }
}

/// HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// GET
    Get,
    /// POST
    Post,
    /// PUT
    Put,
    /// DELETE
    Delete,
}

/// A provider request, independent of the HTTP client.
#[derive(Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// Method.
    pub method: Method,
    /// Absolute URL including query string.
    pub url: String,
    /// Header pairs, in order.
    pub headers: Vec<(String, String)>,
    /// Request body.
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    /// GET `url`.
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    /// POST a JSON body to `url`.
    pub fn post_json<B: serde::Serialize>(
        url: impl Into<String>,
        body: &B,
    ) -> Result<Self, SyncError> {
        let bytes =
            serde_json::to_vec(body).map_err(|e| SyncError::ProviderData(e.to_string()))?;
        Ok(Self {
            method: Method::Post,
            url: url.into(),
            headers: vec![("content-type".into(), "application/json".into())],
            body: Some(bytes),
        })
    }

    /// Add a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Add `Authorization: Bearer <token>`.
    pub fn bearer(self, token: &str) -> Self {
        self.with_header("authorization", format!("Bearer {}", token))
    }

    /// Value of the first header named `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

impl fmt::Debug for HttpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let headers: Vec<(&str, &str)> = self
            .headers
            .iter()
            .map(|(n, v)| {
                if n.eq_ignore_ascii_case("authorization") {
                    (n.as_str(), "[REDACTED]")
                } else {
                    (n.as_str(), v.as_str())
                }
            })
            .collect();
        f.debug_struct("HttpRequest")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("headers", &headers)
            .field("body", &self.body.as_ref().map(|b| format!("[{} bytes]", b.len())))
            .finish()
    }
}

/// Raw response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Body bytes.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Response with a status and body.
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// 200 with a JSON body.
    pub fn json(value: &serde_json::Value) -> Self {
        Self::new(200, value.to_string())
    }

    /// Map the status onto the error taxonomy, passing 2xx through.
    pub fn error_for_status(self) -> Result<Self, SyncError> {
        classify_status(self.status, &self.body)?;
        Ok(self)
    }
}

/// Map an HTTP status onto [`SyncError`].
pub fn classify_status(status: u16, body: &[u8]) -> Result<(), SyncError> {
    let detail = || {
        let text = String::from_utf8_lossy(body);
        let text = text.trim();
        if text.is_empty() {
            format!("HTTP {}", status)
        } else {
            format!("HTTP {}: {}", status, truncate(text, 200))
        }
    };
    match status {
        200..=299 => Ok(()),
        401 | 403 => Err(SyncError::Auth(detail())),
        408 | 429 | 500..=599 => Err(SyncError::Transient(detail())),
        410 => Err(SyncError::ResyncRequired(detail())),
        _ => Err(SyncError::ProviderData(detail())),
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Sends provider requests.
///
/// Implementations handle the HTTP client (reqwest, mock, etc).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform one request. Non-2xx statuses are returned, not raised.
    async fn request(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(classify_status(200, b"").is_ok());
        assert!(classify_status(204, b"").is_ok());
        assert!(matches!(classify_status(401, b""), Err(SyncError::Auth(_))));
        assert!(matches!(classify_status(403, b""), Err(SyncError::Auth(_))));
        assert!(matches!(classify_status(429, b""), Err(SyncError::Transient(_))));
        assert!(matches!(classify_status(503, b""), Err(SyncError::Transient(_))));
        assert!(matches!(
            classify_status(410, b""),
            Err(SyncError::ResyncRequired(_))
        ));
        assert!(matches!(
            classify_status(404, b""),
            Err(SyncError::ProviderData(_))
        ));
    }

    #[test]
    fn status_error_includes_body() {
        let err = classify_status(500, b"backend down").unwrap_err();
        assert_eq!(err.to_string(), "transient failure: HTTP 500: backend down");
    }

    #[test]
    fn debug_redacts_authorization() {
        let req = HttpRequest::get("https://api/feed").bearer("secret-token");
        let debug = format!("{:?}", req);

        assert!(!debug.contains("secret-token"));
        assert!(debug.contains("[REDACTED]"));
        assert_eq!(req.header("Authorization"), Some("Bearer secret-token"));
    }

    #[test]
    fn transport_errors_map_to_sync_errors() {
        assert!(SyncError::from(TransportError::Timeout).is_retryable());
        assert!(matches!(
            SyncError::from(TransportError::InvalidRequest("bad url".into())),
            SyncError::ProviderData(_)
        ));
    }
}

//! HTTP transport abstraction for talking to the task API.
//!
//! Defines the [`HttpTransport`] trait that the auth gateway dispatches
//! through. Concrete implementations:
//! - [`http::ReqwestTransport`]: real HTTP over `reqwest`
//! - [`scripted::ScriptedTransport`]: in-process scripted responses for testing
//!
//! A transport only moves bytes. It attaches the bearer credential it is
//! handed and reports whatever status came back; it never retries, refreshes
//! or interprets status codes.

pub mod http;
pub mod scripted;

use std::fmt;

use serde::Serialize;
use serde::de::DeserializeOwned;

/// HTTP methods used by the task API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// `GET`
    Get,
    /// `POST`
    Post,
    /// `PATCH`
    Patch,
    /// `DELETE`
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Get => write!(f, "GET"),
            Self::Post => write!(f, "POST"),
            Self::Patch => write!(f, "PATCH"),
            Self::Delete => write!(f, "DELETE"),
        }
    }
}

/// An outbound API request.
///
/// Immutable once built: retries re-send the same value with a different
/// bearer credential instead of mutating it.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    /// HTTP method.
    pub method: Method,
    /// Path relative to the API base, starting with `/`.
    pub path: String,
    /// Optional JSON body.
    pub body: Option<serde_json::Value>,
}

impl ApiRequest {
    /// A `GET` request.
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            path: path.into(),
            body: None,
        }
    }

    /// A `DELETE` request.
    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            method: Method::Delete,
            path: path.into(),
            body: None,
        }
    }

    /// A `POST` request with a JSON body.
    ///
    /// # Errors
    ///
    /// Returns [`serde_json::Error`] if `body` cannot be serialized.
    pub fn post(path: impl Into<String>, body: &impl Serialize) -> Result<Self, serde_json::Error> {
        Ok(Self {
            method: Method::Post,
            path: path.into(),
            body: Some(serde_json::to_value(body)?),
        })
    }

    /// A `PATCH` request with a JSON body.
    ///
    /// # Errors
    ///
    /// Returns [`serde_json::Error`] if `body` cannot be serialized.
    pub fn patch(path: impl Into<String>, body: &impl Serialize) -> Result<Self, serde_json::Error> {
        Ok(Self {
            method: Method::Patch,
            path: path.into(),
            body: Some(serde_json::to_value(body)?),
        })
    }
}

/// Status code meaning the credential was not accepted.
pub const STATUS_UNAUTHORIZED: u16 = 401;

/// A response as received from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    /// HTTP status code.
    pub status: u16,
    /// Raw response body.
    pub body: Vec<u8>,
}

impl ApiResponse {
    /// A response with a JSON body.
    #[must_use]
    pub fn json(status: u16, body: &serde_json::Value) -> Self {
        Self {
            status,
            body: body.to_string().into_bytes(),
        }
    }

    /// A response with an empty body.
    #[must_use]
    pub const fn empty(status: u16) -> Self {
        Self {
            status,
            body: Vec::new(),
        }
    }

    /// Whether the status is in the 2xx range.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    /// Whether the server rejected the credential.
    #[must_use]
    pub const fn is_unauthorized(&self) -> bool {
        self.status == STATUS_UNAUTHORIZED
    }

    /// Decode the body as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`serde_json::Error`] if the body is not valid JSON for `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// The body as (lossy) text, for error reporting.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Errors raised before any HTTP status was received.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The server could not be reached, or the connection broke.
    #[error("connection failed: {0}")]
    Connect(String),

    /// The request did not complete in time.
    #[error("request timed out")]
    Timeout,

    /// The request could not be built (bad URL, bad header value).
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Async transport that carries [`ApiRequest`]s to the server.
///
/// Implementations attach `bearer` (when given) as an
/// `Authorization: Bearer` header and return the response whatever its
/// status.
pub trait HttpTransport: Send + Sync {
    /// Send `request`, authorized with `bearer` if present.
    fn send(
        &self,
        request: &ApiRequest,
        bearer: Option<&str>,
    ) -> impl std::future::Future<Output = Result<ApiResponse, TransportError>> + Send;
}

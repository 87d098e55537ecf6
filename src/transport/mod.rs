//! Gateway transport layer.
//!
//! Issues single logical requests to the AMTP gateway with timeout and
//! retry/backoff, and maps HTTP outcomes onto [`TransportError`].
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │               Session                   │
//! └──────────────────┬──────────────────────┘
//!                    │ GatewayRequest
//!                    ▼
//! ┌─────────────────────────────────────────┐
//! │   GatewayClient (retry + classify)      │
//! └──────────────────┬──────────────────────┘
//!                    │ Arc<dyn Connection>
//!          ┌─────────┴─────────┐
//!          ▼                   ▼
//! ┌─────────────────┐ ┌─────────────────┐
//! │  HttpConnector  │ │  test doubles   │
//! │   (reqwest)     │ │  (in-memory)    │
//! └─────────────────┘ └─────────────────┘
//! ```
//!
//! # Outcome Mapping
//!
//! | Outcome                  | Result                         | Retried |
//! |--------------------------|--------------------------------|---------|
//! | 200, 201, 202, 204       | parsed body (never null)       | -       |
//! | 400                      | `BadRequest(error text)`       | no      |
//! | 401                      | `Unauthorized`                 | no      |
//! | 404                      | `NotFound`                     | no      |
//! | 429                      | `RateLimited`                  | no      |
//! | other status             | `ServerError{status, text}`    | no      |
//! | timeout                  | `Timeout` after last attempt   | yes     |
//! | network error            | `RequestFailed` after last     | yes     |

mod http;
mod retry;
#[cfg(test)]
pub(crate) mod testing;

pub use http::HttpConnector;
pub use retry::{ExponentialBackoff, RetryPolicy};

use std::sync::Arc;

use futures::future::BoxFuture;
use reqwest::Method;
use serde_json::{json, Value};
use thiserror::Error;

use crate::config::SessionConfig;
use crate::error::{Result, TransportError};

/// One logical gateway request
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayRequest {
    /// HTTP method
    pub method: Method,
    /// Path relative to the gateway base URL (starts with `/`)
    pub path: String,
    /// JSON body
    pub body: Option<Value>,
    /// Query parameters
    pub query: Vec<(String, String)>,
    /// Extra headers, added on top of the bearer token
    pub headers: Vec<(String, String)>,
    /// Bearer token for the `Authorization` header
    pub bearer: Option<String>,
}

impl GatewayRequest {
    /// Create a request without body, query or auth
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            query: Vec::new(),
            headers: Vec::new(),
            bearer: None,
        }
    }

    /// `GET path`
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    /// `POST path` with a JSON body
    pub fn post(path: impl Into<String>, body: Value) -> Self {
        let mut request = Self::new(Method::POST, path);
        request.body = Some(body);
        request
    }

    /// `DELETE path`
    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// Add a query parameter
    pub fn query(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((name.into(), value.to_string()));
        self
    }

    /// Add a header
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Attach a bearer token, if any
    pub fn bearer(mut self, token: Option<String>) -> Self {
        self.bearer = token;
        self
    }
}

/// What came back from the gateway before classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    /// HTTP status code
    pub status: u16,
    /// `Content-Type` header
    pub content_type: Option<String>,
    /// Body text
    pub body: String,
}

/// Failure below the HTTP layer; these are the only retried failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionFailure {
    /// Connect or read timed out
    #[error("timed out")]
    Timeout,
    /// Any other network error
    #[error("{0}")]
    Network(String),
}

impl From<ConnectionFailure> for TransportError {
    fn from(failure: ConnectionFailure) -> Self {
        match failure {
            ConnectionFailure::Timeout => TransportError::Timeout,
            ConnectionFailure::Network(msg) => TransportError::RequestFailed(msg),
        }
    }
}

/// An open connection to a gateway
pub trait Connection: Send + Sync {
    /// Perform one physical attempt
    fn execute<'a>(
        &'a self,
        request: &'a GatewayRequest,
    ) -> BoxFuture<'a, std::result::Result<RawResponse, ConnectionFailure>>;
}

/// Opens connections to a gateway
pub trait Connector: Send + Sync {
    /// Open a connection to `gateway_url`
    fn open(&self, gateway_url: &str, config: &SessionConfig) -> Result<Arc<dyn Connection>>;
}

/// Retrying, classifying client over a [`Connection`]
#[derive(Clone)]
pub struct GatewayClient {
    connection: Arc<dyn Connection>,
    policy: Arc<dyn RetryPolicy>,
}

impl std::fmt::Debug for GatewayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayClient")
            .field("max_attempts", &self.policy.max_attempts())
            .finish_non_exhaustive()
    }
}

impl GatewayClient {
    /// Wrap a connection with a retry policy
    pub fn new(connection: Arc<dyn Connection>, policy: Arc<dyn RetryPolicy>) -> Self {
        Self { connection, policy }
    }

    /// Retry policy in use
    pub fn policy(&self) -> &dyn RetryPolicy {
        self.policy.as_ref()
    }

    /// Send a request, retrying connection-level failures with backoff.
    ///
    /// Application responses (any HTTP status) are never retried.
    pub async fn request(
        &self,
        request: &GatewayRequest,
    ) -> std::result::Result<Value, TransportError> {
        let mut attempt = 0;
        loop {
            match self.connection.execute(request).await {
                Ok(raw) => {
                    tracing::debug!("{} {} -> {}", request.method, request.path, raw.status);
                    return classify(&raw);
                }
                Err(failure) => {
                    if !self.policy.should_retry(attempt) {
                        tracing::warn!(
                            "{} {} failed after {} attempt(s): {}",
                            request.method,
                            request.path,
                            attempt + 1,
                            failure
                        );
                        return Err(failure.into());
                    }

                    let delay = self.policy.backoff(attempt);
                    tracing::warn!(
                        "{} {} attempt {} failed: {}, retrying in {:?}",
                        request.method,
                        request.path,
                        attempt + 1,
                        failure,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Map a raw response onto a body or a [`TransportError`]
pub fn classify(raw: &RawResponse) -> std::result::Result<Value, TransportError> {
    let body = parse_body(raw);
    match raw.status {
        200 | 201 | 202 | 204 => Ok(body),
        400 => Err(TransportError::BadRequest(error_text(&body))),
        401 => Err(TransportError::Unauthorized),
        404 => Err(TransportError::NotFound),
        429 => Err(TransportError::RateLimited),
        status => Err(TransportError::ServerError {
            status,
            message: error_text(&body),
        }),
    }
}

fn parse_body(raw: &RawResponse) -> Value {
    if raw.body.trim().is_empty() {
        return json!({});
    }

    let is_json = raw
        .content_type
        .as_deref()
        .is_some_and(|ct| ct.contains("json"));
    if !is_json {
        return json!({ "message": raw.body });
    }

    match serde_json::from_str::<Value>(&raw.body) {
        Ok(Value::Null) => json!({}),
        Ok(value) => value,
        Err(_) => json!({ "message": raw.body }),
    }
}

fn error_text(body: &Value) -> String {
    ["error", "message"]
        .iter()
        .find_map(|key| body.get(key))
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .unwrap_or_else(|| "Unknown error".to_string())
}

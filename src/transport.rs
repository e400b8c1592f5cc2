//! The transport boundary: cancellable JSON-over-HTTP requests.
//!
//! The core cache only ever sees this trait; the reqwest-backed
//! `HttpTransport` is the production implementation, and tests substitute
//! channel- or closure-backed fakes.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::trace;
use url::Url;

use crate::error::QueryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
  Get,
  Post,
  Put,
  Delete,
}

/// Issues one request and resolves to the parsed JSON body of a 2xx
/// response. Non-2xx responses become `QueryError::Http` carrying the
/// server's `message` payload; signalling `cancel` resolves the call with
/// `QueryError::Cancelled` without waiting for the I/O to wind down.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn request(
    &self,
    method: Method,
    path: &str,
    body: Option<Value>,
    cancel: CancellationToken,
  ) -> Result<Value, QueryError>;
}

/// reqwest-backed transport for a single API base URL.
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
  base_url: Url,
  timeout: Option<Duration>,
}

impl HttpTransport {
  pub fn new(base_url: Url) -> Self {
    Self {
      client: reqwest::Client::new(),
      base_url,
      timeout: None,
    }
  }

  /// Per-request timeout. Off by default; timeouts surface as `Network`
  /// errors.
  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = Some(timeout);
    self
  }
}

#[async_trait]
impl Transport for HttpTransport {
  async fn request(
    &self,
    method: Method,
    path: &str,
    body: Option<Value>,
    cancel: CancellationToken,
  ) -> Result<Value, QueryError> {
    let url = self
      .base_url
      .join(path)
      .map_err(|e| QueryError::Network(format!("invalid request path {}: {}", path, e)))?;
    trace!(?method, %url, "request");

    let mut request = match method {
      Method::Get => self.client.get(url),
      Method::Post => self.client.post(url),
      Method::Put => self.client.put(url),
      Method::Delete => self.client.delete(url),
    };
    if let Some(timeout) = self.timeout {
      request = request.timeout(timeout);
    }
    if let Some(body) = body {
      request = request.json(&body);
    }

    let send = async move {
      let response = request.send().await?;
      let status = response.status();
      if !status.is_success() {
        let body = response.json::<Value>().await.ok();
        return Err(http_error(
          status.as_u16(),
          status.canonical_reason(),
          body,
        ));
      }
      if status == reqwest::StatusCode::NO_CONTENT {
        return Ok(Value::Null);
      }
      Ok(response.json::<Value>().await?)
    };

    // Cooperative abort: the caller gets Cancelled immediately; dropping
    // the send future asks reqwest to abort the underlying request.
    tokio::select! {
      biased;
      _ = cancel.cancelled() => Err(QueryError::Cancelled),
      result = send => result,
    }
  }
}

/// Map a non-2xx response to `QueryError::Http`, preferring the server's
/// JSON `message` field over the HTTP status text.
fn http_error(status: u16, reason: Option<&str>, body: Option<Value>) -> QueryError {
  let message = body
    .as_ref()
    .and_then(|b| b.get("message"))
    .and_then(|m| m.as_str())
    .map(str::to_string)
    .unwrap_or_else(|| reason.unwrap_or("request failed").to_string());
  QueryError::Http { status, message }
}

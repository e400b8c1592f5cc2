//! Error kinds for fetches and mutations.

use thiserror::Error;

/// Errors produced by the transport and stored on cache entries.
///
/// `Cancelled` is special-cased throughout: a cancelled fetch leaves its
/// entry's prior state untouched and is never surfaced to callers as a
/// failure. The other two kinds are the retryable, user-visible ones.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
  /// Transport failure before any response arrived.
  #[error("network error: {0}")]
  Network(String),

  /// Non-2xx response; `message` comes from the server's JSON error body
  /// when present, otherwise the HTTP status text.
  #[error("http {status}: {message}")]
  Http { status: u16, message: String },

  /// Request superseded or aborted. Not a failure.
  #[error("request cancelled")]
  Cancelled,
}

impl QueryError {
  pub fn is_cancelled(&self) -> bool {
    matches!(self, QueryError::Cancelled)
  }

  /// HTTP status code, if this is an `Http` error.
  pub fn status(&self) -> Option<u16> {
    match self {
      QueryError::Http { status, .. } => Some(*status),
      _ => None,
    }
  }
}

impl From<reqwest::Error> for QueryError {
  fn from(err: reqwest::Error) -> Self {
    QueryError::Network(err.to_string())
  }
}

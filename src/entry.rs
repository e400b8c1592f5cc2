//! Cache entry state: the public snapshot observers see and the internal
//! per-key record the client maintains.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::QueryError;

/// The lifecycle status of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
  /// No fetch has run for this key yet.
  Idle,
  /// Exactly one in-flight request is fetching this key.
  Fetching,
  /// The last fetch succeeded.
  Success,
  /// The last fetch failed; prior data, if any, is retained.
  Error,
}

/// An owned point-in-time view of one entry, handed to subscribers and
/// returned by `fetch_query`.
#[derive(Debug, Clone)]
pub struct QuerySnapshot {
  pub data: Option<Value>,
  pub status: QueryStatus,
  pub error: Option<QueryError>,
}

impl QuerySnapshot {
  pub fn is_fetching(&self) -> bool {
    self.status == QueryStatus::Fetching
  }

  pub fn is_success(&self) -> bool {
    self.status == QueryStatus::Success
  }

  pub fn is_error(&self) -> bool {
    self.status == QueryStatus::Error
  }

  pub fn data(&self) -> Option<&Value> {
    self.data.as_ref()
  }

  pub fn error(&self) -> Option<&QueryError> {
    self.error.as_ref()
  }

  /// Convert to a `Result` for callers that want `?` instead of matching on
  /// status. `Error` status yields the stored error; a settled entry with no
  /// data (a fetch cancelled before anything landed) yields `Cancelled`.
  pub fn into_result(self) -> Result<Value, QueryError> {
    match self.status {
      QueryStatus::Error => Err(self.error.unwrap_or(QueryError::Cancelled)),
      _ => self.data.ok_or(QueryError::Cancelled),
    }
  }
}

/// Fetch function stored on an entry so invalidation can refetch without the
/// original caller. Receives the cancellation token for the attempt.
pub(crate) type Fetcher =
  Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, Result<Value, QueryError>> + Send + Sync>;

/// Change callback registered through `subscribe`.
pub(crate) type SubscriberFn = Arc<dyn Fn(QuerySnapshot) + Send + Sync>;

pub(crate) struct Subscriber {
  pub id: u64,
  pub callback: SubscriberFn,
}

/// The owning record of one in-flight request. Exists iff the entry's status
/// is `Fetching`.
pub(crate) struct InFlight {
  /// Generation the fetch started under; results are accepted only while
  /// the entry's generation still matches.
  pub generation: u64,
  pub cancel: CancellationToken,
  /// Flipped to `true` when the fetch settles or is cancelled; deduplicated
  /// callers wait on this.
  pub done: watch::Sender<bool>,
  /// Status to restore if the fetch is cancelled rather than settled.
  pub prev_status: QueryStatus,
}

pub(crate) struct QueryEntry {
  pub data: Option<Value>,
  pub status: QueryStatus,
  pub error: Option<QueryError>,
  pub fetched_at: Option<Instant>,
  pub stale_time: Duration,
  pub gc_time: Duration,
  /// Set by `mark_stale`; forces the next access to refetch regardless of
  /// `stale_time`. Cleared by a successful fetch.
  pub invalidated: bool,
  pub generation: u64,
  pub subscribers: Vec<Subscriber>,
  /// When the last subscriber departed (or the entry was created with
  /// none); drives gc eligibility.
  pub vacated_at: Option<Instant>,
  pub fetcher: Option<Fetcher>,
  pub in_flight: Option<InFlight>,
}

impl QueryEntry {
  pub fn new(stale_time: Duration, gc_time: Duration) -> Self {
    Self {
      data: None,
      status: QueryStatus::Idle,
      error: None,
      fetched_at: None,
      stale_time,
      gc_time,
      invalidated: false,
      generation: 0,
      subscribers: Vec::new(),
      vacated_at: Some(Instant::now()),
      fetcher: None,
      in_flight: None,
    }
  }

  /// A fresh entry needs no fetch: successfully fetched, not invalidated,
  /// and younger than its stale window.
  pub fn is_fresh(&self, now: Instant) -> bool {
    if self.invalidated || self.status != QueryStatus::Success {
      return false;
    }
    match self.fetched_at {
      Some(at) => now.duration_since(at) < self.stale_time,
      None => false,
    }
  }

  pub fn snapshot(&self) -> QuerySnapshot {
    QuerySnapshot {
      data: self.data.clone(),
      status: self.status,
      error: self.error.clone(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn new_entry_is_idle_and_stale() {
    let entry = QueryEntry::new(Duration::from_secs(5), Duration::from_secs(60));
    assert_eq!(entry.status, QueryStatus::Idle);
    assert!(!entry.is_fresh(Instant::now()));
  }

  #[test]
  fn freshness_respects_stale_window_and_invalidation() {
    let mut entry = QueryEntry::new(Duration::from_secs(5), Duration::from_secs(60));
    entry.status = QueryStatus::Success;
    entry.data = Some(serde_json::json!([1, 2]));
    entry.fetched_at = Some(Instant::now());

    assert!(entry.is_fresh(Instant::now()));

    entry.invalidated = true;
    assert!(!entry.is_fresh(Instant::now()));

    entry.invalidated = false;
    entry.stale_time = Duration::ZERO;
    assert!(!entry.is_fresh(Instant::now()));
  }

  #[test]
  fn snapshot_into_result() {
    let mut entry = QueryEntry::new(Duration::ZERO, Duration::ZERO);
    entry.status = QueryStatus::Success;
    entry.data = Some(serde_json::json!({"id": "1"}));
    assert_eq!(
      entry.snapshot().into_result().unwrap(),
      serde_json::json!({"id": "1"})
    );

    entry.status = QueryStatus::Error;
    entry.error = Some(QueryError::Http {
      status: 500,
      message: "boom".into(),
    });
    assert_eq!(entry.snapshot().into_result().unwrap_err().status(), Some(500));
  }
}

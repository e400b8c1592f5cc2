//! Client-wide defaults and per-query overrides.

use std::time::Duration;

/// Defaults applied to every entry the client creates.
#[derive(Debug, Clone)]
pub struct ClientConfig {
  /// How long a successful fetch stays fresh. Zero means every access
  /// refetches (the conservative default).
  pub stale_time: Duration,
  /// How long an entry with no subscribers survives before eviction.
  pub gc_time: Duration,
}

impl Default for ClientConfig {
  fn default() -> Self {
    Self {
      stale_time: Duration::ZERO,
      gc_time: Duration::from_secs(5 * 60),
    }
  }
}

impl ClientConfig {
  pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = stale_time;
    self
  }

  pub fn with_gc_time(mut self, gc_time: Duration) -> Self {
    self.gc_time = gc_time;
    self
  }
}

/// Per-query overrides of the client defaults, passed to `fetch_query`.
///
/// An override sticks to the entry it first configures, so a list queried
/// once with a 5-second stale time keeps that window across later accesses
/// that pass `QueryOptions::default()`.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
  pub stale_time: Option<Duration>,
  pub gc_time: Option<Duration>,
}

impl QueryOptions {
  pub fn stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = Some(stale_time);
    self
  }

  pub fn gc_time(mut self, gc_time: Duration) -> Self {
    self.gc_time = Some(gc_time);
    self
  }
}

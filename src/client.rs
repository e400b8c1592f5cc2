//! The query client: an injectable, clonable handle to one in-memory cache
//! of key→entry state.
//!
//! All cache state lives behind a single mutex that is never held across an
//! await point; fetches run as spawned tasks and re-acquire the lock to
//! publish their results. Subscriber callbacks fire after the lock is
//! released, so a callback may call back into the client.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::{ClientConfig, QueryOptions};
use crate::entry::{QueryEntry, QuerySnapshot, QueryStatus, Subscriber, SubscriberFn};
use crate::key::QueryKey;

/// What `invalidate_queries` does beyond marking entries stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefetchPolicy {
  /// Refetch every stale-marked entry that currently has subscribers.
  #[default]
  Immediate,
  /// Mark stale only; the next `fetch_query` triggers the refetch. Used
  /// after deletes, where an immediate refetch would target a resource
  /// that no longer exists.
  None,
}

pub(crate) struct ClientState {
  pub entries: HashMap<QueryKey, QueryEntry>,
  pub fetching_count: usize,
  pub next_subscriber_id: u64,
}

pub(crate) struct ClientShared {
  pub state: Mutex<ClientState>,
  pub config: ClientConfig,
}

/// Handle to a query cache. Cloning shares the same cache; construct one per
/// process (or per test) and pass it to every consumer.
#[derive(Clone)]
pub struct QueryClient {
  pub(crate) inner: Arc<ClientShared>,
}

/// Callbacks gathered under the lock, invoked after it is released.
pub(crate) type Notifications = Vec<(SubscriberFn, QuerySnapshot)>;

impl QueryClient {
  pub fn new(config: ClientConfig) -> Self {
    Self {
      inner: Arc::new(ClientShared {
        state: Mutex::new(ClientState {
          entries: HashMap::new(),
          fetching_count: 0,
          next_subscriber_id: 0,
        }),
        config,
      }),
    }
  }

  pub fn config(&self) -> &ClientConfig {
    &self.inner.config
  }

  pub(crate) fn lock(&self) -> MutexGuard<'_, ClientState> {
    // A poisoned lock means a panic inside a non-awaiting critical section;
    // the map itself is still structurally sound.
    match self.inner.state.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    }
  }

  /// Current entry snapshot for `key`, if one exists. Pure lookup.
  pub fn get(&self, key: &QueryKey) -> Option<QuerySnapshot> {
    self.lock().entries.get(key).map(|e| e.snapshot())
  }

  /// Last known data for `key`, if any. Pure lookup.
  pub fn get_query_data(&self, key: &QueryKey) -> Option<Value> {
    self.lock().entries.get(key).and_then(|e| e.data.clone())
  }

  /// Overwrite `key`'s data without touching fetch bookkeeping. Creates the
  /// entry if absent. This is the optimistic-write path: `fetched_at` and
  /// the stale window still describe the last real fetch.
  pub fn set_query_data(&self, key: &QueryKey, data: Value) {
    self.write_data(key, Some(data));
  }

  /// Restore path for rollback: `None` clears data that was absent before
  /// the optimistic write.
  pub(crate) fn restore_query_data(&self, key: &QueryKey, data: Option<Value>) {
    self.write_data(key, data);
  }

  fn write_data(&self, key: &QueryKey, data: Option<Value>) {
    let notifications = {
      let mut state = self.lock();
      let entry = entry_mut(&mut state, key, &self.inner.config);
      entry.data = data;
      debug!(%key, "set data");
      collect_notifications(&state, key)
    };
    deliver(notifications);
  }

  /// Force the next access to treat `key` (exact match) as stale.
  pub fn mark_stale(&self, key: &QueryKey) {
    let mut state = self.lock();
    if let Some(entry) = state.entries.get_mut(key) {
      entry.invalidated = true;
      debug!(%key, "marked stale");
    }
  }

  /// Mark every entry whose key starts with `prefix` as stale.
  pub fn mark_stale_by_prefix(&self, prefix: &QueryKey) {
    let mut state = self.lock();
    for (key, entry) in state.entries.iter_mut() {
      if key.starts_with(prefix) {
        entry.invalidated = true;
        debug!(%key, "marked stale (prefix)");
      }
    }
  }

  /// Cancel the in-flight request for `key`, if any.
  ///
  /// Synchronous: on return the entry's generation has advanced, so the
  /// cancelled fetch can no longer publish into this entry even if its
  /// underlying I/O ignores the abort. The entry reverts to its pre-fetch
  /// status and no error is recorded.
  pub fn cancel_queries(&self, key: &QueryKey) {
    let notifications = {
      let mut state = self.lock();
      let Some(entry) = state.entries.get_mut(key) else {
        return;
      };
      let Some(in_flight) = entry.in_flight.take() else {
        return;
      };
      in_flight.cancel.cancel();
      entry.generation = entry.generation.wrapping_add(1);
      entry.status = in_flight.prev_status;
      state.fetching_count -= 1;
      let _ = in_flight.done.send(true);
      debug!(%key, "cancelled in-flight fetch");
      collect_notifications(&state, key)
    };
    deliver(notifications);
  }

  /// Mark everything under each key in `keys` stale and, per `policy`,
  /// refetch the entries that are currently observed.
  pub fn invalidate_queries(&self, keys: &[QueryKey], policy: RefetchPolicy) {
    let refetch: Vec<QueryKey> = {
      let mut state = self.lock();
      let mut refetch = Vec::new();
      for (key, entry) in state.entries.iter_mut() {
        if !keys.iter().any(|prefix| key.starts_with(prefix)) {
          continue;
        }
        entry.invalidated = true;
        debug!(%key, ?policy, "invalidated");
        if policy == RefetchPolicy::Immediate
          && !entry.subscribers.is_empty()
          && entry.fetcher.is_some()
          && entry.in_flight.is_none()
        {
          refetch.push(key.clone());
        }
      }
      refetch
    };
    for key in refetch {
      self.spawn_refetch(&key);
    }
  }

  /// Observe `key`: `callback` fires with a fresh snapshot whenever the
  /// entry's data, status, or error changes. Dropping the returned
  /// `Subscription` unsubscribes; when the last subscriber leaves, eviction
  /// is scheduled after the entry's gc window.
  pub fn subscribe(
    &self,
    key: &QueryKey,
    callback: impl Fn(QuerySnapshot) + Send + Sync + 'static,
  ) -> Subscription {
    let mut state = self.lock();
    let id = state.next_subscriber_id;
    state.next_subscriber_id += 1;
    let entry = entry_mut(&mut state, key, &self.inner.config);
    entry.vacated_at = None;
    entry.subscribers.push(Subscriber {
      id,
      callback: Arc::new(callback),
    });
    trace!(%key, id, "subscribed");
    Subscription {
      client: self.clone(),
      key: key.clone(),
      id,
    }
  }

  /// Number of entries currently fetching, for ambient loading indicators.
  pub fn fetching_count(&self) -> usize {
    self.lock().fetching_count
  }

  /// Evict every unobserved entry whose gc window has elapsed.
  pub fn sweep(&self) {
    let mut state = self.lock();
    let now = Instant::now();
    state.entries.retain(|key, entry| {
      let evict = entry.subscribers.is_empty()
        && entry.in_flight.is_none()
        && entry
          .vacated_at
          .is_some_and(|at| now.duration_since(at) >= entry.gc_time);
      if evict {
        debug!(%key, "evicted");
      }
      !evict
    });
  }

  fn unsubscribe(&self, key: &QueryKey, id: u64) {
    let gc_time = {
      let mut state = self.lock();
      let Some(entry) = state.entries.get_mut(key) else {
        return;
      };
      entry.subscribers.retain(|s| s.id != id);
      if !entry.subscribers.is_empty() {
        return;
      }
      entry.vacated_at = Some(Instant::now());
      entry.gc_time
    };
    trace!(%key, "last subscriber left, gc scheduled");

    // Delayed eviction; outside a runtime the entry waits for a manual
    // sweep() instead.
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
      let client = self.clone();
      let key = key.clone();
      handle.spawn(async move {
        tokio::time::sleep(gc_time).await;
        client.sweep();
      });
    }
  }
}

/// RAII subscription guard returned by [`QueryClient::subscribe`].
pub struct Subscription {
  client: QueryClient,
  key: QueryKey,
  id: u64,
}

impl Subscription {
  pub fn key(&self) -> &QueryKey {
    &self.key
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    self.client.unsubscribe(&self.key, self.id);
  }
}

pub(crate) fn entry_mut<'a>(
  state: &'a mut ClientState,
  key: &QueryKey,
  config: &ClientConfig,
) -> &'a mut QueryEntry {
  state
    .entries
    .entry(key.clone())
    .or_insert_with(|| QueryEntry::new(config.stale_time, config.gc_time))
}

/// Apply per-query overrides to an entry (first writer wins for the entry's
/// lifetime, see `QueryOptions`).
pub(crate) fn apply_options(entry: &mut QueryEntry, options: &QueryOptions) {
  if let Some(stale_time) = options.stale_time {
    entry.stale_time = stale_time;
  }
  if let Some(gc_time) = options.gc_time {
    entry.gc_time = gc_time;
  }
}

pub(crate) fn collect_notifications(state: &ClientState, key: &QueryKey) -> Notifications {
  let Some(entry) = state.entries.get(key) else {
    return Vec::new();
  };
  entry
    .subscribers
    .iter()
    .map(|s| (s.callback.clone(), entry.snapshot()))
    .collect()
}

pub(crate) fn deliver(notifications: Notifications) {
  for (callback, snapshot) in notifications {
    callback(snapshot);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;

  fn client() -> QueryClient {
    QueryClient::new(ClientConfig::default())
  }

  #[test]
  fn get_returns_most_recent_set() {
    let client = client();
    let key = QueryKey::new("events");

    assert!(client.get(&key).is_none());

    client.set_query_data(&key, json!([{"id": "1"}]));
    assert_eq!(client.get_query_data(&key), Some(json!([{"id": "1"}])));

    client.set_query_data(&key, json!([]));
    assert_eq!(client.get_query_data(&key), Some(json!([])));
  }

  #[test]
  fn set_does_not_touch_fetch_bookkeeping() {
    let client = client();
    let key = QueryKey::new("events");
    client.set_query_data(&key, json!(1));

    let state = client.lock();
    let entry = state.entries.get(&key).unwrap();
    assert_eq!(entry.status, QueryStatus::Idle);
    assert!(entry.fetched_at.is_none());
  }

  #[test]
  fn prefix_staleness_reaches_variants() {
    let client = client();
    let list = QueryKey::new("events");
    let detail = QueryKey::new("events").push("42");
    let filtered = QueryKey::new("events").push_params([("search", "x")]);
    let other = QueryKey::new("images");
    for key in [&list, &detail, &filtered, &other] {
      client.set_query_data(key, json!(null));
    }

    client.mark_stale_by_prefix(&list);

    let state = client.lock();
    assert!(state.entries.get(&list).unwrap().invalidated);
    assert!(state.entries.get(&detail).unwrap().invalidated);
    assert!(state.entries.get(&filtered).unwrap().invalidated);
    assert!(!state.entries.get(&other).unwrap().invalidated);
  }

  #[test]
  fn subscribers_are_notified_on_data_change() {
    let client = client();
    let key = QueryKey::new("events");
    let seen = Arc::new(AtomicUsize::new(0));

    let seen2 = seen.clone();
    let _sub = client.subscribe(&key, move |snapshot| {
      assert_eq!(snapshot.data, Some(json!("v")));
      seen2.fetch_add(1, Ordering::SeqCst);
    });

    client.set_query_data(&key, json!("v"));
    assert_eq!(seen.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn dropping_subscription_stops_notifications() {
    let client = client();
    let key = QueryKey::new("events");
    let seen = Arc::new(AtomicUsize::new(0));

    let seen2 = seen.clone();
    let sub = client.subscribe(&key, move |_| {
      seen2.fetch_add(1, Ordering::SeqCst);
    });
    client.set_query_data(&key, json!(1));
    drop(sub);
    client.set_query_data(&key, json!(2));

    assert_eq!(seen.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn sweep_evicts_only_vacated_and_expired() {
    let client = QueryClient::new(ClientConfig::default().with_gc_time(Duration::ZERO));
    let gone = QueryKey::new("events").push("gone");
    let kept = QueryKey::new("events").push("kept");
    client.set_query_data(&gone, json!(1));
    client.set_query_data(&kept, json!(2));

    let _sub = client.subscribe(&kept, |_| {});
    client.sweep();

    assert!(client.get(&gone).is_none());
    assert!(client.get(&kept).is_some());
  }

  #[test]
  fn resubscribe_clears_vacancy() {
    let client = QueryClient::new(ClientConfig::default().with_gc_time(Duration::ZERO));
    let key = QueryKey::new("events");
    client.set_query_data(&key, json!(1));

    let _sub = client.subscribe(&key, |_| {});
    client.sweep();
    assert!(client.get(&key).is_some());
  }
}

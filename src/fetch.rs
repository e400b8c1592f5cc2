//! The query executor: `fetch_query` and the in-flight request lifecycle.
//!
//! Concurrent callers for one key share a single underlying fetch; joiners
//! wait on the in-flight request's completion channel. Each fetch records
//! the entry generation it started under, and its result is accepted only
//! while that generation still matches — a cancelled or superseded fetch
//! settles into a no-op instead of clobbering newer state. Cancellation of
//! the underlying I/O is best-effort; the generation check is what makes
//! the cache correct.

use std::future::Future;

use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::client::{apply_options, collect_notifications, deliver, entry_mut, QueryClient};
use crate::config::QueryOptions;
use crate::entry::{Fetcher, InFlight, QuerySnapshot, QueryStatus};
use crate::error::QueryError;
use crate::key::QueryKey;

enum Plan {
  /// Fresh cache hit; no fetch, no suspension.
  Hit(QuerySnapshot),
  /// A fetch for this key is already in flight; wait for it.
  Join(watch::Receiver<bool>),
  /// This call started the fetch; wait for it like any joiner.
  Started(watch::Receiver<bool>),
}

impl QueryClient {
  /// Return `key`'s entry, fetching first if it is missing, stale, or
  /// invalidated. The fetcher receives a cancellation token it should
  /// forward to the transport. Errors are recorded on the entry and
  /// reflected in the returned snapshot, not thrown.
  pub async fn fetch_query<F, Fut>(
    &self,
    key: &QueryKey,
    fetcher: F,
    options: QueryOptions,
  ) -> QuerySnapshot
  where
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, QueryError>> + Send + 'static,
  {
    let fetcher: Fetcher = std::sync::Arc::new(move |token| Box::pin(fetcher(token)));

    let (plan, notifications) = {
      let mut state = self.lock();
      let entry = entry_mut(&mut state, key, &self.inner.config);
      apply_options(entry, &options);
      // Remember the fetcher so invalidation can refetch on its own.
      entry.fetcher = Some(fetcher.clone());

      if entry.is_fresh(Instant::now()) {
        trace!(%key, "cache hit");
        (Plan::Hit(entry.snapshot()), Vec::new())
      } else if let Some(in_flight) = &entry.in_flight {
        trace!(%key, "joining in-flight fetch");
        (Plan::Join(in_flight.done.subscribe()), Vec::new())
      } else {
        let (rx, notifications) = begin_fetch(self, &mut state, key, fetcher);
        (Plan::Started(rx), notifications)
      }
    };
    deliver(notifications);

    match plan {
      Plan::Hit(snapshot) => snapshot,
      Plan::Join(rx) | Plan::Started(rx) => {
        wait_done(rx).await;
        self.get(key).unwrap_or(QuerySnapshot {
          data: None,
          status: QueryStatus::Idle,
          error: None,
        })
      }
    }
  }

  /// Invalidation-driven refetch using the entry's stored fetcher. No-op if
  /// the entry is gone, has no fetcher, or is already fetching.
  pub(crate) fn spawn_refetch(&self, key: &QueryKey) {
    let notifications = {
      let mut state = self.lock();
      let Some(entry) = state.entries.get(key) else {
        return;
      };
      if entry.in_flight.is_some() {
        return;
      }
      let Some(fetcher) = entry.fetcher.clone() else {
        return;
      };
      let (_rx, notifications) = begin_fetch(self, &mut state, key, fetcher);
      notifications
    };
    deliver(notifications);
  }

  /// Publish a settled fetch into the cache. Drops the result when the
  /// entry's generation has moved on since the fetch started.
  ///
  /// A successful fetch clears the `invalidated` flag even when the
  /// invalidation arrived while the fetch was already in flight: the
  /// in-flight response is accepted as current rather than refetched a
  /// second time. Invalidation that must supersede an in-flight read has
  /// `cancel_queries` for that.
  fn complete_fetch(&self, key: &QueryKey, generation: u64, result: Result<Value, QueryError>) {
    let notifications = {
      let mut state = self.lock();
      let Some(entry) = state.entries.get_mut(key) else {
        return;
      };
      if entry.generation != generation {
        debug!(%key, generation, "dropping stale fetch result");
        return;
      }
      let Some(in_flight) = entry.in_flight.take() else {
        debug!(%key, generation, "dropping fetch result with no in-flight record");
        return;
      };
      match result {
        Ok(data) => {
          entry.data = Some(data);
          entry.status = QueryStatus::Success;
          entry.error = None;
          entry.fetched_at = Some(Instant::now());
          entry.invalidated = false;
          debug!(%key, "fetch succeeded");
        }
        Err(err) if err.is_cancelled() => {
          // Prior state stands; cancellation is not an error.
          entry.status = in_flight.prev_status;
          debug!(%key, "fetch cancelled");
        }
        Err(err) => {
          debug!(%key, %err, "fetch failed");
          entry.status = QueryStatus::Error;
          entry.error = Some(err);
        }
      }
      let _ = in_flight.done.send(true);
      state.fetching_count -= 1;
      collect_notifications(&state, key)
    };
    deliver(notifications);
  }
}

/// Register the in-flight record and spawn the fetch task. Caller holds the
/// lock and guarantees the entry exists; the returned notifications carry
/// the transition to `Fetching`.
fn begin_fetch(
  client: &QueryClient,
  state: &mut crate::client::ClientState,
  key: &QueryKey,
  fetcher: Fetcher,
) -> (watch::Receiver<bool>, crate::client::Notifications) {
  let Some(entry) = state.entries.get_mut(key) else {
    // Entry vanished between the caller's check and here; nothing to fetch.
    let (_, rx) = watch::channel(true);
    return (rx, Vec::new());
  };

  let cancel = CancellationToken::new();
  let (done_tx, done_rx) = watch::channel(false);
  let generation = entry.generation;
  entry.in_flight = Some(InFlight {
    generation,
    cancel: cancel.clone(),
    done: done_tx,
    prev_status: entry.status,
  });
  entry.status = QueryStatus::Fetching;
  state.fetching_count += 1;
  debug!(%key, generation, "fetch started");

  let task_client = client.clone();
  let task_key = key.clone();
  tokio::spawn(async move {
    let result = fetcher(cancel).await;
    task_client.complete_fetch(&task_key, generation, result);
  });

  (done_rx, collect_notifications(state, key))
}

async fn wait_done(mut rx: watch::Receiver<bool>) {
  // The sender flips to true exactly once; a dropped sender (entry evicted
  // mid-fetch) also ends the wait.
  while !*rx.borrow() {
    if rx.changed().await.is_err() {
      break;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::client::RefetchPolicy;
  use crate::config::ClientConfig;
  use serde_json::json;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Arc;
  use std::time::Duration;

  fn init_tracing() {
    let _ = tracing_subscriber::fmt()
      .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
      .with_test_writer()
      .try_init();
  }

  fn client() -> QueryClient {
    init_tracing();
    QueryClient::new(ClientConfig::default())
  }

  fn counting_fetcher(
    counter: Arc<AtomicUsize>,
    delay: Duration,
    value: Value,
  ) -> impl Fn(CancellationToken) -> futures::future::BoxFuture<'static, Result<Value, QueryError>>
       + Send
       + Sync
       + Clone
       + 'static {
    move |token: CancellationToken| {
      counter.fetch_add(1, Ordering::SeqCst);
      let value = value.clone();
      Box::pin(async move {
        tokio::select! {
          _ = tokio::time::sleep(delay) => Ok(value),
          _ = token.cancelled() => Err(QueryError::Cancelled),
        }
      })
    }
  }

  #[tokio::test]
  async fn fetch_stores_result() {
    let client = client();
    let key = QueryKey::new("events");

    let snapshot = client
      .fetch_query(
        &key,
        |_| async { Ok(json!([{"id": "1"}])) },
        QueryOptions::default(),
      )
      .await;

    assert!(snapshot.is_success());
    assert_eq!(snapshot.data, Some(json!([{"id": "1"}])));
    assert_eq!(client.fetching_count(), 0);
  }

  #[tokio::test]
  async fn concurrent_callers_share_one_fetch() {
    let client = client();
    let key = QueryKey::new("events");
    let calls = Arc::new(AtomicUsize::new(0));
    let fetcher = counting_fetcher(calls.clone(), Duration::from_millis(50), json!(7));

    let (a, b, c) = tokio::join!(
      client.fetch_query(&key, fetcher.clone(), QueryOptions::default()),
      client.fetch_query(&key, fetcher.clone(), QueryOptions::default()),
      client.fetch_query(&key, fetcher, QueryOptions::default()),
    );

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    for snapshot in [a, b, c] {
      assert_eq!(snapshot.data, Some(json!(7)));
    }
  }

  #[tokio::test(start_paused = true)]
  async fn fresh_entry_is_a_cache_hit() {
    let client = client();
    let key = QueryKey::new("events");
    let calls = Arc::new(AtomicUsize::new(0));
    let fetcher = counting_fetcher(calls.clone(), Duration::ZERO, json!(1));
    let options = QueryOptions::default().stale_time(Duration::from_secs(5));

    client.fetch_query(&key, fetcher.clone(), options.clone()).await;
    client.fetch_query(&key, fetcher.clone(), options.clone()).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Past the stale window the next access refetches.
    tokio::time::advance(Duration::from_secs(6)).await;
    client.fetch_query(&key, fetcher, options).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn zero_stale_time_always_refetches() {
    let client = client();
    let key = QueryKey::new("events");
    let calls = Arc::new(AtomicUsize::new(0));
    let fetcher = counting_fetcher(calls.clone(), Duration::ZERO, json!(1));

    client.fetch_query(&key, fetcher.clone(), QueryOptions::default()).await;
    client.fetch_query(&key, fetcher, QueryOptions::default()).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn error_is_stored_and_prior_data_retained() {
    let client = client();
    let key = QueryKey::new("events");
    client.set_query_data(&key, json!("old"));

    let snapshot = client
      .fetch_query(
        &key,
        |_| async {
          Err(QueryError::Http {
            status: 500,
            message: "boom".into(),
          })
        },
        QueryOptions::default(),
      )
      .await;

    assert!(snapshot.is_error());
    assert_eq!(snapshot.error().and_then(|e| e.status()), Some(500));
    // Stale-but-displayable: the old data survives the error.
    assert_eq!(snapshot.data, Some(json!("old")));
    assert_eq!(client.fetching_count(), 0);
  }

  #[tokio::test]
  async fn cancelled_fetch_restores_prior_state() {
    let client = client();
    let key = QueryKey::new("events");

    // Establish a successful baseline.
    client
      .fetch_query(&key, |_| async { Ok(json!("old")) }, QueryOptions::default())
      .await;

    // Start a slow cooperative fetch, then cancel it.
    let calls = Arc::new(AtomicUsize::new(0));
    let fetcher = counting_fetcher(calls, Duration::from_millis(100), json!("new"));
    let waiter = {
      let client = client.clone();
      let key = key.clone();
      tokio::spawn(async move { client.fetch_query(&key, fetcher, QueryOptions::default()).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(client.fetching_count(), 1);

    client.cancel_queries(&key);

    let snapshot = waiter.await.unwrap();
    assert!(snapshot.is_success());
    assert_eq!(snapshot.data, Some(json!("old")));
    assert!(snapshot.error.is_none());
    assert_eq!(client.fetching_count(), 0);
  }

  #[tokio::test]
  async fn late_completion_after_cancel_is_dropped() {
    let client = client();
    let key = QueryKey::new("events");
    client
      .fetch_query(&key, |_| async { Ok(json!("old")) }, QueryOptions::default())
      .await;

    // This fetch ignores its cancellation token entirely.
    let waiter = {
      let client = client.clone();
      let key = key.clone();
      tokio::spawn(async move {
        client
          .fetch_query(
            &key,
            |_| async {
              tokio::time::sleep(Duration::from_millis(50)).await;
              Ok(json!("late"))
            },
            QueryOptions::default(),
          )
          .await
      })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    client.cancel_queries(&key);
    waiter.await.unwrap();

    // Give the ignored fetch time to settle; its result must not land.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(client.get_query_data(&key), Some(json!("old")));
    assert_eq!(client.fetching_count(), 0);
  }

  #[tokio::test]
  async fn invalidate_immediate_refetches_subscribed_prefix_match() {
    let client = client();
    let list = QueryKey::new("events");
    let filtered = QueryKey::new("events").push_params([("search", "x")]);
    let calls = Arc::new(AtomicUsize::new(0));
    let fetcher = counting_fetcher(calls.clone(), Duration::ZERO, json!([]));

    client.fetch_query(&filtered, fetcher, QueryOptions::default()).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let _sub = client.subscribe(&filtered, |_| {});

    client.invalidate_queries(std::slice::from_ref(&list), RefetchPolicy::Immediate);
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn invalidate_none_defers_refetch_to_next_access() {
    let client = client();
    let key = QueryKey::new("events");
    let calls = Arc::new(AtomicUsize::new(0));
    let fetcher = counting_fetcher(calls.clone(), Duration::ZERO, json!([]));
    let options = QueryOptions::default().stale_time(Duration::from_secs(60));

    client.fetch_query(&key, fetcher.clone(), options.clone()).await;
    let _sub = client.subscribe(&key, |_| {});

    client.invalidate_queries(std::slice::from_ref(&key), RefetchPolicy::None);
    tokio::time::sleep(Duration::from_millis(20)).await;
    // Stale-marked, but no second fetch was issued.
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // The next access sees the invalidation flag and refetches despite the
    // long stale window.
    client.fetch_query(&key, fetcher, options).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn unsubscribed_entry_is_evicted_after_gc_window() {
    let client = client();
    let key = QueryKey::new("events");
    let options = QueryOptions::default().gc_time(Duration::from_millis(20));

    client
      .fetch_query(&key, |_| async { Ok(json!(1)) }, options)
      .await;
    let sub = client.subscribe(&key, |_| {});
    drop(sub);

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(client.get(&key).is_none());
  }

  #[tokio::test]
  async fn fetching_counter_tracks_in_flight_entries() {
    let client = client();
    let a = QueryKey::new("events");
    let b = QueryKey::new("images");

    let slow = |_: CancellationToken| async {
      tokio::time::sleep(Duration::from_millis(50)).await;
      Ok(json!(null))
    };
    let ha = {
      let client = client.clone();
      let a = a.clone();
      tokio::spawn(async move { client.fetch_query(&a, slow, QueryOptions::default()).await })
    };
    let hb = {
      let client = client.clone();
      let b = b.clone();
      tokio::spawn(async move { client.fetch_query(&b, slow, QueryOptions::default()).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(client.fetching_count(), 2);

    ha.await.unwrap();
    hb.await.unwrap();
    assert_eq!(client.fetching_count(), 0);
  }
}

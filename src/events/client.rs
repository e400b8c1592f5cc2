//! Cached events client: the raw API wired through the query cache and the
//! optimistic-mutation runner.
//!
//! Key layout: `["events"]` is the list, `["events", id]` a detail record,
//! `["events", {search}]` a filtered list. Invalidating `["events"]`
//! therefore reaches every variant. Selectable images live under their own
//! root (`["events-images"]`) precisely so event writes do not churn them.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::client::{QueryClient, RefetchPolicy};
use crate::config::QueryOptions;
use crate::entry::QuerySnapshot;
use crate::error::QueryError;
use crate::key::QueryKey;
use crate::mutation::Mutation;
use crate::transport::Transport;

use super::api::{encode, EventsApi};
use super::types::{Event, EventDraft, ImageAsset};

/// The full event list stays fresh for a short window and is collected
/// quickly once nothing renders it.
const LIST_STALE_TIME: Duration = Duration::from_secs(5);
const LIST_GC_TIME: Duration = Duration::from_secs(30);

pub fn events_key() -> QueryKey {
  QueryKey::new("events")
}

pub fn event_key(id: &str) -> QueryKey {
  QueryKey::new("events").push(id)
}

pub fn event_search_key(term: &str) -> QueryKey {
  QueryKey::new("events").push_params([("search", term)])
}

pub fn images_key() -> QueryKey {
  QueryKey::new("events-images")
}

/// Events API with transparent caching and optimistic writes.
#[derive(Clone)]
pub struct EventsClient {
  queries: QueryClient,
  api: EventsApi,
}

impl EventsClient {
  pub fn new(queries: QueryClient, transport: Arc<dyn Transport>) -> Self {
    Self {
      queries,
      api: EventsApi::new(transport),
    }
  }

  /// The underlying query client, for subscriptions and the ambient
  /// fetching counter.
  pub fn queries(&self) -> &QueryClient {
    &self.queries
  }

  /// All events, cached under `["events"]`.
  pub async fn events(&self) -> Result<Vec<Event>, QueryError> {
    let api = self.api.clone();
    let snapshot = self
      .queries
      .fetch_query(
        &events_key(),
        move |cancel| {
          let api = api.clone();
          async move { encode(&api.fetch_events(None, cancel).await?) }
        },
        QueryOptions::default()
          .stale_time(LIST_STALE_TIME)
          .gc_time(LIST_GC_TIME),
      )
      .await;
    decode(snapshot)
  }

  /// Events matching a search term, cached under `["events", {search}]`.
  pub async fn search_events(&self, term: &str) -> Result<Vec<Event>, QueryError> {
    let api = self.api.clone();
    let term_owned = term.to_string();
    let snapshot = self
      .queries
      .fetch_query(
        &event_search_key(term),
        move |cancel| {
          let api = api.clone();
          let term = term_owned.clone();
          async move { encode(&api.fetch_events(Some(&term), cancel).await?) }
        },
        QueryOptions::default(),
      )
      .await;
    decode(snapshot)
  }

  /// One event by id, cached under `["events", id]`.
  pub async fn event(&self, id: &str) -> Result<Event, QueryError> {
    self.event_with_options(id, QueryOptions::default()).await
  }

  /// `event` with per-call overrides — the edit view passes a 10-second
  /// stale window so opening the form right after the detail view does not
  /// refetch.
  pub async fn event_with_options(
    &self,
    id: &str,
    options: QueryOptions,
  ) -> Result<Event, QueryError> {
    let api = self.api.clone();
    let id_owned = id.to_string();
    let snapshot = self
      .queries
      .fetch_query(
        &event_key(id),
        move |cancel| {
          let api = api.clone();
          let id = id_owned.clone();
          async move { encode(&api.fetch_event(&id, cancel).await?) }
        },
        options,
      )
      .await;
    decode(snapshot)
  }

  /// Selectable image assets, cached under their own root key.
  pub async fn images(&self) -> Result<Vec<ImageAsset>, QueryError> {
    let api = self.api.clone();
    let snapshot = self
      .queries
      .fetch_query(
        &images_key(),
        move |cancel| {
          let api = api.clone();
          async move { encode(&api.fetch_images(cancel).await?) }
        },
        QueryOptions::default(),
      )
      .await;
    decode(snapshot)
  }

  /// Create an event. No optimistic write (the server assigns the id); on
  /// settle the list is invalidated and refetched where observed.
  pub async fn create_event(&self, draft: EventDraft) -> Result<Event, QueryError> {
    let api = self.api.clone();
    let mutation = Mutation::new(self.queries.clone(), move |draft: EventDraft| {
      let api = api.clone();
      async move { encode(&api.create_event(&draft).await?) }
    })
    .affected_keys(|_| vec![events_key()]);

    decode_value(mutation.run(draft).await?)
  }

  /// Update an event optimistically: the detail entry shows the draft
  /// immediately, rolls back if the server rejects it, and reconciles with
  /// the server's stored shape after settle.
  pub async fn update_event(&self, id: &str, draft: EventDraft) -> Result<Event, QueryError> {
    let api = self.api.clone();
    let remote_id = id.to_string();
    let affected_id = id.to_string();
    let optimistic_id = id.to_string();

    let mutation = Mutation::new(self.queries.clone(), move |draft: EventDraft| {
      let api = api.clone();
      let id = remote_id.clone();
      async move { encode(&api.update_event(&id, &draft).await?) }
    })
    .affected_keys(move |_| vec![event_key(&affected_id)])
    .optimistic(move |draft, _| encode(&draft.with_id(optimistic_id.clone())).ok());

    decode_value(mutation.run(draft).await?)
  }

  /// Delete an event. Everything under `["events"]` is marked stale on
  /// settle but nothing refetches until next access — an immediate refetch
  /// would target the resource that was just removed.
  pub async fn delete_event(&self, id: &str) -> Result<(), QueryError> {
    let api = self.api.clone();
    let remote_id = id.to_string();

    let mutation = Mutation::new(self.queries.clone(), move |_: ()| {
      let api = api.clone();
      let id = remote_id.clone();
      async move {
        api.delete_event(&id).await?;
        Ok(Value::Null)
      }
    })
    .affected_keys(|_| vec![events_key()])
    .refetch_policy(RefetchPolicy::None);

    mutation.run(()).await?;
    Ok(())
  }
}

fn decode<T: DeserializeOwned>(snapshot: QuerySnapshot) -> Result<T, QueryError> {
  decode_value(snapshot.into_result()?)
}

fn decode_value<T: DeserializeOwned>(value: Value) -> Result<T, QueryError> {
  serde_json::from_value(value)
    .map_err(|e| QueryError::Network(format!("malformed cached payload: {}", e)))
}

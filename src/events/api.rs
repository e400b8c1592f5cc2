//! Raw events API client: one method per endpoint, no caching.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use url::form_urlencoded;

use crate::error::QueryError;
use crate::transport::{Method, Transport};

use super::types::{Event, EventDraft, ImageAsset};

/// Thin typed wrapper over the transport for the events backend.
///
/// Read endpoints thread the caller's cancellation token through to the
/// transport; write endpoints are never cancelled by the cache (cancelling
/// queries must not abort mutations).
#[derive(Clone)]
pub struct EventsApi {
  transport: Arc<dyn Transport>,
}

impl EventsApi {
  pub fn new(transport: Arc<dyn Transport>) -> Self {
    Self { transport }
  }

  /// `GET /events`, optionally filtered: `GET /events?search=term`.
  pub async fn fetch_events(
    &self,
    search: Option<&str>,
    cancel: CancellationToken,
  ) -> Result<Vec<Event>, QueryError> {
    let path = match search {
      Some(term) => {
        let query: String = form_urlencoded::Serializer::new(String::new())
          .append_pair("search", term)
          .finish();
        format!("events?{}", query)
      }
      None => "events".to_string(),
    };
    let body = self.transport.request(Method::Get, &path, None, cancel).await?;
    field(body, "events")
  }

  /// `GET /events/:id`.
  pub async fn fetch_event(
    &self,
    id: &str,
    cancel: CancellationToken,
  ) -> Result<Event, QueryError> {
    let body = self
      .transport
      .request(Method::Get, &format!("events/{}", id), None, cancel)
      .await?;
    field(body, "event")
  }

  /// `GET /events/images`.
  pub async fn fetch_images(
    &self,
    cancel: CancellationToken,
  ) -> Result<Vec<ImageAsset>, QueryError> {
    let body = self
      .transport
      .request(Method::Get, "events/images", None, cancel)
      .await?;
    field(body, "images")
  }

  /// `POST /events`; returns the stored event with its assigned id.
  pub async fn create_event(&self, draft: &EventDraft) -> Result<Event, QueryError> {
    let body = self
      .transport
      .request(
        Method::Post,
        "events",
        Some(json!({ "event": draft })),
        CancellationToken::new(),
      )
      .await?;
    field(body, "event")
  }

  /// `PUT /events/:id`; returns the stored event.
  pub async fn update_event(&self, id: &str, draft: &EventDraft) -> Result<Event, QueryError> {
    let body = self
      .transport
      .request(
        Method::Put,
        &format!("events/{}", id),
        Some(json!({ "event": draft })),
        CancellationToken::new(),
      )
      .await?;
    field(body, "event")
  }

  /// `DELETE /events/:id`.
  pub async fn delete_event(&self, id: &str) -> Result<(), QueryError> {
    self
      .transport
      .request(
        Method::Delete,
        &format!("events/{}", id),
        None,
        CancellationToken::new(),
      )
      .await?;
    Ok(())
  }
}

/// Pull a named field out of a response envelope (`{"events": [...]}` etc).
fn field<T: DeserializeOwned>(mut body: Value, name: &str) -> Result<T, QueryError> {
  let value = body
    .get_mut(name)
    .map(Value::take)
    .ok_or_else(|| QueryError::Network(format!("response is missing `{}`", name)))?;
  serde_json::from_value(value)
    .map_err(|e| QueryError::Network(format!("malformed `{}` payload: {}", name, e)))
}

/// Serialize a typed value for storage in the cache.
pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Value, QueryError> {
  serde_json::to_value(value).map_err(|e| QueryError::Network(format!("encode failed: {}", e)))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn field_extracts_envelope_payloads() {
    let body = json!({"events": [{
      "id": "e1", "title": "t", "description": "d",
      "date": "2024-01-01", "time": "18:00", "location": "l", "image": "i.png"
    }]});
    let events: Vec<Event> = field(body, "events").unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].id, "e1");
  }

  #[test]
  fn field_reports_missing_and_malformed_payloads() {
    let err = field::<Vec<Event>>(json!({}), "events").unwrap_err();
    assert!(matches!(err, QueryError::Network(_)));

    let err = field::<Vec<Event>>(json!({"events": "nope"}), "events").unwrap_err();
    assert!(matches!(err, QueryError::Network(_)));
  }
}

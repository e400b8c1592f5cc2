//! Event records as the server defines them. The cache core never looks
//! inside these; they are (de)serialized at the typed boundary only.

use serde::{Deserialize, Serialize};

/// A stored event, including its server-assigned id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
  pub id: String,
  pub title: String,
  pub description: String,
  pub date: String,
  pub time: String,
  pub location: String,
  pub image: String,
}

/// Create/update payload: an event minus the server-assigned id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDraft {
  pub title: String,
  pub description: String,
  pub date: String,
  pub time: String,
  pub location: String,
  pub image: String,
}

impl EventDraft {
  /// The event this draft becomes once the server assigns (or confirms)
  /// `id`. Used as the optimistic shape for updates.
  pub fn with_id(&self, id: impl Into<String>) -> Event {
    Event {
      id: id.into(),
      title: self.title.clone(),
      description: self.description.clone(),
      date: self.date.clone(),
      time: self.time.clone(),
      location: self.location.clone(),
      image: self.image.clone(),
    }
  }
}

/// A selectable image asset from `GET /events/images`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageAsset {
  pub path: String,
  pub caption: String,
}

//! Typed events layer over the query cache.
//!
//! Split the way the core expects consumers to be built: plain data types,
//! a raw endpoint client that knows nothing about caching, and a cached
//! client that wires each read to a cache key and each write to an
//! optimistic mutation.

mod api;
mod client;
mod types;

pub use api::EventsApi;
pub use client::{event_key, event_search_key, events_key, images_key, EventsClient};
pub use types::{Event, EventDraft, ImageAsset};

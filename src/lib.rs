//! Async client-side query cache with optimistic mutations.
//!
//! The cache maps structural keys to entries holding last-known data plus
//! fetch bookkeeping. Reads go through [`QueryClient::fetch_query`], which
//! deduplicates concurrent callers, honors per-entry staleness windows, and
//! records errors on the entry instead of throwing them. Writes go through
//! [`Mutation`], which cancels in-flight reads for the keys it touches,
//! applies a speculative transform to the cache, rolls it back if the
//! remote call fails, and invalidates the touched keys either way so the
//! cache reconciles with what the server actually stored.
//!
//! # Example
//!
//! ```ignore
//! let client = QueryClient::new(ClientConfig::default());
//! let transport = Arc::new(HttpTransport::new(base_url));
//! let events = EventsClient::new(client.clone(), transport);
//!
//! // Reads are cached and deduplicated per key.
//! let all = events.events().await?;
//!
//! // Writes are optimistic: the detail entry shows the draft immediately
//! // and rolls back if the server rejects it.
//! events.update_event("42", draft).await?;
//!
//! // Views observe entries and the ambient loading counter.
//! let sub = client.subscribe(&events_key(), |snapshot| render(snapshot));
//! let busy = client.fetching_count() > 0;
//! ```

mod client;
mod config;
mod entry;
mod error;
mod fetch;
mod key;
mod mutation;
mod transport;

pub mod events;

pub use client::{QueryClient, RefetchPolicy, Subscription};
pub use config::{ClientConfig, QueryOptions};
pub use entry::{QuerySnapshot, QueryStatus};
pub use error::QueryError;
pub use key::{KeySegment, QueryKey};
pub use mutation::Mutation;
pub use transport::{HttpTransport, Method, Transport};

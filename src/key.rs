//! Structural cache keys.
//!
//! A `QueryKey` identifies one cached view of a resource: `["events"]` for
//! the full list, `["events", "42"]` for a detail record, or
//! `["events", {search: "park"}]` for a filtered list. Two keys address the
//! same cache slot iff they are structurally equal; parameter maps compare
//! by contents, not insertion order.

use std::collections::BTreeMap;
use std::fmt;

/// One element of a query key: a text atom (resource name, id) or a
/// parameter map (filters).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeySegment {
  Text(String),
  Params(BTreeMap<String, String>),
}

/// Ordered, structurally-compared cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct QueryKey(Vec<KeySegment>);

impl QueryKey {
  /// Create a key rooted at a resource name, e.g. `QueryKey::new("events")`.
  pub fn new(resource: impl Into<String>) -> Self {
    Self(vec![KeySegment::Text(resource.into())])
  }

  /// Append a text segment (typically a record id).
  pub fn push(mut self, segment: impl Into<String>) -> Self {
    self.0.push(KeySegment::Text(segment.into()));
    self
  }

  /// Append a parameter-map segment. Pairs are sorted by name, so
  /// `[("a","1"),("b","2")]` and `[("b","2"),("a","1")]` produce equal keys.
  pub fn push_params<K, V>(mut self, pairs: impl IntoIterator<Item = (K, V)>) -> Self
  where
    K: Into<String>,
    V: Into<String>,
  {
    let map = pairs
      .into_iter()
      .map(|(k, v)| (k.into(), v.into()))
      .collect();
    self.0.push(KeySegment::Params(map));
    self
  }

  pub fn segments(&self) -> &[KeySegment] {
    &self.0
  }

  /// Prefix relation used by invalidation: `["events", {search}]` starts
  /// with `["events"]`, and every key starts with itself.
  pub fn starts_with(&self, prefix: &QueryKey) -> bool {
    self.0.len() >= prefix.0.len() && self.0[..prefix.0.len()] == prefix.0[..]
  }
}

impl fmt::Display for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for (i, segment) in self.0.iter().enumerate() {
      if i > 0 {
        write!(f, "/")?;
      }
      match segment {
        KeySegment::Text(text) => write!(f, "{}", text)?,
        KeySegment::Params(map) => {
          write!(f, "{{")?;
          for (j, (k, v)) in map.iter().enumerate() {
            if j > 0 {
              write!(f, ",")?;
            }
            write!(f, "{}={}", k, v)?;
          }
          write!(f, "}}")?;
        }
      }
    }
    Ok(())
  }
}

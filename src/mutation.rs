//! Optimistic mutations: cancel, snapshot, speculate, call remote, roll
//! back on failure, invalidate on settle.
//!
//! Each `run` walks `idle → mutating → {success | error} → settled`. The
//! cancellation in step 1 advances the affected entries' generations under
//! the cache lock before the snapshot in step 2 is taken, so a read that
//! was in flight when the mutation started can never overwrite either the
//! snapshot or the optimistic data.

use std::future::Future;

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::debug;

use crate::client::{QueryClient, RefetchPolicy};
use crate::error::QueryError;
use crate::key::QueryKey;

/// Phase of one mutation invocation, for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MutationPhase {
  Mutating,
  Success,
  Error,
  Settled,
}

type AffectedKeysFn<I> = Box<dyn Fn(&I) -> Vec<QueryKey> + Send + Sync>;
type OptimisticFn<I> = Box<dyn Fn(&I, Option<&Value>) -> Option<Value> + Send + Sync>;
type RemoteFn<I> = Box<dyn Fn(I) -> BoxFuture<'static, Result<Value, QueryError>> + Send + Sync>;

/// A write operation against the remote, wired to the cache entries it
/// affects.
pub struct Mutation<I> {
  client: QueryClient,
  affected_keys: AffectedKeysFn<I>,
  optimistic: OptimisticFn<I>,
  remote: RemoteFn<I>,
  refetch_policy: RefetchPolicy,
}

impl<I> Mutation<I> {
  /// A mutation that only calls the remote; wire in affected keys, an
  /// optimistic transform, and a refetch policy with the builder methods.
  pub fn new<R, Fut>(client: QueryClient, remote: R) -> Self
  where
    R: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, QueryError>> + Send + 'static,
  {
    Self {
      client,
      affected_keys: Box::new(|_| Vec::new()),
      optimistic: Box::new(|_, _| None),
      remote: Box::new(move |input| Box::pin(remote(input))),
      refetch_policy: RefetchPolicy::Immediate,
    }
  }

  /// Keys this mutation touches: cancelled and snapshotted before the
  /// optimistic write, rolled back on failure, invalidated on settle.
  pub fn affected_keys(mut self, f: impl Fn(&I) -> Vec<QueryKey> + Send + Sync + 'static) -> Self {
    self.affected_keys = Box::new(f);
    self
  }

  /// Speculative transform applied to each affected key's current data
  /// before the remote call. Returning `None` leaves that entry untouched.
  pub fn optimistic(
    mut self,
    f: impl Fn(&I, Option<&Value>) -> Option<Value> + Send + Sync + 'static,
  ) -> Self {
    self.optimistic = Box::new(f);
    self
  }

  pub fn refetch_policy(mut self, policy: RefetchPolicy) -> Self {
    self.refetch_policy = policy;
    self
  }

  /// Run the mutation to completion. On failure every affected key is
  /// restored to its pre-optimistic value and the error is returned; either
  /// way the affected keys are invalidated exactly once so the cache
  /// reconciles with what the server actually stored.
  pub async fn run(&self, input: I) -> Result<Value, QueryError> {
    let keys = (self.affected_keys)(&input);
    debug!(phase = ?MutationPhase::Mutating, affected = keys.len(), "mutation started");

    // Step 1: stop in-flight reads. cancel_queries bumps each entry's
    // generation before returning, which is the acknowledgement step 2
    // depends on.
    for key in &keys {
      self.client.cancel_queries(key);
    }

    // Step 2: snapshot the pre-optimistic state for rollback.
    let previous: Vec<(QueryKey, Option<Value>)> = keys
      .iter()
      .map(|key| (key.clone(), self.client.get_query_data(key)))
      .collect();

    // Step 3: optimistic apply.
    for (key, prior) in &previous {
      if let Some(next) = (self.optimistic)(&input, prior.as_ref()) {
        debug!(%key, "optimistic write");
        self.client.set_query_data(key, next);
      }
    }

    // Step 4: the real write.
    let result = (self.remote)(input).await;

    match &result {
      Ok(_) => {
        // Optimistic data stands until the invalidation below refetches
        // whatever the server actually computed.
        debug!(phase = ?MutationPhase::Success, "remote write succeeded");
      }
      Err(err) => {
        debug!(phase = ?MutationPhase::Error, %err, "remote write failed, rolling back");
        for (key, prior) in &previous {
          self.client.restore_query_data(key, prior.clone());
        }
      }
    }

    // Settle: exactly once, success or error.
    self.client.invalidate_queries(&keys, self.refetch_policy);
    debug!(phase = ?MutationPhase::Settled, "mutation settled");

    result
  }
}

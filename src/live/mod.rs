//! # Live Store — Realtime Document Tree Access
//!
//! The live store is a JSON tree addressed by slash-separated paths
//! (`projects/{id}`, `results/{projectId}/{groupId}/{userId}`, …) that the
//! mobile and web clients read and write directly. Workers reach it through
//! the [`LiveStore`] trait so jobs can run against the REST backend
//! ([`firebase::FirebaseLiveStore`]) or an in-process tree
//! ([`memory::MemoryLiveStore`]).
//!
//! ## Write semantics
//!
//! - `set` replaces the value at a path; writing `null` deletes it.
//! - `update` is a multi-path write relative to a base path. Each key may
//!   itself contain slashes; `null` values delete.
//! - `set_if_unchanged` is a conditional replace keyed by the ETag returned
//!   from [`LiveStore::get_versioned`].
//!
//! [`transaction`] builds compare-and-retry on top of the conditional write
//! and [`chunked_delete`] removes large subtrees without oversized requests.

pub mod firebase;
pub mod memory;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::LiveStoreError;

/// Conflicts tolerated by [`transaction`] before it gives up.
pub const MAX_TRANSACTION_ATTEMPTS: u32 = 25;

/// Keys deleted per multi-path update in [`chunked_delete`].
pub const DELETE_CHUNK_SIZE: usize = 250;

/// A value together with the version tag needed for a conditional write.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned {
    pub value: Option<Value>,
    pub etag: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Committed,
    /// The value changed since the ETag was read; nothing was written.
    Conflict,
}

#[async_trait]
pub trait LiveStore: Send + Sync {
    /// Value at `path`, `None` when absent.
    async fn get(&self, path: &str) -> Result<Option<Value>, LiveStoreError>;

    async fn get_versioned(&self, path: &str) -> Result<Versioned, LiveStoreError>;

    /// Child keys of `path` without their values.
    async fn shallow_keys(&self, path: &str) -> Result<Vec<String>, LiveStoreError>;

    /// Children of `path` whose `child` field is `>= start_at`, as an object.
    async fn query_ordered(
        &self,
        path: &str,
        child: &str,
        start_at: Option<&str>,
    ) -> Result<Map<String, Value>, LiveStoreError>;

    async fn set(&self, path: &str, value: &Value) -> Result<(), LiveStoreError>;

    async fn update(&self, path: &str, values: &Map<String, Value>) -> Result<(), LiveStoreError>;

    async fn delete(&self, path: &str) -> Result<(), LiveStoreError>;

    async fn set_if_unchanged(
        &self,
        path: &str,
        value: &Value,
        etag: &str,
    ) -> Result<WriteOutcome, LiveStoreError>;
}

/// Join path segments, skipping empty ones.
pub fn join(base: &str, child: &str) -> String {
    let base = base.trim_matches('/');
    let child = child.trim_matches('/');
    match (base.is_empty(), child.is_empty()) {
        (true, _) => child.to_string(),
        (false, true) => base.to_string(),
        (false, false) => format!("{}/{}", base, child),
    }
}

/// Read-modify-write of a single path with optimistic concurrency.
///
/// `update` receives the current value and returns the value to store
/// (`None` deletes) together with a result for the caller. It is re-run
/// against fresh data after every conflict, so it must be a pure function
/// of its input. After [`MAX_TRANSACTION_ATTEMPTS`] conflicts the
/// transaction aborts with [`LiveStoreError::TransactionAborted`].
pub async fn transaction<T, F>(store: &dyn LiveStore, path: &str, mut update: F) -> Result<T, LiveStoreError>
where
    F: FnMut(Option<&Value>) -> (Option<Value>, T) + Send,
    T: Send,
{
    for attempt in 1..=MAX_TRANSACTION_ATTEMPTS {
        let current = store.get_versioned(path).await?;
        let (next, out) = update(current.value.as_ref());
        let next = next.unwrap_or(Value::Null);

        let unchanged = match &current.value {
            Some(v) => *v == next,
            None => next.is_null(),
        };
        if unchanged {
            return Ok(out);
        }
        match store.set_if_unchanged(path, &next, &current.etag).await? {
            WriteOutcome::Committed => return Ok(out),
            WriteOutcome::Conflict => {
                debug!(path, attempt, "live-store transaction conflict, retrying");
            }
        }
    }
    Err(LiveStoreError::TransactionAborted {
        path: path.to_string(),
        attempts: MAX_TRANSACTION_ATTEMPTS,
    })
}

/// Delete every child of `path` in multi-path updates of at most
/// `chunk_size` keys. The emptied node disappears with its last child.
/// Returns the number of update calls made.
pub async fn chunked_delete(store: &dyn LiveStore, path: &str, chunk_size: usize) -> Result<usize, LiveStoreError> {
    let keys = store.shallow_keys(path).await?;
    let mut calls = 0;
    for chunk in keys.chunks(chunk_size.max(1)) {
        let patch: Map<String, Value> = chunk.iter().map(|k| (k.clone(), Value::Null)).collect();
        store.update(path, &patch).await?;
        calls += 1;
    }
    debug!(path, keys = keys.len(), calls, "chunked delete");
    Ok(calls)
}

#[cfg(test)]
mod tests {
    use super::memory::{LiveOp, MemoryLiveStore};
    use super::*;
    use serde_json::json;

    #[test]
    fn join_trims_slashes() {
        assert_eq!(join("results/", "/p1"), "results/p1");
        assert_eq!(join("", "p1"), "p1");
        assert_eq!(join("p1", ""), "p1");
    }

    #[tokio::test]
    async fn chunked_delete_makes_ceil_n_over_chunk_calls() {
        let mut children = Map::new();
        for i in 0..1001 {
            children.insert(format!("g{}", i), json!({"x": i}));
        }
        let store = MemoryLiveStore::with_data(json!({"groups": {"p1": children}}));

        let calls = chunked_delete(&store, "groups/p1", 250).await.unwrap();
        assert_eq!(calls, 5);
        assert_eq!(store.get("groups/p1").await.unwrap(), None);
        let updates = store
            .operations()
            .iter()
            .filter(|op| matches!(op, LiveOp::Update { .. }))
            .count();
        assert_eq!(updates, 5);
    }

    #[tokio::test]
    async fn chunked_delete_of_missing_path_is_a_no_op() {
        let store = MemoryLiveStore::new();
        assert_eq!(chunked_delete(&store, "tasks/none", 250).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn transaction_applies_update() {
        let store = MemoryLiveStore::with_data(json!({"counters": {"a": 1}}));
        let seen = transaction(&store, "counters/a", |v| {
            let n = v.and_then(Value::as_i64).unwrap_or(0);
            (Some(json!(n + 1)), n)
        })
        .await
        .unwrap();
        assert_eq!(seen, 1);
        assert_eq!(store.get("counters/a").await.unwrap(), Some(json!(2)));
    }

    #[tokio::test]
    async fn transaction_retries_after_concurrent_write() {
        let store = MemoryLiveStore::with_data(json!({"counters": {"a": 1}}));
        store.interfere_on_next_commit("counters/a", json!(10));
        let mut runs = 0;
        transaction(&store, "counters/a", |v| {
            runs += 1;
            let n = v.and_then(Value::as_i64).unwrap_or(0);
            (Some(json!(n + 1)), ())
        })
        .await
        .unwrap();
        assert_eq!(runs, 2);
        assert_eq!(store.get("counters/a").await.unwrap(), Some(json!(11)));
    }

    #[tokio::test]
    async fn transaction_aborts_after_budget() {
        let store = MemoryLiveStore::with_data(json!({"counters": {"a": 1}}));
        store.conflict_always("counters/a");
        let err = transaction(&store, "counters/a", |v| {
            let n = v.and_then(Value::as_i64).unwrap_or(0);
            (Some(json!(n + 1)), ())
        })
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            LiveStoreError::TransactionAborted { attempts: MAX_TRANSACTION_ATTEMPTS, .. }
        ));
    }

    #[tokio::test]
    async fn transaction_returning_none_deletes() {
        let store = MemoryLiveStore::with_data(json!({"a": {"b": 1, "c": 2}}));
        transaction(&store, "a/b", |_| (None, ())).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(json!({"c": 2})));
    }
}

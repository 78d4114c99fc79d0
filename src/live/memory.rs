//! In-process live store with an operation log.
//!
//! Behaves like the realtime tree for the operations workers use: writing
//! `null` deletes, empty nodes vanish, multi-path updates are atomic. Tests
//! can inspect every call, make paths fail, and simulate a concurrent writer
//! landing between a transaction's read and its conditional write.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::{join, LiveStore, Versioned, WriteOutcome};
use crate::error::LiveStoreError;

/// One recorded call.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveOp {
    Get { path: String },
    Shallow { path: String },
    Query { path: String, child: String },
    Set { path: String },
    Update { path: String, keys: usize },
    Delete { path: String },
    ConditionalSet { path: String, committed: bool },
}

#[derive(Debug, Default)]
struct Inner {
    root: Value,
    ops: Vec<LiveOp>,
    fail_prefixes: Vec<String>,
    fail_once: Vec<String>,
    pending_interference: Vec<(String, Value)>,
    always_conflict: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryLiveStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryLiveStore {
    pub fn new() -> Self {
        Self::with_data(Value::Object(Map::new()))
    }

    pub fn with_data(root: Value) -> Self {
        MemoryLiveStore {
            inner: Arc::new(Mutex::new(Inner {
                root: strip_nulls(root).unwrap_or_else(|| Value::Object(Map::new())),
                ..Inner::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Copy of the value at `path` without recording an operation.
    pub fn snapshot(&self, path: &str) -> Option<Value> {
        get_at(&self.lock().root, &segments(path)).cloned()
    }

    pub fn operations(&self) -> Vec<LiveOp> {
        self.lock().ops.clone()
    }

    pub fn clear_operations(&self) {
        self.lock().ops.clear();
    }

    /// Every call touching a path under `prefix` fails as unavailable.
    pub fn inject_failure(&self, prefix: impl Into<String>) {
        self.lock().fail_prefixes.push(prefix.into());
    }

    /// Only the next call touching a path under `prefix` fails.
    pub fn fail_next(&self, prefix: impl Into<String>) {
        self.lock().fail_once.push(prefix.into());
    }

    pub fn clear_failures(&self) {
        let mut inner = self.lock();
        inner.fail_prefixes.clear();
        inner.fail_once.clear();
    }

    /// Write `value` at `path` just before the next conditional write is
    /// checked, as if another client got there first.
    pub fn interfere_on_next_commit(&self, path: impl Into<String>, value: Value) {
        self.lock().pending_interference.push((path.into(), value));
    }

    /// Make every conditional write on `path` report a conflict.
    pub fn conflict_always(&self, path: impl Into<String>) {
        self.lock().always_conflict.push(path.into());
    }
}

impl Inner {
    fn check(&mut self, path: &str) -> Result<(), LiveStoreError> {
        let path = path.trim_matches('/');
        let under = |p: &String| path.starts_with(p.trim_matches('/'));
        if let Some(i) = self.fail_once.iter().position(under) {
            self.fail_once.remove(i);
            return Err(LiveStoreError::Unavailable(path.to_string()));
        }
        if self.fail_prefixes.iter().any(under) {
            return Err(LiveStoreError::Unavailable(path.to_string()));
        }
        Ok(())
    }
}

fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

fn get_at<'a>(root: &'a Value, segs: &[&str]) -> Option<&'a Value> {
    let mut cur = root;
    for s in segs {
        cur = match cur {
            Value::Object(m) => m.get(*s)?,
            Value::Array(a) => a.get(s.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    match cur {
        Value::Null => None,
        Value::Object(m) if m.is_empty() => None,
        v => Some(v),
    }
}

/// Drop `null` members and the objects they leave empty.
fn strip_nulls(value: Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::Object(map) => {
            let map: Map<String, Value> = map
                .into_iter()
                .filter_map(|(k, v)| strip_nulls(v).map(|v| (k, v)))
                .collect();
            if map.is_empty() {
                None
            } else {
                Some(Value::Object(map))
            }
        }
        v => Some(v),
    }
}

fn set_at(root: &mut Value, segs: &[&str], value: Value) {
    let Some(value) = strip_nulls(value) else {
        remove_at(root, segs);
        return;
    };
    let Some((last, parents)) = segs.split_last() else {
        *root = value;
        return;
    };
    let mut cur = root;
    for s in parents {
        if !cur.is_object() {
            *cur = Value::Object(Map::new());
        }
        let Value::Object(map) = cur else { return };
        cur = map.entry(s.to_string()).or_insert(Value::Null);
    }
    if !cur.is_object() {
        *cur = Value::Object(Map::new());
    }
    if let Value::Object(map) = cur {
        map.insert(last.to_string(), value);
    }
}

/// Remove the node at `segs`, pruning parents left empty. Returns whether
/// `node` itself ended up empty.
fn remove_at(node: &mut Value, segs: &[&str]) -> bool {
    let Some((first, rest)) = segs.split_first() else {
        *node = Value::Object(Map::new());
        return true;
    };
    let Value::Object(map) = node else {
        return false;
    };
    if rest.is_empty() {
        map.remove(*first);
    } else if let Some(child) = map.get_mut(*first) {
        if remove_at(child, rest) {
            map.remove(*first);
        }
    }
    map.is_empty()
}

fn etag_of(value: Option<&Value>) -> String {
    let mut hasher = DefaultHasher::new();
    match value {
        Some(v) => v.to_string().hash(&mut hasher),
        None => "null".hash(&mut hasher),
    }
    format!("{:016x}", hasher.finish())
}

fn at_or_after(value: &Value, start_at: &str) -> bool {
    match value {
        Value::String(s) => s.as_str() >= start_at,
        Value::Number(n) => match (n.as_f64(), start_at.parse::<f64>()) {
            (Some(v), Ok(start)) => v >= start,
            _ => false,
        },
        _ => false,
    }
}

#[async_trait]
impl LiveStore for MemoryLiveStore {
    async fn get(&self, path: &str) -> Result<Option<Value>, LiveStoreError> {
        let mut inner = self.lock();
        inner.check(path)?;
        inner.ops.push(LiveOp::Get {
            path: path.to_string(),
        });
        Ok(get_at(&inner.root, &segments(path)).cloned())
    }

    async fn get_versioned(&self, path: &str) -> Result<Versioned, LiveStoreError> {
        let mut inner = self.lock();
        inner.check(path)?;
        inner.ops.push(LiveOp::Get {
            path: path.to_string(),
        });
        let value = get_at(&inner.root, &segments(path)).cloned();
        let etag = etag_of(value.as_ref());
        Ok(Versioned { value, etag })
    }

    async fn shallow_keys(&self, path: &str) -> Result<Vec<String>, LiveStoreError> {
        let mut inner = self.lock();
        inner.check(path)?;
        inner.ops.push(LiveOp::Shallow {
            path: path.to_string(),
        });
        Ok(match get_at(&inner.root, &segments(path)) {
            Some(Value::Object(m)) => m.keys().cloned().collect(),
            Some(Value::Array(a)) => (0..a.len()).map(|i| i.to_string()).collect(),
            _ => Vec::new(),
        })
    }

    async fn query_ordered(
        &self,
        path: &str,
        child: &str,
        start_at: Option<&str>,
    ) -> Result<Map<String, Value>, LiveStoreError> {
        let mut inner = self.lock();
        inner.check(path)?;
        inner.ops.push(LiveOp::Query {
            path: path.to_string(),
            child: child.to_string(),
        });
        let Some(Value::Object(children)) = get_at(&inner.root, &segments(path)) else {
            return Ok(Map::new());
        };
        Ok(children
            .iter()
            .filter(|(_, v)| match start_at {
                None => true,
                Some(start) => v.get(child).is_some_and(|c| at_or_after(c, start)),
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn set(&self, path: &str, value: &Value) -> Result<(), LiveStoreError> {
        let mut inner = self.lock();
        inner.check(path)?;
        inner.ops.push(LiveOp::Set {
            path: path.to_string(),
        });
        set_at(&mut inner.root, &segments(path), value.clone());
        Ok(())
    }

    async fn update(&self, path: &str, values: &Map<String, Value>) -> Result<(), LiveStoreError> {
        let mut inner = self.lock();
        inner.check(path)?;
        for key in values.keys() {
            inner.check(&join(path, key))?;
        }
        inner.ops.push(LiveOp::Update {
            path: path.to_string(),
            keys: values.len(),
        });
        for (key, value) in values {
            let full = join(path, key);
            set_at(&mut inner.root, &segments(&full), value.clone());
        }
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), LiveStoreError> {
        let mut inner = self.lock();
        inner.check(path)?;
        inner.ops.push(LiveOp::Delete {
            path: path.to_string(),
        });
        remove_at(&mut inner.root, &segments(path));
        Ok(())
    }

    async fn set_if_unchanged(
        &self,
        path: &str,
        value: &Value,
        etag: &str,
    ) -> Result<WriteOutcome, LiveStoreError> {
        let mut inner = self.lock();
        inner.check(path)?;
        for (p, v) in std::mem::take(&mut inner.pending_interference) {
            set_at(&mut inner.root, &segments(&p), v);
        }
        let segs = segments(path);
        let conflict = inner.always_conflict.iter().any(|p| p.trim_matches('/') == path.trim_matches('/'))
            || etag_of(get_at(&inner.root, &segs)) != etag;
        inner.ops.push(LiveOp::ConditionalSet {
            path: path.to_string(),
            committed: !conflict,
        });
        if conflict {
            return Ok(WriteOutcome::Conflict);
        }
        set_at(&mut inner.root, &segs, value.clone());
        Ok(WriteOutcome::Committed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn nulls_delete_and_prune() {
        let store = MemoryLiveStore::with_data(json!({"a": {"b": {"c": 1}}, "x": 1}));
        store.set("a/b/c", &Value::Null).await.unwrap();
        assert_eq!(store.snapshot("a"), None);
        assert_eq!(store.snapshot("x"), Some(json!(1)));
    }

    #[tokio::test]
    async fn update_writes_nested_paths_atomically() {
        let store = MemoryLiveStore::new();
        let mut patch = Map::new();
        patch.insert("g100/progress".into(), json!(33));
        patch.insert("g101".into(), json!({"progress": 0, "drop": null}));
        store.update("groups/p1", &patch).await.unwrap();
        assert_eq!(
            store.snapshot("groups/p1"),
            Some(json!({"g100": {"progress": 33}, "g101": {"progress": 0}}))
        );
    }

    #[tokio::test]
    async fn injected_failures_block_updates_below_prefix() {
        let store = MemoryLiveStore::new();
        store.inject_failure("tasks/p1");
        let mut patch = Map::new();
        patch.insert("p1/g100".into(), json!([1]));
        let err = store.update("tasks", &patch).await.unwrap_err();
        assert!(matches!(err, LiveStoreError::Unavailable(_)));
        assert_eq!(store.snapshot("tasks"), None);
        store.clear_failures();
        store.update("tasks", &patch).await.unwrap();
        assert_eq!(store.snapshot("tasks/p1/g100/0"), Some(json!(1)));
    }

    #[tokio::test]
    async fn one_shot_failure_clears_itself() {
        let store = MemoryLiveStore::new();
        store.fail_next("groups/p1");
        assert!(store.set("groups/p1", &json!({"g100": 1})).await.is_err());
        store.set("groups/p1", &json!({"g100": 1})).await.unwrap();
        assert_eq!(store.snapshot("groups/p1/g100"), Some(json!(1)));
    }

    #[tokio::test]
    async fn query_filters_on_child_value() {
        let store = MemoryLiveStore::with_data(json!({
            "users": {
                "u1": {"created": "2024-01-01T00:00:00Z"},
                "u2": {"created": "2024-03-01T00:00:00Z"},
                "u3": {"username": "no-created"}
            }
        }));
        let all = store.query_ordered("users", "created", None).await.unwrap();
        assert_eq!(all.len(), 3);
        let recent = store
            .query_ordered("users", "created", Some("2024-02-01"))
            .await
            .unwrap();
        assert_eq!(recent.keys().collect::<Vec<_>>(), vec!["u2"]);
    }

    #[tokio::test]
    async fn conditional_write_checks_etag() {
        let store = MemoryLiveStore::with_data(json!({"a": 1}));
        let v = store.get_versioned("a").await.unwrap();
        store.set("a", &json!(2)).await.unwrap();
        assert_eq!(
            store.set_if_unchanged("a", &json!(3), &v.etag).await.unwrap(),
            WriteOutcome::Conflict
        );
        let v = store.get_versioned("a").await.unwrap();
        assert_eq!(
            store.set_if_unchanged("a", &json!(3), &v.etag).await.unwrap(),
            WriteOutcome::Committed
        );
        assert_eq!(store.snapshot("a"), Some(json!(3)));
    }

    #[tokio::test]
    async fn shallow_keys_lists_children() {
        let store = MemoryLiveStore::with_data(json!({"results": {"p1": {}, "p2": {"g": 1}}}));
        // p1 is empty and therefore absent.
        assert_eq!(store.shallow_keys("results").await.unwrap(), vec!["p2"]);
        assert!(store.shallow_keys("nothing").await.unwrap().is_empty());
    }
}

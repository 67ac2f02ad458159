//! In-memory [`RemoteStore`] holding the whole tree as one JSON value.
//!
//! Mirrors the remote store's observable behaviour closely enough to drive the
//! writer and watcher in tests: atomic multi-key updates, optimistic single-key
//! transactions, ordered change feeds and path-prefix access rules.

use std::collections::BTreeSet;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::{
    key_leaf, ChangeEvent, ChangeFeed, ChangeKind, ChangeSet, Listen, PendingChange,
    PushIdGenerator, RemoteStore, Resolution, Resolver, TransactionOutcome,
};
use crate::error::StoreError;

/// Attempts before a contended transaction gives up.
pub const MAX_TRANSACTION_ATTEMPTS: usize = 25;

type FeedSender = mpsc::UnboundedSender<Result<ChangeEvent, StoreError>>;

struct Listener {
    key: String,
    listen: Listen,
    tx: FeedSender,
}

#[derive(Default)]
struct Inner {
    root: Value,
    version: u64,
    listeners: Vec<Listener>,
    denied_reads: Vec<String>,
    denied_writes: Vec<String>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    ids: PushIdGenerator,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the tree.
    pub fn with_data(data: Value) -> Self {
        let store = Self::new();
        store.inner.lock().root = normalize(data).unwrap_or(Value::Null);
        store
    }

    /// Full copy of the tree.
    pub fn snapshot(&self) -> Value {
        self.inner.lock().root.clone()
    }

    /// Reject every write touching `prefix`.
    pub fn deny_writes(&self, prefix: &str) {
        self.inner.lock().denied_writes.push(prefix.to_string());
    }

    /// Reject reads under `prefix` and fail every live listener there.
    pub fn deny_reads(&self, prefix: &str) {
        let mut inner = self.inner.lock();
        inner.denied_reads.push(prefix.to_string());
        inner.listeners.retain(|l| {
            if is_under(&l.key, prefix) {
                let _ = l.tx.send(Err(StoreError::PermissionDenied(l.key.clone())));
                false
            } else {
                true
            }
        });
    }

    /// Ends every change feed without an error, as a store shutdown would.
    pub fn close_listeners(&self) {
        self.inner.lock().listeners.clear();
    }

    pub fn listener_count(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.listeners.retain(|l| !l.tx.is_closed());
        inner.listeners.len()
    }
}

fn split(key: &str) -> Vec<&str> {
    if key.is_empty() {
        Vec::new()
    } else {
        key.split('/').collect()
    }
}

fn is_under(key: &str, prefix: &str) -> bool {
    prefix.is_empty()
        || key == prefix
        || (key.len() > prefix.len() && key.starts_with(prefix) && key.as_bytes()[prefix.len()] == b'/')
}

fn touches(key: &str, prefix: &str) -> bool {
    is_under(key, prefix) || is_under(prefix, key)
}

/// Drops nulls and empty objects; `None` means the value is absent.
fn normalize(value: Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::Object(map) => {
            let cleaned: Map<String, Value> = map
                .into_iter()
                .filter_map(|(k, v)| normalize(v).map(|v| (k, v)))
                .collect();
            if cleaned.is_empty() {
                None
            } else {
                Some(Value::Object(cleaned))
            }
        }
        other => Some(other),
    }
}

fn lookup<'a>(root: &'a Value, key: &str) -> Option<&'a Value> {
    let mut node = root;
    for segment in split(key) {
        node = node.as_object()?.get(segment)?;
    }
    if node.is_null() {
        None
    } else {
        Some(node)
    }
}

fn write_at(node: &mut Value, segments: &[&str], value: Option<Value>) {
    let Some((head, rest)) = segments.split_first() else {
        *node = value.unwrap_or(Value::Null);
        return;
    };
    if !node.is_object() {
        if value.is_none() {
            return;
        }
        *node = Value::Object(Map::new());
    }
    let now_empty = match node {
        Value::Object(map) => {
            let child = map.entry(head.to_string()).or_insert(Value::Null);
            write_at(child, rest, value);
            if child.is_null() {
                map.remove(*head);
            }
            map.is_empty()
        }
        _ => false,
    };
    if now_empty {
        *node = Value::Null;
    }
}

fn children(value: Option<&Value>) -> Option<&Map<String, Value>> {
    value.and_then(Value::as_object)
}

impl Inner {
    fn check_read(&self, key: &str) -> Result<(), StoreError> {
        if self.denied_reads.iter().any(|p| is_under(key, p)) {
            return Err(StoreError::PermissionDenied(key.to_string()));
        }
        Ok(())
    }

    fn check_write(&self, key: &str) -> Result<(), StoreError> {
        if self.denied_writes.iter().any(|p| touches(key, p)) {
            return Err(StoreError::PermissionDenied(key.to_string()));
        }
        Ok(())
    }

    fn write(&mut self, key: &str, value: Option<Value>) {
        let value = value.and_then(normalize);
        write_at(&mut self.root, &split(key), value);
    }

    /// Diffs the tree before and after a write and feeds every listener.
    fn notify(&mut self, before: &Value) {
        self.listeners.retain(|l| !l.tx.is_closed());
        let after = &self.root;
        for listener in &self.listeners {
            let old = lookup(before, &listener.key);
            let new = lookup(after, &listener.key);
            if old == new {
                continue;
            }
            match listener.listen {
                Listen::Value => {
                    let _ = listener.tx.send(Ok(ChangeEvent {
                        kind: ChangeKind::Value,
                        key: key_leaf(&listener.key).to_string(),
                        value: new.cloned(),
                    }));
                }
                Listen::Children => {
                    let empty = Map::new();
                    let old_children = children(old).unwrap_or(&empty);
                    let new_children = children(new).unwrap_or(&empty);
                    let keys: BTreeSet<&String> =
                        old_children.keys().chain(new_children.keys()).collect();
                    for child in keys {
                        let event = match (old_children.get(child), new_children.get(child)) {
                            (Some(_), None) => ChangeEvent {
                                kind: ChangeKind::ChildRemoved,
                                key: child.clone(),
                                value: None,
                            },
                            (None, Some(v)) => ChangeEvent {
                                kind: ChangeKind::ChildAdded,
                                key: child.clone(),
                                value: Some(v.clone()),
                            },
                            (Some(a), Some(b)) if a != b => ChangeEvent {
                                kind: ChangeKind::ChildChanged,
                                key: child.clone(),
                                value: Some(b.clone()),
                            },
                            _ => continue,
                        };
                        let _ = listener.tx.send(Ok(event));
                    }
                }
            }
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let inner = self.inner.lock();
        inner.check_read(key)?;
        Ok(lookup(&inner.root, key).cloned())
    }

    async fn apply(&self, changes: &ChangeSet) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        for key in changes.keys() {
            inner.check_write(key)?;
            let segments = split(key);
            for depth in 0..segments.len() {
                let ancestor = segments[..depth].join("/");
                if changes.contains_key(&ancestor) {
                    return Err(StoreError::InvalidUpdate(format!(
                        "path {} is an ancestor of {} in the same update",
                        ancestor, key
                    )));
                }
            }
        }

        let before = inner.root.clone();
        for (key, change) in changes {
            let value = match change {
                PendingChange::Value(v) => Some(v.clone()),
                PendingChange::Tombstone => None,
            };
            inner.write(key, value);
        }
        inner.version += 1;
        inner.notify(&before);
        Ok(())
    }

    async fn new_child_key(&self, parent: &str) -> Result<String, StoreError> {
        self.ids.next_id().map_err(|e| {
            StoreError::Unavailable(format!("no child key available under {}: {}", parent, e))
        })
    }

    async fn transact(
        &self,
        key: &str,
        resolver: Resolver<'_>,
    ) -> Result<TransactionOutcome, StoreError> {
        let mut current = None;
        for _ in 0..MAX_TRANSACTION_ATTEMPTS {
            let version = {
                let inner = self.inner.lock();
                inner.check_read(key)?;
                inner.check_write(key)?;
                current = lookup(&inner.root, key).cloned();
                inner.version
            };

            let next = match resolver(current.as_ref()) {
                Resolution::Abort => {
                    return Ok(TransactionOutcome {
                        committed: false,
                        value: current,
                    })
                }
                Resolution::Set(value) => Some(value),
                Resolution::Remove => None,
            };

            let mut inner = self.inner.lock();
            if inner.version != version {
                continue;
            }
            let before = inner.root.clone();
            inner.write(key, next);
            inner.version += 1;
            inner.notify(&before);
            return Ok(TransactionOutcome {
                committed: true,
                value: lookup(&inner.root, key).cloned(),
            });
        }

        Ok(TransactionOutcome {
            committed: false,
            value: current,
        })
    }

    async fn subscribe(&self, key: &str, listen: Listen) -> Result<ChangeFeed, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();

        if let Err(e) = inner.check_read(key) {
            // the store reports listen failures through the feed
            let _ = tx.send(Err(e));
            return Ok(Box::pin(UnboundedReceiverStream::new(rx)));
        }

        let current = lookup(&inner.root, key);
        match listen {
            Listen::Value => {
                let _ = tx.send(Ok(ChangeEvent {
                    kind: ChangeKind::Value,
                    key: key_leaf(key).to_string(),
                    value: current.cloned(),
                }));
            }
            Listen::Children => {
                if let Some(map) = children(current) {
                    for (child, value) in map {
                        let _ = tx.send(Ok(ChangeEvent {
                            kind: ChangeKind::ChildAdded,
                            key: child.clone(),
                            value: Some(value.clone()),
                        }));
                    }
                }
            }
        }

        inner.listeners.push(Listener {
            key: key.to_string(),
            listen,
            tx,
        });
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    fn changes(entries: &[(&str, Option<Value>)]) -> ChangeSet {
        entries
            .iter()
            .map(|(k, v)| {
                let change = match v {
                    Some(v) => PendingChange::Value(v.clone()),
                    None => PendingChange::Tombstone,
                };
                (k.to_string(), change)
            })
            .collect()
    }

    #[tokio::test]
    async fn apply_writes_and_prunes() {
        let store = MemoryStore::new();
        store
            .apply(&changes(&[("a/b/c", Some(json!(1))), ("a/d", Some(json!("x")))]))
            .await
            .unwrap();
        assert_eq!(store.snapshot(), json!({"a": {"b": {"c": 1}, "d": "x"}}));

        store.apply(&changes(&[("a/b/c", None)])).await.unwrap();
        assert_eq!(store.snapshot(), json!({"a": {"d": "x"}}));
        assert_eq!(store.get("a/b").await.unwrap(), None);
    }

    #[tokio::test]
    async fn overlapping_keys_apply_nothing() {
        let store = MemoryStore::with_data(json!({"a": {"x": 1}}));
        let err = store
            .apply(&changes(&[("a", Some(json!({"y": 2}))), ("a/z", Some(json!(3)))]))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidUpdate(_)));
        assert_eq!(store.snapshot(), json!({"a": {"x": 1}}));
    }

    #[tokio::test]
    async fn denied_write_rejects_whole_batch() {
        let store = MemoryStore::new();
        store.deny_writes("locked");
        let err = store
            .apply(&changes(&[("open/a", Some(json!(1))), ("locked/b", Some(json!(2)))]))
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::PermissionDenied("locked/b".into()));
        assert_eq!(store.snapshot(), Value::Null);
    }

    #[tokio::test]
    async fn transaction_abort_leaves_value() {
        let store = MemoryStore::with_data(json!({"slot": "taken"}));
        let outcome = store.transact("slot", &|_| Resolution::Abort).await.unwrap();
        assert!(!outcome.committed);
        assert_eq!(outcome.value, Some(json!("taken")));
    }

    #[tokio::test]
    async fn children_feed_reports_initial_and_later_changes() {
        let store = MemoryStore::with_data(json!({"coll": {"k1": 1}}));
        let mut feed = store.subscribe("coll", Listen::Children).await.unwrap();

        let first = feed.next().await.unwrap().unwrap();
        assert_eq!(first.kind, ChangeKind::ChildAdded);
        assert_eq!(first.key, "k1");

        store.apply(&changes(&[("coll/k1", Some(json!(2)))])).await.unwrap();
        store.apply(&changes(&[("coll/k1", None)])).await.unwrap();

        let changed = feed.next().await.unwrap().unwrap();
        assert_eq!(changed.kind, ChangeKind::ChildChanged);
        assert_eq!(changed.value, Some(json!(2)));
        let removed = feed.next().await.unwrap().unwrap();
        assert_eq!(removed.kind, ChangeKind::ChildRemoved);
    }

    #[tokio::test]
    async fn dropped_feed_unsubscribes() {
        let store = MemoryStore::new();
        let feed = store.subscribe("doc", Listen::Value).await.unwrap();
        assert_eq!(store.listener_count(), 1);
        drop(feed);
        assert_eq!(store.listener_count(), 0);
    }
}

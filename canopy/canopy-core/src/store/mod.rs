//! The remote tree store as seen by this crate.
//!
//! Keys are the `/`-joined encoded paths produced by [`crate::path::encode`].
//! The store is the single source of truth; nothing here caches values.

use std::collections::BTreeMap;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreError;

pub mod memory;
pub mod push_id;

pub use memory::MemoryStore;
pub use push_id::PushIdGenerator;

/// One buffered write in an atomic multi-key update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum PendingChange {
    Value(Value),
    Tombstone,
}

impl PendingChange {
    /// Null is the store's representation of "absent".
    pub fn from_value(value: Value) -> Self {
        if value.is_null() {
            PendingChange::Tombstone
        } else {
            PendingChange::Value(value)
        }
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            PendingChange::Value(v) => Some(v),
            PendingChange::Tombstone => None,
        }
    }
}

/// Store key to pending change. At most one entry per key.
pub type ChangeSet = BTreeMap<String, PendingChange>;

/// What a transaction resolver wants the store to do with the current value.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Set(Value),
    Remove,
    Abort,
}

/// Resolver run by the store, possibly several times if the key is contended.
pub type Resolver<'a> = &'a (dyn Fn(Option<&Value>) -> Resolution + Send + Sync);

#[derive(Debug, Clone, PartialEq)]
pub struct TransactionOutcome {
    pub committed: bool,
    /// Value at the key after the transaction, committed or not.
    pub value: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Listen {
    /// Whole-value updates for a single key.
    Value,
    /// Added/changed/removed events for the direct children of a key.
    Children,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Value,
    ChildAdded,
    ChildChanged,
    ChildRemoved,
}

/// A single change notification. `key` is the store-native (still encoded)
/// last component of the key the event is about.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub key: String,
    pub value: Option<Value>,
}

/// Ordered stream of change events for one listener. Dropping it detaches
/// the listener from the store.
pub type ChangeFeed = Pin<Box<dyn Stream<Item = Result<ChangeEvent, StoreError>> + Send>>;

#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    /// Applies every change or none of them.
    async fn apply(&self, changes: &ChangeSet) -> Result<(), StoreError>;

    /// Mints a unique, order-preserving child key under `parent`.
    async fn new_child_key(&self, parent: &str) -> Result<String, StoreError>;

    /// Single-key optimistic transaction. Contention retries are the store's
    /// business; `committed == false` means the resolver aborted or the
    /// retries ran out.
    async fn transact(
        &self,
        key: &str,
        resolver: Resolver<'_>,
    ) -> Result<TransactionOutcome, StoreError>;

    async fn subscribe(&self, key: &str, listen: Listen) -> Result<ChangeFeed, StoreError>;
}

/// Last component of a store key, or the empty string for the root.
pub fn key_leaf(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or_default()
}

/// Joins a parent key and an (already encoded) child component.
pub fn child_key(parent: &str, child: &str) -> String {
    if parent.is_empty() {
        child.to_string()
    } else {
        format!("{}/{}", parent, child)
    }
}

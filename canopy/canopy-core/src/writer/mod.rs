//! Buffered, atomically committed writes plus the two single-key
//! transactions (counter increment and claim-once).
//!
//! `set`/`remove` only touch the in-memory [`ChangeSet`]; nothing reaches the
//! store until [`BatchWriter::commit`]. The transactions cannot join a batch
//! because the store only retries a conditional write against a single key,
//! so they flush the batch first to keep the caller's program order.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::events::{Event, EventBus};
use crate::path::{self, LogicalPath};
use crate::store::{ChangeSet, PendingChange, RemoteStore, Resolution};
use crate::value::{as_counter, same_value, stored_form};


pub struct BatchWriter {
    store: Arc<dyn RemoteStore>,
    pending: ChangeSet,
    events: Option<EventBus>,
}

impl BatchWriter {
    pub fn new(store: Arc<dyn RemoteStore>) -> Self {
        Self {
            store,
            pending: ChangeSet::new(),
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Buffered changes, keyed by store key.
    pub fn pending(&self) -> &ChangeSet {
        &self.pending
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Starts a fresh batch, dropping anything still buffered.
    pub fn begin(&mut self) {
        if !self.pending.is_empty() {
            debug!(dropped = self.pending.len(), "begin discarded pending changes");
        }
        self.pending.clear();
    }

    /// Buffers `value` at `doc_path + field_path`. A `null` value buffers a
    /// removal.
    pub fn set(
        &mut self,
        doc_path: impl Into<LogicalPath>,
        field_path: impl Into<LogicalPath>,
        value: Value,
    ) -> Result<()> {
        let key = field_key(doc_path.into(), field_path.into())?;
        debug!(%key, "buffered set");
        self.pending.insert(key, PendingChange::from_value(value));
        Ok(())
    }

    /// Buffers a removal at `doc_path + field_path`.
    pub fn remove(
        &mut self,
        doc_path: impl Into<LogicalPath>,
        field_path: impl Into<LogicalPath>,
    ) -> Result<()> {
        let key = field_key(doc_path.into(), field_path.into())?;
        debug!(%key, "buffered remove");
        self.pending.insert(key, PendingChange::Tombstone);
        Ok(())
    }

    /// Asks the store for a new order-preserving child key under `doc_path`.
    /// Independent of the pending batch.
    pub async fn create(&self, doc_path: impl Into<LogicalPath>) -> Result<String> {
        let doc_path = doc_path.into();
        let parent = path::encode(&doc_path)?;
        let key = self
            .store
            .new_child_key(&parent)
            .await
            .map_err(|e| Error::KeyGeneration {
                parent: doc_path.to_string(),
                reason: e.to_string(),
            })?;
        if key.is_empty() {
            return Err(Error::KeyGeneration {
                parent: doc_path.to_string(),
                reason: "store returned an empty key".to_string(),
            });
        }
        debug!(parent = %doc_path, %key, "created child key");
        Ok(path::decode(&key))
    }

    /// Applies every buffered change in one atomic update. On failure the
    /// batch is kept so the caller can retry or abort.
    pub async fn commit(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        if let Err(e) = self.store.apply(&self.pending).await {
            warn!(keys = self.pending.len(), error = %e, "commit rejected");
            return Err(Error::Commit(e));
        }
        let keys: Vec<String> = std::mem::take(&mut self.pending).into_keys().collect();
        info!(keys = keys.len(), "committed batch");
        self.publish(Event::Committed { keys });
        Ok(())
    }

    /// Drops the pending batch without writing anything.
    pub fn abort(&mut self) {
        if !self.pending.is_empty() {
            debug!(dropped = self.pending.len(), "aborted pending changes");
        }
        self.pending.clear();
    }

    /// Flushes the batch, then atomically adds one to the counter at
    /// `doc_path + field_path` (absent counts as zero). Returns the new value.
    pub async fn increment(
        &mut self,
        doc_path: impl Into<LogicalPath>,
        field_path: impl Into<LogicalPath>,
    ) -> Result<i64> {
        let key = field_key(doc_path.into(), field_path.into())?;
        self.commit().await?;

        let resolver = |current: Option<&Value>| {
            match as_counter(current).and_then(|n| n.checked_add(1)) {
                Some(next) => Resolution::Set(json!(next)),
                None => Resolution::Abort,
            }
        };
        let outcome = self
            .store
            .transact(&key, &resolver)
            .await
            .map_err(|e| transaction_error(&key, e.to_string()))?;

        if !outcome.committed {
            let reason = match outcome.value.as_ref() {
                Some(v) if as_counter(Some(v)).is_none() => {
                    format!("stored value {} is not an integer counter", v)
                }
                _ => "increment transaction failed to commit".to_string(),
            };
            warn!(%key, %reason, "increment failed");
            return Err(transaction_error(&key, reason));
        }

        let value = outcome
            .value
            .as_ref()
            .and_then(|v| as_counter(Some(v)))
            .ok_or_else(|| {
                transaction_error(
                    &key,
                    "increment transaction failed to return a data value".to_string(),
                )
            })?;

        info!(%key, value, "incremented counter");
        self.publish(Event::Incremented { key, value });
        Ok(value)
    }

    /// Flushes the batch, then claims `doc_path + field_path` for `value`.
    ///
    /// Succeeds if the slot is empty or already holds a value structurally
    /// equal to `value`; fails with [`Error::AlreadyClaimed`] otherwise. A
    /// value the store would keep as absent (`null`, `{}`, objects of nulls)
    /// cannot claim anything and is rejected up front.
    pub async fn take(
        &mut self,
        doc_path: impl Into<LogicalPath>,
        field_path: impl Into<LogicalPath>,
        value: Value,
    ) -> Result<()> {
        let value = stored_form(&value).ok_or_else(|| {
            Error::InvalidArgument("null value not allowed for take() operation".to_string())
        })?;
        let key = field_key(doc_path.into(), field_path.into())?;
        self.commit().await?;

        let resolver = |current: Option<&Value>| match current {
            None => Resolution::Set(value.clone()),
            Some(existing) if same_value(existing, &value) => Resolution::Set(existing.clone()),
            Some(_) => Resolution::Abort,
        };
        let outcome = self
            .store
            .transact(&key, &resolver)
            .await
            .map_err(|e| transaction_error(&key, e.to_string()))?;

        if !outcome.committed {
            return match outcome.value {
                Some(existing) if !same_value(&existing, &value) => {
                    info!(%key, "slot already claimed");
                    Err(Error::AlreadyClaimed { key })
                }
                _ => {
                    warn!(%key, "take transaction failed to commit");
                    Err(transaction_error(&key, "take transaction failed to commit".to_string()))
                }
            };
        }
        if outcome.value.is_none() {
            warn!(%key, "take committed but left the slot empty");
            return Err(transaction_error(
                &key,
                "take transaction failed to return a data value".to_string(),
            ));
        }

        info!(%key, "claimed slot");
        self.publish(Event::Claimed { key });
        Ok(())
    }

    fn publish(&self, event: Event) {
        if let Some(events) = &self.events {
            events.send(event);
        }
    }
}

fn field_key(doc_path: LogicalPath, field_path: LogicalPath) -> Result<String> {
    Ok(path::encode(&doc_path.join(&field_path))?)
}

fn transaction_error(key: &str, reason: String) -> Error {
    Error::Transaction {
        key: key.to_string(),
        reason,
    }
}

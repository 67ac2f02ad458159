//! Live listeners on documents and ordered child collections.
//!
//! Every watch opens one ordered change feed on the store and drains it on its
//! own tokio task, translating store events into caller callbacks. The
//! registry of live listeners belongs to the [`ChangeSubscriber`] that opened
//! them; dropping the subscriber cancels everything it still tracks.
//!
//! Cancellation flips the subscription's active flag, removes it from the
//! registry and aborts its task. A callback that was already executing when
//! `cancel` was called still runs to completion, and on a multi-threaded
//! runtime a dispatch that passed the active check just before the flag flipped
//! may still be delivered. The store's delivery pipeline is outside our control,
//! so that window is only narrowed, never closed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result, StoreError};
use crate::events::{Event, EventBus};
use crate::path::{self, LogicalPath};
use crate::store::{ChangeEvent, ChangeFeed, ChangeKind, Listen, RemoteStore};


type UpdateFn = Arc<dyn Fn(Option<Value>) + Send + Sync>;
type UpsertFn = Arc<dyn Fn(String, Value) + Send + Sync>;
type RemoveFn = Arc<dyn Fn(String) + Send + Sync>;
type ErrorFn = Arc<dyn Fn(Error) + Send + Sync>;

enum Handler {
    Doc {
        on_update: UpdateFn,
    },
    Collection {
        on_upsert: UpsertFn,
        on_remove: RemoveFn,
    },
}

impl Handler {
    fn dispatch(&self, event: ChangeEvent) {
        match (self, event.kind) {
            (Handler::Doc { on_update }, ChangeKind::Value) => on_update(event.value),
            (
                Handler::Collection { on_upsert, .. },
                ChangeKind::ChildAdded | ChangeKind::ChildChanged,
            ) => match event.value {
                Some(value) => on_upsert(path::decode(&event.key), value),
                None => debug!(key = %event.key, "child event without a value"),
            },
            (Handler::Collection { on_remove, .. }, ChangeKind::ChildRemoved) => {
                on_remove(path::decode(&event.key))
            }
            (_, kind) => debug!(?kind, "ignored event of unexpected kind"),
        }
    }
}

struct Subscription {
    path: LogicalPath,
    active: Arc<AtomicBool>,
    abort: AbortHandle,
}

type Registry = Mutex<HashMap<Uuid, Subscription>>;

pub struct ChangeSubscriber {
    store: Arc<dyn RemoteStore>,
    registry: Arc<Registry>,
    events: Option<EventBus>,
}

impl ChangeSubscriber {
    pub fn new(store: Arc<dyn RemoteStore>) -> Self {
        Self {
            store,
            registry: Arc::new(Mutex::new(HashMap::new())),
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Watches the value at `path`. `on_update` fires once with the current
    /// value and again on every change; a deleted value is delivered as
    /// `None`.
    pub async fn watch_doc<U, E>(
        &self,
        path: impl Into<LogicalPath>,
        on_update: U,
        on_error: E,
    ) -> Result<SubscriptionHandle>
    where
        U: Fn(Option<Value>) + Send + Sync + 'static,
        E: Fn(Error) + Send + Sync + 'static,
    {
        let handler = Handler::Doc {
            on_update: Arc::new(on_update),
        };
        self.watch(path.into(), Listen::Value, handler, Arc::new(on_error))
            .await
    }

    /// Watches the direct children of `path`. Existing children are reported
    /// through `on_child_upsert` first. Child keys are decoded before delivery.
    pub async fn watch_collection<U, R, E>(
        &self,
        path: impl Into<LogicalPath>,
        on_child_upsert: U,
        on_child_remove: R,
        on_error: E,
    ) -> Result<SubscriptionHandle>
    where
        U: Fn(String, Value) + Send + Sync + 'static,
        R: Fn(String) + Send + Sync + 'static,
        E: Fn(Error) + Send + Sync + 'static,
    {
        let handler = Handler::Collection {
            on_upsert: Arc::new(on_child_upsert),
            on_remove: Arc::new(on_child_remove),
        };
        self.watch(path.into(), Listen::Children, handler, Arc::new(on_error))
            .await
    }

    async fn watch(
        &self,
        path: LogicalPath,
        listen: Listen,
        handler: Handler,
        on_error: ErrorFn,
    ) -> Result<SubscriptionHandle> {
        let key = path::encode(&path)?;
        let id = Uuid::new_v4();
        let active = Arc::new(AtomicBool::new(true));

        let feed: ChangeFeed = match self.store.subscribe(&key, listen).await {
            Ok(feed) => feed,
            Err(e) => Box::pin(futures::stream::once(async move {
                Err::<ChangeEvent, StoreError>(e)
            })),
        };

        let listener = Listener {
            id,
            key: key.clone(),
            active: active.clone(),
            registry: Arc::downgrade(&self.registry),
            handler,
            on_error,
            events: self.events.clone(),
        };

        let abort = {
            let mut registry = self.registry.lock();
            let task = tokio::spawn(listener.run(feed));
            let abort = task.abort_handle();
            registry.insert(
                id,
                Subscription {
                    path: path.clone(),
                    active: active.clone(),
                    abort: abort.clone(),
                },
            );
            abort
        };

        debug!(%id, %key, ?listen, "listener attached");
        self.publish(Event::Watching { id, key });

        Ok(SubscriptionHandle {
            id,
            path,
            active,
            abort,
            registry: Arc::downgrade(&self.registry),
            events: self.events.clone(),
        })
    }

    /// Number of listeners still attached.
    pub fn active_count(&self) -> usize {
        self.registry.lock().len()
    }

    /// Paths of the listeners still attached.
    pub fn watched_paths(&self) -> Vec<LogicalPath> {
        self.registry.lock().values().map(|s| s.path.clone()).collect()
    }

    /// Cancels every listener opened by this subscriber.
    pub fn cancel_all(&self) {
        let drained: Vec<(Uuid, Subscription)> = self.registry.lock().drain().collect();
        for (id, subscription) in drained {
            if subscription.active.swap(false, Ordering::AcqRel) {
                subscription.abort.abort();
                self.publish(Event::Cancelled { id });
            }
        }
    }

    fn publish(&self, event: Event) {
        if let Some(events) = &self.events {
            events.send(event);
        }
    }
}

impl Drop for ChangeSubscriber {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

/// State moved into the task draining one feed.
struct Listener {
    id: Uuid,
    key: String,
    active: Arc<AtomicBool>,
    registry: Weak<Registry>,
    handler: Handler,
    on_error: ErrorFn,
    events: Option<EventBus>,
}

impl Listener {
    async fn run(self, mut feed: ChangeFeed) {
        while let Some(item) = feed.next().await {
            if !self.active.load(Ordering::Acquire) {
                return;
            }
            match item {
                Ok(event) => self.handler.dispatch(event),
                Err(e) => {
                    self.fail(e);
                    return;
                }
            }
        }
        if self.active.load(Ordering::Acquire) {
            self.fail(StoreError::Cancelled);
        }
    }

    fn fail(&self, error: StoreError) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().remove(&self.id);
        }
        warn!(id = %self.id, key = %self.key, %error, "listener detached after error");
        if let Some(events) = &self.events {
            events.send(Event::WatchFailed {
                id: self.id,
                key: self.key.clone(),
                message: error.to_string(),
            });
        }
        (self.on_error)(Error::Subscription(error));
    }
}

/// Returned by every watch call. Dropping it does not cancel the listener.
pub struct SubscriptionHandle {
    id: Uuid,
    path: LogicalPath,
    active: Arc<AtomicBool>,
    abort: AbortHandle,
    registry: Weak<Registry>,
    events: Option<EventBus>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn path(&self) -> &LogicalPath {
        &self.path
    }

    /// False once cancelled or detached by an error.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Detaches the listener. Calling it again is a no-op.
    pub fn cancel(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().remove(&self.id);
        }
        self.abort.abort();
        info!(id = %self.id, path = %self.path, "listener cancelled");
        if let Some(events) = &self.events {
            events.send(Event::Cancelled { id: self.id });
        }
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("active", &self.is_active())
            .finish()
    }
}

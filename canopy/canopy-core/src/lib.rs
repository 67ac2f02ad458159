//! Client-side access to a remote tree-shaped document store: path-addressed
//! reads, batched atomic writes, counter and claim-once transactions, and live
//! change subscriptions.

pub mod error;
pub mod events;
pub mod path;
pub mod reader;
pub mod register;
pub mod store;
pub mod value;
pub mod watcher;
pub mod writer;

pub use error::{Error, PathError, Result, StoreError};
pub use events::{Event, EventBus};
pub use path::LogicalPath;
pub use reader::Reader;
pub use register::{PendingResult, RegisterError, RegisterState};
pub use store::{MemoryStore, RemoteStore};
pub use watcher::{ChangeSubscriber, SubscriptionHandle};
pub use writer::BatchWriter;

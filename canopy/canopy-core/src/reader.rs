use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};
use crate::path::{self, LogicalPath};
use crate::store::RemoteStore;

/// Plain single-path reads.
pub struct Reader {
    store: Arc<dyn RemoteStore>,
}

impl Reader {
    pub fn new(store: Arc<dyn RemoteStore>) -> Self {
        Self { store }
    }

    /// Current value at `path`, `None` when absent.
    pub async fn read(&self, path: impl Into<LogicalPath>) -> Result<Option<Value>> {
        let path = path.into();
        let key = path::encode(&path)?;
        debug!(%key, "read");
        self.store.get(&key).await.map_err(Error::Read)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::store::MemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn reads_present_and_absent_values() {
        let store = Arc::new(MemoryStore::with_data(json!({"docs": {"a": {"x": 1}}})));
        let reader = Reader::new(store);
        assert_eq!(reader.read(["docs", "a", "x"]).await.unwrap(), Some(json!(1)));
        assert_eq!(reader.read(["nothing"]).await.unwrap(), None);
    }

    #[tokio::test]
    async fn reads_through_the_codec() {
        let store = Arc::new(MemoryStore::with_data(json!({"docs": {"a%2Eb": {"x": 1}}})));
        let reader = Reader::new(store);
        assert_eq!(
            reader.read(["docs", "a.b"]).await.unwrap(),
            Some(json!({"x": 1}))
        );
    }

    #[tokio::test]
    async fn denied_read_is_a_read_error() {
        let store = Arc::new(MemoryStore::new());
        store.deny_reads("private");
        let reader = Reader::new(store);
        let err = reader.read(["private", "x"]).await.unwrap_err();
        assert!(matches!(err, Error::Read(StoreError::PermissionDenied(_))));
    }
}

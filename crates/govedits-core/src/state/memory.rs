// # Memory Cursor Store
//
// In-memory implementation of CursorStore.
//
// Nothing survives a restart, so every run starts from an empty cursor.
// Used by tests and for one-off backfills that should leave no state behind.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::Error;
use crate::traits::cursor_store::{CursorStore, StateDocument};
use crate::traits::feed_source::FeedMode;

/// In-memory cursor store
///
/// Clones share the same documents, so a test can keep a handle and
/// inspect what the orchestrator saved.
#[derive(Debug, Clone, Default)]
pub struct MemoryCursorStore {
    inner: Arc<RwLock<HashMap<FeedMode, StateDocument>>>,
    saves: Arc<RwLock<usize>>,
}

impl MemoryCursorStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `save` calls so far
    pub async fn save_count(&self) -> usize {
        *self.saves.read().await
    }

    /// Snapshot of the document for `mode`
    pub async fn document(&self, mode: FeedMode) -> Option<StateDocument> {
        self.inner.read().await.get(&mode).cloned()
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn load(&self, mode: FeedMode) -> Result<Option<StateDocument>, Error> {
        Ok(self.inner.read().await.get(&mode).cloned())
    }

    async fn save(&self, document: &StateDocument) -> Result<(), Error> {
        self.inner
            .write()
            .await
            .insert(document.mode, document.clone());
        *self.saves.write().await += 1;
        Ok(())
    }

    async fn flush(&self) -> Result<(), Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::feed_source::ResumptionCursor;
    use chrono::Utc;

    #[tokio::test]
    async fn clones_share_documents() {
        let store = MemoryCursorStore::new();
        let handle = store.clone();

        let cursor = ResumptionCursor::empty(FeedMode::Stream).unwrap();
        store
            .save(&StateDocument::new(cursor, Utc::now(), Vec::new()))
            .await
            .unwrap();

        assert!(handle.document(FeedMode::Stream).await.is_some());
        assert!(handle.load(FeedMode::Poll).await.unwrap().is_none());
        assert_eq!(handle.save_count().await, 1);
    }
}

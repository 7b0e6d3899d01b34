// # File Cursor Store
//
// File-based implementation of CursorStore with crash recovery.
//
// ## Layout
//
// One JSON document per mode under the state directory:
// `stream_state.json`, `poll_state.json`, `backfill_state.json`.
//
// ## Crash Recovery
//
// - Atomic writes: document written to `<mode>_state.tmp`, then renamed
// - Automatic backup: previous document copied to `<mode>_state.backup`
// - Recovery: an unparsable document falls back to the backup, and the
//   backup is restored over it
//
// ## File Format
//
// ```json
// {
//   "version": "1.0",
//   "mode": "poll",
//   "cursor": { "mode": "poll", "watermark": { "timestamp": "2024-05-01T12:00:00Z", "boundary": ["rev:1001"] } },
//   "last_run": "2024-05-01T12:00:03Z",
//   "dedup": [ { "id": "rev:1001", "dispatched_at": "2024-05-01T12:00:02Z" } ]
// }
// ```

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use crate::Error;
use crate::traits::cursor_store::{CursorStore, STATE_DOCUMENT_VERSION, StateDocument};
use crate::traits::feed_source::FeedMode;

/// File-based cursor store with crash recovery
#[derive(Debug)]
pub struct FileCursorStore {
    dir: PathBuf,
    state: RwLock<FileState>,
}

#[derive(Debug, Default)]
struct FileState {
    documents: HashMap<FeedMode, StateDocument>,
    dirty: HashSet<FeedMode>,
}

/// Outcome of reading one document file
enum ReadOutcome {
    Missing,
    Loaded(StateDocument),
    Corrupt(String),
}

impl FileCursorStore {
    /// Open a store rooted at `dir`, creating the directory if needed
    pub async fn new<P: AsRef<Path>>(dir: P) -> Result<Self, Error> {
        let dir = dir.as_ref().to_path_buf();

        if !dir.as_os_str().is_empty() && !dir.exists() {
            fs::create_dir_all(&dir).await.map_err(|e| {
                Error::config(format!(
                    "Failed to create state directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }

        Ok(Self {
            dir,
            state: RwLock::new(FileState::default()),
        })
    }

    /// Path of the document for `mode`
    pub fn path_for(&self, mode: FeedMode) -> PathBuf {
        self.dir.join(format!("{}_state.json", mode))
    }

    async fn load_with_recovery(&self, mode: FeedMode) -> Result<Option<StateDocument>, Error> {
        let path = self.path_for(mode);

        let reason = match Self::read_document(&path).await? {
            ReadOutcome::Missing => return Ok(None),
            ReadOutcome::Loaded(document) => return Ok(Some(Self::checked(document, mode))),
            ReadOutcome::Corrupt(reason) => reason,
        };

        tracing::warn!(
            path = %path.display(),
            %reason,
            "State file appears corrupted, attempting recovery from backup"
        );

        let backup_path = Self::backup_path(&path);
        match Self::read_document(&backup_path).await? {
            ReadOutcome::Loaded(document) => {
                tracing::info!(%mode, "Recovered state from backup");
                if let Err(e) = fs::copy(&backup_path, &path).await {
                    tracing::error!("Failed to restore state file from backup: {}", e);
                }
                Ok(Some(Self::checked(document, mode)))
            }
            ReadOutcome::Corrupt(backup_reason) => {
                tracing::error!(
                    reason = %backup_reason,
                    "Backup also corrupted, starting without saved state"
                );
                Ok(None)
            }
            ReadOutcome::Missing => {
                tracing::warn!("No backup file found, starting without saved state");
                Ok(None)
            }
        }
    }

    async fn read_document(path: &Path) -> Result<ReadOutcome, Error> {
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ReadOutcome::Missing),
            Err(e) => {
                return Err(Error::state_store(format!(
                    "Failed to read state file {}: {}",
                    path.display(),
                    e
                )));
            }
        };

        Ok(match serde_json::from_str::<StateDocument>(&content) {
            Ok(document) => ReadOutcome::Loaded(document),
            Err(e) => ReadOutcome::Corrupt(e.to_string()),
        })
    }

    fn checked(document: StateDocument, mode: FeedMode) -> StateDocument {
        if document.version != STATE_DOCUMENT_VERSION {
            tracing::warn!(
                "State file version mismatch: expected {}, got {}. Attempting to load anyway.",
                STATE_DOCUMENT_VERSION,
                document.version
            );
        }
        if document.mode != mode || document.cursor.mode() != mode {
            tracing::warn!(
                expected = %mode,
                found = %document.cursor.mode(),
                "State file holds a cursor for another mode"
            );
        }
        document
    }

    async fn write_document(&self, document: &StateDocument) -> Result<(), Error> {
        let path = self.path_for(document.mode);
        let json = serde_json::to_string_pretty(document)
            .map_err(|e| Error::state_store(format!("Failed to serialize state: {}", e)))?;

        let temp_path = Self::temp_path(&path);
        {
            let mut file = fs::File::create(&temp_path).await.map_err(|e| {
                Error::state_store(format!(
                    "Failed to create temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;
            file.write_all(json.as_bytes()).await.map_err(|e| {
                Error::state_store(format!(
                    "Failed to write to temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;
            file.sync_all().await.map_err(|e| {
                Error::state_store(format!(
                    "Failed to sync temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;
        }

        if path.exists() {
            if let Err(e) = fs::copy(&path, Self::backup_path(&path)).await {
                tracing::warn!("Failed to create backup: {}", e);
            }
        }

        fs::rename(&temp_path, &path).await.map_err(|e| {
            Error::state_store(format!(
                "Failed to rename {} to {}: {}",
                temp_path.display(),
                path.display(),
                e
            ))
        })?;

        tracing::trace!(path = %path.display(), "State written");
        Ok(())
    }

    fn temp_path(path: &Path) -> PathBuf {
        path.with_extension("tmp")
    }

    fn backup_path(path: &Path) -> PathBuf {
        path.with_extension("backup")
    }
}

#[async_trait]
impl CursorStore for FileCursorStore {
    async fn load(&self, mode: FeedMode) -> Result<Option<StateDocument>, Error> {
        if let Some(document) = self.state.read().await.documents.get(&mode) {
            return Ok(Some(document.clone()));
        }

        let loaded = self.load_with_recovery(mode).await?;
        if let Some(document) = &loaded {
            tracing::debug!(%mode, dedup = document.dedup.len(), "Loaded state");
            self.state
                .write()
                .await
                .documents
                .insert(mode, document.clone());
        }
        Ok(loaded)
    }

    async fn save(&self, document: &StateDocument) -> Result<(), Error> {
        {
            let mut state = self.state.write().await;
            state.documents.insert(document.mode, document.clone());
            state.dirty.insert(document.mode);
        }

        // Immediate write for durability
        self.write_document(document).await?;
        self.state.write().await.dirty.remove(&document.mode);
        Ok(())
    }

    async fn flush(&self) -> Result<(), Error> {
        let pending: Vec<StateDocument> = {
            let state = self.state.read().await;
            state
                .dirty
                .iter()
                .filter_map(|mode| state.documents.get(mode).cloned())
                .collect()
        };

        for document in pending {
            self.write_document(&document).await?;
            self.state.write().await.dirty.remove(&document.mode);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EditEvent, Watermark};
    use crate::traits::feed_source::ResumptionCursor;
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    fn document(mode: FeedMode, second: u32) -> StateDocument {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, second).unwrap();
        let mut watermark = Watermark::default();
        watermark.observe(&EditEvent {
            title: "Example".to_string(),
            timestamp: at,
            editor_address: None,
            comment: String::new(),
            revision_id: Some(u64::from(second)),
            parent_revision_id: None,
            change_id: None,
            wiki_domain: "en.wikipedia.org".to_string(),
            old_len: None,
            new_len: None,
        });
        let cursor = ResumptionCursor::empty(mode).unwrap().with_watermark(watermark);
        StateDocument::new(cursor, at, Vec::new())
    }

    #[tokio::test]
    async fn persists_across_instances() {
        let dir = tempdir().unwrap();
        let store = FileCursorStore::new(dir.path()).await.unwrap();
        assert!(store.load(FeedMode::Poll).await.unwrap().is_none());

        let doc = document(FeedMode::Poll, 5);
        store.save(&doc).await.unwrap();
        assert!(dir.path().join("poll_state.json").exists());

        let reopened = FileCursorStore::new(dir.path()).await.unwrap();
        assert_eq!(reopened.load(FeedMode::Poll).await.unwrap(), Some(doc));
    }

    #[tokio::test]
    async fn modes_are_isolated() {
        let dir = tempdir().unwrap();
        let store = FileCursorStore::new(dir.path()).await.unwrap();
        store.save(&document(FeedMode::Stream, 1)).await.unwrap();

        let reopened = FileCursorStore::new(dir.path()).await.unwrap();
        assert!(reopened.load(FeedMode::Poll).await.unwrap().is_none());
        assert!(reopened.load(FeedMode::Stream).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn corruption_recovers_previous_document() {
        let dir = tempdir().unwrap();
        let store = FileCursorStore::new(dir.path()).await.unwrap();
        let first = document(FeedMode::Poll, 1);
        store.save(&first).await.unwrap();
        store.save(&document(FeedMode::Poll, 2)).await.unwrap();

        let path = store.path_for(FeedMode::Poll);
        assert!(path.with_extension("backup").exists());
        fs::write(&path, b"corrupted json data").await.unwrap();

        let reopened = FileCursorStore::new(dir.path()).await.unwrap();
        assert_eq!(reopened.load(FeedMode::Poll).await.unwrap(), Some(first));

        // the main file was restored from the backup
        let restored = fs::read_to_string(&path).await.unwrap();
        assert!(restored.contains("\"mode\": \"poll\""));
    }

    #[tokio::test]
    async fn corruption_without_backup_starts_empty() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("stream_state.json"), b"{").await.unwrap();
        let store = FileCursorStore::new(dir.path()).await.unwrap();
        assert!(store.load(FeedMode::Stream).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn flush_is_a_no_op_when_clean() {
        let dir = tempdir().unwrap();
        let store = FileCursorStore::new(dir.path().join("nested")).await.unwrap();
        store.flush().await.unwrap();
        store.save(&document(FeedMode::Stream, 3)).await.unwrap();
        store.flush().await.unwrap();
        assert!(dir.path().join("nested/stream_state.json").exists());
    }
}

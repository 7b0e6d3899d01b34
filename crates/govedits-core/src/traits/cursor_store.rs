// # Cursor Store Trait
//
// Defines the interface for durable per-mode resumption state.
//
// ## Purpose
//
// Each feed mode keeps one state document: the cursor the next run resumes
// from, the time of the last run, and a snapshot of the dedup set so replays
// across a restart are still suppressed. Modes never share a document.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::feed_source::{FeedMode, ResumptionCursor};
use crate::dedup::DedupEntry;

/// State document format version
pub const STATE_DOCUMENT_VERSION: &str = "1.0";

/// Persisted state of one mode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDocument {
    /// Format version
    pub version: String,
    /// Mode this document belongs to
    pub mode: FeedMode,
    /// Where the next run resumes
    pub cursor: ResumptionCursor,
    /// When this document was last written
    pub last_run: DateTime<Utc>,
    /// Recently dispatched ids
    #[serde(default)]
    pub dedup: Vec<DedupEntry>,
}

impl StateDocument {
    /// Build a current-version document
    pub fn new(cursor: ResumptionCursor, last_run: DateTime<Utc>, dedup: Vec<DedupEntry>) -> Self {
        Self {
            version: STATE_DOCUMENT_VERSION.to_string(),
            mode: cursor.mode(),
            cursor,
            last_run,
            dedup,
        }
    }
}

/// Trait for cursor store implementations
///
/// Implementations must be thread-safe; writes must be atomic so a crash
/// mid-save leaves either the previous or the new document readable.
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Load the document for `mode`, if one was ever saved
    async fn load(&self, mode: FeedMode) -> Result<Option<StateDocument>, crate::Error>;

    /// Replace the document for `document.mode`
    async fn save(&self, document: &StateDocument) -> Result<(), crate::Error>;

    /// Persist any pending changes
    async fn flush(&self) -> Result<(), crate::Error>;
}

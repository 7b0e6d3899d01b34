//! Core traits for the edit watcher
//!
//! This module defines the abstract interfaces that all implementations must follow.
//!
//! - [`FeedSource`]: Produce batches of edits from one feed mode
//! - [`CursorStore`]: Persist per-mode resumption state
//! - [`SensitiveClassifier`], [`DiffCapture`], [`Publisher`], [`RecordSink`]:
//!   Collaborators that receive each match

pub mod collaborators;
pub mod cursor_store;
pub mod feed_source;

pub use collaborators::{
    DiffCapture, Finding, FindingKind, MatchRecord, Post, Publisher, RecordSink,
    SensitiveClassifier, SensitivityReport,
};
pub use cursor_store::{CursorStore, STATE_DOCUMENT_VERSION, StateDocument};
pub use feed_source::{
    BackfillPlan, FeedBatch, FeedMode, FeedSource, Partition, ResumptionCursor, SkippedPage,
    SourceFactory,
};

// # govedits-core
//
// Core library for the government edit watcher.
//
// ## Architecture Overview
//
// This library provides the pieces that decide *whether* an edit matters and
// make sure each one that does is reported exactly once:
// - **ranges**: Address normalization, the immutable range table and the matcher
// - **FeedSource**: Trait for the three feed-consumption modes (poll, stream, backfill)
// - **CursorStore**: Trait for durable per-mode resumption state
// - **Collaborators**: Traits for capture, classification, publishing and records
// - **Orchestrator**: Drains a feed source, matches, deduplicates and dispatches
//
// ## Design Principles
//
// 1. **Immutable lookup data**: The range table is built once and only read
// 2. **One loop, many sources**: Modes differ in cursor semantics, not in dispatch
// 3. **Durable cursors**: Every batch ends with a persisted cursor
// 4. **Best-effort collaborators**: One failing collaborator never blocks the others
// 5. **Library-First**: The daemon is a thin wiring layer over this crate

pub mod backoff;
pub mod clock;
pub mod config;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod event;
pub mod ranges;
pub mod state;
pub mod traits;

// Re-export core types for convenience
pub use config::{DispatchConfig, EngineConfig, FeedConfig, WatchConfig};
pub use engine::{EngineEvent, Orchestrator, RunOutcome};
pub use error::{Error, Result};
pub use event::{EditEvent, EventId, MatchResult};
pub use ranges::{AddressFamily, AddressRange, Matcher, Ordinal, RangeTable, Tier};
pub use state::{FileCursorStore, MemoryCursorStore, RunLock};
pub use traits::{CursorStore, FeedSource, RecordSink, SourceFactory};

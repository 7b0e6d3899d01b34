// # Feed Source Trait
//
// Defines the interface the orchestrator drains, independent of how edits
// arrive (server-sent push stream, periodic pull, bounded history scan).
//
// ## Cursor Ownership
//
// A source reports where it is (`current_cursor`) and what the next batch
// would move it to (`FeedBatch::cursor`), but it only adopts a new durable
// position when the orchestrator calls `advance_cursor` after the batch has
// been dispatched and persisted.
//
// ## Usage
//
// ```rust,ignore
// let mut source = factory.create(FeedMode::Poll, stored_cursor)?;
// while let Some(batch) = source.produce_batch().await? {
//     // match, dispatch, persist batch.cursor
//     source.advance_cursor(&batch);
// }
// ```

use async_trait::async_trait;
use chrono::{DateTime, Days, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use crate::event::{EditEvent, Watermark};

/// Feed-consumption mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedMode {
    /// Continuous server-sent event stream
    #[default]
    Stream,
    /// Periodic pull with continuation
    Poll,
    /// Bounded historical scan
    Backfill,
}

impl FeedMode {
    /// Lowercase name, also used for state file names
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stream => "stream",
            Self::Poll => "poll",
            Self::Backfill => "backfill",
        }
    }
}

impl fmt::Display for FeedMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeedMode {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, crate::Error> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stream" => Ok(Self::Stream),
            "poll" => Ok(Self::Poll),
            "backfill" => Ok(Self::Backfill),
            other => Err(crate::Error::config(format!(
                "Unknown mode '{}' (expected stream, poll or backfill)",
                other
            ))),
        }
    }
}

/// One unit of backfill work: a UTC day clipped to the window
///
/// Both bounds are inclusive at second resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    /// First second covered
    pub start: DateTime<Utc>,
    /// Last second covered
    pub end: DateTime<Utc>,
}

impl Partition {
    /// Split `[start, end]` into day partitions, oldest first
    pub fn split_days(start: DateTime<Utc>, end: DateTime<Utc>) -> VecDeque<Partition> {
        let mut partitions = VecDeque::new();
        let mut cursor = start;

        while cursor <= end {
            let Some(next_day) = cursor.date_naive().checked_add_days(Days::new(1)) else {
                partitions.push_back(Partition { start: cursor, end });
                break;
            };
            let midnight = next_day.and_time(NaiveTime::MIN).and_utc();
            partitions.push_back(Partition {
                start: cursor,
                end: (midnight - Duration::seconds(1)).min(end),
            });
            cursor = midnight;
        }
        partitions
    }
}

/// Progress through a backfill window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillPlan {
    /// Oldest second of the window
    pub window_start: DateTime<Utc>,
    /// Newest second of the window
    pub window_end: DateTime<Utc>,
    /// Partitions not yet finished, front is in progress
    pub pending: VecDeque<Partition>,
    /// Continuation token inside the front partition
    pub continuation: Option<String>,
}

impl BackfillPlan {
    /// Fresh plan over `[window_start, window_end]`
    pub fn new(window_start: DateTime<Utc>, window_end: DateTime<Utc>) -> Self {
        Self {
            window_start,
            window_end,
            pending: Partition::split_days(window_start, window_end),
            continuation: None,
        }
    }

    /// Whether every partition has been consumed
    pub fn is_complete(&self) -> bool {
        self.pending.is_empty()
    }

    /// Whether an unfinished plan still reaches back to `since`
    pub fn covers(&self, since: DateTime<Utc>) -> bool {
        !self.is_complete() && self.window_start <= since && since <= self.window_end
    }

    /// Partition currently being fetched
    pub fn current(&self) -> Option<&Partition> {
        self.pending.front()
    }

    /// Finish the front partition
    pub fn complete_current(&mut self) {
        self.pending.pop_front();
        self.continuation = None;
    }
}

/// Durable feed position, one shape per mode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum ResumptionCursor {
    /// Push stream position; reconnects replay from its timestamp
    Stream {
        /// Last consumed edit
        watermark: Watermark,
    },
    /// Poll position; the next cycle starts at its timestamp
    Poll {
        /// Last consumed edit
        watermark: Watermark,
    },
    /// Backfill position
    Backfill {
        /// Last consumed edit
        watermark: Watermark,
        /// Remaining work
        plan: BackfillPlan,
    },
}

impl ResumptionCursor {
    /// Empty cursor for a streaming or polling mode
    pub fn empty(mode: FeedMode) -> Option<Self> {
        match mode {
            FeedMode::Stream => Some(Self::Stream {
                watermark: Watermark::default(),
            }),
            FeedMode::Poll => Some(Self::Poll {
                watermark: Watermark::default(),
            }),
            FeedMode::Backfill => None,
        }
    }

    /// Mode this cursor belongs to
    pub fn mode(&self) -> FeedMode {
        match self {
            Self::Stream { .. } => FeedMode::Stream,
            Self::Poll { .. } => FeedMode::Poll,
            Self::Backfill { .. } => FeedMode::Backfill,
        }
    }

    /// Position of the last consumed edit
    pub fn watermark(&self) -> &Watermark {
        match self {
            Self::Stream { watermark } | Self::Poll { watermark } | Self::Backfill { watermark, .. } => {
                watermark
            }
        }
    }

    /// Mutable access to the watermark
    pub fn watermark_mut(&mut self) -> &mut Watermark {
        match self {
            Self::Stream { watermark } | Self::Poll { watermark } | Self::Backfill { watermark, .. } => {
                watermark
            }
        }
    }

    /// Same cursor with a different watermark
    pub fn with_watermark(mut self, watermark: Watermark) -> Self {
        *self.watermark_mut() = watermark;
        self
    }

    /// Backfill plan, when this is a backfill cursor
    pub fn plan(&self) -> Option<&BackfillPlan> {
        match self {
            Self::Backfill { plan, .. } => Some(plan),
            _ => None,
        }
    }
}

/// A page the source gave up on after its retry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedPage {
    /// Mode of the source that skipped it
    pub mode: FeedMode,
    /// Start of the time window the page belonged to
    pub window_start: Option<DateTime<Utc>>,
    /// End of that window
    pub window_end: Option<DateTime<Utc>>,
    /// Continuation token that produced the page
    pub continuation: Option<String>,
    /// Why the page was unusable
    pub reason: String,
    /// When it was skipped
    pub skipped_at: DateTime<Utc>,
}

/// Events produced by one step of a source
#[derive(Debug, Clone)]
pub struct FeedBatch {
    /// Edits in ascending timestamp order
    pub events: Vec<EditEvent>,
    /// Position once every event in the batch is handled
    pub cursor: ResumptionCursor,
    /// Pages dropped while producing the batch
    pub skipped: Vec<SkippedPage>,
}

impl FeedBatch {
    /// Batch of events with nothing skipped
    pub fn new(events: Vec<EditEvent>, cursor: ResumptionCursor) -> Self {
        Self {
            events,
            cursor,
            skipped: Vec::new(),
        }
    }
}

/// Trait for feed source implementations
///
/// A source produces batches lazily. Each call to [`produce_batch`] contains
/// every network wait, retry and inter-request sleep the source needs, so
/// the caller can cancel it by dropping the future.
///
/// # Errors
///
/// - [`crate::Error::TransientFetch`]: retries exhausted; calling again retries
///   from the same durable cursor
/// - [`crate::Error::GapExceeded`]: a push stream cannot replay from its cursor
///
/// [`produce_batch`]: FeedSource::produce_batch
#[async_trait]
pub trait FeedSource: Send {
    /// Mode this source implements
    fn mode(&self) -> FeedMode;

    /// Produce the next batch
    ///
    /// `Ok(None)` means the source is exhausted, which only a backfill
    /// source ever reports.
    async fn produce_batch(&mut self) -> Result<Option<FeedBatch>, crate::Error>;

    /// Durable position reached so far
    fn current_cursor(&self) -> ResumptionCursor;

    /// Adopt `batch.cursor` as the durable position
    ///
    /// The orchestrator may hand back a batch whose cursor it held back when
    /// a dispatch failed; the source must resume from there.
    fn advance_cursor(&mut self, batch: &FeedBatch);
}

/// Helper trait for constructing feed sources
pub trait SourceFactory: Send + Sync {
    /// Create a source for `mode`, resuming from `cursor` when given
    fn create(
        &self,
        mode: FeedMode,
        cursor: Option<ResumptionCursor>,
    ) -> Result<Box<dyn FeedSource>, crate::Error>;

    /// Create a backfill source over an explicit window
    fn create_backfill(
        &self,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Box<dyn FeedSource>, crate::Error>;
}

//! Feed orchestrator
//!
//! The Orchestrator is responsible for:
//! - Draining a FeedSource batch by batch
//! - Matching anonymous edits against the range table
//! - Suppressing replays through the dedup set
//! - Dispatching each new match to the collaborators
//! - Persisting the cursor after every batch
//! - Falling back to a backfill when the push stream cannot replay a gap
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐
//! │ FeedSource  │─── FeedBatch ───┐
//! └─────────────┘                 │
//!                                 ▼
//!                        ┌──────────────┐
//!                        │ Orchestrator │── Matcher / DedupSet
//!                        └──────────────┘
//!                                 │
//!      ┌──────────────────┬───────┴──────────┬──────────────────┐
//!      ▼                  ▼                  ▼                  ▼
//! ┌───────────┐   ┌──────────────┐   ┌─────────────┐   ┌──────────────┐
//! │ Classifier│   │ Capture ∥    │   │ RecordSink  │   │ CursorStore  │
//! │           │   │ Publisher    │   │ (durable)   │   │ (per batch)  │
//! └───────────┘   └──────────────┘   └─────────────┘   └──────────────┘
//! ```
//!
//! ## Batch Flow
//!
//! 1. Skip edits at or before the durable watermark
//! 2. Skip named accounts and addresses outside the tier
//! 3. Skip ids already dispatched
//! 4. Classify, then capture and publish concurrently, then append the record
//! 5. Persist cursor and dedup snapshot, then let the source adopt the cursor

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::clock::Clock;
use crate::config::{DispatchConfig, EngineConfig, WatchConfig};
use crate::dedup::DedupSet;
use crate::error::{Error, Result};
use crate::event::{EventId, MatchResult};
use crate::ranges::{Matcher, Tier};
use crate::state::DeadLetterLog;
use crate::traits::{
    CursorStore, DiffCapture, FeedBatch, FeedMode, FeedSource, MatchRecord, Post, Publisher,
    RecordSink, ResumptionCursor, SensitiveClassifier, SourceFactory, StateDocument,
};

/// Events emitted by the Orchestrator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// Run started
    Started {
        mode: FeedMode,
        tier: Tier,
    },

    /// A batch was processed and its cursor persisted
    BatchApplied {
        mode: FeedMode,
        events: usize,
        dispatched: usize,
    },

    /// A new match went through the collaborators
    MatchDispatched {
        id: EventId,
        organization: String,
    },

    /// A match was dropped because it was already dispatched
    DuplicateSuppressed {
        id: EventId,
    },

    /// A collaborator failed for one match
    DispatchFailed {
        id: EventId,
        collaborator: String,
        error: String,
    },

    /// The push stream cursor is too old to replay
    GapDetected {
        since: DateTime<Utc>,
        now: DateTime<Utc>,
    },

    /// A backfill window was fully consumed
    BackfillCompleted {
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    },

    /// A source gave up on a fetch; the next cycle retries it
    FetchFailed {
        mode: FeedMode,
        error: String,
    },

    /// Run stopped
    Stopped {
        reason: String,
    },
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Cancelled by the shutdown token
    Shutdown,
    /// A backfill run consumed its whole window
    Exhausted,
}

/// The collaborators a match is dispatched to
///
/// Capture and publish are optional; the record sink is the durable gate.
#[derive(Clone)]
pub struct Collaborators {
    /// Sensitive-content classifier
    pub classifier: Arc<dyn SensitiveClassifier>,
    /// Diff capture
    pub capture: Option<Arc<dyn DiffCapture>>,
    /// Social publisher
    pub publisher: Option<Arc<dyn Publisher>>,
    /// Durable record
    pub records: Arc<dyn RecordSink>,
}

/// Why draining a source stopped
enum Drained {
    Exhausted,
    Shutdown,
    Gap {
        since: DateTime<Utc>,
        now: DateTime<Utc>,
    },
}

/// Feed orchestrator
///
/// One orchestrator drives one mode on a single task. Sources are built
/// through the [`SourceFactory`] so the gap fallback can swap a push stream
/// for a backfill and back.
pub struct Orchestrator {
    mode: FeedMode,
    tier: Tier,
    matcher: Matcher,
    factory: Arc<dyn SourceFactory>,
    store: Arc<dyn CursorStore>,
    collaborators: Collaborators,
    dead_letters: Option<DeadLetterLog>,
    clock: Arc<dyn Clock>,
    engine: EngineConfig,
    dispatch: DispatchConfig,
    dedup: DedupSet,
    /// Appends that outlived the record timeout, by edit
    in_flight: HashMap<EventId, JoinHandle<Result<()>>>,
    event_tx: mpsc::Sender<EngineEvent>,
}

impl Orchestrator {
    /// Create a new orchestrator
    ///
    /// # Returns
    ///
    /// A tuple of (orchestrator, event_receiver) where event_receiver yields engine events
    pub fn new(
        config: &WatchConfig,
        matcher: Matcher,
        factory: Arc<dyn SourceFactory>,
        store: Arc<dyn CursorStore>,
        collaborators: Collaborators,
        clock: Arc<dyn Clock>,
    ) -> Result<(Self, mpsc::Receiver<EngineEvent>)> {
        config.engine.validate()?;
        config.dispatch.validate()?;

        let (tx, rx) = mpsc::channel(config.engine.event_channel_capacity);

        let orchestrator = Self {
            mode: config.mode,
            tier: config.tier,
            matcher,
            factory,
            store,
            collaborators,
            dead_letters: None,
            clock,
            engine: config.engine.clone(),
            dispatch: config.dispatch.clone(),
            dedup: DedupSet::new(config.engine.dedup_capacity, config.engine.dedup_retention()),
            in_flight: HashMap::new(),
            event_tx: tx,
        };

        Ok((orchestrator, rx))
    }

    /// Write skipped pages to `log`
    pub fn with_dead_letters(mut self, log: DeadLetterLog) -> Self {
        self.dead_letters = Some(log);
        self
    }

    /// Number of remembered dispatch ids
    pub fn dedup_len(&self) -> usize {
        self.dedup.len()
    }

    /// Run until the token is cancelled or a backfill run is exhausted
    ///
    /// # Returns
    ///
    /// - `Ok(RunOutcome)`: clean end, cursor persisted and flushed
    /// - `Err(Error)`: fatal error (state store failure, source construction)
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<RunOutcome> {
        self.emit_event(EngineEvent::Started {
            mode: self.mode,
            tier: self.tier,
        });
        info!(mode = %self.mode, tier = %self.tier, "Orchestrator starting");

        let cursor = self.restore(self.mode).await?;
        self.seed_from_records().await;

        let mut source = self.factory.create(self.mode, cursor)?;

        loop {
            match self.drain(source.as_mut(), &shutdown).await? {
                Drained::Shutdown => {
                    self.stop(source.current_cursor(), "Shutdown signal").await?;
                    return Ok(RunOutcome::Shutdown);
                }
                Drained::Exhausted => {
                    if let Some(plan) = source.current_cursor().plan() {
                        self.emit_event(EngineEvent::BackfillCompleted {
                            window_start: plan.window_start,
                            window_end: plan.window_end,
                        });
                    }
                    self.stop(source.current_cursor(), "Feed exhausted").await?;
                    return Ok(RunOutcome::Exhausted);
                }
                Drained::Gap { since, now } => {
                    let Some(resume) = self.fill_gap(since, now, &shutdown).await? else {
                        self.emit_event(EngineEvent::Stopped {
                            reason: "Shutdown signal".to_string(),
                        });
                        return Ok(RunOutcome::Shutdown);
                    };
                    source = self.factory.create(FeedMode::Stream, Some(resume))?;
                    info!("Gap filled, resuming push stream");
                }
            }
        }
    }

    /// Load the stored document for `mode` and restore its dedup snapshot
    async fn restore(&mut self, mode: FeedMode) -> Result<Option<ResumptionCursor>> {
        let Some(document) = self.store.load(mode).await? else {
            info!(%mode, "No saved state, starting fresh");
            return Ok(None);
        };

        self.dedup.restore(document.dedup, self.clock.now());
        info!(
            %mode,
            watermark = ?document.cursor.watermark().timestamp,
            remembered = self.dedup.len(),
            "Resuming from saved state"
        );
        Ok(Some(document.cursor))
    }

    /// Remember the ids of the most recent records
    ///
    /// Covers dispatches whose cursor never made it to disk.
    async fn seed_from_records(&mut self) {
        let records = &self.collaborators.records;
        match records.recent_ids(self.dispatch.seed_rows).await {
            Ok(ids) => {
                let now = self.clock.now();
                let seeded = ids
                    .into_iter()
                    .filter(|id| self.dedup.insert(id.clone(), now))
                    .count();
                debug!(seeded, "Dedup set seeded from records");
            }
            Err(e) => warn!(sink = records.name(), error = %e, "Could not read recent records"),
        }
    }

    /// Pull batches until the source ends, fails fatally or shutdown
    async fn drain(
        &mut self,
        source: &mut dyn FeedSource,
        shutdown: &CancellationToken,
    ) -> Result<Drained> {
        let pause = Backoff::from_config(&self.engine).delay(self.engine.max_retries);

        loop {
            let produced = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(Drained::Shutdown),
                produced = source.produce_batch() => produced,
            };

            match produced {
                Ok(Some(batch)) => self.apply_batch(source, batch).await?,
                Ok(None) => return Ok(Drained::Exhausted),
                Err(Error::GapExceeded { since, now }) => return Ok(Drained::Gap { since, now }),
                Err(e @ (Error::TransientFetch(_) | Error::MalformedResponse(_) | Error::Io(_))) => {
                    warn!(mode = %source.mode(), error = %e, "Fetch failed, retrying next cycle");
                    self.emit_event(EngineEvent::FetchFailed {
                        mode: source.mode(),
                        error: e.to_string(),
                    });
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => return Ok(Drained::Shutdown),
                        _ = tokio::time::sleep(pause) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Backfill `[since, now]`, then return the stream cursor to resume from
    ///
    /// `None` means shutdown arrived while backfilling; the backfill cursor
    /// has been persisted so the next run picks up where this one stopped.
    async fn fill_gap(
        &mut self,
        since: DateTime<Utc>,
        now: DateTime<Utc>,
        shutdown: &CancellationToken,
    ) -> Result<Option<ResumptionCursor>> {
        warn!(%since, %now, "Push stream cannot replay gap, falling back to backfill");
        self.emit_event(EngineEvent::GapDetected { since, now });

        let mut backfill = match self.restore(FeedMode::Backfill).await? {
            Some(cursor) if cursor.plan().is_some_and(|plan| plan.covers(since)) => {
                info!("Resuming interrupted backfill plan");
                self.factory.create(FeedMode::Backfill, Some(cursor))?
            }
            _ => self.factory.create_backfill(since, now)?,
        };

        match self.drain(backfill.as_mut(), shutdown).await? {
            Drained::Exhausted => self.persist(backfill.current_cursor()).await?,
            Drained::Shutdown => {
                self.persist(backfill.current_cursor()).await?;
                self.store.flush().await?;
                return Ok(None);
            }
            Drained::Gap { .. } => {
                return Err(Error::Other(
                    "backfill source reported a feed gap".to_string(),
                ));
            }
        }

        let window_end = backfill
            .current_cursor()
            .plan()
            .map_or(now, |plan| plan.window_end);
        self.emit_event(EngineEvent::BackfillCompleted {
            window_start: since,
            window_end,
        });
        info!(%since, %window_end, "Gap backfill completed");

        let mut stream = match self.store.load(FeedMode::Stream).await? {
            Some(document) => document.cursor,
            None => ResumptionCursor::Stream {
                watermark: Default::default(),
            },
        };
        stream.watermark_mut().advance_to(window_end);
        self.persist(stream.clone()).await?;
        Ok(Some(stream))
    }

    /// Dispatch one batch and make its cursor durable
    async fn apply_batch(&mut self, source: &mut dyn FeedSource, mut batch: FeedBatch) -> Result<()> {
        let durable = source.current_cursor();
        let start = durable.watermark().clone();
        let mut reached = start.clone();
        let mut dispatched = 0usize;
        let mut failed = false;

        for event in &batch.events {
            if !start.admits(event) {
                debug!(id = %event.id(), "Already consumed, skipping");
                continue;
            }

            let Some(result) = self.matcher.match_event(event, self.tier) else {
                reached.observe(event);
                continue;
            };

            let id = event.id();
            if self.dedup.contains(&id) {
                debug!(%id, "Duplicate match suppressed");
                self.emit_event(EngineEvent::DuplicateSuppressed { id });
                reached.observe(event);
                continue;
            }

            let outcome = match self.settle_in_flight(&id).await {
                Some(outcome) => outcome,
                None => {
                    let record = self.dispatch(&result).await;
                    self.append_record(id.clone(), record).await
                }
            };
            match outcome {
                Ok(()) => {
                    self.dedup.insert(id.clone(), self.clock.now());
                    reached.observe(event);
                    dispatched += 1;
                    self.emit_event(EngineEvent::MatchDispatched {
                        id,
                        organization: result.range.organization.clone(),
                    });
                }
                Err(e) => {
                    error!(%id, error = %e, "Record append failed, holding cursor back");
                    self.emit_event(EngineEvent::DispatchFailed {
                        id,
                        collaborator: self.collaborators.records.name().to_string(),
                        error: e.to_string(),
                    });
                    failed = true;
                    break;
                }
            }
        }

        // A failed record keeps the source on its previous page; only the
        // watermark moves, up to the last handled edit.
        batch.cursor = if failed {
            durable.with_watermark(reached)
        } else {
            let watermark = batch.cursor.watermark().clone().max(reached);
            batch.cursor.with_watermark(watermark)
        };

        self.persist(batch.cursor.clone()).await?;
        source.advance_cursor(&batch);

        if !batch.skipped.is_empty() {
            warn!(count = batch.skipped.len(), "Feed pages skipped after retry");
            if let Some(log) = &self.dead_letters {
                if let Err(e) = log.append(&batch.skipped).await {
                    error!(path = %log.path().display(), error = %e, "Failed to write dead letters");
                }
            }
        }

        debug!(
            mode = %source.mode(),
            events = batch.events.len(),
            dispatched,
            "Batch applied"
        );
        self.emit_event(EngineEvent::BatchApplied {
            mode: source.mode(),
            events: batch.events.len(),
            dispatched,
        });
        Ok(())
    }

    /// Classify, then capture ∥ publish, and build the record to append
    ///
    /// Capture and publish failures are logged and reported as engine events.
    async fn dispatch(&self, result: &MatchResult) -> MatchRecord {
        let event = &result.event;
        let id = event.id();
        info!(
            %id,
            title = %event.title,
            address = event.editor_address.as_deref().unwrap_or_default(),
            organization = %result.range.organization,
            "Government edit detected"
        );

        let excluded: Vec<String> = [event.revision_id, event.parent_revision_id]
            .into_iter()
            .flatten()
            .map(|rev| rev.to_string())
            .collect();
        let sensitivity = self
            .collaborators
            .classifier
            .classify(&event.comment, &excluded);
        if sensitivity.is_sensitive() {
            warn!(%id, findings = sensitivity.findings.len(), "Sensitive content in edit summary");
        }

        let capture_timeout = self.dispatch.capture_timeout();
        let (image_tx, image_rx) = oneshot::channel();

        let capture = async {
            let image = match &self.collaborators.capture {
                Some(capturer) => match timeout(capture_timeout, capturer.capture(result)).await {
                    Ok(Ok(path)) => Some(path),
                    Ok(Err(e)) => {
                        self.collaborator_failed(&id, capturer.name(), e.to_string());
                        None
                    }
                    Err(_) => {
                        self.collaborator_failed(&id, capturer.name(), "timed out".to_string());
                        None
                    }
                },
                None => None,
            };
            // the publisher may have given up waiting
            let _ = image_tx.send(image.clone());
            image
        };

        let publish = async {
            let Some(publisher) = &self.collaborators.publisher else {
                return;
            };
            let image = match timeout(capture_timeout, image_rx).await {
                Ok(Ok(image)) => image,
                _ => None,
            };
            if image.is_none() {
                debug!(%id, "Publishing without image");
            }
            let post = Post::for_match(result, image);
            match timeout(self.dispatch.publish_timeout(), publisher.publish(&post)).await {
                Ok(Ok(post_id)) => info!(%id, %post_id, "Match published"),
                Ok(Err(e)) => self.collaborator_failed(&id, publisher.name(), e.to_string()),
                Err(_) => self.collaborator_failed(&id, publisher.name(), "timed out".to_string()),
            }
        };

        let (image, ()) = tokio::join!(capture, publish);
        MatchRecord::new(result, image, sensitivity)
    }

    /// Append `record` on its own task
    ///
    /// The timeout stops the wait, never the write: a slow append keeps
    /// running and is settled before the same edit is dispatched again.
    async fn append_record(&mut self, id: EventId, record: MatchRecord) -> Result<()> {
        let records = Arc::clone(&self.collaborators.records);
        let handle = tokio::spawn(async move { records.append(&record).await });
        self.await_append(id, handle).await
    }

    async fn await_append(&mut self, id: EventId, mut handle: JoinHandle<Result<()>>) -> Result<()> {
        let name = self.collaborators.records.name().to_string();
        match timeout(self.dispatch.record_timeout(), &mut handle).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(Error::dispatch(name, e.to_string())),
            Ok(Err(e)) => Err(Error::dispatch(name, format!("append task failed: {}", e))),
            Err(_) => {
                self.in_flight.insert(id, handle);
                Err(Error::dispatch(name, "timed out"))
            }
        }
    }

    /// Outcome of an earlier append for `id` that timed out
    ///
    /// `None` means there is nothing to settle, or the earlier append failed
    /// and the edit must be dispatched again.
    async fn settle_in_flight(&mut self, id: &EventId) -> Option<Result<()>> {
        let handle = self.in_flight.remove(id)?;
        debug!(%id, "Settling earlier record append");
        match self.await_append(id.clone(), handle).await {
            Ok(()) => {
                info!(%id, "Earlier record append completed");
                Some(Ok(()))
            }
            Err(e) if self.in_flight.contains_key(id) => Some(Err(e)),
            Err(e) => {
                warn!(%id, error = %e, "Earlier record append failed, dispatching again");
                None
            }
        }
    }

    fn collaborator_failed(&self, id: &EventId, collaborator: &str, error: String) {
        warn!(%id, collaborator, %error, "Collaborator failed, continuing");
        self.emit_event(EngineEvent::DispatchFailed {
            id: id.clone(),
            collaborator: collaborator.to_string(),
            error,
        });
    }

    /// Save `cursor` with the current dedup snapshot
    async fn persist(&mut self, cursor: ResumptionCursor) -> Result<()> {
        let now = self.clock.now();
        self.dedup.evict_expired(now);
        let document = StateDocument::new(cursor, now, self.dedup.snapshot());
        self.store.save(&document).await
    }

    async fn stop(&mut self, cursor: ResumptionCursor, reason: &str) -> Result<()> {
        for (id, handle) in self.in_flight.drain() {
            match timeout(self.dispatch.record_timeout(), handle).await {
                Ok(Ok(Ok(()))) => {
                    info!(%id, "Slow record append finished before stop");
                    self.dedup.insert(id, self.clock.now());
                }
                _ => warn!(%id, "Record append unsettled at stop; edit will be dispatched again"),
            }
        }
        self.persist(cursor).await?;
        self.store.flush().await?;
        info!(reason, "State flushed, orchestrator stopped");
        self.emit_event(EngineEvent::Stopped {
            reason: reason.to_string(),
        });
        Ok(())
    }

    /// Emit an engine event
    fn emit_event(&self, event: EngineEvent) {
        // Send event, logging warning if channel is full (backpressure)
        if self.event_tx.try_send(event).is_err() {
            warn!("Event channel full, dropping event. Consider increasing event_channel_capacity.");
        }
    }
}

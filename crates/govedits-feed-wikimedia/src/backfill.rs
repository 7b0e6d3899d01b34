//! Bounded historical backfill
//!
//! Walks a [`BackfillPlan`] one page at a time: the front partition is
//! fetched with its continuation token, and popped once the API reports no
//! further page. Requests are spaced by a minimum delay no matter how fast
//! upstream answers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use govedits_core::clock::Clock;
use govedits_core::traits::{
    BackfillPlan, FeedBatch, FeedMode, FeedSource, ResumptionCursor, SkippedPage,
};
use govedits_core::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::client::{RcQuery, RcReply, RecentChangesClient};

/// Day-partitioned backfill over a fixed window
pub struct BackfillSource {
    client: RecentChangesClient,
    clock: Arc<dyn Clock>,
    wiki_domain: String,
    min_delay: Duration,
    last_request: Option<Instant>,
    cursor: ResumptionCursor,
}

impl BackfillSource {
    /// Create a source working through `cursor`'s plan
    ///
    /// Returns `Error::Config` when `cursor` is not a backfill cursor.
    pub fn new(
        client: RecentChangesClient,
        clock: Arc<dyn Clock>,
        wiki_domain: impl Into<String>,
        min_delay: Duration,
        cursor: ResumptionCursor,
    ) -> Result<Self> {
        let Some(plan) = cursor.plan() else {
            return Err(Error::config(format!(
                "Backfill source needs a backfill cursor, got {}",
                cursor.mode()
            )));
        };
        info!(
            window_start = %plan.window_start,
            window_end = %plan.window_end,
            partitions = plan.pending.len(),
            resumed = plan.continuation.is_some(),
            "Backfill planned"
        );

        Ok(Self {
            client,
            clock,
            wiki_domain: wiki_domain.into(),
            min_delay,
            last_request: None,
            cursor,
        })
    }

    /// Sleep until `min_delay` has passed since the previous request
    async fn pace(&mut self) {
        if let Some(last) = self.last_request {
            let elapsed = last.elapsed();
            if elapsed < self.min_delay {
                tokio::time::sleep(self.min_delay - elapsed).await;
            }
        }
        self.last_request = Some(Instant::now());
    }

    /// Cursor after applying `update` to a copy of the plan
    fn next_cursor(&self, update: impl FnOnce(&mut BackfillPlan)) -> ResumptionCursor {
        let mut cursor = self.cursor.clone();
        if let ResumptionCursor::Backfill { plan, .. } = &mut cursor {
            update(plan);
        }
        cursor
    }
}

#[async_trait]
impl FeedSource for BackfillSource {
    fn mode(&self) -> FeedMode {
        FeedMode::Backfill
    }

    async fn produce_batch(&mut self) -> Result<Option<FeedBatch>> {
        let Some(plan) = self.cursor.plan() else {
            return Ok(None);
        };
        let Some(partition) = plan.current().copied() else {
            info!("Backfill window exhausted");
            return Ok(None);
        };
        let continuation = plan.continuation.clone();

        self.pace().await;

        let query = RcQuery {
            start: partition.start,
            end: partition.end,
            continuation: continuation.clone(),
        };

        match self.client.fetch_page(&query).await {
            Ok(RcReply::Page(page)) => {
                let mut events: Vec<_> = page
                    .changes
                    .into_iter()
                    .map(|change| change.into_event(&self.wiki_domain))
                    .collect();
                events.sort_by_key(|e| e.timestamp);

                let mut cursor = self.next_cursor(|plan| match page.continuation {
                    Some(token) => plan.continuation = Some(token),
                    None => plan.complete_current(),
                });
                for event in &events {
                    cursor.watermark_mut().observe(event);
                }

                debug!(
                    partition_start = %partition.start,
                    events = events.len(),
                    "Backfill page fetched"
                );
                Ok(Some(FeedBatch::new(events, cursor)))
            }
            Ok(RcReply::BadContinue) if continuation.is_some() => {
                warn!(
                    partition_start = %partition.start,
                    "Continuation rejected, restarting partition"
                );
                let cursor = self.next_cursor(|plan| plan.continuation = None);
                Ok(Some(FeedBatch::new(Vec::new(), cursor)))
            }
            Ok(RcReply::BadContinue) => self.skip(
                partition.start,
                partition.end,
                continuation,
                "API rejected request without continuation".to_string(),
            ),
            Err(Error::MalformedResponse(reason)) => {
                self.skip(partition.start, partition.end, continuation, reason)
            }
            Err(e) => Err(e),
        }
    }

    fn current_cursor(&self) -> ResumptionCursor {
        self.cursor.clone()
    }

    fn advance_cursor(&mut self, batch: &FeedBatch) {
        self.cursor = batch.cursor.clone();
    }
}

impl BackfillSource {
    /// Give up on the rest of the front partition
    fn skip(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        continuation: Option<String>,
        reason: String,
    ) -> Result<Option<FeedBatch>> {
        warn!(%start, %end, %reason, "Skipping rest of backfill partition");

        let mut cursor = self.next_cursor(BackfillPlan::complete_current);
        cursor.watermark_mut().advance_to(end);

        let mut batch = FeedBatch::new(Vec::new(), cursor);
        batch.skipped.push(SkippedPage {
            mode: FeedMode::Backfill,
            window_start: Some(start),
            window_end: Some(end),
            continuation,
            reason,
            skipped_at: self.clock.now(),
        });
        Ok(Some(batch))
    }
}

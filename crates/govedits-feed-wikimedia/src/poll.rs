//! Periodic pull of recent changes
//!
//! Each cycle asks for everything between the watermark and "now",
//! following `rccontinue` until the API runs out of pages. Every page is its
//! own batch, so a long catch-up makes its progress durable as it goes.
//! Cycles after the first wait the poll interval first.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use govedits_core::clock::Clock;
use govedits_core::event::Watermark;
use govedits_core::traits::{FeedBatch, FeedMode, FeedSource, ResumptionCursor, SkippedPage};
use govedits_core::{EditEvent, Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::client::{RcQuery, RcReply, RecentChangesClient};

/// Window of the cycle in progress
#[derive(Debug, Clone)]
struct Cycle {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    continuation: Option<String>,
    pages: usize,
}

/// Pull-based source with a fixed sleep between cycles
pub struct PollSource {
    client: RecentChangesClient,
    clock: Arc<dyn Clock>,
    wiki_domain: String,
    interval: Duration,
    /// Lower bound used while the watermark is still empty
    origin: DateTime<Utc>,
    cursor: ResumptionCursor,
    cycles: u64,
    cycle: Option<Cycle>,
    /// Watermark of the last produced batch
    produced: Option<Watermark>,
}

impl PollSource {
    /// Create a poll source resuming from `cursor`
    pub fn new(
        client: RecentChangesClient,
        clock: Arc<dyn Clock>,
        wiki_domain: impl Into<String>,
        interval: Duration,
        cursor: ResumptionCursor,
    ) -> Self {
        let origin = clock.now();
        Self {
            client,
            clock,
            wiki_domain: wiki_domain.into(),
            interval,
            origin,
            cursor,
            cycles: 0,
            cycle: None,
            produced: None,
        }
    }

    async fn begin_cycle(&mut self) -> Cycle {
        if self.cycles > 0 {
            tokio::time::sleep(self.interval).await;
        } else {
            info!(
                since = ?self.cursor.watermark().timestamp,
                interval = ?self.interval,
                "Polling recent changes"
            );
        }
        self.cycles += 1;

        let start = self.cursor.watermark().timestamp.unwrap_or(self.origin);
        Cycle {
            start,
            end: self.clock.now().max(start),
            continuation: None,
            pages: 0,
        }
    }

    /// Fetch the next page of `cycle`; the cycle stays open while pages remain
    async fn next_page(&mut self, mut cycle: Cycle) -> Result<FeedBatch> {
        let query = RcQuery {
            start: cycle.start,
            end: cycle.end,
            continuation: cycle.continuation.clone(),
        };

        let reason = match self.client.fetch_page(&query).await {
            Ok(RcReply::Page(page)) => {
                cycle.pages += 1;
                let mut events: Vec<EditEvent> = page
                    .changes
                    .into_iter()
                    .map(|change| change.into_event(&self.wiki_domain))
                    .collect();
                events.sort_by_key(|e| e.timestamp);

                let mut cursor = self.cursor.clone();
                for event in &events {
                    cursor.watermark_mut().observe(event);
                }

                match page.continuation {
                    Some(token) => {
                        cycle.continuation = Some(token);
                        self.cycle = Some(cycle);
                    }
                    None => debug!(
                        pages = cycle.pages,
                        start = %cycle.start,
                        end = %cycle.end,
                        "Poll cycle complete"
                    ),
                }
                return Ok(FeedBatch::new(events, cursor));
            }
            Ok(RcReply::BadContinue) => "API rejected continuation token".to_string(),
            Err(Error::MalformedResponse(reason)) => reason,
            Err(e) => return Err(e),
        };

        // Give up on the rest of the window; the next cycle starts at `end`
        let seen = self.cursor.watermark().timestamp.unwrap_or(cycle.start).max(cycle.start);
        warn!(%seen, end = %cycle.end, %reason, "Skipping rest of poll window");
        let skipped = SkippedPage {
            mode: FeedMode::Poll,
            window_start: Some(seen),
            window_end: Some(cycle.end),
            continuation: cycle.continuation.clone(),
            reason,
            skipped_at: self.clock.now(),
        };

        let mut cursor = self.cursor.clone();
        cursor.watermark_mut().advance_to(cycle.end);
        Ok(FeedBatch {
            events: Vec::new(),
            cursor,
            skipped: vec![skipped],
        })
    }
}

#[async_trait]
impl FeedSource for PollSource {
    fn mode(&self) -> FeedMode {
        FeedMode::Poll
    }

    async fn produce_batch(&mut self) -> Result<Option<FeedBatch>> {
        let cycle = match self.cycle.take() {
            Some(cycle) => cycle,
            None => self.begin_cycle().await,
        };

        let batch = self.next_page(cycle).await?;
        self.produced = Some(batch.cursor.watermark().clone());
        Ok(Some(batch))
    }

    fn current_cursor(&self) -> ResumptionCursor {
        self.cursor.clone()
    }

    fn advance_cursor(&mut self, batch: &FeedBatch) {
        self.cursor = batch.cursor.clone();
        let held_back = self.produced.as_ref() != Some(batch.cursor.watermark());
        if held_back && self.cycle.take().is_some() {
            // the rest of the window is fetched again from the durable position
            info!(since = ?batch.cursor.watermark().timestamp, "Poll cursor held back, restarting window");
        }
    }
}

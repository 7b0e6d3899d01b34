//! Builds the Wikimedia feed sources for the orchestrator

use chrono::{DateTime, Utc};
use govedits_core::backoff::Backoff;
use govedits_core::clock::Clock;
use govedits_core::config::{EngineConfig, FeedConfig, WatchConfig};
use govedits_core::event::Watermark;
use govedits_core::traits::{
    BackfillPlan, FeedMode, FeedSource, ResumptionCursor, SourceFactory,
};
use govedits_core::{Error, Result};
use std::sync::Arc;
use tracing::{info, warn};

use crate::backfill::BackfillSource;
use crate::client::RecentChangesClient;
use crate::poll::PollSource;
use crate::stream::{PushStream, StreamSettings};

/// [`SourceFactory`] for Wikimedia wikis
pub struct WikimediaSourceFactory {
    feed: FeedConfig,
    engine: EngineConfig,
    clock: Arc<dyn Clock>,
    client: RecentChangesClient,
    stream_http: reqwest::Client,
}

impl WikimediaSourceFactory {
    /// Create a factory from the watcher configuration
    pub fn new(config: &WatchConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.feed.validate()?;

        let client = RecentChangesClient::new(&config.feed, &config.engine)?;

        // No total timeout: the stream stays open indefinitely and the
        // source applies its own idle timeout per read.
        let stream_http = reqwest::Client::builder()
            .user_agent(config.feed.user_agent.clone())
            .connect_timeout(config.feed.request_timeout())
            .build()
            .map_err(|e| Error::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            feed: config.feed.clone(),
            engine: config.engine.clone(),
            clock,
            client,
            stream_http,
        })
    }

    fn backfill_source(&self, cursor: ResumptionCursor) -> Result<Box<dyn FeedSource>> {
        Ok(Box::new(BackfillSource::new(
            self.client.clone(),
            Arc::clone(&self.clock),
            self.feed.wiki_domain.clone(),
            self.feed.min_request_delay(),
            cursor,
        )?))
    }

    /// Fresh backfill cursor over the configured number of days
    fn default_window(&self) -> ResumptionCursor {
        let now = self.clock.now();
        let start = now - chrono::Duration::days(i64::from(self.feed.backfill_days));
        ResumptionCursor::Backfill {
            watermark: Watermark::default(),
            plan: BackfillPlan::new(start, now),
        }
    }
}

impl SourceFactory for WikimediaSourceFactory {
    fn create(
        &self,
        mode: FeedMode,
        cursor: Option<ResumptionCursor>,
    ) -> Result<Box<dyn FeedSource>> {
        let cursor = match cursor {
            Some(cursor) if cursor.mode() != mode => {
                warn!(%mode, stored = %cursor.mode(), "Ignoring cursor saved for another mode");
                None
            }
            other => other,
        };

        match mode {
            FeedMode::Stream => {
                let settings = StreamSettings {
                    url: self.feed.stream_url.clone(),
                    wiki: self.feed.wiki.clone(),
                    wiki_domain: self.feed.wiki_domain.clone(),
                    idle_timeout: self.feed.stream_idle_timeout(),
                    gap_threshold: self.engine.gap_threshold(),
                };
                let cursor = cursor.unwrap_or(ResumptionCursor::Stream {
                    watermark: Watermark::default(),
                });
                Ok(Box::new(PushStream::new(
                    self.stream_http.clone(),
                    settings,
                    Arc::clone(&self.clock),
                    Backoff::from_config(&self.engine),
                    cursor,
                )))
            }
            FeedMode::Poll => {
                let cursor = cursor.unwrap_or(ResumptionCursor::Poll {
                    watermark: Watermark::default(),
                });
                Ok(Box::new(PollSource::new(
                    self.client.clone(),
                    Arc::clone(&self.clock),
                    self.feed.wiki_domain.clone(),
                    self.feed.poll_interval(),
                    cursor,
                )))
            }
            FeedMode::Backfill => {
                let cursor = match cursor {
                    Some(cursor) if cursor.plan().is_some_and(|plan| !plan.is_complete()) => {
                        info!("Resuming saved backfill plan");
                        cursor
                    }
                    _ => self.default_window(),
                };
                self.backfill_source(cursor)
            }
        }
    }

    fn create_backfill(
        &self,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Box<dyn FeedSource>> {
        if window_start > window_end {
            return Err(Error::config(format!(
                "Backfill window starts after it ends: {} > {}",
                window_start, window_end
            )));
        }
        self.backfill_source(ResumptionCursor::Backfill {
            watermark: Watermark::default(),
            plan: BackfillPlan::new(window_start, window_end),
        })
    }
}

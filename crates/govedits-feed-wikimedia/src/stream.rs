//! EventStreams push feed
//!
//! Holds one SSE connection to the recent-change stream and turns every
//! relevant event into its own batch. Connections that drop, error out or go
//! quiet for longer than the idle timeout are re-opened with
//! `since=<watermark>`, and the replayed overlap is filtered against the last
//! delivered position.

use async_trait::async_trait;
use eventsource_stream::{Event, EventStreamError, Eventsource};
use futures::StreamExt;
use futures::stream::BoxStream;
use govedits_core::backoff::Backoff;
use govedits_core::clock::Clock;
use govedits_core::event::Watermark;
use govedits_core::traits::{FeedBatch, FeedMode, FeedSource, ResumptionCursor};
use govedits_core::{Error, Result};
use reqwest::StatusCode;
use reqwest::header::ACCEPT;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::client::api_timestamp;
use crate::records::StreamChange;

type SseStream = BoxStream<'static, std::result::Result<Event, EventStreamError<reqwest::Error>>>;

/// Settings for a [`PushStream`]
#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// SSE endpoint
    pub url: String,
    /// Wiki database name to keep
    pub wiki: String,
    /// Fallback domain for diff links
    pub wiki_domain: String,
    /// Reconnect when nothing arrives for this long
    pub idle_timeout: Duration,
    /// Oldest watermark the stream may resume from
    pub gap_threshold: chrono::Duration,
}

/// Push-based source over Server-Sent Events
pub struct PushStream {
    http: reqwest::Client,
    settings: StreamSettings,
    clock: Arc<dyn Clock>,
    backoff: Backoff,
    cursor: ResumptionCursor,
    /// Position of the last produced batch
    delivered: Watermark,
    events: Option<SseStream>,
    /// Connections in a row that ended without a relevant event
    fruitless: usize,
}

impl PushStream {
    /// Create a stream resuming from `cursor`
    pub fn new(
        http: reqwest::Client,
        settings: StreamSettings,
        clock: Arc<dyn Clock>,
        backoff: Backoff,
        cursor: ResumptionCursor,
    ) -> Self {
        let delivered = cursor.watermark().clone();
        Self {
            http,
            settings,
            clock,
            backoff,
            cursor,
            delivered,
            events: None,
            fruitless: 0,
        }
    }

    /// Fail with `GapExceeded` if the watermark is too old to replay
    fn check_gap(&self) -> Result<()> {
        let Some(since) = self.cursor.watermark().timestamp else {
            return Ok(());
        };
        let now = self.clock.now();
        if now - since > self.settings.gap_threshold {
            warn!(%since, %now, "Stream cursor is older than the replay window");
            return Err(Error::GapExceeded { since, now });
        }
        Ok(())
    }

    async fn connect(&mut self) -> Result<()> {
        if self.fruitless > 0 {
            tokio::time::sleep(self.backoff.delay(self.fruitless - 1)).await;
        }
        // Every resume, not just the first, must still be inside the replay window
        self.check_gap()?;
        self.fruitless += 1;

        let since = self.delivered.timestamp;
        let http = self.http.clone();
        let url = self.settings.url.clone();
        let stream = self
            .backoff
            .retry("EventStreams connect", || open(http.clone(), url.clone(), since))
            .await?;

        info!(since = ?since, url = %self.settings.url, "Connected to EventStreams");
        self.events = Some(stream);
        Ok(())
    }

    /// Decode one SSE message into a batch, if it is relevant and new
    fn accept(&mut self, message: &Event) -> Option<FeedBatch> {
        if message.data.trim().is_empty() {
            return None;
        }

        let change: StreamChange = match serde_json::from_str(&message.data) {
            Ok(change) => change,
            Err(e) => {
                warn!(error = %e, "Skipping undecodable stream event");
                return None;
            }
        };
        if !change.is_relevant(&self.settings.wiki) {
            return None;
        }

        let event = change.into_event(&self.settings.wiki_domain)?;
        if !self.delivered.admits(&event) {
            debug!(id = %event.id(), "Replayed stream event, skipping");
            return None;
        }

        self.delivered.observe(&event);
        let cursor = self.cursor.clone().with_watermark(self.delivered.clone());
        Some(FeedBatch::new(vec![event], cursor))
    }
}

async fn open(
    http: reqwest::Client,
    url: String,
    since: Option<chrono::DateTime<chrono::Utc>>,
) -> Result<SseStream> {
    let mut request = http.get(&url).header(ACCEPT, "text/event-stream");
    if let Some(since) = since {
        request = request.query(&[("since", api_timestamp(since))]);
    }

    let response = request
        .send()
        .await
        .map_err(|e| Error::transient(format!("Stream connect failed: {}", e)))?;

    let status = response.status();
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return Err(Error::transient(format!("HTTP error: {}", status)));
    }
    if !status.is_success() {
        return Err(Error::malformed(format!("HTTP error: {}", status)));
    }

    Ok(response.bytes_stream().eventsource().boxed())
}

#[async_trait]
impl FeedSource for PushStream {
    fn mode(&self) -> FeedMode {
        FeedMode::Stream
    }

    async fn produce_batch(&mut self) -> Result<Option<FeedBatch>> {
        loop {
            if self.events.is_none() {
                self.connect().await?;
            }
            let Some(events) = self.events.as_mut() else {
                continue;
            };

            match timeout(self.settings.idle_timeout, events.next()).await {
                Err(_) => {
                    warn!(idle = ?self.settings.idle_timeout, "Stream idle, reconnecting");
                    self.events = None;
                }
                Ok(None) => {
                    warn!("Stream closed by server, reconnecting");
                    self.events = None;
                }
                Ok(Some(Err(e))) => {
                    warn!(error = %e, "Stream read failed, reconnecting");
                    self.events = None;
                }
                Ok(Some(Ok(message))) => {
                    if let Some(batch) = self.accept(&message) {
                        self.fruitless = 0;
                        return Ok(Some(batch));
                    }
                }
            }
        }
    }

    fn current_cursor(&self) -> ResumptionCursor {
        self.cursor.clone()
    }

    fn advance_cursor(&mut self, batch: &FeedBatch) {
        self.cursor = batch.cursor.clone();
        if batch.cursor.watermark() != &self.delivered {
            // Held back: replay from the durable position
            info!(since = ?batch.cursor.watermark().timestamp, "Stream cursor held back, reconnecting");
            self.delivered = batch.cursor.watermark().clone();
            self.events = None;
        }
    }
}

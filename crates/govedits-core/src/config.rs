//! Configuration types for the edit watcher
//!
//! This module defines all configuration structures used throughout the crate.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::ranges::Tier;
use crate::traits::FeedMode;

/// Main watcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Feed-consumption mode for this run
    #[serde(default)]
    pub mode: FeedMode,

    /// Range filter tier
    #[serde(default)]
    pub tier: Tier,

    /// CSV file with the address ranges
    pub ranges_path: PathBuf,

    /// Directory holding cursor documents, dead letters and the run lock
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Upstream feed settings
    #[serde(default)]
    pub feed: FeedConfig,

    /// Engine settings
    #[serde(default)]
    pub engine: EngineConfig,

    /// Collaborator settings
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

impl WatchConfig {
    /// Create a configuration with defaults for the given range table
    pub fn new(ranges_path: impl Into<PathBuf>) -> Self {
        Self {
            mode: FeedMode::default(),
            tier: Tier::default(),
            ranges_path: ranges_path.into(),
            state_dir: default_state_dir(),
            feed: FeedConfig::default(),
            engine: EngineConfig::default(),
            dispatch: DispatchConfig::default(),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.ranges_path.as_os_str().is_empty() {
            return Err(crate::Error::config("Range table path cannot be empty"));
        }
        if self.state_dir.as_os_str().is_empty() {
            return Err(crate::Error::config("State directory cannot be empty"));
        }

        self.feed.validate()?;
        self.engine.validate()?;
        self.dispatch.validate()?;

        Ok(())
    }
}

/// Upstream feed configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// MediaWiki action API endpoint (poll and backfill)
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// EventStreams recent-change endpoint (push)
    #[serde(default = "default_stream_url")]
    pub stream_url: String,

    /// Wiki database name to keep from the push feed (e.g. "enwiki")
    #[serde(default = "default_wiki")]
    pub wiki: String,

    /// Domain of that wiki, used for diff links
    #[serde(default = "default_wiki_domain")]
    pub wiki_domain: String,

    /// User-Agent sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Per-request timeout (in seconds)
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Sleep between poll cycles (in seconds)
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Maximum records per page
    #[serde(default = "default_page_limit")]
    pub page_limit: u32,

    /// Days of history a backfill covers
    #[serde(default = "default_backfill_days")]
    pub backfill_days: u32,

    /// Minimum delay between backfill requests (in milliseconds)
    ///
    /// Enforced regardless of how fast upstream answers.
    #[serde(default = "default_min_request_delay_ms")]
    pub min_request_delay_ms: u64,

    /// Reconnect the push stream when no bytes arrive for this long (in seconds)
    #[serde(default = "default_stream_idle_timeout_secs")]
    pub stream_idle_timeout_secs: u64,
}

impl FeedConfig {
    /// Validate the feed configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        for (name, url) in [("api_url", &self.api_url), ("stream_url", &self.stream_url)] {
            if !url.starts_with("https://") && !url.starts_with("http://") {
                return Err(crate::Error::config(format!(
                    "Feed {} must use HTTP or HTTPS scheme. Got: {}",
                    name, url
                )));
            }
        }
        if self.wiki.is_empty() || self.wiki_domain.is_empty() {
            return Err(crate::Error::config("Feed wiki and wiki_domain cannot be empty"));
        }
        if self.page_limit == 0 || self.page_limit > 500 {
            return Err(crate::Error::config(format!(
                "Feed page_limit must be between 1 and 500. Got: {}",
                self.page_limit
            )));
        }
        if self.poll_interval_secs == 0 {
            return Err(crate::Error::config("Feed poll_interval_secs must be > 0"));
        }
        if self.backfill_days == 0 {
            return Err(crate::Error::config("Feed backfill_days must be > 0"));
        }
        Ok(())
    }

    /// Per-request timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Poll sleep interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Minimum inter-request delay for backfill
    pub fn min_request_delay(&self) -> Duration {
        Duration::from_millis(self.min_request_delay_ms)
    }

    /// Push stream idle timeout
    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_idle_timeout_secs)
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            stream_url: default_stream_url(),
            wiki: default_wiki(),
            wiki_domain: default_wiki_domain(),
            user_agent: default_user_agent(),
            request_timeout_secs: default_request_timeout_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            page_limit: default_page_limit(),
            backfill_days: default_backfill_days(),
            min_request_delay_ms: default_min_request_delay_ms(),
            stream_idle_timeout_secs: default_stream_idle_timeout_secs(),
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of retry attempts for a failed fetch
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Base delay between retry attempts (in milliseconds), doubled per attempt
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Upper bound on a single backoff wait (in milliseconds)
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Push stream falls back to backfill when its cursor is older than this (in days)
    #[serde(default = "default_gap_threshold_days")]
    pub gap_threshold_days: u32,

    /// Maximum number of remembered dispatch ids
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,

    /// How long a dispatch id is remembered (in hours)
    #[serde(default = "default_dedup_retention_hours")]
    pub dedup_retention_hours: u64,

    /// Capacity of the engine event channel
    ///
    /// When full, new engine events are dropped (with a warning log).
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

impl EngineConfig {
    /// Validate the engine configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.max_retries > 10 {
            return Err(crate::Error::config(format!(
                "Engine max_retries must be at most 10. Got: {}",
                self.max_retries
            )));
        }
        if self.max_backoff_ms < self.retry_delay_ms {
            return Err(crate::Error::config(
                "Engine max_backoff_ms must be >= retry_delay_ms",
            ));
        }
        if self.gap_threshold_days == 0 {
            return Err(crate::Error::config("Engine gap_threshold_days must be > 0"));
        }
        if self.dedup_capacity == 0 {
            return Err(crate::Error::config("Engine dedup_capacity must be > 0"));
        }
        if self.event_channel_capacity == 0 {
            return Err(crate::Error::config(
                "Engine event_channel_capacity must be > 0",
            ));
        }
        Ok(())
    }

    /// Gap threshold as a duration
    pub fn gap_threshold(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.gap_threshold_days))
    }

    /// Dedup retention as a duration
    pub fn dedup_retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.dedup_retention_hours as i64)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            gap_threshold_days: default_gap_threshold_days(),
            dedup_capacity: default_dedup_capacity(),
            dedup_retention_hours: default_dedup_retention_hours(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

/// Collaborator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Timeout for one diff capture (in seconds)
    #[serde(default = "default_capture_timeout_secs")]
    pub capture_timeout_secs: u64,

    /// Timeout for one publish call (in seconds)
    #[serde(default = "default_publish_timeout_secs")]
    pub publish_timeout_secs: u64,

    /// How long to wait on one record append before holding the cursor back (in seconds)
    #[serde(default = "default_record_timeout_secs")]
    pub record_timeout_secs: u64,

    /// Number of recent record rows used to seed the dedup set at startup
    #[serde(default = "default_seed_rows")]
    pub seed_rows: usize,
}

impl DispatchConfig {
    /// Validate the dispatch configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.capture_timeout_secs == 0
            || self.publish_timeout_secs == 0
            || self.record_timeout_secs == 0
        {
            return Err(crate::Error::config("Dispatch timeouts must be > 0"));
        }
        Ok(())
    }

    /// Capture timeout
    pub fn capture_timeout(&self) -> Duration {
        Duration::from_secs(self.capture_timeout_secs)
    }

    /// Publish timeout
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs)
    }

    /// Record timeout
    pub fn record_timeout(&self) -> Duration {
        Duration::from_secs(self.record_timeout_secs)
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            capture_timeout_secs: default_capture_timeout_secs(),
            publish_timeout_secs: default_publish_timeout_secs(),
            record_timeout_secs: default_record_timeout_secs(),
            seed_rows: default_seed_rows(),
        }
    }
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("state")
}

fn default_api_url() -> String {
    "https://en.wikipedia.org/w/api.php".to_string()
}

fn default_stream_url() -> String {
    "https://stream.wikimedia.org/v2/stream/recentchange".to_string()
}

fn default_wiki() -> String {
    "enwiki".to_string()
}

fn default_wiki_domain() -> String {
    "en.wikipedia.org".to_string()
}

fn default_user_agent() -> String {
    concat!(
        "govedits/",
        env!("CARGO_PKG_VERSION"),
        " (government edit monitor; transparency project)"
    )
    .to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_poll_interval_secs() -> u64 {
    10
}

fn default_page_limit() -> u32 {
    500
}

fn default_backfill_days() -> u32 {
    30
}

fn default_min_request_delay_ms() -> u64 {
    1200
}

fn default_stream_idle_timeout_secs() -> u64 {
    90
}

fn default_max_retries() -> usize {
    3
}

fn default_retry_delay_ms() -> u64 {
    5000
}

fn default_max_backoff_ms() -> u64 {
    60_000
}

fn default_gap_threshold_days() -> u32 {
    31
}

fn default_dedup_capacity() -> usize {
    50_000
}

fn default_dedup_retention_hours() -> u64 {
    24 * 7
}

fn default_event_channel_capacity() -> usize {
    1000
}

fn default_capture_timeout_secs() -> u64 {
    60
}

fn default_publish_timeout_secs() -> u64 {
    30
}

fn default_record_timeout_secs() -> u64 {
    10
}

fn default_seed_rows() -> usize {
    1000
}

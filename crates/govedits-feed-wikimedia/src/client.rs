//! MediaWiki recent-changes API client
//!
//! One page per request, with the shared [`Backoff`] deciding what gets
//! retried. Poll and backfill sources both go through here.

use chrono::{DateTime, SecondsFormat, Utc};
use govedits_core::backoff::Backoff;
use govedits_core::config::{EngineConfig, FeedConfig};
use govedits_core::{Error, Result};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::records::RawChange;

/// Properties requested for every change
const RC_PROPS: &str = "title|ids|sizes|flags|user|timestamp|comment";

/// Change types worth looking at
const RC_TYPES: &str = "edit|new";

/// Query for one page of recent changes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RcQuery {
    /// Oldest timestamp (inclusive)
    pub start: DateTime<Utc>,
    /// Newest timestamp (inclusive)
    pub end: DateTime<Utc>,
    /// `rccontinue` token from the previous page
    pub continuation: Option<String>,
}

/// One decoded page
#[derive(Debug, Clone, Default)]
pub struct RcPage {
    /// Changes in the order the API returned them
    pub changes: Vec<RawChange>,
    /// Token for the next page, `None` on the last one
    pub continuation: Option<String>,
}

/// What the API answered
#[derive(Debug, Clone)]
pub enum RcReply {
    /// A page of changes
    Page(RcPage),
    /// The continuation token was rejected; restart without it
    BadContinue,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    query: Option<QueryBody>,
    #[serde(default, rename = "continue")]
    continuation: Option<ContinueBody>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct QueryBody {
    recentchanges: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ContinueBody {
    rccontinue: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: String,
    #[serde(default)]
    info: String,
}

/// Recent-changes API client
#[derive(Debug, Clone)]
pub struct RecentChangesClient {
    http: reqwest::Client,
    api_url: String,
    page_limit: u32,
    backoff: Backoff,
}

impl RecentChangesClient {
    /// Create a client from feed and engine settings
    pub fn new(feed: &FeedConfig, engine: &EngineConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(feed.user_agent.clone())
            .timeout(feed.request_timeout())
            .build()
            .map_err(|e| Error::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            api_url: feed.api_url.clone(),
            page_limit: feed.page_limit,
            backoff: Backoff::from_config(engine),
        })
    }

    /// Replace the retry policy
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Fetch one page, retrying per the backoff policy
    ///
    /// # Errors
    ///
    /// - `Error::TransientFetch`: retries exhausted
    /// - `Error::MalformedResponse`: the page was unusable twice in a row
    pub async fn fetch_page(&self, query: &RcQuery) -> Result<RcReply> {
        self.backoff
            .retry("recentchanges", || self.fetch_once(query))
            .await
    }

    async fn fetch_once(&self, query: &RcQuery) -> Result<RcReply> {
        let mut params = vec![
            ("action", "query".to_string()),
            ("list", "recentchanges".to_string()),
            ("format", "json".to_string()),
            ("formatversion", "2".to_string()),
            ("rcprop", RC_PROPS.to_string()),
            ("rcshow", "!bot".to_string()),
            ("rclimit", self.page_limit.to_string()),
            ("rcdir", "newer".to_string()),
            ("rctype", RC_TYPES.to_string()),
            ("rcstart", api_timestamp(query.start)),
            ("rcend", api_timestamp(query.end)),
        ];
        if let Some(token) = &query.continuation {
            params.push(("rccontinue", token.clone()));
        }

        debug!(start = %query.start, end = %query.end, continuation = ?query.continuation, "Fetching recent changes");

        let response = self
            .http
            .get(&self.api_url)
            .query(&params)
            .send()
            .await
            .map_err(|e| Error::transient(format!("Request failed: {}", e)))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(Error::transient(format!("HTTP error: {}", status)));
        }
        if !status.is_success() {
            return Err(Error::malformed(format!("HTTP error: {}", status)));
        }

        let body = response
            .text()
            .await
            .map_err(|e| Error::transient(format!("Failed to read response: {}", e)))?;

        parse_page(&body)
    }
}

/// Decode an API response body
pub(crate) fn parse_page(body: &str) -> Result<RcReply> {
    let response: ApiResponse = serde_json::from_str(body)
        .map_err(|e| Error::malformed(format!("Invalid JSON from recentchanges: {}", e)))?;

    if let Some(error) = response.error {
        return match error.code.as_str() {
            "maxlag" | "ratelimited" => Err(Error::transient(format!(
                "API {}: {}",
                error.code, error.info
            ))),
            "badcontinue" => Ok(RcReply::BadContinue),
            _ => Err(Error::malformed(format!("API {}: {}", error.code, error.info))),
        };
    }

    let Some(query) = response.query else {
        return Err(Error::malformed("Response has no query.recentchanges"));
    };

    let mut changes = Vec::with_capacity(query.recentchanges.len());
    for value in query.recentchanges {
        match serde_json::from_value::<RawChange>(value) {
            Ok(change) => changes.push(change),
            Err(e) => warn!(error = %e, "Skipping undecodable change"),
        }
    }

    Ok(RcReply::Page(RcPage {
        changes,
        continuation: response.continuation.and_then(|c| c.rccontinue),
    }))
}

/// Timestamp in the form the API and EventStreams accept
pub(crate) fn api_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

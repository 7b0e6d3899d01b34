//! Bluesky publisher over the AT Protocol XRPC endpoints
//!
//! One session per publisher, created lazily and dropped when the server
//! rejects its token. Posts are serialized and spaced at least
//! `min_interval` apart.
//!
//! ## API Calls
//!
//! ```http
//! POST /xrpc/com.atproto.server.createSession   {identifier, password}
//! POST /xrpc/com.atproto.repo.uploadBlob        <image bytes>
//! POST /xrpc/com.atproto.repo.createRecord      {repo, collection, record}
//! ```

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};
use std::path::Path;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use govedits_core::traits::{Post, Publisher};
use govedits_core::{Error, Result};

const NAME: &str = "bluesky";

/// Default PDS
pub const DEFAULT_SERVICE_URL: &str = "https://bsky.social";

/// Largest image the service accepts
pub const MAX_IMAGE_BYTES: u64 = 1_000_000;

/// Default spacing between posts
pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_secs(15);

/// Connection settings
#[derive(Clone)]
pub struct BlueskySettings {
    /// PDS base URL
    pub service_url: String,
    /// Handle or email
    pub identifier: String,
    /// App password
    pub password: String,
    /// Minimum time between two posts
    pub min_interval: Duration,
    /// Per-request timeout
    pub request_timeout: Duration,
}

impl BlueskySettings {
    /// Settings for the default service
    pub fn new(identifier: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            service_url: DEFAULT_SERVICE_URL.to_string(),
            identifier: identifier.into(),
            password: password.into(),
            min_interval: DEFAULT_MIN_INTERVAL,
            request_timeout: Duration::from_secs(30),
        }
    }
}

// Never print the password
impl std::fmt::Debug for BlueskySettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlueskySettings")
            .field("service_url", &self.service_url)
            .field("identifier", &self.identifier)
            .field("password", &"<REDACTED>")
            .field("min_interval", &self.min_interval)
            .finish()
    }
}

#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Session {
    access_jwt: String,
    did: String,
}

#[derive(Default)]
struct PostingState {
    session: Option<Session>,
    last_post: Option<Instant>,
}

/// Publishes match announcements to Bluesky
pub struct BlueskyPublisher {
    http: reqwest::Client,
    settings: BlueskySettings,
    // held for the whole publish so posts never overlap
    state: Mutex<PostingState>,
}

impl std::fmt::Debug for BlueskyPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlueskyPublisher")
            .field("settings", &self.settings)
            .finish()
    }
}

impl BlueskyPublisher {
    /// Build a publisher; fails fast on missing credentials
    pub fn new(settings: BlueskySettings, user_agent: &str) -> Result<Self> {
        if settings.identifier.trim().is_empty() || settings.password.is_empty() {
            return Err(Error::config("Bluesky identifier and password are required"));
        }
        if !settings.service_url.starts_with("https://") && !settings.service_url.starts_with("http://") {
            return Err(Error::config(format!(
                "Bluesky service URL must use HTTP or HTTPS scheme. Got: {}",
                settings.service_url
            )));
        }

        let http = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(settings.request_timeout)
            .build()
            .map_err(|e| Error::config(format!("Failed to build Bluesky HTTP client: {}", e)))?;

        Ok(Self {
            http,
            settings,
            state: Mutex::new(PostingState::default()),
        })
    }

    fn endpoint(&self, method: &str) -> String {
        format!("{}/xrpc/{}", self.settings.service_url.trim_end_matches('/'), method)
    }

    async fn create_session(&self) -> Result<Session> {
        debug!(identifier = %self.settings.identifier, "Creating Bluesky session");
        let response = self
            .http
            .post(self.endpoint("com.atproto.server.createSession"))
            .json(&json!({
                "identifier": self.settings.identifier,
                "password": self.settings.password,
            }))
            .send()
            .await
            .map_err(|e| Error::dispatch(NAME, format!("HTTP request failed: {}", e)))?;

        let body = check_status(response, "createSession").await?;
        serde_json::from_value(body)
            .map_err(|e| Error::dispatch(NAME, format!("Invalid session response: {}", e)))
    }

    async fn upload_image(&self, session: &Session, path: &Path) -> Result<Value> {
        let size = tokio::fs::metadata(path)
            .await
            .map_err(|e| Error::dispatch(NAME, format!("Image not readable: {}", e)))?
            .len();
        if size > MAX_IMAGE_BYTES {
            return Err(Error::dispatch(
                NAME,
                format!("Image too large: {} bytes. Maximum is {} bytes", size, MAX_IMAGE_BYTES),
            ));
        }

        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| Error::dispatch(NAME, format!("Image not readable: {}", e)))?;
        let response = self
            .http
            .post(self.endpoint("com.atproto.repo.uploadBlob"))
            .bearer_auth(&session.access_jwt)
            .header(reqwest::header::CONTENT_TYPE, "image/png")
            .body(bytes)
            .send()
            .await
            .map_err(|e| Error::dispatch(NAME, format!("HTTP request failed: {}", e)))?;

        let body = check_status(response, "uploadBlob").await?;
        body.get("blob")
            .cloned()
            .ok_or_else(|| Error::dispatch(NAME, "Invalid response format: blob missing"))
    }

    async fn create_record(&self, session: &Session, record: Value) -> Result<String> {
        let response = self
            .http
            .post(self.endpoint("com.atproto.repo.createRecord"))
            .bearer_auth(&session.access_jwt)
            .json(&json!({
                "repo": session.did,
                "collection": "app.bsky.feed.post",
                "record": record,
            }))
            .send()
            .await
            .map_err(|e| Error::dispatch(NAME, format!("HTTP request failed: {}", e)))?;

        let body = check_status(response, "createRecord").await?;
        body["uri"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::dispatch(NAME, "Invalid response format: uri missing"))
    }

    /// Image embed for `post`, or `None` to post text-only
    async fn embed(&self, session: &Session, post: &Post) -> Option<Value> {
        let path = post.image.as_ref()?;
        match self.upload_image(session, path).await {
            Ok(blob) => Some(json!({
                "$type": "app.bsky.embed.images",
                "images": [{ "alt": post.image_alt, "image": blob }],
            })),
            Err(e) => {
                warn!(error = %e, image = %path.display(), "Image upload failed, posting text-only");
                None
            }
        }
    }

    async fn wait_for_slot(&self, last_post: Option<Instant>) {
        if let Some(last) = last_post {
            let ready_at = last + self.settings.min_interval;
            if ready_at > Instant::now() {
                debug!("Waiting for the next Bluesky posting slot");
                tokio::time::sleep_until(ready_at).await;
            }
        }
    }
}

/// Post record with a link facet for `post.link`
pub fn post_record(post: &Post, embed: Option<Value>) -> Value {
    let mut record = json!({
        "$type": "app.bsky.feed.post",
        "text": post.text,
        "createdAt": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    });
    if let Some((start, end)) = post.link_span() {
        record["facets"] = json!([{
            "index": { "byteStart": start, "byteEnd": end },
            "features": [{ "$type": "app.bsky.richtext.facet#link", "uri": post.link }],
        }]);
    }
    if let Some(embed) = embed {
        record["embed"] = embed;
    }
    record
}

/// Map a non-success status to a dispatch error, else parse the body
async fn check_status(response: reqwest::Response, call: &str) -> Result<Value> {
    let status = response.status();
    if status.is_success() {
        return response
            .json()
            .await
            .map_err(|e| Error::dispatch(NAME, format!("Failed to parse {} response: {}", call, e)));
    }

    let error_text = response
        .text()
        .await
        .unwrap_or_else(|_| "Unable to read error response".to_string());
    let message = match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            format!("{}: authentication failed. Status: {}", call, status)
        }
        StatusCode::TOO_MANY_REQUESTS => {
            format!("{}: rate limit exceeded. Status: {}", call, status)
        }
        s if s.is_server_error() => format!("{}: server error: {} - {}", call, status, error_text),
        _ => format!("{} failed: {} - {}", call, status, error_text),
    };
    Err(Error::dispatch(NAME, message))
}

fn is_auth_failure(error: &Error) -> bool {
    matches!(error, Error::Dispatch { message, .. }
        if message.contains("authentication failed") || message.contains("ExpiredToken"))
}

#[async_trait]
impl Publisher for BlueskyPublisher {
    fn name(&self) -> &str {
        NAME
    }

    async fn publish(&self, post: &Post) -> Result<String> {
        let mut state = self.state.lock().await;

        let session = match &state.session {
            Some(session) => session.clone(),
            None => {
                let session = self.create_session().await?;
                state.session = Some(session.clone());
                session
            }
        };

        self.wait_for_slot(state.last_post).await;

        let embed = self.embed(&session, post).await;
        let record = post_record(post, embed);
        match self.create_record(&session, record).await {
            Ok(uri) => {
                state.last_post = Some(Instant::now());
                info!(%uri, "Posted to Bluesky");
                Ok(uri)
            }
            Err(e) => {
                if is_auth_failure(&e) {
                    state.session = None;
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn post(image: Option<PathBuf>) -> Post {
        Post {
            text: "Zürich Wikipedia article edited anonymously from Example Gov.\n\nhttps://x/diff".to_string(),
            link: "https://x/diff".to_string(),
            image,
            image_alt: "Screenshot of edit for Zürich".to_string(),
        }
    }

    #[test]
    fn record_carries_byte_offset_facet() {
        let post = post(None);
        let record = post_record(&post, None);
        let start = record["facets"][0]["index"]["byteStart"].as_u64().unwrap() as usize;
        let end = record["facets"][0]["index"]["byteEnd"].as_u64().unwrap() as usize;
        assert_eq!(&post.text.as_bytes()[start..end], b"https://x/diff");
        assert_eq!(record["facets"][0]["features"][0]["uri"], "https://x/diff");
        assert!(record.get("embed").is_none());
        assert!(record["createdAt"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn debug_hides_the_password() {
        let settings = BlueskySettings::new("watcher.bsky.social", "hunter2-app-pass");
        let publisher = BlueskyPublisher::new(settings, "test").unwrap();
        let printed = format!("{:?}", publisher);
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("<REDACTED>"));
    }

    #[test]
    fn missing_credentials_fail_fast() {
        let settings = BlueskySettings::new("", "pass");
        assert!(matches!(
            BlueskyPublisher::new(settings, "test"),
            Err(Error::Config(_))
        ));
    }
}

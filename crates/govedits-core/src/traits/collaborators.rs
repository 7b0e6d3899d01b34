// # Collaborator Traits
//
// The orchestrator hands every new match to four collaborators:
//
// - `SensitiveClassifier`: flags personal data in the edit summary
// - `DiffCapture`: renders the diff to an image
// - `Publisher`: posts the match to a social feed
// - `RecordSink`: appends the match to the durable record
//
// Only the record append gates the cursor. Capture and publish are best
// effort and their failures are logged by the caller.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::event::{EventId, MatchResult};

/// Kind of personal data found in text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    /// Something shaped like a phone number
    PhoneNumber,
    /// Something shaped like a postal address
    Address,
}

impl FindingKind {
    /// Label used in records
    pub fn label(self) -> &'static str {
        match self {
            Self::PhoneNumber => "phone_number",
            Self::Address => "address",
        }
    }
}

/// One piece of flagged text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    /// What it looks like
    pub kind: FindingKind,
    /// The matched text
    pub text: String,
}

/// Classifier verdict for one edit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensitivityReport {
    /// Everything flagged, in scan order
    pub findings: Vec<Finding>,
}

impl SensitivityReport {
    /// Whether anything was flagged
    pub fn is_sensitive(&self) -> bool {
        !self.findings.is_empty()
    }
}

/// Scans edit text for personal data
pub trait SensitiveClassifier: Send + Sync {
    /// Classify `text`, ignoring matches equal to one of `excluded`
    ///
    /// Revision ids are digit runs that look like phone numbers, so callers
    /// pass the edit's own ids as `excluded`.
    fn classify(&self, text: &str, excluded: &[String]) -> SensitivityReport;
}

/// Renders a diff page to an image file
#[async_trait]
pub trait DiffCapture: Send + Sync {
    /// Collaborator name for logs
    fn name(&self) -> &str;

    /// Capture the diff of `result` and return the image path
    async fn capture(&self, result: &MatchResult) -> Result<PathBuf, crate::Error>;
}

/// Social post built from a match
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Post {
    /// Full post text, the link included
    pub text: String,
    /// Link that should be clickable inside `text`
    pub link: String,
    /// Optional image to attach
    pub image: Option<PathBuf>,
    /// Alt text for the image
    pub image_alt: String,
}

impl Post {
    /// Standard announcement for a match
    pub fn for_match(result: &MatchResult, image: Option<PathBuf>) -> Self {
        let event = &result.event;
        let link = event.diff_url();
        let when = event.timestamp.format("%b %d, %Y at %-I:%M %p UTC");
        let text = format!(
            "{} Wikipedia article edited anonymously from {} on {}.\n\n{}",
            event.title, result.range.organization, when, link
        );
        Self {
            text,
            link,
            image,
            image_alt: format!("Screenshot of edit for {}", event.title),
        }
    }

    /// Byte range of `link` inside `text`
    pub fn link_span(&self) -> Option<(usize, usize)> {
        self.text
            .rfind(&self.link)
            .map(|start| (start, start + self.link.len()))
    }
}

/// Publishes posts to a social feed
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Collaborator name for logs
    fn name(&self) -> &str;

    /// Publish `post` and return the platform's id for it
    async fn publish(&self, post: &Post) -> Result<String, crate::Error>;
}

/// One durable row describing a dispatched match
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchRecord {
    /// Dedup key of the edit
    pub id: EventId,
    /// Page title
    pub title: String,
    /// Editor address
    pub address: String,
    /// Organization owning the range
    pub organization: String,
    /// Edit time
    pub timestamp: DateTime<Utc>,
    /// Recent-changes id
    pub change_id: Option<u64>,
    /// Page length before
    pub old_len: Option<u64>,
    /// Page length after
    pub new_len: Option<u64>,
    /// Revision id
    pub revision_id: Option<u64>,
    /// Parent revision id
    pub parent_revision_id: Option<u64>,
    /// Diff link
    pub diff_url: String,
    /// Edit summary
    pub comment: String,
    /// Captured image, if any
    pub screenshot: Option<PathBuf>,
    /// Classifier verdict
    pub sensitivity: SensitivityReport,
}

impl MatchRecord {
    /// Record for a dispatched match
    pub fn new(
        result: &MatchResult,
        screenshot: Option<PathBuf>,
        sensitivity: SensitivityReport,
    ) -> Self {
        let event = &result.event;
        Self {
            id: event.id(),
            title: event.title.clone(),
            address: event.editor_address.clone().unwrap_or_default(),
            organization: result.range.organization.clone(),
            timestamp: event.timestamp,
            change_id: event.change_id,
            old_len: event.old_len,
            new_len: event.new_len,
            revision_id: event.revision_id,
            parent_revision_id: event.parent_revision_id,
            diff_url: event.diff_url(),
            comment: event.comment.clone(),
            screenshot,
            sensitivity,
        }
    }
}

/// Durable record of dispatched matches
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Collaborator name for logs
    fn name(&self) -> &str;

    /// Append one record; success means it is on disk
    async fn append(&self, record: &MatchRecord) -> Result<(), crate::Error>;

    /// Ids of up to `limit` most recent records, oldest first
    async fn recent_ids(&self, limit: usize) -> Result<Vec<EventId>, crate::Error>;
}

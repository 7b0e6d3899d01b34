//! Edit events and feed positions
//!
//! [`EditEvent`] is the feed-independent shape every source decodes into.
//! [`Watermark`] marks how far a feed has been durably consumed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::ranges::AddressRange;

/// One edit observed on the feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditEvent {
    /// Page title
    pub title: String,
    /// Edit time (second resolution)
    pub timestamp: DateTime<Utc>,
    /// Editor address; `None` for named accounts
    pub editor_address: Option<String>,
    /// Edit summary
    #[serde(default)]
    pub comment: String,
    /// Revision created by the edit
    pub revision_id: Option<u64>,
    /// Revision the edit was based on
    pub parent_revision_id: Option<u64>,
    /// Recent-changes id
    pub change_id: Option<u64>,
    /// Domain of the wiki the edit belongs to
    pub wiki_domain: String,
    /// Page length before the edit
    pub old_len: Option<u64>,
    /// Page length after the edit
    pub new_len: Option<u64>,
}

impl EditEvent {
    /// Whether the edit was made without an account
    pub fn is_anonymous(&self) -> bool {
        self.editor_address.is_some()
    }

    /// Stable identity used for deduplication
    pub fn id(&self) -> EventId {
        match self.revision_id {
            Some(rev) => EventId(format!("rev:{}", rev)),
            None => EventId(format!("edit:{}@{}", self.title, self.timestamp.timestamp())),
        }
    }

    /// Link to the diff of this edit
    pub fn diff_url(&self) -> String {
        match (self.revision_id, self.parent_revision_id) {
            (Some(rev), Some(parent)) if parent > 0 => format!(
                "https://{}/w/index.php?diff={}&oldid={}",
                self.wiki_domain, rev, parent
            ),
            (Some(rev), _) => format!("https://{}/w/index.php?oldid={}", self.wiki_domain, rev),
            (None, _) => format!(
                "https://{}/wiki/{}",
                self.wiki_domain,
                self.title.replace(' ', "_")
            ),
        }
    }
}

/// Deduplication key of an edit
///
/// `rev:<id>` when the revision is known, otherwise
/// `edit:<title>@<unix seconds>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub String);

impl EventId {
    /// Id for a known revision
    pub fn revision(rev: u64) -> Self {
        Self(format!("rev:{}", rev))
    }

    /// Borrow the textual form
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EventId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// An edit attributed to a range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchResult {
    /// Matched edit
    pub event: EditEvent,
    /// Range containing the editor address
    pub range: AddressRange,
}

/// Durable feed position
///
/// Feed timestamps have one-second resolution, so the ids already seen at
/// `timestamp` are kept alongside it. An edit is after the watermark when it
/// is later, or equally timed and not in `boundary`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    /// Time of the newest consumed edit
    pub timestamp: Option<DateTime<Utc>>,
    /// Ids consumed exactly at `timestamp`
    #[serde(default)]
    pub boundary: BTreeSet<EventId>,
}

impl Watermark {
    /// Watermark positioned at `timestamp` with nothing consumed at it
    pub fn at(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp: Some(timestamp),
            boundary: BTreeSet::new(),
        }
    }

    /// Whether `event` lies strictly after this position
    pub fn admits(&self, event: &EditEvent) -> bool {
        match self.timestamp {
            None => true,
            Some(ts) if event.timestamp > ts => true,
            Some(ts) if event.timestamp == ts => !self.boundary.contains(&event.id()),
            Some(_) => false,
        }
    }

    /// Move past `event`; never moves backwards
    pub fn observe(&mut self, event: &EditEvent) {
        match self.timestamp {
            Some(ts) if event.timestamp < ts => {}
            Some(ts) if event.timestamp == ts => {
                self.boundary.insert(event.id());
            }
            _ => {
                self.timestamp = Some(event.timestamp);
                self.boundary.clear();
                self.boundary.insert(event.id());
            }
        }
    }

    /// Move to at least `timestamp` without consuming anything there
    pub fn advance_to(&mut self, timestamp: DateTime<Utc>) {
        if self.timestamp.is_none_or(|ts| timestamp > ts) {
            self.timestamp = Some(timestamp);
            self.boundary.clear();
        }
    }

    /// The later of two watermarks
    pub fn max(self, other: Self) -> Self {
        match (self.timestamp, other.timestamp) {
            (Some(a), Some(b)) if a == b => Self {
                timestamp: Some(a),
                boundary: self.boundary.union(&other.boundary).cloned().collect(),
            },
            (Some(a), Some(b)) if a > b => self,
            (Some(_), None) => self,
            _ => other,
        }
    }
}

//! Wire shapes of the two feeds and their conversion to [`EditEvent`]

use chrono::{DateTime, Utc};
use govedits_core::EditEvent;
use govedits_core::ranges::normalize;
use serde::Deserialize;

/// One entry of `list=recentchanges` (formatversion 2)
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RawChange {
    /// Page title
    pub title: String,
    /// Change time
    pub timestamp: DateTime<Utc>,
    /// New revision
    #[serde(default)]
    pub revid: Option<u64>,
    /// Previous revision, 0 for page creations
    #[serde(default)]
    pub old_revid: Option<u64>,
    /// Recent-changes id
    #[serde(default)]
    pub rcid: Option<u64>,
    /// Account name or address; absent when suppressed
    #[serde(default)]
    pub user: Option<String>,
    /// Logged-out edit
    #[serde(default)]
    pub anon: bool,
    /// Edit summary
    #[serde(default)]
    pub comment: String,
    /// Size before
    #[serde(default)]
    pub oldlen: Option<u64>,
    /// Size after
    #[serde(default)]
    pub newlen: Option<u64>,
}

impl RawChange {
    /// Convert to the feed-neutral event
    pub fn into_event(self, wiki_domain: &str) -> EditEvent {
        let editor_address = self.user.filter(|user| self.anon || is_address(user));
        EditEvent {
            title: self.title,
            timestamp: self.timestamp,
            editor_address,
            comment: self.comment,
            revision_id: self.revid.filter(|&rev| rev > 0),
            parent_revision_id: self.old_revid,
            change_id: self.rcid,
            wiki_domain: wiki_domain.to_string(),
            old_len: self.oldlen,
            new_len: self.newlen,
        }
    }
}

/// Revision pair of a stream event
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RevisionPair {
    #[serde(default)]
    pub old: Option<u64>,
    #[serde(default)]
    pub new: Option<u64>,
}

/// One `mediawiki.recentchange` event from EventStreams
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StreamChange {
    pub title: String,
    /// Unix seconds
    pub timestamp: i64,
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(rename = "type")]
    pub kind: String,
    pub wiki: String,
    #[serde(default)]
    pub server_name: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub bot: bool,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub revision: Option<RevisionPair>,
    #[serde(default)]
    pub length: Option<RevisionPair>,
}

impl StreamChange {
    /// Edit or page creation on `wiki`, not made by a bot
    pub fn is_relevant(&self, wiki: &str) -> bool {
        self.wiki == wiki && !self.bot && matches!(self.kind.as_str(), "edit" | "new")
    }

    /// Convert to the feed-neutral event; `None` for an impossible timestamp
    pub fn into_event(self, default_domain: &str) -> Option<EditEvent> {
        let timestamp = DateTime::from_timestamp(self.timestamp, 0)?;
        let revision = self.revision.unwrap_or_default();
        let length = self.length.unwrap_or_default();

        Some(EditEvent {
            title: self.title,
            timestamp,
            editor_address: self.user.filter(|user| is_address(user)),
            comment: self.comment,
            revision_id: revision.new,
            parent_revision_id: revision.old,
            change_id: self.id,
            wiki_domain: self
                .server_name
                .unwrap_or_else(|| default_domain.to_string()),
            old_len: length.old,
            new_len: length.new,
        })
    }
}

/// Account names can never parse as an address, so this identifies
/// logged-out editors on feeds without an `anon` flag
fn is_address(user: &str) -> bool {
    normalize(user).is_ok()
}

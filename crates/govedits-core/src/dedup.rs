//! Bounded memory of dispatched edits
//!
//! Cursor overlap on resume, reconnect replays and backfill/stream
//! hand-offs all re-deliver edits that were already reported. The set keeps
//! the ids of recent dispatches so a replay is dropped before it reaches any
//! collaborator. Entries leave by age (retention) or by insertion order once
//! capacity is reached.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

use crate::event::EventId;

/// Persisted form of one remembered dispatch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupEntry {
    /// Dispatched edit
    pub id: EventId,
    /// When it was dispatched
    pub dispatched_at: DateTime<Utc>,
}

/// Insertion-ordered, capacity and age bounded id set
#[derive(Debug, Clone)]
pub struct DedupSet {
    capacity: usize,
    retention: Duration,
    order: VecDeque<DedupEntry>,
    index: HashMap<EventId, DateTime<Utc>>,
}

impl DedupSet {
    /// Create an empty set
    pub fn new(capacity: usize, retention: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            retention,
            order: VecDeque::new(),
            index: HashMap::new(),
        }
    }

    /// Whether `id` was dispatched within the retention window
    pub fn contains(&self, id: &EventId) -> bool {
        self.index.contains_key(id)
    }

    /// Remember `id`; returns false when it was already present
    pub fn insert(&mut self, id: EventId, dispatched_at: DateTime<Utc>) -> bool {
        self.evict_expired(dispatched_at);
        if self.index.contains_key(&id) {
            return false;
        }

        self.index.insert(id.clone(), dispatched_at);
        self.order.push_back(DedupEntry { id, dispatched_at });

        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.index.remove(&old.id);
            }
        }
        true
    }

    /// Drop entries older than the retention window relative to `now`
    pub fn evict_expired(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.retention;
        let mut evicted = 0;
        while let Some(front) = self.order.front() {
            if front.dispatched_at >= cutoff {
                break;
            }
            if let Some(old) = self.order.pop_front() {
                self.index.remove(&old.id);
                evicted += 1;
            }
        }
        evicted
    }

    /// Number of remembered ids
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether nothing is remembered
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Entries in insertion order, for persistence
    pub fn snapshot(&self) -> Vec<DedupEntry> {
        self.order.iter().cloned().collect()
    }

    /// Merge persisted entries with the current ones, oldest first
    ///
    /// Age eviction walks from the front, so the merged order must follow
    /// `dispatched_at`. Ids already present keep their current entry.
    pub fn restore(&mut self, entries: impl IntoIterator<Item = DedupEntry>, now: DateTime<Utc>) {
        let mut merged: Vec<DedupEntry> = self.order.drain(..).collect();
        merged.extend(
            entries
                .into_iter()
                .filter(|entry| !self.index.contains_key(&entry.id)),
        );
        merged.sort_by_key(|entry| entry.dispatched_at);

        self.index.clear();
        for entry in merged {
            self.insert(entry.id, entry.dispatched_at);
        }
        self.evict_expired(now);
    }
}

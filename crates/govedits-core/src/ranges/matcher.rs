//! Address classification against the range table

use std::sync::Arc;
use tracing::debug;

use super::address::normalize;
use super::table::{AddressRange, RangeTable, Tier};
use crate::event::{EditEvent, MatchResult};

/// Pure classifier over a shared [`RangeTable`]
#[derive(Debug, Clone)]
pub struct Matcher {
    table: Arc<RangeTable>,
}

impl Matcher {
    /// Create a matcher over a loaded table
    pub fn new(table: Arc<RangeTable>) -> Self {
        Self { table }
    }

    /// Underlying table
    pub fn table(&self) -> &RangeTable {
        &self.table
    }

    /// Range containing `address` under `tier`, if any
    ///
    /// Unparsable addresses never match.
    pub fn classify(&self, address: &str, tier: Tier) -> Option<&AddressRange> {
        match normalize(address) {
            Ok(ordinal) => self.table.query(ordinal, tier),
            Err(e) => {
                debug!(address, error = %e, "Unclassifiable editor address");
                None
            }
        }
    }

    /// Match an edit event; named-account edits never match
    pub fn match_event(&self, event: &EditEvent, tier: Tier) -> Option<MatchResult> {
        let address = event.editor_address.as_deref()?;
        self.classify(address, tier).map(|range| MatchResult {
            event: event.clone(),
            range: range.clone(),
        })
    }
}

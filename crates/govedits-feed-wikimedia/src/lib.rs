// # Wikimedia Feed Sources
//
// FeedSource implementations for Wikimedia wikis.
//
// ## Sources
//
// - `PushStream`: EventStreams SSE (`/v2/stream/recentchange`), one batch per
//   relevant event, reconnects with `since=`
// - `PollSource`: action API `list=recentchanges` on a fixed interval
// - `BackfillSource`: the same API walked day by day over a bounded window
//
// All three go through `WikimediaSourceFactory`, which is what the daemon
// hands to the orchestrator.

pub mod backfill;
pub mod client;
pub mod factory;
pub mod poll;
pub mod records;
pub mod stream;

pub use backfill::BackfillSource;
pub use client::{RcPage, RcQuery, RcReply, RecentChangesClient};
pub use factory::WikimediaSourceFactory;
pub use poll::PollSource;
pub use records::{RawChange, StreamChange};
pub use stream::{PushStream, StreamSettings};

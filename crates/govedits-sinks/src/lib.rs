// # Dispatch Collaborators
//
// Implementations of the collaborator traits from `govedits-core`.
//
// ## Collaborators
//
// - `CsvRecordSink`: the durable record, a main CSV plus a sensitive-content CSV
// - `RegexClassifier`: phone number and street address scan of edit summaries
// - `CommandCapture`: diff screenshots through an external renderer
// - `BlueskyPublisher`: posts with a link facet and an optional image
//
// Only the record sink gates the cursor. The others fail per match and the
// orchestrator logs and moves on.

pub mod bluesky;
pub mod capture;
pub mod records;
pub mod sensitive;

pub use bluesky::{BlueskyPublisher, BlueskySettings};
pub use capture::CommandCapture;
pub use records::CsvRecordSink;
pub use sensitive::RegexClassifier;

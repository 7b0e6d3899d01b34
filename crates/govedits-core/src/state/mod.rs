// # State Implementations
//
// Durable pieces owned by a run: per-mode cursor stores, the exclusive run
// lock and the dead-letter log of skipped feed pages.

pub mod dead_letter;
pub mod file;
pub mod lock;
pub mod memory;

pub use dead_letter::{DEAD_LETTER_FILE_NAME, DeadLetterLog};
pub use file::FileCursorStore;
pub use lock::{LOCK_FILE_NAME, RunLock};
pub use memory::MemoryCursorStore;

// # Address Ranges
//
// Normalization of editor addresses, the loaded-once range database and the
// tier-aware matcher built on top of it.

pub mod address;
pub mod matcher;
pub mod table;

pub use address::{AddressFamily, Ordinal, normalize};
pub use matcher::Matcher;
pub use table::{AddressRange, RangeTable, Tier};

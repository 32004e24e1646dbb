//! UBX snapshot format and zero-copy loader.

pub mod format;
pub mod loader;

pub use format::{PatternAnchor, PatternOp, SectionId};
pub use loader::{
    decode_posting_list_into, decode_varint, LoadedSnapshot, SnapshotError,
};

//! Core patch synthesis for patchsmith: block extraction, edit parsing,
//! indentation-tolerant matching, syntax gating, diffs, and result folding.

pub mod aggregate;
pub mod blocks;
pub mod diff;
pub mod edits;
pub mod matcher;
pub mod protocol;
pub mod syntax;

pub use protocol::*;

//! Domain models for metapipe.
//!
//! Canonical definitions for the entities shared by every stage:
//! - `Record`: a `{locator, meta}` pairing
//! - `FileEntry`: a raw file plus optional filesystem/git facts
//! - `ShellResult`: outcome of one shell invocation
//! - `StageError`: one item's failure at one stage

pub mod error;
pub mod record;
pub mod stage;

// Re-export main types and errors
pub use error::{MetapipeError, Result};
pub use record::{
    split_components, FileEntry, FileInfo, GitInfo, Record, ShellResult, SENTINEL_EXIT_CODE,
};
pub use stage::{sort_errors, StageError, StageKind};

//! Structural diff and merge of metadata documents.
//!
//! - [`patch`]: RFC 6902 patch computation and application
//! - [`merge`]: merge strategies for desired vs existing metadata
//! - [`report`]: per-file diff entries and run summaries

pub mod merge;
pub mod patch;
pub mod report;

pub use merge::{merge, Desired, MergeStrategy};
pub use patch::{apply_patch, diff_values, escape_token, PatchError, PatchOp, PatchOpKind, PatchSummary};
pub use report::{DiffEntry, DiffFilter, DiffReport, DiffStatus, DiffSummary};

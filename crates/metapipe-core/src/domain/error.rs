//! Run-level error taxonomy for metapipe.
//!
//! These errors stop a run before (or instead of) producing output. Failures
//! that belong to a single item are data, see [`super::stage::StageError`].

use std::path::PathBuf;

use crate::diff::PatchError;
use crate::locator::LocatorError;

/// metapipe setup and validation errors.
#[derive(Debug, thiserror::Error)]
pub enum MetapipeError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("cannot read discovery root {path}: {reason}")]
    DiscoveryRoot { path: PathBuf, reason: String },

    #[error(
        "{count} items exceed output.max_buffered_items={cap}; switch to line-delimited output (format: jsonl)"
    )]
    BufferCapExceeded { count: usize, cap: usize },

    #[error("metadata file {path} already records locator {existing:?}, refusing to overwrite it for {locator:?}")]
    Collision {
        path: PathBuf,
        existing: String,
        locator: String,
    },

    #[error("metadata file {path} is unreadable ({reason}), refusing to overwrite it for {locator:?}")]
    UnreadableTarget {
        path: PathBuf,
        reason: String,
        locator: String,
    },

    #[error("locator rejected: {0}")]
    Locator(#[from] LocatorError),

    #[error("patch error: {0}")]
    Patch(#[from] PatchError),

    #[error("git error: {0}")]
    Git(String),

    #[error("worker failure: {0}")]
    Worker(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for metapipe setup operations.
pub type Result<T> = std::result::Result<T, MetapipeError>;

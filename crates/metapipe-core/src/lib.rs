//! metapipe core library
//!
//! Record model, discovery, the diff/merge engine and result envelopes. The
//! execution engine lives in `metapipe-exec`.

pub mod config;
pub mod diff;
pub mod discovery;
pub mod domain;
pub mod envelope;
pub mod git;
pub mod locator;
pub mod output;
pub mod record;
pub mod store;
pub mod telemetry;

pub use config::{
    DiffConfig, DiscoveryConfig, ErrorConfig, ErrorMode, Flow, LimitsConfig, Operation,
    OutputConfig, OutputFormat, RecordConfig, RunConfig, SandboxConfig, SandboxLibrary,
    ShellConfig, StageScripts, StoreConfig,
};
pub use diff::{
    apply_patch, diff_values, merge, Desired, DiffEntry, DiffFilter, DiffReport, DiffStatus,
    DiffSummary, MergeStrategy, PatchError, PatchOp, PatchOpKind, PatchSummary,
};
pub use discovery::{discover, file_info, DiscoveredFile, DiscoveryOptions, DiscoveryResult};
pub use domain::{
    sort_errors, FileEntry, FileInfo, GitInfo, MetapipeError, Record, Result, ShellResult,
    StageError, StageKind, SENTINEL_EXIT_CODE,
};
pub use envelope::{Counts, ItemAction, Outcome, OutputItem, ResultEnvelope, RunMeta};
pub use git::{is_git_repo, GitIndex};
pub use locator::{normalize_locator, LocatorError, LocatorPolicy};
pub use output::{write_envelope, LineSink};
pub use record::{load_record, parse_record, LoadError};
pub use store::{meta_file_name, MetaIndex, MetaStore, WriteOutcome};
pub use telemetry::init_tracing;

/// metapipe version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

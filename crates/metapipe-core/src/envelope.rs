//! Result envelope: records, the sorted error list and run metadata.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{Flow, Operation};
use crate::diff::DiffReport;
use crate::domain::record::{FileEntry, ShellResult};
use crate::domain::stage::{sort_errors, StageError};

pub const TOOL_NAME: &str = "metapipe";

/// What a write-capable file flow did with one file.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ItemAction {
    Created,
    Updated,
    Unchanged,
    /// The operation does not apply (create with existing metadata, update without).
    Skipped,
}

/// One entry of the `records` list.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OutputItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FileEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
    /// Result of the last value-producing stage (map or post-map).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<ShellResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<ItemAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta_path: Option<String>,
    /// Present only for failed items kept with `errors.embed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StageError>,
}

impl OutputItem {
    pub fn for_record(locator: impl Into<String>, meta: Value) -> Self {
        Self {
            locator: Some(locator.into()),
            meta: Some(meta),
            ..Self::default()
        }
    }

    pub fn for_file(file: FileEntry) -> Self {
        Self {
            file: Some(file),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Counts {
    pub discovered: usize,
    /// Items that reached the per-item stages.
    pub processed: usize,
    /// Items dropped by the filter stage.
    pub filtered: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// How a run ended, as recorded in the envelope.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    NoItems,
    PartialFailure,
    AllFailed,
    /// A diff found changes and `fail_on_change` is set.
    ChangesDetected,
    /// A diff could not read some of its inputs.
    InvalidInput,
}

impl Outcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            Outcome::Success | Outcome::NoItems => 0,
            Outcome::InvalidInput => 1,
            Outcome::PartialFailure | Outcome::AllFailed | Outcome::ChangesDetected => 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunMeta {
    pub tool: String,
    pub version: String,
    pub flow: Flow,
    pub operation: Operation,
    pub counts: Counts,
    pub outcome: Outcome,
}

impl RunMeta {
    pub fn new(flow: Flow, operation: Operation, counts: Counts, outcome: Outcome) -> Self {
        Self {
            tool: TOOL_NAME.to_string(),
            version: crate::VERSION.to_string(),
            flow,
            operation,
            counts,
            outcome,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResultEnvelope {
    pub records: Vec<OutputItem>,
    pub errors: Vec<StageError>,
    pub meta: RunMeta,
    /// Final accumulator; present only when a reduce stage is configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reduce: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<DiffReport>,
}

impl ResultEnvelope {
    /// Assemble an envelope; errors are put into canonical order.
    pub fn new(records: Vec<OutputItem>, mut errors: Vec<StageError>, meta: RunMeta) -> Self {
        sort_errors(&mut errors);
        Self {
            records,
            errors,
            meta,
            reduce: None,
            diff: None,
        }
    }

    pub fn with_reduce(mut self, reduce: Option<Value>) -> Self {
        self.reduce = reduce;
        self
    }

    pub fn with_diff(mut self, diff: Option<DiffReport>) -> Self {
        self.diff = diff;
        self
    }

    pub fn exit_code(&self) -> i32 {
        self.meta.outcome.exit_code()
    }
}

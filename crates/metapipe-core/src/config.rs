//! Run configuration.
//!
//! One immutable [`RunConfig`] value is built once per run, validated, and
//! then shared read-only (behind an `Arc`) by every component.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::diff::{DiffFilter, MergeStrategy};
use crate::domain::error::{MetapipeError, Result};
use crate::locator::LocatorPolicy;

/// What kind of item the run processes.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Flow {
    /// Side-car YAML records, ordered by locator.
    #[default]
    Records,
    /// Raw files, ordered by relative path.
    Files,
}

impl Flow {
    pub fn as_str(&self) -> &'static str {
        match self {
            Flow::Records => "records",
            Flow::Files => "files",
        }
    }
}

/// What the run does with each item.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Run the stages and emit the results.
    #[default]
    Pipeline,
    /// Write metadata for files that have none.
    Create,
    /// Rewrite existing metadata through the merge strategy.
    Update,
    /// Compare desired and existing metadata, write nothing.
    Diff,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Pipeline => "pipeline",
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Diff => "diff",
        }
    }
}

/// Error propagation policy.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorMode {
    #[default]
    KeepGoing,
    FailFast,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ErrorConfig {
    pub mode: ErrorMode,
    /// Keep failed items in the record list with an `error` field.
    pub embed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct DiscoveryConfig {
    pub root: PathBuf,
    /// Apply `.gitignore`/`.ignore` rules, also outside git repositories.
    pub respect_ignore: bool,
    pub follow_symlinks: bool,
    /// Extensions to keep; `None` uses the flow default.
    pub extensions: Option<Vec<String>>,
    /// Attach `FileEntry.info`.
    pub include_info: bool,
    /// Attach `FileEntry.git`.
    pub include_git: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            respect_ignore: true,
            follow_symlinks: false,
            extensions: None,
            include_info: false,
            include_git: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct RecordConfig {
    /// Drop unknown top-level keys instead of rejecting the record.
    pub allow_unknown_keys: bool,
}

pub const DEFAULT_MAX_RECORD_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct LimitsConfig {
    pub max_record_bytes: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_record_bytes: DEFAULT_MAX_RECORD_BYTES,
        }
    }
}

/// Lua scripts for each stage; a missing script skips the stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct StageScripts {
    pub filter: Option<String>,
    pub map: Option<String>,
    pub reduce: Option<String>,
    pub post_map: Option<String>,
}

impl StageScripts {
    pub fn is_empty(&self) -> bool {
        self.filter.is_none() && self.map.is_none() && self.reduce.is_none() && self.post_map.is_none()
    }
}

/// Standard libraries a sandbox may open.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SandboxLibrary {
    Table,
    String,
    Math,
    Utf8,
    Os,
    Io,
    Coroutine,
    Debug,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct SandboxConfig {
    pub timeout_ms: u64,
    pub instruction_limit: u64,
    pub memory_limit_bytes: usize,
    pub libraries: Vec<SandboxLibrary>,
    pub deterministic_random: bool,
    pub seed: i64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 1_000,
            instruction_limit: 10_000_000,
            memory_limit_bytes: 64 * 1024 * 1024,
            libraries: vec![
                SandboxLibrary::Table,
                SandboxLibrary::String,
                SandboxLibrary::Math,
                SandboxLibrary::Utf8,
            ],
            deterministic_random: true,
            seed: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ShellConfig {
    pub enabled: bool,
    /// Interpreter for the `command` form, invoked as `program -c command`.
    pub program: String,
    pub command: Option<String>,
    pub argv: Option<Vec<String>>,
    pub working_dir: Option<PathBuf>,
    /// Merged onto the inherited environment.
    pub env: BTreeMap<String, String>,
    pub timeout_ms: u64,
    pub grace_ms: u64,
    pub capture_stdout: bool,
    pub capture_stderr: bool,
    pub max_stdout_bytes: usize,
    pub max_stderr_bytes: usize,
    pub strict_templates: bool,
    /// Shell-quote placeholders in the `command` form.
    pub auto_escape: bool,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            program: "/bin/sh".to_string(),
            command: None,
            argv: None,
            working_dir: None,
            env: BTreeMap::new(),
            timeout_ms: 30_000,
            grace_ms: 2_000,
            capture_stdout: true,
            capture_stderr: true,
            max_stdout_bytes: 1024 * 1024,
            max_stderr_bytes: 1024 * 1024,
            strict_templates: true,
            auto_escape: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// Directory holding side-car metadata files for the file flows.
    pub meta_dir: PathBuf,
    /// Optional tag inserted into generated file names.
    pub root_tag: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            meta_dir: PathBuf::from(".metapipe/meta"),
            root_tag: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct DiffConfig {
    pub strategy: MergeStrategy,
    pub only: DiffFilter,
    pub fail_on_change: bool,
    /// Include `before`/`after` snapshots in diff entries.
    pub include_snapshots: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// One aggregate JSON document.
    #[default]
    Json,
    /// One JSON value per line.
    Jsonl,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct OutputConfig {
    pub format: OutputFormat,
    /// Destination file; stdout when unset.
    pub path: Option<PathBuf>,
    pub pretty: bool,
    pub max_buffered_items: Option<usize>,
    /// Keep shell `durationMs` in the output (breaks byte-identical reruns).
    pub include_timings: bool,
}

/// The complete, normalized configuration of one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    pub flow: Flow,
    pub operation: Operation,
    /// Worker count; available parallelism when unset.
    pub workers: Option<usize>,
    pub errors: ErrorConfig,
    pub discovery: DiscoveryConfig,
    pub locator_policy: LocatorPolicy,
    pub records: RecordConfig,
    pub limits: LimitsConfig,
    pub stages: StageScripts,
    pub sandbox: SandboxConfig,
    pub shell: ShellConfig,
    pub store: StoreConfig,
    pub diff: DiffConfig,
    pub output: OutputConfig,
}

impl RunConfig {
    /// Worker count actually used.
    pub fn effective_workers(&self) -> usize {
        self.workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    pub fn fail_fast(&self) -> bool {
        self.errors.mode == ErrorMode::FailFast
    }

    /// Extensions discovery keeps, lowercased, without dots.
    pub fn effective_extensions(&self) -> Option<Vec<String>> {
        let normalize = |exts: &Vec<String>| {
            exts.iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect::<Vec<_>>()
        };
        match (&self.discovery.extensions, self.flow) {
            (Some(exts), _) => Some(normalize(exts)),
            (None, Flow::Records) => Some(vec!["yaml".to_string(), "yml".to_string()]),
            (None, Flow::Files) => None,
        }
    }

    /// Structural checks that need no script engine or process.
    pub fn validate(&self) -> Result<()> {
        if self.workers == Some(0) {
            return Err(MetapipeError::InvalidConfig(
                "workers must be at least 1".to_string(),
            ));
        }
        if self.flow == Flow::Records && self.operation != Operation::Pipeline {
            return Err(MetapipeError::InvalidConfig(format!(
                "operation `{}` requires flow `files`",
                self.operation.as_str()
            )));
        }
        if self.limits.max_record_bytes == 0 {
            return Err(MetapipeError::InvalidConfig(
                "limits.max_record_bytes must be positive".to_string(),
            ));
        }
        if self.sandbox.timeout_ms == 0 || self.sandbox.instruction_limit == 0 {
            return Err(MetapipeError::InvalidConfig(
                "sandbox.timeout_ms and sandbox.instruction_limit must be positive".to_string(),
            ));
        }
        if self.shell.enabled {
            if self.operation != Operation::Pipeline {
                return Err(MetapipeError::InvalidConfig(
                    "the shell stage is only available for operation `pipeline`".to_string(),
                ));
            }
            match (&self.shell.command, &self.shell.argv) {
                (Some(_), Some(_)) => {
                    return Err(MetapipeError::InvalidConfig(
                        "shell.command and shell.argv are mutually exclusive".to_string(),
                    ))
                }
                (None, None) => {
                    return Err(MetapipeError::InvalidConfig(
                        "shell stage enabled without shell.command or shell.argv".to_string(),
                    ))
                }
                (None, Some(argv)) if argv.is_empty() => {
                    return Err(MetapipeError::InvalidConfig(
                        "shell.argv must name a program".to_string(),
                    ))
                }
                _ => {}
            }
        }
        if self.output.max_buffered_items == Some(0) {
            return Err(MetapipeError::InvalidConfig(
                "output.max_buffered_items must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Reject aggregate output that would buffer more items than allowed.
    pub fn check_buffer_cap(&self, item_count: usize) -> Result<()> {
        match (self.output.format, self.output.max_buffered_items) {
            (OutputFormat::Json, Some(cap)) if item_count > cap => {
                Err(MetapipeError::BufferCapExceeded {
                    count: item_count,
                    cap,
                })
            }
            _ => Ok(()),
        }
    }
}

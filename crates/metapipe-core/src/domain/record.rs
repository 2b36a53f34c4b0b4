//! Item models flowing through the pipeline.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A `{locator, meta}` pairing loaded from a side-car metadata file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Record {
    /// Canonical locator (relative POSIX path or normalized URL).
    pub locator: String,

    /// Opaque metadata object.
    pub meta: Value,
}

impl Record {
    pub fn new(locator: impl Into<String>, meta: Value) -> Self {
        Self {
            locator: locator.into(),
            meta,
        }
    }

    /// JSON form handed to scripts as `record`.
    pub fn to_value(&self) -> Value {
        serde_json::json!({ "locator": self.locator, "meta": self.meta })
    }
}

/// Filesystem facts about a discovered file, attached on request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub size: u64,
    pub mode: u32,
    /// RFC 3339, UTC, second precision.
    pub mod_time: String,
    pub is_dir: bool,
}

/// Git facts about a discovered file, attached on request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GitInfo {
    pub tracked: bool,
    pub ignored: bool,
    /// Porcelain status code (`"M "`, `"??"`, ...) or `"clean"`.
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_commit: Option<String>,
}

/// A raw file discovered by the file flows.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub path: String,
    pub rel_path: String,
    pub dir: String,
    pub base: String,
    pub name: String,
    pub ext: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<FileInfo>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitInfo>,
}

impl FileEntry {
    /// Build the path components for `rel_path` under a root displayed as `root`.
    pub fn from_rel_path(root: &str, rel_path: &str) -> Self {
        let root = root.trim_end_matches('/');
        let path = if root.is_empty() {
            rel_path.to_string()
        } else {
            format!("{root}/{rel_path}")
        };
        let (dir, base, name, ext) = split_components(rel_path);
        Self {
            path,
            rel_path: rel_path.to_string(),
            dir,
            base,
            name,
            ext,
            info: None,
            git: None,
        }
    }

    /// JSON form handed to scripts as `file`.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Split a POSIX relative path into `(dir, base, name, ext)`.
///
/// A leading dot does not start an extension (`.gitignore` has no extension).
pub fn split_components(rel_path: &str) -> (String, String, String, String) {
    let (dir, base) = match rel_path.rfind('/') {
        Some(idx) => (&rel_path[..idx], &rel_path[idx + 1..]),
        None => ("", rel_path),
    };
    let (name, ext) = match base.rfind('.') {
        Some(idx) if idx > 0 => (&base[..idx], &base[idx + 1..]),
        _ => (base, ""),
    };
    (
        dir.to_string(),
        base.to_string(),
        name.to_string(),
        ext.to_string(),
    )
}

/// Exit code reported for a timed-out or never-started child.
pub const SENTINEL_EXIT_CODE: i32 = -1;

/// Outcome of one shell invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ShellResult {
    /// Rendered command, for display.
    pub cmd: String,
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub timed_out: bool,
    /// Wall-clock duration; stripped from envelopes unless timings are requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ShellResult {
    /// A command that never produced an exit status (spawn or wait failure).
    pub fn not_run(cmd: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            exit_code: SENTINEL_EXIT_CODE,
            stdout: None,
            stderr: None,
            stdout_truncated: false,
            stderr_truncated: false,
            timed_out: false,
            duration_ms: None,
            error: Some(error.into()),
        }
    }

    /// Whether the child exited normally with status 0.
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.error.is_none() && self.exit_code == 0
    }

    /// Human-readable failure reason, `None` on success.
    pub fn failure_message(&self) -> Option<String> {
        if self.timed_out {
            Some("command timed out".to_string())
        } else if let Some(err) = &self.error {
            Some(err.clone())
        } else if self.exit_code != 0 {
            Some(format!("command exited with code {}", self.exit_code))
        } else {
            None
        }
    }
}

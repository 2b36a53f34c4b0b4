//! Git facts for discovered files.
//!
//! One [`GitIndex`] is captured per run from `git ls-files` and
//! `git status`, then queried per file.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::domain::error::{MetapipeError, Result};
use crate::domain::record::GitInfo;

fn run_git(dir: &Path, args: &[&str]) -> Result<Vec<u8>> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .map_err(|e| MetapipeError::Git(format!("failed to run git: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(MetapipeError::Git(format!(
            "git {} failed: {}",
            args.first().copied().unwrap_or_default(),
            stderr.trim()
        )));
    }
    Ok(output.stdout)
}

/// Check whether a directory is inside a git work tree.
pub fn is_git_repo(dir: &Path) -> bool {
    Command::new("git")
        .args(["rev-parse", "--is-inside-work-tree"])
        .current_dir(dir)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn split_nul(bytes: &[u8]) -> Vec<String> {
    bytes
        .split(|b| *b == 0)
        .filter(|s| !s.is_empty())
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect()
}

/// Tracked/status/ignored facts for every path under one root.
#[derive(Debug, Clone, Default)]
pub struct GitIndex {
    root: PathBuf,
    tracked: HashSet<String>,
    /// Porcelain `XY` code by root-relative path.
    status: HashMap<String, String>,
    ignored_files: HashSet<String>,
    /// Ignored directories, with a trailing `/`.
    ignored_dirs: Vec<String>,
}

impl GitIndex {
    /// Capture the index for `root`, which must lie inside a work tree.
    pub fn load(root: &Path) -> Result<Self> {
        let prefix = String::from_utf8_lossy(&run_git(root, &["rev-parse", "--show-prefix"])?)
            .trim()
            .to_string();

        let tracked = split_nul(&run_git(root, &["ls-files", "-z"])?)
            .into_iter()
            .collect();

        let porcelain = run_git(
            root,
            &[
                "status",
                "--porcelain",
                "-z",
                "--ignored",
                "--untracked-files=all",
                "--",
                ".",
            ],
        )?;

        let mut index = Self {
            root: root.to_path_buf(),
            tracked,
            ..Self::default()
        };

        let mut entries = split_nul(&porcelain).into_iter();
        while let Some(entry) = entries.next() {
            if entry.len() < 4 {
                continue;
            }
            let code = &entry[..2];
            // Porcelain paths are relative to the repository top level.
            let Some(path) = entry[3..].strip_prefix(prefix.as_str()) else {
                continue;
            };
            if code.contains('R') || code.contains('C') {
                // The original path follows as its own entry.
                entries.next();
            }
            if code == "!!" {
                if path.ends_with('/') {
                    index.ignored_dirs.push(path.to_string());
                } else {
                    index.ignored_files.insert(path.to_string());
                }
            } else {
                index.status.insert(path.to_string(), code.to_string());
            }
        }
        Ok(index)
    }

    fn is_ignored(&self, rel_path: &str) -> bool {
        self.ignored_files.contains(rel_path)
            || self.ignored_dirs.iter().any(|dir| rel_path.starts_with(dir.as_str()))
    }

    /// Facts for `rel_path`; `last_commit` is looked up for tracked files.
    pub fn info_for(&self, rel_path: &str) -> GitInfo {
        let tracked = self.tracked.contains(rel_path);
        let ignored = self.is_ignored(rel_path);
        let status = match self.status.get(rel_path) {
            Some(code) => code.clone(),
            None if ignored => "!!".to_string(),
            None if !tracked => "??".to_string(),
            None => "clean".to_string(),
        };
        let last_commit = if tracked {
            self.last_commit(rel_path)
        } else {
            None
        };
        GitInfo {
            tracked,
            ignored,
            status,
            last_commit,
        }
    }

    fn last_commit(&self, rel_path: &str) -> Option<String> {
        let out = run_git(&self.root, &["log", "-1", "--format=%H", "--", rel_path]).ok()?;
        let sha = String::from_utf8_lossy(&out).trim().to_string();
        (!sha.is_empty()).then_some(sha)
    }
}

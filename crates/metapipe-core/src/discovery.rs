//! Filesystem discovery.
//!
//! Walks the configured root with ignore rules applied, optionally following
//! symbolic links, and returns every matching file as a root-relative POSIX
//! path in canonical (sorted) order.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, SecondsFormat, Utc};
use ignore::WalkBuilder;
use tracing::{debug, warn};

use crate::config::{Flow, RunConfig};
use crate::domain::error::{MetapipeError, Result};
use crate::domain::record::{split_components, FileInfo};
use crate::domain::stage::{StageError, StageKind};
use crate::locator::relative_posix;

/// One discovered file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredFile {
    /// Root-relative POSIX path; the canonical ordering key.
    pub rel_path: String,
    /// Path as reached through the walk (root joined with `rel_path`).
    pub path: PathBuf,
}

#[derive(Debug, Default)]
pub struct DiscoveryResult {
    pub files: Vec<DiscoveredFile>,
    pub errors: Vec<StageError>,
}

/// Walker settings resolved from a [`RunConfig`].
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    pub root: PathBuf,
    pub respect_ignore: bool,
    pub follow_symlinks: bool,
    /// Lowercase extensions without dots; `None` keeps everything.
    pub extensions: Option<Vec<String>>,
    /// Canonical directories never descended into.
    pub excluded_dirs: Vec<PathBuf>,
}

impl DiscoveryOptions {
    pub fn from_config(config: &RunConfig) -> Self {
        let mut excluded_dirs = Vec::new();
        if config.flow == Flow::Files {
            if let Ok(meta_dir) = fs::canonicalize(&config.store.meta_dir) {
                excluded_dirs.push(meta_dir);
            }
        }
        Self {
            root: config.discovery.root.clone(),
            respect_ignore: config.discovery.respect_ignore,
            follow_symlinks: config.discovery.follow_symlinks,
            extensions: config.effective_extensions(),
            excluded_dirs,
        }
    }

    fn keeps(&self, rel_path: &str) -> bool {
        match &self.extensions {
            None => true,
            Some(exts) => {
                let (_, _, _, ext) = split_components(rel_path);
                let ext = ext.to_ascii_lowercase();
                exts.iter().any(|e| *e == ext)
            }
        }
    }
}

/// Walk `options.root`.
///
/// Fails only when the root itself cannot be read; everything below the root
/// that cannot be read becomes a `discovery` stage error.
pub fn discover(options: &DiscoveryOptions) -> Result<DiscoveryResult> {
    let root = &options.root;
    let canonical_root = fs::canonicalize(root).map_err(|e| MetapipeError::DiscoveryRoot {
        path: root.clone(),
        reason: e.to_string(),
    })?;
    if !canonical_root.is_dir() {
        return Err(MetapipeError::DiscoveryRoot {
            path: root.clone(),
            reason: "not a directory".to_string(),
        });
    }

    let visited: Arc<Mutex<HashSet<PathBuf>>> = Arc::new(Mutex::new(HashSet::new()));
    let excluded = options.excluded_dirs.clone();
    let follow = options.follow_symlinks;

    let mut builder = WalkBuilder::new(root);
    builder
        .follow_links(follow)
        .hidden(false)
        .ignore(options.respect_ignore)
        .git_ignore(options.respect_ignore)
        .git_global(options.respect_ignore)
        .git_exclude(options.respect_ignore)
        .parents(options.respect_ignore)
        .require_git(false)
        .sort_by_file_name(|a, b| a.cmp(b));

    let visited_dirs = Arc::clone(&visited);
    builder.filter_entry(move |entry| {
        if entry.file_name() == ".git" {
            return false;
        }
        let is_dir = entry.file_type().map_or(false, |t| t.is_dir());
        if !is_dir || entry.depth() == 0 {
            return true;
        }
        let Ok(canonical) = fs::canonicalize(entry.path()) else {
            return true;
        };
        if excluded.iter().any(|dir| *dir == canonical) {
            return false;
        }
        if follow {
            let mut seen = visited_dirs.lock().unwrap_or_else(|p| p.into_inner());
            return seen.insert(canonical);
        }
        true
    });

    if follow {
        visited
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(canonical_root.clone());
    }

    let mut result = DiscoveryResult::default();
    let mut found: Vec<(DiscoveredFile, Option<PathBuf>)> = Vec::new();

    for item in builder.build() {
        let entry = match item {
            Ok(entry) => entry,
            Err(err) => {
                record_walk_error(root, &err, &mut result.errors);
                continue;
            }
        };
        if !entry.file_type().map_or(false, |t| t.is_file()) {
            continue;
        }
        let Some(rel_path) = relative_posix(root, entry.path()) else {
            continue;
        };
        if !options.keeps(&rel_path) {
            continue;
        }
        let canonical = if follow {
            match fs::canonicalize(entry.path()) {
                Ok(c) => Some(c),
                Err(e) => {
                    result.errors.push(StageError::for_context(
                        StageKind::Discovery,
                        rel_path,
                        e.to_string(),
                    ));
                    continue;
                }
            }
        } else {
            None
        };
        found.push((
            DiscoveredFile {
                rel_path,
                path: entry.into_path(),
            },
            canonical,
        ));
    }

    found.sort_by(|a, b| a.0.rel_path.cmp(&b.0.rel_path));
    let mut seen_files: HashSet<PathBuf> = HashSet::new();
    for (file, canonical) in found {
        if let Some(canonical) = canonical {
            if !seen_files.insert(canonical) {
                debug!(rel_path = %file.rel_path, "skipping duplicate file reached through a link");
                continue;
            }
        }
        result.files.push(file);
    }

    debug!(
        root = %root.display(),
        files = result.files.len(),
        errors = result.errors.len(),
        "discovery complete"
    );
    Ok(result)
}

fn record_walk_error(root: &Path, err: &ignore::Error, errors: &mut Vec<StageError>) {
    match err {
        ignore::Error::WithPath { path, err } => {
            let context = relative_posix(root, path)
                .unwrap_or_else(|| path.to_string_lossy().replace('\\', "/"));
            errors.push(StageError::for_context(
                StageKind::Discovery,
                context,
                inner_message(err),
            ));
        }
        ignore::Error::WithDepth { err, .. } | ignore::Error::WithLineNumber { err, .. } => {
            record_walk_error(root, err, errors)
        }
        ignore::Error::Loop { child, .. } => {
            debug!(path = %child.display(), "skipping symlink loop");
        }
        ignore::Error::Partial(errs) => {
            for e in errs {
                record_walk_error(root, e, errors);
            }
        }
        other => warn!(error = %other, "ignoring walk error without a path"),
    }
}

fn inner_message(err: &ignore::Error) -> String {
    match err {
        ignore::Error::Io(io) => io.to_string(),
        ignore::Error::WithPath { err, .. }
        | ignore::Error::WithDepth { err, .. }
        | ignore::Error::WithLineNumber { err, .. } => inner_message(err),
        other => other.to_string(),
    }
}

/// Filesystem facts for `FileEntry.info`.
pub fn file_info(path: &Path) -> std::io::Result<FileInfo> {
    let meta = fs::metadata(path)?;
    let modified: DateTime<Utc> = meta.modified()?.into();
    Ok(FileInfo {
        size: meta.len(),
        mode: permission_bits(&meta),
        mod_time: modified.to_rfc3339_opts(SecondsFormat::Secs, true),
        is_dir: meta.is_dir(),
    })
}

#[cfg(unix)]
fn permission_bits(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn permission_bits(_meta: &fs::Metadata) -> u32 {
    0
}

//! Side-car metadata store for the file flows.
//!
//! Layout: `<meta_dir>/<hash12>[-<root_tag>]-<last-dir>-<filename>.yaml`, each
//! file holding a `{locator, meta}` document whose locator is the source
//! file's root-relative path.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde_json::Value;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::config::RunConfig;
use crate::domain::error::{MetapipeError, Result};
use crate::domain::record::Record;
use crate::domain::stage::{StageError, StageKind};
use crate::locator::LocatorPolicy;
use crate::record::{parse_record, read_limited};

fn sanitize(component: &str) -> String {
    component
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// File name of the metadata document for `rel_path` under `canonical_root`.
pub fn meta_file_name(canonical_root: &Path, rel_path: &str, root_tag: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_root.to_string_lossy().as_bytes());
    hasher.update([0u8]);
    hasher.update(rel_path.as_bytes());
    let hash = hex::encode(hasher.finalize());

    let mut components = rel_path.rsplit('/');
    let file_name = components.next().unwrap_or(rel_path);
    let last_dir = match components.next() {
        Some(dir) => dir.to_string(),
        None => canonical_root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "root".to_string()),
    };

    let mut name = hash[..12].to_string();
    if let Some(tag) = root_tag {
        name.push('-');
        name.push_str(&sanitize(tag));
    }
    name.push('-');
    name.push_str(&sanitize(&last_dir));
    name.push('-');
    name.push_str(&sanitize(file_name));
    name.push_str(".yaml");
    name
}

/// Serialized form of a metadata document.
pub fn render_document(locator: &str, meta: &Value) -> Result<String> {
    Ok(serde_yaml::to_string(&Record::new(locator, meta.clone()))?)
}

fn permissive_policy() -> LocatorPolicy {
    LocatorPolicy {
        allow_absolute: true,
        allow_parent_segments: true,
        allow_non_http_urls: true,
    }
}

/// Metadata already on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct ExistingMeta {
    pub path: PathBuf,
    pub meta: Value,
}

/// Existing metadata indexed by locator.
#[derive(Debug, Default)]
pub struct MetaIndex {
    entries: BTreeMap<String, ExistingMeta>,
    /// Metadata files that could not be read or parsed.
    pub errors: Vec<StageError>,
}

impl MetaIndex {
    /// Read every `*.yaml` document directly under `meta_dir`.
    ///
    /// A missing directory is an empty index.
    pub fn load(meta_dir: &Path, max_bytes: u64) -> Result<Self> {
        let mut index = Self::default();
        let read_dir = match fs::read_dir(meta_dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(index),
            Err(e) => return Err(e.into()),
        };

        let mut paths: Vec<PathBuf> = read_dir
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.extension().map_or(false, |ext| ext == "yaml"))
            .collect();
        paths.sort();

        let policy = permissive_policy();
        for path in paths {
            let context = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let parsed = read_limited(&path, max_bytes)
                .and_then(|bytes| parse_record(&bytes, true, &policy));
            match parsed {
                Ok(record) if index.entries.contains_key(&record.locator) => {
                    index.errors.push(StageError::for_context(
                        StageKind::Parse,
                        context,
                        format!("duplicate locator {:?}", record.locator),
                    ));
                }
                Ok(record) => {
                    index.entries.insert(
                        record.locator,
                        ExistingMeta {
                            path,
                            meta: record.meta,
                        },
                    );
                }
                Err(e) => index
                    .errors
                    .push(StageError::for_context(e.stage(), context, e.to_string())),
            }
        }
        debug!(
            meta_dir = %meta_dir.display(),
            entries = index.entries.len(),
            errors = index.errors.len(),
            "loaded metadata index"
        );
        Ok(index)
    }

    pub fn get(&self, locator: &str) -> Option<&ExistingMeta> {
        self.entries.get(locator)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries whose locator no longer exists under `root`, in locator order.
    pub fn orphans(&self, root: &Path) -> Vec<(&str, &ExistingMeta)> {
        self.entries
            .iter()
            .filter(|(locator, _)| !root.join(locator.as_str()).exists())
            .map(|(locator, existing)| (locator.as_str(), existing))
            .collect()
    }
}

/// Result of one store write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    pub path: PathBuf,
    /// False when the file already held identical content.
    pub written: bool,
}

/// Writes metadata documents atomically into the metadata directory.
#[derive(Debug, Clone)]
pub struct MetaStore {
    meta_dir: PathBuf,
    canonical_root: PathBuf,
    root_tag: Option<String>,
    max_bytes: u64,
}

impl MetaStore {
    pub fn new(config: &RunConfig) -> Result<Self> {
        let canonical_root = fs::canonicalize(&config.discovery.root).map_err(|e| {
            MetapipeError::DiscoveryRoot {
                path: config.discovery.root.clone(),
                reason: e.to_string(),
            }
        })?;
        Ok(Self {
            meta_dir: config.store.meta_dir.clone(),
            canonical_root,
            root_tag: config.store.root_tag.clone(),
            max_bytes: config.limits.max_record_bytes,
        })
    }

    pub fn meta_dir(&self) -> &Path {
        &self.meta_dir
    }

    pub fn canonical_root(&self) -> &Path {
        &self.canonical_root
    }

    pub fn path_for(&self, rel_path: &str) -> PathBuf {
        self.meta_dir.join(meta_file_name(
            &self.canonical_root,
            rel_path,
            self.root_tag.as_deref(),
        ))
    }

    /// Write `meta` for `rel_path`, skipping the write when nothing changed.
    ///
    /// A file at the target path that records another locator, or that cannot
    /// be parsed at all, is never overwritten.
    pub fn write(&self, rel_path: &str, meta: &Value) -> Result<WriteOutcome> {
        let path = self.path_for(rel_path);
        let rendered = render_document(rel_path, meta)?;

        if path.exists() {
            let current = fs::read(&path)?;
            if current == rendered.as_bytes() {
                return Ok(WriteOutcome {
                    path,
                    written: false,
                });
            }
            let existing = read_limited(&path, self.max_bytes)
                .and_then(|bytes| parse_record(&bytes, true, &permissive_policy()));
            match existing {
                Ok(record) if record.locator != rel_path => {
                    return Err(MetapipeError::Collision {
                        path,
                        existing: record.locator,
                        locator: rel_path.to_string(),
                    });
                }
                Ok(_) => {}
                Err(e) => {
                    return Err(MetapipeError::UnreadableTarget {
                        path,
                        reason: e.to_string(),
                        locator: rel_path.to_string(),
                    });
                }
            }
        }

        fs::create_dir_all(&self.meta_dir)?;
        // Atomic write: temp file in the same directory, then rename.
        let mut tmp = NamedTempFile::new_in(&self.meta_dir)?;
        tmp.write_all(rendered.as_bytes())?;
        tmp.persist(&path).map_err(|e| e.error)?;
        debug!(rel_path, path = %path.display(), "wrote metadata");

        Ok(WriteOutcome {
            path,
            written: true,
        })
    }
}
